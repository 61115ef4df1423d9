//! Command-line interface module.
//!
//! Operator tooling over [`BigQueryFdw`](crate::service::BigQueryFdw):
//! - Describe a foreign table's column mapping
//! - Print the remote query for a scan
//! - Run a scan and print the rows
//! - Generate foreign table definitions for a dataset

pub mod commands;
pub mod handlers;

pub use handlers::{build_service, handle_describe, handle_import_schema, handle_scan, handle_translate};
