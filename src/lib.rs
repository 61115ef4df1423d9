//! Query translation and result streaming core for a BigQuery foreign data
//! wrapper.
//!
//! A host database hands over a partial scan description (columns, filter
//! qualifiers, sort and limit hints) for a foreign table. The core turns it
//! into a BigQuery query, runs it as a remote job and streams rows back in
//! the host's row shape:
//!
//! - [`auth`]: service account credentials with single-flight refresh
//! - [`schema`]: remote schema discovery, type mapping and schema import
//! - [`query`]: predicate translation and job execution
//! - [`row`]: conversion of raw result cells into host values
//! - [`session`]: the per-scan state machine
//! - [`service`]: [`BigQueryFdw`], the host-facing entry point

pub mod auth;
pub mod cli;
pub mod config;
pub mod error;
pub mod query;
pub mod row;
pub mod schema;
pub mod service;
pub mod session;
pub mod storage;
pub mod value;

// Re-export commonly used types
pub use auth::{
    Credential, CredentialManager, CredentialProvider, KeyFileCredentials, ServiceAccountKey, TokenExchange,
};
pub use config::{FdwConfig, SqlDialect, TableOptions};
pub use error::{FdwError, Result};
pub use query::{Operand, Operator, Qualifier, ScanRequest, SortKey, TranslatedQuery};
pub use row::Row;
pub use schema::{ColumnDeclaration, ColumnMap, ForeignTableSpec, HostType, RemoteType, TableId};
pub use service::BigQueryFdw;
pub use session::{SessionState, TableSession};
pub use storage::{MemoryWarehouse, RestWarehouseClient, WarehouseClient};
pub use value::Value;
