//! Remote warehouse access.
//!
//! This module provides the seam between the wrapper core and BigQuery:
//! - `WarehouseClient`: metadata lookup, query jobs and paged results
//! - `RestWarehouseClient`: the BigQuery REST v2 implementation
//! - `MemoryWarehouse`: an in-process warehouse for tests and local runs
//! - `arrow_utils`: conversion of materialized rows into Arrow batches
//!
//! Every call is authorized with a [`Credential`] obtained from the
//! credential manager; clients never cache or log it.

pub mod arrow_utils;
pub mod bigquery;
pub mod memory;

pub use bigquery::RestWarehouseClient;
pub use memory::MemoryWarehouse;

use crate::auth::Credential;
use crate::config::SqlDialect;
use crate::error::Result;
use crate::schema::types::{ColumnMode, RemoteType};
use crate::schema::TableId;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// One raw result row: the `v` cells of a `{"f": [{"v": ...}]}` row, in
/// select-list order.
pub type RawRow = Vec<serde_json::Value>;

/// Field of a remote table schema (`TableFieldSchema`).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RemoteField {
    pub name: String,
    #[serde(rename = "type")]
    pub field_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mode: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub fields: Vec<RemoteField>,
}

impl RemoteField {
    pub fn new(name: impl Into<String>, field_type: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            field_type: field_type.into(),
            mode: None,
            fields: Vec::new(),
        }
    }

    pub fn repeated(mut self) -> Self {
        self.mode = Some("REPEATED".into());
        self
    }

    pub fn with_fields(mut self, fields: Vec<RemoteField>) -> Self {
        self.fields = fields;
        self
    }

    pub fn remote_type(&self) -> RemoteType {
        RemoteType::parse(&self.field_type)
    }

    pub fn column_mode(&self) -> ColumnMode {
        match self.mode.as_deref().map(str::to_ascii_uppercase).as_deref() {
            Some("REPEATED") => ColumnMode::Repeated,
            Some("REQUIRED") => ColumnMode::Required,
            _ => ColumnMode::Nullable,
        }
    }
}

/// Table metadata as returned by the metadata service.
#[derive(Debug, Clone)]
pub struct RemoteTable {
    pub id: TableId,
    pub fields: Vec<RemoteField>,
    pub num_rows: Option<u64>,
}

/// One row of `INFORMATION_SCHEMA.COLUMNS`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DatasetColumn {
    pub table_name: String,
    pub column_name: String,
    pub ordinal_position: u32,
    /// Standard SQL type, e.g. `INT64` or `ARRAY<STRING>`
    pub data_type: String,
}

/// Named query parameter value.
#[derive(Debug, Clone, PartialEq)]
pub enum ParameterValue {
    /// `None` is SQL NULL
    Scalar(Option<String>),
    Array(Vec<String>),
}

/// Named query parameter (`@name`).
#[derive(Debug, Clone, PartialEq)]
pub struct QueryParameter {
    pub name: String,
    /// Standard SQL type of the scalar or array element
    pub type_name: String,
    pub value: ParameterValue,
}

/// Query job submission.
#[derive(Debug, Clone)]
pub struct QueryJobRequest {
    pub sql: String,
    pub dialect: SqlDialect,
    pub parameters: Vec<QueryParameter>,
    /// Client-chosen job id, reused when the submission is retried
    pub job_id: String,
    /// Project billed for the job
    pub project: String,
    pub location: Option<String>,
}

impl QueryJobRequest {
    /// Handle of the job this request creates.
    pub fn job_handle(&self) -> JobHandle {
        JobHandle {
            project: self.project.clone(),
            job_id: self.job_id.clone(),
            location: self.location.clone(),
        }
    }
}

/// Reference to a submitted job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobHandle {
    pub project: String,
    pub job_id: String,
    pub location: Option<String>,
}

/// Job state as seen by a status poll.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobStatus {
    Pending,
    Running,
    Done,
    Failed { code: String, message: String },
}

impl JobStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Done | JobStatus::Failed { .. })
    }
}

/// One page of job results.
#[derive(Debug, Clone, Default)]
pub struct ResultPage {
    pub rows: Vec<RawRow>,
    /// `None` once the result set is exhausted
    pub next_page_token: Option<String>,
    /// Row count reported by the job
    pub total_rows: u64,
}

/// Remote warehouse operations used by the wrapper.
#[async_trait]
pub trait WarehouseClient: Send + Sync {
    /// Table metadata; a missing table is a `Schema` error.
    async fn get_table(&self, credential: &Credential, table: &TableId) -> Result<RemoteTable>;

    /// Every column of every table in a dataset.
    async fn list_dataset_columns(
        &self,
        credential: &Credential,
        project: &str,
        dataset: &str,
    ) -> Result<Vec<DatasetColumn>>;

    /// Start a query job.
    async fn submit_query(&self, credential: &Credential, request: &QueryJobRequest) -> Result<JobHandle>;

    async fn job_status(&self, credential: &Credential, job: &JobHandle) -> Result<JobStatus>;

    /// Fetch results of a finished job, starting at `page_token`.
    async fn fetch_page(
        &self,
        credential: &Credential,
        job: &JobHandle,
        page_token: Option<&str>,
        max_results: u32,
    ) -> Result<ResultPage>;

    /// Request cancellation of a job. Cancelling a finished job is not an
    /// error.
    async fn cancel_job(&self, credential: &Credential, job: &JobHandle) -> Result<()>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_field_schema_json() {
        let raw = r#"{"name": "tags", "type": "RECORD", "mode": "REPEATED",
                      "fields": [{"name": "k", "type": "STRING"}]}"#;
        let field: RemoteField = serde_json::from_str(raw).unwrap();
        assert_eq!(field.remote_type(), RemoteType::Record);
        assert_eq!(field.column_mode(), ColumnMode::Repeated);
        assert_eq!(field.fields[0].name, "k");
    }
}
