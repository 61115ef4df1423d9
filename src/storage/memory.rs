//! In-process warehouse.
//!
//! Holds table metadata and rows in memory and serves query jobs through a
//! registered handler. Job latency, transient submission failures, lost
//! submission responses, job failures and credential rejections can be
//! injected, and every remote call is counted, which makes it the backend
//! of choice for tests and offline runs of the CLI.

use super::{
    DatasetColumn, JobHandle, JobStatus, QueryJobRequest, RawRow, RemoteField, RemoteTable,
    ResultPage, WarehouseClient,
};
use crate::auth::Credential;
use crate::error::{FdwError, Result};
use crate::row::encode_cell;
use crate::schema::types::ColumnMode;
use crate::schema::TableId;
use crate::value::Value;
use async_trait::async_trait;
use chrono::Utc;
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use tracing::debug;

type QueryHandler = Arc<dyn Fn(&QueryJobRequest) -> Result<Vec<RawRow>> + Send + Sync>;

struct MemoryTable {
    fields: Vec<RemoteField>,
    rows: Arc<Vec<RawRow>>,
}

struct MemoryJob {
    rows: Arc<Vec<RawRow>>,
    polls_remaining: u32,
    failure: Option<(String, String)>,
    cancelled: bool,
}

/// Call counters.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MemoryStats {
    pub table_lookups: usize,
    pub submissions: usize,
    pub status_polls: usize,
    pub page_fetches: usize,
    pub cancellations: usize,
    /// Calls refused because of their credential
    pub auth_rejections: usize,
}

#[derive(Default)]
struct Counters {
    table_lookups: AtomicUsize,
    submissions: AtomicUsize,
    status_polls: AtomicUsize,
    page_fetches: AtomicUsize,
    cancellations: AtomicUsize,
    auth_rejections: AtomicUsize,
}

#[derive(Default)]
pub struct MemoryWarehouse {
    tables: RwLock<HashMap<TableId, MemoryTable>>,
    handler: RwLock<Option<QueryHandler>>,
    jobs: Mutex<HashMap<String, MemoryJob>>,
    submitted: Mutex<Vec<QueryJobRequest>>,
    next_job: AtomicU64,
    polls_until_done: AtomicU32,
    transient_failures: AtomicU32,
    lost_responses: AtomicU32,
    rejected_calls: AtomicU32,
    reject_expired: AtomicBool,
    job_failure: Mutex<Option<(String, String)>>,
    counters: Counters,
}

impl MemoryWarehouse {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a table. Rows are given in field order.
    pub fn add_table(&self, table: TableId, fields: Vec<RemoteField>, rows: Vec<Vec<Value>>) {
        let rows = rows
            .iter()
            .map(|row| row.iter().map(encode_cell).collect())
            .collect();
        self.add_raw_table(table, fields, rows);
    }

    /// Register a table whose rows are already in wire form.
    pub fn add_raw_table(&self, table: TableId, fields: Vec<RemoteField>, rows: Vec<RawRow>) {
        self.tables.write().insert(
            table,
            MemoryTable {
                fields,
                rows: Arc::new(rows),
            },
        );
    }

    /// Rows of a registered table in wire form.
    pub fn table_rows(&self, table: &TableId) -> Option<Arc<Vec<RawRow>>> {
        self.tables.read().get(table).map(|t| Arc::clone(&t.rows))
    }

    /// Answer submitted queries with `handler`.
    pub fn on_query<F>(&self, handler: F)
    where
        F: Fn(&QueryJobRequest) -> Result<Vec<RawRow>> + Send + Sync + 'static,
    {
        *self.handler.write() = Some(Arc::new(handler));
    }

    /// Status polls reporting `RUNNING` before each job completes.
    pub fn set_polls_until_done(&self, polls: u32) {
        self.polls_until_done.store(polls, Ordering::SeqCst);
    }

    /// Reject the next `count` submissions with a rate-limit error.
    pub fn fail_next_submissions(&self, count: u32) {
        self.transient_failures.store(count, Ordering::SeqCst);
    }

    /// Create the job for each of the next `count` submissions but answer
    /// with a backend error, as when the response is lost in transit.
    pub fn lose_next_submission_responses(&self, count: u32) {
        self.lost_responses.store(count, Ordering::SeqCst);
    }

    /// Refuse the credential of the next `count` calls.
    pub fn reject_next_credentials(&self, count: u32) {
        self.rejected_calls.store(count, Ordering::SeqCst);
    }

    /// Refuse every call made with an expired credential.
    pub fn reject_expired_credentials(&self) {
        self.reject_expired.store(true, Ordering::SeqCst);
    }

    /// Make every subsequent job finish with an error.
    pub fn fail_jobs(&self, code: &str, message: &str) {
        *self.job_failure.lock() = Some((code.to_string(), message.to_string()));
    }

    pub fn stats(&self) -> MemoryStats {
        MemoryStats {
            table_lookups: self.counters.table_lookups.load(Ordering::SeqCst),
            submissions: self.counters.submissions.load(Ordering::SeqCst),
            status_polls: self.counters.status_polls.load(Ordering::SeqCst),
            page_fetches: self.counters.page_fetches.load(Ordering::SeqCst),
            cancellations: self.counters.cancellations.load(Ordering::SeqCst),
            auth_rejections: self.counters.auth_rejections.load(Ordering::SeqCst),
        }
    }

    /// Every accepted submission, oldest first.
    pub fn submitted_queries(&self) -> Vec<QueryJobRequest> {
        self.submitted.lock().clone()
    }

    fn authorize(&self, credential: &Credential) -> Result<()> {
        let rejected = self
            .rejected_calls
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        let expired = self.reject_expired.load(Ordering::SeqCst) && credential.expires_at() <= Utc::now();
        if rejected || expired {
            self.counters.auth_rejections.fetch_add(1, Ordering::SeqCst);
            return Err(FdwError::remote("authError", "Request had invalid authentication credentials"));
        }
        Ok(())
    }

    fn job_not_found(job: &JobHandle) -> FdwError {
        FdwError::remote("notFound", format!("Not found: Job {}:{}", job.project, job.job_id))
    }
}

/// Standard SQL spelling of a field, as `INFORMATION_SCHEMA` reports it.
fn information_schema_type(field: &RemoteField) -> String {
    let base = if field.fields.is_empty() {
        field.remote_type().standard_name().to_string()
    } else {
        let inner: Vec<String> = field
            .fields
            .iter()
            .map(|f| format!("{} {}", f.name, information_schema_type(f)))
            .collect();
        format!("STRUCT<{}>", inner.join(", "))
    };
    match field.column_mode() {
        ColumnMode::Repeated => format!("ARRAY<{}>", base),
        _ => base,
    }
}

#[async_trait]
impl WarehouseClient for MemoryWarehouse {
    async fn get_table(&self, credential: &Credential, table: &TableId) -> Result<RemoteTable> {
        self.authorize(credential)?;
        self.counters.table_lookups.fetch_add(1, Ordering::SeqCst);
        let tables = self.tables.read();
        let found = tables
            .get(table)
            .ok_or_else(|| FdwError::schema(format!("Not found: Table {}", table)))?;
        Ok(RemoteTable {
            id: table.clone(),
            fields: found.fields.clone(),
            num_rows: Some(found.rows.len() as u64),
        })
    }

    async fn list_dataset_columns(
        &self,
        credential: &Credential,
        project: &str,
        dataset: &str,
    ) -> Result<Vec<DatasetColumn>> {
        self.authorize(credential)?;
        let tables = self.tables.read();
        let mut ids: Vec<&TableId> = tables
            .keys()
            .filter(|id| id.project == project && id.dataset == dataset)
            .collect();
        if ids.is_empty() {
            return Err(FdwError::schema(format!("Not found: Dataset {}:{}", project, dataset)));
        }
        ids.sort_by(|a, b| a.table.cmp(&b.table));

        let mut columns = Vec::new();
        for id in ids {
            for (position, field) in tables[id].fields.iter().enumerate() {
                columns.push(DatasetColumn {
                    table_name: id.table.clone(),
                    column_name: field.name.clone(),
                    ordinal_position: position as u32 + 1,
                    data_type: information_schema_type(field),
                });
            }
        }
        Ok(columns)
    }

    async fn submit_query(&self, credential: &Credential, request: &QueryJobRequest) -> Result<JobHandle> {
        self.authorize(credential)?;
        let remaining = self.transient_failures.load(Ordering::SeqCst);
        if remaining > 0 {
            self.transient_failures.store(remaining - 1, Ordering::SeqCst);
            return Err(FdwError::remote("rateLimitExceeded", "Exceeded rate limits"));
        }

        let job_id = if request.job_id.is_empty() {
            format!("job_{}", self.next_job.fetch_add(1, Ordering::SeqCst))
        } else {
            request.job_id.clone()
        };
        if self.jobs.lock().contains_key(&job_id) {
            return Err(FdwError::remote(
                "duplicate",
                format!("Already Exists: Job {}:{}", request.project, job_id),
            ));
        }

        self.counters.submissions.fetch_add(1, Ordering::SeqCst);
        self.submitted.lock().push(request.clone());

        let handler = self.handler.read().clone();
        let rows = match handler {
            Some(handler) => handler(request)?,
            None => {
                return Err(FdwError::remote(
                    "invalidQuery",
                    "no query handler registered with the memory warehouse",
                ))
            }
        };

        debug!(job_id = %job_id, rows = rows.len(), "Memory job created");
        self.jobs.lock().insert(
            job_id.clone(),
            MemoryJob {
                rows: Arc::new(rows),
                polls_remaining: self.polls_until_done.load(Ordering::SeqCst),
                failure: self.job_failure.lock().clone(),
                cancelled: false,
            },
        );

        if self
            .lost_responses
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
        {
            return Err(FdwError::remote("backendError", "Backend error, response lost"));
        }

        Ok(JobHandle {
            project: request.project.clone(),
            job_id,
            location: request.location.clone(),
        })
    }

    async fn job_status(&self, credential: &Credential, job: &JobHandle) -> Result<JobStatus> {
        self.authorize(credential)?;
        self.counters.status_polls.fetch_add(1, Ordering::SeqCst);
        let mut jobs = self.jobs.lock();
        let state = jobs.get_mut(&job.job_id).ok_or_else(|| Self::job_not_found(job))?;

        if state.cancelled {
            return Ok(JobStatus::Failed {
                code: "stopped".into(),
                message: "Job execution was cancelled".into(),
            });
        }
        if state.polls_remaining > 0 {
            state.polls_remaining -= 1;
            return Ok(JobStatus::Running);
        }
        Ok(match &state.failure {
            Some((code, message)) => JobStatus::Failed {
                code: code.clone(),
                message: message.clone(),
            },
            None => JobStatus::Done,
        })
    }

    async fn fetch_page(
        &self,
        credential: &Credential,
        job: &JobHandle,
        page_token: Option<&str>,
        max_results: u32,
    ) -> Result<ResultPage> {
        self.authorize(credential)?;
        self.counters.page_fetches.fetch_add(1, Ordering::SeqCst);
        let rows = {
            let jobs = self.jobs.lock();
            let state = jobs.get(&job.job_id).ok_or_else(|| Self::job_not_found(job))?;
            if state.polls_remaining > 0 || state.failure.is_some() || state.cancelled {
                return Err(FdwError::remote("notReady", format!("Job {} has no results", job.job_id)));
            }
            Arc::clone(&state.rows)
        };

        let offset = match page_token {
            Some(token) => token
                .parse::<usize>()
                .map_err(|_| FdwError::remote("invalid", format!("Invalid page token: {}", token)))?,
            None => 0,
        };
        let end = rows.len().min(offset + max_results.max(1) as usize);
        let page = rows.get(offset..end).map(<[RawRow]>::to_vec).unwrap_or_default();

        Ok(ResultPage {
            rows: page,
            next_page_token: (end < rows.len()).then(|| end.to_string()),
            total_rows: rows.len() as u64,
        })
    }

    async fn cancel_job(&self, credential: &Credential, job: &JobHandle) -> Result<()> {
        self.authorize(credential)?;
        self.counters.cancellations.fetch_add(1, Ordering::SeqCst);
        let mut jobs = self.jobs.lock();
        let state = jobs.get_mut(&job.job_id).ok_or_else(|| Self::job_not_found(job))?;
        state.cancelled = true;
        Ok(())
    }
}
