//! Remote query execution.
//!
//! A translated query runs as an asynchronous job: submission and status
//! polling are retried with bounded exponential backoff under a hard
//! deadline, and finished jobs are read page by page through a
//! [`ResultCursor`].

use super::TranslatedQuery;
use crate::auth::{Credential, CredentialProvider};
use crate::config::QueryConfig;
use crate::error::{FdwError, Result};
use crate::storage::{JobHandle, JobStatus, RawRow, WarehouseClient};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{sleep, timeout, timeout_at, Instant};
use tracing::{debug, info, instrument, warn};

/// Reason reported when a job id is already taken.
const DUPLICATE_JOB: &str = "duplicate";

/// Exponential backoff with a ceiling and an overall deadline.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackoffPolicy {
    pub initial: Duration,
    pub max: Duration,
    pub deadline: Duration,
}

impl BackoffPolicy {
    pub fn from_config(config: &QueryConfig) -> Self {
        Self {
            initial: Duration::from_millis(config.initial_backoff_ms),
            max: Duration::from_millis(config.max_backoff_ms),
            deadline: config.timeout(),
        }
    }

    /// Successive delays: `initial`, doubling up to `max`.
    pub fn delays(&self) -> impl Iterator<Item = Duration> {
        let max = self.max;
        std::iter::successors(Some(self.initial.min(max)), move |delay| Some((*delay * 2).min(max)))
    }
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self::from_config(&QueryConfig::default())
    }
}

/// Paged view over the results of one finished job.
#[derive(Debug)]
pub struct ResultCursor {
    job: JobHandle,
    page_token: Option<String>,
    exhausted: bool,
    released: bool,
    rows_fetched: u64,
    total_rows: Option<u64>,
}

impl ResultCursor {
    fn new(job: JobHandle) -> Self {
        Self {
            job,
            page_token: None,
            exhausted: false,
            released: false,
            rows_fetched: 0,
            total_rows: None,
        }
    }

    pub fn job(&self) -> &JobHandle {
        &self.job
    }

    /// No page token remains.
    pub fn is_exhausted(&self) -> bool {
        self.exhausted
    }

    pub fn is_released(&self) -> bool {
        self.released
    }

    pub fn rows_fetched(&self) -> u64 {
        self.rows_fetched
    }

    /// Row count reported by the job, known after the first page.
    pub fn total_rows(&self) -> Option<u64> {
        self.total_rows
    }
}

/// Runs translated queries against a warehouse.
#[derive(Clone)]
pub struct QueryExecutor {
    client: Arc<dyn WarehouseClient>,
    policy: BackoffPolicy,
    page_size: u32,
    release_timeout: Duration,
    location: Option<String>,
}

impl QueryExecutor {
    pub fn new(client: Arc<dyn WarehouseClient>, config: &QueryConfig) -> Self {
        Self {
            client,
            policy: BackoffPolicy::from_config(config),
            page_size: config.page_size.max(1),
            release_timeout: config.release_timeout(),
            location: None,
        }
    }

    pub fn with_location(mut self, location: Option<String>) -> Self {
        self.location = location;
        self
    }

    pub fn policy(&self) -> BackoffPolicy {
        self.policy
    }

    /// Submit `query` billed to `project` and wait for the job to finish.
    ///
    /// The job id is fixed before the first attempt, so a submission
    /// retried after a lost response finds the job it already created.
    #[instrument(skip_all, fields(project = %project))]
    pub async fn execute(
        &self,
        query: &TranslatedQuery,
        project: &str,
        credentials: &dyn CredentialProvider,
    ) -> Result<ResultCursor> {
        let deadline = Instant::now() + self.policy.deadline;
        let request = query.job_request(project, self.location.as_deref());
        let client = self.client.as_ref();

        let mut delays = self.policy.delays();
        let mut resubmitted = false;
        let job = loop {
            let attempt = timeout_at(
                deadline,
                authorized(credentials, |credential| {
                    let request = &request;
                    async move { client.submit_query(&credential, request).await }
                }),
            )
            .await;
            match attempt {
                Ok(Ok(job)) => break job,
                Ok(Err(FdwError::RemoteQuery { code, .. })) if resubmitted && code == DUPLICATE_JOB => {
                    debug!(job_id = %request.job_id, "Job was created by an earlier attempt");
                    break request.job_handle();
                }
                Ok(Err(e)) if e.is_transient() => {
                    let delay = delays.next().unwrap_or(self.policy.max);
                    if Instant::now() + delay > deadline {
                        return Err(FdwError::Timeout(format!(
                            "query submission kept failing for {}s: {}",
                            self.policy.deadline.as_secs(),
                            e
                        )));
                    }
                    warn!(error = %e, delay_ms = delay.as_millis() as u64, "Transient submission failure, retrying");
                    resubmitted = true;
                    sleep(delay).await;
                }
                Ok(Err(e)) => return Err(e),
                Err(_) => {
                    return Err(FdwError::Timeout(format!(
                        "query submission did not complete within {}s",
                        self.policy.deadline.as_secs()
                    )))
                }
            }
        };
        info!(job_id = %job.job_id, "Submitted query job");

        match self.wait_for(&job, credentials, deadline).await {
            Ok(()) => Ok(ResultCursor::new(job)),
            Err(e) => {
                if matches!(e, FdwError::Timeout(_)) {
                    self.release_job(&job, credentials).await;
                }
                Err(e)
            }
        }
    }

    async fn wait_for(&self, job: &JobHandle, credentials: &dyn CredentialProvider, deadline: Instant) -> Result<()> {
        let client = self.client.as_ref();
        let mut delays = self.policy.delays();
        loop {
            let status = timeout_at(
                deadline,
                authorized(credentials, |credential| async move { client.job_status(&credential, job).await }),
            )
            .await
            .map_err(|_| self.timed_out(job))?;
            match status {
                Ok(JobStatus::Done) => {
                    debug!(job_id = %job.job_id, "Job finished");
                    return Ok(());
                }
                Ok(JobStatus::Failed { code, message }) => {
                    warn!(job_id = %job.job_id, code = %code, "Query job failed");
                    return Err(FdwError::RemoteQuery { code, message });
                }
                Ok(JobStatus::Pending | JobStatus::Running) => {}
                Err(e) if e.is_transient() => {
                    warn!(job_id = %job.job_id, error = %e, "Transient status poll failure");
                }
                Err(e) => return Err(e),
            }

            let delay = delays.next().unwrap_or(self.policy.max);
            if Instant::now() + delay > deadline {
                return Err(self.timed_out(job));
            }
            sleep(delay).await;
        }
    }

    fn timed_out(&self, job: &JobHandle) -> FdwError {
        FdwError::Timeout(format!(
            "job {} did not finish within {}s",
            job.job_id,
            self.policy.deadline.as_secs()
        ))
    }

    /// Fetch the next page. An exhausted cursor yields an empty page.
    #[instrument(skip_all, fields(job_id = %cursor.job.job_id))]
    pub async fn fetch_page(
        &self,
        cursor: &mut ResultCursor,
        credentials: &dyn CredentialProvider,
    ) -> Result<Vec<RawRow>> {
        if cursor.exhausted || cursor.released {
            return Ok(Vec::new());
        }

        let client = self.client.as_ref();
        let page_size = self.page_size;
        let deadline = Instant::now() + self.policy.deadline;
        let mut delays = self.policy.delays();
        let page = loop {
            let job = &cursor.job;
            let page_token = cursor.page_token.as_deref();
            let attempt = timeout_at(
                deadline,
                authorized(credentials, |credential| async move {
                    client.fetch_page(&credential, job, page_token, page_size).await
                }),
            )
            .await
            .map_err(|_| FdwError::Timeout(format!("page fetch for job {} timed out", job.job_id)))?;
            match attempt {
                Ok(page) => break page,
                Err(e) if e.is_transient() => {
                    let delay = delays.next().unwrap_or(self.policy.max);
                    if Instant::now() + delay > deadline {
                        return Err(e);
                    }
                    warn!(error = %e, "Transient page fetch failure, retrying");
                    sleep(delay).await;
                }
                Err(e) => return Err(e),
            }
        };

        cursor.rows_fetched += page.rows.len() as u64;
        cursor.total_rows = Some(page.total_rows);
        cursor.exhausted = page.next_page_token.is_none();
        cursor.page_token = page.next_page_token;
        debug!(
            rows = page.rows.len(),
            fetched = cursor.rows_fetched,
            total = page.total_rows,
            exhausted = cursor.exhausted,
            "Fetched result page"
        );
        Ok(page.rows)
    }

    /// Release the cursor. Only the first call has an effect; an unfinished
    /// result set is released with a best-effort job cancel.
    pub async fn close(&self, cursor: &mut ResultCursor, credentials: &dyn CredentialProvider) {
        if cursor.released {
            return;
        }
        cursor.released = true;
        if !cursor.exhausted {
            self.release_job(&cursor.job, credentials).await;
        }
    }

    /// Best-effort cancel bounded by the release timeout. Failures are
    /// logged; remote jobs expire on their own.
    pub async fn release_job(&self, job: &JobHandle, credentials: &dyn CredentialProvider) {
        let client = self.client.as_ref();
        let cancel = authorized(credentials, |credential| async move { client.cancel_job(&credential, job).await });
        match timeout(self.release_timeout, cancel).await {
            Ok(Ok(())) => debug!(job_id = %job.job_id, "Released query job"),
            Ok(Err(e)) => warn!(job_id = %job.job_id, error = %e, "Failed to release query job"),
            Err(_) => warn!(
                job_id = %job.job_id,
                timeout_ms = self.release_timeout.as_millis() as u64,
                "Timed out releasing query job"
            ),
        }
    }
}

/// Run one warehouse call with a current credential. A rejected credential
/// is invalidated and the call retried once with a fresh one.
async fn authorized<T, F, Fut>(credentials: &dyn CredentialProvider, call: F) -> Result<T>
where
    F: Fn(Credential) -> Fut,
    Fut: Future<Output = Result<T>>,
{
    match call(credentials.credential().await?).await {
        Err(e) if e.is_auth_rejection() => {
            warn!(error = %e, "Credential rejected, retrying with a fresh one");
            credentials.invalidate();
            call(credentials.credential().await?).await
        }
        result => result,
    }
}
