//! BigQuery REST v2 client.
//!
//! Talks to `tables.get`, `jobs.insert`, `jobs.get`, `jobs.getQueryResults`
//! and `jobs.cancel`. Dataset column listings go through a synchronous
//! `jobs.query` over `INFORMATION_SCHEMA.COLUMNS`.

use super::{
    DatasetColumn, JobHandle, JobStatus, ParameterValue, QueryJobRequest, QueryParameter, RawRow,
    RemoteField, RemoteTable, ResultPage, WarehouseClient,
};
use crate::auth::Credential;
use crate::config::{BigQueryConfig, SqlDialect};
use crate::error::{FdwError, Result};
use crate::schema::TableId;
use async_trait::async_trait;
use reqwest::{Client, RequestBuilder, StatusCode};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::{json, Value as Json};
use tracing::{debug, instrument};

/// Wait per `jobs.query`/`getQueryResults` round trip while listing columns.
const SYNC_QUERY_TIMEOUT_MS: u64 = 10_000;

/// Upper bound on round trips for a column listing.
const SYNC_QUERY_MAX_ROUNDS: usize = 60;

pub struct RestWarehouseClient {
    http: Client,
    endpoint: String,
}

impl RestWarehouseClient {
    pub fn new(endpoint: impl Into<String>) -> Self {
        Self {
            http: Client::new(),
            endpoint: endpoint.into().trim_end_matches('/').to_string(),
        }
    }

    pub fn from_config(config: &BigQueryConfig) -> Self {
        Self::new(config.api_endpoint.clone())
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{}", self.endpoint, path)
    }

    fn job_url(&self, job: &JobHandle, suffix: &str) -> String {
        self.url(&format!("projects/{}/jobs/{}{}", job.project, job.job_id, suffix))
    }

    fn results_url(&self, job: &JobHandle) -> String {
        self.url(&format!("projects/{}/queries/{}", job.project, job.job_id))
    }

    async fn send<T: DeserializeOwned>(&self, request: RequestBuilder, credential: &Credential) -> Result<T> {
        let response = request.bearer_auth(credential.token()).send().await?;
        let status = response.status();
        let body = response.text().await?;
        if !status.is_success() {
            return Err(api_error(status, &body));
        }
        Ok(serde_json::from_str(&body)?)
    }

    /// Run a short standard SQL query to completion and return every row.
    async fn query_sync(&self, credential: &Credential, project: &str, sql: &str) -> Result<Vec<RawRow>> {
        let body = json!({
            "query": sql,
            "useLegacySql": false,
            "timeoutMs": SYNC_QUERY_TIMEOUT_MS,
            "formatOptions": { "useInt64Timestamp": true },
        });
        let mut response: QueryResponse = self
            .send(
                self.http.post(self.url(&format!("projects/{}/queries", project))).json(&body),
                credential,
            )
            .await?;

        let mut rows = Vec::new();
        for _ in 0..SYNC_QUERY_MAX_ROUNDS {
            if response.job_complete {
                rows.extend(response.rows.into_iter().map(TableRow::into_raw));
                if response.page_token.is_none() {
                    return Ok(rows);
                }
            }
            let job = response
                .job_reference
                .ok_or_else(|| FdwError::remote("invalidResponse", "query response without a job reference"))?
                .into_handle();
            let mut request = self.http.get(self.results_url(&job)).query(&[
                ("timeoutMs", SYNC_QUERY_TIMEOUT_MS.to_string()),
                ("formatOptions.useInt64Timestamp", "true".to_string()),
            ]);
            if let Some(location) = &job.location {
                request = request.query(&[("location", location)]);
            }
            if response.job_complete {
                if let Some(token) = &response.page_token {
                    request = request.query(&[("pageToken", token)]);
                }
            }
            response = self.send(request, credential).await?;
            response.job_reference.get_or_insert_with(|| job.clone().into());
        }
        Err(FdwError::Timeout(format!(
            "synchronous query did not finish after {} rounds",
            SYNC_QUERY_MAX_ROUNDS
        )))
    }
}

/// Map an error response to `RemoteQuery { code, message }`.
///
/// The code is the first error `reason` when present, otherwise the HTTP
/// status so that 429/5xx are classified as transient.
fn api_error(status: StatusCode, body: &str) -> FdwError {
    match serde_json::from_str::<ErrorEnvelope>(body) {
        Ok(envelope) => {
            let retryable_status = status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS;
            let reason = envelope
                .error
                .errors
                .first()
                .and_then(|e| e.reason.clone())
                .filter(|r| !retryable_status || is_transient_reason(r))
                .unwrap_or_else(|| status.as_u16().to_string());
            FdwError::remote(reason, envelope.error.message)
        }
        Err(_) => FdwError::remote(
            status.as_u16().to_string(),
            status.canonical_reason().unwrap_or("request failed"),
        ),
    }
}

fn is_transient_reason(reason: &str) -> bool {
    matches!(
        reason,
        "rateLimitExceeded" | "backendError" | "internalError" | "jobRateLimitExceeded"
    )
}

fn parameter_json(parameter: &QueryParameter) -> Json {
    match &parameter.value {
        ParameterValue::Scalar(value) => json!({
            "name": parameter.name,
            "parameterType": { "type": parameter.type_name },
            "parameterValue": match value {
                Some(v) => json!({ "value": v }),
                None => json!({}),
            },
        }),
        ParameterValue::Array(values) => json!({
            "name": parameter.name,
            "parameterType": { "type": "ARRAY", "arrayType": { "type": parameter.type_name } },
            "parameterValue": {
                "arrayValues": values.iter().map(|v| json!({ "value": v })).collect::<Vec<_>>(),
            },
        }),
    }
}

/// `jobs.insert` body for a query job.
pub fn job_insert_body(request: &QueryJobRequest) -> Json {
    let mut query = json!({
        "query": request.sql,
        "useLegacySql": request.dialect == SqlDialect::Legacy,
    });
    if !request.parameters.is_empty() {
        query["parameterMode"] = json!("NAMED");
        query["queryParameters"] = Json::Array(request.parameters.iter().map(parameter_json).collect());
    }
    let mut reference = json!({ "projectId": request.project, "jobId": request.job_id });
    if let Some(location) = &request.location {
        reference["location"] = json!(location);
    }
    json!({
        "jobReference": reference,
        "configuration": { "query": query },
    })
}

#[derive(Deserialize)]
struct ErrorEnvelope {
    error: ErrorBody,
}

#[derive(Deserialize)]
struct ErrorBody {
    #[serde(default)]
    message: String,
    #[serde(default)]
    errors: Vec<ErrorProto>,
}

#[derive(Debug, Clone, Deserialize)]
struct ErrorProto {
    #[serde(default)]
    reason: Option<String>,
    #[serde(default)]
    message: Option<String>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct TableResource {
    #[serde(default)]
    schema: Option<TableSchema>,
    #[serde(default)]
    num_rows: Option<String>,
}

#[derive(Deserialize)]
struct TableSchema {
    #[serde(default)]
    fields: Vec<RemoteField>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
struct JobReference {
    project_id: String,
    job_id: String,
    #[serde(default)]
    location: Option<String>,
}

impl JobReference {
    fn into_handle(self) -> JobHandle {
        JobHandle {
            project: self.project_id,
            job_id: self.job_id,
            location: self.location,
        }
    }
}

impl From<JobHandle> for JobReference {
    fn from(job: JobHandle) -> Self {
        Self {
            project_id: job.project,
            job_id: job.job_id,
            location: job.location,
        }
    }
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct JobResource {
    job_reference: JobReference,
    #[serde(default)]
    status: Option<JobStatusResource>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct JobStatusResource {
    #[serde(default)]
    state: String,
    #[serde(default)]
    error_result: Option<ErrorProto>,
}

impl JobStatusResource {
    fn into_status(self) -> JobStatus {
        match (self.state.as_str(), self.error_result) {
            (_, Some(error)) => JobStatus::Failed {
                code: error.reason.unwrap_or_else(|| "unknown".into()),
                message: error.message.unwrap_or_default(),
            },
            ("DONE", None) => JobStatus::Done,
            ("RUNNING", None) => JobStatus::Running,
            _ => JobStatus::Pending,
        }
    }
}

#[derive(Deserialize)]
struct TableRow {
    #[serde(default)]
    f: Vec<TableCell>,
}

#[derive(Deserialize)]
struct TableCell {
    #[serde(default)]
    v: Json,
}

impl TableRow {
    fn into_raw(self) -> RawRow {
        self.f.into_iter().map(|cell| cell.v).collect()
    }
}

/// Shared shape of `jobs.query` and `jobs.getQueryResults` responses.
#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct QueryResponse {
    #[serde(default)]
    job_reference: Option<JobReference>,
    #[serde(default)]
    job_complete: bool,
    #[serde(default)]
    rows: Vec<TableRow>,
    #[serde(default)]
    page_token: Option<String>,
    #[serde(default)]
    total_rows: Option<String>,
}

impl QueryResponse {
    fn into_page(self) -> ResultPage {
        ResultPage {
            total_rows: self.total_rows.and_then(|n| n.parse().ok()).unwrap_or(0),
            next_page_token: self.page_token.filter(|t| !t.is_empty()),
            rows: self.rows.into_iter().map(TableRow::into_raw).collect(),
        }
    }
}

fn dataset_column(row: RawRow) -> Result<DatasetColumn> {
    let text = |index: usize| -> Result<String> {
        row.get(index)
            .and_then(Json::as_str)
            .map(str::to_string)
            .ok_or_else(|| FdwError::schema(format!("unexpected INFORMATION_SCHEMA row: {:?}", row)))
    };
    Ok(DatasetColumn {
        table_name: text(0)?,
        column_name: text(1)?,
        ordinal_position: text(2)?
            .parse()
            .map_err(|_| FdwError::schema("non-numeric ordinal_position"))?,
        data_type: text(3)?,
    })
}

#[async_trait]
impl WarehouseClient for RestWarehouseClient {
    #[instrument(skip(self, credential), fields(table = %table))]
    async fn get_table(&self, credential: &Credential, table: &TableId) -> Result<RemoteTable> {
        let url = self.url(&format!(
            "projects/{}/datasets/{}/tables/{}",
            table.project, table.dataset, table.table
        ));
        let resource: TableResource = match self.send(self.http.get(url), credential).await {
            Ok(resource) => resource,
            Err(FdwError::RemoteQuery { code, message }) if code == "notFound" || code == "404" => {
                return Err(FdwError::schema(format!("table {} not found: {}", table, message)))
            }
            Err(e) => return Err(e),
        };
        Ok(RemoteTable {
            id: table.clone(),
            fields: resource.schema.map(|s| s.fields).unwrap_or_default(),
            num_rows: resource.num_rows.and_then(|n| n.parse().ok()),
        })
    }

    #[instrument(skip(self, credential))]
    async fn list_dataset_columns(
        &self,
        credential: &Credential,
        project: &str,
        dataset: &str,
    ) -> Result<Vec<DatasetColumn>> {
        let sql = format!(
            "SELECT table_name, column_name, ordinal_position, data_type \
             FROM `{}.{}.INFORMATION_SCHEMA.COLUMNS` ORDER BY table_name, ordinal_position",
            project.replace('`', ""),
            dataset.replace('`', "")
        );
        let rows = self.query_sync(credential, project, &sql).await?;
        debug!(columns = rows.len(), "Listed dataset columns");
        rows.into_iter().map(dataset_column).collect()
    }

    #[instrument(skip_all, fields(project = %request.project))]
    async fn submit_query(&self, credential: &Credential, request: &QueryJobRequest) -> Result<JobHandle> {
        let url = self.url(&format!("projects/{}/jobs", request.project));
        let job: JobResource = self
            .send(self.http.post(url).json(&job_insert_body(request)), credential)
            .await?;
        // A submission can already carry a parse failure.
        if let Some(JobStatus::Failed { code, message }) = job.status.map(JobStatusResource::into_status) {
            return Err(FdwError::remote(code, message));
        }
        Ok(job.job_reference.into_handle())
    }

    async fn job_status(&self, credential: &Credential, job: &JobHandle) -> Result<JobStatus> {
        let mut request = self.http.get(self.job_url(job, ""));
        if let Some(location) = &job.location {
            request = request.query(&[("location", location)]);
        }
        let resource: JobResource = self.send(request, credential).await?;
        Ok(resource
            .status
            .map(JobStatusResource::into_status)
            .unwrap_or(JobStatus::Pending))
    }

    async fn fetch_page(
        &self,
        credential: &Credential,
        job: &JobHandle,
        page_token: Option<&str>,
        max_results: u32,
    ) -> Result<ResultPage> {
        let mut request = self.http.get(self.results_url(job)).query(&[
            ("maxResults", max_results.to_string()),
            ("formatOptions.useInt64Timestamp", "true".to_string()),
        ]);
        if let Some(location) = &job.location {
            request = request.query(&[("location", location)]);
        }
        if let Some(token) = page_token {
            request = request.query(&[("pageToken", token)]);
        }
        let response: QueryResponse = self.send(request, credential).await?;
        if !response.job_complete {
            return Err(FdwError::remote("jobIncomplete", format!("job {} has no results yet", job.job_id)));
        }
        Ok(response.into_page())
    }

    async fn cancel_job(&self, credential: &Credential, job: &JobHandle) -> Result<()> {
        let mut request = self.http.post(self.job_url(job, "/cancel"));
        if let Some(location) = &job.location {
            request = request.query(&[("location", location)]);
        }
        let _: Json = self.send(request, credential).await?;
        Ok(())
    }
}
