//! Host-facing entry point.
//!
//! [`BigQueryFdw`] wires the credential manager, schema introspector,
//! translator and executor together. A host plugin keeps one instance per
//! foreign server and calls [`BigQueryFdw::open`] once per scan.

use crate::auth::{CredentialManager, CredentialProvider, KeyFileCredentials};
use crate::config::FdwConfig;
use crate::error::{FdwError, Result};
use crate::query::{translate, QueryExecutor, ScanRequest, TranslatedQuery};
use crate::row::RowMaterializer;
use crate::schema::import::build_definitions;
use crate::schema::{
    ColumnDeclaration, ColumnMap, ForeignTableDefinition, ForeignTableSpec, ImportOptions, SchemaIntrospector,
};
use crate::session::TableSession;
use crate::storage::{RestWarehouseClient, WarehouseClient};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info, instrument};

pub struct BigQueryFdw {
    config: FdwConfig,
    client: Arc<dyn WarehouseClient>,
    credentials: Arc<CredentialManager>,
    introspector: SchemaIntrospector,
    executor: QueryExecutor,
}

impl BigQueryFdw {
    pub fn new(config: FdwConfig, client: Arc<dyn WarehouseClient>, credentials: Arc<CredentialManager>) -> Self {
        let executor =
            QueryExecutor::new(Arc::clone(&client), &config.query).with_location(config.bigquery.location.clone());
        Self {
            introspector: SchemaIntrospector::new(Arc::clone(&client)),
            executor,
            client,
            credentials,
            config,
        }
    }

    /// Service talking to the BigQuery REST API with the process-wide
    /// credential cache.
    pub fn from_config(config: FdwConfig) -> Result<Self> {
        config.validate()?;
        let client = Arc::new(RestWarehouseClient::from_config(&config.bigquery));
        let credentials = CredentialManager::shared(&config.credentials);
        Ok(Self::new(config, client, credentials))
    }

    pub fn config(&self) -> &FdwConfig {
        &self.config
    }

    pub fn introspector(&self) -> &SchemaIntrospector {
        &self.introspector
    }

    /// Build a table spec from host foreign table options.
    pub fn table_spec(
        &self,
        options: &HashMap<String, String>,
        columns: Vec<ColumnDeclaration>,
    ) -> Result<ForeignTableSpec> {
        ForeignTableSpec::from_host_options(options, columns, &self.config)
    }

    /// Credentials for `spec`, or the server-wide key when `spec` is `None`
    /// or sets no key of its own.
    fn credentials_for(&self, spec: Option<&ForeignTableSpec>) -> Result<KeyFileCredentials> {
        let key_path = spec
            .and_then(|s| s.options.key_path.clone())
            .or_else(|| self.config.key_path())
            .ok_or_else(|| FdwError::Auth("no service account key configured".into()))?;
        Ok(KeyFileCredentials::new(Arc::clone(&self.credentials), key_path))
    }

    /// Forget a credential the warehouse refused so the next call
    /// re-exchanges it.
    fn observe<T>(credentials: &dyn CredentialProvider, result: Result<T>) -> Result<T> {
        if let Err(e) = &result {
            if e.is_auth_rejection() {
                credentials.invalidate();
            }
        }
        result
    }

    /// Project billed for query jobs on `spec`.
    pub fn billing_project(&self, spec: &ForeignTableSpec) -> String {
        if self.config.bigquery.project.is_empty() {
            spec.table.project.clone()
        } else {
            self.config.bigquery.project.clone()
        }
    }

    #[instrument(skip_all, fields(table = %spec.table))]
    pub async fn describe(&self, spec: &ForeignTableSpec) -> Result<Arc<ColumnMap>> {
        let credentials = self.credentials_for(Some(spec))?;
        self.describe_with(spec, &credentials).await
    }

    async fn describe_with(&self, spec: &ForeignTableSpec, credentials: &KeyFileCredentials) -> Result<Arc<ColumnMap>> {
        let credential = credentials.credential().await?;
        let described = self.introspector.describe(spec, &credential).await;
        Self::observe(credentials, described)
    }

    /// Remote query for a scan, without running it.
    pub async fn translate(&self, spec: &ForeignTableSpec, request: &ScanRequest) -> Result<TranslatedQuery> {
        let column_map = self.describe(spec).await?;
        translate(spec, &column_map, request)
    }

    /// Start a scan: describe, translate and run the remote job.
    #[instrument(skip_all, fields(table = %spec.table))]
    pub async fn open(&self, spec: &ForeignTableSpec, request: ScanRequest) -> Result<TableSession> {
        let credentials = Arc::new(self.credentials_for(Some(spec))?);
        let column_map = self.describe_with(spec, &credentials).await?;

        let query = translate(spec, &column_map, &request)?;
        debug!(
            pushed = query.pushed.len(),
            residual = query.residual.len(),
            limit = ?query.limit,
            "Translated scan"
        );
        let materializer = RowMaterializer::new(&column_map, &query.columns, query.requested_columns())?;
        let row_limit = request
            .limit
            .filter(|_| request.sort.is_empty() || query.sort_pushed);

        let mut session = TableSession::new(
            spec.table.clone(),
            self.executor.clone(),
            credentials,
            self.billing_project(spec),
            query,
            materializer,
            row_limit,
            spec.options.verbose,
        );
        session.open().await?;
        Ok(session)
    }

    /// Foreign table definitions for every table of a dataset.
    #[instrument(skip(self, options))]
    pub async fn import_schema(
        &self,
        project: Option<&str>,
        dataset: &str,
        options: &ImportOptions,
    ) -> Result<Vec<ForeignTableDefinition>> {
        let project = project.unwrap_or(&self.config.bigquery.project);
        if project.is_empty() {
            return Err(FdwError::Config("a project is required to import a schema".into()));
        }
        let credentials = self.credentials_for(None)?;
        let credential = credentials.credential().await?;
        let listed = self.client.list_dataset_columns(&credential, project, dataset).await;
        let columns = Self::observe(&credentials, listed)?;
        let definitions = build_definitions(project, dataset, columns, options)?;
        info!(tables = definitions.len(), "Imported foreign schema");
        Ok(definitions)
    }
}
