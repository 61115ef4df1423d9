//! Per-scan state machine.
//!
//! A [`TableSession`] owns one remote job: it buffers one result page at a
//! time, materializes rows on demand and releases the job exactly once,
//! whether the scan is exhausted, closed by the host, fails or is dropped.

use crate::auth::CredentialProvider;
use crate::error::Result;
use crate::query::{QueryExecutor, ResultCursor, TranslatedQuery};
use crate::row::{Row, RowMaterializer};
use crate::schema::TableId;
use crate::storage::RawRow;
use futures::Stream;
use std::collections::VecDeque;
use std::sync::Arc;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Translated, job not yet submitted
    Idle,
    /// Job finished, no page fetched yet
    Open,
    /// At least one page fetched
    Streaming,
    Closed,
}

pub struct TableSession {
    table: TableId,
    state: SessionState,
    executor: QueryExecutor,
    /// Asked before every remote call; a scan can outlive one token
    credentials: Arc<dyn CredentialProvider>,
    project: String,
    query: TranslatedQuery,
    materializer: RowMaterializer,
    cursor: Option<ResultCursor>,
    buffer: VecDeque<RawRow>,
    /// Rows to return when the host limit could not be pushed but can
    /// still be applied after local filtering
    row_limit: Option<u64>,
    rows_returned: u64,
    verbose: bool,
}

impl TableSession {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        table: TableId,
        executor: QueryExecutor,
        credentials: Arc<dyn CredentialProvider>,
        project: String,
        query: TranslatedQuery,
        materializer: RowMaterializer,
        row_limit: Option<u64>,
        verbose: bool,
    ) -> Self {
        Self {
            table,
            state: SessionState::Idle,
            executor,
            credentials,
            project,
            query,
            materializer,
            cursor: None,
            buffer: VecDeque::new(),
            row_limit,
            rows_returned: 0,
            verbose,
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn query(&self) -> &TranslatedQuery {
        &self.query
    }

    /// Remote job backing the scan, once submitted.
    pub fn cursor(&self) -> Option<&ResultCursor> {
        self.cursor.as_ref()
    }

    pub fn rows_returned(&self) -> u64 {
        self.rows_returned
    }

    /// Submit the query and wait for the job. No-op unless idle.
    pub async fn open(&mut self) -> Result<()> {
        if self.state != SessionState::Idle {
            return Ok(());
        }
        if self.verbose {
            info!(table = %self.table, sql = %self.query.sql, "Running remote query");
        } else {
            debug!(table = %self.table, sql = %self.query.sql, "Running remote query");
        }

        match self.executor.execute(&self.query, &self.project, self.credentials.as_ref()).await {
            Ok(cursor) => {
                self.cursor = Some(cursor);
                self.state = SessionState::Open;
                Ok(())
            }
            Err(e) => {
                self.state = SessionState::Closed;
                Err(e)
            }
        }
    }

    /// Next row passing the residual qualifiers, or `None` once the result
    /// set is exhausted. Any error closes the session.
    pub async fn next(&mut self) -> Result<Option<Row>> {
        loop {
            match self.state {
                SessionState::Closed => return Ok(None),
                SessionState::Idle => self.open().await?,
                SessionState::Open | SessionState::Streaming => {}
            }

            if self.row_limit.is_some_and(|limit| self.rows_returned >= limit) {
                self.close().await;
                return Ok(None);
            }

            if let Some(raw) = self.buffer.pop_front() {
                let row = match self.materializer.materialize(&raw) {
                    Ok(row) => row,
                    Err(e) => {
                        warn!(table = %self.table, error = %e, "Row materialization failed");
                        self.close().await;
                        return Err(e);
                    }
                };
                if !self.query.accepts(&row) {
                    continue;
                }
                self.rows_returned += 1;
                return Ok(Some(row));
            }

            let Some(cursor) = self.cursor.as_mut() else {
                self.close().await;
                return Ok(None);
            };
            if cursor.is_exhausted() {
                debug!(table = %self.table, rows = self.rows_returned, "Result set exhausted");
                self.close().await;
                return Ok(None);
            }
            match self.executor.fetch_page(cursor, self.credentials.as_ref()).await {
                Ok(rows) => {
                    self.state = SessionState::Streaming;
                    self.buffer.extend(rows);
                }
                Err(e) => {
                    self.close().await;
                    return Err(e);
                }
            }
        }
    }

    /// Release the remote job. Safe to call any number of times.
    pub async fn close(&mut self) {
        if self.state == SessionState::Closed {
            return;
        }
        self.state = SessionState::Closed;
        self.buffer.clear();
        if let Some(cursor) = self.cursor.as_mut() {
            self.executor.close(cursor, self.credentials.as_ref()).await;
        }
    }

    /// Adapt the session into a stream of rows. The stream ends after the
    /// first error.
    pub fn into_stream(self) -> impl Stream<Item = Result<Row>> {
        let mut session = self;
        async_stream::try_stream! {
            while let Some(row) = session.next().await? {
                yield row;
            }
        }
    }
}

impl Drop for TableSession {
    fn drop(&mut self) {
        if self.state == SessionState::Closed {
            return;
        }
        let Some(mut cursor) = self.cursor.take() else {
            return;
        };
        if cursor.is_released() || cursor.is_exhausted() {
            return;
        }
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                let executor = self.executor.clone();
                let credentials = Arc::clone(&self.credentials);
                handle.spawn(async move {
                    executor.close(&mut cursor, credentials.as_ref()).await;
                });
            }
            Err(_) => warn!(
                job_id = %cursor.job().job_id,
                "Session dropped outside a runtime, remote job left to expire"
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::Credential;
    use crate::config::{QueryConfig, SqlDialect};
    use crate::schema::types::{ColumnMode, HostType, RemoteType};
    use crate::schema::{ColumnDef, ColumnExpr, ColumnMap};
    use crate::storage::MemoryWarehouse;
    use crate::value::Value;
    use chrono::Utc;
    use futures::TryStreamExt;
    use serde_json::json;

    fn session(warehouse: &Arc<MemoryWarehouse>, rows: usize, row_limit: Option<u64>) -> TableSession {
        warehouse.on_query(move |_| Ok((0..rows).map(|i| vec![json!(i.to_string())]).collect()));
        let config = QueryConfig {
            page_size: 3,
            ..Default::default()
        };
        let map = ColumnMap::new(
            "t",
            vec![ColumnDef {
                name: "a".into(),
                remote_type: RemoteType::Int64,
                mode: ColumnMode::Nullable,
                host_type: HostType::Bigint,
                expr: ColumnExpr::Plain,
                fields: vec![],
            }],
        );
        let columns = vec!["a".to_string()];
        let query = TranslatedQuery {
            sql: "SELECT `a` FROM `p.d.t`".into(),
            dialect: SqlDialect::Standard,
            columns: columns.clone(),
            requested: 1,
            pushed: vec![],
            residual: vec![],
            parameters: vec![],
            limit: None,
            sort_pushed: false,
            grouped: false,
        };
        TableSession::new(
            TableId::new("p", "d", "t"),
            QueryExecutor::new(warehouse.clone(), &config),
            Arc::new(Credential::new("test", "token", Utc::now())),
            "p".into(),
            query,
            RowMaterializer::new(&map, &columns, &columns).unwrap(),
            row_limit,
            false,
        )
    }

    #[tokio::test]
    async fn test_lifecycle() {
        let warehouse = Arc::new(MemoryWarehouse::new());
        let mut session = session(&warehouse, 4, None);
        assert_eq!(session.state(), SessionState::Idle);

        session.open().await.unwrap();
        assert_eq!(session.state(), SessionState::Open);

        let first = session.next().await.unwrap().unwrap();
        assert_eq!(first.values(), &[Value::Int8(0)]);
        assert_eq!(session.state(), SessionState::Streaming);

        let mut count = 1;
        while session.next().await.unwrap().is_some() {
            count += 1;
        }
        assert_eq!(count, 4);
        assert_eq!(session.state(), SessionState::Closed);
        assert!(session.next().await.unwrap().is_none());
        // Exhausted results need no cancel.
        assert_eq!(warehouse.stats().cancellations, 0);
    }

    #[tokio::test]
    async fn test_local_limit_stops_early() {
        let warehouse = Arc::new(MemoryWarehouse::new());
        let session = session(&warehouse, 10, Some(2));
        let rows: Vec<Row> = session.into_stream().try_collect().await.unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(warehouse.stats().page_fetches, 1);
        assert_eq!(warehouse.stats().cancellations, 1);
    }

    #[tokio::test]
    async fn test_drop_releases_job() {
        let warehouse = Arc::new(MemoryWarehouse::new());
        let mut session = session(&warehouse, 10, None);
        session.next().await.unwrap();
        drop(session);
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }
        assert_eq!(warehouse.stats().cancellations, 1);
    }
}
