mod common;

use bigquery_fdw_core::{FdwError, ForeignTableSpec, ScanRequest, SessionState, TableId, TableOptions};
use common::{ab_table, fixture, serve_translated};

fn spec() -> ForeignTableSpec {
    ForeignTableSpec::new(TableId::new("p", "d", "t"), vec![], TableOptions::default())
}

#[tokio::test]
async fn test_close_is_idempotent() -> anyhow::Result<()> {
    let fx = fixture(5);
    let (table, fields, data) = ab_table(20);
    fx.warehouse.add_table(table, fields.clone(), data.clone());
    let request = ScanRequest::new(["a"]);
    serve_translated(&fx.warehouse, &fields, data, fx.fdw.translate(&spec(), &request).await?);

    let mut session = fx.fdw.open(&spec(), request).await?;
    assert!(session.next().await?.is_some());

    session.close().await;
    session.close().await;
    assert_eq!(session.state(), SessionState::Closed);
    assert!(session.next().await?.is_none());
    assert_eq!(fx.warehouse.stats().cancellations, 1);
    Ok(())
}

#[tokio::test]
async fn test_remote_failure_closes_session() -> anyhow::Result<()> {
    let fx = fixture(5);
    let (table, fields, data) = ab_table(3);
    fx.warehouse.add_table(table, fields.clone(), data.clone());
    let request = ScanRequest::new(["a"]);
    serve_translated(&fx.warehouse, &fields, data, fx.fdw.translate(&spec(), &request).await?);
    fx.warehouse.fail_jobs("invalidQuery", "Unrecognized name: a");

    match fx.fdw.open(&spec(), request).await {
        Err(FdwError::RemoteQuery { code, message }) => {
            assert_eq!(code, "invalidQuery");
            assert_eq!(message, "Unrecognized name: a");
        }
        other => panic!("expected a remote error, got {:?}", other.map(|s| s.state())),
    }
    Ok(())
}

#[tokio::test]
async fn test_coercion_error_names_column() -> anyhow::Result<()> {
    let fx = fixture(5);
    let (table, fields, _) = ab_table(0);
    fx.warehouse.add_table(table, fields, vec![]);
    fx.warehouse
        .on_query(|_| Ok(vec![vec![serde_json::json!("1")], vec![serde_json::json!("one")]]));

    let mut session = fx.fdw.open(&spec(), ScanRequest::new(["a"])).await?;
    assert!(session.next().await?.is_some());
    match session.next().await {
        Err(FdwError::Coercion { column, .. }) => assert_eq!(column, "a"),
        other => panic!("expected a coercion error, got {:?}", other.map(|r| r.is_some())),
    }
    assert_eq!(session.state(), SessionState::Closed);
    assert!(session.next().await?.is_none());
    // Both rows arrived in one page, so there is nothing left to cancel.
    assert_eq!(fx.warehouse.stats().cancellations, 0);
    Ok(())
}

#[tokio::test]
async fn test_missing_table_is_schema_error() {
    let fx = fixture(5);
    let result = fx.fdw.open(&spec(), ScanRequest::new(["a"])).await;
    assert!(matches!(result, Err(FdwError::Schema(_))));
    assert_eq!(fx.warehouse.stats().submissions, 0);
}
