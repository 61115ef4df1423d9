mod common;

use bigquery_fdw_core::{
    config::LimitPolicy,
    schema::{ImportOptions, ImportSelection},
    storage::RemoteField,
    FdwError, HostType, TableId,
};
use common::fixture;

fn seed(fx: &common::Fixture) {
    fx.warehouse.add_table(
        TableId::new("p", "d", "events"),
        vec![
            RemoteField::new("id", "INT64"),
            RemoteField::new("at", "TIMESTAMP"),
            RemoteField::new("tags", "STRING").repeated(),
            RemoteField::new("payload", "RECORD").with_fields(vec![RemoteField::new("x", "FLOAT64")]),
        ],
        vec![],
    );
    fx.warehouse.add_table(
        TableId::new("p", "d", "users"),
        vec![RemoteField::new("name", "STRING"), RemoteField::new("born", "DATE")],
        vec![],
    );
    fx.warehouse.add_table(
        TableId::new("p", "other", "ignored"),
        vec![RemoteField::new("x", "INT64")],
        vec![],
    );
}

#[tokio::test]
async fn test_import_maps_types() -> anyhow::Result<()> {
    let fx = fixture(100);
    seed(&fx);

    let defs = fx.fdw.import_schema(Some("p"), "d", &ImportOptions::default()).await?;
    let names: Vec<&str> = defs.iter().map(|d| d.table.table.as_str()).collect();
    assert_eq!(names, vec!["events", "users"]);

    assert_eq!(
        defs[0].columns,
        vec![
            ("id".to_string(), HostType::Bigint),
            ("at".to_string(), HostType::TimestampTz),
            ("tags".to_string(), HostType::Text),
            ("payload".to_string(), HostType::Text),
        ]
    );
    assert_eq!(defs[1].columns[1], ("born".to_string(), HostType::Date));
    assert_eq!(defs[0].options["fdw_dataset"], "p.d");
    assert_eq!(fx.exchange.calls(), 1);
    Ok(())
}

#[tokio::test]
async fn test_import_selection_and_options() -> anyhow::Result<()> {
    let fx = fixture(100);
    seed(&fx);

    let options = ImportOptions {
        selection: ImportSelection::LimitTo(vec!["users".into()]),
        column_names: LimitPolicy::Error,
        table_options: [("fdw_verbose".to_string(), "true".to_string())].into_iter().collect(),
        ..Default::default()
    };
    let defs = fx.fdw.import_schema(Some("p"), "d", &options).await?;
    assert_eq!(defs.len(), 1);

    let sql = defs[0].to_sql("bigquery_srv", "staging");
    assert!(sql.starts_with("CREATE FOREIGN TABLE \"staging\".\"users\" (\n    \"name\" text,\n    \"born\" date\n)"));
    assert!(sql.contains("fdw_table 'users'"));
    assert!(sql.contains("fdw_verbose 'true'"));
    assert!(sql.ends_with(");"));

    let except = ImportOptions {
        selection: ImportSelection::Except(vec!["users".into(), "events".into()]),
        ..Default::default()
    };
    assert!(fx.fdw.import_schema(Some("p"), "d", &except).await?.is_empty());
    Ok(())
}

#[tokio::test]
async fn test_import_unknown_dataset() {
    let fx = fixture(100);
    seed(&fx);
    let result = fx.fdw.import_schema(Some("p"), "missing", &ImportOptions::default()).await;
    assert!(matches!(result, Err(FdwError::Schema(_))));
}
