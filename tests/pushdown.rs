mod common;

use bigquery_fdw_core::{
    schema::ColumnDeclaration, storage::RemoteField, ForeignTableSpec, HostType, Operator, Qualifier,
    ScanRequest, SortKey, SqlDialect, TableId, TableOptions, Value,
};
use common::{ab_table, fixture, serve_translated};
use futures::TryStreamExt;
use sqlparser::dialect::BigQueryDialect;
use sqlparser::parser::Parser;

fn ab_spec() -> ForeignTableSpec {
    ForeignTableSpec::new(
        TableId::new("p", "d", "t"),
        vec![
            ColumnDeclaration::new("a", HostType::Bigint),
            ColumnDeclaration::new("b", HostType::Text),
        ],
        TableOptions::default(),
    )
}

fn assert_valid_sql(sql: &str) {
    let statements = Parser::parse_sql(&BigQueryDialect {}, sql).unwrap_or_else(|e| panic!("{}: {}", sql, e));
    assert_eq!(statements.len(), 1, "{}", sql);
}

#[tokio::test]
async fn test_residual_qualifier_blocks_limit() -> anyhow::Result<()> {
    let fx = fixture(4);
    let (table, fields, data) = ab_table(60);
    fx.warehouse.add_table(table, fields.clone(), data.clone());

    let spec = ab_spec();
    let request = ScanRequest::new(["a"])
        .with_qualifier(Qualifier::eq("b", "x"))
        .with_qualifier(Qualifier::binary("a", Operator::Gt, 10).local_only())
        .with_limit(5);

    let query = fx.fdw.translate(&spec, &request).await?;
    assert_eq!(query.sql, "SELECT `a` FROM `p.d.t` WHERE `b` = 'x'");
    assert_eq!(query.columns, vec!["a"]);
    assert_eq!(query.limit, None);
    assert_eq!(query.residual.len(), 1);
    assert_valid_sql(&query.sql);

    serve_translated(&fx.warehouse, &fields, data, query);
    let session = fx.fdw.open(&spec, request).await?;
    let rows: Vec<_> = session.into_stream().try_collect().await?;

    let values: Vec<Value> = rows.into_iter().flat_map(|r| r.into_values()).collect();
    assert_eq!(
        values,
        vec![12, 15, 18, 21, 24].into_iter().map(Value::Int8).collect::<Vec<_>>()
    );
    Ok(())
}

#[tokio::test]
async fn test_pushed_and_residual_match_local_evaluation() -> anyhow::Result<()> {
    let fx = fixture(7);
    let (table, fields, data) = ab_table(50);
    fx.warehouse.add_table(table, fields.clone(), data.clone());
    let spec = ab_spec();

    let qualifier_sets = vec![
        vec![Qualifier::eq("b", "y")],
        vec![Qualifier::binary("a", Operator::LtEq, 20), Qualifier::is_null("b")],
        vec![Qualifier::in_list("a", vec![Value::Int8(3), Value::Int8(4), Value::Int8(40)])],
        vec![Qualifier::binary("b", Operator::Like, "x%"), Qualifier::binary("a", Operator::Gt, 30).local_only()],
        vec![Qualifier::binary("b", Operator::ILike, "Y"), Qualifier::not_in_list("a", vec![Value::Int8(1)])],
        vec![Qualifier::eq("a", "not a number")],
    ];

    for qualifiers in qualifier_sets {
        let mut request = ScanRequest::new(["a"]).with_sort(SortKey::asc("a"));
        for qualifier in &qualifiers {
            request = request.with_qualifier(qualifier.clone());
        }
        let query = fx.fdw.translate(&spec, &request).await?;
        assert_valid_sql(&query.sql);
        // Only pushed conditions reach the remote query.
        let conditions = query
            .sql
            .split(" WHERE ")
            .nth(1)
            .and_then(|w| w.split(" ORDER BY ").next())
            .map(|w| w.split(" AND ").count())
            .unwrap_or(0);
        assert_eq!(conditions, query.pushed.len(), "{}", query.sql);

        serve_translated(&fx.warehouse, &fields, data.clone(), query);
        let rows: Vec<_> = fx.fdw.open(&spec, request).await?.into_stream().try_collect().await?;
        let got: Vec<Value> = rows.iter().map(|r| r.values()[0].clone()).collect();

        let names: std::sync::Arc<[String]> = vec!["a".to_string(), "b".to_string()].into();
        let expected: Vec<Value> = data
            .iter()
            .map(|values| bigquery_fdw_core::Row::new(names.clone(), values.clone(), 2))
            .filter(|row| qualifiers.iter().all(|q| q.matches(row)))
            .map(|row| row.values()[0].clone())
            .collect();
        assert_eq!(got, expected, "qualifiers {:?}", qualifiers);
    }
    Ok(())
}

#[tokio::test]
async fn test_nested_column_qualifier_stays_residual() -> anyhow::Result<()> {
    let fx = fixture(100);
    fx.warehouse.add_table(
        TableId::new("p", "d", "events"),
        vec![
            RemoteField::new("id", "INT64"),
            RemoteField::new("payload", "RECORD").with_fields(vec![RemoteField::new("k", "STRING")]),
            RemoteField::new("tags", "STRING").repeated(),
        ],
        vec![],
    );
    let spec = ForeignTableSpec::new(TableId::new("p", "d", "events"), vec![], TableOptions::default());

    let request = ScanRequest::new(["id"])
        .with_qualifier(Qualifier::eq("payload", r#"{"k":"v"}"#))
        .with_qualifier(Qualifier::eq("tags", "a"))
        .with_qualifier(Qualifier::eq("id", 7));
    let query = fx.fdw.translate(&spec, &request).await?;

    assert_eq!(
        query.sql,
        "SELECT `id`, `payload`, `tags` FROM `p.d.events` WHERE `id` = 7"
    );
    assert_eq!(query.requested_columns(), ["id"]);
    assert_eq!(query.residual.len(), 2);
    assert!(query.residual.iter().all(|q| !q.pushable));
    assert_valid_sql(&query.sql);
    Ok(())
}

#[tokio::test]
async fn test_literals_are_escaped() -> anyhow::Result<()> {
    let fx = fixture(100);
    let (table, fields, data) = ab_table(3);
    fx.warehouse.add_table(table, fields, data);

    let request = ScanRequest::new(["a"]).with_qualifier(Qualifier::eq("b", "x' OR '1'='1"));
    let query = fx.fdw.translate(&ab_spec(), &request).await?;
    assert_eq!(query.sql, r"SELECT `a` FROM `p.d.t` WHERE `b` = 'x\' OR \'1\'=\'1'");
    Ok(())
}

#[tokio::test]
async fn test_parameterized_mode() -> anyhow::Result<()> {
    let fx = fixture(100);
    let (table, fields, data) = ab_table(3);
    fx.warehouse.add_table(table, fields, data);

    let mut spec = ab_spec();
    spec.options.parameterized = true;
    let request = ScanRequest::new(["a"])
        .with_qualifier(Qualifier::eq("b", "x"))
        .with_qualifier(Qualifier::in_list("a", vec![Value::Int8(1), Value::Int8(2)]));
    let query = fx.fdw.translate(&spec, &request).await?;

    assert_eq!(query.sql, "SELECT `a` FROM `p.d.t` WHERE `b` = @p0 AND `a` IN UNNEST(@p1)");
    assert_eq!(query.parameters.len(), 2);
    assert_eq!(query.parameters[1].type_name, "INT64");
    Ok(())
}

#[tokio::test]
async fn test_query_override_ending_in_comment() -> anyhow::Result<()> {
    let fx = fixture(100);
    let spec = ab_spec().with_query_override("SELECT a, b FROM `p.d.t` -- recent rows only")?;
    let request = ScanRequest::new(["a"]).with_qualifier(Qualifier::eq("b", "x"));

    let query = fx.fdw.translate(&spec, &request).await?;
    assert_eq!(
        query.sql,
        "SELECT `a` FROM (\nSELECT a, b FROM `p.d.t` -- recent rows only\n) AS _fdw_src WHERE `b` = 'x'"
    );
    assert_eq!(query.pushed.len(), 1);
    assert_valid_sql(&query.sql);
    // Override columns come from the declaration, not from table metadata.
    assert_eq!(fx.warehouse.stats().table_lookups, 0);
    Ok(())
}

#[tokio::test]
async fn test_grouping_pushes_count_and_group_by() -> anyhow::Result<()> {
    let fx = fixture(100);
    let (table, fields, data) = ab_table(9);
    fx.warehouse.add_table(table.clone(), fields, data);

    let options = TableOptions {
        group_by: true,
        ..Default::default()
    };
    let spec = ForeignTableSpec::new(
        table,
        vec![
            ColumnDeclaration::new("b", HostType::Text),
            ColumnDeclaration::new("_fdw_count", HostType::Bigint),
        ],
        options,
    );
    let request = ScanRequest::new(["b", "_fdw_count"])
        .with_qualifier(Qualifier::is_not_null("b"))
        .with_sort(SortKey::desc("_fdw_count"));

    let query = fx.fdw.translate(&spec, &request).await?;
    assert_eq!(
        query.sql,
        "SELECT `b`, COUNT(*) AS `_fdw_count` FROM `p.d.t` WHERE `b` IS NOT NULL \
         GROUP BY `b` ORDER BY `_fdw_count` DESC NULLS FIRST"
    );
    assert!(query.grouped);
    assert!(query.sort_pushed);
    assert_valid_sql(&query.sql);

    // Without fdw_group the pseudo column is a constant per row.
    let mut plain = spec.clone();
    plain.options.group_by = false;
    let query = fx.fdw.translate(&plain, &ScanRequest::new(["b", "_fdw_count"])).await?;
    assert_eq!(query.sql, "SELECT `b`, 1 AS `_fdw_count` FROM `p.d.t`");
    assert!(!query.grouped);
    Ok(())
}

#[tokio::test]
async fn test_partition_date_pushdown() -> anyhow::Result<()> {
    let fx = fixture(100);
    let (table, fields, data) = ab_table(3);
    fx.warehouse.add_table(table.clone(), fields, data);

    let columns = vec![
        ColumnDeclaration::new("a", HostType::Bigint),
        ColumnDeclaration::new("partition_date", HostType::Date),
    ];
    let day = Value::Date(chrono::NaiveDate::from_ymd_opt(2020, 1, 31).unwrap());
    let request = ScanRequest::new(["a", "partition_date"])
        .with_qualifier(Qualifier::binary("partition_date", Operator::GtEq, day));

    let spec = ForeignTableSpec::new(table.clone(), columns.clone(), TableOptions::default());
    let query = fx.fdw.translate(&spec, &request).await?;
    assert_eq!(
        query.sql,
        "SELECT `a`, _PARTITIONDATE AS `partition_date` FROM `p.d.t` WHERE _PARTITIONDATE >= DATE '2020-01-31'"
    );
    assert!(query.residual.is_empty());
    assert_valid_sql(&query.sql);

    let options = TableOptions {
        dialect: SqlDialect::Legacy,
        ..Default::default()
    };
    let legacy = ForeignTableSpec::new(table, columns, options);
    let query = fx.fdw.translate(&legacy, &request).await?;
    assert_eq!(
        query.sql,
        "SELECT [a], DATE(_PARTITIONTIME) AS [partition_date] FROM [p:d.t]"
    );
    assert_eq!(query.residual.len(), 1);
    Ok(())
}

#[tokio::test]
async fn test_legacy_dialect_rendering() -> anyhow::Result<()> {
    let fx = fixture(100);
    let (table, fields, data) = ab_table(3);
    fx.warehouse.add_table(table, fields, data);

    let mut spec = ab_spec();
    spec.options.dialect = SqlDialect::Legacy;
    spec.options.parameterized = true;
    let request = ScanRequest::new(["a", "b"])
        .with_qualifier(Qualifier::eq("b", "it's"))
        .with_qualifier(Qualifier::in_list("a", vec![Value::Int8(1), Value::Int8(2)]))
        .with_sort(SortKey::asc("a").nulls_first(true))
        .with_sort(SortKey::desc("b").nulls_first(false))
        .with_limit(5);

    let query = fx.fdw.translate(&spec, &request).await?;
    assert_eq!(
        query.sql,
        r"SELECT [a], [b] FROM [p:d.t] WHERE [b] = 'it\'s' AND [a] IN (1, 2) ORDER BY [a] ASC, [b] DESC LIMIT 5"
    );
    assert!(query.parameters.is_empty());
    assert_eq!(query.limit, Some(5));
    Ok(())
}

#[tokio::test]
async fn test_convert_tz_select_items() -> anyhow::Result<()> {
    let fx = fixture(100);
    fx.warehouse.add_table(
        TableId::new("p", "d", "events"),
        vec![
            RemoteField::new("id", "INT64"),
            RemoteField::new("created", "TIMESTAMP"),
            RemoteField::new("updated", "TIMESTAMP"),
        ],
        vec![],
    );
    let options = TableOptions {
        convert_tz: Some("US/Eastern".into()),
        ..Default::default()
    };
    let spec = ForeignTableSpec::new(
        TableId::new("p", "d", "events"),
        vec![
            ColumnDeclaration::new("id", HostType::Bigint),
            ColumnDeclaration::new("created", HostType::Date),
            ColumnDeclaration::new("updated", HostType::Timestamp),
        ],
        options,
    );
    let day = Value::Date(chrono::NaiveDate::from_ymd_opt(2021, 3, 1).unwrap());
    let request = ScanRequest::new(["id", "created", "updated"])
        .with_qualifier(Qualifier::eq("created", day))
        .with_qualifier(Qualifier::eq("id", 1));

    let query = fx.fdw.translate(&spec, &request).await?;
    assert_eq!(
        query.sql,
        "SELECT `id`, DATE(`created`, 'US/Eastern') AS `created`, \
         DATETIME(`updated`, 'US/Eastern') AS `updated` FROM `p.d.events` WHERE `id` = 1"
    );
    // Converted columns are filtered on the host.
    assert_eq!(query.residual.len(), 1);
    assert_eq!(query.residual[0].column, "created");
    assert_valid_sql(&query.sql);
    Ok(())
}
