use crate::cli::commands::{ImportCommand, ScanCommand, TableArgs};
use crate::config::{FdwConfig, LimitPolicy};
use crate::query::{Operand, Operator, Qualifier, ScanRequest, SortKey};
use crate::schema::{
    ColumnDeclaration, ColumnExpr, ColumnMap, ForeignTableSpec, HostType, ImportOptions, ImportSelection,
};
use crate::service::BigQueryFdw;
use crate::storage::arrow_utils::{batch_schema, format_batches, rows_to_batch};
use crate::value::Value;
use anyhow::{anyhow, bail, Context, Result};
use chrono::{DateTime, NaiveDate, NaiveDateTime, NaiveTime, Utc};
use sqlparser::ast::{BinaryOperator, Expr, UnaryOperator, Value as SqlValue};
use sqlparser::dialect::BigQueryDialect;
use sqlparser::parser::Parser;
use std::collections::HashMap;
use tracing::info;

/// Rows printed by `scan` per record batch.
const SCAN_BATCH_ROWS: usize = 1024;

fn parse_key_values(pairs: &[String]) -> Result<HashMap<String, String>> {
    pairs
        .iter()
        .map(|pair| {
            pair.split_once('=')
                .map(|(k, v)| (k.trim().to_string(), v.trim().to_string()))
                .ok_or_else(|| anyhow!("expected KEY=VALUE, got '{}'", pair))
        })
        .collect()
}

/// Turn command line table arguments into the options a host would pass.
fn table_spec(fdw: &BigQueryFdw, args: &TableArgs) -> Result<ForeignTableSpec> {
    let mut options = parse_key_values(&args.options)?;
    if let Some(table) = &args.table {
        let parts: Vec<&str> = table.split('.').collect();
        match parts.as_slice() {
            [project, dataset, table] => {
                options.insert("fdw_project".into(), project.to_string());
                options.insert("fdw_dataset".into(), dataset.to_string());
                options.insert("fdw_table".into(), table.to_string());
            }
            [dataset, table] => {
                options.insert("fdw_dataset".into(), dataset.to_string());
                options.insert("fdw_table".into(), table.to_string());
            }
            _ => bail!("--table expects DATASET.TABLE or PROJECT.DATASET.TABLE"),
        }
    }
    if let Some(query) = &args.query {
        options.insert("fdw_query".into(), query.clone());
    }

    let columns = args
        .columns
        .iter()
        .map(|column| match column.split_once(':') {
            Some((name, host_type)) => ColumnDeclaration::new(name.trim(), HostType::parse(host_type)),
            None => ColumnDeclaration::untyped(column.trim()),
        })
        .collect();

    Ok(fdw.table_spec(&options, columns)?)
}

/// Interpret a literal against the host type of the column it is compared
/// with.
fn coerce_literal(value: Value, host_type: HostType) -> Value {
    let Value::Text(text) = &value else {
        return value;
    };
    let coerced = match host_type {
        HostType::Date => NaiveDate::parse_from_str(text, "%Y-%m-%d").ok().map(Value::Date),
        HostType::Time => NaiveTime::parse_from_str(text, "%H:%M:%S%.f").ok().map(Value::Time),
        HostType::Timestamp => NaiveDateTime::parse_from_str(text, "%Y-%m-%d %H:%M:%S%.f")
            .ok()
            .map(Value::Timestamp),
        HostType::TimestampTz => DateTime::parse_from_rfc3339(text)
            .ok()
            .map(|ts| Value::TimestampTz(ts.with_timezone(&Utc))),
        HostType::Numeric => Some(Value::Numeric(text.clone())),
        _ => None,
    };
    coerced.unwrap_or(value)
}

fn literal(expr: &Expr) -> Result<Value> {
    Ok(match expr {
        Expr::Value(SqlValue::Null) => Value::Null,
        Expr::Value(SqlValue::Boolean(b)) => Value::Bool(*b),
        Expr::Value(SqlValue::Number(n, _)) => match n.parse::<i64>() {
            Ok(i) => Value::Int8(i),
            Err(_) => Value::Float8(n.parse().with_context(|| format!("invalid number {}", n))?),
        },
        Expr::Value(SqlValue::SingleQuotedString(s)) | Expr::Value(SqlValue::DoubleQuotedString(s)) => {
            Value::Text(s.clone())
        }
        Expr::UnaryOp {
            op: UnaryOperator::Minus,
            expr,
        } => match literal(expr)? {
            Value::Int8(i) => Value::Int8(-i),
            Value::Float8(f) => Value::Float8(-f),
            other => bail!("cannot negate {}", other.type_name()),
        },
        Expr::Nested(inner) => literal(inner)?,
        other => bail!("expected a literal, got {}", other),
    })
}

fn column_name(expr: &Expr) -> Result<String> {
    match expr {
        Expr::Identifier(ident) => Ok(ident.value.clone()),
        other => bail!("expected a column name, got {}", other),
    }
}

/// Parse one `--where` condition into a qualifier.
pub fn parse_condition(condition: &str, column_map: &ColumnMap) -> Result<Qualifier> {
    let expr = Parser::new(&BigQueryDialect {})
        .try_with_sql(condition)?
        .parse_expr()
        .with_context(|| format!("invalid condition '{}'", condition))?;

    let (column, operator, operand) = match &expr {
        Expr::BinaryOp { left, op, right } => {
            let operator = match op {
                BinaryOperator::Eq => Operator::Eq,
                BinaryOperator::NotEq => Operator::NotEq,
                BinaryOperator::Lt => Operator::Lt,
                BinaryOperator::LtEq => Operator::LtEq,
                BinaryOperator::Gt => Operator::Gt,
                BinaryOperator::GtEq => Operator::GtEq,
                other => Operator::Other(other.to_string()),
            };
            (column_name(left)?, operator, Operand::Value(literal(right)?))
        }
        Expr::IsNull(inner) => (column_name(inner)?, Operator::IsNull, Operand::None),
        Expr::IsNotNull(inner) => (column_name(inner)?, Operator::IsNotNull, Operand::None),
        Expr::InList { expr, list, negated } => {
            let values = list.iter().map(literal).collect::<Result<Vec<_>>>()?;
            let operator = if *negated { Operator::NotIn } else { Operator::In };
            (column_name(expr)?, operator, Operand::List(values))
        }
        Expr::Like { negated, expr, pattern, .. } => {
            let operator = if *negated { Operator::NotLike } else { Operator::Like };
            (column_name(expr)?, operator, Operand::Value(literal(pattern)?))
        }
        Expr::ILike { negated, expr, pattern, .. } => {
            let operator = if *negated { Operator::NotILike } else { Operator::ILike };
            (column_name(expr)?, operator, Operand::Value(literal(pattern)?))
        }
        other => bail!("unsupported condition {}", other),
    };

    let host_type = column_map
        .get(&column)
        .map(|c| c.host_type)
        .ok_or_else(|| anyhow!("unknown column {}", column))?;
    let operand = match operand {
        Operand::Value(v) => Operand::Value(coerce_literal(v, host_type)),
        Operand::List(values) => Operand::List(values.into_iter().map(|v| coerce_literal(v, host_type)).collect()),
        Operand::None => Operand::None,
    };
    Ok(Qualifier::new(column, operator, operand))
}

fn parse_sort_key(key: &str) -> Result<SortKey> {
    let mut parts = key.split(':');
    let column = parts.next().unwrap_or_default().trim();
    if column.is_empty() {
        bail!("empty sort key");
    }
    let mut descending = false;
    let mut nulls_first = None;
    for modifier in parts {
        match modifier.trim().to_ascii_lowercase().as_str() {
            "asc" => descending = false,
            "desc" => descending = true,
            "nulls_first" => nulls_first = Some(true),
            "nulls_last" => nulls_first = Some(false),
            other => bail!("unknown sort modifier '{}'", other),
        }
    }
    let sort = if descending { SortKey::desc(column) } else { SortKey::asc(column) };
    Ok(match nulls_first {
        Some(nulls_first) => sort.nulls_first(nulls_first),
        None => sort,
    })
}

async fn scan_request(fdw: &BigQueryFdw, spec: &ForeignTableSpec, cmd: &ScanCommand) -> Result<ScanRequest> {
    let column_map = fdw.describe(spec).await?;
    let columns = if cmd.select.is_empty() {
        column_map.names()
    } else {
        cmd.select.clone()
    };

    let mut request = ScanRequest::new(columns);
    for condition in &cmd.conditions {
        request = request.with_qualifier(parse_condition(condition, &column_map)?);
    }
    for key in &cmd.order_by {
        request = request.with_sort(parse_sort_key(key)?);
    }
    if let Some(limit) = cmd.limit {
        request = request.with_limit(limit);
    }
    Ok(request)
}

pub fn build_service(config: FdwConfig) -> Result<BigQueryFdw> {
    BigQueryFdw::from_config(config).context("Failed to initialize the wrapper")
}

pub async fn handle_describe(fdw: &BigQueryFdw, args: &TableArgs) -> Result<()> {
    let spec = table_spec(fdw, args)?;
    let column_map = fdw.describe(&spec).await?;

    println!("{} ({} columns)", spec.table, column_map.len());
    for column in column_map.iter() {
        let expr = match &column.expr {
            ColumnExpr::Plain => String::new(),
            ColumnExpr::Cast(target) => format!("cast to {}", target.standard_name()),
            ColumnExpr::ConvertTz { target, zone } => format!("{} in {}", target.standard_name(), zone),
            ColumnExpr::PartitionDate => "partition date".to_string(),
            ColumnExpr::RowCount => "row count".to_string(),
        };
        println!(
            "  {:<32} {:<12} {:<10} {:<26} {}",
            column.name,
            column.remote_type.standard_name(),
            format!("{:?}", column.mode).to_ascii_lowercase(),
            column.host_type.sql_name(),
            expr
        );
    }
    Ok(())
}

pub async fn handle_translate(fdw: &BigQueryFdw, cmd: &ScanCommand) -> Result<()> {
    let spec = table_spec(fdw, &cmd.table)?;
    let request = scan_request(fdw, &spec, cmd).await?;
    let query = fdw.translate(&spec, &request).await?;

    println!("{}", query.sql);
    for parameter in &query.parameters {
        println!("-- @{} {} = {:?}", parameter.name, parameter.type_name, parameter.value);
    }
    for qualifier in &query.residual {
        println!("-- residual: {}", qualifier);
    }
    Ok(())
}

pub async fn handle_scan(fdw: &BigQueryFdw, cmd: &ScanCommand) -> Result<()> {
    let spec = table_spec(fdw, &cmd.table)?;
    let request = scan_request(fdw, &spec, cmd).await?;
    let column_map = fdw.describe(&spec).await?;
    let schema = batch_schema(&column_map, &request.columns)?;

    let mut session = fdw.open(&spec, request).await?;
    let mut batches = Vec::new();
    let mut rows = Vec::with_capacity(SCAN_BATCH_ROWS);
    while let Some(row) = session.next().await? {
        rows.push(row);
        if rows.len() == SCAN_BATCH_ROWS {
            batches.push(rows_to_batch(schema.clone(), &rows)?);
            rows.clear();
        }
    }
    session.close().await;
    if !rows.is_empty() || batches.is_empty() {
        batches.push(rows_to_batch(schema, &rows)?);
    }

    println!("{}", format_batches(&batches)?);
    info!(rows = session.rows_returned(), "Scan finished");
    Ok(())
}

pub async fn handle_import_schema(fdw: &BigQueryFdw, cmd: &ImportCommand) -> Result<()> {
    let selection = if !cmd.limit_to.is_empty() {
        ImportSelection::LimitTo(cmd.limit_to.clone())
    } else if !cmd.except.is_empty() {
        ImportSelection::Except(cmd.except.clone())
    } else {
        ImportSelection::All
    };
    let options = ImportOptions {
        selection,
        column_count: LimitPolicy::parse(&cmd.colcount)?,
        column_names: LimitPolicy::parse(&cmd.colnames)?,
        table_options: parse_key_values(&cmd.options)?.into_iter().collect(),
    };

    let definitions = fdw
        .import_schema(cmd.remote_project.as_deref(), &cmd.dataset, &options)
        .await?;
    for definition in definitions {
        println!("{}\n", definition.to_sql(&cmd.server, &cmd.local_schema));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::types::{ColumnMode, RemoteType};
    use crate::schema::ColumnDef;

    fn column_map() -> ColumnMap {
        let column = |name: &str, remote_type, host_type| ColumnDef {
            name: name.to_string(),
            remote_type,
            mode: ColumnMode::Nullable,
            host_type,
            expr: ColumnExpr::Plain,
            fields: vec![],
        };
        ColumnMap::new(
            "t",
            vec![
                column("a", RemoteType::Int64, HostType::Bigint),
                column("b", RemoteType::String, HostType::Text),
                column("d", RemoteType::Date, HostType::Date),
            ],
        )
    }

    #[test]
    fn test_parse_conditions() {
        let map = column_map();
        assert_eq!(parse_condition("a = -3", &map).unwrap(), Qualifier::eq("a", -3i64));
        assert_eq!(
            parse_condition("b IN ('x', 'y')", &map).unwrap(),
            Qualifier::in_list("b", vec![Value::Text("x".into()), Value::Text("y".into())])
        );
        assert_eq!(parse_condition("b IS NOT NULL", &map).unwrap(), Qualifier::is_not_null("b"));
        assert_eq!(
            parse_condition("d >= '2020-01-31'", &map).unwrap(),
            Qualifier::binary(
                "d",
                Operator::GtEq,
                Value::Date(NaiveDate::from_ymd_opt(2020, 1, 31).unwrap())
            )
        );
        assert!(parse_condition("zzz = 1", &map).is_err());
    }

    #[test]
    fn test_parse_sort_key() {
        assert_eq!(parse_sort_key("a").unwrap(), SortKey::asc("a"));
        assert_eq!(parse_sort_key("a:desc").unwrap(), SortKey::desc("a"));
        assert_eq!(
            parse_sort_key("a:asc:nulls_first").unwrap(),
            SortKey::asc("a").nulls_first(true)
        );
        assert!(parse_sort_key("a:sideways").is_err());
    }
}
