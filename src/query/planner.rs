//! Translation of scan requests into remote SQL.
//!
//! Every qualifier is either embedded in the generated query (pushed) or
//! handed back to the host (residual); no qualifier is dropped. A LIMIT is
//! only pushed when no residual qualifier could discard rows after it.

use super::literal::{quote_identifier, render_literal, table_reference, ParameterSet};
use super::{Operand, Operator, Qualifier, ScanRequest, SortKey, TranslatedQuery};
use crate::config::SqlDialect;
use crate::error::{FdwError, Result};
use crate::schema::types::RemoteType;
use crate::schema::{ColumnDef, ColumnExpr, ColumnMap, ForeignTableSpec, COUNT_COLUMN};
use crate::value::Value;
use std::collections::HashSet;
use tracing::{debug, instrument};

/// Alias of the constant selected for an empty projection.
pub const EMPTY_PROJECTION_ALIAS: &str = "_fdw_row";

/// Alias of a static query override in the FROM clause.
const OVERRIDE_ALIAS: &str = "_fdw_src";

/// Translate `request` against a described table.
#[instrument(skip_all, fields(table = %spec.table, columns = request.columns.len(), quals = request.qualifiers.len()))]
pub fn translate(spec: &ForeignTableSpec, columns: &ColumnMap, request: &ScanRequest) -> Result<TranslatedQuery> {
    let dialect = spec.dialect();
    let mut planner = Planner {
        spec,
        columns,
        dialect,
        parameters: (spec.options.parameterized && dialect == SqlDialect::Standard)
            .then(ParameterSet::default),
    };
    planner.translate(request)
}

struct Planner<'a> {
    spec: &'a ForeignTableSpec,
    columns: &'a ColumnMap,
    dialect: SqlDialect,
    /// Present in parameterized mode
    parameters: Option<ParameterSet>,
}

impl<'a> Planner<'a> {
    fn translate(&mut self, request: &ScanRequest) -> Result<TranslatedQuery> {
        let mut select: Vec<String> = Vec::with_capacity(request.columns.len());
        let mut seen = HashSet::new();
        for name in &request.columns {
            self.column(name)?;
            if !seen.insert(name.as_str()) {
                return Err(FdwError::translation(format!("column {} requested twice", name)));
            }
            select.push(name.clone());
        }
        let requested = select.len();

        let grouped = self.spec.options.group_by && seen.contains(COUNT_COLUMN);

        let mut conditions = Vec::new();
        let mut pushed = Vec::new();
        let mut residual = Vec::new();
        for original in &request.qualifiers {
            let column = self.column(&original.column)?;
            let mut qualifier = original.clone();
            let condition = if qualifier.local_only {
                None
            } else {
                self.condition(&qualifier, column)
            };
            match condition {
                Some(condition) => {
                    qualifier.pushable = true;
                    conditions.push(condition);
                    pushed.push(qualifier);
                }
                None => {
                    qualifier.pushable = false;
                    if seen.insert(original.column.as_str()) {
                        select.push(original.column.clone());
                    }
                    residual.push(qualifier);
                }
            }
        }

        let mut sql = String::from("SELECT ");
        if select.is_empty() {
            sql.push_str(&format!("1 AS {}", self.ident(EMPTY_PROJECTION_ALIAS)));
        } else {
            let items = select
                .iter()
                .map(|name| self.column(name).map(|column| self.select_item(column, grouped)))
                .collect::<Result<Vec<_>>>()?;
            sql.push_str(&items.join(", "));
        }

        sql.push_str(" FROM ");
        match &self.spec.query_override {
            // Own lines, so a trailing `--` comment ends with the override.
            Some(query) => sql.push_str(&format!(
                "(\n{}\n) AS {}",
                query.trim().trim_end_matches(';'),
                OVERRIDE_ALIAS
            )),
            None => sql.push_str(&table_reference(&self.spec.table, self.dialect)),
        }

        if !conditions.is_empty() {
            sql.push_str(" WHERE ");
            sql.push_str(&conditions.join(" AND "));
        }

        if grouped {
            let keys: Vec<String> = select
                .iter()
                .filter(|name| name.as_str() != COUNT_COLUMN)
                .map(|name| self.ident(name))
                .collect();
            if !keys.is_empty() {
                sql.push_str(" GROUP BY ");
                sql.push_str(&keys.join(", "));
            }
        }

        let order_by = self.order_by(&request.sort, &select, grouped)?;
        let sort_pushed = order_by.is_some();
        if let Some(order_by) = order_by {
            sql.push_str(" ORDER BY ");
            sql.push_str(&order_by);
        }

        let limit = match request.limit {
            Some(limit) if residual.is_empty() && (request.sort.is_empty() || sort_pushed) => {
                sql.push_str(&format!(" LIMIT {}", limit));
                Some(limit)
            }
            _ => None,
        };

        debug!(
            pushed = pushed.len(),
            residual = residual.len(),
            sort_pushed,
            limit_pushed = limit.is_some(),
            "Translated scan request"
        );

        Ok(TranslatedQuery {
            sql,
            dialect: self.dialect,
            columns: select,
            requested,
            pushed,
            residual,
            parameters: self
                .parameters
                .take()
                .map(ParameterSet::into_parameters)
                .unwrap_or_default(),
            limit,
            sort_pushed,
            grouped,
        })
    }

    fn column(&self, name: &str) -> Result<&'a ColumnDef> {
        self.columns
            .get(name)
            .ok_or_else(|| FdwError::translation(format!("column {} is not part of {}", name, self.spec.table)))
    }

    fn ident(&self, name: &str) -> String {
        quote_identifier(name, self.dialect)
    }

    /// Expression referring to the column's value in WHERE and ORDER BY.
    fn filter_expr(&self, column: &ColumnDef) -> String {
        match (&column.expr, self.dialect) {
            (ColumnExpr::PartitionDate, SqlDialect::Standard) => "_PARTITIONDATE".to_string(),
            (ColumnExpr::PartitionDate, SqlDialect::Legacy) => "DATE(_PARTITIONTIME)".to_string(),
            _ => self.ident(&column.name),
        }
    }

    fn select_item(&self, column: &ColumnDef, grouped: bool) -> String {
        let name = self.ident(&column.name);
        match &column.expr {
            ColumnExpr::Plain => name,
            ColumnExpr::Cast(target) => {
                format!("CAST({} AS {}) AS {}", name, target.name_in(self.dialect), name)
            }
            ColumnExpr::ConvertTz { target, zone } => {
                let function = if *target == RemoteType::Date { "DATE" } else { "DATETIME" };
                format!("{}({}, '{}') AS {}", function, name, zone, name)
            }
            ColumnExpr::PartitionDate => format!("{} AS {}", self.filter_expr(column), name),
            ColumnExpr::RowCount if grouped => format!("COUNT(*) AS {}", name),
            ColumnExpr::RowCount => format!("1 AS {}", name),
        }
    }

    /// Render a pushable qualifier, or `None` when it must stay on the host.
    fn condition(&mut self, qualifier: &Qualifier, column: &ColumnDef) -> Option<String> {
        if !column.accepts_filters(self.dialect) {
            return None;
        }
        let target = column.result_type();
        let expr = self.filter_expr(column);

        match (&qualifier.operator, &qualifier.operand) {
            (Operator::IsNull, _) => Some(format!("{} IS NULL", expr)),
            (Operator::IsNotNull, _) => Some(format!("{} IS NOT NULL", expr)),
            (op @ (Operator::Eq | Operator::NotEq | Operator::Lt | Operator::LtEq | Operator::Gt | Operator::GtEq), Operand::Value(value)) => {
                if !self.operand_fits(value, &target) {
                    return None;
                }
                let operand = self.operand(value, &target)?;
                Some(format!("{} {} {}", expr, op.symbol(), operand))
            }
            (op @ (Operator::Like | Operator::NotLike), Operand::Value(value @ Value::Text(_))) => {
                if target != RemoteType::String {
                    return None;
                }
                let operand = self.operand(value, &target)?;
                Some(format!("{} {} {}", expr, op.symbol(), operand))
            }
            (op @ (Operator::In | Operator::NotIn), Operand::List(values)) => {
                if values.is_empty() || !values.iter().all(|v| self.operand_fits(v, &target)) {
                    return None;
                }
                if let Some(parameters) = self.parameters.as_mut() {
                    if let Some(placeholder) = parameters.bind_array(values) {
                        return Some(format!("{} {} UNNEST({})", expr, op.symbol(), placeholder));
                    }
                }
                let literals = values
                    .iter()
                    .map(|v| render_literal(v, &target, self.dialect))
                    .collect::<Option<Vec<_>>>()?;
                Some(format!("{} {} ({})", expr, op.symbol(), literals.join(", ")))
            }
            _ => None,
        }
    }

    fn operand(&mut self, value: &Value, target: &RemoteType) -> Option<String> {
        if let Some(parameters) = self.parameters.as_mut() {
            if let Some(placeholder) = parameters.bind(value) {
                return Some(placeholder);
            }
        }
        render_literal(value, target, self.dialect)
    }

    /// Whether comparing a column of `target` with `value` remotely gives
    /// the same answer as on the host.
    fn operand_fits(&self, value: &Value, target: &RemoteType) -> bool {
        let fits = match value {
            Value::Int8(_) | Value::Numeric(_) => target.is_numeric(),
            Value::Float8(v) => !v.is_nan() && target.is_numeric(),
            Value::Text(_) => *target == RemoteType::String,
            Value::Bool(_) => *target == RemoteType::Bool,
            Value::Bytea(_) => *target == RemoteType::Bytes,
            Value::Date(_) => *target == RemoteType::Date,
            Value::Time(_) => *target == RemoteType::Time,
            Value::Timestamp(_) => *target == RemoteType::Datetime,
            Value::TimestampTz(_) => *target == RemoteType::Timestamp,
            Value::Null => false,
        };
        match self.dialect {
            SqlDialect::Standard => fits,
            SqlDialect::Legacy => {
                fits && matches!(
                    value,
                    Value::Int8(_) | Value::Float8(_) | Value::Numeric(_) | Value::Text(_) | Value::Bool(_)
                )
            }
        }
    }

    /// ORDER BY clause when every key can be pushed.
    fn order_by(&self, keys: &[SortKey], select: &[String], grouped: bool) -> Result<Option<String>> {
        if keys.is_empty() {
            return Ok(None);
        }
        let mut seen = HashSet::new();
        let mut items = Vec::with_capacity(keys.len());
        for key in keys {
            let column = self.column(&key.column)?;
            if !seen.insert(key.column.as_str()) || !column.is_sortable(self.dialect) {
                return Ok(None);
            }
            if grouped && !select.contains(&key.column) {
                return Ok(None);
            }
            let expr = match column.expr {
                ColumnExpr::RowCount => self.ident(&column.name),
                _ if grouped => self.ident(&column.name),
                _ => self.filter_expr(column),
            };
            let direction = if key.descending { "DESC" } else { "ASC" };
            match self.dialect {
                SqlDialect::Standard => {
                    let nulls = if key.nulls_first { "NULLS FIRST" } else { "NULLS LAST" };
                    items.push(format!("{} {} {}", expr, direction, nulls));
                }
                SqlDialect::Legacy => {
                    // Legacy SQL sorts NULLs first ascending and last descending.
                    if key.nulls_first == key.descending {
                        return Ok(None);
                    }
                    items.push(format!("{} {}", expr, direction));
                }
            }
        }
        Ok(Some(items.join(", ")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::TableOptions;
    use crate::schema::types::{ColumnMode, HostType};
    use crate::schema::TableId;

    fn def(name: &str, remote: RemoteType) -> ColumnDef {
        ColumnDef {
            name: name.into(),
            host_type: crate::schema::types::map_remote_type(&remote, ColumnMode::Nullable),
            remote_type: remote,
            mode: ColumnMode::Nullable,
            expr: ColumnExpr::Plain,
            fields: vec![],
        }
    }

    fn table() -> (ForeignTableSpec, ColumnMap) {
        let spec = ForeignTableSpec::new(TableId::new("p", "d", "t"), vec![], TableOptions::default());
        let map = ColumnMap::new(
            spec.cache_key(),
            vec![def("a", RemoteType::Int64), def("b", RemoteType::String)],
        );
        (spec, map)
    }

    #[test]
    fn test_projection_never_selects_star() {
        let (spec, map) = table();
        let query = translate(&spec, &map, &ScanRequest::new(["b"])).unwrap();
        assert_eq!(query.sql, "SELECT `b` FROM `p.d.t`");

        let query = translate(&spec, &map, &ScanRequest::new(Vec::<String>::new())).unwrap();
        assert_eq!(query.sql, "SELECT 1 AS `_fdw_row` FROM `p.d.t`");
        assert!(query.columns.is_empty());
    }

    #[test]
    fn test_unknown_and_duplicate_columns_are_contract_violations() {
        let (spec, map) = table();
        assert!(matches!(
            translate(&spec, &map, &ScanRequest::new(["zzz"])),
            Err(FdwError::Translation(_))
        ));
        assert!(matches!(
            translate(&spec, &map, &ScanRequest::new(["a", "a"])),
            Err(FdwError::Translation(_))
        ));
    }

    #[test]
    fn test_mismatched_operand_stays_residual() {
        let (spec, map) = table();
        let request = ScanRequest::new(["a"]).with_qualifier(Qualifier::eq("a", "not a number"));
        let query = translate(&spec, &map, &request).unwrap();
        assert_eq!(query.residual.len(), 1);
        assert!(!query.sql.contains("WHERE"));
    }

    #[test]
    fn test_legacy_sort_requires_default_null_order() {
        let (mut spec, map) = table();
        spec.options.dialect = SqlDialect::Legacy;
        let host_default = ScanRequest::new(["a"]).with_sort(SortKey::asc("a"));
        assert!(!translate(&spec, &map, &host_default).unwrap().sort_pushed);

        let engine_default = ScanRequest::new(["a"]).with_sort(SortKey::asc("a").nulls_first(true));
        let query = translate(&spec, &map, &engine_default).unwrap();
        assert_eq!(query.sql, "SELECT [a] FROM [p:d.t] ORDER BY [a] ASC");
    }

    #[test]
    fn test_host_types_do_not_affect_sql() {
        let (spec, map) = table();
        let mut columns: Vec<ColumnDef> = map.iter().cloned().collect();
        columns[0].host_type = HostType::Text;
        let map = ColumnMap::new(spec.cache_key(), columns);
        let query = translate(&spec, &map, &ScanRequest::new(["a"]).with_qualifier(Qualifier::eq("a", 1))).unwrap();
        assert_eq!(query.sql, "SELECT `a` FROM `p.d.t` WHERE `a` = 1");
    }
}
