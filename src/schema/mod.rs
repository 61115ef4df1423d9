//! Foreign table definitions and their resolved column maps.
//!
//! This module provides:
//! - `ForeignTableSpec`: what the host declared for a foreign table
//! - `ColumnMap`: the resolved remote/host typing of every column
//! - `SchemaIntrospector`: metadata lookup with a per-table cache
//! - `import`: bulk generation of foreign table definitions for a dataset

pub mod import;
pub mod introspector;
pub mod types;

pub use import::{ForeignTableDefinition, ImportOptions, ImportSelection};
pub use introspector::SchemaIntrospector;
pub use types::{ColumnMode, HostType, RemoteType, TYPE_MAPPING_VERSION};

use crate::config::{FdwConfig, SqlDialect, TableOptions};
use crate::error::{FdwError, Result};
use crate::storage::RemoteField;
use serde::{Deserialize, Serialize};
use sqlparser::ast::Statement;
use sqlparser::dialect::BigQueryDialect;
use sqlparser::parser::Parser;
use std::collections::hash_map::DefaultHasher;
use std::collections::HashMap;
use std::fmt;
use std::hash::{Hash, Hasher};

/// Pseudo column carrying `COUNT(*)` in grouping mode.
pub const COUNT_COLUMN: &str = "_fdw_count";

/// Pseudo column exposing the ingestion-time partition.
pub const PARTITION_COLUMN: &str = "partition_date";

/// Fully qualified remote table.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TableId {
    pub project: String,
    pub dataset: String,
    pub table: String,
}

impl TableId {
    pub fn new(project: impl Into<String>, dataset: impl Into<String>, table: impl Into<String>) -> Self {
        Self {
            project: project.into(),
            dataset: dataset.into(),
            table: table.into(),
        }
    }

    /// Accepts `dataset` or `project.dataset` for the dataset part, the way
    /// public datasets are usually referenced.
    pub fn from_parts(default_project: &str, dataset: &str, table: &str) -> Self {
        match dataset.split_once('.') {
            Some((project, dataset)) => Self::new(project, dataset, table),
            None => Self::new(default_project, dataset, table),
        }
    }
}

impl fmt::Display for TableId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.project, self.dataset, self.table)
    }
}

/// A column as declared on the host foreign table.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ColumnDeclaration {
    pub name: String,
    /// Declared host type; `None` takes the mapped remote type
    pub host_type: Option<HostType>,
}

impl ColumnDeclaration {
    pub fn new(name: impl Into<String>, host_type: HostType) -> Self {
        Self {
            name: name.into(),
            host_type: Some(host_type),
        }
    }

    pub fn untyped(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            host_type: None,
        }
    }
}

/// Everything the host declared about one foreign table.
#[derive(Debug, Clone)]
pub struct ForeignTableSpec {
    pub table: TableId,
    /// Declared columns; empty means every remote column
    pub columns: Vec<ColumnDeclaration>,
    /// Static query used instead of the remote table
    pub query_override: Option<String>,
    pub options: TableOptions,
}

impl ForeignTableSpec {
    pub fn new(table: TableId, columns: Vec<ColumnDeclaration>, options: TableOptions) -> Self {
        Self {
            table,
            columns,
            query_override: None,
            options,
        }
    }

    /// Replace the remote table with a static query.
    pub fn with_query_override(mut self, sql: impl Into<String>) -> Result<Self> {
        let sql = sql.into();
        validate_query_override(&sql, self.options.dialect)?;
        self.query_override = Some(sql);
        Ok(self)
    }

    /// Build a spec from the options of a host foreign table definition
    /// (`fdw_project`, `fdw_dataset`, `fdw_table`, `fdw_query` and the
    /// options understood by [`TableOptions`]).
    pub fn from_host_options(
        options: &HashMap<String, String>,
        columns: Vec<ColumnDeclaration>,
        config: &FdwConfig,
    ) -> Result<Self> {
        let table_options = TableOptions::from_options(options, &config.query)?;
        let project = options
            .get("fdw_project")
            .cloned()
            .unwrap_or_else(|| config.bigquery.project.clone());
        let dataset = options
            .get("fdw_dataset")
            .cloned()
            .unwrap_or_else(|| config.bigquery.dataset.clone());

        match (options.get("fdw_table"), options.get("fdw_query")) {
            (_, Some(query)) => {
                let table = options.get("fdw_table").cloned().unwrap_or_else(|| "_fdw_query".into());
                Self::new(TableId::from_parts(&project, &dataset, &table), columns, table_options)
                    .with_query_override(query.clone())
            }
            (Some(table), None) => {
                if dataset.is_empty() {
                    return Err(FdwError::Config("fdw_dataset is required".into()));
                }
                Ok(Self::new(TableId::from_parts(&project, &dataset, table), columns, table_options))
            }
            (None, None) => Err(FdwError::Config(
                "either fdw_table or fdw_query is required".into(),
            )),
        }
    }

    pub fn dialect(&self) -> SqlDialect {
        self.options.dialect
    }

    /// Cache key: the remote table plus everything that shapes its column
    /// map, so two host tables over the same remote table with different
    /// casting never share an entry.
    pub fn cache_key(&self) -> String {
        let mut hasher = DefaultHasher::new();
        self.columns.hash(&mut hasher);
        self.query_override.hash(&mut hasher);
        self.options.dialect.hash(&mut hasher);
        self.options.group_by.hash(&mut hasher);
        self.options.convert_tz.hash(&mut hasher);
        let mut casting: Vec<_> = self.options.casting.iter().collect();
        casting.sort_by(|a, b| a.0.cmp(b.0));
        casting.hash(&mut hasher);
        format!("{}#{:016x}", self.table, hasher.finish())
    }
}

fn validate_query_override(sql: &str, dialect: SqlDialect) -> Result<()> {
    if sql.trim().is_empty() {
        return Err(FdwError::Config("fdw_query must not be empty".into()));
    }
    // Legacy SQL table references ([project:dataset.table]) are not
    // parseable by the standard grammar.
    if dialect.is_legacy() {
        let head = sql.trim_start().to_ascii_uppercase();
        return if head.starts_with("SELECT") || head.starts_with("WITH") {
            Ok(())
        } else {
            Err(FdwError::Config("fdw_query must be a SELECT statement".into()))
        };
    }
    let statements = Parser::parse_sql(&BigQueryDialect {}, sql)
        .map_err(|e| FdwError::Config(format!("fdw_query does not parse: {}", e)))?;
    match statements.as_slice() {
        [Statement::Query(_)] => Ok(()),
        _ => Err(FdwError::Config(
            "fdw_query must be a single SELECT statement".into(),
        )),
    }
}

/// How a column is produced in the remote select list.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ColumnExpr {
    Plain,
    /// `CAST(col AS type)` from `fdw_casting`
    Cast(RemoteType),
    /// `DATE(col, tz)` or `DATETIME(col, tz)` from `fdw_convert_tz`
    ConvertTz { target: RemoteType, zone: String },
    /// Ingestion-time partition pseudo column
    PartitionDate,
    /// `COUNT(*)` (grouping) or `1` per row
    RowCount,
}

/// One resolved column.
#[derive(Debug, Clone)]
pub struct ColumnDef {
    pub name: String,
    /// Type of the underlying remote column
    pub remote_type: RemoteType,
    pub mode: ColumnMode,
    pub host_type: HostType,
    pub expr: ColumnExpr,
    /// Sub-fields of RECORD columns, used to serialize nested values
    pub fields: Vec<RemoteField>,
}

impl ColumnDef {
    /// Type of the value as it arrives in the result set.
    pub fn result_type(&self) -> RemoteType {
        match &self.expr {
            ColumnExpr::Plain => self.remote_type.clone(),
            ColumnExpr::Cast(target) => target.clone(),
            ColumnExpr::ConvertTz { target, .. } => target.clone(),
            ColumnExpr::PartitionDate => RemoteType::Date,
            ColumnExpr::RowCount => RemoteType::Int64,
        }
    }

    pub fn is_pseudo(&self) -> bool {
        matches!(self.expr, ColumnExpr::PartitionDate | ColumnExpr::RowCount)
    }

    /// Whether qualifiers on this column may be evaluated remotely.
    ///
    /// Filters on rewritten columns would compare the remote source value
    /// rather than the value the host sees, so only plain columns (and the
    /// partition pseudo column in standard SQL) qualify.
    pub fn accepts_filters(&self, dialect: SqlDialect) -> bool {
        if self.mode == ColumnMode::Repeated {
            return false;
        }
        match (&self.expr, dialect) {
            (ColumnExpr::Plain, SqlDialect::Standard) => self.remote_type.is_comparable(),
            (ColumnExpr::Plain, SqlDialect::Legacy) => self.remote_type.is_legacy_comparable(),
            (ColumnExpr::PartitionDate, SqlDialect::Standard) => true,
            _ => false,
        }
    }

    /// Whether the remote ordering of this column is well defined.
    pub fn is_sortable(&self, dialect: SqlDialect) -> bool {
        matches!(self.expr, ColumnExpr::RowCount) || self.accepts_filters(dialect)
    }
}

/// Resolved columns of one foreign table, in declaration order.
#[derive(Debug, Clone)]
pub struct ColumnMap {
    key: String,
    columns: Vec<ColumnDef>,
    index: HashMap<String, usize>,
}

impl ColumnMap {
    pub fn new(key: impl Into<String>, columns: Vec<ColumnDef>) -> Self {
        let index = columns
            .iter()
            .enumerate()
            .map(|(i, c)| (c.name.clone(), i))
            .collect();
        Self {
            key: key.into(),
            columns,
            index,
        }
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn get(&self, name: &str) -> Option<&ColumnDef> {
        self.index.get(name).map(|&i| &self.columns[i])
    }

    pub fn position(&self, name: &str) -> Option<usize> {
        self.index.get(name).copied()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.index.contains_key(name)
    }

    pub fn iter(&self) -> impl Iterator<Item = &ColumnDef> {
        self.columns.iter()
    }

    pub fn names(&self) -> Vec<String> {
        self.columns.iter().map(|c| c.name.clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.columns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.columns.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::QueryConfig;

    fn options(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect()
    }

    #[test]
    fn test_table_id_with_project_prefix() {
        let id = TableId::from_parts("mine", "bigquery-public-data.usa_names", "usa_1910_current");
        assert_eq!(id.project, "bigquery-public-data");
        assert_eq!(id.dataset, "usa_names");
        assert_eq!(id.to_string(), "bigquery-public-data.usa_names.usa_1910_current");
    }

    #[test]
    fn test_from_host_options_requires_table_or_query() {
        let config = FdwConfig::default();
        let err = ForeignTableSpec::from_host_options(&options(&[("fdw_dataset", "d")]), vec![], &config);
        assert!(matches!(err, Err(FdwError::Config(_))));

        let spec = ForeignTableSpec::from_host_options(
            &options(&[("fdw_dataset", "p.d"), ("fdw_table", "t")]),
            vec![],
            &config,
        )
        .unwrap();
        assert_eq!(spec.table, TableId::new("p", "d", "t"));
    }

    #[test]
    fn test_query_override_validation() {
        let spec = ForeignTableSpec::new(TableId::new("p", "d", "t"), vec![], TableOptions::default());
        assert!(spec
            .clone()
            .with_query_override("SELECT a, b FROM `p.d.t` WHERE a > 1")
            .is_ok());
        assert!(spec.clone().with_query_override("DROP TABLE `p.d.t`").is_err());
        assert!(spec.with_query_override("SELECT 1; SELECT 2").is_err());
    }

    #[test]
    fn test_cache_key_depends_on_casting() {
        let id = TableId::new("p", "d", "t");
        let plain = ForeignTableSpec::new(id.clone(), vec![], TableOptions::default());
        let casting = TableOptions::from_options(
            &options(&[("fdw_casting", r#"{"a": "STRING"}"#)]),
            &QueryConfig::default(),
        )
        .unwrap();
        let cast = ForeignTableSpec::new(id, vec![], casting);
        assert_ne!(plain.cache_key(), cast.cache_key());
        assert_eq!(plain.cache_key(), plain.clone().cache_key());
    }
}
