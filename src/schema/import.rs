//! Bulk generation of foreign table definitions for a remote dataset.
//!
//! Columns come from the dataset's `INFORMATION_SCHEMA.COLUMNS`. Host
//! limits on column count and identifier length are enforced according to
//! the configured [`LimitPolicy`].

use super::types::{map_remote_type, HostType, RemoteType, TYPE_MAPPING_VERSION};
use super::TableId;
use crate::config::LimitPolicy;
use crate::error::{FdwError, Result};
use crate::storage::DatasetColumn;
use std::collections::{BTreeMap, HashMap, HashSet};
use tracing::{debug, warn};

/// Maximum number of columns in a host table.
pub const MAX_COLUMNS: usize = 1600;

/// Maximum identifier length on the host, in bytes.
pub const MAX_IDENTIFIER_BYTES: usize = 63;

/// Which remote tables to import.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum ImportSelection {
    #[default]
    All,
    LimitTo(Vec<String>),
    Except(Vec<String>),
}

impl ImportSelection {
    pub fn includes(&self, table: &str) -> bool {
        match self {
            ImportSelection::All => true,
            ImportSelection::LimitTo(tables) => tables.iter().any(|t| t == table),
            ImportSelection::Except(tables) => !tables.iter().any(|t| t == table),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct ImportOptions {
    pub selection: ImportSelection,
    /// Tables with more than [`MAX_COLUMNS`] columns
    pub column_count: LimitPolicy,
    /// Column names longer than [`MAX_IDENTIFIER_BYTES`]
    pub column_names: LimitPolicy,
    /// Extra options copied onto every generated table
    pub table_options: BTreeMap<String, String>,
}

/// A generated foreign table.
#[derive(Debug, Clone, PartialEq)]
pub struct ForeignTableDefinition {
    pub table: TableId,
    pub columns: Vec<(String, HostType)>,
    pub options: BTreeMap<String, String>,
}

impl ForeignTableDefinition {
    /// `CREATE FOREIGN TABLE` statement for the host.
    pub fn to_sql(&self, server: &str, local_schema: &str) -> String {
        let columns: Vec<String> = self
            .columns
            .iter()
            .map(|(name, host_type)| format!("    {} {}", quote_host_identifier(name), host_type.sql_name()))
            .collect();
        let options: Vec<String> = self
            .options
            .iter()
            .map(|(k, v)| format!("{} '{}'", k, v.replace('\'', "''")))
            .collect();
        format!(
            "CREATE FOREIGN TABLE {}.{} (\n{}\n) SERVER {} OPTIONS ({});",
            quote_host_identifier(local_schema),
            quote_host_identifier(&self.table.table),
            columns.join(",\n"),
            quote_host_identifier(server),
            options.join(", ")
        )
    }
}

fn quote_host_identifier(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

/// Cut `name` to at most `max` bytes on a character boundary.
fn truncate_identifier(name: &str, max: usize) -> &str {
    if name.len() <= max {
        return name;
    }
    let mut end = max;
    while !name.is_char_boundary(end) {
        end -= 1;
    }
    &name[..end]
}

/// Group dataset columns into table definitions.
pub fn build_definitions(
    project: &str,
    dataset: &str,
    columns: Vec<DatasetColumn>,
    options: &ImportOptions,
) -> Result<Vec<ForeignTableDefinition>> {
    let mut tables: BTreeMap<String, Vec<DatasetColumn>> = BTreeMap::new();
    for column in columns {
        if options.selection.includes(&column.table_name) {
            tables.entry(column.table_name.clone()).or_default().push(column);
        }
    }

    let mut definitions = Vec::with_capacity(tables.len());
    for (table, mut columns) in tables {
        columns.sort_by_key(|c| c.ordinal_position);
        if let Some(definition) = build_definition(project, dataset, &table, columns, options)? {
            definitions.push(definition);
        }
    }
    debug!(tables = definitions.len(), mapping_version = TYPE_MAPPING_VERSION, "Built foreign table definitions");
    Ok(definitions)
}

fn build_definition(
    project: &str,
    dataset: &str,
    table: &str,
    columns: Vec<DatasetColumn>,
    options: &ImportOptions,
) -> Result<Option<ForeignTableDefinition>> {
    let mut named = Vec::with_capacity(columns.len());
    for column in columns {
        let mut name = column.column_name.clone();
        if name.len() > MAX_IDENTIFIER_BYTES {
            match options.column_names {
                LimitPolicy::Error => {
                    return Err(FdwError::schema(format!(
                        "column {}.{} exceeds {} bytes",
                        table, name, MAX_IDENTIFIER_BYTES
                    )))
                }
                LimitPolicy::Skip => {
                    warn!(table, column = %name, "Skipping column with a name too long for the host");
                    continue;
                }
                LimitPolicy::Trim => {
                    name = truncate_identifier(&name, MAX_IDENTIFIER_BYTES).to_string();
                }
            }
        }
        named.push((name, column));
    }

    // Every member of a colliding group goes; none of them can be told apart.
    let mut occurrences: HashMap<&str, usize> = HashMap::new();
    for (name, _) in &named {
        *occurrences.entry(name.as_str()).or_default() += 1;
    }
    let colliding: HashSet<String> = occurrences
        .into_iter()
        .filter(|(_, count)| *count > 1)
        .map(|(name, _)| name.to_string())
        .collect();

    let mut mapped = Vec::with_capacity(named.len());
    for (name, column) in named {
        if colliding.contains(&name) {
            warn!(table, column = %column.column_name, "Dropping column whose truncated name collides");
            continue;
        }
        let (remote, mode) = RemoteType::parse_with_mode(&column.data_type);
        mapped.push((name, map_remote_type(&remote, mode)));
    }

    if mapped.len() > MAX_COLUMNS {
        match options.column_count {
            LimitPolicy::Error => {
                return Err(FdwError::schema(format!(
                    "table {} has {} columns, more than {}",
                    table,
                    mapped.len(),
                    MAX_COLUMNS
                )))
            }
            LimitPolicy::Skip => {
                warn!(table, columns = mapped.len(), "Skipping table with too many columns");
                return Ok(None);
            }
            LimitPolicy::Trim => mapped.truncate(MAX_COLUMNS),
        }
    }

    if mapped.is_empty() {
        return Ok(None);
    }

    let mut table_options = options.table_options.clone();
    table_options.insert("fdw_dataset".into(), format!("{}.{}", project, dataset));
    table_options.insert("fdw_table".into(), table.to_string());

    Ok(Some(ForeignTableDefinition {
        table: TableId::new(project, dataset, table),
        columns: mapped,
        options: table_options,
    }))
}
