//! Remote schema discovery with a per-table cache.

use super::types::{map_remote_type, ColumnMode, HostType, RemoteType};
use super::{ColumnDef, ColumnExpr, ColumnMap, ForeignTableSpec, COUNT_COLUMN, PARTITION_COLUMN};
use crate::auth::Credential;
use crate::config::SqlDialect;
use crate::error::{FdwError, Result};
use crate::storage::{RemoteField, WarehouseClient};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::OnceCell;
use tracing::{debug, info, instrument};

type CacheSlot = Arc<OnceCell<Arc<ColumnMap>>>;

/// Describes foreign tables and caches the result for the process
/// lifetime. Concurrent first use of a table performs one metadata lookup.
pub struct SchemaIntrospector {
    client: Arc<dyn WarehouseClient>,
    cache: Mutex<HashMap<String, CacheSlot>>,
}

impl SchemaIntrospector {
    pub fn new(client: Arc<dyn WarehouseClient>) -> Self {
        Self {
            client,
            cache: Mutex::new(HashMap::new()),
        }
    }

    #[instrument(skip_all, fields(table = %spec.table))]
    pub async fn describe(&self, spec: &ForeignTableSpec, credential: &Credential) -> Result<Arc<ColumnMap>> {
        let key = spec.cache_key();
        let slot = Arc::clone(self.cache.lock().entry(key.clone()).or_default());

        let map = slot
            .get_or_try_init(|| async {
                let map = self.load(spec, credential, &key).await?;
                info!(columns = map.len(), "Described foreign table");
                Ok::<_, FdwError>(Arc::new(map))
            })
            .await?;
        Ok(Arc::clone(map))
    }

    /// Cached column map, without any remote call.
    pub fn cached(&self, spec: &ForeignTableSpec) -> Option<Arc<ColumnMap>> {
        self.cache
            .lock()
            .get(&spec.cache_key())
            .and_then(|slot| slot.get().cloned())
    }

    pub fn cached_tables(&self) -> usize {
        self.cache.lock().values().filter(|slot| slot.initialized()).count()
    }

    async fn load(&self, spec: &ForeignTableSpec, credential: &Credential, key: &str) -> Result<ColumnMap> {
        let fields = match &spec.query_override {
            Some(_) => declared_fields(spec)?,
            None => {
                debug!("Fetching remote table metadata");
                match self.client.get_table(credential, &spec.table).await {
                    Ok(table) => table.fields,
                    Err(e @ (FdwError::Schema(_) | FdwError::Auth(_))) => return Err(e),
                    Err(e) => {
                        return Err(FdwError::schema(format!(
                            "metadata lookup for {} failed: {}",
                            spec.table, e
                        )))
                    }
                }
            }
        };
        build_column_map(spec, &fields, key)
    }
}

/// Fields of a static query override, taken from the declared columns.
fn declared_fields(spec: &ForeignTableSpec) -> Result<Vec<RemoteField>> {
    if spec.columns.is_empty() {
        return Err(FdwError::schema(
            "a table defined by fdw_query must declare its columns",
        ));
    }
    Ok(spec
        .columns
        .iter()
        .filter(|c| c.name != COUNT_COLUMN && c.name != PARTITION_COLUMN)
        .map(|c| {
            let remote = c.host_type.unwrap_or(HostType::Text).default_remote_type();
            RemoteField::new(c.name.clone(), remote.standard_name())
        })
        .collect())
}

fn find_field<'a>(fields: &'a [RemoteField], name: &str) -> Option<&'a RemoteField> {
    fields
        .iter()
        .find(|f| f.name == name)
        .or_else(|| fields.iter().find(|f| f.name.eq_ignore_ascii_case(name)))
}

/// Resolve declared columns against remote fields.
pub fn build_column_map(spec: &ForeignTableSpec, fields: &[RemoteField], key: &str) -> Result<ColumnMap> {
    let declared: Vec<(String, Option<HostType>)> = if spec.columns.is_empty() {
        fields.iter().map(|f| (f.name.clone(), None)).collect()
    } else {
        spec.columns.iter().map(|c| (c.name.clone(), c.host_type)).collect()
    };

    let mut columns = Vec::with_capacity(declared.len());
    for (name, host_type) in declared {
        let field = find_field(fields, &name);
        let column = if let Some(field) = field {
            resolve_field(spec, name, host_type, field)
        } else if name == COUNT_COLUMN {
            ColumnDef {
                name,
                remote_type: RemoteType::Int64,
                mode: ColumnMode::Required,
                host_type: host_type.unwrap_or(HostType::Bigint),
                expr: ColumnExpr::RowCount,
                fields: vec![],
            }
        } else if name == PARTITION_COLUMN {
            ColumnDef {
                name,
                remote_type: RemoteType::Date,
                mode: ColumnMode::Nullable,
                host_type: host_type.unwrap_or(HostType::Date),
                expr: ColumnExpr::PartitionDate,
                fields: vec![],
            }
        } else {
            return Err(FdwError::schema(format!(
                "column {} does not exist in {}",
                name, spec.table
            )));
        };
        columns.push(column);
    }
    Ok(ColumnMap::new(key, columns))
}

fn resolve_field(spec: &ForeignTableSpec, name: String, declared: Option<HostType>, field: &RemoteField) -> ColumnDef {
    let remote_type = field.remote_type();
    let mode = field.column_mode();
    let options = &spec.options;

    let cast = options
        .casting
        .get(&name)
        .filter(|_| mode != ColumnMode::Repeated)
        .cloned();
    let expr = match (cast, &options.convert_tz) {
        (Some(target), _) => ColumnExpr::Cast(target),
        (None, Some(zone))
            if options.dialect == SqlDialect::Standard
                && remote_type == RemoteType::Timestamp
                && mode != ColumnMode::Repeated
                && matches!(declared, Some(HostType::Date | HostType::Timestamp)) =>
        {
            let target = if declared == Some(HostType::Date) {
                RemoteType::Date
            } else {
                RemoteType::Datetime
            };
            ColumnExpr::ConvertTz {
                target,
                zone: zone.clone(),
            }
        }
        _ => ColumnExpr::Plain,
    };

    let mapped = match &expr {
        ColumnExpr::Cast(target) => map_remote_type(target, mode),
        _ => map_remote_type(&remote_type, mode),
    };

    ColumnDef {
        name,
        remote_type,
        mode,
        host_type: declared.unwrap_or(mapped),
        expr,
        fields: field.fields.clone(),
    }
}
