//! Remote and host type systems and the mapping between them.
//!
//! The mapping table is a versioned artifact: any change to
//! [`TYPE_MAPPINGS`] must bump [`TYPE_MAPPING_VERSION`] so imported table
//! definitions can be traced back to the rules that produced them.

use crate::config::SqlDialect;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Version of [`TYPE_MAPPINGS`].
pub const TYPE_MAPPING_VERSION: u32 = 1;

/// BigQuery column types, folded across the legacy and standard spellings.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RemoteType {
    Int64,
    Float64,
    Numeric,
    BigNumeric,
    Bool,
    String,
    Bytes,
    Date,
    Datetime,
    Time,
    Timestamp,
    Geography,
    Json,
    Interval,
    Record,
    Unknown(String),
}

/// Column mode as reported by the table metadata.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub enum ColumnMode {
    #[default]
    Nullable,
    Required,
    Repeated,
}

/// Host column types the wrapper knows how to produce.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum HostType {
    Bigint,
    DoublePrecision,
    Numeric,
    Boolean,
    Text,
    Bytea,
    Date,
    Time,
    Timestamp,
    TimestampTz,
    Jsonb,
}

/// Remote type name (standard spelling) → host type. Total together with
/// the fallback in [`map_remote_type`].
pub const TYPE_MAPPINGS: &[(&str, HostType)] = &[
    ("INT64", HostType::Bigint),
    ("FLOAT64", HostType::DoublePrecision),
    ("NUMERIC", HostType::Numeric),
    ("BIGNUMERIC", HostType::Numeric),
    ("BOOL", HostType::Boolean),
    ("STRING", HostType::Text),
    ("BYTES", HostType::Bytea),
    ("DATE", HostType::Date),
    ("DATETIME", HostType::Timestamp),
    ("TIME", HostType::Time),
    ("TIMESTAMP", HostType::TimestampTz),
    ("GEOGRAPHY", HostType::Text),
    ("JSON", HostType::Text),
    ("INTERVAL", HostType::Text),
    ("RECORD", HostType::Text),
];

/// Map a remote column to the nearest host type.
///
/// Repeated columns and records are serialized to JSON text; anything the
/// table does not list falls back to text.
pub fn map_remote_type(remote: &RemoteType, mode: ColumnMode) -> HostType {
    if mode == ColumnMode::Repeated {
        return HostType::Text;
    }
    let name = remote.standard_name();
    TYPE_MAPPINGS
        .iter()
        .find(|(remote_name, _)| *remote_name == name)
        .map(|(_, host)| *host)
        .unwrap_or(HostType::Text)
}

impl RemoteType {
    /// Parse a type name in either dialect. Parameterized names such as
    /// `STRING(10)` or `NUMERIC(10, 2)` lose their parameters.
    pub fn parse(name: &str) -> Self {
        let trimmed = name.trim();
        let upper = trimmed.to_ascii_uppercase();
        if upper.starts_with("STRUCT") {
            return RemoteType::Record;
        }
        let base = upper.split('(').next().unwrap_or("").trim();
        match base {
            "INT64" | "INTEGER" | "INT" | "SMALLINT" | "BIGINT" | "TINYINT" | "BYTEINT" => {
                RemoteType::Int64
            }
            "FLOAT64" | "FLOAT" => RemoteType::Float64,
            "NUMERIC" | "DECIMAL" => RemoteType::Numeric,
            "BIGNUMERIC" | "BIGDECIMAL" => RemoteType::BigNumeric,
            "BOOL" | "BOOLEAN" => RemoteType::Bool,
            "STRING" => RemoteType::String,
            "BYTES" => RemoteType::Bytes,
            "DATE" => RemoteType::Date,
            "DATETIME" => RemoteType::Datetime,
            "TIME" => RemoteType::Time,
            "TIMESTAMP" => RemoteType::Timestamp,
            "GEOGRAPHY" => RemoteType::Geography,
            "JSON" => RemoteType::Json,
            "INTERVAL" => RemoteType::Interval,
            "RECORD" => RemoteType::Record,
            _ => RemoteType::Unknown(trimmed.to_string()),
        }
    }

    /// Parse an `INFORMATION_SCHEMA` data type, which spells repeated
    /// columns as `ARRAY<T>`.
    pub fn parse_with_mode(name: &str) -> (Self, ColumnMode) {
        let upper = name.trim().to_ascii_uppercase();
        if let Some(inner) = upper
            .strip_prefix("ARRAY<")
            .and_then(|rest| rest.strip_suffix('>'))
        {
            return (RemoteType::parse(inner), ColumnMode::Repeated);
        }
        (RemoteType::parse(name), ColumnMode::Nullable)
    }

    pub fn standard_name(&self) -> &str {
        match self {
            RemoteType::Int64 => "INT64",
            RemoteType::Float64 => "FLOAT64",
            RemoteType::Numeric => "NUMERIC",
            RemoteType::BigNumeric => "BIGNUMERIC",
            RemoteType::Bool => "BOOL",
            RemoteType::String => "STRING",
            RemoteType::Bytes => "BYTES",
            RemoteType::Date => "DATE",
            RemoteType::Datetime => "DATETIME",
            RemoteType::Time => "TIME",
            RemoteType::Timestamp => "TIMESTAMP",
            RemoteType::Geography => "GEOGRAPHY",
            RemoteType::Json => "JSON",
            RemoteType::Interval => "INTERVAL",
            RemoteType::Record => "RECORD",
            RemoteType::Unknown(name) => name,
        }
    }

    pub fn legacy_name(&self) -> &str {
        match self {
            RemoteType::Int64 => "INTEGER",
            RemoteType::Float64 => "FLOAT",
            RemoteType::Bool => "BOOLEAN",
            other => other.standard_name(),
        }
    }

    pub fn name_in(&self, dialect: SqlDialect) -> &str {
        match dialect {
            SqlDialect::Standard => self.standard_name(),
            SqlDialect::Legacy => self.legacy_name(),
        }
    }

    /// Whether the dialect can compare values of this type without loss.
    pub fn is_comparable(&self) -> bool {
        matches!(
            self,
            RemoteType::Int64
                | RemoteType::Float64
                | RemoteType::Numeric
                | RemoteType::BigNumeric
                | RemoteType::Bool
                | RemoteType::String
                | RemoteType::Bytes
                | RemoteType::Date
                | RemoteType::Datetime
                | RemoteType::Time
                | RemoteType::Timestamp
        )
    }

    /// Types whose literals the legacy dialect renders without loss.
    pub fn is_legacy_comparable(&self) -> bool {
        matches!(
            self,
            RemoteType::Int64
                | RemoteType::Float64
                | RemoteType::Numeric
                | RemoteType::Bool
                | RemoteType::String
        )
    }

    pub fn is_numeric(&self) -> bool {
        matches!(
            self,
            RemoteType::Int64 | RemoteType::Float64 | RemoteType::Numeric | RemoteType::BigNumeric
        )
    }
}

impl fmt::Display for RemoteType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.standard_name())
    }
}

/// Cast targets accepted by the `fdw_casting` table option.
pub fn parse_cast_target(name: &str, dialect: SqlDialect) -> Option<RemoteType> {
    let parsed = RemoteType::parse(name);
    let valid = match dialect {
        SqlDialect::Standard => matches!(
            parsed,
            RemoteType::Int64
                | RemoteType::Float64
                | RemoteType::Numeric
                | RemoteType::BigNumeric
                | RemoteType::Bool
                | RemoteType::String
                | RemoteType::Bytes
                | RemoteType::Date
                | RemoteType::Datetime
                | RemoteType::Time
                | RemoteType::Timestamp
        ),
        SqlDialect::Legacy => matches!(
            parsed,
            RemoteType::Int64
                | RemoteType::Float64
                | RemoteType::Bool
                | RemoteType::String
                | RemoteType::Bytes
                | RemoteType::Timestamp
        ),
    };
    valid.then_some(parsed)
}

impl HostType {
    /// Parse a host type name. Unrecognized names fall back to text.
    pub fn parse(name: &str) -> Self {
        let lower = name.trim().to_ascii_lowercase();
        let base = lower.split('(').next().unwrap_or("").trim();
        match base {
            "bigint" | "int8" | "integer" | "int" | "int4" | "smallint" | "int2" | "serial"
            | "bigserial" => HostType::Bigint,
            "double precision" | "float8" | "real" | "float4" | "float" => {
                HostType::DoublePrecision
            }
            "numeric" | "decimal" => HostType::Numeric,
            "boolean" | "bool" => HostType::Boolean,
            "bytea" => HostType::Bytea,
            "date" => HostType::Date,
            "time" | "time without time zone" => HostType::Time,
            "timestamp" | "timestamp without time zone" => HostType::Timestamp,
            "timestamptz" | "timestamp with time zone" => HostType::TimestampTz,
            "json" | "jsonb" => HostType::Jsonb,
            _ => HostType::Text,
        }
    }

    pub fn sql_name(&self) -> &'static str {
        match self {
            HostType::Bigint => "bigint",
            HostType::DoublePrecision => "double precision",
            HostType::Numeric => "numeric",
            HostType::Boolean => "boolean",
            HostType::Text => "text",
            HostType::Bytea => "bytea",
            HostType::Date => "date",
            HostType::Time => "time",
            HostType::Timestamp => "timestamp",
            HostType::TimestampTz => "timestamp with time zone",
            HostType::Jsonb => "jsonb",
        }
    }

    /// Remote type a declared host column is assumed to have when no
    /// metadata is available (static query overrides).
    pub fn default_remote_type(&self) -> RemoteType {
        match self {
            HostType::Bigint => RemoteType::Int64,
            HostType::DoublePrecision => RemoteType::Float64,
            HostType::Numeric => RemoteType::Numeric,
            HostType::Boolean => RemoteType::Bool,
            HostType::Text => RemoteType::String,
            HostType::Bytea => RemoteType::Bytes,
            HostType::Date => RemoteType::Date,
            HostType::Time => RemoteType::Time,
            HostType::Timestamp => RemoteType::Datetime,
            HostType::TimestampTz => RemoteType::Timestamp,
            HostType::Jsonb => RemoteType::Json,
        }
    }
}

impl fmt::Display for HostType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.sql_name())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mapping_table_is_total_over_known_types() {
        let known = [
            RemoteType::Int64,
            RemoteType::Float64,
            RemoteType::Numeric,
            RemoteType::BigNumeric,
            RemoteType::Bool,
            RemoteType::String,
            RemoteType::Bytes,
            RemoteType::Date,
            RemoteType::Datetime,
            RemoteType::Time,
            RemoteType::Timestamp,
            RemoteType::Geography,
            RemoteType::Json,
            RemoteType::Interval,
            RemoteType::Record,
        ];
        for remote in known {
            assert!(
                TYPE_MAPPINGS.iter().any(|(name, _)| *name == remote.standard_name()),
                "{} missing from mapping table",
                remote
            );
        }
        assert_eq!(TYPE_MAPPING_VERSION, 1);
    }

    #[test]
    fn test_core_mappings() {
        let nullable = ColumnMode::Nullable;
        assert_eq!(map_remote_type(&RemoteType::parse("INTEGER"), nullable), HostType::Bigint);
        assert_eq!(map_remote_type(&RemoteType::parse("FLOAT"), nullable), HostType::DoublePrecision);
        assert_eq!(map_remote_type(&RemoteType::parse("STRING"), nullable), HostType::Text);
        assert_eq!(map_remote_type(&RemoteType::parse("TIMESTAMP"), nullable), HostType::TimestampTz);
        assert_eq!(map_remote_type(&RemoteType::parse("RECORD"), nullable), HostType::Text);
        assert_eq!(map_remote_type(&RemoteType::parse("SOMETHING_NEW"), nullable), HostType::Text);
        assert_eq!(map_remote_type(&RemoteType::Int64, ColumnMode::Repeated), HostType::Text);
    }

    #[test]
    fn test_parse_parameterized_and_array_types() {
        assert_eq!(RemoteType::parse("STRING(10)"), RemoteType::String);
        assert_eq!(RemoteType::parse("NUMERIC(10, 2)"), RemoteType::Numeric);
        assert_eq!(RemoteType::parse("STRUCT<a INT64>"), RemoteType::Record);
        assert_eq!(
            RemoteType::parse_with_mode("ARRAY<STRING>"),
            (RemoteType::String, ColumnMode::Repeated)
        );
    }

    #[test]
    fn test_dialect_names() {
        assert_eq!(RemoteType::Int64.name_in(SqlDialect::Standard), "INT64");
        assert_eq!(RemoteType::Int64.name_in(SqlDialect::Legacy), "INTEGER");
    }

    #[test]
    fn test_cast_targets() {
        assert_eq!(parse_cast_target("STRING", SqlDialect::Standard), Some(RemoteType::String));
        assert_eq!(parse_cast_target("SOME_INVALID_TYPE", SqlDialect::Standard), None);
        assert_eq!(parse_cast_target("DATE", SqlDialect::Legacy), None);
    }

    #[test]
    fn test_host_type_fallback() {
        assert_eq!(HostType::parse("invalid_type"), HostType::Text);
        assert_eq!(HostType::parse("timestamp without time zone"), HostType::Timestamp);
        assert_eq!(HostType::parse("character varying(20)"), HostType::Text);
    }
}
