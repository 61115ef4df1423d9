//! Identifier, literal and query parameter rendering.
//!
//! Host values only ever reach generated SQL through this module.

use crate::config::SqlDialect;
use crate::row::is_decimal;
use crate::schema::types::RemoteType;
use crate::schema::TableId;
use crate::storage::{ParameterValue, QueryParameter};
use crate::value::Value;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;

/// Quote a column or alias name.
pub fn quote_identifier(name: &str, dialect: SqlDialect) -> String {
    match dialect {
        SqlDialect::Standard => format!("`{}`", escape(name, '`')),
        SqlDialect::Legacy => format!("[{}]", name.replace(']', "")),
    }
}

/// Fully qualified table reference.
pub fn table_reference(table: &TableId, dialect: SqlDialect) -> String {
    match dialect {
        SqlDialect::Standard => format!(
            "`{}.{}.{}`",
            escape(&table.project, '`'),
            escape(&table.dataset, '`'),
            escape(&table.table, '`')
        ),
        SqlDialect::Legacy => format!(
            "[{}:{}.{}]",
            table.project.replace(']', ""),
            table.dataset.replace(']', ""),
            table.table.replace(']', "")
        ),
    }
}

/// Single-quoted string literal with backslash escapes.
pub fn quote_string(value: &str) -> String {
    format!("'{}'", escape(value, '\''))
}

fn escape(value: &str, quote: char) -> String {
    let mut out = String::with_capacity(value.len());
    for c in value.chars() {
        match c {
            '\\' => out.push_str("\\\\"),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            '\t' => out.push_str("\\t"),
            c if c == quote => {
                out.push('\\');
                out.push(c);
            }
            c if c.is_control() => out.push_str(&format!("\\u{:04x}", c as u32)),
            c => out.push(c),
        }
    }
    out
}

/// Render `value` as a literal comparable with a column of type `target`.
///
/// Returns `None` when the dialect has no lossless literal for the value.
pub fn render_literal(value: &Value, target: &RemoteType, dialect: SqlDialect) -> Option<String> {
    match dialect {
        SqlDialect::Standard => standard_literal(value, target),
        SqlDialect::Legacy => legacy_literal(value),
    }
}

fn standard_literal(value: &Value, target: &RemoteType) -> Option<String> {
    Some(match value {
        Value::Null => "NULL".to_string(),
        Value::Bool(true) => "TRUE".to_string(),
        Value::Bool(false) => "FALSE".to_string(),
        Value::Int8(v) => v.to_string(),
        Value::Float8(v) if v.is_nan() => return None,
        Value::Float8(v) if v.is_infinite() => {
            format!("CAST('{}' AS FLOAT64)", if *v > 0.0 { "inf" } else { "-inf" })
        }
        Value::Float8(v) => format!("{:?}", v),
        Value::Numeric(v) if is_decimal(v) => match target {
            RemoteType::BigNumeric => format!("BIGNUMERIC '{}'", v),
            _ => format!("NUMERIC '{}'", v),
        },
        Value::Numeric(_) => return None,
        Value::Text(v) => quote_string(v),
        Value::Bytea(v) => format!("FROM_BASE64('{}')", BASE64.encode(v)),
        Value::Date(v) => format!("DATE '{}'", v.format("%Y-%m-%d")),
        Value::Time(v) => format!("TIME '{}'", v.format("%H:%M:%S%.6f")),
        Value::Timestamp(v) => format!("DATETIME '{}'", v.format("%Y-%m-%d %H:%M:%S%.6f")),
        Value::TimestampTz(v) => format!("TIMESTAMP '{}'", v.format("%Y-%m-%d %H:%M:%S%.6f+00:00")),
    })
}

fn legacy_literal(value: &Value) -> Option<String> {
    Some(match value {
        Value::Null => "NULL".to_string(),
        Value::Bool(true) => "true".to_string(),
        Value::Bool(false) => "false".to_string(),
        Value::Int8(v) => v.to_string(),
        Value::Float8(v) if v.is_finite() => format!("{:?}", v),
        Value::Numeric(v) if is_decimal(v) => v.clone(),
        Value::Text(v) => quote_string(v),
        _ => return None,
    })
}

/// Standard SQL type name and string form of a parameter value.
fn parameter_scalar(value: &Value) -> Option<(&'static str, Option<String>)> {
    Some(match value {
        Value::Null => return None,
        Value::Bool(v) => ("BOOL", Some(v.to_string())),
        Value::Int8(v) => ("INT64", Some(v.to_string())),
        Value::Float8(v) if !v.is_finite() => return None,
        Value::Float8(v) => ("FLOAT64", Some(format!("{:?}", v))),
        Value::Numeric(v) if is_decimal(v) => ("NUMERIC", Some(v.clone())),
        Value::Numeric(_) => return None,
        Value::Text(v) => ("STRING", Some(v.clone())),
        Value::Bytea(v) => ("BYTES", Some(BASE64.encode(v))),
        Value::Date(v) => ("DATE", Some(v.format("%Y-%m-%d").to_string())),
        Value::Time(v) => ("TIME", Some(v.format("%H:%M:%S%.6f").to_string())),
        Value::Timestamp(v) => ("DATETIME", Some(v.format("%Y-%m-%d %H:%M:%S%.6f").to_string())),
        Value::TimestampTz(v) => (
            "TIMESTAMP",
            Some(v.format("%Y-%m-%d %H:%M:%S%.6f+00:00").to_string()),
        ),
    })
}

/// Collects named parameters (`@p0`, `@p1`, ...) for one query.
#[derive(Debug, Default)]
pub struct ParameterSet {
    parameters: Vec<QueryParameter>,
}

impl ParameterSet {
    /// Bind a scalar; `None` when the value cannot be passed as a
    /// parameter and must be inlined instead.
    pub fn bind(&mut self, value: &Value) -> Option<String> {
        let (type_name, text) = parameter_scalar(value)?;
        Some(self.push(type_name, ParameterValue::Scalar(text)))
    }

    /// Bind a homogeneous list as an array parameter.
    pub fn bind_array(&mut self, values: &[Value]) -> Option<String> {
        let mut element_type = None;
        let mut items = Vec::with_capacity(values.len());
        for value in values {
            let (type_name, text) = parameter_scalar(value)?;
            if element_type.is_some_and(|t| t != type_name) {
                return None;
            }
            element_type = Some(type_name);
            items.push(text?);
        }
        Some(self.push(element_type?, ParameterValue::Array(items)))
    }

    fn push(&mut self, type_name: &str, value: ParameterValue) -> String {
        let name = format!("p{}", self.parameters.len());
        self.parameters.push(QueryParameter {
            name: name.clone(),
            type_name: type_name.to_string(),
            value,
        });
        format!("@{}", name)
    }

    pub fn into_parameters(self) -> Vec<QueryParameter> {
        self.parameters
    }
}
