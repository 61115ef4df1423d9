//! Conversion of raw result cells into host rows.
//!
//! Results arrive in the REST encoding: every scalar is a JSON string,
//! timestamps are int64 microseconds since the epoch (or float seconds from
//! older endpoints), bytes are base64, records are `{"f": [{"v": ...}]}` and
//! repeated values are `[{"v": ...}]`. Records and arrays are handed to the
//! host as JSON text.

use crate::error::{FdwError, Result};
use crate::schema::types::{ColumnMode, HostType, RemoteType};
use crate::schema::{ColumnDef, ColumnMap};
use crate::storage::{RawRow, RemoteField};
use crate::value::Value;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use chrono::{DateTime, NaiveDate, NaiveDateTime, NaiveTime, Utc};
use serde_json::{Map, Value as Json};
use std::sync::Arc;

/// A host row.
///
/// Holds the requested columns, in request order, optionally followed by
/// columns fetched only so residual qualifiers can be evaluated. Only the
/// requested columns are visible through [`Row::values`].
#[derive(Debug, Clone, PartialEq)]
pub struct Row {
    names: Arc<[String]>,
    values: Vec<Value>,
    visible: usize,
}

impl Row {
    pub fn new(names: Arc<[String]>, values: Vec<Value>, visible: usize) -> Self {
        let visible = visible.min(values.len());
        Self { names, values, visible }
    }

    /// Values of the requested columns.
    pub fn values(&self) -> &[Value] {
        &self.values[..self.visible]
    }

    pub fn into_values(mut self) -> Vec<Value> {
        self.values.truncate(self.visible);
        self.values
    }

    pub fn column_names(&self) -> &[String] {
        &self.names[..self.visible]
    }

    /// Look up any fetched column, including residual-only ones.
    pub fn get(&self, column: &str) -> Option<&Value> {
        self.names
            .iter()
            .position(|name| name == column)
            .and_then(|i| self.values.get(i))
    }

    pub fn len(&self) -> usize {
        self.visible
    }

    pub fn is_empty(&self) -> bool {
        self.visible == 0
    }
}

/// Decodes raw rows of one translated query.
#[derive(Debug, Clone)]
pub struct RowMaterializer {
    names: Arc<[String]>,
    columns: Vec<ColumnDef>,
    visible: usize,
}

impl RowMaterializer {
    /// `select` is the remote select list; `requested` must be a prefix of
    /// it.
    pub fn new(column_map: &ColumnMap, select: &[String], requested: &[String]) -> Result<Self> {
        if requested.len() > select.len() || select[..requested.len()] != *requested {
            return Err(FdwError::translation(
                "requested columns must lead the select list",
            ));
        }
        let columns = select
            .iter()
            .map(|name| {
                column_map
                    .get(name)
                    .cloned()
                    .ok_or_else(|| FdwError::translation(format!("unknown column {}", name)))
            })
            .collect::<Result<Vec<_>>>()?;

        Ok(Self {
            names: select.to_vec().into(),
            columns,
            visible: requested.len(),
        })
    }

    pub fn materialize(&self, raw: &RawRow) -> Result<Row> {
        if raw.len() < self.columns.len() {
            return Err(FdwError::coercion(
                "*",
                format!("row has {} cells, expected {}", raw.len(), self.columns.len()),
            ));
        }
        let values = self
            .columns
            .iter()
            .zip(raw.iter())
            .map(|(column, cell)| decode_cell(cell, column))
            .collect::<Result<Vec<_>>>()?;
        Ok(Row::new(Arc::clone(&self.names), values, self.visible))
    }
}

/// One-shot form of [`RowMaterializer::materialize`].
pub fn materialize(raw: &RawRow, column_map: &ColumnMap, select: &[String], requested: &[String]) -> Result<Row> {
    RowMaterializer::new(column_map, select, requested)?.materialize(raw)
}

/// Coerce one raw cell to the column's host type.
pub fn decode_cell(cell: &Json, column: &ColumnDef) -> Result<Value> {
    if cell.is_null() {
        return Ok(Value::Null);
    }
    let remote = column.result_type();
    let fail = |message: String| FdwError::coercion(column.name.clone(), message);

    if column.mode == ColumnMode::Repeated || remote == RemoteType::Record {
        let json = nested_value(cell, &remote, column.mode, &column.fields).map_err(fail)?;
        return Ok(Value::Text(json.to_string()));
    }

    let text = scalar_text(cell).ok_or_else(|| fail(format!("expected a scalar, got {}", cell)))?;
    decode_scalar(&text, &remote, column.host_type).map_err(fail)
}

fn scalar_text(cell: &Json) -> Option<String> {
    match cell {
        Json::String(s) => Some(s.clone()),
        Json::Number(n) => Some(n.to_string()),
        Json::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}

fn decode_scalar(text: &str, remote: &RemoteType, host: HostType) -> std::result::Result<Value, String> {
    match host {
        HostType::Bigint => parse_integer(text).map(Value::Int8),
        HostType::DoublePrecision => parse_float(text).map(Value::Float8),
        HostType::Numeric => {
            if is_decimal(text) {
                Ok(Value::Numeric(text.to_string()))
            } else {
                Err(format!("invalid numeric '{}'", text))
            }
        }
        HostType::Boolean => match text.to_ascii_lowercase().as_str() {
            "true" => Ok(Value::Bool(true)),
            "false" => Ok(Value::Bool(false)),
            _ => Err(format!("invalid boolean '{}'", text)),
        },
        HostType::Bytea => match remote {
            RemoteType::Bytes => BASE64
                .decode(text)
                .map(Value::Bytea)
                .map_err(|e| format!("invalid base64: {}", e)),
            _ => Ok(Value::Bytea(text.as_bytes().to_vec())),
        },
        HostType::Date => match remote {
            RemoteType::Timestamp => parse_timestamp(text).map(|ts| Value::Date(ts.date_naive())),
            RemoteType::Datetime => parse_datetime(text).map(|dt| Value::Date(dt.date())),
            _ => parse_date(text).map(Value::Date),
        },
        HostType::Time => match remote {
            RemoteType::Timestamp => parse_timestamp(text).map(|ts| Value::Time(ts.time())),
            RemoteType::Datetime => parse_datetime(text).map(|dt| Value::Time(dt.time())),
            _ => parse_time(text).map(Value::Time),
        },
        HostType::Timestamp => match remote {
            RemoteType::Timestamp => parse_timestamp(text).map(|ts| Value::Timestamp(ts.naive_utc())),
            RemoteType::Date => parse_date(text).map(|d| Value::Timestamp(d.and_time(NaiveTime::MIN))),
            _ => parse_datetime(text).map(Value::Timestamp),
        },
        HostType::TimestampTz => match remote {
            RemoteType::Datetime => parse_datetime(text).map(|dt| Value::TimestampTz(dt.and_utc())),
            RemoteType::Date => {
                parse_date(text).map(|d| Value::TimestampTz(d.and_time(NaiveTime::MIN).and_utc()))
            }
            _ => parse_timestamp(text).map(Value::TimestampTz),
        },
        HostType::Text | HostType::Jsonb => match remote {
            RemoteType::Timestamp => {
                parse_timestamp(text).map(|ts| Value::Text(ts.format("%Y-%m-%d %H:%M:%S%.f UTC").to_string()))
            }
            _ => Ok(Value::Text(text.to_string())),
        },
    }
}

fn parse_integer(text: &str) -> std::result::Result<i64, String> {
    if let Ok(v) = text.parse::<i64>() {
        return Ok(v);
    }
    match text.parse::<f64>() {
        Ok(v) if v.fract() == 0.0 && v.abs() < 9.2e18 => Ok(v as i64),
        _ => Err(format!("invalid integer '{}'", text)),
    }
}

fn parse_float(text: &str) -> std::result::Result<f64, String> {
    text.parse::<f64>().map_err(|_| format!("invalid float '{}'", text))
}

pub(crate) fn is_decimal(text: &str) -> bool {
    let body = text.strip_prefix(&['-', '+'][..]).unwrap_or(text);
    let (mantissa, exponent) = match body.split_once(&['e', 'E'][..]) {
        Some((m, e)) => (m, Some(e)),
        None => (body, None),
    };
    let digits_ok = !mantissa.is_empty()
        && mantissa.chars().filter(|c| *c == '.').count() <= 1
        && mantissa.chars().any(|c| c.is_ascii_digit())
        && mantissa.chars().all(|c| c.is_ascii_digit() || c == '.');
    let exponent_ok = exponent.map_or(true, |e| {
        let e = e.strip_prefix(&['-', '+'][..]).unwrap_or(e);
        !e.is_empty() && e.chars().all(|c| c.is_ascii_digit())
    });
    digits_ok && exponent_ok
}

fn parse_date(text: &str) -> std::result::Result<NaiveDate, String> {
    NaiveDate::parse_from_str(text, "%Y-%m-%d").map_err(|_| format!("invalid date '{}'", text))
}

fn parse_time(text: &str) -> std::result::Result<NaiveTime, String> {
    NaiveTime::parse_from_str(text, "%H:%M:%S%.f").map_err(|_| format!("invalid time '{}'", text))
}

fn parse_datetime(text: &str) -> std::result::Result<NaiveDateTime, String> {
    NaiveDateTime::parse_from_str(text, "%Y-%m-%dT%H:%M:%S%.f")
        .or_else(|_| NaiveDateTime::parse_from_str(text, "%Y-%m-%d %H:%M:%S%.f"))
        .map_err(|_| format!("invalid datetime '{}'", text))
}

/// Integer microseconds, float seconds, or an RFC 3339 string.
fn parse_timestamp(text: &str) -> std::result::Result<DateTime<Utc>, String> {
    let invalid = || format!("invalid timestamp '{}'", text);
    if let Ok(micros) = text.parse::<i64>() {
        let secs = micros.div_euclid(1_000_000);
        let nanos = (micros.rem_euclid(1_000_000) * 1_000) as u32;
        return DateTime::from_timestamp(secs, nanos).ok_or_else(invalid);
    }
    if let Ok(seconds) = text.parse::<f64>() {
        if !seconds.is_finite() {
            return Err(invalid());
        }
        let secs = seconds.floor();
        let nanos = ((seconds - secs) * 1e9).round().min(999_999_999.0) as u32;
        return DateTime::from_timestamp(secs as i64, nanos).ok_or_else(invalid);
    }
    DateTime::parse_from_rfc3339(text)
        .map(|ts| ts.with_timezone(&Utc))
        .map_err(|_| invalid())
}

/// Render a nested (record or repeated) value as plain JSON.
fn nested_value(
    cell: &Json,
    remote: &RemoteType,
    mode: ColumnMode,
    fields: &[RemoteField],
) -> std::result::Result<Json, String> {
    if cell.is_null() {
        return Ok(Json::Null);
    }
    if mode == ColumnMode::Repeated {
        let items = cell
            .as_array()
            .ok_or_else(|| format!("expected an array, got {}", cell))?;
        return items
            .iter()
            .map(|item| {
                let inner = item.get("v").unwrap_or(item);
                nested_value(inner, remote, ColumnMode::Nullable, fields)
            })
            .collect::<std::result::Result<Vec<_>, _>>()
            .map(Json::Array);
    }
    if *remote == RemoteType::Record {
        let cells = cell
            .get("f")
            .and_then(Json::as_array)
            .ok_or_else(|| format!("expected a record, got {}", cell))?;
        let mut object = Map::new();
        for (i, entry) in cells.iter().enumerate() {
            let inner = entry.get("v").unwrap_or(entry);
            let (name, value) = match fields.get(i) {
                Some(field) => (
                    field.name.clone(),
                    nested_value(inner, &field.remote_type(), field.column_mode(), &field.fields)?,
                ),
                None => (format!("f{}", i), inner.clone()),
            };
            object.insert(name, value);
        }
        return Ok(Json::Object(object));
    }

    let text = match scalar_text(cell) {
        Some(text) => text,
        None => return Ok(cell.clone()),
    };
    Ok(match remote {
        RemoteType::Int64 => text.parse::<i64>().map(Json::from).unwrap_or(Json::String(text)),
        RemoteType::Float64 => match text.parse::<f64>() {
            Ok(v) if v.is_finite() => Json::from(v),
            _ => Json::String(text),
        },
        RemoteType::Bool => match text.as_str() {
            "true" => Json::Bool(true),
            "false" => Json::Bool(false),
            _ => Json::String(text),
        },
        RemoteType::Timestamp => match parse_timestamp(&text) {
            Ok(ts) => Json::String(ts.to_rfc3339()),
            Err(_) => Json::String(text),
        },
        _ => Json::String(text),
    })
}

/// Encode a value the way the REST API returns it.
pub fn encode_cell(value: &Value) -> Json {
    match value {
        Value::Null => Json::Null,
        Value::Bool(v) => Json::String(v.to_string()),
        Value::Int8(v) => Json::String(v.to_string()),
        Value::Float8(v) if v.is_nan() => Json::String("NaN".into()),
        Value::Float8(v) if v.is_infinite() => {
            Json::String(if *v > 0.0 { "Infinity" } else { "-Infinity" }.into())
        }
        Value::Float8(v) => Json::String(v.to_string()),
        Value::Numeric(v) | Value::Text(v) => Json::String(v.clone()),
        Value::Bytea(v) => Json::String(BASE64.encode(v)),
        Value::Date(v) => Json::String(v.format("%Y-%m-%d").to_string()),
        Value::Time(v) => Json::String(v.format("%H:%M:%S%.f").to_string()),
        Value::Timestamp(v) => Json::String(v.format("%Y-%m-%dT%H:%M:%S%.f").to_string()),
        Value::TimestampTz(v) => Json::String(v.timestamp_micros().to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::ColumnExpr;
    use serde_json::json;

    fn column(name: &str, remote: RemoteType, host: HostType) -> ColumnDef {
        ColumnDef {
            name: name.into(),
            remote_type: remote,
            mode: ColumnMode::Nullable,
            host_type: host,
            expr: ColumnExpr::Plain,
            fields: vec![],
        }
    }

    #[test]
    fn test_scalar_coercions() {
        let int = column("a", RemoteType::Int64, HostType::Bigint);
        assert_eq!(decode_cell(&json!("42"), &int).unwrap(), Value::Int8(42));
        assert_eq!(decode_cell(&Json::Null, &int).unwrap(), Value::Null);

        let ts = column("ts", RemoteType::Timestamp, HostType::TimestampTz);
        let decoded = decode_cell(&json!("1527379200000000"), &ts).unwrap();
        assert_eq!(decoded.to_string(), "2018-05-27 00:00:00+00:00");
        let from_float = decode_cell(&json!("1.5273792E9"), &ts).unwrap();
        assert_eq!(decoded, from_float);

        let bytes = column("b", RemoteType::Bytes, HostType::Bytea);
        assert_eq!(decode_cell(&json!("3q0="), &bytes).unwrap(), Value::Bytea(vec![0xde, 0xad]));
    }

    #[test]
    fn test_malformed_value_names_column() {
        let ts = column("created", RemoteType::Timestamp, HostType::TimestampTz);
        match decode_cell(&json!("yesterday"), &ts) {
            Err(FdwError::Coercion { column, .. }) => assert_eq!(column, "created"),
            other => panic!("expected coercion error, got {:?}", other),
        }
    }

    #[test]
    fn test_nested_values_become_json() {
        let mut record = column("rec", RemoteType::Record, HostType::Text);
        record.fields = vec![
            RemoteField::new("k", "STRING"),
            RemoteField::new("n", "INTEGER").repeated(),
        ];
        let cell = json!({"f": [{"v": "x"}, {"v": [{"v": "1"}, {"v": "2"}]}]});
        assert_eq!(
            decode_cell(&cell, &record).unwrap(),
            Value::Text(r#"{"k":"x","n":[1,2]}"#.into())
        );

        let mut tags = column("tags", RemoteType::String, HostType::Text);
        tags.mode = ColumnMode::Repeated;
        let cell = json!([{"v": "a"}, {"v": "b"}]);
        assert_eq!(decode_cell(&cell, &tags).unwrap(), Value::Text(r#"["a","b"]"#.into()));
    }

    #[test]
    fn test_encode_then_decode_timestamp_with_micros() {
        let ts = column("ts", RemoteType::Timestamp, HostType::TimestampTz);
        let value = Value::TimestampTz(
            DateTime::from_timestamp(1_700_000_000, 123_456_000).unwrap(),
        );
        assert_eq!(decode_cell(&encode_cell(&value), &ts).unwrap(), value);
    }

    #[test]
    fn test_row_hides_residual_columns() {
        let map = ColumnMap::new(
            "t",
            vec![
                column("a", RemoteType::Int64, HostType::Bigint),
                column("b", RemoteType::String, HostType::Text),
            ],
        );
        let select = vec!["a".to_string(), "b".to_string()];
        let row = materialize(&vec![json!("1"), json!("x")], &map, &select, &select[..1]).unwrap();
        assert_eq!(row.values(), &[Value::Int8(1)]);
        assert_eq!(row.get("b"), Some(&Value::Text("x".into())));
    }

    #[test]
    fn test_numeric_validation() {
        assert!(is_decimal("-12.50"));
        assert!(is_decimal("1E+10"));
        assert!(!is_decimal("1.2.3"));
        assert!(!is_decimal("abc"));
    }
}
