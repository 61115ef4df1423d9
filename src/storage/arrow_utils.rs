//! Conversion of materialized rows into Arrow record batches.
//!
//! Used by the command line tool to print scan results and by hosts that
//! prefer columnar handoff.

use crate::error::{FdwError, Result};
use crate::row::Row;
use crate::schema::types::HostType;
use crate::schema::ColumnMap;
use crate::value::Value;
use arrow::array::{
    ArrayRef, BinaryBuilder, BooleanBuilder, Date32Builder, Float64Builder, Int64Builder, StringBuilder,
    Time64MicrosecondBuilder, TimestampMicrosecondBuilder,
};
use arrow::datatypes::{DataType, Field, Schema, SchemaRef, TimeUnit};
use arrow::record_batch::RecordBatch;
use arrow::util::pretty::pretty_format_batches;
use chrono::{NaiveDate, Timelike};
use std::sync::Arc;

/// Arrow type carrying values of a host column.
pub fn arrow_type(host_type: HostType) -> DataType {
    match host_type {
        HostType::Bigint => DataType::Int64,
        HostType::DoublePrecision => DataType::Float64,
        HostType::Boolean => DataType::Boolean,
        HostType::Bytea => DataType::Binary,
        HostType::Date => DataType::Date32,
        HostType::Time => DataType::Time64(TimeUnit::Microsecond),
        HostType::Timestamp => DataType::Timestamp(TimeUnit::Microsecond, None),
        HostType::TimestampTz => DataType::Timestamp(TimeUnit::Microsecond, Some("UTC".into())),
        HostType::Numeric | HostType::Text | HostType::Jsonb => DataType::Utf8,
    }
}

/// Schema for the requested columns of a foreign table.
pub fn batch_schema(column_map: &ColumnMap, columns: &[String]) -> Result<SchemaRef> {
    let fields = columns
        .iter()
        .map(|name| {
            let column = column_map
                .get(name)
                .ok_or_else(|| FdwError::Arrow(format!("column {} is not part of the table", name)))?;
            Ok(Field::new(name, arrow_type(column.host_type), true))
        })
        .collect::<Result<Vec<_>>>()?;
    Ok(Arc::new(Schema::new(fields)))
}

fn mismatch(field: &Field, value: &Value) -> FdwError {
    FdwError::Arrow(format!(
        "column {} expects {}, got {}",
        field.name(),
        field.data_type(),
        value.type_name()
    ))
}

macro_rules! build_column {
    ($builder:expr, $rows:expr, $index:expr, $field:expr, $pattern:pat => $append:expr) => {{
        let mut builder = $builder;
        for row in $rows {
            match row.values().get($index).unwrap_or(&Value::Null) {
                Value::Null => builder.append_null(),
                $pattern => builder.append_value($append),
                other => return Err(mismatch($field, other)),
            }
        }
        Arc::new(builder.finish()) as ArrayRef
    }};
}

fn build_array(field: &Field, rows: &[Row], index: usize) -> Result<ArrayRef> {
    let capacity = rows.len();
    let epoch = NaiveDate::default();
    Ok(match field.data_type() {
        DataType::Int64 => build_column!(Int64Builder::with_capacity(capacity), rows, index, field,
            Value::Int8(v) => *v),
        DataType::Float64 => build_column!(Float64Builder::with_capacity(capacity), rows, index, field,
            Value::Float8(v) => *v),
        DataType::Boolean => build_column!(BooleanBuilder::with_capacity(capacity), rows, index, field,
            Value::Bool(v) => *v),
        DataType::Binary => build_column!(BinaryBuilder::new(), rows, index, field,
            Value::Bytea(v) => v),
        DataType::Date32 => build_column!(Date32Builder::with_capacity(capacity), rows, index, field,
            Value::Date(v) => v.signed_duration_since(epoch).num_days() as i32),
        DataType::Time64(_) => build_column!(Time64MicrosecondBuilder::with_capacity(capacity), rows, index, field,
            Value::Time(v) => v.num_seconds_from_midnight() as i64 * 1_000_000 + (v.nanosecond() / 1_000) as i64),
        DataType::Timestamp(_, None) => build_column!(TimestampMicrosecondBuilder::with_capacity(capacity), rows, index, field,
            Value::Timestamp(v) => v.and_utc().timestamp_micros()),
        DataType::Timestamp(_, Some(_)) => build_column!(
            TimestampMicrosecondBuilder::with_capacity(capacity).with_timezone("UTC"), rows, index, field,
            Value::TimestampTz(v) => v.timestamp_micros()),
        _ => {
            let mut builder = StringBuilder::new();
            for row in rows {
                match row.values().get(index).unwrap_or(&Value::Null) {
                    Value::Null => builder.append_null(),
                    value => builder.append_value(value.to_string()),
                }
            }
            Arc::new(builder.finish()) as ArrayRef
        }
    })
}

/// Build one record batch from rows whose visible values follow `schema`.
pub fn rows_to_batch(schema: SchemaRef, rows: &[Row]) -> Result<RecordBatch> {
    let columns = schema
        .fields()
        .iter()
        .enumerate()
        .map(|(index, field)| build_array(field, rows, index))
        .collect::<Result<Vec<_>>>()?;
    Ok(RecordBatch::try_new(schema, columns)?)
}

/// Render batches as an ASCII table.
pub fn format_batches(batches: &[RecordBatch]) -> Result<String> {
    Ok(pretty_format_batches(batches)?.to_string())
}
