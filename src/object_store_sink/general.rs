use crate::record::FieldValue;
use crate::sink::SinkError;
use arrow::array::{
    ArrayRef, BinaryArray, BooleanArray, Float64Array, Int64Array, RecordBatch, StringArray,
    TimestampMicrosecondArray, UInt64Array,
};
use arrow::datatypes::{DataType, Field, Schema, SchemaRef, TimeUnit};
use std::sync::Arc;

/// Types which know their arrow schema and how to turn themselves into a matching row
pub trait ToArrow {
    fn schema() -> Schema;

    fn to_fields(&self) -> Vec<FieldValue>;
}

/// whether rows of this column type can be built from [`FieldValue`]s
pub fn is_supported(data_type: &DataType) -> bool {
    matches!(
        data_type,
        DataType::Boolean
            | DataType::Int64
            | DataType::UInt64
            | DataType::Float64
            | DataType::Utf8
            | DataType::Binary
            | DataType::Timestamp(TimeUnit::Microsecond, _)
    )
}

/// checks a single row against the schema before it is accepted into a batch
pub fn validate_row(schema: &Schema, fields: &[FieldValue]) -> Result<(), SinkError> {
    if fields.len() != schema.fields().len() {
        return Err(SinkError::SchemaMismatch(format!(
            "expected {} fields, got {}",
            schema.fields().len(),
            fields.len()
        )));
    }
    for (field, value) in schema.fields().iter().zip(fields) {
        if !matches_column(field, value) {
            return Err(SinkError::SchemaMismatch(format!(
                "column {} of type {} (nullable: {}) can not hold a {} value",
                field.name(),
                field.data_type(),
                field.is_nullable(),
                value.type_name()
            )));
        }
    }
    Ok(())
}

fn matches_column(field: &Field, value: &FieldValue) -> bool {
    match (value, field.data_type()) {
        (FieldValue::Null, _) => field.is_nullable(),
        (FieldValue::Bool(_), DataType::Boolean) => true,
        (FieldValue::Int64(_), DataType::Int64) => true,
        (FieldValue::UInt64(_), DataType::UInt64) => true,
        (FieldValue::Float64(_), DataType::Float64) => true,
        (FieldValue::Utf8(_), DataType::Utf8) => true,
        (FieldValue::Bytes(_), DataType::Binary) => true,
        (FieldValue::Timestamp(_), DataType::Timestamp(TimeUnit::Microsecond, _)) => true,
        _ => false,
    }
}

/// builds one arrow record batch out of validated rows
pub fn build_record_batch(
    schema: SchemaRef,
    rows: &[Vec<FieldValue>],
) -> Result<RecordBatch, SinkError> {
    let columns = schema
        .fields()
        .iter()
        .enumerate()
        .map(|(idx, field)| build_column(field, idx, rows))
        .collect::<Result<Vec<_>, _>>()?;
    RecordBatch::try_new(schema, columns).map_err(|e| SinkError::Send(e.into()))
}

fn build_column(field: &Field, idx: usize, rows: &[Vec<FieldValue>]) -> Result<ArrayRef, SinkError> {
    let values = rows.iter().map(|row| &row[idx]);
    let column: ArrayRef = match field.data_type() {
        DataType::Boolean => Arc::new(
            values
                .map(|v| match v {
                    FieldValue::Bool(b) => Some(*b),
                    _ => None,
                })
                .collect::<BooleanArray>(),
        ),
        DataType::Int64 => Arc::new(
            values
                .map(|v| match v {
                    FieldValue::Int64(i) => Some(*i),
                    _ => None,
                })
                .collect::<Int64Array>(),
        ),
        DataType::UInt64 => Arc::new(
            values
                .map(|v| match v {
                    FieldValue::UInt64(u) => Some(*u),
                    _ => None,
                })
                .collect::<UInt64Array>(),
        ),
        DataType::Float64 => Arc::new(
            values
                .map(|v| match v {
                    FieldValue::Float64(f) => Some(*f),
                    _ => None,
                })
                .collect::<Float64Array>(),
        ),
        DataType::Utf8 => Arc::new(
            values
                .map(|v| match v {
                    FieldValue::Utf8(s) => Some(s.as_str()),
                    _ => None,
                })
                .collect::<StringArray>(),
        ),
        DataType::Binary => Arc::new(
            values
                .map(|v| match v {
                    FieldValue::Bytes(b) => Some(b.as_ref()),
                    _ => None,
                })
                .collect::<BinaryArray>(),
        ),
        DataType::Timestamp(TimeUnit::Microsecond, tz) => Arc::new(
            values
                .map(|v| match v {
                    FieldValue::Timestamp(ts) => Some(ts.timestamp_micros()),
                    _ => None,
                })
                .collect::<TimestampMicrosecondArray>()
                .with_timezone_opt(tz.clone()),
        ),
        other => {
            return Err(SinkError::SchemaMismatch(format!(
                "unsupported column type {other} for {}",
                field.name()
            )))
        }
    };
    Ok(column)
}
