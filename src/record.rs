use crate::sink::SinkError;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt::Debug;
use std::sync::Arc;

/// A single typed value appended to a sink batch
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum FieldValue {
    Null,
    Bool(bool),
    Int64(i64),
    UInt64(u64),
    Float64(f64),
    Utf8(String),
    Bytes(Bytes),
    Timestamp(DateTime<Utc>),
}

impl FieldValue {
    /// Short type name used in schema mismatch messages
    pub fn type_name(&self) -> &'static str {
        match self {
            FieldValue::Null => "null",
            FieldValue::Bool(_) => "bool",
            FieldValue::Int64(_) => "int64",
            FieldValue::UInt64(_) => "uint64",
            FieldValue::Float64(_) => "float64",
            FieldValue::Utf8(_) => "utf8",
            FieldValue::Bytes(_) => "bytes",
            FieldValue::Timestamp(_) => "timestamp",
        }
    }
}

/// One unit of data flowing through the pipeline.
///
/// The payload is kept untouched for the caller, the fields are what gets appended to the sink.
/// Once handed to the pipeline a record is only ever changed by attaching a failure.
#[derive(Debug, Clone)]
pub struct Record {
    pub payload: Bytes,
    pub fields: Vec<FieldValue>,
    pub correlation_id: Option<String>,
    error: Option<Arc<SinkError>>,
    /// position assigned by the pipeline, unique per run
    sequence: Option<u64>,
}

impl Record {
    pub fn new(payload: impl Into<Bytes>, fields: Vec<FieldValue>) -> Self {
        Record {
            payload: payload.into(),
            fields,
            correlation_id: None,
            error: None,
            sequence: None,
        }
    }

    pub fn with_correlation_id(mut self, id: impl Into<String>) -> Self {
        self.correlation_id = Some(id.into());
        self
    }

    /// attaches a failure, the same error instance may be shared by a whole group
    pub fn fail(&mut self, error: Arc<SinkError>) {
        self.error = Some(error);
    }

    pub fn error(&self) -> Option<&Arc<SinkError>> {
        self.error.as_ref()
    }

    pub(crate) fn set_sequence(&mut self, sequence: u64) {
        self.sequence = Some(sequence);
    }

    pub(crate) fn sequence(&self) -> Option<u64> {
        self.sequence
    }
}

/// Source native capability to accept or reject a delivered record.
/// Exactly one of the two methods is called, at most once.
pub trait Acknowledge: Send + Sync {
    /// the record was written, the source may forget it
    fn ack(self: Box<Self>);

    /// the record was not written, the source should deliver it again
    fn nack(self: Box<Self>);
}

/// A record handed out by the delivery adapter together with its ack/nack capability
pub struct DeliveredItem {
    pub record: Record,
    acker: Box<dyn Acknowledge>,
}

impl DeliveredItem {
    pub fn new(record: Record, acker: Box<dyn Acknowledge>) -> Self {
        DeliveredItem { record, acker }
    }

    pub fn ack(self) {
        self.acker.ack()
    }

    pub fn nack(self) {
        self.acker.nack()
    }

    /// splits the item so the record can travel downstream while the acker stays with the caller
    pub fn into_parts(self) -> (Record, Box<dyn Acknowledge>) {
        (self.record, self.acker)
    }
}

impl Debug for DeliveredItem {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeliveredItem")
            .field("record", &self.record)
            .finish_non_exhaustive()
    }
}

/// Outcome of a single append failure or a single flush attempt
#[derive(Debug, Clone)]
pub struct StatusReport {
    pub records: Vec<Record>,
    pub error: Option<Arc<SinkError>>,
}

impl StatusReport {
    pub fn success(records: Vec<Record>) -> Self {
        StatusReport {
            records,
            error: None,
        }
    }

    /// attaches the same error to every record of the group
    pub fn failure(mut records: Vec<Record>, error: Arc<SinkError>) -> Self {
        for record in records.iter_mut() {
            record.fail(error.clone());
        }
        StatusReport {
            records,
            error: Some(error),
        }
    }

    pub fn is_success(&self) -> bool {
        self.error.is_none()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn failure_report_shares_one_error_across_records() {
        let records = (0..3)
            .map(|i| Record::new(vec![i as u8], vec![FieldValue::Int64(i)]))
            .collect();
        let error = Arc::new(SinkError::Send(anyhow::anyhow!("connection reset")));

        let report = StatusReport::failure(records, error.clone());

        assert!(!report.is_success());
        assert_eq!(3, report.len());
        for record in &report.records {
            assert!(Arc::ptr_eq(&error, record.error().unwrap()));
        }
    }

    #[test]
    fn field_values_serialize_as_plain_json() {
        let fields = vec![
            FieldValue::Utf8("BTC_USD".to_string()),
            FieldValue::Float64(0.5),
            FieldValue::Null,
        ];
        let json = serde_json::to_string(&fields).unwrap();
        assert_eq!(r#"["BTC_USD",0.5,null]"#, json);
    }
}
