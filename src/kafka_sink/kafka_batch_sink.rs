use crate::kafka_sink::general::{generate_tracing_header, send_bytes_msg};
use crate::record::FieldValue;
use crate::sink::{Batch, BatchSink, SinkError};
use anyhow::Context;
use futures_util::future::try_join_all;
use rdkafka::producer::FutureProducer;
use rdkafka::ClientConfig;
use serde_json::{Map, Value};
use std::sync::Arc;
use std::time::Instant;
use tracing::debug;
use uuid::Uuid;

///
/// Writes every batch to a kafka topic, one JSON object per row keyed by the configured columns.
/// The batch target is used as topic.
///
#[derive(Clone)]
pub struct KafkaBatchSink {
    pub producer: FutureProducer,
    columns: Arc<[String]>,
}

impl KafkaBatchSink {
    pub fn new(producer_config: &ClientConfig, columns: &[&str]) -> Result<Self, SinkError> {
        let producer: FutureProducer = producer_config
            .create()
            .map_err(|e| SinkError::OpenBatch {
                target: "kafka".to_string(),
                source: anyhow::Error::new(e).context("Producer creation error"),
            })?;
        Ok(KafkaBatchSink {
            producer,
            columns: columns.iter().map(|c| c.to_string()).collect(),
        })
    }
}

impl BatchSink for KafkaBatchSink {
    type Batch = KafkaBatch;

    async fn open_batch(&self, target: &str) -> Result<KafkaBatch, SinkError> {
        Ok(KafkaBatch {
            producer: self.producer.clone(),
            topic: target.to_string(),
            columns: self.columns.clone(),
            rows: Vec::new(),
        })
    }
}

pub struct KafkaBatch {
    producer: FutureProducer,
    topic: String,
    columns: Arc<[String]>,
    rows: Vec<Vec<u8>>,
}

impl KafkaBatch {
    fn encode(&self, fields: &[FieldValue]) -> Result<Vec<u8>, SinkError> {
        if fields.len() != self.columns.len() {
            return Err(SinkError::SchemaMismatch(format!(
                "expected {} fields, got {}",
                self.columns.len(),
                fields.len()
            )));
        }
        let row: Map<String, Value> = self
            .columns
            .iter()
            .zip(fields)
            .map(|(column, field)| serde_json::to_value(field).map(|value| (column.clone(), value)))
            .collect::<Result<_, serde_json::Error>>()
            .map_err(|e| SinkError::Append(e.into()))?;
        serde_json::to_vec(&row).map_err(|e| SinkError::Append(e.into()))
    }
}

impl Batch for KafkaBatch {
    fn append(&mut self, fields: &[FieldValue]) -> Result<(), SinkError> {
        let row = self.encode(fields)?;
        self.rows.push(row);
        Ok(())
    }

    fn len(&self) -> usize {
        self.rows.len()
    }

    /// sends all rows concurrent to kafka, the batch fails if any delivery fails
    #[tracing::instrument(skip_all, fields(topic = %self.topic, rows = self.rows.len()))]
    async fn send(self) -> Result<(), SinkError> {
        let start = Instant::now();

        let producer = &self.producer;
        let topic = self.topic.as_str();
        let send_futures: Vec<_> = self
            .rows
            .iter()
            .map(|row| async move {
                // setup tracing for kafka
                let headers = generate_tracing_header();
                let key = Uuid::new_v4().to_string();
                send_bytes_msg(producer, topic, &key, headers, row)
                    .await
                    .map_err(|(e, _)| e)
                    .with_context(|| format!("Delivery to {} failed", topic))
            })
            .collect();

        try_join_all(send_futures).await.map_err(SinkError::Send)?;
        debug!("TIME NEEDED FOR KAFKA SINK: {}", start.elapsed().as_millis());
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use chrono::{TimeZone, Utc};

    fn test_batch() -> KafkaBatch {
        let producer: FutureProducer = ClientConfig::new()
            .set("bootstrap.servers", "localhost:9092")
            .create()
            .unwrap();
        KafkaBatch {
            producer,
            topic: "trades".to_string(),
            columns: Arc::from(vec!["market".to_string(), "price".to_string(), "ts".to_string()]),
            rows: Vec::new(),
        }
    }

    #[tokio::test]
    async fn rows_are_encoded_as_json_objects() {
        let batch = test_batch();
        let ts = Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap();

        let row = batch
            .encode(&[
                FieldValue::Utf8("BTC_USD".to_string()),
                FieldValue::Float64(10000.0),
                FieldValue::Timestamp(ts),
            ])
            .unwrap();

        let value: Value = serde_json::from_slice(&row).unwrap();
        assert_eq!("BTC_USD", value["market"]);
        assert_eq!(10000.0, value["price"]);
        assert_eq!("2024-03-01T12:00:00Z", value["ts"]);
    }

    #[tokio::test]
    async fn arity_mismatch_is_rejected_without_changing_the_batch() {
        let mut batch = test_batch();

        let result = batch.append(&[FieldValue::Utf8("BTC_USD".to_string())]);

        assert!(matches!(result, Err(SinkError::SchemaMismatch(_))));
        assert!(batch.is_empty());
    }
}
