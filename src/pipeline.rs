use crate::config::PipelineConfig;
use crate::delivery::{DeliveryAdapter, DeliveryStream};
use crate::error::error_chain_fmt;
use crate::record::{Acknowledge, Record, StatusReport};
use crate::sink::BatchSink;
use crate::source::{PushSource, SourceError};
use crate::writer::{BatchWriter, WriterError};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// ackers of records which are inside the writer, keyed by the sequence assigned on forwarding
#[derive(Clone, Default)]
struct InFlight {
    ackers: Arc<Mutex<HashMap<u64, Box<dyn Acknowledge>>>>,
}

impl InFlight {
    fn lock(&self) -> MutexGuard<'_, HashMap<u64, Box<dyn Acknowledge>>> {
        self.ackers
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn insert(&self, sequence: u64, acker: Box<dyn Acknowledge>) {
        self.lock().insert(sequence, acker);
    }

    fn remove(&self, sequence: u64) -> Option<Box<dyn Acknowledge>> {
        self.lock().remove(&sequence)
    }

    fn drain(&self) -> Vec<Box<dyn Acknowledge>> {
        self.lock().drain().map(|(_, acker)| acker).collect()
    }
}

/// Counters of a finished pipeline run
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PipelineSummary {
    pub delivered: u64,
    pub acked: u64,
    pub nacked: u64,
    pub reports: u64,
}

/// Wires a [`PushSource`] through the delivery adapter and the batch writer into a [`BatchSink`]
/// and acks or nacks every delivered record according to its status report.
pub struct Pipeline<So: PushSource, Si: BatchSink> {
    source: So,
    sink: Si,
    config: PipelineConfig,
    shutdown: CancellationToken,
}

impl<So: PushSource, Si: BatchSink> Pipeline<So, Si> {
    pub fn new(source: So, sink: Si, config: PipelineConfig) -> Self {
        Pipeline {
            source,
            sink,
            config,
            shutdown: CancellationToken::new(),
        }
    }

    /// cancelling the token ends the subscription, buffered records are still flushed
    pub fn with_shutdown(mut self, shutdown: CancellationToken) -> Self {
        self.shutdown = shutdown;
        self
    }

    /// Runs until the subscription ended and every delivered record has been acked or nacked.
    #[tracing::instrument(skip_all, fields(target = %self.config.target))]
    pub async fn run(self) -> Result<PipelineSummary, PipelineError> {
        let shutdown = self.shutdown.child_token();
        let (stream, subscription) = DeliveryAdapter::new(self.source, &self.config)
            .with_shutdown(shutdown.clone())
            .start()
            .await
            .map_err(PipelineError::Source)?;

        let (record_tx, record_rx) = mpsc::channel(self.config.input_buffer);
        let (status_rx, writer) = BatchWriter::new(self.sink, &self.config).spawn(record_rx);

        let in_flight = InFlight::default();
        let forwarder = tokio::spawn(forward(stream, record_tx, in_flight.clone(), shutdown));

        let mut summary = settle(status_rx, &in_flight).await;
        let (delivered, rejected) = forwarder.await?;
        summary.delivered = delivered;
        summary.nacked += rejected;
        subscription.await?;
        let writer_result = writer.await?;

        // anything still held never reached a report, e.g. the writer stopped early
        for acker in in_flight.drain() {
            acker.nack();
            summary.nacked += 1;
        }

        info!(
            "Pipeline finished: delivered {}, acked {}, nacked {}",
            summary.delivered, summary.acked, summary.nacked
        );
        writer_result.map_err(PipelineError::Writer)?;
        Ok(summary)
    }
}

/// Moves delivered records into the writer input, keeping their ackers aside.
/// Returns the number of forwarded records and the number rejected after the writer stopped.
async fn forward(
    mut stream: DeliveryStream,
    records: mpsc::Sender<Record>,
    in_flight: InFlight,
    shutdown: CancellationToken,
) -> (u64, u64) {
    let mut delivered = 0;
    let mut rejected = 0;
    while let Some(item) = stream.recv().await {
        let (mut record, acker) = item.into_parts();
        if record.correlation_id.is_none() {
            record.correlation_id = Some(Uuid::new_v4().to_string());
        }
        // correlation ids may repeat, the sequence does not
        let sequence = delivered;
        record.set_sequence(sequence);
        in_flight.insert(sequence, acker);
        delivered += 1;

        if records.send(record).await.is_err() {
            warn!("Batch writer stopped, ending subscription");
            shutdown.cancel();
            if let Some(acker) = in_flight.remove(sequence) {
                acker.nack();
                rejected += 1;
            }
            // drain so blocked source callbacks are released
            while let Some(item) = stream.recv().await {
                delivered += 1;
                rejected += 1;
                item.nack();
            }
            break;
        }
    }
    debug!("Forwarded {} records, rejected {}", delivered, rejected);
    (delivered, rejected)
}

/// acks or nacks every record of every report until the writer closes the status stream
async fn settle(mut status: mpsc::Receiver<StatusReport>, in_flight: &InFlight) -> PipelineSummary {
    let mut summary = PipelineSummary::default();
    while let Some(report) = status.recv().await {
        summary.reports += 1;
        let success = report.is_success();
        if let Some(error) = &report.error {
            warn!("Nacking {} records: {}", report.len(), error);
        }
        for record in report.records {
            let Some(acker) = record.sequence().and_then(|seq| in_flight.remove(seq)) else {
                warn!("No acker for record {:?}", record.correlation_id);
                continue;
            };
            if success {
                acker.ack();
                summary.acked += 1;
            } else {
                acker.nack();
                summary.nacked += 1;
            }
        }
    }
    summary
}

#[derive(thiserror::Error)]
pub enum PipelineError {
    #[error("Delivery adapter failed to start")]
    Source(#[source] SourceError),
    #[error("Batch writer stopped")]
    Writer(#[source] WriterError),
    #[error("Pipeline task failed")]
    Task(#[from] tokio::task::JoinError),
}

impl std::fmt::Debug for PipelineError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        error_chain_fmt(self, f)
    }
}
