use crate::config::{OpenFailurePolicy, PipelineConfig};
use crate::error::error_chain_fmt;
use crate::record::{Record, StatusReport};
use crate::sink::{Batch, BatchSink, SinkError};
use crate::telemetry::{
    count_append_failure, count_appended, count_batch_open_failure, count_flush,
};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, info, trace, warn};

/// Accumulates an ordered stream of records into time bounded batches and reports the outcome
/// of every append failure and every flush on a status channel.
///
/// The writer is strictly sequential: the check whether the write interval elapsed happens
/// after each consumed record, there is no separate timer. An idle input therefore delays the
/// flush until the next record arrives or the input closes.
pub struct BatchWriter<S: BatchSink> {
    sink: S,
    target: String,
    write_interval: Duration,
    on_open_failure: OpenFailurePolicy,
    status_buffer: usize,
}

/// Everything the processing loop owns exclusively
struct WriterState<B> {
    batch: Option<B>,
    pending: Vec<Record>,
    window_start: Instant,
    status: mpsc::Sender<StatusReport>,
    status_closed: bool,
}

impl<S: BatchSink> BatchWriter<S> {
    pub fn new(sink: S, config: &PipelineConfig) -> Self {
        BatchWriter {
            sink,
            target: config.target.clone(),
            write_interval: config.write_interval(),
            on_open_failure: config.on_open_failure,
            status_buffer: config.status_buffer,
        }
    }

    /// runs the writer as its own task, the returned receiver closes after the final flush
    pub fn spawn(
        self,
        input: mpsc::Receiver<Record>,
    ) -> (
        mpsc::Receiver<StatusReport>,
        JoinHandle<Result<(), WriterError>>,
    ) {
        let (status_tx, status_rx) = mpsc::channel(self.status_buffer.max(1));
        let task = tokio::spawn(self.run(input, status_tx));
        (status_rx, task)
    }

    /// Consumes `input` until it closes. Dropping `status` at the end closes the status stream.
    #[tracing::instrument(skip_all, fields(target = %self.target))]
    pub async fn run(
        self,
        mut input: mpsc::Receiver<Record>,
        status: mpsc::Sender<StatusReport>,
    ) -> Result<(), WriterError> {
        let mut state = WriterState {
            batch: None,
            pending: Vec::new(),
            window_start: Instant::now(),
            status,
            status_closed: false,
        };
        self.open_batch(&mut state).await?;

        while let Some(record) = input.recv().await {
            self.append(&mut state, record).await?;

            if state.window_start.elapsed() > self.write_interval {
                if state.pending.is_empty() {
                    // nothing to send, the open batch is kept for the next window
                    trace!("Write interval elapsed without pending records");
                    state.window_start = Instant::now();
                } else {
                    self.flush(&mut state).await;
                    self.open_batch(&mut state).await?;
                }
            }
        }

        if !state.pending.is_empty() {
            info!("Input closed, flushing {} remaining records", state.pending.len());
            self.flush(&mut state).await;
        }
        info!("Batch writer finished");
        Ok(())
    }

    /// opens a new batch, replacing a finalized one. Failures follow the open failure policy.
    async fn open_batch(&self, state: &mut WriterState<S::Batch>) -> Result<(), WriterError> {
        state.window_start = Instant::now();
        match self.sink.open_batch(&self.target).await {
            Ok(batch) => {
                debug!("Opened new batch");
                state.batch = Some(batch);
                Ok(())
            }
            Err(e) => {
                error!("Failed to open batch: {:?}", e);
                count_batch_open_failure(&self.target);
                state.batch = None;
                match self.on_open_failure {
                    OpenFailurePolicy::Continue => Ok(()),
                    OpenFailurePolicy::Terminate => Err(WriterError::OpenBatch(Arc::new(e))),
                }
            }
        }
    }

    async fn append(
        &self,
        state: &mut WriterState<S::Batch>,
        record: Record,
    ) -> Result<(), WriterError> {
        let mut batch = match state.batch.take() {
            Some(batch) => batch,
            // an earlier open failed, try again before giving up on this record
            None => match self.sink.open_batch(&self.target).await {
                Ok(batch) => {
                    info!("Sink recovered, opened new batch");
                    state.window_start = Instant::now();
                    batch
                }
                Err(e) => {
                    warn!("Still unable to open batch: {}", e);
                    count_batch_open_failure(&self.target);
                    let report = StatusReport::failure(vec![record], Arc::new(e));
                    send_report(state, report).await;
                    return Ok(());
                }
            },
        };

        let appended = batch.append(&record.fields);
        state.batch = Some(batch);
        match appended {
            Ok(()) => {
                trace!("Appended record {:?}", record.correlation_id);
                count_appended(&self.target);
                state.pending.push(record);
            }
            Err(e) => {
                error!("Failed to append record {:?}: {}", record.correlation_id, e);
                count_append_failure(&self.target);
                send_report(state, StatusReport::failure(vec![record], Arc::new(e))).await;
            }
        }
        Ok(())
    }

    /// sends the open batch and reports the pending group. The batch is always finalized.
    async fn flush(&self, state: &mut WriterState<S::Batch>) {
        let pending = std::mem::take(&mut state.pending);
        let result = match state.batch.take() {
            Some(batch) => batch.send().await,
            // records only become pending after a successful append, so a batch exists
            None => Err(SinkError::Send(anyhow::anyhow!("no open batch"))),
        };

        let count = pending.len();
        let report = match result {
            Ok(()) => {
                info!("Flushed batch of {} records", count);
                count_flush(&self.target, count, true);
                StatusReport::success(pending)
            }
            Err(e) => {
                error!("Failed to send batch of {} records: {:?}", count, e);
                count_flush(&self.target, count, false);
                StatusReport::failure(pending, Arc::new(e))
            }
        };
        send_report(state, report).await;
    }
}

async fn send_report<B>(state: &mut WriterState<B>, report: StatusReport) {
    if state.status.send(report).await.is_err() && !state.status_closed {
        warn!("Status receiver dropped, reports are discarded from now on");
        state.status_closed = true;
    }
}

#[derive(thiserror::Error)]
pub enum WriterError {
    #[error("Unable to open a batch, writer stopped")]
    OpenBatch(#[source] Arc<SinkError>),
}

impl std::fmt::Debug for WriterError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        error_chain_fmt(self, f)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::memory::MemorySink;
    use crate::record::FieldValue;

    fn record(i: i64) -> Record {
        Record::new(i.to_be_bytes().to_vec(), vec![FieldValue::Int64(i)])
            .with_correlation_id(i.to_string())
    }

    fn ids(report: &StatusReport) -> Vec<String> {
        report
            .records
            .iter()
            .map(|r| r.correlation_id.clone().unwrap())
            .collect()
    }

    fn config(interval_ms: u64) -> PipelineConfig {
        PipelineConfig::default().with_write_interval(Duration::from_millis(interval_ms))
    }

    async fn collect(mut status: mpsc::Receiver<StatusReport>) -> Vec<StatusReport> {
        let mut reports = Vec::new();
        while let Some(report) = status.recv().await {
            reports.push(report);
        }
        reports
    }

    /// feeds the records with the given gap and closes the input afterwards
    fn feed(records: Vec<Record>, gap: Option<Duration>) -> mpsc::Receiver<Record> {
        let (tx, rx) = mpsc::channel(1);
        tokio::spawn(async move {
            for record in records {
                if let Some(gap) = gap {
                    tokio::time::sleep(gap).await;
                }
                if tx.send(record).await.is_err() {
                    break;
                }
            }
        });
        rx
    }

    #[tokio::test(start_paused = true)]
    async fn closing_input_flushes_buffered_records_once() {
        let sink = MemorySink::new();
        let writer = BatchWriter::new(sink.clone(), &config(60_000));

        let (status, task) = writer.spawn(feed((0..5).map(record).collect(), None));
        let reports = collect(status).await;
        task.await.unwrap().unwrap();

        assert_eq!(1, reports.len());
        assert!(reports[0].is_success());
        assert_eq!(vec!["0", "1", "2", "3", "4"], ids(&reports[0]));
        assert_eq!(1, sink.sent().len());
        assert_eq!(5, sink.sent()[0].rows.len());
    }

    #[tokio::test(start_paused = true)]
    async fn empty_input_reports_nothing() {
        let sink = MemorySink::new();
        let writer = BatchWriter::new(sink.clone(), &config(100));

        let (status, task) = writer.spawn(feed(Vec::new(), None));
        let reports = collect(status).await;
        task.await.unwrap().unwrap();

        assert!(reports.is_empty());
        assert!(sink.sent().is_empty());
        assert_eq!(1, sink.opened());
    }

    #[tokio::test(start_paused = true)]
    async fn append_failures_are_reported_alone_and_excluded_from_the_batch() {
        let sink = MemorySink::new().rejecting(|fields| fields == [FieldValue::Int64(2)]);
        let writer = BatchWriter::new(sink.clone(), &config(60_000));

        let (status, task) = writer.spawn(feed((0..5).map(record).collect(), None));
        let reports = collect(status).await;
        task.await.unwrap().unwrap();

        assert_eq!(2, reports.len());
        assert_eq!(vec!["2"], ids(&reports[0]));
        let error = reports[0].error.as_ref().unwrap();
        assert!(matches!(**error, SinkError::SchemaMismatch(_)));
        assert!(Arc::ptr_eq(error, reports[0].records[0].error().unwrap()));

        assert!(reports[1].is_success());
        assert_eq!(vec!["0", "1", "3", "4"], ids(&reports[1]));
        assert_eq!(4, sink.sent()[0].rows.len());
    }

    #[tokio::test(start_paused = true)]
    async fn send_failure_is_attributed_to_the_whole_group() {
        let sink = MemorySink::new();
        sink.fail_next_sends(1);
        let writer = BatchWriter::new(sink.clone(), &config(60_000));

        let (status, task) = writer.spawn(feed((0..4).map(record).collect(), None));
        let reports = collect(status).await;
        task.await.unwrap().unwrap();

        assert_eq!(1, reports.len());
        let error = reports[0].error.as_ref().unwrap();
        assert!(matches!(**error, SinkError::Send(_)));
        assert_eq!(4, reports[0].len());
        for record in &reports[0].records {
            assert!(Arc::ptr_eq(error, record.error().unwrap()));
        }
        assert!(sink.sent().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn steady_stream_flushes_once_per_interval() {
        let sink = MemorySink::new();
        let writer = BatchWriter::new(sink.clone(), &config(100));

        let records = (0..100).map(record).collect();
        let (status, task) = writer.spawn(feed(records, Some(Duration::from_millis(10))));
        let reports = collect(status).await;
        task.await.unwrap().unwrap();

        assert!(reports.iter().all(|r| r.is_success()));
        let total: usize = reports.iter().map(|r| r.len()).sum();
        assert_eq!(100, total);
        assert!(reports.len() >= 8, "only {} flushes", reports.len());
        // the last group is whatever was left when the input closed
        for report in &reports[..reports.len() - 1] {
            assert!(report.len() >= 9, "group of {} records", report.len());
            assert!(report.len() <= 12, "group of {} records", report.len());
        }

        let flat: Vec<String> = reports.iter().flat_map(ids).collect();
        let expected: Vec<String> = (0..100).map(|i| i.to_string()).collect();
        assert_eq!(expected, flat);
    }

    #[tokio::test(start_paused = true)]
    async fn idle_input_defers_the_flush() {
        let sink = MemorySink::new();
        let writer = BatchWriter::new(sink.clone(), &config(100));
        let (tx, rx) = mpsc::channel(1);
        let (mut status, task) = writer.spawn(rx);

        tx.send(record(0)).await.unwrap();
        tokio::time::sleep(Duration::from_millis(500)).await;
        assert!(status.try_recv().is_err());
        assert!(sink.sent().is_empty());

        tx.send(record(1)).await.unwrap();
        let report = status.recv().await.unwrap();
        assert_eq!(vec!["0", "1"], ids(&report));

        drop(tx);
        assert!(status.recv().await.is_none());
        task.await.unwrap().unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn failed_open_reports_records_until_the_sink_recovers() {
        let sink = MemorySink::new();
        // initial open plus the lazy retry for the first record
        sink.fail_next_opens(2);
        let writer = BatchWriter::new(sink.clone(), &config(60_000));

        let (status, task) = writer.spawn(feed((0..3).map(record).collect(), None));
        let reports = collect(status).await;
        task.await.unwrap().unwrap();

        assert_eq!(2, reports.len());
        assert_eq!(vec!["0"], ids(&reports[0]));
        assert!(matches!(
            **reports[0].error.as_ref().unwrap(),
            SinkError::OpenBatch { .. }
        ));
        assert!(reports[1].is_success());
        assert_eq!(vec!["1", "2"], ids(&reports[1]));
    }

    #[tokio::test(start_paused = true)]
    async fn record_rejected_by_a_reopened_batch_is_still_reported() {
        let sink = MemorySink::new().rejecting(|fields| fields == [FieldValue::Int64(1)]);
        sink.fail_next_opens(2);
        let writer = BatchWriter::new(sink.clone(), &config(60_000));

        let (status, task) = writer.spawn(feed((0..4).map(record).collect(), None));
        let reports = collect(status).await;
        task.await.unwrap().unwrap();

        assert_eq!(3, reports.len());
        assert_eq!(vec!["0"], ids(&reports[0]));
        assert_eq!(vec!["1"], ids(&reports[1]));
        assert!(matches!(
            **reports[1].error.as_ref().unwrap(),
            SinkError::SchemaMismatch(_)
        ));
        assert!(reports[2].is_success());
        assert_eq!(vec!["2", "3"], ids(&reports[2]));
        assert_eq!(1, sink.opened());
    }

    #[tokio::test(start_paused = true)]
    async fn terminate_policy_stops_on_open_failure() {
        let sink = MemorySink::new();
        sink.fail_next_opens(1);
        let config = config(100).with_open_failure_policy(OpenFailurePolicy::Terminate);
        let writer = BatchWriter::new(sink.clone(), &config);

        let (status, task) = writer.spawn(feed((0..3).map(record).collect(), None));
        let reports = collect(status).await;

        assert!(reports.is_empty());
        assert!(matches!(task.await.unwrap(), Err(WriterError::OpenBatch(_))));
    }

    #[tokio::test(start_paused = true)]
    async fn failed_reopen_after_flush_does_not_stop_the_writer() {
        let sink = MemorySink::new();
        let writer = BatchWriter::new(sink.clone(), &config(100));
        let (tx, rx) = mpsc::channel(1);
        let (mut status, task) = writer.spawn(rx);

        tx.send(record(0)).await.unwrap();
        tokio::time::sleep(Duration::from_millis(150)).await;
        // the flush triggered by this record succeeds, the following open fails
        sink.fail_next_opens(1);
        tx.send(record(1)).await.unwrap();
        let first = status.recv().await.unwrap();
        assert!(first.is_success());
        assert_eq!(vec!["0", "1"], ids(&first));

        tx.send(record(2)).await.unwrap();
        drop(tx);
        let last = status.recv().await.unwrap();
        assert!(last.is_success());
        assert_eq!(vec!["2"], ids(&last));
        assert!(status.recv().await.is_none());
        task.await.unwrap().unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn dropped_status_receiver_does_not_stop_writing() {
        let sink = MemorySink::new();
        let writer = BatchWriter::new(sink.clone(), &config(60_000));
        let (status, task) = writer.spawn(feed((0..3).map(record).collect(), None));
        drop(status);

        task.await.unwrap().unwrap();
        assert_eq!(3, sink.sent()[0].rows.len());
    }
}
