use crate::record::FieldValue;
use crate::sink::{Batch, BatchSink, SinkError};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

type AppendFilter = Arc<dyn Fn(&[FieldValue]) -> bool + Send + Sync>;

/// A batch which was sent successfully
#[derive(Debug, Clone)]
pub struct SentBatch {
    pub target: String,
    pub rows: Vec<Vec<FieldValue>>,
}

/// In process sink recording every sent batch, with switches to make opening, appending and
/// sending fail
#[derive(Clone, Default)]
pub struct MemorySink {
    sent: Arc<Mutex<Vec<SentBatch>>>,
    opened: Arc<AtomicUsize>,
    failing_opens: Arc<AtomicUsize>,
    failing_sends: Arc<AtomicUsize>,
    reject: Option<AppendFilter>,
    send_delay: Option<Duration>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    /// rows matching the predicate are rejected on append
    pub fn rejecting(mut self, filter: impl Fn(&[FieldValue]) -> bool + Send + Sync + 'static) -> Self {
        self.reject = Some(Arc::new(filter));
        self
    }

    /// the next `n` calls to `open_batch` fail
    pub fn fail_next_opens(&self, n: usize) {
        self.failing_opens.store(n, Ordering::SeqCst);
    }

    /// the next `n` calls to `send` fail
    pub fn fail_next_sends(&self, n: usize) {
        self.failing_sends.store(n, Ordering::SeqCst);
    }

    pub fn with_send_delay(mut self, delay: Duration) -> Self {
        self.send_delay = Some(delay);
        self
    }

    pub fn sent(&self) -> Vec<SentBatch> {
        self.sent
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    pub fn opened(&self) -> usize {
        self.opened.load(Ordering::SeqCst)
    }
}

/// decrements the counter if it is positive, returns whether it was
fn take_failure(counter: &AtomicUsize) -> bool {
    counter
        .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
        .is_ok()
}

impl BatchSink for MemorySink {
    type Batch = MemoryBatch;

    async fn open_batch(&self, target: &str) -> Result<MemoryBatch, SinkError> {
        if take_failure(&self.failing_opens) {
            return Err(SinkError::OpenBatch {
                target: target.to_string(),
                source: anyhow::anyhow!("memory sink unavailable"),
            });
        }
        self.opened.fetch_add(1, Ordering::SeqCst);
        Ok(MemoryBatch {
            sink: self.clone(),
            target: target.to_string(),
            rows: Vec::new(),
        })
    }
}

pub struct MemoryBatch {
    sink: MemorySink,
    target: String,
    rows: Vec<Vec<FieldValue>>,
}

impl Batch for MemoryBatch {
    fn append(&mut self, fields: &[FieldValue]) -> Result<(), SinkError> {
        if let Some(reject) = &self.sink.reject {
            if reject(fields) {
                return Err(SinkError::SchemaMismatch(format!(
                    "memory sink rejected row {:?}",
                    fields
                )));
            }
        }
        self.rows.push(fields.to_vec());
        Ok(())
    }

    fn len(&self) -> usize {
        self.rows.len()
    }

    async fn send(self) -> Result<(), SinkError> {
        if let Some(delay) = self.sink.send_delay {
            tokio::time::sleep(delay).await;
        }
        if take_failure(&self.sink.failing_sends) {
            return Err(SinkError::Send(anyhow::anyhow!(
                "memory sink dropped batch of {} rows",
                self.rows.len()
            )));
        }
        self.sink
            .sent
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push(SentBatch {
                target: self.target,
                rows: self.rows,
            });
        Ok(())
    }
}
