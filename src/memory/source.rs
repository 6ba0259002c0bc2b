use crate::delivery::DeliveryHandler;
use crate::record::{Acknowledge, Record};
use crate::source::{PushSource, SourceError, Subscription};
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// Shared log of the ack / nack outcomes of a [`MemoryPushSource`], keyed by correlation id
#[derive(Clone, Default, Debug)]
pub struct AckLog {
    acked: Arc<Mutex<Vec<String>>>,
    nacked: Arc<Mutex<Vec<String>>>,
}

impl AckLog {
    pub fn acked(&self) -> Vec<String> {
        lock(&self.acked).clone()
    }

    pub fn nacked(&self) -> Vec<String> {
        lock(&self.nacked).clone()
    }

    fn push_acked(&self, id: String) {
        lock(&self.acked).push(id)
    }

    fn push_nacked(&self, id: String) {
        lock(&self.nacked).push(id)
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Acknowledger writing into an [`AckLog`]
pub struct MemoryAck {
    log: AckLog,
    id: String,
}

impl MemoryAck {
    pub fn new(log: AckLog, id: impl Into<String>) -> Self {
        MemoryAck { log, id: id.into() }
    }
}

impl Acknowledge for MemoryAck {
    fn ack(self: Box<Self>) {
        self.log.push_acked(self.id)
    }

    fn nack(self: Box<Self>) {
        self.log.push_nacked(self.id)
    }
}

/// In process push source which delivers a fixed set of records from several worker tasks at once.
///
/// Records without a correlation id get their position as id so the [`AckLog`] can refer to them.
/// Nacked records are logged, not redelivered.
#[derive(Clone)]
pub struct MemoryPushSource {
    records: Vec<Record>,
    concurrency: usize,
    log: AckLog,
    fail_subscribe: bool,
    hold_open: bool,
}

impl MemoryPushSource {
    pub fn new(records: Vec<Record>, concurrency: usize) -> Self {
        let records = records
            .into_iter()
            .enumerate()
            .map(|(i, record)| match record.correlation_id {
                Some(_) => record,
                None => record.with_correlation_id(i.to_string()),
            })
            .collect();
        MemoryPushSource {
            records,
            concurrency: concurrency.max(1),
            log: AckLog::default(),
            fail_subscribe: false,
            hold_open: false,
        }
    }

    /// makes `subscribe` fail, like an unreachable broker would
    pub fn failing_subscribe(mut self) -> Self {
        self.fail_subscribe = true;
        self
    }

    /// keeps the subscription open after all records were delivered until shutdown fires
    pub fn hold_open(mut self) -> Self {
        self.hold_open = true;
        self
    }

    pub fn ack_log(&self) -> AckLog {
        self.log.clone()
    }
}

impl PushSource for MemoryPushSource {
    type Subscription = MemorySubscription;

    async fn subscribe(&self) -> Result<MemorySubscription, SourceError> {
        if self.fail_subscribe {
            return Err(SourceError::Subscription(anyhow::anyhow!(
                "memory source refused the subscription"
            )));
        }
        Ok(MemorySubscription {
            queue: Arc::new(Mutex::new(self.records.iter().cloned().collect())),
            concurrency: self.concurrency,
            log: self.log.clone(),
            hold_open: self.hold_open,
        })
    }
}

pub struct MemorySubscription {
    queue: Arc<Mutex<VecDeque<Record>>>,
    concurrency: usize,
    log: AckLog,
    hold_open: bool,
}

impl Subscription for MemorySubscription {
    #[tracing::instrument(skip_all)]
    async fn receive(
        self,
        handler: DeliveryHandler,
        shutdown: CancellationToken,
    ) -> Result<(), SourceError> {
        info!("Starting {} memory delivery workers", self.concurrency);
        let mut workers = JoinSet::new();
        for worker in 0..self.concurrency {
            let queue = self.queue.clone();
            let handler = handler.clone();
            let log = self.log.clone();
            workers.spawn(async move {
                loop {
                    if handler.is_closed() {
                        break;
                    }
                    let next = lock(&queue).pop_front();
                    let Some(record) = next else {
                        break;
                    };
                    let id = record.correlation_id.clone().unwrap_or_default();
                    let acker = MemoryAck::new(log.clone(), id);
                    if handler.deliver(record, acker).await.is_err() {
                        debug!("worker {} stops, delivery closed", worker);
                        break;
                    }
                }
            });
        }

        while let Some(result) = workers.join_next().await {
            result.map_err(|e| SourceError::Runtime(anyhow::Error::from(e)))?;
        }

        if self.hold_open {
            shutdown.cancelled().await;
        }
        Ok(())
    }
}
