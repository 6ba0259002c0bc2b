use crate::config::PipelineConfig;
use crate::error::error_chain_fmt;
use crate::record::{Acknowledge, DeliveredItem, Record};
use crate::source::{PushSource, SourceError, Subscription};
use crate::telemetry::count_delivered;
use futures::Stream;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace};

/// a delivered item waiting in the slot, `accepted` fires once the consumer took it
struct Handoff {
    item: DeliveredItem,
    accepted: oneshot::Sender<()>,
}

/// Entry point handed to a [`Subscription`].
///
/// Cloned freely and called concurrently by the source. Every call waits until the consumer
/// accepted the record, so at most one hand-off is in flight per adapter.
#[derive(Clone)]
pub struct DeliveryHandler {
    slot: Arc<Mutex<Option<mpsc::Sender<Handoff>>>>,
    shutdown: CancellationToken,
}

impl DeliveryHandler {
    fn new(sender: mpsc::Sender<Handoff>, shutdown: CancellationToken) -> Self {
        DeliveryHandler {
            slot: Arc::new(Mutex::new(Some(sender))),
            shutdown,
        }
    }

    /// hands a record over and waits for the consumer to accept it.
    /// Rejected records are nacked before the error is returned.
    pub async fn deliver(
        &self,
        record: Record,
        acker: impl Acknowledge + 'static,
    ) -> Result<(), DeliveryError> {
        let item = DeliveredItem::new(record, Box::new(acker));
        let slot = self.slot.lock().await;
        let Some(sender) = self.open_sender(&slot) else {
            item.nack();
            return Err(DeliveryError::Closed);
        };

        let (accepted, receipt) = oneshot::channel();
        if let Err(mpsc::error::SendError(handoff)) = sender.send(Handoff { item, accepted }).await
        {
            handoff.item.nack();
            return Err(DeliveryError::Closed);
        }
        // lock stays held until the consumer took the item
        receipt.await.map_err(|_| DeliveryError::Closed)?;
        count_delivered();
        Ok(())
    }

    /// Same as [`DeliveryHandler::deliver`] for sources that call back on plain OS threads.
    ///
    /// Must not be called from within an async runtime.
    pub fn deliver_blocking(
        &self,
        record: Record,
        acker: impl Acknowledge + 'static,
    ) -> Result<(), DeliveryError> {
        let item = DeliveredItem::new(record, Box::new(acker));
        let slot = self.slot.blocking_lock();
        let Some(sender) = self.open_sender(&slot) else {
            item.nack();
            return Err(DeliveryError::Closed);
        };

        let (accepted, receipt) = oneshot::channel();
        if let Err(mpsc::error::SendError(handoff)) =
            sender.blocking_send(Handoff { item, accepted })
        {
            handoff.item.nack();
            return Err(DeliveryError::Closed);
        }
        receipt.blocking_recv().map_err(|_| DeliveryError::Closed)?;
        count_delivered();
        Ok(())
    }

    /// whether new deliveries are still accepted
    pub fn is_closed(&self) -> bool {
        self.shutdown.is_cancelled()
    }

    fn open_sender<'a>(
        &self,
        slot: &'a Option<mpsc::Sender<Handoff>>,
    ) -> Option<&'a mpsc::Sender<Handoff>> {
        if self.shutdown.is_cancelled() {
            return None;
        }
        slot.as_ref()
    }

    /// waits for an in-flight hand-off and closes the slot, later calls are no-ops
    async fn close(&self) {
        let mut slot = self.slot.lock().await;
        if slot.take().is_some() {
            debug!("delivery slot closed");
        }
    }
}

/// Ordered output of the delivery adapter, ends once the subscription is over
pub struct DeliveryStream {
    receiver: mpsc::Receiver<Handoff>,
}

impl DeliveryStream {
    /// receives the next item, which also releases the blocked producer
    pub async fn recv(&mut self) -> Option<DeliveredItem> {
        let handoff = self.receiver.recv().await?;
        Some(accept(handoff))
    }
}

impl Drop for DeliveryStream {
    fn drop(&mut self) {
        // a handoff sitting in the channel was never accepted
        self.receiver.close();
        while let Ok(handoff) = self.receiver.try_recv() {
            handoff.item.nack();
        }
    }
}

fn accept(handoff: Handoff) -> DeliveredItem {
    // producer may be gone already, the item is still ours
    let _ = handoff.accepted.send(());
    trace!("accepted delivery");
    handoff.item
}

impl Stream for DeliveryStream {
    type Item = DeliveredItem;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.receiver
            .poll_recv(cx)
            .map(|handoff| handoff.map(accept))
    }
}

/// Turns a concurrently calling [`PushSource`] into one sequential, backpressured [`DeliveryStream`]
pub struct DeliveryAdapter<S: PushSource> {
    source: S,
    deadline: Option<Duration>,
    shutdown: CancellationToken,
}

impl<S: PushSource> DeliveryAdapter<S> {
    pub fn new(source: S, config: &PipelineConfig) -> Self {
        DeliveryAdapter {
            source,
            deadline: config.subscription_deadline(),
            shutdown: CancellationToken::new(),
        }
    }

    /// stops the subscription when the given token is cancelled
    pub fn with_shutdown(mut self, shutdown: CancellationToken) -> Self {
        self.shutdown = shutdown;
        self
    }

    /// Opens the subscription and starts receiving in the background.
    ///
    /// Failing to subscribe is returned right away and not retried.
    #[tracing::instrument(skip_all)]
    pub async fn start(self) -> Result<(DeliveryStream, JoinHandle<()>), SourceError> {
        let subscription = self.source.subscribe().await.map_err(|e| {
            error!("Failed to subscribe: {}", e);
            e
        })?;
        info!("Subscription opened, deadline: {:?}", self.deadline);

        let (sender, receiver) = mpsc::channel(1);
        // child token so a deadline does not cancel the caller's token
        let shutdown = self.shutdown.child_token();
        let handler = DeliveryHandler::new(sender, shutdown.clone());
        let task = tokio::spawn(run_subscription(
            subscription,
            handler,
            self.deadline,
            shutdown,
        ));

        Ok((DeliveryStream { receiver }, task))
    }
}

async fn run_subscription<Sub: Subscription>(
    subscription: Sub,
    handler: DeliveryHandler,
    deadline: Option<Duration>,
    shutdown: CancellationToken,
) {
    let receiving = subscription.receive(handler.clone(), shutdown.clone());
    let stop = async {
        match deadline {
            Some(deadline) => {
                tokio::select! {
                    _ = tokio::time::sleep(deadline) => info!("Subscription deadline reached"),
                    _ = shutdown.cancelled() => info!("Subscription cancelled"),
                }
            }
            None => {
                shutdown.cancelled().await;
                info!("Subscription cancelled");
            }
        }
    };

    tokio::pin!(receiving);
    let result = tokio::select! {
        result = &mut receiving => result,
        _ = stop => {
            // refuse new deliveries, the ones holding the slot still complete
            shutdown.cancel();
            receiving.await
        }
    };
    match result {
        Ok(()) => info!("Subscription ended"),
        Err(e) => error!("Subscription ended with error: {:?}", e),
    }

    shutdown.cancel();
    handler.close().await;
    info!("Delivery stream closed");
}

#[derive(thiserror::Error)]
pub enum DeliveryError {
    #[error("Delivery stream is closed")]
    Closed,
}

impl std::fmt::Debug for DeliveryError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        error_chain_fmt(self, f)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::memory::{AckLog, MemoryAck, MemoryPushSource};
    use crate::record::FieldValue;
    use futures::StreamExt;
    use std::collections::HashSet;

    fn test_record(i: i64) -> Record {
        Record::new(i.to_be_bytes().to_vec(), vec![FieldValue::Int64(i)])
            .with_correlation_id(i.to_string())
    }

    fn test_pair() -> (DeliveryHandler, DeliveryStream, CancellationToken) {
        let (sender, receiver) = mpsc::channel(1);
        let shutdown = CancellationToken::new();
        (
            DeliveryHandler::new(sender, shutdown.clone()),
            DeliveryStream { receiver },
            shutdown,
        )
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 8)]
    async fn concurrent_deliveries_are_handed_off_exactly_once() {
        let (handler, mut stream, _shutdown) = test_pair();
        let log = AckLog::default();
        let n = 200;

        let mut producers = Vec::new();
        for i in 0..n {
            let handler = handler.clone();
            let acker = MemoryAck::new(log.clone(), i.to_string());
            producers.push(tokio::spawn(async move {
                handler.deliver(test_record(i), acker).await
            }));
        }
        drop(handler);

        let mut seen = HashSet::new();
        for _ in 0..n {
            let item = stream.recv().await.unwrap();
            tokio::time::sleep(Duration::from_micros(200)).await;
            assert!(seen.insert(item.record.correlation_id.clone().unwrap()));
            item.ack();
        }

        for producer in producers {
            producer.await.unwrap().unwrap();
        }
        assert_eq!(n as usize, seen.len());
        assert_eq!(n as usize, log.acked().len());
        assert!(log.nacked().is_empty());
    }

    #[tokio::test]
    async fn delivery_blocks_until_the_consumer_accepts() {
        let (handler, mut stream, _shutdown) = test_pair();
        let log = AckLog::default();

        let first = tokio::spawn({
            let handler = handler.clone();
            let acker = MemoryAck::new(log.clone(), "1");
            async move { handler.deliver(test_record(1), acker).await }
        });
        let second = tokio::spawn({
            let handler = handler.clone();
            let acker = MemoryAck::new(log.clone(), "2");
            async move { handler.deliver(test_record(2), acker).await }
        });

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!first.is_finished());
        assert!(!second.is_finished());

        let item = stream.recv().await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(1, [first.is_finished(), second.is_finished()].iter().filter(|f| **f).count());

        let other = stream.recv().await.unwrap();
        assert_ne!(item.record.correlation_id, other.record.correlation_id);
        first.await.unwrap().unwrap();
        second.await.unwrap().unwrap();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn blocking_deliveries_from_os_threads() {
        let (handler, stream, _shutdown) = test_pair();
        let log = AckLog::default();

        let threads: Vec<_> = (0..4)
            .map(|t| {
                let handler = handler.clone();
                let log = log.clone();
                std::thread::spawn(move || {
                    for i in 0..25 {
                        let id = t * 100 + i;
                        handler
                            .deliver_blocking(test_record(id), MemoryAck::new(log.clone(), id.to_string()))
                            .unwrap();
                    }
                })
            })
            .collect();
        drop(handler);

        let items: Vec<DeliveredItem> = stream.take(100).collect().await;
        for thread in threads {
            thread.join().unwrap();
        }
        let ids: HashSet<_> = items
            .iter()
            .map(|item| item.record.correlation_id.clone().unwrap())
            .collect();
        assert_eq!(100, ids.len());
    }

    #[tokio::test]
    async fn deliveries_after_shutdown_are_nacked() {
        let (handler, mut stream, shutdown) = test_pair();
        let log = AckLog::default();
        shutdown.cancel();

        let result = handler
            .deliver(test_record(7), MemoryAck::new(log.clone(), "7"))
            .await;

        assert!(matches!(result, Err(DeliveryError::Closed)));
        assert_eq!(vec!["7".to_string()], log.nacked());
        handler.close().await;
        drop(handler);
        assert!(stream.recv().await.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn deadline_lets_the_pending_handoff_complete_and_nacks_the_rest() {
        let records = (0..3).map(test_record).collect();
        let source = MemoryPushSource::new(records, 3);
        let log = source.ack_log();
        let config = PipelineConfig::default()
            .with_subscription_deadline(Some(Duration::from_millis(100)));

        let (mut stream, task) = DeliveryAdapter::new(source, &config).start().await.unwrap();
        // nobody reads while the deadline passes
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert!(!task.is_finished());

        let item = stream.recv().await.unwrap();
        item.ack();
        assert!(stream.recv().await.is_none());
        task.await.unwrap();

        assert_eq!(1, log.acked().len());
        assert_eq!(2, log.nacked().len());
    }

    #[tokio::test]
    async fn dropping_the_stream_nacks_the_buffered_handoff() {
        let (handler, stream, _shutdown) = test_pair();
        let log = AckLog::default();

        let delivery = tokio::spawn({
            let handler = handler.clone();
            let acker = MemoryAck::new(log.clone(), "1");
            async move { handler.deliver(test_record(1), acker).await }
        });
        tokio::time::sleep(Duration::from_millis(20)).await;
        drop(stream);

        assert!(matches!(delivery.await.unwrap(), Err(DeliveryError::Closed)));
        assert_eq!(vec!["1".to_string()], log.nacked());
        assert!(log.acked().is_empty());
    }

    #[tokio::test]
    async fn close_is_idempotent() {
        let (handler, mut stream, _shutdown) = test_pair();
        handler.close().await;
        handler.close().await;

        let log = AckLog::default();
        let result = handler
            .deliver(test_record(1), MemoryAck::new(log.clone(), "1"))
            .await;
        assert!(result.is_err());
        assert!(stream.recv().await.is_none());
    }
}
