use crate::delivery::DeliveryHandler;
use crate::kafka_source::general::extract_context_from_header;
use crate::record::{Acknowledge, FieldValue, Record};
use crate::source::{PushSource, SourceError, Subscription};
use anyhow::Error;
use bytes::Bytes;
use futures::FutureExt;
use rdkafka::consumer::{Consumer, ConsumerContext, StreamConsumer};
use rdkafka::message::OwnedMessage;
use rdkafka::{ClientConfig, ClientContext, Message, Offset};
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

/// turns the payload of a kafka message into the fields appended to the sink
pub type PayloadDecoder = Arc<dyn Fn(&[u8]) -> Vec<FieldValue> + Send + Sync>;

///
/// Push source on top of a kafka consumer group. Every received message is handed to the
/// delivery handler from its own task, bounded by `max_in_flight`.
///
/// Acking stores the offset for the next auto commit once every lower offset of the partition
/// was acked as well, nacking seeks the partition back to the message so it and everything after
/// it is delivered again.
///
pub struct KafkaPushSource<C: ClientContext + ConsumerContext + Clone> {
    consumer_config: ClientConfig,
    context: C,
    pub topics: Vec<String>,
    pub max_in_flight: usize,
    pub get_otel_context_from_header: bool,
    decoder: PayloadDecoder,
}

impl<C: ClientContext + ConsumerContext + Clone + 'static> KafkaPushSource<C> {
    pub fn new(
        mut consumer_config: ClientConfig,
        context: C,
        topics: &[&str],
        max_in_flight: usize,
        get_otel_context_from_header: bool,
    ) -> Self {
        let consumer_config = consumer_config
            // offsets are only stored once the record was written, the stored ones are committed in the background
            .set("enable.auto.commit", "true")
            .set("enable.auto.offset.store", "false")
            .set("enable.partition.eof", "false")
            .to_owned();

        KafkaPushSource {
            consumer_config,
            context,
            topics: topics.iter().map(|t| t.to_string()).collect(),
            max_in_flight: max_in_flight.max(1),
            get_otel_context_from_header,
            decoder: Arc::new(|payload| vec![FieldValue::Bytes(Bytes::copy_from_slice(payload))]),
        }
    }

    /// replaces the default decoder, which appends the raw payload as a single bytes field
    pub fn with_decoder(
        mut self,
        decoder: impl Fn(&[u8]) -> Vec<FieldValue> + Send + Sync + 'static,
    ) -> Self {
        self.decoder = Arc::new(decoder);
        self
    }
}

impl<C> PushSource for KafkaPushSource<C>
where
    C: ClientContext + ConsumerContext + Clone + Send + Sync + 'static,
{
    type Subscription = KafkaSubscription<C>;

    #[tracing::instrument(skip_all)]
    async fn subscribe(&self) -> Result<KafkaSubscription<C>, SourceError> {
        let consumer: StreamConsumer<C> = self
            .consumer_config
            .create_with_context(self.context.clone())
            .map_err(|e| SourceError::Subscription(Error::new(e).context("Consumer creation failed")))?;

        let topics: Vec<&str> = self.topics.iter().map(String::as_str).collect();
        consumer
            .subscribe(&topics)
            .map_err(|e| SourceError::Subscription(Error::new(e).context("Can't subscribe to specified topics")))?;
        info!("Subscribed to topics {:?}", topics);

        Ok(KafkaSubscription {
            consumer: Arc::new(consumer),
            offsets: Arc::new(OffsetTracker::default()),
            max_in_flight: self.max_in_flight,
            get_otel_context_from_header: self.get_otel_context_from_header,
            decoder: self.decoder.clone(),
        })
    }
}

pub struct KafkaSubscription<C: ClientContext + ConsumerContext + 'static> {
    consumer: Arc<StreamConsumer<C>>,
    offsets: Arc<OffsetTracker>,
    max_in_flight: usize,
    get_otel_context_from_header: bool,
    decoder: PayloadDecoder,
}

impl<C> KafkaSubscription<C>
where
    C: ClientContext + ConsumerContext + Send + Sync + 'static,
{
    fn to_record(&self, message: &OwnedMessage) -> Record {
        let payload = message.payload().unwrap_or_default();
        Record::new(Bytes::copy_from_slice(payload), (self.decoder)(payload)).with_correlation_id(
            format!(
                "{}/{}/{}",
                message.topic(),
                message.partition(),
                message.offset()
            ),
        )
    }
}

impl<C> Subscription for KafkaSubscription<C>
where
    C: ClientContext + ConsumerContext + Send + Sync + 'static,
{
    #[tracing::instrument(skip_all)]
    async fn receive(
        self,
        handler: DeliveryHandler,
        shutdown: CancellationToken,
    ) -> Result<(), SourceError> {
        let permits = Arc::new(Semaphore::new(self.max_in_flight));
        let mut deliveries = JoinSet::new();

        let result = loop {
            let message = tokio::select! {
                _ = shutdown.cancelled() => break Ok(()),
                message = self.consumer.recv() => message,
            };
            let message = match message {
                Ok(m) => {
                    if self.get_otel_context_from_header {
                        extract_context_from_header(m.headers());
                    }
                    m.detach()
                }
                Err(e) => {
                    error!("Kafka error: {}", e);
                    break Err(SourceError::Runtime(Error::from(e)));
                }
            };

            let permit = match permits.clone().acquire_owned().await {
                Ok(permit) => permit,
                Err(e) => break Err(SourceError::Runtime(Error::from(e))),
            };
            let record = self.to_record(&message);
            self.offsets
                .track(message.topic(), message.partition(), message.offset());
            let acker = KafkaAck {
                consumer: self.consumer.clone(),
                offsets: self.offsets.clone(),
                topic: message.topic().to_string(),
                partition: message.partition(),
                offset: message.offset(),
            };
            let handler = handler.clone();
            deliveries.spawn(async move {
                let _permit = permit;
                if let Err(e) = handler.deliver(record, acker).await {
                    debug!("Delivery rejected: {}", e);
                }
            });

            // reap finished deliveries
            while let Some(Some(_)) = deliveries.join_next().now_or_never() {}
        };

        // let pending hand-offs finish, rejected ones are nacked by the handler
        while deliveries.join_next().await.is_some() {}
        self.consumer.unsubscribe();
        result
    }
}

/// Outstanding offsets per partition.
///
/// Records are handed off and acked in any order, but only the contiguous acked prefix of a
/// partition may be stored. A nacked offset stays outstanding until it is delivered again.
#[derive(Default)]
struct OffsetTracker {
    partitions: Mutex<HashMap<(String, i32), BTreeMap<i64, bool>>>,
}

impl OffsetTracker {
    fn lock(&self) -> MutexGuard<'_, HashMap<(String, i32), BTreeMap<i64, bool>>> {
        self.partitions
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// registers a received offset as outstanding, a redelivered one is reset
    fn track(&self, topic: &str, partition: i32, offset: i64) {
        self.lock()
            .entry((topic.to_string(), partition))
            .or_default()
            .insert(offset, false);
    }

    /// Marks the offset as written. Returns the next offset to store, if the low-water mark moved.
    fn ack(&self, topic: &str, partition: i32, offset: i64) -> Option<i64> {
        let mut partitions = self.lock();
        let outstanding = partitions.get_mut(&(topic.to_string(), partition))?;
        if let Some(acked) = outstanding.get_mut(&offset) {
            *acked = true;
        }

        let mut next = None;
        while let Some(entry) = outstanding.first_entry() {
            if !*entry.get() {
                break;
            }
            next = Some(*entry.key() + 1);
            entry.remove();
        }
        next
    }
}

/// acknowledges a single kafka message by its coordinates
struct KafkaAck<C: ClientContext + ConsumerContext + 'static> {
    consumer: Arc<StreamConsumer<C>>,
    offsets: Arc<OffsetTracker>,
    topic: String,
    partition: i32,
    offset: i64,
}

impl<C> Acknowledge for KafkaAck<C>
where
    C: ClientContext + ConsumerContext + Send + Sync + 'static,
{
    fn ack(self: Box<Self>) {
        let Some(next) = self.offsets.ack(&self.topic, self.partition, self.offset) else {
            trace!(
                "Offset {}/{}/{} acked behind outstanding ones",
                self.topic, self.partition, self.offset
            );
            return;
        };
        if let Err(e) = self.consumer.store_offset(&self.topic, self.partition, next) {
            warn!(
                "Failed to store offset {}/{}/{}: {}",
                self.topic, self.partition, next, e
            );
        }
    }

    fn nack(self: Box<Self>) {
        // the offset stays outstanding, so nothing behind it is stored
        if let Err(e) = self.consumer.seek(
            &self.topic,
            self.partition,
            Offset::Offset(self.offset),
            Duration::ZERO,
        ) {
            warn!(
                "Failed to seek back to {}/{}/{}: {}",
                self.topic, self.partition, self.offset, e
            );
        }
    }
}
