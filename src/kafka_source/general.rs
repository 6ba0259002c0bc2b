use opentelemetry::propagation::Extractor;
use opentelemetry::{global, Context};
use rdkafka::consumer::{ConsumerContext, Rebalance};
use rdkafka::error::KafkaResult;
use rdkafka::message::{BorrowedHeaders, Headers};
use rdkafka::{ClientContext, TopicPartitionList};
use tracing::{debug, info, warn, Span};
use tracing_opentelemetry::OpenTelemetrySpanExt;

/// Consumer context logging partition assignments and the background commits of stored offsets.
#[derive(Clone, Default)]
pub struct ConnectorContext;

impl ClientContext for ConnectorContext {}

impl ConsumerContext for ConnectorContext {
    fn pre_rebalance(&self, rebalance: &Rebalance) {
        match rebalance {
            Rebalance::Revoke(partitions) => {
                // in flight records of revoked partitions may be redelivered to another member
                info!("Revoking {} partitions", partitions.count())
            }
            Rebalance::Assign(partitions) => debug!("Assigning {} partitions", partitions.count()),
            Rebalance::Error(e) => warn!("Rebalance failed: {}", e),
        }
    }

    fn post_rebalance(&self, rebalance: &Rebalance) {
        if let Rebalance::Assign(partitions) = rebalance {
            info!("Assigned partitions {:?}", partitions.to_topic_map());
        }
    }

    fn commit_callback(&self, result: KafkaResult<()>, offsets: &TopicPartitionList) {
        match result {
            Ok(()) => debug!("Committed offsets of {} partitions", offsets.count()),
            Err(e) => warn!("Committing stored offsets failed: {}", e),
        }
    }
}

/// makes the producer's trace the parent of the current span, if the message carried one
pub fn extract_context_from_header(maybe_headers: Option<&BorrowedHeaders>) {
    if let Some(headers) = maybe_headers {
        Span::current().set_parent(context_from_headers(headers));
    }
}

fn context_from_headers(headers: &BorrowedHeaders) -> Context {
    global::get_text_map_propagator(|propagator| propagator.extract(&HeaderExtractor(headers)))
}

/// read access to the otel propagation keys within kafka message headers
pub struct HeaderExtractor<'a>(pub &'a BorrowedHeaders);

impl<'a> Extractor for HeaderExtractor<'a> {
    fn get(&self, key: &str) -> Option<&str> {
        self.0
            .iter()
            .find(|header| header.key == key)
            .and_then(|header| header.value)
            .and_then(|value| std::str::from_utf8(value).ok())
    }

    fn keys(&self) -> Vec<&str> {
        self.0.iter().map(|header| header.key).collect()
    }
}
