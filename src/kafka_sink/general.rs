use opentelemetry::global;
use opentelemetry::propagation::Injector;
use rdkafka::message::{Header, OwnedHeaders, ToBytes};
use rdkafka::producer::future_producer::OwnedDeliveryResult;
use rdkafka::producer::{FutureProducer, FutureRecord};
use std::time::Duration;
use tracing::{trace, Span};
use tracing_opentelemetry::OpenTelemetrySpanExt;

/// how long a row may wait for space in the producer queue before its delivery fails
pub const QUEUE_TIMEOUT: Duration = Duration::from_secs(0);

/// headers carrying the current span context, so consumers can continue the trace
pub fn generate_tracing_header() -> OwnedHeaders {
    let context = Span::current().context();
    let mut injector = HeaderInjector::default();
    global::get_text_map_propagator(|propagator| propagator.inject_context(&context, &mut injector));
    injector.into_headers()
}

/// produces one row and waits for its delivery report
#[tracing::instrument(level = "trace", skip_all, fields(topic = topic))]
pub async fn send_bytes_msg<T>(
    producer: &FutureProducer,
    topic: &str,
    key: &str,
    headers: OwnedHeaders,
    msg: &T,
) -> OwnedDeliveryResult
where
    T: ToBytes + ?Sized,
{
    let record = FutureRecord::to(topic).payload(msg).key(key).headers(headers);
    let result = producer.send(record, QUEUE_TIMEOUT).await;
    trace!("Delivery report received, ok: {}", result.is_ok());
    result
}

/// collects the propagated key value pairs as kafka headers
#[derive(Default)]
pub struct HeaderInjector {
    entries: Vec<(String, String)>,
}

impl HeaderInjector {
    pub fn into_headers(self) -> OwnedHeaders {
        self.entries
            .iter()
            .fold(OwnedHeaders::new_with_capacity(self.entries.len()), |headers, (key, value)| {
                headers.insert(Header {
                    key,
                    value: Some(value),
                })
            })
    }
}

impl Injector for HeaderInjector {
    fn set(&mut self, key: &str, value: String) {
        self.entries.retain(|(k, _)| k != key);
        self.entries.push((key.to_string(), value));
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use rdkafka::message::Headers;

    #[test]
    fn injected_keys_become_headers_and_are_overwritten() {
        let mut injector = HeaderInjector::default();
        injector.set("traceparent", "a".to_string());
        injector.set("tracestate", "b".to_string());
        injector.set("traceparent", "c".to_string());

        let headers = injector.into_headers();

        assert_eq!(2, headers.count());
        let traceparent = headers.iter().find(|h| h.key == "traceparent").unwrap();
        assert_eq!(Some(&b"c"[..]), traceparent.value);
    }
}
