use opentelemetry::metrics::MetricsError;
use opentelemetry::{global, KeyValue};
use opentelemetry_otlp::{ExportConfig, WithExportConfig};
use opentelemetry_sdk::metrics::SdkMeterProvider;
use opentelemetry_sdk::propagation::TraceContextPropagator;
use opentelemetry_sdk::{runtime, Resource};
use std::sync::OnceLock;
use tracing::subscriber::set_global_default;
use tracing::Subscriber;
use tracing_log::LogTracer;
use tracing_subscriber::fmt::format::FmtSpan;
use tracing_subscriber::fmt::MakeWriter;
use tracing_subscriber::{layer::SubscriberExt, EnvFilter};

const METER_NAME: &str = "stream-connector";

/// Ensures that the `tracing` stack is only initialised once
pub fn init_test_tracing() {
    static TRACING: OnceLock<()> = OnceLock::new();
    TRACING.get_or_init(|| {
        let default_filter_level = "info".to_string();
        let subscriber_name = "stream_connector_test".to_string();

        if std::env::var("TEST_LOG").is_ok_and(|x| x.to_lowercase().contains("true")) {
            let subscriber = get_subscriber(subscriber_name, default_filter_level, std::io::stdout);
            init_tracing_with_subscriber(subscriber);
        } else {
            let subscriber = get_subscriber(subscriber_name, default_filter_level, std::io::sink);
            init_tracing_with_subscriber(subscriber);
        }
    });
}

/// Plain formatting subscriber without an exporter.
/// set level via env variable "RUST_LOG"
pub fn get_subscriber<Sink>(
    _name: String,
    env_filter: String,
    sink: Sink,
) -> impl Subscriber + Send + Sync
where
    Sink: for<'a> MakeWriter<'a> + Send + Sync + 'static,
{
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(env_filter));
    let fmt_layer = tracing_subscriber::fmt::layer()
        .with_writer(sink)
        .with_thread_ids(true);

    tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt_layer)
}

/// Compose multiple layers into a `tracing`'s subscriber, exporting spans to an otlp endpoint.
/// set level via env variable "RUST_LOG"
pub fn get_open_telemetry_subscriber<Sink>(
    name: String,
    env_filter: String,
    sink: Sink,
) -> anyhow::Result<impl Subscriber + Send + Sync>
where
    Sink: for<'a> MakeWriter<'a> + Send + Sync + 'static,
{
    // init context propagation (required for kafka headers)
    global::set_text_map_propagator(TraceContextPropagator::new());

    // layer to output to i.e stout
    let fmt_layer = tracing_subscriber::fmt::layer()
        .with_writer(sink)
        .with_thread_ids(true)
        .with_span_events(FmtSpan::CLOSE);

    // layer to write to otlp endpoint
    let tracer = opentelemetry_otlp::new_pipeline()
        .tracing()
        .with_exporter(opentelemetry_otlp::new_exporter().tonic())
        .with_trace_config(
            opentelemetry_sdk::trace::config()
                .with_sampler(opentelemetry_sdk::trace::Sampler::AlwaysOn)
                .with_resource(Resource::new(vec![KeyValue::new(
                    opentelemetry_semantic_conventions::resource::SERVICE_NAME,
                    name,
                )])),
        )
        .install_batch(runtime::Tokio)?;
    let telemetry_layer = tracing_opentelemetry::layer().with_tracer(tracer);

    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(env_filter));

    Ok(tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt_layer)
        .with(telemetry_layer))
}

/// inits a meter provider
/// from https://github.com/open-telemetry/opentelemetry-rust/blob/main/opentelemetry-otlp/examples/basic-otlp/src/main.rs
pub fn init_metrics(meter_name: String) -> Result<SdkMeterProvider, MetricsError> {
    let provider = opentelemetry_otlp::new_pipeline()
        .metrics(runtime::Tokio)
        .with_exporter(
            opentelemetry_otlp::new_exporter()
                .tonic()
                .with_export_config(ExportConfig::default()),
        )
        .with_resource(Resource::new(vec![KeyValue::new(
            opentelemetry_semantic_conventions::resource::SERVICE_NAME,
            meter_name,
        )]))
        .build()?;

    global::set_meter_provider(provider.clone());
    Ok(provider)
}

/// Register a subscriber as global default to process span data.
///
/// It should only be called once!
pub fn init_tracing_with_subscriber(subscriber: impl Subscriber + Send + Sync) {
    // Redirect all `log`'s events to subscriber
    LogTracer::init().expect("Failed to set logger");
    set_global_default(subscriber).expect("Failed to set subscriber");
}

fn add_to_counter(name: &'static str, value: u64, attributes: &[KeyValue]) {
    let meter = global::meter(METER_NAME);
    let counter = meter.u64_counter(name).init();
    counter.add(value, attributes);
}

pub(crate) fn count_delivered() {
    add_to_counter("records_delivered", 1, &[]);
}

pub(crate) fn count_appended(target: &str) {
    add_to_counter("records_appended", 1, &[KeyValue::new("target", target.to_string())]);
}

pub(crate) fn count_append_failure(target: &str) {
    add_to_counter("append_failures", 1, &[KeyValue::new("target", target.to_string())]);
}

pub(crate) fn count_batch_open_failure(target: &str) {
    add_to_counter("batch_open_failures", 1, &[KeyValue::new("target", target.to_string())]);
}

/// counts a flush attempt together with the number of records it covered
pub(crate) fn count_flush(target: &str, records: usize, success: bool) {
    let attributes = [KeyValue::new("target", target.to_string())];
    if success {
        add_to_counter("batches_flushed", 1, &attributes);
        add_to_counter("records_flushed", records as u64, &attributes);
    } else {
        add_to_counter("flush_failures", 1, &attributes);
    }
}
