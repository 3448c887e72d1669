//! Integration tests for telemetry initialization and span helpers.

use relq::model::QueueItemId;
use relq::telemetry::queue::{
    record_acquirer, record_attempts, record_item, record_outcome, start_operation_span,
};

#[test]
fn telemetry_initializes_without_endpoint() {
    // Note: tracing subscriber can only be set once per process.
    // try_init() in the implementation returns Err instead of panicking
    // if another test already installed one.
    let config = relq::telemetry::TelemetryConfig::new(None, "warn");
    assert_eq!(config.service_name, "relq");
    let _guard = relq::telemetry::init_telemetry(config);
}

#[test]
fn telemetry_settings_come_from_config() {
    let config = relq::config::Config::from_lookup(|name: &str| match name {
        "DATABASE_URL" => Some("postgres://localhost/relq".to_string()),
        "OTEL_ENDPOINT" => Some("http://collector:4317".to_string()),
        "LOG_LEVEL" => Some("relq=debug".to_string()),
        _ => None,
    })
    .unwrap();

    let telemetry = relq::telemetry::TelemetryConfig::from(&config);
    assert_eq!(telemetry.endpoint.as_deref(), Some("http://collector:4317"));
    assert_eq!(telemetry.default_filter, "relq=debug");
    assert_eq!(telemetry.store, relq::telemetry::POSTGRES_STORE);

    let memory = telemetry.with_store(relq::telemetry::MEMORY_STORE);
    assert_eq!(memory.store, "memory");
}

#[test]
fn operation_span_records_fields() {
    let span = start_operation_span("acquire");
    record_item(&span, QueueItemId::new());
    record_acquirer(&span, "worker-1");
    record_attempts(&span, 3);
    record_outcome(&span, "success");
}

#[test]
fn metric_instruments_work_without_provider() {
    use opentelemetry::KeyValue;
    use relq::telemetry::metrics;

    metrics::transitions().add(
        1,
        &[
            KeyValue::new("operation", "enqueue"),
            KeyValue::new("outcome", "success"),
        ],
    );
    metrics::acquire_attempts().record(2, &[KeyValue::new("outcome", "success")]);
    metrics::conflicts().add(1, &[KeyValue::new("kind", "marker_gone")]);
    metrics::audit_write_failures().add(1, &[]);
    metrics::operation_duration_ms().record(1.5, &[KeyValue::new("operation", "acquire")]);
}
