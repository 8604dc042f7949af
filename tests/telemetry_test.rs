//! Integration tests for telemetry initialization and span helpers.

use procq::model::ProcessKey;
use procq::telemetry::queue::{
    record_pass_summary, record_status_change, start_claim_span, start_task_span,
    start_watchdog_span,
};

#[test]
fn telemetry_initializes_without_endpoint() {
    // The subscriber can only be set once per process; try_init() inside
    // init_telemetry turns a second attempt into an Err instead of a panic.
    let config = procq::telemetry::TelemetryConfig {
        endpoint: None,
        service_name: "procq-test".to_string(),
        default_level: "debug".to_string(),
    };
    let _guard = procq::telemetry::init_telemetry(config);
}

#[test]
fn watchdog_span_records_summary() {
    let span = start_watchdog_span();
    record_pass_summary(&span, 12, 3);
}

#[test]
fn claim_span_records_transition() {
    let key = ProcessKey::generate();
    let span = start_claim_span("agent-1");
    span.record("process.instance_id", tracing::field::display(key.instance_id));
    record_status_change(&span, &key, "ENQUEUED", "STARTING");
}

#[test]
fn task_span_creates() {
    let span = start_task_span("process-wait-watchdog");
    let _enter = span.enter();
}

#[test]
fn metric_instruments_build_without_a_provider() {
    use opentelemetry::KeyValue;
    use procq::telemetry::metrics;

    metrics::queue_operations().add(1, &[KeyValue::new("operation", "poll")]);
    metrics::watchdog_pass_duration_ms().record(1.5, &[]);
    metrics::commands_redelivered().add(0, &[]);
}
