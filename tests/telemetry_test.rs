//! Integration tests for telemetry initialization and span helpers.

use leasehold::telemetry::{TelemetryConfig, init_telemetry, metrics, spans};
use opentelemetry::KeyValue;

#[test]
fn telemetry_initializes_without_endpoint() {
    // A global subscriber can only be set once per process, so a second
    // init in the same binary returns Err. Either result is acceptable here.
    let config = TelemetryConfig::new("leasehold-test");
    if let Ok(guard) = init_telemetry(config) {
        assert!(!guard.is_exporting());
        guard.force_flush();
    }
}

#[test]
fn invalid_log_level_is_a_config_error() {
    let mut config = TelemetryConfig::new("leasehold-test");
    config.log_level = "info,leasehold=notalevel".to_string();
    // RUST_LOG wins when set, so only check when it is absent.
    if std::env::var("RUST_LOG").is_err() {
        assert!(matches!(
            init_telemetry(config),
            Err(leasehold::Error::Config(_))
        ));
    }
}

#[test]
fn job_span_records_outcome() {
    let span = spans::start_job_span("table-update", "msg-1");
    spans::record_job_outcome(&span, "deleted");
    spans::record_job_outcome(&span, "retry");
}

#[test]
fn stack_span_creates() {
    let span = spans::start_stack_span("table-update");
    let _entered = span.enter();
}

#[test]
fn metric_instruments_accept_records() {
    metrics::lock_acquisitions().add(
        1,
        &[
            KeyValue::new("lock_type", "Read"),
            KeyValue::new("result", "ok"),
        ],
    );
    metrics::lock_releases().add(
        1,
        &[
            KeyValue::new("lock_type", "Write"),
            KeyValue::new("result", "error"),
        ],
    );
    metrics::queue_operations().add(
        1,
        &[
            KeyValue::new("queue", "table-update"),
            KeyValue::new("operation", "receive"),
        ],
    );
    metrics::job_duration_ms().record(12.5, &[KeyValue::new("queue", "table-update")]);
}
