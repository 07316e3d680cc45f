//! Span helpers for the worker stack.

use super::metrics;
use opentelemetry::KeyValue;
use tracing::Span;

/// Span covering one job, from runner start to message reconciliation.
///
/// `job.outcome` is filled in by [`record_job_outcome`].
pub fn start_job_span(queue: &str, message_id: &str) -> Span {
    tracing::info_span!(
        "worker.job",
        "queue" = queue,
        "message.id" = message_id,
        "job.outcome" = tracing::field::Empty,
    )
}

/// Span covering a stack's hold on its semaphore lock.
pub fn start_stack_span(stack: &str) -> Span {
    tracing::info_span!("worker.stack", "stack" = stack)
}

/// Record how a job's message was settled and count it.
pub fn record_job_outcome(span: &Span, outcome: &'static str) {
    span.record("job.outcome", outcome);
    metrics::jobs_completed().add(1, &[KeyValue::new("outcome", outcome)]);
}
