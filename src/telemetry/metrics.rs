//! Metric instruments.
//!
//! Built on demand from the `"leasehold"` meter of the global
//! `MeterProvider`, which is a no-op until telemetry is initialized.

use opentelemetry::metrics::{Counter, Histogram, Meter};

fn meter() -> Meter {
    opentelemetry::global::meter("leasehold")
}

/// Counter: lock acquisition attempts.
/// Labels: `lock_type` ("Read" | "Write"), `result` ("ok" | "unavailable" | "error").
pub fn lock_acquisitions() -> Counter<u64> {
    meter()
        .u64_counter("leasehold.lock.acquisitions")
        .with_description("Number of read / write lock acquisition attempts")
        .build()
}

/// Counter: lock releases.
/// Labels: `lock_type`, `result` ("ok" | "error").
pub fn lock_releases() -> Counter<u64> {
    meter()
        .u64_counter("leasehold.lock.releases")
        .with_description("Number of read / write lock releases")
        .build()
}

/// Counter: queue calls made by the worker stack.
/// Labels: `queue`, `operation`.
pub fn queue_operations() -> Counter<u64> {
    meter()
        .u64_counter("leasehold.queue.operations")
        .with_description("Number of queue operations")
        .build()
}

/// Counter: finished jobs.
/// Labels: `outcome` ("deleted" | "retry" | "failed" | "abandoned").
pub fn jobs_completed() -> Counter<u64> {
    meter()
        .u64_counter("leasehold.jobs.completed")
        .with_description("Number of worker jobs by outcome")
        .build()
}

/// Histogram: job run time including message reconciliation.
/// Labels: `queue`.
pub fn job_duration_ms() -> Histogram<f64> {
    meter()
        .f64_histogram("leasehold.job.duration_ms")
        .with_description("Worker job duration in milliseconds")
        .with_unit("ms")
        .build()
}
