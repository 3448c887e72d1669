//! Metric instrument factories for relq.
//!
//! Uses the OTel Meter API with the globally-registered `MeterProvider`.
//! All instruments are created lazily from the `"relq"` meter; without a
//! provider they are no-ops.

use opentelemetry::metrics::{Counter, Histogram, Meter};

/// Returns the shared meter for relq instruments.
fn meter() -> Meter {
    opentelemetry::global::meter(super::SERVICE_NAME)
}

/// Counter: queue transitions attempted by the engine.
/// Labels: `operation` ("enqueue" | "acquire" | ...), `outcome`
/// ("success" | "empty" | "rejected" | "error").
pub fn transitions() -> Counter<u64> {
    meter()
        .u64_counter("relq.queue.transitions")
        .with_description("Number of queue state transitions")
        .build()
}

/// Histogram: attempts used by one acquire call.
/// Labels: `outcome`.
pub fn acquire_attempts() -> Histogram<u64> {
    meter()
        .u64_histogram("relq.queue.acquire_attempts")
        .with_description("Attempts per acquire call")
        .build()
}

/// Counter: soft conflicts seen by the acquire loop.
/// Labels: `kind` ("marker_gone" | "duplicate" | "other" | "orphaned").
pub fn conflicts() -> Counter<u64> {
    meter()
        .u64_counter("relq.queue.conflicts")
        .with_description("Lost acquire races and consistency violations")
        .build()
}

/// Counter: audit entries that could not be written.
pub fn audit_write_failures() -> Counter<u64> {
    meter()
        .u64_counter("relq.audit.write_failures")
        .with_description("Audit log entries dropped after a write failure")
        .build()
}

/// Histogram: operation duration in milliseconds.
/// Labels: `operation`.
pub fn operation_duration_ms() -> Histogram<f64> {
    meter()
        .f64_histogram("relq.operation.duration_ms")
        .with_description("Operation duration in milliseconds")
        .with_unit("ms")
        .build()
}
