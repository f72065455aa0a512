//! Metric instrument factories for redeque.
//!
//! Uses the OTel Meter API with the globally-registered `MeterProvider`.
//! All instruments are created lazily from the `"redeque"` meter.

use opentelemetry::metrics::{Counter, Histogram, Meter};

/// Returns the shared meter for redeque instruments.
fn meter() -> Meter {
    opentelemetry::global::meter("redeque")
}

/// Counter: queue-level operations.
/// Labels: `queue`, `operation` ("enqueue" | "claim" | "claim_empty" |
/// "acknowledge" | "recover" | "release").
pub fn queue_operations() -> Counter<u64> {
    meter()
        .u64_counter("redeque.queue.operations")
        .with_description("Number of queue operations")
        .build()
}

/// Counter: claim attempts that lost the race for the queue head.
/// Labels: `queue`.
pub fn claim_contention() -> Counter<u64> {
    meter()
        .u64_counter("redeque.claim.contention")
        .with_description("Claim attempts that lost a race with another consumer")
        .build()
}

/// Counter: items moved back to the unclaimed list after their lease expired.
/// Labels: `queue`, `trigger` ("explicit" | "lazy" | "sweep").
pub fn recoveries() -> Counter<u64> {
    meter()
        .u64_counter("redeque.item.recoveries")
        .with_description("Expired claims returned to the unclaimed list")
        .build()
}

/// Counter: scripts reloaded after the server answered NOSCRIPT.
/// Labels: `script`.
pub fn script_reloads() -> Counter<u64> {
    meter()
        .u64_counter("redeque.script.reloads")
        .with_description("Scripts reloaded after a server cache miss")
        .build()
}

/// Histogram: operation duration in milliseconds.
/// Labels: `operation`.
pub fn operation_duration_ms() -> Histogram<f64> {
    meter()
        .f64_histogram("redeque.operation.duration_ms")
        .with_description("Operation duration in milliseconds")
        .with_unit("ms")
        .build()
}
