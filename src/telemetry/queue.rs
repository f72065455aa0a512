//! Queue operation span helpers.

use tracing::Span;

/// Start a span for one queue operation.
///
/// The `queue.event_id` field is declared empty and filled once the
/// operation knows which item it touched (a claim only learns it after
/// reading the head of the queue).
pub fn start_queue_span(operation: &'static str, queue: &str) -> Span {
    tracing::info_span!(
        "queue.operation",
        "queue.operation" = operation,
        "queue.name" = queue,
        "queue.event_id" = tracing::field::Empty,
    )
}

/// Record which item the operation in `span` is acting on.
pub fn record_event_id(span: &Span, event_id: &str) {
    span.record("queue.event_id", event_id);
}

/// Record an item state transition on the given span.
pub fn record_state_transition(span: &Span, from: &str, to: &str) {
    span.in_scope(|| {
        tracing::info!(from = from, to = to, "state_transition");
    });
}
