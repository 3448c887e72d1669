//! Queue operation span helpers.
//!
//! One span per engine operation. Fields declared `Empty` are filled in as
//! the operation learns them (the chosen item, the attempt count, the
//! outcome).

use tracing::Span;

use crate::model::QueueItemId;

/// Start a span for one engine operation.
pub fn start_operation_span(operation: &'static str) -> Span {
    tracing::info_span!(
        "queue.operation",
        "queue.operation" = operation,
        "queue.item_id" = tracing::field::Empty,
        "queue.acquirer" = tracing::field::Empty,
        "queue.attempts" = tracing::field::Empty,
        "queue.outcome" = tracing::field::Empty,
    )
}

pub fn record_item(span: &Span, id: QueueItemId) {
    span.record("queue.item_id", tracing::field::display(id));
}

pub fn record_acquirer(span: &Span, acquirer: &str) {
    span.record("queue.acquirer", acquirer);
}

pub fn record_attempts(span: &Span, attempts: u32) {
    span.record("queue.attempts", attempts);
}

/// Record the outcome on the span and emit a `debug` event scoped to it.
pub fn record_outcome(span: &Span, outcome: &str) {
    span.record("queue.outcome", outcome);
    span.in_scope(|| {
        tracing::debug!(outcome, "operation finished");
    });
}
