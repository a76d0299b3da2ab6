//! Span helpers for queue operations and discovery passes.

use tracing::Span;

use crate::model::WorkId;

/// Start a span for a worker-facing queue operation.
///
/// The `work.id` field is declared empty because a claim only learns the
/// record it leased after the store answers.
pub fn start_queue_span(queue: &str, operation: &str, worker_id: &str) -> Span {
    tracing::info_span!(
        "queue.operation",
        "queue.name" = queue,
        "queue.operation" = operation,
        "worker.id" = worker_id,
        "work.id" = tracing::field::Empty,
    )
}

/// Attach the record ID to a queue span.
pub fn record_work_id(span: &Span, id: WorkId) {
    span.record("work.id", tracing::field::display(id));
}

/// Start a span for one discovery-and-enqueue pass.
pub fn start_discovery_span(queue: &str) -> Span {
    tracing::info_span!(
        "discovery.pass",
        "queue.name" = queue,
        "discovery.enqueued" = tracing::field::Empty,
        "discovery.duplicates" = tracing::field::Empty,
    )
}

/// Record a state transition event on the given span.
pub fn record_state_transition(span: &Span, from: &str, to: &str) {
    span.in_scope(|| {
        tracing::info!(from = from, to = to, "state_transition");
    });
}
