//! Metric instrument factories for workq.
//!
//! Uses the OTel Meter API with the globally-registered `MeterProvider`.
//! All instruments are created lazily from the `"workq"` meter.

use std::sync::Arc;

use opentelemetry::KeyValue;
use opentelemetry::metrics::{Counter, Histogram, Meter, ObservableGauge};
use tokio::runtime::{Handle, RuntimeFlavor};
use tracing::error;

use crate::model::State;
use crate::store::QueueStore;

/// Returns the shared meter for workq instruments.
fn meter() -> Meter {
    opentelemetry::global::meter("workq")
}

/// Counter: records submitted by the enqueuer.
/// Labels: `queue`, `result` ("ok" | "duplicate" | "error").
pub fn records_enqueued() -> Counter<u64> {
    meter()
        .u64_counter("workq.records.enqueued")
        .with_description("Number of work records submitted")
        .build()
}

/// Counter: work record state transitions.
/// Labels: `from`, `to`.
pub fn record_transitions() -> Counter<u64> {
    meter()
        .u64_counter("workq.records.transitions")
        .with_description("Number of work record state transitions")
        .build()
}

pub fn record_transition(from: State, to: State) {
    record_transitions().add(
        1,
        &[
            KeyValue::new("from", from.as_str()),
            KeyValue::new("to", to.as_str()),
        ],
    );
}

/// Counter: worker-facing queue operations (claim, heartbeat, finalize).
/// Labels: `queue`, `operation`, `result`.
pub fn queue_operations() -> Counter<u64> {
    meter()
        .u64_counter("workq.queue.operations")
        .with_description("Number of queue operations")
        .build()
}

/// Counter: periodic routine executions.
/// Labels: `routine`, `result` ("ok" | "error").
pub fn routine_runs() -> Counter<u64> {
    meter()
        .u64_counter("workq.routine.runs")
        .with_description("Number of periodic routine executions")
        .build()
}

/// Histogram: periodic routine duration in milliseconds.
/// Labels: `routine`.
pub fn routine_duration_ms() -> Histogram<f64> {
    meter()
        .f64_histogram("workq.routine.duration_ms")
        .with_description("Periodic routine duration in milliseconds")
        .with_unit("ms")
        .build()
}

/// Observable gauge: number of queued records on `queue`, sampled from the
/// store each time the meter provider collects.
///
/// The callback runs on the metric reader's thread and blocks on the store
/// query through `handle`, so `handle` must belong to a multi-threaded
/// runtime when collection can happen on one of its workers.
pub fn queue_backlog_gauge(
    queue: &str,
    store: Arc<dyn QueueStore>,
    handle: Handle,
) -> ObservableGauge<i64> {
    let queue = queue.to_string();
    let labels = [KeyValue::new("queue", queue.clone())];

    meter()
        .i64_observable_gauge("workq.queue.queued")
        .with_description("Number of work records in the queued state")
        .with_callback(move |observer| {
            let count = match sample_blocking(&handle, store.as_ref(), &queue) {
                Ok(count) => count,
                Err(e) => {
                    error!(queue = %queue, error = %e, "failed to get queued record count");
                    0
                }
            };
            observer.observe(count, &labels);
        })
        .build()
}

fn sample_blocking(
    handle: &Handle,
    store: &dyn QueueStore,
    queue: &str,
) -> crate::error::Result<i64> {
    let fut = store.queued_count(queue);
    match Handle::try_current() {
        Ok(current) if current.runtime_flavor() == RuntimeFlavor::MultiThread => {
            tokio::task::block_in_place(|| handle.block_on(fut))
        }
        Ok(_) => Err(crate::error::Error::Other(
            "cannot sample backlog from a current-thread runtime".to_string(),
        )),
        Err(_) => handle.block_on(fut),
    }
}
