//! Discovery pass: find every series across every insight, drop series that
//! repeat an earlier one by content, and submit one work record per unique
//! series with staggered eligibility times.

use std::collections::HashSet;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use opentelemetry::KeyValue;
use serde_json::json;
use tracing::{Instrument, debug, info, warn};

use super::{DefinitionSource, encode, with_count_unlimited};
use crate::clock::Clock;
use crate::engine::periodic::Handler;
use crate::error::{Error, ErrorList, Result};
use crate::model::{NewWorkRecord, WorkId, cost, priority};
use crate::store::{QueueStore, time_after};
use crate::telemetry::metrics;
use crate::telemetry::work::start_discovery_span;

/// Spacing between the eligibility times of consecutive records in one pass,
/// so a large batch of queries does not hit search all at once.
pub const QUERY_JOB_OFFSET: Duration = Duration::from_secs(30);

/// What the enqueuer submits and where.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EnqueuerConfig {
    pub queue_name: String,
    pub offset_stride: Duration,
    pub priority: i32,
    pub cost: i32,
}

impl Default for EnqueuerConfig {
    fn default() -> Self {
        Self {
            queue_name: "insights".to_string(),
            offset_stride: QUERY_JOB_OFFSET,
            priority: priority::HIGH,
            cost: cost::INDEXED,
        }
    }
}

/// Counts from one completed pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PassSummary {
    /// Unique series found in this pass.
    pub unique: usize,
    /// Series skipped because an earlier series in the pass had the same identity.
    pub repeated: usize,
    /// Records the store accepted.
    pub enqueued: usize,
    /// Records the store rejected as already queued or dispatched.
    pub already_queued: usize,
    /// Records that failed to submit for any other reason.
    pub failed: usize,
}

/// Run one discovery pass against `source`, handing each new record to `emit`.
///
/// Every unique series is emitted even if earlier emissions fail; failures
/// are collected and returned together as [`Error::Aggregate`]. A duplicate
/// rejection from `emit` means the work is already pending and is not an
/// error. If the source itself fails, nothing is emitted.
pub async fn discover_and_enqueue<F, Fut>(
    now: DateTime<Utc>,
    source: &dyn DefinitionSource,
    config: &EnqueuerConfig,
    mut emit: F,
) -> Result<PassSummary>
where
    F: FnMut(NewWorkRecord) -> Fut,
    Fut: Future<Output = Result<WorkId>>,
{
    let insights = source.discover().await.map_err(|e| match e {
        Error::DiscoverySource(_) => e,
        other => Error::DiscoverySource(other.to_string()),
    })?;

    let mut seen = HashSet::new();
    let mut summary = PassSummary::default();
    let mut errors = ErrorList::default();
    let mut offset = Duration::ZERO;

    for insight in &insights {
        for series in &insight.series {
            let series_id = encode(series);
            if !seen.insert(series_id.clone()) {
                summary.repeated += 1;
                continue;
            }
            summary.unique += 1;

            let process_after = time_after(now, offset)?;
            offset = offset.saturating_add(config.offset_stride);

            let query = with_count_unlimited(&series.query);
            let record = NewWorkRecord::new(&config.queue_name, &series_id)
                .payload(json!({
                    "series_id": series_id,
                    "search_query": query,
                }))
                .priority(config.priority)
                .cost(config.cost)
                .process_after(process_after);

            let result = match emit(record).await {
                Ok(id) => {
                    debug!(insight = %insight.id, %series_id, %id, %process_after, "enqueued series");
                    summary.enqueued += 1;
                    "ok"
                }
                Err(e) if e.is_duplicate() => {
                    debug!(insight = %insight.id, %series_id, "series already queued");
                    summary.already_queued += 1;
                    "duplicate"
                }
                Err(e) => {
                    warn!(insight = %insight.id, %series_id, error = %e, "failed to enqueue series");
                    summary.failed += 1;
                    errors.push(e);
                    "error"
                }
            };
            metrics::records_enqueued().add(
                1,
                &[
                    KeyValue::new("queue", config.queue_name.clone()),
                    KeyValue::new("result", result),
                ],
            );
        }
    }

    info!(
        queue = %config.queue_name,
        insights = insights.len(),
        unique = summary.unique,
        enqueued = summary.enqueued,
        already_queued = summary.already_queued,
        failed = summary.failed,
        "discovery pass finished"
    );
    errors.into_result()?;
    Ok(summary)
}

/// The periodic discovery job: reads definitions from a source and submits
/// to a store.
pub struct InsightEnqueuer {
    store: Arc<dyn QueueStore>,
    source: Arc<dyn DefinitionSource>,
    config: EnqueuerConfig,
    clock: Arc<dyn Clock>,
}

impl InsightEnqueuer {
    pub fn new(
        store: Arc<dyn QueueStore>,
        source: Arc<dyn DefinitionSource>,
        config: EnqueuerConfig,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            store,
            source,
            config,
            clock,
        }
    }

    /// Run a single pass now.
    pub async fn run_once(&self) -> Result<PassSummary> {
        let span = start_discovery_span(&self.config.queue_name);
        let store = Arc::clone(&self.store);

        let result = discover_and_enqueue(
            self.clock.now(),
            self.source.as_ref(),
            &self.config,
            move |record| {
                let store = Arc::clone(&store);
                async move { store.enqueue(record).await }
            },
        )
        .instrument(span.clone())
        .await;

        if let Ok(summary) = &result {
            span.record("discovery.enqueued", summary.enqueued);
            span.record("discovery.duplicates", summary.already_queued + summary.repeated);
        }
        result
    }
}

#[async_trait]
impl Handler for InsightEnqueuer {
    async fn handle(&self) -> Result<()> {
        self.run_once().await.map(|_| ())
    }
}
