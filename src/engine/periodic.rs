//! Fixed-interval background routines.
//!
//! A routine runs its handler once immediately and then once per interval.
//! Runs never overlap: a slow run delays the next tick instead of stacking
//! ticks up. A failed run is logged and counted, and the next tick runs as
//! usual.

use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use opentelemetry::KeyValue;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::error::Result;
use crate::telemetry::metrics;

/// One unit of periodic work.
#[async_trait]
pub trait Handler: Send + Sync {
    async fn handle(&self) -> Result<()>;
}

pub struct PeriodicRoutine {
    name: String,
    interval: Duration,
    handler: Arc<dyn Handler>,
}

impl PeriodicRoutine {
    pub fn new(name: impl Into<String>, interval: Duration, handler: Arc<dyn Handler>) -> Self {
        Self {
            name: name.into(),
            interval,
            handler,
        }
    }

    /// Run until `shutdown` is cancelled. Cancellation also aborts an
    /// in-flight run at its next await point.
    pub async fn run(self, shutdown: CancellationToken) {
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        info!(routine = %self.name, interval_secs = self.interval.as_secs(), "routine started");

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => {}
            }

            let start = Instant::now();
            let result = tokio::select! {
                _ = shutdown.cancelled() => {
                    info!(routine = %self.name, "routine run aborted by shutdown");
                    break;
                }
                result = self.handler.handle() => result,
            };
            self.record(start, &result);
        }

        info!(routine = %self.name, "routine stopped");
    }

    fn record(&self, start: Instant, result: &Result<()>) {
        let elapsed_ms = start.elapsed().as_secs_f64() * 1000.0;
        let outcome = match result {
            Ok(()) => {
                debug!(routine = %self.name, elapsed_ms, "routine run succeeded");
                "ok"
            }
            Err(e) => {
                error!(routine = %self.name, elapsed_ms, error = %e, "routine run failed");
                "error"
            }
        };

        metrics::routine_runs().add(
            1,
            &[
                KeyValue::new("routine", self.name.clone()),
                KeyValue::new("result", outcome),
            ],
        );
        metrics::routine_duration_ms().record(
            elapsed_ms,
            &[KeyValue::new("routine", self.name.clone())],
        );
    }
}
