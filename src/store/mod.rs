//! Work record storage: enqueue with dedup, atomic claim, lease heartbeat,
//! finalize with retry, and stall reclaim.
//!
//! Two backends implement [`QueueStore`]: [`MemoryStore`] for tests and
//! single-process use, and [`PgStore`] over Postgres row locks. Both share
//! the lease and retry rules defined in this module so they cannot drift.

pub mod memory;
pub mod postgres;

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::error::{Error, Result};
use crate::model::{LeaseToken, NewWorkRecord, Outcome, State, WorkId, WorkRecord};
use crate::telemetry::metrics;

pub use memory::MemoryStore;
pub use postgres::PgStore;

/// Durable, multi-queue work record store.
///
/// The store exclusively owns state transitions. Every method is safe to
/// call concurrently from any number of tasks or processes.
#[async_trait]
pub trait QueueStore: Send + Sync {
    /// Insert a new `queued` record. Fails with [`Error::Duplicate`] if a record
    /// with the same queue and identity is already queued or dispatched.
    async fn enqueue(&self, new: NewWorkRecord) -> Result<WorkId>;

    /// Atomically lease the best eligible record on `queue`, or `None` when
    /// nothing is ready. Order is `(priority asc, queued_at asc)`.
    async fn claim(&self, queue: &str, worker_id: &str) -> Result<Option<WorkRecord>>;

    /// Extend the lease. Returns the updated record.
    async fn heartbeat(&self, id: WorkId, token: LeaseToken) -> Result<WorkRecord>;

    /// Record the worker's outcome. Failures under the retry limit requeue
    /// the record with backoff; at the limit the record becomes `failed`.
    async fn finalize(&self, id: WorkId, token: LeaseToken, outcome: Outcome)
    -> Result<WorkRecord>;

    /// Return every dispatched record on `queue` whose lease has expired to
    /// `queued`, clearing the lease. Returns how many were reclaimed.
    async fn reclaim_stalled(&self, queue: &str) -> Result<u64>;

    /// Number of records in `queued` state on `queue`.
    async fn queued_count(&self, queue: &str) -> Result<i64>;

    async fn get(&self, id: WorkId) -> Result<WorkRecord>;

    /// Records on `queue`, newest first, optionally filtered by state.
    async fn list(&self, queue: &str, state: Option<State>, limit: i64)
    -> Result<Vec<WorkRecord>>;

    /// Withdraw a queued record before it is dispatched.
    async fn cancel(&self, id: WorkId) -> Result<WorkRecord>;
}

// ---------------------------------------------------------------------------
// Policy
// ---------------------------------------------------------------------------

/// Bounded retry with capped exponential backoff.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// A failure that brings `attempt_count` to this value is terminal.
    pub max_attempts: u32,
    pub backoff_base: Duration,
    pub backoff_max: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            backoff_base: Duration::from_secs(10),
            backoff_max: Duration::from_secs(3600),
        }
    }
}

impl RetryPolicy {
    /// Delay before the next try after the `attempt`-th failure (1-based).
    pub fn backoff(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(16);
        self.backoff_base
            .saturating_mul(1u32 << exponent)
            .min(self.backoff_max)
    }
}

/// Per-queue store settings.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StoreConfig {
    /// How long a claim or heartbeat keeps a record leased.
    pub lease_duration: Duration,
    pub retry: RetryPolicy,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            lease_duration: Duration::from_secs(60),
            retry: RetryPolicy::default(),
        }
    }
}

impl StoreConfig {
    pub(crate) fn lease_deadline(&self, now: DateTime<Utc>) -> Result<DateTime<Utc>> {
        time_after(now, self.lease_duration)
    }
}

/// `now + d`, or a config error when the result is not a representable
/// timestamp.
pub(crate) fn time_after(now: DateTime<Utc>, d: Duration) -> Result<DateTime<Utc>> {
    chrono::Duration::from_std(d)
        .ok()
        .and_then(|delta| now.checked_add_signed(delta))
        .ok_or_else(|| {
            Error::Config(format!(
                "{}s after {now} is out of timestamp range",
                d.as_secs()
            ))
        })
}

// ---------------------------------------------------------------------------
// Shared transition rules
// ---------------------------------------------------------------------------

/// A lease is valid iff the record is dispatched, the token is current, and
/// the deadline has not passed.
pub(crate) fn check_lease(record: &WorkRecord, token: LeaseToken, now: DateTime<Utc>) -> Result<()> {
    if record.state != State::Dispatched {
        return Err(Error::LeaseExpired(record.id));
    }
    if record.lease_token != Some(token) {
        return Err(Error::LeaseMismatch(record.id));
    }
    match record.leased_until {
        Some(until) if until >= now => Ok(()),
        _ => Err(Error::LeaseExpired(record.id)),
    }
}

pub(crate) fn validate_transition(from: State, to: State) -> Result<()> {
    if from.can_transition_to(to) {
        Ok(())
    } else {
        Err(Error::InvalidTransition {
            from: from.to_string(),
            to: to.to_string(),
        })
    }
}

/// Move `record` to the dispatched state under a fresh lease.
pub(crate) fn apply_claim(
    record: &mut WorkRecord,
    worker_id: &str,
    config: &StoreConfig,
    now: DateTime<Utc>,
) -> Result<()> {
    validate_transition(record.state, State::Dispatched)?;
    let deadline = config.lease_deadline(now)?;
    metrics::record_transition(record.state, State::Dispatched);
    record.state = State::Dispatched;
    record.worker_id = Some(worker_id.to_string());
    record.lease_token = Some(LeaseToken::new());
    record.leased_until = Some(deadline);
    record.updated_at = now;
    Ok(())
}

/// Apply a worker outcome to a leased record. The caller has already checked
/// the lease.
pub(crate) fn apply_outcome(
    record: &mut WorkRecord,
    outcome: &Outcome,
    retry: &RetryPolicy,
    now: DateTime<Utc>,
) -> Result<()> {
    let to = if outcome.success {
        State::Completed
    } else if record.attempt_count + 1 < retry.max_attempts {
        State::Queued
    } else {
        State::Failed
    };
    validate_transition(record.state, to)?;
    let process_after = match to {
        State::Queued => Some(time_after(now, retry.backoff(record.attempt_count + 1))?),
        _ => None,
    };

    if !outcome.success {
        record.attempt_count += 1;
        record.last_error = Some(
            outcome
                .error
                .clone()
                .unwrap_or_else(|| "worker reported failure".to_string()),
        );
    }
    if let Some(at) = process_after {
        record.process_after = at;
    }

    metrics::record_transition(record.state, to);
    record.state = to;
    release_lease(record);
    record.updated_at = now;
    if to.is_terminal() {
        record.finished_at = Some(now);
    }
    Ok(())
}

/// Put a stalled record back in the queue without counting an attempt.
pub(crate) fn apply_reclaim(record: &mut WorkRecord, now: DateTime<Utc>) -> Result<()> {
    validate_transition(record.state, State::Queued)?;
    metrics::record_transition(record.state, State::Queued);
    record.state = State::Queued;
    release_lease(record);
    record.updated_at = now;
    Ok(())
}

pub(crate) fn apply_cancel(record: &mut WorkRecord, now: DateTime<Utc>) -> Result<()> {
    validate_transition(record.state, State::Canceled)?;
    metrics::record_transition(record.state, State::Canceled);
    record.state = State::Canceled;
    record.updated_at = now;
    record.finished_at = Some(now);
    Ok(())
}

fn release_lease(record: &mut WorkRecord) {
    record.worker_id = None;
    record.lease_token = None;
    record.leased_until = None;
}
