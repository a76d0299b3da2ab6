//! Core data model.
//!
//! A work record is one schedulable unit of work. It has a content-derived
//! identity (for dedup), an opaque payload, priority and cost, a delayed
//! eligibility time, lease bookkeeping while dispatched, and retry bookkeeping.

use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::Error;

// ---------------------------------------------------------------------------
// Work Record
// ---------------------------------------------------------------------------

/// A unit of work tracked by a queue store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkRecord {
    /// Unique identifier.
    pub id: WorkId,

    /// The named queue this record belongs to.
    pub queue_name: String,

    /// Content-derived dedup key. At most one record per (queue, identity)
    /// may be queued or dispatched at a time.
    pub identity: String,

    /// Queue-specific data for the worker. The store never interprets it.
    pub payload: serde_json::Value,

    /// Current lifecycle state.
    pub state: State,

    /// Lower = dequeued sooner.
    pub priority: i32,

    /// Capacity classification for downstream policies. Not enforced here.
    pub cost: i32,

    pub queued_at: DateTime<Utc>,

    /// Not eligible for dispatch before this instant.
    pub process_after: DateTime<Utc>,

    /// Worker holding the current lease, if dispatched.
    pub worker_id: Option<String>,
    pub lease_token: Option<LeaseToken>,
    pub leased_until: Option<DateTime<Utc>>,

    /// Number of failed attempts so far. Reclaiming a stalled lease does not count.
    pub attempt_count: u32,
    pub last_error: Option<String>,

    pub updated_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl WorkRecord {
    /// Ready for dispatch at `now`.
    pub fn is_eligible(&self, now: DateTime<Utc>) -> bool {
        self.state == State::Queued && self.process_after <= now
    }

    /// Dispatched with a lease deadline already behind `now`.
    pub fn is_stalled(&self, now: DateTime<Utc>) -> bool {
        self.state == State::Dispatched && self.leased_until.is_some_and(|until| until < now)
    }
}

/// Newtype for work record IDs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct WorkId(pub Uuid);

impl WorkId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for WorkId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for WorkId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for WorkId {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s)
            .map(WorkId)
            .map_err(|e| Error::Other(format!("invalid work id {s:?}: {e}")))
    }
}

/// Opaque token identifying one lease on one record. A fresh token is minted
/// on every claim, so a worker that lost its lease cannot act on a re-claim.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct LeaseToken(pub Uuid);

impl LeaseToken {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for LeaseToken {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for LeaseToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

// ---------------------------------------------------------------------------
// State
// ---------------------------------------------------------------------------

/// Lifecycle state of a work record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum State {
    /// Waiting for `process_after` and a worker.
    Queued,
    /// Leased to a worker.
    Dispatched,
    /// Done successfully. Terminal.
    Completed,
    /// Exhausted retries. Terminal, kept for operator inspection.
    Failed,
    /// Withdrawn before dispatch. Terminal.
    Canceled,
}

impl State {
    /// Can transition from self to `to`?
    pub fn can_transition_to(self, to: State) -> bool {
        use State::*;
        matches!(
            (self, to),
            (Queued, Dispatched)
                | (Queued, Canceled)
                | (Dispatched, Queued)  // stall reclaim or retry
                | (Dispatched, Completed)
                | (Dispatched, Failed)
        )
    }

    /// Is this a terminal state?
    pub fn is_terminal(self) -> bool {
        matches!(self, State::Completed | State::Failed | State::Canceled)
    }

    /// Whether the record counts against identity uniqueness.
    pub fn is_active(self) -> bool {
        matches!(self, State::Queued | State::Dispatched)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            State::Queued => "queued",
            State::Dispatched => "dispatched",
            State::Completed => "completed",
            State::Failed => "failed",
            State::Canceled => "canceled",
        }
    }
}

impl std::fmt::Display for State {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.pad(self.as_str())
    }
}

impl FromStr for State {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "queued" => Ok(State::Queued),
            "dispatched" => Ok(State::Dispatched),
            "completed" => Ok(State::Completed),
            "failed" => Ok(State::Failed),
            "canceled" => Ok(State::Canceled),
            other => Err(Error::Other(format!("unknown state: {other}"))),
        }
    }
}

// ---------------------------------------------------------------------------
// Priority & Cost
// ---------------------------------------------------------------------------

/// Priority levels. Lower values are dequeued first.
pub mod priority {
    pub const CRITICAL: i32 = 0;
    pub const HIGH: i32 = 10;
    pub const MEDIUM: i32 = 100;
    pub const LOW: i32 = 1000;
}

/// Cost classes, informational for worker capacity policies.
pub mod cost {
    /// Answerable from a search index.
    pub const INDEXED: i32 = 0;
    /// Requires an expensive unindexed scan.
    pub const UNINDEXED: i32 = 100;
}

// ---------------------------------------------------------------------------
// Outcome
// ---------------------------------------------------------------------------

/// What a worker reports when it finalizes a lease.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Outcome {
    pub success: bool,
    /// Error message if failed.
    #[serde(default)]
    pub error: Option<String>,
}

impl Outcome {
    pub fn success() -> Self {
        Self {
            success: true,
            error: None,
        }
    }

    pub fn failure(error: impl Into<String>) -> Self {
        Self {
            success: false,
            error: Some(error.into()),
        }
    }
}

// ---------------------------------------------------------------------------
// Builder
// ---------------------------------------------------------------------------

/// Builder for creating new work records. The store's input for `enqueue`.
#[derive(Debug, Clone, PartialEq)]
pub struct NewWorkRecord {
    pub queue_name: String,
    pub identity: String,
    pub payload: serde_json::Value,
    pub priority: i32,
    pub cost: i32,
    pub process_after: Option<DateTime<Utc>>,
}

impl NewWorkRecord {
    pub fn new(queue_name: impl Into<String>, identity: impl Into<String>) -> Self {
        Self {
            queue_name: queue_name.into(),
            identity: identity.into(),
            payload: serde_json::Value::Null,
            priority: priority::MEDIUM,
            cost: cost::INDEXED,
            process_after: None,
        }
    }

    pub fn payload(mut self, payload: serde_json::Value) -> Self {
        self.payload = payload;
        self
    }

    pub fn priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    pub fn cost(mut self, cost: i32) -> Self {
        self.cost = cost;
        self
    }

    /// Delay eligibility until `at`. Defaults to the enqueue time.
    pub fn process_after(mut self, at: DateTime<Utc>) -> Self {
        self.process_after = Some(at);
        self
    }

    /// Materialize the record as it is first stored.
    pub(crate) fn into_record(self, now: DateTime<Utc>) -> WorkRecord {
        WorkRecord {
            id: WorkId::new(),
            queue_name: self.queue_name,
            identity: self.identity,
            payload: self.payload,
            state: State::Queued,
            priority: self.priority,
            cost: self.cost,
            queued_at: now,
            process_after: self.process_after.unwrap_or(now),
            worker_id: None,
            lease_token: None,
            leased_until: None,
            attempt_count: 0,
            last_error: None,
            updated_at: now,
            finished_at: None,
        }
    }
}
