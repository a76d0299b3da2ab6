//! In-process store.
//!
//! A single mutex guards every record, so claim is trivially atomic: the
//! select-and-lease happens under one lock acquisition. Used by tests and
//! single-process deployments; nothing survives a restart.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use tracing::debug;

use super::{
    QueueStore, StoreConfig, apply_cancel, apply_claim, apply_outcome, apply_reclaim, check_lease,
};
use crate::clock::{Clock, SystemClock};
use crate::error::{Error, Result};
use crate::model::{LeaseToken, NewWorkRecord, Outcome, State, WorkId, WorkRecord};

struct Entry {
    record: WorkRecord,
    /// Insertion order, the final FIFO tie-break for equal `queued_at`.
    seq: u64,
}

#[derive(Default)]
struct Inner {
    records: HashMap<WorkId, Entry>,
    next_seq: u64,
}

pub struct MemoryStore {
    inner: Mutex<Inner>,
    clock: Arc<dyn Clock>,
    default_config: StoreConfig,
    queue_configs: HashMap<String, StoreConfig>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::with_clock(Arc::new(SystemClock))
    }

    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self {
            inner: Mutex::new(Inner::default()),
            clock,
            default_config: StoreConfig::default(),
            queue_configs: HashMap::new(),
        }
    }

    /// Settings for queues without an explicit entry.
    pub fn default_config(mut self, config: StoreConfig) -> Self {
        self.default_config = config;
        self
    }

    pub fn queue_config(mut self, queue: impl Into<String>, config: StoreConfig) -> Self {
        self.queue_configs.insert(queue.into(), config);
        self
    }

    fn config_for(&self, queue: &str) -> &StoreConfig {
        self.queue_configs.get(queue).unwrap_or(&self.default_config)
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

fn entry_mut(inner: &mut Inner, id: WorkId) -> Result<&mut WorkRecord> {
    inner
        .records
        .get_mut(&id)
        .map(|e| &mut e.record)
        .ok_or_else(|| Error::NotFound(format!("work record {id}")))
}

#[async_trait]
impl QueueStore for MemoryStore {
    async fn enqueue(&self, new: NewWorkRecord) -> Result<WorkId> {
        let now = self.clock.now();
        let mut inner = self.lock();

        let duplicate = inner.records.values().any(|e| {
            e.record.queue_name == new.queue_name
                && e.record.identity == new.identity
                && e.record.state.is_active()
        });
        if duplicate {
            return Err(Error::Duplicate {
                queue: new.queue_name,
                identity: new.identity,
            });
        }

        let record = new.into_record(now);
        let id = record.id;
        let seq = inner.next_seq;
        inner.next_seq += 1;
        inner.records.insert(id, Entry { record, seq });
        Ok(id)
    }

    async fn claim(&self, queue: &str, worker_id: &str) -> Result<Option<WorkRecord>> {
        let now = self.clock.now();
        let config = *self.config_for(queue);
        let mut inner = self.lock();

        let next = inner
            .records
            .values()
            .filter(|e| e.record.queue_name == queue && e.record.is_eligible(now))
            .min_by_key(|e| (e.record.priority, e.record.queued_at, e.seq))
            .map(|e| e.record.id);

        let Some(id) = next else {
            return Ok(None);
        };
        let record = entry_mut(&mut inner, id)?;
        apply_claim(record, worker_id, &config, now)?;
        debug!(queue, %id, worker_id, "claimed work record");
        Ok(Some(record.clone()))
    }

    async fn heartbeat(&self, id: WorkId, token: LeaseToken) -> Result<WorkRecord> {
        let now = self.clock.now();
        let mut inner = self.lock();
        let record = entry_mut(&mut inner, id)?;
        check_lease(record, token, now)?;

        let config = self.config_for(&record.queue_name);
        record.leased_until = Some(config.lease_deadline(now)?);
        record.updated_at = now;
        Ok(record.clone())
    }

    async fn finalize(
        &self,
        id: WorkId,
        token: LeaseToken,
        outcome: Outcome,
    ) -> Result<WorkRecord> {
        let now = self.clock.now();
        let mut inner = self.lock();
        let record = entry_mut(&mut inner, id)?;
        check_lease(record, token, now)?;

        let retry = self.config_for(&record.queue_name).retry;
        apply_outcome(record, &outcome, &retry, now)?;
        Ok(record.clone())
    }

    async fn reclaim_stalled(&self, queue: &str) -> Result<u64> {
        let now = self.clock.now();
        let mut inner = self.lock();

        let mut reclaimed = 0;
        for entry in inner.records.values_mut() {
            let record = &mut entry.record;
            if record.queue_name == queue && record.is_stalled(now) {
                apply_reclaim(record, now)?;
                reclaimed += 1;
            }
        }
        Ok(reclaimed)
    }

    async fn queued_count(&self, queue: &str) -> Result<i64> {
        let inner = self.lock();
        let count = inner
            .records
            .values()
            .filter(|e| e.record.queue_name == queue && e.record.state == State::Queued)
            .count();
        Ok(count as i64)
    }

    async fn get(&self, id: WorkId) -> Result<WorkRecord> {
        let inner = self.lock();
        inner
            .records
            .get(&id)
            .map(|e| e.record.clone())
            .ok_or_else(|| Error::NotFound(format!("work record {id}")))
    }

    async fn list(
        &self,
        queue: &str,
        state: Option<State>,
        limit: i64,
    ) -> Result<Vec<WorkRecord>> {
        let inner = self.lock();
        let mut entries: Vec<&Entry> = inner
            .records
            .values()
            .filter(|e| e.record.queue_name == queue)
            .filter(|e| state.is_none_or(|s| e.record.state == s))
            .collect();
        entries.sort_by_key(|e| std::cmp::Reverse((e.record.queued_at, e.seq)));

        Ok(entries
            .into_iter()
            .take(limit.max(0) as usize)
            .map(|e| e.record.clone())
            .collect())
    }

    async fn cancel(&self, id: WorkId) -> Result<WorkRecord> {
        let now = self.clock.now();
        let mut inner = self.lock();
        let record = entry_mut(&mut inner, id)?;
        apply_cancel(record, now)?;
        Ok(record.clone())
    }
}
