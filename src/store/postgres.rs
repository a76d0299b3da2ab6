//! Postgres store via direct SQLx.
//!
//! Claim is a single `UPDATE … FROM (SELECT … FOR UPDATE SKIP LOCKED)`
//! statement, so concurrent claimers never block on or return the same row.
//! Lease-holder mutations lock the row with `SELECT … FOR UPDATE`, apply the
//! shared transition rules, and write the row back in the same transaction.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::PgPoolOptions;
use sqlx::{PgConnection, PgPool};
use tracing::debug;
use uuid::Uuid;

use super::{QueueStore, StoreConfig, apply_cancel, apply_outcome, check_lease};
use crate::clock::{Clock, SystemClock};
use crate::error::{Error, Result};
use crate::model::{LeaseToken, NewWorkRecord, Outcome, State, WorkId, WorkRecord};
use crate::telemetry::metrics;

const COLUMNS: &str = "id, queue_name, identity, payload, state, priority, cost, queued_at, \
     process_after, worker_id, lease_token, leased_until, attempt_count, last_error, \
     updated_at, finished_at";

/// Store handle. Owns the connection pool shared across all queues.
pub struct PgStore {
    pool: PgPool,
    clock: Arc<dyn Clock>,
    default_config: StoreConfig,
    queue_configs: HashMap<String, StoreConfig>,
}

impl PgStore {
    /// Connect to Postgres and create a connection pool.
    pub async fn connect(url: &str) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(10)
            .connect(url)
            .await?;
        Ok(Self::from_pool(pool))
    }

    pub fn from_pool(pool: PgPool) -> Self {
        Self {
            pool,
            clock: Arc::new(SystemClock),
            default_config: StoreConfig::default(),
            queue_configs: HashMap::new(),
        }
    }

    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
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

    /// Run all pending migrations.
    pub async fn migrate(&self) -> Result<()> {
        sqlx::migrate!("./migrations").run(&self.pool).await?;
        Ok(())
    }

    /// Simple health check: run a SELECT 1.
    pub async fn health_check(&self) -> Result<()> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }

    fn config_for(&self, queue: &str) -> &StoreConfig {
        self.queue_configs.get(queue).unwrap_or(&self.default_config)
    }

    /// Lock a row for the rest of the transaction.
    async fn lock_record(conn: &mut PgConnection, id: WorkId) -> Result<WorkRecord> {
        let sql = format!("SELECT {COLUMNS} FROM work_records WHERE id = $1 FOR UPDATE");
        let row: Option<WorkRecordRow> = sqlx::query_as(&sql)
            .bind(id.0)
            .fetch_optional(&mut *conn)
            .await?;
        row.ok_or_else(|| Error::NotFound(format!("work record {id}")))?
            .try_into_work_record()
    }

    /// Write back every mutable column of a locked row.
    async fn write_record(conn: &mut PgConnection, record: &WorkRecord) -> Result<()> {
        sqlx::query(
            "UPDATE work_records SET state = $2, process_after = $3, worker_id = $4,
                 lease_token = $5, leased_until = $6, attempt_count = $7, last_error = $8,
                 updated_at = $9, finished_at = $10
             WHERE id = $1",
        )
        .bind(record.id.0)
        .bind(record.state.as_str())
        .bind(record.process_after)
        .bind(&record.worker_id)
        .bind(record.lease_token.map(|t| t.0))
        .bind(record.leased_until)
        .bind(record.attempt_count as i32)
        .bind(&record.last_error)
        .bind(record.updated_at)
        .bind(record.finished_at)
        .execute(&mut *conn)
        .await?;
        Ok(())
    }
}

#[async_trait]
impl QueueStore for PgStore {
    async fn enqueue(&self, new: NewWorkRecord) -> Result<WorkId> {
        let record = new.into_record(self.clock.now());

        // The partial unique index on (queue_name, identity) rejects a second
        // active record atomically, even under concurrent enqueuers.
        let inserted: Option<(Uuid,)> = sqlx::query_as(
            "INSERT INTO work_records (id, queue_name, identity, payload, state, priority, cost, queued_at, process_after, attempt_count, updated_at)
             VALUES ($1, $2, $3, $4, 'queued', $5, $6, $7, $8, 0, $7)
             ON CONFLICT (queue_name, identity) WHERE state IN ('queued', 'dispatched')
             DO NOTHING
             RETURNING id",
        )
        .bind(record.id.0)
        .bind(&record.queue_name)
        .bind(&record.identity)
        .bind(&record.payload)
        .bind(record.priority)
        .bind(record.cost)
        .bind(record.queued_at)
        .bind(record.process_after)
        .fetch_optional(&self.pool)
        .await?;

        match inserted {
            Some((id,)) => Ok(WorkId(id)),
            None => Err(Error::Duplicate {
                queue: record.queue_name,
                identity: record.identity,
            }),
        }
    }

    async fn claim(&self, queue: &str, worker_id: &str) -> Result<Option<WorkRecord>> {
        let now = self.clock.now();
        let deadline = self.config_for(queue).lease_deadline(now)?;
        let token = LeaseToken::new();

        let sql = format!(
            "WITH candidate AS (
                 SELECT id FROM work_records
                 WHERE queue_name = $1 AND state = 'queued' AND process_after <= $2
                 ORDER BY priority ASC, queued_at ASC, id ASC
                 LIMIT 1
                 FOR UPDATE SKIP LOCKED
             )
             UPDATE work_records AS r
             SET state = 'dispatched', worker_id = $3, lease_token = $4, leased_until = $5, updated_at = $2
             FROM candidate
             WHERE r.id = candidate.id
             RETURNING {}",
            prefixed_columns("r")
        );

        let row: Option<WorkRecordRow> = sqlx::query_as(&sql)
            .bind(queue)
            .bind(now)
            .bind(worker_id)
            .bind(token.0)
            .bind(deadline)
            .fetch_optional(&self.pool)
            .await?;

        let Some(row) = row else {
            return Ok(None);
        };
        let record = row.try_into_work_record()?;
        metrics::record_transition(State::Queued, State::Dispatched);
        debug!(queue, id = %record.id, worker_id, "claimed work record");
        Ok(Some(record))
    }

    async fn heartbeat(&self, id: WorkId, token: LeaseToken) -> Result<WorkRecord> {
        let now = self.clock.now();
        let mut tx = self.pool.begin().await?;

        let mut record = Self::lock_record(&mut tx, id).await?;
        check_lease(&record, token, now)?;
        record.leased_until = Some(self.config_for(&record.queue_name).lease_deadline(now)?);
        record.updated_at = now;
        Self::write_record(&mut tx, &record).await?;

        tx.commit().await?;
        Ok(record)
    }

    async fn finalize(
        &self,
        id: WorkId,
        token: LeaseToken,
        outcome: Outcome,
    ) -> Result<WorkRecord> {
        let now = self.clock.now();
        let mut tx = self.pool.begin().await?;

        let mut record = Self::lock_record(&mut tx, id).await?;
        check_lease(&record, token, now)?;
        let retry = self.config_for(&record.queue_name).retry;
        apply_outcome(&mut record, &outcome, &retry, now)?;
        Self::write_record(&mut tx, &record).await?;

        tx.commit().await?;
        Ok(record)
    }

    async fn reclaim_stalled(&self, queue: &str) -> Result<u64> {
        let now = self.clock.now();
        let reclaimed = sqlx::query(
            "UPDATE work_records
             SET state = 'queued', worker_id = NULL, lease_token = NULL, leased_until = NULL, updated_at = $2
             WHERE queue_name = $1 AND state = 'dispatched' AND leased_until < $2",
        )
        .bind(queue)
        .bind(now)
        .execute(&self.pool)
        .await?
        .rows_affected();

        for _ in 0..reclaimed {
            metrics::record_transition(State::Dispatched, State::Queued);
        }
        Ok(reclaimed)
    }

    async fn queued_count(&self, queue: &str) -> Result<i64> {
        let (count,): (i64,) = sqlx::query_as(
            "SELECT COUNT(*) FROM work_records WHERE queue_name = $1 AND state = 'queued'",
        )
        .bind(queue)
        .fetch_one(&self.pool)
        .await?;
        Ok(count)
    }

    async fn get(&self, id: WorkId) -> Result<WorkRecord> {
        let sql = format!("SELECT {COLUMNS} FROM work_records WHERE id = $1");
        let row: Option<WorkRecordRow> = sqlx::query_as(&sql)
            .bind(id.0)
            .fetch_optional(&self.pool)
            .await?;

        row.ok_or_else(|| Error::NotFound(format!("work record {id}")))?
            .try_into_work_record()
    }

    async fn list(
        &self,
        queue: &str,
        state: Option<State>,
        limit: i64,
    ) -> Result<Vec<WorkRecord>> {
        let sql = format!(
            "SELECT {COLUMNS} FROM work_records
             WHERE queue_name = $1 AND ($2::text IS NULL OR state = $2)
             ORDER BY queued_at DESC
             LIMIT $3"
        );
        let rows: Vec<WorkRecordRow> = sqlx::query_as(&sql)
            .bind(queue)
            .bind(state.map(State::as_str))
            .bind(limit.max(0))
            .fetch_all(&self.pool)
            .await?;

        rows.into_iter()
            .map(WorkRecordRow::try_into_work_record)
            .collect()
    }

    async fn cancel(&self, id: WorkId) -> Result<WorkRecord> {
        let now = self.clock.now();
        let mut tx = self.pool.begin().await?;

        let mut record = Self::lock_record(&mut tx, id).await?;
        apply_cancel(&mut record, now)?;
        Self::write_record(&mut tx, &record).await?;

        tx.commit().await?;
        Ok(record)
    }
}

fn prefixed_columns(alias: &str) -> String {
    COLUMNS
        .split(", ")
        .map(|c| format!("{alias}.{}", c.trim()))
        .collect::<Vec<_>>()
        .join(", ")
}

/// Internal row type for sqlx::FromRow.
#[derive(sqlx::FromRow)]
struct WorkRecordRow {
    id: Uuid,
    queue_name: String,
    identity: String,
    payload: serde_json::Value,
    state: String,
    priority: i32,
    cost: i32,
    queued_at: DateTime<Utc>,
    process_after: DateTime<Utc>,
    worker_id: Option<String>,
    lease_token: Option<Uuid>,
    leased_until: Option<DateTime<Utc>>,
    attempt_count: i32,
    last_error: Option<String>,
    updated_at: DateTime<Utc>,
    finished_at: Option<DateTime<Utc>>,
}

impl WorkRecordRow {
    fn try_into_work_record(self) -> Result<WorkRecord> {
        Ok(WorkRecord {
            id: WorkId(self.id),
            queue_name: self.queue_name,
            identity: self.identity,
            payload: self.payload,
            state: self.state.parse()?,
            priority: self.priority,
            cost: self.cost,
            queued_at: self.queued_at,
            process_after: self.process_after,
            worker_id: self.worker_id,
            lease_token: self.lease_token.map(LeaseToken),
            leased_until: self.leased_until,
            attempt_count: self.attempt_count.max(0) as u32,
            last_error: self.last_error,
            updated_at: self.updated_at,
            finished_at: self.finished_at,
        })
    }
}
