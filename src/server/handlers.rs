//! Request handlers and wire types for the queue API.

use std::sync::Arc;

use axum::Json;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::Instrument;

use super::error::{ApiError, ApiResult};
use super::{AppState, QueueOptions};
use crate::error::{Error, Result};
use crate::model::{LeaseToken, Outcome, State as RecordState, WorkId, WorkRecord};
use crate::telemetry::work::{record_state_transition, record_work_id, start_queue_span};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClaimRequest {
    pub worker_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HeartbeatRequest {
    pub worker_id: String,
    pub id: WorkId,
    pub lease_token: LeaseToken,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HeartbeatResponse {
    pub id: WorkId,
    pub leased_until: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FinalizeRequest {
    pub worker_id: String,
    pub id: WorkId,
    pub lease_token: LeaseToken,
    #[serde(flatten)]
    pub outcome: Outcome,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FinalizeResponse {
    pub id: WorkId,
    pub state: RecordState,
    pub attempt_count: u32,
    pub process_after: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueStats {
    pub queue: String,
    pub queued: i64,
}

pub(crate) async fn healthz() -> &'static str {
    "ok"
}

pub(crate) async fn ready(State(state): State<Arc<AppState>>) -> Response {
    if state.readiness.is_ready() {
        (StatusCode::OK, "ready").into_response()
    } else {
        (StatusCode::SERVICE_UNAVAILABLE, "not ready").into_response()
    }
}

pub(crate) async fn claim(
    State(state): State<Arc<AppState>>,
    Path(queue): Path<String>,
    Json(req): Json<ClaimRequest>,
) -> ApiResult<Response> {
    let opts = state.queue(&queue)?;
    opts.validator.validate(&req.worker_id)?;

    let span = start_queue_span(&queue, "claim", &req.worker_id);
    let result = opts
        .store
        .claim(&queue, &req.worker_id)
        .instrument(span.clone())
        .await;

    match result {
        Ok(Some(record)) => {
            record_work_id(&span, record.id);
            record_state_transition(&span, "queued", "dispatched");
            opts.metrics.record("claim", "ok");
            Ok(Json(record).into_response())
        }
        Ok(None) => {
            opts.metrics.record("claim", "empty");
            Ok(StatusCode::NO_CONTENT.into_response())
        }
        Err(e) => {
            opts.metrics.record("claim", "error");
            Err(e.into())
        }
    }
}

pub(crate) async fn heartbeat(
    State(state): State<Arc<AppState>>,
    Path(queue): Path<String>,
    Json(req): Json<HeartbeatRequest>,
) -> ApiResult<Json<HeartbeatResponse>> {
    let opts = state.queue(&queue)?;
    opts.validator.validate(&req.worker_id)?;

    let span = start_queue_span(&queue, "heartbeat", &req.worker_id);
    record_work_id(&span, req.id);
    let result = async {
        ensure_on_queue(opts, &queue, req.id).await?;
        opts.store.heartbeat(req.id, req.lease_token).await
    }
    .instrument(span)
    .await;

    let record = recorded(opts, "heartbeat", result)?;
    Ok(Json(HeartbeatResponse {
        id: record.id,
        leased_until: record.leased_until,
    }))
}

pub(crate) async fn finalize(
    State(state): State<Arc<AppState>>,
    Path(queue): Path<String>,
    Json(req): Json<FinalizeRequest>,
) -> ApiResult<Json<FinalizeResponse>> {
    let opts = state.queue(&queue)?;
    opts.validator.validate(&req.worker_id)?;

    let span = start_queue_span(&queue, "finalize", &req.worker_id);
    record_work_id(&span, req.id);
    let result = async {
        ensure_on_queue(opts, &queue, req.id).await?;
        opts.store
            .finalize(req.id, req.lease_token, req.outcome.clone())
            .await
    }
    .instrument(span.clone())
    .await;

    let record = recorded(opts, "finalize", result)?;
    record_state_transition(&span, "dispatched", record.state.as_str());
    Ok(Json(FinalizeResponse {
        id: record.id,
        state: record.state,
        attempt_count: record.attempt_count,
        process_after: record.process_after,
    }))
}

pub(crate) async fn stats(
    State(state): State<Arc<AppState>>,
    Path(queue): Path<String>,
) -> ApiResult<Json<QueueStats>> {
    let opts = state.queue(&queue)?;
    let queued = opts.store.queued_count(&queue).await?;
    Ok(Json(QueueStats { queue, queued }))
}

/// A record on another queue is invisible through this one.
async fn ensure_on_queue(opts: &QueueOptions, queue: &str, id: WorkId) -> Result<()> {
    let record = opts.store.get(id).await?;
    if record.queue_name == queue {
        Ok(())
    } else {
        Err(Error::NotFound(format!("work record {id} on queue {queue}")))
    }
}

fn recorded(
    opts: &QueueOptions,
    operation: &'static str,
    result: Result<WorkRecord>,
) -> ApiResult<WorkRecord> {
    match result {
        Ok(record) => {
            opts.metrics.record(operation, "ok");
            Ok(record)
        }
        Err(e) => {
            let label = match &e {
                Error::LeaseExpired(_) => "lease_expired",
                Error::LeaseMismatch(_) => "lease_mismatch",
                _ => "error",
            };
            opts.metrics.record(operation, label);
            Err(ApiError::from(e))
        }
    }
}
