//! Integration tests for the worker-facing HTTP API.
//!
//! Each test serves a fresh in-memory store on an ephemeral port and talks
//! to it with reqwest, the way a worker would.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{TimeZone, Utc};
use reqwest::StatusCode;
use serde_json::{Value, json};
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use workq::clock::mock::MockClock;
use workq::model::{NewWorkRecord, WorkRecord, priority};
use workq::server::handlers::{FinalizeResponse, HeartbeatResponse, QueueStats};
use workq::server::{QueueOptions, Readiness, Server, ServerOptions};
use workq::store::{MemoryStore, QueueStore};

struct TestServer {
    base: String,
    client: reqwest::Client,
    store: Arc<MemoryStore>,
    clock: Arc<MockClock>,
    readiness: Readiness,
    shutdown: CancellationToken,
    handle: JoinHandle<workq::error::Result<()>>,
}

impl TestServer {
    async fn start(queues: &[&str]) -> Self {
        let clock = Arc::new(MockClock::new(
            Utc.with_ymd_and_hms(2025, 1, 1, 0, 0, 0).unwrap(),
        ));
        let store = Arc::new(MemoryStore::with_clock(clock.clone()));

        let options: HashMap<String, QueueOptions> = queues
            .iter()
            .map(|name| {
                let store: Arc<dyn QueueStore> = store.clone();
                (name.to_string(), QueueOptions::new(name, store))
            })
            .collect();

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let readiness = Readiness::default();
        let server = Server::new(
            ServerOptions { listen_addr: addr },
            options,
            readiness.clone(),
        );
        assert_eq!(server.gauge_count(), queues.len());

        let shutdown = CancellationToken::new();
        let handle = tokio::spawn(server.serve(listener, shutdown.clone()));

        Self {
            base: format!("http://{addr}"),
            client: reqwest::Client::new(),
            store,
            clock,
            readiness,
            shutdown,
            handle,
        }
    }

    async fn post(&self, path: &str, body: Value) -> reqwest::Response {
        self.client
            .post(format!("{}{path}", self.base))
            .json(&body)
            .send()
            .await
            .unwrap()
    }

    async fn get(&self, path: &str) -> reqwest::Response {
        self.client
            .get(format!("{}{path}", self.base))
            .send()
            .await
            .unwrap()
    }

    async fn claim(&self, queue: &str, worker: &str) -> WorkRecord {
        let resp = self
            .post(
                &format!("/queues/{queue}/claim"),
                json!({"worker_id": worker}),
            )
            .await;
        assert_eq!(resp.status(), StatusCode::OK);
        resp.json().await.unwrap()
    }

    async fn stop(self) {
        self.shutdown.cancel();
        self.handle.await.unwrap().unwrap();
    }
}

// ---------------------------------------------------------------------------
// Probes
// ---------------------------------------------------------------------------

#[tokio::test(flavor = "multi_thread")]
async fn healthz_and_ready() {
    let server = TestServer::start(&["insights"]).await;

    let resp = server.get("/healthz").await;
    assert_eq!(resp.status(), StatusCode::OK);

    let resp = server.get("/ready").await;
    assert_eq!(resp.status(), StatusCode::SERVICE_UNAVAILABLE);

    server.readiness.mark_ready();
    let resp = server.get("/ready").await;
    assert_eq!(resp.status(), StatusCode::OK);

    server.stop().await;
}

// ---------------------------------------------------------------------------
// Claim
// ---------------------------------------------------------------------------

#[tokio::test(flavor = "multi_thread")]
async fn claim_empty_queue_is_no_content() {
    let server = TestServer::start(&["insights"]).await;

    let resp = server
        .post("/queues/insights/claim", json!({"worker_id": "w1"}))
        .await;
    assert_eq!(resp.status(), StatusCode::NO_CONTENT);

    server.stop().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn claim_returns_highest_priority_record() {
    let server = TestServer::start(&["insights"]).await;
    server
        .store
        .enqueue(NewWorkRecord::new("insights", "low").priority(priority::LOW))
        .await
        .unwrap();
    let urgent = server
        .store
        .enqueue(
            NewWorkRecord::new("insights", "urgent")
                .priority(priority::CRITICAL)
                .payload(json!({"search_query": "lang:go count:9999999"})),
        )
        .await
        .unwrap();

    let record = server.claim("insights", "w1").await;
    assert_eq!(record.id, urgent);
    assert_eq!(record.worker_id.as_deref(), Some("w1"));
    assert_eq!(record.payload["search_query"], "lang:go count:9999999");
    assert!(record.lease_token.is_some());

    server.stop().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn unknown_queue_is_not_found() {
    let server = TestServer::start(&["insights"]).await;

    let resp = server
        .post("/queues/nope/claim", json!({"worker_id": "w1"}))
        .await;
    assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["error"]["status"], 404);

    server.stop().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn invalid_worker_is_bad_request() {
    let server = TestServer::start(&["insights"]).await;

    for worker in ["", "has space"] {
        let resp = server
            .post("/queues/insights/claim", json!({"worker_id": worker}))
            .await;
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST, "worker {worker:?}");
    }

    server.stop().await;
}

// ---------------------------------------------------------------------------
// Heartbeat and finalize
// ---------------------------------------------------------------------------

#[tokio::test(flavor = "multi_thread")]
async fn heartbeat_then_finalize() {
    let server = TestServer::start(&["insights"]).await;
    server
        .store
        .enqueue(NewWorkRecord::new("insights", "s:A"))
        .await
        .unwrap();
    let record = server.claim("insights", "w1").await;
    let token = record.lease_token.unwrap();

    server.clock.advance(chrono::Duration::seconds(30));
    let resp = server
        .post(
            "/queues/insights/heartbeat",
            json!({"worker_id": "w1", "id": record.id, "lease_token": token}),
        )
        .await;
    assert_eq!(resp.status(), StatusCode::OK);
    let beat: HeartbeatResponse = resp.json().await.unwrap();
    assert!(beat.leased_until > record.leased_until);

    let resp = server
        .post(
            "/queues/insights/finalize",
            json!({"worker_id": "w1", "id": record.id, "lease_token": token, "success": true}),
        )
        .await;
    assert_eq!(resp.status(), StatusCode::OK);
    let done: FinalizeResponse = resp.json().await.unwrap();
    assert_eq!(done.state, workq::model::State::Completed);

    server.stop().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn failed_finalize_requeues() {
    let server = TestServer::start(&["insights"]).await;
    server
        .store
        .enqueue(NewWorkRecord::new("insights", "s:A"))
        .await
        .unwrap();
    let record = server.claim("insights", "w1").await;

    let resp = server
        .post(
            "/queues/insights/finalize",
            json!({
                "worker_id": "w1",
                "id": record.id,
                "lease_token": record.lease_token,
                "success": false,
                "error": "search timed out",
            }),
        )
        .await;
    assert_eq!(resp.status(), StatusCode::OK);
    let done: FinalizeResponse = resp.json().await.unwrap();
    assert_eq!(done.state, workq::model::State::Queued);
    assert_eq!(done.attempt_count, 1);

    let stored = server.store.get(record.id).await.unwrap();
    assert_eq!(stored.last_error.as_deref(), Some("search timed out"));

    server.stop().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn lease_errors_map_to_conflict_and_gone() {
    let server = TestServer::start(&["insights"]).await;
    server
        .store
        .enqueue(NewWorkRecord::new("insights", "s:A"))
        .await
        .unwrap();
    let record = server.claim("insights", "w1").await;

    let resp = server
        .post(
            "/queues/insights/heartbeat",
            json!({"worker_id": "w1", "id": record.id, "lease_token": uuid::Uuid::new_v4()}),
        )
        .await;
    assert_eq!(resp.status(), StatusCode::CONFLICT);

    server.clock.advance(chrono::Duration::seconds(61));
    let resp = server
        .post(
            "/queues/insights/finalize",
            json!({"worker_id": "w1", "id": record.id, "lease_token": record.lease_token, "success": true}),
        )
        .await;
    assert_eq!(resp.status(), StatusCode::GONE);

    server.stop().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn record_on_other_queue_is_not_found() {
    let server = TestServer::start(&["insights", "batches"]).await;
    server
        .store
        .enqueue(NewWorkRecord::new("insights", "s:A"))
        .await
        .unwrap();
    let record = server.claim("insights", "w1").await;

    let resp = server
        .post(
            "/queues/batches/heartbeat",
            json!({"worker_id": "w1", "id": record.id, "lease_token": record.lease_token}),
        )
        .await;
    assert_eq!(resp.status(), StatusCode::NOT_FOUND);

    server.stop().await;
}

// ---------------------------------------------------------------------------
// Stats
// ---------------------------------------------------------------------------

#[tokio::test(flavor = "multi_thread")]
async fn stats_reports_queued_count() {
    let server = TestServer::start(&["insights"]).await;
    for identity in ["a", "b", "c"] {
        server
            .store
            .enqueue(NewWorkRecord::new("insights", identity))
            .await
            .unwrap();
    }
    server.claim("insights", "w1").await;

    let resp = server.get("/queues/insights/stats").await;
    assert_eq!(resp.status(), StatusCode::OK);
    let stats: QueueStats = resp.json().await.unwrap();
    assert_eq!(stats.queue, "insights");
    assert_eq!(stats.queued, 2);

    server.stop().await;
}
