//! Worker-facing HTTP API.
//!
//! Multiplexes several named queues, each configured independently with its
//! own store handle, worker validator and metrics. The server keeps no state
//! between requests beyond those handles, so any number of instances can run
//! in front of the same store.

pub mod error;
pub mod handlers;

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use axum::Router;
use axum::routing::{get, post};
use opentelemetry::KeyValue;
use opentelemetry::metrics::{Counter, ObservableGauge};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

use crate::error::{Error, Result};
use crate::store::QueueStore;
use crate::telemetry::metrics;

/// Decides whether a worker may use a queue.
pub trait WorkerValidator: Send + Sync {
    fn validate(&self, worker_id: &str) -> Result<()>;
}

/// Accepts any non-empty id of at most 255 characters without whitespace.
#[derive(Debug, Clone, Copy, Default)]
pub struct DefaultWorkerValidator;

impl WorkerValidator for DefaultWorkerValidator {
    fn validate(&self, worker_id: &str) -> Result<()> {
        if worker_id.is_empty() {
            return Err(Error::InvalidWorker("worker_id is empty".to_string()));
        }
        if worker_id.len() > 255 {
            return Err(Error::InvalidWorker("worker_id is too long".to_string()));
        }
        if worker_id.chars().any(char::is_whitespace) {
            return Err(Error::InvalidWorker(format!(
                "worker_id {worker_id:?} contains whitespace"
            )));
        }
        Ok(())
    }
}

/// Per-queue operation counter with the queue label baked in.
#[derive(Clone)]
pub struct QueueMetrics {
    queue: String,
    operations: Counter<u64>,
}

impl QueueMetrics {
    pub fn new(queue: impl Into<String>) -> Self {
        Self {
            queue: queue.into(),
            operations: metrics::queue_operations(),
        }
    }

    pub fn record(&self, operation: &'static str, result: &'static str) {
        self.operations.add(
            1,
            &[
                KeyValue::new("queue", self.queue.clone()),
                KeyValue::new("operation", operation),
                KeyValue::new("result", result),
            ],
        );
    }
}

/// Everything the server needs to expose one named queue.
#[derive(Clone)]
pub struct QueueOptions {
    pub store: Arc<dyn QueueStore>,
    pub validator: Arc<dyn WorkerValidator>,
    pub metrics: QueueMetrics,
}

impl QueueOptions {
    pub fn new(queue: &str, store: Arc<dyn QueueStore>) -> Self {
        Self {
            store,
            validator: Arc::new(DefaultWorkerValidator),
            metrics: QueueMetrics::new(queue),
        }
    }

    pub fn validator(mut self, validator: Arc<dyn WorkerValidator>) -> Self {
        self.validator = validator;
        self
    }
}

/// Flips to ready once the store and queues are set up. Shared between the
/// process bootstrap and the `/ready` endpoint.
#[derive(Debug, Clone, Default)]
pub struct Readiness(Arc<AtomicBool>);

impl Readiness {
    pub fn mark_ready(&self) {
        self.0.store(true, Ordering::Release);
    }

    pub fn is_ready(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }
}

#[derive(Debug, Clone)]
pub struct ServerOptions {
    pub listen_addr: SocketAddr,
}

pub(crate) struct AppState {
    queues: HashMap<String, QueueOptions>,
    readiness: Readiness,
}

impl AppState {
    pub(crate) fn queue(&self, name: &str) -> Result<&QueueOptions> {
        self.queues
            .get(name)
            .ok_or_else(|| Error::QueueNotFound(name.to_string()))
    }
}

pub struct Server {
    options: ServerOptions,
    state: Arc<AppState>,
    gauges: Vec<ObservableGauge<i64>>,
}

impl Server {
    /// Build the server and register one backlog gauge per queue.
    ///
    /// Gauges are only registered when called inside a Tokio runtime, since
    /// sampling needs a runtime handle to run the store query.
    pub fn new(
        options: ServerOptions,
        queues: HashMap<String, QueueOptions>,
        readiness: Readiness,
    ) -> Self {
        let gauges = match tokio::runtime::Handle::try_current() {
            Ok(handle) => queues
                .iter()
                .map(|(name, opts)| {
                    metrics::queue_backlog_gauge(name, Arc::clone(&opts.store), handle.clone())
                })
                .collect(),
            Err(_) => {
                warn!("no tokio runtime, backlog gauges not registered");
                Vec::new()
            }
        };

        Self {
            options,
            state: Arc::new(AppState { queues, readiness }),
            gauges,
        }
    }

    pub fn queue_names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.state.queues.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    pub fn gauge_count(&self) -> usize {
        self.gauges.len()
    }

    pub fn router(&self) -> Router {
        Router::new()
            .route("/healthz", get(handlers::healthz))
            .route("/ready", get(handlers::ready))
            .route("/queues/{queue}/claim", post(handlers::claim))
            .route("/queues/{queue}/heartbeat", post(handlers::heartbeat))
            .route("/queues/{queue}/finalize", post(handlers::finalize))
            .route("/queues/{queue}/stats", get(handlers::stats))
            .layer(TraceLayer::new_for_http())
            .with_state(Arc::clone(&self.state))
    }

    /// Bind the configured address and serve until `shutdown` is cancelled.
    pub async fn run(self, shutdown: CancellationToken) -> Result<()> {
        let listener = TcpListener::bind(self.options.listen_addr).await?;
        self.serve(listener, shutdown).await
    }

    /// Serve on an already-bound listener until `shutdown` is cancelled.
    pub async fn serve(self, listener: TcpListener, shutdown: CancellationToken) -> Result<()> {
        let addr = listener.local_addr()?;
        info!(%addr, queues = ?self.queue_names(), "queue API listening");

        axum::serve(listener, self.router())
            .with_graceful_shutdown(shutdown.cancelled_owned())
            .await?;

        info!("queue API stopped");
        Ok(())
    }
}
