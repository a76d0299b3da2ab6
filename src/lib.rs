//! # workq
//!
//! Postgres-backed work queue for periodic insight queries.
//!
//! Provides a leased, deduplicating queue store (Postgres or in-memory), a
//! discovery pass that turns insight definitions into queue records, a
//! worker-facing HTTP API, and OpenTelemetry observability.

pub mod clock;
pub mod config;
pub mod discovery;
pub mod engine;
pub mod error;
pub mod model;
pub mod server;
pub mod store;
pub mod telemetry;
