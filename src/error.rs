//! Error types for workq.

use std::fmt;

use thiserror::Error;

use crate::model::WorkId;

#[derive(Debug, Error)]
pub enum Error {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("queue not configured: {0}")]
    QueueNotFound(String),

    /// An equivalent record is already queued or dispatched. Benign for the enqueuer.
    #[error("duplicate submission for {identity} on queue {queue}")]
    Duplicate { queue: String, identity: String },

    /// The lease passed its deadline or the record was reclaimed.
    #[error("lease expired for work record {0}")]
    LeaseExpired(WorkId),

    /// The presented token is not the record's current lease.
    #[error("lease token mismatch for work record {0}")]
    LeaseMismatch(WorkId),

    #[error("invalid state transition: {from} -> {to}")]
    InvalidTransition { from: String, to: String },

    #[error("invalid worker: {0}")]
    InvalidWorker(String),

    #[error("definition source: {0}")]
    DiscoverySource(String),

    #[error("{0}")]
    Aggregate(ErrorList),

    #[error("storage error: {0}")]
    Storage(#[from] sqlx::Error),

    #[error("migration failed: {0}")]
    Migrate(#[from] sqlx::migrate::MigrateError),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("config error: {0}")]
    Config(String),

    #[error("{0}")]
    Other(String),
}

impl Error {
    /// Whether the error means "already enqueued" rather than a real failure.
    pub fn is_duplicate(&self) -> bool {
        matches!(self, Error::Duplicate { .. })
    }
}

/// Errors collected over a batch operation that keeps going after failures.
#[derive(Debug, Default)]
pub struct ErrorList(pub Vec<Error>);

impl ErrorList {
    pub fn push(&mut self, err: Error) {
        self.0.push(err);
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// `Ok(())` when nothing was collected, otherwise `Error::Aggregate`.
    pub fn into_result(self) -> Result<()> {
        if self.0.is_empty() {
            Ok(())
        } else {
            Err(Error::Aggregate(self))
        }
    }
}

impl fmt::Display for ErrorList {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} error(s) occurred:", self.0.len())?;
        for err in &self.0 {
            write!(f, "\n\t* {err}")?;
        }
        Ok(())
    }
}

pub type Result<T> = std::result::Result<T, Error>;
