//! Typed configuration from environment variables.
//!
//! Loads once at startup, fails fast if required vars are missing.
//! Sensitive values wrapped in secrecy::SecretString to prevent log leaks.
//! The resulting value is passed explicitly to each component.

pub mod secrets;

use std::collections::HashSet;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use secrecy::SecretString;
use serde::Deserialize;
use tracing::warn;

use crate::error::{Error, Result};
use crate::store::{RetryPolicy, StoreConfig};

/// Name of the queue configured when no queue file is given.
pub const DEFAULT_QUEUE: &str = "insights";

/// How much longer than the longest lease the enqueuer period should be.
const ENQUEUER_SAFETY_FACTOR: u32 = 10;

/// Upper bound for lease and backoff durations.
pub const MAX_DURATION_SECS: u64 = 30 * 24 * 60 * 60;

#[derive(Debug)]
pub struct Config {
    pub database_url: SecretString,
    pub otel_endpoint: Option<String>,
    pub log_level: String,
    pub listen_addr: SocketAddr,
    pub enqueuer_interval: Duration,
    pub reclaim_interval: Duration,
    pub definitions_path: Option<PathBuf>,
    pub queues: Vec<QueueConfig>,
}

/// One named queue and its lease and retry settings.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct QueueConfig {
    pub name: String,
    #[serde(default = "default_lease_secs")]
    pub lease_duration_secs: u64,
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_backoff_base_secs")]
    pub backoff_base_secs: u64,
    #[serde(default = "default_backoff_max_secs")]
    pub backoff_max_secs: u64,
}

fn default_lease_secs() -> u64 {
    60
}

fn default_max_attempts() -> u32 {
    3
}

fn default_backoff_base_secs() -> u64 {
    10
}

fn default_backoff_max_secs() -> u64 {
    3600
}

impl QueueConfig {
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            lease_duration_secs: default_lease_secs(),
            max_attempts: default_max_attempts(),
            backoff_base_secs: default_backoff_base_secs(),
            backoff_max_secs: default_backoff_max_secs(),
        }
    }

    pub fn store_config(&self) -> StoreConfig {
        StoreConfig {
            lease_duration: Duration::from_secs(self.lease_duration_secs),
            retry: RetryPolicy {
                max_attempts: self.max_attempts,
                backoff_base: Duration::from_secs(self.backoff_base_secs),
                backoff_max: Duration::from_secs(self.backoff_max_secs),
            },
        }
    }
}

#[derive(Debug, Deserialize)]
struct QueueFile {
    #[serde(default)]
    queues: Vec<QueueConfig>,
}

/// Parse a TOML queue file:
///
/// ```toml
/// [[queues]]
/// name = "insights"
/// lease_duration_secs = 60
/// max_attempts = 3
/// ```
pub fn parse_queue_file(content: &str) -> Result<Vec<QueueConfig>> {
    let file: QueueFile =
        toml::from_str(content).map_err(|e| Error::Config(format!("bad queue config: {e}")))?;
    Ok(file.queues)
}

pub fn load_queue_file(path: &Path) -> Result<Vec<QueueConfig>> {
    let content = std::fs::read_to_string(path)
        .map_err(|e| Error::Config(format!("cannot read {}: {e}", path.display())))?;
    parse_queue_file(&content)
}

impl Config {
    /// Load configuration from environment variables.
    ///
    /// In local dev, call `dotenvy::dotenv().ok()` before this.
    pub fn from_env() -> Result<Self> {
        let queues = match std::env::var("QUEUE_CONFIG").ok() {
            Some(path) => load_queue_file(Path::new(&path))?,
            None => vec![QueueConfig::named(DEFAULT_QUEUE)],
        };

        let config = Self {
            database_url: SecretString::from(required_var("DATABASE_URL")?),
            otel_endpoint: std::env::var("OTEL_ENDPOINT").ok(),
            log_level: std::env::var("LOG_LEVEL").unwrap_or_else(|_| "info".to_string()),
            listen_addr: parsed_var("LISTEN_ADDR", "0.0.0.0:3191".parse().ok())?,
            enqueuer_interval: Duration::from_secs(parsed_var(
                "ENQUEUER_INTERVAL_SECS",
                Some(12 * 60 * 60),
            )?),
            reclaim_interval: Duration::from_secs(parsed_var("RECLAIM_INTERVAL_SECS", Some(15))?),
            definitions_path: std::env::var("DEFINITIONS_PATH").ok().map(PathBuf::from),
            queues,
        };
        config.validate()?;
        Ok(config)
    }

    /// Reject configurations that cannot work. The enqueuer period versus
    /// lease duration rule is operational guidance, so it only warns.
    pub fn validate(&self) -> Result<()> {
        if self.queues.is_empty() {
            return Err(Error::Config("no queues configured".to_string()));
        }

        let mut seen = HashSet::new();
        for queue in &self.queues {
            if queue.name.trim().is_empty() {
                return Err(Error::Config("queue name must not be empty".to_string()));
            }
            if !seen.insert(queue.name.as_str()) {
                return Err(Error::Config(format!("queue {} configured twice", queue.name)));
            }
            if queue.lease_duration_secs == 0 || queue.max_attempts == 0 {
                return Err(Error::Config(format!(
                    "queue {}: lease_duration_secs and max_attempts must be positive",
                    queue.name
                )));
            }

            for (field, secs) in [
                ("lease_duration_secs", queue.lease_duration_secs),
                ("backoff_base_secs", queue.backoff_base_secs),
                ("backoff_max_secs", queue.backoff_max_secs),
            ] {
                if secs > MAX_DURATION_SECS {
                    return Err(Error::Config(format!(
                        "queue {}: {field} = {secs} exceeds {MAX_DURATION_SECS}",
                        queue.name
                    )));
                }
            }

            let lease = Duration::from_secs(queue.lease_duration_secs);
            if self.enqueuer_interval <= lease.saturating_mul(ENQUEUER_SAFETY_FACTOR) {
                warn!(
                    queue = %queue.name,
                    enqueuer_interval_secs = self.enqueuer_interval.as_secs(),
                    lease_duration_secs = queue.lease_duration_secs,
                    "enqueuer interval is close to the lease duration; work may be enqueued faster than it drains"
                );
            }
        }

        if self.enqueuer_interval.is_zero() || self.reclaim_interval.is_zero() {
            return Err(Error::Config("intervals must be positive".to_string()));
        }
        Ok(())
    }

    pub fn queue_names(&self) -> Vec<&str> {
        self.queues.iter().map(|q| q.name.as_str()).collect()
    }
}

fn required_var(name: &str) -> Result<String> {
    std::env::var(name)
        .map_err(|_| Error::Config(format!("required environment variable {name} is not set")))
}

fn parsed_var<T>(name: &str, default: Option<T>) -> Result<T>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    match std::env::var(name) {
        Ok(raw) => raw
            .parse()
            .map_err(|e| Error::Config(format!("invalid {name}={raw:?}: {e}"))),
        Err(_) => default.ok_or_else(|| Error::Config(format!("{name} is not set"))),
    }
}
