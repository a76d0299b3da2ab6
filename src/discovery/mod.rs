//! Insight definitions and the sources that supply them.
//!
//! An insight groups one or more series; each series carries a search query
//! whose results are recorded over time. Two series with the same normalized
//! query and repository scope are the same unit of work no matter which
//! insight owns them or what they are called.

pub mod enqueuer;

use std::path::PathBuf;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::error::{Error, Result};

pub use enqueuer::{EnqueuerConfig, PassSummary, QUERY_JOB_OFFSET, discover_and_enqueue};

/// A logical insight as defined by a user or organization.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Insight {
    pub id: String,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub series: Vec<Series>,
}

/// One time series of an insight.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Series {
    #[serde(default)]
    pub label: String,
    pub query: String,
    /// Restrict the query to these repositories. Empty means all.
    #[serde(default)]
    pub repositories: Vec<String>,
}

/// Where insight definitions come from. Read-only.
#[async_trait]
pub trait DefinitionSource: Send + Sync {
    async fn discover(&self) -> Result<Vec<Insight>>;
}

/// A fixed set of definitions held in memory.
#[derive(Debug, Clone, Default)]
pub struct StaticSource {
    insights: Vec<Insight>,
}

impl StaticSource {
    pub fn new(insights: Vec<Insight>) -> Self {
        Self { insights }
    }
}

#[async_trait]
impl DefinitionSource for StaticSource {
    async fn discover(&self) -> Result<Vec<Insight>> {
        Ok(self.insights.clone())
    }
}

/// Definitions read from a TOML file on every pass, so edits take effect at
/// the next pass without a restart.
///
/// ```toml
/// [[insights]]
/// id = "go-adoption"
/// title = "Go adoption"
///
/// [[insights.series]]
/// label = "Go files"
/// query = "lang:go"
/// ```
#[derive(Debug, Clone)]
pub struct FileSource {
    path: PathBuf,
}

#[derive(Debug, Deserialize)]
struct DefinitionsFile {
    #[serde(default)]
    insights: Vec<Insight>,
}

impl FileSource {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn parse(content: &str) -> Result<Vec<Insight>> {
        let file: DefinitionsFile = toml::from_str(content)
            .map_err(|e| Error::DiscoverySource(format!("bad definitions: {e}")))?;
        Ok(file.insights)
    }
}

#[async_trait]
impl DefinitionSource for FileSource {
    async fn discover(&self) -> Result<Vec<Insight>> {
        let content = tokio::fs::read_to_string(&self.path).await.map_err(|e| {
            Error::DiscoverySource(format!("cannot read {}: {e}", self.path.display()))
        })?;
        Self::parse(&content)
    }
}

/// Count directive appended to queries that do not set one, so results are
/// never truncated by the default limit.
pub const COUNT_UNLIMITED: &str = "count:9999999";

/// Appends `count:9999999` iff `count:` does not already occur in the query.
///
/// This is a substring check, so a query like `content:"count:"` is left
/// untouched even though it does not actually set a count.
pub fn with_count_unlimited(query: &str) -> String {
    if query.contains("count:") {
        query.to_string()
    } else {
        format!("{query} {COUNT_UNLIMITED}")
    }
}

/// Content-derived identity of a series: `s:` followed by the uppercase hex
/// SHA-256 of its normalized query and sorted repository scope.
pub fn encode(series: &Series) -> String {
    let mut repositories = series.repositories.clone();
    repositories.sort();
    repositories.dedup();

    let mut hasher = Sha256::new();
    hasher.update(with_count_unlimited(&series.query).as_bytes());
    hasher.update(b"\n");
    hasher.update(repositories.join(",").as_bytes());
    format!("s:{}", hex::encode_upper(hasher.finalize()))
}
