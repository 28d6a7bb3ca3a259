//! Crate-wide error taxonomy.
//!
//! Conditions, not exception hierarchies: each variant names one of the
//! failure domains a crawl can hit (discovery, admission, fetch, cache,
//! asset pipeline, construction-time policy). Transient conditions are
//! handled by callers (the pipeline's retry loop); terminal conditions are
//! wrapped into a [`StageError`] and delivered on the result channel.

use thiserror::Error;

/// A single failure condition surfaced anywhere in the engine.
#[derive(Error, Debug)]
pub enum EngineError {
    #[error("invalid url: {0}")]
    InvalidUrl(String),

    #[error("circuit open for host {host}")]
    CircuitOpen { host: String },

    #[error("rate limited (retry after {retry_after_ms}ms)")]
    RateLimited { retry_after_ms: u64 },

    #[error("transient fetch failure: {message}")]
    TransientFetch {
        message: String,
        status: Option<u16>,
    },

    #[error("cache lookup failed: {0}")]
    CacheLookup(String),

    #[error("cache store failed: {0}")]
    CacheStore(String),

    #[error("operation cancelled")]
    Cancelled,

    #[error("asset stage '{stage}' failed: {message}")]
    AssetStage { stage: String, message: String },

    #[error("policy violation: {0}")]
    PolicyViolation(String),

    #[error("fetcher error: {0}")]
    Fetch(#[source] anyhow::Error),
}

impl From<crate::fetcher::FetchError> for EngineError {
    fn from(e: crate::fetcher::FetchError) -> Self {
        EngineError::TransientFetch {
            message: e.message,
            status: e.status,
        }
    }
}

impl EngineError {
    /// Conditions the pipeline's retry loop treats as candidates for retry.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            EngineError::RateLimited { .. }
                | EngineError::TransientFetch { .. }
                | EngineError::CircuitOpen { .. }
        )
    }
}

/// The terminal stage at which a [`EngineError`] occurred, plus the URL it
/// occurred for. Carried verbatim in [`crate::types::CrawlResult`].
#[derive(Debug, Error)]
#[error("{stage} failed for {url}: {source}")]
pub struct StageError {
    pub url: String,
    pub stage: &'static str,
    #[source]
    pub source: EngineError,
}

impl StageError {
    pub fn new(url: impl Into<String>, stage: &'static str, source: EngineError) -> Self {
        Self {
            url: url.into(),
            stage,
            source,
        }
    }
}

pub type Result<T> = std::result::Result<T, EngineError>;
