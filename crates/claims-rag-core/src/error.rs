//! Error taxonomy for the retrieval pipeline.
//!
//! Every failure reaches the caller as a typed error so that "zero relevant
//! chunks" (an empty, successful result) can always be told apart from
//! "the subsystem is broken".

use std::time::Duration;

use thiserror::Error;

/// Failures from the embedding provider adapter.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum EmbeddingError {
    /// Auth, quota, or configuration failure. Never retried.
    #[error("embedding provider unavailable: {0}")]
    ProviderUnavailable(String),
    /// The request did not complete in time. Retried with backoff.
    #[error("embedding request timed out")]
    Timeout,
    /// The provider answered with something that is not a usable vector.
    #[error("invalid embedding response: {0}")]
    InvalidResponse(String),
    /// Upstream hiccup (HTTP 5xx, rate limit, dropped connection). Retried;
    /// reported as [`EmbeddingError::ProviderUnavailable`] once retries run out.
    #[error("transient embedding failure: {0}")]
    Transient(String),
    /// Too many callers are already waiting for an embedding slot.
    #[error("embedding queue full ({queued} waiting)")]
    Overloaded { queued: usize },
}

impl EmbeddingError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, EmbeddingError::Timeout | EmbeddingError::Transient(_))
    }

    /// Collapse internal retry-only variants into their terminal form.
    pub fn into_terminal(self) -> Self {
        match self {
            EmbeddingError::Transient(msg) => EmbeddingError::ProviderUnavailable(msg),
            other => other,
        }
    }
}

/// Failures from a chunk store backend.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum StoreError {
    #[error("chunk store connection failed: {0}")]
    ConnectionFailed(String),
    #[error("chunk store query timed out")]
    QueryTimeout,
    #[error("embedding dimension mismatch: store has {expected}, query has {actual}")]
    DimensionMismatch { expected: usize, actual: usize },
    /// The backing data violates a store invariant (e.g. mixed dimensions).
    #[error("invalid chunk store data: {0}")]
    InvalidData(String),
    #[error("chunk store query failed: {0}")]
    Query(String),
}

impl StoreError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, StoreError::ConnectionFailed(_))
    }
}

/// Failures of the in-process query cache.
///
/// Callers degrade to a cache miss; the cache is never a correctness dependency.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum CacheError {
    #[error("query cache lock poisoned")]
    Poisoned,
}

/// Pipeline stage that exceeded its time budget.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Embedding,
    Search,
    Query,
}

impl std::fmt::Display for Stage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Stage::Embedding => "embedding",
            Stage::Search => "search",
            Stage::Query => "query",
        })
    }
}

/// Top-level error returned by the query orchestrator.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum RagError {
    #[error("invalid query: {0}")]
    Validation(String),
    #[error(transparent)]
    Embedding(#[from] EmbeddingError),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("{stage} timed out after {}ms", elapsed.as_millis())]
    Timeout { stage: Stage, elapsed: Duration },
    #[error("retrieval is disabled")]
    Disabled,
    #[error("retrieval service is shut down")]
    ShutDown,
}

impl RagError {
    /// Stable machine-readable code for this error class.
    pub fn kind(&self) -> &'static str {
        match self {
            RagError::Validation(_) => "validation",
            RagError::Embedding(_) => "embedding",
            RagError::Store(_) => "store",
            RagError::Timeout { .. } => "timeout",
            RagError::Disabled => "disabled",
            RagError::ShutDown => "shut_down",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_classification() {
        assert!(EmbeddingError::Timeout.is_retryable());
        assert!(EmbeddingError::Transient("503".into()).is_retryable());
        assert!(!EmbeddingError::ProviderUnavailable("401".into()).is_retryable());
        assert!(!EmbeddingError::InvalidResponse("no data".into()).is_retryable());
        assert!(!EmbeddingError::Overloaded { queued: 3 }.is_retryable());
        assert!(StoreError::ConnectionFailed("refused".into()).is_retryable());
        assert!(!StoreError::QueryTimeout.is_retryable());
    }

    #[test]
    fn test_transient_becomes_unavailable() {
        let e = EmbeddingError::Transient("502 bad gateway".into()).into_terminal();
        assert_eq!(e, EmbeddingError::ProviderUnavailable("502 bad gateway".into()));
        assert_eq!(EmbeddingError::Timeout.into_terminal(), EmbeddingError::Timeout);
    }

    #[test]
    fn test_kind_codes() {
        let e: RagError = EmbeddingError::Timeout.into();
        assert_eq!(e.kind(), "embedding");
        let e: RagError = StoreError::QueryTimeout.into();
        assert_eq!(e.kind(), "store");
        assert_eq!(RagError::Validation("empty".into()).kind(), "validation");
    }

    #[test]
    fn test_timeout_message() {
        let e = RagError::Timeout {
            stage: Stage::Search,
            elapsed: Duration::from_millis(5000),
        };
        assert_eq!(e.to_string(), "search timed out after 5000ms");
    }
}
