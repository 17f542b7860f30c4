//! Chunk store abstraction.
//!
//! The [`ChunkStore`] trait defines every storage operation the query path
//! needs, enabling pluggable backends (Postgres/pgvector, in-memory
//! snapshots). The query path never writes chunks; ingestion is external.
//!
//! Implementations must be `Send + Sync` to work with async runtimes.

pub mod memory;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::error::StoreError;
use crate::models::{Chunk, DistanceMetric, Filters};

/// Upper bound on candidates fetched by a single nearest-neighbor query.
pub const MAX_CANDIDATES: usize = 400;

/// A raw nearest-neighbor hit.
///
/// Carries enough information to filter, rank, deduplicate, and build a
/// snippet without additional store round-trips.
#[derive(Debug, Clone, PartialEq)]
pub struct Neighbor {
    pub chunk_id: String,
    pub document_id: String,
    pub ordinal: i64,
    /// Raw distance under the store's [`DistanceMetric`]; smaller is closer.
    pub distance: f64,
    pub text: String,
    pub document_title: Option<String>,
    pub category: Option<String>,
    pub document_metadata: serde_json::Value,
    pub chunk_metadata: serde_json::Value,
}

/// Counts reported by a store after a (re)load.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct StoreStats {
    pub documents: u64,
    pub chunks: u64,
    /// `None` when the store holds no embeddings yet.
    pub embedding_dims: Option<usize>,
}

/// A completed query, recorded for analytics.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct QueryEvent {
    pub query: String,
    pub result_count: usize,
    pub latency_ms: u64,
    pub from_cache: bool,
    pub at: DateTime<Utc>,
}

/// Abstract chunk store backend.
///
/// # Operations
///
/// | Method | Purpose |
/// |--------|---------|
/// | [`search`](ChunkStore::search) | Nearest neighbors by ascending distance |
/// | [`get_chunk`](ChunkStore::get_chunk) | Fetch one chunk by ID |
/// | [`count_documents`](ChunkStore::count_documents) | Health reporting |
/// | [`count_chunks`](ChunkStore::count_chunks) | Health reporting |
/// | [`reload`](ChunkStore::reload) | Re-read the backing source |
/// | [`record_query`](ChunkStore::record_query) | Best-effort analytics |
#[async_trait]
pub trait ChunkStore: Send + Sync {
    /// Distance metric the index was built with.
    fn metric(&self) -> DistanceMetric;

    /// Whether [`search`](ChunkStore::search) applies `filters` itself.
    ///
    /// When `false` the caller over-fetches and post-filters.
    fn supports_prefilter(&self) -> bool;

    /// Return up to `limit` neighbors of `query_vec`, closest first.
    ///
    /// An empty store yields an empty vec, not an error.
    async fn search(
        &self,
        query_vec: &[f32],
        limit: usize,
        filters: &Filters,
    ) -> Result<Vec<Neighbor>, StoreError>;

    async fn get_chunk(&self, id: &str) -> Result<Option<Chunk>, StoreError>;

    async fn count_documents(&self) -> Result<u64, StoreError>;

    async fn count_chunks(&self) -> Result<u64, StoreError>;

    /// Embedding dimensionality shared by all stored chunks, if known.
    async fn embedding_dims(&self) -> Result<Option<usize>, StoreError>;

    /// Re-read the backing source and report fresh stats.
    ///
    /// Readers must never observe a partially replaced data set.
    async fn reload(&self) -> Result<StoreStats, StoreError>;

    /// Persist a query analytics event. Default: discard.
    async fn record_query(&self, _event: &QueryEvent) -> Result<(), StoreError> {
        Ok(())
    }
}
