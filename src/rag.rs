//! Query orchestration.
//!
//! [`RagService`] owns the query cache and ties together the embedding
//! provider, the chunk store, and the ranking engine:
//!
//! ```text
//! query ──▶ validate ──▶ cache ──hit──▶ result (from_cache = true)
//!                          │
//!                         miss
//!                          ▼
//!                 embed (≤ embedding_timeout)
//!                          ▼
//!                 search (≤ search_timeout, over-fetched)
//!                          ▼
//!                 post-filter ─▶ rank ─▶ cache write ─▶ result
//! ```
//!
//! Every failure is a typed [`RagError`]; an empty `items` list always
//! means "nothing relevant", never "something broke".

use anyhow::Context;
use chrono::{DateTime, Utc};
use claims_rag_core::cache::{CacheKey, CacheStats, QueryCache};
use claims_rag_core::context::extract_state;
use claims_rag_core::embedding::EmbeddingProvider;
use claims_rag_core::error::{RagError, Stage, StoreError};
use claims_rag_core::models::{unique_sources, DistanceMetric, Filters, QueryResult};
use claims_rag_core::search::{rank, RankParams};
use claims_rag_core::store::{ChunkStore, QueryEvent, StoreStats, MAX_CANDIDATES};
use serde::Serialize;
use std::sync::{Arc, RwLock};
use std::time::{Duration, Instant};

use crate::config::{Config, RetrievalConfig, MAX_TOP_K};
use crate::embedding::create_provider;
use crate::pg_store::PgChunkStore;
use crate::retry::RetryPolicy;
use crate::snapshot::SnapshotFileStore;

const ANALYTICS_TIMEOUT: Duration = Duration::from_secs(1);

/// Per-call overrides. Unset fields fall back to `[retrieval]` config.
#[derive(Debug, Clone, Default)]
pub struct QueryOptions {
    pub top_k: Option<usize>,
    pub min_score: Option<f64>,
    pub filters: Filters,
    pub max_chunks_per_doc: Option<usize>,
    /// Deadline for the whole call, cache lookup included.
    pub timeout: Option<Duration>,
}

impl QueryOptions {
    pub fn top_k(mut self, k: usize) -> Self {
        self.top_k = Some(k);
        self
    }

    pub fn min_score(mut self, score: f64) -> Self {
        self.min_score = Some(score);
        self
    }

    pub fn filters(mut self, filters: Filters) -> Self {
        self.filters = filters;
        self
    }

    /// Restrict to the state named in `query` unless a state filter is already set.
    pub fn with_inferred_filters(mut self, query: &str) -> Self {
        if self.filters.state.is_none() {
            if let Some(state) = extract_state(query) {
                self.filters.state = Some(state.to_string());
            }
        }
        self
    }
}

/// Health snapshot reported by [`RagService::status`].
#[derive(Debug, Clone, Serialize)]
pub struct RagStatus {
    pub loaded: bool,
    pub enabled: bool,
    pub total_chunks: u64,
    pub total_documents: u64,
    pub cache_size: usize,
    pub embedding_dimension: Option<usize>,
    pub embedding_model: String,
    pub metric: DistanceMetric,
    pub last_reload: Option<DateTime<Utc>>,
    pub cache: CacheStats,
}

#[derive(Debug, Default)]
struct LoadState {
    loaded: bool,
    /// Set by `shutdown`, cleared by the next successful reload.
    closed: bool,
    last_reload: Option<DateTime<Utc>>,
    stats: StoreStats,
}

pub struct RagService {
    store: Arc<dyn ChunkStore>,
    provider: Arc<dyn EmbeddingProvider>,
    cache: QueryCache,
    settings: RetrievalConfig,
    state: RwLock<LoadState>,
    reload_lock: tokio::sync::Mutex<()>,
}

impl RagService {
    pub fn new(
        store: Arc<dyn ChunkStore>,
        provider: Arc<dyn EmbeddingProvider>,
        config: &Config,
    ) -> Self {
        Self {
            store,
            provider,
            cache: QueryCache::new(
                config.cache.max_entries,
                Duration::from_secs(config.cache.ttl_secs),
            ),
            settings: config.retrieval.clone(),
            state: RwLock::new(LoadState::default()),
            reload_lock: tokio::sync::Mutex::new(()),
        }
    }

    pub fn cache(&self) -> &QueryCache {
        &self.cache
    }

    pub fn is_enabled(&self) -> bool {
        self.settings.enabled
    }

    fn load_state(&self) -> std::sync::RwLockReadGuard<'_, LoadState> {
        self.state.read().unwrap_or_else(|e| e.into_inner())
    }

    /// Load the store for the first time. Same as [`reload`](Self::reload).
    pub async fn init(&self) -> Result<RagStatus, RagError> {
        tracing::info!(
            model = self.provider.model_name(),
            metric = self.store.metric().as_str(),
            "initializing retrieval service"
        );
        self.reload().await
    }

    /// Re-read the store, then invalidate the cache.
    ///
    /// Concurrent reloads are serialized. On failure the previous data set
    /// and cache stay in place.
    pub async fn reload(&self) -> Result<RagStatus, RagError> {
        let _guard = self.reload_lock.lock().await;
        let started = Instant::now();

        let stats = self.store.reload().await.map_err(|e| {
            tracing::error!(error = %e, "chunk store reload failed");
            RagError::Store(e)
        })?;

        if let Some(dims) = stats.embedding_dims {
            let want = self.provider.dims();
            if want != 0 && want != dims {
                tracing::warn!(
                    store_dims = dims,
                    provider_dims = want,
                    "embedding dimensionality differs between provider and store"
                );
            }
        }

        {
            let mut state = self.state.write().unwrap_or_else(|e| e.into_inner());
            state.loaded = true;
            state.closed = false;
            state.last_reload = Some(Utc::now());
            state.stats = stats;
        }
        self.cache.invalidate_all();

        tracing::info!(
            elapsed_ms = started.elapsed().as_millis() as u64,
            generation = self.cache.generation(),
            "retrieval service reloaded"
        );
        Ok(self.status().await)
    }

    /// Drop cached results and mark the service unloaded.
    ///
    /// Queries fail with [`RagError::ShutDown`] until the next successful
    /// [`reload`](Self::reload).
    pub fn shutdown(&self) {
        let mut state = self.state.write().unwrap_or_else(|e| e.into_inner());
        state.loaded = false;
        state.closed = true;
        drop(state);
        self.cache.invalidate_all();
        tracing::info!("retrieval service shut down");
    }

    /// Current health. Counts are read live from the store when it answers
    /// within the search timeout, otherwise the last reload's counts are used.
    pub async fn status(&self) -> RagStatus {
        let (loaded, last_reload, mut stats) = {
            let state = self.load_state();
            (state.loaded, state.last_reload, state.stats.clone())
        };

        let live = tokio::time::timeout(self.settings.search_timeout(), async {
            Ok::<_, StoreError>((
                self.store.count_documents().await?,
                self.store.count_chunks().await?,
            ))
        })
        .await;
        match live {
            Ok(Ok((documents, chunks))) => {
                stats.documents = documents;
                stats.chunks = chunks;
            }
            Ok(Err(e)) => tracing::warn!(error = %e, "status: using cached store counts"),
            Err(_) => tracing::warn!("status: store count timed out, using cached counts"),
        }

        RagStatus {
            loaded,
            enabled: self.settings.enabled,
            total_chunks: stats.chunks,
            total_documents: stats.documents,
            cache_size: self.cache.len(),
            embedding_dimension: stats.embedding_dims,
            embedding_model: self.provider.model_name().to_string(),
            metric: self.store.metric(),
            last_reload,
            cache: self.cache.stats(),
        }
    }

    /// Answer a query with ranked chunks.
    pub async fn query(&self, text: &str, opts: QueryOptions) -> Result<QueryResult, RagError> {
        let started = Instant::now();
        match opts.timeout {
            Some(limit) => tokio::time::timeout(limit, self.run_query(text, &opts, started))
                .await
                .map_err(|_| {
                    tracing::warn!(timeout_ms = limit.as_millis() as u64, "query deadline exceeded");
                    RagError::Timeout {
                        stage: Stage::Query,
                        elapsed: started.elapsed(),
                    }
                })?,
            None => self.run_query(text, &opts, started).await,
        }
    }

    fn rank_params(&self, opts: &QueryOptions) -> Result<RankParams, RagError> {
        let top_k = opts.top_k.unwrap_or(self.settings.top_k);
        if top_k == 0 || top_k > MAX_TOP_K {
            return Err(RagError::Validation(format!(
                "top_k must be between 1 and {}, got {}",
                MAX_TOP_K, top_k
            )));
        }

        let min_score = opts.min_score.unwrap_or(self.settings.min_score);
        if !(0.0..=1.0).contains(&min_score) {
            return Err(RagError::Validation(format!(
                "min_score must be between 0 and 1, got {}",
                min_score
            )));
        }

        let max_chunks_per_doc = opts
            .max_chunks_per_doc
            .unwrap_or(self.settings.max_chunks_per_doc);
        if max_chunks_per_doc == 0 {
            return Err(RagError::Validation(
                "max_chunks_per_doc must be at least 1".to_string(),
            ));
        }

        Ok(RankParams {
            metric: self.store.metric(),
            min_score,
            top_k,
            max_chunks_per_doc,
            snippet_chars: self.settings.snippet_chars,
        })
    }

    /// Everything that changes the ranked output besides the query text.
    fn cache_scope(&self, params: &RankParams, filters: &Filters) -> String {
        format!(
            "{}|{}|{}|{:.6}|{}|{}|{}|{}",
            self.provider.model_name(),
            self.provider.dims(),
            params.metric.as_str(),
            params.min_score,
            params.top_k,
            params.max_chunks_per_doc,
            params.snippet_chars,
            serde_json::to_string(filters).unwrap_or_default(),
        )
    }

    /// Candidates to request from the store.
    fn candidate_limit(&self, params: &RankParams, filters: &Filters) -> usize {
        let post_filtering = !filters.is_empty() && !self.store.supports_prefilter();
        let deduplicating = params.max_chunks_per_doc < params.top_k;
        let limit = if post_filtering || deduplicating {
            params.top_k * self.settings.over_fetch_factor
        } else {
            params.top_k
        };
        limit.clamp(1, MAX_CANDIDATES)
    }

    async fn run_query(
        &self,
        text: &str,
        opts: &QueryOptions,
        started: Instant,
    ) -> Result<QueryResult, RagError> {
        if text.trim().is_empty() {
            return Err(RagError::Validation("query must not be empty".to_string()));
        }
        let params = self.rank_params(opts)?;
        if !self.settings.enabled {
            return Err(RagError::Disabled);
        }
        if self.load_state().closed {
            return Err(RagError::ShutDown);
        }

        let key = CacheKey::new(text, &self.cache_scope(&params, &opts.filters));
        let generation = self.cache.generation();

        match self.cache.get(&key) {
            Ok(Some(hit)) => {
                let took_ms = started.elapsed().as_millis() as u64;
                tracing::debug!(
                    query = key.query(),
                    hits = hit.hits,
                    age_ms = hit.age.as_millis() as u64,
                    "cache hit"
                );
                let result = QueryResult {
                    query: text.to_string(),
                    total_results: hit.items.len(),
                    items: hit.items,
                    sources: hit.sources,
                    from_cache: true,
                    took_ms,
                };
                self.record(&result);
                return Ok(result);
            }
            Ok(None) => {}
            Err(e) => tracing::warn!(error = %e, "cache unavailable, treating as miss"),
        }

        let embed_started = Instant::now();
        let vector = tokio::time::timeout(
            self.settings.embedding_timeout(),
            self.provider.embed(text),
        )
        .await
        .map_err(|_| RagError::Timeout {
            stage: Stage::Embedding,
            elapsed: embed_started.elapsed(),
        })?
        .map_err(|e| RagError::Embedding(e.into_terminal()))?;

        let store_dims = self.load_state().stats.embedding_dims;
        if let Some(expected) = store_dims {
            if expected != vector.len() {
                return Err(StoreError::DimensionMismatch {
                    expected,
                    actual: vector.len(),
                }
                .into());
            }
        }

        let limit = self.candidate_limit(&params, &opts.filters);
        let search_started = Instant::now();
        let mut neighbors = tokio::time::timeout(
            self.settings.search_timeout(),
            self.store.search(&vector, limit, &opts.filters),
        )
        .await
        .map_err(|_| RagError::Timeout {
            stage: Stage::Search,
            elapsed: search_started.elapsed(),
        })??;
        let candidates = neighbors.len();

        if !self.store.supports_prefilter() && !opts.filters.is_empty() {
            neighbors.retain(|n| {
                opts.filters.matches(
                    n.category.as_deref(),
                    &n.document_metadata,
                    &n.chunk_metadata,
                )
            });
        }

        let items = rank(neighbors, &params);
        let sources = unique_sources(&items);

        match self
            .cache
            .put_if_current(key, items.clone(), sources.clone(), generation)
        {
            Ok(_) => {}
            Err(e) => tracing::warn!(error = %e, "cache write skipped"),
        }

        let took_ms = started.elapsed().as_millis() as u64;
        tracing::info!(
            candidates,
            results = items.len(),
            embed_ms = (search_started - embed_started).as_millis() as u64,
            search_ms = search_started.elapsed().as_millis() as u64,
            took_ms,
            "query complete"
        );

        let result = QueryResult {
            query: text.to_string(),
            total_results: items.len(),
            items,
            sources,
            from_cache: false,
            took_ms,
        };
        self.record(&result);
        Ok(result)
    }

    /// Best-effort analytics, written in the background so the query never
    /// waits on it. Failures are logged and ignored.
    fn record(&self, result: &QueryResult) {
        let event = QueryEvent {
            query: result.query.clone(),
            result_count: result.total_results,
            latency_ms: result.took_ms,
            from_cache: result.from_cache,
            at: Utc::now(),
        };
        let store = Arc::clone(&self.store);
        tokio::spawn(async move {
            match tokio::time::timeout(ANALYTICS_TIMEOUT, store.record_query(&event)).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => tracing::debug!(error = %e, "analytics write failed"),
                Err(_) => tracing::debug!("analytics write timed out"),
            }
        });
    }
}

/// Build the configured store and provider, then load the store.
///
/// A failed initial load is logged, not fatal: the service starts
/// unloaded and reports so through [`RagService::status`].
pub async fn build_service(config: &Config) -> anyhow::Result<Arc<RagService>> {
    let retry = RetryPolicy::from_config(&config.retry);

    let store: Arc<dyn ChunkStore> = match config.store.backend.as_str() {
        "postgres" => {
            let pool = crate::db::connect(config).await?;
            Arc::new(PgChunkStore::new(pool, config.store.metric, retry))
        }
        "snapshot" => Arc::new(
            SnapshotFileStore::open(&config.store.snapshot_path, config.store.metric)
                .await
                .with_context(|| {
                    format!(
                        "Failed to load embeddings file {}",
                        config.store.snapshot_path.display()
                    )
                })?,
        ),
        other => anyhow::bail!("Unknown store backend: {}", other),
    };

    let provider = create_provider(config)?;
    let service = Arc::new(RagService::new(store, provider, config));

    if let Err(e) = service.init().await {
        tracing::error!(error = %e, "initial load failed; service starts unloaded");
    }

    Ok(service)
}

#[cfg(test)]
mod tests {
    use super::*;
    use claims_rag_core::store::memory::InMemoryStore;

    struct Fixed;

    #[async_trait::async_trait]
    impl EmbeddingProvider for Fixed {
        fn model_name(&self) -> &str {
            "fixed"
        }
        fn dims(&self) -> usize {
            2
        }
        async fn embed(
            &self,
            _text: &str,
        ) -> Result<Vec<f32>, claims_rag_core::error::EmbeddingError> {
            Ok(vec![1.0, 0.0])
        }
    }

    fn service(config: &Config) -> RagService {
        RagService::new(Arc::new(InMemoryStore::default()), Arc::new(Fixed), config)
    }

    #[test]
    fn test_inferred_state_filter() {
        let opts = QueryOptions::default().with_inferred_filters("drip edge in Maryland");
        assert_eq!(opts.filters.state.as_deref(), Some("MD"));

        let opts = QueryOptions::default()
            .filters(Filters::default().with_state("VA"))
            .with_inferred_filters("drip edge in Maryland");
        assert_eq!(opts.filters.state.as_deref(), Some("VA"));
    }

    #[test]
    fn test_candidate_limit_over_fetches_when_deduplicating() {
        let svc = service(&Config::minimal());
        let params = svc.rank_params(&QueryOptions::default()).unwrap();
        assert_eq!(svc.candidate_limit(&params, &Filters::default()), 20);

        let params = svc
            .rank_params(&QueryOptions {
                max_chunks_per_doc: Some(5),
                ..QueryOptions::default()
            })
            .unwrap();
        assert_eq!(svc.candidate_limit(&params, &Filters::default()), 5);

        let params = svc
            .rank_params(&QueryOptions::default().top_k(100))
            .unwrap();
        assert_eq!(
            svc.candidate_limit(&params, &Filters::default()),
            MAX_CANDIDATES
        );
    }

    #[test]
    fn test_scope_changes_with_parameters() {
        let svc = service(&Config::minimal());
        let a = svc.rank_params(&QueryOptions::default()).unwrap();
        let b = svc.rank_params(&QueryOptions::default().top_k(3)).unwrap();
        let f = Filters::default();
        assert_ne!(svc.cache_scope(&a, &f), svc.cache_scope(&b, &f));
        assert_ne!(
            svc.cache_scope(&a, &f),
            svc.cache_scope(&a, &Filters::default().with_category("warranty"))
        );
    }

    #[tokio::test]
    async fn test_disabled_service() {
        let mut config = Config::minimal();
        config.retrieval.enabled = false;
        let svc = service(&config);
        let err = svc.query("drip edge", QueryOptions::default()).await.unwrap_err();
        assert_eq!(err, RagError::Disabled);
        assert!(!svc.status().await.enabled);
    }

    #[tokio::test]
    async fn test_shutdown_marks_unloaded() {
        let svc = service(&Config::minimal());
        assert!(svc.init().await.unwrap().loaded);
        svc.shutdown();
        assert!(!svc.status().await.loaded);
    }

    #[tokio::test]
    async fn test_queries_refused_after_shutdown_until_reload() {
        let svc = service(&Config::minimal());
        svc.init().await.unwrap();
        svc.query("drip edge", QueryOptions::default()).await.unwrap();
        assert_eq!(svc.cache().len(), 1);

        svc.shutdown();
        let err = svc.query("drip edge", QueryOptions::default()).await.unwrap_err();
        assert_eq!(err, RagError::ShutDown);
        assert_eq!(svc.cache().len(), 0);

        svc.reload().await.unwrap();
        assert!(svc.query("drip edge", QueryOptions::default()).await.is_ok());
    }

    #[tokio::test]
    async fn test_missing_embeddings_file_reports_unloaded() {
        let dir = tempfile::tempdir().unwrap();
        let store = SnapshotFileStore::open(&dir.path().join("missing.json"), DistanceMetric::Cosine)
            .await
            .unwrap();
        let svc = RagService::new(Arc::new(store), Arc::new(Fixed), &Config::minimal());

        assert!(svc.init().await.is_err());
        let status = svc.status().await;
        assert!(!status.loaded);
        assert_eq!(status.total_chunks, 0);

        let result = svc.query("drip edge", QueryOptions::default()).await.unwrap();
        assert!(result.items.is_empty());
    }
}
