//! TOML configuration with environment overrides.
//!
//! Every section has defaults, so a minimal file (or none at all, via
//! [`Config::minimal`]) yields a working configuration. After parsing,
//! [`load_config`] applies environment overrides and validates the result.
//!
//! | Variable | Effect |
//! |----------|--------|
//! | `DATABASE_URL` / `POSTGRES_URL` | Postgres connection string |
//! | `RAG_ENABLED` | `false` disables retrieval |
//! | `RAG_TOP_K` | Default number of results |
//! | `OPENAI_API_KEY` | Bearer token for the OpenAI provider (read by the provider) |

use anyhow::{bail, Context, Result};
use claims_rag_core::models::DistanceMetric;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, Deserialize, Clone, Default)]
pub struct Config {
    #[serde(default)]
    pub db: DbConfig,
    #[serde(default)]
    pub store: StoreConfig,
    #[serde(default)]
    pub embedding: EmbeddingConfig,
    #[serde(default)]
    pub retry: RetryConfig,
    #[serde(default)]
    pub retrieval: RetrievalConfig,
    #[serde(default)]
    pub cache: CacheConfig,
    #[serde(default)]
    pub server: ServerConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct DbConfig {
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,
    #[serde(default = "default_acquire_timeout_secs")]
    pub acquire_timeout_secs: u64,
    /// Server-side `statement_timeout` applied to every pooled connection.
    #[serde(default = "default_statement_timeout_ms")]
    pub statement_timeout_ms: u64,
}

impl Default for DbConfig {
    fn default() -> Self {
        Self {
            url: None,
            max_connections: default_max_connections(),
            acquire_timeout_secs: default_acquire_timeout_secs(),
            statement_timeout_ms: default_statement_timeout_ms(),
        }
    }
}

fn default_max_connections() -> u32 {
    5
}
fn default_acquire_timeout_secs() -> u64 {
    5
}
fn default_statement_timeout_ms() -> u64 {
    5_000
}

#[derive(Debug, Deserialize, Clone)]
pub struct StoreConfig {
    /// `"postgres"` or `"snapshot"`.
    #[serde(default = "default_backend")]
    pub backend: String,
    /// JSON embeddings file used by the `snapshot` backend.
    #[serde(default = "default_snapshot_path")]
    pub snapshot_path: PathBuf,
    /// Must match the metric the vector index was built with.
    #[serde(default)]
    pub metric: DistanceMetric,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            backend: default_backend(),
            snapshot_path: default_snapshot_path(),
            metric: DistanceMetric::default(),
        }
    }
}

fn default_backend() -> String {
    "postgres".to_string()
}
fn default_snapshot_path() -> PathBuf {
    PathBuf::from("data/knowledge_base_embeddings.json")
}

#[derive(Debug, Deserialize, Clone)]
pub struct EmbeddingConfig {
    /// `"openai"`, `"ollama"`, or `"disabled"`.
    #[serde(default = "default_provider")]
    pub provider: String,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub dims: Option<usize>,
    /// Endpoint override (defaults per provider).
    #[serde(default)]
    pub url: Option<String>,
    /// Per-request HTTP timeout.
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
    /// Query text is cut to this many characters before embedding.
    #[serde(default = "default_max_input_chars")]
    pub max_input_chars: usize,
    #[serde(default = "default_max_in_flight")]
    pub max_in_flight: usize,
    /// Callers allowed to wait for a slot before failing fast.
    #[serde(default = "default_max_queued")]
    pub max_queued: usize,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            provider: default_provider(),
            model: None,
            dims: None,
            url: None,
            request_timeout_secs: default_request_timeout_secs(),
            max_input_chars: default_max_input_chars(),
            max_in_flight: default_max_in_flight(),
            max_queued: default_max_queued(),
        }
    }
}

impl EmbeddingConfig {
    pub fn is_enabled(&self) -> bool {
        self.provider != "disabled"
    }
}

fn default_provider() -> String {
    "disabled".to_string()
}
fn default_request_timeout_secs() -> u64 {
    5
}
fn default_max_input_chars() -> usize {
    8_000
}
fn default_max_in_flight() -> usize {
    4
}
fn default_max_queued() -> usize {
    32
}

#[derive(Debug, Deserialize, Clone)]
pub struct RetryConfig {
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
    #[serde(default = "default_jitter_ms")]
    pub jitter_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            base_delay_ms: default_base_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
            jitter_ms: default_jitter_ms(),
        }
    }
}

fn default_max_attempts() -> u32 {
    3
}
fn default_base_delay_ms() -> u64 {
    250
}
fn default_max_delay_ms() -> u64 {
    4_000
}
fn default_jitter_ms() -> u64 {
    100
}

#[derive(Debug, Deserialize, Clone)]
pub struct RetrievalConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_top_k")]
    pub top_k: usize,
    #[serde(default = "default_min_score")]
    pub min_score: f64,
    #[serde(default = "default_max_chunks_per_doc")]
    pub max_chunks_per_doc: usize,
    /// Candidate multiplier when the store cannot pre-filter or results are deduplicated.
    #[serde(default = "default_over_fetch_factor")]
    pub over_fetch_factor: usize,
    #[serde(default = "default_snippet_chars")]
    pub snippet_chars: usize,
    /// Budget for one embedding call, retries included.
    #[serde(default = "default_embedding_timeout_secs")]
    pub embedding_timeout_secs: u64,
    #[serde(default = "default_search_timeout_secs")]
    pub search_timeout_secs: u64,
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            top_k: default_top_k(),
            min_score: default_min_score(),
            max_chunks_per_doc: default_max_chunks_per_doc(),
            over_fetch_factor: default_over_fetch_factor(),
            snippet_chars: default_snippet_chars(),
            embedding_timeout_secs: default_embedding_timeout_secs(),
            search_timeout_secs: default_search_timeout_secs(),
        }
    }
}

impl RetrievalConfig {
    pub fn embedding_timeout(&self) -> Duration {
        Duration::from_secs(self.embedding_timeout_secs)
    }

    pub fn search_timeout(&self) -> Duration {
        Duration::from_secs(self.search_timeout_secs)
    }
}

fn default_true() -> bool {
    true
}
fn default_top_k() -> usize {
    5
}
fn default_min_score() -> f64 {
    0.7
}
fn default_max_chunks_per_doc() -> usize {
    1
}
fn default_over_fetch_factor() -> usize {
    4
}
fn default_snippet_chars() -> usize {
    300
}
fn default_embedding_timeout_secs() -> u64 {
    10
}
fn default_search_timeout_secs() -> u64 {
    5
}

#[derive(Debug, Deserialize, Clone)]
pub struct CacheConfig {
    /// `0` disables the cache.
    #[serde(default = "default_max_entries")]
    pub max_entries: usize,
    #[serde(default = "default_ttl_secs")]
    pub ttl_secs: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            max_entries: default_max_entries(),
            ttl_secs: default_ttl_secs(),
        }
    }
}

fn default_max_entries() -> usize {
    500
}
fn default_ttl_secs() -> u64 {
    3_600
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    #[serde(default = "default_bind")]
    pub bind: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: default_bind(),
        }
    }
}

fn default_bind() -> String {
    "127.0.0.1:7340".to_string()
}

/// Largest `top_k` a caller may request.
pub const MAX_TOP_K: usize = 100;

impl Config {
    /// All defaults: Postgres backend, embeddings disabled.
    pub fn minimal() -> Self {
        Self::default()
    }

    /// Apply environment overrides using `lookup` (normally `std::env::var`).
    pub fn apply_env_overrides<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(url) = lookup("DATABASE_URL").or_else(|| lookup("POSTGRES_URL")) {
            self.db.url = Some(url);
        }

        if let Some(flag) = lookup("RAG_ENABLED") {
            self.retrieval.enabled = flag.trim() != "false";
        }

        if let Some(k) = lookup("RAG_TOP_K") {
            self.retrieval.top_k = k
                .trim()
                .parse()
                .with_context(|| format!("RAG_TOP_K must be a positive integer, got '{}'", k))?;
        }

        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        match self.store.backend.as_str() {
            "postgres" => {
                if self.db.url.as_deref().map_or(true, str::is_empty) {
                    bail!("db.url (or DATABASE_URL) is required for the postgres backend");
                }
            }
            "snapshot" => {}
            other => bail!(
                "Unknown store backend: '{}'. Must be postgres or snapshot.",
                other
            ),
        }

        if self.db.max_connections == 0 {
            bail!("db.max_connections must be > 0");
        }

        match self.embedding.provider.as_str() {
            "disabled" | "openai" | "ollama" => {}
            other => bail!(
                "Unknown embedding provider: '{}'. Must be disabled, openai, or ollama.",
                other
            ),
        }

        if self.embedding.is_enabled() {
            if self.embedding.dims.unwrap_or(0) == 0 {
                bail!(
                    "embedding.dims must be > 0 when provider is '{}'",
                    self.embedding.provider
                );
            }
            if self.embedding.model.is_none() {
                bail!(
                    "embedding.model must be specified when provider is '{}'",
                    self.embedding.provider
                );
            }
        }

        if self.embedding.max_in_flight == 0 {
            bail!("embedding.max_in_flight must be > 0");
        }
        if self.embedding.max_input_chars == 0 {
            bail!("embedding.max_input_chars must be > 0");
        }

        if self.retry.max_attempts == 0 {
            bail!("retry.max_attempts must be >= 1");
        }

        let r = &self.retrieval;
        if r.top_k == 0 || r.top_k > MAX_TOP_K {
            bail!("retrieval.top_k must be in 1..={}", MAX_TOP_K);
        }
        if !(0.0..=1.0).contains(&r.min_score) {
            bail!("retrieval.min_score must be in [0.0, 1.0]");
        }
        if r.max_chunks_per_doc == 0 {
            bail!("retrieval.max_chunks_per_doc must be >= 1");
        }
        if r.over_fetch_factor == 0 {
            bail!("retrieval.over_fetch_factor must be >= 1");
        }
        if r.embedding_timeout_secs == 0 || r.search_timeout_secs == 0 {
            bail!("retrieval timeouts must be > 0");
        }

        Ok(())
    }
}

pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    let mut config: Config =
        toml::from_str(&content).with_context(|| "Failed to parse config file")?;

    config.apply_env_overrides(|key| std::env::var(key).ok())?;
    config.validate()?;

    Ok(config)
}
