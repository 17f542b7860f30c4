//! Embedding provider implementations.
//!
//! Concrete backends for the [`EmbeddingProvider`] trait:
//! - **[`DisabledProvider`]**: always fails; used when embeddings are not configured.
//! - **[`OpenAIProvider`]**: `POST /v1/embeddings` with bearer auth.
//! - **[`OllamaProvider`]**: `POST /api/embed` on a local Ollama instance.
//!
//! [`LimitedProvider`] wraps any of them with a concurrency cap and a
//! bounded wait queue. Use [`create_provider`] to build the configured stack.
//!
//! # Retry Strategy
//!
//! Both HTTP providers share one [`RetryPolicy`]:
//! - HTTP 429 (rate limited) and 5xx → retry
//! - HTTP 429 with `insufficient_quota`, 401/403, other 4xx → fail immediately
//! - Network errors and request timeouts → retry
//!
//! Once retries run out, transient failures surface as
//! [`EmbeddingError::ProviderUnavailable`].

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use claims_rag_core::embedding::{truncate_chars, EmbeddingProvider};
use claims_rag_core::error::EmbeddingError;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;

use crate::config::{Config, EmbeddingConfig};
use crate::retry::RetryPolicy;

const OPENAI_URL: &str = "https://api.openai.com/v1/embeddings";
const OLLAMA_URL: &str = "http://localhost:11434";

// ============ Disabled Provider ============

/// Placeholder provider used when `embedding.provider = "disabled"`.
pub struct DisabledProvider;

#[async_trait]
impl EmbeddingProvider for DisabledProvider {
    fn model_name(&self) -> &str {
        "disabled"
    }
    fn dims(&self) -> usize {
        0
    }
    async fn embed(&self, _text: &str) -> Result<Vec<f32>, EmbeddingError> {
        Err(EmbeddingError::ProviderUnavailable(
            "embedding provider is disabled".to_string(),
        ))
    }
}

// ============ Shared HTTP plumbing ============

/// Map a non-success HTTP status to an embedding error.
pub fn classify_status(status: u16, body: &str) -> EmbeddingError {
    let detail = format!("HTTP {}: {}", status, truncate_chars(body.trim(), 200));
    match status {
        429 if body.contains("insufficient_quota") => EmbeddingError::ProviderUnavailable(detail),
        429 | 500..=599 => EmbeddingError::Transient(detail),
        _ => EmbeddingError::ProviderUnavailable(detail),
    }
}

fn classify_transport(e: &reqwest::Error) -> EmbeddingError {
    if e.is_timeout() {
        EmbeddingError::Timeout
    } else {
        EmbeddingError::Transient(format!("connection error: {}", e))
    }
}

/// Pull the first vector out of an OpenAI- or Ollama-shaped response and
/// check its length.
///
/// Accepts `data[0].embedding`, `embeddings[0]`, or a bare `embedding`.
pub fn parse_embedding_response(
    json: &serde_json::Value,
    dims: usize,
) -> Result<Vec<f32>, EmbeddingError> {
    let raw = json
        .pointer("/data/0/embedding")
        .or_else(|| json.pointer("/embeddings/0"))
        .or_else(|| json.get("embedding"))
        .and_then(|v| v.as_array())
        .ok_or_else(|| EmbeddingError::InvalidResponse("missing embedding array".into()))?;

    let vec = raw
        .iter()
        .map(|v| v.as_f64().map(|f| f as f32))
        .collect::<Option<Vec<f32>>>()
        .ok_or_else(|| EmbeddingError::InvalidResponse("non-numeric embedding value".into()))?;

    if vec.len() != dims {
        return Err(EmbeddingError::InvalidResponse(format!(
            "expected {} dimensions, got {}",
            dims,
            vec.len()
        )));
    }
    if vec.iter().any(|f| !f.is_finite()) {
        return Err(EmbeddingError::InvalidResponse(
            "embedding contains non-finite values".into(),
        ));
    }

    Ok(vec)
}

async fn post_json(
    request: reqwest::RequestBuilder,
    dims: usize,
) -> Result<Vec<f32>, EmbeddingError> {
    let response = request.send().await.map_err(|e| classify_transport(&e))?;
    let status = response.status();

    if !status.is_success() {
        let body = response.text().await.unwrap_or_default();
        return Err(classify_status(status.as_u16(), &body));
    }

    let json: serde_json::Value = response
        .json()
        .await
        .map_err(|e| EmbeddingError::InvalidResponse(e.to_string()))?;
    parse_embedding_response(&json, dims)
}

fn http_client(config: &EmbeddingConfig) -> Result<reqwest::Client> {
    reqwest::Client::builder()
        .timeout(Duration::from_secs(config.request_timeout_secs))
        .build()
        .context("Failed to build HTTP client")
}

fn required_model_and_dims(config: &EmbeddingConfig, who: &str) -> Result<(String, usize)> {
    let model = config
        .model
        .clone()
        .ok_or_else(|| anyhow::anyhow!("embedding.model required for {} provider", who))?;
    let dims = config
        .dims
        .ok_or_else(|| anyhow::anyhow!("embedding.dims required for {} provider", who))?;
    Ok((model, dims))
}

// ============ OpenAI Provider ============

/// Embedding provider using the OpenAI API.
///
/// Requires the `OPENAI_API_KEY` environment variable unless a key is passed
/// to [`OpenAIProvider::with_api_key`].
pub struct OpenAIProvider {
    client: reqwest::Client,
    model: String,
    dims: usize,
    url: String,
    api_key: String,
    max_input_chars: usize,
    retry: RetryPolicy,
}

impl OpenAIProvider {
    pub fn new(config: &EmbeddingConfig, retry: RetryPolicy) -> Result<Self> {
        let api_key = match std::env::var("OPENAI_API_KEY") {
            Ok(key) if !key.is_empty() => key,
            _ => bail!("OPENAI_API_KEY environment variable not set"),
        };
        Self::with_api_key(config, api_key, retry)
    }

    pub fn with_api_key(
        config: &EmbeddingConfig,
        api_key: impl Into<String>,
        retry: RetryPolicy,
    ) -> Result<Self> {
        let (model, dims) = required_model_and_dims(config, "OpenAI")?;
        Ok(Self {
            client: http_client(config)?,
            model,
            dims,
            url: config.url.clone().unwrap_or_else(|| OPENAI_URL.to_string()),
            api_key: api_key.into(),
            max_input_chars: config.max_input_chars,
            retry,
        })
    }

    async fn request_once(&self, text: &str) -> Result<Vec<f32>, EmbeddingError> {
        let body = serde_json::json!({
            "model": self.model,
            "input": text,
            "dimensions": self.dims,
        });
        let request = self
            .client
            .post(&self.url)
            .bearer_auth(&self.api_key)
            .json(&body);
        post_json(request, self.dims).await
    }
}

#[async_trait]
impl EmbeddingProvider for OpenAIProvider {
    fn model_name(&self) -> &str {
        &self.model
    }
    fn dims(&self) -> usize {
        self.dims
    }

    async fn embed(&self, text: &str) -> Result<Vec<f32>, EmbeddingError> {
        let text = truncate_chars(text, self.max_input_chars);
        self.retry
            .run(
                "openai embedding",
                || self.request_once(text),
                EmbeddingError::is_retryable,
            )
            .await
            .map_err(EmbeddingError::into_terminal)
    }
}

// ============ Ollama Provider ============

/// Embedding provider using a local Ollama instance.
///
/// Calls `POST {url}/api/embed` (default `http://localhost:11434`).
pub struct OllamaProvider {
    client: reqwest::Client,
    model: String,
    dims: usize,
    url: String,
    max_input_chars: usize,
    retry: RetryPolicy,
}

impl OllamaProvider {
    pub fn new(config: &EmbeddingConfig, retry: RetryPolicy) -> Result<Self> {
        let (model, dims) = required_model_and_dims(config, "Ollama")?;
        let url = config
            .url
            .clone()
            .unwrap_or_else(|| OLLAMA_URL.to_string());
        Ok(Self {
            client: http_client(config)?,
            model,
            dims,
            url: url.trim_end_matches('/').to_string(),
            max_input_chars: config.max_input_chars,
            retry,
        })
    }

    async fn request_once(&self, text: &str) -> Result<Vec<f32>, EmbeddingError> {
        let body = serde_json::json!({
            "model": self.model,
            "input": text,
        });
        let request = self
            .client
            .post(format!("{}/api/embed", self.url))
            .json(&body);
        post_json(request, self.dims).await
    }
}

#[async_trait]
impl EmbeddingProvider for OllamaProvider {
    fn model_name(&self) -> &str {
        &self.model
    }
    fn dims(&self) -> usize {
        self.dims
    }

    async fn embed(&self, text: &str) -> Result<Vec<f32>, EmbeddingError> {
        let text = truncate_chars(text, self.max_input_chars);
        self.retry
            .run(
                "ollama embedding",
                || self.request_once(text),
                EmbeddingError::is_retryable,
            )
            .await
            .map_err(EmbeddingError::into_terminal)
    }
}

// ============ Concurrency limiter ============

/// Caps in-flight embedding calls.
///
/// Up to `max_in_flight` calls run at once; up to `max_queued` more wait for
/// a slot. Anything beyond that fails fast with
/// [`EmbeddingError::Overloaded`] instead of piling up.
pub struct LimitedProvider {
    inner: Arc<dyn EmbeddingProvider>,
    permits: Semaphore,
    waiting: AtomicUsize,
    max_queued: usize,
}

impl LimitedProvider {
    pub fn new(inner: Arc<dyn EmbeddingProvider>, max_in_flight: usize, max_queued: usize) -> Self {
        Self {
            inner,
            permits: Semaphore::new(max_in_flight.max(1)),
            waiting: AtomicUsize::new(0),
            max_queued,
        }
    }

    /// Callers currently waiting for a slot.
    pub fn queued(&self) -> usize {
        self.waiting.load(Ordering::Acquire)
    }
}

/// One place in the wait queue, given back on drop.
struct QueueSlot<'a> {
    waiting: &'a AtomicUsize,
    /// Callers already waiting when this slot was taken.
    position: usize,
}

impl<'a> QueueSlot<'a> {
    fn take(waiting: &'a AtomicUsize) -> Self {
        let position = waiting.fetch_add(1, Ordering::AcqRel);
        Self { waiting, position }
    }
}

impl Drop for QueueSlot<'_> {
    fn drop(&mut self) {
        self.waiting.fetch_sub(1, Ordering::AcqRel);
    }
}

#[async_trait]
impl EmbeddingProvider for LimitedProvider {
    fn model_name(&self) -> &str {
        self.inner.model_name()
    }
    fn dims(&self) -> usize {
        self.inner.dims()
    }

    async fn embed(&self, text: &str) -> Result<Vec<f32>, EmbeddingError> {
        let _permit = match self.permits.try_acquire() {
            Ok(permit) => permit,
            Err(_) => {
                let slot = QueueSlot::take(&self.waiting);
                if slot.position >= self.max_queued {
                    let queued = slot.position;
                    drop(slot);
                    tracing::warn!(queued, "embedding queue full, rejecting request");
                    return Err(EmbeddingError::Overloaded { queued });
                }
                // The slot is released on drop, including when the caller
                // is cancelled while waiting.
                let acquired = self.permits.acquire().await;
                drop(slot);
                acquired.map_err(|_| {
                    EmbeddingError::ProviderUnavailable("embedding limiter closed".into())
                })?
            }
        };
        self.inner.embed(text).await
    }
}

/// Build the configured provider, wrapped in a [`LimitedProvider`].
///
/// # Errors
///
/// Returns an error for unknown provider names or if the provider
/// cannot be initialized (missing model, dims, or API key).
pub fn create_provider(config: &Config) -> Result<Arc<dyn EmbeddingProvider>> {
    let emb = &config.embedding;
    let retry = RetryPolicy::from_config(&config.retry);

    let inner: Arc<dyn EmbeddingProvider> = match emb.provider.as_str() {
        "disabled" => return Ok(Arc::new(DisabledProvider)),
        "openai" => Arc::new(OpenAIProvider::new(emb, retry)?),
        "ollama" => Arc::new(OllamaProvider::new(emb, retry)?),
        other => bail!("Unknown embedding provider: {}", other),
    };

    tracing::info!(
        provider = %emb.provider,
        model = inner.model_name(),
        dims = inner.dims(),
        "embedding provider ready"
    );

    Ok(Arc::new(LimitedProvider::new(
        inner,
        emb.max_in_flight,
        emb.max_queued,
    )))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tokio::sync::Notify;

    #[test]
    fn test_classify_status() {
        assert!(matches!(
            classify_status(401, "bad key"),
            EmbeddingError::ProviderUnavailable(_)
        ));
        assert!(matches!(
            classify_status(429, r#"{"error":{"code":"insufficient_quota"}}"#),
            EmbeddingError::ProviderUnavailable(_)
        ));
        assert!(matches!(
            classify_status(429, "slow down"),
            EmbeddingError::Transient(_)
        ));
        assert!(matches!(
            classify_status(503, ""),
            EmbeddingError::Transient(_)
        ));
        assert!(matches!(
            classify_status(400, "bad input"),
            EmbeddingError::ProviderUnavailable(_)
        ));
    }

    #[test]
    fn test_parse_openai_shape() {
        let v = parse_embedding_response(&json!({"data": [{"embedding": [0.1, 0.2]}]}), 2).unwrap();
        assert_eq!(v, vec![0.1f32, 0.2]);
    }

    #[test]
    fn test_parse_ollama_shape() {
        let v = parse_embedding_response(&json!({"embeddings": [[1.0, 0.0, 0.0]]}), 3).unwrap();
        assert_eq!(v.len(), 3);
    }

    #[test]
    fn test_parse_rejects_wrong_dims() {
        let err = parse_embedding_response(&json!({"embedding": [1.0]}), 3).unwrap_err();
        assert!(matches!(err, EmbeddingError::InvalidResponse(_)));
    }

    #[test]
    fn test_parse_rejects_missing_and_garbage() {
        assert!(parse_embedding_response(&json!({"data": []}), 1).is_err());
        assert!(parse_embedding_response(&json!({"embedding": ["x"]}), 1).is_err());
    }

    #[tokio::test]
    async fn test_disabled_provider_fails() {
        let err = DisabledProvider.embed("hi").await.unwrap_err();
        assert!(matches!(err, EmbeddingError::ProviderUnavailable(_)));
    }

    #[test]
    fn test_create_disabled_is_unwrapped() {
        let provider = create_provider(&Config::minimal()).unwrap();
        assert_eq!(provider.model_name(), "disabled");
    }

    #[test]
    fn test_ollama_requires_model() {
        let cfg = EmbeddingConfig {
            provider: "ollama".into(),
            dims: Some(768),
            ..EmbeddingConfig::default()
        };
        assert!(OllamaProvider::new(&cfg, RetryPolicy::none()).is_err());
    }

    /// Blocks every call until released.
    struct Gate {
        release: Arc<Notify>,
    }

    #[async_trait]
    impl EmbeddingProvider for Gate {
        fn model_name(&self) -> &str {
            "gate"
        }
        fn dims(&self) -> usize {
            1
        }
        async fn embed(&self, _text: &str) -> Result<Vec<f32>, EmbeddingError> {
            self.release.notified().await;
            Ok(vec![1.0])
        }
    }

    #[tokio::test]
    async fn test_limiter_rejects_when_queue_full() {
        let release = Arc::new(Notify::new());
        let limited = Arc::new(LimitedProvider::new(
            Arc::new(Gate {
                release: release.clone(),
            }),
            1,
            1,
        ));

        let running = tokio::spawn({
            let l = limited.clone();
            async move { l.embed("a").await }
        });
        tokio::task::yield_now().await;
        let queued = tokio::spawn({
            let l = limited.clone();
            async move { l.embed("b").await }
        });
        while limited.queued() < 1 {
            tokio::task::yield_now().await;
        }

        let err = limited.embed("c").await.unwrap_err();
        assert_eq!(err, EmbeddingError::Overloaded { queued: 1 });

        release.notify_one();
        assert!(running.await.unwrap().is_ok());
        release.notify_one();
        assert!(queued.await.unwrap().is_ok());
        assert_eq!(limited.queued(), 0);
    }

    #[tokio::test]
    async fn test_limiter_frees_slot_of_cancelled_waiter() {
        let release = Arc::new(Notify::new());
        let limited = Arc::new(LimitedProvider::new(
            Arc::new(Gate {
                release: release.clone(),
            }),
            1,
            2,
        ));

        let running = tokio::spawn({
            let l = limited.clone();
            async move { l.embed("busy").await }
        });
        tokio::task::yield_now().await;

        for _ in 0..2 {
            let waited =
                tokio::time::timeout(Duration::from_millis(20), limited.embed("gives up")).await;
            assert!(waited.is_err());
        }
        assert_eq!(limited.queued(), 0);

        release.notify_one();
        assert!(running.await.unwrap().is_ok());

        let next = tokio::spawn({
            let l = limited.clone();
            async move { l.embed("fresh").await }
        });
        release.notify_one();
        assert!(next.await.unwrap().is_ok());
        assert_eq!(limited.queued(), 0);
    }
}
