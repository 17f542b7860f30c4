//! HTTP surface tests: the router is served on an ephemeral port and driven
//! with a real client.

use async_trait::async_trait;
use claims_rag::config::Config;
use claims_rag::rag::RagService;
use claims_rag::server::router;
use claims_rag_core::embedding::EmbeddingProvider;
use claims_rag_core::error::EmbeddingError;
use claims_rag_core::models::{Chunk, DistanceMetric, Document};
use claims_rag_core::store::memory::{InMemoryStore, Snapshot};
use serde_json::{json, Value};
use std::sync::Arc;

struct UnitProvider;

#[async_trait]
impl EmbeddingProvider for UnitProvider {
    fn model_name(&self) -> &str {
        "unit"
    }
    fn dims(&self) -> usize {
        2
    }
    async fn embed(&self, _text: &str) -> Result<Vec<f32>, EmbeddingError> {
        Ok(vec![1.0, 0.0])
    }
}

fn snapshot() -> Snapshot {
    Snapshot::new(
        vec![
            Document {
                id: "irc".into(),
                title: Some("IRC R905".into()),
                category: Some("building_codes".into()),
                content_length: 0,
                ingested_at: None,
                metadata: json!({"states": ["VA"]}),
            },
            Document {
                id: "nj".into(),
                title: Some("NJ Matching Rules".into()),
                category: Some("state_rules".into()),
                content_length: 0,
                ingested_at: None,
                metadata: json!({"states": ["NJ"]}),
            },
        ],
        vec![
            Chunk {
                id: "irc-0".into(),
                document_id: "irc".into(),
                ordinal: 0,
                text: "Drip edge shall be provided at eaves and rake edges.".into(),
                embedding: vec![1.0, 0.0],
                keywords: vec![],
                page: None,
                metadata: json!({}),
            },
            Chunk {
                id: "nj-0".into(),
                document_id: "nj".into(),
                ordinal: 0,
                text: "New Jersey requires reasonable uniformity in appearance.".into(),
                embedding: vec![0.95, 0.1],
                keywords: vec![],
                page: None,
                metadata: json!({}),
            },
        ],
    )
    .unwrap()
}

async fn spawn_server(config: Config) -> (String, Arc<RagService>) {
    let store = Arc::new(InMemoryStore::with_snapshot(DistanceMetric::Cosine, snapshot()));
    let service = Arc::new(RagService::new(store, Arc::new(UnitProvider), &config));
    service.init().await.unwrap();

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let app = router(service.clone());
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    (format!("http://{}", addr), service)
}

#[tokio::test]
async fn health_reports_version() {
    let (base, _) = spawn_server(Config::minimal()).await;
    let body: Value = reqwest::get(format!("{}/health", base))
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(body["status"], "ok");
    assert_eq!(body["version"], env!("CARGO_PKG_VERSION"));
}

#[tokio::test]
async fn search_returns_ranked_results() {
    let (base, _) = spawn_server(Config::minimal()).await;
    let client = reqwest::Client::new();

    let resp = client
        .post(format!("{}/search", base))
        .json(&json!({"query": "drip edge", "top_k": 5}))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);
    let body: Value = resp.json().await.unwrap();
    let items = body["items"].as_array().unwrap();
    assert_eq!(items.len(), 2);
    assert_eq!(items[0]["chunk_id"], "irc-0");
    assert_eq!(items[0]["relevance"], "high");
    assert_eq!(body["from_cache"], false);

    let filtered: Value = client
        .post(format!("{}/search", base))
        .json(&json!({"query": "drip edge", "state": "NJ"}))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    let items = filtered["items"].as_array().unwrap();
    assert_eq!(items.len(), 1);
    assert_eq!(items[0]["document_id"], "nj");
}

#[tokio::test]
async fn validation_error_body() {
    let (base, _) = spawn_server(Config::minimal()).await;
    let resp = reqwest::Client::new()
        .post(format!("{}/search", base))
        .json(&json!({"query": "  "}))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 400);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["error"]["code"], "validation");
}

#[tokio::test]
async fn disabled_service_is_unavailable() {
    let mut config = Config::minimal();
    config.retrieval.enabled = false;
    let (base, _) = spawn_server(config).await;
    let resp = reqwest::Client::new()
        .post(format!("{}/search", base))
        .json(&json!({"query": "drip edge"}))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 503);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["error"]["code"], "disabled");
}

#[tokio::test]
async fn status_and_reload() {
    let (base, service) = spawn_server(Config::minimal()).await;
    let client = reqwest::Client::new();

    client
        .post(format!("{}/search", base))
        .json(&json!({"query": "drip edge"}))
        .send()
        .await
        .unwrap();
    assert_eq!(service.cache().len(), 1);

    let status: Value = client
        .get(format!("{}/health/rag", base))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(status["loaded"], true);
    assert_eq!(status["total_chunks"], 2);
    assert_eq!(status["cache_size"], 1);
    assert_eq!(status["metric"], "cosine");

    let reloaded: Value = client
        .post(format!("{}/admin/reload", base))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(reloaded["cache_size"], 0);
    assert_eq!(service.cache().len(), 0);
}
