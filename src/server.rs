//! Debug HTTP surface for the retrieval service.
//!
//! # Endpoints
//!
//! | Method | Path | Description |
//! |--------|------|-------------|
//! | `POST` | `/search` | Run a query: `{query, top_k?, min_score?, category?, state?}` |
//! | `GET` | `/health/rag` | Retrieval status (counts, cache, last reload) |
//! | `POST` | `/admin/reload` | Reload the store and clear the cache |
//! | `GET` | `/health` | Liveness: `{status, version}` |
//!
//! Errors use `{"error": {"code", "message"}}` where `code` is the
//! [`RagError::kind`] of the failure.

use axum::{
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use claims_rag_core::error::{EmbeddingError, RagError};
use claims_rag_core::models::{Filters, QueryResult};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};

use crate::rag::{QueryOptions, RagService, RagStatus};

/// Build the router over a shared service.
pub fn router(service: Arc<RagService>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/search", post(handle_search))
        .route("/health/rag", get(handle_status))
        .route("/admin/reload", post(handle_reload))
        .route("/health", get(handle_health))
        .layer(cors)
        .with_state(service)
}

/// Serve until the process is terminated.
pub async fn run_server(service: Arc<RagService>, bind_addr: &str) -> anyhow::Result<()> {
    let app = router(service);
    let listener = tokio::net::TcpListener::bind(bind_addr).await?;
    tracing::info!(addr = %bind_addr, "retrieval server listening");
    axum::serve(listener, app).await?;
    Ok(())
}

// ============ Error response ============

#[derive(Serialize)]
struct ErrorBody {
    error: ErrorDetail,
}

#[derive(Serialize)]
struct ErrorDetail {
    code: String,
    message: String,
}

struct AppError {
    status: StatusCode,
    code: String,
    message: String,
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let body = ErrorBody {
            error: ErrorDetail {
                code: self.code,
                message: self.message,
            },
        };
        (self.status, Json(body)).into_response()
    }
}

impl From<RagError> for AppError {
    fn from(err: RagError) -> Self {
        let status = match &err {
            RagError::Validation(_) => StatusCode::BAD_REQUEST,
            RagError::Disabled | RagError::ShutDown => StatusCode::SERVICE_UNAVAILABLE,
            RagError::Timeout { .. } => StatusCode::GATEWAY_TIMEOUT,
            RagError::Embedding(EmbeddingError::Overloaded { .. }) => {
                StatusCode::TOO_MANY_REQUESTS
            }
            RagError::Embedding(_) => StatusCode::BAD_GATEWAY,
            RagError::Store(_) => StatusCode::SERVICE_UNAVAILABLE,
        };
        AppError {
            status,
            code: err.kind().to_string(),
            message: err.to_string(),
        }
    }
}

// ============ POST /search ============

#[derive(Debug, Deserialize)]
struct SearchRequest {
    query: String,
    #[serde(default)]
    top_k: Option<usize>,
    #[serde(default)]
    min_score: Option<f64>,
    #[serde(default)]
    category: Option<String>,
    #[serde(default)]
    state: Option<String>,
}

async fn handle_search(
    State(service): State<Arc<RagService>>,
    Json(req): Json<SearchRequest>,
) -> Result<Json<QueryResult>, AppError> {
    let filters = Filters {
        category: req.category,
        state: req.state,
        ..Filters::default()
    };
    let opts = QueryOptions {
        top_k: req.top_k,
        min_score: req.min_score,
        filters,
        ..QueryOptions::default()
    };
    let result = service.query(&req.query, opts).await?;
    Ok(Json(result))
}

// ============ GET /health/rag ============

async fn handle_status(State(service): State<Arc<RagService>>) -> Json<RagStatus> {
    Json(service.status().await)
}

// ============ POST /admin/reload ============

async fn handle_reload(
    State(service): State<Arc<RagService>>,
) -> Result<Json<RagStatus>, AppError> {
    Ok(Json(service.reload().await?))
}

// ============ GET /health ============

#[derive(Serialize)]
struct HealthResponse {
    status: String,
    version: String,
}

async fn handle_health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
    })
}
