//! Postgres + pgvector chunk store.
//!
//! Nearest-neighbor queries run server-side with the configured metric's
//! operator (`<=>` or `<#>`). Every value, including the query vector, is a
//! bound parameter; the only SQL text picked at runtime is the operator,
//! which comes from a closed enum.
//!
//! Expected tables:
//!
//! ```sql
//! documents(id, title, category, content_length, metadata jsonb, ingested_at)
//! chunks(id, document_id, ordinal, text, embedding vector(N), metadata jsonb)
//! rag_analytics(query_text, result_count, query_latency_ms, from_cache, timestamp)
//! ```

use async_trait::async_trait;
use claims_rag_core::embedding::{parse_vector_literal, vector_literal};
use claims_rag_core::error::StoreError;
use claims_rag_core::models::{Chunk, DistanceMetric, Filters};
use claims_rag_core::store::{ChunkStore, Neighbor, QueryEvent, StoreStats};
use sqlx::postgres::{PgPool, PgRow};
use sqlx::{Postgres, QueryBuilder, Row};
use std::sync::atomic::{AtomicUsize, Ordering};

use crate::retry::RetryPolicy;

/// SQLSTATE `query_canceled`, raised when `statement_timeout` fires.
const QUERY_CANCELED: &str = "57014";

pub struct PgChunkStore {
    pool: PgPool,
    metric: DistanceMetric,
    retry: RetryPolicy,
    /// Known embedding dimensionality; `0` means not yet read.
    dims: AtomicUsize,
}

impl PgChunkStore {
    pub fn new(pool: PgPool, metric: DistanceMetric, retry: RetryPolicy) -> Self {
        Self {
            pool,
            metric,
            retry,
            dims: AtomicUsize::new(0),
        }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    async fn known_dims(&self) -> Result<Option<usize>, StoreError> {
        match self.dims.load(Ordering::Acquire) {
            0 => {
                let dims = self.embedding_dims().await?;
                if let Some(d) = dims {
                    self.dims.store(d, Ordering::Release);
                }
                Ok(dims)
            }
            d => Ok(Some(d)),
        }
    }

    async fn search_once(
        &self,
        literal: &str,
        limit: usize,
        filters: &Filters,
    ) -> Result<Vec<Neighbor>, StoreError> {
        let op = self.metric.operator();

        let mut qb: QueryBuilder<Postgres> = QueryBuilder::new(
            "SELECT c.id::text AS id, c.document_id::text AS document_id, \
             c.ordinal::bigint AS ordinal, c.text, c.metadata AS chunk_metadata, \
             d.title, d.category, d.metadata AS document_metadata, (c.embedding ",
        );
        qb.push(op).push(" ");
        qb.push_bind(literal.to_string());
        qb.push(
            "::vector)::float8 AS distance \
             FROM chunks c JOIN documents d ON d.id = c.document_id \
             WHERE c.embedding IS NOT NULL",
        );
        push_filters(&mut qb, filters);
        qb.push(" ORDER BY c.embedding ").push(op).push(" ");
        qb.push_bind(literal.to_string());
        qb.push("::vector, c.ordinal ASC, c.id ASC LIMIT ");
        qb.push_bind(limit as i64);

        let rows = qb
            .build()
            .fetch_all(&self.pool)
            .await
            .map_err(map_sqlx_error)?;

        rows.iter().map(row_to_neighbor).collect()
    }

    async fn stats(&self) -> Result<StoreStats, StoreError> {
        Ok(StoreStats {
            documents: self.count_documents().await?,
            chunks: self.count_chunks().await?,
            embedding_dims: self.embedding_dims().await?,
        })
    }
}

fn push_filters(qb: &mut QueryBuilder<'_, Postgres>, filters: &Filters) {
    if let Some(category) = &filters.category {
        qb.push(" AND d.category = ").push_bind(category.clone());
    }
    if let Some(state) = &filters.state {
        qb.push(" AND d.metadata->'states' @> ")
            .push_bind(serde_json::json!([state]));
    }
    for (key, value) in &filters.metadata {
        qb.push(" AND c.metadata->>")
            .push_bind(key.clone())
            .push(" = ")
            .push_bind(value.clone());
    }
}

fn row_to_neighbor(row: &PgRow) -> Result<Neighbor, StoreError> {
    let get_err = |e: sqlx::Error| StoreError::InvalidData(e.to_string());
    Ok(Neighbor {
        chunk_id: row.try_get("id").map_err(get_err)?,
        document_id: row.try_get("document_id").map_err(get_err)?,
        ordinal: row.try_get("ordinal").map_err(get_err)?,
        distance: row.try_get("distance").map_err(get_err)?,
        text: row.try_get("text").map_err(get_err)?,
        document_title: row.try_get("title").map_err(get_err)?,
        category: row.try_get("category").map_err(get_err)?,
        document_metadata: json_or_empty(row.try_get("document_metadata").map_err(get_err)?),
        chunk_metadata: json_or_empty(row.try_get("chunk_metadata").map_err(get_err)?),
    })
}

fn json_or_empty(value: Option<serde_json::Value>) -> serde_json::Value {
    value.unwrap_or_else(|| serde_json::Value::Object(Default::default()))
}

/// Classify a sqlx error into the store taxonomy.
pub fn map_sqlx_error(e: sqlx::Error) -> StoreError {
    match &e {
        sqlx::Error::PoolTimedOut
        | sqlx::Error::PoolClosed
        | sqlx::Error::Io(_)
        | sqlx::Error::Tls(_) => StoreError::ConnectionFailed(e.to_string()),
        sqlx::Error::Database(db) if db.code().as_deref() == Some(QUERY_CANCELED) => {
            StoreError::QueryTimeout
        }
        _ => StoreError::Query(e.to_string()),
    }
}

#[async_trait]
impl ChunkStore for PgChunkStore {
    fn metric(&self) -> DistanceMetric {
        self.metric
    }

    fn supports_prefilter(&self) -> bool {
        true
    }

    async fn search(
        &self,
        query_vec: &[f32],
        limit: usize,
        filters: &Filters,
    ) -> Result<Vec<Neighbor>, StoreError> {
        if limit == 0 {
            return Ok(Vec::new());
        }

        let Some(dims) = self.known_dims().await? else {
            return Ok(Vec::new());
        };
        if dims != query_vec.len() {
            return Err(StoreError::DimensionMismatch {
                expected: dims,
                actual: query_vec.len(),
            });
        }

        let literal = vector_literal(query_vec);
        let neighbors = self
            .retry
            .run(
                "pgvector search",
                || self.search_once(&literal, limit, filters),
                StoreError::is_retryable,
            )
            .await?;

        tracing::debug!(
            candidates = neighbors.len(),
            limit,
            metric = self.metric.as_str(),
            "pgvector search complete"
        );
        Ok(neighbors)
    }

    async fn get_chunk(&self, id: &str) -> Result<Option<Chunk>, StoreError> {
        let row = sqlx::query(
            "SELECT id::text AS id, document_id::text AS document_id, ordinal::bigint AS ordinal, \
             text, embedding::text AS embedding, metadata \
             FROM chunks WHERE id::text = $1",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .map_err(map_sqlx_error)?;

        let Some(row) = row else {
            return Ok(None);
        };

        let get_err = |e: sqlx::Error| StoreError::InvalidData(e.to_string());
        let embedding_text: Option<String> = row.try_get("embedding").map_err(get_err)?;
        let embedding = match embedding_text {
            Some(text) => parse_vector_literal(&text).ok_or_else(|| {
                StoreError::InvalidData(format!("chunk {} has an unreadable embedding", id))
            })?,
            None => Vec::new(),
        };

        Ok(Some(Chunk {
            id: row.try_get("id").map_err(get_err)?,
            document_id: row.try_get("document_id").map_err(get_err)?,
            ordinal: row.try_get("ordinal").map_err(get_err)?,
            text: row.try_get("text").map_err(get_err)?,
            embedding,
            keywords: Vec::new(),
            page: None,
            metadata: json_or_empty(row.try_get("metadata").map_err(get_err)?),
        }))
    }

    async fn count_documents(&self) -> Result<u64, StoreError> {
        let n: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM documents")
            .fetch_one(&self.pool)
            .await
            .map_err(map_sqlx_error)?;
        Ok(n as u64)
    }

    async fn count_chunks(&self) -> Result<u64, StoreError> {
        let n: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM chunks WHERE embedding IS NOT NULL")
            .fetch_one(&self.pool)
            .await
            .map_err(map_sqlx_error)?;
        Ok(n as u64)
    }

    async fn embedding_dims(&self) -> Result<Option<usize>, StoreError> {
        let dims: Option<i32> = sqlx::query_scalar(
            "SELECT vector_dims(embedding) FROM chunks WHERE embedding IS NOT NULL LIMIT 1",
        )
        .fetch_optional(&self.pool)
        .await
        .map_err(map_sqlx_error)?;
        Ok(dims.map(|d| d as usize))
    }

    async fn reload(&self) -> Result<StoreStats, StoreError> {
        let stats = self
            .retry
            .run("pgvector reload", || self.stats(), StoreError::is_retryable)
            .await?;
        self.dims
            .store(stats.embedding_dims.unwrap_or(0), Ordering::Release);
        tracing::info!(
            documents = stats.documents,
            chunks = stats.chunks,
            dims = ?stats.embedding_dims,
            "chunk store reloaded"
        );
        Ok(stats)
    }

    async fn record_query(&self, event: &QueryEvent) -> Result<(), StoreError> {
        sqlx::query(
            "INSERT INTO rag_analytics \
             (query_text, result_count, query_latency_ms, from_cache, timestamp) \
             VALUES ($1, $2, $3, $4, $5)",
        )
        .bind(&event.query)
        .bind(event.result_count as i32)
        .bind(event.latency_ms as i64)
        .bind(event.from_cache)
        .bind(event.at)
        .execute(&self.pool)
        .await
        .map_err(map_sqlx_error)?;
        Ok(())
    }
}
