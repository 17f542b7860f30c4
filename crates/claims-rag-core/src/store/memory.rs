//! In-memory [`ChunkStore`] implementation for tests and file-backed
//! knowledge bases.
//!
//! The whole data set lives in an immutable [`Snapshot`] behind
//! `RwLock<Arc<Snapshot>>`. Searches clone the `Arc` and scan without holding
//! the lock; [`InMemoryStore::replace_snapshot`] swaps the pointer, so a
//! reader sees either the old data set or the new one, never a mix.
//! Vector search is brute force over all chunks.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::embedding::{cosine_similarity, inner_product};
use crate::error::StoreError;
use crate::models::{Chunk, DistanceMetric, Document, Filters};

use super::{ChunkStore, Neighbor, StoreStats};

/// An immutable, validated set of documents and chunks.
#[derive(Debug, Clone)]
pub struct Snapshot {
    documents: HashMap<String, Document>,
    chunks: Vec<Chunk>,
    dims: Option<usize>,
    loaded_at: DateTime<Utc>,
}

impl Snapshot {
    pub fn empty() -> Self {
        Self {
            documents: HashMap::new(),
            chunks: Vec::new(),
            dims: None,
            loaded_at: Utc::now(),
        }
    }

    /// Build a snapshot, enforcing the store invariants:
    /// every chunk references a known document, and all embeddings share
    /// one non-zero dimensionality.
    pub fn new(documents: Vec<Document>, chunks: Vec<Chunk>) -> Result<Self, StoreError> {
        let documents: HashMap<String, Document> =
            documents.into_iter().map(|d| (d.id.clone(), d)).collect();

        let mut dims: Option<usize> = None;
        for chunk in &chunks {
            if !documents.contains_key(&chunk.document_id) {
                return Err(StoreError::InvalidData(format!(
                    "chunk {} references unknown document {}",
                    chunk.id, chunk.document_id
                )));
            }
            let len = chunk.embedding.len();
            if len == 0 {
                return Err(StoreError::InvalidData(format!(
                    "chunk {} has an empty embedding",
                    chunk.id
                )));
            }
            match dims {
                None => dims = Some(len),
                Some(expected) if expected != len => {
                    return Err(StoreError::InvalidData(format!(
                        "chunk {} has {} dimensions, expected {}",
                        chunk.id, len, expected
                    )));
                }
                Some(_) => {}
            }
        }

        Ok(Self {
            documents,
            chunks,
            dims,
            loaded_at: Utc::now(),
        })
    }

    pub fn stats(&self) -> StoreStats {
        StoreStats {
            documents: self.documents.len() as u64,
            chunks: self.chunks.len() as u64,
            embedding_dims: self.dims,
        }
    }

    pub fn loaded_at(&self) -> DateTime<Utc> {
        self.loaded_at
    }

    pub fn is_empty(&self) -> bool {
        self.chunks.is_empty()
    }
}

/// In-memory chunk store.
pub struct InMemoryStore {
    snapshot: RwLock<Arc<Snapshot>>,
    metric: DistanceMetric,
}

impl InMemoryStore {
    pub fn new(metric: DistanceMetric) -> Self {
        Self {
            snapshot: RwLock::new(Arc::new(Snapshot::empty())),
            metric,
        }
    }

    pub fn with_snapshot(metric: DistanceMetric, snapshot: Snapshot) -> Self {
        Self {
            snapshot: RwLock::new(Arc::new(snapshot)),
            metric,
        }
    }

    /// Atomically replace the data set.
    pub fn replace_snapshot(&self, snapshot: Snapshot) {
        // The guarded value is a plain Arc, so a poisoned lock holds no torn state.
        let mut guard = self.snapshot.write().unwrap_or_else(|e| e.into_inner());
        *guard = Arc::new(snapshot);
    }

    /// The current data set.
    pub fn snapshot(&self) -> Arc<Snapshot> {
        self.snapshot
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    fn distance(&self, a: &[f32], b: &[f32]) -> f64 {
        match self.metric {
            DistanceMetric::Cosine => 1.0 - cosine_similarity(a, b) as f64,
            DistanceMetric::InnerProduct => -(inner_product(a, b) as f64),
        }
    }
}

impl Default for InMemoryStore {
    fn default() -> Self {
        Self::new(DistanceMetric::Cosine)
    }
}

#[async_trait]
impl ChunkStore for InMemoryStore {
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
        let snap = self.snapshot();

        if let Some(dims) = snap.dims {
            if dims != query_vec.len() {
                return Err(StoreError::DimensionMismatch {
                    expected: dims,
                    actual: query_vec.len(),
                });
            }
        }

        let mut hits: Vec<Neighbor> = Vec::new();
        for chunk in &snap.chunks {
            // Snapshot::new guarantees the parent exists.
            let Some(doc) = snap.documents.get(&chunk.document_id) else {
                continue;
            };
            if !filters.matches(doc.category.as_deref(), &doc.metadata, &chunk.metadata) {
                continue;
            }
            hits.push(Neighbor {
                chunk_id: chunk.id.clone(),
                document_id: chunk.document_id.clone(),
                ordinal: chunk.ordinal,
                distance: self.distance(query_vec, &chunk.embedding),
                text: chunk.text.clone(),
                document_title: doc.title.clone(),
                category: doc.category.clone(),
                document_metadata: doc.metadata.clone(),
                chunk_metadata: chunk.metadata.clone(),
            });
        }

        hits.sort_by(|a, b| {
            a.distance
                .partial_cmp(&b.distance)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then(a.ordinal.cmp(&b.ordinal))
                .then_with(|| a.chunk_id.cmp(&b.chunk_id))
        });
        hits.truncate(limit);

        Ok(hits)
    }

    async fn get_chunk(&self, id: &str) -> Result<Option<Chunk>, StoreError> {
        let snap = self.snapshot();
        Ok(snap.chunks.iter().find(|c| c.id == id).cloned())
    }

    async fn count_documents(&self) -> Result<u64, StoreError> {
        Ok(self.snapshot().documents.len() as u64)
    }

    async fn count_chunks(&self) -> Result<u64, StoreError> {
        Ok(self.snapshot().chunks.len() as u64)
    }

    async fn embedding_dims(&self) -> Result<Option<usize>, StoreError> {
        Ok(self.snapshot().dims)
    }

    /// No backing source: reports the current snapshot.
    async fn reload(&self) -> Result<StoreStats, StoreError> {
        Ok(self.snapshot().stats())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn doc(id: &str, category: &str) -> Document {
        Document {
            id: id.to_string(),
            title: Some(format!("Title {}", id)),
            category: Some(category.to_string()),
            content_length: 100,
            ingested_at: None,
            metadata: json!({"states": ["VA"]}),
        }
    }

    fn chunk(id: &str, doc_id: &str, ordinal: i64, embedding: Vec<f32>) -> Chunk {
        Chunk {
            id: id.to_string(),
            document_id: doc_id.to_string(),
            ordinal,
            text: format!("text of {}", id),
            embedding,
            keywords: Vec::new(),
            page: None,
            metadata: json!({}),
        }
    }

    fn sample_store() -> InMemoryStore {
        let snap = Snapshot::new(
            vec![doc("d1", "codes"), doc("d2", "templates")],
            vec![
                chunk("c1", "d1", 0, vec![1.0, 0.0]),
                chunk("c2", "d1", 1, vec![0.6, 0.8]),
                chunk("c3", "d2", 0, vec![0.0, 1.0]),
            ],
        )
        .unwrap();
        InMemoryStore::with_snapshot(DistanceMetric::Cosine, snap)
    }

    #[tokio::test]
    async fn test_search_orders_by_distance() {
        let store = sample_store();
        let hits = store.search(&[1.0, 0.0], 10, &Filters::default()).await.unwrap();
        let ids: Vec<&str> = hits.iter().map(|h| h.chunk_id.as_str()).collect();
        assert_eq!(ids, vec!["c1", "c2", "c3"]);
        assert!(hits[0].distance.abs() < 1e-6);
    }

    #[tokio::test]
    async fn test_search_respects_limit_and_filters() {
        let store = sample_store();
        let hits = store.search(&[1.0, 0.0], 1, &Filters::default()).await.unwrap();
        assert_eq!(hits.len(), 1);

        let filters = Filters::default().with_category("templates");
        let hits = store.search(&[1.0, 0.0], 10, &filters).await.unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].chunk_id, "c3");
    }

    #[tokio::test]
    async fn test_empty_store_returns_empty() {
        let store = InMemoryStore::default();
        let hits = store.search(&[1.0, 0.0], 5, &Filters::default()).await.unwrap();
        assert!(hits.is_empty());
        assert_eq!(store.count_chunks().await.unwrap(), 0);
        assert_eq!(store.embedding_dims().await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_dimension_mismatch() {
        let store = sample_store();
        let err = store
            .search(&[1.0, 0.0, 0.0], 5, &Filters::default())
            .await
            .unwrap_err();
        assert_eq!(
            err,
            StoreError::DimensionMismatch {
                expected: 2,
                actual: 3
            }
        );
    }

    #[tokio::test]
    async fn test_inner_product_distance() {
        let snap = Snapshot::new(
            vec![doc("d1", "codes")],
            vec![chunk("c1", "d1", 0, vec![1.0, 0.0])],
        )
        .unwrap();
        let store = InMemoryStore::with_snapshot(DistanceMetric::InnerProduct, snap);
        let hits = store.search(&[1.0, 0.0], 5, &Filters::default()).await.unwrap();
        assert!((hits[0].distance + 1.0).abs() < 1e-6);
    }

    #[tokio::test]
    async fn test_replace_snapshot_swaps_data() {
        let store = sample_store();
        assert_eq!(store.count_documents().await.unwrap(), 2);
        store.replace_snapshot(Snapshot::empty());
        assert_eq!(store.count_documents().await.unwrap(), 0);
        assert!(store.get_chunk("c1").await.unwrap().is_none());
    }

    #[test]
    fn test_snapshot_rejects_orphan_chunk() {
        let err = Snapshot::new(vec![], vec![chunk("c1", "missing", 0, vec![1.0])]).unwrap_err();
        assert!(matches!(err, StoreError::InvalidData(_)));
    }

    #[test]
    fn test_snapshot_rejects_mixed_dims() {
        let err = Snapshot::new(
            vec![doc("d1", "codes")],
            vec![
                chunk("c1", "d1", 0, vec![1.0, 0.0]),
                chunk("c2", "d1", 1, vec![1.0]),
            ],
        )
        .unwrap_err();
        assert!(matches!(err, StoreError::InvalidData(_)));
    }
}
