//! File-backed chunk store.
//!
//! Serves an embeddings file produced by the offline build pipeline:
//!
//! ```json
//! {
//!   "metadata": { "embedding_dimension": 1536 },
//!   "chunks": [
//!     { "id": "c1", "text": "...", "embedding": [0.1, ...],
//!       "metadata": { "filename": "IRC.pdf", "doc_type": "building_codes" } }
//!   ]
//! }
//! ```
//!
//! Chunks are grouped into documents by `metadata.filename` (or `source`).
//! The document category comes from `doc_type` (or `domain`). A reload
//! parses the whole file first and only then swaps it in, so a bad file
//! leaves the previous snapshot serving.

use async_trait::async_trait;
use claims_rag_core::error::StoreError;
use claims_rag_core::models::{Chunk, DistanceMetric, Document, Filters};
use claims_rag_core::store::memory::{InMemoryStore, Snapshot};
use claims_rag_core::store::{ChunkStore, Neighbor, StoreStats};
use serde::Deserialize;
use std::collections::HashMap;
use std::path::{Path, PathBuf};

#[derive(Debug, Deserialize)]
struct SnapshotFile {
    #[serde(default)]
    metadata: FileMetadata,
    chunks: Vec<FileChunk>,
}

#[derive(Debug, Default, Deserialize)]
struct FileMetadata {
    #[serde(default)]
    embedding_dimension: Option<usize>,
}

#[derive(Debug, Deserialize)]
struct FileChunk {
    id: String,
    text: String,
    embedding: Vec<f32>,
    #[serde(default)]
    metadata: serde_json::Value,
}

fn meta_str<'a>(meta: &'a serde_json::Value, keys: &[&str]) -> Option<&'a str> {
    keys.iter()
        .find_map(|k| meta.get(k).and_then(|v| v.as_str()))
        .filter(|s| !s.is_empty())
}

/// Parse an embeddings file into a validated [`Snapshot`].
pub fn parse_snapshot(content: &str) -> Result<Snapshot, StoreError> {
    let file: SnapshotFile = serde_json::from_str(content)
        .map_err(|e| StoreError::InvalidData(format!("embeddings file: {}", e)))?;

    if let (Some(declared), Some(first)) = (
        file.metadata.embedding_dimension.filter(|d| *d > 0),
        file.chunks.first(),
    ) {
        if first.embedding.len() != declared {
            return Err(StoreError::DimensionMismatch {
                expected: declared,
                actual: first.embedding.len(),
            });
        }
    }

    let mut documents: Vec<Document> = Vec::new();
    let mut doc_index: HashMap<String, usize> = HashMap::new();
    let mut next_ordinal: Vec<i64> = Vec::new();
    let mut chunks = Vec::with_capacity(file.chunks.len());

    for fc in file.chunks {
        let doc_id = meta_str(&fc.metadata, &["filename", "source"])
            .unwrap_or(fc.id.as_str())
            .to_string();

        let idx = match doc_index.get(&doc_id) {
            Some(&i) => i,
            None => {
                let i = documents.len();
                let states = fc
                    .metadata
                    .get("states")
                    .cloned()
                    .unwrap_or(serde_json::Value::Array(Vec::new()));
                documents.push(Document {
                    id: doc_id.clone(),
                    title: Some(doc_id.clone()),
                    category: meta_str(&fc.metadata, &["doc_type", "domain", "category"])
                        .map(String::from),
                    content_length: 0,
                    ingested_at: None,
                    metadata: serde_json::json!({ "states": states }),
                });
                doc_index.insert(doc_id.clone(), i);
                next_ordinal.push(0);
                i
            }
        };

        let ordinal = fc
            .metadata
            .get("chunk_index")
            .and_then(|v| v.as_i64())
            .unwrap_or(next_ordinal[idx]);
        next_ordinal[idx] = ordinal + 1;
        documents[idx].content_length += fc.text.chars().count();

        chunks.push(Chunk {
            id: fc.id,
            document_id: doc_id,
            ordinal,
            text: fc.text,
            embedding: fc.embedding,
            keywords: Vec::new(),
            page: None,
            metadata: fc.metadata,
        });
    }

    Snapshot::new(documents, chunks)
}

/// [`InMemoryStore`] fed from an embeddings file on disk.
pub struct SnapshotFileStore {
    path: PathBuf,
    inner: InMemoryStore,
}

impl SnapshotFileStore {
    /// Load `path`. A missing file starts the store empty so the service
    /// can report "not loaded" instead of refusing to start.
    pub async fn open(path: &Path, metric: DistanceMetric) -> Result<Self, StoreError> {
        let store = Self {
            path: path.to_path_buf(),
            inner: InMemoryStore::new(metric),
        };

        if !path.exists() {
            tracing::warn!(path = %path.display(), "embeddings file not found, starting empty");
            return Ok(store);
        }

        let snapshot = store.read_file().await?;
        store.inner.replace_snapshot(snapshot);
        Ok(store)
    }

    async fn read_file(&self) -> Result<Snapshot, StoreError> {
        let started = std::time::Instant::now();
        let content = tokio::fs::read_to_string(&self.path).await.map_err(|e| {
            StoreError::ConnectionFailed(format!("{}: {}", self.path.display(), e))
        })?;
        let snapshot = parse_snapshot(&content)?;
        let stats = snapshot.stats();
        tracing::info!(
            path = %self.path.display(),
            documents = stats.documents,
            chunks = stats.chunks,
            dims = ?stats.embedding_dims,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "embeddings file loaded"
        );
        Ok(snapshot)
    }
}

#[async_trait]
impl ChunkStore for SnapshotFileStore {
    fn metric(&self) -> DistanceMetric {
        self.inner.metric()
    }

    fn supports_prefilter(&self) -> bool {
        self.inner.supports_prefilter()
    }

    async fn search(
        &self,
        query_vec: &[f32],
        limit: usize,
        filters: &Filters,
    ) -> Result<Vec<Neighbor>, StoreError> {
        self.inner.search(query_vec, limit, filters).await
    }

    async fn get_chunk(&self, id: &str) -> Result<Option<Chunk>, StoreError> {
        self.inner.get_chunk(id).await
    }

    async fn count_documents(&self) -> Result<u64, StoreError> {
        self.inner.count_documents().await
    }

    async fn count_chunks(&self) -> Result<u64, StoreError> {
        self.inner.count_chunks().await
    }

    async fn embedding_dims(&self) -> Result<Option<usize>, StoreError> {
        self.inner.embedding_dims().await
    }

    async fn reload(&self) -> Result<StoreStats, StoreError> {
        let snapshot = self.read_file().await?;
        let stats = snapshot.stats();
        self.inner.replace_snapshot(snapshot);
        Ok(stats)
    }
}
