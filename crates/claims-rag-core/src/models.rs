//! Core data models used throughout the retrieval pipeline.
//!
//! Documents and chunks are produced by the (external) ingestion pipeline and
//! are read-only to the query path. [`ResultItem`] and [`QueryResult`] are
//! request-scoped and never persisted.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A source artifact: training manual, code reference, email template.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Document {
    pub id: String,
    pub title: Option<String>,
    pub category: Option<String>,
    /// Length of the raw document text in characters.
    #[serde(default)]
    pub content_length: usize,
    #[serde(default)]
    pub ingested_at: Option<DateTime<Utc>>,
    /// Free-form document metadata (e.g. `{"states": ["VA", "MD"]}`).
    #[serde(default = "empty_object")]
    pub metadata: serde_json::Value,
}

/// A contiguous slice of a [`Document`]'s text with its embedding.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Chunk {
    pub id: String,
    pub document_id: String,
    /// Position of the chunk within its document, starting at 0.
    pub ordinal: i64,
    pub text: String,
    pub embedding: Vec<f32>,
    #[serde(default)]
    pub keywords: Vec<String>,
    #[serde(default)]
    pub page: Option<i32>,
    #[serde(default = "empty_object")]
    pub metadata: serde_json::Value,
}

pub(crate) fn empty_object() -> serde_json::Value {
    serde_json::Value::Object(serde_json::Map::new())
}

/// Distance metric the vector index was built with.
///
/// Must match the index; mixing metrics ranks results silently wrong.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum DistanceMetric {
    /// pgvector `<=>`: `distance = 1 - cos(a, b)`.
    #[default]
    Cosine,
    /// pgvector `<#>`: `distance = -(a · b)`. Vectors are expected to be unit length.
    InnerProduct,
}

impl DistanceMetric {
    /// The pgvector operator for this metric.
    pub fn operator(self) -> &'static str {
        match self {
            DistanceMetric::Cosine => "<=>",
            DistanceMetric::InnerProduct => "<#>",
        }
    }

    /// Convert a raw distance into a similarity clamped to `[0.0, 1.0]`.
    pub fn similarity(self, distance: f64) -> f64 {
        let sim = match self {
            DistanceMetric::Cosine => 1.0 - distance,
            DistanceMetric::InnerProduct => (1.0 - distance) / 2.0,
        };
        if sim.is_nan() {
            0.0
        } else {
            sim.clamp(0.0, 1.0)
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            DistanceMetric::Cosine => "cosine",
            DistanceMetric::InnerProduct => "inner_product",
        }
    }
}

impl std::str::FromStr for DistanceMetric {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "cosine" => Ok(DistanceMetric::Cosine),
            "inner_product" | "ip" => Ok(DistanceMetric::InnerProduct),
            other => Err(format!(
                "unknown distance metric '{}': expected cosine or inner_product",
                other
            )),
        }
    }
}

/// Equality filters that narrow a search.
///
/// All set fields must match. `state` matches when the document metadata's
/// `states` array contains the value; `metadata` entries are compared
/// against the chunk metadata (string values only).
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Filters {
    #[serde(default)]
    pub category: Option<String>,
    #[serde(default)]
    pub state: Option<String>,
    #[serde(default)]
    pub metadata: BTreeMap<String, String>,
}

impl Filters {
    pub fn is_empty(&self) -> bool {
        self.category.is_none() && self.state.is_none() && self.metadata.is_empty()
    }

    pub fn with_category(mut self, category: impl Into<String>) -> Self {
        self.category = Some(category.into());
        self
    }

    pub fn with_state(mut self, state: impl Into<String>) -> Self {
        self.state = Some(state.into());
        self
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    /// Evaluate the filters against a candidate's document and chunk fields.
    pub fn matches(
        &self,
        category: Option<&str>,
        document_metadata: &serde_json::Value,
        chunk_metadata: &serde_json::Value,
    ) -> bool {
        if let Some(want) = &self.category {
            if category != Some(want.as_str()) {
                return false;
            }
        }

        if let Some(state) = &self.state {
            let listed = document_metadata
                .get("states")
                .and_then(|s| s.as_array())
                .map(|states| states.iter().any(|s| s.as_str() == Some(state.as_str())))
                .unwrap_or(false);
            if !listed {
                return false;
            }
        }

        self.metadata
            .iter()
            .all(|(k, v)| chunk_metadata.get(k).and_then(|x| x.as_str()) == Some(v.as_str()))
    }
}

/// Coarse relevance bucket shown next to each result.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Relevance {
    High,
    Medium,
    Low,
}

impl Relevance {
    pub fn from_score(score: f64) -> Self {
        if score >= 0.85 {
            Relevance::High
        } else if score >= 0.75 {
            Relevance::Medium
        } else {
            Relevance::Low
        }
    }
}

/// A single ranked search hit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResultItem {
    pub chunk_id: String,
    pub document_id: String,
    pub ordinal: i64,
    /// Similarity in `[0.0, 1.0]`; higher is closer.
    pub score: f64,
    pub relevance: Relevance,
    /// Bounded excerpt of the chunk text.
    pub snippet: String,
    pub document_title: Option<String>,
    pub category: Option<String>,
    /// Human-readable source label (chunk `source` metadata or document title).
    pub source: Option<String>,
}

/// The outcome of a successful query.
///
/// An empty `items` list means "no relevant chunks", never "search failed";
/// failures are reported as errors.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueryResult {
    pub query: String,
    pub items: Vec<ResultItem>,
    /// Distinct source labels of `items`, in rank order.
    pub sources: Vec<String>,
    pub total_results: usize,
    pub from_cache: bool,
    pub took_ms: u64,
}

/// Distinct sources of a ranked list, preserving first-seen order.
pub fn unique_sources(items: &[ResultItem]) -> Vec<String> {
    let mut out: Vec<String> = Vec::new();
    for source in items.iter().filter_map(|i| i.source.as_ref()) {
        if !out.iter().any(|s| s == source) {
            out.push(source.clone());
        }
    }
    out
}
