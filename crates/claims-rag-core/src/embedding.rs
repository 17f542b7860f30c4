//! Embedding provider trait and vector utilities.
//!
//! Defines the [`EmbeddingProvider`] trait that all embedding backends
//! implement, plus pure helpers for pgvector text literals, query
//! truncation, and similarity computation.
//!
//! Concrete HTTP providers (OpenAI, Ollama) and the concurrency limiter
//! live in the `claims-rag` app crate.

use async_trait::async_trait;

use crate::error::EmbeddingError;

/// Trait for embedding providers.
///
/// `embed` turns one piece of text into a vector of exactly [`dims`](Self::dims)
/// elements. Implementations do not cache; caching is the orchestrator's job.
#[async_trait]
pub trait EmbeddingProvider: Send + Sync {
    /// Returns the model identifier (e.g. `"text-embedding-3-small"`).
    fn model_name(&self) -> &str;
    /// Returns the embedding vector dimensionality (e.g. `1536`).
    fn dims(&self) -> usize;
    /// Embed a single text.
    async fn embed(&self, text: &str) -> Result<Vec<f32>, EmbeddingError>;
}

/// Truncate `text` to at most `max_chars` characters, on a char boundary.
pub fn truncate_chars(text: &str, max_chars: usize) -> &str {
    match text.char_indices().nth(max_chars) {
        Some((idx, _)) => &text[..idx],
        None => text,
    }
}

/// Encode a vector as a pgvector text literal (`[1,-2.5,3]`).
///
/// The literal is always sent as a bound parameter and cast with
/// `::vector` on the server side.
///
/// # Example
///
/// ```rust
/// use claims_rag_core::embedding::{vector_literal, parse_vector_literal};
///
/// let v = vec![1.0f32, -2.5, 3.125];
/// let lit = vector_literal(&v);
/// assert_eq!(lit, "[1,-2.5,3.125]");
/// assert_eq!(parse_vector_literal(&lit).unwrap(), v);
/// ```
pub fn vector_literal(vec: &[f32]) -> String {
    let mut out = String::with_capacity(vec.len() * 10 + 2);
    out.push('[');
    for (i, v) in vec.iter().enumerate() {
        if i > 0 {
            out.push(',');
        }
        out.push_str(&v.to_string());
    }
    out.push(']');
    out
}

/// Decode a pgvector text literal back into a vector.
///
/// Returns `None` if the text is not a bracketed, comma-separated list of
/// finite floats.
pub fn parse_vector_literal(text: &str) -> Option<Vec<f32>> {
    let inner = text.trim().strip_prefix('[')?.strip_suffix(']')?;
    if inner.trim().is_empty() {
        return Some(Vec::new());
    }
    inner
        .split(',')
        .map(|part| part.trim().parse::<f32>().ok().filter(|v| v.is_finite()))
        .collect()
}

/// Compute cosine similarity between two embedding vectors.
///
/// Returns a value in `[-1.0, 1.0]`:
/// - `1.0` = identical direction
/// - `0.0` = orthogonal (unrelated)
/// - `-1.0` = opposite direction
///
/// Returns `0.0` for empty vectors or vectors of different lengths.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }

    let mut dot = 0.0f32;
    let mut norm_a = 0.0f32;
    let mut norm_b = 0.0f32;

    for (x, y) in a.iter().zip(b.iter()) {
        dot += x * y;
        norm_a += x * x;
        norm_b += y * y;
    }

    let denom = norm_a.sqrt() * norm_b.sqrt();
    if denom < f32::EPSILON {
        return 0.0;
    }

    dot / denom
}

/// Dot product; `0.0` for mismatched lengths.
pub fn inner_product(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() {
        return 0.0;
    }
    a.iter().zip(b.iter()).map(|(x, y)| x * y).sum()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_truncate_ascii() {
        assert_eq!(truncate_chars("hello world", 5), "hello");
        assert_eq!(truncate_chars("hi", 5), "hi");
        assert_eq!(truncate_chars("", 5), "");
    }

    #[test]
    fn test_truncate_multibyte_boundary() {
        let s = "ééééé";
        assert_eq!(truncate_chars(s, 2), "éé");
        assert_eq!(truncate_chars(s, 5), s);
    }

    #[test]
    fn test_vector_literal_empty() {
        assert_eq!(vector_literal(&[]), "[]");
        assert_eq!(parse_vector_literal("[]"), Some(Vec::new()));
    }

    #[test]
    fn test_parse_vector_literal_rejects_garbage() {
        assert_eq!(parse_vector_literal("1,2,3"), None);
        assert_eq!(parse_vector_literal("[1,abc]"), None);
        assert_eq!(parse_vector_literal("[1,NaN]"), None);
        assert_eq!(parse_vector_literal(" [0.5, 1] "), Some(vec![0.5, 1.0]));
    }

    #[test]
    fn test_cosine_identical() {
        let v = vec![1.0, 2.0, 3.0];
        let sim = cosine_similarity(&v, &v);
        assert!((sim - 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_cosine_orthogonal() {
        let a = vec![1.0, 0.0, 0.0];
        let b = vec![0.0, 1.0, 0.0];
        assert!(cosine_similarity(&a, &b).abs() < 1e-6);
    }

    #[test]
    fn test_cosine_opposite() {
        let a = vec![1.0, 0.0];
        let b = vec![-1.0, 0.0];
        assert!((cosine_similarity(&a, &b) + 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_cosine_different_lengths() {
        assert_eq!(cosine_similarity(&[1.0, 2.0], &[1.0]), 0.0);
        assert_eq!(cosine_similarity(&[], &[]), 0.0);
    }

    #[test]
    fn test_inner_product() {
        assert!((inner_product(&[1.0, 2.0], &[3.0, 4.0]) - 11.0).abs() < 1e-6);
        assert_eq!(inner_product(&[1.0], &[1.0, 2.0]), 0.0);
    }
}
