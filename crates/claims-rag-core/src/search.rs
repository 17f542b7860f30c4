//! Similarity ranking engine.
//!
//! Turns raw nearest-neighbor hits from a [`ChunkStore`](crate::store::ChunkStore)
//! into ranked [`ResultItem`]s. Operates purely on in-memory data with no
//! store or configuration dependencies.
//!
//! # Ranking Algorithm
//!
//! 1. Convert each distance to a similarity with the store metric's transform.
//! 2. Drop hits below `min_score`.
//! 3. Sort by score (desc), ordinal (asc), chunk id (asc).
//! 4. Keep at most `max_chunks_per_doc` hits per document.
//! 5. Truncate to `top_k` and build snippets.

use std::collections::HashMap;

use crate::models::{DistanceMetric, Relevance, ResultItem};
use crate::store::Neighbor;

/// Ranking tuning parameters, decoupled from application config.
#[derive(Debug, Clone, PartialEq)]
pub struct RankParams {
    pub metric: DistanceMetric,
    /// Minimum similarity to keep, in `[0.0, 1.0]`.
    pub min_score: f64,
    /// Maximum results to return.
    pub top_k: usize,
    /// Results allowed per document; `1` deduplicates by document.
    pub max_chunks_per_doc: usize,
    /// Snippet length in characters.
    pub snippet_chars: usize,
}

impl Default for RankParams {
    fn default() -> Self {
        Self {
            metric: DistanceMetric::Cosine,
            min_score: 0.7,
            top_k: 5,
            max_chunks_per_doc: 1,
            snippet_chars: 300,
        }
    }
}

/// Rank raw neighbors into result items.
///
/// The output is ordered by non-increasing score, holds at most
/// `params.top_k` items, and every score is `>= params.min_score`.
/// Equal scores are broken by the earlier chunk position in its document.
pub fn rank(neighbors: Vec<Neighbor>, params: &RankParams) -> Vec<ResultItem> {
    if params.top_k == 0 {
        return Vec::new();
    }

    let mut scored: Vec<(f64, Neighbor)> = neighbors
        .into_iter()
        .map(|n| (params.metric.similarity(n.distance), n))
        .filter(|(score, _)| *score >= params.min_score)
        .collect();

    scored.sort_by(|(sa, a), (sb, b)| {
        sb.partial_cmp(sa)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then(a.ordinal.cmp(&b.ordinal))
            .then_with(|| a.chunk_id.cmp(&b.chunk_id))
    });

    let per_doc_cap = params.max_chunks_per_doc.max(1);
    let mut per_doc: HashMap<String, usize> = HashMap::new();
    let mut results: Vec<ResultItem> = Vec::with_capacity(params.top_k);

    for (score, n) in scored {
        if results.len() >= params.top_k {
            break;
        }
        let seen = per_doc.entry(n.document_id.clone()).or_insert(0);
        if *seen >= per_doc_cap {
            continue;
        }
        *seen += 1;

        let source = n
            .chunk_metadata
            .get("source")
            .and_then(|s| s.as_str())
            .map(String::from)
            .or_else(|| n.document_title.clone());

        results.push(ResultItem {
            snippet: make_snippet(&n.text, params.snippet_chars),
            chunk_id: n.chunk_id,
            document_id: n.document_id,
            ordinal: n.ordinal,
            score,
            relevance: Relevance::from_score(score),
            document_title: n.document_title,
            category: n.category,
            source,
        });
    }

    results
}

/// Bounded excerpt of `text`.
///
/// Cuts at `max_chars` characters, backing off to the last whitespace when
/// one exists in the second half of the window, and appends `…` when cut.
pub fn make_snippet(text: &str, max_chars: usize) -> String {
    let text = text.trim();
    if text.chars().count() <= max_chars {
        return text.to_string();
    }

    let cut = text
        .char_indices()
        .nth(max_chars)
        .map(|(idx, _)| idx)
        .unwrap_or(text.len());
    let window = &text[..cut];

    let trimmed = match window.rfind(char::is_whitespace) {
        Some(pos) if pos >= window.len() / 2 => &window[..pos],
        _ => window,
    };

    format!("{}…", trimmed.trim_end())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn neighbor(chunk_id: &str, doc_id: &str, ordinal: i64, distance: f64) -> Neighbor {
        Neighbor {
            chunk_id: chunk_id.to_string(),
            document_id: doc_id.to_string(),
            ordinal,
            distance,
            text: format!("text {}", chunk_id),
            document_title: Some(format!("doc {}", doc_id)),
            category: None,
            document_metadata: json!({}),
            chunk_metadata: json!({}),
        }
    }

    fn params(top_k: usize, min_score: f64) -> RankParams {
        RankParams {
            top_k,
            min_score,
            ..RankParams::default()
        }
    }

    #[test]
    fn test_threshold_drops_low_scores() {
        let hits = vec![neighbor("c1", "d1", 0, 0.1), neighbor("c2", "d2", 0, 0.5)];
        let ranked = rank(hits, &params(5, 0.7));
        assert_eq!(ranked.len(), 1);
        assert_eq!(ranked[0].chunk_id, "c1");
        assert!((ranked[0].score - 0.9).abs() < 1e-9);
    }

    #[test]
    fn test_dedup_keeps_best_chunk_per_document() {
        let hits = vec![
            neighbor("c1", "d1", 0, 0.05),
            neighbor("c2", "d1", 1, 0.02),
            neighbor("c3", "d2", 0, 0.1),
        ];
        let ranked = rank(hits, &params(5, 0.0));
        let ids: Vec<&str> = ranked.iter().map(|r| r.chunk_id.as_str()).collect();
        assert_eq!(ids, vec!["c2", "c3"]);
    }

    #[test]
    fn test_multiple_chunks_per_document_when_allowed() {
        let hits = vec![
            neighbor("c1", "d1", 0, 0.05),
            neighbor("c2", "d1", 1, 0.02),
            neighbor("c3", "d1", 2, 0.03),
            neighbor("c4", "d2", 0, 0.1),
        ];
        let p = RankParams {
            max_chunks_per_doc: 2,
            ..params(5, 0.0)
        };
        let ranked = rank(hits, &p);
        let ids: Vec<&str> = ranked.iter().map(|r| r.chunk_id.as_str()).collect();
        assert_eq!(ids, vec!["c2", "c3", "c4"]);
    }

    #[test]
    fn test_tie_break_prefers_earlier_ordinal() {
        let hits = vec![
            neighbor("b", "d1", 4, 0.2),
            neighbor("a", "d2", 1, 0.2),
            neighbor("c", "d3", 1, 0.2),
        ];
        let ranked = rank(hits.clone(), &params(5, 0.0));
        let ids: Vec<&str> = ranked.iter().map(|r| r.chunk_id.as_str()).collect();
        assert_eq!(ids, vec!["a", "c", "b"]);

        // Input order must not matter.
        let mut reversed = hits;
        reversed.reverse();
        let again = rank(reversed, &params(5, 0.0));
        assert_eq!(ranked, again);
    }

    #[test]
    fn test_bounded_by_top_k_and_non_increasing() {
        let hits: Vec<Neighbor> = (0..20)
            .map(|i| neighbor(&format!("c{}", i), &format!("d{}", i), 0, (i as f64) * 0.01))
            .collect();
        let ranked = rank(hits, &params(7, 0.5));
        assert_eq!(ranked.len(), 7);
        for pair in ranked.windows(2) {
            assert!(pair[0].score >= pair[1].score);
        }
        assert!(ranked.iter().all(|r| r.score >= 0.5));
    }

    #[test]
    fn test_zero_top_k_is_empty() {
        let ranked = rank(vec![neighbor("c1", "d1", 0, 0.0)], &params(0, 0.0));
        assert!(ranked.is_empty());
    }

    #[test]
    fn test_source_prefers_chunk_metadata() {
        let mut n = neighbor("c1", "d1", 0, 0.0);
        n.chunk_metadata = json!({"source": "GAF Warranty Guide"});
        let ranked = rank(vec![n, neighbor("c2", "d2", 0, 0.0)], &params(5, 0.0));
        assert_eq!(ranked[0].source.as_deref(), Some("GAF Warranty Guide"));
        assert_eq!(ranked[1].source.as_deref(), Some("doc d2"));
    }

    #[test]
    fn test_relevance_assigned() {
        let ranked = rank(vec![neighbor("c1", "d1", 0, 0.1)], &params(5, 0.0));
        assert_eq!(ranked[0].relevance, Relevance::High);
    }

    #[test]
    fn test_snippet_short_text_untouched() {
        assert_eq!(make_snippet("  short text ", 50), "short text");
    }

    #[test]
    fn test_snippet_cuts_on_whitespace() {
        let s = make_snippet("drip edge is required at eaves and rakes", 20);
        assert_eq!(s, "drip edge is…");
        assert!(s.chars().count() <= 21);
    }

    #[test]
    fn test_snippet_hard_cut_without_whitespace() {
        let s = make_snippet("abcdefghijklmnopqrstuvwxyz", 10);
        assert_eq!(s, "abcdefghij…");
    }
}
