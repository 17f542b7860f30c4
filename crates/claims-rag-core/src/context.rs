//! Prompt-side helpers for the chat pipeline.
//!
//! Formats ranked results into an LLM context block and citation lines, and
//! derives lightweight hints (state, claim scenario) from the raw query.

use crate::models::ResultItem;

/// Render results as a numbered knowledge-base context block.
///
/// Returns an empty string when there is nothing to inject, so callers can
/// proceed without retrieved context.
pub fn format_context_for_prompt(items: &[ResultItem]) -> String {
    if items.is_empty() {
        return String::new();
    }

    let mut out = String::from(
        "## Retrieved Knowledge Base Context\n\n\
         The following information was retrieved from our knowledge base to help answer the question:\n",
    );

    for (i, item) in items.iter().enumerate() {
        let label = item.source.as_deref().unwrap_or("Unknown");
        out.push_str(&format!("\n**[{}]** {}", i + 1, label));
        if let Some(category) = &item.category {
            out.push_str(&format!(" ({})", category_label(category)));
        }
        out.push_str(&format!(" - Relevance: {:.1}%\n", item.score * 100.0));
        out.push_str(&item.snippet);
        out.push_str("\n---\n");
    }

    out
}

/// One citation line per result: `[n] source (category) - Score: 87.5%`.
pub fn citations(items: &[ResultItem]) -> Vec<String> {
    items
        .iter()
        .enumerate()
        .map(|(i, item)| {
            let label = item.source.as_deref().unwrap_or("Unknown");
            match &item.category {
                Some(c) => format!(
                    "[{}] {} ({}) - Score: {:.1}%",
                    i + 1,
                    label,
                    c.replace('_', " "),
                    item.score * 100.0
                ),
                None => format!("[{}] {} - Score: {:.1}%", i + 1, label, item.score * 100.0),
            }
        })
        .collect()
}

fn category_label(category: &str) -> String {
    category.replace('_', " ").to_uppercase()
}

fn words(query: &str) -> Vec<String> {
    query
        .split(|c: char| !c.is_alphanumeric())
        .filter(|w| !w.is_empty())
        .map(|w| w.to_lowercase())
        .collect()
}

fn contains_phrase(words: &[String], phrase: &str) -> bool {
    let target: Vec<&str> = phrase.split(' ').collect();
    words
        .windows(target.len())
        .any(|w| w.iter().zip(&target).all(|(a, b)| a == b))
}

/// Service-area states, checked in this order.
const STATES: &[(&str, &[&str])] = &[
    ("VA", &["va", "virginia"]),
    ("MD", &["md", "maryland"]),
    ("PA", &["pa", "pennsylvania"]),
    ("NJ", &["nj", "new jersey"]),
    ("DE", &["de", "delaware"]),
];

/// Two-letter state code mentioned in the query, if any.
pub fn extract_state(query: &str) -> Option<&'static str> {
    let words = words(query);
    STATES
        .iter()
        .find(|(_, names)| names.iter().any(|n| contains_phrase(&words, n)))
        .map(|(code, _)| *code)
}

const SCENARIOS: &[(&str, &[&str])] = &[
    ("partial_replacement", &["partial", "half", "section"]),
    ("full_denial", &["denial", "denied", "rejected"]),
    ("matching_dispute", &["matching", "match"]),
    ("double_layer", &["double layer", "two layer", "overlay", "second layer"]),
    ("low_slope", &["low slope", "flat roof", "low pitch", "2:12"]),
    ("creased_shingles", &["creased", "crease", "shipping damage"]),
    ("discontinued_shingles", &["discontinued", "no longer available", "obsolete"]),
];

/// Claim scenario the query is about, if recognizable.
pub fn extract_scenario(query: &str) -> Option<&'static str> {
    let lower = query.to_lowercase();
    SCENARIOS
        .iter()
        .find(|(_, keywords)| keywords.iter().any(|k| lower.contains(k)))
        .map(|(name, _)| *name)
}

const RAG_KEYWORDS: &[&str] = &[
    "code", "irc", "ibc", "building code", "gaf", "warranty", "manufacturer", "template",
    "email", "letter", "argument", "pushback", "denial", "shingle", "roof", "replacement",
    "insurance", "adjuster", "claim", "what", "how", "why", "when", "where",
];

/// Whether the query is likely to benefit from knowledge-base retrieval.
pub fn should_use_rag(query: &str) -> bool {
    let lower = query.to_lowercase();
    RAG_KEYWORDS.iter().any(|k| lower.contains(k))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Relevance;

    fn item(source: &str, category: Option<&str>, score: f64) -> ResultItem {
        ResultItem {
            chunk_id: "c".into(),
            document_id: "d".into(),
            ordinal: 0,
            score,
            relevance: Relevance::from_score(score),
            snippet: "Drip edge is required at eaves.".into(),
            document_title: None,
            category: category.map(String::from),
            source: Some(source.into()),
        }
    }

    #[test]
    fn test_empty_context_is_empty_string() {
        assert_eq!(format_context_for_prompt(&[]), "");
    }

    #[test]
    fn test_context_block_numbers_results() {
        let ctx = format_context_for_prompt(&[
            item("IRC R905.2.8.5", Some("building_codes"), 0.912),
            item("GAF Guide", None, 0.8),
        ]);
        assert!(ctx.contains("**[1]** IRC R905.2.8.5 (BUILDING CODES) - Relevance: 91.2%"));
        assert!(ctx.contains("**[2]** GAF Guide - Relevance: 80.0%"));
        assert!(ctx.contains("Drip edge is required at eaves."));
    }

    #[test]
    fn test_citations() {
        let c = citations(&[item("IRC", Some("building_codes"), 0.875)]);
        assert_eq!(c, vec!["[1] IRC (building codes) - Score: 87.5%".to_string()]);
    }

    #[test]
    fn test_extract_state() {
        assert_eq!(extract_state("code requirements in Virginia"), Some("VA"));
        assert_eq!(extract_state("what does MD require?"), Some("MD"));
        assert_eq!(extract_state("claims in new jersey"), Some("NJ"));
        assert_eq!(extract_state("shingle warranty"), None);
        // Substrings of other words are not states.
        assert_eq!(extract_state("update the paperwork"), None);
    }

    #[test]
    fn test_extract_scenario() {
        assert_eq!(extract_scenario("They DENIED the claim"), Some("full_denial"));
        assert_eq!(extract_scenario("color match issue"), Some("matching_dispute"));
        assert_eq!(extract_scenario("low slope roof"), Some("low_slope"));
        assert_eq!(extract_scenario("hello"), None);
    }

    #[test]
    fn test_should_use_rag() {
        assert!(should_use_rag("What is the IRC drip edge rule?"));
        assert!(!should_use_rag("thanks!"));
    }
}
