//! Ranking stage between the index and the synthesizer.
//!
//! Fetches a candidate pool larger than `top_k`, maps L2 distance to a
//! relevance score `1 / (1 + d)`, drops everything under `min_score` (an
//! empty result is an answer, not an error), then reranks the survivors by
//! a blend of the semantic score and the query's lexical overlap with the
//! chunk. The blend reorders; the reported score stays the semantic one,
//! which is what `min_score` is documented against.

use std::collections::HashSet;

use crate::config::RetrievalConfig;
use crate::index::{IndexError, ScoredEntry, VectorIndex};
use crate::models::IndexEntry;

pub const SNIPPET_CHARS: usize = 240;

#[derive(Debug, Clone)]
pub struct RetrievedPassage {
    pub entry: IndexEntry,
    /// Semantic relevance in (0, 1], from the L2 distance.
    pub score: f32,
    /// Ordering score after the lexical blend.
    pub blended: f32,
}

pub fn retrieve(
    index: &VectorIndex,
    query_vector: &[f32],
    query_text: &str,
    params: &RetrievalConfig,
) -> Result<Vec<RetrievedPassage>, IndexError> {
    let pool = params
        .top_k
        .saturating_mul(params.rerank_pool_factor)
        .max(params.top_k);
    let hits = index.search(query_vector, pool)?;
    Ok(rank(hits, query_text, params))
}

/// Score, filter, rerank, truncate. Sorting is stable with an explicit
/// slot tiebreak, so equal blends keep insertion order.
pub fn rank(
    hits: Vec<ScoredEntry>,
    query_text: &str,
    params: &RetrievalConfig,
) -> Vec<RetrievedPassage> {
    let query_tokens = tokens(query_text);
    let mut passages: Vec<RetrievedPassage> = hits
        .into_iter()
        .map(|hit| {
            let score = relevance(hit.distance);
            let overlap = overlap_with(&query_tokens, &hit.entry.text);
            RetrievedPassage {
                blended: params.rerank_alpha * score + (1.0 - params.rerank_alpha) * overlap,
                score,
                entry: hit.entry,
            }
        })
        .filter(|p| p.score >= params.min_score)
        .collect();

    passages.sort_by(|a, b| {
        b.blended
            .partial_cmp(&a.blended)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then(a.entry.slot.cmp(&b.entry.slot))
    });
    passages.truncate(params.top_k);
    passages
}

pub fn relevance(distance: f32) -> f32 {
    1.0 / (1.0 + distance.max(0.0))
}

/// Fraction of the query's tokens that appear in the text.
pub fn lexical_overlap(query: &str, text: &str) -> f32 {
    overlap_with(&tokens(query), text)
}

fn overlap_with(query_tokens: &HashSet<String>, text: &str) -> f32 {
    if query_tokens.is_empty() {
        return 0.0;
    }
    let text_tokens = tokens(text);
    let shared = query_tokens.intersection(&text_tokens).count();
    shared as f32 / query_tokens.len() as f32
}

fn tokens(text: &str) -> HashSet<String> {
    text.split(|c: char| !c.is_alphanumeric())
        .filter(|w| !w.is_empty())
        .map(|w| w.to_lowercase())
        .collect()
}

/// Display excerpt, truncated on a char boundary.
pub fn snippet(text: &str, max_chars: usize) -> String {
    let flat = text.split_whitespace().collect::<Vec<_>>().join(" ");
    if flat.chars().count() <= max_chars {
        return flat;
    }
    let mut cut: String = flat.chars().take(max_chars).collect();
    cut.push_str("...");
    cut
}
