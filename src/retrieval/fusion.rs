//! Reciprocal Rank Fusion.
//!
//! `score(d) = Σ 1 / (k + rank_i(d))` over each ranked list the document
//! appears in, with 1-based ranks and `k = 60`. Documents present in both
//! lists outrank documents of the same depth present in only one.

use std::collections::HashMap;

/// A candidate accumulated from one or more search backends.
#[derive(Debug, Clone)]
pub struct Candidate<T> {
    pub hit: T,
    /// Backend name → 0-based rank in that backend's list.
    pub ranks: HashMap<&'static str, usize>,
    /// Vector similarity, when the vector backend returned this document.
    pub vector_similarity: Option<f64>,
}

impl<T> Candidate<T> {
    pub fn new(hit: T) -> Self {
        Self {
            hit,
            ranks: HashMap::new(),
            vector_similarity: None,
        }
    }

    pub fn methods(&self) -> Vec<&'static str> {
        let mut methods: Vec<&'static str> = self.ranks.keys().copied().collect();
        methods.sort();
        methods
    }
}

/// Fuse candidates by RRF. Ties break on higher vector similarity, then
/// on ascending document id. Returns `(id, candidate, fused_score)` best
/// first.
pub fn reciprocal_rank_fusion<T>(
    candidates: HashMap<String, Candidate<T>>,
    k: f64,
) -> Vec<(String, Candidate<T>, f64)> {
    let mut scored: Vec<(String, Candidate<T>, f64)> = candidates
        .into_iter()
        .map(|(id, candidate)| {
            let score: f64 = candidate
                .ranks
                .values()
                .map(|rank| 1.0 / (k + (*rank as f64) + 1.0))
                .sum();
            (id, candidate, score)
        })
        .collect();

    scored.sort_by(|a, b| {
        b.2.partial_cmp(&a.2)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| {
                let sim_a = a.1.vector_similarity.unwrap_or(f64::NEG_INFINITY);
                let sim_b = b.1.vector_similarity.unwrap_or(f64::NEG_INFINITY);
                sim_b.partial_cmp(&sim_a).unwrap_or(std::cmp::Ordering::Equal)
            })
            .then_with(|| a.0.cmp(&b.0))
    });
    scored
}
