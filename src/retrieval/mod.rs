//! Hybrid retrieval engine.
//!
//! Resolves the target snapshot (pinned or the repository's active one),
//! dispatches vector and keyword searches, fuses with Reciprocal Rank
//! Fusion, and enriches the top hits with one-hop graph context and
//! navigation hints.
//!
//! Keyword-only retrieval requires no embedding provider; the provider is
//! needed only to embed the query for `vector` and `hybrid` strategies.

pub mod fusion;
pub mod walker;

use anyhow::{bail, Result};
use std::collections::HashMap;
use std::str::FromStr;
use std::sync::Arc;

use crate::embedding::{cosine_normalize, EmbeddingProvider};
use crate::models::RetrievedContext;
use crate::store::search::{FilterSet, SearchHit};
use crate::store::GraphStore;
use fusion::{reciprocal_rank_fusion, Candidate};
use walker::GraphWalker;

/// RRF smoothing constant.
const RRF_K: f64 = 60.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Strategy {
    Vector,
    Keyword,
    Hybrid,
}

impl Strategy {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Vector => "vector",
            Self::Keyword => "keyword",
            Self::Hybrid => "hybrid",
        }
    }
}

impl FromStr for Strategy {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "vector" => Ok(Self::Vector),
            "keyword" => Ok(Self::Keyword),
            "hybrid" => Ok(Self::Hybrid),
            other => bail!("unknown strategy '{}': use vector, keyword, or hybrid", other),
        }
    }
}

pub struct CodeRetriever {
    store: GraphStore,
    provider: Option<Arc<dyn EmbeddingProvider>>,
    walker: GraphWalker,
}

impl CodeRetriever {
    pub fn new(store: GraphStore, provider: Option<Arc<dyn EmbeddingProvider>>) -> Self {
        let walker = GraphWalker::new(store.clone());
        Self {
            store,
            provider,
            walker,
        }
    }

    /// Answer a query with ranked, context-enriched chunks.
    pub async fn retrieve(
        &self,
        query: &str,
        repo_id: &str,
        snapshot_id: Option<&str>,
        limit: usize,
        strategy: Strategy,
        filters: &FilterSet,
    ) -> Result<Vec<RetrievedContext>> {
        let target_snapshot = match snapshot_id {
            Some(id) => id.to_string(),
            None => match self.store.active_snapshot_of(repo_id).await? {
                Some(id) => id,
                None => {
                    tracing::warn!(repo = repo_id, "no active snapshot; empty result");
                    return Ok(Vec::new());
                }
            },
        };

        let fetch_limit = (limit * 2).max(1);
        let mut candidates: HashMap<String, Candidate<SearchHit>> = HashMap::new();

        match strategy {
            Strategy::Vector => {
                let hits = self
                    .vector_hits(query, fetch_limit, &target_snapshot, filters)
                    .await?;
                accumulate(&mut candidates, hits, "vector");
            }
            Strategy::Keyword => {
                let hits = self
                    .store
                    .search_fts(query, fetch_limit as i64, &target_snapshot, filters)
                    .await?;
                accumulate(&mut candidates, hits, "keyword");
            }
            Strategy::Hybrid => {
                let (vector_hits, keyword_hits) = tokio::join!(
                    self.vector_hits(query, fetch_limit, &target_snapshot, filters),
                    self.store
                        .search_fts(query, fetch_limit as i64, &target_snapshot, filters),
                );
                accumulate(&mut candidates, vector_hits?, "vector");
                accumulate(&mut candidates, keyword_hits?, "keyword");
            }
        }

        if candidates.is_empty() {
            return Ok(Vec::new());
        }

        let ranked = reciprocal_rank_fusion(candidates, RRF_K);
        let mut results = Vec::with_capacity(limit.min(ranked.len()));
        for (chunk_id, candidate, fused_score) in ranked.into_iter().take(limit) {
            let expanded = self.walker.expand_context(&chunk_id).await?;
            let nav_hints = self.store.get_neighbor_metadata(&chunk_id).await?;

            let retrieval_method = match candidate.ranks.len() {
                0 | 1 => candidate
                    .methods()
                    .first()
                    .copied()
                    .unwrap_or("unknown")
                    .to_string(),
                _ => "hybrid".to_string(),
            };
            let hit = candidate.hit;
            let score = match strategy {
                Strategy::Hybrid => fused_score,
                _ => hit.score,
            };

            results.push(RetrievedContext {
                node_id: chunk_id,
                file_path: hit.file_path,
                content: hit.content,
                semantic_labels: hit.metadata.labels(),
                score,
                retrieval_method,
                start_line: hit.start_line,
                end_line: hit.end_line,
                snapshot_id: target_snapshot.clone(),
                language: hit.language,
                parent_context: expanded.parent_context,
                outgoing_definitions: expanded.outgoing_definitions,
                nav_hints,
            });
        }
        Ok(results)
    }

    async fn vector_hits(
        &self,
        query: &str,
        limit: usize,
        snapshot_id: &str,
        filters: &FilterSet,
    ) -> Result<Vec<SearchHit>> {
        let Some(provider) = &self.provider else {
            bail!("vector search requires an embedding provider");
        };
        let vectors = provider.embed(&[query.to_string()]).await?;
        let query_vector = vectors
            .into_iter()
            .next()
            .ok_or_else(|| anyhow::anyhow!("empty embedding response for query"))?;
        let query_vector = cosine_normalize(&query_vector);
        Ok(self
            .store
            .search_vectors(
                &query_vector,
                limit,
                snapshot_id,
                provider.model_name(),
                filters,
            )
            .await?)
    }
}

fn accumulate(
    candidates: &mut HashMap<String, Candidate<SearchHit>>,
    hits: Vec<SearchHit>,
    method: &'static str,
) {
    for (rank, hit) in hits.into_iter().enumerate() {
        let entry = candidates
            .entry(hit.chunk_id.clone())
            .or_insert_with(|| Candidate::new(hit.clone()));
        entry.ranks.insert(method, rank);
        if method == "vector" {
            entry.vector_similarity = Some(hit.score);
        }
    }
}
