//! Staged, content-addressed embedding pipeline.
//!
//! Generates one vector per chunk per model while deduplicating work both
//! across files within a snapshot and across snapshots (renamed or
//! unchanged code re-embeds for free). Stages:
//!
//! 1. **Init** — claim the single-writer slot, recreate staging.
//! 2. **Stage** — for every chunk lacking a vector, build the prompt and
//!    its SHA-256 (`vector_hash`), bulk-load into staging.
//! 3. **Backfill** — copy vectors whose `vector_hash` already exists in
//!    the permanent table. On stable codebases this typically recovers
//!    well over half the rows.
//! 4. **Delta** — batch the remaining rows through the provider under a
//!    concurrency semaphore; a failed batch marks its rows errored and
//!    the run continues.
//! 5. **Promote** — upsert finished rows into `node_embeddings` on
//!    `(chunk, model)` and truncate staging.
//!
//! Progress is reported as a lazy sequence of [`EmbedEvent`]s over an
//! unbounded channel; dropping the receiver just discards progress.

pub mod provider;

pub use provider::{create_provider, EmbeddingProvider, MockProvider, OpenAiProvider};

use anyhow::Result;
use sha2::{Digest, Sha256};
use std::sync::Arc;
use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver, UnboundedSender};
use tokio::sync::Semaphore;
use tokio::task::JoinSet;

use crate::store::staging::{EmbeddableChunk, StagedRow};
use crate::store::GraphStore;

/// Status events emitted while the pipeline runs.
#[derive(Debug, Clone, PartialEq)]
pub enum EmbedEvent {
    Init,
    StagingProgress { staged: u64 },
    Deduplicating,
    DedupStats { reused: u64 },
    EmbeddingProgress { processed: u64, total: u64 },
    BatchFailed { count: u64 },
    Completed { newly_embedded: u64, reused: u64, failed: u64 },
}

/// Final report returned by [`EmbeddingPipeline::run`].
#[derive(Debug, Clone, Default, PartialEq, serde::Serialize)]
pub struct EmbedReport {
    pub staged: u64,
    pub newly_embedded: u64,
    /// Vectors recovered without a provider call: backfilled from history
    /// plus chunks that already carried one.
    pub reused: u64,
    pub failed: u64,
}

pub struct EmbeddingPipeline {
    store: GraphStore,
    provider: Arc<dyn EmbeddingProvider>,
}

impl EmbeddingPipeline {
    pub fn new(store: GraphStore, provider: Arc<dyn EmbeddingProvider>) -> Self {
        Self { store, provider }
    }

    /// Run the pipeline with progress events on the returned receiver.
    pub fn spawn(
        self: Arc<Self>,
        snapshot_id: String,
        batch_size: usize,
    ) -> (
        UnboundedReceiver<EmbedEvent>,
        tokio::task::JoinHandle<Result<EmbedReport>>,
    ) {
        let (tx, rx) = unbounded_channel();
        let handle = tokio::spawn(async move { self.run(&snapshot_id, batch_size, Some(tx)).await });
        (rx, handle)
    }

    /// Run the pipeline to completion.
    pub async fn run(
        &self,
        snapshot_id: &str,
        batch_size: usize,
        events: Option<UnboundedSender<EmbedEvent>>,
    ) -> Result<EmbedReport> {
        let model = self.provider.model_name().to_string();

        if !self.store.try_begin_embedding_run(snapshot_id, &model).await? {
            return Err(crate::error::StoreError::conflict(format!(
                "embedding run already in progress for snapshot {snapshot_id}"
            ))
            .into());
        }

        let result = self.run_inner(snapshot_id, batch_size, &model, &events).await;
        self.store.finish_embedding_run(snapshot_id).await?;
        result
    }

    async fn run_inner(
        &self,
        snapshot_id: &str,
        batch_size: usize,
        model: &str,
        events: &Option<UnboundedSender<EmbedEvent>>,
    ) -> Result<EmbedReport> {
        let emit = |event: EmbedEvent| {
            if let Some(tx) = events {
                let _ = tx.send(event);
            }
        };

        emit(EmbedEvent::Init);
        self.store.prepare_staging().await?;

        let (_, already_embedded) = self
            .store
            .count_embedding_coverage(snapshot_id, model)
            .await?;

        // Stage: page through unembedded chunks, hash prompts, bulk-load.
        let mut staged: u64 = 0;
        let page = (batch_size.max(1)) as i64;
        let mut offset: i64 = 0;
        loop {
            let chunks = self
                .store
                .fetch_unembedded_chunks(snapshot_id, model, page, offset)
                .await?;
            if chunks.is_empty() {
                break;
            }
            offset += chunks.len() as i64;

            let rows: Vec<StagedRow> = chunks
                .iter()
                .map(|chunk| {
                    let prompt = build_prompt(chunk);
                    let vector_hash = prompt_hash(&prompt);
                    StagedRow {
                        chunk_id: chunk.chunk_id.clone(),
                        snapshot_id: snapshot_id.to_string(),
                        file_id: chunk.file_id.clone(),
                        vector_hash,
                        prompt,
                    }
                })
                .collect();
            self.store.bulk_load_staging(&rows, model).await?;
            staged += rows.len() as u64;
            emit(EmbedEvent::StagingProgress { staged });
        }

        // Backfill from history by prompt hash.
        emit(EmbedEvent::Deduplicating);
        let recovered = self.store.copy_cached_vectors(snapshot_id, model).await?;
        emit(EmbedEvent::DedupStats { reused: recovered });

        // Delta: everything still missing a vector goes to the provider.
        let mut delta: Vec<StagedRow> = Vec::new();
        let mut delta_offset = 0i64;
        loop {
            let batch = self
                .store
                .fetch_staging_delta(snapshot_id, page, delta_offset)
                .await?;
            if batch.is_empty() {
                break;
            }
            delta_offset += batch.len() as i64;
            delta.extend(batch);
        }
        let total_delta = delta.len() as u64;

        let mut newly_embedded: u64 = 0;
        let mut failed: u64 = 0;
        if !delta.is_empty() {
            let semaphore = Arc::new(Semaphore::new(self.provider.max_concurrency().max(1)));
            let mut tasks: JoinSet<(Vec<String>, Result<Vec<(String, Vec<u8>)>>)> = JoinSet::new();

            for batch in delta.chunks(batch_size.max(1)) {
                let batch: Vec<StagedRow> = batch.to_vec();
                let provider = Arc::clone(&self.provider);
                let semaphore = Arc::clone(&semaphore);
                tasks.spawn(async move {
                    let _permit = semaphore.acquire_owned().await.expect("semaphore closed");
                    let ids: Vec<String> = batch.iter().map(|r| r.chunk_id.clone()).collect();
                    let prompts: Vec<String> = batch.iter().map(|r| r.prompt.clone()).collect();
                    match provider.embed(&prompts).await {
                        Ok(vectors) => {
                            let rows = batch
                                .iter()
                                .zip(vectors.iter())
                                .map(|(row, vector)| {
                                    let normalized = cosine_normalize(vector);
                                    (row.chunk_id.clone(), vec_to_blob(&normalized))
                                })
                                .collect();
                            (ids, Ok(rows))
                        }
                        Err(e) => (ids, Err(e)),
                    }
                });
            }

            let mut processed: u64 = 0;
            while let Some(joined) = tasks.join_next().await {
                let (ids, outcome) = joined?;
                match outcome {
                    Ok(rows) => {
                        self.store.write_vectors(&rows, model).await?;
                        processed += rows.len() as u64;
                        newly_embedded += rows.len() as u64;
                        emit(EmbedEvent::EmbeddingProgress {
                            processed,
                            total: total_delta,
                        });
                    }
                    Err(e) => {
                        tracing::warn!(error = %e, count = ids.len(), "embedding batch failed");
                        self.store.mark_staging_errored(&ids, model).await?;
                        failed += ids.len() as u64;
                        emit(EmbedEvent::BatchFailed { count: ids.len() as u64 });
                    }
                }
            }
        }

        let promoted = self.store.promote_staging(snapshot_id).await?;
        tracing::info!(promoted, "staging promoted");

        // `reused` counts everything that cost no provider call: history
        // backfills plus chunks that already had a vector for this model.
        let reused = recovered + already_embedded as u64;
        let report = EmbedReport {
            staged,
            newly_embedded,
            reused,
            failed,
        };
        emit(EmbedEvent::Completed {
            newly_embedded: report.newly_embedded,
            reused: report.reused,
            failed: report.failed,
        });
        Ok(report)
    }
}

/// The stable prompt template. Any change here invalidates the embedding
/// cache — which is the point, since `vector_hash` is the cache key.
pub fn build_prompt(chunk: &EmbeddableChunk) -> String {
    let mut parts = vec![
        "[CONTEXT]".to_string(),
        format!("File: {}", chunk.file_path),
        format!("Language: {}", chunk.language),
        format!("Category: {}", chunk.category),
    ];

    let roles: Vec<&str> = chunk
        .metadata
        .semantic_matches
        .iter()
        .filter(|m| m.category == "role")
        .map(|m| m.label.as_str())
        .collect();
    let others: Vec<&str> = chunk
        .metadata
        .semantic_matches
        .iter()
        .filter(|m| m.category != "role" && m.category != "type")
        .map(|m| m.label.as_str())
        .collect();

    if !roles.is_empty() {
        parts.push(format!("Role: {}", roles.join(", ")));
    }
    if !others.is_empty() {
        parts.push(format!("Tags: {}", others.join(", ")));
    }
    if !chunk.incoming_symbols.is_empty() {
        parts.push(format!("Defines: {}", chunk.incoming_symbols.join(", ")));
    }

    parts.push(format!("\n[CODE]\n{}", chunk.content));
    parts.join("\n")
}

/// SHA-256 of the exact provider input; the cache key across files and
/// snapshots.
pub fn prompt_hash(prompt: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(prompt.as_bytes());
    format!("{:x}", hasher.finalize())
}

/// Encode a float vector as a little-endian f32 BLOB.
pub fn vec_to_blob(vector: &[f32]) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(vector.len() * 4);
    for v in vector {
        bytes.extend_from_slice(&v.to_le_bytes());
    }
    bytes
}

/// Decode a BLOB back into a float vector.
pub fn blob_to_vec(blob: &[u8]) -> Vec<f32> {
    blob.chunks_exact(4)
        .map(|chunk| f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
        .collect()
}

/// Scale a vector to unit length. Zero vectors pass through unchanged.
pub fn cosine_normalize(vector: &[f32]) -> Vec<f32> {
    let norm: f32 = vector.iter().map(|v| v * v).sum::<f32>().sqrt();
    if norm < f32::EPSILON {
        return vector.to_vec();
    }
    vector.iter().map(|v| v / norm).collect()
}

/// Cosine similarity in `[-1, 1]`; 0.0 for mismatched or empty inputs.
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

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{ChunkMetadata, SemanticMatch};

    fn chunk(content: &str, symbols: Vec<String>) -> EmbeddableChunk {
        EmbeddableChunk {
            chunk_id: "c1".into(),
            file_id: "f1".into(),
            file_path: "src/app.py".into(),
            language: "python".into(),
            category: "source".into(),
            metadata: ChunkMetadata {
                semantic_matches: vec![SemanticMatch {
                    category: "role".into(),
                    value: "api_endpoint".into(),
                    label: "API Route Handler".into(),
                }],
                ..Default::default()
            },
            content: content.into(),
            incoming_symbols: symbols,
        }
    }

    #[test]
    fn test_prompt_template_shape() {
        let prompt = build_prompt(&chunk("def handler(): pass", vec!["handler".into()]));
        assert!(prompt.starts_with("[CONTEXT]\nFile: src/app.py\nLanguage: python\nCategory: source"));
        assert!(prompt.contains("Role: API Route Handler"));
        assert!(prompt.contains("Defines: handler"));
        assert!(prompt.contains("\n[CODE]\ndef handler(): pass"));
    }

    #[test]
    fn test_prompt_hash_is_stable_and_sensitive() {
        let a = build_prompt(&chunk("x = 1", vec![]));
        let b = build_prompt(&chunk("x = 1", vec![]));
        let c = build_prompt(&chunk("x = 2", vec![]));
        assert_eq!(prompt_hash(&a), prompt_hash(&b));
        assert_ne!(prompt_hash(&a), prompt_hash(&c));
    }

    #[test]
    fn test_blob_roundtrip() {
        let vector = vec![1.0f32, -2.5, 3.125, 0.0];
        assert_eq!(blob_to_vec(&vec_to_blob(&vector)), vector);
    }

    #[test]
    fn test_cosine_normalize_unit_length() {
        let v = cosine_normalize(&[3.0, 4.0]);
        let norm: f32 = v.iter().map(|x| x * x).sum::<f32>().sqrt();
        assert!((norm - 1.0).abs() < 1e-6);
        assert_eq!(cosine_normalize(&[0.0, 0.0]), vec![0.0, 0.0]);
    }

    #[test]
    fn test_cosine_similarity() {
        assert!((cosine_similarity(&[1.0, 0.0], &[1.0, 0.0]) - 1.0).abs() < 1e-6);
        assert!(cosine_similarity(&[1.0, 0.0], &[0.0, 1.0]).abs() < 1e-6);
        assert!((cosine_similarity(&[1.0, 0.0], &[-1.0, 0.0]) + 1.0).abs() < 1e-6);
        assert_eq!(cosine_similarity(&[1.0], &[1.0, 2.0]), 0.0);
        assert_eq!(cosine_similarity(&[], &[]), 0.0);
    }
}
