//! Embedding provider abstraction and implementations.
//!
//! The engine consumes providers through [`EmbeddingProvider`]; it never
//! supplies one beyond two concrete variants:
//!
//! - **[`OpenAiProvider`]** — an OpenAI-compatible `POST /embeddings`
//!   client with batching, per-request timeouts, and capped exponential
//!   backoff (1 s base, 10 s cap, 3 attempts).
//! - **[`MockProvider`]** — deterministic vectors derived from a hash of
//!   the text; used by tests and `--mock` runs. Identical text always
//!   maps to the identical vector, which is what cache tests rely on.
//!
//! Vectors are cosine-normalized by the engine before storage, so stored
//! dot products are cosine similarities.

use anyhow::{anyhow, bail, Result};
use async_trait::async_trait;
use sha2::{Digest, Sha256};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use crate::config::EmbeddingConfig;

#[async_trait]
pub trait EmbeddingProvider: Send + Sync {
    /// Embed a batch of texts, one vector per input, in input order.
    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>>;

    /// Vector dimensionality.
    fn dimension(&self) -> usize;

    /// Model identifier; part of the embedding cache key.
    fn model_name(&self) -> &str;

    /// Recommended cap on concurrent provider calls.
    fn max_concurrency(&self) -> usize {
        5
    }
}

/// Instantiate a provider from configuration. `"mock"` selects the
/// deterministic test provider.
pub fn create_provider(config: &EmbeddingConfig) -> Result<Arc<dyn EmbeddingProvider>> {
    match config.provider.as_str() {
        "openai" => Ok(Arc::new(OpenAiProvider::new(config)?)),
        "mock" => Ok(Arc::new(MockProvider::new(config.dimension.min(64).max(8)))),
        other => bail!("Unknown embedding provider: '{}'. Use openai or mock.", other),
    }
}

// ============ OpenAI-compatible Provider ============

pub struct OpenAiProvider {
    model: String,
    dimension: usize,
    api_key: String,
    base_url: String,
    max_concurrency: usize,
    max_retries: u32,
    client: reqwest::Client,
}

impl OpenAiProvider {
    pub fn new(config: &EmbeddingConfig) -> Result<Self> {
        let api_key = config
            .api_key
            .clone()
            .ok_or_else(|| anyhow!("EMBEDDING_API_KEY not set"))?;

        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()?;

        Ok(Self {
            model: config.model.clone(),
            dimension: config.dimension,
            api_key,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            max_concurrency: config.max_concurrency,
            max_retries: config.max_retries,
            client,
        })
    }
}

#[async_trait]
impl EmbeddingProvider for OpenAiProvider {
    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        // The API rejects empty strings and very long inputs.
        let clean: Vec<String> = texts
            .iter()
            .map(|t| {
                let t = t.replace('\n', " ");
                let t = if t.len() > 25_000 { t[..25_000].to_string() } else { t };
                if t.trim().is_empty() {
                    "empty".to_string()
                } else {
                    t
                }
            })
            .collect();

        let body = serde_json::json!({
            "model": self.model,
            "input": clean,
        });

        let mut last_err = None;
        for attempt in 0..=self.max_retries {
            if attempt > 0 {
                // 1s, 2s, 4s, ... capped at 10s.
                let delay = Duration::from_secs((1u64 << (attempt - 1)).min(10));
                tokio::time::sleep(delay).await;
            }

            let resp = self
                .client
                .post(format!("{}/embeddings", self.base_url))
                .header("Authorization", format!("Bearer {}", self.api_key))
                .json(&body)
                .send()
                .await;

            match resp {
                Ok(response) => {
                    let status = response.status();
                    if status.is_success() {
                        let json: serde_json::Value = response.json().await?;
                        return parse_embeddings_response(&json);
                    }
                    // Rate limited or server error: retry.
                    if status.as_u16() == 429 || status.is_server_error() {
                        let text = response.text().await.unwrap_or_default();
                        last_err = Some(anyhow!("embedding API error {}: {}", status, text));
                        continue;
                    }
                    // Other client errors are permanent.
                    let text = response.text().await.unwrap_or_default();
                    bail!("embedding API error {}: {}", status, text);
                }
                Err(e) => {
                    last_err = Some(e.into());
                    continue;
                }
            }
        }

        Err(last_err.unwrap_or_else(|| anyhow!("embedding failed after retries")))
    }

    fn dimension(&self) -> usize {
        self.dimension
    }

    fn model_name(&self) -> &str {
        &self.model
    }

    fn max_concurrency(&self) -> usize {
        self.max_concurrency
    }
}

fn parse_embeddings_response(json: &serde_json::Value) -> Result<Vec<Vec<f32>>> {
    let data = json
        .get("data")
        .and_then(|d| d.as_array())
        .ok_or_else(|| anyhow!("invalid embeddings response: missing data array"))?;

    let mut out = Vec::with_capacity(data.len());
    for item in data {
        let vector = item
            .get("embedding")
            .and_then(|e| e.as_array())
            .ok_or_else(|| anyhow!("invalid embeddings response: missing embedding"))?;
        out.push(
            vector
                .iter()
                .map(|v| v.as_f64().unwrap_or(0.0) as f32)
                .collect(),
        );
    }
    Ok(out)
}

// ============ Deterministic Mock Provider ============

pub struct MockProvider {
    dimension: usize,
    calls: AtomicU64,
}

impl MockProvider {
    pub fn new(dimension: usize) -> Self {
        Self {
            dimension,
            calls: AtomicU64::new(0),
        }
    }

    /// Number of `embed` calls made so far; used by tests to assert cache
    /// behavior.
    pub fn call_count(&self) -> u64 {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl EmbeddingProvider for MockProvider {
    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(texts
            .iter()
            .map(|t| {
                // Stretch the digest across the requested dimension.
                let mut vector = Vec::with_capacity(self.dimension);
                let mut counter = 0u32;
                while vector.len() < self.dimension {
                    let mut hasher = Sha256::new();
                    hasher.update(t.as_bytes());
                    hasher.update(counter.to_le_bytes());
                    let digest = hasher.finalize();
                    for byte in digest.iter() {
                        if vector.len() >= self.dimension {
                            break;
                        }
                        vector.push((*byte as f32 / 127.5) - 1.0);
                    }
                    counter += 1;
                }
                vector
            })
            .collect())
    }

    fn dimension(&self) -> usize {
        self.dimension
    }

    fn model_name(&self) -> &str {
        "mock-deterministic-v1"
    }

    fn max_concurrency(&self) -> usize {
        16
    }
}
