use anyhow::{bail, Result};
use std::path::PathBuf;

/// Application configuration, assembled from environment variables and
/// threaded explicitly through every constructor that needs it.
///
/// Recognized variables:
///
/// | Variable | Meaning | Default |
/// |----------|---------|---------|
/// | `DB_URL` | SQLite database path or `sqlite:` URL | required |
/// | `REPO_VOLUME` | Root directory for bare mirrors and worktrees | `./data/repositories` |
/// | `EMBEDDING_API_KEY` | Credential for the embedding provider | none |
#[derive(Debug, Clone)]
pub struct Config {
    pub db: DbConfig,
    pub volume: VolumeConfig,
    pub indexing: IndexingConfig,
    pub embedding: EmbeddingConfig,
    pub retrieval: RetrievalConfig,
}

#[derive(Debug, Clone)]
pub struct DbConfig {
    pub path: PathBuf,
    pub max_connections: u32,
}

#[derive(Debug, Clone)]
pub struct VolumeConfig {
    /// Root for `<hash(url)>/{mirror.git, worktrees/<snapshot_id>}` trees.
    pub root: PathBuf,
}

#[derive(Debug, Clone)]
pub struct IndexingConfig {
    /// Concurrent parse workers.
    pub workers: usize,
    /// Files handed to one worker task at a time.
    pub files_per_task: usize,
    /// Collector batch size.
    pub collect_batch: usize,
}

#[derive(Debug, Clone)]
pub struct EmbeddingConfig {
    pub provider: String,
    pub model: String,
    pub dimension: usize,
    pub api_key: Option<String>,
    pub base_url: String,
    pub batch_size: usize,
    pub max_concurrency: usize,
    pub timeout_secs: u64,
    pub max_retries: u32,
}

#[derive(Debug, Clone)]
pub struct RetrievalConfig {
    pub final_limit: usize,
    /// RRF smoothing constant.
    pub rrf_k: f64,
}

impl Default for IndexingConfig {
    fn default() -> Self {
        Self {
            workers: 5,
            files_per_task: 50,
            collect_batch: 2000,
        }
    }
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            provider: "openai".to_string(),
            model: "text-embedding-3-small".to_string(),
            dimension: 1536,
            api_key: None,
            base_url: "https://api.openai.com/v1".to_string(),
            batch_size: 200,
            max_concurrency: 5,
            timeout_secs: 30,
            max_retries: 3,
        }
    }
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self {
            final_limit: 10,
            rrf_k: 60.0,
        }
    }
}

impl Config {
    /// Build the configuration from the process environment.
    ///
    /// Fails if `DB_URL` is missing; everything else has a default.
    pub fn from_env() -> Result<Self> {
        let db_url = match std::env::var("DB_URL") {
            Ok(v) if !v.trim().is_empty() => v,
            _ => bail!("DB_URL must be set (SQLite database path)"),
        };

        let db_path = PathBuf::from(
            db_url
                .trim_start_matches("sqlite://")
                .trim_start_matches("sqlite:"),
        );

        let volume_root = std::env::var("REPO_VOLUME")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("./data/repositories"));

        let embedding = EmbeddingConfig {
            api_key: std::env::var("EMBEDDING_API_KEY").ok(),
            ..EmbeddingConfig::default()
        };

        Ok(Self {
            db: DbConfig {
                path: db_path,
                max_connections: 10,
            },
            volume: VolumeConfig { root: volume_root },
            indexing: IndexingConfig::default(),
            embedding,
            retrieval: RetrievalConfig::default(),
        })
    }

    /// A configuration pointed at explicit paths, used by tests.
    pub fn with_paths(db_path: impl Into<PathBuf>, volume_root: impl Into<PathBuf>) -> Self {
        Self {
            db: DbConfig {
                path: db_path.into(),
                max_connections: 10,
            },
            volume: VolumeConfig {
                root: volume_root.into(),
            },
            indexing: IndexingConfig::default(),
            embedding: EmbeddingConfig::default(),
            retrieval: RetrievalConfig::default(),
        }
    }
}
