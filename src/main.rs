//! # Codegraph Harness CLI (`cgx`)
//!
//! Command-line front end over the indexing and retrieval engine.
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `cgx db upgrade` | Create/upgrade the SQLite schema |
//! | `cgx index <url>` | Index a repository at its branch head |
//! | `cgx embed <url>` | Run the embedding pipeline on the active snapshot |
//! | `cgx search <url> <query>` | Search; results as JSON lines |
//! | `cgx read <url> <path>` | Read a file from the active snapshot |
//! | `cgx ls <url> [path]` | List a snapshot directory |
//! | `cgx stats` | Database overview |
//!
//! Configuration comes from the environment: `DB_URL` (required),
//! `REPO_VOLUME`, `EMBEDDING_API_KEY`.
//!
//! Exit codes: 0 success, 1 runtime error, 2 usage error.

use anyhow::Result;
use clap::{Parser, Subcommand};
use std::sync::Arc;

use codegraph_harness::config::Config;
use codegraph_harness::embedding::{create_provider, EmbedEvent, EmbeddingPipeline, MockProvider};
use codegraph_harness::indexer::{CodebaseIndexer, IndexOutcome};
use codegraph_harness::reader::CodeReader;
use codegraph_harness::retrieval::{CodeRetriever, Strategy};
use codegraph_harness::store::search::FilterSet;
use codegraph_harness::store::GraphStore;
use codegraph_harness::{db, migrate};

#[derive(Parser)]
#[command(
    name = "cgx",
    about = "Codegraph Harness — snapshot-isolated code graph indexing and hybrid retrieval",
    version
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Index a repository at its branch head.
    ///
    /// Prints the snapshot id, or `queued` when another indexing run on
    /// the same repository is in flight.
    Index {
        /// Git remote URL (or local path).
        repo_url: String,

        /// Branch (or tag) to index.
        #[arg(long, default_value = "main")]
        branch: String,

        /// Re-index even if a completed snapshot exists for the commit.
        #[arg(long)]
        force: bool,
    },

    /// Generate embeddings for the repository's active snapshot.
    Embed {
        repo_url: String,

        #[arg(long, default_value = "main")]
        branch: String,

        /// Model identifier override.
        #[arg(long)]
        model: Option<String>,

        /// Rows per staging page and per provider call.
        #[arg(long, default_value_t = 200)]
        batch_size: usize,

        /// Use the deterministic mock provider (no API key required).
        #[arg(long)]
        mock: bool,
    },

    /// Search the repository's active snapshot; prints JSON lines.
    Search {
        repo_url: String,
        query: String,

        #[arg(long, default_value = "main")]
        branch: String,

        /// Retrieval strategy: vector, keyword, or hybrid.
        #[arg(long, default_value = "hybrid")]
        strategy: String,

        #[arg(long, default_value_t = 10)]
        limit: usize,

        /// Use the deterministic mock provider for query embedding.
        #[arg(long)]
        mock: bool,
    },

    /// Read a file from the repository's active snapshot.
    Read {
        repo_url: String,
        path: String,

        #[arg(long, default_value = "main")]
        branch: String,

        /// 1-based start line (inclusive).
        #[arg(long)]
        start: Option<i64>,

        /// 1-based end line (inclusive).
        #[arg(long)]
        end: Option<i64>,
    },

    /// List a directory of the repository's active snapshot.
    Ls {
        repo_url: String,

        /// Directory path (empty for the repository root).
        #[arg(default_value = "")]
        path: String,

        #[arg(long, default_value = "main")]
        branch: String,

        /// Instead of listing, find directories whose name contains PATH.
        #[arg(long)]
        find: bool,

        #[arg(long, default_value_t = 25)]
        limit: usize,
    },

    /// Print database statistics.
    Stats,

    /// Database management.
    Db {
        #[command(subcommand)]
        action: DbAction,
    },
}

#[derive(Subcommand)]
enum DbAction {
    /// Run schema migrations. Idempotent.
    Upgrade,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let config = Config::from_env()?;
    let pool = db::connect(&config).await?;
    migrate::run_migrations(&pool).await?;
    let store = GraphStore::new(pool);

    match cli.command {
        Commands::Db {
            action: DbAction::Upgrade,
        } => {
            // Migrations already ran above; report and exit.
            println!("Database schema up to date.");
        }

        Commands::Index {
            repo_url,
            branch,
            force,
        } => {
            let indexer = CodebaseIndexer::new(config, store)?;
            match indexer.index(&repo_url, &branch, force).await? {
                IndexOutcome::Queued => println!("queued"),
                IndexOutcome::Existing(id) | IndexOutcome::Indexed(id) => println!("{id}"),
            }
        }

        Commands::Embed {
            repo_url,
            branch,
            model,
            batch_size,
            mock,
        } => {
            let repo_id = require_repository(&store, &repo_url, &branch).await?;
            let snapshot_id = match store.active_snapshot_of(&repo_id).await? {
                Some(id) => id,
                None => usage_error("no active snapshot; run `cgx index` first"),
            };

            let mut embedding_config = config.embedding.clone();
            if let Some(model) = model {
                embedding_config.model = model;
            }
            if mock {
                embedding_config.provider = "mock".to_string();
            }
            let provider = create_provider(&embedding_config)?;

            let pipeline = Arc::new(EmbeddingPipeline::new(store, provider));
            let (mut events, handle) = pipeline.spawn(snapshot_id, batch_size);
            while let Some(event) = events.recv().await {
                match event {
                    EmbedEvent::Init => println!("embed: preparing staging"),
                    EmbedEvent::StagingProgress { staged } => println!("embed: staged {staged}"),
                    EmbedEvent::Deduplicating => println!("embed: deduplicating against history"),
                    EmbedEvent::DedupStats { reused } => println!("embed: reused {reused} cached vectors"),
                    EmbedEvent::EmbeddingProgress { processed, total } => {
                        println!("embed: {processed}/{total}")
                    }
                    EmbedEvent::BatchFailed { count } => {
                        eprintln!("Warning: embedding batch of {count} failed")
                    }
                    EmbedEvent::Completed {
                        newly_embedded,
                        reused,
                        failed,
                    } => {
                        println!("embed: completed");
                        println!("  newly embedded: {newly_embedded}");
                        println!("  reused:         {reused}");
                        println!("  failed:         {failed}");
                    }
                }
            }
            handle.await??;
        }

        Commands::Search {
            repo_url,
            query,
            branch,
            strategy,
            limit,
            mock,
        } => {
            let repo_id = require_repository(&store, &repo_url, &branch).await?;
            let strategy: Strategy = match strategy.parse() {
                Ok(s) => s,
                Err(e) => usage_error(&e.to_string()),
            };

            let provider = if matches!(strategy, Strategy::Keyword) {
                None
            } else if mock {
                let mock_provider: Arc<dyn codegraph_harness::embedding::EmbeddingProvider> =
                    Arc::new(MockProvider::new(64));
                Some(mock_provider)
            } else {
                Some(create_provider(&config.embedding)?)
            };

            let retriever = CodeRetriever::new(store, provider);
            let results = retriever
                .retrieve(&query, &repo_id, None, limit, strategy, &FilterSet::default())
                .await?;
            for result in &results {
                println!("{}", serde_json::to_string(result)?);
            }
        }

        Commands::Read {
            repo_url,
            path,
            branch,
            start,
            end,
        } => {
            let repo_id = require_repository(&store, &repo_url, &branch).await?;
            let snapshot_id = match store.active_snapshot_of(&repo_id).await? {
                Some(id) => id,
                None => usage_error("no active snapshot; run `cgx index` first"),
            };
            let reader = CodeReader::new(store);
            let view = reader.read_file(&snapshot_id, &path, start, end).await?;
            print!("{}", view.content);
        }

        Commands::Ls {
            repo_url,
            path,
            branch,
            find,
            limit,
        } => {
            let repo_id = require_repository(&store, &repo_url, &branch).await?;
            let snapshot_id = match store.active_snapshot_of(&repo_id).await? {
                Some(id) => id,
                None => usage_error("no active snapshot; run `cgx index` first"),
            };
            let reader = CodeReader::new(store);
            if find {
                for dir in reader.find_directories(&snapshot_id, &path, limit).await? {
                    println!("{dir}/");
                }
            } else {
                for entry in reader.list_directory(&snapshot_id, &path).await? {
                    if entry.kind == "dir" {
                        println!("{}/", entry.name);
                    } else {
                        println!("{}", entry.name);
                    }
                }
            }
        }

        Commands::Stats => {
            let stats = store.get_stats().await?;
            println!("Codegraph Harness — Database Stats");
            println!("==================================");
            println!();
            println!("  Repositories: {}", stats.repositories);
            println!("  Snapshots:    {}", stats.snapshots);
            println!("  Files:        {}", stats.files);
            println!("  Chunks:       {}", stats.nodes);
            println!("  Embeddings:   {}", stats.embeddings);
        }
    }

    Ok(())
}

async fn require_repository(store: &GraphStore, url: &str, branch: &str) -> Result<String> {
    match store.find_repository(url, branch).await? {
        Some(id) => Ok(id),
        None => usage_error(&format!("unknown repository {url} ({branch}); run `cgx index` first")),
    }
}

/// Usage errors exit with code 2, matching clap's convention.
fn usage_error(message: &str) -> ! {
    eprintln!("Error: {message}");
    std::process::exit(2);
}
