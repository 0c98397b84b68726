//! Indexing orchestrator.
//!
//! Drives one indexing run end to end:
//!
//! 1. register the repository and sync its bare mirror;
//! 2. create an `indexing` snapshot (or return early: `Queued` when
//!    another run holds the lock, `Existing` when the commit is already
//!    indexed and `force` is off);
//! 3. mount an ephemeral worktree and stream the source collector;
//! 4. cache-first split: files whose Git blob hash was already parsed in a
//!    completed snapshot are re-attached without parse work, the misses
//!    fan out across a bounded pool of parse workers;
//! 5. run the cross-file relation source and resolve its rows once
//!    parsing has joined;
//! 6. compute stats plus the file manifest and activate the snapshot.
//!
//! Worker-local data errors (unparsable files) never propagate — they
//! become `failed` file records. Any pipeline error fails the snapshot and
//! resurfaces. A reindex request queued by a losing concurrent run is
//! honored by looping with `force` once the current run activates.

use anyhow::{Context, Result};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tokio::task::JoinSet;

use crate::collector::SourceCollector;
use crate::config::Config;
use crate::gitvolume::GitVolumeManager;
use crate::manifest;
use crate::models::CollectedFile;
use crate::parser::RepoParser;
use crate::relations::{ingest_relations, NullRelationSource, RelationSource};
use crate::store::GraphStore;

/// Outcome of an `index()` call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IndexOutcome {
    /// The repository was busy; the request was queued for the running
    /// indexer to pick up.
    Queued,
    /// A completed snapshot for this commit already existed.
    Existing(String),
    /// A new snapshot was built and activated.
    Indexed(String),
}

impl IndexOutcome {
    pub fn snapshot_id(&self) -> Option<&str> {
        match self {
            Self::Queued => None,
            Self::Existing(id) | Self::Indexed(id) => Some(id),
        }
    }
}

/// Cooperative cancellation handle; checked at batch boundaries.
#[derive(Debug, Clone, Default)]
pub struct CancelFlag(Arc<AtomicBool>);

impl CancelFlag {
    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

pub struct CodebaseIndexer {
    config: Config,
    store: GraphStore,
    git: GitVolumeManager,
    relations: Arc<dyn RelationSource>,
    cancel: CancelFlag,
}

impl CodebaseIndexer {
    pub fn new(config: Config, store: GraphStore) -> Result<Self> {
        let git = GitVolumeManager::new(&config.volume.root)?;
        Ok(Self {
            config,
            store,
            git,
            relations: Arc::new(NullRelationSource),
            cancel: CancelFlag::default(),
        })
    }

    /// Replace the cross-file relation source (SCIP-style extractors plug
    /// in here).
    pub fn with_relation_source(mut self, source: Arc<dyn RelationSource>) -> Self {
        self.relations = source;
        self
    }

    pub fn cancel_flag(&self) -> CancelFlag {
        self.cancel.clone()
    }

    /// Index `repo_url`/`branch` at its current head.
    pub async fn index(&self, repo_url: &str, branch: &str, force: bool) -> Result<IndexOutcome> {
        let name = repo_display_name(repo_url);
        let repo_id = self.store.ensure_repository(repo_url, branch, &name).await?;
        let mut force = force;

        loop {
            self.git.ensure_repo_updated(repo_url)?;
            let commit = self.git.head_commit(repo_url, branch)?;

            let (snapshot_id, created) = self.store.create_snapshot(&repo_id, &commit, force).await?;
            let Some(snapshot_id) = snapshot_id else {
                return Ok(IndexOutcome::Queued);
            };
            if !created {
                return Ok(IndexOutcome::Existing(snapshot_id));
            }

            let worktree = self
                .git
                .create_worktree(repo_url, &commit, &snapshot_id)
                .with_context(|| format!("mounting worktree for {commit}"));
            let worktree = match worktree {
                Ok(w) => w,
                Err(e) => {
                    self.store.fail_snapshot(&snapshot_id, &e.to_string()).await?;
                    return Err(e);
                }
            };

            match self
                .run_pipeline(&repo_id, &snapshot_id, &commit, worktree.path())
                .await
            {
                Ok(()) => {
                    drop(worktree);
                    if self.store.check_and_reset_reindex_flag(&repo_id).await? {
                        tracing::info!("pending reindex request detected, restarting");
                        force = true;
                        continue;
                    }
                    return Ok(IndexOutcome::Indexed(snapshot_id));
                }
                Err(e) => {
                    self.store.fail_snapshot(&snapshot_id, &e.to_string()).await?;
                    return Err(e);
                }
            }
        }
    }

    async fn run_pipeline(
        &self,
        repo_id: &str,
        snapshot_id: &str,
        commit: &str,
        worktree: &std::path::Path,
    ) -> Result<()> {
        let started = Instant::now();

        // The relation feed runs concurrently with parsing; its output is
        // resolved only after every chunk is committed. The source is
        // advisory: a failure degrades to zero cross-file edges.
        let relation_source = Arc::clone(&self.relations);
        let relation_worktree = worktree.to_path_buf();
        let relation_task = tokio::task::spawn_blocking(move || {
            relation_source
                .extract(&relation_worktree)
                .unwrap_or_else(|e| {
                    tracing::warn!(error = %e, "relation extraction failed, continuing without cross-file edges");
                    Vec::new()
                })
        });

        let collector = SourceCollector::new(worktree);
        let batches = collector.stream_files(self.config.indexing.collect_batch)?;

        // Cache-first split: re-attach files already parsed under the same
        // Git blob hash; everything else goes to the parse pool.
        let mut misses: Vec<CollectedFile> = Vec::new();
        let mut reused_files: u64 = 0;
        let mut total_files: u64 = 0;
        for batch in batches {
            self.check_cancelled(snapshot_id)?;
            for file in batch {
                total_files += 1;
                let cached = match &file.git_hash {
                    Some(hash) => self.store.find_cached_file(hash).await?,
                    None => None,
                };
                match cached {
                    Some(prior_file_id) => {
                        self.store
                            .reattach_file(&prior_file_id, snapshot_id, &file.rel_path, commit)
                            .await?;
                        reused_files += 1;
                    }
                    None => misses.push(file),
                }
            }
        }
        tracing::info!(
            total = total_files,
            reused = reused_files,
            to_parse = misses.len(),
            "cache-first split done"
        );

        // Fan the misses out across bounded parse workers. Each task parses
        // its files on a blocking thread and commits its outputs in one
        // transaction, so per-file atomicity holds.
        let workers = self.config.indexing.workers.max(1);
        let mut tasks: JoinSet<Result<(usize, u64)>> = JoinSet::new();
        let mut in_flight = 0usize;
        let mut parsed_files: u64 = 0;
        let mut failed_files: u64 = 0;
        let mut chunks_of = misses
            .chunks(self.config.indexing.files_per_task.max(1))
            .map(|c| c.to_vec())
            .collect::<Vec<_>>()
            .into_iter();

        loop {
            while in_flight < workers {
                let Some(task_files) = chunks_of.next() else {
                    break;
                };
                self.check_cancelled(snapshot_id)?;
                let store = self.store.clone();
                let snapshot = snapshot_id.to_string();
                let commit = commit.to_string();
                tasks.spawn(async move {
                    let parser = RepoParser::new(&snapshot, &commit);
                    let outputs = tokio::task::spawn_blocking(move || {
                        task_files
                            .iter()
                            .map(|f| parser.parse_file(f))
                            .collect::<Vec<_>>()
                    })
                    .await?;
                    let failed = outputs
                        .iter()
                        .filter(|o| o.file.parsing_status == crate::models::ParseStatus::Failed)
                        .count() as u64;
                    let count = outputs.len();
                    store.commit_parse_outputs(&outputs).await?;
                    Ok((count, failed))
                });
                in_flight += 1;
            }

            let Some(joined) = tasks.join_next().await else {
                break;
            };
            in_flight -= 1;
            let (count, failed) = joined??;
            parsed_files += count as u64;
            failed_files += failed;
        }

        // Parsing has joined: every chunk is visible, resolve the feed.
        let relation_rows = relation_task.await?;
        let relation_report = ingest_relations(&self.store, snapshot_id, relation_rows).await?;

        let node_count: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM nodes n JOIN files f ON f.id = n.file_id WHERE f.snapshot_id = ?",
        )
        .bind(snapshot_id)
        .fetch_one(self.store.pool())
        .await?;

        let stats = serde_json::json!({
            "files": total_files,
            "parsed": parsed_files,
            "reused": reused_files,
            "parse_failures": failed_files,
            "nodes": node_count,
            "cross_file_edges": relation_report.resolved,
            "relations_on_file_node": relation_report.file_fallback,
            "relations_dropped": relation_report.dropped,
            "duration_ms": started.elapsed().as_millis() as u64,
        });

        let paths = self.store.list_file_paths(snapshot_id).await?;
        let tree = manifest::build(&paths);

        self.check_cancelled(snapshot_id)?;
        self.store
            .activate_snapshot(repo_id, snapshot_id, &stats, &tree)
            .await?;
        Ok(())
    }

    fn check_cancelled(&self, snapshot_id: &str) -> Result<()> {
        if self.cancel.is_cancelled() {
            anyhow::bail!("indexing of snapshot {snapshot_id} cancelled");
        }
        Ok(())
    }
}

/// `https://host/org/repo.git` → `repo`.
pub fn repo_display_name(url: &str) -> String {
    url.trim_end_matches('/')
        .rsplit('/')
        .next()
        .unwrap_or(url)
        .trim_end_matches(".git")
        .to_string()
}
