//! Storage engine for the code property graph.
//!
//! Persists all entities in SQLite via `sqlx` and exposes typed query
//! helpers on top. Split by concern:
//!
//! - this module — repository identity and the snapshot lifecycle
//!   (`indexing → completed | failed`, activation compare-and-set);
//! - [`bulk`] — set-semantics bulk ingest and cross-file relation
//!   resolution;
//! - [`search`] — vector and lexical search with pre-ranking filters;
//! - [`graph`] — neighbor lookups and file reads;
//! - [`staging`] — the embedding staging table.
//!
//! Readers resolve snapshots only through `active_snapshot_of`, which only
//! ever returns a `completed` snapshot, so an in-flight indexing run is
//! never observable.

pub mod bulk;
pub mod graph;
pub mod search;
pub mod staging;

use sqlx::{Row, SqlitePool};
use uuid::Uuid;

use crate::error::{StoreError, StoreResult};

#[derive(Clone)]
pub struct GraphStore {
    pool: SqlitePool,
}

/// Aggregate row counts for the `stats` command.
#[derive(Debug, Clone, serde::Serialize)]
pub struct StoreStats {
    pub repositories: i64,
    pub snapshots: i64,
    pub files: i64,
    pub nodes: i64,
    pub embeddings: i64,
}

#[derive(Debug, Clone)]
pub struct SnapshotRow {
    pub id: String,
    pub repository_id: String,
    pub commit_hash: String,
    pub status: String,
    pub created_at: i64,
}

impl GraphStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Register or update a repository. Idempotent on `(url, branch)`.
    pub async fn ensure_repository(
        &self,
        url: &str,
        branch: &str,
        name: &str,
    ) -> StoreResult<String> {
        let now = chrono::Utc::now().timestamp();
        let id: String = sqlx::query_scalar(
            r#"
            INSERT INTO repositories (id, url, branch, name, created_at, updated_at)
            VALUES (?, ?, ?, ?, ?, ?)
            ON CONFLICT(url, branch) DO UPDATE SET
                name = excluded.name,
                updated_at = excluded.updated_at
            RETURNING id
            "#,
        )
        .bind(Uuid::new_v4().to_string())
        .bind(url)
        .bind(branch)
        .bind(name)
        .bind(now)
        .bind(now)
        .fetch_one(&self.pool)
        .await?;
        Ok(id)
    }

    pub async fn find_repository(&self, url: &str, branch: &str) -> StoreResult<Option<String>> {
        let id: Option<String> =
            sqlx::query_scalar("SELECT id FROM repositories WHERE url = ? AND branch = ?")
                .bind(url)
                .bind(branch)
                .fetch_optional(&self.pool)
                .await?;
        Ok(id)
    }

    /// Begin an indexing snapshot.
    ///
    /// Returns `(Some(id), false)` when a completed snapshot for the same
    /// commit already exists and `force_new` is off; `(Some(id), true)` for
    /// a freshly created `indexing` snapshot; `(None, false)` when another
    /// snapshot on this repository is already `indexing` — the unique
    /// violation doubles as the advisory lock, and the loser leaves a
    /// reindex request behind.
    pub async fn create_snapshot(
        &self,
        repository_id: &str,
        commit_hash: &str,
        force_new: bool,
    ) -> StoreResult<(Option<String>, bool)> {
        if !force_new {
            let existing: Option<String> = sqlx::query_scalar(
                r#"
                SELECT id FROM snapshots
                WHERE repository_id = ? AND commit_hash = ? AND status = 'completed'
                ORDER BY created_at DESC LIMIT 1
                "#,
            )
            .bind(repository_id)
            .bind(commit_hash)
            .fetch_optional(&self.pool)
            .await?;

            if let Some(id) = existing {
                tracing::info!(snapshot = %id, "existing snapshot found");
                return Ok((Some(id), false));
            }
        }

        let new_id = Uuid::new_v4().to_string();
        let now = chrono::Utc::now().timestamp();
        let inserted = sqlx::query(
            r#"
            INSERT INTO snapshots (id, repository_id, commit_hash, status, created_at)
            VALUES (?, ?, ?, 'indexing', ?)
            "#,
        )
        .bind(&new_id)
        .bind(repository_id)
        .bind(commit_hash)
        .bind(now)
        .execute(&self.pool)
        .await;

        match inserted {
            Ok(_) => {
                tracing::info!(snapshot = %new_id, "indexing lock acquired");
                Ok((Some(new_id), true))
            }
            Err(e) if is_unique_violation(&e) => {
                tracing::info!(repository = repository_id, "repository busy, queueing reindex");
                sqlx::query(
                    "UPDATE repositories SET reindex_requested_at = ? WHERE id = ?",
                )
                .bind(now)
                .bind(repository_id)
                .execute(&self.pool)
                .await?;
                Ok((None, false))
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Consume a pending reindex request, if one was queued while a run
    /// was in flight.
    pub async fn check_and_reset_reindex_flag(&self, repository_id: &str) -> StoreResult<bool> {
        let result = sqlx::query(
            r#"
            UPDATE repositories SET reindex_requested_at = NULL
            WHERE id = ? AND reindex_requested_at IS NOT NULL
            "#,
        )
        .bind(repository_id)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Promote a snapshot to `completed` and point the repository at it.
    ///
    /// One transaction: the status transition (legal only from `indexing`)
    /// plus a compare-and-set on `current_snapshot_id` that only moves the
    /// pointer forward in snapshot creation time. Losing either guard is a
    /// typed error so the orchestrator can distinguish a fatal state bug
    /// from a lost activation race.
    pub async fn activate_snapshot(
        &self,
        repository_id: &str,
        snapshot_id: &str,
        stats: &serde_json::Value,
        manifest: &serde_json::Value,
    ) -> StoreResult<()> {
        let mut tx = self.pool.begin().await?;
        let now = chrono::Utc::now().timestamp();

        let created_at: Option<i64> =
            sqlx::query_scalar("SELECT created_at FROM snapshots WHERE id = ? AND status = 'indexing'")
                .bind(snapshot_id)
                .fetch_optional(&mut *tx)
                .await?;
        let Some(created_at) = created_at else {
            return Err(StoreError::state(format!(
                "snapshot {snapshot_id} is not in 'indexing' state"
            )));
        };

        sqlx::query(
            r#"
            UPDATE snapshots
            SET status = 'completed', completed_at = ?, stats = ?, file_manifest = ?
            WHERE id = ?
            "#,
        )
        .bind(now)
        .bind(stats.to_string())
        .bind(manifest.to_string())
        .bind(snapshot_id)
        .execute(&mut *tx)
        .await?;

        let moved = sqlx::query(
            r#"
            UPDATE repositories
            SET current_snapshot_id = ?, updated_at = ?
            WHERE id = ?
              AND (current_snapshot_id IS NULL
                   OR ? >= (SELECT created_at FROM snapshots WHERE id = repositories.current_snapshot_id))
            "#,
        )
        .bind(snapshot_id)
        .bind(now)
        .bind(repository_id)
        .bind(created_at)
        .execute(&mut *tx)
        .await?;

        if moved.rows_affected() == 0 {
            return Err(StoreError::conflict(format!(
                "a newer snapshot already activated for repository {repository_id}"
            )));
        }

        tx.commit().await?;
        tracing::info!(snapshot = snapshot_id, "snapshot activated");
        Ok(())
    }

    /// Transition a snapshot to `failed`. Never touches the active
    /// pointer; only legal from `indexing`.
    pub async fn fail_snapshot(&self, snapshot_id: &str, error: &str) -> StoreResult<()> {
        let result = sqlx::query(
            r#"
            UPDATE snapshots
            SET status = 'failed', completed_at = ?, stats = json_object('error', ?)
            WHERE id = ? AND status = 'indexing'
            "#,
        )
        .bind(chrono::Utc::now().timestamp())
        .bind(error)
        .bind(snapshot_id)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(StoreError::state(format!(
                "snapshot {snapshot_id} is not in 'indexing' state"
            )));
        }
        Ok(())
    }

    pub async fn active_snapshot_of(&self, repository_id: &str) -> StoreResult<Option<String>> {
        let id: Option<Option<String>> =
            sqlx::query_scalar("SELECT current_snapshot_id FROM repositories WHERE id = ?")
                .bind(repository_id)
                .fetch_optional(&self.pool)
                .await?;
        Ok(id.flatten())
    }

    pub async fn get_snapshot(&self, snapshot_id: &str) -> StoreResult<SnapshotRow> {
        let row = sqlx::query(
            "SELECT id, repository_id, commit_hash, status, created_at FROM snapshots WHERE id = ?",
        )
        .bind(snapshot_id)
        .fetch_optional(&self.pool)
        .await?
        .ok_or_else(|| StoreError::not_found(format!("snapshot {snapshot_id}")))?;

        Ok(SnapshotRow {
            id: row.get("id"),
            repository_id: row.get("repository_id"),
            commit_hash: row.get("commit_hash"),
            status: row.get("status"),
            created_at: row.get("created_at"),
        })
    }

    /// Delete a non-active snapshot and everything it owns (cascade).
    /// Shared content rows are garbage-collected only when orphaned.
    pub async fn prune_snapshot(&self, snapshot_id: &str) -> StoreResult<()> {
        let snapshot = self.get_snapshot(snapshot_id).await?;
        let active = self.active_snapshot_of(&snapshot.repository_id).await?;
        if active.as_deref() == Some(snapshot_id) {
            return Err(StoreError::conflict(format!(
                "snapshot {snapshot_id} is active and cannot be pruned"
            )));
        }

        let mut tx = self.pool.begin().await?;
        sqlx::query("DELETE FROM snapshots WHERE id = ?")
            .bind(snapshot_id)
            .execute(&mut *tx)
            .await?;
        // Contents are refused deletion while referenced; only orphans go.
        sqlx::query(
            r#"
            DELETE FROM contents
            WHERE chunk_hash NOT IN (SELECT chunk_hash FROM nodes)
              AND chunk_hash NOT IN (SELECT content_hash FROM files WHERE content_hash IS NOT NULL)
            "#,
        )
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;
        Ok(())
    }

    pub async fn get_stats(&self) -> StoreResult<StoreStats> {
        let repositories: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM repositories")
            .fetch_one(&self.pool)
            .await?;
        let snapshots: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM snapshots")
            .fetch_one(&self.pool)
            .await?;
        let files: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM files")
            .fetch_one(&self.pool)
            .await?;
        let nodes: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM nodes")
            .fetch_one(&self.pool)
            .await?;
        let embeddings: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM node_embeddings")
            .fetch_one(&self.pool)
            .await?;
        Ok(StoreStats {
            repositories,
            snapshots,
            files,
            nodes,
            embeddings,
        })
    }
}

fn is_unique_violation(e: &sqlx::Error) -> bool {
    matches!(e, sqlx::Error::Database(db) if db.is_unique_violation())
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;
    use crate::config::Config;

    /// A migrated store in a fresh temp directory.
    pub async fn temp_store() -> (tempfile::TempDir, GraphStore) {
        let tmp = tempfile::tempdir().unwrap();
        let config = Config::with_paths(tmp.path().join("graph.sqlite"), tmp.path().join("repos"));
        let pool = crate::db::connect(&config).await.unwrap();
        crate::migrate::run_migrations(&pool).await.unwrap();
        (tmp, GraphStore::new(pool))
    }
}

#[cfg(test)]
mod tests {
    use super::test_support::temp_store;
    use super::*;

    #[tokio::test]
    async fn test_ensure_repository_idempotent() {
        let (_tmp, store) = temp_store().await;
        let a = store
            .ensure_repository("https://x/repo.git", "main", "repo")
            .await
            .unwrap();
        let b = store
            .ensure_repository("https://x/repo.git", "main", "repo-renamed")
            .await
            .unwrap();
        assert_eq!(a, b);

        let other = store
            .ensure_repository("https://x/repo.git", "dev", "repo")
            .await
            .unwrap();
        assert_ne!(a, other);
    }

    #[tokio::test]
    async fn test_snapshot_lifecycle_and_indexing_guard() {
        let (_tmp, store) = temp_store().await;
        let repo = store.ensure_repository("u", "main", "n").await.unwrap();

        let (snap, created) = store.create_snapshot(&repo, "c1", false).await.unwrap();
        let snap = snap.unwrap();
        assert!(created);

        // A concurrent attempt loses the advisory lock and queues a reindex.
        let (other, created2) = store.create_snapshot(&repo, "c1", false).await.unwrap();
        assert!(other.is_none());
        assert!(!created2);
        assert!(store.check_and_reset_reindex_flag(&repo).await.unwrap());
        assert!(!store.check_and_reset_reindex_flag(&repo).await.unwrap());

        // Readers see nothing until activation.
        assert!(store.active_snapshot_of(&repo).await.unwrap().is_none());

        store
            .activate_snapshot(&repo, &snap, &serde_json::json!({}), &serde_json::json!({}))
            .await
            .unwrap();
        assert_eq!(store.active_snapshot_of(&repo).await.unwrap(), Some(snap.clone()));

        // Indexing the same commit again reuses the completed snapshot.
        let (again, created3) = store.create_snapshot(&repo, "c1", false).await.unwrap();
        assert_eq!(again, Some(snap));
        assert!(!created3);
    }

    #[tokio::test]
    async fn test_force_new_creates_fresh_snapshot() {
        let (_tmp, store) = temp_store().await;
        let repo = store.ensure_repository("u", "main", "n").await.unwrap();
        let (first, _) = store.create_snapshot(&repo, "c1", false).await.unwrap();
        let first = first.unwrap();
        store
            .activate_snapshot(&repo, &first, &serde_json::json!({}), &serde_json::json!({}))
            .await
            .unwrap();

        let (second, created) = store.create_snapshot(&repo, "c1", true).await.unwrap();
        assert!(created);
        assert_ne!(second.unwrap(), first);
    }

    #[tokio::test]
    async fn test_fail_snapshot_never_activates() {
        let (_tmp, store) = temp_store().await;
        let repo = store.ensure_repository("u", "main", "n").await.unwrap();
        let (snap, _) = store.create_snapshot(&repo, "c1", false).await.unwrap();
        let snap = snap.unwrap();

        store.fail_snapshot(&snap, "boom").await.unwrap();
        assert!(store.active_snapshot_of(&repo).await.unwrap().is_none());

        // A failed snapshot is terminal.
        let err = store
            .activate_snapshot(&repo, &snap, &serde_json::json!({}), &serde_json::json!({}))
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::State(_)));

        let err = store.fail_snapshot(&snap, "again").await.unwrap_err();
        assert!(matches!(err, StoreError::State(_)));
    }

    #[tokio::test]
    async fn test_activation_later_wins_by_creation_time() {
        let (_tmp, store) = temp_store().await;
        let repo = store.ensure_repository("u", "main", "n").await.unwrap();

        let (old, _) = store.create_snapshot(&repo, "c1", false).await.unwrap();
        let old = old.unwrap();
        // Backdate the first snapshot so ordering is unambiguous.
        sqlx::query("UPDATE snapshots SET created_at = created_at - 100 WHERE id = ?")
            .bind(&old)
            .execute(store.pool())
            .await
            .unwrap();
        store
            .activate_snapshot(&repo, &old, &serde_json::json!({}), &serde_json::json!({}))
            .await
            .unwrap();

        let (newer, _) = store.create_snapshot(&repo, "c2", true).await.unwrap();
        let newer = newer.unwrap();
        store
            .activate_snapshot(&repo, &newer, &serde_json::json!({}), &serde_json::json!({}))
            .await
            .unwrap();
        assert_eq!(store.active_snapshot_of(&repo).await.unwrap(), Some(newer.clone()));

        // Re-activating the older snapshot must not move the pointer back.
        sqlx::query("UPDATE snapshots SET status = 'indexing' WHERE id = ?")
            .bind(&old)
            .execute(store.pool())
            .await
            .unwrap();
        let err = store
            .activate_snapshot(&repo, &old, &serde_json::json!({}), &serde_json::json!({}))
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::Conflict(_)));
        assert_eq!(store.active_snapshot_of(&repo).await.unwrap(), Some(newer));
    }

    #[tokio::test]
    async fn test_prune_refuses_active_snapshot() {
        let (_tmp, store) = temp_store().await;
        let repo = store.ensure_repository("u", "main", "n").await.unwrap();
        let (snap, _) = store.create_snapshot(&repo, "c1", false).await.unwrap();
        let snap = snap.unwrap();
        store
            .activate_snapshot(&repo, &snap, &serde_json::json!({}), &serde_json::json!({}))
            .await
            .unwrap();

        let err = store.prune_snapshot(&snap).await.unwrap_err();
        assert!(matches!(err, StoreError::Conflict(_)));
    }
}
