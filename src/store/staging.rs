//! Embedding staging.
//!
//! The staging table is the workspace for one embedding run: unembedded
//! chunks are bulk-loaded with their prompt hashes, historical vectors are
//! backfilled in place by `vector_hash`, and the remaining delta is fetched
//! in batches for the provider. Promotion moves finished rows into
//! `node_embeddings` and truncates staging.
//!
//! Staging is single-writer per snapshot: a run begins by atomically
//! inserting its row into `embedding_runs` and refuses to start if one is
//! already there.

use sqlx::Row;

use super::GraphStore;
use crate::error::{StoreError, StoreResult};
use crate::models::ChunkMetadata;

/// A chunk that still needs a vector for the target model, hydrated with
/// everything the prompt template consumes.
#[derive(Debug, Clone)]
pub struct EmbeddableChunk {
    pub chunk_id: String,
    pub file_id: String,
    pub file_path: String,
    pub language: String,
    pub category: String,
    pub metadata: ChunkMetadata,
    pub content: String,
    /// Symbols of incoming `calls` edges (this chunk defines them).
    pub incoming_symbols: Vec<String>,
}

/// A staged row ready for the prompt → vector round trip.
#[derive(Debug, Clone)]
pub struct StagedRow {
    pub chunk_id: String,
    pub snapshot_id: String,
    pub file_id: String,
    pub vector_hash: String,
    pub prompt: String,
}

impl GraphStore {
    /// Claim the single-writer slot for `(snapshot, model)`. Returns false
    /// when another run holds it.
    pub async fn try_begin_embedding_run(
        &self,
        snapshot_id: &str,
        model_name: &str,
    ) -> StoreResult<bool> {
        let result = sqlx::query(
            "INSERT OR IGNORE INTO embedding_runs (snapshot_id, model_name, started_at) VALUES (?, ?, ?)",
        )
        .bind(snapshot_id)
        .bind(model_name)
        .bind(chrono::Utc::now().timestamp())
        .execute(self.pool())
        .await?;
        Ok(result.rows_affected() > 0)
    }

    pub async fn finish_embedding_run(&self, snapshot_id: &str) -> StoreResult<()> {
        sqlx::query("DELETE FROM embedding_runs WHERE snapshot_id = ?")
            .bind(snapshot_id)
            .execute(self.pool())
            .await?;
        Ok(())
    }

    /// Drop and recreate the staging table.
    pub async fn prepare_staging(&self) -> StoreResult<()> {
        sqlx::query("DROP TABLE IF EXISTS staging_embeddings")
            .execute(self.pool())
            .await?;
        sqlx::query(
            r#"
            CREATE TABLE staging_embeddings (
                chunk_id TEXT NOT NULL,
                model_name TEXT NOT NULL,
                snapshot_id TEXT NOT NULL,
                file_id TEXT NOT NULL,
                vector_hash TEXT NOT NULL,
                prompt TEXT NOT NULL,
                embedding BLOB,
                errored INTEGER NOT NULL DEFAULT 0,
                PRIMARY KEY (chunk_id, model_name)
            )
            "#,
        )
        .execute(self.pool())
        .await?;
        sqlx::query(
            "CREATE INDEX idx_staging_snap_vhash ON staging_embeddings(snapshot_id, vector_hash)",
        )
        .execute(self.pool())
        .await?;
        Ok(())
    }

    /// Total number of non-pseudo chunks in a snapshot, and how many
    /// already carry a vector for the model.
    pub async fn count_embedding_coverage(
        &self,
        snapshot_id: &str,
        model_name: &str,
    ) -> StoreResult<(i64, i64)> {
        let total: i64 = sqlx::query_scalar(
            r#"
            SELECT COUNT(*) FROM nodes n
            JOIN files f ON f.id = n.file_id
            WHERE f.snapshot_id = ? AND json_extract(n.metadata, '$.pseudo') IS NULL
            "#,
        )
        .bind(snapshot_id)
        .fetch_one(self.pool())
        .await?;

        let embedded: i64 = sqlx::query_scalar(
            r#"
            SELECT COUNT(*) FROM node_embeddings ne
            WHERE ne.snapshot_id = ? AND ne.model_name = ? AND ne.embedding IS NOT NULL
            "#,
        )
        .bind(snapshot_id)
        .bind(model_name)
        .fetch_one(self.pool())
        .await?;

        Ok((total, embedded))
    }

    /// Page through chunks in the snapshot that lack an embedding for the
    /// model, hydrated with content and incoming `calls` symbols.
    pub async fn fetch_unembedded_chunks(
        &self,
        snapshot_id: &str,
        model_name: &str,
        limit: i64,
        offset: i64,
    ) -> StoreResult<Vec<EmbeddableChunk>> {
        let rows = sqlx::query(
            r#"
            SELECT n.id, n.file_id, n.file_path, n.metadata, f.language, f.category, c.content,
                   (SELECT group_concat(DISTINCT json_extract(e.metadata, '$.symbol'))
                    FROM edges e
                    WHERE e.target_id = n.id AND e.relation_type = 'calls') AS incoming
            FROM files f
            JOIN nodes n ON n.file_id = f.id
            JOIN contents c ON c.chunk_hash = n.chunk_hash
            LEFT JOIN node_embeddings ne ON ne.chunk_id = n.id AND ne.model_name = ?
            WHERE f.snapshot_id = ?
              AND ne.chunk_id IS NULL
              AND json_extract(n.metadata, '$.pseudo') IS NULL
            ORDER BY n.file_path, n.byte_start
            LIMIT ? OFFSET ?
            "#,
        )
        .bind(model_name)
        .bind(snapshot_id)
        .bind(limit)
        .bind(offset)
        .fetch_all(self.pool())
        .await?;

        Ok(rows
            .iter()
            .map(|row| {
                let incoming: Option<String> = row.get("incoming");
                let mut incoming_symbols: Vec<String> = incoming
                    .unwrap_or_default()
                    .split(',')
                    .filter(|s| !s.is_empty() && *s != "null")
                    .map(String::from)
                    .collect();
                incoming_symbols.sort();
                incoming_symbols.dedup();
                EmbeddableChunk {
                    chunk_id: row.get("id"),
                    file_id: row.get("file_id"),
                    file_path: row.get("file_path"),
                    language: row.get("language"),
                    category: row.get("category"),
                    metadata: serde_json::from_str(&row.get::<String, _>("metadata"))
                        .unwrap_or_default(),
                    content: row.get("content"),
                    incoming_symbols,
                }
            })
            .collect())
    }

    /// Bulk-load prepared rows into staging.
    pub async fn bulk_load_staging(&self, rows: &[StagedRow], model_name: &str) -> StoreResult<()> {
        let mut tx = self.pool().begin().await?;
        for row in rows {
            sqlx::query(
                r#"
                INSERT OR REPLACE INTO staging_embeddings
                    (chunk_id, model_name, snapshot_id, file_id, vector_hash, prompt, embedding, errored)
                VALUES (?, ?, ?, ?, ?, ?, NULL, 0)
                "#,
            )
            .bind(&row.chunk_id)
            .bind(model_name)
            .bind(&row.snapshot_id)
            .bind(&row.file_id)
            .bind(&row.vector_hash)
            .bind(&row.prompt)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    /// Backfill staged rows whose `vector_hash` already exists in the
    /// permanent table, copying vectors in place. Returns the number of
    /// rows recovered from history.
    pub async fn copy_cached_vectors(
        &self,
        snapshot_id: &str,
        model_name: &str,
    ) -> StoreResult<u64> {
        let result = sqlx::query(
            r#"
            UPDATE staging_embeddings
            SET embedding = (
                SELECT ne.embedding FROM node_embeddings ne
                WHERE ne.vector_hash = staging_embeddings.vector_hash
                  AND ne.model_name = staging_embeddings.model_name
                  AND ne.embedding IS NOT NULL
                LIMIT 1
            )
            WHERE snapshot_id = ? AND model_name = ? AND embedding IS NULL
              AND vector_hash IN (
                SELECT vector_hash FROM node_embeddings
                WHERE model_name = ? AND embedding IS NOT NULL
              )
            "#,
        )
        .bind(snapshot_id)
        .bind(model_name)
        .bind(model_name)
        .execute(self.pool())
        .await?;
        Ok(result.rows_affected())
    }

    /// Rows still missing a vector (and not marked errored), oldest first.
    pub async fn fetch_staging_delta(
        &self,
        snapshot_id: &str,
        batch_size: i64,
        offset: i64,
    ) -> StoreResult<Vec<StagedRow>> {
        let rows = sqlx::query(
            r#"
            SELECT chunk_id, snapshot_id, file_id, vector_hash, prompt
            FROM staging_embeddings
            WHERE snapshot_id = ? AND embedding IS NULL AND errored = 0
            ORDER BY chunk_id
            LIMIT ? OFFSET ?
            "#,
        )
        .bind(snapshot_id)
        .bind(batch_size)
        .bind(offset)
        .fetch_all(self.pool())
        .await?;

        Ok(rows
            .iter()
            .map(|row| StagedRow {
                chunk_id: row.get("chunk_id"),
                snapshot_id: row.get("snapshot_id"),
                file_id: row.get("file_id"),
                vector_hash: row.get("vector_hash"),
                prompt: row.get("prompt"),
            })
            .collect())
    }

    /// Write computed vectors back into staging.
    pub async fn write_vectors(&self, rows: &[(String, Vec<u8>)], model_name: &str) -> StoreResult<()> {
        let mut tx = self.pool().begin().await?;
        for (chunk_id, blob) in rows {
            sqlx::query(
                "UPDATE staging_embeddings SET embedding = ? WHERE chunk_id = ? AND model_name = ?",
            )
            .bind(blob.as_slice())
            .bind(chunk_id)
            .bind(model_name)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    /// Mark rows whose provider batch exhausted its retries; they are
    /// reported but do not fail the run.
    pub async fn mark_staging_errored(&self, chunk_ids: &[String], model_name: &str) -> StoreResult<()> {
        let mut tx = self.pool().begin().await?;
        for chunk_id in chunk_ids {
            sqlx::query(
                "UPDATE staging_embeddings SET errored = 1 WHERE chunk_id = ? AND model_name = ?",
            )
            .bind(chunk_id)
            .bind(model_name)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    /// Upsert finished staging rows into the permanent table, then clear
    /// staging for this snapshot. Returns the number of rows promoted.
    pub async fn promote_staging(&self, snapshot_id: &str) -> StoreResult<u64> {
        let mut tx = self.pool().begin().await?;
        let now = chrono::Utc::now().timestamp();

        let promoted = sqlx::query(
            r#"
            INSERT OR REPLACE INTO node_embeddings
                (chunk_id, model_name, snapshot_id, file_id, vector_hash, embedding, created_at)
            SELECT chunk_id, model_name, snapshot_id, file_id, vector_hash, embedding, ?
            FROM staging_embeddings
            WHERE snapshot_id = ? AND embedding IS NOT NULL
            "#,
        )
        .bind(now)
        .bind(snapshot_id)
        .execute(&mut *tx)
        .await?;

        sqlx::query("DELETE FROM staging_embeddings WHERE snapshot_id = ?")
            .bind(snapshot_id)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;
        Ok(promoted.rows_affected())
    }

    /// Verify the denormalized `(snapshot, file)` columns on an embedding
    /// row against the chunk's owning file. Used on insert paths and by
    /// tests.
    pub async fn embedding_denormalization_consistent(&self, snapshot_id: &str) -> StoreResult<bool> {
        let bad: i64 = sqlx::query_scalar(
            r#"
            SELECT COUNT(*) FROM node_embeddings ne
            JOIN nodes n ON n.id = ne.chunk_id
            JOIN files f ON f.id = n.file_id
            WHERE ne.snapshot_id = ?
              AND (ne.file_id != f.id OR ne.snapshot_id != f.snapshot_id)
            "#,
        )
        .bind(snapshot_id)
        .fetch_one(self.pool())
        .await?;
        Ok(bad == 0)
    }

    /// `StoreError::Conflict` when another embedding run owns the snapshot.
    pub async fn assert_staging_writable(&self, snapshot_id: &str) -> StoreResult<()> {
        let held: Option<String> =
            sqlx::query_scalar("SELECT model_name FROM embedding_runs WHERE snapshot_id = ?")
                .bind(snapshot_id)
                .fetch_optional(self.pool())
                .await?;
        match held {
            Some(model) => Err(StoreError::conflict(format!(
                "embedding run already in progress for snapshot {snapshot_id} (model {model})"
            ))),
            None => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::super::test_support::temp_store;
    use super::*;
    use crate::models::{CollectedFile, FileCategory};
    use crate::parser::RepoParser;
    use std::path::PathBuf;

    async fn snapshot_with_chunks(store: &GraphStore) -> String {
        let repo = store.ensure_repository("u", "main", "n").await.unwrap();
        let (snap, _) = store.create_snapshot(&repo, "c1", false).await.unwrap();
        let snap = snap.unwrap();
        for (path, source) in [
            ("a.py", "def foo():\n    return 1\n"),
            ("b.py", "def bar():\n    return 2\n"),
        ] {
            let file = CollectedFile {
                rel_path: path.to_string(),
                full_path: PathBuf::from(path),
                extension: ".py".to_string(),
                size_bytes: source.len() as u64,
                git_hash: None,
                category: FileCategory::Source,
            };
            let out = RepoParser::new(&snap, "c1").parse_bytes(&file, source.as_bytes());
            store.commit_parse_outputs(&[out]).await.unwrap();
        }
        snap
    }

    #[tokio::test]
    async fn test_run_coordination_is_single_writer() {
        let (_tmp, store) = temp_store().await;
        assert!(store.try_begin_embedding_run("s1", "m").await.unwrap());
        assert!(!store.try_begin_embedding_run("s1", "m").await.unwrap());
        assert!(store.assert_staging_writable("s1").await.is_err());
        store.finish_embedding_run("s1").await.unwrap();
        assert!(store.try_begin_embedding_run("s1", "m").await.unwrap());
    }

    #[tokio::test]
    async fn test_staging_roundtrip_and_promotion() {
        let (_tmp, store) = temp_store().await;
        let snap = snapshot_with_chunks(&store).await;
        store.prepare_staging().await.unwrap();

        let chunks = store
            .fetch_unembedded_chunks(&snap, "m", 100, 0)
            .await
            .unwrap();
        assert_eq!(chunks.len(), 2);

        let rows: Vec<StagedRow> = chunks
            .iter()
            .map(|c| StagedRow {
                chunk_id: c.chunk_id.clone(),
                snapshot_id: snap.clone(),
                file_id: c.file_id.clone(),
                vector_hash: format!("hash-{}", c.file_path),
                prompt: c.content.clone(),
            })
            .collect();
        store.bulk_load_staging(&rows, "m").await.unwrap();

        // Nothing in history yet: backfill recovers zero.
        assert_eq!(store.copy_cached_vectors(&snap, "m").await.unwrap(), 0);

        let delta = store.fetch_staging_delta(&snap, 10, 0).await.unwrap();
        assert_eq!(delta.len(), 2);

        let vectors: Vec<(String, Vec<u8>)> = delta
            .iter()
            .map(|r| (r.chunk_id.clone(), crate::embedding::vec_to_blob(&[1.0, 0.0])))
            .collect();
        store.write_vectors(&vectors, "m").await.unwrap();
        assert!(store.fetch_staging_delta(&snap, 10, 0).await.unwrap().is_empty());

        let promoted = store.promote_staging(&snap).await.unwrap();
        assert_eq!(promoted, 2);
        let (total, embedded) = store.count_embedding_coverage(&snap, "m").await.unwrap();
        assert_eq!(total, 2);
        assert_eq!(embedded, 2);
        assert!(store.embedding_denormalization_consistent(&snap).await.unwrap());

        // Unique per (chunk, model): at most one row each.
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM node_embeddings")
            .fetch_one(store.pool())
            .await
            .unwrap();
        assert_eq!(count, 2);
    }

    #[tokio::test]
    async fn test_backfill_from_history_by_vector_hash() {
        let (_tmp, store) = temp_store().await;
        let snap = snapshot_with_chunks(&store).await;
        store.prepare_staging().await.unwrap();

        let chunks = store.fetch_unembedded_chunks(&snap, "m", 100, 0).await.unwrap();
        let rows: Vec<StagedRow> = chunks
            .iter()
            .map(|c| StagedRow {
                chunk_id: c.chunk_id.clone(),
                snapshot_id: snap.clone(),
                file_id: c.file_id.clone(),
                vector_hash: "shared-hash".to_string(),
                prompt: c.content.clone(),
            })
            .collect();
        store.bulk_load_staging(&rows, "m").await.unwrap();

        // Seed history with the same vector_hash under another chunk.
        sqlx::query(
            "INSERT INTO node_embeddings (chunk_id, model_name, snapshot_id, file_id, vector_hash, embedding, created_at) VALUES (?, 'm', ?, ?, 'shared-hash', ?, 0)",
        )
        .bind(&chunks[0].chunk_id)
        .bind(&snap)
        .bind(&chunks[0].file_id)
        .bind(crate::embedding::vec_to_blob(&[0.5, 0.5]))
        .execute(store.pool())
        .await
        .unwrap();

        let recovered = store.copy_cached_vectors(&snap, "m").await.unwrap();
        assert_eq!(recovered, 2);
        assert!(store.fetch_staging_delta(&snap, 10, 0).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_errored_rows_leave_the_delta() {
        let (_tmp, store) = temp_store().await;
        let snap = snapshot_with_chunks(&store).await;
        store.prepare_staging().await.unwrap();

        let chunks = store.fetch_unembedded_chunks(&snap, "m", 100, 0).await.unwrap();
        let rows: Vec<StagedRow> = chunks
            .iter()
            .map(|c| StagedRow {
                chunk_id: c.chunk_id.clone(),
                snapshot_id: snap.clone(),
                file_id: c.file_id.clone(),
                vector_hash: c.chunk_id.clone(),
                prompt: c.content.clone(),
            })
            .collect();
        store.bulk_load_staging(&rows, "m").await.unwrap();

        store
            .mark_staging_errored(&[rows[0].chunk_id.clone()], "m")
            .await
            .unwrap();
        let delta = store.fetch_staging_delta(&snap, 10, 0).await.unwrap();
        assert_eq!(delta.len(), 1);
        assert_eq!(delta[0].chunk_id, rows[1].chunk_id);
    }
}
