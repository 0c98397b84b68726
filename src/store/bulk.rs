//! Bulk ingest paths.
//!
//! All writers here apply set semantics: re-inserting the same row is a
//! no-op (or a targeted upsert), so a retried worker batch cannot
//! duplicate data. A full parse batch commits in one transaction, which
//! makes every file's chunks, contents, and intra-file edges appear
//! together.

use sqlx::{Row, Sqlite, Transaction};
use uuid::Uuid;

use super::GraphStore;
use crate::error::{StoreError, StoreResult};
use crate::models::{
    ChunkContent, ChunkMetadata, ChunkNode, CodeRelation, EdgeRecord, FileRecord, FtsDoc,
    ParseOutput,
};

/// Counters reported by cross-file relation ingestion.
#[derive(Debug, Clone, Copy, Default)]
pub struct RelationReport {
    pub resolved: u64,
    pub file_fallback: u64,
    pub dropped: u64,
}

impl GraphStore {
    /// Commit a batch of parse outputs atomically.
    pub async fn commit_parse_outputs(&self, outputs: &[ParseOutput]) -> StoreResult<()> {
        if outputs.is_empty() {
            return Ok(());
        }
        let mut tx = self.pool().begin().await?;
        for output in outputs {
            insert_file(&mut tx, &output.file).await?;
            for content in &output.contents {
                insert_content(&mut tx, content).await?;
            }
            for node in &output.nodes {
                insert_node(&mut tx, node).await?;
            }
            for edge in &output.edges {
                insert_edge(&mut tx, edge).await?;
            }
            for doc in &output.fts {
                insert_fts(&mut tx, doc).await?;
            }
        }
        tx.commit().await?;
        Ok(())
    }

    pub async fn add_files(&self, files: &[FileRecord]) -> StoreResult<()> {
        let mut tx = self.pool().begin().await?;
        for file in files {
            insert_file(&mut tx, file).await?;
        }
        tx.commit().await?;
        Ok(())
    }

    pub async fn add_contents(&self, contents: &[ChunkContent]) -> StoreResult<()> {
        let mut tx = self.pool().begin().await?;
        for content in contents {
            insert_content(&mut tx, content).await?;
        }
        tx.commit().await?;
        Ok(())
    }

    pub async fn add_chunks(&self, nodes: &[ChunkNode]) -> StoreResult<()> {
        let mut tx = self.pool().begin().await?;
        for node in nodes {
            insert_node(&mut tx, node).await?;
        }
        tx.commit().await?;
        Ok(())
    }

    pub async fn add_edges(&self, edges: &[EdgeRecord]) -> StoreResult<()> {
        let mut tx = self.pool().begin().await?;
        for edge in edges {
            insert_edge(&mut tx, edge).await?;
        }
        tx.commit().await?;
        Ok(())
    }

    pub async fn add_fts(&self, docs: &[FtsDoc]) -> StoreResult<()> {
        let mut tx = self.pool().begin().await?;
        for doc in docs {
            insert_fts(&mut tx, doc).await?;
        }
        tx.commit().await?;
        Ok(())
    }

    /// Find a prior successfully parsed file record with this Git blob
    /// hash, most recent first. Used by the orchestrator's cache-first
    /// split to skip parse work for unchanged content.
    pub async fn find_cached_file(&self, git_hash: &str) -> StoreResult<Option<String>> {
        let id: Option<String> = sqlx::query_scalar(
            r#"
            SELECT f.id FROM files f
            JOIN snapshots s ON s.id = f.snapshot_id
            WHERE f.file_hash = ? AND f.parsing_status = 'success'
              AND s.status = 'completed'
            ORDER BY f.indexed_at DESC LIMIT 1
            "#,
        )
        .bind(git_hash)
        .fetch_optional(self.pool())
        .await?;
        Ok(id)
    }

    /// Re-attach a previously parsed file to a new snapshot without
    /// re-parsing: clone the file row, its chunks (fresh ids), intra-file
    /// edges, and lexical entries. Contents are shared by hash and need no
    /// copy — that is the content-addressing payoff.
    pub async fn reattach_file(
        &self,
        prior_file_id: &str,
        new_snapshot_id: &str,
        new_path: &str,
        commit_hash: &str,
    ) -> StoreResult<()> {
        let mut tx = self.pool().begin().await?;

        let file_row = sqlx::query("SELECT * FROM files WHERE id = ?")
            .bind(prior_file_id)
            .fetch_optional(&mut *tx)
            .await?
            .ok_or_else(|| StoreError::not_found(format!("file {prior_file_id}")))?;

        let new_file_id = Uuid::new_v4().to_string();
        sqlx::query(
            r#"
            INSERT INTO files (id, snapshot_id, path, file_hash, content_hash, commit_hash,
                               language, size_bytes, category, indexed_at, parsing_status, parsing_error)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(snapshot_id, path) DO NOTHING
            "#,
        )
        .bind(&new_file_id)
        .bind(new_snapshot_id)
        .bind(new_path)
        .bind(file_row.get::<Option<String>, _>("file_hash"))
        .bind(file_row.get::<Option<String>, _>("content_hash"))
        .bind(commit_hash)
        .bind(file_row.get::<String, _>("language"))
        .bind(file_row.get::<i64, _>("size_bytes"))
        .bind(file_row.get::<String, _>("category"))
        .bind(chrono::Utc::now().timestamp())
        .bind(file_row.get::<String, _>("parsing_status"))
        .bind(file_row.get::<Option<String>, _>("parsing_error"))
        .execute(&mut *tx)
        .await?;

        let node_rows = sqlx::query(
            "SELECT id, chunk_hash, start_line, end_line, byte_start, byte_end, metadata FROM nodes WHERE file_id = ?",
        )
        .bind(prior_file_id)
        .fetch_all(&mut *tx)
        .await?;

        let mut id_map: std::collections::HashMap<String, String> = std::collections::HashMap::new();
        for row in &node_rows {
            let old_id: String = row.get("id");
            let new_id = Uuid::new_v4().to_string();
            let byte_start: i64 = row.get("byte_start");
            let byte_end: i64 = row.get("byte_end");
            sqlx::query(
                r#"
                INSERT INTO nodes (id, file_id, file_path, chunk_hash, start_line, end_line,
                                   byte_start, byte_end, size, metadata)
                VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
                ON CONFLICT(file_id, byte_start, byte_end) DO NOTHING
                "#,
            )
            .bind(&new_id)
            .bind(&new_file_id)
            .bind(new_path)
            .bind(row.get::<String, _>("chunk_hash"))
            .bind(row.get::<i64, _>("start_line"))
            .bind(row.get::<i64, _>("end_line"))
            .bind(byte_start)
            .bind(byte_end)
            .bind(byte_end - byte_start)
            .bind(row.get::<String, _>("metadata"))
            .execute(&mut *tx)
            .await?;
            id_map.insert(old_id, new_id);
        }

        let edge_rows = sqlx::query(
            r#"
            SELECT e.source_id, e.target_id, e.relation_type, e.metadata
            FROM edges e
            JOIN nodes s ON s.id = e.source_id
            JOIN nodes t ON t.id = e.target_id
            WHERE s.file_id = ? AND t.file_id = ?
            "#,
        )
        .bind(prior_file_id)
        .bind(prior_file_id)
        .fetch_all(&mut *tx)
        .await?;
        for row in &edge_rows {
            let source: String = row.get("source_id");
            let target: String = row.get("target_id");
            let (Some(new_source), Some(new_target)) = (id_map.get(&source), id_map.get(&target))
            else {
                continue;
            };
            sqlx::query(
                "INSERT OR IGNORE INTO edges (source_id, target_id, relation_type, metadata) VALUES (?, ?, ?, ?)",
            )
            .bind(new_source)
            .bind(new_target)
            .bind(row.get::<String, _>("relation_type"))
            .bind(row.get::<String, _>("metadata"))
            .execute(&mut *tx)
            .await?;
        }

        let fts_rows = sqlx::query("SELECT chunk_id, tags, content FROM nodes_fts WHERE chunk_id IN (SELECT id FROM nodes WHERE file_id = ?)")
            .bind(prior_file_id)
            .fetch_all(&mut *tx)
            .await?;
        for row in &fts_rows {
            let old_id: String = row.get("chunk_id");
            let Some(new_id) = id_map.get(&old_id) else {
                continue;
            };
            sqlx::query("INSERT INTO nodes_fts (chunk_id, tags, content) VALUES (?, ?, ?)")
                .bind(new_id)
                .bind(row.get::<String, _>("tags"))
                .bind(row.get::<String, _>("content"))
                .execute(&mut *tx)
                .await?;
        }

        tx.commit().await?;
        Ok(())
    }

    /// Ingest externally produced cross-file relations.
    ///
    /// Each endpoint resolves to the smallest chunk whose byte range
    /// contains the given range (exact matches are the smallest by
    /// definition). Endpoints that miss every chunk land on the file's
    /// pseudo-node; rows naming unknown files are dropped and counted.
    /// Duplicate `(source, target, kind)` triples collapse; self-loops are
    /// skipped.
    pub async fn ingest_cross_file_relations(
        &self,
        snapshot_id: &str,
        rows: &[CodeRelation],
    ) -> StoreResult<RelationReport> {
        let mut report = RelationReport::default();
        let mut tx = self.pool().begin().await?;

        for rel in rows {
            let source = resolve_endpoint(
                &mut tx,
                snapshot_id,
                &rel.source_path,
                rel.source_range,
                &mut report,
            )
            .await?;
            let target = resolve_endpoint(
                &mut tx,
                snapshot_id,
                &rel.target_path,
                rel.target_range,
                &mut report,
            )
            .await?;

            let (Some(source), Some(target)) = (source, target) else {
                report.dropped += 1;
                continue;
            };
            if source == target {
                continue;
            }

            let inserted = sqlx::query(
                "INSERT OR IGNORE INTO edges (source_id, target_id, relation_type, metadata) VALUES (?, ?, ?, ?)",
            )
            .bind(&source)
            .bind(&target)
            .bind(rel.relation.as_str())
            .bind(rel.metadata.to_string())
            .execute(&mut *tx)
            .await?;
            if inserted.rows_affected() > 0 {
                report.resolved += 1;
            }
        }

        tx.commit().await?;
        if report.dropped > 0 {
            tracing::warn!(
                dropped = report.dropped,
                "cross-file relations referenced unknown files"
            );
        }
        Ok(report)
    }
}

async fn insert_file(tx: &mut Transaction<'_, Sqlite>, file: &FileRecord) -> StoreResult<()> {
    sqlx::query(
        r#"
        INSERT INTO files (id, snapshot_id, path, file_hash, content_hash, commit_hash,
                           language, size_bytes, category, indexed_at, parsing_status, parsing_error)
        VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
        ON CONFLICT(snapshot_id, path) DO UPDATE SET
            file_hash = excluded.file_hash,
            content_hash = excluded.content_hash,
            parsing_status = excluded.parsing_status,
            parsing_error = excluded.parsing_error
        "#,
    )
    .bind(&file.id)
    .bind(&file.snapshot_id)
    .bind(&file.path)
    .bind(&file.file_hash)
    .bind(&file.content_hash)
    .bind(&file.commit_hash)
    .bind(&file.language)
    .bind(file.size_bytes)
    .bind(&file.category)
    .bind(file.indexed_at)
    .bind(file.parsing_status.as_str())
    .bind(&file.parsing_error)
    .execute(&mut **tx)
    .await?;
    Ok(())
}

async fn insert_content(tx: &mut Transaction<'_, Sqlite>, content: &ChunkContent) -> StoreResult<()> {
    sqlx::query(
        "INSERT OR IGNORE INTO contents (chunk_hash, content, size_bytes) VALUES (?, ?, ?)",
    )
    .bind(&content.chunk_hash)
    .bind(&content.content)
    .bind(content.content.len() as i64)
    .execute(&mut **tx)
    .await?;
    Ok(())
}

async fn insert_node(tx: &mut Transaction<'_, Sqlite>, node: &ChunkNode) -> StoreResult<()> {
    let metadata = serde_json::to_string(&node.metadata).unwrap_or_else(|_| "{}".to_string());
    sqlx::query(
        r#"
        INSERT INTO nodes (id, file_id, file_path, chunk_hash, start_line, end_line,
                           byte_start, byte_end, size, metadata)
        VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
        ON CONFLICT(file_id, byte_start, byte_end) DO NOTHING
        "#,
    )
    .bind(&node.id)
    .bind(&node.file_id)
    .bind(&node.file_path)
    .bind(&node.chunk_hash)
    .bind(node.start_line)
    .bind(node.end_line)
    .bind(node.byte_start)
    .bind(node.byte_end)
    .bind(node.byte_end - node.byte_start)
    .bind(metadata)
    .execute(&mut **tx)
    .await?;
    Ok(())
}

async fn insert_edge(tx: &mut Transaction<'_, Sqlite>, edge: &EdgeRecord) -> StoreResult<()> {
    sqlx::query(
        "INSERT OR IGNORE INTO edges (source_id, target_id, relation_type, metadata) VALUES (?, ?, ?, ?)",
    )
    .bind(&edge.source_id)
    .bind(&edge.target_id)
    .bind(edge.relation.as_str())
    .bind(edge.metadata.to_string())
    .execute(&mut **tx)
    .await?;
    Ok(())
}

async fn insert_fts(tx: &mut Transaction<'_, Sqlite>, doc: &FtsDoc) -> StoreResult<()> {
    // The FTS table has no unique constraint; delete-then-insert keeps one
    // entry per chunk.
    sqlx::query("DELETE FROM nodes_fts WHERE chunk_id = ?")
        .bind(&doc.chunk_id)
        .execute(&mut **tx)
        .await?;
    sqlx::query("INSERT INTO nodes_fts (chunk_id, tags, content) VALUES (?, ?, ?)")
        .bind(&doc.chunk_id)
        .bind(&doc.tags)
        .bind(&doc.content)
        .execute(&mut **tx)
        .await?;
    Ok(())
}

/// Resolve one relation endpoint inside a transaction.
async fn resolve_endpoint(
    tx: &mut Transaction<'_, Sqlite>,
    snapshot_id: &str,
    path: &str,
    range: (i64, i64),
    report: &mut RelationReport,
) -> StoreResult<Option<String>> {
    let chunk: Option<String> = sqlx::query_scalar(
        r#"
        SELECT n.id FROM nodes n
        JOIN files f ON f.id = n.file_id
        WHERE f.snapshot_id = ? AND f.path = ?
          AND n.byte_start <= ? AND n.byte_end >= ?
          AND json_extract(n.metadata, '$.pseudo') IS NULL
        ORDER BY n.size ASC LIMIT 1
        "#,
    )
    .bind(snapshot_id)
    .bind(path)
    .bind(range.0)
    .bind(range.1)
    .fetch_optional(&mut **tx)
    .await?;

    if let Some(id) = chunk {
        return Ok(Some(id));
    }

    // No containing chunk: fall back to the file-level pseudo-node,
    // created lazily. Unknown files resolve to nothing.
    let file_id: Option<String> =
        sqlx::query_scalar("SELECT id FROM files WHERE snapshot_id = ? AND path = ?")
            .bind(snapshot_id)
            .bind(path)
            .fetch_optional(&mut **tx)
            .await?;
    let Some(file_id) = file_id else {
        return Ok(None);
    };

    let existing: Option<String> = sqlx::query_scalar(
        "SELECT id FROM nodes WHERE file_id = ? AND json_extract(metadata, '$.pseudo') = 'file'",
    )
    .bind(&file_id)
    .fetch_optional(&mut **tx)
    .await?;
    if let Some(id) = existing {
        report.file_fallback += 1;
        return Ok(Some(id));
    }

    let pseudo = ChunkNode {
        id: Uuid::new_v4().to_string(),
        file_id: file_id.clone(),
        file_path: path.to_string(),
        chunk_hash: String::new(),
        start_line: 0,
        end_line: 0,
        byte_start: 0,
        byte_end: 0,
        metadata: ChunkMetadata {
            pseudo: Some("file".to_string()),
            ..Default::default()
        },
    };
    // The zero-width range may collide with another pseudo insert; reuse it.
    insert_node(tx, &pseudo).await?;
    let id: String = sqlx::query_scalar(
        "SELECT id FROM nodes WHERE file_id = ? AND byte_start = 0 AND byte_end = 0",
    )
    .bind(&file_id)
    .fetch_one(&mut **tx)
    .await?;
    report.file_fallback += 1;
    Ok(Some(id))
}

#[cfg(test)]
mod tests {
    use super::super::test_support::temp_store;
    use super::*;
    use crate::models::{FileCategory, CollectedFile, RelationKind};
    use crate::parser::RepoParser;
    use std::path::PathBuf;

    async fn seeded_snapshot(store: &GraphStore) -> (String, String) {
        let repo = store.ensure_repository("u", "main", "n").await.unwrap();
        let (snap, _) = store.create_snapshot(&repo, "c1", false).await.unwrap();
        (repo, snap.unwrap())
    }

    fn parse(snapshot: &str, path: &str, source: &str) -> ParseOutput {
        let file = CollectedFile {
            rel_path: path.to_string(),
            full_path: PathBuf::from(path),
            extension: format!(".{}", path.rsplit('.').next().unwrap()),
            size_bytes: source.len() as u64,
            git_hash: None,
            category: FileCategory::Source,
        };
        RepoParser::new(snapshot, "c1").parse_bytes(&file, source.as_bytes())
    }

    #[tokio::test]
    async fn test_commit_parse_outputs_is_idempotent() {
        let (_tmp, store) = temp_store().await;
        let (_repo, snap) = seeded_snapshot(&store).await;

        let out = parse(&snap, "a.py", "def foo():\n    return 1\n");
        store.commit_parse_outputs(&[out.clone()]).await.unwrap();
        store.commit_parse_outputs(&[out]).await.unwrap();

        let nodes: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM nodes")
            .fetch_one(store.pool())
            .await
            .unwrap();
        assert_eq!(nodes, 1);
        let contents: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM contents")
            .fetch_one(store.pool())
            .await
            .unwrap();
        assert_eq!(contents, 1);
    }

    #[tokio::test]
    async fn test_cross_file_relations_resolve_to_smallest_chunk() {
        let (_tmp, store) = temp_store().await;
        let (_repo, snap) = seeded_snapshot(&store).await;

        let a = parse(&snap, "a.py", "def foo():\n    return 1\n");
        let b = parse(&snap, "b.py", "from a import foo\n\nresult = foo()\n");
        let a_node = a.nodes[0].id.clone();
        let b_node = b.nodes[0].id.clone();
        store.commit_parse_outputs(&[a, b]).await.unwrap();

        let report = store
            .ingest_cross_file_relations(
                &snap,
                &[CodeRelation {
                    source_path: "b.py".into(),
                    source_range: (28, 31),
                    target_path: "a.py".into(),
                    target_range: (4, 7),
                    relation: RelationKind::Calls,
                    metadata: serde_json::json!({"symbol": "foo"}),
                }],
            )
            .await
            .unwrap();
        assert_eq!(report.resolved, 1);
        assert_eq!(report.dropped, 0);

        let edge = sqlx::query("SELECT source_id, target_id FROM edges WHERE relation_type = 'calls'")
            .fetch_one(store.pool())
            .await
            .unwrap();
        assert_eq!(edge.get::<String, _>("source_id"), b_node);
        assert_eq!(edge.get::<String, _>("target_id"), a_node);
    }

    #[tokio::test]
    async fn test_unresolved_endpoint_lands_on_file_pseudo_node() {
        let (_tmp, store) = temp_store().await;
        let (_repo, snap) = seeded_snapshot(&store).await;

        // A markdown file has no chunks at all.
        let md = parse(&snap, "notes.md", "# notes\n");
        let py = parse(&snap, "a.py", "def foo():\n    return 1\n");
        store.commit_parse_outputs(&[md, py]).await.unwrap();

        let report = store
            .ingest_cross_file_relations(
                &snap,
                &[CodeRelation {
                    source_path: "a.py".into(),
                    source_range: (4, 7),
                    target_path: "notes.md".into(),
                    target_range: (0, 5),
                    relation: RelationKind::References,
                    metadata: serde_json::json!({}),
                }],
            )
            .await
            .unwrap();
        assert_eq!(report.resolved, 1);
        assert_eq!(report.file_fallback, 1);

        let pseudo: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM nodes WHERE json_extract(metadata, '$.pseudo') = 'file'",
        )
        .fetch_one(store.pool())
        .await
        .unwrap();
        assert_eq!(pseudo, 1);
    }

    #[tokio::test]
    async fn test_unknown_file_is_dropped_with_count() {
        let (_tmp, store) = temp_store().await;
        let (_repo, snap) = seeded_snapshot(&store).await;
        let py = parse(&snap, "a.py", "def foo():\n    return 1\n");
        store.commit_parse_outputs(&[py]).await.unwrap();

        let report = store
            .ingest_cross_file_relations(
                &snap,
                &[CodeRelation {
                    source_path: "a.py".into(),
                    source_range: (4, 7),
                    target_path: "ghost.py".into(),
                    target_range: (0, 5),
                    relation: RelationKind::Calls,
                    metadata: serde_json::json!({}),
                }],
            )
            .await
            .unwrap();
        assert_eq!(report.resolved, 0);
        assert_eq!(report.dropped, 1);
    }

    #[tokio::test]
    async fn test_duplicate_relations_collapse() {
        let (_tmp, store) = temp_store().await;
        let (_repo, snap) = seeded_snapshot(&store).await;
        let a = parse(&snap, "a.py", "def foo():\n    return 1\n");
        let b = parse(&snap, "b.py", "from a import foo\n\nresult = foo()\n");
        store.commit_parse_outputs(&[a, b]).await.unwrap();

        let rel = CodeRelation {
            source_path: "b.py".into(),
            source_range: (28, 31),
            target_path: "a.py".into(),
            target_range: (4, 7),
            relation: RelationKind::Calls,
            metadata: serde_json::json!({"symbol": "foo"}),
        };
        store
            .ingest_cross_file_relations(&snap, &[rel.clone(), rel])
            .await
            .unwrap();

        let edges: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM edges WHERE relation_type = 'calls'")
            .fetch_one(store.pool())
            .await
            .unwrap();
        assert_eq!(edges, 1);
    }

    #[tokio::test]
    async fn test_reattach_file_clones_structure_without_reparse() {
        let (_tmp, store) = temp_store().await;
        let repo = store.ensure_repository("u", "main", "n").await.unwrap();
        let (snap1, _) = store.create_snapshot(&repo, "c1", false).await.unwrap();
        let snap1 = snap1.unwrap();

        let mut out = parse(&snap1, "a.py", "def foo():\n    return 1\n");
        out.file.file_hash = Some("b".repeat(40));
        let prior_file_id = out.file.id.clone();
        store.commit_parse_outputs(&[out]).await.unwrap();
        store
            .activate_snapshot(&repo, &snap1, &serde_json::json!({}), &serde_json::json!({}))
            .await
            .unwrap();

        let found = store.find_cached_file(&"b".repeat(40)).await.unwrap();
        assert_eq!(found.as_deref(), Some(prior_file_id.as_str()));

        let (snap2, _) = store.create_snapshot(&repo, "c2", true).await.unwrap();
        let snap2 = snap2.unwrap();
        store
            .reattach_file(&prior_file_id, &snap2, "a.py", "c2")
            .await
            .unwrap();

        let files: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM files WHERE snapshot_id = ?")
            .bind(&snap2)
            .fetch_one(store.pool())
            .await
            .unwrap();
        assert_eq!(files, 1);
        let nodes: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM nodes n JOIN files f ON f.id = n.file_id WHERE f.snapshot_id = ?",
        )
        .bind(&snap2)
        .fetch_one(store.pool())
        .await
        .unwrap();
        assert_eq!(nodes, 1);
        // Content is shared, not duplicated.
        let contents: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM contents")
            .fetch_one(store.pool())
            .await
            .unwrap();
        assert_eq!(contents, 1);
    }
}
