//! Graph reads: neighbor lookups, reference traversal, and snapshot file
//! access.

use sqlx::Row;
use std::collections::HashMap;

use super::GraphStore;
use crate::error::{StoreError, StoreResult};
use crate::models::{ChunkMetadata, NavHints, NavNode};

/// A chunk with its content, as returned by navigation reads.
#[derive(Debug, Clone)]
pub struct ChunkDetail {
    pub id: String,
    pub file_path: String,
    pub start_line: i64,
    pub end_line: i64,
    pub content: String,
    pub metadata: ChunkMetadata,
}

/// An edge endpoint with location, for impact/dependency listings.
#[derive(Debug, Clone, serde::Serialize)]
pub struct EdgeEndpoint {
    pub node_id: String,
    pub file_path: String,
    pub start_line: i64,
    pub relation: String,
    pub symbol: Option<String>,
}

/// Parents and outgoing calls around one chunk.
#[derive(Debug, Clone, Default)]
pub struct ContextNeighbors {
    pub parents: Vec<ChunkDetail>,
    pub calls: Vec<EdgeEndpoint>,
}

impl GraphStore {
    /// Structural parent (via `child_of`) plus outgoing call/reference
    /// edges for one chunk.
    pub async fn get_context_neighbors(&self, chunk_id: &str) -> StoreResult<ContextNeighbors> {
        let mut neighbors = ContextNeighbors::default();

        let parent_rows = sqlx::query(
            r#"
            SELECT t.id, t.file_path, t.start_line, t.end_line, t.metadata, c.content
            FROM edges e
            JOIN nodes t ON t.id = e.target_id
            LEFT JOIN contents c ON c.chunk_hash = t.chunk_hash
            WHERE e.source_id = ? AND e.relation_type = 'child_of'
            "#,
        )
        .bind(chunk_id)
        .fetch_all(self.pool())
        .await?;
        for row in &parent_rows {
            neighbors.parents.push(ChunkDetail {
                id: row.get("id"),
                file_path: row.get("file_path"),
                start_line: row.get("start_line"),
                end_line: row.get("end_line"),
                content: row.get::<Option<String>, _>("content").unwrap_or_default(),
                metadata: parse_metadata(row.get("metadata")),
            });
        }

        let call_rows = sqlx::query(
            r#"
            SELECT t.id, t.file_path, t.start_line, e.relation_type, e.metadata
            FROM edges e
            JOIN nodes t ON t.id = e.target_id
            WHERE e.source_id = ? AND e.relation_type IN ('calls', 'references', 'defines')
            LIMIT 20
            "#,
        )
        .bind(chunk_id)
        .fetch_all(self.pool())
        .await?;
        for row in &call_rows {
            neighbors.calls.push(edge_endpoint(row));
        }

        Ok(neighbors)
    }

    /// "Who calls this?" — incoming reference edges, ordered by location.
    pub async fn get_incoming_references(
        &self,
        chunk_id: &str,
        limit: i64,
    ) -> StoreResult<Vec<EdgeEndpoint>> {
        let rows = sqlx::query(
            r#"
            SELECT s.id, s.file_path, s.start_line, e.relation_type, e.metadata
            FROM edges e
            JOIN nodes s ON s.id = e.source_id
            WHERE e.target_id = ?
              AND e.relation_type IN ('calls', 'references', 'imports', 'instantiates')
            ORDER BY s.file_path, s.start_line
            LIMIT ?
            "#,
        )
        .bind(chunk_id)
        .bind(limit)
        .fetch_all(self.pool())
        .await?;
        Ok(rows.iter().map(edge_endpoint).collect())
    }

    /// "What does this call?" — outgoing call edges, ordered by location.
    pub async fn get_outgoing_calls(
        &self,
        chunk_id: &str,
        limit: i64,
    ) -> StoreResult<Vec<EdgeEndpoint>> {
        let rows = sqlx::query(
            r#"
            SELECT t.id, t.file_path, t.start_line, e.relation_type, e.metadata
            FROM edges e
            JOIN nodes t ON t.id = e.target_id
            WHERE e.source_id = ?
              AND e.relation_type IN ('calls', 'instantiates', 'imports')
            ORDER BY t.file_path, t.start_line
            LIMIT ?
            "#,
        )
        .bind(chunk_id)
        .bind(limit)
        .fetch_all(self.pool())
        .await?;
        Ok(rows.iter().map(edge_endpoint).collect())
    }

    /// The chunk directly before or after this one in the same file.
    pub async fn get_neighbor_chunk(
        &self,
        chunk_id: &str,
        direction: &str,
    ) -> StoreResult<Option<ChunkDetail>> {
        let current = sqlx::query("SELECT file_id, byte_start, byte_end FROM nodes WHERE id = ?")
            .bind(chunk_id)
            .fetch_optional(self.pool())
            .await?;
        let Some(current) = current else {
            return Ok(None);
        };
        let file_id: String = current.get("file_id");
        let byte_start: i64 = current.get("byte_start");
        let byte_end: i64 = current.get("byte_end");

        let sql = match direction {
            "next" => {
                r#"
                SELECT n.id, n.file_path, n.start_line, n.end_line, n.metadata, c.content
                FROM nodes n JOIN contents c ON c.chunk_hash = n.chunk_hash
                WHERE n.file_id = ? AND n.byte_start >= ? AND n.id != ?
                  AND json_extract(n.metadata, '$.pseudo') IS NULL
                ORDER BY n.byte_start ASC LIMIT 1
                "#
            }
            "prev" => {
                r#"
                SELECT n.id, n.file_path, n.start_line, n.end_line, n.metadata, c.content
                FROM nodes n JOIN contents c ON c.chunk_hash = n.chunk_hash
                WHERE n.file_id = ? AND n.byte_end <= ? AND n.id != ?
                  AND json_extract(n.metadata, '$.pseudo') IS NULL
                ORDER BY n.byte_end DESC LIMIT 1
                "#
            }
            other => {
                return Err(StoreError::state(format!(
                    "direction must be 'next' or 'prev', got '{other}'"
                )))
            }
        };
        let boundary = if direction == "next" { byte_end } else { byte_start };

        let row = sqlx::query(sql)
            .bind(&file_id)
            .bind(boundary)
            .bind(chunk_id)
            .fetch_optional(self.pool())
            .await?;
        Ok(row.map(|row| ChunkDetail {
            id: row.get("id"),
            file_path: row.get("file_path"),
            start_line: row.get("start_line"),
            end_line: row.get("end_line"),
            content: row.get("content"),
            metadata: parse_metadata(row.get("metadata")),
        }))
    }

    /// Lightweight prev/next/parent labels for navigation hints.
    pub async fn get_neighbor_metadata(&self, chunk_id: &str) -> StoreResult<NavHints> {
        let mut hints = NavHints::default();

        if let Some(next) = self.get_neighbor_chunk(chunk_id, "next").await? {
            hints.next = Some(NavNode {
                id: next.id,
                label: next.metadata.primary_label(),
            });
        }
        if let Some(prev) = self.get_neighbor_chunk(chunk_id, "prev").await? {
            hints.prev = Some(NavNode {
                id: prev.id,
                label: prev.metadata.primary_label(),
            });
        }
        let neighbors = self.get_context_neighbors(chunk_id).await?;
        if let Some(parent) = neighbors.parents.first() {
            hints.parent = Some(NavNode {
                id: parent.id.clone(),
                label: parent.metadata.primary_label(),
            });
        }

        Ok(hints)
    }

    pub async fn list_file_paths(&self, snapshot_id: &str) -> StoreResult<Vec<String>> {
        let paths: Vec<String> =
            sqlx::query_scalar("SELECT path FROM files WHERE snapshot_id = ? ORDER BY path")
                .bind(snapshot_id)
                .fetch_all(self.pool())
                .await?;
        Ok(paths)
    }

    pub async fn get_snapshot_manifest(&self, snapshot_id: &str) -> StoreResult<serde_json::Value> {
        let raw: Option<String> =
            sqlx::query_scalar("SELECT file_manifest FROM snapshots WHERE id = ?")
                .bind(snapshot_id)
                .fetch_optional(self.pool())
                .await?;
        let raw = raw.ok_or_else(|| StoreError::not_found(format!("snapshot {snapshot_id}")))?;
        Ok(serde_json::from_str(&raw).unwrap_or_else(|_| serde_json::json!({})))
    }

    /// Reconstruct file text from chunks in byte order, optionally sliced
    /// to a 1-based inclusive line range.
    ///
    /// Files that were skipped or failed have no chunks; their full text is
    /// served from the content row linked via `files.content_hash`.
    /// Returns `None` when the path does not exist in the snapshot, and an
    /// empty string for a known file with neither chunks nor stored text.
    pub async fn get_file_content_range(
        &self,
        snapshot_id: &str,
        file_path: &str,
        start_line: Option<i64>,
        end_line: Option<i64>,
    ) -> StoreResult<Option<String>> {
        let file = sqlx::query("SELECT id, content_hash FROM files WHERE snapshot_id = ? AND path = ?")
            .bind(snapshot_id)
            .bind(file_path)
            .fetch_optional(self.pool())
            .await?;
        let Some(file) = file else {
            return Ok(None);
        };
        let file_id: String = file.get("id");

        let rows = sqlx::query(
            r#"
            SELECT c.content, n.start_line
            FROM nodes n JOIN contents c ON c.chunk_hash = n.chunk_hash
            WHERE n.file_id = ? AND json_extract(n.metadata, '$.pseudo') IS NULL
            ORDER BY n.byte_start ASC
            "#,
        )
        .bind(&file_id)
        .fetch_all(self.pool())
        .await?;

        let (full_text, first_line) = if rows.is_empty() {
            let content_hash: Option<String> = file.get("content_hash");
            let Some(hash) = content_hash else {
                return Ok(Some(String::new()));
            };
            let text: Option<String> =
                sqlx::query_scalar("SELECT content FROM contents WHERE chunk_hash = ?")
                    .bind(&hash)
                    .fetch_optional(self.pool())
                    .await?;
            (text.unwrap_or_default(), 1)
        } else {
            let mut buf = String::new();
            for (i, row) in rows.iter().enumerate() {
                let content: String = row.get("content");
                if i > 0 && !buf.ends_with('\n') {
                    buf.push('\n');
                }
                buf.push_str(&content);
            }
            (buf, rows[0].get::<i64, _>("start_line"))
        };

        if start_line.is_none() && end_line.is_none() {
            return Ok(Some(full_text));
        }

        let lines: Vec<&str> = full_text.split_inclusive('\n').collect();
        let from = start_line
            .map(|s| (s - first_line).max(0) as usize)
            .unwrap_or(0);
        let to = end_line
            .map(|e| ((e - first_line + 1).max(0) as usize).min(lines.len()))
            .unwrap_or(lines.len());
        if from >= to {
            return Ok(Some(String::new()));
        }
        Ok(Some(lines[from..to].concat()))
    }
}

fn edge_endpoint(row: &sqlx::sqlite::SqliteRow) -> EdgeEndpoint {
    let metadata: String = row.get("metadata");
    let symbol = serde_json::from_str::<HashMap<String, serde_json::Value>>(&metadata)
        .ok()
        .and_then(|m| m.get("symbol").and_then(|s| s.as_str().map(String::from)));
    EdgeEndpoint {
        node_id: row.get("id"),
        file_path: row.get("file_path"),
        start_line: row.get("start_line"),
        relation: row.get("relation_type"),
        symbol,
    }
}

fn parse_metadata(raw: String) -> ChunkMetadata {
    serde_json::from_str(&raw).unwrap_or_default()
}
