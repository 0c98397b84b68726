//! Vector and lexical search.
//!
//! Both paths scope strictly to one snapshot and apply metadata filters
//! **before** ranking: lexical search filters inside the SQL query, vector
//! search filters the candidate rows before distances are computed.
//!
//! Vector ranking is exact cosine distance over the snapshot's stored
//! vectors (little-endian `f32` BLOBs, cosine-normalized at write time).

use sqlx::Row;
use std::collections::HashMap;

use super::GraphStore;
use crate::embedding::{blob_to_vec, cosine_similarity};
use crate::error::StoreResult;
use crate::models::ChunkMetadata;
use crate::parser::fts;

/// Optional metadata filters. Values within a key are OR'd; negative keys
/// are AND'd against the rest.
#[derive(Debug, Clone, Default)]
pub struct FilterSet {
    pub language: Vec<String>,
    pub exclude_language: Vec<String>,
    pub category: Vec<String>,
    pub exclude_category: Vec<String>,
    pub role: Vec<String>,
    pub exclude_role: Vec<String>,
    pub path_prefix: Vec<String>,
}

impl FilterSet {
    pub fn is_empty(&self) -> bool {
        self.language.is_empty()
            && self.exclude_language.is_empty()
            && self.category.is_empty()
            && self.exclude_category.is_empty()
            && self.role.is_empty()
            && self.exclude_role.is_empty()
            && self.path_prefix.is_empty()
    }

    /// Render `AND ...` clauses against `files f` / `nodes n` aliases.
    /// Returns the SQL fragment and its bind values in order.
    fn to_sql(&self) -> (String, Vec<String>) {
        let mut clauses = Vec::new();
        let mut params = Vec::new();

        if !self.path_prefix.is_empty() {
            let ors: Vec<&str> = self.path_prefix.iter().map(|_| "f.path LIKE ?").collect();
            clauses.push(format!("({})", ors.join(" OR ")));
            for p in &self.path_prefix {
                params.push(format!("{}%", p.trim_end_matches('/')));
            }
        }
        if !self.language.is_empty() {
            let marks = vec!["?"; self.language.len()].join(", ");
            clauses.push(format!("f.language IN ({})", marks));
            params.extend(self.language.iter().cloned());
        }
        if !self.exclude_language.is_empty() {
            let marks = vec!["?"; self.exclude_language.len()].join(", ");
            clauses.push(format!("f.language NOT IN ({})", marks));
            params.extend(self.exclude_language.iter().cloned());
        }
        if !self.category.is_empty() {
            let marks = vec!["?"; self.category.len()].join(", ");
            clauses.push(format!("f.category IN ({})", marks));
            params.extend(self.category.iter().cloned());
        }
        if !self.exclude_category.is_empty() {
            let marks = vec!["?"; self.exclude_category.len()].join(", ");
            clauses.push(format!("f.category NOT IN ({})", marks));
            params.extend(self.exclude_category.iter().cloned());
        }
        if !self.role.is_empty() {
            let ors: Vec<String> = self.role.iter().map(|_| role_clause(false)).collect();
            clauses.push(format!("({})", ors.join(" OR ")));
            params.extend(self.role.iter().cloned());
        }
        if !self.exclude_role.is_empty() {
            for _ in &self.exclude_role {
                clauses.push(role_clause(true));
            }
            params.extend(self.exclude_role.iter().cloned());
        }

        if clauses.is_empty() {
            (String::new(), params)
        } else {
            (format!(" AND {}", clauses.join(" AND ")), params)
        }
    }
}

fn role_clause(negated: bool) -> String {
    let prefix = if negated { "NOT " } else { "" };
    format!(
        "{prefix}EXISTS (SELECT 1 FROM json_each(n.metadata, '$.semantic_matches') je \
         WHERE json_extract(je.value, '$.category') = 'role' \
           AND json_extract(je.value, '$.value') = ?)"
    )
}

/// One ranked hit from either search backend.
#[derive(Debug, Clone)]
pub struct SearchHit {
    pub chunk_id: String,
    pub file_path: String,
    pub start_line: i64,
    pub end_line: i64,
    pub language: String,
    pub content: String,
    pub metadata: ChunkMetadata,
    /// Backend-native score: BM25 goodness for lexical, cosine similarity
    /// for vector.
    pub score: f64,
}

impl GraphStore {
    /// Lexical search over the weighted token index. Tag tokens outrank
    /// content tokens via `bm25()` column weights. Works with no embedding
    /// provider configured.
    pub async fn search_fts(
        &self,
        query: &str,
        limit: i64,
        snapshot_id: &str,
        filters: &FilterSet,
    ) -> StoreResult<Vec<SearchHit>> {
        let Some(match_expr) = fts::match_expression(query) else {
            return Ok(Vec::new());
        };

        let (filter_sql, filter_params) = filters.to_sql();
        let sql = format!(
            r#"
            SELECT n.id, n.file_path, n.start_line, n.end_line, n.metadata,
                   f.language, c.content,
                   bm25(nodes_fts, 0.0, 4.0, 1.0) AS rank
            FROM nodes_fts
            JOIN nodes n ON n.id = nodes_fts.chunk_id
            JOIN files f ON f.id = n.file_id
            JOIN contents c ON c.chunk_hash = n.chunk_hash
            WHERE nodes_fts MATCH ? AND f.snapshot_id = ?{filter_sql}
            ORDER BY rank ASC
            LIMIT ?
            "#
        );

        let mut q = sqlx::query(&sql).bind(&match_expr).bind(snapshot_id);
        for p in &filter_params {
            q = q.bind(p);
        }
        q = q.bind(limit);

        let rows = q.fetch_all(self.pool()).await?;
        Ok(rows
            .iter()
            .map(|row| SearchHit {
                chunk_id: row.get("id"),
                file_path: row.get("file_path"),
                start_line: row.get("start_line"),
                end_line: row.get("end_line"),
                language: row.get("language"),
                content: row.get("content"),
                metadata: parse_metadata(row.get::<String, _>("metadata")),
                // bm25() is better when more negative; negate so higher = better.
                score: -row.get::<f64, _>("rank"),
            })
            .collect())
    }

    /// Nearest-neighbor search by cosine distance over the snapshot's
    /// vectors for one model. Filters narrow the candidate set before any
    /// distance is computed.
    pub async fn search_vectors(
        &self,
        query_vector: &[f32],
        limit: usize,
        snapshot_id: &str,
        model_name: &str,
        filters: &FilterSet,
    ) -> StoreResult<Vec<SearchHit>> {
        let (filter_sql, filter_params) = filters.to_sql();
        let sql = format!(
            r#"
            SELECT n.id, n.file_path, n.start_line, n.end_line, n.metadata,
                   f.language, c.content, ne.embedding
            FROM node_embeddings ne
            JOIN nodes n ON n.id = ne.chunk_id
            JOIN files f ON f.id = n.file_id
            JOIN contents c ON c.chunk_hash = n.chunk_hash
            WHERE ne.snapshot_id = ? AND ne.model_name = ? AND ne.embedding IS NOT NULL{filter_sql}
            "#
        );

        let mut q = sqlx::query(&sql).bind(snapshot_id).bind(model_name);
        for p in &filter_params {
            q = q.bind(p);
        }
        let rows = q.fetch_all(self.pool()).await?;

        let mut hits: Vec<SearchHit> = rows
            .iter()
            .map(|row| {
                let blob: Vec<u8> = row.get("embedding");
                let vector = blob_to_vec(&blob);
                SearchHit {
                    chunk_id: row.get("id"),
                    file_path: row.get("file_path"),
                    start_line: row.get("start_line"),
                    end_line: row.get("end_line"),
                    language: row.get("language"),
                    content: row.get("content"),
                    metadata: parse_metadata(row.get::<String, _>("metadata")),
                    score: cosine_similarity(query_vector, &vector) as f64,
                }
            })
            .collect();

        hits.sort_by(|a, b| {
            b.score
                .partial_cmp(&a.score)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.chunk_id.cmp(&b.chunk_id))
        });
        hits.truncate(limit);
        Ok(hits)
    }
}

fn parse_metadata(raw: String) -> ChunkMetadata {
    serde_json::from_str(&raw).unwrap_or_default()
}

/// Parse CLI-style `key=a,b` filter arguments into a [`FilterSet`].
pub fn parse_filter_args(pairs: &[(String, String)]) -> FilterSet {
    let mut set = FilterSet::default();
    let mut by_key: HashMap<&str, Vec<String>> = HashMap::new();
    for (key, value) in pairs {
        by_key
            .entry(key.as_str())
            .or_default()
            .extend(value.split(',').map(|v| v.trim().to_string()).filter(|v| !v.is_empty()));
    }
    for (key, values) in by_key {
        match key {
            "language" => set.language = values,
            "exclude_language" => set.exclude_language = values,
            "category" => set.category = values,
            "exclude_category" => set.exclude_category = values,
            "role" => set.role = values,
            "exclude_role" => set.exclude_role = values,
            "path_prefix" => set.path_prefix = values,
            other => tracing::warn!(key = other, "unknown filter key ignored"),
        }
    }
    set
}

#[cfg(test)]
mod tests {
    use super::super::test_support::temp_store;
    use super::*;
    use crate::models::{CollectedFile, FileCategory};
    use crate::parser::RepoParser;
    use std::path::PathBuf;

    async fn snapshot_with_files(store: &GraphStore) -> String {
        let repo = store.ensure_repository("u", "main", "n").await.unwrap();
        let (snap, _) = store.create_snapshot(&repo, "c1", false).await.unwrap();
        let snap = snap.unwrap();

        for (path, category, source) in [
            (
                "src/auth.py",
                FileCategory::Source,
                "def authenticate(user):\n    return check_password(user)\n",
            ),
            (
                "tests/test_auth.py",
                FileCategory::Test,
                "def test_authenticate():\n    assert authenticate(None) is False\n",
            ),
            (
                "src/billing.js",
                FileCategory::Source,
                "function charge(amount) {\n  return gateway.send(amount);\n}\n",
            ),
        ] {
            let file = CollectedFile {
                rel_path: path.to_string(),
                full_path: PathBuf::from(path),
                extension: format!(".{}", path.rsplit('.').next().unwrap()),
                size_bytes: source.len() as u64,
                git_hash: None,
                category,
            };
            let out = RepoParser::new(&snap, "c1").parse_bytes(&file, source.as_bytes());
            store.commit_parse_outputs(&[out]).await.unwrap();
        }
        snap
    }

    #[tokio::test]
    async fn test_fts_finds_identifier() {
        let (_tmp, store) = temp_store().await;
        let snap = snapshot_with_files(&store).await;

        let hits = store
            .search_fts("authenticate", 10, &snap, &FilterSet::default())
            .await
            .unwrap();
        assert_eq!(hits.len(), 2);
        assert!(hits.iter().all(|h| h.file_path.contains("auth")));
    }

    #[tokio::test]
    async fn test_fts_empty_query_is_empty() {
        let (_tmp, store) = temp_store().await;
        let snap = snapshot_with_files(&store).await;
        let hits = store
            .search_fts("  ++ ", 10, &snap, &FilterSet::default())
            .await
            .unwrap();
        assert!(hits.is_empty());
    }

    #[tokio::test]
    async fn test_fts_language_filter() {
        let (_tmp, store) = temp_store().await;
        let snap = snapshot_with_files(&store).await;

        let filters = FilterSet {
            language: vec!["javascript".into()],
            ..Default::default()
        };
        let hits = store.search_fts("charge", 10, &snap, &filters).await.unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].language, "javascript");

        let filters = FilterSet {
            exclude_language: vec!["javascript".into()],
            ..Default::default()
        };
        let hits = store.search_fts("charge", 10, &snap, &filters).await.unwrap();
        assert!(hits.is_empty());
    }

    #[tokio::test]
    async fn test_fts_category_and_role_filters() {
        let (_tmp, store) = temp_store().await;
        let snap = snapshot_with_files(&store).await;

        let filters = FilterSet {
            exclude_category: vec!["test".into()],
            ..Default::default()
        };
        let hits = store
            .search_fts("authenticate", 10, &snap, &filters)
            .await
            .unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].file_path, "src/auth.py");

        let filters = FilterSet {
            role: vec!["test_case".into()],
            ..Default::default()
        };
        let hits = store
            .search_fts("authenticate", 10, &snap, &filters)
            .await
            .unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].file_path, "tests/test_auth.py");
    }

    #[tokio::test]
    async fn test_fts_snapshot_isolation() {
        let (_tmp, store) = temp_store().await;
        let snap = snapshot_with_files(&store).await;

        let hits = store
            .search_fts("authenticate", 10, "no-such-snapshot", &FilterSet::default())
            .await
            .unwrap();
        assert!(hits.is_empty());

        let hits = store
            .search_fts("authenticate", 10, &snap, &FilterSet::default())
            .await
            .unwrap();
        assert!(!hits.is_empty());
    }

    #[tokio::test]
    async fn test_vector_search_ranks_by_similarity() {
        let (_tmp, store) = temp_store().await;
        let snap = snapshot_with_files(&store).await;

        // Hand-write two vectors for the first two chunks.
        let rows = sqlx::query(
            "SELECT n.id, n.file_id FROM nodes n JOIN files f ON f.id = n.file_id WHERE f.snapshot_id = ? ORDER BY n.file_path",
        )
        .bind(&snap)
        .fetch_all(store.pool())
        .await
        .unwrap();
        let vectors = [vec![1.0f32, 0.0, 0.0], vec![0.0f32, 1.0, 0.0], vec![0.6f32, 0.8, 0.0]];
        for (row, vector) in rows.iter().zip(vectors.iter()) {
            sqlx::query(
                "INSERT INTO node_embeddings (chunk_id, model_name, snapshot_id, file_id, vector_hash, embedding, created_at) VALUES (?, 'm', ?, ?, 'h', ?, 0)",
            )
            .bind(row.get::<String, _>("id"))
            .bind(&snap)
            .bind(row.get::<String, _>("file_id"))
            .bind(crate::embedding::vec_to_blob(vector))
            .execute(store.pool())
            .await
            .unwrap();
        }

        let hits = store
            .search_vectors(&[1.0, 0.0, 0.0], 2, &snap, "m", &FilterSet::default())
            .await
            .unwrap();
        assert_eq!(hits.len(), 2);
        assert!(hits[0].score > hits[1].score);
        assert!((hits[0].score - 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_parse_filter_args() {
        let set = parse_filter_args(&[
            ("language".into(), "python,go".into()),
            ("exclude_category".into(), "test".into()),
            ("bogus".into(), "x".into()),
        ]);
        assert_eq!(set.language, vec!["python", "go"]);
        assert_eq!(set.exclude_category, vec!["test"]);
        assert!(set.role.is_empty());
    }
}
