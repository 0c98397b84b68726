//! Snapshot file reads on top of the manifest and the chunk store.

use anyhow::{anyhow, Result};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Mutex;

use crate::manifest::{self, DirEntry};
use crate::store::GraphStore;

/// The reconstructed content of a file (or a line range of it).
#[derive(Debug, Clone, serde::Serialize)]
pub struct FileView {
    pub file_path: String,
    pub content: String,
    pub start_line: i64,
    pub end_line: Option<i64>,
}

/// Virtual filesystem reader over immutable snapshots.
///
/// Directory listings are O(1) reads against the snapshot's stored
/// manifest; file content is reassembled from chunks on demand (or served
/// whole for files that skipped parsing). Manifests are cached per reader
/// instance.
pub struct CodeReader {
    store: GraphStore,
    manifest_cache: Mutex<HashMap<String, Value>>,
}

impl CodeReader {
    pub fn new(store: GraphStore) -> Self {
        Self {
            store,
            manifest_cache: Mutex::new(HashMap::new()),
        }
    }

    async fn manifest_for(&self, snapshot_id: &str) -> Result<Value> {
        if let Some(cached) = self.manifest_cache.lock().unwrap().get(snapshot_id) {
            return Ok(cached.clone());
        }
        let tree = self.store.get_snapshot_manifest(snapshot_id).await?;
        self.manifest_cache
            .lock()
            .unwrap()
            .insert(snapshot_id.to_string(), tree.clone());
        Ok(tree)
    }

    /// Read a file (optionally a 1-based inclusive line range) from a
    /// snapshot. Unknown paths are an error; a known file with no stored
    /// text yields empty content.
    pub async fn read_file(
        &self,
        snapshot_id: &str,
        file_path: &str,
        start_line: Option<i64>,
        end_line: Option<i64>,
    ) -> Result<FileView> {
        let content = self
            .store
            .get_file_content_range(snapshot_id, file_path, start_line, end_line)
            .await?
            .ok_or_else(|| anyhow!("file '{}' not found in snapshot {}", file_path, snapshot_id))?;

        Ok(FileView {
            file_path: file_path.to_string(),
            content,
            start_line: start_line.unwrap_or(1),
            end_line,
        })
    }

    /// List a directory from the manifest: directories first, then files,
    /// alphabetically within each group.
    pub async fn list_directory(&self, snapshot_id: &str, path: &str) -> Result<Vec<DirEntry>> {
        let tree = self.manifest_for(snapshot_id).await?;
        Ok(manifest::list_directory(&tree, path))
    }

    /// In-memory substring search over directory names in the manifest.
    pub async fn find_directories(
        &self,
        snapshot_id: &str,
        pattern: &str,
        limit: usize,
    ) -> Result<Vec<String>> {
        let tree = self.manifest_for(snapshot_id).await?;
        Ok(manifest::find_directories(&tree, pattern, limit))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{CollectedFile, FileCategory};
    use crate::parser::RepoParser;
    use crate::store::test_support::temp_store;
    use std::path::PathBuf;

    async fn snapshot_with_manifest(store: &GraphStore) -> String {
        let repo = store.ensure_repository("u", "main", "n").await.unwrap();
        let (snap, _) = store.create_snapshot(&repo, "c1", false).await.unwrap();
        let snap = snap.unwrap();

        for (path, source) in [
            ("src/app.py", "def run():\n    return 0\n"),
            ("src/util/io.py", "def read():\n    return ''\n"),
            ("README.md", "# Readme\n"),
        ] {
            let file = CollectedFile {
                rel_path: path.to_string(),
                full_path: PathBuf::from(path),
                extension: format!(".{}", path.rsplit('.').next().unwrap()),
                size_bytes: source.len() as u64,
                git_hash: None,
                category: FileCategory::Source,
            };
            let out = RepoParser::new(&snap, "c1").parse_bytes(&file, source.as_bytes());
            store.commit_parse_outputs(&[out]).await.unwrap();
        }

        let paths = store.list_file_paths(&snap).await.unwrap();
        let tree = crate::manifest::build(&paths);
        store
            .activate_snapshot(&repo, &snap, &serde_json::json!({}), &tree)
            .await
            .unwrap();
        snap
    }

    #[tokio::test]
    async fn test_read_file_roundtrip() {
        let (_tmp, store) = temp_store().await;
        let snap = snapshot_with_manifest(&store).await;
        let reader = CodeReader::new(store);

        let view = reader.read_file(&snap, "src/app.py", None, None).await.unwrap();
        assert!(view.content.contains("def run"));

        let err = reader.read_file(&snap, "missing.py", None, None).await;
        assert!(err.is_err());
    }

    #[tokio::test]
    async fn test_list_directory_from_manifest() {
        let (_tmp, store) = temp_store().await;
        let snap = snapshot_with_manifest(&store).await;
        let reader = CodeReader::new(store);

        let root = reader.list_directory(&snap, "").await.unwrap();
        let names: Vec<&str> = root.iter().map(|e| e.name.as_str()).collect();
        assert_eq!(names, vec!["src", "README.md"]);

        let src = reader.list_directory(&snap, "src").await.unwrap();
        assert_eq!(src[0].name, "util");
        assert_eq!(src[0].kind, "dir");
        assert_eq!(src[1].name, "app.py");
    }

    #[tokio::test]
    async fn test_find_directories() {
        let (_tmp, store) = temp_store().await;
        let snap = snapshot_with_manifest(&store).await;
        let reader = CodeReader::new(store);

        let found = reader.find_directories(&snap, "util", 10).await.unwrap();
        assert_eq!(found, vec!["src/util".to_string()]);
    }
}
