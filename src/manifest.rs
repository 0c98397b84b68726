//! Snapshot file manifests.
//!
//! A manifest is a nested directory tree stored as JSON with the snapshot,
//! so directory listings are O(1) reads with no path queries against the
//! `files` table. Shape: `{"type": "dir", "children": {"src": {...}}}`.

use serde_json::{json, Map, Value};

/// One entry returned by [`list_directory`].
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize)]
pub struct DirEntry {
    pub name: String,
    #[serde(rename = "type")]
    pub kind: String,
    pub path: String,
}

/// Build a manifest tree from a flat list of repo-relative paths.
pub fn build(paths: &[String]) -> Value {
    let mut root = json!({"type": "dir", "children": {}});

    for path in paths {
        let parts: Vec<&str> = path.split('/').filter(|p| !p.is_empty()).collect();
        if !parts.is_empty() {
            insert_path(&mut root, &parts);
        }
    }

    root
}

fn insert_path(node: &mut Value, parts: &[&str]) {
    let children = node
        .as_object_mut()
        .expect("manifest nodes are objects")
        .entry("children")
        .or_insert_with(|| Value::Object(Map::new()))
        .as_object_mut()
        .expect("children is an object");

    if parts.len() == 1 {
        children.insert(parts[0].to_string(), json!({"type": "file"}));
    } else {
        let child = children
            .entry(parts[0].to_string())
            .or_insert_with(|| json!({"type": "dir", "children": {}}));
        insert_path(child, &parts[1..]);
    }
}

/// Descend into the manifest to the node at `path` (empty string = root).
fn descend<'a>(manifest: &'a Value, path: &str) -> Option<&'a Value> {
    let mut current = manifest;
    for part in path.split('/').filter(|p| !p.is_empty()) {
        current = current.get("children")?.get(part)?;
        if current.get("type").and_then(Value::as_str) != Some("dir") {
            return None;
        }
    }
    Some(current)
}

/// List the immediate children of a directory, directories first, then
/// files, alphabetically within each group. Unknown paths yield an empty
/// list rather than an error.
pub fn list_directory(manifest: &Value, path: &str) -> Vec<DirEntry> {
    let Some(node) = descend(manifest, path) else {
        return Vec::new();
    };
    let Some(children) = node.get("children").and_then(Value::as_object) else {
        return Vec::new();
    };

    let mut entries: Vec<DirEntry> = children
        .iter()
        .map(|(name, meta)| {
            let kind = meta
                .get("type")
                .and_then(Value::as_str)
                .unwrap_or("file")
                .to_string();
            let full = if path.is_empty() {
                name.clone()
            } else {
                format!("{}/{}", path.trim_matches('/'), name)
            };
            DirEntry {
                name: name.clone(),
                kind,
                path: full,
            }
        })
        .collect();

    entries.sort_by(|a, b| {
        let a_dir = a.kind == "dir";
        let b_dir = b.kind == "dir";
        b_dir.cmp(&a_dir).then_with(|| a.name.cmp(&b.name))
    });
    entries
}

/// In-memory recursive search for directories whose name contains
/// `pattern` (case-insensitive). Stops once `limit` paths are found.
pub fn find_directories(manifest: &Value, pattern: &str, limit: usize) -> Vec<String> {
    let needle = pattern.to_lowercase();
    let mut found = Vec::new();
    recurse_dirs(manifest, "", &needle, limit, &mut found);
    found.sort();
    found
}

fn recurse_dirs(node: &Value, prefix: &str, needle: &str, limit: usize, found: &mut Vec<String>) {
    if found.len() >= limit {
        return;
    }
    let Some(children) = node.get("children").and_then(Value::as_object) else {
        return;
    };
    for (name, meta) in children {
        if meta.get("type").and_then(Value::as_str) == Some("dir") {
            let full = if prefix.is_empty() {
                name.clone()
            } else {
                format!("{}/{}", prefix, name)
            };
            if name.to_lowercase().contains(needle) {
                found.push(full.clone());
                if found.len() >= limit {
                    return;
                }
            }
            recurse_dirs(meta, &full, needle, limit, found);
        }
    }
}
