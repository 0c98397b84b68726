//! Git-native source file collection.
//!
//! Streams batches of classified file descriptors out of a working tree,
//! using `git ls-files` as the authoritative file list so ignore rules come
//! for free. The funnel has four stages:
//!
//! 1. **Native enumeration** — tracked files with their SHA-1 blob hash
//!    (`git ls-files -s -z`), then untracked files without hashes
//!    (`git ls-files -o -z --exclude-standard`). Tracked wins when both
//!    phases report the same path.
//! 2. **Metadata filter** — extension allow-list and path-component
//!    blocklist, zero filesystem I/O.
//! 3. **Safety filter** — one `lstat` per surviving path; rejects symlinks,
//!    non-regular files, empty files, and files over 1 MiB.
//! 4. **Classification** — `docs` / `test` / `config` / `source` by path
//!    heuristics, in that precedence order.

use anyhow::{bail, Context, Result};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::process::Command;

use crate::models::{CollectedFile, FileCategory};

/// Hard per-file size cap. Larger files are usually minified bundles,
/// giant fixtures, or masked binaries.
pub const MAX_FILE_SIZE_BYTES: u64 = 1024 * 1024;

/// Extension allow-list.
pub const SUPPORTED_EXTENSIONS: &[&str] = &[
    ".py", ".js", ".jsx", ".ts", ".tsx", ".java", ".go", ".rs", ".c", ".cc", ".cpp", ".h",
    ".hpp", ".cs", ".php", ".rb", ".kt", ".scala", ".vue", ".svelte", ".css", ".scss", ".html",
    ".json", ".yaml", ".yml", ".toml", ".xml", ".sql", ".md", ".rst",
];

/// Path components that disqualify a file regardless of extension.
pub const BLOCKLIST_DIRS: &[&str] = &[
    ".git",
    ".svn",
    ".hg",
    ".idea",
    ".vscode",
    "node_modules",
    "venv",
    ".venv",
    "env",
    "dist",
    "build",
    "target",
    "out",
    "bin",
    "__pycache__",
    "coverage",
    ".pytest_cache",
    "vendor",
    "third_party",
];

pub struct SourceCollector {
    repo_root: PathBuf,
}

impl SourceCollector {
    pub fn new(repo_root: impl Into<PathBuf>) -> Self {
        Self {
            repo_root: repo_root.into(),
        }
    }

    /// Run the funnel and return the surviving files in batches of
    /// `batch_size`, in Git's enumeration order. Single pass; any Git
    /// invocation failure is fatal.
    pub fn stream_files(&self, batch_size: usize) -> Result<Vec<Vec<CollectedFile>>> {
        let mut seen: HashSet<String> = HashSet::new();
        let mut files: Vec<CollectedFile> = Vec::new();

        for (rel_path, git_hash) in self.list_tracked()? {
            seen.insert(rel_path.clone());
            if let Some(file) = self.validate_and_build(&rel_path, Some(git_hash)) {
                files.push(file);
            }
        }

        for rel_path in self.list_untracked()? {
            // Tracked wins when both phases report the same path.
            if seen.contains(&rel_path) {
                continue;
            }
            if let Some(file) = self.validate_and_build(&rel_path, None) {
                files.push(file);
            }
        }

        tracing::info!(count = files.len(), "collection complete");

        let batch = batch_size.max(1);
        let mut batches = Vec::new();
        let mut current = Vec::with_capacity(batch.min(files.len()));
        for file in files {
            current.push(file);
            if current.len() >= batch {
                batches.push(std::mem::take(&mut current));
            }
        }
        if !current.is_empty() {
            batches.push(current);
        }
        Ok(batches)
    }

    /// `git ls-files -s -z`: staged entries in `"<mode> <hash> <stage>\t<path>"`
    /// format, null-terminated.
    fn list_tracked(&self) -> Result<Vec<(String, String)>> {
        let output = Command::new("git")
            .args(["ls-files", "-s", "-z", "--exclude-standard"])
            .current_dir(&self.repo_root)
            .output()
            .with_context(|| "Failed to execute 'git ls-files'. Is git installed?")?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            bail!("git ls-files -s failed: {}", stderr.trim());
        }

        let mut entries = Vec::new();
        for entry in output.stdout.split(|b| *b == 0) {
            if entry.is_empty() {
                continue;
            }
            let Some(tab) = entry.iter().position(|b| *b == b'\t') else {
                continue;
            };
            let meta = &entry[..tab];
            let path = String::from_utf8_lossy(&entry[tab + 1..]).to_string();
            let mut parts = meta.split(|b| *b == b' ');
            let _mode = parts.next();
            let Some(hash) = parts.next() else { continue };
            entries.push((path, String::from_utf8_lossy(hash).to_string()));
        }
        Ok(entries)
    }

    /// `git ls-files -o -z --exclude-standard`: untracked paths present in
    /// the workspace but not yet committed.
    fn list_untracked(&self) -> Result<Vec<String>> {
        let output = Command::new("git")
            .args(["ls-files", "-o", "-z", "--exclude-standard"])
            .current_dir(&self.repo_root)
            .output()
            .with_context(|| "Failed to execute 'git ls-files'")?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            bail!("git ls-files -o failed: {}", stderr.trim());
        }

        Ok(output
            .stdout
            .split(|b| *b == 0)
            .filter(|e| !e.is_empty())
            .map(|e| String::from_utf8_lossy(e).to_string())
            .collect())
    }

    /// Stages 2–4 of the funnel for one path.
    fn validate_and_build(&self, rel_path: &str, git_hash: Option<String>) -> Option<CollectedFile> {
        let extension = extension_of(rel_path)?;
        if !SUPPORTED_EXTENSIONS.contains(&extension.as_str()) {
            return None;
        }

        if rel_path
            .split('/')
            .any(|part| BLOCKLIST_DIRS.contains(&part))
        {
            return None;
        }

        let full_path = self.repo_root.join(rel_path);

        // lstat does not follow symlinks.
        let meta = match std::fs::symlink_metadata(&full_path) {
            Ok(m) => m,
            Err(e) => {
                tracing::warn!(path = rel_path, error = %e, "lstat failed, dropping file");
                return None;
            }
        };
        if !meta.is_file() {
            return None;
        }
        let size = meta.len();
        if size == 0 || size > MAX_FILE_SIZE_BYTES {
            return None;
        }

        Some(CollectedFile {
            rel_path: rel_path.to_string(),
            full_path,
            extension,
            size_bytes: size,
            git_hash,
            category: classify(rel_path),
        })
    }
}

fn extension_of(path: &str) -> Option<String> {
    Path::new(path)
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| format!(".{}", e.to_lowercase()))
}

/// Category heuristics, in precedence order: docs, test, config, source.
pub fn classify(rel_path: &str) -> FileCategory {
    let lower = rel_path.to_lowercase();
    let parts: Vec<&str> = lower.split('/').collect();
    let name = parts.last().copied().unwrap_or("");

    if parts[..parts.len().saturating_sub(1)]
        .iter()
        .any(|p| *p == "docs" || *p == "documentation")
        || name.ends_with(".md")
        || name.ends_with(".rst")
    {
        return FileCategory::Docs;
    }

    let in_test_dir = parts[..parts.len().saturating_sub(1)]
        .iter()
        .any(|p| *p == "tests" || *p == "__tests__" || *p == "spec");
    let stem_and_ext: Vec<&str> = name.split('.').collect();
    let stem = stem_and_ext.first().copied().unwrap_or("");
    let test_name = name.starts_with("test_")
        || stem.ends_with("_test")
        || name.contains(".spec.");
    if in_test_dir || test_name {
        return FileCategory::Test;
    }

    let config_names = ["package.json", "pyproject.toml", "dockerfile", "makefile"];
    if config_names.contains(&name)
        || name.ends_with(".yml")
        || name.ends_with(".yaml")
        || name.ends_with(".toml")
    {
        return FileCategory::Config;
    }

    FileCategory::Source
}
