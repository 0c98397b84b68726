//! Per-file parsing pipeline.
//!
//! Turns one collected file into a [`ParseOutput`]: the file record, its
//! chunks and content blobs, intra-file `child_of` edges, and pre-tokenized
//! full-text documents.
//!
//! Skip and failure rules:
//! - extensions without a grammar emit a `skipped` record plus the whole
//!   file text as a content row so readers can still display the file;
//! - binary, minified, and generated files are `skipped` the same way;
//! - a tree with syntax errors marks the file `failed`, again with the
//!   full text stored, and emits no chunks.

pub mod chunker;
pub mod fts;
pub mod language;
pub mod queries;

use sha2::{Digest, Sha256};
use uuid::Uuid;

use crate::models::{
    ChunkContent, CollectedFile, FileRecord, ParseOutput, ParseStatus,
};
use chunker::Chunker;
use language::Language;

/// Binary sniff window.
const BINARY_SNIFF_BYTES: usize = 8192;
/// A line longer than this in the first lines marks a minified file.
const MAX_LINE_LENGTH: usize = 1000;

pub struct RepoParser {
    snapshot_id: String,
    commit_hash: String,
}

impl RepoParser {
    pub fn new(snapshot_id: &str, commit_hash: &str) -> Self {
        Self {
            snapshot_id: snapshot_id.to_string(),
            commit_hash: commit_hash.to_string(),
        }
    }

    /// Parse one file from disk. I/O errors degrade to a `failed` record;
    /// they never propagate.
    pub fn parse_file(&self, file: &CollectedFile) -> ParseOutput {
        match std::fs::read(&file.full_path) {
            Ok(bytes) => self.parse_bytes(file, &bytes),
            Err(e) => {
                tracing::warn!(path = %file.rel_path, error = %e, "read failed");
                self.record_only(file, ParseStatus::Failed, Some(format!("read error: {e}")), None)
            }
        }
    }

    /// Parse in-memory bytes for one file.
    pub fn parse_bytes(&self, file: &CollectedFile, bytes: &[u8]) -> ParseOutput {
        let sniff = &bytes[..bytes.len().min(BINARY_SNIFF_BYTES)];
        if sniff.contains(&0) {
            return self.record_only(file, ParseStatus::Skipped, Some("binary file".into()), Some(bytes));
        }
        if is_minified_or_generated(bytes) {
            return self.record_only(
                file,
                ParseStatus::Skipped,
                Some("minified or generated".into()),
                Some(bytes),
            );
        }

        let Some(lang) = Language::from_extension(&file.extension) else {
            return self.record_only(file, ParseStatus::Skipped, None, Some(bytes));
        };

        let mut parser = tree_sitter::Parser::new();
        if parser.set_language(&lang.grammar()).is_err() {
            return self.record_only(file, ParseStatus::Skipped, Some("grammar unavailable".into()), Some(bytes));
        }
        let Some(tree) = parser.parse(bytes, None) else {
            return self.record_only(file, ParseStatus::Failed, Some("parser returned no tree".into()), Some(bytes));
        };
        if tree.root_node().has_error() {
            return self.record_only(file, ParseStatus::Failed, Some("syntax errors".into()), Some(bytes));
        }

        let captures = queries::semantic_captures(lang, &tree, bytes);

        let file_id = Uuid::new_v4().to_string();
        let set = Chunker::new(bytes, &file_id, &file.rel_path, &captures).run(tree.root_node());

        let record = FileRecord {
            id: file_id,
            snapshot_id: self.snapshot_id.clone(),
            commit_hash: self.commit_hash.clone(),
            file_hash: file.git_hash.clone(),
            content_hash: None,
            path: file.rel_path.clone(),
            language: lang.as_str().to_string(),
            size_bytes: bytes.len() as i64,
            category: file.category.as_str().to_string(),
            indexed_at: chrono::Utc::now().timestamp(),
            parsing_status: ParseStatus::Success,
            parsing_error: None,
        };

        let content_by_hash: std::collections::HashMap<&str, &str> = set
            .contents
            .iter()
            .map(|c| (c.chunk_hash.as_str(), c.content.as_str()))
            .collect();
        let fts = set
            .nodes
            .iter()
            .map(|n| {
                let content = content_by_hash.get(n.chunk_hash.as_str()).copied().unwrap_or("");
                fts::build_fts_doc(&n.id, &n.metadata, content)
            })
            .collect();

        ParseOutput {
            file: record,
            nodes: set.nodes,
            contents: set.contents,
            edges: set.edges,
            fts,
        }
    }

    /// Build a chunkless output: a file record plus (optionally) the full
    /// file text as a content row, linked via `content_hash`, so readers
    /// can serve skipped and failed files.
    ///
    /// A file-level pseudo-node is also emitted, carrying the file's
    /// metadata into the lexical index so the file stays discoverable by
    /// path even without chunks, and giving cross-file relations their
    /// fallback anchor.
    fn record_only(
        &self,
        file: &CollectedFile,
        status: ParseStatus,
        error: Option<String>,
        bytes: Option<&[u8]>,
    ) -> ParseOutput {
        let file_id = Uuid::new_v4().to_string();
        let language = language::language_tag(&file.extension).to_string();
        let size_bytes = bytes
            .map(|b| b.len() as i64)
            .unwrap_or(file.size_bytes as i64);

        let mut contents = Vec::new();
        let mut content_hash = None;
        let mut nodes = Vec::new();
        let mut fts_docs = Vec::new();

        if let Some(bytes) = bytes {
            let text = String::from_utf8_lossy(bytes).to_string();
            let mut hasher = Sha256::new();
            hasher.update(text.as_bytes());
            let hash = format!("{:x}", hasher.finalize());
            contents.push(ChunkContent {
                chunk_hash: hash.clone(),
                content: text,
            });
            content_hash = Some(hash.clone());

            let pseudo = crate::models::ChunkNode {
                id: Uuid::new_v4().to_string(),
                file_id: file_id.clone(),
                file_path: file.rel_path.clone(),
                chunk_hash: hash,
                start_line: 0,
                end_line: 0,
                byte_start: 0,
                byte_end: 0,
                metadata: crate::models::ChunkMetadata {
                    pseudo: Some("file".to_string()),
                    ..Default::default()
                },
            };
            let mut tag_tokens = fts::tokenize(&file.rel_path);
            tag_tokens.push(language.clone());
            tag_tokens.push(file.category.as_str().to_string());
            fts_docs.push(crate::models::FtsDoc {
                chunk_id: pseudo.id.clone(),
                tags: tag_tokens.join(" "),
                content: fts::tokenize(&file.rel_path).join(" "),
            });
            nodes.push(pseudo);
        }

        ParseOutput {
            file: FileRecord {
                id: file_id,
                snapshot_id: self.snapshot_id.clone(),
                commit_hash: self.commit_hash.clone(),
                file_hash: file.git_hash.clone(),
                content_hash,
                path: file.rel_path.clone(),
                language,
                size_bytes,
                category: file.category.as_str().to_string(),
                indexed_at: chrono::Utc::now().timestamp(),
                parsing_status: status,
                parsing_error: error,
            },
            nodes,
            contents,
            edges: Vec::new(),
            fts: fts_docs,
        }
    }
}

/// Content heuristics for minified or generated files: a very long line
/// near the top, or a generator marker in the header.
fn is_minified_or_generated(bytes: &[u8]) -> bool {
    let head = &bytes[..bytes.len().min(2048)];
    for line in head.split(|b| *b == b'\n').take(5) {
        if line.len() > MAX_LINE_LENGTH {
            return true;
        }
    }

    let header = String::from_utf8_lossy(&bytes[..bytes.len().min(500)]).to_lowercase();
    header.contains("generated by") || header.contains("auto-generated") || header.contains("do not edit")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::FileCategory;
    use std::path::PathBuf;

    fn collected(rel_path: &str, ext: &str, category: FileCategory) -> CollectedFile {
        CollectedFile {
            rel_path: rel_path.to_string(),
            full_path: PathBuf::from(rel_path),
            extension: ext.to_string(),
            size_bytes: 0,
            git_hash: Some("a".repeat(40)),
            category,
        }
    }

    fn parser() -> RepoParser {
        RepoParser::new("snap-1", "commit-1")
    }

    #[test]
    fn test_python_file_parses_into_chunks() {
        let file = collected("app.py", ".py", FileCategory::Source);
        let out = parser().parse_bytes(&file, b"def foo():\n    return 1\n");
        assert_eq!(out.file.parsing_status, ParseStatus::Success);
        assert_eq!(out.file.language, "python");
        assert_eq!(out.nodes.len(), 1);
        assert_eq!(out.fts.len(), 1);
        assert!(out.fts[0].content.contains("foo"));
    }

    #[test]
    fn test_markdown_is_skipped_with_content_stored() {
        let file = collected("README.md", ".md", FileCategory::Docs);
        let out = parser().parse_bytes(&file, b"# Title\n\nBody text.\n");
        assert_eq!(out.file.parsing_status, ParseStatus::Skipped);
        assert_eq!(out.file.language, "markdown");
        assert_eq!(out.contents.len(), 1);
        assert_eq!(out.file.content_hash.as_deref(), Some(out.contents[0].chunk_hash.as_str()));
        // Only the file-level pseudo-node, no real chunks.
        assert_eq!(out.nodes.len(), 1);
        assert_eq!(out.nodes[0].metadata.pseudo.as_deref(), Some("file"));
        // The pseudo-node carries path metadata into the lexical index.
        assert_eq!(out.fts.len(), 1);
        assert!(out.fts[0].tags.contains("readme"));
        assert!(out.fts[0].tags.contains("markdown"));
    }

    #[test]
    fn test_syntax_error_marks_failed_but_keeps_text() {
        let file = collected("broken.py", ".py", FileCategory::Source);
        let out = parser().parse_bytes(&file, b"def broken(:\n    pass\n");
        assert_eq!(out.file.parsing_status, ParseStatus::Failed);
        assert!(out.nodes.iter().all(|n| n.metadata.pseudo.is_some()));
        assert_eq!(out.contents.len(), 1);
        assert!(out.contents[0].content.contains("def broken"));
    }

    #[test]
    fn test_binary_is_skipped() {
        let file = collected("blob.py", ".py", FileCategory::Source);
        let out = parser().parse_bytes(&file, b"abc\0def");
        assert_eq!(out.file.parsing_status, ParseStatus::Skipped);
        assert_eq!(out.file.parsing_error.as_deref(), Some("binary file"));
    }

    #[test]
    fn test_minified_is_skipped() {
        let file = collected("bundle.js", ".js", FileCategory::Source);
        let long_line = format!("var x={};\n", "1".repeat(2000));
        let out = parser().parse_bytes(&file, long_line.as_bytes());
        assert_eq!(out.file.parsing_status, ParseStatus::Skipped);
    }

    #[test]
    fn test_generated_marker_is_skipped() {
        let file = collected("gen.py", ".py", FileCategory::Source);
        let out = parser().parse_bytes(&file, b"# Auto-generated file. DO NOT EDIT\nx = 1\n");
        assert_eq!(out.file.parsing_status, ParseStatus::Skipped);
    }

    #[test]
    fn test_semantic_roles_reach_fts_tags() {
        let file = collected("test_app.py", ".py", FileCategory::Test);
        let out = parser().parse_bytes(&file, b"def test_works():\n    assert True\n");
        assert_eq!(out.file.parsing_status, ParseStatus::Success);
        assert!(out.fts[0].tags.contains("test_case"));
    }
}
