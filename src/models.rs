//! Core data models for the code property graph.
//!
//! These types flow through the indexing and retrieval pipeline:
//!
//! ```text
//! Collector → CollectedFile → parse() → FileRecord + ChunkNode + ChunkContent + EdgeRecord
//!                                                │
//!                                        embed() → vector per (chunk, model)
//!                                                │
//!                                     retrieve() → RetrievedContext
//! ```
//!
//! # Type Relationships
//!
//! - A **[`CollectedFile`]** is produced by the source collector before any
//!   parsing or storage.
//! - A **[`FileRecord`]** is the stored per-snapshot file row, carrying the
//!   Git blob hash and the parsing status.
//! - A **[`ChunkNode`]** is a byte-precise segment of one file aligned to a
//!   syntax node; its text lives in a content-addressed [`ChunkContent`].
//! - An **[`EdgeRecord`]** is a directed relation between two chunks
//!   (`child_of` within a file, `calls`/`imports`/... across files).
//! - A **[`RetrievedContext`]** is a ranked, graph-enriched search result.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Semantic category assigned to a file by path heuristics.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileCategory {
    Source,
    Test,
    Config,
    Docs,
}

impl FileCategory {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Source => "source",
            Self::Test => "test",
            Self::Config => "config",
            Self::Docs => "docs",
        }
    }
}

/// A validated, classified file emitted by the source collector.
///
/// `git_hash` is Git's SHA-1 blob id for tracked files and `None` for
/// untracked ones; `is_tracked` derives from it.
#[derive(Debug, Clone)]
pub struct CollectedFile {
    /// Repo-relative, POSIX-normalized path.
    pub rel_path: String,
    /// Absolute path on disk for content reads.
    pub full_path: PathBuf,
    /// Normalized extension including the dot (e.g. `".py"`).
    pub extension: String,
    pub size_bytes: u64,
    pub git_hash: Option<String>,
    pub category: FileCategory,
}

impl CollectedFile {
    pub fn is_tracked(&self) -> bool {
        self.git_hash.is_some()
    }
}

/// Outcome of parsing one file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParseStatus {
    Success,
    Skipped,
    Failed,
}

impl ParseStatus {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Success => "success",
            Self::Skipped => "skipped",
            Self::Failed => "failed",
        }
    }
}

/// Per-snapshot file row.
#[derive(Debug, Clone)]
pub struct FileRecord {
    pub id: String,
    pub snapshot_id: String,
    pub commit_hash: String,
    /// Git SHA-1 blob hash; `None` for untracked files.
    pub file_hash: Option<String>,
    /// SHA-256 of the full file text, set when the file was skipped or
    /// failed so readers can still serve its content.
    pub content_hash: Option<String>,
    pub path: String,
    pub language: String,
    pub size_bytes: i64,
    pub category: String,
    /// Unix epoch seconds.
    pub indexed_at: i64,
    pub parsing_status: ParseStatus,
    pub parsing_error: Option<String>,
}

/// A semantic capture attached to a chunk (e.g. `role: test_case`).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SemanticMatch {
    pub category: String,
    pub value: String,
    pub label: String,
}

/// Metadata bag stored as JSON alongside each chunk.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ChunkMetadata {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub semantic_matches: Vec<SemanticMatch>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tags: Vec<String>,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub oversize: bool,
    /// Set to `"file"` on the lazily created file-level pseudo-node.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pseudo: Option<String>,
}

impl ChunkMetadata {
    /// The primary display label, preferring roles over structural types.
    pub fn primary_label(&self) -> String {
        for m in &self.semantic_matches {
            if m.category == "role" {
                return m.label.clone();
            }
        }
        for m in &self.semantic_matches {
            if m.category == "type" {
                return m.label.clone();
            }
        }
        "Code Block".to_string()
    }

    /// Flat list of display labels for all matches.
    pub fn labels(&self) -> Vec<String> {
        let mut out: Vec<String> = Vec::new();
        for m in &self.semantic_matches {
            if !out.contains(&m.label) {
                out.push(m.label.clone());
            }
        }
        if out.is_empty() {
            out.push("Code Block".to_string());
        }
        out
    }
}

/// A byte-precise chunk of one file, the atomic unit of indexing.
///
/// Line and byte ranges are kept consistent: the line range is derived from
/// the byte range plus the file's newline positions at parse time.
#[derive(Debug, Clone)]
pub struct ChunkNode {
    pub id: String,
    pub file_id: String,
    pub file_path: String,
    /// SHA-256 of the chunk's raw bytes; key into the `contents` table.
    pub chunk_hash: String,
    pub start_line: i64,
    pub end_line: i64,
    pub byte_start: i64,
    pub byte_end: i64,
    pub metadata: ChunkMetadata,
}

/// Content-addressed chunk text, deduplicated globally across snapshots.
#[derive(Debug, Clone)]
pub struct ChunkContent {
    pub chunk_hash: String,
    pub content: String,
}

/// Directed relation kinds carried by graph edges.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RelationKind {
    ChildOf,
    Calls,
    References,
    Imports,
    Inherits,
    Defines,
    ReadsFrom,
    Instantiates,
}

impl RelationKind {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::ChildOf => "child_of",
            Self::Calls => "calls",
            Self::References => "references",
            Self::Imports => "imports",
            Self::Inherits => "inherits",
            Self::Defines => "defines",
            Self::ReadsFrom => "reads_from",
            Self::Instantiates => "instantiates",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        Some(match s {
            "child_of" => Self::ChildOf,
            "calls" => Self::Calls,
            "references" => Self::References,
            "imports" => Self::Imports,
            "inherits" => Self::Inherits,
            "defines" => Self::Defines,
            "reads_from" => Self::ReadsFrom,
            "instantiates" => Self::Instantiates,
            _ => return None,
        })
    }
}

/// A resolved edge between two chunks, ready for insertion.
#[derive(Debug, Clone)]
pub struct EdgeRecord {
    pub source_id: String,
    pub target_id: String,
    pub relation: RelationKind,
    pub metadata: serde_json::Value,
}

/// An unresolved cross-file relation as produced by an external extractor.
///
/// Both endpoints are byte-precise ranges; the storage engine resolves each
/// side to the smallest chunk whose range contains it.
#[derive(Debug, Clone)]
pub struct CodeRelation {
    pub source_path: String,
    pub source_range: (i64, i64),
    pub target_path: String,
    pub target_range: (i64, i64),
    pub relation: RelationKind,
    pub metadata: serde_json::Value,
}

/// Pre-tokenized full-text document for one chunk.
///
/// Both fields hold space-joined tokens produced by the code tokenizer;
/// `tags` is ranked above `content` at query time.
#[derive(Debug, Clone)]
pub struct FtsDoc {
    pub chunk_id: String,
    pub tags: String,
    pub content: String,
}

/// Everything produced by parsing a single file.
#[derive(Debug, Clone)]
pub struct ParseOutput {
    pub file: FileRecord,
    pub nodes: Vec<ChunkNode>,
    pub contents: Vec<ChunkContent>,
    pub edges: Vec<EdgeRecord>,
    pub fts: Vec<FtsDoc>,
}

/// A navigation hint pointing at an adjacent or enclosing chunk.
#[derive(Debug, Clone, Serialize)]
pub struct NavNode {
    pub id: String,
    pub label: String,
}

/// Prev/next/parent navigation hints for one chunk.
#[derive(Debug, Clone, Default, Serialize)]
pub struct NavHints {
    pub prev: Option<NavNode>,
    pub next: Option<NavNode>,
    pub parent: Option<NavNode>,
}

/// A ranked, graph-enriched retrieval result.
#[derive(Debug, Clone, Serialize)]
pub struct RetrievedContext {
    pub node_id: String,
    pub file_path: String,
    pub content: String,
    pub semantic_labels: Vec<String>,
    pub score: f64,
    /// `"vector"`, `"keyword"`, or `"hybrid"`.
    pub retrieval_method: String,
    pub start_line: i64,
    pub end_line: i64,
    pub snapshot_id: String,
    pub language: String,
    /// Human-readable enclosing-block description, if any.
    pub parent_context: Option<String>,
    /// Symbols reachable through outgoing `calls`/`defines`/`references`.
    pub outgoing_definitions: Vec<String>,
    pub nav_hints: NavHints,
}

impl RetrievedContext {
    /// Render a Markdown payload with `[CONTEXT]`, `[CODE]`, and
    /// `[RELATIONS]` sections for LLM consumption.
    pub fn render(&self) -> String {
        let mut out = Vec::new();

        out.push("[CONTEXT]".to_string());
        out.push(format!(
            "FILE: {} (L{}-{})",
            self.file_path, self.start_line, self.end_line
        ));
        let labels = if self.semantic_labels.is_empty() {
            "[Code Block]".to_string()
        } else {
            self.semantic_labels
                .iter()
                .map(|l| format!("[{}]", l))
                .collect::<Vec<_>>()
                .join(" ")
        };
        out.push(format!("LABELS: {}", labels));
        out.push(format!("NODE ID: {}", self.node_id));
        if let Some(parent) = &self.parent_context {
            out.push(format!("ENCLOSING: {}", parent));
        }

        out.push(String::new());
        out.push("[CODE]".to_string());
        out.push(format!("```{}", self.language.to_lowercase()));
        out.push(self.content.clone());
        out.push("```".to_string());

        if !self.outgoing_definitions.is_empty() {
            out.push(String::new());
            out.push("[RELATIONS]".to_string());
            for sym in self.outgoing_definitions.iter().take(5) {
                out.push(format!("- {}", sym));
            }
            if self.outgoing_definitions.len() > 5 {
                out.push(format!(
                    "- ... ({} more)",
                    self.outgoing_definitions.len() - 5
                ));
            }
        }

        let mut navs = Vec::new();
        match &self.nav_hints.parent {
            Some(p) => navs.push(format!("PARENT_CHUNK: {} (ID: {})", p.label, p.id)),
            None => navs.push("PARENT_CHUNK: None".to_string()),
        }
        match &self.nav_hints.prev {
            Some(p) => navs.push(format!("PREV_CHUNK: {} (ID: {})", p.label, p.id)),
            None => navs.push("PREV_CHUNK: None".to_string()),
        }
        match &self.nav_hints.next {
            Some(n) => navs.push(format!("NEXT_CHUNK: {} (ID: {})", n.label, n.id)),
            None => navs.push("NEXT_CHUNK: None".to_string()),
        }
        out.push(String::new());
        out.push("[CODE NAVIGATION]".to_string());
        out.extend(navs);

        out.join("\n") + "\n"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_relation_kind_roundtrip() {
        for kind in [
            RelationKind::ChildOf,
            RelationKind::Calls,
            RelationKind::References,
            RelationKind::Imports,
            RelationKind::Inherits,
            RelationKind::Defines,
            RelationKind::ReadsFrom,
            RelationKind::Instantiates,
        ] {
            assert_eq!(RelationKind::parse(kind.as_str()), Some(kind));
        }
        assert_eq!(RelationKind::parse("nonsense"), None);
    }

    #[test]
    fn test_metadata_primary_label_prefers_role() {
        let meta = ChunkMetadata {
            semantic_matches: vec![
                SemanticMatch {
                    category: "type".into(),
                    value: "function".into(),
                    label: "Function Definition".into(),
                },
                SemanticMatch {
                    category: "role".into(),
                    value: "test_case".into(),
                    label: "Unit/Integration Test Case".into(),
                },
            ],
            ..Default::default()
        };
        assert_eq!(meta.primary_label(), "Unit/Integration Test Case");
    }

    #[test]
    fn test_metadata_json_omits_empty_fields() {
        let meta = ChunkMetadata::default();
        let json = serde_json::to_string(&meta).unwrap();
        assert_eq!(json, "{}");
    }

    #[test]
    fn test_render_contains_sections() {
        let ctx = RetrievedContext {
            node_id: "n1".into(),
            file_path: "src/app.py".into(),
            content: "def foo():\n    return 1".into(),
            semantic_labels: vec!["Function Definition".into()],
            score: 0.5,
            retrieval_method: "hybrid".into(),
            start_line: 1,
            end_line: 2,
            snapshot_id: "s1".into(),
            language: "python".into(),
            parent_context: None,
            outgoing_definitions: vec!["bar".into()],
            nav_hints: NavHints::default(),
        };
        let rendered = ctx.render();
        assert!(rendered.contains("[CONTEXT]"));
        assert!(rendered.contains("[CODE]"));
        assert!(rendered.contains("[RELATIONS]"));
        assert!(rendered.contains("```python"));
        assert!(rendered.contains("- bar"));
    }
}
