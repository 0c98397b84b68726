//! Scope-aware recursive chunking.
//!
//! Walks the syntax tree and splits a file into byte-precise chunks sized
//! to a target budget. Container nodes (classes, functions, impl blocks)
//! are chunk barriers; everything between barriers accumulates into group
//! chunks so the emitted ranges cover the file in source order. A barrier
//! too large for the budget is split into a header chunk plus its body's
//! chunks, linked with `child_of` edges; an oversized node with no body is
//! emitted atomically and flagged.
//!
//! Invariants upheld here:
//! - chunks are emitted in source order with pairwise-disjoint byte ranges;
//! - `child_of` edges form a forest per file;
//! - a chunk of exactly `MAX_CHUNK_BYTES + CHUNK_TOLERANCE` bytes carries
//!   no flag, one byte more is flagged `oversize`.

use sha2::{Digest, Sha256};
use std::collections::HashMap;
use tree_sitter::Node;
use uuid::Uuid;

use super::queries::SemanticCapture;
use crate::models::{
    ChunkContent, ChunkMetadata, ChunkNode, EdgeRecord, RelationKind,
};

/// Target chunk size in bytes.
pub const MAX_CHUNK_BYTES: usize = 800;
/// Atomic nodes up to `MAX_CHUNK_BYTES + CHUNK_TOLERANCE` stand alone.
pub const CHUNK_TOLERANCE: usize = 400;

/// Syntax kinds treated as chunk barriers.
const CONTAINER_KINDS: &[&str] = &[
    "class_definition",
    "class_declaration",
    "function_definition",
    "function_declaration",
    "generator_function_declaration",
    "method_definition",
    "method_declaration",
    "async_function_definition",
    "decorated_definition",
    "export_statement",
    "interface_declaration",
    "function_item",
    "impl_item",
    "mod_item",
    "struct_item",
    "enum_item",
    "trait_item",
];

/// Kinds that count as glue: absorbed into the following barrier chunk
/// instead of forming a chunk of their own.
const GLUE_KINDS: &[&str] = &["comment", "line_comment", "block_comment", "decorator"];

pub struct Chunker<'a> {
    source: &'a [u8],
    file_id: &'a str,
    file_path: &'a str,
    captures: &'a [SemanticCapture],
    newlines: Vec<usize>,
    nodes: Vec<ChunkNode>,
    contents: HashMap<String, ChunkContent>,
    edges: Vec<EdgeRecord>,
}

pub struct ChunkSet {
    pub nodes: Vec<ChunkNode>,
    pub contents: Vec<ChunkContent>,
    pub edges: Vec<EdgeRecord>,
}

impl<'a> Chunker<'a> {
    pub fn new(
        source: &'a [u8],
        file_id: &'a str,
        file_path: &'a str,
        captures: &'a [SemanticCapture],
    ) -> Self {
        let newlines = source
            .iter()
            .enumerate()
            .filter_map(|(i, b)| (*b == b'\n').then_some(i))
            .collect();
        Self {
            source,
            file_id,
            file_path,
            captures,
            newlines,
            nodes: Vec::new(),
            contents: HashMap::new(),
            edges: Vec::new(),
        }
    }

    pub fn run(mut self, root: Node) -> ChunkSet {
        self.process_children(root, None);
        self.nodes.sort_by_key(|n| n.byte_start);
        ChunkSet {
            nodes: self.nodes,
            contents: self.contents.into_values().collect(),
            edges: self.edges,
        }
    }

    /// Iterate the children of `scope`, grouping small statements and gaps
    /// into coverage chunks and recursing into oversized barriers.
    fn process_children(&mut self, scope: Node, parent: Option<&str>) {
        let scope_end = scope.end_byte();
        let mut cursor = scope.start_byte();
        let mut group_start: Option<usize> = None;
        let mut group_only_glue = true;

        let mut walk = scope.walk();
        let children: Vec<Node> = scope.children(&mut walk).collect();
        drop(walk);

        for child in children {
            let kind = child.kind();
            if CONTAINER_KINDS.contains(&kind) {
                let pending_start = group_start.take().unwrap_or(cursor);
                let mut barrier_start = child.start_byte();
                if pending_start < child.start_byte() {
                    let pending = &self.source[pending_start..child.start_byte()];
                    if group_only_glue || is_blank(pending) {
                        // Comments and whitespace ride along with the barrier.
                        barrier_start = pending_start;
                    } else {
                        self.emit(pending_start, child.start_byte(), parent, Vec::new());
                    }
                }
                group_only_glue = true;

                if child.end_byte() - barrier_start <= MAX_CHUNK_BYTES + CHUNK_TOLERANCE {
                    self.emit(barrier_start, child.end_byte(), parent, extract_tags(child));
                } else {
                    self.split_large(child, barrier_start, parent);
                }
                cursor = child.end_byte();
            } else {
                if group_start.is_none() {
                    group_start = Some(cursor);
                }
                if !GLUE_KINDS.contains(&kind) {
                    group_only_glue = false;
                }
                cursor = child.end_byte();

                let group_len = cursor - group_start.unwrap_or(cursor);
                if group_len > MAX_CHUNK_BYTES {
                    let remaining = scope_end.saturating_sub(cursor);
                    if remaining > CHUNK_TOLERANCE {
                        self.emit(group_start.take().unwrap(), cursor, parent, Vec::new());
                        group_only_glue = true;
                    }
                }
            }
        }

        let tail_start = group_start.unwrap_or(cursor);
        if tail_start < scope_end {
            self.emit(tail_start, scope_end, parent, Vec::new());
        }
    }

    /// A barrier larger than the budget: separate its header (signature,
    /// decorators, leading glue) from its body, then chunk the body with
    /// the header as parent. No body means the node is atomic and flagged.
    fn split_large(&mut self, node: Node, start_with_glue: usize, parent: Option<&str>) {
        let target = effective_node(node);
        let Some(body) = body_of(target) else {
            self.emit(start_with_glue, node.end_byte(), parent, extract_tags(node));
            return;
        };

        let header_id = self.emit(
            start_with_glue,
            body.start_byte(),
            parent,
            extract_tags(node),
        );
        let inner_parent = header_id.clone();
        let inner_parent = inner_parent.as_deref().or(parent);
        self.process_children(body, inner_parent);

        if body.end_byte() < node.end_byte() {
            self.emit(body.end_byte(), node.end_byte(), inner_parent, Vec::new());
        }
    }

    /// Create one chunk over `[start, end)`. Blank slices are skipped.
    /// Returns the new chunk id.
    fn emit(
        &mut self,
        start: usize,
        end: usize,
        parent: Option<&str>,
        tags: Vec<String>,
    ) -> Option<String> {
        if start >= end {
            return None;
        }
        let raw = &self.source[start..end];
        if is_blank(raw) {
            return None;
        }

        let text = String::from_utf8_lossy(raw).to_string();
        let mut hasher = Sha256::new();
        hasher.update(raw);
        let chunk_hash = format!("{:x}", hasher.finalize());

        self.contents
            .entry(chunk_hash.clone())
            .or_insert_with(|| ChunkContent {
                chunk_hash: chunk_hash.clone(),
                content: text.clone(),
            });

        let start_line = self.line_at(start);
        let end_line = start_line + text.matches('\n').count() as i64;

        let mut semantic_matches = Vec::new();
        for cap in self.captures {
            let contains = start >= cap.start && end <= cap.end;
            let contained = cap.start >= start && cap.end <= end;
            if contains || contained {
                let m = cap.to_match();
                if !semantic_matches.contains(&m) {
                    semantic_matches.push(m);
                }
            }
        }

        let id = Uuid::new_v4().to_string();
        self.nodes.push(ChunkNode {
            id: id.clone(),
            file_id: self.file_id.to_string(),
            file_path: self.file_path.to_string(),
            chunk_hash,
            start_line,
            end_line,
            byte_start: start as i64,
            byte_end: end as i64,
            metadata: ChunkMetadata {
                semantic_matches,
                tags,
                oversize: end - start > MAX_CHUNK_BYTES + CHUNK_TOLERANCE,
                pseudo: None,
            },
        });

        if let Some(parent_id) = parent {
            self.edges.push(EdgeRecord {
                source_id: id.clone(),
                target_id: parent_id.to_string(),
                relation: RelationKind::ChildOf,
                metadata: serde_json::json!({"tool": "chunker"}),
            });
        }

        Some(id)
    }

    /// 1-based line number of a byte offset.
    fn line_at(&self, byte: usize) -> i64 {
        (self.newlines.partition_point(|n| *n < byte) + 1) as i64
    }
}

/// Look through wrapper nodes to the definition they decorate or export.
fn effective_node(node: Node) -> Node {
    match node.kind() {
        "decorated_definition" => node.child_by_field_name("definition").unwrap_or(node),
        "export_statement" => node
            .child_by_field_name("declaration")
            .or_else(|| node.child_by_field_name("value"))
            .unwrap_or(node),
        _ => node,
    }
}

fn body_of(node: Node) -> Option<Node> {
    node.child_by_field_name("body")
        .or_else(|| node.child_by_field_name("block"))
}

fn is_blank(bytes: &[u8]) -> bool {
    bytes.iter().all(|b| b.is_ascii_whitespace())
}

/// Structural tags carried on barrier chunks.
fn extract_tags(node: Node) -> Vec<String> {
    let mut tags = Vec::new();
    let kind = node.kind();

    let mut walk = node.walk();
    let children: Vec<Node> = node.children(&mut walk).collect();
    drop(walk);

    if kind.starts_with("async_") || children.iter().any(|c| c.kind() == "async") {
        tags.push("async".to_string());
    }
    if kind == "decorated_definition" || children.iter().any(|c| c.kind() == "decorator") {
        tags.push("decorated".to_string());
    }
    if kind == "export_statement"
        || node
            .parent()
            .map(|p| p.kind() == "export_statement")
            .unwrap_or(false)
    {
        tags.push("exported".to_string());
    }
    if kind.contains("constructor") {
        tags.push("constructor".to_string());
    }
    if children.iter().any(|c| c.kind() == "static") {
        tags.push("static".to_string());
    }
    tags
}
