//! Structural navigation and impact analysis.
//!
//! IDE-style traversal primitives over the stored graph: linear chunk
//! scrolling, parent jumps, reverse and forward call analysis, and a
//! bounded call-tree rendering for visualization.

use anyhow::{bail, Result};
use serde_json::{json, Map, Value};
use std::collections::HashSet;

use crate::store::graph::{ChunkDetail, EdgeEndpoint};
use crate::store::GraphStore;

pub struct CodeNavigator {
    store: GraphStore,
}

impl CodeNavigator {
    pub fn new(store: GraphStore) -> Self {
        Self { store }
    }

    /// The adjacent chunk in the same file; `None` at the file boundary.
    pub async fn read_neighbor_chunk(
        &self,
        chunk_id: &str,
        direction: &str,
    ) -> Result<Option<ChunkDetail>> {
        if direction != "next" && direction != "prev" {
            bail!("direction must be 'next' or 'prev'");
        }
        Ok(self.store.get_neighbor_chunk(chunk_id, direction).await?)
    }

    /// The enclosing container chunk via `child_of`, if any.
    pub async fn read_parent_chunk(&self, chunk_id: &str) -> Result<Option<ChunkDetail>> {
        let neighbors = self.store.get_context_neighbors(chunk_id).await?;
        Ok(neighbors.parents.into_iter().next())
    }

    /// Reverse call-graph analysis: who references this chunk?
    pub async fn analyze_impact(&self, chunk_id: &str, limit: i64) -> Result<Vec<EdgeEndpoint>> {
        Ok(self.store.get_incoming_references(chunk_id, limit).await?)
    }

    /// Forward call-graph analysis: what does this chunk depend on?
    pub async fn analyze_dependencies(&self, chunk_id: &str) -> Result<Vec<EdgeEndpoint>> {
        Ok(self.store.get_outgoing_calls(chunk_id, 50).await?)
    }

    /// A JSON call tree rooted at `chunk_id`, cut at `max_depth` and at
    /// cycles (each node expands at most once per walk).
    pub async fn visualize_pipeline(&self, chunk_id: &str, max_depth: usize) -> Result<Value> {
        let mut visited = HashSet::new();
        visited.insert(chunk_id.to_string());
        let tree = self.walk(chunk_id, 1, max_depth, &mut visited).await?;
        Ok(json!({
            "root_node": chunk_id,
            "call_graph": tree,
        }))
    }

    async fn walk(
        &self,
        chunk_id: &str,
        depth: usize,
        max_depth: usize,
        visited: &mut HashSet<String>,
    ) -> Result<Value> {
        if depth > max_depth {
            return Ok(Value::Null);
        }

        let calls = self.store.get_outgoing_calls(chunk_id, 10).await?;
        if calls.is_empty() {
            return Ok(Value::Object(Map::new()));
        }

        let mut tree = Map::new();
        for call in calls {
            let children = if visited.insert(call.node_id.clone()) {
                Box::pin(self.walk(&call.node_id, depth + 1, max_depth, visited)).await?
            } else {
                // Cycle cut: already expanded on this walk.
                Value::Null
            };
            tree.insert(
                call.node_id.clone(),
                json!({
                    "file": call.file_path,
                    "relation": call.relation,
                    "symbol": call.symbol,
                    "children": children,
                }),
            );
        }
        Ok(Value::Object(tree))
    }
}
