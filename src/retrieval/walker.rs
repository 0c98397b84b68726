//! Graph walker: one-hop context expansion around a search hit.

use anyhow::Result;

use crate::store::GraphStore;

/// Structural and relational neighborhood of one chunk.
#[derive(Debug, Clone, Default)]
pub struct ExpandedContext {
    /// Human-readable "where am I" line for the enclosing block.
    pub parent_context: Option<String>,
    /// Symbols reachable through outgoing `calls`/`defines`/`references`
    /// edges, deduplicated, capped at 20.
    pub outgoing_definitions: Vec<String>,
}

pub struct GraphWalker {
    store: GraphStore,
}

impl GraphWalker {
    pub fn new(store: GraphStore) -> Self {
        Self { store }
    }

    pub async fn expand_context(&self, chunk_id: &str) -> Result<ExpandedContext> {
        let neighbors = self.store.get_context_neighbors(chunk_id).await?;

        let parent_context = neighbors.parents.first().map(|parent| {
            format!(
                "Inside {} defined in {} (L{})",
                parent.metadata.primary_label(),
                parent.file_path,
                parent.start_line
            )
        });

        let mut outgoing = Vec::new();
        for call in &neighbors.calls {
            let Some(symbol) = &call.symbol else { continue };
            if symbol.is_empty() || symbol == "unknown" || symbol.contains('<') {
                continue;
            }
            if !outgoing.contains(symbol) {
                outgoing.push(symbol.clone());
            }
        }
        outgoing.truncate(20);

        Ok(ExpandedContext {
            parent_context,
            outgoing_definitions: outgoing,
        })
    }
}
