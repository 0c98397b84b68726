//! Cross-file relation feed.
//!
//! External tools (SCIP-style indexers, LSP exports) produce byte-precise
//! relation rows between files; this adapter streams them into the store
//! in batches, where each endpoint resolves to the smallest containing
//! chunk or falls back to the file-level pseudo-node.
//!
//! The feed is advisory: a missing or failing extractor is logged and the
//! rest of the pipeline proceeds without cross-file edges.

use anyhow::Result;
use std::path::Path;

use crate::models::CodeRelation;
use crate::store::bulk::RelationReport;
use crate::store::GraphStore;

const INGEST_BATCH: usize = 10_000;

/// A pluggable source of cross-file relations for one worktree.
pub trait RelationSource: Send + Sync {
    fn name(&self) -> &str;

    /// Extract all relations for the checkout. Row order is irrelevant.
    fn extract(&self, worktree: &Path) -> Result<Vec<CodeRelation>>;
}

/// The default source: produces nothing.
pub struct NullRelationSource;

impl RelationSource for NullRelationSource {
    fn name(&self) -> &str {
        "null"
    }

    fn extract(&self, _worktree: &Path) -> Result<Vec<CodeRelation>> {
        Ok(Vec::new())
    }
}

/// Feed extracted relations into the snapshot in batches.
pub async fn ingest_relations(
    store: &GraphStore,
    snapshot_id: &str,
    rows: Vec<CodeRelation>,
) -> Result<RelationReport> {
    let mut report = RelationReport::default();
    for batch in rows.chunks(INGEST_BATCH) {
        let partial = store.ingest_cross_file_relations(snapshot_id, batch).await?;
        report.resolved += partial.resolved;
        report.file_fallback += partial.file_fallback;
        report.dropped += partial.dropped;
    }
    tracing::info!(
        resolved = report.resolved,
        file_fallback = report.file_fallback,
        dropped = report.dropped,
        "cross-file relations ingested"
    );
    Ok(report)
}
