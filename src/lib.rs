//! # Codegraph Harness
//!
//! **Snapshot-isolated code property graph indexing and hybrid retrieval
//! for Git repositories.**
//!
//! Repositories are turned into a queryable graph of byte-precise code
//! chunks, cross-chunk relations, full-text tokens, and dense vector
//! embeddings — all persisted under snapshot isolation so readers see one
//! consistent commit while writers build the next.
//!
//! ## Architecture
//!
//! ```text
//! ┌───────────┐   ┌──────────────┐   ┌───────────────┐
//! │ Collector │──▶│ Parse workers │──▶│    SQLite     │
//! │ git ls-   │   │ tree-sitter   │   │ graph + FTS5  │
//! │ files     │   │ chunking      │   │ + vectors     │
//! └───────────┘   └──────────────┘   └───────┬───────┘
//!        ▲               ▲                   │
//!        │        ┌──────┴───────┐    ┌──────┴───────┐
//!  ┌─────┴─────┐  │  Relation    │    │  Retrieval   │
//!  │ Worktrees │  │  feed (SCIP- │    │  vector+FTS  │
//!  │ & mirrors │  │  style)      │    │  RRF + walker│
//!  └───────────┘  └──────────────┘    └──────────────┘
//! ```
//!
//! ## Write path
//!
//! 1. [`collector`] streams classified file descriptors out of a Git
//!    worktree using the object index.
//! 2. [`indexer`] splits cache hits (re-attached by Git blob hash) from
//!    misses and fans the misses across bounded parse workers.
//! 3. [`parser`] turns each file into chunks, contents, and intra-file
//!    `child_of` edges.
//! 4. [`relations`] resolves externally produced cross-file edges.
//! 5. [`store`] activates the snapshot atomically; readers cut over.
//!
//! ## Read path
//!
//! [`retrieval`] resolves the active snapshot, runs vector and keyword
//! search in parallel, fuses with Reciprocal Rank Fusion, and expands the
//! winners with parent context and outgoing symbols. [`reader`] and
//! [`navigator`] expose file reconstruction and graph traversal.

pub mod collector;
pub mod config;
pub mod db;
pub mod embedding;
pub mod error;
pub mod gitvolume;
pub mod indexer;
pub mod manifest;
pub mod migrate;
pub mod models;
pub mod navigator;
pub mod parser;
pub mod reader;
pub mod relations;
pub mod retrieval;
pub mod store;

pub use config::Config;
pub use error::StoreError;
pub use indexer::{CodebaseIndexer, IndexOutcome};
pub use reader::CodeReader;
pub use retrieval::{CodeRetriever, Strategy};
pub use store::GraphStore;
