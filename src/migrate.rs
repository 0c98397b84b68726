//! Database schema migrations.
//!
//! Creates all required tables and ensures idempotent execution.
//! Designed to be run via `cgx db upgrade`.
//!
//! # Schema
//!
//! ```text
//! ┌──────────────┐     ┌──────────────┐     ┌──────────────┐
//! │ repositories │──┐  │  snapshots   │──┐  │    files     │
//! │              │  │  │              │  │  │              │
//! │ id (PK)      │  └──│ repository_id│  └──│ snapshot_id  │
//! │ url, branch  │     │ commit_hash  │     │ path         │
//! │ name         │     │ status       │     │ file_hash    │
//! │ current_     │     │ stats        │     │ language     │
//! │  snapshot_id │     │ file_manifest│     │ category     │
//! └──────────────┘     └──────────────┘     └──────┬───────┘
//!                                                  │
//! ┌──────────────┐     ┌──────────────┐     ┌──────┴───────┐
//! │   contents   │◀────│    nodes     │────▶│    edges     │
//! │              │     │              │     │              │
//! │ chunk_hash PK│     │ id (PK)      │     │ source_id    │
//! │ content      │     │ file_id      │     │ target_id    │
//! │ size_bytes   │     │ byte_start/  │     │ relation_type│
//! └──────────────┘     │  byte_end    │     └──────────────┘
//!                      │ chunk_hash   │
//!                      │ metadata     │     ┌───────────────┐
//!                      └──────┬───────┘     │ node_embeddings│
//!                             │             │ (chunk, model) │
//!                      ┌──────┴───────┐     │ vector_hash    │
//!                      │  nodes_fts   │     │ embedding BLOB │
//!                      │  (FTS5)      │     └───────────────┘
//!                      └──────────────┘
//! ```
//!
//! # Concurrency guards baked into the schema
//!
//! - `ix_one_active_indexing` — a partial unique index that allows at most
//!   one `indexing` snapshot per repository; `create_snapshot` treats the
//!   unique violation as "repository busy".
//! - `embedding_runs` — one row per snapshot while an embedding pipeline is
//!   running; inserted atomically to enforce a single writer on staging.
//!
//! # Idempotency
//!
//! All operations use `CREATE TABLE IF NOT EXISTS` or check `sqlite_master`
//! before creating virtual tables. Running `cgx db upgrade` repeatedly is
//! safe.

use anyhow::Result;
use sqlx::SqlitePool;

/// Run all database migrations.
pub async fn run_migrations(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS repositories (
            id TEXT PRIMARY KEY,
            url TEXT NOT NULL,
            branch TEXT NOT NULL,
            name TEXT NOT NULL,
            current_snapshot_id TEXT,
            reindex_requested_at INTEGER,
            created_at INTEGER NOT NULL,
            updated_at INTEGER NOT NULL,
            UNIQUE(url, branch)
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS snapshots (
            id TEXT PRIMARY KEY,
            repository_id TEXT NOT NULL,
            commit_hash TEXT NOT NULL,
            status TEXT NOT NULL DEFAULT 'indexing',
            created_at INTEGER NOT NULL,
            completed_at INTEGER,
            stats TEXT NOT NULL DEFAULT '{}',
            file_manifest TEXT NOT NULL DEFAULT '{}',
            FOREIGN KEY (repository_id) REFERENCES repositories(id) ON DELETE CASCADE
        )
        "#,
    )
    .execute(pool)
    .await?;

    // At most one in-flight indexing run per repository. The unique
    // violation on insert is the advisory lock.
    sqlx::query(
        r#"
        CREATE UNIQUE INDEX IF NOT EXISTS ix_one_active_indexing
        ON snapshots(repository_id) WHERE status = 'indexing'
        "#,
    )
    .execute(pool)
    .await?;

    // Content-addressed blob store, shared across snapshots.
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS contents (
            chunk_hash TEXT PRIMARY KEY,
            content TEXT NOT NULL,
            size_bytes INTEGER NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS files (
            id TEXT PRIMARY KEY,
            snapshot_id TEXT NOT NULL,
            path TEXT NOT NULL,
            file_hash TEXT,
            content_hash TEXT,
            commit_hash TEXT,
            language TEXT NOT NULL,
            size_bytes INTEGER NOT NULL,
            category TEXT NOT NULL,
            indexed_at INTEGER NOT NULL,
            parsing_status TEXT NOT NULL DEFAULT 'success',
            parsing_error TEXT,
            FOREIGN KEY (snapshot_id) REFERENCES snapshots(id) ON DELETE CASCADE,
            UNIQUE(snapshot_id, path)
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS nodes (
            id TEXT PRIMARY KEY,
            file_id TEXT NOT NULL,
            file_path TEXT NOT NULL,
            chunk_hash TEXT NOT NULL,
            start_line INTEGER NOT NULL,
            end_line INTEGER NOT NULL,
            byte_start INTEGER NOT NULL,
            byte_end INTEGER NOT NULL,
            size INTEGER NOT NULL,
            metadata TEXT NOT NULL DEFAULT '{}',
            FOREIGN KEY (file_id) REFERENCES files(id) ON DELETE CASCADE,
            UNIQUE(file_id, byte_start, byte_end)
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS edges (
            source_id TEXT NOT NULL,
            target_id TEXT NOT NULL,
            relation_type TEXT NOT NULL,
            metadata TEXT NOT NULL DEFAULT '{}',
            UNIQUE(source_id, target_id, relation_type),
            FOREIGN KEY (source_id) REFERENCES nodes(id) ON DELETE CASCADE,
            FOREIGN KEY (target_id) REFERENCES nodes(id) ON DELETE CASCADE
        )
        "#,
    )
    .execute(pool)
    .await?;
    sqlx::query("CREATE INDEX IF NOT EXISTS ix_edges_source ON edges(source_id)")
        .execute(pool)
        .await?;
    sqlx::query("CREATE INDEX IF NOT EXISTS ix_edges_target ON edges(target_id)")
        .execute(pool)
        .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS node_embeddings (
            chunk_id TEXT NOT NULL,
            model_name TEXT NOT NULL,
            snapshot_id TEXT NOT NULL,
            file_id TEXT NOT NULL,
            vector_hash TEXT NOT NULL,
            embedding BLOB,
            created_at INTEGER NOT NULL,
            PRIMARY KEY (chunk_id, model_name),
            FOREIGN KEY (chunk_id) REFERENCES nodes(id) ON DELETE CASCADE,
            FOREIGN KEY (snapshot_id) REFERENCES snapshots(id) ON DELETE CASCADE
        )
        "#,
    )
    .execute(pool)
    .await?;
    sqlx::query(
        "CREATE INDEX IF NOT EXISTS ix_embeddings_snapshot ON node_embeddings(snapshot_id)",
    )
    .execute(pool)
    .await?;
    sqlx::query(
        "CREATE INDEX IF NOT EXISTS ix_embeddings_vector_hash ON node_embeddings(vector_hash)",
    )
    .execute(pool)
    .await?;

    // FTS5 virtual table over pre-tokenized chunk text (not idempotent
    // natively, check first). Tokens are produced by the engine's code
    // tokenizer; tokenchars keeps identifiers with underscores whole.
    let fts_exists: bool = sqlx::query_scalar(
        "SELECT COUNT(*) > 0 FROM sqlite_master WHERE type='table' AND name='nodes_fts'",
    )
    .fetch_one(pool)
    .await?;

    if !fts_exists {
        sqlx::query(
            r#"
            CREATE VIRTUAL TABLE nodes_fts USING fts5(
                chunk_id UNINDEXED,
                tags,
                content,
                tokenize = "unicode61 tokenchars '_'"
            )
            "#,
        )
        .execute(pool)
        .await?;
    }

    // Ephemeral embedding staging; dropped and recreated by prepare_staging,
    // created here so the schema is complete after `db upgrade`.
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS staging_embeddings (
            chunk_id TEXT NOT NULL,
            model_name TEXT NOT NULL,
            snapshot_id TEXT NOT NULL,
            file_id TEXT NOT NULL,
            vector_hash TEXT NOT NULL,
            prompt TEXT NOT NULL,
            embedding BLOB,
            errored INTEGER NOT NULL DEFAULT 0,
            PRIMARY KEY (chunk_id, model_name)
        )
        "#,
    )
    .execute(pool)
    .await?;

    // Single-writer coordination for embedding runs.
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS embedding_runs (
            snapshot_id TEXT PRIMARY KEY,
            model_name TEXT NOT NULL,
            started_at INTEGER NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    Ok(())
}
