//! Shared fixtures for integration tests.

#![allow(dead_code)]

use std::path::{Path, PathBuf};
use std::process::Command;

use codegraph_harness::config::Config;
use codegraph_harness::store::GraphStore;
use codegraph_harness::{db, migrate};

pub fn git(dir: &Path, args: &[&str]) {
    let out = Command::new("git")
        .args(args)
        .current_dir(dir)
        .output()
        .expect("git not installed");
    assert!(
        out.status.success(),
        "git {:?} failed: {}",
        args,
        String::from_utf8_lossy(&out.stderr)
    );
}

pub fn init_repo(dir: &Path) {
    std::fs::create_dir_all(dir).unwrap();
    git(dir, &["init", "-q"]);
    git(dir, &["config", "user.email", "dev@example.com"]);
    git(dir, &["config", "user.name", "Dev"]);
}

pub fn commit_all(dir: &Path, message: &str) {
    git(dir, &["add", "-A"]);
    git(dir, &["commit", "-qm", message]);
    git(dir, &["branch", "-M", "main"]);
}

/// The three-file fixture used across the end-to-end scenarios:
/// `a.py` defines `foo`, `b.py` imports and calls it, `c.md` is a doc.
pub fn write_fixture(dir: &Path) {
    std::fs::write(
        dir.join("a.py"),
        "def foo(value):\n    \"\"\"Scale the input.\"\"\"\n    total = value * 3\n    return total + 1\n",
    )
    .unwrap();
    std::fs::write(dir.join("b.py"), "from a import foo\n\nresult = foo(41)\n").unwrap();
    std::fs::write(dir.join("c.md"), "# Notes\n\nSmall doc.\n").unwrap();
}

pub struct TestEnv {
    pub tmp: tempfile::TempDir,
    pub config: Config,
    pub store: GraphStore,
    pub repo_dir: PathBuf,
}

impl TestEnv {
    pub fn repo_url(&self) -> String {
        self.repo_dir.display().to_string()
    }

    pub fn db_path(&self) -> PathBuf {
        self.tmp.path().join("graph.sqlite")
    }
}

/// A migrated store, a volume root, and an empty fixture repo directory.
pub async fn test_env() -> TestEnv {
    let tmp = tempfile::tempdir().unwrap();
    let config = Config::with_paths(tmp.path().join("graph.sqlite"), tmp.path().join("volume"));
    let pool = db::connect(&config).await.unwrap();
    migrate::run_migrations(&pool).await.unwrap();
    let store = GraphStore::new(pool);
    let repo_dir = tmp.path().join("fixture");
    init_repo(&repo_dir);
    TestEnv {
        tmp,
        config,
        store,
        repo_dir,
    }
}

/// Count non-pseudo chunks for one file path in a snapshot.
pub async fn chunk_count(store: &GraphStore, snapshot_id: &str, path: &str) -> i64 {
    sqlx::query_scalar(
        r#"
        SELECT COUNT(*) FROM nodes n
        JOIN files f ON f.id = n.file_id
        WHERE f.snapshot_id = ? AND f.path = ?
          AND json_extract(n.metadata, '$.pseudo') IS NULL
        "#,
    )
    .bind(snapshot_id)
    .bind(path)
    .fetch_one(store.pool())
    .await
    .unwrap()
}
