//! Binary-driven CLI tests.

mod common;

use std::path::PathBuf;
use std::process::Command;

use common::{commit_all, init_repo, write_fixture};

fn cgx_binary() -> PathBuf {
    let mut path = std::env::current_exe().unwrap();
    path.pop(); // remove test binary name
    path.pop(); // remove deps/
    path.push("cgx");
    path
}

struct CliEnv {
    _tmp: tempfile::TempDir,
    db_path: PathBuf,
    volume: PathBuf,
    repo_dir: PathBuf,
}

fn setup() -> CliEnv {
    let tmp = tempfile::tempdir().unwrap();
    let db_path = tmp.path().join("graph.sqlite");
    let volume = tmp.path().join("volume");
    let repo_dir = tmp.path().join("fixture");
    init_repo(&repo_dir);
    write_fixture(&repo_dir);
    commit_all(&repo_dir, "fixture");
    CliEnv {
        _tmp: tmp,
        db_path,
        volume,
        repo_dir,
    }
}

fn run_cgx(env: &CliEnv, args: &[&str]) -> (String, String, Option<i32>) {
    let binary = cgx_binary();
    let output = Command::new(&binary)
        .args(args)
        .env("DB_URL", &env.db_path)
        .env("REPO_VOLUME", &env.volume)
        .env_remove("EMBEDDING_API_KEY")
        .output()
        .unwrap_or_else(|e| panic!("Failed to run cgx binary at {:?}: {}", binary, e));

    (
        String::from_utf8_lossy(&output.stdout).to_string(),
        String::from_utf8_lossy(&output.stderr).to_string(),
        output.status.code(),
    )
}

fn repo_url(env: &CliEnv) -> String {
    env.repo_dir.display().to_string()
}

#[test]
fn test_db_upgrade_is_idempotent() {
    let env = setup();
    let (stdout, stderr, code) = run_cgx(&env, &["db", "upgrade"]);
    assert_eq!(code, Some(0), "db upgrade failed: {stderr}");
    assert!(stdout.contains("up to date"));

    let (_, _, code) = run_cgx(&env, &["db", "upgrade"]);
    assert_eq!(code, Some(0));
    assert!(env.db_path.exists());
}

#[test]
fn test_index_prints_snapshot_id_and_is_idempotent() {
    let env = setup();
    let url = repo_url(&env);

    let (stdout, stderr, code) = run_cgx(&env, &["index", &url]);
    assert_eq!(code, Some(0), "index failed: {stderr}");
    let first = stdout.trim().to_string();
    assert!(!first.is_empty() && first != "queued");

    // Same commit, no --force: same snapshot id comes back.
    let (stdout, _, code) = run_cgx(&env, &["index", &url]);
    assert_eq!(code, Some(0));
    assert_eq!(stdout.trim(), first);

    // --force builds a fresh snapshot.
    let (stdout, _, code) = run_cgx(&env, &["index", &url, "--force"]);
    assert_eq!(code, Some(0));
    assert_ne!(stdout.trim(), first);
}

#[test]
fn test_search_keyword_prints_json_lines() {
    let env = setup();
    let url = repo_url(&env);
    run_cgx(&env, &["index", &url]);

    let (stdout, stderr, code) = run_cgx(
        &env,
        &["search", &url, "foo", "--strategy", "keyword"],
    );
    assert_eq!(code, Some(0), "search failed: {stderr}");
    let lines: Vec<&str> = stdout.lines().filter(|l| !l.is_empty()).collect();
    assert!(!lines.is_empty());
    for line in &lines {
        let parsed: serde_json::Value = serde_json::from_str(line).unwrap();
        assert!(parsed.get("node_id").is_some());
        assert!(parsed.get("file_path").is_some());
    }
    assert!(stdout.contains("a.py") || stdout.contains("b.py"));
}

#[test]
fn test_embed_and_hybrid_search_with_mock_provider() {
    let env = setup();
    let url = repo_url(&env);
    run_cgx(&env, &["index", &url]);

    let (stdout, stderr, code) = run_cgx(&env, &["embed", &url, "--mock"]);
    assert_eq!(code, Some(0), "embed failed: {stderr}");
    assert!(stdout.contains("newly embedded: 2"), "got: {stdout}");

    // Second run: everything reused, nothing newly embedded.
    let (stdout, _, code) = run_cgx(&env, &["embed", &url, "--mock"]);
    assert_eq!(code, Some(0));
    assert!(stdout.contains("newly embedded: 0"), "got: {stdout}");
    assert!(stdout.contains("reused:         2"), "got: {stdout}");

    let (stdout, stderr, code) = run_cgx(
        &env,
        &["search", &url, "foo", "--strategy", "hybrid", "--mock"],
    );
    assert_eq!(code, Some(0), "hybrid search failed: {stderr}");
    assert!(stdout.contains("hybrid"));
}

#[test]
fn test_read_reconstructs_files() {
    let env = setup();
    let url = repo_url(&env);
    run_cgx(&env, &["index", &url]);

    let (stdout, _, code) = run_cgx(&env, &["read", &url, "a.py"]);
    assert_eq!(code, Some(0));
    assert!(stdout.contains("def foo"));

    // Markdown was skipped-structural; full text still served.
    let (stdout, _, code) = run_cgx(&env, &["read", &url, "c.md"]);
    assert_eq!(code, Some(0));
    assert_eq!(stdout, "# Notes\n\nSmall doc.\n");
}

#[test]
fn test_ls_lists_snapshot_root() {
    let env = setup();
    let url = repo_url(&env);
    run_cgx(&env, &["index", &url]);

    let (stdout, _, code) = run_cgx(&env, &["ls", &url]);
    assert_eq!(code, Some(0));
    let lines: Vec<&str> = stdout.lines().collect();
    assert_eq!(lines, vec!["a.py", "b.py", "c.md"]);
}

#[test]
fn test_stats_overview() {
    let env = setup();
    let url = repo_url(&env);
    run_cgx(&env, &["index", &url]);

    let (stdout, _, code) = run_cgx(&env, &["stats"]);
    assert_eq!(code, Some(0));
    assert!(stdout.contains("Repositories: 1"));
    assert!(stdout.contains("Files:        3"));
}

#[test]
fn test_unknown_repository_is_usage_error() {
    let env = setup();
    let (_, stderr, code) = run_cgx(&env, &["search", "https://nowhere/r.git", "foo"]);
    assert_eq!(code, Some(2));
    assert!(stderr.contains("unknown repository"));
}

#[test]
fn test_missing_db_url_fails() {
    let env = setup();
    let binary = cgx_binary();
    let output = Command::new(&binary)
        .args(["stats"])
        .env_remove("DB_URL")
        .env("REPO_VOLUME", &env.volume)
        .output()
        .unwrap();
    assert_ne!(output.status.code(), Some(0));
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("DB_URL"), "got: {stderr}");
}

#[test]
fn test_unknown_strategy_is_usage_error() {
    let env = setup();
    let url = repo_url(&env);
    run_cgx(&env, &["index", &url]);
    let (_, stderr, code) = run_cgx(&env, &["search", &url, "foo", "--strategy", "psychic"]);
    assert_eq!(code, Some(2));
    assert!(stderr.contains("unknown strategy"), "got: {stderr}");
}

#[test]
fn test_read_line_range() {
    let env = setup();
    let url = repo_url(&env);
    run_cgx(&env, &["index", &url]);

    let (stdout, _, code) = run_cgx(
        &env,
        &["read", &url, "a.py", "--start", "1", "--end", "1"],
    );
    assert_eq!(code, Some(0));
    assert_eq!(stdout.trim_end(), "def foo(value):");
}
