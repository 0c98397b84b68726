//! Local Git volume management: bare mirrors and ephemeral worktrees.
//!
//! Each repository URL maps to `<REPO_VOLUME>/<hash(url)>/` holding a bare
//! mirror (`mirror.git`) plus per-snapshot worktrees under `worktrees/`.
//! The mirror is updated under an exclusive on-disk lock so two indexing
//! runs on the same machine never fetch concurrently; worktrees are
//! per-snapshot and never shared.

use anyhow::{bail, Context, Result};
use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};
use std::process::Command;
use std::time::Duration;

pub struct GitVolumeManager {
    root: PathBuf,
}

/// An ephemeral checkout tied to one snapshot. The directory and the git
/// worktree registration are removed on drop.
pub struct Worktree {
    path: PathBuf,
    mirror: PathBuf,
}

impl Worktree {
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for Worktree {
    fn drop(&mut self) {
        let _ = Command::new("git")
            .args(["worktree", "remove", "--force"])
            .arg(&self.path)
            .current_dir(&self.mirror)
            .output();
        let _ = Command::new("git")
            .args(["worktree", "prune"])
            .current_dir(&self.mirror)
            .output();
        if self.path.exists() {
            let _ = std::fs::remove_dir_all(&self.path);
        }
    }
}

/// Exclusive per-repository lock, held while the mirror is mutated.
struct RepoLock {
    path: PathBuf,
}

impl RepoLock {
    fn acquire(dir: &Path) -> Result<Self> {
        let path = dir.join(".lock");
        let deadline = std::time::Instant::now() + Duration::from_secs(300);
        loop {
            match std::fs::OpenOptions::new()
                .write(true)
                .create_new(true)
                .open(&path)
            {
                Ok(_) => return Ok(Self { path }),
                Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                    if std::time::Instant::now() > deadline {
                        bail!("timed out waiting for repo lock at {}", path.display());
                    }
                    std::thread::sleep(Duration::from_millis(200));
                }
                Err(e) => {
                    return Err(e).with_context(|| format!("creating lock {}", path.display()))
                }
            }
        }
    }
}

impl Drop for RepoLock {
    fn drop(&mut self) {
        let _ = std::fs::remove_file(&self.path);
    }
}

impl GitVolumeManager {
    pub fn new(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        std::fs::create_dir_all(&root)
            .with_context(|| format!("creating volume root {}", root.display()))?;
        Ok(Self { root })
    }

    fn repo_dir(&self, url: &str) -> PathBuf {
        let mut hasher = Sha256::new();
        hasher.update(url.as_bytes());
        let digest = format!("{:x}", hasher.finalize());
        self.root.join(&digest[..16])
    }

    fn mirror_path(&self, url: &str) -> PathBuf {
        self.repo_dir(url).join("mirror.git")
    }

    /// Clone the bare mirror on first sight, fetch updates afterwards.
    /// Serialized per repository via the on-disk lock.
    pub fn ensure_repo_updated(&self, url: &str) -> Result<()> {
        let dir = self.repo_dir(url);
        std::fs::create_dir_all(&dir)?;
        let _lock = RepoLock::acquire(&dir)?;

        let mirror = self.mirror_path(url);
        if mirror.join("HEAD").exists() {
            tracing::info!(url, "fetching mirror updates");
            let output = Command::new("git")
                .args(["fetch", "--all", "--prune"])
                .current_dir(&mirror)
                .output()
                .with_context(|| "Failed to execute 'git fetch'. Is git installed?")?;
            if !output.status.success() {
                let stderr = String::from_utf8_lossy(&output.stderr);
                bail!("git fetch failed for {}: {}", url, stderr.trim());
            }
        } else {
            tracing::info!(url, "cloning bare mirror");
            let output = Command::new("git")
                .args(["clone", "--mirror"])
                .arg(url)
                .arg(&mirror)
                .output()
                .with_context(|| "Failed to execute 'git clone'. Is git installed?")?;
            if !output.status.success() {
                let stderr = String::from_utf8_lossy(&output.stderr);
                bail!("git clone failed for {}: {}", url, stderr.trim());
            }
        }
        Ok(())
    }

    /// Resolve `branch` (or a tag of that name) to a commit hash in the
    /// local mirror.
    pub fn head_commit(&self, url: &str, branch: &str) -> Result<String> {
        let mirror = self.mirror_path(url);
        let candidates = [
            branch.to_string(),
            format!("refs/heads/{}", branch),
            format!("refs/tags/{}", branch),
        ];

        for reference in &candidates {
            let output = Command::new("git")
                .args(["rev-parse", reference])
                .current_dir(&mirror)
                .output()
                .with_context(|| "Failed to execute 'git rev-parse'")?;
            if output.status.success() {
                return Ok(String::from_utf8_lossy(&output.stdout).trim().to_string());
            }
        }

        bail!("ref '{}' not found in {}", branch, url)
    }

    /// Provision a detached worktree for `commit`, keyed by snapshot id.
    /// The returned guard removes the checkout on drop.
    pub fn create_worktree(&self, url: &str, commit: &str, snapshot_id: &str) -> Result<Worktree> {
        let mirror = self.mirror_path(url);
        let worktrees = self.repo_dir(url).join("worktrees");
        std::fs::create_dir_all(&worktrees)?;
        let path = worktrees.join(snapshot_id);

        tracing::info!(commit = &commit[..commit.len().min(8)], "creating worktree");
        let output = Command::new("git")
            .args(["worktree", "add", "--detach"])
            .arg(&path)
            .arg(commit)
            .current_dir(&mirror)
            .output()
            .with_context(|| "Failed to execute 'git worktree add'")?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            bail!("git worktree add failed: {}", stderr.trim());
        }

        Ok(Worktree { path, mirror })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_repo_dir_is_stable_and_distinct() {
        let tmp = tempfile::tempdir().unwrap();
        let mgr = GitVolumeManager::new(tmp.path()).unwrap();
        let a1 = mgr.repo_dir("https://example.com/a.git");
        let a2 = mgr.repo_dir("https://example.com/a.git");
        let b = mgr.repo_dir("https://example.com/b.git");
        assert_eq!(a1, a2);
        assert_ne!(a1, b);
        assert!(a1.starts_with(tmp.path()));
    }

    #[test]
    fn test_repo_lock_is_exclusive() {
        let tmp = tempfile::tempdir().unwrap();
        let lock = RepoLock::acquire(tmp.path()).unwrap();
        assert!(tmp.path().join(".lock").exists());
        drop(lock);
        assert!(!tmp.path().join(".lock").exists());
    }
}
