//! Shared fixtures: an in-process VCS fake and engine construction helpers.
#![allow(dead_code)]

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use async_trait::async_trait;
use parking_lot::Mutex;
use tempfile::TempDir;

use muster::config::{OrchConfig, OrchPaths};
use muster::error::{MusterError, Result};
use muster::orchestrator::Engine;
use muster::vcs::{VcsAdapter, WorktreeInfo};

/// In-process VCS double. Worktree adds create real directories so child
/// processes can use them as working directories; diffs are scripted per
/// worktree path.
#[derive(Default)]
pub struct FakeVcs {
    pub diffs: Mutex<HashMap<PathBuf, String>>,
    pub branches: Mutex<HashMap<PathBuf, String>>,
    pub removed: Mutex<Vec<PathBuf>>,
    pub commits: Mutex<Vec<(PathBuf, String)>>,
    pub fail_worktree_add: AtomicBool,
    commit_seq: AtomicUsize,
}

impl FakeVcs {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_diff(&self, worktree: &Path, diff: &str) {
        self.diffs.lock().insert(worktree.to_path_buf(), diff.into());
    }
}

#[async_trait]
impl VcsAdapter for FakeVcs {
    async fn worktree_add(
        &self,
        _repo: &Path,
        path: &Path,
        branch: &str,
        _base: &str,
    ) -> Result<()> {
        if self.fail_worktree_add.load(Ordering::SeqCst) {
            return Err(MusterError::vcs("scripted worktree failure", path));
        }
        tokio::fs::create_dir_all(path).await?;
        self.branches
            .lock()
            .insert(path.to_path_buf(), branch.to_string());
        Ok(())
    }

    async fn worktree_remove(&self, _repo: &Path, path: &Path) -> Result<()> {
        let _ = tokio::fs::remove_dir_all(path).await;
        self.branches.lock().remove(path);
        self.removed.lock().push(path.to_path_buf());
        Ok(())
    }

    async fn list_worktrees(&self, _repo: &Path) -> Result<Vec<WorktreeInfo>> {
        Ok(self
            .branches
            .lock()
            .iter()
            .map(|(path, branch)| WorktreeInfo {
                path: path.clone(),
                head: "0000000000000000000000000000000000000000".into(),
                branch: Some(branch.clone()),
                detached: false,
            })
            .collect())
    }

    async fn diff_against_base(&self, worktree: &Path, _base: &str) -> Result<String> {
        Ok(self
            .diffs
            .lock()
            .get(worktree)
            .cloned()
            .unwrap_or_default())
    }

    async fn stage_all(&self, _worktree: &Path) -> Result<()> {
        Ok(())
    }

    async fn commit(&self, worktree: &Path, message: &str) -> Result<Option<String>> {
        self.commits
            .lock()
            .push((worktree.to_path_buf(), message.to_string()));
        let n = self.commit_seq.fetch_add(1, Ordering::SeqCst);
        Ok(Some(format!("fakecommit{n:032}")))
    }

    async fn branch_exists(&self, _repo: &Path, _branch: &str) -> Result<bool> {
        Ok(false)
    }

    async fn delete_branch(&self, _repo: &Path, branch: &str) -> Result<bool> {
        let mut branches = self.branches.lock();
        let before = branches.len();
        branches.retain(|_, b| b.as_str() != branch);
        Ok(branches.len() != before)
    }

    async fn list_branches(&self, _repo: &Path, prefix: &str) -> Result<Vec<String>> {
        Ok(self
            .branches
            .lock()
            .values()
            .filter(|b| b.starts_with(prefix))
            .cloned()
            .collect())
    }
}

/// Fast-timing config for tests.
pub fn test_config() -> OrchConfig {
    let mut config = OrchConfig::default();
    config.supervisor.grace_period_secs = 1;
    config.supervisor.default_command = "sh".into();
    config.bus.retry_base_ms = 50;
    config
}

pub struct TestHarness {
    pub dir: TempDir,
    pub project: PathBuf,
    pub engine: Arc<Engine>,
    pub vcs: Arc<FakeVcs>,
}

pub async fn harness_with(config: OrchConfig) -> TestHarness {
    let dir = TempDir::new().unwrap();
    let project = dir.path().join("project");
    tokio::fs::create_dir_all(&project).await.unwrap();

    let paths = OrchPaths::new(dir.path().join("state"), &config);
    let vcs = Arc::new(FakeVcs::new());
    let engine = Engine::with_vcs(config, paths, vcs.clone());
    engine.start().await.unwrap();

    TestHarness {
        dir,
        project,
        engine,
        vcs,
    }
}

pub async fn harness() -> TestHarness {
    harness_with(test_config()).await
}

/// Poll until `check` passes or the timeout elapses.
pub async fn wait_for<F>(timeout_ms: u64, mut check: F)
where
    F: FnMut() -> bool,
{
    let deadline = tokio::time::Instant::now() + std::time::Duration::from_millis(timeout_ms);
    while !check() {
        if tokio::time::Instant::now() > deadline {
            panic!("condition not met within {timeout_ms}ms");
        }
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
    }
}
