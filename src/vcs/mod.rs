//! Version-control adapter.
//!
//! The only component that touches the parent repository, always by
//! shelling out to the `git` CLI. Everything else stays pure with respect
//! to the repository; tests swap in an in-process fake behind [`VcsAdapter`].

mod git;

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use serde::Serialize;

use crate::error::Result;

pub use git::GitCli;

/// The adapter's own view of a working copy.
#[derive(Debug, Clone, Serialize)]
pub struct WorktreeInfo {
    pub path: PathBuf,
    pub head: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub branch: Option<String>,
    pub detached: bool,
}

#[async_trait]
pub trait VcsAdapter: Send + Sync {
    /// Create a working copy at `path` on `branch`, branching from `base`
    /// when the branch does not exist yet.
    async fn worktree_add(&self, repo: &Path, path: &Path, branch: &str, base: &str)
    -> Result<()>;

    async fn worktree_remove(&self, repo: &Path, path: &Path) -> Result<()>;

    async fn list_worktrees(&self, repo: &Path) -> Result<Vec<WorktreeInfo>>;

    /// Unified diff of the working copy (committed and uncommitted) against
    /// the named base revision.
    async fn diff_against_base(&self, worktree: &Path, base: &str) -> Result<String>;

    async fn stage_all(&self, worktree: &Path) -> Result<()>;

    /// Commit staged changes. Returns the commit id, or `None` when there
    /// was nothing to commit.
    async fn commit(&self, worktree: &Path, message: &str) -> Result<Option<String>>;

    async fn branch_exists(&self, repo: &Path, branch: &str) -> Result<bool>;

    async fn delete_branch(&self, repo: &Path, branch: &str) -> Result<bool>;

    /// Local branches under a prefix, e.g. `agent/`.
    async fn list_branches(&self, repo: &Path, prefix: &str) -> Result<Vec<String>>;
}
