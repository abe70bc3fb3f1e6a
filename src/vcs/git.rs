use std::path::{Path, PathBuf};
use std::process::Output;
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use tokio::process::Command;
use tokio::sync::Mutex;
use tracing::{debug, warn};

use super::{VcsAdapter, WorktreeInfo};
use crate::error::{MusterError, Result};

/// Git CLI adapter. Mutating operations are serialized per repository so
/// concurrent worktree adds never race on the index.
pub struct GitCli {
    repo_locks: DashMap<PathBuf, Arc<Mutex<()>>>,
}

impl GitCli {
    pub fn new() -> Self {
        Self {
            repo_locks: DashMap::new(),
        }
    }

    fn lock_for(&self, repo: &Path) -> Arc<Mutex<()>> {
        self.repo_locks
            .entry(repo.to_path_buf())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    async fn run(&self, dir: &Path, args: &[&str]) -> Result<Output> {
        debug!(args = ?args, dir = %dir.display(), "Running git command");

        let output = Command::new("git")
            .args(args)
            .current_dir(dir)
            .output()
            .await?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            warn!(args = ?args, stderr = %stderr, "Git command failed");
        }

        Ok(output)
    }

    async fn run_checked(&self, dir: &Path, args: &[&str]) -> Result<Output> {
        let output = self.run(dir, args).await?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(MusterError::vcs(stderr.trim().to_string(), dir));
        }

        Ok(output)
    }

    fn path_str(path: &Path) -> Result<&str> {
        path.to_str()
            .ok_or_else(|| MusterError::vcs("Invalid path encoding", path))
    }
}

impl Default for GitCli {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl VcsAdapter for GitCli {
    async fn worktree_add(
        &self,
        repo: &Path,
        path: &Path,
        branch: &str,
        base: &str,
    ) -> Result<()> {
        let lock = self.lock_for(repo);
        let _guard = lock.lock().await;

        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        let path_str = Self::path_str(path)?;
        let output = if self.branch_exists_inner(repo, branch).await? {
            self.run(repo, &["worktree", "add", path_str, branch]).await?
        } else {
            self.run(repo, &["worktree", "add", "-b", branch, path_str, base])
                .await?
        };

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(MusterError::vcs(stderr.trim().to_string(), path));
        }

        Ok(())
    }

    async fn worktree_remove(&self, repo: &Path, path: &Path) -> Result<()> {
        let lock = self.lock_for(repo);
        let _guard = lock.lock().await;

        let path_str = Self::path_str(path)?;
        let output = self
            .run(repo, &["worktree", "remove", "--force", path_str])
            .await?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(MusterError::vcs(stderr.trim().to_string(), path));
        }

        Ok(())
    }

    async fn list_worktrees(&self, repo: &Path) -> Result<Vec<WorktreeInfo>> {
        let output = self
            .run_checked(repo, &["worktree", "list", "--porcelain"])
            .await?;
        let stdout = String::from_utf8_lossy(&output.stdout);
        Ok(parse_worktree_list(&stdout))
    }

    async fn diff_against_base(&self, worktree: &Path, base: &str) -> Result<String> {
        let output = self.run_checked(worktree, &["diff", base]).await?;
        Ok(String::from_utf8_lossy(&output.stdout).to_string())
    }

    async fn stage_all(&self, worktree: &Path) -> Result<()> {
        self.run_checked(worktree, &["add", "-A"]).await?;
        Ok(())
    }

    async fn commit(&self, worktree: &Path, message: &str) -> Result<Option<String>> {
        let output = self.run(worktree, &["commit", "-m", message]).await?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            let stdout = String::from_utf8_lossy(&output.stdout);
            if stderr.contains("nothing to commit") || stdout.contains("nothing to commit") {
                return Ok(None);
            }
            return Err(MusterError::vcs(stderr.trim().to_string(), worktree));
        }

        let head = self
            .run_checked(worktree, &["rev-parse", "HEAD"])
            .await?;
        Ok(Some(
            String::from_utf8_lossy(&head.stdout).trim().to_string(),
        ))
    }

    async fn branch_exists(&self, repo: &Path, branch: &str) -> Result<bool> {
        self.branch_exists_inner(repo, branch).await
    }

    async fn delete_branch(&self, repo: &Path, branch: &str) -> Result<bool> {
        let lock = self.lock_for(repo);
        let _guard = lock.lock().await;
        let output = self.run(repo, &["branch", "-D", branch]).await?;
        Ok(output.status.success())
    }

    async fn list_branches(&self, repo: &Path, prefix: &str) -> Result<Vec<String>> {
        let output = self
            .run(repo, &["branch", "--list", &format!("{prefix}*")])
            .await?;
        let stdout = String::from_utf8_lossy(&output.stdout);
        Ok(stdout
            .lines()
            .map(|l| l.trim().trim_start_matches("* ").to_string())
            .filter(|l| !l.is_empty())
            .collect())
    }
}

impl GitCli {
    async fn branch_exists_inner(&self, repo: &Path, branch: &str) -> Result<bool> {
        let output = self
            .run(
                repo,
                &["rev-parse", "--verify", &format!("refs/heads/{branch}")],
            )
            .await?;
        Ok(output.status.success())
    }
}

fn parse_worktree_list(porcelain: &str) -> Vec<WorktreeInfo> {
    let mut worktrees = Vec::new();
    let mut current: Option<WorktreeInfo> = None;

    for line in porcelain.lines() {
        if let Some(path) = line.strip_prefix("worktree ") {
            if let Some(info) = current.take() {
                worktrees.push(info);
            }
            current = Some(WorktreeInfo {
                path: PathBuf::from(path),
                head: String::new(),
                branch: None,
                detached: false,
            });
        } else if let Some(head) = line.strip_prefix("HEAD ")
            && let Some(info) = current.as_mut()
        {
            info.head = head.to_string();
        } else if let Some(branch) = line.strip_prefix("branch ")
            && let Some(info) = current.as_mut()
        {
            info.branch = Some(
                branch
                    .strip_prefix("refs/heads/")
                    .unwrap_or(branch)
                    .to_string(),
            );
        } else if line == "detached"
            && let Some(info) = current.as_mut()
        {
            info.detached = true;
        }
    }

    if let Some(info) = current {
        worktrees.push(info);
    }

    worktrees
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_worktree_list() {
        let porcelain = "\
worktree /repo
HEAD 1111111111111111111111111111111111111111
branch refs/heads/main

worktree /repo/.orch/worktrees/w-1
HEAD 2222222222222222222222222222222222222222
branch refs/heads/agent/fix-auth-w1

worktree /repo/.orch/worktrees/w-2
HEAD 3333333333333333333333333333333333333333
detached
";
        let worktrees = parse_worktree_list(porcelain);
        assert_eq!(worktrees.len(), 3);
        assert_eq!(worktrees[0].branch.as_deref(), Some("main"));
        assert_eq!(
            worktrees[1].branch.as_deref(),
            Some("agent/fix-auth-w1")
        );
        assert!(worktrees[2].detached);
        assert!(worktrees[2].branch.is_none());
        assert!(worktrees[2].head.starts_with("3333"));
    }

    #[test]
    fn test_parse_worktree_list_empty() {
        assert!(parse_worktree_list("").is_empty());
    }
}
