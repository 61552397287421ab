use std::path::{Path, PathBuf};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::git::GitOps;
use crate::util::blocking;
use crate::Result;

/// Outcome of integrating one branch into another.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "outcome")]
pub enum MergeOutcome {
    Merged { commit: String, fast_forward: bool },
    /// The target already contains the branch.
    UpToDate,
    /// Needs manual resolution; nothing was written.
    Conflict { paths: Vec<String> },
}

impl MergeOutcome {
    pub fn is_conflict(&self) -> bool {
        matches!(self, MergeOutcome::Conflict { .. })
    }
}

/// Version control operations the coordinator depends on. Failures are
/// treated as transient.
#[async_trait]
pub trait VersionControlHost: Send + Sync {
    /// Working root of the coordinating repository, which must never be
    /// used as a task workspace.
    fn root(&self) -> Option<&Path>;

    /// Create `branch` and materialize it at `workspace`.
    async fn create_isolated_branch(&self, branch: &str, workspace: &Path) -> Result<()>;

    async fn branch_exists(&self, branch: &str) -> Result<bool>;

    /// Record pending workspace changes on its branch. Returns whether
    /// anything was recorded.
    async fn commit_workspace(&self, workspace: &Path, message: &str) -> Result<bool>;

    async fn merge(&self, branch: &str, target: &str) -> Result<MergeOutcome>;

    /// Remove the workspace and its branch. Already-missing pieces are fine.
    async fn delete_branch(&self, branch: &str, workspace: &Path) -> Result<()>;
}

/// git2-backed host using one worktree per task.
#[derive(Debug, Clone)]
pub struct GitHost {
    ops: GitOps,
    root: PathBuf,
}

impl GitHost {
    pub fn open(repo_path: &Path) -> Result<Self> {
        let ops = GitOps::new(repo_path)?;
        let root = ops.repo_path().to_path_buf();
        Ok(Self { ops, root })
    }
}

#[async_trait]
impl VersionControlHost for GitHost {
    fn root(&self) -> Option<&Path> {
        Some(&self.root)
    }

    async fn create_isolated_branch(&self, branch: &str, workspace: &Path) -> Result<()> {
        let ops = self.ops.clone();
        let branch = branch.to_string();
        let workspace = workspace.to_path_buf();
        blocking(move || {
            if let Err(e) = ops.prune_stale_worktrees() {
                warn!(error = %e, "Could not prune stale worktrees");
            }
            ops.create_worktree(&branch, &workspace)
        })
        .await
    }

    async fn branch_exists(&self, branch: &str) -> Result<bool> {
        let ops = self.ops.clone();
        let branch = branch.to_string();
        blocking(move || ops.branch_exists(&branch)).await
    }

    async fn commit_workspace(&self, workspace: &Path, message: &str) -> Result<bool> {
        let ops = self.ops.clone();
        let workspace = workspace.to_path_buf();
        let message = message.to_string();
        blocking(move || ops.commit_all(&workspace, &message)).await
    }

    async fn merge(&self, branch: &str, target: &str) -> Result<MergeOutcome> {
        let ops = self.ops.clone();
        let branch = branch.to_string();
        let target = target.to_string();
        debug!(%branch, %target, "Merging");
        blocking(move || ops.merge_into(&branch, &target)).await
    }

    async fn delete_branch(&self, branch: &str, workspace: &Path) -> Result<()> {
        let ops = self.ops.clone();
        let branch = branch.to_string();
        let workspace = workspace.to_path_buf();
        blocking(move || {
            ops.remove_worktree(&workspace)?;
            ops.delete_branch(&branch)
        })
        .await
    }
}
