use std::path::{Path, PathBuf};

use git2::{BranchType, ErrorCode, IndexAddOption, Repository, Signature, WorktreePruneOptions};
use tracing::{debug, warn};

use crate::hosts::MergeOutcome;
use crate::{Error, Result};

/// Synchronous git2 operations. Callers on the async side go through
/// `util::blocking`.
#[derive(Debug, Clone)]
pub struct GitOps {
    repo_path: PathBuf,
}

impl GitOps {
    pub fn new(repo_path: &Path) -> Result<Self> {
        debug!(path = %repo_path.display(), "GitOps::new");
        let repo = Repository::discover(repo_path)?;
        let root = repo
            .workdir()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| repo_path.to_path_buf());
        Ok(Self { repo_path: root })
    }

    fn repo(&self) -> Result<Repository> {
        Ok(Repository::discover(&self.repo_path)?)
    }

    /// Working directory of the coordinating repository.
    pub fn repo_path(&self) -> &Path {
        &self.repo_path
    }

    fn signature(repo: &Repository) -> Result<Signature<'static>> {
        Ok(repo
            .signature()
            .or_else(|_| Signature::now("Foreman", "foreman@localhost"))?)
    }

    /// Create `branch` from HEAD and check it out in a new worktree at
    /// `worktree_path`.
    pub fn create_worktree(&self, branch: &str, worktree_path: &Path) -> Result<()> {
        debug!(branch, path = %worktree_path.display(), "Creating worktree");
        let repo = self.repo()?;
        let commit = repo.head()?.peel_to_commit()?;
        let branch_ref = repo.branch(branch, &commit, false)?.into_reference();
        let mut opts = git2::WorktreeAddOptions::new();
        opts.reference(Some(&branch_ref));
        // Branch names may contain slashes; the folder name is always flat.
        let worktree_name = worktree_path
            .file_name()
            .and_then(|n| n.to_str())
            .ok_or_else(|| {
                Error::Validation(format!("Invalid worktree path {}", worktree_path.display()))
            })?;
        if let Err(e) = repo.worktree(worktree_name, worktree_path, Some(&opts)) {
            // Leave no half-created branch behind.
            if let Ok(mut created) = repo.find_branch(branch, BranchType::Local) {
                let _ = created.delete();
            }
            return Err(e.into());
        }
        debug!(branch, commit = %commit.id(), "Worktree created");
        Ok(())
    }

    /// Remove a worktree directory and its admin entry. Missing worktrees are
    /// not an error.
    pub fn remove_worktree(&self, worktree_path: &Path) -> Result<()> {
        debug!(path = %worktree_path.display(), "Removing worktree");
        let repo = self.repo()?;
        let folder_name = worktree_path
            .file_name()
            .and_then(|n| n.to_str())
            .map(String::from);

        let worktree_name = repo
            .worktrees()?
            .iter()
            .flatten()
            .find(|name| {
                repo.find_worktree(name)
                    .map(|wt| wt.path() == worktree_path)
                    .unwrap_or(false)
                    || Some(*name) == folder_name.as_deref()
            })
            .map(String::from);

        if let Some(name) = &worktree_name {
            if let Ok(worktree) = repo.find_worktree(name) {
                let _ = worktree.unlock();
                if let Err(e) = worktree.prune(Some(
                    WorktreePruneOptions::new()
                        .valid(true)
                        .working_tree(true)
                        .locked(true),
                )) {
                    warn!(worktree = %name, error = %e, "Worktree prune failed");
                }
            }
            // If the admin dir survives, git still considers the branch checked out.
            let admin_dir = repo.path().join("worktrees").join(name);
            if admin_dir.exists() {
                let _ = std::fs::remove_dir_all(&admin_dir);
            }
        }

        if worktree_path.exists() {
            std::fs::remove_dir_all(worktree_path)?;
        }
        Ok(())
    }

    /// Prune worktree entries whose directories no longer exist.
    pub fn prune_stale_worktrees(&self) -> Result<usize> {
        let repo = self.repo()?;
        let mut pruned = 0;
        for name in repo.worktrees()?.iter().flatten() {
            let Ok(worktree) = repo.find_worktree(name) else {
                continue;
            };
            if worktree.path().exists() {
                continue;
            }
            if worktree
                .prune(Some(
                    WorktreePruneOptions::new()
                        .valid(true)
                        .working_tree(true)
                        .locked(true),
                ))
                .is_ok()
            {
                pruned += 1;
            }
        }
        if pruned > 0 {
            debug!(pruned, "Pruned stale worktrees");
        }
        Ok(pruned)
    }

    pub fn branch_exists(&self, branch: &str) -> Result<bool> {
        let repo = self.repo()?;
        let exists = match repo.find_branch(branch, BranchType::Local) {
            Ok(_) => true,
            Err(e) if e.code() == ErrorCode::NotFound => false,
            Err(e) => return Err(e.into()),
        };
        Ok(exists)
    }

    /// Delete a local branch. Returns Ok if it does not exist.
    pub fn delete_branch(&self, branch: &str) -> Result<()> {
        let repo = self.repo()?;
        match repo.find_branch(branch, BranchType::Local) {
            Ok(mut branch_ref) => {
                branch_ref.delete()?;
                debug!(branch, "Branch deleted");
            }
            Err(e) if e.code() == ErrorCode::NotFound => {
                debug!(branch, "Branch already gone");
            }
            Err(e) => return Err(e.into()),
        };
        Ok(())
    }

    /// Commit every change in the worktree. Returns false when there was
    /// nothing to commit.
    pub fn commit_all(&self, worktree_path: &Path, message: &str) -> Result<bool> {
        let repo = Repository::open(worktree_path)?;
        if repo.statuses(None)?.is_empty() {
            return Ok(false);
        }
        let mut index = repo.index()?;
        index.add_all(["."].iter(), IndexAddOption::DEFAULT, None)?;
        index.write()?;

        let tree = repo.find_tree(index.write_tree()?)?;
        let sig = Self::signature(&repo)?;
        let parent = match repo.head() {
            Ok(head) => Some(head.peel_to_commit()?),
            Err(e) if e.code() == ErrorCode::UnbornBranch => None,
            Err(e) => return Err(e.into()),
        };
        let parents: Vec<&git2::Commit> = parent.iter().collect();
        let commit_id = repo.commit(Some("HEAD"), &sig, &sig, message, &tree, &parents)?;
        debug!(path = %worktree_path.display(), commit = %commit_id, "Committed worktree changes");
        Ok(true)
    }

    /// Merge `branch` into `target` without touching any working tree.
    ///
    /// The target branch is created from HEAD when missing. Fast-forwards
    /// when possible, otherwise writes a merge commit if the in-memory merge
    /// is clean. Conflicts leave both branches untouched.
    pub fn merge_into(&self, branch: &str, target: &str) -> Result<MergeOutcome> {
        let repo = self.repo()?;
        let theirs = repo
            .find_branch(branch, BranchType::Local)?
            .get()
            .peel_to_commit()?;

        if let Ok(head) = repo.head() {
            if head.is_branch() && head.shorthand() == Some(target) {
                return Err(Error::Validation(format!(
                    "Target branch {} is checked out in {}",
                    target,
                    self.repo_path.display()
                )));
            }
        }

        let target_branch = match repo.find_branch(target, BranchType::Local) {
            Ok(b) => b,
            Err(e) if e.code() == ErrorCode::NotFound => {
                let head_commit = repo.head()?.peel_to_commit()?;
                debug!(target, base = %head_commit.id(), "Creating target branch");
                repo.branch(target, &head_commit, false)?
            }
            Err(e) => return Err(e.into()),
        };
        let ours = target_branch.get().peel_to_commit()?;
        let refname = format!("refs/heads/{}", target);

        if ours.id() == theirs.id() || repo.graph_descendant_of(ours.id(), theirs.id())? {
            return Ok(MergeOutcome::UpToDate);
        }

        if repo.graph_descendant_of(theirs.id(), ours.id())? {
            repo.reference(
                &refname,
                theirs.id(),
                true,
                &format!("foreman: fast-forward {} into {}", branch, target),
            )?;
            return Ok(MergeOutcome::Merged {
                commit: theirs.id().to_string(),
                fast_forward: true,
            });
        }

        let mut index = repo.merge_commits(&ours, &theirs, None)?;
        if index.has_conflicts() {
            let mut paths = Vec::new();
            for conflict in index.conflicts()? {
                let conflict = conflict?;
                if let Some(entry) = conflict
                    .our
                    .as_ref()
                    .or(conflict.their.as_ref())
                    .or(conflict.ancestor.as_ref())
                {
                    paths.push(String::from_utf8_lossy(&entry.path).into_owned());
                }
            }
            paths.sort();
            paths.dedup();
            return Ok(MergeOutcome::Conflict { paths });
        }

        let tree = repo.find_tree(index.write_tree_to(&repo)?)?;
        let sig = Self::signature(&repo)?;
        let commit_id = repo.commit(
            Some(&refname),
            &sig,
            &sig,
            &format!("Merge {} into {}", branch, target),
            &tree,
            &[&ours, &theirs],
        )?;
        Ok(MergeOutcome::Merged {
            commit: commit_id.to_string(),
            fast_forward: false,
        })
    }

    #[cfg(test)]
    pub fn branch_commit(&self, branch: &str) -> Result<String> {
        let repo = self.repo()?;
        let commit = repo
            .find_branch(branch, BranchType::Local)?
            .get()
            .peel_to_commit()?;
        Ok(commit.id().to_string())
    }
}
