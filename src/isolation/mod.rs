//! Per-task execution contexts.
//!
//! Every admitted task gets its own workspace directory and branch, created
//! through the `VersionControlHost`. A JSON marker written beside each
//! workspace lets a later process rediscover contexts it did not create,
//! which is how orphans left by a crash are found.

mod cleanup;

pub use cleanup::CleanupReport;

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::config::IsolationConfig;
use crate::core::TaskId;
use crate::hosts::VersionControlHost;
use crate::util::blocking;
use crate::{Error, Result};

pub const MARKER_SUFFIX: &str = ".foreman.json";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ContextState {
    Active,
    Released,
}

/// An isolated workspace owned by exactly one task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionContext {
    pub task_id: TaskId,
    pub workspace: PathBuf,
    pub branch: String,
    pub created_at: DateTime<Utc>,
    pub state: ContextState,
}

impl ExecutionContext {
    #[cfg(test)]
    pub fn is_active(&self) -> bool {
        self.state == ContextState::Active
    }

    /// Sidecar file next to the workspace that records this context.
    pub fn marker_path(&self) -> PathBuf {
        marker_path_for(&self.workspace)
    }
}

fn marker_path_for(workspace: &Path) -> PathBuf {
    let name = workspace
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    workspace.with_file_name(format!("{}{}", name, MARKER_SUFFIX))
}

fn canonical(path: &Path) -> PathBuf {
    path.canonicalize().unwrap_or_else(|_| path.to_path_buf())
}

pub struct IsolationManager {
    root: PathBuf,
    branch_prefix: String,
    max_name_attempts: u32,
    strict: bool,
    protected: Vec<PathBuf>,
    vcs: Arc<dyn VersionControlHost>,
    active: Mutex<HashMap<TaskId, ExecutionContext>>,
}

impl IsolationManager {
    /// Create a manager rooted at `root`.
    ///
    /// Refuses a root that equals or contains the coordinating repository or
    /// the current directory.
    pub fn new(
        config: &IsolationConfig,
        root: PathBuf,
        vcs: Arc<dyn VersionControlHost>,
    ) -> Result<Self> {
        fs::create_dir_all(&root)?;
        let root = canonical(&root);

        let mut protected = Vec::new();
        if let Some(repo_root) = vcs.root() {
            protected.push(canonical(repo_root));
        }
        if let Ok(cwd) = std::env::current_dir() {
            protected.push(canonical(&cwd));
        }
        if let Some(p) = protected.iter().find(|p| p.starts_with(&root)) {
            return Err(Error::Validation(format!(
                "Workspace root {} must not contain the coordinating directory {}",
                root.display(),
                p.display()
            )));
        }

        debug!(root = %root.display(), prefix = %config.branch_prefix, "Isolation manager ready");
        Ok(Self {
            root,
            branch_prefix: config.branch_prefix.trim_matches('/').to_string(),
            max_name_attempts: config.max_name_attempts.max(1),
            strict: config.strict,
            protected,
            vcs,
            active: Mutex::new(HashMap::new()),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn is_protected(&self, path: &Path) -> bool {
        let path = canonical(path);
        self.protected.iter().any(|p| p == &path)
    }

    fn track(&self, context: &ExecutionContext) {
        if let Ok(mut active) = self.active.lock() {
            active.insert(context.task_id.clone(), context.clone());
        }
    }

    fn untrack(&self, task_id: &TaskId) {
        if let Ok(mut active) = self.active.lock() {
            active.remove(task_id);
        }
    }

    /// Contexts acquired by this process and not yet released.
    #[cfg(test)]
    pub fn in_memory(&self) -> Vec<ExecutionContext> {
        self.active
            .lock()
            .map(|a| a.values().cloned().collect())
            .unwrap_or_default()
    }

    /// Allocate a fresh workspace and branch for `task_id`.
    pub async fn acquire(&self, task_id: &TaskId) -> Result<ExecutionContext> {
        let creation_error = |reason: String| Error::EnvironmentCreation {
            task_id: task_id.clone(),
            reason,
        };
        let base = task_id.sanitized();

        for attempt in 1..=self.max_name_attempts {
            let name = if attempt == 1 {
                base.clone()
            } else {
                format!("{}-{}", base, attempt)
            };
            let workspace = self.root.join(&name);
            let branch = format!("{}/{}", self.branch_prefix, name);

            if self.is_protected(&workspace)
                || workspace.exists()
                || marker_path_for(&workspace).exists()
            {
                debug!(task = %task_id, %name, "Workspace name taken");
                continue;
            }
            if self
                .vcs
                .branch_exists(&branch)
                .await
                .map_err(|e| creation_error(e.to_string()))?
            {
                debug!(task = %task_id, %branch, "Branch name taken");
                continue;
            }

            self.vcs
                .create_isolated_branch(&branch, &workspace)
                .await
                .map_err(|e| creation_error(e.to_string()))?;

            let context = ExecutionContext {
                task_id: task_id.clone(),
                workspace,
                branch,
                created_at: Utc::now(),
                state: ContextState::Active,
            };
            if let Err(e) = write_marker(&context).await {
                warn!(task = %task_id, error = %e, "Could not write context marker, rolling back");
                if let Err(e) = self
                    .vcs
                    .delete_branch(&context.branch, &context.workspace)
                    .await
                {
                    warn!(task = %task_id, error = %e, "Rollback of workspace failed");
                }
                return Err(creation_error(e.to_string()));
            }

            info!(
                task = %task_id,
                workspace = %context.workspace.display(),
                branch = %context.branch,
                "Execution context acquired"
            );
            self.track(&context);
            return Ok(context);
        }

        Err(creation_error(format!(
            "no free workspace name after {} attempts",
            self.max_name_attempts
        )))
    }

    /// Tear down a context. Safe to call more than once.
    pub async fn release(&self, context: &mut ExecutionContext) -> Result<()> {
        let missing = !context.workspace.exists();

        self.vcs
            .delete_branch(&context.branch, &context.workspace)
            .await?;
        let workspace = context.workspace.clone();
        let marker = context.marker_path();
        blocking(move || {
            if workspace.exists() {
                fs::remove_dir_all(&workspace)?;
            }
            Ok(())
        })
        .await?;
        remove_marker(marker).await?;

        self.untrack(&context.task_id);
        context.state = ContextState::Released;
        if missing && self.strict {
            return Err(Error::EnvironmentMissing(
                context.workspace.display().to_string(),
            ));
        }
        debug!(task = %context.task_id, "Execution context released");
        Ok(())
    }

    /// Every context with a marker under the root, whether or not this
    /// process created it.
    pub async fn list_active(&self) -> Result<Vec<ExecutionContext>> {
        let root = self.root.clone();
        let protected = self.protected.clone();
        blocking(move || {
            let mut contexts = Vec::new();
            for entry in fs::read_dir(&root)?.flatten() {
                let path = entry.path();
                let is_marker = path
                    .file_name()
                    .and_then(|n| n.to_str())
                    .map(|n| n.ends_with(MARKER_SUFFIX))
                    .unwrap_or(false);
                if !is_marker {
                    continue;
                }
                let context: ExecutionContext = match fs::read_to_string(&path)
                    .map_err(Error::from)
                    .and_then(|s| serde_json::from_str(&s).map_err(Error::from))
                {
                    Ok(context) => context,
                    Err(e) => {
                        warn!(path = %path.display(), error = %e, "Skipping unreadable context marker");
                        continue;
                    }
                };
                if protected.iter().any(|p| p == &canonical(&context.workspace)) {
                    continue;
                }
                contexts.push(context);
            }
            contexts.sort_by(|a, b| a.created_at.cmp(&b.created_at));
            Ok(contexts)
        })
        .await
    }
}

async fn write_marker(context: &ExecutionContext) -> Result<()> {
    let contents = serde_json::to_string_pretty(context)?;
    let path = context.marker_path();
    blocking(move || {
        let temp = path.with_extension("tmp");
        fs::write(&temp, contents)?;
        fs::rename(&temp, &path)?;
        Ok(())
    })
    .await
}

async fn remove_marker(path: PathBuf) -> Result<()> {
    blocking(move || match fs::remove_file(&path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e.into()),
    })
    .await
}

impl std::fmt::Debug for IsolationManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IsolationManager")
            .field("root", &self.root)
            .field("branch_prefix", &self.branch_prefix)
            .field("strict", &self.strict)
            .finish()
    }
}
