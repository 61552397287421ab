//! Integration of finished task branches into the shared target.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::core::TaskId;
use crate::hosts::{MergeOutcome, VersionControlHost};
use crate::isolation::ExecutionContext;
use crate::Result;

/// Recorded result of integrating one task.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IntegrationOutcome {
    pub task_id: TaskId,
    pub branch: String,
    pub target: String,
    /// Whether uncommitted workspace changes were recorded first.
    pub committed: bool,
    #[serde(flatten)]
    pub merge: MergeOutcome,
    pub integrated_at: DateTime<Utc>,
}

impl IntegrationOutcome {
    pub fn needs_manual_resolution(&self) -> bool {
        self.merge.is_conflict()
    }

    pub fn conflict_paths(&self) -> &[String] {
        match &self.merge {
            MergeOutcome::Conflict { paths } => paths,
            _ => &[],
        }
    }
}

/// Merges task branches one at a time into `target`.
pub struct ResultAggregator {
    vcs: Arc<dyn VersionControlHost>,
    target: String,
    recorded: Mutex<HashMap<TaskId, IntegrationOutcome>>,
}

impl ResultAggregator {
    pub fn new(vcs: Arc<dyn VersionControlHost>, target: impl Into<String>) -> Self {
        Self {
            vcs,
            target: target.into(),
            recorded: Mutex::new(HashMap::new()),
        }
    }

    pub fn target(&self) -> &str {
        &self.target
    }

    /// Integrate the context's branch. A task already integrated returns
    /// its recorded outcome without touching the repository.
    pub async fn integrate(
        &self,
        task_id: &TaskId,
        context: &ExecutionContext,
    ) -> Result<IntegrationOutcome> {
        // Held across the merge so integrations never interleave.
        let mut recorded = self.recorded.lock().await;
        if let Some(outcome) = recorded.get(task_id) {
            debug!(task = %task_id, "Already integrated, returning recorded outcome");
            return Ok(outcome.clone());
        }

        let committed = self
            .vcs
            .commit_workspace(&context.workspace, &format!("foreman: {}", task_id))
            .await?;
        let merge = self.vcs.merge(&context.branch, &self.target).await?;

        match &merge {
            MergeOutcome::Conflict { paths } => warn!(
                task = %task_id,
                branch = %context.branch,
                target = %self.target,
                paths = ?paths,
                "Integration needs manual resolution"
            ),
            MergeOutcome::Merged {
                commit,
                fast_forward,
            } => info!(
                task = %task_id,
                target = %self.target,
                %commit,
                fast_forward,
                "Task integrated"
            ),
            MergeOutcome::UpToDate => {
                info!(task = %task_id, target = %self.target, "Target already up to date")
            }
        }

        let outcome = IntegrationOutcome {
            task_id: task_id.clone(),
            branch: context.branch.clone(),
            target: self.target.clone(),
            committed,
            merge,
            integrated_at: Utc::now(),
        };
        recorded.insert(task_id.clone(), outcome.clone());
        Ok(outcome)
    }

    pub async fn outcome(&self, task_id: &TaskId) -> Option<IntegrationOutcome> {
        self.recorded.lock().await.get(task_id).cloned()
    }

    /// Drop a recorded outcome so the task can be integrated again, e.g.
    /// after a conflict was resolved by hand.
    pub async fn forget(&self, task_id: &TaskId) -> Option<IntegrationOutcome> {
        self.recorded.lock().await.remove(task_id)
    }
}

impl std::fmt::Debug for ResultAggregator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResultAggregator")
            .field("target", &self.target)
            .finish()
    }
}
