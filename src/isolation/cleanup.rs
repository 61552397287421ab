//! Orphan detection for contexts no live batch owns.

use std::collections::HashSet;
use std::path::PathBuf;

use tracing::{info, warn};

use super::{ExecutionContext, IsolationManager};
use crate::core::TaskId;
use crate::Result;

/// Report of cleanup operations performed.
#[derive(Debug, Clone, Default)]
pub struct CleanupReport {
    /// Contexts no known task owns.
    pub orphaned: Vec<ExecutionContext>,
    /// Workspaces that were removed.
    pub removed: Vec<PathBuf>,
    /// Workspaces that could not be removed.
    pub failed: Vec<(PathBuf, String)>,
}

impl CleanupReport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn orphaned_count(&self) -> usize {
        self.orphaned.len()
    }

    pub fn removed_count(&self) -> usize {
        self.removed.len()
    }

    pub fn is_success(&self) -> bool {
        self.failed.is_empty()
    }
}

impl IsolationManager {
    /// Contexts on disk whose task is not in `known`. Nothing is deleted.
    pub async fn detect_orphans(&self, known: &HashSet<TaskId>) -> Result<CleanupReport> {
        let mut report = CleanupReport::new();
        report.orphaned = self
            .list_active()
            .await?
            .into_iter()
            .filter(|c| !known.contains(&c.task_id))
            .collect();
        if !report.orphaned.is_empty() {
            info!(count = report.orphaned.len(), "Orphaned contexts detected");
        }
        Ok(report)
    }

    /// Release each context, collecting failures instead of stopping.
    pub async fn remove_orphans(&self, orphans: &[ExecutionContext]) -> CleanupReport {
        let mut report = CleanupReport::new();
        for orphan in orphans {
            let mut context = orphan.clone();
            match self.release(&mut context).await {
                Ok(()) => report.removed.push(context.workspace),
                Err(e) => {
                    warn!(
                        workspace = %context.workspace.display(),
                        error = %e,
                        "Failed to remove orphaned context"
                    );
                    report.failed.push((context.workspace, e.to_string()));
                }
            }
        }
        report
    }
}
