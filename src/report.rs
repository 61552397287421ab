//! Batch run report.

use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::core::{TaskId, TaskStatus};
use crate::orchestration::IntegrationOutcome;
use crate::workflow::{Phase, PhaseRecord, PhaseStatus};
use crate::{ErrorKind, Result};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PhaseTiming {
    pub phase: Phase,
    pub status: PhaseStatus,
    pub retry_count: u32,
    pub duration_ms: Option<u64>,
}

impl From<&PhaseRecord> for PhaseTiming {
    fn from(record: &PhaseRecord) -> Self {
        Self {
            phase: record.phase,
            status: record.status,
            retry_count: record.retry_count,
            duration_ms: record
                .duration()
                .and_then(|d| d.to_std().ok())
                .map(|d| d.as_millis() as u64),
        }
    }
}

/// Final state of one task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskReport {
    pub task_id: TaskId,
    pub status: TaskStatus,
    pub attempts: u32,
    /// Phase the task failed in, if any.
    pub phase: Option<Phase>,
    pub error_kind: Option<ErrorKind>,
    pub error: Option<String>,
    pub last_checkpoint: Option<Phase>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub phases: Vec<PhaseTiming>,
    pub integration: Option<IntegrationOutcome>,
    /// Workspace left in place for manual resolution.
    pub kept_workspace: Option<PathBuf>,
}

impl TaskReport {
    pub fn new(task_id: TaskId) -> Self {
        Self {
            task_id,
            status: TaskStatus::Pending,
            attempts: 0,
            phase: None,
            error_kind: None,
            error: None,
            last_checkpoint: None,
            started_at: None,
            finished_at: None,
            phases: Vec::new(),
            integration: None,
            kept_workspace: None,
        }
    }

    pub fn duration_ms(&self) -> Option<u64> {
        match (self.started_at, self.finished_at) {
            (Some(start), Some(end)) => (end - start).to_std().ok().map(|d| d.as_millis() as u64),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusCounts {
    pub completed: usize,
    pub failed: usize,
    pub blocked: usize,
    pub abandoned: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchReport {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub concurrency: usize,
    pub peak_concurrency: usize,
    pub cancelled: bool,
    /// Set when an infrastructure failure stopped the batch early.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub aborted: Option<String>,
    /// In declaration order.
    pub tasks: Vec<TaskReport>,
}

impl BatchReport {
    pub fn get(&self, id: &TaskId) -> Option<&TaskReport> {
        self.tasks.iter().find(|t| &t.task_id == id)
    }

    pub fn duration_ms(&self) -> u64 {
        (self.finished_at - self.started_at)
            .to_std()
            .map(|d| d.as_millis() as u64)
            .unwrap_or(0)
    }

    pub fn counts(&self) -> StatusCounts {
        let mut counts = StatusCounts::default();
        for task in &self.tasks {
            match task.status {
                TaskStatus::Completed => counts.completed += 1,
                TaskStatus::Failed { .. } => counts.failed += 1,
                TaskStatus::Blocked { .. } => counts.blocked += 1,
                TaskStatus::Abandoned => counts.abandoned += 1,
                _ => {}
            }
        }
        counts
    }

    /// True when no task failed or was blocked.
    pub fn succeeded(&self) -> bool {
        !self.tasks.iter().any(|t| t.status.is_failure())
    }

    /// 0 on success, 1 when any task failed or was blocked, 130 when the
    /// run was cancelled without failures, 2 when the batch was aborted.
    pub fn exit_code(&self) -> u8 {
        if self.aborted.is_some() {
            2
        } else if !self.succeeded() {
            1
        } else if self.cancelled {
            130
        } else {
            0
        }
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    pub fn write_to(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        std::fs::write(path, self.to_json()?)?;
        Ok(())
    }
}
