//! Phase and phase-record type definitions.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::core::TaskId;

/// Phases every task passes through, in order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    Setup,
    Planning,
    Implementation,
    Verification,
    Integration,
    Finalization,
}

impl Phase {
    /// Every phase in execution order.
    pub const ALL: [Phase; 6] = [
        Phase::Setup,
        Phase::Planning,
        Phase::Implementation,
        Phase::Verification,
        Phase::Integration,
        Phase::Finalization,
    ];

    pub fn index(&self) -> usize {
        *self as usize
    }

    pub fn first() -> Phase {
        Phase::Setup
    }

    pub fn next(&self) -> Option<Phase> {
        Phase::ALL.get(self.index() + 1).copied()
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Phase::Setup => "setup",
            Phase::Planning => "planning",
            Phase::Implementation => "implementation",
            Phase::Verification => "verification",
            Phase::Integration => "integration",
            Phase::Finalization => "finalization",
        }
    }
}

impl std::fmt::Display for Phase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Phase {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Phase::ALL
            .iter()
            .copied()
            .find(|p| p.as_str() == s)
            .ok_or_else(|| format!("unknown phase '{}'", s))
    }
}

/// Status of a single phase attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum PhaseStatus {
    #[default]
    Pending,
    InProgress,
    Completed,
    Failed,
}

impl std::fmt::Display for PhaseStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PhaseStatus::Pending => write!(f, "pending"),
            PhaseStatus::InProgress => write!(f, "in_progress"),
            PhaseStatus::Completed => write!(f, "completed"),
            PhaseStatus::Failed => write!(f, "failed"),
        }
    }
}

/// A record of one attempt at one phase.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PhaseRecord {
    pub task_id: TaskId,
    pub phase: Phase,
    pub status: PhaseStatus,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    /// Number of earlier failed attempts at this phase.
    #[serde(default)]
    pub retry_count: u32,
    /// Artifact paths the phase produced, relative to the workspace.
    #[serde(default)]
    pub artifacts: Vec<String>,
    /// Captured output of the phase, replayed to the verifier on resume.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub output: String,
    #[serde(default)]
    pub error: Option<String>,
}

impl PhaseRecord {
    pub fn new(task_id: TaskId, phase: Phase) -> Self {
        Self {
            task_id,
            phase,
            status: PhaseStatus::Pending,
            started_at: None,
            finished_at: None,
            retry_count: 0,
            artifacts: Vec::new(),
            output: String::new(),
            error: None,
        }
    }

    pub fn start(&mut self) {
        self.status = PhaseStatus::InProgress;
        self.started_at = Some(Utc::now());
    }

    pub fn complete(&mut self, artifacts: Vec<String>) {
        self.status = PhaseStatus::Completed;
        self.artifacts = artifacts;
        self.finished_at = Some(Utc::now());
    }

    pub fn fail(&mut self, error: impl Into<String>) {
        self.status = PhaseStatus::Failed;
        self.error = Some(error.into());
        self.finished_at = Some(Utc::now());
    }

    pub fn is_completed(&self) -> bool {
        self.status == PhaseStatus::Completed
    }

    /// Wall time spent in the phase, if it finished.
    pub fn duration(&self) -> Option<chrono::Duration> {
        match (self.started_at, self.finished_at) {
            (Some(start), Some(end)) => Some(end - start),
            _ => None,
        }
    }
}

/// State of a task's phase machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case", tag = "state", content = "phase")]
pub enum MachineState {
    #[default]
    Pending,
    Running(Phase),
    Completed,
    Failed,
    Abandoned,
}

impl MachineState {
    #[cfg(test)]
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            MachineState::Completed | MachineState::Failed | MachineState::Abandoned
        )
    }
}

impl std::fmt::Display for MachineState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MachineState::Pending => write!(f, "pending"),
            MachineState::Running(phase) => write!(f, "running({})", phase),
            MachineState::Completed => write!(f, "completed"),
            MachineState::Failed => write!(f, "failed"),
            MachineState::Abandoned => write!(f, "abandoned"),
        }
    }
}
