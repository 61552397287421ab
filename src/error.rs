use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::core::TaskId;
use crate::report::BatchReport;
use crate::workflow::Phase;

#[derive(Error, Debug)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Git error: {0}")]
    Git(#[from] git2::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("TOML parse error: {0}")]
    TomlParse(#[from] toml::de::Error),

    #[error("TOML serialize error: {0}")]
    TomlSerialize(#[from] toml::ser::Error),

    #[error("No home directory")]
    NoHomeDir,

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Dependency cycle detected: {}", format_cycle(.cycle))]
    CyclicDependency { cycle: Vec<TaskId> },

    #[error("Failed to create execution environment for {task_id}: {reason}")]
    EnvironmentCreation { task_id: TaskId, reason: String },

    #[error("Execution environment missing: {0}")]
    EnvironmentMissing(String),

    #[error("Phase {phase} of {task_id} claimed done but verification failed: {reason}")]
    PhaseVerification {
        task_id: TaskId,
        phase: Phase,
        reason: String,
    },

    #[error("Phase {phase} of {task_id} failed: {reason}")]
    PhaseExecution {
        task_id: TaskId,
        phase: Phase,
        reason: String,
    },

    #[error("External dependency '{dependency}' unavailable: {reason}")]
    TransientDependency { dependency: String, reason: String },

    #[error("Integration of {task_id} needs manual resolution ({} conflicting paths)", .paths.len())]
    IntegrationConflict { task_id: TaskId, paths: Vec<String> },

    #[error("Operation timed out after {0:?}")]
    Timeout(Duration),

    #[error("Cancelled: {0}")]
    Cancelled(String),

    #[error("Checkpoint store unavailable: {0}")]
    CheckpointStore(String),

    #[error("Unknown task kind: {0}")]
    UnknownTaskKind(String),

    #[error("Task join error: {0}")]
    TaskJoin(String),

    #[error("Worker pool is full (max {max})")]
    PoolFull { max: usize },

    /// An infrastructure failure stopped the batch. Carries the report of
    /// everything that finished before the abort.
    #[error("Batch aborted: {source}")]
    BatchAborted {
        source: Box<Error>,
        report: Box<BatchReport>,
    },
}

pub type Result<T> = std::result::Result<T, Error>;

/// Coarse classification used for retry decisions and reporting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    CyclicDependency,
    EnvironmentCreation,
    PhaseVerification,
    PhaseExecution,
    TransientDependency,
    IntegrationConflict,
    Timeout,
    Cancelled,
    CheckpointStore,
    Validation,
    Internal,
}

impl ErrorKind {
    /// Whether a failure of this kind is eligible for retry with backoff.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            ErrorKind::EnvironmentCreation | ErrorKind::TransientDependency | ErrorKind::Timeout
        )
    }

    /// Infrastructure failures abort the whole batch instead of one task.
    pub fn is_infrastructure(&self) -> bool {
        matches!(self, ErrorKind::CheckpointStore)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::CyclicDependency => "cyclic_dependency",
            ErrorKind::EnvironmentCreation => "environment_creation",
            ErrorKind::PhaseVerification => "phase_verification",
            ErrorKind::PhaseExecution => "phase_execution",
            ErrorKind::TransientDependency => "transient_dependency",
            ErrorKind::IntegrationConflict => "integration_conflict",
            ErrorKind::Timeout => "timeout",
            ErrorKind::Cancelled => "cancelled",
            ErrorKind::CheckpointStore => "checkpoint_store",
            ErrorKind::Validation => "validation",
            ErrorKind::Internal => "internal",
        }
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl Error {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::CyclicDependency { .. } => ErrorKind::CyclicDependency,
            Error::EnvironmentCreation { .. } | Error::EnvironmentMissing(_) => {
                ErrorKind::EnvironmentCreation
            }
            Error::PhaseVerification { .. } => ErrorKind::PhaseVerification,
            Error::PhaseExecution { .. } => ErrorKind::PhaseExecution,
            // Version control failures surface as git errors and are retryable.
            Error::TransientDependency { .. } | Error::Git(_) => ErrorKind::TransientDependency,
            Error::IntegrationConflict { .. } => ErrorKind::IntegrationConflict,
            Error::Timeout(_) => ErrorKind::Timeout,
            Error::Cancelled(_) => ErrorKind::Cancelled,
            Error::CheckpointStore(_) => ErrorKind::CheckpointStore,
            Error::Validation(_)
            | Error::UnknownTaskKind(_)
            | Error::TomlParse(_)
            | Error::Json(_) => ErrorKind::Validation,
            Error::Io(_)
            | Error::NoHomeDir
            | Error::TomlSerialize(_)
            | Error::TaskJoin(_)
            | Error::PoolFull { .. } => ErrorKind::Internal,
            Error::BatchAborted { source, .. } => source.kind(),
        }
    }

    /// Report of the tasks that finished before an aborted batch stopped.
    pub fn partial_report(&self) -> Option<&BatchReport> {
        match self {
            Error::BatchAborted { report, .. } => Some(report),
            _ => None,
        }
    }

    pub fn is_transient(&self) -> bool {
        self.kind().is_transient()
    }
}

fn format_cycle(cycle: &[TaskId]) -> String {
    let mut names: Vec<String> = cycle.iter().map(|id| id.to_string()).collect();
    if let Some(first) = names.first().cloned() {
        names.push(first);
    }
    names.join(" -> ")
}
