//! Task data model for the execution DAG.
//!
//! A `TaskDescriptor` is what the caller submits: an id, an opaque payload,
//! the resources the task will touch, a priority and optional explicit
//! dependencies. Descriptors are immutable once submitted; runtime progress
//! is tracked separately through `TaskStatus`.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

use crate::error::{Error, Result};

/// Maximum length of a caller-chosen task id.
pub const MAX_TASK_ID_LENGTH: usize = 128;

/// Default task kind when a descriptor does not name one.
pub const DEFAULT_TASK_KIND: &str = "command";

/// Caller-chosen identifier of a task within a batch.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaskId(String);

impl TaskId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Validate that the id can safely be used for workspace and branch names.
    pub fn validate(&self) -> Result<()> {
        if self.0.trim().is_empty() {
            return Err(Error::Validation("Task id cannot be empty".to_string()));
        }
        if self.0.len() > MAX_TASK_ID_LENGTH {
            return Err(Error::Validation(format!(
                "Task id '{}' too long (max {} characters)",
                self.0, MAX_TASK_ID_LENGTH
            )));
        }
        if self.0.chars().any(|c| c.is_control()) {
            return Err(Error::Validation(format!(
                "Task id '{}' cannot contain control characters",
                self.0.escape_debug()
            )));
        }
        Ok(())
    }

    /// Lowercase, hyphen-separated form used for directory and branch names.
    pub fn sanitized(&self) -> String {
        let sanitized = self
            .0
            .trim()
            .to_lowercase()
            .chars()
            .map(|c| if c.is_alphanumeric() { c } else { '-' })
            .collect::<String>()
            .split('-')
            .filter(|s| !s.is_empty())
            .collect::<Vec<_>>()
            .join("-");
        if sanitized.is_empty() {
            "task".to_string()
        } else {
            sanitized
        }
    }
}

impl From<&str> for TaskId {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

impl From<String> for TaskId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl std::fmt::Display for TaskId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Opaque per-task content. The scheduling core never looks inside it;
/// only the task-kind driver interprets it.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaskPayload(serde_json::Value);

impl TaskPayload {
    pub fn new(value: serde_json::Value) -> Self {
        Self(value)
    }

    pub fn empty() -> Self {
        Self(serde_json::Value::Null)
    }

    pub fn as_value(&self) -> &serde_json::Value {
        &self.0
    }

    /// Decode the payload into a driver-specific shape.
    pub fn decode<T: serde::de::DeserializeOwned>(&self) -> Result<T> {
        Ok(serde_json::from_value(self.0.clone())?)
    }
}

fn default_kind() -> String {
    DEFAULT_TASK_KIND.to_string()
}

/// An immutable unit of work submitted as part of a batch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskDescriptor {
    /// Unique id within the batch.
    pub id: TaskId,
    /// Opaque content handed to the task-kind driver.
    #[serde(default)]
    pub payload: TaskPayload,
    /// Identifiers of resources this task will touch.
    #[serde(default)]
    pub resources: BTreeSet<String>,
    /// Higher priority runs first.
    #[serde(default)]
    pub priority: i32,
    /// Tasks that must complete before this one may start.
    #[serde(default)]
    pub depends_on: Vec<TaskId>,
    /// Name of the driver that knows how to run this task's phases.
    #[serde(default = "default_kind")]
    pub kind: String,
    /// External dependencies that must be healthy for admission.
    #[serde(default)]
    pub requires: Vec<String>,
}

impl TaskDescriptor {
    /// Create a descriptor with no resources, payload or dependencies.
    pub fn new(id: impl Into<TaskId>) -> Self {
        Self {
            id: id.into(),
            payload: TaskPayload::empty(),
            resources: BTreeSet::new(),
            priority: 0,
            depends_on: Vec::new(),
            kind: default_kind(),
            requires: Vec::new(),
        }
    }

    pub fn with_resources<I, S>(mut self, resources: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.resources = resources.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_dependency(mut self, id: impl Into<TaskId>) -> Self {
        self.depends_on.push(id.into());
        self
    }

    pub fn with_kind(mut self, kind: &str) -> Self {
        self.kind = kind.to_string();
        self
    }

    pub fn with_payload(mut self, payload: serde_json::Value) -> Self {
        self.payload = TaskPayload::new(payload);
        self
    }

    pub fn requiring(mut self, dependency: &str) -> Self {
        self.requires.push(dependency.to_string());
        self
    }
}

/// A batch of tasks submitted together, plus the one-hop reference map
/// used to detect indirect resource conflicts.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Batch {
    pub tasks: Vec<TaskDescriptor>,
    /// `resource -> resources it statically references`.
    #[serde(default)]
    pub references: BTreeMap<String, BTreeSet<String>>,
}

impl Batch {
    pub fn new(tasks: Vec<TaskDescriptor>) -> Self {
        Self {
            tasks,
            references: BTreeMap::new(),
        }
    }

    pub fn with_reference(mut self, from: &str, to: &str) -> Self {
        self.references
            .entry(from.to_string())
            .or_default()
            .insert(to.to_string());
        self
    }

    pub fn get(&self, id: &TaskId) -> Option<&TaskDescriptor> {
        self.tasks.iter().find(|t| &t.id == id)
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }
}

/// Task status in its lifecycle.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "state")]
pub enum TaskStatus {
    /// Waiting for predecessors.
    Pending,
    /// Predecessors satisfied, waiting for capacity or healthy dependencies.
    Ready,
    /// A worker is driving the task's phases.
    InProgress,
    /// Waiting out a retry backoff.
    Retrying { attempt: u32 },
    /// All phases verified and the result integrated.
    Completed,
    /// Terminal failure.
    Failed { error: String },
    /// A predecessor failed; this task will not run.
    Blocked { blocked_by: TaskId },
    /// Cancelled before reaching a terminal phase.
    Abandoned,
}

impl Default for TaskStatus {
    fn default() -> Self {
        Self::Pending
    }
}

impl TaskStatus {
    /// Check if the task is in a terminal state.
    pub fn is_finished(&self) -> bool {
        matches!(
            self,
            TaskStatus::Completed
                | TaskStatus::Failed { .. }
                | TaskStatus::Blocked { .. }
                | TaskStatus::Abandoned
        )
    }

    /// Whether this status counts as a failure of the batch.
    pub fn is_failure(&self) -> bool {
        matches!(
            self,
            TaskStatus::Failed { .. } | TaskStatus::Blocked { .. }
        )
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TaskStatus::Pending => write!(f, "pending"),
            TaskStatus::Ready => write!(f, "ready"),
            TaskStatus::InProgress => write!(f, "in_progress"),
            TaskStatus::Retrying { attempt } => write!(f, "retrying (attempt {})", attempt),
            TaskStatus::Completed => write!(f, "completed"),
            TaskStatus::Failed { error } => write!(f, "failed: {}", error),
            TaskStatus::Blocked { blocked_by } => write!(f, "blocked by {}", blocked_by),
            TaskStatus::Abandoned => write!(f, "abandoned"),
        }
    }
}
