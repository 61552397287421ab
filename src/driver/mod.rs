//! Task-kind capability interface.
//!
//! The coordinator never interprets a task's payload. Each task names a kind,
//! and the driver registered for that kind knows how to execute, verify and
//! roll back every phase.

mod command;

pub use command::{CommandDriver, CommandPayload, PhaseStep};

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;

use crate::core::TaskDescriptor;
use crate::workflow::Phase;
use crate::{Error, Result};

/// Everything a driver needs to act on one phase of one task.
#[derive(Debug, Clone, Copy)]
pub struct PhaseContext<'a> {
    pub task: &'a TaskDescriptor,
    pub workspace: &'a Path,
    pub branch: &'a str,
    pub phase: Phase,
    pub attempt: u32,
}

/// What a phase claims to have produced.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PhaseOutput {
    /// Artifact paths relative to the workspace.
    pub artifacts: Vec<String>,
    /// Captured stdout and stderr.
    pub output: String,
}

/// Result of independently re-checking a phase.
#[derive(Debug, Clone, PartialEq)]
pub struct Verification {
    pub passed: bool,
    pub reason: String,
    /// Captured output of the verification itself.
    pub output: String,
}

impl Verification {
    pub fn pass() -> Self {
        Self {
            passed: true,
            reason: String::new(),
            output: String::new(),
        }
    }

    pub fn fail(reason: impl Into<String>) -> Self {
        Self {
            passed: false,
            reason: reason.into(),
            output: String::new(),
        }
    }

    pub fn with_output(mut self, output: impl Into<String>) -> Self {
        self.output = output.into();
        self
    }
}

#[async_trait]
pub trait PhaseDriver: Send + Sync {
    /// Kind name tasks use to select this driver.
    fn kind(&self) -> &str;

    /// Reject a task this driver cannot run, before anything starts.
    fn validate_task(&self, _task: &TaskDescriptor) -> Result<()> {
        Ok(())
    }

    /// Execute the phase. Returning `Ok` is only a claim of completion.
    async fn advance_phase(&self, ctx: &PhaseContext<'_>) -> Result<PhaseOutput>;

    /// Independently confirm that the phase's effects are present.
    async fn verify_phase(&self, ctx: &PhaseContext<'_>, output: &PhaseOutput)
        -> Result<Verification>;

    /// Undo a failed phase as far as possible.
    async fn rollback_phase(&self, ctx: &PhaseContext<'_>) -> Result<()>;
}

/// Drivers keyed by kind name.
#[derive(Clone, Default)]
pub struct DriverRegistry {
    drivers: HashMap<String, Arc<dyn PhaseDriver>>,
}

impl DriverRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with the built-in `command` kind.
    pub fn with_builtin() -> Self {
        let mut registry = Self::new();
        registry.register(Arc::new(CommandDriver::new()));
        registry
    }

    pub fn register(&mut self, driver: Arc<dyn PhaseDriver>) {
        self.drivers.insert(driver.kind().to_string(), driver);
    }

    pub fn get(&self, kind: &str) -> Result<Arc<dyn PhaseDriver>> {
        self.drivers
            .get(kind)
            .cloned()
            .ok_or_else(|| Error::UnknownTaskKind(kind.to_string()))
    }

    pub fn contains(&self, kind: &str) -> bool {
        self.drivers.contains_key(kind)
    }

    pub fn kinds(&self) -> Vec<&str> {
        let mut kinds: Vec<&str> = self.drivers.keys().map(String::as_str).collect();
        kinds.sort_unstable();
        kinds
    }
}

impl std::fmt::Debug for DriverRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DriverRegistry")
            .field("kinds", &self.kinds())
            .finish()
    }
}
