//! Built-in `command` task kind: each phase is a shell command run in the
//! task's workspace.

use std::collections::BTreeMap;
use std::path::{Component, Path};
use std::process::Stdio;

use async_trait::async_trait;
use regex::Regex;
use serde::Deserialize;
use tokio::process::Command;
use tracing::{debug, warn};

use super::{PhaseContext, PhaseDriver, PhaseOutput, Verification};
use crate::core::TaskDescriptor;
use crate::workflow::Phase;
use crate::{Error, Result};

/// What to do for one phase.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PhaseStep {
    /// Shell command that performs the phase.
    #[serde(default)]
    pub run: Option<String>,
    /// Shell command that must exit zero for the phase to count as done.
    #[serde(default)]
    pub verify: Option<String>,
    /// Files, relative to the workspace, that must exist afterwards.
    #[serde(default)]
    pub artifacts: Vec<String>,
    /// Pattern the `run` output must match.
    #[serde(default)]
    pub expect_output: Option<String>,
    /// Shell command that undoes a failed phase.
    #[serde(default)]
    pub rollback: Option<String>,
}

/// Payload shape for `command` tasks.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CommandPayload {
    /// Keyed by phase name (`setup`, `planning`, ...).
    #[serde(default)]
    pub phases: BTreeMap<String, PhaseStep>,
    /// Extra environment for every command.
    #[serde(default)]
    pub env: BTreeMap<String, String>,
}

impl CommandPayload {
    pub fn step(&self, phase: Phase) -> Option<&PhaseStep> {
        self.phases.get(phase.as_str())
    }

    fn validate(&self) -> Result<()> {
        for (name, step) in &self.phases {
            name.parse::<Phase>().map_err(Error::Validation)?;
            if let Some(pattern) = &step.expect_output {
                Regex::new(pattern).map_err(|e| {
                    Error::Validation(format!("Invalid expect_output for {}: {}", name, e))
                })?;
            }
            if let Some(outside) = step.artifacts.iter().find(|a| !within_workspace(a)) {
                return Err(Error::Validation(format!(
                    "Artifact {} for {} must be a relative path inside the workspace",
                    outside, name
                )));
            }
        }
        Ok(())
    }
}

struct CommandResult {
    success: bool,
    code: Option<i32>,
    output: String,
}

#[derive(Debug, Default, Clone, Copy)]
pub struct CommandDriver;

impl CommandDriver {
    pub fn new() -> Self {
        Self
    }

    fn payload(task: &TaskDescriptor) -> Result<CommandPayload> {
        if task.payload.as_value().is_null() {
            return Ok(CommandPayload::default());
        }
        let payload: CommandPayload = task.payload.decode()?;
        payload.validate()?;
        Ok(payload)
    }

    async fn run_shell(
        script: &str,
        ctx: &PhaseContext<'_>,
        env: &BTreeMap<String, String>,
    ) -> Result<CommandResult> {
        debug!(task = %ctx.task.id, phase = %ctx.phase, script, "Running phase command");
        let output = Command::new("sh")
            .arg("-c")
            .arg(script)
            .current_dir(ctx.workspace)
            .envs(env)
            .env("FOREMAN_TASK_ID", ctx.task.id.as_str())
            .env("FOREMAN_PHASE", ctx.phase.as_str())
            .env("FOREMAN_ATTEMPT", ctx.attempt.to_string())
            .env("FOREMAN_BRANCH", ctx.branch)
            .stdin(Stdio::null())
            .kill_on_drop(true)
            .output()
            .await?;

        let mut combined = String::from_utf8_lossy(&output.stdout).into_owned();
        let stderr = String::from_utf8_lossy(&output.stderr);
        if !stderr.is_empty() {
            if !combined.is_empty() && !combined.ends_with('\n') {
                combined.push('\n');
            }
            combined.push_str(&stderr);
        }
        Ok(CommandResult {
            success: output.status.success(),
            code: output.status.code(),
            output: combined,
        })
    }
}

fn describe_exit(code: Option<i32>) -> String {
    match code {
        Some(code) => format!("exit code {}", code),
        None => "terminated by signal".to_string(),
    }
}

/// Only plain relative paths count; `..`, roots and prefixes could resolve
/// to files the phase never produced.
fn within_workspace(artifact: &str) -> bool {
    let path = Path::new(artifact);
    !artifact.is_empty()
        && path
            .components()
            .all(|c| matches!(c, Component::Normal(_) | Component::CurDir))
}

fn missing_artifacts(workspace: &Path, artifacts: &[String]) -> Vec<String> {
    artifacts
        .iter()
        .filter(|a| !within_workspace(a) || !workspace.join(a).exists())
        .cloned()
        .collect()
}

#[async_trait]
impl PhaseDriver for CommandDriver {
    fn kind(&self) -> &str {
        "command"
    }

    fn validate_task(&self, task: &TaskDescriptor) -> Result<()> {
        Self::payload(task).map(|_| ())
    }

    async fn advance_phase(&self, ctx: &PhaseContext<'_>) -> Result<PhaseOutput> {
        let payload = Self::payload(ctx.task)?;
        let Some(step) = payload.step(ctx.phase) else {
            return Ok(PhaseOutput::default());
        };

        let mut output = String::new();
        if let Some(script) = &step.run {
            let result = Self::run_shell(script, ctx, &payload.env).await?;
            if !result.success {
                return Err(Error::PhaseExecution {
                    task_id: ctx.task.id.clone(),
                    phase: ctx.phase,
                    reason: format!("{}: {}", describe_exit(result.code), result.output.trim()),
                });
            }
            output = result.output;
        }

        Ok(PhaseOutput {
            artifacts: step.artifacts.clone(),
            output,
        })
    }

    async fn verify_phase(
        &self,
        ctx: &PhaseContext<'_>,
        output: &PhaseOutput,
    ) -> Result<Verification> {
        if !ctx.workspace.is_dir() {
            return Ok(Verification::fail(format!(
                "workspace {} no longer exists",
                ctx.workspace.display()
            )));
        }

        let missing = missing_artifacts(ctx.workspace, &output.artifacts);
        if !missing.is_empty() {
            return Ok(Verification::fail(format!(
                "missing artifacts: {}",
                missing.join(", ")
            )));
        }

        let payload = Self::payload(ctx.task)?;
        let Some(step) = payload.step(ctx.phase) else {
            return Ok(Verification::pass());
        };

        let missing = missing_artifacts(ctx.workspace, &step.artifacts);
        if !missing.is_empty() {
            return Ok(Verification::fail(format!(
                "missing artifacts: {}",
                missing.join(", ")
            )));
        }

        if let Some(pattern) = &step.expect_output {
            let regex = Regex::new(pattern)
                .map_err(|e| Error::Validation(format!("Invalid expect_output: {}", e)))?;
            if !regex.is_match(&output.output) {
                return Ok(Verification::fail(format!(
                    "output does not match /{}/",
                    pattern
                ))
                .with_output(output.output.clone()));
            }
        }

        if let Some(script) = &step.verify {
            let result = Self::run_shell(script, ctx, &payload.env).await?;
            if !result.success {
                return Ok(Verification::fail(format!(
                    "verification command failed with {}",
                    describe_exit(result.code)
                ))
                .with_output(result.output));
            }
            return Ok(Verification::pass().with_output(result.output));
        }

        Ok(Verification::pass())
    }

    async fn rollback_phase(&self, ctx: &PhaseContext<'_>) -> Result<()> {
        let payload = Self::payload(ctx.task)?;
        let Some(script) = payload.step(ctx.phase).and_then(|s| s.rollback.as_deref()) else {
            return Ok(());
        };
        if !ctx.workspace.is_dir() {
            warn!(task = %ctx.task.id, phase = %ctx.phase, "Skipping rollback, workspace is gone");
            return Ok(());
        }
        let result = Self::run_shell(script, ctx, &payload.env).await?;
        if !result.success {
            return Err(Error::PhaseExecution {
                task_id: ctx.task.id.clone(),
                phase: ctx.phase,
                reason: format!(
                    "rollback failed with {}: {}",
                    describe_exit(result.code),
                    result.output.trim()
                ),
            });
        }
        Ok(())
    }
}
