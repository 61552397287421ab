//! Checkpointed phase state machine for a single task.

use std::path::PathBuf;
use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::{MachineState, Phase, PhaseRecord, PhaseStatus};
use crate::checkpoint::{Checkpoint, CheckpointStore};
use crate::config::PhasesConfig;
use crate::core::TaskDescriptor;
use crate::driver::{PhaseContext, PhaseDriver, PhaseOutput};
use crate::{Error, Result};

/// Where a resumed machine picks up.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResumePoint {
    /// No checkpoint; start from the first phase.
    Fresh,
    /// The last completed phase re-verified; continue with the next one.
    Continue(Phase),
    /// The last completed phase no longer verifies; run it again.
    Reexecute(Phase),
    /// Every phase already completed.
    AlreadyComplete,
}

/// How a call to `run` ended without error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MachineOutcome {
    Completed,
    /// Cancelled at the boundary before this phase.
    Abandoned { at: Phase },
}

pub struct PhaseStateMachine {
    task: Arc<TaskDescriptor>,
    workspace: PathBuf,
    branch: String,
    driver: Arc<dyn PhaseDriver>,
    store: Arc<dyn CheckpointStore>,
    attempt: u32,
    history: Vec<PhaseRecord>,
    state: MachineState,
}

impl PhaseStateMachine {
    pub fn new(
        task: Arc<TaskDescriptor>,
        workspace: PathBuf,
        branch: String,
        driver: Arc<dyn PhaseDriver>,
        store: Arc<dyn CheckpointStore>,
    ) -> Self {
        Self {
            task,
            workspace,
            branch,
            driver,
            store,
            attempt: 1,
            history: Vec::new(),
            state: MachineState::Pending,
        }
    }

    pub fn with_attempt(mut self, attempt: u32) -> Self {
        self.attempt = attempt;
        self
    }

    pub fn state(&self) -> MachineState {
        self.state
    }

    pub fn history(&self) -> &[PhaseRecord] {
        &self.history
    }

    /// First phase without a completed record.
    pub fn next_phase(&self) -> Option<Phase> {
        Phase::ALL.iter().copied().find(|phase| !self.is_completed(*phase))
    }

    pub fn last_completed(&self) -> Option<Phase> {
        Phase::ALL
            .iter()
            .copied()
            .take_while(|phase| self.is_completed(*phase))
            .last()
    }

    fn is_completed(&self, phase: Phase) -> bool {
        self.history
            .iter()
            .any(|r| r.phase == phase && r.is_completed())
    }

    fn failed_attempts(&self, phase: Phase) -> u32 {
        self.history
            .iter()
            .filter(|r| r.phase == phase && r.status == PhaseStatus::Failed)
            .count() as u32
    }

    fn context(&self, phase: Phase) -> PhaseContext<'_> {
        PhaseContext {
            task: &self.task,
            workspace: &self.workspace,
            branch: &self.branch,
            phase,
            attempt: self.attempt,
        }
    }

    async fn save_checkpoint(&self) -> Result<()> {
        let checkpoint = Checkpoint::new(self.task.id.clone(), self.history.clone(), self.attempt);
        self.store.save(&checkpoint).await
    }

    /// Execute the next phase, verify it, then persist the checkpoint.
    pub async fn advance(&mut self) -> Result<PhaseRecord> {
        let phase = self.next_phase().ok_or_else(|| {
            Error::Validation(format!("Task {} has no phase left to run", self.task.id))
        })?;

        let mut record = PhaseRecord::new(self.task.id.clone(), phase);
        record.retry_count = self.failed_attempts(phase);
        record.start();
        self.state = MachineState::Running(phase);
        debug!(task = %self.task.id, %phase, attempt = self.attempt, "Phase started");

        let ctx = self.context(phase);
        let output = match self.driver.advance_phase(&ctx).await {
            Ok(output) => output,
            Err(e) => {
                warn!(task = %self.task.id, %phase, error = %e, "Phase execution failed");
                return Err(self.fail_record(record, e));
            }
        };

        let verification = match self.driver.verify_phase(&ctx, &output).await {
            Ok(v) => v,
            Err(e) => return Err(self.fail_record(record, e)),
        };
        if !verification.passed {
            error!(
                task = %self.task.id,
                %phase,
                reason = %verification.reason,
                output = %verification.output,
                "Phase reported done but verification failed"
            );
            let err = Error::PhaseVerification {
                task_id: self.task.id.clone(),
                phase,
                reason: verification.reason,
            };
            return Err(self.fail_record(record, err));
        }

        record.complete(output.artifacts);
        record.output = output.output;
        self.history.push(record.clone());
        if let Err(e) = self.save_checkpoint().await {
            // The phase is verified but not durable; drop it so a resume re-runs it.
            self.history.pop();
            self.state = MachineState::Failed;
            return Err(e);
        }
        info!(
            task = %self.task.id,
            %phase,
            artifacts = record.artifacts.len(),
            "Phase verified and checkpointed"
        );

        self.state = if self.next_phase().is_none() {
            MachineState::Completed
        } else {
            MachineState::Running(phase)
        };
        Ok(record)
    }

    fn fail_record(&mut self, mut record: PhaseRecord, err: Error) -> Error {
        record.fail(err.to_string());
        self.history.push(record);
        self.state = MachineState::Failed;
        err
    }

    /// Load the stored checkpoint and decide where to pick up.
    pub async fn resume(&mut self) -> Result<ResumePoint> {
        let Some(checkpoint) = self.store.load(&self.task.id).await? else {
            self.history.clear();
            self.state = MachineState::Pending;
            return Ok(ResumePoint::Fresh);
        };

        self.history = checkpoint.history.clone();
        if checkpoint.is_complete() {
            self.state = MachineState::Completed;
            debug!(task = %self.task.id, "Checkpoint already complete");
            return Ok(ResumePoint::AlreadyComplete);
        }

        let Some(record) = checkpoint.last_record().cloned() else {
            self.state = MachineState::Pending;
            return Ok(ResumePoint::Fresh);
        };

        let phase = record.phase;
        let output = PhaseOutput {
            artifacts: record.artifacts.clone(),
            output: record.output.clone(),
        };
        let verification = self
            .driver
            .verify_phase(&self.context(phase), &output)
            .await?;

        if verification.passed {
            let next = phase.next().unwrap_or(phase);
            info!(task = %self.task.id, last = %phase, %next, "Resuming from checkpoint");
            self.state = MachineState::Running(phase);
            Ok(ResumePoint::Continue(next))
        } else {
            warn!(
                task = %self.task.id,
                %phase,
                reason = %verification.reason,
                output = %verification.output,
                "Checkpointed phase no longer verifies, re-executing"
            );
            for r in self
                .history
                .iter_mut()
                .filter(|r| r.phase == phase && r.is_completed())
            {
                r.status = PhaseStatus::Failed;
                r.error = Some(format!("re-verification failed: {}", verification.reason));
            }
            self.state = MachineState::Pending;
            Ok(ResumePoint::Reexecute(phase))
        }
    }

    /// Drive the machine until every phase is done, a phase fails, or the
    /// token is cancelled at a phase boundary.
    pub async fn run(
        &mut self,
        cancel: &CancellationToken,
        deadlines: &PhasesConfig,
    ) -> Result<MachineOutcome> {
        loop {
            let Some(phase) = self.next_phase() else {
                self.state = MachineState::Completed;
                return Ok(MachineOutcome::Completed);
            };
            if cancel.is_cancelled() {
                info!(task = %self.task.id, %phase, "Cancelled at phase boundary");
                self.state = MachineState::Abandoned;
                return Ok(MachineOutcome::Abandoned { at: phase });
            }

            let deadline = deadlines.timeout_for(phase);
            let result = match tokio::time::timeout(deadline, self.advance()).await {
                Ok(result) => result,
                Err(_) => {
                    warn!(task = %self.task.id, %phase, ?deadline, "Phase timed out");
                    let mut record = PhaseRecord::new(self.task.id.clone(), phase);
                    record.retry_count = self.failed_attempts(phase);
                    Err(self.fail_record(record, Error::Timeout(deadline)))
                }
            };

            if let Err(e) = result {
                if !e.kind().is_infrastructure() {
                    self.rollback(phase).await;
                }
                return Err(e);
            }
        }
    }

    async fn rollback(&self, phase: Phase) {
        if let Err(e) = self.driver.rollback_phase(&self.context(phase)).await {
            warn!(task = %self.task.id, %phase, error = %e, "Rollback failed");
        }
    }
}

impl std::fmt::Debug for PhaseStateMachine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PhaseStateMachine")
            .field("task", &self.task.id)
            .field("workspace", &self.workspace)
            .field("attempt", &self.attempt)
            .field("state", &self.state)
            .finish()
    }
}
