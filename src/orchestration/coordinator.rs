//! Batch coordinator.
//!
//! A single control loop owns the ready queue, the running set and every
//! task's status. Workers run in the pool's `JoinSet`, each driving one
//! task's phase machine and integration, and only talk back through an mpsc
//! channel and their join result.

use std::cmp::Ordering;
use std::collections::{BinaryHeap, HashMap, HashSet};
use std::panic::AssertUnwindSafe;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use futures::FutureExt;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::aggregator::{IntegrationOutcome, ResultAggregator};
use super::health::{Admission, HealthMonitor};
use super::pool::{RunningTask, WorkerPool};
use super::retry::{RetryPolicy, RetryTracker};
use crate::checkpoint::CheckpointStore;
use crate::config::{Config, PhasesConfig};
use crate::core::{Analysis, Batch, DependencyAnalyzer, TaskDescriptor, TaskId, TaskStatus};
use crate::driver::{DriverRegistry, PhaseDriver};
use crate::hosts::{IssueTracker, NullTracker, ProgressReporter};
use crate::isolation::{ExecutionContext, IsolationManager};
use crate::report::{BatchReport, PhaseTiming, TaskReport};
use crate::workflow::{
    MachineOutcome, Phase, PhaseRecord, PhaseStateMachine, PhaseStatus, ResumePoint,
};
use crate::{Error, Result};

/// Progress reported by a worker.
#[derive(Debug, Clone)]
pub enum WorkerEvent {
    Started {
        task_id: TaskId,
        attempt: u32,
        workspace: PathBuf,
    },
    Resumed {
        task_id: TaskId,
        point: ResumePoint,
    },
    Integrating {
        task_id: TaskId,
    },
}

#[derive(Debug)]
enum LoopEvent {
    Worker(WorkerEvent),
    /// A retry backoff or an admission deferral elapsed.
    Wake(TaskId),
}

#[derive(Debug)]
pub enum WorkerResult {
    Completed(IntegrationOutcome),
    Abandoned { at: Phase },
    Failed { phase: Option<Phase>, error: Error },
}

/// What a worker hands back when it exits.
#[derive(Debug)]
pub struct WorkerOutcome {
    pub task_id: TaskId,
    pub attempt: u32,
    pub result: WorkerResult,
    pub history: Vec<PhaseRecord>,
    pub last_checkpoint: Option<Phase>,
    pub integration: Option<IntegrationOutcome>,
    pub kept_workspace: Option<PathBuf>,
}

impl WorkerOutcome {
    fn failed(task_id: TaskId, attempt: u32, error: Error) -> Self {
        Self {
            task_id,
            attempt,
            result: WorkerResult::Failed { phase: None, error },
            history: Vec::new(),
            last_checkpoint: None,
            integration: None,
            kept_workspace: None,
        }
    }
}

/// Ready-queue entry: higher priority first, then declaration order.
#[derive(Debug, Clone, PartialEq, Eq)]
struct ReadyItem {
    priority: i32,
    index: usize,
    task_id: TaskId,
}

impl Ord for ReadyItem {
    fn cmp(&self, other: &Self) -> Ordering {
        self.priority
            .cmp(&other.priority)
            .then_with(|| other.index.cmp(&self.index))
    }
}

impl PartialOrd for ReadyItem {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

pub struct Coordinator {
    concurrency: usize,
    retry: RetryPolicy,
    cancel_grace: Duration,
    phases: PhasesConfig,
    drivers: Arc<DriverRegistry>,
    store: Arc<dyn CheckpointStore>,
    isolation: Arc<IsolationManager>,
    aggregator: Arc<ResultAggregator>,
    health: Arc<HealthMonitor>,
    tracker: Arc<dyn IssueTracker>,
}

impl Coordinator {
    pub fn new(
        config: &Config,
        isolation: Arc<IsolationManager>,
        aggregator: Arc<ResultAggregator>,
        store: Arc<dyn CheckpointStore>,
    ) -> Self {
        Self {
            concurrency: config.scheduler.concurrency(),
            retry: RetryPolicy::from_config(&config.scheduler),
            cancel_grace: config.scheduler.cancel_grace(),
            phases: config.phases.clone(),
            drivers: Arc::new(DriverRegistry::with_builtin()),
            store,
            isolation,
            aggregator,
            health: Arc::new(HealthMonitor::from_config(config.health.clone())),
            tracker: Arc::new(NullTracker),
        }
    }

    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency.max(1);
        self
    }

    pub fn with_drivers(mut self, drivers: DriverRegistry) -> Self {
        self.drivers = Arc::new(drivers);
        self
    }

    pub fn with_health(mut self, health: Arc<HealthMonitor>) -> Self {
        self.health = health;
        self
    }

    pub fn with_tracker(mut self, tracker: Arc<dyn IssueTracker>) -> Self {
        self.tracker = tracker;
        self
    }

    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn concurrency(&self) -> usize {
        self.concurrency
    }

    pub fn health(&self) -> &Arc<HealthMonitor> {
        &self.health
    }

    /// Analyze the batch and check every task has a driver that accepts
    /// it. Nothing is started.
    pub fn prepare(&self, batch: &Batch) -> Result<Analysis> {
        let analysis = DependencyAnalyzer::new().analyze(batch)?;
        for task in &batch.tasks {
            self.drivers.get(&task.kind)?.validate_task(task)?;
        }
        Ok(analysis)
    }

    /// Run the batch to completion, or until `cancel` fires.
    ///
    /// Task failures are recorded in the report. Only validation errors and
    /// infrastructure failures return `Err`; the latter come back as
    /// `Error::BatchAborted` holding the partial report.
    pub async fn run(&self, batch: &Batch, cancel: CancellationToken) -> Result<BatchReport> {
        let analysis = self.prepare(batch)?;
        let run_id = Uuid::new_v4();
        let started_at = Utc::now();
        info!(
            %run_id,
            tasks = batch.len(),
            components = analysis.components.len(),
            concurrency = self.concurrency,
            "Batch started"
        );

        let health_cancel = CancellationToken::new();
        let health_handle = tokio::spawn(self.health.clone().run(health_cancel.clone()));
        let reporter = ProgressReporter::spawn(self.tracker.clone());

        let mut run = BatchRun::new(self, &reporter, analysis);
        let result = run.drive(&cancel).await;

        health_cancel.cancel();
        if let Err(e) = health_handle.await {
            warn!(error = %e, "Health monitor did not shut down cleanly");
        }
        let peak_concurrency = run.pool.peak();
        let cancelled = run.cancelled;
        let tasks = run.into_reports();
        reporter.shutdown(Duration::from_secs(5)).await;

        let mut report = BatchReport {
            run_id,
            started_at,
            finished_at: Utc::now(),
            concurrency: self.concurrency,
            peak_concurrency,
            cancelled,
            aborted: None,
            tasks,
        };
        if let Err(source) = result {
            report.aborted = Some(source.to_string());
            error!(%run_id, error = %source, "Batch aborted");
            return Err(Error::BatchAborted {
                source: Box::new(source),
                report: Box::new(report),
            });
        }
        let counts = report.counts();
        info!(
            %run_id,
            completed = counts.completed,
            failed = counts.failed,
            blocked = counts.blocked,
            abandoned = counts.abandoned,
            peak_concurrency,
            duration_ms = report.duration_ms(),
            "Batch finished"
        );
        Ok(report)
    }
}

impl std::fmt::Debug for Coordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Coordinator")
            .field("concurrency", &self.concurrency)
            .field("retry", &self.retry)
            .field("drivers", &self.drivers)
            .finish()
    }
}

/// State of one batch run, owned by the control loop.
struct BatchRun<'a> {
    coordinator: &'a Coordinator,
    reporter: &'a ProgressReporter,
    analysis: Analysis,
    tasks: HashMap<TaskId, Arc<TaskDescriptor>>,
    reports: HashMap<TaskId, TaskReport>,
    completed: HashSet<TaskId>,
    ready: BinaryHeap<ReadyItem>,
    /// Tasks sleeping out a backoff or deferral.
    waiting: HashSet<TaskId>,
    retries: RetryTracker,
    pool: WorkerPool<WorkerOutcome>,
    events_tx: mpsc::UnboundedSender<LoopEvent>,
    events_rx: mpsc::UnboundedReceiver<LoopEvent>,
    cancelled: bool,
}

impl<'a> BatchRun<'a> {
    fn new(coordinator: &'a Coordinator, reporter: &'a ProgressReporter, analysis: Analysis) -> Self {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let mut tasks = HashMap::new();
        let mut reports = HashMap::new();
        for task in analysis.graph.tasks() {
            tasks.insert(task.id.clone(), Arc::new(task.clone()));
            reports.insert(task.id.clone(), TaskReport::new(task.id.clone()));
        }

        let mut run = Self {
            coordinator,
            reporter,
            analysis,
            tasks,
            reports,
            completed: HashSet::new(),
            ready: BinaryHeap::new(),
            waiting: HashSet::new(),
            retries: RetryTracker::new(),
            pool: WorkerPool::new(coordinator.concurrency),
            events_tx,
            events_rx,
            cancelled: false,
        };
        let roots: Vec<TaskId> = run
            .analysis
            .graph
            .ready(&run.completed)
            .into_iter()
            .map(|t| t.id.clone())
            .collect();
        for id in roots {
            run.mark_ready(&id);
        }
        run
    }

    fn status(&self, id: &TaskId) -> Option<&TaskStatus> {
        self.reports.get(id).map(|r| &r.status)
    }

    fn set_status(&mut self, id: &TaskId, status: TaskStatus) {
        if let Some(report) = self.reports.get_mut(id) {
            report.status = status;
        }
    }

    fn all_finished(&self) -> bool {
        self.reports.values().all(|r| r.status.is_finished())
    }

    fn mark_ready(&mut self, id: &TaskId) {
        let Some(task) = self.tasks.get(id) else {
            return;
        };
        let item = ReadyItem {
            priority: task.priority,
            index: self.analysis.graph.declaration_index(id).unwrap_or(usize::MAX),
            task_id: id.clone(),
        };
        self.set_status(id, TaskStatus::Ready);
        self.ready.push(item);
    }

    fn finish(&mut self, id: &TaskId, status: TaskStatus) {
        if let Some(report) = self.reports.get_mut(id) {
            report.status = status.clone();
            report.finished_at = Some(Utc::now());
        }
        self.reporter.task_finished(id, &status);
    }

    fn wake_after(&mut self, id: &TaskId, delay: Duration) {
        self.waiting.insert(id.clone());
        let tx = self.events_tx.clone();
        let id = id.clone();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = tx.send(LoopEvent::Wake(id));
        });
    }

    async fn drive(&mut self, cancel: &CancellationToken) -> Result<()> {
        loop {
            if let Err(e) = self.dispatch().await {
                self.abort().await;
                return Err(e);
            }
            if self.pool.is_idle() {
                if self.all_finished() {
                    return Ok(());
                }
                if self.ready.is_empty() && self.waiting.is_empty() {
                    self.stalled();
                    return Ok(());
                }
            }

            tokio::select! {
                joined = self.pool.join_next(), if !self.pool.is_idle() => match joined {
                    Some(Ok(outcome)) => {
                        if let Err(e) = self.handle_outcome(outcome).await {
                            self.abort().await;
                            return Err(e);
                        }
                    }
                    Some(Err(e)) => warn!(error = %e, "Worker did not join cleanly"),
                    None => {}
                },
                Some(event) = self.events_rx.recv() => self.handle_event(event),
                _ = cancel.cancelled(), if !self.cancelled => self.begin_cancel(),
            }
        }
    }

    /// Admit ready tasks while there is capacity.
    async fn dispatch(&mut self) -> Result<()> {
        if self.cancelled {
            return Ok(());
        }
        let mut held_back = Vec::new();
        while self.pool.has_capacity() {
            let Some(item) = self.ready.pop() else {
                break;
            };
            let id = item.task_id.clone();
            if self.status(&id) != Some(&TaskStatus::Ready)
                || self.waiting.contains(&id)
                || self.pool.is_running(&id)
            {
                continue;
            }
            let Some(task) = self.tasks.get(&id).cloned() else {
                continue;
            };
            if let Some(holder) = self.pool.conflicting(&task.resources) {
                debug!(task = %id, %holder, "Resource held by a running task");
                held_back.push(item);
                continue;
            }
            match self.coordinator.health.admit(&task.requires).await {
                Admission::Admit => {}
                Admission::Defer {
                    dependency,
                    retry_after,
                } => {
                    info!(task = %id, %dependency, ?retry_after, "Admission deferred, dependency unhealthy");
                    self.wake_after(&id, retry_after);
                    continue;
                }
            }
            self.start(task).await?;
        }
        self.ready.extend(held_back);
        Ok(())
    }

    async fn start(&mut self, task: Arc<TaskDescriptor>) -> Result<()> {
        let id = task.id.clone();
        let attempt = self.retries.get_retries(&id) + 1;
        if let Some(report) = self.reports.get_mut(&id) {
            report.attempts = attempt;
            report.started_at.get_or_insert_with(Utc::now);
        }

        let driver = match self.coordinator.drivers.get(&task.kind) {
            Ok(driver) => driver,
            Err(e) => return self.handle_failure(&id, None, e).await,
        };
        let context = match self.coordinator.isolation.acquire(&id).await {
            Ok(context) => context,
            Err(e) => {
                warn!(task = %id, attempt, error = %e, "Could not acquire execution context");
                return self.handle_failure(&id, None, e).await;
            }
        };

        let slot = RunningTask::new(id.clone(), attempt, task.resources.clone());
        let job = WorkerJob {
            task,
            context,
            attempt,
            driver,
            store: self.coordinator.store.clone(),
            isolation: self.coordinator.isolation.clone(),
            aggregator: self.coordinator.aggregator.clone(),
            phases: self.coordinator.phases.clone(),
            cancel: slot.cancel.clone(),
            grace: self.coordinator.cancel_grace,
            events: self.events_tx.clone(),
        };
        self.set_status(&id, TaskStatus::InProgress);
        self.reporter.task_started(&id, attempt);
        self.pool.spawn(slot, job.run())?;
        info!(task = %id, attempt, running = self.pool.active_count(), "Task admitted");
        Ok(())
    }

    fn handle_event(&mut self, event: LoopEvent) {
        match event {
            LoopEvent::Wake(id) => {
                if !self.waiting.remove(&id) || self.cancelled {
                    return;
                }
                if matches!(
                    self.status(&id),
                    Some(TaskStatus::Ready) | Some(TaskStatus::Retrying { .. })
                ) {
                    self.mark_ready(&id);
                }
            }
            LoopEvent::Worker(WorkerEvent::Started {
                task_id,
                attempt,
                workspace,
            }) => {
                debug!(task = %task_id, attempt, workspace = %workspace.display(), "Worker started");
            }
            LoopEvent::Worker(WorkerEvent::Resumed { task_id, point }) => match point {
                ResumePoint::Fresh => debug!(task = %task_id, "No checkpoint, starting fresh"),
                other => {
                    info!(task = %task_id, point = ?other, "Resumed from checkpoint");
                    self.reporter
                        .comment(&task_id, format!("Resumed from checkpoint: {:?}", other));
                }
            },
            LoopEvent::Worker(WorkerEvent::Integrating { task_id }) => {
                debug!(task = %task_id, "Integrating result");
            }
        }
    }

    fn record_outcome(&mut self, outcome: &WorkerOutcome) {
        if let Some(report) = self.reports.get_mut(&outcome.task_id) {
            report.phases = outcome.history.iter().map(PhaseTiming::from).collect();
            report.last_checkpoint = outcome.last_checkpoint;
            report.integration = outcome.integration.clone();
            report.kept_workspace = outcome.kept_workspace.clone();
        }
    }

    async fn handle_outcome(&mut self, outcome: WorkerOutcome) -> Result<()> {
        self.pool.finish(&outcome.task_id);
        self.record_outcome(&outcome);
        let id = outcome.task_id;

        match outcome.result {
            WorkerResult::Completed(_) => {
                if let Some(task) = self.tasks.get(&id).cloned() {
                    for dependency in &task.requires {
                        self.coordinator.health.record_success(dependency).await;
                    }
                }
                if let Some(report) = self.reports.get_mut(&id) {
                    report.phase = None;
                    report.error = None;
                    report.error_kind = None;
                }
                self.finish(&id, TaskStatus::Completed);
                self.completed.insert(id.clone());
                info!(task = %id, attempt = outcome.attempt, "Task completed");

                let successors: Vec<TaskId> = self
                    .analysis
                    .graph
                    .successors(&id)
                    .into_iter()
                    .cloned()
                    .collect();
                for succ in successors {
                    if self.status(&succ) == Some(&TaskStatus::Pending)
                        && self.analysis.graph.is_ready(&succ, &self.completed)
                    {
                        self.mark_ready(&succ);
                    }
                }
            }
            WorkerResult::Abandoned { at } => {
                if let Some(report) = self.reports.get_mut(&id) {
                    report.phase = Some(at);
                }
                info!(task = %id, %at, "Task abandoned");
                self.finish(&id, TaskStatus::Abandoned);
            }
            WorkerResult::Failed { phase, error } => {
                self.handle_failure(&id, phase, error).await?;
            }
        }
        Ok(())
    }

    /// Retry a transient failure or record a terminal one. Returns the error
    /// itself when it must abort the batch.
    async fn handle_failure(&mut self, id: &TaskId, phase: Option<Phase>, error: Error) -> Result<()> {
        let kind = error.kind();
        if let Some(report) = self.reports.get_mut(id) {
            report.phase = phase;
            report.error_kind = Some(kind);
            report.error = Some(error.to_string());
        }

        if kind.is_infrastructure() {
            error!(task = %id, error = %error, "Infrastructure failure, aborting batch");
            self.finish(
                id,
                TaskStatus::Failed {
                    error: error.to_string(),
                },
            );
            return Err(error);
        }

        match &error {
            Error::TransientDependency { dependency, reason } => {
                self.coordinator
                    .health
                    .record_failure(dependency, reason)
                    .await;
            }
            Error::Git(e) => self.coordinator.health.record_failure("git", e.message()).await,
            _ => {}
        }

        let retries = self.retries.get_retries(id);
        if !self.cancelled && self.coordinator.retry.should_retry(kind, retries) {
            let retry = self.retries.increment(id);
            let delay = self.coordinator.retry.backoff(retry);
            warn!(
                task = %id,
                %kind,
                retry,
                max_retries = self.coordinator.retry.max_retries,
                ?delay,
                error = %error,
                "Transient failure, retrying"
            );
            self.set_status(id, TaskStatus::Retrying { attempt: retry + 1 });
            self.reporter
                .comment(id, format!("Retry {} after {}: {}", retry, kind, error));
            self.wake_after(id, delay);
            return Ok(());
        }

        error!(task = %id, %kind, phase = ?phase, error = %error, "Task failed");
        self.finish(
            id,
            TaskStatus::Failed {
                error: error.to_string(),
            },
        );
        self.block_descendants(id);
        Ok(())
    }

    fn block_descendants(&mut self, id: &TaskId) {
        for descendant in self.analysis.graph.descendants(id) {
            let unfinished = self
                .status(&descendant)
                .map(|s| !s.is_finished())
                .unwrap_or(false);
            if unfinished {
                warn!(task = %descendant, blocked_by = %id, "Task blocked by failed predecessor");
                self.finish(
                    &descendant,
                    TaskStatus::Blocked {
                        blocked_by: id.clone(),
                    },
                );
            }
        }
    }

    fn abandon_unstarted(&mut self) {
        self.ready.clear();
        self.waiting.clear();
        let unstarted: Vec<TaskId> = self
            .reports
            .iter()
            .filter(|(id, r)| !r.status.is_finished() && !self.pool.is_running(id))
            .map(|(id, _)| id.clone())
            .collect();
        for id in unstarted {
            self.finish(&id, TaskStatus::Abandoned);
        }
    }

    fn begin_cancel(&mut self) {
        info!(
            running = self.pool.active_count(),
            "Cancellation requested, stopping workers at the next phase boundary"
        );
        self.cancelled = true;
        self.pool.cancel_all();
        self.abandon_unstarted();
    }

    /// Stop every worker after an infrastructure failure.
    async fn abort(&mut self) {
        self.cancelled = true;
        self.pool.cancel_all();
        self.abandon_unstarted();

        let deadline = tokio::time::sleep(self.coordinator.cancel_grace * 2);
        tokio::pin!(deadline);
        loop {
            tokio::select! {
                joined = self.pool.join_next() => match joined {
                    Some(Ok(outcome)) => self.settle(outcome),
                    Some(Err(e)) => warn!(error = %e, "Worker did not join cleanly"),
                    None => break,
                },
                _ = &mut deadline => {
                    warn!("Workers did not stop in time, aborting them");
                    self.pool.abort_all();
                    while self.pool.join_next().await.is_some() {}
                    break;
                }
            }
        }
        let leftover: Vec<TaskId> = self.pool.running().map(|r| r.task_id.clone()).collect();
        for id in leftover {
            self.pool.finish(&id);
            self.finish(&id, TaskStatus::Abandoned);
        }
    }

    /// Record a worker's final state without retries or successor updates.
    fn settle(&mut self, outcome: WorkerOutcome) {
        self.pool.finish(&outcome.task_id);
        self.record_outcome(&outcome);
        let status = match outcome.result {
            WorkerResult::Completed(_) => TaskStatus::Completed,
            WorkerResult::Abandoned { .. } => TaskStatus::Abandoned,
            WorkerResult::Failed { error, .. } => TaskStatus::Failed {
                error: error.to_string(),
            },
        };
        self.finish(&outcome.task_id, status);
    }

    fn stalled(&mut self) {
        error!("No task is runnable but the batch is unfinished");
        self.abandon_unstarted();
    }

    fn into_reports(mut self) -> Vec<TaskReport> {
        let order: Vec<TaskId> = self.analysis.graph.tasks().map(|t| t.id.clone()).collect();
        order
            .iter()
            .filter_map(|id| self.reports.remove(id))
            .collect()
    }
}

/// Everything a worker owns while driving one task attempt.
struct WorkerJob {
    task: Arc<TaskDescriptor>,
    context: ExecutionContext,
    attempt: u32,
    driver: Arc<dyn PhaseDriver>,
    store: Arc<dyn CheckpointStore>,
    isolation: Arc<IsolationManager>,
    aggregator: Arc<ResultAggregator>,
    phases: PhasesConfig,
    cancel: CancellationToken,
    grace: Duration,
    events: mpsc::UnboundedSender<LoopEvent>,
}

impl WorkerJob {
    async fn run(self) -> WorkerOutcome {
        let task_id = self.task.id.clone();
        let attempt = self.attempt;
        let isolation = self.isolation.clone();
        let mut context = self.context.clone();

        match AssertUnwindSafe(self.execute()).catch_unwind().await {
            Ok(outcome) => outcome,
            Err(_) => {
                error!(task = %task_id, attempt, "Worker panicked");
                release(&isolation, &mut context).await;
                WorkerOutcome::failed(task_id, attempt, Error::TaskJoin("worker panicked".into()))
            }
        }
    }

    async fn execute(self) -> WorkerOutcome {
        let WorkerJob {
            task,
            mut context,
            attempt,
            driver,
            store,
            isolation,
            aggregator,
            phases,
            cancel,
            grace,
            events,
        } = self;
        let _ = events.send(LoopEvent::Worker(WorkerEvent::Started {
            task_id: task.id.clone(),
            attempt,
            workspace: context.workspace.clone(),
        }));

        let mut machine = PhaseStateMachine::new(
            task.clone(),
            context.workspace.clone(),
            context.branch.clone(),
            driver,
            store.clone(),
        )
        .with_attempt(attempt);

        let driven = {
            let drive = drive_machine(&mut machine, &task.id, &cancel, &phases, &events);
            tokio::pin!(drive);
            tokio::select! {
                biased;
                result = &mut drive => result,
                _ = hard_deadline(&cancel, grace) => {
                    warn!(task = %task.id, ?grace, "Hard cancellation deadline reached, terminating mid-phase");
                    Err(Error::Cancelled(format!("terminated {:?} after cancellation", grace)))
                }
            }
        };

        let history = machine.history().to_vec();
        let last_checkpoint = machine.last_completed();
        let failed_phase = history
            .iter()
            .rev()
            .find(|r| r.status == PhaseStatus::Failed)
            .map(|r| r.phase)
            .or_else(|| machine.next_phase());

        let mut integration = None;
        let mut kept_workspace = None;
        let result = match driven {
            Ok(MachineOutcome::Completed) => {
                let _ = events.send(LoopEvent::Worker(WorkerEvent::Integrating {
                    task_id: task.id.clone(),
                }));
                match aggregator.integrate(&task.id, &context).await {
                    Ok(outcome) if outcome.needs_manual_resolution() => {
                        let paths = outcome.conflict_paths().to_vec();
                        kept_workspace = Some(context.workspace.clone());
                        integration = Some(outcome);
                        WorkerResult::Failed {
                            phase: None,
                            error: Error::IntegrationConflict {
                                task_id: task.id.clone(),
                                paths,
                            },
                        }
                    }
                    Ok(outcome) => {
                        release(&isolation, &mut context).await;
                        discard(store.as_ref(), &task.id).await;
                        integration = Some(outcome.clone());
                        WorkerResult::Completed(outcome)
                    }
                    Err(e) => {
                        release(&isolation, &mut context).await;
                        discard(store.as_ref(), &task.id).await;
                        WorkerResult::Failed {
                            phase: None,
                            error: e,
                        }
                    }
                }
            }
            Ok(MachineOutcome::Abandoned { at }) => {
                // The checkpoint stays so a later run can resume.
                release(&isolation, &mut context).await;
                WorkerResult::Abandoned { at }
            }
            Err(e) => {
                release(&isolation, &mut context).await;
                if !e.kind().is_infrastructure() {
                    discard(store.as_ref(), &task.id).await;
                }
                WorkerResult::Failed {
                    phase: failed_phase,
                    error: e,
                }
            }
        };

        WorkerOutcome {
            task_id: task.id.clone(),
            attempt,
            result,
            history,
            last_checkpoint,
            integration,
            kept_workspace,
        }
    }
}

async fn drive_machine(
    machine: &mut PhaseStateMachine,
    task_id: &TaskId,
    cancel: &CancellationToken,
    phases: &PhasesConfig,
    events: &mpsc::UnboundedSender<LoopEvent>,
) -> Result<MachineOutcome> {
    let point = machine.resume().await?;
    let _ = events.send(LoopEvent::Worker(WorkerEvent::Resumed {
        task_id: task_id.clone(),
        point,
    }));
    if point == ResumePoint::AlreadyComplete {
        return Ok(MachineOutcome::Completed);
    }
    machine.run(cancel, phases).await
}

/// Resolves `grace` after the token is cancelled.
async fn hard_deadline(cancel: &CancellationToken, grace: Duration) {
    cancel.cancelled().await;
    tokio::time::sleep(grace).await;
}

async fn release(isolation: &IsolationManager, context: &mut ExecutionContext) {
    if let Err(e) = isolation.release(context).await {
        warn!(
            task = %context.task_id,
            workspace = %context.workspace.display(),
            error = %e,
            "Failed to release execution context"
        );
    }
}

async fn discard(store: &dyn CheckpointStore, task_id: &TaskId) {
    if let Err(e) = store.discard(task_id).await {
        warn!(task = %task_id, error = %e, "Failed to discard checkpoint");
    }
}
