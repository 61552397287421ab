//! Test fixtures for integration tests.
//!
//! Provides helpers for:
//! - Creating temporary git repositories
//! - A directory-backed version control host
//! - A scripted phase driver that records what ran and when
//! - A harness wiring them into a coordinator

use std::collections::{BTreeSet, HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;

use foreman::checkpoint::MemoryCheckpointStore;
use foreman::config::Config;
use foreman::core::{Batch, TaskDescriptor, TaskId};
use foreman::driver::{DriverRegistry, PhaseContext, PhaseDriver, PhaseOutput, Verification};
use foreman::hosts::{IssueTracker, MergeOutcome, TrackerItem, VersionControlHost};
use foreman::isolation::IsolationManager;
use foreman::orchestration::{Coordinator, ResultAggregator};
use foreman::report::BatchReport;
use foreman::workflow::Phase;
use foreman::{Error, Result};

pub const FAKE_KIND: &str = "fake";
pub const TARGET: &str = "integration";

/// A fake-kind task with no resources.
pub fn task(id: &str) -> TaskDescriptor {
    TaskDescriptor::new(id).with_kind(FAKE_KIND)
}

/// Config tuned for fast tests: short backoff, no jitter, one-second
/// grace and cooldown.
pub fn test_config() -> Config {
    let mut config = Config::default();
    config.scheduler.max_concurrent = Some(4);
    config.scheduler.backoff_base_ms = 10;
    config.scheduler.backoff_max_ms = 50;
    config.scheduler.jitter = false;
    config.scheduler.cancel_grace_secs = 1;
    config.health.interval_secs = 3600;
    config.health.open_cooldown_secs = 1;
    config.health.probe_timeout_secs = 1;
    config
}

/// A test repository with a temporary directory and initialized git.
pub struct TestRepo {
    /// The temporary directory containing the repo.
    pub temp_dir: TempDir,
    /// Path to the repository root.
    pub path: PathBuf,
}

impl TestRepo {
    /// Create a new test repository on `main` with an initial commit.
    pub fn new() -> Self {
        let temp_dir = TempDir::new().expect("Failed to create temp directory");
        let path = temp_dir.path().join("repo");
        std::fs::create_dir_all(&path).expect("Failed to create repo dir");

        let repo = Self { temp_dir, path };
        repo.git(&["init"]);
        repo.git(&["symbolic-ref", "HEAD", "refs/heads/main"]);
        repo.git(&["config", "user.email", "test@test.com"]);
        repo.git(&["config", "user.name", "Test User"]);
        std::fs::write(repo.path.join("README.md"), "# Test Repository\n")
            .expect("Failed to write README");
        repo.git(&["add", "."]);
        repo.git(&["commit", "-m", "Initial commit"]);
        repo
    }

    pub fn git(&self, args: &[&str]) -> String {
        let output = Command::new("git")
            .args(args)
            .current_dir(&self.path)
            .output()
            .expect("Failed to run git");
        assert!(
            output.status.success(),
            "git {:?} failed: {}",
            args,
            String::from_utf8_lossy(&output.stderr)
        );
        String::from_utf8_lossy(&output.stdout).into_owned()
    }

    /// Contents of `file` at the tip of `branch`, if present.
    pub fn file_on_branch(&self, branch: &str, file: &str) -> Option<String> {
        let output = Command::new("git")
            .args(["show", &format!("{}:{}", branch, file)])
            .current_dir(&self.path)
            .output()
            .expect("Failed to run git show");
        output
            .status
            .success()
            .then(|| String::from_utf8_lossy(&output.stdout).into_owned())
    }

    /// Directory next to the repository, for workspaces or checkpoints.
    pub fn sibling(&self, name: &str) -> PathBuf {
        self.temp_dir.path().join(name)
    }
}

/// Host backed by plain directories and an in-memory branch set.
#[derive(Default)]
pub struct FakeHost {
    branches: Mutex<HashSet<String>>,
    conflicting: Mutex<HashSet<String>>,
    pub commits: AtomicUsize,
    pub merges: AtomicUsize,
}

impl FakeHost {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make merges of `task`'s branch report a conflict.
    pub fn conflict_for(&self, task: &str) {
        self.conflicting.lock().unwrap().insert(task.to_string());
    }

    pub fn branch_count(&self) -> usize {
        self.branches.lock().unwrap().len()
    }

    pub fn merge_count(&self) -> usize {
        self.merges.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl VersionControlHost for FakeHost {
    fn root(&self) -> Option<&Path> {
        None
    }

    async fn create_isolated_branch(&self, branch: &str, workspace: &Path) -> Result<()> {
        std::fs::create_dir_all(workspace)?;
        self.branches.lock().unwrap().insert(branch.to_string());
        Ok(())
    }

    async fn branch_exists(&self, branch: &str) -> Result<bool> {
        Ok(self.branches.lock().unwrap().contains(branch))
    }

    async fn commit_workspace(&self, _workspace: &Path, _message: &str) -> Result<bool> {
        self.commits.fetch_add(1, Ordering::SeqCst);
        Ok(true)
    }

    async fn merge(&self, branch: &str, _target: &str) -> Result<MergeOutcome> {
        let n = self.merges.fetch_add(1, Ordering::SeqCst) + 1;
        let conflicted = self
            .conflicting
            .lock()
            .unwrap()
            .iter()
            .any(|task| branch.ends_with(&format!("/{}", task)));
        if conflicted {
            return Ok(MergeOutcome::Conflict {
                paths: vec!["shared.txt".to_string()],
            });
        }
        Ok(MergeOutcome::Merged {
            commit: format!("{:040x}", n),
            fast_forward: true,
        })
    }

    async fn delete_branch(&self, branch: &str, workspace: &Path) -> Result<()> {
        self.branches.lock().unwrap().remove(branch);
        if workspace.exists() {
            std::fs::remove_dir_all(workspace)?;
        }
        Ok(())
    }
}

/// Scripted behavior for one task.
#[derive(Debug, Clone, Default)]
pub struct Behavior {
    /// Overrides the driver's default per-phase delay.
    pub phase_delay: Option<Duration>,
    /// Phase that reports done without producing its artifact.
    pub claims_but_fails: Option<Phase>,
    /// Phase whose action fails outright.
    pub fails_at: Option<Phase>,
    /// Number of setup attempts that fail with a transient dependency error.
    pub transient_failures: u32,
    /// Phase that panics.
    pub panics_at: Option<Phase>,
}

/// Driver that writes `<phase>.out` into the workspace for every phase and
/// verifies by checking the claimed artifacts exist.
pub struct FakeDriver {
    default_delay: Duration,
    behaviors: Mutex<HashMap<TaskId, Behavior>>,
    in_flight: Mutex<HashMap<TaskId, BTreeSet<String>>>,
    max_in_flight: AtomicUsize,
    overlaps: Mutex<Vec<(TaskId, TaskId)>>,
    started: Mutex<Vec<TaskId>>,
    calls: Mutex<Vec<(TaskId, Phase, u32)>>,
    transient_seen: Mutex<HashMap<TaskId, u32>>,
}

impl FakeDriver {
    pub fn new(default_delay: Duration) -> Self {
        Self {
            default_delay,
            behaviors: Mutex::new(HashMap::new()),
            in_flight: Mutex::new(HashMap::new()),
            max_in_flight: AtomicUsize::new(0),
            overlaps: Mutex::new(Vec::new()),
            started: Mutex::new(Vec::new()),
            calls: Mutex::new(Vec::new()),
            transient_seen: Mutex::new(HashMap::new()),
        }
    }

    pub fn script(&self, task: &str, behavior: Behavior) {
        self.behaviors
            .lock()
            .unwrap()
            .insert(TaskId::from(task), behavior);
    }

    /// Most tasks ever inside a phase at the same moment.
    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }

    /// Pairs of tasks that ran a phase at the same time while sharing a
    /// resource.
    pub fn overlaps(&self) -> Vec<(TaskId, TaskId)> {
        self.overlaps.lock().unwrap().clone()
    }

    /// Tasks in the order their first setup phase began.
    pub fn start_order(&self) -> Vec<TaskId> {
        self.started.lock().unwrap().clone()
    }

    /// Phases executed for `task`, in order.
    pub fn phases_run(&self, task: &str) -> Vec<Phase> {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .filter(|(id, _, _)| id.as_str() == task)
            .map(|(_, phase, _)| *phase)
            .collect()
    }

    fn behavior(&self, id: &TaskId) -> Behavior {
        self.behaviors
            .lock()
            .unwrap()
            .get(id)
            .cloned()
            .unwrap_or_default()
    }

    fn enter(&self, task: &TaskDescriptor) {
        let mut in_flight = self.in_flight.lock().unwrap();
        for (other, resources) in in_flight.iter() {
            if !resources.is_disjoint(&task.resources) {
                self.overlaps
                    .lock()
                    .unwrap()
                    .push((other.clone(), task.id.clone()));
            }
        }
        in_flight.insert(task.id.clone(), task.resources.clone());
        self.max_in_flight
            .fetch_max(in_flight.len(), Ordering::SeqCst);
    }

    fn leave(&self, id: &TaskId) {
        self.in_flight.lock().unwrap().remove(id);
    }

    fn take_transient(&self, id: &TaskId, limit: u32) -> bool {
        let mut seen = self.transient_seen.lock().unwrap();
        let count = seen.entry(id.clone()).or_insert(0);
        *count += 1;
        *count <= limit
    }
}

#[async_trait]
impl PhaseDriver for FakeDriver {
    fn kind(&self) -> &str {
        FAKE_KIND
    }

    async fn advance_phase(&self, ctx: &PhaseContext<'_>) -> Result<PhaseOutput> {
        let id = &ctx.task.id;
        let behavior = self.behavior(id);
        if behavior.panics_at == Some(ctx.phase) {
            panic!("scripted panic in {}", ctx.phase);
        }

        if ctx.phase == Phase::Setup {
            let mut started = self.started.lock().unwrap();
            if !started.contains(id) {
                started.push(id.clone());
            }
        }
        self.calls
            .lock()
            .unwrap()
            .push((id.clone(), ctx.phase, ctx.attempt));

        self.enter(ctx.task);
        tokio::time::sleep(behavior.phase_delay.unwrap_or(self.default_delay)).await;
        self.leave(id);

        if ctx.phase == Phase::Setup && self.take_transient(id, behavior.transient_failures) {
            return Err(Error::TransientDependency {
                dependency: "api".to_string(),
                reason: "connection refused".to_string(),
            });
        }
        if behavior.fails_at == Some(ctx.phase) {
            return Err(Error::PhaseExecution {
                task_id: id.clone(),
                phase: ctx.phase,
                reason: "scripted failure".to_string(),
            });
        }

        let artifact = format!("{}.out", ctx.phase);
        if behavior.claims_but_fails != Some(ctx.phase) {
            std::fs::write(ctx.workspace.join(&artifact), id.as_str())?;
        }
        Ok(PhaseOutput {
            artifacts: vec![artifact],
            output: String::new(),
        })
    }

    async fn verify_phase(
        &self,
        ctx: &PhaseContext<'_>,
        output: &PhaseOutput,
    ) -> Result<Verification> {
        let missing: Vec<&String> = output
            .artifacts
            .iter()
            .filter(|a| !ctx.workspace.join(a).exists())
            .collect();
        if missing.is_empty() {
            Ok(Verification::pass())
        } else {
            Ok(Verification::fail(format!("missing artifacts: {:?}", missing)))
        }
    }

    async fn rollback_phase(&self, _ctx: &PhaseContext<'_>) -> Result<()> {
        Ok(())
    }
}

/// Tracker that records every call, optionally failing all of them.
#[derive(Default)]
pub struct RecordingTracker {
    pub calls: Mutex<Vec<String>>,
    pub fail: bool,
}

impl RecordingTracker {
    pub fn failing() -> Self {
        Self {
            calls: Mutex::new(Vec::new()),
            fail: true,
        }
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    fn record(&self, call: String) -> Result<()> {
        self.calls.lock().unwrap().push(call);
        if self.fail {
            return Err(Error::TransientDependency {
                dependency: "tracker".to_string(),
                reason: "offline".to_string(),
            });
        }
        Ok(())
    }
}

#[async_trait]
impl IssueTracker for RecordingTracker {
    async fn create_item(&self, title: &str, _body: &str) -> Result<TrackerItem> {
        self.record(format!("create {}", title))?;
        Ok(TrackerItem(title.to_string()))
    }

    async fn update_item(&self, item: &TrackerItem, status: &str) -> Result<()> {
        self.record(format!("update {} {}", item.0, status))
    }

    async fn add_comment(&self, item: &TrackerItem, body: &str) -> Result<()> {
        self.record(format!("comment {} {}", item.0, body))
    }
}

/// Coordinator wiring over a fake host, an in-memory checkpoint store and
/// the scripted driver.
pub struct Harness {
    pub temp: TempDir,
    pub config: Config,
    pub host: Arc<FakeHost>,
    pub isolation: Arc<IsolationManager>,
    pub aggregator: Arc<ResultAggregator>,
    pub store: Arc<MemoryCheckpointStore>,
    pub driver: Arc<FakeDriver>,
}

impl Harness {
    pub fn new() -> Self {
        Self::with_config(test_config(), Duration::from_millis(20))
    }

    pub fn with_config(config: Config, phase_delay: Duration) -> Self {
        let temp = TempDir::new().expect("Failed to create temp directory");
        let host = Arc::new(FakeHost::new());
        let isolation = Arc::new(
            IsolationManager::new(
                &config.isolation,
                temp.path().join("workspaces"),
                host.clone(),
            )
            .expect("isolation manager"),
        );
        let aggregator = Arc::new(ResultAggregator::new(host.clone(), TARGET));
        Self {
            temp,
            config,
            host,
            isolation,
            aggregator,
            store: Arc::new(MemoryCheckpointStore::new()),
            driver: Arc::new(FakeDriver::new(phase_delay)),
        }
    }

    pub fn coordinator(&self) -> Coordinator {
        let mut drivers = DriverRegistry::with_builtin();
        drivers.register(self.driver.clone());
        Coordinator::new(
            &self.config,
            self.isolation.clone(),
            self.aggregator.clone(),
            self.store.clone(),
        )
        .with_drivers(drivers)
    }

    pub async fn run(&self, batch: &Batch) -> BatchReport {
        self.coordinator()
            .run(batch, CancellationToken::new())
            .await
            .expect("batch run")
    }

    /// Everything left under the workspace root, markers included.
    pub fn workspace_entries(&self) -> Vec<PathBuf> {
        std::fs::read_dir(self.isolation.root())
            .map(|entries| entries.flatten().map(|e| e.path()).collect())
            .unwrap_or_default()
    }
}
