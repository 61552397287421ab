use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::debug;

use crate::workflow::Phase;
use crate::{Error, Result};

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct Config {
    pub scheduler: SchedulerConfig,
    pub phases: PhasesConfig,
    pub health: HealthConfig,
    pub isolation: IsolationConfig,
    pub integration: IntegrationConfig,
    pub checkpoints: CheckpointConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    /// Upper bound on concurrently running tasks. Defaults to the available
    /// parallelism minus one.
    pub max_concurrent: Option<usize>,
    pub max_retries: u32,
    pub backoff_base_ms: u64,
    pub backoff_max_ms: u64,
    pub backoff_multiplier: f64,
    pub jitter: bool,
    /// How long a cancelled worker may keep running its current phase.
    pub cancel_grace_secs: u64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            max_concurrent: None,
            max_retries: 3,
            backoff_base_ms: 500,
            backoff_max_ms: 30_000,
            backoff_multiplier: 2.0,
            jitter: true,
            cancel_grace_secs: 10,
        }
    }
}

impl SchedulerConfig {
    pub fn concurrency(&self) -> usize {
        match self.max_concurrent {
            Some(k) => k.max(1),
            None => default_concurrency(),
        }
    }

    pub fn cancel_grace(&self) -> Duration {
        Duration::from_secs(self.cancel_grace_secs)
    }
}

pub fn default_concurrency() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get().saturating_sub(1))
        .unwrap_or(1)
        .max(1)
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PhasesConfig {
    pub default_timeout_secs: u64,
    /// Per-phase overrides keyed by phase name.
    pub timeouts: BTreeMap<String, u64>,
}

impl Default for PhasesConfig {
    fn default() -> Self {
        Self {
            default_timeout_secs: 600,
            timeouts: BTreeMap::new(),
        }
    }
}

impl PhasesConfig {
    pub fn timeout_for(&self, phase: Phase) -> Duration {
        let secs = self
            .timeouts
            .get(phase.as_str())
            .copied()
            .unwrap_or(self.default_timeout_secs);
        Duration::from_secs(secs)
    }

    fn validate(&self) -> Result<()> {
        for name in self.timeouts.keys() {
            name.parse::<Phase>()
                .map_err(|e| Error::Validation(format!("phases.timeouts: {}", e)))?;
        }
        Ok(())
    }
}

/// An external dependency the health monitor probes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ProbeSpec {
    /// Healthy when the command resolves on `PATH`.
    Command { name: String, command: String },
    /// Healthy when the path exists.
    Path { name: String, path: String },
}

impl ProbeSpec {
    pub fn name(&self) -> &str {
        match self {
            ProbeSpec::Command { name, .. } | ProbeSpec::Path { name, .. } => name,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HealthConfig {
    pub interval_secs: u64,
    /// Consecutive failures that open a breaker.
    pub failure_threshold: u32,
    /// Time an open breaker waits before a half-open probe.
    pub open_cooldown_secs: u64,
    pub probe_timeout_secs: u64,
    pub dependencies: Vec<ProbeSpec>,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            interval_secs: 30,
            failure_threshold: 3,
            open_cooldown_secs: 60,
            probe_timeout_secs: 10,
            dependencies: Vec::new(),
        }
    }
}

impl HealthConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }

    pub fn open_cooldown(&self) -> Duration {
        Duration::from_secs(self.open_cooldown_secs)
    }

    pub fn probe_timeout(&self) -> Duration {
        Duration::from_secs(self.probe_timeout_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct IsolationConfig {
    /// Defaults to `~/.foreman/workspaces`.
    pub workspace_root: Option<String>,
    pub branch_prefix: String,
    pub max_name_attempts: u32,
    /// Report releasing an already-missing workspace as an error.
    pub strict: bool,
}

impl Default for IsolationConfig {
    fn default() -> Self {
        Self {
            workspace_root: None,
            branch_prefix: "foreman".to_string(),
            max_name_attempts: 10,
            strict: false,
        }
    }
}

impl IsolationConfig {
    pub fn workspace_root(&self) -> Result<PathBuf> {
        match &self.workspace_root {
            Some(dir) => Ok(expand_tilde(dir)),
            None => Ok(Config::foreman_dir()?.join("workspaces")),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct IntegrationConfig {
    /// Branch completed tasks are merged into.
    pub target_branch: String,
    /// Repository to operate on. Defaults to the current directory.
    pub repository: Option<String>,
}

impl Default for IntegrationConfig {
    fn default() -> Self {
        Self {
            target_branch: "foreman/integration".to_string(),
            repository: None,
        }
    }
}

impl IntegrationConfig {
    pub fn repository(&self) -> Result<PathBuf> {
        match &self.repository {
            Some(dir) => Ok(expand_tilde(dir)),
            None => Ok(std::env::current_dir()?),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct CheckpointConfig {
    /// Defaults to `~/.foreman/checkpoints`.
    pub dir: Option<String>,
}

impl CheckpointConfig {
    pub fn dir(&self) -> Result<PathBuf> {
        match &self.dir {
            Some(dir) => Ok(expand_tilde(dir)),
            None => Ok(Config::foreman_dir()?.join("checkpoints")),
        }
    }
}

impl Config {
    pub fn foreman_dir() -> Result<PathBuf> {
        Ok(dirs::home_dir().ok_or(Error::NoHomeDir)?.join(".foreman"))
    }

    pub fn config_path() -> Result<PathBuf> {
        Ok(Self::foreman_dir()?.join("foreman.toml"))
    }

    /// Load `~/.foreman/foreman.toml`, falling back to defaults.
    pub fn load() -> Result<Self> {
        let path = Self::config_path()?;
        if !path.exists() {
            debug!(path = %path.display(), "Config file not found, using defaults");
            return Ok(Self::default());
        }
        Self::load_from(&path)
    }

    /// Load an explicit file, which must exist.
    pub fn load_from(path: &Path) -> Result<Self> {
        debug!(path = %path.display(), "Loading config");
        let config: Self = toml::from_str(&fs::read_to_string(path)?)?;
        config.validate()?;
        debug!(
            max_concurrent = ?config.scheduler.max_concurrent,
            max_retries = config.scheduler.max_retries,
            probes = config.health.dependencies.len(),
            "Config loaded"
        );
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        self.phases.validate()?;
        if self.scheduler.backoff_multiplier < 1.0 {
            return Err(Error::Validation(
                "scheduler.backoff_multiplier must be at least 1.0".to_string(),
            ));
        }
        if self.isolation.max_name_attempts == 0 {
            return Err(Error::Validation(
                "isolation.max_name_attempts must be at least 1".to_string(),
            ));
        }
        if self.isolation.branch_prefix.trim_matches('/').is_empty() {
            return Err(Error::Validation(
                "isolation.branch_prefix cannot be empty".to_string(),
            ));
        }
        Ok(())
    }
}

pub fn expand_tilde(path: &str) -> PathBuf {
    if let Some(rest) = path.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(rest);
        }
    }
    PathBuf::from(path)
}
