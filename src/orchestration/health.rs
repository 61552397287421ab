//! Health gating for external dependencies.
//!
//! The `HealthMonitor` keeps one circuit breaker per external dependency.
//! Breakers are fed by periodic probes and by workers reporting transient
//! dependency failures. While a breaker is open, admissions that require the
//! dependency are deferred rather than failed. Once the open cooldown has
//! elapsed, the next admission or periodic check runs a single half-open
//! probe: success closes the breaker, failure re-opens it.

use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use tokio::sync::{mpsc, RwLock};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::{HealthConfig, ProbeSpec};
use crate::util::blocking;
use crate::{Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BreakerState {
    Closed,
    Open,
    HalfOpen,
}

impl std::fmt::Display for BreakerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BreakerState::Closed => write!(f, "closed"),
            BreakerState::Open => write!(f, "open"),
            BreakerState::HalfOpen => write!(f, "half_open"),
        }
    }
}

/// Circuit breaker for one dependency.
#[derive(Debug, Clone)]
pub struct CircuitBreakerState {
    pub consecutive_failures: u32,
    pub state: BreakerState,
    pub last_transition: Instant,
    pub last_error: Option<String>,
}

impl Default for CircuitBreakerState {
    fn default() -> Self {
        Self {
            consecutive_failures: 0,
            state: BreakerState::Closed,
            last_transition: Instant::now(),
            last_error: None,
        }
    }
}

impl CircuitBreakerState {
    fn transition(&mut self, state: BreakerState) {
        if self.state != state {
            self.state = state;
            self.last_transition = Instant::now();
        }
    }

    /// Returns true when this success closed a non-closed breaker.
    fn record_success(&mut self) -> bool {
        let was_closed = self.state == BreakerState::Closed;
        self.consecutive_failures = 0;
        self.last_error = None;
        self.transition(BreakerState::Closed);
        !was_closed
    }

    /// Returns true when this failure opened the breaker.
    fn record_failure(&mut self, threshold: u32, reason: &str) -> bool {
        self.consecutive_failures = self.consecutive_failures.saturating_add(1);
        self.last_error = Some(reason.to_string());
        match self.state {
            BreakerState::HalfOpen => {
                self.transition(BreakerState::Open);
                true
            }
            BreakerState::Closed if self.consecutive_failures >= threshold => {
                self.transition(BreakerState::Open);
                true
            }
            _ => false,
        }
    }

    fn cooldown_remaining(&self, cooldown: Duration) -> Duration {
        cooldown.saturating_sub(self.last_transition.elapsed())
    }
}

/// Serializable view of a breaker.
#[derive(Debug, Clone, Serialize)]
pub struct BreakerSnapshot {
    pub state: BreakerState,
    pub consecutive_failures: u32,
    pub last_error: Option<String>,
}

#[async_trait]
pub trait HealthProbe: Send + Sync {
    /// Dependency name tasks refer to in `requires`.
    fn name(&self) -> &str;

    async fn probe(&self) -> Result<()>;
}

fn unavailable(dependency: &str, reason: impl Into<String>) -> Error {
    Error::TransientDependency {
        dependency: dependency.to_string(),
        reason: reason.into(),
    }
}

/// Healthy when a command resolves on `PATH`.
#[derive(Debug, Clone)]
pub struct CommandProbe {
    name: String,
    command: String,
}

impl CommandProbe {
    pub fn new(name: impl Into<String>, command: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            command: command.into(),
        }
    }
}

#[async_trait]
impl HealthProbe for CommandProbe {
    fn name(&self) -> &str {
        &self.name
    }

    async fn probe(&self) -> Result<()> {
        let name = self.name.clone();
        let command = self.command.clone();
        blocking(move || {
            which::which(&command)
                .map(|_| ())
                .map_err(|e| unavailable(&name, format!("{} not found: {}", command, e)))
        })
        .await
    }
}

/// Healthy when a path exists.
#[derive(Debug, Clone)]
pub struct PathProbe {
    name: String,
    path: PathBuf,
}

impl PathProbe {
    pub fn new(name: impl Into<String>, path: impl Into<PathBuf>) -> Self {
        Self {
            name: name.into(),
            path: path.into(),
        }
    }
}

#[async_trait]
impl HealthProbe for PathProbe {
    fn name(&self) -> &str {
        &self.name
    }

    async fn probe(&self) -> Result<()> {
        if tokio::fs::try_exists(&self.path).await.unwrap_or(false) {
            Ok(())
        } else {
            Err(unavailable(
                &self.name,
                format!("{} does not exist", self.path.display()),
            ))
        }
    }
}

/// Probe backed by a closure.
pub struct FnProbe<F> {
    name: String,
    check: F,
}

impl<F> FnProbe<F>
where
    F: Fn() -> bool + Send + Sync,
{
    pub fn new(name: impl Into<String>, check: F) -> Self {
        Self {
            name: name.into(),
            check,
        }
    }
}

#[async_trait]
impl<F> HealthProbe for FnProbe<F>
where
    F: Fn() -> bool + Send + Sync,
{
    fn name(&self) -> &str {
        &self.name
    }

    async fn probe(&self) -> Result<()> {
        if (self.check)() {
            Ok(())
        } else {
            Err(unavailable(&self.name, "probe returned false"))
        }
    }
}

pub fn probe_from_spec(spec: &ProbeSpec) -> Arc<dyn HealthProbe> {
    match spec {
        ProbeSpec::Command { name, command } => Arc::new(CommandProbe::new(name, command)),
        ProbeSpec::Path { name, path } => {
            Arc::new(PathProbe::new(name, crate::config::expand_tilde(path)))
        }
    }
}

/// Events emitted on breaker transitions.
#[derive(Debug, Clone, PartialEq)]
pub enum HealthEvent {
    BreakerOpened { dependency: String, failures: u32 },
    BreakerClosed { dependency: String },
}

/// Decision for one admission request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Admission {
    Admit,
    /// Try again after `retry_after`.
    Defer {
        dependency: String,
        retry_after: Duration,
    },
}

pub struct HealthMonitor {
    config: HealthConfig,
    probes: HashMap<String, Arc<dyn HealthProbe>>,
    breakers: Arc<RwLock<HashMap<String, CircuitBreakerState>>>,
    event_tx: Option<mpsc::UnboundedSender<HealthEvent>>,
}

impl HealthMonitor {
    pub fn new(config: HealthConfig) -> Self {
        Self {
            config,
            probes: HashMap::new(),
            breakers: Arc::new(RwLock::new(HashMap::new())),
            event_tx: None,
        }
    }

    /// Monitor with every probe listed in the config registered.
    pub fn from_config(config: HealthConfig) -> Self {
        let specs = config.dependencies.clone();
        let mut monitor = Self::new(config);
        for spec in &specs {
            monitor.register(probe_from_spec(spec));
        }
        monitor
    }

    pub fn register(&mut self, probe: Arc<dyn HealthProbe>) {
        self.probes.insert(probe.name().to_string(), probe);
    }

    pub fn with_events(mut self, tx: mpsc::UnboundedSender<HealthEvent>) -> Self {
        self.event_tx = Some(tx);
        self
    }

    pub fn config(&self) -> &HealthConfig {
        &self.config
    }

    fn emit(&self, event: HealthEvent) {
        if let Some(tx) = &self.event_tx {
            let _ = tx.send(event);
        }
    }

    pub async fn state(&self, dependency: &str) -> BreakerState {
        self.breakers
            .read()
            .await
            .get(dependency)
            .map(|b| b.state)
            .unwrap_or(BreakerState::Closed)
    }

    pub async fn snapshot(&self) -> BTreeMap<String, BreakerSnapshot> {
        self.breakers
            .read()
            .await
            .iter()
            .map(|(name, b)| {
                (
                    name.clone(),
                    BreakerSnapshot {
                        state: b.state,
                        consecutive_failures: b.consecutive_failures,
                        last_error: b.last_error.clone(),
                    },
                )
            })
            .collect()
    }

    pub async fn record_success(&self, dependency: &str) {
        let closed = {
            let mut breakers = self.breakers.write().await;
            breakers
                .entry(dependency.to_string())
                .or_default()
                .record_success()
        };
        if closed {
            info!(dependency, "Circuit breaker closed");
            self.emit(HealthEvent::BreakerClosed {
                dependency: dependency.to_string(),
            });
        }
    }

    pub async fn record_failure(&self, dependency: &str, reason: &str) {
        let (opened, failures) = {
            let mut breakers = self.breakers.write().await;
            let breaker = breakers.entry(dependency.to_string()).or_default();
            let opened = breaker.record_failure(self.config.failure_threshold.max(1), reason);
            (opened, breaker.consecutive_failures)
        };
        if opened {
            warn!(dependency, failures, reason, "Circuit breaker opened");
            self.emit(HealthEvent::BreakerOpened {
                dependency: dependency.to_string(),
                failures,
            });
        } else {
            debug!(dependency, failures, reason, "Dependency failure recorded");
        }
    }

    async fn run_probe(&self, probe: &Arc<dyn HealthProbe>) -> Result<()> {
        match tokio::time::timeout(self.config.probe_timeout(), probe.probe()).await {
            Ok(result) => result,
            Err(_) => Err(unavailable(probe.name(), "probe timed out")),
        }
    }

    /// Probe a dependency whose breaker is open and past its cooldown.
    /// Returns whether the dependency is usable again.
    async fn half_open(&self, dependency: &str) -> bool {
        {
            let mut breakers = self.breakers.write().await;
            let breaker = breakers.entry(dependency.to_string()).or_default();
            if breaker.state == BreakerState::Closed {
                return true;
            }
            if !breaker.cooldown_remaining(self.config.open_cooldown()).is_zero() {
                return false;
            }
            // A trial that never reported back expires after one cooldown.
            breaker.state = BreakerState::HalfOpen;
            breaker.last_transition = Instant::now();
        }
        debug!(dependency, "Circuit breaker half-open, probing");

        let Some(probe) = self.probes.get(dependency).cloned() else {
            // No probe: the next admitted task is the trial.
            return true;
        };
        match self.run_probe(&probe).await {
            Ok(()) => {
                self.record_success(dependency).await;
                true
            }
            Err(e) => {
                self.record_failure(dependency, &e.to_string()).await;
                false
            }
        }
    }

    /// Decide whether a task requiring `requires` may start now.
    pub async fn admit(&self, requires: &[String]) -> Admission {
        let cooldown = self.config.open_cooldown();
        for dependency in requires {
            let (state, remaining) = {
                let breakers = self.breakers.read().await;
                match breakers.get(dependency) {
                    Some(b) => (b.state, b.cooldown_remaining(cooldown)),
                    None => (BreakerState::Closed, Duration::ZERO),
                }
            };
            match state {
                BreakerState::Closed => continue,
                BreakerState::Open | BreakerState::HalfOpen if remaining.is_zero() => {
                    if self.half_open(dependency).await {
                        continue;
                    }
                    return Admission::Defer {
                        dependency: dependency.clone(),
                        retry_after: cooldown,
                    };
                }
                BreakerState::Open | BreakerState::HalfOpen => {
                    return Admission::Defer {
                        dependency: dependency.clone(),
                        retry_after: remaining,
                    }
                }
            }
        }
        Admission::Admit
    }

    /// Probe every registered dependency once.
    pub async fn check_now(&self) {
        let cooldown = self.config.open_cooldown();
        for (name, probe) in &self.probes {
            let (state, remaining) = {
                let breakers = self.breakers.read().await;
                match breakers.get(name) {
                    Some(b) => (b.state, b.cooldown_remaining(cooldown)),
                    None => (BreakerState::Closed, Duration::ZERO),
                }
            };
            match state {
                BreakerState::Closed => match self.run_probe(probe).await {
                    Ok(()) => self.record_success(name).await,
                    Err(e) => self.record_failure(name, &e.to_string()).await,
                },
                BreakerState::Open | BreakerState::HalfOpen if remaining.is_zero() => {
                    self.half_open(name).await;
                }
                BreakerState::Open | BreakerState::HalfOpen => {}
            }
        }
    }

    /// Probe periodically until cancelled.
    pub async fn run(self: Arc<Self>, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval(self.config.interval());
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => self.check_now().await,
            }
        }
        debug!("Health monitor stopped");
    }
}

impl std::fmt::Debug for HealthMonitor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut probes: Vec<&String> = self.probes.keys().collect();
        probes.sort();
        f.debug_struct("HealthMonitor")
            .field("config", &self.config)
            .field("probes", &probes)
            .finish()
    }
}
