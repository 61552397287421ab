use std::collections::HashMap;
use std::time::Duration;

use crate::config::SchedulerConfig;
use crate::core::TaskId;
use crate::ErrorKind;

/// Exponential backoff with optional jitter.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub base: Duration,
    pub max: Duration,
    pub multiplier: f64,
    pub jitter: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from_config(&SchedulerConfig::default())
    }
}

impl RetryPolicy {
    pub fn from_config(config: &SchedulerConfig) -> Self {
        Self {
            max_retries: config.max_retries,
            base: Duration::from_millis(config.backoff_base_ms),
            max: Duration::from_millis(config.backoff_max_ms),
            multiplier: config.backoff_multiplier.max(1.0),
            jitter: config.jitter,
        }
    }

    /// Whether a failure of `kind` after `retries_so_far` retries gets
    /// another attempt. Only transient failures are retried.
    pub fn should_retry(&self, kind: ErrorKind, retries_so_far: u32) -> bool {
        kind.is_transient() && retries_so_far < self.max_retries
    }

    /// Delay before retry number `retry` (1-based).
    pub fn backoff(&self, retry: u32) -> Duration {
        let exponent = retry.saturating_sub(1).min(30) as i32;
        let delay = self
            .base
            .mul_f64(self.multiplier.powi(exponent))
            .min(self.max);
        if self.jitter {
            let jitter = delay.mul_f64(fastrand::f64() * 0.1);
            (delay + jitter).min(self.max)
        } else {
            delay
        }
    }
}

/// Tracks retry counts per task.
#[derive(Debug, Clone, Default)]
pub struct RetryTracker {
    retries: HashMap<TaskId, u32>,
}

impl RetryTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns 0 if the task has not been retried.
    pub fn get_retries(&self, task_id: &TaskId) -> u32 {
        self.retries.get(task_id).copied().unwrap_or(0)
    }

    /// Returns the new retry count.
    pub fn increment(&mut self, task_id: &TaskId) -> u32 {
        let count = self.retries.entry(task_id.clone()).or_insert(0);
        *count += 1;
        *count
    }
}
