//! Worker pool for concurrent task execution.
//!
//! The `WorkerPool` owns the spawned workers, enforces the concurrency
//! limit, and records the peak number of simultaneously running tasks.

use std::collections::{BTreeSet, HashMap};
use std::future::Future;
use std::time::Instant;

use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::core::TaskId;
use crate::{Error, Result};

/// A task occupying a worker slot.
#[derive(Debug, Clone)]
pub struct RunningTask {
    pub task_id: TaskId,
    pub attempt: u32,
    pub resources: BTreeSet<String>,
    pub started_at: Instant,
    /// Cancelled when the batch is cancelled.
    pub cancel: CancellationToken,
}

impl RunningTask {
    pub fn new(task_id: TaskId, attempt: u32, resources: BTreeSet<String>) -> Self {
        Self {
            task_id,
            attempt,
            resources,
            started_at: Instant::now(),
            cancel: CancellationToken::new(),
        }
    }
}

pub struct WorkerPool<T> {
    running: HashMap<TaskId, RunningTask>,
    workers: JoinSet<T>,
    max_concurrent: usize,
    peak: usize,
}

impl<T: Send + 'static> WorkerPool<T> {
    pub fn new(max_concurrent: usize) -> Self {
        Self {
            running: HashMap::new(),
            workers: JoinSet::new(),
            max_concurrent: max_concurrent.max(1),
            peak: 0,
        }
    }

    pub fn has_capacity(&self) -> bool {
        self.running.len() < self.max_concurrent
    }

    pub fn active_count(&self) -> usize {
        self.running.len()
    }

    /// True when no worker is running or waiting to be joined.
    pub fn is_idle(&self) -> bool {
        self.running.is_empty() && self.workers.is_empty()
    }

    pub fn peak(&self) -> usize {
        self.peak
    }

    pub fn is_running(&self, task_id: &TaskId) -> bool {
        self.running.contains_key(task_id)
    }

    /// A running task holding any of `resources`.
    pub fn conflicting(&self, resources: &BTreeSet<String>) -> Option<&TaskId> {
        self.running
            .values()
            .find(|r| !r.resources.is_disjoint(resources))
            .map(|r| &r.task_id)
    }

    pub fn running(&self) -> impl Iterator<Item = &RunningTask> {
        self.running.values()
    }

    /// Occupy a slot and spawn the worker.
    pub fn spawn<F>(&mut self, slot: RunningTask, worker: F) -> Result<()>
    where
        F: Future<Output = T> + Send + 'static,
    {
        if !self.has_capacity() {
            return Err(Error::PoolFull {
                max: self.max_concurrent,
            });
        }
        debug!(task = %slot.task_id, attempt = slot.attempt, "Worker spawned");
        self.running.insert(slot.task_id.clone(), slot);
        self.peak = self.peak.max(self.running.len());
        self.workers.spawn(worker);
        Ok(())
    }

    /// Free the slot held by `task_id`.
    pub fn finish(&mut self, task_id: &TaskId) -> Option<RunningTask> {
        self.running.remove(task_id)
    }

    /// Next finished worker, or `None` when nothing is spawned.
    pub async fn join_next(&mut self) -> Option<Result<T>> {
        self.workers
            .join_next()
            .await
            .map(|joined| joined.map_err(|e| Error::TaskJoin(e.to_string())))
    }

    /// Signal every running worker to stop at its next phase boundary.
    pub fn cancel_all(&self) {
        for slot in self.running.values() {
            slot.cancel.cancel();
        }
    }

    /// Drop every worker immediately.
    pub fn abort_all(&mut self) {
        self.workers.abort_all();
    }
}

impl<T> std::fmt::Debug for WorkerPool<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerPool")
            .field("running", &self.running.len())
            .field("max_concurrent", &self.max_concurrent)
            .field("peak", &self.peak)
            .finish()
    }
}
