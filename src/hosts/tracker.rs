use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::core::{TaskId, TaskStatus};
use crate::Result;

/// Handle to an item created in the tracker.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TrackerItem(pub String);

/// Receives progress updates. Never on the critical path.
#[async_trait]
pub trait IssueTracker: Send + Sync {
    async fn create_item(&self, title: &str, body: &str) -> Result<TrackerItem>;
    async fn update_item(&self, item: &TrackerItem, status: &str) -> Result<()>;
    async fn add_comment(&self, item: &TrackerItem, body: &str) -> Result<()>;
}

/// Tracker that accepts and drops everything.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullTracker;

#[async_trait]
impl IssueTracker for NullTracker {
    async fn create_item(&self, title: &str, _body: &str) -> Result<TrackerItem> {
        Ok(TrackerItem(title.to_string()))
    }

    async fn update_item(&self, _item: &TrackerItem, _status: &str) -> Result<()> {
        Ok(())
    }

    async fn add_comment(&self, _item: &TrackerItem, _body: &str) -> Result<()> {
        Ok(())
    }
}

#[derive(Debug)]
enum Progress {
    Started { task: TaskId, attempt: u32 },
    Finished { task: TaskId, status: TaskStatus },
    Comment { task: TaskId, body: String },
}

/// Fire-and-forget progress reporting.
///
/// Calls are queued on an unbounded channel and applied in order by a
/// background task, so the coordinator never waits on the tracker and a
/// failing tracker only produces warnings.
#[derive(Debug)]
pub struct ProgressReporter {
    tx: mpsc::UnboundedSender<Progress>,
    handle: JoinHandle<()>,
}

impl ProgressReporter {
    /// Must be called inside a tokio runtime.
    pub fn spawn(tracker: Arc<dyn IssueTracker>) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let handle = tokio::spawn(Self::drain(tracker, rx));
        Self { tx, handle }
    }

    pub fn task_started(&self, task: &TaskId, attempt: u32) {
        self.send(Progress::Started {
            task: task.clone(),
            attempt,
        });
    }

    pub fn task_finished(&self, task: &TaskId, status: &TaskStatus) {
        self.send(Progress::Finished {
            task: task.clone(),
            status: status.clone(),
        });
    }

    pub fn comment(&self, task: &TaskId, body: impl Into<String>) {
        self.send(Progress::Comment {
            task: task.clone(),
            body: body.into(),
        });
    }

    fn send(&self, progress: Progress) {
        if self.tx.send(progress).is_err() {
            debug!("Progress reporter already stopped");
        }
    }

    /// Flush queued updates, giving up after `grace`.
    pub async fn shutdown(self, grace: Duration) {
        let Self { tx, mut handle } = self;
        drop(tx);
        if tokio::time::timeout(grace, &mut handle).await.is_err() {
            warn!("Progress reporter did not drain in time");
            handle.abort();
        }
    }

    async fn drain(tracker: Arc<dyn IssueTracker>, mut rx: mpsc::UnboundedReceiver<Progress>) {
        let mut items: HashMap<TaskId, TrackerItem> = HashMap::new();
        while let Some(progress) = rx.recv().await {
            let result = match progress {
                Progress::Started { task, attempt } => match items.get(&task) {
                    Some(item) => tracker
                        .add_comment(item, &format!("Attempt {} started", attempt))
                        .await,
                    None => match tracker
                        .create_item(&format!("Task {}", task), "Started by foreman")
                        .await
                    {
                        Ok(item) => {
                            items.insert(task, item);
                            Ok(())
                        }
                        Err(e) => Err(e),
                    },
                },
                Progress::Finished { task, status } => match items.get(&task) {
                    Some(item) => tracker.update_item(item, &status.to_string()).await,
                    None => Ok(()),
                },
                Progress::Comment { task, body } => match items.get(&task) {
                    Some(item) => tracker.add_comment(item, &body).await,
                    None => Ok(()),
                },
            };
            if let Err(e) = result {
                warn!(error = %e, "Issue tracker update failed");
            }
        }
    }
}
