//! Durable per-task checkpoints.
//!
//! A checkpoint is written after every verified phase transition and read
//! back on resume. Saves are atomic: the JSON is written to a temporary file,
//! synced, then renamed over the previous checkpoint, so a reader only ever
//! sees a fully written snapshot.

use std::collections::HashMap;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::core::TaskId;
use crate::util::blocking;
use crate::workflow::{Phase, PhaseRecord};
use crate::{Error, Result};

pub const CHECKPOINT_VERSION: u32 = 1;

/// Snapshot of a task's verified progress.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Checkpoint {
    pub version: u32,
    pub task_id: TaskId,
    /// Last phase whose verification passed.
    pub last_completed: Option<Phase>,
    pub history: Vec<PhaseRecord>,
    /// Every artifact reference produced so far.
    #[serde(default)]
    pub artifacts: Vec<String>,
    #[serde(default)]
    pub attempt: u32,
    pub written_at: DateTime<Utc>,
}

impl Checkpoint {
    pub fn new(task_id: TaskId, history: Vec<PhaseRecord>, attempt: u32) -> Self {
        let last_completed = history
            .iter()
            .filter(|r| r.is_completed())
            .map(|r| r.phase)
            .max();
        let artifacts = history
            .iter()
            .filter(|r| r.is_completed())
            .flat_map(|r| r.artifacts.iter().cloned())
            .collect();
        Self {
            version: CHECKPOINT_VERSION,
            task_id,
            last_completed,
            history,
            artifacts,
            attempt,
            written_at: Utc::now(),
        }
    }

    /// Whether every phase has a completed record.
    pub fn is_complete(&self) -> bool {
        Phase::ALL.iter().all(|phase| {
            self.history
                .iter()
                .any(|r| r.phase == *phase && r.is_completed())
        })
    }

    /// The completed record of the last verified phase.
    pub fn last_record(&self) -> Option<&PhaseRecord> {
        let phase = self.last_completed?;
        self.history
            .iter()
            .rev()
            .find(|r| r.phase == phase && r.is_completed())
    }
}

/// Storage for checkpoints.
#[async_trait]
pub trait CheckpointStore: Send + Sync {
    /// Atomically replace the task's checkpoint.
    async fn save(&self, checkpoint: &Checkpoint) -> Result<()>;

    async fn load(&self, task_id: &TaskId) -> Result<Option<Checkpoint>>;

    /// Remove the task's checkpoint. Missing checkpoints are not an error.
    async fn discard(&self, task_id: &TaskId) -> Result<()>;

    async fn list(&self) -> Result<Vec<Checkpoint>>;
}

/// One JSON file per task under a directory.
#[derive(Debug, Clone)]
pub struct FileCheckpointStore {
    dir: PathBuf,
}

impl FileCheckpointStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path_for(&self, task_id: &TaskId) -> PathBuf {
        self.dir.join(format!("{}.json", file_stem(task_id)))
    }
}

/// Injective file-safe encoding of a task id.
fn file_stem(task_id: &TaskId) -> String {
    let mut stem = String::with_capacity(task_id.as_str().len());
    for byte in task_id.as_str().bytes() {
        match byte {
            b'a'..=b'z' | b'A'..=b'Z' | b'0'..=b'9' | b'-' => stem.push(byte as char),
            _ => stem.push_str(&format!("_{:02x}", byte)),
        }
    }
    stem
}

fn store_error(action: &str, path: &Path, err: impl std::fmt::Display) -> Error {
    Error::CheckpointStore(format!("{} {}: {}", action, path.display(), err))
}

fn write_atomic(path: &Path, contents: &[u8]) -> Result<()> {
    let temp_path = path.with_extension("json.tmp");
    let mut file = fs::File::create(&temp_path).map_err(|e| store_error("create", &temp_path, e))?;
    file.write_all(contents)
        .map_err(|e| store_error("write", &temp_path, e))?;
    file.sync_all()
        .map_err(|e| store_error("sync", &temp_path, e))?;
    fs::rename(&temp_path, path).map_err(|e| store_error("rename", path, e))?;
    if let Some(dir) = path.parent() {
        sync_dir(dir).map_err(|e| store_error("sync", dir, e))?;
    }
    Ok(())
}

/// Persist the rename itself by syncing the containing directory.
#[cfg(unix)]
fn sync_dir(dir: &Path) -> std::io::Result<()> {
    fs::File::open(dir)?.sync_all()
}

#[cfg(not(unix))]
fn sync_dir(_dir: &Path) -> std::io::Result<()> {
    Ok(())
}

fn read_checkpoint(path: &Path) -> Result<Option<Checkpoint>> {
    let contents = match fs::read_to_string(path) {
        Ok(contents) => contents,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(store_error("read", path, e)),
    };
    match serde_json::from_str::<Checkpoint>(&contents) {
        Ok(checkpoint) if checkpoint.version == CHECKPOINT_VERSION => Ok(Some(checkpoint)),
        Ok(checkpoint) => {
            warn!(
                path = %path.display(),
                version = checkpoint.version,
                "Ignoring checkpoint with unsupported version"
            );
            Ok(None)
        }
        Err(e) => {
            warn!(path = %path.display(), error = %e, "Ignoring unreadable checkpoint");
            Ok(None)
        }
    }
}

#[async_trait]
impl CheckpointStore for FileCheckpointStore {
    async fn save(&self, checkpoint: &Checkpoint) -> Result<()> {
        let contents = serde_json::to_vec_pretty(checkpoint)?;
        let dir = self.dir.clone();
        let path = self.path_for(&checkpoint.task_id);
        debug!(task = %checkpoint.task_id, path = %path.display(), "Saving checkpoint");
        blocking(move || {
            fs::create_dir_all(&dir).map_err(|e| store_error("create", &dir, e))?;
            write_atomic(&path, &contents)
        })
        .await
    }

    async fn load(&self, task_id: &TaskId) -> Result<Option<Checkpoint>> {
        let path = self.path_for(task_id);
        blocking(move || read_checkpoint(&path)).await
    }

    async fn discard(&self, task_id: &TaskId) -> Result<()> {
        let path = self.path_for(task_id);
        blocking(move || match fs::remove_file(&path) {
            Ok(()) => {
                debug!(path = %path.display(), "Checkpoint discarded");
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(store_error("remove", &path, e)),
        })
        .await
    }

    async fn list(&self) -> Result<Vec<Checkpoint>> {
        let dir = self.dir.clone();
        blocking(move || {
            let entries = match fs::read_dir(&dir) {
                Ok(entries) => entries,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
                Err(e) => return Err(store_error("list", &dir, e)),
            };
            let mut checkpoints = Vec::new();
            for entry in entries.flatten() {
                let path = entry.path();
                if path.extension().and_then(|e| e.to_str()) != Some("json") {
                    continue;
                }
                if let Some(checkpoint) = read_checkpoint(&path)? {
                    checkpoints.push(checkpoint);
                }
            }
            checkpoints.sort_by(|a, b| a.task_id.cmp(&b.task_id));
            Ok(checkpoints)
        })
        .await
    }
}

/// In-process store, used for tests and embedding.
#[derive(Debug, Default)]
pub struct MemoryCheckpointStore {
    checkpoints: Mutex<HashMap<TaskId, Checkpoint>>,
    unavailable: AtomicBool,
}

impl MemoryCheckpointStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every subsequent call fail as if the backing store went away.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    fn check_available(&self) -> Result<()> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(Error::CheckpointStore("memory store unavailable".to_string()));
        }
        Ok(())
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, HashMap<TaskId, Checkpoint>>> {
        self.checkpoints
            .lock()
            .map_err(|_| Error::CheckpointStore("memory store poisoned".to_string()))
    }
}

#[async_trait]
impl CheckpointStore for MemoryCheckpointStore {
    async fn save(&self, checkpoint: &Checkpoint) -> Result<()> {
        self.check_available()?;
        self.lock()?
            .insert(checkpoint.task_id.clone(), checkpoint.clone());
        Ok(())
    }

    async fn load(&self, task_id: &TaskId) -> Result<Option<Checkpoint>> {
        self.check_available()?;
        Ok(self.lock()?.get(task_id).cloned())
    }

    async fn discard(&self, task_id: &TaskId) -> Result<()> {
        self.check_available()?;
        self.lock()?.remove(task_id);
        Ok(())
    }

    async fn list(&self) -> Result<Vec<Checkpoint>> {
        self.check_available()?;
        let mut checkpoints: Vec<_> = self.lock()?.values().cloned().collect();
        checkpoints.sort_by(|a, b| a.task_id.cmp(&b.task_id));
        Ok(checkpoints)
    }
}
