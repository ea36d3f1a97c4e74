//! State snapshotting and restore.
//!
//! The daemon periodically serializes a whole-world snapshot of every job's
//! and service's state to a YAML file in the working directory. Writes run
//! on a blocking worker so serialization never stalls the control loop; a
//! store requested while a previous write is still outstanding is skipped
//! (the periodic timer re-arms regardless, so snapshotting always resumes).
//!
//! The format is forward-tolerant: unknown top-level keys are ignored, and
//! missing sections default to empty.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tokio::task::JoinHandle;
use tracing::{debug, error, info};

use crate::core::types::RunId;

/// File name of the snapshot within the working directory.
pub const STATE_FILE: &str = "warden_state.yaml";

#[derive(Debug, Error)]
pub enum SnapshotError {
    #[error("snapshot io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("snapshot parse error: {0}")]
    Yaml(#[from] serde_yaml::Error),
}

/// Point-in-time serialization of the whole daemon.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Snapshot {
    #[serde(default)]
    pub jobs: BTreeMap<String, JobData>,
    #[serde(default)]
    pub services: BTreeMap<String, ServiceData>,
}

/// Persisted state of one job.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobData {
    pub enabled: bool,
    /// Run history, newest first.
    #[serde(default)]
    pub runs: Vec<RunData>,
}

/// Persisted state of one job run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunData {
    pub id: RunId,
    pub run_time: DateTime<Utc>,
    pub state: String,
}

/// Persisted state of one service.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceData {
    pub state: String,
    #[serde(default)]
    pub instances: Vec<InstanceData>,
}

/// Persisted state of one service instance.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InstanceData {
    pub node: String,
    pub instance_number: u32,
    pub state: String,
}

/// Owns the snapshot file and the at-most-one outstanding write.
#[derive(Debug)]
pub struct StateHandler {
    working_dir: PathBuf,
    writing_enabled: bool,
    write_task: Option<JoinHandle<()>>,
}

impl StateHandler {
    pub fn new(working_dir: impl Into<PathBuf>) -> Self {
        Self {
            working_dir: working_dir.into(),
            writing_enabled: false,
            write_task: None,
        }
    }

    pub fn snapshot_path(&self) -> PathBuf {
        self.working_dir.join(STATE_FILE)
    }

    /// Persistence stays off until the initial scheduling pass completes,
    /// so a cold start never writes an empty snapshot.
    pub fn enable_writing(&mut self) {
        self.writing_enabled = true;
    }

    /// Kick off a background write of `snapshot`. Returns whether a write
    /// was actually started.
    pub fn store(&mut self, snapshot: Snapshot) -> bool {
        if !self.writing_enabled {
            return false;
        }
        if let Some(task) = &self.write_task {
            if !task.is_finished() {
                debug!("previous snapshot write still outstanding, skipping");
                return false;
            }
        }

        let path = self.snapshot_path();
        self.write_task = Some(tokio::task::spawn_blocking(move || {
            match serde_yaml::to_string(&snapshot) {
                Ok(yaml) => {
                    if let Err(e) = std::fs::write(&path, yaml) {
                        error!(path = %path.display(), error = %e, "snapshot write failed");
                    }
                }
                Err(e) => error!(error = %e, "snapshot serialization failed"),
            }
        }));
        true
    }

    /// Read and parse the snapshot file.
    pub fn load(&self) -> Result<Snapshot, SnapshotError> {
        let path = self.snapshot_path();
        let contents = std::fs::read_to_string(&path)?;
        let snapshot = serde_yaml::from_str(&contents)?;
        info!(path = %path.display(), "loaded state snapshot");
        Ok(snapshot)
    }

    pub fn snapshot_exists(&self) -> bool {
        self.snapshot_path().exists()
    }

    /// Wait for any outstanding write to finish. Used at shutdown.
    pub async fn flush(&mut self) {
        if let Some(task) = self.write_task.take() {
            let _ = task.await;
        }
    }

    #[cfg(test)]
    pub(crate) fn set_write_task(&mut self, task: JoinHandle<()>) {
        self.write_task = Some(task);
    }
}

/// Parse a snapshot from a file path directly, outside a handler.
pub fn load_snapshot(path: &Path) -> Result<Snapshot, SnapshotError> {
    let contents = std::fs::read_to_string(path)?;
    Ok(serde_yaml::from_str(&contents)?)
}
