// autonomous-executor-rs/src/store.rs
// Persistence for checkpoints and execution status snapshots.
//
// Implementation notes:
// - Writes are best-effort from the scheduler's point of view: failures are
//   logged by the caller and never block progression.
// - The file store is an append-only NDJSON log, one record per line.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::fs::{self, OpenOptions};
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;

use crate::state::{ExecutionPhase, ExecutionStatus};

#[derive(Debug, thiserror::Error)]
pub enum PersistenceError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),
}

/// Output of a settled task and the run's cost at that point
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Checkpoint {
    pub execution_id: String,
    pub task_id: String,
    pub output: Option<Value>,
    pub cumulative_cost: f64,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusRecord {
    pub execution_id: String,
    pub workflow_id: String,
    pub status: ExecutionStatus,
    pub phase: ExecutionPhase,
    pub progress: u8,
    pub current_cost: f64,
    pub message: Option<String>,
    pub timestamp: DateTime<Utc>,
}

#[async_trait]
pub trait ExecutionStore: Send + Sync {
    async fn save_checkpoint(&self, checkpoint: &Checkpoint) -> Result<(), PersistenceError>;

    async fn save_status(&self, status: &StatusRecord) -> Result<(), PersistenceError>;

    /// Checkpoints of one execution in write order
    async fn checkpoints(&self, execution_id: &str) -> Result<Vec<Checkpoint>, PersistenceError>;
}

#[derive(Debug, Default)]
pub struct InMemoryExecutionStore {
    checkpoints: Mutex<HashMap<String, Vec<Checkpoint>>>,
    statuses: Mutex<HashMap<String, Vec<StatusRecord>>>,
}

impl InMemoryExecutionStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn status_history(&self, execution_id: &str) -> Vec<StatusRecord> {
        self.statuses
            .lock()
            .await
            .get(execution_id)
            .cloned()
            .unwrap_or_default()
    }
}

#[async_trait]
impl ExecutionStore for InMemoryExecutionStore {
    async fn save_checkpoint(&self, checkpoint: &Checkpoint) -> Result<(), PersistenceError> {
        self.checkpoints
            .lock()
            .await
            .entry(checkpoint.execution_id.clone())
            .or_default()
            .push(checkpoint.clone());
        Ok(())
    }

    async fn save_status(&self, status: &StatusRecord) -> Result<(), PersistenceError> {
        self.statuses
            .lock()
            .await
            .entry(status.execution_id.clone())
            .or_default()
            .push(status.clone());
        Ok(())
    }

    async fn checkpoints(&self, execution_id: &str) -> Result<Vec<Checkpoint>, PersistenceError> {
        Ok(self
            .checkpoints
            .lock()
            .await
            .get(execution_id)
            .cloned()
            .unwrap_or_default())
    }
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
enum StoreRecord {
    Checkpoint(Checkpoint),
    Status(StatusRecord),
}

/// File-backed store: every record is appended as one JSON line.
///
/// Suitable for single-node deployments; concurrent writers within the
/// process are serialized by an async mutex.
#[derive(Debug)]
pub struct FileExecutionStore {
    path: PathBuf,
    write_lock: Mutex<()>,
}

impl FileExecutionStore {
    /// Creates the parent directory eagerly so a bad path fails at startup.
    pub fn new<P: Into<PathBuf>>(path: P) -> Result<Self, PersistenceError> {
        let path = path.into();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        Ok(Self {
            path,
            write_lock: Mutex::new(()),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn append(&self, record: &StoreRecord) -> Result<(), PersistenceError> {
        let line = serde_json::to_string(record)?;
        let _guard = self.write_lock.lock().await;

        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await?;
        file.write_all(line.as_bytes()).await?;
        file.write_all(b"\n").await?;
        file.flush().await?;
        Ok(())
    }

    async fn read_all(&self) -> Result<Vec<StoreRecord>, PersistenceError> {
        if !fs::try_exists(&self.path).await? {
            return Ok(Vec::new());
        }

        let contents = fs::read_to_string(&self.path).await?;
        let mut records = Vec::new();
        for line in contents.lines().filter(|l| !l.trim().is_empty()) {
            match serde_json::from_str::<StoreRecord>(line) {
                Ok(record) => records.push(record),
                Err(err) => {
                    tracing::warn!(error = %err, "failed to parse store record; skipping");
                }
            }
        }
        Ok(records)
    }

    /// Status snapshots of one execution in write order
    pub async fn status_history(&self, execution_id: &str) -> Result<Vec<StatusRecord>, PersistenceError> {
        Ok(self
            .read_all()
            .await?
            .into_iter()
            .filter_map(|r| match r {
                StoreRecord::Status(s) if s.execution_id == execution_id => Some(s),
                _ => None,
            })
            .collect())
    }
}

#[async_trait]
impl ExecutionStore for FileExecutionStore {
    async fn save_checkpoint(&self, checkpoint: &Checkpoint) -> Result<(), PersistenceError> {
        self.append(&StoreRecord::Checkpoint(checkpoint.clone())).await
    }

    async fn save_status(&self, status: &StatusRecord) -> Result<(), PersistenceError> {
        self.append(&StoreRecord::Status(status.clone())).await
    }

    async fn checkpoints(&self, execution_id: &str) -> Result<Vec<Checkpoint>, PersistenceError> {
        Ok(self
            .read_all()
            .await?
            .into_iter()
            .filter_map(|r| match r {
                StoreRecord::Checkpoint(c) if c.execution_id == execution_id => Some(c),
                _ => None,
            })
            .collect())
    }
}
