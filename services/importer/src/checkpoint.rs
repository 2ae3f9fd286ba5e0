//! Durable per-camera watermark of the last processed capture event.
//!
//! A camera's checkpoint only moves forward: `advance` with an id at or below
//! the stored one is refused with `CheckpointError::NotMonotonic`.

use crate::model::EventId;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;
use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info, instrument};

const STATE_VERSION: u32 = 2;

/// Errors that can occur reading or writing checkpoints
#[derive(Debug, Error)]
pub enum CheckpointError {
    #[error("Checkpoint for camera {camera} cannot move from {current} to {requested}")]
    NotMonotonic {
        camera: String,
        current: EventId,
        requested: EventId,
    },

    #[error("Checkpoint file {path} is unreadable: {message}")]
    Corrupt { path: PathBuf, message: String },

    #[error("Unsupported checkpoint file version {0}")]
    UnsupportedVersion(u32),

    #[error("Checkpoint I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Checkpoint serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Last-processed event id per camera
#[async_trait]
pub trait CheckpointStore: Send + Sync {
    /// Last processed event id, or `None` if the camera has never advanced
    async fn get(&self, camera: &str) -> Result<Option<EventId>, CheckpointError>;

    /// Record `event_id` as processed; must be greater than the stored id
    async fn advance(&self, camera: &str, event_id: EventId) -> Result<(), CheckpointError>;
}

fn check_monotonic(
    camera: &str,
    current: Option<EventId>,
    requested: EventId,
) -> Result<(), CheckpointError> {
    match current {
        Some(current) if requested <= current => Err(CheckpointError::NotMonotonic {
            camera: camera.to_string(),
            current,
            requested,
        }),
        _ => Ok(()),
    }
}

/// On-disk checkpoint document
#[derive(Debug, Clone, Serialize, Deserialize)]
struct CheckpointState {
    version: u32,
    #[serde(default)]
    cameras: BTreeMap<String, CameraCheckpoint>,
    #[serde(default)]
    last_save: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct CameraCheckpoint {
    last_event_id: EventId,
    updated_at: DateTime<Utc>,
}

impl Default for CheckpointState {
    fn default() -> Self {
        Self {
            version: STATE_VERSION,
            cameras: BTreeMap::new(),
            last_save: None,
        }
    }
}

/// Checkpoints persisted to a JSON state file.
///
/// Every advance rewrites the file through a temporary sibling and a rename,
/// so a crash leaves either the old or the new document on disk.
pub struct FileCheckpointStore {
    path: PathBuf,
    state: tokio::sync::Mutex<CheckpointState>,
}

impl FileCheckpointStore {
    /// Open the state file, starting empty if it does not exist yet.
    pub async fn open(path: impl Into<PathBuf>) -> Result<Self, CheckpointError> {
        let path = path.into();

        let state = match tokio::fs::read(&path).await {
            Ok(bytes) => {
                let state: CheckpointState =
                    serde_json::from_slice(&bytes).map_err(|e| CheckpointError::Corrupt {
                        path: path.clone(),
                        message: e.to_string(),
                    })?;
                if state.version != STATE_VERSION {
                    return Err(CheckpointError::UnsupportedVersion(state.version));
                }
                state
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
                    tokio::fs::create_dir_all(parent).await?;
                }
                CheckpointState::default()
            }
            Err(e) => return Err(e.into()),
        };

        info!(
            path = %path.display(),
            cameras = state.cameras.len(),
            "Checkpoint store opened"
        );

        Ok(Self {
            path,
            state: tokio::sync::Mutex::new(state),
        })
    }

    async fn persist(&self, state: &CheckpointState) -> Result<(), CheckpointError> {
        let body = serde_json::to_vec_pretty(state)?;
        let tmp_path = self.path.with_extension("json.tmp");

        let mut file = tokio::fs::File::create(&tmp_path).await?;
        file.write_all(&body).await?;
        file.sync_all().await?;
        drop(file);

        tokio::fs::rename(&tmp_path, &self.path).await?;
        Ok(())
    }
}

#[async_trait]
impl CheckpointStore for FileCheckpointStore {
    async fn get(&self, camera: &str) -> Result<Option<EventId>, CheckpointError> {
        let state = self.state.lock().await;
        Ok(state.cameras.get(camera).map(|c| c.last_event_id))
    }

    #[instrument(skip(self))]
    async fn advance(&self, camera: &str, event_id: EventId) -> Result<(), CheckpointError> {
        // Held across the write so concurrent advances persist in order.
        let mut state = self.state.lock().await;
        check_monotonic(camera, state.cameras.get(camera).map(|c| c.last_event_id), event_id)?;

        let now = Utc::now();
        let mut next = state.clone();
        next.cameras.insert(
            camera.to_string(),
            CameraCheckpoint {
                last_event_id: event_id,
                updated_at: now,
            },
        );
        next.last_save = Some(now);

        self.persist(&next).await?;
        *state = next;

        debug!(camera = camera, event_id = event_id, "Checkpoint advanced");
        Ok(())
    }
}

/// Non-durable checkpoints for tests
#[derive(Debug, Default)]
pub struct MemoryCheckpointStore {
    checkpoints: Mutex<HashMap<String, EventId>>,
}

impl MemoryCheckpointStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn snapshot(&self) -> HashMap<String, EventId> {
        self.checkpoints.lock().clone()
    }
}

#[async_trait]
impl CheckpointStore for MemoryCheckpointStore {
    async fn get(&self, camera: &str) -> Result<Option<EventId>, CheckpointError> {
        Ok(self.checkpoints.lock().get(camera).copied())
    }

    async fn advance(&self, camera: &str, event_id: EventId) -> Result<(), CheckpointError> {
        let mut checkpoints = self.checkpoints.lock();
        check_monotonic(camera, checkpoints.get(camera).copied(), event_id)?;
        checkpoints.insert(camera.to_string(), event_id);
        Ok(())
    }
}
