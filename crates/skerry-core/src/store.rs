//! Durable sandbox records.
//!
//! Each sandbox has one JSON record at `<root>/<sandbox-id>/state.json`.
//! Records are replaced atomically: a reader sees either the previous or
//! the new version, never a partial write. Every successful save carries a
//! higher revision than the one before.

use crate::config::SandboxSpec;
use crate::container::Container;
use crate::device::DeviceDescriptor;
use crate::network::NetworkEndpoint;
use crate::sandbox::{SandboxId, SandboxState};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use skerry_vm::{BackendKind, VmHandle};
use std::io::Write;
use std::path::{Path, PathBuf};
use tempfile::NamedTempFile;
use thiserror::Error;

/// File name of a sandbox record inside its directory.
pub const RECORD_FILE: &str = "state.json";

/// Store errors.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("I/O error on {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("malformed record: {0}")]
    Json(#[from] serde_json::Error),

    /// A newer record exists than the one offered
    #[error("record for {sandbox_id} is at revision {record}, store has {current}")]
    Stale {
        sandbox_id: SandboxId,
        record: u64,
        current: u64,
    },

    #[error("store task failed: {0}")]
    Task(String),
}

fn io_err(path: &Path) -> impl FnOnce(std::io::Error) -> StoreError + '_ {
    move |source| StoreError::Io {
        path: path.to_path_buf(),
        source,
    }
}

/// Everything needed to rebuild a sandbox after a restart.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SandboxRecord {
    pub id: SandboxId,
    pub state: SandboxState,
    pub backend: BackendKind,
    pub spec: SandboxSpec,
    pub vsock_cid: u32,
    /// Present while the VM process should be running
    #[serde(default)]
    pub vm: Option<VmHandle>,
    #[serde(default)]
    pub containers: Vec<Container>,
    #[serde(default)]
    pub devices: Vec<DeviceDescriptor>,
    #[serde(default)]
    pub endpoints: Vec<NetworkEndpoint>,
    /// Why the sandbox failed, when it did
    #[serde(default)]
    pub failure: Option<String>,
    pub revision: u64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Directory-backed record store.
#[derive(Debug, Clone)]
pub struct Store {
    root: PathBuf,
}

impl Store {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn record_dir(&self, id: SandboxId) -> PathBuf {
        self.root.join(id.to_string())
    }

    /// Path of the record for `id`.
    pub fn record_path(&self, id: SandboxId) -> PathBuf {
        self.record_dir(id).join(RECORD_FILE)
    }

    /// Atomically replace the record for `record.id`.
    pub async fn save(&self, record: &SandboxRecord) -> Result<(), StoreError> {
        let data = serde_json::to_vec_pretty(record)?;
        let dir = self.record_dir(record.id);
        tokio::task::spawn_blocking(move || write_atomic(&dir, &data))
            .await
            .map_err(|e| StoreError::Task(e.to_string()))??;
        tracing::trace!(sandbox_id = %record.id, revision = record.revision, "Record saved");
        Ok(())
    }

    /// Load the record for `id`, if there is one.
    pub async fn load(&self, id: SandboxId) -> Result<Option<SandboxRecord>, StoreError> {
        let path = self.record_path(id);
        match tokio::fs::read(&path).await {
            Ok(data) => Ok(Some(serde_json::from_slice(&data)?)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(io_err(&path)(e)),
        }
    }

    /// Load every readable record, oldest first.
    ///
    /// Unreadable records are logged and skipped so one bad file does not
    /// block recovery of the rest.
    pub async fn load_all(&self) -> Result<Vec<SandboxRecord>, StoreError> {
        let mut entries = match tokio::fs::read_dir(&self.root).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(io_err(&self.root)(e)),
        };

        let mut records = Vec::new();
        while let Some(entry) = entries.next_entry().await.map_err(io_err(&self.root))? {
            let path = entry.path().join(RECORD_FILE);
            let data = match tokio::fs::read(&path).await {
                Ok(data) => data,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                    tracing::debug!(path = %entry.path().display(), "Skipping directory without record");
                    continue;
                }
                Err(e) => {
                    tracing::warn!(path = %path.display(), error = %e, "Skipping unreadable record");
                    continue;
                }
            };
            match serde_json::from_slice::<SandboxRecord>(&data) {
                Ok(record) => records.push(record),
                Err(e) => {
                    tracing::warn!(path = %path.display(), error = %e, "Skipping malformed record");
                }
            }
        }

        records.sort_by_key(|r| r.created_at);
        tracing::debug!(count = records.len(), root = %self.root.display(), "Records loaded");
        Ok(records)
    }

    /// Delete the record for `id`. Deleting a missing record is not an error.
    pub async fn delete(&self, id: SandboxId) -> Result<(), StoreError> {
        let dir = self.record_dir(id);
        match tokio::fs::remove_dir_all(&dir).await {
            Ok(()) => {
                tracing::debug!(sandbox_id = %id, "Record deleted");
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(io_err(&dir)(e)),
        }
    }

    /// Fail with [`StoreError::Stale`] if the store holds a newer revision
    /// of `record`.
    pub async fn ensure_fresh(&self, record: &SandboxRecord) -> Result<(), StoreError> {
        if let Some(current) = self.load(record.id).await? {
            if current.revision > record.revision {
                return Err(StoreError::Stale {
                    sandbox_id: record.id,
                    record: record.revision,
                    current: current.revision,
                });
            }
        }
        Ok(())
    }
}

fn write_atomic(dir: &Path, data: &[u8]) -> Result<(), StoreError> {
    std::fs::create_dir_all(dir).map_err(io_err(dir))?;

    let mut tmp = NamedTempFile::new_in(dir).map_err(io_err(dir))?;
    tmp.write_all(data).map_err(io_err(tmp.path()))?;
    tmp.as_file().sync_all().map_err(io_err(dir))?;

    let target = dir.join(RECORD_FILE);
    tmp.persist(&target).map_err(|e| StoreError::Io {
        path: target.clone(),
        source: e.error,
    })?;

    // make the rename itself durable
    std::fs::File::open(dir)
        .and_then(|d| d.sync_all())
        .map_err(io_err(dir))?;
    Ok(())
}
