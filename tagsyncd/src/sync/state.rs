use std::collections::BTreeMap;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard, PoisonError};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

#[derive(Debug, Error)]
pub enum StateError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
    #[error("corrupt state file: {0}")]
    Json(#[from] serde_json::Error),
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileSyncState {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub remote_revision: Option<String>,
    /// Milliseconds since the Unix epoch.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_local_modified_at: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_remote_modified_at: Option<i64>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncStateData {
    /// `None` starts a fresh full listing.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cursor: Option<String>,
    #[serde(default)]
    pub files: BTreeMap<String, FileSyncState>,
}

#[derive(Default)]
struct Inner {
    loaded: bool,
    data: SyncStateData,
}

/// Persisted cursor and per-file sync state, kept as a JSON document.
pub struct SyncStateStore {
    path: PathBuf,
    inner: Mutex<Inner>,
}

impl SyncStateStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            inner: Mutex::new(Inner::default()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Loads the state file once; later calls are no-ops.
    pub async fn initialize(&self) -> Result<(), StateError> {
        if self.lock().loaded {
            return Ok(());
        }
        let data = match tokio::fs::read(&self.path).await {
            Ok(bytes) => serde_json::from_slice(&bytes)?,
            Err(err) if err.kind() == io::ErrorKind::NotFound => SyncStateData::default(),
            Err(err) => return Err(err.into()),
        };
        let mut inner = self.lock();
        if !inner.loaded {
            debug!(files = data.files.len(), path = %self.path.display(), "sync state loaded");
            inner.data = data;
            inner.loaded = true;
        }
        Ok(())
    }

    pub fn cursor(&self) -> Option<String> {
        self.lock().data.cursor.clone()
    }

    pub fn set_cursor(&self, cursor: Option<String>) {
        self.lock().data.cursor = cursor;
    }

    pub fn file(&self, path: &str) -> Option<FileSyncState> {
        self.lock().data.files.get(path).cloned()
    }

    pub fn set_file(&self, path: &str, state: FileSyncState) {
        self.lock().data.files.insert(path.to_string(), state);
    }

    pub fn delete_file(&self, path: &str) -> Option<FileSyncState> {
        self.lock().data.files.remove(path)
    }

    pub fn all_files(&self) -> Vec<(String, FileSyncState)> {
        self.lock()
            .data
            .files
            .iter()
            .map(|(path, state)| (path.clone(), state.clone()))
            .collect()
    }

    pub fn snapshot(&self) -> SyncStateData {
        self.lock().data.clone()
    }

    /// Writes a point-in-time copy. Mutations made while the write is in
    /// flight stay in memory for the next save.
    pub async fn save(&self) -> Result<(), StateError> {
        let snapshot = self.snapshot();
        let json = serde_json::to_vec_pretty(&snapshot)?;
        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let partial = self.path.with_extension("json.partial");
        tokio::fs::write(&partial, json).await?;
        tokio::fs::rename(&partial, &self.path).await?;
        Ok(())
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
