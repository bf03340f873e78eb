use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tagsync_core::{
    DeletedMetadata, Delta, Download, FileMetadata, RemoteEntry, RemoteError, StatusCode,
};
use time::OffsetDateTime;
use time::format_description::well_known::Rfc3339;
use tokio::sync::Semaphore;

use super::paths::{file_name, is_document, is_hidden};
use super::remote::RemoteStore;
use super::vault::{FileStat, LocalVault, VaultError, parent_folder};

/// In-memory vault. Writes stamp a monotonic modification time.
pub(crate) struct MemoryVault {
    files: Mutex<BTreeMap<String, (Vec<u8>, i64)>>,
    folders: Mutex<BTreeSet<String>>,
    clock: AtomicI64,
}

impl MemoryVault {
    pub fn new() -> Self {
        Self {
            files: Mutex::new(BTreeMap::new()),
            folders: Mutex::new(BTreeSet::new()),
            clock: AtomicI64::new(10_000),
        }
    }

    /// Simulates a user edit with an explicit modification time.
    pub fn insert(&self, path: &str, content: &str, modified_ms: i64) {
        self.files
            .lock()
            .unwrap()
            .insert(path.to_string(), (content.as_bytes().to_vec(), modified_ms));
    }

    pub fn remove(&self, path: &str) {
        self.files.lock().unwrap().remove(path);
    }

    pub fn content(&self, path: &str) -> Option<String> {
        self.files
            .lock()
            .unwrap()
            .get(path)
            .map(|(bytes, _)| String::from_utf8_lossy(bytes).into_owned())
    }

    pub fn paths(&self) -> Vec<String> {
        self.files.lock().unwrap().keys().cloned().collect()
    }

    pub fn has_folder(&self, path: &str) -> bool {
        self.folders.lock().unwrap().contains(path)
    }
}

#[async_trait]
impl LocalVault for MemoryVault {
    async fn stat(&self, path: &str) -> Result<Option<FileStat>, VaultError> {
        Ok(self.files.lock().unwrap().get(path).map(|(bytes, mtime)| FileStat {
            modified_ms: *mtime,
            size: bytes.len() as u64,
        }))
    }

    async fn read(&self, path: &str) -> Result<Vec<u8>, VaultError> {
        self.files
            .lock()
            .unwrap()
            .get(path)
            .map(|(bytes, _)| bytes.clone())
            .ok_or_else(|| VaultError::NotFound(path.to_string()))
    }

    async fn write(&self, path: &str, bytes: &[u8]) -> Result<FileStat, VaultError> {
        let modified_ms = self.clock.fetch_add(1, Ordering::SeqCst) + 1;
        self.files
            .lock()
            .unwrap()
            .insert(path.to_string(), (bytes.to_vec(), modified_ms));
        Ok(FileStat {
            modified_ms,
            size: bytes.len() as u64,
        })
    }

    async fn delete(&self, path: &str) -> Result<bool, VaultError> {
        Ok(self.files.lock().unwrap().remove(path).is_some())
    }

    async fn create_folder(&self, path: &str) -> Result<(), VaultError> {
        let mut folders = self.folders.lock().unwrap();
        let mut current = Some(path);
        while let Some(folder) = current {
            folders.insert(folder.to_string());
            current = parent_folder(folder);
        }
        Ok(())
    }

    async fn list_documents(&self) -> Result<Vec<String>, VaultError> {
        Ok(self
            .files
            .lock()
            .unwrap()
            .keys()
            .filter(|path| is_document(path) && !is_hidden(path))
            .cloned()
            .collect())
    }
}

struct RemoteFile {
    bytes: Vec<u8>,
    metadata: FileMetadata,
}

#[derive(Default)]
struct RemoteTree {
    files: BTreeMap<String, RemoteFile>,
    pending: Vec<RemoteEntry>,
    next_rev: u64,
    next_cursor: u64,
}

/// In-memory remote with Dropbox-like delta semantics. A missing cursor
/// returns the full listing; otherwise only changes recorded since the
/// previous listing. Our own uploads and deletes show up in the delta too.
pub(crate) struct MemoryRemote {
    tree: Mutex<RemoteTree>,
    clock: AtomicI64,
    unreachable: AtomicBool,
    failing_uploads: AtomicBool,
    gate: Option<Arc<Semaphore>>,
    lists: AtomicUsize,
    uploads: AtomicUsize,
    downloads: AtomicUsize,
    deletes: AtomicUsize,
}

impl MemoryRemote {
    pub fn new() -> Self {
        Self {
            tree: Mutex::new(RemoteTree::default()),
            clock: AtomicI64::new(1_704_067_200_000),
            unreachable: AtomicBool::new(false),
            failing_uploads: AtomicBool::new(false),
            gate: None,
            lists: AtomicUsize::new(0),
            uploads: AtomicUsize::new(0),
            downloads: AtomicUsize::new(0),
            deletes: AtomicUsize::new(0),
        }
    }

    /// Every `list_delta` call waits for a permit from the returned gate.
    pub fn gated() -> (Self, Arc<Semaphore>) {
        let gate = Arc::new(Semaphore::new(0));
        let remote = Self {
            gate: Some(gate.clone()),
            ..Self::new()
        };
        (remote, gate)
    }

    /// Simulates a change from another device.
    pub fn put(&self, path: &str, content: &str, modified_ms: i64) -> FileMetadata {
        self.store(path, content.as_bytes(), modified_ms)
    }

    /// Simulates a delete from another device.
    pub fn remove(&self, path: &str) {
        let mut tree = self.tree.lock().unwrap();
        if tree.files.remove(path).is_some() {
            tree.pending.push(deleted(path));
        }
    }

    /// Deletes a whole folder. Like the real API, the delta carries a single
    /// entry for the folder and none for its children, and the folder path
    /// may differ in case from how the children were stored.
    pub fn remove_folder(&self, path: &str) {
        let prefix = format!("{}/", path.to_lowercase());
        let mut tree = self.tree.lock().unwrap();
        tree.files
            .retain(|file, _| !file.to_lowercase().starts_with(&prefix));
        tree.pending.push(deleted(path));
    }

    /// Reports a delete in the next delta whether or not the path exists.
    pub fn push_deleted(&self, path: &str) {
        self.tree.lock().unwrap().pending.push(deleted(path));
    }

    pub fn content(&self, path: &str) -> Option<String> {
        self.tree
            .lock()
            .unwrap()
            .files
            .get(path)
            .map(|file| String::from_utf8_lossy(&file.bytes).into_owned())
    }

    pub fn metadata(&self, path: &str) -> Option<FileMetadata> {
        self.tree
            .lock()
            .unwrap()
            .files
            .get(path)
            .map(|file| file.metadata.clone())
    }

    pub fn paths(&self) -> Vec<String> {
        self.tree.lock().unwrap().files.keys().cloned().collect()
    }

    pub fn set_unreachable(&self, unreachable: bool) {
        self.unreachable.store(unreachable, Ordering::SeqCst);
    }

    /// Only uploads fail; listing and downloads keep working.
    pub fn fail_uploads(&self, failing: bool) {
        self.failing_uploads.store(failing, Ordering::SeqCst);
    }

    pub fn list_calls(&self) -> usize {
        self.lists.load(Ordering::SeqCst)
    }

    pub fn upload_calls(&self) -> usize {
        self.uploads.load(Ordering::SeqCst)
    }

    pub fn download_calls(&self) -> usize {
        self.downloads.load(Ordering::SeqCst)
    }

    pub fn delete_calls(&self) -> usize {
        self.deletes.load(Ordering::SeqCst)
    }

    pub fn total_calls(&self) -> usize {
        self.list_calls() + self.upload_calls() + self.download_calls() + self.delete_calls()
    }

    fn check_reachable(&self) -> Result<(), RemoteError> {
        if self.unreachable.load(Ordering::SeqCst) {
            Err(RemoteError::Unreachable)
        } else {
            Ok(())
        }
    }

    fn store(&self, path: &str, bytes: &[u8], modified_ms: i64) -> FileMetadata {
        let mut tree = self.tree.lock().unwrap();
        tree.next_rev += 1;
        let metadata = FileMetadata {
            name: file_name(path).to_string(),
            path_display: path.to_string(),
            path_lower: Some(path.to_lowercase()),
            rev: format!("r{}", tree.next_rev),
            server_modified: rfc3339(modified_ms),
            size: bytes.len() as u64,
            content_hash: None,
        };
        tree.files.insert(
            path.to_string(),
            RemoteFile {
                bytes: bytes.to_vec(),
                metadata: metadata.clone(),
            },
        );
        tree.pending.push(RemoteEntry::File(metadata.clone()));
        metadata
    }
}

#[async_trait]
impl RemoteStore for MemoryRemote {
    async fn upload(&self, path: &str, bytes: &[u8]) -> Result<FileMetadata, RemoteError> {
        self.uploads.fetch_add(1, Ordering::SeqCst);
        self.check_reachable()?;
        if self.failing_uploads.load(Ordering::SeqCst) {
            return Err(RemoteError::Unreachable);
        }
        let modified_ms = self.clock.fetch_add(1_000, Ordering::SeqCst) + 1_000;
        Ok(self.store(path, bytes, modified_ms))
    }

    async fn download(&self, path: &str) -> Result<Download, RemoteError> {
        self.downloads.fetch_add(1, Ordering::SeqCst);
        self.check_reachable()?;
        let tree = self.tree.lock().unwrap();
        let file = tree.files.get(path).ok_or_else(|| RemoteError::Api {
            status: StatusCode::CONFLICT,
            body: r#"{"error_summary": "path/not_found/"}"#.to_string(),
        })?;
        Ok(Download {
            metadata: file.metadata.clone(),
            bytes: file.bytes.clone(),
        })
    }

    async fn delete(&self, path: &str) -> Result<bool, RemoteError> {
        self.deletes.fetch_add(1, Ordering::SeqCst);
        self.check_reachable()?;
        let mut tree = self.tree.lock().unwrap();
        if tree.files.remove(path).is_none() {
            return Ok(false);
        }
        tree.pending.push(deleted(path));
        Ok(true)
    }

    async fn list_delta(
        &self,
        _base_path: &str,
        cursor: Option<&str>,
    ) -> Result<Delta, RemoteError> {
        self.lists.fetch_add(1, Ordering::SeqCst);
        if let Some(gate) = &self.gate {
            gate.acquire().await.map_err(|_| RemoteError::Unreachable)?.forget();
        }
        self.check_reachable()?;
        let mut tree = self.tree.lock().unwrap();
        let pending = std::mem::take(&mut tree.pending);
        let entries = match cursor {
            None => tree
                .files
                .values()
                .map(|file| RemoteEntry::File(file.metadata.clone()))
                .collect(),
            Some(_) => pending,
        };
        tree.next_cursor += 1;
        Ok(Delta {
            entries,
            cursor: format!("c{}", tree.next_cursor),
        })
    }
}

fn deleted(path: &str) -> RemoteEntry {
    RemoteEntry::Deleted(DeletedMetadata {
        name: file_name(path).to_string(),
        path_display: path.to_string(),
    })
}

fn rfc3339(ms: i64) -> String {
    OffsetDateTime::from_unix_timestamp_nanos(i128::from(ms) * 1_000_000)
        .ok()
        .and_then(|at| at.format(&Rfc3339).ok())
        .unwrap_or_default()
}
