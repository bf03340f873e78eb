use std::io;
use std::path::{Path, PathBuf};
use std::time::UNIX_EPOCH;

use async_trait::async_trait;
use thiserror::Error;

use super::paths::is_document;

#[derive(Debug, Error)]
pub enum VaultError {
    #[error("I/O error at {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: io::Error,
    },
    #[error("unsupported vault path: {0}")]
    InvalidPath(String),
    #[error("file not found: {0}")]
    NotFound(String),
}

impl VaultError {
    fn io(path: &str, source: io::Error) -> Self {
        if source.kind() == io::ErrorKind::NotFound {
            VaultError::NotFound(path.to_string())
        } else {
            VaultError::Io {
                path: path.to_string(),
                source,
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FileStat {
    /// Milliseconds since the Unix epoch.
    pub modified_ms: i64,
    pub size: u64,
}

/// The local document tree. Paths are vault-relative and `/`-separated.
#[async_trait]
pub trait LocalVault: Send + Sync {
    /// `None` when nothing (or a folder) sits at `path`.
    async fn stat(&self, path: &str) -> Result<Option<FileStat>, VaultError>;
    async fn read(&self, path: &str) -> Result<Vec<u8>, VaultError>;
    /// Replaces the file atomically. The parent folder must exist.
    async fn write(&self, path: &str, bytes: &[u8]) -> Result<FileStat, VaultError>;
    /// Returns `false` when the file was already gone.
    async fn delete(&self, path: &str) -> Result<bool, VaultError>;
    async fn create_folder(&self, path: &str) -> Result<(), VaultError>;
    /// Every document outside dot-directories, sorted.
    async fn list_documents(&self) -> Result<Vec<String>, VaultError>;
}

pub struct FsVault {
    root: PathBuf,
}

impl FsVault {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn resolve(&self, path: &str) -> Result<PathBuf, VaultError> {
        let mut out = self.root.clone();
        let mut any = false;
        for segment in path.split('/').filter(|s| !s.is_empty()) {
            if segment == "." || segment == ".." || segment.contains('\\') {
                return Err(VaultError::InvalidPath(path.to_string()));
            }
            out.push(segment);
            any = true;
        }
        if !any {
            return Err(VaultError::InvalidPath(path.to_string()));
        }
        Ok(out)
    }
}

#[async_trait]
impl LocalVault for FsVault {
    async fn stat(&self, path: &str) -> Result<Option<FileStat>, VaultError> {
        let target = self.resolve(path)?;
        match tokio::fs::metadata(&target).await {
            Ok(meta) if meta.is_file() => Ok(Some(stat_from(&meta))),
            Ok(_) => Ok(None),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(err) => Err(VaultError::io(path, err)),
        }
    }

    async fn read(&self, path: &str) -> Result<Vec<u8>, VaultError> {
        let target = self.resolve(path)?;
        tokio::fs::read(&target)
            .await
            .map_err(|err| VaultError::io(path, err))
    }

    async fn write(&self, path: &str, bytes: &[u8]) -> Result<FileStat, VaultError> {
        let target = self.resolve(path)?;
        let partial = partial_path(&target);
        if let Err(err) = tokio::fs::write(&partial, bytes).await {
            let _ = tokio::fs::remove_file(&partial).await;
            return Err(VaultError::io(path, err));
        }
        tokio::fs::rename(&partial, &target)
            .await
            .map_err(|err| VaultError::io(path, err))?;
        let meta = tokio::fs::metadata(&target)
            .await
            .map_err(|err| VaultError::io(path, err))?;
        Ok(stat_from(&meta))
    }

    async fn delete(&self, path: &str) -> Result<bool, VaultError> {
        let target = self.resolve(path)?;
        match tokio::fs::remove_file(&target).await {
            Ok(()) => Ok(true),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(false),
            Err(err) => Err(VaultError::io(path, err)),
        }
    }

    async fn create_folder(&self, path: &str) -> Result<(), VaultError> {
        let target = self.resolve(path)?;
        tokio::fs::create_dir_all(&target)
            .await
            .map_err(|err| VaultError::io(path, err))
    }

    async fn list_documents(&self) -> Result<Vec<String>, VaultError> {
        let mut documents = Vec::new();
        let mut pending = vec![String::new()];
        while let Some(dir) = pending.pop() {
            let absolute = if dir.is_empty() {
                self.root.clone()
            } else {
                self.resolve(&dir)?
            };
            let mut entries = match tokio::fs::read_dir(&absolute).await {
                Ok(entries) => entries,
                Err(err) if err.kind() == io::ErrorKind::NotFound => continue,
                Err(err) => return Err(VaultError::io(&dir, err)),
            };
            while let Some(entry) = entries
                .next_entry()
                .await
                .map_err(|err| VaultError::io(&dir, err))?
            {
                let name = entry.file_name().to_string_lossy().into_owned();
                if name.starts_with('.') {
                    continue;
                }
                let relative = if dir.is_empty() {
                    name
                } else {
                    format!("{dir}/{name}")
                };
                let kind = entry
                    .file_type()
                    .await
                    .map_err(|err| VaultError::io(&relative, err))?;
                if kind.is_dir() {
                    pending.push(relative);
                } else if kind.is_file() && is_document(&relative) {
                    documents.push(relative);
                }
            }
        }
        documents.sort();
        Ok(documents)
    }
}

fn stat_from(meta: &std::fs::Metadata) -> FileStat {
    let modified_ms = meta
        .modified()
        .ok()
        .and_then(|at| at.duration_since(UNIX_EPOCH).ok())
        .map(|d| i64::try_from(d.as_millis()).unwrap_or(i64::MAX))
        .unwrap_or(0);
    FileStat {
        modified_ms,
        size: meta.len(),
    }
}

/// Hidden sibling so listings and the watcher skip in-flight writes.
fn partial_path(target: &Path) -> PathBuf {
    let name = target
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_default();
    target.with_file_name(format!(".{name}.partial"))
}

pub(crate) fn parent_folder(path: &str) -> Option<&str> {
    path.rsplit_once('/')
        .map(|(dir, _)| dir)
        .filter(|dir| !dir.is_empty())
}
