use std::collections::BTreeSet;

use tagsync_core::{Download, FileMetadata, RemoteEntry};
use time::OffsetDateTime;
use tracing::{debug, info, warn};

use super::conflict::{
    RemoteChange, RemoteDeletion, Winner, changed_locally, classify_remote_change,
    classify_remote_deletion, free_conflict_copy_path, pick_winner,
};
use super::echo::EchoGuard;
use super::engine::EngineError;
use super::paths::{is_conflict_copy, is_document, to_local, to_remote};
use super::remote::RemoteStore;
use super::scope::ScopeIndex;
use super::state::{FileSyncState, SyncStateStore};
use super::tags::strip_sync_tags;
use super::vault::{FileStat, LocalVault, parent_folder};
use crate::settings::Settings;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PassOptions {
    /// Upload every in-scope document regardless of recorded state.
    pub force_upload: bool,
    /// Forget the stored cursor so the pull starts from a full listing.
    pub reset_cursor: bool,
}

impl PassOptions {
    pub fn merge(self, other: PassOptions) -> PassOptions {
        PassOptions {
            force_upload: self.force_upload || other.force_upload,
            reset_cursor: self.reset_cursor || other.reset_cursor,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PassReport {
    pub downloaded: usize,
    pub uploaded: usize,
    pub deleted_local: usize,
    pub deleted_remote: usize,
    pub conflicts: usize,
    pub skipped_oversize: usize,
}

impl PassReport {
    pub fn is_empty(&self) -> bool {
        *self == PassReport::default()
    }
}

/// One pull/push pass over borrowed collaborators.
pub(crate) struct Pass<'a> {
    pub remote: &'a dyn RemoteStore,
    pub vault: &'a dyn LocalVault,
    pub scope: &'a ScopeIndex,
    pub state: &'a SyncStateStore,
    pub echo: &'a EchoGuard,
    pub settings: &'a Settings,
}

struct Run<'a> {
    pass: Pass<'a>,
    sync_tags: BTreeSet<String>,
    report: PassReport,
}

impl<'a> Pass<'a> {
    /// Validates settings, then pulls and pushes. State is saved whether or
    /// not the pull or push failed; an invalid configuration touches nothing.
    pub async fn run(self, options: PassOptions) -> Result<PassReport, EngineError> {
        self.settings.validate()?;
        self.state.initialize().await?;
        if options.reset_cursor {
            debug!("discarding stored cursor");
            self.state.set_cursor(None);
        }

        let sync_tags = self.settings.sync_tag_set();
        let mut run = Run {
            pass: self,
            sync_tags,
            report: PassReport::default(),
        };
        let outcome = run.pull_then_push(options.force_upload).await;
        let saved = run.pass.state.save().await;
        outcome?;
        saved?;

        let report = run.report;
        if report.is_empty() {
            debug!("pass finished with nothing to do");
        } else {
            info!(
                downloaded = report.downloaded,
                uploaded = report.uploaded,
                deleted_local = report.deleted_local,
                deleted_remote = report.deleted_remote,
                conflicts = report.conflicts,
                skipped = report.skipped_oversize,
                "pass finished"
            );
        }
        Ok(report)
    }
}

impl Run<'_> {
    async fn pull_then_push(&mut self, force_upload: bool) -> Result<(), EngineError> {
        self.pull().await?;
        self.push(force_upload).await
    }

    fn base(&self) -> &str {
        &self.pass.settings.remote_base_path
    }

    async fn pull(&mut self) -> Result<(), EngineError> {
        let cursor = self.pass.state.cursor();
        let delta = self
            .pass
            .remote
            .list_delta(self.base(), cursor.as_deref())
            .await?;
        debug!(entries = delta.entries.len(), "remote delta fetched");
        for entry in delta.entries {
            self.apply_remote_entry(entry).await?;
        }
        self.pass.state.set_cursor(Some(delta.cursor));
        Ok(())
    }

    async fn apply_remote_entry(&mut self, entry: RemoteEntry) -> Result<(), EngineError> {
        let Some(local) = to_local(self.base(), entry.path_display()) else {
            return Ok(());
        };
        match entry {
            RemoteEntry::Folder(_) => Ok(()),
            RemoteEntry::Deleted(_) => self.apply_remote_deletion(&local).await,
            RemoteEntry::File(meta) => {
                if !is_document(&local) || is_conflict_copy(&local) {
                    debug!(path = local, "ignoring remote file outside the document set");
                    return Ok(());
                }
                self.apply_remote_file(&local, &meta).await
            }
        }
    }

    /// A deleted folder arrives as one entry; everything tracked below it
    /// goes through the same rules as a deleted document.
    async fn apply_remote_deletion(&mut self, local: &str) -> Result<(), EngineError> {
        if is_document(local) && !is_conflict_copy(local) {
            return self.apply_document_deletion(local).await;
        }
        self.pass.state.delete_file(local);
        if is_conflict_copy(local) {
            return Ok(());
        }
        let prefix = format!("{}/", local.to_lowercase());
        let nested: Vec<String> = self
            .pass
            .state
            .all_files()
            .into_iter()
            .map(|(path, _)| path)
            .filter(|path| path.to_lowercase().starts_with(&prefix))
            .collect();
        if !nested.is_empty() {
            debug!(folder = local, files = nested.len(), "remote folder deleted");
        }
        for path in nested {
            if is_document(&path) && !is_conflict_copy(&path) {
                self.apply_document_deletion(&path).await?;
            } else {
                self.pass.state.delete_file(&path);
            }
        }
        Ok(())
    }

    async fn apply_document_deletion(&mut self, local: &str) -> Result<(), EngineError> {
        let tracked = self.pass.state.file(local);
        let stat = self.pass.vault.stat(local).await?;
        match (classify_remote_deletion(tracked.as_ref(), stat), stat) {
            (RemoteDeletion::KeepLocal, Some(stat)) => {
                debug!(path = local, "remote delete lost against a local edit");
                let bytes = self.pass.vault.read(local).await?;
                self.write_conflict_copy(local, &bytes).await?;
                let orphaned = FileSyncState {
                    remote_revision: None,
                    ..tracked.unwrap_or_default()
                };
                self.pass.state.set_file(local, orphaned);
                self.upload_local(local, stat, Some(bytes)).await?;
            }
            (RemoteDeletion::DeleteLocal, _) => {
                self.pass.echo.mark(local);
                self.pass.vault.delete(local).await?;
                self.pass.state.delete_file(local);
                self.report.deleted_local += 1;
                debug!(path = local, "deleted locally after remote delete");
            }
            _ => {
                self.pass.state.delete_file(local);
            }
        }
        Ok(())
    }

    async fn apply_remote_file(&mut self, local: &str, meta: &FileMetadata) -> Result<(), EngineError> {
        let tracked = self.pass.state.file(local);
        let stat = self.pass.vault.stat(local).await?;
        match (classify_remote_change(tracked.as_ref(), &meta.rev, stat), stat) {
            (RemoteChange::AlreadyApplied, _) => {
                debug!(path = local, rev = %meta.rev, "remote revision already applied");
                Ok(())
            }
            (RemoteChange::Diverged, Some(stat)) => {
                let download = self.pass.remote.download(&meta.path_display).await?;
                let local_bytes = self.pass.vault.read(local).await?;
                if download.bytes == local_bytes {
                    debug!(path = local, "both sides converged on the same content");
                    self.record(local, stat, &download.metadata);
                    return Ok(());
                }
                // The losing side survives only in the conflict copy.
                match pick_winner(stat.modified_ms, meta.server_modified_ms()) {
                    Winner::Remote => {
                        self.write_conflict_copy(local, &local_bytes).await?;
                        self.write_download(local, download).await
                    }
                    Winner::Local => {
                        self.write_conflict_copy(local, &download.bytes).await?;
                        self.upload_local(local, stat, Some(local_bytes)).await
                    }
                }
            }
            _ => {
                let download = self.pass.remote.download(&meta.path_display).await?;
                self.write_download(local, download).await
            }
        }
    }

    async fn push(&mut self, force_upload: bool) -> Result<(), EngineError> {
        let scope = self
            .pass
            .scope
            .compute_scope(&self.sync_tags, &self.pass.settings.ignore_globs)
            .await?;

        for (path, tracked) in self.pass.state.all_files() {
            let remove = match self.pass.vault.stat(&path).await? {
                None => true,
                Some(_) if is_conflict_copy(&path) => true,
                Some(stat) => !scope.contains(&path) && changed_locally(Some(&tracked), stat),
            };
            if !remove {
                continue;
            }
            if tracked.remote_revision.is_some() {
                let remote_path = to_remote(self.base(), &path);
                if self.pass.remote.delete(&remote_path).await? {
                    self.report.deleted_remote += 1;
                }
                debug!(path, "removed from remote");
            }
            self.pass.state.delete_file(&path);
        }

        for path in &scope {
            let Some(stat) = self.pass.vault.stat(path).await? else {
                continue;
            };
            let tracked = self.pass.state.file(path);
            if !force_upload && !changed_locally(tracked.as_ref(), stat) {
                continue;
            }
            self.upload_local(path, stat, None).await?;
        }
        Ok(())
    }

    /// Oversized files are not uploaded, but their modification time is
    /// recorded so the skip is not repeated every pass.
    async fn upload_local(
        &mut self,
        local: &str,
        stat: FileStat,
        bytes: Option<Vec<u8>>,
    ) -> Result<(), EngineError> {
        let limit = self.pass.settings.max_upload_bytes;
        if stat.size > limit {
            warn!(path = local, size = stat.size, limit, "skipping upload above the size limit");
            let mut state = self.pass.state.file(local).unwrap_or_default();
            state.last_local_modified_at = Some(stat.modified_ms);
            self.pass.state.set_file(local, state);
            self.report.skipped_oversize += 1;
            return Ok(());
        }
        let bytes = match bytes {
            Some(bytes) => bytes,
            None => self.pass.vault.read(local).await?,
        };
        let remote_path = to_remote(self.base(), local);
        let meta = self.pass.remote.upload(&remote_path, &bytes).await?;
        debug!(path = local, rev = %meta.rev, "uploaded");
        self.record(local, stat, &meta);
        self.report.uploaded += 1;
        Ok(())
    }

    async fn write_download(&mut self, local: &str, download: Download) -> Result<(), EngineError> {
        if let Some(parent) = parent_folder(local) {
            // Every missing ancestor may be created, and each raises its own event.
            let mut folder = Some(parent);
            while let Some(dir) = folder {
                self.pass.echo.mark(dir);
                folder = parent_folder(dir);
            }
            self.pass.vault.create_folder(parent).await?;
        }
        self.pass.echo.mark(local);
        let stat = self.pass.vault.write(local, &download.bytes).await?;
        debug!(path = local, rev = %download.metadata.rev, "downloaded");
        self.record(local, stat, &download.metadata);
        self.report.downloaded += 1;
        Ok(())
    }

    /// Saves a tag-stripped copy of `bytes` next to `local` so the copy never
    /// re-enters scope.
    async fn write_conflict_copy(&mut self, local: &str, bytes: &[u8]) -> Result<(), EngineError> {
        let copy = free_conflict_copy_path(
            self.pass.vault,
            local,
            &self.pass.settings.installation_id,
            OffsetDateTime::now_utc(),
        )
        .await?;
        let sanitized = strip_sync_tags(&String::from_utf8_lossy(bytes), &self.sync_tags);
        self.pass.echo.mark(&copy);
        self.pass.vault.write(&copy, sanitized.as_bytes()).await?;
        self.report.conflicts += 1;
        info!(path = local, copy, "conflict copy written");
        Ok(())
    }

    fn record(&self, local: &str, stat: FileStat, meta: &FileMetadata) {
        self.pass.state.set_file(
            local,
            FileSyncState {
                remote_revision: Some(meta.rev.clone()),
                last_local_modified_at: Some(stat.modified_ms),
                last_remote_modified_at: meta.server_modified_ms(),
            },
        );
    }
}

#[cfg(test)]
#[path = "reconcile_tests.rs"]
mod tests;
