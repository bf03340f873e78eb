use std::path::PathBuf;
use std::sync::Arc;

use tagsync_core::Credentials;
use tempfile::{TempDir, tempdir};

use super::{Pass, PassOptions, PassReport};
use crate::settings::{ConfigError, Settings};
use crate::sync::echo::EchoGuard;
use crate::sync::engine::EngineError;
use crate::sync::paths::is_conflict_copy;
use crate::sync::scope::ScopeIndex;
use crate::sync::state::SyncStateStore;
use crate::sync::tags::MarkdownTagSource;
use crate::sync::test_support::{MemoryRemote, MemoryVault};
use crate::sync::vault::LocalVault;

const TAGGED: &str = "---\ntags: [shared]\n---\nhello\n";
/// 2024-01-01T10:00:00Z
const REMOTE_TIME: i64 = 1_704_103_200_000;

fn settings() -> Settings {
    Settings {
        sync_tags: vec!["shared".into()],
        installation_id: "v1".into(),
        credentials: Credentials::static_token("token"),
        ..Settings::default()
    }
    .normalized()
}

struct Harness {
    remote: MemoryRemote,
    vault: Arc<MemoryVault>,
    scope: ScopeIndex,
    state: SyncStateStore,
    state_path: PathBuf,
    echo: EchoGuard,
    settings: Settings,
    _dir: TempDir,
}

impl Harness {
    fn new() -> Self {
        Self::with_settings(settings())
    }

    fn with_settings(settings: Settings) -> Self {
        let dir = tempdir().unwrap();
        let state_path = dir.path().join("state.json");
        let vault = Arc::new(MemoryVault::new());
        let local: Arc<dyn LocalVault> = vault.clone();
        let scope = ScopeIndex::new(local.clone(), Arc::new(MarkdownTagSource::new(local)));
        Self {
            remote: MemoryRemote::new(),
            vault,
            scope,
            state: SyncStateStore::new(&state_path),
            state_path,
            echo: EchoGuard::default(),
            settings,
            _dir: dir,
        }
    }

    async fn pass_with(&self, options: PassOptions) -> Result<PassReport, EngineError> {
        Pass {
            remote: &self.remote,
            vault: self.vault.as_ref(),
            scope: &self.scope,
            state: &self.state,
            echo: &self.echo,
            settings: &self.settings,
        }
        .run(options)
        .await
    }

    async fn pass(&self) -> PassReport {
        self.pass_with(PassOptions::default()).await.unwrap()
    }

    /// Tracks `a.md` with revision `r1` and local mtime 500.
    async fn synced_document(&self) {
        self.vault.insert("a.md", TAGGED, 500);
        let report = self.pass().await;
        assert_eq!(report.uploaded, 1);
    }

    fn conflict_copies(&self) -> Vec<String> {
        self.vault
            .paths()
            .into_iter()
            .filter(|path| is_conflict_copy(path))
            .collect()
    }
}

#[tokio::test]
async fn first_pass_uploads_tagged_documents_and_second_pass_is_quiet() {
    let h = Harness::new();
    h.vault.insert("a.md", TAGGED, 500);
    h.vault.insert("b.md", "nothing to share", 500);

    let first = h.pass().await;
    assert_eq!(first.uploaded, 1);
    assert_eq!(h.remote.paths(), vec!["/Tagsync/a.md".to_string()]);
    let tracked = h.state.file("a.md").unwrap();
    assert_eq!(tracked.remote_revision.as_deref(), Some("r1"));
    assert_eq!(tracked.last_local_modified_at, Some(500));
    assert!(h.state.file("b.md").is_none());

    let second = h.pass().await;
    assert!(second.is_empty(), "{second:?}");
    assert_eq!(h.remote.upload_calls(), 1);
    assert_eq!(h.remote.download_calls(), 0);
    assert_eq!(h.remote.delete_calls(), 0);
}

#[tokio::test]
async fn remote_file_is_downloaded_into_missing_folder() {
    let h = Harness::new();
    h.remote.put("/Tagsync/Projects/plan.md", "remote plan", REMOTE_TIME);

    let report = h.pass().await;
    assert_eq!(report.downloaded, 1);
    assert_eq!(h.vault.content("Projects/plan.md").as_deref(), Some("remote plan"));
    assert!(h.vault.has_folder("Projects"));
    assert!(h.echo.is_suppressed("Projects/plan.md"));

    let tracked = h.state.file("Projects/plan.md").unwrap();
    assert_eq!(tracked.remote_revision.as_deref(), Some("r1"));
    assert_eq!(tracked.last_remote_modified_at, Some(REMOTE_TIME));
    assert_eq!(h.remote.upload_calls(), 0);
}

#[tokio::test]
async fn folders_created_for_a_download_are_marked_as_own_writes() {
    let h = Harness::new();
    h.remote.put("/Tagsync/Projects/Q1/plan.md", "remote plan", REMOTE_TIME);

    h.pass().await;
    assert!(h.vault.has_folder("Projects/Q1"));
    assert!(h.echo.is_suppressed("Projects/Q1"));
    assert!(h.echo.is_suppressed("Projects"));
    assert!(!h.echo.is_suppressed("Other"));
}

#[tokio::test]
async fn remote_edit_overwrites_untouched_local_copy() {
    let h = Harness::new();
    h.synced_document().await;
    let edited = "---\ntags: [shared]\n---\nfrom phone\n";
    h.remote.put("/Tagsync/a.md", edited, REMOTE_TIME);

    let report = h.pass().await;
    assert_eq!(report.downloaded, 1);
    assert_eq!(report.conflicts, 0);
    assert_eq!(report.uploaded, 0);
    assert_eq!(h.vault.content("a.md").as_deref(), Some(edited));
    assert_eq!(
        h.state.file("a.md").unwrap().remote_revision.as_deref(),
        Some("r2")
    );
}

#[tokio::test]
async fn later_remote_edit_wins_and_local_edit_becomes_conflict_copy() {
    let h = Harness::new();
    h.synced_document().await;
    h.vault.insert("a.md", "---\ntags: [shared]\n---\nlocal edit #shared\n", 1_000);
    let remote_edit = "---\ntags: [shared]\n---\nremote edit\n";
    h.remote.put("/Tagsync/a.md", remote_edit, REMOTE_TIME);

    let report = h.pass().await;
    assert_eq!(report.conflicts, 1);
    assert_eq!(report.downloaded, 1);
    assert_eq!(h.vault.content("a.md").as_deref(), Some(remote_edit));

    let copies = h.conflict_copies();
    assert_eq!(copies.len(), 1);
    assert!(copies[0].starts_with("a (conflict v1 "), "{copies:?}");
    let copy = h.vault.content(&copies[0]).unwrap();
    assert!(copy.contains("local edit"));
    assert!(!copy.contains("shared"), "{copy}");
    assert_eq!(h.remote.upload_calls(), 1);
}

#[tokio::test]
async fn later_local_edit_wins_and_remote_edit_becomes_conflict_copy() {
    let h = Harness::new();
    h.synced_document().await;
    let local_edit = "---\ntags: [shared]\n---\nlocal edit\n";
    h.vault.insert("a.md", local_edit, 4_000_000_000_000);
    h.remote.put("/Tagsync/a.md", "---\ntags: [shared]\n---\nremote edit\n", REMOTE_TIME);

    let report = h.pass().await;
    assert_eq!(report.conflicts, 1);
    assert_eq!(report.uploaded, 1);
    assert_eq!(h.vault.content("a.md").as_deref(), Some(local_edit));
    assert_eq!(h.remote.content("/Tagsync/a.md").as_deref(), Some(local_edit));

    let copies = h.conflict_copies();
    assert_eq!(copies.len(), 1);
    let copy = h.vault.content(&copies[0]).unwrap();
    assert!(copy.contains("remote edit"));
    assert!(!copy.contains("shared"));

    assert!(h.pass().await.is_empty());
    assert_eq!(h.conflict_copies().len(), 1);
}

#[tokio::test]
async fn identical_edits_converge_without_conflict() {
    let h = Harness::new();
    h.synced_document().await;
    let same = "---\ntags: [shared]\n---\nsame words\n";
    h.vault.insert("a.md", same, 1_000);
    h.remote.put("/Tagsync/a.md", same, REMOTE_TIME);

    let report = h.pass().await;
    assert!(report.is_empty(), "{report:?}");
    assert!(h.conflict_copies().is_empty());
    let tracked = h.state.file("a.md").unwrap();
    assert_eq!(tracked.remote_revision.as_deref(), Some("r2"));
    assert_eq!(tracked.last_local_modified_at, Some(1_000));
    assert_eq!(h.remote.upload_calls(), 1);
}

#[tokio::test]
async fn remote_delete_removes_untouched_local_file() {
    let h = Harness::new();
    h.synced_document().await;
    h.remote.remove("/Tagsync/a.md");

    let report = h.pass().await;
    assert_eq!(report.deleted_local, 1);
    assert!(h.vault.content("a.md").is_none());
    assert!(h.state.file("a.md").is_none());
    assert!(h.echo.is_suppressed("a.md"));
    assert_eq!(h.remote.upload_calls(), 1);
}

#[tokio::test]
async fn remote_delete_never_wins_over_a_local_edit() {
    let h = Harness::new();
    h.synced_document().await;
    let edited = "---\ntags: [shared]\n---\nstill needed\n";
    h.vault.insert("a.md", edited, 1_000);
    h.remote.remove("/Tagsync/a.md");

    let report = h.pass().await;
    assert_eq!(report.deleted_local, 0);
    assert_eq!(report.conflicts, 1);
    assert_eq!(report.uploaded, 1);
    assert_eq!(h.vault.content("a.md").as_deref(), Some(edited));
    assert_eq!(h.remote.content("/Tagsync/a.md").as_deref(), Some(edited));

    let copies = h.conflict_copies();
    assert_eq!(copies.len(), 1);
    assert!(h.vault.content(&copies[0]).unwrap().contains("still needed"));
    assert!(h.pass().await.is_empty());
}

#[tokio::test]
async fn remote_folder_delete_reaches_tracked_documents_inside_it() {
    let h = Harness::new();
    h.vault.insert("Notes/a.md", TAGGED, 500);
    h.vault.insert("Notes/b.md", TAGGED, 500);
    h.vault.insert("Other/c.md", TAGGED, 500);
    assert_eq!(h.pass().await.uploaded, 3);

    let edited = "---\ntags: [shared]\n---\nedited offline\n";
    h.vault.insert("Notes/b.md", edited, 1_000);
    h.remote.remove_folder("/Tagsync/Notes");

    let report = h.pass().await;
    assert_eq!(report.deleted_local, 1);
    assert_eq!(report.conflicts, 1);
    assert_eq!(report.uploaded, 1);
    assert!(h.vault.content("Notes/a.md").is_none());
    assert!(h.state.file("Notes/a.md").is_none());
    assert!(h.state.file("Notes").is_none());

    assert_eq!(h.vault.content("Notes/b.md").as_deref(), Some(edited));
    assert_eq!(h.remote.content("/Tagsync/Notes/b.md").as_deref(), Some(edited));
    assert_eq!(h.conflict_copies().len(), 1);
    assert!(h.conflict_copies()[0].starts_with("Notes/b (conflict v1 "));

    assert!(h.state.file("Other/c.md").is_some());
    assert_eq!(h.vault.content("Other/c.md").as_deref(), Some(TAGGED));
    assert_eq!(
        h.remote.paths(),
        vec!["/Tagsync/Notes/b.md".to_string(), "/Tagsync/Other/c.md".to_string()]
    );

    assert!(h.pass().await.is_empty());
}

#[tokio::test]
async fn remote_folder_delete_matches_tracked_paths_case_insensitively() {
    let h = Harness::new();
    h.vault.insert("Notes/a.md", TAGGED, 500);
    h.pass().await;
    h.remote.remove_folder("/Tagsync/notes");

    let report = h.pass().await;
    assert_eq!(report.deleted_local, 1);
    assert!(h.vault.content("Notes/a.md").is_none());
    assert!(h.state.file("Notes/a.md").is_none());
}

#[tokio::test]
async fn remote_delete_of_untracked_path_is_ignored() {
    let h = Harness::new();
    h.pass().await;
    h.vault.insert("loose.md", "not shared", 500);
    h.remote.push_deleted("/Tagsync/loose.md");

    let report = h.pass().await;
    assert!(report.is_empty());
    assert_eq!(h.vault.content("loose.md").as_deref(), Some("not shared"));
    assert!(h.state.file("loose.md").is_none());
    assert_eq!(h.remote.delete_calls(), 0);
}

#[tokio::test]
async fn local_delete_removes_remote_copy() {
    let h = Harness::new();
    h.synced_document().await;
    h.vault.remove("a.md");

    let report = h.pass().await;
    assert_eq!(report.deleted_remote, 1);
    assert!(h.remote.paths().is_empty());
    assert!(h.state.file("a.md").is_none());

    // The delete echoes back through the delta as a no-op.
    assert!(h.pass().await.is_empty());
}

#[tokio::test]
async fn edited_document_that_lost_its_tag_is_removed_remotely() {
    let h = Harness::new();
    h.synced_document().await;
    h.vault.insert("a.md", "no longer shared", 1_000);

    let report = h.pass().await;
    assert_eq!(report.deleted_remote, 1);
    assert!(h.remote.paths().is_empty());
    assert!(h.state.file("a.md").is_none());
    assert_eq!(h.vault.content("a.md").as_deref(), Some("no longer shared"));
}

#[tokio::test]
async fn oversize_documents_are_skipped_once() {
    let h = Harness::with_settings(Settings {
        max_upload_bytes: 10,
        ..settings()
    });
    h.vault.insert("a.md", TAGGED, 500);

    let report = h.pass().await;
    assert_eq!(report.skipped_oversize, 1);
    assert_eq!(report.uploaded, 0);
    let tracked = h.state.file("a.md").unwrap();
    assert_eq!(tracked.last_local_modified_at, Some(500));
    assert!(tracked.remote_revision.is_none());

    assert!(h.pass().await.is_empty());
    assert_eq!(h.remote.upload_calls(), 0);
}

#[tokio::test]
async fn force_upload_resends_unchanged_documents() {
    let h = Harness::new();
    h.synced_document().await;
    let report = h
        .pass_with(PassOptions {
            force_upload: true,
            ..PassOptions::default()
        })
        .await
        .unwrap();
    assert_eq!(report.uploaded, 1);
    assert_eq!(h.remote.upload_calls(), 2);
}

#[tokio::test]
async fn reset_cursor_relists_without_redownloading() {
    let h = Harness::new();
    h.synced_document().await;
    let report = h
        .pass_with(PassOptions {
            reset_cursor: true,
            ..PassOptions::default()
        })
        .await
        .unwrap();
    assert!(report.is_empty());
    assert_eq!(h.remote.list_calls(), 2);
    assert_eq!(h.remote.download_calls(), 0);
    assert!(h.state.cursor().is_some());
}

#[tokio::test]
async fn remote_conflict_copies_are_not_downloaded() {
    let h = Harness::new();
    h.remote.put(
        "/Tagsync/Note (conflict v2 2024-01-01_10-00).md",
        "#shared",
        REMOTE_TIME,
    );
    let report = h.pass().await;
    assert_eq!(report.downloaded, 0);
    assert!(h.vault.paths().is_empty());
}

#[tokio::test]
async fn configuration_error_makes_no_calls() {
    let h = Harness::with_settings(Settings {
        sync_tags: Vec::new(),
        ..settings()
    });
    h.vault.insert("a.md", TAGGED, 500);

    let err = h.pass_with(PassOptions::default()).await.unwrap_err();
    assert!(matches!(err, EngineError::Config(ConfigError::MissingTags)));
    assert_eq!(h.remote.total_calls(), 0);
    assert!(!h.state_path.exists());
}

#[tokio::test]
async fn state_is_persisted_when_push_fails() {
    let h = Harness::new();
    h.remote.put("/Tagsync/n.md", "from remote", REMOTE_TIME);
    h.vault.insert("a.md", TAGGED, 500);
    h.remote.fail_uploads(true);

    let err = h.pass_with(PassOptions::default()).await.unwrap_err();
    assert!(err.is_unreachable());

    let reloaded = SyncStateStore::new(&h.state_path);
    reloaded.initialize().await.unwrap();
    assert!(reloaded.cursor().is_some());
    assert_eq!(
        reloaded.file("n.md").unwrap().remote_revision.as_deref(),
        Some("r1")
    );
    assert!(reloaded.file("a.md").is_none());
}
