use time::OffsetDateTime;

use super::state::FileSyncState;
use super::vault::{FileStat, LocalVault, VaultError};

const FALLBACK_INSTALLATION_ID: &str = "device";

/// What to do with a file the remote reports as present.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RemoteChange {
    AlreadyApplied,
    Create,
    Overwrite,
    /// Both sides changed since the last sync; contents decide.
    Diverged,
}

/// What to do with a file the remote reports as deleted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RemoteDeletion {
    Forget,
    DeleteLocal,
    /// Edited locally since the last sync. A remote delete never wins.
    KeepLocal,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Winner {
    Local,
    Remote,
}

pub fn changed_locally(tracked: Option<&FileSyncState>, local: FileStat) -> bool {
    tracked.and_then(|state| state.last_local_modified_at) != Some(local.modified_ms)
}

pub fn classify_remote_change(
    tracked: Option<&FileSyncState>,
    remote_revision: &str,
    local: Option<FileStat>,
) -> RemoteChange {
    if tracked.and_then(|state| state.remote_revision.as_deref()) == Some(remote_revision) {
        return RemoteChange::AlreadyApplied;
    }
    match local {
        None => RemoteChange::Create,
        Some(local) if changed_locally(tracked, local) => RemoteChange::Diverged,
        Some(_) => RemoteChange::Overwrite,
    }
}

pub fn classify_remote_deletion(
    tracked: Option<&FileSyncState>,
    local: Option<FileStat>,
) -> RemoteDeletion {
    let Some(tracked) = tracked.filter(|state| state.remote_revision.is_some()) else {
        return RemoteDeletion::Forget;
    };
    match local {
        None => RemoteDeletion::Forget,
        Some(local) if changed_locally(Some(tracked), local) => RemoteDeletion::KeepLocal,
        Some(_) => RemoteDeletion::DeleteLocal,
    }
}

/// Later modification wins; ties and unknown remote times keep local.
pub fn pick_winner(local_modified_ms: i64, remote_modified_ms: Option<i64>) -> Winner {
    match remote_modified_ms {
        Some(remote) if remote > local_modified_ms => Winner::Remote,
        _ => Winner::Local,
    }
}

pub fn sanitize_installation_id(raw: &str) -> String {
    let cleaned: String = raw
        .chars()
        .filter(|c| c.is_ascii_alphanumeric() || *c == '-' || *c == '_')
        .collect();
    if cleaned.is_empty() {
        FALLBACK_INSTALLATION_ID.to_string()
    } else {
        cleaned
    }
}

/// `Dir/Note (conflict <id> <YYYY-MM-DD_HH-MM>).md`, with ` 2`, ` 3`, ...
/// appended after the marker for later attempts.
pub fn conflict_copy_path(
    path: &str,
    installation_id: &str,
    at: OffsetDateTime,
    attempt: u32,
) -> String {
    let (dir, name) = match path.rsplit_once('/') {
        Some((dir, name)) => (format!("{dir}/"), name),
        None => (String::new(), path),
    };
    let marker = format!(
        "(conflict {} {:04}-{:02}-{:02}_{:02}-{:02})",
        sanitize_installation_id(installation_id),
        at.year(),
        u8::from(at.month()),
        at.day(),
        at.hour(),
        at.minute()
    );
    let counter = if attempt == 0 {
        String::new()
    } else {
        format!(" {}", attempt + 1)
    };

    if let Some((stem, ext)) = name.rsplit_once('.')
        && !stem.is_empty()
    {
        return format!("{dir}{stem} {marker}{counter}.{ext}");
    }

    format!("{dir}{name} {marker}{counter}")
}

/// First conflict-copy name not already taken in the vault.
pub async fn free_conflict_copy_path(
    vault: &dyn LocalVault,
    path: &str,
    installation_id: &str,
    at: OffsetDateTime,
) -> Result<String, VaultError> {
    let mut attempt = 0;
    loop {
        let candidate = conflict_copy_path(path, installation_id, at, attempt);
        if vault.stat(&candidate).await?.is_none() {
            return Ok(candidate);
        }
        attempt += 1;
    }
}
