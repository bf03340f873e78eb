use std::path::{Component, Path};

use notify::event::{ModifyKind, RenameMode};
use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use tokio::sync::mpsc;

/// A change notification for a vault-relative, `/`-separated path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LocalEvent {
    Create { path: String },
    Modify { path: String },
    Delete { path: String },
    Rename { from: String, to: String },
}

impl LocalEvent {
    pub fn paths(&self) -> Vec<&str> {
        match self {
            LocalEvent::Create { path } | LocalEvent::Modify { path } | LocalEvent::Delete { path } => {
                vec![path.as_str()]
            }
            LocalEvent::Rename { from, to } => vec![from.as_str(), to.as_str()],
        }
    }
}

/// Watches `root` recursively. Dropping the watcher stops the stream.
pub fn start_notify_watcher(
    root: &Path,
) -> notify::Result<(RecommendedWatcher, mpsc::UnboundedReceiver<LocalEvent>)> {
    let (tx, rx) = mpsc::unbounded_channel();
    let root = root.to_path_buf();
    let watch_root = root.clone();
    let mut watcher = notify::recommended_watcher(move |res: notify::Result<Event>| match res {
        Ok(event) => {
            for local in map_event(&watch_root, event) {
                let _ = tx.send(local);
            }
        }
        Err(err) => tracing::warn!(error = %err, "file watcher error"),
    })?;
    watcher.watch(root.as_path(), RecursiveMode::Recursive)?;
    Ok((watcher, rx))
}

fn map_event(root: &Path, event: Event) -> Vec<LocalEvent> {
    let relative = |paths: Vec<std::path::PathBuf>| -> Vec<String> {
        paths
            .iter()
            .filter_map(|path| to_vault_path(root, path))
            .collect()
    };
    match event.kind {
        EventKind::Modify(ModifyKind::Name(mode)) => {
            let mut paths = relative(event.paths);
            match (mode, paths.len()) {
                (RenameMode::Both, 2) | (RenameMode::Any, 2) => {
                    let to = paths.pop().unwrap_or_default();
                    let from = paths.pop().unwrap_or_default();
                    vec![LocalEvent::Rename { from, to }]
                }
                (RenameMode::From, _) => paths
                    .into_iter()
                    .map(|path| LocalEvent::Delete { path })
                    .collect(),
                _ => paths
                    .into_iter()
                    .map(|path| LocalEvent::Create { path })
                    .collect(),
            }
        }
        EventKind::Create(_) => relative(event.paths)
            .into_iter()
            .map(|path| LocalEvent::Create { path })
            .collect(),
        EventKind::Modify(_) => relative(event.paths)
            .into_iter()
            .map(|path| LocalEvent::Modify { path })
            .collect(),
        EventKind::Remove(_) => relative(event.paths)
            .into_iter()
            .map(|path| LocalEvent::Delete { path })
            .collect(),
        _ => Vec::new(),
    }
}

fn to_vault_path(root: &Path, path: &Path) -> Option<String> {
    let relative = path.strip_prefix(root).ok()?;
    let mut segments = Vec::new();
    for component in relative.components() {
        match component {
            Component::Normal(segment) => segments.push(segment.to_string_lossy().into_owned()),
            _ => return None,
        }
    }
    if segments.is_empty() {
        None
    } else {
        Some(segments.join("/"))
    }
}
