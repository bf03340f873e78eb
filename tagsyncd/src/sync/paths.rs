use std::sync::LazyLock;

use regex::Regex;

const DOCUMENT_EXTENSION: &str = "md";

static CONFLICT_SUFFIX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r" \(conflict [A-Za-z0-9_-]+ \d{4}-\d{2}-\d{2}_\d{2}-\d{2}\)(?: \d+)?(?:\.[^./]*)?$")
        .expect("conflict suffix pattern is valid")
});

/// Remote base paths always start with `/` and never end with one; `/` alone
/// is the root. Blank input stays blank so validation can reject it.
pub fn normalize_base_path(raw: &str) -> String {
    let trimmed = raw.trim().replace('\\', "/");
    if trimmed.is_empty() {
        return String::new();
    }
    let segments: Vec<&str> = trimmed.split('/').filter(|s| !s.is_empty()).collect();
    if segments.is_empty() {
        return "/".to_string();
    }
    format!("/{}", segments.join("/"))
}

/// Maps a vault-relative path (`Notes/a.md`) to its remote location.
pub fn to_remote(base: &str, local: &str) -> String {
    let local = local.trim_start_matches('/');
    if base == "/" || base.is_empty() {
        format!("/{local}")
    } else {
        format!("{base}/{local}")
    }
}

/// Maps a remote path back to a vault-relative one. Paths outside `base`, the
/// base itself and anything with `.` or `..` segments yield `None`. The
/// prefix comparison is case-insensitive like the remote namespace.
pub fn to_local(base: &str, remote: &str) -> Option<String> {
    let relative = if base == "/" || base.is_empty() {
        remote.strip_prefix('/')?
    } else {
        let head = remote.get(..base.len())?;
        if head.to_lowercase() != base.to_lowercase() {
            return None;
        }
        remote[base.len()..].strip_prefix('/')?
    };
    if relative.is_empty() {
        return None;
    }
    if relative
        .split('/')
        .any(|segment| segment.is_empty() || segment == "." || segment == "..")
    {
        return None;
    }
    Some(relative.to_string())
}

pub fn is_document(path: &str) -> bool {
    file_name(path)
        .rsplit_once('.')
        .is_some_and(|(stem, ext)| !stem.is_empty() && ext.eq_ignore_ascii_case(DOCUMENT_EXTENSION))
}

/// Recognizes conflict copies by their name suffix alone, wherever they live.
pub fn is_conflict_copy(path: &str) -> bool {
    CONFLICT_SUFFIX.is_match(file_name(path))
}

/// True when any segment is a dot-file or dot-directory.
pub fn is_hidden(path: &str) -> bool {
    path.split('/').any(|segment| segment.starts_with('.'))
}

pub fn file_name(path: &str) -> &str {
    path.rsplit_once('/').map_or(path, |(_, name)| name)
}
