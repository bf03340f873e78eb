use std::collections::BTreeSet;
use std::sync::{Arc, LazyLock};

use async_trait::async_trait;
use regex::{Captures, Regex};
use serde_yaml::Value;
use tracing::debug;

use super::vault::{LocalVault, VaultError};

static INLINE_TAG: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(^|\s)#([\p{L}\p{N}_/\-]+)").expect("inline tag pattern is valid"));

/// Trims, drops leading `#` and lower-cases. Idempotent.
pub fn normalize_tag(raw: &str) -> String {
    raw.trim().trim_start_matches('#').trim().to_lowercase()
}

pub fn normalize_tags<I, S>(raw: I) -> BTreeSet<String>
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    raw.into_iter()
        .map(|tag| normalize_tag(tag.as_ref()))
        .filter(|tag| !tag.is_empty())
        .collect()
}

/// Supplies the raw tags of a document.
#[async_trait]
pub trait TagSource: Send + Sync {
    async fn tags(&self, path: &str) -> Result<Vec<String>, VaultError>;
}

/// Reads tags straight from markdown: front-matter `tags`/`tag` keys plus
/// inline `#tag` occurrences in the body.
pub struct MarkdownTagSource {
    vault: Arc<dyn LocalVault>,
}

impl MarkdownTagSource {
    pub fn new(vault: Arc<dyn LocalVault>) -> Self {
        Self { vault }
    }
}

#[async_trait]
impl TagSource for MarkdownTagSource {
    async fn tags(&self, path: &str) -> Result<Vec<String>, VaultError> {
        let bytes = self.vault.read(path).await?;
        Ok(extract_tags(&String::from_utf8_lossy(&bytes)))
    }
}

pub fn extract_tags(content: &str) -> Vec<String> {
    let lines: Vec<&str> = content.split_inclusive('\n').collect();
    let mut tags = Vec::new();
    let body_start = match front_matter_end(&lines) {
        Some(end) => {
            let yaml: String = lines[1..end].concat();
            tags.extend(front_matter_tags(&yaml));
            end + 1
        }
        None => 0,
    };
    let body: String = lines[body_start..].concat();
    tags.extend(
        INLINE_TAG
            .captures_iter(&body)
            .map(|caps| caps[2].to_string())
            .filter(|tag| !tag.chars().all(|c| c.is_ascii_digit())),
    );
    tags
}

fn front_matter_tags(yaml: &str) -> Vec<String> {
    let value: Value = match serde_yaml::from_str(yaml) {
        Ok(value) => value,
        Err(err) => {
            debug!(error = %err, "skipping unparseable front matter");
            return Vec::new();
        }
    };
    let Value::Mapping(map) = value else {
        return Vec::new();
    };
    let mut tags = Vec::new();
    for (key, value) in &map {
        let Some(key) = key.as_str() else { continue };
        if !is_tag_key(key) {
            continue;
        }
        match value {
            Value::String(list) => tags.extend(split_scalar_list(list).map(str::to_string)),
            Value::Sequence(items) => {
                for item in items {
                    match item {
                        Value::String(tag) => tags.push(tag.clone()),
                        Value::Number(number) => tags.push(number.to_string()),
                        _ => {}
                    }
                }
            }
            _ => {}
        }
    }
    tags
}

fn is_tag_key(key: &str) -> bool {
    key.eq_ignore_ascii_case("tags") || key.eq_ignore_ascii_case("tag")
}

fn split_scalar_list(value: &str) -> impl Iterator<Item = &str> {
    value
        .split(|c: char| c == ',' || c.is_whitespace())
        .map(str::trim)
        .filter(|tag| !tag.is_empty())
}

/// Removes every sync tag from `content` so a copy of it can never re-enter
/// the sync scope. Other tags and formatting are preserved.
pub fn strip_sync_tags(content: &str, sync_tags: &BTreeSet<String>) -> String {
    let is_sync = |raw: &str| sync_tags.contains(&normalize_tag(trim_quotes(raw)));
    let lines: Vec<&str> = content.split_inclusive('\n').collect();
    let mut out = String::with_capacity(content.len());
    let mut body_start = 0;
    if let Some(end) = front_matter_end(&lines) {
        out.push_str(lines[0]);
        strip_front_matter(&lines[1..end], &is_sync, &mut out);
        out.push_str(lines[end]);
        body_start = end + 1;
    }
    for line in &lines[body_start..] {
        let (text, ending) = split_ending(line);
        let replaced = INLINE_TAG.replace_all(text, |caps: &Captures| {
            if is_sync(&caps[2]) {
                caps[1].to_string()
            } else {
                caps[0].to_string()
            }
        });
        if replaced == text {
            out.push_str(line);
        } else {
            out.push_str(replaced.trim_end());
            out.push_str(ending);
        }
    }
    out
}

fn strip_front_matter(lines: &[&str], is_sync: &dyn Fn(&str) -> bool, out: &mut String) {
    let mut i = 0;
    while i < lines.len() {
        let line = lines[i];
        let Some((key, value)) = tag_key_line(line) else {
            out.push_str(line);
            i += 1;
            continue;
        };
        let (_, ending) = split_ending(line);
        let value = value.trim();

        if value.is_empty() {
            let mut next = i + 1;
            let mut kept = Vec::new();
            while next < lines.len() {
                let Some(item) = block_item(lines[next]) else { break };
                if !is_sync(item) {
                    kept.push(lines[next]);
                }
                next += 1;
            }
            if !kept.is_empty() {
                out.push_str(line);
                kept.iter().for_each(|kept_line| out.push_str(kept_line));
            }
            i = next;
            continue;
        }

        if value.starts_with('[') && !value.ends_with(']') {
            let Some(close) = flow_list_end(lines, i) else {
                out.push_str(line);
                i += 1;
                continue;
            };
            let block = &lines[i..=close];
            match strip_flow_list(key, block, is_sync) {
                Some(rewritten) => out.push_str(&rewritten),
                None => block.iter().for_each(|block_line| out.push_str(block_line)),
            }
            i = close + 1;
            continue;
        }

        let (items, open, close, separator): (Vec<&str>, String, String, &str) =
            if let Some(inner) = value.strip_prefix('[').and_then(|v| v.strip_suffix(']')) {
                (split_list(inner, ','), "[".into(), "]".into(), ", ")
            } else {
                // A quoted scalar keeps its quotes around whatever is left.
                let (inner, quote) = unquote_scalar(value);
                let quote = quote.map(String::from).unwrap_or_default();
                if inner.contains(',') {
                    (split_list(inner, ','), quote.clone(), quote, ", ")
                } else {
                    (inner.split_whitespace().collect(), quote.clone(), quote, " ")
                }
            };
        let kept: Vec<&str> = items.iter().copied().filter(|item| !is_sync(item)).collect();
        if kept.len() == items.len() {
            out.push_str(line);
        } else if !kept.is_empty() {
            out.push_str(&format!("{key}: {open}{}{close}{ending}", kept.join(separator)));
        }
        i += 1;
    }
}

/// Line closing a flow list opened on `start` but not closed there. A new
/// top-level key before the `]` means the list is malformed.
fn flow_list_end(lines: &[&str], start: usize) -> Option<usize> {
    for (index, line) in lines.iter().enumerate().skip(start + 1) {
        if line.trim_end().ends_with(']') {
            return Some(index);
        }
        if !line.starts_with(char::is_whitespace) && line.contains(':') {
            return None;
        }
    }
    None
}

/// Re-emits a multi-line flow list on one line without the sync tags.
/// `None` leaves the lines untouched when the value does not parse as a list.
fn strip_flow_list(key: &str, block: &[&str], is_sync: &dyn Fn(&str) -> bool) -> Option<String> {
    let (_, first) = block.first()?.split_once(':')?;
    let mut text = first.to_string();
    block[1..].iter().for_each(|line| text.push_str(line));
    let Value::Sequence(items) = serde_yaml::from_str::<Value>(text.trim()).ok()? else {
        return None;
    };
    let kept: Vec<&Value> = items
        .iter()
        .filter(|item| match item {
            Value::String(tag) => !is_sync(tag.as_str()),
            Value::Number(number) => !is_sync(&number.to_string()),
            _ => true,
        })
        .collect();
    if kept.len() == items.len() {
        return Some(block.concat());
    }
    if kept.is_empty() {
        return Some(String::new());
    }
    let rendered = kept
        .into_iter()
        .map(render_flow_item)
        .collect::<Option<Vec<_>>>()?;
    let (_, ending) = split_ending(block[block.len() - 1]);
    Some(format!("{key}: [{}]{ending}", rendered.join(", ")))
}

/// Plain tags stay bare; anything else is written as JSON, which YAML reads
/// back as the same flow value.
fn render_flow_item(item: &Value) -> Option<String> {
    match item {
        Value::String(tag)
            if !tag.is_empty()
                && tag
                    .chars()
                    .all(|c| c.is_alphanumeric() || matches!(c, '_' | '-' | '/')) =>
        {
            Some(tag.clone())
        }
        _ => serde_json::to_string(item).ok(),
    }
}

fn unquote_scalar(value: &str) -> (&str, Option<char>) {
    for quote in ['"', '\''] {
        if value.len() >= 2 && value.starts_with(quote) && value.ends_with(quote) {
            return (&value[1..value.len() - 1], Some(quote));
        }
    }
    (value, None)
}

fn split_list(value: &str, separator: char) -> Vec<&str> {
    value
        .split(separator)
        .map(str::trim)
        .filter(|item| !item.is_empty())
        .collect()
}

/// A top-level `tags:`/`tag:` line, split into key and raw value.
fn tag_key_line(line: &str) -> Option<(&str, &str)> {
    if line.starts_with(char::is_whitespace) {
        return None;
    }
    let (key, value) = line.split_once(':')?;
    let key = key.trim_end();
    is_tag_key(trim_quotes(key)).then_some((key, value))
}

fn block_item(line: &str) -> Option<&str> {
    let rest = line.trim_start().strip_prefix('-')?;
    if !rest.is_empty() && !rest.starts_with(char::is_whitespace) {
        return None;
    }
    Some(rest.trim())
}

fn trim_quotes(value: &str) -> &str {
    value.trim().trim_matches(|c| c == '"' || c == '\'')
}

fn split_ending(line: &str) -> (&str, &str) {
    if let Some(text) = line.strip_suffix("\r\n") {
        (text, "\r\n")
    } else if let Some(text) = line.strip_suffix('\n') {
        (text, "\n")
    } else {
        (line, "")
    }
}

/// Index of the line closing a leading `---` block.
fn front_matter_end(lines: &[&str]) -> Option<usize> {
    let first = lines.first()?.trim_start_matches('\u{feff}');
    if first.trim_end() != "---" {
        return None;
    }
    lines
        .iter()
        .enumerate()
        .skip(1)
        .find(|(_, line)| matches!(line.trim_end(), "---" | "..."))
        .map(|(index, _)| index)
}
