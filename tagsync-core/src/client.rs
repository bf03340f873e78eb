use std::sync::Arc;
use std::time::{Duration, SystemTime};

use reqwest::header::{HeaderMap, RETRY_AFTER};
use reqwest::{Client, RequestBuilder, Response, StatusCode};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::json;
use time::OffsetDateTime;
use time::format_description::well_known::Rfc3339;
use tokio::sync::Mutex;
use tracing::{debug, warn};
use url::Url;

use crate::error::RemoteError;
use crate::oauth::OAuthClient;
use crate::retry::{RetryPolicy, StatusClass, classify_status};
use crate::token::{Credentials, TokenProvider};

const DEFAULT_API_BASE_URL: &str = "https://api.dropboxapi.com";
const DEFAULT_CONTENT_BASE_URL: &str = "https://content.dropboxapi.com";
const DEFAULT_AUTHORIZE_BASE_URL: &str = "https://www.dropbox.com";
const API_ARG_HEADER: &str = "Dropbox-API-Arg";
const API_RESULT_HEADER: &str = "Dropbox-API-Result";

#[derive(Clone)]
pub struct RemoteClient {
    http: Client,
    api_base: Url,
    content_base: Url,
    policy: RetryPolicy,
    tokens: Arc<Mutex<TokenProvider>>,
}

impl RemoteClient {
    pub fn new(credentials: Credentials) -> Result<Self, RemoteError> {
        Self::with_base_urls(
            DEFAULT_API_BASE_URL,
            DEFAULT_CONTENT_BASE_URL,
            DEFAULT_AUTHORIZE_BASE_URL,
            credentials,
        )
    }

    pub fn with_base_urls(
        api_base: &str,
        content_base: &str,
        authorize_base: &str,
        credentials: Credentials,
    ) -> Result<Self, RemoteError> {
        let oauth = OAuthClient::with_base_urls(authorize_base, api_base)?;
        Ok(Self {
            http: Client::new(),
            api_base: Url::parse(api_base)?,
            content_base: Url::parse(content_base)?,
            policy: RetryPolicy::default(),
            tokens: Arc::new(Mutex::new(TokenProvider::new(credentials, oauth))),
        })
    }

    /// Applies to data calls and to token exchange/refresh alike.
    pub fn with_retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.policy = policy;
        if let Some(tokens) = Arc::get_mut(&mut self.tokens) {
            tokens.get_mut().set_retry_policy(policy);
        }
        self
    }

    /// Snapshot of the current credentials, including any rotated tokens.
    pub async fn credentials(&self) -> Credentials {
        self.tokens.lock().await.credentials().clone()
    }

    pub async fn begin_authorization(
        &self,
        app_key: &str,
        redirect_uri: Option<&str>,
    ) -> Result<Url, RemoteError> {
        self.tokens
            .lock()
            .await
            .begin_authorization(app_key, redirect_uri)
    }

    pub async fn complete_authorization(
        &self,
        code: &str,
        redirect_uri: Option<&str>,
    ) -> Result<(), RemoteError> {
        self.tokens
            .lock()
            .await
            .complete_authorization(code, redirect_uri)
            .await
    }

    pub async fn upload(&self, path: &str, bytes: &[u8]) -> Result<FileMetadata, RemoteError> {
        let url = self.content_endpoint("/2/files/upload")?;
        let arg = header_safe_json(&json!({
            "path": path,
            "mode": "overwrite",
            "autorename": false,
            "mute": true,
        }));
        let response = self
            .send_authorized(|token| {
                self.http
                    .post(url.clone())
                    .bearer_auth(token)
                    .header(API_ARG_HEADER, arg.as_str())
                    .header("Content-Type", "application/octet-stream")
                    .body(bytes.to_vec())
            })
            .await?;
        let metadata: FileMetadata = read_json(response).await?;
        debug!(path, rev = %metadata.rev, "uploaded");
        Ok(metadata)
    }

    pub async fn download(&self, path: &str) -> Result<Download, RemoteError> {
        let url = self.content_endpoint("/2/files/download")?;
        let arg = header_safe_json(&json!({ "path": path }));
        let response = self
            .send_authorized(|token| {
                self.http
                    .post(url.clone())
                    .bearer_auth(token)
                    .header(API_ARG_HEADER, arg.as_str())
            })
            .await?;
        let response = ensure_success(response).await?;
        let metadata = response
            .headers()
            .get(API_RESULT_HEADER)
            .ok_or(RemoteError::MissingHeader(API_RESULT_HEADER))?;
        let metadata: FileMetadata = serde_json::from_slice(metadata.as_bytes())?;
        let bytes = response.bytes().await?.to_vec();
        Ok(Download { metadata, bytes })
    }

    /// Returns `false` when the path was already absent.
    pub async fn delete(&self, path: &str) -> Result<bool, RemoteError> {
        let url = self.api_endpoint("/2/files/delete_v2")?;
        let body = json!({ "path": path });
        let response = self
            .send_authorized(|token| self.http.post(url.clone()).bearer_auth(token).json(&body))
            .await?;
        match ensure_success(response).await {
            Ok(_) => Ok(true),
            Err(err) if err.is_not_found() => {
                debug!(path, "delete target already absent");
                Ok(false)
            }
            Err(err) => Err(err),
        }
    }

    /// Drains every page of changes under `base_path` since `cursor`. A cursor
    /// invalidated on any page, the first or a later one, is replaced by a
    /// fresh full listing; pages already read are discarded.
    pub async fn list_delta(
        &self,
        base_path: &str,
        cursor: Option<&str>,
    ) -> Result<Delta, RemoteError> {
        if let Some(cursor) = cursor {
            let resumed = match self.list_continue(cursor).await {
                Ok(page) => self.drain(page).await,
                Err(err) => Err(err),
            };
            match resumed {
                Ok(delta) => return Ok(delta),
                Err(err) if err.is_cursor_reset() => {
                    warn!("remote cursor was reset, starting a full listing");
                }
                Err(err) => return Err(err),
            }
        }
        let first = self.list_folder(base_path).await?;
        match self.drain(first).await {
            Err(err) if err.is_cursor_reset() => {
                warn!("cursor reset while paging a full listing, starting over");
                let first = self.list_folder(base_path).await?;
                self.drain(first).await
            }
            drained => drained,
        }
    }

    async fn drain(&self, first: ListFolderPage) -> Result<Delta, RemoteError> {
        let mut entries = first.entries;
        let mut cursor = first.cursor;
        let mut has_more = first.has_more;
        while has_more {
            let page = self.list_continue(&cursor).await?;
            entries.extend(page.entries);
            cursor = page.cursor;
            has_more = page.has_more;
        }
        Ok(Delta { entries, cursor })
    }

    async fn list_folder(&self, base_path: &str) -> Result<ListFolderPage, RemoteError> {
        let url = self.api_endpoint("/2/files/list_folder")?;
        let path = if base_path == "/" { "" } else { base_path };
        let body = json!({
            "path": path,
            "recursive": true,
            "include_deleted": true,
        });
        let response = self
            .send_authorized(|token| self.http.post(url.clone()).bearer_auth(token).json(&body))
            .await?;
        read_json(response).await
    }

    async fn list_continue(&self, cursor: &str) -> Result<ListFolderPage, RemoteError> {
        let url = self.api_endpoint("/2/files/list_folder/continue")?;
        let body = json!({ "cursor": cursor });
        let response = self
            .send_authorized(|token| self.http.post(url.clone()).bearer_auth(token).json(&body))
            .await?;
        read_json(response).await
    }

    /// One retried request, plus at most one token refresh and replay when a
    /// refreshable credential is rejected with 401.
    async fn send_authorized<F>(&self, build: F) -> Result<Response, RemoteError>
    where
        F: Fn(&str) -> RequestBuilder,
    {
        let mut token = self.tokens.lock().await.valid_access_token().await?;
        let mut refreshed = false;
        loop {
            let response = send_with_retry(&self.policy, || build(&token)).await?;
            if response.status() == StatusCode::UNAUTHORIZED && !refreshed {
                let mut tokens = self.tokens.lock().await;
                if tokens.credentials().is_refreshable() {
                    debug!("access token rejected, refreshing once");
                    token = tokens.refresh_now().await?;
                    refreshed = true;
                    continue;
                }
            }
            return Ok(response);
        }
    }

    fn api_endpoint(&self, path: &str) -> Result<Url, RemoteError> {
        Ok(self.api_base.join(path)?)
    }

    fn content_endpoint(&self, path: &str) -> Result<Url, RemoteError> {
        Ok(self.content_base.join(path)?)
    }
}

/// Sends the request built by `build`, retrying network failures, 429 and
/// 5xx with backoff. Every other response is returned to the caller as is.
pub(crate) async fn send_with_retry<F>(
    policy: &RetryPolicy,
    mut build: F,
) -> Result<Response, RemoteError>
where
    F: FnMut() -> RequestBuilder,
{
    let mut attempt = 0u32;
    loop {
        let delay = match build().send().await {
            Err(err) if err.is_builder() => return Err(err.into()),
            Err(err) => {
                if policy.is_last_attempt(attempt) {
                    warn!(attempts = attempt + 1, error = %err, "remote unreachable");
                    return Err(RemoteError::Unreachable);
                }
                let delay = policy.backoff.delay(attempt);
                warn!(attempt, ?delay, error = %err, "network failure, retrying");
                delay
            }
            Ok(response) => match classify_status(response.status()) {
                StatusClass::RateLimited | StatusClass::Transient => {
                    let status = response.status();
                    let hinted = retry_after_header(response.headers());
                    let body = response.text().await.unwrap_or_default();
                    if policy.is_last_attempt(attempt) {
                        warn!(attempts = attempt + 1, %status, "remote kept failing");
                        if status.is_server_error() {
                            return Err(RemoteError::Unreachable);
                        }
                        return Err(RemoteError::Api { status, body });
                    }
                    let delay = hinted
                        .or_else(|| retry_after_body(&body))
                        .unwrap_or_else(|| policy.backoff.delay(attempt));
                    warn!(attempt, %status, ?delay, "transient status, retrying");
                    delay
                }
                _ => return Ok(response),
            },
        };
        tokio::time::sleep(delay).await;
        attempt += 1;
    }
}

pub(crate) async fn read_json<T: DeserializeOwned>(response: Response) -> Result<T, RemoteError> {
    let response = ensure_success(response).await?;
    let bytes = response.bytes().await?;
    Ok(serde_json::from_slice(&bytes)?)
}

async fn ensure_success(response: Response) -> Result<Response, RemoteError> {
    if response.status().is_success() {
        Ok(response)
    } else {
        let status = response.status();
        let body = response.text().await.unwrap_or_default();
        Err(RemoteError::Api { status, body })
    }
}

fn retry_after_header(headers: &HeaderMap) -> Option<Duration> {
    let value = headers.get(RETRY_AFTER)?.to_str().ok()?.trim();
    if let Ok(secs) = value.parse::<u64>() {
        return Some(Duration::from_secs(secs));
    }
    let at = httpdate::parse_http_date(value).ok()?;
    Some(at.duration_since(SystemTime::now()).unwrap_or_default())
}

fn retry_after_body(body: &str) -> Option<Duration> {
    let value: serde_json::Value = serde_json::from_str(body).ok()?;
    let secs = value.pointer("/error/retry_after")?.as_u64()?;
    Some(Duration::from_secs(secs))
}

/// HTTP header values must stay 7-bit clean, so non-ASCII characters in the
/// JSON argument are written as `\uXXXX` escapes.
fn header_safe_json(value: &serde_json::Value) -> String {
    let raw = value.to_string();
    let mut out = String::with_capacity(raw.len());
    for ch in raw.chars() {
        if ch.is_ascii() {
            out.push(ch);
        } else {
            let mut units = [0u16; 2];
            for unit in ch.encode_utf16(&mut units) {
                out.push_str(&format!("\\u{unit:04x}"));
            }
        }
    }
    out
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct FileMetadata {
    pub name: String,
    pub path_display: String,
    #[serde(default)]
    pub path_lower: Option<String>,
    pub rev: String,
    pub server_modified: String,
    #[serde(default)]
    pub size: u64,
    #[serde(default)]
    pub content_hash: Option<String>,
}

impl FileMetadata {
    /// Server modification time in milliseconds since the Unix epoch.
    pub fn server_modified_ms(&self) -> Option<i64> {
        parse_rfc3339_ms(&self.server_modified)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct FolderMetadata {
    pub name: String,
    pub path_display: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct DeletedMetadata {
    pub name: String,
    pub path_display: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(tag = ".tag", rename_all = "lowercase")]
pub enum RemoteEntry {
    File(FileMetadata),
    Folder(FolderMetadata),
    Deleted(DeletedMetadata),
}

impl RemoteEntry {
    pub fn path_display(&self) -> &str {
        match self {
            RemoteEntry::File(meta) => &meta.path_display,
            RemoteEntry::Folder(meta) => &meta.path_display,
            RemoteEntry::Deleted(meta) => &meta.path_display,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delta {
    pub entries: Vec<RemoteEntry>,
    pub cursor: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Download {
    pub metadata: FileMetadata,
    pub bytes: Vec<u8>,
}

#[derive(Debug, Deserialize)]
struct ListFolderPage {
    entries: Vec<RemoteEntry>,
    cursor: String,
    has_more: bool,
}

pub fn parse_rfc3339_ms(value: &str) -> Option<i64> {
    let parsed = OffsetDateTime::parse(value, &Rfc3339).ok()?;
    i64::try_from(parsed.unix_timestamp_nanos() / 1_000_000).ok()
}
