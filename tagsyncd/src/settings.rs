use std::collections::BTreeSet;
use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;

use rand::Rng;
use rand::distributions::Alphanumeric;
use serde::{Deserialize, Serialize};
use tagsync_core::Credentials;
use thiserror::Error;

use crate::sync::conflict::sanitize_installation_id;
use crate::sync::paths::normalize_base_path;
use crate::sync::tags::normalize_tags;

pub const MIN_POLL_INTERVAL_SECS: u64 = 5;
const DEFAULT_POLL_INTERVAL_SECS: u64 = 60;
const DEFAULT_MAX_UPLOAD_BYTES: u64 = 150 * 1024 * 1024;
const DEFAULT_REMOTE_BASE_PATH: &str = "/Tagsync";
const INSTALLATION_ID_LEN: usize = 8;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("no usable remote credentials: authorize first or set TAGSYNC_TOKEN")]
    MissingCredentials,
    #[error("no sync tags configured")]
    MissingTags,
    #[error("remote base path is empty")]
    MissingBasePath,
    #[error("platform config directory is unavailable")]
    MissingConfigDir,
    #[error("settings I/O error: {0}")]
    Io(#[from] io::Error),
    #[error("invalid settings file: {0}")]
    Json(#[from] serde_json::Error),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Settings {
    pub sync_tags: Vec<String>,
    pub ignore_globs: Vec<String>,
    pub remote_base_path: String,
    pub poll_interval_secs: u64,
    pub max_upload_bytes: u64,
    pub installation_id: String,
    pub credentials: Credentials,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            sync_tags: Vec::new(),
            ignore_globs: Vec::new(),
            remote_base_path: DEFAULT_REMOTE_BASE_PATH.to_string(),
            poll_interval_secs: DEFAULT_POLL_INTERVAL_SECS,
            max_upload_bytes: DEFAULT_MAX_UPLOAD_BYTES,
            installation_id: String::new(),
            credentials: Credentials::default(),
        }
    }
}

impl Settings {
    /// Canonical form: normalized unique tags, normalized base path, poll
    /// interval of at least five seconds and a non-empty installation id.
    pub fn normalized(mut self) -> Self {
        self.sync_tags = normalize_tags(&self.sync_tags).into_iter().collect();
        self.ignore_globs.retain(|glob| !glob.trim().is_empty());
        self.remote_base_path = normalize_base_path(&self.remote_base_path);
        self.poll_interval_secs = self.poll_interval_secs.max(MIN_POLL_INTERVAL_SECS);
        self.installation_id = if self.installation_id.trim().is_empty() {
            generate_installation_id()
        } else {
            sanitize_installation_id(&self.installation_id)
        };
        self
    }

    pub fn sync_tag_set(&self) -> BTreeSet<String> {
        normalize_tags(&self.sync_tags)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs.max(MIN_POLL_INTERVAL_SECS))
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if !self.credentials.is_usable() {
            return Err(ConfigError::MissingCredentials);
        }
        if self.sync_tag_set().is_empty() {
            return Err(ConfigError::MissingTags);
        }
        if self.remote_base_path.trim().is_empty() {
            return Err(ConfigError::MissingBasePath);
        }
        Ok(())
    }

    /// `TAGSYNC_SETTINGS`, else `settings.json` in the platform config dir.
    pub fn default_path() -> Result<PathBuf, ConfigError> {
        if let Some(path) = std::env::var_os("TAGSYNC_SETTINGS").filter(|v| !v.is_empty()) {
            return Ok(PathBuf::from(path));
        }
        dirs::config_dir()
            .map(|dir| dir.join("tagsync").join("settings.json"))
            .ok_or(ConfigError::MissingConfigDir)
    }

    /// Missing file yields defaults. The result is always normalized.
    pub async fn load(path: &Path) -> Result<Self, ConfigError> {
        let settings: Settings = match tokio::fs::read(path).await {
            Ok(bytes) => serde_json::from_slice(&bytes)?,
            Err(err) if err.kind() == io::ErrorKind::NotFound => Settings::default(),
            Err(err) => return Err(err.into()),
        };
        Ok(settings.normalized())
    }

    pub async fn save(&self, path: &Path) -> Result<(), ConfigError> {
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let json = serde_json::to_vec_pretty(self)?;
        let partial = path.with_extension("json.partial");
        tokio::fs::write(&partial, json).await?;
        tokio::fs::rename(&partial, path).await?;
        Ok(())
    }
}

fn generate_installation_id() -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(INSTALLATION_ID_LEN)
        .map(|byte| char::from(byte).to_ascii_lowercase())
        .collect()
}
