use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context;
use tagsync_core::{Credentials, RemoteClient};
use tokio::io::{AsyncBufRead, AsyncBufReadExt, BufReader};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::settings::Settings;
use crate::sync::engine::{SyncEngine, SyncStatus};
use crate::sync::local_watcher::start_notify_watcher;
use crate::sync::reconcile::PassReport;
use crate::sync::remote::RemoteStore;
use crate::sync::state::SyncStateStore;
use crate::sync::tags::MarkdownTagSource;
use crate::sync::vault::{FsVault, LocalVault};

const DEFAULT_VAULT_DIR_NAME: &str = "Notes";

#[derive(Clone, Debug)]
pub struct DaemonConfig {
    pub vault_root: PathBuf,
    pub state_file: PathBuf,
    pub settings_file: PathBuf,
    pub enable_local_watcher: bool,
    /// Static token that replaces the stored credentials for this process.
    pub token_override: Option<String>,
}

impl DaemonConfig {
    pub fn from_env() -> anyhow::Result<Self> {
        let home = dirs::home_dir().context("home directory is unavailable")?;
        let vault_root = read_path_env("TAGSYNC_VAULT_DIR", &home)
            .unwrap_or_else(|| home.join(DEFAULT_VAULT_DIR_NAME));
        let state_file = match read_path_env("TAGSYNC_STATE_FILE", &home) {
            Some(path) => path,
            None => default_state_file()?,
        };
        let settings_file =
            Settings::default_path().context("failed to resolve the settings file")?;
        let enable_local_watcher = read_bool_env("TAGSYNC_ENABLE_LOCAL_WATCHER", true);
        let token_override = std::env::var("TAGSYNC_TOKEN")
            .ok()
            .map(|token| token.trim().to_string())
            .filter(|token| !token.is_empty());

        Ok(Self {
            vault_root,
            state_file,
            settings_file,
            enable_local_watcher,
            token_override,
        })
    }
}

pub struct DaemonRuntime {
    config: DaemonConfig,
    client: Arc<RemoteClient>,
    engine: SyncEngine,
}

impl DaemonRuntime {
    pub async fn bootstrap(config: DaemonConfig) -> anyhow::Result<Self> {
        let settings = load_settings(&config).await?;
        let client = RemoteClient::new(settings.credentials.clone())
            .context("failed to create remote client")?;
        Self::with_client(config, settings, client).await
    }

    /// Wires the engine to an already-built client.
    pub async fn with_client(
        config: DaemonConfig,
        settings: Settings,
        client: RemoteClient,
    ) -> anyhow::Result<Self> {
        tokio::fs::create_dir_all(&config.vault_root)
            .await
            .with_context(|| format!("failed to create vault root at {:?}", config.vault_root))?;

        let client = Arc::new(client);
        let remote: Arc<dyn RemoteStore> = client.clone();
        let vault: Arc<dyn LocalVault> = Arc::new(FsVault::new(&config.vault_root));
        let tags = Arc::new(MarkdownTagSource::new(vault.clone()));
        let state = SyncStateStore::new(&config.state_file);
        let engine = SyncEngine::new(remote, vault, tags, state, settings);

        Ok(Self {
            config,
            client,
            engine,
        })
    }

    pub fn engine(&self) -> &SyncEngine {
        &self.engine
    }

    /// Syncs until Ctrl-C, then drains the engine and persists credentials.
    pub async fn run(self) -> anyhow::Result<()> {
        let settings = self.engine.settings();
        info!(
            vault = %self.config.vault_root.display(),
            remote = %settings.remote_base_path,
            tags = ?settings.sync_tags,
            local_watcher = self.config.enable_local_watcher,
            "tagsyncd started"
        );

        let shutdown = CancellationToken::new();
        let mut handles = Vec::new();

        let watcher = if self.config.enable_local_watcher {
            match start_notify_watcher(&self.config.vault_root) {
                Ok((watcher, mut rx)) => {
                    let engine = self.engine.clone();
                    let shutdown = shutdown.clone();
                    handles.push(tokio::spawn(async move {
                        loop {
                            tokio::select! {
                                _ = shutdown.cancelled() => break,
                                event = rx.recv() => match event {
                                    Some(event) => engine.handle_local_event(event),
                                    None => break,
                                },
                            }
                        }
                    }));
                    Some(watcher)
                }
                Err(err) => {
                    warn!(error = %err, "failed to start local watcher, relying on polling");
                    None
                }
            }
        } else {
            None
        };

        {
            let engine = self.engine.clone();
            let client = Arc::clone(&self.client);
            let config = self.config.clone();
            let shutdown = shutdown.clone();
            let mut status_rx = self.engine.subscribe();
            handles.push(tokio::spawn(async move {
                loop {
                    tokio::select! {
                        _ = shutdown.cancelled() => break,
                        changed = status_rx.changed() => {
                            if changed.is_err() {
                                break;
                            }
                            let status = *status_rx.borrow_and_update();
                            log_status(status, &engine);
                            if status == SyncStatus::UpToDate
                                && let Err(err) = persist_credentials(&config, &client).await
                            {
                                warn!(error = %err, "failed to persist credentials");
                            }
                        }
                    }
                }
            }));
        }

        self.engine.start();
        tokio::signal::ctrl_c()
            .await
            .context("failed waiting for shutdown signal")?;
        info!("shutting down");

        shutdown.cancel();
        self.engine.dispose().await;
        drop(watcher);
        for handle in handles {
            let _ = handle.await;
        }
        persist_credentials(&self.config, &self.client).await
    }

    /// One pass, printed to stdout.
    pub async fn run_once(self) -> anyhow::Result<SyncStatus> {
        let status = self.engine.run_once().await;
        self.engine.dispose().await;
        persist_credentials(&self.config, &self.client).await?;

        println!(
            "{}",
            status_line(status, self.engine.last_error().as_deref())
        );
        if let Some(report) = self.engine.last_report() {
            println!("{}", report_line(&report));
        }
        Ok(status)
    }
}

/// Interactive PKCE authorization. The code is read from stdin.
pub async fn authorize(config: &DaemonConfig) -> anyhow::Result<()> {
    let settings = Settings::load(&config.settings_file)
        .await
        .context("failed to load settings")?;
    let client = RemoteClient::new(settings.credentials.clone())
        .context("failed to create remote client")?;
    let stdin = BufReader::new(tokio::io::stdin());
    authorize_with(config, client, stdin).await
}

pub async fn authorize_with<R>(
    config: &DaemonConfig,
    client: RemoteClient,
    mut input: R,
) -> anyhow::Result<()>
where
    R: AsyncBufRead + Unpin,
{
    let mut settings = Settings::load(&config.settings_file)
        .await
        .context("failed to load settings")?;
    let app_key = std::env::var("TAGSYNC_APP_KEY")
        .ok()
        .filter(|key| !key.trim().is_empty())
        .or_else(|| settings.credentials.app_key.clone())
        .context("TAGSYNC_APP_KEY is not set and no app key is stored")?;

    let url = client
        .begin_authorization(&app_key, None)
        .await
        .context("failed to start authorization")?;
    println!("Open this URL, allow access, then paste the code here:");
    println!("{url}");

    let mut code = String::new();
    input
        .read_line(&mut code)
        .await
        .context("failed to read the authorization code")?;
    if code.trim().is_empty() {
        anyhow::bail!("no authorization code entered");
    }
    client
        .complete_authorization(&code, None)
        .await
        .context("failed to exchange the authorization code")?;

    settings.credentials = client.credentials().await;
    settings
        .save(&config.settings_file)
        .await
        .context("failed to save credentials")?;
    info!("authorization stored");
    Ok(())
}

pub async fn logout(config: &DaemonConfig) -> anyhow::Result<()> {
    let mut settings = Settings::load(&config.settings_file)
        .await
        .context("failed to load settings")?;
    settings.credentials = Credentials::default();
    settings
        .save(&config.settings_file)
        .await
        .context("failed to save settings")?;
    info!("stored credentials removed");
    Ok(())
}

/// Loads settings and saves them back so a generated installation id sticks.
/// `TAGSYNC_TOKEN` replaces the credentials in memory only.
async fn load_settings(config: &DaemonConfig) -> anyhow::Result<Settings> {
    let mut settings = Settings::load(&config.settings_file)
        .await
        .with_context(|| format!("failed to load settings from {:?}", config.settings_file))?;
    settings
        .save(&config.settings_file)
        .await
        .context("failed to save settings")?;
    if let Some(token) = &config.token_override {
        settings.credentials = Credentials::static_token(token.as_str());
    }
    Ok(settings)
}

/// Writes rotated tokens back to the settings file.
async fn persist_credentials(config: &DaemonConfig, client: &RemoteClient) -> anyhow::Result<()> {
    if config.token_override.is_some() {
        return Ok(());
    }
    let credentials = client.credentials().await;
    let mut settings = Settings::load(&config.settings_file)
        .await
        .context("failed to load settings")?;
    if settings.credentials == credentials {
        return Ok(());
    }
    settings.credentials = credentials;
    settings
        .save(&config.settings_file)
        .await
        .context("failed to persist credentials")?;
    debug!("rotated credentials persisted");
    Ok(())
}

fn log_status(status: SyncStatus, engine: &SyncEngine) {
    match status {
        SyncStatus::Error => error!("{}", status_line(status, engine.last_error().as_deref())),
        SyncStatus::Unreachable => warn!("{status}"),
        SyncStatus::UpToDate => match engine.last_report() {
            Some(report) if !report.is_empty() => info!("{status}: {}", report_line(&report)),
            _ => debug!("{status}"),
        },
        _ => debug!("{status}"),
    }
}

include!("daemon_helpers.rs");

#[cfg(test)]
#[path = "daemon_tests.rs"]
mod tests;
