use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock, RwLockReadGuard, Weak};
use std::time::Duration;

use tagsync_core::RemoteError;
use thiserror::Error;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use super::echo::EchoGuard;
use super::local_watcher::LocalEvent;
use super::paths::is_hidden;
use super::reconcile::{Pass, PassOptions, PassReport};
use super::remote::RemoteStore;
use super::scope::{ScopeError, ScopeIndex};
use super::state::{StateError, SyncStateStore};
use super::tags::TagSource;
use super::vault::{LocalVault, VaultError};
use crate::settings::{ConfigError, Settings};

/// Quiet period that coalesces bursts of local change notifications.
pub const DEBOUNCE: Duration = Duration::from_millis(750);

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("remote error: {0}")]
    Remote(#[from] RemoteError),
    #[error("vault error: {0}")]
    Vault(#[from] VaultError),
    #[error("state error: {0}")]
    State(#[from] StateError),
    #[error("scope error: {0}")]
    Scope(#[from] ScopeError),
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),
}

impl EngineError {
    pub fn is_unreachable(&self) -> bool {
        matches!(self, EngineError::Remote(err) if err.is_unreachable())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncStatus {
    Idle,
    Syncing,
    Paused,
    UpToDate,
    Error,
    Unreachable,
}

impl fmt::Display for SyncStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            SyncStatus::Idle => "Idle",
            SyncStatus::Syncing => "Syncing...",
            SyncStatus::Paused => "Paused",
            SyncStatus::UpToDate => "Up to date",
            SyncStatus::Error => "Error",
            SyncStatus::Unreachable => "Can't reach remote",
        })
    }
}

#[derive(Default)]
struct Control {
    running: bool,
    rerun: bool,
    paused: bool,
    disposed: bool,
    pending: PassOptions,
    run: Option<JoinHandle<()>>,
    debounce: Option<JoinHandle<()>>,
    poll: Option<JoinHandle<()>>,
}

struct EngineInner {
    remote: Arc<dyn RemoteStore>,
    vault: Arc<dyn LocalVault>,
    scope: ScopeIndex,
    state: SyncStateStore,
    echo: EchoGuard,
    settings: RwLock<Settings>,
    /// Held only across flag transitions, never across a pass.
    control: Mutex<Control>,
    status: watch::Sender<SyncStatus>,
    busy: watch::Sender<bool>,
    last_report: Mutex<Option<PassReport>>,
    last_error: Mutex<Option<String>>,
}

/// Runs reconciliation passes one at a time. Triggers that arrive during a
/// pass are folded into a single follow-up pass.
#[derive(Clone)]
pub struct SyncEngine {
    inner: Arc<EngineInner>,
}

impl SyncEngine {
    pub fn new(
        remote: Arc<dyn RemoteStore>,
        vault: Arc<dyn LocalVault>,
        tags: Arc<dyn TagSource>,
        state: SyncStateStore,
        settings: Settings,
    ) -> Self {
        let scope = ScopeIndex::new(vault.clone(), tags);
        Self {
            inner: Arc::new(EngineInner {
                remote,
                vault,
                scope,
                state,
                echo: EchoGuard::default(),
                settings: RwLock::new(settings.normalized()),
                control: Mutex::new(Control::default()),
                status: watch::Sender::new(SyncStatus::Idle),
                busy: watch::Sender::new(false),
                last_report: Mutex::new(None),
                last_error: Mutex::new(None),
            }),
        }
    }

    /// Starts the poll timer and schedules the first pass.
    pub fn start(&self) {
        self.inner.restart_poll();
        self.inner.request_run(PassOptions::default());
    }

    pub fn sync_now(&self) {
        self.inner.request_run(PassOptions::default());
    }

    /// Forgets the remote cursor so the next pass starts from a full listing.
    pub fn rebuild_index(&self) {
        self.inner.request_run(PassOptions {
            reset_cursor: true,
            ..PassOptions::default()
        });
    }

    pub fn resync_all_tagged(&self) {
        self.inner.request_run(PassOptions {
            force_upload: true,
            ..PassOptions::default()
        });
    }

    /// Returns `true` when the engine is paused afterwards.
    pub fn toggle_pause(&self) -> bool {
        let (paused, running) = {
            let mut control = lock(&self.inner.control);
            if control.disposed {
                return control.paused;
            }
            control.paused = !control.paused;
            if control.paused
                && let Some(debounce) = control.debounce.take()
            {
                debounce.abort();
            }
            (control.paused, control.running)
        };
        if paused {
            info!("sync paused");
            if !running {
                self.inner.status.send_replace(SyncStatus::Paused);
            }
        } else {
            info!("sync resumed");
            self.inner.status.send_replace(SyncStatus::Idle);
            self.inner.request_run(PassOptions::default());
        }
        paused
    }

    pub fn on_settings_changed(&self, settings: Settings) {
        *self
            .inner
            .settings
            .write()
            .unwrap_or_else(PoisonError::into_inner) = settings.normalized();
        self.inner.restart_poll();
        self.inner.request_run(PassOptions::default());
    }

    /// Debounces a local change. Changes to hidden paths and echoes of the
    /// engine's own writes are dropped.
    pub fn handle_local_event(&self, event: LocalEvent) {
        let paths = event.paths();
        if paths
            .iter()
            .all(|path| is_hidden(path) || self.inner.echo.is_suppressed(path))
        {
            debug!(?event, "ignoring local event");
            return;
        }
        self.inner.schedule_debounced();
    }

    /// Resolves once no pass is running.
    pub async fn wait_idle(&self) {
        let mut busy = self.inner.busy.subscribe();
        let _ = busy.wait_for(|busy| !*busy).await;
    }

    /// Triggers a pass and waits for it (and any follow-ups) to finish.
    pub async fn run_once(&self) -> SyncStatus {
        self.sync_now();
        self.wait_idle().await;
        self.status()
    }

    pub fn status(&self) -> SyncStatus {
        *self.inner.status.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<SyncStatus> {
        self.inner.status.subscribe()
    }

    pub fn settings(&self) -> Settings {
        read(&self.inner.settings).clone()
    }

    pub fn last_report(&self) -> Option<PassReport> {
        lock(&self.inner.last_report).clone()
    }

    pub fn last_error(&self) -> Option<String> {
        lock(&self.inner.last_error).clone()
    }

    /// Cancels both timers, then waits for the pass in flight.
    pub async fn dispose(&self) {
        let run = {
            let mut control = lock(&self.inner.control);
            control.disposed = true;
            for timer in [control.debounce.take(), control.poll.take()]
                .into_iter()
                .flatten()
            {
                timer.abort();
            }
            control.run.take()
        };
        if let Some(run) = run {
            let _ = run.await;
        }
        debug!("sync engine disposed");
    }
}

impl EngineInner {
    fn request_run(self: &Arc<Self>, options: PassOptions) {
        let mut control = lock(&self.control);
        if control.disposed || control.paused {
            return;
        }
        control.pending = control.pending.merge(options);
        if control.running {
            control.rerun = true;
            return;
        }
        control.running = true;
        self.busy.send_replace(true);
        let inner = Arc::clone(self);
        control.run = Some(tokio::spawn(inner.run_loop()));
    }

    fn schedule_debounced(self: &Arc<Self>) {
        let mut control = lock(&self.control);
        if control.disposed || control.paused {
            return;
        }
        if let Some(previous) = control.debounce.take() {
            previous.abort();
        }
        let weak = Arc::downgrade(self);
        control.debounce = Some(tokio::spawn(async move {
            tokio::time::sleep(DEBOUNCE).await;
            if let Some(inner) = weak.upgrade() {
                inner.request_run(PassOptions::default());
            }
        }));
    }

    fn restart_poll(self: &Arc<Self>) {
        let period = read(&self.settings).poll_interval();
        let mut control = lock(&self.control);
        if let Some(previous) = control.poll.take() {
            previous.abort();
        }
        if control.disposed {
            return;
        }
        control.poll = Some(tokio::spawn(poll_loop(Arc::downgrade(self), period)));
    }

    async fn run_loop(self: Arc<Self>) {
        loop {
            let options = {
                let mut control = lock(&self.control);
                control.rerun = false;
                std::mem::take(&mut control.pending)
            };
            self.status.send_replace(SyncStatus::Syncing);
            let outcome = self.pass(options).await;
            let status = self.record_outcome(outcome);

            let again = {
                let mut control = lock(&self.control);
                if control.rerun && !control.paused && !control.disposed {
                    true
                } else {
                    control.running = false;
                    control.rerun = false;
                    let status = if control.paused {
                        SyncStatus::Paused
                    } else {
                        status
                    };
                    self.status.send_replace(status);
                    self.busy.send_replace(false);
                    false
                }
            };
            if !again {
                return;
            }
            debug!("trigger arrived during the pass, running again");
        }
    }

    async fn pass(&self, options: PassOptions) -> Result<PassReport, EngineError> {
        let settings = read(&self.settings).clone();
        Pass {
            remote: self.remote.as_ref(),
            vault: self.vault.as_ref(),
            scope: &self.scope,
            state: &self.state,
            echo: &self.echo,
            settings: &settings,
        }
        .run(options)
        .await
    }

    fn record_outcome(&self, outcome: Result<PassReport, EngineError>) -> SyncStatus {
        match outcome {
            Ok(report) => {
                *lock(&self.last_report) = Some(report);
                *lock(&self.last_error) = None;
                SyncStatus::UpToDate
            }
            Err(err) => {
                let status = if err.is_unreachable() {
                    warn!("remote unreachable, will retry on the next trigger");
                    SyncStatus::Unreachable
                } else {
                    error!(error = %err, "sync pass failed");
                    SyncStatus::Error
                };
                *lock(&self.last_error) = Some(err.to_string());
                status
            }
        }
    }
}

async fn poll_loop(engine: Weak<EngineInner>, period: Duration) {
    loop {
        tokio::time::sleep(period).await;
        let Some(inner) = engine.upgrade() else {
            return;
        };
        inner.request_run(PassOptions::default());
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

fn read<T>(lock: &RwLock<T>) -> RwLockReadGuard<'_, T> {
    lock.read().unwrap_or_else(PoisonError::into_inner)
}

#[cfg(test)]
#[path = "engine_tests.rs"]
mod tests;
