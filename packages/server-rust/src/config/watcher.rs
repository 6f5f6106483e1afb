//! Config hot reload.
//!
//! `ConfigReloader` owns the parse-swap-notify sequence. `ConfigWatcher`
//! polls the backing file's modification time and drives the reloader only
//! for strictly newer timestamps. The watcher runs as a `BackgroundWorker`,
//! so changes are processed one at a time; while it runs, operator reloads
//! are queued behind it instead of racing it.

use std::path::{Path, PathBuf};

use std::sync::Arc;
use std::time::SystemTime;

use arena_core::Config;
use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, info, warn};

use super::store::{ConfigError, ConfigStore};
use crate::service::worker::BackgroundRunnable;

/// A subsystem that caches values derived from the config and must
/// recompute them after a reload.
pub trait ConfigListener: Send + Sync {
    fn name(&self) -> &'static str;

    /// Called synchronously after a new config is installed.
    ///
    /// # Errors
    ///
    /// An error rolls the reload back to the previous config.
    fn on_reload(&self, config: &Config) -> anyhow::Result<()>;
}

/// Result of one reload attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReloadOutcome {
    /// The change notification was not newer than the last one seen.
    Stale,
    /// The backing file is currently missing or unreadable.
    Unavailable,
    Reloaded { version: u64 },
    /// Parsing or a listener failed; the previous config is still live.
    Failed { reason: String },
}

impl ReloadOutcome {
    fn metric_label(&self) -> &'static str {
        match self {
            Self::Stale => "stale",
            Self::Unavailable => "unavailable",
            Self::Reloaded { .. } => "reloaded",
            Self::Failed { .. } => "failed",
        }
    }
}

// ---------------------------------------------------------------------------
// ConfigReloader
// ---------------------------------------------------------------------------

/// Parses new config sources, installs them, and notifies listeners.
pub struct ConfigReloader {
    store: Arc<ConfigStore>,
    listeners: RwLock<Vec<Arc<dyn ConfigListener>>>,
    /// Queue of the running watcher, if any.
    watcher: Mutex<Option<mpsc::Sender<WatchCommand>>>,
}

impl ConfigReloader {
    #[must_use]
    pub fn new(store: Arc<ConfigStore>) -> Self {
        Self {
            store,
            listeners: RwLock::new(Vec::new()),
            watcher: Mutex::new(None),
        }
    }

    #[must_use]
    pub fn store(&self) -> &Arc<ConfigStore> {
        &self.store
    }

    /// Registers a listener to be notified after each successful reload.
    pub fn subscribe(&self, listener: Arc<dyn ConfigListener>) {
        debug!(listener = listener.name(), "config listener registered");
        self.listeners.write().push(listener);
    }

    /// Routes `reload_now` through a running watcher's queue.
    pub fn attach_watcher(&self, queue: mpsc::Sender<WatchCommand>) {
        *self.watcher.lock() = Some(queue);
    }

    /// Parses `source`, offers it to every listener, then installs it as the
    /// live config.
    ///
    /// On a parse error nothing is installed. On a listener error nothing is
    /// installed either, and listeners are told about the live config again
    /// so their caches match it.
    pub fn apply_source(&self, source: &str, modified: Option<SystemTime>) -> ReloadOutcome {
        let outcome = self.apply_inner(source, modified);
        metrics::counter!("arena_config_reloads_total", "outcome" => outcome.metric_label())
            .increment(1);
        outcome
    }

    fn apply_inner(&self, source: &str, modified: Option<SystemTime>) -> ReloadOutcome {
        let config = match Config::from_json(source) {
            Ok(config) => Arc::new(config),
            Err(err) => {
                error!(error = %err, "error reloading config; keeping previous config");
                return ReloadOutcome::Failed {
                    reason: err.to_string(),
                };
            }
        };

        if let Err((listener, err)) = self.notify(&config) {
            error!(
                listener,
                error = %err,
                "config listener rejected reload; keeping previous config"
            );
            if let Err((listener, err)) = self.notify(&self.store.current()) {
                warn!(listener, error = %err, "listener also failed on live config");
            }
            return ReloadOutcome::Failed {
                reason: format!("{listener}: {err}"),
            };
        }

        let version = self.store.install(config, modified);
        info!(version, "reloaded config");
        ReloadOutcome::Reloaded { version }
    }

    fn notify(&self, config: &Config) -> Result<(), (&'static str, anyhow::Error)> {
        let listeners = self.listeners.read().clone();
        for listener in listeners {
            listener
                .on_reload(config)
                .map_err(|err| (listener.name(), err))?;
        }
        Ok(())
    }

    /// Re-reads the backing file unconditionally (operator-requested reload).
    /// While a watcher is attached the reload runs on the watcher's queue.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::NoSource` for stores without a backing file and
    /// `ConfigError::Io` if the file cannot be read.
    pub async fn reload_now(&self) -> Result<ReloadOutcome, ConfigError> {
        let queue = self.watcher.lock().clone();
        if let Some(queue) = queue {
            let (reply, result) = oneshot::channel();
            if queue.send(WatchCommand::ForceReload(reply)).await.is_ok() {
                if let Ok(result) = result.await {
                    return result;
                }
            }
            debug!("config watcher is gone; reloading directly");
            self.watcher.lock().take();
        }

        let path = self.store.source_path().ok_or(ConfigError::NoSource)?;
        let (source, modified) = read_source(path).await?;
        Ok(self.apply_source(&source, modified))
    }
}

/// Reads a config file with its mtime. The mtime is taken first, so an edit
/// racing the read is seen again on the next poll.
async fn read_source(path: &Path) -> Result<(String, Option<SystemTime>), ConfigError> {
    let modified = tokio::fs::metadata(path)
        .await
        .and_then(|m| m.modified())
        .ok();
    let source = tokio::fs::read_to_string(path)
        .await
        .map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
    Ok((source, modified))
}

// ---------------------------------------------------------------------------
// ConfigWatcher
// ---------------------------------------------------------------------------

/// On-demand commands accepted by a running watcher.
#[derive(Debug)]
pub enum WatchCommand {
    /// Poll the file now instead of waiting for the next tick.
    CheckNow,
    /// Reload regardless of the mtime and reply with the outcome.
    ForceReload(oneshot::Sender<Result<ReloadOutcome, ConfigError>>),
}

/// Polls the config file and reloads it when its mtime strictly increases.
pub struct ConfigWatcher {
    reloader: Arc<ConfigReloader>,
    path: PathBuf,
    last_modified: Option<SystemTime>,
}

impl ConfigWatcher {
    /// Creates a watcher whose baseline is the mtime of the installed config.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::NoSource` if the store has no backing file.
    pub fn new(reloader: Arc<ConfigReloader>) -> Result<Self, ConfigError> {
        let path = reloader
            .store()
            .source_path()
            .ok_or(ConfigError::NoSource)?
            .to_path_buf();
        let last_modified = reloader.store().snapshot().modified;
        Ok(Self {
            reloader,
            path,
            last_modified,
        })
    }

    /// Records `modified` if it is newer than the last timestamp seen.
    /// Returns `false` for duplicate or out-of-order notifications.
    fn accept(&mut self, modified: SystemTime) -> bool {
        if self.last_modified.is_some_and(|last| modified <= last) {
            return false;
        }
        self.last_modified = Some(modified);
        true
    }

    /// Handles one change notification carrying `source` as the file content.
    pub fn observe(&mut self, modified: SystemTime, source: &str) -> ReloadOutcome {
        if !self.accept(modified) {
            return ReloadOutcome::Stale;
        }
        self.reloader.apply_source(source, Some(modified))
    }

    /// Reloads the file whatever its mtime. The mtime still advances the
    /// baseline, so the next poll does not apply the same edit again.
    pub async fn force_reload(&mut self) -> Result<ReloadOutcome, ConfigError> {
        let (source, modified) = read_source(&self.path).await?;
        if let Some(modified) = modified {
            self.last_modified = Some(self.last_modified.map_or(modified, |last| last.max(modified)));
        }
        Ok(self.reloader.apply_source(&source, modified))
    }

    /// Stats the file and reloads it if it changed.
    pub async fn poll_once(&mut self) -> ReloadOutcome {
        let modified = match tokio::fs::metadata(&self.path)
            .await
            .and_then(|m| m.modified())
        {
            Ok(modified) => modified,
            Err(err) => {
                debug!(path = %self.path.display(), error = %err, "config file not available");
                return ReloadOutcome::Unavailable;
            }
        };
        if !self.accept(modified) {
            return ReloadOutcome::Stale;
        }

        match tokio::fs::read_to_string(&self.path).await {
            Ok(source) => self.reloader.apply_source(&source, Some(modified)),
            Err(err) => {
                error!(path = %self.path.display(), error = %err, "error reading changed config");
                ReloadOutcome::Failed {
                    reason: err.to_string(),
                }
            }
        }
    }
}

#[async_trait]
impl BackgroundRunnable for ConfigWatcher {
    type Task = WatchCommand;

    fn name(&self) -> &'static str {
        "config-watcher"
    }

    async fn run(&mut self, task: WatchCommand) {
        match task {
            WatchCommand::CheckNow => {
                self.poll_once().await;
            }
            WatchCommand::ForceReload(reply) => {
                let _ = reply.send(self.force_reload().await);
            }
        }
    }

    async fn on_tick(&mut self) {
        self.poll_once().await;
    }
}
