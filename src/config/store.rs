use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime};

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use super::Config;
use crate::app::ConfigError;

/// Receiver for configuration changes.
pub type ConfigWatcher = watch::Receiver<Arc<Config>>;

/// Holds the active configuration snapshot.
///
/// A new configuration is fully parsed and validated before it replaces the
/// current one; on failure the previous snapshot stays active. Readers only
/// ever see complete snapshots.
pub struct ConfigStore {
    path: Option<PathBuf>,
    sender: watch::Sender<Arc<Config>>,
    receiver: watch::Receiver<Arc<Config>>,
    last_mtime: Mutex<Option<SystemTime>>,
    write_lock: Mutex<()>,
}

impl ConfigStore {
    /// In-memory store, never persisted.
    pub fn new(config: Config) -> Result<Self, ConfigError> {
        config.validate()?;
        Ok(Self::with_snapshot(None, config, None))
    }

    /// Load (creating a commented default if missing) and watch `path`.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self, ConfigError> {
        let path = path.into();
        let config = Config::load_or_create(&path)?;
        let mtime = modified_time(&path);
        Ok(Self::with_snapshot(Some(path), config, mtime))
    }

    fn with_snapshot(path: Option<PathBuf>, config: Config, mtime: Option<SystemTime>) -> Self {
        let (sender, receiver) = watch::channel(Arc::new(config));
        Self {
            path,
            sender,
            receiver,
            last_mtime: Mutex::new(mtime),
            write_lock: Mutex::new(()),
        }
    }

    /// Current snapshot (no I/O).
    pub fn get(&self) -> Arc<Config> {
        self.receiver.borrow().clone()
    }

    pub fn subscribe(&self) -> ConfigWatcher {
        self.receiver.clone()
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Re-read the backing file. Returns the active snapshot, which is the
    /// previous one if nothing changed.
    pub fn reload(&self) -> Result<Arc<Config>, ConfigError> {
        let path = self
            .path
            .as_deref()
            .ok_or_else(|| ConfigError::Invalid("configuration has no backing file".into()))?;

        let _guard = self.lock_writes();
        let mtime = modified_time(path);
        let config = Config::load_from(path)?;
        self.set_mtime(mtime);

        if *self.get() == config {
            debug!("Configuration unchanged after reload");
            return Ok(self.get());
        }

        let snapshot = Arc::new(config);
        self.sender.send_replace(snapshot.clone());
        info!(path = %path.display(), "Configuration reloaded");
        Ok(snapshot)
    }

    /// Apply an edit to a copy of the current configuration. The edit only
    /// takes effect if the result validates.
    pub fn update<F>(&self, edit: F) -> Result<Arc<Config>, ConfigError>
    where
        F: FnOnce(&mut Config),
    {
        let _guard = self.lock_writes();
        let mut config = (*self.get()).clone();
        edit(&mut config);
        self.install(config)
    }

    fn install(&self, config: Config) -> Result<Arc<Config>, ConfigError> {
        config.validate()?;

        if let Some(path) = &self.path {
            save_atomically(path, &config)?;
            self.set_mtime(modified_time(path));
        }

        let snapshot = Arc::new(config);
        self.sender.send_replace(snapshot.clone());
        Ok(snapshot)
    }

    /// Poll the backing file's mtime and reload on change until cancelled.
    pub fn spawn_watcher(
        self: &Arc<Self>,
        period: Duration,
        cancel: CancellationToken,
    ) -> Option<JoinHandle<()>> {
        let path = self.path.clone()?;
        let store = self.clone();

        Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {}
                }

                let mtime = modified_time(&path);
                if mtime.is_none() || mtime == store.current_mtime() {
                    continue;
                }

                if let Err(e) = store.reload() {
                    // Remember the broken revision so it is reported once.
                    store.set_mtime(mtime);
                    error!(path = %path.display(), error = %e, "Rejected configuration change");
                }
            }

            debug!("Configuration watcher stopped");
        }))
    }

    fn lock_writes(&self) -> std::sync::MutexGuard<'_, ()> {
        self.write_lock
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn current_mtime(&self) -> Option<SystemTime> {
        *self
            .last_mtime
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn set_mtime(&self, mtime: Option<SystemTime>) {
        *self
            .last_mtime
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = mtime;
    }
}

fn modified_time(path: &Path) -> Option<SystemTime> {
    fs::metadata(path).and_then(|m| m.modified()).ok()
}

/// Write-to-temp-then-rename so a crash never leaves a truncated file.
fn save_atomically(path: &Path, config: &Config) -> Result<(), ConfigError> {
    let content = config.to_toml()?;
    let tmp_path = path.with_extension("toml.tmp");

    let io_err = |source| ConfigError::Io {
        path: path.to_path_buf(),
        source,
    };

    fs::write(&tmp_path, content).map_err(io_err)?;
    fs::rename(&tmp_path, path).map_err(io_err)?;

    debug!(path = %path.display(), "Saved configuration");
    Ok(())
}
