use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::app::error::{ConfigError, Result};
use crate::app::Service;
use crate::config::ConfigStore;
use crate::download::{
    Aria2Client, DownloadPool, Downloader, HttpDownloader, QbittorrentClient, SharedRemote,
};
use crate::fetcher::{Fetcher, HttpFetcher};
use crate::scheduler::Scheduler;
use crate::store::{SqliteStore, Store};
use crate::webhook::WebhookNotifier;

/// Everything the engine needs, built once at startup and passed around
/// explicitly.
pub struct AppContext {
    pub config: Arc<ConfigStore>,
    pub store: Arc<SqliteStore>,
    pub fetcher: Arc<dyn Fetcher + Send + Sync>,
    pub pool: Arc<DownloadPool>,
    pub scheduler: Arc<Scheduler>,
    pub cancel: CancellationToken,
}

impl AppContext {
    /// Open the database named in the configuration (or the default one)
    /// and wire up HTTP fetching and downloading.
    pub fn new(config: Arc<ConfigStore>) -> Result<Self> {
        let db_path = match config.get().database.clone() {
            Some(p) => p,
            None => Self::default_db_path()?,
        };
        if let Some(parent) = db_path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }

        let store = Arc::new(SqliteStore::new(&db_path)?);
        Self::with_http(config, store)
    }

    pub fn in_memory(config: Arc<ConfigStore>) -> Result<Self> {
        let store = Arc::new(SqliteStore::in_memory()?);
        Self::with_http(config, store)
    }

    fn with_http(config: Arc<ConfigStore>, store: Arc<SqliteStore>) -> Result<Self> {
        let runtime = config.get().runtime.clone();

        let fetcher: Arc<dyn Fetcher + Send + Sync> = Arc::new(HttpFetcher::new(
            Duration::from_secs(runtime.fetch_timeout_seconds),
            &runtime.user_agent,
        )?);
        let downloader: Arc<dyn Downloader + Send + Sync> = Arc::new(HttpDownloader::new(
            Duration::from_secs(runtime.download_timeout_seconds),
            &runtime.user_agent,
        )?);

        Self::with_parts(config, store, fetcher, downloader)
    }

    /// Assemble a context from explicit parts.
    ///
    /// Downloads left `downloading` by a previous process go back to
    /// `pending` here, before anything can be dispatched.
    pub fn with_parts(
        config: Arc<ConfigStore>,
        store: Arc<SqliteStore>,
        fetcher: Arc<dyn Fetcher + Send + Sync>,
        downloader: Arc<dyn Downloader + Send + Sync>,
    ) -> Result<Self> {
        let swept = store.reset_stale_downloads()?;
        if swept > 0 {
            info!(entries = swept, "Reset interrupted downloads to pending");
        }

        let cancel = CancellationToken::new();

        let mut pool = DownloadPool::new(
            store.clone(),
            downloader,
            config.clone(),
            cancel.child_token(),
        );
        for remote in Self::remotes(&config)? {
            info!(backend = %remote.kind(), "Remote downloader configured");
            pool = pool.with_remote(remote);
        }
        let runtime = config.get().runtime.clone();
        let notifier = WebhookNotifier::new(
            config.clone(),
            Duration::from_secs(runtime.fetch_timeout_seconds),
            &runtime.user_agent,
        )?;
        let pool = Arc::new(pool.with_notifier(Arc::new(notifier)));
        let scheduler = Arc::new(Scheduler::new(
            store.clone(),
            fetcher.clone(),
            pool.clone(),
            config.clone(),
            cancel.clone(),
        ));

        Ok(Self {
            config,
            store,
            fetcher,
            pool,
            scheduler,
            cancel,
        })
    }

    pub fn service(&self) -> Service {
        Service::new(self)
    }

    /// Stop polling, then cancel downloads and wait for both to settle.
    pub async fn shutdown(&self) {
        self.cancel.cancel();
        self.scheduler.wait_idle().await;
        self.pool.shutdown().await;
    }

    /// Remote downloader clients for the sections present at startup.
    fn remotes(config: &ConfigStore) -> Result<Vec<SharedRemote>> {
        let snapshot = config.get();
        let timeout = Duration::from_secs(snapshot.runtime.fetch_timeout_seconds);
        let mut remotes: Vec<SharedRemote> = Vec::new();

        if let Some(aria2) = &snapshot.aria2 {
            remotes.push(Arc::new(Aria2Client::new(aria2, timeout)?));
        }
        if let Some(qbittorrent) = &snapshot.qbittorrent {
            remotes.push(Arc::new(QbittorrentClient::new(qbittorrent, timeout)?));
        }
        Ok(remotes)
    }

    fn default_db_path() -> Result<PathBuf> {
        let data_dir = dirs::data_dir()
            .ok_or_else(|| ConfigError::Invalid("could not determine data directory".into()))?;
        Ok(data_dir.join("freshet").join("freshet.db"))
    }
}
