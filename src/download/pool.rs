use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};

use chrono::{DateTime, Utc};
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn};

use crate::app::{DownloadError, FreshetError, Result};
use crate::config::ConfigStore;
use crate::domain::{DownloaderKind, Entry, EntryStatus, Feed};
use crate::download::{destination, part_path, Downloader, RetryPolicy, SharedRemote};
use crate::store::SharedStore;
use crate::webhook::{DownloadNotice, WebhookNotifier};

/// How many due entries one `dispatch_due` call loads at most.
const DUE_BATCH: usize = 256;

/// Bounded pool of download tasks.
///
/// Concurrency is capped globally and, optionally, per feed. Each entry is
/// queued at most once per process; the store's `pending -> downloading`
/// claim keeps it single-owner across everything else.
pub struct DownloadPool {
    store: SharedStore,
    downloader: Arc<dyn Downloader + Send + Sync>,
    remotes: HashMap<DownloaderKind, SharedRemote>,
    notifier: Option<Arc<WebhookNotifier>>,
    config: Arc<ConfigStore>,
    global: Arc<Semaphore>,
    per_feed_limit: usize,
    per_feed: Mutex<HashMap<i64, Arc<Semaphore>>>,
    queued: Mutex<HashSet<i64>>,
    tracker: TaskTracker,
    cancel: CancellationToken,
}

impl DownloadPool {
    /// Limits are read from the configuration once, here.
    pub fn new(
        store: SharedStore,
        downloader: Arc<dyn Downloader + Send + Sync>,
        config: Arc<ConfigStore>,
        cancel: CancellationToken,
    ) -> Self {
        let runtime = config.get().runtime.clone();

        Self {
            store,
            downloader,
            remotes: HashMap::new(),
            notifier: None,
            config,
            global: Arc::new(Semaphore::new(runtime.max_concurrent_downloads)),
            per_feed_limit: runtime.max_downloads_per_feed,
            per_feed: Mutex::new(HashMap::new()),
            queued: Mutex::new(HashSet::new()),
            tracker: TaskTracker::new(),
            cancel,
        }
    }

    /// Route entries whose backend is `remote.kind()` to `remote`.
    pub fn with_remote(mut self, remote: SharedRemote) -> Self {
        self.remotes.insert(remote.kind(), remote);
        self
    }

    pub fn with_notifier(mut self, notifier: Arc<WebhookNotifier>) -> Self {
        self.notifier = Some(notifier);
        self
    }

    /// Queue entries for download. Returns how many were queued.
    pub fn dispatch(self: &Arc<Self>, entries: Vec<Entry>) -> usize {
        let mut queued = 0;

        for entry in entries {
            if self.cancel.is_cancelled() {
                break;
            }
            if entry.status != EntryStatus::Pending || entry.enclosure_url.is_none() {
                continue;
            }
            if !lock(&self.queued).insert(entry.id) {
                debug!(entry = entry.id, "Already queued");
                continue;
            }

            let pool = Arc::clone(self);
            let feed_limit = self.feed_semaphore(entry.feed_id);

            self.tracker.spawn(async move {
                let id = entry.id;
                pool.run_queued(entry, feed_limit).await;
                lock(&pool.queued).remove(&id);
            });
            queued += 1;
        }

        queued
    }

    /// Queue pending entries whose backoff has elapsed.
    pub fn dispatch_due(self: &Arc<Self>, now: DateTime<Utc>) -> Result<usize> {
        let due = self.store.due_entries(now, DUE_BATCH)?;
        let fresh: Vec<Entry> = {
            let queued = lock(&self.queued);
            due.into_iter().filter(|e| !queued.contains(&e.id)).collect()
        };
        Ok(self.dispatch(fresh))
    }

    async fn run_queued(&self, entry: Entry, feed_limit: Option<Arc<Semaphore>>) {
        let _global = tokio::select! {
            _ = self.cancel.cancelled() => return,
            permit = self.global.clone().acquire_owned() => match permit {
                Ok(permit) => permit,
                Err(_) => return,
            },
        };

        let _feed = match feed_limit {
            Some(semaphore) => tokio::select! {
                _ = self.cancel.cancelled() => return,
                permit = semaphore.acquire_owned() => match permit {
                    Ok(permit) => Some(permit),
                    Err(_) => return,
                },
            },
            None => None,
        };

        if let Err(e) = self.run(&entry).await {
            error!(entry = entry.id, error = %e, "Download task failed");
        }
    }

    /// Download one entry end to end.
    ///
    /// Returns `None` when another worker holds the claim.
    pub async fn run(&self, entry: &Entry) -> Result<Option<EntryStatus>> {
        let feed = self
            .store
            .get_feed(entry.feed_id)?
            .ok_or_else(|| FreshetError::FeedNotFound(entry.feed_id.to_string()))?;

        let Some(url) = entry.enclosure_url.as_deref() else {
            return Ok(None);
        };

        let started = Utc::now();
        if !self.store.claim_entry(entry.id, started)? {
            debug!(entry = entry.id, "Entry claimed elsewhere");
            return Ok(None);
        }

        match self.run_claimed(entry, &feed, url).await {
            Ok(status) => Ok(Some(status)),
            Err(e) => {
                // Don't leave the claim behind until the next startup sweep.
                if let Err(release) = self.store.release_entry(entry.id) {
                    error!(entry = entry.id, error = %release, "Failed to release entry");
                }
                Err(e)
            }
        }
    }

    async fn run_claimed(&self, entry: &Entry, feed: &Feed, url: &str) -> Result<EntryStatus> {
        // Retry count and manual override as stored at claim time.
        let stored = self.store.get_entry(entry.id)?;
        let retry_count = stored.as_ref().map_or(entry.retry_count, |e| e.retry_count);
        let mode = stored.as_ref().map_or(entry.mode, |e| e.mode);
        let kind = stored
            .as_ref()
            .and_then(|e| e.downloader)
            .unwrap_or_else(|| self.feed_downloader(feed));

        info!(
            feed = %feed.name,
            entry = entry.id,
            title = entry.display_title(),
            backend = %kind,
            "Downloading"
        );

        let result = match kind {
            DownloaderKind::Http => self.download_file(entry, feed, url).await.map(Some),
            remote => self.hand_off(remote, url).await.map(|()| None),
        };

        match result {
            Ok(file_path) => {
                self.store.complete_entry(entry.id, file_path.as_deref(), kind)?;
                match &file_path {
                    Some(path) => info!(entry = entry.id, path = %path.display(), "Download completed"),
                    None => info!(entry = entry.id, backend = %kind, "Handed off to remote downloader"),
                }
                if let Some(notifier) = &self.notifier {
                    let notice = DownloadNotice::new(entry, feed, kind, mode, file_path);
                    notifier.notify(&notice).await;
                }
                Ok(EntryStatus::Completed)
            }
            Err(DownloadError::Cancelled) => {
                self.store.release_entry(entry.id)?;
                info!(entry = entry.id, "Download cancelled");
                Ok(EntryStatus::Pending)
            }
            Err(e) => {
                let policy = RetryPolicy::from_runtime(&self.config.get().runtime);
                let attempt = retry_count.saturating_add(1);
                let retry_at = policy.retry_at(Utc::now(), attempt);
                let status =
                    self.store
                        .fail_entry(entry.id, &e.to_string(), policy.max_retries, retry_at)?;

                if status == EntryStatus::Failed {
                    warn!(entry = entry.id, attempt, error = %e, "Download failed permanently");
                } else {
                    warn!(entry = entry.id, attempt, retry_at = %retry_at, error = %e, "Download failed, will retry");
                }
                Ok(status)
            }
        }
    }

    /// Stream into `<dest>.part`, then rename. The partial file never
    /// survives an error.
    async fn download_file(
        &self,
        entry: &Entry,
        feed: &Feed,
        url: &str,
    ) -> std::result::Result<PathBuf, DownloadError> {
        if feed.output_dir.as_os_str().is_empty() {
            return Err(DownloadError::Write {
                path: feed.output_dir.clone(),
                source: std::io::Error::new(
                    std::io::ErrorKind::InvalidInput,
                    "feed has no output directory",
                ),
            });
        }
        let dest = destination(&feed.output_dir, entry);
        let part = part_path(&dest);

        let result = match tokio::fs::create_dir_all(&feed.output_dir).await {
            Ok(()) => self.downloader.download(url, &part, &self.cancel).await,
            Err(source) => Err(DownloadError::Write {
                path: feed.output_dir.clone(),
                source,
            }),
        };
        let result = match result {
            Ok(bytes) => tokio::fs::rename(&part, &dest)
                .await
                .map(|()| bytes)
                .map_err(|source| DownloadError::Write {
                    path: dest.clone(),
                    source,
                }),
            Err(e) => Err(e),
        };

        match result {
            Ok(bytes) => {
                debug!(entry = entry.id, bytes, "Transfer finished");
                Ok(dest)
            }
            Err(e) => {
                remove_partial(&part).await;
                Err(e)
            }
        }
    }

    async fn hand_off(&self, kind: DownloaderKind, url: &str) -> std::result::Result<(), DownloadError> {
        let remote = self
            .remotes
            .get(&kind)
            .ok_or(DownloadError::NotConfigured(kind))?;

        let task = tokio::select! {
            _ = self.cancel.cancelled() => return Err(DownloadError::Cancelled),
            task = remote.add(url) => task?,
        };
        debug!(backend = %kind, task = ?task, "Remote downloader accepted");
        Ok(())
    }

    fn feed_downloader(&self, feed: &Feed) -> DownloaderKind {
        self.config
            .get()
            .feed(&feed.name)
            .map(|f| f.downloader)
            .unwrap_or_default()
    }

    /// Entries currently queued or running in this process.
    pub fn queued_len(&self) -> usize {
        lock(&self.queued).len()
    }

    /// Wait until every queued task has finished. New work may be queued
    /// afterwards.
    pub async fn wait_idle(&self) {
        self.tracker.close();
        self.tracker.wait().await;
        self.tracker.reopen();
    }

    /// Cancel running downloads and wait for their tasks to return their
    /// entries to `pending`.
    pub async fn shutdown(&self) {
        self.cancel.cancel();
        self.tracker.close();
        self.tracker.wait().await;
        debug!("Download pool stopped");
    }

    fn feed_semaphore(&self, feed_id: i64) -> Option<Arc<Semaphore>> {
        if self.per_feed_limit == 0 {
            return None;
        }
        let limit = self.per_feed_limit;
        Some(
            lock(&self.per_feed)
                .entry(feed_id)
                .or_insert_with(|| Arc::new(Semaphore::new(limit)))
                .clone(),
        )
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

async fn remove_partial(path: &Path) {
    if let Err(e) = tokio::fs::remove_file(path).await {
        if e.kind() != std::io::ErrorKind::NotFound {
            warn!(path = %path.display(), error = %e, "Could not remove partial file");
        }
    }
}
