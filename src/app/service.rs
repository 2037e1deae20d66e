//! Query and command surface for front ends (CLI, web layer).

use std::sync::Arc;

use serde::Serialize;
use tracing::info;

use crate::app::{AppContext, DownloadError, FreshetError, Result};
use crate::config::{Config, ConfigStore};
use crate::domain::{DownloaderKind, Entry, EntryQuery, Feed};
use crate::download::DownloadPool;
use crate::scheduler::{PollTrigger, Scheduler};
use crate::store::{EntryCounts, SqliteStore, Store};

#[derive(Debug, Clone, Serialize)]
pub struct FeedStatus {
    #[serde(flatten)]
    pub feed: Feed,
    pub polling: bool,
    pub entries: EntryCounts,
}

#[derive(Debug, Clone, Serialize)]
pub struct EntryPage {
    pub entries: Vec<Entry>,
    /// Matches before limit/offset.
    pub total: u64,
}

#[derive(Clone)]
pub struct Service {
    config: Arc<ConfigStore>,
    store: Arc<SqliteStore>,
    pool: Arc<DownloadPool>,
    scheduler: Arc<Scheduler>,
}

impl Service {
    pub fn new(ctx: &AppContext) -> Self {
        Self {
            config: ctx.config.clone(),
            store: ctx.store.clone(),
            pool: ctx.pool.clone(),
            scheduler: ctx.scheduler.clone(),
        }
    }

    pub fn list_feeds(&self) -> Result<Vec<FeedStatus>> {
        self.store
            .get_all_feeds()?
            .into_iter()
            .map(|feed| {
                let entries = self.store.entry_counts(Some(feed.id))?;
                Ok(FeedStatus {
                    polling: self.scheduler.is_in_flight(feed.id),
                    feed,
                    entries,
                })
            })
            .collect()
    }

    /// Look a feed up by its configured name.
    pub fn feed_by_name(&self, name: &str) -> Result<Feed> {
        self.store
            .get_feed_by_name(name)?
            .ok_or_else(|| FreshetError::FeedNotFound(name.to_string()))
    }

    pub fn list_entries(&self, query: &EntryQuery) -> Result<EntryPage> {
        let (entries, total) = self.store.query_entries(query)?;
        Ok(EntryPage { entries, total })
    }

    pub fn get_entry(&self, id: i64) -> Result<Entry> {
        self.store
            .get_entry(id)?
            .ok_or(FreshetError::EntryNotFound(id))
    }

    /// Poll a feed now unless a poll of it is already running.
    pub fn trigger_poll(&self, feed_id: i64) -> Result<PollTrigger> {
        self.scheduler.poll_now(feed_id)
    }

    /// Reset an entry to `pending` with a fresh retry budget and queue it.
    ///
    /// `downloader` picks the backend for this attempt; `None` uses the
    /// feed's configured one.
    pub fn redownload(&self, entry_id: i64, downloader: Option<DownloaderKind>) -> Result<Entry> {
        if let Some(kind) = downloader {
            if !self.config.get().downloader_configured(kind) {
                return Err(DownloadError::NotConfigured(kind).into());
            }
        }

        let entry = self.store.requeue_entry(entry_id, downloader)?;
        info!(
            entry = entry.id,
            title = entry.display_title(),
            backend = ?entry.downloader,
            "Queued re-download"
        );
        self.pool.dispatch(vec![entry.clone()]);
        Ok(entry)
    }

    pub fn config(&self) -> Arc<Config> {
        self.config.get()
    }

    /// Validate and apply a configuration edit, then reconcile feeds.
    /// Nothing changes if the edited configuration is invalid.
    pub fn update_config<F>(&self, edit: F) -> Result<Arc<Config>>
    where
        F: FnOnce(&mut Config),
    {
        let config = self.config.update(edit)?;
        self.scheduler.sync_config(&config)?;
        Ok(config)
    }
}
