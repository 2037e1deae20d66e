pub mod sqlite;

use std::path::Path;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::app::Result;
use crate::domain::{
    CandidateEntry, DownloaderKind, Entry, EntryQuery, EntryStatus, Feed, FeedSpec,
};

pub use sqlite::SqliteStore;

pub type SharedStore = Arc<dyn Store + Send + Sync>;

/// Outcome of reconciling configured feeds with stored ones.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SyncReport {
    pub upserted: usize,
    pub disabled: usize,
}

/// Entry totals per status.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct EntryCounts {
    pub pending: u64,
    pub downloading: u64,
    pub completed: u64,
    pub failed: u64,
    pub skipped: u64,
}

impl EntryCounts {
    pub fn add(&mut self, status: EntryStatus, n: u64) {
        match status {
            EntryStatus::Pending => self.pending += n,
            EntryStatus::Downloading => self.downloading += n,
            EntryStatus::Completed => self.completed += n,
            EntryStatus::Failed => self.failed += n,
            EntryStatus::Skipped => self.skipped += n,
        }
    }

    pub fn total(&self) -> u64 {
        self.pending + self.downloading + self.completed + self.failed + self.skipped
    }
}

/// Persistent record of feeds, seen entries and download state.
///
/// Every download state transition is a single-row compare-and-set; the only
/// multi-row transaction is [`Store::insert_entries`].
pub trait Store {
    // Feed operations
    fn sync_feeds(&self, specs: &[FeedSpec]) -> Result<SyncReport>;
    fn get_feed(&self, id: i64) -> Result<Option<Feed>>;
    fn get_feed_by_name(&self, name: &str) -> Result<Option<Feed>>;
    fn get_all_feeds(&self) -> Result<Vec<Feed>>;
    /// Sets `last_poll` (only ever forward) and `last_error`. Returns whether
    /// `last_poll` moved.
    fn record_poll(&self, id: i64, polled_at: DateTime<Utc>, error: Option<&str>)
        -> Result<bool>;
    fn set_validators(
        &self,
        id: i64,
        etag: Option<&str>,
        last_modified: Option<&str>,
    ) -> Result<()>;
    fn disable_feed(&self, id: i64, reason: &str) -> Result<()>;

    // Entry operations
    /// Inserts unseen candidates in one transaction and returns the rows
    /// that were actually new. Candidates must already be unique by key.
    fn insert_entries(&self, feed_id: i64, candidates: &[CandidateEntry]) -> Result<Vec<Entry>>;
    fn get_entry(&self, id: i64) -> Result<Option<Entry>>;
    fn find_entry(&self, feed_id: i64, key: &str) -> Result<Option<Entry>>;
    fn query_entries(&self, query: &EntryQuery) -> Result<(Vec<Entry>, u64)>;
    /// Pending entries whose backoff has elapsed, oldest first.
    fn due_entries(&self, now: DateTime<Utc>, limit: usize) -> Result<Vec<Entry>>;
    fn entry_counts(&self, feed_id: Option<i64>) -> Result<EntryCounts>;

    // Download state transitions
    /// `pending -> downloading`. Exactly one concurrent caller gets `true`.
    fn claim_entry(&self, id: i64, now: DateTime<Utc>) -> Result<bool>;
    /// `downloading -> completed`. `file_path` is `None` when the enclosure
    /// was handed to a remote downloader.
    fn complete_entry(
        &self,
        id: i64,
        file_path: Option<&Path>,
        downloader: DownloaderKind,
    ) -> Result<()>;
    /// `downloading -> pending` (retry at `retry_at`) or `failed` once the
    /// incremented retry count reaches `max_retries`.
    fn fail_entry(
        &self,
        id: i64,
        error: &str,
        max_retries: u32,
        retry_at: DateTime<Utc>,
    ) -> Result<EntryStatus>;
    /// `downloading -> pending` without consuming a retry.
    fn release_entry(&self, id: i64) -> Result<()>;
    /// Startup sweep: every `downloading` row goes back to `pending`.
    fn reset_stale_downloads(&self) -> Result<usize>;
    /// Manual re-download: back to `pending` with a fresh retry budget, in
    /// manual mode, optionally pinned to a downloader.
    fn requeue_entry(&self, id: i64, downloader: Option<DownloaderKind>) -> Result<Entry>;
}
