//! Poll loop: decides when each feed is due and drives
//! fetch -> normalize -> dedup -> dispatch for it.

use std::collections::HashSet;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::Semaphore;
use tokio::time::{interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn};

use crate::app::{ConfigError, FreshetError, Result};
use crate::config::{Config, ConfigStore, TitleFilter};
use crate::dedup::Deduplicator;
use crate::domain::{DownloaderKind, Feed};
use crate::download::DownloadPool;
use crate::fetcher::{FetchResult, Fetcher};
use crate::normalizer::Normalizer;
use crate::store::{SharedStore, SyncReport};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollTrigger {
    Started,
    AlreadyInFlight,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TickReport {
    pub triggered: usize,
    pub skipped_in_flight: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollOutcome {
    /// Server answered 304.
    NotModified,
    Polled {
        /// Entries in the document.
        total: usize,
        /// Entries that passed the title filter.
        matched: usize,
        new: usize,
        known: usize,
        dispatched: usize,
    },
}

/// Feeds with a poll in progress. Membership is held by [`InFlightGuard`].
#[derive(Default)]
struct InFlight(Arc<Mutex<HashSet<i64>>>);

impl InFlight {
    fn begin(&self, feed_id: i64) -> Option<InFlightGuard> {
        lock(&self.0)
            .insert(feed_id)
            .then(|| InFlightGuard {
                set: self.0.clone(),
                feed_id,
            })
    }

    fn contains(&self, feed_id: i64) -> bool {
        lock(&self.0).contains(&feed_id)
    }
}

struct InFlightGuard {
    set: Arc<Mutex<HashSet<i64>>>,
    feed_id: i64,
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        lock(&self.set).remove(&self.feed_id);
    }
}

pub struct Scheduler {
    store: SharedStore,
    fetcher: Arc<dyn Fetcher + Send + Sync>,
    normalizer: Normalizer,
    dedup: Deduplicator,
    pool: Arc<DownloadPool>,
    config: Arc<ConfigStore>,
    feed_limit: Arc<Semaphore>,
    in_flight: InFlight,
    tracker: TaskTracker,
    cancel: CancellationToken,
}

impl Scheduler {
    pub fn new(
        store: SharedStore,
        fetcher: Arc<dyn Fetcher + Send + Sync>,
        pool: Arc<DownloadPool>,
        config: Arc<ConfigStore>,
        cancel: CancellationToken,
    ) -> Self {
        let max_feeds = config.get().runtime.max_concurrent_feeds;

        Self {
            dedup: Deduplicator::new(store.clone()),
            store,
            fetcher,
            normalizer: Normalizer::new(),
            pool,
            config,
            feed_limit: Arc::new(Semaphore::new(max_feeds)),
            in_flight: InFlight::default(),
            tracker: TaskTracker::new(),
            cancel,
        }
    }

    /// Reconcile configured feeds into the store.
    pub fn sync_config(&self, config: &Config) -> Result<SyncReport> {
        let report = self.store.sync_feeds(&config.feed_specs())?;
        info!(
            feeds = report.upserted,
            disabled = report.disabled,
            "Synced feeds from configuration"
        );
        Ok(report)
    }

    /// Trigger a poll for every enabled feed that is due at `now`.
    pub fn tick(self: &Arc<Self>, now: DateTime<Utc>) -> Result<TickReport> {
        let mut report = TickReport::default();

        for feed in self.store.get_all_feeds()? {
            if !feed.enabled || !feed.is_due(now) {
                continue;
            }
            match self.trigger(feed, now) {
                PollTrigger::Started => report.triggered += 1,
                PollTrigger::AlreadyInFlight => report.skipped_in_flight += 1,
            }
        }

        if report.triggered > 0 || report.skipped_in_flight > 0 {
            debug!(
                triggered = report.triggered,
                skipped = report.skipped_in_flight,
                "Tick"
            );
        }
        Ok(report)
    }

    /// Poll one feed right away in the background.
    pub fn poll_now(self: &Arc<Self>, feed_id: i64) -> Result<PollTrigger> {
        let feed = self
            .store
            .get_feed(feed_id)?
            .ok_or_else(|| FreshetError::FeedNotFound(feed_id.to_string()))?;
        Ok(self.trigger(feed, Utc::now()))
    }

    /// Poll one feed and wait for the result. `None` when a poll of that
    /// feed is already running.
    pub async fn poll_once(&self, feed_id: i64) -> Result<Option<PollOutcome>> {
        let feed = self
            .store
            .get_feed(feed_id)?
            .ok_or_else(|| FreshetError::FeedNotFound(feed_id.to_string()))?;

        let Some(_guard) = self.in_flight.begin(feed.id) else {
            return Ok(None);
        };
        let _permit = self
            .feed_limit
            .acquire()
            .await
            .map_err(|e| FreshetError::Other(e.to_string()))?;

        self.poll_feed(&feed, Utc::now()).await.map(Some)
    }

    pub fn is_in_flight(&self, feed_id: i64) -> bool {
        self.in_flight.contains(feed_id)
    }

    fn trigger(self: &Arc<Self>, feed: Feed, triggered_at: DateTime<Utc>) -> PollTrigger {
        let Some(guard) = self.in_flight.begin(feed.id) else {
            debug!(feed = %feed.name, "Poll already in flight");
            return PollTrigger::AlreadyInFlight;
        };

        let scheduler = Arc::clone(self);
        self.tracker.spawn(async move {
            let _guard = guard;
            let _permit = tokio::select! {
                _ = scheduler.cancel.cancelled() => return,
                permit = scheduler.feed_limit.clone().acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => return,
                },
            };

            tokio::select! {
                _ = scheduler.cancel.cancelled() => {
                    debug!(feed = %feed.name, "Poll abandoned on shutdown");
                }
                _ = scheduler.poll_feed(&feed, triggered_at) => {}
            }
        });

        PollTrigger::Started
    }

    /// Run one poll and record its outcome on the feed.
    ///
    /// `last_poll` becomes `triggered_at`; configuration errors also
    /// disable the feed.
    pub async fn poll_feed(&self, feed: &Feed, triggered_at: DateTime<Utc>) -> Result<PollOutcome> {
        let result = self.poll_inner(feed).await;

        match &result {
            Ok(outcome) => {
                self.store.record_poll(feed.id, triggered_at, None)?;
                match outcome {
                    PollOutcome::NotModified => {
                        debug!(feed = %feed.name, "Feed not modified");
                    }
                    PollOutcome::Polled { total, new, dispatched, .. } => {
                        info!(feed = %feed.name, total, new, dispatched, "Polled feed");
                    }
                }
            }
            Err(FreshetError::Config(e)) => {
                let reason = e.to_string();
                error!(feed = %feed.name, error = %reason, "Disabling feed");
                self.store.disable_feed(feed.id, &reason)?;
                self.store.record_poll(feed.id, triggered_at, Some(&reason))?;
            }
            Err(e) => {
                warn!(feed = %feed.name, error = %e, "Poll failed");
                self.store
                    .record_poll(feed.id, triggered_at, Some(&e.to_string()))?;
            }
        }

        result
    }

    async fn poll_inner(&self, feed: &Feed) -> Result<PollOutcome> {
        let filter = self.check_feed(feed).await?;

        let fetched = self
            .fetcher
            .fetch(&feed.url, feed.etag.as_deref(), feed.last_modified.as_deref())
            .await?;

        let (body, etag, last_modified) = match fetched {
            FetchResult::NotModified => return Ok(PollOutcome::NotModified),
            FetchResult::Content {
                body,
                etag,
                last_modified,
            } => (body, etag, last_modified),
        };

        let candidates = self.normalizer.normalize(&feed.url, feed.dialect, &body)?;
        let total = candidates.len();

        let candidates: Vec<_> = candidates
            .into_iter()
            .filter(|c| filter.matches(&c.title))
            .collect();
        let matched = candidates.len();

        let outcome = self.dedup.dedup(feed.id, candidates)?;
        // Validators are only kept once the document has been fully ingested.
        self.store
            .set_validators(feed.id, etag.as_deref(), last_modified.as_deref())?;

        let new = outcome.new.len();
        let dispatched = self.pool.dispatch(outcome.new);

        Ok(PollOutcome::Polled {
            total,
            matched,
            new,
            known: outcome.known,
            dispatched,
        })
    }

    /// Per-feed configuration that can only be checked at poll time.
    async fn check_feed(&self, feed: &Feed) -> std::result::Result<TitleFilter, ConfigError> {
        let url_error = |reason: String| ConfigError::FeedUrl {
            feed: feed.name.clone(),
            url: feed.url.clone(),
            reason,
        };
        let url = url::Url::parse(&feed.url).map_err(|e| url_error(e.to_string()))?;
        if !matches!(url.scheme(), "http" | "https") {
            return Err(url_error(format!("unsupported scheme {}", url.scheme())));
        }

        let config = self.config.get();
        let feed_config = config.feed(&feed.name);

        // Remote downloaders write wherever they are configured to.
        let downloader = feed_config.map(|f| f.downloader).unwrap_or_default();
        if downloader == DownloaderKind::Http {
            let dir_error = |source| ConfigError::OutputDir {
                feed: feed.name.clone(),
                path: feed.output_dir.clone(),
                source,
            };
            if feed.output_dir.as_os_str().is_empty() {
                return Err(dir_error(std::io::Error::new(
                    std::io::ErrorKind::InvalidInput,
                    "no output_dir and no runtime.output_root configured",
                )));
            }
            tokio::fs::create_dir_all(&feed.output_dir)
                .await
                .map_err(dir_error)?;
        }

        match feed_config {
            Some(feed_config) => feed_config.title_filter(),
            None => Ok(TitleFilter::default()),
        }
    }

    /// Wait for every poll task started so far.
    pub async fn wait_idle(&self) {
        self.tracker.close();
        self.tracker.wait().await;
        self.tracker.reopen();
    }

    /// Main loop. Returns once cancelled and in-flight polls have stopped.
    pub async fn run(self: Arc<Self>) -> Result<()> {
        let mut config_rx = self.config.subscribe();
        let config = config_rx.borrow_and_update().clone();
        self.sync_config(&config)?;

        let mut tick_seconds = config.runtime.tick_seconds;
        let mut ticker = interval(Duration::from_secs(tick_seconds));
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        info!(tick_seconds, "Scheduler started");

        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => break,
                changed = config_rx.changed() => {
                    if changed.is_err() {
                        warn!("Configuration channel closed");
                        break;
                    }
                    let config = config_rx.borrow_and_update().clone();
                    if let Err(e) = self.sync_config(&config) {
                        error!(error = %e, "Failed to apply configuration");
                    }
                    if config.runtime.tick_seconds != tick_seconds {
                        tick_seconds = config.runtime.tick_seconds;
                        ticker = interval(Duration::from_secs(tick_seconds));
                        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
                    }
                }
                _ = ticker.tick() => {
                    let now = Utc::now();
                    if let Err(e) = self.tick(now) {
                        error!(error = %e, "Scheduler tick failed");
                    }
                    if let Err(e) = self.pool.dispatch_due(now) {
                        error!(error = %e, "Failed to dispatch due downloads");
                    }
                }
            }
        }

        info!("Scheduler stopping");
        self.tracker.close();
        self.tracker.wait().await;
        Ok(())
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}
