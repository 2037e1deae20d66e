use std::time::Duration;

use tracing::info;

use crate::app::{AppContext, FreshetError, Result};
use crate::config::ConfigStore;
use crate::domain::{DownloaderKind, EntryQuery, EntryStatus};
use crate::scheduler::PollOutcome;
use crate::store::Store;

const CONFIG_WATCH_PERIOD: Duration = Duration::from_secs(5);

/// Run the scheduler and config watcher until Ctrl-C / SIGTERM.
pub async fn run(ctx: &AppContext) -> Result<()> {
    let watcher = ctx
        .config
        .spawn_watcher(CONFIG_WATCH_PERIOD, ctx.cancel.child_token());
    let mut scheduler = tokio::spawn(ctx.scheduler.clone().run());

    let finished = tokio::select! {
        signal = shutdown_signal() => {
            signal?;
            info!("Shutdown requested");
            None
        }
        result = &mut scheduler => Some(result),
    };

    ctx.shutdown().await;
    let result = match finished {
        Some(result) => join_scheduler(result),
        None => join_scheduler(scheduler.await),
    };

    if let Some(watcher) = watcher {
        let _ = watcher.await;
    }
    result
}

fn join_scheduler(result: std::result::Result<Result<()>, tokio::task::JoinError>) -> Result<()> {
    result.map_err(|e| FreshetError::Other(format!("scheduler task failed: {}", e)))?
}

async fn shutdown_signal() -> Result<()> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        let mut sigterm = signal(SignalKind::terminate())?;
        tokio::select! {
            result = tokio::signal::ctrl_c() => result?,
            _ = sigterm.recv() => {}
        }
    }

    #[cfg(not(unix))]
    tokio::signal::ctrl_c().await?;

    Ok(())
}

/// Poll one feed by name and wait for the downloads it queued.
pub async fn poll(ctx: &AppContext, name: &str) -> Result<()> {
    let feed = ctx.service().feed_by_name(name)?;
    if !feed.enabled {
        return Err(FreshetError::Other(format!(
            "feed {} is disabled{}",
            feed.name,
            feed.last_error
                .as_deref()
                .map(|e| format!(": {}", e))
                .unwrap_or_default()
        )));
    }

    match ctx.scheduler.poll_once(feed.id).await? {
        None => {
            println!("A poll of {} is already running", feed.name);
            return Ok(());
        }
        Some(PollOutcome::NotModified) => {
            println!("{}: not modified", feed.name);
        }
        Some(PollOutcome::Polled {
            total,
            matched,
            new,
            known,
            dispatched,
        }) => {
            println!(
                "{}: {} entries, {} matched filters, {} new, {} already known",
                feed.name, total, matched, new, known
            );
            if dispatched > 0 {
                println!("Downloading {} enclosures...", dispatched);
            }
        }
    }

    ctx.pool.wait_idle().await;

    let counts = ctx.store.entry_counts(Some(feed.id))?;
    println!(
        "Done: {} completed, {} pending, {} failed",
        counts.completed, counts.pending, counts.failed
    );
    Ok(())
}

pub fn list_feeds(ctx: &AppContext) -> Result<()> {
    let feeds = ctx.service().list_feeds()?;

    if feeds.is_empty() {
        println!("No feeds configured");
        return Ok(());
    }

    for status in feeds {
        let feed = &status.feed;
        let state = if !feed.enabled {
            "disabled"
        } else if status.polling {
            "polling"
        } else {
            "enabled"
        };
        let last_poll = feed
            .last_poll
            .map(|t| t.format("%Y-%m-%d %H:%M:%S").to_string())
            .unwrap_or_else(|| "never".to_string());

        println!("{} [{}]\n  {}", feed.name, state, feed.url);
        println!(
            "  last poll: {}  every {}s  -> {}",
            last_poll,
            feed.interval_secs,
            feed.output_dir.display()
        );
        let c = status.entries;
        println!(
            "  {} pending, {} downloading, {} completed, {} failed, {} skipped",
            c.pending, c.downloading, c.completed, c.failed, c.skipped
        );
        if let Some(err) = &feed.last_error {
            println!("  error: {}", err);
        }
    }

    Ok(())
}

pub struct EntryFilter {
    pub feed: Option<String>,
    pub status: Option<EntryStatus>,
    pub title: Option<String>,
    pub limit: usize,
    pub offset: usize,
}

pub fn list_entries(ctx: &AppContext, filter: EntryFilter, json: bool) -> Result<()> {
    let service = ctx.service();
    let feed_id = match &filter.feed {
        Some(name) => Some(service.feed_by_name(name)?.id),
        None => None,
    };

    let page = service.list_entries(&EntryQuery {
        feed_id,
        status: filter.status,
        title: filter.title,
        limit: Some(filter.limit),
        offset: filter.offset,
    })?;

    if json {
        let out = serde_json::to_string_pretty(&page)
            .map_err(|e| FreshetError::Other(e.to_string()))?;
        println!("{}", out);
        return Ok(());
    }

    if page.entries.is_empty() {
        println!("No entries");
        return Ok(());
    }

    for entry in &page.entries {
        let date = entry
            .published_at
            .map(|d| d.format("%Y-%m-%d").to_string())
            .unwrap_or_else(|| "          ".to_string());

        println!(
            "{:>6} {:<11} {} {}",
            entry.id,
            entry.status.as_str(),
            date,
            entry.display_title()
        );
        let show_error = matches!(entry.status, EntryStatus::Pending | EntryStatus::Failed);
        if let Some(err) = entry.last_error.as_deref().filter(|_| show_error) {
            println!("{:>6} {:<11} retry {}: {}", "", "", entry.retry_count, err);
        }
    }

    let first = filter.offset + 1;
    let last = filter.offset + page.entries.len();
    println!("\nShowing {}-{} of {}", first, last, page.total);
    Ok(())
}

/// Re-download one entry and wait for the attempt to finish.
pub async fn retry(
    ctx: &AppContext,
    entry_id: i64,
    downloader: Option<DownloaderKind>,
) -> Result<()> {
    let service = ctx.service();
    let entry = service.redownload(entry_id, downloader)?;
    println!("Retrying {} ({})", entry.display_title(), entry.id);

    ctx.pool.wait_idle().await;

    let entry = service.get_entry(entry_id)?;
    match entry.status {
        EntryStatus::Completed => match entry.file_path.as_deref() {
            Some(path) => println!("Completed: {}", path.display()),
            None => println!("Handed to {}", entry.downloader.unwrap_or_default()),
        },
        status => println!(
            "Now {}{}",
            status,
            entry
                .last_error
                .as_deref()
                .map(|e| format!(": {}", e))
                .unwrap_or_default()
        ),
    }
    Ok(())
}

/// Print what the configuration resolves to. Loading it already validated it.
pub fn check_config(config: &ConfigStore) -> Result<()> {
    let config_snapshot = config.get();
    let rt = &config_snapshot.runtime;

    if let Some(path) = config.path() {
        println!("Configuration: {}", path.display());
    }
    println!(
        "Limits: {} feeds, {} downloads ({} per feed), {} attempts, backoff {}s..{}s",
        rt.max_concurrent_feeds,
        rt.max_concurrent_downloads,
        if rt.max_downloads_per_feed == 0 {
            "unbounded".to_string()
        } else {
            rt.max_downloads_per_feed.to_string()
        },
        rt.max_retries,
        rt.backoff_base_seconds,
        rt.backoff_max_seconds
    );
    if let Some(aria2) = &config_snapshot.aria2 {
        println!("aria2: {}", aria2.rpc);
    }
    if let Some(qbittorrent) = &config_snapshot.qbittorrent {
        println!("qBittorrent: {}", qbittorrent.host);
    }
    let hooks = config_snapshot.webhooks.iter().filter(|h| h.enabled).count();
    if hooks > 0 {
        println!("Webhooks: {} enabled", hooks);
    }

    if config_snapshot.feeds.is_empty() {
        println!("No feeds configured");
        return Ok(());
    }

    for spec in config_snapshot.feed_specs() {
        let dialect = spec.dialect.resolve(&spec.url);
        let downloader = config_snapshot
            .feed(&spec.name)
            .map(|f| f.downloader)
            .unwrap_or_default();
        let output = if downloader != DownloaderKind::Http {
            downloader.to_string()
        } else if spec.output_dir.as_os_str().is_empty() {
            "(no output directory)".to_string()
        } else {
            spec.output_dir.display().to_string()
        };
        println!(
            "{}{}\n  {} every {}s, dialect {}\n  -> {}",
            spec.name,
            if spec.enabled { "" } else { " (disabled)" },
            spec.url,
            spec.interval_secs,
            dialect.as_str(),
            output
        );
    }

    Ok(())
}
