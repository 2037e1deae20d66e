//! # Freshet
//!
//! Polls RSS/Atom feeds, remembers every entry it has seen and downloads the
//! enclosures of new ones.
//!
//! ## Architecture
//!
//! ```text
//! Scheduler → Fetcher → Normalizer → Deduplicator → Store → DownloadPool → Store
//! ```
//!
//! - [`scheduler`]: decides when each feed is due, one poll per feed at a time
//! - [`fetcher`]: HTTP client with ETag/conditional request support
//! - [`normalizer`]: turns RSS/Atom/JSON Feed documents into candidate entries
//! - [`dedup`]: keeps a feed's entries unique across polls
//! - [`download`]: bounded download workers with retry and backoff, either
//!   over HTTP or handed to aria2 / qBittorrent
//! - [`webhook`]: notifications after each completed download
//! - [`store`]: SQLite persistence layer
//!
//! ## Quick Start
//!
//! ```bash
//! # Check what the configuration resolves to
//! freshet check-config
//!
//! # Poll one feed and download what is new
//! freshet poll my-podcast
//!
//! # Keep polling until Ctrl-C
//! freshet run
//! ```

/// Application context, status interface and error handling.
///
/// The [`AppContext`](app::AppContext) struct wires together all components:
/// config, store, fetcher, download pool, scheduler.
pub mod app;

/// Command-line interface using clap.
///
/// - `run` - Poll feeds on schedule until interrupted
/// - `poll <feed>` - Poll one feed now
/// - `feeds` / `entries` - Show state
/// - `retry <entry-id> [--downloader <kind>]` - Re-download an entry
/// - `check-config` - Validate the configuration
pub mod cli;

/// Configuration loading, validation and hot reload.
///
/// Loads from `~/.config/freshet/config.toml`.
pub mod config;

/// Batch deduplication of candidate entries.
pub mod dedup;

/// Core domain models.
///
/// - [`Feed`](domain::Feed): a polled source and its poll state
/// - [`Entry`](domain::Entry): one seen item and its download state
/// - [`Dialect`](domain::Dialect): per-site enclosure rules
pub mod domain;

/// Enclosure downloads.
///
/// - [`Downloader`](download::Downloader): Async trait for transfers
/// - [`HttpDownloader`](download::HttpDownloader): streaming reqwest implementation
/// - [`RemoteDownloader`](download::RemoteDownloader): aria2 JSON-RPC and qBittorrent Web API clients
/// - [`DownloadPool`](download::DownloadPool): concurrency limits, retries, cancellation
pub mod download;

/// HTTP fetching with conditional request support.
///
/// - [`Fetcher`](fetcher::Fetcher): Async trait for feed fetching
/// - [`HttpFetcher`](fetcher::HttpFetcher): reqwest-based implementation
pub mod fetcher;

/// Feed parsing and normalization.
///
/// Converts RSS 0.9x/1.0/2.0, Atom 0.3/1.0, and JSON Feed 1.0
/// into [`CandidateEntry`](domain::CandidateEntry) values.
pub mod normalizer;

/// Poll scheduling.
pub mod scheduler;

/// SQLite persistence layer.
///
/// - [`Store`](store::Store): Trait defining storage operations
/// - [`SqliteStore`](store::SqliteStore): SQLite implementation
pub mod store;

/// Download notifications.
///
/// Posts a JSON message (Discord embed layout) to every enabled webhook.
pub mod webhook;
