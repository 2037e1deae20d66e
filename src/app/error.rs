use std::path::PathBuf;

use thiserror::Error;

use crate::domain::{DownloaderKind, EntryStatus};

#[derive(Error, Debug)]
pub enum FreshetError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Fetch error: {0}")]
    Fetch(#[from] FetchError),

    #[error("Feed parsing error: {0}")]
    Parse(String),

    #[error("Download error: {0}")]
    Download(#[from] DownloadError),

    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("Migration error: {0}")]
    Migration(#[from] rusqlite_migration::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Feed not found: {0}")]
    FeedNotFound(String),

    #[error("Entry not found: {0}")]
    EntryNotFound(i64),

    #[error("Entry {id} cannot be re-downloaded while {status}")]
    InvalidTransition { id: i64, status: EntryStatus },

    #[error("{0}")]
    Other(String),
}

impl FreshetError {
    /// Errors that come from the persistent store rather than from a feed.
    pub fn is_store(&self) -> bool {
        matches!(self, Self::Database(_) | Self::Migration(_))
    }
}

pub type Result<T> = std::result::Result<T, FreshetError>;

/// Configuration errors.
///
/// Fatal to a reload or to a single feed, never to the process.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Could not determine config directory")]
    NoConfigDir,

    #[error("Failed to read/write config file at {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Failed to parse config file at {path}: {source}")]
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },

    #[error("Failed to serialize config: {0}")]
    Serialize(#[from] toml::ser::Error),

    #[error("Invalid configuration: {0}")]
    Invalid(String),

    #[error("Invalid {kind} pattern {pattern:?} for feed {feed}: {source}")]
    Pattern {
        feed: String,
        kind: &'static str,
        pattern: String,
        source: regex::Error,
    },

    #[error("Feed {feed} has an invalid URL {url:?}: {reason}")]
    FeedUrl {
        feed: String,
        url: String,
        reason: String,
    },

    #[error("Feed {feed} output directory {path} is unusable: {source}")]
    OutputDir {
        feed: String,
        path: PathBuf,
        source: std::io::Error,
    },
}

/// Transient failure retrieving a feed document.
#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request timed out")]
    Timeout,

    #[error("server responded with {0}")]
    Status(reqwest::StatusCode),

    #[error("HTTP error: {0}")]
    Http(reqwest::Error),
}

impl From<reqwest::Error> for FetchError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            FetchError::Timeout
        } else if let Some(status) = e.status() {
            FetchError::Status(status)
        } else {
            FetchError::Http(e)
        }
    }
}

/// Per-entry download failure.
#[derive(Debug, Error)]
pub enum DownloadError {
    #[error("download timed out")]
    Timeout,

    #[error("server responded with {0}")]
    Status(reqwest::StatusCode),

    #[error("HTTP error: {0}")]
    Http(reqwest::Error),

    #[error("failed writing {path}: {source}")]
    Write {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("unsupported enclosure URL: {0}")]
    UnsupportedUrl(String),

    #[error("download cancelled")]
    Cancelled,

    #[error("{0} downloader is not configured")]
    NotConfigured(DownloaderKind),

    #[error("{backend} rejected the download: {message}")]
    Rejected {
        backend: DownloaderKind,
        message: String,
    },
}

impl From<reqwest::Error> for DownloadError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            DownloadError::Timeout
        } else if let Some(status) = e.status() {
            DownloadError::Status(status)
        } else {
            DownloadError::Http(e)
        }
    }
}
