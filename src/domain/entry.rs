use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Download lifecycle of an entry.
///
/// ```text
/// pending -> downloading -> completed
///                        -> pending   (retry, backoff)
///                        -> failed    (retry_count >= max_retries)
/// skipped                             (no enclosure)
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EntryStatus {
    Pending,
    Downloading,
    Completed,
    Failed,
    Skipped,
}

impl EntryStatus {
    pub const ALL: [EntryStatus; 5] = [
        EntryStatus::Pending,
        EntryStatus::Downloading,
        EntryStatus::Completed,
        EntryStatus::Failed,
        EntryStatus::Skipped,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            EntryStatus::Pending => "pending",
            EntryStatus::Downloading => "downloading",
            EntryStatus::Completed => "completed",
            EntryStatus::Failed => "failed",
            EntryStatus::Skipped => "skipped",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            EntryStatus::Completed | EntryStatus::Failed | EntryStatus::Skipped
        )
    }
}

impl fmt::Display for EntryStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown entry status: {0}")]
pub struct ParseStatusError(pub String);

impl FromStr for EntryStatus {
    type Err = ParseStatusError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        EntryStatus::ALL
            .into_iter()
            .find(|status| status.as_str().eq_ignore_ascii_case(s))
            .ok_or_else(|| ParseStatusError(s.to_string()))
    }
}

/// Who performs an entry's transfer.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DownloaderKind {
    /// Streamed into the feed's output directory by this process.
    #[default]
    Http,
    /// Handed to an aria2 daemon over JSON-RPC.
    Aria2,
    /// Handed to a qBittorrent WebUI.
    Qbittorrent,
}

impl DownloaderKind {
    pub const ALL: [DownloaderKind; 3] = [
        DownloaderKind::Http,
        DownloaderKind::Aria2,
        DownloaderKind::Qbittorrent,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            DownloaderKind::Http => "http",
            DownloaderKind::Aria2 => "aria2",
            DownloaderKind::Qbittorrent => "qbittorrent",
        }
    }
}

impl fmt::Display for DownloaderKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DownloaderKind {
    type Err = UnknownValue;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        DownloaderKind::ALL
            .into_iter()
            .find(|kind| kind.as_str().eq_ignore_ascii_case(s.trim()))
            .ok_or_else(|| UnknownValue(s.to_string()))
    }
}

/// Whether a download was queued by polling or requested by hand.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DownloadMode {
    #[default]
    Auto,
    Manual,
}

impl DownloadMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            DownloadMode::Auto => "auto",
            DownloadMode::Manual => "manual",
        }
    }
}

impl fmt::Display for DownloadMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DownloadMode {
    type Err = UnknownValue;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "auto" => Ok(DownloadMode::Auto),
            "manual" => Ok(DownloadMode::Manual),
            other => Err(UnknownValue(other.to_string())),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown value: {0}")]
pub struct UnknownValue(pub String);

/// A normalized item from a fetched feed document, before dedup.
#[derive(Debug, Clone, PartialEq)]
pub struct CandidateEntry {
    pub title: String,
    pub link: Option<String>,
    pub guid: Option<String>,
    pub published_at: Option<DateTime<Utc>>,
    pub enclosure_url: Option<String>,
}

impl CandidateEntry {
    /// Identity of the entry within its feed: the GUID, else the link.
    pub fn key(&self) -> Option<&str> {
        fn present(v: &Option<String>) -> Option<&str> {
            v.as_deref().map(str::trim).filter(|k| !k.is_empty())
        }
        present(&self.guid).or_else(|| present(&self.link))
    }

    /// Case-folded key used for comparisons.
    pub fn normalized_key(&self) -> Option<String> {
        self.key().map(normalize_key)
    }
}

pub fn normalize_key(key: &str) -> String {
    key.trim().to_lowercase()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Entry {
    pub id: i64,
    pub feed_id: i64,
    pub guid_or_link: String,
    pub title: String,
    pub link: Option<String>,
    pub published_at: Option<DateTime<Utc>>,
    pub enclosure_url: Option<String>,
    pub status: EntryStatus,
    pub retry_count: u32,
    pub last_attempt: Option<DateTime<Utc>>,
    pub next_attempt: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub file_path: Option<PathBuf>,
    /// Backend that completed the entry, or the one requested for a manual
    /// re-download that hasn't run yet.
    pub downloader: Option<DownloaderKind>,
    pub mode: DownloadMode,
    pub created_at: DateTime<Utc>,
}

impl Entry {
    /// Short, stable digest of the entry identity, used for fallback file names.
    pub fn digest(&self) -> String {
        let mut hasher = Sha256::new();
        hasher.update(self.feed_id.to_le_bytes());
        hasher.update(normalize_key(&self.guid_or_link).as_bytes());
        let hex = hex::encode(hasher.finalize());
        hex[..12].to_string()
    }

    pub fn display_title(&self) -> &str {
        if self.title.is_empty() {
            "(Untitled)"
        } else {
            &self.title
        }
    }
}

/// Filter for listing entries.
#[derive(Debug, Clone, Default)]
pub struct EntryQuery {
    pub feed_id: Option<i64>,
    pub status: Option<EntryStatus>,
    /// Case-insensitive substring match on the title.
    pub title: Option<String>,
    pub limit: Option<usize>,
    pub offset: usize,
}
