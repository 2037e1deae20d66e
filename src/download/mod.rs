//! Enclosure downloads.
//!
//! A [`Downloader`] moves bytes from a URL into a file. A [`RemoteDownloader`]
//! hands the URL to an external client (aria2, qBittorrent) instead. The
//! [`DownloadPool`] owns everything around both: claiming entries,
//! concurrency limits, partial-file cleanup, retries and cancellation.

pub mod aria2;
pub mod http_downloader;
pub mod pool;
pub mod qbittorrent;
pub mod retry;

use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::app::DownloadError;
use crate::domain::{DownloaderKind, Entry};

pub use aria2::Aria2Client;
pub use http_downloader::HttpDownloader;
pub use pool::DownloadPool;
pub use qbittorrent::QbittorrentClient;
pub use retry::RetryPolicy;

const MAX_NAME_LEN: usize = 180;
const PART_SUFFIX: &str = ".part";

#[async_trait]
pub trait Downloader {
    /// Stream `url` into `dest`, returning the number of bytes written.
    ///
    /// Must return [`DownloadError::Cancelled`] promptly once `cancel` fires.
    async fn download(
        &self,
        url: &str,
        dest: &Path,
        cancel: &CancellationToken,
    ) -> Result<u64, DownloadError>;
}

/// An external download client that takes over the transfer.
#[async_trait]
pub trait RemoteDownloader {
    fn kind(&self) -> DownloaderKind;

    /// Queue `url` on the remote side. Returns the remote task id when the
    /// client reports one.
    async fn add(&self, url: &str) -> Result<Option<String>, DownloadError>;

    /// Version string reported by the client; used as a connection check.
    async fn version(&self) -> Result<String, DownloadError>;
}

pub type SharedRemote = Arc<dyn RemoteDownloader + Send + Sync>;

/// File name for an entry's enclosure.
///
/// Uses the last path segment of the enclosure URL; falls back to the title
/// plus a short digest of the entry key (magnet links, bare hosts).
pub fn file_name_for(entry: &Entry) -> String {
    entry
        .enclosure_url
        .as_deref()
        .and_then(url_file_name)
        .unwrap_or_else(|| {
            let title = sanitize(&entry.title);
            if title.is_empty() {
                entry.digest()
            } else {
                format!("{}-{}", title, entry.digest())
            }
        })
}

/// Destination inside `dir`; an existing file of the same name gets the
/// entry digest appended to the stem.
pub fn destination(dir: &Path, entry: &Entry) -> PathBuf {
    let name = file_name_for(entry);
    let path = dir.join(&name);
    // A re-download overwrites the entry's own earlier file.
    if !path.exists() || entry.file_path.as_deref() == Some(path.as_path()) {
        return path;
    }

    let digest = entry.digest();
    if name.contains(&digest) {
        return path;
    }
    let renamed = match name.rsplit_once('.') {
        Some((stem, ext)) if !stem.is_empty() => format!("{}-{}.{}", stem, digest, ext),
        _ => format!("{}-{}", name, digest),
    };
    dir.join(renamed)
}

pub fn part_path(dest: &Path) -> PathBuf {
    let mut name = dest.as_os_str().to_owned();
    name.push(PART_SUFFIX);
    PathBuf::from(name)
}

fn url_file_name(raw: &str) -> Option<String> {
    let url = url::Url::parse(raw).ok()?;
    if !matches!(url.scheme(), "http" | "https") {
        return None;
    }

    let segment = url.path_segments()?.filter(|s| !s.is_empty()).last()?;
    let decoded = urlencoding::decode(segment)
        .map(|s| s.into_owned())
        .unwrap_or_else(|_| segment.to_string());

    Some(sanitize(&decoded)).filter(|name| !name.is_empty() && name != "." && name != "..")
}

fn sanitize(name: &str) -> String {
    let cleaned: String = name
        .chars()
        .map(|c| match c {
            '/' | '\\' | ':' | '*' | '?' | '"' | '<' | '>' | '|' => '_',
            c if c.is_control() => '_',
            c => c,
        })
        .collect();

    let trimmed = cleaned.trim().trim_matches('.').trim();
    let mut out = String::new();
    for c in trimmed.chars() {
        if out.len() + c.len_utf8() > MAX_NAME_LEN {
            break;
        }
        out.push(c);
    }
    out
}
