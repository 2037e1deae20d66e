use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use tokio::fs::File;
use tokio::io::AsyncWriteExt;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::app::DownloadError;
use crate::download::Downloader;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(30);

/// Streams HTTP(S) enclosures to disk chunk by chunk.
pub struct HttpDownloader {
    client: Client,
}

impl HttpDownloader {
    /// `timeout` bounds the whole transfer, body included.
    pub fn new(timeout: Duration, user_agent: &str) -> Result<Self, DownloadError> {
        let client = Client::builder()
            .connect_timeout(CONNECT_TIMEOUT.min(timeout))
            .timeout(timeout)
            .user_agent(user_agent)
            .build()?;

        Ok(Self { client })
    }
}

#[async_trait]
impl Downloader for HttpDownloader {
    async fn download(
        &self,
        url: &str,
        dest: &Path,
        cancel: &CancellationToken,
    ) -> Result<u64, DownloadError> {
        let parsed = url::Url::parse(url).map_err(|_| DownloadError::UnsupportedUrl(url.into()))?;
        if !matches!(parsed.scheme(), "http" | "https") {
            return Err(DownloadError::UnsupportedUrl(url.into()));
        }

        let mut response = tokio::select! {
            _ = cancel.cancelled() => return Err(DownloadError::Cancelled),
            response = self.client.get(parsed).send() => response?,
        };

        if !response.status().is_success() {
            return Err(DownloadError::Status(response.status()));
        }

        let write_err = |source| DownloadError::Write {
            path: dest.to_path_buf(),
            source,
        };

        let mut file = File::create(dest).await.map_err(write_err)?;
        let mut written: u64 = 0;

        loop {
            let chunk = tokio::select! {
                _ = cancel.cancelled() => return Err(DownloadError::Cancelled),
                chunk = response.chunk() => chunk?,
            };
            let Some(chunk) = chunk else {
                break;
            };
            file.write_all(&chunk).await.map_err(write_err)?;
            written += chunk.len() as u64;
        }

        file.flush().await.map_err(write_err)?;
        file.sync_all().await.map_err(write_err)?;

        debug!(url, bytes = written, "Transfer finished");
        Ok(written)
    }
}
