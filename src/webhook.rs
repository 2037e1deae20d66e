use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use reqwest::Client;
use serde::Serialize;
use serde_json::{json, Value};
use tracing::{debug, error, info};

use crate::app::DownloadError;
use crate::config::ConfigStore;
use crate::domain::{DownloadMode, DownloaderKind, Entry, Feed};

/// What a webhook is told about a finished download.
#[derive(Debug, Clone, Serialize)]
pub struct DownloadNotice {
    pub entry_id: i64,
    pub title: String,
    pub feed: String,
    pub link: Option<String>,
    pub enclosure_url: Option<String>,
    pub downloader: DownloaderKind,
    pub mode: DownloadMode,
    pub file_path: Option<PathBuf>,
    pub completed_at: DateTime<Utc>,
}

impl DownloadNotice {
    pub fn new(
        entry: &Entry,
        feed: &Feed,
        downloader: DownloaderKind,
        mode: DownloadMode,
        file_path: Option<PathBuf>,
    ) -> Self {
        Self {
            entry_id: entry.id,
            title: entry.display_title().to_string(),
            feed: feed.name.clone(),
            link: entry.link.clone(),
            enclosure_url: entry.enclosure_url.clone(),
            downloader,
            mode,
            file_path,
            completed_at: Utc::now(),
        }
    }

    /// Discord-compatible message body. Other receivers get the same JSON
    /// and can read the embed fields.
    fn payload(&self) -> Value {
        let mut embed = json!({
            "title": self.title,
            "timestamp": self.completed_at.to_rfc3339(),
            "fields": [
                {"name": "Feed", "value": self.feed, "inline": true},
                {"name": "Downloader", "value": self.downloader.as_str(), "inline": true},
                {"name": "Mode", "value": self.mode.as_str(), "inline": true},
            ],
        });
        if let Some(link) = &self.link {
            embed["url"] = Value::String(link.clone());
        }
        if let Some(path) = &self.file_path {
            embed["description"] = Value::String(path.display().to_string());
        }

        json!({
            "content": format!("Downloaded: {}", self.title),
            "embeds": [embed],
        })
    }
}

/// Posts [`DownloadNotice`]s to the webhooks in the live configuration.
///
/// Delivery is best effort: failures are logged and never affect the entry.
pub struct WebhookNotifier {
    client: Client,
    config: Arc<ConfigStore>,
}

impl WebhookNotifier {
    pub fn new(
        config: Arc<ConfigStore>,
        timeout: Duration,
        user_agent: &str,
    ) -> Result<Self, DownloadError> {
        let client = Client::builder()
            .timeout(timeout)
            .user_agent(user_agent)
            .build()?;

        Ok(Self { client, config })
    }

    /// Returns how many webhooks accepted the notice.
    pub async fn notify(&self, notice: &DownloadNotice) -> usize {
        let config = self.config.get();
        let payload = notice.payload();
        let mut delivered = 0;

        for hook in config.webhooks.iter().filter(|h| h.enabled) {
            let result = self.client.post(hook.url.trim()).json(&payload).send().await;
            match result {
                Ok(response) if response.status().is_success() => {
                    info!(webhook = %hook.name, entry = notice.entry_id, "Webhook notified");
                    delivered += 1;
                }
                Ok(response) => {
                    error!(webhook = %hook.name, status = %response.status(), "Webhook rejected notification");
                }
                Err(e) => {
                    error!(webhook = %hook.name, error = %e, "Webhook notification failed");
                }
            }
        }

        if delivered == 0 {
            debug!(entry = notice.entry_id, "No webhook notified");
        }
        delivered
    }
}
