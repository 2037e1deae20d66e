//! Configuration for the poll/download engine.
//!
//! Configuration is read from `~/.config/freshet/config.toml` unless a path is
//! given. If the file doesn't exist, a default configuration with comments is
//! created. Readers get immutable snapshots through [`ConfigStore`].

pub mod filter;
pub mod store;

pub use filter::TitleFilter;
pub use store::ConfigStore;

use std::collections::HashSet;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use url::Url;

use crate::app::ConfigError;
use crate::domain::{Dialect, DownloaderKind, FeedSpec};

const LOG_LEVELS: &[&str] = &["trace", "debug", "info", "warn", "error"];

/// Main configuration struct.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// SQLite database path (default: data dir)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub database: Option<PathBuf>,
    pub runtime: RuntimeConfig,
    pub log: LogConfig,
    /// aria2 JSON-RPC endpoint, required by feeds with `downloader = "aria2"`
    #[serde(skip_serializing_if = "Option::is_none")]
    pub aria2: Option<Aria2Config>,
    /// qBittorrent Web API, required by feeds with `downloader = "qbittorrent"`
    #[serde(skip_serializing_if = "Option::is_none")]
    pub qbittorrent: Option<QbittorrentConfig>,
    /// Notified after every completed download
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub webhooks: Vec<WebhookConfig>,
    pub feeds: Vec<FeedConfig>,
}

/// Global engine limits and retry policy.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    pub max_concurrent_feeds: usize,
    pub max_concurrent_downloads: usize,
    /// 0 = no per-feed limit
    pub max_downloads_per_feed: usize,
    pub max_retries: u32,
    pub backoff_base_seconds: u64,
    pub backoff_max_seconds: u64,
    pub fetch_timeout_seconds: u64,
    pub download_timeout_seconds: u64,
    /// How often the scheduler wakes up to look for due feeds
    pub tick_seconds: u64,
    /// Poll interval for feeds that don't set one (default: 6 hours)
    pub default_interval_seconds: u64,
    /// Base directory for feeds without an absolute `output_dir`
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output_root: Option<PathBuf>,
    pub user_agent: String,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            max_concurrent_feeds: 4,
            max_concurrent_downloads: 4,
            max_downloads_per_feed: 0,
            max_retries: 3,
            backoff_base_seconds: 30,
            backoff_max_seconds: 3600,
            fetch_timeout_seconds: 30,
            download_timeout_seconds: 1800,
            tick_seconds: 15,
            default_interval_seconds: 6 * 3600,
            output_root: None,
            user_agent: concat!("freshet/", env!("CARGO_PKG_VERSION")).to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    pub level: String,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Aria2Config {
    pub rpc: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub secret: Option<String>,
    /// Download directory passed to aria2 (default: aria2's own)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dir: Option<PathBuf>,
}

impl Default for Aria2Config {
    fn default() -> Self {
        Self {
            rpc: "http://127.0.0.1:6800/jsonrpc".to_string(),
            secret: None,
            dir: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct QbittorrentConfig {
    pub host: String,
    pub username: String,
    pub password: String,
}

impl Default for QbittorrentConfig {
    fn default() -> Self {
        Self {
            host: "http://127.0.0.1:8080".to_string(),
            username: "admin".to_string(),
            password: String::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WebhookConfig {
    pub name: String,
    pub url: String,
    #[serde(default = "default_true")]
    pub enabled: bool,
}

/// One configured feed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeedConfig {
    pub name: String,
    pub url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub interval_seconds: Option<u64>,
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output_dir: Option<PathBuf>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub include: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub exclude: Vec<String>,
    #[serde(default)]
    pub dialect: Dialect,
    #[serde(default)]
    pub downloader: DownloaderKind,
}

fn default_true() -> bool {
    true
}

impl FeedConfig {
    pub fn new(name: impl Into<String>, url: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            url: url.into(),
            interval_seconds: None,
            enabled: true,
            output_dir: None,
            include: Vec::new(),
            exclude: Vec::new(),
            dialect: Dialect::Auto,
            downloader: DownloaderKind::Http,
        }
    }

    pub fn title_filter(&self) -> Result<TitleFilter, ConfigError> {
        TitleFilter::compile(&self.name, &self.include, &self.exclude)
    }

    /// Relative `output_dir` values (and feeds without one) live under `output_root`.
    pub fn resolved_output_dir(&self, runtime: &RuntimeConfig) -> Option<PathBuf> {
        match (&self.output_dir, &runtime.output_root) {
            (Some(dir), _) if dir.is_absolute() => Some(dir.clone()),
            (Some(dir), Some(root)) => Some(root.join(dir)),
            (Some(dir), None) => Some(dir.clone()),
            (None, Some(root)) => Some(root.join(&self.name)),
            (None, None) => None,
        }
    }
}

fn check_http_url(field: &str, value: &str) -> Result<(), ConfigError> {
    match Url::parse(value.trim()) {
        Ok(url) if matches!(url.scheme(), "http" | "https") => Ok(()),
        _ => Err(ConfigError::Invalid(format!(
            "{} must be an http(s) URL, got {:?}",
            field, value
        ))),
    }
}

impl Config {
    /// Load configuration from the default path.
    ///
    /// If the config file doesn't exist, creates a default one with comments.
    pub fn load() -> Result<Self, ConfigError> {
        let config_path = Self::default_config_path()?;
        Self::load_or_create(&config_path)
    }

    pub fn load_or_create(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            Self::create_default_config(path)?;
        }
        Self::load_from(path)
    }

    /// Read, parse and validate a config file. Nothing is returned unless
    /// the whole file is valid.
    pub fn load_from(path: &Path) -> Result<Self, ConfigError> {
        let content = fs::read_to_string(path).map_err(|e| ConfigError::Io {
            path: path.to_path_buf(),
            source: e,
        })?;

        let config: Config = toml::from_str(&content).map_err(|e| ConfigError::Parse {
            path: path.to_path_buf(),
            source: e,
        })?;

        config.validate()?;
        Ok(config)
    }

    /// Get the default config file path: `~/.config/freshet/config.toml`
    pub fn default_config_path() -> Result<PathBuf, ConfigError> {
        let config_dir = dirs::config_dir().ok_or(ConfigError::NoConfigDir)?;
        Ok(config_dir.join("freshet").join("config.toml"))
    }

    /// Checks everything that would make the configuration as a whole
    /// unusable. Per-feed URL and output directory problems are left to the
    /// scheduler, which disables only the affected feed.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let rt = &self.runtime;

        if rt.max_concurrent_feeds == 0 {
            return Err(ConfigError::Invalid(
                "runtime.max_concurrent_feeds must be at least 1".into(),
            ));
        }
        if rt.max_concurrent_downloads == 0 {
            return Err(ConfigError::Invalid(
                "runtime.max_concurrent_downloads must be at least 1".into(),
            ));
        }
        if rt.max_retries == 0 {
            return Err(ConfigError::Invalid(
                "runtime.max_retries must be at least 1".into(),
            ));
        }
        if rt.backoff_max_seconds < rt.backoff_base_seconds {
            return Err(ConfigError::Invalid(format!(
                "runtime.backoff_max_seconds ({}) is below backoff_base_seconds ({})",
                rt.backoff_max_seconds, rt.backoff_base_seconds
            )));
        }
        for (field, value) in [
            ("tick_seconds", rt.tick_seconds),
            ("fetch_timeout_seconds", rt.fetch_timeout_seconds),
            ("download_timeout_seconds", rt.download_timeout_seconds),
            ("default_interval_seconds", rt.default_interval_seconds),
        ] {
            if value == 0 {
                return Err(ConfigError::Invalid(format!(
                    "runtime.{} must be greater than 0",
                    field
                )));
            }
        }

        if !LOG_LEVELS.contains(&self.log.level.to_ascii_lowercase().as_str()) {
            return Err(ConfigError::Invalid(format!(
                "log.level must be one of {}, got {:?}",
                LOG_LEVELS.join(", "),
                self.log.level
            )));
        }

        let mut seen = HashSet::new();
        for feed in &self.feeds {
            let name = feed.name.trim();
            if name.is_empty() {
                return Err(ConfigError::Invalid(format!(
                    "feed with url {} has an empty name",
                    feed.url
                )));
            }
            if !seen.insert(name.to_lowercase()) {
                return Err(ConfigError::Invalid(format!(
                    "duplicate feed name: {}",
                    feed.name
                )));
            }
            if feed.interval_seconds == Some(0) {
                return Err(ConfigError::Invalid(format!(
                    "feed {}: interval_seconds must be greater than 0",
                    feed.name
                )));
            }
            feed.title_filter()?;

            if !self.downloader_configured(feed.downloader) {
                return Err(ConfigError::Invalid(format!(
                    "feed {} uses the {} downloader but [{}] is not configured",
                    feed.name, feed.downloader, feed.downloader
                )));
            }
        }

        if let Some(aria2) = &self.aria2 {
            check_http_url("aria2.rpc", &aria2.rpc)?;
        }
        if let Some(qbittorrent) = &self.qbittorrent {
            check_http_url("qbittorrent.host", &qbittorrent.host)?;
        }
        for hook in &self.webhooks {
            check_http_url(&format!("webhook {}", hook.name), &hook.url)?;
        }

        Ok(())
    }

    /// Whether the section a downloader needs is present.
    pub fn downloader_configured(&self, kind: DownloaderKind) -> bool {
        match kind {
            DownloaderKind::Http => true,
            DownloaderKind::Aria2 => self.aria2.is_some(),
            DownloaderKind::Qbittorrent => self.qbittorrent.is_some(),
        }
    }

    pub fn feed(&self, name: &str) -> Option<&FeedConfig> {
        self.feeds
            .iter()
            .find(|f| f.name.trim().eq_ignore_ascii_case(name.trim()))
    }

    /// Store-facing view of the configured feeds.
    pub fn feed_specs(&self) -> Vec<FeedSpec> {
        self.feeds
            .iter()
            .map(|f| FeedSpec {
                name: f.name.trim().to_string(),
                url: f.url.trim().to_string(),
                interval_secs: f
                    .interval_seconds
                    .unwrap_or(self.runtime.default_interval_seconds),
                enabled: f.enabled,
                output_dir: f.resolved_output_dir(&self.runtime).unwrap_or_default(),
                dialect: f.dialect,
            })
            .collect()
    }

    pub fn to_toml(&self) -> Result<String, ConfigError> {
        Ok(toml::to_string_pretty(self)?)
    }

    /// Create a default config file with comments.
    fn create_default_config(path: &Path) -> Result<(), ConfigError> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|e| ConfigError::Io {
                path: parent.to_path_buf(),
                source: e,
            })?;
        }

        let mut file = fs::File::create(path).map_err(|e| ConfigError::Io {
            path: path.to_path_buf(),
            source: e,
        })?;

        file.write_all(Self::default_config_content().as_bytes())
            .map_err(|e| ConfigError::Io {
                path: path.to_path_buf(),
                source: e,
            })?;

        Ok(())
    }

    /// Generate the default config file content with comments.
    fn default_config_content() -> String {
        r##"# Freshet configuration
#
# Changes to this file are picked up while `freshet run` is active.
# An invalid edit is rejected and the previous configuration stays in use.

# SQLite database path (default: <data dir>/freshet/freshet.db)
# database = "/var/lib/freshet/freshet.db"

[runtime]
# Feeds polled at the same time
max_concurrent_feeds = 4

# Downloads running at the same time, across all feeds
max_concurrent_downloads = 4

# Downloads running at the same time for a single feed (0 = no limit)
max_downloads_per_feed = 0

# Attempts per entry before it is marked failed
max_retries = 3

# Retry delay: backoff_base_seconds * 2^(attempt - 1), capped at backoff_max_seconds
backoff_base_seconds = 30
backoff_max_seconds = 3600

fetch_timeout_seconds = 30
download_timeout_seconds = 1800

# Scheduler wake-up period
tick_seconds = 15

# Poll interval for feeds without interval_seconds
default_interval_seconds = 21600

# Feeds without an absolute output_dir are stored below this directory
# output_root = "/data/freshet"

[log]
# trace, debug, info, warn, error (RUST_LOG overrides this)
level = "info"

# Remote downloaders. A feed hands its enclosures to one of these with
# downloader = "aria2" or downloader = "qbittorrent".
# [aria2]
# rpc = "http://127.0.0.1:6800/jsonrpc"
# secret = "token"
# dir = "/data/aria2"
#
# [qbittorrent]
# host = "http://127.0.0.1:8080"
# username = "admin"
# password = "adminadmin"

# Called with a JSON message after every completed download
# [[webhooks]]
# name = "discord"
# url = "https://discord.com/api/webhooks/..."
# enabled = true

# [[feeds]]
# name = "example"
# url = "https://example.com/feed.xml"
# interval_seconds = 3600
# enabled = true
# output_dir = "/data/freshet/example"
# Case-insensitive regular expressions matched against entry titles
# include = ["1080p"]
# exclude = ["720p"]
# auto, generic, mikan, nyaa, dmhy
# dialect = "auto"
# http, aria2, qbittorrent
# downloader = "http"
"##
        .to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn feed(name: &str) -> FeedConfig {
        FeedConfig::new(name, format!("https://example.com/{}.xml", name))
    }

    #[test]
    fn test_default_config_deserializes() {
        let content = Config::default_config_content();
        let config: Config = toml::from_str(&content).expect("Default config should be valid TOML");

        assert_eq!(config.runtime.max_retries, 3);
        assert_eq!(config.runtime.backoff_base_seconds, 30);
        assert!(config.feeds.is_empty());
        config.validate().unwrap();
    }

    #[test]
    fn test_partial_config() {
        let content = r#"
[runtime]
max_concurrent_downloads = 8

[[feeds]]
name = "podcast"
url = "https://example.com/podcast.xml"
output_dir = "/tmp/podcast"
"#;
        let config: Config = toml::from_str(content).expect("Partial config should work");

        assert_eq!(config.runtime.max_concurrent_downloads, 8);
        assert_eq!(config.runtime.max_concurrent_feeds, 4);
        assert_eq!(config.feeds.len(), 1);
        assert!(config.feeds[0].enabled);
        assert_eq!(config.feeds[0].dialect, Dialect::Auto);
        config.validate().unwrap();
    }

    #[test]
    fn test_empty_config() {
        let config: Config = toml::from_str("").expect("Empty config should work");
        assert_eq!(config, Config::default());
    }

    #[test]
    fn test_duplicate_feed_names_rejected() {
        let mut config = Config::default();
        config.feeds.push(feed("Anime"));
        config.feeds.push(feed("anime "));

        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("duplicate feed name"));
    }

    #[test]
    fn test_bad_pattern_rejected() {
        let mut config = Config::default();
        let mut f = feed("a");
        f.include = vec!["(unclosed".into()];
        config.feeds.push(f);

        assert!(matches!(
            config.validate(),
            Err(ConfigError::Pattern { .. })
        ));
    }

    #[test]
    fn test_runtime_limits_validated() {
        let mut config = Config::default();
        config.runtime.max_concurrent_downloads = 0;
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.runtime.backoff_base_seconds = 100;
        config.runtime.backoff_max_seconds = 10;
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.log.level = "loud".into();
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.log.level = "DEBUG".into();
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_output_dir_resolution() {
        let mut runtime = RuntimeConfig::default();
        let mut f = feed("show");

        assert_eq!(f.resolved_output_dir(&runtime), None);

        runtime.output_root = Some(PathBuf::from("/data"));
        assert_eq!(
            f.resolved_output_dir(&runtime),
            Some(PathBuf::from("/data/show"))
        );

        f.output_dir = Some(PathBuf::from("tv"));
        assert_eq!(
            f.resolved_output_dir(&runtime),
            Some(PathBuf::from("/data/tv"))
        );

        f.output_dir = Some(PathBuf::from("/mnt/media"));
        assert_eq!(
            f.resolved_output_dir(&runtime),
            Some(PathBuf::from("/mnt/media"))
        );
    }

    #[test]
    fn test_feed_specs_apply_defaults() {
        let mut config = Config::default();
        let mut f = feed("a");
        f.output_dir = Some(PathBuf::from("/tmp/a"));
        config.feeds.push(f);
        let mut g = feed("b");
        g.interval_seconds = Some(60);
        config.feeds.push(g);

        let specs = config.feed_specs();
        assert_eq!(specs[0].interval_secs, 6 * 3600);
        assert_eq!(specs[0].output_dir, PathBuf::from("/tmp/a"));
        assert_eq!(specs[1].interval_secs, 60);
        assert_eq!(specs[1].output_dir, PathBuf::new());
    }

    #[test]
    fn test_load_or_create_writes_default() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("config.toml");

        let config = Config::load_or_create(&path).unwrap();
        assert!(path.exists());
        assert_eq!(config.runtime, RuntimeConfig::default());
    }

    #[test]
    fn test_to_toml_round_trip() {
        let mut config = Config::default();
        let mut f = feed("a");
        f.include = vec!["1080p".into()];
        f.dialect = Dialect::Nyaa;
        config.feeds.push(f);

        let text = config.to_toml().unwrap();
        let parsed: Config = toml::from_str(&text).unwrap();
        assert_eq!(parsed, config);
    }

    #[test]
    fn test_remote_downloader_sections() {
        let content = r#"
[aria2]
secret = "s3cret"

[[webhooks]]
name = "chat"
url = "https://hooks.example.com/abc"

[[feeds]]
name = "anime"
url = "https://mikanani.me/RSS/Bangumi?bangumiId=1"
downloader = "aria2"
"#;
        let config: Config = toml::from_str(content).unwrap();
        config.validate().unwrap();

        let aria2 = config.aria2.as_ref().unwrap();
        assert_eq!(aria2.rpc, "http://127.0.0.1:6800/jsonrpc");
        assert_eq!(aria2.secret.as_deref(), Some("s3cret"));
        assert_eq!(config.feeds[0].downloader, DownloaderKind::Aria2);
        assert!(config.webhooks[0].enabled);
        assert!(config.qbittorrent.is_none());
    }

    #[test]
    fn test_downloader_requires_its_section() {
        let mut config = Config::default();
        let mut f = feed("a");
        f.downloader = DownloaderKind::Qbittorrent;
        config.feeds.push(f);

        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("[qbittorrent] is not configured"));

        config.qbittorrent = Some(QbittorrentConfig::default());
        config.validate().unwrap();
    }

    #[test]
    fn test_webhook_url_must_be_http() {
        let mut config = Config::default();
        config.webhooks.push(WebhookConfig {
            name: "bad".into(),
            url: "ftp://example.com/hook".into(),
            enabled: true,
        });
        assert!(config.validate().is_err());

        config.webhooks[0].url = "https://example.com/hook".into();
        config.validate().unwrap();

        config.aria2 = Some(Aria2Config {
            rpc: "not a url".into(),
            ..Aria2Config::default()
        });
        assert!(config.validate().is_err());
    }
}
