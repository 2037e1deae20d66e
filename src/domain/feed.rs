use std::path::PathBuf;
use std::str::FromStr;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

/// Per-site rules for pulling the enclosure out of an entry.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Dialect {
    /// Pick a concrete dialect from the feed host.
    #[default]
    Auto,
    Generic,
    Mikan,
    Nyaa,
    Dmhy,
}

const DIALECT_HOSTS: &[(Dialect, &[&str])] = &[
    (Dialect::Mikan, &["mikanime.tv", "mikanani.me"]),
    (Dialect::Nyaa, &["nyaa.si"]),
    (Dialect::Dmhy, &["dmhy.org"]),
];

impl Dialect {
    pub fn as_str(&self) -> &'static str {
        match self {
            Dialect::Auto => "auto",
            Dialect::Generic => "generic",
            Dialect::Mikan => "mikan",
            Dialect::Nyaa => "nyaa",
            Dialect::Dmhy => "dmhy",
        }
    }

    /// Resolve `Auto` against the feed URL. Concrete dialects are returned as-is.
    pub fn resolve(self, feed_url: &str) -> Dialect {
        if self != Dialect::Auto {
            return self;
        }

        let host = url::Url::parse(feed_url)
            .ok()
            .and_then(|u| u.host_str().map(|h| h.to_ascii_lowercase()));

        let Some(host) = host else {
            return Dialect::Generic;
        };

        DIALECT_HOSTS
            .iter()
            .find(|(_, domains)| domains.iter().any(|d| host.ends_with(d)))
            .map(|(dialect, _)| *dialect)
            .unwrap_or(Dialect::Generic)
    }
}

impl FromStr for Dialect {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "auto" => Ok(Dialect::Auto),
            "generic" | "default" => Ok(Dialect::Generic),
            "mikan" => Ok(Dialect::Mikan),
            "nyaa" => Ok(Dialect::Nyaa),
            "dmhy" => Ok(Dialect::Dmhy),
            other => Err(format!("unknown dialect: {}", other)),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Feed {
    pub id: i64,
    pub name: String,
    pub url: String,
    pub interval_secs: u64,
    pub enabled: bool,
    pub output_dir: PathBuf,
    pub dialect: Dialect,
    pub etag: Option<String>,
    pub last_modified: Option<String>,
    pub last_poll: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl Feed {
    pub fn new(name: impl Into<String>, url: impl Into<String>) -> Self {
        Self {
            id: 0,
            name: name.into(),
            url: url.into(),
            interval_secs: 3600,
            enabled: true,
            output_dir: PathBuf::from("."),
            dialect: Dialect::Auto,
            etag: None,
            last_modified: None,
            last_poll: None,
            last_error: None,
            created_at: Utc::now(),
        }
    }

    pub fn interval(&self) -> Duration {
        Duration::seconds(self.interval_secs.min(i64::MAX as u64) as i64)
    }

    /// A feed is due when it was never polled or its interval has elapsed.
    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        match self.last_poll {
            None => true,
            Some(last) => now.signed_duration_since(last) >= self.interval(),
        }
    }
}

/// Feed attributes owned by configuration, reconciled into the store by name.
#[derive(Debug, Clone, PartialEq)]
pub struct FeedSpec {
    pub name: String,
    pub url: String,
    pub interval_secs: u64,
    pub enabled: bool,
    pub output_dir: PathBuf,
    pub dialect: Dialect,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_never_polled_feed_is_due() {
        let feed = Feed::new("a", "https://example.com/feed.xml");
        assert!(feed.is_due(Utc::now()));
    }

    #[test]
    fn test_due_after_interval() {
        let now = Utc::now();
        let mut feed = Feed::new("a", "https://example.com/feed.xml");
        feed.interval_secs = 60;
        feed.last_poll = Some(now);

        assert!(!feed.is_due(now + Duration::seconds(30)));
        assert!(feed.is_due(now + Duration::seconds(60)));
        assert!(feed.is_due(now + Duration::seconds(61)));
    }

    #[test]
    fn test_dialect_resolves_from_host() {
        assert_eq!(
            Dialect::Auto.resolve("https://mikanani.me/RSS/Bangumi?bangumiId=1"),
            Dialect::Mikan
        );
        assert_eq!(
            Dialect::Auto.resolve("https://NYAA.si/?page=rss"),
            Dialect::Nyaa
        );
        assert_eq!(
            Dialect::Auto.resolve("https://share.dmhy.org/topics/rss/rss.xml"),
            Dialect::Dmhy
        );
        assert_eq!(
            Dialect::Auto.resolve("https://example.com/podcast.xml"),
            Dialect::Generic
        );
        assert_eq!(Dialect::Auto.resolve("not a url"), Dialect::Generic);
    }

    #[test]
    fn test_explicit_dialect_wins() {
        assert_eq!(
            Dialect::Generic.resolve("https://mikanani.me/RSS/MyBangumi"),
            Dialect::Generic
        );
    }

    #[test]
    fn test_dialect_from_str() {
        assert_eq!("Mikan".parse::<Dialect>().unwrap(), Dialect::Mikan);
        assert_eq!("default".parse::<Dialect>().unwrap(), Dialect::Generic);
        assert!("rss".parse::<Dialect>().is_err());
    }
}
