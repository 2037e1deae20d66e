use chrono::Utc;
use feed_rs::model::Entry as FeedEntry;
use feed_rs::parser;
use html_escape::decode_html_entities;
use tracing::{debug, warn};

use crate::app::{FreshetError, Result};
use crate::domain::{CandidateEntry, Dialect};

const TORRENT_MIME: &str = "application/x-bittorrent";

/// Turns a fetched feed document into candidate entries.
///
/// Stateless; every call parses its input from scratch.
#[derive(Debug, Clone, Copy, Default)]
pub struct Normalizer;

impl Normalizer {
    pub fn new() -> Self {
        Self
    }

    pub fn normalize(
        &self,
        feed_url: &str,
        dialect: Dialect,
        body: &[u8],
    ) -> Result<Vec<CandidateEntry>> {
        // Leave missing ids empty so identity falls back to the entry link.
        let feed = parser::Builder::new()
            .id_generator(|_links, _title, _uri| String::new())
            .build()
            .parse(body)
            .map_err(|e| FreshetError::Parse(e.to_string()))?;

        let dialect = dialect.resolve(feed_url);
        let mut candidates = Vec::with_capacity(feed.entries.len());

        for entry in feed.entries {
            let candidate = to_candidate(dialect, entry);
            if candidate.key().is_none() {
                warn!(feed = feed_url, title = %candidate.title, "Dropping entry without guid or link");
                continue;
            }
            candidates.push(candidate);
        }

        debug!(feed = feed_url, dialect = dialect.as_str(), count = candidates.len(), "Normalized feed");
        Ok(candidates)
    }
}

fn to_candidate(dialect: Dialect, entry: FeedEntry) -> CandidateEntry {
    let guid = Some(entry.id.trim().to_string()).filter(|id| !id.is_empty());
    let link = entry_link(&entry);
    let enclosure_url = match dialect {
        Dialect::Mikan | Dialect::Dmhy => torrent_enclosure(&entry).or_else(|| link.clone()),
        Dialect::Nyaa => link.clone(),
        Dialect::Generic | Dialect::Auto => generic_enclosure(&entry),
    };

    CandidateEntry {
        title: entry
            .title
            .map(|t| decode_html_entities(t.content.trim()).to_string())
            .unwrap_or_default(),
        link,
        guid,
        published_at: entry
            .published
            .or(entry.updated)
            .map(|dt| dt.with_timezone(&Utc)),
        enclosure_url,
    }
}

/// The entry's own page: the first link that is not an enclosure.
fn entry_link(entry: &FeedEntry) -> Option<String> {
    entry
        .links
        .iter()
        .find(|l| l.rel.as_deref() != Some("enclosure"))
        .map(|l| l.href.trim().to_string())
        .filter(|href| !href.is_empty())
}

fn generic_enclosure(entry: &FeedEntry) -> Option<String> {
    entry
        .links
        .iter()
        .find(|l| l.rel.as_deref() == Some("enclosure"))
        .map(|l| l.href.clone())
        .or_else(|| {
            entry
                .media
                .iter()
                .flat_map(|m| m.content.iter())
                .find_map(|c| c.url.as_ref().map(|u| u.to_string()))
        })
}

fn torrent_enclosure(entry: &FeedEntry) -> Option<String> {
    let is_torrent = |mime: Option<&str>| mime.is_some_and(|m| m.eq_ignore_ascii_case(TORRENT_MIME));

    entry
        .links
        .iter()
        .find(|l| is_torrent(l.media_type.as_deref()))
        .map(|l| l.href.clone())
        .or_else(|| {
            entry
                .media
                .iter()
                .flat_map(|m| m.content.iter())
                .filter(|c| {
                    let mime = c.content_type.as_ref().map(|t| t.essence().to_string());
                    is_torrent(mime.as_deref())
                })
                .find_map(|c| c.url.as_ref().map(|u| u.to_string()))
        })
}
