use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};

use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::types::{FromSql, FromSqlError, FromSqlResult, ToSql, ToSqlOutput, ValueRef};
use rusqlite::{params, params_from_iter, Connection, OptionalExtension, Row};
use rusqlite_migration::{Migrations, M};

use crate::app::{FreshetError, Result};
use crate::domain::entry::normalize_key;
use crate::domain::{
    CandidateEntry, Dialect, DownloadMode, DownloaderKind, Entry, EntryQuery, EntryStatus, Feed,
    FeedSpec,
};
use crate::store::{EntryCounts, Store, SyncReport};

const FEED_COLUMNS: &str = "id, name, url, interval, enabled, output_dir, dialect, etag, \
     last_modified, last_poll, last_error, created_at";

const ENTRY_COLUMNS: &str = "id, feed_id, guid_or_link, title, link, published_time, \
     enclosure_url, status, retry_count, last_attempt, next_attempt, last_error, file_path, \
     created_at, downloader, mode";

impl ToSql for EntryStatus {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        Ok(ToSqlOutput::from(self.as_str()))
    }
}

impl FromSql for EntryStatus {
    fn column_result(value: ValueRef<'_>) -> FromSqlResult<Self> {
        value
            .as_str()?
            .parse()
            .map_err(|e| FromSqlError::Other(Box::new(e)))
    }
}

pub struct SqliteStore {
    conn: Mutex<Connection>,
}

impl SqliteStore {
    pub fn new<P: AsRef<Path>>(path: P) -> Result<Self> {
        let conn = Connection::open(path)?;
        let store = Self {
            conn: Mutex::new(conn),
        };
        store.run_migrations()?;
        Ok(store)
    }

    pub fn in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        let store = Self {
            conn: Mutex::new(conn),
        };
        store.run_migrations()?;
        Ok(store)
    }

    fn run_migrations(&self) -> Result<()> {
        let migrations = Migrations::new(vec![
            M::up(include_str!("../../migrations/001-initial/up.sql")),
            M::up(include_str!("../../migrations/002-downloaders/up.sql")),
        ]);

        let mut conn = self.conn()?;
        conn.execute_batch("PRAGMA foreign_keys = ON")?;
        migrations.to_latest(&mut conn)?;

        Ok(())
    }

    fn conn(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn.lock().map_err(|e| {
            FreshetError::Database(rusqlite::Error::SqliteFailure(
                rusqlite::ffi::Error::new(1),
                Some(e.to_string()),
            ))
        })
    }

    fn parse_datetime(s: &str) -> Option<DateTime<Utc>> {
        DateTime::parse_from_rfc3339(s)
            .map(|dt| dt.with_timezone(&Utc))
            .ok()
            .or_else(|| s.parse::<DateTime<Utc>>().ok())
    }

    fn row_to_feed(row: &Row<'_>) -> rusqlite::Result<Feed> {
        Ok(Feed {
            id: row.get(0)?,
            name: row.get(1)?,
            url: row.get(2)?,
            interval_secs: row.get::<_, i64>(3)?.max(0) as u64,
            enabled: row.get(4)?,
            output_dir: PathBuf::from(row.get::<_, String>(5)?),
            dialect: row
                .get::<_, String>(6)?
                .parse()
                .unwrap_or(Dialect::Auto),
            etag: row.get(7)?,
            last_modified: row.get(8)?,
            last_poll: row
                .get::<_, Option<String>>(9)?
                .and_then(|s| Self::parse_datetime(&s)),
            last_error: row.get(10)?,
            created_at: row
                .get::<_, String>(11)
                .ok()
                .and_then(|s| Self::parse_datetime(&s))
                .unwrap_or_else(Utc::now),
        })
    }

    fn row_to_entry(row: &Row<'_>) -> rusqlite::Result<Entry> {
        Ok(Entry {
            id: row.get(0)?,
            feed_id: row.get(1)?,
            guid_or_link: row.get(2)?,
            title: row.get(3)?,
            link: row.get(4)?,
            published_at: row
                .get::<_, Option<String>>(5)?
                .and_then(|s| Self::parse_datetime(&s)),
            enclosure_url: row.get(6)?,
            status: row.get(7)?,
            retry_count: row.get(8)?,
            last_attempt: row
                .get::<_, Option<String>>(9)?
                .and_then(|s| Self::parse_datetime(&s)),
            next_attempt: row
                .get::<_, Option<String>>(10)?
                .and_then(|s| Self::parse_datetime(&s)),
            last_error: row.get(11)?,
            file_path: row.get::<_, Option<String>>(12)?.map(PathBuf::from),
            created_at: row
                .get::<_, String>(13)
                .ok()
                .and_then(|s| Self::parse_datetime(&s))
                .unwrap_or_else(Utc::now),
            downloader: row
                .get::<_, Option<String>>(14)?
                .and_then(|s| s.parse().ok()),
            mode: row
                .get::<_, String>(15)?
                .parse()
                .unwrap_or(DownloadMode::Auto),
        })
    }

    fn query_entry(conn: &Connection, id: i64) -> Result<Option<Entry>> {
        let entry = conn
            .query_row(
                &format!("SELECT {} FROM entries WHERE id = ?1", ENTRY_COLUMNS),
                params![id],
                Self::row_to_entry,
            )
            .optional()?;
        Ok(entry)
    }
}

/// Fixed-width UTC timestamps, so text comparison in SQL orders correctly.
fn ts(dt: DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::Millis, true)
}

fn path_text(path: &Path) -> String {
    path.to_string_lossy().into_owned()
}

impl Store for SqliteStore {
    fn sync_feeds(&self, specs: &[FeedSpec]) -> Result<SyncReport> {
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;
        let now = ts(Utc::now());
        let mut report = SyncReport::default();

        for spec in specs {
            tx.execute(
                "INSERT INTO feeds (name, url, interval, enabled, output_dir, dialect, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
                 ON CONFLICT(name) DO UPDATE SET
                     url = excluded.url,
                     interval = excluded.interval,
                     enabled = excluded.enabled,
                     output_dir = excluded.output_dir,
                     dialect = excluded.dialect,
                     etag = CASE WHEN feeds.url = excluded.url THEN feeds.etag ELSE NULL END,
                     last_modified = CASE WHEN feeds.url = excluded.url
                         THEN feeds.last_modified ELSE NULL END",
                params![
                    spec.name,
                    spec.url,
                    spec.interval_secs.min(i64::MAX as u64) as i64,
                    spec.enabled,
                    path_text(&spec.output_dir),
                    spec.dialect.as_str(),
                    now
                ],
            )?;
            report.upserted += 1;
        }

        let stored: Vec<(i64, String)> = {
            let mut stmt = tx.prepare("SELECT id, name FROM feeds WHERE enabled = 1")?;
            let rows = stmt
                .query_map([], |row| Ok((row.get(0)?, row.get(1)?)))?
                .collect::<std::result::Result<Vec<_>, _>>()?;
            rows
        };

        for (id, name) in stored {
            let configured = specs.iter().any(|s| s.name.eq_ignore_ascii_case(&name));
            if !configured {
                tx.execute("UPDATE feeds SET enabled = 0 WHERE id = ?1", params![id])?;
                report.disabled += 1;
            }
        }

        tx.commit()?;
        Ok(report)
    }

    fn get_feed(&self, id: i64) -> Result<Option<Feed>> {
        let conn = self.conn()?;
        let feed = conn
            .query_row(
                &format!("SELECT {} FROM feeds WHERE id = ?1", FEED_COLUMNS),
                params![id],
                Self::row_to_feed,
            )
            .optional()?;
        Ok(feed)
    }

    fn get_feed_by_name(&self, name: &str) -> Result<Option<Feed>> {
        let conn = self.conn()?;
        let feed = conn
            .query_row(
                &format!("SELECT {} FROM feeds WHERE name = ?1", FEED_COLUMNS),
                params![name.trim()],
                Self::row_to_feed,
            )
            .optional()?;
        Ok(feed)
    }

    fn get_all_feeds(&self) -> Result<Vec<Feed>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM feeds ORDER BY name",
            FEED_COLUMNS
        ))?;

        let feeds = stmt
            .query_map([], Self::row_to_feed)?
            .collect::<std::result::Result<Vec<_>, _>>()?;

        Ok(feeds)
    }

    fn record_poll(
        &self,
        id: i64,
        polled_at: DateTime<Utc>,
        error: Option<&str>,
    ) -> Result<bool> {
        let conn = self.conn()?;
        let moved = conn.execute(
            "UPDATE feeds SET last_poll = ?2
             WHERE id = ?1 AND (last_poll IS NULL OR last_poll < ?2)",
            params![id, ts(polled_at)],
        )?;
        conn.execute(
            "UPDATE feeds SET last_error = ?2 WHERE id = ?1",
            params![id, error],
        )?;
        Ok(moved > 0)
    }

    fn set_validators(
        &self,
        id: i64,
        etag: Option<&str>,
        last_modified: Option<&str>,
    ) -> Result<()> {
        let conn = self.conn()?;
        conn.execute(
            "UPDATE feeds SET etag = ?2, last_modified = ?3 WHERE id = ?1",
            params![id, etag, last_modified],
        )?;
        Ok(())
    }

    fn disable_feed(&self, id: i64, reason: &str) -> Result<()> {
        let conn = self.conn()?;
        conn.execute(
            "UPDATE feeds SET enabled = 0, last_error = ?2 WHERE id = ?1",
            params![id, reason],
        )?;
        Ok(())
    }

    fn insert_entries(&self, feed_id: i64, candidates: &[CandidateEntry]) -> Result<Vec<Entry>> {
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;
        let now = Utc::now();
        let mut inserted = Vec::new();

        for candidate in candidates {
            let Some(key) = candidate.normalized_key() else {
                continue;
            };
            let status = if candidate.enclosure_url.is_some() {
                EntryStatus::Pending
            } else {
                EntryStatus::Skipped
            };

            let changed = tx.execute(
                "INSERT OR IGNORE INTO entries
                     (feed_id, guid_or_link, title, link, published_time, enclosure_url,
                      status, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
                params![
                    feed_id,
                    key,
                    candidate.title,
                    candidate.link,
                    candidate.published_at.map(ts),
                    candidate.enclosure_url,
                    status,
                    ts(now)
                ],
            )?;

            if changed == 0 {
                continue;
            }

            inserted.push(Entry {
                id: tx.last_insert_rowid(),
                feed_id,
                guid_or_link: key,
                title: candidate.title.clone(),
                link: candidate.link.clone(),
                published_at: candidate.published_at,
                enclosure_url: candidate.enclosure_url.clone(),
                status,
                retry_count: 0,
                last_attempt: None,
                next_attempt: None,
                last_error: None,
                file_path: None,
                downloader: None,
                mode: DownloadMode::Auto,
                created_at: now,
            });
        }

        tx.commit()?;
        Ok(inserted)
    }

    fn get_entry(&self, id: i64) -> Result<Option<Entry>> {
        let conn = self.conn()?;
        Self::query_entry(&conn, id)
    }

    fn find_entry(&self, feed_id: i64, key: &str) -> Result<Option<Entry>> {
        let conn = self.conn()?;
        let entry = conn
            .query_row(
                &format!(
                    "SELECT {} FROM entries WHERE feed_id = ?1 AND guid_or_link = ?2",
                    ENTRY_COLUMNS
                ),
                params![feed_id, normalize_key(key)],
                Self::row_to_entry,
            )
            .optional()?;
        Ok(entry)
    }

    fn query_entries(&self, query: &EntryQuery) -> Result<(Vec<Entry>, u64)> {
        let mut clauses = vec!["1 = 1"];
        let mut values: Vec<Box<dyn ToSql>> = Vec::new();

        if let Some(feed_id) = query.feed_id {
            clauses.push("feed_id = ?");
            values.push(Box::new(feed_id));
        }
        if let Some(status) = query.status {
            clauses.push("status = ?");
            values.push(Box::new(status));
        }
        if let Some(title) = query.title.as_deref().filter(|t| !t.is_empty()) {
            clauses.push("title LIKE ? ESCAPE '\\'");
            let escaped = title
                .replace('\\', "\\\\")
                .replace('%', "\\%")
                .replace('_', "\\_");
            values.push(Box::new(format!("%{}%", escaped)));
        }

        let where_clause = clauses.join(" AND ");
        let conn = self.conn()?;

        let total: i64 = conn.query_row(
            &format!("SELECT COUNT(*) FROM entries WHERE {}", where_clause),
            params_from_iter(values.iter()),
            |row| row.get(0),
        )?;

        let limit = query
            .limit
            .map(|l| l.min(i64::MAX as usize) as i64)
            .unwrap_or(-1);
        values.push(Box::new(limit));
        values.push(Box::new(query.offset.min(i64::MAX as usize) as i64));

        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM entries WHERE {}
             ORDER BY published_time DESC, id DESC LIMIT ? OFFSET ?",
            ENTRY_COLUMNS, where_clause
        ))?;

        let entries = stmt
            .query_map(params_from_iter(values.iter()), Self::row_to_entry)?
            .collect::<std::result::Result<Vec<_>, _>>()?;

        Ok((entries, total.max(0) as u64))
    }

    fn due_entries(&self, now: DateTime<Utc>, limit: usize) -> Result<Vec<Entry>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM entries
             WHERE status = 'pending' AND (next_attempt IS NULL OR next_attempt <= ?1)
             ORDER BY id LIMIT ?2",
            ENTRY_COLUMNS
        ))?;

        let entries = stmt
            .query_map(
                params![ts(now), limit.min(i64::MAX as usize) as i64],
                Self::row_to_entry,
            )?
            .collect::<std::result::Result<Vec<_>, _>>()?;

        Ok(entries)
    }

    fn entry_counts(&self, feed_id: Option<i64>) -> Result<EntryCounts> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT status, COUNT(*) FROM entries
             WHERE ?1 IS NULL OR feed_id = ?1
             GROUP BY status",
        )?;

        let mut counts = EntryCounts::default();
        let rows = stmt.query_map(params![feed_id], |row| {
            Ok((row.get::<_, EntryStatus>(0)?, row.get::<_, i64>(1)?))
        })?;
        for row in rows {
            let (status, n) = row?;
            counts.add(status, n.max(0) as u64);
        }

        Ok(counts)
    }

    fn claim_entry(&self, id: i64, now: DateTime<Utc>) -> Result<bool> {
        let conn = self.conn()?;
        let changed = conn.execute(
            "UPDATE entries SET status = 'downloading', last_attempt = ?2
             WHERE id = ?1 AND status = 'pending'",
            params![id, ts(now)],
        )?;
        Ok(changed == 1)
    }

    fn complete_entry(
        &self,
        id: i64,
        file_path: Option<&Path>,
        downloader: DownloaderKind,
    ) -> Result<()> {
        let conn = self.conn()?;
        conn.execute(
            "UPDATE entries
             SET status = 'completed', file_path = ?2, downloader = ?3,
                 last_error = NULL, next_attempt = NULL
             WHERE id = ?1 AND status = 'downloading'",
            params![id, file_path.map(path_text), downloader.as_str()],
        )?;
        Ok(())
    }

    fn fail_entry(
        &self,
        id: i64,
        error: &str,
        max_retries: u32,
        retry_at: DateTime<Utc>,
    ) -> Result<EntryStatus> {
        let conn = self.conn()?;
        // SET expressions see the row as it was before the update.
        conn.execute(
            "UPDATE entries SET
                 retry_count = retry_count + 1,
                 last_error = ?2,
                 status = CASE WHEN retry_count + 1 >= ?3 THEN 'failed' ELSE 'pending' END,
                 next_attempt = CASE WHEN retry_count + 1 >= ?3 THEN NULL ELSE ?4 END
             WHERE id = ?1 AND status = 'downloading'",
            params![id, error, max_retries, ts(retry_at)],
        )?;

        let status = conn
            .query_row(
                "SELECT status FROM entries WHERE id = ?1",
                params![id],
                |row| row.get(0),
            )
            .optional()?
            .ok_or(FreshetError::EntryNotFound(id))?;
        Ok(status)
    }

    fn release_entry(&self, id: i64) -> Result<()> {
        let conn = self.conn()?;
        conn.execute(
            "UPDATE entries SET status = 'pending' WHERE id = ?1 AND status = 'downloading'",
            params![id],
        )?;
        Ok(())
    }

    fn reset_stale_downloads(&self) -> Result<usize> {
        let conn = self.conn()?;
        let changed = conn.execute(
            "UPDATE entries SET status = 'pending' WHERE status = 'downloading'",
            [],
        )?;
        Ok(changed)
    }

    fn requeue_entry(&self, id: i64, downloader: Option<DownloaderKind>) -> Result<Entry> {
        let conn = self.conn()?;
        let changed = conn.execute(
            "UPDATE entries SET
                 status = 'pending', retry_count = 0, next_attempt = NULL, last_error = NULL,
                 mode = 'manual', downloader = ?2
             WHERE id = ?1 AND status != 'downloading' AND enclosure_url IS NOT NULL",
            params![id, downloader.map(|d| d.as_str())],
        )?;

        let entry = Self::query_entry(&conn, id)?.ok_or(FreshetError::EntryNotFound(id))?;
        if changed == 0 {
            return Err(FreshetError::InvalidTransition {
                id,
                status: entry.status,
            });
        }
        Ok(entry)
    }
}
