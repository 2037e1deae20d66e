use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use wiremock::matchers::{body_string_contains, header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use freshet::app::AppContext;
use freshet::config::{Aria2Config, Config, ConfigStore, FeedConfig, WebhookConfig};
use freshet::domain::{CandidateEntry, DownloadMode, DownloaderKind, EntryStatus};
use freshet::scheduler::PollOutcome;
use freshet::store::Store;

fn feed_xml(base: &str) -> String {
    format!(
        r#"<?xml version="1.0" encoding="UTF-8"?>
<rss version="2.0">
  <channel>
    <title>Show</title>
    <item>
      <title>Episode 1</title>
      <guid>ep-1</guid>
      <pubDate>Mon, 01 Jan 2024 00:00:00 GMT</pubDate>
      <enclosure url="{base}/media/ep1.mp3" type="audio/mpeg" length="5"/>
    </item>
    <item>
      <title>Episode 2</title>
      <guid>ep-2</guid>
      <pubDate>Mon, 08 Jan 2024 00:00:00 GMT</pubDate>
      <enclosure url="{base}/media/ep2.mp3" type="audio/mpeg" length="5"/>
    </item>
  </channel>
</rss>"#
    )
}

async fn mount_feed(server: &MockServer) {
    Mock::given(method("GET"))
        .and(path("/feed.xml"))
        .respond_with(
            ResponseTemplate::new(200)
                .insert_header("etag", "\"v1\"")
                .set_body_string(feed_xml(&server.uri())),
        )
        .mount(server)
        .await;
}

fn config(server: &MockServer, output: &Path) -> Config {
    let mut config = Config::default();
    config.runtime.max_retries = 2;
    config.runtime.backoff_base_seconds = 0;
    config.runtime.backoff_max_seconds = 0;

    let mut feed = FeedConfig::new("show", format!("{}/feed.xml", server.uri()));
    feed.output_dir = Some(output.to_path_buf());
    config.feeds.push(feed);
    config
}

fn context(config: Config) -> AppContext {
    let ctx = AppContext::in_memory(Arc::new(ConfigStore::new(config).unwrap())).unwrap();
    ctx.scheduler.sync_config(&ctx.config.get()).unwrap();
    ctx
}

fn part_files(dir: &Path) -> usize {
    std::fs::read_dir(dir)
        .unwrap()
        .filter(|e| {
            e.as_ref()
                .unwrap()
                .path()
                .extension()
                .is_some_and(|ext| ext == "part")
        })
        .count()
}

#[tokio::test]
async fn test_poll_downloads_new_enclosures_once() {
    let server = MockServer::start().await;
    mount_feed(&server).await;
    Mock::given(method("GET"))
        .and(path("/media/ep1.mp3"))
        .respond_with(ResponseTemplate::new(200).set_body_bytes(b"audio".to_vec()))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/media/ep2.mp3"))
        .respond_with(ResponseTemplate::new(500))
        .mount(&server)
        .await;

    let dir = tempfile::tempdir().unwrap();
    let ctx = context(config(&server, dir.path()));
    let feed = ctx.service().feed_by_name("show").unwrap();

    let outcome = ctx.scheduler.poll_once(feed.id).await.unwrap().unwrap();
    assert!(matches!(outcome, PollOutcome::Polled { new: 2, dispatched: 2, .. }));
    ctx.pool.wait_idle().await;

    let ep1 = ctx.store.find_entry(feed.id, "ep-1").unwrap().unwrap();
    assert_eq!(ep1.status, EntryStatus::Completed);
    let file = ep1.file_path.unwrap();
    assert_eq!(file, dir.path().join("ep1.mp3"));
    assert_eq!(std::fs::read(&file).unwrap(), b"audio");

    let ep2 = ctx.store.find_entry(feed.id, "ep-2").unwrap().unwrap();
    assert_eq!(ep2.status, EntryStatus::Pending);
    assert_eq!(ep2.retry_count, 1);

    // Same document again: nothing new.
    let again = ctx.scheduler.poll_once(feed.id).await.unwrap().unwrap();
    assert!(matches!(again, PollOutcome::Polled { new: 0, known: 2, .. }));

    // The retry is due immediately; the second failure is terminal.
    assert_eq!(ctx.pool.dispatch_due(Utc::now()).unwrap(), 1);
    ctx.pool.wait_idle().await;

    let ep2 = ctx.store.find_entry(feed.id, "ep-2").unwrap().unwrap();
    assert_eq!(ep2.status, EntryStatus::Failed);
    assert_eq!(ep2.retry_count, 2);
    assert!(ep2.last_error.unwrap().contains("500"));
    assert_eq!(part_files(dir.path()), 0);
    assert_eq!(ctx.store.entry_counts(Some(feed.id)).unwrap().total(), 2);
}

#[tokio::test]
async fn test_stored_etag_is_sent_on_next_poll() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/feed.xml"))
        .and(header("if-none-match", "\"v1\""))
        .respond_with(ResponseTemplate::new(304))
        .mount(&server)
        .await;
    mount_feed(&server).await;
    Mock::given(method("GET"))
        .and(path("/media/ep1.mp3"))
        .respond_with(ResponseTemplate::new(200).set_body_bytes(b"1".to_vec()))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/media/ep2.mp3"))
        .respond_with(ResponseTemplate::new(200).set_body_bytes(b"2".to_vec()))
        .mount(&server)
        .await;

    let dir = tempfile::tempdir().unwrap();
    let ctx = context(config(&server, dir.path()));
    let feed = ctx.service().feed_by_name("show").unwrap();

    let first = ctx.scheduler.poll_once(feed.id).await.unwrap().unwrap();
    assert!(matches!(first, PollOutcome::Polled { new: 2, .. }));

    let second = ctx.scheduler.poll_once(feed.id).await.unwrap().unwrap();
    assert_eq!(second, PollOutcome::NotModified);

    ctx.pool.wait_idle().await;
    assert_eq!(ctx.store.entry_counts(Some(feed.id)).unwrap().completed, 2);
}

#[tokio::test]
async fn test_interrupted_download_resumes_after_restart() {
    let server = MockServer::start().await;
    mount_feed(&server).await;
    Mock::given(method("GET"))
        .and(path("/media/stuck.mp3"))
        .respond_with(ResponseTemplate::new(200).set_body_bytes(b"late".to_vec()))
        .mount(&server)
        .await;

    let dir = tempfile::tempdir().unwrap();
    let mut config = config(&server, &dir.path().join("out"));
    config.database = Some(dir.path().join("db").join("freshet.db"));
    config.runtime.tick_seconds = 1;

    // First process: the entry is claimed, then the process dies.
    let entry_id = {
        let ctx = AppContext::new(Arc::new(ConfigStore::new(config.clone()).unwrap())).unwrap();
        ctx.scheduler.sync_config(&ctx.config.get()).unwrap();
        let feed = ctx.service().feed_by_name("show").unwrap();
        let entry = ctx
            .store
            .insert_entries(
                feed.id,
                &[CandidateEntry {
                    title: "Stuck".into(),
                    link: None,
                    guid: Some("stuck".into()),
                    published_at: None,
                    enclosure_url: Some(format!("{}/media/stuck.mp3", server.uri())),
                }],
            )
            .unwrap()
            .remove(0);
        assert!(ctx.store.claim_entry(entry.id, Utc::now()).unwrap());
        entry.id
    };

    // Opening the database again hands the entry back to the queue.
    let ctx = AppContext::new(Arc::new(ConfigStore::new(config).unwrap())).unwrap();
    assert_eq!(
        ctx.store.get_entry(entry_id).unwrap().unwrap().status,
        EntryStatus::Pending
    );
    let handle = tokio::spawn(ctx.scheduler.clone().run());

    let mut status = EntryStatus::Downloading;
    for _ in 0..300 {
        status = ctx.store.get_entry(entry_id).unwrap().unwrap().status;
        if status == EntryStatus::Completed {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    ctx.shutdown().await;
    tokio_test::assert_ok!(handle.await.unwrap());

    assert_eq!(status, EntryStatus::Completed);
    let stored = ctx.store.get_entry(entry_id).unwrap().unwrap();
    assert_eq!(stored.retry_count, 0);
    assert!(dir.path().join("out").join("stuck.mp3").exists());
}

#[tokio::test]
async fn test_aria2_feed_hands_off_and_notifies_webhook() {
    let server = MockServer::start().await;
    mount_feed(&server).await;
    Mock::given(method("POST"))
        .and(path("/jsonrpc"))
        .and(body_string_contains("aria2.addUri"))
        .respond_with(ResponseTemplate::new(200).set_body_string(
            r#"{"jsonrpc":"2.0","id":"freshet","result":"2089b05ecca3d829"}"#,
        ))
        .expect(2)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/hook"))
        .and(body_string_contains("\"Downloader\""))
        .respond_with(ResponseTemplate::new(204))
        .expect(2)
        .mount(&server)
        .await;

    let mut config = Config::default();
    config.aria2 = Some(Aria2Config {
        rpc: format!("{}/jsonrpc", server.uri()),
        ..Aria2Config::default()
    });
    config.webhooks.push(WebhookConfig {
        name: "chat".into(),
        url: format!("{}/hook", server.uri()),
        enabled: true,
    });
    let mut feed = FeedConfig::new("show", format!("{}/feed.xml", server.uri()));
    feed.downloader = DownloaderKind::Aria2;
    config.feeds.push(feed);

    let ctx = context(config);
    let feed = ctx.service().feed_by_name("show").unwrap();

    let outcome = ctx.scheduler.poll_once(feed.id).await.unwrap().unwrap();
    assert!(matches!(outcome, PollOutcome::Polled { new: 2, dispatched: 2, .. }));
    ctx.pool.wait_idle().await;

    for key in ["ep-1", "ep-2"] {
        let entry = ctx.store.find_entry(feed.id, key).unwrap().unwrap();
        assert_eq!(entry.status, EntryStatus::Completed);
        assert_eq!(entry.downloader, Some(DownloaderKind::Aria2));
        assert_eq!(entry.mode, DownloadMode::Auto);
        assert_eq!(entry.file_path, None);
    }
}
