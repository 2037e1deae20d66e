use std::time::Duration;

use async_trait::async_trait;
use reqwest::header::{COOKIE, SET_COOKIE};
use reqwest::{Client, RequestBuilder, Response, StatusCode};
use tokio::sync::RwLock;
use tracing::{debug, info};

use crate::app::DownloadError;
use crate::config::QbittorrentConfig;
use crate::domain::DownloaderKind;
use crate::download::RemoteDownloader;

/// qBittorrent through the Web API (v2).
///
/// Logs in on first use and again when the session expires. Without a
/// username requests go out unauthenticated, which works when the Web UI
/// whitelists this host.
pub struct QbittorrentClient {
    client: Client,
    host: String,
    username: String,
    password: String,
    sid: RwLock<Option<String>>,
}

impl QbittorrentClient {
    pub fn new(config: &QbittorrentConfig, timeout: Duration) -> Result<Self, DownloadError> {
        let client = Client::builder().timeout(timeout).build()?;

        Ok(Self {
            client,
            host: config.host.trim().trim_end_matches('/').to_string(),
            username: config.username.clone(),
            password: config.password.clone(),
            sid: RwLock::new(None),
        })
    }

    fn url(&self, endpoint: &str) -> String {
        format!("{}/api/v2{}", self.host, endpoint)
    }

    fn rejected(message: impl Into<String>) -> DownloadError {
        DownloadError::Rejected {
            backend: DownloaderKind::Qbittorrent,
            message: message.into(),
        }
    }

    /// POST /api/v2/auth/login
    async fn login(&self) -> Result<(), DownloadError> {
        let response = self
            .client
            .post(self.url("/auth/login"))
            .header(reqwest::header::REFERER, &self.host)
            .form(&[("username", &self.username), ("password", &self.password)])
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(DownloadError::Status(response.status()));
        }

        let sid = response
            .headers()
            .get_all(SET_COOKIE)
            .iter()
            .filter_map(|v| v.to_str().ok())
            .find_map(|cookie| {
                cookie
                    .split(';')
                    .next()
                    .and_then(|pair| pair.trim().strip_prefix("SID="))
                    .map(String::from)
            });
        let body = response.text().await?;

        if !body.trim().eq_ignore_ascii_case("ok.") {
            return Err(Self::rejected(format!("login failed: {}", body.trim())));
        }

        info!(host = %self.host, "Logged in to qBittorrent");
        *self.sid.write().await = sid;
        Ok(())
    }

    async fn ensure_login(&self) -> Result<(), DownloadError> {
        if self.username.is_empty() || self.sid.read().await.is_some() {
            return Ok(());
        }
        self.login().await
    }

    async fn with_sid(&self, request: RequestBuilder) -> RequestBuilder {
        match self.sid.read().await.as_deref() {
            Some(sid) => request.header(COOKIE, format!("SID={}", sid)),
            None => request,
        }
    }

    /// Sends the request built by `build`, logging in again once if the
    /// session was rejected.
    async fn send<F>(&self, build: F) -> Result<Response, DownloadError>
    where
        F: Fn() -> RequestBuilder,
    {
        self.ensure_login().await?;
        let response = self.with_sid(build()).await.send().await?;
        if response.status() != StatusCode::FORBIDDEN || self.username.is_empty() {
            return Ok(response);
        }

        debug!("qBittorrent session expired");
        *self.sid.write().await = None;
        self.login().await?;
        Ok(self.with_sid(build()).await.send().await?)
    }
}

#[async_trait]
impl RemoteDownloader for QbittorrentClient {
    fn kind(&self) -> DownloaderKind {
        DownloaderKind::Qbittorrent
    }

    /// POST /api/v2/torrents/add
    async fn add(&self, url: &str) -> Result<Option<String>, DownloadError> {
        let endpoint = self.url("/torrents/add");
        let response = self
            .send(|| self.client.post(&endpoint).form(&[("urls", url)]))
            .await?;

        let status = response.status();
        let body = response.text().await?;
        if !status.is_success() {
            return Err(Self::rejected(format!("{}: {}", status, body.trim())));
        }
        if !body.trim().eq_ignore_ascii_case("ok.") {
            return Err(Self::rejected(body.trim()));
        }
        Ok(None)
    }

    /// GET /api/v2/app/version
    async fn version(&self) -> Result<String, DownloadError> {
        let endpoint = self.url("/app/version");
        let response = self.send(|| self.client.get(&endpoint)).await?;
        if !response.status().is_success() {
            return Err(DownloadError::Status(response.status()));
        }
        Ok(response.text().await?.trim().to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{body_string_contains, header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn client(server: &MockServer, username: &str) -> QbittorrentClient {
        let config = QbittorrentConfig {
            host: server.uri(),
            username: username.into(),
            password: "adminadmin".into(),
        };
        QbittorrentClient::new(&config, Duration::from_secs(5)).unwrap()
    }

    async fn mount_login(server: &MockServer, sid: &str) {
        Mock::given(method("POST"))
            .and(path("/api/v2/auth/login"))
            .and(body_string_contains("username=admin"))
            .respond_with(
                ResponseTemplate::new(200)
                    .insert_header("set-cookie", format!("SID={}; HttpOnly; path=/", sid).as_str())
                    .set_body_string("Ok."),
            )
            .mount(server)
            .await;
    }

    #[tokio::test]
    async fn test_add_logs_in_then_sends_cookie() {
        let server = MockServer::start().await;
        mount_login(&server, "abc123").await;
        Mock::given(method("POST"))
            .and(path("/api/v2/torrents/add"))
            .and(header("cookie", "SID=abc123"))
            .and(body_string_contains("urls=magnet"))
            .respond_with(ResponseTemplate::new(200).set_body_string("Ok."))
            .expect(2)
            .mount(&server)
            .await;

        let qb = client(&server, "admin");
        assert_eq!(qb.add("magnet:?xt=urn:btih:abc").await.unwrap(), None);
        assert_eq!(qb.add("magnet:?xt=urn:btih:def").await.unwrap(), None);

        let logins = server
            .received_requests()
            .await
            .unwrap()
            .iter()
            .filter(|r| r.url.path() == "/api/v2/auth/login")
            .count();
        assert_eq!(logins, 1);
    }

    #[tokio::test]
    async fn test_bad_credentials() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/v2/auth/login"))
            .respond_with(ResponseTemplate::new(200).set_body_string("Fails."))
            .mount(&server)
            .await;

        let err = client(&server, "admin").add("magnet:?x").await.unwrap_err();
        assert!(err.to_string().contains("login failed"));
    }

    #[tokio::test]
    async fn test_expired_session_logs_in_again() {
        let server = MockServer::start().await;
        mount_login(&server, "fresh").await;
        Mock::given(method("POST"))
            .and(path("/api/v2/torrents/add"))
            .and(header("cookie", "SID=fresh"))
            .respond_with(ResponseTemplate::new(200).set_body_string("Ok."))
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/api/v2/torrents/add"))
            .respond_with(ResponseTemplate::new(403).set_body_string("Forbidden"))
            .mount(&server)
            .await;

        let qb = client(&server, "admin");
        *qb.sid.write().await = Some("stale".into());
        qb.add("magnet:?x").await.unwrap();
        assert_eq!(qb.sid.read().await.as_deref(), Some("fresh"));
    }

    #[tokio::test]
    async fn test_add_rejected_by_server() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/v2/torrents/add"))
            .respond_with(ResponseTemplate::new(200).set_body_string("Fails."))
            .mount(&server)
            .await;

        let err = client(&server, "").add("https://example.com/a.torrent").await.unwrap_err();
        assert!(matches!(
            err,
            DownloadError::Rejected { backend: DownloaderKind::Qbittorrent, .. }
        ));
    }

    #[tokio::test]
    async fn test_version_without_login() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/v2/app/version"))
            .respond_with(ResponseTemplate::new(200).set_body_string("v4.6.2"))
            .mount(&server)
            .await;

        assert_eq!(client(&server, "").version().await.unwrap(), "v4.6.2");
    }
}
