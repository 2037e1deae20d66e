use std::path::PathBuf;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::debug;

use crate::app::DownloadError;
use crate::config::Aria2Config;
use crate::domain::DownloaderKind;
use crate::download::RemoteDownloader;

const RPC_ID: &str = "freshet";

/// aria2 over its JSON-RPC interface.
pub struct Aria2Client {
    client: Client,
    rpc: String,
    secret: Option<String>,
    dir: Option<PathBuf>,
}

#[derive(Debug, Deserialize)]
struct RpcResponse {
    #[serde(default)]
    result: Option<Value>,
    #[serde(default)]
    error: Option<RpcError>,
}

#[derive(Debug, Deserialize)]
struct RpcError {
    #[serde(default)]
    code: i64,
    message: String,
}

impl Aria2Client {
    pub fn new(config: &Aria2Config, timeout: Duration) -> Result<Self, DownloadError> {
        let client = Client::builder().timeout(timeout).build()?;

        Ok(Self {
            client,
            rpc: config.rpc.trim().to_string(),
            secret: config.secret.clone().filter(|s| !s.is_empty()),
            dir: config.dir.clone(),
        })
    }

    async fn call(&self, method: &str, mut params: Vec<Value>) -> Result<Value, DownloadError> {
        if let Some(secret) = &self.secret {
            params.insert(0, Value::String(format!("token:{}", secret)));
        }
        let body = json!({
            "jsonrpc": "2.0",
            "id": RPC_ID,
            "method": method,
            "params": params,
        });

        let response = self.client.post(&self.rpc).json(&body).send().await?;
        let status = response.status();
        let text = response.text().await?;

        // aria2 reports RPC errors with a 4xx status and a JSON body.
        match serde_json::from_str::<RpcResponse>(&text) {
            Ok(RpcResponse {
                error: Some(error), ..
            }) => Err(DownloadError::Rejected {
                backend: DownloaderKind::Aria2,
                message: format!("{} (code {})", error.message, error.code),
            }),
            _ if !status.is_success() => Err(DownloadError::Status(status)),
            Ok(RpcResponse {
                result: Some(result),
                ..
            }) => Ok(result),
            _ => Err(DownloadError::Rejected {
                backend: DownloaderKind::Aria2,
                message: format!("unexpected response: {}", text),
            }),
        }
    }
}

#[async_trait]
impl RemoteDownloader for Aria2Client {
    fn kind(&self) -> DownloaderKind {
        DownloaderKind::Aria2
    }

    async fn add(&self, url: &str) -> Result<Option<String>, DownloadError> {
        let mut params = vec![json!([url])];
        if let Some(dir) = &self.dir {
            params.push(json!({ "dir": dir.to_string_lossy() }));
        }

        let gid = self.call("aria2.addUri", params).await?;
        let gid = gid.as_str().map(String::from);
        debug!(gid = ?gid, "aria2 accepted download");
        Ok(gid)
    }

    async fn version(&self) -> Result<String, DownloadError> {
        let result = self.call("aria2.getVersion", Vec::new()).await?;
        Ok(result
            .get("version")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{body_json, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn client(server: &MockServer, secret: Option<&str>, dir: Option<&str>) -> Aria2Client {
        let config = Aria2Config {
            rpc: format!("{}/jsonrpc", server.uri()),
            secret: secret.map(String::from),
            dir: dir.map(PathBuf::from),
        };
        Aria2Client::new(&config, Duration::from_secs(5)).unwrap()
    }

    #[tokio::test]
    async fn test_add_sends_token_and_dir() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/jsonrpc"))
            .and(body_json(json!({
                "jsonrpc": "2.0",
                "id": "freshet",
                "method": "aria2.addUri",
                "params": [
                    "token:s3cret",
                    ["magnet:?xt=urn:btih:abc"],
                    {"dir": "/data/anime"}
                ],
            })))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "jsonrpc": "2.0",
                "id": "freshet",
                "result": "2089b05ecca3d829",
            })))
            .expect(1)
            .mount(&server)
            .await;

        let aria2 = client(&server, Some("s3cret"), Some("/data/anime"));
        let gid = aria2.add("magnet:?xt=urn:btih:abc").await.unwrap();
        assert_eq!(gid.as_deref(), Some("2089b05ecca3d829"));
    }

    #[tokio::test]
    async fn test_add_without_secret_or_dir() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(body_json(json!({
                "jsonrpc": "2.0",
                "id": "freshet",
                "method": "aria2.addUri",
                "params": [["https://example.com/a.torrent"]],
            })))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"result": "gid"})))
            .expect(1)
            .mount(&server)
            .await;

        let aria2 = client(&server, None, None);
        assert!(aria2.add("https://example.com/a.torrent").await.is_ok());
    }

    #[tokio::test]
    async fn test_rpc_error_is_rejected() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(400).set_body_json(json!({
                "jsonrpc": "2.0",
                "id": "freshet",
                "error": {"code": 1, "message": "Unauthorized"},
            })))
            .mount(&server)
            .await;

        let err = client(&server, Some("wrong"), None)
            .add("magnet:?xt=urn:btih:abc")
            .await
            .unwrap_err();
        match err {
            DownloadError::Rejected { backend, message } => {
                assert_eq!(backend, DownloaderKind::Aria2);
                assert!(message.contains("Unauthorized"));
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn test_server_error_without_body() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(502))
            .mount(&server)
            .await;

        let err = client(&server, None, None).add("magnet:?x").await.unwrap_err();
        assert!(matches!(err, DownloadError::Status(s) if s.as_u16() == 502));
    }

    #[tokio::test]
    async fn test_version() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "result": {"version": "1.37.0", "enabledFeatures": ["BitTorrent"]},
            })))
            .mount(&server)
            .await;

        assert_eq!(client(&server, None, None).version().await.unwrap(), "1.37.0");
    }
}
