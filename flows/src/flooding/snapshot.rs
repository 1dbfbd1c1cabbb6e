use std::time::Duration;

use async_trait::async_trait;
use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use tracing::info;
use tracing::warn;

#[async_trait]
pub trait SnapshotSource: Send + Sync {
    /// Base64 encoded JPEG of the camera's current frame; `None` when the
    /// camera cannot be reached.
    async fn snapshot(&self, url: &str) -> Option<String>;
}

/// Fetches still frames from the cameras' HTTP snapshot endpoint.
#[derive(Debug, Clone)]
pub struct HttpSnapshotSource {
    http: reqwest::Client,
    timeout: Duration,
}

impl HttpSnapshotSource {
    pub fn new(http: reqwest::Client) -> Self {
        Self {
            http,
            timeout: Duration::from_secs(10),
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    async fn fetch(&self, url: &str) -> Result<Vec<u8>, String> {
        let response = self
            .http
            .get(url)
            .timeout(self.timeout)
            .send()
            .await
            .map_err(|err| err.to_string())?;
        let status = response.status();
        if !status.is_success() {
            return Err(format!("HTTP {status}"));
        }
        let bytes = response.bytes().await.map_err(|err| err.to_string())?;
        if bytes.is_empty() {
            return Err("empty body".to_string());
        }
        Ok(bytes.to_vec())
    }
}

#[async_trait]
impl SnapshotSource for HttpSnapshotSource {
    async fn snapshot(&self, url: &str) -> Option<String> {
        match self.fetch(url).await {
            Ok(bytes) => {
                info!("Successfully got snapshot from URL {url}.");
                Some(STANDARD.encode(bytes))
            }
            Err(err) => {
                warn!("Failed to get snapshot from URL {url}: {err}");
                None
            }
        }
    }
}
