//! Outbound HTTP: downloading data/model artifacts and publishing results.

use async_trait::async_trait;
use axum::body::Bytes;
use once_cell::sync::Lazy;
use reqwest::header::CONTENT_TYPE;

static SHARED_CLIENT: Lazy<reqwest::Client> = Lazy::new(reqwest::Client::new);

#[derive(Debug, Clone)]
pub struct FetchedResource {
    pub bytes: Bytes,
    pub content_type: Option<String>,
}

#[async_trait]
pub trait RemoteClient: Send + Sync {
    async fn fetch(&self, url: &str) -> anyhow::Result<FetchedResource>;

    /// Returns whether the receiver acknowledged with a 200.
    async fn publish(&self, url: &str, payload: &serde_json::Value) -> bool;
}

/// `reqwest`-backed client. Timeouts are whatever the client defaults to.
#[derive(Clone)]
pub struct HttpRemote {
    client: reqwest::Client,
}

impl HttpRemote {
    pub fn new(client: reqwest::Client) -> Self {
        Self { client }
    }
}

impl Default for HttpRemote {
    fn default() -> Self {
        Self::new(SHARED_CLIENT.clone())
    }
}

#[async_trait]
impl RemoteClient for HttpRemote {
    async fn fetch(&self, url: &str) -> anyhow::Result<FetchedResource> {
        let response = self.client.get(url).send().await?.error_for_status()?;
        let content_type = response
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|value| value.to_str().ok())
            .map(str::to_string);
        let bytes = response.bytes().await?;
        tracing::debug!(%url, size = bytes.len(), ?content_type, "fetched remote resource");
        Ok(FetchedResource {
            bytes,
            content_type,
        })
    }

    async fn publish(&self, url: &str, payload: &serde_json::Value) -> bool {
        match self.client.post(url).json(payload).send().await {
            Ok(response) => response.status() == reqwest::StatusCode::OK,
            Err(err) => {
                tracing::warn!(%url, error = %err, "failed to publish results");
                false
            }
        }
    }
}
