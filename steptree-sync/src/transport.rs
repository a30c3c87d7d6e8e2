//! Transport seam between the sync observer and the remote store.
//!
//! The wire is an external collaborator: everything above this module
//! only sees [`ApiTransport`], a JSON request/response surface. The
//! shipped implementation is [`HttpTransport`] over `reqwest`;
//! integration tests substitute an in-memory backend.

use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;

use crate::error::SyncError;

/// JSON request/response surface of the remote store.
///
/// Paths are relative to the server root (`api/1/workset/...`).
/// Body-less requests go out as `GET`, everything carrying data as
/// `POST`; implementations must keep that split.
#[async_trait]
pub trait ApiTransport: Send + Sync {
    /// Issue a body-less request.
    async fn get(&self, path: &str) -> Result<Value, SyncError>;

    /// Issue a request carrying a JSON body.
    async fn post(&self, path: &str, body: &Value) -> Result<Value, SyncError>;
}

/// Client configuration.
#[derive(Debug, Clone)]
pub struct SyncConfig {
    /// Server base URL, without the `api/...` suffix.
    pub base_url: String,
    /// Per-request timeout. Must exceed the server's long-poll window.
    pub request_timeout: Duration,
    /// Delay before re-polling the event queue after a transport error.
    pub poll_retry_delay: Duration,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            base_url: "http://127.0.0.1:8888".to_string(),
            request_timeout: Duration::from_secs(30),
            poll_retry_delay: Duration::from_secs(1),
        }
    }
}

/// [`ApiTransport`] over HTTP with JSON bodies.
pub struct HttpTransport {
    client: reqwest::Client,
    base_url: String,
}

impl HttpTransport {
    pub fn new(config: &SyncConfig) -> Result<Self, SyncError> {
        let client = reqwest::Client::builder()
            .timeout(config.request_timeout)
            .build()?;
        Ok(Self {
            client,
            base_url: config.base_url.trim_end_matches('/').to_string(),
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{}", self.base_url, path)
    }
}

#[async_trait]
impl ApiTransport for HttpTransport {
    async fn get(&self, path: &str) -> Result<Value, SyncError> {
        let response = self
            .client
            .get(self.url(path))
            .send()
            .await?
            .error_for_status()?;
        Ok(response.json().await?)
    }

    async fn post(&self, path: &str, body: &Value) -> Result<Value, SyncError> {
        let response = self
            .client
            .post(self.url(path))
            .json(body)
            .send()
            .await?
            .error_for_status()?;
        Ok(response.json().await?)
    }
}
