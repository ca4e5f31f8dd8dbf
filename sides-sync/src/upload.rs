//! Upload seam: how a queued payload reaches the remote store.
//!
//! The core never interprets payloads. Uploads must tolerate being invoked
//! more than once for the same logical write: a lease can expire while a slow
//! upload is still in flight, and the next holder will send it again.

use async_trait::async_trait;
use serde_json::Value;
use thiserror::Error;

/// Upload failures. Everything but `InvalidEndpoint` is retried on the
/// next flush; that one is only returned while building an uploader.
#[derive(Debug, Error)]
pub enum UploadError {
    #[error("Invalid upload endpoint {endpoint}: {reason}")]
    InvalidEndpoint { endpoint: String, reason: String },
    #[error("Network error: {0}")]
    Network(String),
    #[error("Remote rejected write ({status}): {message}")]
    Rejected { status: u16, message: String },
    #[error("Payload serialization error: {0}")]
    Serialization(String),
}

/// Async upload function supplied at initialization.
#[async_trait]
pub trait Uploader: Send + Sync {
    async fn upload(&self, payload: &Value) -> Result<(), UploadError>;
}

/// Uploader that POSTs each payload as JSON to a fixed endpoint.
pub struct HttpUploader {
    client: reqwest::Client,
    endpoint: reqwest::Url,
    bearer_token: Option<String>,
}

impl HttpUploader {
    pub fn new(endpoint: &str) -> Result<Self, UploadError> {
        let endpoint = reqwest::Url::parse(endpoint)
            .map_err(|e| UploadError::InvalidEndpoint {
                endpoint: endpoint.to_string(),
                reason: e.to_string(),
            })?;
        Ok(Self {
            client: reqwest::Client::new(),
            endpoint,
            bearer_token: None,
        })
    }

    /// Attach a bearer token to every upload.
    pub fn with_bearer_token(mut self, token: impl Into<String>) -> Self {
        self.bearer_token = Some(token.into());
        self
    }

    pub fn endpoint(&self) -> &str {
        self.endpoint.as_str()
    }
}

#[async_trait]
impl Uploader for HttpUploader {
    async fn upload(&self, payload: &Value) -> Result<(), UploadError> {
        let mut request = self.client.post(self.endpoint.clone()).json(payload);
        if let Some(ref token) = self.bearer_token {
            request = request.bearer_auth(token);
        }

        let response = request
            .send()
            .await
            .map_err(|e| UploadError::Network(e.to_string()))?;

        let status = response.status();
        if status.is_success() {
            return Ok(());
        }

        let message = response.text().await.unwrap_or_default();
        Err(UploadError::Rejected {
            status: status.as_u16(),
            message,
        })
    }
}
