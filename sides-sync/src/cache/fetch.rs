//! Network seam for the cache layer.

use async_trait::async_trait;
use thiserror::Error;

use super::http::{Request, Response};

/// How a fetch should treat intermediate HTTP caches.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CacheMode {
    #[default]
    Default,
    /// Revalidate with the origin (used for precaching).
    NoCache,
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("Network error: {0}")]
    Network(String),
    #[error("Invalid request: {0}")]
    InvalidRequest(String),
}

/// Issues real network requests on behalf of the cache manager.
///
/// A non-2xx status is a successful fetch; only transport failures are errors.
#[async_trait]
pub trait Fetcher: Send + Sync {
    async fn fetch(&self, request: &Request, mode: CacheMode) -> Result<Response, FetchError>;
}

/// `reqwest`-backed fetcher.
#[derive(Clone, Default)]
pub struct HttpFetcher {
    client: reqwest::Client,
}

impl HttpFetcher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_client(client: reqwest::Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl Fetcher for HttpFetcher {
    async fn fetch(&self, request: &Request, mode: CacheMode) -> Result<Response, FetchError> {
        let method = reqwest::Method::from_bytes(request.method.as_bytes())
            .map_err(|e| FetchError::InvalidRequest(format!("{}: {e}", request.method)))?;
        let url = reqwest::Url::parse(&request.url)
            .map_err(|e| FetchError::InvalidRequest(format!("{}: {e}", request.url)))?;

        let mut builder = self.client.request(method, url);
        for (name, value) in &request.headers {
            builder = builder.header(name.as_str(), value.as_str());
        }
        if mode == CacheMode::NoCache {
            builder = builder
                .header("cache-control", "no-cache")
                .header("pragma", "no-cache");
        }

        let reply = builder
            .send()
            .await
            .map_err(|e| FetchError::Network(e.to_string()))?;

        let status = reply.status().as_u16();
        let headers: Vec<(String, String)> = reply
            .headers()
            .iter()
            .filter_map(|(name, value)| {
                value
                    .to_str()
                    .ok()
                    .map(|v| (name.as_str().to_string(), v.to_string()))
            })
            .collect();
        let body = reply
            .bytes()
            .await
            .map_err(|e| FetchError::Network(e.to_string()))?;

        let mut response = Response::new(status, body.to_vec());
        response.headers = headers;
        Ok(response)
    }
}
