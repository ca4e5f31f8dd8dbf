//! Minimal request/response model seen by the interception layer.

use serde::{Deserialize, Serialize};

/// How the request was issued by the consumer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RequestMode {
    /// Top-level page load.
    Navigate,
    /// Anything else (subresource, XHR, ...).
    Other,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Request {
    pub method: String,
    pub url: String,
    pub mode: RequestMode,
    pub headers: Vec<(String, String)>,
}

impl Request {
    pub fn new(method: impl Into<String>, url: impl Into<String>, mode: RequestMode) -> Self {
        Self {
            method: method.into().to_ascii_uppercase(),
            url: url.into(),
            mode,
            headers: Vec::new(),
        }
    }

    /// Subresource GET.
    pub fn get(url: impl Into<String>) -> Self {
        Self::new("GET", url, RequestMode::Other)
    }

    /// Page navigation.
    pub fn navigate(url: impl Into<String>) -> Self {
        Self::new("GET", url, RequestMode::Navigate).with_header("accept", "text/html")
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    /// Case-insensitive header lookup.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    pub fn is_get(&self) -> bool {
        self.method == "GET"
    }

    /// HTML page load: navigate mode, or a GET that accepts `text/html`.
    pub fn is_navigation(&self) -> bool {
        self.mode == RequestMode::Navigate
            || (self.is_get()
                && self
                    .header("accept")
                    .is_some_and(|accept| accept.contains("text/html")))
    }
}

/// Response type as the platform classifies it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ResponseKind {
    /// Same-origin or CORS-readable response.
    Basic,
    /// Cross-origin response whose status and body are hidden.
    Opaque,
    /// Network-level failure.
    Error,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Response {
    pub status: u16,
    pub headers: Vec<(String, String)>,
    pub body: Vec<u8>,
    pub kind: ResponseKind,
}

impl Response {
    pub fn new(status: u16, body: impl Into<Vec<u8>>) -> Self {
        Self {
            status,
            headers: Vec::new(),
            body: body.into(),
            kind: ResponseKind::Basic,
        }
    }

    pub fn ok(body: impl Into<Vec<u8>>) -> Self {
        Self::new(200, body)
    }

    pub fn opaque() -> Self {
        Self {
            status: 0,
            headers: Vec::new(),
            body: Vec::new(),
            kind: ResponseKind::Opaque,
        }
    }

    /// The network-error response handed back when nothing can be served.
    pub fn network_error() -> Self {
        Self {
            status: 0,
            headers: Vec::new(),
            body: Vec::new(),
            kind: ResponseKind::Error,
        }
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    /// 2xx status.
    pub fn is_ok(&self) -> bool {
        self.kind == ResponseKind::Basic && (200..300).contains(&self.status)
    }

    pub fn is_network_error(&self) -> bool {
        self.kind == ResponseKind::Error
    }

    /// OK responses and opaque ones are worth storing.
    pub fn is_cacheable(&self) -> bool {
        self.is_ok() || self.kind == ResponseKind::Opaque
    }
}
