//! Cache keys and stored entries.

use serde::{Deserialize, Serialize};
use std::fmt;

use super::http::{Request, Response};

/// Canonical identity of a fetchable resource: `"<METHOD> <url>"`.
///
/// Fragments are never part of the key. Navigation keys additionally drop
/// cache-busting query parameters so `/journal.html?v=3` and
/// `/journal.html` share one entry.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RequestKey(String);

impl RequestKey {
    pub fn for_request(request: &Request, cache_busting_params: &[String]) -> Self {
        let strip: &[String] = if request.is_navigation() {
            cache_busting_params
        } else {
            &[]
        };
        Self::from_parts(&request.method, &canonical_url(&request.url, strip))
    }

    pub fn from_parts(method: &str, url: &str) -> Self {
        Self(format!("{} {}", method.to_ascii_uppercase(), url))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn method(&self) -> &str {
        self.0.split_once(' ').map_or("", |(m, _)| m)
    }

    pub fn url(&self) -> &str {
        self.0.split_once(' ').map_or(self.0.as_str(), |(_, u)| u)
    }

    /// Key URL without its query string, for ignore-search matching.
    pub fn url_without_query(&self) -> &str {
        strip_query(self.url())
    }
}

impl fmt::Display for RequestKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Drop everything from `?` (or `#`) onwards.
pub(crate) fn strip_query(url: &str) -> &str {
    let end = url.find(['?', '#']).unwrap_or(url.len());
    &url[..end]
}

/// Remove the fragment and the listed query parameters.
///
/// Unparseable URLs are only stripped of their fragment.
fn canonical_url(url: &str, strip_params: &[String]) -> String {
    let Ok(mut parsed) = reqwest::Url::parse(url) else {
        return url.split('#').next().unwrap_or(url).to_string();
    };
    parsed.set_fragment(None);

    if !strip_params.is_empty() && parsed.query().is_some() {
        let kept: Vec<(String, String)> = parsed
            .query_pairs()
            .filter(|(k, _)| !strip_params.iter().any(|p| p == k.as_ref()))
            .map(|(k, v)| (k.into_owned(), v.into_owned()))
            .collect();
        if kept.is_empty() {
            parsed.set_query(None);
        } else {
            parsed.query_pairs_mut().clear().extend_pairs(kept);
        }
    }

    parsed.to_string()
}

/// A stored response snapshot inside one generation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheEntry {
    pub key: RequestKey,
    pub generation: String,
    pub response: Response,
    /// Unix millis when stored.
    pub stored_at: u64,
}

impl CacheEntry {
    pub fn new(generation: impl Into<String>, key: RequestKey, response: Response) -> Self {
        Self {
            key,
            generation: generation.into(),
            response,
            stored_at: crate::outbox::item::now_millis(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn busting() -> Vec<String> {
        vec!["v".to_string(), "utm_source".to_string()]
    }

    #[test]
    fn test_navigation_key_strips_busting_params() {
        let req = Request::navigate("https://app.test/journal.html?v=3&entry=7#top");
        let key = RequestKey::for_request(&req, &busting());
        assert_eq!(key.as_str(), "GET https://app.test/journal.html?entry=7");
    }

    #[test]
    fn test_navigation_key_drops_empty_query() {
        let req = Request::navigate("https://app.test/index.html?v=10");
        let key = RequestKey::for_request(&req, &busting());
        assert_eq!(key.url(), "https://app.test/index.html");
    }

    #[test]
    fn test_asset_key_keeps_query() {
        let req = Request::get("https://app.test/style.css?v=2#x");
        let key = RequestKey::for_request(&req, &busting());
        assert_eq!(key.as_str(), "GET https://app.test/style.css?v=2");
        assert_eq!(key.method(), "GET");
        assert_eq!(key.url_without_query(), "https://app.test/style.css");
    }

    #[test]
    fn test_unparseable_url() {
        let req = Request::get("not a url#frag");
        let key = RequestKey::for_request(&req, &busting());
        assert_eq!(key.url(), "not a url");
    }
}
