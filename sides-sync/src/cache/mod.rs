//! Cache Generation Manager: versioned offline cache for one scope.
//!
//! ```text
//!            install(manifest)         activate()
//!  Installing ───────────────► Waiting ──────────► Active ──► Superseded ──► Terminated
//!      │                                             │
//!      └─ precache (no-cache, concurrent,            └─ route(event):
//!         best-effort per resource)                     navigation → network-first
//!                                                       other GET  → stale-while-revalidate
//! ```
//!
//! A generation is a tag `<prefix><version>`. Activating one deletes every
//! other generation sharing the prefix, so at most one generation per prefix
//! survives a completed activation.

pub mod entry;
pub mod fetch;
pub mod http;
pub mod registration;

use futures_util::future::join_all;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use thiserror::Error;
use tokio::sync::watch;
use tokio::task::JoinSet;

use crate::outcome::Outcome;
use crate::platform::Platform;
use crate::storage::{CacheStore, StoreError};

pub use entry::{CacheEntry, RequestKey};
pub use fetch::{CacheMode, FetchError, Fetcher, HttpFetcher};
pub use http::{Request, RequestMode, Response, ResponseKind};
pub use registration::Registration;

/// Hosts whose traffic (long-poll, auth, analytics) is never intercepted.
pub const DEFAULT_BYPASS_HOSTS: &[&str] = &[
    "googleapis.com",
    "gstatic.com",
    "firebaseinstallations.googleapis.com",
    "googletagmanager.com",
    "analytics.google.com",
    "www.google-analytics.com",
];

/// Browser-internal schemes left alone.
pub const DEFAULT_IGNORED_SCHEMES: &[&str] =
    &["chrome-extension", "safari-extension", "moz-extension"];

/// Cache layer configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Generation tag prefix shared by every version of this application.
    pub prefix: String,
    pub version: String,
    /// Base URL that relative manifest entries and the fallback page resolve against.
    pub scope: String,
    /// Resources precached at install.
    pub manifest: Vec<String>,
    /// Page served for failed navigations with no cached copy.
    pub fallback_page: String,
    pub bypass_hosts: Vec<String>,
    pub ignored_schemes: Vec<String>,
    /// Query parameters dropped from navigation keys.
    pub cache_busting_params: Vec<String>,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            prefix: "sides-planner-v".to_string(),
            version: "0".to_string(),
            scope: "http://localhost:8080/".to_string(),
            manifest: ["index.html", "journal.html", "style.css", "outbox.js"]
                .iter()
                .map(|s| s.to_string())
                .collect(),
            fallback_page: "index.html".to_string(),
            bypass_hosts: DEFAULT_BYPASS_HOSTS.iter().map(|s| s.to_string()).collect(),
            ignored_schemes: DEFAULT_IGNORED_SCHEMES.iter().map(|s| s.to_string()).collect(),
            cache_busting_params: vec!["v".to_string()],
        }
    }
}

impl CacheConfig {
    /// Small configuration rooted at `scope` with an empty manifest.
    pub fn for_testing(scope: &str, version: &str) -> Self {
        Self {
            prefix: "test-app-v".to_string(),
            version: version.to_string(),
            scope: scope.to_string(),
            manifest: Vec::new(),
            ..Self::default()
        }
    }

    pub fn with_version(mut self, version: impl Into<String>) -> Self {
        self.version = version.into();
        self
    }

    pub fn generation_tag(&self) -> String {
        format!("{}{}", self.prefix, self.version)
    }

    /// Resolve `path` against the scope.
    pub fn resolve(&self, path: &str) -> Result<String, CacheError> {
        let base = reqwest::Url::parse(&self.scope)
            .map_err(|e| CacheError::InvalidUrl(format!("{}: {e}", self.scope)))?;
        base.join(path)
            .map(|url| url.to_string())
            .map_err(|e| CacheError::InvalidUrl(format!("{path}: {e}")))
    }

    fn is_bypassed_host(&self, host: &str) -> bool {
        self.bypass_hosts.iter().any(|h| {
            host == h
                || host
                    .strip_suffix(h.as_str())
                    .is_some_and(|rest| rest.ends_with('.'))
        })
    }

    fn is_ignored_scheme(&self, url: &str) -> bool {
        self.ignored_schemes.iter().any(|scheme| {
            url.strip_prefix(scheme.as_str())
                .is_some_and(|rest| rest.starts_with("://"))
        })
    }
}

#[derive(Debug, Error)]
pub enum CacheError {
    #[error("Cache storage error: {0}")]
    Storage(#[from] StoreError),
    #[error("Invalid URL: {0}")]
    InvalidUrl(String),
    #[error("Generation {tag} cannot {action} while {state}")]
    InvalidTransition {
        tag: String,
        action: &'static str,
        state: GenerationState,
    },
}

/// Lifecycle of one generation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GenerationState {
    Installing,
    /// Installed, waiting for the previous generation to let go.
    Waiting,
    /// Controlling consumers and routing their requests.
    Active,
    /// A newer generation is taking over.
    Superseded,
    Terminated,
}

impl fmt::Display for GenerationState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            GenerationState::Installing => "installing",
            GenerationState::Waiting => "waiting",
            GenerationState::Active => "active",
            GenerationState::Superseded => "superseded",
            GenerationState::Terminated => "terminated",
        };
        f.write_str(name)
    }
}

/// An intercepted request, plus the platform's preloaded response if any.
#[derive(Debug, Clone)]
pub struct FetchEvent {
    pub request: Request,
    pub preload: Option<Response>,
}

impl FetchEvent {
    pub fn new(request: Request) -> Self {
        Self {
            request,
            preload: None,
        }
    }

    pub fn with_preload(mut self, response: Response) -> Self {
        self.preload = Some(response);
        self
    }
}

/// What the interception layer does with a request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RouteDecision {
    /// Not intercepted: the request goes to the network untouched.
    Passthrough,
    Respond(Response),
}

impl RouteDecision {
    pub fn response(&self) -> Option<&Response> {
        match self {
            RouteDecision::Passthrough => None,
            RouteDecision::Respond(response) => Some(response),
        }
    }
}

/// Per-resource precache results.
#[derive(Debug, Clone, Default)]
pub struct InstallReport {
    pub generation: String,
    pub resources: Vec<(String, Outcome)>,
}

impl InstallReport {
    pub fn cached(&self) -> usize {
        self.resources.iter().filter(|(_, o)| o.is_succeeded()).count()
    }

    pub fn skipped(&self) -> usize {
        self.resources.len() - self.cached()
    }
}

#[derive(Debug, Clone)]
pub struct ActivateReport {
    pub generation: String,
    /// Older generations of the same prefix that were deleted.
    pub removed_generations: Vec<String>,
    pub removed_entries: usize,
    pub navigation_preload: Outcome,
}

/// One generation of the offline cache.
pub struct CacheManager {
    config: CacheConfig,
    tag: String,
    store: Arc<dyn CacheStore>,
    fetcher: Arc<dyn Fetcher>,
    platform: Arc<dyn Platform>,
    state: watch::Sender<GenerationState>,
    preload_enabled: AtomicBool,
    revalidations: Mutex<JoinSet<()>>,
}

impl CacheManager {
    pub fn new(
        config: CacheConfig,
        store: Arc<dyn CacheStore>,
        fetcher: Arc<dyn Fetcher>,
        platform: Arc<dyn Platform>,
    ) -> Self {
        let tag = config.generation_tag();
        let (state, _) = watch::channel(GenerationState::Installing);
        Self {
            config,
            tag,
            store,
            fetcher,
            platform,
            state,
            preload_enabled: AtomicBool::new(false),
            revalidations: Mutex::new(JoinSet::new()),
        }
    }

    pub fn tag(&self) -> &str {
        &self.tag
    }

    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    pub fn state(&self) -> GenerationState {
        *self.state.borrow()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<GenerationState> {
        self.state.subscribe()
    }

    pub fn navigation_preload_active(&self) -> bool {
        self.preload_enabled.load(Ordering::Acquire)
    }

    fn set_state(&self, next: GenerationState) {
        let previous = self.state.send_replace(next);
        if previous != next {
            log::info!("Generation {}: {previous} -> {next}", self.tag);
        }
    }

    fn expect_state(&self, action: &'static str, allowed: &[GenerationState]) -> Result<(), CacheError> {
        let state = self.state();
        if allowed.contains(&state) {
            Ok(())
        } else {
            Err(CacheError::InvalidTransition {
                tag: self.tag.clone(),
                action,
                state,
            })
        }
    }

    // ─── Lifecycle ────────────────────────────────────────────────────

    /// Create the generation and precache `manifest`.
    ///
    /// Every resource is fetched concurrently with HTTP caches bypassed. A
    /// failed or non-OK resource is logged and skipped; it never fails the
    /// install.
    pub async fn install(&self, manifest: &[String]) -> Result<InstallReport, CacheError> {
        self.expect_state("install", &[GenerationState::Installing])?;
        self.store.create_generation(&self.tag)?;

        let resources = join_all(manifest.iter().map(|path| self.precache(path))).await;
        let report = InstallReport {
            generation: self.tag.clone(),
            resources,
        };
        log::info!(
            "Installed {}: {} cached, {} skipped",
            self.tag,
            report.cached(),
            report.skipped()
        );

        self.set_state(GenerationState::Waiting);
        Ok(report)
    }

    async fn precache(&self, path: &str) -> (String, Outcome) {
        let url = match self.config.resolve(path) {
            Ok(url) => url,
            Err(e) => {
                log::warn!("Skipped (url) {path}: {e}");
                return (path.to_string(), Outcome::FailedNonFatal(e.to_string()));
            }
        };

        let request = Request::get(url.clone());
        let outcome = match self.fetcher.fetch(&request, CacheMode::NoCache).await {
            Ok(response) if response.is_cacheable() => {
                let key = RequestKey::for_request(&request, &[]);
                match self.store.put_entry(&CacheEntry::new(&self.tag, key, response)) {
                    Ok(true) => Outcome::Succeeded,
                    Ok(false) => Outcome::FailedNonFatal("generation removed".to_string()),
                    Err(e) => Outcome::FailedNonFatal(e.to_string()),
                }
            }
            Ok(response) => {
                log::warn!("Skipped (status {}) {url}", response.status);
                Outcome::FailedNonFatal(format!("status {}", response.status))
            }
            Err(e) => {
                log::warn!("Skipped (fetch) {url}: {e}");
                Outcome::FailedNonFatal(e.to_string())
            }
        };
        (url, outcome)
    }

    /// Take over: drop older generations of the prefix, enable navigation
    /// preload where supported and start routing.
    pub async fn activate(&self) -> Result<ActivateReport, CacheError> {
        self.expect_state("activate", &[GenerationState::Waiting, GenerationState::Active])?;

        let mut removed_generations = Vec::new();
        let mut removed_entries = 0;
        for tag in self.store.list_generations()? {
            if tag != self.tag && tag.starts_with(&self.config.prefix) {
                removed_entries += self.store.delete_generation(&tag)?;
                removed_generations.push(tag);
            }
        }
        if !removed_generations.is_empty() {
            log::info!(
                "Removed generations {:?} ({removed_entries} entries)",
                removed_generations
            );
        }

        let navigation_preload = if self.platform.supports_navigation_preload() {
            Outcome::from_result(self.platform.enable_navigation_preload().await)
        } else {
            Outcome::SkippedUnsupported
        };
        self.preload_enabled
            .store(navigation_preload.is_succeeded(), Ordering::Release);

        self.set_state(GenerationState::Active);
        Ok(ActivateReport {
            generation: self.tag.clone(),
            removed_generations,
            removed_entries,
            navigation_preload,
        })
    }

    pub fn mark_superseded(&self) {
        self.set_state(GenerationState::Superseded);
    }

    /// Undo `mark_superseded` when the successor failed to activate.
    pub(crate) fn resume(&self) {
        if self.state() == GenerationState::Superseded {
            self.set_state(GenerationState::Active);
        }
    }

    /// Stop routing for good and abandon pending revalidations.
    pub fn mark_terminated(&self) {
        self.set_state(GenerationState::Terminated);
        self.revalidations().abort_all();
    }

    // ─── Routing ──────────────────────────────────────────────────────

    /// Decide how to answer an intercepted request.
    ///
    /// Cache storage failures degrade to cache misses.
    pub async fn route(&self, event: FetchEvent) -> RouteDecision {
        let request = &event.request;
        if self.state() != GenerationState::Active {
            return RouteDecision::Passthrough;
        }
        if !request.is_get() || self.config.is_ignored_scheme(&request.url) {
            return RouteDecision::Passthrough;
        }
        if let Ok(url) = reqwest::Url::parse(&request.url) {
            if url.host_str().is_some_and(|host| self.config.is_bypassed_host(host)) {
                log::debug!("Bypass {}", request.url);
                return RouteDecision::Passthrough;
            }
        }

        let response = if request.is_navigation() {
            self.network_first(event).await
        } else {
            self.stale_while_revalidate(event.request).await
        };
        RouteDecision::Respond(response)
    }

    async fn network_first(&self, event: FetchEvent) -> Response {
        let FetchEvent { request, preload } = event;
        let key = RequestKey::for_request(&request, &self.config.cache_busting_params);

        if let Some(preloaded) = preload.filter(|_| self.navigation_preload_active()) {
            log::debug!("Navigation {} served from preload", request.url);
            if preloaded.is_ok() {
                self.store_response(&key, &preloaded);
            }
            return preloaded;
        }

        match self.fetcher.fetch(&request, CacheMode::Default).await {
            Ok(response) => {
                if response.is_ok() {
                    self.store_response(&key, &response);
                }
                response
            }
            Err(e) => {
                log::debug!("Navigation {} failed ({e}); trying cache", request.url);
                if let Some(cached) = self.cached(&key) {
                    return cached;
                }
                match self.fallback_page() {
                    Some(page) => page,
                    None => Response::network_error(),
                }
            }
        }
    }

    async fn stale_while_revalidate(&self, request: Request) -> Response {
        let key = RequestKey::for_request(&request, &[]);

        if let Some(cached) = self.cached(&key) {
            log::debug!("Stale {} served; revalidating", request.url);
            let store = self.store.clone();
            let fetcher = self.fetcher.clone();
            let tag = self.tag.clone();
            let mut revalidations = self.revalidations();
            // Finished tasks stay in the set until joined.
            while let Some(joined) = revalidations.try_join_next() {
                report_join(joined);
            }
            revalidations.spawn(async move {
                revalidate(store, fetcher, tag, request, key).await;
            });
            return cached;
        }

        match self.fetcher.fetch(&request, CacheMode::Default).await {
            Ok(response) => {
                if response.is_cacheable() {
                    self.store_response(&key, &response);
                }
                response
            }
            Err(e) => {
                log::debug!("{} unavailable ({e}) and not cached", request.url);
                Response::network_error()
            }
        }
    }

    /// Look `request` up in this generation.
    pub fn lookup(&self, request: &Request) -> Result<Option<Response>, CacheError> {
        let key = RequestKey::for_request(request, &self.config.cache_busting_params);
        Ok(self
            .store
            .get_entry(&self.tag, &key)?
            .map(|entry| entry.response))
    }

    /// Wait for every background revalidation started so far.
    pub async fn settle(&self) {
        loop {
            let mut pending = std::mem::take(&mut *self.revalidations());
            if pending.is_empty() {
                return;
            }
            while let Some(joined) = pending.join_next().await {
                report_join(joined);
            }
        }
    }

    fn revalidations(&self) -> MutexGuard<'_, JoinSet<()>> {
        self.revalidations
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn cached(&self, key: &RequestKey) -> Option<Response> {
        match self.store.get_entry(&self.tag, key) {
            Ok(entry) => entry.map(|e| e.response),
            Err(e) => {
                log::warn!("Cache read for {key} failed: {e}");
                None
            }
        }
    }

    /// Fallback page from this generation, matched ignoring the query string.
    fn fallback_page(&self) -> Option<Response> {
        let target = self.config.resolve(&self.config.fallback_page).ok()?;
        let target = entry::strip_query(&target);
        let entries = match self.store.list_entries(&self.tag) {
            Ok(entries) => entries,
            Err(e) => {
                log::warn!("Fallback lookup failed: {e}");
                return None;
            }
        };
        entries
            .into_iter()
            .find(|e| e.key.method() == "GET" && e.key.url_without_query() == target)
            .map(|e| e.response)
    }

    fn store_response(&self, key: &RequestKey, response: &Response) {
        let entry = CacheEntry::new(&self.tag, key.clone(), response.clone());
        match self.store.put_entry(&entry) {
            Ok(true) => {}
            Ok(false) => log::debug!("Generation {} gone; not caching {key}", self.tag),
            Err(e) => log::warn!("Caching {key} failed: {e}"),
        }
    }
}

async fn revalidate(
    store: Arc<dyn CacheStore>,
    fetcher: Arc<dyn Fetcher>,
    tag: String,
    request: Request,
    key: RequestKey,
) {
    match fetcher.fetch(&request, CacheMode::Default).await {
        Ok(response) if response.is_cacheable() => {
            if let Err(e) = store.put_entry(&CacheEntry::new(tag, key, response)) {
                log::warn!("Refreshing {} failed: {e}", request.url);
            }
        }
        Ok(response) => log::debug!("Kept stale {} (status {})", request.url, response.status),
        Err(e) => log::debug!("Revalidation of {} failed: {e}", request.url),
    }
}

fn report_join(joined: Result<(), tokio::task::JoinError>) {
    if let Err(e) = joined {
        if !e.is_cancelled() {
            log::warn!("Revalidation task failed: {e}");
        }
    }
}
