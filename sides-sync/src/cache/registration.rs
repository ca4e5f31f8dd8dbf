//! Registration: the active and waiting generations of one scope.
//!
//! The first generation installed activates at once and takes control.
//! Later generations install alongside the active one and wait for
//! `skip_waiting`; consumers then see a controller change.

use std::sync::Arc;
use tokio::sync::{watch, RwLock};

use super::{
    ActivateReport, CacheConfig, CacheError, CacheManager, FetchEvent, Fetcher, InstallReport,
    RouteDecision,
};
use crate::platform::Platform;
use crate::storage::CacheStore;

/// Result of `Registration::update`.
#[derive(Debug, Clone)]
pub enum UpdateOutcome {
    /// That generation is already active or waiting.
    Unchanged,
    /// First install: activated immediately.
    Activated(InstallReport, ActivateReport),
    /// Installed next to the active generation.
    Waiting(InstallReport),
}

pub struct Registration {
    store: Arc<dyn CacheStore>,
    fetcher: Arc<dyn Fetcher>,
    platform: Arc<dyn Platform>,
    active: RwLock<Option<Arc<CacheManager>>>,
    waiting: RwLock<Option<Arc<CacheManager>>>,
    controller: watch::Sender<Option<String>>,
}

impl Registration {
    pub fn new(
        store: Arc<dyn CacheStore>,
        fetcher: Arc<dyn Fetcher>,
        platform: Arc<dyn Platform>,
    ) -> Self {
        let (controller, _) = watch::channel(None);
        Self {
            store,
            fetcher,
            platform,
            active: RwLock::new(None),
            waiting: RwLock::new(None),
            controller,
        }
    }

    /// Install the generation described by `config`.
    pub async fn update(&self, config: CacheConfig) -> Result<UpdateOutcome, CacheError> {
        let tag = config.generation_tag();
        let has_active = {
            let active = self.active.read().await;
            if active.as_ref().is_some_and(|m| m.tag() == tag) {
                return Ok(UpdateOutcome::Unchanged);
            }
            active.is_some()
        };
        if self.waiting.read().await.as_ref().is_some_and(|m| m.tag() == tag) {
            return Ok(UpdateOutcome::Unchanged);
        }

        let manifest = config.manifest.clone();
        let manager = Arc::new(CacheManager::new(
            config,
            self.store.clone(),
            self.fetcher.clone(),
            self.platform.clone(),
        ));
        let installed = manager.install(&manifest).await?;

        if !has_active {
            let activated = manager.activate().await?;
            *self.active.write().await = Some(manager);
            self.publish_controller(Some(tag));
            return Ok(UpdateOutcome::Activated(installed, activated));
        }

        log::info!("Generation {tag} installed; waiting to activate");
        if let Some(previous) = self.waiting.write().await.replace(manager) {
            previous.mark_terminated();
        }
        Ok(UpdateOutcome::Waiting(installed))
    }

    /// Promote the waiting generation. `None` when nothing is waiting.
    pub async fn skip_waiting(&self) -> Result<Option<ActivateReport>, CacheError> {
        let Some(next) = self.waiting.write().await.take() else {
            return Ok(None);
        };

        let mut active = self.active.write().await;
        if let Some(ref old) = *active {
            old.mark_superseded();
        }

        let report = match next.activate().await {
            Ok(report) => report,
            Err(e) => {
                if let Some(ref old) = *active {
                    old.resume();
                }
                *self.waiting.write().await = Some(next);
                return Err(e);
            }
        };

        if let Some(old) = active.replace(next) {
            old.mark_terminated();
        }
        drop(active);

        self.publish_controller(Some(report.generation.clone()));
        Ok(Some(report))
    }

    /// Route through the controlling generation, if any.
    pub async fn route(&self, event: FetchEvent) -> RouteDecision {
        let active = self.active.read().await.clone();
        match active {
            Some(manager) => manager.route(event).await,
            None => RouteDecision::Passthrough,
        }
    }

    /// Tag of the controlling generation; changes on every takeover.
    pub fn controller(&self) -> watch::Receiver<Option<String>> {
        self.controller.subscribe()
    }

    pub async fn active(&self) -> Option<Arc<CacheManager>> {
        self.active.read().await.clone()
    }

    pub async fn waiting(&self) -> Option<Arc<CacheManager>> {
        self.waiting.read().await.clone()
    }

    /// Await background work of the controlling generation.
    pub async fn settle(&self) {
        if let Some(manager) = self.active().await {
            manager.settle().await;
        }
    }

    fn publish_controller(&self, tag: Option<String>) {
        log::info!("Controller changed to {}", tag.as_deref().unwrap_or("none"));
        self.controller.send_replace(tag);
    }
}
