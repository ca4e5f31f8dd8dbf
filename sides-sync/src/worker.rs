//! The interception process: cache registration plus sync coordinator,
//! driven by platform events.

use std::sync::Arc;

use crate::cache::registration::UpdateOutcome;
use crate::cache::{
    ActivateReport, CacheConfig, CacheError, FetchEvent, Fetcher, Registration, RouteDecision,
};
use crate::connectivity::Connectivity;
use crate::coordinator::{ControlMessage, SyncCoordinator, WakeChannel};
use crate::outcome::Outcome;
use crate::platform::Platform;
use crate::storage::CacheStore;

/// Result of the `install` event.
#[derive(Debug, Clone)]
pub struct InstallSummary {
    pub update: UpdateOutcome,
    /// Background wake registration once the worker is ready.
    pub wake: Outcome,
}

pub struct OfflineWorker {
    registration: Registration,
    coordinator: Arc<SyncCoordinator>,
}

impl OfflineWorker {
    /// Build the worker and start watching connectivity.
    ///
    /// Must be called from within a tokio runtime.
    pub fn new(
        store: Arc<dyn CacheStore>,
        fetcher: Arc<dyn Fetcher>,
        platform: Arc<dyn Platform>,
        channel: Arc<WakeChannel>,
        connectivity: Connectivity,
    ) -> Self {
        let registration = Registration::new(store, fetcher, platform.clone());
        let coordinator = Arc::new(SyncCoordinator::new(platform, channel, connectivity));
        coordinator.spawn_connectivity_watch();
        Self {
            registration,
            coordinator,
        }
    }

    pub fn registration(&self) -> &Registration {
        &self.registration
    }

    pub fn coordinator(&self) -> &Arc<SyncCoordinator> {
        &self.coordinator
    }

    /// Install (or update to) the generation described by `config`.
    pub async fn install(&self, config: CacheConfig) -> Result<InstallSummary, CacheError> {
        let update = self.registration.update(config).await?;
        let wake = self.coordinator.register_wake_on_connectivity().await;
        Ok(InstallSummary { update, wake })
    }

    pub async fn fetch(&self, event: FetchEvent) -> RouteDecision {
        self.registration.route(event).await
    }

    /// Handle a message posted by an instance.
    ///
    /// Returns the activation report when `SkipWaiting` promoted a generation.
    pub async fn message(&self, msg: ControlMessage) -> Result<Option<ActivateReport>, CacheError> {
        match msg {
            ControlMessage::SkipWaiting => self.registration.skip_waiting().await,
            ControlMessage::FlushRequested => {
                log::debug!("Ignoring {msg:?} posted to the worker");
                Ok(None)
            }
        }
    }

    /// Platform background-sync event.
    pub fn sync(&self, tag: &str) -> usize {
        self.coordinator.on_wake(tag)
    }

    /// Stop the connectivity watch and drain background revalidations.
    pub async fn shutdown(&self) {
        self.coordinator.shutdown();
        self.registration.settle().await;
        log::info!("Offline worker stopped");
    }
}
