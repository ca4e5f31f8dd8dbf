//! Synchronization Coordinator: turns wake-ups into flush requests.
//!
//! ```text
//!  platform sync("outbox-sync") ─┐
//!  connectivity offline→online ──┼─► WakeChannel::broadcast(FlushRequested)
//!                                │         │  │  │
//!                                │         ▼  ▼  ▼
//!                                │    every live AppInstance flushes
//!  Outbox queued an item ────────┴─► register_wake_on_connectivity()
//! ```
//!
//! The coordinator never touches the queue itself: identity and upload
//! credentials live in the instances, so it only tells them to flush.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use thiserror::Error;
use tokio::sync::{broadcast, RwLock};
use tokio::task::JoinHandle;

use crate::connectivity::Connectivity;
use crate::outbox::{BackgroundWake, InstanceId};
use crate::outcome::Outcome;
use crate::platform::Platform;

/// Background sync tag the outbox registers.
pub const SYNC_TAG: &str = "outbox-sync";

/// Messages exchanged between the interception process and app instances.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ControlMessage {
    /// Process → instances: try to flush your outbox now.
    FlushRequested,
    /// Instance → process: activate the waiting generation.
    SkipWaiting,
}

#[derive(Debug, Error)]
pub enum MessageError {
    #[error("Malformed control message: {0}")]
    Malformed(#[from] serde_json::Error),
}

impl ControlMessage {
    pub fn encode(&self) -> Result<String, MessageError> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn decode(text: &str) -> Result<Self, MessageError> {
        Ok(serde_json::from_str(text)?)
    }
}

/// Statistics for monitoring the wake channel.
#[derive(Debug, Clone, Default)]
pub struct WakeStats {
    pub messages_sent: u64,
    pub active_instances: usize,
}

/// Fan-out of control messages to every live instance of one origin.
pub struct WakeChannel {
    sender: broadcast::Sender<ControlMessage>,
    instances: RwLock<HashSet<InstanceId>>,
    messages_sent: AtomicU64,
}

impl WakeChannel {
    /// `capacity` bounds how many messages a slow instance may fall behind.
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self {
            sender,
            instances: RwLock::new(HashSet::new()),
            messages_sent: AtomicU64::new(0),
        }
    }

    pub async fn add_instance(&self, id: InstanceId) -> broadcast::Receiver<ControlMessage> {
        self.instances.write().await.insert(id);
        self.sender.subscribe()
    }

    pub async fn remove_instance(&self, id: &InstanceId) -> bool {
        self.instances.write().await.remove(id)
    }

    /// Send to every subscriber. Returns how many received it.
    pub fn broadcast(&self, msg: ControlMessage) -> usize {
        let count = self.sender.send(msg).unwrap_or(0);
        self.messages_sent.fetch_add(1, Ordering::Relaxed);
        count
    }

    pub async fn instance_count(&self) -> usize {
        self.instances.read().await.len()
    }

    pub async fn stats(&self) -> WakeStats {
        WakeStats {
            messages_sent: self.messages_sent.load(Ordering::Relaxed),
            active_instances: self.instances.read().await.len(),
        }
    }
}

impl Default for WakeChannel {
    fn default() -> Self {
        Self::new(64)
    }
}

pub struct SyncCoordinator {
    platform: Arc<dyn Platform>,
    channel: Arc<WakeChannel>,
    connectivity: Connectivity,
    watcher: Mutex<Option<JoinHandle<()>>>,
}

impl SyncCoordinator {
    pub fn new(
        platform: Arc<dyn Platform>,
        channel: Arc<WakeChannel>,
        connectivity: Connectivity,
    ) -> Self {
        Self {
            platform,
            channel,
            connectivity,
            watcher: Mutex::new(None),
        }
    }

    pub fn channel(&self) -> &Arc<WakeChannel> {
        &self.channel
    }

    /// Ask the platform to wake us with [`SYNC_TAG`] once online.
    ///
    /// Idempotent. Platforms without background sync report
    /// `SkippedUnsupported`; instances then rely on online/focus triggers.
    pub async fn register_wake_on_connectivity(&self) -> Outcome {
        if !self.platform.supports_background_sync() {
            log::debug!("Background sync not supported; relying on online/focus triggers");
            return Outcome::SkippedUnsupported;
        }
        let outcome = Outcome::from_result(self.platform.register_sync(SYNC_TAG).await);
        match outcome {
            Outcome::Succeeded => log::debug!("Background sync registered: {SYNC_TAG}"),
            ref degraded => log::warn!("Background sync registration {degraded}"),
        }
        outcome
    }

    /// Handle a platform wake. Returns how many instances were told to flush.
    pub fn on_wake(&self, tag: &str) -> usize {
        if tag != SYNC_TAG {
            log::debug!("Ignoring wake for unknown tag {tag}");
            return 0;
        }
        let receivers = self.channel.broadcast(ControlMessage::FlushRequested);
        log::info!("Wake {tag}: flush requested from {receivers} instance(s)");
        receivers
    }

    /// Watch connectivity: each offline→online transition requests a flush
    /// and re-registers the wake (the platform may have dropped it).
    pub fn spawn_connectivity_watch(self: &Arc<Self>) {
        let coordinator = Arc::clone(self);
        let mut online_rx = self.connectivity.subscribe();
        let handle = tokio::spawn(async move {
            while online_rx.changed().await.is_ok() {
                if !*online_rx.borrow_and_update() {
                    continue;
                }
                coordinator.channel.broadcast(ControlMessage::FlushRequested);
                coordinator.register_wake_on_connectivity().await;
            }
        });

        let mut watcher = self.watcher.lock().unwrap_or_else(|p| p.into_inner());
        if let Some(previous) = watcher.replace(handle) {
            previous.abort();
        }
    }

    /// Stop the connectivity watch.
    pub fn shutdown(&self) {
        let mut watcher = self.watcher.lock().unwrap_or_else(|p| p.into_inner());
        if let Some(handle) = watcher.take() {
            handle.abort();
        }
    }
}

#[async_trait]
impl BackgroundWake for SyncCoordinator {
    async fn request_wake(&self) -> Outcome {
        self.register_wake_on_connectivity().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::platform::HeadlessPlatform;
    use std::time::Duration;

    fn coordinator(platform: HeadlessPlatform, connectivity: Connectivity) -> Arc<SyncCoordinator> {
        Arc::new(SyncCoordinator::new(
            Arc::new(platform),
            Arc::new(WakeChannel::default()),
            connectivity,
        ))
    }

    #[test]
    fn test_control_message_wire_format() {
        assert_eq!(
            ControlMessage::SkipWaiting.encode().unwrap(),
            r#"{"type":"SKIP_WAITING"}"#
        );
        assert_eq!(
            ControlMessage::decode(r#"{"type":"FLUSH_REQUESTED"}"#).unwrap(),
            ControlMessage::FlushRequested
        );
        assert!(ControlMessage::decode(r#"{"type":"REBOOT"}"#).is_err());
    }

    #[tokio::test]
    async fn test_wake_channel_membership() {
        let channel = WakeChannel::new(8);
        let a = InstanceId::new("tab-a");
        let _rx = channel.add_instance(a.clone()).await;
        assert_eq!(channel.instance_count().await, 1);

        assert!(channel.remove_instance(&a).await);
        assert!(!channel.remove_instance(&a).await);
        assert_eq!(channel.stats().await.active_instances, 0);
    }

    #[tokio::test]
    async fn test_register_wake_outcomes() {
        let supported = coordinator(HeadlessPlatform::full(), Connectivity::online());
        assert_eq!(supported.register_wake_on_connectivity().await, Outcome::Succeeded);
        assert_eq!(supported.register_wake_on_connectivity().await, Outcome::Succeeded);

        let bare = coordinator(HeadlessPlatform::new(false, false), Connectivity::online());
        assert_eq!(bare.request_wake().await, Outcome::SkippedUnsupported);
    }

    #[tokio::test]
    async fn test_on_wake_fans_out() {
        let coord = coordinator(HeadlessPlatform::full(), Connectivity::online());
        let mut rx1 = coord.channel().add_instance(InstanceId::new("a")).await;
        let mut rx2 = coord.channel().add_instance(InstanceId::new("b")).await;

        assert_eq!(coord.on_wake(SYNC_TAG), 2);
        assert_eq!(rx1.recv().await.unwrap(), ControlMessage::FlushRequested);
        assert_eq!(rx2.recv().await.unwrap(), ControlMessage::FlushRequested);

        assert_eq!(coord.on_wake("periodic-refresh"), 0);
        assert_eq!(coord.channel().stats().await.messages_sent, 1);
    }

    #[tokio::test]
    async fn test_connectivity_watch_requests_flush() {
        let connectivity = Connectivity::offline();
        let platform = Arc::new(HeadlessPlatform::full());
        let coord = Arc::new(SyncCoordinator::new(
            platform.clone(),
            Arc::new(WakeChannel::default()),
            connectivity.clone(),
        ));
        let mut rx = coord.channel().add_instance(InstanceId::new("a")).await;
        coord.spawn_connectivity_watch();

        connectivity.set_online(true);
        let msg = tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(msg, ControlMessage::FlushRequested);

        // Registration runs right after the broadcast.
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(platform.registered_tags(), vec![SYNC_TAG.to_string()]);
        coord.shutdown();
    }
}
