//! Durable write queue shared by every application instance on a device.
//!
//! ```text
//!  enqueue_or_write(payload)
//!        │ online?
//!        ├── yes ── Uploader::upload ── ok ──────────────► WroteNow
//!        │                           └─ err ─┐
//!        └── no ────────────────────────────┴─► put item ─► request wake ─► Queued
//!
//!  flush()   (single-flight per instance)
//!    for item in snapshot where owner == current identity:
//!        claim ── lost ──► skip (another instance has it)
//!          │
//!        upload ── ok ──► delete
//!          └──── err ──► release (retry on next trigger)
//! ```
//!
//! Cross-instance exclusivity comes from per-item leases with a TTL, not
//! from a lock: a crashed instance's lease simply expires. A slow uploader
//! can therefore lose its lease and the item can be uploaded twice; the
//! remote write must be idempotent or merge-safe.

pub mod item;

use async_trait::async_trait;
use serde_json::Value;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crate::connectivity::Connectivity;
use crate::error::SyncError;
use crate::identity::{Identity, IdentityProvider};
use crate::outcome::Outcome;
use crate::storage::QueueStore;
use crate::upload::Uploader;

pub use item::{InstanceId, Lease, QueueItem};

/// Age after which a lease is considered abandoned.
pub const CLAIM_TTL: Duration = Duration::from_secs(3 * 60);

/// Outbox configuration.
#[derive(Debug, Clone)]
pub struct OutboxConfig {
    /// Lease lifetime (default: 3 minutes).
    pub claim_ttl: Duration,
}

impl Default for OutboxConfig {
    fn default() -> Self {
        Self { claim_ttl: CLAIM_TTL }
    }
}

impl OutboxConfig {
    /// Short leases so tests can watch them expire.
    pub fn for_testing() -> Self {
        Self {
            claim_ttl: Duration::from_millis(200),
        }
    }
}

/// Requests a background wake once connectivity returns.
///
/// Implemented by the sync coordinator; the outbox calls it after queueing.
#[async_trait]
pub trait BackgroundWake: Send + Sync {
    async fn request_wake(&self) -> Outcome;
}

/// Result of `enqueue_or_write`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteOutcome {
    /// Uploaded immediately; storage never touched.
    WroteNow,
    /// Persisted for a later flush.
    Queued,
}

/// What happened to one owned item during a flush.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ItemOutcome {
    Uploaded,
    /// Another instance holds a live lease; skipped this round.
    ClaimLost,
    /// Upload failed; lease released for a later attempt.
    UploadFailed(String),
}

/// Per-run flush summary.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FlushReport {
    /// Outcomes for items owned by the flushing identity, in queue order.
    pub items: Vec<(String, ItemOutcome)>,
    /// Items of other identities left untouched.
    pub foreign: usize,
}

impl FlushReport {
    pub fn uploaded(&self) -> usize {
        self.count(|o| matches!(o, ItemOutcome::Uploaded))
    }

    pub fn claim_lost(&self) -> usize {
        self.count(|o| matches!(o, ItemOutcome::ClaimLost))
    }

    pub fn failed(&self) -> usize {
        self.count(|o| matches!(o, ItemOutcome::UploadFailed(_)))
    }

    fn count(&self, pred: impl Fn(&ItemOutcome) -> bool) -> usize {
        self.items.iter().filter(|(_, o)| pred(o)).count()
    }
}

/// Result of `flush`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FlushOutcome {
    /// A flush is already running in this instance.
    AlreadyRunning,
    /// Nobody is signed in.
    NoIdentity,
    /// Connectivity is known to be absent.
    Offline,
    Completed(FlushReport),
}

/// Resets the single-flight flag however the flush ends.
struct FlushGuard<'a>(&'a AtomicBool);

impl Drop for FlushGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

/// One instance's handle on the shared queue.
pub struct Outbox {
    instance: InstanceId,
    store: Arc<dyn QueueStore>,
    identity: Arc<dyn IdentityProvider>,
    uploader: Arc<dyn Uploader>,
    connectivity: Connectivity,
    wake: Option<Arc<dyn BackgroundWake>>,
    config: OutboxConfig,
    flushing: AtomicBool,
}

impl Outbox {
    pub fn new(
        store: Arc<dyn QueueStore>,
        identity: Arc<dyn IdentityProvider>,
        uploader: Arc<dyn Uploader>,
        connectivity: Connectivity,
        config: OutboxConfig,
    ) -> Self {
        Self {
            instance: InstanceId::generate(),
            store,
            identity,
            uploader,
            connectivity,
            wake: None,
            config,
            flushing: AtomicBool::new(false),
        }
    }

    /// Request a background wake whenever an item gets queued.
    pub fn with_wake(mut self, wake: Arc<dyn BackgroundWake>) -> Self {
        self.wake = Some(wake);
        self
    }

    pub fn with_instance_id(mut self, instance: InstanceId) -> Self {
        self.instance = instance;
        self
    }

    pub fn instance_id(&self) -> &InstanceId {
        &self.instance
    }

    pub fn connectivity(&self) -> &Connectivity {
        &self.connectivity
    }

    pub fn identity(&self) -> &Arc<dyn IdentityProvider> {
        &self.identity
    }

    pub fn is_flushing(&self) -> bool {
        self.flushing.load(Ordering::Acquire)
    }

    // ─── Enqueue ──────────────────────────────────────────────────────

    /// Write now if possible, otherwise queue for a later flush.
    ///
    /// The owner is the currently signed-in identity.
    pub async fn enqueue_or_write(&self, payload: Value) -> Result<WriteOutcome, SyncError> {
        let owner = self
            .identity
            .current_identity()
            .ok_or(SyncError::NotAuthenticated)?;

        if self.connectivity.is_online() {
            match self.uploader.upload(&payload).await {
                Ok(()) => return Ok(WriteOutcome::WroteNow),
                Err(e) => log::debug!("Immediate write failed, queueing instead: {e}"),
            }
        }

        let item = QueueItem::new(owner, payload);
        self.store.put_item(&item)?;
        log::info!("Queued {} for {}", item.id, item.owner);

        if let Some(ref wake) = self.wake {
            let outcome = wake.request_wake().await;
            if outcome.is_degraded() {
                log::debug!("Background wake not registered: {outcome}");
            }
        }

        Ok(WriteOutcome::Queued)
    }

    // ─── Flush ────────────────────────────────────────────────────────

    /// Upload every queued item of the current identity.
    ///
    /// Works on a snapshot: items queued meanwhile wait for the next flush.
    /// Upload failures never abort the loop.
    pub async fn flush(&self) -> Result<FlushOutcome, SyncError> {
        if self.flushing.swap(true, Ordering::AcqRel) {
            return Ok(FlushOutcome::AlreadyRunning);
        }
        let _guard = FlushGuard(&self.flushing);

        let Some(owner) = self.identity.current_identity() else {
            return Ok(FlushOutcome::NoIdentity);
        };
        if !self.connectivity.is_online() {
            return Ok(FlushOutcome::Offline);
        }

        let snapshot = self.store.list_items()?;
        let mut report = FlushReport::default();

        for item in snapshot {
            if !item.is_owned_by(&owner) {
                report.foreign += 1;
                continue;
            }
            let outcome = self.flush_item(&item).await?;
            report.items.push((item.id, outcome));
        }

        if !report.items.is_empty() {
            log::info!(
                "Flush by {}: {} uploaded, {} claimed elsewhere, {} failed",
                self.instance,
                report.uploaded(),
                report.claim_lost(),
                report.failed()
            );
        }
        Ok(FlushOutcome::Completed(report))
    }

    async fn flush_item(&self, item: &QueueItem) -> Result<ItemOutcome, SyncError> {
        // A failed claim transaction counts as a lost race; the item stays queued.
        let claimed = self.claim(&item.id).unwrap_or_else(|e| {
            log::warn!("Claim of {} failed: {e}", item.id);
            false
        });
        if !claimed {
            return Ok(ItemOutcome::ClaimLost);
        }

        match self.uploader.upload(&item.payload).await {
            Ok(()) => {
                if let Err(e) = self.store.delete_item(&item.id) {
                    // Uploaded but still queued: release so it is retried (at-least-once).
                    self.release_quietly(&item.id);
                    return Err(e.into());
                }
                Ok(ItemOutcome::Uploaded)
            }
            Err(e) => {
                log::warn!("Upload of {} failed, will retry: {e}", item.id);
                self.release_quietly(&item.id);
                Ok(ItemOutcome::UploadFailed(e.to_string()))
            }
        }
    }

    fn release_quietly(&self, id: &str) {
        if let Err(e) = self.release(id) {
            log::warn!("Release of {id} failed; lease will expire: {e}");
        }
    }

    // ─── Leases ───────────────────────────────────────────────────────

    /// Take the lease on `id` if it is free or abandoned.
    ///
    /// Returns `false` if the item is gone or another live lease exists
    /// (including one held by this instance).
    pub fn claim(&self, id: &str) -> Result<bool, SyncError> {
        self.claim_at(id, item::now_millis())
    }

    pub(crate) fn claim_at(&self, id: &str, now: u64) -> Result<bool, SyncError> {
        let ttl = self.config.claim_ttl;
        let holder = &self.instance;
        let changed = self.store.update_item(id, &mut |item| {
            let free = item
                .claim
                .as_ref()
                .is_none_or(|lease| lease.is_expired(now, ttl));
            if free {
                item.claim = Some(Lease::new(holder.clone(), now));
            }
            free
        })?;
        Ok(changed.unwrap_or(false))
    }

    /// Drop our lease on `id`. No-op if someone else holds it now.
    pub fn release(&self, id: &str) -> Result<(), SyncError> {
        let holder = &self.instance;
        self.store.update_item(id, &mut |item| {
            if item.claim.as_ref().is_some_and(|lease| lease.is_held_by(holder)) {
                item.claim = None;
                true
            } else {
                false
            }
        })?;
        Ok(())
    }

    // ─── Introspection ────────────────────────────────────────────────

    /// Items queued by the current identity (empty when signed out).
    pub fn pending(&self) -> Result<Vec<QueueItem>, SyncError> {
        let Some(owner) = self.identity.current_identity() else {
            return Ok(Vec::new());
        };
        Ok(self.pending_for(&owner)?)
    }

    pub fn pending_count(&self) -> Result<usize, SyncError> {
        Ok(self.pending()?.len())
    }

    fn pending_for(&self, owner: &Identity) -> Result<Vec<QueueItem>, crate::storage::StoreError> {
        Ok(self
            .store
            .list_items()?
            .into_iter()
            .filter(|item| item.is_owned_by(owner))
            .collect())
    }
}
