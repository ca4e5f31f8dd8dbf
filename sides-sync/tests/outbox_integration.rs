//! Outbox integration tests.
//!
//! Verifies:
//! - Lease exclusivity across instances until the TTL, re-claim after it
//! - Queued writes survive a restart of the store
//! - Enqueue + flush leaves nothing behind; a second flush uploads nothing
//! - A platform wake reaches every live instance and the item is uploaded once
//! - The offline note scenario end to end

mod common;

use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use tempfile::tempdir;

use common::{eventually, RecordingUploader, ScriptedFetcher};
use sides_sync::coordinator::SYNC_TAG;
use sides_sync::outbox::InstanceId;
use sides_sync::storage::{QueueStore, RocksStore};
use sides_sync::{
    AppInstance, CacheConfig, Connectivity, FlushOutcome, HeadlessPlatform, Identity,
    InstanceEvent, OfflineWorker, Outbox, OutboxConfig, SessionIdentity, StoreConfig,
    WakeChannel, WriteOutcome,
};

// ─── Helpers ─────────────────────────────────────────────────────────────────

fn outbox(
    name: &str,
    store: Arc<dyn QueueStore>,
    identity: Arc<SessionIdentity>,
    uploader: Arc<RecordingUploader>,
    connectivity: Connectivity,
    config: OutboxConfig,
) -> Outbox {
    Outbox::new(store, identity, uploader, connectivity, config)
        .with_instance_id(InstanceId::new(name))
}

fn completed(outcome: FlushOutcome) -> sides_sync::FlushReport {
    match outcome {
        FlushOutcome::Completed(report) => report,
        other => panic!("flush did not run: {other:?}"),
    }
}

// ─── Leases ──────────────────────────────────────────────────────────────────

#[tokio::test]
async fn test_lease_exclusive_until_ttl_expires() {
    let dir = tempdir().unwrap();
    let store: Arc<dyn QueueStore> =
        Arc::new(RocksStore::open(StoreConfig::for_testing(dir.path().join("db"))).unwrap());
    let identity = Arc::new(SessionIdentity::signed_in("u1"));
    let uploader = Arc::new(RecordingUploader::default());
    let connectivity = Connectivity::offline();

    let a = outbox("tab-a", store.clone(), identity.clone(), uploader.clone(), connectivity.clone(), OutboxConfig::for_testing());
    let b = outbox("tab-b", store.clone(), identity.clone(), uploader.clone(), connectivity.clone(), OutboxConfig::for_testing());

    a.enqueue_or_write(json!({"kind": "mood", "value": 3})).await.unwrap();
    let id = a.pending().unwrap()[0].id.clone();

    assert!(a.claim(&id).unwrap());
    assert!(!b.claim(&id).unwrap(), "live lease must exclude other instances");
    assert!(!a.claim(&id).unwrap(), "own live lease is not re-claimable");

    tokio::time::sleep(OutboxConfig::for_testing().claim_ttl + Duration::from_millis(100)).await;
    assert!(b.claim(&id).unwrap(), "abandoned lease must be re-claimable");

    let holder = store.get_item(&id).unwrap().unwrap().claim.unwrap().holder;
    assert_eq!(holder, InstanceId::new("tab-b"));
}

#[tokio::test]
async fn test_queued_write_survives_restart() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("db");
    let identity = Arc::new(SessionIdentity::signed_in("u1"));
    let uploader = Arc::new(RecordingUploader::default());

    {
        let store: Arc<dyn QueueStore> =
            Arc::new(RocksStore::open(StoreConfig::for_testing(&path)).unwrap());
        let ob = outbox("tab-a", store, identity.clone(), uploader.clone(), Connectivity::offline(), OutboxConfig::default());
        let outcome = ob.enqueue_or_write(json!({"kind": "journal", "text": "rainy day"})).await.unwrap();
        assert_eq!(outcome, WriteOutcome::Queued);
    }

    let store: Arc<dyn QueueStore> =
        Arc::new(RocksStore::open(StoreConfig::for_testing(&path)).unwrap());
    let ob = outbox("tab-b", store, identity, uploader.clone(), Connectivity::online(), OutboxConfig::default());
    assert_eq!(ob.pending_count().unwrap(), 1);

    let report = completed(ob.flush().await.unwrap());
    assert_eq!(report.uploaded(), 1);
    assert_eq!(uploader.uploaded(), vec![json!({"kind": "journal", "text": "rainy day"})]);
}

// ─── Flush ───────────────────────────────────────────────────────────────────

#[tokio::test]
async fn test_flush_drains_and_second_flush_is_empty() {
    let dir = tempdir().unwrap();
    let store: Arc<dyn QueueStore> =
        Arc::new(RocksStore::open(StoreConfig::for_testing(dir.path().join("db"))).unwrap());
    let identity = Arc::new(SessionIdentity::signed_in("u1"));
    let uploader = Arc::new(RecordingUploader::default());
    let connectivity = Connectivity::offline();
    let ob = outbox("tab-a", store, identity, uploader.clone(), connectivity.clone(), OutboxConfig::default());

    for n in 0..5 {
        ob.enqueue_or_write(json!({"kind": "note", "n": n})).await.unwrap();
    }
    connectivity.set_online(true);

    let first = completed(ob.flush().await.unwrap());
    assert_eq!(first.uploaded(), 5);
    assert_eq!(ob.pending_count().unwrap(), 0);

    let second = completed(ob.flush().await.unwrap());
    assert!(second.items.is_empty());
    assert_eq!(uploader.attempts(), 5);
}

#[tokio::test]
async fn test_failed_uploads_retry_on_next_flush() {
    let store: Arc<dyn QueueStore> = Arc::new(sides_sync::storage::MemoryStore::new());
    let identity = Arc::new(SessionIdentity::signed_in("u1"));
    let uploader = Arc::new(RecordingUploader::default());
    uploader.set_failing(true);
    let ob = outbox("tab-a", store, identity, uploader.clone(), Connectivity::online(), OutboxConfig::default());

    assert_eq!(
        ob.enqueue_or_write(json!({"kind": "note"})).await.unwrap(),
        WriteOutcome::Queued
    );
    let report = completed(ob.flush().await.unwrap());
    assert_eq!(report.failed(), 1);
    assert_eq!(ob.pending_count().unwrap(), 1);

    uploader.set_failing(false);
    let report = completed(ob.flush().await.unwrap());
    assert_eq!(report.uploaded(), 1);
    assert_eq!(ob.pending_count().unwrap(), 0);
}

// ─── Wake fan-out ────────────────────────────────────────────────────────────

#[tokio::test]
async fn test_platform_wake_uploads_once_across_instances() {
    let store = Arc::new(sides_sync::storage::MemoryStore::new());
    let identity = Arc::new(SessionIdentity::signed_in("u1"));
    let uploader = Arc::new(RecordingUploader::default());
    let connectivity = Connectivity::online();
    let channel = Arc::new(WakeChannel::default());
    let worker = OfflineWorker::new(
        store.clone(),
        Arc::new(ScriptedFetcher::default()),
        Arc::new(HeadlessPlatform::full()),
        channel.clone(),
        connectivity.clone(),
    );

    // Remote down: the write is queued.
    uploader.set_failing(true);
    let a = Arc::new(outbox("tab-a", store.clone(), identity.clone(), uploader.clone(), connectivity.clone(), OutboxConfig::default()));
    let b = Arc::new(outbox("tab-b", store.clone(), identity.clone(), uploader.clone(), connectivity.clone(), OutboxConfig::default()));
    a.enqueue_or_write(json!({"kind": "gratitude", "text": "tea"})).await.unwrap();

    let mut inst_a = AppInstance::start(a.clone(), channel.clone()).await;
    let mut inst_b = AppInstance::start(b.clone(), channel.clone()).await;
    uploader.set_failing(false);

    // Let the start-up flushes (which may already upload) settle first.
    assert!(eventually(|| !a.is_flushing() && !b.is_flushing()).await);
    worker.sync(SYNC_TAG);

    assert!(eventually(|| a.pending_count().unwrap() == 0).await);
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(uploader.uploaded().len(), 1);

    inst_a.shutdown().await;
    inst_b.shutdown().await;
    worker.shutdown().await;
}

#[tokio::test]
async fn test_offline_note_scenario() {
    let dir = tempdir().unwrap();
    let (stores, outcome) = sides_sync::open_stores(StoreConfig::for_testing(dir.path().join("db")));
    assert!(outcome.is_succeeded());

    let identity = Arc::new(SessionIdentity::signed_in("u1"));
    let uploader = Arc::new(RecordingUploader::default());
    let connectivity = Connectivity::offline();
    let channel = Arc::new(WakeChannel::default());
    let platform = Arc::new(HeadlessPlatform::full());

    let fetcher = Arc::new(ScriptedFetcher::default());
    let worker = OfflineWorker::new(
        stores.cache.clone(),
        fetcher,
        platform.clone(),
        channel.clone(),
        connectivity.clone(),
    );
    worker
        .install(CacheConfig::for_testing("https://sides.test/", "1"))
        .await
        .unwrap();

    let outbox = Arc::new(
        Outbox::new(
            stores.queue.clone(),
            identity.clone(),
            uploader.clone(),
            connectivity.clone(),
            OutboxConfig::default(),
        )
        .with_wake(worker.coordinator().clone()),
    );
    let mut instance = AppInstance::start(outbox.clone(), channel.clone()).await;
    let mut events = instance.take_event_rx().unwrap();

    let outcome = outbox
        .enqueue_or_write(json!({"kind": "note", "text": "hi"}))
        .await
        .unwrap();
    assert_eq!(outcome, WriteOutcome::Queued);

    let pending = outbox.pending().unwrap();
    assert_eq!(pending.len(), 1);
    assert_eq!(pending[0].owner, Identity::new("u1"));
    assert!(pending[0].id.starts_with("note-"));
    assert_eq!(platform.registered_tags(), vec![SYNC_TAG.to_string()]);

    connectivity.set_online(true);

    let mut uploaded = 0;
    while uploaded == 0 {
        let event = tokio::time::timeout(Duration::from_secs(2), events.recv())
            .await
            .expect("no flush after reconnecting")
            .expect("instance stopped");
        if let InstanceEvent::Flushed { report, .. } = event {
            uploaded += report.uploaded();
        }
    }

    assert_eq!(uploaded, 1);
    assert_eq!(outbox.pending_count().unwrap(), 0);
    assert_eq!(uploader.uploaded(), vec![json!({"kind": "note", "text": "hi"})]);

    instance.shutdown().await;
    worker.shutdown().await;
}
