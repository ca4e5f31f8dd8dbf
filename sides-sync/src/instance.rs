//! App instance runtime: one consumer (tab/window) of the shared outbox.
//!
//! Provides:
//! - Subscription to the process-wide wake channel
//! - Flush triggers: wake broadcast, own online transition, regained focus,
//!   sign-in, and once on start
//! - Event stream describing each flush attempt
//! - When attached to a worker: update checks, activation requests and
//!   controller-change notices

use std::sync::Arc;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{mpsc, watch, Notify};
use tokio::task::JoinHandle;

use crate::cache::registration::UpdateOutcome;
use crate::cache::{ActivateReport, CacheConfig, CacheError};
use crate::coordinator::{ControlMessage, WakeChannel};
use crate::outbox::{FlushOutcome, FlushReport, InstanceId, Outbox};
use crate::worker::OfflineWorker;

/// Why a flush was attempted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlushTrigger {
    Start,
    WakeBroadcast,
    Online,
    Focus,
    SignIn,
}

/// Events emitted by an app instance.
#[derive(Debug, Clone)]
pub enum InstanceEvent {
    /// A flush ran to completion.
    Flushed {
        trigger: FlushTrigger,
        report: FlushReport,
    },
    /// The flush did not run (already running, signed out, offline).
    FlushSkipped {
        trigger: FlushTrigger,
        outcome: FlushOutcome,
    },
    /// Storage failed mid-flush; the next trigger retries.
    FlushFailed {
        trigger: FlushTrigger,
        error: String,
    },
    /// The worker handed control to another generation. Content served by
    /// the previous one is stale and should be reloaded.
    ControllerChanged { generation: Option<String> },
    /// The trigger loop has exited.
    Stopped,
}

pub struct AppInstance {
    outbox: Arc<Outbox>,
    channel: Arc<WakeChannel>,
    worker: Option<Arc<OfflineWorker>>,
    focus: Arc<Notify>,
    shutdown: Arc<Notify>,
    task: Option<JoinHandle<()>>,
    event_rx: Option<mpsc::Receiver<InstanceEvent>>,
}

impl AppInstance {
    /// Join the wake channel and start the trigger loop.
    ///
    /// The subscription is in place before this returns, so no broadcast
    /// sent afterwards is missed. The first flush runs immediately.
    pub async fn start(outbox: Arc<Outbox>, channel: Arc<WakeChannel>) -> Self {
        Self::launch(outbox, channel, None).await
    }

    /// Like `start`, on the worker's wake channel, and additionally
    /// reporting its controller changes as `InstanceEvent::ControllerChanged`.
    pub async fn attach(outbox: Arc<Outbox>, worker: Arc<OfflineWorker>) -> Self {
        let channel = worker.coordinator().channel().clone();
        Self::launch(outbox, channel, Some(worker)).await
    }

    async fn launch(
        outbox: Arc<Outbox>,
        channel: Arc<WakeChannel>,
        worker: Option<Arc<OfflineWorker>>,
    ) -> Self {
        let (event_tx, event_rx) = mpsc::channel(256);
        let focus = Arc::new(Notify::new());
        let shutdown = Arc::new(Notify::new());

        let wake_rx = channel.add_instance(outbox.instance_id().clone()).await;
        let controller_rx = worker.as_ref().map(|w| w.registration().controller());
        let task = tokio::spawn(trigger_loop(
            outbox.clone(),
            channel.clone(),
            wake_rx,
            controller_rx,
            focus.clone(),
            shutdown.clone(),
            event_tx,
        ));
        log::info!("Instance {} started", outbox.instance_id());

        Self {
            outbox,
            channel,
            worker,
            focus,
            shutdown,
            task: Some(task),
            event_rx: Some(event_rx),
        }
    }

    pub fn outbox(&self) -> &Arc<Outbox> {
        &self.outbox
    }

    pub fn instance_id(&self) -> &InstanceId {
        self.outbox.instance_id()
    }

    /// Take the event receiver (can only be called once).
    pub fn take_event_rx(&mut self) -> Option<mpsc::Receiver<InstanceEvent>> {
        self.event_rx.take()
    }

    /// The instance became visible/focused again.
    pub fn regained_focus(&self) {
        self.focus.notify_one();
    }

    /// Ask the worker to promote its waiting generation now.
    ///
    /// `None` when nothing was waiting or no worker is attached.
    pub async fn request_activation(&self) -> Result<Option<ActivateReport>, CacheError> {
        let Some(ref worker) = self.worker else {
            log::debug!("Instance {} has no worker to activate", self.instance_id());
            return Ok(None);
        };
        worker.message(ControlMessage::SkipWaiting).await
    }

    /// Install `config` in the worker.
    ///
    /// A generation that ends up waiting while a controller exists is
    /// activated straight away; the switch then arrives as a
    /// `ControllerChanged` event. `None` when no worker is attached.
    pub async fn check_for_update(
        &self,
        config: CacheConfig,
    ) -> Result<Option<UpdateOutcome>, CacheError> {
        let Some(ref worker) = self.worker else {
            return Ok(None);
        };
        let summary = worker.install(config).await?;
        if let UpdateOutcome::Waiting(ref installed) = summary.update {
            let controlled = worker.registration().controller().borrow().is_some();
            if controlled {
                log::info!("{} installed; requesting activation", installed.generation);
                self.request_activation().await?;
            }
        }
        Ok(Some(summary.update))
    }

    /// Leave the wake channel and stop the loop. A flush in progress
    /// completes its current item first.
    pub async fn shutdown(&mut self) {
        self.shutdown.notify_one();
        if let Some(task) = self.task.take() {
            if let Err(e) = task.await {
                log::warn!("Instance {} loop ended abnormally: {e}", self.instance_id());
            }
        }
    }
}

impl Drop for AppInstance {
    fn drop(&mut self) {
        let Some(task) = self.task.take() else {
            return;
        };
        task.abort();
        // The aborted loop never reaches its own cleanup.
        let channel = self.channel.clone();
        let id = self.instance_id().clone();
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move {
                    channel.remove_instance(&id).await;
                });
            }
            Err(_) => log::debug!("Instance {id} dropped outside a runtime; membership kept"),
        }
    }
}

async fn trigger_loop(
    outbox: Arc<Outbox>,
    channel: Arc<WakeChannel>,
    mut wake_rx: tokio::sync::broadcast::Receiver<ControlMessage>,
    mut controller_rx: Option<watch::Receiver<Option<String>>>,
    focus: Arc<Notify>,
    shutdown: Arc<Notify>,
    event_tx: mpsc::Sender<InstanceEvent>,
) {
    let mut online_rx = outbox.connectivity().subscribe();
    let mut identity_rx = outbox.identity().watch();

    run_flush(&outbox, FlushTrigger::Start, &event_tx).await;

    loop {
        let trigger = tokio::select! {
            _ = shutdown.notified() => break,
            msg = wake_rx.recv() => match msg {
                Ok(ControlMessage::FlushRequested) => FlushTrigger::WakeBroadcast,
                Ok(_) => continue,
                // Missed messages can only have been flush requests worth honouring.
                Err(RecvError::Lagged(_)) => FlushTrigger::WakeBroadcast,
                Err(RecvError::Closed) => break,
            },
            changed = online_rx.changed() => {
                if changed.is_err() {
                    break;
                }
                if !*online_rx.borrow_and_update() {
                    continue;
                }
                FlushTrigger::Online
            }
            changed = identity_rx.changed() => {
                if changed.is_err() {
                    break;
                }
                if identity_rx.borrow_and_update().is_none() {
                    continue;
                }
                FlushTrigger::SignIn
            }
            _ = focus.notified() => FlushTrigger::Focus,
            generation = controller_change(&mut controller_rx) => {
                log::info!(
                    "Instance {} now controlled by {}",
                    outbox.instance_id(),
                    generation.as_deref().unwrap_or("nothing")
                );
                emit(&event_tx, InstanceEvent::ControllerChanged { generation });
                continue;
            }
        };
        run_flush(&outbox, trigger, &event_tx).await;
    }

    channel.remove_instance(outbox.instance_id()).await;
    emit(&event_tx, InstanceEvent::Stopped);
    log::info!("Instance {} stopped", outbox.instance_id());
}

/// Next controller tag; pends forever without a worker or once it is gone.
async fn controller_change(rx: &mut Option<watch::Receiver<Option<String>>>) -> Option<String> {
    let closed = match rx.as_mut() {
        Some(inner) => match inner.changed().await {
            Ok(()) => return inner.borrow_and_update().clone(),
            Err(_) => true,
        },
        None => false,
    };
    if closed {
        *rx = None;
    }
    std::future::pending().await
}

async fn run_flush(outbox: &Outbox, trigger: FlushTrigger, event_tx: &mpsc::Sender<InstanceEvent>) {
    let event = match outbox.flush().await {
        Ok(FlushOutcome::Completed(report)) => InstanceEvent::Flushed { trigger, report },
        Ok(outcome) => {
            log::debug!("Flush ({trigger:?}) skipped: {outcome:?}");
            InstanceEvent::FlushSkipped { trigger, outcome }
        }
        Err(e) => {
            log::warn!("Flush ({trigger:?}) failed: {e}");
            InstanceEvent::FlushFailed {
                trigger,
                error: e.to_string(),
            }
        }
    };
    emit(event_tx, event);
}

/// Events are advisory: a full or dropped receiver never stalls the loop.
fn emit(event_tx: &mpsc::Sender<InstanceEvent>, event: InstanceEvent) {
    if let Err(mpsc::error::TrySendError::Full(event)) = event_tx.try_send(event) {
        log::debug!("Event queue full; dropped {event:?}");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::fetch::CacheMode;
    use crate::cache::{FetchError, Fetcher, Request, Response};
    use crate::connectivity::Connectivity;
    use crate::identity::SessionIdentity;
    use crate::outbox::{OutboxConfig, WriteOutcome};
    use crate::platform::HeadlessPlatform;
    use crate::storage::MemoryStore;
    use crate::upload::{UploadError, Uploader};
    use async_trait::async_trait;
    use serde_json::{json, Value};
    use std::time::Duration;

    /// Answers every request with its own URL as the body.
    struct EchoFetcher;

    #[async_trait]
    impl Fetcher for EchoFetcher {
        async fn fetch(&self, request: &Request, _mode: CacheMode) -> Result<Response, FetchError> {
            Ok(Response::ok(request.url.clone()))
        }
    }

    struct AcceptAll;

    #[async_trait]
    impl Uploader for AcceptAll {
        async fn upload(&self, _payload: &Value) -> Result<(), UploadError> {
            Ok(())
        }
    }

    struct Harness {
        identity: Arc<SessionIdentity>,
        connectivity: Connectivity,
        channel: Arc<WakeChannel>,
        outbox: Arc<Outbox>,
    }

    fn harness(online: bool) -> Harness {
        let identity = Arc::new(SessionIdentity::signed_in("u1"));
        let connectivity = Connectivity::new(online);
        let outbox = Arc::new(Outbox::new(
            Arc::new(MemoryStore::new()),
            identity.clone(),
            Arc::new(AcceptAll),
            connectivity.clone(),
            OutboxConfig::default(),
        ));
        Harness {
            identity,
            connectivity,
            channel: Arc::new(WakeChannel::default()),
            outbox,
        }
    }

    async fn next(rx: &mut mpsc::Receiver<InstanceEvent>) -> InstanceEvent {
        tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .expect("timed out waiting for instance event")
            .expect("event channel closed")
    }

    async fn next_controller(rx: &mut mpsc::Receiver<InstanceEvent>) -> Option<String> {
        loop {
            if let InstanceEvent::ControllerChanged { generation } = next(rx).await {
                return generation;
            }
        }
    }

    fn cache_config(version: &str) -> CacheConfig {
        let mut config = CacheConfig::for_testing("https://sides.test/", version);
        config.manifest = vec!["index.html".to_string()];
        config
    }

    fn worker(h: &Harness) -> Arc<OfflineWorker> {
        Arc::new(OfflineWorker::new(
            Arc::new(MemoryStore::new()),
            Arc::new(EchoFetcher),
            Arc::new(HeadlessPlatform::full()),
            h.channel.clone(),
            h.connectivity.clone(),
        ))
    }

    #[tokio::test]
    async fn test_start_flushes_once() {
        let h = harness(false);
        let mut instance = AppInstance::start(h.outbox.clone(), h.channel.clone()).await;
        let mut events = instance.take_event_rx().unwrap();
        assert!(instance.take_event_rx().is_none());

        assert!(matches!(
            next(&mut events).await,
            InstanceEvent::FlushSkipped {
                trigger: FlushTrigger::Start,
                outcome: FlushOutcome::Offline
            }
        ));
        assert_eq!(h.channel.instance_count().await, 1);

        instance.shutdown().await;
        assert!(matches!(next(&mut events).await, InstanceEvent::Stopped));
        assert_eq!(h.channel.instance_count().await, 0);
    }

    #[tokio::test]
    async fn test_online_transition_flushes_queue() {
        let h = harness(false);
        let outcome = h.outbox.enqueue_or_write(json!({"kind": "note"})).await.unwrap();
        assert_eq!(outcome, WriteOutcome::Queued);

        let mut instance = AppInstance::start(h.outbox.clone(), h.channel.clone()).await;
        let mut events = instance.take_event_rx().unwrap();
        next(&mut events).await;

        h.connectivity.set_online(true);
        match next(&mut events).await {
            InstanceEvent::Flushed { trigger, report } => {
                assert_eq!(trigger, FlushTrigger::Online);
                assert_eq!(report.uploaded(), 1);
            }
            other => panic!("unexpected event {other:?}"),
        }
        assert_eq!(h.outbox.pending_count().unwrap(), 0);
        instance.shutdown().await;
    }

    #[tokio::test]
    async fn test_focus_and_sign_in_trigger() {
        let h = harness(true);
        h.identity.sign_out();
        let mut instance = AppInstance::start(h.outbox.clone(), h.channel.clone()).await;
        let mut events = instance.take_event_rx().unwrap();
        assert!(matches!(
            next(&mut events).await,
            InstanceEvent::FlushSkipped {
                outcome: FlushOutcome::NoIdentity,
                ..
            }
        ));

        h.identity.sign_in("u1");
        assert!(matches!(
            next(&mut events).await,
            InstanceEvent::Flushed {
                trigger: FlushTrigger::SignIn,
                ..
            }
        ));

        instance.regained_focus();
        assert!(matches!(
            next(&mut events).await,
            InstanceEvent::Flushed {
                trigger: FlushTrigger::Focus,
                ..
            }
        ));
        instance.shutdown().await;
    }

    #[tokio::test]
    async fn test_wake_broadcast_triggers_flush() {
        let h = harness(true);
        let mut instance = AppInstance::start(h.outbox.clone(), h.channel.clone()).await;
        let mut events = instance.take_event_rx().unwrap();
        next(&mut events).await;

        h.channel.broadcast(ControlMessage::SkipWaiting);
        assert_eq!(h.channel.broadcast(ControlMessage::FlushRequested), 1);
        assert!(matches!(
            next(&mut events).await,
            InstanceEvent::Flushed {
                trigger: FlushTrigger::WakeBroadcast,
                ..
            }
        ));
        instance.shutdown().await;
    }

    #[tokio::test]
    async fn test_waiting_generation_activated_on_request() {
        let h = harness(true);
        let worker = worker(&h);
        worker.install(cache_config("1")).await.unwrap();

        let mut instance = AppInstance::attach(h.outbox.clone(), worker.clone()).await;
        let mut events = instance.take_event_rx().unwrap();
        assert_eq!(h.channel.instance_count().await, 1);

        let summary = worker.install(cache_config("2")).await.unwrap();
        assert!(matches!(summary.update, UpdateOutcome::Waiting(_)));
        assert_eq!(worker.registration().active().await.unwrap().tag(), "test-app-v1");

        let report = instance.request_activation().await.unwrap().unwrap();
        assert_eq!(report.generation, "test-app-v2");
        assert_eq!(next_controller(&mut events).await.as_deref(), Some("test-app-v2"));

        // Nothing left waiting.
        assert!(instance.request_activation().await.unwrap().is_none());

        instance.shutdown().await;
        worker.shutdown().await;
    }

    #[tokio::test]
    async fn test_update_check_activates_new_generation() {
        let h = harness(true);
        let worker = worker(&h);
        worker.install(cache_config("1")).await.unwrap();

        let mut instance = AppInstance::attach(h.outbox.clone(), worker.clone()).await;
        let mut events = instance.take_event_rx().unwrap();

        let unchanged = instance.check_for_update(cache_config("1")).await.unwrap();
        assert!(matches!(unchanged, Some(UpdateOutcome::Unchanged)));

        let updated = instance.check_for_update(cache_config("3")).await.unwrap();
        assert!(matches!(updated, Some(UpdateOutcome::Waiting(_))));
        assert_eq!(next_controller(&mut events).await.as_deref(), Some("test-app-v3"));
        assert_eq!(worker.registration().active().await.unwrap().tag(), "test-app-v3");
        assert!(worker.registration().waiting().await.is_none());

        instance.shutdown().await;
        worker.shutdown().await;
    }

    #[tokio::test]
    async fn test_detached_instance_has_no_worker() {
        let h = harness(true);
        let mut instance = AppInstance::start(h.outbox.clone(), h.channel.clone()).await;
        assert!(instance.request_activation().await.unwrap().is_none());
        assert!(instance
            .check_for_update(cache_config("1"))
            .await
            .unwrap()
            .is_none());
        instance.shutdown().await;
    }

    #[tokio::test]
    async fn test_drop_leaves_wake_channel() {
        let h = harness(true);
        let instance = AppInstance::start(h.outbox.clone(), h.channel.clone()).await;
        assert_eq!(h.channel.instance_count().await, 1);

        drop(instance);
        for _ in 0..100 {
            if h.channel.instance_count().await == 0 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(h.channel.instance_count().await, 0);
    }
}
