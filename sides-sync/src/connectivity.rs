//! Shared online/offline signal.
//!
//! The embedding platform pushes connectivity changes in; the outbox reads
//! the current value before trying an immediate write, and instances and the
//! coordinator subscribe to transitions.

use std::sync::Arc;
use tokio::sync::watch;

/// Cloneable handle to one connectivity signal.
#[derive(Clone)]
pub struct Connectivity {
    tx: Arc<watch::Sender<bool>>,
}

impl Connectivity {
    pub fn new(online: bool) -> Self {
        let (tx, _) = watch::channel(online);
        Self { tx: Arc::new(tx) }
    }

    pub fn online() -> Self {
        Self::new(true)
    }

    pub fn offline() -> Self {
        Self::new(false)
    }

    pub fn is_online(&self) -> bool {
        *self.tx.borrow()
    }

    /// Record a platform observation. Receivers only wake on actual changes.
    pub fn set_online(&self, online: bool) {
        let changed = self.tx.send_if_modified(|current| {
            if *current == online {
                return false;
            }
            *current = online;
            true
        });
        if changed {
            log::info!("Connectivity changed: {}", if online { "online" } else { "offline" });
        }
    }

    pub fn subscribe(&self) -> watch::Receiver<bool> {
        self.tx.subscribe()
    }
}

impl Default for Connectivity {
    fn default() -> Self {
        Self::online()
    }
}
