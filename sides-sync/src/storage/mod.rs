//! Local persistent storage shared by every instance on the device.
//!
//! Architecture:
//! ```text
//! ┌──────────────┐                 ┌───────────────────────────────────────┐
//! │ Outbox       │ ── QueueStore ─►│ CF "outbox"        id → QueueItem     │
//! │ (per inst.)  │                 │                                       │
//! └──────────────┘                 │ CF "generations"   tag → record       │
//! ┌──────────────┐                 │                                       │
//! │ CacheManager │ ── CacheStore ─►│ CF "cache_entries" tag\0key → entry   │
//! │ (per gen.)   │                 └───────────────────────────────────────┘
//! └──────────────┘                        RocksStore / MemoryStore
//! ```
//!
//! Every mutating call is a single atomic transaction: readers never observe
//! a half-applied claim or a partially deleted generation.

pub mod memory;
pub mod rocks;

use std::sync::Arc;
use thiserror::Error;

use crate::cache::entry::{CacheEntry, RequestKey};
use crate::outbox::item::QueueItem;
use crate::outcome::Outcome;

pub use memory::MemoryStore;
pub use rocks::{RocksStore, StoreConfig};

/// Storage errors.
#[derive(Debug, Clone, Error)]
pub enum StoreError {
    #[error("Database error: {0}")]
    DatabaseError(String),
    #[error("Serialization error: {0}")]
    SerializationError(String),
    #[error("Deserialization error: {0}")]
    DeserializationError(String),
    #[error("Compression error: {0}")]
    CompressionError(String),
    #[error("Storage lock poisoned")]
    LockPoisoned,
}

impl From<rocksdb::Error> for StoreError {
    fn from(e: rocksdb::Error) -> Self {
        StoreError::DatabaseError(e.to_string())
    }
}

/// Durable table of pending writes, keyed by item id.
pub trait QueueStore: Send + Sync {
    fn put_item(&self, item: &QueueItem) -> Result<(), StoreError>;

    fn get_item(&self, id: &str) -> Result<Option<QueueItem>, StoreError>;

    fn delete_item(&self, id: &str) -> Result<(), StoreError>;

    /// Snapshot of every item, in key order.
    fn list_items(&self) -> Result<Vec<QueueItem>, StoreError>;

    /// Atomic read-modify-write of one item.
    ///
    /// `apply` returns whether it changed the item; only then is it written
    /// back. Returns `None` when the item does not exist, otherwise the
    /// value `apply` returned.
    fn update_item(
        &self,
        id: &str,
        apply: &mut dyn FnMut(&mut QueueItem) -> bool,
    ) -> Result<Option<bool>, StoreError>;
}

/// Generation-partitioned response cache.
pub trait CacheStore: Send + Sync {
    /// Create the generation if missing (opening an existing one is a no-op).
    fn create_generation(&self, tag: &str) -> Result<(), StoreError>;

    fn list_generations(&self) -> Result<Vec<String>, StoreError>;

    /// Delete a generation and all of its entries in one batch.
    /// Returns the number of entries removed.
    fn delete_generation(&self, tag: &str) -> Result<usize, StoreError>;

    /// Insert or overwrite an entry.
    ///
    /// Returns `false` without writing when the entry's generation no longer
    /// exists, so a late background refresh cannot resurrect a collected
    /// generation.
    fn put_entry(&self, entry: &CacheEntry) -> Result<bool, StoreError>;

    fn get_entry(&self, tag: &str, key: &RequestKey) -> Result<Option<CacheEntry>, StoreError>;

    fn list_entries(&self, tag: &str) -> Result<Vec<CacheEntry>, StoreError>;
}

/// Whether the opened stores survive a restart.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Durability {
    Persistent,
    Memory,
}

/// Handles to the queue and cache tables of one origin.
#[derive(Clone)]
pub struct Stores {
    pub queue: Arc<dyn QueueStore>,
    pub cache: Arc<dyn CacheStore>,
    pub durability: Durability,
}

impl Stores {
    pub fn memory() -> Self {
        let store = Arc::new(MemoryStore::new());
        Self {
            queue: store.clone(),
            cache: store,
            durability: Durability::Memory,
        }
    }

    pub fn rocks(store: RocksStore) -> Self {
        let store = Arc::new(store);
        Self {
            queue: store.clone(),
            cache: store,
            durability: Durability::Persistent,
        }
    }
}

/// Open persistent storage, or fail.
///
/// For short-lived processes: a write queued into memory would vanish on
/// exit, so they must not fall back.
pub fn open_persistent_stores(config: StoreConfig) -> Result<Stores, StoreError> {
    let path = config.path.clone();
    let store = RocksStore::open(config)?;
    log::info!("Opened persistent store at {}", path.display());
    Ok(Stores::rocks(store))
}

/// Open persistent storage, falling back to memory if that is impossible.
///
/// The fallback keeps a long-running process usable (writes still queue and
/// flush while it lives) and is reported as `FailedNonFatal`.
pub fn open_stores(config: StoreConfig) -> (Stores, Outcome) {
    let path = config.path.clone();
    match open_persistent_stores(config) {
        Ok(stores) => (stores, Outcome::Succeeded),
        Err(e) => {
            log::warn!(
                "Persistent store unavailable at {} ({e}); falling back to memory",
                path.display()
            );
            (Stores::memory(), Outcome::FailedNonFatal(e.to_string()))
        }
    }
}
