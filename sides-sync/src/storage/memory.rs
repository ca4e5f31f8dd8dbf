//! In-memory store: the fallback when persistent storage cannot be opened.
//!
//! Same transactional behaviour as the RocksDB store (one lock per table,
//! every call atomic), but nothing survives the process.

use std::collections::BTreeMap;
use std::sync::{Mutex, MutexGuard};

use super::{CacheStore, QueueStore, StoreError};
use crate::cache::entry::{CacheEntry, RequestKey};
use crate::outbox::item::QueueItem;

type Generations = BTreeMap<String, BTreeMap<RequestKey, CacheEntry>>;

#[derive(Default)]
pub struct MemoryStore {
    items: Mutex<BTreeMap<String, QueueItem>>,
    generations: Mutex<Generations>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn items(&self) -> Result<MutexGuard<'_, BTreeMap<String, QueueItem>>, StoreError> {
        self.items.lock().map_err(|_| StoreError::LockPoisoned)
    }

    fn generations(&self) -> Result<MutexGuard<'_, Generations>, StoreError> {
        self.generations.lock().map_err(|_| StoreError::LockPoisoned)
    }
}

impl QueueStore for MemoryStore {
    fn put_item(&self, item: &QueueItem) -> Result<(), StoreError> {
        self.items()?.insert(item.id.clone(), item.clone());
        Ok(())
    }

    fn get_item(&self, id: &str) -> Result<Option<QueueItem>, StoreError> {
        Ok(self.items()?.get(id).cloned())
    }

    fn delete_item(&self, id: &str) -> Result<(), StoreError> {
        self.items()?.remove(id);
        Ok(())
    }

    fn list_items(&self) -> Result<Vec<QueueItem>, StoreError> {
        Ok(self.items()?.values().cloned().collect())
    }

    fn update_item(
        &self,
        id: &str,
        apply: &mut dyn FnMut(&mut QueueItem) -> bool,
    ) -> Result<Option<bool>, StoreError> {
        let mut items = self.items()?;
        let Some(stored) = items.get_mut(id) else {
            return Ok(None);
        };
        // Work on a copy so a declined change leaves nothing behind.
        let mut candidate = stored.clone();
        if !apply(&mut candidate) {
            return Ok(Some(false));
        }
        *stored = candidate;
        Ok(Some(true))
    }
}

impl CacheStore for MemoryStore {
    fn create_generation(&self, tag: &str) -> Result<(), StoreError> {
        self.generations()?.entry(tag.to_string()).or_default();
        Ok(())
    }

    fn list_generations(&self) -> Result<Vec<String>, StoreError> {
        Ok(self.generations()?.keys().cloned().collect())
    }

    fn delete_generation(&self, tag: &str) -> Result<usize, StoreError> {
        Ok(self.generations()?.remove(tag).map_or(0, |entries| entries.len()))
    }

    fn put_entry(&self, entry: &CacheEntry) -> Result<bool, StoreError> {
        let mut generations = self.generations()?;
        let Some(entries) = generations.get_mut(&entry.generation) else {
            return Ok(false);
        };
        entries.insert(entry.key.clone(), entry.clone());
        Ok(true)
    }

    fn get_entry(&self, tag: &str, key: &RequestKey) -> Result<Option<CacheEntry>, StoreError> {
        Ok(self
            .generations()?
            .get(tag)
            .and_then(|entries| entries.get(key))
            .cloned())
    }

    fn list_entries(&self, tag: &str) -> Result<Vec<CacheEntry>, StoreError> {
        Ok(self
            .generations()?
            .get(tag)
            .map(|entries| entries.values().cloned().collect())
            .unwrap_or_default())
    }
}
