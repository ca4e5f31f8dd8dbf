//! RocksDB-backed local store.
//!
//! Column families:
//! - `outbox`:        pending writes (JSON, keyed by item id)
//! - `generations`:   cache generation records (bincode, keyed by tag)
//! - `cache_entries`: response snapshots (bincode + LZ4, keyed by `tag\0request-key`)
//!
//! Read-modify-write sequences (lease claims, generation deletes) run under
//! an in-process transaction lock and commit through one `WriteBatch`, so
//! every instance sharing this store sees them as atomic.
//!
//! Reference: Kleppmann, DDIA, Chapter 3 (LSM Trees, SSTables)

use rocksdb::{
    BlockBasedOptions, Cache, ColumnFamilyDescriptor, DBCompressionType, DBWithThreadMode,
    Direction, IteratorMode, Options, SingleThreaded, WriteBatch, WriteOptions,
};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};

use super::{CacheStore, QueueStore, StoreError};
use crate::cache::entry::{CacheEntry, RequestKey};
use crate::outbox::item::{now_millis, QueueItem};

/// Column family names.
const CF_OUTBOX: &str = "outbox";
const CF_GENERATIONS: &str = "generations";
const CF_CACHE_ENTRIES: &str = "cache_entries";

/// All column family names for initialization.
const COLUMN_FAMILIES: &[&str] = &[CF_OUTBOX, CF_GENERATIONS, CF_CACHE_ENTRIES];

/// Separator between generation tag and request key in entry keys.
const KEY_SEPARATOR: u8 = 0;

/// Store configuration.
#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// Database directory path
    pub path: PathBuf,
    /// Block cache size in bytes (default: 32MB)
    pub block_cache_size: usize,
    /// Bloom filter bits per key (default: 10)
    pub bloom_filter_bits: i32,
    /// fsync on every write (default: true; a queued write must survive a crash)
    pub sync_writes: bool,
    /// Max open files for RocksDB (default: 256)
    pub max_open_files: i32,
    /// Write buffer size per column family (default: 8MB)
    pub write_buffer_size: usize,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("sides-data"),
            block_cache_size: 32 * 1024 * 1024,
            bloom_filter_bits: 10,
            sync_writes: true,
            max_open_files: 256,
            write_buffer_size: 8 * 1024 * 1024,
        }
    }
}

impl StoreConfig {
    /// Create config for testing (small caches, no fsync).
    pub fn for_testing(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            block_cache_size: 1024 * 1024,
            bloom_filter_bits: 10,
            sync_writes: false,
            max_open_files: 64,
            write_buffer_size: 1024 * 1024,
        }
    }
}

/// Generation record stored in the `generations` column family.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct GenerationRecord {
    tag: String,
    created_at: u64,
}

impl GenerationRecord {
    fn encode(&self) -> Result<Vec<u8>, StoreError> {
        bincode::serde::encode_to_vec(self, bincode::config::standard())
            .map_err(|e| StoreError::SerializationError(e.to_string()))
    }
}

/// RocksDB-backed queue and cache store.
pub struct RocksStore {
    /// RocksDB instance (single-threaded mode, shared via Arc)
    db: DBWithThreadMode<SingleThreaded>,
    config: StoreConfig,
    /// Serializes read-modify-write transactions.
    txn_lock: Mutex<()>,
}

impl RocksStore {
    /// Open the store at the configured path.
    ///
    /// Creates the database and column families if they don't exist.
    pub fn open(config: StoreConfig) -> Result<Self, StoreError> {
        let mut db_opts = Options::default();
        db_opts.create_if_missing(true);
        db_opts.create_missing_column_families(true);
        db_opts.set_max_open_files(config.max_open_files);
        db_opts.set_keep_log_file_num(5);

        let cf_descriptors: Vec<ColumnFamilyDescriptor> = COLUMN_FAMILIES
            .iter()
            .map(|name| ColumnFamilyDescriptor::new(*name, Self::cf_options(name, &config)))
            .collect();

        let db = DBWithThreadMode::<SingleThreaded>::open_cf_descriptors(
            &db_opts,
            &config.path,
            cf_descriptors,
        )?;

        Ok(Self {
            db,
            config,
            txn_lock: Mutex::new(()),
        })
    }

    /// Build column-family-specific options.
    fn cf_options(name: &str, config: &StoreConfig) -> Options {
        let mut opts = Options::default();

        let mut block_opts = BlockBasedOptions::default();
        let cache = Cache::new_lru_cache(config.block_cache_size);
        block_opts.set_block_cache(&cache);
        block_opts.set_bloom_filter(config.bloom_filter_bits as f64, false);
        opts.set_block_based_table_factory(&block_opts);
        opts.set_write_buffer_size(config.write_buffer_size);

        match name {
            CF_OUTBOX | CF_GENERATIONS => {
                // Few small records, point lookups
                opts.optimize_for_point_lookup(config.block_cache_size as u64);
                opts.set_compression_type(DBCompressionType::None);
            }
            CF_CACHE_ENTRIES => {
                // Values are already LZ4-compressed
                opts.set_compression_type(DBCompressionType::None);
                opts.set_max_write_buffer_number(3);
            }
            _ => {}
        }

        opts
    }

    /// Get the database path.
    pub fn path(&self) -> &Path {
        &self.config.path
    }

    /// Force a flush of memtables to disk.
    pub fn sync(&self) -> Result<(), StoreError> {
        self.db.flush()?;
        Ok(())
    }

    // ─── Helpers ──────────────────────────────────────────────────────

    fn cf(&self, name: &str) -> Result<&rocksdb::ColumnFamily, StoreError> {
        self.db
            .cf_handle(name)
            .ok_or_else(|| StoreError::DatabaseError(format!("Column family '{name}' not found")))
    }

    fn lock(&self) -> Result<MutexGuard<'_, ()>, StoreError> {
        self.txn_lock.lock().map_err(|_| StoreError::LockPoisoned)
    }

    fn write(&self, batch: WriteBatch) -> Result<(), StoreError> {
        let mut write_opts = WriteOptions::default();
        write_opts.set_sync(self.config.sync_writes);
        self.db.write_opt(batch, &write_opts)?;
        Ok(())
    }

    /// Prefix shared by every entry of a generation: `tag\0`.
    fn entry_prefix(tag: &str) -> Vec<u8> {
        let mut prefix = Vec::with_capacity(tag.len() + 1);
        prefix.extend_from_slice(tag.as_bytes());
        prefix.push(KEY_SEPARATOR);
        prefix
    }

    fn entry_key(tag: &str, key: &RequestKey) -> Vec<u8> {
        let mut full = Self::entry_prefix(tag);
        full.extend_from_slice(key.as_str().as_bytes());
        full
    }

    fn encode_entry(entry: &CacheEntry) -> Result<Vec<u8>, StoreError> {
        let raw = bincode::serde::encode_to_vec(entry, bincode::config::standard())
            .map_err(|e| StoreError::SerializationError(e.to_string()))?;
        Ok(lz4_flex::compress_prepend_size(&raw))
    }

    fn decode_entry(bytes: &[u8]) -> Result<CacheEntry, StoreError> {
        let raw = lz4_flex::decompress_size_prepended(bytes)
            .map_err(|e| StoreError::CompressionError(e.to_string()))?;
        let (entry, _) = bincode::serde::decode_from_slice(&raw, bincode::config::standard())
            .map_err(|e| StoreError::DeserializationError(e.to_string()))?;
        Ok(entry)
    }

    fn decode_item(bytes: &[u8]) -> Result<QueueItem, StoreError> {
        QueueItem::decode(bytes).map_err(|e| StoreError::DeserializationError(e.to_string()))
    }

    fn encode_item(item: &QueueItem) -> Result<Vec<u8>, StoreError> {
        item.encode()
            .map_err(|e| StoreError::SerializationError(e.to_string()))
    }

    fn generation_exists(&self, tag: &str) -> Result<bool, StoreError> {
        let cf = self.cf(CF_GENERATIONS)?;
        Ok(self.db.get_cf(&cf, tag.as_bytes())?.is_some())
    }

    /// Raw keys and values of one generation's entries.
    fn scan_generation(&self, tag: &str) -> Result<Vec<(Box<[u8]>, Box<[u8]>)>, StoreError> {
        let cf = self.cf(CF_CACHE_ENTRIES)?;
        let prefix = Self::entry_prefix(tag);

        let mut rows = Vec::new();
        let iter = self
            .db
            .iterator_cf(&cf, IteratorMode::From(&prefix, Direction::Forward));
        for item in iter {
            let (key, value) = item?;
            if !key.starts_with(&prefix) {
                break;
            }
            rows.push((key, value));
        }
        Ok(rows)
    }
}

impl QueueStore for RocksStore {
    fn put_item(&self, item: &QueueItem) -> Result<(), StoreError> {
        let cf = self.cf(CF_OUTBOX)?;
        let value = Self::encode_item(item)?;

        let _guard = self.lock()?;
        let mut batch = WriteBatch::default();
        batch.put_cf(&cf, item.id.as_bytes(), &value);
        self.write(batch)
    }

    fn get_item(&self, id: &str) -> Result<Option<QueueItem>, StoreError> {
        let cf = self.cf(CF_OUTBOX)?;
        match self.db.get_cf(&cf, id.as_bytes())? {
            Some(bytes) => Ok(Some(Self::decode_item(&bytes)?)),
            None => Ok(None),
        }
    }

    fn delete_item(&self, id: &str) -> Result<(), StoreError> {
        let cf = self.cf(CF_OUTBOX)?;

        let _guard = self.lock()?;
        let mut batch = WriteBatch::default();
        batch.delete_cf(&cf, id.as_bytes());
        self.write(batch)
    }

    fn list_items(&self) -> Result<Vec<QueueItem>, StoreError> {
        let cf = self.cf(CF_OUTBOX)?;
        let mut items = Vec::new();
        for row in self.db.iterator_cf(&cf, IteratorMode::Start) {
            let (_, value) = row?;
            items.push(Self::decode_item(&value)?);
        }
        Ok(items)
    }

    fn update_item(
        &self,
        id: &str,
        apply: &mut dyn FnMut(&mut QueueItem) -> bool,
    ) -> Result<Option<bool>, StoreError> {
        let cf = self.cf(CF_OUTBOX)?;

        let _guard = self.lock()?;
        let Some(bytes) = self.db.get_cf(&cf, id.as_bytes())? else {
            return Ok(None);
        };
        let mut item = Self::decode_item(&bytes)?;
        if !apply(&mut item) {
            return Ok(Some(false));
        }

        let mut batch = WriteBatch::default();
        batch.put_cf(&cf, id.as_bytes(), &Self::encode_item(&item)?);
        self.write(batch)?;
        Ok(Some(true))
    }
}

impl CacheStore for RocksStore {
    fn create_generation(&self, tag: &str) -> Result<(), StoreError> {
        let cf = self.cf(CF_GENERATIONS)?;

        let _guard = self.lock()?;
        if self.generation_exists(tag)? {
            return Ok(());
        }
        let record = GenerationRecord {
            tag: tag.to_string(),
            created_at: now_millis(),
        };
        let mut batch = WriteBatch::default();
        batch.put_cf(&cf, tag.as_bytes(), &record.encode()?);
        self.write(batch)
    }

    fn list_generations(&self) -> Result<Vec<String>, StoreError> {
        let cf = self.cf(CF_GENERATIONS)?;
        let mut tags = Vec::new();
        for row in self.db.iterator_cf(&cf, IteratorMode::Start) {
            let (key, _) = row?;
            tags.push(String::from_utf8_lossy(&key).into_owned());
        }
        Ok(tags)
    }

    fn delete_generation(&self, tag: &str) -> Result<usize, StoreError> {
        let cf_gen = self.cf(CF_GENERATIONS)?;
        let cf_entries = self.cf(CF_CACHE_ENTRIES)?;

        let _guard = self.lock()?;
        let rows = self.scan_generation(tag)?;

        let mut batch = WriteBatch::default();
        batch.delete_cf(&cf_gen, tag.as_bytes());
        for (key, _) in &rows {
            batch.delete_cf(&cf_entries, key);
        }
        self.write(batch)?;
        Ok(rows.len())
    }

    fn put_entry(&self, entry: &CacheEntry) -> Result<bool, StoreError> {
        let cf = self.cf(CF_CACHE_ENTRIES)?;
        let value = Self::encode_entry(entry)?;

        let _guard = self.lock()?;
        if !self.generation_exists(&entry.generation)? {
            return Ok(false);
        }
        let mut batch = WriteBatch::default();
        batch.put_cf(&cf, Self::entry_key(&entry.generation, &entry.key), &value);
        self.write(batch)?;
        Ok(true)
    }

    fn get_entry(&self, tag: &str, key: &RequestKey) -> Result<Option<CacheEntry>, StoreError> {
        let cf = self.cf(CF_CACHE_ENTRIES)?;
        match self.db.get_cf(&cf, Self::entry_key(tag, key))? {
            Some(bytes) => Ok(Some(Self::decode_entry(&bytes)?)),
            None => Ok(None),
        }
    }

    fn list_entries(&self, tag: &str) -> Result<Vec<CacheEntry>, StoreError> {
        self.scan_generation(tag)?
            .iter()
            .map(|(_, value)| Self::decode_entry(value))
            .collect()
    }
}
