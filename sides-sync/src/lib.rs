//! # sides-sync: offline synchronization core
//!
//! Keeps an application usable with unreliable connectivity: writes are
//! queued durably and uploaded later, and requests are served from a
//! versioned local cache.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────┐  FlushRequested   ┌──────────────────────────────┐
//! │ AppInstance │ ◄──────────────── │ OfflineWorker                │
//! │ (per tab)   │   (WakeChannel)   │  ├─ SyncCoordinator          │
//! │   Outbox    │ ────────────────► │  └─ Registration             │
//! └──────┬──────┘   SkipWaiting     │       └─ CacheManager (gen)  │
//!        │                          └──────────────┬───────────────┘
//!        │ QueueStore                   CacheStore │
//!        ▼                                         ▼
//! ┌────────────────────────────────────────────────────────────────┐
//! │ RocksStore (outbox / generations / cache_entries)  or memory   │
//! └────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`outbox`]: durable write queue with per-item leases
//! - [`cache`]: generation-versioned response cache and routing strategies
//! - [`coordinator`]: wake registration and flush fan-out
//! - [`instance`]: per-consumer flush trigger loop
//! - [`worker`]: interception process entry points
//! - [`storage`]: RocksDB and in-memory backends

pub mod cache;
pub mod config;
pub mod connectivity;
pub mod coordinator;
pub mod error;
pub mod identity;
pub mod instance;
pub mod outbox;
pub mod outcome;
pub mod platform;
pub mod storage;
pub mod upload;
pub mod worker;

// Re-exports for convenience
pub use cache::{
    CacheConfig, CacheError, CacheManager, FetchEvent, Fetcher, GenerationState, HttpFetcher,
    Registration, Request, Response, RouteDecision,
};
pub use config::{ConfigError, SyncConfig};
pub use connectivity::Connectivity;
pub use coordinator::{ControlMessage, SyncCoordinator, WakeChannel, SYNC_TAG};
pub use error::SyncError;
pub use identity::{Identity, IdentityProvider, SessionIdentity};
pub use instance::{AppInstance, FlushTrigger, InstanceEvent};
pub use outbox::{
    FlushOutcome, FlushReport, ItemOutcome, Outbox, OutboxConfig, QueueItem, WriteOutcome,
};
pub use outcome::Outcome;
pub use platform::{HeadlessPlatform, Platform};
pub use storage::{open_persistent_stores, open_stores, Durability, StoreConfig, StoreError, Stores};
pub use upload::{HttpUploader, UploadError, Uploader};
pub use worker::{InstallSummary, OfflineWorker};
