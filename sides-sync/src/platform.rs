//! Platform capabilities the interception process may or may not have.
//!
//! Capabilities are queried, never assumed: a platform without background
//! sync still works, it just relies on online/focus triggers.

use async_trait::async_trait;
use std::collections::HashSet;
use std::sync::Mutex;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum PlatformError {
    #[error("Capability not supported: {0}")]
    Unsupported(&'static str),
    #[error("Platform call failed: {0}")]
    Failed(String),
}

/// Wake-up and preload primitives offered by the host platform.
#[async_trait]
pub trait Platform: Send + Sync {
    fn supports_background_sync(&self) -> bool;

    /// Ask to be woken with `tag` once connectivity returns.
    /// Registering the same tag twice is a no-op on the platform side.
    async fn register_sync(&self, tag: &str) -> Result<(), PlatformError>;

    fn supports_navigation_preload(&self) -> bool;

    async fn enable_navigation_preload(&self) -> Result<(), PlatformError>;
}

/// In-process platform with switchable capabilities.
///
/// Used by the agent binary (which has no OS-level wake service) and by
/// tests exercising degraded paths.
#[derive(Default)]
pub struct HeadlessPlatform {
    background_sync: bool,
    navigation_preload: bool,
    registered: Mutex<HashSet<String>>,
    preload_enabled: Mutex<bool>,
}

impl HeadlessPlatform {
    pub fn new(background_sync: bool, navigation_preload: bool) -> Self {
        Self {
            background_sync,
            navigation_preload,
            ..Self::default()
        }
    }

    /// Platform with every capability.
    pub fn full() -> Self {
        Self::new(true, true)
    }

    /// Tags currently registered for a wake.
    pub fn registered_tags(&self) -> Vec<String> {
        match self.registered.lock() {
            Ok(tags) => tags.iter().cloned().collect(),
            Err(_) => Vec::new(),
        }
    }

    pub fn navigation_preload_enabled(&self) -> bool {
        self.preload_enabled.lock().map(|v| *v).unwrap_or(false)
    }
}

#[async_trait]
impl Platform for HeadlessPlatform {
    fn supports_background_sync(&self) -> bool {
        self.background_sync
    }

    async fn register_sync(&self, tag: &str) -> Result<(), PlatformError> {
        if !self.background_sync {
            return Err(PlatformError::Unsupported("background sync"));
        }
        let mut tags = self
            .registered
            .lock()
            .map_err(|_| PlatformError::Failed("registration table poisoned".into()))?;
        tags.insert(tag.to_string());
        Ok(())
    }

    fn supports_navigation_preload(&self) -> bool {
        self.navigation_preload
    }

    async fn enable_navigation_preload(&self) -> Result<(), PlatformError> {
        if !self.navigation_preload {
            return Err(PlatformError::Unsupported("navigation preload"));
        }
        let mut enabled = self
            .preload_enabled
            .lock()
            .map_err(|_| PlatformError::Failed("preload flag poisoned".into()))?;
        *enabled = true;
        Ok(())
    }
}
