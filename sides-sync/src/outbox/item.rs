//! Queue item and lease records.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::time::{Duration, SystemTime};
use uuid::Uuid;

use crate::identity::Identity;

/// Milliseconds since the Unix epoch.
pub(crate) fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

/// Short random suffix for generated ids.
fn random_suffix() -> String {
    let mut s = Uuid::new_v4().simple().to_string();
    s.truncate(12);
    s
}

/// Identifier of one running application instance (lease holder).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct InstanceId(String);

impl InstanceId {
    /// Fresh id: creation time plus randomness, stable for the instance's life.
    pub fn generate() -> Self {
        Self(format!("{:x}-{}", now_millis(), random_suffix()))
    }

    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for InstanceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Time-bounded, advisory-exclusive claim on a queue item.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Lease {
    pub holder: InstanceId,
    /// Unix millis when the lease was taken.
    pub acquired_at: u64,
}

impl Lease {
    pub fn new(holder: InstanceId, acquired_at: u64) -> Self {
        Self { holder, acquired_at }
    }

    /// A lease is abandoned once its age strictly exceeds the TTL.
    pub fn is_expired(&self, now: u64, ttl: Duration) -> bool {
        now.saturating_sub(self.acquired_at) > ttl.as_millis() as u64
    }

    pub fn is_held_by(&self, instance: &InstanceId) -> bool {
        &self.holder == instance
    }
}

/// One pending write.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueueItem {
    pub id: String,
    pub owner: Identity,
    /// Opaque operation handed unchanged to the uploader.
    pub payload: Value,
    /// Unix millis at enqueue.
    pub enqueued_at: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub claim: Option<Lease>,
}

impl QueueItem {
    /// New unclaimed item owned by `owner`.
    ///
    /// Id format: `<kind>-<millis>-<random>`; `kind` comes from the payload's
    /// `kind` field when it is a string.
    pub fn new(owner: Identity, payload: Value) -> Self {
        let enqueued_at = now_millis();
        let kind = payload
            .get("kind")
            .and_then(Value::as_str)
            .filter(|k| !k.is_empty())
            .unwrap_or("item");
        let id = format!("{kind}-{enqueued_at}-{}", random_suffix());
        Self {
            id,
            owner,
            payload,
            enqueued_at,
            claim: None,
        }
    }

    pub fn is_owned_by(&self, identity: &Identity) -> bool {
        &self.owner == identity
    }

    pub fn encode(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(bytes)
    }
}
