//! Coordination store: shared locks, cursors and the relay pub/sub
//!
//! Every instance of the gateway talks to the same store. Locks and cursors
//! are only ever mutated through atomic store primitives; nothing here does a
//! read-modify-write from the caller side.

pub mod memory;
pub mod upstash;

use async_trait::async_trait;
use futures::stream::BoxStream;
use std::sync::Arc;
use std::time::Duration;

use crate::types::Platform;
use crate::Result;

pub use memory::MemoryStore;
pub use upstash::{relay_payload_stream, RelayLineBuffer, UpstashStore};

/// Stream of relay payloads for one channel
pub type RelayStream = BoxStream<'static, String>;

/// Shared handle injected into adapters and the ingress
pub type SharedStore = Arc<dyn CoordinationStore>;

/// Capability interface over the shared key/value + pub/sub service.
///
/// Reads may briefly lag a very recent write from another instance; lock
/// TTLs are chosen well above that lag.
#[async_trait]
pub trait CoordinationStore: Send + Sync {
    /// Test-and-set with expiry. Succeeds when the key is free (or expired),
    /// or already held by `holder`, in which case the expiry is renewed.
    async fn acquire_lock(&self, key: &str, holder: &str, ttl: Duration) -> Result<bool>;

    async fn get(&self, key: &str) -> Result<Option<String>>;

    async fn set_with_ttl(&self, key: &str, value: &str, ttl: Duration) -> Result<()>;

    async fn publish(&self, channel: &str, payload: &str) -> Result<()>;

    async fn subscribe(&self, channel: &str) -> Result<RelayStream>;
}

/// Key and channel naming, namespaced by platform so rooms on different
/// platforms never collide.
pub struct StoreKey;

impl StoreKey {
    /// Poller election lock for a room
    pub fn lock(platform: Platform, room: &str) -> String {
        format!("{}:lock:{}", platform.as_str(), room)
    }

    /// Persisted pagination cursor for a room
    pub fn cursor(platform: Platform, room: &str) -> String {
        format!("{}:cursor:{}", platform.as_str(), room)
    }

    /// Cached raw-identifier → room-identity resolution
    pub fn resolved(platform: Platform, raw_id: &str) -> String {
        format!("{}:room:{}", platform.as_str(), raw_id)
    }

    /// Relay channel carrying normalized events for a room
    pub fn relay(platform: Platform, room: &str) -> String {
        format!("{}:{}", platform.as_str(), room)
    }
}
