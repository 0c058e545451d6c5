//! In-process coordination store
//!
//! Used by tests and single-instance deployments. Expiry uses tokio's clock
//! so paused-time tests can fast-forward TTLs.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::RecvError;
use tokio::time::Instant;

use super::{CoordinationStore, RelayStream};
use crate::Result;

#[derive(Debug, Clone)]
struct Entry {
    value: String,
    expires_at: Instant,
}

impl Entry {
    fn is_live(&self, now: Instant) -> bool {
        now < self.expires_at
    }
}

/// Coordination store held entirely in memory
pub struct MemoryStore {
    entries: Mutex<HashMap<String, Entry>>,
    channels: Mutex<HashMap<String, broadcast::Sender<String>>>,
    published: Mutex<HashMap<String, usize>>,
    channel_capacity: usize,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::with_capacity(1024)
    }

    /// `channel_capacity` bounds how far a slow relay subscriber may lag
    pub fn with_capacity(channel_capacity: usize) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            channels: Mutex::new(HashMap::new()),
            published: Mutex::new(HashMap::new()),
            channel_capacity: channel_capacity.max(1),
        }
    }

    /// Number of payloads ever published on `channel`
    pub fn published_count(&self, channel: &str) -> usize {
        self.published.lock().get(channel).copied().unwrap_or(0)
    }

    /// Current holder of a lock key, if unexpired
    pub fn holder(&self, key: &str) -> Option<String> {
        let now = Instant::now();
        self.entries
            .lock()
            .get(key)
            .filter(|e| e.is_live(now))
            .map(|e| e.value.clone())
    }

    fn sender(&self, channel: &str) -> broadcast::Sender<String> {
        let mut channels = self.channels.lock();
        channels
            .entry(channel.to_string())
            .or_insert_with(|| broadcast::channel(self.channel_capacity).0)
            .clone()
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl CoordinationStore for MemoryStore {
    async fn acquire_lock(&self, key: &str, holder: &str, ttl: Duration) -> Result<bool> {
        let now = Instant::now();
        let mut entries = self.entries.lock();

        if let Some(current) = entries.get(key) {
            if current.is_live(now) && current.value != holder {
                return Ok(false);
            }
        }

        entries.insert(
            key.to_string(),
            Entry {
                value: holder.to_string(),
                expires_at: now + ttl,
            },
        );
        Ok(true)
    }

    async fn get(&self, key: &str) -> Result<Option<String>> {
        let now = Instant::now();
        let mut entries = self.entries.lock();
        match entries.get(key) {
            Some(entry) if entry.is_live(now) => Ok(Some(entry.value.clone())),
            Some(_) => {
                entries.remove(key);
                Ok(None)
            }
            None => Ok(None),
        }
    }

    async fn set_with_ttl(&self, key: &str, value: &str, ttl: Duration) -> Result<()> {
        let expires_at = Instant::now() + ttl;
        self.entries.lock().insert(
            key.to_string(),
            Entry {
                value: value.to_string(),
                expires_at,
            },
        );
        Ok(())
    }

    async fn publish(&self, channel: &str, payload: &str) -> Result<()> {
        *self.published.lock().entry(channel.to_string()).or_default() += 1;

        // No subscribers is not an error for pub/sub
        let receivers = self.sender(channel).send(payload.to_string()).unwrap_or(0);
        tracing::trace!("Published to {} ({} receivers)", channel, receivers);
        Ok(())
    }

    async fn subscribe(&self, channel: &str) -> Result<RelayStream> {
        let rx = self.sender(channel).subscribe();
        let channel = channel.to_string();

        let stream = futures::stream::unfold((rx, channel), |(mut rx, channel)| async move {
            loop {
                match rx.recv().await {
                    Ok(payload) => return Some((payload, (rx, channel))),
                    Err(RecvError::Lagged(skipped)) => {
                        tracing::warn!("Relay subscriber on {} lagged by {}", channel, skipped);
                    }
                    Err(RecvError::Closed) => return None,
                }
            }
        });

        Ok(Box::pin(stream))
    }
}
