//! Tunables for sessions and adapters
//!
//! Embedded in the gateway configuration file; every field has a default so
//! partial files deserialize.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Session orchestrator settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionSettings {
    /// Keepalive ping interval in seconds
    pub keepalive_secs: u64,

    /// Upper bound for stopping one adapter, in milliseconds
    pub teardown_timeout_ms: u64,

    /// How long a chat frame may wait for the viewer before the session is dropped
    pub sink_stall_timeout_ms: u64,

    /// Output channel capacity (frames)
    pub output_buffer: usize,

    /// Adapter-to-orchestrator merge channel capacity (frames)
    pub merge_buffer: usize,

    /// Most-recent chat events kept per session
    pub retention_window: usize,
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            keepalive_secs: 25,
            teardown_timeout_ms: 5_000,
            sink_stall_timeout_ms: 10_000,
            output_buffer: 256,
            merge_buffer: 256,
            retention_window: 200,
        }
    }
}

impl SessionSettings {
    pub fn keepalive_interval(&self) -> Duration {
        Duration::from_secs(self.keepalive_secs.max(1))
    }

    pub fn teardown_timeout(&self) -> Duration {
        Duration::from_millis(self.teardown_timeout_ms)
    }

    pub fn sink_stall_timeout(&self) -> Duration {
        Duration::from_millis(self.sink_stall_timeout_ms)
    }
}

/// Poll adapter settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PollSettings {
    /// Lock expiry in seconds; must exceed the cycle budget
    pub lock_ttl_secs: u64,

    /// Wall-clock budget for one polling cycle, in seconds
    pub cycle_budget_secs: u64,

    /// Cursor time-to-live in seconds
    pub cursor_ttl_secs: u64,

    /// Room resolution cache time-to-live in seconds
    pub resolve_ttl_secs: u64,

    /// Lower clamp for the inter-poll delay, in milliseconds
    pub min_interval_ms: u64,

    /// Upper clamp for the inter-poll delay, in milliseconds
    pub max_interval_ms: u64,

    /// Delay used when the platform suggests none, in milliseconds
    pub default_interval_ms: u64,

    /// Delay after a failed fetch, in milliseconds
    pub error_interval_ms: u64,

    /// Consecutive failures (fetch or store) before the adapter closes
    pub max_consecutive_failures: u32,

    /// Follow the relay channel when another instance holds the lock
    pub follow_relay_when_locked: bool,
}

impl Default for PollSettings {
    fn default() -> Self {
        Self {
            lock_ttl_secs: 58,
            cycle_budget_secs: 55,
            cursor_ttl_secs: 600,
            resolve_ttl_secs: 1_800,
            min_interval_ms: 1_000,
            max_interval_ms: 15_000,
            default_interval_ms: 4_000,
            error_interval_ms: 5_000,
            max_consecutive_failures: 5,
            follow_relay_when_locked: true,
        }
    }
}

impl PollSettings {
    pub fn lock_ttl(&self) -> Duration {
        Duration::from_secs(self.lock_ttl_secs)
    }

    pub fn cycle_budget(&self) -> Duration {
        Duration::from_secs(self.cycle_budget_secs)
    }

    pub fn cursor_ttl(&self) -> Duration {
        Duration::from_secs(self.cursor_ttl_secs)
    }

    pub fn resolve_ttl(&self) -> Duration {
        Duration::from_secs(self.resolve_ttl_secs)
    }

    /// Clamp a platform-suggested delay into `[min_interval, max_interval]`
    pub fn clamp_interval(&self, suggested_ms: Option<u64>) -> Duration {
        let ms = suggested_ms.unwrap_or(self.default_interval_ms);
        Duration::from_millis(ms.clamp(self.min_interval_ms, self.max_interval_ms))
    }

    pub fn error_interval(&self) -> Duration {
        Duration::from_millis(self.error_interval_ms.clamp(self.min_interval_ms, self.max_interval_ms))
    }
}

/// Push adapter settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PushSettings {
    /// Reconnect attempts after a dropped connection before giving up
    pub max_reconnects: u32,

    /// First reconnect delay in milliseconds, doubled per attempt
    pub reconnect_base_ms: u64,

    /// Connect handshake timeout in seconds
    pub connect_timeout_secs: u64,
}

impl Default for PushSettings {
    fn default() -> Self {
        Self {
            max_reconnects: 5,
            reconnect_base_ms: 1_000,
            connect_timeout_secs: 10,
        }
    }
}

impl PushSettings {
    /// Backoff before reconnect attempt `attempt` (1-based), capped at 30s
    pub fn reconnect_delay(&self, attempt: u32) -> Duration {
        let shift = attempt.saturating_sub(1).min(5);
        let ms = self.reconnect_base_ms.saturating_mul(1u64 << shift);
        Duration::from_millis(ms.min(30_000))
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }
}

/// Webhook ingress settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct IngressSettings {
    /// Trust-anchor endpoint serving the platform's public key
    pub public_key_url: String,

    /// How long a fetched public key is reused, in seconds
    pub public_key_ttl_secs: u64,

    /// Static PEM used instead of fetching, when set
    pub public_key_pem: Option<String>,
}

impl Default for IngressSettings {
    fn default() -> Self {
        Self {
            public_key_url: "https://api.kick.com/public/v1/public-key".to_string(),
            public_key_ttl_secs: 3_600,
            public_key_pem: None,
        }
    }
}

impl IngressSettings {
    pub fn public_key_ttl(&self) -> Duration {
        Duration::from_secs(self.public_key_ttl_secs)
    }
}
