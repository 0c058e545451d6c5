//! unichat Gateway - HTTP surface for live chat aggregation
//!
//! Serves one merged server-sent event stream per viewer and receives the
//! platform traffic that feeds it.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────┐
//! │                     unichat Gateway                     │
//! ├─────────────────────────────────────────────────────────┤
//! │  GET  /api/aggregate      → Session Orchestrator → SSE  │
//! │  POST /api/poll/start     → Poll Coordinator            │
//! │  POST /api/webhooks/kick  → Webhook Ingress → relay     │
//! │  GET  /api/kick/stream    → relay channels → SSE        │
//! │  GET  /api/youtube/stream → relay channels → SSE        │
//! │  GET  /health, /status                                  │
//! ├─────────────────────────────────────────────────────────┤
//! │   Source Parser   │   Gateway Config (file + env)       │
//! └─────────────────────────────────────────────────────────┘
//! ```
//!
//! # Features
//!
//! - **Single stream per viewer**: `event:<kind>\ndata:<json>\n\n` frames
//! - **Stateless instances**: locks, cursors and relay live in the shared store
//! - **Verified webhooks**: rejected with 401 before the body is parsed

pub mod config;
pub mod error;
pub mod gateway;
pub mod sources;

pub use config::{GatewayConfig, KickTransport};
pub use error::{GatewayError, Result};
pub use gateway::{Gateway, GatewayState};
pub use sources::{SourceParser, UrlSourceParser};

/// Gateway version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Default HTTP port
pub const DEFAULT_PORT: u16 = 8787;

/// Default host
pub const DEFAULT_HOST: &str = "127.0.0.1";
