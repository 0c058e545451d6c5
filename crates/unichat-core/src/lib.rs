//! unichat core - live chat aggregation engine
//!
//! Merges chat from platforms with very different transports into one
//! ordered stream per viewer, and coordinates several stateless gateway
//! instances through a shared store.
//!
//! # Architecture
//!
//! ```text
//! ┌───────────────────────────────────────────────────────────┐
//! │                    Session Orchestrator                   │
//! │      meta → (chat | info | error)* with ping keepalive    │
//! └─────────────────────────────▲─────────────────────────────┘
//!                               │ bounded merge channel
//!        ┌──────────────────────┼──────────────────────┐
//!   ┌────┴─────┐          ┌─────┴─────┐          ┌─────┴─────┐
//!   │   Push   │          │   Poll    │          │   Relay   │
//!   │ (Twitch) │          │ (YouTube) │          │  (Kick)   │
//!   └──────────┘          └─────┬─────┘          └─────▲─────┘
//!                     lock/cursor│publish     subscribe│
//!                         ┌──────▼──────────────────────┴──┐
//!                         │       Coordination Store       │
//!                         └──────────────▲─────────────────┘
//!                                        │ publish
//!                               ┌────────┴────────┐
//!                               │ Webhook Ingress │ ← signed webhooks
//!                               └─────────────────┘
//! ```
//!
//! # Features
//!
//! - **One poller per room**: store lock with expiry, cursor persisted per page
//! - **Webhook relay**: verified events reach whichever instance serves the viewer
//! - **Direct Kick socket**: optional Pusher ingestion instead of webhooks
//! - **Independent degradation**: a failing source never ends the session
//! - **Bounded teardown**: adapters stop within a fixed timeout

pub mod adapter;
pub mod error;
pub mod ingress;
pub mod platform;
pub mod session;
pub mod settings;
pub mod store;
pub mod types;
pub mod verify;

pub use adapter::{AdapterHandle, AdapterStatus, ChatAdapter, EventSink};
pub use error::{ChatError, Result, ResultExt};
pub use ingress::{IngressOutcome, WebhookHeaders, WebhookIngress};
pub use session::{AdapterRegistry, Session, SessionId, SessionManager, SessionOrchestrator};
pub use settings::{IngressSettings, PollSettings, PushSettings, SessionSettings};
pub use store::{CoordinationStore, MemoryStore, SharedStore, StoreKey, UpstashStore};
pub use types::{ChatEvent, Diagnostic, Frame, FrameKind, Platform, SourceDescriptor};
pub use verify::{PublicKeySource, RsaSha256Verifier, SignatureVerifier};
