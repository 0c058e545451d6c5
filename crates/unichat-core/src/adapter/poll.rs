//! Poll variant: cursor-paginated fetching, elected across instances.
//!
//! At most one process polls a given room. The winner of the store lock
//! fetches pages, emits locally, publishes every message to the room's relay
//! channel and persists the cursor after each page. Losers either close or
//! follow the relay channel and re-run the election once per lock TTL.

use async_trait::async_trait;
use futures::StreamExt;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use super::relay::forward_relay_payload;
use super::{AdapterContext, AdapterHandle, ChatAdapter, EventSink};
use crate::settings::PollSettings;
use crate::store::{RelayStream, SharedStore, StoreKey};
use crate::types::{ChatEvent, Platform, SourceDescriptor};
use crate::Result;

/// One page of messages from the platform
#[derive(Debug, Clone, Default)]
pub struct PollPage {
    pub messages: Vec<ChatEvent>,
    /// Cursor for the next fetch; `None` keeps the current one
    pub next_cursor: Option<String>,
    /// Platform-suggested delay before the next fetch
    pub interval_ms: Option<u64>,
}

/// Platform-specific fetching for the poll variant
#[async_trait]
pub trait ChatPoller: Send + Sync {
    /// Resolve a raw content id to a stable room id; `None` when there is
    /// no live chat to poll
    async fn resolve_room(&self, raw_id: &str) -> Result<Option<String>>;

    async fn fetch_page(&self, room: &str, cursor: Option<&str>) -> Result<PollPage>;
}

/// How a polling cycle ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CycleEnd {
    /// Budget spent; the caller may re-elect and run another cycle
    Deadline,
    Cancelled,
    /// The local session went away
    SinkClosed,
    /// Too many consecutive failures
    Failed(String),
}

#[derive(Debug, Clone)]
pub struct CycleReport {
    pub emitted: usize,
    pub cursor: Option<String>,
    pub end: CycleEnd,
}

/// Result of one trigger request for an identifier
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TriggerReport {
    pub identifier: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub room: Option<String>,
    pub started: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

impl TriggerReport {
    fn skipped(identifier: &str, room: Option<String>, reason: impl Into<String>) -> Self {
        Self {
            identifier: identifier.to_string(),
            room,
            started: false,
            reason: Some(reason.into()),
        }
    }
}

/// Election, cursor persistence and the bounded polling cycle
#[derive(Clone)]
pub struct PollCoordinator {
    poller: Arc<dyn ChatPoller>,
    store: SharedStore,
    settings: PollSettings,
}

const PLATFORM: Platform = Platform::PollChat;

impl PollCoordinator {
    pub fn new(poller: Arc<dyn ChatPoller>, store: SharedStore, settings: PollSettings) -> Self {
        Self {
            poller,
            store,
            settings,
        }
    }

    pub fn settings(&self) -> &PollSettings {
        &self.settings
    }

    pub fn store(&self) -> &SharedStore {
        &self.store
    }

    /// Resolve `raw_id` to a room, consulting the store cache first
    pub async fn resolve_room(&self, raw_id: &str) -> Result<Option<String>> {
        let key = StoreKey::resolved(PLATFORM, raw_id);
        match self.store.get(&key).await {
            Ok(Some(room)) => return Ok(Some(room)),
            Ok(None) => {}
            Err(e) => tracing::warn!(raw_id = %raw_id, "Resolution cache read failed: {}", e),
        }

        let Some(room) = self.poller.resolve_room(raw_id).await? else {
            return Ok(None);
        };

        if let Err(e) = self
            .store
            .set_with_ttl(&key, &room, self.settings.resolve_ttl())
            .await
        {
            tracing::warn!(raw_id = %raw_id, "Resolution cache write failed: {}", e);
        }
        Ok(Some(room))
    }

    /// Try to become (or stay) the room's poller
    pub async fn elect(&self, room: &str, holder: &str) -> Result<bool> {
        self.store
            .acquire_lock(&StoreKey::lock(PLATFORM, room), holder, self.settings.lock_ttl())
            .await
    }

    pub async fn load_cursor(&self, room: &str) -> Result<Option<String>> {
        self.store.get(&StoreKey::cursor(PLATFORM, room)).await
    }

    async fn persist_cursor(&self, room: &str, cursor: &str) -> Result<()> {
        self.store
            .set_with_ttl(&StoreKey::cursor(PLATFORM, room), cursor, self.settings.cursor_ttl())
            .await
    }

    async fn publish(&self, room: &str, event: &ChatEvent) -> Result<()> {
        let payload = serde_json::to_string(event)?;
        self.store
            .publish(&StoreKey::relay(PLATFORM, room), &payload)
            .await
    }

    /// Subscribe to the events the elected poller publishes for `room`
    pub async fn follow(&self, room: &str) -> Result<RelayStream> {
        self.store.subscribe(&StoreKey::relay(PLATFORM, room)).await
    }

    /// Run one bounded polling cycle as the elected poller.
    ///
    /// With `local` set, messages are also emitted to that session and
    /// failures are reported through it.
    pub async fn run_cycle(
        &self,
        room: &str,
        start_cursor: Option<String>,
        cancel: &CancellationToken,
        local: Option<&AdapterContext>,
    ) -> CycleReport {
        let deadline = Instant::now() + self.settings.cycle_budget();
        let mut cursor = start_cursor;
        let mut emitted = 0;
        let mut failures: u32 = 0;

        let end = loop {
            if cancel.is_cancelled() {
                break CycleEnd::Cancelled;
            }

            let wait = match self.poller.fetch_page(room, cursor.as_deref()).await {
                Ok(page) => {
                    let interval = self.settings.clamp_interval(page.interval_ms);
                    let mut page_ok = true;

                    for event in page.messages {
                        if let Some(ctx) = local {
                            if !ctx.chat(event.clone()).await {
                                return CycleReport {
                                    emitted,
                                    cursor,
                                    end: CycleEnd::SinkClosed,
                                };
                            }
                        }
                        emitted += 1;
                        if let Err(e) = self.publish(room, &event).await {
                            tracing::warn!(room = %room, "Relay publish failed: {}", e);
                            page_ok = false;
                        }
                    }

                    if let Some(next) = page.next_cursor {
                        if let Err(e) = self.persist_cursor(room, &next).await {
                            tracing::warn!(room = %room, "Cursor persist failed: {}", e);
                            page_ok = false;
                        }
                        cursor = Some(next);
                    }
                    if let Some(ctx) = local {
                        ctx.record_cursor(cursor.clone());
                    }

                    if page_ok {
                        failures = 0;
                        if let Some(ctx) = local {
                            ctx.active();
                        }
                        interval
                    } else {
                        failures += 1;
                        if let Some(ctx) = local {
                            ctx.failure("store_failed", "coordination store unavailable").await;
                        }
                        self.settings.error_interval()
                    }
                }
                Err(e) => {
                    failures += 1;
                    tracing::warn!(room = %room, failures, "Poll fetch failed: {}", e);
                    if let Some(ctx) = local {
                        ctx.failure("fetch_failed", e.to_string()).await;
                    }
                    self.settings.error_interval()
                }
            };

            if failures >= self.settings.max_consecutive_failures {
                break CycleEnd::Failed(format!("{failures} consecutive polling failures"));
            }

            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                break CycleEnd::Deadline;
            }
            tokio::select! {
                _ = cancel.cancelled() => break CycleEnd::Cancelled,
                _ = tokio::time::sleep(wait.min(remaining)) => {}
            }
            if Instant::now() >= deadline {
                break CycleEnd::Deadline;
            }
        };

        CycleReport {
            emitted,
            cursor,
            end,
        }
    }

    /// One cycle for one identifier, without a local session.
    ///
    /// Each call uses a fresh holder token, so it only runs when no other
    /// instance currently owns the room.
    pub async fn trigger_one(&self, identifier: &str, cancel: &CancellationToken) -> TriggerReport {
        let room = match self.resolve_room(identifier).await {
            Ok(Some(room)) => room,
            Ok(None) => return TriggerReport::skipped(identifier, None, "no_room"),
            Err(e) => return TriggerReport::skipped(identifier, None, e.to_string()),
        };

        let holder = Uuid::new_v4().to_string();
        match self.elect(&room, &holder).await {
            Ok(true) => {}
            Ok(false) => return TriggerReport::skipped(identifier, Some(room), "locked"),
            Err(e) => return TriggerReport::skipped(identifier, Some(room), e.to_string()),
        }

        let cursor = match self.load_cursor(&room).await {
            Ok(cursor) => cursor,
            Err(e) => return TriggerReport::skipped(identifier, Some(room), e.to_string()),
        };

        let report = self.run_cycle(&room, cursor, cancel, None).await;
        tracing::info!(
            room = %room,
            emitted = report.emitted,
            "Triggered poll cycle ended: {:?}",
            report.end
        );

        TriggerReport {
            identifier: identifier.to_string(),
            room: Some(room),
            started: true,
            reason: None,
        }
    }

    /// Run one cycle per identifier, concurrently
    pub async fn trigger(&self, identifiers: &[String], cancel: &CancellationToken) -> Vec<TriggerReport> {
        futures::future::join_all(identifiers.iter().map(|id| self.trigger_one(id, cancel))).await
    }
}

/// Session-facing poll adapter
#[derive(Clone)]
pub struct PollAdapter {
    coordinator: PollCoordinator,
}

impl PollAdapter {
    pub fn new(coordinator: PollCoordinator) -> Self {
        Self { coordinator }
    }

    pub fn coordinator(&self) -> &PollCoordinator {
        &self.coordinator
    }
}

#[async_trait]
impl ChatAdapter for PollAdapter {
    fn platform(&self) -> Platform {
        PLATFORM
    }

    fn start(
        &self,
        descriptor: SourceDescriptor,
        sink: EventSink,
        cancel: CancellationToken,
    ) -> AdapterHandle {
        let raw_id = descriptor.raw_id.trim().to_string();
        let coordinator = self.coordinator.clone();

        AdapterHandle::spawn(descriptor, raw_id.clone(), sink, cancel, move |ctx| {
            run_poll(coordinator, raw_id, ctx)
        })
    }
}

async fn run_poll(coordinator: PollCoordinator, raw_id: String, ctx: AdapterContext) {
    let settings = coordinator.settings().clone();

    let room = match coordinator.resolve_room(&raw_id).await {
        Ok(Some(room)) => room,
        Ok(None) => {
            ctx.finish("no_room", "no active live chat").await;
            return;
        }
        Err(e) => {
            ctx.terminal(format!("could not resolve live chat: {e}")).await;
            return;
        }
    };

    let holder = Uuid::new_v4().to_string();
    let mut store_failures: u32 = 0;
    let mut following: Option<RelayStream> = None;

    loop {
        if ctx.is_cancelled() {
            return;
        }

        let elected = match coordinator.elect(&room, &holder).await {
            Ok(elected) => elected,
            Err(e) => {
                store_failures += 1;
                if store_failures >= settings.max_consecutive_failures {
                    ctx.terminal(format!("coordination store unavailable: {e}")).await;
                    return;
                }
                if !ctx.failure("store_failed", e.to_string()).await {
                    return;
                }
                if !pause(&ctx, settings.error_interval()).await {
                    return;
                }
                continue;
            }
        };

        if elected {
            if following.take().is_some() {
                tracing::info!(room = %room, "Took over polling from previous holder");
            }

            let cursor = match coordinator.load_cursor(&room).await {
                Ok(cursor) => cursor,
                Err(e) => {
                    // Never restart from the beginning on a read failure
                    store_failures += 1;
                    if store_failures >= settings.max_consecutive_failures {
                        ctx.terminal(format!("coordination store unavailable: {e}")).await;
                        return;
                    }
                    if !ctx.failure("store_failed", e.to_string()).await {
                        return;
                    }
                    if !pause(&ctx, settings.error_interval()).await {
                        return;
                    }
                    continue;
                }
            };
            store_failures = 0;
            ctx.active();
            if !ctx.info("polling", None).await {
                return;
            }

            let report = coordinator
                .run_cycle(&room, cursor, ctx.cancel_token(), Some(&ctx))
                .await;
            tracing::debug!(room = %room, emitted = report.emitted, "Poll cycle ended: {:?}", report.end);

            match report.end {
                CycleEnd::Deadline => continue,
                CycleEnd::Cancelled | CycleEnd::SinkClosed => return,
                CycleEnd::Failed(reason) => {
                    ctx.terminal(reason).await;
                    return;
                }
            }
        }

        store_failures = 0;
        if !settings.follow_relay_when_locked {
            ctx.finish("locked", "another instance is polling this room").await;
            return;
        }

        if following.is_none() {
            match coordinator.follow(&room).await {
                Ok(stream) => {
                    ctx.active();
                    if !ctx.info("locked", Some("following the elected poller".to_string())).await {
                        return;
                    }
                    following = Some(stream);
                }
                Err(e) => {
                    if !ctx.failure("store_failed", e.to_string()).await {
                        return;
                    }
                    if !pause(&ctx, settings.error_interval()).await {
                        return;
                    }
                    continue;
                }
            }
        }

        let Some(stream) = following.as_mut() else {
            continue;
        };
        let retry_at = tokio::time::sleep(settings.lock_ttl());
        tokio::pin!(retry_at);
        let mut relay_ended = false;
        loop {
            tokio::select! {
                _ = ctx.cancel_token().cancelled() => return,
                _ = &mut retry_at => break,
                payload = stream.next() => match payload {
                    Some(payload) => {
                        if !forward_relay_payload(&ctx, &payload).await {
                            return;
                        }
                    }
                    None => {
                        tracing::debug!(room = %room, "Relay stream ended while following");
                        relay_ended = true;
                        break;
                    }
                },
            }
        }
        if relay_ended {
            following = None;
        }
    }
}

/// Cancellable sleep; `false` when cancelled
async fn pause(ctx: &AdapterContext, duration: Duration) -> bool {
    tokio::select! {
        _ = ctx.cancel_token().cancelled() => false,
        _ = tokio::time::sleep(duration) => true,
    }
}

impl std::fmt::Debug for PollCoordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PollCoordinator")
            .field("settings", &self.settings)
            .finish_non_exhaustive()
    }
}
