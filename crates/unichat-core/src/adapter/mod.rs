//! Platform adapter contract
//!
//! Each adapter runs as one tokio task per (session × source) and talks to
//! the session only through its [`AdapterContext`]: chat frames, diagnostics,
//! and status transitions. Errors never cross the task boundary.

pub mod poll;
pub mod push;
pub mod relay;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::types::{ChatEvent, Diagnostic, Frame, Platform, SourceDescriptor};

pub use poll::{ChatPoller, PollAdapter, PollCoordinator, PollPage, TriggerReport};
pub use push::{PushAdapter, PushConnector, PushStream};
pub use relay::{RelayAdapter, WebhookSubscriber};

/// Runtime status of one adapter handle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AdapterStatus {
    Connecting,
    Active,
    /// Recoverable failure; cleared by the next successful operation
    Degraded,
    /// Terminal
    Closed,
}

impl AdapterStatus {
    /// Apply a transition; nothing leaves `Closed`
    pub fn transition(self, next: AdapterStatus) -> AdapterStatus {
        match self {
            AdapterStatus::Closed => AdapterStatus::Closed,
            _ => next,
        }
    }

    pub fn is_closed(&self) -> bool {
        matches!(self, AdapterStatus::Closed)
    }
}

/// Write side of the session's merge channel
#[derive(Debug, Clone)]
pub struct EventSink {
    tx: mpsc::Sender<Frame>,
}

impl EventSink {
    pub fn new(tx: mpsc::Sender<Frame>) -> Self {
        Self { tx }
    }

    /// Deliver a frame; `false` once the session is gone
    pub async fn emit(&self, frame: Frame) -> bool {
        self.tx.send(frame).await.is_ok()
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

/// Everything an adapter task needs to report back
pub struct AdapterContext {
    platform: Platform,
    room: String,
    sink: EventSink,
    cancel: CancellationToken,
    status: watch::Sender<AdapterStatus>,
    cursor: Arc<Mutex<Option<String>>>,
}

impl AdapterContext {
    pub fn platform(&self) -> Platform {
        self.platform
    }

    pub fn room(&self) -> &str {
        &self.room
    }

    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    pub fn status(&self) -> AdapterStatus {
        *self.status.borrow()
    }

    fn set_status(&self, next: AdapterStatus) {
        self.status.send_modify(|current| *current = current.transition(next));
    }

    fn diagnostic(&self) -> Diagnostic {
        Diagnostic::new(self.platform, self.room.clone())
    }

    /// Emit a chat frame; `false` once the session is gone
    pub async fn chat(&self, event: ChatEvent) -> bool {
        self.sink.emit(Frame::Chat(event)).await
    }

    /// Lifecycle notice that doesn't change status
    pub async fn info(&self, state: &str, message: Option<String>) -> bool {
        let mut diag = self.diagnostic().state(state);
        diag.message = message;
        self.sink.emit(Frame::Info(diag)).await
    }

    /// Mark the adapter as serving events
    pub fn active(&self) {
        self.set_status(AdapterStatus::Active);
    }

    /// Enter `Degraded` with an `info` notice (e.g. reconnecting)
    pub async fn degraded(&self, state: &str, message: impl Into<String>) -> bool {
        self.set_status(AdapterStatus::Degraded);
        let diag = self.diagnostic().state(state).message(message);
        self.sink.emit(Frame::Info(diag)).await
    }

    /// Enter `Degraded` with an `error` frame; the adapter keeps running
    pub async fn failure(&self, state: &str, message: impl Into<String>) -> bool {
        self.set_status(AdapterStatus::Degraded);
        let diag = self.diagnostic().state(state).message(message);
        self.sink.emit(Frame::Error(diag)).await
    }

    /// Report a terminal failure; the caller must return afterwards
    pub async fn terminal(&self, message: impl Into<String>) {
        let message = message.into();
        tracing::warn!(
            platform = %self.platform,
            room = %self.room,
            "Adapter closed: {}",
            message
        );
        let diag = self.diagnostic().state("closed").message(message);
        self.sink.emit(Frame::Error(diag)).await;
        self.set_status(AdapterStatus::Closed);
    }

    /// Close without error, e.g. nothing to serve or another instance owns the room
    pub async fn finish(&self, state: &str, message: impl Into<String>) {
        self.info(state, Some(message.into())).await;
        self.set_status(AdapterStatus::Closed);
    }

    /// Remember the last cursor seen (poll adapters only)
    pub fn record_cursor(&self, cursor: Option<String>) {
        *self.cursor.lock() = cursor;
    }
}

/// Per-session, per-source runtime handle
pub struct AdapterHandle {
    descriptor: SourceDescriptor,
    cancel: CancellationToken,
    status: watch::Receiver<AdapterStatus>,
    cursor: Arc<Mutex<Option<String>>>,
    task: Option<JoinHandle<()>>,
}

impl AdapterHandle {
    /// Spawn an adapter task for `descriptor`.
    ///
    /// `room` is the display room used in diagnostics; the task is closed
    /// automatically when `run` returns.
    pub fn spawn<F, Fut>(
        descriptor: SourceDescriptor,
        room: impl Into<String>,
        sink: EventSink,
        cancel: CancellationToken,
        run: F,
    ) -> Self
    where
        F: FnOnce(AdapterContext) -> Fut,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let (status_tx, status_rx) = watch::channel(AdapterStatus::Connecting);
        let cursor = Arc::new(Mutex::new(None));
        let ctx = AdapterContext {
            platform: descriptor.platform,
            room: room.into(),
            sink,
            cancel: cancel.clone(),
            status: status_tx,
            cursor: cursor.clone(),
        };

        let status_on_exit = ctx.status.clone();
        let fut = run(ctx);
        let task = tokio::spawn(async move {
            fut.await;
            status_on_exit.send_replace(AdapterStatus::Closed);
        });

        Self {
            descriptor,
            cancel,
            status: status_rx,
            cursor,
            task: Some(task),
        }
    }

    pub fn descriptor(&self) -> &SourceDescriptor {
        &self.descriptor
    }

    pub fn status(&self) -> AdapterStatus {
        *self.status.borrow()
    }

    /// Watch status transitions
    pub fn status_watch(&self) -> watch::Receiver<AdapterStatus> {
        self.status.clone()
    }

    /// Last cursor recorded by a poll adapter
    pub fn cursor(&self) -> Option<String> {
        self.cursor.lock().clone()
    }

    /// Cancel the task and wait at most `timeout` for it; abort otherwise.
    /// Safe to call more than once.
    pub async fn stop(&mut self, timeout: Duration) {
        self.cancel.cancel();
        let Some(mut task) = self.task.take() else {
            return;
        };

        if tokio::time::timeout(timeout, &mut task).await.is_err() {
            tracing::warn!(
                platform = %self.descriptor.platform,
                raw_id = %self.descriptor.raw_id,
                "Adapter did not stop within {:?}, aborting",
                timeout
            );
            task.abort();
        }
    }
}

impl Drop for AdapterHandle {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

/// Capability contract shared by the push, poll and relay variants
#[async_trait]
pub trait ChatAdapter: Send + Sync {
    fn platform(&self) -> Platform;

    /// Start serving `descriptor`. Must return promptly; all network work
    /// happens inside the spawned task.
    fn start(
        &self,
        descriptor: SourceDescriptor,
        sink: EventSink,
        cancel: CancellationToken,
    ) -> AdapterHandle;

    async fn stop(&self, handle: &mut AdapterHandle, timeout: Duration) {
        handle.stop(timeout).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_closed_is_terminal() {
        let status = AdapterStatus::Closed;
        assert_eq!(status.transition(AdapterStatus::Active), AdapterStatus::Closed);
        assert_eq!(status.transition(AdapterStatus::Degraded), AdapterStatus::Closed);
    }

    #[test]
    fn test_degraded_round_trip() {
        let status = AdapterStatus::Connecting
            .transition(AdapterStatus::Active)
            .transition(AdapterStatus::Degraded);
        assert_eq!(status, AdapterStatus::Degraded);
        assert_eq!(status.transition(AdapterStatus::Active), AdapterStatus::Active);
    }

    fn descriptor() -> SourceDescriptor {
        SourceDescriptor::new(Platform::PushChat, "room", "https://twitch.tv/room")
    }

    #[tokio::test]
    async fn test_handle_closes_when_task_returns() {
        let (tx, mut rx) = mpsc::channel(8);
        let mut handle = AdapterHandle::spawn(
            descriptor(),
            "room",
            EventSink::new(tx),
            CancellationToken::new(),
            |ctx| async move {
                ctx.active();
                ctx.terminal("upstream gone").await;
            },
        );

        let frame = rx.recv().await.unwrap();
        assert!(matches!(frame, Frame::Error(ref d) if d.state.as_deref() == Some("closed")));

        handle.stop(Duration::from_secs(1)).await;
        assert_eq!(handle.status(), AdapterStatus::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_is_bounded_and_idempotent() {
        let (tx, _rx) = mpsc::channel(8);
        let mut handle = AdapterHandle::spawn(
            descriptor(),
            "room",
            EventSink::new(tx),
            CancellationToken::new(),
            // Ignores cancellation entirely
            |_ctx| async move {
                futures::future::pending::<()>().await;
            },
        );

        let started = tokio::time::Instant::now();
        handle.stop(Duration::from_secs(2)).await;
        assert!(started.elapsed() <= Duration::from_secs(3));

        handle.stop(Duration::from_secs(2)).await;
    }

    #[tokio::test]
    async fn test_failure_degrades_until_next_success() {
        let (tx, mut rx) = mpsc::channel(8);
        let (status_tx, _status_rx) = watch::channel(AdapterStatus::Active);
        let ctx = AdapterContext {
            platform: Platform::PollChat,
            room: "r".to_string(),
            sink: EventSink::new(tx),
            cancel: CancellationToken::new(),
            status: status_tx,
            cursor: Arc::new(Mutex::new(None)),
        };

        assert!(ctx.failure("fetch_failed", "HTTP 500").await);
        assert_eq!(ctx.status(), AdapterStatus::Degraded);
        ctx.active();
        assert_eq!(ctx.status(), AdapterStatus::Active);

        match rx.recv().await.unwrap() {
            Frame::Error(diag) => {
                assert_eq!(diag.state.as_deref(), Some("fetch_failed"));
                assert_eq!(diag.message.as_deref(), Some("HTTP 500"));
            }
            other => panic!("unexpected frame {other:?}"),
        }
    }
}
