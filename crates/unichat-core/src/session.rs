//! Viewer sessions: one output stream per viewer, fed by one adapter task
//! per usable source.
//!
//! Frames leave a session in arrival order. Each adapter's own frames stay
//! in the order it produced them; there is no cross-source timestamp sort.

use chrono::{DateTime, Utc};
use futures::Stream;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet, VecDeque};
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::adapter::{ChatAdapter, EventSink};
use crate::settings::SessionSettings;
use crate::types::{now_ms, ChatEvent, Diagnostic, Frame, Platform, SourceDescriptor};
use crate::{ChatError, Result};

/// Unique session identifier
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SessionId(pub String);

impl SessionId {
    pub fn new() -> Self {
        Self(format!("session:{}", Uuid::new_v4()))
    }
}

impl Default for SessionId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for SessionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Adapters available to sessions, one per platform
#[derive(Default, Clone)]
pub struct AdapterRegistry {
    adapters: HashMap<Platform, Arc<dyn ChatAdapter>>,
}

impl AdapterRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(mut self, adapter: Arc<dyn ChatAdapter>) -> Self {
        self.adapters.insert(adapter.platform(), adapter);
        self
    }

    pub fn get(&self, platform: Platform) -> Option<&Arc<dyn ChatAdapter>> {
        self.adapters.get(&platform)
    }

    pub fn platforms(&self) -> Vec<Platform> {
        let mut platforms: Vec<_> = self.adapters.keys().copied().collect();
        platforms.sort_by_key(|p| p.as_str());
        platforms
    }
}

/// Session summary info
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionInfo {
    pub id: SessionId,
    pub sources: usize,
    pub created_at: DateTime<Utc>,
    pub last_activity: DateTime<Utc>,
    pub chat_count: u64,
}

/// Registry of live sessions
#[derive(Default)]
pub struct SessionManager {
    sessions: Arc<RwLock<HashMap<SessionId, SessionInfo>>>,
}

impl SessionManager {
    pub fn new() -> Self {
        Self::default()
    }

    fn register(&self, id: &SessionId, sources: usize) {
        let now = Utc::now();
        self.sessions.write().insert(
            id.clone(),
            SessionInfo {
                id: id.clone(),
                sources,
                created_at: now,
                last_activity: now,
                chat_count: 0,
            },
        );
        tracing::info!("Session opened: {} ({} sources)", id, sources);
    }

    fn record_chat(&self, id: &SessionId) {
        if let Some(info) = self.sessions.write().get_mut(id) {
            info.chat_count += 1;
            info.last_activity = Utc::now();
        }
    }

    fn unregister(&self, id: &SessionId) {
        if self.sessions.write().remove(id).is_some() {
            tracing::info!("Session closed: {}", id);
        }
    }

    pub fn get(&self, id: &SessionId) -> Option<SessionInfo> {
        self.sessions.read().get(id).cloned()
    }

    pub fn session_count(&self) -> usize {
        self.sessions.read().len()
    }

    pub fn list(&self) -> Vec<SessionInfo> {
        self.sessions.read().values().cloned().collect()
    }
}

/// Opens sessions against a fixed adapter registry
#[derive(Clone)]
pub struct SessionOrchestrator {
    registry: Arc<AdapterRegistry>,
    settings: SessionSettings,
    manager: Arc<SessionManager>,
}

impl SessionOrchestrator {
    pub fn new(registry: AdapterRegistry, settings: SessionSettings) -> Self {
        Self {
            registry: Arc::new(registry),
            settings,
            manager: Arc::new(SessionManager::new()),
        }
    }

    pub fn manager(&self) -> &Arc<SessionManager> {
        &self.manager
    }

    pub fn registry(&self) -> &AdapterRegistry {
        &self.registry
    }

    /// Whether a session could serve `descriptor`
    pub fn is_usable(&self, descriptor: &SourceDescriptor) -> bool {
        descriptor.is_servable() && self.registry.get(descriptor.platform).is_some()
    }

    /// Open a session. Fails before producing any frame when no source is
    /// usable; must be called from within a tokio runtime.
    ///
    /// Sources naming the same room are served once.
    pub fn open(&self, sources: Vec<SourceDescriptor>) -> Result<Session> {
        let mut rooms = HashSet::new();
        let mut usable: Vec<SourceDescriptor> = Vec::new();
        for descriptor in sources.iter().filter(|d| self.is_usable(d)) {
            if rooms.insert(descriptor.room_key()) {
                usable.push(descriptor.clone());
            } else {
                tracing::debug!(url = %descriptor.url, "Duplicate source, already served");
            }
        }
        if usable.is_empty() {
            return Err(ChatError::NoUsableSources);
        }

        let (out_tx, out_rx) = mpsc::channel(self.settings.output_buffer.max(1));
        let cancel = CancellationToken::new();
        let recent = Arc::new(Mutex::new(VecDeque::with_capacity(self.settings.retention_window)));
        let id = SessionId::new();

        self.manager.register(&id, usable.len());

        let run = SessionRun {
            id: id.clone(),
            registry: self.registry.clone(),
            settings: self.settings.clone(),
            manager: self.manager.clone(),
            writer: FrameWriter {
                tx: out_tx,
                stall_timeout: self.settings.sink_stall_timeout(),
            },
            cancel: cancel.clone(),
            recent: recent.clone(),
        };
        let task = tokio::spawn(run.run(sources, usable));

        Ok(Session {
            id,
            rx: out_rx,
            cancel,
            recent,
            task: Some(task),
        })
    }
}

/// A viewer's live output stream
pub struct Session {
    id: SessionId,
    rx: mpsc::Receiver<Frame>,
    cancel: CancellationToken,
    recent: Arc<Mutex<VecDeque<ChatEvent>>>,
    task: Option<JoinHandle<()>>,
}

impl Session {
    pub fn id(&self) -> &SessionId {
        &self.id
    }

    /// Next frame; `None` once the session has ended
    pub async fn next(&mut self) -> Option<Frame> {
        self.rx.recv().await
    }

    /// Snapshot of the most recent chat events, oldest first
    pub fn recent(&self) -> Vec<ChatEvent> {
        self.recent.lock().iter().cloned().collect()
    }

    /// Token that ends the session when cancelled
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Tear down every adapter and close the stream. Idempotent.
    pub async fn stop(&mut self) {
        self.cancel.cancel();
        if let Some(task) = self.task.take() {
            if let Err(e) = task.await {
                tracing::warn!("Session task for {} failed: {}", self.id, e);
            }
        }
    }
}

impl Stream for Session {
    type Item = Frame;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Frame>> {
        self.rx.poll_recv(cx)
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

struct FrameWriter {
    tx: mpsc::Sender<Frame>,
    stall_timeout: Duration,
}

impl FrameWriter {
    /// Deliver within the stall timeout; `false` means the viewer is gone
    /// or stuck and the session must end
    async fn send(&self, frame: Frame) -> bool {
        match tokio::time::timeout(self.stall_timeout, self.tx.send(frame)).await {
            Ok(Ok(())) => true,
            Ok(Err(_)) => false,
            Err(_) => {
                tracing::warn!("Viewer did not accept frames for {:?}", self.stall_timeout);
                false
            }
        }
    }

    /// Best-effort delivery for coalescible frames
    fn offer(&self, frame: Frame) {
        match self.tx.try_send(frame) {
            Ok(()) | Err(TrySendError::Closed(_)) => {}
            Err(TrySendError::Full(_)) => tracing::trace!("Output full, dropping keepalive"),
        }
    }
}

struct SessionRun {
    id: SessionId,
    registry: Arc<AdapterRegistry>,
    settings: SessionSettings,
    manager: Arc<SessionManager>,
    writer: FrameWriter,
    cancel: CancellationToken,
    recent: Arc<Mutex<VecDeque<ChatEvent>>>,
}

impl SessionRun {
    async fn run(self, sources: Vec<SourceDescriptor>, usable: Vec<SourceDescriptor>) {
        let mut handles = Vec::with_capacity(usable.len());
        if self.announce(&sources).await {
            let (merge_tx, merge_rx) = mpsc::channel(self.settings.merge_buffer.max(1));
            for descriptor in usable {
                if let Some(adapter) = self.registry.get(descriptor.platform) {
                    tracing::debug!(
                        session = %self.id,
                        platform = %descriptor.platform,
                        raw_id = %descriptor.raw_id,
                        "Starting adapter"
                    );
                    handles.push(adapter.start(
                        descriptor,
                        EventSink::new(merge_tx.clone()),
                        self.cancel.child_token(),
                    ));
                }
            }
            drop(merge_tx);
            self.pump(merge_rx).await;
        }

        self.cancel.cancel();
        let timeout = self.settings.teardown_timeout();
        futures::future::join_all(handles.iter_mut().map(|h| h.stop(timeout))).await;
        self.manager.unregister(&self.id);
    }

    /// `meta` first, then one `info` per source that won't be served
    async fn announce(&self, sources: &[SourceDescriptor]) -> bool {
        if !self.writer.send(Frame::Meta { sources: sources.to_vec() }).await {
            return false;
        }

        let registry = &self.registry;
        let unserved = sources
            .iter()
            .filter(|d| !(d.is_servable() && registry.get(d.platform).is_some()));
        for descriptor in unserved {
            let mut diag = Diagnostic::default().state("unsupported");
            diag.platform = Some(descriptor.platform);
            diag.message = Some(
                descriptor
                    .note
                    .clone()
                    .unwrap_or_else(|| format!("cannot serve {}", descriptor.url)),
            );
            if !self.writer.send(Frame::Info(diag)).await {
                return false;
            }
        }
        true
    }

    async fn pump(&self, mut merge_rx: mpsc::Receiver<Frame>) {
        let period = self.settings.keepalive_interval();
        let mut keepalive = tokio::time::interval_at(Instant::now() + period, period);
        keepalive.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => break,
                _ = self.writer.tx.closed() => {
                    tracing::debug!(session = %self.id, "Viewer disconnected");
                    break;
                }
                frame = merge_rx.recv() => match frame {
                    Some(frame) => {
                        if let Frame::Chat(event) = &frame {
                            self.retain(event);
                        }
                        let delivered = tokio::select! {
                            _ = self.cancel.cancelled() => false,
                            delivered = self.writer.send(frame) => delivered,
                        };
                        if !delivered {
                            break;
                        }
                    }
                    None => {
                        // Every adapter has closed
                        let diag = Diagnostic::default()
                            .state("ended")
                            .message("all sources have closed");
                        self.writer.send(Frame::Info(diag)).await;
                        break;
                    }
                },
                _ = keepalive.tick() => self.writer.offer(Frame::Ping(now_ms())),
            }
        }
    }

    fn retain(&self, event: &ChatEvent) {
        let window = self.settings.retention_window;
        if window > 0 {
            let mut recent = self.recent.lock();
            while recent.len() >= window {
                recent.pop_front();
            }
            recent.push_back(event.clone());
        }
        self.manager.record_chat(&self.id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapter::{AdapterContext, AdapterHandle};
    use async_trait::async_trait;

    /// Emits a fixed script and then idles until cancelled
    struct ScriptAdapter {
        platform: Platform,
        script: Vec<ChatEvent>,
    }

    #[async_trait]
    impl ChatAdapter for ScriptAdapter {
        fn platform(&self) -> Platform {
            self.platform
        }

        fn start(&self, descriptor: SourceDescriptor, sink: EventSink, cancel: CancellationToken) -> AdapterHandle {
            let script = self.script.clone();
            AdapterHandle::spawn(descriptor.clone(), descriptor.raw_id, sink, cancel, move |ctx: AdapterContext| async move {
                ctx.active();
                for event in script {
                    if !ctx.chat(event).await {
                        return;
                    }
                }
                ctx.cancel_token().cancelled().await;
            })
        }
    }

    fn event(id: &str) -> ChatEvent {
        ChatEvent {
            id: id.to_string(),
            platform: Platform::PushChat,
            channel: "c".to_string(),
            username: "u".to_string(),
            text: id.to_string(),
            at: 0,
        }
    }

    fn orchestrator(script: Vec<ChatEvent>, settings: SessionSettings) -> SessionOrchestrator {
        let registry = AdapterRegistry::new().register(Arc::new(ScriptAdapter {
            platform: Platform::PushChat,
            script,
        }));
        SessionOrchestrator::new(registry, settings)
    }

    fn twitch(room: &str) -> SourceDescriptor {
        SourceDescriptor::new(Platform::PushChat, room, format!("https://twitch.tv/{room}"))
    }

    #[tokio::test]
    async fn test_no_usable_sources_fails_before_stream() {
        let orch = orchestrator(vec![], SessionSettings::default());
        let result = orch.open(vec![
            SourceDescriptor::unsupported("https://tiktok.com/@x", "not supported"),
            SourceDescriptor::new(Platform::PollChat, "vid", "https://youtu.be/vid"),
        ]);
        assert!(matches!(result, Err(ChatError::NoUsableSources)));
        assert_eq!(orch.manager().session_count(), 0);
    }

    #[tokio::test]
    async fn test_retention_window_keeps_newest() {
        let settings = SessionSettings {
            retention_window: 2,
            ..SessionSettings::default()
        };
        let orch = orchestrator(vec![event("a"), event("b"), event("c")], settings);
        let mut session = orch.open(vec![twitch("room")]).unwrap();

        let mut chats = 0;
        while chats < 3 {
            if let Some(Frame::Chat(_)) = session.next().await {
                chats += 1;
            }
        }
        let ids: Vec<_> = session.recent().into_iter().map(|e| e.id).collect();
        assert_eq!(ids, vec!["b", "c"]);
        assert_eq!(orch.manager().get(session.id()).unwrap().chat_count, 3);

        session.stop().await;
        session.stop().await;
        assert_eq!(orch.manager().session_count(), 0);
    }

    #[tokio::test]
    async fn test_unusable_sources_get_info_after_meta() {
        let orch = orchestrator(vec![], SessionSettings::default());
        let mut session = orch
            .open(vec![
                twitch("room"),
                SourceDescriptor::unsupported("https://instagram.com/x", "instagram is not supported"),
            ])
            .unwrap();

        assert!(matches!(session.next().await, Some(Frame::Meta { ref sources }) if sources.len() == 2));
        match session.next().await {
            Some(Frame::Info(diag)) => {
                assert_eq!(diag.state.as_deref(), Some("unsupported"));
                assert_eq!(diag.message.as_deref(), Some("instagram is not supported"));
            }
            other => panic!("unexpected {other:?}"),
        }
        session.stop().await;
    }

    #[tokio::test]
    async fn test_same_room_is_served_once() {
        let orch = orchestrator(vec![event("m1"), event("m2")], SessionSettings::default());
        let mut session = orch
            .open(vec![twitch("Room"), twitch("#room"), twitch(" room ")])
            .unwrap();

        assert!(matches!(session.next().await, Some(Frame::Meta { ref sources }) if sources.len() == 3));
        assert_eq!(orch.manager().get(session.id()).unwrap().sources, 1);

        let mut ids = Vec::new();
        while ids.len() < 2 {
            match session.next().await {
                Some(Frame::Chat(e)) => ids.push(e.id),
                Some(Frame::Ping(_)) => {}
                other => panic!("unexpected {other:?}"),
            }
        }
        assert_eq!(ids, vec!["m1", "m2"]);
        session.stop().await;
    }

    #[tokio::test]
    async fn test_stop_does_not_wait_for_stalled_viewer() {
        let settings = SessionSettings {
            output_buffer: 1,
            sink_stall_timeout_ms: 3_600_000,
            teardown_timeout_ms: 100,
            ..SessionSettings::default()
        };
        let orch = orchestrator(vec![event("a"), event("b"), event("c")], settings);
        let mut session = orch.open(vec![twitch("room")]).unwrap();

        // Nobody reads: meta fills the buffer and the first chat blocks
        tokio::time::sleep(Duration::from_millis(50)).await;
        let stopped = tokio::time::timeout(Duration::from_secs(2), session.stop()).await;
        assert!(stopped.is_ok());
        assert_eq!(orch.manager().session_count(), 0);
    }

    #[tokio::test]
    async fn test_stream_ends_after_stop() {
        let orch = orchestrator(vec![], SessionSettings::default());
        let mut session = orch.open(vec![twitch("room")]).unwrap();
        session.stop().await;

        let mut remaining = 0;
        while session.next().await.is_some() {
            remaining += 1;
        }
        assert!(remaining <= 1);
    }
}
