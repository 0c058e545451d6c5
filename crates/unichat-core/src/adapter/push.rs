//! Push variant: one persistent connection per room, reconnected with
//! exponential backoff.

use async_trait::async_trait;
use futures::stream::BoxStream;
use futures::StreamExt;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

use super::{AdapterContext, AdapterHandle, ChatAdapter, EventSink};
use crate::settings::PushSettings;
use crate::types::{ChatEvent, Platform, SourceDescriptor};
use crate::Result;

/// Normalized messages from one live connection. The stream ending (or
/// yielding an error) means the connection dropped.
pub type PushStream = BoxStream<'static, Result<ChatEvent>>;

/// Opens a live connection to one room
#[async_trait]
pub trait PushConnector: Send + Sync {
    async fn connect(&self, room: &str) -> Result<PushStream>;
}

/// Adapter for platforms that push messages over a long-lived connection
#[derive(Clone)]
pub struct PushAdapter {
    connector: Arc<dyn PushConnector>,
    settings: PushSettings,
    platform: Platform,
}

impl PushAdapter {
    pub fn new(connector: Arc<dyn PushConnector>, settings: PushSettings) -> Self {
        Self {
            connector,
            settings,
            platform: Platform::PushChat,
        }
    }

    /// Serve another platform's sources over this connector
    pub fn for_platform(mut self, platform: Platform) -> Self {
        self.platform = platform;
        self
    }
}

#[async_trait]
impl ChatAdapter for PushAdapter {
    fn platform(&self) -> Platform {
        self.platform
    }

    fn start(
        &self,
        descriptor: SourceDescriptor,
        sink: EventSink,
        cancel: CancellationToken,
    ) -> AdapterHandle {
        let room = descriptor.raw_id.trim().trim_start_matches('#').to_ascii_lowercase();
        let connector = self.connector.clone();
        let settings = self.settings.clone();

        AdapterHandle::spawn(descriptor, room, sink, cancel, move |ctx| {
            run_push(connector, settings, ctx)
        })
    }
}

enum ConnectionEnd {
    /// The connection opened and later closed, quietly or not
    Dropped,
    /// The connection never opened
    Failed(String),
    /// Cancelled, or the session went away
    Stopped,
}

async fn run_push(connector: Arc<dyn PushConnector>, settings: PushSettings, ctx: AdapterContext) {
    let room = ctx.room().to_string();
    let mut attempt: u32 = 0;

    loop {
        match serve_connection(connector.as_ref(), &settings, &ctx, &room).await {
            ConnectionEnd::Stopped => return,
            ConnectionEnd::Dropped => {
                // Only consecutive connect failures count against the budget
                tracing::info!(room = %room, "Push connection dropped");
                attempt = 1;
            }
            ConnectionEnd::Failed(reason) => {
                tracing::warn!(room = %room, attempt, "Push connection failed: {}", reason);
                attempt += 1;
            }
        }

        if attempt > settings.max_reconnects {
            ctx.terminal(format!(
                "disconnected after {} reconnect attempts",
                settings.max_reconnects
            ))
            .await;
            return;
        }

        let delay = settings.reconnect_delay(attempt);
        let message = format!("reconnecting (attempt {attempt}) in {}ms", delay.as_millis());
        if !ctx.degraded("reconnecting", message).await {
            return;
        }

        tokio::select! {
            _ = ctx.cancel_token().cancelled() => return,
            _ = tokio::time::sleep(delay) => {}
        }
    }
}

async fn serve_connection(
    connector: &dyn PushConnector,
    settings: &PushSettings,
    ctx: &AdapterContext,
    room: &str,
) -> ConnectionEnd {
    let connect = tokio::time::timeout(settings.connect_timeout(), connector.connect(room));
    let opened = tokio::select! {
        _ = ctx.cancel_token().cancelled() => return ConnectionEnd::Stopped,
        opened = connect => opened,
    };

    let mut stream = match opened {
        Ok(Ok(stream)) => stream,
        Ok(Err(e)) => return ConnectionEnd::Failed(e.to_string()),
        Err(_) => return ConnectionEnd::Failed("connect timed out".to_string()),
    };

    ctx.active();
    if !ctx.info("connected", None).await {
        return ConnectionEnd::Stopped;
    }
    tracing::debug!(room = %room, "Push connection open");

    loop {
        let next = tokio::select! {
            _ = ctx.cancel_token().cancelled() => return ConnectionEnd::Stopped,
            next = stream.next() => next,
        };

        match next {
            Some(Ok(event)) => {
                if !ctx.chat(event).await {
                    return ConnectionEnd::Stopped;
                }
            }
            Some(Err(e)) => {
                tracing::debug!(room = %room, "Push stream error: {}", e);
                return ConnectionEnd::Dropped;
            }
            None => return ConnectionEnd::Dropped,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapter::AdapterStatus;
    use crate::types::{now_ms, Frame};
    use crate::ChatError;
    use parking_lot::Mutex;
    use std::collections::VecDeque;
    use std::time::Duration;
    use tokio::sync::mpsc;

    fn event(id: &str) -> ChatEvent {
        ChatEvent {
            id: id.to_string(),
            platform: Platform::PushChat,
            channel: "room".to_string(),
            username: "u".to_string(),
            text: format!("text {id}"),
            at: now_ms(),
        }
    }

    /// Hands out scripted connections, then refuses
    struct ScriptedConnector {
        scripts: Mutex<VecDeque<Vec<ChatEvent>>>,
        hold_open: bool,
        connects: Mutex<u32>,
    }

    impl ScriptedConnector {
        fn new(scripts: Vec<Vec<ChatEvent>>, hold_open: bool) -> Arc<Self> {
            Arc::new(Self {
                scripts: Mutex::new(scripts.into()),
                hold_open,
                connects: Mutex::new(0),
            })
        }
    }

    #[async_trait]
    impl PushConnector for ScriptedConnector {
        async fn connect(&self, _room: &str) -> Result<PushStream> {
            *self.connects.lock() += 1;
            let Some(events) = self.scripts.lock().pop_front() else {
                return Err(ChatError::Transport("refused".to_string()));
            };
            let stream = futures::stream::iter(events.into_iter().map(Ok));
            if self.hold_open {
                Ok(stream.chain(futures::stream::pending()).boxed())
            } else {
                Ok(stream.boxed())
            }
        }
    }

    fn descriptor() -> SourceDescriptor {
        SourceDescriptor::new(Platform::PushChat, "Room", "https://twitch.tv/Room")
    }

    #[tokio::test]
    async fn test_delivers_in_order() {
        let connector = ScriptedConnector::new(vec![vec![event("m1"), event("m2"), event("m3")]], true);
        let adapter = PushAdapter::new(connector, PushSettings::default());
        let (tx, mut rx) = mpsc::channel(16);
        let mut handle = adapter.start(descriptor(), EventSink::new(tx), CancellationToken::new());

        assert!(matches!(rx.recv().await, Some(Frame::Info(ref d)) if d.state.as_deref() == Some("connected")));
        let mut ids = Vec::new();
        for _ in 0..3 {
            match rx.recv().await {
                Some(Frame::Chat(e)) => ids.push(e.id),
                other => panic!("unexpected {other:?}"),
            }
        }
        assert_eq!(ids, vec!["m1", "m2", "m3"]);
        assert_eq!(handle.status(), AdapterStatus::Active);

        handle.stop(Duration::from_secs(1)).await;
        assert_eq!(handle.status(), AdapterStatus::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_reconnects_then_gives_up_loudly() {
        let connector = ScriptedConnector::new(vec![vec![event("m1")]], false);
        let settings = PushSettings {
            max_reconnects: 2,
            ..PushSettings::default()
        };
        let adapter = PushAdapter::new(connector.clone(), settings);
        let (tx, mut rx) = mpsc::channel(64);
        let _handle = adapter.start(descriptor(), EventSink::new(tx), CancellationToken::new());

        let mut frames = Vec::new();
        while let Some(frame) = rx.recv().await {
            frames.push(frame);
        }

        let reconnects = frames
            .iter()
            .filter(|f| matches!(f, Frame::Info(d) if d.state.as_deref() == Some("reconnecting")))
            .count();
        assert_eq!(reconnects, 2);
        assert!(frames.iter().any(|f| matches!(f, Frame::Chat(e) if e.id == "m1")));
        assert!(matches!(
            frames.last(),
            Some(Frame::Error(d)) if d.state.as_deref() == Some("closed")
        ));
        assert_eq!(*connector.connects.lock(), 3);
    }

    /// Every connection opens, stays quiet, then closes; the last one stays up
    struct QuietConnector {
        quiet_closes: u32,
        connects: Mutex<u32>,
    }

    #[async_trait]
    impl PushConnector for QuietConnector {
        async fn connect(&self, _room: &str) -> Result<PushStream> {
            let mut connects = self.connects.lock();
            *connects += 1;
            if *connects <= self.quiet_closes {
                Ok(futures::stream::empty().boxed())
            } else {
                Ok(futures::stream::pending().boxed())
            }
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_quiet_reconnects_do_not_exhaust_budget() {
        let connector = Arc::new(QuietConnector {
            quiet_closes: 6,
            connects: Mutex::new(0),
        });
        let settings = PushSettings {
            max_reconnects: 2,
            ..PushSettings::default()
        };
        let adapter = PushAdapter::new(connector.clone(), settings);
        let (tx, mut rx) = mpsc::channel(64);
        let mut handle = adapter.start(descriptor(), EventSink::new(tx), CancellationToken::new());

        let mut connected = 0;
        while connected < 7 {
            match rx.recv().await {
                Some(Frame::Info(d)) if d.state.as_deref() == Some("connected") => connected += 1,
                Some(Frame::Info(_)) => {}
                other => panic!("unexpected {other:?}"),
            }
        }
        assert_eq!(*connector.connects.lock(), 7);
        assert_eq!(handle.status(), AdapterStatus::Active);
        handle.stop(Duration::from_secs(1)).await;
    }

    #[test]
    fn test_platform_override() {
        let connector = ScriptedConnector::new(vec![], false);
        assert_eq!(PushAdapter::new(connector.clone(), PushSettings::default()).platform(), Platform::PushChat);
        let kick = PushAdapter::new(connector, PushSettings::default()).for_platform(Platform::WebhookChat);
        assert_eq!(kick.platform(), Platform::WebhookChat);
    }

    #[tokio::test]
    async fn test_room_is_normalized() {
        let connector = ScriptedConnector::new(vec![vec![]], true);
        let adapter = PushAdapter::new(connector, PushSettings::default());
        let (tx, mut rx) = mpsc::channel(4);
        let mut handle = adapter.start(descriptor(), EventSink::new(tx), CancellationToken::new());

        match rx.recv().await {
            Some(Frame::Info(d)) => assert_eq!(d.room.as_deref(), Some("room")),
            other => panic!("unexpected {other:?}"),
        }
        handle.stop(Duration::from_secs(1)).await;
    }
}
