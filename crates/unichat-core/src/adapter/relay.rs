//! Webhook-relay variant
//!
//! Events for these rooms arrive at whichever instance receives the
//! platform's webhook; the ingress republishes them on the relay channel and
//! this adapter forwards them to its session.

use async_trait::async_trait;
use futures::StreamExt;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

use super::{AdapterContext, AdapterHandle, AdapterStatus, ChatAdapter, EventSink};
use crate::store::{SharedStore, StoreKey};
use crate::types::{ChatEvent, Platform, SourceDescriptor};
use crate::Result;

/// Registers the upstream webhook for a room
#[async_trait]
pub trait WebhookSubscriber: Send + Sync {
    async fn ensure_subscribed(&self, room: &str) -> Result<()>;
}

/// Relay room identity: slugs are case-insensitive upstream
pub fn relay_room(raw_id: &str) -> String {
    raw_id.trim().to_ascii_lowercase()
}

/// Decode one relay payload and emit it. Malformed payloads are skipped;
/// returns `false` only once the session is gone.
pub(crate) async fn forward_relay_payload(ctx: &AdapterContext, payload: &str) -> bool {
    match serde_json::from_str::<ChatEvent>(payload) {
        Ok(event) => ctx.chat(event).await,
        Err(e) => {
            tracing::warn!(room = %ctx.room(), "Skipping malformed relay payload: {}", e);
            true
        }
    }
}

#[derive(Clone)]
pub struct RelayAdapter {
    store: SharedStore,
    subscriber: Option<Arc<dyn WebhookSubscriber>>,
}

impl RelayAdapter {
    pub fn new(store: SharedStore) -> Self {
        Self {
            store,
            subscriber: None,
        }
    }

    pub fn with_subscriber(mut self, subscriber: Arc<dyn WebhookSubscriber>) -> Self {
        self.subscriber = Some(subscriber);
        self
    }
}

#[async_trait]
impl ChatAdapter for RelayAdapter {
    fn platform(&self) -> Platform {
        Platform::WebhookChat
    }

    fn start(
        &self,
        descriptor: SourceDescriptor,
        sink: EventSink,
        cancel: CancellationToken,
    ) -> AdapterHandle {
        let room = relay_room(&descriptor.raw_id);
        let store = self.store.clone();
        let subscriber = self.subscriber.clone();

        AdapterHandle::spawn(descriptor, room, sink, cancel, move |ctx| {
            run_relay(store, subscriber, ctx)
        })
    }
}

async fn run_relay(
    store: SharedStore,
    subscriber: Option<Arc<dyn WebhookSubscriber>>,
    ctx: AdapterContext,
) {
    let room = ctx.room().to_string();

    // Subscribe to the relay first so nothing published after the upstream
    // registration is missed
    let channel = StoreKey::relay(Platform::WebhookChat, &room);
    let subscribed = tokio::select! {
        _ = ctx.cancel_token().cancelled() => return,
        subscribed = store.subscribe(&channel) => subscribed,
    };
    let mut stream = match subscribed {
        Ok(stream) => stream,
        Err(e) => {
            ctx.terminal(format!("relay subscription failed: {e}")).await;
            return;
        }
    };

    if let Some(subscriber) = subscriber {
        let registered = tokio::select! {
            _ = ctx.cancel_token().cancelled() => return,
            registered = subscriber.ensure_subscribed(&room) => registered,
        };
        if let Err(e) = registered {
            tracing::warn!(room = %room, "Webhook registration failed: {}", e);
            if !ctx.degraded("subscribe_failed", e.to_string()).await {
                return;
            }
        }
    }

    if ctx.status() != AdapterStatus::Degraded {
        ctx.active();
    }
    if !ctx.info("subscribed", None).await {
        return;
    }
    tracing::debug!(channel = %channel, "Following relay channel");

    loop {
        let next = tokio::select! {
            _ = ctx.cancel_token().cancelled() => return,
            next = stream.next() => next,
        };
        match next {
            Some(payload) => {
                ctx.active();
                if !forward_relay_payload(&ctx, &payload).await {
                    return;
                }
            }
            None => {
                ctx.terminal("relay stream ended").await;
                return;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{CoordinationStore, MemoryStore};
    use crate::types::Frame;
    use crate::ChatError;
    use std::time::Duration;
    use tokio::sync::mpsc;

    fn descriptor(slug: &str) -> SourceDescriptor {
        SourceDescriptor::new(Platform::WebhookChat, slug, format!("https://kick.com/{slug}"))
    }

    fn event(id: &str) -> ChatEvent {
        ChatEvent {
            id: id.to_string(),
            platform: Platform::WebhookChat,
            channel: "streamer".to_string(),
            username: "kick-user".to_string(),
            text: "hey".to_string(),
            at: 1,
        }
    }

    struct RefusingSubscriber;

    #[async_trait]
    impl WebhookSubscriber for RefusingSubscriber {
        async fn ensure_subscribed(&self, _room: &str) -> Result<()> {
            Err(ChatError::Upstream("401 from events api".to_string()))
        }
    }

    #[tokio::test]
    async fn test_forwards_relay_events_and_skips_garbage() {
        let store = Arc::new(MemoryStore::new());
        let adapter = RelayAdapter::new(store.clone());
        let (tx, mut rx) = mpsc::channel(16);
        let mut handle = adapter.start(descriptor("Streamer"), EventSink::new(tx), CancellationToken::new());

        assert!(matches!(rx.recv().await, Some(Frame::Info(d)) if d.state.as_deref() == Some("subscribed")));

        store.publish("webhook-chat:streamer", "not json").await.unwrap();
        let payload = serde_json::to_string(&event("k1")).unwrap();
        store.publish("webhook-chat:streamer", &payload).await.unwrap();

        match rx.recv().await {
            Some(Frame::Chat(e)) => assert_eq!(e.id, "k1"),
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(handle.status(), AdapterStatus::Active);
        handle.stop(Duration::from_secs(1)).await;
    }

    #[tokio::test]
    async fn test_registration_failure_is_transient() {
        let store = Arc::new(MemoryStore::new());
        let adapter = RelayAdapter::new(store.clone()).with_subscriber(Arc::new(RefusingSubscriber));
        let (tx, mut rx) = mpsc::channel(16);
        let mut handle = adapter.start(descriptor("streamer"), EventSink::new(tx), CancellationToken::new());

        assert!(matches!(rx.recv().await, Some(Frame::Info(d)) if d.state.as_deref() == Some("subscribe_failed")));
        assert!(matches!(rx.recv().await, Some(Frame::Info(d)) if d.state.as_deref() == Some("subscribed")));
        assert_eq!(handle.status(), AdapterStatus::Degraded);

        let payload = serde_json::to_string(&event("k2")).unwrap();
        store.publish("webhook-chat:streamer", &payload).await.unwrap();
        assert!(matches!(rx.recv().await, Some(Frame::Chat(_))));
        assert_eq!(handle.status(), AdapterStatus::Active);

        handle.stop(Duration::from_secs(1)).await;
    }
}
