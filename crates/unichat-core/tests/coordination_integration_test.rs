//! Integration tests for cross-instance poll coordination

use async_trait::async_trait;
use futures::StreamExt;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use unichat_core::adapter::poll::{ChatPoller, PollCoordinator, PollPage};
use unichat_core::store::relay_payload_stream;
use unichat_core::{ChatEvent, CoordinationStore, MemoryStore, Platform, PollSettings, Result};

fn chat(id: &str) -> ChatEvent {
    ChatEvent {
        id: id.to_string(),
        platform: Platform::PollChat,
        channel: "UCchannel".to_string(),
        username: "viewer".to_string(),
        text: id.to_string(),
        at: 0,
    }
}

/// Records every cursor it is asked for
#[derive(Default)]
struct RecordingPoller {
    pages: HashMap<Option<String>, PollPage>,
    requested: Mutex<Vec<Option<String>>>,
}

impl RecordingPoller {
    fn page(mut self, cursor: Option<&str>, ids: &[&str], next: &str) -> Self {
        self.pages.insert(
            cursor.map(str::to_string),
            PollPage {
                messages: ids.iter().map(|id| chat(id)).collect(),
                next_cursor: Some(next.to_string()),
                interval_ms: Some(1_000),
            },
        );
        self
    }
}

#[async_trait]
impl ChatPoller for RecordingPoller {
    async fn resolve_room(&self, _raw_id: &str) -> Result<Option<String>> {
        Ok(Some("room".to_string()))
    }

    async fn fetch_page(&self, _room: &str, cursor: Option<&str>) -> Result<PollPage> {
        let cursor = cursor.map(str::to_string);
        self.requested.lock().push(cursor.clone());
        Ok(self.pages.get(&cursor).cloned().unwrap_or_default())
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_triggers_elect_one_poller() {
    let store = Arc::new(MemoryStore::new());
    let poller = Arc::new(RecordingPoller::default().page(None, &["a"], "T1"));
    let settings = PollSettings {
        cycle_budget_secs: 1,
        ..PollSettings::default()
    };

    let mut tasks = Vec::new();
    for _ in 0..8 {
        // Each coordinator stands in for a separate gateway instance
        let coordinator = PollCoordinator::new(poller.clone(), store.clone(), settings.clone());
        tasks.push(tokio::spawn(async move {
            coordinator
                .trigger_one("video", &CancellationToken::new())
                .await
        }));
    }

    let mut started = 0;
    let mut locked = 0;
    for task in tasks {
        let report = task.await.unwrap();
        if report.started {
            started += 1;
        } else if report.reason.as_deref() == Some("locked") {
            locked += 1;
        }
    }

    assert_eq!(started, 1);
    assert_eq!(locked, 7);
    assert_eq!(store.published_count("poll-chat:room"), 1);
}

#[tokio::test(start_paused = true)]
async fn test_takeover_resumes_from_persisted_cursor() {
    let store = Arc::new(MemoryStore::new());
    let poller = Arc::new(
        RecordingPoller::default()
            .page(None, &["m1", "m2"], "T1")
            .page(Some("T1"), &["m3"], "T2"),
    );
    // One fetch per cycle
    let settings = PollSettings {
        cycle_budget_secs: 1,
        ..PollSettings::default()
    };
    let cancel = CancellationToken::new();

    let first = PollCoordinator::new(poller.clone(), store.clone(), settings.clone());
    let report = first.trigger_one("video", &cancel).await;
    assert!(report.started);
    assert_eq!(
        store.get("poll-chat:cursor:room").await.unwrap().as_deref(),
        Some("T1")
    );

    // The first instance vanishes without releasing its lock
    let second = PollCoordinator::new(poller.clone(), store.clone(), settings);
    assert_eq!(
        second.trigger_one("video", &cancel).await.reason.as_deref(),
        Some("locked")
    );
    tokio::time::advance(Duration::from_secs(59)).await;

    let mut relay = store.subscribe("poll-chat:room").await.unwrap();
    let report = second.trigger_one("video", &cancel).await;
    assert!(report.started);

    let first_relayed: ChatEvent = serde_json::from_str(&relay.next().await.unwrap()).unwrap();
    assert_eq!(first_relayed.id, "m3");
    assert_eq!(
        store.get("poll-chat:cursor:room").await.unwrap().as_deref(),
        Some("T2")
    );
    assert_eq!(
        *poller.requested.lock(),
        vec![None, Some("T1".to_string())]
    );
}

#[tokio::test]
async fn test_relay_stream_reassembles_split_characters() {
    let payload = serde_json::to_string(&ChatEvent {
        text: "gg 😀 ção".to_string(),
        ..chat("u1")
    })
    .unwrap();
    let wire = format!("data: subscribe,poll-chat:room,1\n\ndata: message,poll-chat:room,{payload}\n\n");
    let bytes = wire.as_bytes();

    // Cut inside the emoji and again inside 'ç'
    let emoji = wire.find('😀').unwrap() + 2;
    let cedilla = wire.find('ç').unwrap() + 1;
    let chunks = vec![
        Ok::<Vec<u8>, String>(bytes[..emoji].to_vec()),
        Ok(bytes[emoji..cedilla].to_vec()),
        Ok(bytes[cedilla..].to_vec()),
    ];

    let received: Vec<String> = relay_payload_stream(futures::stream::iter(chunks)).collect().await;
    assert_eq!(received, vec![payload.clone()]);

    let event: ChatEvent = serde_json::from_str(&received[0]).unwrap();
    assert_eq!(event.text, "gg 😀 ção");
}
