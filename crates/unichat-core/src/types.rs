//! Shared data model: source descriptors, normalized chat events and the
//! tagged frames written to a viewer's stream.

use serde::{Deserialize, Serialize};
use std::time::{SystemTime, UNIX_EPOCH};

use crate::Result;

/// Chat platform, named after the transport shape it uses
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Platform {
    /// Persistent push connection (Twitch IRC)
    PushChat,
    /// Cursor-paginated polling (YouTube live chat)
    PollChat,
    /// Signed inbound webhooks redistributed through the relay (Kick)
    WebhookChat,
    /// Recognized but not served (TikTok, Instagram, unknown hosts)
    Unsupported,
}

impl Platform {
    /// Wire name, also used as the coordination store key namespace
    pub fn as_str(&self) -> &'static str {
        match self {
            Platform::PushChat => "push-chat",
            Platform::PollChat => "poll-chat",
            Platform::WebhookChat => "webhook-chat",
            Platform::Unsupported => "unsupported",
        }
    }

    /// Human-facing platform name
    pub fn label(&self) -> &'static str {
        match self {
            Platform::PushChat => "twitch",
            Platform::PollChat => "youtube",
            Platform::WebhookChat => "kick",
            Platform::Unsupported => "unsupported",
        }
    }
}

impl std::fmt::Display for Platform {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// One requested chat source, as produced by the source parser
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceDescriptor {
    pub platform: Platform,

    /// Room/channel name or content id, depending on platform
    pub raw_id: String,

    /// The URL the viewer submitted
    pub url: String,

    /// Diagnostic note for sources that cannot be served
    #[serde(skip_serializing_if = "Option::is_none")]
    pub note: Option<String>,
}

impl SourceDescriptor {
    pub fn new(platform: Platform, raw_id: impl Into<String>, url: impl Into<String>) -> Self {
        Self {
            platform,
            raw_id: raw_id.into(),
            url: url.into(),
            note: None,
        }
    }

    /// A source that will never be started
    pub fn unsupported(url: impl Into<String>, note: impl Into<String>) -> Self {
        Self {
            platform: Platform::Unsupported,
            raw_id: String::new(),
            url: url.into(),
            note: Some(note.into()),
        }
    }

    pub fn with_note(mut self, note: impl Into<String>) -> Self {
        self.note = Some(note.into());
        self
    }

    /// Whether the descriptor names something an adapter could start on
    pub fn is_servable(&self) -> bool {
        self.platform != Platform::Unsupported && !self.raw_id.trim().is_empty()
    }

    /// Two descriptors with the same key read the same room
    pub fn room_key(&self) -> (Platform, String) {
        let raw = self.raw_id.trim();
        let room = match self.platform {
            // Video ids are case-sensitive
            Platform::PollChat => raw.to_string(),
            _ => raw.trim_start_matches('#').to_ascii_lowercase(),
        };
        (self.platform, room)
    }
}

/// A chat message normalized from any platform
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatEvent {
    /// Platform-scoped id; display/dedup key only
    pub id: String,
    pub platform: Platform,
    /// Display channel or room name
    pub channel: String,
    pub username: String,
    pub text: String,
    /// Epoch milliseconds
    pub at: i64,
}

/// Diagnostic payload carried by `info` and `error` frames
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Diagnostic {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub platform: Option<Platform>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub room: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub state: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl Diagnostic {
    pub fn new(platform: Platform, room: impl Into<String>) -> Self {
        Self {
            platform: Some(platform),
            room: Some(room.into()),
            ..Default::default()
        }
    }

    pub fn state(mut self, state: impl Into<String>) -> Self {
        self.state = Some(state.into());
        self
    }

    pub fn message(mut self, message: impl Into<String>) -> Self {
        self.message = Some(message.into());
        self
    }
}

/// Frame kinds on the viewer wire
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FrameKind {
    Meta,
    Chat,
    Info,
    Error,
    Ping,
}

impl FrameKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            FrameKind::Meta => "meta",
            FrameKind::Chat => "chat",
            FrameKind::Info => "info",
            FrameKind::Error => "error",
            FrameKind::Ping => "ping",
        }
    }
}

/// One unit of a viewer's output stream
#[derive(Debug, Clone, PartialEq)]
pub enum Frame {
    /// Accepted source set, always first
    Meta { sources: Vec<SourceDescriptor> },
    Chat(ChatEvent),
    Info(Diagnostic),
    Error(Diagnostic),
    /// Keepalive carrying epoch milliseconds
    Ping(i64),
}

#[derive(Serialize)]
struct MetaPayload<'a> {
    sources: &'a [SourceDescriptor],
}

impl Frame {
    pub fn kind(&self) -> FrameKind {
        match self {
            Frame::Meta { .. } => FrameKind::Meta,
            Frame::Chat(_) => FrameKind::Chat,
            Frame::Info(_) => FrameKind::Info,
            Frame::Error(_) => FrameKind::Error,
            Frame::Ping(_) => FrameKind::Ping,
        }
    }

    /// JSON encoding of the frame payload
    pub fn payload(&self) -> Result<String> {
        let json = match self {
            Frame::Meta { sources } => serde_json::to_string(&MetaPayload { sources })?,
            Frame::Chat(event) => serde_json::to_string(event)?,
            Frame::Info(diag) | Frame::Error(diag) => serde_json::to_string(diag)?,
            Frame::Ping(at) => at.to_string(),
        };
        Ok(json)
    }

    /// Wire encoding: `event:<kind>\ndata:<payload>\n\n`
    pub fn encode(&self) -> Result<String> {
        Ok(format!("event:{}\ndata:{}\n\n", self.kind().as_str(), self.payload()?))
    }
}

/// Current wall-clock time in epoch milliseconds
pub fn now_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| i64::try_from(d.as_millis()).unwrap_or(i64::MAX))
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_event() -> ChatEvent {
        ChatEvent {
            id: "abc".to_string(),
            platform: Platform::PushChat,
            channel: "somechannel".to_string(),
            username: "alice".to_string(),
            text: "hello".to_string(),
            at: 1_700_000_000_000,
        }
    }

    #[test]
    fn test_platform_wire_names() {
        assert_eq!(Platform::PollChat.as_str(), "poll-chat");
        assert_eq!(
            serde_json::to_string(&Platform::WebhookChat).unwrap(),
            "\"webhook-chat\""
        );
        assert_eq!(Platform::PushChat.label(), "twitch");
    }

    #[test]
    fn test_servable_descriptor() {
        let ok = SourceDescriptor::new(Platform::PushChat, "chan", "https://twitch.tv/chan");
        assert!(ok.is_servable());

        let blank = SourceDescriptor::new(Platform::PushChat, "  ", "https://twitch.tv/");
        assert!(!blank.is_servable());

        let unsupported = SourceDescriptor::unsupported("https://tiktok.com/@x", "not yet");
        assert!(!unsupported.is_servable());
    }

    #[test]
    fn test_room_key_folds_channel_spelling() {
        let a = SourceDescriptor::new(Platform::PushChat, "#Streamer", "a");
        let b = SourceDescriptor::new(Platform::PushChat, "streamer ", "b");
        assert_eq!(a.room_key(), b.room_key());

        let kick = SourceDescriptor::new(Platform::WebhookChat, "streamer", "c");
        assert_ne!(a.room_key(), kick.room_key());

        let upper = SourceDescriptor::new(Platform::PollChat, "AbC", "d");
        let lower = SourceDescriptor::new(Platform::PollChat, "abc", "e");
        assert_ne!(upper.room_key(), lower.room_key());
    }

    #[test]
    fn test_chat_frame_encoding() {
        let frame = Frame::Chat(sample_event());
        let wire = frame.encode().unwrap();

        assert!(wire.starts_with("event:chat\ndata:{"));
        assert!(wire.ends_with("}\n\n"));
        assert!(wire.contains("\"username\":\"alice\""));
        assert!(wire.contains("\"platform\":\"push-chat\""));
    }

    #[test]
    fn test_ping_and_meta_encoding() {
        assert_eq!(Frame::Ping(42).encode().unwrap(), "event:ping\ndata:42\n\n");

        let meta = Frame::Meta {
            sources: vec![SourceDescriptor::unsupported("x", "bad url")],
        };
        let wire = meta.encode().unwrap();
        assert!(wire.starts_with("event:meta\ndata:{\"sources\":["));
        assert!(wire.contains("\"note\":\"bad url\""));
    }

    #[test]
    fn test_diagnostic_skips_empty_fields() {
        let diag = Diagnostic::new(Platform::PollChat, "room-1").state("locked");
        let json = serde_json::to_string(&diag).unwrap();
        assert_eq!(
            json,
            "{\"platform\":\"poll-chat\",\"room\":\"room-1\",\"state\":\"locked\"}"
        );
    }
}
