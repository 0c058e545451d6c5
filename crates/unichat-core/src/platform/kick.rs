//! Kick: webhook payload normalization, the public events API client, and
//! direct chat ingestion over the site's Pusher socket

use async_trait::async_trait;
use chrono::DateTime;
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use parking_lot::{Mutex, RwLock};
use regex::Regex;
use serde::Deserialize;
use serde_json::{json, Value};
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::OnceLock;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::time::Instant;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use uuid::Uuid;

use crate::adapter::push::{PushConnector, PushStream};
use crate::adapter::relay::{relay_room, WebhookSubscriber};
use crate::types::{now_ms, ChatEvent, Platform};
use crate::{ChatError, Result};

pub const KICK_API_BASE: &str = "https://api.kick.com/public/v1";
pub const KICK_AUTH_BASE: &str = "https://id.kick.com";
pub const KICK_WEB_BASE: &str = "https://kick.com";

/// Public app key of the site's chat socket
pub const KICK_PUSHER_KEY: &str = "eb1d5f283081a78b932c";

/// `{cluster}` is replaced by each candidate cluster
pub const PUSHER_SOCKET_TEMPLATE: &str = "wss://ws-{cluster}.pusher.com";

/// Tried in order after the preferred cluster
pub const PUSHER_CLUSTERS: [&str; 7] = ["us2", "us3", "us1", "mt1", "eu", "ap3", "ap1"];

const CHAT_MESSAGE_EVENT: &str = "App\\Events\\ChatMessageEvent";

const BROWSER_USER_AGENT: &str =
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/124.0.0.0 Safari/537.36";

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// The only event type turned into chat
pub const CHAT_MESSAGE_SENT: &str = "chat.message.sent";

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct ChatMessageSent {
    message_id: Option<String>,
    broadcaster: Option<Party>,
    sender: Option<Party>,
    content: Option<String>,
    created_at: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct Party {
    username: Option<String>,
    channel_slug: Option<String>,
}

/// Normalize a verified `chat.message.sent` body.
///
/// Returns the relay room and the event; `None` when the body is not JSON
/// or names no channel.
pub fn normalize_chat_webhook(raw_body: &[u8]) -> Option<(String, ChatEvent)> {
    let body: ChatMessageSent = match serde_json::from_slice(raw_body) {
        Ok(body) => body,
        Err(e) => {
            tracing::warn!("Verified webhook body is not a chat message: {}", e);
            return None;
        }
    };

    let Some(channel) = body
        .broadcaster
        .and_then(|b| b.channel_slug)
        .filter(|s| !s.trim().is_empty())
    else {
        tracing::warn!("Chat webhook without a channel slug, dropping");
        return None;
    };
    let at = body
        .created_at
        .as_deref()
        .and_then(|ts| DateTime::parse_from_rfc3339(ts).ok())
        .map(|ts| ts.timestamp_millis())
        .unwrap_or_else(now_ms);

    let event = ChatEvent {
        id: body
            .message_id
            .unwrap_or_else(|| Uuid::new_v4().to_string()),
        platform: Platform::WebhookChat,
        channel: channel.clone(),
        username: body
            .sender
            .and_then(|s| s.username)
            .unwrap_or_else(|| "kick-user".to_string()),
        text: body.content.unwrap_or_default(),
        at,
    };

    Some((relay_room(&channel), event))
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    #[serde(default)]
    expires_in: u64,
}

#[derive(Debug, Clone)]
struct AppToken {
    access_token: String,
    expires_at: Instant,
}

impl AppToken {
    /// Treat tokens as expired a minute early
    fn is_fresh(&self) -> bool {
        Instant::now() + Duration::from_secs(60) < self.expires_at
    }
}

#[derive(Debug, Deserialize)]
struct ChannelsResponse {
    #[serde(default)]
    data: Vec<ChannelInfo>,
}

#[derive(Debug, Deserialize)]
struct ChannelInfo {
    broadcaster_user_id: u64,
}

/// Registers `chat.message.sent` webhooks with the app's client credentials
pub struct KickEventsClient {
    client: reqwest::Client,
    client_id: String,
    client_secret: String,
    api_base: String,
    auth_base: String,
    token: RwLock<Option<AppToken>>,
    subscribed: Mutex<HashSet<String>>,
}

impl KickEventsClient {
    pub fn new(client_id: impl Into<String>, client_secret: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            client_id: client_id.into(),
            client_secret: client_secret.into(),
            api_base: KICK_API_BASE.to_string(),
            auth_base: KICK_AUTH_BASE.to_string(),
            token: RwLock::new(None),
            subscribed: Mutex::new(HashSet::new()),
        }
    }

    pub fn with_endpoints(mut self, api_base: impl Into<String>, auth_base: impl Into<String>) -> Self {
        self.api_base = api_base.into().trim_end_matches('/').to_string();
        self.auth_base = auth_base.into().trim_end_matches('/').to_string();
        self
    }

    async fn app_token(&self) -> Result<String> {
        if let Some(token) = self.token.read().as_ref().filter(|t| t.is_fresh()) {
            return Ok(token.access_token.clone());
        }

        let response = self
            .client
            .post(format!("{}/oauth/token", self.auth_base))
            .form(&[
                ("grant_type", "client_credentials"),
                ("client_id", self.client_id.as_str()),
                ("client_secret", self.client_secret.as_str()),
            ])
            .timeout(Duration::from_secs(10))
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(ChatError::Upstream(format!(
                "Kick token request returned {}",
                response.status()
            )));
        }

        let token: TokenResponse = response.json().await?;
        let expires_in = if token.expires_in == 0 { 3_600 } else { token.expires_in };
        *self.token.write() = Some(AppToken {
            access_token: token.access_token.clone(),
            expires_at: Instant::now() + Duration::from_secs(expires_in),
        });
        tracing::debug!("Obtained Kick app token valid for {}s", expires_in);
        Ok(token.access_token)
    }

    async fn broadcaster_id(&self, token: &str, slug: &str) -> Result<u64> {
        let response = self
            .client
            .get(format!("{}/channels", self.api_base))
            .query(&[("slug", slug)])
            .bearer_auth(token)
            .timeout(Duration::from_secs(10))
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(ChatError::Upstream(format!(
                "Kick channel lookup returned {}",
                response.status()
            )));
        }

        let channels: ChannelsResponse = response.json().await?;
        channels
            .data
            .first()
            .map(|c| c.broadcaster_user_id)
            .ok_or_else(|| ChatError::Upstream(format!("Kick channel '{slug}' not found")))
    }

    async fn subscribe_chat(&self, token: &str, broadcaster_user_id: u64) -> Result<()> {
        let response = self
            .client
            .post(format!("{}/events/subscriptions", self.api_base))
            .bearer_auth(token)
            .json(&json!({
                "method": "webhook",
                "broadcaster_user_id": broadcaster_user_id,
                "events": [{"name": CHAT_MESSAGE_SENT, "version": 1}],
            }))
            .timeout(Duration::from_secs(10))
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(ChatError::Upstream(format!(
                "Kick subscription returned {}",
                response.status()
            )));
        }
        Ok(())
    }
}

#[async_trait]
impl WebhookSubscriber for KickEventsClient {
    async fn ensure_subscribed(&self, room: &str) -> Result<()> {
        if self.subscribed.lock().contains(room) {
            return Ok(());
        }

        let token = self.app_token().await?;
        let broadcaster = self.broadcaster_id(&token, room).await?;
        self.subscribe_chat(&token, broadcaster).await?;

        self.subscribed.lock().insert(room.to_string());
        tracing::info!(room = %room, broadcaster, "Registered Kick chat webhook");
        Ok(())
    }
}

/// Candidate clusters, preferred first, without repeats
pub fn cluster_candidates(preferred: Option<&str>) -> Vec<String> {
    let mut seen = HashSet::new();
    preferred
        .map(str::trim)
        .filter(|c| !c.is_empty())
        .into_iter()
        .chain(PUSHER_CLUSTERS)
        .filter(|c| seen.insert(c.to_string()))
        .map(str::to_string)
        .collect()
}

fn as_id(value: &Value) -> Option<u64> {
    match value {
        Value::Number(n) => n.as_u64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

/// Chatroom id from a v2 or v1 channel document
pub fn chatroom_id_from_json(channel: &Value) -> Option<u64> {
    ["/chatroom/id", "/livestream/chatroom/id", "/data/chatroom/id"]
        .iter()
        .find_map(|path| channel.pointer(path).and_then(as_id))
}

fn html_patterns() -> &'static [Regex] {
    static PATTERNS: OnceLock<Vec<Regex>> = OnceLock::new();
    PATTERNS.get_or_init(|| {
        [
            r#""chatroom"\s*:\s*\{\s*"id"\s*:\s*(\d+)"#,
            r#"(?i)"chatroom_id"\s*:\s*(\d+)"#,
            r#"(?i)chatroom_id["']?\s*:\s*(\d+)"#,
        ]
        .iter()
        .filter_map(|pattern| Regex::new(pattern).ok())
        .collect()
    })
}

/// Chatroom id embedded in a channel page
pub fn chatroom_id_from_html(html: &str) -> Option<u64> {
    html_patterns()
        .iter()
        .find_map(|re| re.captures(html)?.get(1)?.as_str().parse().ok())
}

/// One socket message; `data` is often a JSON document encoded as a string
#[derive(Debug, Deserialize)]
struct PusherEnvelope {
    event: String,
    #[serde(default)]
    data: Value,
}

impl PusherEnvelope {
    fn parse(text: &str) -> Option<Self> {
        let mut envelope: Self = serde_json::from_str(text).ok()?;
        if let Value::String(inner) = &envelope.data {
            if let Ok(decoded) = serde_json::from_str(inner) {
                envelope.data = decoded;
            }
        }
        Some(envelope)
    }

    fn error_code(&self) -> Option<u64> {
        self.data.get("code").and_then(as_id)
    }
}

/// Normalize a chat socket message for `slug`; `None` without text or sender
pub fn normalize_pusher_chat(slug: &str, chatroom_id: u64, data: &Value) -> Option<ChatEvent> {
    let message = data.get("data").filter(|d| d.is_object()).unwrap_or(data);
    let text = message
        .get("content")
        .or_else(|| message.get("message"))
        .and_then(Value::as_str)
        .filter(|t| !t.is_empty())?;
    let username = message
        .get("sender")
        .or_else(|| message.get("user"))
        .and_then(|s| s.get("username"))
        .and_then(Value::as_str)?;

    let id = match message.get("id") {
        Some(Value::String(id)) => id.clone(),
        Some(Value::Number(id)) => id.to_string(),
        _ => format!("{chatroom_id}-{}-{}", now_ms(), Uuid::new_v4().simple()),
    };
    let at = message
        .get("created_at")
        .and_then(Value::as_str)
        .and_then(|ts| DateTime::parse_from_rfc3339(ts).ok())
        .map(|ts| ts.timestamp_millis())
        .unwrap_or_else(now_ms);

    Some(ChatEvent {
        id,
        platform: Platform::WebhookChat,
        channel: slug.to_string(),
        username: username.to_string(),
        text: text.to_string(),
        at,
    })
}

/// Reads Kick chat straight from the site's Pusher socket, without webhooks
pub struct KickPusherConnector {
    client: reqwest::Client,
    web_base: String,
    key: String,
    preferred_cluster: Option<String>,
    socket_template: String,
    handshake_timeout: Duration,
    /// Last cluster that accepted the key
    cluster: RwLock<Option<String>>,
    chatrooms: RwLock<HashMap<String, u64>>,
}

impl KickPusherConnector {
    pub fn new() -> Self {
        Self {
            client: reqwest::Client::new(),
            web_base: KICK_WEB_BASE.to_string(),
            key: KICK_PUSHER_KEY.to_string(),
            preferred_cluster: None,
            socket_template: PUSHER_SOCKET_TEMPLATE.to_string(),
            handshake_timeout: Duration::from_secs(6),
            cluster: RwLock::new(None),
            chatrooms: RwLock::new(HashMap::new()),
        }
    }

    pub fn with_key(mut self, key: impl Into<String>) -> Self {
        self.key = key.into();
        self
    }

    pub fn with_cluster(mut self, cluster: impl Into<String>) -> Self {
        self.preferred_cluster = Some(cluster.into());
        self
    }

    pub fn with_web_base(mut self, web_base: impl Into<String>) -> Self {
        self.web_base = web_base.into().trim_end_matches('/').to_string();
        self
    }

    pub fn with_socket_template(mut self, template: impl Into<String>) -> Self {
        self.socket_template = template.into().trim_end_matches('/').to_string();
        self
    }

    pub fn with_handshake_timeout(mut self, timeout: Duration) -> Self {
        self.handshake_timeout = timeout;
        self
    }

    /// Pin a slug to a known chatroom id, skipping the lookup
    pub fn with_chatroom(self, slug: &str, chatroom_id: u64) -> Self {
        self.chatrooms.write().insert(relay_room(slug), chatroom_id);
        self
    }

    /// Cluster of the last successful handshake
    pub fn cluster(&self) -> Option<String> {
        self.cluster.read().clone()
    }

    fn socket_url(&self, cluster: &str) -> String {
        format!(
            "{}/app/{}?protocol=7&client=js&version=8.4.0&flash=false",
            self.socket_template.replace("{cluster}", cluster),
            self.key
        )
    }

    async fn fetch(&self, url: &str, accept: &str, slug: &str) -> Option<reqwest::Response> {
        let response = self
            .client
            .get(url)
            .header(reqwest::header::USER_AGENT, BROWSER_USER_AGENT)
            .header(reqwest::header::ACCEPT, accept)
            .header(reqwest::header::ACCEPT_LANGUAGE, "en-US,en;q=0.9")
            .header(reqwest::header::REFERER, format!("{}/{}", self.web_base, slug))
            .timeout(Duration::from_secs(10))
            .send()
            .await;
        match response {
            Ok(response) if response.status().is_success() => Some(response),
            Ok(response) => {
                tracing::debug!(url = %url, "Kick lookup returned {}", response.status());
                None
            }
            Err(e) => {
                tracing::debug!(url = %url, "Kick lookup failed: {}", e);
                None
            }
        }
    }

    /// v2 API, then v1, then the channel page
    async fn chatroom_id(&self, slug: &str) -> Result<u64> {
        if let Some(id) = self.chatrooms.read().get(slug) {
            return Ok(*id);
        }

        let path: String = url::form_urlencoded::byte_serialize(slug.as_bytes()).collect();
        let mut found = None;
        for version in ["v2", "v1"] {
            let url = format!("{}/api/{}/channels/{}", self.web_base, version, path);
            if let Some(response) = self.fetch(&url, "application/json, text/plain, */*", slug).await {
                found = response.json::<Value>().await.ok().as_ref().and_then(chatroom_id_from_json);
                if found.is_some() {
                    break;
                }
            }
        }
        if found.is_none() {
            let url = format!("{}/{}", self.web_base, path);
            if let Some(response) = self.fetch(&url, "text/html,application/xhtml+xml", slug).await {
                found = response.text().await.ok().as_deref().and_then(chatroom_id_from_html);
            }
        }

        let id = found.ok_or_else(|| ChatError::Upstream(format!("Kick chatroom for '{slug}' not found")))?;
        self.chatrooms.write().insert(slug.to_string(), id);
        tracing::debug!(slug = %slug, chatroom = id, "Resolved Kick chatroom");
        Ok(id)
    }

    /// Waits for `pusher:connection_established`
    async fn handshake(&self, url: &str) -> Result<WsStream> {
        let (mut ws, _) = tokio_tungstenite::connect_async(url).await?;
        while let Some(message) = ws.next().await {
            let Message::Text(text) = message? else {
                continue;
            };
            let Some(envelope) = PusherEnvelope::parse(&text) else {
                continue;
            };
            match envelope.event.as_str() {
                "pusher:connection_established" => return Ok(ws),
                "pusher:error" => {
                    return Err(ChatError::Upstream(format!(
                        "socket refused key (code {})",
                        envelope.error_code().unwrap_or_default()
                    )))
                }
                _ => {}
            }
        }
        Err(ChatError::Transport("socket closed during handshake".to_string()))
    }

    /// Cluster auto-discovery: the last good cluster first, then the rest
    async fn open_socket(&self) -> Result<WsStream> {
        let known = self.cluster().or_else(|| self.preferred_cluster.clone());
        for cluster in cluster_candidates(known.as_deref()) {
            let url = self.socket_url(&cluster);
            match tokio::time::timeout(self.handshake_timeout, self.handshake(&url)).await {
                Ok(Ok(ws)) => {
                    tracing::debug!(cluster = %cluster, "Kick socket connected");
                    *self.cluster.write() = Some(cluster);
                    return Ok(ws);
                }
                Ok(Err(e)) => tracing::debug!(cluster = %cluster, "Kick socket cluster failed: {}", e),
                Err(_) => tracing::debug!(cluster = %cluster, "Kick socket handshake timed out"),
            }
        }
        Err(ChatError::Transport("no Kick socket cluster accepted the key".to_string()))
    }
}

impl Default for KickPusherConnector {
    fn default() -> Self {
        Self::new()
    }
}

struct PusherSession {
    write: SplitSink<WsStream, Message>,
    read: SplitStream<WsStream>,
    slug: String,
    chatroom_id: u64,
    pending: VecDeque<ChatEvent>,
    done: bool,
}

impl PusherSession {
    async fn absorb(&mut self, text: &str) -> Result<()> {
        let Some(envelope) = PusherEnvelope::parse(text) else {
            return Ok(());
        };
        match envelope.event.as_str() {
            "pusher:ping" => {
                let pong = json!({"event": "pusher:pong", "data": {}});
                self.write.send(Message::Text(pong.to_string())).await?;
            }
            "pusher_internal:subscription_succeeded" => {
                tracing::debug!(slug = %self.slug, "Subscribed to Kick chatroom {}", self.chatroom_id);
            }
            "pusher:subscription_error" | "pusher:error" => {
                return Err(ChatError::Upstream(format!("Kick socket error: {}", envelope.data)));
            }
            CHAT_MESSAGE_EVENT => {
                if let Some(event) = normalize_pusher_chat(&self.slug, self.chatroom_id, &envelope.data) {
                    self.pending.push_back(event);
                }
            }
            _ => {}
        }
        Ok(())
    }
}

#[async_trait]
impl PushConnector for KickPusherConnector {
    async fn connect(&self, room: &str) -> Result<PushStream> {
        let slug = relay_room(room);
        let chatroom_id = self.chatroom_id(&slug).await?;
        let (mut write, read) = self.open_socket().await?.split();

        let subscribe = json!({
            "event": "pusher:subscribe",
            "data": {"auth": "", "channel": format!("chatrooms.{chatroom_id}.v2")},
        });
        write.send(Message::Text(subscribe.to_string())).await?;

        let session = PusherSession {
            write,
            read,
            slug,
            chatroom_id,
            pending: VecDeque::new(),
            done: false,
        };

        let stream = futures::stream::unfold(session, |mut session| async move {
            loop {
                if let Some(event) = session.pending.pop_front() {
                    return Some((Ok(event), session));
                }
                if session.done {
                    return None;
                }

                let failure = match session.read.next().await {
                    Some(Ok(Message::Text(text))) => session.absorb(&text).await.err(),
                    Some(Ok(Message::Close(_))) | None => return None,
                    Some(Ok(_)) => None,
                    Some(Err(e)) => Some(ChatError::from(e)),
                };
                if let Some(e) = failure {
                    session.done = true;
                    return Some((Err(e), session));
                }
            }
        });

        Ok(stream.boxed())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_full_payload() {
        let body = br#"{
            "message_id": "m-1",
            "broadcaster": {"username": "Streamer", "channel_slug": "Streamer"},
            "sender": {"username": "fan42", "channel_slug": "fan42"},
            "content": "gg",
            "created_at": "2025-01-14T16:08:06Z"
        }"#;

        let (room, event) = normalize_chat_webhook(body).unwrap();
        assert_eq!(room, "streamer");
        assert_eq!(event.id, "m-1");
        assert_eq!(event.channel, "Streamer");
        assert_eq!(event.username, "fan42");
        assert_eq!(event.text, "gg");
        assert_eq!(event.at, 1_736_870_886_000);
        assert_eq!(event.platform, Platform::WebhookChat);
    }

    #[test]
    fn test_normalize_fallbacks() {
        let (room, event) = normalize_chat_webhook(br#"{"broadcaster":{"channel_slug":"chan"}}"#).unwrap();
        assert_eq!(room, "chan");
        assert_eq!(event.channel, "chan");
        assert_eq!(event.username, "kick-user");
        assert_eq!(event.text, "");
        assert!(!event.id.is_empty());
    }

    #[test]
    fn test_normalize_rejects_non_json() {
        assert!(normalize_chat_webhook(b"not json").is_none());
    }

    #[test]
    fn test_normalize_requires_channel() {
        assert!(normalize_chat_webhook(b"{}").is_none());
        assert!(normalize_chat_webhook(br#"{"broadcaster":{"channel_slug":"  "}}"#).is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_token_freshness_window() {
        let token = AppToken {
            access_token: "t".to_string(),
            expires_at: Instant::now() + Duration::from_secs(120),
        };
        assert!(token.is_fresh());

        tokio::time::advance(Duration::from_secs(61)).await;
        assert!(!token.is_fresh());
    }

    #[test]
    fn test_cluster_candidates_preferred_first() {
        let clusters = cluster_candidates(Some("us3"));
        assert_eq!(clusters[0], "us3");
        assert_eq!(clusters.len(), PUSHER_CLUSTERS.len());
        assert_eq!(cluster_candidates(None)[0], "us2");
        assert_eq!(cluster_candidates(Some(" ")).len(), PUSHER_CLUSTERS.len());
    }

    #[test]
    fn test_chatroom_id_lookups() {
        assert_eq!(chatroom_id_from_json(&json!({"chatroom": {"id": 42}})), Some(42));
        assert_eq!(
            chatroom_id_from_json(&json!({"livestream": {"chatroom": {"id": "7"}}})),
            Some(7)
        );
        assert_eq!(chatroom_id_from_json(&json!({"data": {"chatroom": {"id": 9}}})), Some(9));
        assert_eq!(chatroom_id_from_json(&json!({"slug": "x"})), None);

        assert_eq!(
            chatroom_id_from_html(r#"<script>{"chatroom": { "id": 1234, "slow_mode": false}}</script>"#),
            Some(1234)
        );
        assert_eq!(chatroom_id_from_html("window.props = {chatroom_id: 55}"), Some(55));
        assert_eq!(chatroom_id_from_html("<html>blocked</html>"), None);
    }

    #[test]
    fn test_normalize_pusher_chat() {
        let data = json!({
            "id": "abc",
            "chatroom_id": 42,
            "content": "gg",
            "sender": {"username": "fan42"},
            "created_at": "2025-01-14T16:08:06+00:00"
        });
        let event = normalize_pusher_chat("streamer", 42, &data).unwrap();
        assert_eq!(event.id, "abc");
        assert_eq!(event.channel, "streamer");
        assert_eq!(event.username, "fan42");
        assert_eq!(event.at, 1_736_870_886_000);
        assert_eq!(event.platform, Platform::WebhookChat);

        let nested = json!({"data": {"message": "hi", "user": {"username": "u"}}});
        let event = normalize_pusher_chat("streamer", 42, &nested).unwrap();
        assert!(event.id.starts_with("42-"));
        assert_eq!(event.text, "hi");

        assert!(normalize_pusher_chat("streamer", 42, &json!({"content": "no sender"})).is_none());
    }

    #[test]
    fn test_envelope_decodes_string_data() {
        let text = json!({"event": "pusher:error", "data": json!({"code": 4001}).to_string()}).to_string();
        let envelope = PusherEnvelope::parse(&text).unwrap();
        assert_eq!(envelope.error_code(), Some(4001));
    }

    async fn next_text(ws: &mut WebSocketStream<TcpStream>) -> String {
        loop {
            match ws.next().await {
                Some(Ok(Message::Text(text))) => return text,
                Some(Ok(_)) => continue,
                other => panic!("unexpected {other:?}"),
            }
        }
    }

    #[tokio::test]
    async fn test_pusher_connector_discovers_cluster_and_streams_chat() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let server = tokio::spawn(async move {
            // First cluster does not know the key
            let (tcp, _) = listener.accept().await.unwrap();
            let mut ws = tokio_tungstenite::accept_async(tcp).await.unwrap();
            let refused = json!({"event": "pusher:error", "data": {"code": 4001, "message": "wrong cluster"}});
            ws.send(Message::Text(refused.to_string())).await.unwrap();
            let _ = ws.close(None).await;

            let (tcp, _) = listener.accept().await.unwrap();
            let mut ws = tokio_tungstenite::accept_async(tcp).await.unwrap();
            let established = json!({
                "event": "pusher:connection_established",
                "data": json!({"socket_id": "1.2", "activity_timeout": 120}).to_string(),
            });
            ws.send(Message::Text(established.to_string())).await.unwrap();
            let subscribe = next_text(&mut ws).await;

            ws.send(Message::Text(json!({"event": "pusher:ping", "data": {}}).to_string()))
                .await
                .unwrap();
            let chat = json!({
                "event": "App\\Events\\ChatMessageEvent",
                "channel": "chatrooms.42.v2",
                "data": json!({"id": "k-1", "content": "hello", "sender": {"username": "fan"}}).to_string(),
            });
            ws.send(Message::Text(chat.to_string())).await.unwrap();
            let pong = next_text(&mut ws).await;
            (subscribe, pong)
        });

        let connector = KickPusherConnector::new()
            .with_socket_template(format!("ws://{addr}"))
            .with_chatroom("Streamer", 42)
            .with_handshake_timeout(Duration::from_secs(5));
        let mut stream = connector.connect("Streamer").await.unwrap();

        let event = stream.next().await.unwrap().unwrap();
        assert_eq!(event.id, "k-1");
        assert_eq!(event.channel, "streamer");
        assert_eq!(event.username, "fan");
        assert_eq!(event.text, "hello");
        assert_eq!(connector.cluster().as_deref(), Some(PUSHER_CLUSTERS[1]));

        let (subscribe, pong) = server.await.unwrap();
        let subscribe: Value = serde_json::from_str(&subscribe).unwrap();
        assert_eq!(subscribe["event"], "pusher:subscribe");
        assert_eq!(subscribe["data"]["channel"], "chatrooms.42.v2");
        assert!(pong.contains("pusher:pong"));
    }
}
