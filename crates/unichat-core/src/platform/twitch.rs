//! Twitch chat over IRC-on-WebSocket, read-only and anonymous

use async_trait::async_trait;
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use rand::Rng;
use std::collections::{HashMap, VecDeque};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use uuid::Uuid;

use crate::adapter::push::{PushConnector, PushStream};
use crate::types::{now_ms, ChatEvent, Platform};
use crate::{ChatError, Result};

pub const TWITCH_IRC_URL: &str = "wss://irc-ws.chat.twitch.tv:443";

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// One parsed IRC line
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IrcMessage {
    pub tags: HashMap<String, String>,
    pub prefix: Option<String>,
    pub command: String,
    /// Middle params followed by the trailing param, if any
    pub params: Vec<String>,
}

impl IrcMessage {
    pub fn tag(&self, name: &str) -> Option<&str> {
        self.tags
            .get(name)
            .map(String::as_str)
            .filter(|v| !v.is_empty())
    }

    /// Nick from `nick!user@host`
    pub fn login(&self) -> Option<&str> {
        self.prefix
            .as_deref()
            .and_then(|p| p.split('!').next())
            .filter(|n| !n.is_empty() && !n.contains('.'))
    }
}

fn unescape_tag(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    let mut chars = value.chars();
    while let Some(c) = chars.next() {
        if c != '\\' {
            out.push(c);
            continue;
        }
        match chars.next() {
            Some('s') => out.push(' '),
            Some(':') => out.push(';'),
            Some('\\') => out.push('\\'),
            Some('r') => out.push('\r'),
            Some('n') => out.push('\n'),
            Some(other) => out.push(other),
            None => {}
        }
    }
    out
}

/// Parse one IRCv3 line. Returns `None` for blank or malformed input.
pub fn parse_irc_line(line: &str) -> Option<IrcMessage> {
    let mut rest = line.trim_end_matches(|c| c == '\r' || c == '\n');

    let mut tags = HashMap::new();
    if let Some(tagged) = rest.strip_prefix('@') {
        let (raw, after) = tagged.split_once(' ')?;
        for pair in raw.split(';').filter(|p| !p.is_empty()) {
            let (key, value) = pair.split_once('=').unwrap_or((pair, ""));
            tags.insert(key.to_string(), unescape_tag(value));
        }
        rest = after.trim_start_matches(' ');
    }

    let mut prefix = None;
    if let Some(prefixed) = rest.strip_prefix(':') {
        let (p, after) = prefixed.split_once(' ')?;
        prefix = Some(p.to_string());
        rest = after.trim_start_matches(' ');
    }

    let (command, mut remaining) = rest.split_once(' ').unwrap_or((rest, ""));
    if command.is_empty() {
        return None;
    }

    let mut params = Vec::new();
    loop {
        let p = remaining.trim_start_matches(' ');
        if p.is_empty() {
            break;
        }
        if let Some(trailing) = p.strip_prefix(':') {
            params.push(trailing.to_string());
            break;
        }
        match p.split_once(' ') {
            Some((param, after)) => {
                params.push(param.to_string());
                remaining = after;
            }
            None => {
                params.push(p.to_string());
                break;
            }
        }
    }

    Some(IrcMessage {
        tags,
        prefix,
        command: command.to_string(),
        params,
    })
}

/// Normalize a PRIVMSG into a chat event
pub fn normalize_privmsg(msg: &IrcMessage) -> Option<ChatEvent> {
    if msg.command != "PRIVMSG" || msg.params.len() < 2 {
        return None;
    }

    let channel = msg.params[0].trim_start_matches('#').to_string();
    let mut text = msg.params[1].as_str();
    if let Some(action) = text
        .strip_prefix("\u{1}ACTION ")
        .and_then(|t| t.strip_suffix('\u{1}'))
    {
        text = action;
    }

    let id = match msg.tag("id") {
        Some(id) => format!("{channel}-{id}"),
        None => format!("{channel}-{}", Uuid::new_v4()),
    };
    let username = msg
        .tag("display-name")
        .or_else(|| msg.login())
        .unwrap_or("twitch-user")
        .to_string();
    let at = msg
        .tag("tmi-sent-ts")
        .and_then(|ts| ts.parse::<i64>().ok())
        .unwrap_or_else(now_ms);

    Some(ChatEvent {
        id,
        platform: Platform::PushChat,
        channel,
        username,
        text: text.to_string(),
        at,
    })
}

/// Anonymous IRC connector
#[derive(Debug, Clone)]
pub struct TwitchIrcConnector {
    url: String,
}

impl TwitchIrcConnector {
    pub fn new() -> Self {
        Self::with_url(TWITCH_IRC_URL)
    }

    pub fn with_url(url: impl Into<String>) -> Self {
        Self { url: url.into() }
    }
}

impl Default for TwitchIrcConnector {
    fn default() -> Self {
        Self::new()
    }
}

struct IrcSession {
    write: SplitSink<WsStream, Message>,
    read: SplitStream<WsStream>,
    pending: VecDeque<ChatEvent>,
    done: bool,
}

impl IrcSession {
    /// Handle one text frame; may hold several lines
    async fn absorb(&mut self, text: &str) -> Result<()> {
        for line in text.split("\r\n").filter(|l| !l.is_empty()) {
            let Some(msg) = parse_irc_line(line) else {
                continue;
            };
            match msg.command.as_str() {
                "PING" => {
                    let token = msg.params.first().map(String::as_str).unwrap_or("tmi.twitch.tv");
                    self.write.send(Message::Text(format!("PONG :{token}"))).await?;
                }
                "PRIVMSG" => {
                    if let Some(event) = normalize_privmsg(&msg) {
                        self.pending.push_back(event);
                    }
                }
                "RECONNECT" => {
                    // Ends the stream cleanly once buffered messages drain
                    tracing::debug!("Twitch requested a reconnect");
                    self.done = true;
                    break;
                }
                "NOTICE" => {
                    tracing::debug!("Twitch notice: {:?}", msg.params.last());
                }
                _ => {}
            }
        }
        Ok(())
    }
}

#[async_trait]
impl PushConnector for TwitchIrcConnector {
    async fn connect(&self, room: &str) -> Result<PushStream> {
        let nick = format!("justinfan{}", rand::thread_rng().gen_range(10_000..100_000));
        let (ws, _) = tokio_tungstenite::connect_async(self.url.as_str()).await?;
        let (mut write, read) = ws.split();

        for line in [
            "CAP REQ :twitch.tv/tags twitch.tv/commands".to_string(),
            "PASS SCHMOOPIIE".to_string(),
            format!("NICK {nick}"),
            format!("JOIN #{}", room.to_ascii_lowercase()),
        ] {
            write.send(Message::Text(line)).await?;
        }
        tracing::debug!(room = %room, nick = %nick, "Joined Twitch channel");

        let session = IrcSession {
            write,
            read,
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
    use proptest::prelude::*;

    const SAMPLE: &str = "@badge-info=;color=#1E90FF;display-name=Alice;id=b34ccfc7-4977-403a-8a94-33c6bac34fb8;tmi-sent-ts=1700000000123 :alice!alice@alice.tmi.twitch.tv PRIVMSG #somechannel :hello there";

    #[test]
    fn test_parse_tagged_privmsg() {
        let msg = parse_irc_line(SAMPLE).unwrap();
        assert_eq!(msg.command, "PRIVMSG");
        assert_eq!(msg.tag("display-name"), Some("Alice"));
        assert_eq!(msg.tag("badge-info"), None);
        assert_eq!(msg.login(), Some("alice"));
        assert_eq!(msg.params, vec!["#somechannel", "hello there"]);
    }

    #[test]
    fn test_normalize_privmsg() {
        let event = normalize_privmsg(&parse_irc_line(SAMPLE).unwrap()).unwrap();
        assert_eq!(event.id, "somechannel-b34ccfc7-4977-403a-8a94-33c6bac34fb8");
        assert_eq!(event.channel, "somechannel");
        assert_eq!(event.username, "Alice");
        assert_eq!(event.text, "hello there");
        assert_eq!(event.at, 1_700_000_000_123);
        assert_eq!(event.platform, Platform::PushChat);
    }

    #[test]
    fn test_username_fallbacks() {
        let bare = parse_irc_line(":bob!bob@bob.tmi.twitch.tv PRIVMSG #chan :hi").unwrap();
        let event = normalize_privmsg(&bare).unwrap();
        assert_eq!(event.username, "bob");
        assert!(event.id.starts_with("chan-"));

        let anonymous = parse_irc_line("@display-name= :tmi.twitch.tv PRIVMSG #chan :hi").unwrap();
        assert_eq!(normalize_privmsg(&anonymous).unwrap().username, "twitch-user");
    }

    #[test]
    fn test_action_and_escapes() {
        let msg = parse_irc_line(
            "@display-name=A\\sB;id=1 :a!a@a PRIVMSG #c :\u{1}ACTION waves\u{1}",
        )
        .unwrap();
        let event = normalize_privmsg(&msg).unwrap();
        assert_eq!(event.username, "A B");
        assert_eq!(event.text, "waves");
    }

    #[test]
    fn test_non_privmsg_lines() {
        let ping = parse_irc_line("PING :tmi.twitch.tv").unwrap();
        assert_eq!(ping.command, "PING");
        assert_eq!(ping.params, vec!["tmi.twitch.tv"]);
        assert!(normalize_privmsg(&ping).is_none());

        assert!(parse_irc_line("").is_none());
        assert!(parse_irc_line("@only-tags").is_none());
    }

    proptest! {
        #[test]
        fn prop_parser_never_panics(line in ".{0,300}") {
            let _ = parse_irc_line(&line);
        }

        #[test]
        fn prop_message_text_preserved(text in r"[^\r\n\x00\x01]{1,200}") {
            let line = format!("@id=x :u!u@u.tmi.twitch.tv PRIVMSG #chan :{text}");
            let event = normalize_privmsg(&parse_irc_line(&line).unwrap()).unwrap();
            prop_assert_eq!(event.text, text);
        }
    }
}
