//! Redis-over-REST coordination store (Upstash wire format)
//!
//! Commands go through `/pipeline` as JSON arrays; pub/sub uses
//! `/publish/{channel}` and a long-lived `/subscribe/{channel}` event stream
//! whose data lines look like `message,<channel>,<payload>`.

use async_trait::async_trait;
use futures::{Stream, StreamExt};
use serde::Deserialize;
use serde_json::{json, Value};
use std::collections::VecDeque;
use std::time::Duration;
use url::Url;

use super::{CoordinationStore, RelayStream};
use crate::{ChatError, Result};

/// Set-if-absent with expiry, or renew when the caller already holds it.
/// Runs atomically on the server.
const ACQUIRE_SCRIPT: &str = r#"
local current = redis.call('GET', KEYS[1])
if current == ARGV[1] then
  redis.call('PEXPIRE', KEYS[1], ARGV[2])
  return 1
end
if redis.call('SET', KEYS[1], ARGV[1], 'NX', 'PX', ARGV[2]) then
  return 1
end
return 0
"#;

#[derive(Debug, Deserialize)]
struct Reply {
    #[serde(default)]
    result: Value,
    #[serde(default)]
    error: Option<String>,
}

impl Reply {
    fn into_result(self) -> Result<Value> {
        match self.error {
            Some(err) => Err(ChatError::Store(err)),
            None => Ok(self.result),
        }
    }
}

/// Coordination store backed by a Redis REST endpoint
#[derive(Clone)]
pub struct UpstashStore {
    client: reqwest::Client,
    base_url: Url,
    token: String,
}

impl UpstashStore {
    pub fn new(base_url: &str, token: impl Into<String>) -> Result<Self> {
        let base_url = Url::parse(base_url.trim_end_matches('/'))
            .map_err(|e| ChatError::InvalidInput(format!("store url: {e}")))?;
        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(5))
            .build()
            .map_err(|e| ChatError::Store(e.to_string()))?;

        Ok(Self {
            client,
            base_url,
            token: token.into(),
        })
    }

    fn endpoint(&self, segments: &[&str]) -> Result<Url> {
        let mut url = self.base_url.clone();
        url.path_segments_mut()
            .map_err(|_| ChatError::Store("store url cannot be a base".to_string()))?
            .pop_if_empty()
            .extend(segments);
        Ok(url)
    }

    async fn pipeline(&self, command: Value) -> Result<Value> {
        let url = self.endpoint(&["pipeline"])?;
        let response = self
            .client
            .post(url)
            .bearer_auth(&self.token)
            .timeout(Duration::from_secs(10))
            .json(&json!([command]))
            .send()
            .await
            .map_err(|e| ChatError::Store(e.to_string()))?;

        if !response.status().is_success() {
            return Err(ChatError::Store(format!("pipeline status {}", response.status())));
        }

        let mut replies: Vec<Reply> = response
            .json()
            .await
            .map_err(|e| ChatError::Store(e.to_string()))?;
        match replies.pop() {
            Some(reply) if replies.is_empty() => reply.into_result(),
            _ => Err(ChatError::Store("unexpected pipeline reply".to_string())),
        }
    }
}

#[async_trait]
impl CoordinationStore for UpstashStore {
    async fn acquire_lock(&self, key: &str, holder: &str, ttl: Duration) -> Result<bool> {
        let ttl_ms = ttl.as_millis().max(1).to_string();
        let result = self
            .pipeline(json!(["EVAL", ACQUIRE_SCRIPT, "1", key, holder, ttl_ms]))
            .await?;
        Ok(result.as_i64() == Some(1))
    }

    async fn get(&self, key: &str) -> Result<Option<String>> {
        let url = self.endpoint(&["get", key])?;
        let response = self
            .client
            .get(url)
            .bearer_auth(&self.token)
            .timeout(Duration::from_secs(10))
            .send()
            .await
            .map_err(|e| ChatError::Store(e.to_string()))?;

        if !response.status().is_success() {
            return Err(ChatError::Store(format!("get status {}", response.status())));
        }

        let reply: Reply = response
            .json()
            .await
            .map_err(|e| ChatError::Store(e.to_string()))?;
        Ok(match reply.into_result()? {
            Value::String(s) => Some(s),
            Value::Null => None,
            other => Some(other.to_string()),
        })
    }

    async fn set_with_ttl(&self, key: &str, value: &str, ttl: Duration) -> Result<()> {
        let ttl_secs = ttl.as_secs().max(1).to_string();
        self.pipeline(json!(["SET", key, value, "EX", ttl_secs])).await?;
        Ok(())
    }

    async fn publish(&self, channel: &str, payload: &str) -> Result<()> {
        let url = self.endpoint(&["publish", channel])?;
        let response = self
            .client
            .post(url)
            .bearer_auth(&self.token)
            .timeout(Duration::from_secs(10))
            .body(payload.to_string())
            .send()
            .await
            .map_err(|e| ChatError::Store(e.to_string()))?;

        if !response.status().is_success() {
            return Err(ChatError::Store(format!("publish status {}", response.status())));
        }
        Ok(())
    }

    async fn subscribe(&self, channel: &str) -> Result<RelayStream> {
        let url = self.endpoint(&["subscribe", channel])?;
        let response = self
            .client
            .post(url)
            .bearer_auth(&self.token)
            .header(reqwest::header::ACCEPT, "text/event-stream")
            .send()
            .await
            .map_err(|e| ChatError::Store(e.to_string()))?;

        if !response.status().is_success() {
            return Err(ChatError::Store(format!("subscribe status {}", response.status())));
        }

        Ok(relay_payload_stream(response.bytes_stream()))
    }
}

/// Splits a byte stream into lines, decoding only complete lines so a
/// multibyte character split across chunks stays intact
#[derive(Debug, Default)]
pub struct RelayLineBuffer {
    pending: Vec<u8>,
}

impl RelayLineBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a chunk and return the payloads of every line it completed
    pub fn push(&mut self, chunk: &[u8]) -> Vec<String> {
        self.pending.extend_from_slice(chunk);
        let mut payloads = Vec::new();
        while let Some(pos) = self.pending.iter().position(|b| *b == b'\n') {
            let line: Vec<u8> = self.pending.drain(..=pos).collect();
            match std::str::from_utf8(&line) {
                Ok(line) => payloads.extend(parse_relay_line(line)),
                Err(e) => tracing::warn!("Skipping relay line that is not UTF-8: {}", e),
            }
        }
        payloads
    }
}

/// Relay payloads from a raw subscribe response body
pub fn relay_payload_stream<S, B, E>(chunks: S) -> RelayStream
where
    S: Stream<Item = std::result::Result<B, E>> + Send + 'static,
    B: AsRef<[u8]> + Send + 'static,
    E: std::fmt::Display + Send + 'static,
{
    let state = (chunks.boxed(), RelayLineBuffer::new(), VecDeque::<String>::new());

    let stream = futures::stream::unfold(state, |(mut chunks, mut lines, mut ready)| async move {
        loop {
            if let Some(payload) = ready.pop_front() {
                return Some((payload, (chunks, lines, ready)));
            }
            match chunks.next().await {
                Some(Ok(chunk)) => ready.extend(lines.push(chunk.as_ref())),
                Some(Err(e)) => {
                    tracing::warn!("Relay subscription stream failed: {}", e);
                    return None;
                }
                None => return None,
            }
        }
    });

    Box::pin(stream)
}

/// Extract the payload from one subscribe-stream line.
///
/// Lines that are not `data: message,<channel>,<payload>` (subscribe
/// confirmations, comments, blank separators) yield `None`.
pub fn parse_relay_line(line: &str) -> Option<String> {
    let data = line.trim().strip_prefix("data:")?.trim_start();
    let rest = data.strip_prefix("message,")?;
    let (_channel, payload) = rest.split_once(',')?;
    Some(payload.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_relay_message_line() {
        let line = r#"data: message,webhook-chat:room,{"id":"1","text":"a,b"}"#;
        assert_eq!(
            parse_relay_line(line).as_deref(),
            Some(r#"{"id":"1","text":"a,b"}"#)
        );
    }

    #[test]
    fn test_parse_relay_ignores_control_lines() {
        assert_eq!(parse_relay_line("data: subscribe,webhook-chat:room,1"), None);
        assert_eq!(parse_relay_line(": keepalive"), None);
        assert_eq!(parse_relay_line(""), None);
        assert_eq!(parse_relay_line("data: message,no-payload"), None);
    }

    #[test]
    fn test_endpoint_encodes_segments() {
        let store = UpstashStore::new("https://example.upstash.io/", "token").unwrap();
        let url = store.endpoint(&["get", "poll-chat:cursor:a b"]).unwrap();
        assert_eq!(
            url.as_str(),
            "https://example.upstash.io/get/poll-chat:cursor:a%20b"
        );
    }

    #[test]
    fn test_reply_error_maps_to_store_error() {
        let reply: Reply = serde_json::from_str(r#"{"error":"WRONGTYPE"}"#).unwrap();
        assert!(reply.into_result().unwrap_err().is_store());

        let reply: Reply = serde_json::from_str(r#"{"result":1}"#).unwrap();
        assert_eq!(reply.into_result().unwrap().as_i64(), Some(1));
    }

    #[test]
    fn test_line_buffer_waits_for_complete_lines() {
        let mut lines = RelayLineBuffer::new();
        assert!(lines.push(b"data: message,c,{\"a\"").is_empty());
        assert_eq!(lines.push(b":1}\n\ndata: subscribe,c,1\n"), vec![r#"{"a":1}"#.to_string()]);
    }

    #[test]
    fn test_rejects_invalid_base_url() {
        assert!(UpstashStore::new("not a url", "t").is_err());
    }
}
