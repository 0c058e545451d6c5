//! YouTube live chat via the Data API v3

use async_trait::async_trait;
use chrono::DateTime;
use serde::Deserialize;
use std::time::Duration;
use uuid::Uuid;

use crate::adapter::poll::{ChatPoller, PollPage};
use crate::types::{now_ms, ChatEvent, Platform};
use crate::{ChatError, Result};

pub const YOUTUBE_API_BASE: &str = "https://www.googleapis.com/youtube/v3";

#[derive(Debug, Deserialize)]
struct VideosResponse {
    #[serde(default)]
    items: Vec<VideoItem>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct VideoItem {
    live_streaming_details: Option<LiveStreamingDetails>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct LiveStreamingDetails {
    active_live_chat_id: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct MessagesResponse {
    #[serde(default)]
    items: Vec<MessageItem>,
    next_page_token: Option<String>,
    polling_interval_millis: Option<u64>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct MessageItem {
    id: Option<String>,
    snippet: Option<Snippet>,
    author_details: Option<AuthorDetails>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
struct Snippet {
    display_message: Option<String>,
    published_at: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
struct AuthorDetails {
    display_name: Option<String>,
    channel_id: Option<String>,
}

/// Total mapping from a live chat item to a chat event
pub fn normalize_message(item: MessageItem) -> ChatEvent {
    let snippet = item.snippet.unwrap_or_default();
    let author = item.author_details.unwrap_or_default();

    let at = snippet
        .published_at
        .as_deref()
        .and_then(|ts| DateTime::parse_from_rfc3339(ts).ok())
        .map(|ts| ts.timestamp_millis())
        .unwrap_or_else(now_ms);

    ChatEvent {
        id: item.id.unwrap_or_else(|| Uuid::new_v4().to_string()),
        platform: Platform::PollChat,
        channel: author.channel_id.unwrap_or_else(|| "youtube".to_string()),
        username: author.display_name.unwrap_or_else(|| "yt-user".to_string()),
        text: snippet.display_message.unwrap_or_default(),
        at,
    }
}

/// Poller for YouTube live chat
#[derive(Clone)]
pub struct YouTubeChatPoller {
    client: reqwest::Client,
    api_key: String,
    base_url: String,
}

impl YouTubeChatPoller {
    pub fn new(api_key: impl Into<String>) -> Self {
        Self::with_base_url(api_key, YOUTUBE_API_BASE)
    }

    pub fn with_base_url(api_key: impl Into<String>, base_url: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            api_key: api_key.into(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
        }
    }

    async fn get_json<T: serde::de::DeserializeOwned>(
        &self,
        path: &str,
        query: &[(&str, &str)],
    ) -> Result<T> {
        let response = self
            .client
            .get(format!("{}/{}", self.base_url, path))
            .query(&[("key", self.api_key.as_str())])
            .query(query)
            .timeout(Duration::from_secs(10))
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            return Err(ChatError::Upstream(format!("YouTube {path} returned {status}")));
        }
        Ok(response.json().await?)
    }
}

#[async_trait]
impl ChatPoller for YouTubeChatPoller {
    async fn resolve_room(&self, raw_id: &str) -> Result<Option<String>> {
        let videos: VideosResponse = self
            .get_json("videos", &[("part", "liveStreamingDetails"), ("id", raw_id)])
            .await?;

        Ok(videos
            .items
            .into_iter()
            .next()
            .and_then(|v| v.live_streaming_details)
            .and_then(|d| d.active_live_chat_id))
    }

    async fn fetch_page(&self, room: &str, cursor: Option<&str>) -> Result<PollPage> {
        let mut query = vec![("liveChatId", room), ("part", "snippet,authorDetails")];
        if let Some(cursor) = cursor {
            query.push(("pageToken", cursor));
        }

        let page: MessagesResponse = self.get_json("liveChat/messages", &query).await?;
        Ok(PollPage {
            messages: page.items.into_iter().map(normalize_message).collect(),
            next_cursor: page.next_page_token,
            interval_ms: page.polling_interval_millis,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_full_item() {
        let item: MessageItem = serde_json::from_str(
            r#"{
                "id": "LCC.abc",
                "snippet": {"displayMessage": "hi chat", "publishedAt": "2024-05-01T12:00:00.500Z"},
                "authorDetails": {"displayName": "Viewer", "channelId": "UC123"}
            }"#,
        )
        .unwrap();

        let event = normalize_message(item);
        assert_eq!(event.id, "LCC.abc");
        assert_eq!(event.username, "Viewer");
        assert_eq!(event.channel, "UC123");
        assert_eq!(event.text, "hi chat");
        assert_eq!(event.at, 1_714_564_800_500);
    }

    #[test]
    fn test_normalize_sparse_item() {
        let item: MessageItem = serde_json::from_str(r#"{"snippet": {}}"#).unwrap();
        let event = normalize_message(item);

        assert_eq!(event.username, "yt-user");
        assert_eq!(event.channel, "youtube");
        assert!(event.text.is_empty());
        assert!(!event.id.is_empty());
    }

    #[test]
    fn test_page_response_shape() {
        let page: MessagesResponse = serde_json::from_str(
            r#"{"items": [], "nextPageToken": "T2", "pollingIntervalMillis": 2500}"#,
        )
        .unwrap();
        assert_eq!(page.next_page_token.as_deref(), Some("T2"));
        assert_eq!(page.polling_interval_millis, Some(2500));
    }

    #[test]
    fn test_video_without_live_details() {
        let videos: VideosResponse = serde_json::from_str(r#"{"items": [{"id": "v"}]}"#).unwrap();
        assert!(videos.items[0].live_streaming_details.is_none());
    }
}
