//! Viewer-submitted URLs to source descriptors

use base64::engine::general_purpose::{STANDARD, URL_SAFE};
use base64::Engine;
use unichat_core::{Platform, SourceDescriptor};
use url::Url;

use crate::{GatewayError, Result};

const TWITCH_HOSTS: &[&str] = &["www.twitch.tv", "twitch.tv", "m.twitch.tv"];
const YOUTUBE_HOSTS: &[&str] = &["www.youtube.com", "youtube.com", "youtu.be", "m.youtube.com"];
const KICK_HOSTS: &[&str] = &["kick.com", "www.kick.com"];

/// Maps one submitted URL to a descriptor. Never fails: anything it cannot
/// serve comes back as an unsupported descriptor with a note.
pub trait SourceParser: Send + Sync {
    fn parse(&self, url: &str) -> SourceDescriptor;
}

/// Host-based parser for the supported platforms
#[derive(Debug, Clone, Default)]
pub struct UrlSourceParser;

impl UrlSourceParser {
    pub fn new() -> Self {
        Self
    }
}

fn first_segment(url: &Url) -> Option<String> {
    url.path_segments()?
        .find(|s| !s.is_empty())
        .map(str::to_string)
}

impl SourceParser for UrlSourceParser {
    fn parse(&self, raw: &str) -> SourceDescriptor {
        let Ok(url) = Url::parse(raw.trim()) else {
            return SourceDescriptor::unsupported(raw, "Invalid URL.");
        };
        let host = url.host_str().unwrap_or_default().to_ascii_lowercase();

        if TWITCH_HOSTS.contains(&host.as_str()) {
            return match first_segment(&url) {
                Some(channel) => SourceDescriptor::new(Platform::PushChat, channel, raw),
                None => SourceDescriptor::new(Platform::PushChat, "", raw)
                    .with_note("Could not identify the Twitch channel."),
            };
        }

        if YOUTUBE_HOSTS.contains(&host.as_str()) {
            let video = url
                .query_pairs()
                .find(|(k, _)| k == "v")
                .map(|(_, v)| v.to_string())
                .filter(|v| !v.is_empty())
                .or_else(|| (host == "youtu.be").then(|| first_segment(&url)).flatten());
            return match video {
                Some(id) => SourceDescriptor::new(Platform::PollChat, id, raw),
                None => SourceDescriptor::new(Platform::PollChat, "", raw)
                    .with_note("Provide the live video URL (with ?v=...), not the channel page."),
            };
        }

        if KICK_HOSTS.contains(&host.as_str()) {
            return match first_segment(&url) {
                Some(channel) => SourceDescriptor::new(Platform::WebhookChat, channel, raw),
                None => SourceDescriptor::new(Platform::WebhookChat, "", raw)
                    .with_note("Could not identify the Kick channel."),
            };
        }

        if host.contains("tiktok.com") || host.contains("instagram.com") {
            return SourceDescriptor::unsupported(raw, "Not supported yet.");
        }
        SourceDescriptor::unsupported(raw, "Unrecognized platform.")
    }
}

/// Decode a base64 JSON array of strings, as carried in query parameters.
///
/// Query decoding turns `+` into a space, so spaces are read back as `+`.
pub fn decode_url_list(raw: &str) -> Result<Vec<String>> {
    let raw = raw.trim().replace(' ', "+");
    let bytes = STANDARD
        .decode(&raw)
        .or_else(|_| URL_SAFE.decode(&raw))
        .map_err(|_| GatewayError::BadRequest("Bad sources encoding".to_string()))?;
    let urls: Vec<String> = serde_json::from_slice(&bytes)
        .map_err(|_| GatewayError::BadRequest("Bad sources encoding".to_string()))?;
    Ok(urls.into_iter().filter(|u| !u.trim().is_empty()).collect())
}
