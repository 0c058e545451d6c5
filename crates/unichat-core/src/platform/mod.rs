//! Production connectors for the supported platforms

pub mod kick;
pub mod twitch;
pub mod youtube;

pub use kick::{normalize_chat_webhook, KickEventsClient, KickPusherConnector, CHAT_MESSAGE_SENT};
pub use twitch::TwitchIrcConnector;
pub use youtube::YouTubeChatPoller;
