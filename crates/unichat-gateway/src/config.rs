//! Gateway configuration

use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use unichat_core::{IngressSettings, PollSettings, PushSettings, SessionSettings};

use crate::{GatewayError, DEFAULT_HOST, DEFAULT_PORT};

/// Main gateway configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GatewayConfig {
    /// Server host
    pub host: String,

    /// Server port
    pub port: u16,

    /// Allowed CORS origins; empty or `*` allows any
    pub cors_allow_origins: Vec<String>,

    /// Coordination store credentials; the in-memory store is used without them
    pub store: StoreCredentials,

    /// Platform API credentials
    pub platforms: PlatformCredentials,

    pub session: SessionSettings,
    pub poll: PollSettings,
    pub push: PushSettings,
    pub ingress: IngressSettings,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            host: DEFAULT_HOST.to_string(),
            port: DEFAULT_PORT,
            cors_allow_origins: Vec::new(),
            store: StoreCredentials::default(),
            platforms: PlatformCredentials::default(),
            session: SessionSettings::default(),
            poll: PollSettings::default(),
            push: PushSettings::default(),
            ingress: IngressSettings::default(),
        }
    }
}

/// Upstash-style REST store
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreCredentials {
    pub url: Option<String>,
    pub token: Option<String>,
}

impl StoreCredentials {
    /// Both URL and token, when the shared store is configured
    pub fn remote(&self) -> Option<(&str, &str)> {
        match (self.url.as_deref(), self.token.as_deref()) {
            (Some(url), Some(token)) if !url.is_empty() && !token.is_empty() => Some((url, token)),
            _ => None,
        }
    }
}

/// How Kick chat reaches a session
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum KickTransport {
    /// Signed webhooks republished through the store relay
    #[default]
    Webhook,
    /// One Pusher socket per room, straight from the site
    Pusher,
}

impl std::str::FromStr for KickTransport {
    type Err = GatewayError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "webhook" => Ok(Self::Webhook),
            "pusher" | "ws" => Ok(Self::Pusher),
            other => Err(GatewayError::InvalidConfig(format!("unknown Kick transport '{other}'"))),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct PlatformCredentials {
    pub youtube_api_key: Option<String>,
    pub kick_client_id: Option<String>,
    pub kick_client_secret: Option<String>,
    pub kick_transport: KickTransport,
    /// Overrides the public socket key
    pub kick_pusher_key: Option<String>,
    /// Cluster to try first
    pub kick_pusher_cluster: Option<String>,
}

impl PlatformCredentials {
    pub fn youtube_api_key(&self) -> Option<&str> {
        self.youtube_api_key.as_deref().filter(|k| !k.is_empty())
    }

    pub fn kick_client(&self) -> Option<(&str, &str)> {
        match (self.kick_client_id.as_deref(), self.kick_client_secret.as_deref()) {
            (Some(id), Some(secret)) if !id.is_empty() && !secret.is_empty() => Some((id, secret)),
            _ => None,
        }
    }
}

impl GatewayConfig {
    pub const ENV_UPSTASH_URL: &'static str = "UPSTASH_REDIS_REST_URL";
    pub const ENV_UPSTASH_TOKEN: &'static str = "UPSTASH_REDIS_REST_TOKEN";
    pub const ENV_YOUTUBE_API_KEY: &'static str = "YOUTUBE_API_KEY";
    pub const ENV_KICK_CLIENT_ID: &'static str = "KICK_CLIENT_ID";
    pub const ENV_KICK_CLIENT_SECRET: &'static str = "KICK_CLIENT_SECRET";
    pub const ENV_KICK_PUBLIC_KEY_PEM: &'static str = "KICK_PUBLIC_KEY_PEM";
    pub const ENV_CORS_ALLOW_ORIGINS: &'static str = "CORS_ALLOW_ORIGINS";
    pub const ENV_KICK_TRANSPORT: &'static str = "KICK_TRANSPORT";
    pub const ENV_KICK_PUSHER_KEY: &'static str = "KICK_PUSHER_KEY";
    pub const ENV_KICK_PUSHER_CLUSTER: &'static str = "KICK_PUSHER_CLUSTER";

    /// Create a new configuration with defaults
    pub fn new() -> Self {
        Self::default()
    }

    /// Set host
    pub fn with_host(mut self, host: impl Into<String>) -> Self {
        self.host = host.into();
        self
    }

    /// Set port
    pub fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    pub fn with_youtube_api_key(mut self, key: impl Into<String>) -> Self {
        self.platforms.youtube_api_key = Some(key.into());
        self
    }

    pub fn with_public_key_pem(mut self, pem: impl Into<String>) -> Self {
        self.ingress.public_key_pem = Some(pem.into());
        self
    }

    pub fn with_cors_origins(mut self, origins: Vec<String>) -> Self {
        self.cors_allow_origins = origins;
        self
    }

    /// Get socket address
    pub fn socket_addr(&self) -> crate::Result<SocketAddr> {
        format!("{}:{}", self.host, self.port)
            .parse()
            .map_err(|e| GatewayError::InvalidConfig(format!("{}:{}: {}", self.host, self.port, e)))
    }

    /// Whether any origin may call the API
    pub fn cors_allows_any(&self) -> bool {
        self.cors_allow_origins.is_empty() || self.cors_allow_origins.iter().any(|o| o == "*")
    }

    /// Override credentials from the process environment
    pub fn apply_env(self) -> Self {
        self.apply_env_from(|name| std::env::var(name).ok())
    }

    /// Override credentials from any variable lookup; unset or empty values keep the file's
    pub fn apply_env_from(mut self, lookup: impl Fn(&str) -> Option<String>) -> Self {
        let get = |name: &str| lookup(name).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());

        if let Some(url) = get(Self::ENV_UPSTASH_URL) {
            self.store.url = Some(url);
        }
        if let Some(token) = get(Self::ENV_UPSTASH_TOKEN) {
            self.store.token = Some(token);
        }
        if let Some(key) = get(Self::ENV_YOUTUBE_API_KEY) {
            self.platforms.youtube_api_key = Some(key);
        }
        if let Some(id) = get(Self::ENV_KICK_CLIENT_ID) {
            self.platforms.kick_client_id = Some(id);
        }
        if let Some(secret) = get(Self::ENV_KICK_CLIENT_SECRET) {
            self.platforms.kick_client_secret = Some(secret);
        }
        if let Some(pem) = get(Self::ENV_KICK_PUBLIC_KEY_PEM) {
            // Single-line env values carry escaped newlines
            self.ingress.public_key_pem = Some(pem.replace("\\n", "\n"));
        }
        if let Some(transport) = get(Self::ENV_KICK_TRANSPORT) {
            match transport.parse() {
                Ok(transport) => self.platforms.kick_transport = transport,
                Err(e) => tracing::warn!("Ignoring {}: {}", Self::ENV_KICK_TRANSPORT, e),
            }
        }
        if let Some(key) = get(Self::ENV_KICK_PUSHER_KEY) {
            self.platforms.kick_pusher_key = Some(key);
        }
        if let Some(cluster) = get(Self::ENV_KICK_PUSHER_CLUSTER) {
            self.platforms.kick_pusher_cluster = Some(cluster);
        }
        if let Some(origins) = get(Self::ENV_CORS_ALLOW_ORIGINS) {
            self.cors_allow_origins = origins
                .split(',')
                .map(|o| o.trim().to_string())
                .filter(|o| !o.is_empty())
                .collect();
        }
        self
    }

    /// Load configuration from a JSON file
    pub fn from_file(path: &str) -> crate::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Self = serde_json::from_str(&content)?;
        Ok(config)
    }

    /// Save configuration to a file
    pub fn to_file(&self, path: &str) -> crate::Result<()> {
        let content = serde_json::to_string_pretty(self)?;
        std::fs::write(path, content)?;
        Ok(())
    }
}
