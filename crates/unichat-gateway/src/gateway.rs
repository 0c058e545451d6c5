//! Main Gateway implementation
//!
//! HTTP surface over the aggregation engine: one event stream per viewer, the
//! poll trigger, and the webhook receiver.

use axum::{
    body::{Body, Bytes},
    extract::{Query, State},
    http::{header, HeaderMap, HeaderValue, Method, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use futures::StreamExt;
use serde::Deserialize;
use futures::Stream;
use std::collections::HashSet;
use std::convert::Infallible;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tower_http::cors::{AllowOrigin, Any, CorsLayer};
use tower_http::trace::TraceLayer;

use unichat_core::adapter::relay::relay_room;
use unichat_core::adapter::{PollAdapter, PollCoordinator, PushAdapter, RelayAdapter};
use unichat_core::platform::{KickEventsClient, KickPusherConnector, TwitchIrcConnector, YouTubeChatPoller};
use unichat_core::verify::{SharedKeySource, StaticKey, TrustAnchorKey};
use unichat_core::{
    AdapterRegistry, ChatEvent, Diagnostic, Frame, IngressOutcome, MemoryStore, Platform, RsaSha256Verifier,
    SessionOrchestrator, SharedStore, StoreKey, UpstashStore, WebhookHeaders, WebhookIngress,
};

use crate::config::{GatewayConfig, KickTransport};
use crate::sources::{decode_url_list, SourceParser, UrlSourceParser};
use crate::{GatewayError, Result};

/// Gateway state shared across handlers
#[derive(Clone)]
pub struct GatewayState {
    pub config: GatewayConfig,
    pub store: SharedStore,
    pub orchestrator: SessionOrchestrator,
    pub parser: Arc<dyn SourceParser>,
    pub ingress: Arc<WebhookIngress>,
    /// Present only when a YouTube API key is configured
    pub poll: Option<PollCoordinator>,
    pub store_kind: &'static str,
    pub shutdown: CancellationToken,
}

impl GatewayState {
    /// Wire the production adapters, store and key source from `config`
    pub fn new(config: GatewayConfig) -> Result<Self> {
        let (store, store_kind): (SharedStore, &'static str) = match config.store.remote() {
            Some((url, token)) => (Arc::new(UpstashStore::new(url, token)?), "upstash"),
            None => {
                tracing::warn!("No shared store configured, poll locks and webhook relay are local to this instance");
                (Arc::new(MemoryStore::new()), "memory")
            }
        };

        let keys: SharedKeySource = match config.ingress.public_key_pem.as_deref() {
            Some(pem) => Arc::new(StaticKey(pem.to_string())),
            None => Arc::new(TrustAnchorKey::new(
                config.ingress.public_key_url.clone(),
                config.ingress.public_key_ttl(),
            )),
        };

        let mut registry = AdapterRegistry::new().register(Arc::new(PushAdapter::new(
            Arc::new(TwitchIrcConnector::new()),
            config.push.clone(),
        )));

        match config.platforms.kick_transport {
            KickTransport::Webhook => {
                let mut relay = RelayAdapter::new(store.clone());
                match config.platforms.kick_client() {
                    Some((id, secret)) => relay = relay.with_subscriber(Arc::new(KickEventsClient::new(id, secret))),
                    None => tracing::info!("Kick client credentials not set, relying on existing webhook subscriptions"),
                }
                registry = registry.register(Arc::new(relay));
            }
            KickTransport::Pusher => {
                let mut connector = KickPusherConnector::new();
                if let Some(key) = config.platforms.kick_pusher_key.as_deref() {
                    connector = connector.with_key(key);
                }
                if let Some(cluster) = config.platforms.kick_pusher_cluster.as_deref() {
                    connector = connector.with_cluster(cluster);
                }
                tracing::info!("Reading Kick chat from the site socket");
                let adapter = PushAdapter::new(Arc::new(connector), config.push.clone()).for_platform(Platform::WebhookChat);
                registry = registry.register(Arc::new(adapter));
            }
        }

        let poll = config.platforms.youtube_api_key().map(|key| {
            PollCoordinator::new(
                Arc::new(YouTubeChatPoller::new(key)),
                store.clone(),
                config.poll.clone(),
            )
        });
        match &poll {
            Some(coordinator) => registry = registry.register(Arc::new(PollAdapter::new(coordinator.clone()))),
            None => tracing::warn!("YOUTUBE_API_KEY not set, YouTube sources will be reported unsupported"),
        }

        let orchestrator = SessionOrchestrator::new(registry, config.session.clone());
        let ingress = WebhookIngress::new(store.clone(), keys, Arc::new(RsaSha256Verifier));

        Ok(Self::from_parts(config, store, orchestrator, ingress, poll).with_store_kind(store_kind))
    }

    /// Assemble state from already-built parts
    pub fn from_parts(
        config: GatewayConfig,
        store: SharedStore,
        orchestrator: SessionOrchestrator,
        ingress: WebhookIngress,
        poll: Option<PollCoordinator>,
    ) -> Self {
        Self {
            config,
            store,
            orchestrator,
            parser: Arc::new(UrlSourceParser::new()),
            ingress: Arc::new(ingress),
            poll,
            store_kind: "custom",
            shutdown: CancellationToken::new(),
        }
    }

    pub fn with_parser(mut self, parser: Arc<dyn SourceParser>) -> Self {
        self.parser = parser;
        self
    }

    fn with_store_kind(mut self, kind: &'static str) -> Self {
        self.store_kind = kind;
        self
    }
}

#[derive(Debug, Deserialize)]
struct AggregateQuery {
    sources: Option<String>,
}

#[derive(Debug, Deserialize)]
struct PollStartQuery {
    videos: Option<String>,
}

#[derive(Debug, Deserialize)]
struct KickStreamQuery {
    slugs: Option<String>,
}

#[derive(Debug, Deserialize)]
struct YouTubeStreamQuery {
    videos: Option<String>,
}

#[derive(Debug, Deserialize)]
struct PollStartBody {
    #[serde(default)]
    videos: Vec<String>,
}

/// Main Gateway
pub struct Gateway {
    state: Arc<GatewayState>,
}

impl Gateway {
    /// Create a new gateway with configuration
    pub fn new(config: GatewayConfig) -> Result<Self> {
        Ok(Self::from_state(GatewayState::new(config)?))
    }

    pub fn from_state(state: GatewayState) -> Self {
        Self {
            state: Arc::new(state),
        }
    }

    /// Get gateway state
    pub fn state(&self) -> Arc<GatewayState> {
        self.state.clone()
    }

    /// Build the Axum router
    pub fn build_router(&self) -> Router {
        Router::new()
            .route("/api/aggregate", get(Self::handle_aggregate))
            .route("/api/poll/start", post(Self::handle_poll_start))
            .route("/api/webhooks/kick", post(Self::handle_kick_webhook))
            .route("/api/kick/stream", get(Self::handle_kick_stream))
            .route("/api/youtube/stream", get(Self::handle_youtube_stream))
            .route("/health", get(Self::handle_health))
            .route("/status", get(Self::handle_status))
            .layer(self.cors_layer())
            .layer(TraceLayer::new_for_http())
            .with_state(self.state.clone())
    }

    fn cors_layer(&self) -> CorsLayer {
        let config = &self.state.config;
        let layer = CorsLayer::new()
            .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
            .allow_headers(Any);
        if config.cors_allows_any() {
            return layer.allow_origin(Any);
        }

        let origins: Vec<HeaderValue> = config
            .cors_allow_origins
            .iter()
            .filter_map(|o| match HeaderValue::from_str(o) {
                Ok(value) => Some(value),
                Err(_) => {
                    tracing::warn!("Ignoring invalid CORS origin: {}", o);
                    None
                }
            })
            .collect();
        layer.allow_origin(AllowOrigin::list(origins))
    }

    /// Start the gateway server
    pub async fn start(&self) -> Result<()> {
        let addr = self.state.config.socket_addr()?;
        let router = self.build_router();

        tracing::info!("unichat gateway starting on {}", addr);

        let listener = tokio::net::TcpListener::bind(addr).await?;
        let shutdown = self.state.shutdown.clone();

        axum::serve(listener, router)
            .with_graceful_shutdown(async move { shutdown.cancelled().await })
            .await
            .map_err(|e| GatewayError::Internal(e.to_string()))?;

        tracing::info!("Gateway stopped");
        Ok(())
    }

    /// Shutdown the gateway; open streams and poll cycles end with it
    pub fn shutdown(&self) {
        self.state.shutdown.cancel();
        tracing::info!("Gateway shutdown initiated");
    }

    // HTTP handlers

    async fn handle_aggregate(
        State(state): State<Arc<GatewayState>>,
        Query(query): Query<AggregateQuery>,
    ) -> Result<Response> {
        let raw = query
            .sources
            .filter(|s| !s.trim().is_empty())
            .ok_or_else(|| GatewayError::BadRequest("Missing sources".to_string()))?;
        let urls = decode_url_list(&raw)?;
        let sources = urls.iter().map(|url| state.parser.parse(url)).collect();

        let session = state.orchestrator.open(sources)?;
        tracing::debug!("Streaming session {} for {} urls", session.id(), urls.len());

        let frames = session
            .take_until(state.shutdown.clone().cancelled_owned())
            .filter_map(|frame| async move {
                match frame.encode() {
                    Ok(text) => Some(Ok::<_, Infallible>(text)),
                    Err(e) => {
                        tracing::warn!("Dropping unencodable {} frame: {}", frame.kind().as_str(), e);
                        None
                    }
                }
            });

        event_stream(frames)
    }

    async fn handle_poll_start(
        State(state): State<Arc<GatewayState>>,
        Query(query): Query<PollStartQuery>,
        body: Bytes,
    ) -> Result<Response> {
        let Some(coordinator) = state.poll.as_ref() else {
            let body = serde_json::json!({"ok": false, "error": "YOUTUBE_API_KEY missing"});
            return Ok((StatusCode::BAD_REQUEST, Json(body)).into_response());
        };

        let mut videos = match serde_json::from_slice::<PollStartBody>(&body) {
            Ok(parsed) => parsed.videos,
            Err(_) => match query.videos.as_deref() {
                Some(raw) => decode_url_list(raw)?,
                None => Vec::new(),
            },
        };
        let mut seen = HashSet::new();
        videos.retain(|v| !v.trim().is_empty() && seen.insert(v.clone()));

        let started = coordinator.trigger(&videos, &state.shutdown).await;
        let body = serde_json::json!({"ok": true, "started": started});
        Ok(Json(body).into_response())
    }

    async fn handle_kick_webhook(
        State(state): State<Arc<GatewayState>>,
        headers: HeaderMap,
        body: Bytes,
    ) -> Result<&'static str> {
        let webhook = WebhookHeaders::from_lookup(|name| headers.get(name).and_then(|v| v.to_str().ok()));

        match state.ingress.receive(&webhook, &body).await? {
            IngressOutcome::Accepted { .. } => Ok("ok"),
            IngressOutcome::Rejected(reason) => Err(GatewayError::Unauthorized(reason)),
        }
    }

    /// Relay channels of the named Kick rooms, without a session
    async fn handle_kick_stream(
        State(state): State<Arc<GatewayState>>,
        Query(query): Query<KickStreamQuery>,
    ) -> Result<Response> {
        let slugs = decode_id_list(query.slugs, "slugs")?;
        let rooms: Vec<String> = slugs.iter().map(|s| relay_room(s)).collect();
        relay_stream(&state, Platform::WebhookChat, rooms).await
    }

    /// Relay channels of YouTube rooms a poll trigger has already resolved
    async fn handle_youtube_stream(
        State(state): State<Arc<GatewayState>>,
        Query(query): Query<YouTubeStreamQuery>,
    ) -> Result<Response> {
        let videos = decode_id_list(query.videos, "videos")?;

        let mut rooms = Vec::with_capacity(videos.len());
        for video in &videos {
            if let Some(room) = state.store.get(&StoreKey::resolved(Platform::PollChat, video)).await? {
                rooms.push(room);
            }
        }
        if rooms.is_empty() {
            return Err(GatewayError::NotReady("rooms not resolved yet, run /api/poll/start first".to_string()));
        }
        relay_stream(&state, Platform::PollChat, rooms).await
    }

    async fn handle_health() -> impl IntoResponse {
        Json(serde_json::json!({
            "status": "healthy",
            "version": crate::VERSION
        }))
    }

    async fn handle_status(State(state): State<Arc<GatewayState>>) -> impl IntoResponse {
        let platforms: Vec<&str> = state
            .orchestrator
            .registry()
            .platforms()
            .iter()
            .map(|p| p.label())
            .collect();

        Json(serde_json::json!({
            "version": crate::VERSION,
            "sessions": state.orchestrator.manager().session_count(),
            "platforms": platforms,
            "store": state.store_kind,
            "poll_trigger": state.poll.is_some(),
            "kick_transport": state.config.platforms.kick_transport,
        }))
    }
}

fn event_stream<S>(frames: S) -> Result<Response>
where
    S: Stream<Item = std::result::Result<String, Infallible>> + Send + 'static,
{
    Response::builder()
        .header(header::CONTENT_TYPE, "text/event-stream")
        .header(header::CACHE_CONTROL, "no-cache, no-transform")
        .header("X-Accel-Buffering", "no")
        .body(Body::from_stream(frames))
        .map_err(|e| GatewayError::Internal(e.to_string()))
}

/// Non-empty, de-duplicated ids from a base64 JSON list parameter
fn decode_id_list(raw: Option<String>, name: &str) -> Result<Vec<String>> {
    let raw = raw
        .filter(|r| !r.trim().is_empty())
        .ok_or_else(|| GatewayError::BadRequest(format!("missing {name}")))?;
    let mut seen = HashSet::new();
    let ids: Vec<String> = decode_url_list(&raw)?
        .into_iter()
        .map(|id| id.trim().to_string())
        .filter(|id| seen.insert(id.clone()))
        .collect();
    if ids.is_empty() {
        return Err(GatewayError::BadRequest(format!("no {name}")));
    }
    Ok(ids)
}

/// `info` once subscribed, then one `chat` frame per relayed event
async fn relay_stream(state: &GatewayState, platform: Platform, rooms: Vec<String>) -> Result<Response> {
    let mut channels = Vec::with_capacity(rooms.len());
    for room in &rooms {
        channels.push(state.store.subscribe(&StoreKey::relay(platform, room)).await?);
    }
    tracing::debug!(platform = %platform, "Streaming relay for {} rooms", rooms.len());

    let mut diag = Diagnostic::default().state("subscribed").message(rooms.join(","));
    diag.platform = Some(platform);
    let opening = Frame::Info(diag).encode()?;

    let chats = futures::stream::select_all(channels).filter_map(|payload| async move {
        match serde_json::from_str::<ChatEvent>(&payload) {
            Ok(event) => Frame::Chat(event).encode().ok(),
            Err(e) => {
                tracing::warn!("Skipping malformed relay payload: {}", e);
                None
            }
        }
    });

    let frames = futures::stream::once(async move { opening })
        .chain(chats)
        .take_until(state.shutdown.clone().cancelled_owned())
        .map(Ok::<_, Infallible>);
    event_stream(frames)
}
