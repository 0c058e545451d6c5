//! Webhook ingress: authenticate, normalize, republish.
//!
//! Nothing in a request body is parsed before its signature verifies.

use std::sync::Arc;

use crate::platform::kick::{normalize_chat_webhook, CHAT_MESSAGE_SENT};
use crate::store::{SharedStore, StoreKey};
use crate::types::Platform;
use crate::verify::{decode_signature, signed_message, SharedKeySource, SignatureVerifier};
use crate::Result;

/// Authentication headers of one webhook delivery
#[derive(Debug, Clone, Default)]
pub struct WebhookHeaders {
    pub message_id: String,
    pub timestamp: String,
    pub signature: String,
    pub event_type: String,
}

impl WebhookHeaders {
    pub const MESSAGE_ID: &'static str = "Kick-Event-Message-Id";
    pub const TIMESTAMP: &'static str = "Kick-Event-Message-Timestamp";
    pub const SIGNATURE: &'static str = "Kick-Event-Signature";
    pub const EVENT_TYPE: &'static str = "Kick-Event-Type";

    /// Build from any header lookup; missing headers become empty strings
    pub fn from_lookup<'a>(lookup: impl Fn(&str) -> Option<&'a str>) -> Self {
        let get = |name: &str| lookup(name).unwrap_or_default().trim().to_string();
        Self {
            message_id: get(Self::MESSAGE_ID),
            timestamp: get(Self::TIMESTAMP),
            signature: get(Self::SIGNATURE),
            event_type: get(Self::EVENT_TYPE),
        }
    }

    fn is_complete(&self) -> bool {
        !self.message_id.is_empty() && !self.timestamp.is_empty() && !self.signature.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IngressOutcome {
    /// Authentic; `published` tells whether a chat event reached the relay
    Accepted { published: bool },
    Rejected(String),
}

pub const BAD_SIGNATURE: &str = "bad signature";

pub struct WebhookIngress {
    store: SharedStore,
    keys: SharedKeySource,
    verifier: Arc<dyn SignatureVerifier>,
}

impl WebhookIngress {
    pub fn new(store: SharedStore, keys: SharedKeySource, verifier: Arc<dyn SignatureVerifier>) -> Self {
        Self {
            store,
            keys,
            verifier,
        }
    }

    async fn authentic(&self, headers: &WebhookHeaders, raw_body: &[u8]) -> bool {
        if !headers.is_complete() {
            tracing::debug!("Webhook missing authentication headers");
            return false;
        }
        let signature = match decode_signature(&headers.signature) {
            Ok(sig) => sig,
            Err(e) => {
                tracing::debug!("{}", e);
                return false;
            }
        };
        let public_key = match self.keys.public_key().await {
            Ok(pem) => pem,
            Err(e) => {
                tracing::warn!("Cannot verify webhook, public key unavailable: {}", e);
                return false;
            }
        };

        let message = signed_message(&headers.message_id, &headers.timestamp, raw_body);
        if self.verifier.verify(&message, &signature, &public_key) {
            return true;
        }

        // The key may have rotated since it was cached
        match self.keys.refresh().await {
            Ok(Some(fresh)) if fresh != public_key => self.verifier.verify(&message, &signature, &fresh),
            Ok(_) => false,
            Err(e) => {
                tracing::warn!("Webhook public key refresh failed: {}", e);
                false
            }
        }
    }

    /// Handle one delivery. Errors only when a verified chat event could not
    /// be published, so the platform can retry.
    pub async fn receive(&self, headers: &WebhookHeaders, raw_body: &[u8]) -> Result<IngressOutcome> {
        if !self.authentic(headers, raw_body).await {
            tracing::warn!(message_id = %headers.message_id, "Rejected webhook with bad signature");
            return Ok(IngressOutcome::Rejected(BAD_SIGNATURE.to_string()));
        }

        if headers.event_type != CHAT_MESSAGE_SENT {
            tracing::debug!(event_type = %headers.event_type, "Ignoring webhook event type");
            return Ok(IngressOutcome::Accepted { published: false });
        }

        let Some((room, event)) = normalize_chat_webhook(raw_body) else {
            return Ok(IngressOutcome::Accepted { published: false });
        };

        let payload = serde_json::to_string(&event)?;
        self.store
            .publish(&StoreKey::relay(Platform::WebhookChat, &room), &payload)
            .await?;
        tracing::debug!(room = %room, id = %event.id, "Relayed webhook chat message");

        Ok(IngressOutcome::Accepted { published: true })
    }
}
