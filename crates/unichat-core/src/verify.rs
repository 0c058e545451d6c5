//! Webhook signature verification
//!
//! The platform signs `{messageId}.{timestamp}.{rawBody}` with RSA-SHA256
//! (PKCS#1 v1.5) and publishes its public key at a trust-anchor endpoint.
//! Verification always runs over the exact received bytes, before any
//! parsing.

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use parking_lot::RwLock;
use rsa::pkcs1::DecodeRsaPublicKey;
use rsa::pkcs1v15::{Signature, VerifyingKey};
use rsa::pkcs8::DecodePublicKey;
use rsa::signature::Verifier;
use rsa::RsaPublicKey;
use serde::Deserialize;
use sha2::Sha256;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

use crate::{ChatError, Result};

/// `verify(message, signature, publicKey) → bool`
pub trait SignatureVerifier: Send + Sync {
    fn verify(&self, message: &[u8], signature: &[u8], public_key_pem: &str) -> bool;
}

/// RSA PKCS#1 v1.5 over SHA-256
#[derive(Debug, Clone, Copy, Default)]
pub struct RsaSha256Verifier;

impl RsaSha256Verifier {
    fn parse_key(pem: &str) -> Option<RsaPublicKey> {
        let pem = pem.trim();
        RsaPublicKey::from_public_key_pem(pem)
            .or_else(|_| RsaPublicKey::from_pkcs1_pem(pem))
            .ok()
    }
}

impl SignatureVerifier for RsaSha256Verifier {
    fn verify(&self, message: &[u8], signature: &[u8], public_key_pem: &str) -> bool {
        let Some(key) = Self::parse_key(public_key_pem) else {
            tracing::warn!("Webhook public key is not a valid RSA PEM");
            return false;
        };
        let Ok(signature) = Signature::try_from(signature) else {
            return false;
        };
        VerifyingKey::<Sha256>::new(key)
            .verify(message, &signature)
            .is_ok()
    }
}

/// Bytes covered by the webhook signature
pub fn signed_message(message_id: &str, timestamp: &str, raw_body: &[u8]) -> Vec<u8> {
    let mut message = Vec::with_capacity(message_id.len() + timestamp.len() + raw_body.len() + 2);
    message.extend_from_slice(message_id.as_bytes());
    message.push(b'.');
    message.extend_from_slice(timestamp.as_bytes());
    message.push(b'.');
    message.extend_from_slice(raw_body);
    message
}

/// Decode the base64 signature header
pub fn decode_signature(header: &str) -> Result<Vec<u8>> {
    BASE64
        .decode(header.trim())
        .map_err(|e| ChatError::Signature(format!("signature is not base64: {e}")))
}

/// Where the verifying public key comes from
#[async_trait]
pub trait PublicKeySource: Send + Sync {
    async fn public_key(&self) -> Result<String>;

    /// Called after a signature failed against the current key. Returns a
    /// replacement key when one could be fetched now.
    async fn refresh(&self) -> Result<Option<String>> {
        Ok(None)
    }
}

pub type SharedKeySource = Arc<dyn PublicKeySource>;

/// A fixed PEM, configured up front
#[derive(Debug, Clone)]
pub struct StaticKey(pub String);

#[async_trait]
impl PublicKeySource for StaticKey {
    async fn public_key(&self) -> Result<String> {
        Ok(self.0.clone())
    }
}

#[derive(Deserialize)]
struct PublicKeyResponse {
    data: PublicKeyData,
}

#[derive(Deserialize)]
struct PublicKeyData {
    public_key: String,
}

/// Fetches the key from the trust-anchor endpoint and reuses it for `ttl`.
///
/// A failed verification may force one early refetch, at most once per
/// `min_refresh`.
pub struct TrustAnchorKey {
    client: reqwest::Client,
    url: String,
    ttl: Duration,
    min_refresh: Duration,
    cached: RwLock<Option<(String, Instant)>>,
}

impl TrustAnchorKey {
    pub const DEFAULT_MIN_REFRESH: Duration = Duration::from_secs(60);

    pub fn new(url: impl Into<String>, ttl: Duration) -> Self {
        Self {
            client: reqwest::Client::new(),
            url: url.into(),
            ttl,
            min_refresh: Self::DEFAULT_MIN_REFRESH,
            cached: RwLock::new(None),
        }
    }

    pub fn with_min_refresh(mut self, min_refresh: Duration) -> Self {
        self.min_refresh = min_refresh;
        self
    }

    fn cached(&self) -> Option<String> {
        let cached = self.cached.read();
        match cached.as_ref() {
            Some((pem, fetched_at)) if fetched_at.elapsed() < self.ttl => Some(pem.clone()),
            _ => None,
        }
    }

    /// Claims the refresh slot, yielding the key about to be replaced;
    /// `None` while the last fetch is too recent
    fn claim_refresh(&self) -> Option<Option<String>> {
        let mut cached = self.cached.write();
        match cached.as_mut() {
            Some((_, fetched_at)) if fetched_at.elapsed() < self.min_refresh => None,
            Some((pem, fetched_at)) => {
                *fetched_at = Instant::now();
                Some(Some(pem.clone()))
            }
            None => Some(None),
        }
    }

    async fn fetch(&self) -> Result<String> {
        let response = self
            .client
            .get(&self.url)
            .timeout(Duration::from_secs(10))
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(ChatError::Upstream(format!(
                "public key endpoint returned {}",
                response.status()
            )));
        }

        let body: PublicKeyResponse = response.json().await?;
        let pem = body.data.public_key;
        *self.cached.write() = Some((pem.clone(), Instant::now()));
        tracing::debug!("Refreshed webhook public key from {}", self.url);
        Ok(pem)
    }
}

#[async_trait]
impl PublicKeySource for TrustAnchorKey {
    async fn public_key(&self) -> Result<String> {
        if let Some(pem) = self.cached() {
            return Ok(pem);
        }
        self.fetch().await
    }

    async fn refresh(&self) -> Result<Option<String>> {
        let Some(previous) = self.claim_refresh() else {
            tracing::debug!("Webhook public key fetched recently, not refreshing");
            return Ok(None);
        };

        let pem = self.fetch().await?;
        if previous.as_deref() == Some(pem.as_str()) {
            return Ok(None);
        }
        tracing::info!("Webhook public key rotated");
        Ok(Some(pem))
    }
}
