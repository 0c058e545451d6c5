//! Error types for unichat core
//!
//! Adapters never let these escape their task boundary: they are turned into
//! `info`/`error` frames. They surface directly only from session setup, the
//! coordination store client, and the webhook ingress.

use thiserror::Error;

/// Result type alias for unichat operations
pub type Result<T> = std::result::Result<T, ChatError>;

/// Main error type for unichat operations
#[derive(Error, Debug)]
pub enum ChatError {
    /// None of the submitted sources can be served
    #[error("No usable sources in request")]
    NoUsableSources,

    /// Coordination store unreachable or returned an unexpected reply
    #[error("Coordination store error: {0}")]
    Store(String),

    /// Upstream platform API failure
    #[error("Upstream error: {0}")]
    Upstream(String),

    /// Push connection failure
    #[error("Transport error: {0}")]
    Transport(String),

    /// Webhook authenticity could not be established
    #[error("Signature error: {0}")]
    Signature(String),

    /// Malformed caller input
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Generic error with context
    #[error("{context}: {source}")]
    WithContext {
        context: String,
        source: Box<ChatError>,
    },
}

impl ChatError {
    /// Add context to an error
    pub fn context(self, context: impl Into<String>) -> Self {
        Self::WithContext {
            context: context.into(),
            source: Box::new(self),
        }
    }

    /// Whether the error came from the coordination store, directly or wrapped
    pub fn is_store(&self) -> bool {
        match self {
            ChatError::Store(_) => true,
            ChatError::WithContext { source, .. } => source.is_store(),
            _ => false,
        }
    }
}

impl From<reqwest::Error> for ChatError {
    fn from(e: reqwest::Error) -> Self {
        ChatError::Upstream(e.to_string())
    }
}

impl From<tokio_tungstenite::tungstenite::Error> for ChatError {
    fn from(e: tokio_tungstenite::tungstenite::Error) -> Self {
        ChatError::Transport(e.to_string())
    }
}

/// Extension trait for adding context to Results
pub trait ResultExt<T> {
    /// Add context to a Result
    fn context(self, context: impl Into<String>) -> Result<T>;

    /// Add lazy context to a Result
    fn with_context<F>(self, f: F) -> Result<T>
    where
        F: FnOnce() -> String;
}

impl<T> ResultExt<T> for Result<T> {
    fn context(self, context: impl Into<String>) -> Result<T> {
        self.map_err(|e| e.context(context))
    }

    fn with_context<F>(self, f: F) -> Result<T>
    where
        F: FnOnce() -> String,
    {
        self.map_err(|e| e.context(f()))
    }
}
