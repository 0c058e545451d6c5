//! Gateway error types

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use thiserror::Error;
use unichat_core::ChatError;

/// Gateway-specific errors
#[derive(Error, Debug)]
pub enum GatewayError {
    #[error(transparent)]
    Core(#[from] ChatError),

    #[error("{0}")]
    BadRequest(String),

    #[error("{0}")]
    Unauthorized(String),

    /// The request depends on work that has not run yet
    #[error("{0}")]
    NotReady(String),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl From<serde_json::Error> for GatewayError {
    fn from(e: serde_json::Error) -> Self {
        GatewayError::Serialization(e.to_string())
    }
}

impl GatewayError {
    pub fn status_code(&self) -> StatusCode {
        match self {
            GatewayError::BadRequest(_) => StatusCode::BAD_REQUEST,
            GatewayError::Unauthorized(_) => StatusCode::UNAUTHORIZED,
            GatewayError::NotReady(_) => StatusCode::from_u16(425).unwrap_or(StatusCode::SERVICE_UNAVAILABLE),
            GatewayError::Core(core) => core_status(core),
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

fn core_status(error: &ChatError) -> StatusCode {
    match error {
        ChatError::NoUsableSources | ChatError::InvalidInput(_) => StatusCode::BAD_REQUEST,
        ChatError::Signature(_) => StatusCode::UNAUTHORIZED,
        ChatError::Store(_) => StatusCode::SERVICE_UNAVAILABLE,
        ChatError::Upstream(_) | ChatError::Transport(_) => StatusCode::BAD_GATEWAY,
        ChatError::WithContext { source, .. } => core_status(source),
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

impl IntoResponse for GatewayError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        if status.is_server_error() {
            tracing::error!("Request failed: {}", self);
        } else {
            tracing::debug!("Request rejected ({}): {}", status, self);
        }
        (status, self.to_string()).into_response()
    }
}

/// Result type for gateway operations
pub type Result<T> = std::result::Result<T, GatewayError>;
