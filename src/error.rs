//! Error types for the hub, its transports, and the HTTP API.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use thiserror::Error;
use tracing::error;

use crate::models::ApiResponse;

/// Publishing failed because the dispatch loop is gone.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum PublishError {
    #[error("event queue closed")]
    QueueClosed,
}

/// A single delivery to a single subscriber failed.
#[derive(Debug, Error)]
pub enum DeliveryError {
    /// Subscriber was closed before or during the write
    #[error("subscriber closed")]
    Closed,

    #[error("serialization error: {0}")]
    Serialize(#[from] serde_json::Error),

    /// Underlying connection reported an error
    #[error("transport error: {0}")]
    Transport(String),

    #[error("write timed out after {0:?}")]
    Timeout(std::time::Duration),
}

impl DeliveryError {
    pub fn transport(msg: impl Into<String>) -> Self {
        Self::Transport(msg.into())
    }
}

/// The real-time handshake was rejected; no subscriber exists.
#[derive(Debug, Error)]
#[error("transport upgrade failed: {0}")]
pub struct TransportUpgradeError(pub String);

/// Errors returned by request handlers.
#[derive(Debug, Error)]
pub enum ApiError {
    #[error("{message}")]
    BadRequest {
        message: String,
        details: Option<String>,
    },

    #[error("{0}")]
    NotFound(String),

    #[error("Unsupported media type")]
    UnsupportedMediaType,

    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

impl ApiError {
    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::BadRequest {
            message: message.into(),
            details: None,
        }
    }

    pub fn status(&self) -> StatusCode {
        match self {
            Self::BadRequest { .. } => StatusCode::BAD_REQUEST,
            Self::NotFound(_) => StatusCode::NOT_FOUND,
            Self::UnsupportedMediaType => StatusCode::UNSUPPORTED_MEDIA_TYPE,
            Self::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        let body = match self {
            Self::BadRequest { message, details } => ApiResponse::failure(&message, details),
            Self::Internal(e) => {
                error!("Internal error: {:#}", e);
                ApiResponse::failure("Internal server error", None)
            }
            other => ApiResponse::failure(&other.to_string(), None),
        };
        (status, Json(body)).into_response()
    }
}
