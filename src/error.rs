// realtime-hub/src/error.rs

//! The error type shared by the hub's public operations.

use crate::config::ConfigError;
use crate::snowflake::SnowflakeError;
use crate::ws::types::SessionId;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use thiserror::Error;
use tracing::error;

/// Errors surfaced to the request handlers that call into the hub.
///
/// Connection-level I/O failures never show up here: they only end the
/// affected connection's lifecycle.
#[derive(Debug, Error)]
pub enum HubError {
    /// A router operation named a session that has no live connection.
    #[error("session {0} is not connected to the hub")]
    NotConnected(SessionId),

    /// The distributed backend could not reach the message broker.
    #[error("message broker unavailable: {reason}")]
    BrokerUnavailable {
        reason: String,
        #[source]
        source: Option<redis::RedisError>,
    },

    /// An event payload could not be serialized.
    #[error("failed to serialize event payload: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Minting an identifier failed.
    #[error(transparent)]
    IdGeneration(#[from] SnowflakeError),

    /// The hub configuration is invalid.
    #[error(transparent)]
    Config(#[from] ConfigError),
}

impl HubError {
    pub(crate) fn broker(reason: impl Into<String>) -> Self {
        HubError::BrokerUnavailable {
            reason: reason.into(),
            source: None,
        }
    }

    /// The HTTP status a handler should answer with.
    pub fn status_code(&self) -> StatusCode {
        match self {
            HubError::NotConnected(_) => StatusCode::UNAUTHORIZED,
            HubError::BrokerUnavailable { .. } => StatusCode::SERVICE_UNAVAILABLE,
            HubError::Serialization(_) | HubError::IdGeneration(_) | HubError::Config(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }
}

impl From<redis::RedisError> for HubError {
    fn from(value: redis::RedisError) -> Self {
        HubError::BrokerUnavailable {
            reason: value.to_string(),
            source: Some(value),
        }
    }
}

impl IntoResponse for HubError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        if status.is_server_error() {
            error!("Hub operation failed: {}", self);
        }
        let body = match &self {
            HubError::NotConnected(_) => "You are not connected to websocket".to_string(),
            HubError::BrokerUnavailable { .. } => "Real-time delivery is unavailable".to_string(),
            _ => String::new(),
        };
        (status, body).into_response()
    }
}
