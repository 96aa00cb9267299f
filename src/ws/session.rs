// realtime-hub/src/ws/session.rs

//! Guard for API routes that only make sense with a live real-time feed.

use crate::ws::service::Hub;
use crate::ws::types::{SessionId, UserId};
use axum::{
    extract::{FromRef, FromRequestParts},
    http::{HeaderMap, StatusCode, header::COOKIE, request::Parts},
    response::{IntoResponse, Response},
};
use std::sync::Arc;
use tracing::debug;

/// Extractor that resolves the session cookie to a registered connection.
///
/// Rejects with `401` when the cookie is missing or the session has no live
/// connection, and with `400` when the cookie is not a session ID.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LiveSession {
    pub session_id: SessionId,
    pub user_id: UserId,
}

impl<S> FromRequestParts<S> for LiveSession
where
    Arc<Hub>: FromRef<S>,
    S: Send + Sync,
{
    type Rejection = Response;

    fn from_request_parts(
        parts: &mut Parts,
        state: &S,
    ) -> impl Future<Output = Result<Self, Self::Rejection>> + Send {
        let hub = Arc::<Hub>::from_ref(state);
        let result = resolve(&hub, &parts.headers);
        async move { result }
    }
}

fn resolve(hub: &Hub, headers: &HeaderMap) -> Result<LiveSession, Response> {
    let raw = cookie_value(headers, &hub.config().session_cookie).ok_or_else(|| {
        (StatusCode::UNAUTHORIZED, "No session cookie was provided").into_response()
    })?;

    let session_id: SessionId = raw.parse().map_err(|_| {
        debug!(cookie = raw, "Malformed session cookie");
        (StatusCode::BAD_REQUEST, "Session cookie is in improper format").into_response()
    })?;

    let connection = hub.registry().get(session_id).ok_or_else(|| {
        (StatusCode::UNAUTHORIZED, "You are not connected to websocket").into_response()
    })?;

    Ok(LiveSession {
        session_id,
        user_id: connection.user_id(),
    })
}

/// Finds the value of cookie `name` across all `Cookie` headers.
pub(crate) fn cookie_value<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers
        .get_all(COOKIE)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .flat_map(|value| value.split(';'))
        .filter_map(|pair| pair.trim().split_once('='))
        .find(|(key, _)| *key == name)
        .map(|(_, value)| value.trim())
}
