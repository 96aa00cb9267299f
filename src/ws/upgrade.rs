// realtime-hub/src/ws/upgrade.rs

//! The Axum entry point that turns an authenticated HTTP request into a
//! live hub connection.

use crate::ws::service::Hub;
use crate::ws::types::UserId;
use axum::{
    extract::{State, WebSocketUpgrade},
    http::{HeaderValue, header::SET_COOKIE},
    response::{IntoResponse, Response},
};
use std::sync::Arc;
use tracing::{error, instrument};

/// Upgrades the request and hands the socket to the hub.
///
/// Authentication happens before this is called: `user_id` must already be
/// validated (see the `WsAuth` extractor). A fresh session ID is minted for
/// the connection and returned to the client in the session cookie, which
/// later API calls present to prove they have a live feed.
///
/// ## Example Usage
///
/// ```rust,ignore
/// let app = Router::new()
///     .route(
///         "/ws",
///         get(|ws: WebSocketUpgrade, State(hub): State<Arc<Hub>>, WsAuth(user): WsAuth<User>| async move {
///             upgrade_handler(ws, State(hub), user.id).await
///         }),
///     )
///     .with_state(hub);
/// ```
#[instrument(skip_all, fields(user_id = %user_id))]
pub async fn upgrade_handler(
    ws: WebSocketUpgrade,
    State(hub): State<Arc<Hub>>,
    user_id: UserId,
) -> Response {
    let session_id = match hub.generate_id() {
        Ok(id) => id,
        Err(e) => {
            error!("Could not mint a session ID: {}", e);
            return e.into_response();
        }
    };
    let cookie = hub.config().session_cookie_header(session_id);

    let mut response = ws.on_upgrade(move |socket| async move {
        hub.handle_connection(socket, session_id, user_id).await;
    });

    match HeaderValue::from_str(&cookie) {
        Ok(value) => {
            response.headers_mut().append(SET_COOKIE, value);
        }
        Err(e) => error!("Session cookie is not a valid header value: {}", e),
    }
    response
}
