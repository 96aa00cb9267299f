//! Token authentication for the WebSocket upgrade request.
//!
//! The hub does not know how users log in. The application implements
//! [`TokenValidator`] on its state, and [`WsAuth`] pulls the token from the
//! request and asks the validator for the user.
//!
//! ## Example
//!
//! ```rust,no_run
//! # use async_trait::async_trait;
//! # use axum::{Router, extract::{State, WebSocketUpgrade}, response::Response, routing::get};
//! # use realtime_hub::prelude::*;
//! # use std::sync::Arc;
//! #
//! #[derive(Debug, Clone)]
//! struct User {
//!     id: u64,
//! }
//!
//! #[derive(Clone)]
//! struct AppState {
//!     hub: Arc<Hub>,
//! }
//!
//! impl axum::extract::FromRef<AppState> for Arc<Hub> {
//!     fn from_ref(state: &AppState) -> Self {
//!         state.hub.clone()
//!     }
//! }
//!
//! #[async_trait]
//! impl TokenValidator for AppState {
//!     type User = User;
//!     type Error = std::io::Error;
//!
//!     async fn validate_token(&self, token: &str) -> Result<Self::User, Self::Error> {
//!         // Decode and verify a JWT here.
//!         token
//!             .parse()
//!             .map(|id| User { id })
//!             .map_err(|_| std::io::Error::new(std::io::ErrorKind::InvalidData, "bad token"))
//!     }
//! }
//!
//! async fn connect(
//!     ws: WebSocketUpgrade,
//!     State(hub): State<Arc<Hub>>,
//!     WsAuth(user): WsAuth<User>,
//! ) -> Response {
//!     upgrade_handler(ws, State(hub), user.id).await
//! }
//!
//! #[tokio::main]
//! async fn main() {
//!     let hub = Hub::local(HubConfig::default()).unwrap();
//!     let app: Router = Router::new()
//!         .route("/ws", get(connect))
//!         .with_state(AppState { hub });
//!     // ...
//! }
//! ```

use crate::ws::session::cookie_value;
use async_trait::async_trait;
use axum::{
    extract::{FromRequestParts, Query},
    http::{HeaderMap, StatusCode, header::AUTHORIZATION, request::Parts},
    response::{IntoResponse, Response},
};
use serde::Deserialize;
use tracing::debug;

/// Name of the cookie carrying the login token.
pub const TOKEN_COOKIE: &str = "JWT";

/// The public trait the application's state must implement to enable `WsAuth`.
#[async_trait]
pub trait TokenValidator {
    /// The user type returned on successful validation.
    type User: Send + Sync + 'static;
    /// The error type returned on validation failure.
    type Error: std::error::Error + Send + Sync + 'static;

    /// Validates a token string and returns the user it belongs to.
    async fn validate_token(&self, token: &str) -> Result<Self::User, Self::Error>;
}

/// The authentication extractor.
///
/// The token is read from the `Authorization: Bearer` header, then the `JWT`
/// cookie, then a `?token=` query parameter. A missing or invalid token is
/// rejected with `401 Unauthorized`.
#[derive(Debug)]
pub struct WsAuth<U>(pub U)
where
    U: Send + Sync + 'static;

#[derive(Deserialize)]
struct TokenQuery {
    token: String,
}

impl<S, U> FromRequestParts<S> for WsAuth<U>
where
    S: TokenValidator<User = U> + Send + Sync + 'static,
    U: Send + Sync + 'static,
{
    type Rejection = Response;

    fn from_request_parts(
        parts: &mut Parts,
        state: &S,
    ) -> impl Future<Output = Result<Self, <Self as FromRequestParts<S>>::Rejection>> + Send {
        Box::pin(async move {
            let token = match token_from_headers(&parts.headers) {
                Some(t) => Some(t),
                None => match Query::<TokenQuery>::from_request_parts(parts, state).await {
                    Ok(Query(q)) => Some(q.token),
                    Err(_) => None,
                },
            };

            let Some(token) = token else {
                return Err(StatusCode::UNAUTHORIZED.into_response());
            };

            match state.validate_token(&token).await {
                Ok(user) => Ok(WsAuth(user)),
                Err(e) => {
                    debug!("Token rejected: {}", e);
                    Err(StatusCode::UNAUTHORIZED.into_response())
                }
            }
        })
    }
}

fn token_from_headers(headers: &HeaderMap) -> Option<String> {
    headers
        .get(AUTHORIZATION)
        .and_then(|header| header.to_str().ok())
        .and_then(|value| value.strip_prefix("Bearer "))
        .or_else(|| cookie_value(headers, TOKEN_COOKIE))
        .map(str::to_owned)
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::{Router, body::Body, http::Request, routing::get};
    use tower::ServiceExt;

    #[derive(Clone)]
    struct FixedTokens;

    #[derive(Debug)]
    struct BadToken;

    impl std::fmt::Display for BadToken {
        fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
            f.write_str("bad token")
        }
    }

    impl std::error::Error for BadToken {}

    #[async_trait]
    impl TokenValidator for FixedTokens {
        type User = u64;
        type Error = BadToken;

        async fn validate_token(&self, token: &str) -> Result<u64, BadToken> {
            match token {
                "good" => Ok(7),
                _ => Err(BadToken),
            }
        }
    }

    fn app() -> Router {
        Router::new()
            .route(
                "/ws",
                get(|WsAuth(user): WsAuth<u64>| async move { user.to_string() }),
            )
            .with_state(FixedTokens)
    }

    async fn status_for(request: Request<Body>) -> StatusCode {
        app().oneshot(request).await.unwrap().status()
    }

    #[tokio::test]
    async fn test_bearer_header() {
        let request = Request::builder()
            .uri("/ws")
            .header("authorization", "Bearer good")
            .body(Body::empty())
            .unwrap();
        assert_eq!(status_for(request).await, StatusCode::OK);
    }

    #[tokio::test]
    async fn test_token_cookie() {
        let request = Request::builder()
            .uri("/ws")
            .header("cookie", "JWT=good")
            .body(Body::empty())
            .unwrap();
        assert_eq!(status_for(request).await, StatusCode::OK);
    }

    #[tokio::test]
    async fn test_query_parameter() {
        let request = Request::builder()
            .uri("/ws?token=good")
            .body(Body::empty())
            .unwrap();
        assert_eq!(status_for(request).await, StatusCode::OK);
    }

    #[tokio::test]
    async fn test_missing_or_invalid_token() {
        let missing = Request::builder().uri("/ws").body(Body::empty()).unwrap();
        assert_eq!(status_for(missing).await, StatusCode::UNAUTHORIZED);

        let invalid = Request::builder()
            .uri("/ws?token=forged")
            .body(Body::empty())
            .unwrap();
        assert_eq!(status_for(invalid).await, StatusCode::UNAUTHORIZED);
    }
}
