//! A minimal chat backend wired to the hub.
//!
//! ```text
//! cargo run --example chat_hub
//! websocat -H 'Authorization: Bearer 1001' ws://127.0.0.1:3000/ws
//! ```
//!
//! Set `HUB_CONFIG` to a JSON config file, or `REDIS_URL` to run the
//! distributed backend.

use axum::{
    Json, Router,
    extract::{Path, State, WebSocketUpgrade},
    response::Response,
    routing::{delete, get},
};
use realtime_hub::prelude::*;
use serde::{Deserialize, Serialize};
use std::{fmt, net::SocketAddr, sync::Arc};
use tracing::info;

// 1. Users and token validation

#[derive(Debug)]
struct AuthError(String);

impl fmt::Display for AuthError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::error::Error for AuthError {}

#[derive(Debug, Clone)]
struct User {
    id: u64,
}

#[derive(Clone)]
struct AppState {
    hub: Arc<Hub>,
}

impl axum::extract::FromRef<AppState> for Arc<Hub> {
    fn from_ref(state: &AppState) -> Self {
        Arc::clone(&state.hub)
    }
}

#[async_trait::async_trait]
impl TokenValidator for AppState {
    type User = User;
    type Error = AuthError;

    // Stand-in for JWT verification: the token is the numeric user ID.
    async fn validate_token(&self, token: &str) -> Result<Self::User, Self::Error> {
        token
            .parse()
            .map(|id| User { id })
            .map_err(|_| AuthError(format!("invalid token: {}", token)))
    }
}

// 2. Payloads

#[derive(Debug, Deserialize)]
struct NewMessage {
    content: String,
}

#[derive(Debug, Clone, Serialize)]
struct ChatMessage {
    id: u64,
    channel_id: u64,
    user_id: u64,
    content: String,
}

// 3. Handlers

async fn connect(
    ws: WebSocketUpgrade,
    State(hub): State<Arc<Hub>>,
    WsAuth(user): WsAuth<User>,
) -> Response {
    upgrade_handler(ws, State(hub), user.id).await
}

/// Opening a channel moves the caller's live feed onto it.
async fn open_channel(
    State(hub): State<Arc<Hub>>,
    session: LiveSession,
    Path(channel_id): Path<u64>,
) -> Result<Json<Vec<ChatMessage>>, HubError> {
    hub.subscribe(channel_id, TopicKind::Channel, session.session_id)
        .await?;
    // A real handler returns the stored history here.
    Ok(Json(Vec::new()))
}

async fn post_message(
    State(hub): State<Arc<Hub>>,
    session: LiveSession,
    Path(channel_id): Path<u64>,
    Json(body): Json<NewMessage>,
) -> Result<Json<ChatMessage>, HubError> {
    let message = ChatMessage {
        id: hub.generate_id()?,
        channel_id,
        user_id: session.user_id,
        content: body.content,
    };
    // Persist first, then emit.
    hub.emit(EventKind::MessageCreated, TopicKind::Channel, &message, channel_id)
        .await?;
    Ok(Json(message))
}

async fn list_servers(
    State(hub): State<Arc<Hub>>,
    session: LiveSession,
) -> Result<Json<Vec<u64>>, HubError> {
    // Pretend every user belongs to these servers.
    let servers = vec![100, 200];
    for server_id in &servers {
        hub.subscribe(*server_id, TopicKind::ServerList, session.session_id)
            .await?;
    }
    Ok(Json(servers))
}

async fn delete_server(
    State(hub): State<Arc<Hub>>,
    _session: LiveSession,
    Path(server_id): Path<u64>,
) -> Result<(), HubError> {
    hub.emit(EventKind::ServerDeleted, TopicKind::ServerList, &server_id, server_id)
        .await
}

// 4. Startup

fn load_config() -> Result<HubConfig, Box<dyn std::error::Error>> {
    let mut config = match std::env::var("HUB_CONFIG") {
        Ok(path) => HubConfig::from_json_file(path)?,
        Err(_) => HubConfig {
            secure_cookie: false,
            ..HubConfig::default()
        },
    };
    if let Ok(url) = std::env::var("REDIS_URL") {
        info!("REDIS_URL found, using the distributed backend");
        config.backend = BackendConfig::Redis { url };
    }
    Ok(config)
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    dotenv::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("chat_hub=info".parse()?)
                .add_directive("realtime_hub=debug".parse()?),
        )
        .init();

    let hub = Hub::from_config(load_config()?).await?;
    let state = AppState {
        hub: Arc::clone(&hub),
    };

    let app = Router::new()
        .route("/ws", get(connect))
        .route(
            "/channels/{channel_id}/messages",
            get(open_channel).post(post_message),
        )
        .route("/servers", get(list_servers))
        .route("/servers/{server_id}", delete(delete_server))
        .route("/health", get(|| async { "OK" }))
        .with_state(state);

    let addr = SocketAddr::from(([127, 0, 0, 1], 3000));
    info!("Listening on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            let _ = tokio::signal::ctrl_c().await;
            hub.shutdown();
        })
        .await?;
    Ok(())
}
