//! # Realtime Hub
//!
//! The real-time delivery core of a multi-tenant chat service, built on Axum.
//! Request handlers persist their changes, then tell the hub to deliver the
//! resulting event to every live connection watching the affected topic. The
//! same code runs as one process (in-memory fan-out) or as many (Redis Pub/Sub).
//!
//! ## Core Features
//!
//! - **`Hub`**: Upgrades authenticated requests, runs each connection's read and
//!   write loops with keepalives, and tears everything down exactly once.
//! - **Two interchangeable backends**: `LocalBus` for a single instance,
//!   `RedisBus` for several, picked once from `HubConfig`.
//! - **`SubscriptionRouter`**: Moves a session's channel/server feed and emits
//!   `{EventName}\n{json}` envelopes to `{kind}:{id}` topics.
//! - **`SnowflakeGenerator`**: Coordination-free, time-sortable 64-bit IDs.
//! - **Extractors**: `LiveSession` for routes that need a live feed, and a
//!   generic `WsAuth` token extractor (feature `auth`).
//!
//! ---

pub mod config;
pub mod error;
pub mod snowflake;

// The `ws` module contains the connection registry, pub/sub and lifecycle.
pub mod ws;

// It will only be part of the crate if the "auth" feature is enabled.
#[cfg(feature = "auth")]
pub mod auth;

/// Public prelude for convenience.
///
/// `use realtime_hub::prelude::*;`
pub mod prelude {
    pub use crate::config::{BackendConfig, HubConfig};
    pub use crate::error::HubError;
    pub use crate::snowflake::{Snowflake, SnowflakeGenerator};
    pub use crate::ws::{
        event::{Envelope, EventKind},
        service::Hub,
        session::LiveSession,
        types::{SessionId, TopicKind, UserId},
        upgrade::upgrade_handler,
    };

    #[cfg(feature = "auth")]
    pub use crate::auth::{TokenValidator, WsAuth};
}
