// realtime-hub/src/ws/mod.rs

//! Everything that runs the live WebSocket side of the chat service.
//!
//! - [`registry`]: session → connection lookup.
//! - [`local`] and [`distributed`]: the two [`pubsub::PubSubBackend`] implementations.
//! - [`router`]: topic naming, subscription moves and event emission.
//! - [`service`]: the [`service::Hub`] and the per-connection lifecycle.
//! - [`upgrade`] and [`session`]: the Axum-facing entry points.

pub mod connection;
pub mod distributed;
pub mod event;
pub mod local;
pub mod pubsub;
pub mod registry;
pub mod router;
pub mod service;
pub mod session;
pub mod types;
pub mod upgrade;
