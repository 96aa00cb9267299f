// realtime-hub/src/ws/pubsub.rs

//! The capability interface both pub/sub backends implement.

use crate::error::HubError;
use crate::ws::connection::Connection;
use crate::ws::distributed::{BrokerFeed, BrokerLink};
use crate::ws::types::{Payload, SessionId};
use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

/// Per-connection broker resources opened at accept time.
///
/// The link is stored on the connection record so the router can reach it;
/// the feed is drained by the connection's write loop.
pub struct BrokerSession {
    pub link: BrokerLink,
    pub feed: BrokerFeed,
}

/// Topic-keyed fan-out. One implementation is picked at startup and shared
/// by the router and the connection lifecycle.
#[async_trait]
pub trait PubSubBackend: Send + Sync + 'static {
    /// Short name for logs.
    fn name(&self) -> &'static str;

    /// Opens whatever the backend needs for a new connection.
    ///
    /// The local backend needs nothing and returns `Ok(None)`. Anything the
    /// backend spawns for the connection stops once `cancel` fires.
    async fn open(
        &self,
        session_id: SessionId,
        cancel: &CancellationToken,
    ) -> Result<Option<BrokerSession>, HubError>;

    /// Adds the connection to `topic`. Subscribing twice is a no-op.
    async fn subscribe(&self, connection: &Connection, topic: &str) -> Result<(), HubError>;

    /// Removes the connection from `topic`. Unknown topics are a no-op.
    async fn unsubscribe(&self, connection: &Connection, topic: &str) -> Result<(), HubError>;

    /// Delivers `payload` to every subscriber of `topic`.
    async fn publish(&self, topic: &str, payload: Payload) -> Result<(), HubError>;

    /// Drops every subscription the connection holds. Called once during teardown.
    async fn release(&self, connection: &Connection, feed: Option<BrokerFeed>);
}
