// realtime-hub/src/ws/local.rs

//! In-process pub/sub for single-instance deployments.

use crate::error::HubError;
use crate::ws::connection::Connection;
use crate::ws::distributed::BrokerFeed;
use crate::ws::pubsub::{BrokerSession, PubSubBackend};
use crate::ws::registry::ConnectionRegistry;
use crate::ws::types::{Payload, SessionId, Topic};
use async_trait::async_trait;
use dashmap::DashMap;
use std::fmt;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Maps each topic to the sessions subscribed to it and pushes published
/// payloads straight onto their local-delivery queues.
///
/// A topic only exists while it has at least one subscriber.
pub struct LocalBus {
    topics: DashMap<Topic, Vec<SessionId>>,
    registry: Arc<ConnectionRegistry>,
}

impl LocalBus {
    pub fn new(registry: Arc<ConnectionRegistry>) -> Self {
        Self {
            topics: DashMap::new(),
            registry,
        }
    }

    /// Adds `session_id` to `topic` unless it is already there.
    pub fn subscribe_session(&self, topic: &str, session_id: SessionId) {
        let mut subscribers = self.topics.entry(topic.to_string()).or_default();
        if !subscribers.contains(&session_id) {
            subscribers.push(session_id);
        }
    }

    /// Removes `session_id` from `topic`, dropping the topic once it is empty.
    pub fn unsubscribe_session(&self, topic: &str, session_id: SessionId) {
        if let Some(mut subscribers) = self.topics.get_mut(topic) {
            if let Some(pos) = subscribers.iter().position(|id| *id == session_id) {
                // Subscriber order carries no meaning.
                subscribers.swap_remove(pos);
            }
        }
        self.topics.remove_if(topic, |_, subscribers| subscribers.is_empty());
    }

    /// Removes `session_id` from every topic.
    pub fn unsubscribe_all(&self, session_id: SessionId) {
        self.topics.retain(|_, subscribers| {
            if let Some(pos) = subscribers.iter().position(|id| *id == session_id) {
                subscribers.swap_remove(pos);
            }
            !subscribers.is_empty()
        });
    }

    /// Queues `payload` for every subscriber of `topic`, returning how many accepted it.
    ///
    /// Subscribers that are missing from the registry or already shutting
    /// down are skipped.
    pub fn publish_local(&self, topic: &str, payload: &Payload) -> usize {
        let session_ids = match self.topics.get(topic) {
            Some(entry) => entry.value().clone(),
            None => return 0,
        };

        let mut delivered = 0;
        for session_id in session_ids {
            match self.registry.get(session_id) {
                Some(connection) => {
                    if connection.deliver(payload.clone()) {
                        delivered += 1;
                    }
                }
                None => {
                    warn!(session_id, topic, "Subscribed session is not in the registry");
                }
            }
        }
        delivered
    }

    /// The sessions currently subscribed to `topic`.
    pub fn subscribers(&self, topic: &str) -> Vec<SessionId> {
        self.topics
            .get(topic)
            .map(|entry| entry.value().clone())
            .unwrap_or_default()
    }

    pub fn contains_topic(&self, topic: &str) -> bool {
        self.topics.contains_key(topic)
    }

    pub fn topic_count(&self) -> usize {
        self.topics.len()
    }
}

impl fmt::Debug for LocalBus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LocalBus")
            .field("topics_count", &self.topics.len())
            .finish()
    }
}

#[async_trait]
impl PubSubBackend for LocalBus {
    fn name(&self) -> &'static str {
        "local"
    }

    async fn open(
        &self,
        _session_id: SessionId,
        _cancel: &CancellationToken,
    ) -> Result<Option<BrokerSession>, HubError> {
        Ok(None)
    }

    async fn subscribe(&self, connection: &Connection, topic: &str) -> Result<(), HubError> {
        self.subscribe_session(topic, connection.session_id());
        Ok(())
    }

    async fn unsubscribe(&self, connection: &Connection, topic: &str) -> Result<(), HubError> {
        self.unsubscribe_session(topic, connection.session_id());
        Ok(())
    }

    async fn publish(&self, topic: &str, payload: Payload) -> Result<(), HubError> {
        let delivered = self.publish_local(topic, &payload);
        debug!(topic, delivered, "Published to local subscribers");
        Ok(())
    }

    async fn release(&self, connection: &Connection, _feed: Option<BrokerFeed>) {
        self.unsubscribe_all(connection.session_id());
    }
}
