// realtime-hub/src/ws/router.rs

//! Topic naming and subscription moves on top of the active backend.

use crate::error::HubError;
use crate::ws::event::{Envelope, EventKind};
use crate::ws::pubsub::PubSubBackend;
use crate::ws::registry::ConnectionRegistry;
use crate::ws::types::{SessionId, TopicKind};
use serde::Serialize;
use std::fmt;
use std::sync::Arc;
use tracing::{debug, instrument};

/// The interface request handlers use to steer live feeds and emit events.
#[derive(Clone)]
pub struct SubscriptionRouter {
    registry: Arc<ConnectionRegistry>,
    backend: Arc<dyn PubSubBackend>,
}

impl SubscriptionRouter {
    pub fn new(registry: Arc<ConnectionRegistry>, backend: Arc<dyn PubSubBackend>) -> Self {
        Self { registry, backend }
    }

    /// Points the session's live feed at resource `id` of `kind`.
    ///
    /// Channel and server topics are moved: the previous one is unsubscribed
    /// first, so a session never accumulates stale topics. Server-list topics
    /// are added alongside the existing ones.
    #[instrument(skip(self))]
    pub async fn subscribe(
        &self,
        id: u64,
        kind: TopicKind,
        session_id: SessionId,
    ) -> Result<(), HubError> {
        let connection = self
            .registry
            .get(session_id)
            .ok_or(HubError::NotConnected(session_id))?;

        // Held across the backend calls so concurrent moves for one session
        // serialize, and so teardown cannot release underneath them.
        let mut interest = connection.lock_interest().await;
        if connection.is_closing() {
            return Err(HubError::NotConnected(session_id));
        }

        if let Some(previous) = interest.current(kind).filter(|previous| *previous != id) {
            let old_topic = kind.topic(previous);
            self.backend.unsubscribe(&connection, &old_topic).await?;
            interest.set(kind, None);
            debug!(topic = %old_topic, "Unsubscribed from previous topic");
        }

        let topic = kind.topic(id);
        self.backend.subscribe(&connection, &topic).await?;
        interest.set(kind, Some(id));
        debug!(%topic, "Subscribed");
        Ok(())
    }

    /// Publishes `payload`, tagged with `event`, to topic `{kind}:{id}`.
    ///
    /// Delivery is best effort: subscribers that are mid-teardown are skipped.
    #[instrument(skip(self, payload))]
    pub async fn emit<T: Serialize + ?Sized + Sync>(
        &self,
        event: EventKind,
        kind: TopicKind,
        payload: &T,
        id: u64,
    ) -> Result<(), HubError> {
        let topic = kind.topic(id);
        let envelope = Envelope::encode(event, payload)?;
        debug!(%topic, "Emitting event");
        self.backend.publish(&topic, envelope).await
    }
}

impl fmt::Debug for SubscriptionRouter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SubscriptionRouter")
            .field("backend", &self.backend.name())
            .field("registry", &self.registry)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ws::connection::Connection;
    use crate::ws::local::LocalBus;
    use crate::ws::types::Payload;
    use serde_json::json;
    use tokio::sync::mpsc;
    use tokio_util::sync::CancellationToken;

    struct Fixture {
        registry: Arc<ConnectionRegistry>,
        bus: Arc<LocalBus>,
        router: SubscriptionRouter,
    }

    fn fixture() -> Fixture {
        let registry = Arc::new(ConnectionRegistry::new());
        let bus = Arc::new(LocalBus::new(Arc::clone(&registry)));
        let router = SubscriptionRouter::new(Arc::clone(&registry), bus.clone());
        Fixture {
            registry,
            bus,
            router,
        }
    }

    fn connect(fixture: &Fixture, session_id: SessionId) -> mpsc::Receiver<Payload> {
        let (tx, rx) = mpsc::channel(16);
        fixture.registry.put(Arc::new(Connection::new(
            session_id,
            1,
            CancellationToken::new(),
            tx,
            None,
        )));
        rx
    }

    #[tokio::test]
    async fn test_subscribe_requires_connection() {
        let fixture = fixture();
        let err = fixture
            .router
            .subscribe(1, TopicKind::Channel, 42)
            .await
            .unwrap_err();
        assert!(matches!(err, HubError::NotConnected(42)));
    }

    #[tokio::test]
    async fn test_subscribe_to_closing_connection_fails() {
        let fixture = fixture();
        let _rx = connect(&fixture, 42);
        fixture.registry.get(42).unwrap().close();

        let err = fixture
            .router
            .subscribe(1, TopicKind::Channel, 42)
            .await
            .unwrap_err();
        assert!(matches!(err, HubError::NotConnected(42)));
        assert_eq!(fixture.bus.topic_count(), 0);
    }

    #[tokio::test]
    async fn test_channel_subscription_moves() {
        let fixture = fixture();
        let _rx = connect(&fixture, 42);

        fixture.router.subscribe(1, TopicKind::Channel, 42).await.unwrap();
        fixture.router.subscribe(2, TopicKind::Channel, 42).await.unwrap();

        assert_eq!(fixture.bus.subscribers("channel:2"), vec![42]);
        assert!(!fixture.bus.contains_topic("channel:1"));
        let interest = fixture.registry.get(42).unwrap().interest().await;
        assert_eq!(interest.channel, Some(2));
    }

    #[tokio::test]
    async fn test_server_and_channel_are_independent() {
        let fixture = fixture();
        let _rx = connect(&fixture, 42);

        fixture.router.subscribe(10, TopicKind::Server, 42).await.unwrap();
        fixture.router.subscribe(1, TopicKind::Channel, 42).await.unwrap();
        fixture.router.subscribe(11, TopicKind::Server, 42).await.unwrap();

        assert!(fixture.bus.contains_topic("channel:1"));
        assert!(fixture.bus.contains_topic("server:11"));
        assert!(!fixture.bus.contains_topic("server:10"));
    }

    #[tokio::test]
    async fn test_resubscribing_same_channel_is_idempotent() {
        let fixture = fixture();
        let mut rx = connect(&fixture, 42);

        fixture.router.subscribe(1, TopicKind::Channel, 42).await.unwrap();
        fixture.router.subscribe(1, TopicKind::Channel, 42).await.unwrap();
        fixture
            .router
            .emit(EventKind::MessageCreated, TopicKind::Channel, &json!({"id": 9}), 1)
            .await
            .unwrap();

        assert!(rx.recv().await.is_some());
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_server_list_topics_accumulate() {
        let fixture = fixture();
        let mut rx = connect(&fixture, 42);

        fixture.router.subscribe(100, TopicKind::ServerList, 42).await.unwrap();
        fixture.router.subscribe(200, TopicKind::ServerList, 42).await.unwrap();

        fixture
            .router
            .emit(EventKind::ServerDeleted, TopicKind::ServerList, &100u64, 100)
            .await
            .unwrap();

        let frame = rx.recv().await.unwrap();
        assert_eq!(
            Envelope::decode(frame.as_str()),
            Some((EventKind::ServerDeleted, "100"))
        );
        assert!(rx.try_recv().is_err());
        assert_eq!(fixture.bus.subscribers("server_list:200"), vec![42]);
        assert_eq!(fixture.bus.subscribers("server_list:100"), vec![42]);
    }

    #[tokio::test]
    async fn test_emit_without_subscribers() {
        let fixture = fixture();
        fixture
            .router
            .emit(EventKind::ChannelCreated, TopicKind::Server, &json!({}), 77)
            .await
            .unwrap();
        assert_eq!(fixture.bus.topic_count(), 0);
    }

    #[tokio::test]
    async fn test_emit_only_reaches_topic_subscribers() {
        let fixture = fixture();
        let mut in_channel = connect(&fixture, 1);
        let mut elsewhere = connect(&fixture, 2);
        fixture.router.subscribe(5, TopicKind::Channel, 1).await.unwrap();
        fixture.router.subscribe(6, TopicKind::Channel, 2).await.unwrap();

        fixture
            .router
            .emit(EventKind::MessageDeleted, TopicKind::Channel, &123u64, 5)
            .await
            .unwrap();

        assert_eq!(in_channel.recv().await.unwrap().as_str(), "MessageDeleted\n123");
        assert!(elsewhere.try_recv().is_err());
    }
}
