// realtime-hub/src/ws/distributed.rs

//! Redis-backed pub/sub for multi-instance deployments.
//!
//! Each connection opens its own Redis Pub/Sub connection at accept time and
//! hands it to a listener task. The listener owns the connection: it applies
//! subscription changes sent through the cloneable [`BrokerLink`] stored on
//! the connection record, and forwards every message into the [`BrokerFeed`]
//! drained by the connection's write loop. Publishing goes through one
//! shared, auto-reconnecting connection, and Redis does the fan-out to
//! whichever instances hold interested sessions.

use crate::error::HubError;
use crate::ws::connection::Connection;
use crate::ws::pubsub::{BrokerSession, PubSubBackend};
use crate::ws::types::{Payload, SessionId, Topic};
use async_trait::async_trait;
use futures_util::StreamExt;
use futures_util::stream::BoxStream;
use redis::aio::{ConnectionManager, PubSub};
use redis::{AsyncCommands, RedisResult};
use std::fmt;
use std::time::Duration;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

/// Subscription changes sent from the router to a connection's listener.
#[derive(Debug)]
pub(crate) enum BrokerCommand {
    Subscribe(Topic, oneshot::Sender<RedisResult<()>>),
    Unsubscribe(Topic, oneshot::Sender<RedisResult<()>>),
}

/// The subscription handle stored on a connection record.
#[derive(Debug, Clone)]
pub struct BrokerLink {
    commands: mpsc::Sender<BrokerCommand>,
    timeout: Duration,
}

impl BrokerLink {
    pub(crate) async fn subscribe(&self, topic: &str) -> Result<(), HubError> {
        let topic = topic.to_string();
        self.request(|reply| BrokerCommand::Subscribe(topic, reply))
            .await
    }

    pub(crate) async fn unsubscribe(&self, topic: &str) -> Result<(), HubError> {
        let topic = topic.to_string();
        self.request(|reply| BrokerCommand::Unsubscribe(topic, reply))
            .await
    }

    async fn request(
        &self,
        command: impl FnOnce(oneshot::Sender<RedisResult<()>>) -> BrokerCommand,
    ) -> Result<(), HubError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        let round_trip = async {
            self.commands
                .send(command(reply_tx))
                .await
                .map_err(|_| HubError::broker("subscription handle is closed"))?;
            reply_rx
                .await
                .map_err(|_| HubError::broker("subscription handle closed before replying"))?
                .map_err(HubError::from)
        };
        timeout(self.timeout, round_trip)
            .await
            .map_err(|_| HubError::broker("timed out changing subscription"))?
    }
}

/// The receiving end of a connection's broker subscription.
pub struct BrokerFeed {
    pub(crate) messages: mpsc::Receiver<Payload>,
    listener: JoinHandle<()>,
}

impl BrokerFeed {
    /// Stops the listener, closing its Pub/Sub connection.
    pub(crate) async fn close(self) {
        self.listener.abort();
        let _ = self.listener.await;
    }
}

impl fmt::Debug for BrokerFeed {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BrokerFeed")
            .field("listener_finished", &self.listener.is_finished())
            .finish_non_exhaustive()
    }
}

/// A dedicated subscription connection, as the listener sees it.
#[async_trait]
pub(crate) trait BrokerConn: Send + 'static {
    async fn subscribe(&mut self, topic: &str) -> RedisResult<()>;

    async fn unsubscribe(&mut self, topic: &str) -> RedisResult<()>;

    /// Payloads of incoming messages. Ends when the connection is lost.
    fn messages(&mut self) -> BoxStream<'_, String>;
}

#[async_trait]
impl BrokerConn for PubSub {
    async fn subscribe(&mut self, topic: &str) -> RedisResult<()> {
        PubSub::subscribe(self, topic).await
    }

    async fn unsubscribe(&mut self, topic: &str) -> RedisResult<()> {
        PubSub::unsubscribe(self, topic).await
    }

    fn messages(&mut self) -> BoxStream<'_, String> {
        self.on_message()
            .filter_map(|msg| async move {
                match msg.get_payload::<String>() {
                    Ok(payload) => Some(payload),
                    Err(e) => {
                        warn!(
                            channel = msg.get_channel_name(),
                            "Unreadable broker payload: {}", e
                        );
                        None
                    }
                }
            })
            .boxed()
    }
}

/// Wires a subscription connection to a new listener task.
pub(crate) fn spawn_listener<C: BrokerConn>(
    conn: C,
    capacity: usize,
    command_timeout: Duration,
    cancel: CancellationToken,
) -> BrokerSession {
    let (commands_tx, commands_rx) = mpsc::channel(16);
    let (messages_tx, messages_rx) = mpsc::channel(capacity);
    let listener = tokio::spawn(run_listener(conn, commands_rx, messages_tx, cancel));
    BrokerSession {
        link: BrokerLink {
            commands: commands_tx,
            timeout: command_timeout,
        },
        feed: BrokerFeed {
            messages: messages_rx,
            listener,
        },
    }
}

/// Owns one subscription connection: applies subscription changes and
/// forwards messages until the connection is cancelled, the feed is dropped
/// or the broker goes away.
async fn run_listener<C: BrokerConn>(
    mut conn: C,
    mut commands: mpsc::Receiver<BrokerCommand>,
    messages_tx: mpsc::Sender<Payload>,
    cancel: CancellationToken,
) {
    loop {
        // The message stream borrows the connection, so it is dropped before
        // a command is applied and rebuilt afterwards.
        let command = {
            let mut messages = conn.messages();
            loop {
                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => return,
                    _ = messages_tx.closed() => return,
                    command = commands.recv() => match command {
                        Some(command) => break command,
                        None => return,
                    },
                    message = messages.next() => match message {
                        Some(payload) => match messages_tx.try_send(Payload::from(payload)) {
                            Ok(()) => {}
                            Err(TrySendError::Full(_)) => {
                                warn!("Broker queue full, dropping slow client");
                                cancel.cancel();
                                return;
                            }
                            Err(TrySendError::Closed(_)) => return,
                        },
                        None => {
                            warn!("Broker subscription stream ended");
                            return;
                        }
                    },
                }
            }
        };
        apply(&mut conn, command).await;
    }
}

async fn apply<C: BrokerConn>(conn: &mut C, command: BrokerCommand) {
    match command {
        BrokerCommand::Subscribe(topic, reply) => {
            debug!(?topic, "Listener subscribing to topic");
            let _ = reply.send(conn.subscribe(&topic).await);
        }
        BrokerCommand::Unsubscribe(topic, reply) => {
            debug!(?topic, "Listener unsubscribing from topic");
            let _ = reply.send(conn.unsubscribe(&topic).await);
        }
    }
}

/// The distributed backend.
#[derive(Clone)]
pub struct RedisBus {
    client: redis::Client,
    publisher: ConnectionManager,
    timeout: Duration,
    queue_capacity: usize,
}

impl RedisBus {
    /// Connects the shared publishing connection.
    ///
    /// `queue_capacity` bounds how many broker messages may wait for one
    /// connection's write loop.
    pub async fn connect(
        redis_url: &str,
        broker_timeout: Duration,
        queue_capacity: usize,
    ) -> Result<Self, HubError> {
        let client = redis::Client::open(redis_url)?;
        let publisher = timeout(broker_timeout, ConnectionManager::new(client.clone()))
            .await
            .map_err(|_| HubError::broker("timed out connecting to Redis"))??;
        info!("Redis publisher connected.");
        Ok(Self {
            client,
            publisher,
            timeout: broker_timeout,
            queue_capacity,
        })
    }
}

impl fmt::Debug for RedisBus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RedisBus")
            .field("timeout", &self.timeout)
            .field("queue_capacity", &self.queue_capacity)
            .finish_non_exhaustive()
    }
}

fn link_for(connection: &Connection) -> Result<&BrokerLink, HubError> {
    connection
        .broker()
        .ok_or_else(|| HubError::broker("connection has no broker subscription"))
}

#[async_trait]
impl PubSubBackend for RedisBus {
    fn name(&self) -> &'static str {
        "redis"
    }

    #[instrument(skip(self, cancel))]
    async fn open(
        &self,
        session_id: SessionId,
        cancel: &CancellationToken,
    ) -> Result<Option<BrokerSession>, HubError> {
        let pubsub = timeout(self.timeout, self.client.get_async_pubsub())
            .await
            .map_err(|_| HubError::broker("timed out opening Redis Pub/Sub connection"))??;
        debug!("Opened broker subscription handle");
        Ok(Some(spawn_listener(
            pubsub,
            self.queue_capacity,
            self.timeout,
            cancel.clone(),
        )))
    }

    async fn subscribe(&self, connection: &Connection, topic: &str) -> Result<(), HubError> {
        link_for(connection)?.subscribe(topic).await
    }

    async fn unsubscribe(&self, connection: &Connection, topic: &str) -> Result<(), HubError> {
        link_for(connection)?.unsubscribe(topic).await
    }

    async fn publish(&self, topic: &str, payload: Payload) -> Result<(), HubError> {
        let mut conn = self.publisher.clone();
        let receivers: usize = conn.publish(topic, payload.as_str()).await?;
        debug!(topic, receivers, "Published event to Redis");
        Ok(())
    }

    async fn release(&self, connection: &Connection, feed: Option<BrokerFeed>) {
        if let Some(feed) = feed {
            // Closing the Pub/Sub connection drops all of its subscriptions on the server.
            feed.close().await;
            debug!(
                session_id = connection.session_id(),
                "Closed broker subscription handle"
            );
        }
    }
}

/// An in-memory subscription connection for tests.
#[cfg(test)]
pub(crate) mod fake {
    use super::*;
    use std::sync::{Arc, Mutex};

    pub(crate) struct FakeConn {
        topics: Arc<Mutex<Vec<String>>>,
        incoming: mpsc::UnboundedReceiver<String>,
    }

    /// The broker side of a [`FakeConn`].
    pub(crate) struct FakeBroker {
        topics: Arc<Mutex<Vec<String>>>,
        pub(crate) incoming: mpsc::UnboundedSender<String>,
    }

    impl FakeBroker {
        pub(crate) fn topics(&self) -> Vec<String> {
            self.topics.lock().unwrap().clone()
        }

        pub(crate) fn push(&self, payload: &str) {
            let _ = self.incoming.send(payload.to_string());
        }
    }

    pub(crate) fn pair() -> (FakeConn, FakeBroker) {
        let topics = Arc::new(Mutex::new(Vec::new()));
        let (tx, rx) = mpsc::unbounded_channel();
        (
            FakeConn {
                topics: Arc::clone(&topics),
                incoming: rx,
            },
            FakeBroker {
                topics,
                incoming: tx,
            },
        )
    }

    #[async_trait]
    impl BrokerConn for FakeConn {
        async fn subscribe(&mut self, topic: &str) -> RedisResult<()> {
            let mut topics = self.topics.lock().unwrap();
            if !topics.iter().any(|t| t == topic) {
                topics.push(topic.to_string());
            }
            Ok(())
        }

        async fn unsubscribe(&mut self, topic: &str) -> RedisResult<()> {
            self.topics.lock().unwrap().retain(|t| t != topic);
            Ok(())
        }

        fn messages(&mut self) -> BoxStream<'_, String> {
            futures_util::stream::poll_fn(move |cx| self.incoming.poll_recv(cx)).boxed()
        }
    }
}
