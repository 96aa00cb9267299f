// realtime-hub/src/ws/service.rs

//! The `Hub`: owns the registry, the chosen backend and the ID generator, and
//! runs the lifecycle of every real-time connection.

use crate::config::{BackendConfig, HubConfig};
use crate::error::HubError;
use crate::snowflake::SnowflakeGenerator;
use crate::ws::{
    connection::Connection,
    distributed::{BrokerFeed, RedisBus},
    event::EventKind,
    local::LocalBus,
    pubsub::{BrokerSession, PubSubBackend},
    registry::ConnectionRegistry,
    router::SubscriptionRouter,
    types::{Payload, SessionId, TopicKind, UserId},
};
use axum::body::Bytes;
use axum::extract::ws::{Message, Utf8Bytes, close_code};
use futures_util::{Sink, SinkExt, Stream, StreamExt};
use serde::Serialize;
use std::fmt::{self, Display};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::{Instant, Interval, MissedTickBehavior, interval_at, timeout};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, trace, warn};

/// The real-time delivery hub.
///
/// Construct it once at startup, share it as `Arc<Hub>` in the Axum state,
/// and hand every upgraded socket to [`Hub::handle_connection`].
pub struct Hub {
    registry: Arc<ConnectionRegistry>,
    backend: Arc<dyn PubSubBackend>,
    router: SubscriptionRouter,
    ids: Arc<SnowflakeGenerator>,
    config: HubConfig,
    shutdown: CancellationToken,
}

impl Hub {
    /// Builds a hub from configuration, connecting to Redis when the
    /// distributed backend is selected.
    pub async fn from_config(config: HubConfig) -> Result<Arc<Self>, HubError> {
        config.validate()?;
        let ids = Arc::new(SnowflakeGenerator::with_worker(config.snowflake_worker_id)?);
        let registry = Arc::new(ConnectionRegistry::new());

        let backend: Arc<dyn PubSubBackend> = match &config.backend {
            BackendConfig::Local => Arc::new(LocalBus::new(Arc::clone(&registry))),
            BackendConfig::Redis { url } => {
                Arc::new(
                    RedisBus::connect(url, config.broker_timeout, config.local_queue_capacity)
                        .await?,
                )
            }
        };

        Ok(Self::new(config, ids, registry, backend))
    }

    /// Builds a single-instance hub without touching the network.
    pub fn local(config: HubConfig) -> Result<Arc<Self>, HubError> {
        config.validate()?;
        let ids = Arc::new(SnowflakeGenerator::with_worker(config.snowflake_worker_id)?);
        let registry = Arc::new(ConnectionRegistry::new());
        let backend = Arc::new(LocalBus::new(Arc::clone(&registry)));
        Ok(Self::new(config, ids, registry, backend))
    }

    /// Assembles a hub from already-built parts.
    pub fn new(
        config: HubConfig,
        ids: Arc<SnowflakeGenerator>,
        registry: Arc<ConnectionRegistry>,
        backend: Arc<dyn PubSubBackend>,
    ) -> Arc<Self> {
        info!(backend = backend.name(), "Starting real-time hub");
        let router = SubscriptionRouter::new(Arc::clone(&registry), Arc::clone(&backend));
        Arc::new(Self {
            registry,
            backend,
            router,
            ids,
            config,
            shutdown: CancellationToken::new(),
        })
    }

    pub fn config(&self) -> &HubConfig {
        &self.config
    }

    pub fn registry(&self) -> &Arc<ConnectionRegistry> {
        &self.registry
    }

    pub fn router(&self) -> &SubscriptionRouter {
        &self.router
    }

    pub fn ids(&self) -> &Arc<SnowflakeGenerator> {
        &self.ids
    }

    /// Mints a new entity or session ID.
    pub fn generate_id(&self) -> Result<u64, HubError> {
        Ok(self.ids.generate()?)
    }

    /// Whether `session_id` currently has a live connection.
    pub fn is_connected(&self, session_id: SessionId) -> bool {
        self.registry.contains(session_id)
    }

    /// See [`SubscriptionRouter::subscribe`].
    pub async fn subscribe(
        &self,
        id: u64,
        kind: TopicKind,
        session_id: SessionId,
    ) -> Result<(), HubError> {
        self.router.subscribe(id, kind, session_id).await
    }

    /// See [`SubscriptionRouter::emit`].
    pub async fn emit<T: Serialize + ?Sized + Sync>(
        &self,
        event: EventKind,
        kind: TopicKind,
        payload: &T,
        id: u64,
    ) -> Result<(), HubError> {
        self.router.emit(event, kind, payload, id).await
    }

    /// Asks one connection to shut down. Returns `false` if it is not registered.
    pub fn disconnect(&self, session_id: SessionId) -> bool {
        match self.registry.get(session_id) {
            Some(connection) => {
                connection.close();
                true
            }
            None => false,
        }
    }

    /// Tears down every connection, current and future.
    pub fn shutdown(&self) {
        info!("Shutting down real-time hub");
        self.shutdown.cancel();
        self.registry.close_all();
    }

    /// Runs one connection from accept to teardown.
    ///
    /// `socket` is normally an Axum `WebSocket`; anything that is both a
    /// stream of frames and a sink of frames works.
    #[instrument(skip_all, fields(session_id, user_id))]
    pub async fn handle_connection<S, E>(
        self: Arc<Self>,
        socket: S,
        session_id: SessionId,
        user_id: UserId,
    ) where
        S: Stream<Item = Result<Message, E>> + Sink<Message> + Send + 'static,
        <S as Sink<Message>>::Error: Display,
        E: Display + Send + 'static,
    {
        let span = tracing::Span::current();
        span.record("session_id", session_id);
        span.record("user_id", user_id);

        // Connecting
        let (local_tx, local_rx) = mpsc::channel(self.config.local_queue_capacity);
        let cancel = self.shutdown.child_token();

        let (link, feed) = match self.backend.open(session_id, &cancel).await {
            Ok(Some(BrokerSession { link, feed })) => (Some(link), Some(feed)),
            Ok(None) => (None, None),
            Err(e) => {
                warn!(
                    "Broker subscription unavailable, serving local delivery only: {}",
                    e
                );
                (None, None)
            }
        };

        let connection = Arc::new(Connection::new(
            session_id,
            user_id,
            cancel.clone(),
            local_tx,
            link,
        ));
        let (sink, stream) = socket.split();

        // Active
        self.registry.put(Arc::clone(&connection));
        connection.mark_active();
        info!("Client connected.");

        let inbound = tokio::spawn(run_inbound(stream, cancel.clone(), self.config.pong_wait));

        let mut outbound = Outbound {
            sink,
            local_rx,
            feed,
            keepalive: keepalive_timer(self.config.ping_interval),
        };
        self.run_outbound(&connection, &mut outbound).await;

        // Closing
        cancel.cancel();
        if let Err(e) = inbound.await {
            error!("Read task failed: {}", e);
        }
        self.teardown(&connection, outbound).await;
    }

    /// Writes broker messages, locally routed payloads and keepalive pings
    /// until the connection is cancelled or a write fails.
    async fn run_outbound<K>(&self, connection: &Connection, out: &mut Outbound<K>)
    where
        K: Sink<Message> + Unpin,
        K::Error: Display,
    {
        let cancel = connection.cancel_token().clone();
        let write_wait = self.config.write_wait;

        loop {
            let next = tokio::select! {
                _ = cancel.cancelled() => Outgoing::Stop,
                message = next_broker_message(out.feed.as_mut()) => match message {
                    Some(payload) => Outgoing::Frame(Message::Text(payload)),
                    None => Outgoing::BrokerClosed,
                },
                payload = out.local_rx.recv() => match payload {
                    Some(payload) => Outgoing::Frame(Message::Text(payload)),
                    None => Outgoing::Stop,
                },
                _ = out.keepalive.tick() => Outgoing::Frame(Message::Ping(Bytes::new())),
            };

            match next {
                Outgoing::Frame(frame) => {
                    if !write_frame(&mut out.sink, frame, write_wait).await {
                        return;
                    }
                }
                Outgoing::BrokerClosed => {
                    warn!("Broker subscription closed, cross-instance delivery suspended");
                    if let Some(feed) = out.feed.take() {
                        feed.close().await;
                    }
                }
                Outgoing::Stop => return,
            }
        }
    }

    /// Releases everything the connection holds. Runs once per connection.
    async fn teardown<K>(&self, connection: &Connection, out: Outbound<K>)
    where
        K: Sink<Message> + Unpin,
        K::Error: Display,
    {
        if !connection.begin_closing() {
            return;
        }
        let Outbound {
            mut sink,
            mut local_rx,
            feed,
            keepalive,
        } = out;

        drop(keepalive);
        {
            // Serializes with the router: a subscribe that already holds the
            // lock finishes before release, any later one sees Closing.
            let _interest = connection.lock_interest().await;
            self.backend.release(connection, feed).await;
        }
        local_rx.close();

        let close = Message::Close(Some(axum::extract::ws::CloseFrame {
            code: close_code::AWAY,
            reason: Utf8Bytes::from_static("closing"),
        }));
        let _ = timeout(self.config.write_wait, sink.send(close)).await;
        match timeout(self.config.write_wait, sink.close()).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => debug!("Error closing socket: {}", e),
            Err(_) => debug!("Timed out closing socket"),
        }

        self.registry.remove(connection.session_id());
        connection.mark_closed();
        info!("Client disconnected.");
    }
}

impl fmt::Debug for Hub {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Hub")
            .field("backend", &self.backend.name())
            .field("connections_count", &self.registry.len())
            .field("worker_id", &self.ids.worker_id())
            .finish()
    }
}

/// The write half of a connection and the sources feeding it.
struct Outbound<K> {
    sink: K,
    local_rx: mpsc::Receiver<Payload>,
    feed: Option<BrokerFeed>,
    keepalive: Interval,
}

enum Outgoing {
    Frame(Message),
    BrokerClosed,
    Stop,
}

fn keepalive_timer(period: Duration) -> Interval {
    let mut timer = interval_at(Instant::now() + period, period);
    timer.set_missed_tick_behavior(MissedTickBehavior::Delay);
    timer
}

async fn next_broker_message(feed: Option<&mut BrokerFeed>) -> Option<Payload> {
    match feed {
        Some(feed) => feed.messages.recv().await,
        None => std::future::pending().await,
    }
}

async fn write_frame<K>(sink: &mut K, frame: Message, write_wait: Duration) -> bool
where
    K: Sink<Message> + Unpin,
    K::Error: Display,
{
    match timeout(write_wait, sink.send(frame)).await {
        Ok(Ok(())) => true,
        Ok(Err(e)) => {
            debug!("Write failed, client likely disconnected: {}", e);
            false
        }
        Err(_) => {
            warn!("Write deadline exceeded, dropping slow client");
            false
        }
    }
}

/// Reads frames only to detect liveness. Any frame, pongs included, resets
/// the deadline; silence for `pong_wait`, an error or a close frame ends the
/// connection.
async fn run_inbound<R, E>(mut stream: R, cancel: CancellationToken, pong_wait: Duration)
where
    R: Stream<Item = Result<Message, E>> + Unpin,
    E: Display,
{
    loop {
        let read = tokio::select! {
            _ = cancel.cancelled() => break,
            read = timeout(pong_wait, stream.next()) => read,
        };

        match read {
            Err(_) => {
                warn!("No frame from client within {:?}, treating it as disconnected", pong_wait);
                break;
            }
            Ok(None) => {
                debug!("Client stream ended.");
                break;
            }
            Ok(Some(Err(e))) => {
                debug!("Read failed: {}", e);
                break;
            }
            Ok(Some(Ok(Message::Close(frame)))) => {
                match &frame {
                    Some(frame)
                        if frame.code != close_code::NORMAL && frame.code != close_code::AWAY =>
                    {
                        warn!(code = frame.code, reason = %frame.reason, "Client closed abnormally");
                    }
                    _ => debug!(?frame, "Received close frame from client."),
                }
                break;
            }
            Ok(Some(Ok(Message::Pong(_)))) => trace!("Pong received"),
            Ok(Some(Ok(_))) => trace!("Ignoring inbound frame"),
        }
    }
    cancel.cancel();
}
