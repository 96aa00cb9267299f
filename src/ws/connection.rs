// realtime-hub/src/ws/connection.rs

//! The per-session connection record.

use crate::ws::distributed::BrokerLink;
use crate::ws::types::{Payload, SessionId, TopicKind, UserId};
use std::sync::atomic::{AtomicU8, Ordering};
use tokio::sync::{Mutex, MutexGuard, mpsc, mpsc::error::TrySendError};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Lifecycle states of a connection. Transitions only move forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u8)]
pub enum ConnectionState {
    Connecting = 0,
    Active = 1,
    Closing = 2,
    Closed = 3,
}

impl ConnectionState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => ConnectionState::Connecting,
            1 => ConnectionState::Active,
            2 => ConnectionState::Closing,
            _ => ConnectionState::Closed,
        }
    }
}

/// What the session is currently watching, besides its server-list topics.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct Interest {
    pub channel: Option<u64>,
    pub server: Option<u64>,
}

impl Interest {
    /// The single ID tracked for `kind`. Server lists are not tracked.
    pub fn current(&self, kind: TopicKind) -> Option<u64> {
        match kind {
            TopicKind::Channel => self.channel,
            TopicKind::Server => self.server,
            TopicKind::ServerList => None,
        }
    }

    pub(crate) fn set(&mut self, kind: TopicKind, id: Option<u64>) {
        match kind {
            TopicKind::Channel => self.channel = id,
            TopicKind::Server => self.server = id,
            TopicKind::ServerList => {}
        }
    }
}

/// One live real-time session.
///
/// The socket halves themselves belong to the connection's own read and write
/// tasks; the record carries what other components need to reach it: the
/// cancellation scope, the local-delivery queue, the broker subscription
/// handle (distributed backend only) and the current interest.
#[derive(Debug)]
pub struct Connection {
    session_id: SessionId,
    user_id: UserId,
    cancel: CancellationToken,
    local_tx: mpsc::Sender<Payload>,
    broker: Option<BrokerLink>,
    interest: Mutex<Interest>,
    state: AtomicU8,
}

impl Connection {
    pub fn new(
        session_id: SessionId,
        user_id: UserId,
        cancel: CancellationToken,
        local_tx: mpsc::Sender<Payload>,
        broker: Option<BrokerLink>,
    ) -> Self {
        Self {
            session_id,
            user_id,
            cancel,
            local_tx,
            broker,
            interest: Mutex::new(Interest::default()),
            state: AtomicU8::new(ConnectionState::Connecting as u8),
        }
    }

    pub fn session_id(&self) -> SessionId {
        self.session_id
    }

    pub fn user_id(&self) -> UserId {
        self.user_id
    }

    pub fn state(&self) -> ConnectionState {
        ConnectionState::from_u8(self.state.load(Ordering::Acquire))
    }

    /// Snapshot of the current channel/server interest.
    pub async fn interest(&self) -> Interest {
        *self.interest.lock().await
    }

    /// Exclusive access to the interest fields while a subscription is moved.
    pub(crate) async fn lock_interest(&self) -> MutexGuard<'_, Interest> {
        self.interest.lock().await
    }

    pub(crate) fn broker(&self) -> Option<&BrokerLink> {
        self.broker.as_ref()
    }

    pub(crate) fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    /// Asks the connection to shut down. Teardown runs on the connection's own task.
    pub fn close(&self) {
        self.cancel.cancel();
    }

    pub fn is_closing(&self) -> bool {
        self.cancel.is_cancelled() || self.state() >= ConnectionState::Closing
    }

    pub(crate) fn mark_active(&self) {
        let _ = self.state.compare_exchange(
            ConnectionState::Connecting as u8,
            ConnectionState::Active as u8,
            Ordering::AcqRel,
            Ordering::Acquire,
        );
    }

    /// Moves to `Closing`. Returns `true` only for the caller that made the move.
    pub(crate) fn begin_closing(&self) -> bool {
        self.state
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |state| {
                (state < ConnectionState::Closing as u8).then_some(ConnectionState::Closing as u8)
            })
            .is_ok()
    }

    pub(crate) fn mark_closed(&self) {
        self.state
            .store(ConnectionState::Closed as u8, Ordering::Release);
    }

    /// Queues a payload for this connection's write loop.
    ///
    /// Returns `false` when the payload was dropped. A full queue means the
    /// peer is not keeping up, so the connection is cancelled as well.
    pub fn deliver(&self, payload: Payload) -> bool {
        match self.local_tx.try_send(payload) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) => {
                warn!(
                    session_id = self.session_id,
                    "Local delivery queue is full, disconnecting slow consumer"
                );
                self.cancel.cancel();
                false
            }
            Err(TrySendError::Closed(_)) => {
                debug!(
                    session_id = self.session_id,
                    "Dropping payload for a connection that is shutting down"
                );
                false
            }
        }
    }
}
