// realtime-hub/src/ws/registry.rs

//! Session → connection lookup.

use crate::ws::connection::Connection;
use crate::ws::types::SessionId;
use dashmap::DashMap;
use std::fmt;
use std::sync::Arc;
use tracing::debug;

/// The single source of truth for "is this session live".
///
/// `DashMap` shards its locks, so lookups from request middleware do not
/// contend with inserts and removals on other sessions, and no lock is held
/// beyond the map operation itself.
#[derive(Default)]
pub struct ConnectionRegistry {
    connections: DashMap<SessionId, Arc<Connection>>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts the connection under its session ID, returning any record it replaced.
    pub fn put(&self, connection: Arc<Connection>) -> Option<Arc<Connection>> {
        debug!(
            session_id = connection.session_id(),
            user_id = connection.user_id(),
            "Registering connection"
        );
        self.connections.insert(connection.session_id(), connection)
    }

    /// Removes the session if present.
    pub fn remove(&self, session_id: SessionId) -> Option<Arc<Connection>> {
        debug!(session_id, "Removing connection");
        self.connections.remove(&session_id).map(|(_, connection)| connection)
    }

    pub fn get(&self, session_id: SessionId) -> Option<Arc<Connection>> {
        self.connections
            .get(&session_id)
            .map(|entry| Arc::clone(entry.value()))
    }

    pub fn contains(&self, session_id: SessionId) -> bool {
        self.connections.contains_key(&session_id)
    }

    pub fn len(&self) -> usize {
        self.connections.len()
    }

    pub fn is_empty(&self) -> bool {
        self.connections.is_empty()
    }

    /// Cancels every registered connection.
    pub fn close_all(&self) {
        for entry in self.connections.iter() {
            entry.value().close();
        }
    }
}

impl fmt::Debug for ConnectionRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionRegistry")
            .field("connections_count", &self.connections.len())
            .finish()
    }
}
