//! Live connection registry.
//!
//! Maps each user to at most one registered connection handle. All
//! operations are synchronous map operations and never hold a lock across
//! an `.await`.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use tokio::sync::{mpsc, Notify};
use tracing::{debug, info};

use parley_shared::protocol::{ServerEvent, SessionReplaced};
use parley_shared::types::{ConnectionId, UserId};

/// Items queued for a connection's writer task.
#[derive(Debug, Clone)]
pub enum Outbound {
    Event(ServerEvent),
    Close(CloseReason),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    /// The same user registered a newer connection.
    Replaced,
    /// The user record was removed by the identity provider.
    Evicted,
}

impl CloseReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Replaced => "session replaced",
            Self::Evicted => "user removed",
        }
    }
}

pub type OutboundTx = mpsc::UnboundedSender<Outbound>;
pub type OutboundRx = mpsc::UnboundedReceiver<Outbound>;

/// One live socket, bound to a single user for its whole lifetime.
#[derive(Debug, Clone)]
pub struct ConnectionHandle {
    pub id: ConnectionId,
    pub user: UserId,
    pub connected_at: DateTime<Utc>,
    tx: OutboundTx,
    /// Fired once the server ends this connection.
    shutdown: Arc<Notify>,
}

impl ConnectionHandle {
    pub fn new(user: UserId, tx: OutboundTx) -> Self {
        Self {
            id: ConnectionId::new(),
            user,
            connected_at: Utc::now(),
            tx,
            shutdown: Arc::new(Notify::new()),
        }
    }

    /// Queue an event. Returns `false` if the writer task is gone.
    pub fn send(&self, event: ServerEvent) -> bool {
        self.tx.send(Outbound::Event(event)).is_ok()
    }

    fn close(&self, reason: CloseReason) {
        let _ = self.tx.send(Outbound::Close(reason));
        // notify_one keeps a permit, so a reader that is not polling yet
        // still observes it.
        self.shutdown.notify_one();
    }

    /// Resolves once the registry has closed this connection.
    pub async fn closed(&self) {
        self.shutdown.notified().await
    }
}

#[derive(Default)]
pub struct ConnectionRegistry {
    connections: DashMap<UserId, ConnectionHandle>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `handle` for its user, replacing any previous mapping.
    ///
    /// A superseded connection is told why and then closed, so a user never
    /// has a live socket that silently stopped receiving events.
    pub fn register(&self, handle: ConnectionHandle) -> Option<ConnectionHandle> {
        let user = handle.user;
        let connection = handle.id;
        let previous = self.connections.insert(user, handle);

        match &previous {
            Some(old) if old.id != connection => {
                info!(user = %user, old = %old.id.short(), new = %connection.short(), "Connection superseded");
                old.send(ServerEvent::SessionReplaced(SessionReplaced {
                    reason: CloseReason::Replaced.as_str().to_string(),
                }));
                old.close(CloseReason::Replaced);
            }
            _ => debug!(user = %user, connection = %connection.short(), "Connection registered"),
        }

        previous
    }

    pub fn resolve(&self, user: &UserId) -> Option<ConnectionHandle> {
        self.connections.get(user).map(|entry| entry.value().clone())
    }

    /// Whether `connection` is still the live connection of `user`.
    pub fn is_current(&self, user: &UserId, connection: ConnectionId) -> bool {
        self.connections
            .get(user)
            .is_some_and(|entry| entry.id == connection)
    }

    /// Remove the mapping only if it still points at `connection`.
    pub fn unregister(&self, user: &UserId, connection: ConnectionId) -> bool {
        let removed = self
            .connections
            .remove_if(user, |_, handle| handle.id == connection)
            .is_some();
        if removed {
            debug!(user = %user, connection = %connection.short(), "Connection unregistered");
        }
        removed
    }

    /// Queue `event` for the user's live connection, if any.
    pub fn send(&self, user: &UserId, event: ServerEvent) -> bool {
        match self.resolve(user) {
            Some(handle) => handle.send(event),
            None => false,
        }
    }

    /// Drop and close the user's connection regardless of which handle it is.
    pub fn evict(&self, user: &UserId) -> bool {
        match self.connections.remove(user) {
            Some((_, handle)) => {
                handle.close(CloseReason::Evicted);
                info!(user = %user, "Connection evicted");
                true
            }
            None => false,
        }
    }

    pub fn len(&self) -> usize {
        self.connections.len()
    }
}
