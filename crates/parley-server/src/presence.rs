//! Presence registry: which user is reachable through which live connection.
//!
//! One entry per user; a second connection from the same user replaces the
//! first. Every change re-broadcasts the full online set to all connections.
//! Nothing here is persisted, so after a restart everyone is offline until
//! they reconnect.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::{mpsc, RwLock};
use tracing::{debug, info};
use uuid::Uuid;

use parley_shared::protocol::ServerEvent;
use parley_shared::types::UserId;

pub type ConnectionId = Uuid;

/// Outbound half of one live connection.
#[derive(Debug, Clone)]
pub struct ConnectionHandle {
    id: ConnectionId,
    user: UserId,
    tx: mpsc::Sender<ServerEvent>,
}

impl ConnectionHandle {
    pub fn new(user: UserId, tx: mpsc::Sender<ServerEvent>) -> Self {
        Self {
            id: Uuid::new_v4(),
            user,
            tx,
        }
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn user(&self) -> UserId {
        self.user
    }

    /// Queue an event for this connection. Best effort: a full or closed
    /// queue drops the event.
    pub fn send(&self, event: ServerEvent) -> bool {
        let session = event.session_id();
        match self.tx.try_send(event) {
            Ok(()) => true,
            Err(e) => {
                debug!(
                    user = %self.user.short(),
                    conn = %self.id,
                    session = ?session,
                    error = %e,
                    "Dropping event for connection"
                );
                false
            }
        }
    }
}

#[derive(Clone, Default)]
pub struct PresenceRegistry {
    connections: Arc<RwLock<HashMap<UserId, ConnectionHandle>>>,
}

impl PresenceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a connection, replacing any previous one for the same user.
    pub async fn register(&self, handle: ConnectionHandle) -> Option<ConnectionHandle> {
        let user = handle.user();
        let replaced = {
            let mut connections = self.connections.write().await;
            connections.insert(user, handle)
        };

        info!(
            user = %user.short(),
            replaced = replaced.is_some(),
            "User connected"
        );
        self.broadcast_online().await;
        replaced
    }

    pub async fn lookup(&self, user: UserId) -> Option<ConnectionHandle> {
        self.connections.read().await.get(&user).cloned()
    }

    /// Remove `user`'s entry, but only if it still belongs to connection `conn`.
    pub async fn unregister(&self, user: UserId, conn: ConnectionId) -> bool {
        let removed = {
            let mut connections = self.connections.write().await;
            match connections.get(&user) {
                Some(handle) if handle.id() == conn => {
                    connections.remove(&user);
                    true
                }
                _ => false,
            }
        };

        if removed {
            info!(user = %user.short(), "User disconnected");
            self.broadcast_online().await;
        } else {
            debug!(user = %user.short(), conn = %conn, "Stale connection closed");
        }
        removed
    }

    /// Send an event to `user`'s live connection. Returns `false` if the user
    /// is offline or the event was dropped.
    pub async fn notify(&self, user: UserId, event: ServerEvent) -> bool {
        match self.lookup(user).await {
            Some(handle) => handle.send(event),
            None => {
                debug!(
                    user = %user.short(),
                    session = ?event.session_id(),
                    "User offline, notification skipped"
                );
                false
            }
        }
    }

    pub async fn online_count(&self) -> usize {
        self.connections.read().await.len()
    }

    /// Drop every connection handle. Called once at shutdown.
    pub async fn shutdown(&self) {
        let mut connections = self.connections.write().await;
        info!(connections = connections.len(), "Closing presence registry");
        connections.clear();
    }

    async fn broadcast_online(&self) {
        let connections = self.connections.read().await;
        let mut online: Vec<UserId> = connections.keys().copied().collect();
        online.sort();

        for handle in connections.values() {
            handle.send(ServerEvent::GetOnlineUsers(online.clone()));
        }
    }
}
