//! Signaling relay: per-session groups with fan-out to everyone but the
//! sender.
//!
//! The relay never looks inside offer/answer/candidate payloads. Groups exist
//! only while at least one connection has joined; an event sent to a group
//! whose peer has not joined yet is dropped.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::RwLock;
use tracing::{debug, info};

use parley_shared::protocol::ServerEvent;
use parley_shared::types::SessionId;

use crate::presence::{ConnectionHandle, ConnectionId};

struct CallGroup {
    session_id: SessionId,
    members: HashMap<ConnectionId, ConnectionHandle>,
}

impl CallGroup {
    fn new(session_id: SessionId) -> Self {
        Self {
            session_id,
            members: HashMap::new(),
        }
    }

    fn join(&mut self, handle: ConnectionHandle) {
        let user = handle.user();
        self.members.insert(handle.id(), handle);

        info!(
            session = %self.session_id,
            user = %user.short(),
            members = self.members.len(),
            "Joined call group"
        );
    }

    fn leave(&mut self, conn: &ConnectionId) -> bool {
        let Some(handle) = self.members.remove(conn) else {
            return false;
        };

        info!(
            session = %self.session_id,
            user = %handle.user().short(),
            members = self.members.len(),
            "Left call group"
        );
        true
    }

    /// Forward to every member except `sender`. Returns the delivery count.
    fn fan_out(&self, sender: &ConnectionId, event: &ServerEvent) -> usize {
        let mut delivered = 0;
        for (conn, handle) in &self.members {
            if conn == sender {
                continue;
            }
            if handle.send(event.clone()) {
                delivered += 1;
            }
        }
        delivered
    }

    fn is_empty(&self) -> bool {
        self.members.is_empty()
    }
}

#[derive(Clone, Default)]
pub struct SignalRelay {
    groups: Arc<RwLock<HashMap<SessionId, CallGroup>>>,
}

impl SignalRelay {
    pub fn new() -> Self {
        Self::default()
    }

    /// Join a session's group (created on first join).
    pub async fn join(&self, session_id: SessionId, handle: ConnectionHandle) {
        let mut groups = self.groups.write().await;
        groups
            .entry(session_id)
            .or_insert_with(|| CallGroup::new(session_id))
            .join(handle);
    }

    /// Leave a group. The group is removed once it is empty.
    pub async fn leave(&self, session_id: &SessionId, conn: ConnectionId) -> bool {
        let mut groups = self.groups.write().await;
        let (left, now_empty) = match groups.get_mut(session_id) {
            Some(group) => (group.leave(&conn), group.is_empty()),
            None => (false, false),
        };

        if now_empty {
            groups.remove(session_id);
            debug!(session = %session_id, "Removed empty call group");
        }
        left
    }

    /// Remove a closing connection from every group it joined.
    pub async fn leave_all(&self, conn: ConnectionId) -> Vec<SessionId> {
        let mut groups = self.groups.write().await;
        let mut left = Vec::new();

        for (session_id, group) in groups.iter_mut() {
            if group.leave(&conn) {
                left.push(*session_id);
            }
        }
        groups.retain(|_, group| !group.is_empty());
        left
    }

    /// Relay `event` from `sender` to the other members of the session group.
    /// Senders that have not joined the group are ignored.
    pub async fn route(&self, session_id: &SessionId, sender: ConnectionId, event: ServerEvent) -> usize {
        let groups = self.groups.read().await;
        let Some(group) = groups.get(session_id) else {
            debug!(session = %session_id, "No group for session, dropping signal");
            return 0;
        };

        if !group.members.contains_key(&sender) {
            debug!(session = %session_id, conn = %sender, "Sender not in group, dropping signal");
            return 0;
        }

        let delivered = group.fan_out(&sender, &event);
        debug!(session = %session_id, delivered, "Relayed signal");
        delivered
    }

    #[cfg(test)]
    pub async fn member_count(&self, session_id: &SessionId) -> usize {
        self.groups
            .read()
            .await
            .get(session_id)
            .map(|g| g.members.len())
            .unwrap_or(0)
    }

    pub async fn group_count(&self) -> usize {
        self.groups.read().await.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parley_shared::types::UserId;
    use serde_json::json;
    use tokio::sync::mpsc;

    fn connect() -> (ConnectionHandle, mpsc::Receiver<ServerEvent>) {
        let (tx, rx) = mpsc::channel(16);
        (ConnectionHandle::new(UserId::new(), tx), rx)
    }

    fn offer(session_id: SessionId, from: UserId) -> ServerEvent {
        ServerEvent::Offer {
            session_id,
            from,
            payload: json!({ "type": "offer", "sdp": "v=0" }),
        }
    }

    #[tokio::test]
    async fn test_join_leave_removes_empty_group() {
        let relay = SignalRelay::new();
        let session = SessionId::new();
        let (a, _a_rx) = connect();
        let a_id = a.id();

        relay.join(session, a).await;
        assert_eq!(relay.member_count(&session).await, 1);

        assert!(relay.leave(&session, a_id).await);
        assert_eq!(relay.group_count().await, 0);
        assert!(!relay.leave(&session, a_id).await);
    }

    #[tokio::test]
    async fn test_fan_out_skips_sender() {
        let relay = SignalRelay::new();
        let session = SessionId::new();
        let (a, mut a_rx) = connect();
        let (b, mut b_rx) = connect();
        let (a_id, a_user) = (a.id(), a.user());

        relay.join(session, a).await;
        relay.join(session, b).await;

        let delivered = relay.route(&session, a_id, offer(session, a_user)).await;
        assert_eq!(delivered, 1);

        match b_rx.try_recv().unwrap() {
            ServerEvent::Offer { from, payload, .. } => {
                assert_eq!(from, a_user);
                assert_eq!(payload["sdp"], "v=0");
            }
            other => panic!("unexpected event: {other:?}"),
        }
        assert!(a_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_signals_are_dropped_without_peer_or_membership() {
        let relay = SignalRelay::new();
        let session = SessionId::new();
        let (a, _a_rx) = connect();
        let (outsider, _o_rx) = connect();
        let (a_id, a_user) = (a.id(), a.user());

        assert_eq!(relay.route(&session, a_id, offer(session, a_user)).await, 0);

        relay.join(session, a).await;
        assert_eq!(relay.route(&session, a_id, offer(session, a_user)).await, 0);
        assert_eq!(
            relay
                .route(&session, outsider.id(), offer(session, outsider.user()))
                .await,
            0
        );
    }

    #[tokio::test]
    async fn test_leave_all_on_disconnect() {
        let relay = SignalRelay::new();
        let (a, _a_rx) = connect();
        let (b, _b_rx) = connect();
        let a_id = a.id();
        let first = SessionId::new();
        let second = SessionId::new();

        relay.join(first, a.clone()).await;
        relay.join(second, a).await;
        relay.join(second, b).await;

        let mut left = relay.leave_all(a_id).await;
        left.sort_by_key(|s| s.0);
        assert_eq!(left.len(), 2);
        assert_eq!(relay.group_count().await, 1);
        assert_eq!(relay.member_count(&second).await, 1);
    }
}
