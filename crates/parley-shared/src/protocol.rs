//! Event protocol carried over the persistent WebSocket connection, plus the
//! small REST payloads that are not themselves domain models.
//!
//! Frames are JSON text of the form `{"event": "<name>", "data": {...}}`.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::call::CallKind;
use crate::types::{SessionId, UserId, UserProfile};

/// Events pushed from the server to a connected client.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(
    tag = "event",
    content = "data",
    rename_all = "camelCase",
    rename_all_fields = "camelCase"
)]
pub enum ServerEvent {
    /// Full set of online user ids, re-sent on every connect/disconnect.
    GetOnlineUsers(Vec<UserId>),
    IncomingCall {
        session_id: SessionId,
        kind: CallKind,
        caller: UserProfile,
    },
    CallAnswered {
        session_id: SessionId,
        receiver: UserProfile,
    },
    CallDeclined {
        session_id: SessionId,
    },
    CallEnded {
        session_id: SessionId,
        duration: u64,
    },
    Offer {
        session_id: SessionId,
        from: UserId,
        payload: Value,
    },
    Answer {
        session_id: SessionId,
        from: UserId,
        payload: Value,
    },
    IceCandidate {
        session_id: SessionId,
        from: UserId,
        candidate: Value,
    },
    Renegotiate {
        session_id: SessionId,
        from: UserId,
    },
    /// The gateway rejected a client frame.
    Error {
        message: String,
    },
}

impl ServerEvent {
    pub fn session_id(&self) -> Option<SessionId> {
        match self {
            ServerEvent::IncomingCall { session_id, .. }
            | ServerEvent::CallAnswered { session_id, .. }
            | ServerEvent::CallDeclined { session_id }
            | ServerEvent::CallEnded { session_id, .. }
            | ServerEvent::Offer { session_id, .. }
            | ServerEvent::Answer { session_id, .. }
            | ServerEvent::IceCandidate { session_id, .. }
            | ServerEvent::Renegotiate { session_id, .. } => Some(*session_id),
            ServerEvent::GetOnlineUsers(_) | ServerEvent::Error { .. } => None,
        }
    }
}

/// Events sent by a client. All of them are routed by session id.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(
    tag = "event",
    content = "data",
    rename_all = "camelCase",
    rename_all_fields = "camelCase"
)]
pub enum ClientEvent {
    JoinCall { session_id: SessionId },
    LeaveCall { session_id: SessionId },
    Offer { session_id: SessionId, payload: Value },
    Answer { session_id: SessionId, payload: Value },
    IceCandidate { session_id: SessionId, candidate: Value },
    Renegotiate { session_id: SessionId },
}

impl ClientEvent {
    pub fn session_id(&self) -> SessionId {
        match self {
            ClientEvent::JoinCall { session_id }
            | ClientEvent::LeaveCall { session_id }
            | ClientEvent::Offer { session_id, .. }
            | ClientEvent::Answer { session_id, .. }
            | ClientEvent::IceCandidate { session_id, .. }
            | ClientEvent::Renegotiate { session_id } => *session_id,
        }
    }

    /// Turn a relayable client event into what the other group members see.
    /// Join/leave are group-membership commands and are never relayed.
    pub fn into_relayed(self, from: UserId) -> Option<ServerEvent> {
        match self {
            ClientEvent::Offer { session_id, payload } => Some(ServerEvent::Offer {
                session_id,
                from,
                payload,
            }),
            ClientEvent::Answer { session_id, payload } => Some(ServerEvent::Answer {
                session_id,
                from,
                payload,
            }),
            ClientEvent::IceCandidate {
                session_id,
                candidate,
            } => Some(ServerEvent::IceCandidate {
                session_id,
                from,
                candidate,
            }),
            ClientEvent::Renegotiate { session_id } => {
                Some(ServerEvent::Renegotiate { session_id, from })
            }
            ClientEvent::JoinCall { .. } | ClientEvent::LeaveCall { .. } => None,
        }
    }
}

/// Body of `POST /api/calls/initiate/{receiverId}`.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct InitiateCallRequest {
    #[serde(rename = "type", default)]
    pub kind: CallKind,
}

/// Body returned by `POST /api/calls/cleanup`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct CleanupResponse {
    pub cleaned_count: usize,
}
