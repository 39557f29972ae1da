//! The call session model and its state machine.
//!
//! ```text
//! ringing ──► ongoing ──► ended
//!    │
//!    ├──────► ended     (caller cancelled)
//!    ├──────► declined
//!    └──────► missed    (reaper timeout)
//! ```
//!
//! `ended`, `missed` and `declined` are terminal.

use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::ParseEnumError;
use crate::types::{SessionId, UserId, UserProfile};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum CallKind {
    #[default]
    Audio,
    Video,
}

impl CallKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            CallKind::Audio => "audio",
            CallKind::Video => "video",
        }
    }
}

impl FromStr for CallKind {
    type Err = ParseEnumError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "audio" => Ok(CallKind::Audio),
            "video" => Ok(CallKind::Video),
            other => Err(ParseEnumError::new("call kind", other)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CallState {
    Ringing,
    Ongoing,
    Ended,
    Missed,
    Declined,
}

impl CallState {
    pub const ACTIVE: [CallState; 2] = [CallState::Ringing, CallState::Ongoing];

    pub fn as_str(&self) -> &'static str {
        match self {
            CallState::Ringing => "ringing",
            CallState::Ongoing => "ongoing",
            CallState::Ended => "ended",
            CallState::Missed => "missed",
            CallState::Declined => "declined",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, CallState::Ended | CallState::Missed | CallState::Declined)
    }

    /// Whether the state machine allows moving from `self` to `next`.
    pub fn can_transition_to(&self, next: CallState) -> bool {
        match self {
            CallState::Ringing => next != CallState::Ringing,
            CallState::Ongoing => next == CallState::Ended,
            _ => false,
        }
    }
}

impl FromStr for CallState {
    type Err = ParseEnumError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "ringing" => Ok(CallState::Ringing),
            "ongoing" => Ok(CallState::Ongoing),
            "ended" => Ok(CallState::Ended),
            "missed" => Ok(CallState::Missed),
            "declined" => Ok(CallState::Declined),
            other => Err(ParseEnumError::new("call state", other)),
        }
    }
}

impl std::fmt::Display for CallState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Which side of a session a user is on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CallRole {
    Caller,
    Receiver,
}

/// One call attempt and its full lifecycle.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct CallSession {
    pub id: SessionId,
    pub caller_id: UserId,
    pub receiver_id: UserId,
    pub kind: CallKind,
    pub state: CallState,
    /// Set when the session enters `ongoing`.
    pub started_at: Option<DateTime<Utc>>,
    /// Set on any terminal transition.
    pub ended_at: Option<DateTime<Utc>>,
    pub duration_seconds: u64,
    pub created_at: DateTime<Utc>,
}

impl CallSession {
    /// A fresh `ringing` session.
    pub fn ringing(caller_id: UserId, receiver_id: UserId, kind: CallKind, now: DateTime<Utc>) -> Self {
        Self {
            id: SessionId::new(),
            caller_id,
            receiver_id,
            kind,
            state: CallState::Ringing,
            started_at: None,
            ended_at: None,
            duration_seconds: 0,
            created_at: now,
        }
    }

    pub fn is_active(&self) -> bool {
        !self.state.is_terminal()
    }

    pub fn is_participant(&self, user: UserId) -> bool {
        self.caller_id == user || self.receiver_id == user
    }

    pub fn role_of(&self, user: UserId) -> Option<CallRole> {
        if self.caller_id == user {
            Some(CallRole::Caller)
        } else if self.receiver_id == user {
            Some(CallRole::Receiver)
        } else {
            None
        }
    }

    /// The other participant, if `user` is one of them.
    pub fn counterpart(&self, user: UserId) -> Option<UserId> {
        match self.role_of(user)? {
            CallRole::Caller => Some(self.receiver_id),
            CallRole::Receiver => Some(self.caller_id),
        }
    }

    /// True when the session is between exactly `a` and `b`, in either direction.
    pub fn connects(&self, a: UserId, b: UserId) -> bool {
        (self.caller_id == a && self.receiver_id == b)
            || (self.caller_id == b && self.receiver_id == a)
    }

    /// Whole seconds between `started_at` and `until`; 0 if never started.
    pub fn elapsed_seconds(&self, until: DateTime<Utc>) -> u64 {
        match self.started_at {
            Some(started) => (until - started).num_seconds().max(0) as u64,
            None => 0,
        }
    }
}

/// A history row: the session plus both participants' display fields.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct CallHistoryEntry {
    #[serde(flatten)]
    pub session: CallSession,
    pub caller: UserProfile,
    pub receiver: UserProfile,
}

/// Answer to "am I in a call right now?".
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct CallStatus {
    pub has_active_call: bool,
    pub session: Option<CallSession>,
    pub role: Option<CallRole>,
}

impl CallStatus {
    pub fn idle() -> Self {
        Self {
            has_active_call: false,
            session: None,
            role: None,
        }
    }

    pub fn active(session: CallSession, user: UserId) -> Self {
        let role = session.role_of(user);
        Self {
            has_active_call: true,
            session: Some(session),
            role,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[test]
    fn test_transitions_are_monotonic() {
        assert!(CallState::Ringing.can_transition_to(CallState::Ongoing));
        assert!(CallState::Ringing.can_transition_to(CallState::Missed));
        assert!(CallState::Ongoing.can_transition_to(CallState::Ended));
        assert!(!CallState::Ongoing.can_transition_to(CallState::Declined));
        for terminal in [CallState::Ended, CallState::Missed, CallState::Declined] {
            assert!(terminal.is_terminal());
            assert!(!terminal.can_transition_to(CallState::Ringing));
            assert!(!terminal.can_transition_to(CallState::Ended));
        }
    }

    #[test]
    fn test_state_string_round_trip() {
        for state in [
            CallState::Ringing,
            CallState::Ongoing,
            CallState::Ended,
            CallState::Missed,
            CallState::Declined,
        ] {
            assert_eq!(state.as_str().parse::<CallState>().unwrap(), state);
        }
        assert!("busy".parse::<CallState>().is_err());
    }

    #[test]
    fn test_roles_and_counterpart() {
        let a = UserId::new();
        let b = UserId::new();
        let c = UserId::new();
        let session = CallSession::ringing(a, b, CallKind::Video, Utc::now());

        assert_eq!(session.role_of(a), Some(CallRole::Caller));
        assert_eq!(session.role_of(b), Some(CallRole::Receiver));
        assert_eq!(session.role_of(c), None);
        assert_eq!(session.counterpart(b), Some(a));
        assert!(session.connects(b, a));
        assert!(!session.connects(a, c));
    }

    #[test]
    fn test_elapsed_seconds_is_zero_without_start() {
        let now = Utc::now();
        let mut session = CallSession::ringing(UserId::new(), UserId::new(), CallKind::Audio, now);
        assert_eq!(session.elapsed_seconds(now + Duration::seconds(90)), 0);

        session.started_at = Some(now);
        assert_eq!(session.elapsed_seconds(now + Duration::milliseconds(30_900)), 30);
        assert_eq!(session.elapsed_seconds(now - Duration::seconds(5)), 0);
    }

    #[test]
    fn test_session_json_shape() {
        let session = CallSession::ringing(UserId::new(), UserId::new(), CallKind::Audio, Utc::now());
        let json = serde_json::to_value(&session).unwrap();
        assert_eq!(json["state"], "ringing");
        assert_eq!(json["kind"], "audio");
        assert!(json["startedAt"].is_null());
        assert_eq!(json["durationSeconds"], 0);
    }
}
