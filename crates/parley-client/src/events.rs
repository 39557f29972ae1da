use serde::Serialize;

use parley_shared::call::CallKind;
use parley_shared::error::ErrorCode;
use parley_shared::types::{SessionId, UserId, UserProfile};

/// Something the UI should show. Sent by the controller over an mpsc channel.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "camelCase", rename_all_fields = "camelCase")]
pub enum ClientNotice {
    OnlineUsers {
        users: Vec<UserId>,
    },
    Calling {
        session_id: SessionId,
        kind: CallKind,
    },
    IncomingCall {
        session_id: SessionId,
        kind: CallKind,
        caller: UserProfile,
    },
    CallAnswered {
        session_id: SessionId,
    },
    Connected {
        session_id: SessionId,
    },
    CallDeclined {
        session_id: SessionId,
    },
    CallEnded {
        session_id: SessionId,
        duration: u64,
    },
    /// The server refused a new call because of an existing session.
    CallBlocked {
        code: ErrorCode,
        message: String,
    },
    CleanedUp {
        count: usize,
    },
    MediaFailed {
        message: String,
    },
    Error {
        message: String,
    },
}

impl ClientNotice {
    /// One-line text for a toast.
    pub fn summary(&self) -> String {
        match self {
            ClientNotice::OnlineUsers { users } => format!("{} online", users.len()),
            ClientNotice::Calling { kind, .. } => match kind {
                CallKind::Audio => "Calling...".to_string(),
                CallKind::Video => "Video calling...".to_string(),
            },
            ClientNotice::IncomingCall { caller, .. } => {
                format!("Incoming call from {}", caller.display_name)
            }
            ClientNotice::CallAnswered { .. } => "Call answered!".to_string(),
            ClientNotice::Connected { .. } => "Call connected!".to_string(),
            ClientNotice::CallDeclined { .. } => "Call declined".to_string(),
            ClientNotice::CallEnded { duration, .. } => {
                format!("Call ended ({})", format_duration(*duration))
            }
            ClientNotice::CallBlocked { message, .. } => format!("Call blocked: {message}"),
            ClientNotice::CleanedUp { count: 0 } => "No stuck calls found".to_string(),
            ClientNotice::CleanedUp { count } => format!("Cleaned up {count} stuck call(s)"),
            ClientNotice::MediaFailed { message } => format!("Media unavailable: {message}"),
            ClientNotice::Error { message } => message.clone(),
        }
    }
}

/// `m:ss`
pub fn format_duration(seconds: u64) -> String {
    format!("{}:{:02}", seconds / 60, seconds % 60)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_duration() {
        assert_eq!(format_duration(0), "0:00");
        assert_eq!(format_duration(65), "1:05");
        assert_eq!(format_duration(3600), "60:00");
    }

    #[test]
    fn test_summary_and_wire_shape() {
        let notice = ClientNotice::CallEnded {
            session_id: SessionId::new(),
            duration: 30,
        };
        assert_eq!(notice.summary(), "Call ended (0:30)");

        let json = serde_json::to_value(&notice).unwrap();
        assert_eq!(json["type"], "callEnded");
        assert_eq!(json["duration"], 30);
        assert!(json.get("sessionId").is_some());
    }

    #[test]
    fn test_cleanup_summary() {
        assert_eq!(ClientNotice::CleanedUp { count: 0 }.summary(), "No stuck calls found");
        assert_eq!(
            ClientNotice::CleanedUp { count: 2 }.summary(),
            "Cleaned up 2 stuck call(s)"
        );
    }
}
