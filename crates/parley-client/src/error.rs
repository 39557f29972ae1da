use thiserror::Error;

use parley_shared::error::ErrorCode;

#[derive(Error, Debug)]
pub enum ClientError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("{message}")]
    Server {
        status: u16,
        code: ErrorCode,
        message: String,
    },

    #[error("Media error: {0}")]
    Media(String),

    #[error("Peer connection error: {0}")]
    Peer(String),

    #[error("Signaling channel closed")]
    SignalingClosed,

    #[error("No call to act on")]
    NoActiveCall,

    #[error("No incoming call to answer")]
    NoIncomingCall,
}

pub type Result<T> = std::result::Result<T, ClientError>;

impl ClientError {
    /// Machine code reported by the server, if this error came from one.
    pub fn code(&self) -> Option<ErrorCode> {
        match self {
            ClientError::Server { code, .. } => Some(*code),
            _ => None,
        }
    }

    /// The server refused a call because of a session that force cleanup can
    /// clear.
    pub fn is_recoverable_conflict(&self) -> bool {
        self.code().is_some_and(|c| c.is_recoverable_conflict())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn server(code: ErrorCode) -> ClientError {
        ClientError::Server {
            status: 400,
            code,
            message: "nope".into(),
        }
    }

    #[test]
    fn test_recoverable_conflicts() {
        assert!(server(ErrorCode::AlreadyInCall).is_recoverable_conflict());
        assert!(server(ErrorCode::CallInProgress).is_recoverable_conflict());
        assert!(!server(ErrorCode::PeerBusy).is_recoverable_conflict());
        assert!(!ClientError::Media("no mic".into()).is_recoverable_conflict());
    }

    #[test]
    fn test_server_error_displays_message() {
        assert_eq!(server(ErrorCode::PeerBusy).to_string(), "nope");
    }
}
