use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("Invalid {what}: {value:?}")]
pub struct ParseEnumError {
    pub what: &'static str,
    pub value: String,
}

impl ParseEnumError {
    pub fn new(what: &'static str, value: &str) -> Self {
        Self {
            what,
            value: value.to_string(),
        }
    }
}

/// Machine-readable error code carried in every error response body, so the
/// client can pick a recovery action without matching on message text.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    NotFound,
    Forbidden,
    Unauthorized,
    InvalidState,
    InvalidTarget,
    InvalidRequest,
    AlreadyInCall,
    PeerBusy,
    CallInProgress,
    Internal,
}

impl ErrorCode {
    /// Conflicts the client may resolve by force cleanup and retry.
    pub fn is_recoverable_conflict(&self) -> bool {
        matches!(self, ErrorCode::AlreadyInCall | ErrorCode::CallInProgress)
    }
}

/// JSON body of every non-2xx response.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ErrorBody {
    pub error: String,
    pub code: ErrorCode,
}
