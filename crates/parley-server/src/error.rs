use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use thiserror::Error;

use parley_shared::call::CallState;
use parley_shared::error::{ErrorBody, ErrorCode};
use parley_store::StoreError;

#[derive(Debug, Error)]
pub enum CallError {
    #[error("{0} not found")]
    NotFound(&'static str),

    #[error("Not allowed to act on this call")]
    Forbidden,

    #[error("Missing or unknown user identity")]
    Unauthorized,

    #[error("Call is {actual}, expected {expected}")]
    InvalidState {
        expected: CallState,
        actual: CallState,
    },

    #[error("You cannot call yourself")]
    InvalidTarget,

    /// A request body that is present but does not parse.
    #[error("Invalid request body: {0}")]
    InvalidRequest(String),

    #[error("You are already in another call")]
    AlreadyInCall,

    #[error("User is currently in another call")]
    PeerBusy,

    #[error("Call already in progress")]
    CallInProgress,

    #[error("Storage error: {0}")]
    Store(#[from] StoreError),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl CallError {
    pub fn code(&self) -> ErrorCode {
        match self {
            CallError::NotFound(_) => ErrorCode::NotFound,
            CallError::Forbidden => ErrorCode::Forbidden,
            CallError::Unauthorized => ErrorCode::Unauthorized,
            CallError::InvalidState { .. } => ErrorCode::InvalidState,
            CallError::InvalidTarget => ErrorCode::InvalidTarget,
            CallError::InvalidRequest(_) => ErrorCode::InvalidRequest,
            CallError::AlreadyInCall => ErrorCode::AlreadyInCall,
            CallError::PeerBusy => ErrorCode::PeerBusy,
            CallError::CallInProgress => ErrorCode::CallInProgress,
            CallError::Store(_) | CallError::Internal(_) => ErrorCode::Internal,
        }
    }

    fn status(&self) -> StatusCode {
        match self {
            CallError::NotFound(_) => StatusCode::NOT_FOUND,
            CallError::Forbidden => StatusCode::FORBIDDEN,
            CallError::Unauthorized => StatusCode::UNAUTHORIZED,
            CallError::InvalidState { .. }
            | CallError::InvalidTarget
            | CallError::InvalidRequest(_)
            | CallError::AlreadyInCall
            | CallError::PeerBusy
            | CallError::CallInProgress => StatusCode::BAD_REQUEST,
            CallError::Store(_) | CallError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for CallError {
    fn into_response(self) -> Response {
        let status = self.status();
        let message = match &self {
            CallError::Store(_) | CallError::Internal(_) => {
                tracing::error!(error = %self, "Request failed");
                "Internal server error".to_string()
            }
            _ => self.to_string(),
        };

        let body = ErrorBody {
            error: message,
            code: self.code(),
        };

        (status, axum::Json(body)).into_response()
    }
}
