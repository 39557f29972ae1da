use std::time::Duration;

use parley_shared::constants::{
    CANDIDATE_BUFFER_CAPACITY, CANDIDATE_BUFFER_MAX_AGE, CLEANUP_SETTLE_DELAY,
    CLIENT_REQUEST_TIMEOUT, SELF_CHECK_INTERVAL,
};
use parley_shared::types::UserId;

/// Client-side settings. Only the server URL and the user are required.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Base URL of the Parley server, e.g. `http://localhost:5001`.
    pub base_url: String,
    pub user_id: UserId,
    /// Period of the background status check.
    pub self_check_interval: Duration,
    /// Remote candidates older than this are dropped instead of applied.
    pub candidate_max_age: Duration,
    pub candidate_capacity: usize,
    /// Pause between a pre-call force cleanup and the new initiate.
    pub cleanup_settle: Duration,
    /// Whole-request timeout for the call API. The self-check holds the
    /// controller while it waits, so this bounds how long user actions stall.
    pub request_timeout: Duration,
}

impl ClientConfig {
    pub fn new(base_url: impl Into<String>, user_id: UserId) -> Self {
        Self {
            base_url: base_url.into(),
            user_id,
            self_check_interval: SELF_CHECK_INTERVAL,
            candidate_max_age: CANDIDATE_BUFFER_MAX_AGE,
            candidate_capacity: CANDIDATE_BUFFER_CAPACITY,
            cleanup_settle: CLEANUP_SETTLE_DELAY,
            request_timeout: CLIENT_REQUEST_TIMEOUT,
        }
    }

    /// REST endpoint for `path` (relative to `/api/calls`).
    pub fn calls_url(&self, path: &str) -> String {
        format!("{}/api/calls/{}", self.base(), path.trim_start_matches('/'))
    }

    fn base(&self) -> &str {
        self.base_url.trim_end_matches('/')
    }
}
