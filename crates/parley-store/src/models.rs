//! Domain model structs persisted in the database.
//!
//! Call-related types live in `parley-shared` because the client sees them
//! too; they are re-exported here for convenience.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub use parley_shared::call::{CallHistoryEntry, CallKind, CallSession, CallState};
pub use parley_shared::types::{SessionId, UserId, UserProfile};

// ---------------------------------------------------------------------------
// User
// ---------------------------------------------------------------------------

/// A user known to the server. Created by the auth subsystem; the call core
/// only reads it.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct User {
    pub id: UserId,
    pub display_name: String,
    /// Avatar URL or blob reference.
    pub avatar: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl User {
    pub fn new(display_name: impl Into<String>) -> Self {
        Self {
            id: UserId::new(),
            display_name: display_name.into(),
            avatar: None,
            created_at: Utc::now(),
        }
    }

    pub fn profile(&self) -> UserProfile {
        UserProfile {
            id: self.id,
            display_name: self.display_name.clone(),
            avatar: self.avatar.clone(),
        }
    }
}
