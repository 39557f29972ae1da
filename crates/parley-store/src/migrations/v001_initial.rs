//! v001 -- Initial schema creation.
//!
//! Creates `users` and `call_sessions`. There is deliberately no uniqueness
//! constraint on active sessions per user: the coordinator enforces that rule,
//! and stale-session cleanup must be able to race with new calls.

use rusqlite::Connection;

/// Schema v1.
const UP_SQL: &str = r#"
-- ----------------------------------------------------------------
-- Users (owned by the auth/profile subsystem, read here)
-- ----------------------------------------------------------------
CREATE TABLE IF NOT EXISTS users (
    id           TEXT PRIMARY KEY NOT NULL,   -- UUID
    display_name TEXT NOT NULL,
    avatar       TEXT,                        -- avatar URL or blob reference
    created_at   TEXT NOT NULL                -- RFC-3339
);

-- ----------------------------------------------------------------
-- Call sessions (never deleted; they double as call history)
-- ----------------------------------------------------------------
CREATE TABLE IF NOT EXISTS call_sessions (
    id               TEXT PRIMARY KEY NOT NULL,   -- UUID
    caller_id        TEXT NOT NULL,
    receiver_id      TEXT NOT NULL,
    kind             TEXT NOT NULL,               -- audio | video
    state            TEXT NOT NULL,               -- ringing | ongoing | ended | missed | declined
    started_at       TEXT,
    ended_at         TEXT,
    duration_seconds INTEGER NOT NULL DEFAULT 0,
    created_at       TEXT NOT NULL,

    CHECK (caller_id <> receiver_id),
    FOREIGN KEY (caller_id) REFERENCES users(id),
    FOREIGN KEY (receiver_id) REFERENCES users(id)
);

CREATE INDEX IF NOT EXISTS idx_call_sessions_caller
    ON call_sessions(caller_id, state);

CREATE INDEX IF NOT EXISTS idx_call_sessions_receiver
    ON call_sessions(receiver_id, state);

CREATE INDEX IF NOT EXISTS idx_call_sessions_state_created
    ON call_sessions(state, created_at);

CREATE INDEX IF NOT EXISTS idx_call_sessions_created
    ON call_sessions(created_at DESC);
"#;

/// Create the users and call_sessions tables.
pub fn up(conn: &Connection) -> Result<(), rusqlite::Error> {
    conn.execute_batch(UP_SQL)
}
