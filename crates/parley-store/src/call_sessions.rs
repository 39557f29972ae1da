//! Call session persistence.
//!
//! Every mutating helper is a single conditional `UPDATE` whose `WHERE` clause
//! names the state(s) the caller expects. The returned row count tells the
//! caller whether its transition won.

use chrono::{DateTime, Utc};
use rusqlite::types::ToSql;
use rusqlite::{params, OptionalExtension};
use uuid::Uuid;

use crate::database::{conversion_failure, decode_ts, encode_ts, Database};
use crate::error::{not_found_or, Result};
use crate::models::{
    CallHistoryEntry, CallKind, CallSession, CallState, SessionId, UserId, UserProfile,
};

const SESSION_COLUMNS: &str = "s.id, s.caller_id, s.receiver_id, s.kind, s.state, \
     s.started_at, s.ended_at, s.duration_seconds, s.created_at";

impl Database {
    pub fn insert_call_session(&self, session: &CallSession) -> Result<()> {
        self.conn().execute(
            "INSERT INTO call_sessions
                (id, caller_id, receiver_id, kind, state, started_at, ended_at,
                 duration_seconds, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
            params![
                session.id.to_string(),
                session.caller_id.to_string(),
                session.receiver_id.to_string(),
                session.kind.as_str(),
                session.state.as_str(),
                session.started_at.map(encode_ts),
                session.ended_at.map(encode_ts),
                session.duration_seconds as i64,
                encode_ts(session.created_at),
            ],
        )?;
        Ok(())
    }

    pub fn get_call_session(&self, id: SessionId) -> Result<CallSession> {
        self.conn()
            .query_row(
                &format!("SELECT {SESSION_COLUMNS} FROM call_sessions s WHERE s.id = ?1"),
                params![id.to_string()],
                row_to_session,
            )
            .map_err(not_found_or)
    }

    /// All ringing/ongoing sessions where any of `users` is caller or receiver,
    /// oldest first.
    pub fn find_active_sessions_touching(&self, users: &[UserId]) -> Result<Vec<CallSession>> {
        if users.is_empty() {
            return Ok(Vec::new());
        }

        let ids: Vec<String> = users.iter().map(|u| u.to_string()).collect();
        let placeholders = placeholders(1, ids.len());
        let sql = format!(
            "SELECT {SESSION_COLUMNS} FROM call_sessions s
             WHERE s.state IN ('ringing', 'ongoing')
               AND (s.caller_id IN ({placeholders}) OR s.receiver_id IN ({placeholders}))
             ORDER BY s.created_at ASC, s.rowid ASC"
        );

        let mut stmt = self.conn().prepare(&sql)?;
        let rows = stmt.query_map(rusqlite::params_from_iter(ids.iter()), row_to_session)?;

        let mut sessions = Vec::new();
        for row in rows {
            sessions.push(row?);
        }
        Ok(sessions)
    }

    /// The most recent ringing/ongoing session touching `user`, if any.
    pub fn find_active_session_for_user(&self, user: UserId) -> Result<Option<CallSession>> {
        Ok(self
            .conn()
            .query_row(
                &format!(
                    "SELECT {SESSION_COLUMNS} FROM call_sessions s
                     WHERE s.state IN ('ringing', 'ongoing')
                       AND (s.caller_id = ?1 OR s.receiver_id = ?1)
                     ORDER BY s.created_at DESC, s.rowid DESC
                     LIMIT 1"
                ),
                params![user.to_string()],
                row_to_session,
            )
            .optional()?)
    }

    pub fn count_active_sessions(&self) -> Result<usize> {
        let count: i64 = self.conn().query_row(
            "SELECT COUNT(*) FROM call_sessions WHERE state IN ('ringing', 'ongoing')",
            [],
            |row| row.get(0),
        )?;
        Ok(count as usize)
    }

    /// `ringing -> ongoing`. Returns `false` if the session was no longer ringing.
    pub fn mark_call_ongoing(&self, id: SessionId, started_at: DateTime<Utc>) -> Result<bool> {
        let affected = self.conn().execute(
            "UPDATE call_sessions
             SET state = 'ongoing', started_at = ?2
             WHERE id = ?1 AND state = 'ringing'",
            params![id.to_string(), encode_ts(started_at)],
        )?;
        Ok(affected > 0)
    }

    /// Move a session into terminal state `to`, but only if it is currently in
    /// one of `from`. Returns `false` if another writer got there first.
    pub fn finish_call_session(
        &self,
        id: SessionId,
        from: &[CallState],
        to: CallState,
        ended_at: DateTime<Utc>,
        duration_seconds: u64,
    ) -> Result<bool> {
        debug_assert!(to.is_terminal());
        if from.is_empty() {
            return Ok(false);
        }

        let id = id.to_string();
        let to_name = to.as_str();
        let ended = encode_ts(ended_at);
        let duration = duration_seconds as i64;
        let from_names: Vec<&'static str> = from.iter().map(|s| s.as_str()).collect();

        let mut values: Vec<&dyn ToSql> = Vec::with_capacity(4 + from_names.len());
        values.push(&id);
        values.push(&to_name);
        values.push(&ended);
        values.push(&duration);
        for name in &from_names {
            values.push(name);
        }

        let sql = format!(
            "UPDATE call_sessions
             SET state = ?2, ended_at = ?3, duration_seconds = ?4
             WHERE id = ?1 AND state IN ({})",
            placeholders(5, from_names.len())
        );
        let affected = self.conn().execute(&sql, values.as_slice())?;
        Ok(affected > 0)
    }

    /// Force every ringing/ongoing session touching `user` to `ended` with a
    /// zero duration. Returns the number of sessions changed.
    pub fn end_active_sessions_for_user(
        &self,
        user: UserId,
        ended_at: DateTime<Utc>,
    ) -> Result<usize> {
        let affected = self.conn().execute(
            "UPDATE call_sessions
             SET state = 'ended', ended_at = ?2, duration_seconds = 0
             WHERE state IN ('ringing', 'ongoing')
               AND (caller_id = ?1 OR receiver_id = ?1)",
            params![user.to_string(), encode_ts(ended_at)],
        )?;
        Ok(affected)
    }

    /// Mark every session still ringing since before `cutoff` as missed.
    pub fn expire_ringing_sessions(
        &self,
        cutoff: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<usize> {
        let affected = self.conn().execute(
            "UPDATE call_sessions
             SET state = 'missed', ended_at = ?2
             WHERE state = 'ringing' AND created_at < ?1",
            params![encode_ts(cutoff), encode_ts(now)],
        )?;
        Ok(affected)
    }

    /// Most recent sessions where `user` is caller or receiver, newest first,
    /// joined with both participants' display fields.
    pub fn call_history_for_user(&self, user: UserId, limit: u32) -> Result<Vec<CallHistoryEntry>> {
        let mut stmt = self.conn().prepare(&format!(
            "SELECT {SESSION_COLUMNS},
                    c.display_name, c.avatar, r.display_name, r.avatar
             FROM call_sessions s
             JOIN users c ON c.id = s.caller_id
             JOIN users r ON r.id = s.receiver_id
             WHERE s.caller_id = ?1 OR s.receiver_id = ?1
             ORDER BY s.created_at DESC, s.rowid DESC
             LIMIT ?2"
        ))?;

        let rows = stmt.query_map(params![user.to_string(), limit], |row| {
            let session = row_to_session(row)?;
            let caller = UserProfile {
                id: session.caller_id,
                display_name: row.get(9)?,
                avatar: row.get(10)?,
            };
            let receiver = UserProfile {
                id: session.receiver_id,
                display_name: row.get(11)?,
                avatar: row.get(12)?,
            };
            Ok(CallHistoryEntry {
                session,
                caller,
                receiver,
            })
        })?;

        let mut entries = Vec::new();
        for row in rows {
            entries.push(row?);
        }
        Ok(entries)
    }
}

/// `?n, ?n+1, ...` for `count` parameters.
fn placeholders(first: usize, count: usize) -> String {
    (first..first + count)
        .map(|i| format!("?{i}"))
        .collect::<Vec<_>>()
        .join(", ")
}

fn row_to_session(row: &rusqlite::Row<'_>) -> rusqlite::Result<CallSession> {
    let id_str: String = row.get(0)?;
    let caller_str: String = row.get(1)?;
    let receiver_str: String = row.get(2)?;
    let kind_str: String = row.get(3)?;
    let state_str: String = row.get(4)?;
    let started_str: Option<String> = row.get(5)?;
    let ended_str: Option<String> = row.get(6)?;
    let duration: i64 = row.get(7)?;
    let created_str: String = row.get(8)?;

    let id = Uuid::parse_str(&id_str).map_err(|e| conversion_failure(0, e))?;
    let caller = Uuid::parse_str(&caller_str).map_err(|e| conversion_failure(1, e))?;
    let receiver = Uuid::parse_str(&receiver_str).map_err(|e| conversion_failure(2, e))?;
    let kind: CallKind = kind_str.parse().map_err(|e| conversion_failure(3, e))?;
    let state: CallState = state_str.parse().map_err(|e| conversion_failure(4, e))?;

    Ok(CallSession {
        id: SessionId(id),
        caller_id: UserId(caller),
        receiver_id: UserId(receiver),
        kind,
        state,
        started_at: started_str.map(|s| decode_ts(5, &s)).transpose()?,
        ended_at: ended_str.map(|s| decode_ts(6, &s)).transpose()?,
        duration_seconds: duration.max(0) as u64,
        created_at: decode_ts(8, &created_str)?,
    })
}
