use rusqlite::{params, OptionalExtension};
use uuid::Uuid;

use crate::database::{conversion_failure, decode_ts, encode_ts, Database};
use crate::error::{not_found_or, Result};
use crate::models::{User, UserId, UserProfile};

impl Database {
    /// Insert a user or refresh its display fields.
    pub fn upsert_user(&self, user: &User) -> Result<()> {
        self.conn().execute(
            "INSERT INTO users (id, display_name, avatar, created_at)
             VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT(id) DO UPDATE SET
                display_name = excluded.display_name,
                avatar       = excluded.avatar",
            params![
                user.id.to_string(),
                user.display_name,
                user.avatar,
                encode_ts(user.created_at),
            ],
        )?;
        Ok(())
    }

    pub fn get_user(&self, id: UserId) -> Result<User> {
        self.conn()
            .query_row(
                "SELECT id, display_name, avatar, created_at FROM users WHERE id = ?1",
                params![id.to_string()],
                row_to_user,
            )
            .map_err(not_found_or)
    }

    pub fn find_user(&self, id: UserId) -> Result<Option<User>> {
        Ok(self
            .conn()
            .query_row(
                "SELECT id, display_name, avatar, created_at FROM users WHERE id = ?1",
                params![id.to_string()],
                row_to_user,
            )
            .optional()?)
    }

    pub fn get_user_profile(&self, id: UserId) -> Result<UserProfile> {
        self.get_user(id).map(|u| u.profile())
    }
}

fn row_to_user(row: &rusqlite::Row<'_>) -> rusqlite::Result<User> {
    let id_str: String = row.get(0)?;
    let display_name: String = row.get(1)?;
    let avatar: Option<String> = row.get(2)?;
    let created_str: String = row.get(3)?;

    let id = Uuid::parse_str(&id_str).map_err(|e| conversion_failure(0, e))?;

    Ok(User {
        id: UserId(id),
        display_name,
        avatar,
        created_at: decode_ts(3, &created_str)?,
    })
}
