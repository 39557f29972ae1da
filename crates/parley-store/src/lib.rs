//! # parley-store
//!
//! SQLite persistence for Parley: the user directory (read side of the
//! external profile subsystem) and the durable call session record.
//!
//! The crate exposes a synchronous `Database` handle that wraps a
//! `rusqlite::Connection` and provides typed helpers per table. Every state
//! change on a call session is a conditional `UPDATE` guarded by the state it
//! expects to find, so concurrent writers cannot lose each other's updates.

pub mod call_sessions;
pub mod database;
pub mod migrations;
pub mod models;
pub mod users;

mod error;

pub use database::Database;
pub use error::{Result, StoreError};
pub use models::*;
