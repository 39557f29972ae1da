use thiserror::Error;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("sqlite: {0}")]
    Sqlite(#[from] rusqlite::Error),

    /// The database directory could not be created.
    #[error("io: {0}")]
    Io(#[from] std::io::Error),

    /// The requested user or call session does not exist.
    #[error("no such record")]
    NotFound,

    #[error("migration v{version:03} failed: {reason}")]
    Migration { version: u32, reason: String },

    /// The file was written by a newer build; refuse to touch it.
    #[error("schema version {found} is newer than supported version {supported}")]
    SchemaTooNew { found: u32, supported: u32 },
}

pub type Result<T> = std::result::Result<T, StoreError>;

/// `QueryReturnedNoRows` from a single-row lookup means the id is unknown.
pub(crate) fn not_found_or(e: rusqlite::Error) -> StoreError {
    match e {
        rusqlite::Error::QueryReturnedNoRows => StoreError::NotFound,
        other => StoreError::Sqlite(other),
    }
}
