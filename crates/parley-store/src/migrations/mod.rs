//! Schema migrations, tracked through `PRAGMA user_version`.

pub mod v001_initial;

use rusqlite::Connection;

use crate::error::{Result, StoreError};

type Step = fn(&Connection) -> rusqlite::Result<()>;

/// Ordered list of `(version, name, step)`. Append only.
const STEPS: &[(u32, &str, Step)] = &[(1, "initial", v001_initial::up)];

fn latest() -> u32 {
    STEPS.last().map(|(version, _, _)| *version).unwrap_or(0)
}

fn user_version(conn: &Connection) -> Result<u32> {
    Ok(conn.pragma_query_value(None, "user_version", |row| row.get(0))?)
}

/// Bring the schema up to date. Each step runs in its own transaction
/// together with the version bump.
pub fn run_migrations(conn: &Connection) -> Result<()> {
    let found = user_version(conn)?;
    if found > latest() {
        return Err(StoreError::SchemaTooNew {
            found,
            supported: latest(),
        });
    }

    for (version, name, step) in STEPS.iter().filter(|(v, _, _)| *v > found) {
        tracing::info!(version, name, "applying call store migration");

        let apply = || -> rusqlite::Result<()> {
            let tx = conn.unchecked_transaction()?;
            step(&tx)?;
            tx.pragma_update(None, "user_version", version)?;
            tx.commit()
        };
        apply().map_err(|e| StoreError::Migration {
            version: *version,
            reason: e.to_string(),
        })?;
    }

    Ok(())
}
