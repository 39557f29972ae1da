use std::sync::Arc;

use tokio::sync::Mutex;

use parley_store::Database;

/// Process-wide handle on the call database.
///
/// `rusqlite::Connection` is not `Sync`, so access is funnelled through one
/// async mutex. Each closure is a single store operation; none is held across
/// a notification send.
#[derive(Clone)]
pub struct CallStore {
    db: Arc<Mutex<Database>>,
}

impl CallStore {
    pub fn new(db: Database) -> Self {
        Self {
            db: Arc::new(Mutex::new(db)),
        }
    }

    pub async fn with<T, F>(&self, op: F) -> parley_store::Result<T>
    where
        F: FnOnce(&Database) -> parley_store::Result<T>,
    {
        let db = self.db.lock().await;
        op(&db)
    }
}
