//! Stale-session reaper.
//!
//! Backstop for calls nobody answered or declined: sessions still ringing
//! after the threshold become `missed`. Ongoing and finished sessions are
//! never touched.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

use parley_store::StoreError;

use crate::clock::Clock;
use crate::store::CallStore;

/// Mark every session ringing since before `now - threshold` as missed.
pub async fn sweep(
    store: &CallStore,
    now: DateTime<Utc>,
    threshold: chrono::Duration,
) -> Result<usize, StoreError> {
    let Some(cutoff) = now.checked_sub_signed(threshold) else {
        warn!(
            threshold_secs = threshold.num_seconds(),
            "Ringing threshold reaches past the earliest timestamp, nothing to expire"
        );
        return Ok(0);
    };
    store
        .with(|db| db.expire_ringing_sessions(cutoff, now))
        .await
}

pub struct Reaper {
    store: CallStore,
    clock: Arc<dyn Clock>,
    interval: Duration,
    threshold: chrono::Duration,
}

impl Reaper {
    pub fn new(
        store: CallStore,
        clock: Arc<dyn Clock>,
        interval: Duration,
        threshold: chrono::Duration,
    ) -> Self {
        Self {
            store,
            clock,
            interval,
            threshold,
        }
    }

    pub async fn run_once(&self) -> Result<usize, StoreError> {
        sweep(&self.store, self.clock.now(), self.threshold).await
    }

    /// Run the sweep forever on the configured interval. A failed sweep is
    /// logged and retried on the next tick.
    pub fn spawn(self) -> JoinHandle<()> {
        info!(
            interval_secs = self.interval.as_secs(),
            threshold_secs = self.threshold.num_seconds(),
            "Starting stale-session reaper"
        );

        tokio::spawn(async move {
            let mut interval = tokio::time::interval(self.interval);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                interval.tick().await;
                match self.run_once().await {
                    Ok(0) => debug!("Reaper sweep found nothing"),
                    Ok(missed) => info!(missed, "Reaper marked stale sessions as missed"),
                    Err(e) => error!(error = %e, "Reaper sweep failed"),
                }
            }
        })
    }
}
