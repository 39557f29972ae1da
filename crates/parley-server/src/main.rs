//! # parley-server
//!
//! Call-signaling server for one-to-one audio/video calls.
//!
//! This binary provides:
//! - **REST API** (axum) to initiate, answer, decline and end calls, plus
//!   status, history and a force-cleanup escape hatch
//! - **WebSocket gateway** carrying presence updates, call notifications and
//!   relayed offer/answer/ICE signals between the two participants
//! - **Reaper** that marks calls left ringing for too long as missed
//!
//! Media never passes through the server; signaling payloads are relayed
//! without being inspected.

mod api;
mod clock;
mod config;
mod coordinator;
mod error;
mod gateway;
mod presence;
mod reaper;
mod relay;
mod store;

use std::sync::Arc;

use tracing::info;
use tracing_subscriber::EnvFilter;

use parley_store::Database;

use crate::api::AppState;
use crate::clock::{Clock, SystemClock};
use crate::config::ServerConfig;
use crate::coordinator::CallCoordinator;
use crate::presence::PresenceRegistry;
use crate::reaper::Reaper;
use crate::relay::SignalRelay;
use crate::store::CallStore;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // -----------------------------------------------------------------------
    // 1. Initialize tracing (respects RUST_LOG env var)
    // -----------------------------------------------------------------------
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("info,parley_server=debug")),
        )
        .init();

    info!("Starting Parley signaling server v{}", env!("CARGO_PKG_VERSION"));

    // -----------------------------------------------------------------------
    // 2. Load configuration
    // -----------------------------------------------------------------------
    let config = ServerConfig::from_env();
    info!(?config, "Loaded configuration");

    // -----------------------------------------------------------------------
    // 3. Initialize subsystems
    // -----------------------------------------------------------------------
    let db = Database::open_at(&config.database_path)?;
    info!(path = %config.database_path.display(), "Opened call database");

    let store = CallStore::new(db);
    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let presence = PresenceRegistry::new();
    let relay = SignalRelay::new();
    let coordinator = CallCoordinator::new(
        store.clone(),
        presence.clone(),
        clock.clone(),
        config.history_limit,
    );

    let app_state = AppState {
        coordinator,
        presence: presence.clone(),
        relay,
        config: Arc::new(config.clone()),
    };

    // -----------------------------------------------------------------------
    // 4. Spawn background tasks
    // -----------------------------------------------------------------------
    let ringing_timeout = chrono::Duration::from_std(config.ringing_timeout)?;
    let reaper = Reaper::new(store, clock, config.reaper_interval, ringing_timeout).spawn();

    // -----------------------------------------------------------------------
    // 5. Run the HTTP + WebSocket server (blocks until shutdown)
    // -----------------------------------------------------------------------
    tokio::select! {
        result = api::serve(app_state, config.http_addr) => {
            if let Err(e) = result {
                tracing::error!(error = %e, "HTTP server failed");
                return Err(e);
            }
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Received Ctrl+C, shutting down");
        }
    }

    reaper.abort();
    presence.shutdown().await;

    Ok(())
}
