//! Server configuration loaded from environment variables.
//!
//! All settings have defaults so the server can start with zero
//! configuration for local development.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use parley_shared::constants::{
    APP_NAME, DEFAULT_HTTP_PORT, HISTORY_LIMIT, REAPER_INTERVAL, RINGING_TIMEOUT,
};

/// Server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Socket address for the HTTP + WebSocket server.
    /// Env: `HTTP_ADDR`
    /// Default: `0.0.0.0:5001`
    pub http_addr: SocketAddr,

    /// SQLite database file.
    /// Env: `DATABASE_PATH`
    /// Default: `./parley.db`
    pub database_path: PathBuf,

    /// How often the reaper sweeps for stale ringing sessions.
    /// Env: `REAPER_INTERVAL_SECS`
    /// Default: 300
    pub reaper_interval: Duration,

    /// How long a session may ring before it is marked missed.
    /// Env: `RINGING_TIMEOUT_SECS`
    /// Default: 3600
    pub ringing_timeout: Duration,

    /// Maximum number of sessions returned by the history endpoint.
    /// Env: `HISTORY_LIMIT`
    /// Default: 50
    pub history_limit: u32,

    /// Origins allowed by CORS. Empty means any origin.
    /// Env: `ALLOWED_ORIGINS` (comma-separated)
    pub allowed_origins: Vec<String>,

    /// Human-readable name reported by `/info`.
    /// Env: `INSTANCE_NAME`
    /// Default: `"Parley"`
    pub instance_name: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            http_addr: ([0, 0, 0, 0], DEFAULT_HTTP_PORT).into(),
            database_path: PathBuf::from("./parley.db"),
            reaper_interval: REAPER_INTERVAL,
            ringing_timeout: RINGING_TIMEOUT,
            history_limit: HISTORY_LIMIT,
            allowed_origins: Vec::new(),
            instance_name: APP_NAME.to_string(),
        }
    }
}

impl ServerConfig {
    /// Load configuration from environment variables, falling back to defaults.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let mut config = Self::default();

        if let Some(addr) = parse_var(&lookup, "HTTP_ADDR") {
            config.http_addr = addr;
        }

        if let Some(path) = lookup("DATABASE_PATH") {
            config.database_path = PathBuf::from(path);
        }

        if let Some(secs) = parse_var::<u64>(&lookup, "REAPER_INTERVAL_SECS") {
            if secs > 0 {
                config.reaper_interval = Duration::from_secs(secs);
            }
        }

        if let Some(secs) = parse_var::<u64>(&lookup, "RINGING_TIMEOUT_SECS") {
            config.ringing_timeout = Duration::from_secs(secs);
        }

        if let Some(limit) = parse_var::<u32>(&lookup, "HISTORY_LIMIT") {
            config.history_limit = limit.clamp(1, HISTORY_LIMIT);
        }

        if let Some(origins) = lookup("ALLOWED_ORIGINS") {
            config.allowed_origins = origins
                .split(',')
                .map(str::trim)
                .filter(|o| !o.is_empty())
                .map(String::from)
                .collect();
        }

        if let Some(name) = lookup("INSTANCE_NAME") {
            config.instance_name = name;
        }

        // RUST_LOG is handled directly by tracing-subscriber's EnvFilter,
        // so we do not store it here.

        config
    }
}

fn parse_var<T: FromStr>(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> Option<T> {
    let raw = lookup(key)?;
    match raw.trim().parse::<T>() {
        Ok(value) => Some(value),
        Err(_) => {
            tracing::warn!(key, value = %raw, "Invalid configuration value, using default");
            None
        }
    }
}
