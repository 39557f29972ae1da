use std::time::Duration;

/// Application name
pub const APP_NAME: &str = "Parley";

/// Maximum number of sessions returned by a history query.
pub const HISTORY_LIMIT: u32 = 50;

/// How long a session may stay ringing before the reaper marks it missed.
pub const RINGING_TIMEOUT: Duration = Duration::from_secs(60 * 60);

/// How often the reaper sweeps.
pub const REAPER_INTERVAL: Duration = Duration::from_secs(5 * 60);

/// How often a client re-checks its call state against the server.
pub const SELF_CHECK_INTERVAL: Duration = Duration::from_secs(30);

/// Header carrying the authenticated user id, set by the upstream auth layer.
pub const USER_ID_HEADER: &str = "x-user-id";

/// Default HTTP port (server)
pub const DEFAULT_HTTP_PORT: u16 = 5001;

/// How long a client holds remote ICE candidates that arrive before the
/// remote description is applied.
pub const CANDIDATE_BUFFER_MAX_AGE: Duration = Duration::from_secs(5);

/// Maximum number of buffered remote ICE candidates per call.
pub const CANDIDATE_BUFFER_CAPACITY: usize = 64;

/// Pause after a pre-call force cleanup before initiating the new call.
pub const CLEANUP_SETTLE_DELAY: Duration = Duration::from_millis(500);

/// Upper bound on one call API request made by the client.
pub const CLIENT_REQUEST_TIMEOUT: Duration = Duration::from_secs(10);
