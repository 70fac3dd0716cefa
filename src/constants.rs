use std::time::Duration;

/// Drift beyond this many seconds triggers a hard correction.
pub const DRIFT_THRESHOLD_SECS: f64 = 2.0;

/// Chat ring buffer capacity; older entries are evicted silently.
pub const CHAT_CAPACITY: usize = 100;

/// Maximum chat message length accepted from the local user.
pub const MAX_CHAT_LEN: usize = 500;

/// How long an emoji reaction stays visible before it is pruned.
pub const REACTION_TTL: Duration = Duration::from_secs(3);

/// Reconnect attempts allowed before the session is declared dead.
pub const MAX_RECONNECT_ATTEMPTS: u32 = 5;

/// Base reconnect delay; the actual delay is `attempt * base`.
pub const RECONNECT_BASE_DELAY: Duration = Duration::from_secs(2);

/// WebSocket keep-alive ping interval.
pub const KEEPALIVE_INTERVAL: Duration = Duration::from_secs(12);

/// How often expired reactions are swept out of the state.
pub const REACTION_SWEEP_INTERVAL: Duration = Duration::from_secs(1);

/// How often the local playback position is reported to the server.
pub const TIME_REPORT_INTERVAL: Duration = Duration::from_secs(5);

/// Playback rates closer than this are considered equal.
pub const RATE_EPSILON: f64 = 0.01;
