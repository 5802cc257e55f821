//! Server configuration constants.
//!
//! Centralizes hardcoded values for easier configuration and documentation.

/// Default listen address (localhost only).
pub const DEFAULT_BIND_ADDRESS: &str = "127.0.0.1:7878";

/// Directory under the platform config dir holding `server.ron`.
pub const CONFIG_DIR_NAME: &str = "kioku";

pub const CONFIG_FILE_NAME: &str = "server.ron";

/// Header carrying the authenticated owner id (set by a fronting proxy).
pub const OWNER_HEADER: &str = "x-kioku-owner";

/// Header naming the human reviewer; defaults to the owner.
pub const REVIEWER_HEADER: &str = "x-kioku-reviewer";

/// History entries returned when `limit` is absent.
pub const DEFAULT_HISTORY_LIMIT: usize = 50;

/// Upper bound on `limit` for history.
pub const MAX_HISTORY_LIMIT: usize = 1000;

/// `Retry-After` seconds sent with 503 Busy.
pub const BUSY_RETRY_AFTER_SECS: u64 = 1;
