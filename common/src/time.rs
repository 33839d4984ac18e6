//! Time utilities and constants for the ledger.

use chrono::{DateTime, Utc};
use std::time::Duration;

/// Timing constants.
pub mod constants {
    use super::Duration;

    /// Default bound on a row-lock wait.
    pub fn default_lock_timeout() -> Duration {
        Duration::from_secs(5)
    }

    /// Largest lock wait a configuration may request.
    pub fn max_lock_timeout() -> Duration {
        Duration::from_secs(60)
    }
}

/// A timestamp with timezone (always UTC).
pub type Timestamp = DateTime<Utc>;

/// Get the current timestamp.
pub fn now() -> Timestamp {
    Utc::now()
}

/// Convert a duration to whole milliseconds, saturating.
pub fn duration_ms(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}
