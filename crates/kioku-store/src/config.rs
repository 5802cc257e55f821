//! Tunables for locking and approval retries.

use std::time::Duration;

use crate::lock::DEFAULT_LOCK_TIMEOUT;

/// Default number of approval attempts before surfacing `Busy`.
pub const DEFAULT_BUSY_RETRIES: u32 = 3;

/// Default base backoff between approval attempts (grows linearly).
pub const DEFAULT_RETRY_BACKOFF: Duration = Duration::from_millis(20);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StoreConfig {
    /// Bound on waiting for a block's lock.
    pub lock_timeout: Duration,
    /// Attempts for a contended approval, and for the post-commit status write.
    pub busy_retries: u32,
    pub retry_backoff: Duration,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            lock_timeout: DEFAULT_LOCK_TIMEOUT,
            busy_retries: DEFAULT_BUSY_RETRIES,
            retry_backoff: DEFAULT_RETRY_BACKOFF,
        }
    }
}

impl StoreConfig {
    /// Backoff before attempt `attempt + 1` (1-based `attempt`).
    pub fn backoff(&self, attempt: u32) -> Duration {
        self.retry_backoff * attempt
    }

    /// Always at least one attempt.
    pub fn attempts(&self) -> u32 {
        self.busy_retries.max(1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let c = StoreConfig::default();
        assert_eq!(c.lock_timeout, Duration::from_millis(250));
        assert_eq!(c.busy_retries, 3);
        assert_eq!(c.backoff(2), Duration::from_millis(40));
    }

    #[test]
    fn test_attempts_never_zero() {
        let c = StoreConfig {
            busy_retries: 0,
            ..StoreConfig::default()
        };
        assert_eq!(c.attempts(), 1);
    }
}
