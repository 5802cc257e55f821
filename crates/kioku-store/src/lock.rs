//! Per-block mutual exclusion for commits.
//!
//! One `parking_lot::Mutex` per `(owner_id, label)`, created on first use and
//! kept in a `DashMap`. Acquisition is bounded by a timeout and reports
//! `Busy` instead of waiting forever; callers re-read and resubmit.

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use parking_lot::Mutex;

use kioku_types::BlockKey;

use crate::error::{Result, StoreError};

/// Default bound on waiting for a block's commit lock.
pub const DEFAULT_LOCK_TIMEOUT: Duration = Duration::from_millis(250);

/// Lock table keyed by block.
pub struct BlockLocks {
    locks: DashMap<BlockKey, Arc<Mutex<()>>>,
    timeout: Duration,
}

impl Default for BlockLocks {
    fn default() -> Self {
        Self::new(DEFAULT_LOCK_TIMEOUT)
    }
}

impl BlockLocks {
    pub fn new(timeout: Duration) -> Self {
        Self {
            locks: DashMap::new(),
            timeout,
        }
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    fn handle(&self, key: &BlockKey) -> Arc<Mutex<()>> {
        // Clone the Arc out so the shard guard is released before we block.
        self.locks
            .entry(key.clone())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .value()
            .clone()
    }

    /// Run `f` while holding the lock for `key`.
    pub fn with_lock<T>(&self, key: &BlockKey, f: impl FnOnce() -> Result<T>) -> Result<T> {
        let lock = self.handle(key);
        let Some(_guard) = lock.try_lock_for(self.timeout) else {
            tracing::warn!(block = %key, timeout_ms = self.timeout.as_millis() as u64, "block lock timed out");
            return Err(StoreError::Busy(key.clone()));
        };
        f()
    }

    /// Number of blocks that have ever been locked.
    pub fn len(&self) -> usize {
        self.locks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.locks.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc;
    use std::thread;

    #[test]
    fn test_with_lock_runs_closure() {
        let locks = BlockLocks::default();
        let key = BlockKey::new("u1", "student");
        let out = locks.with_lock(&key, || Ok(42)).unwrap();
        assert_eq!(out, 42);
        assert_eq!(locks.len(), 1);
    }

    #[test]
    fn test_contention_reports_busy() {
        let locks = Arc::new(BlockLocks::new(Duration::from_millis(20)));
        let key = BlockKey::new("u1", "student");

        let (held_tx, held_rx) = mpsc::channel();
        let (release_tx, release_rx) = mpsc::channel::<()>();

        let holder = {
            let locks = Arc::clone(&locks);
            let key = key.clone();
            thread::spawn(move || {
                locks
                    .with_lock(&key, || {
                        held_tx.send(()).unwrap();
                        release_rx.recv().unwrap();
                        Ok(())
                    })
                    .unwrap();
            })
        };

        held_rx.recv().unwrap();
        let err = locks.with_lock(&key, || Ok(())).unwrap_err();
        assert!(matches!(err, StoreError::Busy(k) if k == key));

        release_tx.send(()).unwrap();
        holder.join().unwrap();
        assert!(locks.with_lock(&key, || Ok(())).is_ok());
    }

    #[test]
    fn test_different_blocks_do_not_contend() {
        let locks = Arc::new(BlockLocks::new(Duration::from_millis(20)));
        let a = BlockKey::new("u1", "a");
        let b = BlockKey::new("u1", "b");

        let result = locks.with_lock(&a, || locks.with_lock(&b, || Ok("both")));
        assert_eq!(result.unwrap(), "both");
    }
}
