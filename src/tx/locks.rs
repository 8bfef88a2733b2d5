//! Transaction-duration lock table.
//!
//! Locks are keyed by opaque byte strings and held until the owning
//! transaction completes. Collaborating layers (catalog, dictionary) lock
//! their own key spaces through this table; the B-link tree itself relies on
//! page latches only. Deadlocks are resolved by timeout, not detection.

use std::collections::{HashMap, HashSet};
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

use crate::types::{Result, TxError, TxId};

/// Requested lock strength.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum LockMode {
    /// Compatible with other shared holders.
    Shared,
    /// Sole holder.
    Exclusive,
}

#[derive(Default)]
struct LockEntry {
    shared: HashSet<TxId>,
    exclusive: Option<TxId>,
}

impl LockEntry {
    fn grantable(&self, tx: TxId, mode: LockMode) -> bool {
        match mode {
            LockMode::Shared => self.exclusive.is_none() || self.exclusive == Some(tx),
            LockMode::Exclusive => {
                let other_shared = self.shared.iter().any(|&holder| holder != tx);
                let other_exclusive = self.exclusive.is_some() && self.exclusive != Some(tx);
                !other_shared && !other_exclusive
            }
        }
    }

    fn grant(&mut self, tx: TxId, mode: LockMode) {
        match mode {
            LockMode::Shared => {
                if self.exclusive != Some(tx) {
                    self.shared.insert(tx);
                }
            }
            LockMode::Exclusive => {
                self.shared.remove(&tx);
                self.exclusive = Some(tx);
            }
        }
    }

    fn is_free(&self) -> bool {
        self.shared.is_empty() && self.exclusive.is_none()
    }
}

/// Shared/exclusive lock table with timeout-based deadlock resolution.
pub struct LockTable {
    state: Mutex<HashMap<Vec<u8>, LockEntry>>,
    released: Condvar,
    timeout: Duration,
}

impl LockTable {
    /// Creates a table whose acquisitions give up after `timeout`.
    pub fn new(timeout: Duration) -> Self {
        Self {
            state: Mutex::new(HashMap::new()),
            released: Condvar::new(),
            timeout,
        }
    }

    /// Acquires `key` in the requested mode for `tx`, waiting for conflicting
    /// holders up to the timeout. Re-acquisition and shared-to-exclusive
    /// upgrade by a sole holder succeed immediately.
    pub fn acquire(&self, tx: TxId, key: &[u8], mode: LockMode) -> Result<()> {
        let deadline = Instant::now() + self.timeout;
        let mut state = self.state.lock();
        loop {
            let entry = state.entry(key.to_vec()).or_default();
            if entry.grantable(tx, mode) {
                entry.grant(tx, mode);
                return Ok(());
            }
            if self.released.wait_until(&mut state, deadline).timed_out() {
                return Err(TxError::LockTimeout.into());
            }
        }
    }

    /// Releases everything `tx` holds. Called exactly once at commit or
    /// rollback completion.
    pub fn release_all(&self, tx: TxId) {
        let mut state = self.state.lock();
        state.retain(|_, entry| {
            entry.shared.remove(&tx);
            if entry.exclusive == Some(tx) {
                entry.exclusive = None;
            }
            !entry.is_free()
        });
        drop(state);
        self.released.notify_all();
    }

    /// Number of keys currently locked; diagnostics only.
    pub fn locked_keys(&self) -> usize {
        self.state.lock().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    fn table() -> LockTable {
        LockTable::new(Duration::from_millis(100))
    }

    #[test]
    fn shared_locks_stack_and_block_exclusive() {
        let locks = table();
        locks.acquire(TxId(1), b"k", LockMode::Shared).unwrap();
        locks.acquire(TxId(2), b"k", LockMode::Shared).unwrap();
        let err = locks.acquire(TxId(3), b"k", LockMode::Exclusive).unwrap_err();
        assert!(matches!(
            err,
            crate::types::StoreError::Tx(TxError::LockTimeout)
        ));
    }

    #[test]
    fn release_wakes_waiter() {
        let locks = Arc::new(LockTable::new(Duration::from_secs(5)));
        locks.acquire(TxId(1), b"k", LockMode::Exclusive).unwrap();
        let locks2 = Arc::clone(&locks);
        let waiter = thread::spawn(move || locks2.acquire(TxId(2), b"k", LockMode::Exclusive));
        thread::sleep(Duration::from_millis(50));
        locks.release_all(TxId(1));
        waiter.join().unwrap().unwrap();
    }

    #[test]
    fn sole_holder_upgrades() {
        let locks = table();
        locks.acquire(TxId(1), b"k", LockMode::Shared).unwrap();
        locks.acquire(TxId(1), b"k", LockMode::Exclusive).unwrap();
        // Still blocks others.
        assert!(locks.acquire(TxId(2), b"k", LockMode::Shared).is_err());
        locks.release_all(TxId(1));
        locks.acquire(TxId(2), b"k", LockMode::Shared).unwrap();
    }
}
