//! Per-page latch with shared, update, and exclusive modes.
//!
//! Update mode is a read that holds the exclusive-acquisition right: any
//! number of shared holders may coexist with one update holder, and the
//! update holder can upgrade in place without releasing. Tree descent uses
//! this to read a page while keeping the option to modify it.
//!
//! Guards come in borrowed and owned flavors. Owned guards keep the latch
//! alive independently of the `Latch` borrow, which lets a descent carry a
//! pinned page and its latch through loop iterations and return values.

use parking_lot::lock_api::{
    ArcRwLockReadGuard, ArcRwLockUpgradableReadGuard, ArcRwLockWriteGuard,
};
use parking_lot::{
    RawRwLock, RwLock, RwLockReadGuard, RwLockUpgradableReadGuard, RwLockWriteGuard,
};
use std::ops::{Deref, DerefMut};
use std::sync::Arc;

/// A latch protecting one value, usually a buffered page frame.
pub struct Latch<T> {
    lock: Arc<RwLock<T>>,
}

/// Shared-mode guard: concurrent readers allowed.
pub struct SharedGuard<'a, T>(RwLockReadGuard<'a, T>);

/// Update-mode guard: readable now, upgradable to exclusive without a gap.
pub struct UpdateGuard<'a, T>(RwLockUpgradableReadGuard<'a, T>);

/// Exclusive-mode guard: sole access, read and write.
pub struct ExclusiveGuard<'a, T>(RwLockWriteGuard<'a, T>);

/// Owned shared-mode guard.
pub struct OwnedSharedGuard<T>(ArcRwLockReadGuard<RawRwLock, T>);

/// Owned update-mode guard.
pub struct OwnedUpdateGuard<T>(ArcRwLockUpgradableReadGuard<RawRwLock, T>);

/// Owned exclusive-mode guard.
pub struct OwnedExclusiveGuard<T>(ArcRwLockWriteGuard<RawRwLock, T>);

impl<T> Latch<T> {
    /// Creates a latch around `value`.
    pub fn new(value: T) -> Self {
        Self {
            lock: Arc::new(RwLock::new(value)),
        }
    }

    /// Acquires the latch in shared mode, blocking.
    pub fn shared(&self) -> SharedGuard<'_, T> {
        SharedGuard(self.lock.read())
    }

    /// Acquires the latch in update mode, blocking.
    pub fn update(&self) -> UpdateGuard<'_, T> {
        UpdateGuard(self.lock.upgradable_read())
    }

    /// Acquires the latch in exclusive mode, blocking.
    pub fn exclusive(&self) -> ExclusiveGuard<'_, T> {
        ExclusiveGuard(self.lock.write())
    }

    /// Non-blocking exclusive acquisition.
    pub fn try_exclusive(&self) -> Option<ExclusiveGuard<'_, T>> {
        self.lock.try_write().map(ExclusiveGuard)
    }

    /// Shared acquisition returning an owned guard.
    pub fn shared_owned(&self) -> OwnedSharedGuard<T> {
        OwnedSharedGuard(self.lock.read_arc())
    }

    /// Update acquisition returning an owned guard.
    pub fn update_owned(&self) -> OwnedUpdateGuard<T> {
        OwnedUpdateGuard(self.lock.upgradable_read_arc())
    }

    /// Exclusive acquisition returning an owned guard.
    pub fn exclusive_owned(&self) -> OwnedExclusiveGuard<T> {
        OwnedExclusiveGuard(self.lock.write_arc())
    }
}

impl<'a, T> UpdateGuard<'a, T> {
    /// Converts the update hold into an exclusive one without releasing.
    pub fn upgrade(self) -> ExclusiveGuard<'a, T> {
        ExclusiveGuard(RwLockUpgradableReadGuard::upgrade(self.0))
    }
}

impl<T> OwnedUpdateGuard<T> {
    /// Converts the update hold into an exclusive one without releasing.
    pub fn upgrade(self) -> OwnedExclusiveGuard<T> {
        OwnedExclusiveGuard(ArcRwLockUpgradableReadGuard::upgrade(self.0))
    }
}

macro_rules! impl_deref {
    ($name:ident) => {
        impl<T> Deref for $name<'_, T> {
            type Target = T;
            fn deref(&self) -> &T {
                &self.0
            }
        }
    };
    (owned $name:ident) => {
        impl<T> Deref for $name<T> {
            type Target = T;
            fn deref(&self) -> &T {
                &self.0
            }
        }
    };
}

impl_deref!(SharedGuard);
impl_deref!(UpdateGuard);
impl_deref!(ExclusiveGuard);
impl_deref!(owned OwnedSharedGuard);
impl_deref!(owned OwnedUpdateGuard);
impl_deref!(owned OwnedExclusiveGuard);

impl<T> DerefMut for ExclusiveGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        &mut self.0
    }
}

impl<T> DerefMut for OwnedExclusiveGuard<T> {
    fn deref_mut(&mut self) -> &mut T {
        &mut self.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::thread;
    use std::time::Duration;

    #[test]
    fn shared_holders_stack() {
        let latch = Latch::new(5u32);
        let a = latch.shared();
        let b = latch.shared();
        assert_eq!(*a + *b, 10);
    }

    #[test]
    fn update_upgrades_in_place() {
        let latch = Latch::new(vec![1u8]);
        let guard = latch.update();
        assert_eq!(guard.len(), 1);
        let mut write = guard.upgrade();
        write.push(2);
        assert_eq!(*write, vec![1, 2]);
    }

    #[test]
    fn owned_guard_outlives_latch_borrow() {
        let latch = Latch::new(String::from("pinned"));
        let guard = {
            let borrowed = &latch;
            borrowed.shared_owned()
        };
        assert_eq!(&*guard, "pinned");
    }

    #[test]
    fn exclusive_blocks_shared() {
        let latch = Arc::new(Latch::new(0u64));
        let entered = Arc::new(AtomicBool::new(false));

        let guard = latch.exclusive_owned();
        let latch2 = Arc::clone(&latch);
        let entered2 = Arc::clone(&entered);
        let reader = thread::spawn(move || {
            let _g = latch2.shared();
            entered2.store(true, Ordering::SeqCst);
        });
        thread::sleep(Duration::from_millis(50));
        assert!(!entered.load(Ordering::SeqCst), "reader must wait for writer");
        drop(guard);
        reader.join().unwrap();
        assert!(entered.load(Ordering::SeqCst));
    }

    #[test]
    fn update_allows_concurrent_shared() {
        let latch = Latch::new(7u32);
        let upd = latch.update();
        let shr = latch.shared();
        assert_eq!(*upd, *shr);
    }
}
