// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use core::fmt;
use core::marker::PhantomData;
use core::ops::{Deref, DerefMut};

use crate::Backoff;
use crate::loom::cell::UnsafeCell;
use crate::loom::sync::atomic::{AtomicBool, Ordering};

/// A test-and-set spin lock protecting shared data.
///
/// Waiters spin with [`Backoff`] rather than blocking, so this lock must only
/// guard critical sections that are a few loads and stores long. Data can only
/// be accessed through the RAII guard returned from [`lock`](SpinLock::lock)
/// and [`try_lock`](SpinLock::try_lock).
pub struct SpinLock<T: ?Sized> {
    locked: AtomicBool,
    data: UnsafeCell<T>,
}

/// An RAII implementation of a "scoped lock" of a [`SpinLock`]. When this
/// structure is dropped (falls out of scope), the lock will be unlocked.
#[clippy::has_significant_drop]
#[must_use = "if unused the SpinLock will immediately unlock"]
pub struct SpinLockGuard<'a, T: ?Sized> {
    lock: &'a SpinLock<T>,
    marker: PhantomData<&'a mut T>,
}

// Safety: protecting data with a lock makes it Sync as long as the data itself
// can be sent between the threads taking the lock
unsafe impl<T: ?Sized + Send> Send for SpinLock<T> {}
// Safety: see above
unsafe impl<T: ?Sized + Send> Sync for SpinLock<T> {}

// === impl SpinLock ===

impl<T> SpinLock<T> {
    #[cfg(not(loom))]
    #[must_use]
    pub const fn new(data: T) -> Self {
        Self {
            locked: AtomicBool::new(false),
            data: UnsafeCell::new(data),
        }
    }

    #[cfg(loom)]
    #[must_use]
    pub fn new(data: T) -> Self {
        Self {
            locked: AtomicBool::new(false),
            data: UnsafeCell::new(data),
        }
    }
}

impl<T: ?Sized> SpinLock<T> {
    /// Acquires the lock, spinning with exponential back-off until it becomes
    /// available.
    pub fn lock(&self) -> SpinLockGuard<'_, T> {
        while self
            .locked
            .compare_exchange(false, true, Ordering::Acquire, Ordering::Relaxed)
            .is_err()
        {
            // Wait for the lock to look free before retrying the atomic
            // exchange; spinning on the load keeps the cache line shared.
            let mut backoff = Backoff::new();
            while self.locked.load(Ordering::Relaxed) {
                backoff.spin();
            }
        }

        SpinLockGuard {
            lock: self,
            marker: PhantomData,
        }
    }

    /// Attempts to acquire this lock without spinning.
    pub fn try_lock(&self) -> Option<SpinLockGuard<'_, T>> {
        self.locked
            .compare_exchange(false, true, Ordering::Acquire, Ordering::Relaxed)
            .is_ok()
            .then_some(SpinLockGuard {
                lock: self,
                marker: PhantomData,
            })
    }
}

impl<T: ?Sized + fmt::Debug> fmt::Debug for SpinLock<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut d = f.debug_struct("SpinLock");
        match self.try_lock() {
            Some(guard) => d.field("data", &&*guard),
            None => d.field("data", &format_args!("<locked>")),
        };
        d.finish()
    }
}

impl<T: Default> Default for SpinLock<T> {
    fn default() -> Self {
        Self::new(T::default())
    }
}

// === impl SpinLockGuard ===

impl<T: ?Sized> Deref for SpinLockGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        // Safety: holding the guard means holding the lock
        self.lock.data.with(|data| unsafe { &*data })
    }
}

impl<T: ?Sized> DerefMut for SpinLockGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        // Safety: holding the guard means holding the lock
        self.lock.data.with_mut(|data| unsafe { &mut *data })
    }
}

impl<T: ?Sized> Drop for SpinLockGuard<'_, T> {
    fn drop(&mut self) {
        self.lock.locked.store(false, Ordering::Release);
    }
}

impl<T: ?Sized + fmt::Debug> fmt::Debug for SpinLockGuard<'_, T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(&**self, f)
    }
}

#[cfg(not(loom))]
// Safety: lock/unlock is delegated to the test-and-set protocol above
unsafe impl lock_api::RawMutex for SpinLock<()> {
    const INIT: SpinLock<()> = SpinLock::new(());

    type GuardMarker = lock_api::GuardSend;

    fn lock(&self) {
        core::mem::forget(SpinLock::lock(self));
    }

    fn try_lock(&self) -> bool {
        SpinLock::try_lock(self).map(core::mem::forget).is_some()
    }

    unsafe fn unlock(&self) {
        self.locked.store(false, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::loom;
    use crate::loom::sync::Arc;
    use crate::loom::thread;

    #[test]
    fn counter_is_consistent() {
        loom::model(|| {
            let lock = Arc::new(SpinLock::new(0_u32));

            let handles: Vec<_> = (0..2)
                .map(|_| {
                    let lock = Arc::clone(&lock);
                    thread::spawn(move || {
                        *lock.lock() += 1;
                    })
                })
                .collect();

            for handle in handles {
                handle.join().unwrap();
            }

            assert_eq!(*lock.lock(), 2);
        });
    }

    #[test]
    fn try_lock_fails_while_held() {
        loom::model(|| {
            let lock = SpinLock::new(());
            let guard = lock.lock();
            assert!(lock.try_lock().is_none());
            drop(guard);
            assert!(lock.try_lock().is_some());
        });
    }

    #[test]
    #[cfg_attr(loom, ignore = "not concurrency-relevant")]
    fn contended_increments() {
        let lock = Arc::new(SpinLock::new(0_u64));
        let handles: Vec<_> = (0..4)
            .map(|_| {
                let lock = Arc::clone(&lock);
                thread::spawn(move || {
                    for _ in 0..1000 {
                        *lock.lock() += 1;
                    }
                })
            })
            .collect();

        for handle in handles {
            handle.join().unwrap();
        }

        assert_eq!(*lock.lock(), 4000);
    }
}
