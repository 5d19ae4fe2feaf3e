//! Spin-based mutual exclusion lock.
//!
//! Uses test-and-test-and-set (TTAS) to reduce cache-line contention.
//! [`SpinLock::lock`] disables preemption for the duration of the critical
//! section; [`SpinLock::lock_nopreempt`] is for nesting inside a region that
//! has already disabled preemption (an outer lock). Recursive acquisition is
//! forbidden and will deadlock.

use core::cell::UnsafeCell;
use core::ops::{Deref, DerefMut};
use core::sync::atomic::{AtomicBool, Ordering};

use crate::sync::preempt;

/// A spin-based mutual exclusion lock.
///
/// Const-constructable so it can be placed in `static` items.
pub struct SpinLock<T> {
    locked: AtomicBool,
    data: UnsafeCell<T>,
}

// SAFETY: The SpinLock ensures exclusive access to `T` via atomic operations.
// `T: Send` is required because the data may be accessed from different CPUs.
unsafe impl<T: Send> Send for SpinLock<T> {}
unsafe impl<T: Send> Sync for SpinLock<T> {}

impl<T> SpinLock<T> {
    /// Creates a new unlocked `SpinLock` wrapping `value`.
    pub const fn new(value: T) -> Self {
        Self {
            locked: AtomicBool::new(false),
            data: UnsafeCell::new(value),
        }
    }

    fn acquire(&self) {
        loop {
            // Fast path: try to acquire directly.
            if self
                .locked
                .compare_exchange_weak(false, true, Ordering::Acquire, Ordering::Relaxed)
                .is_ok()
            {
                return;
            }

            // TTAS: spin on a read (shared cache line) until it looks free.
            while self.locked.load(Ordering::Relaxed) {
                core::hint::spin_loop();
            }
        }
    }

    /// Acquires the lock, disabling preemption for the critical section.
    ///
    /// Returns a [`SpinLockGuard`] that releases the lock (and re-enables
    /// preemption) when dropped.
    pub fn lock(&self) -> SpinLockGuard<'_, T> {
        preempt::disable();
        self.acquire();
        SpinLockGuard {
            lock: self,
            preempt_held: true,
        }
    }

    /// Acquires the lock without touching the preemption count.
    ///
    /// Only valid while preemption is already disabled, i.e. when nesting
    /// under an outer [`lock`](Self::lock).
    pub fn lock_nopreempt(&self) -> SpinLockGuard<'_, T> {
        preempt::assert_disabled();
        self.acquire();
        SpinLockGuard {
            lock: self,
            preempt_held: false,
        }
    }

    /// Attempts to acquire the lock without blocking.
    ///
    /// Returns `Some(guard)` if the lock was acquired, `None` if it was
    /// already held. Useful in panic paths where blocking would deadlock.
    pub fn try_lock(&self) -> Option<SpinLockGuard<'_, T>> {
        preempt::disable();
        if self
            .locked
            .compare_exchange(false, true, Ordering::Acquire, Ordering::Relaxed)
            .is_ok()
        {
            Some(SpinLockGuard {
                lock: self,
                preempt_held: true,
            })
        } else {
            preempt::enable();
            None
        }
    }

    /// Returns a mutable reference to the underlying data without locking.
    ///
    /// # Safety
    ///
    /// The caller must ensure no other code is concurrently accessing the
    /// data (e.g. single-CPU boot, or a panic handler).
    pub unsafe fn force_get(&self) -> &mut T {
        unsafe { &mut *self.data.get() }
    }
}

/// RAII guard that releases the [`SpinLock`] when dropped.
pub struct SpinLockGuard<'a, T> {
    lock: &'a SpinLock<T>,
    preempt_held: bool,
}

impl<T> Deref for SpinLockGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        // SAFETY: The guard guarantees exclusive access while it exists.
        unsafe { &*self.lock.data.get() }
    }
}

impl<T> DerefMut for SpinLockGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        // SAFETY: The guard guarantees exclusive access while it exists.
        unsafe { &mut *self.lock.data.get() }
    }
}

impl<T> Drop for SpinLockGuard<'_, T> {
    fn drop(&mut self) {
        self.lock.locked.store(false, Ordering::Release);
        if self.preempt_held {
            preempt::enable();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lock_unlock() {
        let lock = SpinLock::new(42);
        {
            let guard = lock.lock();
            assert_eq!(*guard, 42);
            assert!(preempt::count() > 0);
        }
        assert_eq!(preempt::count(), 0);
        assert!(lock.try_lock().is_some());
    }

    #[test]
    fn try_lock_fails_when_held() {
        let lock = SpinLock::new(10);
        let _guard = lock.lock();
        assert!(lock.try_lock().is_none());
        // A failed try_lock must not leak a preemption reference.
        assert_eq!(preempt::count(), 1);
    }

    #[test]
    fn mutate_through_guard() {
        let lock = SpinLock::new(0);
        {
            let mut guard = lock.lock();
            *guard = 99;
        }
        assert_eq!(*lock.lock(), 99);
    }

    #[test]
    fn nopreempt_nesting() {
        let outer = SpinLock::new(());
        let inner = SpinLock::new(5);
        let _og = outer.lock();
        {
            let ig = inner.lock_nopreempt();
            assert_eq!(*ig, 5);
            assert_eq!(preempt::count(), 1);
        }
        assert_eq!(preempt::count(), 1);
    }
}
