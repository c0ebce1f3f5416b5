//! Spinlock used to share the controller with an interrupt handler.
//!
//! Acquisition is a single atomic swap. The interrupt side only ever calls
//! `try_lock`, so it never spins on a lock held by the code it preempted.

use core::cell::UnsafeCell;
use core::hint::spin_loop;
use core::ops::{Deref, DerefMut};
use core::sync::atomic::{AtomicU32, Ordering};

// Lock states as u32 so targets without byte atomics still get a word swap.
const UNLOCKED: u32 = 0;
const LOCKED: u32 = 1;

/// A mutual exclusion primitive based on spinning.
///
/// # Example
///
/// ```
/// use w5100::lock::Spinlock;
///
/// static COUNTER: Spinlock<u64> = Spinlock::new(0);
///
/// fn increment() {
///     let mut guard = COUNTER.lock();
///     *guard += 1;
/// }
/// ```
pub struct Spinlock<T> {
    locked: AtomicU32,
    data: UnsafeCell<T>,
}

// Safety: Spinlock provides synchronized access to T
unsafe impl<T: Send> Sync for Spinlock<T> {}
unsafe impl<T: Send> Send for Spinlock<T> {}

impl<T> Spinlock<T> {
    /// Create a new spinlock wrapping the given value.
    pub const fn new(data: T) -> Self {
        Self {
            locked: AtomicU32::new(UNLOCKED),
            data: UnsafeCell::new(data),
        }
    }

    /// Acquire the lock, blocking until available.
    #[inline]
    pub fn lock(&self) -> SpinlockGuard<'_, T> {
        loop {
            if let Some(guard) = self.try_lock() {
                return guard;
            }
            while self.is_locked() {
                spin_loop();
            }
        }
    }

    /// Try to acquire the lock without blocking.
    ///
    /// Returns `Some(guard)` if successful, `None` if lock is held.
    #[inline]
    pub fn try_lock(&self) -> Option<SpinlockGuard<'_, T>> {
        if self.locked.swap(LOCKED, Ordering::Acquire) == UNLOCKED {
            Some(SpinlockGuard {
                lock: self,
                _not_send: core::marker::PhantomData,
            })
        } else {
            None
        }
    }

    pub fn is_locked(&self) -> bool {
        self.locked.load(Ordering::Relaxed) != UNLOCKED
    }

    /// Consume the lock and return the protected value.
    pub fn into_inner(self) -> T {
        self.data.into_inner()
    }
}

/// RAII guard that releases the spinlock when dropped.
pub struct SpinlockGuard<'a, T> {
    lock: &'a Spinlock<T>,
    _not_send: core::marker::PhantomData<*const ()>,
}

impl<T> Deref for SpinlockGuard<'_, T> {
    type Target = T;

    #[inline]
    fn deref(&self) -> &T {
        // Safety: We hold the lock, so exclusive access is guaranteed
        unsafe { &*self.lock.data.get() }
    }
}

impl<T> DerefMut for SpinlockGuard<'_, T> {
    #[inline]
    fn deref_mut(&mut self) -> &mut T {
        // Safety: We hold the lock exclusively
        unsafe { &mut *self.lock.data.get() }
    }
}

impl<T> Drop for SpinlockGuard<'_, T> {
    #[inline]
    fn drop(&mut self) {
        self.lock.locked.swap(UNLOCKED, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use alloc::vec;

    use super::*;

    #[test]
    fn test_spinlock_basic() {
        let lock = Spinlock::new(42);
        {
            let mut guard = lock.lock();
            assert_eq!(*guard, 42);
            *guard = 100;
        }
        {
            let guard = lock.lock();
            assert_eq!(*guard, 100);
        }
    }

    #[test]
    fn test_spinlock_try_lock() {
        let lock = Spinlock::new(vec![1u8]);

        let guard = lock.try_lock();
        assert!(guard.is_some());
        assert!(lock.is_locked());

        // Held: the interrupt-side path must not get in
        assert!(lock.try_lock().is_none());

        drop(guard);
        assert!(!lock.is_locked());
        assert!(lock.try_lock().is_some());
    }

    #[test]
    fn test_into_inner() {
        let lock = Spinlock::new(vec![1, 2]);
        lock.lock().push(3);
        assert_eq!(lock.into_inner(), vec![1, 2, 3]);
    }
}
