//! Short spin lock protecting the internal lists of the primitives
//!
//! Acquisition tries one test-and-set, then backs off: exponential busy
//! spinning first, yielding the thread once that is exhausted. Critical
//! sections must stay O(1) and never suspend a fiber while the guard is
//! alive.

use crossbeam::utils::Backoff;
use std::cell::UnsafeCell;
use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicBool, Ordering};

/// Test-and-set spin lock
pub struct SpinLock<T> {
    locked: AtomicBool,
    value: UnsafeCell<T>,
}

unsafe impl<T: Send> Send for SpinLock<T> {}
unsafe impl<T: Send> Sync for SpinLock<T> {}

impl<T> SpinLock<T> {
    /// Create an unlocked spin lock
    pub const fn new(value: T) -> Self {
        Self {
            locked: AtomicBool::new(false),
            value: UnsafeCell::new(value),
        }
    }

    /// Acquire the lock
    pub fn lock(&self) -> SpinGuard<'_, T> {
        // fast path: uncontended
        if self.try_acquire() {
            return SpinGuard { lock: self };
        }

        let backoff = Backoff::new();
        while !self.try_acquire() {
            backoff.snooze();
        }
        SpinGuard { lock: self }
    }

    /// Acquire the lock if it is free
    pub fn try_lock(&self) -> Option<SpinGuard<'_, T>> {
        self.try_acquire().then_some(SpinGuard { lock: self })
    }

    /// Mutable access without locking
    pub fn get_mut(&mut self) -> &mut T {
        self.value.get_mut()
    }

    #[inline]
    fn try_acquire(&self) -> bool {
        !self.locked.load(Ordering::Relaxed) && !self.locked.swap(true, Ordering::Acquire)
    }
}

impl<T: Default> Default for SpinLock<T> {
    fn default() -> Self {
        Self::new(T::default())
    }
}

/// Releases the [`SpinLock`] on drop
pub struct SpinGuard<'a, T> {
    lock: &'a SpinLock<T>,
}

impl<T> Deref for SpinGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        unsafe { &*self.lock.value.get() }
    }
}

impl<T> DerefMut for SpinGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        unsafe { &mut *self.lock.value.get() }
    }
}

impl<T> Drop for SpinGuard<'_, T> {
    fn drop(&mut self) {
        self.lock.locked.store(false, Ordering::Release);
    }
}
