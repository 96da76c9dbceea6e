//! Fiber-aware Mutex
//!
//! Blocks the calling fiber instead of the worker thread: a contended
//! `lock()` parks the fiber on the mutex's blocking list and lets the
//! scheduler run something else until the holder unlocks.

use crate::error::RuntimeResult;
use crate::scheduler::{current_fiber, park, wake};
use crate::sync::wait_list::{WaitList, WaitNode};
use crate::sync::{MutexGuard, SpinLock};
use std::cell::UnsafeCell;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};

/// Mutual exclusion for fibers, guarding a value of type `T`
///
/// Not fair: a fiber woken by `unlock` retries and may lose to a fiber that
/// arrived later. Use [`Lock`](crate::sync::Lock) for FIFO ordering.
pub struct Mutex<T: ?Sized> {
    held: AtomicBool,

    /// Fibers parked in `lock()`, oldest first
    blocking: SpinLock<WaitList>,

    value: UnsafeCell<T>,
}

unsafe impl<T: ?Sized + Send> Send for Mutex<T> {}
unsafe impl<T: ?Sized + Send> Sync for Mutex<T> {}

impl<T> Mutex<T> {
    /// Create an unlocked mutex
    pub fn new(value: T) -> Self {
        Self {
            held: AtomicBool::new(false),
            blocking: SpinLock::new(WaitList::new()),
            value: UnsafeCell::new(value),
        }
    }

    /// Consume the mutex, returning the value
    pub fn into_inner(self) -> T {
        self.value.into_inner()
    }
}

impl<T: ?Sized> Mutex<T> {
    fn try_acquire(&self) -> bool {
        self.held
            .compare_exchange(false, true, Ordering::Acquire, Ordering::Relaxed)
            .is_ok()
    }

    /// Acquire without blocking. Works on any thread.
    pub fn try_lock(&self) -> Option<MutexGuard<'_, T>> {
        self.try_acquire().then(|| MutexGuard::new(self))
    }

    /// Acquire the mutex, suspending the calling fiber while it is held.
    ///
    /// Uncontended, this is a single CAS and works on any thread; waiting
    /// requires a fiber and fails with `NotInFiber` elsewhere.
    pub fn lock(&self) -> RuntimeResult<MutexGuard<'_, T>> {
        if let Some(guard) = self.try_lock() {
            return Ok(guard);
        }

        let node = WaitNode::new(current_fiber()?);
        loop {
            {
                let mut blocking = self.blocking.lock();
                if self.try_acquire() {
                    // Still listed after a wakeup that did not come from
                    // `unlock`.
                    unsafe { blocking.remove(&node) };
                    return Ok(MutexGuard::new(self));
                }
                unsafe { blocking.push_back(&node) };
            }
            if let Err(err) = park() {
                unsafe { self.blocking.lock().remove(&node) };
                return Err(err);
            }
        }
    }

    /// Release the mutex and wake one blocked fiber.
    ///
    /// The held flag is cleared under the spin lock, so a locker that just
    /// failed its CAS is either on the list or will see the mutex free.
    pub(crate) fn unlock(&self) {
        let next = {
            let mut blocking = self.blocking.lock();
            self.held.store(false, Ordering::Release);
            blocking.pop_front()
        };
        if let Some(fiber) = next {
            wake(fiber);
        }
    }

    /// Whether the mutex is held
    pub fn is_locked(&self) -> bool {
        self.held.load(Ordering::Acquire)
    }

    /// Mutable access without locking; the borrow proves exclusivity
    pub fn get_mut(&mut self) -> &mut T {
        self.value.get_mut()
    }

    pub(crate) fn data_ptr(&self) -> *mut T {
        self.value.get()
    }
}

impl<T: Default> Default for Mutex<T> {
    fn default() -> Self {
        Self::new(T::default())
    }
}

impl<T: ?Sized + fmt::Debug> fmt::Debug for Mutex<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut d = f.debug_struct("Mutex");
        match self.try_lock() {
            Some(guard) => d.field("value", &&*guard),
            None => d.field("value", &format_args!("<locked>")),
        };
        d.finish()
    }
}
