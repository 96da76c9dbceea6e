//! Condition variable for fibers

use crate::error::RuntimeResult;
use crate::scheduler::{current_fiber, park, wake};
use crate::sync::wait_list::{WaitList, WaitNode};
use crate::sync::{MutexGuard, SpinLock};
use std::fmt;

/// Condition variable paired with a [`Mutex`](crate::sync::Mutex)
///
/// Waiting suspends the fiber, never the worker thread. Wakeups may be
/// spurious; wait in a loop on the guarded predicate, or use
/// [`wait_while`](Condvar::wait_while).
pub struct Condvar {
    waiting: SpinLock<WaitList>,
}

impl Condvar {
    /// Create a condition variable with no waiters
    pub const fn new() -> Self {
        Self {
            waiting: SpinLock::new(WaitList::new()),
        }
    }

    /// Release the guarded mutex, suspend until notified, then re-acquire
    /// the mutex before returning.
    ///
    /// The caller is on the waiting list before the mutex is released, so
    /// a notification sent by the next holder is never lost.
    pub fn wait<'a, T: ?Sized>(
        &self,
        guard: MutexGuard<'a, T>,
    ) -> RuntimeResult<MutexGuard<'a, T>> {
        let node = WaitNode::new(current_fiber()?);
        let mutex = MutexGuard::mutex(&guard);

        unsafe { self.waiting.lock().push_back(&node) };
        drop(guard);
        let parked = park();

        // Still listed when the wakeup came from somewhere else.
        unsafe { self.waiting.lock().remove(&node) };
        parked?;

        mutex.lock()
    }

    /// Wait until `condition` returns false, re-checking after every wakeup
    pub fn wait_while<'a, T, F>(
        &self,
        mut guard: MutexGuard<'a, T>,
        mut condition: F,
    ) -> RuntimeResult<MutexGuard<'a, T>>
    where
        T: ?Sized,
        F: FnMut(&mut T) -> bool,
    {
        while condition(&mut *guard) {
            guard = self.wait(guard)?;
        }
        Ok(guard)
    }

    /// Wake the longest-waiting fiber. Returns whether there was one.
    pub fn notify_one(&self) -> bool {
        let next = self.waiting.lock().pop_front();
        match next {
            Some(fiber) => {
                wake(fiber);
                true
            }
            None => false,
        }
    }

    /// Wake every fiber waiting at the time of the call. Returns how many
    /// were woken.
    pub fn notify_all(&self) -> usize {
        // One waiter per spin section; later arrivals are left alone.
        let listed = self.waiting.lock().len();
        let mut woken = 0;
        while woken < listed {
            let Some(fiber) = self.waiting.lock().pop_front() else {
                break;
            };
            wake(fiber);
            woken += 1;
        }
        woken
    }

    /// Number of fibers currently waiting
    pub fn waiters(&self) -> usize {
        self.waiting.lock().len()
    }
}

impl Default for Condvar {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for Condvar {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Condvar")
            .field("waiters", &self.waiters())
            .finish()
    }
}
