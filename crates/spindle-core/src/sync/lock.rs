//! Fair fiber lock
//!
//! Waiters line up in a lock-free [`WaitQueue`] and acquire the lock in
//! arrival order. Only the fiber at the head of the queue may take a free
//! lock; the owner stays at the head until it unlocks, then hands the lock
//! straight to the next head.
//!
//! Hand-off races with the waiter's decision to suspend. Both sides CAS the
//! owner: the waiter from "none" to itself, the unlocker from itself to the
//! new head. Whichever wins decides whether the waiter sleeps or proceeds,
//! and a waiter only ever suspends after seeing someone else own the lock.

use crate::error::LockError;
use crate::scheduler::{current_fiber, park, wake, FiberId, Runnable};
use crate::sync::WaitQueue;
use std::fmt;
use std::sync::atomic::{fence, AtomicU64, Ordering};

const NO_OWNER: u64 = 0;

/// FIFO-fair lock for fibers, without data
///
/// Ownership belongs to a fiber incarnation, not a thread: the owner may
/// migrate between workers while holding it.
pub struct Lock {
    /// Id of the owning fiber, `NO_OWNER` when free
    owner: AtomicU64,
    waiters: WaitQueue<Runnable>,
}

impl Lock {
    /// Create an unlocked lock
    pub fn new() -> Self {
        Self {
            owner: AtomicU64::new(NO_OWNER),
            waiters: WaitQueue::new(),
        }
    }

    /// Acquire the lock, suspending the calling fiber while others hold it
    /// or are queued ahead of it.
    ///
    /// Fails with [`LockError::Deadlock`] without suspending when the caller
    /// already owns the lock.
    pub fn lock(&self) -> Result<(), LockError> {
        let me = current_fiber()?;
        let id = me.id();
        if self.owner.load(Ordering::Acquire) == id.as_u64() {
            return Err(LockError::Deadlock(id));
        }

        self.waiters.enqueue(me);
        // Our enqueue must be visible before we read the owner; pairs with
        // the fence in `unlock`.
        fence(Ordering::SeqCst);

        loop {
            let owner = self.owner.load(Ordering::Acquire);
            if owner == id.as_u64() {
                break;
            }
            if owner == NO_OWNER && self.waiters.head() == Some(me) {
                if self.try_claim(NO_OWNER, id) {
                    break;
                }
                // Lost to the unlocker handing the lock to us, or to a
                // concurrent claim; look again before sleeping.
                continue;
            }
            park()?;
        }

        tracing::trace!(fiber = %id, "lock acquired");
        Ok(())
    }

    /// Release the lock and hand it to the next waiter, if any
    pub fn unlock(&self) -> Result<(), LockError> {
        let me = current_fiber()?;
        let id = me.id();
        if self.owner.load(Ordering::Acquire) != id.as_u64() {
            return Err(LockError::NotOwner(id));
        }

        let removed = self.waiters.dequeue();
        debug_assert_eq!(removed, Some(me), "lock owner was not at the queue head");

        match self.waiters.head() {
            Some(next) => self.hand_off(id, next),
            None => {
                self.owner.store(NO_OWNER, Ordering::Release);
                // A waiter that enqueued after our peek either sees the lock
                // free or is seen by this second peek. It claims the lock
                // itself; installing it here could hand the lock to a fiber
                // that already took and released it meanwhile.
                fence(Ordering::SeqCst);
                if let Some(next) = self.waiters.head() {
                    wake(next);
                }
            }
        }
        Ok(())
    }

    fn hand_off(&self, from: FiberId, next: Runnable) {
        if self.try_claim(from.as_u64(), next.id()) {
            tracing::trace!(from = %from, to = %next.id(), "lock handed off");
            wake(next);
        }
    }

    fn try_claim(&self, expected: u64, id: FiberId) -> bool {
        self.owner
            .compare_exchange(expected, id.as_u64(), Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// Owning fiber, if any
    pub fn owner(&self) -> Option<FiberId> {
        match self.owner.load(Ordering::Acquire) {
            NO_OWNER => None,
            raw => Some(FiberId::from_u64(raw)),
        }
    }

    /// Whether some fiber owns the lock
    pub fn is_locked(&self) -> bool {
        self.owner.load(Ordering::Acquire) != NO_OWNER
    }

    /// Whether no fiber waits for or holds the lock
    pub fn is_idle(&self) -> bool {
        self.waiters.is_empty()
    }
}

impl Default for Lock {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for Lock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Lock").field("owner", &self.owner()).finish()
    }
}
