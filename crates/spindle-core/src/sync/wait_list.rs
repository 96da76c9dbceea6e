//! Intrusive FIFO of parked fibers for the spin-locked primitives
//!
//! Each waiter links a [`WaitNode`] living on its own stack, so pushing,
//! popping and removing a given waiter are all O(1) inside the spin lock.
//! Fiber stacks never move, including when the fiber migrates threads.
//!
//! Every method must be called with the owning spin lock held; the node
//! links are plain cells guarded by that lock.

use crate::scheduler::Runnable;
use std::cell::Cell;
use std::ptr;

/// One waiter's link, owned by the waiting fiber
pub(crate) struct WaitNode {
    entry: Runnable,
    prev: Cell<*const WaitNode>,
    next: Cell<*const WaitNode>,
    listed: Cell<bool>,
}

impl WaitNode {
    pub(crate) fn new(entry: Runnable) -> Self {
        Self {
            entry,
            prev: Cell::new(ptr::null()),
            next: Cell::new(ptr::null()),
            listed: Cell::new(false),
        }
    }
}

/// Doubly linked list of [`WaitNode`]s, oldest first
pub(crate) struct WaitList {
    head: *const WaitNode,
    tail: *const WaitNode,
    len: usize,
}

// Nodes are only reached through the list while its spin lock is held.
unsafe impl Send for WaitList {}

impl WaitList {
    pub(crate) const fn new() -> Self {
        Self {
            head: ptr::null(),
            tail: ptr::null(),
            len: 0,
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.len
    }

    /// Append `node` unless it is already listed.
    ///
    /// # Safety
    /// `node` must stay at its address, and must not be dropped, until it
    /// has been popped or removed.
    pub(crate) unsafe fn push_back(&mut self, node: &WaitNode) {
        if node.listed.get() {
            return;
        }
        node.prev.set(self.tail);
        node.next.set(ptr::null());
        node.listed.set(true);

        match unsafe { self.tail.as_ref() } {
            Some(tail) => tail.next.set(node),
            None => self.head = node,
        }
        self.tail = node;
        self.len += 1;
    }

    /// Unlink the oldest waiter and return its entry
    pub(crate) fn pop_front(&mut self) -> Option<Runnable> {
        let head = unsafe { self.head.as_ref() }?;
        unsafe { self.unlink(head) };
        Some(head.entry)
    }

    /// Unlink `node` if it is still listed; returns whether it was.
    ///
    /// # Safety
    /// If listed, `node` must be on this list.
    pub(crate) unsafe fn remove(&mut self, node: &WaitNode) -> bool {
        if !node.listed.get() {
            return false;
        }
        unsafe { self.unlink(node) };
        true
    }

    unsafe fn unlink(&mut self, node: &WaitNode) {
        let prev = node.prev.get();
        let next = node.next.get();

        match unsafe { prev.as_ref() } {
            Some(prev) => prev.next.set(next),
            None => self.head = next,
        }
        match unsafe { next.as_ref() } {
            Some(next) => next.prev.set(prev),
            None => self.tail = prev,
        }

        node.prev.set(ptr::null());
        node.next.set(ptr::null());
        node.listed.set(false);
        self.len -= 1;
    }
}

impl Default for WaitList {
    fn default() -> Self {
        Self::new()
    }
}
