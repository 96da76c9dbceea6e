//! Fiber header pool
//!
//! Every header the runtime ever creates is owned here until the runtime
//! is dropped, so a stale [`FiberRef`] never dangles. Headers whose stacks
//! were reclaimed wait on a free list for the next spawn; headers that just
//! exited stay with their scheduler (see the recycle deque) and keep their
//! stack for reuse.

use crate::error::fatal;
use crate::runtime::Shared;
use crate::scheduler::fiber::{Fiber, FiberRef};
use crossbeam::queue::SegQueue;
use parking_lot::Mutex;

/// Arena of fiber headers
pub(crate) struct FiberPool {
    fibers: Mutex<Vec<Box<Fiber>>>,
    free: SegQueue<FiberRef>,
    stack_size: usize,
}

impl FiberPool {
    /// Create an empty pool whose stacks have `stack_size` usable bytes
    pub(crate) fn new(stack_size: usize) -> Self {
        Self {
            fibers: Mutex::new(Vec::new()),
            free: SegQueue::new(),
            stack_size,
        }
    }

    /// Get a header with a mapped stack, reusing a free one if possible
    pub(crate) fn acquire(&self, owner: *const Shared) -> FiberRef {
        let fiber = match self.free.pop() {
            Some(fiber) => fiber,
            None => {
                let boxed = Box::new(Fiber::new(owner));
                let fiber = FiberRef::new(&boxed);
                self.fibers.lock().push(boxed);
                fiber
            }
        };

        // A stack that cannot be mapped leaves nowhere to run the fiber.
        if let Err(err) = unsafe { fiber.ensure_stack(self.stack_size) } {
            fatal("fiber stack allocation", &err);
        }
        fiber
    }

    /// Unmap an exited fiber's stack and put its header on the free list
    pub(crate) fn release(&self, fiber: FiberRef) {
        debug_assert!(fiber.has_stack(), "released fiber {} twice", fiber.id());
        unsafe { fiber.release_stack() };
        self.free.push(fiber);
    }

    /// Number of headers ever created
    pub(crate) fn len(&self) -> usize {
        self.fibers.lock().len()
    }

    /// Number of headers without a stack waiting for reuse
    pub(crate) fn idle(&self) -> usize {
        self.free.len()
    }

    pub(crate) fn stack_size(&self) -> usize {
        self.stack_size
    }
}
