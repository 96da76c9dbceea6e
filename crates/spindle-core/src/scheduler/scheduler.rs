//! Per-thread scheduler
//!
//! Each worker thread owns one [`Scheduler`]: a run deque, a deque of
//! exited fibers kept for reuse, and a root fiber standing for the thread's
//! own stack. The root runs the scheduling loop; every other fiber hands
//! control directly to the next runnable one and only falls back to the
//! root when there is nothing else to do.

use crate::context;
use crate::error::{fatal, RuntimeError, RuntimeResult};
use crate::runtime::Shared;
use crate::scheduler::deque::{Steal, Worker};
use crate::scheduler::fiber::{Entry, Fiber, FiberHandle, FiberRef, FiberState, Runnable};
use crossbeam::utils::Backoff;
use std::any::Any;
use std::cell::Cell;
use std::panic::{self, AssertUnwindSafe};
use std::ptr;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::thread;
use std::time::Instant;

thread_local! {
    static CURRENT: Cell<*const Scheduler> = const { Cell::new(ptr::null()) };
}

/// Scheduler bound to one worker thread
pub(crate) struct Scheduler {
    /// Scheduler index (also its position in the runtime's stealer list)
    index: usize,

    /// Runtime-wide state
    shared: Arc<Shared>,

    /// The thread's own execution context
    root: Box<Fiber>,

    /// Fiber currently running on this thread
    current: Cell<FiberRef>,

    /// Fiber that just exited and is still on its own stack
    exited: Cell<Option<FiberRef>>,

    /// Runnable fibers (LIFO for the owner, FIFO for thieves)
    runnables: Worker<Runnable>,

    /// Exited fibers with their stacks, ready for reuse
    recycled: Worker<FiberRef>,
}

/// Restores the previous thread binding on drop
struct Bound {
    previous: *const Scheduler,
}

impl Drop for Bound {
    fn drop(&mut self) {
        CURRENT.with(|cell| cell.set(self.previous));
    }
}

impl Scheduler {
    /// Create a scheduler around pre-built deques
    pub(crate) fn new(
        index: usize,
        shared: Arc<Shared>,
        runnables: Worker<Runnable>,
        recycled: Worker<FiberRef>,
    ) -> Self {
        let root = Box::new(Fiber::root(Arc::as_ptr(&shared)));
        let current = Cell::new(FiberRef::new(&root));
        Self {
            index,
            shared,
            root,
            current,
            exited: Cell::new(None),
            runnables,
            recycled,
        }
    }

    /// The scheduler bound to the calling thread.
    ///
    /// Never inlined and never to be cached across a switch: a fiber may
    /// continue on another thread after any suspension point.
    #[inline(never)]
    pub(crate) fn current() -> Option<&'static Scheduler> {
        let scheduler = CURRENT.with(Cell::get);
        // Valid while the thread's run loop is active; that loop is the
        // only place a binding is installed.
        unsafe { scheduler.as_ref() }
    }

    /// The calling thread's scheduler, provided a fiber (not the root) is running
    pub(crate) fn in_fiber() -> RuntimeResult<&'static Scheduler> {
        match Scheduler::current() {
            Some(scheduler) if !scheduler.current.get().is_root() => Ok(scheduler),
            _ => Err(RuntimeError::NotInFiber),
        }
    }

    pub(crate) fn index(&self) -> usize {
        self.index
    }

    pub(crate) fn shared(&self) -> &Arc<Shared> {
        &self.shared
    }

    pub(crate) fn belongs_to(&self, shared: &Shared) -> bool {
        ptr::eq(Arc::as_ptr(&self.shared), shared)
    }

    /// Fiber running on this thread right now
    pub(crate) fn current_fiber(&self) -> FiberRef {
        self.current.get()
    }

    fn root_ref(&self) -> FiberRef {
        FiberRef::new(&self.root)
    }

    fn bind(&self) -> Bound {
        let previous = CURRENT.with(|cell| cell.replace(self as *const Scheduler));
        Bound { previous }
    }

    /// Prepare a fiber (reusing an exited one when possible) and queue it
    /// at the bottom of this scheduler's deque unless `enqueue` is false
    pub(crate) fn spawn(&self, entry: Entry, name: Option<String>, enqueue: bool) -> FiberHandle {
        let fiber = match self.recycled.pop_bottom() {
            Some(fiber) => fiber,
            None => self.shared.pool.acquire(Arc::as_ptr(&self.shared)),
        };

        let id = unsafe { fiber.prepare(entry, name, fiber_main) };
        self.shared.stats.spawned.fetch_add(1, Ordering::Relaxed);
        tracing::trace!(worker = self.index, fiber = %id, name = ?fiber.name(), "spawn");

        if enqueue {
            self.enqueue(Runnable::new(fiber, id));
        }
        FiberHandle::new(fiber, id, self.shared.clone())
    }

    /// Push a fiber at the bottom of the run deque, unless it is queued
    /// already
    pub(crate) fn enqueue(&self, entry: Runnable) {
        if entry.fiber().mark_queued(entry.id()) {
            self.runnables.push_bottom(entry);
        }
    }

    /// Find the next fiber to run: own deque, global injector, then one
    /// steal attempt from a random victim. Nothing once stopping.
    fn next_runnable(&self) -> Option<Runnable> {
        if self.shared.is_stopping() {
            return None;
        }

        // 1. Local deque (LIFO - cache locality)
        if let Some(fiber) = self.runnables.pop_bottom() {
            return Some(fiber);
        }

        // 2. Global injector (fibers spawned from outside the workers)
        loop {
            match self.shared.injector.steal() {
                crossbeam_deque::Steal::Success(fiber) => return Some(fiber),
                crossbeam_deque::Steal::Empty => break,
                crossbeam_deque::Steal::Retry => continue,
            }
        }

        // 3. Another scheduler (FIFO - load balancing)
        self.steal_once()
    }

    /// One steal attempt from a uniformly random victim other than self
    fn steal_once(&self) -> Option<Runnable> {
        use rand::Rng;

        let stealers = &self.shared.stealers;
        if stealers.len() < 2 {
            return None;
        }

        let mut victim = rand::thread_rng().gen_range(0..stealers.len() - 1);
        if victim >= self.index {
            victim += 1;
        }

        match stealers[victim].pop_top() {
            Steal::Success(entry) => {
                self.shared.stats.stolen.fetch_add(1, Ordering::Relaxed);
                tracing::trace!(worker = self.index, victim, fiber = %entry.id(), "stole");
                Some(entry)
            }
            // Contention is not an error, just no work this time
            Steal::Empty | Steal::Retry => None,
        }
    }

    /// Take the exclusive right to resume the entry's fiber, waiting for an
    /// in-flight save to finish. Fails for an incarnation that exited, or
    /// whose header was reused, meanwhile.
    fn claim(&self, entry: Runnable) -> Option<FiberRef> {
        let fiber = entry.fiber();
        if entry.is_live() && fiber.context().claim(|| !entry.is_live()) {
            // A reused header is resumable again; the claim may have landed
            // on its new incarnation.
            if entry.is_live() {
                return Some(fiber);
            }
            fiber.context().release();
        }
        tracing::trace!(worker = self.index, fiber = %entry.id(), "dropping stale entry");
        None
    }

    fn claim_root(&self) -> FiberRef {
        let root = self.root_ref();
        let claimed = root.context().claim(|| false);
        debug_assert!(claimed);
        root
    }

    /// Pick and claim whatever should run instead of `current`; `current`
    /// itself when it was queued again before it got to suspend.
    fn pick_next(&self, current: FiberRef) -> FiberRef {
        loop {
            match self.next_runnable() {
                Some(entry) if entry.fiber() == current => {
                    if entry.is_live() {
                        return current;
                    }
                }
                Some(entry) => {
                    if let Some(fiber) = self.claim(entry) {
                        return fiber;
                    }
                }
                None => return self.claim_root(),
            }
        }
    }

    /// Transfer control to the claimed `next`; returns once something
    /// switches back to the caller.
    fn switch_to(&self, next: FiberRef) {
        let current = self.current.get();
        next.set_state(FiberState::Running);
        if next == current {
            return;
        }

        self.current.set(next);
        unsafe { context::switch(current.context(), next.context()) };

        // Possibly on another thread now; `self` is stale.
        if let Some(scheduler) = Scheduler::current() {
            scheduler.after_switch();
        }
    }

    /// Runs on the context that was switched to: move a fiber that just
    /// exited into the recycle deque now that nothing runs on its stack.
    fn after_switch(&self) {
        if let Some(fiber) = self.exited.take() {
            self.recycled.push_bottom(fiber);
            self.shared.stats.recycled.fetch_add(1, Ordering::Relaxed);
            tracing::trace!(worker = self.index, fiber = %fiber.id(), "recycle");
        }
    }

    /// Suspend the running fiber until someone queues or resumes it
    pub(crate) fn suspend(&self) {
        let current = self.current.get();
        current.mark_suspended();
        let next = self.pick_next(current);
        self.switch_to(next);
    }

    /// Re-queue the running fiber and run something else first
    pub(crate) fn yield_now(&self) {
        let current = self.current.get();

        // Dequeue before enqueueing, so the yielding fiber cannot be its
        // own successor.
        let first = self.next_runnable();
        if first.is_some_and(|entry| entry.fiber() == current && entry.is_live()) {
            current.set_state(FiberState::Running);
            return;
        }

        self.enqueue(current.runnable());
        let next = match first {
            Some(entry) if entry.fiber() == current => self.pick_next(current),
            Some(entry) => match self.claim(entry) {
                Some(fiber) => fiber,
                None => self.pick_next(current),
            },
            None => self.claim_root(),
        };
        self.switch_to(next);
    }

    /// Switch straight to `target` without re-queuing the caller.
    ///
    /// A queue entry the target may still have is left in place; it runs
    /// the target again later unless that incarnation exits first.
    pub(crate) fn resume(&self, target: Runnable) -> RuntimeResult<()> {
        let current = self.current.get();
        if target.fiber() == current {
            return Err(RuntimeError::ResumeSelf);
        }

        current.mark_suspended();
        match self.claim(target) {
            Some(fiber) => {
                self.switch_to(fiber);
                Ok(())
            }
            None => {
                current.set_state(FiberState::Running);
                Err(RuntimeError::StaleHandle(target.id()))
            }
        }
    }

    /// Retire the running fiber and continue with the next one
    fn exit(&self) -> ! {
        let fiber = self.current.get();
        fiber.set_state(FiberState::Exited);
        self.shared.stats.completed.fetch_add(1, Ordering::Relaxed);
        tracing::trace!(worker = self.index, fiber = %fiber.id(), "exit");

        // Recycled by whichever context runs next, once off this stack.
        self.exited.set(Some(fiber));

        let next = self.pick_next(fiber);
        next.set_state(FiberState::Running);
        self.current.set(next);
        unsafe { context::jump(next.context()) }
    }

    /// Scheduling loop run on the root fiber until the runtime stops.
    ///
    /// With `reclaim` set (single inline scheduler) the loop also trims the
    /// recycle deques every reclaim interval.
    pub(crate) fn run(&self, reclaim: bool) {
        let _bound = self.bind();
        tracing::debug!(worker = self.index, "scheduler started");

        let backoff = Backoff::new();
        let interval = self.shared.config.reclaim_interval;
        let mut last_reclaim = Instant::now();

        while !self.shared.is_stopping() {
            if reclaim && last_reclaim.elapsed() >= interval {
                self.shared.reclaim();
                last_reclaim = Instant::now();
            }

            if let Some(entry) = self.next_runnable() {
                backoff.reset();
                if let Some(fiber) = self.claim(entry) {
                    self.switch_to(fiber);
                }
                continue;
            }

            // Idle: spin briefly, then sleep to avoid busy-waiting
            if backoff.is_completed() {
                thread::sleep(self.shared.config.idle_sleep);
            } else {
                backoff.snooze();
            }
        }

        tracing::debug!(worker = self.index, "scheduler stopped");
    }
}

/// First Rust frame of every fiber
pub(crate) extern "C" fn fiber_main(arg: usize) -> ! {
    let fiber = unsafe { FiberRef::from_raw(arg) };
    if let Some(scheduler) = Scheduler::current() {
        scheduler.after_switch();
    }

    if let Some(entry) = unsafe { fiber.take_entry() } {
        if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(entry)) {
            fiber.shared().stats.panicked.fetch_add(1, Ordering::Relaxed);
            tracing::error!(
                fiber = %fiber.id(),
                name = ?fiber.name(),
                panic = panic_message(payload.as_ref()),
                "fiber panicked"
            );
        }
    }

    match Scheduler::current() {
        Some(scheduler) => scheduler.exit(),
        None => fatal("fiber exit", &"no scheduler bound to this thread"),
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> &str {
    if let Some(message) = payload.downcast_ref::<&str>() {
        message
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message
    } else {
        "<non-string panic payload>"
    }
}

/// Queue a parked fiber for resumption from any thread.
///
/// Does nothing when the incarnation is already queued, has exited, or was
/// created and never started.
pub(crate) fn wake(entry: Runnable) {
    if !entry.fiber().mark_woken(entry.id()) {
        tracing::trace!(fiber = %entry.id(), "ignoring wake");
        return;
    }
    push(entry);
}

/// Queue a fiber from any thread, starting it if it was only created
pub(crate) fn schedule(entry: Runnable) {
    if entry.fiber().mark_queued(entry.id()) {
        push(entry);
    }
}

/// Goes to the calling worker's own deque when it belongs to the same
/// runtime, otherwise to that runtime's injector.
fn push(entry: Runnable) {
    let fiber = entry.fiber();
    let shared = fiber.shared();
    match Scheduler::current() {
        Some(scheduler) if scheduler.belongs_to(shared) => scheduler.runnables.push_bottom(entry),
        _ => shared.injector.push(entry),
    }
}

/// Queue entry of the fiber running on the calling thread
pub(crate) fn current_fiber() -> RuntimeResult<Runnable> {
    Scheduler::in_fiber().map(|scheduler| scheduler.current_fiber().runnable())
}

/// Suspend the calling fiber (see [`Scheduler::suspend`])
pub(crate) fn park() -> RuntimeResult<()> {
    Scheduler::in_fiber()?.suspend();
    Ok(())
}
