//! State shared by every scheduler of one runtime

use crate::runtime::RuntimeConfig;
use crate::scheduler::{
    fiber_main, schedule, Entry, FiberHandle, FiberPool, FiberRef, Runnable, Scheduler, Steal,
    Stealer,
};
use crossbeam_deque::Injector;
use parking_lot::{Condvar, Mutex, MutexGuard};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

/// Runtime statistics
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RuntimeStats {
    /// Fibers spawned or created
    pub spawned: u64,

    /// Fibers whose entry procedure finished (panicked ones included)
    pub completed: u64,

    /// Fibers whose entry procedure panicked
    pub panicked: u64,

    /// Successful steals between schedulers
    pub stolen: u64,

    /// Exited fibers moved to a recycle pool
    pub recycled: u64,

    /// Recycled fibers whose stacks were released
    pub reclaimed: u64,
}

#[derive(Debug, Default)]
pub(crate) struct StatsCounters {
    pub(crate) spawned: AtomicU64,
    pub(crate) completed: AtomicU64,
    pub(crate) panicked: AtomicU64,
    pub(crate) stolen: AtomicU64,
    pub(crate) recycled: AtomicU64,
    pub(crate) reclaimed: AtomicU64,
}

impl StatsCounters {
    fn snapshot(&self) -> RuntimeStats {
        RuntimeStats {
            spawned: self.spawned.load(Ordering::Relaxed),
            completed: self.completed.load(Ordering::Relaxed),
            panicked: self.panicked.load(Ordering::Relaxed),
            stolen: self.stolen.load(Ordering::Relaxed),
            recycled: self.recycled.load(Ordering::Relaxed),
            reclaimed: self.reclaimed.load(Ordering::Relaxed),
        }
    }
}

/// Runtime-wide state, referenced by schedulers, fibers and handles
pub(crate) struct Shared {
    pub(crate) config: RuntimeConfig,

    /// Fibers queued from threads that are not workers of this runtime
    pub(crate) injector: Injector<Runnable>,

    /// Thief ends of every scheduler's run deque, by scheduler index
    pub(crate) stealers: Vec<Stealer<Runnable>>,

    /// Thief ends of every scheduler's recycle deque
    pub(crate) recycled: Vec<Stealer<FiberRef>>,

    pub(crate) pool: FiberPool,

    pub(crate) stats: StatsCounters,

    stop: AtomicBool,
    signal: Mutex<()>,
    stopped: Condvar,
}

impl Shared {
    pub(crate) fn new(
        config: RuntimeConfig,
        stealers: Vec<Stealer<Runnable>>,
        recycled: Vec<Stealer<FiberRef>>,
    ) -> Self {
        Self {
            pool: FiberPool::new(config.stack_size),
            config,
            injector: Injector::new(),
            stealers,
            recycled,
            stats: StatsCounters::default(),
            stop: AtomicBool::new(false),
            signal: Mutex::new(()),
            stopped: Condvar::new(),
        }
    }

    pub(crate) fn is_stopping(&self) -> bool {
        self.stop.load(Ordering::Acquire)
    }

    /// Set the sticky stop flag and wake the thread blocked in `run()`
    pub(crate) fn stop(&self) {
        if !self.stop.swap(true, Ordering::AcqRel) {
            tracing::info!("runtime stop requested");
        }
        let _guard = self.signal.lock();
        self.stopped.notify_all();
    }

    /// Block until stopped, reclaiming recycled fibers every interval
    pub(crate) fn wait_for_stop(&self) {
        let mut guard = self.signal.lock();
        while !self.is_stopping() {
            self.stopped
                .wait_for(&mut guard, self.config.reclaim_interval);
            MutexGuard::unlocked(&mut guard, || {
                self.reclaim();
            });
        }
    }

    /// Release the stacks of half of each scheduler's recycled fibers
    pub(crate) fn reclaim(&self) -> usize {
        let mut released = 0;
        for (worker, pool) in self.recycled.iter().enumerate() {
            let count = pool.len() / 2;
            let mut taken = 0;
            while taken < count {
                match pool.pop_top() {
                    Steal::Success(fiber) => {
                        self.pool.release(fiber);
                        taken += 1;
                    }
                    Steal::Retry => continue,
                    Steal::Empty => break,
                }
            }
            if taken > 0 {
                tracing::debug!(worker, released = taken, "reclaimed fiber stacks");
            }
            released += taken;
        }
        self.stats
            .reclaimed
            .fetch_add(released as u64, Ordering::Relaxed);
        released
    }

    /// Prepare a fiber and queue it. From a worker of this runtime the
    /// fiber goes to that worker's deque; from anywhere else to the injector.
    pub(crate) fn spawn(
        self: &Arc<Self>,
        entry: Entry,
        name: Option<String>,
        enqueue: bool,
    ) -> FiberHandle {
        if let Some(scheduler) = Scheduler::current().filter(|s| s.belongs_to(self)) {
            return scheduler.spawn(entry, name, enqueue);
        }

        let fiber = self.pool.acquire(Arc::as_ptr(self));
        let id = unsafe { fiber.prepare(entry, name, fiber_main) };
        self.stats.spawned.fetch_add(1, Ordering::Relaxed);
        tracing::trace!(fiber = %id, name = ?fiber.name(), "spawn via injector");

        if enqueue {
            schedule(Runnable::new(fiber, id));
        }
        FiberHandle::new(fiber, id, self.clone())
    }

    pub(crate) fn stats(&self) -> RuntimeStats {
        self.stats.snapshot()
    }
}
