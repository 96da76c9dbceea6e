//! Runtime facade
//!
//! A [`Runtime`] owns one scheduler per worker thread. `run()` starts the
//! workers and blocks the calling thread until `stop()` is requested, waking
//! periodically to release the stacks of fibers that exited long ago.
//!
//! The free functions of this module operate on the fiber running on the
//! calling thread; they fail with [`RuntimeError::NotInFiber`] elsewhere.

mod config;
mod handle;
mod shared;

pub use config::RuntimeConfig;
pub use handle::{enqueue, Builder, Handle};
pub use shared::RuntimeStats;

pub(crate) use shared::Shared;

use crate::error::{fatal, RuntimeError, RuntimeResult};
use crate::scheduler::{FiberHandle, Scheduler, Worker};
use parking_lot::Mutex;
use std::sync::Arc;
use std::thread;

/// M:N fiber runtime
pub struct Runtime {
    shared: Arc<Shared>,

    /// Present while the runtime is not running
    schedulers: Mutex<Option<Vec<Scheduler>>>,
}

impl Runtime {
    /// Create a runtime; nothing runs until [`run`](Runtime::run)
    pub fn new(config: RuntimeConfig) -> Self {
        let config = config.normalized();
        let count = config.schedulers();

        let runnables: Vec<Worker<_>> = (0..count).map(|_| Worker::new()).collect();
        let recycled: Vec<Worker<_>> = (0..count).map(|_| Worker::new()).collect();
        let stealers = runnables.iter().map(Worker::stealer).collect();
        let recycled_stealers = recycled.iter().map(Worker::stealer).collect();

        let shared = Arc::new(Shared::new(config, stealers, recycled_stealers));
        let schedulers = runnables
            .into_iter()
            .zip(recycled)
            .enumerate()
            .map(|(index, (runnables, recycled))| {
                Scheduler::new(index, shared.clone(), runnables, recycled)
            })
            .collect();

        Self {
            shared,
            schedulers: Mutex::new(Some(schedulers)),
        }
    }

    /// Run the schedulers until [`stop`](Runtime::stop) is requested.
    ///
    /// With `threads == 0` the single scheduler runs on the calling thread.
    /// Returns immediately if a stop was already requested.
    pub fn run(&self) -> RuntimeResult<()> {
        let schedulers = self
            .schedulers
            .lock()
            .take()
            .ok_or(RuntimeError::AlreadyRunning)?;

        let schedulers = if self.shared.is_stopping() {
            schedulers
        } else if self.shared.config.threads == 0 {
            tracing::info!(threads = 0, "runtime started");
            for scheduler in &schedulers {
                scheduler.run(true);
            }
            schedulers
        } else {
            tracing::info!(threads = schedulers.len(), "runtime started");
            self.run_threads(schedulers)
        };

        tracing::info!(stats = ?self.shared.stats(), "runtime stopped");
        *self.schedulers.lock() = Some(schedulers);
        Ok(())
    }

    fn run_threads(&self, schedulers: Vec<Scheduler>) -> Vec<Scheduler> {
        let prefix = &self.shared.config.thread_name_prefix;
        let mut threads = Vec::with_capacity(schedulers.len());

        for scheduler in schedulers {
            let spawned = thread::Builder::new()
                .name(format!("{}-{}", prefix, scheduler.index()))
                .spawn(move || {
                    scheduler.run(false);
                    scheduler
                });
            match spawned {
                Ok(handle) => threads.push(handle),
                // Workers already started would spin forever without their peers.
                Err(err) => fatal("worker thread spawn", &err),
            }
        }

        self.shared.wait_for_stop();

        threads
            .into_iter()
            .map(|handle| match handle.join() {
                Ok(scheduler) => scheduler,
                Err(_) => fatal("worker thread", &"scheduler loop panicked"),
            })
            .collect()
    }

    /// Request a stop; sticky, so a later `run()` returns at once
    pub fn stop(&self) {
        self.shared.stop();
    }

    /// Handle usable from any thread
    pub fn handle(&self) -> Handle {
        Handle::new(self.shared.clone())
    }

    /// Spawn a fiber onto the runtime
    pub fn spawn<F>(&self, f: F) -> FiberHandle
    where
        F: FnOnce() + Send + 'static,
    {
        self.shared.spawn(Box::new(f), None, true)
    }

    /// Snapshot of the runtime counters
    pub fn stats(&self) -> RuntimeStats {
        self.shared.stats()
    }

    /// Release half of every scheduler's recycled fibers now
    pub fn reclaim(&self) -> usize {
        self.shared.reclaim()
    }

    /// Number of fiber headers allocated so far
    pub fn fiber_count(&self) -> usize {
        self.shared.pool.len()
    }

    /// Exited fibers currently held for reuse, over all schedulers
    pub fn recycled_count(&self) -> usize {
        self.shared.recycled.iter().map(|pool| pool.len()).sum()
    }
}

impl Default for Runtime {
    fn default() -> Self {
        Self::new(RuntimeConfig::default())
    }
}

impl Drop for Runtime {
    fn drop(&mut self) {
        self.shared.stop();
        tracing::debug!(
            fibers = self.shared.pool.len(),
            idle = self.shared.pool.idle(),
            stack_size = self.shared.pool.stack_size(),
            "runtime dropped"
        );
    }
}

/// Spawn a fiber on the calling fiber's runtime
pub fn spawn<F>(f: F) -> RuntimeResult<FiberHandle>
where
    F: FnOnce() + Send + 'static,
{
    Builder::new().spawn(f)
}

/// Suspend the calling fiber until another one enqueues or resumes it.
///
/// May return spuriously if the fiber is queued by someone it did not
/// expect; callers re-check their condition.
pub fn suspend() -> RuntimeResult<()> {
    crate::scheduler::park()
}

/// Switch directly to `fiber` without re-queuing the caller
pub fn resume(fiber: &FiberHandle) -> RuntimeResult<()> {
    let scheduler = Scheduler::in_fiber()?;
    let target = fiber.runnable()?;
    scheduler.resume(target)
}

/// Let other fibers run; the caller is queued again first
pub fn yield_now() -> RuntimeResult<()> {
    Scheduler::in_fiber()?.yield_now();
    Ok(())
}

/// Handle to the calling fiber
pub fn current() -> RuntimeResult<FiberHandle> {
    let scheduler = Scheduler::in_fiber()?;
    let fiber = scheduler.current_fiber();
    Ok(FiberHandle::new(
        fiber,
        fiber.id(),
        scheduler.shared().clone(),
    ))
}

/// Handle to the calling fiber's runtime
pub fn handle() -> RuntimeResult<Handle> {
    Handle::current()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn test_free_functions_outside_fiber() {
        assert!(matches!(yield_now(), Err(RuntimeError::NotInFiber)));
        assert!(matches!(suspend(), Err(RuntimeError::NotInFiber)));
        assert!(matches!(current(), Err(RuntimeError::NotInFiber)));
        assert!(matches!(handle(), Err(RuntimeError::NotInFiber)));
        assert!(matches!(spawn(|| {}), Err(RuntimeError::NotInFiber)));
    }

    #[test]
    fn test_stop_before_run_is_sticky() {
        let runtime = Runtime::new(RuntimeConfig::current_thread());
        let ran = Arc::new(AtomicUsize::new(0));
        let r = ran.clone();
        runtime.spawn(move || {
            r.fetch_add(1, Ordering::SeqCst);
        });

        runtime.stop();
        runtime.run().unwrap();
        assert_eq!(ran.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_inline_run_executes_fibers() {
        let runtime = Runtime::new(RuntimeConfig::current_thread());
        let ran = Arc::new(AtomicUsize::new(0));
        for _ in 0..10 {
            let ran = ran.clone();
            runtime.spawn(move || {
                if ran.fetch_add(1, Ordering::SeqCst) == 9 {
                    handle().unwrap().stop();
                }
            });
        }

        runtime.run().unwrap();
        assert_eq!(ran.load(Ordering::SeqCst), 10);
        assert_eq!(runtime.stats().completed, 10);
    }

    #[test]
    fn test_exited_fibers_are_reused() {
        let runtime = Runtime::new(RuntimeConfig::current_thread());
        let done = Arc::new(AtomicUsize::new(0));
        let d = done.clone();
        runtime.spawn(move || {
            for _ in 0..50 {
                let d = d.clone();
                spawn(move || {
                    d.fetch_add(1, Ordering::SeqCst);
                })
                .unwrap();
                yield_now().unwrap();
            }
            while d.load(Ordering::SeqCst) < 50 {
                yield_now().unwrap();
            }
            handle().unwrap().stop();
        });

        runtime.run().unwrap();
        assert_eq!(done.load(Ordering::SeqCst), 50);
        // one-at-a-time children keep reusing the same couple of headers
        assert!(runtime.fiber_count() < 10, "{} headers", runtime.fiber_count());
        assert!(runtime.stats().recycled >= 50);
    }

    #[test]
    fn test_run_while_running_is_rejected() {
        let runtime = Arc::new(Runtime::new(RuntimeConfig::current_thread()));
        let result = Arc::new(parking_lot::Mutex::new(None));
        let (rt, res) = (runtime.clone(), result.clone());
        runtime.spawn(move || {
            *res.lock() = Some(rt.run());
            rt.stop();
        });

        runtime.run().unwrap();
        assert!(matches!(
            *result.lock(),
            Some(Err(RuntimeError::AlreadyRunning))
        ));
    }
}
