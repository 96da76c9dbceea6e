//! Runtime handles and the fiber builder

use crate::error::RuntimeResult;
use crate::runtime::shared::{RuntimeStats, Shared};
use crate::scheduler::{schedule, FiberHandle, Scheduler};
use std::fmt;
use std::sync::Arc;

/// Cloneable reference to a runtime, usable from any thread
#[derive(Clone)]
pub struct Handle {
    shared: Arc<Shared>,
}

impl Handle {
    pub(crate) fn new(shared: Arc<Shared>) -> Self {
        Self { shared }
    }

    /// The runtime running the calling fiber
    pub fn current() -> RuntimeResult<Handle> {
        let scheduler = Scheduler::in_fiber()?;
        Ok(Handle::new(scheduler.shared().clone()))
    }

    /// Spawn a fiber and queue it for execution
    pub fn spawn<F>(&self, f: F) -> FiberHandle
    where
        F: FnOnce() + Send + 'static,
    {
        self.shared.spawn(Box::new(f), None, true)
    }

    /// Queue a fiber for resumption
    pub fn enqueue(&self, fiber: &FiberHandle) -> RuntimeResult<()> {
        enqueue(fiber)
    }

    /// Ask every scheduler to stop at its next scheduling decision
    pub fn stop(&self) {
        self.shared.stop();
    }

    /// Whether a stop was requested
    pub fn is_stopping(&self) -> bool {
        self.shared.is_stopping()
    }

    /// Snapshot of the runtime counters
    pub fn stats(&self) -> RuntimeStats {
        self.shared.stats()
    }
}

impl fmt::Debug for Handle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Handle")
            .field("stopping", &self.is_stopping())
            .finish()
    }
}

/// Queue a fiber for resumption; works from any thread.
///
/// Queuing a fiber that is already queued does nothing.
pub fn enqueue(fiber: &FiberHandle) -> RuntimeResult<()> {
    schedule(fiber.runnable()?);
    Ok(())
}

/// Fiber factory with optional settings
///
/// ```ignore
/// let fiber = Builder::new().name("reader").spawn(|| read_loop())?;
/// ```
#[derive(Debug, Default)]
pub struct Builder {
    name: Option<String>,
}

impl Builder {
    /// A builder with default settings
    pub fn new() -> Self {
        Self::default()
    }

    /// Debug name reported in logs and by [`FiberHandle::name`]
    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    /// Spawn on the runtime of the calling fiber
    pub fn spawn<F>(self, f: F) -> RuntimeResult<FiberHandle>
    where
        F: FnOnce() + Send + 'static,
    {
        let scheduler = Scheduler::in_fiber()?;
        Ok(scheduler.spawn(Box::new(f), self.name, true))
    }

    /// Spawn on the given runtime
    pub fn spawn_on<F>(self, handle: &Handle, f: F) -> FiberHandle
    where
        F: FnOnce() + Send + 'static,
    {
        handle.shared.spawn(Box::new(f), self.name, true)
    }

    /// Build a fiber on the calling fiber's runtime without queuing it.
    ///
    /// It first runs when passed to [`resume`](crate::resume) or
    /// [`enqueue`](crate::enqueue).
    pub fn create<F>(self, f: F) -> RuntimeResult<FiberHandle>
    where
        F: FnOnce() + Send + 'static,
    {
        let scheduler = Scheduler::in_fiber()?;
        Ok(scheduler.spawn(Box::new(f), self.name, false))
    }

    /// Build a fiber on the given runtime without queuing it
    pub fn create_on<F>(self, handle: &Handle, f: F) -> FiberHandle
    where
        F: FnOnce() + Send + 'static,
    {
        handle.shared.spawn(Box::new(f), self.name, false)
    }
}
