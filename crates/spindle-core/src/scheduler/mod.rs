//! Fiber Scheduler - Work-Stealing M:N Execution
//!
//! Fibers are multiplexed over a fixed set of worker threads. Each worker
//! pops from the bottom of its own deque (depth-first locality) and, when
//! that runs dry, takes from the global injector or steals from the top of
//! another worker's deque (breadth-first load balancing).

pub mod deque;
mod fiber;
mod pool;
#[allow(clippy::module_inception)]
mod scheduler;

pub use deque::{Steal, Stealer, Worker};
pub use fiber::{FiberHandle, FiberId, FiberState};

pub(crate) use fiber::{Entry, FiberRef, Runnable};
#[cfg(test)]
pub(crate) use fiber::Fiber;
pub(crate) use pool::FiberPool;
pub(crate) use scheduler::{current_fiber, fiber_main, park, schedule, wake, Scheduler};
