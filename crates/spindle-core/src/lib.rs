//! Spindle - M:N cooperative fiber runtime
//!
//! This crate provides:
//! - Fibers with their own guarded stacks, switched in user space
//! - Per-thread schedulers balancing work through lock-free work-stealing deques
//! - A [`Runtime`] facade owning the schedulers and their worker threads
//! - Fiber-level synchronization: a fair [`Lock`], [`Mutex`], [`Condvar`]
//!   and rendezvous or buffered [`Channel`]s
//!
//! Fibers are cooperative. They give up their worker thread only at a
//! suspension point: [`yield_now`], [`suspend`], or a blocking primitive.
//!
//! ```ignore
//! let runtime = spindle::Runtime::new(spindle::RuntimeConfig::default());
//! runtime.spawn(|| {
//!     spindle::yield_now().unwrap();
//!     spindle::handle().unwrap().stop();
//! });
//! runtime.run()?;
//! ```

#![warn(missing_docs)]
#![warn(rust_2018_idioms)]

pub mod context;
pub mod error;
pub mod runtime;
pub mod scheduler;
pub mod stack;
pub mod sync;

pub use error::{ChannelError, LockError, RuntimeError, RuntimeResult, SendError};
pub use runtime::{
    current, enqueue, handle, resume, spawn, suspend, yield_now, Builder, Handle, Runtime,
    RuntimeConfig, RuntimeStats,
};
pub use scheduler::{FiberHandle, FiberId, FiberState};
pub use sync::{Channel, ChannelState, Condvar, Lock, Mutex, MutexGuard};
