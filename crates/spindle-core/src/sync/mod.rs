//! Synchronization primitives for fibers
//!
//! These block at the fiber level instead of the OS thread level: a fiber
//! that has to wait is parked on the primitive and its worker thread goes on
//! running other fibers. Internal lists are intrusive lists protected by a
//! [`SpinLock`], or lock-free ([`WaitQueue`]); no OS mutex sits on any path.

mod channel;
mod condvar;
mod guard;
mod lock;
mod mutex;
mod spin;
mod wait_list;
mod wait_queue;

pub use channel::{Channel, ChannelState};
pub use condvar::Condvar;
pub use guard::MutexGuard;
pub use lock::Lock;
pub use mutex::Mutex;
pub use spin::{SpinGuard, SpinLock};
pub use wait_queue::WaitQueue;
