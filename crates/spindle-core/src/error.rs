//! Error types for the runtime and its synchronization primitives

use crate::scheduler::FiberId;
use std::fmt;

/// Errors reported by runtime and scheduler operations
#[derive(Debug, thiserror::Error)]
pub enum RuntimeError {
    /// The operation must be called from inside a fiber
    #[error("operation requires a running fiber")]
    NotInFiber,

    /// The handle refers to a fiber that has exited (its slot may have been reused)
    #[error("fiber {0} has exited")]
    StaleHandle(FiberId),

    /// A fiber tried to resume itself
    #[error("a fiber cannot resume itself")]
    ResumeSelf,

    /// `run()` was called while the runtime is already running
    #[error("runtime is already running")]
    AlreadyRunning,

    /// Mapping a fiber stack failed
    #[error("failed to allocate a {size} byte fiber stack: {source}")]
    StackAllocation {
        /// Requested stack size in bytes
        size: usize,
        /// Underlying OS error
        #[source]
        source: std::io::Error,
    },
}

/// Errors reported by [`Lock`](crate::sync::Lock)
#[derive(Debug, thiserror::Error)]
pub enum LockError {
    /// The calling fiber already owns the lock
    #[error("fiber {0} already owns the lock")]
    Deadlock(FiberId),

    /// Unlock called by a fiber that does not own the lock
    #[error("unlock called by non-owner fiber {0}")]
    NotOwner(FiberId),

    /// The runtime rejected the operation
    #[error(transparent)]
    Runtime(#[from] RuntimeError),
}

/// Errors reported by [`Channel`](crate::sync::Channel) operations
#[derive(Debug, thiserror::Error)]
pub enum ChannelError {
    /// The channel is closed (or closing and drained)
    #[error("channel is closed")]
    Closed,

    /// The runtime rejected the operation
    #[error(transparent)]
    Runtime(#[from] RuntimeError),
}

/// A failed send; carries the value back to the caller
pub struct SendError<T> {
    /// The value that could not be sent
    pub value: T,
    /// Why the send failed
    pub error: ChannelError,
}

impl<T> SendError<T> {
    pub(crate) fn closed(value: T) -> Self {
        Self {
            value,
            error: ChannelError::Closed,
        }
    }

    /// Returns the unsent value
    pub fn into_inner(self) -> T {
        self.value
    }

    /// True when the channel was closed
    pub fn is_closed(&self) -> bool {
        matches!(self.error, ChannelError::Closed)
    }
}

impl<T> fmt::Debug for SendError<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SendError")
            .field("error", &self.error)
            .finish_non_exhaustive()
    }
}

impl<T> fmt::Display for SendError<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "send failed: {}", self.error)
    }
}

impl<T> std::error::Error for SendError<T> {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        Some(&self.error)
    }
}

/// Runtime result alias
pub type RuntimeResult<T> = Result<T, RuntimeError>;

/// Terminates the process after an unrecoverable OS-level failure.
///
/// A fiber cannot be left running on a half-built stack or a failed switch,
/// so these conditions never surface as `Err`.
#[cold]
pub(crate) fn fatal(what: &str, detail: &dyn fmt::Display) -> ! {
    tracing::error!(what, %detail, "fatal runtime failure");
    eprintln!("spindle: fatal: {what}: {detail}");
    std::process::abort()
}
