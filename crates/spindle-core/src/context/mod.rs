//! Execution contexts and the switch primitive
//!
//! A [`Context`] holds the callee-saved register image of a suspended
//! execution plus a *resumable* flag. The switch routine sets the flag on
//! the context it leaves only after every register has been stored, so a
//! thread that wants to resume a context first claims it by swapping the
//! flag from set to clear. A context whose state is still being saved can
//! never be claimed.
//!
//! This is the only architecture-specific module of the crate.

#[cfg(not(unix))]
compile_error!("spindle requires a unix target");

#[cfg(not(any(target_arch = "x86_64", target_arch = "aarch64")))]
compile_error!("spindle supports x86_64 and aarch64 only");

#[cfg(target_arch = "aarch64")]
mod aarch64;
#[cfg(target_arch = "aarch64")]
use aarch64 as arch;

#[cfg(target_arch = "x86_64")]
mod x86_64;
#[cfg(target_arch = "x86_64")]
use x86_64 as arch;

use crossbeam::utils::Backoff;
use std::cell::UnsafeCell;
use std::mem::offset_of;
use std::sync::atomic::{AtomicBool, Ordering};

/// Entry point of a fresh context; receives the argument given to [`Context::prime`]
pub type EntryFn = extern "C" fn(usize) -> !;

/// Saved machine state of one execution context
#[repr(C)]
pub struct Context {
    regs: UnsafeCell<arch::Registers>,
    resumable: AtomicBool,
}

const _: () = assert!(offset_of!(Context, resumable) == arch::RESUMABLE_OFFSET);

// The register image is only touched by the thread holding the claim.
unsafe impl Send for Context {}
unsafe impl Sync for Context {}

impl Context {
    /// A context for a thread that is already running (the scheduler's root).
    ///
    /// It becomes resumable the first time the thread switches away.
    pub fn new() -> Self {
        Self {
            regs: UnsafeCell::new(arch::Registers::default()),
            resumable: AtomicBool::new(false),
        }
    }

    /// Prime the context to run `entry(arg)` on the stack ending at `stack_top`.
    ///
    /// # Safety
    /// The context must not be running or claimed by anyone, and the stack
    /// must stay mapped until the context is primed again or dropped.
    pub unsafe fn prime(&self, stack_top: usize, entry: EntryFn, arg: usize) {
        unsafe {
            *self.regs.get() = arch::Registers::fresh(stack_top, entry as usize, arg);
        }
        self.resumable.store(true, Ordering::Release);
    }

    /// Whether a switch away from this context has completed
    pub fn is_resumable(&self) -> bool {
        self.resumable.load(Ordering::Acquire)
    }

    /// Try to take the exclusive right to resume this context
    pub fn try_claim(&self) -> bool {
        self.resumable
            .compare_exchange(true, false, Ordering::Acquire, Ordering::Relaxed)
            .is_ok()
    }

    /// Give back a claim without resuming the context
    pub fn release(&self) {
        self.resumable.store(true, Ordering::Release);
    }

    /// Spin until the context is claimed, or give up once `abandon` says so.
    ///
    /// Returns `true` when the claim was taken.
    pub fn claim(&self, mut abandon: impl FnMut() -> bool) -> bool {
        let backoff = Backoff::new();
        loop {
            if self.try_claim() {
                return true;
            }
            if abandon() {
                return false;
            }
            backoff.snooze();
        }
    }
}

impl Default for Context {
    fn default() -> Self {
        Self::new()
    }
}

/// Save the running state into `from` and continue with `to`.
///
/// Returns when some thread switches back into `from`.
///
/// # Safety
/// `from` must describe the calling execution; `to` must be claimed by the
/// caller and hold a complete image. Both must outlive the suspension.
#[inline(never)]
pub unsafe fn switch(from: &Context, to: &Context) {
    unsafe { arch::switch(from as *const Context as *const u8, to as *const Context as *const u8) }
}

/// Continue with `to`, abandoning the calling execution.
///
/// # Safety
/// As for [`switch`]; nothing on the current stack may be used afterwards.
pub unsafe fn jump(to: &Context) -> ! {
    unsafe { arch::jump(to as *const Context as *const u8) }
}
