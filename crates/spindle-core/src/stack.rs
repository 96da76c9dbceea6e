//! Guarded fiber stacks
//!
//! Each stack is an anonymous private mapping with one inaccessible guard
//! page at its low end, so an overflow faults instead of corrupting the
//! neighbouring allocation.

use crate::error::{RuntimeError, RuntimeResult};
use std::io;
use std::ptr::NonNull;

/// Default usable stack size (256 KiB)
pub const DEFAULT_STACK_SIZE: usize = 256 * 1024;

/// Smallest usable stack handed out, whatever the configuration asks for
pub const MIN_STACK_SIZE: usize = 16 * 1024;

#[cfg(target_os = "linux")]
const MAP_FLAGS: libc::c_int = libc::MAP_PRIVATE | libc::MAP_ANONYMOUS | libc::MAP_STACK;
#[cfg(not(target_os = "linux"))]
const MAP_FLAGS: libc::c_int = libc::MAP_PRIVATE | libc::MAP_ANONYMOUS;

/// A mapped fiber stack
#[derive(Debug)]
pub struct Stack {
    /// Lowest mapped address (start of the guard page)
    base: NonNull<u8>,
    /// Total mapping length, guard page included
    len: usize,
}

// The mapping is plain memory owned by this value.
unsafe impl Send for Stack {}

impl Stack {
    /// Map a stack with at least `size` usable bytes
    pub fn new(size: usize) -> RuntimeResult<Self> {
        let page = page_size();
        let usable = size.max(MIN_STACK_SIZE).next_multiple_of(page);
        let len = usable + page;

        let base = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                len,
                libc::PROT_READ | libc::PROT_WRITE,
                MAP_FLAGS,
                -1,
                0,
            )
        };
        if base == libc::MAP_FAILED {
            return Err(RuntimeError::StackAllocation {
                size: len,
                source: io::Error::last_os_error(),
            });
        }

        let stack = Stack {
            base: unsafe { NonNull::new_unchecked(base.cast::<u8>()) },
            len,
        };

        if unsafe { libc::mprotect(base, page, libc::PROT_NONE) } != 0 {
            return Err(RuntimeError::StackAllocation {
                size: len,
                source: io::Error::last_os_error(),
            });
        }

        // Fiber stacks are small and short-lived; huge pages only waste memory.
        #[cfg(target_os = "linux")]
        unsafe {
            libc::madvise(base, len, libc::MADV_NOHUGEPAGE);
        }

        Ok(stack)
    }

    /// Upper (initial stack pointer) end of the stack, 16-byte aligned
    pub fn top(&self) -> usize {
        (self.base.as_ptr() as usize + self.len) & !15
    }

    /// Usable bytes, excluding the guard page
    pub fn usable_size(&self) -> usize {
        self.len - page_size()
    }
}

impl Drop for Stack {
    fn drop(&mut self) {
        unsafe {
            libc::munmap(self.base.as_ptr().cast(), self.len);
        }
    }
}

/// System page size
pub fn page_size() -> usize {
    let size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
    if size <= 0 {
        4096
    } else {
        size as usize
    }
}
