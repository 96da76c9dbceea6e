//! aarch64 (AAPCS64) register save/restore

use std::arch::naked_asm;
use std::mem::offset_of;

/// Callee-saved state of a suspended context
#[repr(C)]
#[derive(Debug, Default)]
#[allow(dead_code)] // accessed from asm only
pub struct Registers {
    x19: u64,
    x20: u64,
    x21: u64,
    x22: u64,
    x23: u64,
    x24: u64,
    x25: u64,
    x26: u64,
    x27: u64,
    x28: u64,
    /// Frame pointer (x29)
    fp: u64,
    /// Link register (x30); the switch returns through it
    lr: u64,
    sp: u64,
    /// Low halves of v8-v15
    d: [u64; 8],
}

/// Byte offset of the resumable flag inside `Context`
pub(super) const RESUMABLE_OFFSET: usize = 0xa8;

const _: () = {
    assert!(offset_of!(Registers, x19) == 0x00);
    assert!(offset_of!(Registers, fp) == 0x50);
    assert!(offset_of!(Registers, sp) == 0x60);
    assert!(offset_of!(Registers, d) == 0x68);
    assert!(std::mem::size_of::<Registers>() == RESUMABLE_OFFSET);
};

impl Registers {
    /// Builds the register image of a context that has never run.
    ///
    /// # Safety
    /// `stack_top` must be the 16-byte aligned upper end of a writable stack.
    pub unsafe fn fresh(stack_top: usize, entry: usize, arg: usize) -> Self {
        Registers {
            x19: arg as u64,
            x20: entry as u64,
            fp: 0,
            lr: bootstrap as *const () as usize as u64,
            sp: (stack_top & !15) as u64,
            ..Default::default()
        }
    }
}

#[unsafe(naked)]
unsafe extern "C" fn bootstrap() -> ! {
    naked_asm!(
        "mov x0, x19",
        "blr x20",
        // entry never returns
        "brk #1",
    );
}

/// Saves the callee-saved state into `from`, loads `to`, and publishes
/// `from` as resumable with a release store.
///
/// # Safety
/// Both pointers must reference live contexts; `to` must hold a complete
/// register image and be exclusively claimed by the caller.
#[unsafe(naked)]
pub unsafe extern "C" fn switch(_from: *const u8, _to: *const u8) {
    naked_asm!(
        "stp x19, x20, [x0, #0x00]",
        "stp x21, x22, [x0, #0x10]",
        "stp x23, x24, [x0, #0x20]",
        "stp x25, x26, [x0, #0x30]",
        "stp x27, x28, [x0, #0x40]",
        "stp x29, x30, [x0, #0x50]",
        "mov x9, sp",
        "str x9, [x0, #0x60]",
        "stp d8, d9, [x0, #0x68]",
        "stp d10, d11, [x0, #0x78]",
        "stp d12, d13, [x0, #0x88]",
        "stp d14, d15, [x0, #0x98]",
        "strb wzr, [x1, #0xa8]",
        "ldp x19, x20, [x1, #0x00]",
        "ldp x21, x22, [x1, #0x10]",
        "ldp x23, x24, [x1, #0x20]",
        "ldp x25, x26, [x1, #0x30]",
        "ldp x27, x28, [x1, #0x40]",
        "ldp x29, x30, [x1, #0x50]",
        "ldr x9, [x1, #0x60]",
        "mov sp, x9",
        "ldp d8, d9, [x1, #0x68]",
        "ldp d10, d11, [x1, #0x78]",
        "ldp d12, d13, [x1, #0x88]",
        "ldp d14, d15, [x1, #0x98]",
        "add x10, x0, #0xa8",
        "mov w11, #1",
        "stlrb w11, [x10]",
        "ret",
    );
}

/// Loads `to` without saving anything.
///
/// # Safety
/// Same as [`switch`]; the calling stack is abandoned.
#[unsafe(naked)]
pub unsafe extern "C" fn jump(_to: *const u8) -> ! {
    naked_asm!(
        "strb wzr, [x0, #0xa8]",
        "ldp x19, x20, [x0, #0x00]",
        "ldp x21, x22, [x0, #0x10]",
        "ldp x23, x24, [x0, #0x20]",
        "ldp x25, x26, [x0, #0x30]",
        "ldp x27, x28, [x0, #0x40]",
        "ldp x29, x30, [x0, #0x50]",
        "ldr x9, [x0, #0x60]",
        "mov sp, x9",
        "ldp d8, d9, [x0, #0x68]",
        "ldp d10, d11, [x0, #0x78]",
        "ldp d12, d13, [x0, #0x88]",
        "ldp d14, d15, [x0, #0x98]",
        "ret",
    );
}
