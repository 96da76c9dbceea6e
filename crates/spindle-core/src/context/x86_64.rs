//! x86_64 (System V) register save/restore

use std::arch::naked_asm;
use std::mem::offset_of;

/// Callee-saved state of a suspended context
#[repr(C)]
#[derive(Debug, Default)]
#[allow(dead_code)] // accessed from asm only
pub struct Registers {
    rsp: u64,
    rbp: u64,
    rbx: u64,
    r12: u64,
    r13: u64,
    r14: u64,
    r15: u64,
    /// SSE control/status (control bits are callee-saved)
    mxcsr: u32,
    /// x87 control word
    fpucw: u16,
    _pad: u16,
}

/// Byte offset of the resumable flag inside `Context`
pub(super) const RESUMABLE_OFFSET: usize = 0x40;

const _: () = {
    assert!(offset_of!(Registers, rsp) == 0x00);
    assert!(offset_of!(Registers, r15) == 0x30);
    assert!(offset_of!(Registers, mxcsr) == 0x38);
    assert!(offset_of!(Registers, fpucw) == 0x3c);
    assert!(std::mem::size_of::<Registers>() == RESUMABLE_OFFSET);
};

impl Registers {
    /// Builds the register image of a context that has never run.
    ///
    /// The first switch into it `ret`s into [`bootstrap`], which calls
    /// `entry(arg)` on the fresh stack.
    ///
    /// # Safety
    /// `stack_top` must be the 16-byte aligned upper end of a writable stack.
    pub unsafe fn fresh(stack_top: usize, entry: usize, arg: usize) -> Self {
        let rsp = stack_top - 16;
        unsafe { std::ptr::write(rsp as *mut u64, bootstrap as *const () as usize as u64) };

        Registers {
            rsp: rsp as u64,
            rbp: 0,
            r12: arg as u64,
            r13: entry as u64,
            mxcsr: 0x1f80,
            fpucw: 0x037f,
            ..Default::default()
        }
    }
}

/// First instructions executed on a fresh stack
#[unsafe(naked)]
unsafe extern "C" fn bootstrap() -> ! {
    naked_asm!(
        "and rsp, -16",
        "mov rdi, r12",
        "call r13",
        // entry never returns
        "ud2",
    );
}

/// Saves the callee-saved state into `from`, loads `to`, and publishes
/// `from` as resumable once nothing on its stack is touched any more.
///
/// # Safety
/// Both pointers must reference live contexts; `to` must hold a complete
/// register image and be exclusively claimed by the caller.
#[unsafe(naked)]
pub unsafe extern "C" fn switch(_from: *const u8, _to: *const u8) {
    naked_asm!(
        // save into from (rdi)
        "mov [rdi + 0x00], rsp",
        "mov [rdi + 0x08], rbp",
        "mov [rdi + 0x10], rbx",
        "mov [rdi + 0x18], r12",
        "mov [rdi + 0x20], r13",
        "mov [rdi + 0x28], r14",
        "mov [rdi + 0x30], r15",
        "stmxcsr dword ptr [rdi + 0x38]",
        "fnstcw word ptr [rdi + 0x3c]",
        // clear to (rsi)
        "mov byte ptr [rsi + 0x40], 0",
        // load from to
        "mov rsp, [rsi + 0x00]",
        "mov rbp, [rsi + 0x08]",
        "mov rbx, [rsi + 0x10]",
        "mov r12, [rsi + 0x18]",
        "mov r13, [rsi + 0x20]",
        "mov r14, [rsi + 0x28]",
        "mov r15, [rsi + 0x30]",
        "ldmxcsr dword ptr [rsi + 0x38]",
        "fldcw word ptr [rsi + 0x3c]",
        // TSO: every save above is visible before this store
        "mov byte ptr [rdi + 0x40], 1",
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
        "mov byte ptr [rdi + 0x40], 0",
        "mov rsp, [rdi + 0x00]",
        "mov rbp, [rdi + 0x08]",
        "mov rbx, [rdi + 0x10]",
        "mov r12, [rdi + 0x18]",
        "mov r13, [rdi + 0x20]",
        "mov r14, [rdi + 0x28]",
        "mov r15, [rdi + 0x30]",
        "ldmxcsr dword ptr [rdi + 0x38]",
        "fldcw word ptr [rdi + 0x3c]",
        "ret",
    );
}
