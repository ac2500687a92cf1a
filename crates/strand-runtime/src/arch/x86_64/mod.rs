//! x86_64 context switching (System V AMD64)
//!
//! Only callee-saved state crosses a switch: rsp, rbx, rbp, r12-r15, the
//! MXCSR control bits and the x87 control word. Everything else is
//! clobbered by the `call` into `switch_context` anyway.

use super::ContextEntry;
use std::arch::naked_asm;

/// Saved register file of a suspended context
#[repr(C)]
#[derive(Debug, Default, Clone, Copy)]
pub struct SavedRegs {
    pub rsp: u64,   // 0x00
    pub rip: u64,   // 0x08
    pub rbx: u64,   // 0x10
    pub rbp: u64,   // 0x18
    pub r12: u64,   // 0x20
    pub r13: u64,   // 0x28
    pub r14: u64,   // 0x30
    pub r15: u64,   // 0x38
    pub mxcsr: u32, // 0x40
    pub fpucw: u16, // 0x44
    _pad: u16,
}

/// Prepare `regs` so that switching to it runs `entry(arg)` on the stack
/// ending at `stack_top`.
///
/// # Safety
///
/// `regs` must be valid for writes. `stack_top` must be the high end of a
/// writable stack that outlives the context.
#[inline]
pub unsafe fn init_context(regs: *mut SavedRegs, stack_top: *mut u8, entry: ContextEntry, arg: usize) {
    // rsp must be 16-byte aligned at the `call` in the trampoline
    let sp = (stack_top as usize) & !0xF;

    *regs = SavedRegs {
        rsp: sp as u64,
        rip: context_trampoline as usize as u64,
        r12: entry as usize as u64,
        r13: arg as u64,
        mxcsr: 0x1F80,
        fpucw: 0x037F,
        ..SavedRegs::default()
    };
}

/// First code run on a fresh stack: `entry(arg)`, which never returns
#[unsafe(naked)]
unsafe extern "C" fn context_trampoline() {
    naked_asm!(
        "mov rdi, r13",
        "call r12",
        "ud2",
    );
}

/// Save the running context into `old` and resume `new`
///
/// Returns when some other context switches back into `old`.
///
/// # Safety
///
/// `old` must be valid for writes, `new` must hold a context produced by
/// `init_context` or a previous `switch_context`, and that context must not
/// be running on any thread.
#[unsafe(naked)]
pub unsafe extern "C" fn switch_context(_old: *mut SavedRegs, _new: *const SavedRegs) {
    naked_asm!(
        // Save callee-saved state to old (RDI)
        "mov [rdi + 0x00], rsp",
        "lea rax, [rip + 1f]",
        "mov [rdi + 0x08], rax",
        "mov [rdi + 0x10], rbx",
        "mov [rdi + 0x18], rbp",
        "mov [rdi + 0x20], r12",
        "mov [rdi + 0x28], r13",
        "mov [rdi + 0x30], r14",
        "mov [rdi + 0x38], r15",
        "stmxcsr [rdi + 0x40]",
        "fnstcw [rdi + 0x44]",
        // Load from new (RSI)
        "mov rsp, [rsi + 0x00]",
        "mov rax, [rsi + 0x08]",
        "mov rbx, [rsi + 0x10]",
        "mov rbp, [rsi + 0x18]",
        "mov r12, [rsi + 0x20]",
        "mov r13, [rsi + 0x28]",
        "mov r14, [rsi + 0x30]",
        "mov r15, [rsi + 0x38]",
        "ldmxcsr [rsi + 0x40]",
        "fldcw [rsi + 0x44]",
        "jmp rax",
        // Resumed contexts land here and return to their caller
        "1:",
        "ret",
    );
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_layout_matches_asm_offsets() {
        assert_eq!(std::mem::offset_of!(SavedRegs, r15), 0x38);
        assert_eq!(std::mem::offset_of!(SavedRegs, mxcsr), 0x40);
        assert_eq!(std::mem::offset_of!(SavedRegs, fpucw), 0x44);
        assert_eq!(std::mem::size_of::<SavedRegs>(), 0x48);
    }

    extern "C" fn never(_: usize) -> ! {
        std::process::abort()
    }

    #[test]
    fn test_init_aligns_stack() {
        let mut regs = SavedRegs::default();
        let top = 0x1000_0007usize as *mut u8;
        unsafe { init_context(&mut regs, top, never, 42) };
        assert_eq!(regs.rsp % 16, 0);
        assert_eq!(regs.r13, 42);
        assert_eq!(regs.mxcsr, 0x1F80);
    }
}
