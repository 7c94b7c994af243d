//! CPU state snapshots and the context switch.
//!
//! A [`CpuContext`] is only read or written while its process is not running
//! on any CPU; the running process's state lives in the registers themselves.

use super::gdt;

/// Full general-purpose register file plus the iretq frame.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default)]
pub struct CpuContext {
    pub r15: u64,    // 0x00
    pub r14: u64,    // 0x08
    pub r13: u64,    // 0x10
    pub r12: u64,    // 0x18
    pub r11: u64,    // 0x20
    pub r10: u64,    // 0x28
    pub r9: u64,     // 0x30
    pub r8: u64,     // 0x38
    pub rbp: u64,    // 0x40
    pub rdi: u64,    // 0x48
    pub rsi: u64,    // 0x50
    pub rdx: u64,    // 0x58
    pub rcx: u64,    // 0x60
    pub rbx: u64,    // 0x68
    pub rax: u64,    // 0x70
    pub rip: u64,    // 0x78
    pub cs: u64,     // 0x80
    pub rflags: u64, // 0x88
    pub rsp: u64,    // 0x90
    pub ss: u64,     // 0x98
}

const _: () = assert!(core::mem::size_of::<CpuContext>() == 0xA0);

/// RFLAGS with interrupts enabled plus the always-set reserved bit.
pub const RFLAGS_INTERRUPTS_ENABLED: u64 = 0x202;

impl CpuContext {
    /// Snapshot for a fresh kernel task: entry point, empty registers,
    /// interrupts enabled, kernel selectors.
    pub fn kernel_entry(entry: u64, stack_top: u64) -> Self {
        Self {
            rip: entry,
            cs: gdt::KERNEL_CS as u64,
            rflags: RFLAGS_INTERRUPTS_ENABLED,
            rsp: stack_top,
            ss: gdt::KERNEL_SS as u64,
            ..Self::default()
        }
    }

    /// Snapshot for a user process about to run `entry` on `stack_top`.
    pub fn user_entry(entry: u64, stack_top: u64) -> Self {
        Self {
            rip: entry,
            cs: gdt::USER_CS as u64,
            rflags: RFLAGS_INTERRUPTS_ENABLED,
            rsp: stack_top,
            ss: gdt::USER_SS as u64,
            ..Self::default()
        }
    }
}

/// Save the outgoing CPU state into `old` (skipped when null) and resume
/// `new` via an iretq frame built from its snapshot.
///
/// # Safety
///
/// `new` must point at a coherent snapshot whose rip/rsp/selectors describe a
/// runnable context in the current address space. `old`, when non-null, must
/// be writable and stay untouched until the process is next scheduled.
#[cfg(target_os = "none")]
#[unsafe(naked)]
pub unsafe extern "C" fn context_switch(old: *mut CpuContext, new: *const CpuContext) {
    core::arch::naked_asm!(
        // rdi = old, rsi = new. Null old means initial switch: nothing to save.
        "test rdi, rdi",
        "jz 2f",
        "mov [rdi + 0x00], r15",
        "mov [rdi + 0x08], r14",
        "mov [rdi + 0x10], r13",
        "mov [rdi + 0x18], r12",
        "mov [rdi + 0x20], r11",
        "mov [rdi + 0x28], r10",
        "mov [rdi + 0x30], r9",
        "mov [rdi + 0x38], r8",
        "mov [rdi + 0x40], rbp",
        "mov [rdi + 0x48], rdi",
        "mov [rdi + 0x50], rsi",
        "mov [rdi + 0x58], rdx",
        "mov [rdi + 0x60], rcx",
        "mov [rdi + 0x68], rbx",
        "mov [rdi + 0x70], rax",
        // Resume point: the return address this call will come back to.
        "mov rax, [rsp]",
        "mov [rdi + 0x78], rax",
        "mov rax, cs",
        "mov [rdi + 0x80], rax",
        "pushfq",
        "pop rax",
        "mov [rdi + 0x88], rax",
        "lea rax, [rsp + 8]",
        "mov [rdi + 0x90], rax",
        "mov rax, ss",
        "mov [rdi + 0x98], rax",
        "2:",
        // Build the iretq frame for the incoming context.
        "mov rax, [rsi + 0x98]",
        "push rax", // ss
        "mov rax, [rsi + 0x90]",
        "push rax", // rsp
        "mov rax, [rsi + 0x88]",
        "push rax", // rflags
        "mov rax, [rsi + 0x80]",
        "push rax", // cs
        "mov rax, [rsi + 0x78]",
        "push rax", // rip
        "mov r15, [rsi + 0x00]",
        "mov r14, [rsi + 0x08]",
        "mov r13, [rsi + 0x10]",
        "mov r12, [rsi + 0x18]",
        "mov r11, [rsi + 0x20]",
        "mov r10, [rsi + 0x28]",
        "mov r9,  [rsi + 0x30]",
        "mov r8,  [rsi + 0x38]",
        "mov rbp, [rsi + 0x40]",
        "mov rdi, [rsi + 0x48]",
        "mov rdx, [rsi + 0x58]",
        "mov rcx, [rsi + 0x60]",
        "mov rbx, [rsi + 0x68]",
        "mov rax, [rsi + 0x70]",
        "mov rsi, [rsi + 0x50]",
        "iretq",
    )
}

/// Host stand-in: the scheduler's bookkeeping is exercised in tests without
/// transferring control.
///
/// # Safety
///
/// No-op; signature mirrors the bare-metal version.
#[cfg(not(target_os = "none"))]
pub unsafe extern "C" fn context_switch(_old: *mut CpuContext, _new: *const CpuContext) {}
