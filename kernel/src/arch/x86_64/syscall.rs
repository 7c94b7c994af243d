//! `syscall`/`sysret` fast path.
//!
//! Arguments follow the Linux convention: number in RAX, arguments in RDI,
//! RSI, RDX, R10, R8, R9; the result returns in RAX. The entry stub swaps to
//! a dedicated kernel stack, bridges R10 into the C ABI's fourth register
//! and hands off to the dispatcher.

#[cfg(target_os = "none")]
const SYSCALL_STACK_SIZE: usize = 32 * 1024;

#[cfg(target_os = "none")]
#[repr(align(16))]
struct SyscallStack([u8; SYSCALL_STACK_SIZE]);

#[cfg(target_os = "none")]
static mut SYSCALL_STACK: SyscallStack = SyscallStack([0; SYSCALL_STACK_SIZE]);

/// Top of the syscall kernel stack; loaded by the entry stub.
#[cfg(target_os = "none")]
static mut SYSCALL_STACK_TOP: u64 = 0;

/// Saved user RSP for the duration of one syscall.
#[cfg(target_os = "none")]
static mut SAVED_USER_RSP: u64 = 0;

#[cfg(target_os = "none")]
extern "C" fn syscall_gateway(
    a1: u64,
    a2: u64,
    a3: u64,
    a4: u64,
    a5: u64,
    a6: u64,
    num: u64,
) -> i64 {
    crate::syscall::dispatch(num, [a1, a2, a3, a4, a5, a6])
}

#[cfg(target_os = "none")]
#[unsafe(naked)]
unsafe extern "C" fn syscall_entry() {
    // On entry: RCX = user RIP, R11 = user RFLAGS, interrupts masked by
    // SFMASK. The uniprocessor core uses one static kernel stack; SMP would
    // move these slots behind KERNEL_GS_BASE.
    core::arch::naked_asm!(
        "mov [rip + {saved_rsp}], rsp",
        "mov rsp, [rip + {stack_top}]",
        "push rcx", // user rip
        "push r11", // user rflags
        "mov rcx, r10",
        "sub rsp, 8",
        "push rax", // syscall number, 7th C argument
        "call {gateway}",
        "add rsp, 16",
        "pop r11",
        "pop rcx",
        "mov rsp, [rip + {saved_rsp}]",
        "sysretq",
        saved_rsp = sym SAVED_USER_RSP,
        stack_top = sym SYSCALL_STACK_TOP,
        gateway = sym syscall_gateway,
    )
}

/// Program the syscall MSRs: EFER.SCE, STAR selectors, LSTAR entry point and
/// the SFMASK interrupt mask.
#[cfg(target_os = "none")]
pub fn init() {
    use x86_64::registers::model_specific::{Efer, EferFlags, LStar, SFMask, Star};
    use x86_64::registers::rflags::RFlags;
    use x86_64::VirtAddr;

    let selectors = super::gdt::selectors();

    // SAFETY: the static stack top is written once, before the first
    // `syscall` can occur.
    unsafe {
        SYSCALL_STACK_TOP = (&raw const SYSCALL_STACK as u64) + SYSCALL_STACK_SIZE as u64;
    }

    // SAFETY: selectors come from the loaded GDT and satisfy the STAR layout
    // contract; the entry stub is a valid LSTAR target for the kernel's
    // lifetime.
    unsafe {
        Efer::update(|flags| flags.insert(EferFlags::SYSTEM_CALL_EXTENSIONS));
        Star::write(
            selectors.user_code_selector,
            selectors.user_data_selector,
            selectors.code_selector,
            selectors.data_selector,
        )
        .expect("GDT layout violates STAR constraints");
        LStar::write(VirtAddr::new(syscall_entry as usize as u64));
        SFMask::write(RFlags::INTERRUPT_FLAG);
    }
    log::info!("syscall: MSRs programmed, entry at {:p}", syscall_entry as *const ());
}
