//! Architecture support. x86-64 only.

#[cfg(target_arch = "x86_64")]
pub mod x86_64;

/// Halt the CPU forever with interrupts disabled.
pub fn halt() -> ! {
    #[cfg(all(target_arch = "x86_64", target_os = "none"))]
    {
        ::x86_64::instructions::interrupts::disable();
        loop {
            ::x86_64::instructions::hlt();
        }
    }
    #[cfg(not(all(target_arch = "x86_64", target_os = "none")))]
    loop {
        core::hint::spin_loop();
    }
}

/// Enable interrupts on this CPU.
pub fn enable_interrupts() {
    #[cfg(all(target_arch = "x86_64", target_os = "none"))]
    ::x86_64::instructions::interrupts::enable();
}

/// Disable interrupts on this CPU.
pub fn disable_interrupts() {
    #[cfg(all(target_arch = "x86_64", target_os = "none"))]
    ::x86_64::instructions::interrupts::disable();
}

/// Wait for the next interrupt.
pub fn wait_for_interrupt() {
    #[cfg(all(target_arch = "x86_64", target_os = "none"))]
    ::x86_64::instructions::hlt();
    #[cfg(not(all(target_arch = "x86_64", target_os = "none")))]
    core::hint::spin_loop();
}
