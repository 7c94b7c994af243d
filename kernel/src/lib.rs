//! FerriteOS kernel library.
//!
//! `#![no_std]` on bare metal (`target_os = "none"`), where the custom block
//! heap backs the global allocator. On the host the crate links `std` and
//! the system allocator, so the core logic runs under the standard `cargo
//! test` harness against in-memory stand-ins for the hardware.

#![cfg_attr(target_os = "none", no_std)]
#![feature(abi_x86_interrupt)]
#![cfg_attr(target_os = "none", feature(alloc_error_handler))]

extern crate alloc;

#[cfg(not(target_os = "none"))]
extern crate std;

#[macro_use]
pub mod print;

pub mod arch;
pub mod boot;
pub mod elf;
pub mod error;
pub mod fs;
pub mod graphics;
pub mod ipc;
pub mod logger;
pub mod mm;
pub mod net;
pub mod process;
pub mod sched;
pub mod serial;
pub mod syscall;
pub mod timer;

// Bare metal: the block-list heap is the global allocator.
#[cfg(target_os = "none")]
#[global_allocator]
static ALLOCATOR: mm::heap::KernelHeap = mm::heap::KernelHeap::new();

// Host target: system allocator, so test code allocates normally.
#[cfg(not(target_os = "none"))]
#[global_allocator]
static SYSTEM_ALLOCATOR: std::alloc::System = std::alloc::System;

/// The global kernel heap (bare metal only).
#[cfg(target_os = "none")]
pub fn kernel_heap() -> &'static mm::heap::KernelHeap {
    &ALLOCATOR
}

/// Heap allocation failure in a no_std kernel is unrecoverable.
#[cfg(target_os = "none")]
#[alloc_error_handler]
fn alloc_error_handler(layout: core::alloc::Layout) -> ! {
    panic!("kernel heap exhausted: {:?}", layout);
}

// Re-exports used across the test suite.
pub use error::{Errno, KernelError};
pub use mm::{MemoryRegion, PAGE_SIZE};
pub use process::{Pid, Process, ProcessState};
