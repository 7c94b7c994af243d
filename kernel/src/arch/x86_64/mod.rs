//! x86-64 support: descriptor tables, interrupt controllers, timers,
//! context switching and the syscall fast path.

pub mod acpi;
pub mod apic;
pub mod context;
pub mod gdt;
pub mod idt;
pub mod pic;
pub mod pit;
pub mod syscall;

/// Bring up the CPU-local tables: GDT/TSS first (the IDT's IST indices
/// reference it), then the IDT, then the legacy PIC remap-and-mask.
#[cfg(target_os = "none")]
pub fn init_tables() {
    gdt::init();
    idt::init();
    pic::init();
}
