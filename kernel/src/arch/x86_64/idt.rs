// Interrupt Descriptor Table and the common dispatch path.
//
// Every one of the 256 vectors gets a stub that funnels into a single
// dispatcher, which consults the registered handler tables. Exception
// vectors (0-31) carry an ExceptionContext with the CPU-pushed error code;
// regular interrupts are acknowledged at the local APIC before their handler
// runs, so a handler may context-switch without losing the EOI.

use lazy_static::lazy_static;
use spin::RwLock;
use x86_64::structures::idt::{InterruptDescriptorTable, InterruptStackFrame, PageFaultErrorCode};

use super::gdt;
use crate::error::{KernelError, Result};

/// Handler for a regular interrupt vector (32-255). Receives the vector.
pub type InterruptHandler = fn(u8);

/// Handler for a CPU exception vector (0-31).
pub type ExceptionHandler = fn(&ExceptionContext);

/// Snapshot of an exception delivered to the common dispatcher.
#[derive(Debug, Clone, Copy)]
pub struct ExceptionContext {
    pub vector: u8,
    pub error_code: u64,
    pub instruction_pointer: u64,
    pub code_segment: u16,
    /// Faulting address, page faults only.
    pub cr2: Option<u64>,
}

impl ExceptionContext {
    /// True when the exception interrupted ring 3.
    pub fn from_user(&self) -> bool {
        self.code_segment & 0b11 == 0b11
    }
}

static INTERRUPT_HANDLERS: RwLock<[Option<InterruptHandler>; 256]> = RwLock::new([None; 256]);
static EXCEPTION_HANDLERS: RwLock<[Option<ExceptionHandler>; 32]> = RwLock::new([None; 32]);

/// Exception names for diagnostics, indexed by vector.
const EXCEPTION_NAMES: [&str; 32] = [
    "Division Error",
    "Debug",
    "Non-Maskable Interrupt",
    "Breakpoint",
    "Overflow",
    "Bound Range Exceeded",
    "Invalid Opcode",
    "Device Not Available",
    "Double Fault",
    "Coprocessor Segment Overrun",
    "Invalid TSS",
    "Segment Not Present",
    "Stack-Segment Fault",
    "General Protection Fault",
    "Page Fault",
    "Reserved",
    "x87 FPU Error",
    "Alignment Check",
    "Machine Check",
    "SIMD Exception",
    "Virtualization Exception",
    "Control Protection Exception",
    "Reserved",
    "Reserved",
    "Reserved",
    "Reserved",
    "Reserved",
    "Reserved",
    "Hypervisor Injection Exception",
    "VMM Communication Exception",
    "Security Exception",
    "Reserved",
];

pub fn exception_name(vector: u8) -> &'static str {
    if (vector as usize) < EXCEPTION_NAMES.len() {
        EXCEPTION_NAMES[vector as usize]
    } else {
        "Unknown Exception"
    }
}

/// Install a handler for a regular interrupt vector (32-255).
pub fn register_interrupt_handler(vector: u8, handler: InterruptHandler) -> Result<()> {
    if vector < 32 {
        return Err(KernelError::InvalidArgument);
    }
    INTERRUPT_HANDLERS.write()[vector as usize] = Some(handler);
    Ok(())
}

/// Install a handler for an exception vector (0-31).
pub fn register_exception_handler(vector: u8, handler: ExceptionHandler) -> Result<()> {
    if vector >= 32 {
        return Err(KernelError::InvalidArgument);
    }
    EXCEPTION_HANDLERS.write()[vector as usize] = Some(handler);
    Ok(())
}

/// Common dispatch for regular interrupts.
fn dispatch_interrupt(vector: u8) {
    // Acknowledge first: the handler may rotate the ready queue and not
    // return to this frame for a while.
    #[cfg(target_os = "none")]
    super::apic::lapic_eoi();

    let handler = INTERRUPT_HANDLERS.read()[vector as usize];
    if let Some(handler) = handler {
        handler(vector);
    }
}

/// Common dispatch for exceptions.
fn dispatch_exception(ctx: &ExceptionContext) {
    let handler = EXCEPTION_HANDLERS.read()[ctx.vector as usize];
    if let Some(handler) = handler {
        handler(ctx);
        return;
    }

    if ctx.from_user() {
        // A faulting user process dies; the kernel stays live.
        log::error!(
            "{} in user process at {:#x} (error {:#x}, cr2 {:?})",
            exception_name(ctx.vector),
            ctx.instruction_pointer,
            ctx.error_code,
            ctx.cr2,
        );
        crate::process::terminate_current_on_fault(ctx.vector);
        return;
    }

    fatal_exception(ctx);
}

/// Print a diagnostic and halt: a CPU exception in kernel mode is fatal.
fn fatal_exception(ctx: &ExceptionContext) -> ! {
    log::error!(
        "KERNEL FAULT: {} (vector {}) at {:#x}, error code {:#x}",
        exception_name(ctx.vector),
        ctx.vector,
        ctx.instruction_pointer,
        ctx.error_code,
    );
    if let Some(cr2) = ctx.cr2 {
        log::error!("faulting address (CR2): {:#x}", cr2);
    }
    crate::arch::halt();
}

fn exception_context(vector: u8, frame: &InterruptStackFrame, error_code: u64) -> ExceptionContext {
    ExceptionContext {
        vector,
        error_code,
        instruction_pointer: frame.instruction_pointer.as_u64(),
        code_segment: frame.code_segment.0,
        cr2: None,
    }
}

macro_rules! exception_stub {
    ($name:ident, $vector:expr) => {
        extern "x86-interrupt" fn $name(frame: InterruptStackFrame) {
            dispatch_exception(&exception_context($vector, &frame, 0));
        }
    };
    ($name:ident, $vector:expr, with_error) => {
        extern "x86-interrupt" fn $name(frame: InterruptStackFrame, error_code: u64) {
            dispatch_exception(&exception_context($vector, &frame, error_code));
        }
    };
}

exception_stub!(divide_error_handler, 0);
exception_stub!(debug_handler, 1);
exception_stub!(nmi_handler, 2);
exception_stub!(breakpoint_handler, 3);
exception_stub!(overflow_handler, 4);
exception_stub!(bound_range_handler, 5);
exception_stub!(invalid_opcode_handler, 6);
exception_stub!(device_not_available_handler, 7);
exception_stub!(invalid_tss_handler, 10, with_error);
exception_stub!(segment_not_present_handler, 11, with_error);
exception_stub!(stack_segment_handler, 12, with_error);
exception_stub!(general_protection_handler, 13, with_error);
exception_stub!(x87_floating_point_handler, 16);
exception_stub!(alignment_check_handler, 17, with_error);
exception_stub!(simd_floating_point_handler, 19);
exception_stub!(virtualization_handler, 20);

extern "x86-interrupt" fn double_fault_handler(frame: InterruptStackFrame, error_code: u64) -> ! {
    fatal_exception(&exception_context(8, &frame, error_code));
}

extern "x86-interrupt" fn machine_check_handler(frame: InterruptStackFrame) -> ! {
    fatal_exception(&exception_context(18, &frame, 0));
}

extern "x86-interrupt" fn page_fault_handler(
    frame: InterruptStackFrame,
    error_code: PageFaultErrorCode,
) {
    let cr2 = {
        #[cfg(target_os = "none")]
        {
            x86_64::registers::control::Cr2::read()
                .ok()
                .map(|addr| addr.as_u64())
        }
        #[cfg(not(target_os = "none"))]
        {
            None
        }
    };
    let ctx = ExceptionContext {
        cr2,
        ..exception_context(14, &frame, error_code.bits())
    };
    dispatch_exception(&ctx);
}

// One stub per regular interrupt vector; generated table below.
macro_rules! irq_stubs {
    ($(($name:ident, $vector:expr)),+ $(,)?) => {
        $(
            extern "x86-interrupt" fn $name(_frame: InterruptStackFrame) {
                dispatch_interrupt($vector);
            }
        )+
        const IRQ_STUBS: [extern "x86-interrupt" fn(InterruptStackFrame); 224] =
            [$($name),+];
    };
}

include!("irq_stubs.rs");

lazy_static! {
    static ref IDT: InterruptDescriptorTable = {
        let mut idt = InterruptDescriptorTable::new();

        idt.divide_error.set_handler_fn(divide_error_handler);
        idt.breakpoint.set_handler_fn(breakpoint_handler);
        idt.overflow.set_handler_fn(overflow_handler);
        idt.bound_range_exceeded
            .set_handler_fn(bound_range_handler);
        idt.invalid_opcode.set_handler_fn(invalid_opcode_handler);
        idt.device_not_available
            .set_handler_fn(device_not_available_handler);
        idt.invalid_tss.set_handler_fn(invalid_tss_handler);
        idt.segment_not_present
            .set_handler_fn(segment_not_present_handler);
        idt.page_fault.set_handler_fn(page_fault_handler);
        idt.x87_floating_point
            .set_handler_fn(x87_floating_point_handler);
        idt.alignment_check.set_handler_fn(alignment_check_handler);
        idt.simd_floating_point
            .set_handler_fn(simd_floating_point_handler);
        idt.virtualization.set_handler_fn(virtualization_handler);

        // Fault classes with dedicated IST stacks.
        // SAFETY: the IST indices are valid slots filled in by the TSS
        // construction in gdt.rs.
        unsafe {
            idt.debug
                .set_handler_fn(debug_handler)
                .set_stack_index(gdt::DEBUG_IST_INDEX);
            idt.non_maskable_interrupt
                .set_handler_fn(nmi_handler)
                .set_stack_index(gdt::NMI_IST_INDEX);
            idt.double_fault
                .set_handler_fn(double_fault_handler)
                .set_stack_index(gdt::DOUBLE_FAULT_IST_INDEX);
            idt.machine_check
                .set_handler_fn(machine_check_handler)
                .set_stack_index(gdt::MACHINE_CHECK_IST_INDEX);
            idt.stack_segment_fault
                .set_handler_fn(stack_segment_handler)
                .set_stack_index(gdt::STACK_FAULT_IST_INDEX);
            idt.general_protection_fault
                .set_handler_fn(general_protection_handler)
                .set_stack_index(gdt::GP_FAULT_IST_INDEX);

        }

        // Regular interrupts stay on the interrupted context's stack (RSP0
        // after a ring-3 entry): an IST slot would reset to the same top on
        // every delivery and clobber the frame of a process that was
        // switched away mid-interrupt. The seventh IST stack exists for
        // handlers that opt in explicitly.
        for (i, stub) in IRQ_STUBS.iter().enumerate() {
            idt[(i + 32) as u8].set_handler_fn(*stub);
        }

        idt
    };
}

#[cfg(target_os = "none")]
pub fn init() {
    IDT.load();
    log::info!("idt: 256 vectors installed");
}

#[cfg(all(test, not(target_os = "none")))]
mod tests {
    use super::*;
    use core::sync::atomic::{AtomicU32, Ordering};

    #[test]
    fn registration_rejects_wrong_ranges() {
        fn dummy_irq(_v: u8) {}
        fn dummy_exc(_c: &ExceptionContext) {}

        assert!(register_interrupt_handler(31, dummy_irq).is_err());
        assert!(register_interrupt_handler(32, dummy_irq).is_ok());
        assert!(register_exception_handler(32, dummy_exc).is_err());
        assert!(register_exception_handler(3, dummy_exc).is_ok());
    }

    #[test]
    fn dispatch_reaches_registered_handler() {
        static HITS: AtomicU32 = AtomicU32::new(0);
        fn count(_v: u8) {
            HITS.fetch_add(1, Ordering::Relaxed);
        }
        register_interrupt_handler(0xFE, count).unwrap();
        dispatch_interrupt(0xFE);
        dispatch_interrupt(0xFE);
        assert_eq!(HITS.load(Ordering::Relaxed), 2);
    }

    #[test]
    fn exception_names_cover_the_classics() {
        assert_eq!(exception_name(8), "Double Fault");
        assert_eq!(exception_name(13), "General Protection Fault");
        assert_eq!(exception_name(14), "Page Fault");
        assert_eq!(exception_name(200), "Unknown Exception");
    }

    #[test]
    fn user_mode_detection_uses_rpl() {
        let mut ctx = ExceptionContext {
            vector: 14,
            error_code: 0,
            instruction_pointer: 0,
            code_segment: crate::arch::x86_64::gdt::USER_CS,
            cr2: Some(0),
        };
        assert!(ctx.from_user());
        ctx.code_segment = crate::arch::x86_64::gdt::KERNEL_CS;
        assert!(!ctx.from_user());
    }
}
