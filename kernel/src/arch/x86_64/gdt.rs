// Global Descriptor Table and TSS

use lazy_static::lazy_static;
use x86_64::{
    structures::{
        gdt::{Descriptor, GlobalDescriptorTable, SegmentSelector},
        tss::TaskStateSegment,
    },
    VirtAddr,
};

/// IST indices (zero-based; hardware IST number is index + 1). Each fault
/// class below gets its own dedicated 16 KiB stack.
pub const DEBUG_IST_INDEX: u16 = 0;
pub const NMI_IST_INDEX: u16 = 1;
pub const DOUBLE_FAULT_IST_INDEX: u16 = 2;
pub const MACHINE_CHECK_IST_INDEX: u16 = 3;
pub const STACK_FAULT_IST_INDEX: u16 = 4;
pub const GP_FAULT_IST_INDEX: u16 = 5;
pub const GENERAL_IRQ_IST_INDEX: u16 = 6;

const IST_COUNT: usize = 7;
const IST_STACK_SIZE: usize = 16 * 1024;

/// Selector values fixed by the GDT layout below. Process creation stamps
/// these into fresh CPU-state snapshots without touching the live GDT.
pub const KERNEL_CS: u16 = 0x08;
pub const KERNEL_SS: u16 = 0x10;
pub const USER_SS: u16 = 0x2B; // 0x28 | RPL 3
pub const USER_CS: u16 = 0x33; // 0x30 | RPL 3

#[repr(align(16))]
#[allow(dead_code)] // Alignment wrapper -- accessed via raw pointer
struct IstStack([u8; IST_STACK_SIZE]);

static mut IST_STACKS: [IstStack; IST_COUNT] = [
    IstStack([0; IST_STACK_SIZE]),
    IstStack([0; IST_STACK_SIZE]),
    IstStack([0; IST_STACK_SIZE]),
    IstStack([0; IST_STACK_SIZE]),
    IstStack([0; IST_STACK_SIZE]),
    IstStack([0; IST_STACK_SIZE]),
    IstStack([0; IST_STACK_SIZE]),
];

lazy_static! {
    static ref TSS: TaskStateSegment = {
        let mut tss = TaskStateSegment::new();

        // Ring 3 -> Ring 0 transition stack (RSP0). Replaced per-process by
        // the scheduler via set_kernel_stack.
        tss.privilege_stack_table[0] = {
            const STACK_SIZE: usize = 16 * 1024;
            #[repr(align(16))]
            #[allow(dead_code)]
            struct AlignedStack([u8; STACK_SIZE]);
            static mut KERNEL_STACK: AlignedStack = AlignedStack([0; STACK_SIZE]);

            let stack_ptr = &raw const KERNEL_STACK;
            VirtAddr::from_ptr(stack_ptr) + STACK_SIZE as u64
        };

        // One dedicated stack per fault class. The TSS IST fields are the
        // only record of each stack top.
        let base = &raw const IST_STACKS as *const IstStack;
        for i in 0..IST_COUNT {
            let stack_ptr = base.wrapping_add(i);
            tss.interrupt_stack_table[i] =
                VirtAddr::from_ptr(stack_ptr) + IST_STACK_SIZE as u64;
        }
        tss
    };
}

lazy_static! {
    static ref GDT: (GlobalDescriptorTable, Selectors) = {
        let mut gdt = GlobalDescriptorTable::new();
        let code_selector = gdt.append(Descriptor::kernel_code_segment());     // 0x08
        let data_selector = gdt.append(Descriptor::kernel_data_segment());     // 0x10
        let tss_selector = gdt.append(Descriptor::tss_segment(&TSS));          // 0x18 (2 entries)
        let user_data_selector = gdt.append(Descriptor::user_data_segment());  // 0x28 (+ RPL 3 = 0x2B)
        let user_code_selector = gdt.append(Descriptor::user_code_segment());  // 0x30 (+ RPL 3 = 0x33)
        (
            gdt,
            Selectors {
                code_selector,
                data_selector,
                tss_selector,
                user_data_selector,
                user_code_selector,
            },
        )
    };
}

/// GDT segment selectors.
///
/// Layout:
/// - 0x00: Null descriptor
/// - 0x08: Kernel code segment (Ring 0)
/// - 0x10: Kernel data segment (Ring 0)
/// - 0x18: TSS (occupies 2 entries, 0x18-0x20)
/// - 0x28: User data segment (Ring 3, selector 0x2B with RPL)
/// - 0x30: User code segment (Ring 3, selector 0x33 with RPL)
///
/// The user data/code order matches SYSRET expectations:
/// SYSRET computes SS = STAR[63:48]+8, CS = STAR[63:48]+16.
pub struct Selectors {
    pub code_selector: SegmentSelector,
    pub data_selector: SegmentSelector,
    pub tss_selector: SegmentSelector,
    pub user_data_selector: SegmentSelector,
    pub user_code_selector: SegmentSelector,
}

#[cfg(target_os = "none")]
pub fn init() {
    use x86_64::instructions::{
        segmentation::{Segment, CS, DS, ES, SS},
        tables::load_tss,
    };

    GDT.0.load();
    // SAFETY: the selectors come from GDT.1, computed from the GDT loaded on
    // the line above, so every register ends up referencing a live
    // descriptor.
    unsafe {
        CS::set_reg(GDT.1.code_selector);
        DS::set_reg(GDT.1.data_selector);
        ES::set_reg(GDT.1.data_selector);
        SS::set_reg(GDT.1.data_selector);
        load_tss(GDT.1.tss_selector);
    }
    log::info!("gdt: 5 segments + TSS loaded, {} IST stacks", IST_COUNT);
}

/// Returns the GDT selectors. Forces GDT construction on first use.
pub fn selectors() -> &'static Selectors {
    &GDT.1
}

/// Update the Ring 3 -> Ring 0 transition stack (RSP0) in the TSS.
///
/// Called on context switch with interrupts disabled, so no concurrent
/// access can observe the intermediate state.
pub fn set_kernel_stack(stack_top: u64) {
    // SAFETY: single writer by the interrupts-disabled contract above; the
    // TSS static outlives every caller.
    unsafe {
        let tss_ptr = &*TSS as *const TaskStateSegment as *mut TaskStateSegment;
        (*tss_ptr).privilege_stack_table[0] = VirtAddr::new(stack_top);
    }
}

/// Read the current RSP0 value from the TSS.
pub fn kernel_stack() -> u64 {
    TSS.privilege_stack_table[0].as_u64()
}

#[cfg(all(test, not(target_os = "none")))]
mod tests {
    use super::*;

    #[test]
    fn selector_constants_match_gdt_layout() {
        let sel = selectors();
        assert_eq!(sel.code_selector.0, KERNEL_CS);
        assert_eq!(sel.data_selector.0, KERNEL_SS);
        assert_eq!(sel.user_data_selector.0, USER_SS);
        assert_eq!(sel.user_code_selector.0, USER_CS);
    }

    #[test]
    fn every_ist_stack_is_distinct() {
        let tss = &*TSS;
        for i in 0..IST_COUNT {
            let top = tss.interrupt_stack_table[i].as_u64();
            assert_ne!(top, 0);
            for j in 0..i {
                assert_ne!(top, tss.interrupt_stack_table[j].as_u64());
            }
        }
    }
}
