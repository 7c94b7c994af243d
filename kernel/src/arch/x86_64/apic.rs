//! Local APIC and I/O APIC.
//!
//! The local APIC is enabled through the APIC-base MSR and its
//! spurious-interrupt register; LINT0/LINT1 are masked and the task priority
//! register is zeroed so every priority class is accepted. I/O APIC
//! redirection entries start masked and are programmed one IRQ at a time.

use alloc::vec::Vec;

use spin::{Mutex, Once};

use super::acpi::AcpiInfo;
use crate::error::{KernelError, Result};
use crate::mm::{DirectMap, PhysicalAddress};

// Local APIC register offsets (bytes).
const LAPIC_ID: u32 = 0x020;
const LAPIC_EOI: u32 = 0x0B0;
const LAPIC_SVR: u32 = 0x0F0;
const LAPIC_ESR: u32 = 0x280;
const LAPIC_ICR_LOW: u32 = 0x300;
const LAPIC_ICR_HIGH: u32 = 0x310;
const LAPIC_TIMER_LVT: u32 = 0x320;
const LAPIC_LINT0: u32 = 0x350;
const LAPIC_LINT1: u32 = 0x360;
const LAPIC_ERROR_LVT: u32 = 0x370;
const LAPIC_TIMER_INITIAL: u32 = 0x380;
const LAPIC_TIMER_DIVIDE: u32 = 0x3E0;
const LAPIC_TPR: u32 = 0x080;

const LAPIC_SVR_ENABLE: u32 = 1 << 8;
const LAPIC_LVT_MASKED: u32 = 1 << 16;
const LAPIC_TIMER_PERIODIC: u32 = 1 << 17;
const LAPIC_ICR_SEND_PENDING: u32 = 1 << 12;

/// IA32_APIC_BASE MSR.
const APIC_BASE_MSR: u32 = 0x1B;
const APIC_BASE_ENABLE: u64 = 1 << 11;

/// The spurious interrupt parks on the last vector.
const SPURIOUS_VECTOR: u32 = 0xFF;

pub struct LocalApic {
    base: *mut u32,
}

// SAFETY: the register window belongs to this CPU's LAPIC; access is
// serialised behind the module lock.
unsafe impl Send for LocalApic {}

impl LocalApic {
    fn write(&self, reg: u32, value: u32) {
        // SAFETY: reg is one of the architected register offsets within the
        // 4 KiB LAPIC window mapped at `base`. The read-back forces the
        // write to post (required by the manual).
        unsafe {
            core::ptr::write_volatile(self.base.add((reg / 4) as usize), value);
            core::ptr::read_volatile(self.base.add((LAPIC_ID / 4) as usize));
        }
    }

    fn read(&self, reg: u32) -> u32 {
        // SAFETY: as in `write`.
        unsafe { core::ptr::read_volatile(self.base.add((reg / 4) as usize)) }
    }

    /// APIC ID of this CPU.
    pub fn id(&self) -> u32 {
        self.read(LAPIC_ID) >> 24
    }

    /// Signal end-of-interrupt.
    pub fn eoi(&self) {
        self.write(LAPIC_EOI, 0);
    }

    /// Enable the APIC and accept all interrupt priorities.
    fn enable(&self) {
        #[cfg(target_os = "none")]
        {
            use x86_64::registers::model_specific::Msr;
            let mut msr = Msr::new(APIC_BASE_MSR);
            // SAFETY: setting the architected enable bit of IA32_APIC_BASE
            // on a CPU known (via CPUID) to carry an APIC.
            unsafe {
                let value = msr.read();
                msr.write(value | APIC_BASE_ENABLE);
            }
        }

        self.write(LAPIC_SVR, LAPIC_SVR_ENABLE | SPURIOUS_VECTOR);
        self.write(LAPIC_LINT0, LAPIC_LVT_MASKED);
        self.write(LAPIC_LINT1, LAPIC_LVT_MASKED);
        self.write(LAPIC_ERROR_LVT, 0xFE);

        // Clear any latched errors, then drop stale interrupts.
        self.write(LAPIC_ESR, 0);
        self.write(LAPIC_ESR, 0);
        self.eoi();

        // Accept every priority class.
        self.write(LAPIC_TPR, 0);
    }

    /// Send an inter-processor interrupt and wait for delivery to post.
    pub fn send_ipi(&self, apic_id: u32, vector: u8) {
        self.write(LAPIC_ICR_HIGH, apic_id << 24);
        self.write(LAPIC_ICR_LOW, vector as u32);
        while self.read(LAPIC_ICR_LOW) & LAPIC_ICR_SEND_PENDING != 0 {
            core::hint::spin_loop();
        }
    }

    /// Start the LAPIC timer in periodic mode on `vector`.
    pub fn timer_start(&self, vector: u8, initial_count: u32) {
        self.write(LAPIC_TIMER_DIVIDE, 0x3); // divide by 16
        self.write(LAPIC_TIMER_LVT, LAPIC_TIMER_PERIODIC | vector as u32);
        self.write(LAPIC_TIMER_INITIAL, initial_count);
    }

    pub fn timer_stop(&self) {
        self.write(LAPIC_TIMER_LVT, LAPIC_LVT_MASKED);
        self.write(LAPIC_TIMER_INITIAL, 0);
    }
}

pub struct IoApic {
    base: *mut u32,
    pub id: u8,
    pub gsi_base: u32,
    pub max_redirections: u32,
}

// SAFETY: redirection entries are only written during boot-CPU setup, as
// serialised by the module lock.
unsafe impl Send for IoApic {}

// I/O APIC indirect registers.
const IOAPIC_REG_VERSION: u32 = 0x01;
const IOAPIC_REG_REDTBL_BASE: u32 = 0x10;

/// A masked, otherwise empty redirection entry.
const IOAPIC_MASKED: u64 = 1 << 16;

impl IoApic {
    fn read(&self, reg: u32) -> u32 {
        // SAFETY: IOREGSEL sits at +0x00 and IOWIN at +0x10 of the window;
        // both are 32-bit registers.
        unsafe {
            core::ptr::write_volatile(self.base, reg);
            core::ptr::read_volatile(self.base.add(4))
        }
    }

    fn write(&self, reg: u32, value: u32) {
        // SAFETY: as in `read`.
        unsafe {
            core::ptr::write_volatile(self.base, reg);
            core::ptr::write_volatile(self.base.add(4), value);
        }
    }

    fn read_redirection(&self, index: u32) -> u64 {
        let low = self.read(IOAPIC_REG_REDTBL_BASE + index * 2) as u64;
        let high = self.read(IOAPIC_REG_REDTBL_BASE + index * 2 + 1) as u64;
        (high << 32) | low
    }

    fn write_redirection(&self, index: u32, entry: u64) {
        self.write(IOAPIC_REG_REDTBL_BASE + index * 2, entry as u32);
        self.write(IOAPIC_REG_REDTBL_BASE + index * 2 + 1, (entry >> 32) as u32);
    }

    /// Route `irq` (relative to this I/O APIC's GSI base) to `vector`.
    pub fn set_irq(&self, irq: u32, vector: u8, delivery_mode: u8, masked: bool, dest: u8) {
        let entry = redirection_entry(vector, delivery_mode, masked, dest);
        self.write_redirection(irq, entry);
    }

    /// Mask `irq`, preserving the rest of the redirection entry.
    pub fn mask_irq(&self, irq: u32) {
        let entry = self.read_redirection(irq);
        self.write_redirection(irq, entry | IOAPIC_MASKED);
    }

    /// Unmask `irq`, preserving the rest of the redirection entry.
    pub fn unmask_irq(&self, irq: u32) {
        let entry = self.read_redirection(irq);
        self.write_redirection(irq, entry & !IOAPIC_MASKED);
    }
}

/// Build a 64-bit redirection entry.
fn redirection_entry(vector: u8, delivery_mode: u8, masked: bool, dest: u8) -> u64 {
    let mut entry = vector as u64;
    entry |= ((delivery_mode & 0x7) as u64) << 8;
    if masked {
        entry |= IOAPIC_MASKED;
    }
    entry |= (dest as u64) << 56;
    entry
}

static LOCAL_APIC: Once<Mutex<LocalApic>> = Once::new();
static IO_APICS: Mutex<Vec<IoApic>> = Mutex::new(Vec::new());

/// Bring up the local APIC and all I/O APICs found in the MADT.
pub fn init(dmap: DirectMap, acpi: &AcpiInfo) -> Result<()> {
    if acpi.lapic_address == 0 {
        return Err(KernelError::NotFound);
    }

    let lapic = LocalApic {
        base: dmap.ptr_of(PhysicalAddress::new(acpi.lapic_address)) as *mut u32,
    };
    lapic.enable();
    log::info!("lapic: enabled, id {}", lapic.id());
    LOCAL_APIC.call_once(|| Mutex::new(lapic));

    let mut io_apics = IO_APICS.lock();
    for entry in &acpi.io_apics {
        let ioapic = IoApic {
            base: dmap.ptr_of(PhysicalAddress::new(entry.address)) as *mut u32,
            id: entry.id,
            gsi_base: entry.gsi_base,
            max_redirections: 0,
        };
        let version = ioapic.read(IOAPIC_REG_VERSION);
        let max_redirections = ((version >> 16) & 0xFF) + 1;
        let ioapic = IoApic {
            max_redirections,
            ..ioapic
        };

        // Every line starts masked; drivers unmask what they own.
        for i in 0..max_redirections {
            ioapic.write_redirection(i, IOAPIC_MASKED);
        }

        log::info!(
            "ioapic {}: gsi base {}, {} redirection entries",
            ioapic.id,
            ioapic.gsi_base,
            max_redirections
        );
        io_apics.push(ioapic);
    }

    Ok(())
}

/// Route a global system interrupt to `vector` on the boot CPU, unmasked.
pub fn route_irq(gsi: u32, vector: u8, dest: u8) -> Result<()> {
    let io_apics = IO_APICS.lock();
    for ioapic in io_apics.iter() {
        if gsi >= ioapic.gsi_base && gsi < ioapic.gsi_base + ioapic.max_redirections {
            ioapic.set_irq(gsi - ioapic.gsi_base, vector, 0, false, dest);
            return Ok(());
        }
    }
    Err(KernelError::NotFound)
}

/// End-of-interrupt on the local APIC. No-op before `init` so spurious
/// early vectors cannot fault.
pub fn lapic_eoi() {
    if let Some(lapic) = LOCAL_APIC.get() {
        lapic.lock().eoi();
    }
}

/// Local APIC ID of the boot CPU.
pub fn lapic_id() -> Option<u32> {
    LOCAL_APIC.get().map(|l| l.lock().id())
}

#[cfg(all(test, not(target_os = "none")))]
mod tests {
    use super::*;

    #[test]
    fn redirection_entry_packs_fields() {
        let entry = redirection_entry(0x20, 0, false, 3);
        assert_eq!(entry & 0xFF, 0x20);
        assert_eq!(entry >> 56, 3);
        assert_eq!(entry & IOAPIC_MASKED, 0);

        let masked = redirection_entry(0x31, 0b101, true, 0);
        assert_eq!(masked & 0xFF, 0x31);
        assert_eq!((masked >> 8) & 0x7, 0b101);
        assert_ne!(masked & IOAPIC_MASKED, 0);
    }
}
