// Legacy 8259 PIC: remapped out of the exception range, then retired.

use pic8259::ChainedPics;
use spin::Mutex;

/// Vector base for the primary PIC after remapping.
pub const PIC_1_OFFSET: u8 = 0x20;
/// Vector base for the secondary PIC after remapping.
pub const PIC_2_OFFSET: u8 = 0x28;

static PICS: Mutex<ChainedPics> =
    Mutex::new(unsafe { ChainedPics::new(PIC_1_OFFSET, PIC_2_OFFSET) });

/// Remap the PICs to 0x20/0x28 so spurious IRQs cannot alias CPU
/// exceptions, then mask every line. Interrupt delivery moves to the
/// I/O APIC afterwards.
#[cfg(target_os = "none")]
pub fn init() {
    let mut pics = PICS.lock();
    // SAFETY: the offsets keep the PIC vectors clear of the exception range
    // and nothing else is driving the PIC ports during boot.
    unsafe {
        pics.initialize();
        pics.disable();
    }
    log::info!("pic: remapped to {:#x}/{:#x} and masked", PIC_1_OFFSET, PIC_2_OFFSET);
}
