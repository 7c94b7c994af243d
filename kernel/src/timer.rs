//! Timer tick: the periodic source driving the scheduler and the
//! filesystem wall clock.

use core::sync::atomic::{AtomicU64, Ordering};

/// Nominal tick rate.
pub const TIMER_HZ: u64 = 100;

/// Vector the PIT's IRQ 0 is routed to.
pub const TIMER_VECTOR: u8 = 0x20;

/// Monotonic ticks since boot.
static TICKS: AtomicU64 = AtomicU64::new(0);

/// Unix time at boot, seeded once (0 with no RTC collaborator attached).
static BOOT_EPOCH: AtomicU64 = AtomicU64::new(0);

fn timer_interrupt(_vector: u8) {
    TICKS.fetch_add(1, Ordering::Relaxed);
    crate::sched::tick();
}

/// Install the tick handler and program the PIT at [`TIMER_HZ`].
#[cfg(target_os = "none")]
pub fn init() -> crate::error::Result<()> {
    crate::arch::x86_64::idt::register_interrupt_handler(TIMER_VECTOR, timer_interrupt)?;
    crate::arch::x86_64::pit::init(TIMER_HZ as u32);
    // IRQ 0 arrives as GSI 2 on typical chipsets; fall back to GSI 0.
    let dest = crate::arch::x86_64::apic::lapic_id().unwrap_or(0) as u8;
    if crate::arch::x86_64::apic::route_irq(2, TIMER_VECTOR, dest).is_err() {
        crate::arch::x86_64::apic::route_irq(0, TIMER_VECTOR, dest)?;
    }
    log::info!("timer: {} Hz tick on vector {:#x}", TIMER_HZ, TIMER_VECTOR);
    Ok(())
}

/// Ticks since boot.
pub fn ticks() -> u64 {
    TICKS.load(Ordering::Relaxed)
}

/// Seed the wall clock (from an RTC collaborator, or 0).
pub fn set_boot_epoch(unix_seconds: u64) {
    BOOT_EPOCH.store(unix_seconds, Ordering::Relaxed);
}

/// Wall-clock seconds for filesystem timestamps, derived from the tick.
pub fn wall_clock() -> u64 {
    BOOT_EPOCH.load(Ordering::Relaxed) + ticks() / TIMER_HZ
}

#[cfg(all(test, not(target_os = "none")))]
mod tests {
    use super::*;

    #[test]
    fn wall_clock_tracks_epoch_and_ticks() {
        let before = wall_clock();
        set_boot_epoch(1_000_000);
        assert!(wall_clock() >= 1_000_000);
        // Ticks advance the clock at TIMER_HZ per second.
        let base = wall_clock();
        for _ in 0..TIMER_HZ {
            timer_interrupt(TIMER_VECTOR);
        }
        assert_eq!(wall_clock(), base + 1);
        set_boot_epoch(0);
        let _ = before;
    }
}
