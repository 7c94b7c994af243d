// Programmable interval timer: the boot-time periodic source.

/// PIT input clock in Hz.
#[cfg(target_os = "none")]
const PIT_FREQUENCY: u32 = 1_193_182;

#[cfg(target_os = "none")]
const PIT_CHANNEL0: u16 = 0x40;
#[cfg(target_os = "none")]
const PIT_COMMAND: u16 = 0x43;

/// Program channel 0 as a rate generator at `hz` interrupts per second.
#[cfg(target_os = "none")]
pub fn init(hz: u32) {
    use x86_64::instructions::port::Port;

    let divisor = (PIT_FREQUENCY / hz) as u16;
    let mut command: Port<u8> = Port::new(PIT_COMMAND);
    let mut channel0: Port<u8> = Port::new(PIT_CHANNEL0);

    // SAFETY: standard PIT programming sequence; channel 0, lobyte/hibyte,
    // mode 2 (rate generator), binary counting.
    unsafe {
        command.write(0x34);
        channel0.write((divisor & 0xFF) as u8);
        channel0.write((divisor >> 8) as u8);
    }
    log::info!("pit: channel 0 at {} Hz (divisor {})", hz, divisor);
}

/// Busy-wait for roughly `milliseconds` using a one-shot countdown on
/// channel 0. Boot-time helper only; reprograms the channel, so call `init`
/// again afterwards if the periodic tick is needed.
#[cfg(target_os = "none")]
pub fn wait(milliseconds: u32) {
    use x86_64::instructions::port::Port;

    let cycles = (PIT_FREQUENCY / 1000 * milliseconds) as u16;
    let mut command: Port<u8> = Port::new(PIT_COMMAND);
    let mut channel0: Port<u8> = Port::new(PIT_CHANNEL0);

    // SAFETY: mode 0 (interrupt on terminal count) with latched status
    // reads; ports are owned by the kernel at this point.
    unsafe {
        command.write(0x30);
        channel0.write((cycles & 0xFF) as u8);
        channel0.write((cycles >> 8) as u8);

        loop {
            command.write(0xE2); // read-back status, channel 0
            if channel0.read() & 0x80 != 0 {
                break;
            }
            core::hint::spin_loop();
        }
    }
}
