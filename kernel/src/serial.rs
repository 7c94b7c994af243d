//! COM1 serial port: the kernel's debug logging sink.
//!
//! 115200 8N1 with FIFOs enabled at a 14-byte trigger. Sends are blocking,
//! byte at a time, which is exactly what a crash path wants.

use core::fmt;

#[cfg(target_os = "none")]
use spin::Mutex;
#[cfg(target_os = "none")]
use uart_16550::SerialPort;

const COM1_BASE: u16 = 0x3F8;

#[cfg(target_os = "none")]
static COM1: Mutex<Option<SerialPort>> = Mutex::new(None);

#[cfg(target_os = "none")]
pub fn init() {
    // SAFETY: COM1_BASE is the architectural COM1 port block, owned by the
    // kernel from here on.
    let mut port = unsafe { SerialPort::new(COM1_BASE) };
    port.init();

    // The crate's init leaves the divisor at 38400 baud; reprogram for
    // 115200 (divisor 1) via the DLAB window.
    use x86_64::instructions::port::Port;
    // SAFETY: standard 16550 divisor-latch sequence on ports the kernel owns.
    unsafe {
        let mut lcr: Port<u8> = Port::new(COM1_BASE + 3);
        let mut dll: Port<u8> = Port::new(COM1_BASE);
        let mut dlm: Port<u8> = Port::new(COM1_BASE + 1);
        let saved = lcr.read();
        lcr.write(saved | 0x80); // DLAB on
        dll.write(1);
        dlm.write(0);
        lcr.write(saved & !0x80); // DLAB off, keep 8N1
    }

    *COM1.lock() = Some(port);
}

#[cfg(target_os = "none")]
pub fn write_fmt(args: fmt::Arguments) {
    use fmt::Write;
    let mut com1 = COM1.lock();
    if let Some(port) = com1.as_mut() {
        let _ = port.write_fmt(args);
    }
}

/// Non-blocking read of one byte, for the console stdin path. Polls the
/// line-status register directly so an idle line returns `None` instead of
/// stalling the caller.
#[cfg(target_os = "none")]
pub fn read_byte() -> Option<u8> {
    use x86_64::instructions::port::Port;

    let _guard = COM1.lock();
    let mut lsr: Port<u8> = Port::new(COM1_BASE + 5);
    let mut data: Port<u8> = Port::new(COM1_BASE);
    // SAFETY: COM1 registers, serialised by the port lock above.
    unsafe {
        if lsr.read() & 0x01 != 0 {
            Some(data.read())
        } else {
            None
        }
    }
}

// Host stand-ins so logging call sites compile in unit tests.
#[cfg(not(target_os = "none"))]
pub fn init() {}

#[cfg(not(target_os = "none"))]
pub fn write_fmt(_args: fmt::Arguments) {}

#[cfg(not(target_os = "none"))]
pub fn read_byte() -> Option<u8> {
    None
}

#[doc(hidden)]
pub fn _print(args: fmt::Arguments) {
    write_fmt(args);
}
