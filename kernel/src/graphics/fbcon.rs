//! Framebuffer console: renders ASCII with the 8x16 font onto the linear
//! framebuffer handed over by the bootloader.
//!
//! The console scrolls by moving whole pixel rows. Before `init` (or on a
//! machine without a framebuffer) `_print` falls through to the serial sink
//! so early output is never lost.

use core::fmt;

use spin::Mutex;

use super::font8x16::{self, FONT_HEIGHT, FONT_WIDTH};

/// Pixel channel order of the framebuffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PixelFormat {
    /// Blue in the lowest byte (the common BIOS/UEFI layout)
    Bgr,
    /// Red in the lowest byte
    Rgb,
}

/// 24-bit colour, packed into the native pixel layout at draw time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Rgb(pub u8, pub u8, pub u8);

/// Default foreground: light gray
const DEFAULT_FG: Rgb = Rgb(0xAA, 0xAA, 0xAA);
/// Default background: black
const DEFAULT_BG: Rgb = Rgb(0x00, 0x00, 0x00);

/// Geometry of a mapped framebuffer.
#[derive(Debug, Clone, Copy)]
pub struct FramebufferInfo {
    pub addr: *mut u8,
    pub width: usize,
    pub height: usize,
    /// Bytes per pixel row.
    pub pitch: usize,
    /// Bytes per pixel (4 in every mode the core supports).
    pub bytes_per_pixel: usize,
    pub format: PixelFormat,
}

pub struct FramebufferConsole {
    fb: FramebufferInfo,
    cols: usize,
    rows: usize,
    cursor_col: usize,
    cursor_row: usize,
    fg: Rgb,
    bg: Rgb,
}

// SAFETY: the console is only reached through the FBCON spinlock; the
// framebuffer pointer stays valid for the kernel's lifetime.
unsafe impl Send for FramebufferConsole {}

static FBCON: Mutex<Option<FramebufferConsole>> = Mutex::new(None);

impl FramebufferConsole {
    fn new(fb: FramebufferInfo) -> Self {
        Self {
            cols: fb.width / FONT_WIDTH,
            rows: fb.height / FONT_HEIGHT,
            fb,
            cursor_col: 0,
            cursor_row: 0,
            fg: DEFAULT_FG,
            bg: DEFAULT_BG,
        }
    }

    fn pack(&self, colour: Rgb) -> u32 {
        let Rgb(r, g, b) = colour;
        match self.fb.format {
            PixelFormat::Bgr => ((r as u32) << 16) | ((g as u32) << 8) | b as u32,
            PixelFormat::Rgb => ((b as u32) << 16) | ((g as u32) << 8) | r as u32,
        }
    }

    fn put_pixel(&mut self, x: usize, y: usize, colour: u32) {
        let offset = y * self.fb.pitch + x * self.fb.bytes_per_pixel;
        // SAFETY: x/y are clamped by the glyph loops to the framebuffer
        // geometry reported by the bootloader.
        unsafe {
            (self.fb.addr.add(offset) as *mut u32).write_volatile(colour);
        }
    }

    fn draw_glyph(&mut self, ch: u8, col: usize, row: usize) {
        let rows = font8x16::glyph(ch);
        let fg = self.pack(self.fg);
        let bg = self.pack(self.bg);
        let x0 = col * FONT_WIDTH;
        let y0 = row * FONT_HEIGHT;
        for (dy, bits) in rows.iter().enumerate() {
            for dx in 0..FONT_WIDTH {
                let colour = if bits & (1 << dx) != 0 { fg } else { bg };
                self.put_pixel(x0 + dx, y0 + dy, colour);
            }
        }
    }

    fn scroll(&mut self) {
        let row_bytes = self.fb.pitch * FONT_HEIGHT;
        let visible = self.rows * FONT_HEIGHT * self.fb.pitch;
        // SAFETY: copy stays inside the framebuffer: source starts one text
        // row down and the length excludes that row.
        unsafe {
            core::ptr::copy(
                self.fb.addr.add(row_bytes),
                self.fb.addr,
                visible - row_bytes,
            );
        }
        let last_row = self.rows - 1;
        for col in 0..self.cols {
            self.draw_glyph(b' ', col, last_row);
        }
    }

    fn newline(&mut self) {
        self.cursor_col = 0;
        if self.cursor_row + 1 >= self.rows {
            self.scroll();
        } else {
            self.cursor_row += 1;
        }
    }

    fn put_char(&mut self, ch: u8) {
        match ch {
            b'\n' => self.newline(),
            b'\r' => self.cursor_col = 0,
            b'\t' => {
                let next = (self.cursor_col + 8) & !7;
                while self.cursor_col < next.min(self.cols) {
                    self.put_char(b' ');
                }
            }
            _ => {
                if self.cursor_col >= self.cols {
                    self.newline();
                }
                self.draw_glyph(ch, self.cursor_col, self.cursor_row);
                self.cursor_col += 1;
            }
        }
    }

    pub fn set_colours(&mut self, fg: Rgb, bg: Rgb) {
        self.fg = fg;
        self.bg = bg;
    }

    pub fn clear(&mut self) {
        for row in 0..self.rows {
            for col in 0..self.cols {
                self.draw_glyph(b' ', col, row);
            }
        }
        self.cursor_col = 0;
        self.cursor_row = 0;
    }
}

impl fmt::Write for FramebufferConsole {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        for byte in s.bytes() {
            self.put_char(byte);
        }
        Ok(())
    }
}

/// Adopt the bootloader framebuffer and clear it.
pub fn init(fb: FramebufferInfo) {
    let mut console = FramebufferConsole::new(fb);
    console.clear();
    *FBCON.lock() = Some(console);
    log::info!(
        "fbcon: {}x{} pixels, {}x{} cells",
        fb.width,
        fb.height,
        fb.width / FONT_WIDTH,
        fb.height / FONT_HEIGHT
    );
}

/// Console byte sink for the write syscall (stdout/stderr).
pub fn write_bytes(bytes: &[u8]) {
    let mut fbcon = FBCON.lock();
    match fbcon.as_mut() {
        Some(console) => {
            for &b in bytes {
                console.put_char(b);
            }
        }
        None => {
            // No framebuffer: the serial sink is the console of record.
            for &b in bytes {
                crate::serial::write_fmt(format_args!("{}", b as char));
            }
        }
    }
}

#[doc(hidden)]
pub fn _print(args: fmt::Arguments) {
    use fmt::Write;
    let mut fbcon = FBCON.lock();
    match fbcon.as_mut() {
        Some(console) => {
            let _ = console.write_fmt(args);
        }
        None => crate::serial::write_fmt(args),
    }
}
