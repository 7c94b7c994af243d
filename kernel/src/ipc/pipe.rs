//! Anonymous pipes: a bounded FIFO byte buffer with separate reader and
//! writer reference counts.
//!
//! The core is non-blocking: a read on an empty pipe with live writers
//! returns zero bytes rather than parking the caller. Once the last writer
//! is gone the end-of-stream latch is set and never cleared.

use alloc::vec;
use alloc::vec::Vec;

use spin::Mutex;

use crate::error::{KernelError, Result};

/// Default pipe capacity in bytes. Must be a power of two.
pub const PIPE_CAPACITY: usize = 4096;

struct PipeInner {
    buf: Vec<u8>,
    /// Read position; advances on each read, modulo capacity.
    head: usize,
    /// Write position; advances on each write, modulo capacity.
    tail: usize,
    /// Bytes currently buffered.
    count: usize,
    readers: u32,
    writers: u32,
    /// Set when the last writer is released; never cleared.
    eof: bool,
}

pub struct Pipe {
    inner: Mutex<PipeInner>,
    capacity: usize,
}

impl Pipe {
    /// A pipe with the default 4 KiB buffer and one reader + one writer.
    pub fn new() -> Self {
        Self::with_capacity(PIPE_CAPACITY).expect("default capacity is a power of two")
    }

    /// A pipe with a caller-chosen power-of-two capacity.
    pub fn with_capacity(capacity: usize) -> Result<Self> {
        if capacity == 0 || !capacity.is_power_of_two() {
            return Err(KernelError::InvalidArgument);
        }
        Ok(Self {
            inner: Mutex::new(PipeInner {
                buf: vec![0; capacity],
                head: 0,
                tail: 0,
                count: 0,
                readers: 1,
                writers: 1,
                eof: false,
            }),
            capacity,
        })
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Read up to `buf.len()` bytes.
    ///
    /// Returns 0 both at end-of-stream (no writers, buffer drained) and when
    /// the buffer is momentarily empty with writers still attached.
    pub fn read(&self, buf: &mut [u8]) -> usize {
        let mut inner = self.inner.lock();
        if inner.count == 0 {
            return 0;
        }

        let mask = self.capacity - 1;
        let n = buf.len().min(inner.count);
        for slot in buf.iter_mut().take(n) {
            *slot = inner.buf[inner.head];
            inner.head = (inner.head + 1) & mask;
        }
        inner.count -= n;
        n
    }

    /// Write as many bytes as fit; fails with `BrokenPipe` when no reader is
    /// attached.
    pub fn write(&self, data: &[u8]) -> Result<usize> {
        let mut inner = self.inner.lock();
        if inner.readers == 0 {
            return Err(KernelError::BrokenPipe);
        }

        let mask = self.capacity - 1;
        let space = self.capacity - inner.count;
        let n = data.len().min(space);
        for &byte in data.iter().take(n) {
            let tail = inner.tail;
            inner.buf[tail] = byte;
            inner.tail = (tail + 1) & mask;
        }
        inner.count += n;
        Ok(n)
    }

    /// Bytes currently buffered.
    pub fn len(&self) -> usize {
        self.inner.lock().count
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// End-of-stream: drained and no writer can refill it.
    pub fn at_eof(&self) -> bool {
        let inner = self.inner.lock();
        inner.count == 0 && (inner.eof || inner.writers == 0)
    }

    pub fn add_reader(&self) {
        self.inner.lock().readers += 1;
    }

    pub fn add_writer(&self) {
        self.inner.lock().writers += 1;
    }

    /// Drop one reader reference. The pipe becomes non-readable for writers
    /// (EPIPE) once the count reaches zero.
    pub fn release_reader(&self) {
        let mut inner = self.inner.lock();
        if inner.readers > 0 {
            inner.readers -= 1;
        }
    }

    /// Drop one writer reference; the last one sets the EOF latch.
    pub fn release_writer(&self) {
        let mut inner = self.inner.lock();
        if inner.writers > 0 {
            inner.writers -= 1;
            if inner.writers == 0 {
                inner.eof = true;
            }
        }
    }

    pub fn readers(&self) -> u32 {
        self.inner.lock().readers
    }

    pub fn writers(&self) -> u32 {
        self.inner.lock().writers
    }
}

impl Default for Pipe {
    fn default() -> Self {
        Self::new()
    }
}
