//! Per-process file-descriptor table.
//!
//! 256 numbered slots, each referencing a shared file description (payload +
//! flags + offset + refcount). `dup`/`dup2`/fork share the description, so
//! offsets and the final teardown are common to every alias. Slots 0-2 are
//! preconfigured console streams: serial input for stdin, the framebuffer
//! console for stdout/stderr — the FILE class as implemented for the boot
//! console.

use alloc::sync::Arc;

use spin::Mutex;

use super::{InodeId, OpenFlags};
use crate::error::{KernelError, Result};
use crate::ipc::Pipe;
use crate::net::Socket;

/// Capacity of the per-process table.
pub const MAX_FDS: usize = 256;

/// Discriminator tag of a descriptor slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FdTag {
    File,
    Socket,
    Pipe,
    Dir,
}

/// Which side of a pipe a descriptor holds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipeEnd {
    Read,
    Write,
}

/// Console stream behind fds 0-2.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConsoleStream {
    /// Serial input (stdin).
    Input,
    /// Framebuffer console output (stdout/stderr).
    Output,
}

/// What a descriptor points at.
pub enum FdPayload {
    File { inode: InodeId },
    Dir { inode: InodeId },
    Pipe { pipe: Arc<Pipe>, end: PipeEnd },
    Socket(Arc<Mutex<Socket>>),
    Console(ConsoleStream),
}

impl FdPayload {
    pub fn tag(&self) -> FdTag {
        match self {
            FdPayload::File { .. } | FdPayload::Console(_) => FdTag::File,
            FdPayload::Dir { .. } => FdTag::Dir,
            FdPayload::Pipe { .. } => FdTag::Pipe,
            FdPayload::Socket(_) => FdTag::Socket,
        }
    }
}

/// A shared file description.
pub struct FdEntry {
    pub payload: FdPayload,
    pub flags: OpenFlags,
    /// Byte offset; meaningful for files only.
    pub offset: u64,
    /// Alias count across dup/dup2/fork.
    pub refcount: u32,
}

type SharedEntry = Arc<Mutex<FdEntry>>;

pub struct FdTable {
    slots: [Option<SharedEntry>; MAX_FDS],
}

impl FdTable {
    /// An empty table (no console slots).
    pub fn empty() -> Self {
        Self {
            slots: [const { None }; MAX_FDS],
        }
    }

    /// A fresh process table with fds 0-2 wired to the console.
    pub fn with_console() -> Self {
        let mut table = Self::empty();
        table.slots[0] = Some(new_entry(
            FdPayload::Console(ConsoleStream::Input),
            OpenFlags::empty(),
        ));
        table.slots[1] = Some(new_entry(
            FdPayload::Console(ConsoleStream::Output),
            OpenFlags::O_WRONLY,
        ));
        table.slots[2] = Some(new_entry(
            FdPayload::Console(ConsoleStream::Output),
            OpenFlags::O_WRONLY,
        ));
        table
    }

    /// Install a payload in the first free slot. Fails with the EMFILE
    /// equivalent when the table is full.
    pub fn alloc(&mut self, payload: FdPayload, flags: OpenFlags) -> Result<usize> {
        let slot = self
            .slots
            .iter()
            .position(|s| s.is_none())
            .ok_or(KernelError::TooManyFiles)?;
        self.slots[slot] = Some(new_entry(payload, flags));
        Ok(slot)
    }

    pub fn get(&self, fd: usize) -> Result<SharedEntry> {
        self.slots
            .get(fd)
            .and_then(|s| s.clone())
            .ok_or(KernelError::BadDescriptor)
    }

    pub fn is_open(&self, fd: usize) -> bool {
        self.slots.get(fd).map(|s| s.is_some()).unwrap_or(false)
    }

    /// Drop one alias of `fd`. The last alias tears the payload down.
    pub fn release(&mut self, fd: usize) -> Result<()> {
        let entry = self
            .slots
            .get_mut(fd)
            .and_then(|s| s.take())
            .ok_or(KernelError::BadDescriptor)?;

        let mut guard = entry.lock();
        guard.refcount -= 1;
        if guard.refcount == 0 {
            teardown(&mut guard);
        }
        Ok(())
    }

    /// Duplicate `old` into the first free slot, sharing the description.
    pub fn dup(&mut self, old: usize) -> Result<usize> {
        let entry = self.get(old)?;
        let slot = self
            .slots
            .iter()
            .position(|s| s.is_none())
            .ok_or(KernelError::TooManyFiles)?;
        entry.lock().refcount += 1;
        self.slots[slot] = Some(entry);
        Ok(slot)
    }

    /// Duplicate `old` onto `new`, closing `new` first if open.
    pub fn dup2(&mut self, old: usize, new: usize) -> Result<usize> {
        if new >= MAX_FDS {
            return Err(KernelError::BadDescriptor);
        }
        let entry = self.get(old)?;
        if old == new {
            return Ok(new);
        }
        if self.is_open(new) {
            self.release(new)?;
        }
        entry.lock().refcount += 1;
        self.slots[new] = Some(entry);
        Ok(new)
    }

    /// Clone the table for fork: every populated slot's description gains an
    /// alias and the child inherits the numbering wholesale.
    pub fn fork_clone(&self) -> Self {
        let mut child = Self::empty();
        for (i, slot) in self.slots.iter().enumerate() {
            if let Some(entry) = slot {
                entry.lock().refcount += 1;
                child.slots[i] = Some(entry.clone());
            }
        }
        child
    }

    /// Release every open descriptor (process exit).
    pub fn release_all(&mut self) {
        for fd in 0..MAX_FDS {
            if self.is_open(fd) {
                let _ = self.release(fd);
            }
        }
    }

    /// Number of populated slots.
    pub fn open_count(&self) -> usize {
        self.slots.iter().filter(|s| s.is_some()).count()
    }
}

fn new_entry(payload: FdPayload, flags: OpenFlags) -> SharedEntry {
    Arc::new(Mutex::new(FdEntry {
        payload,
        flags,
        offset: 0,
        refcount: 1,
    }))
}

/// Build the two descriptions of a fresh pipe.
pub fn pipe_pair() -> (FdPayload, FdPayload) {
    let pipe = Arc::new(Pipe::new());
    (
        FdPayload::Pipe {
            pipe: pipe.clone(),
            end: PipeEnd::Read,
        },
        FdPayload::Pipe {
            pipe,
            end: PipeEnd::Write,
        },
    )
}

fn teardown(entry: &mut FdEntry) {
    match &entry.payload {
        FdPayload::Pipe { pipe, end } => match end {
            PipeEnd::Read => pipe.release_reader(),
            PipeEnd::Write => pipe.release_writer(),
        },
        FdPayload::Socket(socket) => socket.lock().close(),
        FdPayload::File { .. } | FdPayload::Dir { .. } | FdPayload::Console(_) => {}
    }
}
