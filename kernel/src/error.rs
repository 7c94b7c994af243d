//! Kernel error types and the Linux errno boundary.
//!
//! Kernel-internal code returns `Result<T, KernelError>`; the syscall
//! dispatcher is the only place errors are flattened into the signed-return
//! ABI (non-negative success, negative errno).

use core::fmt;

/// Main kernel error type
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[must_use = "kernel errors must be handled, not silently discarded"]
pub enum KernelError {
    /// No physical frames / heap space left
    OutOfMemory,
    /// Malformed argument (bad flags, bad alignment, zero length, ...)
    InvalidArgument,
    /// File descriptor is not open
    BadDescriptor,
    /// User pointer not mapped in the current address space
    BadAddress,
    /// Path or object does not exist
    NotFound,
    /// Object exists but access is not permitted
    PermissionDenied,
    /// Device or collaborator reported a transfer failure
    Io,
    /// Per-process descriptor table is full
    TooManyFiles,
    /// Operation not implemented for this object
    NotSupported,
    /// Seek on a non-seekable object
    IllegalSeek,
    /// Path component is not a directory
    NotADirectory,
    /// Directory where a file was required
    IsADirectory,
    /// Write end of a pipe with no readers left
    BrokenPipe,
    /// Operation would block and blocking is not supported here
    WouldBlock,
    /// No such process
    NoSuchProcess,
    /// Not a valid executable image
    InvalidExecutable,
    /// Subsystem used before its `init()` ran
    NotInitialized { subsystem: &'static str },
}

impl fmt::Display for KernelError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            KernelError::OutOfMemory => write!(f, "out of memory"),
            KernelError::InvalidArgument => write!(f, "invalid argument"),
            KernelError::BadDescriptor => write!(f, "bad file descriptor"),
            KernelError::BadAddress => write!(f, "bad address"),
            KernelError::NotFound => write!(f, "not found"),
            KernelError::PermissionDenied => write!(f, "permission denied"),
            KernelError::Io => write!(f, "I/O error"),
            KernelError::TooManyFiles => write!(f, "too many open files"),
            KernelError::NotSupported => write!(f, "operation not supported"),
            KernelError::IllegalSeek => write!(f, "illegal seek"),
            KernelError::NotADirectory => write!(f, "not a directory"),
            KernelError::IsADirectory => write!(f, "is a directory"),
            KernelError::BrokenPipe => write!(f, "broken pipe"),
            KernelError::WouldBlock => write!(f, "operation would block"),
            KernelError::NoSuchProcess => write!(f, "no such process"),
            KernelError::InvalidExecutable => write!(f, "invalid executable"),
            KernelError::NotInitialized { subsystem } => {
                write!(f, "{} used before init", subsystem)
            }
        }
    }
}

/// Linux x86-64 errno values surfaced through the syscall ABI.
#[repr(i64)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Errno {
    Eperm = 1,
    Enoent = 2,
    Esrch = 3,
    Eio = 5,
    Eagain = 11,
    Enomem = 12,
    Eacces = 13,
    Efault = 14,
    Eexist = 17,
    Enotdir = 20,
    Eisdir = 21,
    Einval = 22,
    Emfile = 24,
    Espipe = 29,
    Epipe = 32,
    Enosys = 38,
    Enoexec = 8,
    Ebadf = 9,
    Echild = 10,
}

impl Errno {
    /// The negative value placed in RAX on syscall failure.
    pub const fn as_neg(self) -> i64 {
        -(self as i64)
    }
}

impl From<KernelError> for Errno {
    fn from(err: KernelError) -> Self {
        match err {
            KernelError::OutOfMemory => Errno::Enomem,
            KernelError::InvalidArgument => Errno::Einval,
            KernelError::BadDescriptor => Errno::Ebadf,
            KernelError::BadAddress => Errno::Efault,
            KernelError::NotFound => Errno::Enoent,
            KernelError::PermissionDenied => Errno::Eacces,
            KernelError::Io => Errno::Eio,
            KernelError::TooManyFiles => Errno::Emfile,
            KernelError::NotSupported => Errno::Enosys,
            KernelError::IllegalSeek => Errno::Espipe,
            KernelError::NotADirectory => Errno::Enotdir,
            KernelError::IsADirectory => Errno::Eisdir,
            KernelError::BrokenPipe => Errno::Epipe,
            KernelError::WouldBlock => Errno::Eagain,
            KernelError::NoSuchProcess => Errno::Esrch,
            KernelError::InvalidExecutable => Errno::Enoexec,
            KernelError::NotInitialized { .. } => Errno::Eio,
        }
    }
}

/// Kernel-internal result type
pub type Result<T> = core::result::Result<T, KernelError>;
