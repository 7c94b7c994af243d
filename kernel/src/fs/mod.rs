//! Filesystem interface.
//!
//! The on-disk filesystem is an external collaborator; the kernel core talks
//! to it through the [`FileSystem`] trait. [`ramfs`] provides the in-memory
//! implementation used for the boot root and by the test suite.

pub mod fd_table;
pub mod ramfs;

use alloc::sync::Arc;

use spin::Once;

use crate::error::Result;

/// Stable identifier of an inode within a filesystem.
pub type InodeId = u64;

bitflags::bitflags! {
    /// Linux open(2) flag subset honoured by the core.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct OpenFlags: u32 {
        const O_WRONLY    = 0o1;
        const O_RDWR      = 0o2;
        const O_CREAT     = 0o100;
        const O_TRUNC     = 0o1000;
        const O_APPEND    = 0o2000;
        const O_DIRECTORY = 0o200000;
    }
}

impl OpenFlags {
    /// O_RDONLY is the absence of the write bits.
    pub fn readable(&self) -> bool {
        !self.contains(OpenFlags::O_WRONLY) || self.contains(OpenFlags::O_RDWR)
    }

    pub fn writable(&self) -> bool {
        self.intersects(OpenFlags::O_WRONLY | OpenFlags::O_RDWR)
    }
}

/// Mode bit marking directories (S_IFDIR).
pub const S_IFDIR: u32 = 0o040000;
/// Mode bit marking regular files (S_IFREG).
pub const S_IFREG: u32 = 0o100000;

/// Inode metadata as surfaced by stat/fstat.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Metadata {
    pub inode: InodeId,
    pub mode: u32,
    pub size: u64,
    pub atime: u64,
    pub mtime: u64,
    pub ctime: u64,
}

impl Metadata {
    pub fn is_dir(&self) -> bool {
        self.mode & S_IFDIR != 0
    }
}

/// Contract between the syscall layer and a filesystem implementation.
pub trait FileSystem: Send + Sync {
    /// Resolve an absolute path to an inode.
    fn resolve(&self, path: &str) -> Result<InodeId>;
    /// Create a regular file; parent directories must exist. Returns the
    /// existing inode when the path is already present.
    fn create(&self, path: &str, mode: u32) -> Result<InodeId>;
    fn metadata(&self, inode: InodeId) -> Result<Metadata>;
    fn read_at(&self, inode: InodeId, offset: u64, buf: &mut [u8]) -> Result<usize>;
    fn write_at(&self, inode: InodeId, offset: u64, data: &[u8]) -> Result<usize>;
    /// Drop a regular file's contents.
    fn truncate(&self, inode: InodeId) -> Result<()>;
}

static ROOT_FS: Once<Arc<dyn FileSystem>> = Once::new();

/// Mount the root filesystem. First caller wins; later calls are ignored.
pub fn mount_root(fs: Arc<dyn FileSystem>) {
    ROOT_FS.call_once(|| fs);
}

/// The mounted root filesystem. Panics before `mount_root` — a boot-order
/// bug.
pub fn root() -> &'static Arc<dyn FileSystem> {
    ROOT_FS.get().expect("vfs used before mount_root")
}
