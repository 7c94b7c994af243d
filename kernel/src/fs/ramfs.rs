//! In-memory filesystem: the boot root and the VFS stand-in for tests.

use alloc::collections::BTreeMap;
use alloc::string::{String, ToString};
use alloc::vec::Vec;

use spin::Mutex;

use super::{FileSystem, InodeId, Metadata, S_IFDIR, S_IFREG};
use crate::error::{KernelError, Result};

enum NodeKind {
    File(Vec<u8>),
    Dir(BTreeMap<String, InodeId>),
}

struct Node {
    kind: NodeKind,
    mode: u32,
    atime: u64,
    mtime: u64,
    ctime: u64,
}

struct RamFsInner {
    nodes: BTreeMap<InodeId, Node>,
    next_inode: InodeId,
}

pub struct RamFs {
    inner: Mutex<RamFsInner>,
}

/// Inode of the root directory.
pub const ROOT_INODE: InodeId = 1;

impl RamFs {
    pub fn new() -> Self {
        let mut nodes = BTreeMap::new();
        let now = crate::timer::wall_clock();
        nodes.insert(
            ROOT_INODE,
            Node {
                kind: NodeKind::Dir(BTreeMap::new()),
                mode: S_IFDIR | 0o755,
                atime: now,
                mtime: now,
                ctime: now,
            },
        );
        Self {
            inner: Mutex::new(RamFsInner {
                nodes,
                next_inode: ROOT_INODE + 1,
            }),
        }
    }

    fn walk(inner: &RamFsInner, path: &str) -> Result<InodeId> {
        let mut current = ROOT_INODE;
        for component in path.split('/').filter(|c| !c.is_empty()) {
            let node = inner.nodes.get(&current).ok_or(KernelError::NotFound)?;
            let NodeKind::Dir(entries) = &node.kind else {
                return Err(KernelError::NotADirectory);
            };
            current = *entries.get(component).ok_or(KernelError::NotFound)?;
        }
        Ok(current)
    }

    /// Split a path into its parent directory inode and final component.
    fn parent_of(inner: &RamFsInner, path: &str) -> Result<(InodeId, String)> {
        let trimmed = path.trim_end_matches('/');
        let (dir, name) = match trimmed.rfind('/') {
            Some(idx) => (&trimmed[..idx], &trimmed[idx + 1..]),
            None => ("", trimmed),
        };
        if name.is_empty() {
            return Err(KernelError::InvalidArgument);
        }
        Ok((Self::walk(inner, dir)?, name.to_string()))
    }

    /// Create a directory, for seeding the boot root.
    pub fn mkdir(&self, path: &str) -> Result<InodeId> {
        let mut inner = self.inner.lock();
        let (parent, name) = Self::parent_of(&inner, path)?;
        let now = crate::timer::wall_clock();

        let inode = inner.next_inode;
        inner.next_inode += 1;
        inner.nodes.insert(
            inode,
            Node {
                kind: NodeKind::Dir(BTreeMap::new()),
                mode: S_IFDIR | 0o755,
                atime: now,
                mtime: now,
                ctime: now,
            },
        );

        let parent_node = inner.nodes.get_mut(&parent).ok_or(KernelError::NotFound)?;
        let NodeKind::Dir(entries) = &mut parent_node.kind else {
            return Err(KernelError::NotADirectory);
        };
        entries.insert(name, inode);
        Ok(inode)
    }
}

impl Default for RamFs {
    fn default() -> Self {
        Self::new()
    }
}

impl FileSystem for RamFs {
    fn resolve(&self, path: &str) -> Result<InodeId> {
        let inner = self.inner.lock();
        Self::walk(&inner, path)
    }

    fn create(&self, path: &str, mode: u32) -> Result<InodeId> {
        let mut inner = self.inner.lock();
        if let Ok(existing) = Self::walk(&inner, path) {
            return Ok(existing);
        }

        let (parent, name) = Self::parent_of(&inner, path)?;
        let now = crate::timer::wall_clock();

        let inode = inner.next_inode;
        inner.next_inode += 1;
        inner.nodes.insert(
            inode,
            Node {
                kind: NodeKind::File(Vec::new()),
                mode: S_IFREG | (mode & 0o7777),
                atime: now,
                mtime: now,
                ctime: now,
            },
        );

        let parent_node = inner.nodes.get_mut(&parent).ok_or(KernelError::NotFound)?;
        let NodeKind::Dir(entries) = &mut parent_node.kind else {
            return Err(KernelError::NotADirectory);
        };
        entries.insert(name, inode);
        Ok(inode)
    }

    fn metadata(&self, inode: InodeId) -> Result<Metadata> {
        let inner = self.inner.lock();
        let node = inner.nodes.get(&inode).ok_or(KernelError::NotFound)?;
        let size = match &node.kind {
            NodeKind::File(data) => data.len() as u64,
            NodeKind::Dir(entries) => entries.len() as u64,
        };
        Ok(Metadata {
            inode,
            mode: node.mode,
            size,
            atime: node.atime,
            mtime: node.mtime,
            ctime: node.ctime,
        })
    }

    fn read_at(&self, inode: InodeId, offset: u64, buf: &mut [u8]) -> Result<usize> {
        let mut inner = self.inner.lock();
        let now = crate::timer::wall_clock();
        let node = inner.nodes.get_mut(&inode).ok_or(KernelError::NotFound)?;
        let NodeKind::File(data) = &node.kind else {
            return Err(KernelError::IsADirectory);
        };

        let offset = offset as usize;
        if offset >= data.len() {
            return Ok(0);
        }
        let n = buf.len().min(data.len() - offset);
        buf[..n].copy_from_slice(&data[offset..offset + n]);
        node.atime = now;
        Ok(n)
    }

    fn write_at(&self, inode: InodeId, offset: u64, data: &[u8]) -> Result<usize> {
        let mut inner = self.inner.lock();
        let now = crate::timer::wall_clock();
        let node = inner.nodes.get_mut(&inode).ok_or(KernelError::NotFound)?;
        let NodeKind::File(contents) = &mut node.kind else {
            return Err(KernelError::IsADirectory);
        };

        let offset = offset as usize;
        if contents.len() < offset + data.len() {
            contents.resize(offset + data.len(), 0);
        }
        contents[offset..offset + data.len()].copy_from_slice(data);
        node.mtime = now;
        Ok(data.len())
    }

    fn truncate(&self, inode: InodeId) -> Result<()> {
        let mut inner = self.inner.lock();
        let now = crate::timer::wall_clock();
        let node = inner.nodes.get_mut(&inode).ok_or(KernelError::NotFound)?;
        let NodeKind::File(contents) = &mut node.kind else {
            return Err(KernelError::IsADirectory);
        };
        contents.clear();
        node.mtime = now;
        Ok(())
    }
}
