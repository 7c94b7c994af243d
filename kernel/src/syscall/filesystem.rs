//! File, pipe and descriptor syscalls.

use alloc::sync::Arc;
use alloc::vec;

use spin::Mutex;

use super::{copy_cstr_from_user, copy_from_user, copy_to_user, SysResult, MAX_IO_CHUNK};
use crate::error::Errno;
use crate::fs::fd_table::{ConsoleStream, FdEntry, FdPayload, PipeEnd};
use crate::fs::{self, FileSystem, OpenFlags};
use crate::process::Process;

const SEEK_SET: u64 = 0;
const SEEK_CUR: u64 = 1;
const SEEK_END: u64 = 2;

/// Mode bits used for fstat on non-file descriptors.
const S_IFCHR: u32 = 0o020000;
const S_IFIFO: u32 = 0o010000;
const S_IFSOCK: u32 = 0o140000;

pub fn sys_read(proc: &mut Process, fd: u64, buf: u64, count: u64) -> SysResult {
    let count = (count as usize).min(MAX_IO_CHUNK);
    if count == 0 {
        return Ok(0);
    }
    super::validate_user_range(proc, buf, count)?;

    let entry = proc.fds.get(fd as usize).map_err(Errno::from)?;
    let mut guard = entry.lock();
    if !guard.flags.readable() {
        return Err(Errno::Ebadf);
    }

    let mut kbuf = vec![0u8; count];
    let n = match &guard.payload {
        FdPayload::Console(ConsoleStream::Input) => match crate::serial::read_byte() {
            Some(byte) => {
                kbuf[0] = byte;
                1
            }
            None => 0,
        },
        FdPayload::Console(ConsoleStream::Output) => return Err(Errno::Ebadf),
        FdPayload::File { inode } => {
            let n = fs::root()
                .read_at(*inode, guard.offset, &mut kbuf)
                .map_err(Errno::from)?;
            guard.offset += n as u64;
            n
        }
        FdPayload::Pipe { pipe, end } => {
            if *end != PipeEnd::Read {
                return Err(Errno::Ebadf);
            }
            pipe.read(&mut kbuf)
        }
        FdPayload::Socket(socket) => socket.lock().recv(&mut kbuf).map_err(Errno::from)?,
        FdPayload::Dir { .. } => return Err(Errno::Eisdir),
    };
    drop(guard);

    copy_to_user(proc, buf, &kbuf[..n])?;
    Ok(n as i64)
}

pub fn sys_write(proc: &mut Process, fd: u64, buf: u64, count: u64) -> SysResult {
    let count = (count as usize).min(MAX_IO_CHUNK);
    if count == 0 {
        return Ok(0);
    }
    let mut kbuf = vec![0u8; count];
    copy_from_user(proc, buf, &mut kbuf)?;

    let entry = proc.fds.get(fd as usize).map_err(Errno::from)?;
    let mut guard = entry.lock();

    let n = match &guard.payload {
        FdPayload::Console(ConsoleStream::Output) => {
            crate::graphics::fbcon::write_bytes(&kbuf);
            kbuf.len()
        }
        FdPayload::Console(ConsoleStream::Input) => return Err(Errno::Ebadf),
        FdPayload::File { inode } => {
            if !guard.flags.writable() {
                return Err(Errno::Ebadf);
            }
            let n = fs::root()
                .write_at(*inode, guard.offset, &kbuf)
                .map_err(Errno::from)?;
            guard.offset += n as u64;
            n
        }
        FdPayload::Pipe { pipe, end } => {
            if *end != PipeEnd::Write {
                return Err(Errno::Ebadf);
            }
            pipe.write(&kbuf).map_err(Errno::from)?
        }
        FdPayload::Socket(socket) => socket.lock().send(&kbuf).map_err(Errno::from)?,
        FdPayload::Dir { .. } => return Err(Errno::Eisdir),
    };
    Ok(n as i64)
}

pub fn sys_open(proc: &mut Process, path: u64, flags: u64, mode: u64) -> SysResult {
    let path = copy_cstr_from_user(proc, path, 4096)?;
    let flags = OpenFlags::from_bits_truncate(flags as u32);
    let vfs = fs::root();

    if flags.contains(OpenFlags::O_DIRECTORY) {
        let inode = vfs.resolve(&path).map_err(Errno::from)?;
        let meta = vfs.metadata(inode).map_err(Errno::from)?;
        if !meta.is_dir() {
            return Err(Errno::Enotdir);
        }
        let fd = proc
            .fds
            .alloc(FdPayload::Dir { inode }, flags)
            .map_err(Errno::from)?;
        return Ok(fd as i64);
    }

    let inode = match vfs.resolve(&path) {
        Ok(inode) => inode,
        Err(crate::error::KernelError::NotFound) if flags.contains(OpenFlags::O_CREAT) => {
            vfs.create(&path, mode as u32).map_err(Errno::from)?
        }
        Err(e) => return Err(Errno::from(e)),
    };

    let meta = vfs.metadata(inode).map_err(Errno::from)?;
    if meta.is_dir() {
        if flags.writable() {
            return Err(Errno::Eisdir);
        }
        let fd = proc
            .fds
            .alloc(FdPayload::Dir { inode }, flags)
            .map_err(Errno::from)?;
        return Ok(fd as i64);
    }

    if flags.contains(OpenFlags::O_TRUNC) && flags.writable() {
        vfs.truncate(inode).map_err(Errno::from)?;
    }

    let fd = proc
        .fds
        .alloc(FdPayload::File { inode }, flags)
        .map_err(Errno::from)?;
    if flags.contains(OpenFlags::O_APPEND) {
        let size = vfs.metadata(inode).map_err(Errno::from)?.size;
        proc.fds.get(fd).map_err(Errno::from)?.lock().offset = size;
    }
    Ok(fd as i64)
}

pub fn sys_close(proc: &mut Process, fd: u64) -> SysResult {
    proc.fds.release(fd as usize).map_err(Errno::from)?;
    Ok(0)
}

/// Pack inode metadata into the Linux x86-64 `struct stat` layout.
fn encode_stat(inode: u64, mode: u32, size: u64, atime: u64, mtime: u64, ctime: u64) -> [u8; 144] {
    let mut buf = [0u8; 144];
    let mut put = |off: usize, value: u64| buf[off..off + 8].copy_from_slice(&value.to_le_bytes());
    put(0x08, inode); // st_ino
    put(0x10, 1); // st_nlink
    put(0x30, size); // st_size
    put(0x38, 4096); // st_blksize
    put(0x40, size.div_ceil(512)); // st_blocks
    put(0x48, atime); // st_atime
    put(0x58, mtime); // st_mtime
    put(0x68, ctime); // st_ctime
    buf[0x18..0x1C].copy_from_slice(&mode.to_le_bytes()); // st_mode
    buf
}

pub fn sys_stat(proc: &mut Process, path: u64, statbuf: u64) -> SysResult {
    let path = copy_cstr_from_user(proc, path, 4096)?;
    let vfs = fs::root();
    let inode = vfs.resolve(&path).map_err(Errno::from)?;
    let meta = vfs.metadata(inode).map_err(Errno::from)?;
    let encoded = encode_stat(
        meta.inode,
        meta.mode,
        meta.size,
        meta.atime,
        meta.mtime,
        meta.ctime,
    );
    copy_to_user(proc, statbuf, &encoded)?;
    Ok(0)
}

pub fn sys_fstat(proc: &mut Process, fd: u64, statbuf: u64) -> SysResult {
    let entry = proc.fds.get(fd as usize).map_err(Errno::from)?;
    let guard = entry.lock();

    let encoded = match &guard.payload {
        FdPayload::File { inode } | FdPayload::Dir { inode } => {
            let meta = fs::root().metadata(*inode).map_err(Errno::from)?;
            encode_stat(
                meta.inode,
                meta.mode,
                meta.size,
                meta.atime,
                meta.mtime,
                meta.ctime,
            )
        }
        FdPayload::Console(_) => encode_stat(0, S_IFCHR | 0o666, 0, 0, 0, 0),
        FdPayload::Pipe { pipe, .. } => {
            encode_stat(0, S_IFIFO | 0o600, pipe.len() as u64, 0, 0, 0)
        }
        FdPayload::Socket(_) => encode_stat(0, S_IFSOCK | 0o777, 0, 0, 0, 0),
    };
    drop(guard);

    copy_to_user(proc, statbuf, &encoded)?;
    Ok(0)
}

pub fn sys_lseek(proc: &mut Process, fd: u64, offset: i64, whence: u64) -> SysResult {
    let entry = proc.fds.get(fd as usize).map_err(Errno::from)?;
    let mut guard = entry.lock();

    let FdPayload::File { inode } = &guard.payload else {
        return Err(Errno::Espipe);
    };
    let size = fs::root().metadata(*inode).map_err(Errno::from)?.size as i64;

    let base = match whence {
        SEEK_SET => 0,
        SEEK_CUR => guard.offset as i64,
        SEEK_END => size,
        _ => return Err(Errno::Einval),
    };
    let target = base.checked_add(offset).ok_or(Errno::Einval)?;
    if target < 0 {
        return Err(Errno::Einval);
    }
    guard.offset = target as u64;
    Ok(target)
}

pub fn sys_pipe(proc: &mut Process, fds_ptr: u64) -> SysResult {
    super::validate_user_range(proc, fds_ptr, 8)?;

    let (read_end, write_end) = crate::fs::fd_table::pipe_pair();
    let rfd = proc
        .fds
        .alloc(read_end, OpenFlags::empty())
        .map_err(Errno::from)?;
    let wfd = match proc.fds.alloc(write_end, OpenFlags::O_WRONLY) {
        Ok(fd) => fd,
        Err(e) => {
            let _ = proc.fds.release(rfd);
            return Err(Errno::from(e));
        }
    };

    let mut out = [0u8; 8];
    out[0..4].copy_from_slice(&(rfd as i32).to_le_bytes());
    out[4..8].copy_from_slice(&(wfd as i32).to_le_bytes());
    copy_to_user(proc, fds_ptr, &out)?;
    Ok(0)
}

pub fn sys_dup(proc: &mut Process, fd: u64) -> SysResult {
    let new = proc.fds.dup(fd as usize).map_err(Errno::from)?;
    Ok(new as i64)
}

pub fn sys_dup2(proc: &mut Process, old: u64, new: u64) -> SysResult {
    let new = proc
        .fds
        .dup2(old as usize, new as usize)
        .map_err(Errno::from)?;
    Ok(new as i64)
}

/// Build a socket-backed descriptor (used by the net syscalls).
pub(super) fn install_socket(
    proc: &mut Process,
    socket: Arc<Mutex<crate::net::Socket>>,
) -> core::result::Result<usize, Errno> {
    proc.fds
        .alloc(FdPayload::Socket(socket), OpenFlags::O_RDWR)
        .map_err(Errno::from)
}

/// Fetch the socket behind `fd`.
pub(super) fn socket_of(
    entry: &FdEntry,
) -> core::result::Result<Arc<Mutex<crate::net::Socket>>, Errno> {
    match &entry.payload {
        FdPayload::Socket(socket) => Ok(socket.clone()),
        _ => Err(Errno::Ebadf),
    }
}

#[cfg(all(test, not(target_os = "none")))]
mod tests {
    use super::super::testutil::SyscallFixture;
    use super::*;
    use alloc::sync::Arc;

    use crate::fs::ramfs::RamFs;

    fn mount() {
        fs::mount_root(Arc::new(RamFs::new()));
    }

    #[test]
    fn pipe_round_trip_through_syscalls() {
        let mut fx = SyscallFixture::new();
        let fds_ptr = fx.user_bytes(0x30_0000, &[0u8; 8]);
        assert_eq!(sys_pipe(&mut fx.proc, fds_ptr).unwrap(), 0);

        let out = fx.read_user(fds_ptr, 8);
        let rfd = i32::from_le_bytes(out[0..4].try_into().unwrap()) as u64;
        let wfd = i32::from_le_bytes(out[4..8].try_into().unwrap()) as u64;
        assert_ne!(rfd, wfd);

        // 256 distinct bytes through the write end...
        let data: alloc::vec::Vec<u8> = (0..=255u8).collect();
        let buf = fx.user_bytes(0x31_0000, &data);
        assert_eq!(sys_write(&mut fx.proc, wfd, buf, 256).unwrap(), 256);

        // ...come back in order through the read end.
        let rbuf = fx.user_bytes(0x32_0000, &[0u8; 256]);
        assert_eq!(sys_read(&mut fx.proc, rfd, rbuf, 256).unwrap(), 256);
        assert_eq!(fx.read_user(rbuf, 256), data);

        // Wrong-direction transfers are EBADF.
        assert_eq!(sys_read(&mut fx.proc, wfd, rbuf, 1), Err(Errno::Ebadf));
        assert_eq!(sys_write(&mut fx.proc, rfd, buf, 1), Err(Errno::Ebadf));
    }

    #[test]
    fn pipe_eof_and_epipe_through_syscalls() {
        let mut fx = SyscallFixture::new();
        let fds_ptr = fx.user_bytes(0x30_0000, &[0u8; 8]);
        sys_pipe(&mut fx.proc, fds_ptr).unwrap();
        let out = fx.read_user(fds_ptr, 8);
        let rfd = i32::from_le_bytes(out[0..4].try_into().unwrap()) as u64;
        let wfd = i32::from_le_bytes(out[4..8].try_into().unwrap()) as u64;

        let buf = fx.user_bytes(0x31_0000, b"xx");
        // Close the read end: writes break.
        sys_close(&mut fx.proc, rfd).unwrap();
        assert_eq!(sys_write(&mut fx.proc, wfd, buf, 2), Err(Errno::Epipe));

        // Fresh pipe; close the write end: reads hit EOF (0).
        sys_pipe(&mut fx.proc, fds_ptr).unwrap();
        let out = fx.read_user(fds_ptr, 8);
        let rfd = i32::from_le_bytes(out[0..4].try_into().unwrap()) as u64;
        let wfd = i32::from_le_bytes(out[4..8].try_into().unwrap()) as u64;
        sys_close(&mut fx.proc, wfd).unwrap();
        assert_eq!(sys_read(&mut fx.proc, rfd, buf, 2).unwrap(), 0);
    }

    #[test]
    fn open_read_write_lseek_stat() {
        mount();
        let mut fx = SyscallFixture::new();

        let path = fx.user_bytes(0x40_0000, b"/sys_fs_test\0");
        let fd = sys_open(
            &mut fx.proc,
            path,
            (OpenFlags::O_CREAT | OpenFlags::O_RDWR).bits() as u64,
            0o644,
        )
        .unwrap() as u64;

        let data = fx.user_bytes(0x41_0000, b"hello kernel");
        assert_eq!(sys_write(&mut fx.proc, fd, data, 12).unwrap(), 12);

        // Rewind and read back.
        assert_eq!(sys_lseek(&mut fx.proc, fd, 0, SEEK_SET).unwrap(), 0);
        let rbuf = fx.user_bytes(0x42_0000, &[0u8; 12]);
        assert_eq!(sys_read(&mut fx.proc, fd, rbuf, 12).unwrap(), 12);
        assert_eq!(fx.read_user(rbuf, 12), b"hello kernel");

        // SEEK_END lands on the size; negative results are rejected.
        assert_eq!(sys_lseek(&mut fx.proc, fd, 0, SEEK_END).unwrap(), 12);
        assert_eq!(
            sys_lseek(&mut fx.proc, fd, -20, SEEK_SET),
            Err(Errno::Einval)
        );

        // fstat and stat agree on mode and size.
        let statbuf = fx.user_bytes(0x43_0000, &[0u8; 144]);
        assert_eq!(sys_fstat(&mut fx.proc, fd, statbuf).unwrap(), 0);
        let raw = fx.read_user(statbuf, 144);
        let size = u64::from_le_bytes(raw[0x30..0x38].try_into().unwrap());
        assert_eq!(size, 12);

        assert_eq!(sys_stat(&mut fx.proc, path, statbuf).unwrap(), 0);
        let raw = fx.read_user(statbuf, 144);
        let mode = u32::from_le_bytes(raw[0x18..0x1C].try_into().unwrap());
        assert_ne!(mode & crate::fs::S_IFREG, 0);
    }

    #[test]
    fn open_missing_without_creat_is_enoent() {
        mount();
        let mut fx = SyscallFixture::new();
        let path = fx.user_bytes(0x40_0000, b"/definitely_missing\0");
        assert_eq!(
            sys_open(&mut fx.proc, path, 0, 0),
            Err(Errno::Enoent)
        );
    }

    #[test]
    fn open_directory_flag_enforces_directories() {
        mount();
        let mut fx = SyscallFixture::new();

        let file = fx.user_bytes(0x40_0000, b"/plain_file_for_dir_test\0");
        sys_open(
            &mut fx.proc,
            file,
            OpenFlags::O_CREAT.bits() as u64,
            0o644,
        )
        .unwrap();
        assert_eq!(
            sys_open(
                &mut fx.proc,
                file,
                OpenFlags::O_DIRECTORY.bits() as u64,
                0
            ),
            Err(Errno::Enotdir)
        );

        let root = fx.user_bytes(0x44_0000, b"/\0");
        let fd = sys_open(
            &mut fx.proc,
            root,
            OpenFlags::O_DIRECTORY.bits() as u64,
            0,
        )
        .unwrap() as u64;
        // Reading a directory fd is EISDIR.
        let buf = fx.user_bytes(0x45_0000, &[0u8; 8]);
        assert_eq!(sys_read(&mut fx.proc, fd, buf, 8), Err(Errno::Eisdir));
    }

    #[test]
    fn truncate_on_open_clears_contents() {
        mount();
        let mut fx = SyscallFixture::new();
        let path = fx.user_bytes(0x40_0000, b"/truncate_me\0");
        let fd = sys_open(
            &mut fx.proc,
            path,
            (OpenFlags::O_CREAT | OpenFlags::O_RDWR).bits() as u64,
            0o644,
        )
        .unwrap() as u64;
        let data = fx.user_bytes(0x41_0000, b"content");
        sys_write(&mut fx.proc, fd, data, 7).unwrap();
        sys_close(&mut fx.proc, fd).unwrap();

        sys_open(
            &mut fx.proc,
            path,
            (OpenFlags::O_TRUNC | OpenFlags::O_RDWR).bits() as u64,
            0,
        )
        .unwrap();
        let statbuf = fx.user_bytes(0x43_0000, &[0u8; 144]);
        sys_stat(&mut fx.proc, path, statbuf).unwrap();
        let raw = fx.read_user(statbuf, 144);
        assert_eq!(u64::from_le_bytes(raw[0x30..0x38].try_into().unwrap()), 0);
    }

    #[test]
    fn bad_descriptor_is_ebadf() {
        let mut fx = SyscallFixture::new();
        let buf = fx.user_bytes(0x41_0000, b"z");
        assert_eq!(sys_read(&mut fx.proc, 200, buf, 1), Err(Errno::Ebadf));
        assert_eq!(sys_close(&mut fx.proc, 200), Err(Errno::Ebadf));
    }
}
