//! System-call dispatch.
//!
//! Linux x86-64 numbering, arguments per the SysV syscall convention, signed
//! 64-bit returns with errno in the sign. Every pointer argument is checked
//! for presence in the calling process's address space before it is touched;
//! user memory is reached through the direct map, page by page.

pub mod filesystem;
pub mod memory;
pub mod net;
pub mod process;

use alloc::string::String;
use alloc::vec;
use alloc::vec::Vec;

use crate::error::Errno;
use crate::mm::{VirtualAddress, PAGE_SIZE};
use crate::process::Process;

/// Handler result: non-negative payload or errno.
pub type SysResult = core::result::Result<i64, Errno>;

// Linux x86-64 syscall numbers implemented by the core.
pub const SYS_READ: u64 = 0;
pub const SYS_WRITE: u64 = 1;
pub const SYS_OPEN: u64 = 2;
pub const SYS_CLOSE: u64 = 3;
pub const SYS_STAT: u64 = 4;
pub const SYS_FSTAT: u64 = 5;
pub const SYS_LSEEK: u64 = 8;
pub const SYS_MMAP: u64 = 9;
pub const SYS_MUNMAP: u64 = 11;
pub const SYS_BRK: u64 = 12;
pub const SYS_PIPE: u64 = 22;
pub const SYS_DUP: u64 = 32;
pub const SYS_DUP2: u64 = 33;
pub const SYS_GETPID: u64 = 39;
pub const SYS_SOCKET: u64 = 41;
pub const SYS_CONNECT: u64 = 42;
pub const SYS_SEND: u64 = 46;
pub const SYS_RECV: u64 = 47;
pub const SYS_FORK: u64 = 57;
pub const SYS_EXECVE: u64 = 59;
pub const SYS_EXIT: u64 = 60;
pub const SYS_WAIT4: u64 = 61;
pub const SYS_KILL: u64 = 62;
pub const SYS_GETPPID: u64 = 110;

/// Single entry point for the syscall instruction path.
pub fn dispatch(num: u64, args: [u64; 6]) -> i64 {
    match dispatch_inner(num, args) {
        Ok(value) => value,
        Err(errno) => errno.as_neg(),
    }
}

const fn is_known(num: u64) -> bool {
    matches!(
        num,
        SYS_READ
            | SYS_WRITE
            | SYS_OPEN
            | SYS_CLOSE
            | SYS_STAT
            | SYS_FSTAT
            | SYS_LSEEK
            | SYS_MMAP
            | SYS_MUNMAP
            | SYS_BRK
            | SYS_PIPE
            | SYS_DUP
            | SYS_DUP2
            | SYS_GETPID
            | SYS_SOCKET
            | SYS_CONNECT
            | SYS_SEND
            | SYS_RECV
            | SYS_FORK
            | SYS_EXECVE
            | SYS_EXIT
            | SYS_WAIT4
            | SYS_KILL
            | SYS_GETPPID
    )
}

fn dispatch_inner(num: u64, args: [u64; 6]) -> SysResult {
    if !is_known(num) {
        return Err(Errno::Enosys);
    }
    let proc = current_process()?;
    match num {
        SYS_READ => filesystem::sys_read(proc, args[0], args[1], args[2]),
        SYS_WRITE => filesystem::sys_write(proc, args[0], args[1], args[2]),
        SYS_OPEN => filesystem::sys_open(proc, args[0], args[1], args[2]),
        SYS_CLOSE => filesystem::sys_close(proc, args[0]),
        SYS_STAT => filesystem::sys_stat(proc, args[0], args[1]),
        SYS_FSTAT => filesystem::sys_fstat(proc, args[0], args[1]),
        SYS_LSEEK => filesystem::sys_lseek(proc, args[0], args[1] as i64, args[2]),
        SYS_PIPE => filesystem::sys_pipe(proc, args[0]),
        SYS_DUP => filesystem::sys_dup(proc, args[0]),
        SYS_DUP2 => filesystem::sys_dup2(proc, args[0], args[1]),
        SYS_MMAP | SYS_MUNMAP | SYS_BRK => {
            let mut pmm = crate::mm::pmm::get().lock();
            match num {
                SYS_MMAP => memory::sys_mmap(
                    proc,
                    &mut pmm,
                    args[0],
                    args[1],
                    args[2],
                    args[3],
                    args[4] as i64,
                    args[5],
                ),
                SYS_MUNMAP => memory::sys_munmap(proc, &mut pmm, args[0], args[1]),
                _ => memory::sys_brk(proc, &mut pmm, args[0]),
            }
        }
        SYS_GETPID => process::sys_getpid(proc),
        SYS_GETPPID => process::sys_getppid(proc),
        SYS_FORK => process::sys_fork(proc),
        SYS_EXECVE => process::sys_execve(proc, args[0], args[1], args[2]),
        SYS_EXIT => process::sys_exit(proc, args[0] as i64),
        SYS_WAIT4 => process::sys_wait4(proc, args[0] as i64, args[1], args[2]),
        SYS_KILL => process::sys_kill(proc, args[0] as i64, args[1]),
        SYS_SOCKET => net::sys_socket(proc, args[0], args[1], args[2]),
        SYS_CONNECT => net::sys_connect(proc, args[0], args[1], args[2]),
        SYS_SEND => net::sys_send(proc, args[0], args[1], args[2], args[3]),
        SYS_RECV => net::sys_recv(proc, args[0], args[1], args[2], args[3]),
        _ => Err(Errno::Enosys),
    }
}

/// The process issuing this syscall.
fn current_process<'a>() -> core::result::Result<&'a mut Process, Errno> {
    let mut ptr = crate::sched::current().ok_or(Errno::Esrch)?;
    // SAFETY: the current process is table-owned and cannot be reaped while
    // it is the one executing this syscall.
    Ok(unsafe { ptr.as_mut() })
}

/// Cap on a single read/write transfer, to bound kernel bounce buffers.
pub const MAX_IO_CHUNK: usize = 1 << 20;

/// Verify that `[addr, addr + len)` is user-half and mapped in `proc`'s
/// address space.
pub fn validate_user_range(proc: &Process, addr: u64, len: usize) -> core::result::Result<(), Errno> {
    if addr == 0 {
        return Err(Errno::Efault);
    }
    let end = addr.checked_add(len as u64).ok_or(Errno::Efault)?;
    if VirtualAddress::new(addr).is_kernel_half() || end > 0x0000_8000_0000_0000 {
        return Err(Errno::Efault);
    }
    let space = proc.address_space();
    let mut page = addr & !(PAGE_SIZE as u64 - 1);
    while page < end {
        if space.translate(VirtualAddress::new(page)).as_u64() == 0 {
            return Err(Errno::Efault);
        }
        page += PAGE_SIZE as u64;
    }
    Ok(())
}

/// Copy user memory into a kernel buffer.
pub fn copy_from_user(
    proc: &Process,
    addr: u64,
    buf: &mut [u8],
) -> core::result::Result<(), Errno> {
    validate_user_range(proc, addr, buf.len())?;
    let space = proc.address_space();
    let dmap = proc.direct_map();
    let mut copied = 0usize;
    while copied < buf.len() {
        let virt = addr + copied as u64;
        let page_off = (virt & (PAGE_SIZE as u64 - 1)) as usize;
        let chunk = (PAGE_SIZE - page_off).min(buf.len() - copied);
        let phys = space.translate(VirtualAddress::new(virt));
        // SAFETY: validated above; phys frames are direct-mapped.
        unsafe {
            core::ptr::copy_nonoverlapping(
                dmap.ptr_of(phys),
                buf.as_mut_ptr().add(copied),
                chunk,
            );
        }
        copied += chunk;
    }
    Ok(())
}

/// Copy a kernel buffer out to user memory.
pub fn copy_to_user(proc: &Process, addr: u64, data: &[u8]) -> core::result::Result<(), Errno> {
    validate_user_range(proc, addr, data.len())?;
    let space = proc.address_space();
    let dmap = proc.direct_map();
    let mut copied = 0usize;
    while copied < data.len() {
        let virt = addr + copied as u64;
        let page_off = (virt & (PAGE_SIZE as u64 - 1)) as usize;
        let chunk = (PAGE_SIZE - page_off).min(data.len() - copied);
        let phys = space.translate(VirtualAddress::new(virt));
        // SAFETY: as in copy_from_user.
        unsafe {
            core::ptr::copy_nonoverlapping(
                data.as_ptr().add(copied),
                dmap.ptr_of(phys),
                chunk,
            );
        }
        copied += chunk;
    }
    Ok(())
}

/// Read a NUL-terminated string from user memory (for paths).
pub fn copy_cstr_from_user(
    proc: &Process,
    addr: u64,
    max: usize,
) -> core::result::Result<String, Errno> {
    let mut bytes: Vec<u8> = Vec::new();
    let mut offset = 0usize;
    while offset < max {
        let chunk_len = PAGE_SIZE - ((addr as usize + offset) & (PAGE_SIZE - 1));
        let chunk_len = chunk_len.min(max - offset);
        let mut chunk = vec![0u8; chunk_len];
        copy_from_user(proc, addr + offset as u64, &mut chunk)?;
        if let Some(nul) = chunk.iter().position(|&b| b == 0) {
            bytes.extend_from_slice(&chunk[..nul]);
            return String::from_utf8(bytes).map_err(|_| Errno::Einval);
        }
        bytes.extend_from_slice(&chunk);
        offset += chunk_len;
    }
    Err(Errno::Einval)
}

#[cfg(all(test, not(target_os = "none")))]
pub(crate) mod testutil {
    //! Shared fixture: a process with its own address space in a fake-RAM
    //! arena, plus helpers to plant and read user memory.

    extern crate std;
    use std::boxed::Box;

    use crate::mm::pmm::FrameAllocator;
    use crate::mm::testmem::TestArena;
    use crate::mm::vmm::{AddressSpace, PteFlags};
    use crate::mm::{VirtualAddress, PAGE_SIZE};
    use crate::process::Process;

    pub struct SyscallFixture {
        pub arena: TestArena,
        pub pmm: FrameAllocator,
        pub proc: Box<Process>,
    }

    impl SyscallFixture {
        pub fn new() -> Self {
            let arena = TestArena::new(32 * 1024 * 1024);
            let mut map = arena.memory_map();
            let mut pmm = FrameAllocator::new(arena.direct_map(), &mut map).unwrap();
            let space = AddressSpace::new(&mut pmm).unwrap();
            let root = space.root();
            let mut proc =
                Process::new_kernel_task(&mut pmm, 1, 0, "test", 0, 0, root).unwrap();
            proc.owns_address_space = false; // fixture frees via arena drop
            Self { arena, pmm, proc }
        }

        /// Map one user page at `virt` and return its direct-map pointer.
        pub fn map_user_page(&mut self, virt: u64) -> *mut u8 {
            let frame = self.pmm.alloc_frame().unwrap();
            self.pmm.zero_frame(frame);
            let mut space = self.proc.address_space();
            space
                .map_page(
                    &mut self.pmm,
                    VirtualAddress::new(virt),
                    frame,
                    PteFlags::WRITABLE | PteFlags::USER,
                )
                .unwrap();
            self.arena.direct_map().ptr_of(frame)
        }

        /// Plant bytes at a fresh user address; returns that address.
        pub fn user_bytes(&mut self, virt: u64, data: &[u8]) -> u64 {
            assert!(data.len() <= PAGE_SIZE);
            let page = self.map_user_page(virt & !(PAGE_SIZE as u64 - 1));
            // SAFETY: the page was just mapped and is arena-backed.
            unsafe {
                core::ptr::copy_nonoverlapping(
                    data.as_ptr(),
                    page.add((virt & (PAGE_SIZE as u64 - 1)) as usize),
                    data.len(),
                );
            }
            virt
        }

        /// Read back bytes from a mapped user address.
        pub fn read_user(&self, virt: u64, len: usize) -> std::vec::Vec<u8> {
            let mut out = std::vec![0u8; len];
            super::copy_from_user(&self.proc, virt, &mut out).unwrap();
            out
        }
    }
}

#[cfg(all(test, not(target_os = "none")))]
mod tests {
    use super::testutil::SyscallFixture;
    use super::*;

    #[test]
    fn null_and_kernel_pointers_fault() {
        let fx = SyscallFixture::new();
        assert_eq!(validate_user_range(&fx.proc, 0, 8), Err(Errno::Efault));
        assert_eq!(
            validate_user_range(&fx.proc, 0xFFFF_8000_0000_1000, 8),
            Err(Errno::Efault)
        );
        // Unmapped user address faults too.
        assert_eq!(
            validate_user_range(&fx.proc, 0x4000_0000, 8),
            Err(Errno::Efault)
        );
    }

    #[test]
    fn user_copies_round_trip_across_pages() {
        let mut fx = SyscallFixture::new();
        fx.map_user_page(0x10_0000);
        fx.map_user_page(0x10_1000);

        let addr = 0x10_0F80; // straddles the page boundary
        let data: std::vec::Vec<u8> = (0..=255u8).collect();
        copy_to_user(&fx.proc, addr, &data).unwrap();
        let back = fx.read_user(addr, 256);
        assert_eq!(back, data);
    }

    #[test]
    fn cstr_copy_stops_at_nul() {
        let mut fx = SyscallFixture::new();
        let addr = fx.user_bytes(0x20_0000, b"/etc/hostname\0garbage");
        let s = copy_cstr_from_user(&fx.proc, addr, 256).unwrap();
        assert_eq!(s, "/etc/hostname");
    }

    #[test]
    fn unknown_syscall_is_enosys() {
        // The number check precedes everything, including the
        // current-process lookup.
        assert_eq!(dispatch(999, [0; 6]), Errno::Enosys.as_neg());
        assert_eq!(dispatch(u64::MAX, [0; 6]), Errno::Enosys.as_neg());
    }
}
