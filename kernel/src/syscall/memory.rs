//! Memory syscalls: mmap, munmap, brk.

use super::SysResult;
use crate::error::Errno;
use crate::fs::fd_table::FdPayload;
use crate::fs::{self, FileSystem};
use crate::mm::{
    page_align_up,
    pmm::FrameAllocator,
    vmm::PteFlags,
    VirtualAddress, PAGE_SIZE,
};
use crate::process::Process;

const PROT_WRITE: u64 = 2;
const PROT_EXEC: u64 = 4;
const MAP_ANONYMOUS: u64 = 0x20;

/// Program-break base for processes that never ran execve.
const DEFAULT_BRK_BASE: u64 = 0x5000_0000_0000;

fn prot_to_flags(prot: u64) -> PteFlags {
    let mut flags = PteFlags::USER;
    if prot & PROT_WRITE != 0 {
        flags |= PteFlags::WRITABLE;
    }
    if prot & PROT_EXEC == 0 {
        flags |= PteFlags::NO_EXECUTE;
    }
    flags
}

/// Unmap `[addr, addr+len)` and return the backing frames. Shared by the
/// munmap path and mmap failure cleanup.
fn release_range(proc: &mut Process, pmm: &mut FrameAllocator, addr: u64, len: u64) {
    let mut space = proc.address_space();
    let mut page = addr;
    while page < addr + len {
        let virt = VirtualAddress::new(page);
        let phys = space.translate(virt);
        if space.unmap_page(virt) {
            pmm.free_frame(crate::mm::PhysicalAddress::new(phys.as_u64() & !0xFFF));
        }
        page += PAGE_SIZE as u64;
    }
}

pub fn sys_mmap(
    proc: &mut Process,
    pmm: &mut FrameAllocator,
    addr: u64,
    length: u64,
    prot: u64,
    flags: u64,
    fd: i64,
    offset: u64,
) -> SysResult {
    if length == 0 {
        return Err(Errno::Einval);
    }
    if addr % PAGE_SIZE as u64 != 0 || offset % PAGE_SIZE as u64 != 0 {
        return Err(Errno::Einval);
    }
    let length = page_align_up(length);

    let base = if addr == 0 {
        let base = proc.mmap_next;
        proc.mmap_next += length;
        base
    } else {
        addr
    };
    if VirtualAddress::new(base + length).is_kernel_half() || base + length > 0x0000_8000_0000_0000
    {
        return Err(Errno::Einval);
    }

    // File-backed mappings read through the VFS; -1 fd with MAP_ANONYMOUS
    // gets zero pages.
    let file_inode = if flags & MAP_ANONYMOUS == 0 && fd >= 0 {
        let entry = proc.fds.get(fd as usize).map_err(Errno::from)?;
        let guard = entry.lock();
        match &guard.payload {
            FdPayload::File { inode } => Some(*inode),
            _ => return Err(Errno::Ebadf),
        }
    } else {
        None
    };

    let pte_flags = prot_to_flags(prot);
    let mut space = proc.address_space();
    let dmap = pmm.direct_map();
    let mut mapped = 0u64;
    while mapped < length {
        let frame = match pmm.alloc_frame() {
            Ok(frame) => frame,
            Err(_) => {
                release_range(proc, pmm, base, mapped);
                return Err(Errno::Enomem);
            }
        };
        pmm.zero_frame(frame);

        if let Some(inode) = file_inode {
            // Short reads leave the zero fill in place, like reading past
            // end of file.
            let page_buf = dmap.ptr_of(frame);
            // SAFETY: the frame is fresh, direct-mapped and page-sized.
            let slice = unsafe { core::slice::from_raw_parts_mut(page_buf, PAGE_SIZE) };
            if fs::root()
                .read_at(inode, offset + mapped, slice)
                .is_err()
            {
                pmm.free_frame(frame);
                release_range(proc, pmm, base, mapped);
                return Err(Errno::Eio);
            }
        }

        if space
            .map_page(pmm, VirtualAddress::new(base + mapped), frame, pte_flags)
            .is_err()
        {
            pmm.free_frame(frame);
            release_range(proc, pmm, base, mapped);
            return Err(Errno::Enomem);
        }
        mapped += PAGE_SIZE as u64;
    }

    Ok(base as i64)
}

pub fn sys_munmap(
    proc: &mut Process,
    pmm: &mut FrameAllocator,
    addr: u64,
    length: u64,
) -> SysResult {
    if addr == 0 || addr % PAGE_SIZE as u64 != 0 || length == 0 {
        return Err(Errno::Einval);
    }
    release_range(proc, pmm, addr, page_align_up(length));
    Ok(0)
}

/// Grow or shrink the program break with page granularity. `brk(0)` reports
/// the current break.
pub fn sys_brk(proc: &mut Process, pmm: &mut FrameAllocator, addr: u64) -> SysResult {
    if proc.brk_start == 0 {
        proc.brk_start = DEFAULT_BRK_BASE;
        proc.brk_end = DEFAULT_BRK_BASE;
    }
    if addr == 0 || addr < proc.brk_start {
        return Ok(proc.brk_end as i64);
    }
    if VirtualAddress::new(addr).is_kernel_half() || addr > 0x0000_8000_0000_0000 {
        return Err(Errno::Enomem);
    }

    let old_top = page_align_up(proc.brk_end);
    let new_top = page_align_up(addr);

    if new_top > old_top {
        let mut space = proc.address_space();
        let mut page = old_top;
        while page < new_top {
            let frame = match pmm.alloc_frame() {
                Ok(frame) => frame,
                Err(_) => {
                    release_range(proc, pmm, old_top, page - old_top);
                    return Err(Errno::Enomem);
                }
            };
            pmm.zero_frame(frame);
            if space
                .map_page(
                    pmm,
                    VirtualAddress::new(page),
                    frame,
                    PteFlags::USER | PteFlags::WRITABLE | PteFlags::NO_EXECUTE,
                )
                .is_err()
            {
                pmm.free_frame(frame);
                release_range(proc, pmm, old_top, page - old_top);
                return Err(Errno::Enomem);
            }
            page += PAGE_SIZE as u64;
        }
    } else if new_top < old_top {
        release_range(proc, pmm, new_top, old_top - new_top);
    }

    proc.brk_end = addr;
    Ok(addr as i64)
}
