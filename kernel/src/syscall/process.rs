//! Process syscalls: identity, fork, execve, exit, wait, kill.

use alloc::vec;

use super::{copy_cstr_from_user, copy_to_user, SysResult};
use crate::error::Errno;
use crate::fs::{self, FileSystem};
use crate::mm::{vmm::PteFlags, VirtualAddress, PAGE_SIZE};
use crate::process::{table, Process, ProcessState, SIGCONT, SIGKILL, SIGSTOP};

/// Exit code reported for a SIGKILL'd process (128 + 9).
const KILLED_EXIT_CODE: i32 = 137;

/// Top of the user stack mapped by execve.
const USER_STACK_TOP: u64 = 0x7FFF_FFF0_0000;
const USER_STACK_PAGES: u64 = 8;

pub fn sys_getpid(proc: &mut Process) -> SysResult {
    Ok(proc.pid as i64)
}

pub fn sys_getppid(proc: &mut Process) -> SysResult {
    Ok(proc.ppid as i64)
}

/// Clone the calling process: eager copy of the user address space, shared
/// console/file descriptions, child resumes from the same snapshot with
/// RAX = 0.
pub fn sys_fork(proc: &mut Process) -> SysResult {
    // Lock order everywhere: process table, then frame allocator.
    let mut tbl = table::table().lock();
    let mut pmm = crate::mm::pmm::get().lock();

    let child_space = proc
        .address_space()
        .duplicate_user(&mut pmm)
        .map_err(Errno::from)?;
    let pid = tbl.alloc_pid();
    let mut child = match proc.clone_for_fork(&mut pmm, pid, child_space.root()) {
        Ok(child) => child,
        Err(e) => {
            let mut space = child_space;
            space.free_user_half(&mut pmm);
            pmm.free_frame(space.root());
            return Err(Errno::from(e));
        }
    };
    drop(pmm);

    child.context_mut().rax = 0;
    let ptr = tbl.insert(child);
    drop(tbl);

    crate::sched::add(ptr);
    Ok(pid as i64)
}

/// Replace the process image: load the ELF into a fresh address space, tear
/// the old user half down, map a stack and reset the snapshot to the new
/// entry point.
pub fn sys_execve(proc: &mut Process, path: u64, _argv: u64, _envp: u64) -> SysResult {
    let path = copy_cstr_from_user(proc, path, 4096)?;
    let vfs = fs::root();
    let inode = vfs.resolve(&path).map_err(Errno::from)?;
    let size = vfs.metadata(inode).map_err(Errno::from)?.size as usize;
    let mut image = vec![0u8; size];
    let n = vfs.read_at(inode, 0, &mut image).map_err(Errno::from)?;
    if n != size {
        return Err(Errno::Eio);
    }

    let mut pmm = crate::mm::pmm::get().lock();
    let mut new_space = proc
        .address_space()
        .new_user(&mut pmm)
        .map_err(Errno::from)?;

    let loaded = match crate::elf::load(&image, &mut new_space, &mut pmm) {
        Ok(loaded) => loaded,
        Err(e) => {
            new_space.free_user_half(&mut pmm);
            pmm.free_frame(new_space.root());
            return Err(Errno::from(e));
        }
    };

    // User stack just below the canonical boundary.
    for i in 0..USER_STACK_PAGES {
        let frame = pmm.alloc_frame().map_err(Errno::from)?;
        pmm.zero_frame(frame);
        new_space
            .map_page(
                &mut pmm,
                VirtualAddress::new(USER_STACK_TOP - (i + 1) * PAGE_SIZE as u64),
                frame,
                PteFlags::USER | PteFlags::WRITABLE | PteFlags::NO_EXECUTE,
            )
            .map_err(Errno::from)?;
    }

    // Swap the address spaces; the old user half is gone for good.
    let mut old_space = proc.address_space();
    if proc.owns_address_space {
        old_space.free_user_half(&mut pmm);
        pmm.free_frame(old_space.root());
    }
    proc.address_space_root = new_space.root();
    proc.owns_address_space = true;
    drop(pmm);

    proc.brk_start = loaded.brk;
    proc.brk_end = loaded.brk;
    *proc.context_mut() =
        crate::arch::x86_64::context::CpuContext::user_entry(loaded.entry, USER_STACK_TOP);

    #[cfg(target_os = "none")]
    if crate::sched::current_pid() == Some(proc.pid) {
        crate::mm::vmm::switch_address_space(proc.address_space_root);
    }

    Ok(0)
}

/// Terminate the calling process: release descriptors, mark TERMINATED,
/// reschedule. The control block stays for the parent's wait.
pub fn sys_exit(proc: &mut Process, code: i64) -> SysResult {
    proc.fds.release_all();
    crate::sched::exit_current(code as i32);
    Ok(0)
}

/// Reap a terminated child. `pid <= 0` means any child; the status word
/// packs the exit code Linux-style.
pub fn sys_wait4(proc: &mut Process, pid: i64, status_ptr: u64, _rusage: u64) -> SysResult {
    loop {
        let tbl = table::table().lock();
        let zombie = if pid <= 0 {
            tbl.find_zombie_child(proc.pid)
        } else {
            match tbl.get(pid as u64) {
                Some(p) if p.ppid == proc.pid && p.state == ProcessState::Terminated => {
                    Some(p.pid)
                }
                Some(p) if p.ppid == proc.pid => None,
                _ => return Err(Errno::Echild),
            }
        };
        if zombie.is_none() && !tbl.has_children(proc.pid) {
            return Err(Errno::Echild);
        }
        drop(tbl);

        if let Some(zombie) = zombie {
            let code = table::destroy(zombie).ok_or(Errno::Echild)?;
            if status_ptr != 0 {
                let status = ((code & 0xFF) as u32) << 8;
                copy_to_user(proc, status_ptr, &status.to_le_bytes())?;
            }
            return Ok(zombie as i64);
        }

        if cfg!(target_os = "none") {
            // The child needs CPU time to exit; spin through the scheduler.
            crate::sched::yield_now();
        } else {
            return Err(Errno::Eagain);
        }
    }
}

/// SIGKILL/SIGSTOP/SIGCONT act immediately; everything else is recorded as
/// pending.
pub fn sys_kill(proc: &mut Process, pid: i64, signal: u64) -> SysResult {
    if pid <= 0 || signal > 64 {
        return Err(Errno::Einval);
    }
    let pid = pid as u64;
    let signal = signal as u32;

    // Self-kill with SIGKILL is exit in disguise; handle before taking the
    // table lock so the exit path can reschedule freely.
    if signal == SIGKILL && pid == proc.pid {
        proc.fds.release_all();
        crate::sched::exit_current(KILLED_EXIT_CODE);
        return Ok(0);
    }

    let mut tbl = table::table().lock();
    let target = tbl.get_mut(pid).ok_or(Errno::Esrch)?;

    match signal {
        0 => {} // existence probe
        SIGKILL => {
            crate::sched::remove(core::ptr::NonNull::from(&mut *target));
            target.state = ProcessState::Terminated;
            target.exit_code = KILLED_EXIT_CODE;
        }
        SIGSTOP => {
            if target.state != ProcessState::Terminated {
                crate::sched::remove(core::ptr::NonNull::from(&mut *target));
                target.state = ProcessState::Blocked;
                target.post_signal(SIGSTOP);
            }
        }
        SIGCONT => {
            if target.state == ProcessState::Blocked {
                target.clear_signal(SIGSTOP);
                let ptr = core::ptr::NonNull::from(&mut *target);
                drop(tbl);
                crate::sched::add(ptr);
                return Ok(0);
            }
            target.post_signal(SIGCONT);
        }
        other => target.post_signal(other),
    }
    Ok(0)
}
