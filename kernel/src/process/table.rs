//! Global process table and PID allocation.

use alloc::boxed::Box;
use alloc::collections::BTreeMap;
use core::ptr::NonNull;

use spin::Mutex;

use super::pcb::{Pid, Process};
use crate::error::Result;

/// The process list: PID-ordered ownership of every control block. Control
/// blocks are boxed, so pointers held by the ready queue stay stable while
/// the table reshuffles.
pub struct ProcessTable {
    procs: BTreeMap<Pid, Box<Process>>,
    next_pid: Pid,
}

impl ProcessTable {
    pub const fn new() -> Self {
        Self {
            procs: BTreeMap::new(),
            next_pid: 1,
        }
    }

    pub fn alloc_pid(&mut self) -> Pid {
        let pid = self.next_pid;
        self.next_pid += 1;
        pid
    }

    /// Take ownership of a control block; returns a pointer usable by the
    /// scheduler for as long as the process stays in the table.
    pub fn insert(&mut self, process: Box<Process>) -> NonNull<Process> {
        let pid = process.pid;
        self.procs.insert(pid, process);
        // Just inserted; the box target is stable on the heap.
        let proc_ref = self.procs.get_mut(&pid).expect("inserted above");
        NonNull::from(&mut **proc_ref)
    }

    /// Remove a control block. The caller must have unlinked it from the
    /// ready queue first.
    pub fn remove(&mut self, pid: Pid) -> Option<Box<Process>> {
        self.procs.remove(&pid)
    }

    pub fn get_mut(&mut self, pid: Pid) -> Option<&mut Process> {
        self.procs.get_mut(&pid).map(|b| &mut **b)
    }

    pub fn get(&self, pid: Pid) -> Option<&Process> {
        self.procs.get(&pid).map(|b| &**b)
    }

    pub fn contains(&self, pid: Pid) -> bool {
        self.procs.contains_key(&pid)
    }

    pub fn len(&self) -> usize {
        self.procs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.procs.is_empty()
    }

    /// First terminated child of `ppid`, if any (for wait).
    pub fn find_zombie_child(&self, ppid: Pid) -> Option<Pid> {
        self.procs
            .values()
            .find(|p| p.ppid == ppid && p.state == super::ProcessState::Terminated)
            .map(|p| p.pid)
    }

    /// Whether `ppid` has any children at all.
    pub fn has_children(&self, ppid: Pid) -> bool {
        self.procs.values().any(|p| p.ppid == ppid)
    }
}

impl Default for ProcessTable {
    fn default() -> Self {
        Self::new()
    }
}

static PROCESS_TABLE: Mutex<ProcessTable> = Mutex::new(ProcessTable::new());

/// The global process table.
pub fn table() -> &'static Mutex<ProcessTable> {
    &PROCESS_TABLE
}

/// Create a kernel task running `entry` in the kernel address space and hand
/// it to the scheduler.
pub fn spawn_kernel_task(entry: fn() -> !, priority: u8, name: &str) -> Result<Pid> {
    let root = crate::mm::vmm::kernel_space().lock().root();
    // Lock order everywhere: process table, then frame allocator.
    let mut tbl = PROCESS_TABLE.lock();
    let pid = tbl.alloc_pid();
    let process = {
        let mut pmm = crate::mm::pmm::get().lock();
        Process::new_kernel_task(&mut pmm, pid, 0, name, entry as usize as u64, priority, root)?
    };
    let ptr = tbl.insert(process);
    drop(tbl);

    crate::sched::add(ptr);
    log::info!("spawned kernel task '{}' as pid {}", name, pid);
    Ok(pid)
}

/// Reap a terminated process: unlink it everywhere and free its memory.
/// Safe to call at most once per PID; later calls find nothing.
pub fn destroy(pid: Pid) -> Option<i32> {
    let mut tbl = PROCESS_TABLE.lock();
    let process = tbl.get_mut(pid)?;
    crate::sched::remove(NonNull::from(&mut *process));
    let mut process = tbl.remove(pid)?;
    drop(tbl);

    let mut pmm = crate::mm::pmm::get().lock();
    process.fds.release_all();
    process.free_resources(&mut pmm);
    Some(process.exit_code)
}
