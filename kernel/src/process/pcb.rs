//! Process control block.

use alloc::boxed::Box;
use alloc::string::String;
use core::ptr::NonNull;

use crate::arch::x86_64::context::CpuContext;
use crate::error::Result;
use crate::fs::fd_table::FdTable;
use crate::mm::{pmm::FrameAllocator, vmm::AddressSpace, DirectMap, PhysicalAddress, PAGE_SIZE};

/// Process identifier.
pub type Pid = u64;

/// Default quantum in timer ticks.
pub const DEFAULT_TIME_SLICE: u32 = 100;

/// Process names are clamped to this many bytes.
pub const MAX_NAME_LEN: usize = 32;

/// Where anonymous mmap regions start in a fresh process.
pub const MMAP_BASE: u64 = 0x6000_0000_0000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessState {
    /// Created, not yet accepted by the scheduler
    New,
    /// On the ready queue
    Ready,
    /// Executing on the CPU
    Running,
    /// Parked on an I/O object
    Blocked,
    /// Exited, awaiting reap by the parent
    Terminated,
}

/// Process control block.
///
/// The CPU-state snapshot lives at the top of the kernel stack frame, not in
/// the control block itself; `context` points into that frame. The ready
/// queue threads through `sched_next`, so queue membership is visible right
/// on the block.
pub struct Process {
    pub pid: Pid,
    pub ppid: Pid,
    pub name: String,
    pub state: ProcessState,
    pub priority: u8,
    /// Quantum budget in ticks.
    pub time_slice: u32,
    /// Ticks consumed in the current quantum.
    pub time_used: u32,
    /// Physical frame backing the kernel stack.
    kernel_stack: PhysicalAddress,
    /// Saved CPU state, carved at the top of the kernel stack.
    context: NonNull<CpuContext>,
    /// PML4 of this process's address space.
    pub address_space_root: PhysicalAddress,
    /// Whether exit should tear the address space down (false for kernel
    /// tasks sharing the kernel space).
    pub owns_address_space: bool,
    /// Direct-map view used to touch this process's frames.
    dmap: DirectMap,
    pub fds: FdTable,
    pub exit_code: i32,
    /// Pending signal bitmask (bit N-1 for signal N).
    pub pending_signals: u64,
    pub brk_start: u64,
    pub brk_end: u64,
    /// Bump pointer for anonymous mmap placement.
    pub mmap_next: u64,
    /// Intrusive ready-queue link; owned by the scheduler while queued.
    pub(crate) sched_next: Option<NonNull<Process>>,
}

// SAFETY: a Process migrates between the table, the ready queue and the
// scheduler, all of which serialise access behind locks; the raw context
// pointer targets the process's own kernel stack frame.
unsafe impl Send for Process {}

impl Process {
    /// Build a kernel task: allocate the control block and a one-frame
    /// kernel stack, and carve the CPU snapshot at the stack top with the
    /// entry point and kernel selectors.
    pub fn new_kernel_task(
        pmm: &mut FrameAllocator,
        pid: Pid,
        ppid: Pid,
        name: &str,
        entry: u64,
        priority: u8,
        address_space_root: PhysicalAddress,
    ) -> Result<Box<Process>> {
        let kernel_stack = pmm.alloc_frame()?;
        pmm.zero_frame(kernel_stack);

        let dmap = pmm.direct_map();
        let stack_top = dmap.virt_of(kernel_stack).as_u64() + PAGE_SIZE as u64;
        let ctx_addr = stack_top - core::mem::size_of::<CpuContext>() as u64;

        let ctx_ptr = ctx_addr as *mut CpuContext;
        // SAFETY: ctx_addr lies inside the freshly allocated, zeroed stack
        // frame, 16-byte aligned because both the frame top and the snapshot
        // size are.
        unsafe {
            ctx_ptr.write(CpuContext::kernel_entry(entry, ctx_addr));
        }

        let mut name_buf = String::from(name);
        name_buf.truncate(MAX_NAME_LEN);

        Ok(Box::new(Process {
            pid,
            ppid,
            name: name_buf,
            state: ProcessState::New,
            priority,
            time_slice: DEFAULT_TIME_SLICE,
            time_used: 0,
            kernel_stack,
            // SAFETY: derived from the non-null stack alias just written.
            context: unsafe { NonNull::new_unchecked(ctx_ptr) },
            address_space_root,
            owns_address_space: false,
            dmap,
            fds: FdTable::with_console(),
            exit_code: 0,
            pending_signals: 0,
            brk_start: 0,
            brk_end: 0,
            mmap_next: MMAP_BASE,
            sched_next: None,
        }))
    }

    /// Clone the control block for fork. The caller provides the child's
    /// already-copied address space root; the CPU snapshot is duplicated
    /// onto the child's own kernel stack.
    pub fn clone_for_fork(
        &self,
        pmm: &mut FrameAllocator,
        child_pid: Pid,
        child_root: PhysicalAddress,
    ) -> Result<Box<Process>> {
        let kernel_stack = pmm.alloc_frame()?;
        pmm.zero_frame(kernel_stack);

        let dmap = pmm.direct_map();
        let stack_top = dmap.virt_of(kernel_stack).as_u64() + PAGE_SIZE as u64;
        let ctx_addr = stack_top - core::mem::size_of::<CpuContext>() as u64;
        let ctx_ptr = ctx_addr as *mut CpuContext;
        // SAFETY: target is inside the child's fresh stack frame; source is
        // the parent's saved snapshot, valid while the parent is suspended
        // in this very syscall.
        unsafe {
            ctx_ptr.write(*self.context.as_ref());
        }

        Ok(Box::new(Process {
            pid: child_pid,
            ppid: self.pid,
            name: self.name.clone(),
            state: ProcessState::New,
            priority: self.priority,
            time_slice: self.time_slice,
            time_used: 0,
            kernel_stack,
            // SAFETY: as above.
            context: unsafe { NonNull::new_unchecked(ctx_ptr) },
            address_space_root: child_root,
            owns_address_space: true,
            dmap: self.dmap,
            fds: self.fds.fork_clone(),
            exit_code: 0,
            pending_signals: 0,
            brk_start: self.brk_start,
            brk_end: self.brk_end,
            mmap_next: self.mmap_next,
            sched_next: None,
        }))
    }

    pub fn context_ptr(&self) -> NonNull<CpuContext> {
        self.context
    }

    pub fn context(&self) -> &CpuContext {
        // SAFETY: the snapshot is only read while the process is off-CPU;
        // the pointer targets the process's own stack frame.
        unsafe { self.context.as_ref() }
    }

    pub fn context_mut(&mut self) -> &mut CpuContext {
        // SAFETY: as in `context`, plus exclusive access through &mut self.
        unsafe { &mut *self.context.as_ptr() }
    }

    pub fn kernel_stack(&self) -> PhysicalAddress {
        self.kernel_stack
    }

    /// Top of the kernel stack (for TSS RSP0 on ring transitions).
    pub fn kernel_stack_top(&self, dmap: crate::mm::DirectMap) -> u64 {
        dmap.virt_of(self.kernel_stack).as_u64() + PAGE_SIZE as u64
    }

    pub fn direct_map(&self) -> DirectMap {
        self.dmap
    }

    /// Walker handle over this process's translation tree.
    pub fn address_space(&self) -> AddressSpace {
        AddressSpace::from_root(self.address_space_root, self.dmap)
    }

    /// Record a signal as pending.
    pub fn post_signal(&mut self, signal: u32) {
        if (1..=64).contains(&signal) {
            self.pending_signals |= 1u64 << (signal - 1);
        }
    }

    pub fn signal_pending(&self, signal: u32) -> bool {
        (1..=64).contains(&signal) && self.pending_signals & (1u64 << (signal - 1)) != 0
    }

    pub fn clear_signal(&mut self, signal: u32) {
        if (1..=64).contains(&signal) {
            self.pending_signals &= !(1u64 << (signal - 1));
        }
    }

    /// Free the kernel stack and, for address-space owners, the user pages
    /// and translation tree. Called exactly once, by the reaper.
    pub fn free_resources(&mut self, pmm: &mut FrameAllocator) {
        if self.owns_address_space {
            let mut space = crate::mm::vmm::AddressSpace::from_root(
                self.address_space_root,
                pmm.direct_map(),
            );
            space.free_user_half(pmm);
            pmm.free_frame(self.address_space_root);
            self.owns_address_space = false;
        }
        pmm.free_frame(self.kernel_stack);
    }
}

#[cfg(all(test, not(target_os = "none")))]
mod tests {
    use super::*;
    use crate::mm::testmem::TestArena;

    fn arena() -> (TestArena, FrameAllocator) {
        let arena = TestArena::new(16 * 1024 * 1024);
        let mut map = arena.memory_map();
        let pmm = FrameAllocator::new(arena.direct_map(), &mut map).unwrap();
        (arena, pmm)
    }

    #[test]
    fn snapshot_sits_at_stack_top() {
        let (arena, mut pmm) = arena();
        let proc = Process::new_kernel_task(
            &mut pmm,
            1,
            0,
            "idle",
            0xFFFF_FFFF_8000_2000,
            0,
            PhysicalAddress::new(0x1000),
        )
        .unwrap();

        let ctx = proc.context();
        assert_eq!(ctx.rip, 0xFFFF_FFFF_8000_2000);
        // The stack pointer starts right below the carved snapshot, which
        // itself ends exactly at the top of the stack frame.
        assert_eq!(ctx.rsp, proc.context_ptr().as_ptr() as u64);
        let top = proc.kernel_stack_top(arena.direct_map());
        assert_eq!(
            proc.context_ptr().as_ptr() as u64 + core::mem::size_of::<CpuContext>() as u64,
            top
        );
        assert_eq!(proc.context_ptr().as_ptr() as u64 % 16, 0);
    }

    #[test]
    fn names_are_clamped() {
        let (_arena, mut pmm) = arena();
        let long = "x".repeat(100);
        let proc = Process::new_kernel_task(
            &mut pmm,
            1,
            0,
            &long,
            0,
            0,
            PhysicalAddress::new(0x1000),
        )
        .unwrap();
        assert_eq!(proc.name.len(), MAX_NAME_LEN);
    }

    #[test]
    fn signal_bookkeeping() {
        let (_arena, mut pmm) = arena();
        let mut proc = Process::new_kernel_task(
            &mut pmm,
            1,
            0,
            "sig",
            0,
            0,
            PhysicalAddress::new(0x1000),
        )
        .unwrap();

        proc.post_signal(crate::process::SIGSTOP);
        assert!(proc.signal_pending(crate::process::SIGSTOP));
        assert!(!proc.signal_pending(crate::process::SIGKILL));
        proc.clear_signal(crate::process::SIGSTOP);
        assert!(!proc.signal_pending(crate::process::SIGSTOP));
        // Out-of-range signals are ignored.
        proc.post_signal(0);
        proc.post_signal(65);
        assert_eq!(proc.pending_signals, 0);
    }

    #[test]
    fn fork_clone_copies_context_and_fds() {
        let (_arena, mut pmm) = arena();
        let mut parent = Process::new_kernel_task(
            &mut pmm,
            1,
            0,
            "parent",
            0x40_0000,
            0,
            PhysicalAddress::new(0x1000),
        )
        .unwrap();
        parent.context_mut().rax = 0xDEAD;
        parent.brk_start = 0x100;
        parent.brk_end = 0x200;

        let child = parent
            .clone_for_fork(&mut pmm, 2, PhysicalAddress::new(0x2000))
            .unwrap();
        assert_eq!(child.pid, 2);
        assert_eq!(child.ppid, 1);
        assert_eq!(child.context().rip, parent.context().rip);
        assert_eq!(child.context().rax, 0xDEAD);
        assert_ne!(child.kernel_stack(), parent.kernel_stack());
        assert_eq!(child.fds.open_count(), 3);
        assert_eq!(child.brk_end, 0x200);
        assert!(child.owns_address_space);
    }
}
