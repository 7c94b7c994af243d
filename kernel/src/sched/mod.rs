//! Round-robin scheduler.
//!
//! A FIFO ready queue threads through the control blocks' intrusive link.
//! Quantum accounting happens on the timer tick: a process that exhausts its
//! slice is rotated to the tail and the head takes the CPU. The queue lock
//! is released before control is transferred.

use core::ptr::NonNull;

use spin::Mutex;

use crate::arch::x86_64::context::CpuContext;
use crate::mm::PhysicalAddress;
use crate::process::{Process, ProcessState};

/// A pending context transfer, computed under the queue lock and performed
/// after it is released.
pub struct Switch {
    /// Snapshot to save the outgoing state into; `None` on the initial
    /// switch and when the outgoing process is gone.
    pub save: Option<NonNull<CpuContext>>,
    /// Snapshot to resume.
    pub load: NonNull<CpuContext>,
    /// Translation root of the incoming process.
    pub root: PhysicalAddress,
    /// Incoming kernel stack top for the TSS ring-transition slot.
    pub kernel_stack: PhysicalAddress,
}

/// The ready queue plus the per-CPU current pointer (one CPU in this core).
pub struct Scheduler {
    head: Option<NonNull<Process>>,
    tail: Option<NonNull<Process>>,
    current: Option<NonNull<Process>>,
}

// SAFETY: all access to the queue's raw pointers is serialised behind the
// scheduler lock; see the module-level SAFETY comments on queue operations.
unsafe impl Send for Scheduler {}

impl Scheduler {
    pub const fn new() -> Self {
        Self {
            head: None,
            tail: None,
            current: None,
        }
    }

    /// Accept a process: mark it READY and append it to the tail.
    pub fn add(&mut self, mut process: NonNull<Process>) {
        // SAFETY: queue members are table-owned control blocks that outlive
        // their queue membership; the scheduler lock serialises all access.
        unsafe {
            let p = process.as_mut();
            p.state = ProcessState::Ready;
            p.sched_next = None;
        }
        match self.tail {
            Some(mut tail) => {
                // SAFETY: as above.
                unsafe { tail.as_mut().sched_next = Some(process) };
                self.tail = Some(process);
            }
            None => {
                self.head = Some(process);
                self.tail = Some(process);
            }
        }
    }

    /// Unlink a process from the queue; no-op when it is not queued.
    pub fn remove(&mut self, process: NonNull<Process>) {
        let mut prev: Option<NonNull<Process>> = None;
        let mut cursor = self.head;
        while let Some(mut node) = cursor {
            // SAFETY: as in `add`.
            let next = unsafe { node.as_ref().sched_next };
            if node == process {
                match prev {
                    Some(mut p) => unsafe { p.as_mut().sched_next = next },
                    None => self.head = next,
                }
                if self.tail == Some(node) {
                    self.tail = prev;
                }
                // SAFETY: as in `add`.
                unsafe { node.as_mut().sched_next = None };
                return;
            }
            prev = Some(node);
            cursor = next;
        }
    }

    /// Pop the head of the ready queue.
    pub fn next(&mut self) -> Option<NonNull<Process>> {
        let mut head = self.head?;
        // SAFETY: as in `add`.
        unsafe {
            self.head = head.as_ref().sched_next;
            if self.head.is_none() {
                self.tail = None;
            }
            head.as_mut().sched_next = None;
        }
        Some(head)
    }

    pub fn current(&self) -> Option<NonNull<Process>> {
        self.current
    }

    /// Install the first process to run; used once at bring-up.
    pub fn adopt_current(&mut self, mut process: NonNull<Process>) {
        // SAFETY: as in `add`.
        unsafe { process.as_mut().state = ProcessState::Running };
        self.current = Some(process);
    }

    /// One timer tick of quantum accounting. Returns the transfer to
    /// perform when the current quantum is exhausted and a successor exists.
    pub fn on_tick(&mut self) -> Option<Switch> {
        let mut current = self.current?;
        // SAFETY: the current process is owned by the table and cannot be
        // reaped while it is still marked Running (the reaper unlinks it
        // from `current` first).
        unsafe {
            let p = current.as_mut();
            p.time_used += 1;
            if p.time_used < p.time_slice {
                return None;
            }
            p.time_used = 0;
        }

        let mut next = self.next()?;
        self.add(current);
        // SAFETY: as in `add`.
        let switch = unsafe {
            let n = next.as_mut();
            n.state = ProcessState::Running;
            Switch {
                save: Some(current.as_ref().context_ptr()),
                load: n.context_ptr(),
                root: n.address_space_root,
                kernel_stack: n.kernel_stack(),
            }
        };
        self.current = Some(next);
        Some(switch)
    }

    /// Give up the CPU voluntarily: rotate even with quantum remaining.
    pub fn yield_current(&mut self) -> Option<Switch> {
        let mut current = self.current?;
        let mut next = self.next()?;
        // SAFETY: as in `add`.
        unsafe {
            current.as_mut().time_used = 0;
        }
        self.add(current);
        // SAFETY: as in `add`.
        let switch = unsafe {
            let n = next.as_mut();
            n.state = ProcessState::Running;
            Switch {
                save: Some(current.as_ref().context_ptr()),
                load: n.context_ptr(),
                root: n.address_space_root,
                kernel_stack: n.kernel_stack(),
            }
        };
        self.current = Some(next);
        Some(switch)
    }

    /// Retire the current process (exit or fault kill). Returns the switch
    /// to the successor, or `None` when the queue is empty.
    pub fn retire_current(&mut self, exit_code: i32) -> Option<Switch> {
        let mut current = self.current.take()?;
        // SAFETY: as in `add`.
        unsafe {
            let p = current.as_mut();
            p.state = ProcessState::Terminated;
            p.exit_code = exit_code;
        }

        let mut next = self.next()?;
        // SAFETY: as in `add`.
        let switch = unsafe {
            let n = next.as_mut();
            n.state = ProcessState::Running;
            Switch {
                save: None,
                load: n.context_ptr(),
                root: n.address_space_root,
                kernel_stack: n.kernel_stack(),
            }
        };
        self.current = Some(next);
        Some(switch)
    }

    /// Queue length, for diagnostics.
    pub fn ready_count(&self) -> usize {
        let mut count = 0;
        let mut cursor = self.head;
        while let Some(node) = cursor {
            count += 1;
            // SAFETY: as in `add`.
            cursor = unsafe { node.as_ref().sched_next };
        }
        count
    }
}

impl Default for Scheduler {
    fn default() -> Self {
        Self::new()
    }
}

static SCHEDULER: Mutex<Scheduler> = Mutex::new(Scheduler::new());

/// The global scheduler instance.
pub fn scheduler() -> &'static Mutex<Scheduler> {
    &SCHEDULER
}

pub fn add(process: NonNull<Process>) {
    SCHEDULER.lock().add(process);
}

pub fn remove(process: NonNull<Process>) {
    SCHEDULER.lock().remove(process);
}

pub fn current() -> Option<NonNull<Process>> {
    SCHEDULER.lock().current()
}

/// PID of the running process, if any.
pub fn current_pid() -> Option<crate::process::Pid> {
    // SAFETY: current() returns a live table-owned block; reading the pid is
    // a single word.
    current().map(|p| unsafe { p.as_ref().pid })
}

/// Timer hook: account the tick and rotate when the quantum expires. The
/// queue lock is dropped before the transfer happens.
pub fn tick() {
    let switch = SCHEDULER.lock().on_tick();
    if let Some(switch) = switch {
        perform_switch(switch);
    }
}

/// Voluntary yield from kernel code.
pub fn yield_now() {
    let switch = SCHEDULER.lock().yield_current();
    if let Some(switch) = switch {
        perform_switch(switch);
    }
}

/// Terminate the running process and move on. With an empty ready queue the
/// CPU parks in the idle loop, interrupts open, so the system stays live.
pub fn exit_current(exit_code: i32) {
    let switch = SCHEDULER.lock().retire_current(exit_code);
    match switch {
        Some(switch) => perform_switch(switch),
        None => {
            // Nothing runnable: park in the idle loop with interrupts open.
            // (On the host the caller simply gets control back.)
            #[cfg(target_os = "none")]
            idle();
        }
    }
}

/// Hand the CPU to the first scheduled process. Does not return on bare
/// metal.
pub fn start() -> ! {
    let switch = {
        let mut sched = SCHEDULER.lock();
        match sched.next() {
            Some(first) => {
                sched.adopt_current(first);
                // SAFETY: `first` is table-owned and now Running.
                let n = unsafe { first.as_ref() };
                Some(Switch {
                    save: None,
                    load: n.context_ptr(),
                    root: n.address_space_root,
                    kernel_stack: n.kernel_stack(),
                })
            }
            None => None,
        }
    };
    if let Some(switch) = switch {
        perform_switch(switch);
    }
    idle()
}

fn idle() -> ! {
    loop {
        crate::arch::wait_for_interrupt();
    }
}

/// Commit a computed transfer: address space, TSS stack slot, registers.
/// Must be called with the scheduler lock released.
fn perform_switch(switch: Switch) {
    #[cfg(target_os = "none")]
    {
        let dmap = crate::mm::pmm::get().lock().direct_map();
        // RSP0 points below the carved snapshot region so ring-3 entry
        // frames never overlap the saved CPU state at the stack top.
        let stack_top = dmap.virt_of(switch.kernel_stack).as_u64()
            + crate::mm::PAGE_SIZE as u64
            - core::mem::size_of::<CpuContext>() as u64;
        crate::arch::x86_64::gdt::set_kernel_stack(stack_top);
        if crate::mm::vmm::current_root() != switch.root {
            crate::mm::vmm::switch_address_space(switch.root);
        }
    }

    let save = switch
        .save
        .map(|p| p.as_ptr())
        .unwrap_or(core::ptr::null_mut());
    // SAFETY: both snapshots live at the tops of kernel stacks owned by
    // table-resident processes; the outgoing snapshot is not touched again
    // until this process is rescheduled.
    unsafe {
        crate::arch::x86_64::context::context_switch(save, switch.load.as_ptr());
    }
}
