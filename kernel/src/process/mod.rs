//! Process model: control blocks, the global process table, lifecycle.

pub mod pcb;
pub mod table;

pub use pcb::{Pid, Process, ProcessState, DEFAULT_TIME_SLICE};
pub use table::{spawn_kernel_task, ProcessTable};

/// Signal numbers the core tracks.
pub const SIGKILL: u32 = 9;
pub const SIGCONT: u32 = 18;
pub const SIGSTOP: u32 = 19;
/// Exit code reported for a process killed by a CPU fault (128 + SIGSEGV).
pub const FAULT_EXIT_CODE: i32 = 139;

/// Kill the faulting user process and hand the CPU to the next runnable one.
/// Called from the exception dispatcher; the kernel itself stays live.
pub fn terminate_current_on_fault(_vector: u8) {
    crate::sched::exit_current(FAULT_EXIT_CODE);
}
