//! End-to-end scenarios over the in-memory hardware stand-ins: boot to a
//! running process, fork bookkeeping and reaping, fault disposition, pipe
//! data integrity.

use core::ptr::NonNull;

use ferrite_kernel::arch::x86_64::gdt;
use ferrite_kernel::ipc::Pipe;
use ferrite_kernel::mm::pmm::FrameAllocator;
use ferrite_kernel::mm::testmem::TestArena;
use ferrite_kernel::mm::vmm::{build_kernel_space, AddressSpace};
use ferrite_kernel::mm::{MemoryRegion, VirtualAddress, PAGE_SIZE};
use ferrite_kernel::process::{Process, ProcessState, ProcessTable};
use ferrite_kernel::sched::Scheduler;

/// Scenario: one 128 MiB usable region at 1 MiB, HHDM provided by the
/// arena. After bring-up the allocator still has the vast majority of its
/// frames, the low megabyte is identity mapped, and a fresh kernel task
/// reaches RUNNING.
#[test]
fn boot_to_idle() {
    let arena = TestArena::new(129 * 1024 * 1024);
    let mut map = [
        MemoryRegion {
            base: 0,
            length: 0x100000,
            usable: false,
        },
        MemoryRegion {
            base: 0x100000,
            length: 128 * 1024 * 1024,
            usable: true,
        },
    ];
    let mut pmm = FrameAllocator::new(arena.direct_map(), &mut map).unwrap();

    // Stand-in for the bootloader's tables: an empty root.
    let bootstrap = AddressSpace::new(&mut pmm).unwrap();
    let kernel_space = build_kernel_space(
        &mut pmm,
        bootstrap.root(),
        0xFFFF_FFFF_8000_0000,
        0x20_0000,
    )
    .unwrap();

    // Bitmap, page tables and bootstrap scaffolding cost a bounded slice of
    // the 32768-frame region.
    let stats = pmm.stats();
    assert!(
        stats.free_frames >= 32000,
        "only {} frames free after bring-up",
        stats.free_frames
    );

    // The legacy low meg stays identity mapped.
    for addr in (0u64..0x100000).step_by(PAGE_SIZE) {
        assert_eq!(
            kernel_space.translate(VirtualAddress::new(addr)).as_u64(),
            addr
        );
    }

    // A task created against the kernel space reaches RUNNING under the
    // scheduler.
    let mut table = ProcessTable::new();
    let pid = table.alloc_pid();
    let proc = Process::new_kernel_task(
        &mut pmm,
        pid,
        0,
        "idle",
        0xFFFF_FFFF_8000_1000,
        0,
        kernel_space.root(),
    )
    .unwrap();
    let ptr = table.insert(proc);

    let mut sched = Scheduler::new();
    sched.add(ptr);
    let first = sched.next().unwrap();
    sched.adopt_current(first);
    assert_eq!(unsafe { first.as_ref().state }, ProcessState::Running);
    assert_eq!(unsafe { first.as_ref().pid }, pid);
    assert_eq!(
        unsafe { first.as_ref().context().cs },
        gdt::KERNEL_CS as u64
    );
}

/// Scenario: fork gives the child the next PID, the parent's three console
/// descriptors and a zeroed return register; exiting with status 7 makes the
/// parent's wait see pid 2 and status 7.
#[test]
fn fork_round_trip() {
    let arena = TestArena::new(64 * 1024 * 1024);
    let mut map = arena.memory_map();
    let mut pmm = FrameAllocator::new(arena.direct_map(), &mut map).unwrap();

    let mut table = ProcessTable::new();
    let parent_space = AddressSpace::new(&mut pmm).unwrap();

    let parent_pid = table.alloc_pid();
    assert_eq!(parent_pid, 1);
    let parent = Process::new_kernel_task(
        &mut pmm,
        parent_pid,
        0,
        "init",
        0x40_0000,
        0,
        parent_space.root(),
    )
    .unwrap();
    let mut parent_ptr = table.insert(parent);

    // Fork: duplicate the (empty) user half, clone the control block.
    let parent_ref = unsafe { parent_ptr.as_mut() };
    let child_space = parent_ref
        .address_space()
        .duplicate_user(&mut pmm)
        .unwrap();
    let child_pid = table.alloc_pid();
    let mut child = parent_ref
        .clone_for_fork(&mut pmm, child_pid, child_space.root())
        .unwrap();
    child.context_mut().rax = 0;

    assert_eq!(child.pid, 2);
    assert_eq!(child.ppid, 1);
    assert_eq!(child.fds.open_count(), 3, "console fds inherited");
    assert_eq!(child.context().rax, 0, "child returns 0 from fork");

    let mut child_ptr = table.insert(child);

    // Child exits with status 7.
    unsafe {
        child_ptr.as_mut().state = ProcessState::Terminated;
        child_ptr.as_mut().exit_code = 7;
    }

    // Parent's wait finds the zombie, reaps it, and reads back the status.
    let zombie = table.find_zombie_child(parent_pid).unwrap();
    assert_eq!(zombie, 2);
    let mut reaped = table.remove(zombie).unwrap();
    let status = ((reaped.exit_code & 0xFF) as u32) << 8;
    assert_eq!(status, 7 << 8);
    reaped.free_resources(&mut pmm);
    assert!(table.find_zombie_child(parent_pid).is_none());
}

/// Scenario: a load from virtual 0 in a process with no mapping there is a
/// page fault with CR2 = 0; the process dies, the scheduler advances, the
/// kernel stays live.
#[test]
fn user_null_dereference_kills_only_the_process() {
    let arena = TestArena::new(64 * 1024 * 1024);
    let mut map = arena.memory_map();
    let mut pmm = FrameAllocator::new(arena.direct_map(), &mut map).unwrap();

    let space = AddressSpace::new(&mut pmm).unwrap();
    // Nothing is mapped at 0: the access faults rather than translating.
    assert_eq!(space.translate(VirtualAddress::new(0)).as_u64(), 0);

    let mut table = ProcessTable::new();
    let faulty_pid = table.alloc_pid();
    let faulty = Process::new_kernel_task(
        &mut pmm,
        faulty_pid,
        0,
        "crasher",
        0x40_0000,
        0,
        space.root(),
    )
    .unwrap();
    let faulty_ptr = table.insert(faulty);

    let survivor_space = AddressSpace::new(&mut pmm).unwrap();
    let survivor_pid = table.alloc_pid();
    let survivor = Process::new_kernel_task(
        &mut pmm,
        survivor_pid,
        0,
        "survivor",
        0x40_0000,
        0,
        survivor_space.root(),
    )
    .unwrap();
    let survivor_ptr = table.insert(survivor);

    let mut sched = Scheduler::new();
    sched.add(faulty_ptr);
    sched.add(survivor_ptr);
    let first = sched.next().unwrap();
    sched.adopt_current(first);

    // The fault handler's disposition for a ring-3 fault: terminate and
    // reschedule.
    let switch = sched.retire_current(139).unwrap();
    assert!(switch.save.is_none(), "a dead process is not saved");
    assert_eq!(unsafe { faulty_ptr.as_ref().state }, ProcessState::Terminated);

    // The kernel is live: the survivor runs.
    let current = sched.current().unwrap();
    assert_eq!(unsafe { current.as_ref().pid }, survivor_pid);
    assert_eq!(unsafe { current.as_ref().state }, ProcessState::Running);
}

/// Scenario: 256 distinct bytes written to a pipe come back identical and
/// in order, then the drained pipe reports EOF once the writer is gone.
#[test]
fn pipe_preserves_byte_sequence() {
    let pipe = Pipe::new();
    let data: Vec<u8> = (0u16..=255).map(|b| b as u8).collect();
    assert_eq!(pipe.write(&data).unwrap(), 256);

    let mut out = vec![0u8; 256];
    let mut got = 0;
    while got < 256 {
        let n = pipe.read(&mut out[got..]);
        assert!(n > 0);
        got += n;
    }
    assert_eq!(out, data);

    pipe.release_writer();
    let mut tail = [0u8; 8];
    assert_eq!(pipe.read(&mut tail), 0);
    assert!(pipe.at_eof());
}

/// Scenario: NonNull round trip through the intrusive queue across many
/// processes does not disturb table ownership.
#[test]
fn queue_membership_tracks_state_for_every_process() {
    let arena = TestArena::new(64 * 1024 * 1024);
    let mut map = arena.memory_map();
    let mut pmm = FrameAllocator::new(arena.direct_map(), &mut map).unwrap();
    let space = AddressSpace::new(&mut pmm).unwrap();

    let mut table = ProcessTable::new();
    let mut sched = Scheduler::new();
    let mut ptrs: Vec<NonNull<Process>> = Vec::new();

    for i in 0..16 {
        let pid = table.alloc_pid();
        let proc = Process::new_kernel_task(
            &mut pmm,
            pid,
            0,
            &format!("task{}", i),
            0,
            0,
            space.root(),
        )
        .unwrap();
        let ptr = table.insert(proc);
        sched.add(ptr);
        ptrs.push(ptr);
    }

    // Everything queued is READY.
    for ptr in &ptrs {
        assert_eq!(unsafe { ptr.as_ref().state }, ProcessState::Ready);
    }
    assert_eq!(sched.ready_count(), 16);

    // Drain half; the rest stays linked in order.
    for expected in ptrs.iter().take(8) {
        assert_eq!(sched.next(), Some(*expected));
    }
    assert_eq!(sched.ready_count(), 8);
    assert_eq!(table.len(), 16);
}
