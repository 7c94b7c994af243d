//! FerriteOS bare-metal entry point.

#![cfg_attr(target_os = "none", no_std)]
#![cfg_attr(target_os = "none", no_main)]

#[cfg(target_os = "none")]
mod bare {
    use alloc::sync::Arc;
    use core::panic::PanicInfo;

    use ferrite_kernel::fs::ramfs::RamFs;
    use ferrite_kernel::mm::{DirectMap, PhysicalAddress};
    use ferrite_kernel::{arch, boot, fs, graphics, logger, mm, process, sched, serial, timer};
    use ferrite_kernel::{println, serial_println};

    extern crate alloc;

    #[panic_handler]
    fn panic(info: &PanicInfo) -> ! {
        serial_println!("[KERNEL PANIC] {}", info);
        println!("[KERNEL PANIC] {}", info);
        arch::halt();
    }

    /// Print the failure and stop: boot-time errors have no caller to
    /// propagate to.
    fn fatal(context: &str) -> ! {
        log::error!("boot failed: {}", context);
        arch::halt();
    }

    fn idle_task() -> ! {
        loop {
            arch::wait_for_interrupt();
        }
    }

    #[no_mangle]
    pub extern "C" fn kmain() -> ! {
        if !boot::revision_supported() {
            arch::halt();
        }

        serial::init();
        logger::init();
        log::info!(
            "FerriteOS {} booting on x86_64",
            env!("CARGO_PKG_VERSION")
        );

        let mut boot_info = match boot::capture() {
            Some(info) => info,
            None => fatal("missing bootloader responses"),
        };
        let dmap = DirectMap::new(boot_info.hhdm_offset);
        log::info!("hhdm at {:#x}", boot_info.hhdm_offset);

        // Physical memory first; everything else allocates through it.
        if mm::pmm::init(dmap, boot_info.memory_map()).is_err() {
            fatal("no usable region can hold the frame bitmap");
        }

        // Rebuild the translation tree under our own control and switch to
        // it: identity low meg, kernel image, self-mapped table nodes.
        let kernel_space = {
            let mut pmm = mm::pmm::get().lock();
            let bootstrap_root = mm::vmm::current_root();
            match mm::vmm::build_kernel_space(
                &mut pmm,
                bootstrap_root,
                boot_info.kernel_virt_base,
                boot_info.kernel_phys_base,
            ) {
                Ok(space) => space,
                Err(_) => fatal("kernel address space construction"),
            }
        };
        mm::vmm::switch_address_space(kernel_space.root());
        mm::vmm::set_kernel_space(kernel_space);
        log::info!("vmm: kernel address space live");

        if ferrite_kernel::kernel_heap().init().is_err() {
            fatal("kernel heap bring-up");
        }

        if let Some(fb) = boot_info.framebuffer {
            graphics::fbcon::init(fb);
        }
        println!("FerriteOS {}", env!("CARGO_PKG_VERSION"));

        // Descriptor tables, then interrupt controllers.
        arch::x86_64::init_tables();
        match boot_info.rsdp {
            Some(rsdp) => match arch::x86_64::acpi::parse(dmap, PhysicalAddress::new(rsdp)) {
                Ok(acpi) => {
                    if arch::x86_64::apic::init(dmap, &acpi).is_err() {
                        fatal("apic bring-up");
                    }
                    if let Some(base) = acpi.pcie_config_base {
                        log::info!("pcie: config space at {:#x}", base);
                    }
                }
                Err(_) => fatal("acpi table validation"),
            },
            None => fatal("firmware provided no RSDP"),
        }

        arch::x86_64::syscall::init();

        fs::mount_root(Arc::new(RamFs::new()));
        log::info!("vfs: ramfs root mounted");

        if timer::init().is_err() {
            fatal("timer bring-up");
        }

        if process::spawn_kernel_task(idle_task, 0, "idle").is_err() {
            fatal("idle task creation");
        }

        let stats = mm::pmm::get().lock().stats();
        log::info!(
            "boot complete: {} of {} frames free",
            stats.free_frames,
            stats.total_frames
        );
        println!("boot complete");

        arch::enable_interrupts();
        sched::start()
    }
}

#[cfg(not(target_os = "none"))]
fn main() {
    // The kernel binary only makes sense on bare metal; host builds exist
    // for `cargo test` against the library.
}
