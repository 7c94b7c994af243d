//! Virtual memory: the 4-level page-table walker.
//!
//! Table nodes are edited through their direct-map alias, so the walker works
//! the same whether the tables are live (bare metal) or sitting in a test
//! arena. Address spaces share the kernel half (PML4 entries 256..512) and
//! diverge in the lower half.

use spin::{Mutex, Once};

use super::{pmm::FrameAllocator, DirectMap, PhysicalAddress, VirtualAddress, PAGE_SIZE};
use crate::error::Result;

bitflags::bitflags! {
    /// Page-table entry flags (low 12 bits + NX).
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct PteFlags: u64 {
        const PRESENT       = 1 << 0;
        const WRITABLE      = 1 << 1;
        const USER          = 1 << 2;
        const WRITE_THROUGH = 1 << 3;
        const NO_CACHE      = 1 << 4;
        const ACCESSED      = 1 << 5;
        const DIRTY         = 1 << 6;
        const HUGE          = 1 << 7;
        const GLOBAL        = 1 << 8;
        const NO_EXECUTE    = 1 << 63;
    }
}

/// Physical-address field of a table entry.
const ENTRY_ADDR_MASK: u64 = 0x000F_FFFF_FFFF_F000;

/// Number of entries per table node.
const ENTRIES: usize = 512;

/// Identity-mapped low region kept for legacy hardware access.
const IDENTITY_MAP_SIZE: u64 = 0x100000;

/// Size of the kernel image mapping established at init (16 MiB).
const KERNEL_IMAGE_SIZE: u64 = 0x1000000;

#[inline]
const fn table_indices(vaddr: u64) -> (usize, usize, usize, usize) {
    (
        ((vaddr >> 39) & 0x1FF) as usize,
        ((vaddr >> 30) & 0x1FF) as usize,
        ((vaddr >> 21) & 0x1FF) as usize,
        ((vaddr >> 12) & 0x1FF) as usize,
    )
}

/// One address space, identified by the physical address of its PML4.
pub struct AddressSpace {
    root: PhysicalAddress,
    dmap: DirectMap,
}

impl AddressSpace {
    /// Allocate a fresh, zeroed address space.
    pub fn new(pmm: &mut FrameAllocator) -> Result<Self> {
        let root = pmm.alloc_frame()?;
        pmm.zero_frame(root);
        Ok(Self {
            root,
            dmap: pmm.direct_map(),
        })
    }

    /// Wrap an already-built translation tree (e.g. the bootloader's).
    pub fn from_root(root: PhysicalAddress, dmap: DirectMap) -> Self {
        Self { root, dmap }
    }

    /// A new user address space sharing this space's kernel half.
    pub fn new_user(&self, pmm: &mut FrameAllocator) -> Result<Self> {
        let space = Self::new(pmm)?;
        let src = self.table(self.root);
        let dst = space.table(space.root);
        for i in ENTRIES / 2..ENTRIES {
            // SAFETY: both nodes are live table frames owned by their spaces;
            // the upper half holds only shared kernel mappings.
            unsafe {
                (*dst)[i] = (*src)[i];
            }
        }
        Ok(space)
    }

    pub fn root(&self) -> PhysicalAddress {
        self.root
    }

    pub fn direct_map(&self) -> DirectMap {
        self.dmap
    }

    fn table(&self, phys: PhysicalAddress) -> *mut [u64; ENTRIES] {
        self.dmap.ptr_of(phys) as *mut [u64; ENTRIES]
    }

    fn entry(&self, table_phys: PhysicalAddress, index: usize) -> u64 {
        // SAFETY: table_phys always comes from a PRESENT entry or the root,
        // both of which point at live 4 KiB table frames.
        unsafe { (*self.table(table_phys))[index] }
    }

    fn set_entry(&self, table_phys: PhysicalAddress, index: usize, value: u64) {
        // SAFETY: as in `entry`.
        unsafe {
            (*self.table(table_phys))[index] = value;
        }
    }

    /// Walk one level down, allocating and installing a zeroed node when the
    /// entry is not present.
    fn descend_or_create(
        &mut self,
        pmm: &mut FrameAllocator,
        table_phys: PhysicalAddress,
        index: usize,
        flags: PteFlags,
    ) -> Result<PhysicalAddress> {
        let entry = self.entry(table_phys, index);
        if entry & PteFlags::PRESENT.bits() != 0 {
            // A huge leaf (bootloader HHDM mapping) cannot be descended
            // into; the core never creates such entries itself.
            if entry & PteFlags::HUGE.bits() != 0 {
                return Err(crate::error::KernelError::InvalidArgument);
            }
            return Ok(PhysicalAddress::new(entry & ENTRY_ADDR_MASK));
        }
        let node = pmm.alloc_frame()?;
        pmm.zero_frame(node);
        let node_flags = PteFlags::PRESENT | PteFlags::WRITABLE | flags;
        self.set_entry(table_phys, index, node.as_u64() | node_flags.bits());
        Ok(node)
    }

    /// Map one 4 KiB page.
    ///
    /// Intermediate nodes are created with `PRESENT | WRITABLE | flags`. A
    /// present leaf at `virt` is silently overwritten; callers that care must
    /// unmap first.
    pub fn map_page(
        &mut self,
        pmm: &mut FrameAllocator,
        virt: VirtualAddress,
        phys: PhysicalAddress,
        flags: PteFlags,
    ) -> Result<()> {
        let (l4, l3, l2, l1) = table_indices(virt.as_u64());

        let pdpt = self.descend_or_create(pmm, self.root, l4, flags)?;
        let pd = self.descend_or_create(pmm, pdpt, l3, flags)?;
        let pt = self.descend_or_create(pmm, pd, l2, flags)?;

        let leaf = (phys.as_u64() & ENTRY_ADDR_MASK) | (flags | PteFlags::PRESENT).bits();
        self.set_entry(pt, l1, leaf);

        invalidate_tlb(virt);
        Ok(())
    }

    /// Walk to the page-table node covering `virt`, without creating levels.
    fn leaf_table(&self, virt: VirtualAddress) -> Option<(PhysicalAddress, usize)> {
        let (l4, l3, l2, l1) = table_indices(virt.as_u64());
        let mut node = self.root;
        for index in [l4, l3, l2] {
            let entry = self.entry(node, index);
            if entry & PteFlags::PRESENT.bits() == 0
                || entry & PteFlags::HUGE.bits() != 0
            {
                return None;
            }
            node = PhysicalAddress::new(entry & ENTRY_ADDR_MASK);
        }
        Some((node, l1))
    }

    /// Remove the mapping for `virt`. Returns whether a mapping existed, so
    /// the caller can decide to free the backing frame.
    pub fn unmap_page(&mut self, virt: VirtualAddress) -> bool {
        let Some((pt, l1)) = self.leaf_table(virt) else {
            return false;
        };
        if self.entry(pt, l1) & PteFlags::PRESENT.bits() == 0 {
            return false;
        }
        self.set_entry(pt, l1, 0);
        invalidate_tlb(virt);
        true
    }

    /// Translate to a physical address, or zero when unmapped at any level.
    pub fn translate(&self, virt: VirtualAddress) -> PhysicalAddress {
        let Some((pt, l1)) = self.leaf_table(virt) else {
            return PhysicalAddress::new(0);
        };
        let entry = self.entry(pt, l1);
        if entry & PteFlags::PRESENT.bits() == 0 {
            return PhysicalAddress::new(0);
        }
        PhysicalAddress::new((entry & ENTRY_ADDR_MASK) | virt.page_offset())
    }

    /// Leaf flags for `virt`, if mapped.
    pub fn flags_of(&self, virt: VirtualAddress) -> Option<PteFlags> {
        let (pt, l1) = self.leaf_table(virt)?;
        let entry = self.entry(pt, l1);
        if entry & PteFlags::PRESENT.bits() == 0 {
            return None;
        }
        Some(PteFlags::from_bits_truncate(entry))
    }

    /// Free every user-half data page and table node. Used by exit/execve.
    pub fn free_user_half(&mut self, pmm: &mut FrameAllocator) {
        for l4 in 0..ENTRIES / 2 {
            let e4 = self.entry(self.root, l4);
            if e4 & PteFlags::PRESENT.bits() == 0 {
                continue;
            }
            let pdpt = PhysicalAddress::new(e4 & ENTRY_ADDR_MASK);
            for l3 in 0..ENTRIES {
                let e3 = self.entry(pdpt, l3);
                if e3 & PteFlags::PRESENT.bits() == 0 {
                    continue;
                }
                let pd = PhysicalAddress::new(e3 & ENTRY_ADDR_MASK);
                for l2 in 0..ENTRIES {
                    let e2 = self.entry(pd, l2);
                    if e2 & PteFlags::PRESENT.bits() == 0 {
                        continue;
                    }
                    let pt = PhysicalAddress::new(e2 & ENTRY_ADDR_MASK);
                    for l1 in 0..ENTRIES {
                        let e1 = self.entry(pt, l1);
                        if e1 & PteFlags::PRESENT.bits() != 0 {
                            pmm.free_frame(PhysicalAddress::new(e1 & ENTRY_ADDR_MASK));
                        }
                    }
                    pmm.free_frame(pt);
                }
                pmm.free_frame(pd);
            }
            pmm.free_frame(pdpt);
            self.set_entry(self.root, l4, 0);
        }
    }

    /// Visit every present user-half leaf as `(virt, phys, flags)`.
    pub fn for_each_user_page<F: FnMut(VirtualAddress, PhysicalAddress, PteFlags)>(
        &self,
        mut f: F,
    ) {
        for l4 in 0..ENTRIES / 2 {
            let e4 = self.entry(self.root, l4);
            if e4 & PteFlags::PRESENT.bits() == 0 {
                continue;
            }
            let pdpt = PhysicalAddress::new(e4 & ENTRY_ADDR_MASK);
            for l3 in 0..ENTRIES {
                let e3 = self.entry(pdpt, l3);
                if e3 & PteFlags::PRESENT.bits() == 0 {
                    continue;
                }
                let pd = PhysicalAddress::new(e3 & ENTRY_ADDR_MASK);
                for l2 in 0..ENTRIES {
                    let e2 = self.entry(pd, l2);
                    if e2 & PteFlags::PRESENT.bits() == 0 {
                        continue;
                    }
                    let pt = PhysicalAddress::new(e2 & ENTRY_ADDR_MASK);
                    for l1 in 0..ENTRIES {
                        let e1 = self.entry(pt, l1);
                        if e1 & PteFlags::PRESENT.bits() == 0 {
                            continue;
                        }
                        let virt = ((l4 as u64) << 39)
                            | ((l3 as u64) << 30)
                            | ((l2 as u64) << 21)
                            | ((l1 as u64) << 12);
                        f(
                            VirtualAddress::new(virt),
                            PhysicalAddress::new(e1 & ENTRY_ADDR_MASK),
                            PteFlags::from_bits_truncate(e1),
                        );
                    }
                }
            }
        }
    }

    /// Eagerly copy this space's user half into a new address space that
    /// shares the kernel half: fresh frames, same contents, same flags.
    /// Used by fork (no copy-on-write in this core).
    pub fn duplicate_user(&self, pmm: &mut FrameAllocator) -> Result<AddressSpace> {
        let mut child = self.new_user(pmm)?;
        let mut failure = None;
        self.for_each_user_page(|virt, phys, flags| {
            if failure.is_some() {
                return;
            }
            let copy = match pmm.alloc_frame() {
                Ok(frame) => frame,
                Err(e) => {
                    failure = Some(e);
                    return;
                }
            };
            // SAFETY: both frames are direct-mapped and page-sized; the
            // source belongs to this space, the target was just allocated.
            unsafe {
                core::ptr::copy_nonoverlapping(
                    self.dmap.ptr_of(phys),
                    self.dmap.ptr_of(copy),
                    super::PAGE_SIZE,
                );
            }
            if let Err(e) = child.map_page(pmm, virt, copy, flags & !PteFlags::PRESENT) {
                failure = Some(e);
            }
        });
        if let Some(e) = failure {
            child.free_user_half(pmm);
            pmm.free_frame(child.root);
            return Err(e);
        }
        Ok(child)
    }

    /// Map each table node reachable from the root at its direct-map alias,
    /// so the walker can keep editing the tables after this space goes live.
    fn self_map_nodes(&mut self, pmm: &mut FrameAllocator) -> Result<()> {
        self.map_node(pmm, self.root)?;
        for l4 in 0..ENTRIES {
            let e4 = self.entry(self.root, l4);
            if e4 & PteFlags::PRESENT.bits() == 0 {
                continue;
            }
            let pdpt = PhysicalAddress::new(e4 & ENTRY_ADDR_MASK);
            self.map_node(pmm, pdpt)?;
            for l3 in 0..ENTRIES {
                let e3 = self.entry(pdpt, l3);
                if e3 & PteFlags::PRESENT.bits() == 0 || e3 & PteFlags::HUGE.bits() != 0 {
                    continue;
                }
                let pd = PhysicalAddress::new(e3 & ENTRY_ADDR_MASK);
                self.map_node(pmm, pd)?;
                for l2 in 0..ENTRIES {
                    let e2 = self.entry(pd, l2);
                    if e2 & PteFlags::PRESENT.bits() == 0 || e2 & PteFlags::HUGE.bits() != 0 {
                        continue;
                    }
                    self.map_node(pmm, PhysicalAddress::new(e2 & ENTRY_ADDR_MASK))?;
                }
            }
        }
        Ok(())
    }

    fn map_node(&mut self, pmm: &mut FrameAllocator, node: PhysicalAddress) -> Result<()> {
        let alias = self.dmap.virt_of(node);
        match self.map_page(pmm, alias, node, PteFlags::WRITABLE) {
            // The alias already sits under a bootstrap huge mapping, which
            // is just as good for editing the node.
            Err(crate::error::KernelError::InvalidArgument) => Ok(()),
            other => other,
        }
    }
}

#[inline]
fn invalidate_tlb(virt: VirtualAddress) {
    #[cfg(target_os = "none")]
    x86_64::instructions::tlb::flush(x86_64::VirtAddr::new(virt.as_u64()));
    #[cfg(not(target_os = "none"))]
    let _ = virt;
}

/// Build the kernel address space from the bootstrap tables.
///
/// Copies the bootloader-provided PML4, identity-maps the first 1 MiB,
/// remaps the kernel image at its reported virtual base, then installs
/// direct-map aliases for every table node so the live tables stay editable.
pub fn build_kernel_space(
    pmm: &mut FrameAllocator,
    bootstrap_root: PhysicalAddress,
    kernel_virt_base: u64,
    kernel_phys_base: u64,
) -> Result<AddressSpace> {
    let dmap = pmm.direct_map();
    let mut space = AddressSpace::new(pmm)?;

    let src = AddressSpace::from_root(bootstrap_root, dmap);
    for i in 0..ENTRIES {
        let entry = src.entry(bootstrap_root, i);
        space.set_entry(space.root, i, entry);
    }

    for addr in (0..IDENTITY_MAP_SIZE).step_by(PAGE_SIZE) {
        space.map_page(
            pmm,
            VirtualAddress::new(addr),
            PhysicalAddress::new(addr),
            PteFlags::WRITABLE,
        )?;
    }

    for offset in (0..KERNEL_IMAGE_SIZE).step_by(PAGE_SIZE) {
        space.map_page(
            pmm,
            VirtualAddress::new(kernel_virt_base + offset),
            PhysicalAddress::new(kernel_phys_base + offset),
            PteFlags::WRITABLE,
        )?;
    }

    space.self_map_nodes(pmm)?;
    Ok(space)
}

/// Load the translation root into CR3.
#[cfg(target_os = "none")]
pub fn switch_address_space(root: PhysicalAddress) {
    use x86_64::registers::control::{Cr3, Cr3Flags};
    use x86_64::structures::paging::PhysFrame;

    // SAFETY: the root comes from an AddressSpace whose kernel half mirrors
    // the currently active one, so kernel code and stacks stay mapped across
    // the switch.
    unsafe {
        Cr3::write(
            PhysFrame::containing_address(x86_64::PhysAddr::new(root.as_u64())),
            Cr3Flags::empty(),
        );
    }
}

/// Physical address of the active translation root.
#[cfg(target_os = "none")]
pub fn current_root() -> PhysicalAddress {
    let (frame, _) = x86_64::registers::control::Cr3::read();
    PhysicalAddress::new(frame.start_address().as_u64())
}

static KERNEL_SPACE: Once<Mutex<AddressSpace>> = Once::new();

/// Publish the kernel address space built at boot.
pub fn set_kernel_space(space: AddressSpace) {
    KERNEL_SPACE.call_once(|| Mutex::new(space));
}

/// The kernel address space. Panics before `set_kernel_space` — a boot-order
/// bug.
pub fn kernel_space() -> &'static Mutex<AddressSpace> {
    KERNEL_SPACE
        .get()
        .expect("vmm used before kernel space init")
}

#[cfg(all(test, not(target_os = "none")))]
mod tests {
    use super::*;
    use crate::mm::testmem::TestArena;

    fn setup(size: usize) -> (TestArena, FrameAllocator, AddressSpace) {
        let arena = TestArena::new(size);
        let mut map = arena.memory_map();
        let mut pmm = FrameAllocator::new(arena.direct_map(), &mut map).unwrap();
        let space = AddressSpace::new(&mut pmm).unwrap();
        (arena, pmm, space)
    }

    #[test]
    fn map_then_translate() {
        let (_arena, mut pmm, mut space) = setup(32 * 1024 * 1024);
        let frame = pmm.alloc_frame().unwrap();
        let virt = VirtualAddress::new(0x4000_0000);

        space
            .map_page(&mut pmm, virt, frame, PteFlags::WRITABLE | PteFlags::USER)
            .unwrap();
        assert_eq!(space.translate(virt), frame);
        assert_eq!(
            space.translate(VirtualAddress::new(0x4000_0123)).as_u64(),
            frame.as_u64() + 0x123
        );

        let flags = space.flags_of(virt).unwrap();
        assert!(flags.contains(PteFlags::USER));
        assert!(!flags.contains(PteFlags::HUGE));
    }

    #[test]
    fn unmap_round_trip() {
        let (_arena, mut pmm, mut space) = setup(32 * 1024 * 1024);
        let frame = pmm.alloc_frame().unwrap();
        let virt = VirtualAddress::new(0x7000_1000);

        space
            .map_page(&mut pmm, virt, frame, PteFlags::WRITABLE)
            .unwrap();
        assert!(space.unmap_page(virt));
        assert_eq!(space.translate(virt).as_u64(), 0);
        // Second unmap reports no mapping.
        assert!(!space.unmap_page(virt));
    }

    #[test]
    fn translate_unmapped_is_zero() {
        let (_arena, _pmm, space) = setup(16 * 1024 * 1024);
        assert_eq!(space.translate(VirtualAddress::new(0)).as_u64(), 0);
        assert_eq!(
            space.translate(VirtualAddress::new(0xdead_b000)).as_u64(),
            0
        );
    }

    #[test]
    fn remap_overwrites_silently() {
        // Documented behaviour: mapping over a present leaf replaces it.
        let (_arena, mut pmm, mut space) = setup(32 * 1024 * 1024);
        let first = pmm.alloc_frame().unwrap();
        let second = pmm.alloc_frame().unwrap();
        let virt = VirtualAddress::new(0x5000_0000);

        space.map_page(&mut pmm, virt, first, PteFlags::WRITABLE).unwrap();
        space.map_page(&mut pmm, virt, second, PteFlags::WRITABLE).unwrap();
        assert_eq!(space.translate(virt), second);
    }

    #[test]
    fn kernel_space_build_identity_maps_low_meg() {
        let arena = TestArena::new(64 * 1024 * 1024);
        let mut map = arena.memory_map();
        let mut pmm = FrameAllocator::new(arena.direct_map(), &mut map).unwrap();

        // Fake bootstrap root: an empty PML4 stands in for the bootloader's.
        let bootstrap = AddressSpace::new(&mut pmm).unwrap();
        let space = build_kernel_space(
            &mut pmm,
            bootstrap.root(),
            0xFFFF_FFFF_8000_0000,
            0x20_0000,
        )
        .unwrap();

        for addr in (0..IDENTITY_MAP_SIZE).step_by(PAGE_SIZE) {
            assert_eq!(
                space.translate(VirtualAddress::new(addr)).as_u64(),
                addr,
                "identity map missing at {:#x}",
                addr
            );
        }

        // Table nodes are reachable through their direct-map alias.
        let root_alias = pmm.direct_map().virt_of(space.root());
        assert_eq!(space.translate(root_alias), space.root());
    }

    #[test]
    fn duplicate_user_copies_pages_eagerly() {
        let (_arena, mut pmm, mut space) = setup(32 * 1024 * 1024);
        let frame = pmm.alloc_frame().unwrap();
        let virt = VirtualAddress::new(0x40_0000);
        space
            .map_page(&mut pmm, virt, frame, PteFlags::WRITABLE | PteFlags::USER)
            .unwrap();
        // SAFETY: frame is direct-mapped into the arena.
        unsafe {
            core::ptr::write_bytes(pmm.direct_map().ptr_of(frame), 0x42, 64);
        }

        let child = space.duplicate_user(&mut pmm).unwrap();
        let child_phys = child.translate(virt);
        assert_ne!(child_phys.as_u64(), 0);
        assert_ne!(child_phys, frame, "the copy has its own frame");
        // SAFETY: child_phys is direct-mapped into the arena.
        unsafe {
            let p = pmm.direct_map().ptr_of(child_phys);
            assert_eq!(*p, 0x42);
            // Writes to the child do not leak into the parent.
            *p = 0x17;
            assert_eq!(*pmm.direct_map().ptr_of(frame), 0x42);
        }
        assert!(child.flags_of(virt).unwrap().contains(PteFlags::USER));
    }

    #[test]
    fn user_half_teardown_returns_frames() {
        let (_arena, mut pmm, mut space) = setup(32 * 1024 * 1024);
        let before = pmm.stats().free_frames;
        let frame = pmm.alloc_frame().unwrap();
        space
            .map_page(
                &mut pmm,
                VirtualAddress::new(0x1000_0000),
                frame,
                PteFlags::WRITABLE | PteFlags::USER,
            )
            .unwrap();
        space.free_user_half(&mut pmm);
        assert_eq!(pmm.stats().free_frames, before);
    }
}
