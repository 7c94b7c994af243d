//! ELF64 program loading.
//!
//! Only what execve needs from the loader collaborator: header validation
//! and PT_LOAD segment placement through the VMM. Relocation and dynamic
//! linking stay outside the core.

use crate::error::{KernelError, Result};
use crate::mm::{
    pmm::FrameAllocator,
    vmm::{AddressSpace, PteFlags},
    PhysicalAddress, VirtualAddress, PAGE_SIZE,
};

const ELF_MAGIC: [u8; 4] = [0x7F, b'E', b'L', b'F'];
const ELF_CLASS_64: u8 = 2;
const ELF_DATA_LE: u8 = 1;
const ELF_MACHINE_X86_64: u16 = 0x3E;
const ET_EXEC: u16 = 2;

const PT_LOAD: u32 = 1;
const PF_X: u32 = 1;
const PF_W: u32 = 2;

/// Result of placing an executable into an address space.
#[derive(Debug, Clone, Copy)]
pub struct LoadedImage {
    /// Entry point virtual address.
    pub entry: u64,
    /// One past the highest mapped byte; the initial program break.
    pub brk: u64,
}

fn le16(bytes: &[u8], off: usize) -> u16 {
    u16::from_le_bytes([bytes[off], bytes[off + 1]])
}

fn le32(bytes: &[u8], off: usize) -> u32 {
    u32::from_le_bytes([bytes[off], bytes[off + 1], bytes[off + 2], bytes[off + 3]])
}

fn le64(bytes: &[u8], off: usize) -> u64 {
    let mut b = [0u8; 8];
    b.copy_from_slice(&bytes[off..off + 8]);
    u64::from_le_bytes(b)
}

/// Map every PT_LOAD segment of `image` into `space` with user permissions
/// derived from the segment flags, copying file bytes and zeroing the BSS
/// tail.
pub fn load(
    image: &[u8],
    space: &mut AddressSpace,
    pmm: &mut FrameAllocator,
) -> Result<LoadedImage> {
    if image.len() < 64 || image[0..4] != ELF_MAGIC {
        return Err(KernelError::InvalidExecutable);
    }
    if image[4] != ELF_CLASS_64 || image[5] != ELF_DATA_LE {
        return Err(KernelError::InvalidExecutable);
    }
    if le16(image, 16) != ET_EXEC || le16(image, 18) != ELF_MACHINE_X86_64 {
        return Err(KernelError::InvalidExecutable);
    }

    let entry = le64(image, 24);
    let phoff = le64(image, 32) as usize;
    let phentsize = le16(image, 54) as usize;
    let phnum = le16(image, 56) as usize;
    if phentsize < 56 || phoff + phnum * phentsize > image.len() {
        return Err(KernelError::InvalidExecutable);
    }

    let dmap = pmm.direct_map();
    let mut brk = 0u64;

    for i in 0..phnum {
        let ph = &image[phoff + i * phentsize..phoff + (i + 1) * phentsize];
        if le32(ph, 0) != PT_LOAD {
            continue;
        }
        let flags = le32(ph, 4);
        let offset = le64(ph, 8) as usize;
        let vaddr = le64(ph, 16);
        let filesz = le64(ph, 32) as usize;
        let memsz = le64(ph, 40) as usize;
        if memsz == 0 {
            continue;
        }
        if offset + filesz > image.len() || filesz > memsz {
            return Err(KernelError::InvalidExecutable);
        }

        let mut pte_flags = PteFlags::USER;
        if flags & PF_W != 0 {
            pte_flags |= PteFlags::WRITABLE;
        }
        if flags & PF_X == 0 {
            pte_flags |= PteFlags::NO_EXECUTE;
        }

        let first_page = vaddr & !(PAGE_SIZE as u64 - 1);
        let last = vaddr + memsz as u64;
        let mut page = first_page;
        while page < last {
            let virt = VirtualAddress::new(page);
            if space.translate(virt).as_u64() == 0 {
                let frame = pmm.alloc_frame()?;
                pmm.zero_frame(frame);
                space.map_page(pmm, virt, frame, pte_flags)?;
            }
            page += PAGE_SIZE as u64;
        }

        // Copy file-backed bytes through the direct map, page by page.
        let mut copied = 0usize;
        while copied < filesz {
            let dst_virt = vaddr + copied as u64;
            let page_off = (dst_virt & (PAGE_SIZE as u64 - 1)) as usize;
            let chunk = (PAGE_SIZE - page_off).min(filesz - copied);
            let phys = space.translate(VirtualAddress::new(dst_virt));
            debug_assert_ne!(phys.as_u64(), 0);
            // SAFETY: the page was mapped above; the chunk stays inside it.
            unsafe {
                core::ptr::copy_nonoverlapping(
                    image.as_ptr().add(offset + copied),
                    dmap.ptr_of(PhysicalAddress::new(phys.as_u64())),
                    chunk,
                );
            }
            copied += chunk;
        }

        brk = brk.max(last);
    }

    if brk == 0 {
        return Err(KernelError::InvalidExecutable);
    }
    Ok(LoadedImage { entry, brk })
}

#[cfg(all(test, not(target_os = "none")))]
mod tests {
    extern crate std;
    use std::vec;
    use std::vec::Vec;

    use super::*;
    use crate::mm::testmem::TestArena;

    /// A minimal ELF64 executable: one PT_LOAD at 0x400000 with code bytes
    /// and a BSS tail.
    fn tiny_elf(code: &[u8], memsz_extra: usize) -> Vec<u8> {
        let mut image = vec![0u8; 0x1000 + code.len()];
        image[0..4].copy_from_slice(&ELF_MAGIC);
        image[4] = ELF_CLASS_64;
        image[5] = ELF_DATA_LE;
        image[6] = 1; // version
        image[16..18].copy_from_slice(&ET_EXEC.to_le_bytes());
        image[18..20].copy_from_slice(&ELF_MACHINE_X86_64.to_le_bytes());
        image[24..32].copy_from_slice(&0x40_0000u64.to_le_bytes()); // entry
        image[32..40].copy_from_slice(&64u64.to_le_bytes()); // phoff
        image[54..56].copy_from_slice(&56u16.to_le_bytes()); // phentsize
        image[56..58].copy_from_slice(&1u16.to_le_bytes()); // phnum

        let ph = 64;
        image[ph..ph + 4].copy_from_slice(&PT_LOAD.to_le_bytes());
        image[ph + 4..ph + 8].copy_from_slice(&(PF_X | PF_W).to_le_bytes());
        image[ph + 8..ph + 16].copy_from_slice(&0x1000u64.to_le_bytes()); // offset
        image[ph + 16..ph + 24].copy_from_slice(&0x40_0000u64.to_le_bytes()); // vaddr
        image[ph + 32..ph + 40].copy_from_slice(&(code.len() as u64).to_le_bytes()); // filesz
        image[ph + 40..ph + 48]
            .copy_from_slice(&((code.len() + memsz_extra) as u64).to_le_bytes()); // memsz

        image[0x1000..0x1000 + code.len()].copy_from_slice(code);
        image
    }

    #[test]
    fn loads_pt_load_segment() {
        let arena = TestArena::new(32 * 1024 * 1024);
        let mut map = arena.memory_map();
        let mut pmm = FrameAllocator::new(arena.direct_map(), &mut map).unwrap();
        let mut space = AddressSpace::new(&mut pmm).unwrap();

        let code = [0x90u8, 0x90, 0xC3]; // nop; nop; ret
        let image = tiny_elf(&code, 0x2000);
        let loaded = load(&image, &mut space, &mut pmm).unwrap();
        assert_eq!(loaded.entry, 0x40_0000);
        assert_eq!(loaded.brk, 0x40_0000 + 3 + 0x2000);

        let phys = space.translate(VirtualAddress::new(0x40_0000));
        assert_ne!(phys.as_u64(), 0);
        // SAFETY: the frame is arena-backed.
        unsafe {
            let p = arena.direct_map().ptr_of(phys);
            assert_eq!(*p, 0x90);
            assert_eq!(*p.add(2), 0xC3);
            // BSS tail is zeroed.
            assert_eq!(*p.add(3), 0);
        }
        let flags = space
            .flags_of(VirtualAddress::new(0x40_0000))
            .unwrap();
        assert!(flags.contains(PteFlags::USER));
        assert!(flags.contains(PteFlags::WRITABLE));
    }

    #[test]
    fn rejects_foreign_binaries() {
        let arena = TestArena::new(16 * 1024 * 1024);
        let mut map = arena.memory_map();
        let mut pmm = FrameAllocator::new(arena.direct_map(), &mut map).unwrap();
        let mut space = AddressSpace::new(&mut pmm).unwrap();

        assert!(load(b"#!/bin/sh\n", &mut space, &mut pmm).is_err());

        let mut bad = tiny_elf(&[0xC3], 0);
        bad[18] = 0x28; // EM_ARM
        assert!(load(&bad, &mut space, &mut pmm).is_err());
    }
}
