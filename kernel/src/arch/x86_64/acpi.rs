//! ACPI table discovery: RSDP -> XSDT/RSDT -> MADT and MCFG.
//!
//! Tables are read through the direct map, so the parser runs unchanged
//! against firmware memory on the machine and against fabricated tables in
//! host tests. Every signature and checksum is validated before a table is
//! trusted.

use alloc::vec::Vec;

use crate::error::{KernelError, Result};
use crate::mm::{DirectMap, PhysicalAddress};

/// Everything the interrupt controllers and PCIe need from firmware.
#[derive(Debug, Clone)]
pub struct AcpiInfo {
    /// Local APIC MMIO base (possibly overridden by a type-5 MADT entry).
    pub lapic_address: u64,
    /// APIC IDs of every enabled processor.
    pub lapic_ids: Vec<u8>,
    /// Discovered I/O APICs.
    pub io_apics: Vec<IoApicInfo>,
    /// PCIe enhanced configuration space base from MCFG, when present.
    pub pcie_config_base: Option<u64>,
}

#[derive(Debug, Clone, Copy)]
pub struct IoApicInfo {
    pub id: u8,
    pub address: u64,
    pub gsi_base: u32,
}

const RSDP_SIGNATURE: &[u8; 8] = b"RSD PTR ";

fn le32(bytes: &[u8], off: usize) -> u32 {
    u32::from_le_bytes([bytes[off], bytes[off + 1], bytes[off + 2], bytes[off + 3]])
}

fn le64(bytes: &[u8], off: usize) -> u64 {
    let mut b = [0u8; 8];
    b.copy_from_slice(&bytes[off..off + 8]);
    u64::from_le_bytes(b)
}

fn checksum_ok(bytes: &[u8]) -> bool {
    bytes.iter().fold(0u8, |acc, b| acc.wrapping_add(*b)) == 0
}

/// Borrow `len` bytes of physical memory through the direct map.
fn phys_bytes<'a>(dmap: DirectMap, phys: u64, len: usize) -> &'a [u8] {
    // SAFETY: the direct map aliases all physical memory handed to the
    // kernel; firmware tables are static for the kernel's lifetime.
    unsafe { core::slice::from_raw_parts(dmap.ptr_of(PhysicalAddress::new(phys)), len) }
}

/// A validated System Description Table.
struct Sdt<'a> {
    signature: [u8; 4],
    bytes: &'a [u8],
}

fn load_sdt<'a>(dmap: DirectMap, phys: u64) -> Result<Sdt<'a>> {
    let header = phys_bytes(dmap, phys, 36);
    let length = le32(header, 4) as usize;
    if length < 36 {
        return Err(KernelError::InvalidArgument);
    }
    let bytes = phys_bytes(dmap, phys, length);
    if !checksum_ok(bytes) {
        return Err(KernelError::InvalidArgument);
    }
    let mut signature = [0u8; 4];
    signature.copy_from_slice(&bytes[0..4]);
    Ok(Sdt { signature, bytes })
}

/// Walk firmware tables starting from the RSDP.
pub fn parse(dmap: DirectMap, rsdp_phys: PhysicalAddress) -> Result<AcpiInfo> {
    let rsdp = phys_bytes(dmap, rsdp_phys.as_u64(), 36);
    if &rsdp[0..8] != RSDP_SIGNATURE {
        return Err(KernelError::InvalidArgument);
    }
    if !checksum_ok(&rsdp[0..20]) {
        return Err(KernelError::InvalidArgument);
    }

    let revision = rsdp[15];
    let use_xsdt = if revision >= 2 {
        let length = le32(rsdp, 20) as usize;
        let full = phys_bytes(dmap, rsdp_phys.as_u64(), length.max(36));
        if !checksum_ok(&full[0..length.min(full.len())]) {
            return Err(KernelError::InvalidArgument);
        }
        le64(rsdp, 24) != 0
    } else {
        false
    };

    let mut info = AcpiInfo {
        lapic_address: 0,
        lapic_ids: Vec::new(),
        io_apics: Vec::new(),
        pcie_config_base: None,
    };

    let mut table_addrs: Vec<u64> = Vec::new();
    if use_xsdt {
        let xsdt = load_sdt(dmap, le64(rsdp, 24))?;
        if &xsdt.signature != b"XSDT" {
            return Err(KernelError::InvalidArgument);
        }
        let entries = (xsdt.bytes.len() - 36) / 8;
        for i in 0..entries {
            table_addrs.push(le64(xsdt.bytes, 36 + i * 8));
        }
    } else {
        let rsdt = load_sdt(dmap, le32(rsdp, 16) as u64)?;
        if &rsdt.signature != b"RSDT" {
            return Err(KernelError::InvalidArgument);
        }
        let entries = (rsdt.bytes.len() - 36) / 4;
        for i in 0..entries {
            table_addrs.push(le32(rsdt.bytes, 36 + i * 4) as u64);
        }
    }

    for addr in table_addrs {
        let Ok(table) = load_sdt(dmap, addr) else {
            continue;
        };
        match &table.signature {
            b"APIC" => parse_madt(table.bytes, &mut info),
            b"MCFG" => parse_mcfg(table.bytes, &mut info),
            _ => {}
        }
    }

    if info.lapic_address == 0 {
        return Err(KernelError::NotFound);
    }
    Ok(info)
}

/// Multiple APIC Description Table: local/IO APIC inventory.
fn parse_madt(bytes: &[u8], info: &mut AcpiInfo) {
    info.lapic_address = le32(bytes, 36) as u64;

    let mut off = 44;
    while off + 2 <= bytes.len() {
        let entry_type = bytes[off];
        let entry_len = bytes[off + 1] as usize;
        if entry_len < 2 || off + entry_len > bytes.len() {
            break;
        }
        match entry_type {
            // Processor Local APIC
            0 if entry_len >= 8 => {
                let apic_id = bytes[off + 3];
                let flags = le32(bytes, off + 4);
                if flags & 1 != 0 {
                    info.lapic_ids.push(apic_id);
                }
            }
            // I/O APIC
            1 if entry_len >= 12 => {
                info.io_apics.push(IoApicInfo {
                    id: bytes[off + 2],
                    address: le32(bytes, off + 4) as u64,
                    gsi_base: le32(bytes, off + 8),
                });
            }
            // Local APIC address override
            5 if entry_len >= 12 => {
                info.lapic_address = le64(bytes, off + 4);
            }
            _ => {}
        }
        off += entry_len;
    }
}

/// Memory-mapped configuration table: PCIe config-space base.
fn parse_mcfg(bytes: &[u8], info: &mut AcpiInfo) {
    // 36-byte header plus 8 reserved bytes, then 16-byte entries.
    let mut off = 44;
    while off + 16 <= bytes.len() {
        let base = le64(bytes, off);
        if info.pcie_config_base.is_none() {
            info.pcie_config_base = Some(base);
        }
        off += 16;
    }
}

#[cfg(all(test, not(target_os = "none")))]
mod tests {
    extern crate std;

    use super::*;
    use crate::mm::testmem::TestArena;

    fn stamp_checksum(buf: &mut [u8], checksum_at: usize) {
        buf[checksum_at] = 0;
        let sum = buf.iter().fold(0u8, |acc, b| acc.wrapping_add(*b));
        buf[checksum_at] = 0u8.wrapping_sub(sum);
    }

    fn sdt(signature: &[u8; 4], payload: &[u8]) -> std::vec::Vec<u8> {
        let mut table = std::vec::Vec::new();
        table.extend_from_slice(signature);
        table.extend_from_slice(&((36 + payload.len()) as u32).to_le_bytes());
        table.push(1); // revision
        table.push(0); // checksum, fixed below
        table.extend_from_slice(b"FERIT ");
        table.extend_from_slice(b"FERRITE ");
        table.extend_from_slice(&1u32.to_le_bytes());
        table.extend_from_slice(b"TEST");
        table.extend_from_slice(&1u32.to_le_bytes());
        table.extend_from_slice(payload);
        stamp_checksum(&mut table, 9);
        table
    }

    /// Build RSDP + XSDT + MADT + MCFG inside the arena, return RSDP phys.
    fn build_tables(arena: &TestArena) -> PhysicalAddress {
        let dmap = arena.direct_map();

        // MADT payload: lapic addr, flags, then one lapic + one ioapic entry.
        let mut madt = std::vec::Vec::new();
        madt.extend_from_slice(&0xFEE0_0000u32.to_le_bytes());
        madt.extend_from_slice(&1u32.to_le_bytes());
        madt.extend_from_slice(&[0, 8, 0, 7]); // type 0, len 8, proc 0, apic id 7
        madt.extend_from_slice(&1u32.to_le_bytes()); // enabled
        madt.extend_from_slice(&[1, 12, 2, 0]); // type 1, len 12, id 2
        madt.extend_from_slice(&0xFEC0_0000u32.to_le_bytes());
        madt.extend_from_slice(&0u32.to_le_bytes()); // gsi base
        let madt = sdt(b"APIC", &madt);

        let mut mcfg = std::vec::Vec::new();
        mcfg.extend_from_slice(&0u64.to_le_bytes()); // reserved
        mcfg.extend_from_slice(&0xB000_0000u64.to_le_bytes());
        mcfg.extend_from_slice(&0u16.to_le_bytes());
        mcfg.push(0);
        mcfg.push(255);
        mcfg.extend_from_slice(&0u32.to_le_bytes());
        let mcfg = sdt(b"MCFG", &mcfg);

        let madt_phys = 0x200000u64;
        let mcfg_phys = 0x201000u64;
        let xsdt_phys = 0x202000u64;
        let rsdp_phys = 0x203000u64;

        let mut xsdt_payload = std::vec::Vec::new();
        xsdt_payload.extend_from_slice(&madt_phys.to_le_bytes());
        xsdt_payload.extend_from_slice(&mcfg_phys.to_le_bytes());
        let xsdt = sdt(b"XSDT", &xsdt_payload);

        let mut rsdp = std::vec::Vec::new();
        rsdp.extend_from_slice(RSDP_SIGNATURE);
        rsdp.push(0); // checksum, fixed below
        rsdp.extend_from_slice(b"FERIT ");
        rsdp.push(2); // revision
        rsdp.extend_from_slice(&0u32.to_le_bytes()); // rsdt (unused)
        rsdp.extend_from_slice(&36u32.to_le_bytes()); // length
        rsdp.extend_from_slice(&xsdt_phys.to_le_bytes());
        rsdp.push(0); // extended checksum
        rsdp.extend_from_slice(&[0, 0, 0]);
        stamp_checksum(&mut rsdp[..20], 8);
        stamp_checksum(&mut rsdp, 32);

        for (phys, bytes) in [
            (madt_phys, &madt),
            (mcfg_phys, &mcfg),
            (xsdt_phys, &xsdt),
            (rsdp_phys, &rsdp),
        ] {
            unsafe {
                core::ptr::copy_nonoverlapping(
                    bytes.as_ptr(),
                    dmap.ptr_of(PhysicalAddress::new(phys)),
                    bytes.len(),
                );
            }
        }

        PhysicalAddress::new(rsdp_phys)
    }

    #[test]
    fn parses_madt_and_mcfg_via_xsdt() {
        let arena = TestArena::new(8 * 1024 * 1024);
        let rsdp = build_tables(&arena);

        let info = parse(arena.direct_map(), rsdp).unwrap();
        assert_eq!(info.lapic_address, 0xFEE0_0000);
        assert_eq!(info.lapic_ids, std::vec![7]);
        assert_eq!(info.io_apics.len(), 1);
        assert_eq!(info.io_apics[0].address, 0xFEC0_0000);
        assert_eq!(info.io_apics[0].id, 2);
        assert_eq!(info.pcie_config_base, Some(0xB000_0000));
    }

    #[test]
    fn rejects_bad_rsdp_checksum() {
        let arena = TestArena::new(8 * 1024 * 1024);
        let rsdp = build_tables(&arena);
        // Corrupt one signature byte after the checksum was computed.
        unsafe {
            *arena.direct_map().ptr_of(PhysicalAddress::new(rsdp.as_u64() + 9)) ^= 0xFF;
        }
        assert!(parse(arena.direct_map(), rsdp).is_err());
    }
}
