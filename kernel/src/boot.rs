//! Limine boot protocol: requests and the captured handoff.

use crate::graphics::fbcon::FramebufferInfo;
use crate::mm::MemoryRegion;

/// Upper bound on memory-map entries we keep; firmware maps are far smaller.
pub const MAX_MEMORY_REGIONS: usize = 64;

/// Everything the kernel consumes from the bootloader, copied out of the
/// response structures before bootloader-reclaimable memory is recycled.
pub struct BootInfo {
    pub hhdm_offset: u64,
    pub regions: [MemoryRegion; MAX_MEMORY_REGIONS],
    pub region_count: usize,
    pub kernel_virt_base: u64,
    pub kernel_phys_base: u64,
    /// Physical address of the ACPI RSDP, when the firmware provides one.
    pub rsdp: Option<u64>,
    pub framebuffer: Option<FramebufferInfo>,
}

impl BootInfo {
    pub fn memory_map(&mut self) -> &mut [MemoryRegion] {
        &mut self.regions[..self.region_count]
    }
}

#[cfg(target_os = "none")]
mod requests {
    use limine::request::{
        ExecutableAddressRequest, FramebufferRequest, HhdmRequest, MemoryMapRequest,
        RequestsEndMarker, RequestsStartMarker, RsdpRequest,
    };
    use limine::BaseRevision;

    #[used]
    #[link_section = ".requests_start_marker"]
    pub static START_MARKER: RequestsStartMarker = RequestsStartMarker::new();

    #[used]
    #[link_section = ".requests"]
    pub static BASE_REVISION: BaseRevision = BaseRevision::new();

    #[used]
    #[link_section = ".requests"]
    pub static MEMORY_MAP: MemoryMapRequest = MemoryMapRequest::new();

    #[used]
    #[link_section = ".requests"]
    pub static HHDM: HhdmRequest = HhdmRequest::new();

    #[used]
    #[link_section = ".requests"]
    pub static EXECUTABLE_ADDRESS: ExecutableAddressRequest = ExecutableAddressRequest::new();

    #[used]
    #[link_section = ".requests"]
    pub static FRAMEBUFFER: FramebufferRequest = FramebufferRequest::new();

    #[used]
    #[link_section = ".requests"]
    pub static RSDP: RsdpRequest = RsdpRequest::new();

    #[used]
    #[link_section = ".requests_end_marker"]
    pub static END_MARKER: RequestsEndMarker = RequestsEndMarker::new();
}

/// True when the booting Limine speaks a protocol revision we support.
#[cfg(target_os = "none")]
pub fn revision_supported() -> bool {
    requests::BASE_REVISION.is_supported()
}

/// Copy the bootloader responses into a [`BootInfo`]. Returns `None` when
/// the mandatory responses (memory map, HHDM, executable address) are
/// missing.
#[cfg(target_os = "none")]
pub fn capture() -> Option<BootInfo> {
    use limine::memory_map::EntryType;

    let mmap = requests::MEMORY_MAP.get_response()?;
    let hhdm_offset = requests::HHDM.get_response()?.offset();
    let kernel_addr = requests::EXECUTABLE_ADDRESS.get_response()?;

    let mut regions = [MemoryRegion {
        base: 0,
        length: 0,
        usable: false,
    }; MAX_MEMORY_REGIONS];
    let mut region_count = 0;
    for entry in mmap.entries().iter() {
        if region_count == MAX_MEMORY_REGIONS {
            break;
        }
        regions[region_count] = MemoryRegion {
            base: entry.base,
            length: entry.length,
            usable: entry.entry_type == EntryType::USABLE,
        };
        region_count += 1;
    }

    let rsdp = requests::RSDP.get_response().map(|r| {
        let addr = r.address() as u64;
        // Older protocol revisions hand out the HHDM alias; normalise to
        // the physical address.
        if addr >= hhdm_offset {
            addr - hhdm_offset
        } else {
            addr
        }
    });

    let framebuffer = requests::FRAMEBUFFER
        .get_response()
        .and_then(|r| r.framebuffers().next())
        .map(|fb| FramebufferInfo {
            addr: fb.addr(),
            width: fb.width() as usize,
            height: fb.height() as usize,
            pitch: fb.pitch() as usize,
            bytes_per_pixel: (fb.bpp() / 8) as usize,
            format: if fb.red_mask_shift() == 0 {
                crate::graphics::fbcon::PixelFormat::Rgb
            } else {
                crate::graphics::fbcon::PixelFormat::Bgr
            },
        });

    Some(BootInfo {
        hhdm_offset,
        regions,
        region_count,
        kernel_virt_base: kernel_addr.virtual_base(),
        kernel_phys_base: kernel_addr.physical_base(),
        rsdp,
        framebuffer,
    })
}
