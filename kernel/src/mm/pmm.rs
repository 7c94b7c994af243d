//! Physical frame allocator.
//!
//! A bitmap covers frames up to a 4 GiB ceiling; a set bit means the frame is
//! in use. The bitmap itself is carved out of the first usable region large
//! enough to hold it, before that region is marked free. Single-frame
//! allocation skips the first bitmap word so the lowest 64 frames stay
//! untouched for legacy hardware.

use spin::{Mutex, Once};

use super::{DirectMap, MemoryRegion, PhysicalAddress, PAGE_SIZE};
use crate::error::{KernelError, Result};

/// Highest physical address tracked by the bitmap (4 GiB).
const MAX_TRACKED_MEMORY: u64 = 4 * 1024 * 1024 * 1024;

const BITS_PER_WORD: u64 = 64;

/// Frame allocator statistics
#[derive(Debug, Clone, Copy)]
pub struct PmmStats {
    pub total_frames: u64,
    pub free_frames: u64,
}

pub struct FrameAllocator {
    /// Bitmap words, living in direct-mapped physical memory.
    bitmap: *mut u64,
    /// Number of words in the bitmap.
    words: u64,
    /// Number of frames tracked.
    total_frames: u64,
    free_frames: u64,
    dmap: DirectMap,
}

// SAFETY: the raw bitmap pointer targets memory owned exclusively by this
// allocator for its whole lifetime; access is serialised by the global lock.
unsafe impl Send for FrameAllocator {}

impl FrameAllocator {
    /// Build the allocator from the boot memory map.
    ///
    /// Mutates the chosen region's base/length so the bitmap's own frames are
    /// never handed out.
    pub fn new(dmap: DirectMap, regions: &mut [MemoryRegion]) -> Result<Self> {
        let total_frames = MAX_TRACKED_MEMORY / PAGE_SIZE as u64;
        let words = total_frames.div_ceil(BITS_PER_WORD);
        let bitmap_bytes = words * 8;

        // Place the bitmap in the first usable region that can hold it.
        let mut bitmap: *mut u64 = core::ptr::null_mut();
        for region in regions.iter_mut() {
            if !region.usable || region.length < bitmap_bytes {
                continue;
            }
            bitmap = dmap.ptr_of(PhysicalAddress::new(region.base)) as *mut u64;
            region.base += bitmap_bytes;
            region.length -= bitmap_bytes;
            break;
        }
        if bitmap.is_null() {
            return Err(KernelError::OutOfMemory);
        }

        // All frames start in-use; usable regions clear their bits below.
        // SAFETY: `bitmap` points at `words` u64s inside the region reserved
        // above, which no longer belongs to any usable range.
        unsafe {
            core::ptr::write_bytes(bitmap, 0xFF, words as usize);
        }

        let mut pmm = Self {
            bitmap,
            words,
            total_frames,
            free_frames: 0,
            dmap,
        };

        for region in regions.iter() {
            if !region.usable {
                continue;
            }
            let start = region.base.div_ceil(PAGE_SIZE as u64);
            let end = (region.base + region.length) / PAGE_SIZE as u64;
            for frame in start..end.min(pmm.total_frames) {
                if pmm.test(frame) {
                    pmm.clear(frame);
                    pmm.free_frames += 1;
                }
            }
        }

        Ok(pmm)
    }

    #[inline]
    fn set(&mut self, frame: u64) {
        // SAFETY: frame < total_frames is checked by all callers, so the
        // word index stays inside the bitmap.
        unsafe {
            let word = self.bitmap.add((frame / BITS_PER_WORD) as usize);
            *word |= 1u64 << (frame % BITS_PER_WORD);
        }
    }

    #[inline]
    fn clear(&mut self, frame: u64) {
        // SAFETY: as in `set`.
        unsafe {
            let word = self.bitmap.add((frame / BITS_PER_WORD) as usize);
            *word &= !(1u64 << (frame % BITS_PER_WORD));
        }
    }

    #[inline]
    fn test(&self, frame: u64) -> bool {
        // SAFETY: as in `set`.
        unsafe {
            let word = self.bitmap.add((frame / BITS_PER_WORD) as usize);
            (*word & (1u64 << (frame % BITS_PER_WORD))) != 0
        }
    }

    /// Whether the frame containing `addr` is currently free.
    pub fn is_free(&self, addr: PhysicalAddress) -> bool {
        let frame = addr.frame();
        frame < self.total_frames && !self.test(frame)
    }

    /// Allocate a single frame.
    ///
    /// Scans from the second bitmap word up, so the first 64 frames are only
    /// reachable through `alloc_frames` callers that explicitly need them.
    pub fn alloc_frame(&mut self) -> Result<PhysicalAddress> {
        if self.free_frames == 0 {
            return Err(KernelError::OutOfMemory);
        }

        for idx in 1..self.words {
            // SAFETY: idx < self.words.
            let word = unsafe { *self.bitmap.add(idx as usize) };
            if word == u64::MAX {
                continue;
            }
            let bit = (!word).trailing_zeros() as u64;
            let frame = idx * BITS_PER_WORD + bit;
            if frame >= self.total_frames {
                return Err(KernelError::OutOfMemory);
            }
            self.set(frame);
            self.free_frames -= 1;
            return Ok(PhysicalAddress::new(frame * PAGE_SIZE as u64));
        }

        Err(KernelError::OutOfMemory)
    }

    /// Allocate `count` physically consecutive frames.
    ///
    /// Fails without mutating any state when no run of `count` free frames
    /// exists.
    pub fn alloc_frames(&mut self, count: u64) -> Result<PhysicalAddress> {
        if count == 0 {
            return Err(KernelError::InvalidArgument);
        }
        if count > self.free_frames {
            return Err(KernelError::OutOfMemory);
        }
        if count == 1 {
            return self.alloc_frame();
        }

        let mut run_start = 0u64;
        let mut run_len = 0u64;
        for frame in BITS_PER_WORD..self.total_frames {
            if self.test(frame) {
                run_len = 0;
                continue;
            }
            if run_len == 0 {
                run_start = frame;
            }
            run_len += 1;
            if run_len == count {
                for f in run_start..run_start + count {
                    self.set(f);
                }
                self.free_frames -= count;
                return Ok(PhysicalAddress::new(run_start * PAGE_SIZE as u64));
            }
        }

        Err(KernelError::OutOfMemory)
    }

    /// Free a single frame. Out-of-range or already-free frames are ignored
    /// so freeing stays idempotent on panic/teardown paths.
    pub fn free_frame(&mut self, addr: PhysicalAddress) {
        let frame = addr.frame();
        if frame >= self.total_frames {
            return;
        }
        if self.test(frame) {
            self.clear(frame);
            self.free_frames += 1;
        }
    }

    /// Free `count` frames starting at `addr`.
    pub fn free_frames(&mut self, addr: PhysicalAddress, count: u64) {
        let start = addr.frame();
        for i in 0..count {
            let frame = start + i;
            if frame >= self.total_frames {
                break;
            }
            self.free_frame(PhysicalAddress::new(frame * PAGE_SIZE as u64));
        }
    }

    /// Zero a frame through the direct map.
    pub fn zero_frame(&self, addr: PhysicalAddress) {
        // SAFETY: the direct map aliases every tracked physical frame; the
        // caller owns `addr` by virtue of having allocated it.
        unsafe {
            core::ptr::write_bytes(self.dmap.ptr_of(addr), 0, PAGE_SIZE);
        }
    }

    pub fn direct_map(&self) -> DirectMap {
        self.dmap
    }

    pub fn stats(&self) -> PmmStats {
        PmmStats {
            total_frames: self.total_frames,
            free_frames: self.free_frames,
        }
    }
}

static FRAME_ALLOCATOR: Once<Mutex<FrameAllocator>> = Once::new();

/// Initialise the global frame allocator from the boot memory map.
pub fn init(dmap: DirectMap, regions: &mut [MemoryRegion]) -> Result<()> {
    let pmm = FrameAllocator::new(dmap, regions)?;
    log::info!(
        "pmm: {} frames tracked, {} free",
        pmm.stats().total_frames,
        pmm.stats().free_frames
    );
    FRAME_ALLOCATOR.call_once(|| Mutex::new(pmm));
    Ok(())
}

/// The global allocator. Panics if used before `init` — a boot-order bug.
pub fn get() -> &'static Mutex<FrameAllocator> {
    FRAME_ALLOCATOR
        .get()
        .expect("pmm used before pmm::init")
}

#[cfg(all(test, not(target_os = "none")))]
mod tests {
    use super::*;
    use crate::mm::testmem::TestArena;

    fn arena_pmm(size: usize) -> (TestArena, FrameAllocator) {
        let arena = TestArena::new(size);
        let mut map = arena.memory_map();
        let pmm = FrameAllocator::new(arena.direct_map(), &mut map).unwrap();
        (arena, pmm)
    }

    #[test]
    fn free_counter_matches_bitmap() {
        let (_arena, mut pmm) = arena_pmm(16 * 1024 * 1024);
        let before = pmm.stats().free_frames;

        let a = pmm.alloc_frame().unwrap();
        let b = pmm.alloc_frame().unwrap();
        assert_ne!(a, b);
        assert!(!pmm.is_free(a));
        assert!(!pmm.is_free(b));
        assert_eq!(pmm.stats().free_frames, before - 2);

        pmm.free_frame(a);
        assert!(pmm.is_free(a));
        assert_eq!(pmm.stats().free_frames, before - 1);
    }

    #[test]
    fn double_free_is_idempotent() {
        let (_arena, mut pmm) = arena_pmm(16 * 1024 * 1024);
        let a = pmm.alloc_frame().unwrap();
        let before = pmm.stats().free_frames;
        pmm.free_frame(a);
        pmm.free_frame(a);
        pmm.free_frame(PhysicalAddress::new(MAX_TRACKED_MEMORY + 0x1000));
        assert_eq!(pmm.stats().free_frames, before + 1);
    }

    #[test]
    fn contiguous_allocation_is_contiguous() {
        let (_arena, mut pmm) = arena_pmm(16 * 1024 * 1024);
        let run = pmm.alloc_frames(8).unwrap();
        for i in 0..8 {
            assert!(!pmm.is_free(PhysicalAddress::new(
                run.as_u64() + i * PAGE_SIZE as u64
            )));
        }
        pmm.free_frames(run, 8);
        for i in 0..8 {
            assert!(pmm.is_free(PhysicalAddress::new(
                run.as_u64() + i * PAGE_SIZE as u64
            )));
        }
    }

    #[test]
    fn exhaustion_fails_without_mutation() {
        let (_arena, mut pmm) = arena_pmm(8 * 1024 * 1024);
        let stats = pmm.stats();
        let too_many = stats.free_frames + 1;
        assert_eq!(
            pmm.alloc_frames(too_many),
            Err(KernelError::OutOfMemory)
        );
        assert_eq!(pmm.stats().free_frames, stats.free_frames);
    }

    #[test]
    fn low_frames_are_preserved() {
        let (_arena, mut pmm) = arena_pmm(16 * 1024 * 1024);
        let a = pmm.alloc_frame().unwrap();
        // First 64 frames are skipped by the single-frame path.
        assert!(a.frame() >= 64);
    }
}
