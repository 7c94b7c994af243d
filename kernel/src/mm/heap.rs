//! Kernel heap: a doubly-linked list of header-prefixed blocks.
//!
//! Every block starts with a [`BlockHeader`] carrying a magic word, flags and
//! neighbour links; `size` includes the header. The heap grows lazily in
//! page-sized chunks mapped just past the current tail block. Adjacent free
//! blocks are coalesced on free, so a fully-freed heap collapses back to a
//! single block.

use core::alloc::{GlobalAlloc, Layout};

use spin::Mutex;

use super::{pages_for, vmm::PteFlags, VirtualAddress, PAGE_SIZE};
use crate::error::{KernelError, Result};

/// Magic word stamped into every block header.
pub const HEAP_MAGIC: u32 = 0x1BAD_B002;

bitflags::bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    struct BlockFlags: u16 {
        const FREE = 1 << 0;
        const LAST = 1 << 1;
    }
}

#[repr(C)]
struct BlockHeader {
    magic: u32,
    flags: u16,
    _reserved: u16,
    /// Block size in bytes, including this header.
    size: usize,
    prev: *mut BlockHeader,
    next: *mut BlockHeader,
}

const HEADER_SIZE: usize = core::mem::size_of::<BlockHeader>();

/// Smallest block worth carving off in a split: a header plus one aligned
/// payload word.
const MIN_BLOCK_SIZE: usize = HEADER_SIZE + 8;

const _: () = assert!(HEADER_SIZE % 8 == 0);

impl BlockHeader {
    fn is_free(&self) -> bool {
        BlockFlags::from_bits_truncate(self.flags).contains(BlockFlags::FREE)
    }

    fn is_last(&self) -> bool {
        BlockFlags::from_bits_truncate(self.flags).contains(BlockFlags::LAST)
    }

    fn set_flag(&mut self, flag: BlockFlags, on: bool) {
        let mut flags = BlockFlags::from_bits_truncate(self.flags);
        flags.set(flag, on);
        self.flags = flags.bits();
    }

    fn payload(&mut self) -> *mut u8 {
        // SAFETY: payload starts immediately after the header within the
        // same block allocation.
        unsafe { (self as *mut BlockHeader as *mut u8).add(HEADER_SIZE) }
    }
}

/// Heap statistics
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct HeapStats {
    pub total_bytes: usize,
    pub used_bytes: usize,
    pub free_bytes: usize,
    pub total_blocks: usize,
    pub free_blocks: usize,
}

/// The block list. Owns no memory itself; it is laid over regions handed to
/// `init`/`extend`.
pub struct ListHeap {
    head: *mut BlockHeader,
    /// One past the end of the managed region; `extend` must continue here.
    end: *mut u8,
    stats: HeapStats,
}

// SAFETY: the raw block pointers target regions exclusively owned by this
// heap; the global wrapper serialises access behind a spinlock.
unsafe impl Send for ListHeap {}

impl ListHeap {
    pub const fn empty() -> Self {
        Self {
            head: core::ptr::null_mut(),
            end: core::ptr::null_mut(),
            stats: HeapStats {
                total_bytes: 0,
                used_bytes: 0,
                free_bytes: 0,
                total_blocks: 0,
                free_blocks: 0,
            },
        }
    }

    /// Lay the heap over its first region.
    ///
    /// # Safety
    ///
    /// `region` must point to `len` bytes of writable memory owned by the
    /// heap from now on, with `len >= MIN_BLOCK_SIZE`.
    pub unsafe fn init(&mut self, region: *mut u8, len: usize) {
        let block = region as *mut BlockHeader;
        // SAFETY: caller guarantees the region is writable and large enough.
        unsafe {
            (*block).magic = HEAP_MAGIC;
            (*block).flags = (BlockFlags::FREE | BlockFlags::LAST).bits();
            (*block)._reserved = 0;
            (*block).size = len;
            (*block).prev = core::ptr::null_mut();
            (*block).next = core::ptr::null_mut();
        }
        self.head = block;
        self.end = unsafe { region.add(len) };
        self.stats = HeapStats {
            total_bytes: len,
            used_bytes: 0,
            free_bytes: len,
            total_blocks: 1,
            free_blocks: 1,
        };
    }

    /// Append a region contiguous with the current end as a new free block
    /// and coalesce it with a free tail.
    ///
    /// # Safety
    ///
    /// `region` must equal the address `init`/`extend` left off at and point
    /// to `len` writable bytes.
    pub unsafe fn extend(&mut self, region: *mut u8, len: usize) {
        debug_assert_eq!(region, self.end);

        let mut last = self.head;
        // SAFETY: the list is well-formed; LAST terminates the walk.
        unsafe {
            while !(*last).is_last() {
                last = (*last).next;
            }

            let block = region as *mut BlockHeader;
            (*block).magic = HEAP_MAGIC;
            (*block).flags = (BlockFlags::FREE | BlockFlags::LAST).bits();
            (*block)._reserved = 0;
            (*block).size = len;
            (*block).prev = last;
            (*block).next = core::ptr::null_mut();

            (*last).set_flag(BlockFlags::LAST, false);
            (*last).next = block;

            self.end = region.add(len);
            self.stats.total_bytes += len;
            self.stats.free_bytes += len;
            self.stats.total_blocks += 1;
            self.stats.free_blocks += 1;

            // Keep the coalescing invariant if the old tail was free.
            if (*last).is_free() {
                self.merge_forward(last);
            }
        }
    }

    fn find_free(&self, size: usize) -> *mut BlockHeader {
        let mut current = self.head;
        while !current.is_null() {
            // SAFETY: list links only ever point at valid headers.
            unsafe {
                if (*current).is_free() && (*current).size >= size + HEADER_SIZE {
                    return current;
                }
                if (*current).is_last() {
                    break;
                }
                current = (*current).next;
            }
        }
        core::ptr::null_mut()
    }

    /// Carve the tail of `block` into a new free block when the remainder is
    /// worth keeping.
    unsafe fn split(&mut self, block: *mut BlockHeader, size: usize) {
        // SAFETY: `block` is a live header; arithmetic stays inside its
        // region because `remaining` is derived from its recorded size.
        unsafe {
            let total = (*block).size;
            if total < size + HEADER_SIZE {
                return;
            }
            let remaining = total - size - HEADER_SIZE;
            if remaining < MIN_BLOCK_SIZE {
                return;
            }

            let new_block =
                (block as *mut u8).add(size + HEADER_SIZE) as *mut BlockHeader;
            (*new_block).magic = HEAP_MAGIC;
            (*new_block).flags = BlockFlags::FREE.bits();
            (*new_block)._reserved = 0;
            (*new_block).size = remaining;
            if (*block).is_last() {
                (*new_block).set_flag(BlockFlags::LAST, true);
            }
            (*new_block).next = (*block).next;
            (*new_block).prev = block;

            if !(*block).next.is_null() {
                (*(*block).next).prev = new_block;
            }
            (*block).next = new_block;
            (*block).size = size + HEADER_SIZE;
            (*block).set_flag(BlockFlags::LAST, false);

            self.stats.total_blocks += 1;
            self.stats.free_blocks += 1;
            if !(*block).is_free() {
                // Bytes moved from the allocated block into the free pool.
                self.stats.used_bytes -= remaining;
                self.stats.free_bytes += remaining;
            }
        }
    }

    /// Absorb every free successor of `block`.
    unsafe fn merge_forward(&mut self, block: *mut BlockHeader) {
        // SAFETY: neighbours are valid headers; absorbing updates links in
        // lockstep so reciprocity is preserved.
        unsafe {
            while !(*block).next.is_null() && (*(*block).next).is_free() {
                let next = (*block).next;
                let absorbed = (*next).size;
                (*block).size += absorbed;
                if (*next).is_last() {
                    (*block).set_flag(BlockFlags::LAST, true);
                }
                (*block).next = (*next).next;
                if !(*next).next.is_null() {
                    (*(*next).next).prev = block;
                }
                self.stats.total_blocks -= 1;
                self.stats.free_blocks -= 1;
                if !(*block).is_free() {
                    // A used block grew into the free pool (realloc path).
                    self.stats.used_bytes += absorbed;
                    self.stats.free_bytes -= absorbed;
                }
            }
        }
    }

    /// Allocate `size` bytes, 8-byte aligned. Returns null when no block
    /// fits (the caller may grow and retry) or when `size == 0`.
    pub fn allocate(&mut self, size: usize) -> *mut u8 {
        if size == 0 {
            return core::ptr::null_mut();
        }
        let size = (size + 7) & !7;

        let block = self.find_free(size);
        if block.is_null() {
            return core::ptr::null_mut();
        }

        // SAFETY: `block` came from the list walk above.
        unsafe {
            self.split(block, size);
            (*block).set_flag(BlockFlags::FREE, false);
            self.stats.used_bytes += (*block).size;
            self.stats.free_bytes -= (*block).size;
            self.stats.free_blocks -= 1;
            (*block).payload()
        }
    }

    /// Return `ptr` to the free pool and coalesce with both neighbours.
    ///
    /// # Safety
    ///
    /// `ptr` must be a payload pointer previously returned by `allocate` or
    /// `reallocate` on this heap and not freed since.
    pub unsafe fn free(&mut self, ptr: *mut u8) {
        if ptr.is_null() {
            return;
        }
        // SAFETY: the header precedes the payload by construction; magic is
        // verified before anything is trusted.
        unsafe {
            let block = ptr.sub(HEADER_SIZE) as *mut BlockHeader;
            if (*block).magic != HEAP_MAGIC {
                return;
            }
            if (*block).is_free() {
                return;
            }

            (*block).set_flag(BlockFlags::FREE, true);
            self.stats.used_bytes -= (*block).size;
            self.stats.free_bytes += (*block).size;
            self.stats.free_blocks += 1;

            self.merge_forward(block);
            let prev = (*block).prev;
            if !prev.is_null() && (*prev).is_free() {
                self.merge_forward(prev);
            }
        }
    }

    /// Resize an allocation, in place when possible.
    ///
    /// # Safety
    ///
    /// As for `free`; on success the old pointer must no longer be used.
    pub unsafe fn reallocate(&mut self, ptr: *mut u8, size: usize) -> *mut u8 {
        if ptr.is_null() {
            return self.allocate(size);
        }
        if size == 0 {
            // SAFETY: forwarded caller contract.
            unsafe { self.free(ptr) };
            return core::ptr::null_mut();
        }

        // SAFETY: header location and magic check as in `free`.
        unsafe {
            let block = ptr.sub(HEADER_SIZE) as *mut BlockHeader;
            if (*block).magic != HEAP_MAGIC {
                return core::ptr::null_mut();
            }

            let size = (size + 7) & !7;
            let old_payload = (*block).size - HEADER_SIZE;

            if size <= old_payload {
                self.split(block, size);
                return ptr;
            }

            // Grow into a free successor when the combined span suffices.
            let next = (*block).next;
            if !next.is_null()
                && (*next).is_free()
                && (*block).size + (*next).size >= size + HEADER_SIZE
            {
                self.merge_forward(block);
                self.split(block, size);
                return ptr;
            }

            let new_ptr = self.allocate(size);
            if new_ptr.is_null() {
                return core::ptr::null_mut();
            }
            core::ptr::copy_nonoverlapping(ptr, new_ptr, old_payload);
            self.free(ptr);
            new_ptr
        }
    }

    pub fn stats(&self) -> HeapStats {
        self.stats
    }

    /// Walk the list and verify magic words, link reciprocity and counter
    /// agreement.
    pub fn check(&self) -> bool {
        let mut total_bytes = 0usize;
        let mut used_bytes = 0usize;
        let mut free_bytes = 0usize;
        let mut total_blocks = 0usize;
        let mut free_blocks = 0usize;

        let mut current = self.head;
        while !current.is_null() {
            // SAFETY: links are only followed after the magic check.
            unsafe {
                if (*current).magic != HEAP_MAGIC {
                    return false;
                }
                let next = (*current).next;
                if !next.is_null() && (*next).prev != current {
                    return false;
                }
                let prev = (*current).prev;
                if !prev.is_null() && (*prev).next != current {
                    return false;
                }

                total_bytes += (*current).size;
                total_blocks += 1;
                if (*current).is_free() {
                    free_bytes += (*current).size;
                    free_blocks += 1;
                } else {
                    used_bytes += (*current).size;
                }

                if (*current).is_last() {
                    break;
                }
                current = next;
            }
        }

        total_bytes == self.stats.total_bytes
            && used_bytes == self.stats.used_bytes
            && free_bytes == self.stats.free_bytes
            && total_blocks == self.stats.total_blocks
            && free_blocks == self.stats.free_blocks
    }
}

/// Virtual base of the kernel heap region.
pub const KERNEL_HEAP_BASE: u64 = 0xFFFF_A000_0000_0000;

/// Pages mapped when the heap first comes up.
const INITIAL_HEAP_PAGES: u64 = 4;

struct KernelHeapInner {
    list: ListHeap,
    /// Next unmapped page in the heap's virtual window.
    next_page: u64,
    ready: bool,
}

/// The global kernel heap: the block list plus its page-growth policy.
pub struct KernelHeap {
    inner: Mutex<KernelHeapInner>,
}

impl KernelHeap {
    pub const fn new() -> Self {
        Self {
            inner: Mutex::new(KernelHeapInner {
                list: ListHeap::empty(),
                next_page: KERNEL_HEAP_BASE,
                ready: false,
            }),
        }
    }

    /// Map the initial pages and lay the block list over them.
    pub fn init(&self) -> Result<()> {
        let mut inner = self.inner.lock();
        if inner.ready {
            return Ok(());
        }
        let start = inner.next_page;
        map_heap_pages(start, INITIAL_HEAP_PAGES)?;
        inner.next_page += INITIAL_HEAP_PAGES * PAGE_SIZE as u64;
        // SAFETY: the pages were just mapped writable and belong to the heap.
        unsafe {
            inner
                .list
                .init(start as *mut u8, (INITIAL_HEAP_PAGES * PAGE_SIZE as u64) as usize);
        }
        inner.ready = true;
        Ok(())
    }

    fn grow(&self, inner: &mut KernelHeapInner, min_bytes: usize) -> Result<()> {
        let pages = pages_for((min_bytes + HEADER_SIZE) as u64).max(1);
        let start = inner.next_page;
        map_heap_pages(start, pages)?;
        inner.next_page += pages * PAGE_SIZE as u64;
        // SAFETY: freshly mapped, contiguous with the previous heap end.
        unsafe {
            inner
                .list
                .extend(start as *mut u8, (pages * PAGE_SIZE as u64) as usize);
        }
        Ok(())
    }

    fn allocate(&self, size: usize) -> *mut u8 {
        let mut inner = self.inner.lock();
        if !inner.ready {
            return core::ptr::null_mut();
        }
        let ptr = inner.list.allocate(size);
        if !ptr.is_null() {
            return ptr;
        }
        if self.grow(&mut inner, size).is_err() {
            return core::ptr::null_mut();
        }
        inner.list.allocate(size)
    }

    pub fn stats(&self) -> HeapStats {
        self.inner.lock().list.stats()
    }

    pub fn check(&self) -> bool {
        self.inner.lock().list.check()
    }
}

impl Default for KernelHeap {
    fn default() -> Self {
        Self::new()
    }
}

/// Allocate frames and map them at `start` for the heap.
fn map_heap_pages(start: u64, pages: u64) -> Result<()> {
    let mut space = super::vmm::kernel_space().lock();
    let mut pmm = super::pmm::get().lock();
    for i in 0..pages {
        let frame = pmm.alloc_frame()?;
        space.map_page(
            &mut pmm,
            VirtualAddress::new(start + i * PAGE_SIZE as u64),
            frame,
            PteFlags::WRITABLE,
        )?;
    }
    Ok(())
}

// The block list guarantees 8-byte alignment only. For stricter layouts the
// allocation is padded and the raw payload pointer is stashed just below the
// aligned address so dealloc can find the real block.
unsafe impl GlobalAlloc for KernelHeap {
    unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
        if layout.align() <= 8 {
            return self.allocate(layout.size());
        }
        let padded = layout.size() + layout.align() + core::mem::size_of::<usize>();
        let raw = self.allocate(padded);
        if raw.is_null() {
            return raw;
        }
        let base = raw as usize + core::mem::size_of::<usize>();
        let aligned = (base + layout.align() - 1) & !(layout.align() - 1);
        // SAFETY: `aligned - 8` lies within the padded allocation.
        unsafe {
            *((aligned - core::mem::size_of::<usize>()) as *mut usize) = raw as usize;
        }
        aligned as *mut u8
    }

    unsafe fn dealloc(&self, ptr: *mut u8, layout: Layout) {
        if ptr.is_null() {
            return;
        }
        let raw = if layout.align() <= 8 {
            ptr
        } else {
            // SAFETY: written by `alloc` for over-aligned layouts.
            unsafe { *((ptr as usize - core::mem::size_of::<usize>()) as *const usize) as *mut u8 }
        };
        let mut inner = self.inner.lock();
        // SAFETY: `raw` is the payload pointer handed out by `allocate`.
        unsafe { inner.list.free(raw) };
    }

    unsafe fn realloc(&self, ptr: *mut u8, layout: Layout, new_size: usize) -> *mut u8 {
        if layout.align() <= 8 {
            let mut inner = self.inner.lock();
            // SAFETY: `ptr` came from this allocator per GlobalAlloc contract.
            let moved = unsafe { inner.list.reallocate(ptr, new_size) };
            if !moved.is_null() {
                return moved;
            }
            drop(inner);
            // Fall back to grow-and-copy through alloc.
        }
        // SAFETY: default strategy per the GlobalAlloc docs.
        unsafe {
            let new_layout = Layout::from_size_align_unchecked(new_size, layout.align());
            let new_ptr = self.alloc(new_layout);
            if !new_ptr.is_null() {
                core::ptr::copy_nonoverlapping(ptr, new_ptr, layout.size().min(new_size));
                self.dealloc(ptr, layout);
            }
            new_ptr
        }
    }
}

#[cfg(all(test, not(target_os = "none")))]
mod tests {
    extern crate std;
    use std::vec;

    use super::*;

    struct HeapFixture {
        _backing: std::vec::Vec<u8>,
        heap: ListHeap,
    }

    fn fixture(len: usize) -> HeapFixture {
        let mut backing = vec![0u8; len + 16];
        // 8-align the region start.
        let base = backing.as_mut_ptr();
        let aligned = ((base as usize + 7) & !7) as *mut u8;
        let mut heap = ListHeap::empty();
        unsafe { heap.init(aligned, len) };
        HeapFixture {
            _backing: backing,
            heap,
        }
    }

    #[test]
    fn header_magic_precedes_every_allocation() {
        let mut fx = fixture(64 * 1024);
        let ptr = fx.heap.allocate(100);
        assert!(!ptr.is_null());
        unsafe {
            let header = ptr.sub(HEADER_SIZE) as *const BlockHeader;
            assert_eq!((*header).magic, HEAP_MAGIC);
            // Size covers request rounded up to 8 plus the header.
            assert!((*header).size >= 104 + HEADER_SIZE);
        }
        assert!(fx.heap.check());
    }

    #[test]
    fn alloc_zero_is_a_sentinel_failure() {
        let mut fx = fixture(4096);
        assert!(fx.heap.allocate(0).is_null());
    }

    #[test]
    fn free_restores_single_block() {
        let mut fx = fixture(64 * 1024);
        let before = fx.heap.stats();
        let ptr = fx.heap.allocate(1000);
        unsafe { fx.heap.free(ptr) };
        let after = fx.heap.stats();
        assert_eq!(before, after);
        assert_eq!(after.free_blocks, 1);
        assert!(fx.heap.check());
    }

    #[test]
    fn oversized_allocation_fails() {
        let mut fx = fixture(8 * 1024);
        assert!(fx.heap.allocate(64 * 1024).is_null());
        assert!(fx.heap.check());
    }

    #[test]
    fn coalescing_merges_both_neighbours() {
        let mut fx = fixture(64 * 1024);
        let a = fx.heap.allocate(256);
        let b = fx.heap.allocate(256);
        let c = fx.heap.allocate(256);
        assert!(!a.is_null() && !b.is_null() && !c.is_null());

        unsafe {
            fx.heap.free(a);
            fx.heap.free(c);
            // Freeing the middle block must fuse all three with the tail.
            fx.heap.free(b);
        }
        let stats = fx.heap.stats();
        assert_eq!(stats.used_bytes, 0);
        assert_eq!(stats.free_blocks, 1);
        assert!(fx.heap.check());
    }

    #[test]
    fn realloc_shrinks_in_place() {
        let mut fx = fixture(64 * 1024);
        let ptr = fx.heap.allocate(4096);
        let shrunk = unsafe { fx.heap.reallocate(ptr, 128) };
        assert_eq!(ptr, shrunk);
        assert!(fx.heap.check());
    }

    #[test]
    fn realloc_grows_into_free_neighbour() {
        let mut fx = fixture(64 * 1024);
        let ptr = fx.heap.allocate(128);
        unsafe {
            core::ptr::write_bytes(ptr, 0xAB, 128);
        }
        let grown = unsafe { fx.heap.reallocate(ptr, 4096) };
        assert_eq!(ptr, grown, "tail block was free, growth is in place");
        unsafe {
            for i in 0..128 {
                assert_eq!(*grown.add(i), 0xAB);
            }
        }
        assert!(fx.heap.check());
    }

    #[test]
    fn realloc_moves_and_preserves_data() {
        let mut fx = fixture(64 * 1024);
        let a = fx.heap.allocate(64);
        let _fence = fx.heap.allocate(64);
        unsafe {
            core::ptr::write_bytes(a, 0x5A, 64);
            let moved = fx.heap.reallocate(a, 1024);
            assert_ne!(moved, a);
            for i in 0..64 {
                assert_eq!(*moved.add(i), 0x5A);
            }
        }
        assert!(fx.heap.check());
    }

    #[test]
    fn extend_appends_and_coalesces() {
        let len = 16 * 1024;
        let mut backing = vec![0u8; 2 * len + 16];
        let base = backing.as_mut_ptr();
        let aligned = ((base as usize + 7) & !7) as *mut u8;
        let mut heap = ListHeap::empty();
        unsafe {
            heap.init(aligned, len);
            heap.extend(aligned.add(len), len);
        }
        let stats = heap.stats();
        assert_eq!(stats.total_bytes, 2 * len);
        assert_eq!(stats.free_blocks, 1, "free tail merged with extension");
        assert!(heap.check());
    }

    #[test]
    fn stress_alternating_alloc_free_fully_coalesces() {
        let mut fx = fixture(1024 * 1024);

        // Deterministic xorshift so the run is reproducible.
        let mut state: u64 = 0x9E3779B97F4A7C15;
        let mut next = || {
            state ^= state << 13;
            state ^= state >> 7;
            state ^= state << 17;
            (state % 4089 + 8) as usize // sizes in [8, 4096]
        };

        for round in 0..10_000 {
            let size = next();
            let ptr = fx.heap.allocate(size);
            assert!(!ptr.is_null(), "round {} size {}", round, size);
            unsafe { fx.heap.free(ptr) };
        }

        let stats = fx.heap.stats();
        assert_eq!(stats.used_bytes, 0);
        assert_eq!(stats.free_blocks, 1);
        assert!(fx.heap.check());
    }
}
