// Dotlanth
// Copyright (C) 2025 Synerthink

// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU Affero General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.

// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
// GNU Affero General Public License for more details.

// You should have received a copy of the GNU Affero General Public License
// along with this program.  If not, see <http://www.gnu.org/licenses/>.

use std::{
    alloc::{GlobalAlloc, Layout},
    mem,
    ptr::{self, NonNull},
    sync::Mutex,
};

use log::{debug, info, trace};

use crate::{
    block::{ALLOC_ALIGNMENT, BlockHeader, BlockList, HEADER_SIZE, MIN_PAYLOAD},
    config::{AllocationStrategy, AllocatorConfig},
    error::AllocatorError,
    region::{HeapExtent, Protection, protect_range},
    stats::AllocatorStats,
    util::{align_to, get_page_size, is_power_of_two},
};

/// Description of one block for diagnostic memory maps
#[derive(Debug, Clone)]
pub struct BlockInfo {
    pub address: usize,         // Base address of the block header
    pub size: usize,            // Total bytes spanned, header included
    pub is_free: bool,          // Which list the block is on
    pub protection: Protection, // Recorded access rights
}

/// Heap allocator over anonymous memory mappings
///
/// All bookkeeping lives behind a single mutex: the free and used lists,
/// the mapped extents and the statistics counters. Every public operation
/// acquires the guard on entry, so concurrent callers observe a total
/// order of mutations. The relocating path of [`reallocate`] is the one
/// place the guard is dropped and re-taken, to avoid self-deadlock when
/// it re-enters `allocate`/`free`.
///
/// [`reallocate`]: Allocator::reallocate
pub struct Allocator {
    inner: Mutex<AllocatorInner>,
}

struct AllocatorInner {
    strategy: AllocationStrategy,
    page_size: usize,
    extents: Vec<HeapExtent>, // Every mapping acquired from the OS, unmapped on drop
    free_list: BlockList,
    used_list: BlockList,
    stats: AllocatorStats,
}

// Raw block pointers are only reachable through the mutex
unsafe impl Send for AllocatorInner {}

impl Allocator {
    /// Creates an allocator backed by a fresh anonymous mapping
    ///
    /// The initial heap size is rounded up to the page size. A page size
    /// of 0 in the configuration selects the platform page size; an
    /// explicit page size must be a power of two.
    ///
    /// # Errors
    /// * `InvalidAlignment` - configured page size is not a power of two
    /// * `MappingFailed` - the OS refused the initial mapping
    pub fn new(config: AllocatorConfig) -> Result<Self, AllocatorError> {
        let page_size = if config.page_size == 0 { get_page_size() } else { config.page_size };
        if !is_power_of_two(page_size) {
            return Err(AllocatorError::InvalidAlignment);
        }

        let extent = HeapExtent::map_anonymous(config.initial_heap_size, page_size)?;

        // The whole mapping starts out as one free block
        let initial = unsafe { BlockHeader::initialize(extent.as_ptr(), extent.len(), Protection::READ | Protection::WRITE) };

        let mut free_list = BlockList::new();
        free_list.push_front(initial);

        let stats = AllocatorStats {
            total_memory: extent.len(),
            free_memory: extent.len(),
            overhead: HEADER_SIZE,
            ..Default::default()
        };

        info!("heap initialized: {} bytes at {:#x}, strategy {:?}", extent.len(), extent.base(), config.allocation_strategy);

        Ok(Self {
            inner: Mutex::new(AllocatorInner {
                strategy: config.allocation_strategy,
                page_size,
                extents: vec![extent],
                free_list,
                used_list: BlockList::new(),
                stats,
            }),
        })
    }

    /// Allocates `size` bytes and returns the payload pointer
    ///
    /// The payload is at least `size` bytes long and aligned to
    /// [`ALLOC_ALIGNMENT`]. The heap grows by at least the requested
    /// amount when no free block fits.
    ///
    /// # Errors
    /// * `InvalidSize` - `size` is zero
    /// * `OutOfMemory` - no block fits and the OS refused a new mapping
    pub fn allocate(&self, size: usize) -> Result<NonNull<u8>, AllocatorError> {
        if size == 0 {
            return Err(AllocatorError::InvalidSize);
        }

        let total = align_to(HEADER_SIZE + size, ALLOC_ALIGNMENT);
        let mut inner = self.inner.lock().unwrap();
        let block = inner.allocate_block(total)?;
        Ok(BlockHeader::payload(block))
    }

    /// Allocates `size` bytes whose payload pointer is a multiple of `align`
    ///
    /// Over-allocates by `align` plus one pointer, aligns within the
    /// oversized payload and stashes the raw pointer in the word just
    /// below the returned address so [`free_aligned`] can recover it.
    ///
    /// # Errors
    /// * `InvalidAlignment` - `align` is zero or not a power of two
    /// * `InvalidSize` / `OutOfMemory` - as for [`allocate`]
    ///
    /// [`allocate`]: Allocator::allocate
    /// [`free_aligned`]: Allocator::free_aligned
    pub fn allocate_aligned(&self, size: usize, align: usize) -> Result<NonNull<u8>, AllocatorError> {
        if align == 0 || !is_power_of_two(align) {
            return Err(AllocatorError::InvalidAlignment);
        }

        let padding = align + mem::size_of::<*mut u8>();
        let raw = self.allocate(size + padding)?;

        let addr = raw.as_ptr() as usize;
        let aligned = (addr + mem::size_of::<*mut u8>() + align - 1) & !(align - 1);

        unsafe {
            // Back-pointer to the real payload, one word below the aligned address
            let back = (aligned - mem::size_of::<*mut u8>()) as *mut *mut u8;
            *back = raw.as_ptr();
            Ok(NonNull::new_unchecked(aligned as *mut u8))
        }
    }

    /// Returns a block to the free list and coalesces memory-adjacent
    /// free neighbors
    ///
    /// Pointers that were not produced by [`allocate`] (or were already
    /// freed) fail the used-list membership check and are silently
    /// ignored, so foreign and double frees cannot corrupt the heap.
    ///
    /// [`allocate`]: Allocator::allocate
    pub fn free(&self, ptr: NonNull<u8>) {
        let mut inner = self.inner.lock().unwrap();

        let block = BlockHeader::from_payload(ptr);
        if !inner.used_list.contains(block) {
            trace!("ignoring free of unknown pointer {:p}", ptr.as_ptr());
            return;
        }

        inner.mark_free(block);
        inner.coalesce();
        inner.refresh_fragmentation();
    }

    /// Frees a pointer obtained from [`allocate_aligned`]
    ///
    /// # Safety
    /// `ptr` must have been returned by `allocate_aligned` on this
    /// allocator and not freed since; the word below it is read to
    /// recover the raw payload pointer.
    ///
    /// [`allocate_aligned`]: Allocator::allocate_aligned
    pub unsafe fn free_aligned(&self, ptr: NonNull<u8>) {
        unsafe {
            let back = (ptr.as_ptr() as usize - mem::size_of::<*mut u8>()) as *const *mut u8;
            if let Some(raw) = NonNull::new(*back) {
                self.free(raw);
            }
        }
    }

    /// Resizes an allocation, preserving its prefix
    ///
    /// A `None` pointer behaves as [`allocate`]; a zero size behaves as
    /// [`free`] and yields `None`. Shrinking splits the excess back onto
    /// the free list. Growing first tries to absorb the memory-adjacent
    /// successor when it is free; otherwise the payload is copied into a
    /// fresh allocation and the old block freed. On failure the old block
    /// is left untouched.
    ///
    /// [`allocate`]: Allocator::allocate
    /// [`free`]: Allocator::free
    pub fn reallocate(&self, ptr: Option<NonNull<u8>>, size: usize) -> Result<Option<NonNull<u8>>, AllocatorError> {
        let Some(ptr) = ptr else {
            return self.allocate(size).map(Some);
        };
        if size == 0 {
            self.free(ptr);
            return Ok(None);
        }

        let total = align_to(HEADER_SIZE + size, ALLOC_ALIGNMENT);
        let old_payload;
        {
            let mut inner = self.inner.lock().unwrap();

            let block = BlockHeader::from_payload(ptr);
            if !inner.used_list.contains(block) {
                return Err(AllocatorError::InvalidPointer);
            }

            let old_size = unsafe { (*block.as_ptr()).size };

            // Fits in place: give the tail back to the free list
            if total <= old_size {
                inner.split_block(block, total);
                let released = old_size - unsafe { (*block.as_ptr()).size };
                if released > 0 {
                    inner.stats.record_inplace_shrink(released);
                    inner.coalesce();
                }
                inner.refresh_fragmentation();
                return Ok(Some(ptr));
            }

            // Grow in place by absorbing the memory-adjacent successor
            if let Some(successor) = inner.adjacent_free_successor(block) {
                let combined = old_size + unsafe { (*successor.as_ptr()).size };
                if combined >= total {
                    unsafe {
                        inner.free_list.unlink(successor);
                        (*block.as_ptr()).size = combined;
                    }
                    inner.split_block(block, total);
                    let absorbed = unsafe { (*block.as_ptr()).size } - old_size;
                    inner.stats.record_inplace_growth(absorbed);
                    inner.refresh_fragmentation();
                    return Ok(Some(ptr));
                }
            }

            old_payload = old_size - HEADER_SIZE;
            // Fall through to the relocating path with the guard released
        }

        let new_ptr = self.allocate(size)?;
        unsafe {
            // The old block stays on the used list until the free below,
            // so its payload cannot be recycled during the copy
            ptr::copy_nonoverlapping(ptr.as_ptr(), new_ptr.as_ptr(), old_payload.min(size));
        }
        self.free(ptr);
        Ok(Some(new_ptr))
    }

    /// Changes the page protection of the span `[ptr, ptr + size)`
    ///
    /// The affected range is widened to page boundaries, so the change
    /// can spill onto pages shared with neighboring blocks; callers
    /// accept that risk. The block's recorded protection is updated only
    /// when the OS accepts the change.
    ///
    /// The block header shares a page with the payload, so revoking WRITE
    /// and then changing protection again without restoring WRITE in
    /// between is also at the caller's risk.
    ///
    /// # Errors
    /// * `InvalidSize` - `size` is zero
    /// * `InvalidPointer` - `ptr` is not a live allocation of this allocator
    /// * `ProtectionFailed` - the OS rejected the change
    pub fn protect(&self, ptr: NonNull<u8>, size: usize, protection: Protection) -> Result<(), AllocatorError> {
        if size == 0 {
            return Err(AllocatorError::InvalidSize);
        }

        let mut inner = self.inner.lock().unwrap();

        let block = BlockHeader::from_payload(ptr);
        if !inner.used_list.contains(block) {
            return Err(AllocatorError::InvalidPointer);
        }

        if protection.contains(Protection::WRITE) {
            protect_range(ptr.as_ptr() as usize, size, protection, inner.page_size)?;
            unsafe {
                (*block.as_ptr()).protection = protection;
            }
        } else {
            // Record first while the header's page is still writable and
            // roll back if the OS rejects the change
            let previous = unsafe { (*block.as_ptr()).protection };
            unsafe {
                (*block.as_ptr()).protection = protection;
            }
            if let Err(err) = protect_range(ptr.as_ptr() as usize, size, protection, inner.page_size) {
                unsafe {
                    (*block.as_ptr()).protection = previous;
                }
                return Err(err);
            }
        }

        debug!("protection of {:p} (+{}) set to {}", ptr.as_ptr(), size, protection);
        Ok(())
    }

    /// Snapshot of the memory counters
    pub fn stats(&self) -> AllocatorStats {
        self.inner.lock().unwrap().stats.clone()
    }

    /// All live blocks, sorted by base address
    pub fn memory_map(&self) -> Vec<BlockInfo> {
        let inner = self.inner.lock().unwrap();

        let mut blocks: Vec<BlockInfo> = inner
            .free_list
            .iter()
            .chain(inner.used_list.iter())
            .map(|block| unsafe {
                let header = &*block.as_ptr();
                BlockInfo {
                    address: BlockHeader::base(block),
                    size: header.size,
                    is_free: header.is_free,
                    protection: header.protection,
                }
            })
            .collect();

        blocks.sort_by_key(|info| info.address);
        blocks
    }

    /// Prints a human-readable memory map for debugging
    pub fn print_memory_map(&self) {
        let stats = self.stats();
        let blocks = self.memory_map();

        println!("===== Memory Allocator Map =====");
        println!("Total memory: {} bytes", stats.total_memory);
        println!("Used memory: {} bytes", stats.used_memory);
        println!("Free memory: {} bytes", stats.free_memory);
        println!("Fragmentation: {:.2}%", stats.fragmentation_ratio * 100.0);
        println!();
        println!("Address            | Size     | Status | Protection");
        println!("-------------------|----------|--------|-----------");
        for info in blocks {
            println!(
                "{:#018x} | {:<8} | {:<6} | {}",
                info.address,
                info.size,
                if info.is_free { "FREE" } else { "USED" },
                info.protection
            );
        }
        println!("==============================");
    }
}

impl Drop for Allocator {
    fn drop(&mut self) {
        if let Ok(inner) = self.inner.get_mut() {
            info!("releasing heap: {} extent(s), {} bytes", inner.extents.len(), inner.stats.total_memory);
        }
        // The extents unmap themselves as the inner state drops
    }
}

impl AllocatorInner {
    /// Finds (or maps) a free block of at least `total` bytes, splits off
    /// the surplus and moves the block to the used list
    fn allocate_block(&mut self, total: usize) -> Result<NonNull<BlockHeader>, AllocatorError> {
        let block = match self.find_free_block(total) {
            Some(block) => block,
            None => self.extend_heap(total)?,
        };

        self.split_block(block, total);
        self.mark_used(block);
        self.refresh_fragmentation();
        Ok(block)
    }

    /// Placement engine: scans the free list in link order under the
    /// configured strategy
    fn find_free_block(&self, total: usize) -> Option<NonNull<BlockHeader>> {
        match self.strategy {
            AllocationStrategy::FirstFit => self.free_list.iter().find(|block| unsafe { (*block.as_ptr()).size } >= total),
            AllocationStrategy::BestFit => {
                let mut best: Option<NonNull<BlockHeader>> = None;
                let mut best_surplus = usize::MAX;
                for block in self.free_list.iter() {
                    let size = unsafe { (*block.as_ptr()).size };
                    // Strict comparison keeps the earlier block on ties
                    if size >= total && size - total < best_surplus {
                        best = Some(block);
                        best_surplus = size - total;
                    }
                }
                best
            }
            AllocationStrategy::WorstFit => {
                let mut worst: Option<NonNull<BlockHeader>> = None;
                let mut worst_surplus = 0;
                for block in self.free_list.iter() {
                    let size = unsafe { (*block.as_ptr()).size };
                    if size >= total && (worst.is_none() || size - total > worst_surplus) {
                        worst = Some(block);
                        worst_surplus = size - total;
                    }
                }
                worst
            }
        }
    }

    /// Maps a fresh extent of at least `total` bytes and hands back its
    /// single spanning free block
    ///
    /// The new mapping is not assumed contiguous with prior ones.
    fn extend_heap(&mut self, total: usize) -> Result<NonNull<BlockHeader>, AllocatorError> {
        let extent = HeapExtent::map_anonymous(total, self.page_size).map_err(|_| AllocatorError::OutOfMemory)?;
        debug!("extending heap by {} bytes at {:#x}", extent.len(), extent.base());

        let block = unsafe { BlockHeader::initialize(extent.as_ptr(), extent.len(), Protection::READ | Protection::WRITE) };
        self.free_list.push_front(block);
        self.stats.record_extension(extent.len());
        self.extents.push(extent);
        Ok(block)
    }

    /// Carves the tail of `block` beyond `total` into a new free block
    /// when the remainder is worth keeping, and pushes it onto the free
    /// list; otherwise the surplus stays as slack inside the block
    fn split_block(&mut self, block: NonNull<BlockHeader>, total: usize) {
        unsafe {
            let size = (*block.as_ptr()).size;
            if size < total + HEADER_SIZE + MIN_PAYLOAD {
                return;
            }

            let tail_at = NonNull::new_unchecked((block.as_ptr() as *mut u8).add(total));
            let tail = BlockHeader::initialize(tail_at, size - total, (*block.as_ptr()).protection);

            (*block.as_ptr()).size = total;
            self.free_list.push_front(tail);
        }
    }

    /// Moves a block from the free list to the used list
    fn mark_used(&mut self, block: NonNull<BlockHeader>) {
        unsafe {
            self.free_list.unlink(block);
            (*block.as_ptr()).is_free = false;
        }
        self.used_list.push_front(block);
        self.stats.record_allocation(unsafe { (*block.as_ptr()).size });
    }

    /// Moves a block from the used list back to the free list
    fn mark_free(&mut self, block: NonNull<BlockHeader>) {
        unsafe {
            self.used_list.unlink(block);
            (*block.as_ptr()).is_free = true;
        }
        self.free_list.push_front(block);
        self.stats.record_free(unsafe { (*block.as_ptr()).size });
    }

    /// Merges memory-adjacent free blocks
    ///
    /// Collects the free list, sorts it by base address and absorbs every
    /// successor that starts exactly where its predecessor ends within the
    /// same extent. Blocks from different extents never merge, even when
    /// the OS happens to place two mappings back to back. The rebuilt
    /// list is in ascending address order.
    fn coalesce(&mut self) -> usize {
        let mut blocks: Vec<NonNull<BlockHeader>> = self.free_list.iter().collect();
        blocks.sort_by_key(|block| BlockHeader::base(*block));

        let mut survivors = Vec::with_capacity(blocks.len());
        let mut merged = 0;

        let mut i = 0;
        while i < blocks.len() {
            let current = blocks[i];
            let mut size = unsafe { (*current.as_ptr()).size };

            let mut j = i + 1;
            while j < blocks.len() {
                let next = blocks[j];
                let current_end = BlockHeader::base(current) + size;
                if current_end == BlockHeader::base(next) && self.same_extent(BlockHeader::base(current), BlockHeader::base(next)) {
                    size += unsafe { (*next.as_ptr()).size };
                    merged += 1;
                    j += 1;
                } else {
                    break;
                }
            }

            unsafe {
                (*current.as_ptr()).size = size;
            }
            survivors.push(current);
            i = j;
        }

        let mut rebuilt = BlockList::new();
        for block in survivors.into_iter().rev() {
            rebuilt.push_front(block);
        }

        self.free_list = rebuilt;
        merged
    }

    /// The free block starting exactly where `block` ends, if any
    fn adjacent_free_successor(&self, block: NonNull<BlockHeader>) -> Option<NonNull<BlockHeader>> {
        let end = BlockHeader::base(block) + unsafe { (*block.as_ptr()).size };
        self.free_list
            .iter()
            .find(|candidate| BlockHeader::base(*candidate) == end && self.same_extent(BlockHeader::base(block), end))
    }

    /// Whether both addresses fall inside one mapping
    fn same_extent(&self, a: usize, b: usize) -> bool {
        self.extents.iter().any(|extent| extent.contains(a) && extent.contains(b))
    }

    /// Recomputes the fragmentation ratio from the current free list
    fn refresh_fragmentation(&mut self) {
        let largest = self.free_list.iter().map(|block| unsafe { (*block.as_ptr()).size }).max().unwrap_or(0);
        self.stats.update_fragmentation(largest);
    }
}

unsafe impl GlobalAlloc for Allocator {
    unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
        let size = layout.size().max(1);
        let result = if layout.align() <= ALLOC_ALIGNMENT {
            self.allocate(size)
        } else {
            self.allocate_aligned(size, layout.align())
        };

        match result {
            Ok(ptr) => ptr.as_ptr(),
            Err(_) => ptr::null_mut(),
        }
    }

    unsafe fn dealloc(&self, ptr: *mut u8, layout: Layout) {
        if let Some(ptr) = NonNull::new(ptr) {
            if layout.align() <= ALLOC_ALIGNMENT {
                self.free(ptr);
            } else {
                unsafe { self.free_aligned(ptr) };
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    fn allocator_with(strategy: AllocationStrategy) -> Allocator {
        Allocator::new(AllocatorConfig::default().with_initial_heap_size(1024 * 1024).with_strategy(strategy)).unwrap()
    }

    fn write_pattern(ptr: NonNull<u8>, len: usize, byte: u8) {
        unsafe { ptr::write_bytes(ptr.as_ptr(), byte, len) };
    }

    fn read_back(ptr: NonNull<u8>, len: usize) -> Vec<u8> {
        unsafe { std::slice::from_raw_parts(ptr.as_ptr(), len).to_vec() }
    }

    #[test]
    fn test_initial_stats() {
        let allocator = allocator_with(AllocationStrategy::BestFit);
        let stats = allocator.stats();

        assert_eq!(stats.total_memory, 1024 * 1024);
        assert_eq!(stats.used_memory, 0);
        assert_eq!(stats.free_memory, 1024 * 1024);
        assert_eq!(stats.overhead, HEADER_SIZE);
        assert_eq!(stats.active_allocations, 0);
        assert_eq!(stats.total_allocations, 0);
        assert_eq!(stats.fragmentation_ratio, 0.0);
    }

    #[test]
    fn test_alloc_free_round_trip() {
        let allocator = allocator_with(AllocationStrategy::FirstFit);

        let ptr = allocator.allocate(100).unwrap();
        write_pattern(ptr, 100, 0xA5);
        assert!(read_back(ptr, 100).iter().all(|&b| b == 0xA5));

        let stats = allocator.stats();
        assert!(stats.used_memory > 0);
        assert_eq!(stats.active_allocations, 1);
        assert_eq!(stats.total_allocations, 1);

        allocator.free(ptr);
        let stats = allocator.stats();
        assert_eq!(stats.used_memory, 0);
        assert_eq!(stats.active_allocations, 0);
        assert_eq!(stats.free_memory, stats.total_memory);
    }

    #[test]
    fn test_zero_size_allocation_is_rejected() {
        let allocator = allocator_with(AllocationStrategy::FirstFit);
        assert_eq!(allocator.allocate(0), Err(AllocatorError::InvalidSize));
    }

    #[test]
    fn test_payloads_are_aligned_and_disjoint() {
        let allocator = allocator_with(AllocationStrategy::FirstFit);

        let a = allocator.allocate(24).unwrap();
        let b = allocator.allocate(100).unwrap();

        assert_eq!(a.as_ptr() as usize % ALLOC_ALIGNMENT, 0);
        assert_eq!(b.as_ptr() as usize % ALLOC_ALIGNMENT, 0);

        write_pattern(a, 24, 0x11);
        write_pattern(b, 100, 0x22);
        assert!(read_back(a, 24).iter().all(|&x| x == 0x11));
        assert!(read_back(b, 100).iter().all(|&x| x == 0x22));
    }

    #[test]
    fn test_conservation_of_mapped_bytes() {
        let allocator = allocator_with(AllocationStrategy::FirstFit);

        let ptrs: Vec<_> = (0..10).map(|i| allocator.allocate(50 + i * 30).unwrap()).collect();
        for ptr in ptrs.iter().skip(1).step_by(2) {
            allocator.free(*ptr);
        }

        let stats = allocator.stats();
        assert_eq!(stats.used_memory + stats.free_memory, stats.total_memory);

        let mapped: usize = allocator.memory_map().iter().map(|info| info.size).sum();
        assert_eq!(mapped, stats.total_memory);
    }

    #[test]
    fn test_every_block_is_on_exactly_one_list() {
        let allocator = allocator_with(AllocationStrategy::FirstFit);

        let a = allocator.allocate(100).unwrap();
        let _b = allocator.allocate(200).unwrap();
        allocator.free(a);

        let map = allocator.memory_map();
        // Addresses are unique, so no block can sit on both lists
        let mut addresses: Vec<_> = map.iter().map(|info| info.address).collect();
        addresses.dedup();
        assert_eq!(addresses.len(), map.len());

        let inner = allocator.inner.lock().unwrap();
        assert_eq!(inner.free_list.len() + inner.used_list.len(), map.len());
        for block in inner.free_list.iter() {
            assert!(unsafe { (*block.as_ptr()).is_free });
        }
        for block in inner.used_list.iter() {
            assert!(!unsafe { (*block.as_ptr()).is_free });
        }
    }

    #[test]
    fn test_best_fit_selects_smallest_surplus() {
        let allocator = allocator_with(AllocationStrategy::BestFit);

        // Carve out free blocks of payload sizes 64, 256 and 1024,
        // separated by live allocations so they cannot coalesce
        let small = allocator.allocate(64).unwrap();
        let _sep1 = allocator.allocate(16).unwrap();
        let medium = allocator.allocate(256).unwrap();
        let _sep2 = allocator.allocate(16).unwrap();
        let large = allocator.allocate(1024).unwrap();
        let _sep3 = allocator.allocate(16).unwrap();

        allocator.free(small);
        allocator.free(medium);
        allocator.free(large);

        // 100 bytes only fits the 256- and 1024-payload holes (and the
        // big tail); best fit must pick the 256 one, i.e. reuse its spot
        let chosen = allocator.allocate(100).unwrap();
        assert_eq!(chosen, medium);

        // The smaller and larger holes are still free
        let map = allocator.memory_map();
        let small_base = BlockHeader::base(BlockHeader::from_payload(small));
        let large_base = BlockHeader::base(BlockHeader::from_payload(large));
        assert!(map.iter().any(|info| info.address == small_base && info.is_free));
        assert!(map.iter().any(|info| info.address == large_base && info.is_free));
    }

    #[test]
    fn test_worst_fit_selects_largest_surplus() {
        let allocator = allocator_with(AllocationStrategy::WorstFit);

        let medium = allocator.allocate(256).unwrap();
        let _sep = allocator.allocate(16).unwrap();
        allocator.free(medium);

        // The post-init tail is by far the largest hole, so worst fit
        // must ignore the 256-payload hole
        let chosen = allocator.allocate(100).unwrap();
        assert_ne!(chosen, medium);

        let map = allocator.memory_map();
        let medium_base = BlockHeader::base(BlockHeader::from_payload(medium));
        assert!(map.iter().any(|info| info.address == medium_base && info.is_free));
    }

    #[test]
    fn test_first_fit_reuses_earliest_link() {
        let allocator = allocator_with(AllocationStrategy::FirstFit);

        let a = allocator.allocate(128).unwrap();
        let _sep = allocator.allocate(16).unwrap();
        allocator.free(a);

        // The freed block sits at the head of the free list, so first
        // fit hands it straight back
        let again = allocator.allocate(128).unwrap();
        assert_eq!(again, a);
    }

    #[test]
    fn test_split_then_coalesce_restores_single_block() {
        let allocator = allocator_with(AllocationStrategy::FirstFit);
        let initial_free = allocator.stats().free_memory;

        let ptrs: Vec<_> = (0..5).map(|_| allocator.allocate(100).unwrap()).collect();
        for ptr in ptrs.iter().rev() {
            allocator.free(*ptr);
        }

        let stats = allocator.stats();
        assert_eq!(stats.free_memory, initial_free);
        assert_eq!(stats.fragmentation_ratio, 0.0);

        let map = allocator.memory_map();
        assert_eq!(map.len(), 1);
        assert!(map[0].is_free);
        assert_eq!(map[0].size, stats.total_memory);
    }

    #[test]
    fn test_coalescing_is_idempotent() {
        let allocator = allocator_with(AllocationStrategy::FirstFit);

        let a = allocator.allocate(100).unwrap();
        let b = allocator.allocate(100).unwrap();
        let _guard = allocator.allocate(100).unwrap();
        allocator.free(a);
        allocator.free(b);

        let before = allocator.memory_map();
        let merged = {
            let mut inner = allocator.inner.lock().unwrap();
            inner.coalesce()
        };
        let after = allocator.memory_map();

        // Free already coalesced, so a second sweep finds nothing
        assert_eq!(merged, 0);
        assert_eq!(before.len(), after.len());
        for (lhs, rhs) in before.iter().zip(after.iter()) {
            assert_eq!(lhs.address, rhs.address);
            assert_eq!(lhs.size, rhs.size);
            assert_eq!(lhs.is_free, rhs.is_free);
        }
    }

    #[test]
    fn test_aligned_allocation() {
        let allocator = allocator_with(AllocationStrategy::FirstFit);

        for align in [32, 64, 256, 4096] {
            let ptr = allocator.allocate_aligned(100, align).unwrap();
            assert_eq!(ptr.as_ptr() as usize % align, 0, "alignment {align}");
            write_pattern(ptr, 100, 0x3C);
        }
    }

    #[test]
    fn test_aligned_allocation_rejects_bad_alignment() {
        let allocator = allocator_with(AllocationStrategy::FirstFit);
        assert_eq!(allocator.allocate_aligned(100, 0), Err(AllocatorError::InvalidAlignment));
        assert_eq!(allocator.allocate_aligned(100, 3), Err(AllocatorError::InvalidAlignment));
        assert_eq!(allocator.allocate_aligned(100, 48), Err(AllocatorError::InvalidAlignment));
    }

    #[test]
    fn test_aligned_write_does_not_corrupt_neighbors() {
        let allocator = allocator_with(AllocationStrategy::FirstFit);

        let aligned = allocator.allocate_aligned(100, 64).unwrap();
        write_pattern(aligned, 100, 0x77);

        let neighbor = allocator.allocate(100).unwrap();
        write_pattern(neighbor, 100, 0x88);

        assert!(read_back(aligned, 100).iter().all(|&b| b == 0x77));
        assert!(read_back(neighbor, 100).iter().all(|&b| b == 0x88));
    }

    #[test]
    fn test_aligned_free_recovers_raw_pointer() {
        let allocator = allocator_with(AllocationStrategy::FirstFit);
        let before = allocator.stats();

        let ptr = allocator.allocate_aligned(100, 128).unwrap();
        assert_eq!(allocator.stats().active_allocations, 1);

        unsafe { allocator.free_aligned(ptr) };
        let after = allocator.stats();
        assert_eq!(after.active_allocations, 0);
        assert_eq!(after.used_memory, 0);
        assert_eq!(after.free_memory, before.free_memory);
    }

    #[test]
    fn test_plain_free_of_aligned_pointer_is_ignored() {
        let allocator = allocator_with(AllocationStrategy::FirstFit);

        let ptr = allocator.allocate_aligned(100, 512).unwrap();
        // Not the raw payload pointer, so the membership check drops it
        allocator.free(ptr);
        assert_eq!(allocator.stats().active_allocations, 1);

        unsafe { allocator.free_aligned(ptr) };
        assert_eq!(allocator.stats().active_allocations, 0);
    }

    #[test]
    fn test_foreign_and_double_free_are_ignored() {
        let allocator = allocator_with(AllocationStrategy::FirstFit);

        let mut foreign = vec![0u8; 256];
        allocator.free(NonNull::new(foreign.as_mut_ptr()).unwrap());

        let ptr = allocator.allocate(100).unwrap();
        allocator.free(ptr);
        let stats = allocator.stats();
        allocator.free(ptr);

        let after = allocator.stats();
        assert_eq!(stats.used_memory, after.used_memory);
        assert_eq!(stats.free_memory, after.free_memory);
        assert_eq!(stats.active_allocations, after.active_allocations);
    }

    #[test]
    fn test_realloc_null_behaves_as_alloc() {
        let allocator = allocator_with(AllocationStrategy::FirstFit);

        let ptr = allocator.reallocate(None, 100).unwrap().unwrap();
        write_pattern(ptr, 100, 0x42);
        assert_eq!(allocator.stats().active_allocations, 1);
    }

    #[test]
    fn test_realloc_zero_behaves_as_free() {
        let allocator = allocator_with(AllocationStrategy::FirstFit);

        let ptr = allocator.allocate(100).unwrap();
        let result = allocator.reallocate(Some(ptr), 0).unwrap();
        assert!(result.is_none());
        assert_eq!(allocator.stats().active_allocations, 0);
    }

    #[test]
    fn test_realloc_grow_preserves_prefix() {
        let allocator = allocator_with(AllocationStrategy::FirstFit);

        let ptr = allocator.allocate(100).unwrap();
        write_pattern(ptr, 100, 0x55);

        let grown = allocator.reallocate(Some(ptr), 200).unwrap().unwrap();
        assert!(read_back(grown, 100).iter().all(|&b| b == 0x55));

        let stats = allocator.stats();
        assert_eq!(stats.active_allocations, 1);
        assert_eq!(stats.used_memory + stats.free_memory, stats.total_memory);
    }

    #[test]
    fn test_realloc_grows_in_place_when_successor_is_free() {
        let allocator = allocator_with(AllocationStrategy::FirstFit);

        // The post-init tail sits right after this block and is free
        let ptr = allocator.allocate(100).unwrap();
        write_pattern(ptr, 100, 0x5A);

        let grown = allocator.reallocate(Some(ptr), 500).unwrap().unwrap();
        assert_eq!(grown, ptr);
        assert!(read_back(grown, 100).iter().all(|&b| b == 0x5A));

        let stats = allocator.stats();
        assert_eq!(stats.used_memory + stats.free_memory, stats.total_memory);
    }

    #[test]
    fn test_realloc_relocates_when_successor_is_used() {
        let allocator = allocator_with(AllocationStrategy::FirstFit);

        let ptr = allocator.allocate(100).unwrap();
        let _wall = allocator.allocate(100).unwrap();
        write_pattern(ptr, 100, 0x99);

        let moved = allocator.reallocate(Some(ptr), 10_000).unwrap().unwrap();
        assert_ne!(moved, ptr);
        assert!(read_back(moved, 100).iter().all(|&b| b == 0x99));

        let stats = allocator.stats();
        assert_eq!(stats.active_allocations, 2);
        assert_eq!(stats.used_memory + stats.free_memory, stats.total_memory);
    }

    #[test]
    fn test_realloc_shrink_returns_tail_to_free_list() {
        let allocator = allocator_with(AllocationStrategy::FirstFit);

        let ptr = allocator.allocate(1000).unwrap();
        write_pattern(ptr, 1000, 0x6B);
        let used_before = allocator.stats().used_memory;

        let shrunk = allocator.reallocate(Some(ptr), 100).unwrap().unwrap();
        assert_eq!(shrunk, ptr);
        assert!(read_back(shrunk, 100).iter().all(|&b| b == 0x6B));

        let stats = allocator.stats();
        assert!(stats.used_memory < used_before);
        assert_eq!(stats.used_memory + stats.free_memory, stats.total_memory);
    }

    #[test]
    fn test_realloc_unknown_pointer_fails_without_side_effects() {
        let allocator = allocator_with(AllocationStrategy::FirstFit);
        let before = allocator.stats();

        let mut foreign = vec![0u8; 256];
        let result = allocator.reallocate(NonNull::new(foreign.as_mut_ptr()), 100);
        assert_eq!(result, Err(AllocatorError::InvalidPointer));

        let after = allocator.stats();
        assert_eq!(before.used_memory, after.used_memory);
        assert_eq!(before.total_allocations, after.total_allocations);
    }

    #[test]
    fn test_heap_extends_when_request_exceeds_free_space() {
        let allocator = Allocator::new(AllocatorConfig::default().with_initial_heap_size(64 * 1024)).unwrap();
        let initial_total = allocator.stats().total_memory;

        let big = allocator.allocate(256 * 1024).unwrap();
        write_pattern(big, 256 * 1024, 0xEE);

        let stats = allocator.stats();
        assert!(stats.total_memory > initial_total);
        assert_eq!(stats.used_memory + stats.free_memory, stats.total_memory);

        // Blocks of separate mappings must not merge even after the
        // original allocation is gone
        allocator.free(big);
        let map = allocator.memory_map();
        assert_eq!(map.len(), 2);
        assert!(map.iter().all(|info| info.is_free));
    }

    #[test]
    fn test_peak_usage_is_monotonic() {
        let allocator = allocator_with(AllocationStrategy::FirstFit);
        let mut last_peak = 0;

        let ptrs: Vec<_> = (0..8).map(|_| allocator.allocate(512).unwrap()).collect();
        for ptr in ptrs {
            let stats = allocator.stats();
            assert!(stats.peak_usage >= last_peak);
            assert!(stats.peak_usage >= stats.used_memory);
            last_peak = stats.peak_usage;
            allocator.free(ptr);

            let stats = allocator.stats();
            assert!(stats.peak_usage >= last_peak);
        }
    }

    #[test]
    fn test_fragmentation_after_checkerboard_frees() {
        let allocator = Allocator::new(AllocatorConfig::default().with_initial_heap_size(4 * 1024 * 1024)).unwrap();

        let sizes = [64usize, 128, 256, 512];
        let ptrs: Vec<_> = (0..100)
            .map(|_| {
                let size = sizes[rand::random::<usize>() % sizes.len()];
                allocator.allocate(size).unwrap()
            })
            .collect();

        for ptr in ptrs.iter().step_by(2) {
            allocator.free(*ptr);
        }

        let stats = allocator.stats();
        assert!(stats.fragmentation_ratio > 0.0);
        assert!(stats.fragmentation_ratio < 1.0);
    }

    #[test]
    fn test_protect_updates_block_protection() {
        let allocator = allocator_with(AllocationStrategy::FirstFit);
        let page_size = get_page_size();

        let ptr = allocator.allocate(page_size).unwrap();
        allocator.protect(ptr, page_size, Protection::READ).unwrap();

        let block_base = BlockHeader::base(BlockHeader::from_payload(ptr));
        let map = allocator.memory_map();
        let info = map.iter().find(|info| info.address == block_base).unwrap();
        assert_eq!(info.protection, Protection::READ);

        // Restore write access so teardown can touch the headers again
        allocator.protect(ptr, page_size, Protection::READ | Protection::WRITE).unwrap();
    }

    #[test]
    fn test_protect_rejects_unknown_pointer_and_zero_size() {
        let allocator = allocator_with(AllocationStrategy::FirstFit);

        let mut foreign = vec![0u8; 64];
        let foreign_ptr = NonNull::new(foreign.as_mut_ptr()).unwrap();
        assert_eq!(allocator.protect(foreign_ptr, 64, Protection::READ), Err(AllocatorError::InvalidPointer));

        let ptr = allocator.allocate(64).unwrap();
        assert_eq!(allocator.protect(ptr, 0, Protection::READ), Err(AllocatorError::InvalidSize));
    }

    #[test]
    fn test_global_alloc_routes_by_alignment() {
        let allocator = allocator_with(AllocationStrategy::FirstFit);

        unsafe {
            let natural = Layout::from_size_align(100, 8).unwrap();
            let ptr = GlobalAlloc::alloc(&allocator, natural);
            assert!(!ptr.is_null());
            GlobalAlloc::dealloc(&allocator, ptr, natural);

            let oversized = Layout::from_size_align(100, 256).unwrap();
            let ptr = GlobalAlloc::alloc(&allocator, oversized);
            assert!(!ptr.is_null());
            assert_eq!(ptr as usize % 256, 0);
            GlobalAlloc::dealloc(&allocator, ptr, oversized);
        }

        let stats = allocator.stats();
        assert_eq!(stats.active_allocations, 0);
        assert_eq!(stats.used_memory, 0);
    }

    #[test]
    fn test_concurrent_alloc_free() {
        let allocator = Arc::new(allocator_with(AllocationStrategy::FirstFit));
        let mut handles = Vec::new();

        for worker in 0..4 {
            let allocator = Arc::clone(&allocator);
            handles.push(thread::spawn(move || {
                for round in 0..200 {
                    let size = 16 + (worker * 37 + round * 13) % 512;
                    let ptr = allocator.allocate(size).unwrap();
                    write_pattern(ptr, size, worker as u8);
                    assert!(read_back(ptr, size).iter().all(|&b| b == worker as u8));
                    allocator.free(ptr);
                }
            }));
        }

        for handle in handles {
            handle.join().unwrap();
        }

        let stats = allocator.stats();
        assert_eq!(stats.active_allocations, 0);
        assert_eq!(stats.used_memory, 0);
        assert_eq!(stats.used_memory + stats.free_memory, stats.total_memory);
    }
}
