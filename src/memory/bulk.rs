//! Page-granular allocator for requests above the bucketed maximum.
//!
//! Requests of up to `BULK_MAX_IN_BLOCK_PAGES` pages (header included) are
//! carved out of 8 MiB blocks. Every chunk starts with a [`ChunkHeader`]
//! linking it to its neighbours in the block, so freeing a chunk can merge it
//! with a free predecessor and/or successor without any side index. Free
//! chunks additionally carry links for their free list: one exact-size list
//! per page count up to the threshold, plus one overflow list for anything
//! larger. Adjacent free chunks never coexist.
//!
//! Larger requests skip the blocks and map exactly the pages they need from
//! the OS; those chunks are marked [`ChunkState::Direct`] and unmapped on free.
//!
//! The user pointer is always `header + BULK_HEADER_SIZE`, which is how the
//! heap tells bulk pointers from bucketed ones.

use std::mem::size_of;
use std::ptr::NonNull;

use fixedbitset::FixedBitSet;
use log::{debug, trace, warn};
use static_assertions::const_assert;

use super::error::{HeapError, Violation};
use super::layout::{
    ALIGNMENT, BULK_BLOCK_PAGES, BULK_BLOCK_SIZE, BULK_MAX_IN_BLOCK_PAGES, PAGE_SIZE,
    PAGE_SIZE_EXP, align_up, pages_for,
};
use super::page_cache::PageCache;
use super::page_pool::PagePool;
use super::stats::BULK_DIRECT_LIVE;
use super::vm::VirtualMemoryProvider;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
enum ChunkState {
    Used,
    Free,
    /// Mapped on its own, outside any block.
    Direct,
}

#[repr(C)]
struct ChunkHeader {
    prev_in_block: Option<NonNull<ChunkHeader>>,
    next_in_block: Option<NonNull<ChunkHeader>>,
    pages: usize,
    state: ChunkState,
}

#[repr(C)]
struct FreeChunk {
    header: ChunkHeader,
    prev_free: Option<NonNull<FreeChunk>>,
    next_free: Option<NonNull<FreeChunk>>,
}

/// Offset of the user pointer within a bulk chunk's first page.
pub const BULK_HEADER_SIZE: usize = align_up(size_of::<ChunkHeader>(), ALIGNMENT);

const OVERFLOW: usize = BULK_MAX_IN_BLOCK_PAGES;

const_assert!(BULK_HEADER_SIZE % ALIGNMENT == 0);
const_assert!(BULK_HEADER_SIZE > 0 && BULK_HEADER_SIZE < PAGE_SIZE);
const_assert!(size_of::<FreeChunk>() <= PAGE_SIZE);

#[derive(Clone, Copy)]
struct BlockDescriptor {
    base: NonNull<u8>,
    next: Option<NonNull<BlockDescriptor>>,
}

impl BlockDescriptor {
    fn contains(&self, addr: usize) -> bool {
        let base = self.base.as_ptr() as usize;
        addr >= base && addr < base + BULK_BLOCK_SIZE
    }
}

fn bucket_of(pages: usize) -> usize {
    debug_assert!(pages > 0);
    (pages - 1).min(OVERFLOW)
}

/// Header of the chunk behind a user pointer.
///
/// # Safety
/// `ptr` must have been returned by [`BulkBlockAllocator::allocate`].
unsafe fn header_of(ptr: NonNull<u8>) -> NonNull<ChunkHeader> {
    // Safety: the header sits BULK_HEADER_SIZE bytes before the user pointer.
    unsafe { ptr.byte_sub(BULK_HEADER_SIZE).cast() }
}

pub(crate) struct BulkBlockAllocator {
    // index = page count - 1; the last list holds everything larger.
    free_lists: [Option<NonNull<FreeChunk>>; BULK_MAX_IN_BLOCK_PAGES + 1],
    blocks: Option<NonNull<BlockDescriptor>>,
    descriptors: PagePool<BlockDescriptor>,
    block_count: usize,
    direct_live: usize,
}

impl BulkBlockAllocator {
    pub(crate) const fn new() -> Self {
        Self {
            free_lists: [None; BULK_MAX_IN_BLOCK_PAGES + 1],
            blocks: None,
            descriptors: PagePool::new(),
            block_count: 0,
            direct_live: 0,
        }
    }

    pub(crate) fn block_count(&self) -> usize {
        self.block_count
    }

    pub(crate) fn direct_live(&self) -> usize {
        self.direct_live
    }

    /// `size` usable bytes at a 16-byte aligned address whose page offset is
    /// `BULK_HEADER_SIZE`.
    pub(crate) fn allocate<V: VirtualMemoryProvider>(
        &mut self,
        size: usize,
        cache: &mut PageCache<V>,
    ) -> Result<NonNull<u8>, HeapError> {
        let pages = size
            .checked_add(BULK_HEADER_SIZE)
            .and_then(pages_for)
            .ok_or_else(|| HeapError::too_large(size))?;
        let chunk = if pages <= BULK_MAX_IN_BLOCK_PAGES {
            self.allocate_in_block(pages, cache)?
        } else {
            self.allocate_direct(pages, cache)?
        };
        // Safety: the chunk spans at least one page.
        Ok(unsafe { chunk.cast::<u8>().byte_add(BULK_HEADER_SIZE) })
    }

    fn allocate_in_block<V: VirtualMemoryProvider>(
        &mut self,
        pages: usize,
        cache: &mut PageCache<V>,
    ) -> Result<NonNull<ChunkHeader>, HeapError> {
        if let Some(chunk) = self.free_lists[pages - 1] {
            // Safety: free-list entries are live free chunks.
            unsafe {
                self.unlink_free(chunk);
                (*chunk.as_ptr()).header.state = ChunkState::Used;
            }
            return Ok(chunk.cast());
        }

        let chunk = match self.smallest_overflow() {
            Some(chunk) => chunk,
            None => self.add_block(cache)?,
        };
        // Safety: `chunk` is a free overflow chunk; its successor (if any)
        // and the split point lie inside the same block.
        unsafe {
            self.unlink_free(chunk);
            let header = &mut (*chunk.as_ptr()).header;
            debug_assert!(header.pages > BULK_MAX_IN_BLOCK_PAGES);

            let rest = chunk.byte_add(pages << PAGE_SIZE_EXP);
            let next = header.next_in_block;
            rest.as_ptr().write(FreeChunk {
                header: ChunkHeader {
                    prev_in_block: Some(chunk.cast()),
                    next_in_block: next,
                    pages: header.pages - pages,
                    state: ChunkState::Free,
                },
                prev_free: None,
                next_free: None,
            });
            if let Some(next) = next {
                (*next.as_ptr()).prev_in_block = Some(rest.cast());
            }

            header.next_in_block = Some(rest.cast());
            header.pages = pages;
            header.state = ChunkState::Used;
            self.insert_free(rest);
        }
        Ok(chunk.cast())
    }

    fn smallest_overflow(&self) -> Option<NonNull<FreeChunk>> {
        let mut best: Option<NonNull<FreeChunk>> = None;
        let mut cursor = self.free_lists[OVERFLOW];
        while let Some(chunk) = cursor {
            // Safety: free-list entries are live free chunks.
            let candidate = unsafe { chunk.as_ref() };
            let better = match best {
                // Safety: as above.
                Some(b) => candidate.header.pages < unsafe { b.as_ref() }.header.pages,
                None => true,
            };
            if better {
                best = Some(chunk);
            }
            cursor = candidate.next_free;
        }
        best
    }

    /// Take a fresh block from the page cache and list it as one free chunk.
    fn add_block<V: VirtualMemoryProvider>(
        &mut self,
        cache: &mut PageCache<V>,
    ) -> Result<NonNull<FreeChunk>, HeapError> {
        let base = cache
            .get_free_block(BULK_BLOCK_SIZE)
            .map_err(HeapError::out_of_memory(BULK_BLOCK_SIZE))?;
        let desc = BlockDescriptor {
            base,
            next: self.blocks,
        };
        let desc = match self.descriptors.create(desc, cache) {
            Ok(desc) => desc,
            Err(e) => {
                // Safety: the block was never published.
                unsafe { cache.free_chunk(base, BULK_BLOCK_SIZE) };
                return Err(HeapError::out_of_memory(PAGE_SIZE)(e));
            }
        };
        self.blocks = Some(desc);
        self.block_count += 1;

        let chunk = base.cast::<FreeChunk>();
        // Safety: the block is committed and exclusively ours.
        unsafe {
            chunk.as_ptr().write(FreeChunk {
                header: ChunkHeader {
                    prev_in_block: None,
                    next_in_block: None,
                    pages: BULK_BLOCK_PAGES,
                    state: ChunkState::Free,
                },
                prev_free: None,
                next_free: None,
            });
            self.insert_free(chunk);
        }
        debug!("bulk block #{} acquired at {base:p}", self.block_count);
        Ok(chunk)
    }

    fn allocate_direct<V: VirtualMemoryProvider>(
        &mut self,
        pages: usize,
        cache: &mut PageCache<V>,
    ) -> Result<NonNull<ChunkHeader>, HeapError> {
        let size = pages << PAGE_SIZE_EXP;
        let chunk = cache
            .get_free_block_no_cache(size)
            .map_err(HeapError::out_of_memory(size))?
            .cast::<ChunkHeader>();
        // Safety: freshly mapped and committed.
        unsafe {
            chunk.as_ptr().write(ChunkHeader {
                prev_in_block: None,
                next_in_block: None,
                pages,
                state: ChunkState::Direct,
            })
        };
        self.direct_live += 1;
        BULK_DIRECT_LIVE.add(size);
        trace!("direct bulk allocation of {pages} pages at {chunk:p}");
        Ok(chunk)
    }

    /// # Safety
    /// `ptr` must come from [`allocate`](Self::allocate) on this allocator
    /// and must not be used afterwards.
    pub(crate) unsafe fn deallocate<V: VirtualMemoryProvider>(
        &mut self,
        ptr: NonNull<u8>,
        cache: &mut PageCache<V>,
    ) {
        // Safety: forwarded caller contract.
        let chunk = unsafe { header_of(ptr) };
        // Safety: the header is live while the allocation is.
        let (state, pages) = unsafe { ((*chunk.as_ptr()).state, (*chunk.as_ptr()).pages) };
        match state {
            ChunkState::Direct => {
                let size = pages << PAGE_SIZE_EXP;
                // Safety: direct chunks are whole mappings of `size` bytes.
                unsafe { cache.free_chunk_no_cache(chunk.cast(), size) };
                self.direct_live -= 1;
                BULK_DIRECT_LIVE.sub(size);
                trace!("direct bulk allocation of {pages} pages released");
            }
            ChunkState::Used => {
                // Safety: in-block chunk with valid neighbour links.
                unsafe { self.coalesce_and_insert(chunk.cast()) };
            }
            ChunkState::Free => debug_assert!(false, "bulk chunk {chunk:p} freed twice"),
        }
    }

    unsafe fn coalesce_and_insert(&mut self, mut chunk: NonNull<FreeChunk>) {
        // Safety: chunk and its in-block neighbours are live headers.
        unsafe {
            if let Some(prev) = (*chunk.as_ptr()).header.prev_in_block
                && (*prev.as_ptr()).state == ChunkState::Free
            {
                let prev = prev.cast::<FreeChunk>();
                self.unlink_free(prev);
                let next = (*chunk.as_ptr()).header.next_in_block;
                (*prev.as_ptr()).header.pages += (*chunk.as_ptr()).header.pages;
                (*prev.as_ptr()).header.next_in_block = next;
                if let Some(next) = next {
                    (*next.as_ptr()).prev_in_block = Some(prev.cast());
                }
                chunk = prev;
            }

            if let Some(next) = (*chunk.as_ptr()).header.next_in_block
                && (*next.as_ptr()).state == ChunkState::Free
            {
                let next = next.cast::<FreeChunk>();
                self.unlink_free(next);
                let after = (*next.as_ptr()).header.next_in_block;
                (*chunk.as_ptr()).header.pages += (*next.as_ptr()).header.pages;
                (*chunk.as_ptr()).header.next_in_block = after;
                if let Some(after) = after {
                    (*after.as_ptr()).prev_in_block = Some(chunk.cast());
                }
            }

            (*chunk.as_ptr()).header.state = ChunkState::Free;
            self.insert_free(chunk);
        }
    }

    unsafe fn insert_free(&mut self, chunk: NonNull<FreeChunk>) {
        // Safety: chunk is a live free chunk not on any list.
        unsafe {
            let bucket = bucket_of((*chunk.as_ptr()).header.pages);
            let head = self.free_lists[bucket];
            (*chunk.as_ptr()).prev_free = None;
            (*chunk.as_ptr()).next_free = head;
            if let Some(head) = head {
                (*head.as_ptr()).prev_free = Some(chunk);
            }
            self.free_lists[bucket] = Some(chunk);
        }
    }

    unsafe fn unlink_free(&mut self, chunk: NonNull<FreeChunk>) {
        // Safety: chunk is on the list matching its page count.
        unsafe {
            let bucket = bucket_of((*chunk.as_ptr()).header.pages);
            let prev = (*chunk.as_ptr()).prev_free;
            let next = (*chunk.as_ptr()).next_free;
            match prev {
                Some(prev) => (*prev.as_ptr()).next_free = next,
                None => self.free_lists[bucket] = next,
            }
            if let Some(next) = next {
                (*next.as_ptr()).prev_free = prev;
            }
        }
    }

    /// Bytes usable behind `ptr`.
    ///
    /// # Safety
    /// `ptr` must be a live allocation from this allocator.
    pub(crate) unsafe fn usable_size(ptr: NonNull<u8>) -> usize {
        // Safety: forwarded caller contract.
        let pages = unsafe { (*header_of(ptr).as_ptr()).pages };
        (pages << PAGE_SIZE_EXP) - BULK_HEADER_SIZE
    }

    fn blocks(&self) -> impl Iterator<Item = NonNull<BlockDescriptor>> + use<> {
        let mut cursor = self.blocks;
        std::iter::from_fn(move || {
            let desc = cursor?;
            // Safety: block descriptors are live until deinitialize.
            cursor = unsafe { desc.as_ref() }.next;
            Some(desc)
        })
    }

    /// Chunks of one block in address order.
    fn chunks(block: &BlockDescriptor) -> impl Iterator<Item = NonNull<ChunkHeader>> + use<> {
        let mut cursor = Some(block.base.cast::<ChunkHeader>());
        std::iter::from_fn(move || {
            let chunk = cursor?;
            // Safety: in-block links point at live headers.
            cursor = unsafe { chunk.as_ref() }.next_in_block;
            Some(chunk)
        })
    }

    /// Whether `ptr` may be freed: a used chunk start inside one of our
    /// blocks, or anything outside the blocks (direct chunks are not
    /// tracked individually).
    pub(crate) fn check_free(&self, ptr: usize) -> Result<(), Violation> {
        let header = ptr.wrapping_sub(BULK_HEADER_SIZE);
        for desc in self.blocks() {
            // Safety: block descriptors are live.
            let block = unsafe { desc.as_ref() };
            if !block.contains(header) {
                continue;
            }
            for chunk in Self::chunks(block) {
                // Safety: live header.
                let c = unsafe { chunk.as_ref() };
                let start = chunk.as_ptr() as usize;
                let end = start + (c.pages << PAGE_SIZE_EXP);
                if start == header {
                    return match c.state {
                        ChunkState::Used => Ok(()),
                        _ => Err(Violation::DoubleFree(ptr)),
                    };
                }
                if (start..end).contains(&header) {
                    return match c.state {
                        ChunkState::Free => Err(Violation::DoubleFree(ptr)),
                        _ => Err(Violation::ForeignPointer(ptr)),
                    };
                }
            }
            return Err(Violation::ForeignPointer(ptr));
        }
        Ok(())
    }

    /// Check block adjacency and free-list integrity.
    pub(crate) fn validate(&self) -> Result<(), Violation> {
        let mut free_in_blocks = 0;
        for desc in self.blocks() {
            // Safety: block descriptors are live.
            let block = unsafe { desc.as_ref() };
            let base = block.base.as_ptr() as usize;
            let mut covered = FixedBitSet::with_capacity(BULK_BLOCK_PAGES);
            let mut expected_prev: Option<NonNull<ChunkHeader>> = None;
            let mut prev_free = false;
            let mut total = 0;

            for chunk in Self::chunks(block) {
                // Safety: live header.
                let c = unsafe { chunk.as_ref() };
                let addr = chunk.as_ptr() as usize;
                let corrupt = |reason| Violation::CorruptBlock {
                    block: base,
                    chunk: addr,
                    reason,
                };
                if c.prev_in_block != expected_prev {
                    return Err(corrupt("back link does not match predecessor"));
                }
                if c.pages == 0 || c.state == ChunkState::Direct {
                    return Err(corrupt("invalid chunk header"));
                }
                let first_page = (addr - base) >> PAGE_SIZE_EXP;
                if first_page + c.pages > BULK_BLOCK_PAGES {
                    return Err(corrupt("chunk overruns block"));
                }
                for page in first_page..first_page + c.pages {
                    if covered.contains(page) {
                        return Err(corrupt("chunks overlap"));
                    }
                    covered.insert(page);
                }
                let free = c.state == ChunkState::Free;
                if free && prev_free {
                    return Err(corrupt("adjacent free chunks"));
                }
                if let Some(next) = c.next_in_block
                    && next.as_ptr() as usize != addr + (c.pages << PAGE_SIZE_EXP)
                {
                    return Err(corrupt("gap before next chunk"));
                }
                if free {
                    free_in_blocks += 1;
                }
                prev_free = free;
                total += c.pages;
                expected_prev = Some(chunk);
            }

            if total != BULK_BLOCK_PAGES || covered.count_ones(..) != BULK_BLOCK_PAGES {
                return Err(Violation::CorruptBlock {
                    block: base,
                    chunk: base,
                    reason: "page counts do not sum to block size",
                });
            }
        }

        let mut listed = 0;
        for (bucket, head) in self.free_lists.iter().enumerate() {
            let mut expected_prev = None;
            let mut cursor = *head;
            while let Some(chunk) = cursor {
                // Safety: free-list entries are live free chunks.
                let c = unsafe { chunk.as_ref() };
                let wrong_bucket = if bucket == OVERFLOW {
                    c.header.pages <= BULK_MAX_IN_BLOCK_PAGES
                } else {
                    c.header.pages != bucket + 1
                };
                if c.prev_free != expected_prev || c.header.state != ChunkState::Free || wrong_bucket {
                    return Err(Violation::CorruptBulkFreeList {
                        bucket,
                        addr: chunk.as_ptr() as usize,
                    });
                }
                listed += 1;
                expected_prev = Some(chunk);
                cursor = c.next_free;
            }
        }
        if listed != free_in_blocks {
            return Err(Violation::CorruptBulkFreeList {
                bucket: OVERFLOW,
                addr: 0,
            });
        }
        Ok(())
    }

    /// Give wholly free blocks back to the page cache.
    pub(crate) fn release_empty_blocks<V: VirtualMemoryProvider>(&mut self, cache: &mut PageCache<V>) {
        let mut prev: Option<NonNull<BlockDescriptor>> = None;
        let mut cursor = self.blocks;
        let mut released = 0;
        while let Some(desc) = cursor {
            // Safety: descriptors on the list are live.
            let block = unsafe { *desc.as_ptr() };
            cursor = block.next;
            let chunk = block.base.cast::<FreeChunk>();
            // Safety: every block starts with a chunk header.
            let header = unsafe { &(*chunk.as_ptr()).header };
            if header.state != ChunkState::Free || header.pages != BULK_BLOCK_PAGES {
                prev = Some(desc);
                continue;
            }
            // Safety: the block is one free chunk; nothing else points into it.
            unsafe {
                self.unlink_free(chunk);
                match prev {
                    Some(prev) => (*prev.as_ptr()).next = block.next,
                    None => self.blocks = block.next,
                }
                self.descriptors.release(desc);
                cache.free_chunk(block.base, BULK_BLOCK_SIZE);
            }
            self.block_count -= 1;
            released += 1;
        }
        if released > 0 {
            debug!("released {released} empty bulk blocks");
        }
    }

    /// Return every block and the descriptor pages. Direct chunks still
    /// live are not tracked and stay mapped.
    pub(crate) fn deinitialize<V: VirtualMemoryProvider>(&mut self, cache: &mut PageCache<V>) {
        debug_assert_eq!(self.descriptors.live(), self.block_count);
        let mut cursor = self.blocks.take();
        while let Some(desc) = cursor {
            // Safety: descriptors are live until the pool is torn down below.
            let block = unsafe { *desc.as_ptr() };
            cursor = block.next;
            // Safety: every pointer into the block dies with the heap.
            unsafe { cache.free_chunk(block.base, BULK_BLOCK_SIZE) };
        }
        self.descriptors.deinitialize(cache);
        if self.direct_live > 0 {
            warn!(
                "{} direct bulk allocations still live at teardown",
                self.direct_live
            );
        }
        self.free_lists = [None; BULK_MAX_IN_BLOCK_PAGES + 1];
        self.block_count = 0;
        self.direct_live = 0;
    }
}

#[cfg(all(test, not(loom)))]
mod tests {
    use super::*;
    use crate::memory::layout::page_offset;
    use crate::memory::page_cache::PageCacheConfig;
    use crate::memory::vm::testing::CountingVm;
    use rand::SeedableRng;
    use rand::seq::SliceRandom;
    use rand_chacha::ChaCha8Rng;

    fn setup() -> (PageCache<CountingVm>, BulkBlockAllocator) {
        CountingVm::reset();
        (
            PageCache::new(PageCacheConfig::default()),
            BulkBlockAllocator::new(),
        )
    }

    /// Usable bytes of a chunk spanning exactly `pages` pages.
    fn bytes_for_pages(pages: usize) -> usize {
        pages * PAGE_SIZE - BULK_HEADER_SIZE
    }

    fn layout(bulk: &BulkBlockAllocator) -> Vec<(usize, ChunkState)> {
        let desc = bulk.blocks().next().unwrap();
        // Safety: Test code.
        BulkBlockAllocator::chunks(unsafe { desc.as_ref() })
            .map(|c| {
                let c = unsafe { c.as_ref() };
                (c.pages, c.state)
            })
            .collect()
    }

    #[test]
    fn test_user_pointer_sits_after_header() {
        let (mut cache, mut bulk) = setup();
        let ptr = bulk.allocate(10_000, &mut cache).unwrap();
        assert_eq!(page_offset(ptr.as_ptr() as usize), BULK_HEADER_SIZE);
        assert_eq!(ptr.as_ptr() as usize % ALIGNMENT, 0);
        // Safety: Test code.
        unsafe {
            ptr.as_ptr().write_bytes(0x7E, 10_000);
            assert_eq!(BulkBlockAllocator::usable_size(ptr), bytes_for_pages(3));
        }
        assert_eq!(layout(&bulk), [(3, ChunkState::Used), (BULK_BLOCK_PAGES - 3, ChunkState::Free)]);
        bulk.validate().unwrap();
        bulk.deinitialize(&mut cache);
    }

    #[test]
    fn test_exact_bucket_reused_before_splitting() {
        let (mut cache, mut bulk) = setup();
        let a = bulk.allocate(bytes_for_pages(2), &mut cache).unwrap();
        let _b = bulk.allocate(bytes_for_pages(2), &mut cache).unwrap();
        // Safety: Test code.
        unsafe { bulk.deallocate(a, &mut cache) };
        bulk.validate().unwrap();
        assert!(bulk.free_lists[1].is_some());

        let c = bulk.allocate(bytes_for_pages(2), &mut cache).unwrap();
        assert_eq!(a, c);
        assert!(bulk.free_lists[1].is_none());
        bulk.validate().unwrap();
        bulk.deinitialize(&mut cache);
    }

    #[test]
    fn test_free_in_any_order_coalesces_to_one_chunk() {
        let (mut cache, mut bulk) = setup();
        let mut rng = ChaCha8Rng::seed_from_u64(0x5eed_b01c);
        let page_counts = [1, 4, 2, 7, 3, 1, 5, 2, 6, 1];
        let chunks: Vec<_> = page_counts
            .iter()
            .map(|&p| bulk.allocate(bytes_for_pages(p), &mut cache).unwrap())
            .collect();
        let fence = bulk.allocate(bytes_for_pages(1), &mut cache).unwrap();
        let total: usize = page_counts.iter().sum();

        let mut order: Vec<usize> = (0..chunks.len()).collect();
        order.shuffle(&mut rng);
        for i in order {
            // Safety: Test code.
            unsafe { bulk.deallocate(chunks[i], &mut cache) };
            bulk.validate().unwrap();
        }
        assert_eq!(
            layout(&bulk),
            [
                (total, ChunkState::Free),
                (1, ChunkState::Used),
                (BULK_BLOCK_PAGES - total - 1, ChunkState::Free),
            ]
        );

        // Dropping the fence folds the block back into a single chunk.
        // Safety: Test code.
        unsafe { bulk.deallocate(fence, &mut cache) };
        assert_eq!(layout(&bulk), [(BULK_BLOCK_PAGES, ChunkState::Free)]);
        bulk.validate().unwrap();
        bulk.deinitialize(&mut cache);
    }

    #[test]
    fn test_overflow_split_uses_smallest_chunk() {
        let (mut cache, mut bulk) = setup();
        let big = bytes_for_pages(32);
        let a1 = bulk.allocate(big, &mut cache).unwrap();
        let a2 = bulk.allocate(big, &mut cache).unwrap();
        let _b = bulk.allocate(bytes_for_pages(1), &mut cache).unwrap();
        let c: Vec<_> = (0..3).map(|_| bulk.allocate(big, &mut cache).unwrap()).collect();
        let _d = bulk.allocate(bytes_for_pages(1), &mut cache).unwrap();

        // Safety: Test code.
        unsafe {
            bulk.deallocate(a1, &mut cache);
            bulk.deallocate(a2, &mut cache);
            for p in c {
                bulk.deallocate(p, &mut cache);
            }
        }
        bulk.validate().unwrap();

        // Overflow now holds 64, 96 and the block tail; 64 wins.
        let small = bulk.allocate(bytes_for_pages(5), &mut cache).unwrap();
        assert_eq!(small, a1);
        bulk.validate().unwrap();
        bulk.deinitialize(&mut cache);
    }

    #[test]
    fn test_direct_allocation_is_never_cached() {
        let (mut cache, mut bulk) = setup();
        let ptr = bulk.allocate(9_000_000, &mut cache).unwrap();
        assert_eq!(bulk.block_count(), 0);
        assert_eq!(bulk.direct_live(), 1);
        assert_eq!(CountingVm::calls().allocate, 1);
        // Safety: Test code.
        unsafe {
            ptr.as_ptr().write_bytes(0x01, 9_000_000);
            bulk.deallocate(ptr, &mut cache);
        }
        assert_eq!(CountingVm::calls().deallocate, 1);
        assert_eq!(cache.cached_blocks(), 0);
        assert_eq!(bulk.direct_live(), 0);
        bulk.deinitialize(&mut cache);
    }

    #[test]
    fn test_threshold_boundary() {
        let (mut cache, mut bulk) = setup();
        let in_block = bulk.allocate(bytes_for_pages(BULK_MAX_IN_BLOCK_PAGES), &mut cache).unwrap();
        assert_eq!(bulk.block_count(), 1);
        let direct = bulk
            .allocate(bytes_for_pages(BULK_MAX_IN_BLOCK_PAGES) + 1, &mut cache)
            .unwrap();
        assert_eq!(bulk.direct_live(), 1);
        // Safety: Test code.
        unsafe {
            bulk.deallocate(in_block, &mut cache);
            bulk.deallocate(direct, &mut cache);
        }
        bulk.deinitialize(&mut cache);
    }

    #[test]
    fn test_release_empty_blocks() {
        let (mut cache, mut bulk) = setup();
        let a = bulk.allocate(bytes_for_pages(3), &mut cache).unwrap();
        bulk.release_empty_blocks(&mut cache);
        assert_eq!(bulk.block_count(), 1);

        // Safety: Test code.
        unsafe { bulk.deallocate(a, &mut cache) };
        bulk.release_empty_blocks(&mut cache);
        assert_eq!(bulk.block_count(), 0);
        assert!(bulk.free_lists.iter().all(Option::is_none));
        assert_eq!(CountingVm::calls().deallocate, 1);

        // A new request maps a fresh block.
        let b = bulk.allocate(bytes_for_pages(3), &mut cache).unwrap();
        assert_eq!(bulk.block_count(), 1);
        // Safety: Test code.
        unsafe { bulk.deallocate(b, &mut cache) };
        bulk.deinitialize(&mut cache);
    }

    #[test]
    fn test_check_free_reports_misuse() {
        let (mut cache, mut bulk) = setup();
        let a = bulk.allocate(bytes_for_pages(2), &mut cache).unwrap();
        let b = bulk.allocate(bytes_for_pages(2), &mut cache).unwrap();
        let addr = a.as_ptr() as usize;

        assert_eq!(bulk.check_free(addr), Ok(()));
        assert_eq!(bulk.check_free(addr + 64), Err(Violation::ForeignPointer(addr + 64)));

        // Safety: Test code.
        unsafe { bulk.deallocate(a, &mut cache) };
        assert_eq!(bulk.check_free(addr), Err(Violation::DoubleFree(addr)));

        // Freed into its neighbour: the header is now inside a free chunk.
        // Safety: Test code.
        unsafe { bulk.deallocate(b, &mut cache) };
        let b_addr = b.as_ptr() as usize;
        assert_eq!(bulk.check_free(b_addr), Err(Violation::DoubleFree(b_addr)));
        bulk.deinitialize(&mut cache);
    }

    #[test]
    fn test_validate_detects_broken_page_count() {
        let (mut cache, mut bulk) = setup();
        let a = bulk.allocate(bytes_for_pages(4), &mut cache).unwrap();
        // Safety: Test code; corrupt the header on purpose.
        unsafe { (*header_of(a).as_ptr()).pages = 5 };
        assert!(matches!(bulk.validate(), Err(Violation::CorruptBlock { .. })));
        // Safety: Test code; restore before teardown.
        unsafe { (*header_of(a).as_ptr()).pages = 4 };
        bulk.validate().unwrap();
        bulk.deinitialize(&mut cache);
    }
}
