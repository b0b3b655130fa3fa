//! Small committed-block cache in front of the VM provider.
//!
//! Blocks of 1..=`MAX_CACHED_PAGES` pages are kept on per-page-count
//! intrusive lists (the link lives in the block's first word), so a burst of
//! frees followed by a burst of allocations of the same shape costs no
//! syscalls. List lengths are capped: `single_page_limit` for one-page
//! blocks, `multi_page_limit` for everything else. Blocks beyond the cap,
//! and blocks larger than `MAX_CACHED_PAGES`, go straight back to the OS.
//!
//! A cached multi-page block only keeps its first page committed; the tail
//! is decommitted on insert and recommitted on reuse.
//!
//! The cache also fronts raw reserve/commit/release for the page source so
//! that all OS traffic of a heap is accounted in one [`PageStats`].

use std::marker::PhantomData;
use std::ptr::NonNull;

use log::{trace, warn};

use super::layout::{MAX_CACHED_PAGES, PAGE_SIZE, PAGE_SIZE_EXP};
use super::stats::{PAGE_CACHE_CACHED, PageStats, TOTAL_COMMITTED, TOTAL_RESERVED};
use super::vm::{VirtualMemoryProvider, VmError};

#[derive(Clone, Debug)]
pub struct PageCacheConfig {
    /// Maximum one-page blocks kept.
    pub single_page_limit: usize,
    /// Maximum blocks kept per multi-page size.
    pub multi_page_limit: usize,
}

impl Default for PageCacheConfig {
    fn default() -> Self {
        Self {
            single_page_limit: 32,
            multi_page_limit: 4,
        }
    }
}

struct CachedBlock {
    next: Option<NonNull<CachedBlock>>,
}

pub(crate) struct PageCache<V: VirtualMemoryProvider> {
    config: PageCacheConfig,
    // index = page count - 1
    heads: [Option<NonNull<CachedBlock>>; MAX_CACHED_PAGES],
    lens: [usize; MAX_CACHED_PAGES],
    stats: PageStats,
    _vm: PhantomData<V>,
}

impl<V: VirtualMemoryProvider> PageCache<V> {
    pub(crate) fn new(config: PageCacheConfig) -> Self {
        Self {
            config,
            heads: [None; MAX_CACHED_PAGES],
            lens: [0; MAX_CACHED_PAGES],
            stats: PageStats::default(),
            _vm: PhantomData,
        }
    }

    pub(crate) fn stats(&self) -> PageStats {
        self.stats
    }

    pub(crate) fn cached_blocks(&self) -> usize {
        self.lens.iter().sum()
    }

    fn limit(&self, pages: usize) -> usize {
        if pages == 1 {
            self.config.single_page_limit
        } else {
            self.config.multi_page_limit
        }
    }

    /// Committed, page-aligned block of `size` bytes, from the cache when one
    /// of the same page count is parked there.
    pub(crate) fn get_free_block(&mut self, size: usize) -> Result<NonNull<u8>, VmError> {
        debug_assert!(size != 0 && size.is_multiple_of(PAGE_SIZE), "unaligned block size {size}");
        let pages = size >> PAGE_SIZE_EXP;
        if pages <= MAX_CACHED_PAGES {
            if let Some(block) = self.pop(pages) {
                if pages > 1 {
                    // Safety: the block tail belongs to a mapping we own.
                    let tail = unsafe { NonNull::new_unchecked(block.as_ptr().add(PAGE_SIZE)) };
                    // Safety: tail lies inside the cached block.
                    if let Err(e) = unsafe { self.commit(tail, size - PAGE_SIZE) } {
                        // Safety: block is ours and was just unlinked.
                        unsafe { self.release_cached(block, pages) };
                        return Err(e);
                    }
                }
                self.stats.cache_hits += 1;
                trace!("page cache hit: {pages} pages");
                return Ok(block);
            }
            self.stats.cache_misses += 1;
        }
        self.get_free_block_no_cache(size)
    }

    /// Return a block obtained from [`get_free_block`](Self::get_free_block).
    ///
    /// # Safety
    /// `ptr` must come from this cache with the same `size` and must not be
    /// used afterwards.
    pub(crate) unsafe fn free_chunk(&mut self, ptr: NonNull<u8>, size: usize) {
        debug_assert!(size != 0 && size.is_multiple_of(PAGE_SIZE), "unaligned block size {size}");
        let pages = size >> PAGE_SIZE_EXP;
        if pages <= MAX_CACHED_PAGES && self.lens[pages - 1] < self.limit(pages) {
            if pages > 1 {
                // Safety: tail lies inside the block being cached.
                let tail = unsafe { NonNull::new_unchecked(ptr.as_ptr().add(PAGE_SIZE)) };
                // Safety: same range; the caller gave up the block.
                if let Err(e) = unsafe { V::decommit(tail, size - PAGE_SIZE) } {
                    warn!("page cache decommit of {size} bytes failed: {e}; releasing");
                    // Safety: forwarded caller contract.
                    unsafe { self.free_chunk_no_cache(ptr, size) };
                    return;
                }
                self.stats.decommit_count += 1;
                TOTAL_COMMITTED.sub(size - PAGE_SIZE);
            }
            // Safety: first page is committed and exclusively ours now.
            unsafe { self.push(ptr, pages) };
            PAGE_CACHE_CACHED.add(size);
            return;
        }
        // Safety: forwarded caller contract.
        unsafe { self.free_chunk_no_cache(ptr, size) };
    }

    /// Committed block straight from the OS, never cached.
    pub(crate) fn get_free_block_no_cache(&mut self, size: usize) -> Result<NonNull<u8>, VmError> {
        // Safety: size is non-zero (checked by callers).
        let block = unsafe { V::allocate(size)? };
        self.stats.sys_alloc_count += 1;
        self.stats.sys_alloc_bytes += size;
        TOTAL_RESERVED.add(size);
        TOTAL_COMMITTED.add(size);
        Ok(block)
    }

    /// # Safety
    /// `ptr`/`size` must describe a block from
    /// [`get_free_block_no_cache`](Self::get_free_block_no_cache) or
    /// [`get_free_block`](Self::get_free_block).
    pub(crate) unsafe fn free_chunk_no_cache(&mut self, ptr: NonNull<u8>, size: usize) {
        // Safety: forwarded caller contract.
        if let Err(e) = unsafe { V::deallocate(ptr, size) } {
            warn!("release of {size} bytes at {ptr:p} failed: {e}");
            return;
        }
        self.stats.sys_dealloc_count += 1;
        self.stats.sys_dealloc_bytes += size;
        TOTAL_RESERVED.sub(size);
        TOTAL_COMMITTED.sub(size);
    }

    /// Reserve address space with no access rights.
    pub(crate) fn reserve(&mut self, size: usize) -> Result<NonNull<u8>, VmError> {
        // Safety: size is a non-zero constant at every call site.
        let ptr = unsafe { V::reserve(size)? };
        self.stats.reserve_count += 1;
        self.stats.reserved_bytes += size;
        TOTAL_RESERVED.add(size);
        Ok(ptr)
    }

    /// # Safety
    /// The range must lie inside a reservation made through this cache.
    pub(crate) unsafe fn commit(&mut self, ptr: NonNull<u8>, size: usize) -> Result<(), VmError> {
        // Safety: forwarded caller contract.
        unsafe { V::commit(ptr, size)? };
        self.stats.commit_count += 1;
        self.stats.committed_bytes += size;
        TOTAL_COMMITTED.add(size);
        Ok(())
    }

    /// # Safety
    /// The range must be committed, unused, and lie inside a reservation
    /// made through this cache.
    pub(crate) unsafe fn decommit(&mut self, ptr: NonNull<u8>, size: usize) -> Result<(), VmError> {
        // Safety: forwarded caller contract.
        unsafe { V::decommit(ptr, size)? };
        self.stats.decommit_count += 1;
        TOTAL_COMMITTED.sub(size);
        Ok(())
    }

    /// Release a reservation of which `committed` bytes had been committed.
    ///
    /// # Safety
    /// `ptr`/`size` must be a reservation from [`reserve`](Self::reserve); no
    /// pointer into it may be used afterwards.
    pub(crate) unsafe fn release(&mut self, ptr: NonNull<u8>, size: usize, committed: usize) {
        // Safety: forwarded caller contract.
        if let Err(e) = unsafe { V::release(ptr, size) } {
            warn!("release of region {ptr:p} failed: {e}");
            return;
        }
        self.stats.release_count += 1;
        TOTAL_RESERVED.sub(size);
        TOTAL_COMMITTED.sub(committed);
    }

    /// Hand every cached block back to the OS.
    pub(crate) fn trim(&mut self) {
        let before = self.cached_blocks();
        for pages in 1..=MAX_CACHED_PAGES {
            while let Some(block) = self.pop(pages) {
                // Safety: cached blocks are exclusively owned by the cache.
                unsafe { self.release_cached(block, pages) };
            }
        }
        if before > 0 {
            trace!("page cache trimmed {before} blocks");
        }
    }

    /// Release a block that was unlinked from a cache list. Only its first
    /// page is still committed.
    unsafe fn release_cached(&mut self, block: NonNull<u8>, pages: usize) {
        let size = pages << PAGE_SIZE_EXP;
        // Safety: block came from `V::allocate(size)`.
        if let Err(e) = unsafe { V::deallocate(block, size) } {
            warn!("release of cached block {block:p} failed: {e}");
            return;
        }
        self.stats.sys_dealloc_count += 1;
        self.stats.sys_dealloc_bytes += size;
        TOTAL_RESERVED.sub(size);
        TOTAL_COMMITTED.sub(PAGE_SIZE);
    }

    unsafe fn push(&mut self, ptr: NonNull<u8>, pages: usize) {
        let node = ptr.cast::<CachedBlock>();
        // Safety: the first page of the block is committed and unused.
        unsafe {
            node.as_ptr().write(CachedBlock {
                next: self.heads[pages - 1],
            })
        };
        self.heads[pages - 1] = Some(node);
        self.lens[pages - 1] += 1;
    }

    fn pop(&mut self, pages: usize) -> Option<NonNull<u8>> {
        let node = self.heads[pages - 1]?;
        // Safety: every node on the list was written by `push`.
        self.heads[pages - 1] = unsafe { node.as_ref().next };
        self.lens[pages - 1] -= 1;
        PAGE_CACHE_CACHED.sub(pages << PAGE_SIZE_EXP);
        Some(node.cast())
    }
}

impl<V: VirtualMemoryProvider> Drop for PageCache<V> {
    fn drop(&mut self) {
        self.trim();
    }
}
