//! Fixed-size record pool for heap metadata.
//!
//! Region and bulk block descriptors cannot come from the heap they describe,
//! so they live on dedicated pages taken from the page cache. Each page
//! starts with a link to the next pool page; the rest is carved into slots
//! that are either a live record or a free-list link. Pages are only handed
//! back when the pool is torn down.

use std::marker::PhantomData;
use std::mem::{align_of, size_of};
use std::ptr::NonNull;

use super::layout::{PAGE_SIZE, align_up};
use super::page_cache::PageCache;
use super::vm::{VirtualMemoryProvider, VmError};

struct PoolPage {
    next: Option<NonNull<PoolPage>>,
}

#[repr(C)]
union Slot<T: Copy> {
    #[allow(dead_code)]
    item: T,
    next_free: Option<NonNull<Slot<T>>>,
}

pub(crate) struct PagePool<T: Copy> {
    pages: Option<NonNull<PoolPage>>,
    free: Option<NonNull<Slot<T>>>,
    page_count: usize,
    live: usize,
    _marker: PhantomData<T>,
}

impl<T: Copy> PagePool<T> {
    const FIRST_SLOT: usize = align_up(size_of::<PoolPage>(), align_of::<Slot<T>>());
    const SLOTS_PER_PAGE: usize = (PAGE_SIZE - Self::FIRST_SLOT) / size_of::<Slot<T>>();

    pub(crate) const fn new() -> Self {
        Self {
            pages: None,
            free: None,
            page_count: 0,
            live: 0,
            _marker: PhantomData,
        }
    }

    pub(crate) fn live(&self) -> usize {
        self.live
    }

    pub(crate) fn page_count(&self) -> usize {
        self.page_count
    }

    /// Store `value` in a free slot, taking a new page if none is left.
    pub(crate) fn create<V: VirtualMemoryProvider>(
        &mut self,
        value: T,
        cache: &mut PageCache<V>,
    ) -> Result<NonNull<T>, VmError> {
        const { assert!(Self::SLOTS_PER_PAGE > 0, "record does not fit a pool page") };
        let slot = match self.free {
            Some(slot) => slot,
            None => self.add_page(cache)?,
        };
        // Safety: slots on the free list hold a valid `next_free` link.
        self.free = unsafe { slot.as_ref().next_free };
        let item = slot.cast::<T>();
        // Safety: the slot is exclusively ours and sized/aligned for T.
        unsafe { item.as_ptr().write(value) };
        self.live += 1;
        Ok(item)
    }

    /// Put a record's slot back on the free list.
    ///
    /// # Safety
    /// `item` must come from [`create`](Self::create) on this pool and must
    /// not be used afterwards.
    pub(crate) unsafe fn release(&mut self, item: NonNull<T>) {
        debug_assert!(self.live > 0);
        let slot = item.cast::<Slot<T>>();
        // Safety: caller guarantees the slot belongs to this pool.
        unsafe {
            slot.as_ptr().write(Slot {
                next_free: self.free,
            })
        };
        self.free = Some(slot);
        self.live -= 1;
    }

    /// Carve a fresh page into free slots; returns the new free-list head.
    fn add_page<V: VirtualMemoryProvider>(
        &mut self,
        cache: &mut PageCache<V>,
    ) -> Result<NonNull<Slot<T>>, VmError> {
        debug_assert!(self.free.is_none());
        let page = cache.get_free_block(PAGE_SIZE)?;
        // Safety: the page is committed, page-aligned and exclusively ours.
        let head = unsafe {
            page.cast::<PoolPage>().as_ptr().write(PoolPage { next: self.pages });
            let first = page.as_ptr().add(Self::FIRST_SLOT).cast::<Slot<T>>();
            // Thread slots back to front so the lowest address is handed out first.
            let mut next_free = None;
            for i in (0..Self::SLOTS_PER_PAGE).rev() {
                let slot = first.add(i);
                slot.write(Slot { next_free });
                next_free = Some(NonNull::new_unchecked(slot));
            }
            NonNull::new_unchecked(first)
        };
        self.free = Some(head);
        self.pages = Some(page.cast());
        self.page_count += 1;
        Ok(head)
    }

    /// Return every page to the cache. Records still live are dropped
    /// without notice.
    pub(crate) fn deinitialize<V: VirtualMemoryProvider>(&mut self, cache: &mut PageCache<V>) {
        let mut cursor = self.pages.take();
        while let Some(page) = cursor {
            // Safety: pool pages start with a PoolPage header.
            cursor = unsafe { page.as_ref().next };
            // Safety: the page came from `cache.get_free_block(PAGE_SIZE)`.
            unsafe { cache.free_chunk(page.cast(), PAGE_SIZE) };
        }
        self.free = None;
        self.page_count = 0;
        self.live = 0;
    }
}

#[cfg(all(test, not(loom)))]
mod tests {
    use super::*;
    use crate::memory::page_cache::PageCacheConfig;
    use crate::memory::vm::testing::CountingVm;

    #[derive(Clone, Copy, Debug, PartialEq)]
    struct Record {
        id: usize,
        payload: [u64; 5],
    }

    #[test]
    fn test_fills_page_then_grows() {
        CountingVm::reset();
        let mut cache = PageCache::<CountingVm>::new(PageCacheConfig::default());
        let mut pool = PagePool::<Record>::new();
        let per_page = PagePool::<Record>::SLOTS_PER_PAGE;

        let mut items = Vec::new();
        for id in 0..=per_page {
            let item = pool
                .create(Record { id, payload: [id as u64; 5] }, &mut cache)
                .unwrap();
            items.push(item);
        }
        assert_eq!(pool.page_count(), 2);
        assert_eq!(pool.live(), per_page + 1);
        for (id, item) in items.iter().enumerate() {
            // Safety: Test code.
            assert_eq!(unsafe { item.as_ref() }.id, id);
        }

        pool.deinitialize(&mut cache);
        assert_eq!(cache.cached_blocks(), 2);
    }

    #[test]
    fn test_released_slot_is_reused() {
        let mut cache = PageCache::<CountingVm>::new(PageCacheConfig::default());
        let mut pool = PagePool::<Record>::new();
        let a = pool.create(Record { id: 1, payload: [0; 5] }, &mut cache).unwrap();
        let _b = pool.create(Record { id: 2, payload: [0; 5] }, &mut cache).unwrap();
        // Safety: Test code.
        unsafe { pool.release(a) };
        let c = pool.create(Record { id: 3, payload: [0; 5] }, &mut cache).unwrap();
        assert_eq!(a, c);
        assert_eq!(pool.live(), 2);
        assert_eq!(pool.page_count(), 1);
        pool.deinitialize(&mut cache);
    }

    #[test]
    fn test_slots_do_not_overlap_page_header() {
        let mut cache = PageCache::<CountingVm>::new(PageCacheConfig::default());
        let mut pool = PagePool::<Record>::new();
        let first = pool.create(Record { id: 0, payload: [0; 5] }, &mut cache).unwrap();
        let addr = first.as_ptr() as usize;
        assert_eq!(addr % PAGE_SIZE, PagePool::<Record>::FIRST_SLOT);
        assert_eq!(addr % align_of::<Record>(), 0);
        pool.deinitialize(&mut cache);
    }
}
