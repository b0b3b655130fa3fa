//! Address-indexed ("sounding") page source.
//!
//! Every region is an 8 MiB reservation viewed as 64 buckets of 32 pages.
//! Bucket `i` of every region only ever serves size class `i`, and the bucket
//! a page belongs to is a pure function of the page's address:
//!
//! ```text
//!   page number = addr >> 12
//!   bucket      = (page number mod 2048) >> 5
//! ```
//!
//! The OS does not hand out 8 MiB-aligned reservations, so the bucket grid is
//! anchored to the 8 MiB-aligned window containing the base and the part of
//! the grid that falls below the base is wrapped to the top of the
//! reservation (see [`idx_to_page_addr`]). A bucket is therefore at most two
//! contiguous runs of pages per region.
//!
//! Pages are committed 16 at a time as a bucket is consumed. Regions are
//! appended to a list shared by all classes; a class that exhausts its bucket
//! in one region moves on to the next region in the list, reserving a new one
//! only when it is already at the tail. Regions are released all at once in
//! [`AddressIndexedPageSource::deinitialize`].

use std::ptr::NonNull;

use log::{debug, trace, warn};

use super::error::HeapError;
use super::layout::{
    BUCKET_COUNT, COMMIT_PAGE_COUNT, MULTIPAGE_PAGE_COUNT, PAGE_SIZE, PAGE_SIZE_EXP,
    PAGES_PER_BUCKET, PAGES_PER_BUCKET_EXP, REGION_PAGE_BITS, RESERVATION_SIZE,
};
use super::page_cache::PageCache;
use super::page_pool::PagePool;
use super::vm::VirtualMemoryProvider;

/// Bucket (and therefore size class) that owns `addr`.
#[inline]
pub fn address_to_idx(addr: usize) -> usize {
    let page = addr >> PAGE_SIZE_EXP;
    (page & ((1 << REGION_PAGE_BITS) - 1)) >> PAGES_PER_BUCKET_EXP
}

/// Address of page `page_in_bucket` of bucket `idx` in the region reserved at
/// `base`.
pub fn idx_to_page_addr(base: usize, idx: usize, page_in_bucket: usize) -> usize {
    debug_assert!(idx < BUCKET_COUNT && page_in_bucket < PAGES_PER_BUCKET);
    let starting_page = base >> PAGE_SIZE_EXP;
    let window_first_page = (starting_page >> REGION_PAGE_BITS) << REGION_PAGE_BITS;
    let base_offset = starting_page - window_first_page;
    let target = (idx << PAGES_PER_BUCKET_EXP) + page_in_bucket;
    // Grid pages below the base live in the next window instead.
    let wrap = if target < base_offset { 1 << REGION_PAGE_BITS } else { 0 };
    let addr = (window_first_page + target + wrap) << PAGE_SIZE_EXP;

    debug_assert_eq!(address_to_idx(addr), idx);
    debug_assert!(addr >= base && addr < base + RESERVATION_SIZE);
    addr
}

#[derive(Clone, Copy)]
pub(crate) struct RegionDescriptor {
    next: Option<NonNull<RegionDescriptor>>,
    base: NonNull<u8>,
    next_to_use: [u16; BUCKET_COUNT],
    next_to_commit: [u16; BUCKET_COUNT],
}

impl RegionDescriptor {
    /// Head of the region list. Every bucket reads as exhausted, so the
    /// first request of each class moves past it.
    fn sentinel() -> Self {
        Self {
            next: None,
            base: NonNull::dangling(),
            next_to_use: [PAGES_PER_BUCKET as u16; BUCKET_COUNT],
            next_to_commit: [PAGES_PER_BUCKET as u16; BUCKET_COUNT],
        }
    }

    fn contains(&self, addr: usize) -> bool {
        let base = self.base.as_ptr() as usize;
        addr >= base && addr < base + RESERVATION_SIZE
    }

    fn committed_bytes(&self) -> usize {
        self.next_to_commit.iter().map(|&c| usize::from(c)).sum::<usize>() << PAGE_SIZE_EXP
    }

    fn page_ptr(&self, idx: usize, page_in_bucket: usize) -> NonNull<u8> {
        let base = self.base.as_ptr() as usize;
        let addr = idx_to_page_addr(base, idx, page_in_bucket);
        // Safety: idx_to_page_addr stays inside [base, base + RESERVATION_SIZE).
        unsafe { self.base.add(addr - base) }
    }
}

/// A run of contiguous committed pages.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) struct Span {
    pub start: NonNull<u8>,
    pub pages: usize,
}

impl Span {
    pub(crate) fn addr(&self) -> usize {
        self.start.as_ptr() as usize
    }

    pub(crate) fn len(&self) -> usize {
        self.pages << PAGE_SIZE_EXP
    }

    fn end(&self) -> usize {
        self.addr() + self.len()
    }
}

/// Pages handed out by one [`AddressIndexedPageSource::get_multipage`] call,
/// merged into contiguous spans in the order they were obtained. Usually one
/// span, two when the request crosses a bucket's wrap point.
pub(crate) struct Multipage {
    spans: [Span; MULTIPAGE_PAGE_COUNT],
    len: usize,
}

impl Multipage {
    fn new(first: NonNull<u8>) -> Self {
        Self {
            spans: [Span { start: first, pages: 1 }; MULTIPAGE_PAGE_COUNT],
            len: 1,
        }
    }

    fn push_page(&mut self, page: NonNull<u8>) {
        let last = &mut self.spans[self.len - 1];
        if last.end() == page.as_ptr() as usize {
            last.pages += 1;
        } else {
            self.spans[self.len] = Span { start: page, pages: 1 };
            self.len += 1;
        }
    }

    pub(crate) fn spans(&self) -> &[Span] {
        &self.spans[..self.len]
    }

    pub(crate) fn total_pages(&self) -> usize {
        self.spans().iter().map(|s| s.pages).sum()
    }
}

pub(crate) struct AddressIndexedPageSource {
    descriptors: PagePool<RegionDescriptor>,
    first: NonNull<RegionDescriptor>,
    last: NonNull<RegionDescriptor>,
    // Region each class is currently consuming.
    index_head: [NonNull<RegionDescriptor>; BUCKET_COUNT],
    regions: usize,
}

impl AddressIndexedPageSource {
    /// Set up the region list. No region is reserved until the first page
    /// request.
    pub(crate) fn new<V: VirtualMemoryProvider>(cache: &mut PageCache<V>) -> Result<Self, HeapError> {
        let mut descriptors = PagePool::new();
        let first = descriptors
            .create(RegionDescriptor::sentinel(), cache)
            .map_err(HeapError::out_of_memory(PAGE_SIZE))?;
        Ok(Self {
            descriptors,
            first,
            last: first,
            index_head: [first; BUCKET_COUNT],
            regions: 0,
        })
    }

    pub(crate) fn regions(&self) -> usize {
        self.regions
    }

    /// A committed page of bucket `idx`.
    pub(crate) fn get_page<V: VirtualMemoryProvider>(
        &mut self,
        idx: usize,
        cache: &mut PageCache<V>,
    ) -> Result<NonNull<u8>, HeapError> {
        debug_assert!(idx < BUCKET_COUNT);
        loop {
            // Safety: descriptors stay valid until deinitialize, which
            // consumes self.
            let desc = unsafe { self.index_head[idx].as_mut() };
            let next_to_use = usize::from(desc.next_to_use[idx]);
            if next_to_use < PAGES_PER_BUCKET {
                if desc.next_to_use[idx] == desc.next_to_commit[idx] {
                    commit_pages(cache, desc, idx, next_to_use)?;
                    desc.next_to_commit[idx] += COMMIT_PAGE_COUNT as u16;
                }
                desc.next_to_use[idx] += 1;
                return Ok(desc.page_ptr(idx, next_to_use));
            }

            let next = match desc.next {
                Some(next) => next,
                None => self.add_region(idx, cache)?,
            };
            self.index_head[idx] = next;
        }
    }

    /// `MULTIPAGE_PAGE_COUNT` committed pages of bucket `idx`, merged into
    /// contiguous spans.
    pub(crate) fn get_multipage<V: VirtualMemoryProvider>(
        &mut self,
        idx: usize,
        cache: &mut PageCache<V>,
    ) -> Result<Multipage, HeapError> {
        let mut multipage = Multipage::new(self.get_page(idx, cache)?);
        for _ in 1..MULTIPAGE_PAGE_COUNT {
            let page = self.get_page(idx, cache)?;
            multipage.push_page(page);
        }
        debug_assert_eq!(multipage.total_pages(), MULTIPAGE_PAGE_COUNT);
        Ok(multipage)
    }

    /// Reserve a region, commit the first batch of bucket `idx` and append
    /// it to the list. Nothing is registered unless both steps succeed.
    fn add_region<V: VirtualMemoryProvider>(
        &mut self,
        idx: usize,
        cache: &mut PageCache<V>,
    ) -> Result<NonNull<RegionDescriptor>, HeapError> {
        let base = cache
            .reserve(RESERVATION_SIZE)
            .map_err(HeapError::out_of_memory(RESERVATION_SIZE))?;
        let mut desc = RegionDescriptor {
            next: None,
            base,
            next_to_use: [0; BUCKET_COUNT],
            next_to_commit: [0; BUCKET_COUNT],
        };

        if let Err(e) = commit_pages(cache, &desc, idx, 0) {
            // Safety: the reservation was never published.
            unsafe { cache.release(base, RESERVATION_SIZE, 0) };
            return Err(e);
        }
        desc.next_to_commit[idx] = COMMIT_PAGE_COUNT as u16;

        let region = match self.descriptors.create(desc, cache) {
            Ok(region) => region,
            Err(e) => {
                // Safety: the reservation was never published.
                unsafe { cache.release(base, RESERVATION_SIZE, desc.committed_bytes()) };
                return Err(HeapError::out_of_memory(PAGE_SIZE)(e));
            }
        };
        // Safety: `last` is a live descriptor.
        unsafe { self.last.as_mut().next = Some(region) };
        self.last = region;
        self.regions += 1;
        debug!(
            "region #{} reserved at {base:p} (first used by class {idx})",
            self.regions
        );
        Ok(region)
    }

    /// Whether `addr` is the start of a `slot_size` slot carved from a
    /// multipage of bucket `idx` that has been handed out. `addr` must map
    /// to bucket `idx`.
    pub(crate) fn is_slot_start(&self, addr: usize, idx: usize, slot_size: usize) -> bool {
        debug_assert_eq!(address_to_idx(addr), idx);
        let Some(desc) = self.iter().find(|desc| desc.contains(addr)) else {
            return false;
        };
        let page = (addr >> PAGE_SIZE_EXP) & (PAGES_PER_BUCKET - 1);
        if page >= usize::from(desc.next_to_use[idx]) {
            return false;
        }
        // Buckets are consumed a whole multipage at a time, so every
        // multipage is an aligned group of a bucket's pages.
        let group = page & !(MULTIPAGE_PAGE_COUNT - 1);
        runs(desc, idx, group, MULTIPAGE_PAGE_COUNT)
            .find(|run| addr >= run.addr() && addr < run.end())
            .is_some_and(|run| {
                let offset = addr - run.addr();
                offset.is_multiple_of(slot_size) && offset + slot_size <= run.len()
            })
    }

    /// Whether `addr` lies in one of this source's regions.
    pub(crate) fn owns(&self, addr: usize) -> bool {
        self.iter().any(|desc| desc.contains(addr))
    }

    fn iter(&self) -> impl Iterator<Item = &RegionDescriptor> {
        // Safety: the sentinel is live until deinitialize.
        let mut cursor = unsafe { self.first.as_ref().next };
        std::iter::from_fn(move || {
            let desc = cursor?;
            // Safety: list nodes are live descriptors.
            let desc = unsafe { desc.as_ref() };
            cursor = desc.next;
            Some(desc)
        })
    }

    /// Release every region and the descriptor pages.
    pub(crate) fn deinitialize<V: VirtualMemoryProvider>(mut self, cache: &mut PageCache<V>) {
        // Safety: the sentinel is live until the pool is torn down below.
        let mut cursor = unsafe { self.first.as_ref().next };
        while let Some(desc) = cursor {
            // Safety: list nodes are live descriptors.
            let desc = unsafe { desc.as_ref() };
            cursor = desc.next;
            // Safety: the region was reserved through `cache` and every
            // pointer into it is dead once the heap is deinitialized.
            unsafe { cache.release(desc.base, RESERVATION_SIZE, desc.committed_bytes()) };
        }
        trace!(
            "released {} regions and {} descriptor pages",
            self.regions,
            self.descriptors.page_count()
        );
        self.descriptors.deinitialize(cache);
    }
}

/// Pages `first_page..first_page + pages` of bucket `idx`, merged into
/// contiguous runs.
fn runs(
    desc: &RegionDescriptor,
    idx: usize,
    first_page: usize,
    pages: usize,
) -> impl Iterator<Item = Span> + '_ {
    let end = first_page + pages;
    let mut page = first_page;
    std::iter::from_fn(move || {
        if page >= end {
            return None;
        }
        let mut run = Span {
            start: desc.page_ptr(idx, page),
            pages: 1,
        };
        page += 1;
        while page < end && desc.page_ptr(idx, page).as_ptr() as usize == run.end() {
            run.pages += 1;
            page += 1;
        }
        Some(run)
    })
}

/// Commit one batch of bucket `idx` starting at `first_page`, one commit per
/// contiguous run. On failure the runs already committed are decommitted
/// again, so the batch is either fully committed or not at all.
fn commit_pages<V: VirtualMemoryProvider>(
    cache: &mut PageCache<V>,
    desc: &RegionDescriptor,
    idx: usize,
    first_page: usize,
) -> Result<(), HeapError> {
    let mut done = 0;
    for run in runs(desc, idx, first_page, COMMIT_PAGE_COUNT) {
        // Safety: the run lies inside a region reserved through `cache`.
        if let Err(e) = unsafe { cache.commit(run.start, run.len()) } {
            for committed in runs(desc, idx, first_page, done) {
                // Safety: committed just above and never handed out.
                if let Err(e) = unsafe { cache.decommit(committed.start, committed.len()) } {
                    warn!(
                        "rollback of {} pages at {:p} failed: {e}",
                        committed.pages, committed.start
                    );
                }
            }
            return Err(HeapError::out_of_memory(run.len())(e));
        }
        done += run.pages;
    }
    Ok(())
}

#[cfg(all(test, not(loom)))]
mod tests {
    use super::*;
    use crate::memory::page_cache::PageCacheConfig;
    use crate::memory::vm::testing::CountingVm;
    use std::collections::HashSet;

    fn setup() -> (PageCache<CountingVm>, AddressIndexedPageSource) {
        CountingVm::reset();
        let mut cache = PageCache::new(PageCacheConfig::default());
        let source = AddressIndexedPageSource::new(&mut cache).unwrap();
        (cache, source)
    }

    #[test]
    fn test_grid_covers_reservation_for_any_base() {
        let window = RESERVATION_SIZE;
        let bases = [
            16 * window,
            16 * window + 5 * PAGE_SIZE,
            16 * window + 1000 * PAGE_SIZE,
            16 * window + 2047 * PAGE_SIZE,
            0x7f12_3456_7000,
        ];
        for base in bases {
            let mut seen = HashSet::new();
            for idx in 0..BUCKET_COUNT {
                for page in 0..PAGES_PER_BUCKET {
                    let addr = idx_to_page_addr(base, idx, page);
                    assert_eq!(address_to_idx(addr), idx);
                    assert!(addr >= base && addr < base + RESERVATION_SIZE);
                    assert_eq!(addr % PAGE_SIZE, 0);
                    assert!(seen.insert(addr), "page {addr:#x} handed out twice");
                }
            }
            assert_eq!(seen.len(), RESERVATION_SIZE / PAGE_SIZE);
        }
    }

    #[test]
    fn test_bucket_has_at_most_one_discontinuity() {
        let base = 3 * RESERVATION_SIZE + 77 * PAGE_SIZE;
        for idx in 0..BUCKET_COUNT {
            let breaks = (1..PAGES_PER_BUCKET)
                .filter(|&p| {
                    idx_to_page_addr(base, idx, p) != idx_to_page_addr(base, idx, p - 1) + PAGE_SIZE
                })
                .count();
            assert!(breaks <= 1, "bucket {idx} has {breaks} breaks");
        }
    }

    #[test]
    fn test_pages_encode_their_class() {
        let (mut cache, mut source) = setup();
        for idx in [0, 1, 7, 17, 63] {
            for _ in 0..PAGES_PER_BUCKET + 3 {
                let page = source.get_page(idx, &mut cache).unwrap();
                assert_eq!(address_to_idx(page.as_ptr() as usize), idx);
                // Safety: Test code; page is committed.
                unsafe { page.as_ptr().write_bytes(0xEE, PAGE_SIZE) };
            }
        }
        source.deinitialize(&mut cache);
    }

    #[test]
    fn test_commits_in_batches() {
        let (mut cache, mut source) = setup();
        source.get_page(4, &mut cache).unwrap();
        assert_eq!(CountingVm::calls().reserve, 1);
        assert_eq!(cache.stats().committed_bytes, COMMIT_PAGE_COUNT * PAGE_SIZE);

        for _ in 1..COMMIT_PAGE_COUNT {
            source.get_page(4, &mut cache).unwrap();
        }
        assert_eq!(cache.stats().committed_bytes, COMMIT_PAGE_COUNT * PAGE_SIZE);

        source.get_page(4, &mut cache).unwrap();
        assert_eq!(cache.stats().committed_bytes, 2 * COMMIT_PAGE_COUNT * PAGE_SIZE);
        source.deinitialize(&mut cache);
    }

    #[test]
    fn test_exhausting_bucket_reserves_one_region() {
        let (mut cache, mut source) = setup();
        for _ in 0..PAGES_PER_BUCKET {
            source.get_page(9, &mut cache).unwrap();
        }
        assert_eq!(CountingVm::calls().reserve, 1);
        source.get_page(9, &mut cache).unwrap();
        assert_eq!(CountingVm::calls().reserve, 2);
        assert_eq!(source.regions(), 2);

        // Other classes walk the existing regions before reserving.
        for _ in 0..2 * PAGES_PER_BUCKET {
            source.get_page(2, &mut cache).unwrap();
        }
        assert_eq!(CountingVm::calls().reserve, 2);

        source.deinitialize(&mut cache);
        assert_eq!(CountingVm::calls().release, 2);
    }

    #[test]
    fn test_multipage_spans_are_contiguous_runs() {
        let (mut cache, mut source) = setup();
        for _ in 0..2 * PAGES_PER_BUCKET / MULTIPAGE_PAGE_COUNT + 1 {
            let multipage = source.get_multipage(12, &mut cache).unwrap();
            assert_eq!(multipage.total_pages(), MULTIPAGE_PAGE_COUNT);
            for span in multipage.spans() {
                for page in 0..span.pages {
                    assert_eq!(address_to_idx(span.addr() + page * PAGE_SIZE), 12);
                }
                // Safety: Test code; spans are committed.
                unsafe { span.start.as_ptr().write_bytes(0x3C, span.len()) };
            }
        }
        source.deinitialize(&mut cache);
    }

    #[test]
    fn test_reservation_failure_registers_nothing() {
        let (mut cache, mut source) = setup();
        CountingVm::fail_next_reserve();
        let err = source.get_page(0, &mut cache).unwrap_err();
        assert!(matches!(err, HeapError::OutOfMemory { requested, .. } if requested == RESERVATION_SIZE));
        assert_eq!(source.regions(), 0);

        source.get_page(0, &mut cache).unwrap();
        assert_eq!(source.regions(), 1);
        source.deinitialize(&mut cache);
    }

    #[test]
    fn test_initial_commit_failure_releases_reservation() {
        let (mut cache, mut source) = setup();
        CountingVm::fail_next_commit();
        assert!(matches!(
            source.get_page(5, &mut cache),
            Err(HeapError::OutOfMemory { .. })
        ));
        assert_eq!(source.regions(), 0);
        assert_eq!(CountingVm::calls().release, 1);
        source.deinitialize(&mut cache);
    }

    #[test]
    fn test_failed_batch_is_rolled_back() {
        let (mut cache, mut source) = setup();
        source.get_page(0, &mut cache).unwrap();
        let base = source.iter().next().unwrap().base.as_ptr() as usize;
        // The bucket holding the base is split at the wrap point.
        let base_offset = (base >> PAGE_SIZE_EXP) & ((1 << REGION_PAGE_BITS) - 1);
        let idx = base_offset >> PAGES_PER_BUCKET_EXP;
        let split = base_offset & (PAGES_PER_BUCKET - 1);
        if idx == 0 || split % COMMIT_PAGE_COUNT == 0 {
            // No batch of a fresh bucket straddles the wrap point.
            source.deinitialize(&mut cache);
            return;
        }
        let batch = split / COMMIT_PAGE_COUNT * COMMIT_PAGE_COUNT;
        for _ in 0..batch {
            source.get_page(idx, &mut cache).unwrap();
        }

        let before = cache.stats();
        CountingVm::fail_commit_after(1);
        assert!(matches!(
            source.get_page(idx, &mut cache),
            Err(HeapError::OutOfMemory { .. })
        ));
        let after = cache.stats();
        assert_eq!(after.commit_count, before.commit_count + 1);
        assert_eq!(after.decommit_count, before.decommit_count + 1);
        let desc = source.iter().next().unwrap();
        assert_eq!(usize::from(desc.next_to_use[idx]), batch);
        assert_eq!(usize::from(desc.next_to_commit[idx]), batch);

        // A retry commits the whole batch again.
        for _ in 0..COMMIT_PAGE_COUNT {
            let page = source.get_page(idx, &mut cache).unwrap();
            // Safety: Test code; page is committed.
            unsafe { page.as_ptr().write_bytes(0x71, PAGE_SIZE) };
        }
        assert_eq!(cache.stats().commit_count, after.commit_count + 2);
        source.deinitialize(&mut cache);
    }

    #[test]
    fn test_slot_starts_follow_the_multipage_carve() {
        let (mut cache, mut source) = setup();
        let (idx, slot) = (2, 48);
        let multipage = source.get_multipage(idx, &mut cache).unwrap();
        for span in multipage.spans() {
            let start = span.addr();
            let last = start + (span.len() / slot - 1) * slot;
            assert!(source.is_slot_start(start, idx, slot));
            assert!(source.is_slot_start(start + slot, idx, slot));
            assert!(source.is_slot_start(last, idx, slot));
            assert!(!source.is_slot_start(start + 16, idx, slot));
            assert!(!source.is_slot_start(last + 16, idx, slot));
        }

        let desc = source.iter().next().unwrap();
        let unused = desc.page_ptr(idx, MULTIPAGE_PAGE_COUNT).as_ptr() as usize;
        assert!(!source.is_slot_start(unused, idx, slot));
        source.deinitialize(&mut cache);
    }

    #[test]
    fn test_owns() {
        let (mut cache, mut source) = setup();
        let page = source.get_page(3, &mut cache).unwrap();
        let addr = page.as_ptr() as usize;
        assert!(source.owns(addr));
        assert!(source.owns(addr + 100));
        let local = 0u64;
        assert!(!source.owns(&local as *const u64 as usize));
        source.deinitialize(&mut cache);
    }
}
