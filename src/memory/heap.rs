//! The size-class heap and its per-thread context.
//!
//! Requests up to `MAX_BUCKET_SIZE` are rounded to a size class and served
//! from that class's intrusive free list. An empty list is refilled with a
//! multipage from the [`AddressIndexedPageSource`], carved into equal slots.
//! Because every page of a class sits in that class's bucket, `deallocate`
//! recovers the class from the pointer's address and needs no header.
//!
//! Larger requests go to the [`BulkBlockAllocator`]; its pointers always sit
//! `BULK_HEADER_SIZE` bytes into a page, an offset no slot is ever placed
//! at, which is how `deallocate` tells the two apart.
//!
//! A heap is owned by one thread. Freeing a pointer on a heap other than the
//! one that allocated it corrupts both heaps' free lists and is not allowed;
//! the raw pointers inside make the type `!Send`.

use std::cell::RefCell;
use std::ptr::NonNull;

use log::{debug, trace};

use super::bulk::{BULK_HEADER_SIZE, BulkBlockAllocator};
use super::error::{HeapError, Violation};
use super::layout::{MAX_BUCKET_SIZE, PAGE_SIZE, page_offset};
use super::page_cache::{PageCache, PageCacheConfig};
use super::page_source::{AddressIndexedPageSource, Span, address_to_idx};
use super::size_class::{CLASS_COUNT, class_to_size, size_to_class};
use super::stats::HeapStats;
use super::vm::{PlatformVm, VirtualMemoryProvider};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum HeapState {
    Uninitialized,
    Active,
    Disabled,
}

#[derive(Clone, Debug)]
pub struct HeapConfig {
    pub cache: PageCacheConfig,
    /// Validate free lists and bulk blocks after every operation and check
    /// every freed pointer for ownership and double frees. Violations panic.
    pub consistency_checks: bool,
}

impl Default for HeapConfig {
    fn default() -> Self {
        Self {
            cache: PageCacheConfig::default(),
            consistency_checks: cfg!(feature = "heavy-debug"),
        }
    }
}

/// Singly linked list threaded through the first word of each free slot.
struct FreeList {
    head: Option<NonNull<u8>>,
    count: usize,
}

impl FreeList {
    const fn new() -> Self {
        Self {
            head: None,
            count: 0,
        }
    }

    #[inline]
    fn push(&mut self, ptr: NonNull<u8>) {
        // Safety: ptr is a free slot of at least 16 bytes, aligned to 16.
        unsafe { ptr.cast::<Option<NonNull<u8>>>().as_ptr().write(self.head) };
        self.head = Some(ptr);
        self.count += 1;
    }

    #[inline]
    fn pop(&mut self) -> Option<NonNull<u8>> {
        let ptr = self.head?;
        // Safety: every slot on the list holds a link written by `push`.
        self.head = unsafe { ptr.cast::<Option<NonNull<u8>>>().as_ptr().read() };
        self.count -= 1;
        Some(ptr)
    }

    /// Thread the slots of `span` onto the list, lowest address first.
    /// Slots that would start at the bulk header offset are skipped.
    fn push_span(&mut self, span: &Span, slot_size: usize) {
        let slots = span.len() / slot_size;
        for i in (0..slots).rev() {
            // Safety: slot i lies within the committed span.
            let slot = unsafe { span.start.byte_add(i * slot_size) };
            if page_offset(slot.as_ptr() as usize) != BULK_HEADER_SIZE {
                self.push(slot);
            }
        }
    }

    fn iter(&self) -> impl Iterator<Item = NonNull<u8>> + use<> {
        let mut cursor = self.head;
        std::iter::from_fn(move || {
            let ptr = cursor?;
            // Safety: slots on the list hold links written by `push`.
            cursor = unsafe { ptr.cast::<Option<NonNull<u8>>>().as_ptr().read() };
            Some(ptr)
        })
    }
}

pub struct SizeClassAllocator<V: VirtualMemoryProvider = PlatformVm> {
    state: HeapState,
    config: HeapConfig,
    free_lists: [FreeList; CLASS_COUNT],
    // Present exactly while Active.
    pages: Option<AddressIndexedPageSource>,
    bulk: BulkBlockAllocator,
    cache: PageCache<V>,
}

impl<V: VirtualMemoryProvider> Default for SizeClassAllocator<V> {
    fn default() -> Self {
        Self::new(HeapConfig::default())
    }
}

impl<V: VirtualMemoryProvider> SizeClassAllocator<V> {
    pub fn new(config: HeapConfig) -> Self {
        Self {
            state: HeapState::Uninitialized,
            cache: PageCache::new(config.cache.clone()),
            config,
            free_lists: [const { FreeList::new() }; CLASS_COUNT],
            pages: None,
            bulk: BulkBlockAllocator::new(),
        }
    }

    pub fn state(&self) -> HeapState {
        self.state
    }

    pub fn config(&self) -> &HeapConfig {
        &self.config
    }

    /// Become Active. Accepted from `Uninitialized` and `Disabled`; no
    /// memory is reserved until the first allocation.
    pub fn initialize(&mut self) -> Result<(), HeapError> {
        debug_assert_ne!(self.state, HeapState::Active, "heap initialized twice");
        if self.state == HeapState::Active {
            return Ok(());
        }
        let page_size = V::page_size();
        if page_size != PAGE_SIZE {
            return Err(HeapError::UnsupportedPageSize {
                actual: page_size,
                expected: PAGE_SIZE,
            });
        }
        self.free_lists = [const { FreeList::new() }; CLASS_COUNT];
        self.pages = Some(AddressIndexedPageSource::new(&mut self.cache)?);
        self.state = HeapState::Active;
        debug!("heap initialized ({} size classes)", CLASS_COUNT);
        Ok(())
    }

    /// Release every region, bulk block and cached page.
    pub fn deinitialize(&mut self) {
        debug_assert_eq!(self.state, HeapState::Active, "deinitialize on a {:?} heap", self.state);
        if let Some(pages) = self.pages.take() {
            pages.deinitialize(&mut self.cache);
        }
        self.bulk.deinitialize(&mut self.cache);
        self.cache.trim();
        self.free_lists = [const { FreeList::new() }; CLASS_COUNT];
        self.state = HeapState::Disabled;
        debug!("heap deinitialized: {:?}", self.cache.stats());
    }

    /// At least `size` bytes, aligned to 16.
    #[inline]
    pub fn allocate(&mut self, size: usize) -> Result<NonNull<u8>, HeapError> {
        debug_assert_eq!(self.state, HeapState::Active, "allocate on a {:?} heap", self.state);
        if size <= MAX_BUCKET_SIZE {
            let class = size_to_class(size);
            if let Some(ptr) = self.free_lists[class].pop() {
                if self.config.consistency_checks {
                    self.enforce(self.validate_class(class));
                }
                return Ok(ptr);
            }
            return self.refill_and_pop(class);
        }
        self.allocate_bulk(size)
    }

    #[cold]
    #[inline(never)]
    fn refill_and_pop(&mut self, class: usize) -> Result<NonNull<u8>, HeapError> {
        loop {
            let Some(pages) = self.pages.as_mut() else {
                return Err(HeapError::NotActive(self.state));
            };
            let multipage = pages.get_multipage(class, &mut self.cache)?;
            let slot_size = class_to_size(class);
            // Later spans first so the head ends up at the lowest address.
            for span in multipage.spans().iter().rev() {
                self.free_lists[class].push_span(span, slot_size);
            }
            trace!(
                "class {class} ({slot_size} B) refilled: {} slots in {} spans",
                self.free_lists[class].count,
                multipage.spans().len()
            );
            if self.config.consistency_checks {
                self.enforce(self.validate_class(class));
            }
            // A span shorter than one slot yields nothing; go again.
            if let Some(ptr) = self.free_lists[class].pop() {
                return Ok(ptr);
            }
        }
    }

    #[cold]
    fn allocate_bulk(&mut self, size: usize) -> Result<NonNull<u8>, HeapError> {
        if self.pages.is_none() {
            return Err(HeapError::NotActive(self.state));
        }
        let ptr = self.bulk.allocate(size, &mut self.cache)?;
        if self.config.consistency_checks {
            self.enforce(self.bulk.validate());
        }
        Ok(ptr)
    }

    /// Return `ptr` to the heap. Null is ignored.
    ///
    /// With `consistency_checks` enabled, foreign pointers and double frees
    /// panic; otherwise they are undefined behaviour.
    ///
    /// # Safety
    /// `ptr` must be null or a live allocation from this heap.
    #[inline]
    pub unsafe fn deallocate(&mut self, ptr: *mut u8) {
        let Some(ptr) = NonNull::new(ptr) else {
            return;
        };
        debug_assert_eq!(self.state, HeapState::Active, "deallocate on a {:?} heap", self.state);
        if self.config.consistency_checks {
            self.enforce(self.check_deallocate(ptr));
        }
        // Safety: forwarded caller contract.
        unsafe { self.deallocate_unchecked(ptr) };
    }

    /// [`deallocate`](Self::deallocate) that always runs the ownership and
    /// double-free checks and reports violations instead of panicking.
    ///
    /// Pointers outside every region and bulk block that carry the bulk
    /// header offset are taken to be direct bulk allocations, which are not
    /// tracked individually.
    ///
    /// # Safety
    /// Same as [`deallocate`](Self::deallocate), minus the ownership and
    /// double-free requirements for bucketed and in-block pointers.
    pub unsafe fn checked_deallocate(&mut self, ptr: *mut u8) -> Result<(), HeapError> {
        let Some(ptr) = NonNull::new(ptr) else {
            return Ok(());
        };
        if self.state != HeapState::Active {
            return Err(HeapError::NotActive(self.state));
        }
        self.check_deallocate(ptr)?;
        // Safety: ownership verified above.
        unsafe { self.deallocate_unchecked(ptr) };
        Ok(())
    }

    unsafe fn deallocate_unchecked(&mut self, ptr: NonNull<u8>) {
        let addr = ptr.as_ptr() as usize;
        if page_offset(addr) == BULK_HEADER_SIZE {
            // Safety: only bulk pointers carry this offset.
            unsafe { self.bulk.deallocate(ptr, &mut self.cache) };
            if self.config.consistency_checks {
                self.enforce(self.bulk.validate());
            }
            return;
        }
        let class = address_to_idx(addr);
        debug_assert!(class < CLASS_COUNT, "pointer {ptr:p} maps to unused bucket {class}");
        self.free_lists[class].push(ptr);
        if self.config.consistency_checks {
            self.enforce(self.validate_class(class));
        }
    }

    fn check_deallocate(&self, ptr: NonNull<u8>) -> Result<(), Violation> {
        let addr = ptr.as_ptr() as usize;
        let in_regions = self.pages.as_ref().is_some_and(|p| p.owns(addr));
        if page_offset(addr) == BULK_HEADER_SIZE {
            if in_regions {
                return Err(Violation::ForeignPointer(addr));
            }
            return self.bulk.check_free(addr);
        }
        if !in_regions || !self.owns_slot(addr, address_to_idx(addr)) {
            return Err(Violation::ForeignPointer(addr));
        }
        let class = address_to_idx(addr);
        if self.free_lists[class].iter().any(|slot| slot == ptr) {
            return Err(Violation::DoubleFree(addr));
        }
        Ok(())
    }

    /// Whether `addr` starts a slot of `class` carved from pages this heap
    /// has handed out.
    fn owns_slot(&self, addr: usize, class: usize) -> bool {
        class < CLASS_COUNT
            && self
                .pages
                .as_ref()
                .is_some_and(|p| p.is_slot_start(addr, class, class_to_size(class)))
    }

    fn validate_class(&self, class: usize) -> Result<(), Violation> {
        let list = &self.free_lists[class];
        let mut seen = 0;
        let mut cursor = list.head;
        while let Some(ptr) = cursor {
            let addr = ptr.as_ptr() as usize;
            // The count bound also catches cycles.
            if seen == list.count || address_to_idx(addr) != class || !self.owns_slot(addr, class) {
                return Err(Violation::CorruptFreeList { class, addr });
            }
            seen += 1;
            // Safety: the slot is inside one of our regions and on the list.
            cursor = unsafe { ptr.cast::<Option<NonNull<u8>>>().as_ptr().read() };
        }
        if seen != list.count {
            return Err(Violation::CorruptFreeList { class, addr: 0 });
        }
        Ok(())
    }

    /// Walk every free list and bulk block.
    pub fn validate(&self) -> Result<(), HeapError> {
        for class in 0..CLASS_COUNT {
            self.validate_class(class)?;
        }
        self.bulk.validate()?;
        Ok(())
    }

    fn enforce(&self, result: Result<(), Violation>) {
        if let Err(violation) = result {
            panic!("heap protocol violation: {violation}");
        }
    }

    /// Bytes that may be used behind `ptr`.
    ///
    /// # Safety
    /// `ptr` must be a live allocation from this heap.
    pub unsafe fn usable_size(&self, ptr: NonNull<u8>) -> usize {
        let addr = ptr.as_ptr() as usize;
        if page_offset(addr) == BULK_HEADER_SIZE {
            // Safety: forwarded caller contract.
            unsafe { BulkBlockAllocator::usable_size(ptr) }
        } else {
            class_to_size(address_to_idx(addr))
        }
    }

    /// Hand empty bulk blocks and cached pages back to the OS. Regions are
    /// kept until `deinitialize`.
    pub fn trim(&mut self) {
        self.bulk.release_empty_blocks(&mut self.cache);
        self.cache.trim();
    }

    pub fn stats(&self) -> HeapStats {
        HeapStats {
            pages: self.cache.stats(),
            regions: self.pages.as_ref().map_or(0, AddressIndexedPageSource::regions),
            bulk_blocks: self.bulk.block_count(),
            bulk_direct_live: self.bulk.direct_live(),
            cached_blocks: self.cache.cached_blocks(),
        }
    }

    /// Free slots currently on the list of `class`.
    pub fn free_slots(&self, class: usize) -> usize {
        self.free_lists[class].count
    }
}

impl<V: VirtualMemoryProvider> Drop for SizeClassAllocator<V> {
    fn drop(&mut self) {
        if self.state == HeapState::Active {
            self.deinitialize();
        }
    }
}

// ---------------------------------------------------------------------------
// Per-thread context
// ---------------------------------------------------------------------------

thread_local! {
    static THREAD_HEAP: RefCell<SizeClassAllocator> = RefCell::new(SizeClassAllocator::default());
}

/// Run `f` with the calling thread's heap.
///
/// The heap starts `Uninitialized`; call [`init_thread_heap`] first. It is
/// torn down by [`deinit_thread_heap`] or when the thread exits.
///
/// # Panics
/// Panics if called re-entrantly from within `f`.
pub fn with_thread_heap<F, R>(f: F) -> R
where
    F: FnOnce(&mut SizeClassAllocator) -> R,
{
    THREAD_HEAP.with(|heap| f(&mut heap.borrow_mut()))
}

/// Make the calling thread's heap Active. A no-op if it already is.
pub fn init_thread_heap() -> Result<(), HeapError> {
    with_thread_heap(|heap| match heap.state() {
        HeapState::Active => Ok(()),
        _ => heap.initialize(),
    })
}

/// Release everything the calling thread's heap holds.
pub fn deinit_thread_heap() {
    with_thread_heap(|heap| {
        if heap.state() == HeapState::Active {
            heap.deinitialize();
        }
    });
}
