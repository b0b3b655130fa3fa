//! Diagnostic counters.
//!
//! The global gauges aggregate every heap instance in the process and use
//! `Relaxed` ordering; a snapshot across several of them may be transiently
//! inconsistent. `PageStats` is per instance and exact, since an instance is
//! only ever touched by its owning thread. Do NOT use these values for
//! allocation decisions.

use crate::sync::atomic::{AtomicIsize, Ordering};

/// Diagnostic-only gauge counter.
///
/// Under contention, subtract-before-add races are tolerated and the raw value
/// may transiently dip below zero. Readers should always use `load()`/`get()`,
/// which clamp negative values to zero.
pub struct Counter(AtomicIsize);

impl Counter {
    #[cfg(not(loom))]
    pub const fn new() -> Self {
        Self(AtomicIsize::new(0))
    }

    #[cfg(loom)]
    pub fn new() -> Self {
        Self(AtomicIsize::new(0))
    }

    #[inline]
    fn delta(val: usize) -> isize {
        // Diagnostic counters only: clamp absurd deltas instead of panicking.
        std::cmp::min(val, isize::MAX as usize).cast_signed()
    }

    #[inline]
    pub fn add(&self, val: usize) {
        self.0.fetch_add(Self::delta(val), Ordering::Relaxed);
    }

    #[inline]
    pub fn sub(&self, val: usize) {
        self.0.fetch_sub(Self::delta(val), Ordering::Relaxed);
    }

    #[inline]
    pub fn get(&self) -> usize {
        self.load(Ordering::Relaxed)
    }

    #[inline]
    pub fn load(&self, ordering: Ordering) -> usize {
        self.0.load(ordering).max(0).cast_unsigned()
    }
}

// Address space reserved by all heaps (regions, bulk blocks, cached blocks)
crate::sync::static_atomic! {
    pub static TOTAL_RESERVED: Counter = Counter::new();
}
// Memory with read/write access granted by all heaps
crate::sync::static_atomic! {
    pub static TOTAL_COMMITTED: Counter = Counter::new();
}
// Bytes parked in page caches
crate::sync::static_atomic! {
    pub static PAGE_CACHE_CACHED: Counter = Counter::new();
}
// Bytes in direct (above-threshold) bulk allocations not yet freed
crate::sync::static_atomic! {
    pub static BULK_DIRECT_LIVE: Counter = Counter::new();
}

/// Per-instance OS traffic of a page cache and everything drawing from it.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct PageStats {
    /// `allocate` calls on the VM provider (cache misses and uncached blocks).
    pub sys_alloc_count: usize,
    pub sys_alloc_bytes: usize,
    pub sys_dealloc_count: usize,
    pub sys_dealloc_bytes: usize,
    /// Address-space reservations (regions).
    pub reserve_count: usize,
    pub reserved_bytes: usize,
    pub release_count: usize,
    pub commit_count: usize,
    pub committed_bytes: usize,
    pub decommit_count: usize,
    pub cache_hits: usize,
    pub cache_misses: usize,
}

/// Snapshot of one heap.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct HeapStats {
    pub pages: PageStats,
    /// Regions currently reserved by the page source.
    pub regions: usize,
    /// Bulk blocks currently held.
    pub bulk_blocks: usize,
    /// Direct bulk allocations not yet freed.
    pub bulk_direct_live: usize,
    /// Blocks currently parked in the page cache.
    pub cached_blocks: usize,
}
