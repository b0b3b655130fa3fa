#[cfg(not(target_pointer_width = "64"))]
compile_error!("sounding-heap supports only 64-bit targets.");

pub(crate) mod sync;

// public module: implementation details stay pub(crate); the public surface
// is re-exported below
pub mod memory;

// heap
pub use memory::heap::{
    HeapConfig, HeapState, SizeClassAllocator, deinit_thread_heap, init_thread_heap,
    with_thread_heap,
};
pub use memory::page_cache::PageCacheConfig;

// address math/size classes
pub use memory::bulk::BULK_HEADER_SIZE;
pub use memory::layout::{
    ALIGNMENT, BUCKET_COUNT, BULK_BLOCK_SIZE, BULK_MAX_IN_BLOCK_PAGES, COMMIT_PAGE_COUNT,
    MAX_BUCKET_SIZE, MULTIPAGE_PAGE_COUNT, PAGE_SIZE, PAGES_PER_BUCKET, RESERVATION_SIZE,
};
pub use memory::page_source::{address_to_idx, idx_to_page_addr};
pub use memory::size_class::{CLASS_COUNT, class_to_size, size_to_class};

// stats
pub use memory::stats::{
    BULK_DIRECT_LIVE, Counter, HeapStats, PAGE_CACHE_CACHED, PageStats, TOTAL_COMMITTED,
    TOTAL_RESERVED,
};

// benchmark harness
pub use memory::harness::{
    AllocatorTester, AllocatorUnderTest, ThreadTestResults, VOID_BUFFER_SIZE, VoidAllocator,
};

// errors/VM
pub use memory::error::{HeapError, Violation};
pub use memory::vm::{PlatformVm, VirtualMemoryProvider, VmError};
