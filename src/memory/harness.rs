//! Allocator-under-test contract for benchmark drivers.
//!
//! A driver owns one [`AllocatorTester`] per worker thread, calls `init`,
//! runs its setup, main-loop and cleanup phases against `allocate` /
//! `deallocate`, and marks the end of each phase with the matching hook.
//! The hooks record timestamps and heap statistics into
//! [`ThreadTestResults`].
//!
//! [`VoidAllocator`] is the baseline: it hands out one buffer for every
//! request and ignores frees, so it measures the driver's own overhead.
//! Drivers must not check memory contents when [`AllocatorTester::is_fake`]
//! is true.

use std::ptr::NonNull;
use std::time::{Duration, Instant};

use super::error::HeapError;
use super::heap::{HeapConfig, HeapState, SizeClassAllocator};
use super::stats::HeapStats;

pub const VOID_BUFFER_SIZE: usize = 0x100_0000;

pub struct VoidAllocator {
    // u128 for 16-byte alignment.
    buffer: Option<Box<[u128]>>,
}

impl VoidAllocator {
    pub const fn new() -> Self {
        Self { buffer: None }
    }

    fn init(&mut self) {
        self.buffer = Some(vec![0u128; VOID_BUFFER_SIZE / size_of::<u128>()].into_boxed_slice());
    }

    fn allocate(&mut self, size: usize) -> Result<NonNull<u8>, HeapError> {
        assert!(size <= VOID_BUFFER_SIZE, "void allocator request of {size} bytes");
        match self.buffer.as_mut() {
            Some(buffer) => Ok(NonNull::from(&mut buffer[..]).cast()),
            None => Err(HeapError::NotActive(HeapState::Uninitialized)),
        }
    }

    fn deinit(&mut self) {
        self.buffer = None;
    }
}

impl Default for VoidAllocator {
    fn default() -> Self {
        Self::new()
    }
}

pub enum AllocatorUnderTest {
    Heap(SizeClassAllocator),
    Void(VoidAllocator),
}

/// Per-thread timing and statistics captured by the phase hooks.
#[derive(Clone, Debug, Default)]
pub struct ThreadTestResults {
    pub thread_id: usize,
    pub begin: Option<Instant>,
    pub setup_done: Option<Instant>,
    pub main_loop_done: Option<Instant>,
    pub exit: Option<Instant>,
    pub after_setup: HeapStats,
    pub after_main_loop: HeapStats,
    pub after_cleanup: HeapStats,
}

impl ThreadTestResults {
    /// Time from `init` to the cleanup hook.
    pub fn inner_duration(&self) -> Option<Duration> {
        Some(self.exit?.duration_since(self.begin?))
    }

    /// Setup, main loop and cleanup as percentages of the inner duration.
    pub fn phase_shares(&self) -> Option<[f64; 3]> {
        let begin = self.begin?;
        let total = self.inner_duration()?.as_secs_f64();
        if total == 0.0 {
            return None;
        }
        let setup = self.setup_done?.duration_since(begin).as_secs_f64();
        let main_loop = self.main_loop_done?.duration_since(begin).as_secs_f64();
        Some([
            setup * 100.0 / total,
            (main_loop - setup) * 100.0 / total,
            (total - main_loop) * 100.0 / total,
        ])
    }
}

pub struct AllocatorTester {
    allocator: AllocatorUnderTest,
    results: ThreadTestResults,
}

impl AllocatorTester {
    pub fn new(allocator: AllocatorUnderTest) -> Self {
        Self {
            allocator,
            results: ThreadTestResults::default(),
        }
    }

    pub fn heap(config: HeapConfig) -> Self {
        Self::new(AllocatorUnderTest::Heap(SizeClassAllocator::new(config)))
    }

    pub fn void() -> Self {
        Self::new(AllocatorUnderTest::Void(VoidAllocator::new()))
    }

    pub fn name(&self) -> &'static str {
        match self.allocator {
            AllocatorUnderTest::Heap(_) => "sounding-heap",
            AllocatorUnderTest::Void(_) => "void",
        }
    }

    /// Whether returned memory is shared between requests.
    pub fn is_fake(&self) -> bool {
        matches!(self.allocator, AllocatorUnderTest::Void(_))
    }

    pub fn init(&mut self, thread_id: usize) -> Result<(), HeapError> {
        self.results = ThreadTestResults {
            thread_id,
            begin: Some(Instant::now()),
            ..ThreadTestResults::default()
        };
        match &mut self.allocator {
            AllocatorUnderTest::Heap(heap) => heap.initialize(),
            AllocatorUnderTest::Void(void) => {
                void.init();
                Ok(())
            }
        }
    }

    #[inline]
    pub fn allocate(&mut self, size: usize) -> Result<NonNull<u8>, HeapError> {
        match &mut self.allocator {
            AllocatorUnderTest::Heap(heap) => heap.allocate(size),
            AllocatorUnderTest::Void(void) => void.allocate(size),
        }
    }

    /// # Safety
    /// `ptr` must be null or a live allocation from this tester.
    #[inline]
    pub unsafe fn deallocate(&mut self, ptr: *mut u8) {
        if let AllocatorUnderTest::Heap(heap) = &mut self.allocator {
            // Safety: forwarded caller contract.
            unsafe { heap.deallocate(ptr) };
        }
    }

    pub fn deinit(&mut self) {
        match &mut self.allocator {
            AllocatorUnderTest::Heap(heap) => {
                if heap.state() == HeapState::Active {
                    heap.deinitialize();
                }
            }
            AllocatorUnderTest::Void(void) => void.deinit(),
        }
    }

    fn snapshot(&self) -> HeapStats {
        match &self.allocator {
            AllocatorUnderTest::Heap(heap) => heap.stats(),
            AllocatorUnderTest::Void(_) => HeapStats::default(),
        }
    }

    pub fn after_setup_phase(&mut self) {
        self.results.setup_done = Some(Instant::now());
        self.results.after_setup = self.snapshot();
    }

    pub fn after_main_loop_phase(&mut self) {
        self.results.main_loop_done = Some(Instant::now());
        self.results.after_main_loop = self.snapshot();
    }

    pub fn after_cleanup_phase(&mut self) {
        self.results.exit = Some(Instant::now());
        self.results.after_cleanup = self.snapshot();
    }

    pub fn results(&self) -> &ThreadTestResults {
        &self.results
    }
}
