use std::ptr::NonNull;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum VmError {
    #[error("VM reservation failed: {0}")]
    ReservationFailed(#[source] std::io::Error),
    #[error("VM commit failed: {0}")]
    CommitFailed(#[source] std::io::Error),
    #[error("VM decommit failed: {0}")]
    DecommitFailed(#[source] std::io::Error),
    #[error("VM release failed: {0}")]
    ReleaseFailed(#[source] std::io::Error),
}

/// Source of raw address space for the heap.
///
/// The heap never touches the OS directly; every reservation, commit and
/// release goes through an implementation of this trait. All functions are
/// associated (no receiver) so a provider is a zero-sized type parameter.
///
/// # Safety
/// Implementations must return page-aligned ranges from [`reserve`] and
/// [`allocate`] and must accept back exactly the `(ptr, size)` pairs they
/// handed out.
///
/// [`reserve`]: VirtualMemoryProvider::reserve
/// [`allocate`]: VirtualMemoryProvider::allocate
pub unsafe trait VirtualMemoryProvider {
    /// Reserve address space without access rights.
    /// Returns a pointer to the start of the reserved range.
    unsafe fn reserve(size: usize) -> Result<NonNull<u8>, VmError>;

    /// Grant read/write access to a range within a reservation.
    unsafe fn commit(ptr: NonNull<u8>, size: usize) -> Result<(), VmError>;

    /// Return physical pages, keep the address range reserved.
    unsafe fn decommit(ptr: NonNull<u8>, size: usize) -> Result<(), VmError>;

    /// Release address space entirely (after which pointers are invalid).
    unsafe fn release(ptr: NonNull<u8>, size: usize) -> Result<(), VmError>;

    /// OS page size.
    fn page_size() -> usize;

    /// Reserve and commit `size` bytes in one step.
    unsafe fn allocate(size: usize) -> Result<NonNull<u8>, VmError> {
        // Safety: forwarded caller contract.
        let ptr = unsafe { Self::reserve(size)? };
        // Safety: ptr..ptr+size was just reserved.
        if let Err(e) = unsafe { Self::commit(ptr, size) } {
            // Safety: releasing the reservation made above.
            let _ = unsafe { Self::release(ptr, size) };
            return Err(e);
        }
        Ok(ptr)
    }

    /// Release a block obtained from [`VirtualMemoryProvider::allocate`].
    unsafe fn deallocate(ptr: NonNull<u8>, size: usize) -> Result<(), VmError> {
        // Safety: forwarded caller contract.
        unsafe { Self::release(ptr, size) }
    }
}

/// The provider for the current target.
pub struct PlatformVm;

#[cfg(all(any(target_os = "macos", target_os = "linux"), not(any(loom, miri))))]
mod unix {
    use super::{NonNull, PlatformVm, VirtualMemoryProvider, VmError};
    use std::io;

    // Safety: mmap returns page-aligned mappings; munmap accepts any
    // page-aligned sub-range, including the full mapping.
    unsafe impl VirtualMemoryProvider for PlatformVm {
        unsafe fn reserve(size: usize) -> Result<NonNull<u8>, VmError> {
            // Safety: FFI call to mmap.
            let ptr = unsafe {
                libc::mmap(
                    std::ptr::null_mut(),
                    size,
                    libc::PROT_NONE,
                    libc::MAP_PRIVATE | libc::MAP_ANON,
                    -1,
                    0,
                )
            };

            if ptr == libc::MAP_FAILED {
                return Err(VmError::ReservationFailed(io::Error::last_os_error()));
            }

            match NonNull::new(ptr.cast::<u8>()) {
                Some(p) => Ok(p),
                None => Err(VmError::ReservationFailed(io::Error::other(
                    "mmap returned null",
                ))),
            }
        }

        unsafe fn commit(ptr: NonNull<u8>, size: usize) -> Result<(), VmError> {
            // Safety: FFI call to mprotect.
            if unsafe {
                libc::mprotect(
                    ptr.as_ptr().cast::<libc::c_void>(),
                    size,
                    libc::PROT_READ | libc::PROT_WRITE,
                )
            } != 0
            {
                return Err(VmError::CommitFailed(io::Error::last_os_error()));
            }

            #[cfg(target_os = "linux")]
            {
                // Commit batches are consumed right away by the slot
                // formatter; skip the first-touch minor faults.
                // Safety: FFI call to madvise.
                unsafe {
                    libc::madvise(ptr.as_ptr().cast::<libc::c_void>(), size, libc::MADV_WILLNEED)
                };
            }

            Ok(())
        }

        unsafe fn decommit(ptr: NonNull<u8>, size: usize) -> Result<(), VmError> {
            // MADV_FREE + mprotect(PROT_NONE). Contents after a recommit are
            // unspecified (stale or zero); nothing above relies on either.
            // Safety: FFI call to madvise.
            if unsafe { libc::madvise(ptr.as_ptr().cast::<libc::c_void>(), size, libc::MADV_FREE) }
                != 0
            {
                return Err(VmError::DecommitFailed(io::Error::last_os_error()));
            }
            // Safety: FFI call to mprotect.
            if unsafe { libc::mprotect(ptr.as_ptr().cast::<libc::c_void>(), size, libc::PROT_NONE) }
                != 0
            {
                return Err(VmError::DecommitFailed(io::Error::last_os_error()));
            }
            Ok(())
        }

        unsafe fn release(ptr: NonNull<u8>, size: usize) -> Result<(), VmError> {
            // Safety: FFI call to munmap.
            if unsafe { libc::munmap(ptr.as_ptr().cast::<libc::c_void>(), size) } != 0 {
                return Err(VmError::ReleaseFailed(io::Error::last_os_error()));
            }
            Ok(())
        }

        unsafe fn allocate(size: usize) -> Result<NonNull<u8>, VmError> {
            // One syscall instead of reserve + commit.
            // Safety: FFI call to mmap.
            let ptr = unsafe {
                libc::mmap(
                    std::ptr::null_mut(),
                    size,
                    libc::PROT_READ | libc::PROT_WRITE,
                    libc::MAP_PRIVATE | libc::MAP_ANON,
                    -1,
                    0,
                )
            };

            if ptr == libc::MAP_FAILED {
                return Err(VmError::ReservationFailed(io::Error::last_os_error()));
            }

            NonNull::new(ptr.cast::<u8>())
                .ok_or_else(|| VmError::ReservationFailed(io::Error::other("mmap returned null")))
        }

        fn page_size() -> usize {
            use crate::sync::OnceLock;
            static CACHED: OnceLock<usize> = OnceLock::new();
            *CACHED.get_or_init(|| {
                // Safety: FFI call to sysconf.
                let raw = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
                assert!(
                    raw > 0,
                    "sysconf(_SC_PAGESIZE) failed: {}",
                    io::Error::last_os_error()
                );
                #[allow(clippy::cast_sign_loss, clippy::cast_possible_truncation)]
                {
                    raw as usize
                }
            })
        }
    }
}

// ---------------------------------------------------------------------------
// Heap-backed fallback (loom, Miri, targets without mmap)
//
// Every "reservation" is a plain zeroed heap allocation aligned to 4096.
// `commit` / `decommit` are no-ops: the memory is always accessible once
// reserved. `release` frees the heap block, so it must receive the exact
// size that was reserved.
// ---------------------------------------------------------------------------
#[cfg(any(loom, miri, not(any(target_os = "macos", target_os = "linux"))))]
// Safety: blocks are allocated with 4096 alignment and freed with the same
// layout.
unsafe impl VirtualMemoryProvider for PlatformVm {
    unsafe fn reserve(size: usize) -> Result<NonNull<u8>, VmError> {
        if size == 0 {
            return Err(VmError::ReservationFailed(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                "zero-size reservation",
            )));
        }
        let layout = std::alloc::Layout::from_size_align(size, 4096)
            .map_err(|e| VmError::ReservationFailed(std::io::Error::other(e)))?;
        // Safety: layout has non-zero size.
        let ptr = unsafe { std::alloc::alloc_zeroed(layout) };
        NonNull::new(ptr).ok_or_else(|| {
            VmError::ReservationFailed(std::io::Error::new(
                std::io::ErrorKind::OutOfMemory,
                "alloc returned null",
            ))
        })
    }

    unsafe fn commit(_ptr: NonNull<u8>, _size: usize) -> Result<(), VmError> {
        Ok(())
    }

    unsafe fn decommit(_ptr: NonNull<u8>, _size: usize) -> Result<(), VmError> {
        Ok(())
    }

    unsafe fn release(ptr: NonNull<u8>, size: usize) -> Result<(), VmError> {
        let layout = std::alloc::Layout::from_size_align(size, 4096)
            .map_err(|e| VmError::ReleaseFailed(std::io::Error::other(e)))?;
        // Safety: ptr was allocated with the same layout via `reserve`.
        unsafe { std::alloc::dealloc(ptr.as_ptr(), layout) };
        Ok(())
    }

    fn page_size() -> usize {
        4096
    }
}

/// Call-counting provider for tests.
///
/// Wraps [`PlatformVm`] and records every call in thread-local counters, so
/// each test thread sees only its own heap's traffic. Can be armed to fail
/// the next reservation or commit.
#[cfg(test)]
pub(crate) mod testing {
    use super::{NonNull, PlatformVm, VirtualMemoryProvider, VmError};
    use std::cell::Cell;

    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
    pub(crate) struct VmCalls {
        pub reserve: usize,
        pub commit: usize,
        pub decommit: usize,
        pub release: usize,
        pub allocate: usize,
        pub deallocate: usize,
    }

    thread_local! {
        static CALLS: Cell<VmCalls> = Cell::new(VmCalls::default());
        static FAIL_RESERVE: Cell<bool> = const { Cell::new(false) };
        static FAIL_COMMIT: Cell<Option<usize>> = const { Cell::new(None) };
    }

    pub(crate) struct CountingVm;

    impl CountingVm {
        pub(crate) fn calls() -> VmCalls {
            CALLS.with(Cell::get)
        }

        pub(crate) fn reset() {
            CALLS.with(|c| c.set(VmCalls::default()));
            FAIL_RESERVE.with(|f| f.set(false));
            FAIL_COMMIT.with(|f| f.set(None));
        }

        pub(crate) fn fail_next_reserve() {
            FAIL_RESERVE.with(|f| f.set(true));
        }

        pub(crate) fn fail_next_commit() {
            Self::fail_commit_after(0);
        }

        /// Let `successes` commits through, then fail the one after.
        pub(crate) fn fail_commit_after(successes: usize) {
            FAIL_COMMIT.with(|f| f.set(Some(successes)));
        }

        fn record(f: impl FnOnce(&mut VmCalls)) {
            CALLS.with(|c| {
                let mut calls = c.get();
                f(&mut calls);
                c.set(calls);
            });
        }

        fn injected(flag: &'static std::thread::LocalKey<Cell<bool>>) -> bool {
            flag.with(|f| f.replace(false))
        }

        fn commit_injected() -> bool {
            FAIL_COMMIT.with(|f| match f.get() {
                Some(0) => {
                    f.set(None);
                    true
                }
                Some(n) => {
                    f.set(Some(n - 1));
                    false
                }
                None => false,
            })
        }
    }

    // Safety: forwards to PlatformVm.
    unsafe impl VirtualMemoryProvider for CountingVm {
        unsafe fn reserve(size: usize) -> Result<NonNull<u8>, VmError> {
            Self::record(|c| c.reserve += 1);
            if Self::injected(&FAIL_RESERVE) {
                return Err(VmError::ReservationFailed(std::io::Error::from(
                    std::io::ErrorKind::OutOfMemory,
                )));
            }
            // Safety: forwarded.
            unsafe { PlatformVm::reserve(size) }
        }

        unsafe fn commit(ptr: NonNull<u8>, size: usize) -> Result<(), VmError> {
            Self::record(|c| c.commit += 1);
            if Self::commit_injected() {
                return Err(VmError::CommitFailed(std::io::Error::from(
                    std::io::ErrorKind::OutOfMemory,
                )));
            }
            // Safety: forwarded.
            unsafe { PlatformVm::commit(ptr, size) }
        }

        unsafe fn decommit(ptr: NonNull<u8>, size: usize) -> Result<(), VmError> {
            Self::record(|c| c.decommit += 1);
            // Safety: forwarded.
            unsafe { PlatformVm::decommit(ptr, size) }
        }

        unsafe fn release(ptr: NonNull<u8>, size: usize) -> Result<(), VmError> {
            Self::record(|c| c.release += 1);
            // Safety: forwarded.
            unsafe { PlatformVm::release(ptr, size) }
        }

        fn page_size() -> usize {
            PlatformVm::page_size()
        }

        // Counted separately so `reserve` tracks region reservations only.
        unsafe fn allocate(size: usize) -> Result<NonNull<u8>, VmError> {
            Self::record(|c| c.allocate += 1);
            // Safety: forwarded.
            unsafe { PlatformVm::allocate(size) }
        }

        unsafe fn deallocate(ptr: NonNull<u8>, size: usize) -> Result<(), VmError> {
            Self::record(|c| c.deallocate += 1);
            // Safety: forwarded.
            unsafe { PlatformVm::deallocate(ptr, size) }
        }
    }
}
