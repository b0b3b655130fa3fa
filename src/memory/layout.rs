//! Fixed geometry of the heap.
//!
//! Everything here is part of the address encoding: a pointer's size class
//! is recovered from its address bits alone, so these values must agree
//! between the code that hands out pages and the code that classifies
//! pointers. Relations between them are checked at build time.

use static_assertions::const_assert;

pub const PAGE_SIZE_EXP: usize = 12;
pub const PAGE_SIZE: usize = 1 << PAGE_SIZE_EXP;
pub(crate) const PAGE_MASK: usize = PAGE_SIZE - 1;

pub const ALIGNMENT_EXP: usize = 4;
pub const ALIGNMENT: usize = 1 << ALIGNMENT_EXP;

/// Largest request served from a size-class bucket.
pub const MAX_BUCKET_SIZE: usize = 2 * PAGE_SIZE;

pub const BUCKET_COUNT_EXP: usize = 6;
pub const BUCKET_COUNT: usize = 1 << BUCKET_COUNT_EXP;

/// Regions are 8 MiB reservations split into `BUCKET_COUNT` buckets.
pub const RESERVATION_SIZE_EXP: usize = 23;
pub const RESERVATION_SIZE: usize = 1 << RESERVATION_SIZE_EXP;

pub const PAGES_PER_BUCKET_EXP: usize = RESERVATION_SIZE_EXP - BUCKET_COUNT_EXP - PAGE_SIZE_EXP;
pub const PAGES_PER_BUCKET: usize = 1 << PAGES_PER_BUCKET_EXP;

/// Pages committed at once when a bucket runs out of committed pages.
pub const COMMIT_PAGE_COUNT_EXP: usize = 4;
pub const COMMIT_PAGE_COUNT: usize = 1 << COMMIT_PAGE_COUNT_EXP;

/// Pages handed to a size class per free-list refill.
pub const MULTIPAGE_PAGE_COUNT_EXP: usize = 3;
pub const MULTIPAGE_PAGE_COUNT: usize = 1 << MULTIPAGE_PAGE_COUNT_EXP;

/// Bits of the page number that carry bucket index and page-in-bucket.
pub(crate) const REGION_PAGE_BITS: usize = BUCKET_COUNT_EXP + PAGES_PER_BUCKET_EXP;

pub const BULK_BLOCK_SIZE_EXP: usize = 23;
pub const BULK_BLOCK_SIZE: usize = 1 << BULK_BLOCK_SIZE_EXP;
pub const BULK_BLOCK_PAGES: usize = BULK_BLOCK_SIZE >> PAGE_SIZE_EXP;

/// Bulk requests above this many pages bypass the blocks and go to the OS.
pub const BULK_MAX_IN_BLOCK_PAGES: usize = 32;

/// Largest page count the page cache keeps lists for.
pub const MAX_CACHED_PAGES: usize = 20;

pub(crate) const fn align_up(value: usize, align: usize) -> usize {
    (value + align - 1) & !(align - 1)
}

/// Pages covering `size` bytes, or `None` when the rounded size overflows
/// or exceeds `isize::MAX`.
pub(crate) const fn pages_for(size: usize) -> Option<usize> {
    match size.checked_add(PAGE_MASK) {
        Some(padded) if padded <= isize::MAX as usize => Some(padded >> PAGE_SIZE_EXP),
        _ => None,
    }
}

#[inline]
pub(crate) fn page_offset(addr: usize) -> usize {
    addr & PAGE_MASK
}

#[inline]
pub(crate) fn page_start(addr: usize) -> usize {
    addr & !PAGE_MASK
}

const_assert!(PAGE_SIZE.is_power_of_two());
const_assert!(ALIGNMENT <= PAGE_SIZE);
const_assert!(RESERVATION_SIZE_EXP == BUCKET_COUNT_EXP + PAGES_PER_BUCKET_EXP + PAGE_SIZE_EXP);
const_assert!(PAGES_PER_BUCKET % COMMIT_PAGE_COUNT == 0);
const_assert!(MULTIPAGE_PAGE_COUNT <= PAGES_PER_BUCKET);
const_assert!(COMMIT_PAGE_COUNT % MULTIPAGE_PAGE_COUNT == 0);
const_assert!(MAX_BUCKET_SIZE % PAGE_SIZE == 0);
const_assert!(BULK_MAX_IN_BLOCK_PAGES < BULK_BLOCK_PAGES);
const_assert!(MAX_CACHED_PAGES <= PAGES_PER_BUCKET);
