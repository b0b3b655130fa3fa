//! Half-exponential size classes.
//!
//! Classes 0 and 1 are 16 and 32 bytes. From there every power-of-two octave
//! holds two classes, `1.5 * 2^k` and `2^(k+1)`:
//!
//! ```text
//! idx:  0  1  2  3  4   5   6   7   8   ...  16    17
//! size: 16 32 48 64 96 128 192 256 384  ... 6144  8192
//! ```
//!
//! Worst-case waste is a third of the slot (a 65-byte request lands in the
//! 96-byte class).
//! The class index doubles as the bucket index in the page source, so the
//! mapping has to be identical on the allocate and deallocate sides.

use static_assertions::const_assert;

use super::layout::{ALIGNMENT, ALIGNMENT_EXP, BUCKET_COUNT, MAX_BUCKET_SIZE};

/// Map a request size to its class. `size == 0` maps to class 0.
#[inline]
pub const fn size_to_class(size: usize) -> usize {
    if size <= ALIGNMENT {
        return 0;
    }
    if size <= 2 * ALIGNMENT {
        return 1;
    }
    let s = size - 1;
    let msb = (usize::BITS - 1 - s.leading_zeros()) as usize;
    // The bit below the top one picks the lower or upper half of the octave.
    let half = (s >> (msb - 1)) & 1;
    ((msb - (ALIGNMENT_EXP + 1)) << 1) + 2 + half
}

/// Slot size of a class.
#[inline]
pub const fn class_to_size(class: usize) -> usize {
    match class {
        0 => ALIGNMENT,
        1 => 2 * ALIGNMENT,
        _ => {
            let octave_base = 1usize << (((class - 2) >> 1) + ALIGNMENT_EXP + 1);
            if class & 1 == 0 {
                octave_base + (octave_base >> 1)
            } else {
                octave_base << 1
            }
        }
    }
}

/// Number of classes actually populated; buckets above this stay unused.
pub const CLASS_COUNT: usize = size_to_class(MAX_BUCKET_SIZE) + 1;

const_assert!(CLASS_COUNT <= BUCKET_COUNT);
const_assert!(class_to_size(CLASS_COUNT - 1) == MAX_BUCKET_SIZE);
const_assert!(class_to_size(2) % ALIGNMENT == 0);
