// Unified synchronization primitive shim.
//
// Under `cfg(loom)`, re-exports from `loom`. Otherwise, re-exports from `std`.
//
// **Every** file in the crate must import sync primitives through this module.
// A single direct `use std::sync::atomic::*` would bypass loom's scheduler and
// silently break exhaustive testing.

// ---------------------------------------------------------------------------
// atomic
// ---------------------------------------------------------------------------
pub(crate) mod atomic {
    #[cfg(loom)]
    pub(crate) use loom::sync::atomic::{AtomicIsize, Ordering};

    #[cfg(not(loom))]
    pub(crate) use std::sync::atomic::{AtomicIsize, Ordering};
}

// ---------------------------------------------------------------------------
// Test-only primitives
// ---------------------------------------------------------------------------
#[cfg(all(test, loom))]
pub(crate) use loom::sync::Arc;

#[cfg(all(test, not(loom)))]
pub(crate) use std::sync::Arc;

// loom has no Barrier; only the std test suites use it.
#[cfg(all(test, not(loom)))]
pub(crate) use std::sync::Barrier;


// ---------------------------------------------------------------------------
// OnceLock
//
// Only the mmap backend caches state in a static; loom and Miri run on the
// heap-backed fallback instead.
// ---------------------------------------------------------------------------
#[cfg(all(any(target_os = "macos", target_os = "linux"), not(any(loom, miri))))]
pub(crate) use std::sync::OnceLock;

// ---------------------------------------------------------------------------
// Static initialisation helpers
//
// loom atomics are not const-constructible. This macro creates statics that
// work under both loom and std.
// ---------------------------------------------------------------------------

/// Declare a `static` atomic. Under std, uses `const` init. Under loom,
/// uses `loom::lazy_static!` so the value is re-created for each model run.
///
/// Usage: `static_atomic! { pub static NAME: Type = init_expr; }`
macro_rules! static_atomic {
    (pub static $NAME:ident : $Ty:ty = $init:expr ;) => {
        #[cfg(not(loom))]
        pub static $NAME: $Ty = $init;

        #[cfg(loom)]
        loom::lazy_static! {
            pub static ref $NAME: $Ty = $init;
        }
    };
}
pub(crate) use static_atomic;
