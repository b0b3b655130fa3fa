use std::io;

use thiserror::Error;

use super::heap::HeapState;
use super::vm::VmError;

#[derive(Debug, Error)]
pub enum HeapError {
    /// The OS refused a reservation or commit. Never retried.
    #[error("out of memory while requesting {requested} bytes")]
    OutOfMemory {
        requested: usize,
        #[source]
        source: VmError,
    },
    #[error("protocol violation: {0}")]
    ProtocolViolation(#[from] Violation),
    #[error("heap is {0:?}, expected Active")]
    NotActive(HeapState),
    #[error("platform page size {actual} does not match the compiled page size {expected}")]
    UnsupportedPageSize { actual: usize, expected: usize },
}

impl HeapError {
    /// `map_err` adapter for VM failures while obtaining `requested` bytes.
    pub(crate) fn out_of_memory(requested: usize) -> impl FnOnce(VmError) -> Self {
        move |source| HeapError::OutOfMemory { requested, source }
    }

    /// A request too large to describe as a mapping at all.
    pub(crate) fn too_large(requested: usize) -> Self {
        HeapError::OutOfMemory {
            requested,
            source: VmError::ReservationFailed(io::Error::from(io::ErrorKind::OutOfMemory)),
        }
    }
}

/// Misuse or corruption found by the consistency checks.
#[derive(Clone, Copy, Debug, Error, PartialEq, Eq)]
pub enum Violation {
    #[error("pointer {0:#x} is not owned by this heap")]
    ForeignPointer(usize),
    #[error("pointer {0:#x} freed twice")]
    DoubleFree(usize),
    #[error("free list of class {class} is corrupt at {addr:#x}")]
    CorruptFreeList { class: usize, addr: usize },
    #[error("bulk free list {bucket} is corrupt at {addr:#x}")]
    CorruptBulkFreeList { bucket: usize, addr: usize },
    #[error("bulk block {block:#x} is corrupt at chunk {chunk:#x}: {reason}")]
    CorruptBlock {
        block: usize,
        chunk: usize,
        reason: &'static str,
    },
}
