//! Error taxonomy of the VM core.
//!
//! Everything recoverable propagates as a [`MapError`] to the immediate
//! kernel caller, never to userspace. Policy violations — double frees,
//! zone magic mismatches, guard-page touches, unhandled kernel faults —
//! are panics, not error values.

use kernel_vmem::WalkError;

#[derive(Copy, Clone, Debug, Eq, PartialEq, thiserror::Error)]
pub enum MapError {
    /// Null, unaligned, or zero-length input.
    #[error("invalid argument")]
    InvalidArgument,

    /// The entry or placement being looked up is not present.
    #[error("not found in this map")]
    NotFound,

    /// The placement would violate range disjointness.
    #[error("placement overlaps an existing entry")]
    Overlap,

    /// The physical allocator has no frames left.
    #[error("out of physical memory")]
    OutOfMemory,

    /// A 1 GiB or 2 MiB leaf sits where a child table was expected.
    #[error("large-page leaf blocks the operation")]
    BlockedByLargePage,

    /// Virtual address bits 63..47 are inconsistent.
    #[error("virtual address is not canonical")]
    NonCanonical,

    /// `Map::new` was asked to default its parent before any kernel map
    /// was registered.
    #[error("no kernel map registered")]
    NoKernelMap,

    /// A fault was delivered to a fully resident region; there is
    /// nothing to demand-page, so the fault is a bug.
    #[error("fault on a fully resident region")]
    ResidentFault,
}

impl From<WalkError> for MapError {
    fn from(err: WalkError) -> Self {
        match err {
            WalkError::NonCanonical => Self::NonCanonical,
            WalkError::OutOfMemory => Self::OutOfMemory,
            WalkError::BlockedByLargePage => Self::BlockedByLargePage,
            WalkError::NotMapped => Self::NotFound,
        }
    }
}
