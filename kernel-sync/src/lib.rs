//! # Kernel synchronization primitives
//!
//! Spin-based locks for code that runs with kernel preemption disabled.
//! There is no notion of blocking here: contended acquisitions burn cycles
//! until the owner releases. Critical sections are expected to be short —
//! a handful of page-table writes, a placement-set lookup.

#![cfg_attr(not(test), no_std)]
#![allow(unsafe_code)]

mod once;
mod rw_lock;
mod spin_lock;

pub use once::SyncOnceCell;
pub use rw_lock::{RwSpinLock, RwSpinReadGuard, RwSpinWriteGuard};
pub use spin_lock::{SpinLock, SpinLockGuard};
