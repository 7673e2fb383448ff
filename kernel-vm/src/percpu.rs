//! The current-map slot of each processor.
//!
//! This is the VM core's view of the per-CPU locals block: one writable
//! map pointer per processor, read by fault dispatch and swapped by
//! activation. Each slot holds a strong handle, so an installed map
//! cannot be dropped out from under its CPU. The owning CPU accesses
//! only its own slot; the spinlock exists for the cross-CPU reads
//! diagnostics perform.

use crate::handle::ZoneArc;
use crate::map::Map;
use kernel_info::layout::MAX_CPUS;
use kernel_sync::SpinLock;
use kernel_vmem::cpu;

static CURRENT: [SpinLock<Option<ZoneArc<Map>>>; MAX_CPUS] =
    [const { SpinLock::new(None) }; MAX_CPUS];

/// The map installed on the calling processor, if any.
#[must_use]
pub fn current_map() -> Option<ZoneArc<Map>> {
    current_on(cpu::ops().current_cpu())
}

/// The map installed on `cpu`, if any.
#[must_use]
pub fn current_on(cpu: usize) -> Option<ZoneArc<Map>> {
    CURRENT[cpu].lock().clone()
}

/// Install `map` as current on `cpu`, returning the previous occupant.
pub(crate) fn swap_current(cpu: usize, map: Option<ZoneArc<Map>>) -> Option<ZoneArc<Map>> {
    core::mem::replace(&mut *CURRENT[cpu].lock(), map)
}
