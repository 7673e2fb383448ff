//! The VM manager: one-time initialization and page-fault dispatch.
//!
//! Fault flow: hardware → platform trap → [`handle_fault`] → classify
//! the address → the virtual page allocator's window (always fatal) →
//! the current map's placements → on an unhandled kernel-mode fault,
//! panic with the decoded access; on an unhandled user-mode fault,
//! forward to the task layer (stub — the termination path lives in the
//! scheduler).

use crate::entry::FaultOutcome;
use crate::map::Map;
use crate::valloc::VALLOC;
use crate::MapError;
use kernel_sync::SyncOnceCell;
use kernel_vmem::{FaultAccess, PageTable, VirtAddr};

/// Portable slice of the processor state a fault handler needs.
///
/// The platform trap layer fills this from its exception frame.
#[derive(Copy, Clone, Debug)]
pub struct TrapState {
    pc: VirtAddr,
    error_code: u64,
}

impl TrapState {
    #[must_use]
    pub fn new(pc: VirtAddr, error_code: u64) -> Self {
        Self { pc, error_code }
    }

    /// Program counter at the time of the fault.
    #[must_use]
    pub fn pc(&self) -> VirtAddr {
        self.pc
    }

    /// Raw hardware error code.
    #[must_use]
    pub fn error_code(&self) -> u64 {
        self.error_code
    }
}

struct VmManager {
    _private: (),
}

static MANAGER: SyncOnceCell<VmManager> = SyncOnceCell::new();

/// Construct the global VM manager. Must precede any other VM call and
/// happens exactly once, early in boot.
///
/// # Panics
/// On re-initialization.
pub fn init() {
    assert!(
        MANAGER.set(VmManager { _private: () }).is_ok(),
        "cannot re-initialize VM manager"
    );
}

/// Whether [`init`] has run.
#[must_use]
pub fn is_initialized() -> bool {
    MANAGER.get().is_some()
}

/// Dispatch a page fault at `addr`.
///
/// # Panics
/// On any fault inside the virtual allocator's window, and on kernel-mode
/// faults nothing volunteered to handle.
pub fn handle_fault(state: &TrapState, addr: VirtAddr) {
    let access = PageTable::decode_fault(state.error_code());
    log::trace!("page fault at {addr} ({access:?}, pc {})", state.pc());

    // Guard pages and stale allocations surface here; never survivable.
    if VALLOC.contains(addr) {
        VALLOC.handle_fault(state, addr, access);
    }

    let mut handler_error: Option<MapError> = None;
    if let Some(map) = Map::current() {
        match map.fault(state, addr, access) {
            Ok(FaultOutcome::Handled) => return,
            Ok(FaultOutcome::NotHandled) => {}
            Err(err) => handler_error = Some(err),
        }
    }

    if state.pc().is_kernel() {
        match handler_error {
            Some(err) => panic!(
                "kernel page fault at {addr} failed in its handler: {err} ({access:?}, pc {})",
                state.pc()
            ),
            None => panic!(
                "unhandled kernel page fault at {addr} ({access:?}, pc {})",
                state.pc()
            ),
        }
    }

    forward_to_task(state, addr, access);
}

/// Hand an unhandled user fault to the owning task.
///
/// Interface stub: the fault is recorded here and the termination path
/// is the scheduler's business.
fn forward_to_task(state: &TrapState, addr: VirtAddr, access: FaultAccess) {
    log::warn!(
        "task fault at {addr} ({access:?}, pc {}); terminating task",
        state.pc()
    );
}
