//! Multi-processor TLB shootdown.
//!
//! The initiator enqueues a descriptor on every target CPU's queue,
//! raises the shootdown vector there, and spins until each target has
//! drained the descriptor. There are no timeouts: a processor that never
//! acknowledges leaves the initiator spinning, which is the intended
//! fatal behavior for a wedged CPU.
//!
//! Callers must not hold locks the targets' drain path needs.

use crate::map::Map;
use crate::MapError;
use alloc::sync::Arc;
use alloc::vec::Vec;
use core::hint::spin_loop;
use core::sync::atomic::{AtomicUsize, Ordering};
use kernel_info::layout::{self, MAX_CPUS};
use kernel_sync::SpinLock;
use kernel_vmem::{cpu, TlbHint, VirtAddr};

/// One in-flight invalidation request, shared between the initiator and
/// all targets.
struct Request {
    virt: VirtAddr,
    len: u64,
    hints: TlbHint,
    /// Targets that have not acknowledged yet.
    pending: AtomicUsize,
}

static QUEUES: [SpinLock<Vec<Arc<Request>>>; MAX_CPUS] =
    [const { SpinLock::new(Vec::new()) }; MAX_CPUS];

/// Shoot down `[virt, virt + len)` on every CPU in `map`'s installed set
/// except the caller, and wait for completion.
///
/// Returns immediately when no other CPU has the map installed.
///
/// # Errors
/// None today; the result stands so transport failures can propagate.
pub(crate) fn broadcast(
    map: &Map,
    virt: VirtAddr,
    len: u64,
    hints: TlbHint,
) -> Result<(), MapError> {
    let ops = cpu::ops();
    let me = ops.current_cpu();
    let targets = map.mapped_cpus() & !(1 << me);
    if targets == 0 {
        return Ok(());
    }

    let request = Arc::new(Request {
        virt,
        len,
        hints,
        pending: AtomicUsize::new(targets.count_ones() as usize),
    });

    log::trace!(
        "shootdown {virt}+{len:#x} to cpu mask {targets:#x} ({:?})",
        hints.change()
    );

    for target in 0..MAX_CPUS {
        if targets & (1 << target) == 0 {
            continue;
        }
        QUEUES[target].lock().push(Arc::clone(&request));
        ops.send_shootdown_ipi(target);
    }

    // No timeout: a silent CPU is a fatal condition and we hang here.
    while request.pending.load(Ordering::Acquire) != 0 {
        spin_loop();
    }
    Ok(())
}

/// Drain the calling CPU's shootdown queue.
///
/// Invoked from the shootdown interrupt vector. Each descriptor gets
/// per-page invalidations unless its hints say the change was a pure
/// protection loosening, which the processor is allowed to refetch
/// lazily; the acknowledgment happens either way.
pub fn handle_ipi() {
    let ops = cpu::ops();
    let me = ops.current_cpu();

    loop {
        let request = QUEUES[me].lock().pop();
        let Some(request) = request else {
            return;
        };

        if request.hints.flush_required() {
            let pages = kernel_vmem::page_count(request.len);
            for page in 0..pages {
                ops.invalidate_page(request.virt + page * layout::PAGE_SIZE);
            }
        }
        request.pending.fetch_sub(1, Ordering::Release);
    }
}
