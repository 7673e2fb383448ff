//! CPU-level operations behind a swappable seam.
//!
//! The VM core touches the processor in exactly four ways: asking which
//! CPU it runs on, loading a translation root, dropping a cached
//! translation, and raising the shootdown vector on a peer. All four go
//! through an installed [`CpuOps`] so the SMP transport lives with the
//! platform code and test harnesses can observe every effect.

use crate::addresses::{PhysAddr, VirtAddr};
use kernel_sync::SyncOnceCell;

/// The processor surface the VM core depends on.
pub trait CpuOps: Sync {
    /// Index of the calling processor, `0..MAX_CPUS`.
    fn current_cpu(&self) -> usize;

    /// Load `root` into the translation-control register (CR3). Flushes
    /// non-global TLB entries as an architectural side effect.
    fn load_root(&self, root: PhysAddr);

    /// Drop any cached translation for the page containing `virt` on the
    /// calling processor (`invlpg`).
    fn invalidate_page(&self, virt: VirtAddr);

    /// Raise the TLB-shootdown vector on `cpu`.
    fn send_shootdown_ipi(&self, cpu: usize);
}

static CPU_OPS: SyncOnceCell<&'static dyn CpuOps> = SyncOnceCell::new();

/// Install the processor backend. The first installation wins; later
/// calls are ignored. Must happen before any map is activated or any TLB
/// invalidation is issued.
pub fn install(ops: &'static dyn CpuOps) {
    let _ = CPU_OPS.set(ops);
}

/// The installed backend, defaulting to the single-processor bootstrap
/// implementation.
#[must_use]
pub fn ops() -> &'static dyn CpuOps {
    *CPU_OPS.get_or_init(|| &BootstrapCpu)
}

/// Uniprocessor backend used between kernel entry and SMP bring-up.
///
/// Drives the real hardware for the boot CPU; there is nobody to shoot
/// down yet, so requesting an IPI is a bug.
struct BootstrapCpu;

impl CpuOps for BootstrapCpu {
    fn current_cpu(&self) -> usize {
        0
    }

    #[cfg(target_arch = "x86_64")]
    fn load_root(&self, root: PhysAddr) {
        // Safety: the caller guarantees `root` is a valid top-level table
        // mapping the currently executing code.
        unsafe {
            core::arch::asm!(
                "mov cr3, {}",
                in(reg) root.as_u64(),
                options(nostack, preserves_flags)
            );
        }
    }

    #[cfg(not(target_arch = "x86_64"))]
    fn load_root(&self, _root: PhysAddr) {
        unimplemented!("no translation-root load for this architecture");
    }

    #[cfg(target_arch = "x86_64")]
    fn invalidate_page(&self, virt: VirtAddr) {
        // Safety: invlpg has no requirements beyond CPL 0.
        unsafe {
            core::arch::asm!(
                "invlpg [{}]",
                in(reg) virt.as_u64(),
                options(nostack, preserves_flags)
            );
        }
    }

    #[cfg(not(target_arch = "x86_64"))]
    fn invalidate_page(&self, _virt: VirtAddr) {
        unimplemented!("no TLB invalidation for this architecture");
    }

    fn send_shootdown_ipi(&self, cpu: usize) {
        panic!("shootdown IPI to CPU {cpu} requested before SMP bring-up");
    }
}
