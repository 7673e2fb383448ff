//! Access to physical memory: the mapper seam, the boot window, and the
//! permanent aperture.
//!
//! All reads and writes of page-table frames funnel through a
//! [`PhysMapper`], the one place physical addresses become dereferenceable
//! pointers. The kernel carries two implementations with an explicit
//! hand-over between them:
//!
//! 1. [`BootWindow`] — the bootloader's direct map, valid until the kernel
//!    map is activated.
//! 2. [`Aperture`] — the permanent kernel-virtual window that linearly
//!    maps physical memory at [`layout::PHYS_APERTURE_START`].
//!
//! [`PHYS_ACCESS`] is the switchable combination of the two that global
//! allocator state uses.

use crate::addresses::PhysAddr;
use crate::layout;
use core::sync::atomic::{AtomicBool, AtomicU64, Ordering};

/// Translates physical addresses into usable pointers in the current
/// virtual address space.
pub trait PhysMapper: Sync {
    /// A pointer through which `pa` can be read and written.
    ///
    /// The returned pointer is only as valid as the underlying window;
    /// callers must not hold it across a window change.
    fn phys_to_ptr(&self, pa: PhysAddr) -> *mut u8;
}

/// Dispenses and reclaims 4 KiB physical page frames.
///
/// Implemented by the physical allocator; the walker pulls intermediate
/// table frames from here, and anonymous regions pull backing frames.
pub trait FrameSource: Sync {
    /// One page-aligned frame, or `None` when memory is exhausted.
    fn alloc_frame(&self) -> Option<PhysAddr>;

    /// Return a frame obtained from [`FrameSource::alloc_frame`].
    fn free_frame(&self, frame: PhysAddr);
}

/// Fill the frame at `frame` with zeroes through `mapper`.
pub fn zero_frame(mapper: &dyn PhysMapper, frame: PhysAddr) {
    debug_assert!(frame.is_page_aligned());
    let ptr = mapper.phys_to_ptr(frame);
    // Safety: the mapper hands out a pointer covering one whole frame.
    unsafe {
        core::ptr::write_bytes(ptr, 0, layout::PAGE_SIZE as usize);
    }
}

/// The bootloader's direct map: physical memory visible at a fixed offset.
///
/// Usable only until the bootloader's page tables are abandoned.
pub struct BootWindow {
    offset: u64,
}

impl BootWindow {
    #[must_use]
    pub const fn new(offset: u64) -> Self {
        Self { offset }
    }
}

impl PhysMapper for BootWindow {
    fn phys_to_ptr(&self, pa: PhysAddr) -> *mut u8 {
        (self.offset + pa.as_u64()) as *mut u8
    }
}

/// The permanent physical aperture.
///
/// Installed into the kernel map as 1 GiB leaves during bring-up; after
/// activation every physical address below the aperture span is readable
/// and writable at `PHYS_APERTURE_START + pa`.
pub struct Aperture;

impl PhysMapper for Aperture {
    fn phys_to_ptr(&self, pa: PhysAddr) -> *mut u8 {
        let span = layout::PHYS_APERTURE_END - layout::PHYS_APERTURE_START;
        assert!(
            pa.as_u64() < span - layout::PAGE_SIZE,
            "physical address {pa} out of aperture range"
        );
        (layout::PHYS_APERTURE_START + pa.as_u64()) as *mut u8
    }
}

/// The kernel's switchable physical access path.
///
/// Starts in early-boot mode, translating through the bootloader window;
/// [`PhysAccess::finish_early_boot`] flips it to the aperture once the
/// kernel map is live. The flip is one-way.
pub struct PhysAccess {
    early: AtomicBool,
    boot_offset: AtomicU64,
}

/// Global instance used by kernel singletons (the physical allocator's
/// bookkeeping, bring-up code). Components that take an explicit
/// `&'static dyn PhysMapper` — every `PageTable` — may point here or at a
/// private mapper.
pub static PHYS_ACCESS: PhysAccess = PhysAccess::new();

impl PhysAccess {
    #[must_use]
    const fn new() -> Self {
        Self {
            early: AtomicBool::new(true),
            boot_offset: AtomicU64::new(0),
        }
    }

    /// Record the bootloader window's offset. Called once, before any
    /// physical memory is touched.
    pub fn begin_early_boot(&self, offset: u64) {
        self.boot_offset.store(offset, Ordering::Release);
    }

    /// Switch to the aperture. Called once, after the kernel map (with
    /// the aperture installed) has been activated.
    pub fn finish_early_boot(&self) {
        self.early.store(false, Ordering::Release);
    }

    /// Whether translation still goes through the bootloader window.
    #[must_use]
    pub fn is_early_boot(&self) -> bool {
        self.early.load(Ordering::Acquire)
    }
}

impl PhysMapper for PhysAccess {
    fn phys_to_ptr(&self, pa: PhysAddr) -> *mut u8 {
        if self.is_early_boot() {
            (self.boot_offset.load(Ordering::Acquire) + pa.as_u64()) as *mut u8
        } else {
            Aperture.phys_to_ptr(pa)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn boot_window_offsets() {
        let w = BootWindow::new(0x1000_0000);
        assert_eq!(w.phys_to_ptr(PhysAddr::new(0x2000)) as u64, 0x1000_2000);
    }

    #[test]
    fn aperture_translates_into_window() {
        let p = Aperture.phys_to_ptr(PhysAddr::new(0x5000)) as u64;
        assert_eq!(p, layout::PHYS_APERTURE_START + 0x5000);
    }

    #[test]
    #[should_panic(expected = "out of aperture range")]
    fn aperture_rejects_out_of_span() {
        let span = layout::PHYS_APERTURE_END - layout::PHYS_APERTURE_START;
        let _ = Aperture.phys_to_ptr(PhysAddr::new(span));
    }

    #[test]
    fn access_switch_is_one_way() {
        let access = PhysAccess::new();
        access.begin_early_boot(0x4000_0000);
        assert!(access.is_early_boot());
        assert_eq!(access.phys_to_ptr(PhysAddr::new(0x123)) as u64, 0x4000_0123);
        access.finish_early_boot();
        assert!(!access.is_early_boot());
        assert_eq!(
            access.phys_to_ptr(PhysAddr::new(0x123)) as u64,
            layout::PHYS_APERTURE_START + 0x123
        );
    }
}
