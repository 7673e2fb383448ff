//! # Kernel Address Layout
//!
//! The fixed carve-up of the upper (kernel) half of the 48-bit virtual
//! address space. Every region is sized and aligned so it occupies whole
//! top-level page-table slots, which keeps the layout trivially shareable
//! between address spaces.
//!
//! ```text
//! 0xffff_8000_0000_0000 ── physical aperture (2 TiB, 1 GiB leaves)
//! 0xffff_8200_0000_0000 ── (unused)
//! 0xffff_c000_0000_0000 ── virtual page allocator window (512 GiB)
//! 0xffff_c080_0000_0000 ── (unused)
//! 0xffff_e800_0000_0000 ── framebuffer
//! 0xffff_ffff_8000_0000 ── kernel image (1 GiB reserved)
//! ```

/// Base page size of the platform, in bytes.
pub const PAGE_SIZE: u64 = 4096;

/// Log2 of [`PAGE_SIZE`].
pub const PAGE_SHIFT: u32 = 12;

/// First virtual address belonging to the kernel half.
///
/// Anything at or above this address is mapped identically in every
/// address space; anything below it is per-process.
pub const KERNEL_BOUNDARY: u64 = 0xffff_8000_0000_0000;

/// Start of the permanent physical aperture.
pub const PHYS_APERTURE_START: u64 = 0xffff_8000_0000_0000;

/// One past the last byte of the physical aperture (2 TiB span).
///
/// The aperture linearly maps physical memory `[0, span)` read/write with
/// 1 GiB leaves; it must cover at least all installed RAM.
pub const PHYS_APERTURE_END: u64 = PHYS_APERTURE_START + (2 << 40);

/// Start of the kernel virtual page allocator's window.
pub const VALLOC_START: u64 = 0xffff_c000_0000_0000;

/// One past the end of the virtual page allocator's window (512 GiB).
pub const VALLOC_END: u64 = VALLOC_START + (512 << 30);

/// Virtual base the framebuffer is mapped at.
pub const FRAMEBUFFER_BASE: u64 = 0xffff_e800_0000_0000;

/// Virtual base of the kernel image sections.
pub const KERNEL_IMAGE_START: u64 = 0xffff_ffff_8000_0000;

/// One past the reserved kernel image range (1 GiB reserved).
pub const KERNEL_IMAGE_END: u64 = 0xffff_ffff_c000_0000;

/// Unmapped pages inserted after every virtual page allocation to trap
/// overruns.
pub const GUARD_PAGES: usize = 2;

/// Upper bound on processors the VM core tracks.
pub const MAX_CPUS: usize = 64;

/// Physical memory below this boundary is set aside for legacy DMA and
/// excluded from the general allocation pool (16 MiB).
pub const PHYS_ALLOC_FLOOR: u64 = 0x100_0000;

/// Usable physical regions shorter than this are dropped outright; the
/// fixed bookkeeping overhead is not worth the handful of frames (64 KiB).
pub const MIN_PHYS_REGION: u64 = 0x1_0000;

const _: () = {
    assert!(PAGE_SIZE == 1 << PAGE_SHIFT);
    assert!(PHYS_APERTURE_START == KERNEL_BOUNDARY);
    assert!(PHYS_APERTURE_END <= VALLOC_START);
    assert!(VALLOC_END <= FRAMEBUFFER_BASE);
    assert!(FRAMEBUFFER_BASE < KERNEL_IMAGE_START);
    assert!(KERNEL_IMAGE_START < KERNEL_IMAGE_END);
    assert!(PHYS_APERTURE_START % (1 << 39) == 0);
    assert!(VALLOC_START % PAGE_SIZE == 0 && VALLOC_END % PAGE_SIZE == 0);
    assert!(PHYS_ALLOC_FLOOR % PAGE_SIZE == 0);
    assert!(MIN_PHYS_REGION % PAGE_SIZE == 0);
    assert!(MAX_CPUS <= 64); // mapped-CPU bitmaps are a single u64
};
