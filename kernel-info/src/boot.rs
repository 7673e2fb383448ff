//! Bootloader hand-off structures.
//!
//! The loader exits boot services, builds these records in memory that
//! survives the jump, and passes a [`BootInfo`] to the kernel entry point.

/// Classification of one physical memory map entry.
///
/// Only [`MemoryKind::Usable`] regions are handed to the physical page
/// allocator; everything else is left untouched.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum MemoryKind {
    /// Free conventional memory.
    Usable,
    /// Firmware-reserved; never touched.
    Reserved,
    /// Loader data structures the kernel may reclaim once it no longer
    /// reads the hand-off. Treated as reserved by the VM core.
    BootloaderReclaimable,
    /// The loaded kernel image itself.
    KernelImage,
    /// Linear framebuffer aperture.
    Framebuffer,
}

/// One entry of the bootloader-provided physical memory map.
///
/// `base` and `length` are byte values; usable entries are guaranteed by
/// the loader to be 4 KiB aligned.
#[derive(Copy, Clone, Debug)]
pub struct MemoryRegion {
    pub base: u64,
    pub length: u64,
    pub kind: MemoryKind,
}

/// Physical placement and section sizes of the loaded kernel image.
///
/// The sections are laid out back to back, page aligned, in the order
/// `.text`, `.rodata`, `.data`/`.bss` — this matches the linker script and
/// lets the VM core derive each section's physical base from `phys_base`
/// alone.
#[derive(Copy, Clone, Debug)]
pub struct KernelImage {
    /// Physical address the image was loaded at.
    pub phys_base: u64,
    /// Size of the executable section, page aligned.
    pub text_size: u64,
    /// Size of the read-only data section, page aligned.
    pub rodata_size: u64,
    /// Combined size of mutable data and zero-fill, page aligned.
    pub data_size: u64,
}

/// Geometry of the loader-provided linear framebuffer.
#[derive(Copy, Clone, Debug)]
pub struct Framebuffer {
    pub phys_base: u64,
    /// Bytes per scanline.
    pub pitch: u64,
    pub width: u64,
    pub height: u64,
}

impl Framebuffer {
    /// Total byte length of the framebuffer, not yet page rounded.
    #[must_use]
    pub const fn byte_len(&self) -> u64 {
        self.height * self.pitch
    }
}

/// Everything the bootloader tells the kernel.
#[derive(Clone, Debug)]
pub struct BootInfo<'a> {
    pub memory_map: &'a [MemoryRegion],
    pub kernel: KernelImage,
    pub framebuffer: Option<Framebuffer>,
}
