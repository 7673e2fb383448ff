//! Kernel VM bring-up.
//!
//! Turns the bootloader hand-off into a live kernel address space, in
//! the only order that works:
//!
//! 1. Feed the usable memory map to the physical allocator.
//! 2. Construct the VM manager.
//! 3. Seed the VM-object zones from statically reserved storage — the
//!    kernel map and the bring-up regions exist before the virtual
//!    page allocator that normally feeds the zones.
//! 4. Build the kernel map and install the physical aperture.
//! 5. Place the kernel image sections and the framebuffer.
//! 6. Register and activate the kernel map.
//! 7. Hand allocator bookkeeping over from bootloader mappings to the
//!    aperture, bind the virtual page allocator, and point the zones
//!    at it for all further growth.
//!
//! The caller (platform entry code) supplies the two physical access
//! paths: the early one (the bootloader's direct map) and the permanent
//! one (the aperture). On hardware both are `kernel_vmem::PHYS_ACCESS`
//! before and after its flip; tests pass a simulated store.

use crate::entry::MapEntry;
use crate::handle::{ZoneArc, ZoneObject};
use crate::map::Map;
use crate::valloc::VALLOC;
use crate::zone::DEFAULT_REGION_SIZE;
use crate::{manager, MapError};
use core::cell::UnsafeCell;
use core::ptr::NonNull;
use core::sync::atomic::{AtomicBool, Ordering};
use kernel_alloc::PHYS_ALLOCATOR;
use kernel_info::boot::{BootInfo, KernelImage, MemoryKind};
use kernel_info::layout;
use kernel_vmem::{align_up, AccessMode, PhysAddr, PhysMapper, VirtAddr};

/// Extra page sizes advertised on this platform (2 MiB).
const EXTRA_PAGE_SIZES: [u64; 1] = [0x20_0000];

#[repr(C, align(4096))]
struct BootstrapBytes([u8; DEFAULT_REGION_SIZE]);

/// Statically reserved zone region, handed out exactly once.
struct BootstrapRegion {
    taken: AtomicBool,
    bytes: UnsafeCell<BootstrapBytes>,
}

// Safety: `take` hands the bytes out once; afterwards the zone owns them.
unsafe impl Sync for BootstrapRegion {}

impl BootstrapRegion {
    const fn new() -> Self {
        Self {
            taken: AtomicBool::new(false),
            bytes: UnsafeCell::new(BootstrapBytes([0; DEFAULT_REGION_SIZE])),
        }
    }

    fn take(&self) -> NonNull<u8> {
        assert!(
            !self.taken.swap(true, Ordering::AcqRel),
            "bootstrap zone region taken twice"
        );
        NonNull::new(self.bytes.get().cast::<u8>()).unwrap()
    }
}

/// Storage for the maps that must exist before the virtual allocator.
static MAP_BOOTSTRAP: BootstrapRegion = BootstrapRegion::new();

/// Storage for the bring-up map entries, likewise.
static ENTRY_BOOTSTRAP: BootstrapRegion = BootstrapRegion::new();

/// Bring the VM core up from the bootloader hand-off.
///
/// Returns the activated kernel map. One-shot: everything here is
/// guarded global state.
///
/// # Errors
/// Propagates allocation failures while the kernel map is being built.
///
/// # Panics
/// On re-initialization of any global, and on a kernel image that does
/// not fit its reserved range.
pub fn bring_up(
    boot: &BootInfo<'_>,
    early_mapper: &'static dyn PhysMapper,
    aperture_mapper: &'static dyn PhysMapper,
) -> Result<ZoneArc<Map>, MapError> {
    PHYS_ALLOCATOR.init(early_mapper, layout::PAGE_SIZE, &EXTRA_PAGE_SIZES);
    for region in boot.memory_map {
        if region.kind != MemoryKind::Usable {
            continue;
        }
        PHYS_ALLOCATOR.add_region(region.base, region.length);
    }
    log::info!(
        "available memory: {} KiB",
        PHYS_ALLOCATOR.total_pages() * (layout::PAGE_SIZE / 1024)
    );

    manager::init();

    // The kernel map and the bring-up entries are built from statically
    // reserved zone regions; the real region source arrives below.
    unsafe {
        Map::zone().seed(MAP_BOOTSTRAP.take(), DEFAULT_REGION_SIZE);
        MapEntry::zone().seed(ENTRY_BOOTSTRAP.take(), DEFAULT_REGION_SIZE);
    }

    let map = Map::root(early_mapper, &PHYS_ALLOCATOR)?;
    map.install_phys_aperture()?;

    map_kernel_sections(&map, &boot.kernel)?;

    if let Some(fb) = &boot.framebuffer {
        let length = align_up(fb.byte_len(), layout::PAGE_SIZE);
        let entry = MapEntry::contiguous(
            PhysAddr::new(fb.phys_base),
            length,
            AccessMode::KERNEL_RW,
        )?;
        map.add(VirtAddr::new(layout::FRAMEBUFFER_BASE), &entry)?;
        log::debug!("framebuffer: 0x{:x} + 0x{length:x}", fb.phys_base);
    } else {
        log::warn!("bootloader provided no framebuffer");
    }

    Map::register_kernel(&map);
    map.activate();

    PHYS_ALLOCATOR.remap_to(aperture_mapper);
    VALLOC.attach(ZoneArc::clone(&map));
    // From here on the zones grow out of the virtual page allocator.
    Map::zone().set_source(&VALLOC);
    MapEntry::zone().set_source(&VALLOC);

    Ok(map)
}

/// Place the kernel's `.text`, `.rodata`, and `.data`/`.bss` sections.
///
/// The loader lays them out back to back from the image's physical
/// base, in this order, page aligned; permissions tighten accordingly.
fn map_kernel_sections(map: &ZoneArc<Map>, image: &KernelImage) -> Result<(), MapError> {
    let sections = [
        (".text", image.text_size, AccessMode::KERNEL_EXEC),
        (".rodata", image.rodata_size, AccessMode::KERNEL_READ),
        (".data", image.data_size, AccessMode::KERNEL_RW),
    ];

    let mut phys = image.phys_base;
    let mut virt = layout::KERNEL_IMAGE_START;
    for (name, size, mode) in sections {
        let length = align_up(size, layout::PAGE_SIZE);
        assert!(
            virt + length <= layout::KERNEL_IMAGE_END,
            "kernel image overflows its reserved range"
        );

        let entry = MapEntry::contiguous(PhysAddr::new(phys), length, mode)?;
        map.add(VirtAddr::new(virt), &entry)?;
        log::debug!("{name:>8}: phys=0x{phys:016x} virt=0x{virt:016x} +0x{length:x}");

        phys += length;
        virt += length;
    }
    Ok(())
}
