//! Virtual memory maps.
//!
//! A [`Map`] corresponds 1:1 to one hardware page-table tree. Entries are
//! placed at disjoint virtual ranges, kept sorted by base so lookup is a
//! tree search and overlap checking only ever consults the immediate
//! neighbors.
//!
//! Maps live in their own zone and are handled through
//! [`ZoneArc<Map>`]; operations that hand out references to the map
//! itself (activation, placement) hang off the handle, everything else
//! off the map.
//!
//! Derived maps copy the kernel map's upper-half top-level slots at
//! construction and must never let them diverge; placements into the
//! kernel half are therefore rejected on anything but the kernel map
//! itself.

use crate::entry::{FaultOutcome, MapEntry};
use crate::handle::{RcSlot, ZoneArc, ZoneObject};
use crate::manager::TrapState;
use crate::zone::Zone;
use crate::{percpu, shootdown, MapError};
use alloc::collections::BTreeMap;
use core::sync::atomic::{AtomicU64, Ordering};
use kernel_sync::{RwSpinLock, SpinLock, SyncOnceCell};
use kernel_vmem::{
    cpu, AccessMode, FaultAccess, FrameSource, Mapping, PageTable, PhysMapper, TlbHint, VirtAddr,
};

/// One past the last lower-half virtual address (2^47).
const LOWER_HALF_END: u64 = 1 << 47;

/// The registered kernel map; parent of every map created without one.
static KERNEL_MAP: SyncOnceCell<ZoneArc<Map>> = SyncOnceCell::new();

/// Slab pool backing every [`Map`] instance.
static MAP_ZONE: Zone<RcSlot<Map>> = Zone::new("vm-maps");

impl ZoneObject for Map {
    fn zone() -> &'static Zone<RcSlot<Map>> {
        &MAP_ZONE
    }
}

struct Placement {
    entry: ZoneArc<MapEntry>,
}

/// One complete virtual address space.
pub struct Map {
    /// Supplies the shared kernel half. `None` only for root maps.
    parent: Option<ZoneArc<Map>>,
    mapper: &'static dyn PhysMapper,
    frames: &'static dyn FrameSource,
    /// The hardware tree. Its own lock, so fault handling under the
    /// placement read lock can still serialize table writes.
    pt: SpinLock<PageTable>,
    /// Placements keyed by base address.
    placements: RwSpinLock<BTreeMap<u64, Placement>>,
    /// Bit per processor that currently has this map installed.
    mapped_cpus: AtomicU64,
}

impl Map {
    /// A root address space with no parent: a blank tree.
    ///
    /// The first root map of the system becomes the kernel map via
    /// [`Map::register_kernel`]; further root maps exist only in tests.
    ///
    /// # Errors
    /// [`MapError::OutOfMemory`] when no frame is available for the
    /// top-level table, or no zone slot for the map itself.
    pub fn root(
        mapper: &'static dyn PhysMapper,
        frames: &'static dyn FrameSource,
    ) -> Result<ZoneArc<Self>, MapError> {
        let pt = PageTable::new(None, mapper, frames)?;
        ZoneArc::new(Self {
            parent: None,
            mapper,
            frames,
            pt: SpinLock::new(pt),
            placements: RwSpinLock::new(BTreeMap::new()),
            mapped_cpus: AtomicU64::new(0),
        })
        .ok_or(MapError::OutOfMemory)
    }

    /// A derived address space.
    ///
    /// Without an explicit parent the kernel map is used; the parent's
    /// upper-half top-level slots are copied so kernel addresses stay
    /// mapped everywhere.
    ///
    /// # Errors
    /// [`MapError::NoKernelMap`] when defaulting before registration;
    /// [`MapError::OutOfMemory`] when the table frame or the zone slot
    /// cannot be had.
    pub fn new(parent: Option<ZoneArc<Map>>) -> Result<ZoneArc<Self>, MapError> {
        let parent = match parent {
            Some(parent) => parent,
            None => Self::kernel().ok_or(MapError::NoKernelMap)?,
        };
        let (mapper, frames) = (parent.mapper, parent.frames);
        let pt = {
            let parent_pt = parent.pt.lock();
            PageTable::new(Some(&parent_pt), mapper, frames)?
        };
        ZoneArc::new(Self {
            parent: Some(parent),
            mapper,
            frames,
            pt: SpinLock::new(pt),
            placements: RwSpinLock::new(BTreeMap::new()),
            mapped_cpus: AtomicU64::new(0),
        })
        .ok_or(MapError::OutOfMemory)
    }

    /// Register `map` as *the* kernel map.
    ///
    /// # Panics
    /// When a kernel map is already registered.
    pub fn register_kernel(map: &ZoneArc<Map>) {
        assert!(
            KERNEL_MAP.set(ZoneArc::clone(map)).is_ok(),
            "kernel map already registered"
        );
    }

    /// The kernel's address space, once registered.
    #[must_use]
    pub fn kernel() -> Option<ZoneArc<Map>> {
        KERNEL_MAP.get().cloned()
    }

    /// The map installed on the calling processor.
    #[must_use]
    pub fn current() -> Option<ZoneArc<Map>> {
        percpu::current_map()
    }

    /// Map the permanent physical aperture into this map's tree.
    ///
    /// Part of kernel bring-up, before the map is shared or activated.
    ///
    /// # Errors
    /// [`MapError::OutOfMemory`] when PDPT frames cannot be allocated.
    pub fn install_phys_aperture(&self) -> Result<(), MapError> {
        self.pt.lock().install_phys_aperture()?;
        Ok(())
    }

    /// Bookkeeping when this map stops being current on `cpu`.
    pub(crate) fn deactivate(&self, cpu: usize) {
        self.mapped_cpus.fetch_and(!(1 << cpu), Ordering::AcqRel);
    }

    /// Processors that currently have this map installed.
    #[must_use]
    pub fn mapped_cpus(&self) -> u64 {
        self.mapped_cpus.load(Ordering::Acquire)
    }

    /// Remove `entry` from this map.
    ///
    /// Unmaps the entry's whole range, takes it out of the placement set,
    /// and only then invalidates the range everywhere
    /// (`ALL | UNMAPPED`) — after this returns, no CPU holds a stale
    /// translation for it.
    ///
    /// # Errors
    /// [`MapError::NotFound`] when the entry is not placed here.
    /// Shootdown failures propagate.
    pub fn remove(&self, entry: &ZoneArc<MapEntry>) -> Result<(), MapError> {
        let (base, len) = {
            let mut placements = self.placements.write();
            let found = placements
                .iter()
                .find(|(_, p)| ZoneArc::ptr_eq(&p.entry, entry))
                .map(|(base, p)| (*base, p.entry.length()));
            let Some((base, len)) = found else {
                return Err(MapError::NotFound);
            };
            entry.will_remove_from(VirtAddr::new(base), self, &self.pt)?;
            placements.remove(&base);
            (base, len)
        };
        // The placement is gone before the shootdown starts; the write
        // lock is not held across the spin.
        self.invalidate_tlb(VirtAddr::new(base), len, TlbHint::ALL | TlbHint::UNMAPPED)
    }

    /// The placement covering `vaddr`, with its base and length.
    #[must_use]
    pub fn entry_at(&self, vaddr: VirtAddr) -> Option<(ZoneArc<MapEntry>, VirtAddr, u64)> {
        let placements = self.placements.read();
        let (base, placement) = placements.range(..=vaddr.as_u64()).next_back()?;
        let len = placement.entry.length();
        (vaddr.as_u64() - base < len).then(|| {
            (
                ZoneArc::clone(&placement.entry),
                VirtAddr::new(*base),
                len,
            )
        })
    }

    /// Service a page fault at `addr`.
    ///
    /// Finds the covering placement and delegates to the entry. No
    /// covering placement means the fault is not this map's to handle.
    ///
    /// # Errors
    /// Entry handler errors propagate (resident-region faults, OOM
    /// during fault-in).
    pub fn fault(
        &self,
        _state: &TrapState,
        addr: VirtAddr,
        access: FaultAccess,
    ) -> Result<FaultOutcome, MapError> {
        let placements = self.placements.read();
        let Some((base, placement)) = placements
            .range(..=addr.as_u64())
            .next_back()
            .filter(|(base, p)| addr.as_u64() - *base < p.entry.length())
        else {
            return Ok(FaultOutcome::NotHandled);
        };

        let offset = addr.as_u64() - base;
        assert!(
            offset <= placement.entry.length(),
            "invalid fault offset: base 0x{base:x} fault {addr}"
        );
        placement
            .entry
            .fault(self, VirtAddr::new(*base), offset, access, &self.pt)
    }

    /// Invalidate TLBs for `[virt, virt + len)` according to `hints`.
    ///
    /// Local scope flushes this CPU if — and only if — the map is
    /// installed here; remote scope shoots down every other processor in
    /// [`Map::mapped_cpus`]. An empty scope is tolerated as a no-op.
    ///
    /// # Errors
    /// Shootdown failures propagate.
    pub fn invalidate_tlb(&self, virt: VirtAddr, len: u64, hints: TlbHint) -> Result<(), MapError> {
        if hints.scope().is_empty() {
            return Ok(());
        }
        if hints.contains(TlbHint::LOCAL) {
            let me = cpu::ops().current_cpu();
            if self.mapped_cpus() & (1 << me) != 0 {
                self.pt.lock().invalidate_tlb(virt, len, hints);
            }
        }
        if hints.contains(TlbHint::REMOTE) {
            shootdown::broadcast(self, virt, len, hints)?;
        }
        Ok(())
    }

    /// Translate `vaddr` through this map's tree.
    #[must_use]
    pub fn resolve(&self, vaddr: VirtAddr) -> Option<Mapping> {
        self.pt.lock().resolve(vaddr)
    }

    /// Whether growing a placement at `base` to `new_len` bytes would
    /// stay disjoint in this map.
    pub(crate) fn admits_growth(&self, base: VirtAddr, new_len: u64) -> bool {
        let Some(end) = base.as_u64().checked_add(new_len) else {
            return false;
        };
        if base.as_u64() < LOWER_HALF_END && end > LOWER_HALF_END {
            return false;
        }
        let placements = self.placements.read();
        match placements.range(base.as_u64() + 1..).next() {
            Some((next_base, _)) => end <= *next_base,
            None => true,
        }
    }

    /// The frame source backing this map's tables and anonymous pages.
    pub(crate) fn frames(&self) -> &'static dyn FrameSource {
        self.frames
    }

    /// The physical access path for zeroing freshly allocated frames.
    pub(crate) fn mapper(&self) -> &'static dyn PhysMapper {
        self.mapper
    }

    /// The hardware tree, for the virtual page allocator's direct
    /// mapping path.
    pub(crate) fn page_table(&self) -> &SpinLock<PageTable> {
        &self.pt
    }

    /// Mode bits recorded for the placement covering `vaddr`, if any.
    /// Convenience over [`Map::entry_at`].
    #[must_use]
    pub fn mode_at(&self, vaddr: VirtAddr) -> Option<AccessMode> {
        self.entry_at(vaddr).map(|(entry, _, _)| entry.mode())
    }
}

/// Operations that need the shared handle itself: the per-CPU slot
/// stores it, and placed entries keep weak back-references to it.
impl ZoneArc<Map> {
    /// Install this map on the calling processor.
    ///
    /// The previously active map is notified (its CPU bit clears), the
    /// new tree is loaded, the per-CPU current-map slot is updated, and
    /// this CPU's bit is set. Activating the already-active map is a
    /// no-op. Runs with kernel preemption disabled, so the sequence is
    /// atomic with respect to this CPU.
    pub fn activate(&self) {
        let cpu_index = cpu::ops().current_cpu();
        let previous = percpu::current_on(cpu_index);
        if let Some(previous) = &previous {
            if ZoneArc::ptr_eq(previous, self) {
                return;
            }
            previous.deactivate(cpu_index);
        }
        self.pt.lock().activate();
        percpu::swap_current(cpu_index, Some(ZoneArc::clone(self)));
        self.mapped_cpus.fetch_or(1 << cpu_index, Ordering::AcqRel);
    }

    /// Place `entry` at `base`.
    ///
    /// The whole range `[base, base + entry.length())` must be free. No
    /// TLB work happens here: the range was unmapped, and the unmap path
    /// guarantees no processor still caches translations for it.
    ///
    /// # Errors
    /// [`MapError::InvalidArgument`] for unaligned or non-canonical
    /// bases, ranges crossing the canonical hole, or kernel-half
    /// placements on a derived map; [`MapError::Overlap`] when the range
    /// is taken; allocation failures propagate with partial installation
    /// rolled back.
    pub fn add(&self, base: VirtAddr, entry: &ZoneArc<MapEntry>) -> Result<(), MapError> {
        let len = entry.length();
        if !base.is_page_aligned() || !base.is_canonical() {
            return Err(MapError::InvalidArgument);
        }
        let end = base
            .as_u64()
            .checked_add(len)
            .ok_or(MapError::InvalidArgument)?;
        if base.as_u64() < LOWER_HALF_END && end > LOWER_HALF_END {
            return Err(MapError::InvalidArgument);
        }
        // Derived maps share their upper half with the kernel map; a
        // private kernel-half placement would make them diverge.
        if self.parent.is_some() && base.is_kernel() {
            return Err(MapError::InvalidArgument);
        }

        let mut placements = self.placements.write();
        if let Some((prev_base, prev)) = placements.range(..=base.as_u64()).next_back() {
            if prev_base + prev.entry.length() > base.as_u64() {
                return Err(MapError::Overlap);
            }
        }
        if let Some((next_base, _)) = placements.range(base.as_u64()..).next() {
            if end > *next_base {
                return Err(MapError::Overlap);
            }
        }

        entry.added_to(base, self, &self.pt)?;
        placements.insert(
            base.as_u64(),
            Placement {
                entry: ZoneArc::clone(entry),
            },
        );
        log::trace!("placed entry at {base}+{len:#x}");
        Ok(())
    }
}

impl Drop for Map {
    fn drop(&mut self) {
        // An installed map is kept alive by its per-CPU slot; reaching
        // drop with a bit still set means the bitmap is corrupt.
        debug_assert_eq!(self.mapped_cpus(), 0, "dropping an installed map");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::{self, fresh_root_map, Rng};
    use kernel_info::layout;

    fn kernel_read_fault() -> FaultAccess {
        FaultAccess::READ | FaultAccess::SUPERVISOR | FaultAccess::PAGE_NOT_PRESENT
    }

    fn kernel_write_fault() -> FaultAccess {
        FaultAccess::WRITE | FaultAccess::SUPERVISOR | FaultAccess::PAGE_NOT_PRESENT
    }

    fn trap() -> TrapState {
        TrapState::new(VirtAddr::new(0xffff_ffff_8000_1000), 0)
    }

    #[test]
    fn contiguous_placement_resolves_every_page() {
        let (map, _) = fresh_root_map();
        let entry = MapEntry::contiguous(
            kernel_vmem::PhysAddr::new(0x40_0000),
            0x4000,
            AccessMode::KERNEL_RW,
        )
        .unwrap();
        let base = VirtAddr::new(0xffff_d000_0000_0000);
        map.add(base, &entry).unwrap();

        for page in 0..4 {
            let hit = map.resolve(base + page * layout::PAGE_SIZE).unwrap();
            assert_eq!(hit.phys.as_u64(), 0x40_0000 + page * layout::PAGE_SIZE);
            assert_eq!(hit.mode, AccessMode::KERNEL_RW);
        }
        assert!(map.resolve(base + 0x4000).is_none());
    }

    #[test]
    fn overlap_is_rejected_and_map_unchanged() {
        let (map, _) = fresh_root_map();
        let first = MapEntry::anonymous(0x2000, AccessMode::KERNEL_RW).unwrap();
        let second = MapEntry::anonymous(0x1000, AccessMode::KERNEL_RW).unwrap();

        map.add(VirtAddr::new(0x1000), &first).unwrap();
        assert_eq!(
            map.add(VirtAddr::new(0x2000), &second),
            Err(MapError::Overlap)
        );

        let (entry, base, len) = map.entry_at(VirtAddr::new(0x2500)).unwrap();
        assert!(ZoneArc::ptr_eq(&entry, &first));
        assert_eq!(base, VirtAddr::new(0x1000));
        assert_eq!(len, 0x2000);
    }

    #[test]
    fn add_validates_base_addresses() {
        let (map, _) = fresh_root_map();
        let entry = MapEntry::anonymous(0x1000, AccessMode::KERNEL_RW).unwrap();

        assert_eq!(
            map.add(VirtAddr::new(0x1234), &entry),
            Err(MapError::InvalidArgument)
        );
        assert_eq!(
            map.add(VirtAddr::new(0x0000_9000_0000_0000), &entry),
            Err(MapError::InvalidArgument)
        );
        // Crossing the canonical hole.
        let tail = MapEntry::anonymous(0x2000, AccessMode::KERNEL_RW).unwrap();
        assert_eq!(
            map.add(VirtAddr::new(0x0000_7fff_ffff_f000), &tail),
            Err(MapError::InvalidArgument)
        );
    }

    #[test]
    fn derived_maps_reject_kernel_half_placements() {
        let (parent, _) = fresh_root_map();
        let child = Map::new(Some(ZoneArc::clone(&parent))).unwrap();
        let entry = MapEntry::anonymous(0x1000, AccessMode::KERNEL_RW).unwrap();

        assert_eq!(
            child.add(VirtAddr::new(layout::KERNEL_BOUNDARY), &entry),
            Err(MapError::InvalidArgument)
        );
        // The same placement is fine on the root map itself.
        parent
            .add(VirtAddr::new(0xffff_d000_0000_0000), &entry)
            .unwrap();
    }

    #[test]
    fn derived_maps_see_parent_kernel_mappings() {
        let (parent, _) = fresh_root_map();
        let entry = MapEntry::contiguous(
            kernel_vmem::PhysAddr::new(0x80_0000),
            0x1000,
            AccessMode::KERNEL_READ,
        )
        .unwrap();
        let base = VirtAddr::new(0xffff_ffff_8000_0000);
        parent.add(base, &entry).unwrap();

        let child = Map::new(Some(parent)).unwrap();
        let hit = child.resolve(base).unwrap();
        assert_eq!(hit.phys.as_u64(), 0x80_0000);
    }

    #[test]
    fn anonymous_fault_in_allocates_zeroed_page() {
        let (map, _) = fresh_root_map();
        let region = MapEntry::anonymous(0x4000, AccessMode::KERNEL_RW).unwrap();
        let base = VirtAddr::new(0xffff_8100_0000_0000);
        map.add(base, &region).unwrap();

        // Nothing resident before the first touch.
        assert!(map.resolve(base + 0x100).is_none());
        assert_eq!(region.resident_pages(), 0);

        let outcome = map
            .fault(&trap(), base + 0x100, kernel_read_fault())
            .unwrap();
        assert_eq!(outcome, FaultOutcome::Handled);
        assert_eq!(region.resident_pages(), 1);

        let hit = map.resolve(base + 0x100).unwrap();
        assert_eq!(hit.mode, AccessMode::KERNEL_RW);
        assert_eq!(hit.phys.as_u64() % layout::PAGE_SIZE, 0x100);

        // The fresh page reads back as zeroes.
        let frame = map.resolve(base).unwrap().phys;
        let ptr = map.mapper().phys_to_ptr(frame);
        let bytes = unsafe { core::slice::from_raw_parts(ptr, layout::PAGE_SIZE as usize) };
        assert!(bytes.iter().all(|b| *b == 0));
    }

    #[test]
    fn anonymous_write_to_readonly_is_not_handled() {
        let (map, _) = fresh_root_map();
        let region = MapEntry::anonymous(0x2000, AccessMode::KERNEL_READ).unwrap();
        let base = VirtAddr::new(0xffff_8100_1000_0000);
        map.add(base, &region).unwrap();

        let outcome = map.fault(&trap(), base, kernel_write_fault()).unwrap();
        assert_eq!(outcome, FaultOutcome::NotHandled);
        assert_eq!(region.resident_pages(), 0);
    }

    #[test]
    fn fault_on_resident_region_is_an_error() {
        let (map, _) = fresh_root_map();
        let entry = MapEntry::contiguous(
            kernel_vmem::PhysAddr::new(0x90_0000),
            0x1000,
            AccessMode::KERNEL_RW,
        )
        .unwrap();
        let base = VirtAddr::new(0xffff_8100_2000_0000);
        map.add(base, &entry).unwrap();

        assert_eq!(
            map.fault(&trap(), base, kernel_read_fault()),
            Err(MapError::ResidentFault)
        );
    }

    #[test]
    fn fault_outside_any_placement_is_not_handled() {
        let (map, _) = fresh_root_map();
        let outcome = map
            .fault(&trap(), VirtAddr::new(0xffff_8100_3000_0000), kernel_read_fault())
            .unwrap();
        assert_eq!(outcome, FaultOutcome::NotHandled);
    }

    #[test]
    fn shared_anonymous_entry_maps_existing_pages_into_new_map() {
        let (first, _) = fresh_root_map();
        let region = MapEntry::anonymous(0x3000, AccessMode::KERNEL_RW).unwrap();
        let base = VirtAddr::new(0xffff_8100_4000_0000);
        first.add(base, &region).unwrap();
        first
            .fault(&trap(), base + 0x2000, kernel_write_fault())
            .unwrap();

        let (second, _) = fresh_root_map();
        second.add(base, &region).unwrap();

        // The already-resident page is visible through both maps, same
        // frame, same mode.
        let a = first.resolve(base + 0x2000).unwrap();
        let b = second.resolve(base + 0x2000).unwrap();
        assert_eq!(a.phys, b.phys);
        assert_eq!(region.placement_in(&second), Some((base, 0x3000, AccessMode::KERNEL_RW)));
    }

    #[test]
    fn remove_unmaps_and_shoots_down() {
        let (map, _) = fresh_root_map();
        let me = testutil::lease_cpu();
        let other = testutil::lease_cpu();

        let entry = MapEntry::contiguous(
            kernel_vmem::PhysAddr::new(0xa0_0000),
            0x2000,
            AccessMode::KERNEL_RW,
        )
        .unwrap();
        let base = VirtAddr::new(0xffff_8100_5000_0000);

        testutil::set_cpu(other);
        map.activate();
        testutil::set_cpu(me);
        map.activate();
        map.add(base, &entry).unwrap();

        testutil::clear_events(me);
        testutil::clear_events(other);
        map.remove(&entry).unwrap();

        assert!(map.entry_at(base).is_none());
        assert!(map.resolve(base).is_none());
        assert_eq!(map.remove(&entry), Err(MapError::NotFound));

        // Both pages flushed locally and on the remote CPU.
        let mine = testutil::events(me);
        let theirs = testutil::events(other);
        assert_eq!(mine.invalidations, alloc::vec![base.as_u64(), base.as_u64() + 0x1000]);
        assert_eq!(theirs.invalidations, alloc::vec![base.as_u64(), base.as_u64() + 0x1000]);
        assert_eq!(theirs.ipis, 1);

        testutil::set_cpu(other);
        crate::percpu::swap_current(other, None);
        map.deactivate(other);
        testutil::set_cpu(me);
        crate::percpu::swap_current(me, None);
        map.deactivate(me);
    }

    #[test]
    fn activate_is_idempotent_and_switches_cleanly() {
        let (a, _) = fresh_root_map();
        let (b, _) = fresh_root_map();
        let cpu = testutil::lease_cpu();

        a.activate();
        assert_eq!(a.mapped_cpus(), 1 << cpu);
        assert!(ZoneArc::ptr_eq(&Map::current().unwrap(), &a));

        // Re-activation is a no-op; the bit stays set.
        a.activate();
        assert_eq!(a.mapped_cpus(), 1 << cpu);

        // Switching notifies the previous map.
        b.activate();
        assert_eq!(a.mapped_cpus(), 0);
        assert_eq!(b.mapped_cpus(), 1 << cpu);
        assert!(ZoneArc::ptr_eq(&Map::current().unwrap(), &b));

        let loads = testutil::events(cpu).root_loads;
        // Two real activations, one suppressed repeat.
        assert_eq!(loads.len(), 2);

        crate::percpu::swap_current(cpu, None);
        b.deactivate(cpu);
    }

    #[test]
    fn shootdown_targets_only_remote_installed_cpus() {
        let (map, _) = fresh_root_map();
        let cpus: alloc::vec::Vec<usize> = (0..3).map(|_| testutil::lease_cpu()).collect();
        let initiator = testutil::lease_cpu();

        for cpu in &cpus {
            testutil::set_cpu(*cpu);
            map.activate();
        }
        testutil::set_cpu(initiator);
        for cpu in &cpus {
            testutil::clear_events(*cpu);
        }
        testutil::clear_events(initiator);

        let virt = VirtAddr::new(0xffff_8100_6000_0000);
        map.invalidate_tlb(virt, layout::PAGE_SIZE, TlbHint::ALL | TlbHint::UNMAPPED)
            .unwrap();

        for cpu in &cpus {
            let ev = testutil::events(*cpu);
            assert_eq!(ev.ipis, 1, "cpu {cpu} missed its IPI");
            assert_eq!(ev.invalidations, alloc::vec![virt.as_u64()]);
        }
        // The initiator does not have the map installed: no local
        // invalidate, no self-IPI.
        let mine = testutil::events(initiator);
        assert_eq!(mine.ipis, 0);
        assert!(mine.invalidations.is_empty());

        for cpu in &cpus {
            testutil::set_cpu(*cpu);
            crate::percpu::swap_current(*cpu, None);
            map.deactivate(*cpu);
        }
    }

    #[test]
    fn loosened_protection_skips_the_flush() {
        let (map, _) = fresh_root_map();
        let cpu = testutil::lease_cpu();
        map.activate();
        testutil::clear_events(cpu);

        map.invalidate_tlb(
            VirtAddr::new(0xffff_8100_7000_0000),
            layout::PAGE_SIZE,
            TlbHint::LOCAL | TlbHint::PROTECTION_LOOSENED,
        )
        .unwrap();
        assert!(testutil::events(cpu).invalidations.is_empty());

        // Scope-free hints are tolerated as a no-op.
        map.invalidate_tlb(
            VirtAddr::new(0xffff_8100_7000_0000),
            layout::PAGE_SIZE,
            TlbHint::UNMAPPED,
        )
        .unwrap();

        crate::percpu::swap_current(cpu, None);
        map.deactivate(cpu);
    }

    #[test]
    fn randomized_placements_agree_with_model() {
        let (map, _) = fresh_root_map();
        let mut rng = Rng::new(0x5eed_cafe);
        let mut model: alloc::vec::Vec<(u64, u64, ZoneArc<MapEntry>)> = alloc::vec::Vec::new();

        // Random placements over a 1 GiB window; collisions with the
        // model are expected to be rejected identically by the map.
        let window = 0xffff_9000_0000_0000u64;
        for _ in 0..64 {
            let base = window + rng.below(1 << 18) * layout::PAGE_SIZE;
            let len = (1 + rng.below(8)) * layout::PAGE_SIZE;
            let entry = MapEntry::anonymous(len, AccessMode::KERNEL_RW).unwrap();

            let overlaps = model
                .iter()
                .any(|(b, l, _)| base < b + l && *b < base + len);
            let result = map.add(VirtAddr::new(base), &entry);
            if overlaps {
                assert_eq!(result, Err(MapError::Overlap));
            } else {
                result.unwrap();
                model.push((base, len, entry));
            }
        }

        // Occasionally remove one and keep the model in sync.
        for _ in 0..16 {
            if model.is_empty() {
                break;
            }
            let idx = rng.below(model.len() as u64) as usize;
            let (_, _, entry) = model.swap_remove(idx);
            map.remove(&entry).unwrap();
        }

        // Probe: every address resolves to exactly the model's placement.
        for _ in 0..512 {
            let addr = window + rng.below(1 << 19) * 0x777;
            let expect = model
                .iter()
                .find(|(b, l, _)| addr >= *b && addr < b + l)
                .map(|(b, l, e)| (*b, *l, ZoneArc::clone(e)));
            match (map.entry_at(VirtAddr::new(addr)), expect) {
                (None, None) => {}
                (Some((entry, base, len)), Some((eb, el, ee))) => {
                    assert_eq!(base.as_u64(), eb);
                    assert_eq!(len, el);
                    assert!(ZoneArc::ptr_eq(&entry, &ee));
                }
                (got, want) => panic!(
                    "entry_at mismatch at 0x{addr:x}: got {:?}, want {:?}",
                    got.map(|g| g.1),
                    want.map(|w| w.0)
                ),
            }
        }
    }

    #[test]
    fn resize_grow_respects_neighbors_and_shrink_frees() {
        let (map, frames) = fresh_root_map();
        let region = MapEntry::anonymous(0x2000, AccessMode::KERNEL_RW).unwrap();
        let neighbor = MapEntry::anonymous(0x1000, AccessMode::KERNEL_RW).unwrap();
        let base = VirtAddr::new(0xffff_8100_8000_0000);
        map.add(base, &region).unwrap();
        map.add(base + 0x4000, &neighbor).unwrap();

        // Room for one page of growth, not two.
        region.resize(0x3000).unwrap();
        assert_eq!(region.length(), 0x3000);
        assert_eq!(region.resize(0x5000), Err(MapError::Overlap));

        // Fault two pages in, then shrink past one of them.
        map.fault(&trap(), base, kernel_write_fault()).unwrap();
        map.fault(&trap(), base + 0x2000, kernel_write_fault())
            .unwrap();
        assert_eq!(region.resident_pages(), 2);

        let freed_before = frames.freed();
        // The caller's side of the contract: unmap the tail first.
        map.page_table().lock().unmap_page(base + 0x2000).unwrap();
        region.resize(0x1000).unwrap();
        assert_eq!(region.resident_pages(), 1);
        assert_eq!(frames.freed(), freed_before + 1);
        assert_eq!(region.length(), 0x1000);
    }

    #[test]
    fn dropping_entry_returns_faulted_frames() {
        let (map, frames) = fresh_root_map();
        let region = MapEntry::anonymous(0x3000, AccessMode::KERNEL_RW).unwrap();
        let base = VirtAddr::new(0xffff_8100_9000_0000);
        map.add(base, &region).unwrap();
        for page in 0..3 {
            map.fault(&trap(), base + page * layout::PAGE_SIZE, kernel_write_fault())
                .unwrap();
        }

        let freed_before = frames.freed();
        map.remove(&region).unwrap();
        drop(region);
        assert_eq!(frames.freed(), freed_before + 3);
    }
}
