//! Placed regions of virtual memory.
//!
//! A [`MapEntry`] lives in the map-entry zone and is shared through
//! [`ZoneArc`]: every map that places it holds one strong handle, and
//! the entry keeps `(map, base)` back-records — weak, to avoid cycles —
//! so it can coordinate resizes. Two backings exist:
//!
//! - **Contiguous physical**: a fixed physical range installed eagerly on
//!   placement. Faults against it are bugs.
//! - **Anonymous**: demand-paged zeroed memory. Pages are allocated on
//!   first touch and owned by the entry regardless of how many maps place
//!   it; they return to the physical allocator when the entry dies.

use crate::handle::{RcSlot, ZoneArc, ZoneObject, ZoneWeak};
use crate::map::Map;
use crate::zone::Zone;
use crate::MapError;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicU64, Ordering};
use kernel_info::layout;
use kernel_sync::{RwSpinLock, SpinLock};
use kernel_vmem::{
    zero_frame, AccessMode, FaultAccess, FrameSource, PageTable, PhysAddr, VirtAddr,
};

/// Slab pool backing every [`MapEntry`] instance.
static ENTRY_ZONE: Zone<RcSlot<MapEntry>> = Zone::new("vm-map-entries");

impl ZoneObject for MapEntry {
    fn zone() -> &'static Zone<RcSlot<MapEntry>> {
        &ENTRY_ZONE
    }
}

/// What a fault handler did with a fault.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum FaultOutcome {
    /// The access can be retried; the translation now exists.
    Handled,
    /// Not this handler's fault to service; try the next one.
    NotHandled,
}

/// One page faulted into an anonymous region.
struct AnonPage {
    /// Page index from the start of the region.
    page_off: u64,
    /// The owned frame backing it.
    frame: PhysAddr,
}

enum Backing {
    Phys {
        base: PhysAddr,
    },
    Anon {
        pages: Vec<AnonPage>,
    },
}

struct EntryState {
    backing: Backing,
    /// Maps this entry is placed in, with the placement base.
    placements: Vec<(ZoneWeak<Map>, VirtAddr)>,
    /// Where anonymous frames came from; set on first fault-in.
    frames: Option<&'static dyn FrameSource>,
}

/// A placed, typed, sized region within one or more maps.
pub struct MapEntry {
    mode: AccessMode,
    /// Byte length; a multiple of the page size. Atomic so lookups can
    /// read it without taking the entry lock.
    length: AtomicU64,
    state: RwSpinLock<EntryState>,
}

impl MapEntry {
    /// A region backed by the fixed physical range
    /// `[phys_base, phys_base + length)`.
    ///
    /// # Errors
    /// [`MapError::InvalidArgument`] for an unaligned base, or a length
    /// of zero or off page multiple; [`MapError::OutOfMemory`] when the
    /// zone has no slot.
    pub fn contiguous(
        phys_base: PhysAddr,
        length: u64,
        mode: AccessMode,
    ) -> Result<ZoneArc<Self>, MapError> {
        if !phys_base.is_page_aligned() || length == 0 || length % layout::PAGE_SIZE != 0 {
            return Err(MapError::InvalidArgument);
        }
        ZoneArc::new(Self {
            mode: mode.normalized(),
            length: AtomicU64::new(length),
            state: RwSpinLock::new(EntryState {
                backing: Backing::Phys { base: phys_base },
                placements: Vec::new(),
                frames: None,
            }),
        })
        .ok_or(MapError::OutOfMemory)
    }

    /// A demand-paged anonymous region of `length` bytes.
    ///
    /// Fresh regions own no memory; frames appear as faults arrive.
    ///
    /// # Errors
    /// [`MapError::InvalidArgument`] for a length of zero or off page
    /// multiple; [`MapError::OutOfMemory`] when the zone has no slot.
    pub fn anonymous(length: u64, mode: AccessMode) -> Result<ZoneArc<Self>, MapError> {
        if length == 0 || length % layout::PAGE_SIZE != 0 {
            return Err(MapError::InvalidArgument);
        }
        ZoneArc::new(Self {
            mode: mode.normalized(),
            length: AtomicU64::new(length),
            state: RwSpinLock::new(EntryState {
                backing: Backing::Anon { pages: Vec::new() },
                placements: Vec::new(),
                frames: None,
            }),
        })
        .ok_or(MapError::OutOfMemory)
    }

    /// Current byte length.
    #[must_use]
    pub fn length(&self) -> u64 {
        self.length.load(Ordering::Acquire)
    }

    /// Protection mode (already normalized: write implies read).
    #[must_use]
    pub fn mode(&self) -> AccessMode {
        self.mode
    }

    #[must_use]
    pub fn is_anonymous(&self) -> bool {
        matches!(self.state.read().backing, Backing::Anon { .. })
    }

    /// Pages an anonymous region has faulted in so far; zero for
    /// physical regions.
    #[must_use]
    pub fn resident_pages(&self) -> usize {
        match &self.state.read().backing {
            Backing::Anon { pages } => pages.len(),
            Backing::Phys { .. } => 0,
        }
    }

    /// This entry's placement as seen from `map`.
    #[must_use]
    pub fn placement_in(&self, map: &Map) -> Option<(VirtAddr, u64, AccessMode)> {
        let state = self.state.read();
        state
            .placements
            .iter()
            .find(|(weak, _)| core::ptr::eq(weak.as_ptr(), map))
            .map(|(_, base)| (*base, self.length(), self.mode))
    }

    /// Remove this entry's translations from `pt` and forget the
    /// placement record. TLB maintenance is the map's job afterwards.
    pub(crate) fn will_remove_from(
        &self,
        base: VirtAddr,
        map: &Map,
        pt: &SpinLock<PageTable>,
    ) -> Result<(), MapError> {
        let mut state = self.state.write();
        state
            .placements
            .retain(|(weak, b)| !(core::ptr::eq(weak.as_ptr(), map) && *b == base));

        let mut pt = pt.lock();
        match &state.backing {
            Backing::Phys { .. } => {
                for i in 0..self.length() / layout::PAGE_SIZE {
                    pt.unmap_page(base + i * layout::PAGE_SIZE)?;
                }
            }
            Backing::Anon { pages } => {
                for page in pages {
                    pt.unmap_page(base + page.page_off * layout::PAGE_SIZE)?;
                }
            }
        }
        Ok(())
    }

    /// Service a fault at `offset` bytes into this entry.
    ///
    /// Only anonymous regions can satisfy anything, and only
    /// page-not-present faults whose access the region's mode permits:
    /// allocate a frame, zero it, record it, install the translation.
    /// No TLB work is needed — the translation was absent, so nothing
    /// stale can be cached.
    pub(crate) fn fault(
        &self,
        map: &Map,
        base: VirtAddr,
        offset: u64,
        access: FaultAccess,
        pt: &SpinLock<PageTable>,
    ) -> Result<FaultOutcome, MapError> {
        let mut guard = self.state.write();
        let state = &mut *guard;
        let pages = match &mut state.backing {
            Backing::Phys { .. } => return Err(MapError::ResidentFault),
            Backing::Anon { pages } => pages,
        };

        if !access.contains(FaultAccess::PAGE_NOT_PRESENT) || !self.mode.permits(access) {
            return Ok(FaultOutcome::NotHandled);
        }

        let page_off = offset / layout::PAGE_SIZE;
        if pages.iter().any(|p| p.page_off == page_off) {
            // Another CPU faulted the same page in first; the
            // translation is already installed.
            return Ok(FaultOutcome::Handled);
        }

        let frames = map.frames();
        let frame = frames.alloc_frame().ok_or(MapError::OutOfMemory)?;
        zero_frame(map.mapper(), frame);

        let va = base + page_off * layout::PAGE_SIZE;
        if let Err(err) = pt.lock().map_page(frame, va, self.mode) {
            frames.free_frame(frame);
            return Err(err.into());
        }

        pages.push(AnonPage { page_off, frame });
        state.frames = Some(frames);
        log::trace!("faulted in page {page_off} at {va} -> {frame}");
        Ok(FaultOutcome::Handled)
    }

    /// Resize an anonymous region.
    ///
    /// Shrinking frees every owned page at or past the new end; the
    /// caller must already have updated every map that places the entry
    /// (unmapping the tail and flushing). Growing is admitted only if no
    /// placing map has a neighbor inside the widened range.
    ///
    /// # Errors
    /// [`MapError::InvalidArgument`] for physical regions, bad lengths,
    /// or a concurrent resize; [`MapError::Overlap`] when growth would
    /// collide with a neighboring placement.
    pub fn resize(&self, new_len: u64) -> Result<(), MapError> {
        if new_len == 0 || new_len % layout::PAGE_SIZE != 0 {
            return Err(MapError::InvalidArgument);
        }
        if !self.is_anonymous() {
            return Err(MapError::InvalidArgument);
        }
        let old_len = self.length();
        if new_len == old_len {
            return Ok(());
        }

        if new_len < old_len {
            let mut state = self.state.write();
            self.length.store(new_len, Ordering::Release);
            let cutoff = new_len / layout::PAGE_SIZE;
            let frames = state.frames;
            if let Backing::Anon { pages } = &mut state.backing {
                if let Some(frames) = frames {
                    pages.retain(|page| {
                        if page.page_off >= cutoff {
                            frames.free_frame(page.frame);
                            false
                        } else {
                            true
                        }
                    });
                }
            }
            return Ok(());
        }

        // Growth: every placing map must have room. The placement list is
        // snapshotted so map locks are never taken under the entry lock.
        let placements = {
            let state = self.state.read();
            state.placements.clone()
        };
        for (weak, base) in &placements {
            if let Some(map) = weak.upgrade() {
                if !map.admits_growth(*base, new_len) {
                    return Err(MapError::Overlap);
                }
            }
        }
        self.length
            .compare_exchange(old_len, new_len, Ordering::AcqRel, Ordering::Acquire)
            .map(|_| ())
            .map_err(|_| MapError::InvalidArgument)
    }
}

impl ZoneArc<MapEntry> {
    /// Install this entry's translations into `pt` at `base`.
    ///
    /// Physical regions map their whole range; anonymous regions map the
    /// pages they already own. A mid-way failure rolls the installed
    /// translations back before returning. On success the placing map is
    /// recorded, weakly, for resize coordination.
    pub(crate) fn added_to(
        &self,
        base: VirtAddr,
        map: &ZoneArc<Map>,
        pt: &SpinLock<PageTable>,
    ) -> Result<(), MapError> {
        {
            let state = self.state.read();
            let mut pt = pt.lock();
            match &state.backing {
                Backing::Phys { base: phys } => {
                    let pages = self.length() / layout::PAGE_SIZE;
                    for i in 0..pages {
                        let step = i * layout::PAGE_SIZE;
                        if let Err(err) = pt.map_page(*phys + step, base + step, self.mode) {
                            roll_back(&mut pt, base, i);
                            return Err(err.into());
                        }
                    }
                }
                Backing::Anon { pages } => {
                    for (i, page) in pages.iter().enumerate() {
                        let va = base + page.page_off * layout::PAGE_SIZE;
                        if let Err(err) = pt.map_page(page.frame, va, self.mode) {
                            for prior in &pages[..i] {
                                let va = base + prior.page_off * layout::PAGE_SIZE;
                                let _ = pt.unmap_page(va);
                            }
                            return Err(err.into());
                        }
                    }
                }
            }
        }

        self.state
            .write()
            .placements
            .push((ZoneArc::downgrade(map), base));
        Ok(())
    }
}

impl Drop for MapEntry {
    /// Return every owned frame to its allocator.
    fn drop(&mut self) {
        let state = self.state.get_mut();
        if let Backing::Anon { pages } = &state.backing {
            if let Some(frames) = state.frames {
                for page in pages {
                    frames.free_frame(page.frame);
                }
            } else {
                debug_assert!(pages.is_empty());
            }
        }
    }
}

/// Unmap the first `installed` pages of a contiguous placement.
fn roll_back(pt: &mut PageTable, base: VirtAddr, installed: u64) {
    for i in 0..installed {
        let _ = pt.unmap_page(base + i * layout::PAGE_SIZE);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil;

    #[test]
    fn constructors_validate_lengths() {
        testutil::install();
        assert_eq!(
            MapEntry::contiguous(PhysAddr::new(0x1001), 0x1000, AccessMode::KERNEL_READ)
                .err()
                .unwrap(),
            MapError::InvalidArgument
        );
        assert!(MapEntry::contiguous(PhysAddr::new(0x1000), 0, AccessMode::KERNEL_READ).is_err());
        assert!(MapEntry::anonymous(0x800, AccessMode::KERNEL_RW).is_err());
        assert!(MapEntry::anonymous(0x2000, AccessMode::KERNEL_RW).is_ok());
    }

    #[test]
    fn modes_are_normalized() {
        testutil::install();
        let e = MapEntry::anonymous(0x1000, AccessMode::KERNEL_WRITE).unwrap();
        assert!(e.mode().contains(AccessMode::KERNEL_READ));
    }

    #[test]
    fn fresh_regions_own_nothing() {
        testutil::install();
        let e = MapEntry::anonymous(0x4000, AccessMode::KERNEL_RW).unwrap();
        assert!(e.is_anonymous());
        assert_eq!(e.resident_pages(), 0);
        assert_eq!(e.length(), 0x4000);

        let p = MapEntry::contiguous(PhysAddr::new(0x8000), 0x1000, AccessMode::KERNEL_READ)
            .unwrap();
        assert!(!p.is_anonymous());
    }

    #[test]
    fn resize_rejects_physical_regions() {
        testutil::install();
        let e = MapEntry::contiguous(PhysAddr::new(0x8000), 0x2000, AccessMode::KERNEL_READ)
            .unwrap();
        assert_eq!(e.resize(0x1000), Err(MapError::InvalidArgument));
    }
}
