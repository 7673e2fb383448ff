//! The kernel virtual page allocator.
//!
//! A cursor marches through a reserved kernel-virtual window; every
//! allocation consumes its pages plus a tail of guard pages that are
//! never mapped, so overruns and stale pointers trap instead of
//! corrupting a neighbor. Freed virtual space is *not* recycled — only
//! the backing frames return to the physical allocator. Growing this
//! into a free list is deliberately invisible at this surface.
//!
//! Any fault inside the window is fatal: it is either a guard-page touch
//! or a use of a stale allocation.

use crate::handle::ZoneArc;
use crate::manager::TrapState;
use crate::map::Map;
use core::ptr::NonNull;
use kernel_info::layout;
use kernel_sync::{SpinLock, SyncOnceCell};
use kernel_vmem::{page_count, AccessMode, FaultAccess, PhysAddr, TlbHint, VirtAddr};

/// Largest single allocation, in pages.
const MAX_ALLOC_PAGES: usize = 16;

/// Global instance over the reserved window, bound to the kernel map
/// during bring-up.
pub static VALLOC: VAlloc = VAlloc::new(
    layout::VALLOC_START,
    layout::VALLOC_END,
    layout::GUARD_PAGES as u64,
);

/// Source of fixed-size memory regions for the zone allocator.
///
/// The virtual page allocator is the kernel's region source; tests
/// substitute host memory.
pub trait RegionSource: Sync {
    /// A region of `len` bytes, or `None` when memory is exhausted.
    fn alloc_region(&self, len: usize) -> Option<NonNull<u8>>;
}

struct Cursor {
    next: u64,
    pages_allocated: u64,
}

/// A cursor allocator over one kernel-virtual window.
pub struct VAlloc {
    start: u64,
    end: u64,
    guard_pages: u64,
    cursor: SpinLock<Cursor>,
    /// The map whose tree backs this window; the kernel map in practice.
    map: SyncOnceCell<ZoneArc<Map>>,
}

impl VAlloc {
    #[must_use]
    pub const fn new(start: u64, end: u64, guard_pages: u64) -> Self {
        Self {
            start,
            end,
            guard_pages,
            cursor: SpinLock::new(Cursor {
                next: start,
                pages_allocated: 0,
            }),
            map: SyncOnceCell::new(),
        }
    }

    /// Bind the window to the map whose tree it installs pages into.
    /// Called once during bring-up, after the kernel map is activated.
    ///
    /// # Panics
    /// On a second bind.
    pub fn attach(&self, map: ZoneArc<Map>) {
        assert!(
            self.map.set(map).is_ok(),
            "virtual page allocator bound twice"
        );
    }

    fn backing(&self) -> &ZoneArc<Map> {
        self.map.get().expect("virtual page allocator not bound")
    }

    /// Whether `addr` falls inside this allocator's window.
    #[must_use]
    pub fn contains(&self, addr: VirtAddr) -> bool {
        (self.start..=self.end).contains(&addr.as_u64())
    }

    /// Pages currently backed through this allocator.
    #[must_use]
    pub fn pages_allocated(&self) -> u64 {
        self.cursor.lock().pages_allocated
    }

    /// Allocate `len` bytes of page-aligned, virtually contiguous kernel
    /// memory, mapped `KernelRW`.
    ///
    /// `len` is rounded up to whole pages; the reservation additionally
    /// swallows the guard pages. Returns `None` for a zero length, a
    /// request beyond the per-call limit, or physical exhaustion —
    /// partial frame allocations are returned before failing.
    ///
    /// # Panics
    /// When the window itself is exhausted, which is a kernel
    /// configuration bug, or when mapping fails mid-way.
    #[must_use]
    pub fn alloc(&self, len: u64) -> Option<NonNull<u8>> {
        if len == 0 {
            return None;
        }
        let pages = page_count(len);
        if pages as usize > MAX_ALLOC_PAGES {
            log::warn!("valloc request of {pages} pages exceeds the limit");
            return None;
        }

        let map = self.backing();
        let mut cursor = self.cursor.lock();

        let reserved = (pages + self.guard_pages) * layout::PAGE_SIZE;
        let base = cursor.next;
        let end = base.checked_add(reserved).expect("valloc cursor overflow");
        assert!(
            end < self.end,
            "virtual allocator window exhausted at 0x{base:x}"
        );

        // Gather frames first so a partial grab can be undone without
        // touching the tree.
        let mut frames = [PhysAddr::new(0); MAX_ALLOC_PAGES];
        let source = map.frames();
        for i in 0..pages as usize {
            match source.alloc_frame() {
                Some(frame) => frames[i] = frame,
                None => {
                    for frame in &frames[..i] {
                        source.free_frame(*frame);
                    }
                    return None;
                }
            }
        }

        {
            let mut pt = map.page_table().lock();
            for (i, frame) in frames[..pages as usize].iter().enumerate() {
                let va = VirtAddr::new(base + i as u64 * layout::PAGE_SIZE);
                pt.map_page(*frame, va, AccessMode::KERNEL_RW)
                    .expect("failed to map virtual page");
            }
        }

        cursor.next = end;
        cursor.pages_allocated += pages;
        log::trace!("valloc {pages} pages at 0x{base:x}");
        NonNull::new(base as *mut u8)
    }

    /// Release an allocation made by [`VAlloc::alloc`].
    ///
    /// The backing frames return to the physical allocator and the
    /// translations are flushed everywhere; the virtual range itself is
    /// burned (cursor design).
    ///
    /// # Panics
    /// On an unaligned or out-of-window pointer, a length that does not
    /// match a mapped range, or TLB invalidation failure. All of these
    /// are caller bugs.
    pub fn free(&self, ptr: NonNull<u8>, len: u64) {
        let base = ptr.as_ptr() as u64;
        assert!(len > 0, "zero-length free");
        assert!(
            base % layout::PAGE_SIZE == 0,
            "unaligned free of 0x{base:x}"
        );
        assert!(
            self.contains(VirtAddr::new(base)),
            "free of 0x{base:x} outside the window"
        );

        let pages = page_count(len);
        let map = self.backing();
        let mut frames = [PhysAddr::new(0); MAX_ALLOC_PAGES];
        assert!(pages as usize <= MAX_ALLOC_PAGES, "oversized free");

        {
            let mut pt = map.page_table().lock();
            for i in 0..pages {
                let va = VirtAddr::new(base + i * layout::PAGE_SIZE);
                let mapping = pt
                    .resolve(va)
                    .expect("unmapped page inside freed valloc range");
                frames[i as usize] = mapping.phys.page_base();
                pt.unmap_page(va).expect("failed to unmap virtual page");
            }
        }

        map.invalidate_tlb(
            VirtAddr::new(base),
            pages * layout::PAGE_SIZE,
            TlbHint::ALL | TlbHint::UNMAPPED,
        )
        .expect("failed to invalidate freed valloc range");

        let source = map.frames();
        for frame in &frames[..pages as usize] {
            source.free_frame(*frame);
        }

        let mut cursor = self.cursor.lock();
        cursor.pages_allocated -= pages;
        log::trace!("vfree {pages} pages at 0x{base:x}");
    }

    /// Handle a fault inside the window. Always fatal: nothing here is
    /// demand-paged, so the touch was a guard page or a stale pointer.
    pub fn handle_fault(&self, state: &TrapState, addr: VirtAddr, access: FaultAccess) -> ! {
        panic!(
            "fault in valloc region at {addr} (pc {pc}, {access:?})",
            pc = state.pc()
        );
    }
}

impl RegionSource for VAlloc {
    fn alloc_region(&self, len: usize) -> Option<NonNull<u8>> {
        self.alloc(len as u64)
    }
}

/// Allocate kernel virtual memory through the global window.
#[must_use]
pub fn valloc(len: u64) -> Option<NonNull<u8>> {
    VALLOC.alloc(len)
}

/// Free memory obtained from [`valloc`].
pub fn vfree(ptr: NonNull<u8>, len: u64) {
    VALLOC.free(ptr, len);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::fresh_root_map;

    fn bound_valloc() -> (VAlloc, ZoneArc<Map>, &'static crate::testutil::CountingFrames) {
        let (map, frames) = fresh_root_map();
        let v = VAlloc::new(
            layout::VALLOC_START,
            layout::VALLOC_END,
            layout::GUARD_PAGES as u64,
        );
        v.attach(ZoneArc::clone(&map));
        (v, map, frames)
    }

    #[test]
    fn cursor_roundtrip_and_guard_spacing() {
        let (v, map, _) = bound_valloc();

        let first = v.alloc(0x3000).unwrap();
        assert_eq!(first.as_ptr() as u64, layout::VALLOC_START);
        assert_eq!(v.pages_allocated(), 3);

        // Every page is backed and writable; the guard tail is not.
        for page in 0..3u64 {
            let va = VirtAddr::new(first.as_ptr() as u64 + page * layout::PAGE_SIZE);
            assert!(map.resolve(va).is_some());
        }
        let guard = VirtAddr::new(first.as_ptr() as u64 + 3 * layout::PAGE_SIZE);
        assert!(map.resolve(guard).is_none());

        v.free(first, 0x3000);
        assert_eq!(v.pages_allocated(), 0);
        for page in 0..3u64 {
            let va = VirtAddr::new(first.as_ptr() as u64 + page * layout::PAGE_SIZE);
            assert!(map.resolve(va).is_none());
        }

        // Cursor design: the next allocation never reuses the range.
        let second = v.alloc(0x3000).unwrap();
        let distance = second.as_ptr() as u64 - first.as_ptr() as u64;
        assert!(distance >= (3 + layout::GUARD_PAGES as u64) * layout::PAGE_SIZE);
        assert_eq!(v.pages_allocated(), 3);
    }

    #[test]
    fn zero_and_oversized_requests_fail() {
        let (v, _, _) = bound_valloc();
        assert!(v.alloc(0).is_none());
        assert!(v.alloc((MAX_ALLOC_PAGES as u64 + 1) * layout::PAGE_SIZE).is_none());
    }

    #[test]
    fn odd_lengths_round_up_to_pages() {
        let (v, map, _) = bound_valloc();
        let p = v.alloc(0x1001).unwrap();
        assert_eq!(v.pages_allocated(), 2);
        assert!(map
            .resolve(VirtAddr::new(p.as_ptr() as u64 + layout::PAGE_SIZE))
            .is_some());
        v.free(p, 0x1001);
        assert_eq!(v.pages_allocated(), 0);
    }

    #[test]
    fn frames_return_on_free() {
        let (v, _, frames) = bound_valloc();
        let p = v.alloc(0x2000).unwrap();
        let freed_before = frames.freed();
        v.free(p, 0x2000);
        assert_eq!(frames.freed(), freed_before + 2);
    }

    #[test]
    fn window_membership() {
        let (v, _, _) = bound_valloc();
        assert!(v.contains(VirtAddr::new(layout::VALLOC_START)));
        assert!(v.contains(VirtAddr::new(layout::VALLOC_END)));
        assert!(!v.contains(VirtAddr::new(layout::VALLOC_START - 1)));
        assert!(!v.contains(VirtAddr::new(layout::FRAMEBUFFER_BASE)));
    }

    #[test]
    #[should_panic(expected = "fault in valloc region")]
    fn any_fault_in_window_is_fatal() {
        let (v, _, _) = bound_valloc();
        let p = v.alloc(0x1000).unwrap();
        // Touching the guard page right past the allocation.
        let guard = VirtAddr::new(p.as_ptr() as u64 + layout::PAGE_SIZE);
        let state = TrapState::new(VirtAddr::new(0xffff_ffff_8000_0000), 0);
        v.handle_fault(
            &state,
            guard,
            FaultAccess::WRITE | FaultAccess::SUPERVISOR | FaultAccess::PAGE_NOT_PRESENT,
        );
    }
}
