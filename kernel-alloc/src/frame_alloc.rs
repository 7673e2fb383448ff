//! The physical frame allocator.
//!
//! Bookkeeping lives inside the managed memory itself: the head of every
//! registered region is stolen for a free bitmap (one bit per frame, set
//! meaning free), reached through a [`PhysMapper`] so the same code works
//! against the bootloader's direct map early on, the permanent aperture
//! later, and a simulated frame store under test.
//!
//! Exhaustion is an ordinary condition reported through return values;
//! double frees and frees of foreign addresses are policy violations and
//! panic.

use kernel_info::layout;
use kernel_sync::SpinLock;
use kernel_vmem::{FrameSource, PhysAddr, PhysMapper};

/// Upper bound on registered memory-map regions.
const MAX_REGIONS: usize = 32;

/// Upper bound on advertised extra page sizes.
const MAX_EXTRA_SIZES: usize = 4;

/// Global allocator instance. Initialized once during early boot; its
/// bookkeeping is reached through `kernel_vmem::PHYS_ACCESS` until
/// [`PhysAllocator::remap_to`] re-points it at the permanent aperture.
pub static PHYS_ALLOCATOR: PhysAllocator = PhysAllocator::new();

/// The physical page-frame allocator.
pub struct PhysAllocator {
    inner: SpinLock<Inner>,
}

struct Inner {
    mapper: Option<&'static dyn PhysMapper>,
    extra_sizes: [u64; MAX_EXTRA_SIZES],
    extra_count: usize,
    regions: [Option<Region>; MAX_REGIONS],
    region_count: usize,
    /// Frames currently available across all regions.
    free_pages: u64,
    remapped: bool,
}

/// One registered physical region and its stolen bitmap.
struct Region {
    /// First allocatable frame (past the bitmap pages).
    base: u64,
    /// Allocatable frame count.
    pages: u64,
    /// Physical address of the free bitmap.
    bitmap: u64,
    /// 64-bit words in the bitmap.
    words: usize,
    /// Free frames remaining in this region.
    free: u64,
    /// Word index allocation scans resume from.
    hint: usize,
}

impl Region {
    fn contains(&self, pa: u64) -> bool {
        pa >= self.base && pa < self.base + self.pages * layout::PAGE_SIZE
    }
}

impl PhysAllocator {
    #[must_use]
    pub const fn new() -> Self {
        const NONE: Option<Region> = None;
        Self {
            inner: SpinLock::new(Inner {
                mapper: None,
                extra_sizes: [0; MAX_EXTRA_SIZES],
                extra_count: 0,
                regions: [NONE; MAX_REGIONS],
                region_count: 0,
                free_pages: 0,
                remapped: false,
            }),
        }
    }

    /// One-time setup: record the access path, the base page size, and
    /// any extra page sizes the platform advertises. Must precede
    /// [`PhysAllocator::add_region`].
    ///
    /// # Panics
    /// On re-initialization or a base page size other than the platform's.
    pub fn init(&self, mapper: &'static dyn PhysMapper, base_page_size: u64, extra: &[u64]) {
        let mut inner = self.inner.lock();
        assert!(
            inner.mapper.is_none(),
            "physical allocator initialized twice"
        );
        assert_eq!(base_page_size, layout::PAGE_SIZE, "unsupported page size");
        assert!(extra.len() <= MAX_EXTRA_SIZES, "too many extra page sizes");
        inner.extra_sizes[..extra.len()].copy_from_slice(extra);
        inner.extra_count = extra.len();
        inner.mapper = Some(mapper);
    }

    /// Whether frames of `size` bytes are advertised.
    #[must_use]
    pub fn has_page_size(&self, size: u64) -> bool {
        let inner = self.inner.lock();
        size == layout::PAGE_SIZE || inner.extra_sizes[..inner.extra_count].contains(&size)
    }

    /// Register a usable physical region.
    ///
    /// Regions entirely below the legacy-DMA floor are set aside,
    /// partially-below regions are clamped, and anything shorter than the
    /// minimum worth managing is dropped. The surviving head of the
    /// region is stolen for the free bitmap.
    ///
    /// # Panics
    /// On unaligned bounds, overlap with an existing region, or a call
    /// before [`PhysAllocator::init`].
    pub fn add_region(&self, base: u64, length: u64) {
        let mut inner = self.inner.lock();
        let mapper = inner.mapper.expect("add_region before init");
        assert!(
            base % layout::PAGE_SIZE == 0 && length % layout::PAGE_SIZE == 0,
            "physical region bounds must be page aligned"
        );

        if length < layout::MIN_PHYS_REGION {
            return;
        }
        if base + length <= layout::PHYS_ALLOC_FLOOR {
            // Reserved for legacy DMA.
            return;
        }

        // Clamp the head below the DMA floor.
        let (mut base, mut length) = (base, length);
        if base < layout::PHYS_ALLOC_FLOOR {
            let cut = layout::PHYS_ALLOC_FLOOR - base;
            base += cut;
            length -= cut;
        }
        if length < layout::MIN_PHYS_REGION {
            return;
        }

        for region in inner.regions.iter().flatten() {
            assert!(
                base + length <= region.bitmap || base >= region.base + region.pages * layout::PAGE_SIZE,
                "physical region 0x{base:x} overlaps an existing region"
            );
        }

        let total_pages = length / layout::PAGE_SIZE;
        let bitmap_bytes = total_pages.div_ceil(8);
        let bitmap_pages = bitmap_bytes.div_ceil(layout::PAGE_SIZE);
        let pages = total_pages - bitmap_pages;
        let words = (pages as usize).div_ceil(64);

        let region = Region {
            base: base + bitmap_pages * layout::PAGE_SIZE,
            pages,
            bitmap: base,
            words,
            free: pages,
            hint: 0,
        };

        // All frames start free; tail bits past the end stay clear so the
        // scan never yields a frame outside the region.
        for word in 0..words {
            let bits_before = word as u64 * 64;
            let bits = (pages - bits_before).min(64);
            let value = if bits == 64 { u64::MAX } else { (1u64 << bits) - 1 };
            write_word(mapper, &region, word, value);
        }

        log::debug!(
            "phys region 0x{:x} + 0x{:x}: {} frames ({} bitmap pages)",
            region.base,
            length,
            pages,
            bitmap_pages
        );

        let slot = inner.region_count;
        assert!(slot < MAX_REGIONS, "too many physical regions");
        inner.regions[slot] = Some(region);
        inner.region_count += 1;
        inner.free_pages += pages;
    }

    /// One frame, or `None` when memory is exhausted.
    #[must_use]
    pub fn alloc_page(&self) -> Option<PhysAddr> {
        self.inner.lock().alloc_one()
    }

    /// Fill `out` with frames; returns how many were actually allocated.
    ///
    /// A partial return leaves the caller responsible for freeing what it
    /// got. The frames need not be contiguous.
    #[must_use]
    pub fn alloc_pages(&self, out: &mut [PhysAddr]) -> usize {
        let mut inner = self.inner.lock();
        for (done, slot) in out.iter_mut().enumerate() {
            match inner.alloc_one() {
                Some(frame) => *slot = frame,
                None => return done,
            }
        }
        out.len()
    }

    /// Return frames obtained from this allocator.
    ///
    /// # Panics
    /// On a frame that is already free or was never handed out by this
    /// allocator.
    pub fn free_pages(&self, frames: &[PhysAddr]) -> usize {
        let mut inner = self.inner.lock();
        for frame in frames {
            inner.free_one(*frame);
        }
        frames.len()
    }

    /// Frames currently available. Diagnostic: the value is stale the
    /// moment the lock drops.
    #[must_use]
    pub fn total_pages(&self) -> u64 {
        self.inner.lock().free_pages
    }

    /// Re-point bookkeeping access at the permanent aperture.
    ///
    /// Called exactly once, after the kernel map — with the aperture
    /// installed — has been activated, so the bitmaps are no longer
    /// reached through abandoned bootloader mappings.
    ///
    /// # Panics
    /// On a second call.
    pub fn remap_to(&self, mapper: &'static dyn PhysMapper) {
        let mut inner = self.inner.lock();
        assert!(!inner.remapped, "physical allocator remapped twice");
        inner.remapped = true;
        inner.mapper = Some(mapper);
    }
}

impl Default for PhysAllocator {
    fn default() -> Self {
        Self::new()
    }
}

impl Inner {
    fn alloc_one(&mut self) -> Option<PhysAddr> {
        let mapper = self.mapper.expect("allocation before init");
        for region in self.regions.iter_mut().flatten() {
            if region.free == 0 {
                continue;
            }
            let start = region.hint;
            for step in 0..region.words {
                let word_idx = (start + step) % region.words;
                let word = read_word(mapper, region, word_idx);
                if word == 0 {
                    continue;
                }
                let bit = word.trailing_zeros() as u64;
                write_word(mapper, region, word_idx, word & !(1 << bit));
                region.free -= 1;
                region.hint = word_idx;
                self.free_pages -= 1;
                let index = word_idx as u64 * 64 + bit;
                return Some(PhysAddr::new(region.base + index * layout::PAGE_SIZE));
            }
            unreachable!("region free count out of sync with bitmap");
        }
        None
    }

    fn free_one(&mut self, frame: PhysAddr) {
        let mapper = self.mapper.expect("free before init");
        assert!(
            frame.is_page_aligned(),
            "freed frame {frame} is not page aligned"
        );
        let pa = frame.as_u64();
        let region = self
            .regions
            .iter_mut()
            .flatten()
            .find(|r| r.contains(pa))
            .unwrap_or_else(|| panic!("freed frame {frame} belongs to no region"));

        let index = (pa - region.base) / layout::PAGE_SIZE;
        let word_idx = (index / 64) as usize;
        let bit = index % 64;
        let word = read_word(mapper, region, word_idx);
        assert!(
            word & (1 << bit) == 0,
            "double free of physical frame {frame}"
        );
        write_word(mapper, region, word_idx, word | (1 << bit));
        region.free += 1;
        region.hint = region.hint.min(word_idx);
        self.free_pages += 1;
    }
}

fn read_word(mapper: &dyn PhysMapper, region: &Region, word: usize) -> u64 {
    let pa = PhysAddr::new(region.bitmap + word as u64 * 8);
    // Safety: the bitmap pages were carved out of the region at
    // registration and are only touched under the allocator lock.
    unsafe { mapper.phys_to_ptr(pa).cast::<u64>().read() }
}

fn write_word(mapper: &dyn PhysMapper, region: &Region, word: usize, value: u64) {
    let pa = PhysAddr::new(region.bitmap + word as u64 * 8);
    // Safety: as above.
    unsafe { mapper.phys_to_ptr(pa).cast::<u64>().write(value) }
}

impl FrameSource for PhysAllocator {
    fn alloc_frame(&self) -> Option<PhysAddr> {
        self.alloc_page()
    }

    fn free_frame(&self, frame: PhysAddr) {
        let _ = self.free_pages(&[frame]);
    }
}
