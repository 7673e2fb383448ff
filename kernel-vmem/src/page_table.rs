//! The 4-level page-table walker.
//!
//! A [`PageTable`] owns one top-level table frame and, transitively, every
//! intermediate table it allocated beneath it. It installs and removes
//! 4 KiB leaves, resolves virtual addresses across all three leaf sizes,
//! and decodes hardware fault codes into the portable [`FaultAccess`]
//! form.
//!
//! Mutations never flush TLBs on their own beyond what table installation
//! itself requires: turning a non-present entry present needs no flush
//! (the TLB cannot cache negative translations), so freshly added
//! mappings are visible without any invalidation. Every other transition
//! — unmap, remap, permission change — is the caller's responsibility to
//! flush, with hints describing what changed.
//!
//! The type is not internally synchronized; the owning map serializes all
//! mutation behind its own lock.

use crate::addresses::{PhysAddr, VirtAddr};
use crate::entry_bits::{PageEntryBits, PageFaultCode};
use crate::layout;
use crate::phys::{zero_frame, FrameSource, PhysMapper};
use crate::types::{AccessMode, FaultAccess, TlbHint};
use crate::{cpu, page_count};

/// Entries per table at every level.
const ENTRIES: usize = 512;

/// First top-level index of the kernel half.
const UPPER_HALF: usize = ENTRIES / 2;

/// Bytes spanned by one top-level entry (512 GiB).
const PML4_SPAN: u64 = 1 << 39;

/// Bytes spanned by one PDPT entry (1 GiB).
const GIB: u64 = 1 << 30;

/// Bytes spanned by one PD entry (2 MiB).
const MIB2: u64 = 1 << 21;

/// Errors surfaced by walker operations.
#[derive(Copy, Clone, Debug, Eq, PartialEq, thiserror::Error)]
pub enum WalkError {
    /// Bits 63..47 of the virtual address are not a sign extension of
    /// bit 47.
    #[error("virtual address is not canonical")]
    NonCanonical,
    /// The frame source could not provide a table frame.
    #[error("out of physical memory for paging structures")]
    OutOfMemory,
    /// A 1 GiB or 2 MiB leaf sits where a child table was expected. The
    /// VM core never splits large pages.
    #[error("large-page leaf blocks the walk")]
    BlockedByLargePage,
    /// No translation exists for the address.
    #[error("address is not mapped")]
    NotMapped,
}

/// A successfully resolved translation.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct Mapping {
    /// Physical address including the in-page offset.
    pub phys: PhysAddr,
    /// Permissions decoded from the leaf entry.
    pub mode: AccessMode,
}

/// One top-level table plus everything reachable beneath it.
pub struct PageTable {
    /// Physical frame of the top-level table.
    root: PhysAddr,
    /// Whether upper-half subtrees belong to this table. True only for
    /// root tables created without a parent; derived tables borrow the
    /// parent's kernel-half subtrees and must not free them.
    owns_upper: bool,
    mapper: &'static dyn PhysMapper,
    frames: &'static dyn FrameSource,
}

impl PageTable {
    /// Allocate a fresh top-level table.
    ///
    /// With a `parent`, every upper-half slot is copied verbatim so the
    /// kernel half stays identical across address spaces. The copy is
    /// taken once; the invariant that parent and child upper halves never
    /// diverge is maintained by the portable layer, which directs all
    /// kernel-half mutations at the kernel map.
    ///
    /// # Errors
    /// [`WalkError::OutOfMemory`] if no frame is available for the root.
    pub fn new(
        parent: Option<&PageTable>,
        mapper: &'static dyn PhysMapper,
        frames: &'static dyn FrameSource,
    ) -> Result<Self, WalkError> {
        let root = alloc_table(mapper, frames)?;
        let pt = Self {
            root,
            owns_upper: parent.is_none(),
            mapper,
            frames,
        };
        if let Some(parent) = parent {
            for idx in UPPER_HALF..ENTRIES {
                pt.write_entry(pt.root, idx, parent.read_entry(parent.root, idx));
            }
        }
        Ok(pt)
    }

    /// Physical address of the top-level table.
    #[must_use]
    pub fn root(&self) -> PhysAddr {
        self.root
    }

    /// The physical-access path table frames are reached through.
    #[must_use]
    pub fn mapper(&self) -> &'static dyn PhysMapper {
        self.mapper
    }

    /// The frame source backing intermediate tables.
    #[must_use]
    pub fn frames(&self) -> &'static dyn FrameSource {
        self.frames
    }

    /// Load this table into the CPU's translation-control register.
    ///
    /// No TLB maintenance is performed beyond what the load itself
    /// implies.
    pub fn activate(&self) {
        cpu::ops().load_root(self.root);
    }

    /// Map the permanent physical aperture into the kernel half.
    ///
    /// Builds enough PDPTs to span the aperture and fills them with 1 GiB
    /// leaves: present, writable, supervisor, global, execute-disabled.
    /// This is the one place leaves are written without a region object
    /// behind them.
    ///
    /// # Errors
    /// [`WalkError::OutOfMemory`] if a PDPT frame cannot be allocated.
    pub fn install_phys_aperture(&mut self) -> Result<(), WalkError> {
        let span = layout::PHYS_APERTURE_END - layout::PHYS_APERTURE_START;
        let base_slot = VirtAddr::new(layout::PHYS_APERTURE_START).pml4_index();

        for slot in 0..(span / PML4_SPAN) as usize {
            let pdpt = alloc_table(self.mapper, self.frames)?;
            let phys_base = slot as u64 * PML4_SPAN;

            for idx in 0..ENTRIES {
                let leaf = PageEntryBits::new()
                    .with_present(true)
                    .with_writable(true)
                    .with_huge(true)
                    .with_global(true)
                    .with_nx(true)
                    .with_phys_addr(PhysAddr::new(phys_base + idx as u64 * GIB));
                self.write_entry(pdpt, idx, leaf);
            }

            let link = PageEntryBits::new()
                .with_present(true)
                .with_writable(true)
                .with_nx(true)
                .with_phys_addr(pdpt);
            self.write_entry(self.root, base_slot + slot, link);
        }
        Ok(())
    }

    /// Install a 4 KiB translation `virt → phys` with permissions derived
    /// from `mode`, allocating intermediate tables as needed.
    ///
    /// Intermediate entries are created present and writable, with user
    /// access whenever the address lies below the kernel boundary; the
    /// leaf makes the final permission decision. An existing leaf at
    /// `virt` is overwritten — the caller flushes on such transitions.
    ///
    /// # Errors
    /// - [`WalkError::NonCanonical`]: the table is left untouched.
    /// - [`WalkError::OutOfMemory`]: tables allocated earlier in the walk
    ///   remain (they are empty and harmless).
    /// - [`WalkError::BlockedByLargePage`]: a huge leaf covers `virt`.
    pub fn map_page(
        &mut self,
        phys: PhysAddr,
        virt: VirtAddr,
        mode: AccessMode,
    ) -> Result<(), WalkError> {
        if !virt.is_canonical() {
            return Err(WalkError::NonCanonical);
        }
        debug_assert!(phys.is_page_aligned(), "unaligned frame {phys}");
        debug_assert!(virt.is_page_aligned(), "unaligned page {virt}");

        log::trace!(
            "map {virt} -> {phys} {}{}{}{}",
            if mode.intersects(AccessMode::READ) { "r" } else { "-" },
            if mode.writes() { "w" } else { "-" },
            if mode.executes() { "x" } else { "-" },
            if mode.is_user() { " user" } else { "" },
        );

        // Subtrees below the kernel boundary must admit user access at
        // every non-leaf level; the leaf bits decide per page.
        let user_subtree = !virt.is_kernel();

        let pdpt = self.ensure_child(self.root, virt.pml4_index(), user_subtree)?;
        let pd = self.ensure_child(pdpt, virt.pdpt_index(), user_subtree)?;
        let pt = self.ensure_child(pd, virt.pd_index(), user_subtree)?;

        let leaf = PageEntryBits::new()
            .with_present(true)
            .with_writable(mode.writes())
            .with_user_access(mode.is_user())
            .with_nx(!mode.executes())
            .with_phys_addr(phys);
        self.write_entry(pt, virt.pt_index(), leaf);
        Ok(())
    }

    /// Remove the 4 KiB translation at `virt`.
    ///
    /// Intermediate tables are left in place even when they become empty.
    /// The caller is responsible for TLB maintenance.
    ///
    /// # Errors
    /// [`WalkError::NonCanonical`], [`WalkError::NotMapped`], or
    /// [`WalkError::BlockedByLargePage`] when a huge leaf covers `virt`.
    pub fn unmap_page(&mut self, virt: VirtAddr) -> Result<(), WalkError> {
        if !virt.is_canonical() {
            return Err(WalkError::NonCanonical);
        }

        let pdpt = self.walk_child(self.root, virt.pml4_index())?;
        let pd = self.walk_child(pdpt, virt.pdpt_index())?;
        let pt = self.walk_child(pd, virt.pd_index())?;

        let idx = virt.pt_index();
        if !self.read_entry(pt, idx).present() {
            return Err(WalkError::NotMapped);
        }
        self.write_entry(pt, idx, PageEntryBits::new());
        Ok(())
    }

    /// Translate `virt` the way the MMU would.
    ///
    /// Decodes 1 GiB, 2 MiB, and 4 KiB leaves; the returned physical
    /// address includes the in-page offset. Returns `None` for
    /// non-canonical and unmapped addresses alike.
    #[must_use]
    pub fn resolve(&self, virt: VirtAddr) -> Option<Mapping> {
        if !virt.is_canonical() {
            return None;
        }

        let e4 = self.read_entry(self.root, virt.pml4_index());
        if !e4.present() {
            return None;
        }

        let e3 = self.read_entry(e4.phys_addr(), virt.pdpt_index());
        if !e3.present() {
            return None;
        }
        if e3.huge() {
            return Some(Mapping {
                phys: e3.phys_addr() + (virt.as_u64() & (GIB - 1)),
                mode: decode_mode(e3),
            });
        }

        let e2 = self.read_entry(e3.phys_addr(), virt.pd_index());
        if !e2.present() {
            return None;
        }
        if e2.huge() {
            return Some(Mapping {
                phys: e2.phys_addr() + (virt.as_u64() & (MIB2 - 1)),
                mode: decode_mode(e2),
            });
        }

        let e1 = self.read_entry(e2.phys_addr(), virt.pt_index());
        if !e1.present() {
            return None;
        }
        Some(Mapping {
            phys: e1.phys_addr() + virt.page_offset(),
            mode: decode_mode(e1),
        })
    }

    /// Issue per-page local invalidations for `[virt, virt + len)`.
    ///
    /// Remote propagation is not this component's concern; the map layer
    /// turns remote hints into shootdowns.
    pub fn invalidate_tlb(&self, virt: VirtAddr, len: u64, hints: TlbHint) {
        if !hints.flush_required() {
            return;
        }
        let ops = cpu::ops();
        for page in 0..page_count(len) {
            ops.invalidate_page(virt + page * layout::PAGE_SIZE);
        }
    }

    /// Decode a hardware page-fault error code into the portable form.
    #[must_use]
    pub fn decode_fault(error_code: u64) -> FaultAccess {
        let code = PageFaultCode::from_bits(error_code);
        let mut access = FaultAccess::empty();

        access |= if code.present() {
            FaultAccess::PROTECTION_VIOLATION
        } else {
            FaultAccess::PAGE_NOT_PRESENT
        };
        access |= if code.write() {
            FaultAccess::WRITE
        } else {
            FaultAccess::READ
        };
        access |= if code.user() {
            FaultAccess::USER
        } else {
            FaultAccess::SUPERVISOR
        };
        if code.reserved_bit() {
            access |= FaultAccess::INVALID_PTE;
        }
        if code.instruction_fetch() {
            access |= FaultAccess::INSTRUCTION_FETCH;
        }
        access
    }

    /// Child table behind `table[idx]`, allocating it when absent.
    fn ensure_child(
        &self,
        table: PhysAddr,
        idx: usize,
        user: bool,
    ) -> Result<PhysAddr, WalkError> {
        let entry = self.read_entry(table, idx);
        if entry.present() {
            if entry.huge() {
                return Err(WalkError::BlockedByLargePage);
            }
            return Ok(entry.phys_addr());
        }

        let child = alloc_table(self.mapper, self.frames)?;
        let link = PageEntryBits::new()
            .with_present(true)
            .with_writable(true)
            .with_user_access(user)
            .with_phys_addr(child);
        self.write_entry(table, idx, link);
        Ok(child)
    }

    /// Child table behind `table[idx]` without allocating.
    fn walk_child(&self, table: PhysAddr, idx: usize) -> Result<PhysAddr, WalkError> {
        let entry = self.read_entry(table, idx);
        if !entry.present() {
            return Err(WalkError::NotMapped);
        }
        if entry.huge() {
            return Err(WalkError::BlockedByLargePage);
        }
        Ok(entry.phys_addr())
    }

    fn read_entry(&self, table: PhysAddr, idx: usize) -> PageEntryBits {
        debug_assert!(idx < ENTRIES);
        let ptr = self.mapper.phys_to_ptr(table).cast::<u64>();
        // Safety: `table` is a live table frame; volatile keeps the
        // access from being elided around hardware-visible writes.
        PageEntryBits::from_bits(unsafe { ptr.add(idx).read_volatile() })
    }

    fn write_entry(&self, table: PhysAddr, idx: usize, entry: PageEntryBits) {
        debug_assert!(idx < ENTRIES);
        let ptr = self.mapper.phys_to_ptr(table).cast::<u64>();
        // Safety: as above; the MMU may observe this store at any time.
        unsafe { ptr.add(idx).write_volatile(entry.into_bits()) }
    }
}

impl Drop for PageTable {
    /// Return every owned paging structure to the frame source.
    ///
    /// Leaf frames are not owned by the walker and are left alone; huge
    /// leaves (the aperture) likewise. Derived tables skip the upper
    /// half, which belongs to the kernel map.
    fn drop(&mut self) {
        let top = if self.owns_upper { ENTRIES } else { UPPER_HALF };
        for i4 in 0..top {
            let e4 = self.read_entry(self.root, i4);
            if !e4.present() {
                continue;
            }
            let pdpt = e4.phys_addr();
            for i3 in 0..ENTRIES {
                let e3 = self.read_entry(pdpt, i3);
                if !e3.present() || e3.huge() {
                    continue;
                }
                let pd = e3.phys_addr();
                for i2 in 0..ENTRIES {
                    let e2 = self.read_entry(pd, i2);
                    if e2.present() && !e2.huge() {
                        self.frames.free_frame(e2.phys_addr());
                    }
                }
                self.frames.free_frame(pd);
            }
            self.frames.free_frame(pdpt);
        }
        self.frames.free_frame(self.root);
    }
}

/// Decode leaf permissions the way the hardware enforces them: the user
/// bit selects the band, writable and NX refine it.
fn decode_mode(entry: PageEntryBits) -> AccessMode {
    let mut mode = if entry.user_access() {
        if entry.writable() {
            AccessMode::USER_RW
        } else {
            AccessMode::USER_READ
        }
    } else if entry.writable() {
        AccessMode::KERNEL_RW
    } else {
        AccessMode::KERNEL_READ
    };
    if !entry.nx() {
        mode |= if entry.user_access() {
            AccessMode::USER_EXEC
        } else {
            AccessMode::KERNEL_EXEC
        };
    }
    mode
}

/// Allocate and zero one paging-structure frame.
fn alloc_table(
    mapper: &'static dyn PhysMapper,
    frames: &'static dyn FrameSource,
) -> Result<PhysAddr, WalkError> {
    let frame = frames.alloc_frame().ok_or(WalkError::OutOfMemory)?;
    zero_frame(mapper, frame);
    Ok(frame)
}
