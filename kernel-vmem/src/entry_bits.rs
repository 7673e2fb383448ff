//! Hardware bit layouts: page-table entries and the `#PF` error code.

use crate::addresses::PhysAddr;
use bitfield_struct::bitfield;

/// One 64-bit x86-64 paging entry, as the superset of all four levels.
///
/// | Bits  | Name | Meaning |
/// |-------|------|---------|
/// | 0     | P    | Entry is valid |
/// | 1     | RW   | Writes allowed |
/// | 2     | US   | User-mode access allowed |
/// | 3     | PWT  | Write-through caching |
/// | 4     | PCD  | Caching disabled |
/// | 5     | A    | Accessed (set by hardware) |
/// | 6     | D    | Dirty (leaf only, set by hardware) |
/// | 7     | PS   | Large-page leaf (PDPTE: 1 GiB, PDE: 2 MiB) |
/// | 8     | G    | Global (leaf only) |
/// | 9–11  |      | Available to software |
/// | 12–51 |      | Physical frame bits 51..12 |
/// | 52–62 |      | Available to software |
/// | 63    | NX   | Execute disable |
///
/// Non-leaf entries ignore `D`, `G`, and `PS`; a non-leaf's `US` and `RW`
/// gate the whole subtree, so intermediate entries are created writable
/// and user-accessible whenever the subtree can contain user mappings.
#[bitfield(u64)]
pub struct PageEntryBits {
    pub present: bool,
    pub writable: bool,
    pub user_access: bool,
    pub write_through: bool,
    pub cache_disable: bool,
    pub accessed: bool,
    pub dirty: bool,
    pub huge: bool,
    pub global: bool,
    #[bits(3)]
    _avl_low: u8,
    /// Physical frame number (address bits 51..12).
    #[bits(40)]
    pub frame: u64,
    #[bits(11)]
    _avl_high: u16,
    pub nx: bool,
}

impl PageEntryBits {
    /// The physical address this entry points at (table or leaf base).
    #[must_use]
    pub const fn phys_addr(self) -> PhysAddr {
        PhysAddr::new(self.frame() << 12)
    }

    /// Point this entry at `pa`, which must be 4 KiB aligned.
    #[must_use]
    pub const fn with_phys_addr(self, pa: PhysAddr) -> Self {
        self.with_frame(pa.as_u64() >> 12)
    }
}

/// The error code pushed by a page-fault exception.
///
/// Reference: Intel SDM Vol. 3A, §4.7.
#[bitfield(u64)]
pub struct PageFaultCode {
    /// Clear for a non-present translation, set for a protection
    /// violation on a present one.
    pub present: bool,
    /// Set when the faulting access was a write.
    pub write: bool,
    /// Set when the fault originated at CPL 3.
    pub user: bool,
    /// Set when a reserved bit was found set in a paging structure.
    pub reserved_bit: bool,
    /// Set when the access was an instruction fetch.
    pub instruction_fetch: bool,
    /// Protection-key violation (CR4.PKE).
    pub protection_key: bool,
    /// Shadow-stack access (CET).
    pub shadow_stack: bool,
    #[bits(57)]
    __: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn entry_round_trips_address_and_flags() {
        let e = PageEntryBits::new()
            .with_present(true)
            .with_writable(true)
            .with_global(true)
            .with_nx(true)
            .with_phys_addr(PhysAddr::new(0x1234_5000));
        assert!(e.present());
        assert!(e.writable());
        assert!(!e.user_access());
        assert!(e.global());
        assert!(e.nx());
        assert_eq!(e.phys_addr(), PhysAddr::new(0x1234_5000));
        // Flags and address occupy disjoint bits.
        assert_eq!(e.into_bits() & 0xfff, 0b1_0000_0011);
    }

    #[test]
    fn fault_code_bits() {
        let c = PageFaultCode::from_bits(0b10011);
        assert!(c.present());
        assert!(c.write());
        assert!(!c.user());
        assert!(!c.reserved_bit());
        assert!(c.instruction_fetch());
    }
}
