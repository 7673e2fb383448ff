//! Portable access-mode, fault, and TLB-hint bit sets.

use bitflags::bitflags;

bitflags! {
    /// Protection mode of a virtual memory region.
    ///
    /// Kernel and user permissions occupy separate bit bands so a single
    /// value can describe both sides of a mapping. Write access implies
    /// read access in the same band; [`AccessMode::normalized`] enforces
    /// that invariant and region constructors apply it.
    #[derive(Copy, Clone, Debug, Eq, PartialEq)]
    pub struct AccessMode: u64 {
        const KERNEL_READ  = 1 << 0;
        const KERNEL_WRITE = 1 << 1;
        const KERNEL_EXEC  = 1 << 2;

        const USER_READ  = 1 << 8;
        const USER_WRITE = 1 << 9;
        const USER_EXEC  = 1 << 10;

        const KERNEL_RW = Self::KERNEL_READ.bits() | Self::KERNEL_WRITE.bits();
        const USER_RW   = Self::USER_READ.bits() | Self::USER_WRITE.bits();

        /// Any bit set here makes the mapping reachable from user mode.
        const USER_MASK = Self::USER_READ.bits() | Self::USER_WRITE.bits() | Self::USER_EXEC.bits();

        /// The read bits of both bands.
        const READ    = Self::KERNEL_READ.bits() | Self::USER_READ.bits();
        /// The write bits of both bands.
        const WRITE   = Self::KERNEL_WRITE.bits() | Self::USER_WRITE.bits();
        /// The execute bits of both bands.
        const EXECUTE = Self::KERNEL_EXEC.bits() | Self::USER_EXEC.bits();
    }
}

impl AccessMode {
    /// Whether any user-band bit is set.
    #[must_use]
    pub const fn is_user(self) -> bool {
        self.intersects(Self::USER_MASK)
    }

    /// Whether either band permits writes.
    #[must_use]
    pub const fn writes(self) -> bool {
        self.intersects(Self::WRITE)
    }

    /// Whether either band permits instruction fetches.
    #[must_use]
    pub const fn executes(self) -> bool {
        self.intersects(Self::EXECUTE)
    }

    /// This mode with read access added wherever write access is granted.
    #[must_use]
    pub const fn normalized(self) -> Self {
        let mut bits = self.bits();
        if bits & Self::KERNEL_WRITE.bits() != 0 {
            bits |= Self::KERNEL_READ.bits();
        }
        if bits & Self::USER_WRITE.bits() != 0 {
            bits |= Self::USER_READ.bits();
        }
        Self::from_bits_retain(bits)
    }

    /// Whether a fault of kind `access` is an access this mode allows.
    ///
    /// The privilege band comes from the fault's supervisor/user bit, the
    /// access kind from its write/fetch bits.
    #[must_use]
    pub fn permits(self, access: FaultAccess) -> bool {
        let user = access.contains(FaultAccess::USER);
        let wanted = if access.contains(FaultAccess::INSTRUCTION_FETCH) {
            if user {
                Self::USER_EXEC
            } else {
                Self::KERNEL_EXEC
            }
        } else if access.contains(FaultAccess::WRITE) {
            if user {
                Self::USER_WRITE
            } else {
                Self::KERNEL_WRITE
            }
        } else if user {
            Self::USER_READ
        } else {
            Self::KERNEL_READ
        };
        self.contains(wanted)
    }
}

bitflags! {
    /// Decoded description of a page fault.
    ///
    /// One bit from each of the read/write and supervisor/user pairs is
    /// always set, plus any number of source bits.
    #[derive(Copy, Clone, Debug, Eq, PartialEq)]
    pub struct FaultAccess: u32 {
        const READ       = 1 << 0;
        const WRITE      = 1 << 1;
        const SUPERVISOR = 1 << 2;
        const USER       = 1 << 3;

        /// The translation was absent.
        const PAGE_NOT_PRESENT = 1 << 4;
        /// The translation exists but forbids the access.
        const PROTECTION_VIOLATION = 1 << 5;
        /// A reserved bit was set in some paging structure.
        const INVALID_PTE = 1 << 6;
        /// The access was an instruction fetch.
        const INSTRUCTION_FETCH = 1 << 7;
    }
}

bitflags! {
    /// Hints accompanying a TLB invalidation request.
    ///
    /// The low byte selects which TLBs to touch, the second byte describes
    /// what changed about the range. Implementations use the change type
    /// to pick the cheapest flush the architecture allows.
    #[derive(Copy, Clone, Debug, Eq, PartialEq)]
    pub struct TlbHint: u32 {
        /// Invalidate the calling processor's TLB.
        const LOCAL  = 1 << 0;
        /// Shoot down every remote processor that has the map installed.
        const REMOTE = 1 << 1;
        /// Local and remote TLBs.
        const ALL = Self::LOCAL.bits() | Self::REMOTE.bits();

        /// The range was unmapped.
        const UNMAPPED = 1 << 8;
        /// One or more pages now point at different frames.
        const REMAPPED = 1 << 9;
        /// Protection went from less to more restrictive.
        const PROTECTION_TIGHTENED = 1 << 10;
        /// Protection went from more to less restrictive.
        const PROTECTION_LOOSENED = 1 << 11;
        /// The execute permission changed.
        const EXECUTE_CHANGED = 1 << 12;
        /// The supervisor/user permission changed.
        const PERMISSION_CHANGED = 1 << 13;

        /// Mask of the invalidation-scope byte.
        const SCOPE_MASK = 0xff;
        /// Mask of the change-type byte(s).
        const CHANGE_MASK = 0xff00;
    }
}

impl TlbHint {
    /// The invalidation-scope bits of this hint.
    #[must_use]
    pub const fn scope(self) -> Self {
        Self::from_bits_retain(self.bits() & Self::SCOPE_MASK.bits())
    }

    /// The change-type bits of this hint.
    #[must_use]
    pub const fn change(self) -> Self {
        Self::from_bits_retain(self.bits() & Self::CHANGE_MASK.bits())
    }

    /// Whether a flush is actually required for this change.
    ///
    /// A pure protection loosening may be resolved lazily: the stale entry
    /// is more restrictive than the tables, so the worst case is a
    /// spurious fault that refetches. Every other change type (and an
    /// unspecified one) gets a real invalidation.
    #[must_use]
    pub fn flush_required(self) -> bool {
        let change = self.change();
        !(change == Self::PROTECTION_LOOSENED)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn write_implies_read_after_normalize() {
        let m = AccessMode::KERNEL_WRITE.normalized();
        assert!(m.contains(AccessMode::KERNEL_READ));
        let m = AccessMode::USER_WRITE.normalized();
        assert!(m.contains(AccessMode::USER_READ));
        assert!(!m.contains(AccessMode::KERNEL_READ));
    }

    #[test]
    fn permits_checks_band_and_kind() {
        let kernel_rw = AccessMode::KERNEL_RW;
        let sup_write =
            FaultAccess::WRITE | FaultAccess::SUPERVISOR | FaultAccess::PAGE_NOT_PRESENT;
        let user_write = FaultAccess::WRITE | FaultAccess::USER | FaultAccess::PAGE_NOT_PRESENT;
        assert!(kernel_rw.permits(sup_write));
        assert!(!kernel_rw.permits(user_write));

        let ro = AccessMode::KERNEL_READ;
        let sup_read = FaultAccess::READ | FaultAccess::SUPERVISOR | FaultAccess::PAGE_NOT_PRESENT;
        assert!(ro.permits(sup_read));
        assert!(!ro.permits(sup_write));

        let exec = AccessMode::KERNEL_EXEC;
        let fetch = FaultAccess::READ
            | FaultAccess::SUPERVISOR
            | FaultAccess::INSTRUCTION_FETCH
            | FaultAccess::PAGE_NOT_PRESENT;
        assert!(exec.permits(fetch));
        assert!(!ro.permits(fetch));
    }

    #[test]
    fn hint_masks_split_scope_and_change() {
        let h = TlbHint::ALL | TlbHint::UNMAPPED;
        assert_eq!(h.scope(), TlbHint::ALL);
        assert_eq!(h.change(), TlbHint::UNMAPPED);
        assert!(h.flush_required());
        assert!(!(TlbHint::LOCAL | TlbHint::PROTECTION_LOOSENED).flush_required());
        assert!((TlbHint::LOCAL | TlbHint::PROTECTION_LOOSENED | TlbHint::EXECUTE_CHANGED)
            .flush_required());
    }
}
