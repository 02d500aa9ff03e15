//! Page-table entry encoding.
//!
//! Entries are handled as widened `u64` values in every mode and narrowed only
//! when stored, so all of the bit manipulation here is mode-independent.
//!
//! Bits 9 to 11 are ignored by the hardware. They remember the writable, user
//! and no-execute permissions a page was mapped with, so that temporary
//! restrictions applied by protection partitions can be undone exactly.

use bitflags::bitflags;

use crate::{MmuError, PhysicalAddress};

use super::PagingLevel;

bitflags! {
    /// Bits of a page-table entry.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct EntryFlags: u64 {
        const PRESENT = 1 << 0;
        const WRITABLE = 1 << 1;
        const USER = 1 << 2;
        const WRITE_THROUGH = 1 << 3;
        const CACHE_DISABLE = 1 << 4;
        const ACCESSED = 1 << 5;
        const DIRTY = 1 << 6;
        /// Large page above the leaf level, PAT at the leaf level.
        const LARGE_PAGE = 1 << 7;
        const GLOBAL = 1 << 8;
        const WRITABLE_ORIGIN = 1 << 9;
        const USER_ORIGIN = 1 << 10;
        const NO_EXECUTE_ORIGIN = 1 << 11;
        /// Not representable in 32-bit entries.
        const NO_EXECUTE = 1 << 63;
    }
}

impl EntryFlags {
    /// The leaf-level meaning of bit 7. Mappings never use it; in a non-present
    /// entry it marks an isolation flip.
    pub const PAT: Self = Self::LARGE_PAGE;

    /// Live permission bits.
    pub const PERMISSIONS: Self = Self::WRITABLE.union(Self::USER).union(Self::NO_EXECUTE);

    /// Origin shadows of the live permission bits.
    pub const ORIGINS: Self = Self::WRITABLE_ORIGIN
        .union(Self::USER_ORIGIN)
        .union(Self::NO_EXECUTE_ORIGIN);

    /// Live permissions together with their origin shadows.
    pub const TRACKED_PERMISSIONS: Self = Self::PERMISSIONS.union(Self::ORIGINS);

    /// Translates caller permissions into entry bits.
    ///
    /// Writable, user and no-execute are set together with their origins. The
    /// present bit is not included.
    pub fn for_mapping(flags: MapFlags) -> Result<Self, MmuError> {
        if flags.contains(MapFlags::CACHE_NONE | MapFlags::CACHE_WRITE_THROUGH) {
            log::error!("conflicting cache modes requested: {flags:?}");
            return Err(MmuError::InvalidArgument);
        }

        let mut entry = Self::empty();
        if flags.contains(MapFlags::WRITE) {
            entry |= Self::WRITABLE | Self::WRITABLE_ORIGIN;
        }
        if flags.contains(MapFlags::USER) {
            entry |= Self::USER | Self::USER_ORIGIN;
        }
        if !flags.contains(MapFlags::EXECUTE) {
            entry |= Self::NO_EXECUTE | Self::NO_EXECUTE_ORIGIN;
        }
        if flags.contains(MapFlags::CACHE_NONE) {
            entry |= Self::CACHE_DISABLE;
        }
        if flags.contains(MapFlags::CACHE_WRITE_THROUGH) {
            entry |= Self::WRITE_THROUGH;
        }

        Ok(entry)
    }
}

bitflags! {
    /// Permissions and caching requested by kernel code mapping a region.
    ///
    /// The default (no flags) is a read-only, non-executable, write-back
    /// supervisor mapping.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct MapFlags: u32 {
        const WRITE = 1 << 0;
        const EXECUTE = 1 << 1;
        const USER = 1 << 2;
        const CACHE_NONE = 1 << 3;
        const CACHE_WRITE_THROUGH = 1 << 4;
    }
}

/// A page-table entry value, widened to 64 bits.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
#[repr(transparent)]
pub struct PageTableEntry(u64);

impl PageTableEntry {
    /// The all-zero entry.
    pub const UNMAPPED: Self = Self(0);

    pub const fn from_raw(raw: u64) -> Self {
        Self(raw)
    }

    pub const fn raw(self) -> u64 {
        self.0
    }

    /// Creates an entry pointing at `phys` with `flags`.
    pub const fn new(phys: PhysicalAddress, flags: EntryFlags) -> Self {
        Self(phys.as_u64() | flags.bits())
    }

    /// Returns the flag bits, without the address.
    pub const fn flags(self) -> EntryFlags {
        EntryFlags::from_bits_truncate(self.0)
    }

    pub const fn is_present(self) -> bool {
        self.0 & EntryFlags::PRESENT.bits() != 0
    }

    /// Returns the physical address held by this entry at `level`.
    pub const fn physical_address(self, level: &PagingLevel) -> PhysicalAddress {
        PhysicalAddress::new(self.0 & level.physical_address_mask)
    }

    /// Rebuilds the live permission bits from their origin shadows.
    pub const fn restore_original_permissions(self) -> Self {
        let mut raw = self.0 & !EntryFlags::PERMISSIONS.bits();
        if self.0 & EntryFlags::WRITABLE_ORIGIN.bits() != 0 {
            raw |= EntryFlags::WRITABLE.bits();
        }
        if self.0 & EntryFlags::USER_ORIGIN.bits() != 0 {
            raw |= EntryFlags::USER.bits();
        }
        if self.0 & EntryFlags::NO_EXECUTE_ORIGIN.bits() != 0 {
            raw |= EntryFlags::NO_EXECUTE.bits();
        }
        Self(raw)
    }

    /// Complements every bit of the entry.
    pub const fn flipped(self) -> Self {
        Self(!self.0)
    }

    /// Returns whether the entry holds a flipped kernel mapping.
    pub const fn is_isolation_flipped(self) -> bool {
        !self.is_present() && self.0 & EntryFlags::PAT.bits() != 0
    }

    /// Undoes an isolation flip, if the entry carries one.
    pub const fn unflipped(self) -> Self {
        if self.is_isolation_flipped() {
            self.flipped()
        } else {
            self
        }
    }

    /// Decodes the entry.
    pub const fn state(self, level: &PagingLevel) -> EntryState {
        if self.0 == 0 {
            EntryState::Unmapped
        } else if self.is_present() {
            EntryState::Present(self)
        } else if self.is_isolation_flipped() {
            EntryState::IsolationHidden(self)
        } else {
            EntryState::PagedOut {
                location: self.0 & level.physical_address_mask,
            }
        }
    }
}

impl core::fmt::Debug for PageTableEntry {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "PageTableEntry({:#018x})", self.0)
    }
}

/// What an entry means.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryState {
    /// All zero.
    Unmapped,
    /// Mapped and visible to the hardware.
    Present(PageTableEntry),
    /// A kernel mapping hidden from a user-facing root; holds the flipped bits.
    IsolationHidden(PageTableEntry),
    /// Evicted to a backing store.
    PagedOut { location: u64 },
}

/// Kernel page-table isolation.
///
/// In roots that user threads run under, supervisor-only leaves are stored
/// complemented: the present bit reads as clear and the physical address is
/// scrambled. The single shared page (holding the trampoline code that switches
/// roots on kernel entry) stays visible.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageIsolation {
    shared_page: PhysicalAddress,
}

impl PageIsolation {
    /// Creates an isolation policy that leaves `shared_page` visible.
    pub const fn new(shared_page: PhysicalAddress) -> Self {
        Self { shared_page }
    }

    pub const fn shared_page(&self) -> PhysicalAddress {
        self.shared_page
    }

    /// Returns the value to store for `entry` in a root of the given kind.
    pub fn hide(&self, entry: PageTableEntry, user_table: bool, level: &PagingLevel) -> PageTableEntry {
        let hidden = user_table
            && entry.is_present()
            && !entry.flags().contains(EntryFlags::USER)
            && entry.physical_address(level) != self.shared_page;

        if hidden { entry.flipped() } else { entry }
    }
}
