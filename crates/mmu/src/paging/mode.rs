//! Paging modes supported by the layer.
//!
//! Each mode is a zero-sized type describing its table tree root-to-leaf. The
//! rest of the crate is generic over [`PagingMode`], so a 32-bit kernel and a
//! 64-bit kernel run exactly the same walking and updating code.

use crate::VirtualAddress;

use super::{EntryFlags, EntryWord, PageTableEntry};

/// One level of a page-table tree.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PagingLevel {
    /// Human-readable name of the level, for logs.
    pub name: &'static str,
    /// Number of entries in one table of this level.
    pub entry_count: usize,
    /// Number of low virtual-address bits below this level's index.
    pub address_shift: u32,
    /// Bits of an entry at this level that hold a physical address.
    pub physical_address_mask: u64,
    /// Flags written into an entry that links to a next-level table.
    pub link_flags: u64,
}

/// Flags of a link entry in most levels.
const LINK: u64 = EntryFlags::PRESENT
    .union(EntryFlags::WRITABLE)
    .union(EntryFlags::USER)
    .bits();

/// PAE PDPT entries reserve bits 1 and 2.
const PAE_PDPT_LINK: u64 = EntryFlags::PRESENT.bits();

/// Address mask of intermediate 64-bit entries.
const WIDE_TABLE_MASK: u64 = 0x7FFF_FFFF_FFFF_F000;
/// Address mask of 64-bit leaf entries; bits 59..62 are protection keys.
const WIDE_LEAF_MASK: u64 = 0x07FF_FFFF_FFFF_F000;
/// Address mask of 32-bit entries.
const NARROW_MASK: u64 = 0xFFFF_F000;

impl PagingLevel {
    /// Bytes of virtual address space covered by one entry.
    pub const fn entry_scope(&self) -> u64 {
        1 << self.address_shift
    }

    /// Bytes of virtual address space covered by one table.
    pub const fn table_scope(&self) -> u64 {
        self.entry_scope() * self.entry_count as u64
    }

    /// Returns the index of `virt` in a table of this level.
    pub const fn index_of(&self, virt: VirtualAddress) -> usize {
        ((virt.as_usize() as u64 >> self.address_shift) as usize) & (self.entry_count - 1)
    }
}

/// A paging mode: table tree shape plus entry width.
pub trait PagingMode: Send + Sync + 'static {
    /// Storage type of one entry.
    type Word: EntryWord;

    /// Name of the mode, for logs.
    const NAME: &'static str;

    /// Levels of the table tree, root first. The last level is always a leaf.
    const LEVELS: &'static [PagingLevel];

    /// Returns whether `virt` can be translated in this mode.
    fn is_canonical(virt: u64) -> bool;

    /// Returns whether every address in `first..=last` can be translated.
    fn is_valid_range(first: u64, last: u64) -> bool {
        first <= last && Self::is_canonical(first) && Self::is_canonical(last)
    }

    /// Index of the leaf level.
    fn leaf_level() -> usize {
        Self::LEVELS.len() - 1
    }

    /// The root level.
    fn root() -> &'static PagingLevel {
        &Self::LEVELS[0]
    }

    /// The leaf level.
    fn leaf() -> &'static PagingLevel {
        &Self::LEVELS[Self::leaf_level()]
    }

    /// Returns whether `entry` at `level` maps memory rather than linking to a table.
    ///
    /// The large-page bit only has that meaning above the leaf level; at the leaf
    /// it would be the PAT bit.
    fn is_leaf(level: usize, entry: PageTableEntry) -> bool {
        level == Self::leaf_level() || entry.flags().contains(EntryFlags::LARGE_PAGE)
    }

    /// Drops the bits an entry of this mode cannot hold.
    fn canonical(entry: PageTableEntry) -> PageTableEntry {
        PageTableEntry::from_raw(<Self::Word as EntryWord>::narrow(entry.raw()).widen())
    }
}

/// Classic 32-bit paging: two levels of 1024 four-byte entries.
pub enum Ia32 {}

/// Physical-address extension: 32-bit virtual addresses, 64-bit entries.
pub enum Pae {}

/// Four-level long-mode paging.
pub enum Ia32e {}

impl PagingMode for Ia32 {
    type Word = u32;
    const NAME: &'static str = "32-bit";
    const LEVELS: &'static [PagingLevel] = &[
        PagingLevel {
            name: "PD",
            entry_count: 1024,
            address_shift: 22,
            physical_address_mask: NARROW_MASK,
            link_flags: LINK,
        },
        PagingLevel {
            name: "PT",
            entry_count: 1024,
            address_shift: 12,
            physical_address_mask: NARROW_MASK,
            link_flags: LINK,
        },
    ];

    fn is_canonical(virt: u64) -> bool {
        virt <= u32::MAX as u64
    }
}

impl PagingMode for Pae {
    type Word = u64;
    const NAME: &'static str = "PAE";
    const LEVELS: &'static [PagingLevel] = &[
        PagingLevel {
            name: "PDPT",
            entry_count: 4,
            address_shift: 30,
            physical_address_mask: WIDE_TABLE_MASK,
            link_flags: PAE_PDPT_LINK,
        },
        PagingLevel {
            name: "PD",
            entry_count: 512,
            address_shift: 21,
            physical_address_mask: WIDE_TABLE_MASK,
            link_flags: LINK,
        },
        PagingLevel {
            name: "PT",
            entry_count: 512,
            address_shift: 12,
            physical_address_mask: WIDE_LEAF_MASK,
            link_flags: LINK,
        },
    ];

    fn is_canonical(virt: u64) -> bool {
        virt <= u32::MAX as u64
    }
}

impl PagingMode for Ia32e {
    type Word = u64;
    const NAME: &'static str = "IA-32e";
    const LEVELS: &'static [PagingLevel] = &[
        PagingLevel {
            name: "PML4",
            entry_count: 512,
            address_shift: 39,
            physical_address_mask: WIDE_TABLE_MASK,
            link_flags: LINK,
        },
        PagingLevel {
            name: "PDPT",
            entry_count: 512,
            address_shift: 30,
            physical_address_mask: WIDE_TABLE_MASK,
            link_flags: LINK,
        },
        PagingLevel {
            name: "PD",
            entry_count: 512,
            address_shift: 21,
            physical_address_mask: WIDE_TABLE_MASK,
            link_flags: LINK,
        },
        PagingLevel {
            name: "PT",
            entry_count: 512,
            address_shift: 12,
            physical_address_mask: WIDE_LEAF_MASK,
            link_flags: LINK,
        },
    ];

    /// Bits 48..63 must be copies of bit 47.
    fn is_canonical(virt: u64) -> bool {
        let upper = virt >> 47;
        upper == 0 || upper == 0x1FFFF
    }

    fn is_valid_range(first: u64, last: u64) -> bool {
        first <= last
            && Self::is_canonical(first)
            && Self::is_canonical(last)
            && (first ^ last) & (1 << 47) == 0
    }
}

/// The paging mode of the compilation target.
#[cfg(target_arch = "x86_64")]
pub type NativeMode = Ia32e;
/// The paging mode of the compilation target.
#[cfg(all(target_arch = "x86", feature = "pae"))]
pub type NativeMode = Pae;
/// The paging mode of the compilation target.
#[cfg(all(target_arch = "x86", not(feature = "pae")))]
pub type NativeMode = Ia32;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scopes_cover_the_address_space() {
        assert_eq!(Ia32::root().table_scope(), 1 << 32);
        assert_eq!(Pae::root().table_scope(), 1 << 32);
        assert_eq!(Ia32e::root().table_scope(), 1 << 48);
        assert_eq!(Ia32e::leaf().entry_scope(), 4096);
    }

    #[test]
    fn indexes_virtual_addresses() {
        let virt = VirtualAddress::new(0x4020_3000);

        assert_eq!(Ia32::LEVELS[0].index_of(virt), 0x100);
        assert_eq!(Ia32::LEVELS[1].index_of(virt), 0x203);
        assert_eq!(Pae::LEVELS[0].index_of(virt), 1);
        assert_eq!(Pae::LEVELS[1].index_of(virt), 1);
        assert_eq!(Pae::LEVELS[2].index_of(virt), 3);
    }

    #[test]
    fn canonical_addresses() {
        assert!(Ia32e::is_canonical(0x0000_7FFF_FFFF_F000));
        assert!(Ia32e::is_canonical(0xFFFF_8000_0000_0000));
        assert!(!Ia32e::is_canonical(0x0000_8000_0000_0000));
        assert!(!Ia32::is_canonical(0x1_0000_0000));

        // A range may not straddle the non-canonical hole.
        assert!(!Ia32e::is_valid_range(0x0000_7FFF_FFFF_F000, 0xFFFF_8000_0000_0FFF));
    }

    #[test]
    fn narrow_entries_drop_high_bits() {
        let entry = PageTableEntry::from_raw(EntryFlags::NO_EXECUTE.bits() | 0x3);

        assert_eq!(Ia32::canonical(entry).raw(), 0x3);
        assert_eq!(Pae::canonical(entry), entry);
    }

    #[test]
    fn large_page_bit_only_matters_above_the_leaf() {
        let large = PageTableEntry::from_raw(0x8000_0083);

        assert!(Ia32e::is_leaf(2, large));
        assert!(!Ia32e::is_leaf(2, PageTableEntry::from_raw(0x8000_0003)));
        assert!(Ia32e::is_leaf(3, PageTableEntry::from_raw(0x8000_0003)));
    }
}
