//! Walking page-table trees and applying changes to page ranges.
//!
//! Intermediate tables are never allocated here: a walk that finds a missing
//! table reports it instead. Range operations are a flat loop over pages, each
//! walking from the root, which keeps stack use independent of the tree depth.

use alloc::vec;
use core::marker::PhantomData;

use crate::{
    AddressTranslator, MmuError, PAGE_SIZE, PhysicalAddress, StructuralFault, VirtualAddress,
    arch::Platform, pool::TablePool,
};

use super::{
    EntryCell, EntryFlags, EntryState, PageIsolation, PageTableEntry, PagingLevel, PagingMode,
    Update, UpdateOptions,
};

/// One table of a page-table tree.
pub struct PageTable<'a, M: PagingMode> {
    entries: &'a [EntryCell<M::Word>],
    level: usize,
}

impl<'a, M: PagingMode> PageTable<'a, M> {
    /// Views the table at `phys` as a table of the given level.
    ///
    /// # Safety
    ///
    /// `phys` must hold a page table of that level, reachable through
    /// `translator`, that stays allocated for `'a`.
    pub unsafe fn from_physical(
        translator: &'a AddressTranslator,
        phys: PhysicalAddress,
        level: usize,
    ) -> Self {
        let ptr = translator.phys_to_ptr::<EntryCell<M::Word>>(phys);
        // SAFETY: Guaranteed by the caller.
        let entries = unsafe { core::slice::from_raw_parts(ptr, M::LEVELS[level].entry_count) };
        Self { entries, level }
    }

    /// Index of this table's level, root being 0.
    pub const fn level(&self) -> usize {
        self.level
    }

    /// Layout of this table's level.
    pub fn layout(&self) -> &'static PagingLevel {
        &M::LEVELS[self.level]
    }

    pub fn entries(&self) -> &'a [EntryCell<M::Word>] {
        self.entries
    }

    /// Returns the slot that translates `virt`.
    pub fn entry_for(&self, virt: VirtualAddress) -> &'a EntryCell<M::Word> {
        &self.entries[self.layout().index_of(virt)]
    }
}

/// The entry a walk stopped at.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LeafEntry {
    /// The raw stored value, possibly flipped.
    pub entry: PageTableEntry,
    /// Index of the level the walk stopped at.
    pub level: usize,
    /// Layout of that level.
    pub layout: &'static PagingLevel,
}

impl LeafEntry {
    pub const fn state(&self) -> EntryState {
        self.entry.state(self.layout)
    }
}

/// A change applied to every page of a range.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RangeOp {
    /// Replace the bits selected by `mask` with `flags` and the page's physical
    /// address, counted up from `phys`.
    Map {
        phys: PhysicalAddress,
        flags: EntryFlags,
        mask: u64,
    },
    /// Rebuild live permissions from their origins.
    ResetPermissions,
    /// Zero every entry.
    Clear,
}

impl RangeOp {
    /// Changes only the flag bits selected by `mask`, leaving addresses alone.
    pub const fn protect(flags: EntryFlags, mask: EntryFlags) -> Self {
        Self::Map {
            phys: PhysicalAddress::new(0),
            flags,
            mask: mask.bits(),
        }
    }

    fn update_for(&self, offset: usize) -> Update {
        match *self {
            Self::Map { phys, flags, mask } => Update::Masked {
                value: (phys.as_u64() + offset as u64) | flags.bits(),
                mask,
            },
            Self::ResetPermissions => Update::ResetPermissions,
            Self::Clear => Update::Clear,
        }
    }
}

/// Reads and modifies the page-table trees of one paging mode.
pub struct TableWalker<'a, M: PagingMode, P: Platform> {
    translator: &'a AddressTranslator,
    platform: &'a P,
    isolation: Option<&'a PageIsolation>,
    _mode: PhantomData<M>,
}

impl<'a, M: PagingMode, P: Platform> TableWalker<'a, M, P> {
    /// Creates a walker.
    ///
    /// # Safety
    ///
    /// Every root later passed to the walker must be the top of a well-formed
    /// tree of `M` whose tables are reachable through `translator` for `'a`.
    pub unsafe fn new(
        translator: &'a AddressTranslator,
        platform: &'a P,
        isolation: Option<&'a PageIsolation>,
    ) -> Self {
        Self {
            translator,
            platform,
            isolation,
            _mode: PhantomData,
        }
    }

    fn table(&self, phys: PhysicalAddress, level: usize) -> PageTable<'a, M> {
        // SAFETY: The tree is well-formed (see `new`), so every linked table exists.
        unsafe { PageTable::from_physical(self.translator, phys, level) }
    }

    /// Descends from `root` until a non-present entry or a leaf. Never mutates.
    pub fn walk_to_leaf(&self, root: PhysicalAddress, virt: VirtualAddress) -> LeafEntry {
        let mut table = self.table(root, 0);
        loop {
            let entry = table.entry_for(virt).load();
            let level = table.level();
            if !entry.is_present() || M::is_leaf(level, entry) {
                return LeafEntry {
                    entry,
                    level,
                    layout: table.layout(),
                };
            }

            table = self.table(entry.physical_address(table.layout()), level + 1);
        }
    }

    /// Applies `update` to the leaf entry translating `virt` under `root`.
    ///
    /// Returns the previous, unflipped value of the entry.
    pub fn set_mapping(
        &self,
        root: PhysicalAddress,
        virt: VirtualAddress,
        update: Update,
        options: UpdateOptions,
    ) -> Result<PageTableEntry, MmuError> {
        let mut table = self.table(root, 0);
        for level in 0..M::leaf_level() {
            let entry = table.entry_for(virt).load();
            if !entry.is_present() {
                log::error!("{virt:?}: no {} table under root {root}", M::LEVELS[level + 1].name);
                return Err(StructuralFault::MissingTable { level }.into());
            }
            if M::is_leaf(level, entry) {
                log::error!("{virt:?}: large page at {} level under root {root}", table.layout().name);
                return Err(StructuralFault::LargePage { level }.into());
            }

            table = self.table(entry.physical_address(table.layout()), level + 1);
        }

        let previous = table.entry_for(virt).update(
            update,
            options.contains(UpdateOptions::USER_TABLE),
            self.isolation,
            M::leaf(),
        );

        if options.contains(UpdateOptions::FLUSH) {
            self.platform.flush_page(virt);
        }

        Ok(previous)
    }

    /// Checks a range operation without touching any table.
    pub fn validate_range(virt: VirtualAddress, size: usize, op: &RangeOp) -> Result<(), MmuError> {
        if !virt.is_aligned(PAGE_SIZE) || size % PAGE_SIZE != 0 {
            log::error!("unaligned range {virt:?} + {size:#x}");
            return Err(MmuError::InvalidArgument);
        }
        if size == 0 {
            return Ok(());
        }

        let first = virt.as_usize() as u64;
        let valid = first
            .checked_add(size as u64 - 1)
            .is_some_and(|last| M::is_valid_range(first, last));
        if !valid {
            log::error!("range {virt:?} + {size:#x} is not translatable in {} mode", M::NAME);
            return Err(MmuError::InvalidArgument);
        }

        if let RangeOp::Map { phys, flags, .. } = *op {
            if !phys.is_aligned(PAGE_SIZE as u64) {
                log::error!("unaligned physical address {phys:?}");
                return Err(MmuError::InvalidArgument);
            }
            if flags.bits() & M::root().physical_address_mask != 0 || flags.contains(EntryFlags::PAT) {
                log::error!("flags {flags:?} overlap the address field or the PAT bit");
                return Err(MmuError::InvalidArgument);
            }

            let leaf_mask = M::leaf().physical_address_mask;
            let fits = phys
                .checked_add(size as u64 - PAGE_SIZE as u64)
                .is_some_and(|last| (phys.as_u64() | last.as_u64()) & !leaf_mask & !0xFFF == 0);
            if !fits {
                log::error!("{phys:?} + {size:#x} does not fit {} entries", M::NAME);
                return Err(MmuError::InvalidArgument);
            }
        }

        Ok(())
    }

    /// Validates and applies `op` to every page of a range under `root`.
    pub fn map_range(
        &self,
        root: PhysicalAddress,
        virt: VirtualAddress,
        size: usize,
        op: RangeOp,
        options: UpdateOptions,
    ) -> Result<(), MmuError> {
        Self::validate_range(virt, size, &op)?;
        self.map_validated_range(root, virt, size, op, options)
    }

    /// Applies an already validated `op` page by page.
    ///
    /// Pages that fail are skipped; the remaining pages are still attempted and
    /// the first error is returned.
    pub(crate) fn map_validated_range(
        &self,
        root: PhysicalAddress,
        virt: VirtualAddress,
        size: usize,
        op: RangeOp,
        options: UpdateOptions,
    ) -> Result<(), MmuError> {
        log::trace!("{op:?} {virt:?} + {size:#x} under root {root} ({options:?})");

        let mut first_error = None;
        for offset in (0..size).step_by(PAGE_SIZE) {
            if let Err(error) = self.set_mapping(root, virt + offset, op.update_for(offset), options) {
                first_error.get_or_insert(error);
            }
        }

        first_error.map_or(Ok(()), Err)
    }

    /// Fills `dst_root` with a copy of the tree under `src_root`.
    ///
    /// Leaves get their original permissions back and are hidden when they are
    /// supervisor-only; the copy is meant for a root user threads run under.
    /// Intermediate tables are taken from `pool`. On failure the pages already
    /// taken stay allocated.
    pub fn copy_tables(
        &self,
        dst_root: PhysicalAddress,
        src_root: PhysicalAddress,
        pool: &mut TablePool,
    ) -> Result<(), MmuError> {
        let mut worklist = vec![(src_root, dst_root, 0)];

        while let Some((src, dst, level)) = worklist.pop() {
            let source = self.table(src, level);
            let destination = self.table(dst, level);
            let layout = source.layout();

            for (from, to) in source.entries().iter().zip(destination.entries()) {
                let entry = from.load();

                if level == M::leaf_level() {
                    let mut value = entry.restore_original_permissions();
                    if let Some(isolation) = self.isolation {
                        value = isolation.hide(value, true, layout);
                    }
                    to.store(value);
                } else if !entry.is_present() {
                    to.store(PageTableEntry::UNMAPPED);
                } else if M::is_leaf(level, entry) {
                    log::error!("cannot copy large page at {} level", layout.name);
                    return Err(StructuralFault::LargePage { level }.into());
                } else {
                    let child = pool.allocate(self.translator)?;
                    to.store(PageTableEntry::from_raw(child.as_u64() | layout.link_flags));
                    worklist.push((entry.physical_address(layout), child, level + 1));
                }
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::arch::EmulatedPlatform;
    use crate::paging::{EntryWord, Ia32, Ia32e, MapFlags, Pae};
    use crate::test_support::{self, KERNEL_DATA, LARGE_PAGE, RESERVED, SHARED_PAGE};

    /// Read-write and executable, so that every mode can represent it.
    fn rw() -> EntryFlags {
        EntryFlags::PRESENT | EntryFlags::for_mapping(MapFlags::WRITE | MapFlags::EXECUTE).unwrap()
    }

    fn map_walk_and_clear<M: PagingMode>() {
        let tables = test_support::kernel_tables::<M>();
        let platform = EmulatedPlatform::new(tables.root);
        let walker = unsafe { TableWalker::<M, _>::new(&tables.translator, &platform, None) };
        let phys = PhysicalAddress::new(0x0100_0000);

        walker
            .map_range(
                tables.root,
                RESERVED,
                2 * PAGE_SIZE,
                RangeOp::Map { phys, flags: rw(), mask: u64::MAX },
                UpdateOptions::FLUSH,
            )
            .unwrap();

        let leaf = walker.walk_to_leaf(tables.root, RESERVED + PAGE_SIZE);
        assert_eq!(leaf.level, M::leaf_level());
        assert_eq!(leaf.state(), EntryState::Present(PageTableEntry::new(phys + 0x1000, rw())));
        assert_eq!(platform.flushed_pages(), vec![RESERVED, RESERVED + PAGE_SIZE]);

        walker
            .map_range(tables.root, RESERVED, 2 * PAGE_SIZE, RangeOp::Clear, UpdateOptions::empty())
            .unwrap();
        assert_eq!(walker.walk_to_leaf(tables.root, RESERVED).state(), EntryState::Unmapped);
    }

    #[test]
    fn map_walk_and_clear_in_every_mode() {
        map_walk_and_clear::<Ia32>();
        map_walk_and_clear::<Pae>();
        map_walk_and_clear::<Ia32e>();
    }

    #[test]
    fn rejects_unaligned_ranges_without_mutation() {
        let tables = test_support::kernel_tables::<Ia32e>();
        let platform = EmulatedPlatform::new(tables.root);
        let walker = unsafe { TableWalker::<Ia32e, _>::new(&tables.translator, &platform, None) };
        let op = RangeOp::Map {
            phys: PhysicalAddress::new(0x0100_0000),
            flags: rw(),
            mask: u64::MAX,
        };

        let unaligned_virt = walker.map_range(tables.root, RESERVED + 0x10, PAGE_SIZE, op, UpdateOptions::empty());
        let unaligned_size = walker.map_range(tables.root, RESERVED, 0x1800, op, UpdateOptions::empty());

        assert_eq!(unaligned_virt, Err(MmuError::InvalidArgument));
        assert_eq!(unaligned_size, Err(MmuError::InvalidArgument));
        assert_eq!(walker.walk_to_leaf(tables.root, RESERVED).state(), EntryState::Unmapped);
    }

    #[test]
    fn rejects_bad_flags_and_addresses() {
        let phys = PhysicalAddress::new(0x0100_0000);
        let validate = |virt: usize, size: usize, op: RangeOp| {
            TableWalker::<Ia32e, EmulatedPlatform>::validate_range(VirtualAddress::new(virt), size, &op)
        };

        let address_flags = RangeOp::Map {
            phys,
            flags: EntryFlags::from_bits_retain(0x1000 | EntryFlags::PRESENT.bits()),
            mask: u64::MAX,
        };
        let pat = RangeOp::Map { phys, flags: EntryFlags::PAT, mask: u64::MAX };
        let unaligned_phys = RangeOp::Map { phys: phys + 0x10, flags: rw(), mask: u64::MAX };
        let too_high = RangeOp::Map {
            phys: PhysicalAddress::new(0x0800_0000_0000_0000),
            flags: rw(),
            mask: u64::MAX,
        };

        assert_eq!(validate(0x4000_0000, PAGE_SIZE, address_flags), Err(MmuError::InvalidArgument));
        assert_eq!(validate(0x4000_0000, PAGE_SIZE, pat), Err(MmuError::InvalidArgument));
        assert_eq!(validate(0x4000_0000, PAGE_SIZE, unaligned_phys), Err(MmuError::InvalidArgument));
        assert_eq!(validate(0x4000_0000, PAGE_SIZE, too_high), Err(MmuError::InvalidArgument));
        assert_eq!(validate(usize::MAX & !0xFFF, 2 * PAGE_SIZE, RangeOp::Clear), Err(MmuError::InvalidArgument));
        assert_eq!(validate(0x0000_8000_0000_0000, PAGE_SIZE, RangeOp::Clear), Err(MmuError::InvalidArgument));
        assert_eq!(validate(0x4000_0000, 0, RangeOp::Clear), Ok(()));
    }

    #[test]
    fn narrow_modes_reject_high_addresses() {
        let result = TableWalker::<Ia32, EmulatedPlatform>::validate_range(
            VirtualAddress::new(0xFFFF_F000),
            2 * PAGE_SIZE,
            &RangeOp::Clear,
        );

        assert_eq!(result, Err(MmuError::InvalidArgument));
    }

    #[test]
    fn reports_structural_faults() {
        let tables = test_support::kernel_tables_with_large_page::<Pae>();
        let platform = EmulatedPlatform::new(tables.root);
        let walker = unsafe { TableWalker::<Pae, _>::new(&tables.translator, &platform, None) };

        let large = walker.set_mapping(tables.root, LARGE_PAGE, Update::Clear, UpdateOptions::empty());
        let missing = walker.set_mapping(
            tables.root,
            VirtualAddress::new(0xC000_0000),
            Update::Clear,
            UpdateOptions::empty(),
        );

        assert_eq!(large, Err(MmuError::StructuralFault(StructuralFault::LargePage { level: 1 })));
        assert_eq!(missing, Err(MmuError::StructuralFault(StructuralFault::MissingTable { level: 0 })));

        let leaf = walker.walk_to_leaf(tables.root, LARGE_PAGE);
        assert_eq!(leaf.level, 1);
        assert!(leaf.entry.flags().contains(EntryFlags::LARGE_PAGE));
    }

    #[test]
    fn range_errors_do_not_stop_later_pages() {
        let tables = test_support::kernel_tables::<Ia32>();
        let platform = EmulatedPlatform::new(tables.root);
        let walker = unsafe { TableWalker::<Ia32, _>::new(&tables.translator, &platform, None) };
        let phys = PhysicalAddress::new(0x0100_0000);

        // The page below the reserved region has no table.
        let result = walker.map_range(
            tables.root,
            VirtualAddress::new(RESERVED.as_usize() - PAGE_SIZE),
            2 * PAGE_SIZE,
            RangeOp::Map { phys, flags: rw(), mask: u64::MAX },
            UpdateOptions::empty(),
        );

        assert_eq!(result, Err(MmuError::StructuralFault(StructuralFault::MissingTable { level: 0 })));
        assert_eq!(
            walker.walk_to_leaf(tables.root, RESERVED).state(),
            EntryState::Present(PageTableEntry::new(phys + 0x1000, rw()))
        );
    }

    fn copy_restores_and_hides<M: PagingMode>() {
        let mut tables = test_support::kernel_tables::<M>();
        let platform = EmulatedPlatform::new(tables.root);
        let isolation = PageIsolation::new(test_support::SHARED_PHYS);
        let walker = unsafe { TableWalker::<M, _>::new(&tables.translator, &platform, Some(&isolation)) };

        // Restrict a kernel page in the source; the copy must see the original permissions.
        walker
            .set_mapping(
                tables.root,
                KERNEL_DATA,
                Update::Masked { value: 0, mask: EntryFlags::WRITABLE.bits() },
                UpdateOptions::empty(),
            )
            .unwrap();

        let copy = tables.pool.allocate(&tables.translator).unwrap();
        walker.copy_tables(copy, tables.root, &mut tables.pool).unwrap();

        let original = walker.walk_to_leaf(tables.root, KERNEL_DATA).entry;
        let copied = walker.walk_to_leaf(copy, KERNEL_DATA).entry;
        assert!(copied.is_isolation_flipped());
        let restored = original.raw() | EntryFlags::WRITABLE.bits();
        assert_eq!(<M::Word as EntryWord>::narrow(copied.unflipped().raw()).widen(), restored);
        assert_eq!(
            walker.walk_to_leaf(copy, KERNEL_DATA).level,
            walker.walk_to_leaf(tables.root, KERNEL_DATA).level
        );

        let shared = walker.walk_to_leaf(copy, SHARED_PAGE);
        assert_eq!(shared.state(), EntryState::Present(walker.walk_to_leaf(tables.root, SHARED_PAGE).entry));

        // Reserved tables are copied too, so later mappings reach the copy.
        assert_eq!(walker.walk_to_leaf(copy, RESERVED).level, M::leaf_level());
    }

    #[test]
    fn copy_restores_and_hides_in_every_mode() {
        copy_restores_and_hides::<Ia32>();
        copy_restores_and_hides::<Pae>();
        copy_restores_and_hides::<Ia32e>();
    }

    #[test]
    fn copy_stops_at_large_pages() {
        let mut tables = test_support::kernel_tables_with_large_page::<Ia32e>();
        let platform = EmulatedPlatform::new(tables.root);
        let walker = unsafe { TableWalker::<Ia32e, _>::new(&tables.translator, &platform, None) };
        let copy = tables.pool.allocate(&tables.translator).unwrap();

        let result = walker.copy_tables(copy, tables.root, &mut tables.pool);

        assert!(matches!(result, Err(MmuError::StructuralFault(StructuralFault::LargePage { .. }))));
    }

    #[test]
    fn copy_reports_pool_exhaustion() {
        let mut tables = test_support::kernel_tables::<Ia32e>();
        let platform = EmulatedPlatform::new(tables.root);
        let walker = unsafe { TableWalker::<Ia32e, _>::new(&tables.translator, &platform, None) };
        let copy = tables.pool.allocate(&tables.translator).unwrap();
        let mut empty = TablePool::empty();

        assert_eq!(walker.copy_tables(copy, tables.root, &mut empty), Err(MmuError::OutOfMemory));
    }
}
