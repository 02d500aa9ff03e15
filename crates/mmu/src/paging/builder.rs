//! Construction of the kernel's initial page tables.
//!
//! The running layer never allocates intermediate tables, so every range that
//! may be mapped later has to be given its tables here, either mapped or merely
//! reserved. Tables built here are not yet visible to any CPU, so entries are
//! stored directly instead of through the update loop.

use crate::{
    AddressTranslator, MmuError, PAGE_SIZE, PhysicalAddress, StructuralFault, VirtualAddress,
    pool::TablePool,
};

use super::{EntryCell, EntryFlags, MapFlags, PageTable, PageTableEntry, PagingMode};

/// Builds a page-table tree from pages of a [`TablePool`].
pub struct TableBuilder<'a, M: PagingMode> {
    translator: &'a AddressTranslator,
    pool: &'a mut TablePool,
    root: PhysicalAddress,
    _mode: core::marker::PhantomData<M>,
}

impl<'a, M: PagingMode> TableBuilder<'a, M> {
    /// Starts an empty tree, taking its root from `pool`.
    pub fn new(translator: &'a AddressTranslator, pool: &'a mut TablePool) -> Result<Self, MmuError> {
        let root = pool.allocate(translator)?;
        log::debug!("building {} tables at {root}", M::NAME);
        Ok(Self {
            translator,
            pool,
            root,
            _mode: core::marker::PhantomData,
        })
    }

    /// Physical address of the root table.
    pub const fn root(&self) -> PhysicalAddress {
        self.root
    }

    /// Maps `size` bytes at `virt` to `phys`.
    pub fn map(
        &mut self,
        virt: VirtualAddress,
        phys: PhysicalAddress,
        size: usize,
        flags: MapFlags,
    ) -> Result<(), MmuError> {
        Self::check_range(virt, size)?;
        if !phys.is_aligned(PAGE_SIZE as u64) {
            return Err(MmuError::InvalidArgument);
        }

        let flags = EntryFlags::PRESENT | EntryFlags::for_mapping(flags)?;
        for offset in (0..size).step_by(PAGE_SIZE) {
            let entry = PageTableEntry::new(phys + offset as u64, flags);
            self.leaf_for(virt + offset)?.store(entry);
        }

        Ok(())
    }

    /// Creates the tables for `size` bytes at `virt` without mapping anything.
    pub fn reserve(&mut self, virt: VirtualAddress, size: usize) -> Result<(), MmuError> {
        Self::check_range(virt, size)?;
        for offset in (0..size).step_by(PAGE_SIZE) {
            self.leaf_for(virt + offset)?;
        }

        Ok(())
    }

    /// Maps one large page at `level`, which must be above the leaf level.
    pub fn map_large_page(
        &mut self,
        virt: VirtualAddress,
        phys: PhysicalAddress,
        level: usize,
        flags: MapFlags,
    ) -> Result<(), MmuError> {
        if level >= M::leaf_level() {
            return Err(MmuError::InvalidArgument);
        }
        let scope = M::LEVELS[level].entry_scope();
        if virt.as_usize() as u64 % scope != 0 || phys.as_u64() % scope != 0 {
            return Err(MmuError::InvalidArgument);
        }

        let flags = EntryFlags::PRESENT | EntryFlags::LARGE_PAGE | EntryFlags::for_mapping(flags)?;
        self.entry_at(virt, level)?.store(PageTableEntry::new(phys, flags));
        Ok(())
    }

    fn check_range(virt: VirtualAddress, size: usize) -> Result<(), MmuError> {
        let first = virt.as_usize() as u64;
        let valid = virt.is_aligned(PAGE_SIZE)
            && size % PAGE_SIZE == 0
            && (size == 0
                || first
                    .checked_add(size as u64 - 1)
                    .is_some_and(|last| M::is_valid_range(first, last)));

        if valid { Ok(()) } else { Err(MmuError::InvalidArgument) }
    }

    fn leaf_for(&mut self, virt: VirtualAddress) -> Result<&'a EntryCell<M::Word>, MmuError> {
        self.entry_at(virt, M::leaf_level())
    }

    /// Returns the slot for `virt` at `level`, creating the tables above it.
    fn entry_at(&mut self, virt: VirtualAddress, level: usize) -> Result<&'a EntryCell<M::Word>, MmuError> {
        let mut table_phys = self.root;
        for current in 0..level {
            // SAFETY: Every table of the tree came from the pool and is reachable
            // through the translator.
            let table = unsafe { PageTable::<M>::from_physical(self.translator, table_phys, current) };
            let cell = table.entry_for(virt);
            let entry = cell.load();

            table_phys = if !entry.is_present() {
                let child = self.pool.allocate(self.translator)?;
                cell.store(PageTableEntry::from_raw(child.as_u64() | table.layout().link_flags));
                child
            } else if M::is_leaf(current, entry) {
                return Err(StructuralFault::LargePage { level: current }.into());
            } else {
                entry.physical_address(table.layout())
            };
        }

        // SAFETY: As above.
        let table = unsafe { PageTable::<M>::from_physical(self.translator, table_phys, level) };
        Ok(table.entry_for(virt))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::arch::EmulatedPlatform;
    use crate::paging::{EntryState, Ia32e, Pae, TableWalker};

    fn setup() -> (AddressTranslator, TablePool) {
        let translator = AddressTranslator::emulated(64);
        let base = translator
            .emulated_memory()
            .and_then(|memory| memory.allocate_frames(32))
            .unwrap();
        let pool = unsafe { TablePool::new(base, 32) };
        (translator, pool)
    }

    #[test]
    fn maps_pages_with_fresh_tables() {
        let (translator, mut pool) = setup();
        let mut builder = TableBuilder::<Ia32e>::new(&translator, &mut pool).unwrap();
        let virt = VirtualAddress::new(0xFFFF_8000_0010_0000);

        builder
            .map(virt, PhysicalAddress::new(0x0010_0000), 2 * PAGE_SIZE, MapFlags::WRITE)
            .unwrap();
        let root = builder.root();
        // Root plus one table per lower level.
        assert_eq!(pool.remaining(), 32 - 4);

        let platform = EmulatedPlatform::new(root);
        let walker = unsafe { TableWalker::<Ia32e, _>::new(&translator, &platform, None) };
        let leaf = walker.walk_to_leaf(root, virt + PAGE_SIZE);
        assert_eq!(
            leaf.state(),
            EntryState::Present(PageTableEntry::new(
                PhysicalAddress::new(0x0010_1000),
                EntryFlags::PRESENT | EntryFlags::for_mapping(MapFlags::WRITE).unwrap(),
            ))
        );
    }

    #[test]
    fn pae_top_level_links_are_present_only() {
        let (translator, mut pool) = setup();
        let mut builder = TableBuilder::<Pae>::new(&translator, &mut pool).unwrap();

        builder.reserve(VirtualAddress::new(0x4000_0000), PAGE_SIZE).unwrap();
        let root = builder.root();

        let root_table = unsafe { PageTable::<Pae>::from_physical(&translator, root, 0) };
        let link = root_table.entry_for(VirtualAddress::new(0x4000_0000)).load();
        assert_eq!(link.flags(), EntryFlags::PRESENT);
    }

    #[test]
    fn refuses_to_descend_through_large_pages() {
        let (translator, mut pool) = setup();
        let mut builder = TableBuilder::<Ia32e>::new(&translator, &mut pool).unwrap();
        let virt = VirtualAddress::new(0x8000_0000);

        builder
            .map_large_page(virt, PhysicalAddress::new(0x8000_0000), 2, MapFlags::WRITE)
            .unwrap();

        assert_eq!(
            builder.map(virt, PhysicalAddress::new(0x1000), PAGE_SIZE, MapFlags::empty()),
            Err(MmuError::StructuralFault(StructuralFault::LargePage { level: 2 }))
        );
    }

    #[test]
    fn rejects_misaligned_requests() {
        let (translator, mut pool) = setup();
        let mut builder = TableBuilder::<Ia32e>::new(&translator, &mut pool).unwrap();

        assert_eq!(
            builder.map(VirtualAddress::new(0x1010), PhysicalAddress::new(0x1000), PAGE_SIZE, MapFlags::empty()),
            Err(MmuError::InvalidArgument)
        );
        assert_eq!(
            builder.map_large_page(
                VirtualAddress::new(0x1000),
                PhysicalAddress::new(0),
                2,
                MapFlags::empty()
            ),
            Err(MmuError::InvalidArgument)
        );
    }
}
