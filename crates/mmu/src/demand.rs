//! Hooks for the demand-paging subsystem.
//!
//! A paged-out leaf is stored non-present with the accessed bit set and the
//! backing-store location in its address field, so it never reads as unmapped
//! even for location zero. Demand-paged ranges live in the kernel root only.

use bitflags::bitflags;

use crate::{
    Mmu, MmuError, PAGE_SIZE, PhysicalAddress, VirtualAddress,
    arch::Platform,
    paging::{EntryFlags, EntryState, MapFlags, PagingMode, RangeOp, TableWalker, Update, UpdateOptions},
};

/// Where the contents of a virtual page are.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PageLocation {
    NotMapped,
    /// Resident at this physical page.
    PagedIn(PhysicalAddress),
    /// Evicted to this backing-store location.
    PagedOut(u64),
}

bitflags! {
    /// Status of a page across every root.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct PageStatus: u32 {
        const LOADED = 1 << 0;
        const ACCESSED = 1 << 1;
        const DIRTY = 1 << 2;
        /// No root holds anything for the page.
        const NOT_MAPPED = 1 << 3;
    }
}

/// Result of [`Mmu::page_info`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageInfo {
    pub status: PageStatus,
    pub location: PageLocation,
}

impl<M: PagingMode, P: Platform> Mmu<M, P> {
    /// Marks the page at `virt` as evicted to `location`.
    pub fn page_out(&self, virt: VirtualAddress, location: u64) -> Result<(), MmuError> {
        self.check_demand_page(virt, location)?;

        let leaf_mask = M::leaf().physical_address_mask;
        self.walker().set_mapping(
            self.kernel_root,
            virt,
            Update::Masked {
                value: location | EntryFlags::ACCESSED.bits(),
                mask: leaf_mask | (EntryFlags::PRESENT | EntryFlags::ACCESSED).bits(),
            },
            UpdateOptions::FLUSH,
        )?;
        log::trace!("{virt:?} paged out to {location:#x}");

        self.tlb_shootdown();
        Ok(())
    }

    /// Makes the page at `virt` resident at `phys`.
    ///
    /// Accessed and dirty state carry over from before the page was evicted.
    pub fn page_in(&self, virt: VirtualAddress, phys: PhysicalAddress) -> Result<(), MmuError> {
        self.check_demand_page(virt, phys.as_u64())?;

        let leaf_mask = M::leaf().physical_address_mask;
        self.walker().set_mapping(
            self.kernel_root,
            virt,
            Update::Masked {
                value: phys.as_u64() | EntryFlags::PRESENT.bits(),
                mask: leaf_mask | EntryFlags::PRESENT.bits(),
            },
            UpdateOptions::FLUSH,
        )?;
        log::trace!("{virt:?} paged in at {phys}");

        self.tlb_shootdown();
        Ok(())
    }

    fn check_demand_page(&self, virt: VirtualAddress, address: u64) -> Result<(), MmuError> {
        let valid = virt.is_aligned(PAGE_SIZE)
            && M::is_canonical(virt.as_usize() as u64)
            && address & !M::leaf().physical_address_mask == 0;

        if valid {
            Ok(())
        } else {
            log::error!("invalid demand paging request for {virt:?} at {address:#x}");
            Err(MmuError::InvalidArgument)
        }
    }

    /// Returns where the page at `virt` is, according to the kernel root.
    pub fn query_location(&self, virt: VirtualAddress) -> PageLocation {
        let leaf = self.walker().walk_to_leaf(self.kernel_root, virt);
        let page_offset = (virt.as_usize() as u64 & (leaf.layout.entry_scope() - 1)) & !(PAGE_SIZE as u64 - 1);

        match leaf.state() {
            EntryState::Unmapped => PageLocation::NotMapped,
            EntryState::Present(entry) => PageLocation::PagedIn(entry.physical_address(leaf.layout) + page_offset),
            EntryState::IsolationHidden(entry) => {
                PageLocation::PagedIn(entry.unflipped().physical_address(leaf.layout) + page_offset)
            }
            EntryState::PagedOut { location } => PageLocation::PagedOut(location),
        }
    }

    /// Collects the status of the page at `virt` from every root.
    ///
    /// Accessed and dirty are reported if any root has them. With
    /// `clear_accessed` the accessed bit is cleared in every root holding the
    /// page resident, and other CPUs are told to drop their translations.
    pub fn page_info(&self, virt: VirtualAddress, clear_accessed: bool) -> Result<PageInfo, MmuError> {
        TableWalker::<M, P>::validate_range(virt, PAGE_SIZE, &RangeOp::Clear)?;

        let walker = self.walker();
        let structural = self.structural.lock();
        let roots = core::iter::once((self.kernel_root, UpdateOptions::empty())).chain(
            structural
                .replicated_roots()
                .map(|root| (root, UpdateOptions::USER_TABLE)),
        );

        let mut combined = 0;
        let mut first_error = None;
        for (root, options) in roots {
            let leaf = walker.walk_to_leaf(root, virt);
            let entry = M::canonical(leaf.entry.unflipped());
            combined |= entry.raw();

            if clear_accessed && entry.is_present() && leaf.level == M::leaf_level() {
                let result = walker.set_mapping(
                    root,
                    virt,
                    Update::Masked {
                        value: 0,
                        mask: EntryFlags::ACCESSED.bits(),
                    },
                    options | UpdateOptions::FLUSH,
                );
                if let Err(error) = result {
                    first_error.get_or_insert(error);
                }
            }
        }
        drop(structural);

        if clear_accessed {
            self.tlb_shootdown();
        }
        if let Some(error) = first_error {
            return Err(error);
        }

        let flags = EntryFlags::from_bits_truncate(combined);
        let mut status = PageStatus::empty();
        if combined == 0 {
            status |= PageStatus::NOT_MAPPED;
        }
        status.set(PageStatus::LOADED, flags.contains(EntryFlags::PRESENT));
        status.set(PageStatus::ACCESSED, flags.contains(EntryFlags::ACCESSED));
        status.set(PageStatus::DIRTY, flags.contains(EntryFlags::DIRTY));

        Ok(PageInfo {
            status,
            location: self.query_location(virt),
        })
    }

    /// Maps `phys` into the scratch slot of the kernel root, read-write and
    /// non-executable, and returns the slot's address.
    ///
    /// The paging subsystem uses the slot to fill or drain a frame that is not
    /// mapped anywhere else.
    pub fn map_scratch(&self, phys: PhysicalAddress) -> Result<VirtualAddress, MmuError> {
        let Some(scratch) = self.config.scratch_page else {
            log::error!("no scratch page configured");
            return Err(MmuError::InvalidArgument);
        };

        let flags = EntryFlags::PRESENT | EntryFlags::for_mapping(MapFlags::WRITE)?;
        self.walker().map_range(
            self.kernel_root,
            scratch,
            PAGE_SIZE,
            RangeOp::Map {
                phys,
                flags,
                mask: u64::MAX,
            },
            UpdateOptions::FLUSH,
        )?;

        Ok(scratch)
    }
}
