//! The MMU context and the operations that keep every root consistent.
//!
//! Every protection domain with a private root holds a full copy of the kernel
//! tables. A structural change (mapping, unmapping, guard pages) must therefore
//! be written into each of those copies and into the kernel root, under the
//! structural lock so that a domain being created concurrently cannot miss it.

use alloc::vec::Vec;
use core::marker::PhantomData;

use crate::{
    AddressTranslator, MmuConfig, MmuError, PAGE_SIZE, PhysicalAddress, VirtualAddress,
    arch::Platform,
    domain::{DomainId, ProtectionDomain, StackRegion, ThreadMmu},
    paging::{EntryFlags, EntryState, MapFlags, PagingMode, RangeOp, TableWalker, UpdateOptions},
    pool::TablePool,
};

/// State guarded by the structural lock.
pub(crate) struct Structural {
    pub(crate) domains: Vec<ProtectionDomain>,
    pub(crate) pool: TablePool,
}

impl Structural {
    pub(crate) fn domain(&self, id: DomainId) -> Result<&ProtectionDomain, MmuError> {
        self.domains.get(id.index()).ok_or(MmuError::InvalidArgument)
    }

    pub(crate) fn domain_mut(&mut self, id: DomainId) -> Result<&mut ProtectionDomain, MmuError> {
        self.domains.get_mut(id.index()).ok_or(MmuError::InvalidArgument)
    }

    /// Roots that receive every structural change besides the kernel root.
    pub(crate) fn replicated_roots(&self) -> impl Iterator<Item = PhysicalAddress> + '_ {
        self.domains.iter().filter_map(ProtectionDomain::replicated_root)
    }
}

/// What the shared root currently has applied, in the shared-root strategy.
#[derive(Debug, Default)]
pub(crate) struct CommonCache {
    pub(crate) domain: Option<DomainId>,
    pub(crate) stack: Option<StackRegion>,
}

/// The MMU layer of one kernel.
///
/// Owns the configuration, the physical memory translator, the CPU hooks, the
/// kernel root and the registry of protection domains. Constructed once at boot.
pub struct Mmu<M: PagingMode, P: Platform> {
    pub(crate) config: MmuConfig,
    pub(crate) translator: AddressTranslator,
    pub(crate) platform: P,
    pub(crate) kernel_root: PhysicalAddress,
    pub(crate) structural: spin::Mutex<Structural>,
    pub(crate) common: spin::Mutex<CommonCache>,
    _mode: PhantomData<M>,
}

impl<M: PagingMode, P: Platform> Mmu<M, P> {
    /// Takes over the kernel tables at `kernel_root`.
    ///
    /// `pool` supplies the roots and tables of domain copies.
    ///
    /// # Safety
    ///
    /// `kernel_root` must be a complete tree of `M` reachable through
    /// `translator`, with tables for every range that will ever be mapped. The
    /// pool pages must be reachable through `translator` too and unused.
    pub unsafe fn new(
        config: MmuConfig,
        translator: AddressTranslator,
        platform: P,
        kernel_root: PhysicalAddress,
        pool: TablePool,
    ) -> Result<Self, MmuError> {
        config.validate()?;

        log::info!(
            "{} paging, kernel root {kernel_root}, {:?} roots, isolation {}, {} pool pages",
            M::NAME,
            config.root_strategy,
            if config.isolation.is_some() { "on" } else { "off" },
            pool.capacity(),
        );

        Ok(Self {
            config,
            translator,
            platform,
            kernel_root,
            structural: spin::Mutex::new(Structural {
                domains: Vec::new(),
                pool,
            }),
            common: spin::Mutex::new(CommonCache::default()),
            _mode: PhantomData,
        })
    }

    pub const fn config(&self) -> &MmuConfig {
        &self.config
    }

    pub const fn translator(&self) -> &AddressTranslator {
        &self.translator
    }

    pub const fn platform(&self) -> &P {
        &self.platform
    }

    /// Physical address of the kernel's root table.
    pub const fn kernel_root(&self) -> PhysicalAddress {
        self.kernel_root
    }

    /// Returns how many pages are left for new domains.
    pub fn pool_remaining(&self) -> usize {
        self.structural.lock().pool.remaining()
    }

    pub(crate) fn walker(&self) -> TableWalker<'_, M, P> {
        // SAFETY: The kernel root is complete (see `new`) and domain roots are
        // copies of it built from the pool.
        unsafe { TableWalker::new(&self.translator, &self.platform, self.config.isolation.as_ref()) }
    }

    /// Applies `op` to a range in every registered root.
    ///
    /// Domain roots are treated as user-facing; the kernel root is updated last.
    /// Failures in one root do not stop the others and the first error is
    /// returned. With [`UpdateOptions::FLUSH`] other CPUs are told to drop their
    /// translations once every root is updated.
    pub fn apply_to_all_roots(
        &self,
        virt: VirtualAddress,
        size: usize,
        op: RangeOp,
        options: UpdateOptions,
    ) -> Result<(), MmuError> {
        if options.contains(UpdateOptions::USER_TABLE) {
            log::error!("USER_TABLE is chosen per root and cannot be requested");
            return Err(MmuError::InvalidArgument);
        }
        TableWalker::<M, P>::validate_range(virt, size, &op)?;

        let walker = self.walker();
        let mut first_error = None;
        {
            let structural = self.structural.lock();
            for root in structural.replicated_roots() {
                let result = walker.map_validated_range(
                    root,
                    virt,
                    size,
                    op,
                    options | UpdateOptions::USER_TABLE,
                );
                if let Err(error) = result {
                    first_error.get_or_insert(error);
                }
            }

            if let Err(error) = walker.map_validated_range(self.kernel_root, virt, size, op, options) {
                first_error.get_or_insert(error);
            }
        }

        if options.contains(UpdateOptions::FLUSH) {
            self.tlb_shootdown();
        }

        first_error.map_or(Ok(()), Err)
    }

    /// Maps `size` bytes at `virt` to `phys` in every root.
    ///
    /// The range must not be mapped already.
    pub fn map_region(
        &self,
        virt: VirtualAddress,
        phys: PhysicalAddress,
        size: usize,
        flags: MapFlags,
    ) -> Result<(), MmuError> {
        let flags = EntryFlags::PRESENT | EntryFlags::for_mapping(flags)?;
        self.apply_to_all_roots(
            virt,
            size,
            RangeOp::Map {
                phys,
                flags,
                mask: u64::MAX,
            },
            UpdateOptions::empty(),
        )
    }

    /// Removes the mappings of `size` bytes at `virt` from every root.
    pub fn unmap_region(&self, virt: VirtualAddress, size: usize) -> Result<(), MmuError> {
        self.apply_to_all_roots(virt, size, RangeOp::Clear, UpdateOptions::FLUSH)
    }

    /// Returns the physical address `virt` translates to in the kernel root.
    pub fn query_mapped_physical(&self, virt: VirtualAddress) -> Option<PhysicalAddress> {
        let leaf = self.walker().walk_to_leaf(self.kernel_root, virt);
        match leaf.state() {
            EntryState::Present(entry) => {
                let offset = virt.as_usize() as u64 & (leaf.layout.entry_scope() - 1);
                Some(entry.physical_address(leaf.layout) + offset)
            }
            _ => None,
        }
    }

    /// Checks that a user thread may access `size` bytes at `addr`.
    ///
    /// Every page must be present and user-accessible in the thread's root, and
    /// writable when `write` is set. A speculation barrier follows the check so
    /// that nothing runs ahead on a failed validation.
    pub fn validate_user_buffer(
        &self,
        thread: &ThreadMmu,
        addr: VirtualAddress,
        size: usize,
        write: bool,
    ) -> bool {
        let valid = self.check_user_buffer(thread, addr, size, write);
        self.platform.speculation_barrier();
        valid
    }

    fn check_user_buffer(&self, thread: &ThreadMmu, addr: VirtualAddress, size: usize, write: bool) -> bool {
        let Some(end) = addr
            .checked_add(size)
            .and_then(|end| end.checked_align_up(PAGE_SIZE))
        else {
            return false;
        };
        let start = addr.align_down(PAGE_SIZE);
        let root = self.thread_root(thread);
        let walker = self.walker();

        let mut required = EntryFlags::USER;
        if write {
            required |= EntryFlags::WRITABLE;
        }

        (start.as_usize()..end.as_usize()).step_by(PAGE_SIZE).all(|page| {
            match walker.walk_to_leaf(root, VirtualAddress::new(page)).state() {
                EntryState::Present(entry) => entry.flags().contains(required),
                _ => false,
            }
        })
    }

    /// Makes the page at `stack_base` a guard page in every root.
    ///
    /// The page stays present but loses write, user and execute permissions,
    /// including their origins. A partition over the page grants access while
    /// it exists, and removing it leaves the page guarded again.
    pub fn set_stack_guard_page(&self, stack_base: VirtualAddress) -> Result<(), MmuError> {
        log::debug!("stack guard page at {stack_base:?}");
        self.apply_to_all_roots(
            stack_base,
            PAGE_SIZE,
            RangeOp::protect(
                EntryFlags::NO_EXECUTE | EntryFlags::NO_EXECUTE_ORIGIN,
                EntryFlags::TRACKED_PERMISSIONS,
            ),
            UpdateOptions::FLUSH,
        )
    }

    /// Returns the root `thread` runs under in user mode.
    pub fn thread_root(&self, thread: &ThreadMmu) -> PhysicalAddress {
        thread.root().unwrap_or(self.kernel_root)
    }
}
