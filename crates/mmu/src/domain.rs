//! Protection domains, their partitions and the threads running in them.
//!
//! With [`RootStrategy::PerDomain`] every domain owns a copy of the kernel
//! tables and its partitions are written into that copy once. With
//! [`RootStrategy::Shared`] there is only the kernel root; the partitions of
//! whichever domain the running user thread belongs to are written into it on
//! context switch, and undone when a thread of another domain comes in.

use alloc::vec::Vec;

use bitflags::bitflags;

use crate::{
    MmuError, PAGE_SIZE, PhysicalAddress, RootStrategy, VirtualAddress,
    arch::Platform,
    mmu::{Mmu, Structural},
    paging::{EntryFlags, PagingMode, RangeOp, TableWalker, UpdateOptions},
};

/// Identifies a registered protection domain.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DomainId(usize);

impl DomainId {
    pub(crate) const fn index(self) -> usize {
        self.0
    }
}

bitflags! {
    /// Access a partition grants.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct PartitionAttr: u32 {
        const WRITE = 1 << 0;
        const USER = 1 << 1;
        const EXECUTE = 1 << 2;
    }
}

impl PartitionAttr {
    pub const USER_READ_WRITE: Self = Self::USER.union(Self::WRITE);
    pub const USER_READ_ONLY: Self = Self::USER;
    pub const USER_READ_EXECUTE: Self = Self::USER.union(Self::EXECUTE);
    pub const KERNEL_READ_ONLY: Self = Self::empty();

    /// Live permission bits this attribute stands for.
    pub const fn entry_flags(self) -> EntryFlags {
        let mut flags = EntryFlags::empty();
        if self.contains(Self::WRITE) {
            flags = flags.union(EntryFlags::WRITABLE);
        }
        if self.contains(Self::USER) {
            flags = flags.union(EntryFlags::USER);
        }
        if !self.contains(Self::EXECUTE) {
            flags = flags.union(EntryFlags::NO_EXECUTE);
        }
        flags
    }

    /// The range operation that applies this attribute. Presence is asserted,
    /// origins are left alone.
    fn range_op(self) -> RangeOp {
        RangeOp::protect(
            self.entry_flags().union(EntryFlags::PRESENT),
            EntryFlags::PERMISSIONS.union(EntryFlags::PRESENT),
        )
    }
}

/// A range of virtual memory and the access a domain has to it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Partition {
    pub start: VirtualAddress,
    pub size: usize,
    pub attr: PartitionAttr,
}

impl Partition {
    pub const fn new(start: VirtualAddress, size: usize, attr: PartitionAttr) -> Self {
        Self { start, size, attr }
    }

    fn end(&self) -> usize {
        self.start.as_usize() + self.size
    }

    fn overlaps(&self, other: &Partition) -> bool {
        self.start.as_usize() < other.end() && other.start.as_usize() < self.end()
    }

    fn validate(&self) -> Result<(), MmuError> {
        let valid = self.start.is_aligned(PAGE_SIZE)
            && self.size != 0
            && self.size % PAGE_SIZE == 0
            && self.start.checked_add(self.size).is_some();

        if valid {
            Ok(())
        } else {
            log::error!("invalid partition {self:?}");
            Err(MmuError::InvalidArgument)
        }
    }
}

/// A registered protection domain.
#[derive(Debug)]
pub(crate) struct ProtectionDomain {
    root: PhysicalAddress,
    /// Whether `root` is a private copy that structural changes must reach.
    private_root: bool,
    partitions: Vec<Partition>,
}

impl ProtectionDomain {
    pub(crate) fn replicated_root(&self) -> Option<PhysicalAddress> {
        self.private_root.then_some(self.root)
    }
}

/// The user stack of a thread.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StackRegion {
    pub start: VirtualAddress,
    pub size: usize,
}

impl StackRegion {
    pub const fn new(start: VirtualAddress, size: usize) -> Self {
        Self { start, size }
    }
}

/// MMU state the scheduler keeps for each thread.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ThreadMmu {
    user: bool,
    stack: StackRegion,
    domain: Option<DomainId>,
    root: Option<PhysicalAddress>,
}

impl ThreadMmu {
    /// A thread that has not joined a domain yet.
    pub const fn new(user: bool, stack: StackRegion) -> Self {
        Self {
            user,
            stack,
            domain: None,
            root: None,
        }
    }

    pub const fn is_user(&self) -> bool {
        self.user
    }

    pub const fn stack(&self) -> StackRegion {
        self.stack
    }

    pub const fn domain(&self) -> Option<DomainId> {
        self.domain
    }

    /// The private root the thread runs under, if it has one.
    pub const fn root(&self) -> Option<PhysicalAddress> {
        self.root
    }
}

impl<M: PagingMode, P: Platform> Mmu<M, P> {
    /// Registers a new domain.
    ///
    /// With per-domain roots the kernel tables are copied into pages from the
    /// pool. If the pool runs dry the domain is not registered.
    pub fn domain_init(&self) -> Result<DomainId, MmuError> {
        let mut structural = self.structural.lock();

        let (root, private_root) = match self.config.root_strategy {
            RootStrategy::Shared => (self.kernel_root, false),
            RootStrategy::PerDomain => {
                let root = structural.pool.allocate(&self.translator)?;
                self.walker()
                    .copy_tables(root, self.kernel_root, &mut structural.pool)?;
                (root, true)
            }
        };

        Ok(Self::register(&mut structural, root, private_root))
    }

    /// Registers the domain threads start out in.
    ///
    /// Without isolation a private copy would be identical to the kernel
    /// tables, so the default domain runs on the kernel root itself.
    pub fn default_domain_init(&self) -> Result<DomainId, MmuError> {
        if self.config.root_strategy == RootStrategy::PerDomain && self.config.isolation.is_none() {
            let mut structural = self.structural.lock();
            return Ok(Self::register(&mut structural, self.kernel_root, false));
        }

        self.domain_init()
    }

    fn register(structural: &mut Structural, root: PhysicalAddress, private_root: bool) -> DomainId {
        let id = DomainId(structural.domains.len());
        structural.domains.push(ProtectionDomain {
            root,
            private_root,
            partitions: Vec::new(),
        });
        log::debug!("registered domain {id:?} with root {root}");
        id
    }

    /// Returns the root the threads of a domain run under.
    pub fn domain_root(&self, id: DomainId) -> Option<PhysicalAddress> {
        self.structural.lock().domain(id).ok().map(|domain| domain.root)
    }

    /// Returns the partitions of a domain.
    pub fn domain_partitions(&self, id: DomainId) -> Option<Vec<Partition>> {
        self.structural
            .lock()
            .domain(id)
            .ok()
            .map(|domain| domain.partitions.clone())
    }

    /// Adds a partition to a domain and applies it.
    ///
    /// The partition is only recorded when every page was updated. Otherwise the
    /// pages it reached are reset to the permissions they were mapped with.
    pub fn domain_add_partition(&self, id: DomainId, partition: Partition) -> Result<(), MmuError> {
        partition.validate()?;

        let common = self.shared_root().then(|| self.common.lock());
        let mut structural = self.structural.lock();
        let domain = structural.domain(id)?;

        if domain.partitions.len() >= self.config.max_partitions {
            log::error!("domain {id:?} already has {} partitions", domain.partitions.len());
            return Err(MmuError::InvalidArgument);
        }
        if let Some(existing) = domain.partitions.iter().find(|p| p.overlaps(&partition)) {
            log::error!("partition {partition:?} overlaps {existing:?}");
            return Err(MmuError::InvalidArgument);
        }

        let root = match &common {
            Some(cache) => (cache.domain == Some(id)).then_some(self.kernel_root),
            None => Some(domain.root),
        };
        let result = match root {
            Some(root) => self.grant(root, partition.start, partition.size, partition.attr),
            None => Ok(()),
        };
        if result.is_ok() {
            structural.domain_mut(id)?.partitions.push(partition);
            log::debug!("domain {id:?}: added {partition:?}");
        }
        drop(structural);
        drop(common);

        self.tlb_shootdown();
        result
    }

    /// Removes the partition starting at `start` with `size` bytes from a domain,
    /// returning its pages to the permissions they were mapped with.
    ///
    /// If a page cannot be reset the partition stays recorded, so the removal
    /// can be retried.
    pub fn domain_remove_partition(
        &self,
        id: DomainId,
        start: VirtualAddress,
        size: usize,
    ) -> Result<(), MmuError> {
        let common = self.shared_root().then(|| self.common.lock());
        let mut structural = self.structural.lock();
        let domain = structural.domain(id)?;

        let Some(index) = domain
            .partitions
            .iter()
            .position(|p| p.start == start && p.size == size)
        else {
            log::error!("domain {id:?} has no partition at {start:?} + {size:#x}");
            return Err(MmuError::InvalidArgument);
        };

        let root = match &common {
            Some(cache) => (cache.domain == Some(id)).then_some(self.kernel_root),
            None => Some(domain.root),
        };
        let result = match root {
            Some(root) => self.walker().map_range(
                root,
                start,
                size,
                RangeOp::ResetPermissions,
                self.partition_options(),
            ),
            None => Ok(()),
        };
        if result.is_ok() {
            let partition = structural.domain_mut(id)?.partitions.remove(index);
            log::debug!("domain {id:?}: removed {partition:?}");
        }
        drop(structural);
        drop(common);

        self.tlb_shootdown();
        result
    }

    /// Applies `attr` to a range of `root`. On failure the range is reset, so
    /// no page is left with a grant nobody recorded.
    fn grant(
        &self,
        root: PhysicalAddress,
        start: VirtualAddress,
        size: usize,
        attr: PartitionAttr,
    ) -> Result<(), MmuError> {
        let walker = self.walker();
        let options = self.partition_options();

        let Err(error) = walker.map_range(root, start, size, attr.range_op(), options) else {
            return Ok(());
        };
        log::error!("granting {attr:?} on {start:?} + {size:#x} failed: {error}");
        if let Err(undo) = walker.map_range(root, start, size, RangeOp::ResetPermissions, options) {
            // The pages that failed the grant fail the reset too.
            log::debug!("reset of {start:?} + {size:#x} incomplete: {undo}");
        }
        Err(error)
    }

    /// Moves `thread` into a domain.
    ///
    /// A user thread migrating from another domain loses access to its stack in
    /// the old root before it is granted in the new one. `current` tells whether
    /// `thread` is running on this CPU, in which case its new root is loaded.
    pub fn thread_join_domain(
        &self,
        thread: &mut ThreadMmu,
        id: DomainId,
        current: bool,
    ) -> Result<(), MmuError> {
        if self.shared_root() {
            self.structural.lock().domain(id)?;
            thread.domain = Some(id);
            log::debug!("thread joined domain {id:?}");
            if current {
                self.switch_to(thread);
            }
            return Ok(());
        }

        let structural = self.structural.lock();
        let root = structural.domain(id)?.root;

        if thread.user {
            let stack = thread.stack;
            if let Some(old_root) = thread.root {
                self.walker().map_range(
                    old_root,
                    stack.start,
                    stack.size,
                    RangeOp::ResetPermissions,
                    self.partition_options(),
                )?;
            }
            if let Err(error) = self.grant(root, stack.start, stack.size, PartitionAttr::USER_READ_WRITE) {
                // Stay in the old domain, with the stack granted there again.
                if let Some(old_root) = thread.root {
                    Self::log_failure(self.grant(old_root, stack.start, stack.size, PartitionAttr::USER_READ_WRITE));
                }
                return Err(error);
            }
        }
        drop(structural);

        thread.domain = Some(id);
        thread.root = Some(root);

        log::debug!("thread joined domain {id:?}, root {root}");
        if current {
            self.switch_to(thread);
        }
        Ok(())
    }

    /// Takes `thread` out of its domain, back onto the kernel root.
    pub fn thread_leave_domain(&self, thread: &mut ThreadMmu) -> Result<(), MmuError> {
        let Some(id) = thread.domain.take() else {
            return Ok(());
        };

        let mut result = Ok(());
        if let Some(old_root) = thread.root.take() {
            if thread.user {
                let _structural = self.structural.lock();
                result = self.walker().map_range(
                    old_root,
                    thread.stack.start,
                    thread.stack.size,
                    RangeOp::ResetPermissions,
                    self.partition_options(),
                );
            }
        }

        log::debug!("thread left domain {id:?}");
        result
    }

    /// Context-switch hook, called with the thread about to run.
    pub fn switch_to(&self, incoming: &ThreadMmu) {
        match self.config.root_strategy {
            RootStrategy::Shared => self.refresh_shared_root(incoming),
            // With isolation the kernel always runs on its own root and the
            // return-to-user path switches to the thread's root.
            RootStrategy::PerDomain if self.config.isolation.is_some() => {}
            RootStrategy::PerDomain => {
                let root = self.thread_root(incoming);
                if self.platform.active_root() != root {
                    self.platform.load_root(root);
                }
            }
        }
    }

    /// Brings the shared root in line with `incoming`'s domain and stack.
    fn refresh_shared_root(&self, incoming: &ThreadMmu) {
        if !incoming.user {
            return;
        }

        let mut common = self.common.lock();
        let structural = self.structural.lock();
        let walker = self.walker();
        let mut changed = false;

        if common.domain != incoming.domain {
            if let Some(old) = common.domain.and_then(|id| structural.domain(id).ok()) {
                for partition in &old.partitions {
                    Self::log_failure(self.apply_partition(&walker, partition.start, partition.size, RangeOp::ResetPermissions));
                }
            }
            if let Some(new) = incoming.domain.and_then(|id| structural.domain(id).ok()) {
                for partition in &new.partitions {
                    Self::log_failure(self.apply_partition(&walker, partition.start, partition.size, partition.attr.range_op()));
                }
            }
            common.domain = incoming.domain;
            changed = true;
        }

        if common.stack != Some(incoming.stack) {
            if let Some(old) = common.stack {
                Self::log_failure(self.apply_partition(&walker, old.start, old.size, RangeOp::ResetPermissions));
            }
            Self::log_failure(self.apply_partition(
                &walker,
                incoming.stack.start,
                incoming.stack.size,
                PartitionAttr::USER_READ_WRITE.range_op(),
            ));
            common.stack = Some(incoming.stack);
            changed = true;
        }

        drop(structural);
        drop(common);

        // Reloading the root also discards the stale translations.
        if changed {
            log::trace!("shared root refreshed for domain {:?}", incoming.domain);
            self.platform.load_root(self.kernel_root);
        }
    }

    fn apply_partition(
        &self,
        walker: &TableWalker<'_, M, P>,
        start: VirtualAddress,
        size: usize,
        op: RangeOp,
    ) -> Result<(), MmuError> {
        walker.map_range(self.kernel_root, start, size, op, UpdateOptions::empty())
    }

    fn log_failure(result: Result<(), MmuError>) {
        if let Err(error) = result {
            log::error!("permission update failed: {error}");
        }
    }

    fn shared_root(&self) -> bool {
        self.config.root_strategy == RootStrategy::Shared
    }

    /// Options for writing permissions into a domain's root.
    fn partition_options(&self) -> UpdateOptions {
        if self.shared_root() {
            UpdateOptions::FLUSH
        } else {
            UpdateOptions::FLUSH | UpdateOptions::USER_TABLE
        }
    }
}
