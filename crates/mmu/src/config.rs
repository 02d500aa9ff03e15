//! Build and boot configuration of the MMU layer.
//!
//! Defaults follow the crate's Cargo features so a kernel can select its
//! configuration at build time; the boot code fills in the addresses only it
//! knows (shared isolation page, scratch slot).

use crate::{MmuError, PAGE_SIZE, VirtualAddress, paging::PageIsolation};

/// How protection domains get their page tables.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RootStrategy {
    /// Every domain owns a copy of the kernel tables; structural changes are
    /// replicated into each copy.
    PerDomain,
    /// A single shared root; the active domain's partitions are written into it
    /// on context switch.
    Shared,
}

/// Configuration of an [`crate::Mmu`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MmuConfig {
    /// How domains get their page tables.
    pub root_strategy: RootStrategy,
    /// Kernel page-table isolation, if enabled.
    pub isolation: Option<PageIsolation>,
    /// Whether other CPUs must be told about structural changes.
    pub smp: bool,
    /// Maximum number of partitions per domain.
    pub max_partitions: usize,
    /// Virtual slot reserved for [`crate::Mmu::map_scratch`].
    pub scratch_page: Option<VirtualAddress>,
}

impl MmuConfig {
    /// Default partition limit per domain.
    pub const DEFAULT_MAX_PARTITIONS: usize = 16;

    /// Creates the configuration selected by the crate features.
    pub const fn new() -> Self {
        Self {
            root_strategy: if cfg!(feature = "common-page-table") {
                RootStrategy::Shared
            } else {
                RootStrategy::PerDomain
            },
            isolation: None,
            smp: cfg!(feature = "smp"),
            max_partitions: Self::DEFAULT_MAX_PARTITIONS,
            scratch_page: None,
        }
    }

    pub const fn with_root_strategy(mut self, root_strategy: RootStrategy) -> Self {
        self.root_strategy = root_strategy;
        self
    }

    pub const fn with_isolation(mut self, isolation: PageIsolation) -> Self {
        self.isolation = Some(isolation);
        self
    }

    pub const fn with_smp(mut self, smp: bool) -> Self {
        self.smp = smp;
        self
    }

    pub const fn with_max_partitions(mut self, max_partitions: usize) -> Self {
        self.max_partitions = max_partitions;
        self
    }

    pub const fn with_scratch_page(mut self, scratch_page: VirtualAddress) -> Self {
        self.scratch_page = Some(scratch_page);
        self
    }

    /// Rejects combinations the layer cannot honour.
    ///
    /// A shared root cannot be isolated (there is no separate user root to hide
    /// kernel pages in) and cannot serve several CPUs running different domains.
    pub fn validate(&self) -> Result<(), MmuError> {
        if self.root_strategy == RootStrategy::Shared && (self.isolation.is_some() || self.smp) {
            log::error!("shared root is incompatible with isolation and SMP");
            return Err(MmuError::InvalidArgument);
        }

        if let Some(scratch) = self.scratch_page {
            if !scratch.is_aligned(PAGE_SIZE) {
                log::error!("scratch page {scratch:?} is not page-aligned");
                return Err(MmuError::InvalidArgument);
            }
        }

        Ok(())
    }
}

impl Default for MmuConfig {
    fn default() -> Self {
        Self::new()
    }
}
