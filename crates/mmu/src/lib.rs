#![cfg_attr(not(any(test, feature = "software-emulation")), no_std)]

//! # Polaris MMU
//!
//! The x86 memory-management layer of the Polaris kernel. It provides:
//!
//! - Page tables in 32-bit, PAE and IA-32e paging modes, behind one generic walker.
//! - Lock-free single-entry updates, including the kernel page-table isolation flip.
//! - Protection domains with per-domain or shared roots, kept consistent on every change.
//! - TLB invalidation and cross-CPU shootdowns.
//! - Hooks for demand paging.
//! - Software emulation for testing in non-kernel environments.

extern crate alloc;

mod address;
mod arch;
mod config;
mod demand;
mod domain;
mod error;
mod memmap;
mod mmu;
pub mod paging;
mod pool;
mod tlb;

#[cfg(test)]
mod test_support;

pub use address::{AddressTranslator, PhysicalAddress, VirtualAddress};
pub use arch::{PAGE_SIZE, Platform};
#[cfg(any(test, feature = "software-emulation"))]
pub use arch::{EmulatedMemory, EmulatedPlatform};
#[cfg(any(target_arch = "x86", target_arch = "x86_64"))]
pub use arch::X86Platform;
pub use config::{MmuConfig, RootStrategy};
pub use demand::{PageInfo, PageLocation, PageStatus};
pub use domain::{DomainId, Partition, PartitionAttr, StackRegion, ThreadMmu};
pub use error::{MmuError, StructuralFault};
pub use memmap::{BootMemoryRegion, mark_reserved_pages};
pub use mmu::Mmu;
pub use pool::TablePool;
