//! Kernel tables and MMU contexts on emulated memory, shared by the unit tests.
//!
//! Every mode gets the same layout, all of it below 4 GiB:
//! - kernel text and data, mapped
//! - the isolation trampoline page, mapped
//! - the scratch slot and a 2 MiB region with tables but no mappings
//! - optionally, one large page

use crate::{
    AddressTranslator, Mmu, MmuConfig, PAGE_SIZE, PhysicalAddress, RootStrategy, VirtualAddress,
    arch::EmulatedPlatform,
    domain::{StackRegion, ThreadMmu},
    paging::{MapFlags, PageIsolation, PagingMode, TableBuilder},
    pool::TablePool,
};

pub(crate) const KERNEL_TEXT: VirtualAddress = VirtualAddress::new(0x0010_0000);
pub(crate) const KERNEL_DATA: VirtualAddress = VirtualAddress::new(0x0020_0000);
pub(crate) const SHARED_PAGE: VirtualAddress = VirtualAddress::new(0x0030_0000);
pub(crate) const SHARED_PHYS: PhysicalAddress = PhysicalAddress::new(0x0030_0000);
pub(crate) const SCRATCH: VirtualAddress = VirtualAddress::new(0x0030_1000);
pub(crate) const RESERVED: VirtualAddress = VirtualAddress::new(0x4000_0000);
pub(crate) const LARGE_PAGE: VirtualAddress = VirtualAddress::new(0x8000_0000);

const KERNEL_PAGES: usize = 16;
pub(crate) const RESERVED_SIZE: usize = 2 << 20;

/// Frames for the boot tables, with room left over for tests that copy them.
const BOOT_POOL_PAGES: usize = 32;
const MMU_POOL_PAGES: usize = 96;
/// Frame 0 is never handed out.
const FRAMES: usize = 1 + BOOT_POOL_PAGES + MMU_POOL_PAGES;

pub(crate) struct KernelTables {
    pub(crate) translator: AddressTranslator,
    pub(crate) root: PhysicalAddress,
    /// What is left of the pool the tables were built from.
    pub(crate) pool: TablePool,
}

pub(crate) fn kernel_tables<M: PagingMode>() -> KernelTables {
    build::<M>(false)
}

/// Kernel tables with a large page at [`LARGE_PAGE`], one level above the leaves.
pub(crate) fn kernel_tables_with_large_page<M: PagingMode>() -> KernelTables {
    build::<M>(true)
}

fn build<M: PagingMode>(large_page: bool) -> KernelTables {
    let translator = AddressTranslator::emulated(FRAMES);
    let mut pool = take_pool(&translator, BOOT_POOL_PAGES);

    let mut builder = TableBuilder::<M>::new(&translator, &mut pool).unwrap();
    builder
        .map(KERNEL_TEXT, PhysicalAddress::new(0x0010_0000), KERNEL_PAGES * PAGE_SIZE, MapFlags::EXECUTE)
        .unwrap();
    builder
        .map(KERNEL_DATA, PhysicalAddress::new(0x0020_0000), KERNEL_PAGES * PAGE_SIZE, MapFlags::WRITE)
        .unwrap();
    builder.map(SHARED_PAGE, SHARED_PHYS, PAGE_SIZE, MapFlags::EXECUTE).unwrap();
    builder.reserve(SCRATCH, PAGE_SIZE).unwrap();
    builder.reserve(RESERVED, RESERVED_SIZE).unwrap();
    if large_page {
        builder
            .map_large_page(LARGE_PAGE, PhysicalAddress::new(0x8000_0000), M::leaf_level() - 1, MapFlags::WRITE)
            .unwrap();
    }
    let root = builder.root();

    KernelTables { translator, root, pool }
}

fn take_pool(translator: &AddressTranslator, pages: usize) -> TablePool {
    let base = translator
        .emulated_memory()
        .and_then(|memory| memory.allocate_frames(pages))
        .unwrap();
    unsafe { TablePool::new(base, pages) }
}

/// An MMU over fresh kernel tables, with the CPU running on the kernel root.
pub(crate) fn setup<M: PagingMode>(config: MmuConfig) -> Mmu<M, EmulatedPlatform> {
    setup_with_pool::<M>(config, MMU_POOL_PAGES)
}

pub(crate) fn setup_with_pool<M: PagingMode>(config: MmuConfig, pages: usize) -> Mmu<M, EmulatedPlatform> {
    let tables = kernel_tables::<M>();
    let pool = take_pool(&tables.translator, pages);
    let platform = EmulatedPlatform::new(tables.root);

    unsafe { Mmu::new(config, tables.translator, platform, tables.root, pool) }.unwrap()
}

pub(crate) fn per_domain() -> MmuConfig {
    MmuConfig::new()
        .with_root_strategy(RootStrategy::PerDomain)
        .with_smp(false)
}

pub(crate) fn isolated() -> MmuConfig {
    per_domain()
        .with_isolation(PageIsolation::new(SHARED_PHYS))
        .with_scratch_page(SCRATCH)
}

pub(crate) fn shared() -> MmuConfig {
    MmuConfig::new()
        .with_root_strategy(RootStrategy::Shared)
        .with_smp(false)
}

/// A user thread whose stack is in kernel data.
pub(crate) fn user_thread() -> ThreadMmu {
    ThreadMmu::new(true, StackRegion::new(KERNEL_DATA + 8 * PAGE_SIZE, 2 * PAGE_SIZE))
}

/// A user thread with a different stack than [`user_thread`].
pub(crate) fn other_user_thread() -> ThreadMmu {
    ThreadMmu::new(true, StackRegion::new(KERNEL_DATA + 12 * PAGE_SIZE, 2 * PAGE_SIZE))
}

pub(crate) fn supervisor_thread() -> ThreadMmu {
    ThreadMmu::new(false, StackRegion::new(KERNEL_DATA + 4 * PAGE_SIZE, PAGE_SIZE))
}
