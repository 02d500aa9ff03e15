//! Boot memory map hooks.
//!
//! The frame database belongs to the physical memory subsystem. This module only
//! tells it which frames the boot map marks as unusable, so that none of them is
//! ever handed to the table pool or mapped as ordinary memory.
//!
//! ```ignore
//! struct MyBootEntry { /* ... */ }
//!
//! impl BootMemoryRegion for MyBootEntry {
//!     fn base(&self) -> PhysicalAddress { /* ... */ }
//!     fn size(&self) -> usize { /* ... */ }
//!     fn is_usable(&self) -> bool { /* ... */ }
//! }
//!
//! let boot_entries: &[MyBootEntry] = /* ... */;
//! mark_reserved_pages(boot_entries, |frame| frames.reserve(frame));
//! ```

use crate::{PAGE_SIZE, PhysicalAddress};

/// Represents a single entry in a boot-time memory map.
///
/// Implement this trait on bootloader-specific memory map entry types.
pub trait BootMemoryRegion {
    /// Returns the base physical address of this region.
    fn base(&self) -> PhysicalAddress;

    /// Returns the size of this region in bytes.
    fn size(&self) -> usize;

    /// Returns whether this region contains usable memory.
    ///
    /// Non-usable memory (reserved, ACPI, device memory, etc.) should
    /// return `false`.
    fn is_usable(&self) -> bool;
}

/// Calls `mark` once for every page touched by a non-usable region.
///
/// Partial pages at either end of a region count as reserved. Returns the number
/// of pages marked; a page covered by two regions is marked twice.
pub fn mark_reserved_pages<R: BootMemoryRegion>(
    regions: &[R],
    mut mark: impl FnMut(PhysicalAddress),
) -> usize {
    let page = PAGE_SIZE as u64;
    let mut marked = 0;

    for region in regions.iter().filter(|region| !region.is_usable() && region.size() != 0) {
        let start = region.base().as_u64() & !(page - 1);
        let end = region
            .base()
            .as_u64()
            .saturating_add(region.size() as u64)
            .saturating_add(page - 1)
            & !(page - 1);

        log::trace!("reserving {start:#x}..{end:#x} from the boot map");

        for frame in (start..end).step_by(PAGE_SIZE) {
            mark(PhysicalAddress::new(frame));
            marked += 1;
        }
    }

    marked
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Test implementation of BootMemoryRegion.
    struct TestRegion {
        base: PhysicalAddress,
        size: usize,
        usable: bool,
    }

    impl TestRegion {
        fn usable(base: u64, size: usize) -> Self {
            Self {
                base: PhysicalAddress::new(base),
                size,
                usable: true,
            }
        }

        fn reserved(base: u64, size: usize) -> Self {
            Self {
                base: PhysicalAddress::new(base),
                size,
                usable: false,
            }
        }
    }

    impl BootMemoryRegion for TestRegion {
        fn base(&self) -> PhysicalAddress {
            self.base
        }

        fn size(&self) -> usize {
            self.size
        }

        fn is_usable(&self) -> bool {
            self.usable
        }
    }

    fn collect(regions: &[TestRegion]) -> Vec<PhysicalAddress> {
        let mut frames = Vec::new();
        let count = mark_reserved_pages(regions, |frame| frames.push(frame));
        assert_eq!(count, frames.len());
        frames
    }

    #[test]
    fn empty_boot_map_marks_nothing() {
        assert!(collect(&[]).is_empty());
    }

    #[test]
    fn usable_regions_are_skipped() {
        let boot_map = [TestRegion::usable(0, PAGE_SIZE * 100)];

        assert!(collect(&boot_map).is_empty());
    }

    #[test]
    fn reserved_regions_are_marked_page_by_page() {
        let boot_map = [
            TestRegion::usable(0, PAGE_SIZE * 100),
            TestRegion::reserved(PAGE_SIZE as u64 * 40, PAGE_SIZE * 3),
        ];

        assert_eq!(
            collect(&boot_map),
            vec![
                PhysicalAddress::new(0x28000),
                PhysicalAddress::new(0x29000),
                PhysicalAddress::new(0x2A000),
            ]
        );
    }

    #[test]
    fn partial_pages_are_reserved_whole() {
        // Covers the tail of one page and the head of the next.
        let boot_map = [TestRegion::reserved(0x9F800, 0x1000)];

        assert_eq!(
            collect(&boot_map),
            vec![PhysicalAddress::new(0x9F000), PhysicalAddress::new(0xA0000)]
        );
    }

    #[test]
    fn empty_reserved_regions_mark_nothing() {
        let boot_map = [TestRegion::reserved(0x1000, 0)];

        assert!(collect(&boot_map).is_empty());
    }
}
