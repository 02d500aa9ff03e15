//! Page pool for page-table pages.
//!
//! Domain roots and the intermediate tables of their copies come from a
//! contiguous run of physical pages reserved at boot. Pages are handed out from
//! the top down and never returned.

use crate::{AddressTranslator, MmuError, PAGE_SIZE, PhysicalAddress};

/// A bump allocator over physically contiguous pages.
#[derive(Debug)]
pub struct TablePool {
    base: PhysicalAddress,
    capacity: usize,
    remaining: usize,
}

impl TablePool {
    /// Creates a pool of `pages` pages starting at `base`.
    ///
    /// # Safety
    ///
    /// The pages must be reachable through the translator later passed to
    /// [`TablePool::allocate`] and must not be used for anything else.
    pub unsafe fn new(base: PhysicalAddress, pages: usize) -> Self {
        debug_assert!(base.is_aligned(PAGE_SIZE as u64), "pool base {base} is not page-aligned");
        Self {
            base,
            capacity: pages,
            remaining: pages,
        }
    }

    /// A pool with no pages, for configurations that never copy tables.
    pub const fn empty() -> Self {
        Self {
            base: PhysicalAddress::new(0),
            capacity: 0,
            remaining: 0,
        }
    }

    /// Takes a zeroed page from the pool.
    pub fn allocate(&mut self, translator: &AddressTranslator) -> Result<PhysicalAddress, MmuError> {
        if self.remaining == 0 {
            log::error!("page table pool exhausted ({} pages)", self.capacity);
            return Err(MmuError::OutOfMemory);
        }

        self.remaining -= 1;
        let phys = self.base + (self.remaining * PAGE_SIZE) as u64;

        // SAFETY: The page belongs to the pool (see `new`) and was never handed out before.
        unsafe {
            core::ptr::write_bytes(translator.phys_to_ptr::<u8>(phys), 0, PAGE_SIZE);
        }

        Ok(phys)
    }

    /// Returns how many pages are still available.
    pub const fn remaining(&self) -> usize {
        self.remaining
    }

    /// Returns the total number of pages in the pool.
    pub const fn capacity(&self) -> usize {
        self.capacity
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn setup(pages: usize) -> (AddressTranslator, TablePool) {
        let translator = AddressTranslator::emulated(pages + 1);
        let base = translator
            .emulated_memory()
            .and_then(|memory| memory.allocate_frames(pages))
            .unwrap();
        let pool = unsafe { TablePool::new(base, pages) };
        (translator, pool)
    }

    #[test]
    fn hands_out_pages_top_down() {
        let (translator, mut pool) = setup(3);

        assert_eq!(pool.allocate(&translator), Ok(PhysicalAddress::new(0x3000)));
        assert_eq!(pool.allocate(&translator), Ok(PhysicalAddress::new(0x2000)));
        assert_eq!(pool.remaining(), 1);
        assert_eq!(pool.capacity(), 3);
    }

    #[test]
    fn zeroes_pages() {
        let (translator, mut pool) = setup(1);
        let ptr = translator.phys_to_ptr::<u8>(PhysicalAddress::new(0x1000));
        unsafe { ptr.write_bytes(0xAA, PAGE_SIZE) };

        let phys = pool.allocate(&translator).unwrap();
        let page = unsafe { core::slice::from_raw_parts(translator.phys_to_ptr::<u8>(phys), PAGE_SIZE) };

        assert!(page.iter().all(|&byte| byte == 0));
    }

    #[test]
    fn reports_exhaustion() {
        let (translator, mut pool) = setup(1);

        assert!(pool.allocate(&translator).is_ok());
        assert_eq!(pool.allocate(&translator), Err(MmuError::OutOfMemory));
        assert_eq!(TablePool::empty().allocate(&translator), Err(MmuError::OutOfMemory));
    }
}
