//! Lock-free updates of single page-table entries.
//!
//! The hardware sets accessed and dirty bits behind our back and other CPUs may
//! update the same entry concurrently, so every change is a compare-and-swap
//! loop over the raw stored word. The isolation flip is undone before a change
//! is computed and reapplied before it is stored.

use core::sync::atomic::{AtomicU32, Ordering};
#[cfg(target_has_atomic = "64")]
use core::sync::atomic::AtomicU64;

use bitflags::bitflags;

use super::{PageIsolation, PageTableEntry, PagingLevel};

/// Storage type of one page-table entry.
pub trait EntryWord: Copy + Send + Sync + 'static {
    /// Atomic cell with the same layout as `Self`.
    type Cell: Send + Sync;

    fn widen(self) -> u64;

    /// Truncates a widened value. Bits that do not exist in this width are dropped.
    fn narrow(value: u64) -> Self;

    fn new_cell(value: Self) -> Self::Cell;
    fn load(cell: &Self::Cell) -> Self;
    fn store(cell: &Self::Cell, value: Self);
    fn compare_exchange(cell: &Self::Cell, current: Self, new: Self) -> Result<Self, Self>;
}

impl EntryWord for u32 {
    type Cell = AtomicU32;

    fn widen(self) -> u64 {
        self as u64
    }

    fn narrow(value: u64) -> Self {
        value as u32
    }

    fn new_cell(value: Self) -> Self::Cell {
        AtomicU32::new(value)
    }

    fn load(cell: &Self::Cell) -> Self {
        cell.load(Ordering::Acquire)
    }

    fn store(cell: &Self::Cell, value: Self) {
        cell.store(value, Ordering::Release)
    }

    fn compare_exchange(cell: &Self::Cell, current: Self, new: Self) -> Result<Self, Self> {
        cell.compare_exchange(current, new, Ordering::AcqRel, Ordering::Acquire)
    }
}

#[cfg(target_has_atomic = "64")]
impl EntryWord for u64 {
    type Cell = AtomicU64;

    fn widen(self) -> u64 {
        self
    }

    fn narrow(value: u64) -> Self {
        value
    }

    fn new_cell(value: Self) -> Self::Cell {
        AtomicU64::new(value)
    }

    fn load(cell: &Self::Cell) -> Self {
        cell.load(Ordering::Acquire)
    }

    fn store(cell: &Self::Cell, value: Self) {
        cell.store(value, Ordering::Release)
    }

    fn compare_exchange(cell: &Self::Cell, current: Self, new: Self) -> Result<Self, Self> {
        cell.compare_exchange(current, new, Ordering::AcqRel, Ordering::Acquire)
    }
}

/// A 64-bit entry on a CPU without a 64-bit compare-and-swap.
///
/// Each access runs with local interrupts disabled. This only excludes other
/// code on the same CPU and is unsound on a multiprocessor system.
#[cfg(all(target_arch = "x86", not(target_has_atomic = "64")))]
#[repr(transparent)]
pub struct InterruptGuardedU64(core::cell::UnsafeCell<u64>);

// SAFETY: All accesses are made with interrupts disabled on a uniprocessor.
#[cfg(all(target_arch = "x86", not(target_has_atomic = "64")))]
unsafe impl Sync for InterruptGuardedU64 {}

#[cfg(all(target_arch = "x86", not(target_has_atomic = "64")))]
impl EntryWord for u64 {
    type Cell = InterruptGuardedU64;

    fn widen(self) -> u64 {
        self
    }

    fn narrow(value: u64) -> Self {
        value
    }

    fn new_cell(value: Self) -> Self::Cell {
        InterruptGuardedU64(core::cell::UnsafeCell::new(value))
    }

    fn load(cell: &Self::Cell) -> Self {
        // SAFETY: The pointer comes from a live cell; no other code runs here.
        crate::arch::without_interrupts(|| unsafe { cell.0.get().read_volatile() })
    }

    fn store(cell: &Self::Cell, value: Self) {
        // SAFETY: As for `load`.
        crate::arch::without_interrupts(|| unsafe { cell.0.get().write_volatile(value) })
    }

    fn compare_exchange(cell: &Self::Cell, current: Self, new: Self) -> Result<Self, Self> {
        crate::arch::without_interrupts(|| {
            // SAFETY: As for `load`.
            unsafe {
                let value = cell.0.get().read_volatile();
                if value == current {
                    cell.0.get().write_volatile(new);
                    Ok(value)
                } else {
                    Err(value)
                }
            }
        })
    }
}

/// The change to make to an entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Update {
    /// Replace the bits selected by `mask` with those of `value`.
    Masked { value: u64, mask: u64 },
    /// Rebuild the live permissions from their origin shadows.
    ResetPermissions,
    /// Zero the entry.
    Clear,
}

bitflags! {
    /// Options of an entry update.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct UpdateOptions: u32 {
        /// The root is one user threads run under; apply the isolation flip.
        const USER_TABLE = 1 << 0;
        /// Invalidate translations of the changed pages once done.
        const FLUSH = 1 << 1;
    }
}

/// One entry slot in a page table.
#[repr(transparent)]
pub struct EntryCell<W: EntryWord>(W::Cell);

impl<W: EntryWord> EntryCell<W> {
    pub fn new(entry: PageTableEntry) -> Self {
        Self(W::new_cell(W::narrow(entry.raw())))
    }

    /// Returns the raw stored value, which may be flipped.
    pub fn load(&self) -> PageTableEntry {
        PageTableEntry::from_raw(W::load(&self.0).widen())
    }

    /// Overwrites the entry. Only for tables no other CPU can reach yet.
    pub fn store(&self, entry: PageTableEntry) {
        W::store(&self.0, W::narrow(entry.raw()))
    }

    pub fn compare_exchange(
        &self,
        current: PageTableEntry,
        new: PageTableEntry,
    ) -> Result<PageTableEntry, PageTableEntry> {
        W::compare_exchange(&self.0, W::narrow(current.raw()), W::narrow(new.raw()))
            .map(|value| PageTableEntry::from_raw(value.widen()))
            .map_err(|value| PageTableEntry::from_raw(value.widen()))
    }

    /// Atomically applies `update` and returns the previous, unflipped value.
    ///
    /// With `isolation` configured and `user_table` set, the stored result is
    /// flipped when it is a supervisor-only mapping.
    pub fn update(
        &self,
        update: Update,
        user_table: bool,
        isolation: Option<&PageIsolation>,
        level: &PagingLevel,
    ) -> PageTableEntry {
        loop {
            let raw = self.load();
            let previous = Self::canonical(raw.unflipped());

            let mut new = match update {
                Update::Masked { value, mask } => {
                    PageTableEntry::from_raw((previous.raw() & !mask) | (value & mask))
                }
                Update::ResetPermissions => previous.restore_original_permissions(),
                Update::Clear => PageTableEntry::UNMAPPED,
            };
            if let Some(isolation) = isolation {
                new = isolation.hide(new, user_table, level);
            }

            if self.compare_exchange(raw, new).is_ok() {
                return previous;
            }
        }
    }

    /// Drops the bits the stored width cannot hold.
    fn canonical(entry: PageTableEntry) -> PageTableEntry {
        PageTableEntry::from_raw(W::narrow(entry.raw()).widen())
    }
}
