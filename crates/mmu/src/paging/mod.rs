//! Page-table formats and the primitives that read and write them.
//!
//! This module provides:
//! - [`mode`]: the shape of the table tree in each paging mode
//! - [`entry`]: entry bits, permission origins and the isolation flip
//! - [`atomic`]: compare-and-swap updates of single entries
//! - [`table`]: walking a tree and applying changes to page ranges
//! - [`builder`]: constructing the kernel's initial tables

pub mod atomic;
pub mod builder;
pub mod entry;
pub mod mode;
pub mod table;

pub use atomic::{EntryCell, EntryWord, Update, UpdateOptions};
pub use builder::TableBuilder;
pub use entry::{EntryFlags, EntryState, MapFlags, PageIsolation, PageTableEntry};
pub use mode::{Ia32, Ia32e, NativeMode, Pae, PagingLevel, PagingMode};
pub use table::{LeafEntry, PageTable, RangeOp, TableWalker};
