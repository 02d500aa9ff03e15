//! Errors reported by the MMU layer.

use core::fmt;

/// Errors that can occur while manipulating page tables.
///
/// None of these are retried internally.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MmuError {
    /// The caller passed an unaligned address or size, a disallowed option,
    /// flags that overlap the address field, or an unknown domain or partition.
    InvalidArgument,
    /// The tables do not have the shape the operation requires.
    StructuralFault(StructuralFault),
    /// The table pool has no pages left.
    OutOfMemory,
}

/// Why a walk could not reach the leaf level.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StructuralFault {
    /// A large page sits at `level`; this layer never splits one.
    LargePage { level: usize },
    /// The entry at `level` does not link to a next-level table.
    MissingTable { level: usize },
}

impl From<StructuralFault> for MmuError {
    fn from(fault: StructuralFault) -> Self {
        Self::StructuralFault(fault)
    }
}

impl fmt::Display for MmuError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidArgument => write!(f, "invalid argument"),
            Self::StructuralFault(fault) => write!(f, "structural fault: {fault}"),
            Self::OutOfMemory => write!(f, "page table pool exhausted"),
        }
    }
}

impl fmt::Display for StructuralFault {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::LargePage { level } => write!(f, "large page at level {level}"),
            Self::MissingTable { level } => write!(f, "missing table below level {level}"),
        }
    }
}
