//! Architecture-specific hooks for the MMU layer.
//!
//! Table formats are described by [`crate::paging::PagingMode`]; this module only
//! covers what the layer needs the CPU to do: invalidate translations, switch
//! roots, and tell other CPUs to do the same.

use crate::{PhysicalAddress, VirtualAddress};

// NOTE: Hardware modules are compiled during tests too so that rust-analyzer sees them.
#[cfg(target_arch = "x86_64")]
mod x86_64;
#[cfg(target_arch = "x86_64")]
pub use self::x86_64::X86Platform;

#[cfg(target_arch = "x86")]
mod x86;
#[cfg(target_arch = "x86")]
pub use self::x86::X86Platform;
#[cfg(all(target_arch = "x86", not(target_has_atomic = "64")))]
pub(crate) use self::x86::without_interrupts;

// Software emulation is available to tests and to hosts that opt in.
#[cfg(any(test, feature = "software-emulation"))]
mod software;
#[cfg(any(test, feature = "software-emulation"))]
pub use software::{EmulatedMemory, EmulatedPlatform};

/// Size of the smallest page in every supported paging mode (4 KiB).
pub const PAGE_SIZE: usize = 4096;

/// CPU operations the MMU layer depends on.
///
/// Implementations must be callable from any CPU concurrently.
pub trait Platform: Sync {
    /// Invalidates any cached translation for the page containing `virt` on this CPU.
    fn flush_page(&self, virt: VirtualAddress);

    /// Loads `root` as the active top-level table on this CPU.
    ///
    /// Reloading the register also discards every non-global translation.
    fn load_root(&self, root: PhysicalAddress);

    /// Returns the top-level table currently active on this CPU.
    fn active_root(&self) -> PhysicalAddress;

    /// Asks every other CPU to reload its root register.
    ///
    /// Returns without waiting for the other CPUs to acknowledge.
    fn broadcast_tlb_shootdown(&self);

    /// Prevents speculative execution from running ahead of a preceding check.
    fn speculation_barrier(&self);
}
