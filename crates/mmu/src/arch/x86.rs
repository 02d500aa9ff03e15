//! 32-bit x86 hardware hooks.
//!
//! The `x86_64` crate does not build for 32-bit targets, so the handful of
//! privileged instructions needed here are issued directly.

use core::arch::asm;

use crate::{PhysicalAddress, VirtualAddress};

use super::Platform;

/// Interrupt enable flag in EFLAGS.
#[cfg(not(target_has_atomic = "64"))]
const EFLAGS_IF: u32 = 1 << 9;

/// The 32-bit x86 implementation of [`Platform`].
pub struct X86Platform {
    send_shootdown_ipi: fn(),
}

impl X86Platform {
    /// Creates the platform hooks, using `send_shootdown_ipi` to interrupt all other CPUs.
    pub const fn new(send_shootdown_ipi: fn()) -> Self {
        Self { send_shootdown_ipi }
    }
}

impl Platform for X86Platform {
    fn flush_page(&self, virt: VirtualAddress) {
        // SAFETY: invlpg only drops a cached translation.
        unsafe {
            asm!("invlpg [{0}]", in(reg) virt.as_usize(), options(nostack, preserves_flags));
        }
    }

    fn load_root(&self, root: PhysicalAddress) {
        // Both the PD and the PAE PDPT must live below 4 GiB.
        debug_assert!(root.as_u64() <= u32::MAX as u64, "root table above 4 GiB");
        // SAFETY: Roots handed to the platform are complete copies of the kernel's
        // tables, so the kernel stays mapped across the switch.
        unsafe {
            asm!("mov cr3, {0}", in(reg) root.as_u64() as u32, options(nostack, preserves_flags));
        }
    }

    fn active_root(&self) -> PhysicalAddress {
        let cr3: u32;
        // SAFETY: Reading CR3 has no side effects.
        unsafe {
            asm!("mov {0}, cr3", out(reg) cr3, options(nomem, nostack, preserves_flags));
        }
        PhysicalAddress::new((cr3 & !0x1F) as u64)
    }

    fn broadcast_tlb_shootdown(&self) {
        (self.send_shootdown_ipi)();
    }

    fn speculation_barrier(&self) {
        // SAFETY: lfence has no memory or register side effects.
        unsafe {
            asm!("lfence", options(nostack, preserves_flags));
        }
    }
}

/// Runs `f` with interrupts disabled on this CPU, restoring the previous state afterwards.
#[cfg(not(target_has_atomic = "64"))]
pub(crate) fn without_interrupts<R>(f: impl FnOnce() -> R) -> R {
    let flags: u32;
    // SAFETY: Saving EFLAGS and masking interrupts does not touch memory we own.
    unsafe {
        asm!("pushfd", "pop {0}", "cli", out(reg) flags);
    }
    let result = f();
    if flags & EFLAGS_IF != 0 {
        // SAFETY: Interrupts were enabled on entry.
        unsafe {
            asm!("sti", options(nomem, nostack));
        }
    }
    result
}
