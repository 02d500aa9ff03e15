//! x86_64 hardware hooks.

use x86_64::{
    PhysAddr, VirtAddr,
    instructions::tlb,
    registers::control::{Cr3, Cr3Flags},
    structures::paging::PhysFrame,
};

use crate::{PhysicalAddress, VirtualAddress};

use super::Platform;

/// The x86_64 implementation of [`Platform`].
///
/// Delivering the shootdown IPI needs the local APIC, which the interrupt
/// controller driver owns, so it is supplied as a hook.
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
        tlb::flush(VirtAddr::new_truncate(virt.as_usize() as u64));
    }

    fn load_root(&self, root: PhysicalAddress) {
        let frame = PhysFrame::containing_address(PhysAddr::new(root.as_u64()));
        // SAFETY: Roots handed to the platform are complete copies of the kernel's
        // tables, so the kernel stays mapped across the switch.
        unsafe {
            Cr3::write(frame, Cr3Flags::empty());
        }
    }

    fn active_root(&self) -> PhysicalAddress {
        let (frame, _) = Cr3::read();
        PhysicalAddress::new(frame.start_address().as_u64())
    }

    fn broadcast_tlb_shootdown(&self) {
        (self.send_shootdown_ipi)();
    }

    fn speculation_barrier(&self) {
        // SAFETY: lfence has no memory or register side effects.
        unsafe {
            core::arch::asm!("lfence", options(nostack, preserves_flags));
        }
    }
}
