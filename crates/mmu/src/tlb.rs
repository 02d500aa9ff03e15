//! TLB coherence across CPUs.
//!
//! Structural changes flush the local CPU page by page as they are written. Other
//! CPUs are then asked to reload their root register, which discards every
//! non-global translation they hold.

use crate::{Mmu, VirtualAddress, arch::Platform, domain::ThreadMmu, paging::PagingMode};

impl<M: PagingMode, P: Platform> Mmu<M, P> {
    /// Invalidates the local translation of one page.
    pub fn flush_page(&self, virt: VirtualAddress) {
        self.platform.flush_page(virt);
    }

    /// Tells every other CPU to drop its translations.
    ///
    /// Does nothing on single-CPU configurations. Does not wait for the other
    /// CPUs to act.
    pub fn tlb_shootdown(&self) {
        if !self.config.smp {
            return;
        }

        log::trace!("broadcasting TLB shootdown");
        self.platform.broadcast_tlb_shootdown();
    }

    /// Handles a shootdown request on the receiving CPU.
    ///
    /// `current` is the thread running on this CPU. With isolation the CPU is
    /// in kernel mode on the kernel root while handling the interrupt, so that
    /// root is reloaded; otherwise the thread's own root is.
    pub fn handle_tlb_ipi(&self, current: &ThreadMmu) {
        let root = if self.config.isolation.is_some() {
            debug_assert_eq!(
                self.platform.active_root(),
                self.kernel_root,
                "shootdown handled outside the kernel root"
            );
            self.kernel_root
        } else {
            self.thread_root(current)
        };

        log::trace!("reloading root {root} after shootdown");
        self.platform.load_root(root);
    }
}
