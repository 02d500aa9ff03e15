//! Software emulation for testing and development.
//!
//! Page tables are real x86 tables in every mode; only the memory they live in
//! and the CPU they would be loaded into are emulated:
//! - [`EmulatedMemory`] is a page-aligned host buffer standing in for physical RAM.
//! - [`EmulatedPlatform`] records flushes, root loads and shootdowns instead of
//!   executing privileged instructions.

use alloc::{boxed::Box, vec, vec::Vec};
use core::ptr::NonNull;
use core::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

use crate::{PhysicalAddress, VirtualAddress};

use super::{PAGE_SIZE, Platform};

/// One page of emulated physical memory.
#[derive(Clone, Copy)]
#[repr(C, align(4096))]
struct Frame([u8; PAGE_SIZE]);

/// Emulated physical memory.
///
/// Physical address `n` is byte `n` of the buffer. Frame 0 is never handed out,
/// so a zero physical address never names a live table.
pub struct EmulatedMemory {
    /// Start of the leaked buffer, reclaimed in `Drop`.
    base: NonNull<Frame>,
    /// Number of frames in the buffer.
    frames: usize,
    /// Next frame handed out by the bump allocator.
    next_frame: AtomicUsize,
}

// SAFETY: The buffer is only reached through raw pointers; synchronisation of
// its contents is the job of the page-table code (atomics and locks).
unsafe impl Send for EmulatedMemory {}
// SAFETY: See above.
unsafe impl Sync for EmulatedMemory {}

impl EmulatedMemory {
    /// Creates `frames` pages of zeroed emulated memory.
    pub fn new(frames: usize) -> Self {
        assert!(frames > 0, "emulated memory needs at least one frame");
        let buffer: Box<[Frame]> = vec![Frame([0; PAGE_SIZE]); frames].into_boxed_slice();
        let base = NonNull::from(Box::leak(buffer)).cast::<Frame>();
        Self {
            base,
            frames,
            next_frame: AtomicUsize::new(1),
        }
    }

    /// Hands out `count` contiguous, zeroed frames.
    ///
    /// Returns the physical address of the first frame, or `None` when the
    /// buffer is exhausted.
    pub fn allocate_frames(&self, count: usize) -> Option<PhysicalAddress> {
        loop {
            let current = self.next_frame.load(Ordering::Relaxed);
            let end = current.checked_add(count)?;
            if end > self.frames {
                return None;
            }

            if self
                .next_frame
                .compare_exchange(current, end, Ordering::Relaxed, Ordering::Relaxed)
                .is_ok()
            {
                return Some(PhysicalAddress::new((current * PAGE_SIZE) as u64));
            }
        }
    }

    /// Translates a physical address to a pointer into the buffer.
    pub fn translate(&self, phys: PhysicalAddress) -> *mut u8 {
        let offset = phys.as_u64() as usize;
        assert!(offset < self.size(), "physical address {phys} out of bounds");
        // SAFETY: The offset was checked against the buffer size.
        unsafe { (self.base.as_ptr() as *mut u8).add(offset) }
    }

    /// Translates a pointer into the buffer back to a physical address.
    pub fn ptr_to_phys(&self, ptr: *const u8) -> PhysicalAddress {
        let base = self.base.as_ptr() as usize;
        let addr = ptr as usize;
        assert!(
            addr >= base && addr < base + self.size(),
            "pointer not within emulated memory"
        );
        PhysicalAddress::new((addr - base) as u64)
    }

    /// Returns the size of the emulated memory in bytes.
    pub fn size(&self) -> usize {
        self.frames * PAGE_SIZE
    }
}

impl Drop for EmulatedMemory {
    fn drop(&mut self) {
        let slice = core::ptr::slice_from_raw_parts_mut(self.base.as_ptr(), self.frames);
        // SAFETY: `base` came from `Box::leak` on a slice of `frames` frames.
        drop(unsafe { Box::from_raw(slice) });
    }
}

/// A [`Platform`] that records what the hardware would have been asked to do.
pub struct EmulatedPlatform {
    active_root: AtomicU64,
    flushed_pages: spin::Mutex<Vec<VirtualAddress>>,
    root_loads: AtomicUsize,
    shootdowns: AtomicUsize,
    barriers: AtomicUsize,
}

impl EmulatedPlatform {
    /// Creates a platform whose CPU starts out running on `root`.
    pub fn new(root: PhysicalAddress) -> Self {
        Self {
            active_root: AtomicU64::new(root.as_u64()),
            flushed_pages: spin::Mutex::new(Vec::new()),
            root_loads: AtomicUsize::new(0),
            shootdowns: AtomicUsize::new(0),
            barriers: AtomicUsize::new(0),
        }
    }

    /// Returns every page flushed so far, in order.
    pub fn flushed_pages(&self) -> Vec<VirtualAddress> {
        self.flushed_pages.lock().clone()
    }

    /// Returns how many times a root was loaded.
    pub fn root_loads(&self) -> usize {
        self.root_loads.load(Ordering::Acquire)
    }

    /// Returns how many shootdowns were broadcast.
    pub fn shootdowns(&self) -> usize {
        self.shootdowns.load(Ordering::Acquire)
    }

    /// Returns how many speculation barriers were executed.
    pub fn barriers(&self) -> usize {
        self.barriers.load(Ordering::Acquire)
    }

    /// Forgets all recorded events.
    pub fn clear_events(&self) {
        self.flushed_pages.lock().clear();
        self.root_loads.store(0, Ordering::Release);
        self.shootdowns.store(0, Ordering::Release);
        self.barriers.store(0, Ordering::Release);
    }
}

impl Platform for EmulatedPlatform {
    fn flush_page(&self, virt: VirtualAddress) {
        self.flushed_pages.lock().push(virt);
    }

    fn load_root(&self, root: PhysicalAddress) {
        self.active_root.store(root.as_u64(), Ordering::Release);
        self.root_loads.fetch_add(1, Ordering::AcqRel);
    }

    fn active_root(&self) -> PhysicalAddress {
        PhysicalAddress::new(self.active_root.load(Ordering::Acquire))
    }

    fn broadcast_tlb_shootdown(&self) {
        self.shootdowns.fetch_add(1, Ordering::AcqRel);
    }

    fn speculation_barrier(&self) {
        self.barriers.fetch_add(1, Ordering::AcqRel);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn allocates_disjoint_frames() {
        let memory = EmulatedMemory::new(8);

        let first = memory.allocate_frames(2).unwrap();
        let second = memory.allocate_frames(1).unwrap();

        assert_eq!(first, PhysicalAddress::new(PAGE_SIZE as u64));
        assert_eq!(second, PhysicalAddress::new(3 * PAGE_SIZE as u64));
    }

    #[test]
    fn runs_out_of_frames() {
        let memory = EmulatedMemory::new(4);

        assert!(memory.allocate_frames(3).is_some());
        assert_eq!(memory.allocate_frames(1), None);
    }

    #[test]
    fn frames_are_page_aligned() {
        let memory = EmulatedMemory::new(4);
        let phys = memory.allocate_frames(1).unwrap();

        assert_eq!(memory.translate(phys) as usize % PAGE_SIZE, 0);
    }

    #[test]
    fn platform_records_events() {
        let platform = EmulatedPlatform::new(PhysicalAddress::new(0x1000));

        platform.flush_page(VirtualAddress::new(0x4000));
        platform.load_root(PhysicalAddress::new(0x2000));
        platform.broadcast_tlb_shootdown();

        assert_eq!(platform.flushed_pages(), vec![VirtualAddress::new(0x4000)]);
        assert_eq!(platform.active_root(), PhysicalAddress::new(0x2000));
        assert_eq!(platform.root_loads(), 1);
        assert_eq!(platform.shootdowns(), 1);

        platform.clear_events();
        assert!(platform.flushed_pages().is_empty());
    }
}
