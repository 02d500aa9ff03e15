//! Address types and physical/virtual translation.
//!
//! Page tables link to each other by physical address, so every walk needs a way
//! to turn a physical address back into something the CPU can dereference. The
//! [`AddressTranslator`] provides that, either through the kernel's direct map
//! or through an emulated memory buffer when running on a host.

use core::fmt;
use core::ops::Add;

#[cfg(any(test, feature = "software-emulation"))]
use crate::arch::EmulatedMemory;

/// Translates between physical addresses and kernel-virtual addresses.
///
/// - `DirectMap`: all RAM is mapped at a fixed offset (zero for identity-mapped 32-bit kernels).
/// - `Emulated`: physical memory is a host buffer (testing mode).
pub enum AddressTranslator {
    /// Physical memory is visible at `offset` in the kernel's address space.
    DirectMap { offset: usize },
    /// Physical memory is emulated by a host buffer.
    #[cfg(any(test, feature = "software-emulation"))]
    Emulated(EmulatedMemory),
}

impl AddressTranslator {
    /// Creates a translator for a kernel with a direct map at `offset`.
    pub const fn direct_map(offset: usize) -> Self {
        Self::DirectMap { offset }
    }

    /// Creates a translator backed by `frames` pages of emulated physical memory.
    #[cfg(any(test, feature = "software-emulation"))]
    pub fn emulated(frames: usize) -> Self {
        Self::Emulated(EmulatedMemory::new(frames))
    }

    /// Returns the emulated memory behind this translator, if any.
    #[cfg(any(test, feature = "software-emulation"))]
    pub fn emulated_memory(&self) -> Option<&EmulatedMemory> {
        match self {
            Self::DirectMap { .. } => None,
            Self::Emulated(memory) => Some(memory),
        }
    }

    /// Translates a physical address to the kernel-virtual address it is visible at.
    pub fn phys_to_virt(&self, phys: PhysicalAddress) -> VirtualAddress {
        match self {
            Self::DirectMap { offset } => {
                VirtualAddress::new((phys.as_u64() as usize).wrapping_add(*offset))
            }
            #[cfg(any(test, feature = "software-emulation"))]
            Self::Emulated(memory) => VirtualAddress::new(memory.translate(phys) as usize),
        }
    }

    /// Translates a kernel-virtual address back to a physical address.
    pub fn virt_to_phys(&self, virt: VirtualAddress) -> PhysicalAddress {
        match self {
            Self::DirectMap { offset } => {
                PhysicalAddress::new(virt.as_usize().wrapping_sub(*offset) as u64)
            }
            #[cfg(any(test, feature = "software-emulation"))]
            Self::Emulated(memory) => memory.ptr_to_phys(virt.as_ptr()),
        }
    }

    /// Translates a physical address to a typed pointer.
    pub fn phys_to_ptr<T>(&self, phys: PhysicalAddress) -> *mut T {
        self.phys_to_virt(phys).as_mut_ptr()
    }

    /// Translates a pointer to a physical address.
    pub fn ptr_to_phys<T>(&self, ptr: *const T) -> PhysicalAddress {
        self.virt_to_phys(VirtualAddress::from_ptr(ptr))
    }
}

/// Generates the shared shape of the two address newtypes.
///
/// Physical addresses are always 64 bits wide so PAE entries can hold frames
/// above 4 GiB on 32-bit kernels; virtual addresses are pointer sized.
macro_rules! impl_address_common {
    ($name:ident, $repr:ty, $doc:expr) => {
        #[doc = $doc]
        #[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
        #[repr(transparent)]
        pub struct $name($repr);

        impl $name {
            /// Creates a new address.
            #[inline]
            pub const fn new(addr: $repr) -> Self {
                Self(addr)
            }

            /// Checks if the address is aligned to the given alignment.
            ///
            /// # Panics
            ///
            /// Panics if `align` is not a power of two.
            #[inline]
            pub const fn is_aligned(self, align: $repr) -> bool {
                assert!(align.is_power_of_two(), "alignment must be a power of two");
                self.0 & (align - 1) == 0
            }

            /// Aligns the address down to the given alignment.
            #[inline]
            pub const fn align_down(self, align: $repr) -> Self {
                assert!(align.is_power_of_two(), "alignment must be a power of two");
                Self(self.0 & !(align - 1))
            }

            /// Aligns the address up to the given alignment, or `None` on overflow.
            #[inline]
            pub const fn checked_align_up(self, align: $repr) -> Option<Self> {
                assert!(align.is_power_of_two(), "alignment must be a power of two");
                match self.0.checked_add(align - 1) {
                    Some(value) => Some(Self(value & !(align - 1))),
                    None => None,
                }
            }

            /// Adds `rhs` bytes, or `None` on overflow.
            #[inline]
            pub const fn checked_add(self, rhs: $repr) -> Option<Self> {
                match self.0.checked_add(rhs) {
                    Some(value) => Some(Self(value)),
                    None => None,
                }
            }
        }

        impl fmt::Debug for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}({:#x})", stringify!($name), self.0)
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{:#x}", self.0)
            }
        }

        impl From<$repr> for $name {
            #[inline]
            fn from(addr: $repr) -> Self {
                Self::new(addr)
            }
        }

        impl Add<$repr> for $name {
            type Output = Self;

            #[inline]
            fn add(self, rhs: $repr) -> Self::Output {
                Self(self.0 + rhs)
            }
        }
    };
}

impl_address_common!(
    PhysicalAddress,
    u64,
    "A physical memory address, as stored in page-table entries."
);
impl_address_common!(VirtualAddress, usize, "A virtual memory address.");

impl PhysicalAddress {
    /// Returns the raw address value.
    #[inline]
    pub const fn as_u64(self) -> u64 {
        self.0
    }
}

impl VirtualAddress {
    /// Creates an address from a pointer.
    #[inline]
    pub fn from_ptr<T>(ptr: *const T) -> Self {
        Self(ptr as usize)
    }

    /// Returns the raw address value.
    #[inline]
    pub const fn as_usize(self) -> usize {
        self.0
    }

    /// Returns the address as a const pointer.
    #[inline]
    pub const fn as_ptr<T>(self) -> *const T {
        self.0 as *const T
    }

    /// Returns the address as a mutable pointer.
    #[inline]
    pub const fn as_mut_ptr<T>(self) -> *mut T {
        self.0 as *mut T
    }
}

impl fmt::Pointer for VirtualAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:p}", self.0 as *const u8)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn direct_map_round_trips() {
        let translator = AddressTranslator::direct_map(0xFFFF_8000_0000_0000);
        let phys = PhysicalAddress::new(0x1234_5000);

        let virt = translator.phys_to_virt(phys);
        assert_eq!(virt.as_usize(), 0xFFFF_8000_1234_5000);
        assert_eq!(translator.virt_to_phys(virt), phys);
    }

    #[test]
    fn emulated_translation_round_trips() {
        let translator = AddressTranslator::emulated(4);
        let phys = PhysicalAddress::new(0x2008);

        let ptr = translator.phys_to_ptr::<u8>(phys);
        assert_eq!(translator.ptr_to_phys(ptr), phys);
    }

    #[test]
    fn alignment_helpers() {
        let virt = VirtualAddress::new(0x1234);
        assert!(!virt.is_aligned(0x1000));
        assert_eq!(virt.align_down(0x1000), VirtualAddress::new(0x1000));
        assert_eq!(virt.checked_align_up(0x1000), Some(VirtualAddress::new(0x2000)));
        assert_eq!(VirtualAddress::new(usize::MAX).checked_align_up(0x1000), None);
        assert_eq!(PhysicalAddress::new(u64::MAX).checked_add(1), None);
    }
}
