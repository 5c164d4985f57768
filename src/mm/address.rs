//! Physical and Virtual Address Types
//!
//! Type-safe wrappers for memory addresses that prevent mixing
//! physical and virtual addresses at compile time.
//!
//! # Security Properties
//! - Physical addresses cannot be dereferenced directly
//! - Virtual addresses require explicit unsafe conversion to pointers
//! - Sv39 canonical form is enforced on construction

use core::fmt;

/// Page size (4 KiB)
pub const PAGE_SIZE: usize = 4096;
/// Page size mask
pub const PAGE_MASK: usize = PAGE_SIZE - 1;
/// Bits to shift for page number
pub const PAGE_SHIFT: usize = 12;

/// Number of entries per page table (512 for the 4KB granule)
pub const ENTRIES_PER_TABLE: usize = 512;

/// Number of virtual-address bits in Sv39
pub const VA_BITS: usize = 39;

/// Maximum physical-address bits (Sv39 PTEs carry a 44-bit PPN)
pub const PA_BITS: usize = 56;

/// Physical RAM base for the QEMU virt machine
pub const RAM_BASE: usize = 0x8000_0000;

/// MMIO window for boot-time devices (UART at its base)
pub const MIO_BASE: usize = 0x1000_0000;
/// End of the MMIO window (exclusive)
pub const MIO_TOP: usize = 0x1001_0000;

/// Span of virtual address space covered by one leaf page table (2 MiB)
pub const SLOT_SPAN: usize = ENTRIES_PER_TABLE * PAGE_SIZE;

/// Lowest address considered by the system-chosen attach search.
/// The range below stays free for non-relocatable segments placed
/// with an explicit address.
pub const APP_LOW: usize = 0x4000_0000;
/// End of the application attach window (exclusive); at and above this
/// the master kernel mappings live.
pub const APP_HIGH: usize = 0x8000_0000;

/// A physical memory address.
///
/// This is a newtype wrapper that prevents accidental mixing of
/// physical and virtual addresses. Physical addresses cannot be
/// directly dereferenced - they must be translated to virtual
/// addresses first.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(transparent)]
pub struct PhysAddr(usize);

impl PhysAddr {
    /// Create a new physical address.
    ///
    /// # Panics
    /// Panics in debug mode if the address uses more than 56 bits.
    #[inline]
    pub const fn new(addr: usize) -> Self {
        debug_assert!(addr < (1 << PA_BITS));
        Self(addr)
    }

    /// Create a physical address without validation (const-compatible).
    #[inline]
    pub const fn new_unchecked(addr: usize) -> Self {
        Self(addr)
    }

    /// Get the raw address value.
    #[inline]
    pub const fn as_usize(self) -> usize {
        self.0
    }

    /// Check if the address is page-aligned.
    #[inline]
    pub const fn is_aligned(self) -> bool {
        self.0 & PAGE_MASK == 0
    }

    /// Align the address down to the nearest page boundary.
    #[inline]
    pub const fn align_down(self) -> Self {
        Self(self.0 & !PAGE_MASK)
    }

    /// Align the address up to the nearest page boundary.
    #[inline]
    pub const fn align_up(self) -> Self {
        Self((self.0 + PAGE_MASK) & !PAGE_MASK)
    }

    /// Get the page frame number.
    #[inline]
    pub const fn page_frame_number(self) -> usize {
        self.0 >> PAGE_SHIFT
    }

    /// Create from a page frame number.
    #[inline]
    pub const fn from_page_frame_number(pfn: usize) -> Self {
        Self(pfn << PAGE_SHIFT)
    }

    /// Add a byte offset to this address.
    #[inline]
    pub const fn add(self, offset: usize) -> Self {
        Self(self.0 + offset)
    }

    /// Add a whole number of frames to this address.
    #[inline]
    pub const fn add_frames(self, frames: usize) -> Self {
        Self(self.0 + frames * PAGE_SIZE)
    }
}

impl fmt::Debug for PhysAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PhysAddr({:#014x})", self.0)
    }
}

impl fmt::Display for PhysAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#014x}", self.0)
    }
}

/// A virtual memory address.
///
/// This is a newtype wrapper that enforces the Sv39 canonical
/// address format (sign-extended from bit 38).
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(transparent)]
pub struct VirtAddr(usize);

impl VirtAddr {
    /// Create a new virtual address in canonical form.
    ///
    /// Sv39 requires that bits [63:39] are all copies of bit 38.
    #[inline]
    pub const fn new(addr: usize) -> Self {
        Self(Self::make_canonical(addr))
    }

    /// Create a virtual address without validation.
    #[inline]
    pub const fn new_unchecked(addr: usize) -> Self {
        Self(addr)
    }

    /// Convert an address to canonical form by sign-extending bit 38.
    #[inline]
    const fn make_canonical(addr: usize) -> usize {
        let sign = (addr >> (VA_BITS - 1)) & 1;
        if sign == 1 {
            addr | !((1 << VA_BITS) - 1)
        } else {
            addr & ((1 << VA_BITS) - 1)
        }
    }

    /// Get the raw address value.
    #[inline]
    pub const fn as_usize(self) -> usize {
        self.0
    }

    /// Check if the address is page-aligned.
    #[inline]
    pub const fn is_aligned(self) -> bool {
        self.0 & PAGE_MASK == 0
    }

    /// Check if the address is aligned to a leaf-table span (2 MiB).
    #[inline]
    pub const fn is_slot_aligned(self) -> bool {
        self.0 & (SLOT_SPAN - 1) == 0
    }

    /// Align the address down to the nearest page boundary.
    #[inline]
    pub const fn align_down(self) -> Self {
        Self::new(self.0 & !PAGE_MASK)
    }

    /// Align the address up to the nearest page boundary.
    #[inline]
    pub const fn align_up(self) -> Self {
        Self::new((self.0 + PAGE_MASK) & !PAGE_MASK)
    }

    /// Get the page offset (lowest 12 bits).
    #[inline]
    pub const fn page_offset(self) -> usize {
        self.0 & PAGE_MASK
    }

    /// Add a byte offset to this address.
    #[inline]
    pub const fn add(self, offset: usize) -> Self {
        Self::new(self.0.wrapping_add(offset))
    }
}

impl fmt::Debug for VirtAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "VirtAddr({:#018x})", self.0)
    }
}

impl fmt::Display for VirtAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#018x}", self.0)
    }
}

/// Convert a physical address to the virtual address the kernel uses
/// to touch it.
///
/// All physical RAM is mapped 1:1 (the master directory identity-maps
/// it during bootstrap), so the translation is the identity. Every
/// reinterpretation of a raw frame goes through this single seam.
#[inline]
pub const fn phys_to_kernel_virt(phys: PhysAddr) -> VirtAddr {
    VirtAddr::new_unchecked(phys.as_usize())
}

/// Convert a kernel virtual address back to its physical address.
///
/// Only valid for addresses inside the 1:1 kernel window.
#[inline]
pub const fn kernel_virt_to_phys(virt: VirtAddr) -> PhysAddr {
    PhysAddr::new_unchecked(virt.as_usize())
}
