//! Sv39 Page Table Management
//!
//! Implements the hardware page-table format for RISC-V Sv39 and the
//! page-table/page-directory primitives built on it.
//!
//! # Page Table Structure (4KB granule)
//! - Level 0 (root directory): 512 entries, each covers 1GB
//! - Level 1 (directory): 512 entries, each covers 2MB
//! - Level 2 (leaf table): 512 entries, each covers 4KB
//!
//! The same array type serves at every level; only the interpretation of
//! the entries differs (non-leaf entries point to the next table inward,
//! leaf entries map a frame).
//!
//! # Security Properties
//! - The PTE bit layout lives behind a single [`PteFormat`] impl; no
//!   walker hard-codes shift amounts
//! - The flag mask and the frame-number field never overlap
//! - Raw frames are only reinterpreted as tables through [`TableHandle`]

use core::fmt;
use core::ops::{Index, IndexMut};

use bitflags::bitflags;

use super::address::{
    phys_to_kernel_virt, PhysAddr, VirtAddr, ENTRIES_PER_TABLE, PAGE_SHIFT,
};
use super::frame::FrameAllocator;

bitflags! {
    /// Flags stored in an Sv39 page-table entry.
    ///
    /// Bits 0-7 are the architectural permission bits. Bit 8 (RSW0) is
    /// software-defined and tags intermediate tables a Directory
    /// allocated for itself. The I/O and contiguous hints ride the
    /// Svpbmt and Svnapot extension positions.
    #[derive(Clone, Copy, PartialEq, Eq, Debug)]
    pub struct PageFlags: usize {
        /// Entry is valid (present).
        const VALID = 1 << 0;
        /// Leaf is readable.
        const READ = 1 << 1;
        /// Leaf is writable.
        const WRITE = 1 << 2;
        /// Leaf is executable.
        const EXECUTE = 1 << 3;
        /// Leaf is accessible from user mode.
        const USER = 1 << 4;
        /// Mapping is global (present in every address space).
        const GLOBAL = 1 << 5;
        /// Accessed bit (preset to avoid A/D update faults).
        const ACCESSED = 1 << 6;
        /// Dirty bit (preset to avoid A/D update faults).
        const DIRTY = 1 << 7;
        /// Software: next-level table was allocated by the owning
        /// Directory (not copied from the master) and is freed with it.
        const OWNED = 1 << 8;
        /// Svpbmt I/O mode: uncached, strongly ordered device memory.
        const IO = 2 << 61;
        /// Svnapot contiguous-range hint.
        const CONTIG = 1 << 63;

        /// Non-leaf entry pointing at the next table inward.
        const TABLE = Self::VALID.bits();
        /// Kernel text: read/execute, global.
        const KERNEL_CODE = Self::VALID.bits() | Self::READ.bits() | Self::EXECUTE.bits()
            | Self::GLOBAL.bits() | Self::ACCESSED.bits() | Self::DIRTY.bits();
        /// Kernel data: read/write, global, never executable.
        const KERNEL_DATA = Self::VALID.bits() | Self::READ.bits() | Self::WRITE.bits()
            | Self::GLOBAL.bits() | Self::ACCESSED.bits() | Self::DIRTY.bits();
        /// Boot identity window over all of RAM. Segment-grained W^X is
        /// the loader's concern, not the identity map's.
        const KERNEL_ALL = Self::KERNEL_DATA.bits() | Self::EXECUTE.bits();
        /// Device MMIO: read/write, global, uncached.
        const KERNEL_DEVICE = Self::KERNEL_DATA.bits() | Self::IO.bits();
        /// User text: read/execute from user mode.
        const USER_CODE = Self::VALID.bits() | Self::READ.bits() | Self::EXECUTE.bits()
            | Self::USER.bits() | Self::ACCESSED.bits() | Self::DIRTY.bits();
        /// User data: read/write from user mode, never executable.
        const USER_DATA = Self::VALID.bits() | Self::READ.bits() | Self::WRITE.bits()
            | Self::USER.bits() | Self::ACCESSED.bits() | Self::DIRTY.bits();
    }
}

impl PageFlags {
    /// Check whether the flags describe a leaf mapping (any of R/W/X set).
    #[inline]
    pub const fn is_leaf(self) -> bool {
        self.intersects(Self::READ.union(Self::WRITE).union(Self::EXECUTE))
    }
}

/// Error type for memory-management operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemError {
    /// No run of free frames large enough.
    OutOfMemory,
    /// The request falls outside the managed range.
    OutOfRange,
    /// No free run of directory slots wide enough in the attach window.
    AddressExhausted,
    /// The target slot or address is already mapped.
    AlreadyMapped,
    /// The address resolves to no mapping.
    NotMapped,
    /// The address is not properly aligned.
    Misaligned,
    /// The block is too small to be tracked by the free list.
    TooSmall,
    /// The flags do not describe a valid mapping.
    InvalidFlags,
    /// The operation is not supported.
    Unsupported,
}

impl fmt::Display for MemError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::OutOfMemory => write!(f, "out of physical frames"),
            Self::OutOfRange => write!(f, "address outside managed range"),
            Self::AddressExhausted => write!(f, "no free slot run in attach window"),
            Self::AlreadyMapped => write!(f, "address already mapped"),
            Self::NotMapped => write!(f, "address not mapped"),
            Self::Misaligned => write!(f, "address not properly aligned"),
            Self::TooSmall => write!(f, "block too small to track"),
            Self::InvalidFlags => write!(f, "invalid flag combination"),
            Self::Unsupported => write!(f, "operation not supported"),
        }
    }
}

/// The hardware PTE encoding for one paging variant.
///
/// Everything the tree walkers need to know about the target format is
/// captured here: level count, index bits per level, and the
/// encode/decode between (frame, flags) and the entry word. Walkers
/// never shift bits inline.
pub trait PteFormat {
    /// Number of levels in the tree, outermost first.
    const LEVELS: usize;
    /// Index bits per level, outermost first.
    const LEVEL_BITS: &'static [usize];
    /// Bits of the entry word holding flags.
    const FLAG_MASK: usize;
    /// Position of the frame number inside the entry word.
    const PPN_SHIFT: usize;

    /// Build an entry mapping `frame` with `flags`.
    fn encode(frame: PhysAddr, flags: PageFlags) -> PageTableEntry;

    /// Recover the frame address and flags from `entry`.
    ///
    /// The frame number of an invalid entry is meaningless; callers
    /// must check [`PageTableEntry::is_valid`] first.
    fn decode(entry: PageTableEntry) -> (PhysAddr, PageFlags);

    /// Index into the table at `level` for virtual address `va`.
    #[inline]
    fn index(va: VirtAddr, level: usize) -> usize {
        debug_assert!(level < Self::LEVELS);
        let mut shift = PAGE_SHIFT;
        for bits in &Self::LEVEL_BITS[level + 1..] {
            shift += bits;
        }
        (va.as_usize() >> shift) & ((1 << Self::LEVEL_BITS[level]) - 1)
    }
}

/// The RISC-V Sv39 format: 3 levels of 9 index bits, 44-bit PPN at
/// entry bit 10, flags in bits 0-9 and 61-63.
pub enum Sv39 {}

impl PteFormat for Sv39 {
    const LEVELS: usize = 3;
    const LEVEL_BITS: &'static [usize] = &[9, 9, 9];
    const FLAG_MASK: usize = 0x3FF | (0b111 << 61);
    const PPN_SHIFT: usize = 10;

    #[inline]
    fn encode(frame: PhysAddr, flags: PageFlags) -> PageTableEntry {
        debug_assert!(frame.is_aligned());
        let ppn = frame.page_frame_number();
        PageTableEntry((ppn << Self::PPN_SHIFT) | (flags.bits() & Self::FLAG_MASK))
    }

    #[inline]
    fn decode(entry: PageTableEntry) -> (PhysAddr, PageFlags) {
        let raw = entry.raw();
        let ppn = (raw & !Self::FLAG_MASK) >> Self::PPN_SHIFT;
        let flags = PageFlags::from_bits_truncate(raw & Self::FLAG_MASK);
        (PhysAddr::from_page_frame_number(ppn), flags)
    }
}

/// The paging format in force for this build.
pub type Arch = Sv39;

/// satp mode field selecting Sv39 translation.
pub const SATP_MODE: usize = 8;

/// A single page table entry.
///
/// A 64-bit word that either points to a next-level table or maps a
/// physical frame, per the [`PteFormat`] in force.
#[derive(Clone, Copy, PartialEq, Eq)]
#[repr(transparent)]
pub struct PageTableEntry(usize);

impl PageTableEntry {
    /// Create an invalid (empty) entry.
    #[inline]
    pub const fn invalid() -> Self {
        Self(0)
    }

    /// Check if the entry is valid (present).
    #[inline]
    pub const fn is_valid(self) -> bool {
        self.0 & PageFlags::VALID.bits() != 0
    }

    /// Check if this is a leaf entry (maps memory rather than a table).
    #[inline]
    pub fn is_leaf(self) -> bool {
        self.is_valid() && Arch::decode(self).1.is_leaf()
    }

    /// Get the raw word.
    #[inline]
    pub const fn raw(self) -> usize {
        self.0
    }

    /// Clear the entry (make invalid).
    #[inline]
    pub fn clear(&mut self) {
        self.0 = 0;
    }
}

impl fmt::Debug for PageTableEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_valid() {
            let (addr, flags) = Arch::decode(*self);
            write!(f, "PTE(addr={}, flags={:?})", addr, flags)
        } else {
            write!(f, "PTE(invalid)")
        }
    }
}

/// A page table (one level of the tree).
///
/// Each table is 4KB, 512 entries, and must be frame-aligned in
/// physical memory. Outer levels use the same type as a page directory.
#[repr(C, align(4096))]
pub struct PageTable {
    entries: [PageTableEntry; ENTRIES_PER_TABLE],
}

impl PageTable {
    /// Create a new empty page table (all entries invalid).
    pub const fn new() -> Self {
        const INVALID: PageTableEntry = PageTableEntry::invalid();
        Self {
            entries: [INVALID; ENTRIES_PER_TABLE],
        }
    }

    /// Iterate over all entries.
    pub fn iter(&self) -> impl Iterator<Item = &PageTableEntry> {
        self.entries.iter()
    }

    /// Check whether every entry is invalid.
    pub fn is_empty(&self) -> bool {
        self.entries.iter().all(|e| !e.is_valid())
    }

    /// Overwrite every entry with the entries of `other`.
    pub fn copy_from(&mut self, other: &PageTable) {
        self.entries = other.entries;
    }

    /// Map `[from, to)` with fresh frames from `frames`, installing
    /// leaf entries with `flags`.
    ///
    /// Tries one contiguous run for the whole range first and falls
    /// back to frame-by-frame allocation. On exhaustion the frames
    /// this call already installed are freed and the entries cleared
    /// before the error is returned.
    pub fn map(
        &mut self,
        frames: &mut FrameAllocator,
        flags: PageFlags,
        from: usize,
        to: usize,
    ) -> Result<(), MemError> {
        debug_assert!(from <= to && to <= ENTRIES_PER_TABLE);
        if !flags.is_leaf() {
            return Err(MemError::InvalidFlags);
        }
        if let Some(base) = frames.calloc(to - from) {
            self.remap(base, flags, from, to);
            return Ok(());
        }
        for i in from..to {
            match frames.calloc(1) {
                Some(frame) => self.entries[i] = Arch::encode(frame, flags),
                None => {
                    self.unmap(frames, from, i);
                    return Err(MemError::OutOfMemory);
                }
            }
        }
        Ok(())
    }

    /// Install entries for `[from, to)` pointing at consecutively
    /// increasing physical addresses starting at `base`.
    ///
    /// Used both for mapping already-owned memory (no allocation) and
    /// for linking one tree level to the next.
    pub fn remap(&mut self, base: PhysAddr, flags: PageFlags, from: usize, to: usize) {
        debug_assert!(from <= to && to <= ENTRIES_PER_TABLE);
        debug_assert!(base.is_aligned());
        for i in from..to {
            self.entries[i] = Arch::encode(base.add_frames(i - from), flags);
        }
    }

    /// Clear entries in `[from, to)` and return the frames they mapped
    /// to `frames`. Leaf level only; non-leaf levels delegate to the
    /// child table's own teardown instead.
    pub fn unmap(&mut self, frames: &mut FrameAllocator, from: usize, to: usize) {
        debug_assert!(from <= to && to <= ENTRIES_PER_TABLE);
        for i in from..to {
            let entry = self.entries[i];
            if entry.is_valid() {
                let (frame, _) = Arch::decode(entry);
                if let Err(err) = frames.free(frame, 1) {
                    log::error!("unmap: could not return frame {}: {}", frame, err);
                }
                self.entries[i].clear();
            }
        }
    }
}

impl Index<usize> for PageTable {
    type Output = PageTableEntry;

    #[inline]
    fn index(&self, index: usize) -> &Self::Output {
        &self.entries[index]
    }
}

impl IndexMut<usize> for PageTable {
    #[inline]
    fn index_mut(&mut self, index: usize) -> &mut Self::Output {
        &mut self.entries[index]
    }
}

impl Default for PageTable {
    fn default() -> Self {
        Self::new()
    }
}

/// Handle to a physical frame holding a [`PageTable`].
///
/// All reinterpretation of raw physical memory as a structured table
/// goes through this type, which funnels the physical-to-virtual
/// translation into one place.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct TableHandle(PhysAddr);

impl TableHandle {
    /// Wrap the frame at `addr`.
    ///
    /// # Panics
    /// Panics in debug mode if `addr` is not frame-aligned.
    #[inline]
    pub const fn new(addr: PhysAddr) -> Self {
        debug_assert!(addr.is_aligned());
        Self(addr)
    }

    /// Physical address of the table.
    #[inline]
    pub const fn addr(self) -> PhysAddr {
        self.0
    }

    /// Physical page number of the table, as the translation register
    /// wants it.
    #[inline]
    pub const fn ppn(self) -> usize {
        self.0.page_frame_number()
    }

    /// Handle to the `i`-th table of a contiguous run starting here.
    #[inline]
    pub const fn nth(self, i: usize) -> Self {
        Self(self.0.add_frames(i))
    }

    /// Interpret the frame as a page table.
    ///
    /// # Safety
    /// The frame must hold a (possibly zeroed) page table and must stay
    /// allocated for the lifetime of the reference.
    #[inline]
    pub unsafe fn table<'a>(self) -> &'a PageTable {
        // SAFETY: frames holding tables come zero-filled from calloc,
        // and an all-zero table is valid (every entry invalid).
        unsafe { &*(phys_to_kernel_virt(self.0).as_usize() as *const PageTable) }
    }

    /// Interpret the frame as a mutable page table.
    ///
    /// # Safety
    /// As [`Self::table`], and the caller must have exclusive access to
    /// the frame.
    #[inline]
    pub unsafe fn table_mut<'a>(self) -> &'a mut PageTable {
        unsafe { &mut *(phys_to_kernel_virt(self.0).as_usize() as *mut PageTable) }
    }
}

impl fmt::Debug for TableHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "TableHandle({})", self.0)
    }
}

/// Flush the TLB, either for a single address or entirely.
///
/// Required after any mutation of a PTE reachable from the active
/// directory. Local hart only: there is no cross-CPU shootdown, so a
/// mapping change made here is not guaranteed visible to another hart's
/// TLB (known gap).
#[inline]
pub fn flush_tlb(va: Option<VirtAddr>) {
    #[cfg(all(target_arch = "riscv64", target_os = "none"))]
    // SAFETY: sfence.vma only invalidates cached translations; it
    // cannot fault or touch memory.
    unsafe {
        match va {
            Some(va) => core::arch::asm!("sfence.vma {}, zero", in(reg) va.as_usize()),
            None => core::arch::asm!("sfence.vma"),
        }
    }
    #[cfg(not(all(target_arch = "riscv64", target_os = "none")))]
    let _ = va;
}
