//! Kernel Memory Context
//!
//! One object bundling the global memory-management state: the
//! physical frame allocator and the master page directory. Everything
//! that allocates frames or derives an address space borrows this
//! context instead of reaching for statics, so tests can stand up
//! several independent instances.

use spin::Mutex;

use super::frame::FrameAllocator;
use super::paging::{MemError, TableHandle};
use super::address::PhysAddr;

/// The kernel's memory-management context.
pub struct KernelMemory {
    frames: Mutex<FrameAllocator>,
    /// Root of the master directory holding the kernel mappings every
    /// address space shares.
    master: TableHandle,
}

impl KernelMemory {
    /// Bundle an initialized frame allocator with the master directory
    /// built over it.
    pub fn new(frames: FrameAllocator, master: TableHandle) -> Self {
        Self {
            frames: Mutex::new(frames),
            master,
        }
    }

    /// The master page directory.
    #[inline]
    pub fn master(&self) -> TableHandle {
        self.master
    }

    /// Lock and borrow the frame allocator.
    #[inline]
    pub fn frames(&self) -> spin::MutexGuard<'_, FrameAllocator> {
        self.frames.lock()
    }

    /// Allocate `n` contiguous frames.
    pub fn alloc_frames(&self, n: usize) -> Result<PhysAddr, MemError> {
        self.frames.lock().alloc(n).ok_or(MemError::OutOfMemory)
    }

    /// Allocate `n` contiguous zero-filled frames.
    pub fn calloc_frames(&self, n: usize) -> Result<PhysAddr, MemError> {
        self.frames.lock().calloc(n).ok_or(MemError::OutOfMemory)
    }

    /// Return `n` frames starting at `addr`.
    pub fn free_frames(&self, addr: PhysAddr, n: usize) -> Result<(), MemError> {
        self.frames.lock().free(addr, n)
    }

    /// Allocate one zeroed frame and hand it back as a page table.
    pub fn calloc_table(&self) -> Result<TableHandle, MemError> {
        Ok(TableHandle::new(self.calloc_frames(1)?))
    }

    /// Largest contiguous allocation currently possible, in frames.
    pub fn allocable(&self) -> usize {
        self.frames.lock().allocable()
    }
}
