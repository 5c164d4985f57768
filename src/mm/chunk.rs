//! Memory Chunks
//!
//! A [`Chunk`] is a span of physical memory plus the leaf page tables
//! that map it, not yet placed at any virtual address. Address spaces
//! attach chunks by pointing directory slots at the chunk's tables, so
//! one chunk can be shared by several address spaces at once.
//!
//! Backing memory is contiguous when a single run of frames is
//! available and falls back to scattered per-page allocation otherwise.
//! Either way the leaf tables themselves are allocated as one run, so
//! teardown never needs a side list of table addresses.

use super::address::{PhysAddr, ENTRIES_PER_TABLE, PAGE_SIZE};
use super::kmem::KernelMemory;
use super::paging::{MemError, PageFlags, TableHandle};

/// How a chunk's frames were obtained.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
enum Backing {
    /// One run of frames starting at `base`.
    Contiguous { base: PhysAddr },
    /// Per-page frames, recorded only in the leaf tables.
    Scattered,
}

/// A span of mapped physical memory awaiting attachment.
///
/// Dropping the chunk returns its frames and tables to the allocator.
/// The caller must detach it from every address space first; the
/// directories keep no back-reference.
pub struct Chunk<'m> {
    kmem: &'m KernelMemory,
    bytes: usize,
    pages: usize,
    /// First leaf table of a contiguous run of `table_count` tables.
    tables: TableHandle,
    table_count: usize,
    backing: Backing,
    flags: PageFlags,
}

impl<'m> Chunk<'m> {
    /// Allocate a chunk of at least `bytes` bytes mapped with `flags`.
    ///
    /// `flags` must grant at least one of read, write, or execute;
    /// the valid bit is forced on. The span is rounded up to whole
    /// pages and comes zero-filled.
    pub fn new(kmem: &'m KernelMemory, bytes: usize, flags: PageFlags) -> Result<Self, MemError> {
        if bytes == 0 {
            return Err(MemError::TooSmall);
        }
        if !flags.is_leaf() {
            return Err(MemError::InvalidFlags);
        }
        let flags = flags | PageFlags::VALID;

        let pages = bytes.div_ceil(PAGE_SIZE);
        let table_count = pages.div_ceil(ENTRIES_PER_TABLE);

        let mut frames = kmem.frames();
        let tables = match frames.calloc(table_count) {
            Some(addr) => TableHandle::new(addr),
            None => return Err(MemError::OutOfMemory),
        };

        // Contiguous backing first: one run, tables filled by plain
        // remapping. Fall back to page-at-a-time allocation when no
        // run is wide enough.
        let backing = if let Some(base) = frames.calloc(pages) {
            for i in 0..table_count {
                let used = Self::entries_in_table(pages, i);
                // SAFETY: the table run was just allocated and is
                // exclusively ours.
                let table = unsafe { tables.nth(i).table_mut() };
                table.remap(base.add_frames(i * ENTRIES_PER_TABLE), flags, 0, used);
            }
            Backing::Contiguous { base }
        } else {
            for i in 0..table_count {
                let used = Self::entries_in_table(pages, i);
                // SAFETY: as above.
                let table = unsafe { tables.nth(i).table_mut() };
                if let Err(err) = table.map(&mut frames, flags, 0, used) {
                    // Undo the tables already filled, then the table
                    // run itself, before reporting failure.
                    for j in 0..i {
                        let done = Self::entries_in_table(pages, j);
                        let table = unsafe { tables.nth(j).table_mut() };
                        table.unmap(&mut frames, 0, done);
                    }
                    if let Err(err) = frames.free(tables.addr(), table_count) {
                        log::error!("chunk rollback: could not free leaf tables: {}", err);
                    }
                    return Err(err);
                }
            }
            Backing::Scattered
        };
        drop(frames);

        Ok(Self {
            kmem,
            bytes,
            pages,
            tables,
            table_count,
            backing,
            flags,
        })
    }

    /// Leaf entries used in table `i` of a chunk spanning `pages`.
    #[inline]
    fn entries_in_table(pages: usize, i: usize) -> usize {
        (pages - i * ENTRIES_PER_TABLE).min(ENTRIES_PER_TABLE)
    }

    /// Requested size in bytes (not rounded up).
    #[inline]
    pub fn size(&self) -> usize {
        self.bytes
    }

    /// Mapped span in pages.
    #[inline]
    pub fn pages(&self) -> usize {
        self.pages
    }

    /// Number of leaf tables backing the chunk, one per directory slot
    /// it occupies when attached.
    #[inline]
    pub fn table_count(&self) -> usize {
        self.table_count
    }

    /// The first leaf table.
    #[inline]
    pub fn pt(&self) -> TableHandle {
        self.tables
    }

    /// The `i`-th leaf table.
    #[inline]
    pub fn pt_at(&self, i: usize) -> TableHandle {
        debug_assert!(i < self.table_count);
        self.tables.nth(i)
    }

    /// Leaf mapping flags.
    #[inline]
    pub fn flags(&self) -> PageFlags {
        self.flags
    }

    /// Whether the backing frames form a single physical run.
    #[inline]
    pub fn is_contiguous(&self) -> bool {
        matches!(self.backing, Backing::Contiguous { .. })
    }

    /// Growing or shrinking a live chunk would have to rewrite leaf
    /// tables that other address spaces may have attached, so it is
    /// refused; allocate a new chunk instead.
    pub fn resize(&mut self, bytes: usize) -> Result<(), MemError> {
        log::warn!("chunk resize to {} bytes refused", bytes);
        Err(MemError::Unsupported)
    }
}

impl Drop for Chunk<'_> {
    fn drop(&mut self) {
        let mut frames = self.kmem.frames();
        match self.backing {
            Backing::Contiguous { base } => {
                if let Err(err) = frames.free(base, self.pages) {
                    log::error!("chunk drop: could not free backing run: {}", err);
                }
            }
            Backing::Scattered => {
                for i in 0..self.table_count {
                    let used = Self::entries_in_table(self.pages, i);
                    // SAFETY: the caller detached the chunk everywhere
                    // before dropping it, so the tables are ours again.
                    let table = unsafe { self.tables.nth(i).table_mut() };
                    table.unmap(&mut frames, 0, used);
                }
            }
        }
        if let Err(err) = frames.free(self.tables.addr(), self.table_count) {
            log::error!("chunk drop: could not free leaf tables: {}", err);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mm::testing::test_kmem;

    #[test]
    fn test_chunk_rounds_up_to_pages() {
        let (_arena, kmem) = test_kmem(32);
        let chunk = Chunk::new(&kmem, 3 * PAGE_SIZE + 1, PageFlags::USER_DATA).unwrap();
        assert_eq!(chunk.size(), 3 * PAGE_SIZE + 1);
        assert_eq!(chunk.pages(), 4);
        assert_eq!(chunk.table_count(), 1);
        assert!(chunk.is_contiguous());
    }

    #[test]
    fn test_zero_byte_chunk_rejected() {
        let (_arena, kmem) = test_kmem(8);
        assert!(matches!(
            Chunk::new(&kmem, 0, PageFlags::USER_DATA),
            Err(MemError::TooSmall)
        ));
    }

    #[test]
    fn test_permissionless_flags_rejected() {
        let (_arena, kmem) = test_kmem(8);
        assert!(matches!(
            Chunk::new(&kmem, PAGE_SIZE, PageFlags::VALID | PageFlags::USER),
            Err(MemError::InvalidFlags)
        ));
    }

    #[test]
    fn test_scattered_fallback() {
        let (_arena, kmem) = test_kmem(16);
        // Fragment the arena: six 2-frame blocks off the top, then
        // free every other one. Largest remaining run is 4 frames.
        let mut held = Vec::new();
        {
            let mut frames = kmem.frames();
            let mut blocks = Vec::new();
            for _ in 0..6 {
                blocks.push(frames.alloc(2).unwrap());
            }
            for (i, addr) in blocks.into_iter().enumerate() {
                if i % 2 == 0 {
                    frames.free(addr, 2).unwrap();
                } else {
                    held.push(addr);
                }
            }
            assert!(frames.allocable() < 5);
            assert!(frames.free_frames() >= 6);
        }

        // 5 pages cannot come as one run but fit page by page.
        let chunk = Chunk::new(&kmem, 5 * PAGE_SIZE, PageFlags::USER_DATA).unwrap();
        assert!(!chunk.is_contiguous());
        assert_eq!(chunk.pages(), 5);
    }

    #[test]
    fn test_drop_returns_every_frame() {
        let (_arena, kmem) = test_kmem(32);
        let before = kmem.frames().free_frames();
        {
            let _chunk = Chunk::new(&kmem, 6 * PAGE_SIZE, PageFlags::USER_CODE).unwrap();
            assert_eq!(kmem.frames().free_frames(), before - 7);
        }
        assert_eq!(kmem.frames().free_frames(), before);
    }

    #[test]
    fn test_multi_table_chunk() {
        let (_arena, kmem) = test_kmem(ENTRIES_PER_TABLE + 64);
        let chunk =
            Chunk::new(&kmem, (ENTRIES_PER_TABLE + 3) * PAGE_SIZE, PageFlags::USER_DATA).unwrap();
        assert_eq!(chunk.table_count(), 2);
        // Second table holds only the 3-page tail.
        let tail = unsafe { chunk.pt_at(1).table() };
        assert!(tail[0].is_valid());
        assert!(tail[2].is_valid());
        assert!(!tail[3].is_valid());
    }

    #[test]
    fn test_allocation_failure_leaves_allocator_clean() {
        let (_arena, kmem) = test_kmem(4);
        let before = kmem.frames().free_frames();
        // 8 pages + 1 table cannot fit in 4 frames.
        assert!(matches!(
            Chunk::new(&kmem, 8 * PAGE_SIZE, PageFlags::USER_DATA),
            Err(MemError::OutOfMemory)
        ));
        assert_eq!(kmem.frames().free_frames(), before);
    }
}
