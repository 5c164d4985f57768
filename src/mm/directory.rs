//! Page Directories and Address Spaces
//!
//! A [`Directory`] is one address space: a root page table whose outer
//! entries are copied from the master directory (so every address
//! space shares the kernel mappings) and whose application window is
//! populated by attaching [`Chunk`]s.
//!
//! Attachment is slot-granular: one directory slot spans one leaf
//! table (2 MiB under Sv39), and attaching a chunk points consecutive
//! slots at the chunk's leaf tables. Detaching clears the slots again;
//! the chunk itself is untouched and can be attached elsewhere, or to
//! several directories at once.
//!
//! # Security Properties
//! - System-chosen placement stays inside `[APP_LOW, APP_HIGH)`
//! - Attach never overwrites a live mapping
//! - A failed attach leaves the directory exactly as it was

use super::address::{PhysAddr, VirtAddr, APP_HIGH, APP_LOW, ENTRIES_PER_TABLE, PAGE_SHIFT, SLOT_SPAN};
use super::chunk::Chunk;
use super::kmem::KernelMemory;
use super::paging::{flush_tlb, Arch, MemError, PageFlags, PteFormat, TableHandle, SATP_MODE};

/// Slots in the system-chosen attach window.
const WINDOW_SLOTS: usize = (APP_HIGH - APP_LOW) / SLOT_SPAN;

/// Intermediate levels between the root and the slot level.
const MAX_PATH: usize = 4;
const _: () = assert!(Arch::LEVELS >= 3 && Arch::LEVELS - 2 <= MAX_PATH);

/// One address space.
pub struct Directory<'m> {
    kmem: &'m KernelMemory,
    root: TableHandle,
    /// Whether drop should free the root and the intermediates this
    /// directory allocated. False for directories bound over a root
    /// someone else owns, the master included.
    owns_root: bool,
}

impl<'m> Directory<'m> {
    /// Create a fresh address space sharing the kernel mappings.
    ///
    /// The root is a copy of the master directory's root, so kernel
    /// subtrees are shared by reference and later master changes below
    /// the root level are visible here too.
    pub fn new(kmem: &'m KernelMemory) -> Result<Self, MemError> {
        let root = kmem.calloc_table()?;
        // SAFETY: the root frame was just allocated for us; the master
        // root is only read.
        unsafe { root.table_mut().copy_from(kmem.master().table()) };
        Ok(Self {
            kmem,
            root,
            owns_root: true,
        })
    }

    /// Bind a directory over an existing root without taking ownership.
    ///
    /// Used for the boot address space, whose root is the master
    /// directory itself.
    pub fn from_root(kmem: &'m KernelMemory, root: TableHandle) -> Self {
        Self {
            kmem,
            root,
            owns_root: false,
        }
    }

    /// The root table of this address space.
    #[inline]
    pub fn root(&self) -> TableHandle {
        self.root
    }

    /// Attach `chunk` at a system-chosen address.
    ///
    /// Scans the application window for the first run of free slots
    /// wide enough and installs the chunk's leaf tables there. Returns
    /// the base virtual address of the mapping.
    pub fn attach(&mut self, chunk: &Chunk<'_>) -> Result<VirtAddr, MemError> {
        let needed = chunk.table_count();
        let mut run = 0;
        for s in 0..WINDOW_SLOTS {
            let va = VirtAddr::new(APP_LOW + s * SLOT_SPAN);
            if self.slot_is_free(va) {
                run += 1;
                if run == needed {
                    let base = VirtAddr::new(APP_LOW + (s + 1 - needed) * SLOT_SPAN);
                    self.install(chunk, base)?;
                    return Ok(base);
                }
            } else {
                run = 0;
            }
        }
        Err(MemError::AddressExhausted)
    }

    /// Attach `chunk` at the explicit address `va`.
    ///
    /// `va` must be slot-aligned and the whole span must end at or
    /// below the top of the application window. Addresses below the
    /// system-chosen window are allowed; that range is reserved for
    /// exactly this kind of fixed placement.
    pub fn attach_at(&mut self, chunk: &Chunk<'_>, va: VirtAddr) -> Result<(), MemError> {
        if !va.is_slot_aligned() {
            return Err(MemError::Misaligned);
        }
        let span = chunk.table_count() * SLOT_SPAN;
        if va.as_usize() >= APP_HIGH || va.as_usize() + span > APP_HIGH {
            return Err(MemError::OutOfRange);
        }
        for i in 0..chunk.table_count() {
            if !self.slot_is_free(va.add(i * SLOT_SPAN)) {
                return Err(MemError::AlreadyMapped);
            }
        }
        self.install(chunk, va)
    }

    /// Detach `chunk` wherever it is attached in this address space.
    ///
    /// Scans the low half up to the window top for the chunk's first
    /// leaf table and clears the run it heads. Returns the address the
    /// chunk was attached at.
    pub fn detach(&mut self, chunk: &Chunk<'_>) -> Result<VirtAddr, MemError> {
        let target = chunk.pt().addr();
        for s in 0..APP_HIGH / SLOT_SPAN {
            let va = VirtAddr::new(s * SLOT_SPAN);
            if let Some(addr) = self.slot_target(va) {
                if addr == target {
                    self.clear_run(chunk, va);
                    return Ok(va);
                }
            }
        }
        log::error!("detach of chunk not attached to this directory");
        Err(MemError::NotMapped)
    }

    /// Detach `chunk` from the explicit address `va`.
    pub fn detach_at(&mut self, chunk: &Chunk<'_>, va: VirtAddr) -> Result<(), MemError> {
        if !va.is_slot_aligned() {
            return Err(MemError::Misaligned);
        }
        for i in 0..chunk.table_count() {
            if self.slot_target(va.add(i * SLOT_SPAN)) != Some(chunk.pt_at(i).addr()) {
                log::error!("detach_at {}: slot does not hold this chunk", va);
                return Err(MemError::NotMapped);
            }
        }
        self.clear_run(chunk, va);
        Ok(())
    }

    /// Translate `va` through this address space in software.
    ///
    /// Follows the tree exactly as the hardware walker would,
    /// honoring leaf entries at any level.
    pub fn physical(&self, va: VirtAddr) -> Option<PhysAddr> {
        let mut handle = self.root;
        for level in 0..Arch::LEVELS {
            // SAFETY: table frames stay allocated while reachable from
            // the root.
            let entry = unsafe { handle.table() }[Arch::index(va, level)];
            if !entry.is_valid() {
                log::trace!("physical: {} unmapped at level {}", va, level);
                return None;
            }
            let (addr, flags) = Arch::decode(entry);
            if flags.is_leaf() {
                let mut span_bits = PAGE_SHIFT;
                for bits in &Arch::LEVEL_BITS[level + 1..] {
                    span_bits += bits;
                }
                let offset = va.as_usize() & ((1 << span_bits) - 1);
                return Some(PhysAddr::new(addr.as_usize() + offset));
            }
            handle = TableHandle::new(addr);
        }
        None
    }

    /// Make this the active address space.
    ///
    /// Programs the translation register with the root and flushes the
    /// TLB. Returns the register value, mode field included.
    pub fn activate(&self) -> usize {
        let satp = (SATP_MODE << 60) | self.root.ppn();
        #[cfg(all(target_arch = "riscv64", target_os = "none"))]
        // SAFETY: the root holds a complete directory with the kernel
        // identity mappings, so execution continues at the same
        // addresses after the switch.
        unsafe {
            core::arch::asm!("csrw satp, {}", in(reg) satp);
        }
        flush_tlb(None);
        satp
    }

    /// Whether the slot holding `va` is unmapped.
    fn slot_is_free(&self, va: VirtAddr) -> bool {
        self.slot_target(va).is_none()
    }

    /// Physical address of the leaf table a slot points to, if any.
    fn slot_target(&self, va: VirtAddr) -> Option<PhysAddr> {
        let mut handle = self.root;
        for level in 0..Arch::LEVELS - 2 {
            // SAFETY: reachable tables stay allocated.
            let entry = unsafe { handle.table() }[Arch::index(va, level)];
            if !entry.is_valid() {
                return None;
            }
            handle = TableHandle::new(Arch::decode(entry).0);
        }
        // SAFETY: as above.
        let entry = unsafe { handle.table() }[Arch::index(va, Arch::LEVELS - 2)];
        entry.is_valid().then(|| Arch::decode(entry).0)
    }

    /// Point `chunk.table_count()` consecutive slots starting at `va`
    /// at the chunk's leaf tables.
    ///
    /// The caller has verified the slots are free. The only failure
    /// here is running out of frames for an intermediate table, in
    /// which case every slot already written is cleared again before
    /// the error is propagated.
    fn install(&mut self, chunk: &Chunk<'_>, va: VirtAddr) -> Result<(), MemError> {
        for i in 0..chunk.table_count() {
            let sva = va.add(i * SLOT_SPAN);
            let slot_table = match self.ensure_slot_table(sva) {
                Ok(handle) => handle,
                Err(err) => {
                    self.unwind(va, i);
                    return Err(err);
                }
            };
            // SAFETY: the slot table is reachable only from this root
            // (or shared read-only from the master) and we hold the
            // only mutable borrow.
            let table = unsafe { slot_table.table_mut() };
            table[Arch::index(sva, Arch::LEVELS - 2)] =
                Arch::encode(chunk.pt_at(i).addr(), PageFlags::TABLE);
        }
        flush_tlb(None);
        Ok(())
    }

    /// Walk to the table holding the slot entry for `va`, allocating
    /// missing intermediates. Fresh intermediates are tagged
    /// [`PageFlags::OWNED`] so teardown knows they are ours and not
    /// shared master subtrees.
    fn ensure_slot_table(&mut self, va: VirtAddr) -> Result<TableHandle, MemError> {
        let mut handle = self.root;
        for level in 0..Arch::LEVELS - 2 {
            let idx = Arch::index(va, level);
            // SAFETY: as in install.
            let table = unsafe { handle.table_mut() };
            let entry = table[idx];
            handle = if entry.is_valid() {
                TableHandle::new(Arch::decode(entry).0)
            } else {
                let fresh = self.kmem.calloc_table()?;
                table[idx] =
                    Arch::encode(fresh.addr(), PageFlags::TABLE | PageFlags::OWNED);
                fresh
            };
        }
        Ok(handle)
    }

    /// Clear the `count` slots of a partially installed attach and
    /// prune intermediates that emptied out.
    fn unwind(&mut self, va: VirtAddr, count: usize) {
        for i in 0..count {
            self.clear_slot(va.add(i * SLOT_SPAN));
        }
        for i in 0..count {
            self.release_if_empty(va.add(i * SLOT_SPAN));
        }
    }

    /// Clear the whole slot run of an attached chunk and flush.
    fn clear_run(&mut self, chunk: &Chunk<'_>, va: VirtAddr) {
        for i in 0..chunk.table_count() {
            self.clear_slot(va.add(i * SLOT_SPAN));
        }
        for i in 0..chunk.table_count() {
            self.release_if_empty(va.add(i * SLOT_SPAN));
        }
        flush_tlb(None);
    }

    /// Invalidate the slot entry for `va`, if present.
    fn clear_slot(&mut self, va: VirtAddr) {
        let mut handle = self.root;
        for level in 0..Arch::LEVELS - 2 {
            // SAFETY: as in install.
            let entry = unsafe { handle.table() }[Arch::index(va, level)];
            if !entry.is_valid() {
                return;
            }
            handle = TableHandle::new(Arch::decode(entry).0);
        }
        // SAFETY: as in install.
        let table = unsafe { handle.table_mut() };
        table[Arch::index(va, Arch::LEVELS - 2)].clear();
    }

    /// Free owned intermediate tables on the path to `va` that no
    /// longer hold any entry, bottom-up.
    fn release_if_empty(&mut self, va: VirtAddr) {
        let mut parents = [(self.root, 0usize); MAX_PATH];
        let mut handle = self.root;
        let mut depth = 0;
        for level in 0..Arch::LEVELS - 2 {
            let idx = Arch::index(va, level);
            // SAFETY: as in install.
            let entry = unsafe { handle.table() }[idx];
            if !entry.is_valid() {
                break;
            }
            parents[depth] = (handle, idx);
            depth += 1;
            handle = TableHandle::new(Arch::decode(entry).0);
        }
        while depth > 0 {
            depth -= 1;
            let (parent, idx) = parents[depth];
            // SAFETY: as in install.
            let entry = unsafe { parent.table() }[idx];
            let (addr, flags) = Arch::decode(entry);
            let child = TableHandle::new(addr);
            // SAFETY: as in install.
            if !flags.contains(PageFlags::OWNED) || !unsafe { child.table() }.is_empty() {
                break;
            }
            // SAFETY: as in install.
            let parent_table = unsafe { parent.table_mut() };
            parent_table[idx].clear();
            if let Err(err) = self.kmem.free_frames(addr, 1) {
                log::error!("directory: could not free intermediate table: {}", err);
            }
        }
    }
}

impl Drop for Directory<'_> {
    fn drop(&mut self) {
        if !self.owns_root {
            return;
        }
        // Free the intermediates this directory allocated for itself.
        // Entries copied from the master are shared and stay; leaf
        // tables belong to their chunks.
        // SAFETY: owns_root means the root frame is exclusively ours.
        let root = unsafe { self.root.table_mut() };
        for i in 0..ENTRIES_PER_TABLE {
            let entry = root[i];
            if entry.is_valid() {
                let (addr, flags) = Arch::decode(entry);
                if flags.contains(PageFlags::OWNED) && !flags.is_leaf() {
                    root[i].clear();
                    if let Err(err) = self.kmem.free_frames(addr, 1) {
                        log::error!("directory drop: could not free table: {}", err);
                    }
                }
            }
        }
        if let Err(err) = self.kmem.free_frames(self.root.addr(), 1) {
            log::error!("directory drop: could not free root: {}", err);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mm::address::{PAGE_SIZE, RAM_BASE};
    use crate::mm::testing::test_kmem;

    #[test]
    fn test_attach_and_translate() {
        let (_arena, kmem) = test_kmem(32);
        let chunk = Chunk::new(&kmem, 3 * PAGE_SIZE, PageFlags::USER_DATA).unwrap();
        let mut dir = Directory::new(&kmem).unwrap();

        let va = dir.attach(&chunk).unwrap();
        assert!(va.is_slot_aligned());
        assert!(va.as_usize() >= APP_LOW);

        // Contiguous backing: consecutive pages translate to
        // consecutive frames, offsets preserved.
        let p0 = dir.physical(va).unwrap();
        let p1 = dir.physical(va.add(PAGE_SIZE + 0x123)).unwrap();
        assert_eq!(p1.as_usize(), p0.as_usize() + PAGE_SIZE + 0x123);
        assert!(dir.physical(va.add(2 * PAGE_SIZE)).is_some());
        assert_eq!(dir.physical(va.add(3 * PAGE_SIZE)), None);

        let back = dir.detach(&chunk).unwrap();
        assert_eq!(back, va);
        assert_eq!(dir.physical(va), None);
    }

    #[test]
    fn test_two_chunks_do_not_overlap() {
        let (_arena, kmem) = test_kmem(32);
        let a = Chunk::new(&kmem, PAGE_SIZE, PageFlags::USER_DATA).unwrap();
        let b = Chunk::new(&kmem, PAGE_SIZE, PageFlags::USER_CODE).unwrap();
        let mut dir = Directory::new(&kmem).unwrap();

        let va_a = dir.attach(&a).unwrap();
        let va_b = dir.attach(&b).unwrap();
        assert!(va_b.as_usize() >= va_a.as_usize() + SLOT_SPAN);
        assert_ne!(dir.physical(va_a), dir.physical(va_b));
    }

    #[test]
    fn test_chunk_shared_between_directories() {
        let (_arena, kmem) = test_kmem(32);
        let chunk = Chunk::new(&kmem, PAGE_SIZE, PageFlags::USER_DATA).unwrap();
        let mut d1 = Directory::new(&kmem).unwrap();
        let mut d2 = Directory::new(&kmem).unwrap();

        let va1 = d1.attach(&chunk).unwrap();
        let va2 = d2.attach(&chunk).unwrap();
        // Same frame through either address space.
        assert_eq!(d1.physical(va1), d2.physical(va2));

        d1.detach(&chunk).unwrap();
        // Still live in the other directory.
        assert!(d2.physical(va2).is_some());
        d2.detach(&chunk).unwrap();
    }

    #[test]
    fn test_attach_at_validation() {
        let (_arena, kmem) = test_kmem(32);
        let chunk = Chunk::new(&kmem, PAGE_SIZE, PageFlags::USER_DATA).unwrap();
        let mut dir = Directory::new(&kmem).unwrap();

        assert_eq!(
            dir.attach_at(&chunk, VirtAddr::new(APP_LOW + PAGE_SIZE)),
            Err(MemError::Misaligned)
        );
        assert_eq!(
            dir.attach_at(&chunk, VirtAddr::new(APP_HIGH)),
            Err(MemError::OutOfRange)
        );

        let va = VirtAddr::new(APP_LOW + 4 * SLOT_SPAN);
        dir.attach_at(&chunk, va).unwrap();
        assert_eq!(dir.attach_at(&chunk, va), Err(MemError::AlreadyMapped));
        dir.detach_at(&chunk, va).unwrap();
        assert_eq!(dir.physical(va), None);
    }

    #[test]
    fn test_attach_at_below_window() {
        let (_arena, kmem) = test_kmem(32);
        let chunk = Chunk::new(&kmem, PAGE_SIZE, PageFlags::USER_CODE).unwrap();
        let mut dir = Directory::new(&kmem).unwrap();

        // Fixed placement below the system-chosen window.
        let va = VirtAddr::new(8 * SLOT_SPAN);
        dir.attach_at(&chunk, va).unwrap();
        assert!(dir.physical(va).is_some());
        // detach() finds it even outside the window.
        assert_eq!(dir.detach(&chunk).unwrap(), va);
    }

    #[test]
    fn test_detach_of_unattached_chunk() {
        let (_arena, kmem) = test_kmem(32);
        let chunk = Chunk::new(&kmem, PAGE_SIZE, PageFlags::USER_DATA).unwrap();
        let mut dir = Directory::new(&kmem).unwrap();
        assert_eq!(dir.detach(&chunk), Err(MemError::NotMapped));
    }

    #[test]
    fn test_master_entries_shared() {
        let (_arena, kmem) = test_kmem(32);
        // Hang a 1 GiB leaf off the master root, as the kernel
        // identity map does.
        {
            let master = unsafe { kmem.master().table_mut() };
            master[Arch::index(VirtAddr::new(RAM_BASE), 0)] =
                Arch::encode(PhysAddr::new(RAM_BASE), PageFlags::KERNEL_ALL);
        }
        let dir = Directory::new(&kmem).unwrap();
        let pa = dir.physical(VirtAddr::new(RAM_BASE + 0x1234)).unwrap();
        assert_eq!(pa.as_usize(), RAM_BASE + 0x1234);
    }

    #[test]
    fn test_failed_attach_leaves_directory_unchanged() {
        let (_arena, kmem) = test_kmem(8);
        let chunk = Chunk::new(&kmem, PAGE_SIZE, PageFlags::USER_DATA).unwrap();
        let mut dir = Directory::new(&kmem).unwrap();

        // Drain the allocator so the intermediate table cannot be
        // allocated.
        let remaining = kmem.frames().free_frames();
        let held = kmem.frames().alloc(remaining).unwrap();

        let va = VirtAddr::new(APP_LOW);
        assert_eq!(dir.attach_at(&chunk, va), Err(MemError::OutOfMemory));
        assert_eq!(dir.physical(va), None);

        // With frames back, the identical attach succeeds.
        kmem.frames().free(held, remaining).unwrap();
        dir.attach_at(&chunk, va).unwrap();
        assert!(dir.physical(va).is_some());
        dir.detach(&chunk).unwrap();
    }

    #[test]
    fn test_window_exhaustion() {
        let (_arena, kmem) = test_kmem(1400);
        let mut dir = Directory::new(&kmem).unwrap();

        // Occupy every other slot of the window with one-page chunks.
        let mut chunks = Vec::new();
        for s in (0..WINDOW_SLOTS).step_by(2) {
            let chunk = Chunk::new(&kmem, PAGE_SIZE, PageFlags::USER_DATA).unwrap();
            dir.attach_at(&chunk, VirtAddr::new(APP_LOW + s * SLOT_SPAN))
                .unwrap();
            chunks.push(chunk);
        }

        // A two-slot chunk finds no free run anywhere in the window.
        let wide = Chunk::new(&kmem, SLOT_SPAN + PAGE_SIZE, PageFlags::USER_DATA).unwrap();
        assert_eq!(wide.table_count(), 2);
        let before = kmem.frames().free_frames();
        assert_eq!(dir.attach(&wide), Err(MemError::AddressExhausted));
        assert_eq!(kmem.frames().free_frames(), before);

        // A single-slot chunk still fits in the gaps.
        let small = Chunk::new(&kmem, PAGE_SIZE, PageFlags::USER_DATA).unwrap();
        let va = dir.attach(&small).unwrap();
        assert_eq!(va.as_usize(), APP_LOW + SLOT_SPAN);

        dir.detach(&small).unwrap();
        for chunk in &chunks {
            dir.detach(chunk).unwrap();
        }
    }

    #[test]
    fn test_detach_clears_slot_and_prunes_intermediate() {
        let (_arena, kmem) = test_kmem(32);
        let chunk = Chunk::new(&kmem, PAGE_SIZE, PageFlags::USER_DATA).unwrap();
        let mut dir = Directory::new(&kmem).unwrap();

        let idle = kmem.frames().free_frames();
        let va = dir.attach(&chunk).unwrap();
        // The attach grew the tree by exactly one intermediate table.
        assert_eq!(kmem.frames().free_frames(), idle - 1);

        dir.detach(&chunk).unwrap();
        assert_eq!(dir.physical(va), None);
        // Slot cleared and the now-empty intermediate returned.
        assert_eq!(kmem.frames().free_frames(), idle);

        // The pruned path is rebuildable.
        dir.attach_at(&chunk, va).unwrap();
        assert!(dir.physical(va).is_some());
        dir.detach_at(&chunk, va).unwrap();
        assert_eq!(kmem.frames().free_frames(), idle);
    }

    #[test]
    fn test_drop_returns_directory_frames() {
        let (_arena, kmem) = test_kmem(32);
        let before = kmem.frames().free_frames();
        {
            let chunk = Chunk::new(&kmem, PAGE_SIZE, PageFlags::USER_DATA).unwrap();
            let mut dir = Directory::new(&kmem).unwrap();
            let _ = dir.attach(&chunk).unwrap();
            dir.detach(&chunk).unwrap();
        }
        assert_eq!(kmem.frames().free_frames(), before);
    }

    #[test]
    fn test_activate_value() {
        let (_arena, kmem) = test_kmem(8);
        let dir = Directory::new(&kmem).unwrap();
        let satp = dir.activate();
        assert_eq!(satp >> 60, SATP_MODE);
        assert_eq!(satp & ((1 << 44) - 1), dir.root().ppn());
    }
}
