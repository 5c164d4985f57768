//! Physical Frame Allocator
//!
//! Grouping free-list allocator for physical memory frames. Free
//! memory carries its own bookkeeping: each maximal run of free frames
//! holds a [`FreeRun`] node in its first frame, so the allocator needs
//! no side table and its footprint does not grow with memory size.
//!
//! # Security Properties
//! - All frames are zeroed before handout via [`FrameAllocator::calloc`]
//! - Double-free and overlapping-free are detected and panic
//! - Frames outside the managed range are never handed out
//!
//! # Allocation discipline
//! `alloc(n)` carves `n` frames off the TOP of the first run that fits,
//! which leaves the run's node untouched unless the run empties. Frees
//! insert in address order and coalesce with both neighbors, so the
//! list length is bounded by fragmentation, not by free count.

use core::ptr::NonNull;

use super::address::{kernel_virt_to_phys, phys_to_kernel_virt, PhysAddr, VirtAddr, PAGE_SIZE};
use super::paging::MemError;

/// Node describing one maximal run of free frames, stored in the run's
/// first frame.
struct FreeRun {
    /// Length of the run in frames.
    frames: usize,
    /// Next run in ascending address order.
    next: Option<NonNull<FreeRun>>,
}

/// Smallest block the free list can track: the node must fit in it.
pub const MIN_FREE_FRAMES: usize = core::mem::size_of::<FreeRun>().div_ceil(PAGE_SIZE);

/// Physical frame allocator over one contiguous managed range.
pub struct FrameAllocator {
    /// First free run in ascending address order.
    head: Option<NonNull<FreeRun>>,
    /// Start of the managed range.
    base: PhysAddr,
    /// End of the managed range (exclusive).
    top: PhysAddr,
    /// Frames under management.
    total_frames: usize,
    /// Frames currently free.
    free_frames: usize,
    initialized: bool,
}

// SAFETY: the intrusive list is only reached through &mut self; callers
// serialize access (KernelMemory wraps the allocator in a Mutex).
unsafe impl Send for FrameAllocator {}

impl FrameAllocator {
    /// Create an empty, uninitialized allocator.
    pub const fn new() -> Self {
        Self {
            head: None,
            base: PhysAddr::new_unchecked(0),
            top: PhysAddr::new_unchecked(0),
            total_frames: 0,
            free_frames: 0,
            initialized: false,
        }
    }

    /// Hand `[base, top)` to the allocator as one free run.
    ///
    /// Interior alignment is forced inward, so a ragged range loses at
    /// most one frame at either end. Re-initialization is refused.
    pub fn init(&mut self, base: PhysAddr, top: PhysAddr) {
        if self.initialized {
            log::warn!("frame allocator already initialized, ignoring");
            return;
        }
        let base = base.align_up();
        let top = top.align_down();
        assert!(base < top, "empty or inverted frame range");

        let frames = (top.as_usize() - base.as_usize()) / PAGE_SIZE;
        self.base = base;
        self.top = top;
        self.total_frames = frames;
        self.initialized = true;

        // SAFETY: the range was just handed to us and nothing else
        // owns it yet.
        unsafe { self.insert_run(base, frames) };
        self.free_frames = frames;

        log::info!(
            "frame allocator: {} frames ({} KiB) at {}",
            frames,
            frames * PAGE_SIZE / 1024,
            base
        );
    }

    /// Allocate `n` contiguous frames.
    ///
    /// First-fit over the free list; the frames come off the top of
    /// the chosen run. Returns `None` when no run is large enough or
    /// `n` is zero. Contents are undefined; use [`Self::calloc`] for
    /// zeroed memory.
    pub fn alloc(&mut self, n: usize) -> Option<PhysAddr> {
        if n == 0 || !self.initialized {
            return None;
        }

        let mut prev: Option<NonNull<FreeRun>> = None;
        let mut cursor = self.head;
        while let Some(mut node) = cursor {
            // SAFETY: nodes live in frames the list owns.
            let run = unsafe { node.as_mut() };
            if run.frames >= n {
                run.frames -= n;
                let base = self.run_base(node);
                let result = base.add_frames(run.frames);
                if run.frames == 0 {
                    let next = run.next;
                    match prev {
                        Some(mut p) => unsafe { p.as_mut().next = next },
                        None => self.head = next,
                    }
                }
                self.free_frames -= n;
                return Some(result);
            }
            prev = cursor;
            cursor = run.next;
        }
        None
    }

    /// Allocate `n` contiguous frames, zero-filled.
    pub fn calloc(&mut self, n: usize) -> Option<PhysAddr> {
        let base = self.alloc(n)?;
        let virt = phys_to_kernel_virt(base);
        // SAFETY: the frames were just allocated and are exclusively
        // ours; the 1:1 window covers the whole managed range.
        unsafe {
            core::ptr::write_bytes(virt.as_usize() as *mut u8, 0, n * PAGE_SIZE);
        }
        Some(base)
    }

    /// Return `n` frames starting at `addr` to the free list.
    ///
    /// The range is inserted in address order and coalesced with
    /// adjacent runs on both sides.
    ///
    /// # Panics
    /// Panics if the range overlaps a run that is already free. An
    /// overlap means either a double free or a stray pointer, and
    /// continuing would hand the same frame out twice.
    pub fn free(&mut self, addr: PhysAddr, n: usize) -> Result<(), MemError> {
        if !addr.is_aligned() {
            log::error!("free of misaligned address {}", addr);
            return Err(MemError::Misaligned);
        }
        if n < MIN_FREE_FRAMES {
            log::error!("free of {} frames, below tracking minimum", n);
            return Err(MemError::TooSmall);
        }
        if addr < self.base || addr.add_frames(n) > self.top {
            log::error!("free of {} (+{} frames) outside managed range", addr, n);
            return Err(MemError::OutOfRange);
        }

        // SAFETY: range checked against the managed window above;
        // overlap with live runs panics inside.
        unsafe { self.insert_run(addr, n) };
        self.free_frames += n;
        Ok(())
    }

    /// Size in frames of the largest run that could be allocated.
    pub fn allocable(&self) -> usize {
        let mut largest = 0;
        let mut cursor = self.head;
        while let Some(node) = cursor {
            // SAFETY: nodes live in frames the list owns.
            let run = unsafe { node.as_ref() };
            if run.frames > largest {
                largest = run.frames;
            }
            cursor = run.next;
        }
        largest
    }

    /// Frames currently free.
    pub fn free_frames(&self) -> usize {
        self.free_frames
    }

    /// Frames currently handed out.
    pub fn allocated_frames(&self) -> usize {
        self.total_frames - self.free_frames
    }

    /// Frames under management.
    pub fn total_frames(&self) -> usize {
        self.total_frames
    }

    /// Physical base address of the run whose node is `node`.
    fn run_base(&self, node: NonNull<FreeRun>) -> PhysAddr {
        kernel_virt_to_phys(VirtAddr::new_unchecked(node.as_ptr() as usize))
    }

    /// Write a [`FreeRun`] node into the first frame of `[addr,
    /// addr + frames)`, link it in address order, and merge with
    /// contiguous neighbors.
    ///
    /// # Safety
    /// The caller must own the range and it must lie inside the 1:1
    /// kernel window.
    unsafe fn insert_run(&mut self, addr: PhysAddr, frames: usize) {
        // A run that cannot host its own node would be untrackable.
        debug_assert!(frames >= MIN_FREE_FRAMES);
        let end = addr.add_frames(frames);

        // Find the insertion point: prev ends at or before addr, next
        // starts at or after end.
        let mut prev: Option<NonNull<FreeRun>> = None;
        let mut cursor = self.head;
        while let Some(node) = cursor {
            let base = self.run_base(node);
            if base >= addr {
                break;
            }
            prev = cursor;
            cursor = unsafe { node.as_ref() }.next;
        }

        if let Some(p) = prev {
            let p_base = self.run_base(p);
            let p_end = p_base.add_frames(unsafe { p.as_ref() }.frames);
            assert!(p_end <= addr, "free of {} overlaps free run at {}", addr, p_base);
        }
        if let Some(nx) = cursor {
            let nx_base = self.run_base(nx);
            assert!(end <= nx_base, "free of {} overlaps free run at {}", addr, nx_base);
        }

        // Merge forward into the next run if contiguous.
        let (frames, next) = match cursor {
            Some(nx) if self.run_base(nx) == end => {
                let nx_run = unsafe { nx.as_ref() };
                (frames + nx_run.frames, nx_run.next)
            }
            other => (frames, other),
        };

        // Merge backward into the previous run if contiguous.
        if let Some(mut p) = prev {
            if self.run_base(p).add_frames(unsafe { p.as_ref() }.frames) == addr {
                let p_run = unsafe { p.as_mut() };
                p_run.frames += frames;
                p_run.next = next;
                return;
            }
        }

        let node_ptr = phys_to_kernel_virt(addr).as_usize() as *mut FreeRun;
        // SAFETY: addr is frame-aligned and owned by the caller; the
        // node fits in MIN_FREE_FRAMES frames.
        unsafe { node_ptr.write(FreeRun { frames, next }) };
        let node = unsafe { NonNull::new_unchecked(node_ptr) };
        match prev {
            Some(mut p) => unsafe { p.as_mut().next = Some(node) },
            None => self.head = Some(node),
        }
    }
}

impl Default for FrameAllocator {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mm::testing::Arena;

    #[test]
    fn test_alloc_carves_from_top() {
        let arena = Arena::new(100);
        let mut alloc = FrameAllocator::new();
        alloc.init(arena.base(), arena.top());
        assert_eq!(alloc.free_frames(), 100);

        // 100-frame run: alloc(10) must come from the top, leaving the
        // node of the remaining 90-frame run in place.
        let got = alloc.alloc(10).unwrap();
        assert_eq!(got, arena.base().add_frames(90));
        assert_eq!(alloc.free_frames(), 90);
        assert_eq!(alloc.allocable(), 90);
    }

    #[test]
    fn test_free_coalesces_both_sides() {
        let arena = Arena::new(100);
        let mut alloc = FrameAllocator::new();
        alloc.init(arena.base(), arena.top());

        let a = alloc.alloc(10).unwrap();
        let b = alloc.alloc(10).unwrap();
        let c = alloc.alloc(10).unwrap();
        assert_eq!(alloc.allocable(), 70);

        // Free the middle block first: three runs, no merge possible.
        alloc.free(b, 10).unwrap();
        assert_eq!(alloc.free_frames(), 80);
        assert_eq!(alloc.allocable(), 70);

        // Freeing its neighbors must merge everything back into one
        // 100-frame run.
        alloc.free(a, 10).unwrap();
        alloc.free(c, 10).unwrap();
        assert_eq!(alloc.free_frames(), 100);
        assert_eq!(alloc.allocable(), 100);
    }

    #[test]
    fn test_no_overlapping_allocations() {
        let arena = Arena::new(64);
        let mut alloc = FrameAllocator::new();
        alloc.init(arena.base(), arena.top());

        let mut blocks = Vec::new();
        while let Some(addr) = alloc.alloc(3) {
            blocks.push(addr);
        }
        blocks.sort();
        for pair in blocks.windows(2) {
            assert!(pair[0].add_frames(3) <= pair[1]);
        }
        // 64 / 3 leaves one frame stranded.
        assert_eq!(alloc.free_frames(), 1);
    }

    #[test]
    fn test_exhaustion_and_recovery() {
        let arena = Arena::new(8);
        let mut alloc = FrameAllocator::new();
        alloc.init(arena.base(), arena.top());

        let a = alloc.alloc(8).unwrap();
        assert_eq!(alloc.alloc(1), None);
        assert_eq!(alloc.allocable(), 0);

        alloc.free(a, 8).unwrap();
        assert_eq!(alloc.allocable(), 8);
    }

    #[test]
    fn test_oversized_request_fails_cleanly() {
        let arena = Arena::new(16);
        let mut alloc = FrameAllocator::new();
        alloc.init(arena.base(), arena.top());

        assert_eq!(alloc.alloc(17), None);
        assert_eq!(alloc.free_frames(), 16);
        // A fitting request still succeeds afterwards.
        assert!(alloc.alloc(16).is_some());
    }

    #[test]
    fn test_zero_frame_requests() {
        let arena = Arena::new(4);
        let mut alloc = FrameAllocator::new();
        alloc.init(arena.base(), arena.top());

        assert_eq!(alloc.alloc(0), None);
        assert_eq!(alloc.free(arena.base(), 0), Err(MemError::TooSmall));
    }

    #[test]
    fn test_free_rejects_misaligned() {
        let arena = Arena::new(4);
        let mut alloc = FrameAllocator::new();
        alloc.init(arena.base(), arena.top());

        let odd = arena.base().add(123);
        assert_eq!(alloc.free(odd, 1), Err(MemError::Misaligned));
    }

    #[test]
    fn test_free_rejects_foreign_range() {
        let arena = Arena::new(4);
        let other = Arena::new(4);
        let mut alloc = FrameAllocator::new();
        alloc.init(arena.base(), arena.top());

        // The two arenas never overlap, so at least one side of the
        // foreign range falls outside the managed window.
        assert_eq!(alloc.free(other.base(), 1), Err(MemError::OutOfRange));
    }

    #[test]
    #[should_panic(expected = "overlaps free run")]
    fn test_double_free_panics() {
        let arena = Arena::new(8);
        let mut alloc = FrameAllocator::new();
        alloc.init(arena.base(), arena.top());

        let a = alloc.alloc(2).unwrap();
        alloc.free(a, 2).unwrap();
        let _ = alloc.free(a, 2);
    }

    #[test]
    fn test_calloc_zero_fills() {
        let arena = Arena::new(4);
        let mut alloc = FrameAllocator::new();
        alloc.init(arena.base(), arena.top());

        let addr = alloc.calloc(2).unwrap();
        let slice = unsafe {
            core::slice::from_raw_parts(addr.as_usize() as *const u8, 2 * PAGE_SIZE)
        };
        assert!(slice.iter().all(|&b| b == 0));
    }

    #[test]
    fn test_counters_track_allocation() {
        let arena = Arena::new(32);
        let mut alloc = FrameAllocator::new();
        alloc.init(arena.base(), arena.top());
        assert_eq!(alloc.total_frames(), 32);
        assert_eq!(alloc.allocated_frames(), 0);

        let a = alloc.alloc(5).unwrap();
        assert_eq!(alloc.allocated_frames(), 5);
        alloc.free(a, 5).unwrap();
        assert_eq!(alloc.allocated_frames(), 0);
    }
}
