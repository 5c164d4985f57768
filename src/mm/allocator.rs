//! Kernel Heap Allocator
//!
//! A fixed-size heap for kernel-internal allocations, served by a
//! linked-list allocator over a static buffer. The frame allocator
//! handles page-granular memory; this heap covers the small odd-sized
//! allocations that do not deserve a whole frame.

use core::ptr::addr_of_mut;

use linked_list_allocator::LockedHeap;

/// Kernel heap size (256 KiB).
pub const HEAP_SIZE: usize = 256 * 1024;

#[cfg_attr(all(target_arch = "riscv64", target_os = "none"), global_allocator)]
static ALLOCATOR: LockedHeap = LockedHeap::empty();

static mut HEAP_SPACE: [u8; HEAP_SIZE] = [0; HEAP_SIZE];

/// Initialize the kernel heap. Must be called exactly once, before
/// any heap allocation.
pub fn init() {
    // SAFETY: HEAP_SPACE is only handed to the allocator here, once.
    unsafe {
        ALLOCATOR
            .lock()
            .init(addr_of_mut!(HEAP_SPACE) as *mut u8, HEAP_SIZE);
    }
    log::info!("kernel heap: {} KiB", HEAP_SIZE / 1024);
}

#[cfg(test)]
mod tests {
    use core::alloc::Layout;
    use linked_list_allocator::Heap;

    #[test]
    fn test_heap_allocate_and_free() {
        let mut space = vec![0u8; 16 * 1024];
        // SAFETY: the buffer outlives the heap and is used for
        // nothing else.
        let mut heap = unsafe { Heap::new(space.as_mut_ptr(), space.len()) };

        let layout = Layout::from_size_align(256, 8).unwrap();
        let free_before = heap.free();
        let block = heap.allocate_first_fit(layout).unwrap();
        assert!(heap.free() < free_before);
        // SAFETY: block came from this heap with this layout.
        unsafe { heap.deallocate(block, layout) };
        assert_eq!(heap.free(), free_before);
    }
}
