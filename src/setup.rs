//! System Bootstrap
//!
//! Takes the machine from physical addressing to virtual: seeds the
//! frame allocator with the free RAM range, builds the master page
//! directory (identity maps for all of RAM and the boot MMIO window),
//! and turns translation on.
//!
//! Nothing here can recover from failure; the runtime the error paths
//! would need does not exist yet. Every misconfiguration or allocation
//! failure is a panic with a message naming the cause.

use crate::mm::address::{PhysAddr, VirtAddr, MIO_BASE, MIO_TOP, RAM_BASE};
use crate::mm::frame::FrameAllocator;
use crate::mm::kmem::KernelMemory;
use crate::mm::paging::{flush_tlb, Arch, PageFlags, PteFormat, TableHandle, SATP_MODE};

/// Physical memory layout handed to the bootstrap.
#[derive(Clone, Copy, Debug)]
pub struct SystemInfo {
    /// Start of physical RAM.
    pub ram_base: PhysAddr,
    /// End of physical RAM (exclusive).
    pub ram_top: PhysAddr,
    /// Start of the boot MMIO window.
    pub mio_base: PhysAddr,
    /// End of the boot MMIO window (exclusive).
    pub mio_top: PhysAddr,
    /// First frame the allocator may hand out. Everything between
    /// `ram_base` and here is the loaded kernel image.
    pub free_base: PhysAddr,
    /// End of the allocatable range (exclusive).
    pub free_top: PhysAddr,
}

impl SystemInfo {
    /// Layout of the QEMU virt machine with 128 MiB of RAM, 4 MiB
    /// reserved for the kernel image.
    pub const fn qemu_virt() -> Self {
        Self {
            ram_base: PhysAddr::new_unchecked(RAM_BASE),
            ram_top: PhysAddr::new_unchecked(RAM_BASE + 128 * 1024 * 1024),
            mio_base: PhysAddr::new_unchecked(MIO_BASE),
            mio_top: PhysAddr::new_unchecked(MIO_TOP),
            free_base: PhysAddr::new_unchecked(RAM_BASE + 4 * 1024 * 1024),
            free_top: PhysAddr::new_unchecked(RAM_BASE + 128 * 1024 * 1024),
        }
    }

    /// Sanity-check the layout.
    ///
    /// # Panics
    /// Panics on any inconsistency: misaligned bounds, empty or
    /// inverted ranges, or a free range outside RAM.
    pub fn validate(&self) {
        assert!(
            self.ram_base.is_aligned()
                && self.ram_top.is_aligned()
                && self.mio_base.is_aligned()
                && self.mio_top.is_aligned()
                && self.free_base.is_aligned()
                && self.free_top.is_aligned(),
            "bootstrap: memory bounds not page-aligned"
        );
        assert!(self.ram_base < self.ram_top, "bootstrap: empty RAM range");
        assert!(self.mio_base < self.mio_top, "bootstrap: empty MMIO window");
        assert!(
            self.free_base < self.free_top,
            "bootstrap: empty free range"
        );
        assert!(
            self.ram_base <= self.free_base && self.free_top <= self.ram_top,
            "bootstrap: free range outside RAM"
        );
    }
}

/// The bootstrap sequence.
pub struct Setup;

impl Setup {
    /// Build the memory-management context and switch translation on.
    ///
    /// After this returns, the kernel runs on the master directory:
    /// all of RAM and the MMIO window are identity mapped, so every
    /// physical address the allocator hands out is directly usable.
    pub fn run(si: &SystemInfo) -> KernelMemory {
        si.validate();
        log::info!(
            "setup: RAM {}..{}, free {}..{}",
            si.ram_base,
            si.ram_top,
            si.free_base,
            si.free_top
        );

        let mut frames = FrameAllocator::new();
        frames.init(si.free_base, si.free_top);

        let master = match frames.calloc(1) {
            Some(addr) => TableHandle::new(addr),
            None => panic!("bootstrap: no frame for the master directory"),
        };
        map_identity(&mut frames, master, si.ram_base, si.ram_top, PageFlags::KERNEL_ALL);
        log::trace!("setup: RAM identity map built");
        map_identity(&mut frames, master, si.mio_base, si.mio_top, PageFlags::KERNEL_DEVICE);
        log::trace!("setup: MMIO window {}..{} mapped", si.mio_base, si.mio_top);

        #[cfg(all(target_arch = "riscv64", target_os = "none"))]
        // SAFETY: the master identity maps all of RAM, so the next
        // instruction fetch resolves to the same bytes it would have
        // without translation.
        unsafe {
            core::arch::asm!("csrw satp, {}", in(reg) (SATP_MODE << 60) | master.ppn());
        }
        flush_tlb(None);

        log::info!(
            "setup: translation on, {} of {} frames free",
            frames.free_frames(),
            frames.total_frames()
        );
        KernelMemory::new(frames, master)
    }
}

/// Identity map `[base, top)` into the tree rooted at `root`.
fn map_identity(
    frames: &mut FrameAllocator,
    root: TableHandle,
    base: PhysAddr,
    top: PhysAddr,
    flags: PageFlags,
) {
    let mut addr = base.align_down();
    let top = top.align_up();
    while addr < top {
        map_page(frames, root, VirtAddr::new(addr.as_usize()), addr, flags);
        addr = addr.add_frames(1);
    }
}

/// Install a single leaf mapping, creating intermediates as needed.
fn map_page(
    frames: &mut FrameAllocator,
    root: TableHandle,
    va: VirtAddr,
    pa: PhysAddr,
    flags: PageFlags,
) {
    let mut handle = root;
    for level in 0..Arch::LEVELS - 1 {
        let idx = Arch::index(va, level);
        // SAFETY: every table on the path was allocated by us and
        // nothing else runs yet.
        let table = unsafe { handle.table_mut() };
        let entry = table[idx];
        handle = if entry.is_valid() {
            TableHandle::new(Arch::decode(entry).0)
        } else {
            let addr = match frames.calloc(1) {
                Some(addr) => addr,
                None => panic!("bootstrap: out of frames building the master directory"),
            };
            table[idx] = Arch::encode(addr, PageFlags::TABLE);
            TableHandle::new(addr)
        };
    }
    // SAFETY: as above.
    let table = unsafe { handle.table_mut() };
    let idx = Arch::index(va, Arch::LEVELS - 1);
    assert!(!table[idx].is_valid(), "bootstrap: duplicate mapping at {}", va);
    table[idx] = Arch::encode(pa, flags);
}
