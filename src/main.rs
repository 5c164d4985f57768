//! OcelotOS - RISC-V 64 Microkernel
//!
//! A small kernel for the QEMU virt machine built around an Sv39
//! virtual-memory core.
//!
//! # Memory Model
//! - Grouping free-list frame allocator (bookkeeping lives in free
//!   memory itself)
//! - Chunks: mapped physical memory plus its leaf page tables, not yet
//!   placed at any virtual address
//! - Directories: address spaces sharing the kernel mappings through a
//!   master directory, populated by attaching chunks slot by slot
//!
//! # Security Features
//! - Memory safety via Rust's ownership model
//! - Type-safe page table management
//! - Typed physical/virtual addresses
//!
//! # Architecture
//! - Target: RV64GC, Sv39 translation
//! - Machine: QEMU virt
//! - Boot: Direct kernel boot (no bootloader)

#![cfg_attr(target_os = "none", no_std)]
#![cfg_attr(target_os = "none", no_main)]
#![deny(unsafe_op_in_unsafe_fn)]

mod drivers;
mod klog;
mod mm;
mod setup;

#[cfg(all(target_arch = "riscv64", target_os = "none"))]
use drivers::uart::UART;

/// Kernel version string
const VERSION: &str = "0.1.0";

#[cfg(all(target_arch = "riscv64", target_os = "none"))]
const BOOT_STACK_SIZE: usize = 64 * 1024;

#[cfg(all(target_arch = "riscv64", target_os = "none"))]
static mut BOOT_STACK: [u8; BOOT_STACK_SIZE] = [0; BOOT_STACK_SIZE];

#[cfg(all(target_arch = "riscv64", target_os = "none"))]
core::arch::global_asm!(
    ".section .text.boot",
    ".globl _start",
    "_start:",
    "    la   sp, {stack}",
    "    li   t0, {stack_size}",
    "    add  sp, sp, t0",
    "    j    kernel_main",
    stack = sym BOOT_STACK,
    stack_size = const BOOT_STACK_SIZE,
);

/// Kernel entry point, reached from `_start` with a valid stack.
#[cfg(all(target_arch = "riscv64", target_os = "none"))]
#[no_mangle]
pub extern "C" fn kernel_main() -> ! {
    // Console first, so every later failure can say something.
    // SAFETY: called once; the base address is the QEMU virt UART.
    unsafe {
        UART.lock().init();
    }
    klog::init(log::LevelFilter::Info);

    kprintln!();
    kprintln!("OcelotOS v{} - RISC-V 64 Microkernel", VERSION);
    kprintln!("=====================================");
    kprintln!();

    mm::allocator::init();

    let si = setup::SystemInfo::qemu_virt();
    let kmem = setup::Setup::run(&si);

    let boot_space = mm::Directory::from_root(&kmem, kmem.master());
    let satp = boot_space.activate();
    log::info!("boot address space active, satp {:#x}", satp);

    // Smoke-test the chunk/directory path before declaring victory.
    match exercise_vm(&kmem) {
        Ok(()) => log::info!("virtual memory self-check passed"),
        Err(err) => log::error!("virtual memory self-check failed: {}", err),
    }
    log::info!("largest allocable run: {} frames", kmem.allocable());

    kprintln!();
    kprintln!("[BOOT] Kernel initialization complete");
    halt();
}

/// Build one address space with one chunk attached and tear both down.
#[cfg(all(target_arch = "riscv64", target_os = "none"))]
fn exercise_vm(kmem: &mm::KernelMemory) -> Result<(), mm::MemError> {
    let chunk = mm::Chunk::new(kmem, 16 * mm::PAGE_SIZE, mm::PageFlags::USER_DATA)?;
    let mut space = mm::Directory::new(kmem)?;
    let va = space.attach(&chunk)?;
    log::info!("test chunk of {} bytes attached at {}", chunk.size(), va);
    space.detach(&chunk)?;
    Ok(())
}

/// Halt the CPU in a low-power state
#[cfg(all(target_arch = "riscv64", target_os = "none"))]
fn halt() -> ! {
    loop {
        // SAFETY: WFI is always safe to execute
        unsafe {
            core::arch::asm!("wfi");
        }
    }
}

/// Panic handler - called on unrecoverable errors
#[cfg(all(target_arch = "riscv64", target_os = "none"))]
#[panic_handler]
fn panic(info: &core::panic::PanicInfo) -> ! {
    kprintln!();
    kprintln!("!!! KERNEL PANIC !!!");
    kprintln!();

    if let Some(location) = info.location() {
        kprintln!(
            "Location: {}:{}:{}",
            location.file(),
            location.line(),
            location.column()
        );
    }

    kprintln!("Message: {}", info.message());

    kprintln!();
    kprintln!("System halted.");

    halt();
}

#[cfg(not(target_os = "none"))]
fn main() {
    println!(
        "ocelotos v{}: RISC-V 64 kernel image; build for riscv64gc-unknown-none-elf to boot it",
        VERSION
    );
}
