//! Memory Management
//!
//! The virtual-memory core: typed addresses, the Sv39 page-table
//! format, the physical frame allocator, and the chunk/directory pair
//! that address spaces are built from.
//!
//! Ownership is explicit throughout. [`KernelMemory`] holds the global
//! state; chunks and directories borrow it, so the whole subsystem can
//! be stood up more than once (the tests do).

pub mod address;
pub mod allocator;
pub mod chunk;
pub mod directory;
pub mod frame;
pub mod kmem;
pub mod paging;

pub use address::{PhysAddr, VirtAddr, PAGE_SIZE};
pub use chunk::Chunk;
pub use directory::Directory;
pub use frame::FrameAllocator;
pub use kmem::KernelMemory;
pub use paging::{MemError, PageFlags};
