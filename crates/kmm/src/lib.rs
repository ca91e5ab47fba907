#![cfg_attr(not(any(test, feature = "software-emulation")), no_std)]

//! # Kernel Memory Manager (kmm)
//!
//! The memory-management core of the kernel:
//!
//! - A two-level paged virtual-memory subsystem for a 32-bit address space
//!   (4 KiB pages, 1024 entries per table, 1024 tables per directory):
//!   mapping, address-space switching, and page-fault handling.
//! - The slob heap: a first-fit free-list allocator for small kernel
//!   allocations, grown a page at a time from the physical frame allocator.
//!
//! The physical frame allocator itself is an external collaborator,
//! consumed through the [`FrameAllocator`] trait. Under tests or the
//! `software-emulation` feature, physical memory is emulated so the crate
//! runs on any host.

mod address;
mod arch;
mod entry;
mod fault;
mod frame_allocator;
mod heap;
mod page_directory;
mod page_table;
mod paging;

pub use address::{AddressTranslator, PhysicalAddress, VirtualAddress};
pub use entry::{PageEntry, PageFlags};
pub use fault::{FaultInfo, PageFaultCode};
#[cfg(any(test, feature = "software-emulation"))]
pub use frame_allocator::EmulatedFrameAllocator;
pub use frame_allocator::{AllocError, FrameAllocator};
pub use heap::{Heap, UNIT};
pub use page_directory::PageDirectory;
pub use page_table::{ENTRY_COUNT, PageTable};
pub use paging::{LazySpan, MappedSpan, Paging};

pub use arch::PAGE_SIZE;
