//! Software implementation for testing and development.
//!
//! Same 32-bit, 4 KiB-page model as the hardware side, but physical memory
//! is a host buffer and "hardware" state (the active directory) lives in
//! thread-local storage so parallel tests do not interfere.

use core::cell::Cell;
use core::sync::atomic::{AtomicUsize, Ordering};

use crate::{PhysicalAddress, VirtualAddress};

/// Page size in bytes.
pub const PAGE_SIZE: usize = 4096;

/// Physical addresses must fit in 32 bits.
#[inline]
pub const fn validate_physical(addr: usize) -> bool {
    addr <= u32::MAX as usize
}

/// Virtual addresses must fit in 32 bits.
#[inline]
pub const fn validate_virtual(addr: usize) -> bool {
    addr <= u32::MAX as usize
}

std::thread_local! {
    static ACTIVE_DIRECTORY: Cell<usize> = const { Cell::new(0) };
}

/// Records a directory's physical base as the active address space.
pub fn activate_directory(base: PhysicalAddress) {
    ACTIVE_DIRECTORY.with(|d| d.set(base.as_usize()));
}

/// Returns the physical base most recently activated on this thread.
pub fn active_directory() -> PhysicalAddress {
    PhysicalAddress::new(ACTIVE_DIRECTORY.with(|d| d.get()))
}

/// No TLB to invalidate in software.
pub fn flush_tlb_entry(_virt: VirtualAddress) {}

/// No interrupts to mask in software.
pub fn without_interrupts<R>(f: impl FnOnce() -> R) -> R {
    f()
}

/// Emulated physical memory.
///
/// A host buffer with a bump allocator standing in for physical memory.
/// Stored as `u64` words so translated pointers are 8-byte aligned, which
/// the heap's block headers rely on.
pub struct EmulatedMemory {
    words: Vec<u64>,
    next_alloc: AtomicUsize,
}

impl EmulatedMemory {
    /// Creates an emulated memory region of (at least) `size` bytes.
    pub fn new(size: usize) -> Self {
        Self {
            words: vec![0u64; size.div_ceil(8)],
            next_alloc: AtomicUsize::new(0),
        }
    }

    /// Returns the size of the region in bytes.
    pub fn size(&self) -> usize {
        self.words.len() * 8
    }

    /// Allocates a block, returning its physical address, or None when the
    /// region is exhausted. Storage is never reused.
    pub fn allocate(&self, size: usize, align: usize) -> Option<usize> {
        loop {
            let current = self.next_alloc.load(Ordering::Relaxed);
            let aligned = (current + align - 1) & !(align - 1);
            let end = aligned + size;

            if end > self.size() {
                return None;
            }

            if self
                .next_alloc
                .compare_exchange(current, end, Ordering::Relaxed, Ordering::Relaxed)
                .is_ok()
            {
                return Some(aligned);
            }
        }
    }

    /// Translates a physical address to a pointer into the buffer.
    pub fn translate(&self, phys: usize) -> *mut u8 {
        assert!(phys < self.size(), "physical address out of bounds");
        unsafe { (self.words.as_ptr() as *mut u8).add(phys) }
    }

    /// Translates a pointer into the buffer back to a physical address.
    pub fn ptr_to_phys(&self, ptr: *const u8) -> usize {
        let base = self.words.as_ptr() as *const u8;
        let offset = unsafe { ptr.offset_from(base) };
        assert!(offset >= 0, "pointer not within emulated memory");
        assert!(
            (offset as usize) < self.size(),
            "pointer not within emulated memory"
        );
        offset as usize
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bump_allocation_respects_alignment() {
        let mem = EmulatedMemory::new(4 * PAGE_SIZE);
        let a = mem.allocate(24, 8).unwrap();
        let b = mem.allocate(PAGE_SIZE, PAGE_SIZE).unwrap();
        assert_eq!(a % 8, 0);
        assert_eq!(b % PAGE_SIZE, 0);
        assert!(b >= a + 24);
    }

    #[test]
    fn exhaustion_returns_none() {
        let mem = EmulatedMemory::new(PAGE_SIZE);
        assert!(mem.allocate(PAGE_SIZE, PAGE_SIZE).is_some());
        assert!(mem.allocate(1, 1).is_none());
    }

    #[test]
    fn translation_round_trips() {
        let mem = EmulatedMemory::new(PAGE_SIZE);
        let phys = mem.allocate(64, 8).unwrap();
        let ptr = mem.translate(phys);
        assert_eq!(mem.ptr_to_phys(ptr), phys);
    }
}
