//! Frame-backed page tables.

use crate::{AddressTranslator, AllocError, FrameAllocator, PageEntry, PhysicalAddress};

/// Number of entries in a page table, and of slots in a page directory.
pub const ENTRY_COUNT: usize = 1024;

/// A page table: one physical frame holding 1024 entries.
///
/// The handle identifies the backing frame; storage is reached through the
/// address translator. Tables are allocated from the frame allocator, never
/// from the kernel heap, so paging can run before the heap exists.
pub struct PageTable {
    phys: PhysicalAddress,
}

impl PageTable {
    /// Allocates a zero-initialized page table.
    pub fn allocate(frames: &dyn FrameAllocator) -> Result<Self, AllocError> {
        let phys = frames.allocate_frames(0)?;
        let table = Self { phys };
        // SAFETY: The frame was just handed to us and spans ENTRY_COUNT
        // entries exactly.
        unsafe { core::ptr::write_bytes(table.base_ptr(), 0, ENTRY_COUNT) };
        Ok(table)
    }

    /// Rebuilds a handle from a directory slot.
    ///
    /// The caller asserts the slot owns a live table at `phys`.
    pub(crate) fn from_physical(phys: PhysicalAddress) -> Self {
        Self { phys }
    }

    /// Returns the physical base of this table, the value a directory slot
    /// carries.
    pub fn physical_address(&self) -> PhysicalAddress {
        self.phys
    }

    /// Reads the entry at `index`.
    ///
    /// # Panics
    ///
    /// Panics if `index` is out of bounds.
    pub fn entry(&self, index: usize) -> PageEntry {
        assert!(index < ENTRY_COUNT, "page table index out of bounds");
        // SAFETY: Index checked; the frame holds ENTRY_COUNT entries.
        unsafe { *self.base_ptr().add(index) }
    }

    /// Raw pointer to the entry at `index`, for callers that manage the
    /// borrow themselves (the directory walk).
    pub(crate) fn entry_ptr(&self, index: usize) -> *mut PageEntry {
        assert!(index < ENTRY_COUNT, "page table index out of bounds");
        // SAFETY: Index checked; the frame holds ENTRY_COUNT entries.
        unsafe { self.base_ptr().add(index) }
    }

    /// Releases the backing frame.
    pub fn free(self, frames: &dyn FrameAllocator) {
        frames.free_frames(self.phys, 0);
    }

    fn base_ptr(&self) -> *mut PageEntry {
        AddressTranslator::current().phys_to_ptr(self.phys.as_usize())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::EmulatedFrameAllocator;

    fn setup() {
        if AddressTranslator::try_current().is_none() {
            AddressTranslator::set_current(AddressTranslator::emulated(64 * 1024));
        }
    }

    #[test]
    fn allocates_zeroed() {
        setup();
        let frames = EmulatedFrameAllocator::new();
        let table = PageTable::allocate(&frames).unwrap();
        for index in [0, 1, 511, 1023] {
            assert!(!table.entry(index).is_present());
        }
    }

    #[test]
    fn entries_are_independent() {
        setup();
        let frames = EmulatedFrameAllocator::new();
        let table = PageTable::allocate(&frames).unwrap();

        unsafe {
            *table.entry_ptr(7) = PageEntry::new(
                PhysicalAddress::new(0x5000),
                crate::PageFlags::mapping(true, true),
            );
        }

        assert!(table.entry(7).is_present());
        assert!(!table.entry(6).is_present());
        assert!(!table.entry(8).is_present());
    }

    #[test]
    fn free_returns_the_frame() {
        setup();
        let frames = EmulatedFrameAllocator::new();
        let table = PageTable::allocate(&frames).unwrap();
        table.free(&frames);
        assert_eq!(frames.freed_frames(), 1);
    }

    #[test]
    #[should_panic(expected = "page table index out of bounds")]
    fn rejects_out_of_bounds_index() {
        setup();
        let frames = EmulatedFrameAllocator::new();
        let table = PageTable::allocate(&frames).unwrap();
        table.entry(ENTRY_COUNT);
    }
}
