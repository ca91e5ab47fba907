//! Page directories: the per-address-space mapping roots.

use core::sync::atomic::{AtomicBool, Ordering};

use crate::{
    AddressTranslator, AllocError, FrameAllocator, PageEntry, PageFlags, PageTable,
    PhysicalAddress, VirtualAddress,
    page_table::ENTRY_COUNT,
};

/// A page directory: one physical frame holding 1024 slots, each either
/// empty or owning a page table.
///
/// A slot is a single 32-bit word carrying both the owned table's physical
/// base and the ownership mark (the present bit), so the two can never fall
/// out of step. The directory's own physical base is the value loaded into
/// the page-table-base register.
pub struct PageDirectory {
    phys: PhysicalAddress,
    /// Set while a table allocation is registering a new slot. A page
    /// fault arriving in that window is fatal, not recoverable.
    mutating: AtomicBool,
}

impl PageDirectory {
    /// Allocates an empty page directory.
    pub fn allocate(frames: &dyn FrameAllocator) -> Result<Self, AllocError> {
        let phys = frames.allocate_frames(0)?;
        let dir = Self {
            phys,
            mutating: AtomicBool::new(false),
        };
        // SAFETY: The frame was just handed to us and spans ENTRY_COUNT
        // slots exactly.
        unsafe { core::ptr::write_bytes(dir.base_ptr(), 0, ENTRY_COUNT) };
        Ok(dir)
    }

    /// Returns the physical base of this directory.
    pub fn physical_address(&self) -> PhysicalAddress {
        self.phys
    }

    /// Reads the directory slot at `index`.
    ///
    /// # Panics
    ///
    /// Panics if `index` is out of bounds.
    pub fn slot(&self, index: usize) -> PageEntry {
        assert!(index < ENTRY_COUNT, "page directory index out of bounds");
        // SAFETY: Index checked; the frame holds ENTRY_COUNT slots.
        unsafe { *self.base_ptr().add(index) }
    }

    /// Returns the entry covering `virt`, or None when no table covers it.
    /// Never allocates.
    pub fn entry(&mut self, virt: VirtualAddress) -> Option<&mut PageEntry> {
        let base = self.slot(virt.directory_index()).frame()?;
        let table = PageTable::from_physical(base);
        // SAFETY: The slot owns a live table; exclusive access follows
        // from &mut self.
        Some(unsafe { &mut *table.entry_ptr(virt.table_index()) })
    }

    /// Returns the entry covering `virt`, allocating and registering a
    /// zeroed covering table on first touch.
    ///
    /// # Panics
    ///
    /// Panics when re-entered while a table mutation is already underway
    /// (a nested page fault inside the paging manager).
    pub fn entry_or_create(
        &mut self,
        virt: VirtualAddress,
        frames: &dyn FrameAllocator,
    ) -> Result<&mut PageEntry, AllocError> {
        if self.mutating.swap(true, Ordering::Acquire) {
            panic!("page directory re-entered during table mutation");
        }
        let result = self.locate_or_create(virt, frames);
        self.mutating.store(false, Ordering::Release);
        let entry = result?;
        // SAFETY: The pointer targets a live table owned by this
        // directory; exclusive access follows from &mut self.
        Ok(unsafe { &mut *entry })
    }

    /// Copies every present slot of `template` into this directory.
    ///
    /// The tables stay owned by the template; the copies share them by
    /// entry. Used to stamp the kernel template into new directories.
    pub fn share_slots_from(&mut self, template: &PageDirectory) {
        for index in 0..ENTRY_COUNT {
            let slot = template.slot(index);
            if slot.is_present() {
                self.set_slot(index, slot);
            }
        }
    }

    /// True while a table mutation is underway on this directory.
    pub(crate) fn is_mutating(&self) -> bool {
        self.mutating.load(Ordering::Acquire)
    }

    /// Simulates a fault arriving mid-mutation.
    #[cfg(test)]
    pub(crate) fn mark_mutating(&self) {
        self.mutating.store(true, Ordering::Release);
    }

    fn locate_or_create(
        &mut self,
        virt: VirtualAddress,
        frames: &dyn FrameAllocator,
    ) -> Result<*mut PageEntry, AllocError> {
        let index = virt.directory_index();
        let table = match self.slot(index).frame() {
            Some(base) => PageTable::from_physical(base),
            None => {
                let table = PageTable::allocate(frames)?;
                // One word registers both the table's identity and its
                // ownership. Access control is enforced per page entry, so
                // the slot is maximally permissive.
                let mut flags = PageFlags::empty();
                flags.set_present(true);
                flags.set_writable(true);
                flags.set_user(true);
                self.set_slot(index, PageEntry::new(table.physical_address(), flags));
                table
            }
        };
        Ok(table.entry_ptr(virt.table_index()))
    }

    fn set_slot(&mut self, index: usize, entry: PageEntry) {
        assert!(index < ENTRY_COUNT, "page directory index out of bounds");
        // SAFETY: Index checked; the frame holds ENTRY_COUNT slots.
        unsafe { *self.base_ptr().add(index) = entry };
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
            AddressTranslator::set_current(AddressTranslator::emulated(256 * 1024));
        }
    }

    #[test]
    fn absent_table_yields_no_entry() {
        setup();
        let frames = EmulatedFrameAllocator::new();
        let mut dir = PageDirectory::allocate(&frames).unwrap();

        let before = frames.allocated_frames();
        assert!(dir.entry(VirtualAddress::new(0x0040_0000)).is_none());
        assert_eq!(frames.allocated_frames(), before, "lookup must not allocate");
    }

    #[test]
    fn first_touch_allocates_exactly_one_table() {
        setup();
        let frames = EmulatedFrameAllocator::new();
        let mut dir = PageDirectory::allocate(&frames).unwrap();
        let addr = VirtualAddress::new(0x0040_3000);

        let before = frames.allocated_frames();
        dir.entry_or_create(addr, &frames).unwrap();
        assert_eq!(frames.allocated_frames(), before + 1);

        // Same address, and a neighbor under the same table: no new frame.
        dir.entry_or_create(addr, &frames).unwrap();
        dir.entry_or_create(VirtualAddress::new(0x0040_4000), &frames)
            .unwrap();
        assert_eq!(frames.allocated_frames(), before + 1);
    }

    #[test]
    fn slot_and_entry_stay_in_lock_step() {
        setup();
        let frames = EmulatedFrameAllocator::new();
        let mut dir = PageDirectory::allocate(&frames).unwrap();
        let addr = VirtualAddress::new(0x0800_0000);

        assert!(!dir.slot(addr.directory_index()).is_present());
        dir.entry_or_create(addr, &frames).unwrap();

        let slot = dir.slot(addr.directory_index());
        assert!(slot.is_present());
        assert!(slot.frame().is_some());
        assert!(dir.entry(addr).is_some());
    }

    #[test]
    fn shared_slots_reach_the_same_table() {
        setup();
        let frames = EmulatedFrameAllocator::new();
        let mut template = PageDirectory::allocate(&frames).unwrap();
        let addr = VirtualAddress::new(0xC010_0000);

        let entry = template.entry_or_create(addr, &frames).unwrap();
        *entry = PageEntry::new(
            PhysicalAddress::new(0x0020_0000),
            PageFlags::mapping(true, true),
        );

        let mut dir = PageDirectory::allocate(&frames).unwrap();
        dir.share_slots_from(&template);

        assert_eq!(
            dir.slot(addr.directory_index()),
            template.slot(addr.directory_index())
        );
        let shared = dir.entry(addr).unwrap();
        assert_eq!(shared.frame(), Some(PhysicalAddress::new(0x0020_0000)));
    }

    #[test]
    #[should_panic(expected = "re-entered during table mutation")]
    fn nested_mutation_is_fatal() {
        setup();
        let frames = EmulatedFrameAllocator::new();
        let mut dir = PageDirectory::allocate(&frames).unwrap();

        dir.mutating.store(true, Ordering::Release);
        let _ = dir.entry_or_create(VirtualAddress::new(0x0040_0000), &frames);
    }
}
