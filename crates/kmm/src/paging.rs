//! Virtual-memory management: address-space setup, switching, and page-fault
//! handling.

use crate::{
    AllocError, FaultInfo, FrameAllocator, PageDirectory, PageEntry, PageFlags, PageTable,
    PhysicalAddress, VirtualAddress, arch,
    page_table::ENTRY_COUNT,
};

/// A virtual span backed one-to-one by physical memory at the same address,
/// mapped eagerly during initialization. Describes the kernel image.
#[derive(Debug, Clone, Copy)]
pub struct MappedSpan {
    start: VirtualAddress,
    pages: usize,
}

impl MappedSpan {
    /// Creates a span of `pages` pages starting at `start`.
    ///
    /// # Panics
    ///
    /// Panics if `start` is not page-aligned.
    pub fn new(start: VirtualAddress, pages: usize) -> Self {
        assert!(
            start.is_aligned(arch::PAGE_SIZE),
            "span start must be page-aligned"
        );
        Self { start, pages }
    }
}

/// A virtual span populated on demand: kernel accesses inside it are mapped
/// by the fault handler instead of up front.
#[derive(Debug, Clone, Copy)]
pub struct LazySpan {
    start: VirtualAddress,
    end: VirtualAddress,
}

impl LazySpan {
    /// Creates the half-open span `start..end`.
    ///
    /// # Panics
    ///
    /// Panics if `start` is not page-aligned or the span is inverted.
    pub fn new(start: VirtualAddress, end: VirtualAddress) -> Self {
        assert!(
            start.is_aligned(arch::PAGE_SIZE),
            "span start must be page-aligned"
        );
        assert!(start <= end, "span end precedes its start");
        Self { start, end }
    }

    pub fn contains(&self, addr: VirtualAddress) -> bool {
        self.start <= addr && addr < self.end
    }
}

/// The paging manager: owns the kernel's template directory and tracks the
/// active address space.
pub struct Paging<'a> {
    frames: &'a dyn FrameAllocator,
    kernel: PageDirectory,
    current: PhysicalAddress,
    lazy: LazySpan,
}

impl<'a> Paging<'a> {
    /// Builds the kernel address space and activates it.
    ///
    /// The `image` span is mapped one-to-one so the executing kernel keeps
    /// working the instant translation turns on. The `lazy` span is left
    /// unmapped; kernel faults inside it are satisfied on demand.
    pub fn init(
        frames: &'a dyn FrameAllocator,
        image: MappedSpan,
        lazy: LazySpan,
    ) -> Result<Self, AllocError> {
        let mut kernel = PageDirectory::allocate(frames)?;
        for page in 0..image.pages {
            let virt = VirtualAddress::new(image.start.as_usize() + page * arch::PAGE_SIZE);
            let entry = kernel.entry_or_create(virt, frames)?;
            *entry = PageEntry::new(
                PhysicalAddress::new(virt.as_usize()),
                PageFlags::mapping(true, true),
            );
        }

        let base = kernel.physical_address();
        arch::activate_directory(base);
        log::info!(
            target: "paging",
            "kernel address space active at {base}; {} image pages mapped, lazy span {}..{}",
            image.pages,
            lazy.start,
            lazy.end,
        );

        Ok(Self {
            frames,
            kernel,
            current: base,
            lazy,
        })
    }

    /// Switches to another address space.
    ///
    /// The base-register write and the bookkeeping update happen with
    /// interrupts masked so a fault cannot observe them out of step.
    pub fn change_directory(&mut self, dir: &PageDirectory) {
        let base = dir.physical_address();
        arch::without_interrupts(|| {
            arch::activate_directory(base);
            self.current = base;
        });
    }

    /// Backs `entry` with a fresh frame. Already-present entries are left
    /// untouched.
    pub fn alloc_frame(
        &self,
        entry: &mut PageEntry,
        kernel: bool,
        writable: bool,
        virt: VirtualAddress,
    ) -> Result<(), AllocError> {
        if entry.is_present() {
            return Ok(());
        }
        install_frame(self.frames, entry, kernel, writable, virt)
    }

    /// Unmaps the page covering `virt` in `dir` and returns its frame.
    /// Does nothing when the page was never mapped.
    pub fn free_frame(&self, virt: VirtualAddress, dir: &mut PageDirectory) {
        remove_mapping(self.frames, dir, virt);
    }

    /// One-argument form of [`free_frame`](Self::free_frame) resolving
    /// against the kernel's template directory, which covers kernel
    /// mappings and demand-mapped pages.
    pub fn free_kernel_frame(&mut self, virt: VirtualAddress) {
        let frames = self.frames;
        remove_mapping(frames, &mut self.kernel, virt);
    }

    /// Handles a page fault.
    ///
    /// Kernel misses inside the lazy span are satisfied by mapping a fresh
    /// frame. Everything else is fatal: protection violations, reserved-bit
    /// violations, user-mode faults, and kernel accesses outside the
    /// managed spans all indicate a bug this kernel cannot recover from.
    ///
    /// # Panics
    ///
    /// Panics on every fault it does not demand-map, and on any fault that
    /// arrives while the kernel tables are mid-mutation.
    pub fn handle_fault(&mut self, fault: &FaultInfo) {
        if self.kernel.is_mutating() {
            panic!(
                "page fault at {} during page-table mutation",
                fault.address
            );
        }

        // A reserved-bit violation means a corrupted paging structure even
        // when the page itself is absent; never map over it.
        let demand = !fault.code.present()
            && !fault.code.user()
            && !fault.code.reserved()
            && self.lazy.contains(fault.address);
        if demand {
            let page = fault.address.align_down(arch::PAGE_SIZE);
            let frames = self.frames;
            let entry = match self.kernel.entry_or_create(page, frames) {
                Ok(entry) => entry,
                Err(_) => panic!("out of physical memory demand-mapping {page}"),
            };
            if entry.is_present() {
                // Another path mapped the page since the fault was raised;
                // retrying the access is enough.
                arch::flush_tlb_entry(fault.address);
                return;
            }
            if install_frame(frames, entry, true, true, page).is_err() {
                panic!("out of physical memory demand-mapping {page}");
            }
            log::debug!(
                target: "paging",
                "demand-mapped {page} for access at {}",
                fault.address,
            );
            return;
        }

        log::error!(
            target: "paging",
            "unrecoverable page fault: {} at {} (ip {})",
            fault.code,
            fault.address,
            fault.instruction_pointer,
        );
        panic!(
            "unrecoverable page fault: {} at {}",
            fault.code, fault.address
        );
    }

    /// Creates a new address space sharing the kernel's tables.
    pub fn create_directory(&self) -> Result<PageDirectory, AllocError> {
        let mut dir = PageDirectory::allocate(self.frames)?;
        dir.share_slots_from(&self.kernel);
        Ok(dir)
    }

    /// Tears down an address space, returning its private tables and the
    /// directory frame. Tables shared with the kernel template are spared.
    ///
    /// Destroying the active address space switches back to the kernel's
    /// first.
    pub fn destroy_directory(&mut self, dir: PageDirectory) {
        if self.current == dir.physical_address() {
            let base = self.kernel.physical_address();
            arch::without_interrupts(|| {
                arch::activate_directory(base);
                self.current = base;
            });
        }

        for index in 0..ENTRY_COUNT {
            let Some(table) = dir.slot(index).frame() else {
                continue;
            };
            if self.kernel.slot(index).frame() != Some(table) {
                PageTable::from_physical(table).free(self.frames);
            }
        }
        self.frames.free_frames(dir.physical_address(), 0);
    }

    /// Physical base of the active address space.
    pub fn current_directory(&self) -> PhysicalAddress {
        self.current
    }

    /// The kernel's template directory.
    pub fn kernel_directory(&mut self) -> &mut PageDirectory {
        &mut self.kernel
    }
}

fn install_frame(
    frames: &dyn FrameAllocator,
    entry: &mut PageEntry,
    kernel: bool,
    writable: bool,
    virt: VirtualAddress,
) -> Result<(), AllocError> {
    let frame = frames.allocate_frames(0)?;
    *entry = PageEntry::new(frame, PageFlags::mapping(kernel, writable));
    arch::flush_tlb_entry(virt);
    Ok(())
}

fn remove_mapping(frames: &dyn FrameAllocator, dir: &mut PageDirectory, virt: VirtualAddress) {
    let page = virt.align_down(arch::PAGE_SIZE);
    let Some(entry) = dir.entry(page) else {
        return;
    };
    let Some(frame) = entry.frame() else {
        return;
    };
    entry.clear();
    frames.free_frames(frame, 0);
    arch::flush_tlb_entry(virt);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{AddressTranslator, EmulatedFrameAllocator, PageFaultCode};

    const IMAGE_START: usize = 0x0010_0000;
    const LAZY_START: usize = 0xD000_0000;
    const LAZY_END: usize = 0xD010_0000;

    fn setup() {
        if AddressTranslator::try_current().is_none() {
            AddressTranslator::set_current(AddressTranslator::emulated(512 * 1024));
        }
    }

    fn build(frames: &EmulatedFrameAllocator) -> Paging<'_> {
        Paging::init(
            frames,
            MappedSpan::new(VirtualAddress::new(IMAGE_START), 4),
            LazySpan::new(
                VirtualAddress::new(LAZY_START),
                VirtualAddress::new(LAZY_END),
            ),
        )
        .unwrap()
    }

    fn fault(address: usize, code: u32) -> FaultInfo {
        FaultInfo {
            address: VirtualAddress::new(address),
            instruction_pointer: VirtualAddress::new(IMAGE_START),
            code: PageFaultCode::from_raw(code),
        }
    }

    #[test]
    fn init_identity_maps_the_image_and_activates() {
        setup();
        let frames = EmulatedFrameAllocator::new();
        let mut paging = build(&frames);

        assert_eq!(arch::active_directory(), paging.current_directory());

        for page in 0..4 {
            let virt = VirtualAddress::new(IMAGE_START + page * arch::PAGE_SIZE);
            let entry = paging.kernel_directory().entry(virt).unwrap();
            assert_eq!(entry.frame(), Some(PhysicalAddress::new(virt.as_usize())));
            assert!(entry.flags().is_writable());
            assert!(!entry.flags().is_user());
        }
    }

    #[test]
    fn alloc_frame_is_idempotent() {
        setup();
        let frames = EmulatedFrameAllocator::new();
        let paging = build(&frames);
        let virt = VirtualAddress::new(0xC000_0000);

        let mut dir = paging.create_directory().unwrap();
        let entry = dir.entry_or_create(virt, &frames).unwrap();
        paging.alloc_frame(entry, true, true, virt).unwrap();
        let mapped = entry.frame();
        assert!(mapped.is_some());

        let before = frames.allocated_frames();
        paging.alloc_frame(entry, true, false, virt).unwrap();
        assert_eq!(frames.allocated_frames(), before, "second call must not allocate");
        assert_eq!(entry.frame(), mapped, "mapping must be untouched");
    }

    #[test]
    fn free_frame_returns_the_frame_once() {
        setup();
        let frames = EmulatedFrameAllocator::new();
        let paging = build(&frames);
        let virt = VirtualAddress::new(0xC000_3000);

        let mut dir = paging.create_directory().unwrap();
        let entry = dir.entry_or_create(virt, &frames).unwrap();
        paging.alloc_frame(entry, true, true, virt).unwrap();

        let before = frames.freed_frames();
        paging.free_frame(virt, &mut dir);
        assert_eq!(frames.freed_frames(), before + 1);
        assert!(!dir.entry(virt).unwrap().is_present());

        // Freeing again, and freeing a never-mapped page, are no-ops.
        paging.free_frame(virt, &mut dir);
        paging.free_frame(VirtualAddress::new(0x4000_0000), &mut dir);
        assert_eq!(frames.freed_frames(), before + 1);
    }

    #[test]
    fn change_directory_switches_the_active_space() {
        setup();
        let frames = EmulatedFrameAllocator::new();
        let mut paging = build(&frames);

        let dir = paging.create_directory().unwrap();
        paging.change_directory(&dir);

        assert_eq!(paging.current_directory(), dir.physical_address());
        assert_eq!(arch::active_directory(), dir.physical_address());
    }

    #[test]
    fn created_directories_share_the_kernel_tables() {
        setup();
        let frames = EmulatedFrameAllocator::new();
        let mut paging = build(&frames);
        let image = VirtualAddress::new(IMAGE_START);

        let mut dir = paging.create_directory().unwrap();

        let index = image.directory_index();
        assert_eq!(dir.slot(index), paging.kernel_directory().slot(index));
        assert_eq!(
            dir.entry(image).unwrap().frame(),
            Some(PhysicalAddress::new(IMAGE_START))
        );
    }

    #[test]
    fn destroy_spares_shared_tables() {
        setup();
        let frames = EmulatedFrameAllocator::new();
        let mut paging = build(&frames);

        let mut dir = paging.create_directory().unwrap();
        // A private table in a slot the kernel template leaves empty.
        dir.entry_or_create(VirtualAddress::new(0x4000_0000), &frames)
            .unwrap();

        let before = frames.freed_frames();
        paging.destroy_directory(dir);

        // One private table plus the directory frame; the shared kernel
        // tables stay.
        assert_eq!(frames.freed_frames(), before + 2);
    }

    #[test]
    fn destroying_the_active_space_falls_back_to_the_kernel() {
        setup();
        let frames = EmulatedFrameAllocator::new();
        let mut paging = build(&frames);

        let dir = paging.create_directory().unwrap();
        paging.change_directory(&dir);
        paging.destroy_directory(dir);

        assert_eq!(paging.current_directory(), paging.kernel.physical_address());
        assert_eq!(arch::active_directory(), paging.current_directory());
    }

    #[test]
    fn kernel_miss_in_the_lazy_span_is_demand_mapped() {
        setup();
        let frames = EmulatedFrameAllocator::new();
        let mut paging = build(&frames);
        let address = LAZY_START + 0x2ABC;

        let before = frames.allocated_frames();
        paging.handle_fault(&fault(address, PageFaultCode::WRITE));

        // One table, one data frame.
        assert_eq!(frames.allocated_frames(), before + 2);
        let page = VirtualAddress::new(address).align_down(arch::PAGE_SIZE);
        let entry = paging.kernel_directory().entry(page).unwrap();
        assert!(entry.is_present());
        assert!(entry.flags().is_writable());
        assert!(!entry.flags().is_user());
    }

    #[test]
    fn repeated_faults_in_one_page_allocate_once() {
        setup();
        let frames = EmulatedFrameAllocator::new();
        let mut paging = build(&frames);

        paging.handle_fault(&fault(LAZY_START, 0));
        let after_first = frames.allocated_frames();
        paging.handle_fault(&fault(LAZY_START + 8, 0));
        assert_eq!(frames.allocated_frames(), after_first);
    }

    #[test]
    #[should_panic(expected = "unrecoverable page fault")]
    fn protection_violations_are_fatal() {
        setup();
        let frames = EmulatedFrameAllocator::new();
        let mut paging = build(&frames);
        paging.handle_fault(&fault(
            LAZY_START,
            PageFaultCode::PRESENT | PageFaultCode::WRITE,
        ));
    }

    #[test]
    fn free_kernel_frame_reclaims_demand_mapped_pages() {
        setup();
        let frames = EmulatedFrameAllocator::new();
        let mut paging = build(&frames);

        paging.handle_fault(&fault(LAZY_START, PageFaultCode::WRITE));
        let before = frames.freed_frames();

        paging.free_kernel_frame(VirtualAddress::new(LAZY_START + 0x10));
        assert_eq!(frames.freed_frames(), before + 1);
        let page = VirtualAddress::new(LAZY_START);
        assert!(!paging.kernel_directory().entry(page).unwrap().is_present());

        // Freeing the already-unmapped page is a no-op.
        paging.free_kernel_frame(page);
        assert_eq!(frames.freed_frames(), before + 1);
    }

    #[test]
    #[should_panic(expected = "unrecoverable page fault")]
    fn reserved_bit_faults_are_fatal() {
        setup();
        let frames = EmulatedFrameAllocator::new();
        let mut paging = build(&frames);
        // Reserved bit with PRESENT clear, inside the lazy span: a
        // corrupted paging structure must halt, not be demand-mapped.
        paging.handle_fault(&fault(LAZY_START, PageFaultCode::RESERVED));
    }

    #[test]
    #[should_panic(expected = "unrecoverable page fault")]
    fn user_faults_are_fatal() {
        setup();
        let frames = EmulatedFrameAllocator::new();
        let mut paging = build(&frames);
        paging.handle_fault(&fault(LAZY_START, PageFaultCode::USER));
    }

    #[test]
    #[should_panic(expected = "unrecoverable page fault")]
    fn kernel_misses_outside_the_lazy_span_are_fatal() {
        setup();
        let frames = EmulatedFrameAllocator::new();
        let mut paging = build(&frames);
        paging.handle_fault(&fault(0x4000_0000, PageFaultCode::WRITE));
    }

    #[test]
    #[should_panic(expected = "during page-table mutation")]
    fn faults_during_table_mutation_are_fatal() {
        setup();
        let frames = EmulatedFrameAllocator::new();
        let mut paging = build(&frames);
        paging.kernel.mark_mutating();
        paging.handle_fault(&fault(LAZY_START, 0));
    }
}
