//! The slob heap: first-fit free-list allocation for small kernel objects.
//!
//! The heap hands out blocks measured in 8-byte units, each preceded by a
//! one-unit header. Free blocks form a singly linked list threaded through
//! the headers; allocation walks it first-fit, splitting oversized blocks
//! and growing the heap one page at a time when nothing fits. Freed blocks
//! are prepended without coalescing.

use spin::Mutex;

use crate::{AddressTranslator, FrameAllocator, PhysicalAddress, VirtualAddress, arch};

/// Allocation granularity in bytes, the size of one block header.
pub const UNIT: usize = core::mem::size_of::<BlockHeader>();

/// Requests at or above this many bytes do not fit a single heap page once
/// the header is accounted for.
const BIG_ALLOC: usize = arch::PAGE_SIZE - UNIT;

/// Free-list terminator. Physical page zero is never part of the heap.
const NIL: u32 = 0;

#[cfg(debug_assertions)]
const POISON: u8 = 0xBB;

/// Header preceding every heap block, free or allocated.
///
/// `next` is the physical address of the next free block's header, [`NIL`]
/// at the end of the list. Links are physical addresses rather than raw
/// pointers, so the list reads the same from every address space.
#[repr(C)]
struct BlockHeader {
    next: u32,
    units: u32,
}

/// The kernel heap.
///
/// The free list is guarded by a plain spin lock, so the heap must not be
/// used from interrupt context.
pub struct Heap<'a> {
    head: Mutex<u32>,
    frames: &'a dyn FrameAllocator,
}

impl<'a> Heap<'a> {
    /// Creates an empty heap over the given frame allocator. No memory is
    /// claimed until the first allocation.
    pub const fn new(frames: &'a dyn FrameAllocator) -> Self {
        Self {
            head: Mutex::new(NIL),
            frames,
        }
    }

    /// Allocates `size` bytes, growing the heap a page at a time as needed.
    ///
    /// # Panics
    ///
    /// Panics when `size` needs more than one page of heap, and when the
    /// frame allocator cannot supply another page.
    pub fn allocate(&self, size: usize) -> VirtualAddress {
        if size >= BIG_ALLOC {
            panic!("slob: large allocations are unimplemented");
        }
        let units = size.div_ceil(UNIT).max(1) as u32;

        let mut head = self.head.lock();
        loop {
            let mut prev = NIL;
            let mut cursor = *head;
            while cursor != NIL {
                // SAFETY: The cursor came off the free list, which only
                // holds headers this heap wrote.
                let block = unsafe { &mut *Self::header_ptr(cursor) };
                if block.units == units {
                    let next = block.next;
                    self.relink(&mut head, prev, next);
                    return self.take(cursor, units);
                }
                if block.units > units {
                    // Carve the request off the front; the remainder gets
                    // its own header and takes the block's place in the
                    // list.
                    let rest = cursor + (units + 1) * UNIT as u32;
                    let next = block.next;
                    let rest_units = block.units - units - 1;
                    // SAFETY: `rest` lies within the block being split.
                    unsafe {
                        let rest_header = &mut *Self::header_ptr(rest);
                        rest_header.units = rest_units;
                        rest_header.next = next;
                    }
                    self.relink(&mut head, prev, rest);
                    return self.take(cursor, units);
                }
                prev = cursor;
                cursor = block.next;
            }
            self.morecore(&mut head);
        }
    }

    /// Returns an allocation to the free list.
    ///
    /// No coalescing: the block keeps its size and is prepended as-is, so
    /// the next same-size request reuses it immediately.
    ///
    /// # Panics
    ///
    /// Panics on page-aligned addresses, which cannot have come from
    /// [`allocate`](Self::allocate).
    pub fn free(&self, address: VirtualAddress) {
        let payload = PhysicalAddress::from_direct_mapped(address);
        if payload.is_aligned(arch::PAGE_SIZE) {
            panic!("slob: large frees are unimplemented");
        }
        let block = (payload.as_usize() - UNIT) as u32;

        let mut head = self.head.lock();
        // SAFETY: The address came out of allocate, so a header precedes
        // it.
        unsafe {
            let header = &mut *Self::header_ptr(block);
            #[cfg(debug_assertions)]
            core::ptr::write_bytes(
                address.as_mut_ptr::<u8>(),
                POISON,
                header.units as usize * UNIT,
            );
            header.next = *head;
        }
        *head = block;
    }

    /// Number of blocks on the free list.
    pub fn free_blocks(&self) -> usize {
        let head = self.head.lock();
        let mut count = 0;
        let mut cursor = *head;
        while cursor != NIL {
            count += 1;
            // SAFETY: The cursor came off the free list.
            cursor = unsafe { (*Self::header_ptr(cursor)).next };
        }
        count
    }

    /// Total free capacity in units, excluding headers.
    pub fn free_units(&self) -> usize {
        let head = self.head.lock();
        let mut total = 0;
        let mut cursor = *head;
        while cursor != NIL {
            // SAFETY: The cursor came off the free list.
            let block = unsafe { &*Self::header_ptr(cursor) };
            total += block.units as usize;
            cursor = block.next;
        }
        total
    }

    /// Claims a block off the list, returning the payload address.
    fn take(&self, block: u32, units: u32) -> VirtualAddress {
        // SAFETY: The block was carved out under the list lock.
        unsafe {
            let header = &mut *Self::header_ptr(block);
            header.units = units;
            header.next = NIL;
        }
        let payload = PhysicalAddress::new(block as usize + UNIT);
        let virt = VirtualAddress::direct_mapped(payload);
        #[cfg(debug_assertions)]
        // SAFETY: The payload spans `units` whole units past the header.
        unsafe {
            core::ptr::write_bytes(virt.as_mut_ptr::<u8>(), POISON, units as usize * UNIT);
        }
        virt
    }

    /// Grows the heap by one page, prepending it as a single free block.
    ///
    /// # Panics
    ///
    /// Panics when the frame allocator is exhausted. The heap underpins
    /// every other kernel subsystem; there is no one to report failure to.
    fn morecore(&self, head: &mut u32) {
        let frame = match self.frames.allocate_frames(0) {
            Ok(frame) => frame,
            Err(_) => panic!("slob: out of physical memory growing the heap"),
        };
        let base = frame.as_usize() as u32;
        // SAFETY: The frame was just handed to us; its first unit becomes
        // the page block's header.
        unsafe {
            let header = &mut *Self::header_ptr(base);
            header.units = ((arch::PAGE_SIZE - UNIT) / UNIT) as u32;
            header.next = *head;
        }
        *head = base;
        log::debug!(target: "slob", "heap grown by one page at {frame}");
    }

    /// Unlinks the successor of `prev` by pointing it at `next`.
    fn relink(&self, head: &mut u32, prev: u32, next: u32) {
        if prev == NIL {
            *head = next;
        } else {
            // SAFETY: `prev` is a live free-list header.
            unsafe { (*Self::header_ptr(prev)).next = next };
        }
    }

    fn header_ptr(phys: u32) -> *mut BlockHeader {
        AddressTranslator::current().phys_to_ptr(phys as usize)
    }
}
