//! The physical frame allocator seam.

use crate::PhysicalAddress;

/// Errors returned by the frame allocator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AllocError {
    /// No contiguous run of frames satisfies the request.
    OutOfMemory,
    /// The requested order exceeds what the allocator supports.
    OrderTooLarge,
}

/// The physical frame allocator consumed by this crate.
///
/// `order` is a power-of-two page count: order 0 is one 4 KiB frame, order
/// 1 two contiguous frames, and so on. The allocator is an external
/// collaborator; paging pulls table and frame storage from it directly so
/// the kernel heap can bootstrap on top of paging without a circular
/// dependency.
pub trait FrameAllocator {
    /// Allocates 2^order contiguous frames, returning the base address.
    fn allocate_frames(&self, order: usize) -> Result<PhysicalAddress, AllocError>;

    /// Returns 2^order frames starting at `base` to the allocator.
    fn free_frames(&self, base: PhysicalAddress, order: usize);
}

#[cfg(any(test, feature = "software-emulation"))]
pub use emulated::EmulatedFrameAllocator;

#[cfg(any(test, feature = "software-emulation"))]
mod emulated {
    use core::sync::atomic::{AtomicUsize, Ordering};

    use super::{AllocError, FrameAllocator};
    use crate::{AddressTranslator, PhysicalAddress, arch};

    /// Highest order the emulated allocator will serve.
    const MAX_ORDER: usize = 11;

    /// Frame allocator over the emulated physical memory.
    ///
    /// Bump allocation out of the emulated buffer; freed frames are only
    /// counted, never reused. The counters let tests assert exactly how
    /// many frames an operation consumed or returned.
    pub struct EmulatedFrameAllocator {
        allocated: AtomicUsize,
        freed: AtomicUsize,
    }

    impl EmulatedFrameAllocator {
        /// Creates an allocator over the current emulated memory.
        ///
        /// Reserves the zero frame up front: physical page zero is never
        /// handed out, so the heap can use address zero as its list
        /// terminator.
        pub fn new() -> Self {
            let _ = AddressTranslator::current().allocate(arch::PAGE_SIZE, arch::PAGE_SIZE);
            Self {
                allocated: AtomicUsize::new(0),
                freed: AtomicUsize::new(0),
            }
        }

        /// Frames handed out so far.
        pub fn allocated_frames(&self) -> usize {
            self.allocated.load(Ordering::Relaxed)
        }

        /// Frames returned so far.
        pub fn freed_frames(&self) -> usize {
            self.freed.load(Ordering::Relaxed)
        }
    }

    impl Default for EmulatedFrameAllocator {
        fn default() -> Self {
            Self::new()
        }
    }

    impl FrameAllocator for EmulatedFrameAllocator {
        fn allocate_frames(&self, order: usize) -> Result<PhysicalAddress, AllocError> {
            if order > MAX_ORDER {
                return Err(AllocError::OrderTooLarge);
            }
            let bytes = (1usize << order) * arch::PAGE_SIZE;
            let phys = AddressTranslator::current()
                .allocate(bytes, bytes)
                .ok_or(AllocError::OutOfMemory)?;
            self.allocated.fetch_add(1 << order, Ordering::Relaxed);
            Ok(PhysicalAddress::new(phys))
        }

        fn free_frames(&self, _base: PhysicalAddress, order: usize) {
            // Bump storage is never reused; only the statistics move.
            self.freed.fetch_add(1 << order, Ordering::Relaxed);
        }
    }

}
