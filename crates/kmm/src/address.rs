//! Address types for physical and virtual memory management.
//!
//! Physical and virtual addresses are 32-bit values carried in `usize`
//! newtypes. The [`AddressTranslator`] converts physical addresses into
//! usable pointers: through the kernel's permanent direct mapping in
//! production, or through an emulated memory buffer under test.

use core::fmt;

use crate::arch;

#[cfg(any(test, feature = "software-emulation"))]
use crate::arch::EmulatedMemory;

/// Translates physical addresses to pointers and back.
///
/// - `Hardware`: the kernel region is permanently mapped at a fixed offset;
///   translation is an offset add/subtract.
/// - `Emulated`: a simulated physical memory buffer for testing.
pub enum AddressTranslator {
    Hardware { direct_map_offset: usize },
    #[cfg(any(test, feature = "software-emulation"))]
    Emulated(EmulatedMemory),
}

impl AddressTranslator {
    /// Creates a hardware translator with the given direct-map offset.
    pub const fn hardware(direct_map_offset: usize) -> Self {
        Self::Hardware { direct_map_offset }
    }

    /// Creates an emulated translator backed by `size` bytes of memory.
    #[cfg(any(test, feature = "software-emulation"))]
    pub fn emulated(size: usize) -> Self {
        Self::Emulated(EmulatedMemory::new(size))
    }

    /// Sets the process-wide translator. Must run exactly once, before
    /// paging initialization.
    ///
    /// # Panics
    ///
    /// Panics if the translator has already been set.
    pub fn set_current(translator: AddressTranslator) {
        #[cfg(not(any(test, feature = "software-emulation")))]
        {
            if ADDRESS_TRANSLATOR.get().is_some() {
                panic!("address translator already set");
            }
            ADDRESS_TRANSLATOR.call_once(|| translator);
        }

        #[cfg(any(test, feature = "software-emulation"))]
        {
            ADDRESS_TRANSLATOR.with(|t| {
                if t.get().is_some() {
                    panic!("address translator already set");
                }
                t.call_once(|| translator);
            });
        }
    }

    /// Returns the process-wide translator.
    ///
    /// # Panics
    ///
    /// Panics if [`set_current`](Self::set_current) has not run yet.
    pub fn current() -> &'static AddressTranslator {
        #[cfg(not(any(test, feature = "software-emulation")))]
        {
            ADDRESS_TRANSLATOR
                .get()
                .expect("address translator not set; call AddressTranslator::set_current first")
        }

        #[cfg(any(test, feature = "software-emulation"))]
        {
            ADDRESS_TRANSLATOR.with(|t| {
                // SAFETY: The reference is leaked to 'static. Each test
                // thread owns its translator, the spin::Once is never
                // written twice, and the thread-local outlives the thread's
                // work.
                unsafe {
                    &*(t.get().expect(
                        "address translator not set; call AddressTranslator::set_current first",
                    ) as *const AddressTranslator)
                }
            })
        }
    }

    /// Returns the translator if one has been set.
    #[cfg(any(test, feature = "software-emulation"))]
    pub fn try_current() -> Option<&'static AddressTranslator> {
        ADDRESS_TRANSLATOR.with(|t| {
            t.get().map(|translator| {
                // SAFETY: Same reasoning as in `current`.
                unsafe { &*(translator as *const AddressTranslator) }
            })
        })
    }

    /// Translates a physical address to a virtual address.
    pub fn phys_to_virt(&self, phys: usize) -> usize {
        match self {
            Self::Hardware { direct_map_offset } => phys.wrapping_add(*direct_map_offset),
            #[cfg(any(test, feature = "software-emulation"))]
            Self::Emulated(mem) => mem.translate(phys) as usize,
        }
    }

    /// Translates a virtual address back to a physical address.
    pub fn virt_to_phys(&self, virt: usize) -> usize {
        match self {
            Self::Hardware { direct_map_offset } => virt.wrapping_sub(*direct_map_offset),
            #[cfg(any(test, feature = "software-emulation"))]
            Self::Emulated(mem) => mem.ptr_to_phys(virt as *const u8),
        }
    }

    /// Translates a physical address to a typed pointer.
    pub fn phys_to_ptr<T>(&self, phys: usize) -> *mut T {
        self.phys_to_virt(phys) as *mut T
    }

    /// Allocates from the emulated physical memory (test mode only).
    #[cfg(any(test, feature = "software-emulation"))]
    pub fn allocate(&self, size: usize, align: usize) -> Option<usize> {
        match self {
            Self::Hardware { .. } => panic!("cannot allocate from hardware translator"),
            Self::Emulated(mem) => mem.allocate(size, align),
        }
    }
}

/// Process-wide address translator, set once during initialization. Under
/// test it is thread-local so each test owns an emulated memory space.
#[cfg(not(any(test, feature = "software-emulation")))]
static ADDRESS_TRANSLATOR: spin::Once<AddressTranslator> = spin::Once::new();

#[cfg(any(test, feature = "software-emulation"))]
std::thread_local! {
    static ADDRESS_TRANSLATOR: spin::Once<AddressTranslator> = spin::Once::new();
}

/// A physical memory address.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(transparent)]
pub struct PhysicalAddress(usize);

impl PhysicalAddress {
    /// Creates a new physical address.
    ///
    /// # Panics
    ///
    /// Panics if the address does not fit in 32 bits.
    #[inline]
    pub const fn new(addr: usize) -> Self {
        assert!(
            arch::validate_physical(addr),
            "physical address exceeds 32 bits"
        );
        Self(addr)
    }

    /// Converts a direct-mapped virtual address back to a physical address.
    #[inline]
    pub fn from_direct_mapped(virt: VirtualAddress) -> Self {
        let translator = AddressTranslator::current();
        Self::new(translator.virt_to_phys(virt.as_usize()))
    }

    /// Returns the raw address value.
    #[inline]
    pub const fn as_usize(self) -> usize {
        self.0
    }

    /// Checks alignment against a power-of-two boundary.
    #[inline]
    pub const fn is_aligned(self, align: usize) -> bool {
        assert!(align.is_power_of_two(), "alignment must be a power of two");
        self.0 & (align - 1) == 0
    }

    /// Aligns the address down to a power-of-two boundary.
    #[inline]
    pub const fn align_down(self, align: usize) -> Self {
        assert!(align.is_power_of_two(), "alignment must be a power of two");
        Self(self.0 & !(align - 1))
    }
}

impl fmt::Debug for PhysicalAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PhysicalAddress({:#x})", self.0)
    }
}

impl fmt::Display for PhysicalAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

/// A virtual memory address.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(transparent)]
pub struct VirtualAddress(usize);

impl VirtualAddress {
    /// Creates a new virtual address.
    ///
    /// # Panics
    ///
    /// Panics if the address does not fit in 32 bits.
    #[inline]
    pub const fn new(addr: usize) -> Self {
        assert!(
            arch::validate_virtual(addr),
            "virtual address exceeds 32 bits"
        );
        Self(addr)
    }

    /// Creates a virtual address from a physical one through the direct map.
    #[inline]
    pub fn direct_mapped(phys: PhysicalAddress) -> Self {
        let translator = AddressTranslator::current();
        let virt = translator.phys_to_virt(phys.as_usize());

        // Emulated translation yields a host pointer, which is not a valid
        // 32-bit guest address; skip validation there.
        #[cfg(any(test, feature = "software-emulation"))]
        if matches!(translator, AddressTranslator::Emulated(_)) {
            return Self(virt);
        }

        Self::new(virt)
    }

    /// Returns the raw address value.
    #[inline]
    pub const fn as_usize(self) -> usize {
        self.0
    }

    /// Converts the address to a pointer.
    #[inline]
    pub const fn as_ptr<T>(self) -> *const T {
        self.0 as *const T
    }

    /// Converts the address to a mutable pointer.
    #[inline]
    pub const fn as_mut_ptr<T>(self) -> *mut T {
        self.0 as *mut T
    }

    /// Index into the page directory: bits 22-31.
    #[inline]
    pub const fn directory_index(self) -> usize {
        (self.0 >> 22) & 0x3FF
    }

    /// Index into the covering page table: bits 12-21.
    #[inline]
    pub const fn table_index(self) -> usize {
        (self.0 >> 12) & 0x3FF
    }

    /// Offset within the page: bits 0-11.
    #[inline]
    pub const fn page_offset(self) -> usize {
        self.0 & (arch::PAGE_SIZE - 1)
    }

    /// Checks alignment against a power-of-two boundary.
    #[inline]
    pub const fn is_aligned(self, align: usize) -> bool {
        assert!(align.is_power_of_two(), "alignment must be a power of two");
        self.0 & (align - 1) == 0
    }

    /// Aligns the address down to a power-of-two boundary.
    #[inline]
    pub const fn align_down(self, align: usize) -> Self {
        assert!(align.is_power_of_two(), "alignment must be a power of two");
        Self(self.0 & !(align - 1))
    }
}

impl fmt::Debug for VirtualAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "VirtualAddress({:#x})", self.0)
    }
}

impl fmt::Display for VirtualAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}
