//! 32-bit page table and directory entry encoding.
//!
//! Both levels share one layout: the frame (or table) base in bits 12-31
//! and the flag bits {present, writable, user, write-through} in bits 0-3.

use crate::{PhysicalAddress, arch};

/// Flags stored in the low bits of an entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PageFlags(u32);

impl PageFlags {
    const PRESENT: u32 = 1 << 0;
    const WRITABLE: u32 = 1 << 1;
    const USER: u32 = 1 << 2;
    const WRITE_THROUGH: u32 = 1 << 3;

    /// Creates empty flags (entry not present).
    pub const fn empty() -> Self {
        Self(0)
    }

    /// Creates flags from a raw value.
    pub const fn from_raw(raw: u32) -> Self {
        Self(raw)
    }

    /// Returns the raw flag bits.
    pub const fn to_raw(self) -> u32 {
        self.0
    }

    /// Flags for a present mapping, derived from the kernel/writable pair
    /// the mapping operations take.
    pub fn mapping(kernel: bool, writable: bool) -> Self {
        let mut flags = Self::empty();
        flags.set_present(true);
        flags.set_writable(writable);
        flags.set_user(!kernel);
        flags
    }

    pub fn is_present(self) -> bool {
        (self.0 & Self::PRESENT) != 0
    }

    pub fn set_present(&mut self, present: bool) {
        self.toggle(Self::PRESENT, present);
    }

    pub fn is_writable(self) -> bool {
        (self.0 & Self::WRITABLE) != 0
    }

    pub fn set_writable(&mut self, writable: bool) {
        self.toggle(Self::WRITABLE, writable);
    }

    pub fn is_user(self) -> bool {
        (self.0 & Self::USER) != 0
    }

    pub fn set_user(&mut self, user: bool) {
        self.toggle(Self::USER, user);
    }

    pub fn is_write_through(self) -> bool {
        (self.0 & Self::WRITE_THROUGH) != 0
    }

    pub fn set_write_through(&mut self, write_through: bool) {
        self.toggle(Self::WRITE_THROUGH, write_through);
    }

    fn toggle(&mut self, mask: u32, value: bool) {
        if value {
            self.0 |= mask;
        } else {
            self.0 &= !mask;
        }
    }
}

/// A single 32-bit entry in a page table or page directory.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[repr(transparent)]
pub struct PageEntry(u32);

impl PageEntry {
    /// Frame base mask: bits 12-31.
    const FRAME_MASK: u32 = 0xFFFF_F000;

    /// Flag bits mask: bits 0-3.
    const FLAGS_MASK: u32 = 0xF;

    /// Creates an entry mapping a frame with the given flags.
    ///
    /// The frame base must be page-aligned.
    pub fn new(frame: PhysicalAddress, flags: PageFlags) -> Self {
        debug_assert!(
            frame.is_aligned(arch::PAGE_SIZE),
            "frame base must be page-aligned"
        );
        Self((frame.as_usize() as u32 & Self::FRAME_MASK) | (flags.to_raw() & Self::FLAGS_MASK))
    }

    /// Returns the mapped frame base, or None when the entry is not present.
    pub fn frame(self) -> Option<PhysicalAddress> {
        if self.is_present() {
            Some(PhysicalAddress::new((self.0 & Self::FRAME_MASK) as usize))
        } else {
            None
        }
    }

    /// Returns the flag bits of this entry.
    pub fn flags(self) -> PageFlags {
        PageFlags::from_raw(self.0 & Self::FLAGS_MASK)
    }

    /// Returns whether the present bit is set.
    pub fn is_present(self) -> bool {
        self.flags().is_present()
    }

    /// Clears the entry to not-present.
    pub fn clear(&mut self) {
        self.0 = 0;
    }

    /// Returns the raw 32-bit value.
    pub const fn as_u32(self) -> u32 {
        self.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn packs_frame_and_flags() {
        let entry = PageEntry::new(
            PhysicalAddress::new(0x0030_5000),
            PageFlags::mapping(true, true),
        );
        assert_eq!(entry.as_u32(), 0x0030_5003);
        assert_eq!(entry.frame(), Some(PhysicalAddress::new(0x0030_5000)));
        assert!(entry.flags().is_writable());
        assert!(!entry.flags().is_user());
    }

    #[test]
    fn user_mapping_sets_the_user_bit() {
        let flags = PageFlags::mapping(false, false);
        assert!(flags.is_present());
        assert!(!flags.is_writable());
        assert!(flags.is_user());
    }

    #[test]
    fn absent_entry_has_no_frame() {
        let mut entry = PageEntry::new(
            PhysicalAddress::new(0x0000_4000),
            PageFlags::mapping(true, false),
        );
        assert!(entry.is_present());
        entry.clear();
        assert!(!entry.is_present());
        assert_eq!(entry.frame(), None);
        assert_eq!(entry.as_u32(), 0);
    }

    #[test]
    fn write_through_round_trips() {
        let mut flags = PageFlags::mapping(true, true);
        flags.set_write_through(true);
        let entry = PageEntry::new(PhysicalAddress::new(0), flags);
        assert!(entry.flags().is_write_through());
    }
}
