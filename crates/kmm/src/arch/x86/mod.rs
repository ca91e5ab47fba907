//! 32-bit x86 hardware implementation.
//!
//! Legacy two-level paging: CR3 holds the physical base of the page
//! directory, `invlpg` invalidates a single TLB entry, and a CR3 reload
//! flushes the whole TLB.

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

/// Loads a directory's physical base into CR3, flushing the TLB.
///
/// The caller must guarantee the directory maps the kernel and the
/// currently executing code; `Paging::change_directory` upholds this by
/// sharing the kernel template into every directory it creates.
pub fn activate_directory(base: PhysicalAddress) {
    // SAFETY: See above; an ill-formed directory is fatal either way.
    unsafe { ::x86::controlregs::cr3_write(base.as_usize() as u64) };
}

/// Invalidates the TLB entry covering `virt`.
pub fn flush_tlb_entry(virt: VirtualAddress) {
    // SAFETY: invlpg has no effect beyond dropping a cached translation.
    unsafe { ::x86::tlb::flush(virt.as_usize()) };
}

/// Runs `f` with local interrupts masked, restoring the previous state.
pub fn without_interrupts<R>(f: impl FnOnce() -> R) -> R {
    use ::x86::bits32::eflags::{self, EFlags};

    let were_enabled = eflags::read().contains(EFlags::FLAGS_IF);
    // SAFETY: Masking interrupts on the local core cannot violate memory
    // safety; the previous state is restored below.
    unsafe { ::x86::irq::disable() };
    let result = f();
    if were_enabled {
        // SAFETY: Interrupts were enabled when we were called.
        unsafe { ::x86::irq::enable() };
    }
    result
}
