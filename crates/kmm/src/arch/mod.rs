//! Architecture support for the memory manager.
//!
//! Hardware access (page-table-base register, TLB, interrupt masking) lives
//! behind this module. Kernel builds on 32-bit x86 use the hardware
//! implementation; tests and the `software-emulation` feature use a
//! software implementation that runs on any host.

// Hardware implementation: only on a real x86 target, outside tests and
// emulation.
#[cfg(all(target_arch = "x86", not(test), not(feature = "software-emulation")))]
mod x86;
#[cfg(all(target_arch = "x86", not(test), not(feature = "software-emulation")))]
pub use self::x86::*;

// Software implementation: tests, or the software-emulation feature.
#[cfg(any(test, feature = "software-emulation"))]
mod software;
#[cfg(any(test, feature = "software-emulation"))]
pub use self::software::*;
