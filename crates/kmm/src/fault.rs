//! Decoded page-fault information.
//!
//! The exception dispatcher delivers a register snapshot and the raw
//! error code; the faulting address comes from the CPU's fault-address
//! register (CR2), outside the snapshot. This module carries the decoded
//! form handed to `Paging::handle_fault`.

use core::fmt;

use crate::VirtualAddress;

/// Error-code bits delivered with a page-fault exception.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageFaultCode(u32);

impl PageFaultCode {
    /// Set when the fault hit a present page (protection violation rather
    /// than a missing mapping).
    pub const PRESENT: u32 = 1 << 0;
    /// Set when the access was a write.
    pub const WRITE: u32 = 1 << 1;
    /// Set when the access came from user mode.
    pub const USER: u32 = 1 << 2;
    /// Set when a reserved bit was found set in a paging structure.
    pub const RESERVED: u32 = 1 << 3;
    /// Set when the access was an instruction fetch.
    pub const INSTRUCTION_FETCH: u32 = 1 << 4;

    /// Creates a code from the raw error-code value.
    pub const fn from_raw(raw: u32) -> Self {
        Self(raw)
    }

    pub const fn present(self) -> bool {
        (self.0 & Self::PRESENT) != 0
    }

    pub const fn write(self) -> bool {
        (self.0 & Self::WRITE) != 0
    }

    pub const fn user(self) -> bool {
        (self.0 & Self::USER) != 0
    }

    pub const fn reserved(self) -> bool {
        (self.0 & Self::RESERVED) != 0
    }

    pub const fn instruction_fetch(self) -> bool {
        (self.0 & Self::INSTRUCTION_FETCH) != 0
    }
}

impl fmt::Display for PageFaultCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mode = if self.user() { "user" } else { "kernel" };
        let access = if self.instruction_fetch() {
            "instruction fetch from"
        } else if self.write() {
            "write to"
        } else {
            "read from"
        };
        let target = if self.present() {
            "a protected page"
        } else {
            "a not-present page"
        };
        write!(f, "{mode} {access} {target}")?;
        if self.reserved() {
            write!(f, " (reserved bit set)")?;
        }
        Ok(())
    }
}

/// A decoded page fault: the reason bits, the faulting address, and the
/// faulting instruction pointer from the dispatcher's register snapshot.
#[derive(Debug, Clone, Copy)]
pub struct FaultInfo {
    pub address: VirtualAddress,
    pub instruction_pointer: VirtualAddress,
    pub code: PageFaultCode,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decodes_error_bits() {
        let code = PageFaultCode::from_raw(PageFaultCode::WRITE | PageFaultCode::USER);
        assert!(!code.present());
        assert!(code.write());
        assert!(code.user());
        assert!(!code.reserved());
        assert!(!code.instruction_fetch());
    }

    #[test]
    fn describes_a_kernel_write_miss() {
        let code = PageFaultCode::from_raw(PageFaultCode::WRITE);
        assert_eq!(
            format!("{code}"),
            "kernel write to a not-present page"
        );
    }

    #[test]
    fn describes_a_user_protection_violation() {
        let code =
            PageFaultCode::from_raw(PageFaultCode::PRESENT | PageFaultCode::USER | PageFaultCode::RESERVED);
        assert_eq!(
            format!("{code}"),
            "user read from a protected page (reserved bit set)"
        );
    }
}
