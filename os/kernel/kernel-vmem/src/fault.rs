//! Page-fault decoding and the results of resolving one.

use crate::FrameAllocError;
use bitfield_struct::bitfield;
use kernel_memory_addresses::{PhysicalFrame, VirtualAddress};

/// Page-fault error code layout (32-bit x86).
///
/// Each bit describes the condition that caused the page fault.
/// Reference: Intel SDM Vol. 3A, §6.15.1 “Page-Fault Exception (#PF)”.
#[bitfield(u32)]
pub struct PageFaultError {
    /// 0 = non-present page.
    /// 1 = protection violation (page present but access disallowed).
    pub present: bool, // bit 0

    /// 0 = read or execute.
    /// 1 = write access.
    pub write: bool, // bit 1

    /// 0 = supervisor (CPL 0–2).
    /// 1 = user mode (CPL 3).
    pub user: bool, // bit 2

    /// 1 = caused by reserved bit set in a paging structure.
    pub reserved_bit: bool, // bit 3

    /// 1 = instruction fetch (execute access).
    pub instruction_fetch: bool, // bit 4

    #[bits(27)]
    __: u32, // reserved / ignored bits
}

impl PageFaultError {
    /// Error code the processor pushes for a write to a non-present page.
    #[must_use]
    pub const fn not_present_write() -> Self {
        Self::new().with_write(true)
    }

    #[must_use]
    pub const fn explain(&self) -> &'static str {
        if !self.present() {
            "Non-present page (page not mapped yet)"
        } else if self.reserved_bit() {
            "Reserved bit set in a paging structure"
        } else if self.instruction_fetch() {
            if self.user() {
                "User-mode instruction fetch on protected page"
            } else {
                "Kernel instruction fetch on protected page"
            }
        } else if self.write() {
            "Write access to protected page"
        } else {
            "Read access to protected page"
        }
    }
}

/// Reasons a page fault cannot be resolved.
#[derive(Debug, Copy, Clone, Eq, PartialEq, thiserror::Error)]
pub enum FaultError {
    #[error("fault at {0} outside every registered region set")]
    InvalidAddress(VirtualAddress),
    #[error("protection violation at {address}: {reason}")]
    ProtectionViolation {
        address: VirtualAddress,
        reason: &'static str,
    },
    #[error("fault at {0} inside the recursive page-table window")]
    RecursiveWindow(VirtualAddress),
    #[error("no frame available to resolve fault at {address}")]
    OutOfMemory {
        address: VirtualAddress,
        #[source]
        source: FrameAllocError,
    },
    #[error("fault at {0} while address translation is disabled")]
    TranslationDisabled(VirtualAddress),
}

/// Reasons a mapped page cannot be released.
#[derive(Debug, Copy, Clone, Eq, PartialEq, thiserror::Error)]
pub enum FreePageError {
    #[error("cannot free {0}: address translation is disabled")]
    TranslationDisabled(VirtualAddress),
    #[error("cannot free {0}: page belongs to the identity-mapped shared range")]
    SharedRange(VirtualAddress),
    #[error("cannot free {0}: page belongs to the recursive page-table window")]
    RecursiveWindow(VirtualAddress),
    #[error("releasing frame {frame} backing {page} failed")]
    Release {
        page: VirtualAddress,
        frame: PhysicalFrame,
        #[source]
        source: FrameAllocError,
    },
}

/// What [`handle_fault`](crate::PagingContext::handle_fault) created.
///
/// Both fields are `None` when the faulting page was already mapped.
#[derive(Debug, Copy, Clone, Default, Eq, PartialEq)]
pub struct FaultOutcome {
    /// Frame of a page table installed into the directory.
    pub table: Option<PhysicalFrame>,
    /// Data frame installed into the page table.
    pub page: Option<PhysicalFrame>,
}

impl FaultOutcome {
    #[must_use]
    pub const fn is_noop(&self) -> bool {
        self.table.is_none() && self.page.is_none()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decode_hardware_error_codes() {
        let e = PageFaultError::from_bits(0b110);
        assert!(!e.present());
        assert!(e.write());
        assert!(e.user());
        assert_eq!(e.explain(), "Non-present page (page not mapped yet)");

        let e = PageFaultError::from_bits(0b011);
        assert!(e.present());
        assert_eq!(e.explain(), "Write access to protected page");

        assert_eq!(PageFaultError::not_present_write().into_bits(), 0b010);
    }
}
