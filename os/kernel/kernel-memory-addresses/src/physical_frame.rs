use crate::{PAGE_SHIFT, PhysicalAddress};
use core::fmt;
use core::ops::Add;

/// A 4 KiB physical frame, identified by its frame number.
///
/// Frame `n` covers the physical bytes `[n * 4096, (n + 1) * 4096)`. Frame
/// pools hand out and take back frames by number; page-table entries store the
/// frame's base address in their upper 20 bits.
///
/// ### Invariants
/// - `number() < 2^20` for any frame reachable by a 32-bit physical address.
///
/// ### Examples
/// ```rust
/// # use kernel_memory_addresses::*;
/// let f = PhysicalFrame::new(1024);
/// assert_eq!(f.base().as_u32(), 4 * 1024 * 1024);
/// assert_eq!(f + 3, PhysicalFrame::new(1027));
/// ```
#[repr(transparent)]
#[derive(Copy, Clone, Default, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct PhysicalFrame(u32);

impl PhysicalFrame {
    #[inline]
    #[must_use]
    pub const fn new(number: u32) -> Self {
        debug_assert!(number < (1 << 20), "frame number exceeds 32-bit physical space");
        Self(number)
    }

    /// Frame that contains `addr` (aligns down).
    #[inline]
    #[must_use]
    pub const fn containing_address(addr: PhysicalAddress) -> Self {
        Self(addr.as_u32() >> PAGE_SHIFT)
    }

    #[inline]
    #[must_use]
    pub const fn number(self) -> u32 {
        self.0
    }

    #[inline]
    #[must_use]
    pub const fn base(self) -> PhysicalAddress {
        PhysicalAddress::new(self.0 << PAGE_SHIFT)
    }

    #[inline]
    #[must_use]
    pub const fn join(self, offset: u32) -> PhysicalAddress {
        PhysicalAddress::new((self.0 << PAGE_SHIFT) | (offset & crate::PAGE_OFFSET_MASK))
    }

    #[inline]
    #[must_use]
    pub const fn next(self) -> Self {
        Self(self.0 + 1)
    }
}

impl fmt::Debug for PhysicalFrame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PhysicalFrame(#{} @ 0x{:08X})", self.0, self.base().as_u32())
    }
}

impl fmt::Display for PhysicalFrame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

impl Add<u32> for PhysicalFrame {
    type Output = Self;
    #[inline]
    fn add(self, rhs: u32) -> Self::Output {
        Self::new(self.0 + rhs)
    }
}
