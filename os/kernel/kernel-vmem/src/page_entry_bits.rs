use bitfield_struct::bitfield;
use kernel_memory_addresses::PhysicalFrame;

/// A single 32-bit x86 paging entry in its raw bitfield form.
///
/// Directory entries (PDEs) and table entries (PTEs) share this layout when
/// 4 MiB pages are not used, which is always the case here.
///
/// ### Bit layout
///
/// | Bits   | Name / Mnemonic | Meaning |
/// |--------|-----------------|---------|
/// | 0      | `P` (present)   | Valid entry if set |
/// | 1      | `RW`            | Writable if set |
/// | 2      | `US`            | User-mode accessible if set |
/// | 3      | `PWT`           | Write-through caching |
/// | 4      | `PCD`           | Disable caching |
/// | 5      | `A`             | Accessed |
/// | 6      | `D`             | Dirty (PTE only) |
/// | 7      | `PS`/`PAT`      | Must stay 0 (no 4 MiB pages) |
/// | 8      | `G`             | Global (PTE only) |
/// | 9–11   | OS avail        | Ignored by hardware |
/// | 12–31  | `frame`         | Physical frame number |
///
/// ### Example
/// ```rust
/// # use kernel_vmem::PageEntryBits;
/// # use kernel_memory_addresses::PhysicalFrame;
/// let e = PageEntryBits::new_user_rw(PhysicalFrame::new(0x400));
/// assert_eq!(e.into_bits(), 0x0040_0007);
/// assert_eq!(e.frame(), PhysicalFrame::new(0x400));
/// ```
#[bitfield(u32)]
#[derive(PartialEq, Eq)]
pub struct PageEntryBits {
    /// Present (P, bit 0).
    ///
    /// Clear implies a not-present entry; any access through it faults.
    pub present: bool,

    /// Writable (RW, bit 1).
    pub writable: bool,

    /// User/Supervisor (US, bit 2).
    ///
    /// Set to allow user-mode access; clear restricts to supervisor only.
    pub user_access: bool,

    /// Page Write-Through (PWT, bit 3).
    pub write_through: bool,

    /// Page Cache Disable (PCD, bit 4).
    pub cache_disabled: bool,

    /// Accessed (A, bit 5).
    ///
    /// Set by the CPU on first access through this entry.
    pub accessed: bool,

    /// Dirty (D, bit 6), table entries only.
    pub dirty: bool,

    /// Page Size (PS, bit 7). Always clear.
    pub large_page: bool,

    /// Global (G, bit 8), table entries only.
    pub global_translation: bool,

    /// OS-available (bits 9..=11).
    #[bits(3)]
    pub os_available: u8,

    /// Physical frame number (bits 12..=31).
    #[bits(20)]
    frame_number: u32,
}

impl PageEntryBits {
    #[inline]
    pub const fn set_frame(&mut self, frame: PhysicalFrame) {
        self.set_frame_number(frame.number());
    }

    #[inline]
    #[must_use]
    pub const fn frame(&self) -> PhysicalFrame {
        PhysicalFrame::new(self.frame_number())
    }

    /// Present, supervisor, read/write mapping of `frame` (`frame | 0b011`).
    ///
    /// Used for the identity-mapped shared range and the self-reference slot.
    #[inline]
    #[must_use]
    pub const fn new_kernel_rw(frame: PhysicalFrame) -> Self {
        Self::new()
            .with_present(true)
            .with_writable(true)
            .with_frame_number(frame.number())
    }

    /// Present, user, read/write mapping of `frame` (`frame | 0b111`).
    ///
    /// Used for every table and data frame created on demand.
    #[inline]
    #[must_use]
    pub const fn new_user_rw(frame: PhysicalFrame) -> Self {
        Self::new()
            .with_present(true)
            .with_writable(true)
            .with_user_access(true)
            .with_frame_number(frame.number())
    }

    /// Not-present supervisor entry with the writable bit set (`0b010`).
    #[inline]
    #[must_use]
    pub const fn absent_kernel() -> Self {
        Self::new().with_writable(true)
    }

    /// Not-present user entry with the writable bit set (`0b110`).
    #[inline]
    #[must_use]
    pub const fn absent_user() -> Self {
        Self::new().with_writable(true).with_user_access(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn canonical_encodings() {
        let f = PhysicalFrame::new(0x201);
        assert_eq!(PageEntryBits::new_kernel_rw(f).into_bits(), 0x0020_1003);
        assert_eq!(PageEntryBits::new_user_rw(f).into_bits(), 0x0020_1007);
        assert_eq!(PageEntryBits::absent_kernel().into_bits(), 0b010);
        assert_eq!(PageEntryBits::absent_user().into_bits(), 0b110);
        assert!(!PageEntryBits::absent_user().present());
    }

    #[test]
    fn frame_survives_flag_changes() {
        let mut e = PageEntryBits::new_kernel_rw(PhysicalFrame::new(7));
        e.set_accessed(true);
        e.set_dirty(true);
        assert_eq!(e.frame(), PhysicalFrame::new(7));
        e.set_frame(PhysicalFrame::new(0xF_FFFF));
        assert_eq!(e.frame().number(), 0xF_FFFF);
        assert!(e.dirty());
    }
}
