//! # Page Directory (PD)
//!
//! - [`DirectoryIndex`]: index type for virtual-address bits `[31:22]`.
//! - [`PdEntry`]: either not present or a pointer to a [`PageTable`](super::pt::PageTable).
//! - [`PageDirectory`]: a 4 KiB-aligned array of 1024 PD entries.
//!
//! 4 MiB pages are never used, so `PS` stays 0 in every directory entry.

use crate::PageEntryBits;
use crate::page_table::ENTRIES;
use kernel_memory_addresses::{PhysicalFrame, VirtualAddress};

/// Index into the Page Directory (derived from VA bits `[31:22]`).
#[repr(transparent)]
#[derive(Copy, Clone, Debug, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct DirectoryIndex(u16);

/// A single Page Directory entry (PDE).
#[doc(alias = "PDE")]
#[repr(transparent)]
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct PdEntry(PageEntryBits);

/// The Page Directory: 1024 entries, 4 KiB-aligned.
#[doc(alias = "PD")]
#[repr(C, align(4096))]
pub struct PageDirectory {
    entries: [PdEntry; ENTRIES],
}

impl DirectoryIndex {
    /// Build an index from a virtual address (extracts bits `[31:22]`).
    #[inline]
    #[must_use]
    #[allow(clippy::cast_possible_truncation)]
    pub const fn from(va: VirtualAddress) -> Self {
        Self((va.as_u32() >> 22) as u16)
    }

    /// Construct from a raw `u16`.
    ///
    /// ### Debug assertions
    /// - Asserts `v < 1024` in debug builds.
    #[inline]
    #[must_use]
    pub const fn new(v: u16) -> Self {
        debug_assert!(v < 1024);
        Self(v)
    }

    #[inline]
    #[must_use]
    #[allow(clippy::cast_lossless)]
    pub const fn as_usize(self) -> usize {
        self.0 as usize
    }

    #[inline]
    #[must_use]
    pub const fn as_u16(self) -> u16 {
        self.0
    }

    /// First virtual address covered by this slot.
    #[inline]
    #[must_use]
    #[allow(clippy::cast_lossless)]
    pub const fn base(self) -> VirtualAddress {
        VirtualAddress::new((self.0 as u32) << 22)
    }
}

impl PdEntry {
    #[inline]
    #[must_use]
    pub const fn zero() -> Self {
        Self(PageEntryBits::new())
    }

    #[inline]
    #[must_use]
    pub const fn from_bits(bits: PageEntryBits) -> Self {
        Self(bits)
    }

    #[inline]
    #[must_use]
    pub const fn is_present(self) -> bool {
        self.0.present()
    }

    #[inline]
    #[must_use]
    pub const fn flags(self) -> PageEntryBits {
        self.0
    }

    /// If present, the frame holding the next-level page table.
    #[inline]
    #[must_use]
    pub const fn next_table(self) -> Option<PhysicalFrame> {
        if self.is_present() {
            Some(self.0.frame())
        } else {
            None
        }
    }

    /// Point at the page table in `frame` with `flags` (`present` is forced on).
    #[inline]
    #[must_use]
    pub const fn make_next(frame: PhysicalFrame, mut flags: PageEntryBits) -> Self {
        flags.set_present(true);
        flags.set_large_page(false);
        flags.set_frame(frame);
        Self(flags)
    }

    #[inline]
    #[must_use]
    pub fn raw(self) -> u32 {
        self.0.into()
    }
}

impl PageDirectory {
    /// Create a directory with every slot set to `fill`.
    #[inline]
    #[must_use]
    pub const fn filled(fill: PdEntry) -> Self {
        Self {
            entries: [fill; ENTRIES],
        }
    }

    /// Overwrite every slot with `fill`.
    #[inline]
    pub fn fill(&mut self, fill: PdEntry) {
        self.entries.fill(fill);
    }

    #[inline]
    #[must_use]
    pub const fn get(&self, i: DirectoryIndex) -> PdEntry {
        self.entries[i.as_usize()]
    }

    /// Write the entry at `i`.
    ///
    /// Caller must handle any required TLB invalidation when changing active mappings.
    #[inline]
    pub const fn set(&mut self, i: DirectoryIndex, e: PdEntry) {
        self.entries[i.as_usize()] = e;
    }

    #[inline]
    #[must_use]
    pub const fn index_of(va: VirtualAddress) -> DirectoryIndex {
        DirectoryIndex::from(va)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn pde_points_at_table() {
        let e = PdEntry::make_next(PhysicalFrame::new(0x401), PageEntryBits::absent_user());
        assert_eq!(e.raw(), 0x0040_1007);
        assert_eq!(e.next_table(), Some(PhysicalFrame::new(0x401)));
        assert_eq!(PdEntry::from_bits(PageEntryBits::absent_kernel()).next_table(), None);
    }

    #[test]
    fn directory_index_base() {
        assert_eq!(DirectoryIndex::new(3).base(), VirtualAddress::new(0x00C0_0000));
        assert_eq!(PageDirectory::index_of(VirtualAddress::new(0x00C0_0001)).as_usize(), 3);
    }
}
