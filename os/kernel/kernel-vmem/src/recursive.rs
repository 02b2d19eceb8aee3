//! # Recursive Page-Table Window
//!
//! Directory slot [`RECURSIVE_SLOT`] holds the directory's own frame. With
//! translation enabled, the top 4 MiB of virtual memory become a window onto
//! the paging structures themselves:
//!
//! ```text
//! table_window(d)    = 0xFFC0_0000 | (d << 12)   // page table of slot d
//! directory_window() = 0xFFFF_F000               // the directory
//! ```
//!
//! [`RecursiveWindow`] is the only place that turns these addresses into
//! references.

use crate::page_table::pd::{DirectoryIndex, PageDirectory, PdEntry};
use crate::page_table::pt::{PageTable, PtEntry};
use crate::{Mmu, PageEntryBits};
use kernel_memory_addresses::{PhysicalFrame, VirtualAddress};

/// Directory slot that maps the directory onto itself.
pub const RECURSIVE_SLOT: DirectoryIndex = DirectoryIndex::new(1023);

/// Base of the 4 MiB range covered by [`RECURSIVE_SLOT`].
const WINDOW_BASE: u32 = 0xFFC0_0000;

/// Virtual address at which the page table of directory slot `d` is visible.
#[inline]
#[must_use]
#[allow(clippy::cast_lossless)]
pub const fn table_window(d: DirectoryIndex) -> VirtualAddress {
    VirtualAddress::new(WINDOW_BASE | ((d.as_u16() as u32) << 12))
}

/// Virtual address at which the page directory itself is visible.
#[inline]
#[must_use]
pub const fn directory_window() -> VirtualAddress {
    table_window(RECURSIVE_SLOT)
}

/// Whether `va` falls inside the recursive window.
#[inline]
#[must_use]
pub const fn in_window(va: VirtualAddress) -> bool {
    DirectoryIndex::from(va).as_u16() == RECURSIVE_SLOT.as_u16()
}

/// Exclusive access to the loaded directory and its tables through slot 1023.
pub struct RecursiveWindow<'m, M: Mmu> {
    mmu: &'m M,
}

impl<'m, M: Mmu> RecursiveWindow<'m, M> {
    /// # Safety
    /// Translation must be enabled, the loaded directory must carry the
    /// self-reference in [`RECURSIVE_SLOT`], and no other reference into the
    /// paging structures may be alive while this window is used.
    #[inline]
    pub const unsafe fn new(mmu: &'m M) -> Self {
        Self { mmu }
    }

    /// The loaded page directory.
    #[inline]
    pub fn directory(&mut self) -> &mut PageDirectory {
        // SAFETY: slot 1023 is present for the lifetime of the directory.
        unsafe { self.mmu.virt_to_mut::<PageDirectory>(directory_window()) }
    }

    /// The page table behind slot `d`, if that slot is present.
    ///
    /// Slot [`RECURSIVE_SLOT`] yields `None`; its "table" is the directory.
    pub fn table(&mut self, d: DirectoryIndex) -> Option<&mut PageTable> {
        if d == RECURSIVE_SLOT || !self.directory().get(d).is_present() {
            return None;
        }
        // SAFETY: the slot is present, so its window page is mapped.
        Some(unsafe { self.mmu.virt_to_mut::<PageTable>(table_window(d)) })
    }

    /// The page table behind slot `d`, creating it with a frame from `alloc`
    /// when the slot is not present.
    ///
    /// A new table is linked as present, user, read/write and then cleared to
    /// not-present user entries through its own window. Returns the table and
    /// the frame that was installed, if any.
    ///
    /// # Errors
    /// Whatever `alloc` fails with; nothing is modified in that case.
    pub fn ensure_table<E>(
        &mut self,
        d: DirectoryIndex,
        alloc: impl FnOnce() -> Result<PhysicalFrame, E>,
    ) -> Result<(&mut PageTable, Option<PhysicalFrame>), E> {
        debug_assert_ne!(d, RECURSIVE_SLOT, "slot 1023 is the self-reference");

        let mut created = None;
        if !self.directory().get(d).is_present() {
            let frame = alloc()?;
            self.directory()
                .set(d, PdEntry::from_bits(PageEntryBits::new_user_rw(frame)));
            created = Some(frame);
        }

        // SAFETY: the slot is present now, so its window page is mapped.
        let table = unsafe { self.mmu.virt_to_mut::<PageTable>(table_window(d)) };
        if created.is_some() {
            table.fill(PtEntry::from_bits(PageEntryBits::absent_user()));
        }
        Ok((table, created))
    }
}
