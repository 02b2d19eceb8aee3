//! # Address Space (32-bit, two-level)
//!
//! One page directory plus the eagerly built page tables of the shared range.
//!
//! ## Layout after construction
//!
//! | Directory slots | Content |
//! |-----------------|---------|
//! | `0 .. max(1, ceil(shared / 4 MiB))` | tables identity-mapping `[0, shared)` present, supervisor, read/write |
//! | remaining slots below 1023 | not present (read/write bit set) |
//! | 1023 | the directory itself |
//!
//! Construction writes the frames through [`PhysMapper`](crate::PhysMapper);
//! both the directory and the shared tables come from the kernel pool, which
//! sits inside the identity-mapped range.
//!
//! ## Lifecycle
//!
//! `Constructed → Loaded → Translating`, see [`AddressSpaceState`].

use crate::context::PagingContext;
use crate::page_table::pd::{DirectoryIndex, PageDirectory, PdEntry};
use crate::page_table::pt::{PageTable, PtEntry, TableIndex};
use crate::page_table::DIRECTORY_SPAN;
use crate::recursive::RECURSIVE_SLOT;
use crate::{FrameAlloc, FrameAllocError, Mmu, PageEntryBits, PhysMapper};
use alloc::vec::Vec;
use kernel_memory_addresses::{PAGE_SIZE, PhysicalFrame};
use log::{debug, info, warn};

#[derive(Debug, Copy, Clone, Eq, PartialEq, thiserror::Error)]
pub enum AddressSpaceError {
    #[error("no frame for a page directory or shared page table")]
    OutOfMemory(#[from] FrameAllocError),
    #[error("shared range of {0:#x} bytes reaches the recursive slot")]
    SharedRegionTooLarge(u32),
    #[error("no page directory has been loaded")]
    NoDirectoryLoaded,
}

/// Where an address space is in its lifecycle.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum AddressSpaceState {
    /// Built, not installed in CR3.
    Constructed,
    /// Installed in CR3, translation still off.
    Loaded,
    /// Installed and translating.
    Translating,
}

/// Handle to a single page directory.
#[derive(Debug)]
pub struct AddressSpace {
    directory: PhysicalFrame,
}

impl AddressSpace {
    /// Build a directory that identity-maps the context's shared range and
    /// maps itself through slot 1023.
    ///
    /// # Errors
    /// - [`AddressSpaceError::SharedRegionTooLarge`] if the shared range would
    ///   need directory slot 1023.
    /// - [`AddressSpaceError::OutOfMemory`] if the kernel pool runs dry; frames
    ///   taken so far are returned.
    pub fn new<M: Mmu, K: FrameAlloc, P: FrameAlloc>(
        ctx: &mut PagingContext<'_, M, K, P>,
    ) -> Result<Self, AddressSpaceError> {
        let shared = ctx.shared_size();
        // at least one table, even with nothing shared
        let table_count = shared.div_ceil(DIRECTORY_SPAN).max(1) as usize;
        if table_count > RECURSIVE_SLOT.as_usize() {
            return Err(AddressSpaceError::SharedRegionTooLarge(shared));
        }

        let mut frames = Vec::with_capacity(table_count + 1);
        for _ in 0..=table_count {
            match ctx.kernel_pool_mut().alloc_4k() {
                Ok(frame) => frames.push(frame),
                Err(e) => {
                    for frame in frames {
                        if let Err(undo) = ctx.kernel_pool_mut().free_4k(frame) {
                            warn!("Could not return frame {frame} after failed construction: {undo}");
                        }
                    }
                    return Err(e.into());
                }
            }
        }

        let directory = frames[0];
        let mmu = ctx.mmu();

        // SAFETY: kernel-pool frames are identity-mapped and exclusively ours.
        let dir = unsafe { mmu.phys_to_mut::<PageDirectory>(directory.base()) };
        dir.fill(PdEntry::from_bits(PageEntryBits::absent_kernel()));

        for (slot, &table_frame) in (0..RECURSIVE_SLOT.as_u16()).zip(&frames[1..]) {
            // SAFETY: as above.
            let table = unsafe { mmu.phys_to_mut::<PageTable>(table_frame.base()) };
            identity_map_table(table, slot, shared);
            dir.set(
                DirectoryIndex::new(slot),
                PdEntry::from_bits(PageEntryBits::new_kernel_rw(table_frame)),
            );
        }

        dir.set(
            RECURSIVE_SLOT,
            PdEntry::from_bits(PageEntryBits::new_kernel_rw(directory)),
        );

        info!(
            "Address space constructed: directory {directory}, {table_count} shared table(s)"
        );
        Ok(Self { directory })
    }

    /// Install this directory in CR3 and record it as current.
    pub fn load<M: Mmu, K: FrameAlloc, P: FrameAlloc>(&self, ctx: &mut PagingContext<'_, M, K, P>) {
        // SAFETY: the directory identity-maps the shared range the kernel runs in.
        unsafe { ctx.mmu().load_directory(self.directory) };
        ctx.set_current(self.directory);
        debug!("Loaded page directory {}", self.directory);
    }

    /// Frame holding the page directory.
    #[inline]
    #[must_use]
    pub const fn directory_frame(&self) -> PhysicalFrame {
        self.directory
    }

    #[must_use]
    pub fn state<M: Mmu, K: FrameAlloc, P: FrameAlloc>(
        &self,
        ctx: &PagingContext<'_, M, K, P>,
    ) -> AddressSpaceState {
        match (ctx.current(), ctx.is_translating()) {
            (Some(d), true) if d == self.directory => AddressSpaceState::Translating,
            (Some(d), false) if d == self.directory => AddressSpaceState::Loaded,
            _ => AddressSpaceState::Constructed,
        }
    }
}

/// Fill the table of directory slot `slot` with identity mappings below `shared`.
fn identity_map_table(table: &mut PageTable, slot: u16, shared: u32) {
    let first = u32::from(slot) << 10;
    for t in 0..TableIndex::COUNT {
        let frame = first + u32::from(t);
        let entry = if u64::from(frame) * u64::from(PAGE_SIZE) < u64::from(shared) {
            PtEntry::from_bits(PageEntryBits::new_kernel_rw(PhysicalFrame::new(frame)))
        } else {
            PtEntry::from_bits(PageEntryBits::absent_kernel())
        };
        table.set(TableIndex::new(t), entry);
    }
}
