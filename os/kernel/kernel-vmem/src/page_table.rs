//! # Two-Level Page Table Structures
//!
//! A 32-bit virtual address splits into three fields:
//!
//! ```text
//! | 31‒22 | 21‒12 | 11‒0   |
//! |   PD  |   PT  | Offset |
//! ```
//!
//! The directory index selects one of 1024 [`PdEntry`] slots, each pointing at
//! a [`PageTable`]; the table index selects one of 1024 [`PtEntry`] slots, each
//! mapping one 4 KiB frame. One directory entry therefore spans 4 MiB.

pub mod pd;
pub mod pt;

use crate::page_table::pd::DirectoryIndex;
use crate::page_table::pt::TableIndex;
use kernel_memory_addresses::VirtualAddress;

/// Entries per directory and per table.
pub const ENTRIES: usize = 1024;

/// Bytes of virtual address space covered by one directory entry (4 MiB).
pub const DIRECTORY_SPAN: u32 = 1 << 22;

#[inline]
#[must_use]
pub const fn split_indices(va: VirtualAddress) -> (DirectoryIndex, TableIndex) {
    (DirectoryIndex::from(va), TableIndex::from(va))
}
