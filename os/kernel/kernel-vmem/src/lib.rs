//! # Virtual Memory Support
//!
//! Classic two-level 32-bit x86 paging with demand mapping.
//!
//! ## What you get
//! - An [`AddressSpace`] that owns one page directory and eagerly
//!   identity-maps the shared low range.
//! - A [`PagingContext`] that holds the frame pools, the loaded directory and
//!   the region registry, and resolves page faults by installing missing page
//!   tables and data frames.
//! - [`PageEntryBits`] modelling a 32-bit PDE/PTE with `bitfield-struct`.
//! - The recursive [`table_window`]/[`directory_window`] contract through which
//!   every table is reached once translation is on.
//! - Hardware seams ([`FrameAlloc`], [`PhysMapper`], [`Mmu`]) and, behind the
//!   `sim` feature, a software machine that implements them.
//!
//! ## 32-bit Virtual Address → Physical Address Walk
//!
//! ```text
//! | 31‒22 | 21‒12 | 11‒0   |
//! |   PD  |   PT  | Offset |
//! ```
//!
//! ```text
//!  CR3 → PD ──► PDE → PT ──► PTE → 4 KiB frame
//! ```
//!
//! ### Recursive slot
//!
//! Directory slot 1023 points back at the directory itself. The walk for an
//! address in the top 4 MiB therefore lands one level short:
//!
//! | Virtual address | Reaches |
//! |-----------------|---------|
//! | `0xFFC0_0000 + (d << 12)` | page table of directory slot `d` |
//! | `0xFFFF_F000` | the page directory |
//!
//! The kernel never needs a mapping of arbitrary physical memory to edit its
//! page tables; it only needs slot 1023 to stay intact.

#![cfg_attr(not(any(test, doctest)), no_std)]
#![allow(unsafe_code, clippy::inline_always)]

extern crate alloc;

pub mod address_space;
pub mod context;
pub mod fault;
mod page_entry_bits;
pub mod page_table;
pub mod recursive;
pub mod registry;
#[cfg(any(test, feature = "sim"))]
pub mod sim;

pub use crate::address_space::{AddressSpace, AddressSpaceError, AddressSpaceState};
pub use crate::context::PagingContext;
pub use crate::fault::{FaultError, FaultOutcome, FreePageError, PageFaultError};
pub use crate::page_entry_bits::PageEntryBits;
pub use crate::page_table::pd::{DirectoryIndex, PageDirectory, PdEntry};
pub use crate::page_table::pt::{PageTable, PtEntry, TableIndex};
pub use crate::recursive::{RECURSIVE_SLOT, RecursiveWindow, directory_window, table_window};
pub use crate::registry::{RegionRegistry, RegionSetId, VirtualWindow};
use kernel_memory_addresses::{PhysicalAddress, PhysicalFrame, VirtualAddress};

/// Re-export constants as info module.
pub use kernel_info::memory as info;

/// Failures reported by a [`FrameAlloc`].
#[derive(Debug, Copy, Clone, Eq, PartialEq, thiserror::Error)]
pub enum FrameAllocError {
    #[error("out of physical frames")]
    OutOfMemory,
    #[error("frame {0} is not owned by this allocator")]
    NotOwned(PhysicalFrame),
    #[error("frame {0} does not start an allocated run")]
    NotRunHead(PhysicalFrame),
}

/// Source of single **physical** 4 KiB frames for page tables and data pages.
pub trait FrameAlloc {
    /// Allocate one 4 KiB *physical* frame.
    ///
    /// # Errors
    /// [`FrameAllocError::OutOfMemory`] when no frame is left.
    fn alloc_4k(&mut self) -> Result<PhysicalFrame, FrameAllocError>;

    /// Return a frame previously obtained from [`alloc_4k`](Self::alloc_4k).
    ///
    /// # Errors
    /// The frame is not owned by this allocator or is not currently allocated.
    fn free_4k(&mut self, frame: PhysicalFrame) -> Result<(), FrameAllocError>;

    /// Whether `frame` lies in the range this allocator manages.
    fn owns(&self, frame: PhysicalFrame) -> bool;
}

impl<A: FrameAlloc + ?Sized> FrameAlloc for &mut A {
    fn alloc_4k(&mut self) -> Result<PhysicalFrame, FrameAllocError> {
        (**self).alloc_4k()
    }

    fn free_4k(&mut self, frame: PhysicalFrame) -> Result<(), FrameAllocError> {
        (**self).free_4k(frame)
    }

    fn owns(&self, frame: PhysicalFrame) -> bool {
        (**self).owns(frame)
    }
}

/// Converts physical addresses to usable pointers.
///
/// Before translation is enabled every address is physical. Afterwards the
/// implementation relies on the identity-mapped shared range: frame-pool
/// bitmaps and the frames of kernel page directories must live below the
/// shared size so that touching them can never fault.
///
/// # Safety
/// - You must ensure `pa` is mapped as writable for `&mut T`.
/// - Lifetime `'a` is purely borrow-checked; the mapping must remain valid
///   for `'a`.
/// - Type `T` must match the bytes at `pa` (no aliasing UB).
pub trait PhysMapper {
    /// Convert a *physical* address to a usable mutable reference.
    ///
    /// # Safety
    /// See the trait documentation.
    unsafe fn phys_to_mut<'a, T>(&self, pa: PhysicalAddress) -> &'a mut T;
}

/// The memory-management unit: CR3, CR0.PG and translated access.
pub trait Mmu: PhysMapper {
    /// Install `directory` as the active page directory (CR3).
    ///
    /// Reloading the same directory flushes every cached translation.
    ///
    /// # Safety
    /// The directory must map the code and data currently executing.
    unsafe fn load_directory(&self, directory: PhysicalFrame);

    /// Turn address translation on (CR0.PG).
    ///
    /// # Safety
    /// A directory must be loaded and must identity-map the running kernel.
    unsafe fn enable_translation(&self);

    /// Access `va` through the active translation.
    ///
    /// # Safety
    /// `va` must be mapped; the page-fault handler must never fault itself.
    /// Same aliasing rules as [`PhysMapper::phys_to_mut`].
    unsafe fn virt_to_mut<'a, T>(&self, va: VirtualAddress) -> &'a mut T;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sim::SimMachine;
    use alloc::vec::Vec;

    /// Hands out frames from a fixed range, lowest first, and takes them back.
    struct ListAlloc {
        start: u32,
        end: u32,
        free: Vec<u32>,
    }

    impl ListAlloc {
        fn new(start: u32, end: u32) -> Self {
            Self {
                start,
                end,
                free: (start..end).rev().collect(),
            }
        }

        fn available(&self) -> usize {
            self.free.len()
        }
    }

    impl FrameAlloc for ListAlloc {
        fn alloc_4k(&mut self) -> Result<PhysicalFrame, FrameAllocError> {
            self.free
                .pop()
                .map(PhysicalFrame::new)
                .ok_or(FrameAllocError::OutOfMemory)
        }

        fn free_4k(&mut self, frame: PhysicalFrame) -> Result<(), FrameAllocError> {
            if !self.owns(frame) {
                return Err(FrameAllocError::NotOwned(frame));
            }
            if self.free.contains(&frame.number()) {
                return Err(FrameAllocError::NotRunHead(frame));
            }
            self.free.push(frame.number());
            Ok(())
        }

        fn owns(&self, frame: PhysicalFrame) -> bool {
            (self.start..self.end).contains(&frame.number())
        }
    }

    const SHARED: u32 = 4 * 1024 * 1024;

    fn context(sim: &SimMachine) -> PagingContext<'_, SimMachine, ListAlloc, ListAlloc> {
        PagingContext::new(
            sim,
            ListAlloc::new(512, 1024),
            ListAlloc::new(1024, 2048),
            SHARED,
        )
    }

    fn translating(
        sim: &SimMachine,
    ) -> (PagingContext<'_, SimMachine, ListAlloc, ListAlloc>, AddressSpace) {
        let mut ctx = context(sim);
        let space = AddressSpace::new(&mut ctx).expect("address space");
        space.load(&mut ctx);
        ctx.enable_translation().expect("enable");
        (ctx, space)
    }

    #[test]
    fn construct_identity_maps_shared_range() {
        let sim = SimMachine::new(64 * 1024 * 1024);
        let mut ctx = context(&sim);
        let space = AddressSpace::new(&mut ctx).expect("address space");

        // directory and one table, both from the kernel pool
        assert_eq!(space.directory_frame(), PhysicalFrame::new(512));
        assert_eq!(ctx.kernel_pool().available(), 510);
        assert_eq!(ctx.process_pool().available(), 1024);
        assert_eq!(space.state(&ctx), AddressSpaceState::Constructed);

        let dir = sim.read_phys_u32(space.directory_frame().base());
        assert_eq!(dir, 0x0020_1003);
        let second = sim.read_phys_u32(space.directory_frame().base() + 4);
        assert_eq!(second, 0b010);
        let last = sim.read_phys_u32(space.directory_frame().base() + 1023 * 4);
        assert_eq!(last, 0x0020_0003);

        let table = PhysicalFrame::new(513).base();
        assert_eq!(sim.read_phys_u32(table), 0x0000_0003);
        assert_eq!(sim.read_phys_u32(table + 5 * 4), 0x0000_5003);
        assert_eq!(sim.read_phys_u32(table + 1023 * 4), 0x003F_F003);
    }

    #[test]
    fn load_and_enable_walks_through_recursive_slot() {
        let sim = SimMachine::new(64 * 1024 * 1024);
        let (ctx, space) = translating(&sim);

        assert_eq!(space.state(&ctx), AddressSpaceState::Translating);
        assert_eq!(ctx.current(), Some(space.directory_frame()));
        assert_eq!(sim.walk(VirtualAddress::new(0x1234)), Some(PhysicalAddress::new(0x1234)));
        assert_eq!(
            sim.walk(directory_window()),
            Some(space.directory_frame().base())
        );
        assert_eq!(
            sim.walk(table_window(DirectoryIndex::new(0))),
            Some(PhysicalFrame::new(513).base())
        );
        assert_eq!(sim.walk(VirtualAddress::new(SHARED)), None);
        assert_eq!(ctx.translate(VirtualAddress::new(0x3F_FFFF)), Some(PhysicalAddress::new(0x3F_FFFF)));
    }

    #[test]
    fn fault_installs_table_then_page() {
        let sim = SimMachine::new(64 * 1024 * 1024);
        let (mut ctx, _space) = translating(&sim);

        let va = VirtualAddress::new(0x4000_0000);
        let outcome = ctx
            .handle_fault(va, PageFaultError::not_present_write())
            .expect("fault");
        assert_eq!(outcome.table, Some(PhysicalFrame::new(1024)));
        assert_eq!(outcome.page, Some(PhysicalFrame::new(1025)));
        assert_eq!(sim.walk(va), Some(PhysicalFrame::new(1025).base()));
        assert_eq!(ctx.translate(va + 0x10), Some(PhysicalFrame::new(1025).base() + 0x10));

        // directory entry is user/rw; untouched entries of the new table read 0b110
        let pde = sim.read_phys_u32(ctx.current().expect("loaded").base() + 256 * 4);
        assert_eq!(pde, 0x0040_0007);
        let table = PhysicalFrame::new(1024).base();
        assert_eq!(sim.read_phys_u32(table), 0x0040_1007);
        assert_eq!(sim.read_phys_u32(table + 4), 0b110);
        assert_eq!(sim.read_phys_u32(table + 1023 * 4), 0b110);

        // same page again: nothing to do
        let again = ctx
            .handle_fault(va + 0x800, PageFaultError::not_present_write())
            .expect("fault");
        assert!(again.is_noop());

        // neighbour page: reuse the table
        let next = ctx
            .handle_fault(va + 0x1000, PageFaultError::new())
            .expect("fault");
        assert_eq!(next.table, None);
        assert_eq!(next.page, Some(PhysicalFrame::new(1026)));
        assert_eq!(ctx.process_pool().available(), 1024 - 3);
    }

    #[test]
    fn faults_are_rejected_when_not_resolvable() {
        let sim = SimMachine::new(64 * 1024 * 1024);
        let mut ctx = context(&sim);
        let space = AddressSpace::new(&mut ctx).expect("address space");
        let va = VirtualAddress::new(0x4000_0000);

        assert_eq!(
            ctx.handle_fault(va, PageFaultError::new()),
            Err(FaultError::TranslationDisabled(va))
        );

        space.load(&mut ctx);
        ctx.enable_translation().expect("enable");

        assert_eq!(
            ctx.handle_fault(directory_window(), PageFaultError::new()),
            Err(FaultError::RecursiveWindow(directory_window()))
        );
        assert!(matches!(
            ctx.handle_fault(va, PageFaultError::from_bits(0b011)),
            Err(FaultError::ProtectionViolation { .. })
        ));

        ctx.register_region_set(VirtualWindow::new(va, SHARED));
        let outside = VirtualAddress::new(0x8000_0000);
        assert_eq!(
            ctx.handle_fault(outside, PageFaultError::new()),
            Err(FaultError::InvalidAddress(outside))
        );
        assert!(ctx.handle_fault(va + 0x3F_F000, PageFaultError::new()).is_ok());
        assert_eq!(
            ctx.handle_fault(va + SHARED, PageFaultError::new()),
            Err(FaultError::InvalidAddress(va + SHARED))
        );
        assert_eq!(ctx.process_pool().available(), 1024 - 2);
    }

    #[test]
    fn free_page_releases_and_reloads() {
        let sim = SimMachine::new(64 * 1024 * 1024);
        let (mut ctx, _space) = translating(&sim);
        let va = VirtualAddress::new(0x4000_2000);

        ctx.handle_fault(va, PageFaultError::not_present_write())
            .expect("fault");
        let loads = sim.directory_loads();

        assert_eq!(ctx.free_page(va), Ok(Some(PhysicalFrame::new(1025))));
        assert_eq!(sim.walk(va), None);
        assert_eq!(sim.directory_loads(), loads + 1);
        assert_eq!(ctx.process_pool().available(), 1024 - 1);

        // untouched pages and missing tables are no-ops
        assert_eq!(ctx.free_page(va), Ok(None));
        assert_eq!(ctx.free_page(VirtualAddress::new(0x8000_0000)), Ok(None));
        assert_eq!(
            ctx.free_page(directory_window()),
            Err(FreePageError::RecursiveWindow(directory_window()))
        );
    }

    #[test]
    fn free_page_leaves_shared_range_and_directory_alone() {
        let sim = SimMachine::new(64 * 1024 * 1024);
        let (mut ctx, space) = translating(&sim);
        let directory = space.directory_frame();
        let va = VirtualAddress::new(directory.base().as_u32());

        assert_eq!(ctx.free_page(va), Err(FreePageError::SharedRange(va)));
        assert_eq!(
            ctx.free_page(VirtualAddress::zero()),
            Err(FreePageError::SharedRange(VirtualAddress::zero()))
        );
        assert_eq!(sim.walk(va), Some(directory.base()));
        assert_eq!(ctx.kernel_pool().available(), 510);

        // the live directory is never handed out again
        let other = AddressSpace::new(&mut ctx).expect("address space");
        assert_ne!(other.directory_frame(), directory);
        assert_eq!(ctx.current(), Some(directory));
    }

    #[test]
    fn free_page_only_returns_frames_to_the_process_pool() {
        let sim = SimMachine::new(64 * 1024 * 1024);
        let (mut ctx, _space) = translating(&sim);
        let va = VirtualAddress::new(0x4000_0000);
        ctx.handle_fault(va, PageFaultError::not_present_write())
            .expect("fault");

        // point the page at a kernel-pool frame behind the allocator's back
        let foreign = PhysicalFrame::new(600);
        let table = PhysicalFrame::new(1024).base();
        sim.write_phys_u32(table, foreign.base().as_u32() | 0b111);

        assert_eq!(
            ctx.free_page(va),
            Err(FreePageError::Release {
                page: va,
                frame: foreign,
                source: FrameAllocError::NotOwned(foreign),
            })
        );
        assert_eq!(sim.walk(va), Some(foreign.base()));
        assert_eq!(ctx.kernel_pool().available(), 510);
    }

    #[test]
    fn construct_always_takes_a_first_table() {
        let sim = SimMachine::new(64 * 1024 * 1024);
        let mut ctx = PagingContext::new(
            &sim,
            ListAlloc::new(512, 1024),
            ListAlloc::new(1024, 2048),
            0,
        );
        let space = AddressSpace::new(&mut ctx).expect("address space");

        assert_eq!(ctx.kernel_pool().available(), 510);
        let dir = space.directory_frame().base();
        assert_eq!(sim.read_phys_u32(dir), 0x0020_1003);
        let table = PhysicalFrame::new(513).base();
        assert_eq!(sim.read_phys_u32(table), 0b010);
        assert_eq!(sim.read_phys_u32(table + 1023 * 4), 0b010);
    }

    #[test]
    fn failed_construction_returns_its_frames() {
        let sim = SimMachine::new(64 * 1024 * 1024);
        let mut ctx = PagingContext::new(
            &sim,
            ListAlloc::new(512, 513),
            ListAlloc::new(1024, 2048),
            SHARED,
        );

        assert!(matches!(
            AddressSpace::new(&mut ctx),
            Err(AddressSpaceError::OutOfMemory(FrameAllocError::OutOfMemory))
        ));
        assert_eq!(ctx.kernel_pool().available(), 1);
    }
}
