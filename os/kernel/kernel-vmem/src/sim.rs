//! # Simulated Machine
//!
//! A host-side stand-in for physical RAM and the MMU, used by tests and by
//! anything built with the `sim` feature.
//!
//! - RAM is sparse: frames spring into existence, zeroed, on first touch.
//! - CR3 and CR0.PG are plain cells; [`Mmu::load_directory`] counts reloads.
//! - With translation on, every virtual access walks the loaded directory
//!   exactly like the hardware, so the recursive slot works unmodified.
//! - A translated access to an unmapped address from kernel code is a nested
//!   page fault and panics. Callers emulating user accesses use
//!   [`SimMachine::read_u32`]/[`SimMachine::write_u32`], which report a
//!   [`SimFault`] instead.

use crate::fault::PageFaultError;
use crate::{Mmu, PhysMapper};
use alloc::boxed::Box;
use alloc::collections::BTreeMap;
use core::cell::{Cell, RefCell};
use kernel_memory_addresses::{PAGE_SIZE, PhysicalAddress, PhysicalFrame, VirtualAddress};

#[repr(C, align(4096))]
struct Frame([u8; PAGE_SIZE as usize]);

/// A faulting access, as the processor would report it in CR2 and the error code.
#[derive(Debug, Copy, Clone)]
pub struct SimFault {
    pub address: VirtualAddress,
    pub error: PageFaultError,
}

pub struct SimMachine {
    ram: RefCell<BTreeMap<u32, Box<Frame>>>,
    frames: u32,
    cr3: Cell<Option<PhysicalFrame>>,
    paging: Cell<bool>,
    loads: Cell<usize>,
}

impl SimMachine {
    /// A machine with `memory_bytes` of physical RAM.
    #[must_use]
    pub const fn new(memory_bytes: u32) -> Self {
        Self {
            ram: RefCell::new(BTreeMap::new()),
            frames: memory_bytes / PAGE_SIZE,
            cr3: Cell::new(None),
            paging: Cell::new(false),
            loads: Cell::new(0),
        }
    }

    #[must_use]
    pub fn is_paging_enabled(&self) -> bool {
        self.paging.get()
    }

    /// The directory frame in CR3.
    #[must_use]
    pub fn directory(&self) -> Option<PhysicalFrame> {
        self.cr3.get()
    }

    /// How many times CR3 was written.
    #[must_use]
    pub fn directory_loads(&self) -> usize {
        self.loads.get()
    }

    /// Number of distinct frames ever touched.
    #[must_use]
    pub fn touched_frames(&self) -> usize {
        self.ram.borrow().len()
    }

    /// # Panics
    /// If `frame` lies beyond the simulated RAM.
    fn frame_ptr(&self, frame: PhysicalFrame) -> *mut u8 {
        assert!(
            frame.number() < self.frames,
            "physical frame {frame} beyond simulated RAM"
        );
        let mut ram = self.ram.borrow_mut();
        let slot = ram
            .entry(frame.number())
            .or_insert_with(|| Box::new(Frame([0; PAGE_SIZE as usize])));
        slot.0.as_mut_ptr()
    }

    fn read_entry(&self, table: PhysicalFrame, index: u32) -> u32 {
        self.read_phys_u32(table.join(index * 4))
    }

    /// Translate `va` like the hardware would, or `None` if the walk hits a
    /// not-present entry.
    #[must_use]
    pub fn walk(&self, va: VirtualAddress) -> Option<PhysicalAddress> {
        if !self.paging.get() {
            return Some(PhysicalAddress::new(va.as_u32()));
        }
        let directory = self.cr3.get()?;
        let pde = self.read_entry(directory, va.as_u32() >> 22);
        if pde & 1 == 0 {
            return None;
        }
        let pte = self.read_entry(PhysicalFrame::new(pde >> 12), (va.as_u32() >> 12) & 0x3FF);
        if pte & 1 == 0 {
            return None;
        }
        Some(PhysicalFrame::new(pte >> 12).join(va.offset()))
    }

    /// Read a physical word, bypassing translation.
    #[must_use]
    pub fn read_phys_u32(&self, pa: PhysicalAddress) -> u32 {
        let p = self.frame_ptr(pa.frame());
        // SAFETY: the frame is 4096 bytes and the word does not cross it.
        unsafe { p.add(pa.offset() as usize).cast::<u32>().read_unaligned() }
    }

    /// Write a physical word, bypassing translation.
    pub fn write_phys_u32(&self, pa: PhysicalAddress, value: u32) {
        let p = self.frame_ptr(pa.frame());
        // SAFETY: as in `read_phys_u32`.
        unsafe { p.add(pa.offset() as usize).cast::<u32>().write_unaligned(value) }
    }

    /// Read a word through the current translation.
    ///
    /// # Errors
    /// A not-present fault at `va`.
    pub fn read_u32(&self, va: VirtualAddress) -> Result<u32, SimFault> {
        let pa = self.walk(va).ok_or(SimFault {
            address: va,
            error: PageFaultError::new(),
        })?;
        Ok(self.read_phys_u32(pa))
    }

    /// Write a word through the current translation.
    ///
    /// # Errors
    /// A not-present write fault at `va`.
    pub fn write_u32(&self, va: VirtualAddress, value: u32) -> Result<(), SimFault> {
        let pa = self.walk(va).ok_or(SimFault {
            address: va,
            error: PageFaultError::not_present_write(),
        })?;
        self.write_phys_u32(pa, value);
        Ok(())
    }
}

impl PhysMapper for SimMachine {
    unsafe fn phys_to_mut<'a, T>(&self, pa: PhysicalAddress) -> &'a mut T {
        debug_assert!(pa.offset() as usize + size_of::<T>() <= PAGE_SIZE as usize);
        let p = self.frame_ptr(pa.frame());
        // SAFETY: frames are boxed and never freed, so the pointer outlives 'a.
        unsafe { &mut *p.add(pa.offset() as usize).cast::<T>() }
    }
}

impl Mmu for SimMachine {
    unsafe fn load_directory(&self, directory: PhysicalFrame) {
        self.cr3.set(Some(directory));
        self.loads.set(self.loads.get() + 1);
    }

    unsafe fn enable_translation(&self) {
        assert!(self.cr3.get().is_some(), "CR0.PG set without a directory in CR3");
        self.paging.set(true);
    }

    unsafe fn virt_to_mut<'a, T>(&self, va: VirtualAddress) -> &'a mut T {
        let Some(pa) = self.walk(va) else {
            panic!("nested page fault at {va}");
        };
        // SAFETY: forwarded to the caller.
        unsafe { self.phys_to_mut(pa) }
    }
}
