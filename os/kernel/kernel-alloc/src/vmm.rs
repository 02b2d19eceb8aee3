//! Virtual Memory Manager (VMM) bring-up for the kernel.
//!
//! [`Vmm::bootstrap`] turns the fixed physical layout into working paging:
//!
//! 1. kernel pool over frames 512..1024, bitmap in its own first frame;
//! 2. process pool over frames 1024..8192, bitmap in a kernel-pool frame;
//! 3. the ISA memory hole (15 MiB – 16 MiB) reserved in the process pool;
//! 4. the kernel address space built, loaded, and translation enabled.
//!
//! Afterwards [`Vmm::page_fault`] is the body of the page-fault trap.
//!
//! # Example
//! ```ignore
//! use kernel_alloc::{phys_mapper::X86Mmu, vmm::{MemoryLayout, Vmm}};
//! let mut vmm = Vmm::bootstrap(&X86Mmu, MemoryLayout::default())?;
//! let mut heap = vmm.new_vm_pool(KERNEL_HEAP_BASE, KERNEL_HEAP_SIZE)?;
//! ```

use crate::cont_frame_pool::{ContFramePool, FramePoolError};
use crate::vm_pool::{VmPool, VmPoolError};
use core::hint::spin_loop;
use kernel_info::memory::{
    KERNEL_POOL_FRAMES, KERNEL_POOL_START_FRAME, MEM_HOLE_FRAMES, MEM_HOLE_START_FRAME,
    PROCESS_POOL_FRAMES, PROCESS_POOL_START_FRAME, SHARED_SIZE,
};
use kernel_memory_addresses::{PhysicalFrame, VirtualAddress};
use kernel_sync::IrqGuard;
use kernel_vmem::{
    AddressSpace, AddressSpaceError, FaultError, FaultOutcome, Mmu, PageFaultError, PagingContext,
};
use log::{error, info};

/// The paging context as the kernel uses it: two contiguous frame pools.
pub type KernelContext<'m, M> = PagingContext<'m, M, ContFramePool<'m>, ContFramePool<'m>>;

#[derive(Debug, Copy, Clone, Eq, PartialEq, thiserror::Error)]
pub enum VmmError {
    #[error("frame pool setup failed: {0}")]
    FramePool(#[from] FramePoolError),
    #[error("kernel address space setup failed: {0}")]
    AddressSpace(#[from] AddressSpaceError),
}

/// Physical memory layout handed to [`Vmm::bootstrap`].
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct MemoryLayout {
    pub kernel_pool_start: PhysicalFrame,
    pub kernel_pool_frames: u32,
    pub process_pool_start: PhysicalFrame,
    pub process_pool_frames: u32,
    /// Frames inside the process pool that must never be handed out.
    pub hole: Option<(PhysicalFrame, u32)>,
    /// Bytes identity-mapped at the bottom of every address space.
    pub shared_size: u32,
}

impl MemoryLayout {
    /// The layout the kernel is linked for.
    #[must_use]
    pub const fn kernel() -> Self {
        Self {
            kernel_pool_start: PhysicalFrame::new(KERNEL_POOL_START_FRAME),
            kernel_pool_frames: KERNEL_POOL_FRAMES,
            process_pool_start: PhysicalFrame::new(PROCESS_POOL_START_FRAME),
            process_pool_frames: PROCESS_POOL_FRAMES,
            hole: Some((PhysicalFrame::new(MEM_HOLE_START_FRAME), MEM_HOLE_FRAMES)),
            shared_size: SHARED_SIZE,
        }
    }
}

impl Default for MemoryLayout {
    fn default() -> Self {
        Self::kernel()
    }
}

pub struct Vmm<'m, M: Mmu> {
    ctx: KernelContext<'m, M>,
    kernel_space: AddressSpace,
    layout: MemoryLayout,
}

impl<'m, M: Mmu> Vmm<'m, M> {
    /// Build both frame pools and the kernel address space, load it and turn
    /// translation on.
    ///
    /// # Errors
    /// Any pool or address-space construction failure.
    pub fn bootstrap(mmu: &'m M, layout: MemoryLayout) -> Result<Self, VmmError> {
        let mut kernel_pool = ContFramePool::new(
            mmu,
            layout.kernel_pool_start,
            layout.kernel_pool_frames,
            None,
        )?;

        let needed = ContFramePool::needed_metadata_frames(layout.process_pool_frames);
        let bitmap = kernel_pool.allocate(needed)?;
        let mut process_pool = ContFramePool::new(
            mmu,
            layout.process_pool_start,
            layout.process_pool_frames,
            Some(bitmap),
        )?;

        if let Some((first, frames)) = layout.hole {
            process_pool.reserve(first, frames)?;
        }

        let mut ctx = PagingContext::new(mmu, kernel_pool, process_pool, layout.shared_size);
        let kernel_space = AddressSpace::new(&mut ctx)?;
        kernel_space.load(&mut ctx);
        ctx.enable_translation()?;

        info!(
            "VMM up: {} kernel and {} process frames free",
            ctx.kernel_pool().free_frames(),
            ctx.process_pool().free_frames()
        );
        Ok(Self {
            ctx,
            kernel_space,
            layout,
        })
    }

    /// Page-fault trap body: resolve the fault with interrupts masked.
    ///
    /// # Errors
    /// See [`PagingContext::handle_fault`].
    pub fn page_fault(
        &mut self,
        address: VirtualAddress,
        error: PageFaultError,
    ) -> Result<FaultOutcome, FaultError> {
        let _irq = IrqGuard::new();
        self.ctx.handle_fault(address, error)
    }

    /// Like [`page_fault`](Self::page_fault), but an unresolvable fault is
    /// logged and halts the processor.
    pub fn page_fault_or_halt(
        &mut self,
        address: VirtualAddress,
        error: PageFaultError,
    ) -> FaultOutcome {
        match self.page_fault(address, error) {
            Ok(outcome) => outcome,
            Err(e) => {
                error!("Unrecoverable page fault: {e} ({})", error.explain());
                halt()
            }
        }
    }

    /// Create a region set over `[base, base + capacity)`.
    ///
    /// # Errors
    /// See [`VmPool::new`].
    pub fn new_vm_pool(
        &mut self,
        base: VirtualAddress,
        capacity: u32,
    ) -> Result<VmPool, VmPoolError> {
        VmPool::new(base, capacity, &mut self.ctx)
    }

    /// Release a region of `pool`, returning its pages to the frame pools.
    ///
    /// # Errors
    /// See [`VmPool::release`].
    pub fn release(&mut self, pool: &mut VmPool, start: VirtualAddress) -> Result<(), VmPoolError> {
        let _irq = IrqGuard::new();
        pool.release(&mut self.ctx, start)
    }

    #[inline]
    pub const fn context(&self) -> &KernelContext<'m, M> {
        &self.ctx
    }

    #[inline]
    pub const fn context_mut(&mut self) -> &mut KernelContext<'m, M> {
        &mut self.ctx
    }

    #[inline]
    pub const fn kernel_space(&self) -> &AddressSpace {
        &self.kernel_space
    }

    #[inline]
    pub const fn layout(&self) -> &MemoryLayout {
        &self.layout
    }
}

#[cfg(target_arch = "x86")]
impl Vmm<'_, crate::phys_mapper::X86Mmu> {
    /// Entry for the page-fault trap stub: CR2 plus the pushed error code.
    ///
    /// # Safety
    /// Must be called from the page-fault handler at CPL0.
    pub unsafe fn handle_page_fault_trap(&mut self, error_code: u32) {
        // SAFETY: we are inside the page-fault handler.
        let address = unsafe { crate::phys_mapper::X86Mmu::faulting_address() };
        self.page_fault_or_halt(address, PageFaultError::from_bits(error_code));
    }
}

/// Stop making progress; the fault cannot be resolved.
pub fn halt() -> ! {
    loop {
        spin_loop();
    }
}
