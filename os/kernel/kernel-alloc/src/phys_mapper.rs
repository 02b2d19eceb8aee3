//! # Identity-mapped PhysMapper and x86 MMU
//!
//! The kernel's shared range `[0, shared_size)` is identity-mapped in every
//! address space, so a physical address below it can be dereferenced as-is
//! whether or not translation is on. Frame-pool bitmaps and page directories
//! come from the kernel pool, which lies inside that range.
//!
//! [`X86Mmu`] drives the real control registers on 32-bit x86:
//! CR3 for the directory (and TLB flushes), CR0.PG for translation.

use kernel_memory_addresses::PhysicalAddress;
#[cfg(target_arch = "x86")]
use kernel_memory_addresses::{PhysicalFrame, VirtualAddress};
use kernel_vmem::PhysMapper;

/// [`PhysMapper`] and [`Mmu`](kernel_vmem::Mmu) for a kernel running in an
/// identity-mapped low range.
///
/// # Safety
/// - Physical addresses passed to [`PhysMapper::phys_to_mut`] must lie in the
///   identity-mapped shared range once translation is enabled.
#[derive(Debug, Default, Copy, Clone)]
pub struct X86Mmu;

impl X86Mmu {
    /// # Safety
    /// `address` must be mapped to itself and hold a valid `T`.
    #[inline]
    unsafe fn identity<'a, T>(address: u32) -> &'a mut T {
        unsafe { &mut *(address as usize as *mut T) }
    }

    /// Read the faulting address from CR2.
    ///
    /// # Safety
    /// Must run at CPL0, inside the page-fault handler.
    #[cfg(target_arch = "x86")]
    #[must_use]
    pub unsafe fn faulting_address() -> VirtualAddress {
        use kernel_registers::LoadRegisterUnsafe;
        use kernel_registers::cr2::Cr2;
        unsafe { Cr2::load_unsafe() }.faulting_address()
    }
}

impl PhysMapper for X86Mmu {
    unsafe fn phys_to_mut<'a, T>(&self, pa: PhysicalAddress) -> &'a mut T {
        // SAFETY: forwarded to the caller.
        unsafe { Self::identity(pa.as_u32()) }
    }
}

#[cfg(target_arch = "x86")]
impl kernel_vmem::Mmu for X86Mmu {
    unsafe fn load_directory(&self, directory: PhysicalFrame) {
        use kernel_registers::StoreRegisterUnsafe;
        use kernel_registers::cr3::Cr3;
        unsafe { Cr3::from_directory(directory, false, false).store_unsafe() };
    }

    unsafe fn enable_translation(&self) {
        use kernel_registers::cr0::Cr0;
        use kernel_registers::{LoadRegisterUnsafe, StoreRegisterUnsafe};
        let cr0 = unsafe { Cr0::load_unsafe() };
        unsafe { cr0.with_pg_paging(true).store_unsafe() };
    }

    unsafe fn virt_to_mut<'a, T>(&self, va: VirtualAddress) -> &'a mut T {
        // SAFETY: forwarded to the caller.
        unsafe { Self::identity(va.as_u32()) }
    }
}
