//! # Typed 32-bit x86 Control Registers
//!
//! Bit-exact models of the registers the paging code touches:
//!
//! | Register | Role |
//! |----------|------|
//! | [`Cr0`](cr0::Cr0) | `PG` (bit 31) turns address translation on. |
//! | [`Cr2`](cr2::Cr2) | Linear address of the most recent page fault. |
//! | [`Cr3`](cr3::Cr3) | Physical base of the active page directory. |
//! | [`Eflags`](eflags::Eflags) | `IF` (bit 9) tells whether interrupts are enabled. |
//!
//! The bit layouts are always available; the `asm` feature additionally
//! provides [`LoadRegisterUnsafe`]/[`StoreRegisterUnsafe`] implementations when
//! compiling for `target_arch = "x86"`.

#![cfg_attr(not(any(test, doctest)), no_std)]
#![allow(unsafe_code)]

#[cfg(feature = "cr0")]
pub mod cr0;

#[cfg(feature = "cr2")]
pub mod cr2;

#[cfg(feature = "cr3")]
pub mod cr3;

#[cfg(feature = "eflags")]
pub mod eflags;

pub trait LoadRegisterUnsafe {
    /// # Safety
    /// The caller must uphold the implementation-specific safety requirements.
    /// For example, the register access might be privileged and require kernel mode (Ring 0).
    unsafe fn load_unsafe() -> Self;
}

pub trait StoreRegisterUnsafe {
    /// # Safety
    /// The caller must uphold the implementation-specific safety requirements.
    /// For example, the register access might be privileged and require kernel mode (Ring 0).
    unsafe fn store_unsafe(self);
}

pub trait LoadRegister {
    /// # Safety
    /// It is generally safe to load this register even from user mode.
    fn load() -> Self;
}

impl<T> LoadRegisterUnsafe for T
where
    T: LoadRegister,
{
    #[inline]
    unsafe fn load_unsafe() -> Self {
        <Self as LoadRegister>::load()
    }
}
