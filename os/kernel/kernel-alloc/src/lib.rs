//! # Kernel Memory Allocation and Virtual Memory Management
//!
//! Physical frame pools, virtual region sets and the bring-up that ties them
//! to the paging code in `kernel-vmem`.
//!
//! ```text
//! ┌─────────────────────────────────────────────────────┐
//! │          Virtual Memory Manager ([`vmm`])           │
//! │    • boot bring-up of pools and kernel directory    │
//! │    • page-fault entry with interrupts masked        │
//! └─────────────────┬───────────────────────────────────┘
//!                   │
//! ┌─────────────────▼───────────────────────────────────┐
//! │           Region sets ([`vm_pool`])                 │
//! │    • lazily committed regions in a virtual window   │
//! │    • window registered for fault validation         │
//! └─────────────────┬───────────────────────────────────┘
//!                   │  (through `PagingContext`)
//! ┌─────────────────▼───────────────────────────────────┐
//! │     Contiguous frame pools ([`cont_frame_pool`])    │
//! │    • runs of 4 KiB frames, first fit                │
//! │    • 2-bit Free / Allocated / HeadOfSequence states │
//! └─────────────────────────────────────────────────────┘
//! ```
//!
//! [`phys_mapper`] provides the identity-mapped [`PhysMapper`](kernel_vmem::PhysMapper)
//! and the register-level [`Mmu`](kernel_vmem::Mmu) for 32-bit x86 hardware;
//! host tests use the simulated machine from `kernel-vmem` instead.

#![cfg_attr(not(any(test, doctest)), no_std)]
#![allow(unsafe_code)]

extern crate alloc;

pub mod cont_frame_pool;
pub mod phys_mapper;
pub mod vm_pool;
pub mod vmm;
