//! # Kernel Configuration
//!
//! The fixed physical and virtual memory layout the memory-management crates
//! are built against.
//!
//! ## Physical Memory Layout
//!
//! ```text
//! 0x0000_0000 ┌─────────────────────────────────┐
//!             │ Legacy / BIOS / kernel image    │  identity-mapped, never pooled
//! 0x0020_0000 ├─────────────────────────────────┤  KERNEL_POOL_START_FRAME
//!             │ Kernel frame pool (2 MiB)       │  page-table structures, pool bitmaps
//! 0x0040_0000 ├─────────────────────────────────┤  PROCESS_POOL_START_FRAME = SHARED_SIZE
//!             │ Process frame pool (28 MiB)     │  demand-paged data frames
//! 0x00F0_0000 │   ┌─────────────────────────┐   │  MEM_HOLE_START_FRAME
//!             │   │ ISA memory hole (1 MiB) │   │  reserved at bring-up
//! 0x0100_0000 │   └─────────────────────────┘   │
//! 0x0200_0000 └─────────────────────────────────┘
//! ```
//!
//! Everything below [`memory::SHARED_SIZE`] is identity-mapped into every
//! address space, which is what lets the fault handler touch the frame-pool
//! bitmaps without faulting again.

#![cfg_attr(not(any(test, doctest)), no_std)]

pub mod memory;
