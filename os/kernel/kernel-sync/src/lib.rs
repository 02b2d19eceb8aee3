//! # Kernel synchronization primitives
//!
//! The memory manager runs on a single processor; the only concurrency it has
//! to guard against is an interrupt arriving in the middle of a frame-pool or
//! page-table update. [`IrqGuard`] masks interrupts for the length of a scope.

#![cfg_attr(not(any(test, doctest)), no_std)]
#![allow(unsafe_code)]

pub mod irq;

pub use irq::IrqGuard;
