//! # Memory Layout

use kernel_memory_addresses::{PAGE_SHIFT, PAGE_SIZE};

const MIB: u32 = 1024 * 1024;

/// First frame of the kernel frame pool (2 MiB).
pub const KERNEL_POOL_START_FRAME: u32 = (2 * MIB) >> PAGE_SHIFT;

/// Number of frames in the kernel frame pool (2 MiB worth).
pub const KERNEL_POOL_FRAMES: u32 = (2 * MIB) >> PAGE_SHIFT;

/// First frame of the process frame pool (4 MiB).
pub const PROCESS_POOL_START_FRAME: u32 = (4 * MIB) >> PAGE_SHIFT;

/// Number of frames in the process frame pool (28 MiB worth).
pub const PROCESS_POOL_FRAMES: u32 = (28 * MIB) >> PAGE_SHIFT;

/// First frame of the ISA memory hole (15 MiB). Not backed by usable RAM.
pub const MEM_HOLE_START_FRAME: u32 = (15 * MIB) >> PAGE_SHIFT;

/// Number of frames in the ISA memory hole.
pub const MEM_HOLE_FRAMES: u32 = MIB >> PAGE_SHIFT;

/// Bytes at the bottom of every address space that are identity-mapped
/// eagerly instead of demand-paged.
pub const SHARED_SIZE: u32 = 4 * MIB;

/// Virtual window handed to the first kernel VM pool (512 MiB).
pub const KERNEL_HEAP_BASE: u32 = 512 * MIB;

/// Capacity of the first kernel VM pool.
pub const KERNEL_HEAP_SIZE: u32 = 256 * MIB;

const _: () = {
    assert!(SHARED_SIZE.is_multiple_of(PAGE_SIZE));
    assert!(KERNEL_POOL_START_FRAME + KERNEL_POOL_FRAMES <= SHARED_SIZE >> PAGE_SHIFT);
    assert!(PROCESS_POOL_START_FRAME >= KERNEL_POOL_START_FRAME + KERNEL_POOL_FRAMES);
    assert!(MEM_HOLE_START_FRAME >= PROCESS_POOL_START_FRAME);
    assert!(MEM_HOLE_START_FRAME + MEM_HOLE_FRAMES <= PROCESS_POOL_START_FRAME + PROCESS_POOL_FRAMES);
    assert!(KERNEL_HEAP_BASE >= SHARED_SIZE);
};
