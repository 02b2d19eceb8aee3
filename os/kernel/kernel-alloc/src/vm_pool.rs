//! # Virtual Memory Pool
//!
//! A region set: an ordered list of disjoint regions carved out of one
//! virtual window. Regions are committed lazily; the page-fault handler backs
//! each page on first touch as long as it lies inside a registered window.
//!
//! The first region is one page at the start of the window, reserved for
//! bookkeeping, and can never be released.

use alloc::vec;
use alloc::vec::Vec;
use kernel_memory_addresses::{PAGE_SIZE, VirtualAddress, align_up};
use kernel_vmem::recursive::in_window;
use kernel_vmem::{FrameAlloc, FreePageError, Mmu, PagingContext, RegionSetId, VirtualWindow};
use log::{debug, info, warn};

#[derive(Debug, Copy, Clone, Eq, PartialEq, thiserror::Error)]
pub enum VmPoolError {
    #[error("window at {base} (+{capacity:#x}) is unusable")]
    InvalidWindow { base: VirtualAddress, capacity: u32 },
    #[error("requested {requested:#x} bytes, {remaining:#x} remaining")]
    CapacityExceeded { requested: u32, remaining: u32 },
    #[error("no contiguous range of {0:#x} bytes left in the window")]
    NoContiguousRange(u32),
    #[error("no region starts at {0}")]
    RegionNotFound(VirtualAddress),
    #[error("region at {0} holds the pool's bookkeeping")]
    BookkeepingRegion(VirtualAddress),
    #[error(transparent)]
    FreePage(#[from] FreePageError),
}

/// A page-aligned virtual range handed out by [`VmPool::allocate`].
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct Region {
    start: VirtualAddress,
    length: u32,
}

impl Region {
    #[inline]
    #[must_use]
    pub const fn start(&self) -> VirtualAddress {
        self.start
    }

    #[inline]
    #[must_use]
    pub const fn length(&self) -> u32 {
        self.length
    }

    #[inline]
    #[must_use]
    pub fn end(&self) -> u64 {
        u64::from(self.start.as_u32()) + u64::from(self.length)
    }
}

#[derive(Debug)]
pub struct VmPool {
    id: RegionSetId,
    window: VirtualWindow,
    /// Allocation order; index 0 is the bookkeeping page.
    regions: Vec<Region>,
    remaining: u32,
}

impl VmPool {
    /// Claim `[base, base + capacity)` and register it with `ctx`.
    ///
    /// # Errors
    /// [`VmPoolError::InvalidWindow`] unless the window is page aligned, at
    /// least one page large, ends at or below 4 GiB, and avoids both the
    /// shared range and the recursive page-table window.
    pub fn new<M: Mmu, K: FrameAlloc, P: FrameAlloc>(
        base: VirtualAddress,
        capacity: u32,
        ctx: &mut PagingContext<'_, M, K, P>,
    ) -> Result<Self, VmPoolError> {
        let window = VirtualWindow::new(base, capacity);
        let shared = VirtualWindow::new(VirtualAddress::zero(), ctx.shared_size());
        let last = VirtualAddress::new(
            u32::try_from(window.end().saturating_sub(1)).unwrap_or(u32::MAX),
        );
        let valid = base.is_page_aligned()
            && capacity.is_multiple_of(PAGE_SIZE)
            && capacity >= PAGE_SIZE
            && window.end() <= 1 << 32
            && !window.overlaps(&shared)
            && !in_window(last);
        if !valid {
            warn!("Rejecting VM pool window {base} (+{capacity:#x})");
            return Err(VmPoolError::InvalidWindow { base, capacity });
        }

        let id = ctx.register_region_set(window);
        info!("VM pool #{} at {base} (+{capacity:#x})", id.index());
        Ok(Self {
            id,
            window,
            regions: vec![Region {
                start: base,
                length: PAGE_SIZE,
            }],
            remaining: capacity - PAGE_SIZE,
        })
    }

    /// Reserve `size` bytes, rounded up to whole pages, and return the start.
    ///
    /// Nothing is mapped; pages are backed on first touch.
    ///
    /// # Errors
    /// - [`VmPoolError::CapacityExceeded`] for `size == 0` or when the rounded
    ///   size exceeds the remaining capacity.
    /// - [`VmPoolError::NoContiguousRange`] when released regions left the
    ///   capacity scattered.
    pub fn allocate(&mut self, size: u32) -> Result<VirtualAddress, VmPoolError> {
        let exceeded = VmPoolError::CapacityExceeded {
            requested: size,
            remaining: self.remaining,
        };
        if size == 0 || size > self.remaining {
            return Err(exceeded);
        }
        let length = align_up(size, PAGE_SIZE).ok_or(exceeded)?;
        if length > self.remaining {
            return Err(exceeded);
        }

        let start = self
            .append_point(length)
            .or_else(|| self.first_gap(length))
            .ok_or(VmPoolError::NoContiguousRange(length))?;
        self.regions.push(Region { start, length });
        self.remaining -= length;
        debug!("VM pool #{}: region {start} (+{length:#x})", self.id.index());
        Ok(start)
    }

    /// Directly after the highest region, if `length` fits before the window end.
    fn append_point(&self, length: u32) -> Option<VirtualAddress> {
        let end = self.regions.iter().map(Region::end).max()?;
        if end + u64::from(length) > self.window.end() {
            return None;
        }
        u32::try_from(end).ok().map(VirtualAddress::new)
    }

    /// Lowest hole between regions that holds `length` bytes.
    fn first_gap(&self, length: u32) -> Option<VirtualAddress> {
        let mut sorted: Vec<Region> = self.regions.clone();
        sorted.sort_unstable_by_key(|r| r.start);
        sorted.windows(2).find_map(|pair| {
            let gap_start = pair[0].end();
            let fits = gap_start + u64::from(length) <= u64::from(pair[1].start.as_u32());
            fits.then_some(gap_start)
                .and_then(|start| u32::try_from(start).ok())
                .map(VirtualAddress::new)
        })
    }

    /// Release the region starting at `start` and every page backing it.
    ///
    /// # Errors
    /// - [`VmPoolError::RegionNotFound`] if no region starts at `start`.
    /// - [`VmPoolError::BookkeepingRegion`] for the first page of the window.
    /// - [`VmPoolError::FreePage`] if a backing page cannot be released; the
    ///   region stays allocated and the call may be retried.
    pub fn release<M: Mmu, K: FrameAlloc, P: FrameAlloc>(
        &mut self,
        ctx: &mut PagingContext<'_, M, K, P>,
        start: VirtualAddress,
    ) -> Result<(), VmPoolError> {
        let Some(index) = self.regions.iter().position(|r| r.start == start) else {
            warn!("VM pool #{}: no region at {start}", self.id.index());
            return Err(VmPoolError::RegionNotFound(start));
        };
        if index == 0 {
            return Err(VmPoolError::BookkeepingRegion(start));
        }

        let region = self.regions[index];
        for offset in (0..region.length).step_by(PAGE_SIZE as usize) {
            ctx.free_page(start + offset)?;
        }

        self.regions.remove(index);
        self.remaining += region.length;
        debug!(
            "VM pool #{}: released {start} (+{:#x})",
            self.id.index(),
            region.length
        );
        Ok(())
    }

    /// Whether `address` lies inside this pool's window.
    #[inline]
    #[must_use]
    pub fn is_legitimate(&self, address: VirtualAddress) -> bool {
        self.window.contains(address)
    }

    #[inline]
    #[must_use]
    pub const fn id(&self) -> RegionSetId {
        self.id
    }

    #[inline]
    #[must_use]
    pub const fn base_address(&self) -> VirtualAddress {
        self.window.base()
    }

    #[inline]
    #[must_use]
    pub const fn capacity(&self) -> u32 {
        self.window.size()
    }

    #[inline]
    #[must_use]
    pub const fn remaining_capacity(&self) -> u32 {
        self.remaining
    }

    /// Regions in allocation order, bookkeeping page first.
    #[inline]
    #[must_use]
    pub fn regions(&self) -> &[Region] {
        &self.regions
    }
}
