//! Virtual windows claimed by region sets.
//!
//! The fault handler consults the registry to decide whether a faulting
//! address may be backed on demand. Registration is append-only.

use alloc::vec::Vec;
use kernel_memory_addresses::VirtualAddress;

/// A half-open virtual range `[base, base + size)`.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct VirtualWindow {
    base: VirtualAddress,
    size: u32,
}

impl VirtualWindow {
    #[inline]
    #[must_use]
    pub const fn new(base: VirtualAddress, size: u32) -> Self {
        Self { base, size }
    }

    #[inline]
    #[must_use]
    pub const fn base(&self) -> VirtualAddress {
        self.base
    }

    #[inline]
    #[must_use]
    pub const fn size(&self) -> u32 {
        self.size
    }

    /// One past the last byte; may be `2^32` for a window ending at the top.
    #[inline]
    #[must_use]
    pub fn end(&self) -> u64 {
        u64::from(self.base.as_u32()) + u64::from(self.size)
    }

    #[inline]
    #[must_use]
    pub fn contains(&self, va: VirtualAddress) -> bool {
        let va = u64::from(va.as_u32());
        u64::from(self.base.as_u32()) <= va && va < self.end()
    }

    #[inline]
    #[must_use]
    pub fn overlaps(&self, other: &Self) -> bool {
        u64::from(self.base.as_u32()) < other.end() && u64::from(other.base.as_u32()) < self.end()
    }
}

/// Handle returned by [`RegionRegistry::register`].
#[derive(Debug, Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct RegionSetId(usize);

impl RegionSetId {
    #[inline]
    #[must_use]
    pub const fn index(self) -> usize {
        self.0
    }
}

#[derive(Debug, Default)]
pub struct RegionRegistry {
    windows: Vec<VirtualWindow>,
}

impl RegionRegistry {
    #[must_use]
    pub const fn new() -> Self {
        Self {
            windows: Vec::new(),
        }
    }

    pub fn register(&mut self, window: VirtualWindow) -> RegionSetId {
        self.windows.push(window);
        RegionSetId(self.windows.len() - 1)
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.windows.is_empty()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.windows.len()
    }

    #[must_use]
    pub fn get(&self, id: RegionSetId) -> Option<VirtualWindow> {
        self.windows.get(id.0).copied()
    }

    /// Whether any registered window contains `va`.
    #[must_use]
    pub fn is_legitimate(&self, va: VirtualAddress) -> bool {
        self.windows.iter().any(|w| w.contains(va))
    }

    pub fn iter(&self) -> impl Iterator<Item = &VirtualWindow> {
        self.windows.iter()
    }
}
