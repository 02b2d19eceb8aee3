//! # Paging Context
//!
//! Everything the paging code needs that is not part of a single address
//! space: the two frame pools, the currently loaded directory, whether
//! translation is on, and the registry of region-set windows.
//!
//! The fault handler ([`PagingContext::handle_fault`]) and page release
//! ([`PagingContext::free_page`]) only ever touch tables through the
//! [`RecursiveWindow`], so they operate on whatever directory is loaded.

use crate::fault::{FaultError, FaultOutcome, FreePageError, PageFaultError};
use crate::page_table::pd::DirectoryIndex;
use crate::page_table::pt::PtEntry;
use crate::page_table::split_indices;
use crate::recursive::{RECURSIVE_SLOT, RecursiveWindow};
use crate::registry::{RegionRegistry, RegionSetId, VirtualWindow};
use crate::{AddressSpaceError, FrameAlloc, FrameAllocError, Mmu, PageEntryBits};
use kernel_memory_addresses::{PhysicalAddress, PhysicalFrame, VirtualAddress};
use log::{debug, info, warn};

pub struct PagingContext<'m, M: Mmu, K: FrameAlloc, P: FrameAlloc> {
    mmu: &'m M,
    /// Directories and the tables of the shared range.
    kernel_pool: K,
    /// Tables and data frames created on demand.
    process_pool: P,
    shared_size: u32,
    registry: RegionRegistry,
    current: Option<PhysicalFrame>,
    translating: bool,
}

impl<'m, M: Mmu, K: FrameAlloc, P: FrameAlloc> PagingContext<'m, M, K, P> {
    /// Create the context. Must precede every [`AddressSpace`](crate::AddressSpace).
    pub fn new(mmu: &'m M, kernel_pool: K, process_pool: P, shared_size: u32) -> Self {
        info!("Paging context ready, shared range {shared_size:#x} bytes");
        Self {
            mmu,
            kernel_pool,
            process_pool,
            shared_size,
            registry: RegionRegistry::new(),
            current: None,
            translating: false,
        }
    }

    #[inline]
    pub const fn mmu(&self) -> &'m M {
        self.mmu
    }

    #[inline]
    pub const fn shared_size(&self) -> u32 {
        self.shared_size
    }

    #[inline]
    pub const fn kernel_pool(&self) -> &K {
        &self.kernel_pool
    }

    #[inline]
    pub const fn kernel_pool_mut(&mut self) -> &mut K {
        &mut self.kernel_pool
    }

    #[inline]
    pub const fn process_pool(&self) -> &P {
        &self.process_pool
    }

    #[inline]
    pub const fn process_pool_mut(&mut self) -> &mut P {
        &mut self.process_pool
    }

    #[inline]
    pub const fn registry(&self) -> &RegionRegistry {
        &self.registry
    }

    /// Directory frame last installed with [`AddressSpace::load`](crate::AddressSpace::load).
    #[inline]
    pub const fn current(&self) -> Option<PhysicalFrame> {
        self.current
    }

    #[inline]
    pub const fn is_translating(&self) -> bool {
        self.translating
    }

    pub(crate) const fn set_current(&mut self, directory: PhysicalFrame) {
        self.current = Some(directory);
    }

    /// Turn on address translation for the loaded directory.
    ///
    /// # Errors
    /// [`AddressSpaceError::NoDirectoryLoaded`] if nothing was loaded yet.
    pub fn enable_translation(&mut self) -> Result<(), AddressSpaceError> {
        let Some(directory) = self.current else {
            return Err(AddressSpaceError::NoDirectoryLoaded);
        };
        // SAFETY: the loaded directory identity-maps the shared range the kernel runs in.
        unsafe { self.mmu.enable_translation() };
        self.translating = true;
        info!("Paging enabled, directory at {directory}");
        Ok(())
    }

    /// Register the window of a region set; faults outside every registered
    /// window are rejected from now on.
    pub fn register_region_set(&mut self, window: VirtualWindow) -> RegionSetId {
        if self.registry.iter().any(|w| w.overlaps(&window)) {
            warn!(
                "Region window {} (+{:#x}) overlaps a registered window",
                window.base(),
                window.size()
            );
        }
        let id = self.registry.register(window);
        debug!(
            "Registered region window {} (+{:#x}) as #{}",
            window.base(),
            window.size(),
            id.index()
        );
        id
    }

    /// Resolve a page fault at `address`.
    ///
    /// Installs a page table for the directory slot if it is missing, then a
    /// data frame for the page. Both come from the process pool and are mapped
    /// present, user, read/write.
    ///
    /// # Errors
    /// - [`FaultError::TranslationDisabled`] before paging is enabled.
    /// - [`FaultError::ProtectionViolation`] for faults on present pages.
    /// - [`FaultError::InvalidAddress`] when region sets are registered and
    ///   none of them contains `address`.
    /// - [`FaultError::RecursiveWindow`] for addresses in directory slot 1023.
    /// - [`FaultError::OutOfMemory`] when the process pool is exhausted.
    pub fn handle_fault(
        &mut self,
        address: VirtualAddress,
        error: PageFaultError,
    ) -> Result<FaultOutcome, FaultError> {
        if !self.translating {
            return Err(FaultError::TranslationDisabled(address));
        }
        if error.present() {
            warn!("Page fault at {address}: {}", error.explain());
            return Err(FaultError::ProtectionViolation {
                address,
                reason: error.explain(),
            });
        }
        if !self.registry.is_empty() && !self.registry.is_legitimate(address) {
            warn!("Page fault at {address} outside every region set");
            return Err(FaultError::InvalidAddress(address));
        }

        let (d, t) = split_indices(address);
        if d == RECURSIVE_SLOT {
            return Err(FaultError::RecursiveWindow(address));
        }

        // SAFETY: translation is on and every directory carries the self-reference.
        let mut window = unsafe { RecursiveWindow::new(self.mmu) };
        let pool = &mut self.process_pool;
        let (table, table_frame) = window
            .ensure_table(d, || pool.alloc_4k())
            .map_err(|source| FaultError::OutOfMemory { address, source })?;

        let mut outcome = FaultOutcome {
            table: table_frame,
            page: None,
        };
        if !table.get(t).is_present() {
            let frame = self
                .process_pool
                .alloc_4k()
                .map_err(|source| FaultError::OutOfMemory { address, source })?;
            table.set(t, PtEntry::from_bits(PageEntryBits::new_user_rw(frame)));
            outcome.page = Some(frame);
        }

        debug!(
            "Page fault at {address} resolved: table {:?}, page {:?}",
            outcome.table, outcome.page
        );
        Ok(outcome)
    }

    /// Unmap the page containing `address` and return its frame to the
    /// process pool.
    ///
    /// Returns the released frame, or `None` if the page was never mapped.
    /// The active directory is reloaded afterwards to drop stale translations.
    ///
    /// # Errors
    /// - [`FreePageError::TranslationDisabled`] before paging is enabled.
    /// - [`FreePageError::SharedRange`] for addresses in the identity-mapped
    ///   shared range.
    /// - [`FreePageError::RecursiveWindow`] for addresses in directory slot 1023.
    /// - [`FreePageError::Release`] if the process pool does not take the
    ///   frame back; the mapping is left in place.
    pub fn free_page(
        &mut self,
        address: VirtualAddress,
    ) -> Result<Option<PhysicalFrame>, FreePageError> {
        if !self.translating {
            return Err(FreePageError::TranslationDisabled(address));
        }
        if address.as_u32() < self.shared_size {
            warn!("Refusing to free {address} inside the shared range");
            return Err(FreePageError::SharedRange(address));
        }
        let (d, t) = split_indices(address);
        if d == RECURSIVE_SLOT {
            return Err(FreePageError::RecursiveWindow(address));
        }

        // SAFETY: translation is on and every directory carries the self-reference.
        let mut window = unsafe { RecursiveWindow::new(self.mmu) };
        let Some(table) = window.table(d) else {
            return Ok(None);
        };
        let Some(frame) = table.get(t).frame() else {
            return Ok(None);
        };

        let released = if self.process_pool.owns(frame) {
            self.process_pool.free_4k(frame)
        } else {
            Err(FrameAllocError::NotOwned(frame))
        };
        released.map_err(|source| FreePageError::Release {
            page: address,
            frame,
            source,
        })?;
        table.set(t, PtEntry::from_bits(PageEntryBits::absent_user()));

        if let Some(directory) = self.current {
            // SAFETY: reloading the active directory only flushes the TLB.
            unsafe { self.mmu.load_directory(directory) };
        }
        debug!("Freed page {} (frame {frame})", address.page());
        Ok(Some(frame))
    }

    /// Translate `address` with the loaded directory.
    ///
    /// Before translation is enabled every address is physical and is
    /// returned unchanged.
    #[must_use]
    pub fn translate(&self, address: VirtualAddress) -> Option<PhysicalAddress> {
        if !self.translating {
            return Some(PhysicalAddress::new(address.as_u32()));
        }

        // SAFETY: translation is on and every directory carries the self-reference.
        let mut window = unsafe { RecursiveWindow::new(self.mmu) };
        let (d, t) = split_indices(address);
        let frame = if d == RECURSIVE_SLOT {
            let slot = DirectoryIndex::new(t.as_u16());
            window.directory().get(slot).next_table()?
        } else {
            window.table(d)?.get(t).frame()?
        };
        Some(frame.join(address.offset()))
    }
}
