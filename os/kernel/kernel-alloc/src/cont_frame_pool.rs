//! # Contiguous Frame Pool
//!
//! Hands out runs of physically contiguous 4 KiB frames from a fixed range.
//!
//! Every frame carries one of three states, packed two bits per frame into
//! bitmap frames that live in physical memory (inside this pool or in a frame
//! taken from another pool):
//!
//! | Bits | State | Meaning |
//! |------|-------|---------|
//! | `00` | [`Free`](FrameState::Free) | available |
//! | `01` | [`Allocated`](FrameState::Allocated) | inside a run, not its first frame |
//! | `10` | [`HeadOfSequence`](FrameState::HeadOfSequence) | first frame of a run |
//! | `11` | n/a | never written; reading it means the bitmap is corrupt |
//!
//! A run is released by naming its head; the run extends over the following
//! `Allocated` frames. Allocation is first-fit from the lowest frame.

use alloc::vec::Vec;
use kernel_memory_addresses::{PAGE_SIZE, PhysicalFrame};
use kernel_vmem::{FrameAlloc, FrameAllocError, PhysMapper};
use log::{debug, info, warn};

/// Frames whose state fits in one bitmap frame (2 bits each).
pub const FRAMES_PER_METADATA_FRAME: u32 = PAGE_SIZE * 4;

/// Allocation state of a single frame.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum FrameState {
    Free,
    Allocated,
    HeadOfSequence,
}

impl FrameState {
    const fn into_bits(self) -> u8 {
        match self {
            Self::Free => 0b00,
            Self::Allocated => 0b01,
            Self::HeadOfSequence => 0b10,
        }
    }

    const fn from_bits(bits: u8) -> Option<Self> {
        match bits {
            0b00 => Some(Self::Free),
            0b01 => Some(Self::Allocated),
            0b10 => Some(Self::HeadOfSequence),
            _ => None,
        }
    }
}

#[derive(Debug, Copy, Clone, Eq, PartialEq, thiserror::Error)]
pub enum FramePoolError {
    #[error("requested {requested} frame(s) but only {free} are free")]
    OutOfMemory { requested: u32, free: u32 },
    #[error("no run of {0} contiguous free frames")]
    NoContiguousRun(u32),
    #[error("a run must contain at least one frame")]
    EmptyRequest,
    #[error("frame {0} is not owned by any pool")]
    NotOwned(PhysicalFrame),
    #[error("frame {0} is not the head of an allocated run")]
    NotRunHead(PhysicalFrame),
    #[error("frame {0} holds the pool's own bitmap")]
    MetadataRun(PhysicalFrame),
    #[error("run of {count} frame(s) at {first} leaves the pool")]
    ReserveOutOfRange { first: PhysicalFrame, count: u32 },
    #[error("frame {0} is not free")]
    ReserveNotFree(PhysicalFrame),
    #[error("bitmap entry of frame {0} is corrupt")]
    CorruptState(PhysicalFrame),
}

impl From<FramePoolError> for FrameAllocError {
    fn from(value: FramePoolError) -> Self {
        match value {
            FramePoolError::NotOwned(frame) => Self::NotOwned(frame),
            FramePoolError::NotRunHead(frame) | FramePoolError::MetadataRun(frame) => {
                Self::NotRunHead(frame)
            }
            _ => Self::OutOfMemory,
        }
    }
}

/// Packed 2-bit frame states spread over one or more bitmap frames.
struct FrameBitmap<'m> {
    chunks: Vec<&'m mut [u8; PAGE_SIZE as usize]>,
    len: u32,
}

impl FrameBitmap<'_> {
    const fn locate(index: u32) -> (usize, usize, u32) {
        let byte = index / 4;
        (
            (byte / PAGE_SIZE) as usize,
            (byte % PAGE_SIZE) as usize,
            (index % 4) * 2,
        )
    }

    fn get(&self, index: u32) -> Option<FrameState> {
        debug_assert!(index < self.len);
        let (chunk, byte, shift) = Self::locate(index);
        FrameState::from_bits((self.chunks[chunk][byte] >> shift) & 0b11)
    }

    fn set(&mut self, index: u32, state: FrameState) {
        debug_assert!(index < self.len);
        let (chunk, byte, shift) = Self::locate(index);
        let b = &mut self.chunks[chunk][byte];
        *b = (*b & !(0b11 << shift)) | (state.into_bits() << shift);
    }
}

pub struct ContFramePool<'m> {
    base: PhysicalFrame,
    count: u32,
    free: u32,
    /// Bitmap frames that lie inside this pool, withheld as one run.
    metadata: Option<PhysicalFrame>,
    bitmap: FrameBitmap<'m>,
}

impl<'m> ContFramePool<'m> {
    /// Bitmap frames needed to track `frames` frames.
    #[must_use]
    pub const fn needed_metadata_frames(frames: u32) -> u32 {
        frames.div_ceil(FRAMES_PER_METADATA_FRAME)
    }

    /// Create a pool over `[base, base + count)` with every frame free.
    ///
    /// The bitmap is stored at `metadata` or, if `None`, at `base`. Bitmap
    /// frames inside the pool are withheld as a run that can never be
    /// released. Bitmap memory is reached through `mapper` and must stay
    /// mapped for `'m`.
    ///
    /// # Errors
    /// - [`FramePoolError::EmptyRequest`] for an empty pool.
    /// - [`FramePoolError::ReserveOutOfRange`] if the bitmap run straddles
    ///   the pool boundary or runs past the top of the pool.
    pub fn new<M: PhysMapper>(
        mapper: &M,
        base: PhysicalFrame,
        count: u32,
        metadata: Option<PhysicalFrame>,
    ) -> Result<Self, FramePoolError> {
        if count == 0 {
            return Err(FramePoolError::EmptyRequest);
        }

        let needed = Self::needed_metadata_frames(count);
        let info = metadata.unwrap_or(base);
        let first = u64::from(info.number());
        let last = first + u64::from(needed);
        let lo = u64::from(base.number());
        let hi = lo + u64::from(count);
        let inside = first >= lo && last <= hi;
        if !inside && first < hi && lo < last {
            return Err(FramePoolError::ReserveOutOfRange {
                first: info,
                count: needed,
            });
        }

        let mut chunks = Vec::with_capacity(needed as usize);
        for k in 0..needed {
            // SAFETY: bitmap frames are dedicated to this pool and stay mapped for 'm.
            let chunk = unsafe { mapper.phys_to_mut::<[u8; PAGE_SIZE as usize]>((info + k).base()) };
            chunk.fill(0);
            chunks.push(chunk);
        }

        let mut pool = Self {
            base,
            count,
            free: count,
            metadata: None,
            bitmap: FrameBitmap { chunks, len: count },
        };

        if inside {
            pool.mark_run(info.number() - base.number(), needed);
            pool.metadata = Some(info);
        }

        info!(
            "Frame pool {base}..{} ready: {} free, bitmap at {info} ({needed} frame(s))",
            base + count,
            pool.free
        );
        Ok(pool)
    }

    #[inline]
    #[must_use]
    pub const fn base_frame(&self) -> PhysicalFrame {
        self.base
    }

    #[inline]
    #[must_use]
    pub const fn frame_count(&self) -> u32 {
        self.count
    }

    #[inline]
    #[must_use]
    pub const fn free_frames(&self) -> u32 {
        self.free
    }

    /// Whether `frame` lies in `[base_frame, base_frame + frame_count)`.
    #[inline]
    #[must_use]
    pub const fn owns(&self, frame: PhysicalFrame) -> bool {
        frame.number() >= self.base.number() && frame.number() - self.base.number() < self.count
    }

    /// Current state of `frame`.
    ///
    /// # Errors
    /// [`FramePoolError::NotOwned`] outside the pool,
    /// [`FramePoolError::CorruptState`] for an invalid bitmap entry.
    pub fn state(&self, frame: PhysicalFrame) -> Result<FrameState, FramePoolError> {
        if !self.owns(frame) {
            return Err(FramePoolError::NotOwned(frame));
        }
        self.state_at(frame.number() - self.base.number())
    }

    fn state_at(&self, index: u32) -> Result<FrameState, FramePoolError> {
        self.bitmap
            .get(index)
            .ok_or(FramePoolError::CorruptState(self.base + index))
    }

    fn mark_run(&mut self, index: u32, n: u32) {
        self.bitmap.set(index, FrameState::HeadOfSequence);
        for i in index + 1..index + n {
            self.bitmap.set(i, FrameState::Allocated);
        }
        self.free -= n;
    }

    /// Allocate `n` contiguous frames and return the first one.
    ///
    /// # Errors
    /// - [`FramePoolError::EmptyRequest`] for `n == 0`.
    /// - [`FramePoolError::OutOfMemory`] when fewer than `n` frames are free.
    /// - [`FramePoolError::NoContiguousRun`] when free frames are too fragmented.
    pub fn allocate(&mut self, n: u32) -> Result<PhysicalFrame, FramePoolError> {
        if n == 0 {
            return Err(FramePoolError::EmptyRequest);
        }
        if n > self.free {
            warn!("Frame pool {}: {n} frame(s) requested, {} free", self.base, self.free);
            return Err(FramePoolError::OutOfMemory {
                requested: n,
                free: self.free,
            });
        }

        let mut start = 0;
        let mut len = 0;
        for i in 0..self.count {
            if self.state_at(i)? == FrameState::Free {
                if len == 0 {
                    start = i;
                }
                len += 1;
                if len == n {
                    self.mark_run(start, n);
                    debug!("Allocated {n} frame(s) at {}", self.base + start);
                    return Ok(self.base + start);
                }
            } else {
                len = 0;
            }
        }

        warn!("Frame pool {}: no run of {n} contiguous frames", self.base);
        Err(FramePoolError::NoContiguousRun(n))
    }

    /// Mark `[first, first + n)` as one allocated run, e.g. a memory hole.
    ///
    /// # Errors
    /// - [`FramePoolError::EmptyRequest`] for `n == 0`.
    /// - [`FramePoolError::ReserveOutOfRange`] if the run leaves the pool.
    /// - [`FramePoolError::ReserveNotFree`] if any frame is already taken.
    pub fn reserve(&mut self, first: PhysicalFrame, n: u32) -> Result<(), FramePoolError> {
        if n == 0 {
            return Err(FramePoolError::EmptyRequest);
        }
        let out_of_range = FramePoolError::ReserveOutOfRange { first, count: n };
        if !self.owns(first) {
            return Err(out_of_range);
        }
        let index = first.number() - self.base.number();
        if u64::from(index) + u64::from(n) > u64::from(self.count) {
            return Err(out_of_range);
        }
        for i in index..index + n {
            if self.state_at(i)? != FrameState::Free {
                return Err(FramePoolError::ReserveNotFree(self.base + i));
            }
        }

        self.mark_run(index, n);
        info!("Reserved {n} frame(s) at {first}");
        Ok(())
    }

    /// Release the run starting at `first`; returns the number of frames freed.
    ///
    /// # Errors
    /// - [`FramePoolError::NotOwned`] outside the pool.
    /// - [`FramePoolError::MetadataRun`] for the pool's own bitmap frames.
    /// - [`FramePoolError::NotRunHead`] if `first` does not start a run.
    pub fn release(&mut self, first: PhysicalFrame) -> Result<u32, FramePoolError> {
        let state = self.state(first)?;
        if self.metadata == Some(first) {
            warn!("Refusing to release bitmap run at {first}");
            return Err(FramePoolError::MetadataRun(first));
        }
        if state != FrameState::HeadOfSequence {
            warn!("Release of {first}, which is {state:?}");
            return Err(FramePoolError::NotRunHead(first));
        }

        let index = first.number() - self.base.number();
        self.bitmap.set(index, FrameState::Free);
        let mut freed = 1;
        let mut i = index + 1;
        while i < self.count && self.state_at(i)? == FrameState::Allocated {
            self.bitmap.set(i, FrameState::Free);
            freed += 1;
            i += 1;
        }

        self.free += freed;
        debug!("Released {freed} frame(s) at {first}");
        Ok(freed)
    }
}

impl FrameAlloc for ContFramePool<'_> {
    fn alloc_4k(&mut self) -> Result<PhysicalFrame, FrameAllocError> {
        Ok(self.allocate(1)?)
    }

    fn free_4k(&mut self, frame: PhysicalFrame) -> Result<(), FrameAllocError> {
        self.release(frame)?;
        Ok(())
    }

    fn owns(&self, frame: PhysicalFrame) -> bool {
        ContFramePool::owns(self, frame)
    }
}

/// Release the run starting at `first` in whichever of `pools` owns it.
///
/// # Errors
/// [`FramePoolError::NotOwned`] if no pool owns `first`, or the owning pool's
/// release error.
pub fn release_frames(
    pools: &mut [&mut ContFramePool<'_>],
    first: PhysicalFrame,
) -> Result<u32, FramePoolError> {
    pools
        .iter_mut()
        .find(|p| p.owns(first))
        .ok_or(FramePoolError::NotOwned(first))?
        .release(first)
}

#[cfg(test)]
mod tests {
    use super::*;
    use kernel_vmem::sim::SimMachine;

    fn frame(n: u32) -> PhysicalFrame {
        PhysicalFrame::new(n)
    }

    /// Pool of 1024 frames at 256 with its bitmap parked at frame 100.
    fn pool(sim: &SimMachine) -> ContFramePool<'_> {
        ContFramePool::new(sim, frame(256), 1024, Some(frame(100))).expect("pool")
    }

    #[test]
    fn metadata_frames_needed() {
        assert_eq!(ContFramePool::needed_metadata_frames(1), 1);
        assert_eq!(ContFramePool::needed_metadata_frames(7168), 1);
        assert_eq!(ContFramePool::needed_metadata_frames(16384), 1);
        assert_eq!(ContFramePool::needed_metadata_frames(16385), 2);
    }

    #[test]
    fn first_fit_reuses_released_run() {
        let sim = SimMachine::new(16 * 1024 * 1024);
        let mut p = pool(&sim);
        assert_eq!(p.free_frames(), 1024);

        assert_eq!(p.allocate(3), Ok(frame(256)));
        assert_eq!(p.allocate(1), Ok(frame(259)));
        assert_eq!(p.state(frame(256)), Ok(FrameState::HeadOfSequence));
        assert_eq!(p.state(frame(258)), Ok(FrameState::Allocated));
        assert_eq!(p.state(frame(259)), Ok(FrameState::HeadOfSequence));

        assert_eq!(p.release(frame(256)), Ok(3));
        assert_eq!(p.state(frame(257)), Ok(FrameState::Free));
        assert_eq!(p.allocate(3), Ok(frame(256)));
        assert_eq!(p.free_frames(), 1024 - 4);
    }

    #[test]
    fn first_fit_skips_too_small_holes() {
        let sim = SimMachine::new(16 * 1024 * 1024);
        let mut p = pool(&sim);
        p.allocate(3).expect("run");
        p.allocate(1).expect("run");
        p.release(frame(256)).expect("release");

        // the 3-frame hole at 256 is too small while 259 is live
        assert_eq!(p.allocate(4), Ok(frame(260)));

        p.release(frame(259)).expect("release");
        assert_eq!(p.allocate(4), Ok(frame(256)));
    }

    #[test]
    fn release_stops_at_next_run() {
        let sim = SimMachine::new(16 * 1024 * 1024);
        let mut p = pool(&sim);
        let a = p.allocate(2).expect("run");
        let b = p.allocate(2).expect("run");
        assert_eq!(b, a + 2);
        assert_eq!(p.release(a), Ok(2));
        assert_eq!(p.state(b), Ok(FrameState::HeadOfSequence));
        assert_eq!(p.state(b + 1), Ok(FrameState::Allocated));
    }

    #[test]
    fn invalid_requests_leave_pool_untouched() {
        let sim = SimMachine::new(16 * 1024 * 1024);
        let mut p = pool(&sim);
        p.allocate(3).expect("run");

        assert_eq!(p.allocate(0), Err(FramePoolError::EmptyRequest));
        assert_eq!(
            p.allocate(2000),
            Err(FramePoolError::OutOfMemory {
                requested: 2000,
                free: 1021
            })
        );
        assert_eq!(p.release(frame(257)), Err(FramePoolError::NotRunHead(frame(257))));
        assert_eq!(p.release(frame(300)), Err(FramePoolError::NotRunHead(frame(300))));
        assert_eq!(p.release(frame(255)), Err(FramePoolError::NotOwned(frame(255))));
        assert_eq!(p.release(frame(1280)), Err(FramePoolError::NotOwned(frame(1280))));
        assert_eq!(p.free_frames(), 1021);
    }

    #[test]
    fn fragmentation_is_reported() {
        let sim = SimMachine::new(16 * 1024 * 1024);
        let mut p = ContFramePool::new(&sim, frame(256), 8, Some(frame(100))).expect("pool");
        let runs: Vec<_> = (0..8).map(|_| p.allocate(1).expect("frame")).collect();
        for f in runs.iter().step_by(2) {
            p.release(*f).expect("release");
        }
        assert_eq!(p.free_frames(), 4);
        assert_eq!(p.allocate(2), Err(FramePoolError::NoContiguousRun(2)));
        assert_eq!(p.allocate(1), Ok(frame(256)));
    }

    #[test]
    fn self_hosted_bitmap_is_withheld() {
        let sim = SimMachine::new(16 * 1024 * 1024);
        let mut p = ContFramePool::new(&sim, frame(512), 512, None).expect("pool");
        assert_eq!(p.free_frames(), 511);
        assert_eq!(p.state(frame(512)), Ok(FrameState::HeadOfSequence));
        assert_eq!(p.allocate(1), Ok(frame(513)));
        assert_eq!(p.release(frame(512)), Err(FramePoolError::MetadataRun(frame(512))));
        assert_eq!(p.free_frames(), 510);
    }

    #[test]
    fn metadata_may_not_straddle_the_pool() {
        let sim = SimMachine::new(64 * 1024 * 1024);
        // 16385 frames need two bitmap frames; 255 + 2 reaches into the pool
        let r = ContFramePool::new(&sim, frame(256), 16385, Some(frame(255)));
        assert!(matches!(r, Err(FramePoolError::ReserveOutOfRange { .. })));
        assert!(matches!(
            ContFramePool::new(&sim, frame(256), 0, None),
            Err(FramePoolError::EmptyRequest)
        ));
    }

    #[test]
    fn reserve_marks_hole() {
        let sim = SimMachine::new(16 * 1024 * 1024);
        let mut p = pool(&sim);
        assert_eq!(p.reserve(frame(258), 4), Ok(()));
        assert_eq!(p.free_frames(), 1020);
        assert_eq!(p.allocate(3), Ok(frame(262)));
        assert_eq!(p.allocate(2), Ok(frame(256)));

        assert_eq!(p.reserve(frame(259), 1), Err(FramePoolError::ReserveNotFree(frame(259))));
        assert!(matches!(
            p.reserve(frame(1270), 20),
            Err(FramePoolError::ReserveOutOfRange { .. })
        ));
        assert_eq!(p.reserve(frame(300), 0), Err(FramePoolError::EmptyRequest));
        assert_eq!(p.release(frame(258)), Ok(4));
    }

    #[test]
    fn release_frames_finds_owner() {
        let sim = SimMachine::new(16 * 1024 * 1024);
        let mut a = ContFramePool::new(&sim, frame(512), 512, None).expect("pool");
        let mut b = ContFramePool::new(&sim, frame(1024), 512, Some(frame(100))).expect("pool");
        let fa = a.allocate(2).expect("run");
        let fb = b.allocate(5).expect("run");

        assert_eq!(release_frames(&mut [&mut a, &mut b], fb), Ok(5));
        assert_eq!(release_frames(&mut [&mut a, &mut b], fa), Ok(2));
        assert_eq!(
            release_frames(&mut [&mut a, &mut b], frame(4)),
            Err(FramePoolError::NotOwned(frame(4)))
        );
        assert_eq!(a.free_frames(), 511);
        assert_eq!(b.free_frames(), 512);
    }

    #[test]
    fn frame_alloc_maps_errors() {
        let sim = SimMachine::new(16 * 1024 * 1024);
        let mut p = ContFramePool::new(&sim, frame(256), 2, Some(frame(100))).expect("pool");
        let f = p.alloc_4k().expect("frame");
        p.alloc_4k().expect("frame");
        assert_eq!(p.alloc_4k(), Err(FrameAllocError::OutOfMemory));
        assert_eq!(p.free_4k(f), Ok(()));
        assert_eq!(p.free_4k(f), Err(FrameAllocError::NotRunHead(f)));
        assert_eq!(p.free_4k(frame(9)), Err(FrameAllocError::NotOwned(frame(9))));
    }

    #[test]
    fn runs_never_overlap_and_counts_balance() {
        let sim = SimMachine::new(16 * 1024 * 1024);
        let mut p = pool(&sim);
        let mut live: Vec<(PhysicalFrame, u32)> = Vec::new();
        let mut seed = 0x2545_F491_u32;

        for _ in 0..400 {
            seed ^= seed << 13;
            seed ^= seed >> 17;
            seed ^= seed << 5;
            if seed % 3 == 0 && !live.is_empty() {
                let (head, n) = live.swap_remove(usize::try_from(seed).unwrap_or(0) % live.len());
                assert_eq!(p.release(head), Ok(n));
            } else {
                let n = seed % 9 + 1;
                if let Ok(head) = p.allocate(n) {
                    live.push((head, n));
                }
            }

            let used: u32 = live.iter().map(|(_, n)| n).sum();
            assert_eq!(p.free_frames() + used, 1024);
        }

        live.sort_by_key(|(head, _)| *head);
        for pair in live.windows(2) {
            assert!(pair[0].0 + pair[0].1 <= pair[1].0);
        }
        for &(head, n) in &live {
            assert_eq!(p.state(head), Ok(FrameState::HeadOfSequence));
            for k in 1..n {
                assert_eq!(p.state(head + k), Ok(FrameState::Allocated));
            }
        }
    }
}
