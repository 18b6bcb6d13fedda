//! # Shared Frame Pool
//!
//! [`FramePool`] is the form in which the rest of the kernel sees the
//! physical allocator: a [`BitmapFrameAlloc`] behind a [`SpinLock`], plus
//! owner counts for frames with more than one owner.
//!
//! ## Ownership protocol
//!
//! A frame fresh from the bitmap has exactly one implicit owner and no entry
//! in the count table. [`FramePool::share`] adds an owner,
//! [`FramePool::release`] drops one, and the frame goes back to the bitmap
//! when the last owner releases it. The kernel-half PDPTs linked into every
//! address-space root are the frames that use this today.
//!
//! ```text
//!  alloc ──► owners = 1 ──share──► owners = 2 ──release──► owners = 1 ──release──► free
//! ```

use crate::bitmap::{BitmapFrameAlloc, FrameFreeError};
use alloc::collections::BTreeMap;
use kernel_memory_addresses::{PageSize, PhysicalAddress, PhysicalPage, Size4K};
use kernel_sync::SpinLock;
use kernel_vmem::{FrameAlloc, PhysMapper};
use log::warn;

struct PoolState {
    frames: BitmapFrameAlloc,
    /// Extra owners beyond the implicit first one, keyed by frame number.
    extra_owners: BTreeMap<u64, u32>,
}

pub struct FramePool {
    state: SpinLock<PoolState>,
}

impl FramePool {
    #[must_use]
    pub const fn new(frames: BitmapFrameAlloc) -> Self {
        Self {
            state: SpinLock::new(PoolState {
                frames,
                extra_owners: BTreeMap::new(),
            }),
        }
    }

    /// See [`BitmapFrameAlloc::alloc`].
    pub fn alloc(&self, size: u64) -> Option<PhysicalAddress> {
        self.state.lock_irq().frames.alloc(size)
    }

    /// See [`BitmapFrameAlloc::free`].
    ///
    /// # Errors
    /// As [`BitmapFrameAlloc::free`].
    pub fn free(&self, start: PhysicalAddress, length: u64) -> Result<u64, FrameFreeError> {
        self.state.lock_irq().frames.free(start, length)
    }

    /// One frame, contents unspecified.
    pub fn alloc_4k(&self) -> Option<PhysicalPage<Size4K>> {
        self.alloc(Size4K::SIZE).map(PhysicalPage::from_addr)
    }

    /// One frame, zero-filled through `mapper`. The lock is not held while
    /// zeroing.
    pub fn alloc_zeroed_4k<M: PhysMapper + ?Sized>(&self, mapper: &M) -> Option<PhysicalPage<Size4K>> {
        let frame = self.alloc_4k()?;
        // Safety: the frame was just taken from the bitmap; nobody else owns it.
        unsafe { mapper.zero_frame(frame) };
        Some(frame)
    }

    /// Add an owner to an allocated frame. Returns the new owner count.
    pub fn share(&self, frame: PhysicalPage<Size4K>) -> u32 {
        let mut state = self.state.lock_irq();
        debug_assert!(state.frames.is_allocated(frame), "sharing free frame {frame:?}");
        let extra = state.extra_owners.entry(frame.frame_number()).or_insert(0);
        *extra += 1;
        *extra + 1
    }

    /// Drop one owner of `frame`; the last owner returns it to the bitmap.
    ///
    /// Returns `true` if the frame was freed.
    ///
    /// # Errors
    /// [`FrameFreeError::AlreadyFree`] if the frame had no owner left.
    pub fn release(&self, frame: PhysicalPage<Size4K>) -> Result<bool, FrameFreeError> {
        let mut state = self.state.lock_irq();
        let key = frame.frame_number();
        if let Some(extra) = state.extra_owners.get_mut(&key) {
            *extra -= 1;
            if *extra == 0 {
                state.extra_owners.remove(&key);
            }
            return Ok(false);
        }
        state.frames.free(frame.base(), Size4K::SIZE).map(|_| true)
    }

    /// Current owners of `frame`: `0` if free, otherwise `1 +` shares.
    #[must_use]
    pub fn ref_count(&self, frame: PhysicalPage<Size4K>) -> u32 {
        let state = self.state.lock_irq();
        if !state.frames.is_allocated(frame) {
            return 0;
        }
        1 + state
            .extra_owners
            .get(&frame.frame_number())
            .copied()
            .unwrap_or(0)
    }

    #[must_use]
    pub fn is_allocated(&self, frame: PhysicalPage<Size4K>) -> bool {
        self.state.lock_irq().frames.is_allocated(frame)
    }

    #[must_use]
    pub fn free_frames(&self) -> u64 {
        self.state.lock_irq().frames.free_frames()
    }

    #[must_use]
    pub fn total_frames(&self) -> u64 {
        self.state.lock_irq().frames.total_frames()
    }

    /// End of the physical range the pool tracks.
    #[must_use]
    pub fn highest_address(&self) -> PhysicalAddress {
        self.state.lock_irq().frames.highest_address()
    }
}

/// Each call takes the pool lock for just that frame, so the walker never
/// holds it across a table descent.
impl FrameAlloc for &FramePool {
    fn alloc_4k(&mut self) -> Option<PhysicalPage<Size4K>> {
        FramePool::alloc_4k(*self)
    }

    fn free_4k(&mut self, frame: PhysicalPage<Size4K>) {
        if let Err(e) = self.release(frame) {
            warn!("freeing table frame {frame:?}: {e}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kernel_info::boot::MemoryRegion;

    #[repr(align(4096))]
    struct Aligned4K([u8; 4096]);

    struct TestPhys {
        frames: Vec<Aligned4K>,
    }

    unsafe impl PhysMapper for TestPhys {
        fn phys_to_ptr(&self, pa: PhysicalAddress) -> *mut u8 {
            let off = usize::try_from(pa.as_u64()).unwrap();
            assert!(off < self.frames.len() * 4096);
            unsafe { self.frames.as_ptr().cast::<u8>().cast_mut().add(off) }
        }
    }

    fn pool(phys: &TestPhys) -> FramePool {
        let mut map = [MemoryRegion::usable(0x1000, 0xF000)];
        let frames = unsafe { BitmapFrameAlloc::initialize(&mut map, phys) }.unwrap();
        FramePool::new(frames)
    }

    fn ram() -> TestPhys {
        let mut frames = Vec::new();
        for _ in 0..16 {
            frames.push(Aligned4K([0xAB; 4096]));
        }
        TestPhys { frames }
    }

    #[test]
    fn zeroed_frames_are_clean() {
        let phys = ram();
        let pool = pool(&phys);
        let frame = pool.alloc_zeroed_4k(&phys).unwrap();
        let bytes = unsafe { core::slice::from_raw_parts(phys.phys_to_ptr(frame.base()), 4096) };
        assert!(bytes.iter().all(|&b| b == 0));
    }

    #[test]
    fn shared_frame_survives_until_last_release() {
        let phys = ram();
        let pool = pool(&phys);
        let frame = pool.alloc_4k().unwrap();
        assert_eq!(pool.ref_count(frame), 1);
        assert_eq!(pool.share(frame), 2);
        assert_eq!(pool.share(frame), 3);

        assert_eq!(pool.release(frame), Ok(false));
        assert_eq!(pool.release(frame), Ok(false));
        assert_eq!(pool.ref_count(frame), 1);
        assert_eq!(pool.release(frame), Ok(true));
        assert_eq!(pool.ref_count(frame), 0);
        assert!(matches!(pool.release(frame), Err(FrameFreeError::AlreadyFree { .. })));
    }

    #[test]
    fn frame_alloc_impl_returns_frames_to_the_bitmap() {
        let phys = ram();
        let pool = pool(&phys);
        let before = pool.free_frames();

        let mut a = &pool;
        let f = a.alloc_4k().unwrap();
        assert_eq!(pool.free_frames(), before - 1);
        a.free_4k(f);
        assert_eq!(pool.free_frames(), before);
        assert!(!pool.is_allocated(f));
    }
}
