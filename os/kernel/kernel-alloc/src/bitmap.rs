//! # Bitmap Physical Frame Allocator
//!
//! One bit per 4 KiB frame in `[0, highest_usable)`; `1` means occupied.
//!
//! The bitmap itself lives in physical memory. [`BitmapFrameAlloc::initialize`]
//! carves it out of the **top** of the first usable region that can hold it
//! and shrinks that region in place, so the bottom of the region stays
//! allocatable and allocation order is reproducible.
//!
//! ```text
//!  region.base                                   region.end
//!  ├───────────── free frames ──────────────┬── bitmap ──┤
//!  └─────────── new region.length ──────────┘
//! ```
//!
//! Frame 0 is never handed out, even when a usable region starts there.
//!
//! Allocation is first-fit, ascending. A next-free hint (every frame below it
//! is occupied) keeps repeated allocations from rescanning the low end.

use core::ptr::NonNull;
use kernel_info::boot::MemoryRegion;
use kernel_memory_addresses::{PageSize, PhysicalAddress, PhysicalPage, Size4K, align_down, align_up};
use kernel_vmem::PhysMapper;
use log::{info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum PhysInitError {
    #[error("memory map has no usable memory")]
    NoUsableMemory,
    #[error("no usable region can hold the {bytes}-byte frame bitmap")]
    NoRoomForBitmap { bytes: u64 },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum FrameFreeError {
    /// At least one page in the range was not allocated. Those pages were
    /// left untouched; `released` counts the pages that were freed.
    #[error("frame {address:?} was already free ({released} pages released)")]
    AlreadyFree {
        address: PhysicalAddress,
        released: u64,
    },
}

/// Bitmap allocator over all physical frames below the highest usable
/// address.
pub struct BitmapFrameAlloc {
    bits: NonNull<u8>,
    /// Bytes of the bitmap actually covering frames.
    bytes: usize,
    base: PhysicalAddress,
    /// Page-rounded footprint of the bitmap in physical memory.
    footprint: u64,
    total: u64,
    free: u64,
    /// Lowest frame that may be free.
    hint: u64,
}

// Safety: the bitmap is only reached through `&mut self`.
unsafe impl Send for BitmapFrameAlloc {}

impl BitmapFrameAlloc {
    /// Build the allocator from the boot memory map.
    ///
    /// The first usable region able to hold the bitmap loses its top pages to
    /// it; its `length` is reduced accordingly. Every usable region is then
    /// released into the bitmap.
    ///
    /// # Errors
    /// - [`PhysInitError::NoUsableMemory`] if no usable region has a length.
    /// - [`PhysInitError::NoRoomForBitmap`] if no usable region fits the bitmap.
    ///
    /// # Safety
    /// - Usable regions must describe RAM nobody else uses.
    /// - `mapper` must reach that RAM for as long as the allocator lives.
    pub unsafe fn initialize<M: PhysMapper + ?Sized>(
        memory_map: &mut [MemoryRegion],
        mapper: &M,
    ) -> Result<Self, PhysInitError> {
        let highest = memory_map
            .iter()
            .filter(|r| r.is_usable() && r.length > 0)
            .map(MemoryRegion::end)
            .max()
            .ok_or(PhysInitError::NoUsableMemory)?;

        let total = highest / Size4K::SIZE;
        let bytes = total.div_ceil(8);
        let footprint = align_up(bytes, Size4K::SIZE).ok_or(PhysInitError::NoRoomForBitmap { bytes })?;

        let Some(base) = memory_map
            .iter_mut()
            .filter(|r| r.is_usable())
            .find_map(|r| carve_top(r, footprint))
        else {
            return Err(PhysInitError::NoRoomForBitmap { bytes });
        };

        let bits = NonNull::new(mapper.phys_to_ptr(base)).ok_or(PhysInitError::NoRoomForBitmap { bytes })?;
        let bytes_usize = usize::try_from(bytes).map_err(|_| PhysInitError::NoRoomForBitmap { bytes })?;

        let mut this = Self {
            bits,
            bytes: bytes_usize,
            base,
            footprint,
            total,
            free: 0,
            hint: total,
        };
        this.bitmap_mut().fill(0xFF);

        for region in memory_map.iter().filter(|r| r.is_usable()) {
            if let Err(e) = this.free(PhysicalAddress::new(region.base), region.length) {
                warn!("overlapping usable region {:#x}+{:#x}: {e}", region.base, region.length);
            }
        }

        info!(
            "frame bitmap: {bytes} bytes at {base:?}, {} of {} frames free",
            this.free, this.total
        );
        Ok(this)
    }

    #[inline]
    fn bitmap(&self) -> &[u8] {
        // Safety: `bits` spans `bytes` bytes per `initialize`.
        unsafe { core::slice::from_raw_parts(self.bits.as_ptr(), self.bytes) }
    }

    #[inline]
    fn bitmap_mut(&mut self) -> &mut [u8] {
        // Safety: as above, and `&mut self` is exclusive.
        unsafe { core::slice::from_raw_parts_mut(self.bits.as_ptr(), self.bytes) }
    }

    #[inline]
    fn test(&self, frame: u64) -> bool {
        self.bitmap()[byte_index(frame)] & (1 << (frame % 8)) != 0
    }

    #[inline]
    fn set(&mut self, frame: u64) {
        self.bitmap_mut()[byte_index(frame)] |= 1 << (frame % 8);
    }

    #[inline]
    fn clear(&mut self, frame: u64) {
        self.bitmap_mut()[byte_index(frame)] &= !(1 << (frame % 8));
    }

    /// Allocate `size` bytes of physically contiguous frames.
    ///
    /// `size` is rounded up to whole pages; `0` counts as one page. Returns
    /// the lowest run of free frames that fits, or `None`.
    pub fn alloc(&mut self, size: u64) -> Option<PhysicalAddress> {
        let pages = size.div_ceil(Size4K::SIZE).max(1);
        if pages > self.free {
            return None;
        }

        let mut run_start = self.hint;
        let mut frame = self.hint;
        while frame < self.total {
            if frame % 8 == 0 && self.bitmap()[byte_index(frame)] == 0xFF {
                frame += 8;
                run_start = frame;
                continue;
            }

            if self.test(frame) {
                frame += 1;
                run_start = frame;
                continue;
            }

            frame += 1;
            if frame - run_start == pages {
                for f in run_start..frame {
                    self.set(f);
                }
                self.free -= pages;
                if run_start == self.hint {
                    self.hint = frame;
                }
                return Some(PhysicalPage::<Size4K>::frame(run_start).base());
            }
        }
        None
    }

    /// Release every whole page in `[start, start + length)`.
    ///
    /// The start is rounded up and the end down, so partial pages at the
    /// edges stay allocated. Pages beyond the bitmap are ignored, and so is
    /// frame 0: its address is the null table pointer, so it stays occupied
    /// from [`initialize`](Self::initialize) on.
    ///
    /// Returns the number of pages released.
    ///
    /// # Errors
    /// [`FrameFreeError::AlreadyFree`] if some page in the range was not
    /// allocated. Every other page in the range is still released.
    pub fn free(&mut self, start: PhysicalAddress, length: u64) -> Result<u64, FrameFreeError> {
        let end = align_down(start.as_u64().saturating_add(length), Size4K::SIZE);
        let Some(first) = align_up(start.as_u64(), Size4K::SIZE) else {
            return Ok(0);
        };

        let first = (first / Size4K::SIZE).max(1);
        let last = (end / Size4K::SIZE).min(self.total);
        let mut released = 0;
        let mut already_free = None;
        for frame in first..last {
            if self.test(frame) {
                self.clear(frame);
                released += 1;
            } else if already_free.is_none() {
                already_free = Some(PhysicalPage::<Size4K>::frame(frame).base());
            }
        }

        self.free += released;
        if released > 0 {
            self.hint = self.hint.min(first);
        }

        match already_free {
            None => Ok(released),
            Some(address) => Err(FrameFreeError::AlreadyFree { address, released }),
        }
    }

    /// Whether `frame` is occupied. Frames beyond the bitmap count as occupied.
    #[must_use]
    pub fn is_allocated(&self, frame: PhysicalPage<Size4K>) -> bool {
        let n = frame.frame_number();
        n >= self.total || self.test(n)
    }

    #[must_use]
    pub const fn free_frames(&self) -> u64 {
        self.free
    }

    /// Frames tracked by the bitmap, occupied or not.
    #[must_use]
    pub const fn total_frames(&self) -> u64 {
        self.total
    }

    /// Physical memory taken by the bitmap, in bytes (whole pages).
    #[must_use]
    pub const fn bitmap_bytes(&self) -> u64 {
        self.footprint
    }

    #[must_use]
    pub const fn bitmap_base(&self) -> PhysicalAddress {
        self.base
    }

    /// End of the tracked physical range.
    #[must_use]
    pub const fn highest_address(&self) -> PhysicalAddress {
        PhysicalAddress::new(self.total * Size4K::SIZE)
    }

    /// The raw bitmap, for inspection.
    #[must_use]
    pub fn as_bytes(&self) -> &[u8] {
        self.bitmap()
    }
}

#[inline]
#[allow(clippy::cast_possible_truncation)]
const fn byte_index(frame: u64) -> usize {
    (frame / 8) as usize
}

/// Take `footprint` bytes off the page-aligned top of `region`, if it fits.
fn carve_top(region: &mut MemoryRegion, footprint: u64) -> Option<PhysicalAddress> {
    let low = align_up(region.base, Size4K::SIZE)?;
    let high = align_down(region.end(), Size4K::SIZE);
    let base = high.checked_sub(footprint).filter(|&b| b >= low)?;
    region.length = base - region.base;
    Some(PhysicalAddress::new(base))
}
