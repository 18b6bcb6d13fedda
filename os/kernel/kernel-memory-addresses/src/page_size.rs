use core::fmt;
use core::hash::Hash;

/// Sealed trait pattern to restrict `PageSize` impls to our markers.
mod sealed {
    pub trait Sealed {}
}

/// Marker trait for the page sizes the memory core maps.
///
/// Only 4 KiB frames and 2 MiB huge pages are supported; the walker never
/// terminates at the PDPT level.
pub trait PageSize:
    sealed::Sealed + Clone + Copy + Eq + PartialEq + Ord + PartialOrd + Hash + fmt::Debug
{
    /// Page size in bytes (power of two).
    const SIZE: u64;
    /// log2(SIZE), i.e., number of low bits used for the in-page offset.
    const SHIFT: u32;
    /// Short human-readable name, used in log lines.
    const NAME: &'static str;

    /// Mask selecting the in-page offset bits.
    const OFFSET_MASK: u64 = Self::SIZE - 1;
}

/// 4 KiB page (4096 bytes), the frame granularity of the allocator.
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct Size4K;
impl sealed::Sealed for Size4K {}
impl PageSize for Size4K {
    const SIZE: u64 = 4096;
    const SHIFT: u32 = 12;
    const NAME: &'static str = "4K";
}

/// 2 MiB huge page (`2_097_152` bytes), terminating the walk at the PD level.
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct Size2M;
impl sealed::Sealed for Size2M {}
impl PageSize for Size2M {
    const SIZE: u64 = 2 * 1024 * 1024;
    const SHIFT: u32 = 21;
    const NAME: &'static str = "2M";
}

impl fmt::Debug for Size4K {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(Self::NAME)
    }
}

impl fmt::Debug for Size2M {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(Self::NAME)
    }
}

const _: () = {
    assert!(Size4K::SIZE == 1 << Size4K::SHIFT);
    assert!(Size2M::SIZE == 1 << Size2M::SHIFT);
    assert!(Size2M::SIZE / Size4K::SIZE == 512);
};
