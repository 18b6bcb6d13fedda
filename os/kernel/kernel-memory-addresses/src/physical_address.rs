use crate::{PageSize, Size4K, align_down, align_up};
use core::fmt;
use core::marker::PhantomData;
use core::ops::{Add, AddAssign};

/// Physical memory address (host RAM or MMIO).
///
/// Physical addresses are never dereferenced directly; they are turned into
/// accessible pointers by the direct map only.
///
/// ### Examples
/// ```rust
/// # use kernel_memory_addresses::*;
/// let pa = PhysicalAddress::new(0x0010_2042);
/// assert_eq!(pa.align_down::<Size4K>().as_u64(), 0x0010_2000);
/// assert_eq!(pa.page::<Size4K>().frame_number(), 0x102);
/// ```
#[repr(transparent)]
#[derive(Copy, Clone, Default, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct PhysicalAddress(u64);

impl PhysicalAddress {
    #[inline]
    #[must_use]
    pub const fn new(v: u64) -> Self {
        Self(v)
    }

    #[inline]
    #[must_use]
    pub const fn zero() -> Self {
        Self(0)
    }

    #[inline]
    #[must_use]
    pub const fn as_u64(self) -> u64 {
        self.0
    }

    #[inline]
    #[must_use]
    pub const fn is_null(self) -> bool {
        self.0 == 0
    }

    #[inline]
    #[must_use]
    pub const fn is_aligned<S: PageSize>(self) -> bool {
        self.0 & S::OFFSET_MASK == 0
    }

    #[inline]
    #[must_use]
    pub const fn align_down<S: PageSize>(self) -> Self {
        Self(align_down(self.0, S::SIZE))
    }

    /// Round up to the next `S` boundary; `None` if that would overflow.
    #[inline]
    #[must_use]
    pub const fn align_up<S: PageSize>(self) -> Option<Self> {
        match align_up(self.0, S::SIZE) {
            Some(v) => Some(Self(v)),
            None => None,
        }
    }

    /// The page of size `S` containing this address.
    #[inline]
    #[must_use]
    pub const fn page<S: PageSize>(self) -> PhysicalPage<S> {
        PhysicalPage::containing(self)
    }

    #[inline]
    #[must_use]
    pub const fn offset_in<S: PageSize>(self) -> u64 {
        self.0 & S::OFFSET_MASK
    }

    #[inline]
    #[must_use]
    pub const fn checked_add(self, rhs: u64) -> Option<Self> {
        match self.0.checked_add(rhs) {
            Some(v) => Some(Self(v)),
            None => None,
        }
    }
}

impl fmt::Debug for PhysicalAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PA(0x{:016X})", self.0)
    }
}

impl fmt::Display for PhysicalAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{:016X}", self.0)
    }
}

impl From<u64> for PhysicalAddress {
    #[inline]
    fn from(v: u64) -> Self {
        Self::new(v)
    }
}

impl Add<u64> for PhysicalAddress {
    type Output = Self;
    #[inline]
    fn add(self, rhs: u64) -> Self::Output {
        Self(self.0 + rhs)
    }
}

impl AddAssign<u64> for PhysicalAddress {
    #[inline]
    fn add_assign(&mut self, rhs: u64) {
        self.0 += rhs;
    }
}

/// A physical page of size `S`, i.e. an `S`-aligned [`PhysicalAddress`].
///
/// A `PhysicalPage<Size4K>` is what the allocator calls a *frame*.
#[repr(transparent)]
#[derive(Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct PhysicalPage<S: PageSize> {
    base: PhysicalAddress,
    _size: PhantomData<S>,
}

impl<S: PageSize> Copy for PhysicalPage<S> {}

impl<S: PageSize> Clone for PhysicalPage<S> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<S: PageSize> PhysicalPage<S> {
    /// Wrap an already aligned base address.
    ///
    /// ### Debug assertions
    /// - Asserts that `base` is `S`-aligned.
    #[inline]
    #[must_use]
    pub const fn from_addr(base: PhysicalAddress) -> Self {
        debug_assert!(base.is_aligned::<S>());
        Self {
            base,
            _size: PhantomData,
        }
    }

    /// The page containing `addr` (rounds down).
    #[inline]
    #[must_use]
    pub const fn containing(addr: PhysicalAddress) -> Self {
        Self::from_addr(addr.align_down::<S>())
    }

    /// Page with number `n`, i.e. base `n << S::SHIFT`.
    #[inline]
    #[must_use]
    pub const fn from_number(n: u64) -> Self {
        Self::from_addr(PhysicalAddress::new(n << S::SHIFT))
    }

    #[inline]
    #[must_use]
    pub const fn base(self) -> PhysicalAddress {
        self.base
    }

    /// Page number in units of `S` (`base >> S::SHIFT`).
    #[inline]
    #[must_use]
    pub const fn frame_number(self) -> u64 {
        self.base.as_u64() >> S::SHIFT
    }

    /// Address `offset` bytes into this page.
    #[inline]
    #[must_use]
    pub const fn join(self, offset: u64) -> PhysicalAddress {
        debug_assert!(offset < S::SIZE);
        PhysicalAddress::new(self.base.as_u64() | offset)
    }
}

impl PhysicalPage<Size4K> {
    /// Frame `n` (base `n * 4096`).
    #[inline]
    #[must_use]
    pub const fn frame(n: u64) -> Self {
        Self::from_number(n)
    }
}

impl<S: PageSize> fmt::Debug for PhysicalPage<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PhysicalPage<{}>(0x{:016X})", S::NAME, self.base.as_u64())
    }
}

impl<S: PageSize> From<PhysicalPage<S>> for PhysicalAddress {
    fn from(value: PhysicalPage<S>) -> Self {
        value.base()
    }
}
