use crate::{PageSize, align_down, align_up};
use core::fmt;
use core::marker::PhantomData;
use core::ops::{Add, AddAssign};

/// First address of the upper canonical half (bit 47 set and sign-extended).
const UPPER_HALF_START: u64 = 0xFFFF_8000_0000_0000;

/// Last address of the lower canonical half, plus one.
const LOWER_HALF_END: u64 = 0x0000_8000_0000_0000;

/// Virtual memory address (page-table translated).
///
/// ### Examples
/// ```rust
/// # use kernel_memory_addresses::*;
/// let va = VirtualAddress::new(0xFFFF_FFFF_8000_1234);
/// assert!(va.is_upper_half());
/// assert!(va.is_canonical());
/// assert_eq!(va.page::<Size4K>().base().as_u64(), 0xFFFF_FFFF_8000_1000);
/// ```
#[repr(transparent)]
#[derive(Copy, Clone, Default, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct VirtualAddress(u64);

impl VirtualAddress {
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
    pub const fn as_mut_ptr<T>(self) -> *mut T {
        self.0 as *mut T
    }

    #[inline]
    #[must_use]
    pub const fn is_null(self) -> bool {
        self.0 == 0
    }

    /// `true` for addresses in the kernel (upper canonical) half.
    #[inline]
    #[must_use]
    pub const fn is_upper_half(self) -> bool {
        self.0 >= UPPER_HALF_START
    }

    /// `true` if bits 63..48 are a sign extension of bit 47.
    #[inline]
    #[must_use]
    pub const fn is_canonical(self) -> bool {
        self.0 < LOWER_HALF_END || self.0 >= UPPER_HALF_START
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

    #[inline]
    #[must_use]
    pub const fn page<S: PageSize>(self) -> VirtualPage<S> {
        VirtualPage::containing(self)
    }

    #[inline]
    #[must_use]
    pub const fn checked_add(self, rhs: u64) -> Option<Self> {
        match self.0.checked_add(rhs) {
            Some(v) => Some(Self(v)),
            None => None,
        }
    }

    /// Bytes from `other` up to `self`; `None` if `other` lies above.
    #[inline]
    #[must_use]
    pub const fn distance_from(self, other: Self) -> Option<u64> {
        self.0.checked_sub(other.0)
    }
}

impl fmt::Debug for VirtualAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "VA(0x{:016X})", self.0)
    }
}

impl fmt::Display for VirtualAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{:016X}", self.0)
    }
}

impl From<u64> for VirtualAddress {
    #[inline]
    fn from(v: u64) -> Self {
        Self::new(v)
    }
}

impl Add<u64> for VirtualAddress {
    type Output = Self;
    #[inline]
    fn add(self, rhs: u64) -> Self::Output {
        Self(self.0 + rhs)
    }
}

impl AddAssign<u64> for VirtualAddress {
    #[inline]
    fn add_assign(&mut self, rhs: u64) {
        self.0 += rhs;
    }
}

/// A virtual page of size `S`, i.e. an `S`-aligned [`VirtualAddress`].
#[repr(transparent)]
#[derive(Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct VirtualPage<S: PageSize> {
    base: VirtualAddress,
    _size: PhantomData<S>,
}

impl<S: PageSize> Copy for VirtualPage<S> {}

impl<S: PageSize> Clone for VirtualPage<S> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<S: PageSize> VirtualPage<S> {
    /// Wrap an already aligned base address.
    ///
    /// ### Debug assertions
    /// - Asserts that `base` is `S`-aligned.
    #[inline]
    #[must_use]
    pub const fn from_addr(base: VirtualAddress) -> Self {
        debug_assert!(base.is_aligned::<S>());
        Self {
            base,
            _size: PhantomData,
        }
    }

    #[inline]
    #[must_use]
    pub const fn containing(addr: VirtualAddress) -> Self {
        Self::from_addr(addr.align_down::<S>())
    }

    #[inline]
    #[must_use]
    pub const fn base(self) -> VirtualAddress {
        self.base
    }

    /// The following page; `None` at the top of the address space.
    #[inline]
    #[must_use]
    pub const fn next(self) -> Option<Self> {
        match self.base.checked_add(S::SIZE) {
            Some(b) => Some(Self::from_addr(b)),
            None => None,
        }
    }
}

impl<S: PageSize> fmt::Debug for VirtualPage<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "VirtualPage<{}>(0x{:016X})", S::NAME, self.base.as_u64())
    }
}

impl<S: PageSize> From<VirtualPage<S>> for VirtualAddress {
    fn from(value: VirtualPage<S>) -> Self {
        value.base()
    }
}
