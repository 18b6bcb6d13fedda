//! # Virtual and Physical Memory Address Types
//!
//! Strongly typed wrappers for raw addresses and page bases used by the
//! physical allocator, the page-table walker and the address-space manager.
//!
//! ## Overview
//!
//! | Type | Meaning |
//! |------|---------|
//! | [`PhysicalAddress`] / [`PhysicalPage<S>`] | Physical RAM or MMIO. Never dereferenced directly. |
//! | [`VirtualAddress`] / [`VirtualPage<S>`] | Addresses translated by the page tables. |
//! | [`PageSize`] | Marker for [`Size4K`] frames and [`Size2M`] huge pages. |
//!
//! The two address kinds do not convert into each other. The only way from a
//! physical address to something the CPU can touch is the direct map
//! (`PhysMapper` in `kernel-vmem`).
//!
//! ```rust
//! # use kernel_memory_addresses::*;
//! let frame = PhysicalPage::<Size4K>::frame(0x10);
//! assert_eq!(frame.base(), PhysicalAddress::new(0x1_0000));
//!
//! let va = VirtualAddress::new(0x40_1234);
//! assert_eq!(va.page::<Size4K>().base(), VirtualAddress::new(0x40_1000));
//! assert_eq!(va.align_up::<Size2M>(), Some(VirtualAddress::new(0x60_0000)));
//! ```

#![cfg_attr(not(any(test, doctest)), no_std)]

mod page_size;
mod physical_address;
mod virtual_address;

pub use page_size::{PageSize, Size2M, Size4K};
pub use physical_address::{PhysicalAddress, PhysicalPage};
pub use virtual_address::{VirtualAddress, VirtualPage};

/// Align `x` down to the nearest multiple of `a`.
///
/// `a` must be a non-zero power of two.
///
/// ```rust
/// # use kernel_memory_addresses::align_down;
/// assert_eq!(align_down(0,    4096), 0);
/// assert_eq!(align_down(4095, 4096), 0);
/// assert_eq!(align_down(8191, 4096), 4096);
/// ```
#[inline]
#[must_use]
pub const fn align_down(x: u64, a: u64) -> u64 {
    debug_assert!(a.is_power_of_two());
    x & !(a - 1)
}

/// Align `x` up to the nearest multiple of `a`, or `None` on overflow.
///
/// `a` must be a non-zero power of two.
///
/// ```rust
/// # use kernel_memory_addresses::align_up;
/// assert_eq!(align_up(0,    4096), Some(0));
/// assert_eq!(align_up(1,    4096), Some(4096));
/// assert_eq!(align_up(4097, 4096), Some(8192));
/// assert_eq!(align_up(u64::MAX, 4096), None);
/// ```
#[inline]
#[must_use]
pub const fn align_up(x: u64, a: u64) -> Option<u64> {
    debug_assert!(a.is_power_of_two());
    match x.checked_add(a - 1) {
        Some(v) => Some(v & !(a - 1)),
        None => None,
    }
}

/// Number of `S` pages needed to cover `bytes`.
///
/// ```rust
/// # use kernel_memory_addresses::*;
/// assert_eq!(pages_for::<Size4K>(1), 1);
/// assert_eq!(pages_for::<Size4K>(8192), 2);
/// assert_eq!(pages_for::<Size4K>(8193), 3);
/// ```
#[inline]
#[must_use]
pub const fn pages_for<S: PageSize>(bytes: u64) -> u64 {
    bytes.div_ceil(S::SIZE)
}
