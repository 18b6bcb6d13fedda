//! # HHDM-based PhysMapper for Kernel Virtual Memory
//!
//! This module provides a [`PhysMapper`] implementation for kernels that use a
//! higher-half direct map (HHDM). Every physical address `pa` is reachable at
//! `offset + pa`, where `offset` is reported once by the bootloader.
//!
//! ## Why is this needed?
//! - Code can only dereference virtual addresses, not physical ones.
//! - The frame bitmap and every page table live in physical memory and must
//!   be read and written before (or without) any dedicated mapping.
//!
//! ## Example
//! ```rust
//! use kernel_alloc::phys_mapper::HhdmPhysMapper;
//! use kernel_memory_addresses::{PhysicalAddress, VirtualAddress};
//!
//! let mapper = HhdmPhysMapper::new(0xffff_8880_0000_0000);
//! let va = mapper.physical_to_accessible(PhysicalAddress::new(0x1234_0000));
//! assert_eq!(va, VirtualAddress::new(0xffff_8880_1234_0000));
//! assert_eq!(mapper.accessible_to_physical(va), Some(PhysicalAddress::new(0x1234_0000)));
//! ```

use kernel_info::memory::HHDM_BASE;
use kernel_memory_addresses::{PhysicalAddress, VirtualAddress};
use kernel_vmem::PhysMapper;

/// [`PhysMapper`] for kernels with a higher-half direct map.
///
/// The offset is fixed at construction and never changes afterwards.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct HhdmPhysMapper {
    offset: u64,
}

impl HhdmPhysMapper {
    #[must_use]
    pub const fn new(offset: u64) -> Self {
        Self { offset }
    }

    #[must_use]
    pub const fn offset(&self) -> u64 {
        self.offset
    }

    /// Where `pa` can be accessed.
    #[inline]
    #[must_use]
    pub const fn physical_to_accessible(&self, pa: PhysicalAddress) -> VirtualAddress {
        VirtualAddress::new(self.offset.wrapping_add(pa.as_u64()))
    }

    /// Inverse of [`physical_to_accessible`](Self::physical_to_accessible);
    /// `None` below the direct map.
    #[inline]
    #[must_use]
    pub const fn accessible_to_physical(&self, va: VirtualAddress) -> Option<PhysicalAddress> {
        match va.as_u64().checked_sub(self.offset) {
            Some(pa) => Some(PhysicalAddress::new(pa)),
            None => None,
        }
    }
}

impl Default for HhdmPhysMapper {
    fn default() -> Self {
        Self::new(HHDM_BASE)
    }
}

// Safety: the bootloader maps all physical memory at `offset` before the
// kernel runs, and that mapping is never torn down.
unsafe impl PhysMapper for HhdmPhysMapper {
    #[inline]
    fn phys_to_ptr(&self, pa: PhysicalAddress) -> *mut u8 {
        self.physical_to_accessible(pa).as_mut_ptr()
    }
}
