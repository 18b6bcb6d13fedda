//! # Virtual Memory Support
//!
//! x86-64 4-level page tables and the walker that builds them.
//!
//! ## What you get
//! - [`PageEntryBits`], the bitfield view of one entry at any level.
//! - [`PageTable`], a 4 KiB node of 512 atomically updated entries.
//! - [`TableWalker`], bound to one root, with `map` / `unmap_range` /
//!   `translate` / `release_tables`.
//! - The seams the walker is generic over: [`PhysMapper`] (how to touch a
//!   physical frame), [`FrameAlloc`] (where table frames come from) and
//!   [`Mmu`] (TLB and CR3/CR4 side effects).
//!
//! ## x86-64 Virtual Address → Physical Address Walk
//!
//! ```text
//! | 47‒39 | 38‒30 | 29‒21 | 20‒12 | 11‒0   |
//! |  PML4 |  PDPT |   PD  |   PT  | Offset |
//! ```
//!
//! ```text
//!  PML4  →  PDPT  →  PD  →  PT  →  Physical Page
//!   │        │        │        │
//!   │        │        │        └───► PTE → maps 4 KiB page
//!   │        │        └────────────► PDE → PS=1 → 2 MiB page
//!   │        └─────────────────────► PDPTE → next table
//!   └──────────────────────────────► PML4E → next table
//! ```
//!
//! Root slots `0..256` translate the user half, `256..512` the kernel half.
//! The kernel-half slots of every root point at the same PDPTs, so a kernel
//! mapping made through any root is visible through all of them.

#![cfg_attr(not(any(test, doctest)), no_std)]
#![allow(unsafe_code)]

extern crate alloc;

mod mmu;
mod page_entry_bits;
pub mod page_table;
mod walker;

pub use crate::mmu::Mmu;
#[cfg(target_arch = "x86_64")]
pub use crate::mmu::X86Mmu;
pub use crate::page_entry_bits::PageEntryBits;
pub use crate::page_table::{PageTable, TableIndex, TableLevel};
pub use crate::walker::{LeafSize, MapError, TableWalker, Translation, UnmappedLeaf};

use kernel_memory_addresses::{PhysicalAddress, PhysicalPage, Size4K};

/// Frame allocator used by the walker to obtain **physical** 4 KiB frames
/// for intermediate tables, and to return a table that lost an install race.
///
/// Returned frames **must** be 4 KiB aligned and owned by the caller.
pub trait FrameAlloc {
    /// Allocate one 4 KiB frame; `None` when physical memory is exhausted.
    fn alloc_4k(&mut self) -> Option<PhysicalPage<Size4K>>;

    /// Give back a frame obtained from [`alloc_4k`](Self::alloc_4k).
    fn free_4k(&mut self, frame: PhysicalPage<Size4K>);
}

/// Converts physical addresses to pointers usable in the current address
/// space, typically through the higher-half direct map.
///
/// This is the only sanctioned way to turn a [`PhysicalAddress`] into
/// something dereferenceable.
///
/// # Safety
/// Implementations must return a pointer through which `pa` is readable and
/// writable for as long as the kernel runs.
pub unsafe trait PhysMapper {
    /// Pointer to the byte at `pa`.
    fn phys_to_ptr(&self, pa: PhysicalAddress) -> *mut u8;

    /// Borrow the `T` stored at `pa`.
    ///
    /// # Safety
    /// - `pa` must be suitably aligned for `T` and hold a valid `T`.
    /// - The lifetime `'a` is unchecked; the frame must stay allocated for it.
    #[inline]
    unsafe fn phys_to_ref<'a, T>(&self, pa: PhysicalAddress) -> &'a T {
        unsafe { &*self.phys_to_ptr(pa).cast::<T>() }
    }

    /// Fill one frame with zeroes.
    ///
    /// # Safety
    /// The frame must be owned by the caller and not in use as a live table.
    #[inline]
    unsafe fn zero_frame(&self, frame: PhysicalPage<Size4K>) {
        unsafe {
            core::ptr::write_bytes(self.phys_to_ptr(frame.base()), 0, 4096);
        }
    }

    /// Borrow the page-table node stored in `frame`.
    ///
    /// # Safety
    /// `frame` must hold a page table (or zeroes) for the lifetime `'a`.
    #[inline]
    unsafe fn table<'a>(&self, frame: PhysicalPage<Size4K>) -> &'a PageTable {
        unsafe { self.phys_to_ref::<PageTable>(frame.base()) }
    }
}
