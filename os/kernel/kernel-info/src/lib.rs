//! # Kernel Memory Layout and Boot Interface
//!
//! The single source of truth for the virtual address layout the memory core
//! enforces, and the plain-data records the bootloader hands over before the
//! physical allocator comes up.
//!
//! ## Virtual Memory Architecture
//!
//! ```text
//! 0x0000_0000_0000_0000 ┌─────────────────────────────────┐
//!                       │  (null guard, low identity)     │
//! USER_START            ├─────────────────────────────────┤ 0x0000_0000_0040_0000
//!                       │  User areas (demand paged)      │
//! USER_END              ├─────────────────────────────────┤ 0x0000_8000_0000_0000
//!                       │  non-canonical hole             │
//! KERNEL_HALF_START     ├─────────────────────────────────┤ 0xffff_8000_0000_0000
//!                       │  (unused)                       │
//! HHDM_BASE             ├─────────────────────────────────┤ 0xffff_8880_0000_0000
//!                       │  Direct map of physical memory  │
//! KERNEL_AREA_START     ├─────────────────────────────────┤ 0xffff_c000_0000_0000
//!                       │  Kernel areas (demand paged)    │
//! KERNEL_AREA_END       ├─────────────────────────────────┤ 0xffff_ff80_0000_0000
//!                       │  (unused)                       │
//! KERNEL_BASE           ├─────────────────────────────────┤ 0xffff_ffff_8000_0000
//!                       │  Kernel image, then the heap    │
//! 0xFFFF_FFFF_FFFF_FFFF └─────────────────────────────────┘
//! ```
//!
//! ## Modules
//!
//! * [`memory`]: layout constants with compile-time consistency checks, and
//!   the [`MemoryLayout`](memory::MemoryLayout) value the address-space
//!   manager is configured with.
//! * [`boot`]: `#[repr(C)]` memory map and kernel image records.

#![cfg_attr(not(any(test, doctest)), no_std)]
#![deny(unsafe_code)]

pub mod boot;
pub mod memory;
