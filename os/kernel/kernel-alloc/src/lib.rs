//! # Kernel Physical Memory Allocation
//!
//! This crate owns physical memory: which 4 KiB frames are free, who owns the
//! ones that are not, and how the kernel reaches their contents.
//!
//! ## Architecture Overview
//!
//! ```text
//! ┌─────────────────────────────────────────────────────┐
//! │                 Frame Pool                          │
//! │    • SpinLock around the bitmap                     │
//! │    • Owner counts for shared frames                 │
//! │    • FrameAlloc for the page-table walker           │
//! └─────────────────┬───────────────────────────────────┘
//!                   │
//! ┌─────────────────▼───────────────────────────────────┐
//! │           Bitmap Frame Allocator                    │
//! │    • One bit per frame, 1 = occupied                │
//! │    • First-fit contiguous runs, next-free hint      │
//! │    • Bitmap stored in physical memory               │
//! └─────────────────┬───────────────────────────────────┘
//!                   │
//! ┌─────────────────▼───────────────────────────────────┐
//! │              Physical Mapper                        │
//! │    • HHDM: physical address + fixed offset          │
//! │    • The only way to touch a physical frame         │
//! └─────────────────────────────────────────────────────┘
//! ```
//!
//! ## Core Components
//!
//! ### Bitmap Frame Allocator ([`bitmap`])
//!
//! Built once from the boot memory map. The bitmap covers
//! `[0, highest_usable)` and is carved out of the top of the first usable
//! region that can hold it. Double frees are reported as
//! [`FrameFreeError::AlreadyFree`] and leave the bitmap unchanged.
//!
//! ### Frame Pool ([`frame_pool`])
//!
//! The shared, lock-protected allocator. `&FramePool` implements
//! [`kernel_vmem::FrameAlloc`], taking the lock once per frame.
//!
//! ### Physical Mapper ([`phys_mapper`])
//!
//! [`HhdmPhysMapper`] implements [`kernel_vmem::PhysMapper`] over the
//! bootloader's higher-half direct map.
//!
//! ## Usage
//! ```rust,no_run
//! use kernel_alloc::{BitmapFrameAlloc, FramePool, HhdmPhysMapper};
//! use kernel_info::boot::MemoryRegion;
//!
//! let mut map = [MemoryRegion::usable(0x10_0000, 0x700_0000)];
//! let mapper = HhdmPhysMapper::default();
//! let frames = unsafe { BitmapFrameAlloc::initialize(&mut map, &mapper) }.unwrap();
//! let pool = FramePool::new(frames);
//! if let Some(frame) = pool.alloc_zeroed_4k(&mapper) {
//!     pool.release(frame).unwrap();
//! }
//! ```

#![cfg_attr(not(any(test, doctest)), no_std)]
#![allow(unsafe_code)]

extern crate alloc;

pub mod bitmap;
pub mod frame_pool;
pub mod phys_mapper;

pub use bitmap::{BitmapFrameAlloc, FrameFreeError, PhysInitError};
pub use frame_pool::FramePool;
pub use phys_mapper::HhdmPhysMapper;
