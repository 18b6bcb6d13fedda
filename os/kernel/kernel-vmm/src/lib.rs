//! # Kernel Virtual Memory Manager
//!
//! Address spaces, their areas, and the page-fault path that backs those
//! areas with physical frames on first touch.
//!
//! ## Architecture Overview
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────┐
//! │                    Memory Manager                        │
//! │  create / allocate / free / destroy / switch / #PF       │
//! └───────┬──────────────────┬──────────────────┬────────────┘
//!         │                  │                  │
//! ┌───────▼───────┐  ┌───────▼───────┐  ┌───────▼───────┐
//! │ Address Space │  │  Table Walker │  │  Frame Pool   │
//! │ root + areas  │  │  (kernel-vmem)│  │ (kernel-alloc)│
//! └───────────────┘  └───────────────┘  └───────────────┘
//! ```
//!
//! Areas are reserved ranges with generic [`VmFlags`]. Reserving one maps
//! nothing (unless it is MMIO); the first access faults, and
//! [`MemoryManager::handle_page_fault`] maps a zeroed frame there.
//!
//! ## Usage
//! ```rust,no_run
//! # use kernel_vmm::*;
//! # fn demo<M: kernel_vmem::PhysMapper, U: kernel_vmem::Mmu>(mm: &MemoryManager<M, U>) -> Result<(), VmmError> {
//! let space = mm.create_address_space()?;
//! let mut cpu = ExecutionUnit::new();
//! mm.switch(&mut cpu, space.clone());
//!
//! let buffer = mm.allocate(&space, 8192, VmFlags::user_data(), None)?;
//! // ... user code touches `buffer`, faults are resolved on demand ...
//! mm.free(&space, buffer)?;
//!
//! mm.switch(&mut cpu, mm.kernel_space().clone());
//! mm.destroy(space)?;
//! # Ok(())
//! # }
//! ```

#![cfg_attr(not(any(test, doctest)), no_std)]
#![allow(unsafe_code)]

extern crate alloc;

mod address_space;
mod area;
pub mod area_list;
pub mod boot;
mod error;
pub mod fault;
mod manager;

pub use address_space::{AddressSpace, ExecutionUnit, SpaceKind};
pub use area::{VmArea, VmFlags};
pub use area_list::AreaList;
pub use error::VmmError;
pub use fault::{FaultEvent, FaultOutcome, FaultRejection, PageFaultError, TrapFrame};
pub use manager::MemoryManager;
