//! # Kernel synchronization primitives
//!
//! * [`SpinLock`]: test-and-test-and-set lock guarding the frame bitmap and
//!   every address space's area list.
//! * [`IrqGuard`]: keeps interrupts off on this CPU for a critical section,
//!   so a fault or IRQ cannot re-enter a lock its own CPU already holds.
//! * [`SyncOnceCell`]: one-shot publication of boot-time singletons.

#![cfg_attr(not(any(test, doctest)), no_std)]
#![allow(unsafe_code)]

pub mod irq;
mod spin_lock;
mod sync_once_cell;

pub use irq::IrqGuard;
pub use spin_lock::{IrqSpinLockGuard, SpinLock, SpinLockGuard};
pub use sync_once_cell::SyncOnceCell;
