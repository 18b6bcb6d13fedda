//! # Typed `X86_64` Paging Registers
//!
//! The control registers the memory core touches, as bitfields:
//!
//! | Register | Use |
//! |----------|-----|
//! | [`Cr2`](cr2::Cr2) | Faulting linear address, read by the page-fault path. |
//! | [`Cr3`](cr3::Cr3) | Root page-table base, written on address-space switch. |
//! | [`Cr4`](cr4::Cr4) | `PGE`, set once the kernel space is active. |
//!
//! The privileged `mov` forms are only compiled with the `asm` feature; the
//! bitfields themselves are plain data and usable in host tests.

#![cfg_attr(not(any(test, doctest)), no_std)]
#![allow(unsafe_code)]

#[cfg(feature = "cr2")]
pub mod cr2;

#[cfg(feature = "cr3")]
pub mod cr3;

#[cfg(feature = "cr4")]
pub mod cr4;

#[cfg(feature = "asm")]
pub mod instructions;

pub trait LoadRegisterUnsafe {
    /// # Safety
    /// The caller must uphold the implementation-specific safety requirements.
    /// For example, the register access might be privileged and require kernel mode (Ring 0).
    unsafe fn load_unsafe() -> Self;
}

pub trait StoreRegisterUnsafe {
    /// # Safety
    /// The caller must uphold the implementation-specific safety requirements.
    /// Writing a paging register changes the active translation.
    unsafe fn store_unsafe(self);
}
