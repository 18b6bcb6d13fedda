//! # Translation Hardware
//!
//! The walker and the address-space manager never touch CR3, CR4 or the TLB
//! directly. They go through [`Mmu`], which keeps host tests free of
//! privileged instructions.

use kernel_memory_addresses::{PhysicalPage, Size4K, VirtualAddress};

/// Per-CPU translation hardware.
pub trait Mmu {
    /// Drop any cached translation for the page containing `va`.
    fn invalidate_page(&self, va: VirtualAddress);

    /// Make `root` the active top-level table on this CPU.
    fn load_root(&self, root: PhysicalPage<Size4K>);

    /// Let `G` leaves survive root switches.
    fn enable_global_pages(&self);
}

impl<T: Mmu + ?Sized> Mmu for &T {
    #[inline]
    fn invalidate_page(&self, va: VirtualAddress) {
        (**self).invalidate_page(va);
    }

    #[inline]
    fn load_root(&self, root: PhysicalPage<Size4K>) {
        (**self).load_root(root);
    }

    #[inline]
    fn enable_global_pages(&self) {
        (**self).enable_global_pages();
    }
}

/// The MMU of the CPU this code runs on.
#[cfg(target_arch = "x86_64")]
#[derive(Debug)]
pub struct X86Mmu {
    _private: (),
}

#[cfg(target_arch = "x86_64")]
impl X86Mmu {
    /// # Safety
    /// Every method executes privileged instructions; the caller must run at
    /// CPL0 with paging enabled, and any root passed to
    /// [`load_root`](Mmu::load_root) must map the running kernel.
    #[must_use]
    pub const unsafe fn new() -> Self {
        Self { _private: () }
    }
}

#[cfg(target_arch = "x86_64")]
impl Mmu for X86Mmu {
    #[inline]
    fn invalidate_page(&self, va: VirtualAddress) {
        // Safety: CPL0 per `X86Mmu::new`.
        unsafe { kernel_registers::instructions::invlpg(va) }
    }

    fn load_root(&self, root: PhysicalPage<Size4K>) {
        use kernel_registers::StoreRegisterUnsafe;
        use kernel_registers::cr3::Cr3;

        // Safety: the root maps the kernel half per `X86Mmu::new`.
        unsafe { Cr3::from_root(root).store_unsafe() }
    }

    fn enable_global_pages(&self) {
        use kernel_registers::cr4::Cr4;
        use kernel_registers::{LoadRegisterUnsafe, StoreRegisterUnsafe};

        // Safety: setting PGE keeps every existing translation valid.
        unsafe {
            let cr4 = Cr4::load_unsafe();
            if !cr4.pge() {
                cr4.with_pge(true).store_unsafe();
            }
        }
    }
}
