use crate::LoadRegisterUnsafe;
use kernel_memory_addresses::VirtualAddress;

/// CR2 — Page-Fault Linear Address.
///
/// Written by the CPU when a `#PF` is raised; holds the virtual address whose
/// translation failed. Only meaningful inside the page-fault handler, before
/// anything else can fault.
#[repr(transparent)]
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct Cr2(u64);

impl Cr2 {
    #[inline]
    #[must_use]
    pub const fn from_bits(bits: u64) -> Self {
        Self(bits)
    }

    /// The faulting virtual address.
    #[inline]
    #[must_use]
    pub const fn fault_address(self) -> VirtualAddress {
        VirtualAddress::new(self.0)
    }
}

#[cfg(feature = "asm")]
impl LoadRegisterUnsafe for Cr2 {
    unsafe fn load_unsafe() -> Self {
        let cr2: u64;
        unsafe {
            core::arch::asm!("mov {}, cr2", out(reg) cr2, options(nomem, nostack, preserves_flags));
        }
        Self(cr2)
    }
}
