use crate::{LoadRegisterUnsafe, StoreRegisterUnsafe};
use bitfield_struct::bitfield;
use kernel_memory_addresses::{PhysicalAddress, PhysicalPage, Size4K};

/// CR3 — Page-Map Level-4 Base Register (IA-32e, PCID disabled).
///
/// Holds the physical frame of the root page table. Loading it switches the
/// active address space and drops every non-global TLB entry.
#[bitfield(u64)]
pub struct Cr3 {
    /// Bits 0–2 — Reserved (must be 0).
    #[bits(3)]
    __reserved0: u8,

    /// Bit 3 — PWT: Page-level Write-Through for root table walks.
    pub pwt: bool,

    /// Bit 4 — PCD: Page-level Cache Disable for root table walks.
    pub pcd: bool,

    /// Bits 5–11 — Reserved (must be 0 when written).
    #[bits(7)]
    __reserved1: u8,

    /// Bits 12–51 — root table frame number.
    #[bits(40)]
    root_frame: u64,

    /// Bits 52–63 — Reserved.
    #[bits(12)]
    __reserved2: u16,
}

impl Cr3 {
    /// CR3 value selecting `root` with write-back caching of the walk.
    #[must_use]
    pub const fn from_root(root: PhysicalPage<Size4K>) -> Self {
        Self::new().with_root_frame(root.frame_number())
    }

    /// The root table frame.
    #[must_use]
    pub const fn root(&self) -> PhysicalPage<Size4K> {
        PhysicalPage::from_addr(PhysicalAddress::new(self.root_frame() << 12))
    }
}

#[cfg(feature = "asm")]
impl LoadRegisterUnsafe for Cr3 {
    unsafe fn load_unsafe() -> Self {
        let cr3: u64;
        unsafe {
            core::arch::asm!("mov {}, cr3", out(reg) cr3, options(nomem, nostack, preserves_flags));
        }
        Self::from_bits(cr3)
    }
}

#[cfg(feature = "asm")]
impl StoreRegisterUnsafe for Cr3 {
    unsafe fn store_unsafe(self) {
        let cr3 = self.into_bits();
        unsafe {
            core::arch::asm!("mov cr3, {}", in(reg) cr3, options(nostack, preserves_flags));
        }
    }
}
