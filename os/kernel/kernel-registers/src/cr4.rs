use crate::{LoadRegisterUnsafe, StoreRegisterUnsafe};
use bitfield_struct::bitfield;

/// CR4 — Control Register 4 (x86-64), paging-relevant view.
///
/// Only the bits the memory core reads or sets are named; the others are
/// carried through unchanged on a read-modify-write.
#[bitfield(u64, order = Lsb)]
pub struct Cr4 {
    /// Bits 0–3 — VME, PVI, TSD, DE.
    #[bits(4)]
    pub low_misc: u8,

    /// Bit 4 — PSE: Page Size Extensions.
    pub pse: bool,

    /// Bit 5 — PAE: Physical Address Extension (required for long mode).
    pub pae: bool,

    /// Bit 6 — MCE: Machine-Check Enable.
    pub mce: bool,

    /// Bit 7 — PGE: Page Global Enable.
    ///
    /// When set, leaf entries with `G=1` survive CR3 reloads. The shared
    /// kernel mappings rely on this.
    pub pge: bool,

    /// Bits 8–11 — PCE, OSFXSR, OSXMMEXCPT, UMIP.
    #[bits(4)]
    pub mid_misc: u8,

    /// Bit 12 — LA57: 57-bit linear addresses (5-level paging). Must stay clear.
    pub la57: bool,

    /// Bits 13–16 — VMXE, SMXE, reserved, FSGSBASE.
    #[bits(4)]
    pub high_misc: u8,

    /// Bit 17 — PCIDE: Process-Context Identifiers.
    pub pcide: bool,

    /// Bits 18–19 — OSXSAVE, reserved.
    #[bits(2)]
    pub xsave_misc: u8,

    /// Bit 20 — SMEP: Supervisor Mode Execution Prevention.
    pub smep: bool,

    /// Bit 21 — SMAP: Supervisor Mode Access Prevention.
    pub smap: bool,

    /// Bits 22–63 — PKE and reserved.
    #[bits(42)]
    pub upper: u64,
}

#[cfg(feature = "asm")]
impl LoadRegisterUnsafe for Cr4 {
    unsafe fn load_unsafe() -> Self {
        let cr4: u64;
        unsafe {
            core::arch::asm!("mov {}, cr4", out(reg) cr4, options(nomem, nostack, preserves_flags));
        }
        Self::from_bits(cr4)
    }
}

#[cfg(feature = "asm")]
impl StoreRegisterUnsafe for Cr4 {
    unsafe fn store_unsafe(self) {
        let cr4 = self.into_bits();
        unsafe {
            core::arch::asm!("mov cr4, {}", in(reg) cr4, options(nostack, preserves_flags));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pge_is_bit_seven() {
        let cr4 = Cr4::new().with_pge(true);
        assert_eq!(cr4.into_bits(), 1 << 7);
    }

    #[test]
    fn setting_pge_preserves_other_bits() {
        let raw = (1 << 5) | (1 << 20) | (1 << 9);
        let cr4 = Cr4::from_bits(raw).with_pge(true);
        assert_eq!(cr4.into_bits(), raw | (1 << 7));
        assert!(cr4.pae());
        assert!(cr4.smep());
    }
}
