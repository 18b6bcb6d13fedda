use bitfield_struct::bitfield;
use kernel_memory_addresses::{PhysicalAddress, PhysicalPage, Size2M, Size4K};

/// A single 64-bit x86-64 page-table entry in its raw bitfield form.
///
/// This is the **common superset** of PML4E, PDPTE, PDE and PTE. Whether an
/// entry is a pointer to the next table or a leaf depends on the level and
/// the `large_page` (PS) bit.
///
/// ### Bit layout
///
/// | Bits      | Name / Mnemonic   | Meaning |
/// |-----------|-------------------|----------|
/// | 0         | `P` (present)     | Valid entry if set |
/// | 1         | `RW`              | Writable if set |
/// | 2         | `US`              | User-mode accessible if set |
/// | 3         | `PWT`             | Write-through caching |
/// | 4         | `PCD`             | Disable caching |
/// | 5         | `A`               | Accessed |
/// | 6         | `D`               | Dirty (leaf only) |
/// | 7         | `PS`              | Large page flag (PD level here) |
/// | 8         | `G`               | Global (leaf only) |
/// | 9–11      | OS avail low      | Reserved for OS use |
/// | 12–51     | `addr`            | Physical frame bits [51:12] |
/// | 52–58     | OS avail high     | Reserved for OS use |
/// | 59–62     | `PKU` / OS use    | Protection key or OS use |
/// | 63        | `NX`              | Execute disable |
///
/// ### Example
/// ```rust
/// # use kernel_vmem::PageEntryBits;
/// # use kernel_memory_addresses::{PhysicalAddress, PhysicalPage};
/// let frame = PhysicalPage::containing(PhysicalAddress::new(0x5000));
/// let e = PageEntryBits::table_pointer(frame, true);
/// assert!(e.present() && e.writable() && e.user_access());
/// assert_eq!(e.physical_address().as_u64(), 0x5000);
/// ```
#[bitfield(u64)]
#[derive(PartialEq, Eq)]
pub struct PageEntryBits {
    /// Present (P, bit 0).
    pub present: bool,

    /// Writable (RW, bit 1).
    ///
    /// Effective write permission is the intersection over the whole walk.
    pub writable: bool,

    /// User/Supervisor (US, bit 2).
    ///
    /// Must be set on every level of the walk for a user access to succeed.
    pub user_access: bool,

    /// Page Write-Through (PWT, bit 3).
    pub write_through: bool,

    /// Page Cache Disable (PCD, bit 4). Set for MMIO.
    pub cache_disabled: bool,

    /// Accessed (A, bit 5). Set by the CPU.
    pub accessed: bool,

    /// Dirty (D, bit 6) — **leaf only**. Set by the CPU on first write.
    pub dirty: bool,

    /// Page Size (PS, bit 7).
    ///
    /// In a PD entry, marks a 2 MiB leaf. Must be clear in PML4 entries and,
    /// as this walker never creates 1 GiB leaves, in PDPT entries too.
    pub large_page: bool,

    /// Global (G, bit 8) — **leaf only**.
    ///
    /// With `CR4.PGE`, the translation survives CR3 reloads. Used for every
    /// kernel-half leaf.
    pub global_translation: bool,

    /// OS-available (bits 9..=11).
    #[bits(3)]
    pub os_available_low: u8,

    /// Physical address bits [51:12].
    #[bits(40)]
    phys_addr_bits_51_12: u64,

    /// OS-available (bits 52..=58).
    #[bits(7)]
    pub os_available_high: u8,

    /// Protection Key (bits 59..=62).
    #[bits(4)]
    pub protection_key: u8,

    /// No-Execute (NX, bit 63).
    pub no_execute: bool,
}

impl PageEntryBits {
    #[inline]
    pub const fn set_physical_address(&mut self, phys: PhysicalAddress) {
        self.set_phys_addr_bits_51_12(phys.as_u64() >> 12);
    }

    #[inline]
    #[must_use]
    pub const fn with_physical_address(mut self, phys: PhysicalAddress) -> Self {
        self.set_physical_address(phys);
        self
    }

    #[inline]
    #[must_use]
    pub const fn physical_address(&self) -> PhysicalAddress {
        PhysicalAddress::new(self.phys_addr_bits_51_12() << 12)
    }

    /// The next-level table this (non-leaf) entry points to.
    #[inline]
    #[must_use]
    pub const fn table_frame(&self) -> PhysicalPage<Size4K> {
        PhysicalPage::from_addr(self.physical_address())
    }

    /// The 2 MiB frame of a PD-level leaf. Bit 12 (PAT) is masked off.
    #[inline]
    #[must_use]
    pub const fn huge_frame(&self) -> PhysicalPage<Size2M> {
        PhysicalPage::containing(self.physical_address())
    }

    /// Non-leaf entry pointing at `table`: present and writable, plus `US`
    /// when a user-accessible leaf lives below it.
    ///
    /// Restrictions are expressed at the leaf only, so intermediate entries
    /// never block an access the leaf allows.
    #[inline]
    #[must_use]
    pub const fn table_pointer(table: PhysicalPage<Size4K>, user: bool) -> Self {
        Self::new()
            .with_present(true)
            .with_writable(true)
            .with_user_access(user)
            .with_physical_address(table.base())
    }

    /// Leaf entry: `pa | attributes | P`, plus `PS` for a huge leaf.
    #[inline]
    #[must_use]
    pub const fn leaf(pa: PhysicalAddress, attributes: Self, huge: bool) -> Self {
        attributes
            .with_present(true)
            .with_large_page(huge)
            .with_physical_address(pa)
    }

    /// The permission and caching bits of this entry with the address,
    /// present and page-size bits cleared.
    #[inline]
    #[must_use]
    pub const fn attributes(&self) -> Self {
        self.with_present(false)
            .with_large_page(false)
            .with_accessed(false)
            .with_dirty(false)
            .with_phys_addr_bits_51_12(0)
    }

    /// Kernel read/write data: `RW | G | NX`.
    #[inline]
    #[must_use]
    pub const fn kernel_data() -> Self {
        Self::new()
            .with_writable(true)
            .with_global_translation(true)
            .with_no_execute(true)
    }

    /// Kernel code and data: `RW | G`, executable.
    #[inline]
    #[must_use]
    pub const fn kernel_image() -> Self {
        Self::new().with_writable(true).with_global_translation(true)
    }
}
