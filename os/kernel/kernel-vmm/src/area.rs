use bitfield_struct::bitfield;
use kernel_memory_addresses::{PhysicalAddress, VirtualAddress};
use kernel_vmem::PageEntryBits;

/// Generic permissions of a virtual memory area.
///
/// ### Translation to hardware bits
///
/// | Flag          | Leaf bits            |
/// |---------------|----------------------|
/// | `writable`    | `RW`                 |
/// | !`executable` | `NX`                 |
/// | `user`        | `US`                 |
/// | `mmio`        | `PCD` \| `PWT`       |
///
/// `readable` has no hardware counterpart; a present page is readable.
/// `G` depends on where the area lives, see [`VmArea::page_entry_bits`].
///
/// ```rust
/// # use kernel_vmm::VmFlags;
/// let bits = VmFlags::user_data().page_entry_bits();
/// assert!(bits.writable() && bits.user_access() && bits.no_execute());
/// assert!(!bits.global_translation());
/// ```
#[bitfield(u8)]
#[derive(PartialEq, Eq)]
pub struct VmFlags {
    pub readable: bool,
    pub writable: bool,
    pub executable: bool,
    /// Accessible from CPL 3.
    pub user: bool,
    /// Device memory, mapped eagerly and uncached against a caller-supplied
    /// physical range.
    pub mmio: bool,
    #[bits(3)]
    __: u8,
}

impl VmFlags {
    /// Readable and writable, kernel only.
    #[must_use]
    pub const fn kernel_data() -> Self {
        Self::new().with_readable(true).with_writable(true)
    }

    /// Readable and writable, user accessible.
    #[must_use]
    pub const fn user_data() -> Self {
        Self::kernel_data().with_user(true)
    }

    #[must_use]
    pub const fn read_only() -> Self {
        Self::new().with_readable(true)
    }

    /// Leaf attributes for pages of an area with these flags, without `G`.
    #[must_use]
    pub const fn page_entry_bits(self) -> PageEntryBits {
        PageEntryBits::new()
            .with_writable(self.writable())
            .with_no_execute(!self.executable())
            .with_user_access(self.user())
            .with_cache_disabled(self.mmio())
            .with_write_through(self.mmio())
    }
}

/// One reserved, contiguous virtual range of an address space.
///
/// Areas are created by an allocation and destroyed by a free; they are
/// never split or merged.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct VmArea {
    base: VirtualAddress,
    size: u64,
    flags: VmFlags,
    backing: Option<PhysicalAddress>,
}

impl VmArea {
    pub(crate) const fn new(
        base: VirtualAddress,
        size: u64,
        flags: VmFlags,
        backing: Option<PhysicalAddress>,
    ) -> Self {
        debug_assert!(size > 0);
        Self {
            base,
            size,
            flags,
            backing,
        }
    }

    #[must_use]
    pub const fn base(&self) -> VirtualAddress {
        self.base
    }

    /// Size in bytes, a multiple of 4 KiB.
    #[must_use]
    pub const fn size(&self) -> u64 {
        self.size
    }

    /// First address past the area.
    #[must_use]
    pub const fn end(&self) -> VirtualAddress {
        VirtualAddress::new(self.base.as_u64() + self.size)
    }

    #[must_use]
    pub const fn flags(&self) -> VmFlags {
        self.flags
    }

    /// Physical base of an MMIO area.
    #[must_use]
    pub const fn backing(&self) -> Option<PhysicalAddress> {
        self.backing
    }

    /// Leaf attributes for the pages of this area.
    ///
    /// Only kernel-only areas in the upper half are global. A global leaf
    /// survives a `CR3` reload, so one in the lower half would stay visible
    /// after switching to another address space.
    #[must_use]
    pub const fn page_entry_bits(&self) -> PageEntryBits {
        self.flags
            .page_entry_bits()
            .with_global_translation(!self.flags.user() && self.base.is_upper_half())
    }

    #[must_use]
    pub const fn contains(&self, va: VirtualAddress) -> bool {
        va.as_u64() >= self.base.as_u64() && va.as_u64() < self.end().as_u64()
    }

    #[must_use]
    pub const fn overlaps(&self, other: &Self) -> bool {
        self.base.as_u64() < other.end().as_u64() && other.base.as_u64() < self.end().as_u64()
    }
}
