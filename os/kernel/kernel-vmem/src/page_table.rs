//! # Page Table Nodes
//!
//! One node of the 4-level radix tree: 512 entries in one 4 KiB frame. The
//! same layout serves every level; [`TableLevel`] says how an entry at a
//! given level is interpreted.
//!
//! Entries are `AtomicU64` so that two CPUs racing to populate the same slot
//! (typically a shared kernel-half table) resolve through
//! [`PageTable::compare_install`] instead of overwriting each other.

use crate::PageEntryBits;
use core::fmt;
use core::sync::atomic::{AtomicU64, Ordering};
use kernel_memory_addresses::VirtualAddress;

/// Number of entries in every table.
pub const ENTRIES: usize = 512;

/// The four paging levels, root first.
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub enum TableLevel {
    /// PML4, the root. Indexed by VA bits `[47:39]`.
    Pml4,
    /// Page Directory Pointer Table. Indexed by VA bits `[38:30]`.
    Pdpt,
    /// Page Directory. Indexed by VA bits `[29:21]`; may hold 2 MiB leaves.
    Pd,
    /// Page Table. Indexed by VA bits `[20:12]`; holds 4 KiB leaves.
    Pt,
}

impl TableLevel {
    /// Lowest VA bit of this level's index.
    #[inline]
    #[must_use]
    pub const fn shift(self) -> u32 {
        match self {
            Self::Pml4 => 39,
            Self::Pdpt => 30,
            Self::Pd => 21,
            Self::Pt => 12,
        }
    }

    /// Bytes of virtual address space covered by one entry at this level.
    #[inline]
    #[must_use]
    pub const fn entry_span(self) -> u64 {
        1 << self.shift()
    }

    /// Table index for `va` at this level (`0..512`).
    #[inline]
    #[must_use]
    pub const fn index_of(self, va: VirtualAddress) -> TableIndex {
        TableIndex::new(((va.as_u64() >> self.shift()) & 0x1FF) as u16)
    }

    /// The level below, or `None` for the page table.
    #[inline]
    #[must_use]
    pub const fn next(self) -> Option<Self> {
        match self {
            Self::Pml4 => Some(Self::Pdpt),
            Self::Pdpt => Some(Self::Pd),
            Self::Pd => Some(Self::Pt),
            Self::Pt => None,
        }
    }

    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::Pml4 => "PML4",
            Self::Pdpt => "PDPT",
            Self::Pd => "PD",
            Self::Pt => "PT",
        }
    }
}

impl fmt::Display for TableLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Index into one table (`0..512`).
#[repr(transparent)]
#[derive(Debug, Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct TableIndex(u16);

impl TableIndex {
    /// ### Debug assertions
    /// - Asserts `v < 512`.
    #[inline]
    #[must_use]
    pub const fn new(v: u16) -> Self {
        debug_assert!((v as usize) < ENTRIES);
        Self(v)
    }

    #[inline]
    #[must_use]
    pub const fn as_usize(self) -> usize {
        self.0 as usize
    }
}

/// Split `va` into its PML4, PDPT, PD and PT indices.
#[inline]
#[must_use]
pub const fn split_indices(va: VirtualAddress) -> [TableIndex; 4] {
    [
        TableLevel::Pml4.index_of(va),
        TableLevel::Pdpt.index_of(va),
        TableLevel::Pd.index_of(va),
        TableLevel::Pt.index_of(va),
    ]
}

/// A page-table node: 512 entries, 4 KiB-aligned.
///
/// Only ever accessed through a shared reference obtained from the direct
/// map; all mutation goes through the atomic slot operations.
#[repr(C, align(4096))]
pub struct PageTable {
    entries: [AtomicU64; ENTRIES],
}

impl PageTable {
    /// Read the entry at `i`.
    #[inline]
    #[must_use]
    pub fn load(&self, i: TableIndex) -> PageEntryBits {
        PageEntryBits::from_bits(self.entries[i.as_usize()].load(Ordering::Acquire))
    }

    /// Overwrite the entry at `i`.
    ///
    /// Caller must handle any required TLB invalidation when changing active mappings.
    #[inline]
    pub fn store(&self, i: TableIndex, e: PageEntryBits) {
        self.entries[i.as_usize()].store(e.into_bits(), Ordering::Release);
    }

    /// Install `new` at `i` only if the slot still holds `current`.
    ///
    /// On failure returns whatever another writer installed in between.
    #[inline]
    pub fn compare_install(
        &self,
        i: TableIndex,
        current: PageEntryBits,
        new: PageEntryBits,
    ) -> Result<(), PageEntryBits> {
        self.entries[i.as_usize()]
            .compare_exchange(
                current.into_bits(),
                new.into_bits(),
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .map(|_| ())
            .map_err(PageEntryBits::from_bits)
    }

    /// OR `bits` into the entry at `i`.
    #[inline]
    pub fn set_bits(&self, i: TableIndex, bits: PageEntryBits) {
        self.entries[i.as_usize()].fetch_or(bits.into_bits(), Ordering::AcqRel);
    }

    /// Clear the entry at `i` and return what it held.
    #[inline]
    pub fn take(&self, i: TableIndex) -> PageEntryBits {
        PageEntryBits::from_bits(self.entries[i.as_usize()].swap(0, Ordering::AcqRel))
    }

    /// Iterate over `(index, entry)` for every present entry.
    pub fn present_entries(&self) -> impl Iterator<Item = (TableIndex, PageEntryBits)> + '_ {
        (0..ENTRIES).filter_map(move |i| {
            #[allow(clippy::cast_possible_truncation)]
            let idx = TableIndex::new(i as u16);
            let e = self.load(idx);
            e.present().then_some((idx, e))
        })
    }
}

const _: () = {
    assert!(size_of::<PageTable>() == 4096);
    assert!(align_of::<PageTable>() == 4096);
};
