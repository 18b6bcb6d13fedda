//! # Page-Table Walker
//!
//! [`TableWalker`] builds and tears down the radix tree below one root.
//!
//! Intermediate tables are allocated on demand from a [`FrameAlloc`], zeroed
//! through the [`PhysMapper`] and installed with compare-and-exchange. When
//! two CPUs race for the same empty slot, the loser returns its frame and
//! continues below the winner's table.
//!
//! ```text
//!   map(va, pa, 4K)                     map(va, pa, 2M)
//!   PML4[i4] ─► PDPT[i3] ─► PD[i2] ─►   PML4[i4] ─► PDPT[i3] ─► PD[i2]
//!                           PT[i1] = leaf                         = leaf|PS
//! ```

use crate::page_table::{ENTRIES, TableIndex, TableLevel};
use crate::{FrameAlloc, Mmu, PageEntryBits, PageTable, PhysMapper};
use alloc::vec::Vec;
use core::ops::Range;
use kernel_memory_addresses::{PageSize, PhysicalAddress, PhysicalPage, Size2M, Size4K, VirtualAddress};
use log::trace;

/// Size of the leaf a mapping terminates in.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum LeafSize {
    /// 4 KiB leaf in a page table.
    Page4K,
    /// 2 MiB leaf (`PS`) in a page directory.
    Huge2M,
}

impl LeafSize {
    #[inline]
    #[must_use]
    pub const fn bytes(self) -> u64 {
        match self {
            Self::Page4K => Size4K::SIZE,
            Self::Huge2M => Size2M::SIZE,
        }
    }

    /// The table level holding leaves of this size.
    #[inline]
    #[must_use]
    pub const fn level(self) -> TableLevel {
        match self {
            Self::Page4K => TableLevel::Pt,
            Self::Huge2M => TableLevel::Pd,
        }
    }

    #[inline]
    const fn align_va(self, va: VirtualAddress) -> VirtualAddress {
        match self {
            Self::Page4K => va.align_down::<Size4K>(),
            Self::Huge2M => va.align_down::<Size2M>(),
        }
    }

    #[inline]
    const fn align_pa(self, pa: PhysicalAddress) -> PhysicalAddress {
        match self {
            Self::Page4K => pa.align_down::<Size4K>(),
            Self::Huge2M => pa.align_down::<Size2M>(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum MapError {
    #[error("out of memory allocating a {level} table")]
    OutOfMemory { level: TableLevel },
    #[error("{va:?} is already mapped")]
    AlreadyMapped { va: VirtualAddress },
    #[error("{va:?} overlaps a mapping of a different page size")]
    HugePageConflict { va: VirtualAddress },
}

/// Result of a successful [`TableWalker::translate`].
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct Translation {
    /// Physical address `va` resolves to, offset included.
    pub pa: PhysicalAddress,
    /// The leaf entry as stored.
    pub entry: PageEntryBits,
    pub size: LeafSize,
}

/// One leaf removed by [`TableWalker::unmap_range`].
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct UnmappedLeaf {
    /// First virtual address the leaf covered.
    pub va: VirtualAddress,
    /// Frame the leaf pointed at.
    pub pa: PhysicalAddress,
    pub size: LeafSize,
}

/// Walker over the tables below one root.
///
/// The walker borrows nothing but the mapper; all state lives in the tables
/// themselves, so any number of walkers may operate on the same root.
pub struct TableWalker<'m, M: PhysMapper> {
    mapper: &'m M,
    root: PhysicalPage<Size4K>,
}

impl<'m, M: PhysMapper> TableWalker<'m, M> {
    /// # Safety
    /// `root` must be a frame holding a (possibly empty) PML4 reachable
    /// through `mapper`, and must stay allocated while the walker is used.
    #[inline]
    #[must_use]
    pub const unsafe fn new(mapper: &'m M, root: PhysicalPage<Size4K>) -> Self {
        Self { mapper, root }
    }

    #[inline]
    #[must_use]
    pub const fn root(&self) -> PhysicalPage<Size4K> {
        self.root
    }

    #[inline]
    fn table(&self, frame: PhysicalPage<Size4K>) -> &'m PageTable {
        // Safety: every frame reached from the root holds a table.
        unsafe { self.mapper.table(frame) }
    }

    /// Map `va` to `pa` with a leaf of `size`.
    ///
    /// Both addresses are aligned down to `size`. Missing tables are
    /// allocated from `alloc`; on [`MapError::OutOfMemory`] tables created so
    /// far stay installed (empty) and the leaf is not written.
    ///
    /// A user-accessible leaf (`US` in `attributes`) also sets `US` on every
    /// table entry above it.
    ///
    /// # Panics
    /// If the root or the (aligned) virtual address is null.
    pub fn map<A, U>(
        &self,
        alloc: &mut A,
        mmu: &U,
        va: VirtualAddress,
        pa: PhysicalAddress,
        attributes: PageEntryBits,
        size: LeafSize,
    ) -> Result<(), MapError>
    where
        A: FrameAlloc + ?Sized,
        U: Mmu + ?Sized,
    {
        assert!(!self.root.base().is_null(), "page-table root is null");
        let va = size.align_va(va);
        let pa = size.align_pa(pa);
        assert!(!va.is_null(), "attempt to map the null page");

        let user = attributes.user_access();
        let mut table = self.table(self.root);
        let mut level = TableLevel::Pml4;
        while level != size.level() {
            let Some(child) = level.next() else {
                break;
            };
            table = self.descend(alloc, table, level, child, va, user)?;
            level = child;
        }

        let idx = level.index_of(va);
        let leaf = PageEntryBits::leaf(pa, attributes.attributes(), size == LeafSize::Huge2M);
        if let Err(existing) = table.compare_install(idx, PageEntryBits::new(), leaf) {
            return Err(if size == LeafSize::Huge2M && !existing.large_page() {
                MapError::HugePageConflict { va }
            } else {
                MapError::AlreadyMapped { va }
            });
        }

        mmu.invalidate_page(va);
        trace!("map {va:?} -> {pa:?} ({size:?}, {:#x})", leaf.into_bits());
        Ok(())
    }

    /// Follow (or create) the entry for `va` in `table` at `level`.
    fn descend<A>(
        &self,
        alloc: &mut A,
        table: &'m PageTable,
        level: TableLevel,
        child: TableLevel,
        va: VirtualAddress,
        user: bool,
    ) -> Result<&'m PageTable, MapError>
    where
        A: FrameAlloc + ?Sized,
    {
        let idx = level.index_of(va);
        let entry = loop {
            let current = table.load(idx);
            if current.present() {
                break current;
            }

            let frame = alloc
                .alloc_4k()
                .ok_or(MapError::OutOfMemory { level: child })?;
            // Safety: freshly allocated, not yet linked.
            unsafe { self.mapper.zero_frame(frame) };

            let candidate = PageEntryBits::table_pointer(frame, user);
            match table.compare_install(idx, current, candidate) {
                Ok(()) => {
                    trace!("new {child} table {frame:?} under {level}[{}]", idx.as_usize());
                    break candidate;
                }
                Err(_) => alloc.free_4k(frame),
            }
        };

        if entry.large_page() {
            return Err(MapError::HugePageConflict { va });
        }
        if user && !entry.user_access() {
            table.set_bits(idx, PageEntryBits::new().with_user_access(true));
        }
        Ok(self.table(entry.table_frame()))
    }

    /// Clear every leaf intersecting `[va, va + len)`.
    ///
    /// The range is widened to whole 4 KiB pages. A 2 MiB leaf touched by the
    /// range is removed as a whole. Absent subtrees are skipped, and tables
    /// are left in place even when they become empty.
    pub fn unmap_range<U>(&self, mmu: &U, va: VirtualAddress, len: u64) -> Vec<UnmappedLeaf>
    where
        U: Mmu + ?Sized,
    {
        let mut cleared = Vec::new();
        let start = va.align_down::<Size4K>().as_u64();
        let end = va
            .as_u64()
            .checked_add(len)
            .and_then(|e| kernel_memory_addresses::align_up(e, Size4K::SIZE))
            .unwrap_or(u64::MAX);

        let mut cursor = start;
        'range: while cursor < end {
            let here = VirtualAddress::new(cursor);
            let mut table = self.table(self.root);
            let mut level = TableLevel::Pml4;
            loop {
                let idx = level.index_of(here);
                let entry = table.load(idx);
                let span = level.entry_span();
                let slot_base = cursor & !(span - 1);

                let is_leaf = level == TableLevel::Pt
                    || (level == TableLevel::Pd && entry.large_page());
                if entry.present() && is_leaf {
                    let taken = table.take(idx);
                    let leaf_va = VirtualAddress::new(slot_base);
                    mmu.invalidate_page(leaf_va);
                    let size = if level == TableLevel::Pt {
                        LeafSize::Page4K
                    } else {
                        LeafSize::Huge2M
                    };
                    trace!("unmap {leaf_va:?} ({size:?})");
                    cleared.push(UnmappedLeaf {
                        va: leaf_va,
                        pa: taken.physical_address(),
                        size,
                    });
                }

                match (entry.present() && !is_leaf, level.next()) {
                    (true, Some(child)) => {
                        table = self.table(entry.table_frame());
                        level = child;
                    }
                    _ => {
                        match slot_base.checked_add(span) {
                            Some(next) => cursor = next,
                            None => break 'range,
                        }
                        continue 'range;
                    }
                }
            }
        }
        cleared
    }

    /// Resolve `va` through the tables.
    #[must_use]
    pub fn translate(&self, va: VirtualAddress) -> Option<Translation> {
        let mut table = self.table(self.root);
        let mut level = TableLevel::Pml4;
        loop {
            let entry = table.load(level.index_of(va));
            if !entry.present() {
                return None;
            }

            let size = match level {
                TableLevel::Pt => Some(LeafSize::Page4K),
                TableLevel::Pd if entry.large_page() => Some(LeafSize::Huge2M),
                _ => None,
            };
            if let Some(size) = size {
                let offset = va.as_u64() & (size.bytes() - 1);
                return Some(Translation {
                    pa: PhysicalAddress::new(entry.physical_address().as_u64() | offset),
                    entry,
                    size,
                });
            }

            table = self.table(entry.table_frame());
            level = level.next()?;
        }
    }

    /// Raw root entry at slot `i`.
    #[inline]
    #[must_use]
    pub fn root_entry(&self, i: TableIndex) -> PageEntryBits {
        self.table(self.root).load(i)
    }

    /// Overwrite root slot `i`.
    ///
    /// Used to link the shared kernel-half tables into a fresh root.
    #[inline]
    pub fn install_root_entry(&self, i: TableIndex, entry: PageEntryBits) {
        self.table(self.root).store(i, entry);
    }

    /// Free every table below the root slots in `slots`, bottom-up, and clear
    /// those slots. Leaf frames are not touched; the owner of the mapping
    /// releases them.
    ///
    /// Returns the number of table frames freed.
    ///
    /// # Panics
    /// If `slots` reaches beyond the 512 root entries.
    pub fn release_tables<A>(&self, alloc: &mut A, slots: Range<usize>) -> usize
    where
        A: FrameAlloc + ?Sized,
    {
        assert!(slots.end <= ENTRIES, "root slot range out of bounds");
        let root = self.table(self.root);
        let mut freed = 0;
        for slot in slots {
            #[allow(clippy::cast_possible_truncation)]
            let entry = root.take(TableIndex::new(slot as u16));
            if entry.present() {
                freed += self.free_subtree(alloc, entry.table_frame(), TableLevel::Pdpt);
            }
        }
        freed
    }

    fn free_subtree<A>(&self, alloc: &mut A, frame: PhysicalPage<Size4K>, level: TableLevel) -> usize
    where
        A: FrameAlloc + ?Sized,
    {
        let mut freed = 0;
        if let Some(child) = level.next() {
            for (_, entry) in self.table(frame).present_entries() {
                if !entry.large_page() {
                    freed += self.free_subtree(alloc, entry.table_frame(), child);
                }
            }
        }
        alloc.free_4k(frame);
        freed + 1
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use core::cell::RefCell;

    /// Hands out frames `[next, end)` in ascending order and reuses freed ones.
    struct BumpAlloc {
        next: u64,
        end: u64,
        freed: Vec<PhysicalPage<Size4K>>,
    }

    impl BumpAlloc {
        fn new(start_frame: u64, end_frame: u64) -> Self {
            Self {
                next: start_frame,
                end: end_frame,
                freed: Vec::new(),
            }
        }
    }

    impl FrameAlloc for BumpAlloc {
        fn alloc_4k(&mut self) -> Option<PhysicalPage<Size4K>> {
            if let Some(f) = self.freed.pop() {
                return Some(f);
            }
            if self.next >= self.end {
                return None;
            }
            let f = PhysicalPage::frame(self.next);
            self.next += 1;
            Some(f)
        }

        fn free_4k(&mut self, frame: PhysicalPage<Size4K>) {
            self.freed.push(frame);
        }
    }

    #[repr(align(4096))]
    struct Aligned4K([u8; 4096]);

    /// Simulated RAM: physical address `pa` lives at byte `pa` of `frames`.
    struct TestPhys {
        frames: Vec<Aligned4K>,
    }

    impl TestPhys {
        fn with_frames(n: usize) -> Self {
            let mut frames = Vec::with_capacity(n);
            for _ in 0..n {
                frames.push(Aligned4K([0; 4096]));
            }
            Self { frames }
        }
    }

    unsafe impl PhysMapper for TestPhys {
        fn phys_to_ptr(&self, pa: PhysicalAddress) -> *mut u8 {
            let idx = usize::try_from(pa.as_u64() >> 12).unwrap();
            let off = usize::try_from(pa.as_u64() & 0xfff).unwrap();
            assert!(idx < self.frames.len(), "{pa:?} outside test RAM");
            unsafe { self.frames.as_ptr().add(idx).cast::<u8>().cast_mut().add(off) }
        }
    }

    #[derive(Default)]
    struct RecordingMmu {
        invalidated: RefCell<Vec<VirtualAddress>>,
    }

    impl Mmu for RecordingMmu {
        fn invalidate_page(&self, va: VirtualAddress) {
            self.invalidated.borrow_mut().push(va);
        }
        fn load_root(&self, _root: PhysicalPage<Size4K>) {}
        fn enable_global_pages(&self) {}
    }

    fn setup(frames: usize) -> (TestPhys, BumpAlloc, PhysicalPage<Size4K>) {
        let phys = TestPhys::with_frames(frames);
        let mut alloc = BumpAlloc::new(1, frames as u64);
        let root = alloc.alloc_4k().unwrap();
        (phys, alloc, root)
    }

    #[test]
    fn map_4k_builds_three_tables_and_a_leaf() {
        let (phys, mut alloc, root) = setup(64);
        let mmu = RecordingMmu::default();
        let w = unsafe { TableWalker::new(&phys, root) };

        let va = VirtualAddress::new(0xffff_8000_0000_0000);
        let pa = PhysicalAddress::new(0x30_0000);
        w.map(&mut alloc, &mmu, va, pa, PageEntryBits::kernel_data(), LeafSize::Page4K)
            .unwrap();

        assert_eq!(alloc.next, 5, "root plus PDPT, PD and PT");
        let t = w.translate(va + 0x123).unwrap();
        assert_eq!(t.pa, PhysicalAddress::new(0x30_0123));
        assert_eq!(t.size, LeafSize::Page4K);
        assert!(t.entry.writable() && t.entry.global_translation() && t.entry.no_execute());
        assert!(!t.entry.large_page());
        assert_eq!(*mmu.invalidated.borrow(), vec![va]);
    }

    #[test]
    fn map_aligns_both_addresses() {
        let (phys, mut alloc, root) = setup(64);
        let w = unsafe { TableWalker::new(&phys, root) };
        w.map(
            &mut alloc,
            &RecordingMmu::default(),
            VirtualAddress::new(0x40_0abc),
            PhysicalAddress::new(0x7_0def),
            PageEntryBits::kernel_data(),
            LeafSize::Page4K,
        )
        .unwrap();
        let t = w.translate(VirtualAddress::new(0x40_0000)).unwrap();
        assert_eq!(t.pa, PhysicalAddress::new(0x7_0000));
    }

    #[test]
    fn map_2m_sets_page_size_and_skips_pt() {
        let (phys, mut alloc, root) = setup(64);
        let w = unsafe { TableWalker::new(&phys, root) };
        let va = VirtualAddress::new(0xffff_8880_0020_0000);
        let pa = PhysicalAddress::new(0x40_0000);
        w.map(&mut alloc, &RecordingMmu::default(), va, pa, PageEntryBits::kernel_data(), LeafSize::Huge2M)
            .unwrap();

        assert_eq!(alloc.next, 4, "root plus PDPT and PD");
        let t = w.translate(va + 0x1_2345).unwrap();
        assert_eq!(t.size, LeafSize::Huge2M);
        assert!(t.entry.large_page());
        assert_eq!(t.pa, PhysicalAddress::new(0x41_2345));
    }

    #[test]
    fn user_leaf_propagates_us_to_existing_tables() {
        let (phys, mut alloc, root) = setup(64);
        let mmu = RecordingMmu::default();
        let w = unsafe { TableWalker::new(&phys, root) };

        let kernel_only = PageEntryBits::new().with_writable(true);
        let user = kernel_only.with_user_access(true);
        w.map(&mut alloc, &mmu, VirtualAddress::new(0x40_0000), PhysicalAddress::new(0x8000), kernel_only, LeafSize::Page4K)
            .unwrap();
        assert!(!w.root_entry(TableIndex::new(0)).user_access());

        w.map(&mut alloc, &mmu, VirtualAddress::new(0x40_1000), PhysicalAddress::new(0x9000), user, LeafSize::Page4K)
            .unwrap();
        assert!(w.root_entry(TableIndex::new(0)).user_access());
        assert!(w.translate(VirtualAddress::new(0x40_1000)).unwrap().entry.user_access());
        assert!(!w.translate(VirtualAddress::new(0x40_0000)).unwrap().entry.user_access());
    }

    #[test]
    fn second_map_of_same_page_is_rejected() {
        let (phys, mut alloc, root) = setup(64);
        let mmu = RecordingMmu::default();
        let w = unsafe { TableWalker::new(&phys, root) };
        let va = VirtualAddress::new(0x40_0000);

        w.map(&mut alloc, &mmu, va, PhysicalAddress::new(0x8000), PageEntryBits::kernel_data(), LeafSize::Page4K)
            .unwrap();
        assert_eq!(
            w.map(&mut alloc, &mmu, va, PhysicalAddress::new(0x9000), PageEntryBits::kernel_data(), LeafSize::Page4K),
            Err(MapError::AlreadyMapped { va })
        );
        assert_eq!(w.translate(va).unwrap().pa, PhysicalAddress::new(0x8000));
    }

    #[test]
    fn mixing_page_sizes_is_a_conflict() {
        let (phys, mut alloc, root) = setup(64);
        let mmu = RecordingMmu::default();
        let w = unsafe { TableWalker::new(&phys, root) };
        let huge = VirtualAddress::new(0x20_0000);

        w.map(&mut alloc, &mmu, huge, PhysicalAddress::new(0x20_0000), PageEntryBits::kernel_data(), LeafSize::Huge2M)
            .unwrap();
        let inside = VirtualAddress::new(0x20_3000);
        assert_eq!(
            w.map(&mut alloc, &mmu, inside, PhysicalAddress::new(0x8000), PageEntryBits::kernel_data(), LeafSize::Page4K),
            Err(MapError::HugePageConflict { va: inside })
        );

        let small = VirtualAddress::new(0x60_1000);
        w.map(&mut alloc, &mmu, small, PhysicalAddress::new(0x8000), PageEntryBits::kernel_data(), LeafSize::Page4K)
            .unwrap();
        let over = VirtualAddress::new(0x60_0000);
        assert_eq!(
            w.map(&mut alloc, &mmu, over, PhysicalAddress::new(0x40_0000), PageEntryBits::kernel_data(), LeafSize::Huge2M),
            Err(MapError::HugePageConflict { va: over })
        );
    }

    #[test]
    fn out_of_memory_names_the_missing_level() {
        let phys = TestPhys::with_frames(8);
        let mut alloc = BumpAlloc::new(1, 3);
        let root = alloc.alloc_4k().unwrap();
        let w = unsafe { TableWalker::new(&phys, root) };

        let va = VirtualAddress::new(0x40_0000);
        assert_eq!(
            w.map(&mut alloc, &RecordingMmu::default(), va, PhysicalAddress::new(0x8000), PageEntryBits::kernel_data(), LeafSize::Page4K),
            Err(MapError::OutOfMemory { level: TableLevel::Pd })
        );
        assert!(w.root_entry(TableIndex::new(0)).present());
        assert!(w.translate(va).is_none());
    }

    #[test]
    #[should_panic(expected = "null page")]
    fn null_virtual_address_panics() {
        let (phys, mut alloc, root) = setup(8);
        let w = unsafe { TableWalker::new(&phys, root) };
        let _ = w.map(
            &mut alloc,
            &RecordingMmu::default(),
            VirtualAddress::new(0x0fff),
            PhysicalAddress::new(0x8000),
            PageEntryBits::kernel_data(),
            LeafSize::Page4K,
        );
    }

    #[test]
    #[should_panic(expected = "root is null")]
    fn null_root_panics() {
        let phys = TestPhys::with_frames(8);
        let mut alloc = BumpAlloc::new(1, 8);
        let w = unsafe { TableWalker::new(&phys, PhysicalPage::frame(0)) };
        let _ = w.map(
            &mut alloc,
            &RecordingMmu::default(),
            VirtualAddress::new(0x40_0000),
            PhysicalAddress::new(0x8000),
            PageEntryBits::kernel_data(),
            LeafSize::Page4K,
        );
    }

    #[test]
    fn unmap_range_clears_leaves_and_invalidates_each() {
        let (phys, mut alloc, root) = setup(64);
        let mmu = RecordingMmu::default();
        let w = unsafe { TableWalker::new(&phys, root) };
        let base = VirtualAddress::new(0x40_0000);

        for i in 0..3 {
            w.map(&mut alloc, &mmu, base + i * 0x1000, PhysicalAddress::new(0x1_0000 + i * 0x1000), PageEntryBits::kernel_data(), LeafSize::Page4K)
                .unwrap();
        }
        w.map(&mut alloc, &mmu, base + 0x8000, PhysicalAddress::new(0x2_0000), PageEntryBits::kernel_data(), LeafSize::Page4K)
            .unwrap();
        mmu.invalidated.borrow_mut().clear();

        let cleared = w.unmap_range(&mmu, base + 0x1000, 0x2000);
        assert_eq!(
            cleared,
            vec![
                UnmappedLeaf { va: base + 0x1000, pa: PhysicalAddress::new(0x1_1000), size: LeafSize::Page4K },
                UnmappedLeaf { va: base + 0x2000, pa: PhysicalAddress::new(0x1_2000), size: LeafSize::Page4K },
            ]
        );
        assert_eq!(*mmu.invalidated.borrow(), vec![base + 0x1000, base + 0x2000]);
        assert!(w.translate(base).is_some());
        assert!(w.translate(base + 0x1000).is_none());
        assert!(w.translate(base + 0x8000).is_some());
    }

    #[test]
    fn unmap_range_skips_absent_subtrees_and_removes_huge_leaves() {
        let (phys, mut alloc, root) = setup(64);
        let mmu = RecordingMmu::default();
        let w = unsafe { TableWalker::new(&phys, root) };

        let huge = VirtualAddress::new(0x4000_0000);
        w.map(&mut alloc, &mmu, huge, PhysicalAddress::new(0x20_0000), PageEntryBits::kernel_data(), LeafSize::Huge2M)
            .unwrap();

        let cleared = w.unmap_range(&mmu, VirtualAddress::new(0x40_0000), 0x4000_0000 + 0x1000);
        assert_eq!(cleared.len(), 1);
        assert_eq!(cleared[0].va, huge);
        assert_eq!(cleared[0].size, LeafSize::Huge2M);
        assert!(w.translate(huge).is_none());
    }

    #[test]
    fn racing_install_frees_the_losing_table() {
        // Another CPU's PDPT appears in slot 0 between our load and install.
        struct Racer<'a> {
            inner: &'a mut BumpAlloc,
            phys: &'a TestPhys,
            root: PhysicalPage<Size4K>,
            raced: bool,
        }
        impl FrameAlloc for Racer<'_> {
            fn alloc_4k(&mut self) -> Option<PhysicalPage<Size4K>> {
                let f = self.inner.alloc_4k()?;
                if !self.raced {
                    self.raced = true;
                    let winner = self.inner.alloc_4k()?;
                    let table = unsafe { self.phys.table(self.root) };
                    table.store(TableIndex::new(0), PageEntryBits::table_pointer(winner, false));
                }
                Some(f)
            }
            fn free_4k(&mut self, frame: PhysicalPage<Size4K>) {
                self.inner.free_4k(frame);
            }
        }

        let (phys, mut alloc, root) = setup(64);
        let mmu = RecordingMmu::default();
        let w = unsafe { TableWalker::new(&phys, root) };

        let mut racer = Racer { inner: &mut alloc, phys: &phys, root, raced: false };
        w.map(&mut racer, &mmu, VirtualAddress::new(0x40_0000), PhysicalAddress::new(0x8000), PageEntryBits::kernel_data(), LeafSize::Page4K)
            .unwrap();

        let winner = w.root_entry(TableIndex::new(0)).table_frame();
        assert_eq!(winner, PhysicalPage::frame(3));
        assert!(alloc.freed.is_empty(), "loser frame was reused for the PD");
        assert!(w.translate(VirtualAddress::new(0x40_0000)).is_some());
    }

    #[test]
    fn release_tables_frees_every_table_below_the_slots() {
        let (phys, mut alloc, root) = setup(64);
        let mmu = RecordingMmu::default();
        let w = unsafe { TableWalker::new(&phys, root) };

        w.map(&mut alloc, &mmu, VirtualAddress::new(0x40_0000), PhysicalAddress::new(0x8000), PageEntryBits::kernel_data(), LeafSize::Page4K)
            .unwrap();
        w.map(&mut alloc, &mmu, VirtualAddress::new(0x8000_0000), PhysicalAddress::new(0x20_0000), PageEntryBits::kernel_data(), LeafSize::Huge2M)
            .unwrap();
        w.map(&mut alloc, &mmu, VirtualAddress::new(0xffff_8000_0000_0000), PhysicalAddress::new(0x9000), PageEntryBits::kernel_data(), LeafSize::Page4K)
            .unwrap();

        // PDPT, 2 PDs and one PT in the user half.
        assert_eq!(w.release_tables(&mut alloc, 0..256), 4);
        assert_eq!(alloc.freed.len(), 4);
        assert!(!w.root_entry(TableIndex::new(0)).present());
        assert!(w.root_entry(TableIndex::new(256)).present());
        assert!(w.translate(VirtualAddress::new(0xffff_8000_0000_0000)).is_some());
    }
}
