//! # Memory Manager
//!
//! [`MemoryManager`] ties the frame pool, the physical mapper and the MMU
//! together and owns the kernel address space. Every address-space
//! operation goes through it.
//!
//! ## Kernel half
//!
//! When the kernel space is built, each of its root slots `256..512` gets a
//! PDPT, empty or not. A new user root copies those 256 entries and takes a
//! share of each PDPT in the frame pool. Kernel mappings made later land
//! below one of the shared PDPTs and are therefore visible through every
//! root without touching any of them.
//!
//! ```text
//!  kernel root ─┐
//!  user root A ─┼──► PDPT[256] … PDPT[511] ──► PD ──► PT
//!  user root B ─┘    (owners = 1 + number of user roots)
//! ```
//!
//! ## Lock order
//!
//! Area list, then frame pool. The walker takes the pool lock once per table
//! frame and never holds it across a descent.

use crate::address_space::{AddressSpace, ExecutionUnit, SpaceKind};
use crate::area::{VmArea, VmFlags};
use crate::error::VmmError;
use alloc::sync::Arc;
use core::ops::Range;
use kernel_alloc::FramePool;
use kernel_info::boot::KernelImage;
use kernel_info::memory::{KERNEL_ROOT_SLOT_START, MemoryLayout};
use kernel_memory_addresses::{
    PageSize, PhysicalAddress, PhysicalPage, Size2M, Size4K, VirtualAddress, align_up, pages_for,
};
use kernel_vmem::page_table::ENTRIES;
use kernel_vmem::{LeafSize, Mmu, PageEntryBits, PhysMapper, TableIndex, TableWalker, Translation};
use log::{debug, info, trace, warn};

/// Root slots shared by every address space.
const KERNEL_SLOTS: Range<usize> = KERNEL_ROOT_SLOT_START..ENTRIES;

#[allow(clippy::cast_possible_truncation)]
const fn root_index(slot: usize) -> TableIndex {
    TableIndex::new(slot as u16)
}

pub struct MemoryManager<M: PhysMapper, U: Mmu> {
    frames: FramePool,
    mapper: M,
    mmu: U,
    layout: MemoryLayout,
    kernel: Arc<AddressSpace>,
}

impl<M: PhysMapper, U: Mmu> MemoryManager<M, U> {
    /// Build the kernel address space and load it.
    ///
    /// In order:
    /// 1. a zeroed root frame,
    /// 2. the kernel image, 4 KiB pages `RW | G`,
    /// 3. every tracked physical frame at `direct_map`, 2 MiB pages `RW | G | NX`,
    /// 4. an empty PDPT in each kernel-half root slot still vacant,
    /// 5. `CR4.PGE`, then `CR3`.
    ///
    /// # Errors
    /// [`VmmError::OutOfMemory`] or [`VmmError::Map`]. Frames taken before
    /// the failure are not returned; the kernel cannot continue without this
    /// space.
    pub fn create_kernel_space(
        frames: FramePool,
        mapper: M,
        mmu: U,
        layout: MemoryLayout,
        image: &KernelImage,
        direct_map: VirtualAddress,
    ) -> Result<Self, VmmError> {
        let root = frames
            .alloc_zeroed_4k(&mapper)
            .ok_or(VmmError::OutOfMemory)?;
        // Safety: a zeroed frame is an empty PML4, owned by the space being built.
        let walker = unsafe { TableWalker::new(&mapper, root) };
        let mut alloc = &frames;

        for page in 0..pages_for::<Size4K>(image.len) {
            let offset = page * Size4K::SIZE;
            walker.map(
                &mut alloc,
                &mmu,
                VirtualAddress::new(image.virt_base + offset),
                PhysicalAddress::new(image.phys_base + offset),
                PageEntryBits::kernel_image(),
                LeafSize::Page4K,
            )?;
        }

        let phys_end = frames.highest_address().as_u64();
        for chunk in 0..pages_for::<Size2M>(phys_end) {
            let offset = chunk * Size2M::SIZE;
            walker.map(
                &mut alloc,
                &mmu,
                direct_map + offset,
                PhysicalAddress::new(offset),
                PageEntryBits::kernel_data(),
                LeafSize::Huge2M,
            )?;
        }

        for slot in KERNEL_SLOTS {
            let idx = root_index(slot);
            if walker.root_entry(idx).present() {
                continue;
            }
            let pdpt = frames
                .alloc_zeroed_4k(&mapper)
                .ok_or(VmmError::OutOfMemory)?;
            walker.install_root_entry(idx, PageEntryBits::table_pointer(pdpt, false));
        }

        mmu.enable_global_pages();
        mmu.load_root(root);
        info!(
            "kernel space active: root {root:?}, image {:#x} bytes at {:#x}, direct map of {phys_end:#x} bytes at {direct_map:?}",
            image.len, image.virt_base
        );

        Ok(Self {
            frames,
            mapper,
            mmu,
            layout,
            kernel: Arc::new(AddressSpace::new(SpaceKind::Kernel, root)),
        })
    }

    /// A fresh user space: empty user half, kernel half shared with the
    /// kernel space.
    ///
    /// # Errors
    /// [`VmmError::OutOfMemory`] if no frame is left for the root.
    pub fn create_address_space(&self) -> Result<Arc<AddressSpace>, VmmError> {
        let root = self
            .frames
            .alloc_zeroed_4k(&self.mapper)
            .ok_or(VmmError::OutOfMemory)?;
        let kernel = self.walker(&self.kernel);
        // Safety: zeroed frame owned by the space being built.
        let user = unsafe { TableWalker::new(&self.mapper, root) };

        for slot in KERNEL_SLOTS {
            let idx = root_index(slot);
            let entry = kernel.root_entry(idx);
            if entry.present() {
                self.frames.share(entry.table_frame());
                user.install_root_entry(idx, entry);
            }
        }

        debug!("created address space with root {root:?}");
        Ok(Arc::new(AddressSpace::new(SpaceKind::User, root)))
    }

    /// Reserve `size` bytes (rounded up to whole pages) at the lowest free
    /// address of the space's window.
    ///
    /// Ordinary areas get no pages here; they are populated by the fault
    /// handler on first touch. An MMIO area is mapped right away onto
    /// `backing`, which is required for it and ignored otherwise.
    ///
    /// # Errors
    /// - [`VmmError::ZeroSize`] for `size == 0`.
    /// - [`VmmError::MissingBacking`] for MMIO without `backing`.
    /// - [`VmmError::UserAreaInKernelSpace`] for `user` flags in the kernel
    ///   space. Its tables are shared with user spaces created earlier, whose
    ///   root entries would lack `US`.
    /// - [`VmmError::AddressSpaceExhausted`] if no gap fits.
    /// - [`VmmError::Map`] if eager MMIO mapping fails; the area is dropped again.
    pub fn allocate(
        &self,
        space: &AddressSpace,
        size: u64,
        flags: VmFlags,
        backing: Option<PhysicalAddress>,
    ) -> Result<VirtualAddress, VmmError> {
        if size == 0 {
            return Err(VmmError::ZeroSize);
        }
        if flags.user() && space.kind() == SpaceKind::Kernel {
            return Err(VmmError::UserAreaInKernelSpace);
        }
        let size = align_up(size, Size4K::SIZE).ok_or(VmmError::AddressSpaceExhausted { size })?;
        let backing = if flags.mmio() {
            Some(backing.ok_or(VmmError::MissingBacking)?.align_down::<Size4K>())
        } else {
            None
        };

        let mut areas = space.lock_areas();
        let base = areas
            .find_gap(size, self.window(space.kind()))
            .ok_or(VmmError::AddressSpaceExhausted { size })?;
        let area = VmArea::new(base, size, flags, backing);
        areas
            .insert(area)
            .map_err(|_| VmmError::AddressSpaceExhausted { size })?;

        if let Some(phys) = backing
            && let Err(e) = self.map_mmio(space, &area, phys)
        {
            areas.remove_at_base(base);
            return Err(e);
        }

        debug!(
            "allocated {size:#x} bytes at {base:?} in {:?} space ({flags:?})",
            space.kind()
        );
        Ok(base)
    }

    fn map_mmio(&self, space: &AddressSpace, area: &VmArea, phys: PhysicalAddress) -> Result<(), VmmError> {
        let walker = self.walker(space);
        let attributes = area.page_entry_bits();
        let mut offset = 0;
        while offset < area.size() {
            let mapped = walker.map(
                &mut &self.frames,
                &self.mmu,
                area.base() + offset,
                phys + offset,
                attributes,
                LeafSize::Page4K,
            );
            if let Err(e) = mapped {
                self.unmap_pages(&walker, area.base(), offset, false);
                return Err(e.into());
            }
            offset += Size4K::SIZE;
        }
        Ok(())
    }

    /// The area of `space` containing `va`.
    #[must_use]
    pub fn find_area(&self, space: &AddressSpace, va: VirtualAddress) -> Option<VmArea> {
        space.area_at(va)
    }

    /// Release the area starting at `base`: unmap its pages and return
    /// demand-allocated frames to the pool. MMIO frames are not freed.
    ///
    /// # Errors
    /// [`VmmError::NotAreaBase`] if no area starts at `base`.
    pub fn free(&self, space: &AddressSpace, base: VirtualAddress) -> Result<(), VmmError> {
        let mut areas = space.lock_areas();
        let area = areas
            .remove_at_base(base)
            .ok_or(VmmError::NotAreaBase(base))?;
        let pages = self.release_area(&self.walker(space), &area);
        drop(areas);

        debug!("freed {:#x} bytes at {base:?} ({pages} pages mapped)", area.size());
        Ok(())
    }

    /// Unmap `area`, returning the number of leaves removed.
    fn release_area(&self, walker: &TableWalker<'_, M>, area: &VmArea) -> usize {
        self.unmap_pages(walker, area.base(), area.size(), !area.flags().mmio())
    }

    /// Unmap `[base, base + len)`; with `owns_frames` the leaf frames go back
    /// to the pool.
    fn unmap_pages(&self, walker: &TableWalker<'_, M>, base: VirtualAddress, len: u64, owns_frames: bool) -> usize {
        let leaves = walker.unmap_range(&self.mmu, base, len);
        if owns_frames {
            for leaf in &leaves {
                if let Err(e) = self.frames.free(leaf.pa, leaf.size.bytes()) {
                    warn!("releasing {:?} mapped at {:?}: {e}", leaf.pa, leaf.va);
                }
            }
        }
        leaves.len()
    }

    /// Tear down a user space: its areas, its user-half tables, its shares
    /// of the kernel PDPTs, and its root.
    ///
    /// `space` must be the last handle; the space is dropped either way.
    ///
    /// # Errors
    /// - [`VmmError::KernelSpaceImmortal`] for the kernel space.
    /// - [`VmmError::SpaceInUse`] while another handle exists, for example
    ///   an [`ExecutionUnit`] still running on it.
    /// - [`VmmError::Frame`] if the root frame was already free.
    pub fn destroy(&self, space: Arc<AddressSpace>) -> Result<(), VmmError> {
        if space.is_kernel() || Arc::ptr_eq(&space, &self.kernel) {
            return Err(VmmError::KernelSpaceImmortal);
        }
        let space = Arc::try_unwrap(space).map_err(|_| VmmError::SpaceInUse)?;
        let root = space.root();
        // Safety: the root stays allocated until the last line.
        let walker = unsafe { TableWalker::new(&self.mapper, root) };

        let mut pages = 0;
        for area in space.into_areas().take_all() {
            pages += self.release_area(&walker, &area);
        }
        let tables = walker.release_tables(&mut &self.frames, 0..KERNEL_ROOT_SLOT_START);

        for slot in KERNEL_SLOTS {
            let entry = walker.root_entry(root_index(slot));
            if entry.present() {
                self.release_frame(entry.table_frame());
            }
        }
        self.frames.release(root)?;

        debug!("destroyed address space {root:?}: {pages} pages, {tables} tables");
        Ok(())
    }

    /// Make `space` current on `unit`'s CPU. Returns the space it replaces.
    ///
    /// The root is only reloaded when it changes, so switching to the
    /// space already loaded keeps the TLB.
    pub fn switch(&self, unit: &mut ExecutionUnit, space: Arc<AddressSpace>) -> Option<Arc<AddressSpace>> {
        let reload = unit
            .current()
            .is_none_or(|current| current.root() != space.root());
        if reload {
            self.mmu.load_root(space.root());
            trace!("switched to {:?} space {:?}", space.kind(), space.root());
        }
        unit.replace(space)
    }

    /// Map the boot-time kernel heap above the image.
    ///
    /// The heap starts `kernel_heap_gap` bytes past the image end, page
    /// aligned, and spans `kernel_heap_size` bytes of zeroed frames mapped
    /// `RW | G | NX`.
    ///
    /// # Errors
    /// [`VmmError::OutOfMemory`] or [`VmmError::Map`]; pages mapped before the
    /// failure are unmapped and returned.
    pub fn map_kernel_heap(&self, image: &KernelImage) -> Result<Range<VirtualAddress>, VmmError> {
        let size = self.layout.kernel_heap_size;
        let start = image
            .virt_end()
            .checked_add(self.layout.kernel_heap_gap)
            .and_then(|va| align_up(va, Size4K::SIZE))
            .map(VirtualAddress::new)
            .ok_or(VmmError::AddressSpaceExhausted { size })?;

        let walker = self.walker(&self.kernel);
        let mut offset = 0;
        while offset < size {
            if let Err(e) = self.map_fresh_page(&walker, start + offset, PageEntryBits::kernel_data()) {
                let released = self.unmap_pages(&walker, start, offset, true);
                warn!("kernel heap mapping failed after {released} pages: {e}");
                return Err(e);
            }
            offset += Size4K::SIZE;
        }

        info!("kernel heap at {start:?}, {} KiB", size / 1024);
        Ok(start..start + size)
    }

    /// Back `va` with a new zeroed frame. The frame is released again if the
    /// mapping fails.
    pub(crate) fn map_fresh_page(
        &self,
        walker: &TableWalker<'_, M>,
        va: VirtualAddress,
        attributes: PageEntryBits,
    ) -> Result<(), VmmError> {
        let frame = self
            .frames
            .alloc_zeroed_4k(&self.mapper)
            .ok_or(VmmError::OutOfMemory)?;
        walker
            .map(
                &mut &self.frames,
                &self.mmu,
                va,
                frame.base(),
                attributes,
                LeafSize::Page4K,
            )
            .map_err(|e| {
                self.release_frame(frame);
                VmmError::Map(e)
            })
    }

    fn release_frame(&self, frame: PhysicalPage<Size4K>) {
        if let Err(e) = self.frames.release(frame) {
            warn!("releasing {frame:?}: {e}");
        }
    }

    /// Hardware translation of `va` in `space`.
    #[must_use]
    pub fn translate(&self, space: &AddressSpace, va: VirtualAddress) -> Option<Translation> {
        self.walker(space).translate(va)
    }

    pub(crate) fn walker(&self, space: &AddressSpace) -> TableWalker<'_, M> {
        // Safety: a live space's root is an allocated PML4 until `destroy`,
        // which needs the last handle.
        unsafe { TableWalker::new(&self.mapper, space.root()) }
    }

    fn window(&self, kind: SpaceKind) -> Range<VirtualAddress> {
        match kind {
            SpaceKind::Kernel => self.layout.kernel_area_start..self.layout.kernel_area_end,
            SpaceKind::User => self.layout.user_start..self.layout.user_end,
        }
    }

    #[must_use]
    pub const fn kernel_space(&self) -> &Arc<AddressSpace> {
        &self.kernel
    }

    #[must_use]
    pub const fn frames(&self) -> &FramePool {
        &self.frames
    }

    #[must_use]
    pub const fn mapper(&self) -> &M {
        &self.mapper
    }

    #[must_use]
    pub const fn mmu(&self) -> &U {
        &self.mmu
    }

    #[must_use]
    pub const fn layout(&self) -> &MemoryLayout {
        &self.layout
    }
}
