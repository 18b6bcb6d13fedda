//! # Address Spaces
//!
//! An [`AddressSpace`] is a page-table root plus the list of areas reserved
//! in it. Spaces are handed out as `Arc<AddressSpace>`: the creator holds one
//! handle and every [`ExecutionUnit`] running in the space holds another, so
//! a space cannot be torn down while anything still runs on it.
//!
//! The root frame is immutable for the life of the space. Only the area list
//! changes, under its own lock.

use crate::area::VmArea;
use crate::area_list::AreaList;
use alloc::sync::Arc;
use core::fmt;
use kernel_memory_addresses::{PhysicalPage, Size4K, VirtualAddress};
use kernel_sync::{IrqSpinLockGuard, SpinLock};

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum SpaceKind {
    /// The single kernel space; allocates from the kernel window.
    Kernel,
    /// A process space; allocates from the user window.
    User,
}

pub struct AddressSpace {
    kind: SpaceKind,
    root: PhysicalPage<Size4K>,
    areas: SpinLock<AreaList>,
}

impl AddressSpace {
    pub(crate) const fn new(kind: SpaceKind, root: PhysicalPage<Size4K>) -> Self {
        Self {
            kind,
            root,
            areas: SpinLock::new(AreaList::new()),
        }
    }

    #[must_use]
    pub const fn kind(&self) -> SpaceKind {
        self.kind
    }

    #[must_use]
    pub const fn is_kernel(&self) -> bool {
        matches!(self.kind, SpaceKind::Kernel)
    }

    /// Physical frame of the PML4.
    #[must_use]
    pub const fn root(&self) -> PhysicalPage<Size4K> {
        self.root
    }

    /// The area containing `va`, if any.
    #[must_use]
    pub fn area_at(&self, va: VirtualAddress) -> Option<VmArea> {
        self.areas.lock_irq().find(va).copied()
    }

    /// Run `f` over a snapshot of the area list.
    ///
    /// The list is copied under the lock and `f` runs after it is released,
    /// so `f` may fault on this space or call back into it.
    pub fn with_areas<R>(&self, f: impl FnOnce(&AreaList) -> R) -> R {
        let snapshot = self.areas.lock_irq().clone();
        f(&snapshot)
    }

    /// Locks the area list with interrupts off. Taken before the frame pool.
    pub(crate) fn lock_areas(&self) -> IrqSpinLockGuard<'_, AreaList> {
        self.areas.lock_irq()
    }

    pub(crate) fn into_areas(self) -> AreaList {
        self.areas.into_inner()
    }
}

impl fmt::Debug for AddressSpace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AddressSpace")
            .field("kind", &self.kind)
            .field("root", &self.root)
            .finish_non_exhaustive()
    }
}

/// Per-CPU record of the address space currently loaded.
///
/// Owned by its CPU; only [`MemoryManager::switch`](crate::MemoryManager::switch)
/// changes it, which keeps the loaded root and the recorded space in step.
#[derive(Debug, Default)]
pub struct ExecutionUnit {
    current: Option<Arc<AddressSpace>>,
}

impl ExecutionUnit {
    #[must_use]
    pub const fn new() -> Self {
        Self { current: None }
    }

    #[must_use]
    pub const fn current(&self) -> Option<&Arc<AddressSpace>> {
        self.current.as_ref()
    }

    pub(crate) fn replace(&mut self, space: Arc<AddressSpace>) -> Option<Arc<AddressSpace>> {
        self.current.replace(space)
    }
}
