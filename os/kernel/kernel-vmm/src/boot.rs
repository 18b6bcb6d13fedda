//! # Boot-time Memory Bring-up
//!
//! One call takes the bootloader's memory map to a running kernel address
//! space with a mapped heap:
//!
//! 1. direct-map mapper from the HHDM offset,
//! 2. bitmap frame allocator over the memory map,
//! 3. kernel address space (image, direct map, shared kernel half),
//! 4. kernel heap,
//! 5. publication of the [`MemoryManager`] for the rest of the kernel.
//!
//! Everything before the last step is generic over the mapper and the MMU
//! and runs in host tests; only [`init_memory`] touches real hardware.

use crate::error::VmmError;
use crate::manager::MemoryManager;
use core::ops::Range;
use kernel_alloc::{BitmapFrameAlloc, FramePool, PhysInitError};
use kernel_info::boot::BootMemoryInfo;
use kernel_info::memory::MemoryLayout;
use kernel_memory_addresses::VirtualAddress;
use kernel_vmem::{Mmu, PhysMapper};
use log::info;

#[derive(Debug, Copy, Clone, PartialEq, Eq, thiserror::Error)]
pub enum BootError {
    #[error("physical allocator: {0}")]
    Phys(#[from] PhysInitError),
    #[error("kernel address space: {0}")]
    Vmm(#[from] VmmError),
    #[error("memory manager already initialized")]
    AlreadyInitialized,
}

/// A freshly built manager and the heap it mapped.
pub struct BootMemory<M: PhysMapper, U: Mmu> {
    pub manager: MemoryManager<M, U>,
    pub heap: Range<VirtualAddress>,
}

/// Steps 2 to 4 with the given mapper and MMU.
///
/// # Errors
/// Whatever step failed first.
///
/// # Safety
/// `boot.memory_map` must describe the machine's RAM, and every frame it
/// calls usable must be reachable through `mapper` and otherwise unused.
pub unsafe fn bring_up<M: PhysMapper, U: Mmu>(
    boot: BootMemoryInfo<'_>,
    mapper: M,
    mmu: U,
    layout: MemoryLayout,
) -> Result<BootMemory<M, U>, BootError> {
    // Safety: forwarded to the caller.
    let frames = unsafe { BitmapFrameAlloc::initialize(boot.memory_map, &mapper) }?;
    info!(
        "physical memory: {} of {} frames free",
        frames.free_frames(),
        frames.total_frames()
    );

    let manager = MemoryManager::create_kernel_space(
        FramePool::new(frames),
        mapper,
        mmu,
        layout,
        &boot.kernel,
        VirtualAddress::new(boot.hhdm_offset),
    )?;
    let heap = manager.map_kernel_heap(&boot.kernel)?;
    Ok(BootMemory { manager, heap })
}

#[cfg(target_arch = "x86_64")]
pub use self::hardware::*;

#[cfg(target_arch = "x86_64")]
mod hardware {
    use super::{BootError, bring_up};
    use crate::manager::MemoryManager;
    use core::ops::Range;
    use kernel_alloc::HhdmPhysMapper;
    use kernel_info::boot::BootMemoryInfo;
    use kernel_info::memory::MemoryLayout;
    use kernel_memory_addresses::VirtualAddress;
    use kernel_sync::SyncOnceCell;
    use kernel_vmem::X86Mmu;
    use log::{error, info};

    pub type KernelMemoryManager = MemoryManager<HhdmPhysMapper, X86Mmu>;

    static MEMORY: SyncOnceCell<KernelMemoryManager> = SyncOnceCell::new();

    /// Bring up memory management and publish the manager.
    ///
    /// Returns the manager and the kernel heap range for the heap allocator.
    ///
    /// # Errors
    /// See [`BootError`]. Calling it twice yields
    /// [`BootError::AlreadyInitialized`] before anything is touched.
    ///
    /// # Safety
    /// Ring 0, once, on the boot CPU, with `boot` taken from the bootloader.
    pub unsafe fn init_memory(
        boot: BootMemoryInfo<'_>,
        layout: MemoryLayout,
    ) -> Result<(&'static KernelMemoryManager, Range<VirtualAddress>), BootError> {
        if MEMORY.get().is_some() {
            return Err(BootError::AlreadyInitialized);
        }

        let mapper = HhdmPhysMapper::new(boot.hhdm_offset);
        // Safety: ring 0 is the caller's promise.
        let mmu = unsafe { X86Mmu::new() };
        // Safety: the bootloader's map describes the machine.
        let booted = unsafe { bring_up(boot, mapper, mmu, layout) }?;

        let manager = MEMORY
            .set(booted.manager)
            .map_err(|_| BootError::AlreadyInitialized)?;
        info!("memory manager ready");
        Ok((manager, booted.heap))
    }

    /// The published manager, once [`init_memory`] succeeded.
    #[must_use]
    pub fn memory_manager() -> Option<&'static KernelMemoryManager> {
        MEMORY.get()
    }

    /// [`init_memory`], halting the CPU on failure.
    ///
    /// # Safety
    /// As [`init_memory`].
    pub unsafe fn init_memory_or_halt(
        boot: BootMemoryInfo<'_>,
        layout: MemoryLayout,
    ) -> (&'static KernelMemoryManager, Range<VirtualAddress>) {
        // Safety: forwarded to the caller.
        match unsafe { init_memory(boot, layout) } {
            Ok(ready) => ready,
            Err(e) => {
                error!("memory bring-up failed: {e}");
                kernel_registers::instructions::halt_forever()
            }
        }
    }
}
