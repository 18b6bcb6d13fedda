//! # Kernel Boot Information
//!
//! Plain data the bootloader discovers and the memory core consumes once:
//! the physical memory map, the direct-map offset and where the kernel image
//! was loaded.

use crate::memory::{HHDM_BASE, KERNEL_BASE, PHYS_LOAD};

/// Usability class of a physical memory map entry.
#[repr(u32)]
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum MemoryRegionKind {
    /// Free RAM the physical allocator may hand out.
    Usable = 0,
    /// Firmware-reserved or otherwise unavailable.
    Reserved = 1,
    /// ACPI tables; reclaimable after parsing.
    AcpiReclaimable = 2,
    /// ACPI non-volatile storage.
    AcpiNvs = 3,
    /// Defective RAM.
    BadMemory = 4,
    /// Bootloader structures; reclaimable once the kernel owns memory.
    BootloaderReclaimable = 5,
    /// The kernel image and boot modules.
    KernelAndModules = 6,
    /// Linear framebuffer.
    Framebuffer = 7,
}

/// One entry of the physical memory map.
#[repr(C)]
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct MemoryRegion {
    /// Physical base address in bytes.
    pub base: u64,
    /// Length in bytes.
    pub length: u64,
    /// Usability class.
    pub kind: MemoryRegionKind,
}

impl MemoryRegion {
    #[must_use]
    pub const fn new(base: u64, length: u64, kind: MemoryRegionKind) -> Self {
        Self { base, length, kind }
    }

    #[must_use]
    pub const fn usable(base: u64, length: u64) -> Self {
        Self::new(base, length, MemoryRegionKind::Usable)
    }

    #[must_use]
    pub const fn is_usable(&self) -> bool {
        matches!(self.kind, MemoryRegionKind::Usable)
    }

    /// End address (exclusive), saturating at `u64::MAX`.
    #[must_use]
    pub const fn end(&self) -> u64 {
        self.base.saturating_add(self.length)
    }
}

/// Where the kernel image lives, used once to map it into the kernel space.
#[repr(C)]
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct KernelImage {
    /// Link-time virtual base (VMA).
    pub virt_base: u64,
    /// Physical load base (LMA).
    pub phys_base: u64,
    /// Image size in bytes, including BSS.
    pub len: u64,
}

impl KernelImage {
    /// Virtual end (exclusive) of the image.
    #[must_use]
    pub const fn virt_end(&self) -> u64 {
        self.virt_base + self.len
    }
}

impl Default for KernelImage {
    fn default() -> Self {
        Self {
            virt_base: KERNEL_BASE,
            phys_base: PHYS_LOAD,
            len: 0,
        }
    }
}

/// Everything the memory core needs from the bootloader.
///
/// The memory map is borrowed mutably: the physical allocator carves its
/// bitmap out of the first usable region large enough and shrinks that
/// entry in place.
#[derive(Debug)]
pub struct BootMemoryInfo<'a> {
    /// Direct-map offset reported by the bootloader.
    pub hhdm_offset: u64,
    /// Physical memory map.
    pub memory_map: &'a mut [MemoryRegion],
    /// Kernel image placement.
    pub kernel: KernelImage,
}

impl<'a> BootMemoryInfo<'a> {
    /// Boot info using the default direct-map base.
    #[must_use]
    pub fn new(memory_map: &'a mut [MemoryRegion], kernel: KernelImage) -> Self {
        Self {
            hhdm_offset: HHDM_BASE,
            memory_map,
            kernel,
        }
    }

    #[must_use]
    pub fn with_hhdm_offset(mut self, offset: u64) -> Self {
        self.hhdm_offset = offset;
        self
    }
}
