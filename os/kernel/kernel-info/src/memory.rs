//! # Memory Layout

use kernel_memory_addresses::VirtualAddress;

/// Size of one physical frame and of a normal page.
pub const PAGE_SIZE: u64 = 4096;

/// Size of a huge page (PD-level leaf).
pub const HUGE_PAGE_SIZE: u64 = 2 * 1024 * 1024;

/// Lowest address handed out to user areas. Everything below stays unmapped
/// so null-pointer dereferences always fault.
pub const USER_START: u64 = 0x0000_0000_0040_0000;

/// End (exclusive) of the user range, the top of the lower canonical half.
pub const USER_END: u64 = 0x0000_8000_0000_0000;

/// First address of the kernel half. Root slots `256..512` map this half
/// and are shared by every address space.
pub const KERNEL_HALF_START: u64 = 0xffff_8000_0000_0000;

/// Higher Half Direct Map base used when the bootloader does not report one.
/// Physical address `pa` is accessible at `HHDM_BASE + pa`.
pub const HHDM_BASE: u64 = 0xffff_8880_0000_0000;

/// Start of the window searched by kernel-space area allocation.
pub const KERNEL_AREA_START: u64 = 0xffff_c000_0000_0000;

/// End (exclusive) of the kernel-space area window.
pub const KERNEL_AREA_END: u64 = 0xffff_ff80_0000_0000;

/// Where the kernel executes (VMA), matches the linker script.
pub const KERNEL_BASE: u64 = 0xffff_ffff_8000_0000;

/// Where the kernel image is placed in *physical* memory (LMA).
pub const PHYS_LOAD: u64 = 0x0010_0000; // 1 MiB

/// Distance between the end of the kernel image and the kernel heap.
pub const KERNEL_HEAP_GAP: u64 = 0x10_0000; // 1 MiB

/// Initial size of the eagerly mapped kernel heap.
pub const KERNEL_HEAP_SIZE: u64 = 0x10_0000; // 1 MiB

/// Index of the first kernel-half slot in a root (PML4) table.
pub const KERNEL_ROOT_SLOT_START: usize = 256;

const _: () = {
    assert!(USER_START.is_multiple_of(PAGE_SIZE));
    assert!(USER_START < USER_END);
    assert!(USER_END <= KERNEL_HALF_START);
    assert!(HHDM_BASE >= KERNEL_HALF_START);
    assert!(HHDM_BASE.is_multiple_of(HUGE_PAGE_SIZE));
    assert!(KERNEL_AREA_START > HHDM_BASE);
    assert!(KERNEL_AREA_START < KERNEL_AREA_END);
    assert!(KERNEL_AREA_END <= KERNEL_BASE);
    assert!(KERNEL_HEAP_SIZE.is_multiple_of(PAGE_SIZE));
    assert!((KERNEL_HALF_START >> 39) & 0x1FF == KERNEL_ROOT_SLOT_START as u64);
};

/// Virtual windows the address-space manager allocates areas from, plus the
/// kernel heap sizing.
///
/// [`MemoryLayout::default`] reflects the constants of this module. Tests
/// shrink the windows to exercise exhaustion.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct MemoryLayout {
    /// First address of the user window.
    pub user_start: VirtualAddress,
    /// End (exclusive) of the user window.
    pub user_end: VirtualAddress,
    /// First address of the kernel-space area window.
    pub kernel_area_start: VirtualAddress,
    /// End (exclusive) of the kernel-space area window.
    pub kernel_area_end: VirtualAddress,
    /// Gap between the kernel image end and the heap.
    pub kernel_heap_gap: u64,
    /// Bytes of kernel heap mapped at boot.
    pub kernel_heap_size: u64,
}

impl MemoryLayout {
    #[must_use]
    pub const fn new() -> Self {
        Self {
            user_start: VirtualAddress::new(USER_START),
            user_end: VirtualAddress::new(USER_END),
            kernel_area_start: VirtualAddress::new(KERNEL_AREA_START),
            kernel_area_end: VirtualAddress::new(KERNEL_AREA_END),
            kernel_heap_gap: KERNEL_HEAP_GAP,
            kernel_heap_size: KERNEL_HEAP_SIZE,
        }
    }

    /// Same layout with a different user window.
    #[must_use]
    pub const fn with_user_window(mut self, start: VirtualAddress, end: VirtualAddress) -> Self {
        self.user_start = start;
        self.user_end = end;
        self
    }

    #[must_use]
    pub const fn with_kernel_heap_size(mut self, size: u64) -> Self {
        self.kernel_heap_size = size;
        self
    }
}

impl Default for MemoryLayout {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_layout_matches_constants() {
        let l = MemoryLayout::default();
        assert_eq!(l.user_start.as_u64(), USER_START);
        assert_eq!(l.kernel_area_end.as_u64(), KERNEL_AREA_END);
        assert!(l.kernel_area_start.is_upper_half());
        assert!(!l.user_end.is_upper_half());
    }

    #[test]
    fn builders_override_windows() {
        let l = MemoryLayout::new()
            .with_user_window(VirtualAddress::new(0x1000), VirtualAddress::new(0x5000))
            .with_kernel_heap_size(PAGE_SIZE);
        assert_eq!(l.user_start.as_u64(), 0x1000);
        assert_eq!(l.user_end.as_u64(), 0x5000);
        assert_eq!(l.kernel_heap_size, PAGE_SIZE);
        assert_eq!(l.kernel_area_start.as_u64(), KERNEL_AREA_START);
    }
}
