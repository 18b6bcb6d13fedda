#![allow(dead_code, unsafe_code)]

use kernel_info::boot::{BootMemoryInfo, KernelImage, MemoryRegion, MemoryRegionKind};
use kernel_info::memory::{HHDM_BASE, KERNEL_BASE, MemoryLayout};
use kernel_memory_addresses::{PhysicalAddress, PhysicalPage, Size4K, VirtualAddress};
use kernel_vmem::{Mmu, PhysMapper};
use kernel_vmm::MemoryManager;
use kernel_vmm::boot::{BootMemory, bring_up};
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};

/// 8 MiB of simulated RAM.
pub const RAM_FRAMES: usize = 2048;

/// Everything below 1 MiB is firmware-reserved in the fake memory map.
pub const LOW_RESERVED: u64 = 0x10_0000;

/// Byte pattern fresh RAM starts with, so zero-filling is observable.
pub const DIRT: u8 = 0xAB;

#[repr(align(4096))]
pub struct Aligned4K([u8; 4096]);

/// Simulated RAM: physical address `pa` lives at byte `pa` of `frames`.
pub struct FakeRam {
    frames: Vec<Aligned4K>,
}

impl FakeRam {
    pub fn new(frames: usize) -> Self {
        Self {
            frames: (0..frames).map(|_| Aligned4K([DIRT; 4096])).collect(),
        }
    }

    pub fn len_bytes(&self) -> u64 {
        self.frames.len() as u64 * 4096
    }

    /// Contents of the 4 KiB frame holding `pa`.
    pub fn page(&self, pa: PhysicalAddress) -> &[u8] {
        let frame = pa.as_u64() & !0xfff;
        unsafe { core::slice::from_raw_parts(self.phys_to_ptr(PhysicalAddress::new(frame)), 4096) }
    }
}

unsafe impl PhysMapper for FakeRam {
    fn phys_to_ptr(&self, pa: PhysicalAddress) -> *mut u8 {
        let off = usize::try_from(pa.as_u64()).unwrap();
        assert!(off < self.frames.len() * 4096, "{pa:?} outside test RAM");
        unsafe { self.frames.as_ptr().cast::<u8>().cast_mut().add(off) }
    }
}

#[derive(Default)]
pub struct RecordingMmu {
    pub invalidated: Mutex<Vec<VirtualAddress>>,
    pub loaded: Mutex<Vec<PhysicalPage<Size4K>>>,
    pub global_pages: AtomicBool,
}

impl RecordingMmu {
    pub fn loaded_roots(&self) -> Vec<PhysicalPage<Size4K>> {
        self.loaded.lock().unwrap().clone()
    }

    pub fn was_invalidated(&self, va: VirtualAddress) -> bool {
        self.invalidated.lock().unwrap().contains(&va)
    }
}

impl Mmu for RecordingMmu {
    fn invalidate_page(&self, va: VirtualAddress) {
        self.invalidated.lock().unwrap().push(va);
    }

    fn load_root(&self, root: PhysicalPage<Size4K>) {
        self.loaded.lock().unwrap().push(root);
    }

    fn enable_global_pages(&self) {
        self.global_pages.store(true, Ordering::SeqCst);
    }
}

pub type TestManager = MemoryManager<FakeRam, RecordingMmu>;

/// A 12 KiB kernel image loaded just below the usable RAM.
pub fn kernel_image() -> KernelImage {
    KernelImage {
        virt_base: KERNEL_BASE,
        phys_base: 0x8_0000,
        len: 0x3000,
    }
}

pub fn memory_map() -> [MemoryRegion; 2] {
    [
        MemoryRegion::new(0, LOW_RESERVED, MemoryRegionKind::Reserved),
        MemoryRegion::usable(LOW_RESERVED, RAM_FRAMES as u64 * 4096 - LOW_RESERVED),
    ]
}

/// Full bring-up over fresh fake RAM.
pub fn boot_with(layout: MemoryLayout) -> BootMemory<FakeRam, RecordingMmu> {
    boot_on(&mut memory_map(), layout)
}

/// Full bring-up over fresh fake RAM described by `map`.
pub fn boot_on(map: &mut [MemoryRegion], layout: MemoryLayout) -> BootMemory<FakeRam, RecordingMmu> {
    let ram = FakeRam::new(RAM_FRAMES);
    let info = BootMemoryInfo::new(map, kernel_image()).with_hhdm_offset(HHDM_BASE);
    unsafe { bring_up(info, ram, RecordingMmu::default(), layout) }.expect("bring-up")
}

pub fn boot() -> TestManager {
    boot_with(MemoryLayout::default()).manager
}
