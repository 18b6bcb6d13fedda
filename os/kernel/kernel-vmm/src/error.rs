use kernel_alloc::FrameFreeError;
use kernel_memory_addresses::VirtualAddress;
use kernel_vmem::MapError;

/// Failures of address-space operations.
#[derive(Debug, Copy, Clone, PartialEq, Eq, thiserror::Error)]
pub enum VmmError {
    #[error("zero-sized allocation")]
    ZeroSize,
    #[error("no free virtual range of {size:#x} bytes")]
    AddressSpaceExhausted { size: u64 },
    #[error("out of physical memory")]
    OutOfMemory,
    #[error("{0:?} is not the base of an area")]
    NotAreaBase(VirtualAddress),
    #[error("MMIO area requested without a physical base")]
    MissingBacking,
    #[error("user-accessible area requested in the kernel address space")]
    UserAreaInKernelSpace,
    #[error("the kernel address space cannot be destroyed")]
    KernelSpaceImmortal,
    #[error("address space is still referenced")]
    SpaceInUse,
    #[error("page-table update failed: {0}")]
    Map(#[from] MapError),
    #[error("frame release failed: {0}")]
    Frame(#[from] FrameFreeError),
}
