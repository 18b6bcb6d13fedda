//! # Page-Fault Handling
//!
//! Demand paging for areas reserved by
//! [`MemoryManager::allocate`](crate::MemoryManager::allocate). The handler
//! runs one fault event through three steps:
//!
//! ```text
//!  Classify ──► Validate ──┬──► Resolve ──► Resolved
//!                          └──► Reject  ──► Terminate (user) / Fatal (kernel)
//! ```
//!
//! The trap stub saves the registers into a [`TrapFrame`], reads `CR2` and
//! calls [`MemoryManager::handle_page_fault`]. The outcome tells the stub
//! whether to return, kill the faulting context or stop the machine.

use crate::address_space::{AddressSpace, ExecutionUnit};
use crate::error::VmmError;
use crate::manager::MemoryManager;
use bitfield_struct::bitfield;
use kernel_memory_addresses::{Size4K, VirtualAddress};
use kernel_sync::IrqGuard;
use kernel_vmem::{MapError, Mmu, PhysMapper};
use log::{debug, warn};

pub const PAGE_FAULT_VECTOR: u64 = 0x0E; // 14

/// Register state saved by the trap stub.
///
/// Lowest address first: the stub pushes `r15` down to `rax`, then the
/// vector; the CPU pushed the error code and the interrupt frame before.
#[repr(C)]
#[derive(Debug, Default, Copy, Clone, PartialEq, Eq)]
pub struct TrapFrame {
    pub rax: u64,
    pub rbx: u64,
    pub rcx: u64,
    pub rdx: u64,
    pub rsi: u64,
    pub rdi: u64,
    pub rbp: u64,
    pub r8: u64,
    pub r9: u64,
    pub r10: u64,
    pub r11: u64,
    pub r12: u64,
    pub r13: u64,
    pub r14: u64,
    pub r15: u64,
    pub vector: u64,
    pub error_code: u64,
    // Pushed by the CPU on interrupt gate entry.
    pub rip: u64,
    pub cs: u64,
    pub rflags: u64,
    pub rsp: u64,
    pub ss: u64,
}

impl TrapFrame {
    /// The interrupted code ran at CPL 3.
    #[must_use]
    pub const fn is_user_mode(&self) -> bool {
        self.cs & 3 == 3
    }

    #[must_use]
    pub const fn page_fault_error(&self) -> PageFaultError {
        PageFaultError::from_bits(self.error_code)
    }
}

/// Page-fault error code layout (x86-64).
///
/// Each bit describes the condition that caused the page fault.
/// Reference: Intel SDM Vol. 3A, §6.15.1 “Page-Fault Exception (#PF)”.
#[bitfield(u64)]
#[derive(PartialEq, Eq)]
pub struct PageFaultError {
    /// 0 = non-present page.
    /// 1 = protection violation (page present but access disallowed).
    pub present: bool, // bit 0

    /// 0 = read or execute.
    /// 1 = write access.
    pub write: bool, // bit 1

    /// 0 = supervisor (CPL 0–2).
    /// 1 = user mode (CPL 3).
    pub user: bool, // bit 2

    /// 1 = caused by reserved bit set in a paging structure.
    pub reserved_bit: bool, // bit 3

    /// 1 = instruction fetch (execute access).
    pub instruction_fetch: bool, // bit 4

    /// 1 = protection-key violation (if CR4.PKE=1).
    pub protection_key: bool, // bit 5

    /// 1 = shadow stack access (if CET-SS enabled).
    pub shadow_stack: bool, // bit 6

    #[bits(57)]
    __: u64, // reserved / ignored bits
}

impl PageFaultError {
    #[must_use]
    pub const fn explain(&self) -> &'static str {
        if self.reserved_bit() {
            "Reserved bit set in a paging structure"
        } else if !self.present() {
            "Non-present page (not yet backed or never reserved)"
        } else if self.instruction_fetch() {
            if self.user() {
                "User-mode instruction fetch on protected page (likely NX or SMEP)"
            } else {
                "Kernel instruction fetch on protected page"
            }
        } else if self.write() {
            "Write access to protected page"
        } else {
            "Read access to protected page"
        }
    }
}

/// One classified fault.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct FaultEvent {
    /// Faulting linear address, from `CR2`.
    pub address: VirtualAddress,
    pub error: PageFaultError,
    /// Instruction that faulted.
    pub ip: VirtualAddress,
}

impl FaultEvent {
    #[must_use]
    pub const fn classify(frame: &TrapFrame, address: VirtualAddress) -> Self {
        Self {
            address,
            error: frame.page_fault_error(),
            ip: VirtualAddress::new(frame.rip),
        }
    }
}

/// Why a fault was not resolved.
#[derive(Debug, Copy, Clone, PartialEq, Eq, thiserror::Error)]
pub enum FaultRejection {
    #[error("no area contains the address")]
    Unmapped,
    #[error("write to a read-only area")]
    WriteToReadOnly,
    #[error("instruction fetch from a non-executable area")]
    ExecuteNonExecutable,
    #[error("access not permitted by the area")]
    ProtectionViolation,
    #[error("no physical frame left to back the page")]
    OutOfMemory,
    #[error("reserved bit set in a paging structure")]
    ReservedBit,
    #[error("page-table update failed: {0}")]
    Map(MapError),
}

/// What the trap stub does next.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum FaultOutcome {
    /// The page is mapped; return and retry the instruction.
    Resolved,
    /// Kill the user context that faulted. The machine keeps running.
    Terminate(FaultRejection),
    /// The kernel itself faulted, or the tables are corrupt.
    Fatal(FaultRejection),
}

impl<M: PhysMapper, U: Mmu> MemoryManager<M, U> {
    /// Handle a `#PF` raised while `unit` was running.
    ///
    /// Kernel-half addresses are resolved in the kernel space, all others in
    /// the unit's current space (or the kernel space before the first
    /// switch). Interrupts stay off on this CPU until the mapping is in.
    pub fn handle_page_fault(
        &self,
        unit: &ExecutionUnit,
        frame: &TrapFrame,
        address: VirtualAddress,
    ) -> FaultOutcome {
        let _irq = IrqGuard::new();
        let event = FaultEvent::classify(frame, address);
        debug!(
            "#PF at {:?} from {:?}: {} ({:#x})",
            event.address,
            event.ip,
            event.error.explain(),
            event.error.into_bits()
        );

        if event.error.reserved_bit() {
            warn!("#PF at {:?}: corrupt paging structure", event.address);
            return FaultOutcome::Fatal(FaultRejection::ReservedBit);
        }

        let space = if address.is_upper_half() {
            self.kernel_space()
        } else {
            unit.current().unwrap_or_else(|| self.kernel_space())
        };

        match self.resolve_fault(space, &event) {
            Ok(()) => FaultOutcome::Resolved,
            Err(reason) => {
                warn!(
                    "#PF at {:?} from {:?} rejected: {reason}",
                    event.address, event.ip
                );
                if event.error.user() {
                    FaultOutcome::Terminate(reason)
                } else {
                    FaultOutcome::Fatal(reason)
                }
            }
        }
    }

    fn resolve_fault(&self, space: &AddressSpace, event: &FaultEvent) -> Result<(), FaultRejection> {
        let error = event.error;
        // Held until the page is mapped, so a concurrent `free` of the area
        // waits for us.
        let areas = space.lock_areas();
        let area = *areas.find(event.address).ok_or(FaultRejection::Unmapped)?;
        let flags = area.flags();

        if error.user() && !flags.user() {
            return Err(FaultRejection::ProtectionViolation);
        }
        if error.write() && !flags.writable() {
            return Err(FaultRejection::WriteToReadOnly);
        }
        if error.instruction_fetch() && !flags.executable() {
            return Err(FaultRejection::ExecuteNonExecutable);
        }
        if error.present() || flags.mmio() {
            return Err(FaultRejection::ProtectionViolation);
        }

        let page = event.address.align_down::<Size4K>();
        match self.map_fresh_page(&self.walker(space), page, area.page_entry_bits()) {
            Ok(()) => {
                debug!("#PF at {:?}: backed {page:?}", event.address);
                Ok(())
            }
            // Another CPU got there first; its page stands.
            Err(VmmError::Map(MapError::AlreadyMapped { .. })) => Ok(()),
            Err(VmmError::OutOfMemory | VmmError::Map(MapError::OutOfMemory { .. })) => {
                Err(FaultRejection::OutOfMemory)
            }
            Err(VmmError::Map(e)) => Err(FaultRejection::Map(e)),
            Err(_) => Err(FaultRejection::ProtectionViolation),
        }
    }
}

/// The faulting address of the `#PF` being handled.
///
/// # Safety
/// Ring 0 only, inside the page-fault handler before anything else can
/// fault and overwrite `CR2`.
#[cfg(target_arch = "x86_64")]
#[must_use]
pub unsafe fn fault_address() -> VirtualAddress {
    use kernel_registers::LoadRegisterUnsafe;
    use kernel_registers::cr2::Cr2;
    // Safety: forwarded to the caller.
    unsafe { Cr2::load_unsafe() }.fault_address()
}
