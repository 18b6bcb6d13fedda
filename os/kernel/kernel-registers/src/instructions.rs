//! # Privileged Paging Instructions

use kernel_memory_addresses::VirtualAddress;

/// Invalidate the TLB entry for the page containing `va` on this CPU.
///
/// # Safety
/// Ring 0 only.
#[inline]
pub unsafe fn invlpg(va: VirtualAddress) {
    unsafe {
        core::arch::asm!("invlpg [{}]", in(reg) va.as_u64(), options(nostack, preserves_flags));
    }
}

/// Halt this CPU forever with interrupts disabled.
#[inline]
pub fn halt_forever() -> ! {
    loop {
        // Safety: `cli; hlt` only parks the current CPU.
        unsafe {
            core::arch::asm!("cli", "hlt", options(nomem, nostack));
        }
    }
}
