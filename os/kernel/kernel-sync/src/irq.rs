//! # Interrupt masking
//!
//! On bare metal (`target_os = "none"`) [`IrqGuard`] issues `cli` and
//! restores `IF` on drop. Hosted builds (unit tests) have no interrupt flag
//! to touch, so the guard only records that it was taken.

/// Bit 9 of `RFLAGS`: interrupt enable.
#[cfg(target_os = "none")]
const RFLAGS_IF: u64 = 1 << 9;

/// Returns `true` if maskable interrupts are enabled on this CPU.
#[cfg(target_os = "none")]
#[inline]
#[must_use]
pub fn interrupts_enabled() -> bool {
    let r: u64;
    // Safety: reading RFLAGS has no side effects.
    unsafe { core::arch::asm!("pushfq; pop {}", out(reg) r, options(nomem, preserves_flags)) }
    r & RFLAGS_IF != 0
}

/// Hosted builds never run with a maskable interrupt flag.
#[cfg(not(target_os = "none"))]
#[inline]
#[must_use]
pub const fn interrupts_enabled() -> bool {
    false
}

#[cfg(target_os = "none")]
#[inline]
fn disable() {
    // Safety: ring 0; `cli` only affects this CPU.
    unsafe { core::arch::asm!("cli", options(nomem, nostack)) }
}

#[cfg(target_os = "none")]
#[inline]
fn enable() {
    // Safety: ring 0; only restores a state observed earlier.
    unsafe { core::arch::asm!("sti", options(nomem, nostack)) }
}

#[cfg(not(target_os = "none"))]
#[inline]
const fn disable() {}

#[cfg(not(target_os = "none"))]
#[inline]
const fn enable() {}

/// RAII guard that disables interrupts on creation and restores them on drop.
///
/// Nests correctly: an inner guard sees interrupts already off and leaves
/// them off when it drops.
pub struct IrqGuard {
    /// Whether interrupts were enabled when the guard was created.
    were_enabled: bool,
}

impl Default for IrqGuard {
    fn default() -> Self {
        Self::new()
    }
}

impl IrqGuard {
    #[inline]
    #[must_use]
    pub fn new() -> Self {
        let enabled = interrupts_enabled();
        if enabled {
            disable();
        }
        Self {
            were_enabled: enabled,
        }
    }

    /// Whether this guard will re-enable interrupts on drop.
    #[inline]
    #[must_use]
    pub const fn restores_interrupts(&self) -> bool {
        self.were_enabled
    }
}

impl Drop for IrqGuard {
    fn drop(&mut self) {
        if self.were_enabled {
            enable();
        }
    }
}
