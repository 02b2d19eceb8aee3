//! Interrupt masking.
//!
//! On bare-metal 32-bit x86 the functions here execute `cli`/`sti` and read
//! the `IF` bit from `EFLAGS`. Hosted builds (unit tests, simulation) track the
//! flag in software so code that takes an [`IrqGuard`] can run unprivileged.

#[cfg(all(target_arch = "x86", target_os = "none"))]
mod backend {
    use kernel_registers::LoadRegisterUnsafe;
    use kernel_registers::eflags::Eflags;

    #[inline]
    pub fn enabled() -> bool {
        // SAFETY: reading EFLAGS via pushfd/pop is permitted at every privilege level.
        unsafe { Eflags::load_unsafe() }.if_interrupt_enable()
    }

    #[inline]
    pub fn disable() {
        // SAFETY: the kernel runs at CPL0.
        unsafe { core::arch::asm!("cli", options(nomem, nostack, preserves_flags)) }
    }

    #[inline]
    pub fn enable() {
        // SAFETY: as in `disable`.
        unsafe { core::arch::asm!("sti", options(nomem, nostack, preserves_flags)) }
    }
}

#[cfg(not(all(target_arch = "x86", target_os = "none")))]
mod backend {
    use core::sync::atomic::{AtomicBool, Ordering};

    static IF: AtomicBool = AtomicBool::new(true);

    #[inline]
    pub fn enabled() -> bool {
        IF.load(Ordering::Acquire)
    }

    #[inline]
    pub fn disable() {
        IF.store(false, Ordering::Release);
    }

    #[inline]
    pub fn enable() {
        IF.store(true, Ordering::Release);
    }
}

/// Whether maskable interrupts are currently enabled (`EFLAGS.IF`).
#[inline]
#[must_use]
pub fn interrupts_enabled() -> bool {
    backend::enabled()
}

/// Disables maskable interrupts (`cli`).
///
/// # Safety & Privilege
///
/// Must only be called in contexts where `cli` is permitted. Misuse can
/// hang the system.
#[inline]
pub fn cli_stop_interrupts() {
    backend::disable();
}

/// Enables maskable interrupts (`sti`).
///
/// Typically used to restore a previously disabled interrupt state.
#[inline]
pub fn sti_enable_interrupts() {
    backend::enable();
}

/// RAII guard that disables interrupts on creation and restores them on drop.
///
/// `IrqGuard::new()` snapshots the `IF` bit. If interrupts were enabled, it
/// executes `cli`. On drop, it executes `sti` **only** if they were previously
/// enabled, so guards nest.
///
/// # Examples
///
/// ```
/// use kernel_sync::irq::{IrqGuard, interrupts_enabled};
///
/// let before = interrupts_enabled();
/// {
///     let _g = IrqGuard::new();
///     assert!(!interrupts_enabled());
/// }
/// assert_eq!(interrupts_enabled(), before);
/// ```
pub struct IrqGuard {
    /// Whether interrupts were enabled (IF=1) when the guard was created.
    were_enabled: bool,
}

impl Default for IrqGuard {
    fn default() -> Self {
        Self::new()
    }
}

impl IrqGuard {
    /// Disables interrupts if they are currently enabled and remembers the state.
    #[inline]
    #[must_use]
    pub fn new() -> Self {
        let enabled = interrupts_enabled();
        if enabled {
            cli_stop_interrupts();
        }
        Self {
            were_enabled: enabled,
        }
    }

    /// Whether this guard will re-enable interrupts when dropped.
    #[inline]
    #[must_use]
    pub const fn restores(&self) -> bool {
        self.were_enabled
    }
}

impl Drop for IrqGuard {
    /// Restores interrupts (`sti`) only if they were previously enabled.
    fn drop(&mut self) {
        if self.were_enabled {
            sti_enable_interrupts();
        }
    }
}
