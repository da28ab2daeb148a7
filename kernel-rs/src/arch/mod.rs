//! Machine-dependent layer.
//!
//! Everything the kernel needs from the hardware goes through this module:
//! interrupt flag control, per-CPU interrupt-nesting bookkeeping, the
//! faulting address, page-table installation, the physical/kernel-virtual
//! translation, the context-switch and trap-return primitives, and the
//! interfaces of the out-of-scope device drivers.
//!
//! `x86_64` is the real machine. `host` is a software model of the same
//! interface used when the crate is compiled for a hosted target, which is
//! how the machine-independent kernel gets exercised by `cargo test`.

use cfg_if::cfg_if;

cfg_if! {
    if #[cfg(target_os = "none")] {
        mod x86_64;
        pub use x86_64::*;
    } else {
        mod host;
        pub use host::*;
    }
}

/// Trap vector numbers shared by both implementations.
pub const TRAP_DIVIDE: u32 = 0;
pub const TRAP_PGFLT: u32 = 14;
pub const TRAP_SYSCALL: u32 = 64;

pub const IRQ0: u32 = 32;
pub const IRQ_TIMER: u32 = IRQ0;
pub const IRQ_KBD: u32 = IRQ0 + 1;
pub const IRQ_COM1: u32 = IRQ0 + 4;
pub const IRQ_IDE: u32 = IRQ0 + 14;
pub const IRQ_SPURIOUS: u32 = IRQ0 + 31;

/// User-mode segment selectors set up by the out-of-scope boot path, and
/// the interrupt-enable bit of rflags.
pub const USER_CS: usize = 0x1b;
pub const USER_DS: usize = 0x23;
pub const RFLAGS_IF: usize = 1 << 9;

/// push_off/pop_off are like intr_off()/intr_on() except that they are
/// matched: it takes two pop_off()s to undo two push_off()s. Also, if
/// interrupts are initially off, then push_off, pop_off leaves them off.
pub fn push_off() {
    let old = intr_get();
    intr_off();
    if intr_depth() == 0 {
        set_intr_was_enabled(old);
    }
    set_intr_depth(intr_depth() + 1);
}

/// pop_off() should be paired with push_off(). See push_off() for details.
pub fn pop_off() {
    assert!(!intr_get(), "pop_off - interruptible");
    assert!(intr_depth() >= 1, "pop_off");
    set_intr_depth(intr_depth() - 1);
    if intr_depth() == 0 && intr_was_enabled() {
        // SAFETY: we are restoring the state saved by the matching push_off,
        // so the caller was running with interrupts enabled already.
        unsafe { intr_on() };
    }
}
