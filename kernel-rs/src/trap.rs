//! Trap dispatch.
//!
//! The interrupt vector stubs push a trap frame and land here. System
//! calls, timer ticks, device interrupts and page faults are told apart by
//! vector number; page faults further dispatch on the error-code bits and
//! the faulting address in cr2. A fault the kernel cannot repair kills the
//! faulting process (user mode) or panics (kernel mode).

use bitflags::bitflags;

use crate::arch::{self, TrapFrame};
use crate::kernel::Kernel;
use crate::proc::{current_ctx, KernelCtx};
use crate::vm;

bitflags! {
    /// x86-64 page-fault error code bits.
    pub struct FaultErr: u32 {
        /// Set: protection violation; clear: page not present.
        const PROT = 1 << 0;
        /// The access was a write.
        const WRITE = 1 << 1;
        /// The access came from user mode.
        const USER = 1 << 2;
    }
}

pub enum TrapKind {
    Syscall,
    Timer,
    Ide,
    Kbd,
    Com1,
    Spurious,
    PageFault { addr: usize, err: FaultErr },
    Other(u32),
}

fn decode(tf: &TrapFrame) -> TrapKind {
    match tf.trapno as u32 {
        arch::TRAP_SYSCALL => TrapKind::Syscall,
        arch::TRAP_PGFLT => TrapKind::PageFault {
            addr: arch::fault_addr(),
            err: FaultErr::from_bits_truncate(tf.err as u32),
        },
        arch::IRQ_TIMER => TrapKind::Timer,
        arch::IRQ_IDE => TrapKind::Ide,
        arch::IRQ_KBD => TrapKind::Kbd,
        arch::IRQ_COM1 => TrapKind::Com1,
        arch::IRQ_SPURIOUS => TrapKind::Spurious,
        n => TrapKind::Other(n),
    }
}

/// All traps land here, dispatched by the vector stubs.
///
/// # Safety
///
/// `tf` must point at the trap frame the stubs pushed, and the kernel must
/// be initialized.
#[no_mangle]
pub unsafe extern "C" fn trap(tf: *mut TrapFrame) {
    let kernel = crate::kernel::kernel();
    // SAFETY: per the function contract.
    let tf = unsafe { &mut *tf };
    if tf.from_kernel() {
        kernel_trap(kernel, tf);
    } else {
        // SAFETY: traps from user mode run with a current process.
        let ctx = unsafe { current_ctx(kernel) };
        user_trap(kernel, tf, ctx);
    }
}

fn user_trap(kernel: &'static Kernel, tf: &mut TrapFrame, mut ctx: KernelCtx) {
    let kind = decode(tf);
    let mut timer = false;

    match kind {
        TrapKind::Syscall => {
            // Honor a kill requested while we were in user mode.
            if ctx.proc().killed() {
                kernel.procs().exit_current(ctx);
            }
            let num = tf.rax as i32;
            tf.rax = match ctx.syscall(num) {
                Ok(v) => v,
                Err(()) => usize::MAX,
            };
        }
        TrapKind::Timer => {
            if arch::cpu_id() == 0 {
                kernel.clock_intr();
            }
            arch::irq_eoi();
            timer = true;
        }
        TrapKind::Ide => {
            arch::ide_intr();
            arch::irq_eoi();
        }
        TrapKind::Kbd => {
            arch::kbd_intr();
            arch::irq_eoi();
        }
        TrapKind::Com1 => {
            arch::uart_intr();
            arch::irq_eoi();
        }
        TrapKind::Spurious => {}
        TrapKind::PageFault { addr, err } => {
            debug_assert!(err.contains(FaultErr::USER));
            if page_fault(&mut ctx, addr, err).is_err() {
                crate::println!(
                    "pid {}: unhandled page fault at {:#x} (err {:#x})",
                    ctx.pid(),
                    addr,
                    err.bits()
                );
                ctx.proc().kill();
            }
        }
        TrapKind::Other(n) => {
            crate::println!("pid {}: unexpected trap {}", ctx.pid(), n);
            ctx.proc().kill();
        }
    }

    // A kill takes effect on the way back to user mode.
    if ctx.proc().killed() {
        kernel.procs().exit_current(ctx);
    }

    // Give up the CPU if this was a timer interrupt.
    if timer {
        kernel.procs().yield_cpu(&mut ctx);
    }
}

fn kernel_trap(kernel: &'static Kernel, tf: &mut TrapFrame) {
    match decode(tf) {
        TrapKind::Timer => {
            if arch::cpu_id() == 0 {
                kernel.clock_intr();
            }
            arch::irq_eoi();
        }
        TrapKind::Ide => {
            arch::ide_intr();
            arch::irq_eoi();
        }
        TrapKind::Kbd => {
            arch::kbd_intr();
            arch::irq_eoi();
        }
        TrapKind::Com1 => {
            arch::uart_intr();
            arch::irq_eoi();
        }
        TrapKind::Spurious => {}
        TrapKind::PageFault { addr, err } => {
            panic!(
                "kernel page fault at {:#x} (err {:#x}, rip {:#x})",
                addr,
                err.bits(),
                tf.rip
            );
        }
        TrapKind::Syscall => unreachable!("syscall from kernel mode"),
        TrapKind::Other(n) => panic!("unexpected trap {} from kernel mode", n),
    }
}

/// Repair a user page fault, per the error bits:
/// * not-present: swap the page back in, or grow the stack when the
///   address lies within ten pages below the stack base;
/// * write to a present, read-only page: break the COW share.
/// Anything else is a user-program bug.
fn page_fault(ctx: &mut KernelCtx, addr: usize, err: FaultErr) -> Result<(), ()> {
    let write = err.contains(FaultErr::WRITE);
    vm::ensure_mapped(ctx, addr, write).map(|_| ())
}
