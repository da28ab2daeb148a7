//! The kernel context of the current process.
//!
//! Nearly every kernel path runs on behalf of some process; a `KernelCtx`
//! bundles the kernel handle with that process so callees never resolve
//! global state implicitly.

use super::{Pid, Proc, ProcData};
use crate::kernel::Kernel;

#[derive(Clone, Copy)]
pub struct KernelCtx {
    kernel: &'static Kernel,
    proc: &'static Proc,
}

impl KernelCtx {
    /// Builds a context for `proc`. Callers outside the scheduler path are
    /// test code; the scheduler uses `current_ctx`.
    pub fn new(kernel: &'static Kernel, proc: &'static Proc) -> Self {
        Self { kernel, proc }
    }

    pub fn kernel(&self) -> &'static Kernel {
        self.kernel
    }

    pub fn proc(&self) -> &'static Proc {
        self.proc
    }

    pub fn pid(&self) -> Pid {
        self.proc.pid_raw()
    }

    /// The private half of the current process.
    pub fn proc_data(&self) -> &ProcData {
        // SAFETY: `data` is private to the process and this context runs on
        // the process's own kernel thread.
        unsafe { &*self.proc.data_raw() }
    }

    /// The private half of the current process, mutably.
    #[allow(clippy::mut_from_ref)]
    pub fn proc_data_mut(&mut self) -> &mut ProcData {
        // SAFETY: as above, plus &mut self serializes mutable borrows along
        // this call path.
        unsafe { &mut *self.proc.data_raw() }
    }
}

/// The context of the process currently running on this CPU.
///
/// # Safety
///
/// Must be called with a process installed on this CPU (that is, from a
/// trap or syscall path), with the kernel initialized.
pub unsafe fn current_ctx(kernel: &'static Kernel) -> KernelCtx {
    let proc = unsafe { (*kernel.mycpu()).proc };
    assert!(!proc.is_null(), "current_ctx: no process");
    // SAFETY: the scheduler stores a pointer into the static process pool.
    KernelCtx::new(kernel, unsafe { &*proc })
}
