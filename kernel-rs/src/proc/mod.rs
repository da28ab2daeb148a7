//! Per-process state.
//!
//! A `Proc` splits into two halves: `ProcShared`, guarded by the process
//! table's spinlock, and `ProcData`, private to the process itself (only
//! the process's own kernel thread touches it, except for the eviction
//! path, which traverses every address space under the table lock).

use core::cell::UnsafeCell;
use core::ptr;
use core::sync::atomic::{AtomicBool, Ordering};

use array_macro::array;

use crate::arch::{Context, TrapFrame};
use crate::file::RcFile;
use crate::param::{MAXPROCNAME, NOFILE};
use crate::vm::VSpace;

mod kernel_ctx;
mod procs;
mod wait_channel;

pub use kernel_ctx::*;
pub use procs::*;
pub use wait_channel::*;

pub type Pid = i32;

#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub enum ProcState {
    Unused,
    Embryo,
    Sleeping,
    Runnable,
    Running,
    Zombie,
}

/// The process-table lock must be held when reading or writing these.
pub struct ProcShared {
    /// Process state.
    pub state: ProcState,

    /// Process ID.
    pub pid: Pid,

    /// Pid of the parent process. 0 means no parent.
    pub parent: Pid,

    /// If non-zero, sleeping on this wait-channel address.
    pub chan: usize,
}

/// Private to the process, so the table lock need not be held.
pub struct ProcData {
    /// Bottom of the kernel stack for this process.
    pub kstack: usize,

    /// swtch() here to run the process.
    pub context: Context,

    /// Trap frame at the top of the kernel stack.
    pub trap_frame: *mut TrapFrame,

    /// User address space. Set while EMBRYO, freed by freeproc.
    pub vspace: Option<VSpace>,

    /// Open files.
    pub files: [Option<RcFile>; NOFILE],

    /// Process name (debugging).
    pub name: [u8; MAXPROCNAME],
}

impl ProcData {
    const fn new() -> Self {
        Self {
            kstack: 0,
            context: Context::new(),
            trap_frame: ptr::null_mut(),
            vspace: None,
            files: array![_ => None; NOFILE],
            name: [0; MAXPROCNAME],
        }
    }
}

/// Per-process state.
///
/// # Safety
///
/// * `shared` is accessed only while the process table's spinlock is held.
/// * `data` is accessed only by the process's own kernel thread, or by the
///   eviction path while holding the table lock.
pub struct Proc {
    shared: UnsafeCell<ProcShared>,

    data: UnsafeCell<ProcData>,

    /// If true, the process has been killed.
    killed: AtomicBool,

    /// Wait channel this process's exiting children wake.
    pub child_chan: WaitChannel,
}

// SAFETY: see the struct-level safety contract; the discipline above makes
// cross-CPU access to the cells data-race free.
unsafe impl Sync for Proc {}

impl Proc {
    pub const fn new() -> Self {
        Self {
            shared: UnsafeCell::new(ProcShared {
                state: ProcState::Unused,
                pid: 0,
                parent: 0,
                chan: 0,
            }),
            data: UnsafeCell::new(ProcData::new()),
            killed: AtomicBool::new(false),
            child_chan: WaitChannel::new(),
        }
    }

    /// Shared state, readable under the table lock.
    pub fn shared<'a>(&'a self, _table: &'a TableGuard<'_>) -> &'a ProcShared {
        // SAFETY: the guard witnesses that the table lock is held.
        unsafe { &*self.shared.get() }
    }

    /// Shared state, writable under the table lock.
    #[allow(clippy::mut_from_ref)]
    pub fn shared_mut<'a>(&'a self, _table: &'a mut TableGuard<'_>) -> &'a mut ProcShared {
        // SAFETY: the guard witnesses that the table lock is held, and the
        // exclusive borrow of the guard serializes writers.
        unsafe { &mut *self.shared.get() }
    }

    /// This process's pid, read without the table lock.
    ///
    /// Only the process itself rewrites its pid (at slot reuse), so the
    /// value is stable for the process reading its own entry.
    pub fn pid_raw(&self) -> Pid {
        // SAFETY: benign read of an i32 field; see above.
        unsafe { (*self.shared.get()).pid }
    }

    /// Raw pointer to the private half.
    pub fn data_raw(&self) -> *mut ProcData {
        self.data.get()
    }

    /// Lockless read of the shared half, for the debug dump only; the
    /// values may be torn.
    pub unsafe fn shared_unchecked(&self) -> &ProcShared {
        unsafe { &*self.shared.get() }
    }

    /// Mark the process killed; it exits at the next trap boundary.
    pub fn kill(&self) {
        self.killed.store(true, Ordering::Release);
    }

    pub fn killed(&self) -> bool {
        self.killed.load(Ordering::Acquire)
    }

    pub(super) fn clear_killed(&self) {
        self.killed.store(false, Ordering::Release);
    }
}
