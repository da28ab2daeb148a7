//! Sleeping locks: long-term locks whose waiters yield the CPU.
use core::cell::UnsafeCell;
use core::ops::{Deref, DerefMut};

use super::Sleepablelock;
use crate::kernel::Kernel;
use crate::proc::{KernelCtx, Pid};

const UNOWNED: Pid = -1;

/// Long-term locks for processes. May be held across blocking disk I/O, but
/// never across `sched`.
pub struct Sleeplock<T> {
    /// Process holding the lock. `UNOWNED` means unlocked.
    locked: Sleepablelock<Pid>,

    data: UnsafeCell<T>,
}

// SAFETY: the owner protocol provides mutual exclusion over `data`.
unsafe impl<T: Send> Sync for Sleeplock<T> {}

pub struct SleeplockGuard<'s, T> {
    lock: &'s Sleeplock<T>,
    kernel: &'static Kernel,
}

impl<T> Sleeplock<T> {
    /// Returns a new `Sleeplock` with name `name` and data `data`.
    pub const fn new(name: &'static str, data: T) -> Self {
        Self {
            locked: Sleepablelock::new(name, UNOWNED),
            data: UnsafeCell::new(data),
        }
    }

    /// Acquires the lock, sleeping until the holder releases it.
    pub fn lock(&self, ctx: &KernelCtx) -> SleeplockGuard<'_, T> {
        let mut guard = self.locked.lock();
        while *guard != UNOWNED {
            guard.sleep(ctx);
        }
        *guard = ctx.pid();
        drop(guard);
        SleeplockGuard {
            lock: self,
            kernel: ctx.kernel(),
        }
    }

    /// Does the calling process hold this lock?
    pub fn holding(&self, ctx: &KernelCtx) -> bool {
        *self.locked.lock() == ctx.pid()
    }

    /// Returns a mutable reference to the inner data.
    pub fn get_mut(&mut self) -> &mut T {
        // SAFETY: &mut self is exclusive.
        unsafe { &mut *self.data.get() }
    }

    /// Returns a raw pointer to the inner data.
    /// The caller must ensure that accessing the pointer does not incur race.
    pub fn get_mut_raw(&self) -> *mut T {
        self.data.get()
    }
}

impl<T> Deref for SleeplockGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &Self::Target {
        // SAFETY: the guard holds the lock.
        unsafe { &*self.lock.data.get() }
    }
}

impl<T> DerefMut for SleeplockGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        // SAFETY: the guard holds the lock and &mut self is exclusive.
        unsafe { &mut *self.lock.data.get() }
    }
}

impl<T> Drop for SleeplockGuard<'_, T> {
    fn drop(&mut self) {
        let mut guard = self.lock.locked.lock();
        *guard = UNOWNED;
        guard.wakeup(self.kernel);
    }
}
