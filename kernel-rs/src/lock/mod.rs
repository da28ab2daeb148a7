//! The lock module.
//!
//! Contains types for locks and lock guards that provide mutual exclusion.
//! `Spinlock` and `Sleepablelock` share the generic `Lock`/`Guard` pair
//! through the `RawLock` trait; `Sleeplock` owns its locking protocol (it
//! needs the process context to record its owner and to sleep).

use core::cell::UnsafeCell;
use core::ops::{Deref, DerefMut};

mod sleepablelock;
mod sleeplock;
mod spinlock;

pub use sleepablelock::{Sleepablelock, SleepablelockGuard};
pub use sleeplock::{Sleeplock, SleeplockGuard};
pub use spinlock::{RawSpinlock, Spinlock, SpinlockGuard};

/// Raw locks that can be acquired and released without further context.
pub trait RawLock {
    /// Acquires the lock.
    fn acquire(&self);

    /// Releases the lock.
    fn release(&self);

    /// Check whether this CPU is holding the lock.
    fn holding(&self) -> bool;
}

/// Locks that own a `RawLock` and the data it protects.
pub struct Lock<R: RawLock, T> {
    pub(in crate::lock) lock: R,
    pub(in crate::lock) data: UnsafeCell<T>,
}

// SAFETY: the raw lock provides mutual exclusion over `data`.
unsafe impl<R: RawLock + Sync, T: Send> Sync for Lock<R, T> {}

impl<R: RawLock, T> Lock<R, T> {
    /// Acquires the lock and returns the lock guard.
    pub fn lock(&self) -> Guard<'_, R, T> {
        self.lock.acquire();
        Guard { lock: self }
    }

    /// Check whether this CPU is holding the lock.
    pub fn holding(&self) -> bool {
        self.lock.holding()
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

    /// Releases the lock without a guard.
    ///
    /// # Safety
    ///
    /// Use only when the lock was acquired and its guard was forgotten, or
    /// when the acquiring thread handed the lock over (the fork-child path,
    /// which wakes holding the table lock the scheduler took).
    pub unsafe fn force_unlock(&self) {
        self.lock.release();
    }
}

/// Guards that provide exclusive access to the lock's data until dropped.
pub struct Guard<'s, R: RawLock, T> {
    pub(in crate::lock) lock: &'s Lock<R, T>,
}

impl<R: RawLock, T> Guard<'_, R, T> {
    /// Temporarily releases the lock, runs `f`, and reacquires the lock.
    /// `self` cannot be accessed while `f` runs.
    pub fn reacquire_after<F: FnOnce() -> U, U>(&mut self, f: F) -> U {
        self.lock.lock.release();
        let result = f();
        self.lock.lock.acquire();
        result
    }
}

impl<R: RawLock, T> Deref for Guard<'_, R, T> {
    type Target = T;

    fn deref(&self) -> &Self::Target {
        // SAFETY: the guard holds the lock.
        unsafe { &*self.lock.data.get() }
    }
}

impl<R: RawLock, T> DerefMut for Guard<'_, R, T> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        // SAFETY: the guard holds the lock and &mut self is exclusive.
        unsafe { &mut *self.lock.data.get() }
    }
}

impl<R: RawLock, T> Drop for Guard<'_, R, T> {
    fn drop(&mut self) {
        self.lock.lock.release();
    }
}

/// Lock guards that can be slept on in a `WaitChannel`.
pub trait Waitable {
    /// Releases the inner raw lock.
    ///
    /// # Safety
    ///
    /// `raw_release()` and `raw_acquire()` must always be used as a pair;
    /// do not access the guard's data in between.
    unsafe fn raw_release(&mut self);

    /// Reacquires the inner raw lock.
    ///
    /// # Safety
    ///
    /// See `raw_release()`.
    unsafe fn raw_acquire(&mut self);
}

impl<R: RawLock, T> Waitable for Guard<'_, R, T> {
    unsafe fn raw_release(&mut self) {
        self.lock.lock.release();
    }

    unsafe fn raw_acquire(&mut self) {
        self.lock.lock.acquire();
    }
}
