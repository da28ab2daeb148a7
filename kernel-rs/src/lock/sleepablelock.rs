//! Sleepable locks: spinlocks whose guards can sleep on a wait channel.
use core::cell::UnsafeCell;

use super::{spinlock::RawSpinlock, Guard, Lock, RawLock};
use crate::kernel::Kernel;
use crate::proc::{KernelCtx, WaitChannel};

pub struct RawSleepablelock {
    lock: RawSpinlock,
    /// Wait channel the lock's guards sleep on and wake through.
    chan: WaitChannel,
}

/// Similar to `Spinlock`, but guards of this lock can sleep.
pub type Sleepablelock<T> = Lock<RawSleepablelock, T>;
/// Guards of `Sleepablelock<T>`. These guards can `sleep()`/`wakeup()`.
pub type SleepablelockGuard<'s, T> = Guard<'s, RawSleepablelock, T>;

impl RawSleepablelock {
    const fn new(name: &'static str) -> Self {
        Self {
            lock: RawSpinlock::new(name),
            chan: WaitChannel::new(),
        }
    }
}

impl RawLock for RawSleepablelock {
    fn acquire(&self) {
        self.lock.acquire();
    }

    fn release(&self) {
        self.lock.release();
    }

    fn holding(&self) -> bool {
        self.lock.holding()
    }
}

impl<T> Sleepablelock<T> {
    /// Returns a new `Sleepablelock` with name `name` and data `data`.
    pub const fn new(name: &'static str, data: T) -> Self {
        Self {
            lock: RawSleepablelock::new(name),
            data: UnsafeCell::new(data),
        }
    }
}

impl<T> SleepablelockGuard<'_, T> {
    /// Atomically release the lock and sleep on its channel; the lock is
    /// held again when this returns.
    pub fn sleep(&mut self, ctx: &KernelCtx) {
        let lock = self.lock;
        lock.lock.chan.sleep(self, ctx);
    }

    /// Wake every process sleeping on this lock's channel.
    pub fn wakeup(&self, kernel: &'static Kernel) {
        self.lock.lock.chan.wakeup(kernel);
    }
}
