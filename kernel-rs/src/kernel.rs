//! The kernel: every process-wide singleton, wired together in one place
//! and always reached through an explicit handle.

use core::cell::UnsafeCell;
use core::fmt::{self, Write};
use core::ptr;
use core::sync::atomic::{AtomicBool, Ordering};

use array_macro::array;
use spin::Once;

use crate::arch::{self, Context};
use crate::bio::{Bcache, BlockDevice, Buf};
use crate::file::{DevswTable, FileTable};
use crate::fs::FileSystem;
use crate::kalloc::Kmem;
use crate::lock::{Sleepablelock, Spinlock};
use crate::param::NCPU;
use crate::proc::{KernelCtx, Proc, Procs};

/// Per-CPU state: the scheduler context and the process running here.
pub struct Cpu {
    pub context: Context,
    pub proc: *const Proc,
}

impl Cpu {
    const fn new() -> Self {
        Self {
            context: Context::new(),
            proc: ptr::null(),
        }
    }
}

/// Writes console output through the out-of-scope UART driver.
pub struct Printer;

impl Write for Printer {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        for b in s.bytes() {
            arch::console_putc(b);
        }
        Ok(())
    }
}

pub struct Kernel {
    panicked: AtomicBool,

    pub printer: Spinlock<Printer>,

    /// Timer ticks since boot; sleepers on sys_sleep wait on this lock's
    /// channel.
    ticks: Sleepablelock<u32>,

    /// Core map + swap map + victim PRNG, under one lock.
    kmem: Spinlock<Kmem>,

    bcache: Bcache,

    ftable: FileTable,

    devsw: DevswTable,

    fs: FileSystem,

    procs: Procs,

    // The `Cpu` of the executing CPU is mutated through a shared kernel
    // reference, always with interrupts disabled.
    cpus: [UnsafeCell<Cpu>; NCPU],

    disk: Once<&'static dyn BlockDevice>,
}

// SAFETY: `cpus` entries are only touched by their own CPU with interrupts
// off; everything else is behind its own lock.
unsafe impl Sync for Kernel {}

impl Kernel {
    pub const fn zero() -> Self {
        Self {
            panicked: AtomicBool::new(false),
            printer: Spinlock::new("println", Printer),
            ticks: Sleepablelock::new("time", 0),
            kmem: Spinlock::new("kmem", Kmem::new()),
            bcache: Bcache::new(),
            ftable: FileTable::new(),
            devsw: DevswTable::new(),
            fs: FileSystem::new(),
            procs: Procs::new(),
            cpus: array![_ => UnsafeCell::new(Cpu::new()); NCPU],
            disk: Once::new(),
        }
    }

    pub fn kmem(&self) -> &Spinlock<Kmem> {
        &self.kmem
    }

    pub fn ticks(&self) -> &Sleepablelock<u32> {
        &self.ticks
    }

    pub fn procs(&'static self) -> &'static Procs {
        &self.procs
    }

    pub fn fs(&'static self) -> &'static FileSystem {
        &self.fs
    }

    pub fn ftable(&'static self) -> &'static FileTable {
        &self.ftable
    }

    pub fn devsw(&self) -> &DevswTable {
        &self.devsw
    }

    pub fn set_disk(&self, disk: &'static dyn BlockDevice) {
        let _ = self.disk.call_once(|| disk);
    }

    pub fn disk(&self) -> &'static dyn BlockDevice {
        *self.disk.get().expect("kernel: no disk")
    }

    /// A locked buffer with block (dev, blockno).
    pub fn bread(&'static self, dev: u32, blockno: u32, ctx: &KernelCtx) -> Buf {
        self.bcache.get(self.disk(), dev, blockno, ctx)
    }

    /// This CPU's `Cpu` slot. The pointer is only dereferenced with
    /// interrupts off.
    pub fn mycpu(&self) -> *mut Cpu {
        self.cpus[arch::cpu_id()].get()
    }

    /// Timer tick: bump the counter and wake sys_sleep sleepers.
    pub fn clock_intr(&'static self) {
        let mut ticks = self.ticks.lock();
        *ticks = ticks.wrapping_add(1);
        ticks.wakeup(self);
    }

    fn panic(&self) {
        self.panicked.store(true, Ordering::Release);
    }

    pub fn is_panicked(&self) -> bool {
        self.panicked.load(Ordering::Acquire)
    }

    /// Prints the given formatted string with the printer. A panicking
    /// kernel bypasses the lock so the diagnostics always come out.
    pub fn printer_write_fmt(&self, args: fmt::Arguments<'_>) -> fmt::Result {
        if self.is_panicked() {
            // SAFETY: other CPUs stopped printing when `panicked` was set.
            unsafe { (*self.printer.get_mut_raw()).write_fmt(args) }
        } else {
            self.printer.lock().write_fmt(args)
        }
    }
}

/// The kernel singleton. Kernel paths receive a handle through their
/// `KernelCtx`; this accessor is for the entry points that have none yet
/// (boot, trap entry, forkret) and for the print macros.
static KERNEL: Kernel = Kernel::zero();

#[inline]
pub fn kernel() -> &'static Kernel {
    &KERNEL
}

/// print! macro prints to the console.
#[macro_export]
macro_rules! print {
    ($($arg:tt)*) => {{
        let _ = $crate::kernel::kernel().printer_write_fmt(format_args!($($arg)*));
    }};
}

/// println! macro prints to the console.
#[macro_export]
macro_rules! println {
    () => ($crate::print!("\n"));
    ($($arg:tt)*) => ($crate::print!("{}\n", format_args!($($arg)*)));
}

/// Handles panic.
#[cfg(all(not(test), target_os = "none"))]
#[panic_handler]
fn panic_handler(info: &core::panic::PanicInfo<'_>) -> ! {
    // Freeze printing on other CPUs.
    kernel().panic();
    println!("{}", info);
    arch::halt()
}

#[cfg(target_os = "none")]
mod boot {
    use core::sync::atomic::{AtomicBool, Ordering};

    use super::*;
    use crate::bio::BufData;

    extern "C" {
        // The E820-derived physical range handed over by the boot path.
        fn boot_memory_range(start: *mut usize, end: *mut usize);

        // ide.c: synchronous 512-byte block access.
        fn ide_read_block(blockno: u32, buf: *mut u8);
        fn ide_write_block(blockno: u32, buf: *const u8);
    }

    /// The IDE disk, by its out-of-scope driver interface.
    struct IdeDisk;

    impl BlockDevice for IdeDisk {
        fn read(&self, blockno: u32, buf: &mut BufData) {
            // SAFETY: the driver fills exactly BSIZE bytes.
            unsafe { ide_read_block(blockno, buf.as_mut_ptr()) };
        }

        fn write(&self, blockno: u32, buf: &BufData) {
            // SAFETY: the driver reads exactly BSIZE bytes.
            unsafe { ide_write_block(blockno, buf.as_ptr()) };
        }
    }

    static IDE_DISK: IdeDisk = IdeDisk;

    /// The boot path jumps here on every CPU once the early mode switch is
    /// done.
    #[no_mangle]
    pub unsafe extern "C" fn kernel_main() -> ! {
        static STARTED: AtomicBool = AtomicBool::new(false);

        if arch::cpu_id() == 0 {
            println!();
            println!("rx64 kernel is booting");
            println!();

            let mut start = 0;
            let mut end = 0;
            // SAFETY: the boot path recorded the usable range.
            unsafe { boot_memory_range(&mut start, &mut end) };
            let end = core::cmp::min(end, start + crate::param::PHYSCAP);
            // SAFETY: the range is unused memory and this runs once.
            unsafe { kernel().kmem().lock().init(arch::p2v(start), arch::p2v(end)) };

            kernel().set_disk(&IDE_DISK);

            // First user process; the file system mounts on its first
            // return to user space.
            kernel().procs().user_init(kernel());

            STARTED.store(true, Ordering::Release);
        } else {
            while !STARTED.load(Ordering::Acquire) {
                core::hint::spin_loop();
            }
        }

        kernel().procs().scheduler(kernel())
    }
}
