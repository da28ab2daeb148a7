//! Open files.
//!
//! A `File` lives in the process-wide open-file table and is shared by
//! reference count: dup and fork increment, close decrements, and the
//! entry is torn down at zero. The entry carries what the descriptor
//! points at — an inode with a shared offset, a device, or one end of a
//! pipe.

use core::cell::UnsafeCell;
use core::cmp;
use core::mem;

use array_macro::array;

use crate::addr::UVAddr;
use crate::fs::{InodeType, RcInode};
use crate::lock::Spinlock;
use crate::param::{BSIZE, LOGBLKS, NDEV, NFILE};
use crate::pipe::AllocatedPipe;
use crate::proc::KernelCtx;
use crate::stat::Stat;

use zerocopy::AsBytes;

/// Most bytes one transaction may write: data blocks, plus slack for the
/// bitmap blocks of up to two fresh extents and the inode-file block.
const MAXWRITE: usize = (LOGBLKS - 4) * BSIZE;

/// Bounce buffer between user memory and the buffer cache.
const BOUNCE: usize = BSIZE;

pub enum FileType {
    None,
    Pipe { pipe: AllocatedPipe },
    Inode { ip: RcInode, off: UnsafeCell<u32> },
    Device { ip: RcInode, devid: i16 },
}

impl Default for FileType {
    fn default() -> Self {
        Self::None
    }
}

pub struct File {
    pub typ: FileType,
    readable: bool,
    writable: bool,
}

impl File {
    const fn zero() -> Self {
        Self {
            typ: FileType::None,
            readable: false,
            writable: false,
        }
    }
}

/// Map device ids to device read/write routines. CONSOLE is 1; the console
/// driver registers itself at boot.
#[derive(Copy, Clone)]
pub struct Devsw {
    pub read: Option<fn(&mut KernelCtx, UVAddr, usize) -> Result<usize, ()>>,
    pub write: Option<fn(&mut KernelCtx, UVAddr, usize) -> Result<usize, ()>>,
}

impl Devsw {
    pub const fn none() -> Self {
        Self {
            read: None,
            write: None,
        }
    }
}

pub struct DevswTable {
    table: Spinlock<[Devsw; NDEV]>,
}

impl DevswTable {
    pub const fn new() -> Self {
        Self {
            table: Spinlock::new("devsw", [Devsw::none(); NDEV]),
        }
    }

    pub fn register(&self, devid: usize, dev: Devsw) {
        self.table.lock()[devid] = dev;
    }

    pub fn get(&self, devid: i16) -> Option<Devsw> {
        let table = self.table.lock();
        table.get(devid as usize).copied()
    }
}

struct FCtrl {
    refcnt: u32,
}

/// The process-wide open-file table.
pub struct FileTable {
    ctl: Spinlock<[FCtrl; NFILE]>,
    files: [UnsafeCell<File>; NFILE],
}

// SAFETY: a `File` is written only while its refcnt is 0 (alloc) or drops
// to 0 (free); in between, entries are shared read-only apart from the
// offset cell, which the inode sleeplock guards.
unsafe impl Sync for FileTable {}

impl FileTable {
    pub const fn new() -> Self {
        Self {
            ctl: Spinlock::new("ftable", array![_ => FCtrl { refcnt: 0 }; NFILE]),
            files: array![_ => UnsafeCell::new(File::zero()); NFILE],
        }
    }

    /// Allocate a file structure.
    pub fn alloc(
        &'static self,
        typ: FileType,
        readable: bool,
        writable: bool,
    ) -> Result<RcFile, ()> {
        let mut ctl = self.ctl.lock();
        for (i, e) in ctl.iter_mut().enumerate() {
            if e.refcnt == 0 {
                e.refcnt = 1;
                // SAFETY: refcnt was 0, so no RcFile references this entry.
                unsafe {
                    *self.files[i].get() = File {
                        typ,
                        readable,
                        writable,
                    };
                }
                return Ok(RcFile {
                    table: self,
                    idx: i,
                });
            }
        }
        Err(())
    }
}

/// A counted reference to an open-file entry. Closing is explicit
/// (`free`); it may sleep on the pipe or inode teardown.
pub struct RcFile {
    table: &'static FileTable,
    idx: usize,
}

impl RcFile {
    fn file(&self) -> &File {
        // SAFETY: refcnt >= 1 while an RcFile exists, so the entry is not
        // being rewritten.
        unsafe { &*self.table.files[self.idx].get() }
    }

    pub fn readable(&self) -> bool {
        self.file().readable
    }

    pub fn writable(&self) -> bool {
        self.file().writable
    }

    /// Another reference to the same entry (dup, fork).
    pub fn clone_ref(&self) -> RcFile {
        let mut ctl = self.table.ctl.lock();
        ctl[self.idx].refcnt += 1;
        RcFile {
            table: self.table,
            idx: self.idx,
        }
    }

    /// Drop this reference; the last one tears the entry down.
    pub fn free(self, ctx: &KernelCtx) {
        let remaining = {
            let mut ctl = self.table.ctl.lock();
            debug_assert!(ctl[self.idx].refcnt >= 1);
            ctl[self.idx].refcnt -= 1;
            ctl[self.idx].refcnt
        };
        if remaining > 0 {
            return;
        }

        // SAFETY: refcnt reached 0 and self is the last handle.
        let file = unsafe { &mut *self.table.files[self.idx].get() };
        let writable = file.writable;
        match mem::take(&mut file.typ) {
            FileType::Pipe { pipe } => pipe.close(writable, ctx),
            FileType::Inode { ip, .. } | FileType::Device { ip, .. } => drop(ip),
            FileType::None => {}
        }
    }

    /// Install this file in the lowest free slot of the caller's
    /// descriptor table. Consumes (and on failure releases) the reference.
    pub fn fdalloc(self, ctx: &mut KernelCtx) -> Result<i32, ()> {
        let files = &mut ctx.proc_data_mut().files;
        for (fd, slot) in files.iter_mut().enumerate() {
            if slot.is_none() {
                *slot = Some(self);
                return Ok(fd as i32);
            }
        }
        self.free(ctx);
        Err(())
    }

    /// Read from the file into user memory at `addr`; advances the offset
    /// for inode files.
    pub fn read(&self, ctx: &mut KernelCtx, addr: UVAddr, n: usize) -> Result<usize, ()> {
        if !self.readable() {
            return Err(());
        }

        match &self.file().typ {
            FileType::Pipe { pipe } => pipe.read(ctx, addr, n),
            FileType::Device { devid, .. } => {
                let dev = ctx.kernel().devsw().get(*devid).ok_or(())?;
                (dev.read.ok_or(())?)(ctx, addr, n)
            }
            FileType::Inode { ip, off } => {
                let mut guard = ip.lock(ctx);
                // SAFETY: the inode lock guards the offset cell.
                let start = unsafe { *off.get() };
                let mut done = 0usize;
                let mut bounce = [0u8; BOUNCE];
                while done < n {
                    let m = cmp::min(n - done, BOUNCE);
                    let got = guard.read_bytes(start + done as u32, &mut bounce[..m], ctx);
                    if got == 0 {
                        break;
                    }
                    copy_out(ctx, addr + done, &bounce[..got])?;
                    done += got;
                    if got < m {
                        break;
                    }
                }
                // SAFETY: as above.
                unsafe { *off.get() = start + done as u32 };
                drop(guard);
                Ok(done)
            }
            FileType::None => panic!("File::read"),
        }
    }

    /// Write user memory at `addr` to the file. Large writes are split
    /// into several transactions so one transaction never outgrows the
    /// log.
    pub fn write(&self, ctx: &mut KernelCtx, addr: UVAddr, n: usize) -> Result<usize, ()> {
        if !self.writable() {
            return Err(());
        }

        match &self.file().typ {
            FileType::Pipe { pipe } => pipe.write(ctx, addr, n),
            FileType::Device { devid, .. } => {
                let dev = ctx.kernel().devsw().get(*devid).ok_or(())?;
                (dev.write.ok_or(())?)(ctx, addr, n)
            }
            FileType::Inode { ip, off } => {
                let fs = ctx.kernel().fs();
                let mut written = 0usize;
                while written < n {
                    let chunk = cmp::min(n - written, MAXWRITE);
                    let mut tx = fs.begin_tx(ctx);
                    let mut guard = ip.lock(ctx);
                    // SAFETY: the inode lock guards the offset cell.
                    let start = unsafe { *off.get() };

                    let mut done = 0usize;
                    let mut bounce = [0u8; BOUNCE];
                    let mut failed = false;
                    while done < chunk {
                        let m = cmp::min(chunk - done, BOUNCE);
                        if copy_in(ctx, addr + written + done, &mut bounce[..m]).is_err() {
                            failed = true;
                            break;
                        }
                        if guard
                            .write_bytes(start + done as u32, &bounce[..m], &mut tx, ctx)
                            .is_err()
                        {
                            failed = true;
                            break;
                        }
                        done += m;
                    }

                    // SAFETY: as above.
                    unsafe { *off.get() = start + done as u32 };
                    drop(guard);
                    tx.end(ctx);
                    if failed {
                        return Err(());
                    }
                    written += done;
                }
                Ok(n)
            }
            FileType::None => panic!("File::write"),
        }
    }

    /// Copy the file's metadata out to `addr`.
    pub fn stat(&self, ctx: &mut KernelCtx, addr: UVAddr) -> Result<(), ()> {
        match &self.file().typ {
            FileType::Inode { ip, .. } | FileType::Device { ip, .. } => {
                let st = {
                    let guard = ip.lock(ctx);
                    guard.stat()
                };
                copy_out(ctx, addr, st.as_bytes())
            }
            _ => Err(()),
        }
    }

    /// The inode behind this file, if it has one.
    pub fn inode_type(&self, ctx: &KernelCtx) -> Option<InodeType> {
        match &self.file().typ {
            FileType::Inode { ip, .. } | FileType::Device { ip, .. } => {
                let guard = ip.lock(ctx);
                Some(guard.typ())
            }
            _ => None,
        }
    }
}

pub use crate::vm::{copy_in, copy_in_str, copy_out};
