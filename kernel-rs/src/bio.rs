//! Buffer cache.
//!
//! The buffer cache is a fixed pool of buffers holding cached copies of
//! disk block contents. Caching disk blocks in memory reduces the number
//! of disk reads and also provides a synchronization point for blocks used
//! by multiple processes.
//!
//! Interface:
//! * To get a buffer for a particular disk block, call `Kernel::bread`.
//! * After changing buffer data, call `Buf::write` to write it to disk.
//! * A dropped `Buf` releases the buffer; do not hold buffers longer than
//!   necessary.
//!
//! For any (dev, blockno) at most one cache entry exists, and all mutators
//! hold its sleeplock.

use core::mem::ManuallyDrop;
use core::ops::{Deref, DerefMut};

use array_macro::array;

use crate::lock::{Sleeplock, SleeplockGuard, Spinlock};
use crate::param::{BSIZE, NBUF};
use crate::proc::KernelCtx;

/// The synchronous 512-byte block interface the disk driver exposes.
/// The IDE driver lives outside this crate; tests provide a RAM-backed
/// implementation.
pub trait BlockDevice: Sync {
    fn read(&self, blockno: u32, buf: &mut BufData);
    fn write(&self, blockno: u32, buf: &BufData);
}

// The logging layer reads u32 block numbers straight out of buffer data.
#[repr(align(8))]
pub struct BufData {
    bytes: [u8; BSIZE],
}

impl BufData {
    pub const fn zeroed() -> Self {
        Self { bytes: [0; BSIZE] }
    }
}

impl Deref for BufData {
    type Target = [u8; BSIZE];

    fn deref(&self) -> &Self::Target {
        &self.bytes
    }
}

impl DerefMut for BufData {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.bytes
    }
}

pub struct BufInner {
    /// Has data been read from disk?
    valid: bool,
    pub data: BufData,
}

impl BufInner {
    const fn new() -> Self {
        Self {
            valid: false,
            data: BufData::zeroed(),
        }
    }
}

struct BufCtrl {
    dev: u32,
    blockno: u32,
    refcnt: u32,
    /// Release stamp for LRU recycling.
    last_use: u64,
}

struct BcacheCtl {
    entries: [BufCtrl; NBUF],
    stamp: u64,
}

pub struct Bcache {
    ctl: Spinlock<BcacheCtl>,
    inner: [Sleeplock<BufInner>; NBUF],
}

impl Bcache {
    pub const fn new() -> Self {
        Self {
            ctl: Spinlock::new("bcache", BcacheCtl {
                entries: array![_ => BufCtrl { dev: 0, blockno: 0, refcnt: 0, last_use: 0 }; NBUF],
                stamp: 0,
            }),
            inner: array![_ => Sleeplock::new("buffer", BufInner::new()); NBUF],
        }
    }

    /// Return a locked buffer with the contents of the indicated block.
    pub fn get(
        &'static self,
        disk: &'static dyn BlockDevice,
        dev: u32,
        blockno: u32,
        ctx: &KernelCtx,
    ) -> Buf {
        let idx = {
            let mut ctl = self.ctl.lock();

            // Is the block already cached?
            let mut found = None;
            for (i, e) in ctl.entries.iter().enumerate() {
                if e.refcnt > 0 || e.last_use > 0 {
                    if e.dev == dev && e.blockno == blockno {
                        found = Some(i);
                        break;
                    }
                }
            }
            match found {
                Some(i) => {
                    ctl.entries[i].refcnt += 1;
                    i
                }
                None => {
                    // Recycle the least recently released buffer.
                    let mut lru: Option<usize> = None;
                    for (i, e) in ctl.entries.iter().enumerate() {
                        if e.refcnt == 0
                            && lru.map_or(true, |j| e.last_use < ctl.entries[j].last_use)
                        {
                            lru = Some(i);
                        }
                    }
                    let i = lru.expect("bread: no buffers");
                    let e = &mut ctl.entries[i];
                    e.dev = dev;
                    e.blockno = blockno;
                    e.refcnt = 1;
                    // SAFETY: refcnt was 0, so no one holds or waits on the
                    // sleeplock; the stale contents must not be served for
                    // the new block.
                    unsafe { (*self.inner[i].get_mut_raw()).valid = false };
                    i
                }
            }
        };

        let mut guard = self.inner[idx].lock(ctx);
        if !guard.valid {
            disk.read(blockno, &mut guard.data);
            guard.valid = true;
        }
        Buf {
            cache: self,
            disk,
            idx,
            dev,
            blockno,
            guard: ManuallyDrop::new(guard),
        }
    }

    fn release(&self, idx: usize) {
        let mut ctl = self.ctl.lock();
        ctl.stamp += 1;
        let stamp = ctl.stamp;
        let e = &mut ctl.entries[idx];
        debug_assert!(e.refcnt >= 1, "brelse");
        e.refcnt -= 1;
        e.last_use = stamp;
    }
}

/// A locked buffer. Dropping it releases the buffer.
pub struct Buf {
    cache: &'static Bcache,
    disk: &'static dyn BlockDevice,
    idx: usize,
    dev: u32,
    blockno: u32,
    guard: ManuallyDrop<SleeplockGuard<'static, BufInner>>,
}

impl Buf {
    pub fn blockno(&self) -> u32 {
        self.blockno
    }

    pub fn dev(&self) -> u32 {
        self.dev
    }

    pub fn data(&self) -> &BufData {
        &self.guard.data
    }

    pub fn data_mut(&mut self) -> &mut BufData {
        &mut self.guard.data
    }

    /// Write the buffer's contents through to disk, synchronously.
    pub fn write(&mut self) {
        self.disk.write(self.blockno, &self.guard.data);
    }
}

impl Drop for Buf {
    fn drop(&mut self) {
        // SAFETY: the guard is not used again.
        unsafe { ManuallyDrop::drop(&mut self.guard) };
        self.cache.release(self.idx);
    }
}

#[cfg(test)]
mod tests {
    use crate::param::ROOTDEV;
    use crate::testing::{boot, ramdisk_with};

    #[test]
    fn cached_reads_and_write_through() {
        let disk = ramdisk_with(&[]);
        let (kernel, ctx) = boot(disk, 64);
        let block = kernel.fs().superblock().inodestart + 64;

        {
            let mut buf = kernel.bread(ROOTDEV, block, &ctx);
            buf.data_mut()[0] = 0x5a;
            buf.write();
        }

        // Cached copy.
        assert_eq!(kernel.bread(ROOTDEV, block, &ctx).data()[0], 0x5a);
        // And the write went through to the device.
        assert_eq!(disk.image()[block as usize * crate::param::BSIZE], 0x5a);
    }

    /// Recycling evicts the oldest released buffer, and a recycled block
    /// is re-read from disk.
    #[test]
    fn lru_recycling_rereads_from_disk() {
        let disk = ramdisk_with(&[]);
        let (kernel, ctx) = boot(disk, 64);
        let base = kernel.fs().superblock().inodestart + 64;

        {
            let mut buf = kernel.bread(ROOTDEV, base, &ctx);
            buf.data_mut()[0] = 1;
            buf.write();
        }

        // Touch more blocks than the cache holds.
        for i in 1..=(crate::param::NBUF as u32 + 4) {
            let _ = kernel.bread(ROOTDEV, base + i, &ctx);
        }

        // The original block was recycled; the fresh read must still see
        // the written byte because bwrite is write-through.
        assert_eq!(kernel.bread(ROOTDEV, base, &ctx).data()[0], 1);
    }
}
