//! The redo log.
//!
//! A transaction brackets a sequence of block updates and makes them atomic
//! over power loss. One writer at a time holds the log sleeplock through
//! its whole transaction.
//!
//! The on-disk log region is one header block followed by `LOGBLKS` data
//! slots. `Tx::write` appends the target block number to the header and
//! copies the block's contents into the next slot, persisting the slot
//! before the header. `Tx::end` persists `committed=1` (the real commit
//! point), copies each slot to its home block, then clears the header.
//! Recovery at mount replays the slots iff the header says committed.

use core::mem::{self, ManuallyDrop};

use static_assertions::const_assert;
use zerocopy::{AsBytes, FromBytes};

use crate::kernel::Kernel;
use crate::lock::SleeplockGuard;
use crate::param::{BSIZE, LOGBLKS};
use crate::proc::KernelCtx;

#[repr(C)]
#[derive(Copy, Clone, AsBytes, FromBytes)]
pub struct LogHeader {
    committed: i16,
    _pad: u16,
    nchanges: u32,
    blocknos: [u32; LOGBLKS],
}

const_assert!(mem::size_of::<LogHeader>() <= BSIZE);

impl LogHeader {
    const fn empty() -> Self {
        Self {
            committed: 0,
            _pad: 0,
            nchanges: 0,
            blocknos: [0; LOGBLKS],
        }
    }
}

pub struct Log {
    dev: u32,

    /// Block number of the log header; slots follow it.
    start: u32,

    /// In-memory mirror of the header while a transaction is open.
    header: LogHeader,

    /// Journaled writes left until a deliberate crash (the crashn test
    /// syscall). Zero or negative means disabled.
    crash_countdown: i32,
}

impl Log {
    pub const fn new(dev: u32, start: u32) -> Self {
        Self {
            dev,
            start,
            header: LogHeader::empty(),
            crash_countdown: -1,
        }
    }

    pub fn set_crash_countdown(&mut self, n: i32) {
        self.crash_countdown = n;
    }

    fn slot_block(&self, slot: usize) -> u32 {
        self.start + 1 + slot as u32
    }
}

fn write_head(kernel: &'static Kernel, log: &Log, ctx: &KernelCtx) {
    let mut buf = kernel.bread(log.dev, log.start, ctx);
    buf.data_mut()[..mem::size_of::<LogHeader>()].copy_from_slice(log.header.as_bytes());
    buf.write();
}

/// Copy every committed slot to its home block and flush.
fn install(kernel: &'static Kernel, log: &Log, ctx: &KernelCtx) {
    for i in 0..log.header.nchanges as usize {
        let slot = kernel.bread(log.dev, log.slot_block(i), ctx);
        let mut home = kernel.bread(log.dev, log.header.blocknos[i], ctx);
        home.data_mut().copy_from_slice(&slot.data()[..]);
        home.write();
    }
}

/// Run once at mount, before any mutator: if a committed transaction is in
/// the log, replay it; then clear the header. A crash before commit leaves
/// the home blocks untouched; a crash after the header was cleared is a
/// no-op; anything in between replays to the post-transaction state.
pub fn recover(kernel: &'static Kernel, dev: u32, start: u32, ctx: &KernelCtx) -> Log {
    let mut log = Log::new(dev, start);
    {
        let buf = kernel.bread(dev, start, ctx);
        log.header
            .as_bytes_mut()
            .copy_from_slice(&buf.data()[..mem::size_of::<LogHeader>()]);
    }
    if log.header.committed == 1 {
        install(kernel, &log, ctx);
    }
    log.header = LogHeader::empty();
    write_head(kernel, &log, ctx);
    log
}

/// An open transaction: the exclusive license to mutate the file system.
/// Must be finished explicitly with `end`; callers on error paths wrap it
/// in a scopeguard.
pub struct Tx {
    kernel: &'static Kernel,
    guard: ManuallyDrop<SleeplockGuard<'static, Log>>,
}

impl Tx {
    /// Opens a transaction: takes the log and clears the on-disk header.
    pub fn begin(
        kernel: &'static Kernel,
        mut guard: SleeplockGuard<'static, Log>,
        ctx: &KernelCtx,
    ) -> Tx {
        guard.header = LogHeader::empty();
        write_head(kernel, &guard, ctx);
        Tx {
            kernel,
            guard: ManuallyDrop::new(guard),
        }
    }

    /// Journal `buf`: record its block number and copy its contents into a
    /// log slot (slot first, then the updated header). The home block is
    /// written only by `end`.
    pub fn write(&mut self, buf: crate::bio::Buf, ctx: &KernelCtx) {
        let n = self.guard.header.nchanges as usize;

        // Absorption: a block already in the transaction reuses its slot.
        let slot = (0..n)
            .find(|&i| self.guard.header.blocknos[i] == buf.blockno())
            .unwrap_or(n);
        assert!(slot < LOGBLKS, "too big a transaction");

        let slot_block = self.guard.slot_block(slot);
        let mut lb = self.kernel.bread(self.guard.dev, slot_block, ctx);
        lb.data_mut().copy_from_slice(&buf.data()[..]);
        lb.write();
        drop(lb);

        if slot == n {
            self.guard.header.blocknos[n] = buf.blockno();
            self.guard.header.nchanges += 1;
        }
        write_head(self.kernel, &self.guard, ctx);
        drop(buf);

        if self.guard.crash_countdown > 0 {
            self.guard.crash_countdown -= 1;
            if self.guard.crash_countdown == 0 {
                panic!("crashn");
            }
        }
    }

    /// Commit the transaction and release the log.
    pub fn end(mut self, ctx: &KernelCtx) {
        if self.guard.header.nchanges > 0 {
            // The real commit point.
            self.guard.header.committed = 1;
            write_head(self.kernel, &self.guard, ctx);

            install(self.kernel, &self.guard, ctx);

            self.guard.header = LogHeader::empty();
            write_head(self.kernel, &self.guard, ctx);
        }
        // SAFETY: self is forgotten below; the guard is not used again.
        let guard = unsafe { ManuallyDrop::take(&mut self.guard) };
        drop(guard);
        mem::forget(self);
    }
}

impl Drop for Tx {
    fn drop(&mut self) {
        panic!("transaction dropped without end");
    }
}

#[cfg(test)]
mod tests {
    use std::boxed::Box;
    use std::vec::Vec;

    use crate::param::{EXTBLKS, ROOTDEV};
    use crate::testing::{boot, mkfs, ramdisk_with, CrashDisk, RamDisk};

    const PATTERN: &[u8] = b"journaled block";

    /// First block of the free data area in a fresh image: right after the
    /// inode-file and root-directory extents.
    fn scratch_block(kernel: &'static crate::kernel::Kernel) -> u32 {
        kernel.fs().superblock().inodestart + 2 * EXTBLKS
    }

    /// One transaction rewriting one data block, via a kernel booted on
    /// `disk`.
    fn write_one_block(disk: &'static dyn crate::bio::BlockDevice) -> u32 {
        let (kernel, ctx) = boot(disk, 64);
        let block = scratch_block(kernel);
        let mut tx = kernel.fs().begin_tx(&ctx);
        let mut buf = kernel.bread(ROOTDEV, block, &ctx);
        buf.data_mut()[..PATTERN.len()].copy_from_slice(PATTERN);
        tx.write(buf, &ctx);
        tx.end(&ctx);
        block
    }

    fn block_bytes(image: &[u8], block: u32, n: usize) -> &[u8] {
        let off = block as usize * crate::param::BSIZE;
        &image[off..off + n]
    }

    #[test]
    fn committed_writes_reach_home_blocks() {
        let disk = ramdisk_with(&[]);
        let block = write_one_block(disk);
        assert_eq!(block_bytes(&disk.image(), block, PATTERN.len()), PATTERN);
    }

    #[test]
    fn remount_after_clean_commit_is_a_noop() {
        let disk = ramdisk_with(&[]);
        let block = write_one_block(disk);

        // "Reboot": mount a second kernel over the same image.
        let disk2: &'static RamDisk = Box::leak(Box::new(RamDisk::from_image(disk.image())));
        let (kernel2, ctx2) = boot(disk2, 64);
        let buf = kernel2.bread(ROOTDEV, block, &ctx2);
        assert_eq!(&buf.data()[..PATTERN.len()], PATTERN);
    }

    /// Power loss before the commit record: the home block must read as if
    /// the transaction never happened.
    #[test]
    fn crash_before_commit_preserves_pre_state() {
        // Write counts for one single-block transaction: mount header
        // clear (1), begin_tx header clear (1), log slot + header (2),
        // commit record (1), home install (1), final header clear (1).
        // Allowing 4 writes loses power after the slot and header are
        // persisted but before committed=1.
        let disk: &'static CrashDisk = Box::leak(Box::new(CrashDisk::new(mkfs(&[]), 4)));
        let block = write_one_block(disk);
        assert!(disk.crashed());

        let disk2: &'static RamDisk = Box::leak(Box::new(RamDisk::from_image(disk.image())));
        let (kernel2, ctx2) = boot(disk2, 64);
        let buf = kernel2.bread(ROOTDEV, block, &ctx2);
        assert!(buf.data()[..PATTERN.len()].iter().all(|&b| b == 0));
    }

    /// Power loss after committed=1 but before the home blocks: recovery
    /// must replay the log and produce the post-transaction state.
    #[test]
    fn crash_after_commit_replays_on_recovery() {
        let disk: &'static CrashDisk = Box::leak(Box::new(CrashDisk::new(mkfs(&[]), 5)));
        let block = write_one_block(disk);
        assert!(disk.crashed());

        // The home block never made it to disk...
        assert!(block_bytes(&disk.image(), block, PATTERN.len())
            .iter()
            .all(|&b| b == 0));

        // ...but recovery replays the committed log.
        let disk2: &'static RamDisk = Box::leak(Box::new(RamDisk::from_image(disk.image())));
        let (kernel2, ctx2) = boot(disk2, 64);
        let buf = kernel2.bread(ROOTDEV, block, &ctx2);
        assert_eq!(&buf.data()[..PATTERN.len()], PATTERN);
    }

    /// Transactions absorb repeated writes of the same block.
    #[test]
    fn absorption_reuses_the_slot() {
        let disk = ramdisk_with(&[]);
        let (kernel, ctx) = boot(disk, 64);
        let block = scratch_block(kernel);

        let mut tx = kernel.fs().begin_tx(&ctx);
        for round in 0..(super::LOGBLKS as u8 + 3) {
            let mut buf = kernel.bread(ROOTDEV, block, &ctx);
            buf.data_mut()[0] = round;
            tx.write(buf, &ctx);
        }
        tx.end(&ctx);

        let image = disk.image();
        assert_eq!(block_bytes(&image, block, 1)[0], super::LOGBLKS as u8 + 2);
    }

    fn collect_image(disk: &RamDisk) -> Vec<u8> {
        disk.image()
    }

    #[test]
    fn recovery_clears_the_header() {
        let disk = ramdisk_with(&[]);
        let (kernel, ctx) = boot(disk, 64);
        let logstart = kernel.fs().superblock().logstart;
        write_one_block(disk);

        let image = collect_image(disk);
        let committed = i16::from_le_bytes([
            image[logstart as usize * crate::param::BSIZE],
            image[logstart as usize * crate::param::BSIZE + 1],
        ]);
        assert_eq!(committed, 0);
        drop(ctx);
    }
}
