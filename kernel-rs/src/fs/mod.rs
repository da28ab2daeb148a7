//! File system implementation. Five layers:
//!   + Blocks: extent allocator over the on-disk free bitmap.
//!   + Log: crash recovery for multi-step updates.
//!   + Files: the inode file, inode reading, writing, metadata.
//!   + Directories: inodes whose content is a list of other inodes.
//!   + Names: paths like /README for convenient naming.
//!
//! Mutating calls are bracketed by a transaction; `begin_tx` takes the log
//! sleeplock so one transaction runs at a time.

use spin::Once;
use zerocopy::AsBytes;

use crate::kernel::Kernel;
use crate::lock::Sleeplock;
use crate::param::EXTBLKS;
use crate::proc::KernelCtx;

mod inode;
mod log;
mod path;
mod superblock;

use inode::balloc;
pub use inode::{
    Dinode, Dirent, Extent, InodeGuard, InodeInner, InodeType, Itable, RcInode, DIRSIZ,
    INODEFILEINO, INODESZ, ROOTINO,
};
pub use log::{recover, Log, Tx};
pub use path::{FileName, Path};
pub use superblock::{Superblock, BPB};

pub struct FileSystem {
    /// Initializing the superblock runs only once; forkret calls init on
    /// the first return to user space.
    superblock: Once<Superblock>,
    log: Once<Sleeplock<Log>>,
    inodefile: Once<RcInode>,
    dev: Once<u32>,
    pub itable: Itable,
}

impl FileSystem {
    pub const fn new() -> Self {
        Self {
            superblock: Once::new(),
            log: Once::new(),
            inodefile: Once::new(),
            dev: Once::new(),
            itable: Itable::new(),
        }
    }

    /// Mount: read the superblock, run log recovery, and pin the inode
    /// file's cache entry. Idempotent; runs in process context because it
    /// sleeps on disk I/O.
    pub fn init(&'static self, dev: u32, ctx: &KernelCtx) {
        if self.superblock.is_completed() {
            return;
        }
        let kernel = ctx.kernel();
        let _ = self.dev.call_once(|| dev);
        let sb = self.superblock.call_once(|| {
            let buf = kernel.bread(dev, 1, ctx);
            Superblock::read(&buf)
        });
        let _ = self
            .log
            .call_once(|| Sleeplock::new("log", recover(kernel, dev, sb.logstart, ctx)));

        let _ = self.inodefile.call_once(|| {
            let ip = self.itable.get(dev, INODEFILEINO);
            // Fault the dinode in once so its extents are cached.
            drop(ip.lock(ctx));
            ip
        });
    }

    pub fn superblock(&self) -> &Superblock {
        self.superblock.get().expect("fs: no superblock")
    }

    pub fn dev(&self) -> u32 {
        *self.dev.get().expect("fs: not mounted")
    }

    fn log(&self) -> &Sleeplock<Log> {
        self.log.get().expect("fs: no log")
    }

    pub fn inodefile(&self) -> &RcInode {
        self.inodefile.get().expect("fs: no inode file")
    }

    /// The inode file's extents and size. Takes the inode file's lock
    /// unless the calling process already holds it (the path that updates
    /// the inode file itself).
    pub fn inodefile_meta(&self, ctx: &KernelCtx) -> ([Extent; crate::param::NEXTENT], u32) {
        let file = self.inodefile();
        let lock = file.sleeplock();
        if lock.holding(ctx) {
            // SAFETY: this process holds the sleeplock.
            let inner = unsafe { &*lock.get_mut_raw() };
            (inner.extents, inner.size)
        } else {
            let guard = file.lock(ctx);
            (guard.extents, guard.size)
        }
    }

    /// Begin a transaction; at most one runs at a time.
    pub fn begin_tx(&'static self, ctx: &KernelCtx) -> Tx {
        Tx::begin(ctx.kernel(), self.log().lock(ctx), ctx)
    }

    /// Arm the test-only crash countdown: panic after `n` journaled writes.
    pub fn set_crashn(&'static self, n: i32, ctx: &KernelCtx) {
        let mut log = self.log().lock(ctx);
        log.set_crash_countdown(n);
    }

    /// The root directory.
    pub fn root(&'static self, _ctx: &KernelCtx) -> RcInode {
        self.itable.get(self.dev(), ROOTINO)
    }

    /// Append a fresh dinode of `typ` (with one pre-allocated extent) to
    /// the inode file and return a handle on the new inode.
    pub fn alloc_inode(
        &'static self,
        typ: InodeType,
        tx: &mut Tx,
        ctx: &KernelCtx,
    ) -> Result<RcInode, ()> {
        let mut dinode = Dinode::default();
        dinode.typ = typ.to_disk();
        dinode.extents[0] = Extent {
            start: balloc(tx, ctx),
            nblocks: EXTBLKS,
        };

        let file = self.inodefile().clone();
        let mut guard = file.lock(ctx);
        let inum = guard.size() / INODESZ as u32;
        let n = guard.write_bytes(inum * INODESZ as u32, dinode.as_bytes(), tx, ctx)?;
        if n != INODESZ {
            return Err(());
        }
        drop(guard);

        Ok(self.itable.get(self.dev(), inum))
    }

    /// Create (or open, if it exists) a file at the root directory: append
    /// a dinode to the inode file, then a directory entry to the root.
    /// Runs inside the caller's transaction.
    pub fn create_file(
        &'static self,
        path: &Path,
        tx: &mut Tx,
        ctx: &KernelCtx,
    ) -> Result<RcInode, ()> {
        let (dir, name) = path.nameiparent(ctx)?;
        let mut dp = dir.lock(ctx);

        if let Ok((ip, _off)) = dp.dirlookup(name, ctx) {
            return Ok(ip);
        }

        let ip = self.alloc_inode(InodeType::File, tx, ctx)?;
        dp.dirlink(name, ip.inum, tx, ctx)?;
        Ok(ip)
    }
}

#[cfg(test)]
mod tests {
    use std::vec;
    use std::vec::Vec;

    use super::*;
    use crate::param::BSIZE;
    use crate::testing::{boot, ramdisk_with};

    fn path(bytes: &[u8]) -> &Path {
        // SAFETY: test paths contain no NUL.
        unsafe { Path::from_bytes(bytes) }
    }

    #[test]
    fn skipelem_tokenizes_paths() {
        let (rest, name) = path(b"a/bb/c").skipelem().unwrap();
        assert_eq!(name.as_bytes(), b"a");
        assert_eq!(rest.as_bytes(), b"bb/c");

        let (rest, name) = path(b"///a//bb").skipelem().unwrap();
        assert_eq!(name.as_bytes(), b"a");
        assert_eq!(rest.as_bytes(), b"bb");

        let (rest, name) = path(b"a").skipelem().unwrap();
        assert_eq!(name.as_bytes(), b"a");
        assert!(rest.as_bytes().is_empty());

        assert!(path(b"").skipelem().is_none());
        assert!(path(b"////").skipelem().is_none());
    }

    #[test]
    fn namei_finds_seeded_files() {
        let disk = ramdisk_with(&[("README", b"hello fs"), ("other", b"x")]);
        let (_kernel, ctx) = boot(disk, 64);

        let ip = path(b"/README").namei(&ctx).unwrap();
        let mut guard = ip.lock(&ctx);
        assert_eq!(guard.typ(), InodeType::File);
        assert_eq!(guard.size(), 8);

        let mut buf = [0u8; 16];
        let n = guard.read_bytes(0, &mut buf, &ctx);
        assert_eq!(n, 8);
        assert_eq!(&buf[..8], b"hello fs");

        // Reads at and beyond EOF return nothing.
        assert_eq!(guard.read_bytes(8, &mut buf, &ctx), 0);

        drop(guard);
        assert!(path(b"/missing").namei(&ctx).is_err());
        assert!(path(b"/README/deeper").namei(&ctx).is_err());
    }

    #[test]
    fn reads_cross_block_boundaries() {
        let mut data = vec![0u8; 3 * BSIZE];
        for (i, b) in data.iter_mut().enumerate() {
            *b = (i % 251) as u8;
        }
        let disk = ramdisk_with(&[("blob", &data)]);
        let (_kernel, ctx) = boot(disk, 64);

        let ip = path(b"/blob").namei(&ctx).unwrap();
        let mut guard = ip.lock(&ctx);

        let mut got = [0u8; 100];
        let n = guard.read_bytes(BSIZE as u32 - 50, &mut got, &ctx);
        assert_eq!(n, 100);
        assert_eq!(&got[..], &data[BSIZE - 50..BSIZE + 50]);
    }

    #[test]
    fn create_write_read_roundtrip() {
        let disk = ramdisk_with(&[]);
        let (kernel, ctx) = boot(disk, 64);

        let ip = {
            let mut tx = kernel.fs().begin_tx(&ctx);
            let ip = kernel.fs().create_file(path(b"/notes"), &mut tx, &ctx).unwrap();
            tx.end(&ctx);
            ip
        };

        let payload = b"read after write";
        {
            let mut tx = kernel.fs().begin_tx(&ctx);
            let mut guard = ip.lock(&ctx);
            assert_eq!(
                guard.write_bytes(0, payload, &mut tx, &ctx).unwrap(),
                payload.len()
            );
            drop(guard);
            tx.end(&ctx);
        }

        // Visible through a fresh lookup.
        let again = path(b"/notes").namei(&ctx).unwrap();
        assert_eq!(again.inum, ip.inum);
        let mut guard = again.lock(&ctx);
        let mut got = [0u8; 32];
        let n = guard.read_bytes(0, &mut got, &ctx);
        assert_eq!(&got[..n], payload);
    }

    #[test]
    fn create_of_existing_file_returns_it() {
        let disk = ramdisk_with(&[("seed", b"abc")]);
        let (kernel, ctx) = boot(disk, 64);

        let mut tx = kernel.fs().begin_tx(&ctx);
        let ip = kernel.fs().create_file(path(b"/seed"), &mut tx, &ctx).unwrap();
        tx.end(&ctx);
        assert_eq!(ip.inum, 2);
    }

    /// Growing a file past one extent allocates another 32-block extent;
    /// the data survives a remount.
    #[test]
    fn writes_span_extents_and_persist() {
        let disk = ramdisk_with(&[]);
        let (kernel, ctx) = boot(disk, 96);

        let ip = {
            let mut tx = kernel.fs().begin_tx(&ctx);
            let ip = kernel.fs().create_file(path(b"/big"), &mut tx, &ctx).unwrap();
            tx.end(&ctx);
            ip
        };

        // 40 blocks of patterned data: extent 0 (pre-allocated) plus one
        // more. Written in log-sized chunks like the file layer does.
        let total = 40 * BSIZE;
        let chunk = 8 * BSIZE;
        let mut expect = Vec::new();
        let mut off = 0usize;
        while off < total {
            let data: Vec<u8> = (0..chunk).map(|i| ((off + i) % 239) as u8).collect();
            let mut tx = kernel.fs().begin_tx(&ctx);
            let mut guard = ip.lock(&ctx);
            assert_eq!(
                guard.write_bytes(off as u32, &data, &mut tx, &ctx).unwrap(),
                chunk
            );
            drop(guard);
            tx.end(&ctx);
            expect.extend_from_slice(&data);
            off += chunk;
        }

        {
            let mut guard = ip.lock(&ctx);
            assert_eq!(guard.size() as usize, total);
            let sb = kernel.fs().superblock();
            for e in guard.extents.iter().take(2) {
                assert!(e.nblocks == crate::param::EXTBLKS);
                assert!(e.start > sb.inodestart && e.start + e.nblocks <= sb.swapstart);
            }
        }

        // Remount and read everything back.
        let disk2: &'static crate::testing::RamDisk = std::boxed::Box::leak(
            std::boxed::Box::new(crate::testing::RamDisk::from_image(disk.image())),
        );
        let (_kernel2, ctx2) = boot(disk2, 96);
        let ip2 = path(b"/big").namei(&ctx2).unwrap();
        let mut guard = ip2.lock(&ctx2);
        let mut got = vec![0u8; total];
        assert_eq!(guard.read_bytes(0, &mut got, &ctx2), total);
        assert_eq!(got, expect);
    }

    /// A file is at most six extents; a write needing a seventh fails.
    #[test]
    fn seventh_extent_write_fails() {
        let disk = ramdisk_with(&[]);
        let (kernel, ctx) = boot(disk, 64);

        let ip = {
            let mut tx = kernel.fs().begin_tx(&ctx);
            let ip = kernel.fs().create_file(path(b"/cap"), &mut tx, &ctx).unwrap();
            tx.end(&ctx);
            ip
        };

        let max = 6 * crate::param::EXTBLKS as usize * BSIZE;

        // Fill to the last byte, one extent-sized stride at a time so each
        // transaction stays within the log.
        let stride = 8 * BSIZE;
        let zeros = vec![7u8; stride];
        let mut off = 0;
        while off < max {
            let mut tx = kernel.fs().begin_tx(&ctx);
            let mut guard = ip.lock(&ctx);
            guard
                .write_bytes(off as u32, &zeros, &mut tx, &ctx)
                .unwrap();
            drop(guard);
            tx.end(&ctx);
            off += stride;
        }

        let mut tx = kernel.fs().begin_tx(&ctx);
        let mut guard = ip.lock(&ctx);
        assert!(guard.write_bytes(max as u32, b"x", &mut tx, &ctx).is_err());
        drop(guard);
        tx.end(&ctx);
    }

    #[test]
    fn fstat_reports_inode_metadata() {
        let disk = ramdisk_with(&[("f", b"12345")]);
        let (_kernel, ctx) = boot(disk, 64);
        let ip = path(b"/f").namei(&ctx).unwrap();
        let guard = ip.lock(&ctx);
        let st = guard.stat();
        assert_eq!(st.inum, 2);
        assert_eq!(st.size, 5);
        assert_eq!(st.typ, InodeType::File.to_disk());
    }
}
