//! Inodes, extents and directories.
//!
//! On-disk inodes live in the inode file: inode 0 is the inode file
//! itself, inode 1 is the root directory, and the dinode of inode i is the
//! 64-byte record at byte i*64 of the inode file. A file's data lives in
//! up to six extents of 32 contiguous blocks each; files grow by appending
//! extents. There is no inode deletion: an inode lives forever on disk,
//! and the in-memory cache entry is recycled when its ref count drops to
//! zero.

use core::cmp;
use core::mem;

use static_assertions::const_assert;
use zerocopy::{AsBytes, FromBytes};

use super::Tx;
use crate::lock::{Sleeplock, SleeplockGuard, Spinlock};
use crate::param::{BSIZE, EXTBLKS, NEXTENT, NINODE};
use crate::proc::KernelCtx;
use crate::stat::Stat;

/// i-number of the inode file.
pub const INODEFILEINO: u32 = 0;
/// i-number of the root directory.
pub const ROOTINO: u32 = 1;

/// Bytes of a directory entry name.
pub const DIRSIZ: usize = 14;

pub const INODESZ: usize = mem::size_of::<Dinode>();

#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub enum InodeType {
    None,
    Dir,
    File,
    Device,
}

impl InodeType {
    pub fn from_disk(t: i16) -> InodeType {
        match t {
            1 => InodeType::Dir,
            2 => InodeType::File,
            3 => InodeType::Device,
            _ => InodeType::None,
        }
    }

    pub fn to_disk(self) -> i16 {
        match self {
            InodeType::None => 0,
            InodeType::Dir => 1,
            InodeType::File => 2,
            InodeType::Device => 3,
        }
    }
}

/// A contiguous run of disk blocks.
#[repr(C)]
#[derive(Copy, Clone, Default, AsBytes, FromBytes)]
pub struct Extent {
    pub start: u32,
    pub nblocks: u32,
}

/// On-disk inode record, packed so records fit integrally in a block.
#[repr(C)]
#[derive(Copy, Clone, Default, AsBytes, FromBytes)]
pub struct Dinode {
    pub typ: i16,
    pub devid: i16,
    pub size: u32,
    pub extents: [Extent; NEXTENT],
    pub pad: [u32; 2],
}

const_assert!(mem::size_of::<Dinode>() == 64);
const_assert!(BSIZE % mem::size_of::<Dinode>() == 0);

/// Directory entry: a fixed 16-byte record. `inum == 0` marks a free slot.
#[repr(C)]
#[derive(Copy, Clone, Default, AsBytes, FromBytes)]
pub struct Dirent {
    pub inum: u16,
    pub name: [u8; DIRSIZ],
}

const_assert!(mem::size_of::<Dirent>() == 16);

impl Dirent {
    pub fn set_name(&mut self, name: &super::FileName) {
        let bytes = name.as_bytes();
        let n = cmp::min(bytes.len(), DIRSIZ);
        self.name[..n].copy_from_slice(&bytes[..n]);
        for b in self.name[n..].iter_mut() {
            *b = 0;
        }
    }

    /// The entry's name, not including NUL padding.
    pub fn name_bytes(&self) -> &[u8] {
        let len = self.name.iter().position(|&c| c == 0).unwrap_or(DIRSIZ);
        &self.name[..len]
    }
}

/// In-memory copy of a dinode, guarded by the inode's sleeplock.
pub struct InodeInner {
    /// Has the dinode been read in?
    pub valid: bool,
    pub typ: InodeType,
    pub devid: i16,
    pub size: u32,
    pub extents: [Extent; NEXTENT],
}

impl InodeInner {
    const fn new() -> Self {
        Self {
            valid: false,
            typ: InodeType::None,
            devid: 0,
            size: 0,
            extents: [Extent { start: 0, nblocks: 0 }; NEXTENT],
        }
    }
}

struct ICtrl {
    dev: u32,
    inum: u32,
    refcnt: u32,
}

/// The inode cache: a fixed pool of ref-counted in-memory inodes.
pub struct Itable {
    ctl: Spinlock<[ICtrl; NINODE]>,
    inner: [Sleeplock<InodeInner>; NINODE],
}

impl Itable {
    pub const fn new() -> Self {
        Self {
            ctl: Spinlock::new(
                "itable",
                array_macro::array![_ => ICtrl { dev: 0, inum: 0, refcnt: 0 }; NINODE],
            ),
            inner: array_macro::array![_ => Sleeplock::new("inode", InodeInner::new()); NINODE],
        }
    }

    /// A shared handle on inode (dev, inum); reads the dinode lazily on
    /// first lock.
    pub fn get(&'static self, dev: u32, inum: u32) -> RcInode {
        let mut ctl = self.ctl.lock();

        let mut empty = None;
        for (i, e) in ctl.iter_mut().enumerate() {
            if e.refcnt > 0 && e.dev == dev && e.inum == inum {
                e.refcnt += 1;
                return RcInode {
                    table: self,
                    idx: i,
                    dev,
                    inum,
                };
            }
            if e.refcnt == 0 && empty.is_none() {
                empty = Some(i);
            }
        }

        let i = empty.expect("iget: no inodes");
        ctl[i] = ICtrl {
            dev,
            inum,
            refcnt: 1,
        };
        // SAFETY: refcnt was 0, so no one holds or waits on the sleeplock.
        unsafe { (*self.inner[i].get_mut_raw()).valid = false };
        RcInode {
            table: self,
            idx: i,
            dev,
            inum,
        }
    }
}

/// A ref-counted handle to a cached inode.
pub struct RcInode {
    table: &'static Itable,
    idx: usize,
    pub dev: u32,
    pub inum: u32,
}

impl Clone for RcInode {
    fn clone(&self) -> Self {
        let mut ctl = self.table.ctl.lock();
        ctl[self.idx].refcnt += 1;
        Self {
            table: self.table,
            idx: self.idx,
            dev: self.dev,
            inum: self.inum,
        }
    }
}

impl Drop for RcInode {
    fn drop(&mut self) {
        let mut ctl = self.table.ctl.lock();
        debug_assert!(ctl[self.idx].refcnt >= 1);
        ctl[self.idx].refcnt -= 1;
    }
}

impl RcInode {
    /// Lock the inode, reading the dinode from the inode file if this is
    /// its first lock. Inode 0's dinode is read straight from the first
    /// inode-file block, which breaks the self-reference.
    pub fn lock(&self, ctx: &KernelCtx) -> InodeGuard<'_> {
        let mut guard = self.table.inner[self.idx].lock(ctx);
        if !guard.valid {
            let mut dinode = Dinode::default();
            read_dinode(ctx, self.inum, &mut dinode);
            guard.typ = InodeType::from_disk(dinode.typ);
            guard.devid = dinode.devid;
            guard.size = dinode.size;
            guard.extents = dinode.extents;
            guard.valid = true;
            assert!(guard.typ != InodeType::None, "inode lock: no type");
        }
        InodeGuard { ip: self, guard }
    }

    pub(super) fn sleeplock(&self) -> &'static Sleeplock<InodeInner> {
        &self.table.inner[self.idx]
    }
}

/// Read inode `inum`'s dinode out of the inode file.
fn read_dinode(ctx: &KernelCtx, inum: u32, out: &mut Dinode) {
    let kernel = ctx.kernel();
    let sb = kernel.fs().superblock();
    let byte = inum as usize * INODESZ;

    let block = if inum == INODEFILEINO {
        debug_assert!(byte < BSIZE);
        sb.inodestart
    } else {
        let (extents, size) = kernel.fs().inodefile_meta(ctx);
        assert!(byte + INODESZ <= size as usize, "read_dinode: no such inode");
        extent_block(&extents, (byte / BSIZE) as u32).expect("read_dinode: hole in inode file")
    };

    let buf = kernel.bread(ctx.kernel().fs().dev(), block, ctx);
    let off = byte % BSIZE;
    out.as_bytes_mut()
        .copy_from_slice(&buf.data()[off..off + INODESZ]);
}

/// Walk `extents` to the disk block backing logical block `lbn`.
pub(super) fn extent_block(extents: &[Extent; NEXTENT], lbn: u32) -> Option<u32> {
    let mut skipped = 0;
    for e in extents.iter() {
        if e.nblocks == 0 {
            break;
        }
        if lbn < skipped + e.nblocks {
            return Some(e.start + (lbn - skipped));
        }
        skipped += e.nblocks;
    }
    None
}

/// A locked inode.
pub struct InodeGuard<'s> {
    pub ip: &'s RcInode,
    guard: SleeplockGuard<'s, InodeInner>,
}

impl core::ops::Deref for InodeGuard<'_> {
    type Target = InodeInner;

    fn deref(&self) -> &Self::Target {
        &self.guard
    }
}

impl InodeGuard<'_> {
    pub fn typ(&self) -> InodeType {
        self.guard.typ
    }

    pub fn devid(&self) -> i16 {
        self.guard.devid
    }

    pub fn size(&self) -> u32 {
        self.guard.size
    }

    pub fn stat(&self) -> Stat {
        Stat {
            typ: self.guard.typ.to_disk(),
            devid: self.guard.devid,
            inum: self.ip.inum,
            size: self.guard.size as u64,
        }
    }

    /// The disk block holding byte offset `off`, if allocated.
    fn bmap(&self, off: u32) -> Option<u32> {
        extent_block(&self.guard.extents, off / BSIZE as u32)
    }

    /// Like `bmap`, but allocates a fresh 32-block extent when the write
    /// point runs off the allocated ones. Needing a seventh extent is an
    /// error.
    fn bmap_or_alloc(&mut self, off: u32, tx: &mut Tx, ctx: &KernelCtx) -> Result<u32, ()> {
        if let Some(b) = self.bmap(off) {
            return Ok(b);
        }
        let allocated: u32 = self.guard.extents.iter().map(|e| e.nblocks).sum();
        let lbn = off / BSIZE as u32;
        if lbn >= allocated + EXTBLKS {
            // The write point is beyond even the next extent.
            return Err(());
        }
        let slot = self
            .guard
            .extents
            .iter()
            .position(|e| e.nblocks == 0)
            .ok_or(())?;
        let start = balloc(tx, ctx);
        self.guard.extents[slot] = Extent {
            start,
            nblocks: EXTBLKS,
        };
        Ok(start + (lbn - allocated))
    }

    /// Read up to `n` bytes starting at `off`, feeding each cache-resident
    /// chunk to `f` with its offset from the start of the read. Truncates
    /// at the file size; returns the number of bytes fed.
    pub fn read_with<F>(&mut self, mut off: u32, mut n: u32, ctx: &KernelCtx, mut f: F) -> Result<usize, ()>
    where
        F: FnMut(u32, &[u8]) -> Result<(), ()>,
    {
        debug_assert!(self.guard.typ != InodeType::Device, "read_with: device");
        let size = self.guard.size;
        if off > size || off.wrapping_add(n) < off {
            return Ok(0);
        }
        if off + n > size {
            n = size - off;
        }

        let mut tot: u32 = 0;
        while tot < n {
            let block = self.bmap(off).ok_or(())?;
            let bp = ctx.kernel().bread(self.ip.dev, block, ctx);
            let begin = off as usize % BSIZE;
            let m = cmp::min(n - tot, (BSIZE - begin) as u32);
            f(tot, &bp.data()[begin..begin + m as usize])?;
            tot += m;
            off += m;
        }
        Ok(tot as usize)
    }

    /// Read into a kernel buffer; returns the bytes actually read.
    pub fn read_bytes(&mut self, off: u32, dst: &mut [u8], ctx: &KernelCtx) -> usize {
        self.read_with(off, dst.len() as u32, ctx, |tot, chunk| {
            dst[tot as usize..tot as usize + chunk.len()].copy_from_slice(chunk);
            Ok(())
        })
        .unwrap_or(0)
    }

    /// Write `n` bytes starting at `off`, `f` filling each block-sized
    /// chunk. Every touched home block is journaled through `tx`, and the
    /// updated dinode is written back at the end.
    pub fn write_with<F>(
        &mut self,
        mut off: u32,
        n: u32,
        tx: &mut Tx,
        ctx: &KernelCtx,
        mut f: F,
    ) -> Result<usize, ()>
    where
        F: FnMut(u32, &mut [u8]) -> Result<(), ()>,
    {
        debug_assert!(self.guard.typ != InodeType::Device, "write_with: device");
        if off > self.guard.size {
            return Err(());
        }
        if off.checked_add(n).is_none()
            || (off + n) as usize > NEXTENT * EXTBLKS as usize * BSIZE
        {
            return Err(());
        }

        let mut tot: u32 = 0;
        while tot < n {
            let block = self.bmap_or_alloc(off, tx, ctx)?;
            let mut bp = ctx.kernel().bread(self.ip.dev, block, ctx);
            let begin = off as usize % BSIZE;
            let m = cmp::min(n - tot, (BSIZE - begin) as u32);
            f(tot, &mut bp.data_mut()[begin..begin + m as usize])?;
            tx.write(bp, ctx);
            tot += m;
            off += m;
        }

        if off > self.guard.size {
            self.guard.size = off;
        }

        // Write the inode back even if the size did not change, because the
        // loop may have added an extent.
        self.update(tx, ctx);
        Ok(tot as usize)
    }

    /// Write from a kernel buffer.
    pub fn write_bytes(
        &mut self,
        off: u32,
        src: &[u8],
        tx: &mut Tx,
        ctx: &KernelCtx,
    ) -> Result<usize, ()> {
        self.write_with(off, src.len() as u32, tx, ctx, |tot, chunk| {
            chunk.copy_from_slice(&src[tot as usize..tot as usize + chunk.len()]);
            Ok(())
        })
    }

    /// Persist the dinode: patch its 64 bytes in the inode file and journal
    /// the block. Writing the inode file itself updates in place through
    /// its own extents, which breaks the recursion.
    pub fn update(&mut self, tx: &mut Tx, ctx: &KernelCtx) {
        let kernel = ctx.kernel();
        let sb = kernel.fs().superblock();
        let byte = self.ip.inum as usize * INODESZ;

        let block = if self.ip.inum == INODEFILEINO {
            sb.inodestart
        } else {
            let (extents, _) = kernel.fs().inodefile_meta(ctx);
            extent_block(&extents, (byte / BSIZE) as u32).expect("iupdate: hole in inode file")
        };

        let dinode = Dinode {
            typ: self.guard.typ.to_disk(),
            devid: self.guard.devid,
            size: self.guard.size,
            extents: self.guard.extents,
            pad: [0; 2],
        };

        let mut bp = kernel.bread(self.ip.dev, block, ctx);
        let off = byte % BSIZE;
        bp.data_mut()[off..off + INODESZ].copy_from_slice(dinode.as_bytes());
        tx.write(bp, ctx);
    }

    /// Look for a directory entry named `name`; returns the entry's inode
    /// and its byte offset in the directory.
    pub fn dirlookup(
        &mut self,
        name: &super::FileName,
        ctx: &KernelCtx,
    ) -> Result<(RcInode, u32), ()> {
        debug_assert!(self.guard.typ == InodeType::Dir, "dirlookup: not a dir");
        let table = self.ip.table;
        let dev = self.ip.dev;

        let mut off = 0;
        while off < self.guard.size {
            let mut de = Dirent::default();
            let n = self.read_bytes(off, de.as_bytes_mut(), ctx);
            assert_eq!(n, mem::size_of::<Dirent>(), "dirlookup: short read");
            if de.inum != 0 && de.name_bytes() == name.as_bytes() {
                return Ok((table.get(dev, de.inum as u32), off));
            }
            off += mem::size_of::<Dirent>() as u32;
        }
        Err(())
    }

    /// Add a directory entry, reusing a free slot if one exists.
    pub fn dirlink(
        &mut self,
        name: &super::FileName,
        inum: u32,
        tx: &mut Tx,
        ctx: &KernelCtx,
    ) -> Result<(), ()> {
        debug_assert!(self.guard.typ == InodeType::Dir, "dirlink: not a dir");

        let mut off = 0;
        while off < self.guard.size {
            let mut de = Dirent::default();
            let n = self.read_bytes(off, de.as_bytes_mut(), ctx);
            assert_eq!(n, mem::size_of::<Dirent>(), "dirlink: short read");
            if de.inum == 0 {
                break;
            }
            off += mem::size_of::<Dirent>() as u32;
        }

        let mut de = Dirent::default();
        de.inum = inum as u16;
        de.set_name(name);
        let n = self.write_bytes(off, de.as_bytes(), tx, ctx)?;
        if n != mem::size_of::<Dirent>() {
            return Err(());
        }
        Ok(())
    }

}

/// Allocate one 32-block extent: find a bitmap word that is all zero, set
/// it to all ones (claiming 32 consecutive blocks), journal the bitmap
/// block, and return the first claimed block number.
pub(super) fn balloc(tx: &mut Tx, ctx: &KernelCtx) -> u32 {
    let kernel = ctx.kernel();
    let sb = kernel.fs().superblock();
    let dev = kernel.fs().dev();

    for b in num_iter::range_step(0, sb.size, super::superblock::BPB) {
        let mut bp = kernel.bread(dev, sb.bblock(b), ctx);
        let mut claimed = None;
        for w in 0..BSIZE / 4 {
            let bytes = &mut bp.data_mut()[w * 4..w * 4 + 4];
            if bytes.iter().all(|&byte| byte == 0) {
                bytes.copy_from_slice(&u32::MAX.to_le_bytes());
                claimed = Some(w as u32);
                break;
            }
        }
        if let Some(w) = claimed {
            tx.write(bp, ctx);
            let block = b + w * 32;
            assert!(
                block > sb.inodestart && block + EXTBLKS <= sb.swapstart,
                "balloc: extent outside data region"
            );
            return block;
        }
    }
    panic!("balloc: out of extents");
}
