//! Test support: an in-memory disk, a crash-injecting disk wrapper, a
//! formatter that builds a file-system image the way mkfs does, and a
//! kernel bootstrapper over a leaked arena.

use std::alloc::Layout;
use std::boxed::Box;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Mutex;
use std::vec;
use std::vec::Vec;

use zerocopy::AsBytes;

use crate::addr::PGSIZE;
use crate::bio::{BlockDevice, BufData};
use crate::fs::{Dinode, Dirent, Extent, Superblock, BPB, DIRSIZ, INODESZ};
use crate::kernel::Kernel;
use crate::param::{BSIZE, EXTBLKS, LOGBLKS, NSWAPSLOT, ROOTDEV, SWAPBLKS};
use crate::proc::{KernelCtx, ProcState};

/// An in-memory block device. No IRQ, no DMA; reads and writes are plain
/// memcpys, like the synchronous driver interface the kernel consumes.
pub struct RamDisk {
    data: Mutex<Vec<u8>>,
}

impl RamDisk {
    pub fn from_image(image: Vec<u8>) -> Self {
        assert_eq!(image.len() % BSIZE, 0);
        Self {
            data: Mutex::new(image),
        }
    }

    pub fn image(&self) -> Vec<u8> {
        self.data.lock().unwrap().clone()
    }
}

impl BlockDevice for RamDisk {
    fn read(&self, blockno: u32, buf: &mut BufData) {
        let data = self.data.lock().unwrap();
        let off = blockno as usize * BSIZE;
        buf.copy_from_slice(&data[off..off + BSIZE]);
    }

    fn write(&self, blockno: u32, buf: &BufData) {
        let mut data = self.data.lock().unwrap();
        let off = blockno as usize * BSIZE;
        data[off..off + BSIZE].copy_from_slice(&buf[..]);
    }
}

/// A disk that loses power after a programmed number of writes: the nth
/// and all later writes are silently dropped, as if the machine died.
pub struct CrashDisk {
    inner: RamDisk,
    writes_left: AtomicI64,
}

impl CrashDisk {
    pub fn new(image: Vec<u8>, writes_until_crash: i64) -> Self {
        Self {
            inner: RamDisk::from_image(image),
            writes_left: AtomicI64::new(writes_until_crash),
        }
    }

    pub fn image(&self) -> Vec<u8> {
        self.inner.image()
    }

    pub fn crashed(&self) -> bool {
        self.writes_left.load(Ordering::SeqCst) <= 0
    }
}

impl BlockDevice for CrashDisk {
    fn read(&self, blockno: u32, buf: &mut BufData) {
        self.inner.read(blockno, buf);
    }

    fn write(&self, blockno: u32, buf: &BufData) {
        if self.writes_left.fetch_sub(1, Ordering::SeqCst) <= 0 {
            return;
        }
        self.inner.write(blockno, buf);
    }
}

const fn roundup32(n: u32, to: u32) -> u32 {
    (n + to - 1) / to * to
}

/// Build a formatted disk image seeding `files` into the root directory.
/// Follows the on-disk layout the kernel mounts: boot | super | bitmap |
/// inode file | data | swap | log, with every allocation a 32-block,
/// word-aligned extent.
pub fn mkfs(files: &[(&str, &[u8])]) -> Vec<u8> {
    const DATA_BLOCKS: u32 = 8192;

    let mut nbmap = 1u32;
    let (inodestart, swapstart, logstart, size) = loop {
        let inodestart = roundup32(2 + nbmap, EXTBLKS);
        let swapstart = inodestart + DATA_BLOCKS;
        let logstart = swapstart + NSWAPSLOT as u32 * SWAPBLKS;
        let size = logstart + 1 + LOGBLKS as u32;
        let need = (size + BPB - 1) / BPB;
        if need == nbmap {
            break (inodestart, swapstart, logstart, size);
        }
        nbmap = need;
    };

    let mut img = vec![0u8; size as usize * BSIZE];

    let sb = Superblock {
        size,
        nblocks: DATA_BLOCKS,
        bmapstart: 2,
        inodestart,
        swapstart,
        logstart,
    };
    img[BSIZE..BSIZE + core::mem::size_of::<Superblock>()].copy_from_slice(sb.as_bytes());

    // Extent layout: the inode file, then the root directory, then one
    // extent per seeded file.
    let rootdir_ext = inodestart + EXTBLKS;
    let first_file_ext = rootdir_ext + EXTBLKS;
    let ninodes = 2 + files.len();

    let mut put_dinode = |img: &mut Vec<u8>, inum: usize, d: Dinode| {
        let off = inodestart as usize * BSIZE + inum * INODESZ;
        img[off..off + INODESZ].copy_from_slice(d.as_bytes());
    };

    // Inode 0: the inode file itself.
    let mut d = Dinode::default();
    d.typ = 2;
    d.size = (ninodes * INODESZ) as u32;
    d.extents[0] = Extent {
        start: inodestart,
        nblocks: EXTBLKS,
    };
    put_dinode(&mut img, 0, d);

    // Inode 1: the root directory.
    let mut d = Dinode::default();
    d.typ = 1;
    d.size = (files.len() * core::mem::size_of::<Dirent>()) as u32;
    d.extents[0] = Extent {
        start: rootdir_ext,
        nblocks: EXTBLKS,
    };
    put_dinode(&mut img, 1, d);

    for (i, (name, data)) in files.iter().enumerate() {
        assert!(data.len() <= (EXTBLKS as usize) * BSIZE, "mkfs: file too big");
        assert!(name.len() <= DIRSIZ, "mkfs: name too long");

        let ext = first_file_ext + (i as u32) * EXTBLKS;
        let mut d = Dinode::default();
        d.typ = 2;
        d.size = data.len() as u32;
        d.extents[0] = Extent {
            start: ext,
            nblocks: EXTBLKS,
        };
        put_dinode(&mut img, 2 + i, d);

        let mut de = Dirent::default();
        de.inum = (2 + i) as u16;
        de.name[..name.len()].copy_from_slice(name.as_bytes());
        let off = rootdir_ext as usize * BSIZE + i * core::mem::size_of::<Dirent>();
        img[off..off + core::mem::size_of::<Dirent>()].copy_from_slice(de.as_bytes());

        let off = ext as usize * BSIZE;
        img[off..off + data.len()].copy_from_slice(data);
    }

    // Free bitmap: everything up to the end of the seeded extents is
    // used, as are the swap and log regions and the bitmap's trailing
    // bits past the end of the image.
    let used_until = first_file_ext + files.len() as u32 * EXTBLKS;
    let mut set_used = |img: &mut Vec<u8>, b: u32| {
        let byte = 2 * BSIZE + (b / 8) as usize;
        img[byte] |= 1 << (b % 8);
    };
    for b in 0..used_until {
        set_used(&mut img, b);
    }
    for b in swapstart..nbmap * BPB {
        set_used(&mut img, b);
    }

    img
}

/// Boot a fresh kernel over `disk` with `mem_pages` frames of managed
/// memory. Returns the kernel and a context on a live process slot, so
/// sleeplocks and the eviction path see a real owner.
pub fn boot(disk: &'static dyn BlockDevice, mem_pages: usize) -> (&'static Kernel, KernelCtx) {
    let kernel: &'static Kernel = Box::leak(Box::new(Kernel::zero()));

    let bytes = mem_pages * PGSIZE;
    let layout = Layout::from_size_align(bytes, PGSIZE).unwrap();
    // SAFETY: a fresh allocation; leaked for the kernel's lifetime.
    let arena = unsafe { std::alloc::alloc_zeroed(layout) } as usize;
    assert!(arena != 0);
    // SAFETY: the arena is unused memory, and this kernel inits once.
    unsafe { kernel.kmem().lock().init(arena, arena + bytes) };

    kernel.set_disk(disk);

    let proc = &kernel.procs().pool()[0];
    {
        let mut table = kernel.procs().lock_table();
        let shared = proc.shared_mut(&mut table);
        shared.state = ProcState::Running;
        shared.pid = 1;
    }
    let ctx = KernelCtx::new(kernel, proc);

    kernel.fs().init(ROOTDEV, &ctx);
    (kernel, ctx)
}

/// Boot without a file system: allocator-only tests.
pub fn boot_alloc_only(mem_pages: usize) -> (&'static Kernel, KernelCtx) {
    let kernel: &'static Kernel = Box::leak(Box::new(Kernel::zero()));

    let bytes = mem_pages * PGSIZE;
    let layout = Layout::from_size_align(bytes, PGSIZE).unwrap();
    // SAFETY: as in `boot`.
    let arena = unsafe { std::alloc::alloc_zeroed(layout) } as usize;
    assert!(arena != 0);
    // SAFETY: as in `boot`.
    unsafe { kernel.kmem().lock().init(arena, arena + bytes) };

    let proc = &kernel.procs().pool()[0];
    {
        let mut table = kernel.procs().lock_table();
        let shared = proc.shared_mut(&mut table);
        shared.state = ProcState::Running;
        shared.pid = 1;
    }
    (kernel, KernelCtx::new(kernel, proc))
}

/// A formatted RamDisk with `files`, leaked to 'static.
pub fn ramdisk_with(files: &[(&str, &[u8])]) -> &'static RamDisk {
    Box::leak(Box::new(RamDisk::from_image(mkfs(files))))
}
