/// Maximum number of processes.
pub const NPROC: usize = 64;

/// Maximum number of CPUs.
pub const NCPU: usize = 8;

/// Open files per process.
pub const NOFILE: usize = 16;

/// Open files per system.
pub const NFILE: usize = 100;

/// Maximum number of active i-nodes.
pub const NINODE: usize = 50;

/// Maximum major device number.
pub const NDEV: usize = 10;

/// Device number of file system root disk.
pub const ROOTDEV: u32 = 1;

/// Console device id in the devsw table.
pub const CONSOLE: usize = 1;

/// Max exec arguments.
pub const MAXARG: usize = 32;

/// Block size.
pub const BSIZE: usize = 512;

/// Data slots in the on-disk log, and therefore the most block
/// changes a single transaction may contain.
pub const LOGBLKS: usize = 19;

/// Size of disk block cache.
pub const NBUF: usize = LOGBLKS + 12;

/// Extents per inode.
pub const NEXTENT: usize = 6;

/// Blocks claimed by one extent allocation.
pub const EXTBLKS: u32 = 32;

/// Swap slots in the swap region.
pub const NSWAPSLOT: usize = 2048;

/// Blocks per swap slot (one 4 KiB page).
pub const SWAPBLKS: u32 = (crate::addr::PGSIZE / BSIZE) as u32;

/// Most pages the user stack may grow by on fault.
pub const STACKPAGES: usize = 10;

/// Physical memory cap.
pub const PHYSCAP: usize = 256 * 1024 * 1024;

/// Maximum file path name.
pub const MAXPATH: usize = 128;

/// Maximum length of process name.
pub const MAXPROCNAME: usize = 16;
