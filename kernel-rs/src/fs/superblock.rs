use core::mem;

use static_assertions::const_assert;
use zerocopy::{AsBytes, FromBytes};

use crate::bio::Buf;
use crate::param::BSIZE;

/// Disk layout:
/// [ boot block | super block | free bitmap | inode file | data blocks |
///   swap region | log region ]
///
/// mkfs computes the superblock and builds an initial file system. The
/// superblock describes the disk layout and is immutable after format.
#[repr(C)]
#[derive(Copy, Clone, Default, AsBytes, FromBytes)]
pub struct Superblock {
    /// Size of file system image (blocks).
    pub size: u32,

    /// Number of data blocks.
    pub nblocks: u32,

    /// Block number of first free-bitmap block.
    pub bmapstart: u32,

    /// Block number of the first block of the inode file.
    pub inodestart: u32,

    /// Block number of the first swap-region block.
    pub swapstart: u32,

    /// Block number of the log header.
    pub logstart: u32,
}

const_assert!(mem::size_of::<Superblock>() <= BSIZE);

/// Bitmap bits per block.
pub const BPB: u32 = (BSIZE * 8) as u32;

impl Superblock {
    /// Decode the superblock from its on-disk block.
    pub fn read(buf: &Buf) -> Self {
        let mut sb = Superblock::default();
        sb.as_bytes_mut()
            .copy_from_slice(&buf.data()[..mem::size_of::<Superblock>()]);
        assert!(sb.size > 0, "invalid file system");
        sb
    }

    /// Block of the free bitmap containing the bit for block `b`.
    pub const fn bblock(&self, b: u32) -> u32 {
        self.bmapstart + b / BPB
    }
}
