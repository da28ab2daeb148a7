use zerocopy::{AsBytes, FromBytes};

/// File metadata returned by fstat, copied out to user space verbatim.
#[repr(C)]
#[derive(Copy, Clone, Default, AsBytes, FromBytes)]
pub struct Stat {
    /// Inode type (dinode encoding).
    pub typ: i16,

    /// Device id, for device inodes.
    pub devid: i16,

    /// Inode number.
    pub inum: u32,

    /// Size of file in bytes.
    pub size: u64,
}
