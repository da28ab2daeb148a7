//! Path names.
//!
//! Paths are tokenized one element at a time by `skipelem`; lookup walks
//! one directory per element starting at the root (there is no per-process
//! current directory, so relative paths also begin at the root).

use core::cmp;

use cstr_core::CStr;

use super::inode::{InodeType, RcInode, DIRSIZ};
use crate::proc::KernelCtx;

#[derive(PartialEq)]
#[repr(transparent)]
pub struct FileName {
    // Invariant:
    // - The slice contains no NUL characters.
    // - The slice is not longer than DIRSIZ.
    inner: [u8],
}

impl FileName {
    /// Truncate bytes after the first DIRSIZ bytes.
    ///
    /// # Safety
    ///
    /// `bytes` must not contain any NUL characters.
    pub unsafe fn from_bytes(bytes: &[u8]) -> &Self {
        debug_assert!(!bytes.contains(&0));
        // SAFETY: `&FileName` is layout-compatible with `[u8]` because of
        // its attribute `#[repr(transparent)]`, and the slice satisfies the
        // invariant per the safety condition and the truncation.
        unsafe { &*(&bytes[..cmp::min(DIRSIZ, bytes.len())] as *const [u8] as *const Self) }
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.inner
    }
}

#[repr(transparent)]
pub struct Path {
    // Invariant: the slice contains no NUL characters.
    inner: [u8],
}

impl Path {
    pub fn new(cstr: &CStr) -> &Self {
        // SAFETY: `&Path` is layout-compatible with `[u8]`, and
        // CStr::to_bytes contains no NUL.
        unsafe { &*(cstr.to_bytes() as *const [u8] as *const Self) }
    }

    /// # Safety
    ///
    /// `bytes` must not contain any NUL bytes.
    pub unsafe fn from_bytes(bytes: &[u8]) -> &Self {
        // SAFETY: `&Path` is layout-compatible with `[u8]`, and the slice
        // contains no NUL per the safety condition.
        unsafe { &*(bytes as *const [u8] as *const Self) }
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.inner
    }

    /// Returns `Some((path, name))` where `name` is the next path element
    /// and `path` is the rest with leading slashes collapsed. Returns
    /// `None` when no element remains.
    pub fn skipelem(&self) -> Option<(&Self, &FileName)> {
        let mut bytes = &self.inner;

        let name_start = bytes.iter().position(|ch| *ch != b'/')?;
        bytes = &bytes[name_start..];

        let len = bytes
            .iter()
            .position(|ch| *ch == b'/')
            .unwrap_or(bytes.len());

        // SAFETY: a subslice of self.inner, which contains no NUL.
        let name = unsafe { FileName::from_bytes(&bytes[..len]) };

        bytes = &bytes[len..];

        let next_start = bytes
            .iter()
            .position(|ch| *ch != b'/')
            .unwrap_or(bytes.len());

        // SAFETY: a subslice of self.inner, which contains no NUL.
        let path = unsafe { Self::from_bytes(&bytes[next_start..]) };
        Some((path, name))
    }

    /// Look up the inode a path names.
    pub fn namei(&self, ctx: &KernelCtx) -> Result<RcInode, ()> {
        let (ip, _) = self.namex(false, ctx)?;
        Ok(ip)
    }

    /// Look up the parent directory and return it with the final element.
    pub fn nameiparent(&self, ctx: &KernelCtx) -> Result<(RcInode, &FileName), ()> {
        let (ip, name) = self.namex(true, ctx)?;
        Ok((ip, name.ok_or(())?))
    }

    fn namex(&self, parent: bool, ctx: &KernelCtx) -> Result<(RcInode, Option<&FileName>), ()> {
        let fs = ctx.kernel().fs();
        let mut ip = fs.root(ctx);
        let mut path = self;

        loop {
            let (rest, name) = match path.skipelem() {
                Some(x) => x,
                None => {
                    if parent {
                        // "/" has no parent element.
                        return Err(());
                    }
                    return Ok((ip, None));
                }
            };

            let mut dp = ip.lock(ctx);
            if dp.typ() != InodeType::Dir {
                return Err(());
            }
            if parent && rest.as_bytes().is_empty() {
                drop(dp);
                return Ok((ip, Some(name)));
            }
            let (next, _off) = dp.dirlookup(name, ctx)?;
            drop(dp);
            ip = next;
            path = rest;
        }
    }
}
