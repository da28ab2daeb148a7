//! File-descriptor system calls.

use zerocopy::AsBytes;

use crate::fcntl::OpenFlags;
use crate::file::{FileType, RcFile};
use crate::fs::{InodeType, Path};
use crate::param::{MAXPATH, NOFILE};
use crate::pipe::AllocatedPipe;
use crate::proc::KernelCtx;
use crate::vm;

impl KernelCtx {
    /// The open file behind descriptor argument `n`, with its own
    /// reference (the caller frees it).
    fn arg_file(&self, n: usize) -> Result<RcFile, ()> {
        let fd = self.argint(n)?;
        if fd < 0 || fd as usize >= NOFILE {
            return Err(());
        }
        Ok(self.proc_data().files[fd as usize]
            .as_ref()
            .ok_or(())?
            .clone_ref())
    }

    pub(super) fn sys_open(&mut self) -> Result<usize, ()> {
        let mut path_buf = [0u8; MAXPATH];
        let mode = self.argint(1)?;
        let cstr = self.argstr(0, &mut path_buf)?;
        let path = Path::new(cstr);

        let flags = OpenFlags::from_bits_truncate(mode);
        // A bare O_CREATE carries no access mode and is rejected; with
        // O_CREATE set, the mode passed on is the remainder.
        if mode == OpenFlags::O_CREATE.bits() || flags.access_mode() == 3 {
            return Err(());
        }

        let kernel = self.kernel();
        let ip = if flags.contains(OpenFlags::O_CREATE) {
            let mut tx = kernel.fs().begin_tx(self);
            let created = kernel.fs().create_file(path, &mut tx, self);
            tx.end(self);
            created?
        } else {
            path.namei(self)?
        };

        let (typ, devid) = {
            let guard = ip.lock(self);
            if guard.typ() == InodeType::Dir && flags.access_mode() != 0 {
                return Err(());
            }
            (guard.typ(), guard.devid())
        };

        let filetype = match typ {
            InodeType::Device => FileType::Device { ip, devid },
            _ => FileType::Inode {
                ip,
                off: core::cell::UnsafeCell::new(0),
            },
        };

        let f = kernel
            .ftable()
            .alloc(filetype, flags.readable(), flags.writable())?;
        let fd = f.fdalloc(self)?;
        Ok(fd as usize)
    }

    pub(super) fn sys_close(&mut self) -> Result<usize, ()> {
        let fd = self.argint(0)?;
        if fd < 0 || fd as usize >= NOFILE {
            return Err(());
        }
        let f = self.proc_data_mut().files[fd as usize].take().ok_or(())?;
        f.free(self);
        Ok(0)
    }

    pub(super) fn sys_read(&mut self) -> Result<usize, ()> {
        let f = self.arg_file(0)?;
        let addr = self.argaddr(1)?;
        let n = self.argint(2)?;
        let r = if n <= 0 {
            Err(())
        } else {
            f.read(self, addr, n as usize)
        };
        f.free(self);
        r
    }

    pub(super) fn sys_write(&mut self) -> Result<usize, ()> {
        let f = self.arg_file(0)?;
        let addr = self.argaddr(1)?;
        let n = self.argint(2)?;
        let r = if n <= 0 {
            Err(())
        } else {
            f.write(self, addr, n as usize)
        };
        f.free(self);
        r
    }

    pub(super) fn sys_dup(&mut self) -> Result<usize, ()> {
        let f = self.arg_file(0)?;
        let dup = f.clone_ref();
        f.free(self);
        let fd = dup.fdalloc(self)?;
        Ok(fd as usize)
    }

    pub(super) fn sys_fstat(&mut self) -> Result<usize, ()> {
        let f = self.arg_file(0)?;
        let addr = self.argaddr(1)?;
        let r = f.stat(self, addr);
        f.free(self);
        r.map(|()| 0)
    }

    /// Create a pipe; put the read/write descriptors in the user's int
    /// pair at arg 0.
    pub(super) fn sys_pipe(&mut self) -> Result<usize, ()> {
        let fdarray = self.argaddr(0)?;
        let (reader, writer) = AllocatedPipe::alloc(self)?;

        let fd0 = reader.fdalloc(self)?;
        let fd1 = match writer.fdalloc(self) {
            Ok(fd) => fd,
            Err(()) => {
                let f = self.proc_data_mut().files[fd0 as usize].take().unwrap();
                f.free(self);
                return Err(());
            }
        };

        let fds = [fd0, fd1];
        if vm::copy_out(self, fdarray, fds.as_bytes()).is_err() {
            for fd in fds.iter() {
                let f = self.proc_data_mut().files[*fd as usize].take().unwrap();
                f.free(self);
            }
            return Err(());
        }
        Ok(0)
    }

    /// Test-only: panic after n more journaled writes.
    pub(super) fn sys_crashn(&mut self) -> Result<usize, ()> {
        let n = self.argint(0)?;
        self.kernel().fs().set_crashn(n, self);
        Ok(0)
    }
}
