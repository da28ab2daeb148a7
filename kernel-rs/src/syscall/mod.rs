//! System-call dispatch and argument fetch.

use cstr_core::CStr;

use crate::addr::UVAddr;
use crate::proc::KernelCtx;
use crate::vm;

mod file;
mod proc;

pub const SYS_FORK: i32 = 1;
pub const SYS_EXIT: i32 = 2;
pub const SYS_WAIT: i32 = 3;
pub const SYS_PIPE: i32 = 4;
pub const SYS_READ: i32 = 5;
pub const SYS_KILL: i32 = 6;
pub const SYS_EXEC: i32 = 7;
pub const SYS_FSTAT: i32 = 8;
pub const SYS_CHDIR: i32 = 9;
pub const SYS_DUP: i32 = 10;
pub const SYS_GETPID: i32 = 11;
pub const SYS_SBRK: i32 = 12;
pub const SYS_SLEEP: i32 = 13;
pub const SYS_UPTIME: i32 = 14;
pub const SYS_OPEN: i32 = 15;
pub const SYS_WRITE: i32 = 16;
pub const SYS_CLOSE: i32 = 17;
pub const SYS_CRASHN: i32 = 18;

impl KernelCtx {
    pub fn syscall(&mut self, num: i32) -> Result<usize, ()> {
        match num {
            SYS_FORK => self.sys_fork(),
            SYS_EXIT => self.sys_exit(),
            SYS_WAIT => self.sys_wait(),
            SYS_PIPE => self.sys_pipe(),
            SYS_READ => self.sys_read(),
            SYS_KILL => self.sys_kill(),
            SYS_EXEC => self.sys_exec(),
            SYS_FSTAT => self.sys_fstat(),
            // There is no per-process current directory.
            SYS_CHDIR => Err(()),
            SYS_DUP => self.sys_dup(),
            SYS_GETPID => self.sys_getpid(),
            SYS_SBRK => self.sys_sbrk(),
            SYS_SLEEP => self.sys_sleep(),
            SYS_UPTIME => self.sys_uptime(),
            SYS_OPEN => self.sys_open(),
            SYS_WRITE => self.sys_write(),
            SYS_CLOSE => self.sys_close(),
            SYS_CRASHN => self.sys_crashn(),
            _ => {
                crate::println!("pid {}: unknown sys call {}", self.pid(), num);
                Err(())
            }
        }
    }

    /// The nth system-call argument register.
    fn argraw(&self, n: usize) -> usize {
        // SAFETY: the trap frame was set up by the trap path for the
        // current process.
        let tf = unsafe { &*self.proc_data().trap_frame };
        match n {
            0 => tf.rdi,
            1 => tf.rsi,
            2 => tf.rdx,
            3 => tf.r10,
            4 => tf.r8,
            5 => tf.r9,
            _ => panic!("argraw"),
        }
    }

    /// Fetch the nth argument as a 32-bit integer.
    pub fn argint(&self, n: usize) -> Result<i32, ()> {
        Ok(self.argraw(n) as i32)
    }

    /// Fetch the nth argument as a user pointer. Legality is checked by
    /// the copy-in/copy-out paths.
    pub fn argaddr(&self, n: usize) -> Result<UVAddr, ()> {
        Ok(UVAddr::from(self.argraw(n)))
    }

    /// Fetch the usize at `addr` in user memory.
    pub fn fetchaddr(&mut self, addr: UVAddr) -> Result<usize, ()> {
        let mut bytes = [0u8; core::mem::size_of::<usize>()];
        vm::copy_in(self, addr, &mut bytes)?;
        Ok(usize::from_le_bytes(bytes))
    }

    /// Fetch the NUL-terminated string at `addr` into `buf`.
    pub fn fetchstr<'a>(&mut self, addr: UVAddr, buf: &'a mut [u8]) -> Result<&'a CStr, ()> {
        let len = vm::copy_in_str(self, addr, buf)?;
        CStr::from_bytes_with_nul(&buf[..len + 1]).map_err(|_| ())
    }

    /// Fetch the nth argument as a NUL-terminated string, copied into
    /// `buf`.
    pub fn argstr<'a>(&mut self, n: usize, buf: &'a mut [u8]) -> Result<&'a CStr, ()> {
        let addr = self.argaddr(n)?;
        self.fetchstr(addr, buf)
    }
}
