//! Process system calls.

use crate::exec;
use crate::fs::Path;
use crate::kalloc;
use crate::page::Page;
use crate::param::{MAXARG, MAXPATH};
use crate::proc::KernelCtx;

impl KernelCtx {
    pub(super) fn sys_fork(&mut self) -> Result<usize, ()> {
        let pid = self.kernel().procs().fork(self)?;
        Ok(pid as usize)
    }

    pub(super) fn sys_exit(&mut self) -> Result<usize, ()> {
        self.kernel().procs().exit_current(*self)
    }

    pub(super) fn sys_wait(&mut self) -> Result<usize, ()> {
        let pid = self.kernel().procs().wait(self)?;
        Ok(pid as usize)
    }

    pub(super) fn sys_kill(&mut self) -> Result<usize, ()> {
        let pid = self.argint(0)?;
        self.kernel().procs().kill(pid)?;
        Ok(0)
    }

    pub(super) fn sys_getpid(&mut self) -> Result<usize, ()> {
        Ok(self.pid() as usize)
    }

    pub(super) fn sys_sbrk(&mut self) -> Result<usize, ()> {
        let n = self.argint(0)?;
        let ctx = *self;
        let vs = self.proc_data_mut().vspace.as_mut().ok_or(())?;
        vs.sbrk(&ctx, n as isize)
    }

    /// Wait for `n` timer ticks; interruptible by kill.
    pub(super) fn sys_sleep(&mut self) -> Result<usize, ()> {
        let n = self.argint(0)?;
        if n < 0 {
            return Err(());
        }
        let mut ticks = self.kernel().ticks().lock();
        let t0 = *ticks;
        while ticks.wrapping_sub(t0) < n as u32 {
            if self.proc().killed() {
                return Err(());
            }
            ticks.sleep(self);
        }
        Ok(0)
    }

    pub(super) fn sys_uptime(&mut self) -> Result<usize, ()> {
        Ok(*self.kernel().ticks().lock() as usize)
    }

    /// exec(path, argv): argument strings are staged into whole frames,
    /// one per argument, since the kernel stack is a single page.
    pub(super) fn sys_exec(&mut self) -> Result<usize, ()> {
        let kernel = self.kernel();
        let mut path_buf = [0u8; MAXPATH];
        let cstr = self.argstr(0, &mut path_buf)?;
        let uargv = self.argaddr(1)?;

        let mut pages: [Option<Page>; MAXARG] = Default::default();
        let mut lens = [0usize; MAXARG];
        let mut argc = 0usize;

        let fetched: Result<(), ()> = (|| {
            loop {
                if argc >= MAXARG {
                    return Err(());
                }
                let uarg = self.fetchaddr(uargv + argc * core::mem::size_of::<usize>())?;
                if uarg == 0 {
                    return Ok(());
                }
                let mut page = kalloc::kalloc(kernel, Some(self)).ok_or(())?;
                let len = match crate::vm::copy_in_str(self, uarg.into(), &mut page[..]) {
                    Ok(len) => len,
                    Err(()) => {
                        kalloc::kfree(kernel, page);
                        return Err(());
                    }
                };
                pages[argc] = Some(page);
                lens[argc] = len;
                argc += 1;
            }
        })();

        let result = fetched.and_then(|()| {
            let mut args: [&[u8]; MAXARG] = [&[]; MAXARG];
            for i in 0..argc {
                args[i] = &pages[i].as_ref().unwrap()[..lens[i]];
            }
            exec::exec(self, Path::new(cstr), &args[..argc])
        });

        for page in pages.iter_mut() {
            if let Some(page) = page.take() {
                kalloc::kfree(kernel, page);
            }
        }
        result
    }
}
