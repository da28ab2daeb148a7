//! Pipes.
//!
//! A pipe lives in a single allocated frame: the `Pipe` struct sits at the
//! base of the page and the circular byte buffer fills the rest. The read
//! and write positions are monotonic 64-bit counters used modulo the
//! buffer size, so `tail - head` is the live byte count. The page is
//! freed when both ends are closed.

use core::cmp;
use core::mem;
use core::ops::Deref;
use core::ptr::NonNull;

use crate::addr::{PGSIZE, UVAddr};
use crate::file::{copy_in, copy_out, FileType, RcFile};
use crate::kalloc;
use crate::lock::Spinlock;
use crate::page::Page;
use crate::proc::{KernelCtx, WaitChannel};

/// Bytes of ring buffer left in the pipe's page.
pub const PIPEBUF: usize = PGSIZE - mem::size_of::<Pipe>();

struct PipeCtl {
    /// Read position.
    head: u64,
    /// Write position.
    tail: u64,
    /// Read fd is still open.
    readopen: bool,
    /// Write fd is still open.
    writeopen: bool,
}

#[repr(C)]
pub struct Pipe {
    ctl: Spinlock<PipeCtl>,

    /// Sleepers waiting for bytes to arrive.
    read_chan: WaitChannel,

    /// Sleepers waiting for buffer space.
    write_chan: WaitChannel,
}

impl Pipe {
    fn buffer(&self) -> *mut u8 {
        // SAFETY: the pipe was placed at the base of a whole frame, so the
        // PIPEBUF bytes after it belong to it.
        unsafe { (self as *const Pipe as *mut u8).add(mem::size_of::<Pipe>()) }
    }

    /// Copy `m` ring bytes starting at `pos` into `dst`; wraps around the
    /// buffer end (prefix up to the end, then the suffix from index 0).
    fn ring_read(&self, pos: u64, dst: &mut [u8]) {
        let idx = pos as usize % PIPEBUF;
        let prefix = cmp::min(dst.len(), PIPEBUF - idx);
        // SAFETY: the caller holds the ctl lock, and ranges stay in PIPEBUF.
        unsafe {
            core::ptr::copy_nonoverlapping(self.buffer().add(idx), dst.as_mut_ptr(), prefix);
            if prefix < dst.len() {
                core::ptr::copy_nonoverlapping(
                    self.buffer(),
                    dst.as_mut_ptr().add(prefix),
                    dst.len() - prefix,
                );
            }
        }
    }

    /// Copy `src` into the ring starting at `pos`, wrapping as above.
    fn ring_write(&self, pos: u64, src: &[u8]) {
        let idx = pos as usize % PIPEBUF;
        let prefix = cmp::min(src.len(), PIPEBUF - idx);
        // SAFETY: the caller holds the ctl lock, and ranges stay in PIPEBUF.
        unsafe {
            core::ptr::copy_nonoverlapping(src.as_ptr(), self.buffer().add(idx), prefix);
            if prefix < src.len() {
                core::ptr::copy_nonoverlapping(
                    src.as_ptr().add(prefix),
                    self.buffer(),
                    src.len() - prefix,
                );
            }
        }
    }
}

/// # Safety
///
/// `ptr` refers to a `Pipe` at the base of a frame allocated for it. One
/// read-only and one write-only file reference it; the pipe is freed when
/// the last of the two closes.
pub struct AllocatedPipe {
    ptr: NonNull<Pipe>,
}

// SAFETY: the pipe's state is only reached through its spinlock.
unsafe impl Send for AllocatedPipe {}
unsafe impl Sync for AllocatedPipe {}

impl Deref for AllocatedPipe {
    type Target = Pipe;

    fn deref(&self) -> &Self::Target {
        // SAFETY: `ptr` refers to a live pipe until both ends close.
        unsafe { self.ptr.as_ref() }
    }
}

impl AllocatedPipe {
    /// Create a pipe: one frame hosting struct and buffer, one read end,
    /// one write end.
    pub fn alloc(ctx: &mut KernelCtx) -> Result<(RcFile, RcFile), ()> {
        let kernel = ctx.kernel();
        let page = kalloc::kalloc(kernel, Some(ctx)).ok_or(())?;
        let kva = page.into_usize();

        let pipe = kva as *mut Pipe;
        // SAFETY: the frame is ours and pipe + buffer fit in it.
        unsafe {
            core::ptr::write(
                pipe,
                Pipe {
                    ctl: Spinlock::new("pipe", PipeCtl {
                        head: 0,
                        tail: 0,
                        readopen: true,
                        writeopen: true,
                    }),
                    read_chan: WaitChannel::new(),
                    write_chan: WaitChannel::new(),
                },
            );
        }
        let ptr = NonNull::new(pipe).unwrap();

        let f0 = match kernel
            .ftable()
            .alloc(FileType::Pipe { pipe: AllocatedPipe { ptr } }, true, false)
        {
            Ok(f) => f,
            Err(()) => {
                // SAFETY: no file references the page; reclaim it.
                kalloc::kfree(kernel, unsafe { Page::from_usize(kva) });
                return Err(());
            }
        };
        let f1 = match kernel
            .ftable()
            .alloc(FileType::Pipe { pipe: AllocatedPipe { ptr } }, false, true)
        {
            Ok(f) => f,
            Err(()) => {
                // Close the write side by hand so freeing the read side
                // releases the page.
                AllocatedPipe { ptr }.close(true, ctx);
                f0.free(ctx);
                return Err(());
            }
        };
        Ok((f0, f1))
    }

    /// Read up to `n` bytes into user memory. Blocks while the pipe is
    /// empty and writers remain; 0 at EOF.
    pub fn read(&self, ctx: &mut KernelCtx, addr: UVAddr, n: usize) -> Result<usize, ()> {
        let kernel = ctx.kernel();
        let mut done = 0usize;
        let mut bounce = [0u8; 128];

        loop {
            let mut ctl = self.ctl.lock();
            while ctl.head == ctl.tail && ctl.writeopen && done == 0 {
                if ctx.proc().killed() {
                    return Err(());
                }
                self.read_chan.sleep(&mut ctl, ctx);
            }
            let avail = (ctl.tail - ctl.head) as usize;
            if avail == 0 {
                // Drained, and either EOF or a partial read to deliver.
                return Ok(done);
            }

            let m = cmp::min(cmp::min(n - done, avail), bounce.len());
            self.ring_read(ctl.head, &mut bounce[..m]);
            ctl.head += m as u64;
            self.write_chan.wakeup(kernel);
            drop(ctl);

            copy_out(ctx, addr + done, &bounce[..m])?;
            done += m;
            if done == n {
                return Ok(done);
            }
        }
    }

    /// Write `n` bytes from user memory. Blocks while the buffer is full;
    /// errors once no reader remains.
    pub fn write(&self, ctx: &mut KernelCtx, addr: UVAddr, n: usize) -> Result<usize, ()> {
        let kernel = ctx.kernel();
        let mut done = 0usize;
        let mut bounce = [0u8; 128];

        while done < n {
            // Stage the next chunk without any spinlock held; faulting the
            // user page in may sleep.
            let m = cmp::min(n - done, bounce.len());
            copy_in(ctx, addr + done, &mut bounce[..m])?;

            let mut sent = 0usize;
            while sent < m {
                let mut ctl = self.ctl.lock();
                if !ctl.readopen || ctx.proc().killed() {
                    return Err(());
                }
                let space = PIPEBUF - (ctl.tail - ctl.head) as usize;
                if space == 0 {
                    self.read_chan.wakeup(kernel);
                    self.write_chan.sleep(&mut ctl, ctx);
                    continue;
                }
                let k = cmp::min(m - sent, space);
                self.ring_write(ctl.tail, &bounce[sent..sent + k]);
                ctl.tail += k as u64;
                sent += k;
                self.read_chan.wakeup(kernel);
            }
            done += m;
        }
        Ok(n)
    }

    /// Close one end: wake the opposite side (on its channel address) and
    /// free the page once both ends are closed.
    pub fn close(self, writable: bool, ctx: &KernelCtx) {
        let kernel = ctx.kernel();
        let free_page = {
            let mut ctl = self.ctl.lock();
            if writable {
                ctl.writeopen = false;
                self.read_chan.wakeup(kernel);
            } else {
                ctl.readopen = false;
                self.write_chan.wakeup(kernel);
            }
            !ctl.readopen && !ctl.writeopen
        };
        if free_page {
            // SAFETY: both ends are closed, so no reference to the pipe
            // remains; the page returns to the allocator.
            kalloc::kfree(kernel, unsafe { Page::from_usize(self.ptr.as_ptr() as usize) });
        }
    }
}

#[cfg(test)]
mod tests {
    use std::vec;
    use std::vec::Vec;

    use super::*;
    use crate::kernel::Kernel;
    use crate::proc::KernelCtx;
    use crate::testing::boot_alloc_only;
    use crate::vm::{RegionKind, VSpace, CODESTART};

    const UBUF: usize = 0x40000;

    /// A context whose process owns two pages of user memory at UBUF.
    fn user_ctx() -> (&'static Kernel, KernelCtx) {
        let (kernel, mut ctx) = boot_alloc_only(128);
        let mut vs = VSpace::new(kernel, Some(&ctx)).unwrap();
        vs.set_code_base(CODESTART);
        vs.set_heap_base(UBUF);
        vs.add_map(kernel, Some(&ctx), RegionKind::Heap, UBUF, 2, true)
            .unwrap();
        vs.attach(kernel);
        ctx.proc_data_mut().vspace = Some(vs);
        (kernel, ctx)
    }

    fn put_user(ctx: &mut KernelCtx, bytes: &[u8]) {
        copy_out(ctx, UBUF.into(), bytes).unwrap();
    }

    fn get_user(ctx: &mut KernelCtx, n: usize) -> Vec<u8> {
        let mut v = vec![0u8; n];
        copy_in(ctx, (UBUF + PGSIZE).into(), &mut v).unwrap();
        v
    }

    #[test]
    fn short_read_then_eof() {
        let (kernel, mut ctx) = user_ctx();
        let free0 = kernel.kmem().lock().free_pages();
        let (r, w) = AllocatedPipe::alloc(&mut ctx).unwrap();

        put_user(&mut ctx, b"abc");
        assert_eq!(w.write(&mut ctx, UBUF.into(), 3).unwrap(), 3);

        // A reader asking for more than is buffered gets what is there.
        assert_eq!(r.read(&mut ctx, (UBUF + PGSIZE).into(), 8).unwrap(), 3);
        assert_eq!(&get_user(&mut ctx, 3), b"abc");

        // Writers closed, drained: EOF is a zero-length read.
        w.free(&ctx);
        assert_eq!(r.read(&mut ctx, (UBUF + PGSIZE).into(), 8).unwrap(), 0);

        r.free(&ctx);
        // Both ends closed: the pipe's page went back to the allocator.
        assert_eq!(kernel.kmem().lock().free_pages(), free0);
    }

    #[test]
    fn bytes_keep_order_across_wraparound() {
        let (_kernel, mut ctx) = user_ctx();
        let (r, w) = AllocatedPipe::alloc(&mut ctx).unwrap();

        // Several buffer-filling rounds force the ring to wrap.
        let chunk = PIPEBUF / 2 + 100;
        let mut sent: Vec<u8> = Vec::new();
        let mut received: Vec<u8> = Vec::new();
        for round in 0u8..6 {
            let data: Vec<u8> = (0..chunk).map(|i| (i as u8) ^ round).collect();
            put_user(&mut ctx, &data);
            assert_eq!(w.write(&mut ctx, UBUF.into(), chunk).unwrap(), chunk);
            sent.extend_from_slice(&data);

            let got = r.read(&mut ctx, (UBUF + PGSIZE).into(), chunk).unwrap();
            assert_eq!(got, chunk);
            received.extend_from_slice(&get_user(&mut ctx, chunk));
        }
        assert_eq!(received, sent);

        w.free(&ctx);
        r.free(&ctx);
    }

    #[test]
    fn write_without_reader_fails() {
        let (_kernel, mut ctx) = user_ctx();
        let (r, w) = AllocatedPipe::alloc(&mut ctx).unwrap();
        r.free(&ctx);

        put_user(&mut ctx, b"nobody");
        assert!(w.write(&mut ctx, UBUF.into(), 6).is_err());
        w.free(&ctx);
    }

    #[test]
    fn descriptor_permissions_are_enforced() {
        let (_kernel, mut ctx) = user_ctx();
        let (r, w) = AllocatedPipe::alloc(&mut ctx).unwrap();

        assert!(r.readable() && !r.writable());
        assert!(w.writable() && !w.readable());

        put_user(&mut ctx, b"x");
        assert!(r.write(&mut ctx, UBUF.into(), 1).is_err());
        assert!(w.read(&mut ctx, UBUF.into(), 1).is_err());

        w.free(&ctx);
        r.free(&ctx);
    }

    /// dup then close on the duplicate leaves the original end working.
    #[test]
    fn dup_close_keeps_original_alive() {
        let (_kernel, mut ctx) = user_ctx();
        let (r, w) = AllocatedPipe::alloc(&mut ctx).unwrap();

        let w2 = w.clone_ref();
        w2.free(&ctx);

        put_user(&mut ctx, b"still here");
        assert_eq!(w.write(&mut ctx, UBUF.into(), 10).unwrap(), 10);
        assert_eq!(r.read(&mut ctx, (UBUF + PGSIZE).into(), 10).unwrap(), 10);
        assert_eq!(&get_user(&mut ctx, 10), b"still here");

        w.free(&ctx);
        r.free(&ctx);
    }
}
