//! The process table and scheduler.

use core::mem;
use core::ptr;

use array_macro::array;
use itertools::izip;

use super::*;
use crate::addr::PGSIZE;
use crate::arch::{self, Context, TrapFrame};
use crate::kalloc;
use crate::kernel::Kernel;
use crate::lock::{Spinlock, SpinlockGuard};
use crate::page::Page;
use crate::param::{NOFILE, NPROC, ROOTDEV};
use crate::vm::{VSpace, CODESTART, USERTOP};

/// A user program that calls exec("/init").
/// od -t xC initcode
const INITCODE: [u8; 56] = [
    0x48, 0x8d, 0x3d, 0x1b, 0, 0, 0, // lea rdi, [rip + init]
    0x48, 0x8d, 0x35, 0x1a, 0, 0, 0, // lea rsi, [rip + argv]
    0x48, 0xc7, 0xc0, 0x07, 0, 0, 0, // mov rax, SYS_exec
    0xcd, 0x40, //                      int 0x40
    0x48, 0xc7, 0xc0, 0x02, 0, 0, 0, // mov rax, SYS_exit
    0xcd, 0x40, //                      int 0x40
    0xeb, 0xf5, //                      jmp .-9
    0x2f, 0x69, 0x6e, 0x69, 0x74, 0, // "/init\0"
    0x22, 0x00, 0x01, 0, 0, 0, 0, 0, // argv[0] = &"/init"
    0, 0, 0, 0, 0, 0, 0, 0, //          argv[1] = 0
];

pub struct ProcsCtl {
    nextpid: Pid,
    /// Slot of the initial process, once user_init has run.
    init_idx: usize,
}

/// Guard of the process-table spinlock. Holding one is the license to
/// touch any `ProcShared`.
pub type TableGuard<'s> = SpinlockGuard<'s, ProcsCtl>;

/// Process system containing and managing all processes.
pub struct Procs {
    ctl: Spinlock<ProcsCtl>,
    pool: [Proc; NPROC],
}

impl Procs {
    pub const fn new() -> Self {
        Self {
            ctl: Spinlock::new("ptable", ProcsCtl {
                nextpid: 1,
                init_idx: NPROC,
            }),
            pool: array![_ => Proc::new(); NPROC],
        }
    }

    pub fn lock_table(&self) -> TableGuard<'_> {
        self.ctl.lock()
    }

    pub fn pool(&self) -> &[Proc; NPROC] {
        &self.pool
    }

    /// Look for an UNUSED slot and initialize the state required to run in
    /// the kernel: a kernel stack whose top holds the trap frame, and a
    /// context that resumes at forkret.
    fn alloc(
        &'static self,
        kernel: &'static Kernel,
        ctx: Option<&KernelCtx>,
    ) -> Result<&'static Proc, ()> {
        let kstack = kalloc::kalloc(kernel, ctx).ok_or(())?.into_usize();

        let mut table = self.lock_table();
        for p in self.pool.iter() {
            if p.shared(&table).state != ProcState::Unused {
                continue;
            }
            let pid = table.nextpid;
            table.nextpid += 1;

            let shared = p.shared_mut(&mut table);
            shared.state = ProcState::Embryo;
            shared.pid = pid;
            shared.parent = 0;
            shared.chan = 0;
            p.clear_killed();

            // SAFETY: the slot was UNUSED, so no one else references `data`.
            let data = unsafe { &mut *p.data_raw() };
            data.kstack = kstack;
            let tf = (kstack + PGSIZE - mem::size_of::<TrapFrame>()) & !0xf;
            data.trap_frame = tf as *mut TrapFrame;
            // SAFETY: tf lies within the freshly allocated kernel stack.
            unsafe { *data.trap_frame = TrapFrame::default() };

            // Set up the context so the new process starts executing at
            // forkret, on its own stack, just below the trap frame.
            data.context = Context::new();
            data.context.rip = forkret as usize;
            data.context.rsp = tf;

            return Ok(p);
        }
        drop(table);

        // SAFETY: `kstack` came from kalloc above and was not shared.
        kalloc::kfree(kernel, unsafe { Page::from_usize(kstack) });
        Err(())
    }

    /// Set up the first user process.
    pub fn user_init(&'static self, kernel: &'static Kernel) {
        let p = self.alloc(kernel, None).expect("user_init: no proc slot");

        let mut vs = VSpace::new(kernel, None).expect("user_init: vspace");
        vs.init_code(kernel, None, &INITCODE).expect("user_init: initcode");
        vs.init_stack(kernel, None).expect("user_init: stack");
        vs.attach(kernel);

        // SAFETY: the slot is EMBRYO; only this thread references `data`.
        let data = unsafe { &mut *p.data_raw() };
        data.vspace = Some(vs);
        // SAFETY: trap_frame was set by alloc.
        let tf = unsafe { &mut *data.trap_frame };
        tf.rip = CODESTART;
        tf.rsp = USERTOP;
        tf.cs = arch::USER_CS;
        tf.ss = arch::USER_DS;
        tf.rflags = arch::RFLAGS_IF;
        let name = b"initcode\x00";
        data.name[..name.len()].copy_from_slice(name);

        let mut table = self.lock_table();
        table.init_idx = (p as *const Proc as usize - self.pool.as_ptr() as usize)
            / mem::size_of::<Proc>();
        p.shared_mut(&mut table).state = ProcState::Runnable;
    }

    /// Create a new process, copying the parent with COW.
    /// Sets up the child to return as if from the fork() system call.
    pub fn fork(&'static self, ctx: &mut KernelCtx) -> Result<Pid, ()> {
        let kernel = ctx.kernel();
        let child = self.alloc(kernel, Some(ctx))?;

        // The child's vspace sits in its slot before the copy starts, so
        // an eviction during the copy retargets the child's vpis too.
        // On any failure the embryonic child is rolled back, or its slot
        // (and half-copied memory) would leak.
        let rollback = |child| {
            let mut table = self.lock_table();
            self.freeproc(kernel, child, &mut table);
        };
        let child_vs = match VSpace::new(kernel, Some(ctx)) {
            Ok(vs) => vs,
            Err(()) => {
                rollback(child);
                return Err(());
            }
        };
        // SAFETY: the child is EMBRYO; only this thread references its data.
        let cdata = unsafe { &mut *child.data_raw() };
        cdata.vspace = Some(child_vs);

        let parent_ctx = *ctx;
        let copied = ctx
            .proc_data_mut()
            .vspace
            .as_mut()
            .expect("fork: no vspace")
            .copy_cow_into(cdata.vspace.as_mut().unwrap(), kernel, &parent_ctx);
        if copied.is_err() {
            rollback(child);
            return Err(());
        }

        // Duplicate the trap frame; the child observes return value 0.
        // SAFETY: both trap frames were set by alloc.
        unsafe {
            *cdata.trap_frame = *ctx.proc_data().trap_frame;
            (*cdata.trap_frame).rax = 0;
        }

        // Share open files.
        for (cf, f) in izip!(cdata.files.iter_mut(), ctx.proc_data().files.iter()) {
            if let Some(file) = f {
                *cf = Some(file.clone_ref());
            }
        }
        cdata.name.copy_from_slice(&ctx.proc_data().name);

        let pid = child.pid_raw();
        let mut table = self.lock_table();
        let shared = child.shared_mut(&mut table);
        shared.parent = ctx.pid();
        shared.state = ProcState::Runnable;
        Ok(pid)
    }

    /// Exit the current process. Does not return. The process stays a
    /// zombie until its parent calls wait().
    pub fn exit_current(&'static self, mut ctx: KernelCtx) -> ! {
        // Close all open files before taking the table lock; closing may
        // commit a transaction and sleep.
        for i in 0..NOFILE {
            if let Some(f) = ctx.proc_data_mut().files[i].take() {
                f.free(&ctx);
            }
        }

        let mut table = self.lock_table();
        assert!(
            !ptr::eq(ctx.proc(), &self.pool[table.init_idx]),
            "init exiting"
        );

        // Pass abandoned children to init.
        let init_pid = self.pool[table.init_idx].shared(&table).pid;
        let init_chan = self.pool[table.init_idx].child_chan.addr();
        let mypid = ctx.pid();
        for p in self.pool.iter() {
            if p.shared(&table).parent == mypid {
                let shared = p.shared_mut(&mut table);
                shared.parent = init_pid;
                if shared.state == ProcState::Zombie {
                    self.wakeup_locked(init_chan, &mut table);
                }
            }
        }

        // The parent might be sleeping in wait().
        let parent_pid = ctx.proc().shared(&table).parent;
        if let Some(parent) = self.find_locked(parent_pid, &table) {
            let chan = parent.child_chan.addr();
            self.wakeup_locked(chan, &mut table);
        }

        ctx.proc().shared_mut(&mut table).state = ProcState::Zombie;

        // Jump into the scheduler, never to return.
        self.sched(&mut table, &mut ctx);
        unreachable!("zombie exit")
    }

    /// Wait for a child process to exit, reap it, and return its pid.
    pub fn wait(&'static self, ctx: &mut KernelCtx) -> Result<Pid, ()> {
        let kernel = ctx.kernel();
        let mypid = ctx.pid();
        let mut table = self.lock_table();

        loop {
            let mut havekids = false;
            for p in self.pool.iter() {
                if p.shared(&table).parent != mypid {
                    continue;
                }
                havekids = true;
                if p.shared(&table).state == ProcState::Zombie {
                    let pid = p.shared(&table).pid;
                    self.freeproc(kernel, p, &mut table);
                    return Ok(pid);
                }
            }

            // No point waiting if we have no children.
            if !havekids || ctx.proc().killed() {
                return Err(());
            }

            // Wait for a child to exit.
            let chan = ctx.proc().child_chan.addr();
            self.sleep_on_table(chan, &mut table, ctx);
        }
    }

    /// Kill the process with the given pid. The victim exits when it next
    /// returns toward user mode.
    pub fn kill(&self, pid: Pid) -> Result<(), ()> {
        let mut table = self.lock_table();
        for p in self.pool.iter() {
            if p.shared(&table).pid == pid && p.shared(&table).state != ProcState::Unused {
                p.kill();
                let shared = p.shared_mut(&mut table);
                if shared.state == ProcState::Sleeping {
                    shared.state = ProcState::Runnable;
                }
                return Ok(());
            }
        }
        Err(())
    }

    /// Wake up all processes sleeping on `chan`.
    pub fn wakeup(&self, chan: usize) {
        let mut table = self.lock_table();
        self.wakeup_locked(chan, &mut table);
    }

    pub fn wakeup_locked(&self, chan: usize, table: &mut TableGuard<'_>) {
        for p in self.pool.iter() {
            let shared = p.shared_mut(table);
            if shared.state == ProcState::Sleeping && shared.chan == chan {
                shared.state = ProcState::Runnable;
            }
        }
    }

    /// Sleep on `chan`. The caller holds the table lock (and nothing else);
    /// it is held again when this returns.
    pub fn sleep_on_table(&'static self, chan: usize, table: &mut TableGuard<'_>, ctx: &KernelCtx) {
        let shared = ctx.proc().shared_mut(table);
        shared.chan = chan;
        shared.state = ProcState::Sleeping;

        let mut ctx = *ctx;
        self.sched(table, &mut ctx);

        ctx.proc().shared_mut(table).chan = 0;
    }

    /// Give up the CPU for one scheduling round.
    pub fn yield_cpu(&'static self, ctx: &mut KernelCtx) {
        let mut table = self.lock_table();
        ctx.proc().shared_mut(&mut table).state = ProcState::Runnable;
        self.sched(&mut table, ctx);
    }

    /// Switch to the scheduler. Must hold exactly the table lock and have
    /// already changed the process's state away from RUNNING.
    fn sched(&'static self, table: &mut TableGuard<'_>, ctx: &mut KernelCtx) {
        assert!(!arch::intr_get(), "sched interruptible");
        assert_eq!(arch::intr_depth(), 1, "sched locks");
        assert_ne!(
            ctx.proc().shared(table).state,
            ProcState::Running,
            "sched running"
        );

        // interrupt_enabled is a property of this kernel thread, not of the
        // CPU, so carry it across the switch.
        let intena = arch::intr_was_enabled();
        let cpu = ctx.kernel().mycpu();
        // SAFETY: the scheduler context was saved by the scheduler loop on
        // this CPU, and interrupts are off.
        unsafe {
            arch::context_switch(&mut ctx.proc_data_mut().context, &mut (*cpu).context);
        }
        arch::set_intr_was_enabled(intena);
    }

    /// Per-CPU scheduler loop; never returns. Chooses a RUNNABLE process,
    /// installs its address space, and switches to it. The process returns
    /// the CPU by changing its state and calling sched.
    pub fn scheduler(&'static self, kernel: &'static Kernel) -> ! {
        let cpu = kernel.mycpu();
        // SAFETY: this function never migrates to another CPU.
        unsafe { (*cpu).proc = ptr::null() };
        loop {
            // Avoid deadlock by ensuring that devices can interrupt.
            // SAFETY: the boot path installed the interrupt vectors.
            unsafe { arch::intr_on() };

            let mut table = self.lock_table();
            for p in self.pool.iter() {
                if p.shared(&table).state != ProcState::Runnable {
                    continue;
                }
                p.shared_mut(&mut table).state = ProcState::Running;
                // SAFETY: interrupts are off while the table lock is held.
                unsafe { (*cpu).proc = p };
                // SAFETY: a RUNNABLE process has an initialized vspace.
                unsafe { (*p.data_raw()).vspace.as_ref().unwrap().install() };

                // SAFETY: the process context was built by alloc or saved
                // by a previous sched.
                unsafe {
                    arch::context_switch(&mut (*cpu).context, &mut (*p.data_raw()).context);
                }

                // The process is done running for now; it changed its state
                // before coming back.
                unsafe { (*cpu).proc = ptr::null() };
            }
            drop(table);
        }
    }

    /// Free a process slot and everything hanging from it.
    pub fn freeproc(&self, kernel: &'static Kernel, p: &Proc, table: &mut TableGuard<'_>) {
        // SAFETY: the process is ZOMBIE (or a failed EMBRYO), so its thread
        // is gone and we hold the table lock.
        let data = unsafe { &mut *p.data_raw() };
        if let Some(vs) = data.vspace.take() {
            vs.free(kernel);
        }
        if data.kstack != 0 {
            // SAFETY: kstack was allocated by alloc and is unshared.
            kalloc::kfree(kernel, unsafe { Page::from_usize(data.kstack) });
            data.kstack = 0;
        }
        data.trap_frame = ptr::null_mut();
        data.name[0] = 0;

        let shared = p.shared_mut(table);
        shared.state = ProcState::Unused;
        shared.pid = 0;
        shared.parent = 0;
        shared.chan = 0;
        p.clear_killed();
    }

    /// Print a process listing to the console, for debugging (console ^P).
    /// Takes no locks, to avoid wedging a stuck machine further.
    pub fn dump(&self) {
        crate::println!();
        for p in self.pool.iter() {
            // SAFETY: debugging read; values may be torn.
            let shared = unsafe { p.shared_unchecked() };
            if shared.state == ProcState::Unused {
                continue;
            }
            // SAFETY: as above.
            let name = unsafe { &(*p.data_raw()).name };
            let len = name.iter().position(|&c| c == 0).unwrap_or(name.len());
            crate::println!(
                "{} {:?} {}",
                shared.pid,
                shared.state,
                core::str::from_utf8(&name[..len]).unwrap_or("???")
            );
        }
    }

    /// The live process with pid `pid`, if any.
    fn find_locked<'a>(&'a self, pid: Pid, table: &TableGuard<'_>) -> Option<&'a Proc> {
        if pid == 0 {
            return None;
        }
        self.pool
            .iter()
            .find(|p| p.shared(table).pid == pid && p.shared(table).state != ProcState::Unused)
    }

    /// Retarget every address space that maps frame `ppn` to swap slot
    /// `slot`. Called by the eviction path with the table lock held.
    pub fn mark_swapped_all(&self, table: &mut TableGuard<'_>, ppn: u32, slot: u32) {
        for p in self.pool.iter() {
            if p.shared(table).state == ProcState::Unused {
                continue;
            }
            // SAFETY: address-space metadata of other processes may be
            // rewritten under the table lock; their threads are either not
            // running or are the caller itself.
            let data = unsafe { &mut *p.data_raw() };
            if let Some(vs) = data.vspace.as_mut() {
                vs.mark_swapped(ppn, slot);
            }
        }
    }

    /// Inverse of `mark_swapped_all`: slot came back in as frame `ppn`.
    pub fn mark_swapped_in_all(&self, table: &mut TableGuard<'_>, slot: u32, ppn: u32) {
        for p in self.pool.iter() {
            if p.shared(table).state == ProcState::Unused {
                continue;
            }
            // SAFETY: as in mark_swapped_all.
            let data = unsafe { &mut *p.data_raw() };
            if let Some(vs) = data.vspace.as_mut() {
                vs.mark_swapped_in(slot, ppn);
            }
        }
    }
}

/// A fork child's very first scheduling by scheduler() will swtch here.
unsafe extern "C" fn forkret() {
    let kernel = crate::kernel::kernel();
    // Still holding the process-table lock from the scheduler.
    // SAFETY: the scheduler acquired it and handed it to this thread.
    unsafe { kernel.procs().ctl.force_unlock() };

    let ctx = unsafe { current_ctx(kernel) };

    // File system initialization must run in the context of a regular
    // process (it sleeps on disk I/O), so it cannot run from main().
    kernel.fs().init(ROOTDEV, &ctx);

    // SAFETY: the trap frame was prepared by alloc/userinit/fork.
    unsafe { arch::trap_return(ctx.proc_data().trap_frame) }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::boot_alloc_only;
    use crate::vm::{RegionKind, VSpace};

    fn state_of(procs: &Procs, p: &Proc) -> ProcState {
        let table = procs.lock_table();
        p.shared(&table).state
    }

    #[test]
    fn alloc_prepares_an_embryo() {
        let (kernel, _ctx) = boot_alloc_only(64);
        let procs = kernel.procs();

        let p = procs.alloc(kernel, None).unwrap();
        assert_eq!(state_of(procs, p), ProcState::Embryo);
        assert!(p.pid_raw() > 0);

        // SAFETY: the slot is EMBRYO and no thread runs it.
        let data = unsafe { &*p.data_raw() };
        assert!(data.kstack != 0);
        assert!(!data.trap_frame.is_null());
        assert_eq!(data.context.rip, forkret as usize);

        let mut table = procs.lock_table();
        procs.freeproc(kernel, p, &mut table);
        assert_eq!(p.shared(&table).state, ProcState::Unused);
    }

    #[test]
    fn pids_are_unique_and_increasing() {
        let (kernel, _ctx) = boot_alloc_only(64);
        let procs = kernel.procs();
        let a = procs.alloc(kernel, None).unwrap();
        let b = procs.alloc(kernel, None).unwrap();
        assert!(b.pid_raw() > a.pid_raw());

        let mut table = procs.lock_table();
        procs.freeproc(kernel, a, &mut table);
        procs.freeproc(kernel, b, &mut table);
    }

    #[test]
    fn user_init_builds_the_first_process() {
        let (kernel, _ctx) = boot_alloc_only(128);
        let procs = kernel.procs();
        procs.user_init(kernel);

        let table = procs.lock_table();
        let init = &procs.pool()[table.init_idx];
        assert_eq!(init.shared(&table).state, ProcState::Runnable);
        // SAFETY: nothing runs the process in this test.
        let data = unsafe { &*init.data_raw() };
        assert_eq!(&data.name[..8], b"initcode");
        assert!(data.vspace.is_some());
        // SAFETY: the trap frame was initialized by user_init.
        let tf = unsafe { &*data.trap_frame };
        assert_eq!(tf.rip, CODESTART);
        assert_eq!(tf.rsp, USERTOP);
        assert_ne!(tf.rflags & arch::RFLAGS_IF, 0);
    }

    #[test]
    fn kill_wakes_a_sleeper() {
        let (kernel, _ctx) = boot_alloc_only(64);
        let procs = kernel.procs();
        let p = procs.alloc(kernel, None).unwrap();
        let pid = p.pid_raw();

        {
            let mut table = procs.lock_table();
            let shared = p.shared_mut(&mut table);
            shared.state = ProcState::Sleeping;
            shared.chan = 0xdead;
        }

        assert!(procs.kill(pid).is_ok());
        assert!(p.killed());
        assert_eq!(state_of(procs, p), ProcState::Runnable);

        // Killing a nonexistent pid touches nothing.
        assert!(procs.kill(9999).is_err());

        let mut table = procs.lock_table();
        procs.freeproc(kernel, p, &mut table);
    }

    #[test]
    fn wakeup_matches_by_channel_address() {
        let (kernel, _ctx) = boot_alloc_only(64);
        let procs = kernel.procs();
        let a = procs.alloc(kernel, None).unwrap();
        let b = procs.alloc(kernel, None).unwrap();

        {
            let mut table = procs.lock_table();
            let sa = a.shared_mut(&mut table);
            sa.state = ProcState::Sleeping;
            sa.chan = 0x1000;
            let sb = b.shared_mut(&mut table);
            sb.state = ProcState::Sleeping;
            sb.chan = 0x2000;
        }

        procs.wakeup(0x1000);
        assert_eq!(state_of(procs, a), ProcState::Runnable);
        assert_eq!(state_of(procs, b), ProcState::Sleeping);

        let mut table = procs.lock_table();
        procs.freeproc(kernel, a, &mut table);
        procs.freeproc(kernel, b, &mut table);
    }

    /// Reaping: wait returns a zombie child's pid and recycles the slot.
    #[test]
    fn wait_reaps_zombie_children() {
        let (kernel, mut ctx) = boot_alloc_only(64);
        let procs = kernel.procs();

        let child = procs.alloc(kernel, None).unwrap();
        let child_pid = child.pid_raw();
        {
            let mut table = procs.lock_table();
            let shared = child.shared_mut(&mut table);
            shared.parent = ctx.pid();
            shared.state = ProcState::Zombie;
        }

        assert_eq!(procs.wait(&mut ctx).unwrap(), child_pid);
        assert_eq!(state_of(procs, child), ProcState::Unused);

        // Without children, wait errors instead of sleeping forever.
        assert!(procs.wait(&mut ctx).is_err());
    }

    /// Fork observes: a RUNNABLE child, rax 0 in its frame, shared file
    /// refs, and COW-shared memory.
    #[test]
    fn fork_copies_the_parent() {
        let (kernel, mut ctx) = boot_alloc_only(128);
        let procs = kernel.procs();

        // Give the test process a trap frame and one writable page.
        let tf_page = kalloc::kalloc(kernel, None).unwrap().into_usize();
        let tf = tf_page as *mut TrapFrame;
        // SAFETY: freshly allocated frame.
        unsafe {
            *tf = TrapFrame::default();
            (*tf).rax = 77;
            (*tf).rip = 0x123;
        }
        ctx.proc_data_mut().trap_frame = tf;

        let mut vs = VSpace::new(kernel, Some(&ctx)).unwrap();
        vs.set_code_base(CODESTART);
        vs.set_heap_base(0x40000);
        vs.add_map(kernel, Some(&ctx), RegionKind::Heap, 0x40000, 1, true)
            .unwrap();
        vs.attach(kernel);
        ctx.proc_data_mut().vspace = Some(vs);
        crate::vm::copy_out(&mut ctx, 0x40000.into(), b"parent").unwrap();

        let child_pid = procs.fork(&mut ctx).unwrap();
        let table = procs.lock_table();
        let child = procs
            .pool()
            .iter()
            .find(|p| p.shared(&table).pid == child_pid)
            .unwrap();
        assert_eq!(child.shared(&table).state, ProcState::Runnable);
        assert_eq!(child.shared(&table).parent, ctx.pid());
        drop(table);

        // SAFETY: the child never runs in this test.
        let cdata = unsafe { &*child.data_raw() };
        // SAFETY: fork duplicated the parent's trap frame.
        let ctf = unsafe { &*cdata.trap_frame };
        assert_eq!(ctf.rax, 0);
        assert_eq!(ctf.rip, 0x123);

        // Parent and child share the heap frame copy-on-write.
        let kva = match ctx
            .proc_data_mut()
            .vspace
            .as_ref()
            .unwrap()
            .lookup(0x40000, false)
        {
            crate::vm::PageLookup::Mapped { kva } => kva,
            _ => panic!("parent heap page missing"),
        };
        assert_eq!(kernel.kmem().lock().refcnt(kva), 2);

        let mut table = procs.lock_table();
        procs.freeproc(kernel, child, &mut table);
        drop(table);
        assert_eq!(kernel.kmem().lock().refcnt(kva), 1);

        if let Some(vs) = ctx.proc_data_mut().vspace.take() {
            vs.free(kernel);
        }
        // SAFETY: reconstructing the trap-frame page allocated above.
        kalloc::kfree(kernel, unsafe { Page::from_usize(tf_page) });
    }
}
