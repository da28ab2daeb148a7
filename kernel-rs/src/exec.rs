//! ELF program loading.

use core::cmp;
use core::mem;

use arrayvec::ArrayVec;
use zerocopy::{AsBytes, FromBytes};

use crate::addr::{pgroundup, PGSIZE};
use crate::fs::Path;
use crate::param::MAXARG;
use crate::proc::KernelCtx;
use crate::vm::{RegionKind, VSpace, CODESTART, USERTOP};

/// "\x7FELF" in little endian.
const ELF_MAGIC: u32 = 0x464c_457f;

/// Program header type for loadable segments.
const ELF_PROG_LOAD: u32 = 1;

/// ELF64 file header.
#[repr(C)]
#[derive(Default, Copy, Clone, AsBytes, FromBytes)]
struct ElfHdr {
    /// Must equal ELF_MAGIC.
    magic: u32,
    elf: [u8; 12],
    typ: u16,
    machine: u16,
    version: u32,
    entry: usize,
    phoff: usize,
    shoff: usize,
    flags: u32,
    ehsize: u16,
    phentsize: u16,
    phnum: u16,
    shentsize: u16,
    shnum: u16,
    shstrndx: u16,
}

/// ELF64 program header.
#[repr(C)]
#[derive(Default, Copy, Clone, AsBytes, FromBytes)]
struct ProgHdr {
    typ: u32,
    flags: u32,
    off: usize,
    vaddr: usize,
    paddr: usize,
    filesz: usize,
    memsz: usize,
    align: usize,
}

impl ElfHdr {
    fn is_valid(&self) -> bool {
        self.magic == ELF_MAGIC
    }
}

impl ProgHdr {
    fn is_prog_load(&self) -> bool {
        self.typ == ELF_PROG_LOAD
    }
}

/// Replace the current process's image with the program at `path`.
/// Returns argc, which lands in rax; the program sees argc/argv through
/// rdi/rsi.
pub fn exec(ctx: &mut KernelCtx, path: &Path, args: &[&[u8]]) -> Result<usize, ()> {
    if args.len() > MAXARG {
        return Err(());
    }
    let kernel = ctx.kernel();

    let ip = path.namei(ctx)?;
    let mut guard = ip.lock(ctx);

    // Check the ELF header.
    let mut elf = ElfHdr::default();
    if guard.read_bytes(0, elf.as_bytes_mut(), ctx) != mem::size_of::<ElfHdr>()
        || !elf.is_valid()
    {
        return Err(());
    }

    // The code region spans all loadable segments, read-only, rooted at
    // the fixed load address.
    let mut top = CODESTART;
    for i in 0..elf.phnum as usize {
        let mut ph = ProgHdr::default();
        let off = elf.phoff + i * mem::size_of::<ProgHdr>();
        if guard.read_bytes(off as u32, ph.as_bytes_mut(), ctx) != mem::size_of::<ProgHdr>() {
            return Err(());
        }
        if !ph.is_prog_load() {
            continue;
        }
        if ph.memsz < ph.filesz || ph.vaddr < CODESTART || ph.vaddr % PGSIZE != 0 {
            return Err(());
        }
        top = cmp::max(top, ph.vaddr.checked_add(ph.memsz).ok_or(())?);
    }
    if top == CODESTART || top >= USERTOP / 2 {
        return Err(());
    }

    // Build the new image detached from any process: its frames stay
    // invisible to the eviction path until the image is committed.
    let mut vs = VSpace::new(kernel, Some(ctx))?;
    if build_image(ctx, &mut vs, &mut guard, &elf, top).is_err() {
        vs.free(kernel);
        return Err(());
    }
    drop(guard);
    drop(ip);

    // User stack, with the argument strings and the argv array at the top.
    let sp = match build_stack(ctx, &mut vs, args) {
        Ok(sp) => sp,
        Err(()) => {
            vs.free(kernel);
            return Err(());
        }
    };

    // Save the program name for debugging.
    let path_bytes = path.as_bytes();
    let name = path_bytes
        .iter()
        .rposition(|&c| c == b'/')
        .map(|i| &path_bytes[i + 1..])
        .unwrap_or(path_bytes);
    let proc_name = &mut ctx.proc_data_mut().name;
    let len = cmp::min(proc_name.len() - 1, name.len());
    proc_name[..len].copy_from_slice(&name[..len]);
    proc_name[len] = 0;

    // Commit to the new image.
    vs.attach(kernel);
    let old = ctx.proc_data_mut().vspace.replace(vs);
    // SAFETY: the trap frame belongs to the current process.
    let tf = unsafe { &mut *ctx.proc_data().trap_frame };
    tf.rip = elf.entry;
    tf.rsp = sp;
    tf.rdi = args.len();
    tf.rsi = sp;
    ctx.proc_data().vspace.as_ref().unwrap().install();

    if let Some(old) = old {
        old.free(kernel);
    }
    Ok(args.len())
}

/// Map the code region and read every loadable segment into it.
fn build_image(
    ctx: &mut KernelCtx,
    vs: &mut VSpace,
    guard: &mut crate::fs::InodeGuard<'_>,
    elf: &ElfHdr,
    top: usize,
) -> Result<(), ()> {
    let kernel = ctx.kernel();
    let npages = pgroundup(top - CODESTART) / PGSIZE;
    vs.set_code_base(CODESTART);
    vs.add_map(kernel, Some(ctx), RegionKind::Code, CODESTART, npages, false)?;
    vs.set_heap_base(pgroundup(top));

    let mut bounce = [0u8; 512];
    for i in 0..elf.phnum as usize {
        let mut ph = ProgHdr::default();
        let off = elf.phoff + i * mem::size_of::<ProgHdr>();
        if guard.read_bytes(off as u32, ph.as_bytes_mut(), ctx) != mem::size_of::<ProgHdr>() {
            return Err(());
        }
        if !ph.is_prog_load() {
            continue;
        }
        let mut done = 0;
        while done < ph.filesz {
            let m = cmp::min(ph.filesz - done, bounce.len());
            if guard.read_bytes((ph.off + done) as u32, &mut bounce[..m], ctx) != m {
                return Err(());
            }
            vs.fill(RegionKind::Code, ph.vaddr + done, &bounce[..m]);
            done += m;
        }
        // memsz beyond filesz is bss; pages were zeroed at allocation.
    }
    Ok(())
}

/// Map the initial stack page and push argv onto it. Returns the initial
/// user stack pointer.
fn build_stack(ctx: &mut KernelCtx, vs: &mut VSpace, args: &[&[u8]]) -> Result<usize, ()> {
    let kernel = ctx.kernel();
    vs.set_stack_base(USERTOP);
    vs.add_map(
        kernel,
        Some(ctx),
        RegionKind::Stack,
        USERTOP - PGSIZE,
        1,
        true,
    )?;
    let stackbase = USERTOP - PGSIZE;

    let mut sp = USERTOP;
    let mut ustack = ArrayVec::<usize, { MAXARG + 1 }>::new();

    for arg in args.iter() {
        sp -= arg.len() + 1;
        sp &= !7;
        if sp < stackbase {
            return Err(());
        }
        vs.fill(RegionKind::Stack, sp, arg);
        vs.fill(RegionKind::Stack, sp + arg.len(), &[0]);
        ustack.push(sp);
    }
    ustack.push(0);

    let argv_size = ustack.len() * mem::size_of::<usize>();
    sp -= argv_size;
    sp &= !0xf;
    if sp < stackbase {
        return Err(());
    }
    vs.fill(RegionKind::Stack, sp, ustack.as_bytes());
    Ok(sp)
}
