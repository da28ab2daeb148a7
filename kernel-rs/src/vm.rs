//! Per-process virtual address spaces.
//!
//! A vspace is three regions — code (read-only), heap (grows up via sbrk),
//! and user stack (grows down on fault, up to ten pages) — plus the root
//! of a 4-level x86-64 page table. Each virtual page has a vpi recording
//! whether it is present, writable, copy-on-write, or swapped, and which
//! frame or swap slot backs it. Vpis live in frames chained off each
//! region, so a vspace's entire footprint comes from the page allocator.
//!
//! Frames of a vspace that is not yet attached to a process are invisible
//! to the eviction path (their core-map entries carry no user va); `attach`
//! publishes them once the vspace is committed to a process.

use core::mem;
use core::ptr;

use bitflags::bitflags;

use crate::addr::{pgrounddown, pgroundup, Addr, UVAddr, PGSHIFT, PGSIZE};
use crate::arch;
use crate::kalloc::{self, kva_of_ppn, ppn_of_kva};
use crate::kernel::Kernel;
use crate::param::STACKPAGES;
use crate::proc::KernelCtx;
use crate::swap;

/// Load address of user programs.
pub const CODESTART: usize = 0x10000;

/// Exclusive top of user space; the stack grows down from here.
pub const USERTOP: usize = 0x8000_0000;

pub const NREGION: usize = 3;

bitflags! {
    pub struct PteFlags: usize {
        const P = 1 << 0;
        const W = 1 << 1;
        const U = 1 << 2;
    }
}

const PTE_PA_MASK: usize = 0x000f_ffff_ffff_f000;

#[derive(Default)]
struct PageTableEntry {
    inner: usize,
}

impl PageTableEntry {
    fn flags(&self) -> PteFlags {
        PteFlags::from_bits_truncate(self.inner)
    }

    fn is_present(&self) -> bool {
        self.flags().contains(PteFlags::P)
    }

    fn pa(&self) -> usize {
        self.inner & PTE_PA_MASK
    }

    fn set(&mut self, pa: usize, perm: PteFlags) {
        debug_assert_eq!(pa & !PTE_PA_MASK, 0);
        self.inner = pa | (perm | PteFlags::P).bits();
    }

    fn clear(&mut self) {
        self.inner = 0;
    }

    fn clear_writable(&mut self) {
        self.inner &= !PteFlags::W.bits();
    }
}

#[repr(C, align(4096))]
struct RawPageTable {
    entries: [PageTableEntry; 512],
}

/// The page-table half of a vspace: the root frame plus walk/map/unmap.
struct PageTable {
    /// Kernel VA of the root (PML4) frame.
    root: usize,
}

impl PageTable {
    fn new(kernel: &'static Kernel, ctx: Option<&KernelCtx>) -> Result<Self, ()> {
        let mut page = kalloc::kalloc(kernel, ctx).ok_or(())?;
        page.write_bytes(0);
        let root = page.into_usize();

        // Every address space shares the kernel half of the PML4.
        if let Some(kroot) = arch::kernel_root() {
            // SAFETY: both roots are page-table frames.
            unsafe {
                let src = arch::p2v(kroot) as *const RawPageTable;
                let dst = root as *mut RawPageTable;
                for i in 256..512 {
                    (*dst).entries[i].inner = (*src).entries[i].inner;
                }
            }
        }
        Ok(Self { root })
    }

    fn root_pa(&self) -> usize {
        arch::v2p(self.root)
    }

    /// Pointer to the leaf PTE for `va`, allocating intermediate tables
    /// when `alloc` provides an allocator context.
    fn walk(
        &self,
        va: usize,
        alloc: Option<(&'static Kernel, Option<&KernelCtx>)>,
    ) -> Option<*mut PageTableEntry> {
        let uva = UVAddr::from(va);
        let mut table = self.root as *mut RawPageTable;
        for level in (1..4).rev() {
            // SAFETY: `table` is a live page-table frame of this vspace.
            let pte = unsafe { &mut (*table).entries[uva.px(level)] };
            if pte.is_present() {
                table = arch::p2v(pte.pa()) as *mut RawPageTable;
            } else {
                let (kernel, ctx) = alloc?;
                let mut page = kalloc::kalloc(kernel, ctx)?;
                page.write_bytes(0);
                let kva = page.into_usize();
                pte.set(arch::v2p(kva), PteFlags::W | PteFlags::U);
                table = kva as *mut RawPageTable;
            }
        }
        // SAFETY: as above.
        Some(unsafe { &mut (*table).entries[uva.px(0)] })
    }

    fn map(
        &mut self,
        kernel: &'static Kernel,
        ctx: Option<&KernelCtx>,
        va: usize,
        ppn: u32,
        writable: bool,
    ) -> Result<(), ()> {
        let pte = self.walk(va, Some((kernel, ctx))).ok_or(())?;
        let mut perm = PteFlags::U;
        if writable {
            perm |= PteFlags::W;
        }
        // SAFETY: walk returned a live PTE pointer.
        unsafe { (*pte).set((ppn as usize) << PGSHIFT, perm) };
        Ok(())
    }

    /// Remap an address whose intermediate tables already exist.
    fn remap(&self, va: usize, ppn: u32, writable: bool) {
        let pte = self.walk(va, None).expect("remap: unmapped table");
        let mut perm = PteFlags::U;
        if writable {
            perm |= PteFlags::W;
        }
        // SAFETY: walk returned a live PTE pointer.
        unsafe { (*pte).set((ppn as usize) << PGSHIFT, perm) };
    }

    fn clear_present(&self, va: usize) {
        if let Some(pte) = self.walk(va, None) {
            // SAFETY: walk returned a live PTE pointer.
            unsafe { (*pte).clear() };
        }
    }

    fn clear_writable(&self, va: usize) {
        if let Some(pte) = self.walk(va, None) {
            // SAFETY: walk returned a live PTE pointer.
            unsafe { (*pte).clear_writable() };
        }
    }

    /// Free every page-table frame (not the leaf data frames).
    fn free(self, kernel: &'static Kernel) {
        free_table_level(kernel, self.root, 3);
    }
}

fn free_table_level(kernel: &'static Kernel, table_kva: usize, level: usize) {
    // The kernel half of the root is shared; only user entries are walked.
    // Level 0 entries point at data frames, which the vpi walk frees.
    let user_entries = if level == 3 { 256 } else { 512 };
    for i in 0..user_entries {
        // SAFETY: `table_kva` is a live page-table frame owned by the
        // vspace being torn down.
        let pte = unsafe { &(*(table_kva as *const RawPageTable)).entries[i] };
        if pte.is_present() && level > 0 {
            free_table_level(kernel, arch::p2v(pte.pa()), level - 1);
        }
    }
    // SAFETY: the frame was allocated by PageTable::new/walk and is no
    // longer referenced.
    kalloc::kfree(kernel, unsafe { crate::page::Page::from_usize(table_kva) });
}

bitflags! {
    struct VpiFlags: u8 {
        const PRESENT = 1 << 0;
        const WRITABLE = 1 << 1;
        const COW = 1 << 2;
        const SWAPPED = 1 << 3;
    }
}

/// Per-virtual-page bookkeeping. `frame` is a physical page number while
/// PRESENT, a swap slot while SWAPPED. SWAPPED implies no present mapping;
/// COW implies the page-table entry is read-only and the frame is shared.
#[repr(C)]
#[derive(Copy, Clone)]
struct Vpi {
    flags: VpiFlags,
    frame: u32,
    va: usize,
}

const NVPIPP: usize = (PGSIZE - mem::size_of::<usize>()) / mem::size_of::<Vpi>();

#[repr(C)]
struct VpiPage {
    next: *mut VpiPage,
    vpis: [Vpi; NVPIPP],
}

#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub enum RegionKind {
    Code,
    Heap,
    Stack,
}

/// One contiguous region of user address space with its ordered vpis.
/// For the stack, `base` is the exclusive top and the region extends
/// downward.
struct VRegion {
    kind: RegionKind,
    base: usize,
    /// Bytes in the region. Always page-granular except for the heap,
    /// whose byte-precise break sbrk tracks.
    size: usize,
    pages: *mut VpiPage,
}

impl VRegion {
    const fn new(kind: RegionKind) -> Self {
        Self {
            kind,
            base: 0,
            size: 0,
            pages: ptr::null_mut(),
        }
    }

    fn npages(&self) -> usize {
        pgroundup(self.size) / PGSIZE
    }

    fn contains(&self, va: usize) -> bool {
        match self.kind {
            RegionKind::Stack => self.base - pgroundup(self.size) <= va && va < self.base,
            _ => self.base <= va && va < self.base + self.size,
        }
    }

    fn vpi_index(&self, va: usize) -> usize {
        match self.kind {
            RegionKind::Stack => (self.base - pgrounddown(va)) / PGSIZE - 1,
            _ => (pgrounddown(va) - self.base) / PGSIZE,
        }
    }

    fn page_va(&self, idx: usize) -> usize {
        match self.kind {
            RegionKind::Stack => self.base - (idx + 1) * PGSIZE,
            _ => self.base + idx * PGSIZE,
        }
    }

    /// The vpi at `idx`, if its page of the chain exists.
    fn vpi_ptr(&self, idx: usize) -> Option<*mut Vpi> {
        let mut page = self.pages;
        let mut skip = idx;
        while !page.is_null() {
            if skip < NVPIPP {
                // SAFETY: `page` is a live vpi page of this region.
                return Some(unsafe { (*page).vpis.as_mut_ptr().add(skip) });
            }
            skip -= NVPIPP;
            // SAFETY: as above.
            page = unsafe { (*page).next };
        }
        None
    }

    /// The vpi at `idx`, extending the chain if needed.
    fn vpi_ensure(
        &mut self,
        kernel: &'static Kernel,
        ctx: Option<&KernelCtx>,
        idx: usize,
    ) -> Result<*mut Vpi, ()> {
        let mut hops = idx / NVPIPP;
        let mut link: *mut *mut VpiPage = &mut self.pages;
        loop {
            // SAFETY: `link` points either at self.pages or at a live vpi
            // page's next field.
            if unsafe { (*link).is_null() } {
                let mut page = kalloc::kalloc(kernel, ctx).ok_or(())?;
                page.write_bytes(0);
                let fresh = page.into_usize() as *mut VpiPage;
                // SAFETY: freshly allocated, zeroed frame.
                unsafe {
                    (*fresh).next = ptr::null_mut();
                    *link = fresh;
                }
            }
            if hops == 0 {
                // SAFETY: the page exists now.
                return Ok(unsafe { (**link).vpis.as_mut_ptr().add(idx % NVPIPP) });
            }
            hops -= 1;
            // SAFETY: as above.
            link = unsafe { &mut (**link).next };
        }
    }

    /// Free the vpi chain frames.
    fn free_chain(&mut self, kernel: &'static Kernel) {
        let mut page = self.pages;
        while !page.is_null() {
            // SAFETY: live vpi page owned by this region.
            let next = unsafe { (*page).next };
            // SAFETY: the frame came from kalloc and is no longer used.
            kalloc::kfree(kernel, unsafe { crate::page::Page::from_usize(page as usize) });
            page = next;
        }
        self.pages = ptr::null_mut();
    }
}

/// What a lookup found at a virtual address.
pub enum PageLookup {
    /// Mapped for the requested access; kernel VA of the frame.
    Mapped { kva: usize },
    /// Paged out to this swap slot.
    Swapped { slot: u32 },
    /// Present but copy-on-write, and the access is a write.
    Cow,
    /// Unmapped, but within the stack growth window.
    Grow,
    /// Not this address space's business.
    Fault,
}

pub struct VSpace {
    regions: [VRegion; NREGION],
    pt: PageTable,
    /// Published to the eviction path?
    attached: bool,
}

impl VSpace {
    /// A fresh, empty address space with a page-table root.
    pub fn new(kernel: &'static Kernel, ctx: Option<&KernelCtx>) -> Result<Self, ()> {
        Ok(Self {
            regions: [
                VRegion::new(RegionKind::Code),
                VRegion::new(RegionKind::Heap),
                VRegion::new(RegionKind::Stack),
            ],
            pt: PageTable::new(kernel, ctx)?,
            attached: false,
        })
    }

    fn region(&self, kind: RegionKind) -> &VRegion {
        &self.regions[kind as usize]
    }

    fn region_mut(&mut self, kind: RegionKind) -> &mut VRegion {
        &mut self.regions[kind as usize]
    }

    /// Load this vspace's page-table root.
    pub fn install(&self) {
        arch::set_page_table(self.pt.root_pa());
    }

    /// Flush stale translations after changing mappings.
    pub fn invalidate(&self) {
        arch::flush_tlb();
    }

    /// Map `npages` fresh zeroed pages at `va` into `kind`'s region.
    /// The pages must extend the region contiguously.
    pub fn add_map(
        &mut self,
        kernel: &'static Kernel,
        ctx: Option<&KernelCtx>,
        kind: RegionKind,
        va: usize,
        npages: usize,
        writable: bool,
    ) -> Result<(), ()> {
        debug_assert!(va % PGSIZE == 0);
        let attached = self.attached;
        let mut mapped = 0;

        let result = (|| {
            for i in 0..npages {
                let page_va = match kind {
                    RegionKind::Stack => va + (npages - 1 - i) * PGSIZE,
                    _ => va + i * PGSIZE,
                };
                let region = self.region_mut(kind);
                let idx = region.vpi_index(page_va);
                debug_assert_eq!(idx, region.npages(), "add_map: not contiguous");

                // Reserve the vpi slot before the frame so a failure in
                // either leaves nothing half-owned.
                let vpi = region.vpi_ensure(kernel, ctx, idx)?;
                let mut page = kalloc::kalloc(kernel, ctx).ok_or(())?;
                page.write_bytes(0);
                let kva = page.into_usize();
                let ppn = ppn_of_kva(kva);
                let mut flags = VpiFlags::PRESENT;
                if writable {
                    flags |= VpiFlags::WRITABLE;
                }
                // SAFETY: vpi_ensure returned a live vpi slot.
                unsafe {
                    *vpi = Vpi {
                        flags,
                        frame: ppn,
                        va: page_va,
                    };
                }
                region.size += PGSIZE;
                mapped += 1;
                if attached {
                    kernel.kmem().lock().set_user(kva, page_va);
                }
                self.pt.map(kernel, ctx, page_va, ppn, writable)?;
            }
            Ok(())
        })();

        if result.is_err() {
            // Undo the pages added by this call.
            for _ in 0..mapped {
                let region = self.region_mut(kind);
                let idx = region.npages() - 1;
                let vpi = region.vpi_ptr(idx).expect("add_map: lost vpi");
                // SAFETY: the vpi was just written by the loop above.
                let ppn = unsafe { (*vpi).frame };
                let page_va = region.page_va(idx);
                // SAFETY: vpi slots are cleared before the region shrinks.
                unsafe { (*vpi).flags = VpiFlags::empty() };
                region.size -= PGSIZE;
                self.pt.clear_present(page_va);
                kalloc::kfree_ppn(kernel, ppn);
            }
        }
        result
    }

    /// Publish the vspace's frames to the eviction path. Runs when the
    /// vspace is committed to a process.
    pub fn attach(&mut self, kernel: &'static Kernel) {
        if self.attached {
            return;
        }
        self.attached = true;
        let mut kmem = kernel.kmem().lock();
        for region in self.regions.iter() {
            for idx in 0..region.npages() {
                let vpi = match region.vpi_ptr(idx) {
                    Some(v) => v,
                    None => continue,
                };
                // SAFETY: vpis below npages are initialized.
                let vpi = unsafe { &*vpi };
                if vpi.flags.contains(VpiFlags::PRESENT) {
                    kmem.set_user(kva_of_ppn(vpi.frame), vpi.va);
                }
            }
        }
    }

    pub fn set_code_base(&mut self, base: usize) {
        self.region_mut(RegionKind::Code).base = base;
    }

    pub fn set_heap_base(&mut self, base: usize) {
        self.region_mut(RegionKind::Heap).base = base;
    }

    pub fn set_stack_base(&mut self, base: usize) {
        self.region_mut(RegionKind::Stack).base = base;
    }

    /// Set up the code region at CODESTART with `code`'s bytes, and place
    /// the heap right above it.
    pub fn init_code(
        &mut self,
        kernel: &'static Kernel,
        ctx: Option<&KernelCtx>,
        code: &[u8],
    ) -> Result<(), ()> {
        let npages = pgroundup(code.len()) / PGSIZE;
        self.region_mut(RegionKind::Code).base = CODESTART;
        self.add_map(kernel, ctx, RegionKind::Code, CODESTART, npages, false)?;
        self.fill(RegionKind::Code, CODESTART, code);
        self.region_mut(RegionKind::Heap).base = pgroundup(CODESTART + code.len());
        Ok(())
    }

    /// Reserve the top of user space for the stack and map its first page.
    pub fn init_stack(
        &mut self,
        kernel: &'static Kernel,
        ctx: Option<&KernelCtx>,
    ) -> Result<(), ()> {
        self.region_mut(RegionKind::Stack).base = USERTOP;
        self.add_map(kernel, ctx, RegionKind::Stack, USERTOP - PGSIZE, 1, true)
    }

    /// Copy `bytes` into already-present pages of `kind` (code loading and
    /// argv setup on a vspace under construction; write permission is not
    /// consulted).
    pub fn fill(&mut self, kind: RegionKind, va: usize, bytes: &[u8]) {
        let region = self.region(kind);
        let mut done = 0;
        while done < bytes.len() {
            let cur = va + done;
            let idx = region.vpi_index(cur);
            let vpi = region.vpi_ptr(idx).expect("fill: unmapped page");
            // SAFETY: the page is present, so `frame` names a frame this
            // vspace references.
            let kva = kva_of_ppn(unsafe { (*vpi).frame });
            let off = cur % PGSIZE;
            let m = core::cmp::min(bytes.len() - done, PGSIZE - off);
            // SAFETY: the range stays within one frame.
            unsafe {
                core::ptr::copy_nonoverlapping(
                    bytes.as_ptr().add(done),
                    (kva + off) as *mut u8,
                    m,
                );
            }
            done += m;
        }
    }

    /// The current heap break.
    pub fn heap_break(&self) -> usize {
        let heap = self.region(RegionKind::Heap);
        heap.base + heap.size
    }

    /// Grow or shrink the heap by `n` bytes; returns the old break.
    /// sbrk(0) reports the break without mapping anything.
    pub fn sbrk(&mut self, ctx: &KernelCtx, n: isize) -> Result<usize, ()> {
        let kernel = ctx.kernel();
        let old = self.heap_break();
        if n == 0 {
            return Ok(old);
        }
        if n > 0 {
            let new = old.checked_add(n as usize).ok_or(())?;
            if new > USERTOP - STACKPAGES * PGSIZE {
                return Err(());
            }
            let first_new = pgroundup(old);
            let npages = (pgroundup(new) - first_new) / PGSIZE;
            if npages > 0 {
                self.add_map(kernel, Some(ctx), RegionKind::Heap, first_new, npages, true)?;
                // add_map counted whole pages; correct to the byte break.
                let heap = self.region_mut(RegionKind::Heap);
                heap.size = new - heap.base;
            } else {
                self.region_mut(RegionKind::Heap).size = new - self.region(RegionKind::Heap).base;
            }
        } else {
            let shrink = (-n) as usize;
            if shrink > self.region(RegionKind::Heap).size {
                return Err(());
            }
            let new = old - shrink;
            let keep_pages = pgroundup(new - self.region(RegionKind::Heap).base) / PGSIZE;
            self.shrink_region(kernel, RegionKind::Heap, keep_pages);
            let heap = self.region_mut(RegionKind::Heap);
            heap.size = new - heap.base;
            self.invalidate();
        }
        Ok(old)
    }

    /// Drop the pages of `kind` beyond the first `keep` pages.
    fn shrink_region(&mut self, kernel: &'static Kernel, kind: RegionKind, keep: usize) {
        loop {
            let (v, page_va) = {
                let region = self.region_mut(kind);
                let n = region.npages();
                if n <= keep {
                    break;
                }
                let idx = n - 1;
                let vpi = region.vpi_ptr(idx).expect("shrink: lost vpi");
                // SAFETY: vpis below npages are initialized.
                let v = unsafe { *vpi };
                // SAFETY: as above.
                unsafe { (*vpi).flags = VpiFlags::empty() };
                region.size = idx * PGSIZE;
                (v, region.page_va(idx))
            };
            if v.flags.contains(VpiFlags::PRESENT) {
                self.pt.clear_present(page_va);
                kalloc::kfree_ppn(kernel, v.frame);
            } else if v.flags.contains(VpiFlags::SWAPPED) {
                kernel.kmem().lock().swap.ref_dec(v.frame);
            }
        }
    }

    /// What backs `va`, for an access that is a write iff `write`.
    pub fn lookup(&self, va: usize, write: bool) -> PageLookup {
        let region = match self.regions.iter().find(|r| r.size > 0 && r.contains(va)) {
            Some(r) => r,
            None => {
                // Unmapped, but maybe within the stack growth window.
                let stack = self.region(RegionKind::Stack);
                if stack.base != 0
                    && va >= stack.base - STACKPAGES * PGSIZE
                    && va < stack.base - pgroundup(stack.size)
                {
                    return PageLookup::Grow;
                }
                return PageLookup::Fault;
            }
        };

        let vpi = match region.vpi_ptr(region.vpi_index(va)) {
            Some(v) => v,
            None => return PageLookup::Fault,
        };
        // SAFETY: vpis of in-region pages are initialized.
        let v = unsafe { *vpi };

        if v.flags.contains(VpiFlags::SWAPPED) {
            return PageLookup::Swapped { slot: v.frame };
        }
        if !v.flags.contains(VpiFlags::PRESENT) {
            return PageLookup::Fault;
        }
        if write && !v.flags.contains(VpiFlags::WRITABLE) {
            if v.flags.contains(VpiFlags::COW) {
                return PageLookup::Cow;
            }
            return PageLookup::Fault;
        }
        PageLookup::Mapped {
            kva: kva_of_ppn(v.frame),
        }
    }

    /// Break the COW share at `va`: give the faulting space a private,
    /// writable copy.
    pub fn cow_break(&mut self, ctx: &KernelCtx, va: usize) -> Result<(), ()> {
        let region = self
            .regions
            .iter()
            .find(|r| r.size > 0 && r.contains(va))
            .ok_or(())?;
        let vpi = region.vpi_ptr(region.vpi_index(va)).ok_or(())?;
        // SAFETY: in-region vpis are initialized; single-threaded access
        // within this process.
        let v = unsafe { *vpi };
        if !v.flags.contains(VpiFlags::COW) {
            return Err(());
        }

        let mut ppn = v.frame;
        kalloc::ppage_copy(ctx, &mut ppn, pgrounddown(va))?;

        // SAFETY: as above.
        unsafe {
            (*vpi).frame = ppn;
            (*vpi).flags.remove(VpiFlags::COW);
            (*vpi).flags.insert(VpiFlags::WRITABLE);
        }
        self.pt.remap(pgrounddown(va), ppn, true);
        self.invalidate();
        Ok(())
    }

    /// Grow the stack to cover `va` (already vetted by `lookup`).
    pub fn grow_stack(&mut self, ctx: &KernelCtx, va: usize) -> Result<(), ()> {
        let kernel = ctx.kernel();
        let stack = self.region(RegionKind::Stack);
        let mapped_until = stack.base - pgroundup(stack.size);
        let target = pgrounddown(va);
        debug_assert!(target < mapped_until);
        let npages = (mapped_until - target) / PGSIZE;
        self.add_map(kernel, Some(ctx), RegionKind::Stack, target, npages, true)
    }

    /// Share this space's pages into `child`, copy-on-write. `child` must
    /// be fresh, and must already sit in its process slot: the copy
    /// allocates, and an eviction during the copy has to see the child's
    /// vpis. Writable pages become read-only COW in both parent and
    /// child. On failure the caller frees the partially built child.
    pub fn copy_cow_into(
        &mut self,
        child: &mut VSpace,
        kernel: &'static Kernel,
        ctx: &KernelCtx,
    ) -> Result<(), ()> {
        child.attached = true;

        for (ri, region) in self.regions.iter().enumerate() {
            child.regions[ri].kind = region.kind;
            child.regions[ri].base = region.base;

            for idx in 0..region.npages() {
                let vpi = region.vpi_ptr(idx).expect("copy_cow: missing vpi");
                // SAFETY: in-region vpis are initialized.
                let v = unsafe { &mut *vpi };
                let child_vpi = child.regions[ri].vpi_ensure(kernel, Some(ctx), idx)?;

                if v.flags.contains(VpiFlags::SWAPPED) {
                    kernel.kmem().lock().swap.ref_inc(v.frame);
                } else if v.flags.contains(VpiFlags::PRESENT) {
                    if v.flags.contains(VpiFlags::WRITABLE) {
                        v.flags.remove(VpiFlags::WRITABLE);
                        v.flags.insert(VpiFlags::COW);
                        self.pt.clear_writable(v.va);
                    }
                    kernel.kmem().lock().ref_inc(kva_of_ppn(v.frame));
                }

                // Publish the child's vpi (and its share of the frame)
                // before touching the page table: mapping may allocate and
                // hence evict, and the eviction path must see this vpi.
                // SAFETY: vpi_ensure returned a live slot.
                unsafe { *child_vpi = *v };
                child.regions[ri].size += PGSIZE;

                // SAFETY: as above.
                let cv = unsafe { *child_vpi };
                if cv.flags.contains(VpiFlags::PRESENT) {
                    child.pt.map(kernel, Some(ctx), cv.va, cv.frame, false)?;
                    // The map itself may have evicted the page; if so, the
                    // vpi now names a swap slot and the fresh pte is stale.
                    // SAFETY: as above.
                    if unsafe { (*child_vpi).flags.contains(VpiFlags::SWAPPED) } {
                        child.pt.clear_present(cv.va);
                    }
                }
            }
            child.regions[ri].size = region.size;
        }

        // The parent lost write permission on its COW pages.
        self.invalidate();
        Ok(())
    }

    /// Retarget frame `ppn` to swap slot `slot` (eviction).
    pub fn mark_swapped(&self, ppn: u32, slot: u32) {
        for region in self.regions.iter() {
            for idx in 0..region.npages() {
                let vpi = match region.vpi_ptr(idx) {
                    Some(v) => v,
                    None => continue,
                };
                // SAFETY: writes go through the raw vpi pointer; callers
                // hold the process-table lock (eviction discipline).
                unsafe {
                    if (*vpi).flags.contains(VpiFlags::PRESENT) && (*vpi).frame == ppn {
                        (*vpi).flags.remove(VpiFlags::PRESENT);
                        (*vpi).flags.insert(VpiFlags::SWAPPED);
                        (*vpi).frame = slot;
                        self.pt.clear_present((*vpi).va);
                    }
                }
            }
        }
    }

    /// Retarget swap slot `slot` back to frame `ppn` (swap-in).
    pub fn mark_swapped_in(&self, slot: u32, ppn: u32) {
        for region in self.regions.iter() {
            for idx in 0..region.npages() {
                let vpi = match region.vpi_ptr(idx) {
                    Some(v) => v,
                    None => continue,
                };
                // SAFETY: as in mark_swapped.
                unsafe {
                    if (*vpi).flags.contains(VpiFlags::SWAPPED) && (*vpi).frame == slot {
                        (*vpi).flags.remove(VpiFlags::SWAPPED);
                        (*vpi).flags.insert(VpiFlags::PRESENT);
                        (*vpi).frame = ppn;
                        let writable = (*vpi).flags.contains(VpiFlags::WRITABLE)
                            && !(*vpi).flags.contains(VpiFlags::COW);
                        self.pt.remap((*vpi).va, ppn, writable);
                    }
                }
            }
        }
    }

    /// Release every frame, swap slot, vpi page and page-table page.
    pub fn free(mut self, kernel: &'static Kernel) {
        for region in self.regions.iter_mut() {
            for idx in 0..region.npages() {
                let vpi = match region.vpi_ptr(idx) {
                    Some(v) => v,
                    None => continue,
                };
                // SAFETY: in-region vpis are initialized.
                let v = unsafe { *vpi };
                if v.flags.contains(VpiFlags::PRESENT) {
                    kalloc::kfree_ppn(kernel, v.frame);
                } else if v.flags.contains(VpiFlags::SWAPPED) {
                    kernel.kmem().lock().swap.ref_dec(v.frame);
                }
            }
            region.free_chain(kernel);
        }
        self.pt.free(kernel);
    }
}

/// Make `va` mapped and accessible for the requested access in the current
/// process's space, faulting in whatever stands in the way. Returns the
/// kernel VA of the backing frame.
pub fn ensure_mapped(ctx: &mut KernelCtx, va: usize, write: bool) -> Result<usize, ()> {
    loop {
        let ctx2 = *ctx;
        let found = {
            let vs = ctx.proc_data_mut().vspace.as_mut().ok_or(())?;
            vs.lookup(va, write)
        };
        match found {
            PageLookup::Mapped { kva } => return Ok(kva),
            PageLookup::Swapped { slot } => {
                swap::swap_in(&ctx2, slot)?;
            }
            PageLookup::Cow => {
                let vs = ctx.proc_data_mut().vspace.as_mut().ok_or(())?;
                vs.cow_break(&ctx2, va)?;
            }
            PageLookup::Grow => {
                let vs = ctx.proc_data_mut().vspace.as_mut().ok_or(())?;
                vs.grow_stack(&ctx2, va)?;
            }
            PageLookup::Fault => return Err(()),
        }
    }
}

/// Kernel-side write into the current process's space, faulting pages in
/// as needed.
pub fn copy_out(ctx: &mut KernelCtx, dst: UVAddr, src: &[u8]) -> Result<(), ()> {
    let base = dst.into_usize();
    let mut done = 0;
    while done < src.len() {
        let va = base.checked_add(done).ok_or(())?;
        let kva = ensure_mapped(ctx, va, true)?;
        let off = va % PGSIZE;
        let m = core::cmp::min(src.len() - done, PGSIZE - off);
        // SAFETY: the frame is mapped for this process and `m` stays within
        // the page.
        unsafe {
            core::ptr::copy_nonoverlapping(src.as_ptr().add(done), (kva + off) as *mut u8, m);
        }
        done += m;
    }
    Ok(())
}

/// Kernel-side read from the current process's space.
pub fn copy_in(ctx: &mut KernelCtx, src: UVAddr, dst: &mut [u8]) -> Result<(), ()> {
    let base = src.into_usize();
    let mut done = 0;
    while done < dst.len() {
        let va = base.checked_add(done).ok_or(())?;
        let kva = ensure_mapped(ctx, va, false)?;
        let off = va % PGSIZE;
        let m = core::cmp::min(dst.len() - done, PGSIZE - off);
        // SAFETY: as in copy_out.
        unsafe {
            core::ptr::copy_nonoverlapping((kva + off) as *const u8, dst.as_mut_ptr().add(done), m);
        }
        done += m;
    }
    Ok(())
}

/// Read a NUL-terminated string; errors if no NUL fits in `dst`.
pub fn copy_in_str(ctx: &mut KernelCtx, src: UVAddr, dst: &mut [u8]) -> Result<usize, ()> {
    let base = src.into_usize();
    let mut done = 0;
    while done < dst.len() {
        let va = base.checked_add(done).ok_or(())?;
        let kva = ensure_mapped(ctx, va, false)?;
        let off = va % PGSIZE;
        let m = core::cmp::min(dst.len() - done, PGSIZE - off);
        for i in 0..m {
            // SAFETY: as in copy_in.
            let b = unsafe { *((kva + off + i) as *const u8) };
            dst[done + i] = b;
            if b == 0 {
                return Ok(done + i);
            }
        }
        done += m;
    }
    Err(())
}

#[cfg(test)]
mod tests {
    use std::vec;
    use std::vec::Vec;

    use super::*;
    use crate::kernel::Kernel;
    use crate::page::Page;
    use crate::testing::{boot, boot_alloc_only, ramdisk_with};

    const HEAP: usize = 0x40000;

    /// A vspace with `pages` heap pages, installed into the test process.
    fn heap_space(kernel: &'static Kernel, ctx: &mut KernelCtx, pages: usize) {
        let mut vs = VSpace::new(kernel, Some(ctx)).unwrap();
        vs.set_code_base(CODESTART);
        vs.set_heap_base(HEAP);
        vs.add_map(kernel, Some(ctx), RegionKind::Heap, HEAP, pages, true)
            .unwrap();
        vs.attach(kernel);
        ctx.proc_data_mut().vspace = Some(vs);
    }

    fn drop_space(kernel: &'static Kernel, ctx: &mut KernelCtx) {
        if let Some(vs) = ctx.proc_data_mut().vspace.take() {
            vs.free(kernel);
        }
    }

    #[test]
    fn copy_roundtrip_through_user_memory() {
        let (kernel, mut ctx) = boot_alloc_only(64);
        heap_space(kernel, &mut ctx, 2);

        let msg = b"across the user boundary";
        // Straddle the page boundary on purpose.
        let addr = UVAddr::from(HEAP + PGSIZE - 7);
        copy_out(&mut ctx, addr, msg).unwrap();

        let mut got = [0u8; 24];
        copy_in(&mut ctx, addr, &mut got).unwrap();
        assert_eq!(&got, msg);

        // Out-of-region addresses fault.
        assert!(copy_out(&mut ctx, UVAddr::from(HEAP - PGSIZE), b"x").is_err());
        drop_space(kernel, &mut ctx);
    }

    #[test]
    fn copy_in_str_stops_at_nul() {
        let (kernel, mut ctx) = boot_alloc_only(64);
        heap_space(kernel, &mut ctx, 1);

        copy_out(&mut ctx, UVAddr::from(HEAP), b"name\0junk").unwrap();
        let mut buf = [0u8; 32];
        let len = copy_in_str(&mut ctx, UVAddr::from(HEAP), &mut buf).unwrap();
        assert_eq!(&buf[..len], b"name");
        drop_space(kernel, &mut ctx);
    }

    #[test]
    fn sbrk_grows_and_shrinks_the_heap() {
        let (kernel, mut ctx) = boot_alloc_only(64);
        heap_space(kernel, &mut ctx, 1);
        let free0 = kernel.kmem().lock().free_pages();

        let ctx2 = ctx;
        let vs = ctx.proc_data_mut().vspace.as_mut().unwrap();
        let brk = vs.heap_break();
        assert_eq!(vs.sbrk(&ctx2, 0).unwrap(), brk);
        assert_eq!(vs.heap_break(), brk);

        // Grow by two and a half pages.
        let grow = 2 * PGSIZE + PGSIZE / 2;
        assert_eq!(vs.sbrk(&ctx2, grow as isize).unwrap(), brk);
        assert_eq!(vs.heap_break(), brk + grow);
        assert_eq!(kernel.kmem().lock().free_pages(), free0 - 3);

        // The new memory is usable and zeroed.
        let mut got = [0xffu8; 16];
        copy_in(&mut ctx, UVAddr::from(brk + PGSIZE), &mut got).unwrap();
        assert!(got.iter().all(|&b| b == 0));

        // Shrink back.
        let vs = ctx.proc_data_mut().vspace.as_mut().unwrap();
        assert_eq!(vs.sbrk(&ctx2, -(grow as isize)).unwrap(), brk + grow);
        assert_eq!(vs.heap_break(), brk);
        assert_eq!(kernel.kmem().lock().free_pages(), free0);
        drop_space(kernel, &mut ctx);
    }

    /// Touching below the mapped stack grows it page by page, up to ten
    /// pages; the grown memory reads as zeros.
    #[test]
    fn stack_grows_down_on_fault() {
        let (kernel, mut ctx) = boot_alloc_only(64);
        let mut vs = VSpace::new(kernel, Some(&ctx)).unwrap();
        vs.init_stack(kernel, Some(&ctx)).unwrap();
        vs.attach(kernel);
        ctx.proc_data_mut().vspace = Some(vs);

        // Two pages below the current stack page: the fault-in path of a
        // program touching rsp - 8192.
        let target = USERTOP - 3 * PGSIZE + 8;
        let mut got = [0xffu8; 8];
        copy_in(&mut ctx, UVAddr::from(target), &mut got).unwrap();
        assert!(got.iter().all(|&b| b == 0));

        // Writes through the grown range stick.
        copy_out(&mut ctx, UVAddr::from(target), b"stack!!!").unwrap();
        let mut back = [0u8; 8];
        copy_in(&mut ctx, UVAddr::from(target), &mut back).unwrap();
        assert_eq!(&back, b"stack!!!");

        // Below the ten-page window is a plain fault.
        let too_low = USERTOP - (crate::param::STACKPAGES + 1) * PGSIZE;
        assert!(copy_in(&mut ctx, UVAddr::from(too_low), &mut got).is_err());
        drop_space(kernel, &mut ctx);
    }

    /// Fork sharing: after copy_cow both spaces read the same bytes, the
    /// frame is shared, and a write by the parent diverges privately.
    #[test]
    fn cow_shares_then_diverges() {
        let (kernel, mut ctx) = boot_alloc_only(64);
        heap_space(kernel, &mut ctx, 1);
        copy_out(&mut ctx, UVAddr::from(HEAP), b"original").unwrap();

        let ctx2 = ctx;
        let mut child = VSpace::new(kernel, Some(&ctx)).unwrap();
        {
            let vs = ctx.proc_data_mut().vspace.as_mut().unwrap();
            vs.copy_cow_into(&mut child, kernel, &ctx2).unwrap();
        }

        // Shared frame, two references.
        let (parent_kva, child_kva) = {
            let vs = ctx.proc_data_mut().vspace.as_mut().unwrap();
            let p = match vs.lookup(HEAP, false) {
                PageLookup::Mapped { kva } => kva,
                _ => panic!("parent page missing"),
            };
            let c = match child.lookup(HEAP, false) {
                PageLookup::Mapped { kva } => kva,
                _ => panic!("child page missing"),
            };
            (p, c)
        };
        assert_eq!(parent_kva, child_kva);
        assert_eq!(kernel.kmem().lock().refcnt(parent_kva), 2);

        // Writing is now a COW fault for the parent.
        {
            let vs = ctx.proc_data_mut().vspace.as_mut().unwrap();
            assert!(matches!(vs.lookup(HEAP, true), PageLookup::Cow));
        }

        copy_out(&mut ctx, UVAddr::from(HEAP), b"diverged").unwrap();

        let vs = ctx.proc_data_mut().vspace.as_mut().unwrap();
        let new_parent = match vs.lookup(HEAP, true) {
            PageLookup::Mapped { kva } => kva,
            _ => panic!("parent page missing after break"),
        };
        assert_ne!(new_parent, child_kva);
        assert_eq!(kernel.kmem().lock().refcnt(child_kva), 1);
        assert_eq!(kernel.kmem().lock().refcnt(new_parent), 1);

        // The child still sees the original bytes.
        // SAFETY: child_kva names the child's frame in the test arena.
        let child_bytes = unsafe { &*(child_kva as *const [u8; PGSIZE]) };
        assert_eq!(&child_bytes[..8], b"original");

        child.free(kernel);
        drop_space(kernel, &mut ctx);
    }

    /// Allocation pressure pushes user pages out to swap and faults them
    /// back in intact: every originally written byte reads back.
    #[test]
    fn swap_out_and_back_preserves_memory() {
        let disk = ramdisk_with(&[]);
        // Small arena so pressure forces eviction.
        let (kernel, mut ctx) = boot(disk, 48);
        let pages = 20;
        heap_space(kernel, &mut ctx, pages);

        for i in 0..pages {
            let fill = [(i as u8) ^ 0x3c; 64];
            copy_out(&mut ctx, UVAddr::from(HEAP + i * PGSIZE + 100), &fill).unwrap();
        }

        // Squeeze: drain the free pool and keep going, forcing evictions
        // of the heap frames.
        let mut pressure: Vec<usize> = vec![];
        for _ in 0..30 {
            let p = crate::kalloc::kalloc(kernel, Some(&ctx)).unwrap();
            pressure.push(p.into_usize());
        }
        assert!(kernel.kmem().lock().swap.used_slots() > 0);

        // Every byte still reads back, swapping pages back in on demand.
        for i in 0..pages {
            let mut got = [0u8; 64];
            copy_in(&mut ctx, UVAddr::from(HEAP + i * PGSIZE + 100), &mut got).unwrap();
            assert!(
                got.iter().all(|&b| b == (i as u8) ^ 0x3c),
                "page {} lost its contents",
                i
            );
        }

        for kva in pressure {
            // SAFETY: reconstructing the pressure pages allocated above.
            crate::kalloc::kfree(kernel, unsafe { Page::from_usize(kva) });
        }
        drop_space(kernel, &mut ctx);

        // Nothing should remain in the swap map once the space is gone.
        assert_eq!(kernel.kmem().lock().swap.used_slots(), 0);
    }

    /// COW pages that get swapped out keep their sharing: the swap slot
    /// carries both references, and both spaces see their bytes again.
    #[test]
    fn swapped_cow_pages_keep_refcounts() {
        use crate::proc::ProcState;

        let disk = ramdisk_with(&[]);
        let (kernel, mut ctx) = boot(disk, 48);
        heap_space(kernel, &mut ctx, 12);

        for i in 0..12 {
            copy_out(&mut ctx, UVAddr::from(HEAP + i * PGSIZE), &[i as u8 + 1; 32]).unwrap();
        }

        // Host the child in a second process slot, the way fork does, so
        // evictions retarget its vpis too.
        let child_proc = &kernel.procs().pool()[1];
        {
            let mut table = kernel.procs().lock_table();
            let shared = child_proc.shared_mut(&mut table);
            shared.state = ProcState::Embryo;
            shared.pid = 2;
        }
        let mut child_ctx = KernelCtx::new(kernel, child_proc);
        child_ctx.proc_data_mut().vspace = Some(VSpace::new(kernel, Some(&ctx)).unwrap());

        let ctx2 = ctx;
        {
            let child_vs = child_ctx.proc_data_mut().vspace.as_mut().unwrap();
            let vs = ctx.proc_data_mut().vspace.as_mut().unwrap();
            vs.copy_cow_into(child_vs, kernel, &ctx2).unwrap();
        }

        // Push pages out.
        let mut pressure: Vec<usize> = vec![];
        for _ in 0..30 {
            match crate::kalloc::kalloc(kernel, Some(&ctx)) {
                Some(p) => pressure.push(p.into_usize()),
                None => break,
            }
        }
        assert!(kernel.kmem().lock().swap.used_slots() > 0);

        // The parent faults its pages back in; the shared slots update the
        // child's vpis at the same time.
        for i in 0..12 {
            let mut got = [0u8; 32];
            copy_in(&mut ctx, UVAddr::from(HEAP + i * PGSIZE), &mut got).unwrap();
            assert!(got.iter().all(|&b| b == i as u8 + 1));
        }

        // And the child reads the same bytes through its own space.
        for i in 0..12 {
            let mut got = [0u8; 32];
            copy_in(&mut child_ctx, UVAddr::from(HEAP + i * PGSIZE), &mut got).unwrap();
            assert!(got.iter().all(|&b| b == i as u8 + 1));
        }

        for kva in pressure {
            // SAFETY: reconstructing the pressure pages allocated above.
            crate::kalloc::kfree(kernel, unsafe { Page::from_usize(kva) });
        }
        drop_space(kernel, &mut child_ctx);
        drop_space(kernel, &mut ctx);
        assert_eq!(kernel.kmem().lock().swap.used_slots(), 0);
    }
}
