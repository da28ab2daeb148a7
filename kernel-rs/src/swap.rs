//! The swap area: 2048 slots of 8 blocks, each holding one evicted page.
//!
//! The swap map mirrors the core map: a slot has a reference count and the
//! user virtual address of the page it holds. Eviction migrates a frame's
//! contents and metadata into a slot; swap-in migrates them back out.
//! Slot contents move through the buffer cache, not the log — a swap slot
//! never needs crash consistency.

use array_macro::array;

use crate::addr::PGSIZE;
use crate::kalloc;
use crate::page::Page;
use crate::param::{BSIZE, NSWAPSLOT, ROOTDEV, SWAPBLKS};
use crate::proc::KernelCtx;

/// One entry per swap slot. Invariants mirror the core map: used implies
/// the slot holds a page referenced by `refcnt` vpis mapped at `va`.
#[derive(Copy, Clone)]
pub struct SwapEntry {
    pub used: bool,
    pub refcnt: u16,
    pub va: usize,
}

pub struct SwapMap {
    entries: [SwapEntry; NSWAPSLOT],
}

impl SwapMap {
    pub const fn new() -> Self {
        Self {
            entries: array![_ => SwapEntry { used: false, refcnt: 0, va: 0 }; NSWAPSLOT],
        }
    }

    /// Claim the first free slot.
    pub fn alloc(&mut self) -> Option<u32> {
        for (i, e) in self.entries.iter_mut().enumerate() {
            if !e.used {
                *e = SwapEntry {
                    used: true,
                    refcnt: 0,
                    va: 0,
                };
                return Some(i as u32);
            }
        }
        None
    }

    pub fn set(&mut self, slot: u32, refcnt: u16, va: usize) {
        let e = &mut self.entries[slot as usize];
        debug_assert!(e.used);
        e.refcnt = refcnt;
        e.va = va;
    }

    pub fn entry(&self, slot: u32) -> SwapEntry {
        self.entries[slot as usize]
    }

    pub fn ref_inc(&mut self, slot: u32) {
        let e = &mut self.entries[slot as usize];
        debug_assert!(e.used);
        e.refcnt += 1;
    }

    /// Drop one reference; frees the slot at zero.
    pub fn ref_dec(&mut self, slot: u32) {
        let e = &mut self.entries[slot as usize];
        debug_assert!(e.used && e.refcnt >= 1);
        e.refcnt -= 1;
        if e.refcnt == 0 {
            *e = SwapEntry {
                used: false,
                refcnt: 0,
                va: 0,
            };
        }
    }

    pub fn free(&mut self, slot: u32) {
        self.entries[slot as usize] = SwapEntry {
            used: false,
            refcnt: 0,
            va: 0,
        };
    }

    /// Number of used slots.
    pub fn used_slots(&self) -> usize {
        self.entries.iter().filter(|e| e.used).count()
    }
}

/// First disk block of `slot`.
fn slot_block(ctx: &KernelCtx, slot: u32) -> u32 {
    ctx.kernel().fs().superblock().swapstart + slot * SWAPBLKS
}

/// Write the page at `frame` into `slot`, 8 sequential block writes.
fn swap_write(ctx: &KernelCtx, slot: u32, frame: usize) {
    let start = slot_block(ctx, slot);
    for i in 0..SWAPBLKS {
        let mut buf = ctx.kernel().bread(ROOTDEV, start + i, ctx);
        // SAFETY: frame names an allocated, pinned frame.
        let src = unsafe {
            core::slice::from_raw_parts((frame + i as usize * BSIZE) as *const u8, BSIZE)
        };
        buf.data_mut().copy_from_slice(src);
        buf.write();
    }
}

/// Read `slot` into the page at `frame`.
fn swap_read(ctx: &KernelCtx, slot: u32, frame: usize) {
    let start = slot_block(ctx, slot);
    for i in 0..SWAPBLKS {
        let buf = ctx.kernel().bread(ROOTDEV, start + i, ctx);
        // SAFETY: frame names a frame owned by the caller.
        let dst = unsafe {
            core::slice::from_raw_parts_mut((frame + i as usize * BSIZE) as *mut u8, BSIZE)
        };
        dst.copy_from_slice(&buf.data()[..]);
    }
}

/// Steal a user frame for the caller: pick a random victim, write it to a
/// free swap slot, move its metadata into the swap map, retarget every
/// address space that mapped it, and hand the frame over with one plain
/// reference. Panics when the swap area is full or no victim can be found.
pub fn evict_page(ctx: &KernelCtx) -> Page {
    let kernel = ctx.kernel();

    // Reserve a victim and a slot.
    let (victim, slot) = {
        let mut kmem = kernel.kmem().lock();
        let idx = kmem.pick_victim();
        let victim = kmem.victim_kva(idx);
        // Pin: COW breaks and other evictions must leave it alone while the
        // contents are in flight.
        kmem.pin(victim);
        let slot = match kmem.swap.alloc() {
            Some(s) => s,
            None => panic!("evict: out of swap"),
        };
        (victim, slot)
    };

    // Copy the page out. No spinlock is held: the writes go through buffer
    // sleeplocks.
    swap_write(ctx, slot, victim);

    // Migrate metadata: the slot inherits the frame's refcnt and va, the
    // frame becomes the caller's, and every vpi that named the frame now
    // names the slot.
    let ppn = kalloc::ppn_of_kva(victim);
    {
        let mut table = kernel.procs().lock_table();
        let mut kmem = kernel.kmem().lock();
        let (refcnt, va) = kmem.meta(victim);
        kmem.swap.set(slot, refcnt, va);
        kmem.appropriate(victim);
        kernel.procs().mark_swapped_all(&mut table, ppn, slot);
    }

    // The current address space may have mapped the victim; its root is
    // already installed, so reloading it flushes the stale translations.
    crate::arch::flush_tlb();

    // SAFETY: `appropriate` left the frame allocated with refcnt 1, owned
    // by the caller.
    unsafe { Page::from_usize(victim) }
}

/// Bring `slot` back into memory: allocate a frame (possibly evicting),
/// move the slot's metadata onto it, retarget every vpi that named the
/// slot, then read the contents in. Returns the new frame's page number.
pub fn swap_in(ctx: &KernelCtx, slot: u32) -> Result<u32, ()> {
    let kernel = ctx.kernel();
    let frame = kalloc::kalloc(kernel, Some(ctx)).ok_or(())?.into_usize();
    let ppn = kalloc::ppn_of_kva(frame);

    {
        let mut table = kernel.procs().lock_table();
        let mut kmem = kernel.kmem().lock();
        let e = kmem.swap.entry(slot);
        debug_assert!(e.used, "swap_in: free slot");
        kmem.adopt(frame, e.refcnt, e.va);
        kmem.swap.free(slot);
        kernel.procs().mark_swapped_in_all(&mut table, slot, ppn);
    }

    swap_read(ctx, slot, frame);

    crate::arch::flush_tlb();
    Ok(ppn)
}
