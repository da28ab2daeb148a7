//! Hosted model of the machine interface.
//!
//! Compiled whenever the crate targets a hosted OS, which is how the
//! machine-independent kernel runs under `cargo test`. Interrupt state and
//! the installed page-table root are modeled with thread-local cells; each
//! test thread acts as its own CPU. The primitives that cannot exist in a
//! hosted process (`context_switch`, `trap_return`) panic if reached — no
//! test path legitimately reaches them.

use core::cell::Cell;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::thread_local;

use crate::param::NCPU;

pub const KERNBASE: usize = 0;

pub const fn p2v(pa: usize) -> usize {
    pa
}

pub const fn v2p(va: usize) -> usize {
    va
}

/// Same layout as the real context; never executed here.
#[repr(C)]
#[derive(Copy, Clone, Default)]
pub struct Context {
    pub r15: usize,
    pub r14: usize,
    pub r13: usize,
    pub r12: usize,
    pub rbx: usize,
    pub rbp: usize,
    pub rsp: usize,
    pub rip: usize,
}

impl Context {
    pub const fn new() -> Self {
        Self { r15: 0, r14: 0, r13: 0, r12: 0, rbx: 0, rbp: 0, rsp: 0, rip: 0 }
    }

    pub fn set_ret_addr(&mut self, val: usize) {
        self.rip = val;
    }
}

#[repr(C)]
#[derive(Copy, Clone, Default)]
pub struct TrapFrame {
    pub rax: usize,
    pub rbx: usize,
    pub rcx: usize,
    pub rdx: usize,
    pub rbp: usize,
    pub rsi: usize,
    pub rdi: usize,
    pub r8: usize,
    pub r9: usize,
    pub r10: usize,
    pub r11: usize,
    pub r12: usize,
    pub r13: usize,
    pub r14: usize,
    pub r15: usize,

    pub trapno: usize,
    pub err: usize,

    pub rip: usize,
    pub cs: usize,
    pub rflags: usize,
    pub rsp: usize,
    pub ss: usize,
}

impl TrapFrame {
    pub fn from_kernel(&self) -> bool {
        self.cs & 3 == 0
    }
}

thread_local! {
    static INTR_ON: Cell<bool> = Cell::new(false);
    static NOFF: Cell<u32> = Cell::new(0);
    static INTENA: Cell<bool> = Cell::new(false);
    static PAGE_TABLE: Cell<usize> = Cell::new(0);
    static FAULT_ADDR: Cell<usize> = Cell::new(0);
    static CPU: Cell<usize> = Cell::new(usize::MAX);
}

static NEXT_CPU: AtomicUsize = AtomicUsize::new(0);

pub fn cpu_id() -> usize {
    CPU.with(|c| {
        if c.get() == usize::MAX {
            c.set(NEXT_CPU.fetch_add(1, Ordering::Relaxed) % NCPU);
        }
        c.get()
    })
}

pub fn intr_get() -> bool {
    INTR_ON.with(|c| c.get())
}

pub fn intr_off() {
    INTR_ON.with(|c| c.set(false));
}

/// # Safety
///
/// Trivially safe in the hosted model; unsafe to match the real interface.
pub unsafe fn intr_on() {
    INTR_ON.with(|c| c.set(true));
}

pub fn fault_addr() -> usize {
    FAULT_ADDR.with(|c| c.get())
}

pub fn set_page_table(root: usize) {
    PAGE_TABLE.with(|c| c.set(root));
}

pub fn current_page_table() -> usize {
    PAGE_TABLE.with(|c| c.get())
}

pub fn flush_tlb() {}

pub fn kernel_root() -> Option<usize> {
    None
}

pub fn intr_depth() -> u32 {
    NOFF.with(|c| c.get())
}

pub fn set_intr_depth(depth: u32) {
    NOFF.with(|c| c.set(depth));
}

pub fn intr_was_enabled() -> bool {
    INTENA.with(|c| c.get())
}

pub fn set_intr_was_enabled(on: bool) {
    INTENA.with(|c| c.set(on));
}

/// # Safety
///
/// Never sound in the hosted model; this always panics.
pub unsafe fn context_switch(_old: *mut Context, _new: *mut Context) {
    unreachable!("context_switch on a hosted target");
}

/// # Safety
///
/// Never sound in the hosted model; this always panics.
pub unsafe fn trap_return(_tf: *mut TrapFrame) -> ! {
    unreachable!("trap_return on a hosted target");
}

pub fn console_putc(_c: u8) {}

pub fn uart_intr() {}

pub fn kbd_intr() {}

pub fn ide_intr() {}

pub fn irq_eoi() {}

pub fn halt() -> ! {
    panic!("halt on a hosted target");
}
