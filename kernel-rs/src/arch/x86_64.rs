//! x86-64 bare-metal implementation of the machine interface.
//!
//! The boot path, interrupt vector stubs, LAPIC/PIC programming, the IDE,
//! UART and keyboard drivers, and the `swtch`/`trapret` assembly live
//! outside this crate; only their C ABI is declared here.

use core::arch::asm;
use core::cell::UnsafeCell;

use array_macro::array;

use super::RFLAGS_IF;
use crate::param::NCPU;

/// The kernel is linked at `KERNBASE + load address`; physical memory is
/// direct-mapped starting at `KERNBASE`.
pub const KERNBASE: usize = 0xffff_ffff_8000_0000;

pub const fn p2v(pa: usize) -> usize {
    pa + KERNBASE
}

pub const fn v2p(va: usize) -> usize {
    va - KERNBASE
}

/// Saved registers for kernel context switches. The layout is shared with
/// the out-of-scope `swtch` assembly: callee-saved registers only, plus the
/// return address, in push order.
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

/// Register state pushed by the interrupt vector stubs, in push order.
/// Shared layout with the out-of-scope vector/trapret assembly.
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

    // Pushed by the hardware.
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

extern "C" {
    // swtch.S: save the current context in *old, load *new.
    pub fn swtch(old: *mut Context, new: *mut Context);

    // trapasm.S: restore a trap frame and iret to user mode.
    fn trapret(tf: *mut TrapFrame) -> !;

    // lapic.c
    fn lapic_cpu_id() -> u32;
    fn lapic_eoi();

    // uart.c / console.c / kbd.c / ide.c
    fn uart_putc(c: u8);
    fn uart_intr_handler();
    fn kbd_intr_handler();
    fn ide_intr_handler();
}

pub fn cpu_id() -> usize {
    // SAFETY: the LAPIC is set up by the out-of-scope boot path before any
    // kernel code that asks for a CPU id runs.
    (unsafe { lapic_cpu_id() }) as usize
}

pub fn intr_get() -> bool {
    let rflags: usize;
    // SAFETY: reading rflags has no side effect.
    unsafe { asm!("pushfq; pop {}", out(reg) rflags, options(nomem, preserves_flags)) };
    rflags & RFLAGS_IF != 0
}

pub fn intr_off() {
    // SAFETY: masking interrupts on this CPU is always sound.
    unsafe { asm!("cli", options(nomem, nostack)) };
}

/// # Safety
///
/// The interrupt vectors must have been installed.
pub unsafe fn intr_on() {
    unsafe { asm!("sti", options(nomem, nostack)) };
}

/// The faulting address of the most recent page fault on this CPU.
pub fn fault_addr() -> usize {
    let cr2: usize;
    // SAFETY: reading cr2 has no side effect.
    unsafe { asm!("mov {}, cr2", out(reg) cr2, options(nomem, nostack)) };
    cr2
}

/// Load `root` (physical address of a PML4) into cr3.
pub fn set_page_table(root: usize) {
    // SAFETY: the caller hands us the root of a page table that maps the
    // kernel; the switch cannot make the executing code unmapped.
    unsafe { asm!("mov cr3, {}", in(reg) root, options(nostack)) };
}

pub fn current_page_table() -> usize {
    let cr3: usize;
    // SAFETY: reading cr3 has no side effect.
    unsafe { asm!("mov {}, cr3", out(reg) cr3, options(nomem, nostack)) };
    cr3
}

/// Flush the whole TLB by reloading cr3.
pub fn flush_tlb() {
    set_page_table(current_page_table());
}

// The boot path builds the kernel half of the address space; every user
// page table shares its upper 256 PML4 entries.
extern "C" {
    static kernel_pml4: [usize; 512];
}

/// Physical address of the shared kernel PML4, if the machine has one.
pub fn kernel_root() -> Option<usize> {
    // SAFETY: taking the address of an extern static is safe.
    Some(v2p(unsafe { kernel_pml4.as_ptr() } as usize))
}

struct PerCpu<T>([UnsafeCell<T>; NCPU]);

// SAFETY: each entry is only accessed by its own CPU with interrupts off.
unsafe impl<T> Sync for PerCpu<T> {}

#[derive(Copy, Clone)]
struct IntrState {
    /// Depth of push_off() nesting.
    noff: u32,
    /// Were interrupts enabled before the outermost push_off()?
    intena: bool,
}

static INTR_STATE: PerCpu<IntrState> = PerCpu(
    array![_ => UnsafeCell::new(IntrState { noff: 0, intena: false }); NCPU],
);

fn intr_state() -> *mut IntrState {
    INTR_STATE.0[cpu_id()].get()
}

pub fn intr_depth() -> u32 {
    // SAFETY: cpu-local, and callers run with interrupts off.
    unsafe { (*intr_state()).noff }
}

pub fn set_intr_depth(depth: u32) {
    // SAFETY: same as intr_depth.
    unsafe { (*intr_state()).noff = depth };
}

pub fn intr_was_enabled() -> bool {
    // SAFETY: same as intr_depth.
    unsafe { (*intr_state()).intena }
}

pub fn set_intr_was_enabled(on: bool) {
    // SAFETY: same as intr_depth.
    unsafe { (*intr_state()).intena = on };
}

/// Hand the CPU to `new`, saving the current context in `old`.
///
/// # Safety
///
/// `old` must be writable and `new` must hold a context saved by a previous
/// `context_switch` (or built by allocproc).
pub unsafe fn context_switch(old: *mut Context, new: *mut Context) {
    unsafe { swtch(old, new) };
}

/// Restore `tf` and return to user mode. Never returns.
///
/// # Safety
///
/// `tf` must be a trap frame whose cs/ss select user-mode segments and whose
/// rip/rsp are mapped in the installed address space.
pub unsafe fn trap_return(tf: *mut TrapFrame) -> ! {
    unsafe { trapret(tf) }
}

pub fn console_putc(c: u8) {
    // SAFETY: the UART driver serializes internally.
    unsafe { uart_putc(c) };
}

pub fn uart_intr() {
    // SAFETY: called from the trap handler for IRQ_COM1.
    unsafe { uart_intr_handler() };
}

pub fn kbd_intr() {
    // SAFETY: called from the trap handler for IRQ_KBD.
    unsafe { kbd_intr_handler() };
}

pub fn ide_intr() {
    // SAFETY: called from the trap handler for IRQ_IDE.
    unsafe { ide_intr_handler() };
}

pub fn irq_eoi() {
    // SAFETY: acknowledging the local APIC is always sound in a handler.
    unsafe { lapic_eoi() };
}

pub fn halt() -> ! {
    loop {
        // SAFETY: hlt with interrupts off parks the CPU.
        unsafe { asm!("cli; hlt", options(nomem, nostack)) };
    }
}
