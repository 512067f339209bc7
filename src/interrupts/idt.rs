//! The IDT and the trap entry stubs.
//!
//! Each stub captures the interrupted register image into a `UserCtx` on
//! the kernel interrupt stack and calls the matching action in
//! `crate::syscall`. Actions never return; they resume whichever context
//! the kernel state says is current.

use super::gdt::KERNEL_CODE_SELECTOR;
use crate::arch;
use core::ptr::addr_of;

pub const VEC_GPF: usize = 0x0D;
pub const VEC_PF: usize = 0x0E;
pub const VEC_TIMER: usize = 0x20;
pub const VEC_KEYBOARD: usize = 0x21;
pub const VEC_SYSCALL: usize = 0x80;

#[repr(C, packed)]
#[derive(Clone, Copy)]
struct GateDescriptor {
    offset_low: u16,
    selector: u16,
    zero: u8,
    type_attr: u8,
    offset_high: u16,
}

const EMPTY_GATE: GateDescriptor = GateDescriptor {
    offset_low: 0,
    selector: 0,
    zero: 0,
    type_attr: 0,
    offset_high: 0,
};

static mut IDT: [GateDescriptor; 256] = [EMPTY_GATE; 256];

#[repr(C, packed)]
struct DescriptorTablePointer {
    limit: u16,
    base: u32,
}

static mut IDT_POINTER: DescriptorTablePointer = DescriptorTablePointer { limit: 0, base: 0 };

/// 32-bit interrupt gate (interrupts masked on entry).
#[cfg_attr(not(target_arch = "x86"), allow(dead_code))]
fn interrupt_gate(handler: u32, dpl: u8) -> GateDescriptor {
    GateDescriptor {
        offset_low: handler as u16,
        selector: KERNEL_CODE_SELECTOR,
        zero: 0,
        type_attr: 0x8E | (dpl << 5),
        offset_high: (handler >> 16) as u16,
    }
}

// ══════════════════════════════════════════════════════════════
//  Entry stubs
// ══════════════════════════════════════════════════════════════
//
// Push order mirrors the `UserCtx` layout exactly: the CPU provides
// eip/cs/eflags (and esp/ss across a privilege change), the stubs add
// the general registers, the data segment and CR3, then hand their stack
// pointer to the action as a `*mut UserCtx`. Fault vectors that push an
// error code discard it first; the actions pull CR2 themselves.

#[cfg(target_arch = "x86")]
core::arch::global_asm!(
    ".macro FOS_TRAP_BODY action",
    "push eax",
    "push ecx",
    "push edx",
    "push ebx",
    "push ebp",
    "push esi",
    "push edi",
    "mov eax, ds",
    "push eax",
    "mov eax, cr3",
    "push eax",
    "mov ax, 0x10",
    "mov ds, ax",
    "mov es, ax",
    "push esp",
    "call \\action",
    ".endm",
    //
    ".global fos_trap_stub_timer",
    "fos_trap_stub_timer:",
    "FOS_TRAP_BODY fos_timer_action_entry",
    //
    ".global fos_trap_stub_keyboard",
    "fos_trap_stub_keyboard:",
    "FOS_TRAP_BODY fos_irq1_action_entry",
    //
    ".global fos_trap_stub_pf",
    "fos_trap_stub_pf:",
    "add esp, 4",
    "FOS_TRAP_BODY fos_pf_action_entry",
    //
    ".global fos_trap_stub_gpf",
    "fos_trap_stub_gpf:",
    "add esp, 4",
    "FOS_TRAP_BODY fos_gpf_action_entry",
    //
    ".global fos_trap_stub_syscall",
    "fos_trap_stub_syscall:",
    "FOS_TRAP_BODY fos_syscall_action_entry",
);

#[cfg(target_arch = "x86")]
extern "C" {
    pub fn fos_trap_stub_timer();
    pub fn fos_trap_stub_keyboard();
    pub fn fos_trap_stub_pf();
    pub fn fos_trap_stub_gpf();
    pub fn fos_trap_stub_syscall();
}

// The symbols the stubs call into. They only forward to the actions;
// `no_mangle` pins the names the asm uses.

#[no_mangle]
extern "C" fn fos_timer_action_entry(ctx: *mut crate::sched::ctx::UserCtx) -> ! {
    crate::syscall::fos_timer_action(ctx)
}

#[no_mangle]
extern "C" fn fos_irq1_action_entry(ctx: *mut crate::sched::ctx::UserCtx) -> ! {
    crate::syscall::fos_irq1_action(ctx)
}

#[no_mangle]
extern "C" fn fos_pf_action_entry(ctx: *mut crate::sched::ctx::UserCtx) -> ! {
    crate::syscall::fos_pf_action(ctx)
}

#[no_mangle]
extern "C" fn fos_gpf_action_entry(ctx: *mut crate::sched::ctx::UserCtx) -> ! {
    crate::syscall::fos_gpf_action(ctx)
}

#[no_mangle]
extern "C" fn fos_syscall_action_entry(ctx: *mut crate::sched::ctx::UserCtx) -> ! {
    crate::syscall::fos_syscall_action(ctx)
}

pub fn init() {
    unsafe {
        #[cfg(target_arch = "x86")]
        {
            IDT[VEC_GPF] = interrupt_gate(fos_trap_stub_gpf as usize as u32, 0);
            IDT[VEC_PF] = interrupt_gate(fos_trap_stub_pf as usize as u32, 0);
            IDT[VEC_TIMER] = interrupt_gate(fos_trap_stub_timer as usize as u32, 0);
            IDT[VEC_KEYBOARD] = interrupt_gate(fos_trap_stub_keyboard as usize as u32, 0);
            // Ring 3 raises the syscall vector directly.
            IDT[VEC_SYSCALL] = interrupt_gate(fos_trap_stub_syscall as usize as u32, 3);
        }

        IDT_POINTER = DescriptorTablePointer {
            limit: core::mem::size_of::<[GateDescriptor; 256]>() as u16 - 1,
            base: addr_of!(IDT) as u32,
        };

        arch::lidt(addr_of!(IDT_POINTER) as u32);
    }
}
