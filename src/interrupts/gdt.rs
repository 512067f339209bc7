//! The GDT: flat 4G code/data segments for rings 0 and 3, plus the one
//! TSS the CPU uses to find the kernel stack on ring transitions.

use crate::arch;
use core::ptr::addr_of;

pub const KERNEL_CODE_SELECTOR: u16 = 0x08;
pub const KERNEL_DATA_SELECTOR: u16 = 0x10;
pub const USER_CODE_SELECTOR: u16 = 0x18 | 3;
pub const USER_DATA_SELECTOR: u16 = 0x20 | 3;
pub const TSS_SELECTOR: u16 = 0x28;

/// Flat 4G descriptor: `base` 0, `limit` 0xFFFFF with 4K granularity.
const fn flat_descriptor(access: u8) -> u64 {
    let limit_low: u64 = 0xFFFF;
    let limit_high: u64 = 0xF;
    let flags: u64 = 0xC; // 4K granularity, 32-bit
    limit_low | (access as u64) << 40 | limit_high << 48 | flags << 52
}

#[repr(C, packed)]
struct TaskStateSegment {
    prev_task_link: u32,
    esp0: u32,
    ss0: u32,
    unused: [u32; 23],
}

static mut TSS: TaskStateSegment = TaskStateSegment {
    prev_task_link: 0,
    esp0: 0,
    ss0: KERNEL_DATA_SELECTOR as u32,
    unused: [0; 23],
};

static mut GDT: [u64; 6] = [0; 6];

#[repr(C, packed)]
struct DescriptorTablePointer {
    limit: u16,
    base: u32,
}

static mut GDT_POINTER: DescriptorTablePointer = DescriptorTablePointer { limit: 0, base: 0 };

fn tss_descriptor(base: u32, limit: u32) -> u64 {
    let mut desc: u64 = 0;
    desc |= (limit & 0xFFFF) as u64;
    desc |= ((base & 0xFFFFFF) as u64) << 16;
    desc |= 0x89u64 << 40; // present 32-bit TSS (available)
    desc |= (((limit >> 16) & 0xF) as u64) << 48;
    desc |= (((base >> 24) & 0xFF) as u64) << 56;
    desc
}

/// Point the TSS at the trap stack so ring-3 faults land somewhere sane.
pub fn set_tss_esp0(esp0: u32) {
    unsafe {
        TSS.esp0 = esp0;
    }
}

pub fn init() {
    unsafe {
        GDT[0] = 0;
        GDT[1] = flat_descriptor(0x9A); // kernel code
        GDT[2] = flat_descriptor(0x92); // kernel data
        GDT[3] = flat_descriptor(0xFA); // user code
        GDT[4] = flat_descriptor(0xF2); // user data

        let tss_base = addr_of!(TSS) as u32;
        GDT[5] = tss_descriptor(tss_base, core::mem::size_of::<TaskStateSegment>() as u32 - 1);

        TSS.esp0 = crate::sched::ctx::kernel_stack_top();

        GDT_POINTER = DescriptorTablePointer {
            limit: core::mem::size_of::<[u64; 6]>() as u16 - 1,
            base: addr_of!(GDT) as u32,
        };

        arch::lgdt(addr_of!(GDT_POINTER) as u32);
        reload_segments();
        arch::ltr(TSS_SELECTOR);
    }
}

#[cfg(target_arch = "x86")]
unsafe fn reload_segments() {
    core::arch::asm!(
        "push {code}",
        "lea eax, [2f]",
        "push eax",
        "retf",
        "2:",
        "mov eax, {data}",
        "mov ds, ax",
        "mov es, ax",
        "mov fs, ax",
        "mov gs, ax",
        "mov ss, ax",
        code = const KERNEL_CODE_SELECTOR as u32,
        data = const KERNEL_DATA_SELECTOR as u32,
        out("eax") _,
    );
}

#[cfg(not(target_arch = "x86"))]
unsafe fn reload_segments() {}
