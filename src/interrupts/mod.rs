//! Descriptor tables, the PIC and the PIT.

pub mod gdt;
pub mod idt;

use crate::arch;

pub const PIC_1_OFFSET: u8 = 32;
pub const PIC_2_OFFSET: u8 = PIC_1_OFFSET + 8;

const PIC1_CMD: u16 = 0x20;
const PIC1_DATA: u16 = 0x21;
const PIC2_CMD: u16 = 0xA0;
const PIC2_DATA: u16 = 0xA1;

/// Remap the cascaded 8259s away from the CPU exception vectors and mask
/// everything but the timer and keyboard lines.
fn pic_init() {
    arch::outb(PIC1_CMD, 0x11); // ICW1: init, expect ICW4
    arch::outb(PIC2_CMD, 0x11);
    arch::outb(PIC1_DATA, PIC_1_OFFSET); // ICW2: vector offsets
    arch::outb(PIC2_DATA, PIC_2_OFFSET);
    arch::outb(PIC1_DATA, 0x04); // ICW3: slave on IRQ2
    arch::outb(PIC2_DATA, 0x02);
    arch::outb(PIC1_DATA, 0x01); // ICW4: 8086 mode
    arch::outb(PIC2_DATA, 0x01);

    arch::outb(PIC1_DATA, !0b0000_0011); // unmask IRQ0 + IRQ1
    arch::outb(PIC2_DATA, 0xFF);
}

/// Acknowledge `irq` at the PIC(s).
pub fn pic_end_of_interrupt(irq: u8) {
    if irq >= 8 {
        arch::outb(PIC2_CMD, 0x20);
    }
    arch::outb(PIC1_CMD, 0x20);
}

const PIT_CMD: u16 = 0x43;
const PIT_CH0: u16 = 0x40;
const PIT_BASE_HZ: u32 = 1_193_182;

/// Program channel 0 for a periodic tick at roughly `hz`.
fn pit_init(hz: u32) {
    let divisor = (PIT_BASE_HZ / hz).clamp(1, 65535) as u16;
    arch::outb(PIT_CMD, 0x36); // channel 0, lo/hi, square wave
    arch::outb(PIT_CH0, divisor as u8);
    arch::outb(PIT_CH0, (divisor >> 8) as u8);
}

/// Tick rate of the scheduler.
pub const TICK_HZ: u32 = 100;

pub fn init() {
    gdt::init();
    idt::init();
    pic_init();
    pit_init(TICK_HZ);
}
