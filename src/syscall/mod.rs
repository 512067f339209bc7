//! The syscall surface and the trap actions.
//!
//! Syscall ids are stable opcodes. Two reserved bands ride on top of the
//! plain ids: handle commands (`0x8000_0000 | handle << 16 | cmd`) and
//! plugin commands (`0x4000_0000 | plugin << 16 | cmd`). The dispatcher
//! decodes the band and forwards to the handle table or the plugin bus.
//!
//! Register convention at the syscall gate: id in `eax`, arguments in
//! `ebx`, `ecx`, `edx`, `esi`. The result lands back in `eax`.

pub mod error;

use crate::arch;
use crate::handle::Handle;
use crate::memory::page;
use crate::memory::space::{fault_page_base, RawUserApp, UserPtr};
use crate::plugin::{FOS_MAX_PLUGINS, PLG_KEYBOARD_ID};
use crate::proc::ops::ThreadJoinRet;
use crate::proc::{KernelState, KERNEL, PROC_ES_GPF, PROC_ES_PF};
use crate::sched::ctx::{return_to_ctx, return_to_halt_ctx, UserCtx};
use error::{FosError, OsResult};

// ══════════════════════════════════════════════════════════════
//  Syscall ids
// ══════════════════════════════════════════════════════════════

pub const SCID_PROC_FORK: u32 = 0;
pub const SCID_PROC_EXIT: u32 = 1;
pub const SCID_PROC_REAP: u32 = 2;
pub const SCID_PROC_EXEC: u32 = 3;
pub const SCID_SIGNAL: u32 = 4;
pub const SCID_SIGNAL_ALLOW: u32 = 5;
pub const SCID_SIGNAL_WAIT: u32 = 6;
pub const SCID_SIGNAL_CLEAR: u32 = 7;
pub const SCID_MEM_REQUEST: u32 = 8;
pub const SCID_MEM_RETURN: u32 = 9;
pub const SCID_THREAD_EXIT: u32 = 10;
pub const SCID_THREAD_SLEEP: u32 = 11;
pub const SCID_THREAD_SPAWN: u32 = 12;
pub const SCID_THREAD_JOIN: u32 = 13;
pub const SCID_SET_IN_HANDLE: u32 = 14;
pub const SCID_GET_IN_HANDLE: u32 = 15;
pub const SCID_IN_READ: u32 = 16;
pub const SCID_IN_WAIT: u32 = 17;
pub const SCID_SET_OUT_HANDLE: u32 = 18;
pub const SCID_GET_OUT_HANDLE: u32 = 19;
pub const SCID_OUT_WRITE: u32 = 20;
pub const SCID_OUT_WAIT: u32 = 21;

const SCID_HANDLE_CMD_FLAG: u32 = 0x8000_0000;
const SCID_PLUGIN_CMD_FLAG: u32 = 0x4000_0000;

pub fn handle_cmd_scid(h: Handle, cmd: u32) -> u32 {
    SCID_HANDLE_CMD_FLAG | (h << 16) | (cmd & 0xFFFF)
}

pub fn scid_is_handle_cmd(id: u32) -> bool {
    id & SCID_HANDLE_CMD_FLAG != 0
}

pub fn handle_scid_extract(id: u32) -> (Handle, u32) {
    ((id >> 16) & 0x7FFF, id & 0xFFFF)
}

pub fn plugin_cmd_scid(plg_id: u32, cmd: u32) -> u32 {
    SCID_PLUGIN_CMD_FLAG | (plg_id << 16) | (cmd & 0xFFFF)
}

pub fn scid_is_plugin_cmd(id: u32) -> bool {
    id & SCID_HANDLE_CMD_FLAG == 0 && id & SCID_PLUGIN_CMD_FLAG != 0
}

pub fn plugin_scid_extract(id: u32) -> (u32, u32) {
    ((id >> 16) & 0x3FFF, id & 0xFFFF)
}

// ══════════════════════════════════════════════════════════════
//  Shutdown
// ══════════════════════════════════════════════════════════════

/// Run every plugin's shutdown hook, then stop the machine for good.
pub fn shutdown(ks: &mut KernelState) -> ! {
    crate::log_info!("fernos shutting down");

    for slot in 0..FOS_MAX_PLUGINS {
        if let Some(mut plg) = ks.plugins[slot].take() {
            plg.on_shutdown(ks);
        }
    }

    arch::disable_interrupts();
    loop {
        arch::hlt();
    }
}

/// A kernel-channel error surfaced at the trap boundary.
fn fatal(ks: &mut KernelState, what: &str, err: FosError) -> ! {
    crate::log_error!("fatal kernel error in {}: {}", what, err);
    shutdown(ks);
}

/// Resume whoever is now at the head of the schedule, or idle.
fn return_to_current(ks_resume: Option<UserCtx>) -> ! {
    match ks_resume {
        Some(ctx) => unsafe { return_to_ctx(&ctx) },
        None => return_to_halt_ctx(),
    }
}

// ══════════════════════════════════════════════════════════════
//  Trap actions
// ══════════════════════════════════════════════════════════════

/// The timer interrupt: tick the kernel, then return to the (possibly
/// different) current thread.
pub extern "C" fn fos_timer_action(ctx: *mut UserCtx) -> ! {
    let resume = {
        let mut guard = KERNEL.lock();
        let ks = guard.as_mut().expect("timer before kernel init");

        ks.save_ctx(unsafe { &*ctx });

        if let Err(e) = ks.tick() {
            fatal(ks, "tick", e);
        }

        crate::interrupts::pic_end_of_interrupt(0);
        ks.curr_thread().map(|t| t.ctx)
    };

    return_to_current(resume)
}

/// The keyboard interrupt: pull the scancode and hand it to the keyboard
/// plugin over the privileged hook.
pub extern "C" fn fos_irq1_action(ctx: *mut UserCtx) -> ! {
    let resume = {
        let mut guard = KERNEL.lock();
        let ks = guard.as_mut().expect("irq1 before kernel init");

        ks.save_ctx(unsafe { &*ctx });

        // Check the i8042 actually has data; spurious pulses happen
        // around controller init.
        let status = arch::inb(0x64);
        if status & 0x01 != 0 {
            let scancode = arch::inb(0x60) as u32;
            if let Err(e) =
                ks.plugin_kernel_cmd(PLG_KEYBOARD_ID, crate::plugin::keyboard::KB_KCID_KEY_EVENT, [scancode, 0, 0, 0])
            {
                fatal(ks, "key event", e);
            }
        }

        crate::interrupts::pic_end_of_interrupt(1);
        ks.curr_thread().map(|t| t.ctx)
    };

    return_to_current(resume)
}

/// The page-fault handler. A fault inside the current thread's stack slot
/// grows the stack; any other user fault kills the process with `PF`; a
/// fault while the kernel's own directory is live is unrecoverable.
pub extern "C" fn fos_pf_action(ctx: *mut UserCtx) -> ! {
    let cr2 = arch::read_cr2();

    let resume = {
        let mut guard = KERNEL.lock();
        let ks = guard.as_mut().expect("page fault before kernel init");

        if unsafe { (*ctx).cr3 } == page::kernel_pd().0 {
            crate::log_error!("page fault in kernel space at {:#010x}", cr2);
            shutdown(ks);
        }

        ks.save_ctx(unsafe { &*ctx });

        if ks.expand_stack(fault_page_base(cr2)).is_err() {
            if let Err(e) = ks.exit_proc(PROC_ES_PF) {
                fatal(ks, "page-fault exit", e);
            }
        }

        ks.curr_thread().map(|t| t.ctx)
    };

    return_to_current(resume)
}

/// The general-protection-fault handler: kill the offending process.
pub extern "C" fn fos_gpf_action(ctx: *mut UserCtx) -> ! {
    let resume = {
        let mut guard = KERNEL.lock();
        let ks = guard.as_mut().expect("gpf before kernel init");

        if unsafe { (*ctx).cr3 } == page::kernel_pd().0 {
            crate::log_error!("general protection fault in kernel space");
            shutdown(ks);
        }

        ks.save_ctx(unsafe { &*ctx });

        if let Err(e) = ks.exit_proc(PROC_ES_GPF) {
            fatal(ks, "gpf exit", e);
        }

        ks.curr_thread().map(|t| t.ctx)
    };

    return_to_current(resume)
}

/// The syscall gate. Id in `eax`, args in `ebx`/`ecx`/`edx`/`esi`.
pub extern "C" fn fos_syscall_action(ctx: *mut UserCtx) -> ! {
    let resume = {
        let mut guard = KERNEL.lock();
        let ks = guard.as_mut().expect("syscall before kernel init");

        ks.save_ctx(unsafe { &*ctx });

        let (id, a0, a1, a2, a3) = {
            let c = unsafe { &*ctx };
            (c.eax, c.ebx, c.ecx, c.edx, c.esi)
        };

        if let Err(e) = dispatch_syscall(ks, id, a0, a1, a2, a3) {
            crate::log_error!("syscall {:#x} failed fatally: {}", id, e);
            shutdown(ks);
        }

        ks.curr_thread().map(|t| t.ctx)
    };

    return_to_current(resume)
}

fn dispatch_syscall(
    ks: &mut KernelState,
    id: u32,
    a0: u32,
    a1: u32,
    a2: u32,
    a3: u32,
) -> OsResult {
    match id {
        SCID_PROC_FORK => ks.fork_proc(UserPtr::new(a0)),
        SCID_PROC_EXIT => ks.exit_proc(a0),
        SCID_PROC_REAP => ks.reap_proc(a0, UserPtr::new(a1), UserPtr::new(a2)),
        SCID_PROC_EXEC => ks.exec(UserPtr::<RawUserApp>::new(a0), a1, a2 as usize),
        SCID_SIGNAL => ks.signal(a0, a1),
        SCID_SIGNAL_ALLOW => ks.allow_signal(a0),
        SCID_SIGNAL_WAIT => ks.wait_signal(a0, UserPtr::new(a1)),
        SCID_SIGNAL_CLEAR => ks.signal_clear(a0),
        SCID_MEM_REQUEST => ks.request_mem(a0, a1, UserPtr::new(a2)),
        SCID_MEM_RETURN => ks.return_mem(a0, a1),
        SCID_THREAD_EXIT => ks.exit_thread(a0),
        SCID_THREAD_SLEEP => ks.sleep_thread(a0),
        SCID_THREAD_SPAWN => ks.spawn_local_thread(UserPtr::new(a0), a1, a2),
        SCID_THREAD_JOIN => ks.join_local_thread(a0, UserPtr::<ThreadJoinRet>::new(a1)),
        SCID_SET_IN_HANDLE => ks.set_in_handle(a0),
        SCID_GET_IN_HANDLE => {
            let val = ks
                .curr_pid()
                .and_then(|pid| ks.proc(pid))
                .map(|p| p.in_handle)
                .unwrap_or(crate::handle::NULL_HANDLE);
            ks.set_user_ret_val(val);
            Ok(())
        }
        SCID_IN_READ => ks.in_read(a0, a1 as usize, a2),
        SCID_IN_WAIT => ks.in_wait(),
        SCID_SET_OUT_HANDLE => ks.set_out_handle(a0),
        SCID_GET_OUT_HANDLE => {
            let val = ks
                .curr_pid()
                .and_then(|pid| ks.proc(pid))
                .map(|p| p.out_handle)
                .unwrap_or(crate::handle::NULL_HANDLE);
            ks.set_user_ret_val(val);
            Ok(())
        }
        SCID_OUT_WRITE => ks.out_write(a0, a1 as usize, a2),
        SCID_OUT_WAIT => ks.out_wait(),

        other if scid_is_handle_cmd(other) => {
            let (h, cmd) = handle_scid_extract(other);
            crate::handle::dispatch_handle_cmd(ks, h, cmd, [a0, a1, a2, a3])
        }
        other if scid_is_plugin_cmd(other) => {
            let (plg_id, cmd) = plugin_scid_extract(other);
            ks.plugin_cmd(plg_id, cmd, [a0, a1, a2, a3])
        }
        _ => ks.dual_ret(FosError::BadArgs),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn handle_band_round_trips() {
        let id = handle_cmd_scid(7, crate::handle::HCID_READ);
        assert!(scid_is_handle_cmd(id));
        assert!(!scid_is_plugin_cmd(id));
        assert_eq!(handle_scid_extract(id), (7, crate::handle::HCID_READ));
    }

    #[test]
    fn plugin_band_round_trips() {
        let id = plugin_cmd_scid(2, 5);
        assert!(scid_is_plugin_cmd(id));
        assert!(!scid_is_handle_cmd(id));
        assert_eq!(plugin_scid_extract(id), (2, 5));
    }

    #[test]
    fn plain_ids_are_in_neither_band() {
        assert!(!scid_is_handle_cmd(SCID_PROC_FORK));
        assert!(!scid_is_plugin_cmd(SCID_OUT_WAIT));
    }
}
