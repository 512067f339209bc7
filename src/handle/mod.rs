//! The handle subsystem.
//!
//! A handle is a per-process small integer naming a polymorphic I/O
//! object. Each occupied handle-table entry owns a `HandleState`; the
//! required operations are cloning (for fork) and closing, everything
//! else defaults to `NOT_IMPLEMENTED` in the caller's `eax`.

pub mod cd;

use crate::proc::KernelState;
use crate::sched::thread::Pid;
use crate::syscall::error::{FosError, OsResult};

pub type Handle = u32;

pub const FOS_MAX_HANDLES_PER_PROC: u32 = 32;

/// The null handle value (`IdTable` sentinel).
pub const NULL_HANDLE: Handle = FOS_MAX_HANDLES_PER_PROC;

// Standard handle commands, decoded from the handle syscall band.
pub const HCID_CLOSE: u32 = 0;
pub const HCID_WRITE: u32 = 1;
pub const HCID_WAIT_WRITE_READY: u32 = 2;
pub const HCID_READ: u32 = 3;
pub const HCID_WAIT_READ_READY: u32 = 4;
pub const HCID_IS_CD: u32 = 5;

/// First command id handle types may use for their own commands.
pub const HCID_CUSTOM_START: u32 = 0x10;

/// One polymorphic handle-table entry.
///
/// Operations run with the state temporarily lifted out of its table
/// slot, so they get full access to the kernel state. They all assume a
/// current thread and report user outcomes through its saved `eax`;
/// kernel-channel errors shut the system down.
pub trait HandleState: Send {
    /// The process whose table owns this state.
    fn process(&self) -> Pid;

    /// The id this state is filed under in that table.
    fn handle(&self) -> Handle;

    /// Duplicate this state for a forked child. Refcounted resources bump
    /// their count; device handles copy the device reference. Must not
    /// touch any handle table.
    fn clone_for(&self, new_pid: Pid) -> OsResult<alloc::boxed::Box<dyn HandleState>>;

    /// Tear this state down. Runs after the state has been removed from
    /// its table.
    fn close(self: alloc::boxed::Box<Self>, ks: &mut KernelState) -> OsResult;

    fn write(&mut self, ks: &mut KernelState, _u_src: u32, _len: usize, _u_written: u32) -> OsResult {
        ks.dual_ret(FosError::NotImplemented)
    }

    fn read(&mut self, ks: &mut KernelState, _u_dst: u32, _len: usize, _u_readden: u32) -> OsResult {
        ks.dual_ret(FosError::NotImplemented)
    }

    fn wait_write_ready(&mut self, ks: &mut KernelState) -> OsResult {
        ks.dual_ret(FosError::NotImplemented)
    }

    fn wait_read_ready(&mut self, ks: &mut KernelState) -> OsResult {
        ks.dual_ret(FosError::NotImplemented)
    }

    fn cmd(&mut self, ks: &mut KernelState, _cmd: u32, _args: [u32; 4]) -> OsResult {
        ks.dual_ret(FosError::BadArgs)
    }

    /// Character-display probe (`IS_CD`).
    fn is_char_display(&self) -> bool {
        false
    }
}

/// Run one standard-or-custom command against handle `h` of the current
/// process. The state is lifted out of the table for the duration so the
/// operation can reach the rest of the kernel.
pub fn dispatch_handle_cmd(
    ks: &mut KernelState,
    h: Handle,
    cmd: u32,
    args: [u32; 4],
) -> OsResult {
    let pid = match ks.curr_pid() {
        Some(pid) => pid,
        None => return Err(FosError::StateMismatch),
    };

    let Some(mut hs) = ks.take_handle(pid, h) else {
        return ks.dual_ret(FosError::InvalidIndex);
    };

    if cmd == HCID_CLOSE {
        ks.release_handle_id(pid, h);
        let res = hs.close(ks);
        if res.is_ok() {
            ks.set_user_ret(FosError::Success);
        }
        return res;
    }

    let res = match cmd {
        HCID_WRITE => hs.write(ks, args[0], args[1] as usize, args[2]),
        HCID_WAIT_WRITE_READY => hs.wait_write_ready(ks),
        HCID_READ => hs.read(ks, args[0], args[1] as usize, args[2]),
        HCID_WAIT_READ_READY => hs.wait_read_ready(ks),
        HCID_IS_CD => {
            let code = if hs.is_char_display() {
                FosError::Success
            } else {
                FosError::UnknownError
            };
            ks.dual_ret(code)
        }
        custom => hs.cmd(ks, custom, args),
    };

    ks.put_handle_back(pid, h, hs);
    res
}

#[cfg(test)]
mod tests {
    use super::cd::{CdHandleState, SerialDisplay};
    use super::*;
    use crate::memory::page::PhysAddr;
    use crate::proc::Process;
    use crate::sched::thread::{Gtid, Thread};
    use alloc::boxed::Box;
    use alloc::sync::Arc;
    use spin::Mutex;

    /// Kernel state with one process, one running thread, and a
    /// character-display handle wired as default output.
    fn setup() -> (KernelState, Gtid, Handle) {
        let mut ks = KernelState::new();

        let pid = ks.procs.reserve().unwrap();
        let mut proc = Process::new(pid, None, PhysAddr::NULL);
        let tid = proc.threads.reserve().unwrap();
        proc.threads
            .set(tid, Thread::new(tid, PhysAddr::NULL, 0x0450_0000, 0, 0, 0));
        proc.main_tid = tid;

        let h = proc.handles.reserve().unwrap();
        let cd: Arc<Mutex<dyn super::cd::CharDisplay>> = Arc::new(Mutex::new(SerialDisplay));
        proc.handles.set(h, Box::new(CdHandleState::new(pid, h, cd)));
        proc.out_handle = h;

        ks.procs.set(pid, proc);
        ks.root_pid = pid;

        let gtid = Gtid::new(pid, tid);
        ks.schedule_thread(gtid);
        (ks, gtid, h)
    }

    fn eax(ks: &KernelState, gtid: Gtid) -> u32 {
        ks.thread(gtid).unwrap().ctx.eax
    }

    #[test]
    fn missing_handle_is_a_user_error() {
        let (mut ks, gtid, _h) = setup();
        dispatch_handle_cmd(&mut ks, 17, HCID_WRITE, [0; 4]).unwrap();
        assert_eq!(eax(&ks, gtid), FosError::InvalidIndex.code());
    }

    #[test]
    fn is_cd_probe() {
        let (mut ks, gtid, h) = setup();
        dispatch_handle_cmd(&mut ks, h, HCID_IS_CD, [0; 4]).unwrap();
        assert_eq!(eax(&ks, gtid), FosError::Success.code());
    }

    #[test]
    fn unimplemented_op_reports_not_implemented() {
        // A character display has no read side.
        let (mut ks, gtid, h) = setup();
        dispatch_handle_cmd(&mut ks, h, HCID_READ, [0x1000, 4, 0, 0]).unwrap();
        assert_eq!(eax(&ks, gtid), FosError::NotImplemented.code());
    }

    #[test]
    fn close_recycles_the_id_and_clears_defaults() {
        let (mut ks, gtid, h) = setup();
        let pid = gtid.pid();

        dispatch_handle_cmd(&mut ks, h, HCID_CLOSE, [0; 4]).unwrap();
        assert_eq!(eax(&ks, gtid), FosError::Success.code());

        let proc = ks.proc(pid).unwrap();
        assert!(!proc.handles.contains(h));
        assert_eq!(proc.out_handle, NULL_HANDLE);

        // Using it again is a plain user error.
        dispatch_handle_cmd(&mut ks, h, HCID_WRITE, [0; 4]).unwrap();
        assert_eq!(eax(&ks, gtid), FosError::InvalidIndex.code());
    }

    #[test]
    fn handle_state_remembers_owner() {
        let (ks, gtid, h) = setup();
        let proc = ks.proc(gtid.pid()).unwrap();
        let hs = proc.handles.get(h).unwrap();
        assert_eq!(hs.process(), gtid.pid());
        assert_eq!(hs.handle(), h);
    }
}
