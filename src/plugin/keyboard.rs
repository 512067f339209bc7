//! The keyboard-event plugin.
//!
//! Scancodes arrive from the IRQ1 trap action over the privileged
//! `on_kernel_cmd` hook, never on behalf of a thread. Userspace reads
//! them through an ordinary handle, blocking on `wait_read_ready` while
//! the event ring is dry.

use super::Plugin;
use crate::handle::{Handle, HandleState};
use crate::memory::space::{copy_to_user, UserPtr};
use crate::proc::KernelState;
use crate::sched::thread::Pid;
use crate::sched::wait::BasicWaitQueue;
use crate::syscall::error::{FosError, OsResult};
use alloc::boxed::Box;
use alloc::collections::VecDeque;
use alloc::sync::Arc;
use spin::Mutex;

pub const PLG_KB_PCID_OPEN: u32 = 0;

/// The privileged command the IRQ1 handler sends.
pub const KB_KCID_KEY_EVENT: u32 = 0;

/// Events kept when nobody reads; older ones are dropped first.
const KB_RING_CAP: usize = 256;

struct KbShared {
    events: VecDeque<u8>,
    wq: Arc<Mutex<BasicWaitQueue>>,
}

impl KbShared {
    fn new() -> KbShared {
        KbShared {
            events: VecDeque::new(),
            wq: BasicWaitQueue::new_shared(),
        }
    }

    /// Append one scancode, evicting the oldest when the ring is full.
    /// True when the ring was empty, i.e. readers may be parked.
    fn push_event(&mut self, sc: u8) -> bool {
        let was_empty = self.events.is_empty();
        if self.events.len() == KB_RING_CAP {
            self.events.pop_front();
        }
        self.events.push_back(sc);
        was_empty
    }
}

pub struct KeyboardPlugin {
    shared: Arc<Mutex<KbShared>>,
}

impl KeyboardPlugin {
    pub fn new() -> KeyboardPlugin {
        KeyboardPlugin {
            shared: Arc::new(Mutex::new(KbShared::new())),
        }
    }
}

impl Plugin for KeyboardPlugin {
    fn cmd(&mut self, ks: &mut KernelState, cmd: u32, args: [u32; 4]) -> OsResult {
        match cmd {
            // args[0]: user pointer receiving the new handle.
            PLG_KB_PCID_OPEN => {
                let pid = ks.curr_pid().ok_or(FosError::StateMismatch)?;
                let pd = ks.curr_pd().ok_or(FosError::StateMismatch)?;

                let u_handle = args[0];
                if u_handle == 0 {
                    return ks.dual_ret(FosError::BadArgs);
                }

                let h = {
                    let proc = ks.proc_mut(pid).ok_or(FosError::StateMismatch)?;
                    match proc.handles.reserve() {
                        Some(h) => h,
                        None => return ks.dual_ret(FosError::NoMem),
                    }
                };

                if UserPtr::<u32>::new(u_handle).write(pd, &h).is_err() {
                    ks.proc_mut(pid).ok_or(FosError::StateMismatch)?.handles.release(h);
                    return ks.dual_ret(FosError::NoMem);
                }

                let hs = KbHandleState {
                    pid,
                    handle: h,
                    shared: self.shared.clone(),
                };
                ks.proc_mut(pid)
                    .ok_or(FosError::StateMismatch)?
                    .handles
                    .set(h, Box::new(hs));

                ks.dual_ret(FosError::Success)
            }

            _ => ks.dual_ret(FosError::BadArgs),
        }
    }

    fn on_kernel_cmd(&mut self, ks: &mut KernelState, cmd: u32, args: [u32; 4]) -> OsResult {
        match cmd {
            KB_KCID_KEY_EVENT => {
                let (was_empty, wq) = {
                    let mut shared = self.shared.lock();
                    let was_empty = shared.push_event(args[0] as u8);
                    (was_empty, shared.wq.clone())
                };

                if was_empty {
                    ks.wake_all(&wq, FosError::Success);
                }
                Ok(())
            }

            _ => Ok(()),
        }
    }
}

struct KbHandleState {
    pid: Pid,
    handle: Handle,
    shared: Arc<Mutex<KbShared>>,
}

impl HandleState for KbHandleState {
    fn process(&self) -> Pid {
        self.pid
    }

    fn handle(&self) -> Handle {
        self.handle
    }

    fn clone_for(&self, new_pid: Pid) -> OsResult<Box<dyn HandleState>> {
        Ok(Box::new(KbHandleState {
            pid: new_pid,
            handle: self.handle,
            shared: self.shared.clone(),
        }))
    }

    fn close(self: Box<Self>, _ks: &mut KernelState) -> OsResult {
        Ok(())
    }

    /// Drain up to `len` scancodes. `EMPTY` when none are pending.
    fn read(&mut self, ks: &mut KernelState, u_dst: u32, len: usize, u_readden: u32) -> OsResult {
        let pd = ks.curr_pd().ok_or(FosError::StateMismatch)?;

        if u_dst == 0 || len == 0 {
            return ks.dual_ret(FosError::BadArgs);
        }

        let drained: alloc::vec::Vec<u8> = {
            let mut shared = self.shared.lock();
            if shared.events.is_empty() {
                return ks.dual_ret(FosError::Empty);
            }
            let n = len.min(shared.events.len());
            shared.events.drain(..n).collect()
        };

        if let Err(e) = copy_to_user(pd, u_dst, &drained) {
            return ks.dual_ret(e.user_error());
        }

        if u_readden != 0 {
            let n = drained.len() as u32;
            if UserPtr::<u32>::new(u_readden).write(pd, &n).is_err() {
                return ks.dual_ret(FosError::NoMem);
            }
        }

        ks.dual_ret(FosError::Success)
    }

    fn wait_read_ready(&mut self, ks: &mut KernelState) -> OsResult {
        let (empty, wq) = {
            let shared = self.shared.lock();
            (shared.events.is_empty(), shared.wq.clone())
        };

        if empty {
            return ks.block_current(&wq, [0; 6]);
        }
        ks.dual_ret(FosError::Success)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::page::PhysAddr;
    use crate::proc::Process;
    use crate::sched::thread::{Gtid, Thread, ThreadState};

    fn setup() -> (KernelState, KeyboardPlugin, Gtid) {
        let mut ks = KernelState::new();

        let pid = ks.procs.reserve().unwrap();
        let mut proc = Process::new(pid, None, PhysAddr::NULL);
        let tid = proc.threads.reserve().unwrap();
        proc.threads
            .set(tid, Thread::new(tid, PhysAddr::NULL, 0x0450_0000, 0, 0, 0));
        proc.main_tid = tid;
        ks.procs.set(pid, proc);
        ks.root_pid = pid;

        let gtid = Gtid::new(pid, tid);
        ks.schedule_thread(gtid);

        let plg = KeyboardPlugin::new();
        (ks, plg, gtid)
    }

    fn eax(ks: &KernelState, gtid: Gtid) -> u32 {
        ks.thread(gtid).unwrap().ctx.eax
    }

    #[test]
    fn ring_evicts_oldest_when_full() {
        let mut shared = KbShared::new();

        for i in 0..KB_RING_CAP + 3 {
            shared.push_event(i as u8);
        }

        assert_eq!(shared.events.len(), KB_RING_CAP);
        // The first three scancodes fell off the front.
        assert_eq!(shared.events.front().copied(), Some(3));
        assert_eq!(
            shared.events.back().copied(),
            Some((KB_RING_CAP + 2) as u8)
        );
    }

    #[test]
    fn push_reports_empty_to_nonempty_transition() {
        let mut shared = KbShared::new();

        assert!(shared.push_event(0x1C));
        assert!(!shared.push_event(0x1D));

        shared.events.clear();
        assert!(shared.push_event(0x1E));
    }

    #[test]
    fn key_event_wakes_a_parked_reader() {
        let (mut ks, mut plg, gtid) = setup();

        let mut hs = KbHandleState {
            pid: gtid.pid(),
            handle: 0,
            shared: plg.shared.clone(),
        };

        hs.wait_read_ready(&mut ks).unwrap();
        assert_eq!(
            ks.thread(gtid).unwrap().state,
            ThreadState::Waiting
        );
        assert!(!ks.schedule.contains(gtid));

        plg.on_kernel_cmd(&mut ks, KB_KCID_KEY_EVENT, [0x1C, 0, 0, 0]).unwrap();
        assert_eq!(ks.thread(gtid).unwrap().state, ThreadState::Scheduled);
        assert_eq!(eax(&ks, gtid), FosError::Success.code());

        // With events pending, a second wait returns straight away.
        hs.wait_read_ready(&mut ks).unwrap();
        assert_eq!(ks.thread(gtid).unwrap().state, ThreadState::Scheduled);
        assert_eq!(eax(&ks, gtid), FosError::Success.code());
    }

    #[test]
    fn read_reports_empty_ring() {
        let (mut ks, plg, gtid) = setup();

        let mut hs = KbHandleState {
            pid: gtid.pid(),
            handle: 0,
            shared: plg.shared.clone(),
        };

        hs.read(&mut ks, 0x1000, 16, 0).unwrap();
        assert_eq!(eax(&ks, gtid), FosError::Empty.code());

        hs.read(&mut ks, 0, 16, 0).unwrap();
        assert_eq!(eax(&ks, gtid), FosError::BadArgs.code());
    }

    #[test]
    fn open_rejects_null_handle_pointer() {
        let (mut ks, mut plg, gtid) = setup();

        plg.cmd(&mut ks, PLG_KB_PCID_OPEN, [0, 0, 0, 0]).unwrap();
        assert_eq!(eax(&ks, gtid), FosError::BadArgs.code());
    }
}
