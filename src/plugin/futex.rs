//! The futex plugin.
//!
//! A futex is a 32-bit word in userspace registered with the kernel. Each
//! process owns a map from futex address to a wait queue; `wait` parks
//! the caller while the word holds an expected value, `wake` releases one
//! or all parked threads. Futexes never survive a fork; the child gets
//! an empty map.

use super::Plugin;
use crate::memory::space::UserPtr;
use crate::proc::KernelState;
use crate::sched::thread::Pid;
use crate::sched::wait::{BasicWaitQueue, NotifyMode};
use crate::syscall::error::{FosError, OsResult};
use alloc::collections::BTreeMap;
use alloc::sync::Arc;
use spin::Mutex;

pub const PLG_FUT_PCID_REGISTER: u32 = 0;
pub const PLG_FUT_PCID_DEREGISTER: u32 = 1;
pub const PLG_FUT_PCID_WAIT: u32 = 2;
pub const PLG_FUT_PCID_WAKE: u32 = 3;

type FutexMap = BTreeMap<u32, Arc<Mutex<BasicWaitQueue>>>;

pub struct FutexPlugin {
    fut_maps: BTreeMap<Pid, FutexMap>,
}

impl FutexPlugin {
    /// Builds per-process futex maps for every process alive at install
    /// time.
    pub fn new(ks: &KernelState) -> FutexPlugin {
        let mut fut_maps = BTreeMap::new();
        for pid in ks.procs.ids() {
            fut_maps.insert(pid, FutexMap::new());
        }
        FutexPlugin { fut_maps }
    }
}

impl Plugin for FutexPlugin {
    fn cmd(&mut self, ks: &mut KernelState, cmd: u32, args: [u32; 4]) -> OsResult {
        let pid = ks.curr_pid().ok_or(FosError::StateMismatch)?;
        let pd = ks.curr_pd().ok_or(FosError::StateMismatch)?;

        let fut_map = self.fut_maps.get_mut(&pid).ok_or(FosError::StateMismatch)?;

        match cmd {
            // Register the futex word at args[0]. The word must be
            // readable; a futex may only be registered once.
            PLG_FUT_PCID_REGISTER => {
                let u_fut = args[0];
                if u_fut == 0 {
                    return ks.dual_ret(FosError::BadArgs);
                }
                if fut_map.contains_key(&u_fut) {
                    return ks.dual_ret(FosError::AlreadyAllocated);
                }

                // Confirm the caller can actually see this word.
                if UserPtr::<u32>::new(u_fut).read(pd).is_err() {
                    return ks.dual_ret(FosError::InvalidIndex);
                }

                fut_map.insert(u_fut, BasicWaitQueue::new_shared());
                ks.dual_ret(FosError::Success)
            }

            // Drop the futex at args[0]; anyone parked on it is released
            // with STATE_MISMATCH.
            PLG_FUT_PCID_DEREGISTER => {
                let u_fut = args[0];
                if u_fut == 0 {
                    return ks.dual_ret(FosError::Success);
                }

                let Some(wq) = fut_map.remove(&u_fut) else {
                    // Deregistering an unknown futex does nothing.
                    return ks.dual_ret(FosError::Success);
                };

                ks.wake_all(&wq, FosError::StateMismatch);
                ks.dual_ret(FosError::Success)
            }

            // Park the caller while *args[0] == args[1].
            PLG_FUT_PCID_WAIT => {
                let u_fut = args[0];
                let exp_val = args[1];

                if u_fut == 0 {
                    return ks.dual_ret(FosError::InvalidIndex);
                }
                let Some(wq) = fut_map.get(&u_fut) else {
                    return ks.dual_ret(FosError::InvalidIndex);
                };

                // Registration proved the word readable; failing now
                // means the process unmapped it underneath us.
                let act_val = UserPtr::<u32>::new(u_fut)
                    .read(pd)
                    .map_err(|e| e.user_error())?;

                if act_val != exp_val {
                    return ks.dual_ret(FosError::Success);
                }

                let wq = wq.clone();
                ks.block_current(&wq, [0; 6])
            }

            // Wake one (args[1] == 0) or all (non-zero) threads parked on
            // the futex at args[0].
            PLG_FUT_PCID_WAKE => {
                let u_fut = args[0];
                let all = args[1] != 0;

                if u_fut == 0 {
                    return ks.dual_ret(FosError::InvalidIndex);
                }
                let Some(wq) = fut_map.get(&u_fut) else {
                    return ks.dual_ret(FosError::InvalidIndex);
                };
                let wq = wq.clone();

                wq.lock().notify(if all { NotifyMode::All } else { NotifyMode::Next });
                loop {
                    let woken = wq.lock().pop();
                    match woken {
                        Some(gtid) => ks.wake_thread(gtid, FosError::Success),
                        None => break,
                    }
                }

                ks.dual_ret(FosError::Success)
            }

            _ => ks.dual_ret(FosError::BadArgs),
        }
    }

    fn on_fork(&mut self, _ks: &mut KernelState, cpid: Pid) -> OsResult {
        // Futexes are not inherited; the child starts clean.
        if self.fut_maps.contains_key(&cpid) {
            return Err(FosError::StateMismatch);
        }
        self.fut_maps.insert(cpid, FutexMap::new());
        Ok(())
    }

    fn on_reap(&mut self, _ks: &mut KernelState, rpid: Pid) -> OsResult {
        // Every thread of a reaped process detached long ago, so these
        // queues are empty and can simply be dropped.
        match self.fut_maps.remove(&rpid) {
            Some(_) => Ok(()),
            None => Err(FosError::StateMismatch),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::page::PhysAddr;
    use crate::proc::Process;
    use crate::sched::thread::{Gtid, Thread};

    fn setup() -> (KernelState, FutexPlugin, Gtid) {
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

        let plg = FutexPlugin::new(&ks);
        (ks, plg, gtid)
    }

    fn eax(ks: &KernelState, gtid: Gtid) -> u32 {
        ks.thread(gtid).unwrap().ctx.eax
    }

    #[test]
    fn register_rejects_null_and_unmapped_words() {
        let (mut ks, mut plg, gtid) = setup();

        plg.cmd(&mut ks, PLG_FUT_PCID_REGISTER, [0, 0, 0, 0]).unwrap();
        assert_eq!(eax(&ks, gtid), FosError::BadArgs.code());

        // The process has no mapped memory, so the readability probe
        // fails.
        plg.cmd(&mut ks, PLG_FUT_PCID_REGISTER, [0x9000_0000, 0, 0, 0]).unwrap();
        assert_eq!(eax(&ks, gtid), FosError::InvalidIndex.code());
    }

    #[test]
    fn wait_and_wake_on_unknown_futex_are_user_errors() {
        let (mut ks, mut plg, gtid) = setup();

        plg.cmd(&mut ks, PLG_FUT_PCID_WAIT, [0x9000_0000, 1, 0, 0]).unwrap();
        assert_eq!(eax(&ks, gtid), FosError::InvalidIndex.code());

        plg.cmd(&mut ks, PLG_FUT_PCID_WAKE, [0x9000_0000, 0, 0, 0]).unwrap();
        assert_eq!(eax(&ks, gtid), FosError::InvalidIndex.code());
    }

    #[test]
    fn deregister_of_unknown_futex_is_a_no_op() {
        let (mut ks, mut plg, gtid) = setup();
        plg.cmd(&mut ks, PLG_FUT_PCID_DEREGISTER, [0x9000_0000, 0, 0, 0]).unwrap();
        assert_eq!(eax(&ks, gtid), FosError::Success.code());
    }

    #[test]
    fn fork_and_reap_manage_the_per_process_maps() {
        let (mut ks, mut plg, root) = setup();

        let cpid = ks.procs.reserve().unwrap();
        let mut child = Process::new(cpid, Some(root.pid()), PhysAddr::NULL);
        let tid = child.threads.reserve().unwrap();
        child
            .threads
            .set(tid, Thread::new(tid, PhysAddr::NULL, 0x0450_0000, 0, 0, 0));
        ks.procs.set(cpid, child);

        plg.on_fork(&mut ks, cpid).unwrap();

        // A second fork notification for the same pid is corrupt state.
        assert_eq!(plg.on_fork(&mut ks, cpid), Err(FosError::StateMismatch));

        plg.on_reap(&mut ks, cpid).unwrap();
        assert_eq!(plg.on_reap(&mut ks, cpid), Err(FosError::StateMismatch));
    }
}
