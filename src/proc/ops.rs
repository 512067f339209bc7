//! Syscall-style operations on the kernel state.
//!
//! Every function here assumes the current thread is the caller. Argument
//! validation, exhaustion and wrong-state outcomes go to the caller's
//! saved `eax`; a kernel-space `Err` means the machine is in a state we
//! no longer trust and the trap dispatcher shuts it down.

use super::{
    KernelState, Process, ProcExitStatus, SigId, SigVector, FOS_MAX_SIGNALS, FSIG_CHLD, NULL_PID,
    PROC_ES_SIGNAL, PROC_ES_UNSET,
};
use crate::handle::{Handle, NULL_HANDLE};
use crate::memory::page::delete_page_directory;
use crate::memory::space::{copy_page_directory, new_user_app_pd, RawUserApp, UserApp, UserPtr};
use crate::memory::{
    APP_ARGS_AREA_SIZE, APP_ARGS_AREA_START, FOS_MAX_THREADS_PER_PROC, FREE_AREA_END,
    FREE_AREA_START, M_4K,
};
use crate::sched::thread::{Gtid, Pid, Thread, ThreadState, Tid};
use crate::syscall::error::{FosError, OsResult};
use crate::util::is_aligned;
use alloc::boxed::Box;
use alloc::vec::Vec;

/// Result of a successful `join_local_thread`, written to user space.
#[derive(Clone, Copy)]
#[repr(C)]
pub struct ThreadJoinRet {
    pub joined: Tid,
    pub retval: u32,
}

impl KernelState {
    // ──────────────────────────────────────────────────────────
    //  fork / exit / reap / exec
    // ──────────────────────────────────────────────────────────

    /// Fork the current process. Only the calling thread crosses into the
    /// child; futexes and join state do not. The parent reads the child
    /// pid through `u_cpid`; the child reads `FOS_MAX_PROCS` there.
    pub fn fork_proc(&mut self, u_cpid: UserPtr<u32>) -> OsResult {
        let gtid = self.curr_gtid().ok_or(FosError::StateMismatch)?;
        let parent_pid = gtid.pid();
        let parent_pd = self.curr_pd().ok_or(FosError::StateMismatch)?;

        let Some(child_pid) = self.procs.reserve() else {
            return self.dual_ret(FosError::NoMem);
        };

        let child_pd = match copy_page_directory(parent_pd) {
            Ok(pd) => pd,
            Err(e) => {
                self.procs.release(child_pid);
                return self.dual_ret(e);
            }
        };

        // The child must find the sentinel in its copy of *u_cpid; stamp
        // it before the child can ever run.
        if !u_cpid.is_null() && u_cpid.write(child_pd, &NULL_PID).is_err() {
            delete_page_directory(child_pd);
            self.procs.release(child_pid);
            return self.dual_ret(FosError::NoMem);
        }

        // Clone every occupied handle at the same id. One failure unwinds
        // them all and the child never comes to life.
        let parent_handle_ids: Vec<Handle> = self
            .proc(parent_pid)
            .ok_or(FosError::StateMismatch)?
            .handles
            .ids()
            .collect();

        let mut clones: Vec<(Handle, Box<dyn crate::handle::HandleState>)> = Vec::new();
        let mut clone_err = None;

        for h in parent_handle_ids {
            let cloned = self
                .proc(parent_pid)
                .ok_or(FosError::StateMismatch)?
                .handles
                .get(h)
                .ok_or(FosError::StateMismatch)?
                .clone_for(child_pid);

            match cloned {
                Ok(hs) => clones.push((h, hs)),
                Err(e) => {
                    clone_err = Some(e);
                    break;
                }
            }
        }

        if let Some(e) = clone_err {
            for (_, hs) in clones {
                // Failing to unwind a fresh clone is not survivable.
                hs.close(self)?;
            }
            delete_page_directory(child_pd);
            self.procs.release(child_pid);
            return self.dual_ret(e);
        }

        let mut child = Process::new(child_pid, Some(parent_pid), child_pd);
        for (h, hs) in clones {
            child.handles.occupy(h, hs);
        }

        {
            let parent = self.proc(parent_pid).ok_or(FosError::StateMismatch)?;
            child.in_handle = parent.in_handle;
            child.out_handle = parent.out_handle;
            child.sig_allow = parent.sig_allow;
        }

        // The one thread that crosses: the caller, context and all. Both
        // sides resume with SUCCESS in eax; they tell each other apart by
        // what lands in *u_cpid.
        let calling = self.thread(gtid).ok_or(FosError::StateMismatch)?;
        let mut child_thr = calling.copy_for(child_pd);
        child_thr.ctx.eax = FosError::Success.code();

        let child_tid = child_thr.tid;
        child.main_tid = child_tid;
        child.threads.occupy(child_tid, child_thr);

        self.procs.set(child_pid, child);
        self.proc_mut(parent_pid)
            .ok_or(FosError::StateMismatch)?
            .children
            .insert(child_pid);

        self.schedule_thread(Gtid::new(child_pid, child_tid));

        self.plugins_on_fork(child_pid)?;

        if !u_cpid.is_null() && u_cpid.write(parent_pd, &child_pid).is_err() {
            return self.dual_ret(FosError::NoMem);
        }

        self.dual_ret(FosError::Success)
    }

    /// Exit the current process with `status`.
    pub fn exit_proc(&mut self, status: ProcExitStatus) -> OsResult {
        let pid = self.curr_pid().ok_or(FosError::StateMismatch)?;
        self.exit_process(pid, status)
    }

    /// Turn `pid` into a zombie: detach its threads, close its
    /// non-default handles, hand its children (and zombies) to root, and
    /// raise `FSIG_CHLD` where due. Exiting the root shuts the system
    /// down.
    pub fn exit_process(&mut self, pid: Pid, status: ProcExitStatus) -> OsResult {
        if pid == self.root_pid {
            crate::log_info!("root process exited with status {:#x}", status);
            crate::syscall::shutdown(self);
        }

        let root_pid = self.root_pid;

        let (tids, parent, children, zombies) = {
            let proc = self.proc_mut(pid).ok_or(FosError::StateMismatch)?;
            proc.exited = true;
            proc.exit_status = status;

            let tids: Vec<Tid> = proc.threads.ids().collect();
            let parent = proc.parent;
            let children = core::mem::take(&mut proc.children);
            let zombies = core::mem::take(&mut proc.zombies);
            (tids, parent, children, zombies)
        };

        for tid in tids {
            self.detach_thread(Gtid::new(pid, tid));
        }

        // Close every handle except the default in/out pair, which stays
        // until the reap.
        let (in_h, out_h) = {
            let proc = self.proc(pid).ok_or(FosError::StateMismatch)?;
            (proc.in_handle, proc.out_handle)
        };
        let handle_ids: Vec<Handle> = self
            .proc(pid)
            .ok_or(FosError::StateMismatch)?
            .handles
            .ids()
            .collect();
        for h in handle_ids {
            if h == in_h || h == out_h {
                continue;
            }
            if let Some(hs) = self.take_handle(pid, h) {
                self.release_handle_id(pid, h);
                hs.close(self)?;
            }
        }

        // Orphans go to root, living and dead alike.
        let mut root_gets_chld = false;
        for child in children {
            if let Some(c) = self.proc_mut(child) {
                c.parent = Some(root_pid);
            }
            if let Some(root) = self.proc_mut(root_pid) {
                root.children.insert(child);
            }
        }
        for zombie in zombies {
            if let Some(z) = self.proc_mut(zombie) {
                z.parent = Some(root_pid);
            }
            if let Some(root) = self.proc_mut(root_pid) {
                root.zombies.insert(zombie);
                root_gets_chld = true;
            }
        }

        if let Some(parent_pid) = parent {
            if let Some(parent) = self.proc_mut(parent_pid) {
                parent.children.remove(&pid);
                parent.zombies.insert(pid);
            }
            self.deliver_signal(parent_pid, FSIG_CHLD)?;
        }

        if root_gets_chld {
            self.deliver_signal(root_pid, FSIG_CHLD)?;
        }

        Ok(())
    }

    /// Reap a zombie child. `cpid == FOS_MAX_PROCS` takes any zombie
    /// child. `u_rcpid`/`u_rces` receive the reaped pid and exit status;
    /// on user error they receive `FOS_MAX_PROCS`/`PROC_ES_UNSET`.
    ///
    /// The `FSIG_CHLD` pending bit is untouched: a set bit does not
    /// promise a reapable child, and `signal_clear` exists for cleanup.
    pub fn reap_proc(
        &mut self,
        cpid: Pid,
        u_rcpid: UserPtr<u32>,
        u_rces: UserPtr<u32>,
    ) -> OsResult {
        let pid = self.curr_pid().ok_or(FosError::StateMismatch)?;
        let pd = self.curr_pd().ok_or(FosError::StateMismatch)?;

        let target = {
            let proc = self.proc(pid).ok_or(FosError::StateMismatch)?;

            let found = if cpid == NULL_PID {
                proc.zombies.iter().next().copied().ok_or(FosError::Empty)
            } else if proc.zombies.contains(&cpid) {
                Ok(cpid)
            } else if proc.children.contains(&cpid) {
                Err(FosError::Empty) // still alive
            } else {
                Err(FosError::StateMismatch)
            };

            match found {
                Ok(t) => t,
                Err(code) => {
                    if !u_rcpid.is_null() {
                        let _ = u_rcpid.write(pd, &NULL_PID);
                    }
                    if !u_rces.is_null() {
                        let _ = u_rces.write(pd, &PROC_ES_UNSET);
                    }
                    return self.dual_ret(code);
                }
            }
        };

        // Plugins see the process while it still exists.
        self.plugins_on_reap(target)?;

        let status = self.proc(target).ok_or(FosError::StateMismatch)?.exit_status;

        self.destroy_process(target)?;
        self.proc_mut(pid)
            .ok_or(FosError::StateMismatch)?
            .zombies
            .remove(&target);

        if !u_rcpid.is_null() && u_rcpid.write(pd, &target).is_err() {
            return self.dual_ret(FosError::NoMem);
        }
        if !u_rces.is_null() && u_rces.write(pd, &status).is_err() {
            return self.dual_ret(FosError::NoMem);
        }

        self.dual_ret(FosError::Success)
    }

    /// Free every remaining resource of a zombie and recycle its pid.
    fn destroy_process(&mut self, pid: Pid) -> OsResult {
        // Whatever handles exit left open (the defaults).
        let handle_ids: Vec<Handle> = self
            .proc(pid)
            .ok_or(FosError::StateMismatch)?
            .handles
            .ids()
            .collect();
        for h in handle_ids {
            if let Some(hs) = self.take_handle(pid, h) {
                self.release_handle_id(pid, h);
                hs.close(self)?;
            }
        }

        let proc = self.procs.remove(pid).ok_or(FosError::StateMismatch)?;
        delete_page_directory(proc.pd);
        Ok(())
    }

    /// Replace the current process's image with `u_ua`, handing it
    /// `u_args` as its absolute args block. Does not return to the old
    /// image on success.
    pub fn exec(&mut self, u_ua: UserPtr<RawUserApp>, u_args: u32, args_len: usize) -> OsResult {
        let gtid = self.curr_gtid().ok_or(FosError::StateMismatch)?;
        let pid = gtid.pid();
        let old_pd = self.curr_pd().ok_or(FosError::StateMismatch)?;
        let root_pid = self.root_pid;

        if u_ua.is_null() || args_len > APP_ARGS_AREA_SIZE as usize {
            return self.dual_ret(FosError::BadArgs);
        }

        let ua = match UserApp::copy_from_user(old_pd, u_ua) {
            Ok(ua) => ua,
            Err(e) => return self.dual_ret(e),
        };

        let mut args = Vec::new();
        if args_len > 0 {
            args.resize(args_len, 0u8);
            if let Err(e) = crate::memory::space::copy_from_user(old_pd, u_args, &mut args) {
                return self.dual_ret(e.user_error());
            }
        }

        // Build the replacement space first. Failure here leaves the
        // calling process fully intact.
        let new_pd = match new_user_app_pd(&ua, &args) {
            Ok(pd) => pd,
            Err(e) => return self.dual_ret(e),
        };

        // Point of no return.

        let (in_h, out_h, main_tid) = {
            let proc = self.proc(pid).ok_or(FosError::StateMismatch)?;
            (proc.in_handle, proc.out_handle, proc.main_tid)
        };

        let handle_ids: Vec<Handle> = self
            .proc(pid)
            .ok_or(FosError::StateMismatch)?
            .handles
            .ids()
            .collect();
        for h in handle_ids {
            if h == in_h || h == out_h {
                continue;
            }
            if let Some(hs) = self.take_handle(pid, h) {
                self.release_handle_id(pid, h);
                hs.close(self)?;
            }
        }

        // Every thread but main dies here; main is rebuilt below.
        let tids: Vec<Tid> = self
            .proc(pid)
            .ok_or(FosError::StateMismatch)?
            .threads
            .ids()
            .collect();
        for tid in tids {
            self.detach_thread(Gtid::new(pid, tid));
            if tid != main_tid {
                self.proc_mut(pid)
                    .ok_or(FosError::StateMismatch)?
                    .threads
                    .remove(tid);
            }
        }

        // Living children are root's problem now; zombies of the old
        // image become orphan zombies for root to reap.
        let (children, zombies) = {
            let proc = self.proc_mut(pid).ok_or(FosError::StateMismatch)?;
            (
                core::mem::take(&mut proc.children),
                core::mem::take(&mut proc.zombies),
            )
        };
        let mut root_gets_chld = false;
        for child in children {
            if let Some(c) = self.proc_mut(child) {
                c.parent = Some(root_pid);
            }
            if let Some(root) = self.proc_mut(root_pid) {
                root.children.insert(child);
            }
        }
        for zombie in zombies {
            if let Some(z) = self.proc_mut(zombie) {
                z.parent = Some(root_pid);
            }
            if let Some(root) = self.proc_mut(root_pid) {
                root.zombies.insert(zombie);
                root_gets_chld = true;
            }
        }
        if root_gets_chld {
            self.deliver_signal(root_pid, FSIG_CHLD)?;
        }

        delete_page_directory(old_pd);

        let args_ptr = if args_len > 0 { APP_ARGS_AREA_START } else { 0 };
        let main_thr = Thread::new(main_tid, new_pd, ua.entry, args_ptr, args_len as u32, 0);

        {
            let proc = self.proc_mut(pid).ok_or(FosError::StateMismatch)?;
            proc.pd = new_pd;
            proc.threads.set(main_tid, main_thr);
        }

        self.schedule_thread(Gtid::new(pid, main_tid));
        Ok(())
    }

    // ──────────────────────────────────────────────────────────
    //  Signals
    // ──────────────────────────────────────────────────────────

    /// Send signal `sid` to `pid` (or to the parent when
    /// `pid == FOS_MAX_PROCS`).
    pub fn signal(&mut self, pid: Pid, sid: SigId) -> OsResult {
        if sid >= FOS_MAX_SIGNALS {
            return self.dual_ret(FosError::BadArgs);
        }

        let target = if pid == NULL_PID {
            let me = self.curr_pid().ok_or(FosError::StateMismatch)?;
            match self.proc(me).and_then(|p| p.parent) {
                Some(parent) => parent,
                None => return self.dual_ret(FosError::InvalidIndex),
            }
        } else {
            pid
        };

        if self.proc(target).is_none() {
            return self.dual_ret(FosError::InvalidIndex);
        }

        self.deliver_signal(target, sid)?;
        self.dual_ret(FosError::Success)
    }

    /// Core delivery: set the pending bit, force-exit on a disallowed
    /// signal, otherwise hand the bit to the first overlapping waiter.
    /// A bit that is already pending makes this a no-op.
    pub fn deliver_signal(&mut self, pid: Pid, sid: SigId) -> OsResult {
        let bit: SigVector = 1 << sid;

        let (exited, allowed, pd, signal_q) = match self.proc(pid) {
            Some(proc) => (
                proc.exited,
                proc.sig_allow & bit != 0,
                proc.pd,
                proc.signal_q.clone(),
            ),
            None => return Ok(()),
        };

        if exited {
            // Zombies have no use for signals.
            return Ok(());
        }

        if !allowed {
            return self.exit_process(pid, PROC_ES_SIGNAL);
        }

        self.proc_mut(pid).ok_or(FosError::StateMismatch)?.sig_pending |= bit;

        // Wait-queue edits stay a critical section even when delivery is
        // triggered from inside a trap.
        crate::arch::without_interrupts(|| -> OsResult {
            // First waiter with an overlapping mask consumes the bit.
            let waiter = {
                let q = signal_q.lock();
                q.first_matching(|gtid| {
                    self.thread(gtid)
                        .map(|t| t.wait_ctx[0] & bit != 0)
                        .unwrap_or(false)
                })
            };

            let Some(gtid) = waiter else {
                return Ok(());
            };

            signal_q.lock().remove(gtid);

            let u_sid = {
                let thr = self.thread_mut(gtid).ok_or(FosError::StateMismatch)?;
                thr.wq = None;
                let u_sid = thr.wait_ctx[1];
                thr.wait_ctx = [0; 6];
                thr.state = ThreadState::Detached;
                thr.ctx.eax = FosError::Success.code();
                u_sid
            };

            if u_sid != 0 {
                let _ = UserPtr::<u32>::new(u_sid).write(pd, &sid);
            }

            self.proc_mut(pid).ok_or(FosError::StateMismatch)?.sig_pending &= !bit;

            self.schedule_thread(gtid);
            Ok(())
        })
    }

    /// Swap the allow vector, returning the old one to the caller. If a
    /// pending bit falls outside the new vector the process exits as if
    /// that signal had just arrived un-allowed.
    pub fn allow_signal(&mut self, sv: SigVector) -> OsResult {
        let pid = self.curr_pid().ok_or(FosError::StateMismatch)?;

        let (old, pending) = {
            let proc = self.proc_mut(pid).ok_or(FosError::StateMismatch)?;
            let old = proc.sig_allow;
            proc.sig_allow = sv;
            (old, proc.sig_pending)
        };

        self.set_user_ret_val(old);

        if pending & !sv != 0 {
            return self.exit_process(pid, PROC_ES_SIGNAL);
        }

        Ok(())
    }

    /// Wait for any signal in `sv`. A matching pending bit is consumed
    /// immediately (lowest first); otherwise the thread parks in the
    /// signal queue.
    pub fn wait_signal(&mut self, sv: SigVector, u_sid: UserPtr<u32>) -> OsResult {
        let pid = self.curr_pid().ok_or(FosError::StateMismatch)?;
        let pd = self.curr_pd().ok_or(FosError::StateMismatch)?;

        if sv == 0 {
            if !u_sid.is_null() {
                let _ = u_sid.write(pd, &FOS_MAX_SIGNALS);
            }
            return self.dual_ret(FosError::BadArgs);
        }

        let pending = self.proc(pid).ok_or(FosError::StateMismatch)?.sig_pending;
        let matching = pending & sv;

        if matching != 0 {
            let sid = matching.trailing_zeros();
            self.proc_mut(pid).ok_or(FosError::StateMismatch)?.sig_pending &= !(1 << sid);

            if !u_sid.is_null() && u_sid.write(pd, &sid).is_err() {
                return self.dual_ret(FosError::NoMem);
            }
            return self.dual_ret(FosError::Success);
        }

        let signal_q = self.proc(pid).ok_or(FosError::StateMismatch)?.signal_q.clone();
        self.block_current(&signal_q, [sv, u_sid.addr(), 0, 0, 0, 0])
    }

    /// Clear every pending bit named in `sv`.
    pub fn signal_clear(&mut self, sv: SigVector) -> OsResult {
        let pid = self.curr_pid().ok_or(FosError::StateMismatch)?;
        self.proc_mut(pid).ok_or(FosError::StateMismatch)?.sig_pending &= !sv;
        self.dual_ret(FosError::Success)
    }

    // ──────────────────────────────────────────────────────────
    //  User memory
    // ──────────────────────────────────────────────────────────

    /// Map `[s, e)` in the process free area. The final mapped boundary
    /// goes to `*u_true_e` whether or not the whole request fit.
    pub fn request_mem(&mut self, s: u32, e: u32, u_true_e: UserPtr<u32>) -> OsResult {
        let pd = self.curr_pd().ok_or(FosError::StateMismatch)?;

        if u_true_e.is_null() {
            return self.dual_ret(FosError::BadArgs);
        }
        if !is_aligned(s, M_4K) || !is_aligned(e, M_4K) {
            return self.dual_ret(FosError::AlignError);
        }
        if e < s || s < FREE_AREA_START || e > FREE_AREA_END {
            return self.dual_ret(FosError::InvalidRange);
        }

        let (true_e, res) = crate::memory::space::alloc_pages(pd, true, s, e, false);

        if u_true_e.write(pd, &true_e).is_err() {
            return self.dual_ret(FosError::NoMem);
        }

        match res {
            Ok(()) => self.dual_ret(FosError::Success),
            Err(code) => self.dual_ret(code),
        }
    }

    /// Unmap `[s, e)` from the process free area. Silently ignores bad
    /// ranges; reports nothing.
    pub fn return_mem(&mut self, s: u32, e: u32) -> OsResult {
        let pd = self.curr_pd().ok_or(FosError::StateMismatch)?;

        if is_aligned(s, M_4K)
            && is_aligned(e, M_4K)
            && s <= e
            && s >= FREE_AREA_START
            && e <= FREE_AREA_END
        {
            crate::memory::space::free_pages(pd, s, e);
        }

        self.dual_ret(FosError::Success)
    }

    // ──────────────────────────────────────────────────────────
    //  Threads
    // ──────────────────────────────────────────────────────────

    /// Park the current thread in the sleep queue for `ticks` ticks.
    pub fn sleep_thread(&mut self, ticks: u32) -> OsResult {
        let deadline = self.curr_tick.wrapping_add(ticks);
        let sleep_q = self.sleep_q.clone();
        self.block_current_timed(&sleep_q, deadline)
    }

    /// Spawn a thread in the current process, entering at `entry` with
    /// `arg`. The new tid is written to `*u_tid` when given.
    pub fn spawn_local_thread(&mut self, u_tid: UserPtr<u32>, entry: u32, arg: u32) -> OsResult {
        let pid = self.curr_pid().ok_or(FosError::StateMismatch)?;
        let pd = self.curr_pd().ok_or(FosError::StateMismatch)?;

        if entry == 0 {
            return self.dual_ret(FosError::BadArgs);
        }

        let tid = {
            let proc = self.proc_mut(pid).ok_or(FosError::StateMismatch)?;
            match proc.threads.reserve() {
                Some(tid) => tid,
                None => return self.dual_ret(FosError::NoMem),
            }
        };

        let thr = Thread::new(tid, pd, entry, arg, 0, 0);
        self.proc_mut(pid).ok_or(FosError::StateMismatch)?.threads.set(tid, thr);
        self.schedule_thread(Gtid::new(pid, tid));

        if !u_tid.is_null() && u_tid.write(pd, &tid).is_err() {
            return self.dual_ret(FosError::NoMem);
        }

        self.dual_ret(FosError::Success)
    }

    /// Exit the current thread with `ret_val`. Exiting the main thread
    /// exits the process.
    pub fn exit_thread(&mut self, ret_val: u32) -> OsResult {
        let gtid = self.curr_gtid().ok_or(FosError::StateMismatch)?;
        let pid = gtid.pid();
        let tid = gtid.tid();

        let main_tid = self.proc(pid).ok_or(FosError::StateMismatch)?.main_tid;
        if tid == main_tid {
            return self.exit_process(pid, ret_val);
        }

        self.detach_thread(gtid);
        {
            let thr = self.thread_mut(gtid).ok_or(FosError::StateMismatch)?;
            thr.state = ThreadState::Exited;
            thr.exit_ret_val = ret_val;
        }

        // Somebody may already be joined on this tid.
        let join_q = self.proc(pid).ok_or(FosError::StateMismatch)?.join_q.clone();
        let bit = 1u32 << tid;

        let waiter = {
            let q = join_q.lock();
            q.first_matching(|g| {
                self.thread(g).map(|t| t.wait_ctx[0] & bit != 0).unwrap_or(false)
            })
        };

        if let Some(waiter_gtid) = waiter {
            join_q.lock().remove(waiter_gtid);
            self.complete_join(waiter_gtid, gtid, ret_val)?;
        }

        Ok(())
    }

    /// Join on the thread set described by `jv`. If a matching thread has
    /// already exited it is consumed immediately; otherwise the caller
    /// parks in the join queue.
    pub fn join_local_thread(&mut self, jv: u32, u_join_ret: UserPtr<ThreadJoinRet>) -> OsResult {
        let gtid = self.curr_gtid().ok_or(FosError::StateMismatch)?;
        let pid = gtid.pid();

        // A thread cannot join itself, and the vector must stay inside
        // the thread table.
        let self_bit = 1u32 << gtid.tid();
        if jv == 0
            || jv & self_bit != 0
            || (FOS_MAX_THREADS_PER_PROC < 32 && jv >> FOS_MAX_THREADS_PER_PROC != 0)
        {
            return self.dual_ret(FosError::BadArgs);
        }

        let exited = {
            let proc = self.proc(pid).ok_or(FosError::StateMismatch)?;
            proc.threads
                .ids()
                .filter(|&tid| jv & (1 << tid) != 0)
                .find(|&tid| {
                    proc.threads
                        .get(tid)
                        .map(|t| t.state == ThreadState::Exited)
                        .unwrap_or(false)
                })
        };

        if let Some(tid) = exited {
            let ret_val = self
                .proc(pid)
                .ok_or(FosError::StateMismatch)?
                .threads
                .get(tid)
                .ok_or(FosError::StateMismatch)?
                .exit_ret_val;

            let pd = self.curr_pd().ok_or(FosError::StateMismatch)?;
            self.proc_mut(pid).ok_or(FosError::StateMismatch)?.threads.remove(tid);

            if !u_join_ret.is_null() {
                let ret = ThreadJoinRet { joined: tid, retval: ret_val };
                if u_join_ret.write(pd, &ret).is_err() {
                    return self.dual_ret(FosError::NoMem);
                }
            }
            return self.dual_ret(FosError::Success);
        }

        let join_q = self.proc(pid).ok_or(FosError::StateMismatch)?.join_q.clone();
        self.block_current(&join_q, [jv, u_join_ret.addr(), 0, 0, 0, 0])
    }

    /// Wake `waiter` with the result of joining `exited`, and destroy the
    /// exited thread.
    fn complete_join(&mut self, waiter: Gtid, exited: Gtid, ret_val: u32) -> OsResult {
        let pid = exited.pid();
        let pd = self.proc(pid).ok_or(FosError::StateMismatch)?.pd;

        let u_join_ret = {
            let thr = self.thread_mut(waiter).ok_or(FosError::StateMismatch)?;
            thr.wq = None;
            let ptr = thr.wait_ctx[1];
            thr.wait_ctx = [0; 6];
            thr.state = ThreadState::Detached;
            thr.ctx.eax = FosError::Success.code();
            ptr
        };

        self.proc_mut(pid)
            .ok_or(FosError::StateMismatch)?
            .threads
            .remove(exited.tid());

        if u_join_ret != 0 {
            let ret = ThreadJoinRet { joined: exited.tid(), retval: ret_val };
            let _ = UserPtr::<ThreadJoinRet>::new(u_join_ret).write(pd, &ret);
        }

        self.schedule_thread(waiter);
        Ok(())
    }

    // ──────────────────────────────────────────────────────────
    //  Default in/out handles
    // ──────────────────────────────────────────────────────────

    /// Point the default input handle at `h` (or at nothing when `h` is
    /// not an occupied handle). Never fails.
    pub fn set_in_handle(&mut self, h: Handle) -> OsResult {
        let pid = self.curr_pid().ok_or(FosError::StateMismatch)?;
        let proc = self.proc_mut(pid).ok_or(FosError::StateMismatch)?;
        proc.in_handle = if proc.handles.contains(h) { h } else { NULL_HANDLE };
        self.dual_ret(FosError::Success)
    }

    pub fn set_out_handle(&mut self, h: Handle) -> OsResult {
        let pid = self.curr_pid().ok_or(FosError::StateMismatch)?;
        let proc = self.proc_mut(pid).ok_or(FosError::StateMismatch)?;
        proc.out_handle = if proc.handles.contains(h) { h } else { NULL_HANDLE };
        self.dual_ret(FosError::Success)
    }

    /// Read through the default input handle. `EMPTY` when none is set.
    pub fn in_read(&mut self, u_dst: u32, len: usize, u_readden: u32) -> OsResult {
        let pid = self.curr_pid().ok_or(FosError::StateMismatch)?;
        let h = self.proc(pid).ok_or(FosError::StateMismatch)?.in_handle;
        if h == NULL_HANDLE {
            return self.dual_ret(FosError::Empty);
        }
        crate::handle::dispatch_handle_cmd(
            self,
            h,
            crate::handle::HCID_READ,
            [u_dst, len as u32, u_readden, 0],
        )
    }

    /// Block until the default input handle is read-ready.
    pub fn in_wait(&mut self) -> OsResult {
        let pid = self.curr_pid().ok_or(FosError::StateMismatch)?;
        let h = self.proc(pid).ok_or(FosError::StateMismatch)?.in_handle;
        if h == NULL_HANDLE {
            return self.dual_ret(FosError::Empty);
        }
        crate::handle::dispatch_handle_cmd(self, h, crate::handle::HCID_WAIT_READ_READY, [0; 4])
    }

    /// Write through the default output handle. With none set, the bytes
    /// vanish successfully.
    pub fn out_write(&mut self, u_src: u32, len: usize, u_written: u32) -> OsResult {
        let pid = self.curr_pid().ok_or(FosError::StateMismatch)?;
        let pd = self.curr_pd().ok_or(FosError::StateMismatch)?;
        let h = self.proc(pid).ok_or(FosError::StateMismatch)?.out_handle;

        if h == NULL_HANDLE {
            if u_written != 0 {
                let _ = UserPtr::<u32>::new(u_written).write(pd, &(len as u32));
            }
            return self.dual_ret(FosError::Success);
        }
        crate::handle::dispatch_handle_cmd(
            self,
            h,
            crate::handle::HCID_WRITE,
            [u_src, len as u32, u_written, 0],
        )
    }

    /// Block until the default output handle is write-ready.
    pub fn out_wait(&mut self) -> OsResult {
        let pid = self.curr_pid().ok_or(FosError::StateMismatch)?;
        let h = self.proc(pid).ok_or(FosError::StateMismatch)?.out_handle;
        if h == NULL_HANDLE {
            return self.dual_ret(FosError::Success);
        }
        crate::handle::dispatch_handle_cmd(self, h, crate::handle::HCID_WAIT_WRITE_READY, [0; 4])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::page::PhysAddr;
    use crate::plugin::Plugin;
    use crate::proc::PROC_ES_SUCCESS;
    use alloc::sync::Arc;
    use spin::Mutex;

    const ENTRY: u32 = crate::memory::APP_AREA_START + 0x100;

    /// Null user pointer; the ops skip the cross-space write for it.
    fn nullp<T: Copy>() -> UserPtr<T> {
        UserPtr::new(0)
    }

    /// A kernel state with a root process holding one scheduled thread.
    /// Processes get a null page directory, so nothing here may touch
    /// user memory or real paging.
    fn boot_ks() -> (KernelState, Gtid) {
        let mut ks = KernelState::new();

        let pid = ks.procs.reserve().unwrap();
        let mut root = Process::new(pid, None, PhysAddr::NULL);
        let tid = root.threads.reserve().unwrap();
        root.threads.set(tid, Thread::new(tid, PhysAddr::NULL, ENTRY, 0, 0, 0));
        root.main_tid = tid;
        ks.procs.set(pid, root);
        ks.root_pid = pid;

        let gtid = Gtid::new(pid, tid);
        ks.schedule_thread(gtid);
        (ks, gtid)
    }

    /// Hang a child process with one thread off `parent`.
    fn spawn_child(ks: &mut KernelState, parent: Pid) -> Gtid {
        let pid = ks.procs.reserve().unwrap();
        let mut child = Process::new(pid, Some(parent), PhysAddr::NULL);
        let tid = child.threads.reserve().unwrap();
        child.threads.set(tid, Thread::new(tid, PhysAddr::NULL, ENTRY, 0, 0, 0));
        child.main_tid = tid;
        ks.procs.set(pid, child);
        ks.proc_mut(parent).unwrap().children.insert(pid);

        let gtid = Gtid::new(pid, tid);
        ks.schedule_thread(gtid);
        gtid
    }

    /// Rotate the ring until `gtid` is the current thread.
    fn make_current(ks: &mut KernelState, gtid: Gtid) {
        for _ in 0..ks.schedule.len() {
            if ks.curr_gtid() == Some(gtid) {
                return;
            }
            ks.schedule.advance();
        }
        panic!("thread not schedulable");
    }

    fn eax(ks: &KernelState, gtid: Gtid) -> u32 {
        ks.thread(gtid).unwrap().ctx.eax
    }

    fn state(ks: &KernelState, gtid: Gtid) -> ThreadState {
        ks.thread(gtid).unwrap().state
    }

    // ── sleep and the tick ───────────────────────────────────

    #[test]
    fn sleep_until_deadline() {
        let (mut ks, root) = boot_ks();

        ks.sleep_thread(3).unwrap();
        assert_eq!(state(&ks, root), ThreadState::Waiting);
        assert!(!ks.schedule.contains(root));

        ks.tick().unwrap(); // tick 1
        ks.tick().unwrap(); // tick 2
        assert_eq!(state(&ks, root), ThreadState::Waiting);

        ks.tick().unwrap(); // tick 3: deadline reached
        assert_eq!(state(&ks, root), ThreadState::Scheduled);
        assert!(ks.schedule.contains(root));
        assert_eq!(eax(&ks, root), FosError::Success.code());
    }

    #[test]
    fn tick_rotates_the_ring() {
        let (mut ks, root) = boot_ks();
        let child = spawn_child(&mut ks, root.pid());

        assert_eq!(ks.curr_gtid(), Some(root));
        ks.tick().unwrap();
        assert_eq!(ks.curr_gtid(), Some(child));
        ks.tick().unwrap();
        assert_eq!(ks.curr_gtid(), Some(root));
    }

    #[test]
    fn misbehaving_plugin_is_dropped_on_tick() {
        struct FaultyPlugin {
            calls: Arc<Mutex<u32>>,
        }
        impl Plugin for FaultyPlugin {
            fn tick(&mut self, _ks: &mut KernelState) -> OsResult {
                *self.calls.lock() += 1;
                Err(FosError::BadArgs)
            }
        }

        let (mut ks, _root) = boot_ks();
        let calls = Arc::new(Mutex::new(0));
        ks.set_plugin(0, Box::new(FaultyPlugin { calls: calls.clone() })).unwrap();

        ks.tick().unwrap();
        assert_eq!(*calls.lock(), 1);
        assert!(ks.plugins[0].is_none());

        // Gone for good: the next tick has nobody to call.
        ks.tick().unwrap();
        assert_eq!(*calls.lock(), 1);
    }

    // ── signals ──────────────────────────────────────────────

    #[test]
    fn wait_signal_consumes_pending_bit() {
        let (mut ks, root) = boot_ks();
        let pid = root.pid();

        ks.proc_mut(pid).unwrap().sig_allow = 0b110;
        ks.proc_mut(pid).unwrap().sig_pending = 0b100;

        ks.wait_signal(0b100, nullp()).unwrap();
        assert_eq!(eax(&ks, root), FosError::Success.code());
        assert_eq!(ks.proc(pid).unwrap().sig_pending, 0);
        // Never blocked.
        assert_eq!(state(&ks, root), ThreadState::Scheduled);
    }

    #[test]
    fn wait_signal_blocks_until_delivery() {
        let (mut ks, root) = boot_ks();
        let pid = root.pid();
        ks.proc_mut(pid).unwrap().sig_allow = 0b10;

        ks.wait_signal(0b10, nullp()).unwrap();
        assert_eq!(state(&ks, root), ThreadState::Waiting);

        ks.deliver_signal(pid, 1).unwrap();
        assert_eq!(state(&ks, root), ThreadState::Scheduled);
        assert_eq!(eax(&ks, root), FosError::Success.code());
        // The waiter consumed the bit.
        assert_eq!(ks.proc(pid).unwrap().sig_pending, 0);
    }

    #[test]
    fn unallowed_signal_force_exits() {
        let (mut ks, root) = boot_ks();
        let child = spawn_child(&mut ks, root.pid());
        let cpid = child.pid();

        // Child does not allow bit 4 (the default vector only covers
        // FSIG_CHLD).
        make_current(&mut ks, root);
        ks.signal(cpid, 4).unwrap();

        let proc = ks.proc(cpid).unwrap();
        assert!(proc.exited);
        assert_eq!(proc.exit_status, PROC_ES_SIGNAL);
        assert!(!ks.schedule.contains(child));

        // Parent sees the zombie and the FSIG_CHLD bit.
        let parent = ks.proc(root.pid()).unwrap();
        assert!(parent.zombies.contains(&cpid));
        assert_eq!(parent.sig_pending & (1 << FSIG_CHLD), 1 << FSIG_CHLD);
    }

    #[test]
    fn signal_to_missing_process_is_a_user_error() {
        let (mut ks, root) = boot_ks();
        ks.signal(42, 1).unwrap();
        assert_eq!(eax(&ks, root), FosError::InvalidIndex.code());
    }

    #[test]
    fn pending_bit_is_idempotent() {
        let (mut ks, root) = boot_ks();
        let pid = root.pid();
        ks.proc_mut(pid).unwrap().sig_allow = 0b10;

        ks.deliver_signal(pid, 1).unwrap();
        ks.deliver_signal(pid, 1).unwrap();
        assert_eq!(ks.proc(pid).unwrap().sig_pending, 0b10);
    }

    #[test]
    fn allow_signal_returns_old_vector_and_checks_pending() {
        let (mut ks, root) = boot_ks();
        let child = spawn_child(&mut ks, root.pid());
        let cpid = child.pid();

        make_current(&mut ks, child);
        ks.proc_mut(cpid).unwrap().sig_allow = 0b111;
        ks.proc_mut(cpid).unwrap().sig_pending = 0b100;

        ks.allow_signal(0b101).unwrap();
        assert_eq!(eax(&ks, child), 0b111);
        assert!(!ks.proc(cpid).unwrap().exited);

        // Dropping the still-pending bit from the vector is fatal for
        // the process.
        ks.allow_signal(0b001).unwrap();
        assert!(ks.proc(cpid).unwrap().exited);
        assert_eq!(ks.proc(cpid).unwrap().exit_status, PROC_ES_SIGNAL);
    }

    #[test]
    fn signal_clear_drops_bits() {
        let (mut ks, root) = boot_ks();
        let pid = root.pid();
        ks.proc_mut(pid).unwrap().sig_pending = 0b1011;

        ks.signal_clear(0b0011).unwrap();
        assert_eq!(ks.proc(pid).unwrap().sig_pending, 0b1000);
        assert_eq!(eax(&ks, root), FosError::Success.code());
    }

    // ── exit and reap ────────────────────────────────────────

    #[test]
    fn exit_reparents_children_to_root() {
        let (mut ks, root) = boot_ks();
        let middle = spawn_child(&mut ks, root.pid());
        let grandchild = spawn_child(&mut ks, middle.pid());

        make_current(&mut ks, middle);
        ks.exit_proc(PROC_ES_SUCCESS).unwrap();

        // The middle became a zombie of root; the grandchild is root's
        // living child now.
        let rootp = ks.proc(root.pid()).unwrap();
        assert!(rootp.zombies.contains(&middle.pid()));
        assert!(rootp.children.contains(&grandchild.pid()));
        assert_eq!(ks.proc(grandchild.pid()).unwrap().parent, Some(root.pid()));

        // Its thread fell off the ring.
        assert!(!ks.schedule.contains(middle));
        assert_eq!(state(&ks, middle), ThreadState::Detached);
    }

    #[test]
    fn reap_any_finds_zombies_and_only_zombies() {
        let (mut ks, root) = boot_ks();
        let child = spawn_child(&mut ks, root.pid());
        let cpid = child.pid();

        // Nothing to reap while the child lives.
        make_current(&mut ks, root);
        ks.reap_proc(NULL_PID, nullp(), nullp()).unwrap();
        assert_eq!(eax(&ks, root), FosError::Empty.code());

        make_current(&mut ks, child);
        ks.exit_proc(7).unwrap();

        make_current(&mut ks, root);
        ks.reap_proc(NULL_PID, nullp(), nullp()).unwrap();
        assert_eq!(eax(&ks, root), FosError::Success.code());

        // The pid is gone and free for reuse.
        assert!(ks.proc(cpid).is_none());
        assert!(ks.proc(root.pid()).unwrap().zombies.is_empty());

        // A second reap finds nothing.
        ks.reap_proc(NULL_PID, nullp(), nullp()).unwrap();
        assert_eq!(eax(&ks, root), FosError::Empty.code());
    }

    #[test]
    fn reap_specific_pid_validates_relationship() {
        let (mut ks, root) = boot_ks();
        let child = spawn_child(&mut ks, root.pid());
        let stranger = spawn_child(&mut ks, child.pid());

        make_current(&mut ks, root);

        // Not our child at all.
        ks.reap_proc(stranger.pid(), nullp(), nullp()).unwrap();
        assert_eq!(eax(&ks, root), FosError::StateMismatch.code());

        // Our child, but alive.
        ks.reap_proc(child.pid(), nullp(), nullp()).unwrap();
        assert_eq!(eax(&ks, root), FosError::Empty.code());
    }

    #[test]
    fn reap_runs_plugin_hooks_before_teardown() {
        struct ReapWatcher {
            seen: Arc<Mutex<Option<(Pid, bool)>>>,
        }
        impl Plugin for ReapWatcher {
            fn on_reap(&mut self, ks: &mut KernelState, rpid: Pid) -> OsResult {
                // The process must still exist when the hook runs.
                *self.seen.lock() = Some((rpid, ks.proc(rpid).is_some()));
                Ok(())
            }
        }

        let (mut ks, root) = boot_ks();
        let child = spawn_child(&mut ks, root.pid());
        let seen = Arc::new(Mutex::new(None));
        ks.set_plugin(0, Box::new(ReapWatcher { seen: seen.clone() })).unwrap();

        make_current(&mut ks, child);
        ks.exit_proc(0).unwrap();
        make_current(&mut ks, root);
        ks.reap_proc(child.pid(), nullp(), nullp()).unwrap();

        assert_eq!(*seen.lock(), Some((child.pid(), true)));
        assert!(ks.proc(child.pid()).is_none());
    }

    // ── local threads ────────────────────────────────────────

    #[test]
    fn spawn_fills_the_table_then_reports_exhaustion() {
        let (mut ks, root) = boot_ks();

        // One thread exists; 15 more fit.
        for _ in 0..15 {
            ks.spawn_local_thread(nullp(), ENTRY, 0).unwrap();
            assert_eq!(eax(&ks, root), FosError::Success.code());
        }

        ks.spawn_local_thread(nullp(), ENTRY, 0).unwrap();
        assert_eq!(eax(&ks, root), FosError::NoMem.code());

        // No partial thread was left behind.
        assert_eq!(ks.proc(root.pid()).unwrap().threads.occupied(), 16);
    }

    #[test]
    fn spawn_rejects_null_entry() {
        let (mut ks, root) = boot_ks();
        ks.spawn_local_thread(nullp(), 0, 0).unwrap();
        assert_eq!(eax(&ks, root), FosError::BadArgs.code());
    }

    #[test]
    fn join_picks_up_already_exited_thread() {
        let (mut ks, root) = boot_ks();
        let pid = root.pid();

        ks.spawn_local_thread(nullp(), ENTRY, 0).unwrap();
        let worker_tid = ks
            .proc(pid)
            .unwrap()
            .threads
            .ids()
            .find(|&t| t != root.tid())
            .unwrap();
        let worker = Gtid::new(pid, worker_tid);

        make_current(&mut ks, worker);
        ks.exit_thread(0xBEEF).unwrap();
        assert_eq!(state(&ks, worker), ThreadState::Exited);

        make_current(&mut ks, root);
        ks.join_local_thread(1 << worker_tid, nullp()).unwrap();
        assert_eq!(eax(&ks, root), FosError::Success.code());

        // The exited thread was consumed; its tid is reusable.
        assert!(ks.proc(pid).unwrap().threads.get(worker_tid).is_none());
    }

    #[test]
    fn join_blocks_until_target_exits() {
        let (mut ks, root) = boot_ks();
        let pid = root.pid();

        ks.spawn_local_thread(nullp(), ENTRY, 0).unwrap();
        let worker_tid = ks
            .proc(pid)
            .unwrap()
            .threads
            .ids()
            .find(|&t| t != root.tid())
            .unwrap();
        let worker = Gtid::new(pid, worker_tid);

        make_current(&mut ks, root);
        ks.join_local_thread(1 << worker_tid, nullp()).unwrap();
        assert_eq!(state(&ks, root), ThreadState::Waiting);

        make_current(&mut ks, worker);
        ks.exit_thread(1).unwrap();

        // The joiner woke and the worker is gone.
        assert_eq!(state(&ks, root), ThreadState::Scheduled);
        assert_eq!(eax(&ks, root), FosError::Success.code());
        assert!(ks.proc(pid).unwrap().threads.get(worker_tid).is_none());
    }

    #[test]
    fn join_rejects_self_and_empty_vectors() {
        let (mut ks, root) = boot_ks();

        ks.join_local_thread(0, nullp()).unwrap();
        assert_eq!(eax(&ks, root), FosError::BadArgs.code());

        ks.join_local_thread(1 << root.tid(), nullp()).unwrap();
        assert_eq!(eax(&ks, root), FosError::BadArgs.code());
    }

    #[test]
    fn exiting_main_thread_exits_the_process() {
        let (mut ks, root) = boot_ks();
        let child = spawn_child(&mut ks, root.pid());

        make_current(&mut ks, child);
        ks.exit_thread(PROC_ES_SUCCESS).unwrap();

        assert!(ks.proc(child.pid()).unwrap().exited);
        assert!(ks.proc(root.pid()).unwrap().zombies.contains(&child.pid()));
    }

    // ── default handles ──────────────────────────────────────

    #[test]
    fn default_handles_fall_back_gracefully() {
        let (mut ks, root) = boot_ks();

        // No input handle set: reads report EMPTY.
        ks.in_read(0x1000, 16, 0).unwrap();
        assert_eq!(eax(&ks, root), FosError::Empty.code());
        ks.in_wait().unwrap();
        assert_eq!(eax(&ks, root), FosError::Empty.code());

        // No output handle: writes sink successfully, waits succeed.
        ks.out_wait().unwrap();
        assert_eq!(eax(&ks, root), FosError::Success.code());

        // Selecting a bogus handle resets to "none".
        ks.set_in_handle(3).unwrap();
        assert_eq!(ks.proc(root.pid()).unwrap().in_handle, NULL_HANDLE);
    }

    // ── teardown wakeups ─────────────────────────────────────

    #[test]
    fn wake_all_releases_every_waiter_once() {
        let (mut ks, root) = boot_ks();
        let pid = root.pid();

        for _ in 0..3 {
            ks.spawn_local_thread(nullp(), ENTRY, 0).unwrap();
        }
        let q = crate::sched::wait::BasicWaitQueue::new_shared();

        let tids: Vec<Tid> = ks.proc(pid).unwrap().threads.ids().collect();
        for &tid in tids.iter().filter(|&&t| t != root.tid()) {
            let g = Gtid::new(pid, tid);
            make_current(&mut ks, g);
            ks.block_current(&q, [0; 6]).unwrap();
            assert_eq!(state(&ks, g), ThreadState::Waiting);
        }

        make_current(&mut ks, root);
        ks.wake_all(&q, FosError::StateMismatch);

        for &tid in tids.iter().filter(|&&t| t != root.tid()) {
            let g = Gtid::new(pid, tid);
            assert_eq!(state(&ks, g), ThreadState::Scheduled);
            assert_eq!(eax(&ks, g), FosError::StateMismatch.code());
        }
        assert!(q.lock().is_empty());
    }
}
