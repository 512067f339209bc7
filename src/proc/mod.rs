//! Processes and the kernel state.
//!
//! Structures here are arena-owned: the kernel state maps pids to
//! processes, a process maps tids to threads and handle ids to handle
//! states. The schedule ring and every wait queue refer to threads by
//! gtid only.
//!
//! The syscall-style operations live in `ops.rs`. They all follow the
//! dual-return convention: user-visible outcomes land in the current
//! thread's saved `eax`, the kernel-space `Result` is reserved for state
//! corruption (which shuts the machine down at the trap boundary).

pub mod ops;

use crate::handle::{Handle, HandleState, NULL_HANDLE, FOS_MAX_HANDLES_PER_PROC};
use crate::memory::page::PhysAddr;
use crate::memory::space;
use crate::memory::FOS_MAX_THREADS_PER_PROC;
use crate::plugin::{Plugin, FOS_MAX_PLUGINS};
use crate::sched::ctx::UserCtx;
use crate::sched::thread::{Gtid, Pid, Thread, ThreadState, Tid};
use crate::sched::wait::{BasicWaitQueue, NotifyMode, TimedWaitQueue, WaitRef};
use crate::sched::Schedule;
use crate::syscall::error::{FosError, OsResult};
use crate::util::IdTable;
use alloc::boxed::Box;
use alloc::collections::BTreeSet;
use alloc::sync::Arc;
use spin::Mutex;

use lazy_static::lazy_static;

lazy_static! {
    /// The one kernel state. `None` until boot wires it up; every trap
    /// action locks it for the duration of the trap.
    pub static ref KERNEL: Mutex<Option<KernelState>> = Mutex::new(None);
}

pub const FOS_MAX_PROCS: u32 = 256;

/// Sentinel pid: "no such process". Also what a forked child reads back
/// instead of a real child pid.
pub const NULL_PID: Pid = FOS_MAX_PROCS;

pub type ProcExitStatus = u32;

pub const PROC_ES_SUCCESS: ProcExitStatus = 0;
pub const PROC_ES_UNSET: ProcExitStatus = 0xFFFF_FFFF;
pub const PROC_ES_GPF: ProcExitStatus = 0xFFFF_FFFE;
pub const PROC_ES_PF: ProcExitStatus = 0xFFFF_FFFD;
pub const PROC_ES_SIGNAL: ProcExitStatus = 0xFFFF_FFFC;

pub type SigVector = u32;
pub type SigId = u32;

/// Reserved: raised on a parent whenever a child exits.
pub const FSIG_CHLD: SigId = 0;

pub const FOS_MAX_SIGNALS: u32 = 32;

pub struct Process {
    pub pid: Pid,
    /// The root process has no parent.
    pub parent: Option<Pid>,
    pub pd: PhysAddr,

    pub threads: IdTable<Thread>,
    /// Exiting this thread exits the process.
    pub main_tid: Tid,

    pub handles: IdTable<Box<dyn HandleState>>,
    pub in_handle: Handle,
    pub out_handle: Handle,

    pub sig_pending: SigVector,
    pub sig_allow: SigVector,
    /// Threads blocked in `wait_signal`. wait_ctx[0] holds the mask,
    /// wait_ctx[1] the user pointer receiving the signal id.
    pub signal_q: Arc<Mutex<BasicWaitQueue>>,
    /// Threads blocked in `join_local_thread`. wait_ctx[0] holds the join
    /// vector, wait_ctx[1] the user pointer receiving the join result.
    pub join_q: Arc<Mutex<BasicWaitQueue>>,

    pub exited: bool,
    pub exit_status: ProcExitStatus,

    pub children: BTreeSet<Pid>,
    pub zombies: BTreeSet<Pid>,
}

impl Process {
    pub fn new(pid: Pid, parent: Option<Pid>, pd: PhysAddr) -> Process {
        Process {
            pid,
            parent,
            pd,
            threads: IdTable::new(FOS_MAX_THREADS_PER_PROC),
            main_tid: 0,
            handles: IdTable::new(FOS_MAX_HANDLES_PER_PROC),
            in_handle: NULL_HANDLE,
            out_handle: NULL_HANDLE,
            sig_pending: 0,
            sig_allow: 1 << FSIG_CHLD,
            signal_q: BasicWaitQueue::new_shared(),
            join_q: BasicWaitQueue::new_shared(),
            exited: false,
            exit_status: PROC_ES_UNSET,
            children: BTreeSet::new(),
            zombies: BTreeSet::new(),
        }
    }
}

pub struct KernelState {
    pub schedule: Schedule,
    pub procs: IdTable<Process>,
    pub root_pid: Pid,
    pub curr_tick: u32,
    pub sleep_q: Arc<Mutex<TimedWaitQueue>>,
    pub plugins: [Option<Box<dyn Plugin>>; FOS_MAX_PLUGINS],
}

impl KernelState {
    pub fn new() -> KernelState {
        KernelState {
            schedule: Schedule::new(),
            procs: IdTable::new(FOS_MAX_PROCS),
            root_pid: NULL_PID,
            curr_tick: 0,
            sleep_q: TimedWaitQueue::new_shared(),
            plugins: Default::default(),
        }
    }

    /// Install a plugin at a fixed slot. `IN_USE` if occupied,
    /// `INVALID_INDEX` past the end of the table.
    pub fn set_plugin(&mut self, slot: u32, plg: Box<dyn Plugin>) -> OsResult {
        let slot = slot as usize;
        if slot >= FOS_MAX_PLUGINS {
            return Err(FosError::InvalidIndex);
        }
        if self.plugins[slot].is_some() {
            return Err(FosError::InUse);
        }
        self.plugins[slot] = Some(plg);
        Ok(())
    }

    // ──────────────────────────────────────────────────────────
    //  Current-thread access
    // ──────────────────────────────────────────────────────────

    pub fn curr_gtid(&self) -> Option<Gtid> {
        self.schedule.head()
    }

    pub fn curr_pid(&self) -> Option<Pid> {
        self.curr_gtid().map(|g| g.pid())
    }

    pub fn proc(&self, pid: Pid) -> Option<&Process> {
        self.procs.get(pid)
    }

    pub fn proc_mut(&mut self, pid: Pid) -> Option<&mut Process> {
        self.procs.get_mut(pid)
    }

    pub fn thread(&self, gtid: Gtid) -> Option<&Thread> {
        self.procs.get(gtid.pid())?.threads.get(gtid.tid())
    }

    pub fn thread_mut(&mut self, gtid: Gtid) -> Option<&mut Thread> {
        self.procs.get_mut(gtid.pid())?.threads.get_mut(gtid.tid())
    }

    pub fn curr_thread(&self) -> Option<&Thread> {
        self.thread(self.curr_gtid()?)
    }

    pub fn curr_thread_mut(&mut self) -> Option<&mut Thread> {
        let gtid = self.curr_gtid()?;
        self.thread_mut(gtid)
    }

    /// Page directory of the current process.
    pub fn curr_pd(&self) -> Option<PhysAddr> {
        Some(self.proc(self.curr_pid()?)?.pd)
    }

    // ──────────────────────────────────────────────────────────
    //  The dual return channel
    // ──────────────────────────────────────────────────────────

    /// Write a user-visible code into the current thread's saved `eax`.
    pub fn set_user_ret(&mut self, code: FosError) {
        self.set_user_ret_val(code.code());
    }

    pub fn set_user_ret_val(&mut self, val: u32) {
        if let Some(thr) = self.curr_thread_mut() {
            thr.ctx.eax = val;
        }
    }

    /// Report `code` to the calling thread and succeed in kernel space.
    pub fn dual_ret(&mut self, code: FosError) -> OsResult {
        self.set_user_ret(code);
        Ok(())
    }

    /// Capture the trap-pushed register image into the current thread.
    pub fn save_ctx(&mut self, ctx: &UserCtx) {
        if let Some(thr) = self.curr_thread_mut() {
            thr.ctx = *ctx;
        }
    }

    // ──────────────────────────────────────────────────────────
    //  Thread state transitions
    // ──────────────────────────────────────────────────────────

    /// Detach a thread from wherever it is linked. Exited threads are
    /// left alone.
    pub fn detach_thread(&mut self, gtid: Gtid) {
        let Some(thr) = self.thread_mut(gtid) else {
            return;
        };

        match thr.state {
            ThreadState::Scheduled => {
                thr.state = ThreadState::Detached;
                self.schedule.remove(gtid);
            }
            ThreadState::Waiting => {
                let wq = thr.wq.take();
                thr.wait_ctx = [0; 6];
                thr.state = ThreadState::Detached;
                if let Some(wq) = wq {
                    wq.remove(gtid);
                }
            }
            ThreadState::Detached | ThreadState::Exited => {}
        }
    }

    /// Link a thread into the schedule ring (detaching it first if
    /// needed).
    pub fn schedule_thread(&mut self, gtid: Gtid) {
        self.detach_thread(gtid);
        if let Some(thr) = self.thread_mut(gtid) {
            thr.state = ThreadState::Scheduled;
            self.schedule.insert(gtid);
        }
    }

    /// Move the current thread from the ring into a basic wait queue.
    pub fn block_current(&mut self, wq: &Arc<Mutex<BasicWaitQueue>>, wait_ctx: [u32; 6]) -> OsResult {
        let gtid = self.curr_gtid().ok_or(FosError::StateMismatch)?;

        self.schedule.remove(gtid);
        wq.lock().enqueue(gtid);

        let thr = self.thread_mut(gtid).ok_or(FosError::StateMismatch)?;
        thr.state = ThreadState::Waiting;
        thr.wq = Some(WaitRef::Basic(wq.clone()));
        thr.wait_ctx = wait_ctx;

        Ok(())
    }

    /// Move the current thread from the ring into a timed wait queue.
    pub fn block_current_timed(&mut self, wq: &Arc<Mutex<TimedWaitQueue>>, key: u32) -> OsResult {
        let gtid = self.curr_gtid().ok_or(FosError::StateMismatch)?;

        self.schedule.remove(gtid);
        wq.lock().enqueue(key, gtid);

        let thr = self.thread_mut(gtid).ok_or(FosError::StateMismatch)?;
        thr.state = ThreadState::Waiting;
        thr.wq = Some(WaitRef::Timed(wq.clone()));
        thr.wait_ctx = [0; 6];

        Ok(())
    }

    /// Wake one popped thread: clear its wait linkage, stamp `eax`,
    /// reschedule.
    pub fn wake_thread(&mut self, gtid: Gtid, code: FosError) {
        if let Some(thr) = self.thread_mut(gtid) {
            thr.wq = None;
            thr.wait_ctx = [0; 6];
            thr.state = ThreadState::Detached;
            thr.ctx.eax = code.code();
        }
        self.schedule_thread(gtid);
    }

    /// Notify-all a queue and wake every ready thread with `code`.
    /// Used for destructive teardown (pipe death, node-key death, futex
    /// deregister) and for plain broadcasts.
    pub fn wake_all(&mut self, wq: &Arc<Mutex<BasicWaitQueue>>, code: FosError) {
        wq.lock().notify(NotifyMode::All);
        loop {
            let popped = wq.lock().pop();
            match popped {
                Some(gtid) => self.wake_thread(gtid, code),
                None => break,
            }
        }
    }

    // ──────────────────────────────────────────────────────────
    //  Handle-table plumbing for the dispatcher
    // ──────────────────────────────────────────────────────────

    /// Lift a handle state out of its slot for the duration of an
    /// operation. The id stays reserved.
    pub fn take_handle(&mut self, pid: Pid, h: Handle) -> Option<Box<dyn HandleState>> {
        self.procs.get_mut(pid)?.handles.take(h)
    }

    pub fn put_handle_back(&mut self, pid: Pid, h: Handle, hs: Box<dyn HandleState>) {
        if let Some(proc) = self.procs.get_mut(pid) {
            proc.handles.set(h, hs);
        }
    }

    /// Recycle a handle id whose state has been lifted out (close path).
    /// Also clears the default in/out designations if they pointed here.
    pub fn release_handle_id(&mut self, pid: Pid, h: Handle) {
        if let Some(proc) = self.procs.get_mut(pid) {
            proc.handles.release(h);
            if proc.in_handle == h {
                proc.in_handle = NULL_HANDLE;
            }
            if proc.out_handle == h {
                proc.out_handle = NULL_HANDLE;
            }
        }
    }

    // ──────────────────────────────────────────────────────────
    //  Plugin fan-out
    // ──────────────────────────────────────────────────────────

    /// Run `f` against the plugin in `slot`, applying the bus error
    /// policy: unknown errors delete the plugin, `ABORT_SYSTEM` is fatal.
    fn plugin_call(
        &mut self,
        slot: usize,
        f: impl FnOnce(&mut Box<dyn Plugin>, &mut KernelState) -> OsResult,
    ) -> OsResult {
        let Some(mut plg) = self.plugins[slot].take() else {
            return Ok(());
        };

        match f(&mut plg, self) {
            Ok(()) => {
                self.plugins[slot] = Some(plg);
                Ok(())
            }
            Err(FosError::AbortSystem) => Err(FosError::AbortSystem),
            Err(_) => {
                // The plugin misbehaved; drop it and keep the slot clear.
                crate::log_warn!("plugin in slot {} removed after hook error", slot);
                Ok(())
            }
        }
    }

    pub fn plugins_tick(&mut self) -> OsResult {
        for slot in 0..FOS_MAX_PLUGINS {
            self.plugin_call(slot, |plg, ks| plg.tick(ks))?;
        }
        Ok(())
    }

    pub fn plugins_on_fork(&mut self, cpid: Pid) -> OsResult {
        for slot in 0..FOS_MAX_PLUGINS {
            self.plugin_call(slot, |plg, ks| plg.on_fork(ks, cpid))?;
        }
        Ok(())
    }

    pub fn plugins_on_reap(&mut self, rpid: Pid) -> OsResult {
        for slot in 0..FOS_MAX_PLUGINS {
            self.plugin_call(slot, |plg, ks| plg.on_reap(ks, rpid))?;
        }
        Ok(())
    }

    /// A custom command aimed at one plugin slot by the current thread.
    pub fn plugin_cmd(&mut self, plg_id: u32, cmd: u32, args: [u32; 4]) -> OsResult {
        if plg_id as usize >= FOS_MAX_PLUGINS || self.plugins[plg_id as usize].is_none() {
            return self.dual_ret(FosError::InvalidIndex);
        }
        self.plugin_call(plg_id as usize, |plg, ks| plg.cmd(ks, cmd, args))
    }

    /// A privileged command from an interrupt handler.
    pub fn plugin_kernel_cmd(&mut self, plg_id: u32, cmd: u32, args: [u32; 4]) -> OsResult {
        if plg_id as usize >= FOS_MAX_PLUGINS {
            return Ok(());
        }
        self.plugin_call(plg_id as usize, |plg, ks| plg.on_kernel_cmd(ks, cmd, args))
    }

    // ──────────────────────────────────────────────────────────
    //  The tick
    // ──────────────────────────────────────────────────────────

    /// One timer interrupt: advance the tick counter, release due
    /// sleepers, run plugin ticks, rotate the schedule.
    pub fn tick(&mut self) -> OsResult {
        self.curr_tick = self.curr_tick.wrapping_add(1);

        let sleep_q = self.sleep_q.clone();
        sleep_q.lock().notify_leq(self.curr_tick);
        loop {
            let woken = sleep_q.lock().pop();
            match woken {
                Some(gtid) => self.wake_thread(gtid, FosError::Success),
                None => break,
            }
        }

        self.plugins_tick()?;

        self.schedule.advance();
        Ok(())
    }

    /// Grow the current thread's stack down to `new_base`.
    ///
    /// `new_base` must be 4K aligned and inside the current thread's
    /// stack slot; pages already present are fine (a racing fault may
    /// have mapped them).
    pub fn expand_stack(&mut self, new_base: u32) -> OsResult {
        use crate::memory::{thread_stack_end, thread_stack_limit};

        let gtid = self.curr_gtid().ok_or(FosError::StateMismatch)?;
        let pd = self.curr_pd().ok_or(FosError::StateMismatch)?;

        if !crate::util::is_aligned(new_base, crate::memory::M_4K) {
            return Err(FosError::AlignError);
        }

        let tid = gtid.tid();
        if new_base < thread_stack_limit(tid) || new_base >= thread_stack_end(tid) {
            return Err(FosError::InvalidRange);
        }

        let old_base = self.thread(gtid).ok_or(FosError::StateMismatch)?.stack_base;
        if new_base >= old_base {
            // Already backed; nothing to do.
            return Ok(());
        }

        let (_true_end, res) = space::alloc_pages(pd, true, new_base, old_base, true);
        res?;

        self.thread_mut(gtid).ok_or(FosError::StateMismatch)?.stack_base = new_base;
        Ok(())
    }
}
