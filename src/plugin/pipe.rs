//! Pipes.
//!
//! A pipe is a fixed ring buffer with a read cursor `i` and a write
//! cursor `j` (which always points at an empty cell, so usable capacity
//! is one less than the buffer). Readers and writers park in the same
//! wait queue and re-check the buffer on wakeup. Handles are refcounted;
//! the last close releases every waiter with `STATE_MISMATCH`.

use super::Plugin;
use crate::handle::{Handle, HandleState};
use crate::memory::space::{copy_from_user, copy_to_user, UserPtr};
use crate::proc::KernelState;
use crate::sched::thread::Pid;
use crate::sched::wait::BasicWaitQueue;
use crate::syscall::error::{FosError, OsResult};
use alloc::boxed::Box;
use alloc::sync::Arc;
use alloc::vec::Vec;
use spin::Mutex;

pub const PLG_PIPE_PCID_OPEN: u32 = 0;

/// Most data a single pipe can hold.
pub const KS_PIPE_MAX_LEN: usize = 4096;

/// Per-call transfer cap, to bound time spent inside the kernel.
pub const KS_PIPE_TX_MAX_LEN: usize = 1024;

pub struct Pipe {
    buf: Vec<u8>,
    /// Read cursor.
    i: usize,
    /// Write cursor; always an empty cell.
    j: usize,
    ref_count: u32,
    wq: Arc<Mutex<BasicWaitQueue>>,
}

impl Pipe {
    /// `sig_cap` is the usable byte capacity.
    pub fn new(sig_cap: usize) -> Pipe {
        let cap = sig_cap + 1;
        Pipe {
            buf: alloc::vec![0; cap],
            i: 0,
            j: 0,
            ref_count: 0,
            wq: BasicWaitQueue::new_shared(),
        }
    }

    fn cap(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.i == self.j
    }

    pub fn is_full(&self) -> bool {
        (self.j + 1) % self.cap() == self.i
    }

    /// Bytes of user data currently in the ring.
    pub fn occupied(&self) -> usize {
        if self.i <= self.j {
            self.j - self.i
        } else {
            (self.cap() - self.i) + self.j
        }
    }

    pub fn available(&self) -> usize {
        (self.cap() - 1) - self.occupied()
    }
}

pub struct PipeHandleState {
    pid: Pid,
    handle: Handle,
    pipe: Arc<Mutex<Pipe>>,
}

impl HandleState for PipeHandleState {
    fn process(&self) -> Pid {
        self.pid
    }

    fn handle(&self) -> Handle {
        self.handle
    }

    fn clone_for(&self, new_pid: Pid) -> OsResult<Box<dyn HandleState>> {
        self.pipe.lock().ref_count += 1;
        Ok(Box::new(PipeHandleState {
            pid: new_pid,
            handle: self.handle,
            pipe: self.pipe.clone(),
        }))
    }

    fn close(self: Box<Self>, ks: &mut KernelState) -> OsResult {
        let (dead, wq) = {
            let mut pipe = self.pipe.lock();
            pipe.ref_count -= 1;
            (pipe.ref_count == 0, pipe.wq.clone())
        };

        if dead {
            // Nobody can complete these waits anymore.
            ks.wake_all(&wq, FosError::StateMismatch);
        }

        Ok(())
    }

    fn write(&mut self, ks: &mut KernelState, u_src: u32, len: usize, u_written: u32) -> OsResult {
        let pd = ks.curr_pd().ok_or(FosError::StateMismatch)?;

        if u_src == 0 || len == 0 {
            return ks.dual_ret(FosError::BadArgs);
        }

        let (code, written, wake, wq) = {
            let mut pipe = self.pipe.lock();

            if pipe.is_full() {
                return ks.dual_ret(FosError::Empty);
            }

            let was_empty = pipe.is_empty();
            let to_write = len.min(pipe.available()).min(KS_PIPE_TX_MAX_LEN);

            let mut written = 0usize;
            let mut code = FosError::Success;

            // First segment: up to the physical end of the ring.
            if pipe.i <= pipe.j {
                let first = to_write.min(pipe.cap() - pipe.j);
                let j = pipe.j;
                match copy_from_user(pd, u_src, &mut pipe.buf[j..j + first]) {
                    Ok(()) => written += first,
                    Err(e) => {
                        written += e.copied();
                        code = e.user_error();
                    }
                }
                pipe.j += written;
                if pipe.j == pipe.cap() {
                    pipe.j = 0;
                }
            }

            // Second segment: the wrapped remainder (j < i from here on).
            if code == FosError::Success && to_write - written > 0 {
                let second = to_write - written;
                let j = pipe.j;
                match copy_from_user(pd, u_src + written as u32, &mut pipe.buf[j..j + second]) {
                    Ok(()) => {
                        pipe.j += second;
                        written += second;
                    }
                    Err(e) => {
                        pipe.j += e.copied();
                        written += e.copied();
                        code = e.user_error();
                    }
                }
            }

            let wake = was_empty && written > 0;
            (code, written, wake, pipe.wq.clone())
        };

        // Data appeared in an empty pipe; every parked reader (and
        // writer) gets to re-check.
        if wake {
            ks.wake_all(&wq, FosError::Success);
        }

        if u_written != 0 {
            if UserPtr::<u32>::new(u_written).write(pd, &(written as u32)).is_err() {
                return ks.dual_ret(FosError::NoMem);
            }
        }

        ks.dual_ret(code)
    }

    fn read(&mut self, ks: &mut KernelState, u_dst: u32, len: usize, u_readden: u32) -> OsResult {
        let pd = ks.curr_pd().ok_or(FosError::StateMismatch)?;

        if u_dst == 0 || len == 0 {
            return ks.dual_ret(FosError::BadArgs);
        }

        let (code, readden, wake, wq) = {
            let mut pipe = self.pipe.lock();

            if pipe.is_empty() {
                return ks.dual_ret(FosError::Empty);
            }

            let was_full = pipe.is_full();
            let to_read = len.min(pipe.occupied()).min(KS_PIPE_TX_MAX_LEN);

            let mut readden = 0usize;
            let mut code = FosError::Success;

            // First segment: the tail end of the ring when wrapped.
            if pipe.j < pipe.i {
                let first = to_read.min(pipe.cap() - pipe.i);
                let i = pipe.i;
                match copy_to_user(pd, u_dst, &pipe.buf[i..i + first]) {
                    Ok(()) => readden += first,
                    Err(e) => {
                        readden += e.copied();
                        code = e.user_error();
                    }
                }
                pipe.i += readden;
                if pipe.i == pipe.cap() {
                    pipe.i = 0;
                }
            }

            if code == FosError::Success && to_read - readden > 0 {
                let second = to_read - readden;
                let i = pipe.i;
                match copy_to_user(pd, u_dst + readden as u32, &pipe.buf[i..i + second]) {
                    Ok(()) => {
                        pipe.i += second;
                        readden += second;
                    }
                    Err(e) => {
                        pipe.i += e.copied();
                        readden += e.copied();
                        code = e.user_error();
                    }
                }
            }

            let wake = was_full && readden > 0;
            (code, readden, wake, pipe.wq.clone())
        };

        // Room appeared in a full pipe.
        if wake {
            ks.wake_all(&wq, FosError::Success);
        }

        if u_readden != 0 {
            if UserPtr::<u32>::new(u_readden).write(pd, &(readden as u32)).is_err() {
                return ks.dual_ret(FosError::NoMem);
            }
        }

        ks.dual_ret(code)
    }

    fn wait_write_ready(&mut self, ks: &mut KernelState) -> OsResult {
        let (full, wq) = {
            let pipe = self.pipe.lock();
            (pipe.is_full(), pipe.wq.clone())
        };

        if full {
            return ks.block_current(&wq, [0; 6]);
        }
        ks.dual_ret(FosError::Success)
    }

    fn wait_read_ready(&mut self, ks: &mut KernelState) -> OsResult {
        let (empty, wq) = {
            let pipe = self.pipe.lock();
            (pipe.is_empty(), pipe.wq.clone())
        };

        if empty {
            return ks.block_current(&wq, [0; 6]);
        }
        ks.dual_ret(FosError::Success)
    }
}

/// The plugin itself only knows how to open pipes; everything else rides
/// on the handle.
pub struct PipePlugin;

impl Plugin for PipePlugin {
    fn cmd(&mut self, ks: &mut KernelState, cmd: u32, args: [u32; 4]) -> OsResult {
        match cmd {
            // args[0]: user pointer receiving the new handle.
            // args[1]: usable capacity in bytes.
            PLG_PIPE_PCID_OPEN => {
                let pid = ks.curr_pid().ok_or(FosError::StateMismatch)?;
                let pd = ks.curr_pd().ok_or(FosError::StateMismatch)?;

                let u_handle = args[0];
                let sig_cap = args[1] as usize;

                if u_handle == 0 || sig_cap == 0 || sig_cap > KS_PIPE_MAX_LEN {
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
                    let proc = ks.proc_mut(pid).ok_or(FosError::StateMismatch)?;
                    proc.handles.release(h);
                    return ks.dual_ret(FosError::NoMem);
                }

                let mut pipe = Pipe::new(sig_cap);
                pipe.ref_count = 1;

                let hs = PipeHandleState {
                    pid,
                    handle: h,
                    pipe: Arc::new(Mutex::new(pipe)),
                };

                let proc = ks.proc_mut(pid).ok_or(FosError::StateMismatch)?;
                proc.handles.set(h, Box::new(hs));

                ks.dual_ret(FosError::Success)
            }

            _ => ks.dual_ret(FosError::BadArgs),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cursor_arithmetic() {
        let mut p = Pipe::new(4); // cap 5, usable 4
        assert!(p.is_empty());
        assert!(!p.is_full());
        assert_eq!(p.available(), 4);

        p.j = 4;
        assert_eq!(p.occupied(), 4);
        assert!(p.is_full());
        assert_eq!(p.available(), 0);

        // Wrapped: i = 3, j = 1 → two bytes before i, occupying the wrap.
        p.i = 3;
        p.j = 1;
        assert_eq!(p.occupied(), 3);
        assert!(!p.is_full());
        assert!(!p.is_empty());
    }

    #[test]
    fn one_byte_pipe() {
        let mut p = Pipe::new(1); // the smallest useful pipe
        assert!(p.is_empty());
        p.j = 1;
        assert!(p.is_full());
        assert_eq!(p.occupied(), 1);
        p.i = 1;
        assert!(p.is_empty());
    }
}
