//! The filesystem plugin.
//!
//! Owns the mounted `FileSys`, the node-key interning map, and every
//! process's working directory. A node key lives in the map while anyone
//! references it (an open handle or a CWD); each entry carries a wait
//! queue for threads blocked at end-of-file. The last dereference wakes
//! those threads with `STATE_MISMATCH`.

use super::Plugin;
use crate::fs::{FileSys, NodeKey};
use crate::handle::{Handle, HandleState};
use crate::memory::space::{copy_from_user, copy_to_user, UserPtr};
use crate::proc::KernelState;
use crate::sched::thread::Pid;
use crate::sched::wait::{BasicWaitQueue, NotifyMode};
use crate::syscall::error::{FosError, OsResult};
use alloc::boxed::Box;
use alloc::collections::BTreeMap;
use alloc::sync::Arc;
use spin::Mutex;

pub const PLG_FS_PCID_FLUSH: u32 = 0;
pub const PLG_FS_PCID_SET_WD: u32 = 1;
pub const PLG_FS_PCID_TOUCH: u32 = 2;
pub const PLG_FS_PCID_MKDIR: u32 = 3;
pub const PLG_FS_PCID_REMOVE: u32 = 4;
pub const PLG_FS_PCID_GET_INFO: u32 = 5;
pub const PLG_FS_PCID_GET_CHILD_NAME: u32 = 6;
pub const PLG_FS_PCID_OPEN: u32 = 7;

pub const PLG_FS_HCID_SEEK: u32 = crate::handle::HCID_CUSTOM_START;
pub const PLG_FS_HCID_FLUSH: u32 = crate::handle::HCID_CUSTOM_START + 1;

/// Per-call transfer cap for file reads and writes.
pub const KS_FS_TX_MAX_LEN: usize = 1024;

/// Node info as it crosses into user space.
#[derive(Clone, Copy)]
#[repr(C)]
pub struct RawNodeInfo {
    pub is_dir: u32,
    pub len: u32,
}

struct NkEntry {
    references: u32,
    /// Threads blocked waiting for this node to grow. wait_ctx[0] holds
    /// the blocked handle id, wait_ctx[1] the file length they saw.
    wq: Arc<Mutex<BasicWaitQueue>>,
}

/// State shared between the plugin and every fs handle.
pub struct FsShared {
    fs: Box<dyn FileSys>,
    nk_map: BTreeMap<NodeKey, NkEntry>,
    cwds: BTreeMap<Pid, NodeKey>,
}

impl FsShared {
    /// Intern `nk`: bump its refcount, creating the entry on first use.
    fn register_nk(&mut self, nk: &NodeKey) {
        match self.nk_map.get_mut(nk) {
            Some(entry) => entry.references += 1,
            None => {
                self.nk_map.insert(
                    nk.clone(),
                    NkEntry {
                        references: 1,
                        wq: BasicWaitQueue::new_shared(),
                    },
                );
            }
        }
    }

    /// Drop one reference. Returns the wait queue to flush when the
    /// entry just died.
    fn deregister_nk(&mut self, nk: &NodeKey) -> OsResult<Option<Arc<Mutex<BasicWaitQueue>>>> {
        let entry = self.nk_map.get_mut(nk).ok_or(FosError::AbortSystem)?;

        entry.references -= 1;
        if entry.references > 0 {
            return Ok(None);
        }

        let entry = self.nk_map.remove(nk).ok_or(FosError::AbortSystem)?;
        Ok(Some(entry.wq))
    }

    fn node_wq(&self, nk: &NodeKey) -> Option<Arc<Mutex<BasicWaitQueue>>> {
        self.nk_map.get(nk).map(|e| e.wq.clone())
    }
}

pub struct FsPlugin {
    shared: Arc<Mutex<FsShared>>,
}

impl FsPlugin {
    /// Mount `fs` and give every live process the root as its CWD.
    pub fn new(ks: &KernelState, fs: Box<dyn FileSys>) -> FsPlugin {
        let root = fs.root_key();
        let mut shared = FsShared {
            fs,
            nk_map: BTreeMap::new(),
            cwds: BTreeMap::new(),
        };

        for pid in ks.procs.ids() {
            shared.register_nk(&root);
            shared.cwds.insert(pid, root.clone());
        }

        FsPlugin {
            shared: Arc::new(Mutex::new(shared)),
        }
    }

    /// Copy a path argument out of the caller's space.
    fn read_path(
        ks: &mut KernelState,
        u_path: u32,
        path_len: usize,
    ) -> Result<alloc::string::String, FosError> {
        if u_path == 0 || path_len == 0 || path_len > crate::fs::FS_MAX_PATH_LEN {
            return Err(FosError::BadArgs);
        }

        let pd = ks.curr_pd().ok_or(FosError::StateMismatch)?;
        let mut buf = alloc::vec![0u8; path_len];
        copy_from_user(pd, u_path, &mut buf).map_err(|e| e.user_error())?;

        alloc::string::String::from_utf8(buf).map_err(|_| FosError::BadArgs)
    }
}

impl Plugin for FsPlugin {
    fn cmd(&mut self, ks: &mut KernelState, cmd: u32, args: [u32; 4]) -> OsResult {
        let pid = ks.curr_pid().ok_or(FosError::StateMismatch)?;
        let pd = ks.curr_pd().ok_or(FosError::StateMismatch)?;

        // Flush takes no path; everything else starts with one.
        if cmd == PLG_FS_PCID_FLUSH {
            let res = self.shared.lock().fs.flush(None);
            return ks.dual_ret(match res {
                Ok(()) => FosError::Success,
                Err(e) => e,
            });
        }

        let path = match Self::read_path(ks, args[0], args[1] as usize) {
            Ok(p) => p,
            Err(code) => return ks.dual_ret(code),
        };

        let cwd = match self.shared.lock().cwds.get(&pid) {
            Some(cwd) => cwd.clone(),
            None => return Err(FosError::StateMismatch),
        };

        match cmd {
            // Re-point the process working directory.
            PLG_FS_PCID_SET_WD => {
                let mut shared = self.shared.lock();

                let nk = match shared.fs.new_key(&cwd, &path) {
                    Ok(nk) => nk,
                    Err(e) => return ks.dual_ret(e),
                };
                if !nk.is_dir {
                    return ks.dual_ret(FosError::StateMismatch);
                }

                let dead_q = shared.deregister_nk(&cwd)?;
                shared.register_nk(&nk);
                shared.cwds.insert(pid, nk);
                drop(shared);

                if let Some(wq) = dead_q {
                    ks.wake_all(&wq, FosError::StateMismatch);
                }

                ks.dual_ret(FosError::Success)
            }

            PLG_FS_PCID_TOUCH => {
                let res = self.shared.lock().fs.touch(&cwd, &path);
                ks.dual_ret(match res {
                    Ok(_) => FosError::Success,
                    Err(e) => e,
                })
            }

            PLG_FS_PCID_MKDIR => {
                let res = self.shared.lock().fs.mkdir(&cwd, &path);
                ks.dual_ret(match res {
                    Ok(_) => FosError::Success,
                    Err(e) => e,
                })
            }

            // Remove a file or directory: never while referenced, never
            // a non-empty directory.
            PLG_FS_PCID_REMOVE => {
                let mut shared = self.shared.lock();

                let nk = match shared.fs.new_key(&cwd, &path) {
                    Ok(nk) => nk,
                    Err(e) => return ks.dual_ret(e),
                };

                if shared.nk_map.contains_key(&nk) {
                    return ks.dual_ret(FosError::InUse);
                }

                let info = match shared.fs.node_info(&nk) {
                    Ok(info) => info,
                    Err(e) => return ks.dual_ret(e),
                };
                if info.is_dir && info.len > 0 {
                    return ks.dual_ret(FosError::InUse);
                }

                let res = shared.fs.remove(&cwd, &path);
                drop(shared);
                ks.dual_ret(match res {
                    Ok(()) => FosError::Success,
                    Err(e) => e,
                })
            }

            PLG_FS_PCID_GET_INFO => {
                let u_info = args[2];
                if u_info == 0 {
                    return ks.dual_ret(FosError::BadArgs);
                }

                let mut shared = self.shared.lock();
                let info = shared
                    .fs
                    .new_key(&cwd, &path)
                    .and_then(|nk| shared.fs.node_info(&nk));
                drop(shared);

                match info {
                    Ok(info) => {
                        let raw = RawNodeInfo {
                            is_dir: info.is_dir as u32,
                            len: info.len,
                        };
                        if UserPtr::<RawNodeInfo>::new(u_info).write(pd, &raw).is_err() {
                            return ks.dual_ret(FosError::NoMem);
                        }
                        ks.dual_ret(FosError::Success)
                    }
                    Err(e) => ks.dual_ret(e),
                }
            }

            // Child at index args[2], name copied to args[3]. Walking off
            // the end writes an empty string and still succeeds.
            PLG_FS_PCID_GET_CHILD_NAME => {
                let index = args[2] as usize;
                let u_name = args[3];
                if u_name == 0 {
                    return ks.dual_ret(FosError::BadArgs);
                }

                let mut shared = self.shared.lock();
                let name = shared
                    .fs
                    .new_key(&cwd, &path)
                    .and_then(|nk| shared.fs.child_name(&nk, index));
                drop(shared);

                match name {
                    Ok(name) => {
                        let mut bytes = name.unwrap_or_default().into_bytes();
                        bytes.push(0);
                        if copy_to_user(pd, u_name, &bytes).is_err() {
                            return ks.dual_ret(FosError::NoMem);
                        }
                        ks.dual_ret(FosError::Success)
                    }
                    Err(e) => ks.dual_ret(e),
                }
            }

            // Open a file. The new handle starts at position 0.
            PLG_FS_PCID_OPEN => {
                let u_handle = args[2];
                if u_handle == 0 {
                    return ks.dual_ret(FosError::BadArgs);
                }

                let mut shared = self.shared.lock();

                let nk = match shared.fs.new_key(&cwd, &path) {
                    Ok(nk) => nk,
                    Err(e) => return ks.dual_ret(e),
                };
                if nk.is_dir {
                    return ks.dual_ret(FosError::StateMismatch);
                }

                shared.register_nk(&nk);
                drop(shared);

                let h = {
                    let proc = ks.proc_mut(pid).ok_or(FosError::StateMismatch)?;
                    match proc.handles.reserve() {
                        Some(h) => h,
                        None => {
                            let dead = self.shared.lock().deregister_nk(&nk)?;
                            if let Some(wq) = dead {
                                ks.wake_all(&wq, FosError::StateMismatch);
                            }
                            return ks.dual_ret(FosError::Empty);
                        }
                    }
                };

                if UserPtr::<u32>::new(u_handle).write(pd, &h).is_err() {
                    ks.proc_mut(pid).ok_or(FosError::StateMismatch)?.handles.release(h);
                    let dead = self.shared.lock().deregister_nk(&nk)?;
                    if let Some(wq) = dead {
                        ks.wake_all(&wq, FosError::StateMismatch);
                    }
                    return ks.dual_ret(FosError::NoMem);
                }

                let hs = FsHandleState {
                    pid,
                    handle: h,
                    shared: self.shared.clone(),
                    nk,
                    pos: 0,
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

    fn on_fork(&mut self, ks: &mut KernelState, cpid: Pid) -> OsResult {
        // The child inherits its parent's CWD; handle clones bumped their
        // own node keys already.
        let mut shared = self.shared.lock();

        let parent_cwd = {
            let Some(child_parent) = ks.proc(cpid).and_then(|p| p.parent) else {
                return Err(FosError::StateMismatch);
            };
            match shared.cwds.get(&child_parent) {
                Some(cwd) => cwd.clone(),
                None => return Err(FosError::StateMismatch),
            }
        };

        shared.register_nk(&parent_cwd);
        shared.cwds.insert(cpid, parent_cwd);
        Ok(())
    }

    fn on_reap(&mut self, ks: &mut KernelState, rpid: Pid) -> OsResult {
        let dead = {
            let mut shared = self.shared.lock();
            let cwd = shared.cwds.remove(&rpid).ok_or(FosError::StateMismatch)?;
            shared.deregister_nk(&cwd)?
        };

        if let Some(wq) = dead {
            ks.wake_all(&wq, FosError::StateMismatch);
        }
        Ok(())
    }

    fn on_shutdown(&mut self, _ks: &mut KernelState) {
        let _ = self.shared.lock().fs.flush(None);
    }
}

// ══════════════════════════════════════════════════════════════
//  File handles
// ══════════════════════════════════════════════════════════════

pub struct FsHandleState {
    pid: Pid,
    handle: Handle,
    shared: Arc<Mutex<FsShared>>,
    nk: NodeKey,
    pos: u32,
}

impl HandleState for FsHandleState {
    fn process(&self) -> Pid {
        self.pid
    }

    fn handle(&self) -> Handle {
        self.handle
    }

    fn clone_for(&self, new_pid: Pid) -> OsResult<Box<dyn HandleState>> {
        self.shared.lock().register_nk(&self.nk);
        Ok(Box::new(FsHandleState {
            pid: new_pid,
            handle: self.handle,
            shared: self.shared.clone(),
            nk: self.nk.clone(),
            pos: self.pos,
        }))
    }

    fn close(self: Box<Self>, ks: &mut KernelState) -> OsResult {
        let dead = {
            let mut shared = self.shared.lock();
            // Push this handle's sectors out before letting go.
            let _ = shared.fs.flush(Some(&self.nk));
            shared.deregister_nk(&self.nk)?
        };

        if let Some(wq) = dead {
            ks.wake_all(&wq, FosError::StateMismatch);
        }
        Ok(())
    }

    /// Write at the current position, extending the file as needed. A
    /// write that grew the file wakes every thread blocked at the old
    /// end.
    fn write(&mut self, ks: &mut KernelState, u_src: u32, len: usize, u_written: u32) -> OsResult {
        let pd = ks.curr_pd().ok_or(FosError::StateMismatch)?;

        if u_src == 0 || u_written == 0 {
            return ks.dual_ret(FosError::BadArgs);
        }

        if self.pos == u32::MAX {
            return ks.dual_ret(FosError::NoSpace);
        }

        let (old_len, wq) = {
            let mut shared = self.shared.lock();
            let info = match shared.fs.node_info(&self.nk) {
                Ok(info) => info,
                Err(e) => return ks.dual_ret(e),
            };
            if info.is_dir {
                return Err(FosError::StateMismatch);
            }
            (info.len, shared.node_wq(&self.nk))
        };

        if self.pos > old_len {
            return Err(FosError::StateMismatch);
        }

        let mut to_write = len.min(KS_FS_TX_MAX_LEN);
        if self.pos as u64 + to_write as u64 > u32::MAX as u64 {
            to_write = (u32::MAX - self.pos) as usize;
        }

        let mut tx_buf = [0u8; KS_FS_TX_MAX_LEN];
        if let Err(e) = copy_from_user(pd, u_src, &mut tx_buf[..to_write]) {
            return ks.dual_ret(e.user_error());
        }

        let grew = self.pos + to_write as u32 > old_len;

        let res = self.shared.lock().fs.write(&self.nk, self.pos, &tx_buf[..to_write]);
        match res {
            Ok(()) => {
                self.pos += to_write as u32;
                let written = to_write as u32;
                if UserPtr::<u32>::new(u_written).write(pd, &written).is_err() {
                    return ks.dual_ret(FosError::NoMem);
                }
                ks.set_user_ret(FosError::Success);
            }
            Err(e) => ks.set_user_ret(e),
        }

        // Whoever was parked at the old end gets to re-check, whether or
        // not the write itself went through cleanly.
        if grew {
            if let Some(wq) = wq {
                wq.lock().notify(NotifyMode::All);
                loop {
                    let woken = wq.lock().pop();
                    match woken {
                        Some(gtid) => {
                            // The blocked read recorded the length it saw;
                            // anything else means the queue is corrupt.
                            let seen = ks
                                .thread(gtid)
                                .map(|t| t.wait_ctx[1])
                                .ok_or(FosError::StateMismatch)?;
                            if seen != old_len {
                                return Err(FosError::StateMismatch);
                            }
                            ks.wake_thread(gtid, FosError::Success);
                        }
                        None => break,
                    }
                }
            }
        }

        Ok(())
    }

    /// Non-blocking read at the current position. `EMPTY` at end-of-file;
    /// pair with `wait_read_ready` to block for growth.
    fn read(&mut self, ks: &mut KernelState, u_dst: u32, len: usize, u_readden: u32) -> OsResult {
        let pd = ks.curr_pd().ok_or(FosError::StateMismatch)?;

        if u_dst == 0 || u_readden == 0 {
            return ks.dual_ret(FosError::BadArgs);
        }

        let file_len = {
            let mut shared = self.shared.lock();
            let info = match shared.fs.node_info(&self.nk) {
                Ok(info) => info,
                Err(_) => return ks.dual_ret(FosError::UnknownError),
            };
            if info.is_dir {
                return Err(FosError::StateMismatch);
            }
            info.len
        };

        if self.pos > file_len {
            return Err(FosError::StateMismatch);
        }
        if self.pos == file_len {
            return ks.dual_ret(FosError::Empty);
        }

        let to_read = len
            .min((file_len - self.pos) as usize)
            .min(KS_FS_TX_MAX_LEN);

        let mut rx_buf = [0u8; KS_FS_TX_MAX_LEN];
        let res = self.shared.lock().fs.read(&self.nk, self.pos, &mut rx_buf[..to_read]);
        if res.is_err() {
            return ks.dual_ret(FosError::UnknownError);
        }

        if copy_to_user(pd, u_dst, &rx_buf[..to_read]).is_err() {
            return ks.dual_ret(FosError::UnknownError);
        }
        let readden = to_read as u32;
        if UserPtr::<u32>::new(u_readden).write(pd, &readden).is_err() {
            return ks.dual_ret(FosError::UnknownError);
        }

        self.pos += to_read as u32;
        ks.dual_ret(FosError::Success)
    }

    /// Block until more data exists past the current position. Returns
    /// immediately when the position is short of the end already.
    fn wait_read_ready(&mut self, ks: &mut KernelState) -> OsResult {
        let (file_len, wq) = {
            let mut shared = self.shared.lock();
            let info = match shared.fs.node_info(&self.nk) {
                Ok(info) => info,
                Err(e) => return ks.dual_ret(e),
            };
            if info.is_dir {
                return Err(FosError::StateMismatch);
            }
            (info.len, shared.node_wq(&self.nk))
        };

        if self.pos > file_len {
            return Err(FosError::StateMismatch);
        }

        if self.pos == file_len {
            if file_len == u32::MAX {
                // Nothing can ever be appended; there is nothing to wait
                // for.
                return ks.dual_ret(FosError::Empty);
            }

            let wq = wq.ok_or(FosError::StateMismatch)?;
            return ks.block_current(&wq, [self.handle, self.pos, 0, 0, 0, 0]);
        }

        ks.dual_ret(FosError::Success)
    }

    fn cmd(&mut self, ks: &mut KernelState, cmd: u32, args: [u32; 4]) -> OsResult {
        match cmd {
            // Seek clamps to the end of the file, so u32::MAX always
            // means "end".
            PLG_FS_HCID_SEEK => {
                let mut new_pos = args[0];

                let info = {
                    let mut shared = self.shared.lock();
                    match shared.fs.node_info(&self.nk) {
                        Ok(info) => info,
                        Err(e) => return ks.dual_ret(e),
                    }
                };
                if info.is_dir {
                    return Err(FosError::StateMismatch);
                }

                if new_pos > info.len {
                    new_pos = info.len;
                }
                self.pos = new_pos;
                ks.dual_ret(FosError::Success)
            }

            PLG_FS_HCID_FLUSH => {
                let res = self.shared.lock().fs.flush(Some(&self.nk));
                ks.dual_ret(match res {
                    Ok(()) => FosError::Success,
                    Err(e) => e,
                })
            }

            _ => ks.dual_ret(FosError::BadArgs),
        }
    }
}
