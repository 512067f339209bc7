//! Character-display handles.
//!
//! The display itself (VGA text renderer, ANSI color interpretation,
//! scrolling) lives behind the `CharDisplay` trait; the handle's job is
//! the transfer cap and making sure a capped write never slices an ANSI
//! escape in half. Copies on fork just share the device.

use super::{Handle, HandleState};
use crate::memory::space::{copy_from_user, UserPtr};
use crate::proc::KernelState;
use crate::sched::thread::Pid;
use crate::syscall::error::{FosError, OsResult};
use alloc::boxed::Box;
use alloc::sync::Arc;
use spin::Mutex;
use volatile::Volatile;

pub const CD_HCID_GET_DIMS: u32 = super::HCID_CUSTOM_START;

/// Per-call write cap.
pub const HANDLE_CD_TX_MAX_LEN: usize = 2048;

/// How far back a truncated write is scanned for the start of an ANSI
/// escape. Must be shorter than the cap.
const ANSI_CSI_LOOK_BACK: usize = 32;

/// The terminal renderer seam. Implementations interpret ANSI CSI color
/// escapes (30-37, 40-47, 90-97, 100-107, 0) on their own.
pub trait CharDisplay: Send {
    fn put_bytes(&mut self, bytes: &[u8]);
    fn rows(&self) -> usize;
    fn cols(&self) -> usize;
}

/// Display that mirrors everything to the serial log. Stands in wherever
/// no VGA renderer is wired up.
pub struct SerialDisplay;

impl CharDisplay for SerialDisplay {
    fn put_bytes(&mut self, bytes: &[u8]) {
        let mut serial = crate::serial::SERIAL1.lock();
        for &b in bytes {
            serial.send(b);
        }
    }

    fn rows(&self) -> usize {
        25
    }

    fn cols(&self) -> usize {
        80
    }
}

const VGA_BUFFER_ADDR: usize = 0xB8000;
const VGA_ROWS: usize = 25;
const VGA_COLS: usize = 80;

/// Bare VGA text-mode cell writer. This is only the seam to the real
/// renderer: plain glyphs at a advancing cursor, wrap to the top, no
/// escape handling (those bytes are skipped).
pub struct VgaDisplay {
    row: usize,
    col: usize,
    color: u8,
    in_escape: bool,
}

impl VgaDisplay {
    pub fn new() -> VgaDisplay {
        VgaDisplay {
            row: 0,
            col: 0,
            color: 0x07,
            in_escape: false,
        }
    }

    fn put_cell(&mut self, byte: u8) {
        let offset = self.row * VGA_COLS + self.col;
        let cell = ((self.color as u16) << 8) | byte as u16;
        unsafe {
            let ptr = (VGA_BUFFER_ADDR as *mut Volatile<u16>).add(offset);
            (*ptr).write(cell);
        }
    }

    fn advance(&mut self) {
        self.col += 1;
        if self.col == VGA_COLS {
            self.newline();
        }
    }

    fn newline(&mut self) {
        self.col = 0;
        self.row = (self.row + 1) % VGA_ROWS;
    }
}

impl CharDisplay for VgaDisplay {
    fn put_bytes(&mut self, bytes: &[u8]) {
        for &b in bytes {
            if self.in_escape {
                // Swallow the CSI sequence; a letter ends it.
                if b.is_ascii_alphabetic() {
                    self.in_escape = false;
                }
                continue;
            }

            match b {
                0x1B => self.in_escape = true,
                b'\n' => self.newline(),
                b'\r' => self.col = 0,
                _ => {
                    self.put_cell(b);
                    self.advance();
                }
            }
        }
    }

    fn rows(&self) -> usize {
        VGA_ROWS
    }

    fn cols(&self) -> usize {
        VGA_COLS
    }
}

pub struct CdHandleState {
    pid: Pid,
    handle: Handle,
    cd: Arc<Mutex<dyn CharDisplay>>,
}

impl CdHandleState {
    pub fn new(pid: Pid, handle: Handle, cd: Arc<Mutex<dyn CharDisplay>>) -> CdHandleState {
        CdHandleState { pid, handle, cd }
    }
}

/// Trim `len` so a capped write never ends inside an ANSI escape: if the
/// final stretch contains an escape introducer, cut just before it and
/// let the caller resend the rest.
pub fn ansi_safe_len(buf: &[u8], requested: usize) -> usize {
    let len = buf.len();
    if len >= requested {
        // Nothing was cut off; whatever escapes are in here are whole.
        return len;
    }

    let lookback_start = len.saturating_sub(ANSI_CSI_LOOK_BACK);
    for i in (lookback_start..len).rev() {
        if buf[i] == 0x1B {
            return i;
        }
    }
    len
}

impl HandleState for CdHandleState {
    fn process(&self) -> Pid {
        self.pid
    }

    fn handle(&self) -> Handle {
        self.handle
    }

    fn clone_for(&self, new_pid: Pid) -> OsResult<Box<dyn HandleState>> {
        Ok(Box::new(CdHandleState {
            pid: new_pid,
            handle: self.handle,
            cd: self.cd.clone(),
        }))
    }

    fn close(self: Box<Self>, _ks: &mut KernelState) -> OsResult {
        Ok(())
    }

    fn write(&mut self, ks: &mut KernelState, u_src: u32, len: usize, u_written: u32) -> OsResult {
        let pd = ks.curr_pd().ok_or(FosError::StateMismatch)?;

        if u_src == 0 || len == 0 {
            return ks.dual_ret(FosError::BadArgs);
        }

        let amt_to_copy = len.min(HANDLE_CD_TX_MAX_LEN);
        let mut buf = [0u8; HANDLE_CD_TX_MAX_LEN];
        if let Err(e) = copy_from_user(pd, u_src, &mut buf[..amt_to_copy]) {
            return ks.dual_ret(e.user_error());
        }

        let amt_to_print = ansi_safe_len(&buf[..amt_to_copy], len);

        if u_written != 0 {
            let n = amt_to_print as u32;
            if UserPtr::<u32>::new(u_written).write(pd, &n).is_err() {
                return ks.dual_ret(FosError::NoMem);
            }
        }

        self.cd.lock().put_bytes(&buf[..amt_to_print]);
        ks.dual_ret(FosError::Success)
    }

    /// A character display always accepts data.
    fn wait_write_ready(&mut self, ks: &mut KernelState) -> OsResult {
        ks.dual_ret(FosError::Success)
    }

    fn cmd(&mut self, ks: &mut KernelState, cmd: u32, args: [u32; 4]) -> OsResult {
        match cmd {
            CD_HCID_GET_DIMS => {
                let pd = ks.curr_pd().ok_or(FosError::StateMismatch)?;
                let (rows, cols) = {
                    let cd = self.cd.lock();
                    (cd.rows() as u32, cd.cols() as u32)
                };

                if args[0] != 0 {
                    if UserPtr::<u32>::new(args[0]).write(pd, &rows).is_err() {
                        return ks.dual_ret(FosError::NoMem);
                    }
                }
                if args[1] != 0 {
                    if UserPtr::<u32>::new(args[1]).write(pd, &cols).is_err() {
                        return ks.dual_ret(FosError::NoMem);
                    }
                }

                ks.dual_ret(FosError::Success)
            }

            _ => ks.dual_ret(FosError::BadArgs),
        }
    }

    fn is_char_display(&self) -> bool {
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn full_writes_are_never_trimmed() {
        let mut buf = alloc::vec![b'x'; 100];
        buf[50] = 0x1B; // a whole escape inside an un-capped write stays
        assert_eq!(ansi_safe_len(&buf, 100), 100);
    }

    #[test]
    fn capped_write_cuts_at_escape() {
        // 2049-byte request: the copy holds 2048, with an escape start
        // near the end.
        let mut buf = alloc::vec![b'x'; HANDLE_CD_TX_MAX_LEN];
        buf[HANDLE_CD_TX_MAX_LEN - 5] = 0x1B;
        assert_eq!(
            ansi_safe_len(&buf, HANDLE_CD_TX_MAX_LEN + 1),
            HANDLE_CD_TX_MAX_LEN - 5
        );
    }

    #[test]
    fn capped_write_without_escape_keeps_everything() {
        let buf = alloc::vec![b'x'; HANDLE_CD_TX_MAX_LEN];
        assert_eq!(
            ansi_safe_len(&buf, HANDLE_CD_TX_MAX_LEN + 100),
            HANDLE_CD_TX_MAX_LEN
        );
    }

    #[test]
    fn escape_outside_lookback_window_is_ignored() {
        let mut buf = alloc::vec![b'x'; HANDLE_CD_TX_MAX_LEN];
        buf[HANDLE_CD_TX_MAX_LEN - 40] = 0x1B; // beyond the 32-byte window
        assert_eq!(
            ansi_safe_len(&buf, HANDLE_CD_TX_MAX_LEN + 1),
            HANDLE_CD_TX_MAX_LEN
        );
    }
}
