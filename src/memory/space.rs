//! Address-space operations: deep copies of page directories, cross-space
//! memory transfer through the scratch windows, range allocation, and the
//! user-app image loader.

use super::page::{
    assign_free_page, delete_page_directory, delete_page_table, new_page_directory,
    new_page_table, pop_free_page, push_free_page, with_window, EntryKind, PageTableEntry,
    PhysAddr,
};
use super::{
    APP_AREA_END, APP_AREA_START, APP_ARGS_AREA_SIZE, APP_ARGS_AREA_START, M_4K, M_4M,
};
use crate::syscall::error::{FosError, OsResult};
use crate::util::{align_down, is_aligned};
use alloc::vec::Vec;
use core::marker::PhantomData;

// ══════════════════════════════════════════════════════════════
//  Raw page copies
// ══════════════════════════════════════════════════════════════

/// Copy the contents of physical page `src` onto physical page `dest`.
pub fn page_copy(dest: PhysAddr, src: PhysAddr) {
    unsafe {
        let old0 = assign_free_page(0, dest);
        let old1 = assign_free_page(1, src);

        core::ptr::copy_nonoverlapping(
            super::page::window_ptr(1),
            super::page::window_ptr(0),
            M_4K as usize,
        );

        assign_free_page(0, old0);
        assign_free_page(1, old1);
    }
}

/// Resolve `vaddr` through `pd`. NULL when the address is unmapped.
pub fn get_underlying_page(pd: PhysAddr, vaddr: u32) -> PhysAddr {
    let pdi = (vaddr / M_4M) as usize;
    let pti = ((vaddr / M_4K) % 1024) as usize;

    let pde = unsafe {
        with_window(0, pd, |w| unsafe { PageTableEntry((w as *const u32).add(pdi).read_volatile()) })
    };
    if !pde.present() {
        return PhysAddr::NULL;
    }

    let pte = unsafe {
        with_window(0, pde.base(), |w| unsafe {
            PageTableEntry((w as *const u32).add(pti).read_volatile())
        })
    };
    if !pte.present() {
        return PhysAddr::NULL;
    }

    pte.base()
}

/// Deep-copy one page table. UNIQUE entries get fresh frames with copied
/// contents; SHARED and IDENTITY entries are copied verbatim. On failure
/// everything acquired so far is released.
pub fn copy_page_table(pt: PhysAddr) -> OsResult<PhysAddr> {
    if pt.is_null() {
        return Err(FosError::BadArgs);
    }

    let pt_copy = new_page_table()?;

    // The scratch windows are global; a trap must never observe them
    // half-switched.
    let status = crate::arch::without_interrupts(|| {
        let mut status = Ok(());

        unsafe {
            let old0 = assign_free_page(0, pt);
            let old1 = assign_free_page(1, pt_copy);

            for i in 0..1024 {
                if status.is_err() {
                    break;
                }

                let src = super::page::window_ptr(0) as *const u32;
                let dst = super::page::window_ptr(1) as *mut u32;

                let pte = PageTableEntry(src.add(i).read_volatile());
                if !pte.present() {
                    continue;
                }

                if pte.kind() == EntryKind::Unique {
                    match pop_free_page() {
                        Some(new_base) => {
                            // page_copy juggles both windows internally and
                            // restores them, so our views stay intact.
                            page_copy(new_base, pte.base());

                            let copy = PageTableEntry::new(
                                new_base,
                                EntryKind::Unique,
                                pte.user(),
                                pte.writable(),
                            );
                            dst.add(i).write_volatile(copy.0);
                        }
                        None => status = Err(FosError::NoMem),
                    }
                } else {
                    dst.add(i).write_volatile(pte.0);
                }
            }

            assign_free_page(1, old1);
            assign_free_page(0, old0);
        }

        status
    });

    if status.is_err() {
        delete_page_table(pt_copy);
        return Err(FosError::NoMem);
    }

    Ok(pt_copy)
}

/// Deep-copy a page directory. Every present PDE gets a fresh page table;
/// frame duplication follows the entry kinds. Rolls back fully on failure.
pub fn copy_page_directory(pd: PhysAddr) -> OsResult<PhysAddr> {
    if pd.is_null() {
        return Err(FosError::BadArgs);
    }

    let pd_copy = new_page_table()?;

    // Page-table mutation is a critical section; the whole copy appears
    // atomic to the parent.
    let status = crate::arch::without_interrupts(|| -> OsResult {
        for i in 0..1024 {
            let pde = unsafe {
                with_window(0, pd, |w| unsafe {
                    PageTableEntry((w as *const u32).add(i).read_volatile())
                })
            };
            if !pde.present() {
                continue;
            }

            let pt_copy = copy_page_table(pde.base())?;
            unsafe {
                with_window(0, pd_copy, |w| unsafe {
                    let e = PageTableEntry::new(pt_copy, EntryKind::Unique, true, true);
                    (w as *mut u32).add(i).write_volatile(e.0);
                });
            }
        }

        Ok(())
    });

    if status.is_err() {
        delete_page_directory(pd_copy);
        return Err(FosError::NoMem);
    }

    Ok(pd_copy)
}

// ══════════════════════════════════════════════════════════════
//  Cross-space transfer
// ══════════════════════════════════════════════════════════════

/// A failed cross-space transfer. `copied` bytes made it across before the
/// walk hit an unmapped page.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CopyErr {
    BadArgs,
    Unmapped { copied: usize },
}

impl CopyErr {
    /// The user-visible code for this failure.
    pub fn user_error(self) -> FosError {
        match self {
            CopyErr::BadArgs => FosError::BadArgs,
            CopyErr::Unmapped { .. } => FosError::NoMem,
        }
    }

    pub fn copied(self) -> usize {
        match self {
            CopyErr::BadArgs => 0,
            CopyErr::Unmapped { copied } => copied,
        }
    }
}

/// Walk `[u_addr, u_addr + len)` in `pd` page by page, calling `f` with
/// (window pointer, offset-into-transfer, chunk length) for each mapped
/// chunk.
fn walk_user(
    pd: PhysAddr,
    u_addr: u32,
    len: usize,
    mut f: impl FnMut(*mut u8, usize, usize),
) -> Result<(), CopyErr> {
    if pd.is_null() {
        return Err(CopyErr::BadArgs);
    }
    if len == 0 {
        return Ok(());
    }
    if u_addr.checked_add(len as u32 - 1).is_none() {
        return Err(CopyErr::BadArgs);
    }

    let mut done = 0usize;
    while done < len {
        let cursor = u_addr + done as u32;
        let frame = get_underlying_page(pd, cursor);
        if frame.is_null() {
            return Err(CopyErr::Unmapped { copied: done });
        }

        let offset = (cursor % M_4K) as usize;
        let chunk = core::cmp::min(M_4K as usize - offset, len - done);

        unsafe {
            with_window(0, frame, |w| f(unsafe { w.add(offset) }, done, chunk));
        }

        done += chunk;
    }

    Ok(())
}

/// Copy `dst.len()` bytes out of another address space.
pub fn copy_from_user(pd: PhysAddr, u_src: u32, dst: &mut [u8]) -> Result<(), CopyErr> {
    let dst_ptr = dst.as_mut_ptr();
    walk_user(pd, u_src, dst.len(), |w, off, chunk| unsafe {
        core::ptr::copy_nonoverlapping(w as *const u8, dst_ptr.add(off), chunk);
    })
}

/// Copy `src.len()` bytes into another address space.
pub fn copy_to_user(pd: PhysAddr, u_dst: u32, src: &[u8]) -> Result<(), CopyErr> {
    let src_ptr = src.as_ptr();
    walk_user(pd, u_dst, src.len(), |w, off, chunk| unsafe {
        core::ptr::copy_nonoverlapping(src_ptr.add(off), w, chunk);
    })
}

/// Fill a range of another address space with `val`.
pub fn memset_user(pd: PhysAddr, u_dst: u32, val: u8, len: usize) -> Result<(), CopyErr> {
    walk_user(pd, u_dst, len, |w, _off, chunk| unsafe {
        core::ptr::write_bytes(w, val, chunk);
    })
}

/// A typed pointer into some user address space. The only way through it
/// is the checked cross-space copy; no references into foreign spaces are
/// ever formed.
pub struct UserPtr<T> {
    addr: u32,
    _marker: PhantomData<*mut T>,
}

impl<T> Clone for UserPtr<T> {
    fn clone(&self) -> Self {
        *self
    }
}
impl<T> Copy for UserPtr<T> {}

impl<T: Copy> UserPtr<T> {
    pub fn new(addr: u32) -> UserPtr<T> {
        UserPtr {
            addr,
            _marker: PhantomData,
        }
    }

    pub fn is_null(self) -> bool {
        self.addr == 0
    }

    pub fn addr(self) -> u32 {
        self.addr
    }

    pub fn read(self, pd: PhysAddr) -> Result<T, CopyErr> {
        let mut val = core::mem::MaybeUninit::<T>::uninit();
        let buf = unsafe {
            core::slice::from_raw_parts_mut(val.as_mut_ptr() as *mut u8, core::mem::size_of::<T>())
        };
        copy_from_user(pd, self.addr, buf)?;
        Ok(unsafe { val.assume_init() })
    }

    pub fn write(self, pd: PhysAddr, val: &T) -> Result<(), CopyErr> {
        let buf = unsafe {
            core::slice::from_raw_parts(val as *const T as *const u8, core::mem::size_of::<T>())
        };
        copy_to_user(pd, self.addr, buf)
    }
}

// ══════════════════════════════════════════════════════════════
//  Range allocation
// ══════════════════════════════════════════════════════════════

/// Map every 4K page of `[start, end)` in `pd` as a fresh UNIQUE writable
/// frame.
///
/// Returns `(true_end, outcome)`. `true_end` is one past the last byte
/// backed by a mapping when this call returns; on full success it equals
/// `end`. Hitting an existing mapping yields `AlreadyAllocated` unless
/// `tolerate_mapped` (stack growth re-runs are expected to overlap).
pub fn alloc_pages(
    pd: PhysAddr,
    user: bool,
    start: u32,
    end: u32,
    tolerate_mapped: bool,
) -> (u32, OsResult) {
    debug_assert!(is_aligned(start, M_4K));

    let mut cursor = start;
    while cursor < end {
        let pdi = (cursor / M_4M) as usize;
        let pti = ((cursor / M_4K) % 1024) as usize;

        let pde = unsafe {
            with_window(0, pd, |w| unsafe { PageTableEntry((w as *const u32).add(pdi).read_volatile()) })
        };

        let pt = if pde.present() {
            pde.base()
        } else {
            let pt = match new_page_table() {
                Ok(pt) => pt,
                Err(e) => return (cursor, Err(e)),
            };
            unsafe {
                with_window(0, pd, |w| unsafe {
                    let e = PageTableEntry::new(pt, EntryKind::Unique, true, true);
                    (w as *mut u32).add(pdi).write_volatile(e.0);
                });
            }
            pt
        };

        let existing = unsafe {
            with_window(0, pt, |w| unsafe { PageTableEntry((w as *const u32).add(pti).read_volatile()) })
        };

        if existing.present() {
            if !tolerate_mapped {
                return (cursor, Err(FosError::AlreadyAllocated));
            }
        } else {
            let frame = match pop_free_page() {
                Some(f) => f,
                None => return (cursor, Err(FosError::NoMem)),
            };
            unsafe {
                with_window(0, pt, |w| unsafe {
                    let e = PageTableEntry::new(frame, EntryKind::Unique, user, true);
                    (w as *mut u32).add(pti).write_volatile(e.0);
                });
            }
        }

        cursor += M_4K;
    }

    (end, Ok(()))
}

/// Unmap every page of `[start, end)` in `pd`, releasing UNIQUE frames.
/// Pages that were never mapped are skipped.
pub fn free_pages(pd: PhysAddr, start: u32, end: u32) {
    let mut cursor = start;
    while cursor < end {
        let pdi = (cursor / M_4M) as usize;
        let pti = ((cursor / M_4K) % 1024) as usize;

        let pde = unsafe {
            with_window(0, pd, |w| unsafe { PageTableEntry((w as *const u32).add(pdi).read_volatile()) })
        };

        if pde.present() {
            unsafe {
                with_window(0, pde.base(), |w| unsafe {
                    let entry = (w as *mut u32).add(pti);
                    let pte = PageTableEntry(entry.read_volatile());
                    if pte.present() {
                        if pte.kind() == EntryKind::Unique {
                            push_free_page(pte.base());
                        }
                        entry.write_volatile(0);
                    }
                });
            }
        }

        cursor += M_4K;
    }
}

// ══════════════════════════════════════════════════════════════
//  User app images
// ══════════════════════════════════════════════════════════════

pub const FOS_MAX_APP_AREAS: usize = 8;

/// The layout of a `UserApp` as user space hands it to `exec`. All
/// pointers inside are addresses in the calling process.
#[derive(Clone, Copy)]
#[repr(C)]
pub struct RawUserApp {
    pub entry: u32,
    pub areas: [RawUserAppArea; FOS_MAX_APP_AREAS],
}

#[derive(Clone, Copy)]
#[repr(C)]
pub struct RawUserAppArea {
    pub occupied: u32,
    pub load_position: u32,
    pub area_size: u32,
    pub given: u32,
    pub given_size: u32,
    pub writable: u32,
}

/// One loadable area of a user app, with its initial contents (if any)
/// already pulled into kernel memory.
pub struct UserAppArea {
    pub load_position: u32,
    pub area_size: u32,
    pub given: Vec<u8>,
    pub writable: bool,
}

pub struct UserApp {
    pub entry: u32,
    pub areas: Vec<UserAppArea>,
}

impl UserApp {
    /// A single-area flat image: `bytes` loaded at `load_position`, entry
    /// at the first byte. Used for boot modules.
    pub fn flat(load_position: u32, bytes: Vec<u8>, area_size: u32) -> UserApp {
        UserApp {
            entry: load_position,
            areas: alloc::vec![UserAppArea {
                load_position,
                area_size,
                given: bytes,
                writable: true,
            }],
        }
    }

    /// Deep-copy an app description out of another address space,
    /// including every `given` buffer.
    pub fn copy_from_user(pd: PhysAddr, u_ua: UserPtr<RawUserApp>) -> OsResult<UserApp> {
        let raw = u_ua.read(pd).map_err(|e| e.user_error())?;

        let mut areas = Vec::new();
        for ra in raw.areas.iter().filter(|a| a.occupied != 0) {
            let mut given = Vec::new();
            if ra.given_size > 0 {
                if ra.given_size > ra.area_size {
                    return Err(FosError::InvalidRange);
                }
                given.resize(ra.given_size as usize, 0);
                copy_from_user(pd, ra.given, &mut given).map_err(|e| e.user_error())?;
            }

            areas.push(UserAppArea {
                load_position: ra.load_position,
                area_size: ra.area_size,
                given,
                writable: ra.writable != 0,
            });
        }

        Ok(UserApp {
            entry: raw.entry,
            areas,
        })
    }

    /// Check the rules every loadable image must satisfy before any page
    /// is touched.
    pub fn validate(&self) -> OsResult {
        if self.areas.is_empty() || self.areas.len() > FOS_MAX_APP_AREAS {
            return Err(FosError::BadArgs);
        }

        let mut entry_valid = false;
        for area in &self.areas {
            if area.area_size == 0 {
                return Err(FosError::InvalidRange);
            }
            if !is_aligned(area.load_position, M_4K) {
                return Err(FosError::AlignError);
            }

            let start = area.load_position;
            let end = match start.checked_add(area.area_size) {
                Some(e) => e,
                None => return Err(FosError::InvalidRange),
            };
            if start < APP_AREA_START || end > APP_AREA_END {
                return Err(FosError::InvalidRange);
            }

            if area.given.len() as u32 > area.area_size {
                return Err(FosError::InvalidRange);
            }

            if start <= self.entry && self.entry < end {
                entry_valid = true;
            }
        }

        if !entry_valid {
            return Err(FosError::InvalidRange);
        }

        Ok(())
    }
}

/// Build a fresh user address space holding `ua` plus an optional args
/// block at the canonical args area.
///
/// The template is a deep copy of the kernel directory, so the identity
/// region and scratch windows resolve identically. Any failure tears the
/// whole directory back down. Area overlap surfaces as
/// `ALREADY_ALLOCATED` from the page mapper.
pub fn new_user_app_pd(ua: &UserApp, abs_args: &[u8]) -> OsResult<PhysAddr> {
    ua.validate()?;

    if abs_args.len() as u32 > APP_ARGS_AREA_SIZE {
        return Err(FosError::BadArgs);
    }

    let new_pd = new_page_directory()?;

    let mut status: OsResult = Ok(());

    if !abs_args.is_empty() {
        let args_end = APP_ARGS_AREA_START + crate::util::align_up(abs_args.len() as u32, M_4K);
        let (_true_e, res) = alloc_pages(new_pd, true, APP_ARGS_AREA_START, args_end, false);
        status = res;

        if status.is_ok() {
            status = copy_to_user(new_pd, APP_ARGS_AREA_START, abs_args)
                .map_err(|e| e.user_error());
        }
    }

    for area in &ua.areas {
        if status.is_err() {
            break;
        }

        let alloc_end = area.load_position + crate::util::align_up(area.area_size, M_4K);
        let (_true_e, res) = alloc_pages(new_pd, true, area.load_position, alloc_end, false);
        status = res;

        if status.is_ok() && !area.given.is_empty() {
            status = copy_to_user(new_pd, area.load_position, &area.given)
                .map_err(|e| e.user_error());
        }

        let zero_len = area.area_size as usize - area.given.len();
        if status.is_ok() && zero_len > 0 {
            status = memset_user(
                new_pd,
                area.load_position + area.given.len() as u32,
                0,
                zero_len,
            )
            .map_err(|e| e.user_error());
        }
    }

    if let Err(e) = status {
        delete_page_directory(new_pd);
        return Err(e);
    }

    Ok(new_pd)
}

/// 4K-align a faulting address down to the page that must back it.
pub fn fault_page_base(cr2: u32) -> u32 {
    align_down(cr2, M_4K)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn app(entry: u32, areas: Vec<UserAppArea>) -> UserApp {
        UserApp { entry, areas }
    }

    fn area(pos: u32, size: u32, given: usize) -> UserAppArea {
        UserAppArea {
            load_position: pos,
            area_size: size,
            given: alloc::vec![0xAB; given],
            writable: true,
        }
    }

    #[test]
    fn validate_accepts_simple_image() {
        let ua = app(APP_AREA_START + 4, alloc::vec![area(APP_AREA_START, 0x2000, 0x100)]);
        assert!(ua.validate().is_ok());
    }

    #[test]
    fn validate_rejects_empty_area() {
        let ua = app(APP_AREA_START, alloc::vec![area(APP_AREA_START, 0, 0)]);
        assert_eq!(ua.validate(), Err(FosError::InvalidRange));
    }

    #[test]
    fn validate_rejects_misaligned_load() {
        let ua = app(
            APP_AREA_START + 0x10,
            alloc::vec![area(APP_AREA_START + 0x10, 0x1000, 0)],
        );
        assert_eq!(ua.validate(), Err(FosError::AlignError));
    }

    #[test]
    fn validate_rejects_out_of_area() {
        let ua = app(APP_AREA_START, alloc::vec![area(APP_AREA_START - M_4K, 0x1000, 0)]);
        assert_eq!(ua.validate(), Err(FosError::InvalidRange));

        let ua = app(APP_AREA_END - M_4K, alloc::vec![area(APP_AREA_END - M_4K, 0x2000, 0)]);
        assert_eq!(ua.validate(), Err(FosError::InvalidRange));
    }

    #[test]
    fn validate_rejects_entry_outside_areas() {
        let ua = app(APP_AREA_START + 0x5000, alloc::vec![area(APP_AREA_START, 0x1000, 0)]);
        assert_eq!(ua.validate(), Err(FosError::InvalidRange));
    }

    #[test]
    fn validate_rejects_oversized_given() {
        let ua = app(APP_AREA_START, alloc::vec![area(APP_AREA_START, 0x100, 0x200)]);
        assert_eq!(ua.validate(), Err(FosError::InvalidRange));
    }

    #[test]
    fn fault_page_base_aligns_down() {
        assert_eq!(fault_page_base(0xB3FF_FF84), 0xB3FF_F000);
        assert_eq!(fault_page_base(0xB3FF_F000), 0xB3FF_F000);
    }
}
