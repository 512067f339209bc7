//! FAT32 device layer.
//!
//! Sits between a 512-byte-sector block device and the filesystem proper,
//! exposing cluster-chain operations. The FAT's top nibble is reserved
//! and masked on every slot access; FAT redundancy is handled by copying
//! FAT 0 over the others on sync.

pub mod dir;
pub mod file_sys;

use super::block::{BlockDevice, SECTOR_SIZE};
use crate::syscall::error::{FosError, OsResult};
use crate::util::Rng;
use alloc::boxed::Box;
use bit_field::BitField;

pub const FAT32_MASK: u32 = 0x0FFF_FFFF;
pub const FAT32_EOC: u32 = 0x0FFF_FFF8;
pub const FAT32_BAD_CLUSTER: u32 = 0x0FFF_FFF7;

pub const FAT32_SLOTS_PER_FAT_SECTOR: u32 = (SECTOR_SIZE / 4) as u32;

/// Maximum long-filename length in characters.
pub const FAT32_MAX_FN_LEN: usize = 255;

pub fn is_eoc(val: u32) -> bool {
    (val & FAT32_MASK) >= FAT32_EOC
}

// ══════════════════════════════════════════════════════════════
//  Dates and times
// ══════════════════════════════════════════════════════════════

/// [0:4] day of month (1-31), [5:8] month (1-12), [9:15] years from 1980.
pub type Fat32Date = u16;

/// [0:4] seconds/2, [5:10] minutes, [11:15] hours.
pub type Fat32Time = u16;

pub fn fat32_date(month: u8, day: u8, year: u8) -> Fat32Date {
    let mut d: u16 = 0;
    d.set_bits(0..5, day as u16);
    d.set_bits(5..9, month as u16);
    d.set_bits(9..16, year as u16);
    d
}

pub fn fat32_time(hours: u8, mins: u8, secs: u8) -> Fat32Time {
    let mut t: u16 = 0;
    t.set_bits(0..5, (secs / 2) as u16);
    t.set_bits(5..11, mins as u16);
    t.set_bits(11..16, hours as u16);
    t
}

/// The timestamp stamped on writes. There is no RTC driver; every write
/// carries the same build-era date.
pub fn default_write_stamp() -> (Fat32Date, Fat32Time) {
    (fat32_date(1, 1, 45), fat32_time(12, 0, 0))
}

/// Standard FAT short-filename checksum over the 11 name bytes.
pub fn fat32_checksum(short_fn: &[u8; 11]) -> u8 {
    let mut sum: u8 = 0;
    for &b in short_fn {
        sum = ((sum & 1) << 7).wrapping_add(sum >> 1).wrapping_add(b);
    }
    sum
}

// ══════════════════════════════════════════════════════════════
//  Little-endian field helpers
// ══════════════════════════════════════════════════════════════

fn get_u16(buf: &[u8], off: usize) -> u16 {
    u16::from_le_bytes([buf[off], buf[off + 1]])
}

fn get_u32(buf: &[u8], off: usize) -> u32 {
    u32::from_le_bytes([buf[off], buf[off + 1], buf[off + 2], buf[off + 3]])
}

fn put_u16(buf: &mut [u8], off: usize, val: u16) {
    buf[off..off + 2].copy_from_slice(&val.to_le_bytes());
}

fn put_u32(buf: &mut [u8], off: usize, val: u32) {
    buf[off..off + 4].copy_from_slice(&val.to_le_bytes());
}

// ══════════════════════════════════════════════════════════════
//  Formatting
// ══════════════════════════════════════════════════════════════

/// Sectors per FAT such that the FAT can describe every data cluster of
/// the partition.
pub fn compute_sectors_per_fat(
    total_sectors: u32,
    reserved_sectors: u16,
    fat_copies: u8,
    sectors_per_cluster: u8,
) -> u32 {
    let spc = sectors_per_cluster as u32;
    let fats = fat_copies as u32;

    // spf * 128 slots must cover (data sectors / spc) clusters plus the
    // two reserved slots.
    let numer = total_sectors - reserved_sectors as u32 + 2 * spc;
    let denom = FAT32_SLOTS_PER_FAT_SECTOR * spc + fats;
    (numer + denom - 1) / denom
}

const RESERVED_SECTORS: u16 = 2;
const NUM_FATS: u8 = 2;
const ROOT_DIR_CLUSTER: u32 = 2;

/// Lay a fresh FAT32 filesystem onto `[offset, offset + num_sectors)` of
/// `bd`: boot sector, FS-info sector, mirrored FATs, and a root directory
/// holding its own `.` entry.
pub fn init_fat32(
    bd: &mut dyn BlockDevice,
    offset: u32,
    num_sectors: u32,
    sectors_per_cluster: u32,
) -> OsResult {
    if !sectors_per_cluster.is_power_of_two() || sectors_per_cluster > 128 {
        return Err(FosError::BadArgs);
    }
    if offset + num_sectors > bd.num_sectors() {
        return Err(FosError::InvalidRange);
    }

    let spc = sectors_per_cluster as u8;
    let spf = compute_sectors_per_fat(num_sectors, RESERVED_SECTORS, NUM_FATS, spc);

    if RESERVED_SECTORS as u32 + NUM_FATS as u32 * spf + sectors_per_cluster >= num_sectors {
        return Err(FosError::NoSpace);
    }

    // Boot sector: BPB 2.0 + 3.31 + the FAT32 EBPB.
    let mut boot = [0u8; SECTOR_SIZE];
    boot[0] = 0xEB; // jmp short
    boot[1] = 0x3C;
    boot[2] = 0x90;
    boot[3..11].copy_from_slice(b"FERNOS  ");
    put_u16(&mut boot, 11, SECTOR_SIZE as u16);
    boot[13] = spc;
    put_u16(&mut boot, 14, RESERVED_SECTORS);
    boot[16] = NUM_FATS;
    put_u16(&mut boot, 17, 0); // no FAT12/16 root entries
    put_u16(&mut boot, 19, 0); // small sector count unused
    boot[21] = 0xF8; // media descriptor: fixed disk
    put_u16(&mut boot, 22, 0); // sectors per FAT lives in the EBPB
    put_u16(&mut boot, 24, 1); // sectors per track (LBA)
    put_u16(&mut boot, 26, 1); // heads (LBA)
    put_u32(&mut boot, 28, offset);
    put_u32(&mut boot, 32, num_sectors);
    put_u32(&mut boot, 36, spf);
    put_u16(&mut boot, 40, 0); // ext flags: mirroring on
    put_u16(&mut boot, 42, 0); // version 0.0
    put_u32(&mut boot, 44, ROOT_DIR_CLUSTER);
    put_u16(&mut boot, 48, 1); // FS-info sector
    put_u16(&mut boot, 50, 0); // no boot backup
    boot[64] = 0x80; // drive number
    boot[66] = 0x29; // extended boot signature
    put_u32(&mut boot, 67, 0x0FE0_05F5); // serial
    boot[71..82].copy_from_slice(b"FERNOS     ");
    boot[82..90].copy_from_slice(b"FAT32   ");
    boot[510] = 0x55;
    boot[511] = 0xAA;
    bd.write_sectors(offset, 1, &boot)?;

    // FS-info sector.
    let mut info = [0u8; SECTOR_SIZE];
    put_u32(&mut info, 0, 0x4161_5252);
    put_u32(&mut info, 484, 0x6141_7272);
    put_u32(&mut info, 488, 0xFFFF_FFFF); // free count unknown
    put_u32(&mut info, 492, ROOT_DIR_CLUSTER);
    put_u32(&mut info, 508, 0xAA55_0000);
    bd.write_sectors(offset + 1, 1, &info)?;

    // FATs: slots 0/1 reserved, slot 2 terminates the root directory.
    let zero = [0u8; SECTOR_SIZE];
    for fat in 0..NUM_FATS as u32 {
        let fat_start = offset + RESERVED_SECTORS as u32 + fat * spf;
        for s in 0..spf {
            bd.write_sectors(fat_start + s, 1, &zero)?;
        }

        let mut first = [0u8; SECTOR_SIZE];
        put_u32(&mut first, 0, 0x0FFF_FFF8);
        put_u32(&mut first, 4, 0xFFFF_FFFF);
        put_u32(&mut first, 8, FAT32_EOC);
        bd.write_sectors(fat_start, 1, &first)?;
    }

    // Root directory: a `.` self entry, then the terminator.
    let data_start = offset + RESERVED_SECTORS as u32 + NUM_FATS as u32 * spf;
    for s in 0..sectors_per_cluster {
        bd.write_sectors(data_start + s, 1, &zero)?;
    }

    let mut self_entry = [0u8; 32];
    self_entry[0..11].copy_from_slice(b".          ");
    self_entry[11] = dir::DirAttrs::SUBDIR.bits();
    put_u16(&mut self_entry, 20, (ROOT_DIR_CLUSTER >> 16) as u16);
    put_u16(&mut self_entry, 26, ROOT_DIR_CLUSTER as u16);
    bd.write_piece(data_start, 0, &self_entry)?;

    bd.flush()
}

// ══════════════════════════════════════════════════════════════
//  The device
// ══════════════════════════════════════════════════════════════

pub struct Fat32Device {
    bd: Box<dyn BlockDevice>,

    /// Partition start within the block device; every other offset below
    /// is relative to it.
    bd_offset: u32,
    num_sectors: u32,

    fat_offset: u32,
    num_fats: u8,
    sectors_per_fat: u32,
    data_offset: u32,
    sectors_per_cluster: u8,
    num_fat_slots: u32,
    root_dir_cluster: u32,

    rng: Rng,

    /// Recently discovered free FAT slots, refilled by random darts.
    free_q: [u32; FAT32_SLOTS_PER_FAT_SECTOR as usize],
    free_q_fill: usize,
}

impl Fat32Device {
    /// Parse and validate the FAT32 partition starting at `offset`.
    pub fn parse(mut bd: Box<dyn BlockDevice>, offset: u32, seed: u64) -> OsResult<Fat32Device> {
        let mut boot = [0u8; SECTOR_SIZE];
        bd.read_sectors(offset, 1, &mut boot)?;

        if boot[510] != 0x55 || boot[511] != 0xAA {
            return Err(FosError::StateMismatch);
        }
        if get_u16(&boot, 11) as usize != SECTOR_SIZE {
            return Err(FosError::StateMismatch);
        }

        let spc = boot[13];
        if !spc.is_power_of_two() {
            return Err(FosError::StateMismatch);
        }

        let reserved = get_u16(&boot, 14);
        if reserved < 2 {
            return Err(FosError::StateMismatch);
        }

        let num_fats = boot[16];
        if num_fats == 0 {
            return Err(FosError::StateMismatch);
        }

        // FAT32 keeps its FAT size in the EBPB; the small field must be 0.
        if get_u16(&boot, 22) != 0 {
            return Err(FosError::StateMismatch);
        }
        let spf = get_u32(&boot, 36);

        let small_total = get_u16(&boot, 19);
        let num_sectors = if small_total != 0 {
            small_total as u32
        } else {
            get_u32(&boot, 32)
        };

        let root_dir_cluster = get_u32(&boot, 44);

        // The FS-info sector carries three fixed signatures.
        let fs_info_sector = get_u16(&boot, 48) as u32;
        let mut info = [0u8; SECTOR_SIZE];
        bd.read_sectors(offset + fs_info_sector, 1, &mut info)?;
        if get_u32(&info, 0) != 0x4161_5252
            || get_u32(&info, 484) != 0x6141_7272
            || get_u32(&info, 508) != 0xAA55_0000
        {
            return Err(FosError::StateMismatch);
        }

        let data_offset = reserved as u32 + num_fats as u32 * spf;
        if data_offset >= num_sectors {
            return Err(FosError::StateMismatch);
        }

        let data_clusters = (num_sectors - data_offset) / spc as u32;
        let num_fat_slots = (data_clusters + 2).min(spf * FAT32_SLOTS_PER_FAT_SECTOR);

        Ok(Fat32Device {
            bd,
            bd_offset: offset,
            num_sectors,
            fat_offset: reserved as u32,
            num_fats,
            sectors_per_fat: spf,
            data_offset,
            sectors_per_cluster: spc,
            num_fat_slots,
            root_dir_cluster,
            rng: Rng::new(seed),
            free_q: [0; FAT32_SLOTS_PER_FAT_SECTOR as usize],
            free_q_fill: 0,
        })
    }

    pub fn root_dir_cluster(&self) -> u32 {
        self.root_dir_cluster
    }

    /// A value in `[0, bound)` from the device's dart generator.
    pub fn rng_next(&mut self, bound: u32) -> u32 {
        self.rng.next_bounded(bound)
    }

    pub fn cluster_size(&self) -> usize {
        SECTOR_SIZE * self.sectors_per_cluster as usize
    }

    pub fn sectors_per_cluster(&self) -> u32 {
        self.sectors_per_cluster as u32
    }

    pub fn flush(&mut self) -> OsResult {
        self.bd.flush()
    }

    /// Absolute sector of `cluster`'s first sector.
    fn cluster_sector(&self, cluster: u32) -> u32 {
        self.bd_offset + self.data_offset + (cluster - 2) * self.sectors_per_cluster as u32
    }

    // ──────────────────────────────────────────────────────────
    //  FAT slots
    // ──────────────────────────────────────────────────────────

    pub fn get_fat_slot(&mut self, slot: u32) -> OsResult<u32> {
        if slot >= self.num_fat_slots {
            return Err(FosError::InvalidIndex);
        }
        let sector = self.bd_offset + self.fat_offset + slot / FAT32_SLOTS_PER_FAT_SECTOR;
        let mut raw = [0u8; 4];
        self.bd
            .read_piece(sector, (slot % FAT32_SLOTS_PER_FAT_SECTOR) as usize * 4, &mut raw)?;
        Ok(u32::from_le_bytes(raw) & FAT32_MASK)
    }

    /// Writes `val` into slot `slot` of FAT 0, preserving the reserved
    /// top nibble already on disk.
    pub fn set_fat_slot(&mut self, slot: u32, val: u32) -> OsResult {
        if slot >= self.num_fat_slots {
            return Err(FosError::InvalidIndex);
        }
        let sector = self.bd_offset + self.fat_offset + slot / FAT32_SLOTS_PER_FAT_SECTOR;
        let off = (slot % FAT32_SLOTS_PER_FAT_SECTOR) as usize * 4;

        let mut raw = [0u8; 4];
        self.bd.read_piece(sector, off, &mut raw)?;
        let merged = (u32::from_le_bytes(raw) & !FAT32_MASK) | (val & FAT32_MASK);
        self.bd.write_piece(sector, off, &merged.to_le_bytes())
    }

    /// Copy FAT 0 over FATs 1..n.
    pub fn sync_fats(&mut self) -> OsResult {
        let mut buf = [0u8; SECTOR_SIZE];
        for s in 0..self.sectors_per_fat {
            self.bd.read_sectors(self.bd_offset + self.fat_offset + s, 1, &mut buf)?;
            for fat in 1..self.num_fats as u32 {
                let dst = self.bd_offset + self.fat_offset + fat * self.sectors_per_fat + s;
                self.bd.write_sectors(dst, 1, &buf)?;
            }
        }
        Ok(())
    }

    /// Pop a free slot, marking it EOC before handing it out. Free slots
    /// are found by throwing random darts at FAT sectors and scanning
    /// whichever sector the dart hits.
    pub fn pop_free_fat_slot(&mut self) -> OsResult<u32> {
        if self.free_q_fill == 0 {
            self.refill_free_q()?;
        }
        if self.free_q_fill == 0 {
            return Err(FosError::NoSpace);
        }

        self.free_q_fill -= 1;
        let slot = self.free_q[self.free_q_fill];

        self.set_fat_slot(slot, FAT32_EOC)?;
        Ok(slot)
    }

    /// Throw random darts at FAT sectors; whichever sector a dart hits is
    /// scanned whole. A few misses fall back to a linear sweep so
    /// exhaustion is decided by the full FAT, not by luck.
    fn refill_free_q(&mut self) -> OsResult {
        const DARTS: u32 = 4;

        let fat_sectors = (self.num_fat_slots + FAT32_SLOTS_PER_FAT_SECTOR - 1)
            / FAT32_SLOTS_PER_FAT_SECTOR;

        for attempt in 0..(DARTS + fat_sectors) {
            let sector_idx = if attempt < DARTS {
                self.rng.next_bounded(fat_sectors)
            } else {
                attempt - DARTS
            };

            self.scan_fat_sector_for_free(sector_idx)?;
            if self.free_q_fill > 0 {
                return Ok(());
            }
        }

        Ok(())
    }

    fn scan_fat_sector_for_free(&mut self, sector_idx: u32) -> OsResult {
        let mut buf = [0u8; SECTOR_SIZE];
        self.bd
            .read_sectors(self.bd_offset + self.fat_offset + sector_idx, 1, &mut buf)?;

        for i in 0..FAT32_SLOTS_PER_FAT_SECTOR {
            let slot = sector_idx * FAT32_SLOTS_PER_FAT_SECTOR + i;
            if slot < 2 || slot >= self.num_fat_slots {
                continue;
            }
            if get_u32(&buf, i as usize * 4) & FAT32_MASK == 0 {
                self.free_q[self.free_q_fill] = slot;
                self.free_q_fill += 1;
                if self.free_q_fill == self.free_q.len() {
                    break;
                }
            }
        }

        Ok(())
    }

    // ──────────────────────────────────────────────────────────
    //  Chains
    // ──────────────────────────────────────────────────────────

    /// Allocate a fresh chain of `len` clusters. All-or-nothing: running
    /// out of space frees whatever was claimed and reports `NO_SPACE`.
    pub fn new_chain(&mut self, len: u32) -> OsResult<u32> {
        if len == 0 {
            return Err(FosError::BadArgs);
        }

        let start = self.pop_free_fat_slot()?;
        let mut tail = start;

        for _ in 1..len {
            match self.pop_free_fat_slot() {
                Ok(next) => {
                    self.set_fat_slot(tail, next)?;
                    tail = next;
                }
                Err(FosError::NoSpace) => {
                    self.free_chain(start)?;
                    return Err(FosError::NoSpace);
                }
                Err(e) => return Err(e),
            }
        }

        Ok(start)
    }

    /// Number of clusters in the chain at `start`.
    pub fn chain_len(&mut self, start: u32) -> OsResult<u32> {
        let mut len = 0;
        let mut slot = start;
        loop {
            len += 1;
            let val = self.get_fat_slot(slot)?;
            if is_eoc(val) {
                return Ok(len);
            }
            if val < 2 || val == FAT32_BAD_CLUSTER || val >= self.num_fat_slots {
                return Err(FosError::StateMismatch);
            }
            slot = val;
        }
    }

    /// Walk `offset` links down the chain. `INVALID_INDEX` when the chain
    /// ends first.
    pub fn traverse_chain(&mut self, start: u32, offset: u32) -> OsResult<u32> {
        let mut slot = start;
        for _ in 0..offset {
            let val = self.get_fat_slot(slot)?;
            if is_eoc(val) {
                return Err(FosError::InvalidIndex);
            }
            if val < 2 || val >= self.num_fat_slots {
                return Err(FosError::StateMismatch);
            }
            slot = val;
        }
        Ok(slot)
    }

    /// Zero out every slot of the chain at `start`.
    pub fn free_chain(&mut self, start: u32) -> OsResult {
        let mut slot = start;
        loop {
            let val = self.get_fat_slot(slot)?;
            self.set_fat_slot(slot, 0)?;
            if is_eoc(val) {
                return Ok(());
            }
            if val < 2 || val >= self.num_fat_slots {
                return Err(FosError::StateMismatch);
            }
            slot = val;
        }
    }

    /// Grow or shrink the chain at `start` to exactly `new_len` clusters.
    /// `new_len == 0` frees the whole chain. A failed grow rolls back to
    /// the original length.
    pub fn resize_chain(&mut self, start: u32, new_len: u32) -> OsResult {
        if new_len == 0 {
            return self.free_chain(start);
        }

        let len = self.chain_len(start)?;

        if new_len < len {
            let new_tail = self.traverse_chain(start, new_len - 1)?;
            let cut = self.get_fat_slot(new_tail)?;
            self.set_fat_slot(new_tail, FAT32_EOC)?;
            return self.free_chain(cut);
        }

        if new_len > len {
            let old_tail = self.traverse_chain(start, len - 1)?;
            match self.new_chain(new_len - len) {
                Ok(ext) => {
                    self.set_fat_slot(old_tail, ext)?;
                }
                Err(e) => return Err(e),
            }
        }

        Ok(())
    }

    // ──────────────────────────────────────────────────────────
    //  Chain I/O
    // ──────────────────────────────────────────────────────────

    /// Absolute sector of the `sector_offset`-th sector of the chain at
    /// `start`, following FAT links as needed. `INVALID_RANGE` past the
    /// end of the chain.
    fn chain_sector(&mut self, start: u32, sector_offset: u32) -> OsResult<u32> {
        let spc = self.sectors_per_cluster as u32;
        let cluster = match self.traverse_chain(start, sector_offset / spc) {
            Ok(c) => c,
            Err(FosError::InvalidIndex) => return Err(FosError::InvalidRange),
            Err(e) => return Err(e),
        };
        Ok(self.cluster_sector(cluster) + sector_offset % spc)
    }

    /// Read `num_sectors` sectors of the chain at `start`, beginning
    /// `sector_offset` sectors in.
    pub fn read(
        &mut self,
        start: u32,
        sector_offset: u32,
        num_sectors: u32,
        dst: &mut [u8],
    ) -> OsResult {
        if dst.len() < num_sectors as usize * SECTOR_SIZE {
            return Err(FosError::BadArgs);
        }

        for s in 0..num_sectors {
            let abs = self.chain_sector(start, sector_offset + s)?;
            let chunk = &mut dst[s as usize * SECTOR_SIZE..(s as usize + 1) * SECTOR_SIZE];
            self.bd.read_sectors(abs, 1, chunk)?;
        }

        Ok(())
    }

    /// Write `num_sectors` sectors of the chain at `start`.
    pub fn write(
        &mut self,
        start: u32,
        sector_offset: u32,
        num_sectors: u32,
        src: &[u8],
    ) -> OsResult {
        if src.len() < num_sectors as usize * SECTOR_SIZE {
            return Err(FosError::BadArgs);
        }

        for s in 0..num_sectors {
            let abs = self.chain_sector(start, sector_offset + s)?;
            let chunk = &src[s as usize * SECTOR_SIZE..(s as usize + 1) * SECTOR_SIZE];
            self.bd.write_sectors(abs, 1, chunk)?;
        }

        Ok(())
    }

    /// Read bytes from a single sector of a chain.
    pub fn read_piece(
        &mut self,
        start: u32,
        sector_offset: u32,
        byte_offset: u32,
        dst: &mut [u8],
    ) -> OsResult {
        let spc = self.sectors_per_cluster as u32;
        let cluster = self.traverse_chain(start, sector_offset / spc)?;
        let abs = self.cluster_sector(cluster) + sector_offset % spc;
        self.bd.read_piece(abs, byte_offset as usize, dst)
    }

    /// Write bytes into a single sector of a chain.
    pub fn write_piece(
        &mut self,
        start: u32,
        sector_offset: u32,
        byte_offset: u32,
        src: &[u8],
    ) -> OsResult {
        let spc = self.sectors_per_cluster as u32;
        let cluster = self.traverse_chain(start, sector_offset / spc)?;
        let abs = self.cluster_sector(cluster) + sector_offset % spc;
        self.bd.write_piece(abs, byte_offset as usize, src)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fs::block::MemBlockDevice;

    pub(super) fn fresh_device(sectors: u32, spc: u32) -> Fat32Device {
        let mut bd = MemBlockDevice::new(sectors);
        init_fat32(&mut bd, 0, sectors, spc).unwrap();
        Fat32Device::parse(Box::new(bd), 0, 0xF00D).unwrap()
    }

    #[test]
    fn format_then_parse() {
        let dev = fresh_device(4096, 2);
        assert_eq!(dev.root_dir_cluster(), 2);
        assert_eq!(dev.cluster_size(), 1024);
    }

    #[test]
    fn parse_rejects_garbage() {
        let bd = MemBlockDevice::new(64);
        assert!(Fat32Device::parse(Box::new(bd), 0, 1).is_err());
    }

    #[test]
    fn slot_top_nibble_is_preserved() {
        let mut dev = fresh_device(4096, 1);
        // Slot 0 was formatted with 0x0FFFFFF8 under media-descriptor
        // high bits; writing it back must not clobber the top nibble.
        dev.set_fat_slot(5, 0xFFFF_FFFF).unwrap();
        assert_eq!(dev.get_fat_slot(5).unwrap(), FAT32_MASK);
        dev.set_fat_slot(5, 0).unwrap();
        assert_eq!(dev.get_fat_slot(5).unwrap(), 0);
    }

    #[test]
    fn chain_allocate_traverse_free() {
        let mut dev = fresh_device(4096, 1);

        let start = dev.new_chain(5).unwrap();
        assert_eq!(dev.chain_len(start).unwrap(), 5);

        // The invariant the rest of the stack leans on: the last in-range
        // traverse lands on a real slot, one further is out of range.
        let tail = dev.traverse_chain(start, 4).unwrap();
        assert!(is_eoc(dev.get_fat_slot(tail).unwrap()));
        assert_eq!(dev.traverse_chain(start, 5), Err(FosError::InvalidIndex));

        dev.free_chain(start).unwrap();
        assert_eq!(dev.get_fat_slot(start).unwrap(), 0);
    }

    #[test]
    fn chain_resize_grow_and_shrink() {
        let mut dev = fresh_device(4096, 1);

        let start = dev.new_chain(2).unwrap();
        dev.resize_chain(start, 6).unwrap();
        assert_eq!(dev.chain_len(start).unwrap(), 6);

        dev.resize_chain(start, 3).unwrap();
        assert_eq!(dev.chain_len(start).unwrap(), 3);
        let tail = dev.traverse_chain(start, 2).unwrap();
        assert!(is_eoc(dev.get_fat_slot(tail).unwrap()));
    }

    #[test]
    fn chain_exhaustion_leaves_device_unchanged() {
        // Tiny partition: few data clusters.
        let mut dev = fresh_device(96, 1);

        // Count what is actually free by allocating one-at-a-time.
        let mut chains = alloc::vec::Vec::new();
        loop {
            match dev.new_chain(1) {
                Ok(c) => chains.push(c),
                Err(FosError::NoSpace) => break,
                Err(e) => panic!("unexpected error {:?}", e),
            }
        }
        let free_total = chains.len() as u32;
        for c in chains {
            dev.free_chain(c).unwrap();
        }

        // Asking for more than exists must fail without consuming any.
        assert_eq!(dev.new_chain(free_total + 1), Err(FosError::NoSpace));

        let mut again = 0;
        loop {
            match dev.new_chain(1) {
                Ok(_) => again += 1,
                Err(FosError::NoSpace) => break,
                Err(e) => panic!("unexpected error {:?}", e),
            }
        }
        assert_eq!(again, free_total);
    }

    #[test]
    fn sector_write_read_round_trip() {
        let mut dev = fresh_device(4096, 2);
        let chain = dev.new_chain(3).unwrap(); // 6 sectors

        let mut data = alloc::vec![0u8; 4 * SECTOR_SIZE];
        for (i, b) in data.iter_mut().enumerate() {
            *b = (i % 251) as u8;
        }

        dev.write(chain, 1, 4, &data).unwrap();
        let mut out = alloc::vec![0u8; 4 * SECTOR_SIZE];
        dev.read(chain, 1, 4, &mut out).unwrap();
        assert_eq!(data, out);

        // Past the chain end.
        assert_eq!(
            dev.read(chain, 5, 2, &mut out[..2 * SECTOR_SIZE]),
            Err(FosError::InvalidRange)
        );
    }

    #[test]
    fn piece_round_trip() {
        let mut dev = fresh_device(4096, 1);
        let chain = dev.new_chain(2).unwrap();

        dev.write_piece(chain, 1, 37, b"fern").unwrap();
        let mut out = [0u8; 4];
        dev.read_piece(chain, 1, 37, &mut out).unwrap();
        assert_eq!(&out, b"fern");
    }

    #[test]
    fn fats_stay_in_sync() {
        let mut dev = fresh_device(1024, 1);
        let chain = dev.new_chain(4).unwrap();
        dev.sync_fats().unwrap();

        // Read FAT 1 directly and compare the chain's slots.
        let spf = dev.sectors_per_fat;
        let mut fat0 = alloc::vec![0u8; (spf as usize) * SECTOR_SIZE];
        let mut fat1 = alloc::vec![0u8; (spf as usize) * SECTOR_SIZE];
        dev.bd.read_sectors(dev.fat_offset, spf, &mut fat0).unwrap();
        dev.bd
            .read_sectors(dev.fat_offset + spf, spf, &mut fat1)
            .unwrap();
        assert_eq!(fat0, fat1);

        let _ = chain;
    }

    #[test]
    fn checksum_matches_reference() {
        // Reference value computed with the canonical algorithm for
        // "README  TXT".
        let name = *b"README  TXT";
        let mut sum: u8 = 0;
        for &b in name.iter() {
            sum = ((sum & 1) << 7).wrapping_add(sum >> 1).wrapping_add(b);
        }
        assert_eq!(fat32_checksum(&name), sum);
    }
}
