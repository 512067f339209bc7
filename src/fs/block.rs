//! The block-device seam.
//!
//! The filesystem is written against this trait; the real ATA PIO driver
//! lives behind it, and `MemBlockDevice` backs the boot ramdisk and the
//! test suite.

use crate::syscall::error::{FosError, OsResult};
use alloc::vec::Vec;

pub const SECTOR_SIZE: usize = 512;

pub trait BlockDevice: Send {
    fn num_sectors(&self) -> u32;

    /// Read `count` whole sectors starting at `sector` into `dst`
    /// (`count * SECTOR_SIZE` bytes).
    fn read_sectors(&mut self, sector: u32, count: u32, dst: &mut [u8]) -> OsResult;

    /// Write `count` whole sectors starting at `sector` from `src`.
    fn write_sectors(&mut self, sector: u32, count: u32, src: &[u8]) -> OsResult;

    /// Read `dst.len()` bytes from within one sector. `offset + dst.len()`
    /// must stay inside the sector.
    fn read_piece(&mut self, sector: u32, offset: usize, dst: &mut [u8]) -> OsResult {
        if offset + dst.len() > SECTOR_SIZE {
            return Err(FosError::InvalidRange);
        }
        let mut buf = [0u8; SECTOR_SIZE];
        self.read_sectors(sector, 1, &mut buf)?;
        dst.copy_from_slice(&buf[offset..offset + dst.len()]);
        Ok(())
    }

    /// Write `src.len()` bytes into one sector, read-modify-write.
    fn write_piece(&mut self, sector: u32, offset: usize, src: &[u8]) -> OsResult {
        if offset + src.len() > SECTOR_SIZE {
            return Err(FosError::InvalidRange);
        }
        let mut buf = [0u8; SECTOR_SIZE];
        self.read_sectors(sector, 1, &mut buf)?;
        buf[offset..offset + src.len()].copy_from_slice(src);
        self.write_sectors(sector, 1, &buf)
    }

    fn flush(&mut self) -> OsResult {
        Ok(())
    }
}

/// RAM-backed block device.
pub struct MemBlockDevice {
    sectors: Vec<u8>,
    num_sectors: u32,
}

impl MemBlockDevice {
    pub fn new(num_sectors: u32) -> MemBlockDevice {
        MemBlockDevice {
            sectors: alloc::vec![0; num_sectors as usize * SECTOR_SIZE],
            num_sectors,
        }
    }

    fn range(&self, sector: u32, count: u32) -> Result<(usize, usize), FosError> {
        let end = sector.checked_add(count).ok_or(FosError::InvalidRange)?;
        if end > self.num_sectors {
            return Err(FosError::InvalidRange);
        }
        let start = sector as usize * SECTOR_SIZE;
        Ok((start, start + count as usize * SECTOR_SIZE))
    }
}

impl BlockDevice for MemBlockDevice {
    fn num_sectors(&self) -> u32 {
        self.num_sectors
    }

    fn read_sectors(&mut self, sector: u32, count: u32, dst: &mut [u8]) -> OsResult {
        let (start, end) = self.range(sector, count)?;
        if dst.len() < end - start {
            return Err(FosError::BadArgs);
        }
        dst[..end - start].copy_from_slice(&self.sectors[start..end]);
        Ok(())
    }

    fn write_sectors(&mut self, sector: u32, count: u32, src: &[u8]) -> OsResult {
        let (start, end) = self.range(sector, count)?;
        if src.len() < end - start {
            return Err(FosError::BadArgs);
        }
        self.sectors[start..end].copy_from_slice(&src[..end - start]);
        Ok(())
    }

    fn read_piece(&mut self, sector: u32, offset: usize, dst: &mut [u8]) -> OsResult {
        if offset + dst.len() > SECTOR_SIZE {
            return Err(FosError::InvalidRange);
        }
        let (start, _) = self.range(sector, 1)?;
        dst.copy_from_slice(&self.sectors[start + offset..start + offset + dst.len()]);
        Ok(())
    }

    fn write_piece(&mut self, sector: u32, offset: usize, src: &[u8]) -> OsResult {
        if offset + src.len() > SECTOR_SIZE {
            return Err(FosError::InvalidRange);
        }
        let (start, _) = self.range(sector, 1)?;
        self.sectors[start + offset..start + offset + src.len()].copy_from_slice(src);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sector_round_trip() {
        let mut bd = MemBlockDevice::new(8);
        let data = [0xABu8; SECTOR_SIZE * 2];
        bd.write_sectors(3, 2, &data).unwrap();

        let mut out = [0u8; SECTOR_SIZE * 2];
        bd.read_sectors(3, 2, &mut out).unwrap();
        assert_eq!(out[..], data[..]);
    }

    #[test]
    fn piece_round_trip() {
        let mut bd = MemBlockDevice::new(2);
        bd.write_piece(1, 100, b"hello").unwrap();

        let mut out = [0u8; 5];
        bd.read_piece(1, 100, &mut out).unwrap();
        assert_eq!(&out, b"hello");

        // Neighbouring bytes untouched.
        let mut full = [0u8; SECTOR_SIZE];
        bd.read_sectors(1, 1, &mut full).unwrap();
        assert_eq!(full[99], 0);
        assert_eq!(full[105], 0);
    }

    #[test]
    fn out_of_range_rejected() {
        let mut bd = MemBlockDevice::new(4);
        let mut buf = [0u8; SECTOR_SIZE];
        assert_eq!(bd.read_sectors(4, 1, &mut buf), Err(FosError::InvalidRange));
        assert_eq!(bd.read_piece(0, 510, &mut buf[..4]), Err(FosError::InvalidRange));
    }
}
