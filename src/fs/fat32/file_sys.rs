//! The `FileSys` implementation over a `Fat32Device`.
//!
//! Node keys are (parent directory cluster, SFN entry offset, first file
//! cluster); the root is the special key with a zero parent. Every file
//! and directory owns at least one cluster, so first clusters are stable
//! and unique, which is what makes the keys usable for interning.

use super::dir::{DirAttrs, DirEntry, LFN_CHARS_PER_ENTRY};
use super::{default_write_stamp, Fat32Device};
use crate::fs::block::SECTOR_SIZE;
use crate::fs::{is_valid_filename, is_valid_path, FileSys, NodeInfo, NodeKey};
use crate::syscall::error::{FosError, OsResult};
use alloc::boxed::Box;
use alloc::string::String;

pub struct Fat32FileSys {
    dev: Fat32Device,
}

impl Fat32FileSys {
    pub fn new(dev: Fat32Device) -> Fat32FileSys {
        Fat32FileSys { dev }
    }

    fn root(&self) -> NodeKey {
        NodeKey {
            dir_cluster: 0,
            sfn_entry: 0,
            node_cluster: self.dev.root_dir_cluster(),
            is_dir: true,
        }
    }

    /// Key for the child of `dir_cluster` whose SFN sits at `sfn_offset`.
    fn key_from_entry(&self, dir_cluster: u32, sfn_offset: u32, entry: &DirEntry) -> NodeKey {
        NodeKey {
            dir_cluster,
            sfn_entry: sfn_offset,
            node_cluster: entry.first_cluster(),
            is_dir: entry.is_dir(),
        }
    }

    /// Build the key of directory `cluster`, known to be reachable as a
    /// child of `parent_cluster` (scan for the sequence pointing at it).
    fn key_for_dir_cluster(&mut self, cluster: u32) -> OsResult<NodeKey> {
        if cluster == self.dev.root_dir_cluster() {
            return Ok(self.root());
        }

        // `..` of the directory names its parent.
        let (_, dotdot) = self
            .dev
            .find_child(cluster, "..")?
            .ok_or(FosError::StateMismatch)?;
        let mut parent_cluster = dotdot.first_cluster();
        if parent_cluster == 0 {
            // Conventionally 0 when the parent is the root.
            parent_cluster = self.dev.root_dir_cluster();
        }

        let mut off = 0;
        while let Some(seq) = self.dev.next_dir_seq(parent_cluster, off)? {
            let sfn_off = self.dev.get_dir_seq_sfn(parent_cluster, seq)?;
            let e = self.dev.read_dir_entry(parent_cluster, sfn_off)?;
            let sfn = e.sfn_string();
            if e.is_dir() && e.first_cluster() == cluster && sfn != "." && sfn != ".." {
                return Ok(self.key_from_entry(parent_cluster, sfn_off, &e));
            }
            off = sfn_off + 1;
        }

        Err(FosError::StateMismatch)
    }

    /// Walk `path` from `cwd`, resolving `.` and `..`. The final
    /// component may be anything; intermediate ones must be directories.
    fn resolve(&mut self, cwd: &NodeKey, path: &str) -> OsResult<NodeKey> {
        if !is_valid_path(path) {
            return Err(FosError::BadArgs);
        }

        let mut cur = if path.starts_with('/') {
            self.root()
        } else {
            cwd.clone()
        };

        for comp in path.split('/').filter(|c| !c.is_empty()) {
            if !cur.is_dir {
                return Err(FosError::StateMismatch);
            }

            match comp {
                "." => continue,
                ".." => {
                    if cur.is_root() {
                        continue;
                    }
                    let (_, dotdot) = self
                        .dev
                        .find_child(cur.node_cluster, "..")?
                        .ok_or(FosError::StateMismatch)?;
                    let mut parent = dotdot.first_cluster();
                    if parent == 0 {
                        parent = self.dev.root_dir_cluster();
                    }
                    cur = self.key_for_dir_cluster(parent)?;
                }
                name => {
                    let (sfn_off, e) = self
                        .dev
                        .find_child(cur.node_cluster, name)?
                        .ok_or(FosError::InvalidIndex)?;
                    cur = self.key_from_entry(cur.node_cluster, sfn_off, &e);
                }
            }
        }

        Ok(cur)
    }

    /// Split `path` into its parent directory (resolved) and final name.
    fn resolve_parent<'p>(&mut self, cwd: &NodeKey, path: &'p str) -> OsResult<(NodeKey, &'p str)> {
        if !is_valid_path(path) {
            return Err(FosError::BadArgs);
        }

        let trimmed = path.strip_suffix('/').unwrap_or(path);
        let (dir_part, name) = match trimmed.rfind('/') {
            Some(0) => ("/", &trimmed[1..]),
            Some(i) => (&trimmed[..i], &trimmed[i + 1..]),
            None => (".", trimmed),
        };

        if !is_valid_filename(name) || name == "." || name == ".." {
            return Err(FosError::BadArgs);
        }

        let parent = self.resolve(cwd, dir_part)?;
        if !parent.is_dir {
            return Err(FosError::StateMismatch);
        }

        Ok((parent, name))
    }

    /// A random 8-char short name (space-padded extension) not yet used
    /// in `dir_cluster`.
    fn gen_unique_sfn(&mut self, dir_cluster: u32, lfn: &str) -> OsResult<[u8; 11]> {
        const ALPHABET: &[u8] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZ0123456789";

        for _ in 0..64 {
            let mut name = [b' '; 11];
            for slot in name.iter_mut().take(8) {
                *slot = ALPHABET[self.dev.rng_next(ALPHABET.len() as u32) as usize];
            }

            match self.dev.check_names(dir_cluster, &name, Some(lfn)) {
                Ok(()) => return Ok(name),
                Err(FosError::InUse) => continue,
                Err(e) => return Err(e),
            }
        }

        // 64 straight collisions over 36^8 names means the directory is
        // not what we think it is.
        Err(FosError::UnknownError)
    }

    fn entries_for_name(name: &str) -> u32 {
        ((name.len() + LFN_CHARS_PER_ENTRY - 1) / LFN_CHARS_PER_ENTRY) as u32 + 1
    }

    /// Shared tail of touch/mkdir: allocate the chain, claim a run of
    /// directory entries, write the sequence. Rolls back on failure.
    fn create_node(&mut self, cwd: &NodeKey, path: &str, dir: bool) -> OsResult<NodeKey> {
        let (parent, name) = self.resolve_parent(cwd, path)?;

        if self.dev.find_child(parent.node_cluster, name)?.is_some() {
            return Err(FosError::InUse);
        }

        let sfn = self.gen_unique_sfn(parent.node_cluster, name)?;

        let chain = self.dev.new_chain(1)?;

        // Directories start with their `.` / `..` entries; files start
        // fully zeroed (their first cluster is plain data).
        let init = self.init_node_cluster(chain, parent.node_cluster, dir);
        if let Err(e) = init {
            let _ = self.dev.free_chain(chain);
            return Err(e);
        }

        let mut entry = DirEntry::zeroed();
        entry.set_sfn_name(&sfn);
        entry.set_attrs(if dir { DirAttrs::SUBDIR } else { DirAttrs::ARCHIVE });
        entry.set_first_cluster(chain);
        entry.set_file_size(0);
        let (date, time) = default_write_stamp();
        entry.set_last_write(date, time);

        let start = match self
            .dev
            .get_free_seq(parent.node_cluster, Self::entries_for_name(name))
        {
            Ok(start) => start,
            Err(e) => {
                let _ = self.dev.free_chain(chain);
                return Err(e);
            }
        };

        if let Err(e) = self.dev.place_seq(parent.node_cluster, start, &entry, Some(name)) {
            // A half-written sequence would poison directory iteration.
            let _ = self.dev.erase_seq(parent.node_cluster, start);
            let _ = self.dev.free_chain(chain);
            return Err(e);
        }

        let sfn_off = start + Self::entries_for_name(name) - 1;
        let e = self.dev.read_dir_entry(parent.node_cluster, sfn_off)?;
        Ok(self.key_from_entry(parent.node_cluster, sfn_off, &e))
    }

    fn init_node_cluster(&mut self, chain: u32, parent_cluster: u32, dir: bool) -> OsResult {
        let zero = [0u8; SECTOR_SIZE];
        for s in 0..self.dev.sectors_per_cluster() {
            self.dev.write(chain, s, 1, &zero)?;
        }

        if dir {
            let mut dot = DirEntry::zeroed();
            dot.set_sfn_name(b".          ");
            dot.set_attrs(DirAttrs::SUBDIR);
            dot.set_first_cluster(chain);
            self.dev.write_dir_entry(chain, 0, &dot)?;

            let mut dotdot = DirEntry::zeroed();
            dotdot.set_sfn_name(b"..         ");
            dotdot.set_attrs(DirAttrs::SUBDIR);
            let parent_ref = if parent_cluster == self.dev.root_dir_cluster() {
                0
            } else {
                parent_cluster
            };
            dotdot.set_first_cluster(parent_ref);
            self.dev.write_dir_entry(chain, 1, &dotdot)?;
        }

        Ok(())
    }

    /// Children of a directory, skipping `.`, `..` and volume labels.
    fn nth_child(&mut self, dir_cluster: u32, index: usize) -> OsResult<Option<(u32, DirEntry, String)>> {
        let mut seen = 0;
        let mut off = 0;

        while let Some(seq) = self.dev.next_dir_seq(dir_cluster, off)? {
            let sfn_off = self.dev.get_dir_seq_sfn(dir_cluster, seq)?;
            let e = self.dev.read_dir_entry(dir_cluster, sfn_off)?;
            off = sfn_off + 1;

            if e.attrs().contains(DirAttrs::VOL_LABEL) {
                continue;
            }
            let name = match self.dev.get_dir_seq_lfn(dir_cluster, sfn_off)? {
                Some(lfn) => lfn,
                None => e.sfn_string(),
            };
            if name == "." || name == ".." {
                continue;
            }

            if seen == index {
                return Ok(Some((sfn_off, e, name)));
            }
            seen += 1;
        }

        Ok(None)
    }

    fn child_count(&mut self, dir_cluster: u32) -> OsResult<u32> {
        let mut count = 0;
        while self.nth_child(dir_cluster, count as usize)?.is_some() {
            count += 1;
        }
        Ok(count)
    }

    /// Re-read the node's SFN entry.
    fn node_entry(&mut self, nk: &NodeKey) -> OsResult<DirEntry> {
        if nk.is_root() {
            return Err(FosError::StateMismatch);
        }
        self.dev.read_dir_entry(nk.dir_cluster, nk.sfn_entry)
    }

    fn update_node_entry(&mut self, nk: &NodeKey, f: impl FnOnce(&mut DirEntry)) -> OsResult {
        let mut e = self.node_entry(nk)?;
        f(&mut e);
        self.dev.write_dir_entry(nk.dir_cluster, nk.sfn_entry, &e)
    }

    fn file_len(&mut self, nk: &NodeKey) -> OsResult<u32> {
        Ok(self.node_entry(nk)?.file_size())
    }
}

impl FileSys for Fat32FileSys {
    fn root_key(&self) -> NodeKey {
        self.root()
    }

    fn new_key(&mut self, cwd: &NodeKey, path: &str) -> OsResult<NodeKey> {
        self.resolve(cwd, path)
    }

    fn node_info(&mut self, nk: &NodeKey) -> OsResult<NodeInfo> {
        if nk.is_dir {
            let len = self.child_count(nk.node_cluster)?;
            Ok(NodeInfo { is_dir: true, len })
        } else {
            let len = self.file_len(nk)?;
            Ok(NodeInfo { is_dir: false, len })
        }
    }

    fn touch(&mut self, cwd: &NodeKey, path: &str) -> OsResult<NodeKey> {
        self.create_node(cwd, path, false)
    }

    fn mkdir(&mut self, cwd: &NodeKey, path: &str) -> OsResult<NodeKey> {
        self.create_node(cwd, path, true)
    }

    fn remove(&mut self, cwd: &NodeKey, path: &str) -> OsResult {
        let nk = self.resolve(cwd, path)?;
        if nk.is_root() {
            return Err(FosError::BadArgs);
        }

        // Walk back from the SFN entry to the start of the sequence so
        // the LFN entries are erased too.
        let mut seq_start = nk.sfn_entry;
        while seq_start > 0 {
            let e = self.dev.read_dir_entry(nk.dir_cluster, seq_start - 1)?;
            if !e.is_lfn() || e.is_unused() {
                break;
            }
            seq_start -= 1;
        }

        self.dev.erase_seq(nk.dir_cluster, seq_start)?;
        self.dev.free_chain(nk.node_cluster)
    }

    fn child_name(&mut self, nk: &NodeKey, index: usize) -> OsResult<Option<String>> {
        if !nk.is_dir {
            return Err(FosError::StateMismatch);
        }
        Ok(self.nth_child(nk.node_cluster, index)?.map(|(_, _, name)| name))
    }

    fn read(&mut self, nk: &NodeKey, pos: u32, dst: &mut [u8]) -> OsResult {
        if nk.is_dir {
            return Err(FosError::StateMismatch);
        }

        let len = self.file_len(nk)?;
        let end = pos.checked_add(dst.len() as u32).ok_or(FosError::InvalidRange)?;
        if end > len {
            return Err(FosError::InvalidRange);
        }

        if dst.is_empty() {
            return Ok(());
        }

        let sector_size = SECTOR_SIZE as u32;
        let mut cursor = pos;
        let mut done = 0usize;

        // Unaligned head.
        let head_off = cursor % sector_size;
        if head_off != 0 {
            let head_len = ((sector_size - head_off) as usize).min(dst.len());
            self.dev
                .read_piece(nk.node_cluster, cursor / sector_size, head_off, &mut dst[..head_len])?;
            cursor += head_len as u32;
            done += head_len;
        }

        // Aligned middle, whole sectors at a time.
        let mid_sectors = (dst.len() - done) as u32 / sector_size;
        if mid_sectors > 0 {
            self.dev.read(
                nk.node_cluster,
                cursor / sector_size,
                mid_sectors,
                &mut dst[done..done + (mid_sectors * sector_size) as usize],
            )?;
            cursor += mid_sectors * sector_size;
            done += (mid_sectors * sector_size) as usize;
        }

        // Tail.
        if done < dst.len() {
            self.dev
                .read_piece(nk.node_cluster, cursor / sector_size, 0, &mut dst[done..])?;
        }

        Ok(())
    }

    fn write(&mut self, nk: &NodeKey, pos: u32, src: &[u8]) -> OsResult {
        if nk.is_dir {
            return Err(FosError::StateMismatch);
        }

        let len = self.file_len(nk)?;
        if pos > len {
            return Err(FosError::InvalidRange);
        }

        let end = pos.checked_add(src.len() as u32).ok_or(FosError::NoSpace)?;
        if end > len {
            self.resize(nk, end)?;
        }

        if src.is_empty() {
            return Ok(());
        }

        let sector_size = SECTOR_SIZE as u32;
        let mut cursor = pos;
        let mut done = 0usize;

        let head_off = cursor % sector_size;
        if head_off != 0 {
            let head_len = ((sector_size - head_off) as usize).min(src.len());
            self.dev
                .write_piece(nk.node_cluster, cursor / sector_size, head_off, &src[..head_len])?;
            cursor += head_len as u32;
            done += head_len;
        }

        let mid_sectors = (src.len() - done) as u32 / sector_size;
        if mid_sectors > 0 {
            self.dev.write(
                nk.node_cluster,
                cursor / sector_size,
                mid_sectors,
                &src[done..done + (mid_sectors * sector_size) as usize],
            )?;
            cursor += mid_sectors * sector_size;
            done += (mid_sectors * sector_size) as usize;
        }

        if done < src.len() {
            self.dev
                .write_piece(nk.node_cluster, cursor / sector_size, 0, &src[done..])?;
        }

        let (date, time) = default_write_stamp();
        self.update_node_entry(nk, |e| e.set_last_write(date, time))
    }

    fn resize(&mut self, nk: &NodeKey, new_len: u32) -> OsResult {
        if nk.is_dir {
            return Err(FosError::StateMismatch);
        }

        let old_len = self.file_len(nk)?;
        let cluster_bytes = self.dev.cluster_size() as u32;

        // Every file keeps at least one cluster so its key stays stable.
        let new_clusters = ((new_len + cluster_bytes - 1) / cluster_bytes).max(1);
        self.dev.resize_chain(nk.node_cluster, new_clusters)?;

        // Grown bytes must read back as zeros, including the stale tail
        // of the previously-last cluster.
        if new_len > old_len {
            let zero = [0u8; SECTOR_SIZE];
            let sector_size = SECTOR_SIZE as u32;

            let mut cursor = old_len;
            let zero_end = new_len.min(new_clusters * cluster_bytes);
            while cursor < zero_end {
                let off = cursor % sector_size;
                let chunk = ((sector_size - off) as usize).min((zero_end - cursor) as usize);
                self.dev
                    .write_piece(nk.node_cluster, cursor / sector_size, off, &zero[..chunk])?;
                cursor += chunk as u32;
            }
        }

        let (date, time) = default_write_stamp();
        self.update_node_entry(nk, |e| {
            e.set_file_size(new_len);
            e.set_last_write(date, time);
        })
    }

    fn flush(&mut self, nk: Option<&NodeKey>) -> OsResult {
        match nk {
            Some(_) => self.dev.flush(),
            None => {
                self.dev.sync_fats()?;
                self.dev.flush()
            }
        }
    }
}

pub fn new_fat32_file_sys(dev: Fat32Device) -> Box<dyn FileSys> {
    Box::new(Fat32FileSys::new(dev))
}

#[cfg(test)]
mod tests {
    use super::super::tests::fresh_device;
    use super::*;
    use alloc::vec::Vec;

    fn fs() -> Fat32FileSys {
        Fat32FileSys::new(fresh_device(8192, 2))
    }

    #[test]
    fn touch_then_lookup() {
        let mut fs = fs();
        let root = fs.root_key();

        let nk = fs.touch(&root, "notes.txt").unwrap();
        assert!(!nk.is_dir);

        let found = fs.new_key(&root.clone(), "/notes.txt").unwrap();
        assert_eq!(found, nk);

        let info = fs.node_info(&nk).unwrap();
        assert_eq!(info.len, 0);
        assert!(!info.is_dir);
    }

    #[test]
    fn mkdir_nesting_and_dotdot() {
        let mut fs = fs();
        let root = fs.root_key();

        let a = fs.mkdir(&root, "a").unwrap();
        let _b = fs.mkdir(&a, "b").unwrap();
        let f = fs.touch(&root, "a/b/deep.txt").unwrap();

        // `..` walks back up.
        let via_dots = fs.new_key(&root, "a/b/../b/./deep.txt").unwrap();
        assert_eq!(via_dots, f);

        let missing = fs.new_key(&root, "a/b/missing");
        assert_eq!(missing.unwrap_err(), FosError::InvalidIndex);
    }

    #[test]
    fn duplicate_names_rejected() {
        let mut fs = fs();
        let root = fs.root_key();

        fs.touch(&root, "dup").unwrap();
        assert_eq!(fs.touch(&root, "dup").unwrap_err(), FosError::InUse);
        assert_eq!(fs.mkdir(&root, "dup").unwrap_err(), FosError::InUse);
    }

    #[test]
    fn write_read_round_trip() {
        let mut fs = fs();
        let root = fs.root_key();
        let nk = fs.touch(&root, "data.bin").unwrap();

        // Unaligned offsets and a length spanning head, middle, tail.
        let mut data = alloc::vec![0u8; 3000];
        for (i, b) in data.iter_mut().enumerate() {
            *b = (i * 7 % 256) as u8;
        }

        fs.resize(&nk, 100).unwrap();
        fs.write(&nk, 100, &data).unwrap();
        assert_eq!(fs.node_info(&nk).unwrap().len, 3100);

        let mut out = alloc::vec![0u8; 3000];
        fs.read(&nk, 100, &mut out).unwrap();
        assert_eq!(data, out);
    }

    #[test]
    fn resize_zero_fills_growth() {
        let mut fs = fs();
        let root = fs.root_key();
        let nk = fs.touch(&root, "grow.bin").unwrap();

        fs.write(&nk, 0, &[0xFFu8; 700]).unwrap();
        fs.resize(&nk, 300).unwrap();
        fs.resize(&nk, 2000).unwrap();

        let mut out = alloc::vec![0u8; 2000];
        fs.read(&nk, 0, &mut out).unwrap();

        assert!(out[..300].iter().all(|&b| b == 0xFF));
        assert!(out[300..].iter().all(|&b| b == 0));
    }

    #[test]
    fn shrink_then_read_keeps_prefix() {
        let mut fs = fs();
        let root = fs.root_key();
        let nk = fs.touch(&root, "shrink.bin").unwrap();

        let data: Vec<u8> = (0..4000u32).map(|i| (i % 256) as u8).collect();
        fs.write(&nk, 0, &data).unwrap();

        fs.resize(&nk, 1500).unwrap();
        assert_eq!(fs.node_info(&nk).unwrap().len, 1500);

        let mut out = alloc::vec![0u8; 1500];
        fs.read(&nk, 0, &mut out).unwrap();
        assert_eq!(&data[..1500], &out[..]);

        // Reads past the new end are rejected.
        let mut over = [0u8; 1];
        assert!(fs.read(&nk, 1500, &mut over).is_err());
    }

    #[test]
    fn child_enumeration_round_trips_create_remove() {
        let mut fs = fs();
        let root = fs.root_key();

        let names_before: Vec<String> = {
            let mut v = Vec::new();
            let mut i = 0;
            while let Some(n) = fs.child_name(&root, i).unwrap() {
                v.push(n);
                i += 1;
            }
            v
        };

        fs.mkdir(&root, "x").unwrap();
        assert!(fs
            .child_name(&root, names_before.len())
            .unwrap()
            .is_some());

        fs.remove(&root, "x").unwrap();

        let names_after: Vec<String> = {
            let mut v = Vec::new();
            let mut i = 0;
            while let Some(n) = fs.child_name(&root, i).unwrap() {
                v.push(n);
                i += 1;
            }
            v
        };
        assert_eq!(names_before, names_after);
    }

    #[test]
    fn directory_info_counts_children() {
        let mut fs = fs();
        let root = fs.root_key();

        let d = fs.mkdir(&root, "dir").unwrap();
        assert_eq!(fs.node_info(&d).unwrap().len, 0); // `.`/`..` excluded

        fs.touch(&root, "dir/one").unwrap();
        fs.touch(&root, "dir/two").unwrap();
        assert_eq!(fs.node_info(&d).unwrap().len, 2);
    }

    #[test]
    fn remove_frees_the_chain() {
        let mut fs = fs();
        let root = fs.root_key();

        let nk = fs.touch(&root, "victim").unwrap();
        let cluster = nk.node_cluster;
        fs.remove(&root, "victim").unwrap();

        assert_eq!(fs.dev.get_fat_slot(cluster).unwrap(), 0);
        assert!(fs.dev.find_child(root.node_cluster, "victim").unwrap().is_none());
    }
}
