//! On-disk file headers
//!
//! A header occupies exactly one sector: the file kind, its logical
//! size, its sector count, and `NUM_DIRECT` pointer slots. Slots
//! `[0, NUM_DIRECT - 1)` point directly at data sectors; the last slot,
//! once needed, points at the indirect block, itself laid out as a
//! header of kind `Data` whose data sectors hold packed little-endian
//! sector pointers, `PTRS_PER_SECTOR` to a sector.
//!
//! A header is initialized either by allocating blocks for a new file
//! or by fetching it from disk. Growth is append-only through
//! `extend`; a failed extend may leave the in-memory free map
//! partially dirtied, so the caller must discard its copies instead of
//! flushing them.

use crate::config::disk_layout::*;
use crate::error::{KernelError, Result};
use crate::machine::disk::SynchDisk;
use crate::utils::{div_round_up, BitMap};

/// Index of the slot reserved for the indirect block.
const INDIRECT: usize = NUM_DIRECT - 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileKind {
    Data,
    Directory,
    Root,
}

impl FileKind {
    fn from_i32(raw: i32) -> Self {
        match raw {
            0 => FileKind::Data,
            1 => FileKind::Directory,
            2 => FileKind::Root,
            _ => panic!("corrupt file header kind {raw}"),
        }
    }

    fn as_i32(self) -> i32 {
        match self {
            FileKind::Data => 0,
            FileKind::Directory => 1,
            FileKind::Root => 2,
        }
    }
}

#[derive(Clone, Debug)]
pub struct FileHeader {
    kind: FileKind,
    num_bytes: i32,
    num_sectors: i32,
    data_sectors: [i32; NUM_DIRECT],
}

impl FileHeader {
    /// A zero-length header of the given kind.
    pub fn empty(kind: FileKind) -> Self {
        Self {
            kind,
            num_bytes: 0,
            num_sectors: 0,
            data_sectors: [0; NUM_DIRECT],
        }
    }

    /// Initialize a fresh header and allocate `size` bytes of data.
    pub fn allocate(
        free_map: &mut BitMap,
        disk: &SynchDisk,
        size: usize,
        kind: FileKind,
    ) -> Result<Self> {
        let mut hdr = Self::empty(kind);
        hdr.extend(free_map, disk, size)?;
        Ok(hdr)
    }

    pub fn fetch_from(disk: &SynchDisk, sector: usize) -> Self {
        let mut buf = [0u8; SECTOR_SIZE];
        disk.read_sector(sector, &mut buf);
        Self::from_bytes(&buf)
    }

    pub fn write_back(&self, disk: &SynchDisk, sector: usize) {
        disk.write_sector(sector, &self.to_bytes());
    }

    fn from_bytes(buf: &[u8; SECTOR_SIZE]) -> Self {
        let word = |i: usize| i32::from_le_bytes(buf[i * 4..i * 4 + 4].try_into().unwrap());
        let mut data_sectors = [0i32; NUM_DIRECT];
        for (slot, value) in data_sectors.iter_mut().enumerate() {
            *value = word(3 + slot);
        }
        Self {
            kind: FileKind::from_i32(word(0)),
            num_bytes: word(1),
            num_sectors: word(2),
            data_sectors,
        }
    }

    fn to_bytes(&self) -> [u8; SECTOR_SIZE] {
        let mut buf = [0u8; SECTOR_SIZE];
        let mut put = |i: usize, v: i32| buf[i * 4..i * 4 + 4].copy_from_slice(&v.to_le_bytes());
        put(0, self.kind.as_i32());
        put(1, self.num_bytes);
        put(2, self.num_sectors);
        for (slot, value) in self.data_sectors.iter().enumerate() {
            put(3 + slot, *value);
        }
        buf
    }

    pub fn length(&self) -> usize {
        self.num_bytes as usize
    }

    pub fn num_sectors(&self) -> usize {
        self.num_sectors as usize
    }

    pub fn is_data_file(&self) -> bool {
        self.kind == FileKind::Data
    }

    pub fn is_directory(&self) -> bool {
        matches!(self.kind, FileKind::Directory | FileKind::Root)
    }

    pub fn is_root(&self) -> bool {
        self.kind == FileKind::Root
    }

    /// Grow the file by `add` bytes, allocating data sectors and, past
    /// the direct prefix, the indirect block and its pointers. On error
    /// the free map may already be dirtied in memory: the caller must
    /// drop its copies without flushing.
    pub fn extend(&mut self, free_map: &mut BitMap, disk: &SynchDisk, add: usize) -> Result<()> {
        let new_len = self.num_bytes as usize + add;
        if new_len > MAX_FILE_SIZE {
            log::debug!(target: "fs", "extend of {add} bytes exceeds the maximum file length");
            return Err(KernelError::OutOfSpace);
        }
        let new_total = div_round_up(new_len, SECTOR_SIZE);
        let old_total = self.num_sectors as usize;

        let mut i = old_total;
        while i < new_total && i < INDIRECT {
            self.data_sectors[i] = alloc_data_sector(free_map, disk)? as i32;
            i += 1;
        }

        if new_total > INDIRECT {
            let mut indirect = if old_total > INDIRECT {
                FileHeader::fetch_from(disk, self.data_sectors[INDIRECT] as usize)
            } else {
                log::debug!(target: "fs", "attaching an indirect block");
                self.data_sectors[INDIRECT] =
                    free_map.find().ok_or(KernelError::OutOfSpace)? as i32;
                FileHeader::empty(FileKind::Data)
            };
            let covered = old_total.max(INDIRECT);
            indirect.append_pointers(free_map, disk, new_total - covered)?;
            indirect.write_back(disk, self.data_sectors[INDIRECT] as usize);
        }

        self.num_bytes = new_len as i32;
        self.num_sectors = new_total as i32;
        Ok(())
    }

    /// Append `count` fresh data-sector pointers to this indirect
    /// block, growing its own pointer sectors as needed.
    fn append_pointers(
        &mut self,
        free_map: &mut BitMap,
        disk: &SynchDisk,
        count: usize,
    ) -> Result<()> {
        let old_count = self.num_bytes as usize / 4;
        let new_ptr_sectors = div_round_up((old_count + count) * 4, SECTOR_SIZE);
        if new_ptr_sectors > NUM_DIRECT {
            return Err(KernelError::OutOfSpace);
        }
        for i in self.num_sectors as usize..new_ptr_sectors {
            self.data_sectors[i] = alloc_data_sector(free_map, disk)? as i32;
        }
        self.num_sectors = new_ptr_sectors as i32;
        self.num_bytes += (count * 4) as i32;

        for j in 0..count {
            let pointer = alloc_data_sector(free_map, disk)?;
            let index = old_count + j;
            let sector = self.data_sectors[index / PTRS_PER_SECTOR] as usize;
            let mut buf = [0u8; SECTOR_SIZE];
            disk.read_sector(sector, &mut buf);
            let at = (index % PTRS_PER_SECTOR) * 4;
            buf[at..at + 4].copy_from_slice(&(pointer as u32).to_le_bytes());
            disk.write_sector(sector, &buf);
        }
        Ok(())
    }

    /// Release every sector owned by the file: the direct prefix, then
    /// the pointers inside the indirect block, the indirect block's own
    /// sectors, and the indirect header sector itself.
    pub fn deallocate(&mut self, free_map: &mut BitMap, disk: &SynchDisk) {
        log::debug!(target: "fs", "deallocating {} sectors", self.num_sectors);
        let total = self.num_sectors as usize;
        for i in 0..total.min(INDIRECT) {
            release_sector(free_map, self.data_sectors[i]);
        }
        if total > INDIRECT {
            let indirect = FileHeader::fetch_from(disk, self.data_sectors[INDIRECT] as usize);
            for j in 0..total - INDIRECT {
                release_sector(free_map, indirect.pointer_at(disk, j) as i32);
            }
            for s in 0..indirect.num_sectors as usize {
                release_sector(free_map, indirect.data_sectors[s]);
            }
            release_sector(free_map, self.data_sectors[INDIRECT]);
        }
        self.num_bytes = 0;
        self.num_sectors = 0;
    }

    /// Disk sector holding the byte at `offset`.
    pub fn byte_to_sector(&self, disk: &SynchDisk, offset: usize) -> usize {
        let entry = offset / SECTOR_SIZE;
        assert!(entry < self.num_sectors as usize, "offset {offset} past end of file");
        if entry < INDIRECT {
            return self.data_sectors[entry] as usize;
        }
        let indirect = FileHeader::fetch_from(disk, self.data_sectors[INDIRECT] as usize);
        indirect.pointer_at(disk, entry - INDIRECT)
    }

    /// The `index`-th pointer stored in this indirect block.
    fn pointer_at(&self, disk: &SynchDisk, index: usize) -> usize {
        let sector = self.data_sectors[index / PTRS_PER_SECTOR] as usize;
        let mut buf = [0u8; SECTOR_SIZE];
        disk.read_sector(sector, &mut buf);
        let at = (index % PTRS_PER_SECTOR) * 4;
        u32::from_le_bytes(buf[at..at + 4].try_into().unwrap()) as usize
    }

    /// Every sector reachable from this header, the indirect block's
    /// own sectors and header included. Used by invariant checks.
    pub fn owned_sectors(&self, disk: &SynchDisk) -> Vec<usize> {
        let total = self.num_sectors as usize;
        let mut owned: Vec<usize> = (0..total.min(INDIRECT))
            .map(|i| self.data_sectors[i] as usize)
            .collect();
        if total > INDIRECT {
            let indirect = FileHeader::fetch_from(disk, self.data_sectors[INDIRECT] as usize);
            owned.push(self.data_sectors[INDIRECT] as usize);
            for s in 0..indirect.num_sectors as usize {
                owned.push(indirect.data_sectors[s] as usize);
            }
            for j in 0..total - INDIRECT {
                owned.push(indirect.pointer_at(disk, j));
            }
        }
        owned
    }
}

/// Allocate one sector and zero it, so fresh file contents and any gap
/// left by a seek past end of file read back as zeroes.
fn alloc_data_sector(free_map: &mut BitMap, disk: &SynchDisk) -> Result<usize> {
    let sector = free_map.find().ok_or(KernelError::OutOfSpace)?;
    disk.write_sector(sector, &[0u8; SECTOR_SIZE]);
    Ok(sector)
}

fn release_sector(free_map: &mut BitMap, sector: i32) {
    assert!(free_map.test(sector as usize), "freeing a free sector");
    free_map.clear(sector as usize);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::disk_layout::NUM_SECTORS;

    fn fresh() -> (SynchDisk, BitMap) {
        let disk = SynchDisk::new();
        let mut map = BitMap::new(NUM_SECTORS);
        map.mark(FREE_MAP_SECTOR);
        map.mark(ROOT_SECTOR);
        (disk, map)
    }

    #[test]
    fn header_bytes_round_trip() {
        let (disk, mut map) = fresh();
        let hdr = FileHeader::allocate(&mut map, &disk, 300, FileKind::Directory).unwrap();
        hdr.write_back(&disk, 5);
        let back = FileHeader::fetch_from(&disk, 5);
        assert_eq!(back.length(), 300);
        assert_eq!(back.num_sectors(), 3);
        assert!(back.is_directory());
        assert!(!back.is_root());
    }

    #[test]
    fn size_invariant_holds_across_extends() {
        let (disk, mut map) = fresh();
        let mut hdr = FileHeader::allocate(&mut map, &disk, 1, FileKind::Data).unwrap();
        for add in [1usize, 127, 128, 1000, 5000] {
            hdr.extend(&mut map, &disk, add).unwrap();
            assert_eq!(
                hdr.num_sectors(),
                div_round_up(hdr.length(), SECTOR_SIZE),
                "sector count must track the byte count"
            );
        }
    }

    #[test]
    fn grows_into_indirect_block_and_back_translates() {
        let (disk, mut map) = fresh();
        // 40 sectors: 28 direct, 12 via the indirect block.
        let size = 40 * SECTOR_SIZE;
        let hdr = FileHeader::allocate(&mut map, &disk, size, FileKind::Data).unwrap();
        let mut seen = std::collections::HashSet::new();
        for i in 0..40 {
            let sector = hdr.byte_to_sector(&disk, i * SECTOR_SIZE);
            assert!(map.test(sector), "data sector must be marked allocated");
            assert!(seen.insert(sector), "each offset owns a distinct sector");
        }
    }

    #[test]
    fn every_owned_sector_is_marked_and_deallocate_restores_the_map() {
        let (disk, mut map) = fresh();
        let before = map.to_bytes();
        let mut hdr =
            FileHeader::allocate(&mut map, &disk, 35 * SECTOR_SIZE + 7, FileKind::Data).unwrap();
        for sector in hdr.owned_sectors(&disk) {
            assert!(map.test(sector));
        }
        hdr.deallocate(&mut map, &disk);
        assert_eq!(map.to_bytes(), before);
    }

    #[test]
    fn maximum_length_is_exact() {
        let (disk, mut map) = fresh();
        let mut hdr = FileHeader::allocate(&mut map, &disk, MAX_FILE_SIZE, FileKind::Data)
            .expect("a file of exactly the maximum length must fit");
        assert_eq!(hdr.length(), MAX_FILE_SIZE);
        assert_eq!(
            hdr.extend(&mut map, &disk, 1).unwrap_err(),
            KernelError::OutOfSpace
        );

        let (disk, mut map) = fresh();
        assert_eq!(
            FileHeader::allocate(&mut map, &disk, MAX_FILE_SIZE + 1, FileKind::Data).unwrap_err(),
            KernelError::OutOfSpace
        );
    }

    #[test]
    fn last_indirect_pointer_is_addressable() {
        let (disk, mut map) = fresh();
        let hdr = FileHeader::allocate(&mut map, &disk, MAX_FILE_SIZE, FileKind::Data).unwrap();
        let last = hdr.byte_to_sector(&disk, MAX_FILE_SIZE - 1);
        assert!(map.test(last));
    }
}
