//! Open file handles
//!
//! A handle caches the file's header and carries a seek position.
//! Reads and writes move whole sectors through the disk, with
//! read-modify-write at the ragged edges. Writes never grow the file:
//! the file system extends the header first, then the handle reloads
//! it.

use super::file_header::FileHeader;
use crate::config::disk_layout::SECTOR_SIZE;
use crate::machine::disk::SynchDisk;
use std::sync::Arc;

pub struct OpenFile {
    disk: Arc<SynchDisk>,
    sector: usize,
    hdr: FileHeader,
    seek: usize,
}

impl OpenFile {
    /// Open the file whose header lives at `sector`.
    pub fn new(disk: Arc<SynchDisk>, sector: usize) -> Self {
        let hdr = FileHeader::fetch_from(&disk, sector);
        Self {
            disk,
            sector,
            hdr,
            seek: 0,
        }
    }

    pub fn length(&self) -> usize {
        self.hdr.length()
    }

    pub fn header_sector(&self) -> usize {
        self.sector
    }

    pub fn seek(&mut self, position: usize) {
        self.seek = position;
    }

    pub fn tell(&self) -> usize {
        self.seek
    }

    /// Re-fetch the header after the file system extended the file.
    pub fn reload_header(&mut self) {
        self.hdr = FileHeader::fetch_from(&self.disk, self.sector);
    }

    /// Read from the seek position, advancing it. Returns bytes read.
    pub fn read(&mut self, buf: &mut [u8]) -> usize {
        let n = self.read_at(buf, self.seek);
        self.seek += n;
        n
    }

    /// Write at the seek position, advancing it. Returns bytes written.
    pub fn write(&mut self, buf: &[u8]) -> usize {
        let n = self.write_at(buf, self.seek);
        self.seek += n;
        n
    }

    /// Read up to `buf.len()` bytes starting at `position`, clamped to
    /// the end of the file. Returns bytes read.
    pub fn read_at(&self, buf: &mut [u8], position: usize) -> usize {
        let length = self.hdr.length();
        if position >= length || buf.is_empty() {
            return 0;
        }
        let n = buf.len().min(length - position);
        let first = position / SECTOR_SIZE;
        let last = (position + n - 1) / SECTOR_SIZE;

        let mut copied = 0;
        let mut sector_buf = [0u8; SECTOR_SIZE];
        for sector_index in first..=last {
            let sector = self.hdr.byte_to_sector(&self.disk, sector_index * SECTOR_SIZE);
            self.disk.read_sector(sector, &mut sector_buf);
            let start = if sector_index == first {
                position % SECTOR_SIZE
            } else {
                0
            };
            let take = (SECTOR_SIZE - start).min(n - copied);
            buf[copied..copied + take].copy_from_slice(&sector_buf[start..start + take]);
            copied += take;
        }
        copied
    }

    /// Write up to `buf.len()` bytes starting at `position`, clamped to
    /// the end of the file. Partially covered sectors are read back
    /// first. Returns bytes written.
    pub fn write_at(&mut self, buf: &[u8], position: usize) -> usize {
        let length = self.hdr.length();
        if position >= length || buf.is_empty() {
            return 0;
        }
        let n = buf.len().min(length - position);
        let first = position / SECTOR_SIZE;
        let last = (position + n - 1) / SECTOR_SIZE;

        let mut written = 0;
        let mut sector_buf = [0u8; SECTOR_SIZE];
        for sector_index in first..=last {
            let sector = self.hdr.byte_to_sector(&self.disk, sector_index * SECTOR_SIZE);
            let start = if sector_index == first {
                position % SECTOR_SIZE
            } else {
                0
            };
            let take = (SECTOR_SIZE - start).min(n - written);
            if start != 0 || take != SECTOR_SIZE {
                self.disk.read_sector(sector, &mut sector_buf);
            }
            sector_buf[start..start + take].copy_from_slice(&buf[written..written + take]);
            self.disk.write_sector(sector, &sector_buf);
            written += take;
        }
        written
    }
}
