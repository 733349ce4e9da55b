//! Simulated disk and its blocking wrapper
//!
//! The raw device moves whole sectors; `SynchDisk` serializes requests
//! so callers see one atomic transfer at a time. The sector store can
//! be loaded from and flushed to a host image file so a formatted disk
//! survives across runs.

use crate::config::disk_layout::{NUM_SECTORS, SECTOR_SIZE};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

pub struct SynchDisk {
    sectors: Mutex<Vec<u8>>,
    image: Option<PathBuf>,
}

impl SynchDisk {
    /// A blank in-memory disk.
    pub fn new() -> Self {
        Self {
            sectors: Mutex::new(vec![0u8; NUM_SECTORS * SECTOR_SIZE]),
            image: None,
        }
    }

    /// A disk backed by an image file. Returns the disk and whether the
    /// image held existing contents (if not, the caller should format).
    pub fn with_image(path: &Path) -> std::io::Result<(Self, bool)> {
        let mut sectors = vec![0u8; NUM_SECTORS * SECTOR_SIZE];
        let existed = match std::fs::File::open(path) {
            Ok(mut f) => {
                f.read_exact(&mut sectors)?;
                true
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => false,
            Err(e) => return Err(e),
        };
        Ok((
            Self {
                sectors: Mutex::new(sectors),
                image: Some(path.to_path_buf()),
            },
            existed,
        ))
    }

    /// Read sector `sector` into `buf`.
    pub fn read_sector(&self, sector: usize, buf: &mut [u8; SECTOR_SIZE]) {
        assert!(sector < NUM_SECTORS, "read of sector {sector} out of range");
        let sectors = self.sectors.lock().unwrap();
        buf.copy_from_slice(&sectors[sector * SECTOR_SIZE..(sector + 1) * SECTOR_SIZE]);
    }

    /// Write `buf` to sector `sector`.
    pub fn write_sector(&self, sector: usize, buf: &[u8; SECTOR_SIZE]) {
        assert!(sector < NUM_SECTORS, "write of sector {sector} out of range");
        let mut sectors = self.sectors.lock().unwrap();
        sectors[sector * SECTOR_SIZE..(sector + 1) * SECTOR_SIZE].copy_from_slice(buf);
    }

    /// Flush the sector store to the backing image, if one was given.
    pub fn flush_image(&self) -> std::io::Result<()> {
        if let Some(path) = &self.image {
            let sectors = self.sectors.lock().unwrap();
            let mut f = std::fs::File::create(path)?;
            f.write_all(&sectors)?;
        }
        Ok(())
    }
}

impl Default for SynchDisk {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sectors_round_trip() {
        let disk = SynchDisk::new();
        let mut out = [0u8; SECTOR_SIZE];
        out[0] = 0xAB;
        out[SECTOR_SIZE - 1] = 0xCD;
        disk.write_sector(7, &out);
        let mut back = [0u8; SECTOR_SIZE];
        disk.read_sector(7, &mut back);
        assert_eq!(out, back);
        disk.read_sector(8, &mut back);
        assert_eq!(back, [0u8; SECTOR_SIZE]);
    }
}
