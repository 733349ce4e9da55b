//! On-disk file system
//!
//! Files are a header sector plus data sectors; the free-sector bitmap
//! and the root directory are themselves files whose headers live at
//! well-known sectors 0 and 1, so the system can find them at boot.
//! Directory-and-bitmap mutations flush to disk before the operation
//! reports success; on failure the in-memory copies are simply dropped,
//! which is the only recovery. No attempt is made to survive a crash
//! mid-mutation: an interrupted operation may corrupt the disk.
//!
//! Three subsystem-wide locks exist: the current-directory lock, the
//! free-map lock and the open-file-table lock, acquired in the order
//! directory → free map; per-file locks nest inside.

pub mod directory;
pub mod file_header;
pub mod open_file;

pub use directory::Directory;
pub use file_header::{FileHeader, FileKind};
pub use open_file::OpenFile;

use crate::config::disk_layout::*;
use crate::error::{KernelError, Result};
use crate::machine::disk::SynchDisk;
use crate::utils::BitMap;
use std::sync::{Arc, Mutex};

/// One live entry of the user open-file table.
pub struct UserFile {
    pub sector: usize,
    pub file: Mutex<OpenFile>,
}

struct DirCursor {
    file: OpenFile,
    sector: usize,
}

struct OpenTable {
    map: BitMap,
    entries: Vec<Option<Arc<UserFile>>>,
}

pub struct FileSystem {
    disk: Arc<SynchDisk>,
    directory: Mutex<DirCursor>,
    free_map: Mutex<OpenFile>,
    open_files: Mutex<OpenTable>,
}

impl FileSystem {
    /// Bring up the file system. With `format` the disk is assumed
    /// blank: the free map and root directory files are laid down
    /// first; otherwise the two well-known files are just opened.
    pub fn new(disk: Arc<SynchDisk>, format: bool) -> Self {
        log::debug!(target: "fs", "initializing the file system, format = {format}");
        if format {
            let mut free_map = BitMap::new(NUM_SECTORS);
            let directory = Directory::new();

            // Grab the well-known header sectors before anything else
            // can claim them, then lay down data for both files.
            free_map.mark(FREE_MAP_SECTOR);
            free_map.mark(ROOT_SECTOR);
            let map_hdr =
                FileHeader::allocate(&mut free_map, &disk, FREE_MAP_FILE_SIZE, FileKind::Data)
                    .expect("fresh disk cannot hold the free map file");
            let dir_hdr =
                FileHeader::allocate(&mut free_map, &disk, DIRECTORY_FILE_SIZE, FileKind::Root)
                    .expect("fresh disk cannot hold the root directory");

            // Headers must hit the disk before the files are opened,
            // since opening reads the header back.
            map_hdr.write_back(&disk, FREE_MAP_SECTOR);
            dir_hdr.write_back(&disk, ROOT_SECTOR);

            let mut free_map_file = OpenFile::new(disk.clone(), FREE_MAP_SECTOR);
            let mut directory_file = OpenFile::new(disk.clone(), ROOT_SECTOR);
            free_map.write_back(&mut free_map_file);
            directory.write_back(&mut directory_file);
        }

        Self {
            directory: Mutex::new(DirCursor {
                file: OpenFile::new(disk.clone(), ROOT_SECTOR),
                sector: ROOT_SECTOR,
            }),
            free_map: Mutex::new(OpenFile::new(disk.clone(), FREE_MAP_SECTOR)),
            open_files: Mutex::new(OpenTable {
                map: BitMap::new(MAX_OPENED_FILES),
                entries: (0..MAX_OPENED_FILES).map(|_| None).collect(),
            }),
            disk,
        }
    }

    fn fetch_free_map(&self, file: &OpenFile) -> BitMap {
        let mut map = BitMap::new(NUM_SECTORS);
        map.fetch_from(file);
        map
    }

    /// Create an empty-or-sized data file in the current directory.
    pub fn create(&self, name: &str, initial_size: usize) -> Result<()> {
        log::debug!(target: "fs", "creating file {name}, size {initial_size}");
        if name == "." || name == ".." {
            return Err(KernelError::Reserved);
        }
        let mut dir = self.directory.lock().unwrap();
        let mut directory = Directory::new();
        directory.fetch_from(&dir.file);
        if directory.find(name).is_some() {
            return Err(KernelError::Exists);
        }

        let mut fm_file = self.free_map.lock().unwrap();
        let mut free_map = self.fetch_free_map(&fm_file);
        let sector = free_map.find().ok_or(KernelError::OutOfSpace)?;
        if !directory.add(name, sector) {
            return Err(KernelError::OutOfSlots);
        }
        let hdr = FileHeader::allocate(&mut free_map, &self.disk, initial_size, FileKind::Data)?;

        // Everything worked; flush all changes back to disk.
        hdr.write_back(&self.disk, sector);
        directory.write_back(&mut dir.file);
        free_map.write_back(&mut fm_file);
        Ok(())
    }

    /// Create a subdirectory of the current directory, installing its
    /// `"."` and `".."` entries.
    pub fn create_dir(&self, name: &str) -> Result<()> {
        log::debug!(target: "fs", "creating directory {name}");
        if name == "." || name == ".." {
            return Err(KernelError::Reserved);
        }
        let mut dir = self.directory.lock().unwrap();
        let mut directory = Directory::new();
        directory.fetch_from(&dir.file);
        if directory.find(name).is_some() {
            return Err(KernelError::Exists);
        }

        let mut fm_file = self.free_map.lock().unwrap();
        let mut free_map = self.fetch_free_map(&fm_file);
        let sector = free_map.find().ok_or(KernelError::OutOfSpace)?;
        let hdr = FileHeader::allocate(
            &mut free_map,
            &self.disk,
            DIRECTORY_FILE_SIZE,
            FileKind::Directory,
        )?;
        if !directory.add(name, sector) {
            return Err(KernelError::OutOfSlots);
        }

        hdr.write_back(&self.disk, sector);
        free_map.write_back(&mut fm_file);
        directory.write_back(&mut dir.file);

        // Now populate the child with its reserved entries.
        let mut new_directory_file = OpenFile::new(self.disk.clone(), sector);
        let mut new_directory = Directory::new();
        new_directory.add(".", sector);
        new_directory.add("..", dir.sector);
        new_directory.write_back(&mut new_directory_file);
        Ok(())
    }

    /// Open a file in the current directory for kernel use.
    pub fn open(&self, name: &str) -> Result<OpenFile> {
        let dir = self.directory.lock().unwrap();
        let mut directory = Directory::new();
        directory.fetch_from(&dir.file);
        let sector = directory.find(name).ok_or(KernelError::NotFound)?;
        Ok(OpenFile::new(self.disk.clone(), sector))
    }

    /// Open a data file into the user open-file table; at most one
    /// descriptor per file at a time.
    pub fn open_user(&self, name: &str) -> Result<usize> {
        log::debug!(target: "fs", "opening user file {name}");
        let sector = {
            let dir = self.directory.lock().unwrap();
            let mut directory = Directory::new();
            directory.fetch_from(&dir.file);
            directory.find(name).ok_or(KernelError::NotFound)?
        };
        let hdr = FileHeader::fetch_from(&self.disk, sector);
        if !hdr.is_data_file() {
            log::debug!(target: "fs", "user programs may only open data files");
            return Err(KernelError::TypeMismatch);
        }

        let mut table = self.open_files.lock().unwrap();
        if table.entries.iter().flatten().any(|f| f.sector == sector) {
            log::debug!(target: "fs", "{name} is already open under another descriptor");
            return Err(KernelError::InUse);
        }
        let index = table.map.find().ok_or(KernelError::OutOfSlots)?;
        table.entries[index] = Some(Arc::new(UserFile {
            sector,
            file: Mutex::new(OpenFile::new(self.disk.clone(), sector)),
        }));
        Ok(index)
    }

    /// Close a user descriptor, letting in-flight I/O drain first.
    pub fn close_user(&self, fd: usize) -> Result<()> {
        let mut table = self.open_files.lock().unwrap();
        if fd >= MAX_OPENED_FILES || !table.map.test(fd) {
            return Err(KernelError::NotFound);
        }
        let entry = table.entries[fd].clone().unwrap();
        let _quiesced = entry.file.lock().unwrap();
        table.map.clear(fd);
        table.entries[fd] = None;
        Ok(())
    }

    fn user_file(&self, fd: usize) -> Result<Arc<UserFile>> {
        let table = self.open_files.lock().unwrap();
        if fd >= MAX_OPENED_FILES || !table.map.test(fd) {
            return Err(KernelError::NotFound);
        }
        Ok(table.entries[fd].clone().unwrap())
    }

    /// Write at the descriptor's seek position, extending the file
    /// first when the write runs past its end. A failed extension
    /// leaves the file untouched.
    pub fn write_user(&self, fd: usize, buf: &[u8]) -> Result<usize> {
        let entry = self.user_file(fd)?;
        let mut file = entry.file.lock().unwrap();

        let mut fm_file = self.free_map.lock().unwrap();
        let mut free_map = self.fetch_free_map(&fm_file);
        let mut hdr = FileHeader::fetch_from(&self.disk, entry.sector);
        let end = file.tell() + buf.len();
        if end > hdr.length() {
            hdr.extend(&mut free_map, &self.disk, end - hdr.length())?;
            free_map.write_back(&mut fm_file);
            hdr.write_back(&self.disk, entry.sector);
        }
        drop(fm_file);

        file.reload_header();
        Ok(file.write(buf))
    }

    /// Read from the descriptor's seek position; returns bytes read.
    pub fn read_user(&self, fd: usize, buf: &mut [u8]) -> Result<usize> {
        let entry = self.user_file(fd)?;
        let mut file = entry.file.lock().unwrap();
        Ok(file.read(buf))
    }

    /// Position the descriptor at `position` modulo the file length.
    pub fn seek_user(&self, fd: usize, position: usize) -> Result<()> {
        let entry = self.user_file(fd)?;
        let mut file = entry.file.lock().unwrap();
        let length = file.length();
        file.seek(if length == 0 { 0 } else { position % length });
        Ok(())
    }

    /// Delete a data file: refuse directories and open files, then
    /// release data, indirect block and header, and flush.
    pub fn remove(&self, name: &str) -> Result<()> {
        let mut dir = self.directory.lock().unwrap();
        let mut directory = Directory::new();
        directory.fetch_from(&dir.file);
        let sector = directory.find(name).ok_or(KernelError::NotFound)?;

        let mut hdr = FileHeader::fetch_from(&self.disk, sector);
        if !hdr.is_data_file() {
            return Err(KernelError::TypeMismatch);
        }
        {
            let table = self.open_files.lock().unwrap();
            if table.entries.iter().flatten().any(|f| f.sector == sector) {
                log::debug!(target: "fs", "{name} is currently open");
                return Err(KernelError::InUse);
            }
        }

        let mut fm_file = self.free_map.lock().unwrap();
        let mut free_map = self.fetch_free_map(&fm_file);
        hdr.deallocate(&mut free_map, &self.disk);
        free_map.clear(sector);
        directory.remove(name);
        free_map.write_back(&mut fm_file);
        directory.write_back(&mut dir.file);
        Ok(())
    }

    /// Delete an empty subdirectory of the current directory.
    pub fn remove_dir(&self, name: &str) -> Result<()> {
        let mut dir = self.directory.lock().unwrap();
        let mut directory = Directory::new();
        directory.fetch_from(&dir.file);
        let sector = directory.find(name).ok_or(KernelError::NotFound)?;

        let mut hdr = FileHeader::fetch_from(&self.disk, sector);
        if !hdr.is_directory() || hdr.is_root() {
            log::debug!(target: "fs", "{name} is not a removable directory");
            return Err(KernelError::TypeMismatch);
        }
        let to_delete_file = OpenFile::new(self.disk.clone(), sector);
        let mut to_delete = Directory::new();
        to_delete.fetch_from(&to_delete_file);
        if !to_delete.is_empty() {
            return Err(KernelError::NotEmpty);
        }

        let mut fm_file = self.free_map.lock().unwrap();
        let mut free_map = self.fetch_free_map(&fm_file);
        hdr.deallocate(&mut free_map, &self.disk);
        free_map.clear(sector);
        directory.remove(name);
        free_map.write_back(&mut fm_file);
        directory.write_back(&mut dir.file);
        Ok(())
    }

    /// Walk a `/`-separated path from the current directory; on any
    /// failure the previous current directory is kept.
    pub fn change_dir(&self, path: &str) -> Result<()> {
        let components: Vec<&str> = path.split('/').filter(|c| !c.is_empty()).collect();
        if path.is_empty() {
            return Err(KernelError::NotFound);
        }
        let mut dir = self.directory.lock().unwrap();
        let saved_sector = dir.sector;

        for component in components {
            let mut directory = Directory::new();
            directory.fetch_from(&dir.file);
            let step = directory.find(component).and_then(|sector| {
                let hdr = FileHeader::fetch_from(&self.disk, sector);
                hdr.is_directory().then_some(sector)
            });
            match step {
                Some(sector) => {
                    dir.file = OpenFile::new(self.disk.clone(), sector);
                    dir.sector = sector;
                }
                None => {
                    log::debug!(target: "fs", "cd failed at component {component}");
                    dir.file = OpenFile::new(self.disk.clone(), saved_sector);
                    dir.sector = saved_sector;
                    return Err(KernelError::NotFound);
                }
            }
        }
        Ok(())
    }

    pub fn file_exists(&self, name: &str) -> bool {
        let dir = self.directory.lock().unwrap();
        let mut directory = Directory::new();
        directory.fetch_from(&dir.file);
        directory.find(name).is_some()
    }

    /// Logical size of a file in the current directory.
    pub fn file_size(&self, name: &str) -> Result<usize> {
        let dir = self.directory.lock().unwrap();
        let mut directory = Directory::new();
        directory.fetch_from(&dir.file);
        let sector = directory.find(name).ok_or(KernelError::NotFound)?;
        Ok(FileHeader::fetch_from(&self.disk, sector).length())
    }

    pub fn is_data_file(&self, name: &str) -> bool {
        let dir = self.directory.lock().unwrap();
        let mut directory = Directory::new();
        directory.fetch_from(&dir.file);
        match directory.find(name) {
            Some(sector) => FileHeader::fetch_from(&self.disk, sector).is_data_file(),
            None => false,
        }
    }

    /// Names in the current directory.
    pub fn list(&self) -> Vec<String> {
        let dir = self.directory.lock().unwrap();
        let mut directory = Directory::new();
        directory.fetch_from(&dir.file);
        directory.names()
    }

    /// `(name, header sector)` pairs of the current directory.
    pub fn read_dir(&self) -> Vec<(String, usize)> {
        let dir = self.directory.lock().unwrap();
        let mut directory = Directory::new();
        directory.fetch_from(&dir.file);
        directory.live_entries()
    }

    /// Human-readable dump of the current directory.
    pub fn print_directory(&self) -> String {
        let mut out = String::new();
        let sector = self.current_dir_sector();
        out.push_str(&format!("directory at sector {sector}:\n"));
        for (name, sector) in self.read_dir() {
            let hdr = FileHeader::fetch_from(&self.disk, sector);
            let kind = if hdr.is_directory() { "dir " } else { "file" };
            out.push_str(&format!(
                "  {kind} {name:<10} sector {sector:>4}  {} bytes in {} sectors\n",
                hdr.length(),
                hdr.num_sectors(),
            ));
        }
        out
    }

    pub fn current_dir_sector(&self) -> usize {
        self.directory.lock().unwrap().sector
    }

    /// Snapshot of the on-disk free-sector bitmap.
    pub fn free_map_snapshot(&self) -> BitMap {
        let fm_file = self.free_map.lock().unwrap();
        self.fetch_free_map(&fm_file)
    }

    pub fn disk(&self) -> &Arc<SynchDisk> {
        &self.disk
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fresh_fs() -> FileSystem {
        FileSystem::new(Arc::new(SynchDisk::new()), true)
    }

    #[test]
    fn create_then_reopen_reads_back() {
        let fs = fresh_fs();
        fs.create("Test", 0).unwrap();
        let fd = fs.open_user("Test").unwrap();
        assert_eq!(fs.write_user(fd, b"Hello, World!").unwrap(), 13);
        fs.seek_user(fd, 0).unwrap();
        let mut buf = [0u8; 13];
        assert_eq!(fs.read_user(fd, &mut buf).unwrap(), 13);
        assert_eq!(&buf, b"Hello, World!");
        fs.close_user(fd).unwrap();
    }

    #[test]
    fn reserved_and_duplicate_names_are_refused() {
        let fs = fresh_fs();
        assert_eq!(fs.create(".", 0).unwrap_err(), KernelError::Reserved);
        assert_eq!(fs.create("..", 0).unwrap_err(), KernelError::Reserved);
        fs.create("x", 0).unwrap();
        assert_eq!(fs.create("x", 0).unwrap_err(), KernelError::Exists);
    }

    #[test]
    fn create_remove_create_leaves_empty_file() {
        let fs = fresh_fs();
        fs.create("x", 64).unwrap();
        fs.remove("x").unwrap();
        fs.create("x", 0).unwrap();
        assert_eq!(fs.file_size("x").unwrap(), 0);
    }

    #[test]
    fn remove_refuses_open_files_and_directories() {
        let fs = fresh_fs();
        fs.create("busy", 0).unwrap();
        let fd = fs.open_user("busy").unwrap();
        assert_eq!(fs.remove("busy").unwrap_err(), KernelError::InUse);
        fs.close_user(fd).unwrap();
        fs.remove("busy").unwrap();

        fs.create_dir("d").unwrap();
        assert_eq!(fs.remove("d").unwrap_err(), KernelError::TypeMismatch);
    }

    #[test]
    fn each_file_opens_under_one_descriptor() {
        let fs = fresh_fs();
        fs.create("once", 0).unwrap();
        let fd = fs.open_user("once").unwrap();
        assert_eq!(fs.open_user("once").unwrap_err(), KernelError::InUse);
        fs.close_user(fd).unwrap();
        let fd = fs.open_user("once").unwrap();
        fs.close_user(fd).unwrap();
    }

    #[test]
    fn descriptor_table_is_bounded() {
        // The root directory alone cannot hold MAX_OPENED_FILES + 1
        // entries, so spill the extra files into a subdirectory.
        let fs = fresh_fs();
        let mut fds = Vec::new();
        for i in 0..MAX_OPENED_FILES - 1 {
            let name = format!("f{i}");
            fs.create(&name, 0).unwrap();
            fds.push(fs.open_user(&name).unwrap());
        }
        fs.create_dir("d").unwrap();
        fs.change_dir("d").unwrap();
        fs.create("ninth", 0).unwrap();
        fs.create("straw", 0).unwrap();
        fds.push(fs.open_user("ninth").unwrap());
        assert_eq!(fs.open_user("straw").unwrap_err(), KernelError::OutOfSlots);
        for fd in fds {
            fs.close_user(fd).unwrap();
        }
    }

    #[test]
    fn mkdir_cd_dotdot_round_trip() {
        let fs = fresh_fs();
        let origin = fs.current_dir_sector();
        fs.create_dir("sub").unwrap();
        fs.change_dir("sub").unwrap();
        assert_ne!(fs.current_dir_sector(), origin);
        fs.change_dir("..").unwrap();
        assert_eq!(fs.current_dir_sector(), origin);
    }

    #[test]
    fn cd_failure_restores_previous_directory() {
        let fs = fresh_fs();
        fs.create_dir("a").unwrap();
        let origin = fs.current_dir_sector();
        assert_eq!(fs.change_dir("a/missing").unwrap_err(), KernelError::NotFound);
        assert_eq!(fs.current_dir_sector(), origin);
    }

    #[test]
    fn rmdir_honours_emptiness_and_kind() {
        let fs = fresh_fs();
        fs.create_dir("d").unwrap();
        fs.change_dir("d").unwrap();
        fs.create("inner", 0).unwrap();
        fs.change_dir("..").unwrap();
        assert_eq!(fs.remove_dir("d").unwrap_err(), KernelError::NotEmpty);
        fs.change_dir("d").unwrap();
        fs.remove("inner").unwrap();
        fs.change_dir("..").unwrap();
        fs.remove_dir("d").unwrap();
        assert!(!fs.file_exists("d"));

        fs.create("plain", 0).unwrap();
        assert_eq!(fs.remove_dir("plain").unwrap_err(), KernelError::TypeMismatch);
    }

    #[test]
    fn write_past_end_grows_and_gap_reads_zero() {
        let fs = fresh_fs();
        fs.create("gap", 4).unwrap();
        let fd = fs.open_user("gap").unwrap();
        fs.seek_user(fd, 2).unwrap();
        // Seek is modulo length (4), so this lands at offset 2; write
        // 300 bytes, growing the file to 302.
        let body = vec![0xAAu8; 300];
        assert_eq!(fs.write_user(fd, &body).unwrap(), 300);
        assert_eq!(fs.file_size("gap").unwrap(), 302);
        fs.seek_user(fd, 0).unwrap();
        let mut back = vec![0u8; 302];
        assert_eq!(fs.read_user(fd, &mut back).unwrap(), 302);
        assert_eq!(&back[..2], &[0, 0]);
        assert!(back[2..].iter().all(|&b| b == 0xAA));
        fs.close_user(fd).unwrap();
    }

    #[test]
    fn failed_extension_leaves_file_and_map_untouched() {
        let fs = fresh_fs();
        fs.create("big", 0).unwrap();
        let before = fs.free_map_snapshot().to_bytes();
        let fd = fs.open_user("big").unwrap();
        let body = vec![1u8; MAX_FILE_SIZE + 1];
        assert_eq!(fs.write_user(fd, &body).unwrap_err(), KernelError::OutOfSpace);
        assert_eq!(fs.file_size("big").unwrap(), 0);
        assert_eq!(fs.free_map_snapshot().to_bytes(), before);
        fs.close_user(fd).unwrap();
    }

    #[test]
    fn directory_table_fills_up() {
        let fs = fresh_fs();
        for i in 0..NUM_DIR_ENTRIES {
            fs.create(&format!("f{i}"), 0).unwrap();
        }
        assert_eq!(fs.create("over", 0).unwrap_err(), KernelError::OutOfSlots);
    }
}
