//! File-system scenarios on a freshly formatted disk

use minos::config::disk_layout::*;
use minos::fs::{FileHeader, FileSystem};
use minos::machine::disk::SynchDisk;
use std::collections::HashMap;
use std::sync::Arc;

fn fresh_fs() -> FileSystem {
    let _ = env_logger::builder().is_test(true).try_init();
    FileSystem::new(Arc::new(SynchDisk::new()), true)
}

#[test]
fn chunked_big_file_round_trip_and_remove() {
    let fs = fresh_fs();
    let before = fs.free_map_snapshot().to_bytes();

    fs.create("big", 0).unwrap();
    let fd = fs.open_user("big").unwrap();
    for _ in 0..5000 {
        assert_eq!(fs.write_user(fd, b"1234567890").unwrap(), 10);
    }
    assert_eq!(fs.file_size("big").unwrap(), 50_000);

    fs.seek_user(fd, 0).unwrap();
    let mut chunk = [0u8; 10];
    for _ in 0..5000 {
        assert_eq!(fs.read_user(fd, &mut chunk).unwrap(), 10);
        assert_eq!(&chunk, b"1234567890");
    }
    assert_eq!(fs.read_user(fd, &mut chunk).unwrap(), 0);
    fs.close_user(fd).unwrap();

    fs.remove("big").unwrap();
    assert_eq!(
        fs.free_map_snapshot().to_bytes(),
        before,
        "removing the file must return the free map to its pre-write contents"
    );
}

#[test]
fn create_at_the_maximum_length_boundary() {
    let fs = fresh_fs();
    fs.create("exact", MAX_FILE_SIZE).unwrap();
    assert_eq!(fs.file_size("exact").unwrap(), MAX_FILE_SIZE);
    fs.remove("exact").unwrap();

    let before = fs.free_map_snapshot().to_bytes();
    assert!(fs.create("over", MAX_FILE_SIZE + 1).is_err());
    assert_eq!(
        fs.free_map_snapshot().to_bytes(),
        before,
        "a failed create must not leak sectors"
    );
    assert!(!fs.file_exists("over"));
}

/// Walk the tree from the well-known sectors and check the free map
/// against it: every owned sector is marked, and every marked sector
/// has exactly one owner.
#[test]
fn free_map_matches_reachable_sectors_exactly() {
    let fs = fresh_fs();
    fs.create("a", 100).unwrap();
    fs.create("b", 30 * SECTOR_SIZE).unwrap();
    fs.create_dir("d").unwrap();
    fs.change_dir("d").unwrap();
    fs.create("inner", 5000).unwrap();
    fs.change_dir("..").unwrap();

    let disk = fs.disk().clone();
    let mut owners: HashMap<usize, usize> = HashMap::new();
    let mut claim = |sector: usize, owners: &mut HashMap<usize, usize>| {
        *owners.entry(sector).or_insert(0) += 1;
    };

    // Headers and data of the two boot files, then everything
    // reachable from the root directory.
    let mut pending = vec![FREE_MAP_SECTOR, ROOT_SECTOR];
    let mut seen_dirs = vec![];
    while let Some(sector) = pending.pop() {
        claim(sector, &mut owners);
        let hdr = FileHeader::fetch_from(&disk, sector);
        for owned in hdr.owned_sectors(&disk) {
            claim(owned, &mut owners);
        }
        if hdr.is_directory() && !seen_dirs.contains(&sector) {
            seen_dirs.push(sector);
            let dir_file = minos::fs::OpenFile::new(disk.clone(), sector);
            let mut dir = minos::fs::Directory::new();
            dir.fetch_from(&dir_file);
            for (name, child) in dir.live_entries() {
                if name != "." && name != ".." {
                    pending.push(child);
                }
            }
        }
    }

    let map = fs.free_map_snapshot();
    for sector in 0..NUM_SECTORS {
        let owner_count = owners.get(&sector).copied().unwrap_or(0);
        if map.test(sector) {
            assert_eq!(owner_count, 1, "marked sector {sector} must have one owner");
        } else {
            assert_eq!(owner_count, 0, "free sector {sector} must be unreachable");
        }
    }
}

#[test]
fn directories_carry_dot_entries_pointing_home() {
    let fs = fresh_fs();
    fs.create_dir("d").unwrap();
    let root = fs.current_dir_sector();
    fs.change_dir("d").unwrap();
    let here = fs.current_dir_sector();

    let entries = fs.read_dir();
    let dot = entries.iter().find(|(n, _)| n == ".").unwrap().1;
    let dotdot = entries.iter().find(|(n, _)| n == "..").unwrap().1;
    assert_eq!(dot, here);
    assert_eq!(dotdot, root);
}

#[test]
fn nested_change_dir_paths() {
    let fs = fresh_fs();
    fs.create_dir("a").unwrap();
    fs.change_dir("a").unwrap();
    fs.create_dir("b").unwrap();
    fs.change_dir("..").unwrap();

    let root = fs.current_dir_sector();
    fs.change_dir("a/b").unwrap();
    fs.create("deep", 0).unwrap();
    fs.change_dir("../..").unwrap();
    assert_eq!(fs.current_dir_sector(), root);

    // Slash-only paths stay put; empty paths fail.
    fs.change_dir("/").unwrap();
    assert_eq!(fs.current_dir_sector(), root);
    assert!(fs.change_dir("").is_err());
}
