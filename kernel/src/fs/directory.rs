//! Directories
//!
//! A fixed-size table of `{in_use, name, header sector}` entries,
//! stored as a regular file. Lookup is linear. Every directory except
//! the root carries the reserved `"."` and `".."` entries.

use super::open_file::OpenFile;
use crate::config::disk_layout::{DIR_ENTRY_SIZE, FILE_NAME_MAX, NUM_DIR_ENTRIES};

#[derive(Clone)]
struct DirEntry {
    in_use: bool,
    name: [u8; FILE_NAME_MAX + 1],
    sector: i32,
}

impl DirEntry {
    fn empty() -> Self {
        Self {
            in_use: false,
            name: [0; FILE_NAME_MAX + 1],
            sector: 0,
        }
    }

    fn name_str(&self) -> &str {
        let end = self.name.iter().position(|&b| b == 0).unwrap_or(self.name.len());
        core::str::from_utf8(&self.name[..end]).unwrap_or("")
    }
}

pub struct Directory {
    entries: Vec<DirEntry>,
}

impl Directory {
    pub fn new() -> Self {
        Self {
            entries: vec![DirEntry::empty(); NUM_DIR_ENTRIES],
        }
    }

    /// Reload the table from its backing file.
    pub fn fetch_from(&mut self, file: &OpenFile) {
        let mut bytes = vec![0u8; NUM_DIR_ENTRIES * DIR_ENTRY_SIZE];
        file.read_at(&mut bytes, 0);
        for (i, entry) in self.entries.iter_mut().enumerate() {
            let at = i * DIR_ENTRY_SIZE;
            entry.in_use = i32::from_le_bytes(bytes[at..at + 4].try_into().unwrap()) != 0;
            entry.name.copy_from_slice(&bytes[at + 4..at + 4 + FILE_NAME_MAX + 1]);
            let sector_at = at + 4 + FILE_NAME_MAX + 1;
            entry.sector = i32::from_le_bytes(bytes[sector_at..sector_at + 4].try_into().unwrap());
        }
    }

    /// Flush the table to its backing file.
    pub fn write_back(&self, file: &mut OpenFile) {
        let mut bytes = vec![0u8; NUM_DIR_ENTRIES * DIR_ENTRY_SIZE];
        for (i, entry) in self.entries.iter().enumerate() {
            let at = i * DIR_ENTRY_SIZE;
            bytes[at..at + 4].copy_from_slice(&(entry.in_use as i32).to_le_bytes());
            bytes[at + 4..at + 4 + FILE_NAME_MAX + 1].copy_from_slice(&entry.name);
            let sector_at = at + 4 + FILE_NAME_MAX + 1;
            bytes[sector_at..sector_at + 4].copy_from_slice(&entry.sector.to_le_bytes());
        }
        file.write_at(&bytes, 0);
    }

    /// Header sector of `name`, if present.
    pub fn find(&self, name: &str) -> Option<usize> {
        let name = clamp_name(name);
        self.entries
            .iter()
            .find(|e| e.in_use && e.name_str() == name)
            .map(|e| e.sector as usize)
    }

    /// Install `name -> sector`. Fails when the table is full; the
    /// caller has already checked for duplicates. Names are clamped to
    /// `FILE_NAME_MAX` bytes.
    pub fn add(&mut self, name: &str, sector: usize) -> bool {
        let name = clamp_name(name);
        let Some(entry) = self.entries.iter_mut().find(|e| !e.in_use) else {
            return false;
        };
        entry.in_use = true;
        entry.name = [0; FILE_NAME_MAX + 1];
        entry.name[..name.len()].copy_from_slice(name.as_bytes());
        entry.sector = sector as i32;
        true
    }

    /// Drop the entry for `name`.
    pub fn remove(&mut self, name: &str) -> bool {
        let name = clamp_name(name);
        match self.entries.iter_mut().find(|e| e.in_use && e.name_str() == name) {
            Some(entry) => {
                entry.in_use = false;
                true
            }
            None => false,
        }
    }

    /// A directory is empty when nothing but `"."` and `".."` remains.
    pub fn is_empty(&self) -> bool {
        self.entries
            .iter()
            .all(|e| !e.in_use || matches!(e.name_str(), "." | ".."))
    }

    /// Names of live entries, in table order.
    pub fn names(&self) -> Vec<String> {
        self.entries
            .iter()
            .filter(|e| e.in_use)
            .map(|e| e.name_str().to_string())
            .collect()
    }

    /// Live `(name, sector)` pairs, in table order.
    pub fn live_entries(&self) -> Vec<(String, usize)> {
        self.entries
            .iter()
            .filter(|e| e.in_use)
            .map(|e| (e.name_str().to_string(), e.sector as usize))
            .collect()
    }
}

impl Default for Directory {
    fn default() -> Self {
        Self::new()
    }
}

fn clamp_name(name: &str) -> &str {
    if name.len() <= FILE_NAME_MAX {
        return name;
    }
    // Cut at a char boundary: a multi-byte character straddling the
    // limit is dropped whole rather than split.
    let end = (0..=FILE_NAME_MAX)
        .rev()
        .find(|&i| name.is_char_boundary(i))
        .unwrap_or(0);
    &name[..end]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn add_find_remove() {
        let mut dir = Directory::new();
        assert!(dir.add("alpha", 17));
        assert_eq!(dir.find("alpha"), Some(17));
        assert!(dir.remove("alpha"));
        assert_eq!(dir.find("alpha"), None);
        assert!(!dir.remove("alpha"));
    }

    #[test]
    fn table_is_bounded() {
        let mut dir = Directory::new();
        for i in 0..NUM_DIR_ENTRIES {
            assert!(dir.add(&format!("f{i}"), i + 2));
        }
        assert!(!dir.add("one-more", 99));
    }

    #[test]
    fn long_names_are_clamped_consistently() {
        let mut dir = Directory::new();
        assert!(dir.add("a-very-long-file-name", 3));
        assert_eq!(dir.find("a-very-long-file-name"), Some(3));
        assert_eq!(dir.find("a-very-lo"), Some(3));
    }

    #[test]
    fn clamping_respects_char_boundaries() {
        // The euro sign spans bytes 8..11, straddling the name limit;
        // it must be dropped whole, not split mid-character.
        let mut dir = Directory::new();
        assert!(dir.add("abcdefgh€", 5));
        assert_eq!(dir.find("abcdefgh€"), Some(5));
        assert_eq!(dir.find("abcdefgh"), Some(5));
        assert!(dir.remove("abcdefgh€"));
    }

    #[test]
    fn emptiness_ignores_dot_entries() {
        let mut dir = Directory::new();
        dir.add(".", 4);
        dir.add("..", 1);
        assert!(dir.is_empty());
        dir.add("file", 9);
        assert!(!dir.is_empty());
    }
}
