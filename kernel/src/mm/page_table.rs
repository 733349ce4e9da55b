//! Per-process page table

use bitflags::bitflags;

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct PteFlags: u8 {
        const VALID = 1 << 0;
        const USED = 1 << 1;
        const DIRTY = 1 << 2;
        const READ_ONLY = 1 << 3;
    }
}

#[derive(Debug, Clone, Copy)]
pub struct TranslationEntry {
    pub virtual_page: u32,
    pub physical_page: u32,
    pub flags: PteFlags,
}

/// Dense table mapping virtual page `i` to its physical frame.
#[derive(Debug)]
pub struct PageTable {
    entries: Vec<TranslationEntry>,
}

impl PageTable {
    pub fn new() -> Self {
        Self {
            entries: Vec::new(),
        }
    }

    /// Append the mapping for the next virtual page.
    pub fn push_frame(&mut self, frame: usize) {
        let vpn = self.entries.len() as u32;
        self.entries.push(TranslationEntry {
            virtual_page: vpn,
            physical_page: frame as u32,
            flags: PteFlags::VALID,
        });
    }

    /// Physical frame of `vpn`, if mapped and valid.
    pub fn translate(&self, vpn: usize) -> Option<usize> {
        let entry = self.entries.get(vpn)?;
        entry
            .flags
            .contains(PteFlags::VALID)
            .then_some(entry.physical_page as usize)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// All mapped physical frames, in virtual-page order.
    pub fn frames(&self) -> impl Iterator<Item = usize> + '_ {
        self.entries.iter().map(|e| e.physical_page as usize)
    }
}

impl Default for PageTable {
    fn default() -> Self {
        Self::new()
    }
}
