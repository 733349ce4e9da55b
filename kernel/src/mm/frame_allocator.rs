//! Physical frame pool
//!
//! Bitmap allocation over the machine's physical pages; frames are
//! zeroed as they are handed out. Callers that must allocate several
//! frames atomically (address-space construction, sbrk) hold the pool
//! lock across the whole batch.

use crate::config::memory_layout::NUM_PHYS_PAGES;
use crate::machine::Machine;
use crate::utils::BitMap;
use std::sync::{Mutex, MutexGuard};

pub struct FramePool {
    map: BitMap,
    n_avail: usize,
}

impl FramePool {
    /// Frames not currently owned by any address space.
    pub fn available(&self) -> usize {
        self.n_avail
    }

    /// Claim one frame and zero its memory. `None` when the pool is
    /// exhausted.
    pub fn alloc_zeroed(&mut self, machine: &Machine) -> Option<usize> {
        let frame = self.map.find()?;
        machine.zero_frame(frame);
        self.n_avail -= 1;
        Some(frame)
    }

    /// Return a frame to the pool.
    pub fn release(&mut self, frame: usize) {
        assert!(self.map.test(frame), "releasing a free frame");
        self.map.clear(frame);
        self.n_avail += 1;
    }
}

pub struct FrameProvider {
    pool: Mutex<FramePool>,
}

impl FrameProvider {
    pub fn new() -> Self {
        Self {
            pool: Mutex::new(FramePool {
                map: BitMap::new(NUM_PHYS_PAGES),
                n_avail: NUM_PHYS_PAGES,
            }),
        }
    }

    /// Take the pool lock for a batch of allocations or releases.
    pub fn lock(&self) -> MutexGuard<'_, FramePool> {
        self.pool.lock().unwrap()
    }

    pub fn available(&self) -> usize {
        self.lock().available()
    }
}

impl Default for FrameProvider {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frames_are_zeroed_and_recycled() {
        let machine = Machine::new();
        let frames = FrameProvider::new();
        let frame = {
            let mut pool = frames.lock();
            let frame = pool.alloc_zeroed(&machine).unwrap();
            assert_eq!(pool.available(), NUM_PHYS_PAGES - 1);
            frame
        };
        // Dirty it, release it, reallocate: contents must be zero again.
        machine.write_phys(frame * crate::config::memory_layout::PAGE_SIZE, &[0xFF; 4]);
        let mut pool = frames.lock();
        pool.release(frame);
        assert_eq!(pool.available(), NUM_PHYS_PAGES);
        let again = pool.alloc_zeroed(&machine).unwrap();
        assert_eq!(again, frame);
        let mut buf = [0u8; 4];
        machine.read_phys(frame * crate::config::memory_layout::PAGE_SIZE, &mut buf);
        assert_eq!(buf, [0; 4]);
    }
}
