//! Process address spaces
//!
//! A page table over the global frame pool, the heap break, the
//! per-process user-thread slot table (carved from the top of the user
//! stack) and the per-process semaphore table.

use super::frame_allocator::FrameProvider;
use super::page_table::PageTable;
use crate::config::memory_layout::{PAGE_SIZE, THREAD_STACK_SIZE};
use crate::config::task_limits::{MAX_SEM, MAX_THREADS_PER_PROCESS};
use crate::error::{KernelError, Result};
use crate::machine::Machine;
use crate::sync::Semaphore;
use std::sync::{Arc, Condvar, Mutex, MutexGuard};

#[derive(Clone, Copy, Debug)]
pub struct ThreadSlot {
    pub tid: usize,
    pub user_thread_id: u32,
}

#[derive(Debug)]
pub struct SpaceInner {
    pub page_table: PageTable,
    pub brk: u32,
    /// Count of live non-main threads.
    pub n_threads: usize,
    pub next_user_thread_id: u32,
    pub slots: [Option<ThreadSlot>; MAX_THREADS_PER_PROCESS],
    pub sems: [Option<Arc<Semaphore>>; MAX_SEM],
}

#[derive(Debug)]
pub struct AddrSpace {
    pub pid: usize,
    inner: Mutex<SpaceInner>,
    /// Signalled (under the process-table lock) when this process ends.
    pub join_cond: Condvar,
    /// Signalled (under this space's lock) when the last non-main
    /// thread exits; the main thread's Exit waits on it.
    pub n_threads_cond: Condvar,
}

impl AddrSpace {
    /// Build an address space of `n_pages` zeroed pages. Every frame
    /// must be available; on shortage nothing is allocated. Used both
    /// for migration receive and, via the loader, for executables.
    pub fn new(
        pid: usize,
        n_pages: usize,
        machine: &Machine,
        frames: &FrameProvider,
    ) -> Result<Self> {
        let mut pool = frames.lock();
        if pool.available() < n_pages {
            return Err(KernelError::OutOfSpace);
        }
        log::debug!(
            target: "mm",
            "initializing address space, num pages {n_pages}, size {}",
            n_pages * PAGE_SIZE
        );
        let mut page_table = PageTable::new();
        for _ in 0..n_pages {
            // Cannot fail: availability was checked under the pool lock.
            let frame = pool.alloc_zeroed(machine).unwrap();
            page_table.push_frame(frame);
        }
        drop(pool);

        Ok(Self {
            pid,
            inner: Mutex::new(SpaceInner {
                page_table,
                brk: (n_pages * PAGE_SIZE) as u32,
                n_threads: 0,
                next_user_thread_id: 1,
                slots: [None; MAX_THREADS_PER_PROCESS],
                sems: [const { None }; MAX_SEM],
            }),
            join_cond: Condvar::new(),
            n_threads_cond: Condvar::new(),
        })
    }

    pub fn lock(&self) -> MutexGuard<'_, SpaceInner> {
        self.inner.lock().unwrap()
    }

    /// Size of the space in bytes.
    pub fn size(&self) -> usize {
        self.lock().page_table.len() * PAGE_SIZE
    }

    pub fn num_pages(&self) -> usize {
        self.lock().page_table.len()
    }

    /// Physical frame backing virtual page `vpn`.
    pub fn translate(&self, vpn: usize) -> Option<usize> {
        self.lock().page_table.translate(vpn)
    }

    /// Initial stack pointer for the user thread in slot `index`: the
    /// slots stack downward from just under the main thread's stack.
    pub fn slot_stack_top(&self, index: usize) -> u32 {
        (self.size() - 16 - (index + 1) * THREAD_STACK_SIZE) as u32
    }

    /// Grow the heap by `n_pages` fresh pages. Returns the previous
    /// break as a byte offset, or 0 when the frame pool cannot cover
    /// the request.
    pub fn sbrk(&self, n_pages: usize, machine: &Machine, frames: &FrameProvider) -> u32 {
        let mut inner = self.lock();
        let mut pool = frames.lock();
        if pool.available() < n_pages {
            return 0;
        }
        let old_brk = inner.brk;
        for _ in 0..n_pages {
            let frame = pool.alloc_zeroed(machine).unwrap();
            inner.page_table.push_frame(frame);
        }
        inner.brk = (inner.page_table.len() * PAGE_SIZE) as u32;
        old_brk
    }

    /// Claim a thread slot for kernel thread `tid`; returns the slot
    /// index and the process-scoped user thread id, or `None` when all
    /// slots are taken.
    pub fn allocate_thread_slot(&self, tid: usize) -> Option<(usize, u32)> {
        let mut inner = self.lock();
        let index = inner.slots.iter().position(|s| s.is_none())?;
        let user_thread_id = inner.next_user_thread_id;
        inner.next_user_thread_id += 1;
        inner.slots[index] = Some(ThreadSlot {
            tid,
            user_thread_id,
        });
        inner.n_threads += 1;
        Some((index, user_thread_id))
    }

    /// Install a migrated thread in a specific slot, keeping the user
    /// thread id counter ahead of every observed id.
    pub fn install_thread_slot(&self, index: usize, tid: usize, user_thread_id: u32) {
        let mut inner = self.lock();
        assert!(inner.slots[index].is_none());
        inner.slots[index] = Some(ThreadSlot {
            tid,
            user_thread_id,
        });
        inner.n_threads += 1;
        if inner.next_user_thread_id <= user_thread_id {
            inner.next_user_thread_id = user_thread_id + 1;
        }
    }

    /// Drop the slot owned by kernel thread `tid`; returns the number
    /// of non-main threads still alive and signals the main thread's
    /// wait when it reaches zero.
    pub fn release_thread_slot(&self, tid: usize) -> usize {
        let mut inner = self.lock();
        let index = inner
            .slots
            .iter()
            .position(|s| s.map(|s| s.tid) == Some(tid))
            .expect("exiting thread owns no slot");
        inner.slots[index] = None;
        inner.n_threads -= 1;
        if inner.n_threads == 0 {
            self.n_threads_cond.notify_all();
        }
        inner.n_threads
    }

    /// Slot of the live thread with user thread id `utid`.
    pub fn slot_of_user_thread(&self, utid: u32) -> Option<ThreadSlot> {
        let inner = self.lock();
        inner
            .slots
            .iter()
            .flatten()
            .find(|s| s.user_thread_id == utid)
            .copied()
    }

    /// Block until every non-main thread has exited. Called by the main
    /// thread on its way out.
    pub fn wait_no_threads(&self) {
        let mut inner = self.lock();
        while inner.n_threads != 0 {
            inner = self.n_threads_cond.wait(inner).unwrap();
        }
    }

    /// Return every frame of this space to the pool.
    pub fn release_frames(&self, frames: &FrameProvider) {
        let inner = self.lock();
        let mut pool = frames.lock();
        for frame in inner.page_table.frames() {
            pool.release(frame);
        }
    }

    /// Allocate a per-process semaphore slot.
    pub fn sem_init(&self, initial: i32) -> Option<usize> {
        let mut inner = self.lock();
        let id = inner.sems.iter().position(|s| s.is_none())?;
        inner.sems[id] = Some(Arc::new(Semaphore::new(initial)));
        Some(id)
    }

    /// The semaphore in slot `id`, if allocated.
    pub fn sem(&self, id: usize) -> Option<Arc<Semaphore>> {
        if id >= MAX_SEM {
            return None;
        }
        self.lock().sems[id].clone()
    }

    /// Free the semaphore in slot `id`; invalid ids are ignored.
    pub fn sem_destroy(&self, id: usize) {
        if id < MAX_SEM {
            self.lock().sems[id] = None;
        }
    }

    /// Install a migrated semaphore value in a specific slot.
    pub fn install_sem(&self, id: usize, value: i32) {
        self.lock().sems[id] = Some(Arc::new(Semaphore::new(value)));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::memory_layout::NUM_PHYS_PAGES;

    fn space(n_pages: usize) -> (Arc<Machine>, Arc<FrameProvider>, AddrSpace) {
        let machine = Arc::new(Machine::new());
        let frames = Arc::new(FrameProvider::new());
        let space = AddrSpace::new(1, n_pages, &machine, &frames).unwrap();
        (machine, frames, space)
    }

    #[test]
    fn frame_accounting_balances() {
        let (_, frames, space) = space(8);
        assert_eq!(frames.available() + space.num_pages(), NUM_PHYS_PAGES);
        space.release_frames(&frames);
        assert_eq!(frames.available(), NUM_PHYS_PAGES);
    }

    #[test]
    fn construction_refuses_oversized_space() {
        let machine = Machine::new();
        let frames = FrameProvider::new();
        assert_eq!(
            AddrSpace::new(0, NUM_PHYS_PAGES + 1, &machine, &frames).unwrap_err(),
            KernelError::OutOfSpace
        );
        // Nothing was taken from the pool.
        assert_eq!(frames.available(), NUM_PHYS_PAGES);
    }

    #[test]
    fn sbrk_appends_pages_and_returns_old_break() {
        let (machine, frames, space) = space(4);
        let old = space.sbrk(2, &machine, &frames);
        assert_eq!(old as usize, 4 * PAGE_SIZE);
        assert_eq!(space.num_pages(), 6);
        assert_eq!(space.lock().brk as usize, 6 * PAGE_SIZE);
        // The new pages translate.
        assert!(space.translate(5).is_some());
    }

    #[test]
    fn sbrk_fails_cleanly_when_pool_is_short() {
        let (machine, frames, space) = space(4);
        assert_eq!(space.sbrk(NUM_PHYS_PAGES, &machine, &frames), 0);
        assert_eq!(space.num_pages(), 4);
    }

    #[test]
    fn thread_slots_cycle() {
        let (_, _, space) = space(16);
        let (i0, u0) = space.allocate_thread_slot(10).unwrap();
        let (i1, u1) = space.allocate_thread_slot(11).unwrap();
        assert_eq!((i0, i1), (0, 1));
        assert_eq!((u0, u1), (1, 2));
        assert!(space.allocate_thread_slot(12).is_some());
        assert!(space.allocate_thread_slot(13).is_none());
        assert_eq!(space.release_thread_slot(11), 2);
        let (i3, u3) = space.allocate_thread_slot(14).unwrap();
        assert_eq!(i3, 1);
        // User thread ids are never reused while the process lives.
        assert_eq!(u3, 4);
    }

    #[test]
    fn slot_stacks_descend_from_main_stack() {
        let (_, _, space) = space(16);
        let size = space.size();
        assert_eq!(space.slot_stack_top(0) as usize, size - 16 - THREAD_STACK_SIZE);
        assert_eq!(
            space.slot_stack_top(1) as usize,
            size - 16 - 2 * THREAD_STACK_SIZE
        );
    }

    #[test]
    fn semaphore_slots_allocate_and_destroy() {
        let (_, _, space) = space(4);
        let id = space.sem_init(1).unwrap();
        assert!(space.sem(id).is_some());
        space.sem_destroy(id);
        assert!(space.sem(id).is_none());
        for _ in 0..MAX_SEM {
            space.sem_init(0).unwrap();
        }
        assert!(space.sem_init(0).is_none());
    }
}
