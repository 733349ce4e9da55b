//! Simulated machine
//!
//! One `Machine` value per simulated host: physical memory, the lossy
//! packet network port, and the user-program registry standing in for
//! the instruction interpreter. The register file lives in the
//! per-thread [`UserContext`](context::UserContext), swapped on trap
//! entry and exit.

pub mod context;
pub mod disk;
pub mod network;

pub use context::UserContext;

use crate::config::memory_layout::{NUM_PHYS_PAGES, PAGE_SIZE};
use crate::kernel::Kernel;
use crate::task::CurrentThread;
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard};

/// A piece of user code the machine can execute, keyed by its entry
/// address. Kernel-side behavior (register setup, stack carving, trap
/// marshalling) is identical whether code is interpreted or hosted.
pub trait UserProgram: Send + Sync {
    fn run(&self, kernel: &Arc<Kernel>, current: &mut CurrentThread);
}

impl<F> UserProgram for F
where
    F: Fn(&Arc<Kernel>, &mut CurrentThread) + Send + Sync,
{
    fn run(&self, kernel: &Arc<Kernel>, current: &mut CurrentThread) {
        self(kernel, current)
    }
}

pub struct Machine {
    ram: Mutex<Vec<u8>>,
    programs: spin::Mutex<BTreeMap<u32, Arc<dyn UserProgram>>>,
    /// Stand-in for the interrupt mask: held for the whole of a
    /// critical region that must not interleave with another such
    /// region on this machine (process migration streams under it).
    int_mask: Mutex<()>,
}

impl Machine {
    pub fn new() -> Self {
        Self {
            ram: Mutex::new(vec![0u8; NUM_PHYS_PAGES * PAGE_SIZE]),
            programs: spin::Mutex::new(BTreeMap::new()),
            int_mask: Mutex::new(()),
        }
    }

    /// Raise the interrupt mask; dropped guard restores it.
    pub fn disable_interrupts(&self) -> MutexGuard<'_, ()> {
        self.int_mask.lock().unwrap()
    }

    /// Zero one physical frame.
    pub fn zero_frame(&self, frame: usize) {
        assert!(frame < NUM_PHYS_PAGES);
        let mut ram = self.ram.lock().unwrap();
        ram[frame * PAGE_SIZE..(frame + 1) * PAGE_SIZE].fill(0);
    }

    /// Read `buf.len()` bytes at a physical address.
    pub fn read_phys(&self, phys_addr: usize, buf: &mut [u8]) {
        let ram = self.ram.lock().unwrap();
        buf.copy_from_slice(&ram[phys_addr..phys_addr + buf.len()]);
    }

    /// Write `buf` at a physical address.
    pub fn write_phys(&self, phys_addr: usize, buf: &[u8]) {
        let mut ram = self.ram.lock().unwrap();
        ram[phys_addr..phys_addr + buf.len()].copy_from_slice(buf);
    }

    /// Register a user program image at its entry address.
    pub fn install_program(&self, entry: u32, program: Arc<dyn UserProgram>) {
        self.programs.lock().insert(entry, program);
    }

    /// The program whose entry address is `pc`, if any is loaded.
    pub fn program_at(&self, pc: u32) -> Option<Arc<dyn UserProgram>> {
        self.programs.lock().get(&pc).cloned()
    }
}

impl Default for Machine {
    fn default() -> Self {
        Self::new()
    }
}
