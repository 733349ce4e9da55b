//! Kernel thread runtime
//!
//! A global table gates thread-id validity and holds, per thread, the
//! join condition and the user registers saved at the last trap. User
//! threads run on host threads; the slot table inside each address
//! space assigns them their stacks.

pub mod process;
pub mod user_thread;

pub use process::ProcessTable;

use crate::config::machine_layout::NUM_TOTAL_REGS;
use crate::config::task_limits::MAX_THREADS;
use crate::kernel::Kernel;
use crate::machine::UserContext;
use crate::utils::BitMap;
use std::sync::{Arc, Condvar, Mutex, MutexGuard};

pub struct ThreadInfo {
    pub user_thread_id: u32,
    pub slot: Option<usize>,
    pub pid: usize,
    /// Joiners wait here, under the thread-table lock.
    pub cond: Arc<Condvar>,
}

pub struct Threads {
    tid_map: BitMap,
    infos: Vec<Option<ThreadInfo>>,
    saved_regs: Vec<Option<[i32; NUM_TOTAL_REGS]>>,
}

impl Threads {
    pub fn alloc_tid(&mut self) -> Option<usize> {
        self.tid_map.find()
    }

    pub fn release_tid(&mut self, tid: usize) {
        self.tid_map.clear(tid);
    }

    pub fn is_live(&self, tid: usize) -> bool {
        tid < MAX_THREADS && self.tid_map.test(tid)
    }

    pub fn install_info(&mut self, tid: usize, info: ThreadInfo) {
        self.infos[tid] = Some(info);
    }

    pub fn info(&self, tid: usize) -> Option<&ThreadInfo> {
        self.infos.get(tid)?.as_ref()
    }

    /// Retire a thread: invalidate its id and take its info entry.
    pub fn remove(&mut self, tid: usize) -> Option<ThreadInfo> {
        self.tid_map.clear(tid);
        self.saved_regs[tid] = None;
        self.infos[tid].take()
    }

    /// Record the register file published at a trap.
    pub fn save_regs(&mut self, tid: usize, regs: &[i32; NUM_TOTAL_REGS]) {
        self.saved_regs[tid] = Some(*regs);
    }

    /// Registers of a thread as of its last trap; migration reads the
    /// register files of suspended sibling threads through this.
    pub fn regs_of(&self, tid: usize) -> Option<[i32; NUM_TOTAL_REGS]> {
        self.saved_regs.get(tid).copied().flatten()
    }
}

pub struct ThreadTable {
    state: Mutex<Threads>,
}

impl ThreadTable {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(Threads {
                tid_map: BitMap::new(MAX_THREADS),
                infos: (0..MAX_THREADS).map(|_| None).collect(),
                saved_regs: vec![None; MAX_THREADS],
            }),
        }
    }

    pub fn lock(&self) -> MutexGuard<'_, Threads> {
        self.state.lock().unwrap()
    }
}

impl Default for ThreadTable {
    fn default() -> Self {
        Self::new()
    }
}

/// The kernel-side identity of the running thread, carried through
/// every trap together with its user context.
pub struct CurrentThread {
    pub tid: usize,
    pub is_main: bool,
    /// Set once the thread has gone through its exit path; the host
    /// thread unwinds without touching kernel state again.
    pub finished: bool,
    pub ctx: UserContext,
}

/// Hand the CPU to user code: the instruction word under the PC names
/// the loaded program routine to run (loaders fill a routine's whole
/// code region with its key, so any PC inside it resolves). When the
/// program returns without having exited, the kernel completes the
/// exit on its behalf.
pub fn run_user(kernel: &Arc<Kernel>, current: &mut CurrentThread) {
    let pc = current.ctx.pc();
    let program = current
        .ctx
        .space
        .translate(pc as usize / crate::config::memory_layout::PAGE_SIZE)
        .and_then(|_| {
            let key = current.ctx.read_mem(&kernel.machine, pc & !3, 4) as u32;
            kernel.machine.program_at(key)
        });
    match program {
        Some(program) => program.run(kernel, current),
        None => log::warn!(
            target: "task",
            "no program image under pc {pc:#x}; thread {} exits",
            current.tid
        ),
    }
    if !current.finished {
        crate::syscall::process::do_exit(kernel, current, 0);
    }
}
