//! Process lifecycle
//!
//! Pids come from a bounded map scanned from just past the previous
//! grant; the table also counts live processes, and the machine halts
//! when the count drops back to zero. ForkExec loads the executable on
//! the child thread and reports the outcome to the waiting parent.

use super::{CurrentThread, ThreadInfo};
use crate::config::task_limits::MAX_PROCESSES;
use crate::error::{KernelError, Result};
use crate::kernel::Kernel;
use crate::machine::UserContext;
use crate::mm::AddrSpace;
use crate::utils::BitMap;
use std::sync::mpsc;
use std::sync::{Arc, Condvar, Mutex, MutexGuard};

pub struct ProcState {
    pid_map: BitMap,
    last_pid: usize,
    n_used: usize,
    spaces: Vec<Option<Arc<AddrSpace>>>,
}

impl ProcState {
    /// Grant the next free pid, scanning from just past the last one.
    pub fn alloc_pid(&mut self) -> Option<usize> {
        let pid = self.pid_map.find_from(self.last_pid)?;
        self.last_pid = pid + 1;
        Some(pid)
    }

    pub fn pid_live(&self, pid: usize) -> bool {
        pid < MAX_PROCESSES && self.pid_map.test(pid)
    }

    pub fn release_pid(&mut self, pid: usize) {
        self.pid_map.clear(pid);
    }

    pub fn publish(&mut self, space: Arc<AddrSpace>) {
        let pid = space.pid;
        self.spaces[pid] = Some(space);
    }

    /// Unpublish the space at `pid` (failed arrivals only).
    pub fn withdraw(&mut self, pid: usize) {
        self.spaces[pid] = None;
    }

    pub fn space(&self, pid: usize) -> Option<Arc<AddrSpace>> {
        self.spaces.get(pid)?.clone()
    }

    pub fn n_used(&self) -> usize {
        self.n_used
    }

    /// Reserve a process slot; fails at the process limit.
    pub fn reserve(&mut self) -> Result<()> {
        if self.n_used >= MAX_PROCESSES {
            return Err(KernelError::OutOfSlots);
        }
        self.n_used += 1;
        Ok(())
    }

    /// Give a reserved slot back; returns the remaining count. Exiting
    /// processes go through `end_process` instead, which also halts the
    /// machine on zero.
    pub fn unreserve(&mut self) -> usize {
        self.n_used -= 1;
        self.n_used
    }
}

pub struct ProcessTable {
    state: Mutex<ProcState>,
}

impl ProcessTable {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(ProcState {
                pid_map: BitMap::new(MAX_PROCESSES),
                last_pid: 0,
                n_used: 0,
                spaces: (0..MAX_PROCESSES).map(|_| None).collect(),
            }),
        }
    }

    pub fn lock(&self) -> MutexGuard<'_, ProcState> {
        self.state.lock().unwrap()
    }
}

impl Default for ProcessTable {
    fn default() -> Self {
        Self::new()
    }
}

/// Register a fresh main thread for `space` and hand back its
/// `CurrentThread` with registers initialized.
pub fn register_main_thread(kernel: &Arc<Kernel>, space: Arc<AddrSpace>) -> Result<CurrentThread> {
    let mut threads = kernel.threads.lock();
    let tid = threads.alloc_tid().ok_or(KernelError::OutOfSlots)?;
    threads.install_info(
        tid,
        ThreadInfo {
            user_thread_id: 0,
            slot: None,
            pid: space.pid,
            cond: Arc::new(Condvar::new()),
        },
    );
    drop(threads);
    let mut current = CurrentThread {
        tid,
        is_main: true,
        finished: false,
        ctx: UserContext::new(space),
    };
    current.ctx.init_registers();
    Ok(current)
}

/// Load `path` into a fresh address space and main thread. The process
/// slot must already be reserved; it is given back on failure.
fn setup_process(kernel: &Arc<Kernel>, path: &str) -> Result<CurrentThread> {
    let mut exe = kernel.file_system.open(path)?;
    let pid = kernel
        .processes
        .lock()
        .alloc_pid()
        .ok_or(KernelError::OutOfSlots)?;
    let space = match crate::loader::new_space_from(kernel, pid, &mut exe) {
        Ok(space) => Arc::new(space),
        Err(e) => {
            kernel.processes.lock().release_pid(pid);
            return Err(e);
        }
    };
    kernel.processes.lock().publish(space.clone());
    match register_main_thread(kernel, space.clone()) {
        Ok(current) => Ok(current),
        Err(e) => {
            space.release_frames(&kernel.frames);
            let mut ps = kernel.processes.lock();
            ps.release_pid(pid);
            ps.spaces[pid] = None;
            Err(e)
        }
    }
}

/// Fork a kernel thread that loads and runs `path` as a new process.
/// Blocks until the child has published its address space (returning
/// the child pid) or failed to load (returning the error).
pub fn fork_exec(kernel: &Arc<Kernel>, path: &str) -> Result<usize> {
    kernel.processes.lock().reserve()?;

    let (tx, rx) = mpsc::channel();
    let kernel2 = kernel.clone();
    let path = path.to_string();
    std::thread::spawn(move || match setup_process(&kernel2, &path) {
        Ok(mut current) => {
            let pid = current.ctx.space.pid;
            log::debug!(target: "task", "forked process {pid} running {path}");
            let _ = tx.send(Ok(pid));
            super::run_user(&kernel2, &mut current);
        }
        Err(e) => {
            // The load never became a process; give the slot back
            // without the halt check an exiting process would do.
            kernel2.processes.lock().unreserve();
            let _ = tx.send(Err(e));
        }
    });

    rx.recv().unwrap_or(Err(KernelError::OutOfSlots))
}

/// Block until process `pid` has exited; invalid or dead pids return
/// immediately.
pub fn process_join(kernel: &Arc<Kernel>, pid: usize) {
    if pid >= MAX_PROCESSES {
        return;
    }
    log::debug!(target: "task", "joining process {pid}");
    let mut ps = kernel.processes.lock();
    while ps.pid_live(pid) {
        let Some(space) = ps.space(pid) else {
            break;
        };
        ps = space.join_cond.wait(ps).unwrap();
    }
}

/// Main-thread exit, first half: retire the pid, wake process joiners,
/// then wait until every user thread of this process has finished.
pub fn main_exit_synchronize(kernel: &Arc<Kernel>, current: &CurrentThread) {
    let space = &current.ctx.space;
    {
        let mut ps = kernel.processes.lock();
        ps.release_pid(space.pid);
        space.join_cond.notify_all();
        drop(ps);
    }
    space.wait_no_threads();
}

/// Main-thread exit, second half: give the frames back, retire the
/// main thread, and halt the machine when no process remains.
pub fn end_process(kernel: &Arc<Kernel>, current: &mut CurrentThread) {
    let mut ps = kernel.processes.lock();
    let mut threads = kernel.threads.lock();
    let space = &current.ctx.space;
    space.release_frames(&kernel.frames);
    if let Some(info) = threads.remove(current.tid) {
        info.cond.notify_all();
    }
    if let Some(published) = ps.spaces[space.pid].take() {
        // A later process may already own this pid slot; put it back.
        if !Arc::ptr_eq(&published, space) {
            ps.spaces[space.pid] = Some(published);
        }
    }
    let none_left = ps.unreserve() == 0;
    drop(threads);
    drop(ps);
    current.finished = true;
    if none_left {
        log::debug!(target: "task", "last process exited, halting");
        kernel.halt();
    }
}
