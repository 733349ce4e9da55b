//! User-level threads
//!
//! Creation carves a stack slot out of the process's user stack, forks
//! a kernel thread whose context starts at the user wrapper routine,
//! and hands back a process-scoped thread id. Exit wakes joiners and,
//! for the last thread, the main thread's wait.

use super::{run_user, CurrentThread, ThreadInfo};
use crate::config::machine_layout::*;
use crate::kernel::Kernel;
use crate::machine::UserContext;
use std::sync::{Arc, Condvar};

/// Create a user thread running `f_wrapper(arg, f)` on a fresh slot
/// stack. Returns the user thread id, or -1 when the thread or slot
/// tables are exhausted.
pub fn do_create(kernel: &Arc<Kernel>, current: &CurrentThread, f_wrapper: i32, f: i32, arg: i32) -> i32 {
    let space = current.ctx.space.clone();
    let mut threads = kernel.threads.lock();
    let Some(tid) = threads.alloc_tid() else {
        return -1;
    };
    let Some((slot, user_thread_id)) = space.allocate_thread_slot(tid) else {
        threads.release_tid(tid);
        return -1;
    };
    threads.install_info(
        tid,
        ThreadInfo {
            user_thread_id,
            slot: Some(slot),
            pid: space.pid,
            cond: Arc::new(Condvar::new()),
        },
    );
    drop(threads);

    log::debug!(target: "task", "start user thread {user_thread_id} (tid {tid}) in slot {slot}");
    let kernel = kernel.clone();
    std::thread::spawn(move || {
        let mut current = CurrentThread {
            tid,
            is_main: false,
            finished: false,
            ctx: UserContext::new(space),
        };
        current.ctx.init_registers();
        // Enter through the user wrapper so a plain return still goes
        // through Threadexit; arguments ride in r4 and r5.
        current.ctx.regs[PC_REG] = f_wrapper;
        current.ctx.regs[NEXT_PC_REG] = f_wrapper + 4;
        current.ctx.regs[STACK_REG] = current.ctx.space.slot_stack_top(slot) as i32;
        current.ctx.regs[ARG_REG] = arg;
        current.ctx.regs[ARG_REG + 1] = f;
        run_user(&kernel, &mut current);
    });

    user_thread_id as i32
}

/// Exit the calling user thread: wake joiners, free the slot, and wake
/// the main thread when this was the last one.
pub fn do_exit(kernel: &Arc<Kernel>, current: &mut CurrentThread) {
    let mut threads = kernel.threads.lock();
    let info = threads.info(current.tid).expect("exiting thread has no info");
    info.cond.notify_all();
    threads.remove(current.tid);
    drop(threads);

    current.ctx.space.release_thread_slot(current.tid);
    current.finished = true;
}

/// Block until the thread with user id `user_thread_id` (in the
/// caller's process) has exited. Unknown ids return at once.
pub fn do_join(kernel: &Arc<Kernel>, current: &CurrentThread, user_thread_id: u32) {
    let space = current.ctx.space.clone();
    log::debug!(target: "task", "thread {} joins user thread {user_thread_id}", current.tid);
    let mut threads = kernel.threads.lock();
    loop {
        let Some(slot) = space.slot_of_user_thread(user_thread_id) else {
            break;
        };
        if !threads.is_live(slot.tid) {
            break;
        }
        let cond = threads.info(slot.tid).expect("live thread has info").cond.clone();
        threads = cond.wait(threads).unwrap();
    }
}
