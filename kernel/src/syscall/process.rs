//! Process, thread and semaphore system calls

use crate::config::machine_layout::{MAX_STRING_SIZE, RET_REG};
use crate::kernel::Kernel;
use crate::task::{process, user_thread, CurrentThread};
use crate::trap::marshal;
use std::sync::Arc;

/// Exit the calling thread. The main thread first wakes process
/// joiners and waits out its user threads, then tears the process
/// down; any other thread just retires itself.
pub fn do_exit(kernel: &Arc<Kernel>, current: &mut CurrentThread, exit_code: i32) {
    if current.is_main {
        log::debug!(target: "task", "main thread {} exits", current.tid);
        process::main_exit_synchronize(kernel, current);
        if exit_code == 0 {
            kernel
                .console
                .put_string(&format!("\nProper exit of thread {}\n", current.tid));
        } else {
            kernel.console.put_string(&format!(
                "\nAbnormal exit of thread {}, exit code: {exit_code}\n",
                current.tid
            ));
        }
        process::end_process(kernel, current);
    } else {
        log::debug!(target: "task", "user thread {} exits", current.tid);
        user_thread::do_exit(kernel, current);
    }
}

pub fn sys_thread_create(kernel: &Arc<Kernel>, current: &mut CurrentThread, args: [i32; 4]) {
    let [f, arg, f_wrapper, _] = args;
    current.ctx.regs[RET_REG] = user_thread::do_create(kernel, current, f_wrapper, f, arg);
}

pub fn sys_thread_join(kernel: &Arc<Kernel>, current: &mut CurrentThread, args: [i32; 4]) {
    user_thread::do_join(kernel, current, args[0] as u32);
}

pub fn sys_process_join(kernel: &Arc<Kernel>, args: [i32; 4]) {
    if args[0] < 0 {
        return;
    }
    process::process_join(kernel, args[0] as usize);
}

pub fn sys_fork_exec(kernel: &Arc<Kernel>, current: &mut CurrentThread, args: [i32; 4]) {
    let path =
        marshal::string_from_machine(&kernel.machine, &current.ctx, args[0] as u32, MAX_STRING_SIZE);
    current.ctx.regs[RET_REG] = match process::fork_exec(kernel, &path) {
        Ok(pid) => pid as i32,
        Err(_) => -1,
    };
}

pub fn sys_sbrk(kernel: &Arc<Kernel>, current: &mut CurrentThread, args: [i32; 4]) {
    let n_pages = args[0].max(0) as usize;
    current.ctx.regs[RET_REG] =
        current
            .ctx
            .space
            .sbrk(n_pages, &kernel.machine, &kernel.frames) as i32;
}

/// Semaphore ids live in user memory: Seminit writes the new id to the
/// address in r4, and the other calls read it back from there.
pub fn sys_sem_init(kernel: &Arc<Kernel>, current: &mut CurrentThread, args: [i32; 4]) {
    let [sem_addr, initial, _, _] = args;
    let id = match current.ctx.space.sem_init(initial) {
        Some(id) => id as i32,
        None => -1,
    };
    current.ctx.write_mem(&kernel.machine, sem_addr as u32, 4, id);
}

fn sem_id(kernel: &Arc<Kernel>, current: &CurrentThread, sem_addr: i32) -> i32 {
    current.ctx.read_mem(&kernel.machine, sem_addr as u32, 4)
}

pub fn sys_sem_post(kernel: &Arc<Kernel>, current: &mut CurrentThread, args: [i32; 4]) {
    let id = sem_id(kernel, current, args[0]);
    if id >= 0 {
        if let Some(sem) = current.ctx.space.sem(id as usize) {
            sem.v();
        }
    }
}

pub fn sys_sem_wait(kernel: &Arc<Kernel>, current: &mut CurrentThread, args: [i32; 4]) {
    let id = sem_id(kernel, current, args[0]);
    if id >= 0 {
        if let Some(sem) = current.ctx.space.sem(id as usize) {
            sem.p();
        }
    }
}

pub fn sys_sem_destroy(kernel: &Arc<Kernel>, current: &mut CurrentThread, args: [i32; 4]) {
    let id = sem_id(kernel, current, args[0]);
    if id >= 0 {
        current.ctx.space.sem_destroy(id as usize);
    }
}
