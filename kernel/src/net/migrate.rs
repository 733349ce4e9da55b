//! Process migration
//!
//! Streams a whole process over one connection, in strict order: page
//! count, memory bytes one by one, the sending thread's registers, the
//! semaphore table, then each user-thread slot with its register file.
//! The sender runs with interrupts masked so nothing of the process
//! moves while it streams; a failed send aborts with the sender's
//! state intact. The receiver rebuilds the address space, overwrites
//! r2 with 1 so the resumed code can tell it is the far side, and
//! forks every received thread.

use crate::config::machine_layout::NUM_TOTAL_REGS;
use crate::config::memory_layout::PAGE_SIZE;
use crate::config::task_limits::{MAX_SEM, MAX_THREADS_PER_PROCESS};
use crate::kernel::Kernel;
use crate::machine::UserContext;
use crate::mm::AddrSpace;
use crate::net::Connection;
use crate::task::{run_user, CurrentThread, ThreadInfo};
use std::sync::{Arc, Condvar};

/// Sentinel marking an unused semaphore or thread slot on the wire.
const NO_DATA: i32 = i32::MAX;

fn send_i32(kernel: &Arc<Kernel>, conn: &mut Connection, value: i32) -> bool {
    kernel.post_office.send(conn, &value.to_le_bytes())
}

fn recv_i32(kernel: &Arc<Kernel>, conn: &mut Connection) -> i32 {
    let data = kernel.post_office.receive(conn);
    i32::from_le_bytes(data[..4].try_into().expect("short migration message"))
}

/// Ship the calling thread's process to `far_addr`. Returns `false` on
/// any send failure; no frames have been freed, so the caller may
/// simply keep running.
pub fn send_process(kernel: &Arc<Kernel>, current: &CurrentThread, far_addr: i32) -> bool {
    let _int_off = kernel.machine.disable_interrupts();
    let space = &current.ctx.space;
    let Some(mut conn) = kernel.post_office.connect(far_addr) else {
        return false;
    };
    log::debug!(
        target: "net",
        "migrating process {} to machine {far_addr}",
        space.pid
    );

    let num_pages = space.num_pages();
    if !send_i32(kernel, &mut conn, num_pages as i32) {
        return false;
    }
    // Memory goes byte by byte, each one read back through the page
    // table exactly as the far side will write it.
    for addr in 0..(num_pages * PAGE_SIZE) as u32 {
        let value = current.ctx.read_mem(&kernel.machine, addr, 1);
        if !kernel.post_office.send(&mut conn, &[value as u8]) {
            return false;
        }
    }

    for r in 0..NUM_TOTAL_REGS {
        if !send_i32(kernel, &mut conn, current.ctx.regs[r]) {
            return false;
        }
    }

    let sem_values: Vec<i32> = {
        let inner = space.lock();
        inner
            .sems
            .iter()
            .map(|s| s.as_ref().map(|s| s.value()).unwrap_or(NO_DATA))
            .collect()
    };
    for value in sem_values {
        if !send_i32(kernel, &mut conn, value) {
            return false;
        }
    }

    let (n_threads, slots) = {
        let inner = space.lock();
        (inner.n_threads, inner.slots)
    };
    if !send_i32(kernel, &mut conn, n_threads as i32) {
        return false;
    }

    for slot in slots.iter().take(MAX_THREADS_PER_PROCESS) {
        let live = slot.and_then(|s| {
            let threads = kernel.threads.lock();
            threads
                .is_live(s.tid)
                .then(|| threads.regs_of(s.tid))
                .flatten()
                .map(|regs| (s.user_thread_id, regs))
        });
        match live {
            Some((user_thread_id, regs)) => {
                if !send_i32(kernel, &mut conn, user_thread_id as i32) {
                    return false;
                }
                for r in 0..NUM_TOTAL_REGS {
                    if !send_i32(kernel, &mut conn, regs[r]) {
                        return false;
                    }
                }
            }
            None => {
                if !send_i32(kernel, &mut conn, NO_DATA) {
                    return false;
                }
            }
        }
    }

    kernel.post_office.disconnect(conn);
    true
}

/// Accept one migrated process: rebuild its address space, semaphores
/// and threads, fork them all, and return the new pid (-1 on failure).
pub fn listen_process(kernel: &Arc<Kernel>) -> i32 {
    let Some(mut conn) = kernel.post_office.listen() else {
        return -1;
    };
    if kernel.processes.lock().reserve().is_err() {
        log::warn!(target: "net", "migration refused: process table full");
        return -1;
    }
    log::debug!(
        target: "net",
        "receiving process from machine {}",
        conn.p_in.pkt.from
    );

    let num_pages = recv_i32(kernel, &mut conn) as usize;
    let pid = match kernel.processes.lock().alloc_pid() {
        Some(pid) => pid,
        None => {
            kernel.processes.lock().unreserve();
            return -1;
        }
    };
    let space = match AddrSpace::new(pid, num_pages, &kernel.machine, &kernel.frames) {
        Ok(space) => Arc::new(space),
        Err(_) => {
            let mut ps = kernel.processes.lock();
            ps.release_pid(pid);
            ps.unreserve();
            return -1;
        }
    };
    kernel.processes.lock().publish(space.clone());

    // Fill memory through a context of the new space, byte by byte.
    let fill = UserContext::new(space.clone());
    for addr in 0..(num_pages * PAGE_SIZE) as u32 {
        let data = kernel.post_office.receive(&mut conn);
        fill.write_mem(&kernel.machine, addr, 1, data[0] as i32);
    }

    let mut main_regs = [0i32; NUM_TOTAL_REGS];
    for reg in main_regs.iter_mut() {
        *reg = recv_i32(kernel, &mut conn);
    }
    // The far side of Sendprocess resumes with 1 in the result
    // register, where the near side saw 0.
    main_regs[crate::config::machine_layout::RET_REG] = 1;

    for i in 0..MAX_SEM {
        let value = recv_i32(kernel, &mut conn);
        if value != NO_DATA {
            log::debug!(target: "net", "receiving semaphore {i} = {value}");
            space.install_sem(i, value);
        }
    }

    let wire_n_threads = recv_i32(kernel, &mut conn);
    log::debug!(target: "net", "expecting {wire_n_threads} user threads");

    for slot_index in 0..MAX_THREADS_PER_PROCESS {
        let user_thread_id = recv_i32(kernel, &mut conn);
        if user_thread_id == NO_DATA {
            continue;
        }
        let mut regs = [0i32; NUM_TOTAL_REGS];
        for reg in regs.iter_mut() {
            *reg = recv_i32(kernel, &mut conn);
        }
        let Some(tid) = kernel.threads.lock().alloc_tid() else {
            continue;
        };
        kernel.threads.lock().install_info(
            tid,
            ThreadInfo {
                user_thread_id: user_thread_id as u32,
                slot: Some(slot_index),
                pid,
                cond: Arc::new(Condvar::new()),
            },
        );
        space.install_thread_slot(slot_index, tid, user_thread_id as u32);
        let kernel2 = kernel.clone();
        let space2 = space.clone();
        std::thread::spawn(move || {
            let mut current = CurrentThread {
                tid,
                is_main: false,
                finished: false,
                ctx: UserContext::new(space2),
            };
            current.ctx.regs = regs;
            run_user(&kernel2, &mut current);
        });
    }

    // The main thread comes back to life last, like the others.
    match crate::task::process::register_main_thread(kernel, space.clone()) {
        Ok(mut current) => {
            current.ctx.regs = main_regs;
            let kernel2 = kernel.clone();
            std::thread::spawn(move || run_user(&kernel2, &mut current));
        }
        Err(_) => {
            log::warn!(target: "net", "no kernel thread for the migrated main thread");
            space.release_frames(&kernel.frames);
            {
                let mut ps = kernel.processes.lock();
                ps.withdraw(pid);
                ps.release_pid(pid);
                ps.unreserve();
            }
            kernel.post_office.disconnect(conn);
            return -1;
        }
    }

    kernel.post_office.disconnect(conn);
    pid as i32
}
