//! Process migration between two machines
//!
//! The sender seeds its memory with a pattern derived from its pid,
//! parks a user thread on a zero-valued semaphore, stamps a magic
//! value in a scratch register, and ships itself over the wire. The
//! far side must observe the same memory bytes and register, find the
//! semaphore and thread slots restored, and be able to unblock the
//! parked thread by posting the migrated semaphore.

use minos::config::machine_layout::ARG_REG;
use minos::config::machine_layout::RET_REG;
use minos::config::memory_layout::PAGE_SIZE;
use minos::kernel::{Kernel, KernelOptions};
use minos::machine::network::Wire;
use minos::net::migrate;
use minos::progs::{self, UserProc};
use minos::syscall::SYSCALL_THREADCREATE;
use minos::task::{process, CurrentThread};
use std::sync::{Arc, Mutex};

const K_MIG_MAIN: u32 = 0x0200;
const K_MIG_WORKER: u32 = 0x0201;

const SENDER_ADDR: i32 = 20;
const RECEIVER_ADDR: i32 = 1;

const N_PAGES: usize = 8;
/// The worker's entry sits in the upper half of the code page; the
/// main routine writes the worker key there before forking it, and
/// its own PC never runs that far.
const WORKER_ENTRY: u32 = 0x40;
/// Scratch cells live in the second page: the sender's pid, the
/// ready and park semaphore id cells, the worker progress flag, then
/// the pattern.
const PID_CELL: u32 = PAGE_SIZE as u32;
const READY_CELL: u32 = PAGE_SIZE as u32 + 4;
const SEM_CELL: u32 = PAGE_SIZE as u32 + 8;
const FLAG_CELL: u32 = PAGE_SIZE as u32 + 12;
const PATTERN_BASE: u32 = PAGE_SIZE as u32 + 16;
const PATTERN_WORDS: u32 = 64;

/// Survives in a register that no syscall argument clobbers.
const MAGIC_REG: usize = 16;
const REG_MAGIC: i32 = 0x5EED;

fn pattern_word(pid: i32, i: u32) -> i32 {
    pid.wrapping_mul(0x0101_0101).wrapping_add(i as i32 * 31)
}

#[derive(Default)]
struct Outcome {
    sent: Option<bool>,
    far_pattern_ok: Option<bool>,
    far_reg: Option<i32>,
    /// `(machine, flag)` reported by each worker as it completes.
    worker_flags: Vec<(i32, i32)>,
}

fn install(kernel: &Arc<Kernel>, outcome: Arc<Mutex<Outcome>>) {
    let report = outcome.clone();
    kernel.machine.install_program(
        K_MIG_MAIN,
        Arc::new(move |kernel: &Arc<Kernel>, current: &mut CurrentThread| {
            let mut proc = UserProc::new(kernel, current);
            if proc.current.ctx.regs[RET_REG] != 1 {
                // Near side: lay down state, park a worker, migrate.
                let pid = proc.current.ctx.space.pid as i32;
                proc.store_word(PID_CELL, pid);
                for i in 0..PATTERN_WORDS {
                    proc.store_word(PATTERN_BASE + i * 4, pattern_word(pid, i));
                }
                proc.sem_init(READY_CELL, 0);
                proc.sem_init(SEM_CELL, 0);
                // The worker's code words, then the worker itself,
                // started straight at its entry.
                proc.store_word(WORKER_ENTRY, K_MIG_WORKER as i32);
                proc.store_word(WORKER_ENTRY + 4, K_MIG_WORKER as i32);
                proc.syscall(
                    SYSCALL_THREADCREATE,
                    [0, READY_CELL as i32, WORKER_ENTRY as i32, 0],
                );
                // Wait until the worker has trapped at least once, so
                // its registers are on file before they are streamed.
                proc.sem_wait(READY_CELL);
                proc.current.ctx.regs[MAGIC_REG] = REG_MAGIC;
                let sent = proc.send_process(RECEIVER_ADDR, false);
                report.lock().unwrap().sent = Some(sent == 0);
                // Release our own copy of the worker before exiting.
                proc.sem_post(SEM_CELL);
                proc.exit(0);
            } else {
                // Far side: validate what crossed the wire.
                let far_reg = proc.current.ctx.regs[MAGIC_REG];
                let sender_pid = proc.load_word(PID_CELL);
                let pattern_ok = (0..PATTERN_WORDS)
                    .all(|i| proc.load_word(PATTERN_BASE + i * 4) == pattern_word(sender_pid, i));
                {
                    let mut out = report.lock().unwrap();
                    out.far_pattern_ok = Some(pattern_ok);
                    out.far_reg = Some(far_reg);
                }
                // Post the migrated semaphore so the migrated worker
                // can run to completion.
                proc.sem_post(SEM_CELL);
                proc.exit(0);
            }
        }),
    );

    let report = outcome;
    let machine_addr = kernel.post_office.net_addr();
    kernel.machine.install_program(
        K_MIG_WORKER,
        Arc::new(move |kernel: &Arc<Kernel>, current: &mut CurrentThread| {
            let ready_cell = current.ctx.regs[ARG_REG] as u32;
            let mut proc = UserProc::new(kernel, current);
            proc.sem_post(ready_cell);
            proc.sem_wait(SEM_CELL);
            proc.store_word(FLAG_CELL, 1);
            let flag = proc.load_word(FLAG_CELL);
            report.lock().unwrap().worker_flags.push((machine_addr, flag));
        }),
    );
}

#[test]
fn migrated_process_carries_memory_registers_semaphores_and_threads() {
    let _ = env_logger::builder().is_test(true).try_init();
    let wire = Arc::new(Wire::new());
    let sender = Kernel::new(KernelOptions {
        net_addr: SENDER_ADDR,
        wire: Some(wire.clone()),
        ..Default::default()
    });
    let receiver = Kernel::new(KernelOptions {
        net_addr: RECEIVER_ADDR,
        wire: Some(wire),
        ..Default::default()
    });

    let outcome = Arc::new(Mutex::new(Outcome::default()));
    install(&sender, outcome.clone());
    install(&receiver, outcome.clone());

    let far = {
        let receiver = receiver.clone();
        std::thread::spawn(move || migrate::listen_process(&receiver))
    };

    let near_pid = progs::spawn_program(&sender, N_PAGES, K_MIG_MAIN).unwrap();
    let far_pid = far.join().unwrap();
    assert!(far_pid >= 0, "migration receive failed");

    process::process_join(&sender, near_pid);
    process::process_join(&receiver, far_pid as usize);

    // A process retires its pid before its last workers finish, so
    // give both workers a bounded window to report in.
    let deadline = std::time::Instant::now() + std::time::Duration::from_secs(10);
    while outcome.lock().unwrap().worker_flags.len() < 2 {
        assert!(
            std::time::Instant::now() < deadline,
            "workers never completed on both machines"
        );
        std::thread::sleep(std::time::Duration::from_millis(10));
    }

    let out = outcome.lock().unwrap();
    assert_eq!(out.sent, Some(true), "sender must report success");
    assert_eq!(out.far_pattern_ok, Some(true), "memory must cross intact");
    assert_eq!(out.far_reg, Some(REG_MAGIC), "registers must cross intact");
    let mut machines: Vec<i32> = out.worker_flags.iter().map(|(m, _)| *m).collect();
    machines.sort();
    assert_eq!(
        machines,
        vec![RECEIVER_ADDR, SENDER_ADDR],
        "one worker must complete on each machine"
    );
    assert!(out.worker_flags.iter().all(|(_, flag)| *flag == 1));

    sender.shutdown();
    receiver.shutdown();
}
