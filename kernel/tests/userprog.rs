//! User programs end to end: loader, traps, threads, shell

use minos::console::Console;
use minos::kernel::{Kernel, KernelOptions};
use minos::machine::network::Wire;
use minos::progs::{self, UserProc};
use minos::task::{process, CurrentThread};
use minos::{shell, syscall};
use std::io::{Cursor, Write};
use std::sync::{Arc, Mutex};

/// Console sink the test can read back after the run.
#[derive(Clone, Default)]
struct SharedBuf(Arc<Mutex<Vec<u8>>>);

impl Write for SharedBuf {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.0.lock().unwrap().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

impl SharedBuf {
    fn contents(&self) -> String {
        String::from_utf8_lossy(&self.0.lock().unwrap()).into_owned()
    }
}

fn kernel_with_console(net_addr: i32, input: &str) -> (Arc<Kernel>, SharedBuf) {
    let _ = env_logger::builder().is_test(true).try_init();
    let out = SharedBuf::default();
    let console = Console::with_io(
        Box::new(Cursor::new(input.as_bytes().to_vec())),
        Box::new(out.clone()),
    );
    let kernel = Kernel::new(KernelOptions {
        net_addr,
        wire: Some(Arc::new(Wire::new())),
        console: Some(console),
        ..Default::default()
    });
    progs::install_demos(&kernel);
    (kernel, out)
}

#[test]
fn two_threads_of_five_hundred_increments_reach_one_thousand() {
    let (kernel, out) = kernel_with_console(40, "");
    progs::write_demo_executables(&kernel).unwrap();

    let pid = process::fork_exec(&kernel, "counter").unwrap();
    process::process_join(&kernel, pid);

    assert!(
        out.contents().contains("1000"),
        "counter output was: {:?}",
        out.contents()
    );
}

#[test]
fn shell_echo_and_cat_round_trip() {
    let script = "touch Test\necho Hello, World! Test\ncat Test\nquit\n";
    let (kernel, out) = kernel_with_console(41, script);
    shell::run_shell(&kernel, 0);
    assert!(
        out.contents().contains("Hello, World!"),
        "shell output was: {:?}",
        out.contents()
    );
}

#[test]
fn machine_halts_when_the_last_process_exits() {
    let (kernel, _out) = kernel_with_console(42, "");
    progs::write_demo_executables(&kernel).unwrap();
    let pid = process::fork_exec(&kernel, "hello").unwrap();
    process::process_join(&kernel, pid);
    kernel.wait_for_halt();
    assert!(kernel.is_halted());
}

#[test]
fn fork_exec_of_a_missing_file_fails() {
    let (kernel, _out) = kernel_with_console(43, "");
    assert!(process::fork_exec(&kernel, "absent").is_err());
    // The failed load must not leave a process slot behind.
    assert_eq!(kernel.processes.lock().n_used(), 0);
}

#[test]
fn sbrk_grows_the_heap_and_zeroes_it() {
    let (kernel, _out) = kernel_with_console(44, "");
    let outcome: Arc<Mutex<Option<(i32, i32, i32)>>> = Arc::new(Mutex::new(None));
    let report = outcome.clone();
    const K_SBRK: u32 = 0x0300;
    kernel.machine.install_program(
        K_SBRK,
        Arc::new(move |kernel: &Arc<Kernel>, current: &mut CurrentThread| {
            let mut proc = UserProc::new(kernel, current);
            let old_brk = proc.sbrk(2);
            let fresh = proc.load_word(old_brk as u32);
            proc.store_word(old_brk as u32, 77);
            let stored = proc.load_word(old_brk as u32);
            *report.lock().unwrap() = Some((old_brk, fresh, stored));
            proc.exit(0);
        }),
    );

    let pid = progs::spawn_program(&kernel, 4, K_SBRK).unwrap();
    process::process_join(&kernel, pid);

    let (old_brk, fresh, stored) = outcome.lock().unwrap().take().unwrap();
    assert_eq!(
        old_brk as usize,
        4 * minos::config::memory_layout::PAGE_SIZE,
        "sbrk must return the previous break"
    );
    assert_eq!(fresh, 0, "fresh heap pages read back zero");
    assert_eq!(stored, 77);
}

#[test]
fn unknown_syscalls_advance_past_the_trap() {
    let (kernel, _out) = kernel_with_console(45, "");
    let outcome: Arc<Mutex<Option<(u32, u32)>>> = Arc::new(Mutex::new(None));
    let report = outcome.clone();
    const K_BAD: u32 = 0x0301;
    kernel.machine.install_program(
        K_BAD,
        Arc::new(move |kernel: &Arc<Kernel>, current: &mut CurrentThread| {
            let mut proc = UserProc::new(kernel, current);
            let before = proc.current.ctx.pc();
            proc.syscall(99, [0, 0, 0, 0]);
            let after = proc.current.ctx.pc();
            *report.lock().unwrap() = Some((before, after));
            proc.exit(0);
        }),
    );

    let pid = progs::spawn_program(&kernel, 4, K_BAD).unwrap();
    process::process_join(&kernel, pid);

    let (before, after) = outcome.lock().unwrap().take().unwrap();
    assert_eq!(after, before + 4, "the PC must move past an unknown syscall");
}

#[test]
fn syscall_numbers_match_the_published_table() {
    assert_eq!(syscall::SYSCALL_HALT, 0);
    assert_eq!(syscall::SYSCALL_EXIT, 1);
    assert_eq!(syscall::SYSCALL_CREATE, 4);
    assert_eq!(syscall::SYSCALL_CLOSE, 8);
    assert_eq!(syscall::SYSCALL_GETINT, 16);
    assert_eq!(syscall::SYSCALL_THREADCREATE, 17);
    assert_eq!(syscall::SYSCALL_SEMDESTROY, 23);
    assert_eq!(syscall::SYSCALL_FORKEXEC, 24);
    assert_eq!(syscall::SYSCALL_SBRK, 25);
    assert_eq!(syscall::SYSCALL_SEEK, 31);
    assert_eq!(syscall::SYSCALL_SENDPROCESS, 32);
    assert_eq!(syscall::SYSCALL_STARTFTPSERVER, 37);
}
