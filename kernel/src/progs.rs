//! Built-in user programs
//!
//! Host-side routines standing in for user code: each is installed
//! under a key, and executables carry that key as their instruction
//! words. [`UserProc`] is the user-side calling convention: it places
//! arguments in the argument registers and traps, exactly as compiled
//! code would.
//!
//! The demo executables lay their routines out in fixed code regions:
//! the main routine at 0x000, a worker at 0x040, the thread-exit
//! wrapper at 0x080, with a scratch area for shared variables at
//! `DEMO_SCRATCH` in the zeroed data segment.

use crate::config::machine_layout::*;
use crate::kernel::Kernel;
use crate::loader::{ObjHeader, Segment, OBJ_HEADER_SIZE};
use crate::syscall::*;
use crate::task::CurrentThread;
use std::sync::Arc;

pub const K_WRAPPER: u32 = 0x0100;
pub const K_HELLO: u32 = 0x0101;
pub const K_COUNTER_MAIN: u32 = 0x0102;
pub const K_INCR: u32 = 0x0103;

pub const MAIN_ENTRY: u32 = 0x000;
pub const ROUTINE_B: u32 = 0x040;
pub const ROUTINE_C: u32 = 0x080;
const REGION_BYTES: usize = 0x40;

/// Shared-variable area of the demo executables, inside their zeroed
/// data segment.
pub const DEMO_SCRATCH: u32 = 0x400;

/// User-side syscall convention over a thread's context.
pub struct UserProc<'a, 'b> {
    pub kernel: &'a Arc<Kernel>,
    pub current: &'b mut CurrentThread,
}

impl<'a, 'b> UserProc<'a, 'b> {
    pub fn new(kernel: &'a Arc<Kernel>, current: &'b mut CurrentThread) -> Self {
        Self { kernel, current }
    }

    /// Trap into the kernel with `code` and up to four arguments.
    pub fn syscall(&mut self, code: i32, args: [i32; 4]) -> i32 {
        if self.current.finished {
            return -1;
        }
        self.current.ctx.regs[RET_REG] = code;
        self.current.ctx.regs[ARG_REG..ARG_REG + 4].copy_from_slice(&args);
        crate::trap::handle_syscall(self.kernel, self.current);
        self.current.ctx.regs[RET_REG]
    }

    pub fn store_word(&mut self, addr: u32, value: i32) {
        self.current.ctx.write_mem(&self.kernel.machine, addr, 4, value);
    }

    pub fn load_word(&self, addr: u32) -> i32 {
        self.current.ctx.read_mem(&self.kernel.machine, addr, 4)
    }

    pub fn store_cstr(&mut self, addr: u32, s: &str) {
        crate::trap::marshal::string_to_machine(&self.kernel.machine, &self.current.ctx, addr, s);
    }

    pub fn exit(&mut self, code: i32) {
        self.syscall(SYSCALL_EXIT, [code, 0, 0, 0]);
    }

    pub fn create(&mut self, name_addr: u32) -> i32 {
        self.syscall(SYSCALL_CREATE, [name_addr as i32, 0, 0, 0])
    }

    pub fn open(&mut self, name_addr: u32) -> i32 {
        self.syscall(SYSCALL_OPEN, [name_addr as i32, 0, 0, 0])
    }

    pub fn read(&mut self, buf_addr: u32, size: i32, fd: i32) -> i32 {
        self.syscall(SYSCALL_READ, [buf_addr as i32, size, fd, 0])
    }

    pub fn write(&mut self, buf_addr: u32, size: i32, fd: i32) -> i32 {
        self.syscall(SYSCALL_WRITE, [buf_addr as i32, size, fd, 0])
    }

    pub fn close(&mut self, fd: i32) -> i32 {
        self.syscall(SYSCALL_CLOSE, [fd, 0, 0, 0])
    }

    pub fn seek(&mut self, fd: i32, position: i32) {
        self.syscall(SYSCALL_SEEK, [fd, position, 0, 0]);
    }

    pub fn put_string(&mut self, addr: u32, size: i32) {
        self.syscall(SYSCALL_PUTSTRING, [addr as i32, size, 0, 0]);
    }

    pub fn put_int(&mut self, value: i32) {
        self.syscall(SYSCALL_PUTINT, [value, 0, 0, 0]);
    }

    pub fn sem_init(&mut self, sem_addr: u32, initial: i32) {
        self.syscall(SYSCALL_SEMINIT, [sem_addr as i32, initial, 0, 0]);
    }

    pub fn sem_wait(&mut self, sem_addr: u32) {
        self.syscall(SYSCALL_SEMWAIT, [sem_addr as i32, 0, 0, 0]);
    }

    pub fn sem_post(&mut self, sem_addr: u32) {
        self.syscall(SYSCALL_SEMPOST, [sem_addr as i32, 0, 0, 0]);
    }

    pub fn sem_destroy(&mut self, sem_addr: u32) {
        self.syscall(SYSCALL_SEMDESTROY, [sem_addr as i32, 0, 0, 0]);
    }

    pub fn thread_create(&mut self, f: u32, arg: i32) -> i32 {
        self.syscall(
            SYSCALL_THREADCREATE,
            [f as i32, arg, ROUTINE_C as i32, 0],
        )
    }

    pub fn thread_exit(&mut self) {
        self.syscall(SYSCALL_THREADEXIT, [0, 0, 0, 0]);
    }

    pub fn thread_join(&mut self, user_thread_id: i32) {
        self.syscall(SYSCALL_THREADJOIN, [user_thread_id, 0, 0, 0]);
    }

    pub fn fork_exec(&mut self, path_addr: u32) -> i32 {
        self.syscall(SYSCALL_FORKEXEC, [path_addr as i32, 0, 0, 0])
    }

    pub fn process_join(&mut self, pid: i32) {
        self.syscall(SYSCALL_PROCESSJOIN, [pid, 0, 0, 0]);
    }

    pub fn sbrk(&mut self, n_pages: i32) -> i32 {
        self.syscall(SYSCALL_SBRK, [n_pages, 0, 0, 0])
    }

    pub fn send_process(&mut self, net_addr: i32, should_stop: bool) -> i32 {
        self.syscall(SYSCALL_SENDPROCESS, [net_addr, i32::from(should_stop), 0, 0])
    }

    /// Scratch bytes just under the stack pointer, for routines that
    /// need a private buffer.
    pub fn stack_scratch(&self, bytes: u32) -> u32 {
        self.current.ctx.regs[STACK_REG] as u32 - bytes
    }
}

/// Build an executable image: three code regions filled with the given
/// routine keys, no initialized data, and a zeroed data segment big
/// enough to cover the demo scratch area.
pub fn build_demo_object(main_key: u32, routine_b_key: u32, routine_c_key: u32) -> Vec<u8> {
    let code_size = 3 * REGION_BYTES;
    let header = ObjHeader {
        code: Segment {
            virtual_addr: 0,
            size: code_size as u32,
            in_file_addr: OBJ_HEADER_SIZE as u32,
        },
        init_data: Segment::default(),
        uninit_data: Segment {
            virtual_addr: code_size as u32,
            size: DEMO_SCRATCH + 0x100 - code_size as u32,
            in_file_addr: 0,
        },
    };
    let mut image = header.to_bytes().to_vec();
    for key in [main_key, routine_b_key, routine_c_key] {
        for _ in 0..REGION_BYTES / 4 {
            image.extend_from_slice(&key.to_le_bytes());
        }
    }
    image
}

/// Install the built-in routines in the machine's program registry.
pub fn install_demos(kernel: &Arc<Kernel>) {
    // Thread-entry wrapper: runs the routine whose code address rides
    // in r5 (the argument stays in r4), then exits the thread.
    kernel.machine.install_program(
        K_WRAPPER,
        Arc::new(|kernel: &Arc<Kernel>, current: &mut CurrentThread| {
            let f = current.ctx.regs[ARG_REG + 1] as u32;
            let key = current.ctx.read_mem(&kernel.machine, f, 4) as u32;
            if let Some(routine) = kernel.machine.program_at(key) {
                routine.run(kernel, current);
            }
            if !current.finished {
                UserProc::new(kernel, current).thread_exit();
            }
        }),
    );

    kernel.machine.install_program(
        K_HELLO,
        Arc::new(|kernel: &Arc<Kernel>, current: &mut CurrentThread| {
            let mut proc = UserProc::new(kernel, current);
            let text = "Hello, World!\n";
            let addr = proc.stack_scratch(64);
            proc.store_cstr(addr, text);
            proc.put_string(addr, text.len() as i32);
            proc.exit(0);
        }),
    );

    // Two user threads each do 500 lock-increment-unlock rounds on a
    // shared counter; the main thread joins them and prints the total.
    kernel.machine.install_program(
        K_COUNTER_MAIN,
        Arc::new(|kernel: &Arc<Kernel>, current: &mut CurrentThread| {
            let mut proc = UserProc::new(kernel, current);
            let sem_addr = DEMO_SCRATCH;
            let counter_addr = DEMO_SCRATCH + 4;
            proc.sem_init(sem_addr, 1);
            proc.store_word(counter_addr, 0);
            let t1 = proc.thread_create(ROUTINE_B, DEMO_SCRATCH as i32);
            let t2 = proc.thread_create(ROUTINE_B, DEMO_SCRATCH as i32);
            proc.thread_join(t1);
            proc.thread_join(t2);
            let total = proc.load_word(counter_addr);
            proc.put_int(total);
            let newline = proc.stack_scratch(8);
            proc.store_cstr(newline, "\n");
            proc.put_string(newline, 1);
            proc.exit(0);
        }),
    );

    kernel.machine.install_program(
        K_INCR,
        Arc::new(|kernel: &Arc<Kernel>, current: &mut CurrentThread| {
            let mut proc = UserProc::new(kernel, current);
            let scratch = current_arg(proc.current) as u32;
            let sem_addr = scratch;
            let counter_addr = scratch + 4;
            for _ in 0..500 {
                proc.sem_wait(sem_addr);
                let n = proc.load_word(counter_addr);
                proc.store_word(counter_addr, n + 1);
                proc.sem_post(sem_addr);
            }
        }),
    );
}

fn current_arg(current: &CurrentThread) -> i32 {
    current.ctx.regs[ARG_REG]
}

/// Launch a built-in routine as a process without going through the
/// file system: an anonymous address space whose first page of
/// instruction words all carry `key`. Returns the new pid.
pub fn spawn_program(
    kernel: &Arc<Kernel>,
    n_pages: usize,
    key: u32,
) -> crate::error::Result<usize> {
    use crate::error::KernelError;
    use crate::mm::AddrSpace;

    kernel.processes.lock().reserve()?;
    let pid = match kernel.processes.lock().alloc_pid() {
        Some(pid) => pid,
        None => {
            kernel.processes.lock().unreserve();
            return Err(KernelError::OutOfSlots);
        }
    };
    let space = match AddrSpace::new(pid, n_pages, &kernel.machine, &kernel.frames) {
        Ok(space) => Arc::new(space),
        Err(e) => {
            let mut ps = kernel.processes.lock();
            ps.release_pid(pid);
            ps.unreserve();
            return Err(e);
        }
    };
    kernel.processes.lock().publish(space.clone());

    let fill = crate::machine::UserContext::new(space.clone());
    for word in 0..crate::config::memory_layout::PAGE_SIZE / 4 {
        fill.write_mem(&kernel.machine, (word * 4) as u32, 4, key as i32);
    }

    let mut current = crate::task::process::register_main_thread(kernel, space)?;
    let kernel2 = kernel.clone();
    std::thread::spawn(move || crate::task::run_user(&kernel2, &mut current));
    Ok(pid)
}

/// Write the demo executables into the file system: "hello" and
/// "counter", runnable from the shell.
pub fn write_demo_executables(kernel: &Arc<Kernel>) -> crate::error::Result<()> {
    for (name, image) in [
        ("hello", build_demo_object(K_HELLO, 0, K_WRAPPER)),
        ("counter", build_demo_object(K_COUNTER_MAIN, K_INCR, K_WRAPPER)),
    ] {
        if kernel.file_system.file_exists(name) {
            continue;
        }
        kernel.file_system.create(name, 0)?;
        let fd = kernel.file_system.open_user(name)?;
        kernel.file_system.write_user(fd, &image)?;
        kernel.file_system.close_user(fd)?;
    }
    Ok(())
}
