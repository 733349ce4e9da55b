//! System call dispatch

mod console;
mod fs;
mod net;
pub mod process;

use crate::config::machine_layout::{ARG_REG, RET_REG};
use crate::kernel::Kernel;
use crate::task::CurrentThread;
use std::sync::Arc;

pub const SYSCALL_HALT: i32 = 0;
pub const SYSCALL_EXIT: i32 = 1;
pub const SYSCALL_CREATE: i32 = 4;
pub const SYSCALL_OPEN: i32 = 5;
pub const SYSCALL_READ: i32 = 6;
pub const SYSCALL_WRITE: i32 = 7;
pub const SYSCALL_CLOSE: i32 = 8;
pub const SYSCALL_PUTCHAR: i32 = 11;
pub const SYSCALL_PUTSTRING: i32 = 12;
pub const SYSCALL_GETCHAR: i32 = 13;
pub const SYSCALL_GETSTRING: i32 = 14;
pub const SYSCALL_PUTINT: i32 = 15;
pub const SYSCALL_GETINT: i32 = 16;
pub const SYSCALL_THREADCREATE: i32 = 17;
pub const SYSCALL_THREADEXIT: i32 = 18;
pub const SYSCALL_THREADJOIN: i32 = 19;
pub const SYSCALL_SEMINIT: i32 = 20;
pub const SYSCALL_SEMPOST: i32 = 21;
pub const SYSCALL_SEMWAIT: i32 = 22;
pub const SYSCALL_SEMDESTROY: i32 = 23;
pub const SYSCALL_FORKEXEC: i32 = 24;
pub const SYSCALL_SBRK: i32 = 25;
pub const SYSCALL_MKDIR: i32 = 26;
pub const SYSCALL_RMDIR: i32 = 27;
pub const SYSCALL_LISTFILES: i32 = 28;
pub const SYSCALL_CHANGEDIR: i32 = 29;
pub const SYSCALL_REMOVE: i32 = 30;
pub const SYSCALL_SEEK: i32 = 31;
pub const SYSCALL_SENDPROCESS: i32 = 32;
pub const SYSCALL_LISTENPROCESS: i32 = 33;
pub const SYSCALL_PROCESSJOIN: i32 = 34;
pub const SYSCALL_SENDFILE: i32 = 35;
pub const SYSCALL_RECEIVEFILE: i32 = 36;
pub const SYSCALL_STARTFTPSERVER: i32 = 37;

/// Dispatch the syscall named by register 2. Returns whether the
/// handler already advanced the PC chain (process migration must
/// stream a context that resumes past the trap).
pub fn dispatch(kernel: &Arc<Kernel>, current: &mut CurrentThread) -> bool {
    let code = current.ctx.regs[RET_REG];
    let arg = |i: usize| current.ctx.regs[ARG_REG + i];
    let args = [arg(0), arg(1), arg(2), arg(3)];

    match code {
        SYSCALL_HALT => {
            log::debug!(target: "task", "shutdown initiated by thread {}", current.tid);
            kernel.halt();
            current.finished = true;
        }
        SYSCALL_EXIT | SYSCALL_THREADEXIT => process::do_exit(kernel, current, args[0]),
        SYSCALL_CREATE => fs::sys_create(kernel, current, args),
        SYSCALL_OPEN => fs::sys_open(kernel, current, args),
        SYSCALL_READ => fs::sys_read(kernel, current, args),
        SYSCALL_WRITE => fs::sys_write(kernel, current, args),
        SYSCALL_CLOSE => fs::sys_close(kernel, current, args),
        SYSCALL_SEEK => fs::sys_seek(kernel, current, args),
        SYSCALL_REMOVE => fs::sys_remove(kernel, current, args),
        SYSCALL_MKDIR => fs::sys_mkdir(kernel, current, args),
        SYSCALL_RMDIR => fs::sys_rmdir(kernel, current, args),
        SYSCALL_LISTFILES => fs::sys_list_files(kernel),
        SYSCALL_CHANGEDIR => fs::sys_change_dir(kernel, current, args),
        SYSCALL_PUTCHAR => console::sys_put_char(kernel, args),
        SYSCALL_PUTSTRING => console::sys_put_string(kernel, current, args),
        SYSCALL_GETCHAR => console::sys_get_char(kernel, current),
        SYSCALL_GETSTRING => console::sys_get_string(kernel, current, args),
        SYSCALL_PUTINT => console::sys_put_int(kernel, args),
        SYSCALL_GETINT => console::sys_get_int(kernel, current, args),
        SYSCALL_THREADCREATE => process::sys_thread_create(kernel, current, args),
        SYSCALL_THREADJOIN => process::sys_thread_join(kernel, current, args),
        SYSCALL_SEMINIT => process::sys_sem_init(kernel, current, args),
        SYSCALL_SEMPOST => process::sys_sem_post(kernel, current, args),
        SYSCALL_SEMWAIT => process::sys_sem_wait(kernel, current, args),
        SYSCALL_SEMDESTROY => process::sys_sem_destroy(kernel, current, args),
        SYSCALL_FORKEXEC => process::sys_fork_exec(kernel, current, args),
        SYSCALL_SBRK => process::sys_sbrk(kernel, current, args),
        SYSCALL_PROCESSJOIN => process::sys_process_join(kernel, args),
        SYSCALL_SENDPROCESS => return net::sys_send_process(kernel, current, args),
        SYSCALL_LISTENPROCESS => net::sys_listen_process(kernel, current),
        SYSCALL_SENDFILE => net::sys_send_file(kernel, current, args),
        SYSCALL_RECEIVEFILE => net::sys_receive_file(kernel, current, args),
        SYSCALL_STARTFTPSERVER => net::sys_start_ftp_server(kernel),
        unknown => {
            log::error!(target: "task", "unknown syscall {unknown}");
        }
    }
    false
}

/// Map a kernel result onto the user-visible 1 / 0 convention.
pub(crate) fn as_bool_result<T>(result: crate::error::Result<T>) -> i32 {
    i32::from(result.is_ok())
}
