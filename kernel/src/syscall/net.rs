//! Networking system calls: migration and file transfer

use crate::config::machine_layout::{MAX_STRING_SIZE, RET_REG};
use crate::kernel::Kernel;
use crate::net::{ftp, migrate};
use crate::task::CurrentThread;
use crate::trap::marshal;
use std::sync::Arc;

/// Migrate the calling process to another machine. The PC is advanced
/// *before* the registers are streamed so the far side resumes past
/// the trap; hence the `true` return telling the trap layer not to
/// advance again. With a nonzero second argument a successful send
/// falls through to Exit on the near side.
pub fn sys_send_process(kernel: &Arc<Kernel>, current: &mut CurrentThread, args: [i32; 4]) -> bool {
    let [net_addr, should_stop, _, _] = args;
    current.ctx.advance_pc();
    // The near side will read 0 from the result register; the far side
    // is handed 1 there instead.
    current.ctx.regs[RET_REG] = 0;
    let sent = migrate::send_process(kernel, current, net_addr);
    if !sent {
        current.ctx.regs[RET_REG] = -1;
        return true;
    }
    if should_stop != 0 {
        super::process::do_exit(kernel, current, 0);
    }
    true
}

pub fn sys_listen_process(kernel: &Arc<Kernel>, current: &mut CurrentThread) {
    current.ctx.regs[RET_REG] = migrate::listen_process(kernel);
}

pub fn sys_send_file(kernel: &Arc<Kernel>, current: &mut CurrentThread, args: [i32; 4]) {
    let [net_addr, name_addr, _, _] = args;
    let name =
        marshal::string_from_machine(&kernel.machine, &current.ctx, name_addr as u32, MAX_STRING_SIZE);
    current.ctx.regs[RET_REG] =
        i32::from(ftp::client_action(kernel, net_addr, ftp::FtpType::WriteFile, &name));
}

pub fn sys_receive_file(kernel: &Arc<Kernel>, current: &mut CurrentThread, args: [i32; 4]) {
    let [net_addr, name_addr, _, _] = args;
    let name =
        marshal::string_from_machine(&kernel.machine, &current.ctx, name_addr as u32, MAX_STRING_SIZE);
    current.ctx.regs[RET_REG] =
        i32::from(ftp::client_action(kernel, net_addr, ftp::FtpType::ReadFile, &name));
}

pub fn sys_start_ftp_server(kernel: &Arc<Kernel>) {
    ftp::start_server(kernel);
}
