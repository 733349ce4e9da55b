//! File-system system calls
//!
//! Names arrive as NUL-terminated strings in user memory; file
//! contents move as raw bytes, so binary data survives the boundary.

use crate::config::machine_layout::{MAX_STRING_SIZE, RET_REG};
use crate::kernel::Kernel;
use crate::task::CurrentThread;
use crate::trap::marshal;
use std::sync::Arc;

use super::as_bool_result;

fn name_arg(kernel: &Kernel, current: &CurrentThread, addr: i32) -> String {
    marshal::string_from_machine(&kernel.machine, &current.ctx, addr as u32, MAX_STRING_SIZE)
}

pub fn sys_create(kernel: &Arc<Kernel>, current: &mut CurrentThread, args: [i32; 4]) {
    let name = name_arg(kernel, current, args[0]);
    current.ctx.regs[RET_REG] = as_bool_result(kernel.file_system.create(&name, 0));
}

pub fn sys_open(kernel: &Arc<Kernel>, current: &mut CurrentThread, args: [i32; 4]) {
    let name = name_arg(kernel, current, args[0]);
    current.ctx.regs[RET_REG] = match kernel.file_system.open_user(&name) {
        Ok(fd) => fd as i32,
        Err(_) => -1,
    };
}

pub fn sys_close(kernel: &Arc<Kernel>, current: &mut CurrentThread, args: [i32; 4]) {
    current.ctx.regs[RET_REG] = match kernel.file_system.close_user(args[0] as usize) {
        Ok(()) => 0,
        Err(_) => -1,
    };
}

pub fn sys_read(kernel: &Arc<Kernel>, current: &mut CurrentThread, args: [i32; 4]) {
    let [addr, size, fd, _] = args;
    let mut buffer = vec![0u8; size.max(0) as usize];
    current.ctx.regs[RET_REG] = match kernel.file_system.read_user(fd as usize, &mut buffer) {
        Ok(n) => {
            marshal::bytes_to_machine(&kernel.machine, &current.ctx, addr as u32, &buffer[..n]);
            n as i32
        }
        Err(_) => -1,
    };
}

pub fn sys_write(kernel: &Arc<Kernel>, current: &mut CurrentThread, args: [i32; 4]) {
    let [addr, size, fd, _] = args;
    let buffer =
        marshal::bytes_from_machine(&kernel.machine, &current.ctx, addr as u32, size.max(0) as usize);
    current.ctx.regs[RET_REG] = match kernel.file_system.write_user(fd as usize, &buffer) {
        Ok(n) => n as i32,
        Err(_) => -1,
    };
}

pub fn sys_seek(kernel: &Arc<Kernel>, _current: &mut CurrentThread, args: [i32; 4]) {
    let [fd, position, _, _] = args;
    // The seek syscall reports nothing back, even for a bad descriptor.
    let _ = kernel
        .file_system
        .seek_user(fd as usize, position.max(0) as usize);
}

pub fn sys_remove(kernel: &Arc<Kernel>, current: &mut CurrentThread, args: [i32; 4]) {
    let name = name_arg(kernel, current, args[0]);
    current.ctx.regs[RET_REG] = as_bool_result(kernel.file_system.remove(&name));
}

pub fn sys_mkdir(kernel: &Arc<Kernel>, current: &mut CurrentThread, args: [i32; 4]) {
    let name = name_arg(kernel, current, args[0]);
    current.ctx.regs[RET_REG] = as_bool_result(kernel.file_system.create_dir(&name));
}

pub fn sys_rmdir(kernel: &Arc<Kernel>, current: &mut CurrentThread, args: [i32; 4]) {
    let name = name_arg(kernel, current, args[0]);
    current.ctx.regs[RET_REG] = as_bool_result(kernel.file_system.remove_dir(&name));
}

pub fn sys_list_files(kernel: &Arc<Kernel>) {
    for name in kernel.file_system.list() {
        kernel.console.put_string(&name);
        kernel.console.put_char(b'\n');
    }
}

pub fn sys_change_dir(kernel: &Arc<Kernel>, current: &mut CurrentThread, args: [i32; 4]) {
    let path = name_arg(kernel, current, args[0]);
    current.ctx.regs[RET_REG] = as_bool_result(kernel.file_system.change_dir(&path));
}
