//! Console system calls

use crate::config::machine_layout::{MAX_STRING_SIZE, RET_REG};
use crate::kernel::Kernel;
use crate::task::CurrentThread;
use crate::trap::marshal;
use std::sync::Arc;

pub fn sys_put_char(kernel: &Arc<Kernel>, args: [i32; 4]) {
    kernel.console.put_char(args[0] as u8);
}

pub fn sys_put_string(kernel: &Arc<Kernel>, current: &mut CurrentThread, args: [i32; 4]) {
    let [addr, size, _, _] = args;
    let max = (size.max(0) as usize).min(MAX_STRING_SIZE - 1);
    let s = marshal::string_from_machine(&kernel.machine, &current.ctx, addr as u32, max);
    kernel.console.put_string(&s);
}

pub fn sys_get_char(kernel: &Arc<Kernel>, current: &mut CurrentThread) {
    current.ctx.regs[RET_REG] = match kernel.console.get_char() {
        Some(byte) => byte as i32,
        None => -1,
    };
}

pub fn sys_get_string(kernel: &Arc<Kernel>, current: &mut CurrentThread, args: [i32; 4]) {
    let [addr, size, _, _] = args;
    let line = kernel.console.get_string(size.max(0) as usize);
    marshal::string_to_machine(&kernel.machine, &current.ctx, addr as u32, &line);
}

pub fn sys_put_int(kernel: &Arc<Kernel>, args: [i32; 4]) {
    kernel.console.put_int(args[0]);
}

pub fn sys_get_int(kernel: &Arc<Kernel>, current: &mut CurrentThread, args: [i32; 4]) {
    let value = kernel.console.get_int();
    current
        .ctx
        .write_mem(&kernel.machine, args[0] as u32, 4, value);
}
