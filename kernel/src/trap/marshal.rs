//! Argument marshalling between user memory and the kernel

use crate::config::machine_layout::MAX_STRING_SIZE;
use crate::machine::{Machine, UserContext};

/// Copy a NUL-terminated string out of user memory, reading at most
/// `max` bytes.
pub fn string_from_machine(machine: &Machine, ctx: &UserContext, addr: u32, max: usize) -> String {
    let mut bytes = Vec::new();
    for i in 0..max.min(MAX_STRING_SIZE) as u32 {
        let byte = ctx.read_mem(machine, addr + i, 1) as u8;
        if byte == 0 {
            break;
        }
        bytes.push(byte);
    }
    String::from_utf8_lossy(&bytes).into_owned()
}

/// Copy a string into user memory, NUL terminator included.
pub fn string_to_machine(machine: &Machine, ctx: &UserContext, addr: u32, s: &str) {
    for (i, byte) in s.bytes().enumerate() {
        ctx.write_mem(machine, addr + i as u32, 1, byte as i32);
    }
    ctx.write_mem(machine, addr + s.len() as u32, 1, 0);
}

/// Copy `len` raw bytes out of user memory. Unlike the string variant
/// this carries NUL bytes through, so binary file I/O is exact.
pub fn bytes_from_machine(machine: &Machine, ctx: &UserContext, addr: u32, len: usize) -> Vec<u8> {
    (0..len as u32)
        .map(|i| ctx.read_mem(machine, addr + i, 1) as u8)
        .collect()
}

/// Copy raw bytes into user memory.
pub fn bytes_to_machine(machine: &Machine, ctx: &UserContext, addr: u32, bytes: &[u8]) {
    for (i, byte) in bytes.iter().enumerate() {
        ctx.write_mem(machine, addr + i as u32, 1, *byte as i32);
    }
}
