//! User/kernel trap boundary
//!
//! Syscall arguments arrive in registers 4..7 with the code in
//! register 2, which also carries the result back; the PC chain is
//! advanced past the trapping instruction on the way out. On entry the
//! register file is published to the thread table so a thread
//! suspended inside a blocking syscall can be observed (and migrated)
//! with its registers as of the trap.

pub mod marshal;

use crate::kernel::Kernel;
use crate::task::CurrentThread;
use std::sync::Arc;

/// Handle one syscall trap from `current`.
pub fn handle_syscall(kernel: &Arc<Kernel>, current: &mut CurrentThread) {
    kernel
        .threads
        .lock()
        .save_regs(current.tid, &current.ctx.regs);

    let pc_already_advanced = crate::syscall::dispatch(kernel, current);

    if !pc_already_advanced {
        current.ctx.advance_pc();
    }
}
