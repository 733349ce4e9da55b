//! The kernel context
//!
//! One value owning every subsystem of one simulated machine, built at
//! boot and passed explicitly to every entry point. Several kernels
//! can coexist in one host process, joined only by the network wire.

use crate::config::net_layout::NUM_BOXES;
use crate::console::Console;
use crate::fs::FileSystem;
use crate::machine::disk::SynchDisk;
use crate::machine::network::Wire;
use crate::machine::Machine;
use crate::mm::FrameProvider;
use crate::net::PostOffice;
use crate::task::{ProcessTable, ThreadTable};
use std::sync::{Arc, Condvar, Mutex};

/// Boot-time knobs. The defaults describe a single freshly formatted
/// machine on the global wire with a perfectly reliable network.
pub struct KernelOptions {
    pub net_addr: i32,
    pub reliability: f64,
    pub format: bool,
    pub wire: Option<Arc<Wire>>,
    pub console: Option<Console>,
    pub disk: Option<SynchDisk>,
}

impl Default for KernelOptions {
    fn default() -> Self {
        Self {
            net_addr: 0,
            reliability: 1.0,
            format: true,
            wire: None,
            console: None,
            disk: None,
        }
    }
}

pub struct Kernel {
    pub machine: Arc<Machine>,
    pub console: Arc<Console>,
    pub frames: Arc<FrameProvider>,
    pub file_system: Arc<FileSystem>,
    pub post_office: Arc<PostOffice>,
    pub threads: ThreadTable,
    pub processes: ProcessTable,
    halted: Mutex<bool>,
    halt_cond: Condvar,
}

impl Kernel {
    pub fn new(options: KernelOptions) -> Arc<Self> {
        let disk = Arc::new(options.disk.unwrap_or_default());
        let wire = options.wire.unwrap_or_else(Wire::global);
        Arc::new(Self {
            machine: Arc::new(Machine::new()),
            console: Arc::new(options.console.unwrap_or_default()),
            frames: Arc::new(FrameProvider::new()),
            file_system: Arc::new(FileSystem::new(disk, options.format)),
            post_office: PostOffice::new(options.net_addr, options.reliability, NUM_BOXES, wire),
            threads: ThreadTable::new(),
            processes: ProcessTable::new(),
            halted: Mutex::new(false),
            halt_cond: Condvar::new(),
        })
    }

    pub fn disk(&self) -> &Arc<SynchDisk> {
        self.file_system.disk()
    }

    /// Stop the machine: wake whoever is waiting for the end.
    pub fn halt(&self) {
        *self.halted.lock().unwrap() = true;
        self.halt_cond.notify_all();
    }

    pub fn is_halted(&self) -> bool {
        *self.halted.lock().unwrap()
    }

    /// Block until something halts the machine (a Halt syscall or the
    /// last process exiting).
    pub fn wait_for_halt(&self) {
        let mut halted = self.halted.lock().unwrap();
        while !*halted {
            halted = self.halt_cond.wait(halted).unwrap();
        }
    }

    /// Orderly teardown: stop the post office threads and mark the
    /// machine halted. The disk image, if any, is flushed by the boot
    /// binary after this.
    pub fn shutdown(&self) {
        self.post_office.stop();
        self.halt();
    }
}
