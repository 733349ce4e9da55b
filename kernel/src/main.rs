//! Boot binary: construct the kernel and run the console shell.

use clap::Parser;
use minos::kernel::{Kernel, KernelOptions};
use minos::machine::disk::SynchDisk;
use minos::{progs, shell};
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "minos", about = "Minos teaching OS on a simulated machine")]
struct Args {
    /// Network address of this machine
    #[arg(short = 'm', long, default_value_t = 0)]
    machine_id: i32,

    /// Machine to address with the shell's get/send commands
    #[arg(short = 'o', long, default_value_t = 1)]
    peer: i32,

    /// Probability that the network delivers any one packet
    #[arg(short = 'r', long, default_value_t = 1.0)]
    reliability: f64,

    /// Format the disk even if the image already holds a file system
    #[arg(short = 'f', long)]
    format: bool,

    /// Disk image file; omitted, the disk lives in memory only
    #[arg(short = 'd', long)]
    disk_image: Option<PathBuf>,
}

fn main() {
    env_logger::init();
    let args = Args::parse();

    let (disk, format) = match &args.disk_image {
        Some(path) => {
            let (disk, existed) = SynchDisk::with_image(path).unwrap_or_else(|e| {
                eprintln!("cannot open disk image {}: {e}", path.display());
                std::process::exit(1);
            });
            (Some(disk), args.format || !existed)
        }
        None => (None, true),
    };

    let kernel = Kernel::new(KernelOptions {
        net_addr: args.machine_id,
        reliability: args.reliability,
        format,
        disk,
        ..Default::default()
    });
    progs::install_demos(&kernel);

    // The console session holds a process slot, so a transient child
    // exiting cannot drop the live count to zero and halt the machine
    // under the shell.
    kernel
        .processes
        .lock()
        .reserve()
        .expect("fresh process table");

    println!("Minos kernel, machine {}", args.machine_id);
    shell::run_shell(&kernel, args.peer);

    kernel.shutdown();
    if let Err(e) = kernel.disk().flush_image() {
        eprintln!("disk image flush failed: {e}");
    }
}
