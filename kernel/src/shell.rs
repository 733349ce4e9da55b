//! Kernel console shell
//!
//! A small command loop over the same kernel entry points the syscalls
//! use. `get` and `send` talk to the FTP server on the peer machine
//! given at boot; `run` forks an executable from the file system.

use crate::error::Result;
use crate::kernel::Kernel;
use crate::net::ftp;
use crate::task::process;
use std::sync::Arc;

pub fn run_shell(kernel: &Arc<Kernel>, peer: i32) {
    let console = &kernel.console;
    loop {
        console.put_string("minos> ");
        let Some(line) = console.get_line() else {
            break;
        };
        let mut words = line.split_whitespace();
        let Some(command) = words.next() else {
            continue;
        };
        let args: Vec<&str> = words.collect();

        let outcome = match (command, args.as_slice()) {
            ("ls", []) => {
                for name in kernel.file_system.list() {
                    console.put_string(&name);
                    console.put_char(b'\n');
                }
                Ok(())
            }
            ("p", []) => {
                console.put_string(&kernel.file_system.print_directory());
                Ok(())
            }
            ("touch", [name]) => kernel.file_system.create(name, 0),
            ("rm", [name]) => kernel.file_system.remove(name),
            ("mkdir", [name]) => kernel.file_system.create_dir(name),
            ("rmdir", [name]) => kernel.file_system.remove_dir(name),
            ("cd", [path]) => kernel.file_system.change_dir(path),
            ("cat", [name]) => cat(kernel, name),
            ("cp", [src, dst]) => cp(kernel, src, dst),
            ("echo", rest @ [_, _, ..]) => {
                let (name, words) = rest.split_last().unwrap();
                echo(kernel, &words.join(" "), name)
            }
            ("run", [exe]) => process::fork_exec(kernel, exe).map(|pid| {
                console.put_string(&format!("started process {pid}\n"));
            }),
            ("get", [name]) => {
                transfer_report(kernel, ftp::client_action(kernel, peer, ftp::FtpType::ReadFile, name))
            }
            ("send", [name]) => {
                transfer_report(kernel, ftp::client_action(kernel, peer, ftp::FtpType::WriteFile, name))
            }
            ("test", []) => run_tests(kernel),
            ("quit", []) => break,
            _ => {
                console.put_string("commands: ls cp rm mkdir rmdir cd touch cat echo run get send p test quit\n");
                Ok(())
            }
        };

        if let Err(e) = outcome {
            console.put_string(&format!("{command}: {e}\n"));
        }
        if kernel.is_halted() {
            break;
        }
    }
}

fn cat(kernel: &Arc<Kernel>, name: &str) -> Result<()> {
    let file = kernel.file_system.open(name)?;
    let mut contents = vec![0u8; file.length()];
    file.read_at(&mut contents, 0);
    kernel
        .console
        .put_string(&String::from_utf8_lossy(&contents));
    Ok(())
}

fn cp(kernel: &Arc<Kernel>, src: &str, dst: &str) -> Result<()> {
    let file = kernel.file_system.open(src)?;
    let mut contents = vec![0u8; file.length()];
    file.read_at(&mut contents, 0);
    kernel.file_system.create(dst, 0)?;
    let fd = kernel.file_system.open_user(dst)?;
    let written = kernel.file_system.write_user(fd, &contents);
    kernel.file_system.close_user(fd)?;
    written.map(|_| ())
}

fn echo(kernel: &Arc<Kernel>, text: &str, name: &str) -> Result<()> {
    if !kernel.file_system.file_exists(name) {
        kernel.file_system.create(name, 0)?;
    }
    let fd = kernel.file_system.open_user(name)?;
    let written = kernel.file_system.write_user(fd, text.as_bytes());
    kernel.file_system.close_user(fd)?;
    written.map(|_| ())
}

fn transfer_report(kernel: &Arc<Kernel>, ok: bool) -> Result<()> {
    kernel
        .console
        .put_string(if ok { "transfer complete\n" } else { "transfer failed\n" });
    Ok(())
}

/// Run the built-in demo programs and wait for them to finish.
fn run_tests(kernel: &Arc<Kernel>) -> Result<()> {
    crate::progs::write_demo_executables(kernel)?;
    for exe in ["hello", "counter"] {
        let pid = process::fork_exec(kernel, exe)?;
        process::process_join(kernel, pid);
    }
    Ok(())
}
