//! File transfer between two machines

use minos::config::disk_layout::SECTOR_SIZE;
use minos::kernel::{Kernel, KernelOptions};
use minos::machine::network::Wire;
use minos::net::ftp;
use std::sync::Arc;

fn machines(server_addr: i32, client_addr: i32) -> (Arc<Kernel>, Arc<Kernel>) {
    lossy_machines(server_addr, client_addr, 1.0)
}

fn lossy_machines(
    server_addr: i32,
    client_addr: i32,
    reliability: f64,
) -> (Arc<Kernel>, Arc<Kernel>) {
    let _ = env_logger::builder().is_test(true).try_init();
    let wire = Arc::new(Wire::new());
    let server = Kernel::new(KernelOptions {
        net_addr: server_addr,
        reliability,
        wire: Some(wire.clone()),
        ..Default::default()
    });
    let client = Kernel::new(KernelOptions {
        net_addr: client_addr,
        reliability,
        wire: Some(wire),
        ..Default::default()
    });
    {
        let server = server.clone();
        std::thread::spawn(move || ftp::start_server(&server));
    }
    (server, client)
}

fn write_file(kernel: &Arc<Kernel>, name: &str, contents: &[u8]) {
    kernel.file_system.create(name, 0).unwrap();
    let fd = kernel.file_system.open_user(name).unwrap();
    assert_eq!(kernel.file_system.write_user(fd, contents).unwrap(), contents.len());
    kernel.file_system.close_user(fd).unwrap();
}

fn read_file(kernel: &Arc<Kernel>, name: &str) -> Vec<u8> {
    let file = kernel.file_system.open(name).unwrap();
    let mut contents = vec![0u8; file.length()];
    assert_eq!(file.read_at(&mut contents, 0), contents.len());
    contents
}

#[test]
fn write_then_read_back_is_byte_identical() {
    let (server, client) = machines(30, 31);

    // A few sectors of binary data, NUL bytes included.
    let contents: Vec<u8> = (0..3 * SECTOR_SIZE as u32 + 17).map(|i| (i * 7) as u8).collect();
    write_file(&client, "payload", &contents);

    assert!(
        ftp::client_action(&client, 30, ftp::FtpType::WriteFile, "payload"),
        "upload must succeed"
    );
    assert_eq!(read_file(&server, "payload"), contents);
    assert_eq!(
        server.file_system.file_size("payload").unwrap(),
        contents.len()
    );

    // Pull a different file back from the server.
    let reply: Vec<u8> = contents.iter().rev().copied().collect();
    write_file(&server, "reply", &reply);
    assert!(
        ftp::client_action(&client, 30, ftp::FtpType::ReadFile, "reply"),
        "download must succeed"
    );
    assert_eq!(read_file(&client, "reply"), reply);

    server.shutdown();
    client.shutdown();
}

#[test]
fn missing_remote_file_reports_error_and_leaves_no_partial() {
    let (server, client) = machines(32, 33);

    assert!(!ftp::client_action(
        &client,
        32,
        ftp::FtpType::ReadFile,
        "nothere"
    ));
    assert!(!client.file_system.file_exists("nothere"));

    // Uploading a file the client doesn't have fails locally.
    assert!(!ftp::client_action(
        &client,
        32,
        ftp::FtpType::WriteFile,
        "nothere"
    ));
    assert!(!server.file_system.file_exists("nothere"));

    server.shutdown();
    client.shutdown();
}

#[test]
fn transfer_survives_a_lossy_wire() {
    // Retransmitted CONNs and data segments both cross here; the
    // duplicate-connection filter must drop the former silently.
    let (server, client) = lossy_machines(36, 37, 0.85);

    let contents: Vec<u8> = (0..200u32).map(|i| (i * 13) as u8).collect();
    write_file(&client, "lossy", &contents);
    assert!(ftp::client_action(&client, 36, ftp::FtpType::WriteFile, "lossy"));
    assert_eq!(read_file(&server, "lossy"), contents);

    server.shutdown();
    client.shutdown();
}

#[test]
fn sequential_clients_are_served() {
    let (server, client) = machines(34, 35);

    write_file(&client, "first", b"alpha");
    assert!(ftp::client_action(&client, 34, ftp::FtpType::WriteFile, "first"));
    write_file(&client, "second", b"beta");
    assert!(ftp::client_action(&client, 34, ftp::FtpType::WriteFile, "second"));
    assert_eq!(read_file(&server, "first"), b"alpha");
    assert_eq!(read_file(&server, "second"), b"beta");

    server.shutdown();
    client.shutdown();
}
