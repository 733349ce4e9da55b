//! File transfer between machines
//!
//! Lock-step request/response over one connection per client: every
//! message is an [`FtpHeader`] followed by data, and each step is
//! confirmed with OK or ERROR before the next. The server forks one
//! handler thread per client and refuses a second connection from a
//! machine it is already serving.

use crate::config::net_layout::MAX_CLIENTS;
use crate::error::{KernelError, Result};
use crate::kernel::Kernel;
use crate::net::Connection;
use crate::utils::BitMap;
use std::sync::{Arc, Mutex};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FtpType {
    ReadFile,
    WriteFile,
    Connect,
    Disconnect,
    Ok,
    Error,
    FileData,
}

impl FtpType {
    fn from_i32(raw: i32) -> Option<Self> {
        Some(match raw {
            0 => FtpType::ReadFile,
            1 => FtpType::WriteFile,
            2 => FtpType::Connect,
            3 => FtpType::Disconnect,
            4 => FtpType::Ok,
            5 => FtpType::Error,
            6 => FtpType::FileData,
            _ => return None,
        })
    }

    fn as_i32(self) -> i32 {
        match self {
            FtpType::ReadFile => 0,
            FtpType::WriteFile => 1,
            FtpType::Connect => 2,
            FtpType::Disconnect => 3,
            FtpType::Ok => 4,
            FtpType::Error => 5,
            FtpType::FileData => 6,
        }
    }
}

/// Protocol header prefixed to every FTP message.
#[derive(Debug, Clone, Copy)]
pub struct FtpHeader {
    pub kind: FtpType,
    pub file_size: i32,
}

pub const FTP_HEADER_SIZE: usize = 8;

impl FtpHeader {
    fn to_bytes(self) -> [u8; FTP_HEADER_SIZE] {
        let mut buf = [0u8; FTP_HEADER_SIZE];
        buf[0..4].copy_from_slice(&self.kind.as_i32().to_le_bytes());
        buf[4..8].copy_from_slice(&self.file_size.to_le_bytes());
        buf
    }

    fn parse(buf: &[u8]) -> Option<Self> {
        if buf.len() < FTP_HEADER_SIZE {
            return None;
        }
        Some(Self {
            kind: FtpType::from_i32(i32::from_le_bytes(buf[0..4].try_into().unwrap()))?,
            file_size: i32::from_le_bytes(buf[4..8].try_into().unwrap()),
        })
    }
}

const SERVER_NOTE: &[u8] = b"Server notification\0";
const CLIENT_NOTE: &[u8] = b"Client notification\0";
const CLIENT_REQUEST: &[u8] = b"Client request\0";

fn framed(hdr: FtpHeader, body: &[u8]) -> Vec<u8> {
    let mut message = Vec::with_capacity(FTP_HEADER_SIZE + body.len());
    message.extend_from_slice(&hdr.to_bytes());
    message.extend_from_slice(body);
    message
}

/// Bytes of `data` up to the first NUL, as a name.
fn c_string(data: &[u8]) -> String {
    let end = data.iter().position(|&b| b == 0).unwrap_or(data.len());
    String::from_utf8_lossy(&data[..end]).into_owned()
}

/// File-system access with FTP's error policy: wrong sizes and wrong
/// kinds are failures, and reads must consume the file exactly.
mod file_handler {
    use super::*;

    pub fn file_size(kernel: &Kernel, name: &str) -> Result<usize> {
        if !kernel.file_system.is_data_file(name) || !kernel.file_system.file_exists(name) {
            log::warn!(target: "net", "{name} does not exist or is not a regular file");
            return Err(KernelError::NotFound);
        }
        kernel.file_system.file_size(name)
    }

    pub fn create_file(kernel: &Kernel, name: &str) -> Result<()> {
        if kernel.file_system.file_exists(name) {
            log::warn!(target: "net", "file {name} already exists");
            return Err(KernelError::Exists);
        }
        kernel.file_system.create(name, 0)
    }

    pub fn open_file(kernel: &Kernel, name: &str) -> Result<usize> {
        kernel.file_system.open_user(name)
    }

    pub fn read_file(kernel: &Kernel, fd: usize, file_size: usize) -> Result<Vec<u8>> {
        let mut buffer = vec![0u8; file_size];
        if kernel.file_system.read_user(fd, &mut buffer)? != file_size {
            log::warn!(target: "net", "failed to read the correct amount of bytes");
            return Err(KernelError::ProtocolViolation);
        }
        let mut probe = [0u8; 1];
        if kernel.file_system.read_user(fd, &mut probe)? != 0 {
            log::warn!(target: "net", "file data remains after reading ended");
            return Err(KernelError::ProtocolViolation);
        }
        Ok(buffer)
    }

    pub fn write_file(kernel: &Kernel, fd: usize, buffer: &[u8]) -> Result<()> {
        if kernel.file_system.write_user(fd, buffer)? != buffer.len() {
            log::warn!(target: "net", "failed to write the whole file");
            return Err(KernelError::OutOfSpace);
        }
        Ok(())
    }

    pub fn close_file(kernel: &Kernel, fd: usize) {
        if kernel.file_system.close_user(fd).is_err() {
            log::warn!(target: "net", "failed to close file descriptor {fd}");
        }
    }

    pub fn remove_file(kernel: &Kernel, name: &str) {
        if kernel.file_system.remove(name).is_err() {
            log::warn!(target: "net", "failed to remove file {name}");
        }
    }
}

struct Clients {
    map: BitMap,
    n_clients: usize,
}

pub struct Server {
    kernel: Arc<Kernel>,
    clients: Mutex<Clients>,
}

impl Server {
    pub fn new(kernel: Arc<Kernel>) -> Arc<Self> {
        let mut map = BitMap::new(MAX_CLIENTS);
        // Our own machine address never counts as a connectable client.
        map.mark(kernel.post_office.net_addr() as usize);
        Arc::new(Self {
            kernel,
            clients: Mutex::new(Clients { map, n_clients: 0 }),
        })
    }

    fn client_connect(&self, machine: i32) -> bool {
        let mut clients = self.clients.lock().unwrap();
        if clients.n_clients >= MAX_CLIENTS {
            return false;
        }
        clients.map.mark(machine as usize);
        clients.n_clients += 1;
        true
    }

    fn client_disconnect(&self, machine: i32) {
        let mut clients = self.clients.lock().unwrap();
        assert!(clients.map.test(machine as usize));
        clients.map.clear(machine as usize);
        clients.n_clients -= 1;
    }

    fn is_connected(&self, machine: i32) -> bool {
        self.clients.lock().unwrap().map.test(machine as usize)
    }

    /// Accept clients forever, forking a handler thread per client.
    /// Machines already being served are told to disconnect.
    pub fn serve(self: &Arc<Self>) {
        let po = &self.kernel.post_office;
        log::info!(target: "net", "[server] launching with address {}", po.net_addr());
        loop {
            let Some(mut conn) = po.listen() else {
                log::warn!(target: "net", "[server] client refused: mailbox shortage");
                continue;
            };
            let peer = conn.p_in.pkt.from;
            if self.is_connected(peer) {
                log::warn!(
                    target: "net",
                    "[server] client {peer} refused: already connected or unavailable"
                );
                notify(&self.kernel, &mut conn, FtpType::Disconnect, 0, SERVER_NOTE);
                po.disconnect(conn);
                continue;
            }
            self.client_connect(peer);
            let server = self.clone();
            std::thread::spawn(move || server.handle_client(conn, peer));
        }
    }

    /// Serve one client until it asks to disconnect.
    fn handle_client(&self, mut conn: Connection, peer: i32) {
        let kernel = &self.kernel;
        notify(kernel, &mut conn, FtpType::Ok, 0, SERVER_NOTE);
        loop {
            let buffer = kernel.post_office.receive(&mut conn);
            let Some(hdr) = FtpHeader::parse(&buffer) else {
                log::warn!(target: "net", "[server] malformed request from {peer}");
                notify(kernel, &mut conn, FtpType::Error, 0, SERVER_NOTE);
                continue;
            };
            let data = &buffer[FTP_HEADER_SIZE..];
            match hdr.kind {
                FtpType::ReadFile => {
                    let name = c_string(data);
                    log::info!(target: "net", "[server] READFILE \"{name}\" from client {peer}");
                    self.send_file(&mut conn, &name);
                }
                FtpType::WriteFile => {
                    let name = c_string(data);
                    log::info!(target: "net", "[server] WRITEFILE \"{name}\" from client {peer}");
                    self.receive_file(&mut conn, &name, hdr.file_size as usize);
                }
                FtpType::Disconnect => {
                    log::info!(target: "net", "[server] DISCONNECT from client {peer}");
                    notify(kernel, &mut conn, FtpType::Disconnect, 0, SERVER_NOTE);
                    self.client_disconnect(peer);
                    kernel.post_office.disconnect(conn);
                    return;
                }
                other => {
                    log::warn!(target: "net", "[server] invalid request {other:?} from {peer}");
                    notify(kernel, &mut conn, FtpType::Error, 0, SERVER_NOTE);
                }
            }
        }
    }

    /// Server half of READFILE: size, open and read the file, then
    /// stream it once the client confirms.
    fn send_file(&self, conn: &mut Connection, name: &str) -> bool {
        let kernel = &self.kernel;
        let Ok(file_size) = file_handler::file_size(kernel, name) else {
            notify(kernel, conn, FtpType::Error, 0, SERVER_NOTE);
            return false;
        };
        let Ok(fd) = file_handler::open_file(kernel, name) else {
            notify(kernel, conn, FtpType::Error, 0, SERVER_NOTE);
            return false;
        };
        let Ok(buffer) = file_handler::read_file(kernel, fd, file_size) else {
            notify(kernel, conn, FtpType::Error, 0, SERVER_NOTE);
            file_handler::close_file(kernel, fd);
            return false;
        };
        notify(kernel, conn, FtpType::Ok, file_size as i32, SERVER_NOTE);
        if confirmation(kernel, conn).is_none() {
            log::warn!(target: "net", "[server] client couldn't open \"{name}\"");
            file_handler::close_file(kernel, fd);
            return false;
        }
        let message = framed(
            FtpHeader {
                kind: FtpType::FileData,
                file_size: file_size as i32,
            },
            &buffer,
        );
        kernel.post_office.send(conn, &message);
        if confirmation(kernel, conn).is_none() {
            log::warn!(target: "net", "[server] client couldn't write \"{name}\"");
            file_handler::close_file(kernel, fd);
            return false;
        }
        file_handler::close_file(kernel, fd);
        notify(kernel, conn, FtpType::Ok, 0, SERVER_NOTE);
        true
    }

    /// Server half of WRITEFILE: create and fill the file, removing
    /// the partial file on any failure.
    fn receive_file(&self, conn: &mut Connection, name: &str, file_size: usize) -> bool {
        let kernel = &self.kernel;
        if file_handler::create_file(kernel, name).is_err() {
            notify(kernel, conn, FtpType::Error, 0, SERVER_NOTE);
            return false;
        }
        let Ok(fd) = file_handler::open_file(kernel, name) else {
            notify(kernel, conn, FtpType::Error, 0, SERVER_NOTE);
            return false;
        };
        notify(kernel, conn, FtpType::Ok, 0, SERVER_NOTE);
        if confirmation(kernel, conn).is_none() {
            file_handler::close_file(kernel, fd);
            file_handler::remove_file(kernel, name);
            return false;
        }
        let buffer = kernel.post_office.receive(conn);
        let parsed = FtpHeader::parse(&buffer);
        let ok = matches!(
            parsed,
            Some(FtpHeader {
                kind: FtpType::FileData,
                file_size: got,
            }) if got as usize == file_size
        );
        if !ok || file_handler::write_file(kernel, fd, &buffer[FTP_HEADER_SIZE..]).is_err() {
            notify(kernel, conn, FtpType::Error, 0, SERVER_NOTE);
            file_handler::close_file(kernel, fd);
            file_handler::remove_file(kernel, name);
            return false;
        }
        notify(kernel, conn, FtpType::Ok, 0, SERVER_NOTE);
        if confirmation(kernel, conn).is_none() {
            file_handler::close_file(kernel, fd);
            file_handler::remove_file(kernel, name);
            return false;
        }
        file_handler::close_file(kernel, fd);
        log::info!(target: "net", "[server] file \"{name}\" successfully transferred");
        true
    }
}

/// Run an FTP server on this machine's post office, forever.
pub fn start_server(kernel: &Arc<Kernel>) {
    Server::new(kernel.clone()).serve();
}

fn notify(kernel: &Kernel, conn: &mut Connection, kind: FtpType, file_size: i32, note: &[u8]) {
    let message = framed(FtpHeader { kind, file_size }, note);
    kernel.post_office.send(conn, &message);
}

/// Wait for the peer's OK (returning its file-size field) or ERROR
/// (returning `None`). Anything else is a protocol violation, treated
/// as failure.
fn confirmation(kernel: &Kernel, conn: &mut Connection) -> Option<i32> {
    let answer = kernel.post_office.receive(conn);
    match FtpHeader::parse(&answer) {
        Some(FtpHeader {
            kind: FtpType::Ok,
            file_size,
        }) => Some(file_size),
        Some(FtpHeader {
            kind: FtpType::Error,
            ..
        }) => None,
        other => {
            log::warn!(target: "net", "unexpected confirmation {other:?}");
            None
        }
    }
}

pub struct Client {
    conn: Connection,
    server_addr: i32,
}

impl Client {
    /// Connect to the FTP server at `server_addr`; the server answers
    /// OK, or DISCONNECT when it cannot take another client.
    pub fn connect(kernel: &Arc<Kernel>, server_addr: i32) -> Result<Self> {
        log::info!(
            target: "net",
            "[client {}] connecting to server {server_addr}",
            kernel.post_office.net_addr()
        );
        let mut conn = kernel
            .post_office
            .connect(server_addr)
            .ok_or(KernelError::NetworkFailure)?;
        let answer = kernel.post_office.receive(&mut conn);
        match FtpHeader::parse(&answer).map(|h| h.kind) {
            Some(FtpType::Ok) => Ok(Self { conn, server_addr }),
            Some(FtpType::Disconnect) => {
                log::warn!(
                    target: "net",
                    "[client] connected but server {server_addr} is unavailable"
                );
                kernel.post_office.disconnect(conn);
                Err(KernelError::InUse)
            }
            other => {
                log::warn!(target: "net", "[client] unexpected greeting {other:?}");
                kernel.post_office.disconnect(conn);
                Err(KernelError::ProtocolViolation)
            }
        }
    }

    /// Ask the server to serve (READFILE) or accept (WRITEFILE) a
    /// file, then run the matching transfer.
    pub fn send_file_request(&mut self, kernel: &Arc<Kernel>, kind: FtpType, name: &str) -> bool {
        assert!(matches!(kind, FtpType::ReadFile | FtpType::WriteFile));
        let file_size = if kind == FtpType::WriteFile {
            match file_handler::file_size(kernel, name) {
                Ok(size) => size as i32,
                Err(_) => return false,
            }
        } else {
            0
        };
        log::info!(
            target: "net",
            "[client {}] sending {kind:?} request for \"{name}\" to server {}",
            kernel.post_office.net_addr(),
            self.server_addr
        );
        let mut body = name.as_bytes().to_vec();
        body.push(0);
        let message = framed(FtpHeader { kind, file_size }, &body);
        kernel.post_office.send(&mut self.conn, &message);

        let Some(size_from_server) = confirmation(kernel, &mut self.conn) else {
            log::warn!(target: "net", "[client] server couldn't initialize \"{name}\"");
            return false;
        };
        if kind == FtpType::ReadFile {
            self.receive_file(kernel, name, size_from_server as usize)
        } else {
            self.send_file(kernel, name)
        }
    }

    /// Client half of WRITEFILE: read the local file and stream it.
    fn send_file(&mut self, kernel: &Arc<Kernel>, name: &str) -> bool {
        let Ok(file_size) = file_handler::file_size(kernel, name) else {
            self.notify(kernel, FtpType::Error);
            return false;
        };
        let Ok(fd) = file_handler::open_file(kernel, name) else {
            self.notify(kernel, FtpType::Error);
            return false;
        };
        let Ok(buffer) = file_handler::read_file(kernel, fd, file_size) else {
            self.notify(kernel, FtpType::Error);
            file_handler::close_file(kernel, fd);
            return false;
        };
        self.notify(kernel, FtpType::Ok);
        let message = framed(
            FtpHeader {
                kind: FtpType::FileData,
                file_size: file_size as i32,
            },
            &buffer,
        );
        kernel.post_office.send(&mut self.conn, &message);
        if confirmation(kernel, &mut self.conn).is_none() {
            file_handler::close_file(kernel, fd);
            return false;
        }
        file_handler::close_file(kernel, fd);
        self.notify(kernel, FtpType::Ok);
        log::info!(target: "net", "[client] file \"{name}\" successfully transferred");
        true
    }

    /// Client half of READFILE: create the local file and fill it with
    /// the server's data, removing the partial file on failure.
    fn receive_file(&mut self, kernel: &Arc<Kernel>, name: &str, file_size: usize) -> bool {
        if file_handler::create_file(kernel, name).is_err() {
            self.notify(kernel, FtpType::Error);
            return false;
        }
        let Ok(fd) = file_handler::open_file(kernel, name) else {
            self.notify(kernel, FtpType::Error);
            return false;
        };
        self.notify(kernel, FtpType::Ok);
        let buffer = kernel.post_office.receive(&mut self.conn);
        let parsed = FtpHeader::parse(&buffer);
        let ok = matches!(
            parsed,
            Some(FtpHeader {
                kind: FtpType::FileData,
                file_size: got,
            }) if got as usize == file_size
        );
        if !ok || file_handler::write_file(kernel, fd, &buffer[FTP_HEADER_SIZE..]).is_err() {
            self.notify(kernel, FtpType::Error);
            file_handler::close_file(kernel, fd);
            file_handler::remove_file(kernel, name);
            return false;
        }
        self.notify(kernel, FtpType::Ok);
        if confirmation(kernel, &mut self.conn).is_none() {
            log::warn!(target: "net", "[client] server couldn't finish \"{name}\"");
            file_handler::close_file(kernel, fd);
            file_handler::remove_file(kernel, name);
            return false;
        }
        file_handler::close_file(kernel, fd);
        log::info!(target: "net", "[client] file \"{name}\" transferred successfully");
        true
    }

    fn notify(&mut self, kernel: &Arc<Kernel>, kind: FtpType) {
        let message = framed(FtpHeader { kind, file_size: 0 }, CLIENT_NOTE);
        kernel.post_office.send(&mut self.conn, &message);
    }

    /// Orderly goodbye: the server answers DISCONNECT before both
    /// sides drain their boxes.
    pub fn disconnect(mut self, kernel: &Arc<Kernel>) {
        log::info!(
            target: "net",
            "[client {}] disconnecting from server",
            kernel.post_office.net_addr()
        );
        let message = framed(
            FtpHeader {
                kind: FtpType::Disconnect,
                file_size: 0,
            },
            CLIENT_REQUEST,
        );
        kernel.post_office.send(&mut self.conn, &message);
        let answer = kernel.post_office.receive(&mut self.conn);
        if FtpHeader::parse(&answer).map(|h| h.kind) != Some(FtpType::Disconnect) {
            log::warn!(target: "net", "[client] server did not confirm the disconnect");
        }
        kernel.post_office.disconnect(self.conn);
    }
}

/// One-shot client action: connect, transfer `name` in the requested
/// direction, disconnect. This is what the Sendfile and Receivefile
/// syscalls run.
pub fn client_action(kernel: &Arc<Kernel>, server_addr: i32, kind: FtpType, name: &str) -> bool {
    let Ok(mut client) = Client::connect(kernel, server_addr) else {
        return false;
    };
    let outcome = client.send_file_request(kernel, kind, name);
    client.disconnect(kernel);
    outcome
}
