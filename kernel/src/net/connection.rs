//! Connections
//!
//! A connection is a pair of payloads: `p_out` aimed at the peer's
//! private box, `p_in` tracking what last arrived on ours. The
//! handshake rides on the well-known listen box: the caller sends a
//! CONN stamped with its clock, the listener answers `"C"` from a
//! fresh private box, and retransmitted CONNs the listener already
//! accepted are dropped by the duplicate filter.

use super::post::{MessageType, Payload, PostOffice};
use crate::config::net_layout::LISTEN_BOX;
use std::time::{SystemTime, UNIX_EPOCH};

pub struct Connection {
    pub p_in: Payload,
    pub p_out: Payload,
}

impl PostOffice {
    /// Open a connection to machine `addr`. `None` when the box table
    /// is exhausted or when asked to connect to ourselves.
    pub fn connect(&self, addr: i32) -> Option<Connection> {
        log::debug!(target: "net", "[machine {}] start connect to {addr}", self.net_addr());
        if addr == self.net_addr() {
            log::warn!(target: "net", "a machine cannot connect to itself");
            return None;
        }
        let box_no = self.alloc_box()?;
        let mut conn = Connection {
            p_in: Payload::new(),
            p_out: Payload::new(),
        };
        self.set_waited(box_no, 0);

        let timestamp = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_nanos() as i64;
        conn.p_out.update(
            self.net_addr(),
            addr,
            box_no as i32,
            LISTEN_BOX as i32,
            std::mem::size_of::<i64>(),
            MessageType::Conn,
        );
        self.send_payload(&mut conn.p_out, &timestamp.to_le_bytes());

        let answer = self.receive_payload(&mut conn.p_in, box_no);
        assert_eq!(answer.first(), Some(&b'C'), "malformed connection accept");
        conn.p_out.update(
            self.net_addr(),
            addr,
            box_no as i32,
            conn.p_in.mail.from,
            0,
            MessageType::Data,
        );
        log::debug!(target: "net", "[machine {}] end connect to {addr}", self.net_addr());
        Some(conn)
    }

    /// Wait for a connection request and accept it from a fresh
    /// private box. `None` when the box table is exhausted.
    pub fn listen(&self) -> Option<Connection> {
        let box_no = self.alloc_box()?;
        let mut conn = Connection {
            p_in: Payload::new(),
            p_out: Payload::new(),
        };
        // The peer's CONN consumed id 0 of its box counter, so its
        // first data message will carry id 1.
        self.set_waited(box_no, 1);

        self.receive_payload(&mut conn.p_in, LISTEN_BOX);
        assert_eq!(
            conn.p_in.mail.kind,
            MessageType::Conn,
            "non-CONN mail in the listen box"
        );
        conn.p_out.update(
            self.net_addr(),
            conn.p_in.pkt.from,
            box_no as i32,
            conn.p_in.mail.from,
            2,
            MessageType::Data,
        );
        self.send_payload(&mut conn.p_out, b"C\0");
        Some(conn)
    }

    /// Send `data` as one message over the connection.
    pub fn send(&self, conn: &mut Connection, data: &[u8]) -> bool {
        conn.p_out.update_size(data.len());
        self.send_payload(&mut conn.p_out, data)
    }

    /// Receive one whole message from the connection's private box.
    pub fn receive(&self, conn: &mut Connection) -> Vec<u8> {
        let box_no = conn.p_out.mail.from as usize;
        self.receive_payload(&mut conn.p_in, box_no)
    }

    /// Drain and recycle the connection's receive box.
    pub fn disconnect(&self, conn: Connection) {
        let box_no = conn.p_out.mail.from as usize;
        self.disconnect_payload(box_no, &conn.p_in);
    }
}
