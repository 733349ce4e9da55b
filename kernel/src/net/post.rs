//! Post office: mailboxes and reliable segmented delivery
//!
//! Every message is split into `MAX_SEGMENT_SIZE` slices, each sent
//! stop-and-wait: the sender serializes the transmission, then sleeps
//! on its own mailbox's ack condition until the matching ack arrives or
//! the tempo timer wakes it for a retransmission. The postal worker
//! thread delivers arriving segments in `message_id` order, answers
//! every non-ack packet with an ack, and filters duplicate connection
//! requests by their timestamps.

use crate::config::net_layout::*;
use crate::machine::network::{Network, PacketHeader, Wire};
use crate::utils::BitMap;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageType {
    Ack,
    Data,
    Conn,
    Fin,
}

impl MessageType {
    fn from_i32(raw: i32) -> Self {
        match raw {
            0 => MessageType::Ack,
            1 => MessageType::Data,
            2 => MessageType::Conn,
            3 => MessageType::Fin,
            _ => panic!("corrupt message type {raw}"),
        }
    }

    fn as_i32(self) -> i32 {
        match self {
            MessageType::Ack => 0,
            MessageType::Data => 1,
            MessageType::Conn => 2,
            MessageType::Fin => 3,
        }
    }
}

/// Post-office header prepended to every packet body.
#[derive(Debug, Clone, Copy)]
pub struct MailHeader {
    pub to: i32,
    pub from: i32,
    pub length: u32,
    pub kind: MessageType,
    pub message_id: i32,
}

impl MailHeader {
    fn zeroed() -> Self {
        Self {
            to: 0,
            from: 0,
            length: 0,
            kind: MessageType::Data,
            message_id: 0,
        }
    }

    pub fn to_bytes(&self) -> [u8; MAIL_HEADER_SIZE] {
        let mut buf = [0u8; MAIL_HEADER_SIZE];
        buf[0..4].copy_from_slice(&self.to.to_le_bytes());
        buf[4..8].copy_from_slice(&self.from.to_le_bytes());
        buf[8..12].copy_from_slice(&self.length.to_le_bytes());
        buf[12..16].copy_from_slice(&self.kind.as_i32().to_le_bytes());
        buf[16..20].copy_from_slice(&self.message_id.to_le_bytes());
        buf
    }

    pub fn from_bytes(buf: &[u8]) -> Self {
        let word = |i: usize| i32::from_le_bytes(buf[i * 4..i * 4 + 4].try_into().unwrap());
        Self {
            to: word(0),
            from: word(1),
            length: word(2) as u32,
            kind: MessageType::from_i32(word(3)),
            message_id: word(4),
        }
    }
}

/// A message in flight: its size, its segmentation, and the packet and
/// mail headers stamped on every segment.
#[derive(Clone)]
pub struct Payload {
    pub msg_size: usize,
    pub nb_segments: usize,
    pub remainder: usize,
    pub pkt: PacketHeader,
    pub mail: MailHeader,
}

impl Payload {
    pub fn new() -> Self {
        Self {
            msg_size: 0,
            nb_segments: 0,
            remainder: 0,
            pkt: PacketHeader {
                to: 0,
                from: 0,
                length: 0,
            },
            mail: MailHeader::zeroed(),
        }
    }

    /// Re-point the payload; the message id is left alone so it keeps
    /// counting across messages on the same source box.
    pub fn update(
        &mut self,
        net_from: i32,
        net_to: i32,
        mail_from: i32,
        mail_to: i32,
        length: usize,
        kind: MessageType,
    ) {
        self.msg_size = length;
        // An exactly aligned message still carries a full final
        // segment, never an empty one.
        if length > 0 && length % MAX_SEGMENT_SIZE == 0 {
            self.remainder = MAX_SEGMENT_SIZE;
            self.nb_segments = length / MAX_SEGMENT_SIZE;
        } else {
            self.remainder = length % MAX_SEGMENT_SIZE;
            self.nb_segments = length / MAX_SEGMENT_SIZE + usize::from(length > 0);
        }
        self.pkt.from = net_from;
        self.pkt.to = net_to;
        self.pkt.length = (MAX_SEGMENT_SIZE + MAIL_HEADER_SIZE) as u32;
        self.mail.from = mail_from;
        self.mail.to = mail_to;
        self.mail.length = length as u32;
        self.mail.kind = kind;
    }

    /// Change only the message size, keeping both endpoints.
    pub fn update_size(&mut self, length: usize) {
        let (net_from, net_to) = (self.pkt.from, self.pkt.to);
        let (mail_from, mail_to) = (self.mail.from, self.mail.to);
        self.update(net_from, net_to, mail_from, mail_to, length, MessageType::Data);
    }
}

impl Default for Payload {
    fn default() -> Self {
        Self::new()
    }
}

/// One arrived segment, queued in its destination mailbox.
struct Mail {
    pkt: PacketHeader,
    mail: MailHeader,
    data: [u8; MAX_SEGMENT_SIZE],
}

struct BoxInner {
    queue: VecDeque<Mail>,
    /// Next in-order DATA message id this box will accept.
    waited_id: i32,
}

pub struct MailBox {
    inner: Mutex<BoxInner>,
    avail: Condvar,
    /// Last acknowledged message id, -1 before any ack arrives.
    ack_id: Mutex<i32>,
    ack_cond: Condvar,
}

impl MailBox {
    fn new() -> Self {
        Self {
            inner: Mutex::new(BoxInner {
                queue: VecDeque::new(),
                waited_id: 0,
            }),
            avail: Condvar::new(),
            ack_id: Mutex::new(-1),
            ack_cond: Condvar::new(),
        }
    }

    fn put(&self, mail: Mail) {
        let mut inner = self.inner.lock().unwrap();
        inner.queue.push_back(mail);
        self.avail.notify_one();
    }

    /// Accept a DATA segment only when it carries the id this box is
    /// waiting for; advancing the expectation and queueing are atomic.
    fn put_if_waited(&self, mail: Mail) -> bool {
        let mut inner = self.inner.lock().unwrap();
        if mail.mail.message_id != inner.waited_id {
            return false;
        }
        inner.waited_id += 1;
        inner.queue.push_back(mail);
        self.avail.notify_one();
        true
    }

    /// Wait for the next segment; refresh `payload` from its headers
    /// and append its bytes (a full slice, or the remainder for the
    /// final segment) to `out`.
    fn get(&self, payload: &mut Payload, segment_index: usize, out: &mut Vec<u8>) {
        let mut inner = self.inner.lock().unwrap();
        let mail = loop {
            match inner.queue.pop_front() {
                Some(mail) => break mail,
                None => inner = self.avail.wait(inner).unwrap(),
            }
        };
        drop(inner);

        let message_id = mail.mail.message_id;
        payload.update(
            mail.pkt.from,
            mail.pkt.to,
            mail.mail.from,
            mail.mail.to,
            mail.mail.length as usize,
            mail.mail.kind,
        );
        payload.mail.message_id = message_id;
        let take = if segment_index == payload.nb_segments - 1 {
            payload.remainder
        } else {
            MAX_SEGMENT_SIZE
        };
        out.extend_from_slice(&mail.data[..take]);
    }

    fn set_waited(&self, id: i32) {
        self.inner.lock().unwrap().waited_id = id;
    }

    fn drain(&self) {
        self.inner.lock().unwrap().queue.clear();
    }

    fn remove_no_waiting(&self) -> bool {
        self.inner.lock().unwrap().queue.pop_front().is_some()
    }
}

/// Key of an accepted connection request, kept to drop retransmitted
/// CONNs the server already answered.
#[derive(Clone, Copy)]
pub struct ConnReminder {
    pub net_from: i32,
    pub net_to: i32,
    pub mail_from: i32,
    pub mail_to: i32,
    pub timestamp: i64,
}

pub struct PostOffice {
    net_addr: i32,
    num_boxes: usize,
    boxes: Vec<MailBox>,
    used_boxes: Mutex<BitMap>,
    send_lock: Mutex<()>,
    network: Network,
    connections: Mutex<Vec<ConnReminder>>,
    disconnect_lock: Mutex<()>,
    disconnect_cond: Condvar,
    stopping: AtomicBool,
}

impl PostOffice {
    /// Bring up the post office: attach to the wire, start the postal
    /// worker that sorts arriving packets into mailboxes, and start the
    /// tempo timer that unsticks stalled senders.
    pub fn new(net_addr: i32, reliability: f64, n_boxes: usize, wire: Arc<Wire>) -> Arc<Self> {
        let mut used_boxes = BitMap::new(n_boxes);
        used_boxes.mark(LISTEN_BOX);
        let office = Arc::new(Self {
            net_addr,
            num_boxes: n_boxes,
            boxes: (0..n_boxes).map(|_| MailBox::new()).collect(),
            used_boxes: Mutex::new(used_boxes),
            send_lock: Mutex::new(()),
            network: Network::new(net_addr, reliability, wire),
            connections: Mutex::new(Vec::new()),
            disconnect_lock: Mutex::new(()),
            disconnect_cond: Condvar::new(),
            stopping: AtomicBool::new(false),
        });

        let worker = office.clone();
        std::thread::spawn(move || worker.postal_delivery());

        let timer = office.clone();
        std::thread::spawn(move || {
            let ticks_per_disconnect =
                (DISCONNECT_TEMPO.as_millis() / TEMPO.as_millis()).max(1) as u32;
            let mut tick = 0u32;
            while !timer.stopping.load(Ordering::Acquire) {
                std::thread::sleep(TEMPO);
                timer.broadcast_boxes();
                tick += 1;
                if tick % ticks_per_disconnect == 0 {
                    let _g = timer.disconnect_lock.lock().unwrap();
                    timer.disconnect_cond.notify_all();
                }
            }
        });

        office
    }

    pub fn net_addr(&self) -> i32 {
        self.net_addr
    }

    pub fn num_boxes(&self) -> usize {
        self.num_boxes
    }

    /// Claim a free mailbox. The listen box is never handed out.
    pub fn alloc_box(&self) -> Option<usize> {
        self.used_boxes.lock().unwrap().find()
    }

    /// Wake every sender sleeping on an ack condition; the tempo timer
    /// calls this so a lost ack only ever delays, never wedges.
    pub fn broadcast_boxes(&self) {
        for mailbox in &self.boxes {
            let _ack = mailbox.ack_id.lock().unwrap();
            mailbox.ack_cond.notify_all();
        }
    }

    /// Stop the worker and timer threads and detach from the wire.
    pub fn stop(&self) {
        self.stopping.store(true, Ordering::Release);
        self.network.stop();
    }

    /// Send one segment and wait for its ack, retransmitting up to
    /// `MAX_REEMISSIONS` times. The ack lock is taken before the send
    /// lock, always in that order.
    fn reliable_send_segment(&self, payload: &Payload, body: &[u8]) -> bool {
        let sent_id = payload.mail.message_id;
        let mailbox = &self.boxes[payload.mail.from as usize];
        for n_reemissions in 0..MAX_REEMISSIONS {
            let mut ack = mailbox.ack_id.lock().unwrap();
            {
                let _send = self.send_lock.lock().unwrap();
                self.network.send(payload.pkt, body);
                self.network.wait_sent();
            }
            log::trace!(
                target: "net",
                "[machine {}] emission {n_reemissions} of message {sent_id} to ({}, {})",
                self.net_addr, payload.pkt.to, payload.mail.to
            );

            ack = mailbox.ack_cond.wait(ack).unwrap();
            let ack_id = *ack;
            drop(ack);

            if ack_id == sent_id {
                return true;
            }
            if ack_id != -1 {
                log::trace!(
                    target: "net",
                    "[machine {}] ignored ack {ack_id}, waiting for {sent_id}",
                    self.net_addr
                );
            }
        }
        false
    }

    /// Send a whole message as in-order segments; each must be acked
    /// before the next goes out. `false` once a segment exhausts its
    /// retransmissions; the receiver may then hold a prefix of the
    /// message.
    pub fn send_payload(&self, payload: &mut Payload, data: &[u8]) -> bool {
        assert!(payload.mail.to >= 0 && (payload.mail.to as usize) < self.num_boxes);
        assert_eq!(payload.pkt.from, self.net_addr);
        assert_eq!(data.len(), payload.msg_size);

        for segment in 0..payload.nb_segments {
            let start = segment * MAX_SEGMENT_SIZE;
            let take = if segment == payload.nb_segments - 1 {
                payload.remainder
            } else {
                MAX_SEGMENT_SIZE
            };
            let mut body = [0u8; MAX_PACKET_SIZE];
            body[..MAIL_HEADER_SIZE].copy_from_slice(&payload.mail.to_bytes());
            body[MAIL_HEADER_SIZE..MAIL_HEADER_SIZE + take]
                .copy_from_slice(&data[start..start + take]);
            if !self.reliable_send_segment(payload, &body) {
                log::debug!(
                    target: "net",
                    "[machine {}] gave up on segment {segment} after {MAX_REEMISSIONS} tries",
                    self.net_addr
                );
                return false;
            }
            payload.mail.message_id += 1;
        }
        true
    }

    /// Reassemble one message from `box_no`, blocking for each segment.
    pub fn receive_payload(&self, payload: &mut Payload, box_no: usize) -> Vec<u8> {
        assert!(box_no < self.num_boxes);
        let mut data = Vec::new();
        self.boxes[box_no].get(payload, 0, &mut data);
        for segment in 1..payload.nb_segments {
            self.boxes[box_no].get(payload, segment, &mut data);
        }
        data
    }

    /// Tear down the receive side of a connection: drop queued mail
    /// from `box_no`, sit out a disconnect tempo so straggling
    /// retransmits arrive and are dropped too, then recycle the box.
    /// `incoming` names the peer whose remembered CONNs are forgotten.
    pub fn disconnect_payload(&self, box_no: usize, incoming: &Payload) {
        log::debug!(target: "net", "[machine {}] start disconnect of box {box_no}", self.net_addr);
        self.boxes[box_no].drain();
        {
            let mut g = self.disconnect_lock.lock().unwrap();
            g = self.disconnect_cond.wait(g).unwrap();
            loop {
                g = self.disconnect_cond.wait(g).unwrap();
                if !self.boxes[box_no].remove_no_waiting() {
                    break;
                }
                self.boxes[box_no].drain();
            }
        }
        self.boxes[box_no].set_waited(0);
        // A recycled box restarts its message ids at 0; a stale ack id
        // from the previous tenant must not satisfy the next sender.
        *self.boxes[box_no].ack_id.lock().unwrap() = -1;
        self.used_boxes.lock().unwrap().clear(box_no);
        self.prune_connections(incoming.pkt.from, incoming.mail.from);
        log::debug!(target: "net", "[machine {}] end disconnect", self.net_addr);
    }

    /// A CONN is valid unless an accepted one already covers the same
    /// endpoints with an equal or newer timestamp.
    fn valid_conn(&self, conn: ConnReminder) -> bool {
        let mut connections = self.connections.lock().unwrap();
        let duplicate = connections.iter().any(|c| {
            c.net_from == conn.net_from
                && c.net_to == conn.net_to
                && c.mail_from == conn.mail_from
                && c.mail_to == conn.mail_to
                && c.timestamp >= conn.timestamp
        });
        if duplicate {
            log::debug!(
                target: "net",
                "[machine {}] duplicate CONN from ({}, {})",
                self.net_addr, conn.net_from, conn.mail_from
            );
            false
        } else {
            connections.push(conn);
            true
        }
    }

    /// Forget accepted CONNs from a peer that has disconnected, so it
    /// can connect again later.
    fn prune_connections(&self, peer_machine: i32, peer_box: i32) {
        self.connections
            .lock()
            .unwrap()
            .retain(|c| !(c.net_from == peer_machine && c.mail_from == peer_box));
    }

    /// Postal worker: pull packets off the network forever, sort them
    /// into mailboxes, and ack everything that is not itself an ack.
    fn postal_delivery(self: Arc<Self>) {
        while let Some((pkt_hdr, buffer)) = self.network.receive() {
            let mail_hdr = MailHeader::from_bytes(&buffer[..MAIL_HEADER_SIZE]);
            assert!(
                mail_hdr.to >= 0 && (mail_hdr.to as usize) < self.num_boxes,
                "arriving mail addressed outside this post office"
            );
            let mut data = [0u8; MAX_SEGMENT_SIZE];
            let body = &buffer[MAIL_HEADER_SIZE..];
            data[..body.len().min(MAX_SEGMENT_SIZE)]
                .copy_from_slice(&body[..body.len().min(MAX_SEGMENT_SIZE)]);
            let mail = Mail {
                pkt: pkt_hdr,
                mail: mail_hdr,
                data,
            };
            let to = mail_hdr.to as usize;

            match mail_hdr.kind {
                MessageType::Conn if to == LISTEN_BOX => {
                    let timestamp = i64::from_le_bytes(
                        buffer[MAIL_HEADER_SIZE..MAIL_HEADER_SIZE + 8].try_into().unwrap(),
                    );
                    let reminder = ConnReminder {
                        net_from: pkt_hdr.from,
                        net_to: pkt_hdr.to,
                        mail_from: mail_hdr.from,
                        mail_to: mail_hdr.to,
                        timestamp,
                    };
                    if self.valid_conn(reminder) {
                        log::debug!(
                            target: "net",
                            "[machine {}] CONN accepted from machine {}",
                            self.net_addr, pkt_hdr.from
                        );
                        self.boxes[to].put(mail);
                    }
                }
                MessageType::Data => {
                    if self.boxes[to].put_if_waited(mail) {
                        log::trace!(
                            target: "net",
                            "[machine {}] DATA {} delivered to box {to}",
                            self.net_addr, mail_hdr.message_id
                        );
                    } else {
                        log::trace!(
                            target: "net",
                            "[machine {}] DATA {} out of order for box {to}, dropped",
                            self.net_addr, mail_hdr.message_id
                        );
                    }
                }
                MessageType::Ack => {
                    let mut ack = self.boxes[to].ack_id.lock().unwrap();
                    *ack = mail_hdr.message_id;
                    self.boxes[to].ack_cond.notify_all();
                    drop(ack);
                }
                _ => {
                    log::trace!(
                        target: "net",
                        "[machine {}] dropped stray {:?} for box {to}",
                        self.net_addr, mail_hdr.kind
                    );
                }
            }

            // Everything but an ack is answered with an ack bearing the
            // same message id, duplicates included, so a sender whose
            // ack was lost still advances.
            if mail_hdr.kind != MessageType::Ack {
                let ack_pkt = PacketHeader {
                    from: pkt_hdr.to,
                    to: pkt_hdr.from,
                    length: MAIL_HEADER_SIZE as u32,
                };
                let ack_mail = MailHeader {
                    from: mail_hdr.to,
                    to: mail_hdr.from,
                    length: 0,
                    kind: MessageType::Ack,
                    message_id: mail_hdr.message_id,
                };
                let _send = self.send_lock.lock().unwrap();
                self.network.send(ack_pkt, &ack_mail.to_bytes());
                self.network.wait_sent();
            }
        }
    }

    pub(super) fn set_waited(&self, box_no: usize, id: i32) {
        self.boxes[box_no].set_waited(id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn segmentation_arithmetic() {
        let mut p = Payload::new();
        p.update(0, 1, 1, 2, 100, MessageType::Data);
        assert_eq!(p.nb_segments, 100 / MAX_SEGMENT_SIZE + 1);
        assert_eq!(p.remainder, 100 % MAX_SEGMENT_SIZE);

        p.update(0, 1, 1, 2, MAX_SEGMENT_SIZE * 3, MessageType::Data);
        assert_eq!(p.nb_segments, 3);
        assert_eq!(p.remainder, MAX_SEGMENT_SIZE);

        p.update(0, 1, 1, 2, 0, MessageType::Data);
        assert_eq!(p.nb_segments, 0);
    }

    #[test]
    fn mail_header_round_trip() {
        let hdr = MailHeader {
            to: 3,
            from: 7,
            length: 44,
            kind: MessageType::Conn,
            message_id: 12,
        };
        let back = MailHeader::from_bytes(&hdr.to_bytes());
        assert_eq!(back.to, 3);
        assert_eq!(back.from, 7);
        assert_eq!(back.length, 44);
        assert_eq!(back.kind, MessageType::Conn);
        assert_eq!(back.message_id, 12);
    }

    #[test]
    fn update_preserves_message_id() {
        let mut p = Payload::new();
        p.mail.message_id = 5;
        p.update(0, 1, 1, 2, 10, MessageType::Data);
        assert_eq!(p.mail.message_id, 5);
        p.update_size(20);
        assert_eq!(p.mail.message_id, 5);
        assert_eq!(p.pkt.to, 1);
        assert_eq!(p.mail.to, 2);
    }
}
