//! Simulated packet network
//!
//! Delivers or drops whole packets between machines on a wire; packets
//! are never corrupted or reordered on the wire itself, but any packet
//! can be dropped with probability `1 - reliability`. A process-global
//! switch routes between the machines of one simulation by network
//! address; tests can plug machines into a private switch instead.

use crate::config::net_layout::MAX_PACKET_SIZE;
use crate::sync::Semaphore;
use lazy_static::lazy_static;
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};

/// Network-layer header carried in front of every packet body.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PacketHeader {
    pub to: i32,
    pub from: i32,
    pub length: u32,
}

struct Port {
    inbound: Mutex<VecDeque<(PacketHeader, Vec<u8>)>>,
    message_available: Semaphore,
}

/// The wire connecting machines: a registry of ports by address.
pub struct Wire {
    ports: Mutex<HashMap<i32, Arc<Port>>>,
}

lazy_static! {
    static ref SWITCH: Arc<Wire> = Arc::new(Wire::new());
}

impl Wire {
    pub fn new() -> Self {
        Self {
            ports: Mutex::new(HashMap::new()),
        }
    }

    /// The process-wide wire shared by all machines of one simulation.
    pub fn global() -> Arc<Wire> {
        SWITCH.clone()
    }

    fn attach(&self, addr: i32) -> Arc<Port> {
        let port = Arc::new(Port {
            inbound: Mutex::new(VecDeque::new()),
            message_available: Semaphore::new(0),
        });
        let previous = self.ports.lock().unwrap().insert(addr, port.clone());
        assert!(
            previous.is_none(),
            "two machines attached at network address {addr}"
        );
        port
    }

    fn detach(&self, addr: i32) {
        self.ports.lock().unwrap().remove(&addr);
    }

    fn port(&self, addr: i32) -> Option<Arc<Port>> {
        self.ports.lock().unwrap().get(&addr).cloned()
    }
}

impl Default for Wire {
    fn default() -> Self {
        Self::new()
    }
}

/// Multiplicative congruential generator; the fixed seed keeps a lossy
/// run reproducible.
struct Lcg(u64);

impl Lcg {
    fn next_unit(&mut self) -> f64 {
        self.0 = self.0.wrapping_mul(6364136223846793005).wrapping_add(1442695040888963407);
        (self.0 >> 11) as f64 / (1u64 << 53) as f64
    }
}

pub struct Network {
    addr: i32,
    reliability: f64,
    wire: Arc<Wire>,
    port: Arc<Port>,
    rng: spin::Mutex<Lcg>,
    message_sent: Semaphore,
    stopped: std::sync::atomic::AtomicBool,
}

impl Network {
    /// Attach a machine to the wire at `addr`. `reliability` is the
    /// probability that any one packet is delivered.
    pub fn new(addr: i32, reliability: f64, wire: Arc<Wire>) -> Self {
        let port = wire.attach(addr);
        Self {
            addr,
            reliability,
            wire,
            port,
            rng: spin::Mutex::new(Lcg(0x9E3779B97F4A7C15 ^ addr as u64)),
            message_sent: Semaphore::new(0),
            stopped: std::sync::atomic::AtomicBool::new(false),
        }
    }

    pub fn addr(&self) -> i32 {
        self.addr
    }

    /// Put one packet on the wire. The packet may be dropped; either
    /// way the send completes and the send semaphore is posted.
    pub fn send(&self, hdr: PacketHeader, body: &[u8]) {
        assert!(body.len() <= MAX_PACKET_SIZE, "packet over MTU");
        assert_eq!(hdr.from, self.addr);
        let delivered = self.rng.lock().next_unit() < self.reliability;
        if delivered {
            if let Some(port) = self.wire.port(hdr.to) {
                port.inbound
                    .lock()
                    .unwrap()
                    .push_back((hdr, body.to_vec()));
                port.message_available.v();
            }
        } else {
            log::trace!(target: "net", "[machine {}] wire dropped a packet for {}", self.addr, hdr.to);
        }
        self.message_sent.v();
    }

    /// Block until the send of the previous packet has completed.
    pub fn wait_sent(&self) {
        self.message_sent.p();
    }

    /// Block until a packet arrives, then return it. Returns `None`
    /// once the network has been stopped and drained.
    pub fn receive(&self) -> Option<(PacketHeader, Vec<u8>)> {
        loop {
            self.port.message_available.p();
            if let Some(packet) = self.port.inbound.lock().unwrap().pop_front() {
                return Some(packet);
            }
            if self.stopped.load(std::sync::atomic::Ordering::Acquire) {
                return None;
            }
        }
    }

    /// Detach from the wire and wake any blocked receiver.
    pub fn stop(&self) {
        self.stopped
            .store(true, std::sync::atomic::Ordering::Release);
        self.wire.detach(self.addr);
        self.port.message_available.v();
    }
}

impl Drop for Network {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reliable_wire_delivers_in_order() {
        let wire = Arc::new(Wire::new());
        let a = Network::new(0, 1.0, wire.clone());
        let b = Network::new(1, 1.0, wire);
        for i in 0..10u8 {
            a.send(
                PacketHeader {
                    to: 1,
                    from: 0,
                    length: 1,
                },
                &[i],
            );
            a.wait_sent();
        }
        for i in 0..10u8 {
            let (hdr, body) = b.receive().unwrap();
            assert_eq!(hdr.from, 0);
            assert_eq!(body, vec![i]);
        }
    }

    #[test]
    fn dead_wire_drops_everything() {
        let wire = Arc::new(Wire::new());
        let a = Network::new(2, 0.0, wire.clone());
        let b = Network::new(3, 1.0, wire);
        a.send(
            PacketHeader {
                to: 3,
                from: 2,
                length: 0,
            },
            &[],
        );
        a.wait_sent();
        b.stop();
        assert!(b.receive().is_none());
    }
}
