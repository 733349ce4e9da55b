//! Reliable messaging between two machines over a lossy wire

use minos::config::net_layout::*;
use minos::machine::network::Wire;
use minos::net::{MessageType, Payload, PostOffice};
use std::sync::Arc;

fn pair(reliability: f64, addr_a: i32, addr_b: i32) -> (Arc<PostOffice>, Arc<PostOffice>) {
    let _ = env_logger::builder().is_test(true).try_init();
    let wire = Arc::new(Wire::new());
    let a = PostOffice::new(addr_a, reliability, NUM_BOXES, wire.clone());
    let b = PostOffice::new(addr_b, reliability, NUM_BOXES, wire);
    (a, b)
}

#[test]
fn hundred_messages_in_order_at_seventy_percent() {
    let (a, b) = pair(0.7, 0, 1);

    let receiver = {
        let b = b.clone();
        std::thread::spawn(move || {
            let mut received = Vec::new();
            let mut p_in = Payload::new();
            for _ in 0..100 {
                received.push(b.receive_payload(&mut p_in, 2));
            }
            received
        })
    };

    let mut p_out = Payload::new();
    p_out.update(0, 1, 1, 2, 10, MessageType::Data);
    for i in 0..100u32 {
        let message = format!("msg{i:07}");
        assert_eq!(message.len(), 10);
        assert!(
            a.send_payload(&mut p_out, message.as_bytes()),
            "message {i} exhausted its retransmissions"
        );
        p_out.update_size(10);
    }

    let received = receiver.join().unwrap();
    for (i, message) in received.iter().enumerate() {
        assert_eq!(message, format!("msg{i:07}").as_bytes());
    }

    a.stop();
    b.stop();
}

#[test]
fn multi_segment_messages_reassemble() {
    let (a, b) = pair(1.0, 2, 3);

    let body: Vec<u8> = (0..5 * MAX_SEGMENT_SIZE as u32 + 7).map(|i| i as u8).collect();
    let expected = body.clone();
    let receiver = {
        let b = b.clone();
        std::thread::spawn(move || {
            let mut p_in = Payload::new();
            b.receive_payload(&mut p_in, 1)
        })
    };

    let mut p_out = Payload::new();
    p_out.update(2, 3, 3, 1, body.len(), MessageType::Data);
    assert!(a.send_payload(&mut p_out, &body));
    assert_eq!(receiver.join().unwrap(), expected);

    a.stop();
    b.stop();
}

#[test]
fn connect_listen_exchange_and_reconnect() {
    let (a, b) = pair(1.0, 4, 5);

    let server = {
        let b = b.clone();
        std::thread::spawn(move || {
            let mut conn = b.listen().expect("listen failed");
            let request = b.receive(&mut conn);
            assert_eq!(request, b"ping");
            assert!(b.send(&mut conn, b"pong"));
            b.disconnect(conn);
        })
    };

    let mut conn = a.connect(5).expect("connect failed");
    assert!(a.send(&mut conn, b"ping"));
    assert_eq!(a.receive(&mut conn), b"pong");
    a.disconnect(conn);
    server.join().unwrap();

    // After the disconnect drained both sides, the same pair can
    // connect again.
    let server = {
        let b = b.clone();
        std::thread::spawn(move || {
            let mut conn = b.listen().expect("second listen failed");
            assert_eq!(b.receive(&mut conn), b"again");
            b.disconnect(conn);
        })
    };
    let mut conn = a.connect(5).expect("reconnect failed");
    assert!(a.send(&mut conn, b"again"));
    a.disconnect(conn);
    server.join().unwrap();

    a.stop();
    b.stop();
}

#[test]
fn self_connect_is_refused() {
    let (a, b) = pair(1.0, 6, 7);
    assert!(a.connect(6).is_none());
    a.stop();
    b.stop();
}
