mod common;

use common::{deliver_all, make_node, manual_time, Node};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use veil_core::protocol::{MIN_BPM_PER_PEER, MessageKind};
use veil_core::transport::MemoryHub;

fn connect(a: &Node, b: &Node, hub: &Arc<MemoryHub>) {
    a.core.trust_hello(b.hello.clone()).unwrap();
    a.core.connect_to_peer(&b.id).unwrap();
    deliver_all(hub, &[a, b]);
    assert!(a.core.is_connected(&b.id));
    assert!(b.core.is_connected(&a.id));
}

#[test]
fn oversized_message_fragments_and_reassembles() {
    let hub = MemoryHub::new();
    let time = manual_time();
    let a = make_node(&hub, 1, 0xAA, 1200, time.clone(), false);
    let b = make_node(&hub, 2, 0xBB, 1200, time.clone(), false);
    connect(&a, &b, &hub);

    // Let one allocation round raise A's advertised limit so B's
    // token bucket refills at a useful rate.
    a.core.tick();
    time.advance(Duration::from_secs(80));
    a.core.tick();
    deliver_all(&hub, &[&a, &b]);

    let received = Arc::new(Mutex::new(Vec::new()));
    let sink = received.clone();
    a.core.register_handler(
        MessageKind(40),
        Arc::new(move |_, body| {
            sink.lock().unwrap().push(body.to_vec());
            Ok(())
        }),
    );

    let payload: Vec<u8> = (0..3000u32).map(|i| (i % 253) as u8).collect();
    b.core
        .unicast(&a.id, MessageKind(40), &payload, 2000, Duration::from_secs(120))
        .unwrap();

    for _ in 0..60 {
        time.advance(Duration::from_secs(1));
        b.core.tick();
        a.core.tick();
        deliver_all(&hub, &[&a, &b]);
        if !received.lock().unwrap().is_empty() {
            break;
        }
    }

    let got = received.lock().unwrap();
    assert_eq!(got.len(), 1, "message not reassembled");
    assert_eq!(got[0], payload);
}

#[test]
fn broadcast_reaches_every_up_peer() {
    let hub = MemoryHub::new();
    let time = manual_time();
    let a = make_node(&hub, 1, 0xAA, 0, time.clone(), false);
    let b = make_node(&hub, 2, 0xBB, 0, time.clone(), false);
    let c = make_node(&hub, 3, 0xCC, 0, time.clone(), false);
    connect(&a, &b, &hub);
    connect(&a, &c, &hub);

    let hits = Arc::new(Mutex::new(0usize));
    for node in [&b, &c] {
        let counter = hits.clone();
        node.core.register_handler(
            MessageKind(44),
            Arc::new(move |_, _| {
                *counter.lock().unwrap() += 1;
                Ok(())
            }),
        );
    }

    let queued = a.core.broadcast(MessageKind(44), &[7; 16], 800, Duration::ZERO);
    assert_eq!(queued, 2);
    a.core.tick();
    deliver_all(&hub, &[&a, &b, &c]);
    assert_eq!(*hits.lock().unwrap(), 2);
}

#[test]
fn bandwidth_and_preference_accessors() {
    let hub = MemoryHub::new();
    let time = manual_time();
    let a = make_node(&hub, 1, 0xAA, 0, time.clone(), false);
    let b = make_node(&hub, 2, 0xBB, 0, time.clone(), false);

    assert!(a.core.get_bandwidth_assigned_to(&b.id).is_none());
    connect(&a, &b, &hub);

    let (bpm, _seen) = a.core.get_bandwidth_assigned_to(&b.id).unwrap();
    assert!(bpm >= MIN_BPM_PER_PEER);

    a.core.update_traffic_preference(&b.id, 5.0);
    let mut count = 0;
    a.core.for_each_connected_node(|peer| {
        assert_eq!(*peer, b.id);
        count += 1;
    });
    assert_eq!(count, 1);
}

#[test]
fn queue_overflow_rejects_new_messages() {
    let hub = MemoryHub::new();
    let time = manual_time();
    let a = make_node(&hub, 1, 0xAA, 0, time.clone(), false);
    let b = make_node(&hub, 2, 0xBB, 0, time.clone(), false);
    connect(&a, &b, &hub);

    // Fill the per-peer backlog without ever flushing.
    let chunk = vec![0u8; 1024];
    let mut refused = false;
    for _ in 0..64 {
        if b.core
            .unicast(&a.id, MessageKind(40), &chunk, 1, Duration::from_secs(300))
            .is_err()
        {
            refused = true;
            break;
        }
    }
    assert!(refused, "backlog never refused a message");
    assert!(b.core.stats().messages_dropped() > 0);
}
