mod common;

use common::{deliver_all, make_node, manual_time};
use std::time::Duration;
use veil_core::transport::MemoryHub;

#[test]
fn keepalives_hold_an_idle_session_open() {
    let hub = MemoryHub::new();
    let time = manual_time();
    let a = make_node(&hub, 1, 0xAA, 0, time.clone(), false);
    let b = make_node(&hub, 2, 0xBB, 0, time.clone(), false);

    a.core.trust_hello(b.hello.clone()).unwrap();
    a.core.connect_to_peer(&b.id).unwrap();
    deliver_all(&hub, &[&a, &b]);
    assert!(a.core.is_connected(&b.id));

    // Ten idle minutes, twice the inactivity timeout: the periodic
    // pings must keep both sides alive.
    for _ in 0..10 {
        time.advance(Duration::from_secs(60));
        a.core.tick();
        b.core.tick();
        deliver_all(&hub, &[&a, &b]);
    }
    assert!(a.core.is_connected(&b.id));
    assert!(b.core.is_connected(&a.id));
}

#[test]
fn unreachable_peer_times_out() {
    let hub = MemoryHub::new();
    let time = manual_time();
    let a = make_node(&hub, 1, 0xAA, 0, time.clone(), false);
    let b = make_node(&hub, 2, 0xBB, 0, time.clone(), false);

    a.core.trust_hello(b.hello.clone()).unwrap();
    a.core.connect_to_peer(&b.id).unwrap();
    deliver_all(&hub, &[&a, &b]);
    assert!(a.core.is_connected(&b.id));

    // B goes dark: nothing is delivered any more.
    time.advance(Duration::from_secs(301));
    a.core.tick();
    assert!(!a.core.is_connected(&b.id));
}

#[test]
fn stalled_handshake_times_out() {
    let hub = MemoryHub::new();
    let time = manual_time();
    let a = make_node(&hub, 1, 0xAA, 0, time.clone(), false);
    let b = make_node(&hub, 2, 0xBB, 0, time.clone(), false);

    a.core.trust_hello(b.hello.clone()).unwrap();
    a.core.connect_to_peer(&b.id).unwrap();
    // The SETKEY is never answered; the row must fall back to DOWN
    // after the handshake timeout.
    time.advance(Duration::from_secs(151));
    a.core.tick();
    assert!(!a.core.is_connected(&b.id));

    // A retry from scratch still works once B answers again.
    a.core.connect_to_peer(&b.id).unwrap();
    deliver_all(&hub, &[&a, &b]);
    assert!(a.core.is_connected(&b.id));
}
