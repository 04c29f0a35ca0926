mod common;

use common::{deliver_all, make_node, manual_time};
use std::sync::Arc;
use veil_core::TimeProvider;
use veil_core::hello::{Hello, MAX_HELLO_AGE};
use veil_core::identity::{Identity, NodeIdentity};

#[test]
fn forged_signature_never_enters_the_store() {
    let hub = veil_core::transport::MemoryHub::new();
    let time = manual_time();
    let a = make_node(&hub, 1, 0xAA, 1200, time.clone(), false);
    let b = make_node(&hub, 2, 0xBB, 1200, time, false);

    let mut forged = b.hello.clone();
    forged.signature[0] ^= 0xFF;

    assert!(a.core.trust_hello(forged.clone()).is_err());
    assert_eq!(a.core.known_host_count(), 0);

    // The network path must reject it too.
    a.core.learn_hello(&forged).unwrap();
    deliver_all(&hub, &[&a, &b]);
    assert_eq!(a.core.known_host_count(), 0);
}

#[test]
fn identity_must_hash_from_public_key() {
    let hub = veil_core::transport::MemoryHub::new();
    let time = manual_time();
    let a = make_node(&hub, 1, 0xAA, 1200, time.clone(), false);
    let b = make_node(&hub, 2, 0xBB, 1200, time.clone(), false);

    // Re-sign under a third identity so only the id/key pairing is
    // inconsistent.
    let mallory = NodeIdentity::new([0xCC; 32], time);
    let mut tampered = b.hello.clone();
    tampered.public_key = mallory.own_public_key();
    assert!(a.core.trust_hello(tampered).is_err());
    assert_eq!(a.core.known_host_count(), 0);
}

#[test]
fn expiration_bounds_are_enforced() {
    let hub = veil_core::transport::MemoryHub::new();
    let time = manual_time();
    let a = make_node(&hub, 1, 0xAA, 1200, time.clone(), false);
    let b = make_node(&hub, 2, 0xBB, 1200, time.clone(), false);

    let mut stale = b.hello.clone();
    stale.expiration = time.now_unix() - 10;
    assert!(a.core.trust_hello(stale).is_err());

    let mut too_far = b.hello.clone();
    too_far.expiration = time.now_unix() + MAX_HELLO_AGE.as_secs() as u32 + 3600;
    assert!(a.core.trust_hello(too_far).is_err());

    assert!(a.core.trust_hello(b.hello.clone()).is_ok());
    assert_eq!(a.core.known_host_count(), 1);
}

#[test]
fn network_hello_is_adopted_only_after_pong() {
    let hub = veil_core::transport::MemoryHub::new();
    let time = manual_time();
    let a = make_node(&hub, 1, 0xAA, 1200, time.clone(), false);
    let b = make_node(&hub, 2, 0xBB, 1200, time, false);

    // A hears about B from the network: a PING challenge goes out and
    // the store stays empty until the PONG returns.
    a.core.learn_hello(&b.hello).unwrap();
    assert_eq!(a.core.known_host_count(), 0);

    deliver_all(&hub, &[&a, &b]);
    assert_eq!(a.core.known_host_count(), 1);
}

#[test]
fn wire_roundtrip_preserves_every_field() {
    let time = manual_time();
    let identity = NodeIdentity::new([0x11; 32], time.clone());
    let hello = Hello::build(
        &identity,
        veil_core::protocol::TransportKind(3),
        1400,
        time.now_unix() + 600,
        vec![10, 0, 0, 1, 0x1F, 0x90],
    );
    let decoded = Hello::decode(&hello.encode()).unwrap();
    assert_eq!(decoded, hello);
    assert!(decoded.validate(&identity, time.now_unix()).is_ok());
}

#[test]
fn persisted_hosts_survive_restart() {
    let dir = tempfile::tempdir().unwrap();
    let hub = veil_core::transport::MemoryHub::new();
    let time = manual_time();
    let b = make_node(&hub, 2, 0xBB, 1200, time.clone(), false);

    let config = veil_core::Config {
        home: Some(dir.path().to_path_buf()),
        ..veil_core::Config::default()
    };
    let identity = Arc::new(NodeIdentity::new([0xAA; 32], time.clone()));
    let transport = Arc::new(veil_core::transport::MemoryTransport::new(
        hub.clone(),
        1,
        1200,
    ));
    let core = veil_core::Core::new(
        config.clone(),
        identity.clone(),
        time.clone(),
        vec![transport.clone()],
        1,
    );
    core.trust_hello(b.hello.clone()).unwrap();
    assert_eq!(core.known_host_count(), 1);
    drop(core);

    let reborn = veil_core::Core::new(config, identity, time, vec![transport], 1);
    assert_eq!(reborn.known_host_count(), 1);
}
