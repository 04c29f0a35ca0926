#![allow(dead_code)]

use std::sync::Arc;
use std::time::Instant;
use veil_core::identity::{Identity, NodeIdentity};
use veil_core::transport::{MemoryHub, MemoryTransport, TransportSession};
use veil_core::{Config, Core, Hello, ManualTimeProvider, PeerId};

/// One simulated daemon wired to the in-memory hub.
pub struct Node {
    pub core: Core,
    pub id: PeerId,
    pub addr: u64,
    pub hello: Hello,
    pub mtu: u16,
}

static TRACING: std::sync::Once = std::sync::Once::new();

pub fn manual_time() -> Arc<ManualTimeProvider> {
    TRACING.call_once(|| {
        let _ = tracing_subscriber::fmt().with_test_writer().try_init();
    });
    Arc::new(ManualTimeProvider::new(Instant::now(), 1_700_000_000))
}

pub fn make_node(
    hub: &Arc<MemoryHub>,
    addr: u64,
    seed: u8,
    mtu: u16,
    time: Arc<ManualTimeProvider>,
    padding: bool,
) -> Node {
    let identity = Arc::new(NodeIdentity::new([seed; 32], time.clone()));
    let id = identity.own_id();
    let transport = Arc::new(MemoryTransport::new(hub.clone(), addr, mtu));
    let config = Config {
        experimental_padding: padding,
        ..Config::default()
    };
    let core = Core::new(config, identity, time, vec![transport], seed as u64);
    let hello = core
        .get_advertised_hellos(4096)
        .0
        .into_iter()
        .next()
        .expect("memory transport advertises");
    Node {
        core,
        id,
        addr,
        hello,
        mtu,
    }
}

/// Moves datagrams between the nodes until the hub runs dry, driving
/// each core's inbound pipeline synchronously. Returns how many
/// datagrams were delivered.
pub fn deliver_all(hub: &Arc<MemoryHub>, nodes: &[&Node]) -> usize {
    let mut delivered = 0;
    for _ in 0..1000 {
        let mut progressed = false;
        for node in nodes {
            while let Some((from, bytes)) = hub.poll(node.addr) {
                let sender = nodes
                    .iter()
                    .find(|n| n.addr == from)
                    .map(|n| n.id)
                    .expect("datagram from unknown node");
                let session = TransportSession {
                    kind: MemoryTransport::KIND,
                    id: from,
                    mtu: node.mtu,
                };
                node.core.offer_packet(sender, Some(session), bytes);
                progressed = true;
                delivered += 1;
            }
            node.core.drain_inbound();
        }
        if !progressed {
            break;
        }
    }
    delivered
}
