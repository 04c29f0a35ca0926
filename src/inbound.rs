use crate::crypto;
use crate::entry::{BufferEntry, Status};
use crate::identity::PeerId;
use crate::protocol::{MAX_FRAME_AGE, PACKET_HEADER_LEN, PacketHeader};
use crate::stats::CoreStats;
use crate::transport::TransportSession;
use crossbeam_channel::{Receiver, Sender, TrySendError, bounded};
use std::time::Instant;
use tracing::{debug, warn};

/// Depth of the handoff queue between transport drivers and workers.
pub const QUEUE_LENGTH: usize = 16;
/// Size of the worker pool consuming the queue.
pub const THREAD_COUNT: usize = 2;

/// One inbound datagram as delivered by a transport driver.
pub struct Packet {
    pub sender: PeerId,
    pub session: Option<TransportSession>,
    pub bytes: Vec<u8>,
}

pub enum QueueItem {
    Packet(Packet),
    /// Drains the pool on shutdown; one sentinel per worker.
    Shutdown,
}

/// Bounded handoff FIFO; writes that would block drop the datagram.
pub struct InboundQueue {
    tx: Sender<QueueItem>,
    rx: Receiver<QueueItem>,
}

impl InboundQueue {
    pub fn new() -> Self {
        let (tx, rx) = bounded(QUEUE_LENGTH);
        Self { tx, rx }
    }

    /// Enqueues a datagram; false (and a stats bump) when full.
    pub fn offer(&self, packet: Packet, stats: &CoreStats) -> bool {
        match self.tx.try_send(QueueItem::Packet(packet)) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) | Err(TrySendError::Disconnected(_)) => {
                stats.add_inbound_dropped();
                false
            }
        }
    }

    pub fn receiver(&self) -> Receiver<QueueItem> {
        self.rx.clone()
    }

    /// Non-blocking pop, for embedders driving the core on one thread.
    pub fn try_next(&self) -> Option<QueueItem> {
        self.rx.try_recv().ok()
    }

    /// Wakes every worker with a shutdown sentinel.
    pub fn shutdown(&self, workers: usize) {
        for _ in 0..workers {
            let _ = self.tx.send(QueueItem::Shutdown);
        }
    }
}

impl Default for InboundQueue {
    fn default() -> Self {
        Self::new()
    }
}

/// Result of the header stage of the pipeline.
pub enum HeaderOutcome {
    /// Detectable plaintext frame; parts start after the header.
    Plaintext,
    /// Decrypted in place; parts start after the header.
    Decrypted,
    /// Dropped; if `rekey` the core should restart the key exchange.
    Dropped { rekey: bool },
}

/// Header, decryption, replay, timestamp and bandwidth-learn stages
/// of the inbound pipeline, operating on the frame in place under
/// the table lock.
///
/// The plaintext check is stateless and precedes any table access.
pub fn check_header(
    be: Option<&mut BufferEntry>,
    frame: &mut [u8],
    now: Instant,
    now_unix: u32,
    stats: &CoreStats,
) -> HeaderOutcome {
    if frame.len() <= PACKET_HEADER_LEN {
        debug!("frame shorter than header, dropping");
        return HeaderOutcome::Dropped { rekey: false };
    }
    if crypto::is_plaintext_frame(frame) {
        return HeaderOutcome::Plaintext;
    }
    stats.add_received(frame.len() as u64);

    let Some(be) = be else {
        // No session context at all; ask for a key exchange so the
        // peer stops sending us undecryptable traffic.
        return HeaderOutcome::Dropped { rekey: true };
    };
    if be.status == Status::Down || be.status == Status::KeySent || be.skey_remote.is_none() {
        debug!("{}: encrypted frame but no remote key yet", be.peer);
        return HeaderOutcome::Dropped { rekey: true };
    }

    let key = be.skey_remote.as_ref().expect("checked above");
    if crypto::open_frame(key, frame).is_err() {
        debug!("{}: frame failed MAC check, scheduling rekey", be.peer);
        return HeaderOutcome::Dropped { rekey: true };
    }
    stats.add_decrypted((frame.len() - crate::protocol::MAC_LEN) as u64);

    let header = PacketHeader::parse(frame).expect("length checked");
    if !be.check_sequence(header.sequence_number) {
        warn!(
            "{}: invalid sequence number {} <= {}, dropping frame",
            be.peer, header.sequence_number, be.last_seq_recv
        );
        stats.add_replay_rejected();
        return HeaderOutcome::Dropped { rekey: false };
    }
    if (header.time_stamp as u64) + MAX_FRAME_AGE.as_secs() < now_unix as u64 {
        debug!("{}: frame more than one day old, dropping", be.peer);
        return HeaderOutcome::Dropped { rekey: false };
    }

    // Learn the peer's advertised receive cap and clamp our credit.
    be.max_bpm = (header.bandwidth as u64).max(1);
    be.clamp_window(now, stats);
    be.recently_received += frame.len() as u64;
    be.last_alive = now;

    HeaderOutcome::Decrypted
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::SessionKey;
    use crate::protocol::MAC_LEN;
    use rand::SeedableRng;
    use rand::rngs::StdRng;

    fn sealed_frame(key: &SessionKey, seq: u32, stamp: u32, body: &[u8]) -> Vec<u8> {
        let mut frame = vec![0u8; PACKET_HEADER_LEN + body.len()];
        let header = PacketHeader {
            mac: [0u8; MAC_LEN],
            sequence_number: seq,
            time_stamp: stamp,
            bandwidth: 60_000,
        };
        header.write_to(&mut frame);
        frame[PACKET_HEADER_LEN..].copy_from_slice(body);
        crypto::seal_frame(key, &mut frame);
        frame
    }

    fn up_entry(key: &SessionKey) -> BufferEntry {
        let mut be = BufferEntry::new(PeerId::from_bytes([1; 64]), Instant::now());
        be.skey_remote = Some(key.clone());
        be.set_status(Status::Up, Instant::now());
        be
    }

    #[test]
    fn decrypts_and_learns_bandwidth() {
        let mut rng = StdRng::seed_from_u64(5);
        let key = SessionKey::random(&mut rng);
        let mut be = up_entry(&key);
        let stats = CoreStats::default();
        let mut frame = sealed_frame(&key, 1, 500_000, b"payload");
        let out = check_header(Some(&mut be), &mut frame, Instant::now(), 500_010, &stats);
        assert!(matches!(out, HeaderOutcome::Decrypted));
        assert_eq!(be.max_bpm, 60_000);
        assert_eq!(&frame[PACKET_HEADER_LEN..], b"payload");
        assert_eq!(be.last_seq_recv, 1);
    }

    #[test]
    fn replayed_sequence_is_dropped() {
        let mut rng = StdRng::seed_from_u64(5);
        let key = SessionKey::random(&mut rng);
        let mut be = up_entry(&key);
        let stats = CoreStats::default();
        let now = Instant::now();
        let mut frame = sealed_frame(&key, 5, 500_000, b"x");
        assert!(matches!(
            check_header(Some(&mut be), &mut frame, now, 500_010, &stats),
            HeaderOutcome::Decrypted
        ));
        let mut replay = sealed_frame(&key, 5, 500_000, b"x");
        assert!(matches!(
            check_header(Some(&mut be), &mut replay, now, 500_010, &stats),
            HeaderOutcome::Dropped { rekey: false }
        ));
        assert_eq!(stats.replays_rejected(), 1);
    }

    #[test]
    fn stale_timestamp_is_dropped() {
        let mut rng = StdRng::seed_from_u64(5);
        let key = SessionKey::random(&mut rng);
        let mut be = up_entry(&key);
        let stats = CoreStats::default();
        let day = MAX_FRAME_AGE.as_secs() as u32;
        let mut frame = sealed_frame(&key, 1, 100, b"x");
        assert!(matches!(
            check_header(Some(&mut be), &mut frame, Instant::now(), 200 + day, &stats),
            HeaderOutcome::Dropped { rekey: false }
        ));
    }

    #[test]
    fn wrong_key_triggers_rekey() {
        let mut rng = StdRng::seed_from_u64(5);
        let key = SessionKey::random(&mut rng);
        let other = SessionKey::random(&mut rng);
        let mut be = up_entry(&other);
        let stats = CoreStats::default();
        let mut frame = sealed_frame(&key, 1, 500_000, b"x");
        assert!(matches!(
            check_header(Some(&mut be), &mut frame, Instant::now(), 500_010, &stats),
            HeaderOutcome::Dropped { rekey: true }
        ));
    }

    #[test]
    fn queue_overflow_drops_newest() {
        let queue = InboundQueue::new();
        let stats = CoreStats::default();
        for _ in 0..QUEUE_LENGTH {
            assert!(queue.offer(
                Packet {
                    sender: PeerId::from_bytes([1; 64]),
                    session: None,
                    bytes: vec![0; 8],
                },
                &stats,
            ));
        }
        assert!(!queue.offer(
            Packet {
                sender: PeerId::from_bytes([1; 64]),
                session: None,
                bytes: vec![0; 8],
            },
            &stats,
        ));
        assert_eq!(stats.inbound_dropped(), 1);
    }
}
